use anyhow::{Context, Result};
use std::time::Duration;
use tracing::{debug, warn};

use crate::{
    chat::ChatMessage,
    ontology::OntologyData,
    sync::{SyncBatch, SyncCursor},
};

/// Messages kept from the initial load for display.
pub const HISTORY_LEN: usize = 10;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Thin HTTP client for the dashboard API.
#[derive(Clone, Debug)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .connect_timeout(Duration::from_secs(5))
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api{}", self.base_url, path)
    }

    pub async fn ontology(&self) -> Result<OntologyData> {
        self.http
            .get(self.url("/ontology"))
            .send()
            .await?
            .error_for_status()
            .context("Failed to fetch ontology")?
            .json()
            .await
            .context("Failed to decode ontology")
    }

    pub async fn messages(&self) -> Result<SyncBatch> {
        self.http
            .get(self.url("/messages"))
            .send()
            .await?
            .error_for_status()
            .context("Failed to fetch messages")?
            .json()
            .await
            .context("Failed to decode messages")
    }

    pub async fn send_message(&self, sender: &str, message: &str) -> Result<()> {
        self.http
            .post(self.url("/chat"))
            .json(&serde_json::json!({ "sender": sender, "message": message }))
            .send()
            .await?
            .error_for_status()
            .context("Failed to send message")?;
        Ok(())
    }

    pub async fn responses(&self, last_seen: i64, exclude: Option<&str>) -> Result<SyncBatch> {
        let mut req = self
            .http
            .get(self.url("/responses"))
            .query(&[("last", last_seen.to_string())]);
        if let Some(exclude) = exclude {
            req = req.query(&[("exclude", exclude)]);
        }

        req.send()
            .await?
            .error_for_status()
            .context("Failed to poll responses")?
            .json()
            .await
            .context("Failed to decode responses")
    }
}

/// Polls `/api/responses` on a fixed interval, resuming from the last
/// `serverTime` it was given.
pub struct ChatPoller {
    client: ApiClient,
    cursor: SyncCursor,
    exclude: Option<String>,
    interval: Duration,
}

impl ChatPoller {
    /// Load the log, keep the most recent [`HISTORY_LEN`] messages and
    /// checkpoint at the returned server time.
    pub async fn connect(
        client: ApiClient,
        exclude: Option<String>,
    ) -> Result<(Self, Vec<ChatMessage>)> {
        let snapshot = client.messages().await?;
        let cursor = SyncCursor::new(snapshot.server_time);

        let mut history = snapshot.messages;
        let keep_from = history.len().saturating_sub(HISTORY_LEN);
        history.drain(..keep_from);

        debug!("Poller connected at checkpoint {}", cursor.last_seen());

        Ok((
            Self {
                client,
                cursor,
                exclude,
                interval: DEFAULT_POLL_INTERVAL,
            },
            history,
        ))
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn last_seen(&self) -> i64 {
        self.cursor.last_seen()
    }

    /// One poll. On error the checkpoint is left where it was.
    pub async fn poll_once(&mut self) -> Result<Vec<ChatMessage>> {
        let batch = self
            .client
            .responses(self.cursor.last_seen(), self.exclude.as_deref())
            .await?;
        Ok(self.cursor.advance(batch))
    }

    /// Poll forever, handing each new message to `on_message`. Failures are
    /// logged and retried on the next tick.
    pub async fn run(mut self, mut on_message: impl FnMut(ChatMessage)) -> Result<()> {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            match self.poll_once().await {
                Ok(messages) => messages.into_iter().for_each(&mut on_message),
                Err(e) => warn!("Poll error: {:#}", e),
            }
        }
    }
}
