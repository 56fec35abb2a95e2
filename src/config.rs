use anyhow::{Context, Result};
use std::{env, path::PathBuf};

use crate::chat::{ASSISTANT, GUEST};

pub const DEFAULT_PORT: u16 = 3001;

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub messages_file: PathBuf,
    pub ontology_file: PathBuf,
    /// Sender left out of `/api/responses` unless the request says otherwise.
    pub exclude_sender: String,
    /// Keep messages in memory only.
    pub ephemeral: bool,
    /// Server polled by `jarvis tail`.
    pub server_url: String,
    /// Sender `jarvis tail` leaves out. `None` defers to the server default.
    pub tail_exclude: Option<String>,
}

impl Config {
    /// Build the config from the process environment (after `.env` is loaded).
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let port = match var("PORT") {
            Some(port) => port
                .trim()
                .parse()
                .with_context(|| format!("Invalid PORT value: {:?}", port))?,
            None => DEFAULT_PORT,
        };

        let data_dir = PathBuf::from(var("JARVIS_DATA_DIR").unwrap_or_else(|| "data".into()));
        let messages_file = var("JARVIS_MESSAGES_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("messages.json"));
        let ontology_file = var("JARVIS_ONTOLOGY_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("ontology.jsonl"));

        let ephemeral = var("JARVIS_EPHEMERAL")
            .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);

        Ok(Self {
            host: var("HOST").unwrap_or_else(|| "0.0.0.0".into()),
            port,
            messages_file,
            ontology_file,
            exclude_sender: var("JARVIS_EXCLUDE_SENDER").unwrap_or_else(|| ASSISTANT.into()),
            ephemeral,
            server_url: var("JARVIS_URL").unwrap_or_else(|| format!("http://127.0.0.1:{}", port)),
            tail_exclude: match var("JARVIS_TAIL_EXCLUDE") {
                Some(sender) if sender.trim().is_empty() => None,
                Some(sender) => Some(sender),
                None => Some(GUEST.into()),
            },
        })
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults() {
        let cfg = config(&[]).unwrap();
        assert_eq!(cfg.bind_addr(), "0.0.0.0:3001");
        assert_eq!(cfg.messages_file, PathBuf::from("data/messages.json"));
        assert_eq!(cfg.ontology_file, PathBuf::from("data/ontology.jsonl"));
        assert_eq!(cfg.exclude_sender, "assistant");
        assert!(!cfg.ephemeral);
        assert_eq!(cfg.server_url, "http://127.0.0.1:3001");
        // The terminal follower shows assistant replies by default.
        assert_eq!(cfg.tail_exclude.as_deref(), Some("guest"));
    }

    #[test]
    fn tail_exclusion_overrides() {
        let cfg = config(&[("JARVIS_TAIL_EXCLUDE", "Ada")]).unwrap();
        assert_eq!(cfg.tail_exclude.as_deref(), Some("Ada"));

        let cfg = config(&[("JARVIS_TAIL_EXCLUDE", "")]).unwrap();
        assert_eq!(cfg.tail_exclude, None);
    }

    #[test]
    fn data_dir_and_overrides() {
        let cfg = config(&[
            ("PORT", "8080"),
            ("JARVIS_DATA_DIR", "/srv/jarvis"),
            ("JARVIS_ONTOLOGY_FILE", "/etc/onto.jsonl"),
            ("JARVIS_EPHEMERAL", "TRUE"),
        ])
        .unwrap();
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.messages_file, PathBuf::from("/srv/jarvis/messages.json"));
        assert_eq!(cfg.ontology_file, PathBuf::from("/etc/onto.jsonl"));
        assert!(cfg.ephemeral);
        assert_eq!(cfg.server_url, "http://127.0.0.1:8080");
    }

    #[test]
    fn bad_port_is_an_error() {
        assert!(config(&[("PORT", "nope")]).is_err());
    }
}
