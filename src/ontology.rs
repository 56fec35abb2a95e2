use crate::store::StoreError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub properties: Map<String, Value>,
    #[serde(default)]
    pub created: String,
    #[serde(default)]
    pub updated: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relation {
    pub from: String,
    pub rel: String,
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<Map<String, Value>>,
}

impl Relation {
    fn is_complete(&self) -> bool {
        !self.from.is_empty() && !self.rel.is_empty() && !self.to.is_empty()
    }
}

/// One line of the ontology file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum OntologyEntry {
    Entity { entity: Entity },
    Relation(Relation),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OntologyData {
    pub entities: Vec<Entity>,
    pub relations: Vec<Relation>,
}

#[derive(Debug, thiserror::Error)]
pub enum LineError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("not an entity or relation")]
    Unrecognized,
}

/// Parse one ontology line.
///
/// Lines whose `kind` is `"entity"` or `"relation"` are decoded strictly.
/// Anything else falls back to the older shapes: `{"entity": {...}}` or
/// `{"from", "rel", "to", ...}`, where `kind` may be just another field.
pub fn parse_line(line: &str) -> Result<OntologyEntry, LineError> {
    let value: Value = serde_json::from_str(line)?;

    let tagged = matches!(
        value.get("kind").and_then(Value::as_str),
        Some("entity") | Some("relation")
    );

    let entry = if tagged {
        serde_json::from_value(value)?
    } else if let Some(entity) = value.get("entity") {
        OntologyEntry::Entity {
            entity: Entity::deserialize(entity)?,
        }
    } else if ["from", "rel", "to"].iter().all(|k| value.get(k).is_some()) {
        OntologyEntry::Relation(serde_json::from_value(value)?)
    } else {
        return Err(LineError::Unrecognized);
    };

    match &entry {
        OntologyEntry::Relation(rel) if !rel.is_complete() => Err(LineError::Unrecognized),
        _ => Ok(entry),
    }
}

/// Read-only view over the ontology NDJSON file.
///
/// Every load re-parses the whole file. Bad lines are skipped, logged and
/// counted in [`OntologyReader::skipped_lines`].
#[derive(Debug)]
pub struct OntologyReader {
    path: PathBuf,
    skipped: AtomicU64,
}

impl OntologyReader {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            skipped: AtomicU64::new(0),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Total lines skipped across all loads.
    pub fn skipped_lines(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }

    pub async fn load(&self) -> Result<OntologyData, StoreError> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("Ontology file {} not found, serving empty data", self.path.display());
                return Ok(OntologyData::default());
            }
            Err(e) => return Err(StoreError::io(&self.path, e)),
        };

        let mut data = OntologyData::default();
        let mut skipped = 0;

        for (idx, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            match parse_line(line) {
                Ok(OntologyEntry::Entity { entity }) => data.entities.push(entity),
                Ok(OntologyEntry::Relation(rel)) => data.relations.push(rel),
                Err(e) => {
                    warn!("Skipping ontology line {} in {}: {}", idx + 1, self.path.display(), e);
                    skipped += 1;
                }
            }
        }

        if skipped > 0 {
            self.skipped.fetch_add(skipped, Ordering::Relaxed);
        }

        debug!(
            "Loaded ontology: {} entities, {} relations, {} skipped",
            data.entities.len(),
            data.relations.len(),
            skipped
        );

        Ok(data)
    }
}
