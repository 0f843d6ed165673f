//! Known identities and where they come from
//!
//! A `Roster` is an immutable snapshot. Reloading builds a new one and swaps it
//! in whole; nothing ever edits a roster in place.

use std::path::PathBuf;
use std::sync::RwLock;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// A person the engine can recognise
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnownIdentity {
    pub identity_id: String,
    pub display_name: String,
    pub embedding: Vec<f32>,
}

impl KnownIdentity {
    pub fn new(identity_id: impl Into<String>, display_name: impl Into<String>, embedding: Vec<f32>) -> Self {
        Self {
            identity_id: identity_id.into(),
            display_name: display_name.into(),
            embedding,
        }
    }
}

/// Immutable roster snapshot
#[derive(Debug, Clone, Default)]
pub struct Roster {
    identities: Vec<KnownIdentity>,
    generation: u64,
}

impl Roster {
    /// Build a snapshot, dropping identities whose embeddings cannot be compared.
    ///
    /// An embedding is unusable if it is empty or its length differs from the
    /// first usable identity's.
    pub fn new(identities: Vec<KnownIdentity>, generation: u64) -> Self {
        let mut dimension = None;
        let identities = identities
            .into_iter()
            .filter(|identity| {
                let len = identity.embedding.len();
                if len == 0 {
                    warn!(identity = %identity.identity_id, "Skipping identity with empty embedding");
                    return false;
                }
                match dimension {
                    None => {
                        dimension = Some(len);
                        true
                    }
                    Some(d) if d == len => true,
                    Some(d) => {
                        warn!(
                            identity = %identity.identity_id,
                            "Skipping identity with {}-dimensional embedding, roster uses {}", len, d
                        );
                        false
                    }
                }
            })
            .collect();
        Self {
            identities,
            generation,
        }
    }

    pub fn identities(&self) -> &[KnownIdentity] {
        &self.identities
    }

    /// Incremented on every reload
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    pub fn display_name(&self, identity_id: &str) -> Option<&str> {
        self.identities
            .iter()
            .find(|i| i.identity_id == identity_id)
            .map(|i| i.display_name.as_str())
    }
}

/// Source of known identities
#[async_trait::async_trait]
pub trait RosterProvider: Send + Sync {
    async fn load_all(&self) -> anyhow::Result<Vec<KnownIdentity>>;
}

/// Roster read from a JSON array of identities on disk
#[derive(Debug, Clone)]
pub struct JsonRosterProvider {
    path: PathBuf,
}

impl JsonRosterProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait::async_trait]
impl RosterProvider for JsonRosterProvider {
    async fn load_all(&self) -> anyhow::Result<Vec<KnownIdentity>> {
        let data = tokio::fs::read(&self.path)
            .await
            .with_context(|| format!("Failed to read roster {:?}", self.path))?;
        let identities = serde_json::from_slice(&data)
            .with_context(|| format!("Failed to parse roster {:?}", self.path))?;
        Ok(identities)
    }
}

/// In-memory roster, replaceable at runtime
#[derive(Debug, Default)]
pub struct StaticRosterProvider {
    identities: RwLock<Vec<KnownIdentity>>,
}

impl StaticRosterProvider {
    pub fn new(identities: Vec<KnownIdentity>) -> Self {
        Self {
            identities: RwLock::new(identities),
        }
    }

    /// Replace the identities returned by the next load
    pub fn set(&self, identities: Vec<KnownIdentity>) {
        *self.identities.write().unwrap_or_else(|e| e.into_inner()) = identities;
    }
}

#[async_trait::async_trait]
impl RosterProvider for StaticRosterProvider {
    async fn load_all(&self) -> anyhow::Result<Vec<KnownIdentity>> {
        Ok(self
            .identities
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roster_drops_unusable_embeddings() {
        let roster = Roster::new(
            vec![
                KnownIdentity::new("empty", "Empty", vec![]),
                KnownIdentity::new("alice", "Alice", vec![0.0, 1.0]),
                KnownIdentity::new("odd", "Odd", vec![0.0, 1.0, 2.0]),
                KnownIdentity::new("bob", "Bob", vec![1.0, 0.0]),
            ],
            1,
        );
        let ids: Vec<&str> = roster.identities().iter().map(|i| i.identity_id.as_str()).collect();
        assert_eq!(ids, vec!["alice", "bob"]);
        assert_eq!(roster.display_name("bob"), Some("Bob"));
        assert_eq!(roster.display_name("odd"), None);
    }

    #[tokio::test]
    async fn json_provider_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("roster.json");
        std::fs::write(
            &path,
            r#"[{"identity_id":"s-001","display_name":"Alice","embedding":[0.1,0.2]}]"#,
        )
        .unwrap();

        let identities = JsonRosterProvider::new(&path).load_all().await.unwrap();
        assert_eq!(identities.len(), 1);
        assert_eq!(identities[0].display_name, "Alice");
        assert_eq!(identities[0].embedding, vec![0.1, 0.2]);
    }

    #[tokio::test]
    async fn json_provider_reports_bad_file() {
        let dir = tempfile::tempdir().unwrap();
        let missing = JsonRosterProvider::new(dir.path().join("missing.json"));
        assert!(missing.load_all().await.is_err());

        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{not json").unwrap();
        let err = JsonRosterProvider::new(&path).load_all().await.unwrap_err();
        assert!(format!("{err:#}").contains("Failed to parse roster"));
    }

    #[tokio::test]
    async fn static_provider_can_be_replaced() {
        let provider = StaticRosterProvider::new(vec![KnownIdentity::new("a", "A", vec![1.0])]);
        assert_eq!(provider.load_all().await.unwrap().len(), 1);
        provider.set(vec![]);
        assert!(provider.load_all().await.unwrap().is_empty());
    }
}
