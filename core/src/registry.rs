use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tracing::warn;

use crate::config::Config;
use chatbox_protocol::ModelDescriptor;

/// Public id of the descriptor that lets the agent pick a concrete vendor
/// model per turn. Always present and always available.
pub const AUTO_MODEL_ID: &str = "auto";

/// Latency ceiling for one availability probe during `list()`.
const PROBE_CEILING: Duration = Duration::from_millis(250);

const DEFAULT_CONTEXT_LENGTH: u32 = 200_000;

pub type AvailabilityProbe =
    Arc<dyn Fn() -> BoxFuture<'static, Result<bool, String>> + Send + Sync>;

/// One registry row: the public descriptor plus the server-side vendor
/// handle and an optional availability probe.
#[derive(Clone)]
pub struct ModelEntry {
    pub id: String,
    pub name: String,
    pub provider: String,
    pub context_length: u32,
    /// `None` marks the auto sentinel; the vendor client picks its own
    /// default handle.
    pub vendor_handle: Option<String>,
    probe: Option<AvailabilityProbe>,
}

impl ModelEntry {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        vendor_handle: Option<&str>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            provider: "anthropic".to_string(),
            context_length: DEFAULT_CONTEXT_LENGTH,
            vendor_handle: vendor_handle.map(str::to_string),
            probe: None,
        }
    }

    pub fn with_probe(mut self, probe: AvailabilityProbe) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn is_auto(&self) -> bool {
        self.vendor_handle.is_none()
    }
}

/// Read-mostly table of selectable models, constructed once per process.
pub struct ModelRegistry {
    entries: Vec<ModelEntry>,
    default_id: String,
}

impl ModelRegistry {
    pub fn new(config: &Config) -> Self {
        let credential_probe = credential_probe(config);
        let entries = vec![
            ModelEntry::new(AUTO_MODEL_ID, "Auto (agent picks the model)", None),
            ModelEntry::new(
                "claude-sonnet-4-5",
                "Claude Sonnet 4.5",
                Some("claude-sonnet-4-5-20250929"),
            )
            .with_probe(credential_probe.clone()),
            ModelEntry::new(
                "claude-opus-4-5",
                "Claude Opus 4.5",
                Some("claude-opus-4-5-20250514"),
            )
            .with_probe(credential_probe.clone()),
            ModelEntry::new(
                "claude-haiku-4-5",
                "Claude Haiku 4.5",
                Some("claude-haiku-4-5-20251001"),
            )
            .with_probe(credential_probe),
        ];

        let default_id = if entries.iter().any(|entry| entry.id == config.default_model_id) {
            config.default_model_id.clone()
        } else {
            warn!(
                "configured default model {:?} is not in the registry; falling back to {AUTO_MODEL_ID}",
                config.default_model_id
            );
            AUTO_MODEL_ID.to_string()
        };

        Self {
            entries,
            default_id,
        }
    }

    /// Replace or append an entry. Intended for tests and for deployments
    /// that trim the built-in table.
    pub fn upsert(&mut self, entry: ModelEntry) {
        match self.entries.iter_mut().find(|existing| existing.id == entry.id) {
            Some(existing) => *existing = entry,
            None => self.entries.push(entry),
        }
    }

    pub fn lookup(&self, id: &str) -> Option<&ModelEntry> {
        self.entries.iter().find(|entry| entry.id == id)
    }

    pub fn default_id(&self) -> &str {
        &self.default_id
    }

    pub fn default_entry(&self) -> &ModelEntry {
        self.lookup(&self.default_id)
            .expect("default model id is always present in the registry")
    }

    /// Evaluate one entry's availability, bounded by the probe ceiling.
    pub async fn is_available(&self, entry: &ModelEntry) -> bool {
        let Some(probe) = entry.probe.as_ref() else {
            return true;
        };
        match tokio::time::timeout(PROBE_CEILING, probe()).await {
            Ok(Ok(available)) => available,
            Ok(Err(reason)) => {
                warn!(model = %entry.id, "availability probe failed: {reason}");
                false
            }
            Err(_) => {
                warn!(
                    model = %entry.id,
                    "availability probe exceeded {}ms ceiling",
                    PROBE_CEILING.as_millis()
                );
                false
            }
        }
    }

    /// All descriptors with availability evaluated at call time.
    pub async fn list(&self) -> Vec<ModelDescriptor> {
        let checks = self.entries.iter().map(|entry| self.is_available(entry));
        let availability = futures::future::join_all(checks).await;
        self.entries
            .iter()
            .zip(availability)
            .map(|(entry, available)| ModelDescriptor {
                id: entry.id.clone(),
                name: entry.name.clone(),
                provider: entry.provider.clone(),
                available,
                context_length: entry.context_length,
            })
            .collect()
    }
}

fn credential_probe(config: &Config) -> AvailabilityProbe {
    let configured = !config.llm_api_key.is_empty();
    Arc::new(move || Box::pin(async move { Ok(configured) }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn test_config(default_model: Option<&'static str>) -> Config {
        let mut env = HashMap::from([
            ("ANTHROPIC_API_KEY", "sk-ant-test0001"),
            ("NETBOX_URL", "http://netbox.example.com"),
            ("NETBOX_TOKEN", "token-value"),
            ("TOOL_SERVER_COMMAND", "uv"),
        ]);
        if let Some(id) = default_model {
            env.insert("DEFAULT_MODEL", id);
        }
        Config::from_lookup(|key| env.get(key).map(|value| value.to_string())).unwrap()
    }

    #[tokio::test]
    async fn auto_is_always_available() {
        let registry = ModelRegistry::new(&test_config(None));
        let auto = registry.lookup(AUTO_MODEL_ID).unwrap();
        assert!(auto.is_auto());
        assert!(registry.is_available(auto).await);
    }

    #[tokio::test]
    async fn unknown_lookup_is_none() {
        let registry = ModelRegistry::new(&test_config(None));
        assert!(registry.lookup("frobnicator").is_none());
    }

    #[test]
    fn unknown_default_falls_back_to_auto() {
        let registry = ModelRegistry::new(&test_config(Some("frobnicator")));
        assert_eq!(registry.default_id(), AUTO_MODEL_ID);

        let registry = ModelRegistry::new(&test_config(Some("claude-sonnet-4-5")));
        assert_eq!(registry.default_id(), "claude-sonnet-4-5");
    }

    #[tokio::test]
    async fn slow_probe_reports_unavailable() {
        let mut registry = ModelRegistry::new(&test_config(None));
        registry.upsert(
            ModelEntry::new("sluggish", "Sluggish", Some("sluggish-v1")).with_probe(Arc::new(
                || {
                    Box::pin(async {
                        tokio::time::sleep(Duration::from_secs(5)).await;
                        Ok(true)
                    })
                },
            )),
        );
        let entry = registry.lookup("sluggish").unwrap();
        assert!(!registry.is_available(entry).await);

        let descriptors = registry.list().await;
        let sluggish = descriptors.iter().find(|d| d.id == "sluggish").unwrap();
        assert!(!sluggish.available);
    }

    #[tokio::test]
    async fn failing_probe_reports_unavailable() {
        let mut registry = ModelRegistry::new(&test_config(None));
        registry.upsert(
            ModelEntry::new("flaky", "Flaky", Some("flaky-v1"))
                .with_probe(Arc::new(|| Box::pin(async { Err("probe exploded".to_string()) }))),
        );
        let entry = registry.lookup("flaky").unwrap();
        assert!(!registry.is_available(entry).await);
    }
}
