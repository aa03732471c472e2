use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    Memory,
    File,
    Sqlite,
}

impl StoreKind {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "memory" | "mem" => Some(StoreKind::Memory),
            "file" | "json" => Some(StoreKind::File),
            "sqlite" => Some(StoreKind::Sqlite),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Namespace for persisted keys: `<prefix>:experiments`, `<prefix>:funnels`, `<prefix>:events`.
    pub key_prefix: String,
    pub store_kind: StoreKind,
    pub store_path: String,
    /// Checkpoint the event log after every append.
    pub persist_on_write: bool,
    pub min_sample_size: u64,
    pub z_threshold: f64,
    pub drop_off_alert_pct: f64,
    pub low_conversion_pct: f64,
    pub low_volume_users: u64,
    pub sink_url: Option<String>,
    pub sink_failure_threshold: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            key_prefix: "abx".to_string(),
            store_kind: StoreKind::Memory,
            store_path: "./abx-store".to_string(),
            persist_on_write: true,
            min_sample_size: 100,
            z_threshold: 1.96,
            drop_off_alert_pct: 50.0,
            low_conversion_pct: 10.0,
            low_volume_users: 100,
            sink_url: None,
            sink_failure_threshold: 5,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            key_prefix: std::env::var("ABX_KEY_PREFIX").unwrap_or(d.key_prefix),
            store_kind: std::env::var("ABX_STORE").ok().and_then(|v| StoreKind::parse(&v)).unwrap_or(d.store_kind),
            store_path: std::env::var("ABX_STORE_PATH").unwrap_or(d.store_path),
            persist_on_write: std::env::var("ABX_PERSIST").ok().and_then(|v| v.parse().ok()).unwrap_or(d.persist_on_write),
            min_sample_size: std::env::var("ABX_MIN_SAMPLE").ok().and_then(|v| v.parse().ok()).unwrap_or(d.min_sample_size),
            z_threshold: std::env::var("ABX_Z_THRESHOLD").ok().and_then(|v| v.parse().ok()).unwrap_or(d.z_threshold),
            drop_off_alert_pct: std::env::var("ABX_DROP_OFF_ALERT").ok().and_then(|v| v.parse().ok()).unwrap_or(d.drop_off_alert_pct),
            low_conversion_pct: std::env::var("ABX_LOW_CONVERSION").ok().and_then(|v| v.parse().ok()).unwrap_or(d.low_conversion_pct),
            low_volume_users: std::env::var("ABX_LOW_VOLUME").ok().and_then(|v| v.parse().ok()).unwrap_or(d.low_volume_users),
            sink_url: std::env::var("ABX_SINK_URL").ok().filter(|v| !v.is_empty()),
            sink_failure_threshold: std::env::var("ABX_SINK_FAILURES").ok().and_then(|v| v.parse().ok()).unwrap_or(d.sink_failure_threshold),
        }
    }

    pub fn key(&self, name: &str) -> String {
        format!("{}:{}", self.key_prefix, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_thresholds() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.min_sample_size, 100);
        assert_eq!(cfg.z_threshold, 1.96);
        assert_eq!(cfg.drop_off_alert_pct, 50.0);
        assert_eq!(cfg.key("events"), "abx:events");
    }

    #[test]
    fn test_store_kind_parse() {
        assert_eq!(StoreKind::parse("SQLite"), Some(StoreKind::Sqlite));
        assert_eq!(StoreKind::parse(" file "), Some(StoreKind::File));
        assert_eq!(StoreKind::parse("redis"), None);
    }
}
