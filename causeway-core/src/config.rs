//! Configuration types

use crate::error::ConfigError;
use crate::event::CaptureLimits;
use crate::plan::EmissionPlan;
use crate::NodeTag;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// What the ring does when a producer finds it full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Drop the new event and count it
    #[default]
    DropNewest,
    /// Spin, then yield, for at most `timeout_ms` before dropping
    NoLoss { timeout_ms: u64 },
}

impl OverflowPolicy {
    pub fn no_loss(timeout: Duration) -> Self {
        Self::NoLoss {
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }
    }
}

impl FromStr for OverflowPolicy {
    type Err = ConfigError;

    /// `drop_newest`, `no_loss` or `no_loss:<timeout_ms>`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidValue {
            field: "capture.overflow".to_string(),
            value: s.to_string(),
            reason: "expected drop_newest, no_loss or no_loss:<timeout_ms>".to_string(),
        };
        match s.trim() {
            "drop_newest" => Ok(Self::DropNewest),
            "no_loss" => Ok(Self::NoLoss {
                timeout_ms: DEFAULT_NO_LOSS_TIMEOUT_MS,
            }),
            other => other
                .strip_prefix("no_loss:")
                .and_then(|ms| ms.parse().ok())
                .map(|timeout_ms| Self::NoLoss { timeout_ms })
                .ok_or_else(invalid),
        }
    }
}

const DEFAULT_NO_LOSS_TIMEOUT_MS: u64 = 10;

/// Digest-only capture or full payload capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CaptureMode {
    #[default]
    Digest,
    /// Digests may grow to the payload budget. Costlier: larger slots.
    Full,
}

// ============================================================================
// SECTIONS
// ============================================================================

/// Producer-side settings: ring sizing, overflow and truncation budgets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub ring_capacity: usize,
    pub priority_capacity: usize,
    pub overflow: OverflowPolicy,
    pub reserve_retries: u32,
    pub payload_budget: usize,
    pub digest_budget: usize,
    pub capture_mode: CaptureMode,
    pub node_tag: u16,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            ring_capacity: 4096,
            priority_capacity: 256,
            overflow: OverflowPolicy::DropNewest,
            reserve_retries: 1024,
            payload_budget: 2048,
            digest_budget: 256,
            capture_mode: CaptureMode::Digest,
            node_tag: 0,
        }
    }
}

impl CaptureConfig {
    /// Truncation budgets implied by the capture mode.
    pub fn limits(&self) -> CaptureLimits {
        let digest_budget = match self.capture_mode {
            CaptureMode::Digest => self.digest_budget,
            CaptureMode::Full => self.payload_budget.max(self.digest_budget),
        };
        CaptureLimits::new(self.payload_budget, digest_budget)
    }

    pub fn node_tag(&self) -> NodeTag {
        NodeTag(self.node_tag)
    }
}

/// Writer pool settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    pub workers: usize,
    pub drain_batch_size: usize,
    pub idle_backoff_ms: u64,
    pub store_timeout_ms: u64,
    pub store_retry_pause_ms: u64,
    pub store_max_pause_ms: u64,
    pub shard_channel_capacity: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            drain_batch_size: 256,
            idle_backoff_ms: 1,
            store_timeout_ms: 50,
            store_retry_pause_ms: 5,
            store_max_pause_ms: 200,
            shard_channel_capacity: 64,
        }
    }
}

impl WriterConfig {
    pub fn idle_backoff(&self) -> Duration {
        Duration::from_millis(self.idle_backoff_ms)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn store_retry_pause(&self) -> Duration {
        Duration::from_millis(self.store_retry_pause_ms)
    }

    pub fn store_max_pause(&self) -> Duration {
        Duration::from_millis(self.store_max_pause_ms)
    }
}

/// Correlator sharding and bookkeeping bounds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrelatorConfig {
    pub shards: usize,
    pub virtual_nodes: usize,
    pub max_stack_depth: usize,
    pub max_tracked_sources: usize,
    pub max_pending_sends: usize,
    pub pending_ttl_ms: u64,
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            shards: 4,
            virtual_nodes: 64,
            max_stack_depth: 256,
            max_tracked_sources: 16_384,
            max_pending_sends: 65_536,
            pending_ttl_ms: 30_000,
        }
    }
}

impl CorrelatorConfig {
    pub fn pending_ttl(&self) -> Duration {
        Duration::from_millis(self.pending_ttl_ms)
    }
}

/// Hot store retention.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub max_age_ms: Option<u64>,
    pub max_count: Option<usize>,
    pub prune_interval_ms: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            max_age_ms: Some(600_000),
            max_count: Some(1_000_000),
            prune_interval_ms: 1_000,
        }
    }
}

impl RetentionConfig {
    pub fn max_age(&self) -> Option<Duration> {
        self.max_age_ms.map(Duration::from_millis)
    }

    pub fn prune_interval(&self) -> Duration {
        Duration::from_millis(self.prune_interval_ms)
    }
}

// ============================================================================
// MASTER CONFIG
// ============================================================================

/// Master configuration struct.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CausewayConfig {
    pub capture: CaptureConfig,
    pub writer: WriterConfig,
    pub correlator: CorrelatorConfig,
    pub retention: RetentionConfig,
    pub plan: EmissionPlan,
}

impl CausewayConfig {
    /// Parse and validate a TOML document. Missing sections take defaults.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by `CAUSEWAY_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `CAUSEWAY_*` overrides read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: FromStr>(key: &str, raw: String) -> Result<T, ConfigError> {
            raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
                field: key.to_string(),
                value: raw.clone(),
                reason: "not a valid number".to_string(),
            })
        }

        if let Some(v) = lookup("CAUSEWAY_RING_CAPACITY") {
            self.capture.ring_capacity = parse("CAUSEWAY_RING_CAPACITY", v)?;
        }
        if let Some(v) = lookup("CAUSEWAY_OVERFLOW") {
            self.capture.overflow = v.parse()?;
        }
        if let Some(v) = lookup("CAUSEWAY_PAYLOAD_BUDGET") {
            self.capture.payload_budget = parse("CAUSEWAY_PAYLOAD_BUDGET", v)?;
        }
        if let Some(v) = lookup("CAUSEWAY_DRAIN_BATCH") {
            self.writer.drain_batch_size = parse("CAUSEWAY_DRAIN_BATCH", v)?;
        }
        if let Some(v) = lookup("CAUSEWAY_WRITER_WORKERS") {
            self.writer.workers = parse("CAUSEWAY_WRITER_WORKERS", v)?;
        }
        if let Some(v) = lookup("CAUSEWAY_SHARDS") {
            self.correlator.shards = parse("CAUSEWAY_SHARDS", v)?;
        }
        if let Some(v) = lookup("CAUSEWAY_MAX_AGE_MS") {
            self.retention.max_age_ms = Some(parse("CAUSEWAY_MAX_AGE_MS", v)?);
        }
        if let Some(v) = lookup("CAUSEWAY_MAX_COUNT") {
            self.retention.max_count = Some(parse("CAUSEWAY_MAX_COUNT", v)?);
        }
        Ok(())
    }

    /// Validate the configuration.
    ///
    /// Validates:
    /// - every capacity, count and interval is positive
    /// - digest budget fits the wire format's u16 length
    /// - retry pause does not exceed the max pause
    /// - plan source ranges are ordered
    pub fn validate(&self) -> Result<(), ConfigError> {
        positive("capture.ring_capacity", self.capture.ring_capacity as u64)?;
        positive(
            "capture.priority_capacity",
            self.capture.priority_capacity as u64,
        )?;
        positive(
            "capture.reserve_retries",
            u64::from(self.capture.reserve_retries),
        )?;
        if self.capture.payload_budget > u32::MAX as usize {
            return Err(invalid(
                "capture.payload_budget",
                self.capture.payload_budget,
                "payload_budget must fit in u32",
            ));
        }
        if self.capture.limits().digest_budget > crate::digest::MAX_DIGEST_LEN {
            return Err(invalid(
                "capture.digest_budget",
                self.capture.limits().digest_budget,
                "digest budget must not exceed 65535 bytes",
            ));
        }
        if let OverflowPolicy::NoLoss { timeout_ms } = self.capture.overflow {
            positive("capture.overflow.timeout_ms", timeout_ms)?;
        }

        positive("writer.workers", self.writer.workers as u64)?;
        positive("writer.drain_batch_size", self.writer.drain_batch_size as u64)?;
        positive("writer.store_timeout_ms", self.writer.store_timeout_ms)?;
        positive(
            "writer.shard_channel_capacity",
            self.writer.shard_channel_capacity as u64,
        )?;
        if self.writer.store_retry_pause_ms > self.writer.store_max_pause_ms {
            return Err(ConfigError::IncompatibleOptions {
                option_a: format!(
                    "writer.store_retry_pause_ms={}",
                    self.writer.store_retry_pause_ms
                ),
                option_b: format!(
                    "writer.store_max_pause_ms={}",
                    self.writer.store_max_pause_ms
                ),
            });
        }

        positive("correlator.shards", self.correlator.shards as u64)?;
        positive(
            "correlator.virtual_nodes",
            self.correlator.virtual_nodes as u64,
        )?;
        positive(
            "correlator.max_stack_depth",
            self.correlator.max_stack_depth as u64,
        )?;
        positive(
            "correlator.max_tracked_sources",
            self.correlator.max_tracked_sources as u64,
        )?;
        positive(
            "correlator.max_pending_sends",
            self.correlator.max_pending_sends as u64,
        )?;
        positive("correlator.pending_ttl_ms", self.correlator.pending_ttl_ms)?;

        if let Some(max_count) = self.retention.max_count {
            positive("retention.max_count", max_count as u64)?;
        }
        if let Some(max_age_ms) = self.retention.max_age_ms {
            positive("retention.max_age_ms", max_age_ms)?;
        }
        positive(
            "retention.prune_interval_ms",
            self.retention.prune_interval_ms,
        )?;

        self.plan.validate()
    }
}

fn positive(field: &str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(invalid(field, value, "must be greater than 0"));
    }
    Ok(())
}

fn invalid(field: &str, value: impl ToString, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{KindTag, SourceId};
    use std::collections::HashMap;

    #[test]
    fn test_default_is_valid() {
        let config = CausewayConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.capture.ring_capacity, 4096);
        assert_eq!(config.capture.reserve_retries, 1024);
        assert_eq!(config.writer.workers, 2);
        assert_eq!(config.correlator.shards, 4);
        assert_eq!(config.retention.max_count, Some(1_000_000));
    }

    #[test]
    fn test_zero_ring_capacity_rejected() {
        let mut config = CausewayConfig::default();
        config.capture.ring_capacity = 0;
        let err = config.validate().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue { ref field, .. } if field == "capture.ring_capacity"
        ));
    }

    #[test]
    fn test_retry_pause_above_max_rejected() {
        let mut config = CausewayConfig::default();
        config.writer.store_retry_pause_ms = 500;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::IncompatibleOptions { .. })
        ));
    }

    #[test]
    fn test_full_mode_raises_digest_budget() {
        let mut capture = CaptureConfig::default();
        assert_eq!(capture.limits().digest_budget, 256);
        capture.capture_mode = CaptureMode::Full;
        assert_eq!(capture.limits().digest_budget, 2048);
        assert!(capture.limits().max_event_size() > CaptureConfig::default().limits().max_event_size());
    }

    #[test]
    fn test_from_toml_partial() {
        let config = CausewayConfig::from_toml_str(
            r#"
            [capture]
            ring_capacity = 128
            overflow = { no_loss = { timeout_ms = 5 } }

            [retention]
            max_count = 10

            [[plan.rules]]
            source = { exact = 1 }
            kinds = ["calls"]
            "#,
        )
        .unwrap();
        assert_eq!(config.capture.ring_capacity, 128);
        assert_eq!(
            config.capture.overflow,
            OverflowPolicy::NoLoss { timeout_ms: 5 }
        );
        assert_eq!(config.retention.max_count, Some(10));
        assert_eq!(config.retention.max_age_ms, Some(600_000));
        assert_eq!(config.writer, WriterConfig::default());
        assert!(!config.plan.allows(SourceId(1), KindTag::MessageSend));
    }

    #[test]
    fn test_from_toml_invalid() {
        assert!(matches!(
            CausewayConfig::from_toml_str("[capture]\nring_capacity = \"lots\""),
            Err(ConfigError::Parse { .. })
        ));
        assert!(matches!(
            CausewayConfig::from_toml_str("[writer]\nworkers = 0"),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("CAUSEWAY_RING_CAPACITY", "1024"),
            ("CAUSEWAY_OVERFLOW", "no_loss:25"),
            ("CAUSEWAY_SHARDS", "8"),
            ("CAUSEWAY_MAX_AGE_MS", "1000"),
        ]
        .into_iter()
        .collect();
        let mut config = CausewayConfig::default();
        config
            .apply_env(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.capture.ring_capacity, 1024);
        assert_eq!(
            config.capture.overflow,
            OverflowPolicy::NoLoss { timeout_ms: 25 }
        );
        assert_eq!(config.correlator.shards, 8);
        assert_eq!(config.retention.max_age_ms, Some(1000));
        assert_eq!(config.writer.workers, 2);
    }

    #[test]
    fn test_env_override_invalid_number() {
        let mut config = CausewayConfig::default();
        let err = config
            .apply_env(|k| (k == "CAUSEWAY_DRAIN_BATCH").then(|| "many".to_string()))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue { ref field, .. } if field == "CAUSEWAY_DRAIN_BATCH"
        ));
    }

    #[test]
    fn test_overflow_policy_parse() {
        assert_eq!(
            "drop_newest".parse::<OverflowPolicy>().unwrap(),
            OverflowPolicy::DropNewest
        );
        assert_eq!(
            "no_loss".parse::<OverflowPolicy>().unwrap(),
            OverflowPolicy::NoLoss { timeout_ms: 10 }
        );
        assert!("sometimes".parse::<OverflowPolicy>().is_err());
    }
}
