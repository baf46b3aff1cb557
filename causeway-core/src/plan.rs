//! Emission plan.
//!
//! Deciding what to instrument happens outside the engine. The outcome
//! arrives as an `EmissionPlan`: declarative rules mapping source patterns
//! to enabled kinds. The ingestor consults it before doing anything else.

use crate::error::ConfigError;
use crate::event::KindTag;
use crate::SourceId;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Set of event kinds.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct KindSet: u8 {
        const FUNCTION_ENTRY = 1 << 0;
        const FUNCTION_EXIT = 1 << 1;
        const STATE_CHANGE = 1 << 2;
        const MESSAGE_SEND = 1 << 3;
        const MESSAGE_RECEIVE = 1 << 4;
        const UNIT_SPAWN = 1 << 5;
        const UNIT_EXIT = 1 << 6;

        const CALLS = Self::FUNCTION_ENTRY.bits() | Self::FUNCTION_EXIT.bits();
        const MESSAGES = Self::MESSAGE_SEND.bits() | Self::MESSAGE_RECEIVE.bits();
        const LIFECYCLE = Self::UNIT_SPAWN.bits() | Self::UNIT_EXIT.bits();
    }
}

impl KindSet {
    pub const fn from_tag(tag: KindTag) -> Self {
        Self::from_bits_truncate(1 << (tag.as_u8() - 1))
    }

    #[inline]
    pub const fn allows(self, tag: KindTag) -> bool {
        self.contains(Self::from_tag(tag))
    }

    fn from_kind_name(name: &str) -> Option<Self> {
        match name {
            "all" => Some(Self::all()),
            "calls" => Some(Self::CALLS),
            "messages" => Some(Self::MESSAGES),
            "lifecycle" => Some(Self::LIFECYCLE),
            other => KindTag::ALL
                .into_iter()
                .find(|t| t.name() == other)
                .map(Self::from_tag),
        }
    }
}

impl Default for KindSet {
    fn default() -> Self {
        Self::all()
    }
}

// Kind sets are written as lists of names: ["calls", "state_change"]
impl Serialize for KindSet {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let names: Vec<&'static str> = KindTag::ALL
            .into_iter()
            .filter(|t| self.allows(*t))
            .map(KindTag::name)
            .collect();
        names.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for KindSet {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let names = Vec::<String>::deserialize(deserializer)?;
        names.iter().try_fold(Self::empty(), |acc, name| {
            Self::from_kind_name(name)
                .map(|k| acc | k)
                .ok_or_else(|| serde::de::Error::custom(format!("unknown event kind: {}", name)))
        })
    }
}

/// Which sources a rule applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourcePattern {
    Any,
    Exact(SourceId),
    /// Inclusive range of source ids.
    Range { start: SourceId, end: SourceId },
}

impl SourcePattern {
    #[inline]
    pub fn matches(&self, source: SourceId) -> bool {
        match self {
            Self::Any => true,
            Self::Exact(s) => *s == source,
            Self::Range { start, end } => *start <= source && source <= *end,
        }
    }
}

/// One `{source pattern -> enabled kinds}` rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanRule {
    pub source: SourcePattern,
    pub kinds: KindSet,
}

/// Rules are checked in order; the first matching rule decides. Sources no
/// rule matches fall back to `default_kinds`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmissionPlan {
    #[serde(default)]
    pub rules: Vec<PlanRule>,
    #[serde(default)]
    pub default_kinds: KindSet,
}

impl EmissionPlan {
    /// Everything enabled for every source.
    pub fn allow_all() -> Self {
        Self {
            rules: Vec::new(),
            default_kinds: KindSet::all(),
        }
    }

    /// Nothing enabled unless a rule says so.
    pub fn deny_all() -> Self {
        Self {
            rules: Vec::new(),
            default_kinds: KindSet::empty(),
        }
    }

    pub fn with_rule(mut self, source: SourcePattern, kinds: KindSet) -> Self {
        self.rules.push(PlanRule { source, kinds });
        self
    }

    /// Whether `source` may emit events of kind `tag`.
    #[inline]
    pub fn allows(&self, source: SourceId, tag: KindTag) -> bool {
        self.rules
            .iter()
            .find(|r| r.source.matches(source))
            .map_or(self.default_kinds, |r| r.kinds)
            .allows(tag)
    }

    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        toml::from_str(s).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })
    }

    pub fn from_json_str(s: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(s).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (i, rule) in self.rules.iter().enumerate() {
            if let SourcePattern::Range { start, end } = rule.source {
                if start > end {
                    return Err(ConfigError::InvalidValue {
                        field: format!("plan.rules[{}].source", i),
                        value: format!("{}..={}", start, end),
                        reason: "range start must not exceed end".to_string(),
                    });
                }
            }
        }
        Ok(())
    }
}

impl Default for EmissionPlan {
    fn default() -> Self {
        Self::allow_all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_allows_everything() {
        let plan = EmissionPlan::default();
        for tag in KindTag::ALL {
            assert!(plan.allows(SourceId(123), tag));
        }
    }

    #[test]
    fn test_first_matching_rule_wins() {
        let plan = EmissionPlan::allow_all()
            .with_rule(SourcePattern::Exact(SourceId(5)), KindSet::MESSAGES)
            .with_rule(
                SourcePattern::Range {
                    start: SourceId(1),
                    end: SourceId(10),
                },
                KindSet::empty(),
            );
        assert!(plan.allows(SourceId(5), KindTag::MessageSend));
        assert!(!plan.allows(SourceId(5), KindTag::FunctionEntry));
        assert!(!plan.allows(SourceId(6), KindTag::MessageSend));
        assert!(plan.allows(SourceId(11), KindTag::FunctionEntry));
    }

    #[test]
    fn test_kind_set_from_tag() {
        assert_eq!(
            KindSet::from_tag(KindTag::FunctionEntry),
            KindSet::FUNCTION_ENTRY
        );
        assert_eq!(KindSet::from_tag(KindTag::UnitExit), KindSet::UNIT_EXIT);
        assert!(KindSet::CALLS.allows(KindTag::FunctionExit));
        assert!(!KindSet::CALLS.allows(KindTag::StateChange));
    }

    #[test]
    fn test_plan_from_toml() {
        let plan = EmissionPlan::from_toml_str(
            r#"
            default_kinds = ["lifecycle"]

            [[rules]]
            source = { exact = 7 }
            kinds = ["calls", "state_change"]

            [[rules]]
            source = { range = { start = 100, end = 200 } }
            kinds = ["all"]
            "#,
        )
        .unwrap();
        assert_eq!(plan.rules.len(), 2);
        assert!(plan.allows(SourceId(7), KindTag::StateChange));
        assert!(!plan.allows(SourceId(7), KindTag::MessageSend));
        assert!(plan.allows(SourceId(150), KindTag::MessageSend));
        assert!(plan.allows(SourceId(1), KindTag::UnitSpawn));
        assert!(!plan.allows(SourceId(1), KindTag::FunctionEntry));
    }

    #[test]
    fn test_plan_from_json() {
        let plan = EmissionPlan::from_json_str(
            r#"{"rules":[{"source":"any","kinds":["message_send"]}]}"#,
        )
        .unwrap();
        assert!(plan.allows(SourceId(1), KindTag::MessageSend));
        assert!(!plan.allows(SourceId(1), KindTag::MessageReceive));
    }

    #[test]
    fn test_unknown_kind_name_rejected() {
        let err = EmissionPlan::from_json_str(
            r#"{"rules":[{"source":"any","kinds":["teleport"]}]}"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_validate_range() {
        let plan = EmissionPlan::allow_all().with_rule(
            SourcePattern::Range {
                start: SourceId(9),
                end: SourceId(1),
            },
            KindSet::all(),
        );
        assert!(plan.validate().is_err());
    }
}
