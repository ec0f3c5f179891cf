use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ProtoError;

/// Memory class keyed by an elapsed-time threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryTier {
    Short,
    Mid,
    Long,
}

impl MemoryTier {
    /// All tiers in prompt order.
    pub const ALL: [MemoryTier; 3] = [MemoryTier::Short, MemoryTier::Mid, MemoryTier::Long];

    /// Label used when rendering the tier into a prompt.
    pub fn label(self) -> &'static str {
        match self {
            MemoryTier::Short => "Short-term memory",
            MemoryTier::Mid => "Mid-term memory",
            MemoryTier::Long => "Long-term memory",
        }
    }
}

impl std::fmt::Display for MemoryTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemoryTier::Short => write!(f, "short"),
            MemoryTier::Mid => write!(f, "mid"),
            MemoryTier::Long => write!(f, "long"),
        }
    }
}

impl std::str::FromStr for MemoryTier {
    type Err = ProtoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "short" => Ok(MemoryTier::Short),
            "mid" => Ok(MemoryTier::Mid),
            "long" => Ok(MemoryTier::Long),
            other => Err(ProtoError::InvalidTier(other.to_string())),
        }
    }
}

/// A summary of the transcript for one tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryRecord {
    #[serde(rename = "type")]
    pub tier: MemoryTier,
    pub summary: String,
    pub timestamp: DateTime<Utc>,
}

impl MemoryRecord {
    /// Creates a record stamped with the current time.
    pub fn new(tier: MemoryTier, summary: impl Into<String>) -> Self {
        Self {
            tier,
            summary: summary.into(),
            timestamp: Utc::now(),
        }
    }
}
