//! Capability data model: the unit of new functionality the agent acquires at run time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Open key/value metadata attached to a capability (origin prompt, timestamp, provenance).
pub type CapabilityMetadata = BTreeMap<String, serde_json::Value>;

/// Name of the zero-argument export every capability must provide.
pub const ENTRY_POINT: &str = "run";

/// Maximum length of a capability name.
pub const MAX_NAME_LEN: usize = 64;

/// Lifecycle position of a capability.
///
/// Not persisted: derived from registry state when a capability is described.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityStatus {
    /// Generated, not yet verified.
    Pending,
    /// Passed the sandbox, not yet committed.
    Verified,
    /// Committed to the registry and loaded; callable.
    Active,
    /// Rejected by the sandbox or the loader.
    Failed,
}

impl std::fmt::Display for CapabilityStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CapabilityStatus::Pending => "pending",
            CapabilityStatus::Verified => "verified",
            CapabilityStatus::Active => "active",
            CapabilityStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A candidate or committed capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Capability {
    /// Unique registry key.
    pub name: String,
    /// Full source text of the module.
    pub source: String,
    /// Provenance metadata.
    #[serde(default)]
    pub metadata: CapabilityMetadata,
    /// Current lifecycle position.
    pub status: CapabilityStatus,
}

/// One row of the persisted registry index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityRecord {
    /// Registry key.
    pub name: String,
    /// Path of the persisted source file.
    pub code_path: PathBuf,
    /// SHA-256 of the source, hex encoded.
    pub sha256: String,
    /// Provenance metadata.
    #[serde(default)]
    pub metadata: CapabilityMetadata,
    /// When this version was committed.
    pub registered_at: DateTime<Utc>,
}

/// Execution statistics for an active capability.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CapabilityStats {
    /// Number of completed invocations.
    pub run_count: u64,
    /// Running mean of wall-clock time per invocation, in seconds.
    pub avg_time_secs: f64,
    /// When the last invocation finished.
    pub last_run: Option<DateTime<Utc>>,
    /// Whether the last invocation succeeded.
    pub last_success: Option<bool>,
}

impl CapabilityStats {
    /// Fold one invocation into the running statistics.
    pub fn record(&mut self, elapsed_secs: f64, success: bool) {
        self.run_count += 1;
        if self.run_count == 1 {
            self.avg_time_secs = elapsed_secs;
        } else {
            let n = self.run_count as f64;
            self.avg_time_secs = (self.avg_time_secs * (n - 1.0) + elapsed_secs) / n;
        }
        self.last_run = Some(Utc::now());
        self.last_success = Some(success);
    }
}

/// Caller-facing result of a synthesis request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposalOutcome {
    /// Whether the capability reached `Active`.
    pub success: bool,
    /// Capability name the request mapped to.
    pub name: String,
    /// Human-readable summary.
    pub message: String,
    /// Last diagnostic on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Last attempted source, kept for audit on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempted_source: Option<String>,
    /// Number of repair cycles used (0 or 1).
    pub repair_attempts: u32,
    /// Pipeline states visited, in order.
    #[serde(default)]
    pub trace: Vec<String>,
}
