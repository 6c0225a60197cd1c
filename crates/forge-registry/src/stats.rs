//! Per-capability execution statistics, persisted as `stats/<name>.json`.

use crate::registry::write_atomic;
use dashmap::DashMap;
use forge_types::capability::CapabilityStats;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Average run time above which a capability is flagged for optimization.
pub const SLOW_RUN_THRESHOLD_SECS: f64 = 5.0;

/// In-memory stats with write-through persistence.
#[derive(Debug)]
pub struct StatsStore {
    dir: PathBuf,
    stats: DashMap<String, CapabilityStats>,
}

impl StatsStore {
    /// Open the stats directory, loading whatever is already there.
    ///
    /// Unreadable files are skipped with a warning.
    pub fn open(dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        let stats = DashMap::new();
        for entry in std::fs::read_dir(&dir)?.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match read_stats(&path) {
                Ok(s) => {
                    stats.insert(name.to_string(), s);
                }
                Err(e) => warn!(path = %path.display(), "Skipping unreadable stats file: {e}"),
            }
        }
        Ok(Self { dir, stats })
    }

    /// Fold one invocation into `name`'s stats and persist them.
    ///
    /// Persistence failures are logged; the in-memory figures still update.
    pub fn record(&self, name: &str, elapsed_secs: f64, success: bool) -> CapabilityStats {
        let updated = {
            let mut entry = self.stats.entry(name.to_string()).or_default();
            entry.record(elapsed_secs, success);
            entry.value().clone()
        };
        match serde_json::to_vec_pretty(&updated) {
            Ok(bytes) => {
                if let Err(e) = write_atomic(&self.path_for(name), &bytes) {
                    warn!(capability = %name, "Failed to persist stats: {e}");
                }
            }
            Err(e) => warn!(capability = %name, "Failed to serialize stats: {e}"),
        }
        debug!(
            capability = %name,
            run_count = updated.run_count,
            avg_time_secs = updated.avg_time_secs,
            "Recorded run"
        );
        updated
    }

    pub fn get(&self, name: &str) -> Option<CapabilityStats> {
        self.stats.get(name).map(|s| s.value().clone())
    }

    /// Forget `name`'s stats, on disk too.
    pub fn remove(&self, name: &str) {
        self.stats.remove(name);
        match std::fs::remove_file(self.path_for(name)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(capability = %name, "Failed to delete stats file: {e}"),
        }
    }

    /// Reason to revisit `name`, if its history suggests one.
    pub fn suggest_optimization(&self, name: &str) -> Option<String> {
        let stats = self.get(name)?;
        if stats.avg_time_secs > SLOW_RUN_THRESHOLD_SECS {
            return Some(format!(
                "Capability '{name}' averages {:.2}s per run (over {SLOW_RUN_THRESHOLD_SECS}s); consider optimizing it",
                stats.avg_time_secs
            ));
        }
        if stats.last_success == Some(false) {
            return Some(format!(
                "Capability '{name}' failed on its last run; consider repairing it"
            ));
        }
        None
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.json"))
    }
}

fn read_stats(path: &Path) -> Result<CapabilityStats, String> {
    let text = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
    serde_json::from_str(&text).map_err(|e| e.to_string())
}
