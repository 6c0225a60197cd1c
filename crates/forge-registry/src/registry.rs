//! Capability registry: the durable `name -> capability` catalog.
//!
//! On-disk layout under the capabilities directory:
//!
//! ```text
//! <dir>/<name>.wat        one source file per capability
//! <dir>/registry.json     index, rewritten wholesale on every commit
//! <dir>/stats/<name>.json execution statistics
//! ```
//!
//! Mutations (`register`, `remove`, `reload_all`) are serialized by one
//! writer lock. Readers go through an [`ArcSwap`] snapshot that is replaced
//! only after a commit has reached disk, so `list`/`get` never block and
//! never see a half-applied change.

use crate::stats::StatsStore;
use crate::verify::{validate_name, verify_checksum};
use crate::RegistryError;
use arc_swap::ArcSwap;
use forge_runtime::loader::{sha256_hex, DynamicLoader};
use forge_types::capability::{
    Capability, CapabilityMetadata, CapabilityRecord, CapabilityStats, CapabilityStatus,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

/// Index file name inside the capabilities directory.
pub const INDEX_FILE: &str = "registry.json";

/// Current index format version.
const INDEX_VERSION: u32 = 1;

/// Prefix of staged source files; leftovers from a crash are swept on open.
const STAGING_PREFIX: &str = ".staging-";

/// Whether an indexed capability is callable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryState {
    /// Indexed, not yet materialized in this process.
    Unloaded,
    /// Materialized and callable.
    Active,
    /// Failed to reload; kept for audit.
    Failed(String),
}

impl EntryState {
    /// Lifecycle position of an entry in this state. Everything indexed has
    /// passed verification once; only a live unit makes it active.
    pub fn status(&self) -> CapabilityStatus {
        match self {
            EntryState::Unloaded => CapabilityStatus::Verified,
            EntryState::Active => CapabilityStatus::Active,
            EntryState::Failed(_) => CapabilityStatus::Failed,
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    record: CapabilityRecord,
    source: Arc<str>,
    state: EntryState,
}

/// An active capability as seen by readers.
#[derive(Debug, Clone)]
pub struct CapabilityEntry {
    pub record: CapabilityRecord,
    pub source: Arc<str>,
}

/// Outcome of [`CapabilityRegistry::reload_all`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReloadReport {
    /// Names that are active after the reload.
    pub loaded: Vec<String>,
    /// Names that failed, with the reason.
    pub failed: Vec<(String, String)>,
}

#[derive(Debug, Serialize, Deserialize)]
struct IndexFile {
    version: u32,
    #[serde(default)]
    capabilities: BTreeMap<String, IndexRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexRecord {
    #[serde(flatten)]
    record: CapabilityRecord,
    /// Last reload failure, if the entry is quarantined.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    failure: Option<String>,
}

type Snapshot = BTreeMap<String, Entry>;

/// Durable catalog of verified capabilities, kept in sync with a loader.
pub struct CapabilityRegistry {
    dir: PathBuf,
    loader: Arc<DynamicLoader>,
    snapshot: ArcSwap<Snapshot>,
    write_lock: Mutex<()>,
    stats: StatsStore,
}

impl CapabilityRegistry {
    /// Open (creating if needed) the registry rooted at `dir`.
    ///
    /// Indexed entries start [`EntryState::Unloaded`]; call
    /// [`reload_all`](Self::reload_all) to materialize them.
    pub fn open(dir: impl Into<PathBuf>, loader: Arc<DynamicLoader>) -> Result<Self, RegistryError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        sweep_staging(&dir);
        let stats = StatsStore::open(dir.join("stats"))?;

        let index_path = dir.join(INDEX_FILE);
        let mut entries = Snapshot::new();
        if index_path.exists() {
            let text = std::fs::read_to_string(&index_path)?;
            let index: IndexFile = serde_json::from_str(&text)?;
            if index.version != INDEX_VERSION {
                warn!(
                    version = index.version,
                    expected = INDEX_VERSION,
                    "Registry index has an unexpected version; reading it anyway"
                );
            }
            for (name, row) in index.capabilities {
                let state = match row.failure {
                    Some(reason) => EntryState::Failed(reason),
                    None => EntryState::Unloaded,
                };
                entries.insert(
                    name,
                    Entry {
                        record: row.record,
                        source: Arc::from(""),
                        state,
                    },
                );
            }
        }

        info!(dir = %dir.display(), indexed = entries.len(), "Opened capability registry");
        Ok(Self {
            dir,
            loader,
            snapshot: ArcSwap::from_pointee(entries),
            write_lock: Mutex::new(()),
            stats,
        })
    }

    /// Directory holding sources and the index.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The loader this registry keeps in sync.
    pub fn loader(&self) -> &Arc<DynamicLoader> {
        &self.loader
    }

    /// Add or atomically overwrite `name`. Returns `false` if the loader
    /// rejects the source or the commit fails; nothing is left behind.
    pub fn add(&self, name: &str, source: &str, metadata: CapabilityMetadata) -> bool {
        match self.register(name, source, metadata) {
            Ok(_) => true,
            Err(e) => {
                warn!(capability = %name, "Registration failed: {e}");
                false
            }
        }
    }

    /// Typed form of [`add`](Self::add).
    ///
    /// 1. stage the source in a temp file beside its final path;
    /// 2. compile it and check the entry point, discarding the stage on error;
    /// 3. rename the stage over `<name>.wat` and flush the index, restoring
    ///    the previous source if the flush fails;
    /// 4. install the unit in the loader and publish the new snapshot.
    pub fn register(
        &self,
        name: &str,
        source: &str,
        metadata: CapabilityMetadata,
    ) -> Result<CapabilityRecord, RegistryError> {
        validate_name(name).map_err(|reason| RegistryError::InvalidName {
            name: name.to_string(),
            reason,
        })?;

        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.snapshot.load_full();

        let staged = stage(&self.dir, source.as_bytes())?;
        let unit = self
            .loader
            .compile(name, source)
            .map_err(|reason| RegistryError::Rejected {
                name: name.to_string(),
                reason,
            })?;

        let code_path = self.source_path(name);
        let previous_source = std::fs::read(&code_path).ok();
        staged
            .persist(&code_path)
            .map_err(|e| RegistryError::Io(e.error))?;

        let record = CapabilityRecord {
            name: name.to_string(),
            code_path: code_path.clone(),
            sha256: sha256_hex(source.as_bytes()),
            metadata,
            registered_at: chrono::Utc::now(),
        };
        let mut next: Snapshot = (*current).clone();
        next.insert(
            name.to_string(),
            Entry {
                record: record.clone(),
                source: Arc::from(source),
                state: EntryState::Active,
            },
        );

        if let Err(e) = self.flush_index(&next) {
            rollback_source(&code_path, previous_source.as_deref());
            return Err(e);
        }

        self.loader.install(unit);
        self.snapshot.store(Arc::new(next));
        info!(capability = %name, sha256 = %record.sha256, "Registered capability");
        Ok(record)
    }

    /// Delete `name`'s source, index row, loaded unit and stats.
    ///
    /// The entry is unpublished, on disk and in memory, before the file
    /// goes. A crash or a concurrent reader in between sees an orphan file,
    /// never an entry without its source.
    pub fn remove(&self, name: &str) -> Result<bool, RegistryError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.snapshot.load_full();
        let Some(entry) = current.get(name) else {
            return Ok(false);
        };

        let mut next: Snapshot = (*current).clone();
        next.remove(name);
        self.flush_index(&next)?;
        self.snapshot.store(Arc::new(next));

        self.loader.unload(name);
        match std::fs::remove_file(&entry.record.code_path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(capability = %name, "Failed to delete source file: {e}"),
        }
        self.stats.remove(name);
        info!(capability = %name, "Removed capability");
        Ok(true)
    }

    /// Active names, sorted.
    pub fn list(&self) -> Vec<String> {
        self.snapshot
            .load()
            .iter()
            .filter(|(_, e)| e.state == EntryState::Active)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Quarantined names with the reason they failed to reload.
    pub fn quarantined(&self) -> Vec<(String, String)> {
        self.snapshot
            .load()
            .iter()
            .filter_map(|(name, e)| match &e.state {
                EntryState::Failed(reason) => Some((name.clone(), reason.clone())),
                _ => None,
            })
            .collect()
    }

    /// Active entry for `name`.
    pub fn get(&self, name: &str) -> Option<CapabilityEntry> {
        let snapshot = self.snapshot.load();
        let entry = snapshot.get(name)?;
        if entry.state != EntryState::Active {
            return None;
        }
        Some(CapabilityEntry {
            record: entry.record.clone(),
            source: entry.source.clone(),
        })
    }

    /// State of any indexed name, active or not.
    pub fn state(&self, name: &str) -> Option<EntryState> {
        self.snapshot.load().get(name).map(|e| e.state.clone())
    }

    /// Any indexed capability, with its status derived from the entry state.
    pub fn capability(&self, name: &str) -> Option<Capability> {
        let snapshot = self.snapshot.load();
        let entry = snapshot.get(name)?;
        Some(Capability {
            name: name.to_string(),
            source: entry.source.to_string(),
            metadata: entry.record.metadata.clone(),
            status: entry.state.status(),
        })
    }

    /// Re-materialize every indexed capability from disk.
    ///
    /// Each source is checked against its recorded SHA-256 first. Entries
    /// that are missing, tampered with or rejected by the loader are marked
    /// failed and kept in the index; they are never deleted here.
    pub fn reload_all(&self) -> Result<ReloadReport, RegistryError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.snapshot.load_full();
        let mut next: Snapshot = (*current).clone();
        let mut report = ReloadReport::default();

        for (name, entry) in next.iter_mut() {
            match self.reload_one(entry) {
                Ok(source) => {
                    entry.source = source;
                    entry.state = EntryState::Active;
                    report.loaded.push(name.clone());
                }
                Err(reason) => {
                    warn!(capability = %name, "Quarantined on reload: {reason}");
                    self.loader.unload(name);
                    entry.source = Arc::from("");
                    entry.state = EntryState::Failed(reason.clone());
                    report.failed.push((name.clone(), reason));
                }
            }
        }

        self.flush_index(&next)?;
        self.snapshot.store(Arc::new(next));
        info!(
            loaded = report.loaded.len(),
            failed = report.failed.len(),
            "Reloaded capability registry"
        );
        Ok(report)
    }

    fn reload_one(&self, entry: &Entry) -> Result<Arc<str>, String> {
        let path = &entry.record.code_path;
        let source = std::fs::read_to_string(path)
            .map_err(|e| format!("cannot read {}: {e}", path.display()))?;
        if !verify_checksum(source.as_bytes(), &entry.record.sha256) {
            return Err(format!(
                "checksum mismatch for {} (expected {})",
                path.display(),
                entry.record.sha256
            ));
        }
        self.loader
            .load(&entry.record.name, &source)
            .map_err(|e| e.to_string())?;
        debug!(capability = %entry.record.name, "Reloaded capability");
        Ok(Arc::from(source))
    }

    /// Record one invocation of `name`.
    ///
    /// Returns `None` without writing anything when `name` is no longer
    /// indexed, e.g. a run that outlived a concurrent `remove`.
    pub fn record_run(
        &self,
        name: &str,
        elapsed_secs: f64,
        success: bool,
    ) -> Option<CapabilityStats> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if !self.snapshot.load().contains_key(name) {
            debug!(capability = %name, "Skipping stats for unregistered capability");
            return None;
        }
        Some(self.stats.record(name, elapsed_secs, success))
    }

    pub fn stats(&self, name: &str) -> Option<CapabilityStats> {
        self.stats.get(name)
    }

    /// See [`StatsStore::suggest_optimization`].
    pub fn suggest_optimization(&self, name: &str) -> Option<String> {
        self.stats.suggest_optimization(name)
    }

    fn source_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.wat"))
    }

    fn flush_index(&self, entries: &Snapshot) -> Result<(), RegistryError> {
        let index = IndexFile {
            version: INDEX_VERSION,
            capabilities: entries
                .iter()
                .map(|(name, e)| {
                    let failure = match &e.state {
                        EntryState::Failed(reason) => Some(reason.clone()),
                        _ => None,
                    };
                    (
                        name.clone(),
                        IndexRecord {
                            record: e.record.clone(),
                            failure,
                        },
                    )
                })
                .collect(),
        };
        let bytes = serde_json::to_vec_pretty(&index)?;
        write_atomic(&self.dir.join(INDEX_FILE), &bytes)?;
        Ok(())
    }
}

/// Write `bytes` to a temp file in `path`'s directory and rename it into place.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let staged = stage(dir, bytes)?;
    staged.persist(path).map_err(|e| e.error)?;
    Ok(())
}

fn stage(dir: &Path, bytes: &[u8]) -> std::io::Result<tempfile::NamedTempFile> {
    let mut file = tempfile::Builder::new()
        .prefix(STAGING_PREFIX)
        .tempfile_in(dir)?;
    file.write_all(bytes)?;
    file.as_file().sync_all()?;
    Ok(file)
}

/// Put back what `register` overwrote after a failed index flush.
fn rollback_source(code_path: &Path, previous: Option<&[u8]>) {
    let result = match previous {
        Some(source) => write_atomic(code_path, source),
        None => std::fs::remove_file(code_path),
    };
    if let Err(e) = result {
        warn!(path = %code_path.display(), "Rollback of source file failed: {e}");
    }
}

fn sweep_staging(dir: &Path) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let is_staged = entry
            .file_name()
            .to_str()
            .is_some_and(|n| n.starts_with(STAGING_PREFIX));
        if is_staged {
            debug!(path = %entry.path().display(), "Removing leftover staging file");
            let _ = std::fs::remove_file(entry.path());
        }
    }
}
