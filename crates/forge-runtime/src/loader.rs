//! Dynamic loader: materializes capability source as a named unit inside the
//! running process.
//!
//! Source is WebAssembly text. Compilation produces a [`LoadedUnit`] holding a
//! `wasmtime::Module`; every invocation instantiates it in a fresh `Store`, so
//! units share nothing with each other or with previous calls.
//!
//! The `name -> unit` table is a `DashMap` of `Arc<LoadedUnit>`. Installing a
//! unit replaces the map slot in one step. A call already in flight keeps its
//! own `Arc` to the old unit and runs to completion.

use crate::host_functions::{self, GuestFailure, GuestState};
use dashmap::DashMap;
use forge_types::capability::ENTRY_POINT;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use wasmtime::{Config, Engine, ExternType, Linker, Module, Store, Trap, Val};

/// Epoch ticker period. Wall-clock limits are rounded up to this granularity.
const EPOCH_TICK: Duration = Duration::from_millis(50);

/// Errors from loading or invoking a unit.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LoadError {
    #[error("Compilation failed: {0}")]
    Compile(String),
    #[error("Capability '{0}' does not export a zero-argument `run` function")]
    MissingEntryPoint(String),
    #[error("Instantiation failed: {0}")]
    Instantiation(String),
    #[error("{0}")]
    GuestFailure(String),
    #[error("Trap: {0}")]
    Trap(String),
    #[error("Fuel exhausted: capability exceeded its instruction budget")]
    FuelExhausted,
    #[error("Execution timed out after {0}s")]
    TimedOut(u64),
    #[error("No unit loaded under '{0}'")]
    NotLoaded(String),
    #[error("Engine error: {0}")]
    Engine(String),
}

/// Execution limits for a loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoaderConfig {
    /// Instruction budget per store. 0 = unlimited.
    pub fuel_limit: u64,
    /// Wall-clock limit per store in seconds. 0 = unlimited.
    pub timeout_secs: u64,
}

impl LoaderConfig {
    /// No fuel metering, no deadline. Used by the sandbox child, where the
    /// parent enforces the wall clock by killing the process.
    pub fn unbounded() -> Self {
        Self {
            fuel_limit: 0,
            timeout_secs: 0,
        }
    }
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            fuel_limit: 50_000_000,
            timeout_secs: 30,
        }
    }
}

impl From<&forge_types::config::RuntimeSettings> for LoaderConfig {
    fn from(settings: &forge_types::config::RuntimeSettings) -> Self {
        Self {
            fuel_limit: settings.fuel_limit,
            timeout_secs: settings.timeout_secs,
        }
    }
}

/// A compiled capability ready to be invoked.
#[derive(Debug)]
pub struct LoadedUnit {
    /// Name the unit is registered under.
    pub name: String,
    /// SHA-256 of the source it was built from.
    pub checksum: String,
    /// When it was compiled.
    pub loaded_at: chrono::DateTime<chrono::Utc>,
    module: Module,
}

/// Result of one successful call to `run`.
#[derive(Debug, Clone)]
pub struct Invocation {
    /// Text written through `forge.print`.
    pub output: String,
    /// Whether output hit the capture cap.
    pub truncated: bool,
    /// Fuel units consumed, when metering is on.
    pub fuel_consumed: u64,
    /// Wall-clock time of the call.
    pub elapsed: Duration,
}

/// A failed call, with whatever output the guest produced before failing.
#[derive(Debug, Clone)]
pub struct InvocationFailure {
    pub error: LoadError,
    pub partial_output: String,
}

impl std::fmt::Display for InvocationFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.error.fmt(f)
    }
}

impl std::error::Error for InvocationFailure {}

/// Materializes and hot-swaps named units.
pub struct DynamicLoader {
    engine: Engine,
    linker: Linker<GuestState>,
    config: LoaderConfig,
    units: DashMap<String, Arc<LoadedUnit>>,
    ticker_stop: Arc<AtomicBool>,
}

impl DynamicLoader {
    /// Create a loader with default limits.
    pub fn new() -> Result<Self, LoadError> {
        Self::with_config(LoaderConfig::default())
    }

    /// Create a loader with explicit limits.
    pub fn with_config(config: LoaderConfig) -> Result<Self, LoadError> {
        let mut wasm_config = Config::new();
        wasm_config.consume_fuel(config.fuel_limit > 0);
        wasm_config.epoch_interruption(config.timeout_secs > 0);
        let engine = Engine::new(&wasm_config).map_err(|e| LoadError::Engine(e.to_string()))?;

        let mut linker = Linker::new(&engine);
        host_functions::register(&mut linker).map_err(|e| LoadError::Engine(e.to_string()))?;

        let ticker_stop = Arc::new(AtomicBool::new(false));
        if config.timeout_secs > 0 {
            let engine = engine.clone();
            let stop = ticker_stop.clone();
            std::thread::Builder::new()
                .name("forge-epoch".into())
                .spawn(move || {
                    while !stop.load(Ordering::Relaxed) {
                        std::thread::sleep(EPOCH_TICK);
                        engine.increment_epoch();
                    }
                })
                .map_err(|e| LoadError::Engine(format!("epoch ticker: {e}")))?;
        }

        Ok(Self {
            engine,
            linker,
            config,
            units: DashMap::new(),
            ticker_stop,
        })
    }

    /// Compile and validate `source` without installing it.
    ///
    /// Checks the entry point and performs a trial instantiation, which runs
    /// any `start` function under this loader's limits.
    pub fn compile(&self, name: &str, source: &str) -> Result<Arc<LoadedUnit>, LoadError> {
        let module = Module::new(&self.engine, source.as_bytes())
            .map_err(|e| LoadError::Compile(format!("{e:#}")))?;

        let has_entry = module.exports().any(|export| {
            export.name() == ENTRY_POINT
                && matches!(export.ty(), ExternType::Func(ref f) if f.params().len() == 0)
        });
        if !has_entry {
            return Err(LoadError::MissingEntryPoint(name.to_string()));
        }

        let mut store = self.new_store(name)?;
        self.linker
            .instantiate(&mut store, &module)
            .map_err(|e| match classify_trap(&e, self.config.timeout_secs) {
                Some(err) => err,
                None => LoadError::Instantiation(format!("{e:#}")),
            })?;

        Ok(Arc::new(LoadedUnit {
            name: name.to_string(),
            checksum: sha256_hex(source.as_bytes()),
            loaded_at: chrono::Utc::now(),
            module,
        }))
    }

    /// Make `unit` the live unit for its name. Returns the unit it replaced.
    pub fn install(&self, unit: Arc<LoadedUnit>) -> Option<Arc<LoadedUnit>> {
        let name = unit.name.clone();
        let previous = self.units.insert(name.clone(), unit);
        if previous.is_some() {
            info!(capability = %name, "Hot-swapped capability");
        } else {
            info!(capability = %name, "Loaded capability");
        }
        previous
    }

    /// Compile, validate and install in one step.
    pub fn load(&self, name: &str, source: &str) -> Result<Arc<LoadedUnit>, LoadError> {
        let unit = self.compile(name, source)?;
        self.install(unit.clone());
        Ok(unit)
    }

    /// Drop the live unit for `name`. In-flight calls are unaffected.
    pub fn unload(&self, name: &str) -> bool {
        let removed = self.units.remove(name).is_some();
        if removed {
            debug!(capability = %name, "Unloaded capability");
        }
        removed
    }

    /// Current live unit for `name`.
    pub fn get(&self, name: &str) -> Option<Arc<LoadedUnit>> {
        self.units.get(name).map(|entry| entry.value().clone())
    }

    /// Names with a live unit, sorted.
    pub fn loaded_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.units.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Invoke a unit's entry point on a blocking thread.
    pub async fn invoke(&self, unit: Arc<LoadedUnit>) -> Result<Invocation, InvocationFailure> {
        let engine = self.engine.clone();
        let linker = self.linker.clone();
        let config = self.config;
        tokio::task::spawn_blocking(move || invoke_sync(&engine, &linker, config, &unit))
            .await
            .map_err(|e| InvocationFailure {
                error: LoadError::Engine(format!("spawn_blocking join failed: {e}")),
                partial_output: String::new(),
            })?
    }

    /// Invoke a unit's entry point on the current thread.
    pub fn invoke_blocking(&self, unit: &LoadedUnit) -> Result<Invocation, InvocationFailure> {
        invoke_sync(&self.engine, &self.linker, self.config, unit)
    }

    fn new_store(&self, name: &str) -> Result<Store<GuestState>, LoadError> {
        build_store(&self.engine, self.config, name)
    }
}

impl Drop for DynamicLoader {
    fn drop(&mut self) {
        self.ticker_stop.store(true, Ordering::Relaxed);
    }
}

fn build_store(
    engine: &Engine,
    config: LoaderConfig,
    name: &str,
) -> Result<Store<GuestState>, LoadError> {
    let mut store = Store::new(engine, GuestState::new(name));
    if config.fuel_limit > 0 {
        store
            .set_fuel(config.fuel_limit)
            .map_err(|e| LoadError::Engine(e.to_string()))?;
    }
    if config.timeout_secs > 0 {
        let ticks = (config.timeout_secs * 1000).div_ceil(EPOCH_TICK.as_millis() as u64);
        store.set_epoch_deadline(ticks.max(1));
    }
    Ok(store)
}

fn invoke_sync(
    engine: &Engine,
    linker: &Linker<GuestState>,
    config: LoaderConfig,
    unit: &LoadedUnit,
) -> Result<Invocation, InvocationFailure> {
    let started = Instant::now();
    let fail = |error: LoadError, store: Option<&Store<GuestState>>| InvocationFailure {
        error,
        partial_output: store.map(|s| s.data().output_text()).unwrap_or_default(),
    };

    let mut store = build_store(engine, config, &unit.name).map_err(|e| fail(e, None))?;

    let instance = match linker.instantiate(&mut store, &unit.module) {
        Ok(instance) => instance,
        Err(e) => {
            let err = classify_trap(&e, config.timeout_secs)
                .unwrap_or_else(|| LoadError::Instantiation(format!("{e:#}")));
            return Err(fail(err, Some(&store)));
        }
    };

    let run = instance
        .get_func(&mut store, ENTRY_POINT)
        .ok_or_else(|| fail(LoadError::MissingEntryPoint(unit.name.clone()), Some(&store)))?;
    let result_count = run.ty(&store).results().len();
    let mut results = vec![Val::I32(0); result_count];

    if let Err(e) = run.call(&mut store, &[], &mut results) {
        let err = classify_trap(&e, config.timeout_secs).unwrap_or_else(|| {
            warn!(capability = %unit.name, "Capability trapped: {e:#}");
            LoadError::Trap(format!("{e:#}"))
        });
        return Err(fail(err, Some(&store)));
    }

    let fuel_consumed = if config.fuel_limit > 0 {
        config
            .fuel_limit
            .saturating_sub(store.get_fuel().unwrap_or(0))
    } else {
        0
    };

    let state = store.data();
    debug!(capability = %unit.name, fuel_consumed, "Capability run complete");
    Ok(Invocation {
        output: state.output_text(),
        truncated: state.truncated,
        fuel_consumed,
        elapsed: started.elapsed(),
    })
}

/// Map well-known wasmtime failures onto typed errors.
fn classify_trap(err: &wasmtime::Error, timeout_secs: u64) -> Option<LoadError> {
    if let Some(failure) = err.downcast_ref::<GuestFailure>() {
        return Some(LoadError::GuestFailure(failure.0.clone()));
    }
    match err.downcast_ref::<Trap>() {
        Some(Trap::OutOfFuel) => Some(LoadError::FuelExhausted),
        Some(Trap::Interrupt) => Some(LoadError::TimedOut(timeout_secs)),
        _ => None,
    }
}

/// Hex SHA-256 of `data`.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}
