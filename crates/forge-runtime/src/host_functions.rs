//! Host functions exposed to capability modules.
//!
//! All imports live in the `"forge"` module. Every function reads guest
//! strings out of the exported `memory`; a guest that imports nothing does
//! not need to export memory at all.
//!
//! | import | signature | effect |
//! |---|---|---|
//! | `print` | `(ptr: i32, len: i32)` | append to captured output |
//! | `log` | `(level: i32, ptr: i32, len: i32)` | forward to `tracing` |
//! | `fail` | `(ptr: i32, len: i32)` | abort `run` with the message |
//! | `time_now` | `() -> i64` | Unix seconds |

use wasmtime::{Caller, Linker};

/// Import module name for all host functions.
pub const HOST_MODULE: &str = "forge";

/// Captured output is truncated past this many bytes.
pub const MAX_OUTPUT_BYTES: usize = 1024 * 1024;

/// State carried in each Store, accessible by host functions.
#[derive(Debug, Default)]
pub struct GuestState {
    /// Capability the store belongs to, for log attribution.
    pub unit: String,
    /// Bytes written through `print`.
    pub output: Vec<u8>,
    /// Set once `output` hit `MAX_OUTPUT_BYTES`.
    pub truncated: bool,
}

impl GuestState {
    pub fn new(unit: impl Into<String>) -> Self {
        Self {
            unit: unit.into(),
            ..Default::default()
        }
    }

    fn append_output(&mut self, bytes: &[u8]) {
        let room = MAX_OUTPUT_BYTES.saturating_sub(self.output.len());
        if bytes.len() > room {
            self.truncated = true;
        }
        self.output.extend_from_slice(&bytes[..bytes.len().min(room)]);
    }

    /// Captured output as text.
    pub fn output_text(&self) -> String {
        String::from_utf8_lossy(&self.output).into_owned()
    }
}

/// Error raised by a guest through `forge.fail`.
///
/// Surfaces through wasmtime as the source of the call error and is
/// recovered with `downcast_ref`.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct GuestFailure(pub String);

/// Register every host import on the linker.
pub fn register(linker: &mut Linker<GuestState>) -> Result<(), wasmtime::Error> {
    linker.func_wrap(
        HOST_MODULE,
        "print",
        |mut caller: Caller<'_, GuestState>, ptr: i32, len: i32| -> Result<(), anyhow::Error> {
            let bytes = read_guest_bytes(&mut caller, ptr, len, "print")?;
            caller.data_mut().append_output(&bytes);
            Ok(())
        },
    )?;

    linker.func_wrap(
        HOST_MODULE,
        "log",
        |mut caller: Caller<'_, GuestState>,
         level: i32,
         ptr: i32,
         len: i32|
         -> Result<(), anyhow::Error> {
            let bytes = read_guest_bytes(&mut caller, ptr, len, "log")?;
            let msg = String::from_utf8_lossy(&bytes);
            let unit = &caller.data().unit;
            match level {
                0 => tracing::trace!(capability = %unit, "[guest] {msg}"),
                1 => tracing::debug!(capability = %unit, "[guest] {msg}"),
                2 => tracing::info!(capability = %unit, "[guest] {msg}"),
                3 => tracing::warn!(capability = %unit, "[guest] {msg}"),
                _ => tracing::error!(capability = %unit, "[guest] {msg}"),
            }
            Ok(())
        },
    )?;

    linker.func_wrap(
        HOST_MODULE,
        "fail",
        |mut caller: Caller<'_, GuestState>, ptr: i32, len: i32| -> Result<(), anyhow::Error> {
            let bytes = read_guest_bytes(&mut caller, ptr, len, "fail")?;
            Err(GuestFailure(String::from_utf8_lossy(&bytes).into_owned()).into())
        },
    )?;

    linker.func_wrap(HOST_MODULE, "time_now", || -> i64 {
        chrono::Utc::now().timestamp()
    })?;

    Ok(())
}

/// Copy `len` bytes at `ptr` out of the guest's exported memory.
fn read_guest_bytes(
    caller: &mut Caller<'_, GuestState>,
    ptr: i32,
    len: i32,
    import: &str,
) -> Result<Vec<u8>, anyhow::Error> {
    let memory = caller
        .get_export("memory")
        .and_then(|e| e.into_memory())
        .ok_or_else(|| anyhow::anyhow!("{import}: module must export 'memory'"))?;

    if ptr < 0 || len < 0 {
        anyhow::bail!("{import}: negative pointer or length");
    }
    let data = memory.data(&*caller);
    let start = ptr as usize;
    let end = start
        .checked_add(len as usize)
        .ok_or_else(|| anyhow::anyhow!("{import}: length overflow"))?;
    if end > data.len() {
        anyhow::bail!("{import}: pointer out of bounds");
    }
    Ok(data[start..end].to_vec())
}
