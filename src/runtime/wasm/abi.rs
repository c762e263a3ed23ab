//! Host functions imported by guest modules under `host`.
//!
//! Pointers are offsets into the guest's exported `memory`. Functions
//! returning `i32`/`i64` use 0 or a positive length for success and the
//! [`CapError::code`] numbering for failures. Malformed pointers trap.

use std::ops::Range;

use anyhow::{anyhow, bail, Context};
use tracing::{debug, error, info, warn};
use wasmtime::{Caller, Extern, Linker, Memory};

use super::WasmState;
use crate::capability::{self, CapError};
use crate::manifest::Manifest;
use crate::runtime::HandlerId;

pub(super) const MODULE: &str = "host";

const DENIED: i32 = -1;
const NOT_FOUND: i32 = -2;
const INVALID: i32 = -3;

/// Longest method, pattern, header or capability name a guest may pass.
const MAX_SHORT_STRING: usize = 64 * 1024;

/// Raised when a staged result does not fit into the scratch arena.
#[derive(Debug, thiserror::Error)]
#[error("scratch arena exhausted")]
pub(super) struct ScratchExhausted;

fn memory(caller: &mut Caller<'_, WasmState>) -> anyhow::Result<Memory> {
    caller
        .get_export("memory")
        .and_then(Extern::into_memory)
        .ok_or_else(|| anyhow!("guest does not export 'memory'"))
}

/// Converts a guest `(ptr, len)` pair into a byte range.
pub(super) fn span(ptr: i32, len: i32) -> anyhow::Result<Range<usize>> {
    let start = ptr as u32 as usize;
    let len = usize::try_from(len).map_err(|_| anyhow!("negative guest length {len}"))?;
    let end = start
        .checked_add(len)
        .ok_or_else(|| anyhow!("guest range overflows"))?;
    Ok(start..end)
}

fn read_bytes(caller: &mut Caller<'_, WasmState>, ptr: i32, len: i32) -> anyhow::Result<Vec<u8>> {
    let memory = memory(caller)?;
    let range = span(ptr, len)?;
    memory
        .data(&*caller)
        .get(range)
        .map(<[u8]>::to_vec)
        .ok_or_else(|| anyhow!("guest range {ptr}+{len} out of bounds"))
}

fn read_string(caller: &mut Caller<'_, WasmState>, ptr: i32, len: i32) -> anyhow::Result<String> {
    if usize::try_from(len).unwrap_or(usize::MAX) > MAX_SHORT_STRING {
        bail!("guest string of {len} bytes is too long");
    }
    String::from_utf8(read_bytes(caller, ptr, len)?).context("guest string is not UTF-8")
}

/// Registers every host import on `linker`.
pub(super) fn link(linker: &mut Linker<WasmState>) -> anyhow::Result<()> {
    linker.func_wrap(
        MODULE,
        "route",
        |mut caller: Caller<'_, WasmState>,
         mptr: i32,
         mlen: i32,
         pptr: i32,
         plen: i32,
         handler: i32|
         -> anyhow::Result<i32> {
            let method = read_string(&mut caller, mptr, mlen)?;
            let pattern = read_string(&mut caller, pptr, plen)?;
            let Some(builder) = caller.data_mut().builder.as_mut() else {
                warn!("Guest tried to register {method} {pattern} after load");
                return Ok(DENIED);
            };
            let Ok(id) = u32::try_from(handler) else {
                return Ok(INVALID);
            };
            match builder.add(&method, &pattern, HandlerId(id)) {
                Ok(()) => {
                    debug!("Registered {method} {pattern} as {}", HandlerId(id));
                    Ok(0)
                }
                Err(e) => {
                    warn!("Rejected route {method} {pattern}: {e}");
                    Ok(INVALID)
                }
            }
        },
    )?;

    linker.func_wrap(
        MODULE,
        "manifest",
        |mut caller: Caller<'_, WasmState>, ptr: i32, len: i32| -> anyhow::Result<i32> {
            let bytes = read_bytes(&mut caller, ptr, len)?;
            let state = caller.data_mut();
            if state.builder.is_none() {
                return Ok(DENIED);
            }
            if state.manifest.is_some() {
                warn!("Manifest declared twice");
                return Ok(INVALID);
            }
            match Manifest::from_json(&bytes) {
                Ok(manifest) => {
                    state.manifest = Some(manifest);
                    Ok(0)
                }
                Err(e) => {
                    warn!("Invalid manifest declaration: {e}");
                    Ok(INVALID)
                }
            }
        },
    )?;

    linker.func_wrap(
        MODULE,
        "status",
        |mut caller: Caller<'_, WasmState>, code: i32| -> anyhow::Result<()> {
            match u16::try_from(code) {
                Ok(code) if (100..=999).contains(&code) => {
                    caller.data_mut().response.status = Some(code);
                    Ok(())
                }
                _ => bail!("invalid status code {code}"),
            }
        },
    )?;

    linker.func_wrap(
        MODULE,
        "header",
        |mut caller: Caller<'_, WasmState>,
         kptr: i32,
         klen: i32,
         vptr: i32,
         vlen: i32|
         -> anyhow::Result<()> {
            let name = read_string(&mut caller, kptr, klen)?;
            let value = read_string(&mut caller, vptr, vlen)?;
            if name.is_empty() || name.contains(['\r', '\n', ':']) || value.contains(['\r', '\n']) {
                bail!("invalid header '{name}'");
            }
            caller.data_mut().response.set_header(&name, &value);
            Ok(())
        },
    )?;

    linker.func_wrap(
        MODULE,
        "write",
        |mut caller: Caller<'_, WasmState>, ptr: i32, len: i32| -> anyhow::Result<()> {
            let memory = memory(&mut caller)?;
            let range = span(ptr, len)?;
            let (data, state) = memory.data_and_store_mut(&mut caller);
            let bytes = data
                .get(range)
                .ok_or_else(|| anyhow!("guest range {ptr}+{len} out of bounds"))?;
            state.response.body.extend_from_slice(bytes);
            Ok(())
        },
    )?;

    linker.func_wrap(
        MODULE,
        "call",
        |mut caller: Caller<'_, WasmState>,
         nptr: i32,
         nlen: i32,
         aptr: i32,
         alen: i32|
         -> anyhow::Result<i64> {
            let name = read_string(&mut caller, nptr, nlen)?;
            let raw = read_bytes(&mut caller, aptr, alen)?;
            let state = caller.data_mut();
            state.staged = None;

            let result = match state.caps.as_ref() {
                None => Err(CapError::Denied(
                    "capabilities are not available while the application loads".into(),
                )),
                Some(caps) => parse_args(&raw).and_then(|args| capability::invoke(caps, &name, &args)),
            };
            match result {
                Ok(value) => {
                    let bytes = serde_json::to_vec(&value)?;
                    let slice = state.arena.alloc_copy(&bytes).ok_or(ScratchExhausted)?;
                    state.staged = Some(slice);
                    Ok(slice.len() as i64)
                }
                Err(e) => {
                    debug!("Guest call {name} failed: {e}");
                    // The error text stays retrievable through `result`.
                    let detail = serde_json::json!({ "error": e.kind(), "message": e.message() });
                    if let Ok(bytes) = serde_json::to_vec(&detail) {
                        state.staged = state.arena.alloc_copy(&bytes);
                    }
                    Ok(e.code())
                }
            }
        },
    )?;

    linker.func_wrap(
        MODULE,
        "result",
        |mut caller: Caller<'_, WasmState>, dst: i32, len: i32| -> anyhow::Result<i32> {
            let memory = memory(&mut caller)?;
            let range = span(dst, len)?;
            let (data, state) = memory.data_and_store_mut(&mut caller);
            let Some(bytes) = state.staged.and_then(|slice| state.arena.get(slice)) else {
                return Ok(NOT_FOUND);
            };
            if bytes.len() > range.len() {
                return Ok(INVALID);
            }
            let target = data
                .get_mut(range.start..range.start + bytes.len())
                .ok_or_else(|| anyhow!("guest range {dst}+{len} out of bounds"))?;
            target.copy_from_slice(bytes);
            Ok(bytes.len() as i32)
        },
    )?;

    linker.func_wrap(
        MODULE,
        "log",
        |mut caller: Caller<'_, WasmState>, level: i32, ptr: i32, len: i32| -> anyhow::Result<()> {
            let bytes = read_bytes(&mut caller, ptr, len)?;
            let message = String::from_utf8_lossy(&bytes);
            match level {
                0 => debug!(target: "app", "{message}"),
                1 => info!(target: "app", "{message}"),
                2 => warn!(target: "app", "{message}"),
                _ => error!(target: "app", "{message}"),
            }
            Ok(())
        },
    )?;

    Ok(())
}

fn parse_args(raw: &[u8]) -> Result<serde_json::Value, CapError> {
    if raw.is_empty() {
        return Ok(serde_json::Value::Object(Default::default()));
    }
    serde_json::from_slice(raw).map_err(|e| CapError::InvalidArgument(format!("arguments: {e}")))
}
