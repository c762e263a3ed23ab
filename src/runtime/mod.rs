//! Runtime host: one script engine per process, one request at a time.
//!
//! Two engines implement [`RuntimeHost`]: Lua 5.4 ([`lua::LuaHost`]) and
//! WebAssembly ([`wasm::WasmHost`]). The [`Dispatcher`] and the capability
//! layer only ever see the trait.

pub mod arena;
pub mod dispatcher;
pub mod error;
pub mod lua;
pub mod routes;
pub mod wasm;

use std::path::Path;

use serde_json::json;

use crate::capability::Capabilities;
use crate::manifest::{LimitOverrides, Manifest};

pub use arena::{ArenaSlice, ScratchArena};
pub use dispatcher::{DispatchState, DispatchStats, Dispatcher};
pub use error::HostError;
pub use routes::{HandlerId, RouteMatch, RouteTable, RouteTableBuilder};

/// Largest entry script or module we agree to load.
pub const MAX_SCRIPT_BYTES: u64 = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    Lua,
    Wasm,
}

impl EngineKind {
    /// Picks the engine from the entry point's extension.
    pub fn for_entry(path: &Path) -> Result<Self, HostError> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("lua") => Ok(EngineKind::Lua),
            Some("wasm") | Some("wat") => Ok(EngineKind::Wasm),
            _ => Err(HostError::Load(format!(
                "unsupported entry point {} (expected .lua, .wasm or .wat)",
                path.display()
            ))),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            EngineKind::Lua => "lua",
            EngineKind::Wasm => "wasm",
        }
    }
}

/// Resource budgets applied to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostLimits {
    pub heap_bytes: usize,
    pub stack_bytes: usize,
    /// Engine operations allowed per dispatch (Lua VM instructions or
    /// WebAssembly fuel units).
    pub instruction_budget: u64,
    /// Pending background jobs resumed per drain pass.
    pub drain_iterations: usize,
    pub scratch_bytes: usize,
}

impl Default for HostLimits {
    fn default() -> Self {
        Self {
            heap_bytes: 64 * 1024 * 1024,
            stack_bytes: 1024 * 1024,
            instruction_budget: 50_000_000,
            drain_iterations: 64,
            scratch_bytes: 1024 * 1024,
        }
    }
}

impl HostLimits {
    pub fn with_overrides(mut self, overrides: &LimitOverrides) -> Self {
        if let Some(heap) = overrides.heap_bytes {
            self.heap_bytes = usize::try_from(heap).unwrap_or(usize::MAX);
        }
        if let Some(stack) = overrides.stack_bytes {
            self.stack_bytes = usize::try_from(stack).unwrap_or(usize::MAX);
        }
        if let Some(budget) = overrides.instruction_budget {
            self.instruction_budget = budget;
        }
        self
    }

    /// Largest request body `engine` can stage in the scratch arena.
    ///
    /// Lua copies the raw body. WebAssembly receives the whole request as
    /// JSON, so escaping and headers get two thirds of the arena.
    pub fn max_body_bytes(&self, engine: EngineKind) -> usize {
        match engine {
            EngineKind::Lua => self.scratch_bytes,
            EngineKind::Wasm => self.scratch_bytes / 3,
        }
    }
}

/// An HTTP request as handed over by the server layer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Request {
    pub method: String,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Request {
    pub fn new(method: &str, path: &str) -> Self {
        Self {
            method: method.to_string(),
            path: path.to_string(),
            ..Default::default()
        }
    }

    /// Decodes an `a=1&b=2` query string.
    pub fn with_query_string(mut self, raw: &str) -> Self {
        self.query = url::form_urlencoded::parse(raw.as_bytes())
            .into_owned()
            .collect();
        self
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_ascii_lowercase(), value.to_string()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }
}

/// What a handler sees: the request plus route parameters.
#[derive(Debug, Clone, Copy)]
pub struct RequestView<'a> {
    pub id: &'a str,
    pub request: &'a Request,
    pub params: &'a [(String, String)],
}

impl RequestView<'_> {
    /// JSON form for engines without native tables. Non-UTF-8 bodies are
    /// carried as a blob tag.
    pub fn to_json(&self) -> serde_json::Value {
        let pairs = |items: &[(String, String)]| -> serde_json::Map<String, serde_json::Value> {
            items
                .iter()
                .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
                .collect()
        };
        let body = match std::str::from_utf8(&self.request.body) {
            Ok(s) => serde_json::Value::String(s.to_string()),
            Err(_) => crate::value::Value::Blob(self.request.body.clone()).to_json(),
        };
        json!({
            "id": self.id,
            "method": self.request.method,
            "path": self.request.path,
            "params": pairs(self.params),
            "query": pairs(&self.request.query),
            "headers": pairs(&self.request.headers),
            "body": body,
        })
    }
}

/// Response buffer filled by the handler.
///
/// `status == None` means the handler never set one; the server layer
/// picks the default.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Response {
    pub status: Option<u16>,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Response {
    pub fn clear(&mut self) {
        self.status = None;
        self.headers.clear();
        self.body.clear();
    }

    /// True if the handler produced nothing at all.
    pub fn is_empty(&self) -> bool {
        self.status.is_none() && self.headers.is_empty() && self.body.is_empty()
    }

    /// Replaces an existing header of the same name (case-insensitive).
    pub fn set_header(&mut self, name: &str, value: &str) {
        self.headers.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
        self.headers.push((name.to_string(), value.to_string()));
    }
}

/// Shared contract of both engines.
///
/// Call order: `load_app` → `extract_manifest` → `set_limits` → `grant`,
/// then any number of `reset` / `invoke` / `drain` cycles, then `destroy`.
pub trait RuntimeHost {
    fn engine(&self) -> EngineKind;

    fn limits(&self) -> HostLimits;

    /// Applies new budgets; heap and stack limits take effect immediately.
    fn set_limits(&mut self, limits: HostLimits) -> Result<(), HostError>;

    /// Runs the entry point once to register routes and the manifest.
    fn load_app(&mut self, entry: &Path) -> Result<(), HostError>;

    fn routes(&self) -> &RouteTable;

    /// The declared manifest, or [`Manifest::absent`] when nothing was declared.
    fn extract_manifest(&self) -> Result<Manifest, HostError>;

    /// Hands the capability bundle to the engine. Only the first grant
    /// takes effect.
    fn grant(&mut self, caps: Capabilities) -> Result<(), HostError>;

    fn capabilities(&self) -> Option<&Capabilities>;

    /// Zeroes the instruction counter, resets the scratch arena and
    /// clears the response buffer.
    fn reset(&mut self);

    fn invoke(&mut self, handler: HandlerId, request: &RequestView<'_>) -> Result<Response, HostError>;

    /// Resumes up to `max` pending background jobs; returns how many ran.
    fn drain(&mut self, max: usize) -> Result<usize, HostError>;

    fn pending_jobs(&self) -> usize;

    /// Operations consumed since the last reset.
    fn instructions_used(&self) -> u64;

    fn arena(&self) -> &ScratchArena;

    /// Releases the engine and its buffers. Idempotent.
    fn destroy(&mut self);

    fn is_destroyed(&self) -> bool;
}

/// Builds the engine for `kind`.
pub fn init(kind: EngineKind, limits: HostLimits) -> Result<Box<dyn RuntimeHost>, HostError> {
    Ok(match kind {
        EngineKind::Lua => Box::new(lua::LuaHost::new(limits)?),
        EngineKind::Wasm => Box::new(wasm::WasmHost::new(limits)?),
    })
}

/// Reads an application file, refusing oversized ones.
pub(crate) fn read_source(path: &Path) -> Result<Vec<u8>, HostError> {
    let meta = std::fs::metadata(path)
        .map_err(|e| HostError::Load(format!("{}: {e}", path.display())))?;
    if !meta.is_file() {
        return Err(HostError::Load(format!("{} is not a file", path.display())));
    }
    if meta.len() > MAX_SCRIPT_BYTES {
        return Err(HostError::Load(format!(
            "{} is {} bytes, limit is {MAX_SCRIPT_BYTES}",
            path.display(),
            meta.len()
        )));
    }
    std::fs::read(path).map_err(|e| HostError::Load(format!("{}: {e}", path.display())))
}
