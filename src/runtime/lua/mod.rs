//! Lua 5.4 runtime host.
//!
//! The VM only gets the table, string, math, utf8 and coroutine
//! libraries plus a trimmed base library. Dynamic code loading is
//! removed, `require` only resolves capability modules and application
//! modules below the entry script, and a count hook enforces the
//! instruction budget and call-depth ceiling.

mod bindings;

use std::cell::{Cell, OnceCell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use mlua::{
    AnyUserData, ChunkMode, Function, HookTriggers, Lua, LuaOptions, LuaSerdeExt, MultiValue,
    RegistryKey, StdLib, Table, ThreadStatus, UserData, UserDataMethods, Value as LuaValue,
    VmState,
};
use tracing::{debug, info, warn};

use super::{
    read_source, EngineKind, HandlerId, HostError, HostLimits, RequestView, Response,
    RouteTable, RouteTableBuilder, RuntimeHost, ScratchArena,
};
use crate::capability::{CapError, Capabilities, FsConfig};
use crate::manifest::Manifest;

/// VM instructions between two hook calls.
const HOOK_INTERVAL: u32 = 1000;

/// Stack bytes attributed to one Lua call frame when turning
/// `stack_bytes` into a call-depth ceiling.
const FRAME_BYTES: usize = 256;
const MIN_CALL_DEPTH: usize = 32;

/// Jobs allowed to wait in the background queue.
const MAX_PENDING_JOBS: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trip {
    Instructions,
    Stack,
}

impl Trip {
    fn message(self) -> &'static str {
        match self {
            Trip::Instructions => "instruction budget exceeded",
            Trip::Stack => "stack limit exceeded",
        }
    }
}

/// Instruction counter fed by the count hook.
#[derive(Debug)]
struct Meter {
    used: Cell<u64>,
    budget: Cell<u64>,
    max_depth: Cell<usize>,
    tripped: Cell<Option<Trip>>,
}

impl Meter {
    fn new(limits: &HostLimits) -> Self {
        let meter = Self {
            used: Cell::new(0),
            budget: Cell::new(0),
            max_depth: Cell::new(0),
            tripped: Cell::new(None),
        };
        meter.configure(limits);
        meter
    }

    fn configure(&self, limits: &HostLimits) {
        self.budget.set(limits.instruction_budget);
        self.max_depth
            .set((limits.stack_bytes / FRAME_BYTES).max(MIN_CALL_DEPTH));
    }

    fn reset(&self) {
        self.used.set(0);
        self.tripped.set(None);
    }

    /// Raises the pending trip, if any, as a Lua error.
    fn check(&self) -> mlua::Result<()> {
        match self.tripped.get() {
            Some(trip) => Err(mlua::Error::RuntimeError(trip.message().to_string())),
            None => Ok(()),
        }
    }
}

struct Job {
    thread: RegistryKey,
    /// Arguments for the first resume; `None` once started.
    start: Option<RegistryKey>,
}

/// State shared between the host and the functions installed in the VM.
struct AppState {
    meter: Meter,
    caps: OnceCell<Capabilities>,
    /// `Some` only while the entry script runs.
    builder: RefCell<Option<RouteTableBuilder>>,
    handlers: RefCell<Vec<RegistryKey>>,
    middleware: RefCell<Vec<RegistryKey>>,
    manifest: RefCell<Option<Manifest>>,
    jobs: RefCell<VecDeque<Job>>,
    app_dir: RefCell<Option<PathBuf>>,
    /// Application modules already loaded by `require`.
    modules: RefCell<HashMap<String, RegistryKey>>,
    loading_modules: RefCell<Vec<String>>,
}

impl AppState {
    fn new(limits: &HostLimits) -> Self {
        Self {
            meter: Meter::new(limits),
            caps: OnceCell::new(),
            builder: RefCell::new(None),
            handlers: RefCell::new(Vec::new()),
            middleware: RefCell::new(Vec::new()),
            manifest: RefCell::new(None),
            jobs: RefCell::new(VecDeque::new()),
            app_dir: RefCell::new(None),
            modules: RefCell::new(HashMap::new()),
            loading_modules: RefCell::new(Vec::new()),
        }
    }

    fn caps(&self) -> Result<&Capabilities, CapError> {
        self.caps.get().ok_or_else(|| {
            CapError::Denied("capabilities are not available while the application loads".into())
        })
    }

    fn loading(&self) -> bool {
        self.builder.borrow().is_some()
    }

    /// Forgets everything registered by a load attempt.
    fn clear_registrations(&self) {
        self.builder.borrow_mut().take();
        self.handlers.borrow_mut().clear();
        self.middleware.borrow_mut().clear();
        self.manifest.borrow_mut().take();
        self.jobs.borrow_mut().clear();
        self.modules.borrow_mut().clear();
        self.loading_modules.borrow_mut().clear();
    }
}

/// `res` object passed to handlers.
struct LuaResponse(Rc<RefCell<Response>>);

impl UserData for LuaResponse {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_function("status", |_, (ud, code): (AnyUserData, u16)| {
            if !(100..=999).contains(&code) {
                return Err(mlua::Error::RuntimeError(format!("invalid status code {code}")));
            }
            ud.borrow::<LuaResponse>()?.0.borrow_mut().status = Some(code);
            Ok(ud)
        });
        methods.add_function(
            "header",
            |_, (ud, name, value): (AnyUserData, String, String)| {
                if name.contains(['\r', '\n', ':']) || value.contains(['\r', '\n']) {
                    return Err(mlua::Error::RuntimeError(format!(
                        "invalid header '{name}'"
                    )));
                }
                ud.borrow::<LuaResponse>()?
                    .0
                    .borrow_mut()
                    .set_header(&name, &value);
                Ok(ud)
            },
        );
        methods.add_function("send", |_, (ud, body): (AnyUserData, Option<mlua::String>)| {
            if let Some(body) = body {
                ud.borrow::<LuaResponse>()?
                    .0
                    .borrow_mut()
                    .body
                    .extend_from_slice(&body.as_bytes());
            }
            Ok(ud)
        });
        methods.add_function("json", |lua, (ud, value): (AnyUserData, LuaValue)| {
            let json: serde_json::Value = lua.from_value(value)?;
            let body = serde_json::to_vec(&json).map_err(mlua::Error::external)?;
            {
                let this = ud.borrow::<LuaResponse>()?;
                let mut res = this.0.borrow_mut();
                res.set_header("content-type", "application/json");
                res.body = body;
            }
            Ok(ud)
        });
    }
}

pub struct LuaHost {
    lua: Option<Lua>,
    state: Rc<AppState>,
    routes: RouteTable,
    limits: HostLimits,
    arena: ScratchArena,
    response: Rc<RefCell<Response>>,
}

fn init_err(e: mlua::Error) -> HostError {
    HostError::Init(e.to_string())
}

impl LuaHost {
    pub fn new(limits: HostLimits) -> Result<Self, HostError> {
        let lua = Lua::new_with(
            StdLib::TABLE | StdLib::STRING | StdLib::MATH | StdLib::UTF8 | StdLib::COROUTINE,
            LuaOptions::default(),
        )
        .map_err(init_err)?;
        let state = Rc::new(AppState::new(&limits));

        harden_globals(&lua, &state).map_err(init_err)?;
        bindings::install(&lua, &state).map_err(init_err)?;
        install_app_api(&lua, &state).map_err(init_err)?;
        install_hook(&lua, &state);
        lua.set_memory_limit(limits.heap_bytes).map_err(init_err)?;

        debug!("Lua runtime initialized ({} byte heap)", limits.heap_bytes);
        Ok(Self {
            lua: Some(lua),
            state,
            routes: RouteTable::default(),
            limits,
            arena: ScratchArena::new(limits.scratch_bytes),
            response: Rc::new(RefCell::new(Response::default())),
        })
    }

    fn lua(&self) -> Result<&Lua, HostError> {
        self.lua.as_ref().ok_or(HostError::Destroyed)
    }

    /// Maps an error coming out of the VM onto the host taxonomy.
    fn classify(&self, err: mlua::Error) -> HostError {
        match self.state.meter.tripped.get() {
            Some(Trip::Instructions) => {
                return HostError::BudgetExceeded {
                    budget: "instructions",
                }
            }
            Some(Trip::Stack) => return HostError::StackExceeded,
            None => {}
        }
        match err {
            mlua::Error::MemoryError(_) => HostError::BudgetExceeded { budget: "heap" },
            mlua::Error::CallbackError { traceback, cause } => {
                let inner = self.classify((*cause).clone());
                match inner {
                    HostError::Script { message, .. } => HostError::Script {
                        message,
                        traceback: Some(traceback),
                    },
                    other => other,
                }
            }
            other => {
                let text = other.to_string();
                if text.contains("stack overflow") {
                    return HostError::StackExceeded;
                }
                let (message, traceback) = split_traceback(&text);
                HostError::Script {
                    message,
                    traceback,
                }
            }
        }
    }

    fn run_handler(&self, lua: &Lua, handler: HandlerId, req: Table) -> mlua::Result<()> {
        let res = lua.create_userdata(LuaResponse(Rc::clone(&self.response)))?;

        let middleware: Vec<Function> = self
            .state
            .middleware
            .borrow()
            .iter()
            .map(|key| lua.registry_value::<Function>(key))
            .collect::<mlua::Result<_>>()?;
        for mw in middleware {
            let verdict: LuaValue = mw.call((req.clone(), res.clone()))?;
            if verdict == LuaValue::Boolean(false) {
                debug!("Middleware stopped the chain before handler {handler}");
                return Ok(());
            }
        }

        let func = {
            let handlers = self.state.handlers.borrow();
            let key = handlers
                .get(handler.0 as usize)
                .ok_or_else(|| mlua::Error::RuntimeError(format!("no handler {handler}")))?;
            lua.registry_value::<Function>(key)?
        };
        func.call::<()>((req, res))
    }
}

/// Builds the `req` table. The body is staged through the scratch arena.
fn build_request(
    lua: &Lua,
    arena: &mut ScratchArena,
    view: &RequestView<'_>,
) -> Result<Table, HostError> {
    let body = arena
        .alloc_copy(&view.request.body)
        .ok_or(HostError::BudgetExceeded { budget: "scratch" })?;
    let body = arena.get(body).unwrap_or_default();

    let pairs = |items: &[(String, String)]| -> mlua::Result<Table> {
        let t = lua.create_table()?;
        for (k, v) in items {
            t.raw_set(k.as_str(), v.as_str())?;
        }
        Ok(t)
    };
    let build = || -> mlua::Result<Table> {
        let req = lua.create_table()?;
        req.raw_set("id", view.id)?;
        req.raw_set("method", view.request.method.as_str())?;
        req.raw_set("path", view.request.path.as_str())?;
        req.raw_set("params", pairs(view.params)?)?;
        req.raw_set("query", pairs(&view.request.query)?)?;
        req.raw_set("headers", pairs(&view.request.headers)?)?;
        req.raw_set("body", lua.create_string(body)?)?;
        req.raw_set("ctx", lua.create_table()?)?;
        Ok(req)
    };
    build().map_err(|e| HostError::script(e.to_string()))
}

/// Splits "message\nstack traceback:\n..." into its two halves.
fn split_traceback(text: &str) -> (String, Option<String>) {
    match text.split_once("\nstack traceback:") {
        Some((message, rest)) => (
            message.trim_end().to_string(),
            Some(format!("stack traceback:{rest}")),
        ),
        None => (text.to_string(), None),
    }
}

/// Removes dynamic code loading and replaces `print`. Also rewraps the
/// protected-call primitives so a script cannot swallow a budget abort.
fn harden_globals(lua: &Lua, state: &Rc<AppState>) -> mlua::Result<()> {
    let globals = lua.globals();
    for name in ["load", "loadfile", "dofile", "collectgarbage"] {
        globals.raw_set(name, LuaValue::Nil)?;
    }
    let string: Table = globals.get("string")?;
    string.raw_set("dump", LuaValue::Nil)?;

    let print = lua.create_function(|lua, args: MultiValue| {
        let tostring: Function = lua.globals().get("tostring")?;
        let mut parts = Vec::with_capacity(args.len());
        for arg in args {
            parts.push(tostring.call::<String>(arg)?);
        }
        info!(target: "app", "{}", parts.join("\t"));
        Ok(())
    })?;
    globals.raw_set("print", print)?;

    let guard_state = Rc::clone(state);
    let guard = lua.create_function(move |_, ()| guard_state.meter.check())?;
    let coroutine: Table = globals.get("coroutine")?;
    lua.load(
        r#"
        local guard, raw_pcall, raw_xpcall, coroutine = ...
        local raw_resume = coroutine.resume
        local function checked(...)
          guard()
          return ...
        end
        pcall = function(f, ...) return checked(raw_pcall(f, ...)) end
        xpcall = function(f, h, ...) return checked(raw_xpcall(f, h, ...)) end
        coroutine.resume = function(co, ...) return checked(raw_resume(co, ...)) end
        "#,
    )
    .set_name("=host")
    .call::<()>((
        guard,
        globals.get::<Function>("pcall")?,
        globals.get::<Function>("xpcall")?,
        coroutine,
    ))?;
    Ok(())
}

fn install_hook(lua: &Lua, state: &Rc<AppState>) {
    let state = Rc::clone(state);
    lua.set_hook(
        HookTriggers::new().every_nth_instruction(HOOK_INTERVAL),
        move |lua, _debug| {
            let meter = &state.meter;
            meter
                .used
                .set(meter.used.get().saturating_add(u64::from(HOOK_INTERVAL)));
            if meter.tripped.get().is_none() {
                if meter.used.get() > meter.budget.get() {
                    meter.tripped.set(Some(Trip::Instructions));
                } else if lua.inspect_stack(meter.max_depth.get()).is_some() {
                    meter.tripped.set(Some(Trip::Stack));
                }
            }
            meter.check()?;
            Ok(VmState::Continue)
        },
    );
}

/// Installs the `app` global: route registration, middleware, manifest
/// declaration and background jobs.
fn install_app_api(lua: &Lua, state: &Rc<AppState>) -> mlua::Result<()> {
    let app = lua.create_table()?;

    let s = Rc::clone(state);
    let route = lua.create_function(
        move |lua, (method, path, handler): (String, String, Function)| {
            register_route(lua, &s, &method, &path, handler)
        },
    )?;
    app.raw_set("route", route)?;

    for method in ["get", "post", "put", "patch", "delete"] {
        let s = Rc::clone(state);
        let upper = method.to_ascii_uppercase();
        let f = lua.create_function(move |lua, (path, handler): (String, Function)| {
            register_route(lua, &s, &upper, &path, handler)
        })?;
        app.raw_set(method, f)?;
    }

    let s = Rc::clone(state);
    let before = lua.create_function(move |lua, handler: Function| {
        if !s.loading() {
            return Err(mlua::Error::RuntimeError(
                "middleware can only be added while the application loads".into(),
            ));
        }
        let key = lua.create_registry_value(handler)?;
        s.middleware.borrow_mut().push(key);
        Ok(())
    })?;
    app.raw_set("before", before)?;

    let s = Rc::clone(state);
    let manifest = lua.create_function(move |lua, decl: Table| {
        if !s.loading() {
            return Err(mlua::Error::RuntimeError(
                "the manifest can only be declared while the application loads".into(),
            ));
        }
        if s.manifest.borrow().is_some() {
            return Err(mlua::Error::RuntimeError("manifest already declared".into()));
        }
        let parsed: Manifest = lua.from_value(LuaValue::Table(decl))?;
        *s.manifest.borrow_mut() = Some(parsed.declared());
        Ok(())
    })?;
    app.raw_set("manifest", manifest)?;

    let s = Rc::clone(state);
    let defer = lua.create_function(move |lua, (func, args): (Function, MultiValue)| {
        if s.jobs.borrow().len() >= MAX_PENDING_JOBS {
            return Err(mlua::Error::RuntimeError("too many pending background jobs".into()));
        }
        let thread = lua.create_thread(func)?;
        let packed = lua.create_sequence_from(args)?;
        s.jobs.borrow_mut().push_back(Job {
            thread: lua.create_registry_value(thread)?,
            start: Some(lua.create_registry_value(packed)?),
        });
        Ok(())
    })?;
    app.raw_set("defer", defer)?;

    lua.globals().raw_set("app", app)?;
    Ok(())
}

fn register_route(
    lua: &Lua,
    state: &AppState,
    method: &str,
    path: &str,
    handler: Function,
) -> mlua::Result<()> {
    let mut builder = state.builder.borrow_mut();
    let Some(builder) = builder.as_mut() else {
        return Err(mlua::Error::RuntimeError(
            "routes can only be registered while the application loads".into(),
        ));
    };
    let mut handlers = state.handlers.borrow_mut();
    let id = HandlerId(handlers.len() as u32);
    builder
        .add(method, path, id)
        .map_err(|e| mlua::Error::RuntimeError(e.to_string()))?;
    handlers.push(lua.create_registry_value(handler)?);
    debug!("Registered {method} {path} as {id}");
    Ok(())
}

/// Resolves a dotted module name below the application directory.
fn module_path(name: &str) -> Result<String, CapError> {
    let valid = !name.is_empty()
        && name
            .split('.')
            .all(|seg| !seg.is_empty() && seg.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-'));
    if !valid {
        return Err(CapError::InvalidArgument(format!("invalid module name '{name}'")));
    }
    Ok(format!("{}.lua", name.replace('.', "/")))
}

pub(super) fn require_app_module(lua: &Lua, state: &AppState, name: &str) -> mlua::Result<LuaValue> {
    if let Some(key) = state.modules.borrow().get(name) {
        return lua.registry_value(key);
    }
    if state.loading_modules.borrow().iter().any(|m| m == name) {
        return Err(mlua::Error::RuntimeError(format!("circular require of '{name}'")));
    }
    let dir = state
        .app_dir
        .borrow()
        .clone()
        .ok_or_else(|| mlua::Error::RuntimeError("no application loaded".into()))?;

    let rel = module_path(name).map_err(|e| mlua::Error::RuntimeError(e.to_string()))?;
    let source = FsConfig::permissive(&dir)
        .and_then(|fs| crate::capability::fs::read(&fs, &rel))
        .map_err(|e| mlua::Error::RuntimeError(format!("module '{name}': {e}")))?;

    state.loading_modules.borrow_mut().push(name.to_string());
    let result = lua
        .load(source)
        .set_name(format!("@{rel}"))
        .set_mode(ChunkMode::Text)
        .call::<LuaValue>(name);
    state.loading_modules.borrow_mut().retain(|m| m != name);

    let value = match result? {
        LuaValue::Nil => LuaValue::Boolean(true),
        v => v,
    };
    let key = lua.create_registry_value(value.clone())?;
    state.modules.borrow_mut().insert(name.to_string(), key);
    Ok(value)
}

impl RuntimeHost for LuaHost {
    fn engine(&self) -> EngineKind {
        EngineKind::Lua
    }

    fn limits(&self) -> HostLimits {
        self.limits
    }

    fn set_limits(&mut self, limits: HostLimits) -> Result<(), HostError> {
        self.lua()?
            .set_memory_limit(limits.heap_bytes)
            .map_err(init_err)?;
        self.state.meter.configure(&limits);
        self.arena.set_capacity(limits.scratch_bytes);
        self.limits = limits;
        Ok(())
    }

    fn load_app(&mut self, entry: &Path) -> Result<(), HostError> {
        if !self.routes.is_empty() || self.state.manifest.borrow().is_some() {
            return Err(HostError::Load("application already loaded".into()));
        }
        let source = read_source(entry)?;
        let dir = entry
            .parent()
            .map(|p| if p.as_os_str().is_empty() { Path::new(".") } else { p })
            .unwrap_or(Path::new("."))
            .canonicalize()
            .map_err(|e| HostError::Load(format!("{}: {e}", entry.display())))?;
        let chunk_name = entry
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "app.lua".to_string());

        *self.state.app_dir.borrow_mut() = Some(dir);
        *self.state.builder.borrow_mut() = Some(RouteTableBuilder::new());
        self.state.meter.reset();

        let result = self
            .lua()?
            .load(source)
            .set_name(format!("@{chunk_name}"))
            .set_mode(ChunkMode::Text)
            .exec();

        if let Err(e) = result {
            let err = match self.classify(e) {
                HostError::Script { message, .. } => message,
                other => other.to_string(),
            };
            self.state.clear_registrations();
            self.state.meter.reset();
            return Err(HostError::Load(format!("{}: {err}", entry.display())));
        }

        let builder = self.state.builder.borrow_mut().take().unwrap_or_default();
        self.routes = builder.freeze();
        self.state.meter.reset();
        info!(
            "Loaded {} ({} route(s), {} middleware)",
            entry.display(),
            self.routes.len(),
            self.state.middleware.borrow().len()
        );
        Ok(())
    }

    fn routes(&self) -> &RouteTable {
        &self.routes
    }

    fn extract_manifest(&self) -> Result<Manifest, HostError> {
        Ok(self
            .state
            .manifest
            .borrow()
            .clone()
            .unwrap_or_else(Manifest::absent))
    }

    fn grant(&mut self, caps: Capabilities) -> Result<(), HostError> {
        if self.state.caps.set(caps).is_err() {
            warn!("Capabilities already granted; ignoring second grant");
        }
        Ok(())
    }

    fn capabilities(&self) -> Option<&Capabilities> {
        self.state.caps.get()
    }

    fn reset(&mut self) {
        self.state.meter.reset();
        self.arena.reset();
        self.response.borrow_mut().clear();
    }

    fn invoke(&mut self, handler: HandlerId, request: &RequestView<'_>) -> Result<Response, HostError> {
        let lua = self.lua.as_ref().ok_or(HostError::Destroyed)?;
        if handler.0 as usize >= self.state.handlers.borrow().len() {
            return Err(HostError::UnknownHandler(handler));
        }
        let req = build_request(lua, &mut self.arena, request)?;
        self.run_handler(lua, handler, req)
            .map_err(|e| self.classify(e))?;
        Ok(std::mem::take(&mut *self.response.borrow_mut()))
    }

    fn drain(&mut self, max: usize) -> Result<usize, HostError> {
        let lua = self.lua()?;
        let mut ran = 0;
        while ran < max {
            let Some(mut job) = self.state.jobs.borrow_mut().pop_front() else {
                break;
            };
            ran += 1;
            let thread: mlua::Thread = lua
                .registry_value(&job.thread)
                .map_err(|e| HostError::script(e.to_string()))?;
            let args = match job.start.take() {
                Some(key) => {
                    let packed: Table = lua
                        .registry_value(&key)
                        .map_err(|e| HostError::script(e.to_string()))?;
                    packed
                        .sequence_values::<LuaValue>()
                        .collect::<mlua::Result<MultiValue>>()
                        .map_err(|e| HostError::script(e.to_string()))?
                }
                None => MultiValue::new(),
            };
            if let Err(e) = thread.resume::<MultiValue>(args) {
                let err = self.classify(e);
                if err.is_budget() {
                    return Err(err);
                }
                warn!("Background job failed: {err}");
                continue;
            }
            if thread.status() == ThreadStatus::Resumable {
                self.state.jobs.borrow_mut().push_back(job);
            }
        }
        Ok(ran)
    }

    fn pending_jobs(&self) -> usize {
        self.state.jobs.borrow().len()
    }

    fn instructions_used(&self) -> u64 {
        self.state.meter.used.get()
    }

    fn arena(&self) -> &ScratchArena {
        &self.arena
    }

    fn destroy(&mut self) {
        if self.lua.is_none() {
            return;
        }
        self.state.clear_registrations();
        self.routes = RouteTable::default();
        self.arena.release();
        self.response.borrow_mut().clear();
        self.lua = None;
        debug!("Lua runtime destroyed");
    }

    fn is_destroyed(&self) -> bool {
        self.lua.is_none()
    }
}

#[cfg(test)]
mod tests;
