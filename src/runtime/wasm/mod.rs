//! WebAssembly runtime host.
//!
//! Guests talk to the host only through the imports in [`abi`]; no WASI
//! is linked, so a module importing anything else fails to load. Fuel
//! meters the instruction budget, a store limiter caps linear memory and
//! the engine's stack ceiling bounds recursion.
//!
//! Guest exports: `memory`, `alloc(len) -> ptr`, `handle(handler, ptr,
//! len) -> i32` and optionally `init()`, which runs once at load time to
//! register routes and the manifest.

mod abi;

use std::path::Path;

use anyhow::anyhow;
use tracing::{debug, info, warn};
use wasmtime::{
    Config, Engine, Linker, Memory, Module, ResourceLimiter, Store, Trap, TypedFunc,
    WasmBacktrace,
};

use super::{
    read_source, ArenaSlice, EngineKind, HandlerId, HostError, HostLimits, RequestView,
    Response, RouteTable, RouteTableBuilder, RuntimeHost, ScratchArena,
};
use crate::capability::Capabilities;
use crate::manifest::Manifest;

/// Floor for the engine's stack ceiling.
const MIN_STACK_BYTES: usize = 64 * 1024;

const MAX_TABLE_ELEMENTS: usize = 100_000;

#[derive(Debug, thiserror::Error)]
#[error("linear memory would grow to {desired} bytes, limit is {limit}")]
struct HeapExhausted {
    desired: usize,
    limit: usize,
}

/// Caps linear memory growth; exceeding it traps instead of failing
/// `memory.grow` quietly.
struct HeapLimiter {
    max_bytes: usize,
}

impl ResourceLimiter for HeapLimiter {
    fn memory_growing(
        &mut self,
        _current: usize,
        desired: usize,
        _maximum: Option<usize>,
    ) -> anyhow::Result<bool> {
        if desired > self.max_bytes {
            return Err(HeapExhausted {
                desired,
                limit: self.max_bytes,
            }
            .into());
        }
        Ok(true)
    }

    fn table_growing(
        &mut self,
        _current: usize,
        desired: usize,
        _maximum: Option<usize>,
    ) -> anyhow::Result<bool> {
        Ok(desired <= MAX_TABLE_ELEMENTS)
    }
}

/// Per-store data reachable from the host imports.
pub struct WasmState {
    limiter: HeapLimiter,
    arena: ScratchArena,
    response: Response,
    caps: Option<Capabilities>,
    /// `Some` only while the module instantiates and runs `init`.
    builder: Option<RouteTableBuilder>,
    manifest: Option<Manifest>,
    /// Result of the last `call`, waiting to be copied out by `result`.
    staged: Option<ArenaSlice>,
}

impl WasmState {
    fn new(limits: &HostLimits) -> Self {
        Self {
            limiter: HeapLimiter {
                max_bytes: limits.heap_bytes,
            },
            arena: ScratchArena::new(limits.scratch_bytes),
            response: Response::default(),
            caps: None,
            builder: None,
            manifest: None,
            staged: None,
        }
    }
}

struct Guest {
    memory: Memory,
    alloc: TypedFunc<i32, i32>,
    handle: TypedFunc<(i32, i32, i32), i32>,
}

pub struct WasmHost {
    engine: Engine,
    linker: Linker<WasmState>,
    store: Store<WasmState>,
    guest: Option<Guest>,
    routes: RouteTable,
    limits: HostLimits,
    destroyed: bool,
}

fn init_err(e: anyhow::Error) -> HostError {
    HostError::Init(format!("{e:#}"))
}

fn new_store(engine: &Engine, limits: &HostLimits) -> Result<Store<WasmState>, HostError> {
    let mut store = Store::new(engine, WasmState::new(limits));
    store.limiter(|state| &mut state.limiter);
    store.set_fuel(limits.instruction_budget).map_err(init_err)?;
    Ok(store)
}

/// Maps an error coming out of the guest onto the host taxonomy.
fn classify(err: anyhow::Error) -> HostError {
    match err.downcast_ref::<Trap>() {
        Some(Trap::OutOfFuel) => {
            return HostError::BudgetExceeded {
                budget: "instructions",
            }
        }
        Some(Trap::StackOverflow) => return HostError::StackExceeded,
        _ => {}
    }
    if err.downcast_ref::<HeapExhausted>().is_some() {
        return HostError::BudgetExceeded { budget: "heap" };
    }
    if err.downcast_ref::<abi::ScratchExhausted>().is_some() {
        return HostError::BudgetExceeded { budget: "scratch" };
    }
    let traceback = err
        .downcast_ref::<WasmBacktrace>()
        .map(|bt| bt.to_string())
        .filter(|bt| !bt.is_empty());
    HostError::Script {
        message: err.root_cause().to_string(),
        traceback,
    }
}

impl WasmHost {
    pub fn new(limits: HostLimits) -> Result<Self, HostError> {
        let mut config = Config::new();
        config
            .consume_fuel(true)
            .max_wasm_stack(limits.stack_bytes.max(MIN_STACK_BYTES));
        let engine = Engine::new(&config).map_err(init_err)?;

        let mut linker = Linker::new(&engine);
        abi::link(&mut linker).map_err(init_err)?;
        let store = new_store(&engine, &limits)?;

        debug!("WebAssembly runtime initialized ({} byte heap)", limits.heap_bytes);
        Ok(Self {
            engine,
            linker,
            store,
            guest: None,
            routes: RouteTable::default(),
            limits,
            destroyed: false,
        })
    }

    fn instantiate(&mut self, module: &Module) -> anyhow::Result<Guest> {
        let instance = self.linker.instantiate(&mut self.store, module)?;
        let memory = instance
            .get_memory(&mut self.store, "memory")
            .ok_or_else(|| anyhow!("module does not export 'memory'"))?;
        let alloc = instance.get_typed_func::<i32, i32>(&mut self.store, "alloc")?;
        let handle = instance.get_typed_func::<(i32, i32, i32), i32>(&mut self.store, "handle")?;
        if let Some(init) = instance.get_func(&mut self.store, "init") {
            init.typed::<(), ()>(&self.store)?.call(&mut self.store, ())?;
        }
        Ok(Guest {
            memory,
            alloc,
            handle,
        })
    }

    /// Copies the request JSON into guest memory through `alloc`.
    fn write_request(&mut self, guest: &Guest, view: &RequestView<'_>) -> Result<(i32, i32), HostError> {
        let payload =
            serde_json::to_vec(&view.to_json()).map_err(|e| HostError::script(e.to_string()))?;
        let len = i32::try_from(payload.len())
            .map_err(|_| HostError::BudgetExceeded { budget: "scratch" })?;
        let staged = self
            .store
            .data_mut()
            .arena
            .alloc_copy(&payload)
            .ok_or(HostError::BudgetExceeded { budget: "scratch" })?;

        let ptr = guest.alloc.call(&mut self.store, len).map_err(classify)?;

        let (data, state) = guest.memory.data_and_store_mut(&mut self.store);
        let bytes = state
            .arena
            .get(staged)
            .ok_or(HostError::BudgetExceeded { budget: "scratch" })?;
        let range = abi::span(ptr, len).map_err(|e| HostError::script(e.to_string()))?;
        data.get_mut(range)
            .ok_or_else(|| HostError::script(format!("alloc returned out-of-bounds pointer {ptr}")))?
            .copy_from_slice(bytes);
        Ok((ptr, len))
    }
}

impl RuntimeHost for WasmHost {
    fn engine(&self) -> EngineKind {
        EngineKind::Wasm
    }

    fn limits(&self) -> HostLimits {
        self.limits
    }

    fn set_limits(&mut self, mut limits: HostLimits) -> Result<(), HostError> {
        if self.destroyed {
            return Err(HostError::Destroyed);
        }
        if limits.stack_bytes != self.limits.stack_bytes {
            debug!(
                "WebAssembly stack ceiling is fixed at {} bytes for this engine",
                self.limits.stack_bytes
            );
            limits.stack_bytes = self.limits.stack_bytes;
        }
        let state = self.store.data_mut();
        state.limiter.max_bytes = limits.heap_bytes;
        state.arena.set_capacity(limits.scratch_bytes);
        self.store
            .set_fuel(limits.instruction_budget)
            .map_err(init_err)?;
        self.limits = limits;
        Ok(())
    }

    fn load_app(&mut self, entry: &Path) -> Result<(), HostError> {
        if self.destroyed {
            return Err(HostError::Destroyed);
        }
        if self.guest.is_some() {
            return Err(HostError::Load("application already loaded".into()));
        }
        let bytes = read_source(entry)?;
        let module = Module::new(&self.engine, &bytes)
            .map_err(|e| HostError::Load(format!("{}: {e:#}", entry.display())))?;

        self.store.data_mut().builder = Some(RouteTableBuilder::new());
        self.store
            .set_fuel(self.limits.instruction_budget)
            .map_err(init_err)?;
        let result = self.instantiate(&module);
        let builder = self.store.data_mut().builder.take();

        let guest = match result {
            Ok(guest) => guest,
            Err(e) => {
                self.store.data_mut().manifest = None;
                return Err(HostError::Load(format!(
                    "{}: {}",
                    entry.display(),
                    classify(e)
                )));
            }
        };
        self.routes = builder.unwrap_or_default().freeze();
        self.guest = Some(guest);
        self.reset();
        info!(
            "Loaded {} ({} route(s))",
            entry.display(),
            self.routes.len()
        );
        Ok(())
    }

    fn routes(&self) -> &RouteTable {
        &self.routes
    }

    fn extract_manifest(&self) -> Result<Manifest, HostError> {
        Ok(self
            .store
            .data()
            .manifest
            .clone()
            .unwrap_or_else(Manifest::absent))
    }

    fn grant(&mut self, caps: Capabilities) -> Result<(), HostError> {
        let state = self.store.data_mut();
        if state.caps.is_some() {
            warn!("Capabilities already granted; ignoring second grant");
            return Ok(());
        }
        state.caps = Some(caps);
        Ok(())
    }

    fn capabilities(&self) -> Option<&Capabilities> {
        self.store.data().caps.as_ref()
    }

    fn reset(&mut self) {
        let state = self.store.data_mut();
        state.arena.reset();
        state.response.clear();
        state.staged = None;
        if let Err(e) = self.store.set_fuel(self.limits.instruction_budget) {
            warn!("Could not refuel the WebAssembly store: {e}");
        }
    }

    fn invoke(&mut self, handler: HandlerId, request: &RequestView<'_>) -> Result<Response, HostError> {
        if self.destroyed {
            return Err(HostError::Destroyed);
        }
        let guest = self.guest.take().ok_or(HostError::UnknownHandler(handler))?;
        let result = self.write_request(&guest, request).and_then(|(ptr, len)| {
            guest
                .handle
                .call(&mut self.store, (handler.0 as i32, ptr, len))
                .map_err(classify)
        });
        self.guest = Some(guest);

        match result? {
            0 => Ok(std::mem::take(&mut self.store.data_mut().response)),
            rc => Err(HostError::script(format!("handler {handler} returned {rc}"))),
        }
    }

    fn drain(&mut self, _max: usize) -> Result<usize, HostError> {
        if self.destroyed {
            return Err(HostError::Destroyed);
        }
        Ok(0)
    }

    fn pending_jobs(&self) -> usize {
        0
    }

    fn instructions_used(&self) -> u64 {
        let left = self.store.get_fuel().unwrap_or(0);
        self.limits.instruction_budget.saturating_sub(left)
    }

    fn arena(&self) -> &ScratchArena {
        &self.store.data().arena
    }

    fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.guest = None;
        self.routes = RouteTable::default();
        let released = HostLimits {
            scratch_bytes: 0,
            ..self.limits
        };
        // Dropping the old store frees the instance and the capabilities.
        self.store = Store::new(&self.engine, WasmState::new(&released));
        self.destroyed = true;
        debug!("WebAssembly runtime destroyed");
    }

    fn is_destroyed(&self) -> bool {
        self.destroyed
    }
}
