/// Per-request dispatch cycle.
///
/// `Idle → Resetting → Invoking → Marshaling → Draining → Idle`, or
/// straight back to `Idle` when the handler fails. Runs on the single
/// host thread; there is never more than one request in flight.
use std::time::Instant;

use tracing::{debug, error, info, warn};

use super::{HandlerId, HostError, Request, RequestView, Response, RuntimeHost};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    Idle,
    Resetting,
    Invoking,
    Marshaling,
    Draining,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub served: u64,
    pub failed: u64,
    pub budget_aborts: u64,
    pub rollbacks: u64,
}

pub struct Dispatcher {
    host: Box<dyn RuntimeHost>,
    state: DispatchState,
    stats: DispatchStats,
}

impl Dispatcher {
    pub fn new(host: Box<dyn RuntimeHost>) -> Self {
        Self {
            host,
            state: DispatchState::Idle,
            stats: DispatchStats::default(),
        }
    }

    pub fn host(&self) -> &dyn RuntimeHost {
        self.host.as_ref()
    }

    pub fn host_mut(&mut self) -> &mut dyn RuntimeHost {
        self.host.as_mut()
    }

    pub fn state(&self) -> DispatchState {
        self.state
    }

    pub fn stats(&self) -> DispatchStats {
        self.stats
    }

    /// The Resetting step on its own. Safe to repeat.
    pub fn reset(&mut self) {
        self.state = DispatchState::Resetting;
        self.host.reset();
        self.state = DispatchState::Idle;
    }

    /// Looks up the route for `request` and runs its handler.
    pub fn dispatch(&mut self, request: &Request) -> Result<Response, HostError> {
        if self.host.is_destroyed() {
            return Err(HostError::Destroyed);
        }
        let Some(found) = self.host.routes().lookup(&request.method, &request.path) else {
            debug!("No route for {} {}", request.method, request.path);
            return Err(HostError::NoRoute {
                method: request.method.clone(),
                path: request.path.clone(),
            });
        };
        self.dispatch_handler(found.handler, request, &found.params)
    }

    pub fn dispatch_handler(
        &mut self,
        handler: HandlerId,
        request: &Request,
        params: &[(String, String)],
    ) -> Result<Response, HostError> {
        if self.host.is_destroyed() {
            return Err(HostError::Destroyed);
        }
        let id = uuid::Uuid::new_v4().to_string();
        let started = Instant::now();

        self.guard_transaction(&id);
        self.reset_for_dispatch();

        if !self.host.routes().contains_handler(handler) {
            self.state = DispatchState::Idle;
            error!("[{id}] Dispatch to unregistered handler {handler}");
            return Err(HostError::UnknownHandler(handler));
        }

        self.state = DispatchState::Invoking;
        let view = RequestView {
            id: &id,
            request,
            params,
        };
        let result = self.host.invoke(handler, &view);

        self.state = DispatchState::Marshaling;
        let response = match result {
            Ok(response) => response,
            Err(e) => {
                self.stats.failed += 1;
                if e.is_budget() {
                    self.stats.budget_aborts += 1;
                }
                match e.traceback() {
                    Some(tb) => error!(
                        "[{id}] {} {} failed: {e}\n{tb}",
                        request.method, request.path
                    ),
                    None => error!("[{id}] {} {} failed: {e}", request.method, request.path),
                }
                self.state = DispatchState::Idle;
                return Err(e);
            }
        };

        self.state = DispatchState::Draining;
        let max = self.host.limits().drain_iterations;
        match self.host.drain(max) {
            Ok(0) => {}
            Ok(n) => debug!("[{id}] Drained {n} background job(s)"),
            Err(e) => warn!("[{id}] Background job failed: {e}"),
        }

        self.stats.served += 1;
        self.state = DispatchState::Idle;
        debug!(
            "[{id}] {} {} -> {} ({} ops, {:?})",
            request.method,
            request.path,
            response.status.unwrap_or(200),
            self.host.instructions_used(),
            started.elapsed()
        );
        Ok(response)
    }

    fn reset_for_dispatch(&mut self) {
        self.state = DispatchState::Resetting;
        self.host.reset();
    }

    /// Rolls back a transaction a previous request left open.
    fn guard_transaction(&mut self, id: &str) {
        let Some(caps) = self.host.capabilities() else {
            return;
        };
        match caps.db.guard_stale_transaction() {
            Ok(true) => self.stats.rollbacks += 1,
            Ok(false) => {}
            Err(e) => warn!("[{id}] Stale transaction rollback failed: {e}"),
        }
    }

    /// Destroys the host and logs the final statistics.
    pub fn shutdown(&mut self) {
        if self.host.is_destroyed() {
            return;
        }
        self.host.destroy();
        let s = self.stats;
        info!(
            "Runtime host destroyed: {} served, {} failed ({} budget aborts, {} rollbacks)",
            s.served, s.failed, s.budget_aborts, s.rollbacks
        );
    }
}
