//! Routers: pre-start route trees under hierarchical name prefixes.
//!
//! Routes registered on a router are deferred: they become real routes
//! when the router (directly or through its parents) is included into an
//! app, at which point prefixes are joined with `:` into the final route
//! name (`level1:level2:test2`). Scheduling through a deferred route
//! before that errors.
//!
//! `include_router` takes the child by value, so a router can be
//! attached exactly once and cycles cannot be expressed.

use crate::error::{Error, Result, TaskError};
use crate::middleware::{JobContext, Middleware};
use crate::route::{Route, RouteOptions, ScheduleBuilder};
use crate::runner::{self, Handler};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::sync::{Arc, OnceLock};

/// A pre-start tree node collecting registrations under a prefix.
pub struct Router {
    prefix: String,
    middleware: Vec<Arc<dyn Middleware>>,
    pending: Vec<PendingRoute>,
    children: Vec<Router>,
}

pub(crate) struct PendingRoute {
    name: String,
    options: RouteOptions,
    handler: Handler,
    slot: Arc<OnceLock<Route>>,
}

/// A route registered on a router that has not reached an app yet.
///
/// The handle stays valid across `include_router`; after inclusion it
/// schedules through the promoted route.
#[derive(Clone)]
pub struct DeferredRoute {
    local_name: String,
    slot: Arc<OnceLock<Route>>,
}

impl DeferredRoute {
    /// The full prefixed name, once attached to an app.
    pub fn name(&self) -> Option<String> {
        self.slot.get().map(|route| route.name().to_string())
    }

    /// The promoted route, once attached to an app.
    pub fn route(&self) -> Option<Route> {
        self.slot.get().cloned()
    }

    pub fn schedule(&self, args: impl Serialize) -> Result<ScheduleBuilder> {
        match self.slot.get() {
            Some(route) => route.schedule(args),
            None => Err(Error::RouteNotAttached {
                name: self.local_name.clone(),
            }),
        }
    }
}

impl std::fmt::Debug for DeferredRoute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeferredRoute")
            .field("local_name", &self.local_name)
            .field("attached", &self.slot.get().is_some())
            .finish()
    }
}

impl Router {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            middleware: Vec::new(),
            pending: Vec::new(),
            children: Vec::new(),
        }
    }

    /// Middleware applied to every route of this router and its
    /// children, between app middleware and the built-ins.
    pub fn add_middleware(&mut self, middleware: impl Middleware + 'static) {
        self.middleware.push(Arc::new(middleware));
    }

    /// Register an async handler under this router's prefix.
    pub fn register_async<A, R, F, Fut>(
        &mut self,
        name: &str,
        options: RouteOptions,
        handler: F,
    ) -> Result<DeferredRoute>
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + 'static,
        F: Fn(A, JobContext) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, TaskError>> + Send + 'static,
    {
        self.register(name, options, Handler::Async(runner::erase_async(handler)))
    }

    /// Register a blocking handler under this router's prefix.
    pub fn register_blocking<A, R, F>(
        &mut self,
        name: &str,
        options: RouteOptions,
        handler: F,
    ) -> Result<DeferredRoute>
    where
        A: DeserializeOwned,
        R: Serialize,
        F: Fn(A, JobContext) -> std::result::Result<R, TaskError> + Send + Sync + 'static,
    {
        self.register(name, options, Handler::Blocking(runner::erase_blocking(handler)))
    }

    fn register(
        &mut self,
        name: &str,
        options: RouteOptions,
        handler: Handler,
    ) -> Result<DeferredRoute> {
        options.validate()?;
        let slot = Arc::new(OnceLock::new());
        self.pending.push(PendingRoute {
            name: name.to_string(),
            options,
            handler,
            slot: slot.clone(),
        });
        Ok(DeferredRoute {
            local_name: name.to_string(),
            slot,
        })
    }

    /// Splice a sub-router under this one.
    pub fn include_router(&mut self, router: Router) {
        self.children.push(router);
    }

    /// Flatten the tree into fully-prefixed resolved routes.
    pub(crate) fn collect(
        self,
        parent_prefix: &str,
        parent_middleware: &[Arc<dyn Middleware>],
        out: &mut Vec<ResolvedRoute>,
    ) {
        let prefix = join_prefix(parent_prefix, &self.prefix);
        let mut middleware = parent_middleware.to_vec();
        middleware.extend(self.middleware.iter().cloned());

        for pending in self.pending {
            out.push(ResolvedRoute {
                name: join_prefix(&prefix, &pending.name),
                options: pending.options,
                handler: pending.handler,
                middleware: middleware.clone(),
                slot: pending.slot,
            });
        }
        for child in self.children {
            child.collect(&prefix, &middleware, out);
        }
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("prefix", &self.prefix)
            .field("pending", &self.pending.len())
            .field("children", &self.children.len())
            .finish()
    }
}

pub(crate) struct ResolvedRoute {
    pub name: String,
    pub options: RouteOptions,
    pub handler: Handler,
    pub middleware: Vec<Arc<dyn Middleware>>,
    pub slot: Arc<OnceLock<Route>>,
}

impl ResolvedRoute {
    pub fn bind(&self, route: Route) {
        // A router is attached at most once, so the slot is empty.
        let _ = self.slot.set(route);
    }
}

fn join_prefix(parent: &str, child: &str) -> String {
    match (parent.is_empty(), child.is_empty()) {
        (true, _) => child.to_string(),
        (_, true) => parent.to_string(),
        _ => format!("{parent}:{child}"),
    }
}
