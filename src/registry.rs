//! The route table: name to binding, idempotent by name.

use crate::cron::Cron;
use crate::route::RouteShared;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Default)]
pub(crate) struct RouteTable {
    routes: HashMap<String, Arc<RouteShared>>,
    /// `(route name, cron)` pairs queued at registration, activated
    /// during startup after the lifespan hook.
    pending_cron: Vec<(String, Cron)>,
}

impl RouteTable {
    pub fn get(&self, name: &str) -> Option<Arc<RouteShared>> {
        self.routes.get(name).cloned()
    }

    pub fn insert(&mut self, shared: Arc<RouteShared>) {
        self.routes.insert(shared.name.clone(), shared);
    }

    pub fn queue_cron(&mut self, name: &str, cron: Cron) {
        self.pending_cron.push((name.to_string(), cron));
    }

    pub fn take_pending_cron(&mut self) -> Vec<(String, Cron)> {
        std::mem::take(&mut self.pending_cron)
    }

    /// Pending auto-cron pairs without consuming them.
    pub fn pending_cron(&self) -> &[(String, Cron)] {
        &self.pending_cron
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<RouteShared>> {
        self.routes.values()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }
}
