// Copyright 2020 Joyent, Inc.

//! LRU cache of open dataset handles.
//!
//! The cache is the owner of every handle it opens. A request borrows a
//! handle through a [`Lease`] for as long as it runs; evicting a handle only
//! drops the cache's share, and the handle is closed once the last lease on
//! it is gone.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard};

use slog::{debug, info, o, warn, Logger};

use crate::dsp::{Dsp, DspRegistry};
use crate::error::{DapError, Result};

struct Resident {
    dsp: Box<dyn Dsp>,
    log: Logger,
}

impl Drop for Resident {
    fn drop(&mut self) {
        match self.dsp.close() {
            Ok(()) => debug!(self.log, "closed dataset handle"),
            Err(e) => warn!(self.log, "failed to close dataset handle"; "err" => %e),
        }
    }
}

/// A handle borrowed from the cache for the duration of one request.
#[derive(Clone)]
pub struct Lease {
    resident: Arc<Resident>,
}

impl Deref for Lease {
    type Target = dyn Dsp;

    fn deref(&self) -> &(dyn Dsp + 'static) {
        self.resident.dsp.as_ref()
    }
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("location", &self.resident.dsp.location())
            .finish()
    }
}

#[derive(Default)]
struct CacheState {
    /// Least recently used first.
    order: VecDeque<String>,
    handles: HashMap<String, Arc<Resident>>,
}

impl CacheState {
    fn touch(&mut self, path: &str) {
        if let Some(pos) = self.order.iter().position(|p| p == path) {
            if let Some(key) = self.order.remove(pos) {
                self.order.push_back(key);
            }
        }
    }
}

pub struct HandleCache {
    registry: DspRegistry,
    capacity: usize,
    state: Mutex<CacheState>,
    log: Logger,
}

impl HandleCache {
    pub fn new(
        registry: DspRegistry,
        capacity: usize,
        log: Option<&Logger>,
    ) -> Result<HandleCache> {
        if capacity == 0 {
            return Err(DapError::internal("handle cache capacity must be positive"));
        }
        let log = crate::logger_or_default(log).new(o!("component" => "handle-cache"));
        Ok(HandleCache {
            registry,
            capacity,
            state: Mutex::new(CacheState::default()),
            log,
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, CacheState>> {
        self.state
            .lock()
            .map_err(|_| DapError::internal("handle cache lock poisoned"))
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lock().map(|s| s.handles.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, path: &str) -> bool {
        self.lock()
            .map(|s| s.handles.contains_key(path))
            .unwrap_or(false)
    }

    /// Resident paths, least recently used first.
    pub fn paths(&self) -> Vec<String> {
        self.lock()
            .map(|s| s.order.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Returns the resident handle for `path`, opening it (and evicting the
    /// least recently used handle if the cache is full) when needed. The
    /// whole lookup/evict/open/insert sequence runs under one lock, so
    /// concurrent requests for the same path share a single open.
    pub fn acquire(&self, path: &str) -> Result<Lease> {
        let mut state = self.lock()?;

        if let Some(resident) = state.handles.get(path).cloned() {
            state.touch(path);
            debug!(self.log, "handle cache hit"; "path" => path);
            return Ok(Lease { resident });
        }

        while state.handles.len() >= self.capacity {
            let victim = match state.order.pop_front() {
                Some(victim) => victim,
                None => break,
            };
            state.handles.remove(&victim);
            info!(self.log, "evicted dataset handle"; "path" => &victim);
        }

        let dsp = self.registry.open(path)?;
        let resident = Arc::new(Resident {
            dsp,
            log: self.log.new(o!("path" => path.to_string())),
        });
        state.handles.insert(path.to_string(), Arc::clone(&resident));
        state.order.push_back(path.to_string());
        info!(self.log, "opened dataset handle"; "path" => path);
        Ok(Lease { resident })
    }

    /// Drops every resident handle. Handles still leased close when their
    /// last lease goes away.
    pub fn release_all(&self) -> Result<()> {
        let mut state = self.lock()?;
        let count = state.handles.len();
        state.order.clear();
        state.handles.clear();
        info!(self.log, "released all dataset handles"; "count" => count);
        Ok(())
    }
}
