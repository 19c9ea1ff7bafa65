//! In-process completion engine for tagline.
//!
//! `LocalEngine` implements the [`tagline::native`] interfaces without any
//! transport: servers register under `host:port`, channels find them by the
//! same string when a call is invoked, and messages move between the two ends
//! of a call through shared state. Completions are posted to the tagline
//! event queues exactly as a networked engine would post them, so everything
//! above the engine runs unchanged.
//!
//! ```rust,ignore
//! use tagline::{Client, ClientConfig, Server, ServerConfig};
//! use tagline_local::LocalEngine;
//!
//! let engine = LocalEngine::init()?;
//! let server = Server::new(&engine, ServerConfig::default())?;
//! let client = Client::new(&engine, ClientConfig::default())?;
//! ```

mod alarm;
mod call;
mod channel;
mod rpc;
mod server;
mod watch;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tagline::Deadline;
use tagline::native::{ConnectivityState, Engine, EngineError, NativeChannel, NativeServer};

use crate::alarm::{Alarm, Expire};
use crate::channel::LocalChannel;
use crate::server::LocalServer;
use crate::watch::{Watch, resolve};

pub(crate) struct EngineInner {
    servers: Mutex<HashMap<String, Weak<LocalServer>>>,
    watches: Mutex<Vec<Arc<Watch>>>,
    alarm: Alarm,
    shut_down: AtomicBool,
}

impl EngineInner {
    /// The live server bound to `address`, if any.
    fn server(&self, address: &str) -> Option<Arc<LocalServer>> {
        self.servers.lock().get(address).and_then(Weak::upgrade)
    }

    // Never called with `watches` locked: dropping the last server handle
    // here re-enters through `state_changed`.
    fn is_ready(&self, address: &str) -> bool {
        self.server(address).is_some_and(|s| s.is_accepting())
    }

    pub(crate) fn connectivity(&self, target: &str, attempted: bool) -> ConnectivityState {
        let shut_down = self.shut_down.load(Ordering::Acquire);
        resolve(shut_down, !shut_down && self.is_ready(target), attempted)
    }

    /// Register `watch`, expiring it at `deadline`.
    pub(crate) fn watch(&self, watch: Arc<Watch>, deadline: Deadline) {
        {
            let mut watches = self.watches.lock();
            watches.retain(|w| !w.is_fired());
            watches.push(watch.clone());
        }
        if let Some(at) = deadline.instant() {
            let expiry: Weak<dyn Expire> = Arc::downgrade(&watch) as Weak<Watch>;
            self.alarm.schedule(at, expiry);
        }
        // A change between the caller's last look and registration.
        let current = self.connectivity(&watch.target, watch.attempted.load(Ordering::Acquire));
        watch.observe(current);
        // Nothing changes or expires after engine shutdown.
        if self.shut_down.load(Ordering::Acquire) {
            watch.fire(false);
        }
    }

    /// Re-check watches on `target` after its server or a channel changed.
    pub(crate) fn state_changed(&self, target: &str) {
        let shut_down = self.shut_down.load(Ordering::Acquire);
        let ready = !shut_down && self.is_ready(target);
        let mut watches = self.watches.lock();
        watches.retain(|w| {
            if w.is_fired() {
                return false;
            }
            if w.target != target {
                return true;
            }
            let current = resolve(shut_down, ready, w.attempted.load(Ordering::Acquire));
            !w.observe(current)
        });
    }
}

/// An in-process engine instance. Creating one is engine init.
pub struct LocalEngine {
    inner: Arc<EngineInner>,
}

impl LocalEngine {
    /// Initialize the engine and start its deadline alarm thread.
    pub fn init() -> Result<Self, tagline::Error> {
        let inner = EngineInner {
            servers: Mutex::new(HashMap::new()),
            watches: Mutex::new(Vec::new()),
            alarm: Alarm::start()?,
            shut_down: AtomicBool::new(false),
        };
        tracing::debug!("local engine initialized");
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    fn check_address(&self, host: &str, port: u16) -> Result<String, EngineError> {
        if self.inner.shut_down.load(Ordering::Acquire) {
            return Err(EngineError::Shutdown);
        }
        if host.is_empty() || port == 0 {
            return Err(EngineError::InvalidTarget(format!("{host}:{port}")));
        }
        Ok(format!("{host}:{port}"))
    }
}

impl Engine for LocalEngine {
    fn connect(&self, host: &str, port: u16) -> Result<Arc<dyn NativeChannel>, EngineError> {
        let target = self.check_address(host, port)?;
        Ok(Arc::new(LocalChannel::new(self.inner.clone(), target)))
    }

    fn bind(&self, host: &str, port: u16) -> Result<Arc<dyn NativeServer>, EngineError> {
        let address = self.check_address(host, port)?;
        let mut servers = self.inner.servers.lock();
        if let Some(live) = servers.get(&address).and_then(Weak::upgrade) {
            // Releasing the last handle notifies watchers, which takes this lock.
            drop(servers);
            drop(live);
            return Err(EngineError::AddressInUse(address));
        }
        let server = Arc::new(LocalServer::new(address.clone(), Arc::downgrade(&self.inner)));
        servers.insert(address, Arc::downgrade(&server));
        Ok(server)
    }

    fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let live = self
            .inner
            .servers
            .lock()
            .drain()
            .filter(|(_, s)| s.strong_count() > 0)
            .count();
        if live > 0 {
            tracing::warn!(live, "engine shut down with servers still bound");
        }
        let watches = std::mem::take(&mut *self.inner.watches.lock());
        for watch in watches {
            if !watch.observe(ConnectivityState::Shutdown) {
                watch.fire(false);
            }
        }
        self.inner.alarm.shutdown();
        tracing::debug!("local engine shut down");
    }
}

impl Drop for LocalEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
