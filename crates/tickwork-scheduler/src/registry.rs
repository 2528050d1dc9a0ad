//! Name → handler lookup.
//!
//! Jobs only ever carry a handler *name*; the callable lives here, in-process.
//! Every process must register the names it expects to execute. An unknown
//! name fails the job at execution time, not at load time.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::error::{Result, SchedulerError};

/// Executable side of a job.
///
/// The returned value is logged and otherwise ignored. Any error fails the
/// attempt and its message becomes the job's `last_error`.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn call(&self, data: Value) -> anyhow::Result<Value>;
}

/// Adapter turning an async closure into a [`JobHandler`].
pub struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    async fn call(&self, data: Value) -> anyhow::Result<Value> {
        (self.f)(data).await
    }
}

/// Process-local registry of handlers. Never persisted.
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn JobHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Register `handler` under `name`, replacing any previous binding.
    pub fn register(&self, name: &str, handler: Arc<dyn JobHandler>) -> Result<()> {
        if name.trim().is_empty() {
            return Err(SchedulerError::InvalidHandler(
                "handler name must not be empty".into(),
            ));
        }
        let mut handlers = self.handlers.write().expect("handler registry poisoned");
        if handlers.insert(name.to_string(), handler).is_some() {
            debug!(handler = name, "handler replaced");
        } else {
            debug!(handler = name, "handler registered");
        }
        Ok(())
    }

    /// Register an async closure.
    pub fn register_fn<F, Fut>(&self, name: &str, f: F) -> Result<()>
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.register(name, Arc::new(FnHandler { f }))
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn JobHandler>> {
        self.handlers
            .read()
            .expect("handler registry poisoned")
            .get(name)
            .cloned()
            .ok_or_else(|| SchedulerError::HandlerNotFound {
                name: name.to_string(),
            })
    }

    pub fn has(&self, name: &str) -> bool {
        self.handlers
            .read()
            .expect("handler registry poisoned")
            .contains_key(name)
    }

    /// Remove a handler. Returns whether it was registered.
    pub fn remove(&self, name: &str) -> bool {
        let removed = self
            .handlers
            .write()
            .expect("handler registry poisoned")
            .remove(name)
            .is_some();
        if removed {
            debug!(handler = name, "handler removed");
        }
        removed
    }

    /// Registered names, sorted.
    pub fn list_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .handlers
            .read()
            .expect("handler registry poisoned")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
