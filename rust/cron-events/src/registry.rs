//! Named handlers for system tasks.
//!
//! The registry is filled once at start-up and passed by `Arc` to the
//! scheduler and the delayed event service, which only read from it.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Free-form handler parameters.
pub type Params = serde_json::Map<String, serde_json::Value>;

/// What a handler sees about the fire it is serving.
#[derive(Debug, Clone)]
pub struct HandlerContext {
    /// Task id, or the one-shot entry id for internal entries.
    pub task_id: String,
    /// Cancelled when the fire times out or the scheduler shuts down.
    pub cancel: CancellationToken,
}

/// A system task handler.
///
/// ```rust,ignore
/// struct Echo;
///
/// #[async_trait]
/// impl TaskHandler for Echo {
///     fn name(&self) -> &str { "echo" }
///     fn description(&self) -> &str { "returns params.text" }
///     async fn handle(&self, _ctx: &HandlerContext, params: &Params) -> anyhow::Result<String> {
///         Ok(params.get("text").and_then(|v| v.as_str()).unwrap_or_default().to_string())
///     }
/// }
/// ```
#[async_trait]
pub trait TaskHandler: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    async fn handle(&self, ctx: &HandlerContext, params: &Params) -> anyhow::Result<String>;
}

/// Listing entry returned by [`Registry::list`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HandlerInfo {
    pub name: String,
    pub description: String,
}

#[derive(Default)]
pub struct Registry {
    handlers: RwLock<BTreeMap<String, Arc<dyn TaskHandler>>>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("handlers", &self.handlers.read().keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under its own name. Names are unique.
    pub fn register(&self, handler: Arc<dyn TaskHandler>) -> Result<()> {
        let name = handler.name().to_string();
        if name.is_empty() {
            return Err(Error::InvalidConfig("handler name must not be empty".into()));
        }

        let mut handlers = self.handlers.write();
        if handlers.contains_key(&name) {
            return Err(Error::conflict("handler", name));
        }
        tracing::debug!(handler = %name, "Registered task handler");
        handlers.insert(name, handler);
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.read().get(name).map(Arc::clone)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.read().contains_key(name)
    }

    /// All handlers, sorted by name.
    pub fn list(&self) -> Vec<HandlerInfo> {
        self.handlers
            .read()
            .values()
            .map(|h| HandlerInfo {
                name: h.name().to_string(),
                description: h.description().to_string(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str);

    #[async_trait]
    impl TaskHandler for Named {
        fn name(&self) -> &str {
            self.0
        }

        fn description(&self) -> &str {
            "test handler"
        }

        async fn handle(&self, _ctx: &HandlerContext, _params: &Params) -> anyhow::Result<String> {
            Ok(self.0.to_string())
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = Registry::new();
        registry.register(Arc::new(Named("b"))).unwrap();
        registry.register(Arc::new(Named("a"))).unwrap();

        assert!(registry.contains("a"));
        assert!(registry.lookup("missing").is_none());
        let names: Vec<_> = registry.list().into_iter().map(|h| h.name).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn test_duplicate_rejected() {
        let registry = Registry::new();
        registry.register(Arc::new(Named("echo"))).unwrap();
        let err = registry.register(Arc::new(Named("echo"))).unwrap_err();
        assert!(matches!(err, Error::Conflict { .. }));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_lookup_returns_callable_handler() {
        let registry = Registry::new();
        registry.register(Arc::new(Named("echo"))).unwrap();
        let ctx = HandlerContext {
            task_id: "t".into(),
            cancel: CancellationToken::new(),
        };
        let out = registry
            .lookup("echo")
            .unwrap()
            .handle(&ctx, &Params::new())
            .await
            .unwrap();
        assert_eq!(out, "echo");
    }
}
