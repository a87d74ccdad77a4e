use std::{collections::HashMap, future::Future, pin::Pin, sync::Arc};

use anyhow::Result;
use async_trait::async_trait;
use duraq_codec::CallSpec;
use serde_json::Value;

/// One unit of executable work, registered under a stable name.
///
/// Handlers receive the full decoded [`CallSpec`] (name, positional args,
/// keyword args, context) and return a JSON value to be recorded as the
/// task's result. Whatever error a handler returns becomes the task's
/// `failed` outcome; it never faults the worker.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn run(&self, call: CallSpec) -> Result<Value>;
}

type HandlerFuture = Pin<Box<dyn Future<Output = Result<Value>> + Send>>;

struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F> TaskHandler for FnHandler<F>
where
    F: Fn(CallSpec) -> HandlerFuture + Send + Sync,
{
    async fn run(&self, call: CallSpec) -> Result<Value> {
        (self.f)(call).await
    }
}

struct BlockingFnHandler<F> {
    f: Arc<F>,
}

#[async_trait]
impl<F> TaskHandler for BlockingFnHandler<F>
where
    F: Fn(CallSpec) -> Result<Value> + Send + Sync + 'static,
{
    async fn run(&self, call: CallSpec) -> Result<Value> {
        let f = self.f.clone();
        // Off the cooperative scheduler; the dispatcher keeps running while
        // this blocks a pool thread.
        tokio::task::spawn_blocking(move || f(call)).await?
    }
}

/// Name → handler map consulted by executors. Populated once at worker
/// construction; lookups are read-only afterwards.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        self.handlers.insert(name.into(), handler);
    }

    /// Register an async closure.
    pub fn register_fn<F, Fut>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(CallSpec) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        self.register(
            name,
            Arc::new(FnHandler {
                f: move |call| -> HandlerFuture { Box::pin(f(call)) },
            }),
        );
    }

    /// Register a synchronous closure; it runs on the blocking pool so it
    /// cannot stall the dispatcher.
    pub fn register_blocking<F>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(CallSpec) -> Result<Value> + Send + Sync + 'static,
    {
        self.register(name, Arc::new(BlockingFnHandler { f: Arc::new(f) }));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;
    use serde_json::json;

    #[tokio::test]
    async fn async_and_blocking_handlers_run() {
        let mut registry = HandlerRegistry::new();
        registry.register_fn("double", |call: CallSpec| async move {
            let n = call.args[0].as_i64().unwrap();
            Ok(json!(n * 2))
        });
        registry.register_blocking("halve", |call: CallSpec| {
            let n = call.args[0].as_i64().unwrap();
            Ok(json!(n / 2))
        });

        let call = CallSpec::new("double").with_args(vec![json!(21)]);
        let doubled = registry.get("double").unwrap().run(call).await.unwrap();
        assert_eq!(doubled, json!(42));

        let call = CallSpec::new("halve").with_args(vec![json!(42)]);
        let halved = registry.get("halve").unwrap().run(call).await.unwrap();
        assert_eq!(halved, json!(21));
    }

    #[tokio::test]
    async fn handler_errors_surface() {
        let mut registry = HandlerRegistry::new();
        registry.register_fn("fail", |_call| async move { bail!("nope") });

        let err = registry
            .get("fail")
            .unwrap()
            .run(CallSpec::new("fail"))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "nope");
    }

    #[test]
    fn unknown_handler_is_none() {
        let registry = HandlerRegistry::new();
        assert!(registry.get("ghost").is_none());
    }
}
