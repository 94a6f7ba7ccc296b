use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use super::kind::OperationKind;
use crate::storage::Payload;

/// Performs the real effect of one operation kind (typically a remote
/// write). Returning an error marks the attempt as failed.
///
/// Handlers may run more than once for the same operation (a crash between
/// success and removal replays it), so they must be idempotent or dedupe on
/// an identifier carried in the payload.
#[async_trait]
pub trait OperationHandler: Send + Sync {
    async fn handle(&self, payload: &Payload) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> OperationHandler for F
where
    F: Fn(Payload) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, payload: &Payload) -> anyhow::Result<()> {
        (self)(payload.clone()).await
    }
}

/// Resolves an operation kind to its handler.
///
/// Implementing this with an exhaustive `match` over the kind enum makes a
/// missing handler a compile error. [`HandlerTable`] is the partial,
/// runtime-built alternative.
pub trait Handlers<K: OperationKind>: Send + Sync {
    fn handler(&self, kind: K) -> Option<&dyn OperationHandler>;
}

impl<K: OperationKind, H: Handlers<K> + ?Sized> Handlers<K> for Arc<H> {
    fn handler(&self, kind: K) -> Option<&dyn OperationHandler> {
        (**self).handler(kind)
    }
}

/// Handler table built at runtime; kinds without an entry resolve to `None`.
pub struct HandlerTable<K> {
    handlers: HashMap<K, Arc<dyn OperationHandler>>,
}

impl<K: OperationKind> HandlerTable<K> {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register `handler` for `kind`, replacing any previous one.
    pub fn on<H: OperationHandler + 'static>(mut self, kind: K, handler: H) -> Self {
        self.register(kind, Arc::new(handler));
        self
    }

    pub fn register(&mut self, kind: K, handler: Arc<dyn OperationHandler>) {
        self.handlers.insert(kind, handler);
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl<K: OperationKind> Default for HandlerTable<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: OperationKind> Handlers<K> for HandlerTable<K> {
    fn handler(&self, kind: K) -> Option<&dyn OperationHandler> {
        self.handlers.get(&kind).map(|h| h.as_ref())
    }
}
