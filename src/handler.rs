use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use rustc_hash::FxHashMap;

use crate::record::{Record, HEARTBEAT, IDENTITY};

/// One operation's implementation. Invoked on its own task per record, so a
/// slow handler never blocks the dispatcher or other handlers; implementations
/// must be safe to run concurrently with themselves.
///
/// Returning `Some` sends the record back over the originating connection
/// with the addresses swapped; `None` ends the exchange.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, request: Record) -> Option<Record>;
}

/// Adapter for plain functions, which is what most handlers are.
struct FnHandler<F>(F);

#[async_trait]
impl<F> Handler for FnHandler<F>
where
    F: Fn(Record) -> Option<Record> + Send + Sync + 'static,
{
    async fn handle(&self, request: Record) -> Option<Record> {
        (self.0)(request)
    }
}

/// The application's handler table: operation name -> handler. Built before
/// the node starts and immutable afterwards.
///
/// The runtime owns the two reserved entries ([IDENTITY] and [HEARTBEAT]);
/// they are (re-)installed when the table is handed to the node, overwriting
/// anything the application put at those keys.
#[derive(Default)]
pub struct Api {
    handlers: FxHashMap<String, Arc<dyn Handler>>,
}

impl Api {
    pub fn new() -> Api {
        Api::default()
    }

    /// Registers a plain function under `operation`. Consumes and returns the
    /// table so registrations chain.
    pub fn on(
        mut self,
        operation: &str,
        handler: impl Fn(Record) -> Option<Record> + Send + Sync + 'static,
    ) -> Api {
        self.handlers.insert(operation.to_string(), Arc::new(FnHandler(handler)));
        self
    }

    /// Registers a trait-object handler, for implementations that carry state
    /// or need to await.
    pub fn register(&mut self, operation: &str, handler: Arc<dyn Handler>) {
        self.handlers.insert(operation.to_string(), handler);
    }

    pub fn get(&self, operation: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(operation).cloned()
    }

    /// The identity announcement echoes back to the sender; heartbeats are
    /// swallowed. Installed last so user entries at these keys never win.
    pub(crate) fn install_reserved(&mut self) {
        self.handlers
            .insert(IDENTITY.to_string(), Arc::new(FnHandler(|request| Some(request))));
        self.handlers.insert(HEARTBEAT.to_string(), Arc::new(FnHandler(|_| None)));
    }
}
