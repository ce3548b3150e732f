use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::connection::Connection;
use crate::handler::Api;
use crate::record::Record;
use crate::registry::Registry;

/// How often, and how patiently, the dispatcher retries resolving a record's
/// originating connection before giving up on the record.
const ORIGIN_RETRIES: usize = 3;
const ORIGIN_RETRY_INTERVAL: Duration = Duration::from_secs(2);

/// Single consumer of the process-wide inbound queue. Every record is handled
/// on its own task, so handlers for records from one connection may complete
/// in any order; only the bytes on each socket are ordered.
pub struct Dispatcher {
    api: Arc<Api>,
    registry: Arc<Registry>,
}

impl Dispatcher {
    pub fn new(api: Arc<Api>, registry: Arc<Registry>) -> Dispatcher {
        Dispatcher { api, registry }
    }

    pub async fn run(self: Arc<Self>, mut inbound: mpsc::Receiver<Record>) {
        while let Some(record) = inbound.recv().await {
            let this = self.clone();
            tokio::spawn(async move { this.dispatch(record).await });
        }
    }

    async fn dispatch(&self, request: Record) {
        let Some(conn) = self.originating_connection(&request).await else {
            return;
        };

        let Some(handler) = self.api.get(&request.operation) else {
            warn!(operation = %request.operation, from = %request.from, "illegal operation");
            return;
        };

        let operation = request.operation.clone();
        let (reply_from, reply_to) = (request.to.clone(), request.from.clone());

        if let Some(mut reply) = handler.handle(request).await {
            if reply.operation.is_empty() {
                reply.operation = operation;
            }
            reply.from = reply_from;
            reply.to = reply_to;
            conn.enqueue(reply).await;
        }
    }

    /// The connection the record arrived on, found by its `from` address. The
    /// connection may be mid-registration when the record is dispatched, so
    /// lookup failures are retried a few times before the record is dropped.
    async fn originating_connection(&self, record: &Record) -> Option<Arc<Connection>> {
        let Ok(addr) = record.from.parse::<SocketAddr>() else {
            debug!(from = %record.from, "record carries an unparsable origin address - dropping");
            return None;
        };

        for attempt in 0..ORIGIN_RETRIES {
            if attempt > 0 {
                sleep(ORIGIN_RETRY_INTERVAL).await;
            }
            if let Some(conn) = self.registry.lookup(addr) {
                return Some(conn);
            }
        }
        debug!(peer = %addr, "no connection to the record's origin - dropping");
        None
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use serde_json::json;
    use tokio::time::timeout;

    use crate::handler::MockHandler;
    use crate::record::HEARTBEAT;

    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from_str(&format!("127.0.0.1:{}", port)).unwrap()
    }

    fn request(from: SocketAddr, to: SocketAddr, operation: &str, body: serde_json::Value) -> Record {
        Record::addressed(from, to, operation, body)
    }

    /// registry with one registered peer; returns the peer's mailbox receiver
    fn registry_with_peer(port: u16) -> (Arc<Registry>, mpsc::Receiver<Record>) {
        let registry = Arc::new(Registry::new());
        let (conn, outbox_rx) = Connection::new(addr(port), addr(9100), 8);
        registry.insert(Arc::new(conn));
        (registry, outbox_rx)
    }

    async fn run_dispatcher(api: Api, registry: Arc<Registry>, records: Vec<Record>) {
        let (tx, rx) = mpsc::channel(16);
        for record in records {
            tx.send(record).await.unwrap();
        }
        drop(tx);

        let dispatcher = Arc::new(Dispatcher::new(Arc::new(api), registry));
        dispatcher.run(rx).await;
    }

    #[tokio::test]
    async fn test_reply_swaps_addresses_and_inherits_operation() {
        let (registry, mut outbox_rx) = registry_with_peer(9101);
        let api = Api::new().on("echo", |r| Some(Record::reply(r.body)));

        run_dispatcher(
            api,
            registry,
            vec![request(addr(9101), addr(9100), "echo", json!("hello"))],
        )
        .await;

        let reply = timeout(Duration::from_secs(1), outbox_rx.recv()).await.unwrap().unwrap();
        assert_eq!(reply.operation, "echo");
        assert_eq!(reply.body, json!("hello"));
        assert_eq!(reply.from, addr(9100).to_string());
        assert_eq!(reply.to, addr(9101).to_string());
    }

    #[tokio::test]
    async fn test_explicit_reply_operation_is_kept() {
        let (registry, mut outbox_rx) = registry_with_peer(9101);
        let api = Api::new().on("query", |_| Some(Record::reply_as("result", 7)));

        run_dispatcher(
            api,
            registry,
            vec![request(addr(9101), addr(9100), "query", json!(null))],
        )
        .await;

        let reply = timeout(Duration::from_secs(1), outbox_rx.recv()).await.unwrap().unwrap();
        assert_eq!(reply.operation, "result");
        assert_eq!(reply.body, json!(7));
    }

    #[tokio::test]
    async fn test_handler_without_reply_sends_nothing() {
        let (registry, mut outbox_rx) = registry_with_peer(9101);
        let mut api = Api::new();
        api.install_reserved();

        run_dispatcher(
            api,
            registry,
            vec![request(addr(9101), addr(9100), HEARTBEAT, json!(1))],
        )
        .await;

        assert!(timeout(Duration::from_millis(100), outbox_rx.recv()).await.is_err());
    }

    #[tokio::test]
    async fn test_unknown_operation_is_dropped() {
        let (registry, mut outbox_rx) = registry_with_peer(9101);

        run_dispatcher(
            Api::new(),
            registry,
            vec![request(addr(9101), addr(9100), "no-such-op", json!(null))],
        )
        .await;

        assert!(timeout(Duration::from_millis(100), outbox_rx.recv()).await.is_err());
    }

    #[tokio::test]
    async fn test_trait_object_handler_is_invoked() {
        let (registry, mut outbox_rx) = registry_with_peer(9101);

        let mut handler = MockHandler::new();
        handler
            .expect_handle()
            .withf(|r| r.operation == "mocked")
            .returning(|_| Some(Record::reply("from mock")));

        let mut api = Api::new();
        api.register("mocked", Arc::new(handler));

        run_dispatcher(
            api,
            registry,
            vec![request(addr(9101), addr(9100), "mocked", json!(null))],
        )
        .await;

        let reply = timeout(Duration::from_secs(1), outbox_rx.recv()).await.unwrap().unwrap();
        assert_eq!(reply.body, json!("from mock"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unresolvable_origin_gives_up_after_retries() {
        let registry = Arc::new(Registry::new());
        let api = Api::new().on("echo", |r| Some(Record::reply(r.body)));

        run_dispatcher(
            api,
            registry.clone(),
            vec![request(addr(9101), addr(9100), "echo", json!("hello"))],
        )
        .await;

        // let the spawned dispatch task exhaust its retry window, then show
        // the record was dropped for good: a connection appearing afterwards
        // receives nothing
        tokio::time::sleep(Duration::from_secs(10)).await;
        let (conn, mut outbox_rx) = Connection::new(addr(9101), addr(9100), 8);
        registry.insert(Arc::new(conn));
        assert!(timeout(Duration::from_secs(5), outbox_rx.recv()).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_origin_registered_during_retry_window_is_found() {
        let registry = Arc::new(Registry::new());
        let api = Api::new().on("echo", |r| Some(Record::reply(r.body)));

        let (tx, rx) = mpsc::channel(16);
        tx.send(request(addr(9101), addr(9100), "echo", json!("late"))).await.unwrap();
        drop(tx);

        let dispatcher = Arc::new(Dispatcher::new(Arc::new(api), registry.clone()));
        let running = tokio::spawn(dispatcher.run(rx));

        // register the connection while the dispatcher is in its retry sleep
        tokio::time::sleep(Duration::from_secs(1)).await;
        let (conn, mut outbox_rx) = Connection::new(addr(9101), addr(9100), 8);
        registry.insert(Arc::new(conn));

        let reply = timeout(Duration::from_secs(10), outbox_rx.recv()).await.unwrap().unwrap();
        assert_eq!(reply.body, json!("late"));
        running.await.unwrap();
    }
}
