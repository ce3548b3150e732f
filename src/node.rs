use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::{NodeConfig, DEFAULT_CLIENT_TIMEOUT, DEFAULT_SERVER_TIMEOUT};
use crate::connection::Connection;
use crate::dispatcher::Dispatcher;
use crate::handler::Api;
use crate::record::Record;
use crate::registry::Registry;
use crate::transport::Transport;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Mode {
    Server,
    Client,
}

/// One runtime instance. Configure it, hand it the handler table, start it as
/// a server or a client, then send fire-and-forget requests to peers.
///
/// Several nodes may coexist in one process; they share nothing. Shutting a
/// node down (or dropping it) stops its tasks and closes its connections.
///
/// ```no_run
/// use peerlink::handler::Api;
/// use peerlink::node::Node;
/// use peerlink::record::Record;
///
/// # async fn run() {
/// let mut server = Node::new();
/// server.set_uid("srv");
/// server.set_api(Api::new().on("echo", |r| Some(Record::reply(r.body))));
/// server.server(9988);
///
/// let mut client = Node::new();
/// client.set_api(Api::new());
/// client.client("127.0.0.1", 9988);
/// client.request_to("hello", "echo", "srv").await;
/// # }
/// ```
pub struct Node {
    config: NodeConfig,
    api: Option<Arc<Api>>,
    running: Option<Running>,
}

struct Running {
    mode: Mode,
    registry: Arc<Registry>,
    tasks: Vec<JoinHandle<()>>,
}

impl Node {
    pub fn new() -> Node {
        Node {
            config: NodeConfig::new(),
            api: None,
            running: None,
        }
    }

    /// Installs the handler table and the runtime's reserved entries on top of
    /// it. Required before the node can start.
    pub fn set_api(&mut self, mut api: Api) -> &mut Node {
        if self.assert_not_started("handler table") {
            api.install_reserved();
            self.api = Some(Arc::new(api));
        }
        self
    }

    /// This node's identifier as announced to peers. Defaults to the local
    /// socket address.
    pub fn set_uid(&mut self, uid: impl Into<String>) -> &mut Node {
        if self.assert_not_started("uid") {
            self.config.uid = uid.into();
        }
        self
    }

    /// Magic prefix of every frame on the wire.
    pub fn set_frame_header(&mut self, header: impl Into<String>) -> &mut Node {
        if self.assert_not_started("frame header") {
            self.config.frame_header = header.into();
        }
        self
    }

    /// Depth of the inbound queue feeding the dispatcher.
    pub fn set_inbound_queue_capacity(&mut self, capacity: usize) -> &mut Node {
        if self.assert_not_started("inbound queue capacity") {
            self.config.inbound_queue_capacity = capacity;
        }
        self
    }

    /// Depth of each connection's outbound mailbox.
    pub fn set_outbox_capacity(&mut self, capacity: usize) -> &mut Node {
        if self.assert_not_started("outbox capacity") {
            self.config.outbox_capacity = capacity;
        }
        self
    }

    /// Size in bytes of each connection's read buffer.
    pub fn set_read_buffer_size(&mut self, size: usize) -> &mut Node {
        if self.assert_not_started("read buffer size") {
            self.config.read_buffer_size = size;
        }
        self
    }

    /// Server read deadline / client heartbeat interval.
    pub fn set_timeout(&mut self, timeout: Duration) -> &mut Node {
        if self.assert_not_started("timeout") {
            self.config.timeout = Some(timeout);
        }
        self
    }

    /// Starts accepting peers on `port`. Mutually exclusive with [Node::client]
    /// and refused until a handler table is installed.
    pub fn server(&mut self, port: u16) {
        self.start(Mode::Server, Target::Listen(port));
    }

    /// Starts dialing `server_addr:port`, reconnecting for as long as the node
    /// lives. Mutually exclusive with [Node::server] and refused until a
    /// handler table is installed.
    pub fn client(&mut self, server_addr: &str, port: u16) {
        self.start(Mode::Client, Target::Dial(format!("{}:{}", server_addr, port)));
    }

    fn start(&mut self, mode: Mode, target: Target) {
        if self.running.is_some() {
            warn!("node is already running - ignoring the start request");
            return;
        }
        let Some(api) = self.api.clone() else {
            error!("cannot start: no handler table - call set_api first");
            return;
        };
        if let Err(e) = self.config.validate() {
            error!("cannot start: {}", e);
            return;
        }

        let timeout = self.config.timeout.unwrap_or(match mode {
            Mode::Server => DEFAULT_SERVER_TIMEOUT,
            Mode::Client => DEFAULT_CLIENT_TIMEOUT,
        });

        let registry = Arc::new(Registry::new());
        let (inbound_tx, inbound_rx) = mpsc::channel(self.config.inbound_queue_capacity);
        let transport = Arc::new(Transport::new(mode, &self.config, timeout, registry.clone(), inbound_tx));
        let dispatcher = Arc::new(Dispatcher::new(api, registry.clone()));

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(dispatcher.run(inbound_rx)));
        match target {
            Target::Listen(port) => tasks.push(tokio::spawn(transport.accept_loop(port))),
            Target::Dial(server_addr) => tasks.push(tokio::spawn(transport.dial_loop(server_addr))),
        }

        info!(?mode, "node started");
        self.running = Some(Running {
            mode,
            registry,
            tasks,
        });
    }

    /// Enqueues a request for some connected peer, waiting until at least one
    /// connection exists. Best effort: nothing is reported back to the caller.
    pub async fn request(&self, body: impl Serialize, operation: &str) {
        let Some(running) = self.ready_to_send(operation) else {
            return;
        };
        let conn = running.registry.pick_any().await;
        send_request(&conn, operation, body).await;
    }

    /// Enqueues a request for the peer known as `uid`, waiting until that UID
    /// resolves to a live connection. Best effort, like [Node::request].
    pub async fn request_to(&self, body: impl Serialize, operation: &str, uid: &str) {
        let Some(running) = self.ready_to_send(operation) else {
            return;
        };
        let conn = running.registry.lookup_by_uid(uid).await;
        send_request(&conn, operation, body).await;
    }

    fn ready_to_send(&self, operation: &str) -> Option<&Running> {
        if operation.is_empty() {
            warn!("refusing to send a record without an operation");
            return None;
        }
        let Some(running) = &self.running else {
            warn!(operation, "request on a node that is not running - dropping");
            return None;
        };
        Some(running)
    }

    pub fn mode(&self) -> Option<Mode> {
        self.running.as_ref().map(|running| running.mode)
    }

    /// Number of peers whose identity this node currently knows.
    pub fn count_nodes(&self) -> usize {
        self.running.as_ref().map_or(0, |running| running.registry.node_count())
    }

    /// Stops the accept/dial loop and the dispatcher and closes every
    /// connection. Idempotent; also runs on drop.
    pub fn shutdown(&mut self) {
        if let Some(running) = self.running.take() {
            for task in &running.tasks {
                task.abort();
            }
            running.registry.close_all();
            info!("node shut down");
        }
    }

    fn assert_not_started(&self, what: &str) -> bool {
        if self.running.is_some() {
            warn!("cannot change {} on a running node - ignoring", what);
            return false;
        }
        true
    }
}

impl Default for Node {
    fn default() -> Self {
        Node::new()
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.shutdown();
    }
}

enum Target {
    Listen(u16),
    Dial(String),
}

async fn send_request(conn: &Arc<Connection>, operation: &str, body: impl Serialize) {
    let body = match serde_json::to_value(body) {
        Ok(body) => body,
        Err(e) => {
            warn!(operation, "request body is not serializable: {}", e);
            return;
        }
    };
    conn.enqueue(Record::addressed(conn.local_addr, conn.remote_addr, operation, body))
        .await;
}
