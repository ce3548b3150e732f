use std::time::Duration;

use anyhow::bail;

/// Read deadline a server applies to every read on an established connection.
pub const DEFAULT_SERVER_TIMEOUT: Duration = Duration::from_secs(5);
/// Interval at which a client injects a heartbeat into an idle connection.
pub const DEFAULT_CLIENT_TIMEOUT: Duration = Duration::from_secs(3);

/// Static per-node configuration. All of it is applied when the node starts;
/// changes afterwards have no effect on a running node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// This node's identifier as announced to peers during the handshake.
    /// An empty string means "use the connection's local socket address",
    /// which is good enough for fleets where nobody addresses this node by
    /// name.
    pub uid: String,

    /// Magic prefix of every frame on the wire. Both endpoints must agree on
    /// it; a receiver skips everything up to the next occurrence of this
    /// string when it has to re-sync.
    pub frame_header: String,

    /// Depth of the process-wide inbound queue feeding the dispatcher. A full
    /// queue blocks the readers of all connections.
    pub inbound_queue_capacity: usize,

    /// Depth of each connection's outbound mailbox. A full mailbox blocks
    /// whoever is enqueueing for that connection.
    pub outbox_capacity: usize,

    /// Size in bytes of each connection's read buffer. Frames larger than this
    /// are reassembled across reads, so this only tunes syscall granularity.
    pub read_buffer_size: usize,

    /// Server: per-read deadline after which a silent connection is torn down.
    /// Client: interval after which an idle mailbox produces a heartbeat.
    /// `None` picks the mode-specific default when the node starts.
    pub timeout: Option<Duration>,
}

impl NodeConfig {
    pub fn new() -> NodeConfig {
        NodeConfig {
            uid: String::new(),
            frame_header: "henrylee2cn".to_string(),
            inbound_queue_capacity: 4096,
            outbox_capacity: 2048,
            read_buffer_size: 1024,
            timeout: None,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.frame_header.is_empty() {
            bail!("frame header must not be empty");
        }
        if !self.frame_header.is_ascii() {
            bail!("frame header must be ASCII");
        }
        if self.inbound_queue_capacity == 0 {
            bail!("inbound queue capacity must be at least 1");
        }
        if self.outbox_capacity == 0 {
            bail!("outbox capacity must be at least 1");
        }
        if self.read_buffer_size == 0 {
            bail!("read buffer size must be at least 1");
        }
        if let Some(timeout) = self.timeout {
            if timeout.is_zero() {
                bail!("timeout must be positive");
            }
        }
        Ok(())
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig::new()
    }
}
