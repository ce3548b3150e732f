use std::io;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail};
use bytes::{Bytes, BytesMut};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, trace, warn};

use crate::config::NodeConfig;
use crate::connection::Connection;
use crate::framer::Framer;
use crate::node::Mode;
use crate::record::{Record, HEARTBEAT, IDENTITY};
use crate::registry::Registry;

const DIAL_RETRY_INTERVAL: Duration = Duration::from_secs(1);
const RECONNECT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Owns the socket-facing side of a node: the accept or dial loop, the
/// identity handshake, and the reader/writer worker pair of every connection.
pub struct Transport {
    mode: Mode,
    uid: String,
    timeout: Duration,
    read_buffer_size: usize,
    outbox_capacity: usize,
    framer: Framer,
    registry: Arc<Registry>,
    inbound: mpsc::Sender<Record>,
}

impl Transport {
    pub fn new(
        mode: Mode,
        config: &NodeConfig,
        timeout: Duration,
        registry: Arc<Registry>,
        inbound: mpsc::Sender<Record>,
    ) -> Transport {
        Transport {
            mode,
            uid: config.uid.clone(),
            timeout,
            read_buffer_size: config.read_buffer_size,
            outbox_capacity: config.outbox_capacity,
            framer: Framer::new(&config.frame_header),
            registry,
            inbound,
        }
    }

    /// Server mode: accept until the task is torn down. A failed bind is fatal
    /// to the server loop; a failed accept is not.
    pub async fn accept_loop(self: Arc<Self>, port: u16) {
        let listener = match bind_listener(port) {
            Ok(listener) => listener,
            Err(e) => {
                error!(port, "failed to bind listener: {}", e);
                return;
            }
        };
        info!(port, "listening for peers");

        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    info!(peer = %peer, "peer connected");
                    let this = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = this.run_connection(stream).await {
                            warn!(peer = %peer, "connection setup failed: {}", e);
                        }
                    });
                }
                Err(e) => {
                    warn!("accept failed: {}", e);
                }
            }
        }
    }

    /// Client mode: dial, run the connection, redial once its workers are
    /// gone. Indefinitely and without backoff escalation - a node that wants
    /// to stop redialing shuts the whole node down.
    pub async fn dial_loop(self: Arc<Self>, server_addr: String) {
        loop {
            let stream = match TcpStream::connect(&server_addr).await {
                Ok(stream) => stream,
                Err(e) => {
                    debug!(server = %server_addr, "dial failed: {}", e);
                    sleep(DIAL_RETRY_INTERVAL).await;
                    continue;
                }
            };
            info!(server = %server_addr, "connected to server");

            if let Err(e) = self.clone().run_connection(stream).await {
                warn!(server = %server_addr, "connection setup failed: {}", e);
                continue;
            }

            // the workers own the link from here; redial once they are gone
            while !self.registry.is_empty() {
                sleep(RECONNECT_POLL_INTERVAL).await;
            }
            info!(server = %server_addr, "link lost - reconnecting");
        }
    }

    /// Registers the socket, runs the handshake on it, then hands its two
    /// halves to the reader and writer workers.
    pub async fn run_connection(self: Arc<Self>, mut stream: TcpStream) -> anyhow::Result<()> {
        let remote_addr = stream.peer_addr()?;
        let local_addr = stream.local_addr()?;
        let (conn, outbox_rx) = Connection::new(remote_addr, local_addr, self.outbox_capacity);
        let conn = Arc::new(conn);
        self.registry.insert(conn.clone());

        let mut residue = BytesMut::new();
        let mut closed = conn.closed_signal();
        let handshake = tokio::select! {
            _ = closed.wait_for(|closed| *closed) => Err(anyhow!("connection closed during handshake")),
            result = self.handshake(&mut stream, &conn, &mut residue) => result,
        };
        if let Err(e) = handshake {
            self.teardown(&conn);
            return Err(e);
        }

        let (read_half, write_half) = stream.into_split();
        tokio::spawn(self.clone().reader_loop(read_half, residue, conn.clone()));
        tokio::spawn(self.clone().writer_loop(write_half, outbox_rx, conn));
        Ok(())
    }

    /// Symmetric identity exchange: announce our UID, then consume exactly one
    /// record from the stream to learn the peer's. The first record is always
    /// consumed here, identity or not, so both ends stay aligned on the byte
    /// stream; any further frames decoded from the same read are regular
    /// traffic and go to the inbound queue.
    async fn handshake(
        &self,
        stream: &mut TcpStream,
        conn: &Connection,
        residue: &mut BytesMut,
    ) -> anyhow::Result<()> {
        let uid = if self.uid.is_empty() {
            conn.local_addr.to_string()
        } else {
            self.uid.clone()
        };
        let hello = Record::addressed(conn.local_addr, conn.remote_addr, IDENTITY, Value::String(uid));
        let frame = self.framer.pack(&serde_json::to_vec(&hello)?)?;
        stream.write_all(&frame).await?;

        let mut buf = vec![0u8; self.read_buffer_size];
        let first = loop {
            let n = stream.read(&mut buf).await?;
            if n == 0 {
                bail!("peer closed the connection during the handshake");
            }
            residue.extend_from_slice(&buf[..n]);

            let mut frames = self.framer.unpack(residue).into_iter();
            if let Some(first) = frames.next() {
                for payload in frames {
                    self.decode_and_enqueue(payload, conn).await;
                }
                break first;
            }
        };

        match serde_json::from_slice::<Record>(&first) {
            Ok(record) if record.operation == IDENTITY => {
                match record.body.as_str().filter(|uid| !uid.is_empty()) {
                    Some(peer_uid) => self.registry.bind_uid(peer_uid, conn.remote_addr),
                    None => self.bind_by_address(conn),
                }
            }
            Ok(record) => {
                debug!(peer = %conn.remote_addr, operation = %record.operation,
                    "first record is not an identity announcement");
                self.bind_by_address(conn);
            }
            Err(e) => {
                debug!(peer = %conn.remote_addr, "undecodable first record: {}", e);
                self.bind_by_address(conn);
            }
        }
        Ok(())
    }

    /// Peers that do not announce a UID stay addressable by their address.
    fn bind_by_address(&self, conn: &Connection) {
        self.registry.bind_uid(conn.remote_addr.to_string(), conn.remote_addr);
    }

    /// Fills the read buffer, reassembles frames across reads, decodes and
    /// forwards every complete record. Exits on I/O error, zero-length read,
    /// an expired deadline (servers) or the close signal.
    async fn reader_loop(self: Arc<Self>, mut read_half: OwnedReadHalf, mut residue: BytesMut, conn: Arc<Connection>) {
        let mut closed = conn.closed_signal();
        let mut buf = vec![0u8; self.read_buffer_size];

        loop {
            let n = tokio::select! {
                _ = closed.wait_for(|closed| *closed) => break,
                read = self.read_some(&mut read_half, &mut buf) => match read {
                    Ok(0) => {
                        debug!(peer = %conn.remote_addr, "peer closed the connection");
                        break;
                    }
                    Ok(n) => n,
                    Err(e) => {
                        debug!(peer = %conn.remote_addr, "read failed: {}", e);
                        break;
                    }
                },
            };

            residue.extend_from_slice(&buf[..n]);
            for payload in self.framer.unpack(&mut residue) {
                self.decode_and_enqueue(payload, &conn).await;
            }
        }

        self.teardown(&conn);
    }

    /// Servers bound every read with the configured deadline so silent peers
    /// are torn down; clients read without one and rely on their heartbeat
    /// surfacing dead links through write errors.
    async fn read_some(&self, read_half: &mut OwnedReadHalf, buf: &mut [u8]) -> io::Result<usize> {
        match self.mode {
            Mode::Server => timeout(self.timeout, read_half.read(buf))
                .await
                .unwrap_or_else(|_| Err(io::Error::new(io::ErrorKind::TimedOut, "read deadline expired"))),
            Mode::Client => read_half.read(buf).await,
        }
    }

    async fn decode_and_enqueue(&self, payload: Bytes, conn: &Connection) {
        match serde_json::from_slice::<Record>(&payload) {
            Ok(mut record) => {
                if record.from.is_empty() {
                    record.from = conn.remote_addr.to_string();
                }
                trace!(peer = %conn.remote_addr, operation = %record.operation, "record received");
                if self.inbound.send(record).await.is_err() {
                    debug!(peer = %conn.remote_addr, "inbound queue is gone - dropping record");
                }
            }
            Err(e) => {
                debug!(peer = %conn.remote_addr, "dropping undecodable payload: {}", e);
            }
        }
    }

    /// Drains the connection's mailbox onto the socket. On a client, an idle
    /// mailbox produces a heartbeat every timeout interval. Exits on write
    /// failure or the close signal.
    async fn writer_loop(
        self: Arc<Self>,
        mut write_half: OwnedWriteHalf,
        mut outbox: mpsc::Receiver<Record>,
        conn: Arc<Connection>,
    ) {
        let mut closed = conn.closed_signal();
        let mut heartbeat_counter: u64 = 0;

        loop {
            let record = tokio::select! {
                _ = closed.wait_for(|closed| *closed) => break,
                next = self.next_outbound(&mut outbox, &conn, &mut heartbeat_counter) => match next {
                    Some(record) => record,
                    None => break,
                },
            };

            let payload = match serde_json::to_vec(&record) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(operation = %record.operation, "failed to encode record: {}", e);
                    continue;
                }
            };
            let frame = match self.framer.pack(&payload) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(operation = %record.operation, "failed to frame record: {}", e);
                    continue;
                }
            };
            if let Err(e) = write_half.write_all(&frame).await {
                debug!(peer = %conn.remote_addr, "write failed: {}", e);
                break;
            }
            trace!(peer = %conn.remote_addr, operation = %record.operation, "record sent");
        }

        self.teardown(&conn);
    }

    async fn next_outbound(
        &self,
        outbox: &mut mpsc::Receiver<Record>,
        conn: &Connection,
        heartbeat_counter: &mut u64,
    ) -> Option<Record> {
        match self.mode {
            Mode::Server => outbox.recv().await,
            Mode::Client => match timeout(self.timeout, outbox.recv()).await {
                Ok(record) => record,
                Err(_) => {
                    *heartbeat_counter += 1;
                    Some(Record::addressed(
                        conn.local_addr,
                        conn.remote_addr,
                        HEARTBEAT,
                        Value::from(*heartbeat_counter),
                    ))
                }
            },
        }
    }

    /// Either worker funnels through here on exit; the first call closes the
    /// connection (waking the sibling) and deregisters it.
    fn teardown(&self, conn: &Connection) {
        conn.close();
        if self.registry.remove(conn.remote_addr) {
            debug!(peer = %conn.remote_addr, "connection deregistered");
        }
    }
}

/// SO_REUSEADDR lets a restarted server rebind its port while connections from
/// the previous incarnation linger in TIME_WAIT.
fn bind_listener(port: u16) -> io::Result<TcpListener> {
    let socket = TcpSocket::new_v4()?;
    socket.set_reuseaddr(true)?;
    socket.bind(std::net::SocketAddr::from(([0, 0, 0, 0], port)))?;
    socket.listen(1024)
}
