use std::net::SocketAddr;

use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::record::Record;

/// Registry-facing side of one established TCP link: addressing metadata, the
/// bounded outbound mailbox and the close signal. The socket halves and the
/// read/residue buffers live with the reader and writer workers, which are the
/// only tasks that touch them.
pub struct Connection {
    pub remote_addr: SocketAddr,
    pub local_addr: SocketAddr,
    outbox: mpsc::Sender<Record>,
    closed: watch::Sender<bool>,
}

impl Connection {
    /// Returns the connection handle and the receiving end of its mailbox,
    /// which the writer worker takes ownership of.
    pub fn new(
        remote_addr: SocketAddr,
        local_addr: SocketAddr,
        outbox_capacity: usize,
    ) -> (Connection, mpsc::Receiver<Record>) {
        let (outbox, outbox_rx) = mpsc::channel(outbox_capacity);
        let (closed, _) = watch::channel(false);
        (
            Connection {
                remote_addr,
                local_addr,
                outbox,
                closed,
            },
            outbox_rx,
        )
    }

    /// Appends a record to the outbound mailbox, waiting while it is full.
    /// Records enqueued after the connection closed are dropped.
    pub async fn enqueue(&self, record: Record) {
        if self.outbox.send(record).await.is_err() {
            debug!(peer = %self.remote_addr, "dropping record enqueued on a closed connection");
        }
    }

    /// Idempotent. Wakes both workers; each exits at its next suspension
    /// point and the socket halves are dropped with them.
    pub fn close(&self) {
        self.closed.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// A receiver the workers select on alongside their I/O.
    pub fn closed_signal(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }
}
