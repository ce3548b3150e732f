//! Peer-symmetric request/response messaging over persistent duplex TCP links.
//!
//! Every participant runs a [node::Node]: one side listens for inbound
//! connections, the other dials and keeps redialing, but once a link is up the
//! two endpoints are equal - either side may address a request to the other,
//! identified by a stable node UID that is exchanged in an identity handshake
//! right after the connection is established.
//!
//! ## Design goals
//!
//! * The abstraction is sending / receiving *records* (a JSON object with
//!   addressing metadata and an arbitrary body) rather than streams of bytes
//! * Connections are long-lived and full duplex - one reader task and one
//!   writer task per connection, with a bounded outbound mailbox between the
//!   application and the socket
//! * A single bounded inbound queue feeds one dispatcher, which runs the
//!   handler for every record on its own short-lived task and routes an
//!   optional reply back over the originating connection
//! * Slow consumers slow down producers: a full mailbox blocks the dispatcher,
//!   a full inbound queue blocks the reader. Nothing is shed
//! * Clients detect dead links through a heartbeat pacer and redial forever;
//!   servers detect dead links through a per-read deadline
//! * Delivery is best effort and fire-and-forget - no acknowledgements, no
//!   redelivery across reconnects, no multiplexing inside a connection
//!
//! ## Wire format
//!
//! Each record travels as one frame; bytes preceding the first header
//! occurrence on a stream are discarded, which lets a receiver re-sync after
//! garbage or a half-written frame.
//!
//! ```ascii
//! FRAME  := HEADER LENGTH PAYLOAD
//! HEADER := configurable ASCII magic, default "henrylee2cn"
//! LENGTH := u32 BE = len(PAYLOAD)
//! PAYLOAD:= UTF-8 JSON { "From": string, "To": string,
//!                        "Operation": string, "Body": any }
//! ```
//!
//! Two operation names are reserved by the runtime: `+|+` announces a node's
//! UID during the handshake, `-|-` is the client-to-server heartbeat.

pub mod config;
pub mod framer;
pub mod handler;
pub mod node;
pub mod record;

mod connection;
mod dispatcher;
mod registry;
mod transport;
