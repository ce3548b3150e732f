use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Reserved operation: announces the sender's UID right after connecting.
/// The default handler echoes the request, so a node that somehow receives a
/// late identity record outside the handshake answers with its own view.
pub const IDENTITY: &str = "+|+";

/// Reserved operation: client-to-server keep-alive. The default handler
/// swallows it.
pub const HEARTBEAT: &str = "-|-";

/// The unit of exchange. One record travels as one frame; the wire field names
/// are capitalized for compatibility with existing deployments.
///
/// `from` may be empty on arrival, in which case the receiver back-fills it
/// from the socket's remote address before dispatching.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Record {
    #[serde(rename = "From", default)]
    pub from: String,
    #[serde(rename = "To", default)]
    pub to: String,
    #[serde(rename = "Operation", default)]
    pub operation: String,
    #[serde(rename = "Body", default)]
    pub body: Value,
}

impl Record {
    /// A fully addressed record, ready for a connection's mailbox.
    pub fn addressed(from: SocketAddr, to: SocketAddr, operation: &str, body: Value) -> Record {
        Record {
            from: from.to_string(),
            to: to.to_string(),
            operation: operation.to_string(),
            body,
        }
    }

    /// A reply carrying just a body. The dispatcher fills in the addresses and
    /// copies the request's operation.
    pub fn reply(body: impl Into<Value>) -> Record {
        Record {
            body: body.into(),
            ..Record::default()
        }
    }

    /// A reply with an explicit operation, for handlers that answer under a
    /// different name than they were called by.
    pub fn reply_as(operation: &str, body: impl Into<Value>) -> Record {
        Record {
            operation: operation.to_string(),
            body: body.into(),
            ..Record::default()
        }
    }
}
