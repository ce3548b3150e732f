use std::time::Duration;

use peerlink::handler::Api;
use peerlink::node::Node;
use tracing::info;

/// Sends an "echo" request to the echo_server demo once a second and logs the
/// replies.
#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let api = Api::new().on("echo", |reply| {
        info!(body = %reply.body, from = %reply.from, "echo reply");
        None
    });

    let mut node = Node::new();
    node.set_uid("echo-client");
    node.set_api(api);
    node.client("127.0.0.1", 9988);

    for n in 0.. {
        node.request_to(format!("hello #{}", n), "echo", "echo-server").await;
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}
