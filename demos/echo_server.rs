use peerlink::handler::Api;
use peerlink::node::Node;
use peerlink::record::Record;
use tracing::info;

/// Answers every "echo" request with its own body. Run the echo_client demo
/// against it from another terminal.
#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let api = Api::new().on("echo", |request| {
        info!(body = %request.body, "echo request");
        Some(Record::reply(request.body))
    });

    let mut node = Node::new();
    node.set_uid("echo-server");
    node.set_api(api);
    node.server(9988);

    tokio::signal::ctrl_c().await.ok();
    node.shutdown();
}
