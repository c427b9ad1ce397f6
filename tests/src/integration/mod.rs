//! # Integration Scenarios
//!
//! Each scenario starts a [`RelayNode`](relay_node::RelayNode) on the
//! in-memory broker. Workers are either the node's own or hand-written
//! consumers that misbehave on purpose.

pub mod failures;
pub mod request_reply;
pub mod scaling;

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use relay_node::container::NodeConfig;
use relay_node::RelayNode;
use shared_bus::{DeliveryStream, InMemoryBroker, MessageBroker};
use shared_types::{ReplyEnvelope, RequestEnvelope};

/// Node config with `workers` built-in workers and fast reconnects.
pub fn node_config(workers: usize) -> NodeConfig {
    let mut config = NodeConfig::default();
    config.workers.count = workers;
    config.gateway.broker.reconnect_delay = Duration::from_millis(10);
    config
}

/// Start a node, panicking on failure.
pub async fn start_node(config: NodeConfig) -> Arc<RelayNode> {
    Arc::new(RelayNode::start(config).await.expect("node should start"))
}

/// Open a consumer on the node's request queue.
pub async fn consume_requests(node: &RelayNode) -> DeliveryStream {
    node.broker()
        .consume(&node.config().gateway.broker.request_queue, 1)
        .await
        .expect("request queue should exist")
}

/// Answer the next request after `delay`, sending the reply `copies` times.
pub async fn answer_next(
    broker: &Arc<InMemoryBroker>,
    requests: &mut DeliveryStream,
    delay: Duration,
    copies: usize,
) -> RequestEnvelope {
    let delivery = requests.next().await.expect("request delivery");
    let request = RequestEnvelope::try_from(delivery.envelope().clone()).expect("well-formed request");

    tokio::time::sleep(delay).await;

    let mut output = request.payload.to_vec();
    output.extend_from_slice(b" bar");
    for _ in 0..copies {
        broker
            .publish_reply(
                &request.reply_to,
                ReplyEnvelope::new(request.correlation_id, output.clone()),
            )
            .await
            .expect("reply publish");
    }
    delivery.ack();
    request
}

/// Poll `condition` every few milliseconds until it holds or `limit` passes.
pub async fn eventually(limit: Duration, mut condition: impl FnMut() -> bool) -> bool {
    tokio::time::timeout(limit, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .is_ok()
}
