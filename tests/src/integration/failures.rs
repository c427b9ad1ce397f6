//! # Failure Scenarios
//!
//! Broker outages, abandoned callers and degenerate timeouts. In every case
//! the caller gets exactly one outcome and the pending table ends empty.

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use relay_node::handlers::RpcWorker;
    use rpc_gateway::CallError;
    use shared_bus::MessageBroker;
    use shared_types::ReplyEnvelope;
    use tokio::sync::watch;

    use crate::integration::{eventually, node_config, start_node};

    #[tokio::test]
    async fn test_disconnect_fails_pending_then_recovers() {
        let node = start_node(node_config(0)).await;

        let call = {
            let node = Arc::clone(&node);
            tokio::spawn(async move { node.pool().submit("foo", Duration::from_secs(30)).await })
        };
        assert!(eventually(Duration::from_secs(1), || node.pool().pending_count() == 1).await);

        node.broker().disconnect();

        let result = tokio::time::timeout(Duration::from_secs(1), call)
            .await
            .expect("disconnect should fail the call promptly")
            .unwrap();
        assert!(matches!(result, Err(CallError::BrokerDisconnected)));
        assert_eq!(node.pool().pending_count(), 0);

        node.broker().reconnect();

        let (_shutdown, rx) = watch::channel(false);
        let worker = RpcWorker::new(
            0,
            Arc::clone(node.broker()) as Arc<dyn MessageBroker>,
            node.config().gateway.broker.request_queue.clone(),
            1,
            " bar",
            Duration::from_millis(10),
            rx,
        );
        tokio::spawn(worker.run());

        let reply = node
            .pool()
            .submit("again", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(reply.payload, "again bar");

        let metrics = node.pool().instances()[0].metrics();
        assert_eq!(metrics.disconnect_failures.get(), 1);

        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_publish_while_disconnected_fails_fast() {
        let node = start_node(node_config(0)).await;
        node.broker().disconnect();

        let started = tokio::time::Instant::now();
        let result = node.pool().submit("foo", Duration::from_secs(30)).await;

        assert!(matches!(result, Err(CallError::PublishFailed(_))));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(node.pool().pending_count(), 0);

        node.broker().reconnect();
        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_abandoned_caller_leaves_no_entry() {
        let node = start_node(node_config(0)).await;

        let call = {
            let node = Arc::clone(&node);
            tokio::spawn(async move { node.pool().submit("foo", Duration::from_secs(30)).await })
        };
        assert!(eventually(Duration::from_secs(1), || node.pool().pending_count() == 1).await);
        let id = node.pool().pending_entries()[0].correlation_id;

        call.abort();
        assert!(call.await.unwrap_err().is_cancelled());
        assert!(eventually(Duration::from_secs(1), || node.pool().pending_count() == 0).await);

        // A reply for the abandoned request has nowhere to go.
        let correlator = &node.pool().instances()[0];
        node.broker()
            .publish_reply(&correlator.reply_to(), ReplyEnvelope::new(id, "foo bar"))
            .await
            .unwrap();

        let metrics = Arc::clone(correlator.metrics());
        assert!(
            eventually(Duration::from_secs(1), || {
                metrics.stale_replies.get() == 1
            })
            .await
        );

        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_zero_timeout_returns_immediately() {
        let node = start_node(node_config(0)).await;

        let result = tokio::time::timeout(
            Duration::from_secs(1),
            node.pool().submit("foo", Duration::ZERO),
        )
        .await
        .expect("zero timeout should not block");

        assert!(matches!(result, Err(CallError::Timeout { .. })));
        assert_eq!(node.pool().pending_count(), 0);

        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_is_cancelled() {
        let node = start_node(node_config(1)).await;
        node.shutdown().await;

        let result = node.pool().submit("late", Duration::from_secs(1)).await;
        assert!(matches!(result, Err(CallError::Cancelled)));
    }
}
