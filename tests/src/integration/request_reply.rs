//! # Request/Reply Scenarios
//!
//! The happy path and the delivery anomalies a worker pool produces under
//! at-least-once semantics: late replies, duplicate replies and
//! redelivery after a worker dies mid-request.

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use futures::StreamExt;
    use relay_node::handlers::RpcWorker;
    use rpc_gateway::CallError;
    use shared_bus::MessageBroker;
    use tokio::sync::watch;

    use crate::integration::{answer_next, consume_requests, eventually, node_config, start_node};

    #[tokio::test]
    async fn test_reply_after_50ms_within_30s_timeout() {
        let node = start_node(node_config(0)).await;
        let mut requests = consume_requests(&node).await;

        let worker = {
            let broker = Arc::clone(node.broker());
            tokio::spawn(async move {
                answer_next(&broker, &mut requests, Duration::from_millis(50), 1).await
            })
        };

        let reply = node
            .pool()
            .submit("foo", Duration::from_secs(30))
            .await
            .unwrap();

        assert_eq!(reply.payload, "foo bar");
        assert!(reply.latency >= Duration::from_millis(50));
        assert!(reply.latency < Duration::from_secs(5));
        assert_eq!(worker.await.unwrap().correlation_id, reply.correlation_id);
        assert_eq!(node.pool().pending_count(), 0);

        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_duplicate_reply_is_discarded() {
        let node = start_node(node_config(0)).await;
        let mut requests = consume_requests(&node).await;

        let broker = Arc::clone(node.broker());
        tokio::spawn(async move { answer_next(&broker, &mut requests, Duration::ZERO, 2).await });

        let reply = node
            .pool()
            .submit("foo", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(reply.payload, "foo bar");

        let metrics = Arc::clone(node.pool().instances()[0].metrics());
        assert!(
            eventually(Duration::from_secs(1), || {
                metrics.stale_replies.get() == 1
            })
            .await,
            "second copy should be counted as stale"
        );
        assert_eq!(metrics.fulfilled.get(), 1);

        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_late_reply_after_timeout_is_harmless() {
        let node = start_node(node_config(0)).await;
        let mut requests = consume_requests(&node).await;

        let worker = {
            let broker = Arc::clone(node.broker());
            tokio::spawn(async move {
                answer_next(&broker, &mut requests, Duration::from_millis(150), 1).await;
                requests
            })
        };

        let result = node.pool().submit("slow", Duration::from_millis(50)).await;
        assert!(matches!(result, Err(CallError::Timeout { .. })));

        let mut requests = worker.await.unwrap();
        let metrics = Arc::clone(node.pool().instances()[0].metrics());
        assert!(
            eventually(Duration::from_secs(1), || {
                metrics.stale_replies.get() == 1
            })
            .await
        );

        // The loop keeps serving new requests.
        let broker = Arc::clone(node.broker());
        tokio::spawn(async move { answer_next(&broker, &mut requests, Duration::ZERO, 1).await });
        let reply = node
            .pool()
            .submit("next", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(reply.payload, "next bar");

        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_request_redelivered_after_worker_dies() {
        let node = start_node(node_config(0)).await;

        // A consumer that takes the request and dies without acknowledging.
        let crashing = {
            let node = Arc::clone(&node);
            tokio::spawn(async move {
                let mut requests = consume_requests(&node).await;
                let delivery = requests.next().await.expect("request delivery");
                assert!(!delivery.redelivered());
                // Dropping the delivery and the stream returns the message.
            })
        };

        let call = {
            let node = Arc::clone(&node);
            tokio::spawn(async move { node.pool().submit("foo", Duration::from_secs(5)).await })
        };

        crashing.await.unwrap();

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

        let reply = call.await.unwrap().unwrap();
        assert_eq!(reply.payload, "foo bar");
        assert_eq!(node.broker().stats().snapshot().redelivered, 1);

        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_node_workers_answer_every_call() {
        let node = start_node(node_config(2)).await;

        for input in ["a", "b", "c", "d"] {
            let reply = node
                .pool()
                .call(input, None)
                .await
                .unwrap();
            assert_eq!(reply.payload, format!("{} bar", input));
        }
        assert_eq!(node.pool().pending_count(), 0);

        node.shutdown().await;
    }
}
