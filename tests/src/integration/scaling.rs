//! # Scaling Scenarios
//!
//! Several correlator instances behind one node, on both pending-state
//! backends, with many workers competing for the request queue.

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::time::Duration;

    use futures::future::join_all;
    use relay_node::container::NodeConfig;
    use rpc_gateway::domain::config::PendingBackend;

    use crate::integration::{node_config, start_node};

    fn scaled_config(instances: usize, workers: usize, backend: PendingBackend) -> NodeConfig {
        let mut config = node_config(workers);
        config.gateway.correlation.instances = instances;
        config.gateway.correlation.backend = backend;
        config
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_shared_backend_concurrent_calls() {
        let node = start_node(scaled_config(3, 4, PendingBackend::Shared)).await;

        let calls = (0..60).map(|i| {
            let node = Arc::clone(&node);
            async move {
                let input = format!("req-{}", i);
                let reply = node
                    .pool()
                    .submit(input.clone(), Duration::from_secs(10))
                    .await
                    .unwrap();
                assert_eq!(reply.payload, format!("{} bar", input));
                reply.correlation_id
            }
        });

        let ids: HashSet<_> = join_all(calls).await.into_iter().collect();
        assert_eq!(ids.len(), 60);
        assert_eq!(node.pool().pending_count(), 0);

        let stale: u64 = node
            .pool()
            .instances()
            .iter()
            .map(|c| c.metrics().stale_replies.get())
            .sum();
        assert_eq!(stale, 0);

        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_round_robin_spreads_calls() {
        let node = start_node(scaled_config(3, 2, PendingBackend::Local)).await;

        for i in 0..6 {
            let reply = node
                .pool()
                .submit(format!("rr-{}", i), Duration::from_secs(5))
                .await
                .unwrap();
            assert_eq!(reply.payload, format!("rr-{} bar", i));
        }

        for correlator in node.pool().instances() {
            assert_eq!(
                correlator.metrics().fulfilled.get(),
                2,
                "{} should have served two calls",
                correlator.name()
            );
        }

        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_each_instance_times_out_independently() {
        let node = start_node(scaled_config(2, 0, PendingBackend::Local)).await;

        // Nobody answers: each instance times out independently.
        let (a, b) = tokio::join!(
            node.pool().submit("a", Duration::from_millis(100)),
            node.pool().submit("b", Duration::from_millis(100)),
        );
        assert!(a.is_err());
        assert!(b.is_err());
        assert_eq!(node.pool().pending_count(), 0);

        for correlator in node.pool().instances() {
            assert_eq!(correlator.metrics().timeouts.get(), 1);
        }

        node.shutdown().await;
    }
}
