// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::runtime::Runtime;

    use cuttle_lib::{
        check::WorkflowError,
        cluster::Cluster,
        config::{Config, FaultMethod},
        ha::Ha,
        state::State,
        test_env::{self, MockCluster},
    };

    /// A configured cluster with connected initiators and a fresh journal.
    struct HaBed {
        mock: Arc<MockCluster>,
        cluster: Cluster,
        state: State,
        statefile: String,
    }

    impl HaBed {
        async fn up(test_id: &str) -> Self {
            Self::with_config(test_id, test_env::config()).await
        }

        async fn with_config(test_id: &str, config: Config) -> Self {
            let (mock, cluster) = test_env::mock_cluster(config).await;
            cluster.configure().await.unwrap();
            cluster.connect_initiators().await.unwrap();
            let statefile = test_env::statefile(test_id);
            let state = State::new(&statefile).unwrap();
            HaBed {
                mock,
                cluster,
                state,
                statefile,
            }
        }

        fn ha(&self) -> Ha {
            Ha {
                exec: &self.cluster.exec,
                orch: &self.cluster.orch,
                group: &self.cluster.group,
                initiators: &self.cluster.initiators,
                state: &self.state,
                conf: &self.cluster.config.ha,
            }
        }
    }

    #[test]
    fn failover_moves_groups_to_survivor() {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let bed = HaBed::up("ha_failover").await;

            // failover validates path states on every initiator itself;
            // an Ok already means exactly one optimized path per device.
            let outcome = bed.ha().failover(&["node6".to_string()]).await.unwrap();

            assert!(!bed.mock.is_up("node6"));
            assert_eq!(outcome.groups.get("node6"), Some(&1));
            assert_eq!(outcome.serving.get(&1), Some(&"node7".to_string()));

            // Half of the four namespaces lived on the failed group.
            assert_eq!(outcome.namespaces().len(), 2);

            assert_eq!(
                bed.state.delta().failed_gateways(),
                vec!["node6".to_string()]
            );
        });
    }

    #[test]
    fn failback_restores_ownership() {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let bed = HaBed::up("ha_failback").await;
            let ha = bed.ha();

            ha.failover(&["node7".to_string()]).await.unwrap();
            assert!(!bed.mock.is_up("node7"));

            ha.failback(&["node7".to_string()]).await.unwrap();
            assert!(bed.mock.is_up("node7"));
            assert!(bed.state.delta().failed_gateways().is_empty());

            // The journal holds the full fail/restore history across reopens.
            let reopened = State::new(&bed.statefile).unwrap();
            assert!(reopened.delta().failed_gateways().is_empty());
        });
    }

    #[test]
    fn stopping_every_gateway_is_refused() {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let bed = HaBed::up("ha_all_down").await;

            let targets = vec!["node6".to_string(), "node7".to_string()];
            let err = bed.ha().failover(&targets).await.unwrap_err();
            assert!(matches!(err, WorkflowError::Check(_)), "got {err}");

            // Refused before anything was stopped.
            assert!(bed.mock.is_up("node6"));
            assert!(bed.mock.is_up("node7"));
        });
    }

    #[test]
    fn non_gateway_target_is_refused() {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let bed = HaBed::up("ha_bad_target").await;

            let err = bed
                .ha()
                .failover(&["node10".to_string()])
                .await
                .unwrap_err();
            assert!(matches!(err, WorkflowError::Check(_)), "got {err}");
        });
    }

    #[test]
    fn orch_daemon_fault_method() {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let mut config = test_env::config();
            config.ha.method = FaultMethod::OrchDaemon;
            let bed = HaBed::with_config("ha_orch_daemon", config).await;
            let ha = bed.ha();

            ha.failover(&["node6".to_string()]).await.unwrap();
            assert!(!bed.mock.is_up("node6"));
            ha.failback(&["node6".to_string()]).await.unwrap();
            assert!(bed.mock.is_up("node6"));

            // Faults went through the orchestrator, not systemd.
            assert!(!bed.mock.commands_containing("orch daemon stop").is_empty());
            assert!(bed.mock.commands_containing("systemctl stop").is_empty());
        });
    }

    #[test]
    fn cleanup_restores_failed_gateways() {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            use cuttle_lib::config::CleanupItem;

            let bed = HaBed::up("ha_cleanup").await;
            bed.ha().failover(&["node6".to_string()]).await.unwrap();
            assert!(!bed.mock.is_up("node6"));

            let items = [CleanupItem::Initiators, CleanupItem::Subsystems];
            let failures = bed.cluster.cleanup(&items, &bed.state.delta()).await;
            assert_eq!(failures, 0);

            // The failed gateway was restarted before teardown.
            assert!(bed.mock.is_up("node6"));
            for sub in &bed.cluster.config.group.subsystems {
                assert_eq!(bed.mock.namespace_count(&sub.nqn), 0);
            }
            for initiator in &bed.cluster.initiators {
                assert!(initiator.list_devices().await.unwrap().is_empty());
            }

            let items = [CleanupItem::Service, CleanupItem::Pool];
            let failures = bed.cluster.cleanup(&items, &bed.state.delta()).await;
            assert_eq!(failures, 0);
            assert!(!bed.mock.commands_containing("ceph orch rm").is_empty());
            assert!(!bed
                .mock
                .commands_containing("ceph osd pool delete")
                .is_empty());
        });
    }

    #[test]
    fn reef_report_drives_failover() {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let mut config = test_env::config();
            config.cluster.release = cuttle_lib::config::Release::Reef;
            let bed = HaBed::with_config("ha_reef", config).await;
            let ha = bed.ha();

            let outcome = ha.failover(&["node6".to_string()]).await.unwrap();
            assert_eq!(outcome.serving.get(&1), Some(&"node7".to_string()));
            ha.failback(&["node6".to_string()]).await.unwrap();
        });
    }
}
