// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::runtime::Runtime;

    use cuttle_lib::{
        cluster::Cluster,
        config::CleanupItem,
        remote::Executor,
        state::Delta,
        test_env::{self, MockCluster},
    };

    #[test]
    fn connect_tolerates_missing_service() {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let config = test_env::config();
            let mock = Arc::new(MockCluster::from_config(&config));
            mock.exec("ceph-node1", "cephadm shell -- ceph orch rm nvmeof.rbd.group1")
                .await
                .unwrap();

            // No daemons yet: connect comes up with an empty group.
            let exec: Arc<dyn Executor> = mock.clone();
            let mut cluster = Cluster::connect(config, exec).await.unwrap();
            assert!(cluster.group.gateways.is_empty());

            // Deploying discovers the gateways and fills the group in.
            cluster.deploy().await.unwrap();
            assert_eq!(cluster.group.gateways.len(), 2);
            assert!(mock.is_up("node6"));
            assert!(mock.is_up("node7"));

            cluster.configure().await.unwrap();
            cluster.connect_initiators().await.unwrap();
            for initiator in &cluster.initiators {
                assert_eq!(initiator.list_devices().await.unwrap().len(), 4);
            }
        });
    }

    #[test]
    fn redeploy_after_service_removal() {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let (mock, mut cluster) = test_env::mock_cluster(test_env::config()).await;
            cluster.configure().await.unwrap();

            let failures = cluster.cleanup(&[CleanupItem::Service], &Delta::new()).await;
            assert_eq!(failures, 0);
            assert!(!mock.is_up("node6"));

            cluster.deploy().await.unwrap();
            assert!(mock.is_up("node6"));
            assert_eq!(cluster.group.gateways.len(), 2);

            // The service came back empty and takes a fresh configure.
            assert_eq!(cluster.group.lead().unwrap().cli().subsystem_list().await.unwrap().len(), 0);
            cluster.configure().await.unwrap();
            assert_eq!(mock.namespace_count(&cluster.config.group.subsystems[0].nqn), 2);
        });
    }

    #[test]
    fn mtls_deploys_from_a_service_spec() {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let mut config = test_env::config();
            config.group.mtls = true;
            let (mock, mut cluster) = test_env::mock_cluster(config).await;
            cluster.deploy().await.unwrap();

            // mTLS only exists in the spec-file form of orch apply.
            let applied = mock.commands_containing("orch apply -i -");
            assert_eq!(applied.len(), 1);
            assert!(applied[0].contains("mtls: true"));
            assert!(applied[0].contains("enable_auth: true"));
            assert!(applied[0].contains("service_id: rbd.group1"));
            assert!(mock.commands_containing("orch apply nvmeof").is_empty());
        });
    }
}
