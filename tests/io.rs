// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::runtime::Runtime;

    use cuttle_lib::{
        check::WorkflowError,
        cluster::Cluster,
        gwcli::QosSpec,
        io::{spawn_workload, validate_io, ValidateOpts},
        qos,
        session::IoSession,
        test_env::{self, MockCluster},
    };

    /// Start fio against every device on every initiator and wait until
    /// the jobs have reached the nodes.
    async fn start_io(mock: &Arc<MockCluster>, cluster: &Cluster, session: &mut IoSession) {
        let mut started = 0;
        for initiator in &cluster.initiators {
            let devices: Vec<String> = initiator
                .list_devices()
                .await
                .unwrap()
                .into_iter()
                .map(|dev| dev.path)
                .collect();
            assert!(!devices.is_empty());
            started += devices.len();
            spawn_workload(
                session,
                cluster.exec.clone(),
                &initiator.node.hostname,
                &devices,
                &cluster.config.io,
            );
        }
        while mock.commands_containing("fio ").len() < started {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn connected_bed() -> (Arc<MockCluster>, Cluster) {
        let (mock, cluster) = test_env::mock_cluster(test_env::config()).await;
        cluster.configure().await.unwrap();
        cluster.connect_initiators().await.unwrap();
        (mock, cluster)
    }

    #[test]
    fn written_images_grow() {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let (mock, cluster) = connected_bed().await;
            let mut session = IoSession::new(cluster.config.io.workers);
            start_io(&mock, &cluster, &mut session).await;

            let namespaces = cluster
                .group
                .lead()
                .unwrap()
                .fetch_namespaces(&[])
                .await
                .unwrap();
            assert_eq!(namespaces.len(), 4);

            let opts = ValidateOpts::from_config(&cluster.config.io);
            validate_io(&cluster.orch, &namespaces, false, &opts).await.unwrap();

            // The same namespaces cannot also pass as idle.
            let err = validate_io(&cluster.orch, &namespaces, true, &opts)
                .await
                .unwrap_err();
            assert!(matches!(err, WorkflowError::Check(_)), "got {err}");

            session.shutdown().await;
        });
    }

    #[test]
    fn idle_images_do_not_grow() {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let (_mock, cluster) = connected_bed().await;
            let namespaces = cluster
                .group
                .lead()
                .unwrap()
                .fetch_namespaces(&[])
                .await
                .unwrap();
            let opts = ValidateOpts::from_config(&cluster.config.io);

            validate_io(&cluster.orch, &namespaces, true, &opts).await.unwrap();

            let err = validate_io(&cluster.orch, &namespaces, false, &opts)
                .await
                .unwrap_err();
            assert!(matches!(err, WorkflowError::Check(_)), "got {err}");
        });
    }

    #[test]
    fn stalled_writers_are_detected() {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let (mock, cluster) = connected_bed().await;
            let mut session = IoSession::new(cluster.config.io.workers);
            start_io(&mock, &cluster, &mut session).await;

            // Jobs are running but usage stops moving.
            mock.freeze_usage();

            let namespaces = cluster
                .group
                .lead()
                .unwrap()
                .fetch_namespaces(&[])
                .await
                .unwrap();
            let opts = ValidateOpts::from_config(&cluster.config.io);
            let err = validate_io(&cluster.orch, &namespaces, false, &opts)
                .await
                .unwrap_err();
            assert!(matches!(err, WorkflowError::Check(_)), "got {err}");

            session.shutdown().await;
        });
    }

    #[test]
    fn qos_limits_apply_and_hold() {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let (mock, cluster) = connected_bed().await;
            let lead = cluster.group.lead().unwrap();
            let sub = &cluster.config.group.subsystems[0];

            let spec = QosSpec {
                rw_ios_per_second: Some(2500),
                rw_mbytes_per_second: None,
                r_mbytes_per_second: None,
                w_mbytes_per_second: Some(50),
            };
            let changed = qos::apply_and_verify(lead.cli(), &sub.nqn, &spec)
                .await
                .unwrap();
            assert_eq!(changed, 2);

            // Initiator side: writes on a device of that subsystem run at
            // the cap, which satisfies the 50 MB/s limit but not 10 MB/s.
            let serial = lead
                .cli()
                .subsystem_list()
                .await
                .unwrap()
                .into_iter()
                .find(|info| info.nqn == sub.nqn)
                .unwrap()
                .serial_number;
            let initiator = &cluster.initiators[0];
            let devices = initiator.list_devices().await.unwrap();
            let device = cuttle_lib::initiator::find_device(&devices, &serial, 1)
                .unwrap()
                .path
                .clone();

            let mut session = IoSession::new(cluster.config.io.workers);
            start_io(&mock, &cluster, &mut session).await;

            let hostname = &initiator.node.hostname;
            qos::verify_write_cap(cluster.exec.as_ref(), hostname, &device, 50)
                .await
                .unwrap();
            let err = qos::verify_write_cap(cluster.exec.as_ref(), hostname, &device, 10)
                .await
                .unwrap_err();
            assert!(matches!(err, WorkflowError::Check(_)), "got {err}");

            session.shutdown().await;
        });
    }

    #[test]
    fn empty_qos_spec_is_refused() {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let (_mock, cluster) = connected_bed().await;
            let lead = cluster.group.lead().unwrap();
            let sub = &cluster.config.group.subsystems[0];

            let spec = QosSpec::default();
            let err = qos::apply_and_verify(lead.cli(), &sub.nqn, &spec)
                .await
                .unwrap_err();
            assert!(matches!(err, WorkflowError::Config(_)), "got {err}");
        });
    }
}
