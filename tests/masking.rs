// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use tokio::runtime::Runtime;

    use cuttle_lib::{
        check::WorkflowError,
        cluster::Cluster,
        config::{Config, SubsystemConfig},
        initiator::ConnectSpec,
        masking::{Masking, Visibility},
        test_env::{self, MockCluster},
    };

    /// Masking manages its own namespaces, so the bed starts with none
    /// provisioned and adds `total` restricted ones up front.
    struct MaskingBed {
        mock: Arc<MockCluster>,
        cluster: Cluster,
        subs: Vec<SubsystemConfig>,
        specs: HashMap<String, Vec<ConnectSpec>>,
    }

    impl MaskingBed {
        async fn provision(total: u32) -> Self {
            let mut config = test_env::config();
            for sub in &mut config.group.subsystems {
                sub.namespaces = 0;
            }
            let (mock, cluster) = test_env::mock_cluster(config).await;
            cluster.configure().await.unwrap();

            let subs = cluster.config.group.subsystems.clone();
            let masking = Masking {
                group: &cluster.group,
                initiators: &cluster.initiators,
                workers: cluster.config.io.workers,
            };
            let added = masking.add(&subs, total, true, "1G").await.unwrap();
            assert_eq!(added, total);

            let specs = cluster.connect_spec_map().await.unwrap();
            MaskingBed {
                mock,
                cluster,
                subs,
                specs,
            }
        }

        fn masking(&self) -> Masking {
            Masking {
                group: &self.cluster.group,
                initiators: &self.cluster.initiators,
                workers: self.cluster.config.io.workers,
            }
        }
    }

    #[test]
    fn restricted_namespaces_start_invisible() {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let bed = MaskingBed::provision(4).await;

            // Two namespaces landed on each subsystem.
            assert_eq!(bed.mock.namespace_count(&bed.subs[0].nqn), 2);
            assert_eq!(bed.mock.namespace_count(&bed.subs[1].nqn), 2);

            let masking = bed.masking();
            masking
                .validate_namespaces(&bed.subs, false, None)
                .await
                .unwrap();
            masking
                .validate_initiators(&bed.subs, &bed.specs, Visibility::Nothing, None)
                .await
                .unwrap();
        });
    }

    #[test]
    fn granted_hosts_see_their_share() {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let bed = MaskingBed::provision(4).await;
            let masking = bed.masking();
            masking.add_host(&bed.subs).await.unwrap();

            // Each namespace now carries exactly its owner's NQN.
            let owners = bed.cluster.hostnqns().await.unwrap();
            masking
                .validate_namespaces(&bed.subs, false, Some(&owners))
                .await
                .unwrap();
            masking
                .validate_initiators(&bed.subs, &bed.specs, Visibility::OwnShare, None)
                .await
                .unwrap();
            masking
                .validate_initiators(&bed.subs, &bed.specs, Visibility::OwnShare, Some("node10"))
                .await
                .unwrap();

            // Revoking the grants hides everything again.
            masking.del_host(&bed.subs).await.unwrap();
            masking
                .validate_initiators(&bed.subs, &bed.specs, Visibility::Nothing, None)
                .await
                .unwrap();
        });
    }

    #[test]
    fn visibility_flip_exposes_all_namespaces() {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let bed = MaskingBed::provision(4).await;
            let masking = bed.masking();
            masking.add_host(&bed.subs).await.unwrap();

            // The flip needs force because grants exist, and clears them.
            masking
                .change_visibility(&bed.subs, true, true)
                .await
                .unwrap();
            masking
                .validate_namespaces(&bed.subs, true, None)
                .await
                .unwrap();

            // Newer nvme-cli nests the listing; the checks must not care.
            bed.mock.use_tree_listing();
            masking
                .validate_initiators(&bed.subs, &bed.specs, Visibility::All, None)
                .await
                .unwrap();
        });
    }

    #[test]
    fn wrong_expectation_is_flagged() {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let bed = MaskingBed::provision(4).await;

            // Nothing was granted, so expecting full visibility must fail.
            let err = bed
                .masking()
                .validate_initiators(&bed.subs, &bed.specs, Visibility::All, None)
                .await
                .unwrap_err();
            assert!(matches!(err, WorkflowError::Check(_)), "got {err}");
        });
    }

    #[test]
    fn uneven_split_is_refused() {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let bed = MaskingBed::provision(4).await;

            // 5 namespaces cannot spread evenly over 2 subsystems.
            let err = bed
                .masking()
                .add(&bed.subs, 5, true, "1G")
                .await
                .unwrap_err();
            assert!(matches!(err, WorkflowError::Config(_)), "got {err}");
            assert_eq!(bed.mock.namespace_count(&bed.subs[0].nqn), 2);
        });
    }
}
