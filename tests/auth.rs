// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::runtime::Runtime;

    use cuttle_lib::{
        check::WorkflowError,
        cluster::Cluster,
        config::{AuthMode, Config},
        state::State,
        test_env::{self, MockCluster},
    };

    fn auth_config(mode: AuthMode, update: bool) -> Config {
        let mut config = test_env::config();
        config.auth.mode = mode;
        config.auth.update_dhchap_key = update;
        for sub in &mut config.group.subsystems {
            sub.allow_any_host = false;
        }
        config
    }

    async fn secured_bed(mode: AuthMode, update: bool) -> (Arc<MockCluster>, Cluster) {
        let (mock, cluster) = test_env::mock_cluster(auth_config(mode, update)).await;
        cluster.configure().await.unwrap();
        cluster.connect_initiators().await.unwrap();
        (mock, cluster)
    }

    #[test]
    fn bidirectional_auth_connects_and_rotates() {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let (mock, cluster) = secured_bed(AuthMode::Bidirectional, true).await;

            // The mock rejects connects with a stale or missing secret, so
            // visible devices prove both key directions were presented.
            for initiator in &cluster.initiators {
                assert_eq!(initiator.list_devices().await.unwrap().len(), 4);
            }
            assert!(!mock.commands_containing("--dhchap-ctrl-secret").is_empty());

            let state = State::new(&test_env::statefile("auth_rotate")).unwrap();
            cluster.rotate_keys(&state).await.unwrap();

            // Fresh keys were pushed per subsystem and per host, and the
            // initiators reconnected against them.
            assert_eq!(mock.commands_containing("host change_key").len(), 4);
            for sub in &cluster.config.group.subsystems {
                assert_eq!(state.delta().keys_rotated.get(&sub.nqn), Some(&1));
            }
            for initiator in &cluster.initiators {
                assert_eq!(initiator.list_devices().await.unwrap().len(), 4);
            }
        });
    }

    #[test]
    fn unidirectional_auth_skips_controller_keys() {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let (mock, cluster) = secured_bed(AuthMode::Unidirectional, false).await;

            for initiator in &cluster.initiators {
                assert_eq!(initiator.list_devices().await.unwrap().len(), 4);
            }

            // Host secrets only: nothing set a subsystem key.
            assert!(!mock.commands_containing("--dhchap-secret").is_empty());
            assert!(mock.commands_containing("subsystem change_key").is_empty());
            assert!(mock.commands_containing("--dhchap-ctrl-secret").is_empty());
        });
    }

    #[test]
    fn rotation_needs_the_update_flag() {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let (_mock, cluster) = secured_bed(AuthMode::Unidirectional, false).await;

            let state = State::new(&test_env::statefile("auth_no_update")).unwrap();
            let err = cluster.rotate_keys(&state).await.unwrap_err();
            assert!(matches!(err, WorkflowError::Config(_)), "got {err}");
            assert!(state.delta().keys_rotated.is_empty());
        });
    }
}
