// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! DHCHAP key management. Keys are generated on demand with
//! `nvme gen-dhchap-key`, cached so wiring and reconnects hand out the
//! same secret, and rotated only when the run allows it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::info;

use crate::check::WorkflowError;
use crate::config::{AuthMode, ConfigError};
use crate::gwcli::GwCli;
use crate::node::Node;
use crate::remote::{ExecError, Executor};

#[derive(Debug)]
pub struct AuthManager {
    mode: AuthMode,
    update_key: bool,
    exec: Arc<dyn Executor>,
    /// Node the keygen commands run on.
    keygen: Node,
    /// Controller secrets, one per subsystem.
    subsystem_keys: Mutex<HashMap<String, String>>,
    /// Host secrets, unique per (subsystem, host) pair.
    host_keys: Mutex<HashMap<(String, String), String>>,
}

impl AuthManager {
    pub fn new(mode: AuthMode, update_key: bool, exec: Arc<dyn Executor>, keygen: Node) -> Self {
        AuthManager {
            mode,
            update_key,
            exec,
            keygen,
            subsystem_keys: Mutex::new(HashMap::new()),
            host_keys: Mutex::new(HashMap::new()),
        }
    }

    pub fn mode(&self) -> AuthMode {
        self.mode
    }

    pub fn enabled(&self) -> bool {
        self.mode != AuthMode::None
    }

    pub fn bidirectional(&self) -> bool {
        self.mode == AuthMode::Bidirectional
    }

    async fn generate(&self, nqn: &str) -> Result<String, ExecError> {
        let cmd = format!("nvme gen-dhchap-key -n {nqn}");
        let out = self.keygen.run(self.exec.as_ref(), &cmd).await?;
        let key = out.stdout.trim().to_string();
        if !key.starts_with("DHHC-1:") {
            return Err(ExecError::parse(&cmd, "output is not a DHCHAP key"));
        }
        Ok(key)
    }

    /// Controller secret for a subsystem. Generated once and reused from
    /// then on; only bidirectional runs have one.
    pub async fn subsystem_key(&self, subsystem: &str) -> Result<Option<String>, ExecError> {
        if !self.bidirectional() {
            return Ok(None);
        }
        if let Some(key) = self.subsystem_keys.lock().unwrap().get(subsystem) {
            return Ok(Some(key.clone()));
        }
        let key = self.generate(subsystem).await?;
        // A racing generate may have stored one first; whatever ends up in
        // the map is the key everyone uses.
        Ok(Some(
            self.subsystem_keys
                .lock()
                .unwrap()
                .entry(subsystem.to_string())
                .or_insert(key)
                .clone(),
        ))
    }

    /// Host secret for one (subsystem, host) pair. Every pair gets its own
    /// key; disabled runs have none.
    pub async fn host_key(
        &self,
        subsystem: &str,
        hostnqn: &str,
    ) -> Result<Option<String>, ExecError> {
        if !self.enabled() {
            return Ok(None);
        }
        let pair = (subsystem.to_string(), hostnqn.to_string());
        if let Some(key) = self.host_keys.lock().unwrap().get(&pair) {
            return Ok(Some(key.clone()));
        }
        let key = self.generate(hostnqn).await?;
        Ok(Some(
            self.host_keys
                .lock()
                .unwrap()
                .entry(pair)
                .or_insert(key)
                .clone(),
        ))
    }

    /// Secrets a connect call needs, as (host secret, controller secret).
    pub async fn secrets_for(
        &self,
        subsystem: &str,
        hostnqn: &str,
    ) -> Result<(Option<String>, Option<String>), ExecError> {
        Ok((
            self.host_key(subsystem, hostnqn).await?,
            self.subsystem_key(subsystem).await?,
        ))
    }

    /// Wire one subsystem's auth on a gateway: set the controller key when
    /// bidirectional, then grant each host with its own secret.
    pub async fn apply(
        &self,
        cli: &GwCli,
        subsystem: &str,
        hostnqns: &[String],
    ) -> Result<(), ExecError> {
        if !self.enabled() {
            return Ok(());
        }
        if let Some(key) = self.subsystem_key(subsystem).await? {
            cli.subsystem_change_key(subsystem, &key).await?;
        }
        for hostnqn in hostnqns {
            let key = self.host_key(subsystem, hostnqn).await?;
            cli.host_add(subsystem, hostnqn, key.as_deref()).await?;
        }
        Ok(())
    }

    /// Replace every key on one subsystem. Refused unless the run opted in
    /// with update_dhchap_key; initiators must reconnect with the fresh
    /// secrets afterwards.
    pub async fn rotate(
        &self,
        cli: &GwCli,
        subsystem: &str,
        hostnqns: &[String],
    ) -> Result<(), WorkflowError> {
        if !self.enabled() {
            return Err(ConfigError::Invalid("key rotation with auth disabled".to_string()).into());
        }
        if !self.update_key {
            return Err(ConfigError::Invalid(
                "key rotation requires update_dhchap_key".to_string(),
            )
            .into());
        }
        info!("rotating DHCHAP keys on {subsystem}");
        if self.bidirectional() {
            let key = self.generate(subsystem).await?;
            cli.subsystem_change_key(subsystem, &key).await?;
            self.subsystem_keys
                .lock()
                .unwrap()
                .insert(subsystem.to_string(), key);
        }
        for hostnqn in hostnqns {
            let key = self.generate(hostnqn).await?;
            cli.host_change_key(subsystem, hostnqn, &key).await?;
            self.host_keys
                .lock()
                .unwrap()
                .insert((subsystem.to_string(), hostnqn.clone()), key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::RawOutput;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::runtime::Runtime;

    #[derive(Debug, Default)]
    struct KeySource {
        calls: AtomicU32,
    }

    #[async_trait]
    impl Executor for KeySource {
        async fn exec(&self, _hostname: &str, _cmd: &str) -> Result<RawOutput, ExecError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(RawOutput {
                status: Some(0),
                stdout: format!("DHHC-1:00:key{n}:\n"),
                stderr: String::new(),
            })
        }
    }

    fn manager(mode: AuthMode) -> AuthManager {
        AuthManager::new(
            mode,
            false,
            Arc::new(KeySource::default()),
            Node::new("node-0", "host0.example.net", "10.0.0.1"),
        )
    }

    #[test]
    fn subsystem_key_is_generated_once() {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let auth = manager(AuthMode::Bidirectional);
            let first = auth.subsystem_key("nqn.2016-06.io.spdk:cnode1").await.unwrap();
            let second = auth.subsystem_key("nqn.2016-06.io.spdk:cnode1").await.unwrap();
            assert_eq!(first, second);
            assert!(first.unwrap().starts_with("DHHC-1:"));
        });
    }

    #[test]
    fn host_keys_are_unique_per_pair() {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let auth = manager(AuthMode::Unidirectional);
            let a = auth.host_key("cnode1", "nqn.host-a").await.unwrap().unwrap();
            let b = auth.host_key("cnode1", "nqn.host-b").await.unwrap().unwrap();
            let a_again = auth.host_key("cnode1", "nqn.host-a").await.unwrap().unwrap();
            assert_ne!(a, b);
            assert_eq!(a, a_again);
        });
    }

    #[test]
    fn secrets_match_the_auth_mode() {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let none = manager(AuthMode::None);
            assert_eq!(none.secrets_for("cnode1", "nqn.host-a").await.unwrap(), (None, None));

            let uni = manager(AuthMode::Unidirectional);
            let (host, ctrl) = uni.secrets_for("cnode1", "nqn.host-a").await.unwrap();
            assert!(host.is_some());
            assert!(ctrl.is_none());

            let bi = manager(AuthMode::Bidirectional);
            let (host, ctrl) = bi.secrets_for("cnode1", "nqn.host-a").await.unwrap();
            assert!(host.is_some());
            assert!(ctrl.is_some());
        });
    }
}
