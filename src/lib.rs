// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

pub mod ana;
pub mod check;
pub mod cluster;
pub mod commands;
pub mod config;
pub mod dhchap;
pub mod gateway;
pub mod gwcli;
pub mod ha;
pub mod initiator;
pub mod io;
pub mod masking;
pub mod node;
pub mod orch;
pub mod qos;
pub mod remote;
pub mod session;
pub mod state;
pub mod test_env;

pub fn default_config_path() -> String {
    match std::env::var("CUTTLE_CONFIG") {
        Ok(conf) => conf,
        Err(_) => "/etc/cuttle/cuttle.conf".to_string(),
    }
}

pub fn default_statefile_path() -> String {
    match std::env::var("CUTTLE_STATEFILE") {
        Ok(statefile) => statefile,
        Err(_) => "/etc/cuttle/cuttle.state".to_string(),
    }
}

pub fn default_ssh_user() -> String {
    match std::env::var("CUTTLE_SSH_USER") {
        Ok(user) => user,
        Err(_) => "root".to_string(),
    }
}

/// Image used to drive the gateway CLI on the gateway nodes.
pub fn default_cli_image() -> String {
    match std::env::var("CUTTLE_CLI_IMAGE") {
        Ok(image) => image,
        Err(_) => "quay.io/ceph/nvmeof-cli:latest".to_string(),
    }
}
