// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::fmt;

use crate::config::NodeConfig;
use crate::remote::{CmdOutput, ExecError, Executor};

/// One machine in the test bed. Nodes are addressed by ssh through the
/// cluster's executor; the id is how config and workflows refer to them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub id: String,
    pub hostname: String,
    pub addr: String,
}

impl Node {
    pub fn new(id: &str, hostname: &str, addr: &str) -> Self {
        Node {
            id: id.to_string(),
            hostname: hostname.to_string(),
            addr: addr.to_string(),
        }
    }

    pub fn from_config(conf: &NodeConfig) -> Self {
        Node::new(&conf.id, &conf.hostname, &conf.addr)
    }

    /// Run a command on this node, erroring on nonzero exit.
    pub async fn run(&self, exec: &dyn Executor, cmd: &str) -> Result<CmdOutput, ExecError> {
        exec.run(&self.hostname, cmd).await
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
        write!(f, "{} ({})", self.id, self.hostname)
    }
}
