// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use clap::{Args, Subcommand};

use crate::commands::{connect, load_config, open_state, run, Cli, Handle, HandledResult};
use crate::config::Step;
use crate::session::IoSession;

#[derive(Args, Debug, Clone)]
pub struct MaskingArgs {
    #[command(subcommand)]
    pub op: MaskingOp,
}

/// Each operation maps onto one config step, so a scripted run and a
/// one-shot invocation behave identically.
#[derive(Subcommand, Debug, Clone)]
pub enum MaskingOp {
    /// Add namespaces spread evenly across the configured subsystems.
    Add {
        #[arg(short, long)]
        namespaces: u32,

        /// Create them restricted: invisible until a host is granted.
        #[arg(long)]
        restricted: bool,

        #[arg(long, default_value = "1G")]
        image_size: String,
    },
    /// Grant each initiator its share of every subsystem's namespaces.
    AddHost {
        /// Check visibility from this node only.
        #[arg(long)]
        validate_node: Option<String>,
    },
    /// Revoke the grants add-host made.
    DelHost {
        #[arg(long)]
        validate_node: Option<String>,
    },
    /// Flip the auto_visible flag on every namespace.
    Visibility {
        #[arg(long)]
        auto_visible: bool,

        /// Required by the gateway when grants would be discarded.
        #[arg(long)]
        force: bool,
    },
}

impl MaskingOp {
    fn as_step(&self) -> Step {
        match self {
            MaskingOp::Add {
                namespaces,
                restricted,
                image_size,
            } => Step::MaskingAdd {
                namespaces: *namespaces,
                no_auto_visible: *restricted,
                image_size: image_size.clone(),
            },
            MaskingOp::AddHost { validate_node } => Step::MaskingAddHost {
                validate_node: validate_node.clone(),
            },
            MaskingOp::DelHost { validate_node } => Step::MaskingDelHost {
                validate_node: validate_node.clone(),
            },
            MaskingOp::Visibility { auto_visible, force } => Step::MaskingChangeVisibility {
                auto_visible: *auto_visible,
                force: *force,
            },
        }
    }
}

pub async fn masking(cli: &Cli, args: &MaskingArgs) -> HandledResult<()> {
    let config = load_config(cli)?;
    let state = open_state(cli)?;
    let mut cluster = connect(config).await?;

    let step = args.op.as_step();
    let mut session = IoSession::new(cluster.config.io.workers);
    let result = run::execute_step(&mut cluster, &state, &mut session, &step).await;
    session.shutdown().await;

    result.handle_err(|e| eprintln!("Masking {} failed: {e}", step.name()))?;
    println!("masking {} ok", step.name());
    Ok(())
}
