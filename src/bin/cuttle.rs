// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use clap::Parser;

use cuttle_lib::commands::{self, Cli};

/// The cuttle binary drives gateway test workflows: "run", "failover",
/// "masking add-host", and so on. -v raises the log level per use;
/// CUTTLE_LOG overrides it outright.
fn main() {
    let args = Cli::parse();

    let level = match args.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().filter_or("CUTTLE_LOG", level))
        .init();

    if commands::main(&args).is_err() {
        std::process::exit(1);
    }
}
