// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use clap::Parser;
use log::error;

use qrexec_agent::Agent;

#[derive(Parser)]
#[command(about = "Per-VM qrexec agent")]
struct Cli {
    /// Name of the VM this agent runs in.
    vm_name: String,

    /// vchan port to connect to the daemon on.
    #[arg(long, default_value_t = 512)]
    vchan_port: u32,
}

fn main() {
    env_logger::init();
    let args = Cli::parse();

    let mut agent = match Agent::new(args.vm_name, args.vchan_port) {
        Ok(a) => a,
        Err(e) => {
            error!("failed to start: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = agent.run() {
        error!("event loop exited: {e}");
        std::process::exit(1);
    }
}
