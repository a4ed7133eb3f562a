// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use clap::Parser;
use log::error;

use qrexec_daemon::Daemon;

#[derive(Parser)]
#[command(about = "Per-VM qrexec daemon")]
struct Cli {
    /// Name of the VM this daemon serves.
    vm_name: String,

    /// User to run a command as when the client asks for `DEFAULT:`. Falls
    /// back to `QREXEC_DEFAULT_USER`/the built-in default if omitted.
    default_user: Option<String>,

    /// vchan port to listen for the agent's connection on.
    #[arg(long, default_value_t = 512)]
    vchan_port: u32,
}

fn main() {
    env_logger::init();
    let args = Cli::parse();

    let mut daemon = match Daemon::new(args.vm_name, args.vchan_port, args.default_user) {
        Ok(d) => d,
        Err(e) => {
            error!("failed to start: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = daemon.run() {
        error!("event loop exited: {e}");
        std::process::exit(1);
    }
}
