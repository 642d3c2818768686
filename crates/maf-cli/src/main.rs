//! `maf`: the CLI adapter over the runtime façade. Grounded on the teacher's
//! `jit::main` — parse args, build an `OutputContext`, dispatch to a
//! command function, translate its result into `std::process::exit` — but
//! with the subprocess-free façade call replacing the teacher's direct
//! repository access.

mod cli;
mod commands;
mod output;

use clap::Parser;
use cli::Cli;
use maf_core::RuntimeConfig;
use maf_dispatch::Runtime;
use output::{ExitCode, OutputContext};

fn main() {
    let cli = Cli::parse();
    let out = OutputContext::new(cli.json);

    tracing_subscriber::fmt()
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .try_init()
        .ok();

    let config = match &cli.config {
        Some(path) => match RuntimeConfig::from_file(path) {
            Ok(c) => c,
            Err(e) => {
                out.print_error(&e).ok();
                std::process::exit(ExitCode::InvalidArguments.code());
            }
        },
        None => RuntimeConfig::default(),
    }
    .apply_env_overrides();

    let runtime = match Runtime::bootstrap(config) {
        Ok(r) => r,
        Err(e) => {
            out.print_error(&e).ok();
            std::process::exit(ExitCode::GenericError.code());
        }
    };

    let exit_code = commands::run(cli.command, &runtime, cli.agent_id, &out);
    std::process::exit(exit_code.code());
}
