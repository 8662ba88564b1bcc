//! fourd CLI: serve, send, probe and restart over the 4D control protocol.

mod cli;
mod cmd;

use clap::Parser;
use cli::{Cli, Commands};

/// Install the stderr subscriber. `RUST_LOG` wins; default level is `info`.
fn init_tracing_stderr() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_tracing_stderr();

    match cli.command {
        Commands::Serve { port, name } => cmd::serve::cmd_serve(cli.config, port, name),
        Commands::Send {
            addr,
            path,
            to,
            state,
            set,
        } => cmd::send::cmd_send(cli.config, &addr, path, &to, state, &set),
        Commands::Probe { addr, process, to } => {
            cmd::send::cmd_probe(cli.config, &addr, &process, to.as_deref())
        }
        Commands::Restart { daemon, verify } => {
            cmd::restart::cmd_restart(cli.config, &daemon, verify)
        }
    }
}
