//! CLI for the rmake remote build daemon.

#![allow(
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::missing_docs_in_private_items
)]

mod make;
mod serve;

use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser)]
#[command(name = "rmake", version, about = "Remote build daemon and client")]
struct Cli {
    /// Log at debug level. `RUST_LOG` takes precedence.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the build daemon.
    Serve(serve::ServeArgs),

    /// Build a file on a remote daemon and fetch its outputs.
    Make(Box<make::MakeArgs>),

    /// Generate shell completion scripts.
    #[command(hide = true)]
    Completion {
        /// Target shell.
        shell: Shell,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    if let Err(e) = cli.dispatch().await {
        eprintln!("rmake: {e:#}");
        std::process::exit(1);
    }
}

fn init_logging(verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" }));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

impl Cli {
    async fn dispatch(self) -> Result<()> {
        match self.command {
            Command::Serve(args) => args.run().await,
            Command::Make(args) => args.run().await,
            Command::Completion { shell } => {
                clap_complete::generate(shell, &mut Self::command(), "rmake", &mut std::io::stdout());
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn make_arguments() {
        let cli = Cli::try_parse_from([
            "rmake", "-v", "make", "main.c", "--user", "alice", "--password", "pw", "-o",
            "opt=-O2", "-t", "c",
        ])
        .unwrap();
        assert!(cli.verbose);
        assert!(matches!(cli.command, Command::Make(_)));
    }

    #[test]
    fn malformed_option_is_refused() {
        let res = Cli::try_parse_from([
            "rmake", "make", "main.c", "--user", "alice", "--password", "pw", "-o", "noequals",
        ]);
        assert!(res.is_err());
    }
}
