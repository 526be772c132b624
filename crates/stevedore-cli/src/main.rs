//! Stevedore CLI - Tunnels into an air-gapped cluster

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

mod commands;
mod display;
mod error;
mod exit_codes;

#[derive(Parser)]
#[command(name = "stevedore")]
#[command(author = "Stevedore Contributors")]
#[command(version)]
#[command(about = "Open tunnels to the services of an air-gapped cluster", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable debug output
    #[arg(long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Access services or pods deployed in the cluster
    Connect(ConnectArgs),
}

#[derive(Args)]
#[command(args_conflicts_with_subcommands = true)]
struct ConnectArgs {
    #[command(subcommand)]
    command: Option<ConnectCommands>,

    /// Built-in target (registry, logging, git, injector), connect label, or service URL
    target: Option<String>,

    /// Name of the resource to connect to
    #[arg(long)]
    name: Option<String>,

    /// Namespace of the resource (defaults to the configured namespace)
    #[arg(short, long)]
    namespace: Option<String>,

    /// Resource type: pod or svc
    #[arg(long = "type", default_value = "svc")]
    kind: String,

    /// Local port to listen on (0 picks a free port)
    #[arg(long, default_value_t = 0)]
    local_port: u16,

    /// Port on the resource to forward to
    #[arg(long, default_value_t = 0)]
    remote_port: u16,

    /// Print the tunnel URL without opening a browser
    #[arg(long)]
    cli_only: bool,

    /// Tunnel configuration file
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum ConnectCommands {
    /// List connect targets advertised in the cluster
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

/// Log to stderr; `RUST_LOG` overrides the level chosen by `--debug`
fn init_logging(debug: bool) {
    let default = if debug { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(debug)
        .compact()
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    // Setup miette for nice error display
    miette::set_panic_hook();

    let cli = Cli::parse();
    init_logging(cli.debug);

    let result = match cli.command {
        Commands::Connect(ConnectArgs {
            command: Some(ConnectCommands::List { json }),
            ..
        }) => commands::connect::list(json).await,

        Commands::Connect(args) => {
            commands::connect::run(
                args.target.as_deref(),
                args.name.as_deref(),
                args.namespace.as_deref(),
                &args.kind,
                args.local_port,
                args.remote_port,
                args.cli_only,
                args.config.as_deref(),
            )
            .await
        }
    };

    match result {
        Ok(()) => ExitCode::from(exit_codes::SUCCESS as u8),
        Err(err) => {
            let code = err.exit_code();
            eprintln!("{:?}", miette::Report::new(err));
            ExitCode::from(u8::try_from(code).unwrap_or(1))
        }
    }
}
