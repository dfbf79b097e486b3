//! Web3API CLI: entry point.

use std::fmt::Display;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use serde::Serialize;

use web3api_cli::commands;
use web3api_cli::Settings;

#[derive(Parser)]
#[command(
    name = "web3api",
    about = "Resolve Web3APIs by ENS domain or IPFS hash, inspect their packages and plan queries",
    version
)]
struct Cli {
    /// IPFS gateway URL. Also reads WEB3API_GATEWAY.
    #[arg(long, global = true)]
    gateway: Option<String>,

    /// Read packages from a local directory instead of a gateway.
    /// Also reads WEB3API_STORE.
    #[arg(long, global = true, conflicts_with = "gateway")]
    store: Option<String>,

    /// JSON file mapping ENS domains to content addresses.
    /// Also reads WEB3API_NAMES.
    #[arg(long, global = true)]
    names: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    /// Print machine-readable JSON.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Classify an identifier without touching the network.
    Check {
        /// ENS domain or IPFS content address.
        uri: String,
    },

    /// Print the content address an endpoint resolves to.
    Resolve {
        /// ENS domain or IPFS content address.
        uri: String,
    },

    /// Fetch a package and summarize its schema.
    Inspect {
        /// ENS domain or IPFS content address.
        uri: String,
    },

    /// Print the execution plan for a query without running it.
    Plan {
        /// ENS domain or IPFS content address.
        uri: String,

        /// Query text, or @path to read it from a file.
        #[arg(short, long)]
        query: String,

        /// Variables as a JSON object, or @path to a JSON file.
        #[arg(long)]
        vars: Option<String>,
    },

    /// Generate shell completion scripts.
    ///
    /// Examples:
    ///   web3api completions bash > ~/.local/share/bash-completion/completions/web3api
    ///   web3api completions zsh > ~/.zfunc/_web3api
    Completions {
        /// Shell type (bash, zsh, fish, powershell, elvish).
        shell: Shell,
    },
}

fn emit<T: Serialize + Display>(report: &T, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
    } else {
        println!("{report}");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let settings = Settings::resolve(
        cli.gateway.as_deref(),
        cli.store.as_deref(),
        cli.names.as_deref(),
    );

    match cli.command {
        Commands::Check { uri } => {
            let report = commands::check(&uri);
            emit(&report, cli.json)?;
            if !report.valid {
                std::process::exit(1);
            }
        }

        Commands::Resolve { uri } => {
            let client = commands::client(&uri, &settings)?;
            emit(&commands::resolve(&client).await?, cli.json)?;
        }

        Commands::Inspect { uri } => {
            let client = commands::client(&uri, &settings)?;
            emit(&commands::inspect(&client).await?, cli.json)?;
        }

        Commands::Plan { uri, query, vars } => {
            let client = commands::client(&uri, &settings)?;
            let report = commands::plan(&client, &query, vars.as_deref()).await?;
            emit(&report, cli.json)?;
        }

        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "web3api", &mut std::io::stdout());
        }
    }

    Ok(())
}
