//! nsfetch - command-line client for netsession
//!
//! Issues requests and downloads through a session whose server trust is
//! governed by a configurable pinning policy.

mod commands;
mod output;
mod progress;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// nsfetch - HTTP client with certificate pinning
#[derive(Parser)]
#[command(name = "nsfetch")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Session configuration file (JSON); defaults to <config dir>/nsfetch/config.json
    #[arg(long, env = "NSFETCH_CONFIG")]
    config: Option<PathBuf>,

    /// Pinning mode applied to server trust
    #[arg(long, default_value = "none")]
    pin_mode: PinMode,

    /// Certificate file to pin (DER or PEM); repeatable
    #[arg(long = "pin-cert")]
    pin_certs: Vec<PathBuf>,

    /// Directory of certificates to pin (.cer, .crt, .der, .pem)
    #[arg(long)]
    pin_dir: Option<PathBuf>,

    /// Accept expired or self-signed server certificates
    #[arg(long)]
    allow_invalid: bool,

    /// Skip matching the certificate against the host name
    #[arg(long)]
    no_domain_check: bool,

    /// Output format
    #[arg(long, default_value = "human")]
    output: OutputFormat,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum OutputFormat {
    Human,
    Json,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
enum PinMode {
    None,
    PublicKey,
    Certificate,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch a URL and print the body
    Get {
        /// URL to fetch
        url: String,

        /// Query parameter as key=value; repeatable
        #[arg(short, long = "param")]
        params: Vec<String>,

        /// Request header as "Name: value"; repeatable
        #[arg(short = 'H', long = "header")]
        headers: Vec<String>,

        /// Decode the body as JSON
        #[arg(long)]
        json: bool,
    },

    /// Download a URL to a file
    Download {
        /// URL to download
        url: String,

        /// Output file path (defaults to the server-suggested name)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Resume from data saved by an interrupted download
        #[arg(long)]
        resume: Option<PathBuf>,
    },

    /// Show the subject and public key of certificate files
    Cert {
        /// Certificate files (DER or PEM)
        files: Vec<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    if let Commands::Cert { files } = &cli.command {
        return commands::show_certificates(files, cli.output);
    }

    let options = commands::SessionOptions {
        config: cli.config,
        pin_mode: cli.pin_mode,
        pin_certs: cli.pin_certs,
        pin_dir: cli.pin_dir,
        allow_invalid: cli.allow_invalid,
        validate_domain: !cli.no_domain_check,
    };
    let session = commands::build_session(&options)?;

    match cli.command {
        Commands::Get {
            url,
            params,
            headers,
            json,
        } => commands::get(&session, &url, params, headers, json, cli.output).await?,

        Commands::Download {
            url,
            output,
            resume,
        } => commands::download(&session, &url, output, resume, cli.output).await?,

        Commands::Cert { .. } => {}
    }

    session.invalidate(false);
    Ok(())
}
