use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use connector_bridge::connector::{DeviceApi, EndpointFilter, HttpConnector, WebhookApi};
use connector_bridge::{Config, Daemon};

/// Bridge between device-server webhooks and a peer message bus
#[derive(Parser)]
#[command(name = "connector-bridge", version, about)]
struct Cli {
    /// Config file (defaults to ~/.config/connector-bridge/config.toml)
    #[arg(short, long, env = "BRIDGE_CONFIG")]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the bridge (default)
    Run,
    /// List endpoints known to the device server
    Endpoints {
        /// Only endpoints of this type
        #[arg(short = 't', long = "type")]
        endpoint_type: Option<String>,
        /// Also list each endpoint's resources
        #[arg(short, long)]
        resources: bool,
    },
    /// Remove the webhook callback registered with the device server
    ClearWebhook,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "info,connector_bridge=info",
        1 => "info,connector_bridge=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::load(cli.config.as_deref())?;
    tracing::debug!(?config, "loaded configuration");

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => {
            let daemon = Daemon::new(config)?;
            daemon.run().await?;
        }
        Command::Endpoints {
            endpoint_type,
            resources,
        } => list_endpoints(&config, endpoint_type, resources).await?,
        Command::ClearWebhook => {
            connector(&config)?.clear_callback().await?;
            println!("webhook callback cleared");
        }
    }

    Ok(())
}

fn connector(config: &Config) -> anyhow::Result<Arc<HttpConnector>> {
    Ok(Arc::new(HttpConnector::new(
        &config.device_server.base_url,
        config.require_api_key()?,
        Duration::from_secs(30),
    )?))
}

/// One-shot discovery listing
async fn list_endpoints(
    config: &Config,
    endpoint_type: Option<String>,
    with_resources: bool,
) -> anyhow::Result<()> {
    let connector = connector(config)?;
    let filter = EndpointFilter {
        endpoint_type: endpoint_type.or_else(|| config.device_server.endpoint_type.clone()),
    };

    let endpoints = connector.list_endpoints(&filter).await?;
    if endpoints.is_empty() {
        println!("no endpoints");
        return Ok(());
    }

    for endpoint in endpoints {
        println!(
            "{}\t{}\t{}{}",
            endpoint.name,
            endpoint.endpoint_type.as_deref().unwrap_or("-"),
            endpoint.status.as_deref().unwrap_or("-"),
            if endpoint.queue_mode { "\tqueue" } else { "" }
        );

        if with_resources {
            match connector.list_resources(&endpoint.name).await {
                Ok(resources) => {
                    for r in resources {
                        println!(
                            "  {}{}",
                            r.uri,
                            if r.observable { " (obs)" } else { "" }
                        );
                    }
                }
                Err(e) => println!("  <failed to list resources: {e}>"),
            }
        }
    }

    Ok(())
}
