use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use grid_server::config::{LeaseConfig, PartitionBounds, ServerConfig};
use grid_server::http::run_http;
use grid_server::scheduler::PartitionKey;
use grid_server::shutdown::install_shutdown_handler;
use grid_server::Dispatcher;

#[derive(Parser, Debug)]
#[command(name = "grid-server")]
#[command(version)]
#[command(about = "Job distribution server: clients submit jobs, workers lease and complete them")]
struct Args {
    /// Port to listen on
    #[arg(long, default_value = "50051")]
    port: u16,

    /// Address to bind
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Default worker lease duration in milliseconds
    #[arg(long, default_value = "30000")]
    lease_ms: u64,

    /// Per-partition lease durations (comma-separated, format: "service_id:version:ms")
    /// Example: "1:0:5000,1:1:60000"
    #[arg(long, default_value = "")]
    lease_override: String,

    /// Interval between background lease sweeps in milliseconds
    #[arg(long, default_value = "1000", value_parser = clap::value_parser!(u64).range(1..))]
    sweep_interval_ms: u64,

    /// Lease expiries tolerated before a job fails
    #[arg(long, default_value = "3")]
    max_retries: u32,

    /// Maximum pending jobs per partition
    #[arg(long, default_value = "10000")]
    max_pending: usize,

    /// Highest accepted service id (unbounded if omitted)
    #[arg(long)]
    max_service_id: Option<u32>,

    /// Highest accepted service version (unbounded if omitted)
    #[arg(long)]
    max_service_version: Option<u32>,

    /// Results returned by a fetch that does not name a limit
    #[arg(long, default_value = "100")]
    fetch_limit: usize,
}

fn parse_lease_overrides(raw: &str) -> Vec<(PartitionKey, u64)> {
    if raw.is_empty() {
        return Vec::new();
    }

    raw.split(',')
        .filter_map(|entry| {
            let parts: Vec<&str> = entry.trim().split(':').collect();
            let parsed = match parts.as_slice() {
                [id, version, ms] => {
                    match (id.parse::<u32>(), version.parse::<u32>(), ms.parse::<u64>()) {
                        (Ok(id), Ok(version), Ok(ms)) => {
                            Some((PartitionKey::new(id, version), ms))
                        }
                        _ => None,
                    }
                }
                _ => None,
            };
            if parsed.is_none() {
                tracing::warn!(
                    entry,
                    "Invalid lease override, expected service_id:version:ms"
                );
            }
            parsed
        })
        .collect()
}

fn build_config(args: &Args) -> Result<ServerConfig, Box<dyn std::error::Error>> {
    let listen_addr: SocketAddr = format!("{}:{}", args.host, args.port).parse()?;

    Ok(ServerConfig {
        listen_addr,
        lease: LeaseConfig {
            default_lease_ms: args.lease_ms,
            sweep_interval_ms: args.sweep_interval_ms,
            max_retries: args.max_retries,
            overrides: parse_lease_overrides(&args.lease_override)
                .into_iter()
                .collect(),
        },
        bounds: PartitionBounds {
            max_service_id: args.max_service_id,
            max_service_version: args.max_service_version,
        },
        max_pending_per_partition: args.max_pending,
        default_fetch_limit: args.fetch_limit,
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = build_config(&args)?;

    tracing::info!(
        listen_addr = %config.listen_addr,
        lease_ms = config.lease.default_lease_ms,
        lease_overrides = config.lease.overrides.len(),
        sweep_interval_ms = config.lease.sweep_interval_ms,
        max_retries = config.lease.max_retries,
        max_pending = config.max_pending_per_partition,
        "Starting grid server"
    );

    let shutdown = install_shutdown_handler()?;
    let listen_addr = config.listen_addr;
    let dispatcher = Arc::new(Dispatcher::new(config));

    let sweeper = dispatcher.clone().spawn_sweeper(shutdown.clone());
    let served = run_http(listen_addr, dispatcher, shutdown.clone()).await;

    shutdown.cancel();
    if let Err(e) = sweeper.await {
        tracing::warn!(error = %e, "Lease sweeper task ended abnormally");
    }
    served?;

    tracing::info!("Grid server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_lease_overrides() {
        let parsed = parse_lease_overrides("1:0:5000, 2:3:250");
        assert_eq!(
            parsed,
            vec![
                (PartitionKey::new(1, 0), 5000),
                (PartitionKey::new(2, 3), 250)
            ]
        );
    }

    #[test]
    fn skips_malformed_overrides() {
        let parsed = parse_lease_overrides("1:0,x:1:2,4:4:40");
        assert_eq!(parsed, vec![(PartitionKey::new(4, 4), 40)]);
        assert!(parse_lease_overrides("").is_empty());
    }

    #[test]
    fn config_from_args() {
        let args = Args::parse_from([
            "grid-server",
            "--port",
            "6000",
            "--lease-ms",
            "1500",
            "--max-service-id",
            "9",
            "--lease-override",
            "1:1:100",
        ]);
        let config = build_config(&args).unwrap();
        assert_eq!(config.listen_addr.port(), 6000);
        assert_eq!(config.lease.default_lease_ms, 1500);
        assert_eq!(config.bounds.max_service_id, Some(9));
        assert_eq!(config.bounds.max_service_version, None);
        assert_eq!(config.lease.overrides.get(&PartitionKey::new(1, 1)), Some(&100));
    }

    #[test]
    fn rejects_zero_sweep_interval() {
        let parsed = Args::try_parse_from(["grid-server", "--sweep-interval-ms", "0"]);
        assert!(parsed.is_err());
    }
}
