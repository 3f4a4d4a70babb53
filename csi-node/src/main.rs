//! Node connectivity CLI
//!
//! Operator surface over the node service: stage and unstage volumes,
//! flush a dm device or rescan SCSI hosts by hand. Results are printed to
//! stdout as JSON; logs go to stderr.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use csi_node::metrics::init_metrics;
use csi_node::{NodeConfig, NodeService, StageRequest, UnstageRequest};
use device_connectivity::ConnectivityType;
use serde_json::json;
use tracing::{Level, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// CLI arguments for the node agent
#[derive(Parser, Debug)]
#[command(name = "csi-node")]
#[command(about = "Attach and detach storage-array volumes on this host")]
struct Args {
    /// JSON configuration file
    #[arg(long, env = "CSI_NODE_CONFIG")]
    config: Option<PathBuf>,

    /// Node ID for this host (defaults to the hostname)
    #[arg(long, env = "CSI_NODE_ID")]
    node_id: Option<String>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG overrides it
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Serve Prometheus metrics on this address
    #[arg(long, env = "METRICS_ADDR")]
    metrics_addr: Option<SocketAddr>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Rescan for a volume and print its multipath device
    Stage {
        #[arg(long)]
        volume_id: String,
        #[arg(long)]
        staging_target_path: String,
        /// Volume context entry, repeatable (e.g. --context lun=3)
        #[arg(long = "context", value_parser = parse_key_val)]
        context: Vec<(String, String)>,
    },
    /// Flush a volume's multipath device and delete its paths
    Unstage {
        #[arg(long)]
        volume_id: String,
        #[arg(long)]
        staging_target_path: String,
        #[arg(long = "context", value_parser = parse_key_val)]
        context: Vec<(String, String)>,
    },
    /// Flush a single dm device (e.g. dm-3)
    Flush { dm_name: String },
    /// Ask the SCSI hosts connected to an array to probe for a LUN
    Rescan {
        #[arg(long)]
        connectivity_type: ConnectivityType,
        #[arg(long)]
        lun: u32,
        #[arg(long, value_delimiter = ',', required = true)]
        array_ids: Vec<String>,
    },
    /// Check that this host is connected to an array
    EnsureLogin {
        #[arg(long)]
        connectivity_type: ConnectivityType,
        #[arg(long, value_delimiter = ',')]
        array_ids: Vec<String>,
    },
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{}'", s))?;
    Ok((key.trim().to_string(), value.trim().to_string()))
}

type BoxError = Box<dyn std::error::Error + Send + Sync>;

fn init_tracing(log_level: &str) -> Result<(), BoxError> {
    let level = match log_level {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_string().to_lowercase()));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let args = Args::parse();
    init_tracing(&args.log_level)?;

    let config = NodeConfig::load(args.config.as_deref())?;

    let node_id = match args.node_id {
        Some(id) => id,
        None => hostname::get()?.to_string_lossy().to_string(),
    };

    if let Some(addr) = args.metrics_addr {
        init_metrics(addr)?;
    }

    info!(
        node_id = %node_id,
        fc_subsystem = ?config.fc_subsystem,
        max_concurrent_commands = config.max_concurrent_commands,
        "Starting node connectivity agent"
    );

    let service = NodeService::new(node_id, config.executor(), config.connectivity_options());

    let output = match args.command {
        Command::Stage {
            volume_id,
            staging_target_path,
            context,
        } => {
            let context: HashMap<String, String> = context.into_iter().collect();
            let req = StageRequest::from_context(&volume_id, &staging_target_path, &context)?;
            serde_json::to_value(service.stage_volume(&req).await?)?
        }
        Command::Unstage {
            volume_id,
            staging_target_path,
            context,
        } => {
            let context: HashMap<String, String> = context.into_iter().collect();
            let req = UnstageRequest::from_context(&volume_id, &staging_target_path, &context)?;
            serde_json::to_value(service.unstage_volume(&req).await?)?
        }
        Command::Flush { dm_name } => {
            service.flush(&dm_name).await?;
            json!({ "flushed": dm_name })
        }
        Command::Rescan {
            connectivity_type,
            lun,
            array_ids,
        } => {
            service.rescan(connectivity_type, lun, &array_ids).await?;
            json!({ "connectivity_type": connectivity_type, "lun": lun, "array_ids": array_ids })
        }
        Command::EnsureLogin {
            connectivity_type,
            array_ids,
        } => {
            service.ensure_login(connectivity_type, &array_ids).await?;
            json!({ "connectivity_type": connectivity_type, "connected": true })
        }
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_key_val() {
        assert_eq!(
            parse_key_val("lun = 3").unwrap(),
            ("lun".to_string(), "3".to_string())
        );
        assert!(parse_key_val("lun").is_err());
    }

    #[test]
    fn test_stage_args() {
        let args = Args::try_parse_from([
            "csi-node",
            "--node-id",
            "node-a",
            "--metrics-addr",
            "127.0.0.1:9090",
            "stage",
            "--volume-id",
            "6oui000vendorsi0vendorsie0000000",
            "--staging-target-path",
            "/staging/pv1",
            "--context",
            "lun=3",
            "--context",
            "connectivity_type=fc",
        ])
        .unwrap();
        assert_eq!(args.node_id.as_deref(), Some("node-a"));
        assert!(args.metrics_addr.is_some());
        match args.command {
            Command::Stage { context, .. } => assert_eq!(context.len(), 2),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_rescan_args_split_array_ids() {
        let args = Args::try_parse_from([
            "csi-node",
            "rescan",
            "--connectivity-type",
            "FC",
            "--lun",
            "1",
            "--array-ids",
            "aabbccdd,0x11223344",
        ])
        .unwrap();
        match args.command {
            Command::Rescan {
                connectivity_type,
                array_ids,
                ..
            } => {
                assert_eq!(connectivity_type, ConnectivityType::Fc);
                assert_eq!(array_ids, vec!["aabbccdd", "0x11223344"]);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
