use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pmd_core::NamespaceMode;
use serde_json::{Value, json};
use std::path::PathBuf;
use tracing::{Instrument, info};

pub mod config;
pub mod service;
pub mod tracing_config;

use crate::config::{Backend, Config};
use crate::service::DeviceService;
use crate::tracing_config::{OperationContext, TracingConfig};

/// Manage persistent-memory namespaces
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON configuration file; flags override its values
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[arg(long, value_enum, global = true)]
    backend: Option<Backend>,

    /// Path of the ndctl tool
    #[arg(long, global = true)]
    ndctl_bin: Option<PathBuf>,

    /// Directory holding emulated namespaces
    #[arg(long, global = true)]
    emulated_root: Option<PathBuf>,

    /// Namespace alignment (bytes, or with K/M/G/T suffix)
    #[arg(long, value_parser = parse_size, global = true)]
    align: Option<u64>,

    /// Mount table to check for a read-only /sys
    #[arg(long, global = true)]
    mounts: Option<PathBuf>,

    /// Give up waiting for an operation after this many seconds (0 to wait forever)
    #[arg(long, global = true)]
    timeout_secs: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Use JSON format for logs
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
enum Command {
    /// Largest namespace that can currently be created, per mode
    Capacity,
    /// List active namespaces
    List,
    /// Show one namespace
    Get { volume_id: String },
    /// Create a namespace and clear its head
    Create {
        volume_id: String,
        /// Requested size (bytes, or with K/M/G/T suffix)
        #[arg(value_parser = parse_size)]
        size: u64,
        #[arg(long, default_value_t = NamespaceMode::Fsdax)]
        mode: NamespaceMode,
    },
    /// Clear and destroy a namespace
    Delete {
        volume_id: String,
        /// Erase the whole device instead of its head
        #[arg(long)]
        flush: bool,
    },
    /// Erase a namespace's contents without destroying it
    Flush { volume_id: String },
}

impl Command {
    fn operation(&self) -> &'static str {
        match self {
            Command::Capacity => "get_capacity",
            Command::List => "list_devices",
            Command::Get { .. } => "get_device",
            Command::Create { .. } => "create_device",
            Command::Delete { .. } => "delete_device",
            Command::Flush { .. } => "flush_device_data",
        }
    }

    fn volume_id(&self) -> Option<&str> {
        match self {
            Command::Capacity | Command::List => None,
            Command::Get { volume_id }
            | Command::Create { volume_id, .. }
            | Command::Delete { volume_id, .. }
            | Command::Flush { volume_id } => Some(volume_id),
        }
    }
}

/// Parses a byte count with an optional binary suffix (`512`, `4K`, `1G`, `2TiB`).
fn parse_size(input: &str) -> std::result::Result<u64, String> {
    let s = input.trim();
    let s = s
        .strip_suffix("iB")
        .or_else(|| s.strip_suffix('B'))
        .unwrap_or(s);
    let (digits, shift) = match s.chars().last().map(|c| c.to_ascii_uppercase()) {
        Some('K') => (&s[..s.len() - 1], 10),
        Some('M') => (&s[..s.len() - 1], 20),
        Some('G') => (&s[..s.len() - 1], 30),
        Some('T') => (&s[..s.len() - 1], 40),
        _ => (s, 0),
    };

    let value: u64 = digits
        .trim()
        .parse()
        .map_err(|_| format!("invalid size '{}'", input))?;
    value
        .checked_mul(1u64 << shift)
        .ok_or_else(|| format!("size '{}' is too large", input))
}

/// Layers command-line flags over the config file (or the defaults).
fn resolve_config(args: &Args) -> Result<Config> {
    let mut config = match args.config {
        Some(ref path) => Config::load(path)?,
        None => Config::default(),
    };

    if let Some(backend) = args.backend {
        config.backend = backend;
    }
    if let Some(ref bin) = args.ndctl_bin {
        config.ndctl_binary = bin.clone();
    }
    if let Some(ref root) = args.emulated_root {
        config.emulated_root = root.clone();
    }
    if let Some(align) = args.align {
        config.align = align;
    }
    if let Some(ref mounts) = args.mounts {
        config.mounts = mounts.clone();
    }
    if let Some(timeout) = args.timeout_secs {
        config.timeout_secs = Some(timeout);
    }

    anyhow::ensure!(config.align > 0, "align must be greater than zero");
    Ok(config)
}

async fn execute(service: &DeviceService, command: Command) -> Result<Value> {
    let value = match command {
        Command::Capacity => serde_json::to_value(service.get_capacity().await?)?,
        Command::List => serde_json::to_value(service.list_devices().await?)?,
        Command::Get { volume_id } => serde_json::to_value(service.get_device(&volume_id).await?)?,
        Command::Create {
            volume_id,
            size,
            mode,
        } => {
            service.create_device(&volume_id, size, mode).await?;
            let device = service.get_device(&volume_id).await?;
            info!(path = %device.path.display(), size = device.size, "Device ready");
            serde_json::to_value(device)?
        }
        Command::Delete { volume_id, flush } => {
            service.delete_device(&volume_id, flush).await?;
            json!({ "deleted": volume_id, "flushed": flush })
        }
        Command::Flush { volume_id } => {
            service.flush_device_data(&volume_id).await?;
            json!({ "flushed": volume_id })
        }
    };
    Ok(value)
}

pub async fn run() -> Result<()> {
    let args = Args::parse();

    let level = tracing_config::parse_level(&args.log_level);
    let tracing_setup = if args.log_json {
        TracingConfig {
            level,
            ..TracingConfig::production()
        }
    } else {
        TracingConfig {
            level,
            ..TracingConfig::default()
        }
    };
    tracing_setup.init();

    let config = resolve_config(&args)?;
    let ctx = OperationContext::new(args.command.operation())
        .with_volume(args.command.volume_id());

    let output = async {
        let service = DeviceService::from_config(&config)
            .context("failed to start device manager")?;
        execute(&service, args.command.clone()).await
    }
    .instrument(ctx.span())
    .await?;

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
