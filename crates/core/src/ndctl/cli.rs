//! `ndctl` command-line adapter
//!
//! Every call spawns the system `ndctl` binary and parses its JSON output.
//! `ndctl list` prints a bare object when exactly one item matches, an array
//! otherwise, and nothing at all when nothing matches; all three are accepted.

use super::{Bus, CreateNamespaceOpts, Namespace, NamespaceMode, NdctlContext, NdctlError, Region};
use serde::Deserialize;
use serde::de::{DeserializeOwned, IgnoredAny};
use std::path::PathBuf;
use std::process::Command;
use tracing::{debug, info};

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    Many(Vec<T>),
    One(T),
}

#[derive(Deserialize)]
struct RawBus {
    dev: String,
    #[serde(default)]
    regions: Vec<RawRegion>,
}

#[derive(Deserialize)]
struct RawRegion {
    dev: String,
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    max_available_extent: u64,
    #[serde(default)]
    mappings: Vec<IgnoredAny>,
}

#[derive(Deserialize)]
struct RawNamespace {
    dev: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    blockdev: Option<String>,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    mode: Option<String>,
}

impl RawNamespace {
    fn into_namespace(self) -> Namespace {
        let mode = self
            .mode
            .as_deref()
            .and_then(|mode| mode.parse::<NamespaceMode>().ok());
        Namespace {
            name: self.name,
            dev: self.dev,
            blockdev: self.blockdev,
            size: self.size,
            mode,
        }
    }
}

fn parse_list<T: DeserializeOwned>(output: &str) -> Result<Vec<T>, NdctlError> {
    let trimmed = output.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    Ok(match serde_json::from_str::<OneOrMany<T>>(trimmed)? {
        OneOrMany::Many(items) => items,
        OneOrMany::One(item) => vec![item],
    })
}

fn parse_buses(output: &str) -> Result<Vec<Bus>, NdctlError> {
    let buses = parse_list::<RawBus>(output)?
        .into_iter()
        .map(|bus| Bus {
            dev: bus.dev,
            regions: bus
                .regions
                .into_iter()
                .filter(|r| r.kind.as_deref().is_none_or(|k| k == "pmem"))
                .map(|r| Region {
                    dev: r.dev,
                    interleave_ways: r.mappings.len().max(1) as u64,
                    max_available_extent: r.max_available_extent,
                })
                .collect(),
        })
        .collect();
    Ok(buses)
}

fn parse_namespaces(output: &str) -> Result<Vec<Namespace>, NdctlError> {
    Ok(parse_list::<RawNamespace>(output)?
        .into_iter()
        .map(|raw| {
            let ns = raw.into_namespace();
            if !ns.is_managed() {
                debug!(dev = %ns.dev, name = %ns.name, "Namespace has no block device or an unmanaged mode");
            }
            ns
        })
        .collect())
}

/// Hardware-control context backed by the `ndctl` tool.
#[derive(Debug, Clone)]
pub struct CliContext {
    binary: PathBuf,
}

impl CliContext {
    /// Probes `<binary> version`; fails when the tool cannot be run.
    pub fn new(binary: impl Into<PathBuf>) -> Result<Self, NdctlError> {
        let ctx = Self {
            binary: binary.into(),
        };
        let version = ctx.run(&["version"])?;
        info!(
            binary = %ctx.binary.display(),
            version = version.trim(),
            "ndctl context initialized"
        );
        Ok(ctx)
    }

    fn run(&self, args: &[&str]) -> Result<String, NdctlError> {
        let command = format!("{} {}", self.binary.display(), args.join(" "));
        debug!(command = %command, "Running ndctl");

        let output = Command::new(&self.binary)
            .args(args)
            .output()
            .map_err(|source| NdctlError::Spawn {
                command: command.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(NdctlError::Command {
                command,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl NdctlContext for CliContext {
    fn buses(&self) -> Result<Vec<Bus>, NdctlError> {
        parse_buses(&self.run(&["list", "--buses", "--regions", "--mappings"])?)
    }

    fn active_namespaces(&self) -> Result<Vec<Namespace>, NdctlError> {
        parse_namespaces(&self.run(&["list", "--namespaces"])?)
    }

    fn create_namespace(&mut self, opts: CreateNamespaceOpts) -> Result<Namespace, NdctlError> {
        let size = opts.size.to_string();
        let align = opts.align.to_string();
        let output = self.run(&[
            "create-namespace",
            "--name",
            &opts.name,
            "--size",
            &size,
            "--align",
            &align,
            "--mode",
            opts.mode.as_str(),
        ])?;

        parse_namespaces(&output)?
            .into_iter()
            .next()
            .ok_or(NdctlError::NamespaceNotFound(opts.name))
    }

    fn destroy_namespace_by_name(&mut self, name: &str) -> Result<(), NdctlError> {
        let ns = self
            .namespace_by_name(name)?
            .ok_or_else(|| NdctlError::NamespaceNotFound(name.to_string()))?;
        self.run(&["destroy-namespace", "--force", &ns.dev])?;
        Ok(())
    }
}
