//! Emulated PMEM - file-backed stand-in for namespace hardware
//!
//! Layout of the emulation root:
//!
//! ```text
//! <root>/
//!   labels.json    namespace labels, the state of record
//!   pmem0.0        device image of namespace0.0 (region 0, slot 0)
//!   pmem0.1        ...
//! ```
//!
//! Regions have a fixed size and interleave width. Free space is tracked per
//! region as size minus the raw size of its namespaces; fragmentation is not
//! modelled. As on real media, destroying a namespace leaves its bytes behind
//! and a later namespace reusing the slot sees them until it is cleared.

use super::{Bus, CreateNamespaceOpts, Namespace, NamespaceMode, NdctlContext, NdctlError, Region};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use tracing::{debug, info};

const LABEL_FILE: &str = "labels.json";
const LABEL_VERSION: u32 = 1;
const EMULATED_BUS: &str = "ndbus0";

fn default_interleave_ways() -> u64 {
    1
}

/// Static description of one emulated region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionSpec {
    pub size: u64,
    #[serde(default = "default_interleave_ways")]
    pub interleave_ways: u64,
}

impl RegionSpec {
    pub fn new(size: u64, interleave_ways: u64) -> Self {
        Self {
            size,
            interleave_ways,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Label {
    name: String,
    region: usize,
    slot: u32,
    /// Bytes taken from the region, metadata included
    raw_size: u64,
    /// Bytes visible through the device
    size: u64,
    mode: NamespaceMode,
}

#[derive(Debug, Serialize, Deserialize)]
struct LabelFile {
    version: u32,
    namespaces: Vec<Label>,
}

/// File-backed hardware-control context.
pub struct EmulatedContext {
    root: PathBuf,
    regions: Vec<RegionSpec>,
    labels: Vec<Label>,
}

impl EmulatedContext {
    /// Opens (or initializes) an emulation root with the given regions.
    pub fn open(root: impl Into<PathBuf>, regions: Vec<RegionSpec>) -> Result<Self, NdctlError> {
        let root = root.into();
        fs::create_dir_all(&root)?;

        let label_path = root.join(LABEL_FILE);
        let labels = if label_path.exists() {
            let file: LabelFile = serde_json::from_str(&fs::read_to_string(&label_path)?)?;
            if file.version != LABEL_VERSION {
                return Err(invalid_data(format!(
                    "label file version {} (expected {})",
                    file.version, LABEL_VERSION
                )));
            }
            file.namespaces
        } else {
            Vec::new()
        };

        if let Some(label) = labels.iter().find(|l| l.region >= regions.len()) {
            return Err(invalid_data(format!(
                "namespace {} lives in region{} but only {} regions are configured",
                label.name,
                label.region,
                regions.len()
            )));
        }

        info!(
            root = %root.display(),
            regions = regions.len(),
            namespaces = labels.len(),
            "Emulated PMEM context opened"
        );

        Ok(Self {
            root,
            regions,
            labels,
        })
    }

    fn used(&self, region: usize) -> u64 {
        self.labels
            .iter()
            .filter(|l| l.region == region)
            .map(|l| l.raw_size)
            .sum()
    }

    fn free_extent(&self, region: usize) -> u64 {
        self.regions[region].size.saturating_sub(self.used(region))
    }

    fn next_slot(&self, region: usize) -> u32 {
        let mut slot = 0;
        while self
            .labels
            .iter()
            .any(|l| l.region == region && l.slot == slot)
        {
            slot += 1;
        }
        slot
    }

    fn persist(&self) -> Result<(), NdctlError> {
        let file = LabelFile {
            version: LABEL_VERSION,
            namespaces: self.labels.clone(),
        };
        let tmp = self.root.join(format!("{}.tmp", LABEL_FILE));
        let mut out = File::create(&tmp)?;
        out.write_all(&serde_json::to_vec_pretty(&file)?)?;
        out.sync_all()?;
        fs::rename(&tmp, self.root.join(LABEL_FILE))?;
        Ok(())
    }

    fn to_namespace(label: &Label) -> Namespace {
        Namespace {
            name: label.name.clone(),
            dev: format!("namespace{}.{}", label.region, label.slot),
            blockdev: Some(Self::blockdev(label)),
            size: label.size,
            mode: Some(label.mode),
        }
    }

    fn blockdev(label: &Label) -> String {
        format!("pmem{}.{}", label.region, label.slot)
    }

    fn image_path(&self, label: &Label) -> PathBuf {
        self.root.join(Self::blockdev(label))
    }
}

fn invalid_data(message: String) -> NdctlError {
    NdctlError::Io(io::Error::new(io::ErrorKind::InvalidData, message))
}

fn round_up(value: u64, unit: u64) -> Option<u64> {
    value.div_ceil(unit).checked_mul(unit)
}

impl NdctlContext for EmulatedContext {
    fn buses(&self) -> Result<Vec<Bus>, NdctlError> {
        let regions = self
            .regions
            .iter()
            .enumerate()
            .map(|(idx, spec)| Region {
                dev: format!("region{}", idx),
                interleave_ways: spec.interleave_ways,
                max_available_extent: self.free_extent(idx),
            })
            .collect();

        Ok(vec![Bus {
            dev: EMULATED_BUS.to_string(),
            regions,
        }])
    }

    fn active_namespaces(&self) -> Result<Vec<Namespace>, NdctlError> {
        Ok(self.labels.iter().map(Self::to_namespace).collect())
    }

    fn create_namespace(&mut self, opts: CreateNamespaceOpts) -> Result<Namespace, NdctlError> {
        let align = opts.align.max(1);

        let placement = (0..self.regions.len()).find_map(|idx| {
            let unit = align.checked_mul(self.regions[idx].interleave_ways.max(1))?;
            let raw = round_up(opts.size, unit)?;
            (raw <= self.free_extent(idx)).then_some((idx, raw))
        });

        let Some((region, raw_size)) = placement else {
            let available = (0..self.regions.len())
                .map(|idx| self.free_extent(idx))
                .max()
                .unwrap_or(0);
            return Err(NdctlError::NoSpace {
                requested: opts.size,
                available,
            });
        };

        let label = Label {
            name: opts.name,
            region,
            slot: self.next_slot(region),
            raw_size,
            // one alignment step goes to namespace metadata
            size: raw_size.saturating_sub(align),
            mode: opts.mode,
        };
        let ns = Self::to_namespace(&label);

        // set_len keeps whatever a previous tenant of this slot left behind
        let image = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.image_path(&label))?;
        image.set_len(label.size)?;

        self.labels.push(label);
        if let Err(e) = self.persist() {
            self.labels.pop();
            return Err(e);
        }

        debug!(
            name = %ns.name,
            dev = %ns.dev,
            raw_size = raw_size,
            size = ns.size,
            "Emulated namespace created"
        );
        Ok(ns)
    }

    fn destroy_namespace_by_name(&mut self, name: &str) -> Result<(), NdctlError> {
        let idx = self
            .labels
            .iter()
            .position(|l| l.name == name)
            .ok_or_else(|| NdctlError::NamespaceNotFound(name.to_string()))?;

        let label = self.labels.remove(idx);
        if let Err(e) = self.persist() {
            self.labels.insert(idx, label);
            return Err(e);
        }

        debug!(name = %name, region = label.region, slot = label.slot, "Emulated namespace destroyed");
        Ok(())
    }

    fn device_path(&self, ns: &Namespace) -> Option<PathBuf> {
        ns.blockdev.as_ref().map(|blockdev| self.root.join(blockdev))
    }
}
