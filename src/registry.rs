//! Durable ledger of addresses believed to be currently free.
//!
//! One JSON file maps each address to the timestamp it was last observed
//! unassigned. The GC reaper frees addresses whose stamp is older than its
//! cutoff. Writes go through an atomic replace (temp file plus rename in the
//! same directory) so a crash mid-write cannot corrupt the ledger.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const DEFAULT_REGISTRY_PATH: &str = "/var/lib/eni-ipam/registry.json";

const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct RegistryFile {
    version: u32,
    ips: BTreeMap<IpAddr, DateTime<Utc>>,
}

impl RegistryFile {
    fn empty() -> Self {
        RegistryFile {
            version: SCHEMA_VERSION,
            ips: BTreeMap::new(),
        }
    }
}

pub struct Registry {
    path: PathBuf,
}

impl Registry {
    pub fn new() -> Self {
        Self::at_path(DEFAULT_REGISTRY_PATH)
    }

    pub fn at_path(path: impl Into<PathBuf>) -> Self {
        Registry { path: path.into() }
    }

    /// All addresses currently tracked as free.
    pub fn list(&self) -> Result<Vec<IpAddr>> {
        Ok(self.load()?.ips.keys().copied().collect())
    }

    /// Addresses whose last-tracked stamp is strictly before `cutoff`.
    pub fn tracked_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<IpAddr>> {
        Ok(self
            .load()?
            .ips
            .iter()
            .filter(|(_, ts)| **ts < cutoff)
            .map(|(ip, _)| *ip)
            .collect())
    }

    /// Record `ip` as observed free now.
    pub fn track(&self, ip: IpAddr) -> Result<()> {
        self.track_at(ip, Utc::now())
    }

    /// Record `ip` as observed free at `at`. An entry's stamp never moves
    /// backwards; a stale observation is ignored.
    pub fn track_at(&self, ip: IpAddr, at: DateTime<Utc>) -> Result<()> {
        let mut file = self.load()?;
        let stamp = file.ips.entry(ip).or_insert(at);
        if *stamp < at {
            *stamp = at;
        }
        self.store(&file)
    }

    /// Drop `ip` from the ledger. Idempotent; absent entries are fine.
    pub fn forget(&self, ip: IpAddr) -> Result<()> {
        let mut file = self.load()?;
        if file.ips.remove(&ip).is_some() {
            debug!("forgot {ip} from free-ip registry");
            self.store(&file)?;
        }
        Ok(())
    }

    fn load(&self) -> Result<RegistryFile> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(RegistryFile::empty()),
            Err(e) => {
                return Err(Error::Registry(format!(
                    "cannot read {}: {e}",
                    self.path.display()
                )))
            }
        };
        let file: RegistryFile = serde_json::from_slice(&bytes).map_err(|e| {
            Error::Registry(format!("cannot parse {}: {e}", self.path.display()))
        })?;
        if file.version != SCHEMA_VERSION {
            return Err(Error::Registry(format!(
                "unsupported registry version {} in {}",
                file.version,
                self.path.display()
            )));
        }
        Ok(file)
    }

    fn store(&self, file: &RegistryFile) -> Result<()> {
        let dir = self.path.parent().unwrap_or(Path::new("."));
        fs::create_dir_all(dir)
            .map_err(|e| Error::Registry(format!("cannot create {}: {e}", dir.display())))?;

        // Atomic replace: write beside the target, fsync, rename over it.
        let mut tmp = tempfile::NamedTempFile::new_in(dir)
            .map_err(|e| Error::Registry(format!("cannot stage registry write: {e}")))?;
        serde_json::to_writer_pretty(&mut tmp, file)
            .map_err(|e| Error::Registry(format!("cannot serialize registry: {e}")))?;
        tmp.as_file()
            .sync_all()
            .map_err(|e| Error::Registry(format!("cannot sync registry: {e}")))?;
        tmp.persist(&self.path)
            .map_err(|e| Error::Registry(format!("cannot replace {}: {e}", self.path.display())))?;
        Ok(())
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
