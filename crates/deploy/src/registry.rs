//! Durable record of deployed resources, keyed by network and step name.

use std::{
    collections::HashMap,
    fs::File,
    io::Write,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};

use crate::graph::is_valid_name;

/// Name of the lock file held in each network directory.
const LOCK_FILENAME: &str = ".lock";

/// A deployed resource as persisted by a registry.
///
/// Files written by hardhat-deploy (`address`, `abi`, `transactionHash`, `receipt`) read as
/// entries too: the name then comes from the file stem and unknown fields are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryEntry {
    #[serde(default)]
    pub name: String,
    pub address: String,
    #[serde(default, rename = "transactionHash", skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_number: Option<u64>,
    /// Hash of the inputs the resource was deployed with.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployed_at: Option<DateTime<Utc>>,
}

impl RegistryEntry {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            tx_hash: None,
            block_number: None,
            fingerprint: None,
            deployed_at: Some(Utc::now()),
        }
    }

    pub fn with_receipt(mut self, tx_hash: impl Into<String>, block_number: Option<u64>) -> Self {
        self.tx_hash = Some(tx_hash.into());
        self.block_number = block_number;
        self
    }

    pub fn with_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.fingerprint = Some(fingerprint.into());
        self
    }
}

/// Storage of deployed resources.
///
/// `record` must be durable when it returns: the orchestrator hands the address to dependent
/// steps right after.
pub trait ResourceRegistry: Send + Sync {
    fn lookup(&self, network: &str, name: &str) -> Result<Option<RegistryEntry>>;

    fn record(&self, network: &str, entry: &RegistryEntry) -> Result<()>;

    /// Every entry of `network`, sorted by name.
    fn list(&self, network: &str) -> Result<Vec<RegistryEntry>>;

    fn is_deployed(&self, network: &str, name: &str) -> Result<bool> {
        Ok(self.lookup(network, name)?.is_some())
    }
}

impl<R: ResourceRegistry + ?Sized> ResourceRegistry for Arc<R> {
    fn lookup(&self, network: &str, name: &str) -> Result<Option<RegistryEntry>> {
        (**self).lookup(network, name)
    }

    fn record(&self, network: &str, entry: &RegistryEntry) -> Result<()> {
        (**self).record(network, entry)
    }

    fn list(&self, network: &str) -> Result<Vec<RegistryEntry>> {
        (**self).list(network)
    }
}

fn check_key(kind: &str, key: &str) -> Result<()> {
    if !is_valid_name(key) {
        bail!("Invalid {kind} name `{key}`");
    }
    Ok(())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Registry storing one JSON file per resource under `<root>/<network>/<name>.json`.
///
/// The first access to a network takes an exclusive lock on `<root>/<network>/.lock`, kept
/// until the registry is dropped, so two runs never write the same network at once.
#[derive(Debug)]
pub struct FileRegistry {
    root: PathBuf,
    locks: Mutex<HashMap<String, File>>,
}

impl FileRegistry {
    /// Open (and create if needed) a registry rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root).with_context(|| {
            format!("Failed to create deployments directory {}", root.display())
        })?;

        Ok(Self {
            root,
            locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn network_dir(&self, network: &str) -> PathBuf {
        self.root.join(network)
    }

    fn entry_path(&self, network: &str, name: &str) -> PathBuf {
        self.network_dir(network).join(format!("{name}.json"))
    }

    /// Take the exclusive lock of `network`. Idempotent for this registry.
    pub fn lock_network(&self, network: &str) -> Result<()> {
        check_key("network", network)?;

        let mut locks = lock(&self.locks);
        if locks.contains_key(network) {
            return Ok(());
        }

        let dir = self.network_dir(network);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create registry directory {}", dir.display()))?;

        let path = dir.join(LOCK_FILENAME);
        let file = File::create(&path)
            .with_context(|| format!("Failed to create lock file {}", path.display()))?;
        file.try_lock_exclusive().with_context(|| {
            format!(
                "Registry for network `{network}` is locked by another run ({})",
                path.display()
            )
        })?;

        tracing::debug!(network, path = %path.display(), "Registry lock acquired");
        locks.insert(network.to_string(), file);
        Ok(())
    }

    fn read_entry(path: &Path) -> Result<RegistryEntry> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read registry entry {}", path.display()))?;
        let raw: serde_json::Value = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse registry entry {}", path.display()))?;
        let block_number = raw
            .pointer("/receipt/blockNumber")
            .and_then(serde_json::Value::as_u64);
        let mut entry: RegistryEntry = serde_json::from_value(raw)
            .with_context(|| format!("Failed to parse registry entry {}", path.display()))?;

        if entry.name.is_empty() {
            entry.name = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .unwrap_or_default()
                .to_string();
        }
        if entry.block_number.is_none() {
            entry.block_number = block_number;
        }
        Ok(entry)
    }
}

impl ResourceRegistry for FileRegistry {
    fn lookup(&self, network: &str, name: &str) -> Result<Option<RegistryEntry>> {
        check_key("network", network)?;
        check_key("resource", name)?;

        let path = self.entry_path(network, name);
        if !path.is_file() {
            return Ok(None);
        }

        Self::read_entry(&path).map(Some)
    }

    fn record(&self, network: &str, entry: &RegistryEntry) -> Result<()> {
        check_key("resource", &entry.name)?;
        self.lock_network(network)?;

        let path = self.entry_path(network, &entry.name);
        let tmp_path = path.with_extension("json.tmp");
        let json =
            serde_json::to_string_pretty(entry).context("Failed to serialize registry entry")?;

        let mut file = File::create(&tmp_path)
            .with_context(|| format!("Failed to create {}", tmp_path.display()))?;
        file.write_all(json.as_bytes())
            .with_context(|| format!("Failed to write {}", tmp_path.display()))?;
        file.sync_all()
            .with_context(|| format!("Failed to sync {}", tmp_path.display()))?;
        drop(file);

        std::fs::rename(&tmp_path, &path).with_context(|| {
            format!(
                "Failed to move {} to {}",
                tmp_path.display(),
                path.display()
            )
        })?;

        tracing::debug!(network, name = %entry.name, path = %path.display(), "Registry entry written");
        Ok(())
    }

    fn list(&self, network: &str) -> Result<Vec<RegistryEntry>> {
        check_key("network", network)?;

        let dir = self.network_dir(network);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut entries = Vec::new();
        for dir_entry in std::fs::read_dir(&dir)
            .with_context(|| format!("Failed to list registry directory {}", dir.display()))?
        {
            let path = dir_entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            entries.push(Self::read_entry(&path)?);
        }

        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }
}

/// In-process registry.
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    entries: Mutex<HashMap<(String, String), RegistryEntry>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populate an entry.
    pub fn with_entry(self, network: &str, entry: RegistryEntry) -> Self {
        lock(&self.entries).insert((network.to_string(), entry.name.clone()), entry);
        self
    }
}

impl ResourceRegistry for MemoryRegistry {
    fn lookup(&self, network: &str, name: &str) -> Result<Option<RegistryEntry>> {
        Ok(lock(&self.entries)
            .get(&(network.to_string(), name.to_string()))
            .cloned())
    }

    fn record(&self, network: &str, entry: &RegistryEntry) -> Result<()> {
        lock(&self.entries).insert((network.to_string(), entry.name.clone()), entry.clone());
        Ok(())
    }

    fn list(&self, network: &str) -> Result<Vec<RegistryEntry>> {
        let mut entries: Vec<_> = lock(&self.entries)
            .iter()
            .filter(|((net, _), _)| net == network)
            .map(|(_, entry)| entry.clone())
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }
}
