//! Mapping configuration: the document format, validation, persistence and the
//! live snapshot shared between the forwarding layer and the admin endpoint.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use crate::common::{parse_listen_address, split_host_port};
use crate::error::{Error, Result};

/// Default configuration file path.
pub const DEFAULT_CONFIG_PATH: &str = "config.yaml";

/// One forwarding rule: connections accepted on `local` are relayed to `remote`.
///
/// The pair itself is the identity of a mapping.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Mapping {
    /// Address dialed for every accepted connection (`host:port`).
    pub remote: String,
    /// Address the listener binds (`host:port` or `:port`).
    pub local: String,
}

impl Mapping {
    pub fn new(remote: impl Into<String>, local: impl Into<String>) -> Self {
        Self {
            remote: remote.into(),
            local: local.into(),
        }
    }

    /// Parses the local side into a bindable socket address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        parse_listen_address(&self.local)
    }

    /// Checks both addresses are well formed.
    pub fn validate(&self) -> Result<()> {
        self.local_addr()?;
        split_host_port(&self.remote)?;
        Ok(())
    }
}

impl fmt::Display for Mapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.local, self.remote)
    }
}

/// Validates a whole mapping list.
///
/// Rejects malformed addresses, exact duplicates, and two mappings binding the
/// same local address. Port 0 asks the OS for a fresh port, so it never clashes.
pub fn validate_mappings(mappings: &[Mapping]) -> Result<()> {
    let mut seen = HashSet::new();
    let mut bound: Vec<SocketAddr> = Vec::new();

    for mapping in mappings {
        mapping.validate()?;

        if !seen.insert(mapping) {
            return Err(Error::InvalidMapping(format!("duplicate mapping {}", mapping)));
        }

        let local = mapping.local_addr()?;
        if local.port() == 0 {
            continue;
        }
        if let Some(other) = bound.iter().find(|other| locals_clash(**other, local)) {
            return Err(Error::InvalidMapping(format!(
                "local address {} conflicts with {} used by another mapping",
                mapping.local, other
            )));
        }
        bound.push(local);
    }

    Ok(())
}

/// Two listen addresses on the same port clash when they are equal or one of
/// them is a wildcard covering the other. `[::]` also covers IPv4 on dual-stack hosts.
fn locals_clash(a: SocketAddr, b: SocketAddr) -> bool {
    if a.port() != b.port() {
        return false;
    }
    if a.ip() == b.ip() {
        return true;
    }
    let covers = |wide: SocketAddr, other: SocketAddr| {
        wide.ip().is_unspecified() && (wide.is_ipv6() || other.is_ipv4())
    };
    covers(a, b) || covers(b, a)
}

/// On-disk and over-the-wire configuration document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigDocument {
    #[serde(default)]
    pub mappings: Vec<Mapping>,
}

/// Serialization format of a configuration document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Yaml,
    Json,
    Toml,
}

impl ConfigFormat {
    /// Picks the format from a file extension; YAML unless `.json` or `.toml`.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => ConfigFormat::Json,
            Some(ext) if ext.eq_ignore_ascii_case("toml") => ConfigFormat::Toml,
            _ => ConfigFormat::Yaml,
        }
    }
}

impl ConfigDocument {
    /// Parses and validates a document.
    pub fn parse(content: &str, format: ConfigFormat) -> Result<Self> {
        let doc: ConfigDocument = match format {
            ConfigFormat::Yaml => serde_yaml::from_str(content)
                .map_err(|e| Error::Config(format!("failed to parse YAML: {}", e)))?,
            ConfigFormat::Json => serde_json::from_str(content)
                .map_err(|e| Error::Config(format!("failed to parse JSON: {}", e)))?,
            ConfigFormat::Toml => toml::from_str(content)
                .map_err(|e| Error::Config(format!("failed to parse TOML: {}", e)))?,
        };
        validate_mappings(&doc.mappings)?;
        Ok(doc)
    }

    /// Serializes the document.
    pub fn render(&self, format: ConfigFormat) -> Result<String> {
        match format {
            ConfigFormat::Yaml => serde_yaml::to_string(self)
                .map_err(|e| Error::Config(format!("failed to serialize YAML: {}", e))),
            ConfigFormat::Json => serde_json::to_string_pretty(self)
                .map_err(|e| Error::Config(format!("failed to serialize JSON: {}", e))),
            ConfigFormat::Toml => toml::to_string_pretty(self)
                .map_err(|e| Error::Config(format!("failed to serialize TOML: {}", e))),
        }
    }
}

/// Persistence for the mapping list.
pub trait MappingStore: Send + Sync {
    /// Reads the current mapping list.
    fn load(&self) -> Result<Vec<Mapping>>;

    /// Replaces the persisted mapping list.
    fn save(&self, mappings: &[Mapping]) -> Result<()>;
}

/// Mapping store backed by a single configuration file.
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
    format: ConfigFormat,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let format = ConfigFormat::from_path(&path);
        Self { path, format }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl MappingStore for FileStore {
    fn load(&self) -> Result<Vec<Mapping>> {
        let content = std::fs::read_to_string(&self.path).map_err(|e| {
            Error::Config(format!("failed to read {}: {}", self.path.display(), e))
        })?;
        Ok(ConfigDocument::parse(&content, self.format)?.mappings)
    }

    fn save(&self, mappings: &[Mapping]) -> Result<()> {
        let doc = ConfigDocument {
            mappings: mappings.to_vec(),
        };
        let content = doc
            .render(self.format)
            .map_err(|e| Error::Persist(e.to_string()))?;

        // Write next to the target and rename so readers never see a torn file.
        let mut tmp_name = self.path.file_name().unwrap_or_default().to_os_string();
        tmp_name.push(".tmp");
        let tmp_path = self.path.with_file_name(tmp_name);

        std::fs::write(&tmp_path, content)
            .map_err(|e| Error::Persist(format!("{}: {}", tmp_path.display(), e)))?;
        std::fs::rename(&tmp_path, &self.path)
            .map_err(|e| Error::Persist(format!("{}: {}", self.path.display(), e)))
    }
}

/// The authoritative current mapping list.
///
/// Replacement swaps the whole list at once; readers hold on to the list they
/// loaded and never observe a partial update.
#[derive(Debug)]
pub struct ConfigSnapshot {
    current: RwLock<Arc<[Mapping]>>,
}

impl ConfigSnapshot {
    pub fn new(mappings: Vec<Mapping>) -> Self {
        Self {
            current: RwLock::new(mappings.into()),
        }
    }

    /// Returns the current list.
    pub fn load(&self) -> Arc<[Mapping]> {
        Arc::clone(&self.current.read().unwrap_or_else(|e| e.into_inner()))
    }

    /// Atomically replaces the current list.
    pub fn replace(&self, mappings: Vec<Mapping>) {
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = mappings.into();
    }
}
