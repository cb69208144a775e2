//! Per-VM workspace directory
//!
//! A workspace is a directory holding the disk chain plus a small
//! `config.yml` with the VM identity. Identity fields are generated on
//! first open and persisted, so a VM keeps its MAC address and UUID
//! across invocations. The VM name is derived from the directory name.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use color_eyre::eyre::{eyre, Context};
use color_eyre::Result;
use rand::Rng;
use regex::Regex;
use tracing::debug;
use uuid::Uuid;
use yaml_rust2::yaml::{Hash, Yaml};
use yaml_rust2::{YamlEmitter, YamlLoader};

use crate::chain::DiskChain;
use crate::hostexec::HostExec;
use crate::hypervisor::BootOptions;

pub const DEFAULT_MEMORY: &str = "1G";

const CONFIG_FILE: &str = "config.yml";
const PID_FILE: &str = "vmkit.pid";

/// Persisted workspace identity and settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceConfig {
    pub memory: String,
    pub mac_address: String,
    pub uuid: String,
    /// CIDR subnet override for the bridged network.
    pub network: Option<String>,
}

/// QEMU uses 52:54:00 as its locally administered OUI.
fn random_mac() -> String {
    let mut rng = rand::rng();
    format!(
        "52:54:00:{:02x}:{:02x}:{:02x}",
        rng.random::<u8>(),
        rng.random::<u8>(),
        rng.random::<u8>()
    )
}

pub struct Workspace {
    dir: PathBuf,
    pub config: WorkspaceConfig,
    chain: DiskChain,
}

impl Workspace {
    /// Open (or implicitly create the identity of) the workspace at
    /// `dir`. Generated fields are persisted right away so a concurrent
    /// reader sees the same identity.
    pub fn open(dir: impl Into<PathBuf>, exec: Arc<dyn HostExec>) -> Result<Self> {
        let dir = dir.into();
        let config_path = dir.join(CONFIG_FILE);
        let mut persisted = false;
        let mut config = WorkspaceConfig {
            memory: DEFAULT_MEMORY.to_string(),
            mac_address: String::new(),
            uuid: String::new(),
            network: None,
        };

        if config_path.exists() {
            let raw = fs::read_to_string(&config_path)
                .wrap_err_with(|| format!("reading {}", config_path.display()))?;
            let docs = YamlLoader::load_from_str(&raw)
                .wrap_err_with(|| format!("parsing {}", config_path.display()))?;
            if let Some(doc) = docs.first() {
                if let Some(memory) = doc["memory"].as_str() {
                    config.memory = memory.to_string();
                }
                if let Some(mac) = doc["mac_address"].as_str() {
                    config.mac_address = mac.to_string();
                }
                if let Some(uuid) = doc["uuid"].as_str() {
                    config.uuid = uuid.to_string();
                }
                if let Some(network) = doc["network"].as_str() {
                    config.network = Some(network.to_string());
                }
            }
            persisted = true;
        }

        if config.mac_address.is_empty() {
            config.mac_address = random_mac();
            persisted = false;
        }
        if config.uuid.is_empty() {
            config.uuid = Uuid::new_v4().to_string();
            persisted = false;
        }

        let chain = DiskChain::new(&dir, exec);
        let ws = Self { dir, config, chain };
        if !persisted {
            debug!("generated identity for workspace {}", ws.dir.display());
            ws.save_config()?;
        }
        Ok(ws)
    }

    /// VM name derived from the directory: lowercased, every run of
    /// non-alphanumeric characters collapsed to an underscore.
    pub fn name(&self) -> String {
        let base = self
            .dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "vm".to_string());
        let re = Regex::new(r"[^a-z0-9]+").unwrap();
        re.replace_all(&base.to_lowercase(), "_").into_owned()
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn chain(&self) -> &DiskChain {
        &self.chain
    }

    /// Persist the config, omitting values that equal their defaults.
    pub fn save_config(&self) -> Result<()> {
        let mut hash = Hash::new();
        if self.config.memory != DEFAULT_MEMORY {
            hash.insert(
                Yaml::String("memory".to_string()),
                Yaml::String(self.config.memory.clone()),
            );
        }
        hash.insert(
            Yaml::String("mac_address".to_string()),
            Yaml::String(self.config.mac_address.clone()),
        );
        hash.insert(
            Yaml::String("uuid".to_string()),
            Yaml::String(self.config.uuid.clone()),
        );
        if let Some(ref network) = self.config.network {
            hash.insert(
                Yaml::String("network".to_string()),
                Yaml::String(network.clone()),
            );
        }

        let mut out = String::new();
        YamlEmitter::new(&mut out)
            .dump(&Yaml::Hash(hash))
            .wrap_err("serializing workspace config")?;
        out.push('\n');
        let path = self.dir.join(CONFIG_FILE);
        fs::write(&path, out).wrap_err_with(|| format!("writing {}", path.display()))?;
        Ok(())
    }

    /// Configured memory in MiB, parsed from forms like `512M` or `1G`.
    pub fn memory_mb(&self) -> Result<u64> {
        let re = Regex::new(r"^(\d+)([MG])$").unwrap();
        let caps = re
            .captures(&self.config.memory)
            .ok_or_else(|| eyre!("invalid memory setting {:?}", self.config.memory))?;
        let n: u64 = caps[1].parse()?;
        Ok(match &caps[2] {
            "G" => n * 1024,
            _ => n,
        })
    }

    /// Boot options for a plain boot of the current disk image.
    pub fn boot_options(&self) -> Result<BootOptions> {
        Ok(BootOptions {
            name: self.name(),
            uuid: self.config.uuid.clone(),
            mac_address: self.config.mac_address.clone(),
            memory_mb: self.memory_mb()?,
            disk: self.chain.current()?,
            ..Default::default()
        })
    }

    /// Claim exclusive mutation rights over the workspace. A pidfile of
    /// a live process means another invocation is using it; a stale
    /// pidfile is replaced.
    pub fn claim(&self) -> Result<()> {
        let path = self.dir.join(PID_FILE);
        if let Ok(raw) = fs::read_to_string(&path) {
            if let Ok(pid) = raw.trim().parse::<u32>() {
                if pid != std::process::id() && Path::new(&format!("/proc/{pid}")).exists() {
                    return Err(eyre!(
                        "workspace {} is in use by pid {pid}",
                        self.dir.display()
                    ));
                }
            }
        }
        fs::write(&path, format!("{}\n", std::process::id()))
            .wrap_err_with(|| format!("writing {}", path.display()))?;
        Ok(())
    }

    pub fn release(&self) {
        let _ = fs::remove_file(self.dir.join(PID_FILE));
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::hostexec::testutil::RecordingExec;

    fn open(dir: &Path) -> Workspace {
        Workspace::open(dir, Arc::new(RecordingExec::new())).unwrap()
    }

    #[test]
    fn test_name_is_sanitized() {
        let root = TempDir::new().unwrap();
        let dir = root.path().join("My VM-01");
        fs::create_dir(&dir).unwrap();
        assert_eq!(open(&dir).name(), "my_vm_01");
    }

    #[test]
    fn test_identity_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let first = open(dir.path());
        assert!(first.config.mac_address.starts_with("52:54:00:"));
        assert_eq!(first.config.memory, DEFAULT_MEMORY);

        let second = open(dir.path());
        assert_eq!(second.config.mac_address, first.config.mac_address);
        assert_eq!(second.config.uuid, first.config.uuid);
    }

    #[test]
    fn test_non_default_settings_round_trip() {
        let dir = TempDir::new().unwrap();
        let mut ws = open(dir.path());
        ws.config.memory = "512M".to_string();
        ws.config.network = Some("10.0.7.1/24".to_string());
        ws.save_config().unwrap();

        let again = open(dir.path());
        assert_eq!(again.config.memory, "512M");
        assert_eq!(again.config.network.as_deref(), Some("10.0.7.1/24"));
        assert_eq!(again.memory_mb().unwrap(), 512);
    }

    #[test]
    fn test_memory_parsing() {
        let dir = TempDir::new().unwrap();
        let mut ws = open(dir.path());
        assert_eq!(ws.memory_mb().unwrap(), 1024);
        ws.config.memory = "2G".to_string();
        assert_eq!(ws.memory_mb().unwrap(), 2048);
        ws.config.memory = "lots".to_string();
        assert!(ws.memory_mb().is_err());
    }

    #[test]
    fn test_claim_replaces_stale_pidfile() {
        let dir = TempDir::new().unwrap();
        let ws = open(dir.path());
        fs::write(dir.path().join(PID_FILE), "not-a-pid\n").unwrap();
        ws.claim().unwrap();
        let raw = fs::read_to_string(dir.path().join(PID_FILE)).unwrap();
        assert_eq!(raw.trim(), std::process::id().to_string());
        ws.release();
        assert!(!dir.path().join(PID_FILE).exists());
    }

    #[test]
    fn test_claim_refuses_live_holder() {
        let dir = TempDir::new().unwrap();
        let ws = open(dir.path());
        // PID 1 always exists.
        fs::write(dir.path().join(PID_FILE), "1\n").unwrap();
        assert!(ws.claim().is_err());
    }
}
