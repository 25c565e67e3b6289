use anyhow::{Context, Result};
use device_registry::{DeviceDescriptor, DiscoveryPolicy, HubConfig, InvokerConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Console settings, read from YAML. Every field is optional.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsoleConfig {
    pub poll_interval_ms: u64,
    pub balance_interval_ms: u64,
    pub deadline_ms: u64,
    pub arg_delay_ms: u64,
    pub command_gap_ms: u64,
    pub safe_mode: bool,
    pub prefer_manual: bool,
    pub outlier_filter: bool,
    pub store: PathBuf,
    pub devices: Vec<DeviceDescriptor>,
    pub devices_dir: Option<PathBuf>,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5000,
            balance_interval_ms: 2000,
            deadline_ms: 3000,
            arg_delay_ms: 20,
            command_gap_ms: 50,
            safe_mode: true,
            prefer_manual: false,
            outlier_filter: false,
            store: PathBuf::from("testbed-state.json"),
            devices: Vec::new(),
            devices_dir: None,
        }
    }
}

impl ConsoleConfig {
    /// Load `path`; a missing file means defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no config file; using defaults");
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path).with_context(|| format!("reading config: {}", path.display()))?;
        let cfg: Self = serde_yaml::from_str(&raw).with_context(|| format!("parsing yaml: {}", path.display()))?;
        Ok(cfg)
    }

    /// Inline devices followed by those in `devices_dir`. The first entry for
    /// a port wins.
    pub fn descriptors(&self) -> Result<Vec<DeviceDescriptor>> {
        let mut out = self.devices.clone();
        if let Some(dir) = &self.devices_dir {
            for desc in device_registry::load_descriptors_dir(dir)? {
                if out.iter().any(|d| d.port == desc.port) {
                    tracing::warn!(port = %desc.port, "duplicate device port; keeping inline entry");
                    continue;
                }
                out.push(desc);
            }
        }
        Ok(out)
    }

    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            invoker: InvokerConfig {
                deadline: Duration::from_millis(self.deadline_ms),
                arg_delay: Duration::from_millis(self.arg_delay_ms),
                ..InvokerConfig::default()
            },
            discovery: DiscoveryPolicy::default(),
            ..HubConfig::default()
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn balance_interval(&self) -> Duration {
        Duration::from_millis(self.balance_interval_ms.max(1))
    }

    pub fn command_gap(&self) -> Duration {
        Duration::from_millis(self.command_gap_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = ConsoleConfig::load(&dir.path().join("absent.yaml")).unwrap();
        assert!(cfg.safe_mode);
        assert_eq!(cfg.poll_interval(), Duration::from_secs(5));
        assert_eq!(cfg.hub_config().invoker.deadline, Duration::from_millis(3000));
    }

    #[test]
    fn partial_yaml_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tb.yaml");
        fs::write(
            &path,
            "safe_mode: false\narg_delay_ms: 5\ndevices:\n  - port: /dev/ttyUSB0\n    name: Generator\n",
        )
        .unwrap();
        let cfg = ConsoleConfig::load(&path).unwrap();
        assert!(!cfg.safe_mode);
        assert_eq!(cfg.hub_config().invoker.arg_delay, Duration::from_millis(5));
        assert_eq!(cfg.balance_interval_ms, 2000);
        assert_eq!(cfg.descriptors().unwrap().len(), 1);
    }

    #[test]
    fn inline_devices_win_over_directory() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.yml"), "port: p0\nname: Fan\n").unwrap();
        fs::write(dir.path().join("b.yml"), "port: p1\nname: House\n").unwrap();
        let cfg = ConsoleConfig {
            devices: vec![DeviceDescriptor {
                port: "p0".into(),
                name: "Generator".into(),
                baud: 9600,
                role: None,
                catalog: None,
            }],
            devices_dir: Some(dir.path().to_path_buf()),
            ..ConsoleConfig::default()
        };
        let descs = cfg.descriptors().unwrap();
        assert_eq!(descs.len(), 2);
        assert_eq!(descs[0].name, "Generator");
        assert_eq!(descs[1].port, "p1");
    }

    #[test]
    fn bad_yaml_names_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.yaml");
        fs::write(&path, "poll_interval_ms: [").unwrap();
        let err = ConsoleConfig::load(&path).unwrap_err();
        assert!(format!("{err:#}").contains("broken.yaml"));
    }
}
