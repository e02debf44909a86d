//! Lifecycle configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use deskvm_error::{Error, Result};
use serde::{Deserialize, Serialize};

// =============================================================================
// Defaults
// =============================================================================

const DEFAULT_WAIT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;
const DEFAULT_APPLICATION_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_VSOCK_PORT_MIN: u32 = 6000;
const DEFAULT_VSOCK_PORT_MAX: u32 = 6100;
const DEFAULT_A11Y_BUS_USER: &str = "gdm";

/// Lowest context id a guest may use. 0-2 are reserved.
pub const FIRST_GUEST_CID: u32 = 3;

// =============================================================================
// LifecycleConfig
// =============================================================================

/// Settings shared by every VM of a test run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Provisioning tool binary.
    pub multipass_binary: String,
    /// Hypervisor CLI binary.
    pub virsh_binary: String,
    /// Hypervisor connection URI.
    pub libvirt_uri: String,
    /// Host directory for per-VM bus sockets.
    pub runtime_dir: PathBuf,
    /// Budget for a VM to report "Stopped".
    pub wait_stopped_timeout_secs: u64,
    /// Budget for a VM to report "Running" or answer a command.
    pub wait_running_timeout_secs: u64,
    /// Poll interval of the readiness loops.
    pub poll_interval_ms: u64,
    /// Budget for an application to register on a forwarded bus.
    pub application_timeout_ms: u64,
    /// First vsock port scanned for the bus proxy.
    pub vsock_port_min: u32,
    /// Last vsock port scanned for the bus proxy.
    pub vsock_port_max: u32,
    /// Context id of the first VM created in this process.
    pub first_cid: u32,
    /// Guest user whose accessibility bus is forwarded initially.
    pub a11y_bus_user: String,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            multipass_binary: "multipass".into(),
            virsh_binary: "virsh".into(),
            libvirt_uri: "qemu:///system".into(),
            runtime_dir: default_runtime_dir(),
            wait_stopped_timeout_secs: DEFAULT_WAIT_TIMEOUT_SECS,
            wait_running_timeout_secs: DEFAULT_WAIT_TIMEOUT_SECS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            application_timeout_ms: DEFAULT_APPLICATION_TIMEOUT_MS,
            vsock_port_min: DEFAULT_VSOCK_PORT_MIN,
            vsock_port_max: DEFAULT_VSOCK_PORT_MAX,
            first_cid: FIRST_GUEST_CID,
            a11y_bus_user: DEFAULT_A11Y_BUS_USER.into(),
        }
    }
}

impl LifecycleConfig {
    /// Loads configuration from a TOML file. Missing keys take their
    /// defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("{}: {e}", path.display())))?;
        Self::from_toml(&content)
    }

    /// Parses and validates a TOML document.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).map_err(|e| Error::config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.vsock_port_min > self.vsock_port_max {
            return Err(Error::config(format!(
                "vsock_port_min ({}) is greater than vsock_port_max ({})",
                self.vsock_port_min, self.vsock_port_max
            )));
        }
        if self.first_cid < FIRST_GUEST_CID {
            return Err(Error::config(format!(
                "first_cid must be at least {FIRST_GUEST_CID}, got {}",
                self.first_cid
            )));
        }
        if self.a11y_bus_user.is_empty() {
            return Err(Error::config("a11y_bus_user must not be empty"));
        }
        Ok(())
    }

    #[must_use]
    pub fn wait_stopped_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_stopped_timeout_secs)
    }

    #[must_use]
    pub fn wait_running_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_running_timeout_secs)
    }

    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    #[must_use]
    pub fn application_timeout(&self) -> Duration {
        Duration::from_millis(self.application_timeout_ms)
    }
}

/// `$XDG_RUNTIME_DIR/deskvm`, or `/run/user/<uid>/deskvm` when unset.
#[must_use]
pub fn default_runtime_dir() -> PathBuf {
    let base = std::env::var_os("XDG_RUNTIME_DIR")
        .filter(|dir| !dir.is_empty())
        .map_or_else(
            || PathBuf::from(format!("/run/user/{}", nix::unistd::getuid())),
            PathBuf::from,
        );
    base.join("deskvm")
}

// =============================================================================
// VmSpec
// =============================================================================

fn default_disk_size() -> String {
    "5G".into()
}

fn default_memory() -> String {
    "2G".into()
}

/// Identity and size of one VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmSpec {
    /// Instance name, shared by the provisioning tool and the hypervisor.
    pub name: String,
    /// Disk size passed to the provisioning tool.
    #[serde(default = "default_disk_size")]
    pub disk_size: String,
    /// Memory size passed to the provisioning tool.
    #[serde(default = "default_memory")]
    pub memory: String,
}

impl VmSpec {
    /// A VM with the default 5G disk and 2G memory.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            disk_size: default_disk_size(),
            memory: default_memory(),
        }
    }

    #[must_use]
    pub fn with_disk_size(mut self, disk_size: impl Into<String>) -> Self {
        self.disk_size = disk_size.into();
        self
    }

    #[must_use]
    pub fn with_memory(mut self, memory: impl Into<String>) -> Self {
        self.memory = memory.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = LifecycleConfig::default();
        assert_eq!(config.libvirt_uri, "qemu:///system");
        assert_eq!(config.wait_running_timeout(), Duration::from_secs(30));
        assert_eq!(config.poll_interval(), Duration::from_secs(1));
        assert_eq!((config.vsock_port_min, config.vsock_port_max), (6000, 6100));
        assert_eq!(config.first_cid, 3);
        assert_eq!(config.a11y_bus_user, "gdm");
        assert!(config.runtime_dir.ends_with("deskvm"));
    }

    #[test]
    fn test_partial_toml() {
        let config = LifecycleConfig::from_toml(
            r#"
            libvirt_uri = "qemu+ssh://host/system"
            poll_interval_ms = 250
            runtime_dir = "/tmp/deskvm"
            "#,
        )
        .unwrap();
        assert_eq!(config.libvirt_uri, "qemu+ssh://host/system");
        assert_eq!(config.poll_interval(), Duration::from_millis(250));
        assert_eq!(config.runtime_dir, PathBuf::from("/tmp/deskvm"));
        assert_eq!(config.multipass_binary, "multipass");
    }

    #[test]
    fn test_invalid_port_range() {
        let err = LifecycleConfig::from_toml("vsock_port_min = 7000\nvsock_port_max = 6000").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_reserved_cid_rejected() {
        let err = LifecycleConfig::from_toml("first_cid = 2").unwrap_err();
        assert!(err.to_string().contains("first_cid"));
    }

    #[test]
    fn test_from_file_missing_returns_config_error() {
        let result = LifecycleConfig::from_file("/nonexistent/deskvm-test-config.toml");
        assert!(matches!(result.unwrap_err(), Error::Config(_)));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deskvm.toml");
        std::fs::write(&path, "a11y_bus_user = \"ubuntu\"\n").unwrap();
        let config = LifecycleConfig::from_file(&path).unwrap();
        assert_eq!(config.a11y_bus_user, "ubuntu");
    }

    #[test]
    fn test_vm_spec_defaults() {
        let spec: VmSpec = toml::from_str("name = \"behave-tests-second\"\ndisk_size = \"10G\"").unwrap();
        assert_eq!(spec.disk_size, "10G");
        assert_eq!(spec.memory, "2G");
        assert_eq!(VmSpec::new("main").with_memory("4G").memory, "4G");
    }
}
