//! Test harness for the E2E environment.
//!
//! The harness manages:
//! - Configuration read from the environment
//! - Log output routed through the test writer
//! - VM handles that share one vsock id allocator

use std::fmt;
use std::path::PathBuf;

use anyhow::{Context, Result};
use deskvm_vm::{Backend, CidAllocator, LifecycleConfig, VirtualMachine, VmSpec};
use tracing_subscriber::EnvFilter;

/// Optional path to a TOML [`LifecycleConfig`].
pub const CONFIG_ENV: &str = "DESKVM_CONFIG";
/// Ignore existing snapshots and provision from scratch.
pub const FORCE_NEW_VMS_ENV: &str = "DESKVM_FORCE_NEW_VMS";
/// Log at `debug` instead of `info`.
pub const VERBOSE_ENV: &str = "E2E_VERBOSE";

/// Test configuration.
#[derive(Debug, Clone, Default)]
pub struct TestConfig {
    /// VM lifecycle settings.
    pub lifecycle: LifecycleConfig,
    /// Where `lifecycle` was loaded from, if not the defaults.
    pub config_path: Option<PathBuf>,
    /// Rebuild snapshots instead of restoring them.
    pub force_new_vms: bool,
    /// Enable verbose logging.
    pub verbose: bool,
}

impl TestConfig {
    /// Reads the configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads the configuration through `lookup`, which maps a variable name
    /// to its value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let config_path = lookup(CONFIG_ENV)
            .filter(|value| !value.is_empty())
            .map(PathBuf::from);
        let lifecycle = match &config_path {
            Some(path) => LifecycleConfig::from_file(path)
                .with_context(|| format!("failed to load {CONFIG_ENV}={}", path.display()))?,
            None => LifecycleConfig::default(),
        };

        Ok(Self {
            lifecycle,
            config_path,
            force_new_vms: lookup(FORCE_NEW_VMS_ENV).as_deref().is_some_and(is_truthy),
            verbose: lookup(VERBOSE_ENV).is_some(),
        })
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Installs a test-writer subscriber. `RUST_LOG` wins over `verbose`.
///
/// Safe to call from every test; only the first call takes effect.
pub fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

// ============================================================================
// Harness
// ============================================================================

/// Creates VM handles for one test run.
pub struct TestHarness {
    config: TestConfig,
    backend: Backend,
    cids: CidAllocator,
}

impl TestHarness {
    /// Creates a harness against the real hypervisor and provisioning tool,
    /// configured from the environment.
    pub fn from_env() -> Result<Self> {
        let config = TestConfig::from_env()?;
        init_tracing(config.verbose);
        let backend = Backend::system(&config.lifecycle);
        Ok(Self::with_backend(config, backend))
    }

    /// Creates a harness over an explicit backend.
    pub fn with_backend(config: TestConfig, backend: Backend) -> Self {
        let cids = CidAllocator::new(config.lifecycle.first_cid);
        Self {
            config,
            backend,
            cids,
        }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &TestConfig {
        &self.config
    }

    /// Whether snapshots should be rebuilt.
    pub fn force_new_vms(&self) -> bool {
        self.config.force_new_vms
    }

    /// Binds a handle to the VM described by `spec`.
    pub fn machine(&self, spec: VmSpec) -> Result<VirtualMachine> {
        let name = spec.name.clone();
        VirtualMachine::new(
            spec,
            self.config.lifecycle.clone(),
            self.backend.clone(),
            &self.cids,
        )
        .with_context(|| format!("failed to bind VM '{name}'"))
    }
}

impl fmt::Debug for TestHarness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestHarness")
            .field("config", &self.config)
            .field("cids", &self.cids)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use deskvm_vm::testing::Fakes;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults_without_environment() {
        let config = TestConfig::from_lookup(lookup(&[])).unwrap();
        assert!(!config.force_new_vms);
        assert!(!config.verbose);
        assert!(config.config_path.is_none());
        assert_eq!(config.lifecycle.a11y_bus_user, "gdm");
    }

    #[test]
    fn test_force_flag_values() {
        for (value, expected) in [("1", true), ("TRUE", true), ("yes", true), ("0", false), ("", false)] {
            let config = TestConfig::from_lookup(lookup(&[(FORCE_NEW_VMS_ENV, value)])).unwrap();
            assert_eq!(config.force_new_vms, expected, "{value:?}");
        }
    }

    #[test]
    fn test_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deskvm.toml");
        std::fs::write(&path, "a11y_bus_user = \"ubuntu\"\nvsock_port_min = 7000\nvsock_port_max = 7010\n")
            .unwrap();

        let config = TestConfig::from_lookup(lookup(&[
            (CONFIG_ENV, path.to_str().unwrap()),
            (VERBOSE_ENV, ""),
        ]))
        .unwrap();
        assert_eq!(config.lifecycle.a11y_bus_user, "ubuntu");
        assert_eq!(config.lifecycle.vsock_port_min, 7000);
        assert!(config.verbose);
    }

    #[test]
    fn test_missing_config_file() {
        let err = TestConfig::from_lookup(lookup(&[(CONFIG_ENV, "/nonexistent/deskvm.toml")])).unwrap_err();
        assert!(err.to_string().contains(CONFIG_ENV));
    }

    #[test]
    fn test_machines_get_distinct_cids() {
        let fakes = Fakes::new();
        let harness = TestHarness::with_backend(TestConfig::default(), fakes.backend());
        let main = harness.machine(VmSpec::new("behave-tests-main")).unwrap();
        let second = harness.machine(VmSpec::new("behave-tests-second")).unwrap();
        assert_ne!(main.vsock_cid(), second.vsock_cid());
    }
}
