//! Provisioning tool boundary and its `multipass` implementation.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use deskvm_error::{Error, Result};
use deskvm_exec::{ExecOptions, ExecOutput, Runner, RunnerExt};
use serde::Deserialize;

use crate::config::VmSpec;

/// Exit code the provisioning tool uses for an unknown instance.
pub const EXIT_UNKNOWN_INSTANCE: i32 = 2;

/// What the provisioning tool reports about one instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct InstanceInfo {
    /// Run state as reported by the tool (`Running`, `Stopped`, ...).
    pub state: String,
    /// IPv4 addresses, in the tool's order.
    #[serde(default)]
    pub ipv4: Vec<String>,
}

impl InstanceInfo {
    /// Returns true if the tool considers the instance running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state == "Running"
    }

    /// Returns true if the tool considers the instance stopped.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.state == "Stopped"
    }
}

/// The provisioning operations VM lifecycle management needs.
pub trait Provisioner: Send + Sync {
    /// Creates and boots a new instance.
    fn launch(&self, spec: &VmSpec) -> Result<()>;

    /// Boots an existing instance.
    fn start(&self, name: &str) -> Result<()>;

    /// Shuts an instance down.
    fn stop(&self, name: &str) -> Result<()>;

    /// Current information about an instance.
    ///
    /// An unknown instance fails with exit code
    /// [`EXIT_UNKNOWN_INSTANCE`].
    fn info(&self, name: &str) -> Result<InstanceInfo>;

    /// Returns true if the tool knows the instance.
    fn exists(&self, name: &str) -> Result<bool>;

    /// Deletes and purges an instance.
    fn delete_purge(&self, name: &str) -> Result<()>;

    /// Runs `command` inside the instance without checking its status.
    fn exec(&self, name: &str, command: &[&str], opts: &ExecOptions) -> Result<ExecOutput>;

    /// Copies a host file into the instance.
    fn copy_into(&self, name: &str, source: &Path, destination: &str) -> Result<()>;
}

#[derive(Debug, Deserialize)]
struct InfoReply {
    info: HashMap<String, InstanceInfo>,
}

/// [`Provisioner`] driving the `multipass` CLI.
pub struct MultipassProvisioner {
    runner: Arc<dyn Runner>,
    binary: String,
}

impl MultipassProvisioner {
    /// Creates a client invoking `binary`.
    pub fn new(runner: Arc<dyn Runner>, binary: impl Into<String>) -> Self {
        Self {
            runner,
            binary: binary.into(),
        }
    }

    fn argv<'a>(&'a self, args: &[&'a str]) -> Vec<&'a str> {
        let mut argv = vec![self.binary.as_str()];
        argv.extend_from_slice(args);
        argv
    }
}

impl Provisioner for MultipassProvisioner {
    fn launch(&self, spec: &VmSpec) -> Result<()> {
        self.runner.check_call(
            &self.argv(&[
                "launch",
                "--name",
                spec.name.as_str(),
                "--disk",
                spec.disk_size.as_str(),
                "--memory",
                spec.memory.as_str(),
            ]),
            &ExecOptions::default(),
        )
    }

    fn start(&self, name: &str) -> Result<()> {
        self.runner
            .check_call(&self.argv(&["start", name]), &ExecOptions::default())
    }

    fn stop(&self, name: &str) -> Result<()> {
        self.runner
            .check_call(&self.argv(&["stop", name]), &ExecOptions::default())
    }

    fn info(&self, name: &str) -> Result<InstanceInfo> {
        let json = self.runner.check_output(
            &self.argv(&["info", name, "--format", "json"]),
            &ExecOptions::default(),
        )?;
        parse_info(&json, name)
    }

    fn exists(&self, name: &str) -> Result<bool> {
        Ok(self
            .runner
            .run(&self.argv(&["info", name]), &ExecOptions::quiet())?
            .success())
    }

    fn delete_purge(&self, name: &str) -> Result<()> {
        self.runner
            .check_call(&self.argv(&["delete", "--purge", name]), &ExecOptions::default())
    }

    fn exec(&self, name: &str, command: &[&str], opts: &ExecOptions) -> Result<ExecOutput> {
        let mut argv = self.argv(&["exec", name, "--"]);
        argv.extend_from_slice(command);
        self.runner.run(&argv, opts)
    }

    fn copy_into(&self, name: &str, source: &Path, destination: &str) -> Result<()> {
        let source = source.to_str().ok_or_else(|| {
            Error::config(format!("path is not valid UTF-8: {}", source.display()))
        })?;
        let target = format!("{name}:{destination}");
        self.runner.check_call(
            &self.argv(&["copy-files", source, target.as_str()]),
            &ExecOptions::default(),
        )
    }
}

/// Extracts the entry for `name` from `multipass info --format json`.
pub fn parse_info(json: &str, name: &str) -> Result<InstanceInfo> {
    let mut reply: InfoReply = serde_json::from_str(json)?;
    reply
        .info
        .remove(name)
        .ok_or_else(|| Error::not_found(format!("instance '{name}' in info output")))
}
