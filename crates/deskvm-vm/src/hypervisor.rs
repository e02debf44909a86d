//! Hypervisor boundary and its `virsh` implementation.

use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use deskvm_error::Result;
use deskvm_exec::{ExecOptions, Runner, RunnerExt};
use tempfile::NamedTempFile;
use tracing::debug;

/// Run state of a defined domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainState {
    /// Running, paused or otherwise holding resources.
    Active,
    /// Shut off or crashed.
    Inactive,
}

impl DomainState {
    /// Returns true if the domain is active.
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }

    /// Interprets the state names `virsh domstate` prints.
    #[must_use]
    pub fn from_virsh(state: &str) -> Self {
        match state.trim() {
            "shut off" | "crashed" => Self::Inactive,
            _ => Self::Active,
        }
    }
}

/// The hypervisor operations VM lifecycle management needs.
///
/// Domains are addressed by name.
pub trait Hypervisor: Send + Sync {
    /// Names of every defined domain.
    fn domain_names(&self) -> Result<Vec<String>>;

    /// Run state of `domain`, or `None` if no such domain is defined.
    fn domain_state(&self, domain: &str) -> Result<Option<DomainState>>;

    /// Current XML definition of `domain`.
    fn domain_xml(&self, domain: &str) -> Result<String>;

    /// Defines (or redefines) a domain from XML, validating it first.
    fn define(&self, xml: &str) -> Result<()>;

    /// Removes the definition together with managed save images and
    /// snapshot metadata.
    fn undefine(&self, domain: &str) -> Result<()>;

    /// Names of the snapshots of `domain`.
    fn snapshot_names(&self, domain: &str) -> Result<Vec<String>>;

    /// Reverts `domain` to `snapshot`.
    fn revert_snapshot(&self, domain: &str, snapshot: &str) -> Result<()>;

    /// Creates a snapshot from a `<domainsnapshot>` definition.
    fn create_snapshot(&self, domain: &str, xml: &str) -> Result<()>;

    /// Deletes `snapshot` of `domain`.
    fn delete_snapshot(&self, domain: &str, snapshot: &str) -> Result<()>;

    /// Detaches the device described by `xml` from the current
    /// configuration.
    fn detach_device(&self, domain: &str, xml: &str) -> Result<()>;

    /// Writes a screenshot of the first screen to `path`.
    fn screenshot(&self, domain: &str, path: &Path) -> Result<()>;

    /// Presses `keys` together and releases them. Keys are Linux input
    /// event names such as `KEY_LEFTCTRL`.
    fn send_keys(&self, domain: &str, keys: &[&str]) -> Result<()>;
}

/// [`Hypervisor`] driving libvirt through the `virsh` CLI.
pub struct VirshHypervisor {
    runner: Arc<dyn Runner>,
    binary: String,
    uri: String,
}

impl VirshHypervisor {
    /// Creates a client connecting to `uri`.
    pub fn new(runner: Arc<dyn Runner>, binary: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            runner,
            binary: binary.into(),
            uri: uri.into(),
        }
    }

    fn argv<'a>(&'a self, args: &[&'a str]) -> Vec<&'a str> {
        let mut argv = vec![self.binary.as_str(), "--connect", self.uri.as_str()];
        argv.extend_from_slice(args);
        argv
    }

    fn check_call(&self, args: &[&str]) -> Result<()> {
        self.runner
            .check_call(&self.argv(args), &ExecOptions::default())
    }

    fn check_output(&self, args: &[&str]) -> Result<String> {
        self.runner
            .check_output(&self.argv(args), &ExecOptions::quiet())
    }
}

impl Hypervisor for VirshHypervisor {
    fn domain_names(&self) -> Result<Vec<String>> {
        let output = self.check_output(&["list", "--all", "--name"])?;
        Ok(non_empty_lines(&output))
    }

    fn domain_state(&self, domain: &str) -> Result<Option<DomainState>> {
        if !self.domain_names()?.iter().any(|name| name == domain) {
            return Ok(None);
        }
        let state = self.check_output(&["domstate", domain])?;
        Ok(Some(DomainState::from_virsh(&state)))
    }

    fn domain_xml(&self, domain: &str) -> Result<String> {
        self.check_output(&["dumpxml", domain])
    }

    fn define(&self, xml: &str) -> Result<()> {
        let file = xml_file(xml)?;
        let path = path_str(file.path())?;
        self.check_call(&["define", path, "--validate"])
    }

    fn undefine(&self, domain: &str) -> Result<()> {
        self.check_call(&[
            "undefine",
            domain,
            "--managed-save",
            "--snapshots-metadata",
        ])
    }

    fn snapshot_names(&self, domain: &str) -> Result<Vec<String>> {
        let output = self.check_output(&["snapshot-list", domain, "--name"])?;
        Ok(non_empty_lines(&output))
    }

    fn revert_snapshot(&self, domain: &str, snapshot: &str) -> Result<()> {
        self.check_call(&["snapshot-revert", domain, snapshot])
    }

    fn create_snapshot(&self, domain: &str, xml: &str) -> Result<()> {
        let file = xml_file(xml)?;
        let path = path_str(file.path())?;
        self.check_call(&["snapshot-create", domain, path])
    }

    fn delete_snapshot(&self, domain: &str, snapshot: &str) -> Result<()> {
        self.check_call(&["snapshot-delete", domain, snapshot])
    }

    fn detach_device(&self, domain: &str, xml: &str) -> Result<()> {
        let file = xml_file(xml)?;
        let path = path_str(file.path())?;
        self.check_call(&["detach-device", domain, path, "--current"])
    }

    fn screenshot(&self, domain: &str, path: &Path) -> Result<()> {
        self.check_call(&["screenshot", domain, path_str(path)?, "--screen", "0"])
    }

    fn send_keys(&self, domain: &str, keys: &[&str]) -> Result<()> {
        let mut args = vec!["send-key", domain, "--codeset", "linux", "--holdtime", "40"];
        args.extend_from_slice(keys);
        self.check_call(&args)
    }
}

fn non_empty_lines(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// Writes `xml` to a temporary file that lives as long as the handle.
fn xml_file(xml: &str) -> Result<NamedTempFile> {
    let mut file = tempfile::Builder::new()
        .prefix("deskvm-")
        .suffix(".xml")
        .tempfile()?;
    file.write_all(xml.as_bytes())?;
    file.flush()?;
    debug!(path = %file.path().display(), "Wrote XML definition");
    Ok(file)
}

fn path_str(path: &Path) -> Result<&str> {
    path.to_str().ok_or_else(|| {
        deskvm_error::Error::config(format!("path is not valid UTF-8: {}", path.display()))
    })
}
