//! Scripted stand-ins for the hypervisor, the provisioning tool, host
//! processes and bus connections.
//!
//! [`Fakes`] wires them into a [`Backend`] so lifecycle code runs without
//! libvirt or multipass:
//!
//! ```rust
//! use deskvm_vm::testing::Fakes;
//! use deskvm_vm::{CidAllocator, LifecycleConfig, VirtualMachine, VmSpec};
//!
//! let fakes = Fakes::new();
//! let mut vm = VirtualMachine::new(
//!     VmSpec::new("vm"),
//!     LifecycleConfig::default(),
//!     fakes.backend(),
//!     &CidAllocator::default(),
//! )
//! .unwrap();
//! vm.launch().unwrap();
//! assert!(vm.is_running().unwrap());
//! ```

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use deskvm_a11y::testing::FakeBus;
use deskvm_a11y::{A11yBus, BusConnector};
use deskvm_error::{BusError, BusErrorKind, Error, ExecFailure, Result};
use deskvm_exec::{ExecOptions, ExecOutput, Runner};
use xmltree::Element;

use crate::config::VmSpec;
use crate::domain::{disk_target, DomainXml, CLOUD_INIT_ISO};
use crate::hypervisor::{DomainState, Hypervisor};
use crate::machine::Backend;
use crate::provisioner::{InstanceInfo, Provisioner, EXIT_UNKNOWN_INSTANCE};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn exec_error(command: String, code: i32, stderr: impl Into<String>) -> Error {
    Error::Exec(ExecFailure {
        command,
        code: Some(code),
        stderr: stderr.into(),
    })
}

// =============================================================================
// ScriptedRunner
// =============================================================================

#[derive(Debug)]
struct Rule {
    prefix: Vec<String>,
    responses: VecDeque<ExecOutput>,
}

/// A [`Runner`] answering commands from a script.
///
/// Each rule matches commands starting with its prefix. The longest
/// matching prefix wins; among equal prefixes the latest rule wins.
/// Unmatched commands succeed with empty output.
#[derive(Debug, Default)]
pub struct ScriptedRunner {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<(Vec<String>, Option<String>)>>,
}

impl ScriptedRunner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Answers every command starting with `prefix` with `output`.
    pub fn on(&self, prefix: &[&str], output: ExecOutput) {
        self.on_sequence(prefix, vec![output]);
    }

    /// Answers successive matching commands with `outputs` in order,
    /// repeating the last one.
    pub fn on_sequence(&self, prefix: &[&str], outputs: Vec<ExecOutput>) {
        lock(&self.rules).push(Rule {
            prefix: prefix.iter().map(|s| (*s).to_string()).collect(),
            responses: outputs.into(),
        });
    }

    /// Every command run so far.
    pub fn calls(&self) -> Vec<Vec<String>> {
        lock(&self.calls).iter().map(|(argv, _)| argv.clone()).collect()
    }

    /// Standard input of every command run so far.
    pub fn stdin_log(&self) -> Vec<Option<String>> {
        lock(&self.calls)
            .iter()
            .map(|(_, stdin)| stdin.clone())
            .collect()
    }

    /// Number of commands run that start with `prefix`.
    pub fn count(&self, prefix: &[&str]) -> usize {
        let prefix: Vec<String> = prefix.iter().map(|s| (*s).to_string()).collect();
        lock(&self.calls)
            .iter()
            .filter(|(argv, _)| starts_with(argv, &prefix))
            .count()
    }
}

fn starts_with(argv: &[String], prefix: &[String]) -> bool {
    argv.len() >= prefix.len() && argv.iter().zip(prefix).all(|(a, p)| a == p)
}

impl Runner for ScriptedRunner {
    fn run(&self, argv: &[&str], opts: &ExecOptions) -> Result<ExecOutput> {
        let argv: Vec<String> = argv.iter().map(|s| (*s).to_string()).collect();
        lock(&self.calls).push((argv.clone(), opts.stdin.clone()));

        let mut rules = lock(&self.rules);
        let rule = rules
            .iter_mut()
            .enumerate()
            .filter(|(_, rule)| starts_with(&argv, &rule.prefix))
            .max_by_key(|(index, rule)| (rule.prefix.len(), *index))
            .map(|(_, rule)| rule);

        Ok(match rule {
            Some(rule) if rule.responses.len() > 1 => rule.responses.pop_front().unwrap_or_default(),
            Some(rule) => rule
                .responses
                .front()
                .cloned()
                .unwrap_or_else(|| ExecOutput::exited(0)),
            None => ExecOutput::exited(0),
        })
    }
}

// =============================================================================
// FakeHypervisor
// =============================================================================

/// A snapshot held by a [`FakeHypervisor`].
#[derive(Debug, Clone)]
pub struct FakeSnapshot {
    pub name: String,
    /// `<domainsnapshot>` definition it was created from.
    pub xml: String,
    /// Domain definition at the time of the snapshot.
    pub domain_xml: String,
    /// Whether the domain was running at the time of the snapshot.
    pub active: bool,
}

/// A domain held by a [`FakeHypervisor`].
#[derive(Debug, Clone)]
pub struct FakeDomain {
    pub xml: String,
    pub active: bool,
    pub snapshots: Vec<FakeSnapshot>,
}

/// An in-memory hypervisor.
#[derive(Debug, Default)]
pub struct FakeHypervisor {
    domains: Mutex<BTreeMap<String, FakeDomain>>,
    calls: Mutex<Vec<String>>,
}

impl FakeHypervisor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Adds a domain defined from [`sample_domain_xml`].
    pub fn insert_domain(&self, name: &str, active: bool) {
        lock(&self.domains).insert(
            name.to_string(),
            FakeDomain {
                xml: sample_domain_xml(name),
                active,
                snapshots: Vec::new(),
            },
        );
    }

    /// A copy of the domain named `name`.
    pub fn domain(&self, name: &str) -> Option<FakeDomain> {
        lock(&self.domains).get(name).cloned()
    }

    /// Powers the domain on or off. Unknown names are ignored.
    pub fn set_active(&self, name: &str, active: bool) {
        if let Some(domain) = lock(&self.domains).get_mut(name) {
            domain.active = active;
        }
    }

    /// Adds a snapshot of the domain's current state without going through
    /// [`Hypervisor::create_snapshot`].
    pub fn insert_snapshot(&self, domain: &str, snapshot: &str) {
        if let Some(d) = lock(&self.domains).get_mut(domain) {
            d.snapshots.push(FakeSnapshot {
                name: snapshot.to_string(),
                xml: String::new(),
                domain_xml: d.xml.clone(),
                active: d.active,
            });
        }
    }

    /// Every mutating call so far, as `"<operation> <domain> [<arg>]"`.
    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    fn record(&self, call: String) {
        lock(&self.calls).push(call);
    }

    fn with_domain<T>(&self, name: &str, f: impl FnOnce(&mut FakeDomain) -> Result<T>) -> Result<T> {
        let mut domains = lock(&self.domains);
        let domain = domains
            .get_mut(name)
            .ok_or_else(|| Error::not_found(format!("domain '{name}'")))?;
        f(domain)
    }
}

impl Hypervisor for FakeHypervisor {
    fn domain_names(&self) -> Result<Vec<String>> {
        Ok(lock(&self.domains).keys().cloned().collect())
    }

    fn domain_state(&self, domain: &str) -> Result<Option<DomainState>> {
        Ok(lock(&self.domains).get(domain).map(|d| {
            if d.active {
                DomainState::Active
            } else {
                DomainState::Inactive
            }
        }))
    }

    fn domain_xml(&self, domain: &str) -> Result<String> {
        self.with_domain(domain, |d| Ok(d.xml.clone()))
    }

    fn define(&self, xml: &str) -> Result<()> {
        let name = DomainXml::parse(xml)?
            .name()
            .ok_or_else(|| Error::xml("domain has no <name>"))?;
        self.record(format!("define {name}"));
        let mut domains = lock(&self.domains);
        match domains.get_mut(&name) {
            Some(domain) => domain.xml = xml.to_string(),
            None => {
                domains.insert(
                    name,
                    FakeDomain {
                        xml: xml.to_string(),
                        active: false,
                        snapshots: Vec::new(),
                    },
                );
            }
        }
        Ok(())
    }

    fn undefine(&self, domain: &str) -> Result<()> {
        self.record(format!("undefine {domain}"));
        lock(&self.domains)
            .remove(domain)
            .map(|_| ())
            .ok_or_else(|| Error::not_found(format!("domain '{domain}'")))
    }

    fn snapshot_names(&self, domain: &str) -> Result<Vec<String>> {
        self.with_domain(domain, |d| {
            Ok(d.snapshots.iter().map(|s| s.name.clone()).collect())
        })
    }

    fn revert_snapshot(&self, domain: &str, snapshot: &str) -> Result<()> {
        self.record(format!("revert {domain} {snapshot}"));
        self.with_domain(domain, |d| {
            let found = d
                .snapshots
                .iter()
                .find(|s| s.name == snapshot)
                .cloned()
                .ok_or_else(|| Error::not_found(format!("snapshot '{snapshot}'")))?;
            d.xml = found.domain_xml;
            d.active = found.active;
            Ok(())
        })
    }

    fn create_snapshot(&self, domain: &str, xml: &str) -> Result<()> {
        let root = Element::parse(xml.as_bytes()).map_err(Error::xml)?;
        let name = root
            .get_child("name")
            .and_then(|name| name.get_text())
            .map(|text| text.to_string())
            .ok_or_else(|| Error::xml("snapshot has no <name>"))?;
        self.record(format!("snapshot-create {domain} {name}"));
        self.with_domain(domain, |d| {
            if d.snapshots.iter().any(|s| s.name == name) {
                return Err(Error::remote(format!("snapshot '{name}' already exists")));
            }
            d.snapshots.push(FakeSnapshot {
                name,
                xml: xml.to_string(),
                domain_xml: d.xml.clone(),
                active: d.active,
            });
            Ok(())
        })
    }

    fn delete_snapshot(&self, domain: &str, snapshot: &str) -> Result<()> {
        self.record(format!("snapshot-delete {domain} {snapshot}"));
        self.with_domain(domain, |d| {
            let before = d.snapshots.len();
            d.snapshots.retain(|s| s.name != snapshot);
            if d.snapshots.len() == before {
                return Err(Error::not_found(format!("snapshot '{snapshot}'")));
            }
            Ok(())
        })
    }

    fn detach_device(&self, domain: &str, xml: &str) -> Result<()> {
        let device = Element::parse(xml.as_bytes()).map_err(Error::xml)?;
        let target = disk_target(&device).ok_or_else(|| Error::xml("device has no target"))?;
        self.record(format!("detach-device {domain} {target}"));
        self.with_domain(domain, |d| {
            let mut parsed = DomainXml::parse(&d.xml)?;
            if !parsed.remove_disk(&target) {
                return Err(Error::not_found(format!("disk '{target}'")));
            }
            d.xml = parsed.to_xml()?;
            Ok(())
        })
    }

    fn screenshot(&self, domain: &str, path: &Path) -> Result<()> {
        self.record(format!("screenshot {domain}"));
        self.with_domain(domain, |_| Ok(()))?;
        // A 1x1 black PPM.
        std::fs::write(path, b"P6\n1 1\n255\n\0\0\0")?;
        Ok(())
    }

    fn send_keys(&self, domain: &str, keys: &[&str]) -> Result<()> {
        self.record(format!("send-key {domain} {}", keys.join(" ")));
        self.with_domain(domain, |d| {
            if d.active {
                Ok(())
            } else {
                Err(Error::remote(format!("domain '{domain}' is not running")))
            }
        })
    }
}

/// A domain definition shaped like the ones the provisioning tool creates:
/// a system disk, the cloud-init seed image, VGA video and a VNC display.
#[must_use]
pub fn sample_domain_xml(name: &str) -> String {
    format!(
        r#"<domain type="kvm">
  <name>{name}</name>
  <devices>
    <disk type="file" device="disk">
      <source file="/var/lib/multipass/vault/instances/{name}/ubuntu.img"/>
      <target dev="vda" bus="virtio"/>
    </disk>
    <disk type="file" device="disk">
      <source file="/var/lib/multipass/vault/instances/{name}/{CLOUD_INIT_ISO}"/>
      <target dev="vdb" bus="virtio"/>
    </disk>
    <video><model type="cirrus"/></video>
    <graphics type="vnc" port="-1"/>
  </devices>
</domain>"#
    )
}

// =============================================================================
// FakeProvisioner
// =============================================================================

/// An in-memory provisioning tool that creates its domains on a
/// [`FakeHypervisor`] and forwards guest commands to a [`ScriptedRunner`].
#[derive(Debug)]
pub struct FakeProvisioner {
    hypervisor: Arc<FakeHypervisor>,
    guest: Arc<ScriptedRunner>,
    instances: Mutex<BTreeSet<String>>,
    calls: Mutex<Vec<String>>,
    reported_state: Mutex<Option<String>>,
    fail_delete: AtomicBool,
}

impl FakeProvisioner {
    pub fn new(hypervisor: Arc<FakeHypervisor>, guest: Arc<ScriptedRunner>) -> Arc<Self> {
        Arc::new(Self {
            hypervisor,
            guest,
            instances: Mutex::new(BTreeSet::new()),
            calls: Mutex::new(Vec::new()),
            reported_state: Mutex::new(None),
            fail_delete: AtomicBool::new(false),
        })
    }

    /// Registers an instance without launching it.
    pub fn insert_instance(&self, name: &str) {
        lock(&self.instances).insert(name.to_string());
    }

    /// Reports `state` from `info` regardless of the domain.
    pub fn report_state(&self, state: Option<&str>) {
        *lock(&self.reported_state) = state.map(str::to_string);
    }

    /// Makes `delete_purge` fail.
    pub fn fail_delete(&self, fail: bool) {
        self.fail_delete.store(fail, Ordering::SeqCst);
    }

    /// Every call so far, as `"<operation> <name>"`.
    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    fn record(&self, call: String) {
        lock(&self.calls).push(call);
    }

    fn require_instance(&self, operation: &str, name: &str) -> Result<()> {
        if lock(&self.instances).contains(name) {
            Ok(())
        } else {
            Err(exec_error(
                format!("multipass {operation} {name}"),
                EXIT_UNKNOWN_INSTANCE,
                format!("instance \"{name}\" does not exist"),
            ))
        }
    }
}

impl Provisioner for FakeProvisioner {
    fn launch(&self, spec: &VmSpec) -> Result<()> {
        self.record(format!("launch {}", spec.name));
        if !lock(&self.instances).insert(spec.name.clone()) {
            return Err(exec_error(
                format!("multipass launch --name {}", spec.name),
                1,
                format!("instance \"{}\" already exists", spec.name),
            ));
        }
        self.hypervisor.insert_domain(&spec.name, true);
        Ok(())
    }

    fn start(&self, name: &str) -> Result<()> {
        self.record(format!("start {name}"));
        self.require_instance("start", name)?;
        self.hypervisor.set_active(name, true);
        Ok(())
    }

    fn stop(&self, name: &str) -> Result<()> {
        self.record(format!("stop {name}"));
        self.require_instance("stop", name)?;
        self.hypervisor.set_active(name, false);
        Ok(())
    }

    fn info(&self, name: &str) -> Result<InstanceInfo> {
        self.require_instance("info", name)?;
        let active = self
            .hypervisor
            .domain(name)
            .is_some_and(|domain| domain.active);
        let state = lock(&self.reported_state)
            .clone()
            .unwrap_or_else(|| (if active { "Running" } else { "Stopped" }).to_string());
        Ok(InstanceInfo {
            ipv4: if active {
                vec!["192.168.122.10".to_string()]
            } else {
                Vec::new()
            },
            state,
        })
    }

    fn exists(&self, name: &str) -> Result<bool> {
        Ok(lock(&self.instances).contains(name))
    }

    fn delete_purge(&self, name: &str) -> Result<()> {
        self.record(format!("delete {name}"));
        if self.fail_delete.load(Ordering::SeqCst) {
            return Err(exec_error(
                format!("multipass delete --purge {name}"),
                1,
                "delete failed",
            ));
        }
        self.require_instance("delete --purge", name)?;
        lock(&self.instances).remove(name);
        Ok(())
    }

    fn exec(&self, name: &str, command: &[&str], opts: &ExecOptions) -> Result<ExecOutput> {
        self.record(format!("exec {name}"));
        if !lock(&self.instances).contains(name) {
            return Ok(ExecOutput::failed(
                EXIT_UNKNOWN_INSTANCE,
                format!("instance \"{name}\" does not exist"),
            ));
        }
        self.guest.run(command, opts)
    }

    fn copy_into(&self, name: &str, source: &Path, destination: &str) -> Result<()> {
        self.record(format!("copy-files {name}"));
        self.require_instance("copy-files", name)?;
        if !source.exists() {
            return Err(exec_error(
                format!("multipass copy-files {} {name}:{destination}", source.display()),
                1,
                "source does not exist",
            ));
        }
        Ok(())
    }
}

// =============================================================================
// FakeConnector
// =============================================================================

/// A [`BusConnector`] handing out one bus after a number of "socket not
/// found" failures.
pub struct FakeConnector {
    bus: Arc<dyn A11yBus>,
    not_found: AtomicUsize,
    sockets: Mutex<Vec<PathBuf>>,
}

impl FakeConnector {
    pub fn new(bus: Arc<dyn A11yBus>) -> Arc<Self> {
        Arc::new(Self {
            bus,
            not_found: AtomicUsize::new(0),
            sockets: Mutex::new(Vec::new()),
        })
    }

    /// Fails the next `attempts` connections with a not-found error.
    pub fn fail_next(&self, attempts: usize) {
        self.not_found.store(attempts, Ordering::SeqCst);
    }

    /// Socket of every connection attempt.
    pub fn sockets(&self) -> Vec<PathBuf> {
        lock(&self.sockets).clone()
    }
}

impl BusConnector for FakeConnector {
    fn connect(&self, socket: &Path) -> Result<Arc<dyn A11yBus>> {
        lock(&self.sockets).push(socket.to_path_buf());
        let failing = self
            .not_found
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(Error::Bus(BusError::new(
                BusErrorKind::NotFound,
                format!("{}: No such file or directory", socket.display()),
            )));
        }
        Ok(Arc::clone(&self.bus))
    }
}

// =============================================================================
// Fakes
// =============================================================================

/// Every fake, wired together.
pub struct Fakes {
    pub hypervisor: Arc<FakeHypervisor>,
    pub provisioner: Arc<FakeProvisioner>,
    /// Answers commands run inside the guest.
    pub guest: Arc<ScriptedRunner>,
    /// Answers commands run on the host.
    pub host: Arc<ScriptedRunner>,
    pub bus: Arc<FakeBus>,
    pub connector: Arc<FakeConnector>,
}

impl Fakes {
    /// Fakes for a guest whose `id -u` answers 1000 and whose port probes
    /// find the first port free.
    pub fn new() -> Self {
        let hypervisor = FakeHypervisor::new();
        let guest = ScriptedRunner::new();
        guest.on(&["id", "-u"], ExecOutput::with_stdout("1000\n"));
        guest.on(&["timeout", "1s"], ExecOutput::exited(124));

        let host = ScriptedRunner::new();
        host.on(&["systemctl", "--user", "status"], ExecOutput::exited(4));

        let bus = FakeBus::new();
        let connector = FakeConnector::new(Arc::clone(&bus) as Arc<dyn A11yBus>);
        Self {
            provisioner: FakeProvisioner::new(Arc::clone(&hypervisor), Arc::clone(&guest)),
            hypervisor,
            guest,
            host,
            bus,
            connector,
        }
    }

    /// A backend driving these fakes.
    pub fn backend(&self) -> Backend {
        Backend {
            hypervisor: Arc::clone(&self.hypervisor) as Arc<dyn Hypervisor>,
            provisioner: Arc::clone(&self.provisioner) as Arc<dyn Provisioner>,
            host: Arc::clone(&self.host) as Arc<dyn Runner>,
            bus: Arc::clone(&self.connector) as Arc<dyn BusConnector>,
        }
    }
}

impl Default for Fakes {
    fn default() -> Self {
        Self::new()
    }
}
