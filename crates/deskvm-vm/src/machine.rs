//! VM handle: lifecycle, snapshots, guest commands and derived resources.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use deskvm_a11y::{application_root, A11yBus, Accessible, BusConnector, DBusConnector};
use deskvm_error::{Error, Result};
use deskvm_exec::{ExecOptions, ExecOutput, HostRunner, Runner};
use deskvm_retry::{retryable, RetryPolicy, SEARCH};
use tracing::{debug, info, warn};

use crate::cid::CidAllocator;
use crate::config::{LifecycleConfig, VmSpec};
use crate::domain::{internal_snapshot_xml, DomainXml, CLOUD_INIT_ISO};
use crate::forward::ForwardingSession;
use crate::hypervisor::{Hypervisor, VirshHypervisor};
use crate::provisioner::{InstanceInfo, MultipassProvisioner, Provisioner, EXIT_UNKNOWN_INSTANCE};

// =============================================================================
// Constants
// =============================================================================

/// Application whose tree holds the login screen and the shell.
pub const GNOME_SHELL: &str = "gnome-shell";

const APPLICATION_INTERVAL: Duration = Duration::from_millis(200);

// =============================================================================
// Backend
// =============================================================================

/// External systems a [`VirtualMachine`] drives.
#[derive(Clone)]
pub struct Backend {
    /// Domain definitions and snapshots.
    pub hypervisor: Arc<dyn Hypervisor>,
    /// Instance creation, power and in-guest commands.
    pub provisioner: Arc<dyn Provisioner>,
    /// Commands on the test host (`systemctl --user`, `systemd-run`).
    pub host: Arc<dyn Runner>,
    /// Opens forwarded accessibility buses.
    pub bus: Arc<dyn BusConnector>,
}

impl Backend {
    /// `virsh`, `multipass`, host processes and D-Bus.
    pub fn system(config: &LifecycleConfig) -> Self {
        let host: Arc<dyn Runner> = Arc::new(HostRunner);
        Self {
            hypervisor: Arc::new(VirshHypervisor::new(
                Arc::clone(&host),
                config.virsh_binary.clone(),
                config.libvirt_uri.clone(),
            )),
            provisioner: Arc::new(MultipassProvisioner::new(
                Arc::clone(&host),
                config.multipass_binary.clone(),
            )),
            host,
            bus: Arc::new(DBusConnector),
        }
    }
}

// =============================================================================
// Power state
// =============================================================================

/// Lifecycle state of a VM as tracked by its handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    /// No hypervisor domain exists.
    Absent,
    /// A domain exists and is not running; the handle has not seen it
    /// stopped by the provisioning tool.
    Defined,
    /// Stopped through this handle.
    Stopped,
    /// Running.
    Running,
}

impl PowerState {
    /// Returns the state name for logging.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Absent => "absent",
            Self::Defined => "defined",
            Self::Stopped => "stopped",
            Self::Running => "running",
        }
    }
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Derived-resource cache
// =============================================================================

/// Resources that are only valid while the VM keeps running.
#[derive(Default)]
struct DerivedCache {
    sessions: HashMap<String, ForwardingSession>,
    applications: HashMap<(String, String), Accessible>,
}

impl DerivedCache {
    fn clear(&mut self) {
        self.sessions.clear();
        self.applications.clear();
    }

    fn is_empty(&self) -> bool {
        self.sessions.is_empty() && self.applications.is_empty()
    }
}

// =============================================================================
// VirtualMachine
// =============================================================================

/// Handle to one test VM.
///
/// A handle is meant to be driven by one test runner at a time; every
/// operation that changes the VM takes `&mut self`.
pub struct VirtualMachine {
    spec: VmSpec,
    config: LifecycleConfig,
    backend: Backend,
    vsock_cid: u32,
    power: PowerState,
    a11y_bus_user: String,
    cache: DerivedCache,
}

impl VirtualMachine {
    /// Creates a handle, looking up whether the hypervisor already has a
    /// domain for `spec.name`.
    ///
    /// An existing domain keeps its vsock id when no other domain or handle
    /// holds it. Otherwise a fresh id is allocated and written into the
    /// stopped domain; a running domain's id is adopted as is.
    pub fn new(
        spec: VmSpec,
        config: LifecycleConfig,
        backend: Backend,
        cids: &CidAllocator,
    ) -> Result<Self> {
        let power = match backend.hypervisor.domain_state(&spec.name)? {
            None => PowerState::Absent,
            Some(state) if state.is_active() => PowerState::Running,
            Some(_) => PowerState::Defined,
        };
        let domain_cid = match power {
            PowerState::Absent => None,
            _ => domain_vsock_cid(backend.hypervisor.as_ref(), &spec.name)?,
        };
        let in_use = cids_in_use(backend.hypervisor.as_ref(), &spec.name)?;

        let vsock_cid = match domain_cid {
            Some(cid) if power == PowerState::Running => {
                let reserved = cids.reserve(cid);
                if in_use.contains(&cid) || !reserved {
                    warn!(vm = %spec.name, vsock_cid = cid, "Running VM shares its vsock id");
                }
                cid
            }
            Some(cid) if !in_use.contains(&cid) && cids.reserve(cid) => cid,
            _ => cids.allocate_excluding(&in_use),
        };
        info!(vm = %spec.name, vsock_cid, state = %power, "VM handle created");

        let mut vm = Self {
            a11y_bus_user: config.a11y_bus_user.clone(),
            spec,
            config,
            backend,
            vsock_cid,
            power,
            cache: DerivedCache::default(),
        };
        if power != PowerState::Absent {
            vm.reconcile_vsock_cid()?;
        }
        Ok(vm)
    }

    /// Instance and domain name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    #[must_use]
    pub fn spec(&self) -> &VmSpec {
        &self.spec
    }

    #[must_use]
    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    #[must_use]
    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    /// Vsock context id reserved for this VM.
    #[must_use]
    pub fn vsock_cid(&self) -> u32 {
        self.vsock_cid
    }

    /// Lifecycle state as last observed by this handle.
    #[must_use]
    pub fn power_state(&self) -> PowerState {
        self.power
    }

    /// Host directory holding this VM's forwarded sockets.
    #[must_use]
    pub fn runtime_dir(&self) -> PathBuf {
        self.config.runtime_dir.join(&self.spec.name)
    }

    /// Returns true if the hypervisor reports the domain as active.
    pub fn is_running(&self) -> Result<bool> {
        Ok(self
            .backend
            .hypervisor
            .domain_state(&self.spec.name)?
            .is_some_and(|state| state.is_active()))
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Creates and boots the instance.
    pub fn launch(&mut self) -> Result<()> {
        if !matches!(self.power, PowerState::Absent | PowerState::Defined) {
            return Err(Error::invalid_state(format!(
                "VM '{}' is already launched ({})",
                self.spec.name, self.power
            )));
        }
        debug!(vm = %self.spec.name, "Launching VM");
        self.backend.provisioner.launch(&self.spec)?;

        if self.backend.hypervisor.domain_state(&self.spec.name)?.is_none() {
            return Err(Error::not_found(format!(
                "hypervisor domain '{}' after launch",
                self.spec.name
            )));
        }
        self.set_power(PowerState::Running);
        Ok(())
    }

    /// Boots the VM and waits until it is usable.
    pub fn start(&mut self) -> Result<()> {
        self.require_defined("start")?;
        debug!(vm = %self.spec.name, "Starting VM");
        self.backend.provisioner.start(&self.spec.name)?;
        self.wait_until_running()?;
        self.set_power(PowerState::Running);
        Ok(())
    }

    /// Shuts the VM down, waits until it is stopped and drops every derived
    /// resource.
    pub fn stop(&mut self) -> Result<()> {
        self.require_defined("stop")?;
        debug!(vm = %self.spec.name, "Stopping VM");
        self.backend.provisioner.stop(&self.spec.name)?;
        self.wait_until_stopped()?;
        self.clear_cache();
        self.set_power(PowerState::Stopped);
        Ok(())
    }

    /// [`stop`](Self::stop) followed by [`start`](Self::start).
    pub fn restart(&mut self) -> Result<()> {
        self.stop()?;
        self.start()
    }

    /// Rewrites the domain definition with the devices GUI tests need.
    ///
    /// The VM must not be running.
    pub fn define_devices(&mut self) -> Result<()> {
        if !matches!(self.power, PowerState::Stopped | PowerState::Defined) {
            return Err(Error::invalid_state(format!(
                "VM '{}' must be stopped to define devices ({})",
                self.spec.name, self.power
            )));
        }
        let hypervisor = &self.backend.hypervisor;
        let mut domain = DomainXml::parse(&hypervisor.domain_xml(&self.spec.name)?)?;
        domain.configure_devices(self.vsock_cid)?;
        hypervisor.define(&domain.to_xml()?)?;
        info!(vm = %self.spec.name, vsock_cid = self.vsock_cid, "Devices defined");
        Ok(())
    }

    /// Removes every trace of the VM from the provisioning tool and the
    /// hypervisor.
    ///
    /// A failing purge is tolerated only if the provisioning tool never knew
    /// the VM.
    pub fn purge(&mut self) -> Result<()> {
        let name = self.spec.name.as_str();
        let known = self.backend.provisioner.exists(name)?;
        if let Err(e) = self.backend.provisioner.delete_purge(name) {
            if known {
                return Err(e);
            }
            debug!(vm = %name, error = %e, "Ignoring purge failure of unknown instance");
        }

        // Purging the instance leaves the domain behind.
        if self.backend.hypervisor.domain_state(name)?.is_some() {
            self.backend.hypervisor.undefine(name)?;
        }

        self.clear_cache();
        self.set_power(PowerState::Absent);
        Ok(())
    }

    /// Polls until the provisioning tool reports the VM running or a command
    /// succeeds inside it.
    pub fn wait_until_running(&self) -> Result<()> {
        debug!(vm = %self.spec.name, "Waiting for VM to start");
        RetryPolicy::new(self.config.wait_running_timeout(), self.config.poll_interval())
            .with_message(format!("VM '{}' did not start", self.spec.name))
            .run(|| {
                if self.instance_info()?.is_running() {
                    return Ok(());
                }
                if self.run(&["true"], &ExecOptions::quiet())?.success() {
                    return Ok(());
                }
                Err(Error::retriable("The VM is not running yet"))
            })
    }

    /// Polls until the provisioning tool reports the VM stopped.
    pub fn wait_until_stopped(&self) -> Result<()> {
        debug!(vm = %self.spec.name, "Waiting for VM to stop");
        RetryPolicy::new(self.config.wait_stopped_timeout(), self.config.poll_interval())
            .with_message(format!("VM '{}' did not stop", self.spec.name))
            .run(|| {
                if self.instance_info()?.is_stopped() {
                    Ok(())
                } else {
                    Err(Error::retriable("The VM is not stopped yet"))
                }
            })
    }

    /// Instance info, with an unknown instance reported as retriable.
    fn instance_info(&self) -> Result<InstanceInfo> {
        match self.backend.provisioner.info(&self.spec.name) {
            Err(e) if e.exit_code() == Some(EXIT_UNKNOWN_INSTANCE) => {
                Err(Error::retriable("The VM does not exist yet"))
            }
            other => other,
        }
    }

    // -------------------------------------------------------------------------
    // Snapshots
    // -------------------------------------------------------------------------

    /// Returns true if a snapshot named `snapshot` exists.
    pub fn has_snapshot(&self, snapshot: &str) -> Result<bool> {
        Ok(self.snapshots()?.iter().any(|name| name == snapshot))
    }

    /// Names of all snapshots. Empty if the VM is absent.
    pub fn snapshots(&self) -> Result<Vec<String>> {
        if self.power == PowerState::Absent {
            return Ok(Vec::new());
        }
        self.backend.hypervisor.snapshot_names(&self.spec.name)
    }

    /// Reverts to `snapshot` and drops every derived resource.
    ///
    /// If the VM comes back running, its clock is resynchronized.
    pub fn restore_snapshot(&mut self, snapshot: &str) -> Result<()> {
        self.require_defined("restore a snapshot")?;
        debug!(vm = %self.spec.name, snapshot, "Restoring snapshot");
        self.backend
            .hypervisor
            .revert_snapshot(&self.spec.name, snapshot)?;
        self.clear_cache();
        self.reconcile_vsock_cid()?;

        if !self.is_running()? {
            self.set_power(PowerState::Stopped);
            return Ok(());
        }
        self.set_power(PowerState::Running);

        let output = self.run(
            &["sudo", "systemctl", "restart", "systemd-timesyncd"],
            &ExecOptions::default(),
        )?;
        if !output.success() {
            warn!(vm = %self.spec.name, code = ?output.code, "Failed to resync the guest clock");
        }
        Ok(())
    }

    /// Takes an internal snapshot of every disk.
    ///
    /// The provisioning tool's seed image is detached first; internal
    /// snapshots are impossible while a read-only image is attached.
    pub fn create_snapshot(&mut self, snapshot: &str, description: &str) -> Result<()> {
        self.require_defined("create a snapshot")?;
        if self.has_snapshot(snapshot)? {
            return Err(Error::invalid_state(format!(
                "snapshot '{snapshot}' of VM '{}' already exists",
                self.spec.name
            )));
        }

        self.detach_cloud_init_disk()?;

        let hypervisor = &self.backend.hypervisor;
        let domain = DomainXml::parse(&hypervisor.domain_xml(&self.spec.name)?)?;
        let xml = internal_snapshot_xml(snapshot, description, &domain.disk_targets())?;
        hypervisor.create_snapshot(&self.spec.name, &xml)?;
        info!(vm = %self.spec.name, snapshot, "Snapshot created");
        Ok(())
    }

    /// Deletes `snapshot`.
    pub fn delete_snapshot(&mut self, snapshot: &str) -> Result<()> {
        self.require_defined("delete a snapshot")?;
        self.backend
            .hypervisor
            .delete_snapshot(&self.spec.name, snapshot)?;
        info!(vm = %self.spec.name, snapshot, "Snapshot deleted");
        Ok(())
    }

    fn detach_cloud_init_disk(&self) -> Result<()> {
        let hypervisor = &self.backend.hypervisor;
        let domain = DomainXml::parse(&hypervisor.domain_xml(&self.spec.name)?)?;
        if let Some(disk) = domain.disk_with_source_file(CLOUD_INIT_ISO)? {
            debug!(vm = %self.spec.name, "Detaching cloud-init disk");
            hypervisor.detach_device(&self.spec.name, &disk)?;
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Guest commands
    // -------------------------------------------------------------------------

    /// Runs `command` in the guest without checking its exit status.
    pub fn run(&self, command: &[&str], opts: &ExecOptions) -> Result<ExecOutput> {
        self.backend
            .provisioner
            .exec(&self.spec.name, command, opts)
    }

    /// Runs `command` in the guest and fails unless it exits with code 0.
    pub fn check_call(&self, command: &[&str]) -> Result<()> {
        self.check_call_with(command, &ExecOptions::default())
    }

    /// [`check_call`](Self::check_call) with explicit options.
    pub fn check_call_with(&self, command: &[&str], opts: &ExecOptions) -> Result<()> {
        self.run(command, opts)?.check(command).map(|_| ())
    }

    /// Runs `command` in the guest and returns its standard output.
    pub fn check_output(&self, command: &[&str]) -> Result<String> {
        Ok(self
            .run(command, &ExecOptions::default())?
            .check(command)?
            .stdout)
    }

    /// Puts `text` on the guest's Wayland clipboard.
    pub fn set_clipboard(&self, text: &str) -> Result<()> {
        self.check_call(&["wl-copy", text])
    }

    /// Presses `keys` together on the guest keyboard, e.g.
    /// `press(&["lctrl", "v"])`.
    ///
    /// Keys are Linux input event names with or without the `KEY_` prefix,
    /// in any case, plus the short modifier names `lctrl`, `rctrl`,
    /// `lshift`, `rshift`, `lalt`, `ralt`, `lmeta` and `rmeta`.
    pub fn press(&self, keys: &[&str]) -> Result<()> {
        if keys.is_empty() {
            return Err(Error::config("no keys to press"));
        }
        let names: Vec<String> = keys.iter().map(|key| key_name(key)).collect();
        let names: Vec<&str> = names.iter().map(String::as_str).collect();
        debug!(vm = %self.spec.name, keys = ?names, "Pressing keys");
        self.backend.hypervisor.send_keys(&self.spec.name, &names)
    }

    /// Types `text` by pasting it from the clipboard.
    pub fn paste(&self, text: &str) -> Result<()> {
        self.set_clipboard(text)?;
        self.press(&["lctrl", "v"])
    }

    /// First IPv4 address of the guest.
    pub fn ip_address(&self) -> Result<String> {
        self.backend
            .provisioner
            .info(&self.spec.name)?
            .ipv4
            .into_iter()
            .next()
            .ok_or_else(|| Error::not_found(format!("IPv4 address of VM '{}'", self.spec.name)))
    }

    /// Copies a host file into the guest.
    pub fn copy_into(&self, source: &Path, destination: &str) -> Result<()> {
        self.backend
            .provisioner
            .copy_into(&self.spec.name, source, destination)
    }

    /// Saves a screenshot of the guest display to `path`.
    pub fn screenshot(&self, path: &Path) -> Result<()> {
        self.backend.hypervisor.screenshot(&self.spec.name, path)
    }

    // -------------------------------------------------------------------------
    // Accessibility
    // -------------------------------------------------------------------------

    /// Guest user whose accessibility bus is used.
    #[must_use]
    pub fn a11y_bus_user(&self) -> &str {
        &self.a11y_bus_user
    }

    /// Switches to the accessibility bus of `user`, e.g. after logging in.
    pub fn set_a11y_bus_user(&mut self, user: impl Into<String>) {
        self.a11y_bus_user = user.into();
        info!(vm = %self.spec.name, user = %self.a11y_bus_user, "Accessibility bus user changed");
    }

    /// Accessibility bus of the current user, forwarded on first use.
    pub fn a11y_bus(&mut self) -> Result<Arc<dyn A11yBus>> {
        if let Some(session) = self.cache.sessions.get(&self.a11y_bus_user) {
            return Ok(session.bus());
        }
        let session = ForwardingSession::establish(self, &self.a11y_bus_user)?;
        let bus = session.bus();
        self.cache
            .sessions
            .insert(self.a11y_bus_user.clone(), session);
        Ok(bus)
    }

    /// Forwarding session of the current user, if one is established.
    #[must_use]
    pub fn forwarding_session(&self) -> Option<&ForwardingSession> {
        self.cache.sessions.get(&self.a11y_bus_user)
    }

    /// Root accessible of the application named `name` on the current
    /// user's bus.
    pub fn application(&mut self, name: &str) -> Result<Accessible> {
        let key = (self.a11y_bus_user.clone(), name.to_string());
        if let Some(root) = self.cache.applications.get(&key) {
            return Ok(root.clone());
        }

        let bus = self.a11y_bus()?;
        let root = retryable(self.config.application_timeout(), APPLICATION_INTERVAL, SEARCH)
            .with_message(format!("Application '{name}' did not appear on the bus"))
            .run(|| application_root(&bus, name))?;
        self.cache.applications.insert(key, root.clone());
        Ok(root)
    }

    /// Root accessible of the GNOME shell.
    pub fn gnome_shell(&mut self) -> Result<Accessible> {
        self.application(GNOME_SHELL)
    }

    /// Returns true if no derived resource is cached.
    #[must_use]
    pub fn cache_is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    // -------------------------------------------------------------------------
    // Helpers
    // -------------------------------------------------------------------------

    /// Makes the handle and the domain agree on the vsock id.
    ///
    /// A stopped domain is redefined with the handle's id. A running one
    /// cannot change, so the handle follows it.
    fn reconcile_vsock_cid(&mut self) -> Result<()> {
        let hypervisor = Arc::clone(&self.backend.hypervisor);
        let mut domain = DomainXml::parse(&hypervisor.domain_xml(&self.spec.name)?)?;
        let Some(cid) = domain.vsock_cid() else {
            return Ok(());
        };
        if cid == self.vsock_cid {
            return Ok(());
        }

        if self.is_running()? {
            info!(vm = %self.spec.name, from = self.vsock_cid, to = cid, "Adopting vsock id of running VM");
            self.vsock_cid = cid;
        } else {
            domain.configure_devices(self.vsock_cid)?;
            hypervisor.define(&domain.to_xml()?)?;
            info!(vm = %self.spec.name, from = cid, to = self.vsock_cid, "Vsock id rewritten");
        }
        Ok(())
    }

    fn require_defined(&self, operation: &str) -> Result<()> {
        if self.power == PowerState::Absent {
            return Err(Error::invalid_state(format!(
                "cannot {operation} VM '{}': it does not exist",
                self.spec.name
            )));
        }
        Ok(())
    }

    fn set_power(&mut self, power: PowerState) {
        if self.power != power {
            info!(vm = %self.spec.name, from = %self.power, to = %power, "VM state changed");
            self.power = power;
        }
    }

    fn clear_cache(&mut self) {
        if !self.cache.is_empty() {
            debug!(vm = %self.spec.name, "Dropping cached bus connections");
        }
        self.cache.clear();
    }
}

/// Vsock id written into the definition of `domain`, if any.
fn domain_vsock_cid(hypervisor: &dyn Hypervisor, domain: &str) -> Result<Option<u32>> {
    Ok(DomainXml::parse(&hypervisor.domain_xml(domain)?)?.vsock_cid())
}

/// Vsock ids carried by every domain except `own`.
fn cids_in_use(hypervisor: &dyn Hypervisor, own: &str) -> Result<BTreeSet<u32>> {
    let mut in_use = BTreeSet::new();
    for name in hypervisor.domain_names()? {
        if name == own {
            continue;
        }
        if let Some(cid) = domain_vsock_cid(hypervisor, &name)? {
            in_use.insert(cid);
        }
    }
    Ok(in_use)
}

/// Linux input event name for `key`.
fn key_name(key: &str) -> String {
    let upper = key.trim().to_ascii_uppercase();
    if upper.starts_with("KEY_") {
        return upper;
    }
    let name = match upper.as_str() {
        "LCTRL" => "LEFTCTRL",
        "RCTRL" => "RIGHTCTRL",
        "LSHIFT" => "LEFTSHIFT",
        "RSHIFT" => "RIGHTSHIFT",
        "LALT" => "LEFTALT",
        "RALT" => "RIGHTALT",
        "LMETA" => "LEFTMETA",
        "RMETA" => "RIGHTMETA",
        other => other,
    };
    format!("KEY_{name}")
}

impl fmt::Debug for VirtualMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualMachine")
            .field("spec", &self.spec)
            .field("vsock_cid", &self.vsock_cid)
            .field("power", &self.power)
            .field("a11y_bus_user", &self.a11y_bus_user)
            .finish_non_exhaustive()
    }
}
