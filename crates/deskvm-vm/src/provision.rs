//! Snapshot-memoized provisioning routines and the GDM login flow.
//!
//! Each routine is wrapped in [`provision_or_restore`], so the slow apt work
//! runs once per snapshot and later runs restore it in seconds.

use std::time::Duration;

use deskvm_a11y::{Query, Retry};
use deskvm_error::Result;
use deskvm_exec::ExecOptions;
use tracing::info;

use crate::machine::VirtualMachine;
use crate::snapshot::{provision_or_restore, Outcome, SnapshotSpec};

/// PPA that carries the desktop session packages under test.
pub const DESKTOP_PPA: &str = "ppa:ubuntu-enterprise-desktop/authd";

/// at-spi bus policy shipped by the guest.
pub const A11Y_BUS_CONFIG: &str = "/usr/share/defaults/at-spi2/accessibility.conf";

/// Time the desktop gets to appear after the password is accepted.
pub const DESKTOP_TIMEOUT: Duration = Duration::from_secs(30);

const DESKTOP_INTERVAL: Duration = Duration::from_secs(1);

/// Snapshot taken after [`prepare_new_vm`].
pub fn new_vm_snapshot() -> SnapshotSpec {
    SnapshotSpec::new("new-vm", "The VM is newly created")
}

/// Snapshot taken after [`install_firefox`].
pub fn firefox_snapshot() -> SnapshotSpec {
    SnapshotSpec::new("firefox-installed", "Firefox installed")
}

/// A guest account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

impl Credentials {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
        }
    }

    /// The cloud image's default user.
    pub fn default_user() -> Self {
        Self::new("ubuntu", "ubuntu")
    }

    fn chpasswd_line(&self) -> String {
        format!("{}:{}", self.user, self.password)
    }
}

/// Whether [`prepare_new_vm`] reboots the guest at the end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reboot {
    /// Restart so GDM comes up with the new configuration.
    Restart,
    /// Leave the guest running; the caller reboots after further setup.
    Skip,
}

// ============================================================================
// Routines
// ============================================================================

/// Turns a fresh cloud image into an Ubuntu Desktop guest with a forwardable
/// accessibility bus.
pub fn prepare_new_vm(vm: &mut VirtualMachine, force: bool, reboot: Reboot) -> Result<Outcome<()>> {
    provision_or_restore(vm, &new_vm_snapshot(), force, |vm| {
        vm.purge()?;
        vm.launch()?;

        // Devices can only be redefined while the domain is shut off.
        vm.stop()?;
        vm.define_devices()?;
        vm.start()?;

        set_password(vm, &Credentials::new("root", "root"))?;
        set_password(vm, &Credentials::default_user())?;

        // It holds the apt lock at random times.
        vm.check_call(&["sudo", "apt", "remove", "-y", "unattended-upgrades"])?;

        vm.check_call(&["sudo", "add-apt-repository", "-y", DESKTOP_PPA])?;
        vm.check_call(&["sudo", "apt", "update"])?;
        vm.check_call(&["sudo", "apt", "install", "-y", "ubuntu-session"])?;
        vm.check_call(&["sudo", "apt", "install", "-y", "socat"])?;

        enable_anonymous_a11y_auth(vm)?;
        vm.check_call(&[
            "sudo",
            "sh",
            "-c",
            "echo GNOME_ACCESSIBILITY=1 > /etc/environment.d/90-gnome-a11y.conf",
        ])?;

        if reboot == Reboot::Restart {
            vm.restart()?;
        }
        Ok(())
    })
}

/// Installs Firefox on top of the current guest state.
pub fn install_firefox(vm: &mut VirtualMachine, force: bool) -> Result<Outcome<()>> {
    provision_or_restore(vm, &firefox_snapshot(), force, |vm| {
        vm.check_call(&["sudo", "apt", "update"])?;
        vm.check_call(&["sudo", "apt", "install", "-y", "firefox"])
    })
}

/// Sets the password of a guest account.
pub fn set_password(vm: &VirtualMachine, credentials: &Credentials) -> Result<()> {
    info!(vm = %vm.name(), user = %credentials.user, "Setting password");
    vm.check_call_with(
        &["sudo", "chpasswd"],
        &ExecOptions::with_stdin(credentials.chpasswd_line()),
    )
}

/// Lets the host connect to the forwarded bus without credentials.
fn enable_anonymous_a11y_auth(vm: &VirtualMachine) -> Result<()> {
    let old = "<auth>EXTERNAL</auth>";
    let new = "<auth>EXTERNAL</auth>\\n  <auth>ANONYMOUS</auth>\\n  <allow_anonymous/>\\n  ";
    let expression = format!("s|{old}|{new}|");
    vm.check_call(&["sudo", "sed", "-i", expression.as_str(), A11Y_BUS_CONFIG])
}

// ============================================================================
// Login
// ============================================================================

/// Logs in through the GDM greeter and switches to the user's bus.
///
/// Waits for the greeter, fills in the username entry (the only editable
/// `text` widget) and the password entry, then waits for the shell's
/// `Activities` button on the new session's bus.
pub fn log_in(vm: &mut VirtualMachine, credentials: &Credentials) -> Result<()> {
    info!(vm = %vm.name(), user = %credentials.user, "Logging in");

    let greeter = vm.gnome_shell()?;
    greeter.find_child(&Query::new().name("Login Options").role("menu"), Retry::DEFAULT)?;

    let user_entry =
        greeter.find_child(&Query::new().role("text").editable(true), Retry::DEFAULT)?;
    user_entry.set_text(&credentials.user)?;
    user_entry.activate()?;

    let password_entry =
        greeter.find_child(&Query::new().role("password text").editable(true), Retry::DEFAULT)?;
    password_entry.set_text(&credentials.password)?;
    password_entry.activate()?;

    vm.set_a11y_bus_user(credentials.user.as_str());

    let shell = vm.gnome_shell()?;
    shell.find_child(
        &Query::new().name("Activities"),
        Retry::Within {
            timeout: DESKTOP_TIMEOUT,
            interval: DESKTOP_INTERVAL,
        },
    )?;
    info!(vm = %vm.name(), user = %credentials.user, "Desktop is ready");
    Ok(())
}
