//! Accessibility-bus forwarding over vsock.
//!
//! The guest's accessibility bus listens on a Unix socket that only exists
//! inside the VM. A session bridges it to a host socket with two `socat`
//! relays running as transient systemd units:
//!
//! ```text
//! host: UNIX-LISTEN:<runtime>/<vm>/a11y-bus-<uid>  ->  VSOCK-CONNECT:<cid>:<port>
//! guest: VSOCK-LISTEN:<port>                       ->  UNIX-CONNECT:/run/user/<uid>/at-spi/bus
//! ```

use std::fmt;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use deskvm_a11y::A11yBus;
use deskvm_error::{BusErrorKind, Error, Result};
use deskvm_exec::{ExecOptions, Runner, RunnerExt};
use deskvm_retry::{retry, retry_with_message};
use tracing::{debug, info};

use crate::machine::VirtualMachine;

// =============================================================================
// Constants
// =============================================================================

const BUS_SOCKET_TIMEOUT: Duration = Duration::from_secs(30);
const UNIT_RESET_TIMEOUT: Duration = Duration::from_secs(5);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Exit code of `timeout(1)` when the command ran out of time.
const EXIT_TIMED_OUT: i32 = 124;

/// `systemctl status` exit code for an active unit that is not running.
const EXIT_UNIT_INACTIVE: i32 = 3;

/// `systemctl status` exit code for a unit that does not exist.
const EXIT_UNIT_UNKNOWN: i32 = 4;

// =============================================================================
// Free port discovery
// =============================================================================

/// Outcome of probing one vsock port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortProbe {
    /// Nothing holds the port.
    Free,
    /// Another listener holds the port.
    InUse,
}

/// Returns the first port of `range` that `probe` reports free.
///
/// Ports are probed in ascending order and never outside `range`.
pub fn find_free_port<F>(range: RangeInclusive<u32>, mut probe: F) -> Result<u32>
where
    F: FnMut(u32) -> Result<PortProbe>,
{
    let (min, max) = (*range.start(), *range.end());
    for port in range {
        if probe(port)? == PortProbe::Free {
            debug!(port, "Found free vsock port");
            return Ok(port);
        }
    }
    Err(Error::NoFreePort { min, max })
}

/// Probes `port` inside the guest.
///
/// A listener that waits out the timeout has bound the port; one that
/// exits early could not bind it.
fn probe_guest_port(vm: &VirtualMachine, port: u32) -> Result<PortProbe> {
    let address = format!("VSOCK-LISTEN:{port}");
    let output = vm.run(
        &["timeout", "1s", "sudo", "socat", address.as_str(), "echo"],
        &ExecOptions::quiet(),
    )?;
    Ok(if output.code == Some(EXIT_TIMED_OUT) {
        PortProbe::Free
    } else {
        PortProbe::InUse
    })
}

// =============================================================================
// ForwardingSession
// =============================================================================

/// An established bridge from a guest user's accessibility bus to the host.
pub struct ForwardingSession {
    user: String,
    uid: String,
    vsock_port: u32,
    host_socket: PathBuf,
    host_unit: String,
    guest_unit: String,
    bus: Arc<dyn A11yBus>,
}

impl ForwardingSession {
    /// Forwards the accessibility bus of `user` in `vm` and connects to it.
    pub fn establish(vm: &VirtualMachine, user: &str) -> Result<Self> {
        info!(vm = %vm.name(), user, "Forwarding accessibility bus");

        let uid = vm.check_output(&["id", "-u", user])?.trim().to_string();
        let guest_socket = format!("/run/user/{uid}/at-spi/bus");
        let host_socket = vm.runtime_dir().join(format!("a11y-bus-{uid}"));
        let host_unit = format!("a11y-bus-proxy-{}-{uid}", vm.name());
        let guest_unit = format!("a11y-bus-proxy-{uid}");

        // The session manager creates the socket lazily.
        retry_with_message(
            || {
                debug!(socket = %guest_socket, "Checking if the a11y bus is available");
                let output = vm.run(&["sudo", "ls", guest_socket.as_str()], &ExecOptions::quiet())?;
                if output.success() {
                    Ok(())
                } else {
                    Err(Error::retriable("The bus is not available yet"))
                }
            },
            BUS_SOCKET_TIMEOUT,
            POLL_INTERVAL,
            format!("The a11y bus of user '{user}' did not appear"),
        )?;

        let config = vm.config();
        let vsock_port = find_free_port(config.vsock_port_min..=config.vsock_port_max, |port| {
            probe_guest_port(vm, port)
        })?;

        start_guest_unit(vm, &guest_unit, vsock_port, &guest_socket)?;

        prepare_host_socket(&host_socket)?;
        reset_host_unit(vm, &host_unit)?;

        let listen = format!("UNIX-LISTEN:{},fork", path_str(&host_socket)?);
        let connect = format!("VSOCK-CONNECT:{}:{vsock_port}", vm.vsock_cid());
        vm.backend().host.check_call(
            &[
                "systemd-run",
                "--user",
                "--unit",
                host_unit.as_str(),
                "--",
                "socat",
                listen.as_str(),
                connect.as_str(),
            ],
            &ExecOptions::default(),
        )?;

        info!(socket = %host_socket.display(), "Connecting to bus");
        let connector = &vm.backend().bus;
        let bus = retry_with_message(
            || match connector.connect(&host_socket) {
                Err(e) if e.bus_kind() == Some(BusErrorKind::NotFound) => {
                    Err(Error::retriable(format!("The bus is not available yet: {e}")))
                }
                other => other,
            },
            CONNECT_TIMEOUT,
            POLL_INTERVAL,
            "Failed to connect to the a11y bus",
        )?;

        info!(vm = %vm.name(), user, vsock_port, unit = %host_unit, "Accessibility bus forwarded");
        Ok(Self {
            user: user.to_string(),
            uid,
            vsock_port,
            host_socket,
            host_unit,
            guest_unit,
            bus,
        })
    }

    /// Client of the forwarded bus.
    #[must_use]
    pub fn bus(&self) -> Arc<dyn A11yBus> {
        Arc::clone(&self.bus)
    }

    #[must_use]
    pub fn user(&self) -> &str {
        &self.user
    }

    /// Numeric id of the user inside the guest.
    #[must_use]
    pub fn uid(&self) -> &str {
        &self.uid
    }

    #[must_use]
    pub fn vsock_port(&self) -> u32 {
        self.vsock_port
    }

    #[must_use]
    pub fn host_socket(&self) -> &Path {
        &self.host_socket
    }

    #[must_use]
    pub fn host_unit(&self) -> &str {
        &self.host_unit
    }

    #[must_use]
    pub fn guest_unit(&self) -> &str {
        &self.guest_unit
    }
}

impl fmt::Debug for ForwardingSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForwardingSession")
            .field("user", &self.user)
            .field("uid", &self.uid)
            .field("vsock_port", &self.vsock_port)
            .field("host_socket", &self.host_socket)
            .field("host_unit", &self.host_unit)
            .field("guest_unit", &self.guest_unit)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Units
// =============================================================================

/// Starts the guest relay, replacing a leftover unit of the same name.
fn start_guest_unit(vm: &VirtualMachine, unit: &str, port: u32, socket: &str) -> Result<()> {
    // A snapshot restored while running may still carry the previous unit.
    vm.run(&["sudo", "systemctl", "stop", unit], &ExecOptions::quiet())?;
    vm.run(&["sudo", "systemctl", "reset-failed", unit], &ExecOptions::quiet())?;

    let listen = format!("VSOCK-LISTEN:{port},reuseaddr,fork");
    let connect = format!("UNIX-CONNECT:{socket}");
    vm.check_call(&[
        "sudo",
        "systemd-run",
        "--unit",
        unit,
        "--",
        "socat",
        listen.as_str(),
        connect.as_str(),
    ])?;
    debug!(unit, port, "Guest relay started");
    Ok(())
}

/// Stops and forgets the host unit `unit`, waiting until systemd reports it
/// unknown.
///
/// Units left over from an earlier process are expected; one that is still
/// shutting down is waited out.
pub fn reset_host_unit(vm: &VirtualMachine, unit: &str) -> Result<()> {
    let host = &vm.backend().host;
    retry(
        || {
            debug!(unit, "Trying to reset the unit");
            host.run(
                &["systemctl", "--user", "stop", "--force", unit],
                &ExecOptions::quiet(),
            )?;
            host.run(
                &["systemctl", "--user", "reset-failed", "--force", unit],
                &ExecOptions::quiet(),
            )?;

            let status = host.run(&["systemctl", "--user", "status", unit], &ExecOptions::quiet())?;
            match status.code {
                Some(EXIT_UNIT_UNKNOWN) => Ok(()),
                Some(0) => Err(Error::retriable("The unit is still running")),
                Some(EXIT_UNIT_INACTIVE) => Err(Error::retriable("The unit is still known")),
                _ => status
                    .check(&["systemctl", "--user", "status", unit])
                    .map(|_| ()),
            }
        },
        UNIT_RESET_TIMEOUT,
        POLL_INTERVAL,
    )
}

/// Creates the socket's directory and removes a stale socket.
fn prepare_host_socket(socket: &Path) -> Result<()> {
    if let Some(dir) = socket.parent() {
        std::fs::create_dir_all(dir)?;
    }
    match std::fs::remove_file(socket) {
        Ok(()) => debug!(socket = %socket.display(), "Removed stale socket"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

fn path_str(path: &Path) -> Result<&str> {
    path.to_str()
        .ok_or_else(|| Error::config(format!("path is not valid UTF-8: {}", path.display())))
}
