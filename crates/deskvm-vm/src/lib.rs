//! # deskvm-vm
//!
//! Test VMs for GUI acceptance tests.
//!
//! A [`VirtualMachine`] is created through a provisioning tool (`multipass`)
//! and then managed at the hypervisor level (libvirt via `virsh`) for device
//! configuration and snapshots. Once running, its accessibility bus is
//! forwarded to the host over vsock on first use.
//!
//! ```text
//! Absent --launch--> Running <--start/stop--> Stopped
//!    ^                                           |
//!    +----------------- purge -------------------+
//! ```
//!
//! ## Modules
//!
//! - [`config`]: [`LifecycleConfig`] and [`VmSpec`].
//! - [`hypervisor`] / [`provisioner`]: the two external tools behind traits.
//! - [`domain`]: domain XML rewriting.
//! - [`forward`]: the accessibility-bus [`ForwardingSession`].
//! - [`snapshot`]: [`provision_or_restore`] memoization.
//! - [`provision`]: the desktop guest setup routines and the GDM login flow.
//! - `testing` (feature `testing`): in-memory fakes for every external
//!   system.

mod cid;
pub mod config;
pub mod domain;
pub mod forward;
pub mod hypervisor;
mod machine;
pub mod provision;
pub mod provisioner;
pub mod snapshot;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use cid::CidAllocator;
pub use config::{LifecycleConfig, VmSpec, FIRST_GUEST_CID};
pub use forward::{find_free_port, ForwardingSession, PortProbe};
pub use hypervisor::{DomainState, Hypervisor, VirshHypervisor};
pub use machine::{Backend, PowerState, VirtualMachine, GNOME_SHELL};
pub use provision::{install_firefox, log_in, prepare_new_vm, Credentials, Reboot};
pub use provisioner::{InstanceInfo, MultipassProvisioner, Provisioner};
pub use snapshot::{provision_or_restore, Outcome, SnapshotSpec};

pub use deskvm_error::{Error, Result};
