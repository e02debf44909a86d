//! Snapshot memoization of provisioning procedures.

use deskvm_error::Result;
use tracing::info;

use crate::machine::VirtualMachine;

/// Name and description of the snapshot that caches a procedure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotSpec {
    pub name: String,
    pub description: String,
}

impl SnapshotSpec {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
        }
    }
}

/// What [`provision_or_restore`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T> {
    /// An existing snapshot was restored; the procedure did not run.
    Restored,
    /// The procedure ran and its result was snapshotted.
    Ran(T),
}

impl<T> Outcome<T> {
    /// Returns true if the snapshot was restored.
    #[must_use]
    pub fn is_restored(&self) -> bool {
        matches!(self, Self::Restored)
    }
}

/// Restores `snapshot` if it exists, otherwise runs `procedure` and takes
/// the snapshot.
///
/// With `force` the procedure always runs and a snapshot that survived it
/// is replaced.
pub fn provision_or_restore<T, F>(
    vm: &mut VirtualMachine,
    snapshot: &SnapshotSpec,
    force: bool,
    procedure: F,
) -> Result<Outcome<T>>
where
    F: FnOnce(&mut VirtualMachine) -> Result<T>,
{
    if !force && vm.has_snapshot(&snapshot.name)? {
        info!(vm = %vm.name(), snapshot = %snapshot.name, "Restoring existing snapshot");
        vm.restore_snapshot(&snapshot.name)?;
        return Ok(Outcome::Restored);
    }

    info!(vm = %vm.name(), snapshot = %snapshot.name, force, "Provisioning");
    let value = procedure(vm)?;

    if vm.has_snapshot(&snapshot.name)? {
        vm.delete_snapshot(&snapshot.name)?;
    }
    vm.create_snapshot(&snapshot.name, &snapshot.description)?;
    Ok(Outcome::Ran(value))
}
