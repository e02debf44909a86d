//! VM lifecycle commands.

use anyhow::{Context, Result};
use clap::Args;
use deskvm_vm::provision::{install_firefox, prepare_new_vm, Reboot};
use deskvm_vm::{Outcome, VmSpec};

use super::{Cli, VmArgs};

/// Arguments for `deskvm prepare`.
#[derive(Args, Debug)]
pub struct PrepareArgs {
    /// VM name
    pub name: String,

    /// Disk size passed to the provisioning tool
    #[arg(long, default_value = "5G")]
    pub disk_size: String,

    /// Memory size passed to the provisioning tool
    #[arg(long, default_value = "2G")]
    pub memory: String,

    /// Leave the guest running instead of rebooting after setup
    #[arg(long)]
    pub no_reboot: bool,

    /// Also install Firefox
    #[arg(long)]
    pub firefox: bool,
}

pub fn purge(cli: &Cli, args: &VmArgs) -> Result<()> {
    let mut vm = cli.machine(VmSpec::new(&args.name))?;
    vm.purge()
        .with_context(|| format!("failed to purge VM '{}'", args.name))?;
    println!("Purged {}", args.name);
    Ok(())
}

pub fn prepare(cli: &Cli, args: &PrepareArgs) -> Result<()> {
    let spec = VmSpec::new(&args.name)
        .with_disk_size(&args.disk_size)
        .with_memory(&args.memory);
    let mut vm = cli.machine(spec)?;

    let reboot = if args.no_reboot {
        Reboot::Skip
    } else {
        Reboot::Restart
    };
    let outcome = prepare_new_vm(&mut vm, cli.force_new, reboot)
        .with_context(|| format!("failed to prepare VM '{}'", args.name))?;
    report(&args.name, "new-vm", &outcome);

    if args.firefox {
        let outcome = install_firefox(&mut vm, cli.force_new)
            .with_context(|| format!("failed to install Firefox on '{}'", args.name))?;
        report(&args.name, "firefox-installed", &outcome);
    }
    Ok(())
}

pub fn snapshots(cli: &Cli, args: &VmArgs) -> Result<()> {
    let vm = cli.machine(VmSpec::new(&args.name))?;
    for name in vm.snapshots()? {
        println!("{name}");
    }
    Ok(())
}

fn report<T>(vm: &str, snapshot: &str, outcome: &Outcome<T>) {
    if outcome.is_restored() {
        println!("{vm}: restored snapshot {snapshot}");
    } else {
        println!("{vm}: provisioned and saved snapshot {snapshot}");
    }
}
