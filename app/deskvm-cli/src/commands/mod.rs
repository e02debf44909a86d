//! CLI command implementations.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use deskvm_vm::{Backend, CidAllocator, LifecycleConfig, VirtualMachine, VmSpec};
use tracing::debug;

pub mod tree;
pub mod vm;

/// deskvm - test VMs for GUI acceptance tests
#[derive(Parser)]
#[command(name = "deskvm")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Command to execute
    #[command(subcommand)]
    pub command: Commands,

    /// TOML lifecycle configuration
    #[arg(long, global = true, env = "DESKVM_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log filter, overridden by RUST_LOG
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    /// Rebuild snapshots instead of restoring them
    #[arg(long, global = true)]
    pub force_new: bool,
}

/// Available commands
#[derive(Subcommand)]
pub enum Commands {
    /// Delete a VM from the provisioning tool and the hypervisor
    Purge(VmArgs),

    /// Provision a VM into an Ubuntu Desktop guest, or restore its snapshot
    Prepare(vm::PrepareArgs),

    /// List a VM's snapshots
    Snapshots(VmArgs),

    /// Print an application's accessible tree
    Tree(tree::TreeArgs),
}

/// Names the VM a command acts on.
#[derive(Args, Debug)]
pub struct VmArgs {
    /// VM name
    pub name: String,
}

impl Cli {
    /// Loads `--config`, or the defaults.
    pub fn lifecycle_config(&self) -> Result<LifecycleConfig> {
        match &self.config {
            Some(path) => LifecycleConfig::from_file(path)
                .with_context(|| format!("failed to load config {}", path.display())),
            None => Ok(LifecycleConfig::default()),
        }
    }

    /// Binds a handle to the VM described by `spec` on this host.
    ///
    /// Each command starts a fresh allocator; vsock ids already written into
    /// other domains are skipped when binding.
    pub fn machine(&self, spec: VmSpec) -> Result<VirtualMachine> {
        let config = self.lifecycle_config()?;
        debug!(config = ?self.config, vm = %spec.name, "Binding VM");
        let backend = Backend::system(&config);
        let cids = CidAllocator::new(config.first_cid);
        let name = spec.name.clone();
        VirtualMachine::new(spec, config, backend, &cids)
            .with_context(|| format!("failed to look up VM '{name}'"))
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "deskvm",
            "prepare",
            "behave-tests-main",
            "--force-new",
            "--log-level",
            "debug",
        ])
        .unwrap();
        assert!(cli.force_new);
        assert_eq!(cli.log_level, "debug");
        assert!(matches!(cli.command, Commands::Prepare(_)));
    }

    #[test]
    fn test_tree_args() {
        let cli = Cli::try_parse_from(["deskvm", "tree", "vm", "gnome-shell", "--user", "ubuntu"]).unwrap();
        let Commands::Tree(args) = cli.command else {
            panic!("expected tree");
        };
        assert_eq!(args.vm, "vm");
        assert_eq!(args.application, "gnome-shell");
        assert_eq!(args.user.as_deref(), Some("ubuntu"));
    }
}
