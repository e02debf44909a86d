//! `deskvm tree`: dump a live accessible tree.

use std::io::{self, Write};

use anyhow::{Context, Result};
use clap::Args;
use deskvm_a11y::Accessible;
use deskvm_vm::VmSpec;

use super::Cli;

/// Arguments for `deskvm tree`.
#[derive(Args, Debug)]
pub struct TreeArgs {
    /// VM name
    pub vm: String,

    /// Application name on the accessibility bus, e.g. gnome-shell
    pub application: String,

    /// Read the bus of this guest user instead of the configured one
    #[arg(long)]
    pub user: Option<String>,

    /// Stop descending below this depth
    #[arg(long)]
    pub max_depth: Option<usize>,
}

pub fn execute(cli: &Cli, args: &TreeArgs) -> Result<()> {
    let mut vm = cli.machine(VmSpec::new(&args.vm))?;
    if let Some(user) = &args.user {
        vm.set_a11y_bus_user(user.as_str());
    }
    let root = vm
        .application(&args.application)
        .with_context(|| format!("failed to find '{}' on VM '{}'", args.application, args.vm))?;

    let stdout = io::stdout();
    let mut out = stdout.lock();
    write_tree(&mut out, &root, 0, args.max_depth)?;
    out.flush()?;
    Ok(())
}

/// Writes `node` and its descendants, one line per node, indented two
/// spaces per level.
pub fn write_tree<W: Write>(
    out: &mut W,
    node: &Accessible,
    depth: usize,
    max_depth: Option<usize>,
) -> Result<()> {
    let role = node.role_name()?;
    write!(out, "{:indent$}[{role}]", "", indent = depth * 2)?;
    if let Some(name) = node.name().filter(|n| !n.is_empty()) {
        write!(out, " {name:?}")?;
    }
    if let Some(description) = node.description().filter(|d| !d.is_empty()) {
        write!(out, " ({description})")?;
    }
    writeln!(out)?;

    if max_depth.is_some_and(|max| depth >= max) {
        return Ok(());
    }
    for child in node.children()? {
        write_tree(out, &child, depth + 1, max_depth)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use deskvm_a11y::testing::{FakeBus, FakeNode};

    use super::*;

    fn shell() -> Accessible {
        let bus = FakeBus::new();
        bus.insert(
            FakeNode::new(":1.3", "/root")
                .name("gnome-shell")
                .role("application")
                .child("/panel"),
        );
        bus.insert(
            FakeNode::new(":1.3", "/panel")
                .role("panel")
                .child("/menu"),
        );
        bus.insert(
            FakeNode::new(":1.3", "/menu")
                .name("Login Options")
                .description("Choose a session")
                .role("menu"),
        );
        bus.node("/root")
    }

    fn render(max_depth: Option<usize>) -> String {
        let mut out = Vec::new();
        write_tree(&mut out, &shell(), 0, max_depth).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn test_indented_dump() {
        assert_eq!(
            render(None),
            "[application] \"gnome-shell\"\n  [panel]\n    [menu] \"Login Options\" (Choose a session)\n"
        );
    }

    #[test]
    fn test_max_depth() {
        assert_eq!(render(Some(1)), "[application] \"gnome-shell\"\n  [panel]\n");
    }
}
