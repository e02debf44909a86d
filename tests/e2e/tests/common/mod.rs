#![allow(dead_code)]

use deskvm_a11y::testing::FakeNode;
use deskvm_a11y::{interface, State, ROOT_PATH};
use deskvm_e2e::{TestConfig, TestHarness};
use deskvm_vm::testing::Fakes;
use deskvm_vm::{LifecycleConfig, VirtualMachine, VmSpec};
use tempfile::TempDir;

pub const VM_NAME: &str = "behave-tests-main";

/// A harness over fakes, with one VM bound and a scratch runtime directory.
pub struct FakeEnv {
    pub fakes: Fakes,
    pub harness: TestHarness,
    pub vm: VirtualMachine,
    pub runtime: TempDir,
}

pub fn fake_env() -> FakeEnv {
    fake_env_with(|_| {})
}

/// Like [`fake_env`], with a chance to seed the fakes before the VM is bound.
pub fn fake_env_with(seed: impl FnOnce(&Fakes)) -> FakeEnv {
    let runtime = tempfile::tempdir().unwrap();
    let config = TestConfig {
        lifecycle: LifecycleConfig {
            runtime_dir: runtime.path().to_path_buf(),
            wait_stopped_timeout_secs: 1,
            wait_running_timeout_secs: 1,
            poll_interval_ms: 10,
            application_timeout_ms: 300,
            ..LifecycleConfig::default()
        },
        ..TestConfig::default()
    };
    let fakes = Fakes::new();
    seed(&fakes);
    let harness = TestHarness::with_backend(config, fakes.backend());
    let vm = harness.machine(VmSpec::new(VM_NAME)).unwrap();
    FakeEnv {
        fakes,
        harness,
        vm,
        runtime,
    }
}

/// Argument vectors as owned strings, for comparing against recorded calls.
pub fn argv(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| (*s).to_string()).collect()
}

/// Provisioning-tool calls other than in-guest commands.
pub fn lifecycle_calls(env: &FakeEnv) -> Vec<String> {
    env.fakes
        .provisioner
        .calls()
        .into_iter()
        .filter(|c| !c.starts_with("exec"))
        .collect()
}

/// A GDM greeter with username and password entries, plus the shell's
/// `Activities` button.
pub fn greeter(env: &FakeEnv) {
    let entry_ifaces = [
        interface::ACCESSIBLE,
        interface::TEXT,
        interface::EDITABLE_TEXT,
        interface::ACTION,
    ];
    let bus = &env.fakes.bus;
    bus.insert(
        FakeNode::new(":1.5", ROOT_PATH)
            .name("gnome-shell")
            .role("application")
            .child("/menu")
            .child("/dialog")
            .child("/activities"),
    );
    bus.insert(FakeNode::new(":1.5", "/menu").name("Login Options").role("menu"));
    bus.insert(
        FakeNode::new(":1.5", "/dialog")
            .role("dialog")
            .child("/user-entry")
            .child("/password-entry"),
    );
    bus.insert(
        FakeNode::new(":1.5", "/user-entry")
            .role("text")
            .interfaces(&entry_ifaces)
            .states(&[State::Editable, State::Focused])
            .action("activate"),
    );
    bus.insert(
        FakeNode::new(":1.5", "/password-entry")
            .role("password text")
            .interfaces(&entry_ifaces)
            .states(&[State::Editable])
            .action("activate"),
    );
    bus.insert(
        FakeNode::new(":1.5", "/activities")
            .name("Activities")
            .role("toggle button"),
    );
}
