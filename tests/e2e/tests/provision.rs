//! Provisioning routines and the login flow, driven over fakes.

mod common;

use common::{argv, fake_env, fake_env_with, greeter, lifecycle_calls, VM_NAME};
use deskvm_e2e::{install_firefox, log_in, prepare_new_vm, Credentials, Reboot};
use deskvm_exec::ExecOutput;
use deskvm_vm::{Outcome, PowerState};

// ============================================================================
// prepare_new_vm
// ============================================================================

#[test]
fn prepare_new_vm_from_scratch() {
    let mut env = fake_env();
    let outcome = prepare_new_vm(&mut env.vm, false, Reboot::Restart).unwrap();
    assert_eq!(outcome, Outcome::Ran(()));
    assert_eq!(env.vm.power_state(), PowerState::Running);

    assert_eq!(
        lifecycle_calls(&env),
        vec![
            format!("delete {VM_NAME}"),
            format!("launch {VM_NAME}"),
            format!("stop {VM_NAME}"),
            format!("start {VM_NAME}"),
            format!("stop {VM_NAME}"),
            format!("start {VM_NAME}"),
        ]
    );

    let guest = env.fakes.guest.calls();
    for command in [
        &["sudo", "apt", "remove", "-y", "unattended-upgrades"][..],
        &["sudo", "apt", "install", "-y", "ubuntu-session"],
        &["sudo", "apt", "install", "-y", "socat"],
    ] {
        assert!(guest.contains(&argv(command)), "{command:?} not run");
    }
    let stdin: Vec<String> = env.fakes.guest.stdin_log().into_iter().flatten().collect();
    assert_eq!(stdin, vec!["root:root", "ubuntu:ubuntu"]);

    assert!(env.vm.has_snapshot("new-vm").unwrap());
}

#[test]
fn prepare_new_vm_restores_snapshot() {
    let mut env = fake_env();
    prepare_new_vm(&mut env.vm, false, Reboot::Skip).unwrap();
    let commands = env.fakes.guest.calls().len();

    let outcome = prepare_new_vm(&mut env.vm, false, Reboot::Skip).unwrap();
    assert!(outcome.is_restored());
    assert_eq!(env.fakes.guest.count(&["sudo", "apt"]), 4);
    assert_eq!(
        env.fakes.guest.calls().len(),
        commands + 1,
        "only the clock resync runs after a restore"
    );
}

#[test]
fn cached_vm_skips_provisioning() {
    let mut env = fake_env_with(|fakes| {
        fakes.hypervisor.insert_domain(VM_NAME, true);
        fakes.provisioner.insert_instance(VM_NAME);
        fakes.hypervisor.insert_snapshot(VM_NAME, "new-vm");
    });
    assert_eq!(env.vm.power_state(), PowerState::Running);

    let outcome = prepare_new_vm(&mut env.vm, false, Reboot::Restart).unwrap();
    assert_eq!(outcome, Outcome::Restored);
    assert!(lifecycle_calls(&env).is_empty());
    assert_eq!(
        env.fakes.hypervisor.calls(),
        vec![format!("revert {VM_NAME} new-vm")]
    );
}

#[test]
fn prepare_new_vm_without_reboot() {
    let mut env = fake_env();
    prepare_new_vm(&mut env.vm, false, Reboot::Skip).unwrap();
    let stops = lifecycle_calls(&env)
        .iter()
        .filter(|c| c.starts_with("stop"))
        .count();
    assert_eq!(stops, 1);
}

#[test]
fn prepare_new_vm_failure_leaves_no_snapshot() {
    let mut env = fake_env();
    env.fakes.guest.on(
        &["sudo", "apt", "install", "-y", "ubuntu-session"],
        ExecOutput::failed(100, "E: Unable to locate package ubuntu-session"),
    );
    let err = prepare_new_vm(&mut env.vm, false, Reboot::Restart).unwrap_err();
    assert_eq!(err.exit_code(), Some(100));
    assert!(!env.vm.has_snapshot("new-vm").unwrap());
    assert_eq!(env.fakes.guest.count(&["sudo", "apt", "install", "-y", "socat"]), 0);
}

#[test]
fn forced_prepare_rebuilds() {
    let mut env = fake_env();
    prepare_new_vm(&mut env.vm, false, Reboot::Skip).unwrap();
    let outcome = prepare_new_vm(&mut env.vm, true, Reboot::Skip).unwrap();
    assert_eq!(outcome, Outcome::Ran(()));
    assert_eq!(env.fakes.provisioner.calls().iter().filter(|c| c.starts_with("launch")).count(), 2);
    assert_eq!(env.vm.snapshots().unwrap(), vec!["new-vm"]);
}

// ============================================================================
// install_firefox
// ============================================================================

#[test]
fn firefox_layers_on_new_vm() {
    let mut env = fake_env();
    prepare_new_vm(&mut env.vm, false, Reboot::Skip).unwrap();
    install_firefox(&mut env.vm, false).unwrap();

    let snapshots = env.vm.snapshots().unwrap();
    assert!(snapshots.contains(&"new-vm".to_string()));
    assert!(snapshots.contains(&"firefox-installed".to_string()));
    assert!(env
        .fakes
        .guest
        .calls()
        .contains(&argv(&["sudo", "apt", "install", "-y", "firefox"])));

    assert!(install_firefox(&mut env.vm, false).unwrap().is_restored());
}

// ============================================================================
// log_in
// ============================================================================

#[test]
fn log_in_switches_to_user_bus() {
    let mut env = fake_env();
    prepare_new_vm(&mut env.vm, false, Reboot::Restart).unwrap();
    greeter(&env);

    log_in(&mut env.vm, &Credentials::default_user()).unwrap();

    let bus = &env.fakes.bus;
    assert_eq!(bus.node("/user-entry").get_text(None, None).unwrap(), "ubuntu");
    assert_eq!(bus.node("/password-entry").get_text(None, None).unwrap(), "ubuntu");
    assert_eq!(
        bus.performed(),
        vec![
            ("/user-entry".to_string(), "activate".to_string()),
            ("/password-entry".to_string(), "activate".to_string()),
        ]
    );

    assert_eq!(env.vm.a11y_bus_user(), "ubuntu");
    assert_eq!(env.fakes.connector.sockets().len(), 2);
    assert!(env.fakes.guest.calls().contains(&argv(&["id", "-u", "ubuntu"])));
}
