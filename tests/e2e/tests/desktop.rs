//! Desktop E2E tests against a real hypervisor.
//!
//! These need libvirt (`qemu:///system`), multipass and vsock support on the
//! host. Set `DESKVM_FORCE_NEW_VMS=1` to rebuild cached snapshots.

use deskvm_a11y::{Query, Retry};
use deskvm_e2e::{install_firefox, log_in, prepare_new_vm, Credentials, Reboot, TestHarness};
use deskvm_vm::VmSpec;

const MAIN_VM: &str = "behave-tests-main";

// ============================================================================
// Greeter
// ============================================================================

#[test]
#[ignore = "requires libvirt and multipass"]
fn new_vm_boots_to_login_screen() {
    let harness = TestHarness::from_env().expect("failed to create harness");
    let mut vm = harness
        .machine(VmSpec::new(MAIN_VM))
        .expect("failed to bind VM");

    prepare_new_vm(&mut vm, harness.force_new_vms(), Reboot::Restart)
        .expect("failed to prepare VM");

    let greeter = vm.gnome_shell().expect("gnome-shell not on the bus");
    greeter
        .find_child(&Query::new().name("Login Options").role("menu"), Retry::DEFAULT)
        .expect("GDM login screen not shown");
}

// ============================================================================
// Session
// ============================================================================

#[test]
#[ignore = "requires libvirt and multipass"]
fn log_in_reaches_desktop() {
    let harness = TestHarness::from_env().expect("failed to create harness");
    let mut vm = harness
        .machine(VmSpec::new(MAIN_VM))
        .expect("failed to bind VM");

    prepare_new_vm(&mut vm, harness.force_new_vms(), Reboot::Restart)
        .expect("failed to prepare VM");
    log_in(&mut vm, &Credentials::default_user()).expect("login failed");
    assert_eq!(vm.a11y_bus_user(), "ubuntu");
}

#[test]
#[ignore = "requires libvirt and multipass"]
fn firefox_installs_on_second_vm() {
    let harness = TestHarness::from_env().expect("failed to create harness");
    let mut vm = harness
        .machine(VmSpec::new("behave-tests-second").with_disk_size("10G"))
        .expect("failed to bind VM");

    prepare_new_vm(&mut vm, harness.force_new_vms(), Reboot::Skip).expect("failed to prepare VM");
    install_firefox(&mut vm, harness.force_new_vms()).expect("failed to install Firefox");
    vm.check_call(&["test", "-x", "/usr/bin/firefox"])
        .expect("firefox binary missing");
}
