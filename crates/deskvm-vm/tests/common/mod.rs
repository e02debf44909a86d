#![allow(dead_code)]

use deskvm_vm::testing::Fakes;
use deskvm_vm::{CidAllocator, LifecycleConfig, VirtualMachine, VmSpec};
use tempfile::TempDir;

pub const VM_NAME: &str = "behave-tests-main";

/// A VM handle over fakes, with a scratch runtime directory.
pub struct TestVm {
    pub fakes: Fakes,
    pub vm: VirtualMachine,
    pub runtime: TempDir,
}

/// Short timeouts so failure paths finish quickly.
pub fn fast_config(runtime: &TempDir) -> LifecycleConfig {
    LifecycleConfig {
        runtime_dir: runtime.path().to_path_buf(),
        wait_stopped_timeout_secs: 1,
        wait_running_timeout_secs: 1,
        poll_interval_ms: 10,
        application_timeout_ms: 300,
        ..LifecycleConfig::default()
    }
}

/// A handle for a VM that does not exist yet.
pub fn absent_vm() -> TestVm {
    absent_vm_with(|_| {})
}

/// Like [`absent_vm`], with a chance to adjust the configuration.
pub fn absent_vm_with(configure: impl FnOnce(&mut LifecycleConfig)) -> TestVm {
    let runtime = tempfile::tempdir().unwrap();
    let mut config = fast_config(&runtime);
    configure(&mut config);
    let fakes = Fakes::new();
    let vm = VirtualMachine::new(
        VmSpec::new(VM_NAME),
        config,
        fakes.backend(),
        &CidAllocator::default(),
    )
    .unwrap();
    TestVm { fakes, vm, runtime }
}

/// A handle for a launched, running VM.
pub fn running_vm() -> TestVm {
    let mut t = absent_vm();
    t.vm.launch().unwrap();
    t
}

/// Argument vectors as owned strings, for comparing against recorded calls.
pub fn argv(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| (*s).to_string()).collect()
}
