//! End-to-end test framework for deskvm.
//!
//! This crate provides the harness GUI acceptance tests are built on:
//! environment-driven configuration, log capture and VM handles sharing one
//! vsock id allocator. The provisioning routines and the login flow live in
//! [`deskvm_vm::provision`] and are re-exported here.
//!
//! Tests that need a real hypervisor are `#[ignore]`d; run them with
//! `cargo test -p deskvm-e2e -- --ignored`.

pub mod harness;

pub use deskvm_vm::provision::{install_firefox, log_in, prepare_new_vm, Credentials, Reboot};
pub use harness::{init_tracing, TestConfig, TestHarness};
