mod common;

use common::{absent_vm_with, argv, running_vm, VM_NAME};
use deskvm_exec::ExecOutput;
use deskvm_vm::Error;

// ---------------------------------------------------------------------------
// Session setup
// ---------------------------------------------------------------------------

#[test]
fn session_bridges_guest_bus_to_host_socket() {
    let mut t = running_vm();
    t.vm.a11y_bus().unwrap();

    let session = t.vm.forwarding_session().unwrap();
    assert_eq!(session.user(), "gdm");
    assert_eq!(session.uid(), "1000");
    assert_eq!(session.vsock_port(), 6000);
    assert_eq!(session.host_unit(), format!("a11y-bus-proxy-{VM_NAME}-1000"));
    assert_eq!(session.guest_unit(), "a11y-bus-proxy-1000");

    let socket = t.runtime.path().join(VM_NAME).join("a11y-bus-1000");
    assert_eq!(session.host_socket(), socket);
    assert!(socket.parent().unwrap().is_dir());
    assert_eq!(t.fakes.connector.sockets(), vec![socket.clone()]);

    assert!(t.fakes.guest.calls().contains(&argv(&[
        "sudo",
        "systemd-run",
        "--unit",
        "a11y-bus-proxy-1000",
        "--",
        "socat",
        "VSOCK-LISTEN:6000,reuseaddr,fork",
        "UNIX-CONNECT:/run/user/1000/at-spi/bus",
    ])));

    let listen = format!("UNIX-LISTEN:{},fork", socket.display());
    let connect = format!("VSOCK-CONNECT:{}:6000", t.vm.vsock_cid());
    let unit = format!("a11y-bus-proxy-{VM_NAME}-1000");
    assert!(t.fakes.host.calls().contains(&argv(&[
        "systemd-run",
        "--user",
        "--unit",
        unit.as_str(),
        "--",
        "socat",
        listen.as_str(),
        connect.as_str(),
    ])));
}

#[test]
fn guest_unit_reset_before_start() {
    let mut t = running_vm();
    t.vm.a11y_bus().unwrap();

    let calls = t.fakes.guest.calls();
    let position = |args: &[&str]| calls.iter().position(|c| c == &argv(args)).unwrap();
    let stop = position(&["sudo", "systemctl", "stop", "a11y-bus-proxy-1000"]);
    let reset = position(&["sudo", "systemctl", "reset-failed", "a11y-bus-proxy-1000"]);
    let run = calls
        .iter()
        .position(|c| c.starts_with(&argv(&["sudo", "systemd-run"])))
        .unwrap();
    assert!(stop < reset && reset < run);
}

#[test]
fn session_memoized_per_user() {
    let mut t = running_vm();
    t.fakes
        .guest
        .on(&["id", "-u", "ubuntu"], ExecOutput::with_stdout("1001\n"));

    t.vm.a11y_bus().unwrap();
    t.vm.a11y_bus().unwrap();
    assert_eq!(t.fakes.connector.sockets().len(), 1);
    assert_eq!(t.fakes.guest.count(&["id", "-u"]), 1);

    t.vm.set_a11y_bus_user("ubuntu");
    t.vm.a11y_bus().unwrap();
    assert_eq!(t.vm.forwarding_session().unwrap().uid(), "1001");
    assert_eq!(t.fakes.connector.sockets().len(), 2);

    t.vm.set_a11y_bus_user("gdm");
    t.vm.a11y_bus().unwrap();
    assert_eq!(t.fakes.connector.sockets().len(), 2);
}

#[test]
fn waits_for_guest_bus_socket() {
    let mut t = running_vm();
    t.fakes.guest.on_sequence(
        &["sudo", "ls"],
        vec![
            ExecOutput::failed(2, "No such file or directory"),
            ExecOutput::failed(2, "No such file or directory"),
            ExecOutput::exited(0),
        ],
    );
    t.vm.a11y_bus().unwrap();
    assert_eq!(t.fakes.guest.count(&["sudo", "ls"]), 3);
}

// ---------------------------------------------------------------------------
// Port scan
// ---------------------------------------------------------------------------

#[test]
fn busy_ports_skipped() {
    let mut t = running_vm();
    for port in ["VSOCK-LISTEN:6000", "VSOCK-LISTEN:6001"] {
        t.fakes
            .guest
            .on(&["timeout", "1s", "sudo", "socat", port], ExecOutput::exited(1));
    }
    t.vm.a11y_bus().unwrap();
    assert_eq!(t.vm.forwarding_session().unwrap().vsock_port(), 6002);
    assert_eq!(t.fakes.guest.count(&["timeout", "1s"]), 3);
}

#[test]
fn no_free_port() {
    let mut t = absent_vm_with(|config| {
        config.vsock_port_min = 6000;
        config.vsock_port_max = 6002;
    });
    t.vm.launch().unwrap();
    t.fakes.guest.on(&["timeout", "1s"], ExecOutput::exited(1));

    let err = t.vm.a11y_bus().err().unwrap();
    assert!(matches!(err, Error::NoFreePort { min: 6000, max: 6002 }));
    assert_eq!(t.fakes.guest.count(&["timeout", "1s"]), 3);
    assert!(t.vm.forwarding_session().is_none());
}

// ---------------------------------------------------------------------------
// Host unit reset
// ---------------------------------------------------------------------------

#[test]
fn host_unit_waited_out_until_unknown() {
    let mut t = running_vm();
    t.fakes.host.on_sequence(
        &["systemctl", "--user", "status"],
        vec![
            ExecOutput::exited(0),
            ExecOutput::exited(3),
            ExecOutput::exited(4),
        ],
    );
    t.vm.a11y_bus().unwrap();
    assert_eq!(t.fakes.host.count(&["systemctl", "--user", "status"]), 3);
    assert_eq!(t.fakes.host.count(&["systemctl", "--user", "stop", "--force"]), 3);
    assert_eq!(t.fakes.host.count(&["systemctl", "--user", "reset-failed"]), 3);
}

#[test]
fn host_unit_unexpected_status_propagates() {
    let mut t = running_vm();
    t.fakes.host.on(
        &["systemctl", "--user", "status"],
        ExecOutput::failed(1, "Failed to connect to bus"),
    );
    let err = t.vm.a11y_bus().err().unwrap();
    assert_eq!(err.exit_code(), Some(1));
    assert_eq!(t.fakes.host.count(&["systemctl", "--user", "status"]), 1);
    assert_eq!(t.fakes.host.count(&["systemd-run"]), 0);
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

#[test]
fn connect_retries_missing_socket() {
    let mut t = running_vm();
    t.fakes.connector.fail_next(3);
    t.vm.a11y_bus().unwrap();
    assert_eq!(t.fakes.connector.sockets().len(), 4);
}

#[test]
fn connect_gives_up() {
    let mut t = running_vm();
    t.fakes.connector.fail_next(usize::MAX);
    let err = t.vm.a11y_bus().err().unwrap();
    assert!(err.is_timeout());
    assert!(err.to_string().starts_with("Failed to connect to the a11y bus"));
}
