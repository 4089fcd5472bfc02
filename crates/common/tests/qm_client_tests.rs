//! QmClient Integration Tests
//!
//! Drives [`QmClient`] against a fake `qm` shell script that keeps one VM's
//! power state in a file next to it.
//!
//! Everything runs in a single test: writing an executable while another test
//! thread forks can make `exec` fail with "Text file busy".
//!
//! Run with: `cargo test -p common --test qm_client_tests`

use common::{ActionError, QmClient, VmControl, VmId, VmRunState};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use tempfile::tempdir;

const FAKE_QM: &str = r#"#!/bin/sh
state="$(dirname "$0")/state"
case "$1" in
    status)
        case "$2" in
            101) echo "status: $(cat "$state")" ;;
            103) echo "status: paused" ;;
            104) echo "no status here" ;;
            *) echo "Configuration file 'nodes/pve/qemu-server/$2.conf' does not exist" >&2; exit 2 ;;
        esac
        ;;
    start)
        if [ "$2" = "101" ]; then
            echo running > "$state"
        else
            echo "start failed: VM $2 is locked" >&2
            exit 255
        fi
        ;;
    list)
        echo "      VMID NAME                 STATUS     MEM(MB)    BOOTDISK(GB) PID"
        echo "       101 desktop              $(cat "$state")       4096              32.00 0"
        echo "       102 nas                  running    2048              16.00 4242"
        ;;
esac
"#;

fn install_fake_qm(dir: &Path) -> QmClient {
    let program = dir.join("qm");
    fs::write(&program, FAKE_QM).unwrap();
    fs::set_permissions(&program, fs::Permissions::from_mode(0o755)).unwrap();
    fs::write(dir.join("state"), "stopped\n").unwrap();
    QmClient::new(program)
}

#[test]
fn test_qm_client_against_fake_qm() {
    let tmp = tempdir().unwrap();
    let client = install_fake_qm(tmp.path());

    // Status and start
    assert_eq!(client.status(VmId(101)), VmRunState::Stopped);
    assert!(client.start(VmId(101)));
    assert_eq!(client.status(VmId(101)), VmRunState::Running);

    // Failed start carries the exit status and stderr
    assert!(!client.start(VmId(102)));
    match client.try_start(VmId(102)) {
        Err(ActionError::Exit { stderr, .. }) => assert!(stderr.contains("locked")),
        other => panic!("unexpected result: {:?}", other),
    }

    // Status failures collapse to Unknown
    assert_eq!(client.status(VmId(999)), VmRunState::Unknown);
    assert!(matches!(
        client.try_status(VmId(103)),
        Err(ActionError::UnrecognizedStatus(word)) if word == "paused"
    ));
    assert!(matches!(
        client.try_status(VmId(104)),
        Err(ActionError::MissingStatus)
    ));

    // Inventory
    let vms = client.list_vms().unwrap();
    assert_eq!(vms.len(), 2);
    assert_eq!(vms[0].vm_id, VmId(101));
    assert_eq!(vms[0].name, "desktop");
    assert_eq!(vms[0].status, "running");
    assert_eq!(vms[1].status, "running");
}
