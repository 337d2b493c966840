//! Full Feature Phase behaviour: ordering, task management, text, logout
//! and runtime customizations

mod common;

use common::*;
use iscsi_target::pdu::{
    async_event, logout_reason, logout_response, opcode, pack_lun, reject_reason, task_function, task_response,
    IscsiPdu, RESERVED_TAG,
};
use iscsi_target::{Customization, IscsiError};
use std::time::Duration;

fn tur(itt: u32, cmd_sn: u32, exp_stat_sn: u32) -> IscsiPdu {
    IscsiPdu::scsi_command(pack_lun(0), itt, cmd_sn, exp_stat_sn, &[0u8; 6], false, false, 0, Vec::new(), true)
}

#[test]
fn test_nop_echo() {
    let handle = start_default();
    let mut client = login(&handle);

    let echoed = client.nop(b"ping").unwrap();
    assert_eq!(echoed, b"ping");
}

#[test]
fn test_client_sequence_numbers() {
    let handle = start_default();
    let mut client = login(&handle);
    let start = client.cmd_sn();

    client.test_unit_ready(0).unwrap();
    client.test_unit_ready(0).unwrap();
    assert_eq!(client.cmd_sn(), start + 2);
    assert_eq!(client.max_cmd_sn(), client.cmd_sn() + 99);
}

#[test]
fn test_max_cmd_sn_delta() {
    let custom = Customization {
        max_cmd_sn_delta: 10,
        ..Default::default()
    };
    let handle = start(target_builder().customization(custom));
    let mut client = login(&handle);

    client.test_unit_ready(0).unwrap();
    assert_eq!(client.max_cmd_sn(), client.cmd_sn() + 109);
}

#[test]
fn test_out_of_order_cmd_sn_held() {
    let handle = start_default();
    let mut client = login(&handle);
    let cmd_sn = client.cmd_sn();

    client.send_pdu(tur(0x100, cmd_sn + 1, client.exp_stat_sn())).unwrap();
    client.send_pdu(tur(0x101, cmd_sn, client.exp_stat_sn())).unwrap();

    let mut itts = vec![client.recv_pdu().unwrap(), client.recv_pdu().unwrap()]
        .into_iter()
        .map(|pdu| {
            assert_eq!(pdu.opcode, opcode::SCSI_RESPONSE);
            pdu.itt
        })
        .collect::<Vec<_>>();
    itts.sort_unstable();
    assert_eq!(itts, vec![0x100, 0x101]);

    client.set_cmd_sn(cmd_sn + 2);
    assert_eq!(client.test_unit_ready(0).unwrap().status, 0);
}

#[test]
fn test_raw_pdu_transmission() {
    let handle = start_default();
    let mut client = login(&handle);

    let mut snack = IscsiPdu::new();
    snack.opcode = opcode::SNACK_REQUEST;
    snack.itt = 0x55;
    client.send_pdu(snack).unwrap();

    let reject = client.recv_pdu().unwrap();
    assert_eq!(reject.opcode, opcode::REJECT);
    assert_eq!(reject.opcode_fields[0], reject_reason::COMMAND_NOT_SUPPORTED);
    assert_eq!(reject.itt, RESERVED_TAG);
    // The offending header comes back as the Reject's data
    assert_eq!(reject.data[0] & 0x3f, opcode::SNACK_REQUEST);

    assert_eq!(client.nop(b"still alive").unwrap(), b"still alive");
}

#[test]
fn test_scsi_in_discovery_session() {
    let handle = start_default();
    let mut client = connect(&handle);
    client.discover(initiator_iqn()).unwrap();

    let result = client.test_unit_ready(0);
    assert!(matches!(result, Err(IscsiError::Protocol(_))), "got {:?}", result);
}

#[test]
fn test_text_keys_in_full_feature_phase() {
    let handle = start_default();
    let mut client = login(&handle);

    let replies = client
        .text_request(&[("MaxBurstLength", "1024"), ("X-com.example.Knob", "1")])
        .unwrap();
    assert_eq!(
        replies,
        vec![
            ("MaxBurstLength".to_string(), "Reject".to_string()),
            ("X-com.example.Knob".to_string(), "NotUnderstood".to_string()),
        ]
    );
}

#[test]
fn test_task_management_functions() {
    let handle = start_default();
    let mut client = login(&handle);

    let abort = client.task_management(task_function::ABORT_TASK, 0, 0x7777).unwrap();
    assert_eq!(abort, task_response::TASK_DOES_NOT_EXIST);

    let reset = client.task_management(task_function::LOGICAL_UNIT_RESET, 0, RESERVED_TAG).unwrap();
    assert_eq!(reset, task_response::FUNCTION_COMPLETE);

    let reassign = client.task_management(task_function::TASK_REASSIGN, 0, 1).unwrap();
    assert_eq!(reassign, task_response::REASSIGNMENT_NOT_SUPPORTED);

    let clear = client.task_management(task_function::CLEAR_ACA, 0, RESERVED_TAG).unwrap();
    assert_eq!(clear, task_response::FUNCTION_NOT_SUPPORTED);

    let cold = client.task_management(task_function::TARGET_COLD_RESET, 0, RESERVED_TAG).unwrap();
    assert_eq!(cold, task_response::FUNCTION_COMPLETE);
}

#[test]
fn test_unsolicited_nop_in() {
    let handle = start_default();
    let mut client = login(&handle);

    let updated = handle.custom().set(None, "send_nopin", "1").unwrap();
    assert_eq!(updated, 1);

    let nop = client.recv_pdu().unwrap();
    assert_eq!(nop.opcode, opcode::NOP_IN);
    assert_eq!(nop.itt, RESERVED_TAG);
    assert_ne!(nop.ttt(), RESERVED_TAG);
}

#[test]
fn test_async_logout_request() {
    let handle = start_default();
    let mut client = login(&handle);

    let custom = handle.custom();
    custom.set(None, "async_logout_timeout", "30").unwrap();
    custom.set(None, "send_async", "logout_request").unwrap();

    let message = client.recv_pdu().unwrap();
    assert_eq!(message.opcode, opcode::ASYNC_MESSAGE);
    assert_eq!(message.async_event(), async_event::LOGOUT_REQUEST);
    assert_eq!(message.async_parameters().2, 30);
}

#[test]
fn test_logout_close_session() {
    let handle = start_default();
    let mut client = login(&handle);
    let tsih = client.tsih();

    assert_eq!(client.logout().unwrap(), logout_response::SUCCESS);
    assert!(!client.is_logged_in());

    let sessions = handle.sessions();
    assert!(wait_for(|| sessions.lock().unwrap().lookup(tsih).is_none()));
}

#[test]
fn test_logout_unknown_cid() {
    let handle = start_default();
    let mut client = login(&handle);

    let response = client.logout_with(logout_reason::CLOSE_CONNECTION, 77).unwrap();
    assert_eq!(response, logout_response::CID_NOT_FOUND);
    assert!(client.is_logged_in());
}

#[test]
fn test_logout_for_recovery_unsupported() {
    let handle = start_default();
    let mut client = login(&handle);

    let response = client
        .logout_with(logout_reason::REMOVE_CONNECTION_FOR_RECOVERY, 1)
        .unwrap();
    assert_eq!(response, logout_response::CONNECTION_RECOVERY_NOT_SUPPORTED);
}

#[test]
fn test_logout_other_connection() {
    let handle = start_default();
    let mut first = connect(&handle);
    first
        .login_with(initiator_iqn(), Some(target_iqn()), None, &[("MaxConnections", "2")])
        .unwrap();
    let mut second = connect(&handle).with_identity(first.isid(), first.tsih(), 2);
    second.login(initiator_iqn(), target_iqn()).unwrap();
    assert_eq!(second.nop(b"two").unwrap(), b"two");

    let response = first.logout_with(logout_reason::CLOSE_CONNECTION, 2).unwrap();
    assert_eq!(response, logout_response::SUCCESS);

    // The removed connection is shut down by its manager
    second.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    assert!(second.recv_pdu().is_err());
    assert_eq!(first.nop(b"one").unwrap(), b"one");
}
