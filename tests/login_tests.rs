//! Login, discovery and authentication against a live target

mod common;

use common::*;
use iscsi_target::client::ChapSecret;
use iscsi_target::pdu::{login_status, stage};
use iscsi_target::{AuthConfig, ChapCredentials, Customization, IscsiError};

fn chap_target() -> iscsi_target::TargetHandle {
    let secret = chap_secret();
    start(target_builder().auth(AuthConfig::Chap {
        credentials: ChapCredentials::new(secret.user, secret.secret),
    }))
}

fn login_error(result: Result<(), IscsiError>) -> (u8, u8) {
    match result {
        Err(IscsiError::Login { class, detail, .. }) => (class, detail),
        other => panic!("expected a login rejection, got {:?}", other),
    }
}

#[test]
fn test_login_basic() {
    let handle = start_default();
    let client = login(&handle);

    assert!(client.is_logged_in());
    assert_ne!(client.tsih(), 0, "target must assign a TSIH");
    assert!(wait_for(|| handle.sessions().lock().unwrap().len() == 1));
}

#[test]
fn test_discovery_basic() {
    let handle = start_default();
    let mut client = connect(&handle);

    let targets = client.discover(initiator_iqn()).expect("Discovery failed");
    assert_eq!(targets.len(), 1);
    assert_eq!(targets[0].0, target_iqn());
    let expected_address = format!("{},1", handle.local_addr());
    assert_eq!(targets[0].1, expected_address);
}

#[test]
fn test_discovery_by_name() {
    let handle = start_default();
    let mut client = connect(&handle);
    client.discover(initiator_iqn()).unwrap();

    let named = client.send_targets(target_iqn()).unwrap();
    assert_eq!(named.len(), 1);
    let other = client.send_targets("iqn.2004-01.com:elsewhere").unwrap();
    assert!(other.is_empty());
}

#[test]
fn test_login_unknown_target() {
    let handle = start_default();
    let mut client = connect(&handle);

    let (class, detail) = login_error(client.login(initiator_iqn(), "iqn.2004-01.com:nosuch"));
    assert_eq!(class, login_status::INITIATOR_ERROR);
    assert_eq!(detail, login_status::DETAIL_NOT_FOUND);
}

#[test]
fn test_login_missing_target_name() {
    let handle = start_default();
    let mut client = connect(&handle);

    let keys = vec![
        ("InitiatorName".to_string(), initiator_iqn().to_string()),
        ("AuthMethod".to_string(), "None".to_string()),
    ];
    let result = client
        .login_round(stage::SECURITY, stage::OPERATIONAL, true, keys)
        .map(|_| ());
    let (class, detail) = login_error(result);
    assert_eq!(class, login_status::INITIATOR_ERROR);
    assert_eq!(detail, login_status::DETAIL_MISSING_PARAMETER);
}

#[test]
fn test_login_unknown_tsih() {
    let handle = start_default();
    let mut client = connect(&handle).with_identity([0x80, 0, 0, 0, 0, 9], 0x4242, 1);

    let (class, detail) = login_error(client.login(initiator_iqn(), target_iqn()));
    assert_eq!(class, login_status::INITIATOR_ERROR);
    assert_eq!(detail, login_status::DETAIL_SESSION_DOES_NOT_EXIST);
}

#[test]
fn test_login_responses_split() {
    let custom = Customization {
        split_pdu_at: Some(24),
        ..Default::default()
    };
    let handle = start(target_builder().target_alias("split-alias").customization(custom));
    let mut client = connect(&handle);

    // Login and SendTargets replies arrive in Continue-bit pieces
    let targets = client.discover(initiator_iqn()).unwrap();
    assert_eq!(targets.len(), 1);
    assert_eq!(targets[0].0, target_iqn());
}

#[test]
fn test_chap_login() {
    let handle = chap_target();
    let mut client = connect(&handle);

    client
        .login_chap(initiator_iqn(), target_iqn(), &chap_secret())
        .expect("CHAP login failed");
    assert!(client.is_logged_in());
    let result = client.test_unit_ready(test_lun()).unwrap();
    assert_eq!(result.status, 0);
}

#[test]
fn test_chap_wrong_secret() {
    let handle = chap_target();
    let mut client = connect(&handle);

    let wrong = ChapSecret {
        user: chap_secret().user,
        secret: "not-the-secret".to_string(),
    };
    let (class, detail) = login_error(client.login_chap(initiator_iqn(), target_iqn(), &wrong));
    assert_eq!(class, login_status::INITIATOR_ERROR);
    assert_eq!(detail, login_status::DETAIL_NOT_AUTH);
}

#[test]
fn test_chap_required() {
    let handle = chap_target();
    let mut client = connect(&handle);

    let (class, _) = login_error(client.login(initiator_iqn(), target_iqn()));
    assert_eq!(class, login_status::INITIATOR_ERROR);
}

#[test]
fn test_reject_customization() {
    let handle = start_default();
    handle.custom().set(None, "reject", "1").unwrap();

    let mut client = connect(&handle);
    let (class, _) = login_error(client.login(initiator_iqn(), target_iqn()));
    assert_eq!(class, login_status::INITIATOR_ERROR);

    handle.custom().set(None, "reject", "0").unwrap();
    let client = login(&handle);
    assert!(client.is_logged_in());
}

#[test]
fn test_second_connection_joins_session() {
    let handle = start_default();
    let mut first = connect(&handle);
    first
        .login_with(
            initiator_iqn(),
            Some(target_iqn()),
            None,
            &[("MaxConnections", "2")],
        )
        .unwrap();

    let mut second = connect(&handle).with_identity(first.isid(), first.tsih(), 2);
    second.login(initiator_iqn(), target_iqn()).expect("second connection refused");
    assert_eq!(second.tsih(), first.tsih());

    let sessions = handle.sessions();
    let session = sessions.lock().unwrap().lookup(first.tsih()).unwrap();
    assert!(wait_for(|| session.lock().unwrap().connection_count() == 2));
}

#[test]
fn test_connection_limit() {
    let handle = start_default();
    let first = login(&handle);

    // MaxConnections stays at 1
    let mut second = connect(&handle).with_identity(first.isid(), first.tsih(), 2);
    let (class, detail) = login_error(second.login(initiator_iqn(), target_iqn()));
    assert_eq!(class, login_status::INITIATOR_ERROR);
    assert_eq!(detail, login_status::DETAIL_TOO_MANY_CONNECTIONS);
}

#[test]
fn test_session_reinstatement() {
    let handle = start_default();
    let first = login(&handle);
    let old_tsih = first.tsih();

    let mut again = connect(&handle).with_identity(first.isid(), 0, 1);
    again.login(initiator_iqn(), target_iqn()).unwrap();
    assert_ne!(again.tsih(), old_tsih);

    let sessions = handle.sessions();
    assert!(sessions.lock().unwrap().lookup(old_tsih).is_none());
}
