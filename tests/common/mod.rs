//! Shared helpers for the integration tests
//!
//! Every test spawns its own target on 127.0.0.1:0 and talks to it with
//! [`IscsiClient`]. Names come from `tests/test-config.toml`.

#![allow(dead_code)]

use iscsi_target::client::ChapSecret;
use iscsi_target::{IscsiClient, IscsiTarget, IscsiTargetBuilder, TargetHandle};
use once_cell::sync::Lazy;
use std::time::Duration;

#[derive(Debug)]
pub struct TestConfig {
    pub target_iqn: String,
    pub initiator_iqn: String,
    pub lun: u16,
    pub chap_user: String,
    pub chap_secret: String,
}

pub static TEST_CONFIG: Lazy<TestConfig> = Lazy::new(|| {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/test-config.toml");
    let contents = std::fs::read_to_string(path).expect("Failed to read tests/test-config.toml");
    let config = contents
        .parse::<toml::Value>()
        .expect("Failed to parse tests/test-config.toml - invalid TOML syntax");

    let text = |section: &str, key: &str| -> String {
        config
            .get(section)
            .and_then(|s| s.get(key))
            .and_then(|v| v.as_str())
            .unwrap_or_else(|| panic!("Missing or invalid '{}' in [{}]", key, section))
            .to_string()
    };
    let lun = config
        .get("target")
        .and_then(|t| t.get("lun"))
        .and_then(|l| l.as_integer())
        .expect("Missing or invalid 'lun' in [target] section") as u16;

    TestConfig {
        target_iqn: text("target", "iqn"),
        initiator_iqn: text("target", "initiator_iqn"),
        lun,
        chap_user: text("chap", "user"),
        chap_secret: text("chap", "secret"),
    }
});

static LOGGER: Lazy<()> = Lazy::new(|| {
    let _ = env_logger::builder().is_test(true).try_init();
});

pub fn init_logging() {
    Lazy::force(&LOGGER);
}

pub fn target_iqn() -> &'static str {
    &TEST_CONFIG.target_iqn
}

pub fn initiator_iqn() -> &'static str {
    &TEST_CONFIG.initiator_iqn
}

pub fn test_lun() -> u16 {
    TEST_CONFIG.lun
}

pub fn chap_secret() -> ChapSecret {
    ChapSecret {
        user: TEST_CONFIG.chap_user.clone(),
        secret: TEST_CONFIG.chap_secret.clone(),
    }
}

/// Builder preset for a localhost target on an ephemeral port
pub fn target_builder() -> IscsiTargetBuilder {
    init_logging();
    IscsiTarget::builder()
        .bind_addr("127.0.0.1:0")
        .target_name(target_iqn())
}

pub fn start(builder: IscsiTargetBuilder) -> TargetHandle {
    builder
        .build()
        .expect("Failed to build target")
        .spawn()
        .expect("Failed to start target")
}

pub fn start_default() -> TargetHandle {
    start(target_builder())
}

pub fn connect(handle: &TargetHandle) -> IscsiClient {
    let addr = handle.local_addr().to_string();
    IscsiClient::connect(&addr).unwrap_or_else(|e| panic!("Failed to connect to {}: {}", addr, e))
}

/// Connected and logged in to a Normal session
pub fn login(handle: &TargetHandle) -> IscsiClient {
    let mut client = connect(handle);
    client
        .login(initiator_iqn(), target_iqn())
        .expect("Login to test target failed");
    client
}

/// Poll until `check` holds or the deadline passes
pub fn wait_for(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..50 {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    check()
}
