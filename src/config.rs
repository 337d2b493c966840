//! Target configuration and runtime customization
//!
//! [`TargetConfig`] is fixed when the target starts. [`Customization`]
//! holds the knobs that can be changed while connections are up; the
//! [`CustomRegistry`] keeps one copy per connection and wakes the
//! connection's manager thread whenever a value changes.

use crate::auth::{AuthConfig, SrpAuthenticator};
use crate::command::OwnerId;
use crate::error::{IscsiError, ScsiResult};
use crate::params::{check_iscsi_name, key, parse_number, ParamTable};
use crate::task::{AsyncEvent, AsyncParams};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// Well-known iSCSI target port
pub const DEFAULT_PORT: u16 = 3260;

/// iSCSI system port
pub const SYSTEM_PORT: u16 = 860;

/// Naming header used when no target name is configured
pub const DEFAULT_TARGET_NAME: &str = "iqn.2004-01.com:target";

/// Resolve a port given as a number or as an iSCSI service name
pub fn resolve_port(port: &str) -> ScsiResult<u16> {
    match port {
        "iscsi-target" => Ok(DEFAULT_PORT),
        "iscsi" => Ok(SYSTEM_PORT),
        other => other
            .parse()
            .map_err(|_| IscsiError::Config(format!("invalid port '{}'", other))),
    }
}

fn normalize_bind_addr(addr: &str) -> ScsiResult<String> {
    match addr.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => Ok(format!("{}:{}", host, resolve_port(port)?)),
        _ => Ok(format!("{}:{}", addr, DEFAULT_PORT)),
    }
}

// ============================================================================
// Verbosity
// ============================================================================

/// Startup verbosity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Verbosity {
    Silent,
    Minimal,
    #[default]
    Normal,
    Verbose,
    Debug,
    PrintAll,
}

impl Verbosity {
    pub fn level_filter(self) -> log::LevelFilter {
        match self {
            Verbosity::Silent => log::LevelFilter::Off,
            Verbosity::Minimal => log::LevelFilter::Error,
            Verbosity::Normal => log::LevelFilter::Warn,
            Verbosity::Verbose => log::LevelFilter::Info,
            Verbosity::Debug => log::LevelFilter::Debug,
            Verbosity::PrintAll => log::LevelFilter::Trace,
        }
    }
}

impl FromStr for Verbosity {
    type Err = IscsiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "silent" => Ok(Verbosity::Silent),
            "minimal" => Ok(Verbosity::Minimal),
            "normal" => Ok(Verbosity::Normal),
            "verbose" => Ok(Verbosity::Verbose),
            "debug" => Ok(Verbosity::Debug),
            "printall" => Ok(Verbosity::PrintAll),
            _ => Err(IscsiError::Config(format!("unknown verbosity '{}'", s))),
        }
    }
}

// ============================================================================
// Customization
// ============================================================================

/// Runtime-tunable behaviour of one connection
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Customization {
    /// Reject every Login Request
    pub reject: bool,
    /// Fixed CHAP identifier instead of a random one
    pub chap_i: Option<u8>,
    /// Async Message to send (consumed when sent)
    pub send_async: Option<AsyncEvent>,
    pub async_logout_timeout: u16,
    pub async_drop_time2wait: u16,
    pub async_drop_time2retain: u16,
    pub async_vcode: u8,
    pub async_text_timeout: u16,
    /// Never set the T bit in Login Responses
    pub disable_t_bit: bool,
    /// Split Login/Text responses above this many bytes
    pub split_pdu_at: Option<usize>,
    /// Extra MaxCmdSN headroom
    pub max_cmd_sn_delta: u32,
    /// Send an unsolicited NOP-In (consumed when sent)
    pub send_nopin: bool,
}

fn parse_flag(value: &str) -> ScsiResult<bool> {
    match value.to_lowercase().as_str() {
        "1" | "yes" | "true" | "on" => Ok(true),
        "0" | "no" | "false" | "off" => Ok(false),
        _ => Err(IscsiError::Config(format!("invalid boolean '{}'", value))),
    }
}

fn parse_u32(name: &str, value: &str) -> ScsiResult<u32> {
    parse_number(value).ok_or_else(|| IscsiError::Config(format!("invalid value '{}' for {}", value, name)))
}

fn parse_u16(name: &str, value: &str) -> ScsiResult<u16> {
    u16::try_from(parse_u32(name, value)?)
        .map_err(|_| IscsiError::Config(format!("{} out of range: {}", name, value)))
}

impl Customization {
    /// Set a knob from its textual name and value
    pub fn set(&mut self, name: &str, value: &str) -> ScsiResult<()> {
        match name {
            "reject" => self.reject = parse_flag(value)?,
            "CHAP_I" | "chap_i" => {
                self.chap_i = if value.is_empty() {
                    None
                } else {
                    let id = parse_u32(name, value)?;
                    Some(u8::try_from(id).map_err(|_| IscsiError::Config(format!("CHAP_I out of range: {}", id)))?)
                }
            }
            "send_async" => self.send_async = Some(value.parse()?),
            "async_logout_timeout" => self.async_logout_timeout = parse_u16(name, value)?,
            "async_drop_time2wait" => self.async_drop_time2wait = parse_u16(name, value)?,
            "async_drop_time2retain" => self.async_drop_time2retain = parse_u16(name, value)?,
            "async_vcode" => {
                self.async_vcode = u8::try_from(parse_u32(name, value)?)
                    .map_err(|_| IscsiError::Config(format!("async_vcode out of range: {}", value)))?
            }
            "async_text_timeout" => self.async_text_timeout = parse_u16(name, value)?,
            "disable_t_bit" => self.disable_t_bit = parse_flag(value)?,
            "split_pdu_at" => {
                let n = parse_u32(name, value)? as usize;
                self.split_pdu_at = if n == 0 { None } else { Some(n) };
            }
            "max_cmd_sn_delta" => self.max_cmd_sn_delta = parse_u32(name, value)?,
            "send_nopin" => self.send_nopin = parse_flag(value)?,
            other => return Err(IscsiError::Config(format!("unknown customization '{}'", other))),
        }
        Ok(())
    }

    pub fn async_params(&self) -> AsyncParams {
        AsyncParams {
            logout_timeout: self.async_logout_timeout,
            drop_time2wait: self.async_drop_time2wait,
            drop_time2retain: self.async_drop_time2retain,
            text_timeout: self.async_text_timeout,
            vcode: self.async_vcode,
        }
    }
}

/// One-shot requests picked up by a connection's manager thread
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingActions {
    pub send_async: Option<AsyncEvent>,
    pub send_nopin: bool,
}

#[derive(Debug, Default)]
struct SlotState {
    custom: Customization,
    generation: u64,
    closed: bool,
}

/// Customization of one connection plus its wake-up signal
#[derive(Debug, Default)]
pub struct CustomSlot {
    state: Mutex<SlotState>,
    wake: Condvar,
}

impl CustomSlot {
    fn new(custom: Customization) -> Self {
        CustomSlot {
            state: Mutex::new(SlotState {
                custom,
                generation: 0,
                closed: false,
            }),
            wake: Condvar::new(),
        }
    }

    pub fn snapshot(&self) -> Customization {
        self.state.lock().map(|s| s.custom.clone()).unwrap_or_default()
    }

    pub fn set(&self, name: &str, value: &str) -> ScsiResult<()> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| IscsiError::Config("customization lock poisoned".to_string()))?;
        state.custom.set(name, value)?;
        state.generation += 1;
        self.wake.notify_all();
        Ok(())
    }

    /// Wake the waiting manager thread without changing anything
    pub fn notify(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.generation += 1;
        }
        self.wake.notify_all();
    }

    /// Take the one-shot requests, clearing them
    pub fn take_pending(&self) -> PendingActions {
        match self.state.lock() {
            Ok(mut state) => PendingActions {
                send_async: state.custom.send_async.take(),
                send_nopin: std::mem::take(&mut state.custom.send_nopin),
            },
            Err(_) => PendingActions::default(),
        }
    }

    /// Block until the generation moves past `seen`, the slot closes or
    /// `timeout` elapses. Returns the current generation, or `None` once
    /// closed.
    pub fn wait(&self, seen: u64, timeout: Duration) -> Option<u64> {
        let guard = self.state.lock().ok()?;
        let (guard, _) = self
            .wake
            .wait_timeout_while(guard, timeout, |s| s.generation == seen && !s.closed)
            .ok()?;
        if guard.closed {
            None
        } else {
            Some(guard.generation)
        }
    }

    pub fn close(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.closed = true;
        }
        self.wake.notify_all();
    }
}

/// Customizations of all live connections
#[derive(Debug, Default)]
pub struct CustomRegistry {
    defaults: Mutex<Customization>,
    slots: Mutex<HashMap<OwnerId, Arc<CustomSlot>>>,
}

impl CustomRegistry {
    pub fn new(defaults: Customization) -> Self {
        CustomRegistry {
            defaults: Mutex::new(defaults),
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Create the slot of a new connection from the current defaults
    pub fn register(&self, owner: OwnerId) -> Arc<CustomSlot> {
        let defaults = self.defaults.lock().map(|d| d.clone()).unwrap_or_default();
        let slot = Arc::new(CustomSlot::new(defaults));
        if let Ok(mut slots) = self.slots.lock() {
            slots.insert(owner, Arc::clone(&slot));
        }
        slot
    }

    pub fn unregister(&self, owner: OwnerId) {
        let removed = self.slots.lock().ok().and_then(|mut slots| slots.remove(&owner));
        if let Some(slot) = removed {
            slot.close();
        }
    }

    pub fn slot(&self, owner: OwnerId) -> Option<Arc<CustomSlot>> {
        self.slots.lock().ok()?.get(&owner).cloned()
    }

    pub fn owners(&self) -> Vec<OwnerId> {
        let mut owners: Vec<OwnerId> = self
            .slots
            .lock()
            .map(|s| s.keys().copied().collect())
            .unwrap_or_default();
        owners.sort_unstable();
        owners
    }

    /// Set a knob on one connection, or with `None` on every connection and
    /// on the defaults for connections yet to come. Returns how many live
    /// connections were updated.
    pub fn set(&self, owner: Option<OwnerId>, name: &str, value: &str) -> ScsiResult<usize> {
        match owner {
            Some(owner) => {
                let slot = self
                    .slot(owner)
                    .ok_or_else(|| IscsiError::Config(format!("no connection {}", owner)))?;
                slot.set(name, value)?;
                Ok(1)
            }
            None => {
                {
                    let mut defaults = self
                        .defaults
                        .lock()
                        .map_err(|_| IscsiError::Config("customization lock poisoned".to_string()))?;
                    defaults.set(name, value)?;
                    // One-shot requests only make sense for live connections
                    defaults.send_async = None;
                    defaults.send_nopin = false;
                }
                let slots: Vec<Arc<CustomSlot>> = self
                    .slots
                    .lock()
                    .map(|s| s.values().cloned().collect())
                    .unwrap_or_default();
                for slot in &slots {
                    slot.set(name, value)?;
                }
                log::debug!("customization {}={} broadcast to {} connections", name, value, slots.len());
                Ok(slots.len())
            }
        }
    }
}

// ============================================================================
// Target configuration
// ============================================================================

/// Static configuration of a target
#[derive(Clone)]
pub struct TargetConfig {
    pub bind_addr: String,
    pub target_name: String,
    pub target_alias: Option<String>,
    pub portal_group_tag: u16,
    pub auth: AuthConfig,
    pub srp: Option<Arc<dyn SrpAuthenticator>>,
    /// Template overrides applied to every connection's key table
    pub param_overrides: Vec<(String, String)>,
    /// Initial customization of new connections
    pub custom: Customization,
}

impl std::fmt::Debug for TargetConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TargetConfig")
            .field("bind_addr", &self.bind_addr)
            .field("target_name", &self.target_name)
            .field("target_alias", &self.target_alias)
            .field("portal_group_tag", &self.portal_group_tag)
            .field("auth", &self.auth.auth_method())
            .field("srp", &self.srp.is_some())
            .field("param_overrides", &self.param_overrides)
            .finish()
    }
}

impl TargetConfig {
    pub fn builder() -> TargetConfigBuilder {
        TargetConfigBuilder::new()
    }

    /// Key table a new connection starts from
    pub fn param_table(&self) -> ScsiResult<ParamTable> {
        let mut table = ParamTable::template();
        table.set_local(key::AUTH_METHOD, &self.auth.acceptable_methods(self.srp.is_some()))?;
        table.set_local(key::TARGET_PORTAL_GROUP_TAG, &self.portal_group_tag.to_string())?;
        if let Some(alias) = &self.target_alias {
            table.set_local(key::TARGET_ALIAS, alias)?;
        }
        for (name, value) in &self.param_overrides {
            table.set_local(name, value)?;
        }
        Ok(table)
    }
}

/// Builder for [`TargetConfig`]
#[derive(Default)]
pub struct TargetConfigBuilder {
    bind_addr: Option<String>,
    port: Option<String>,
    target_name: Option<String>,
    target_alias: Option<String>,
    portal_group_tag: Option<u16>,
    auth: AuthConfig,
    srp: Option<Arc<dyn SrpAuthenticator>>,
    param_overrides: Vec<(String, String)>,
    custom: Customization,
}

impl TargetConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the bind address (default: 0.0.0.0:3260)
    pub fn bind_addr(mut self, addr: &str) -> Self {
        self.bind_addr = Some(addr.to_string());
        self
    }

    /// Override the port, as a number or "iscsi-target" / "iscsi"
    pub fn port(mut self, port: &str) -> Self {
        self.port = Some(port.to_string());
        self
    }

    /// Set the iSCSI target name
    ///
    /// Example: iqn.2004-01.com:target.disk1
    pub fn target_name(mut self, name: &str) -> Self {
        self.target_name = Some(name.to_string());
        self
    }

    pub fn target_alias(mut self, alias: &str) -> Self {
        self.target_alias = Some(alias.to_string());
        self
    }

    pub fn portal_group_tag(mut self, tpgt: u16) -> Self {
        self.portal_group_tag = Some(tpgt);
        self
    }

    pub fn auth(mut self, auth: AuthConfig) -> Self {
        self.auth = auth;
        self
    }

    pub fn srp_authenticator(mut self, srp: Arc<dyn SrpAuthenticator>) -> Self {
        self.srp = Some(srp);
        self
    }

    /// Override what the target offers for an iSCSI key
    pub fn with_param(mut self, name: &str, value: &str) -> Self {
        self.param_overrides.push((name.to_string(), value.to_string()));
        self
    }

    pub fn customization(mut self, custom: Customization) -> Self {
        self.custom = custom;
        self
    }

    pub fn build(self) -> ScsiResult<TargetConfig> {
        let mut bind_addr = normalize_bind_addr(self.bind_addr.as_deref().unwrap_or("0.0.0.0:3260"))?;
        if let Some(port) = &self.port {
            let host = bind_addr.rsplit_once(':').map(|(h, _)| h.to_string()).unwrap_or_default();
            bind_addr = format!("{}:{}", host, resolve_port(port)?);
        }

        let target_name = self.target_name.unwrap_or_else(|| DEFAULT_TARGET_NAME.to_string());
        if !check_iscsi_name(&target_name) {
            return Err(IscsiError::Config(format!(
                "target name '{}' is not a valid iqn. or eui. name",
                target_name
            )));
        }

        let config = TargetConfig {
            bind_addr,
            target_name,
            target_alias: self.target_alias,
            portal_group_tag: self.portal_group_tag.unwrap_or(1),
            auth: self.auth,
            srp: self.srp,
            param_overrides: self.param_overrides,
            custom: self.custom,
        };

        // Catch bad overrides now rather than at the first login
        config.param_table()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::ChapCredentials;

    #[test]
    fn test_resolve_port() {
        assert_eq!(resolve_port("3260").unwrap(), 3260);
        assert_eq!(resolve_port("860").unwrap(), 860);
        assert_eq!(resolve_port("iscsi-target").unwrap(), 3260);
        assert_eq!(resolve_port("iscsi").unwrap(), 860);
        assert!(resolve_port("http").is_err());
    }

    #[test]
    fn test_builder_defaults() {
        let config = TargetConfig::builder().build().unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:3260");
        assert_eq!(config.target_name, DEFAULT_TARGET_NAME);
        assert_eq!(config.portal_group_tag, 1);
        assert!(!config.auth.requires_auth());
    }

    #[test]
    fn test_builder_port_override() {
        let config = TargetConfig::builder()
            .bind_addr("127.0.0.1:3260")
            .port("iscsi")
            .build()
            .unwrap();
        assert_eq!(config.bind_addr, "127.0.0.1:860");

        let config = TargetConfig::builder().bind_addr("127.0.0.1").build().unwrap();
        assert_eq!(config.bind_addr, "127.0.0.1:3260");
    }

    #[test]
    fn test_invalid_target_name() {
        assert!(TargetConfig::builder().target_name("storage.disk1").build().is_err());
        assert!(TargetConfig::builder().target_name("eui.0123456789ABCDEF").build().is_ok());
    }

    #[test]
    fn test_param_table_from_config() {
        let config = TargetConfig::builder()
            .auth(AuthConfig::Chap {
                credentials: ChapCredentials::new("user", "secretsecret"),
            })
            .target_alias("disk")
            .portal_group_tag(7)
            .with_param("MaxBurstLength", "131072")
            .build()
            .unwrap();
        let table = config.param_table().unwrap();
        assert_eq!(table.get(key::AUTH_METHOD).unwrap().local, "CHAP");
        assert_eq!(table.get(key::TARGET_PORTAL_GROUP_TAG).unwrap().local, "7");
        assert_eq!(table.get(key::TARGET_ALIAS).unwrap().local, "disk");
        assert_eq!(table.get(key::MAX_BURST_LENGTH).unwrap().local, "131072");
    }

    #[test]
    fn test_bad_override_rejected() {
        assert!(TargetConfig::builder().with_param("MaxBurstLength", "7").build().is_err());
        assert!(TargetConfig::builder().with_param("NoSuchKey", "1").build().is_err());
    }

    #[test]
    fn test_verbosity() {
        assert_eq!("silent".parse::<Verbosity>().unwrap().level_filter(), log::LevelFilter::Off);
        assert_eq!("PrintAll".parse::<Verbosity>().unwrap().level_filter(), log::LevelFilter::Trace);
        assert_eq!(Verbosity::default().level_filter(), log::LevelFilter::Warn);
        assert!("loud".parse::<Verbosity>().is_err());
    }

    #[test]
    fn test_customization_set() {
        let mut c = Customization::default();
        c.set("reject", "yes").unwrap();
        c.set("CHAP_I", "42").unwrap();
        c.set("send_async", "drop_connection").unwrap();
        c.set("async_drop_time2wait", "5").unwrap();
        c.set("split_pdu_at", "100").unwrap();
        c.set("max_cmd_sn_delta", "0x10").unwrap();
        assert!(c.reject);
        assert_eq!(c.chap_i, Some(42));
        assert_eq!(c.send_async, Some(AsyncEvent::DropConnection));
        assert_eq!(c.async_params().drop_time2wait, 5);
        assert_eq!(c.split_pdu_at, Some(100));
        assert_eq!(c.max_cmd_sn_delta, 16);

        assert!(c.set("CHAP_I", "300").is_err());
        assert!(c.set("bogus", "1").is_err());
        assert!(c.set("disable_t_bit", "maybe").is_err());
    }

    #[test]
    fn test_registry_broadcast_and_defaults() {
        let registry = CustomRegistry::new(Customization::default());
        let a = registry.register(1);
        let b = registry.register(2);

        assert_eq!(registry.set(None, "disable_t_bit", "1").unwrap(), 2);
        assert!(a.snapshot().disable_t_bit);
        assert!(b.snapshot().disable_t_bit);
        assert!(registry.register(3).snapshot().disable_t_bit);

        assert_eq!(registry.set(Some(2), "send_nopin", "1").unwrap(), 1);
        assert!(!a.snapshot().send_nopin);
        assert_eq!(b.take_pending().send_nopin, true);
        assert!(!b.snapshot().send_nopin);

        assert!(registry.set(Some(99), "reject", "1").is_err());
        registry.unregister(1);
        assert_eq!(registry.owners(), vec![2, 3]);
    }

    #[test]
    fn test_slot_wait_wakes() {
        let registry = Arc::new(CustomRegistry::new(Customization::default()));
        let slot = registry.register(1);

        // Nothing changed: times out with the same generation
        assert_eq!(slot.wait(0, Duration::from_millis(10)), Some(0));

        let setter = Arc::clone(&registry);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            setter.set(Some(1), "send_async", "logout_request").unwrap();
        });
        let generation = slot.wait(0, Duration::from_secs(5)).unwrap();
        assert!(generation > 0);
        handle.join().unwrap();
        assert_eq!(slot.take_pending().send_async, Some(AsyncEvent::LogoutRequest));

        slot.close();
        assert_eq!(slot.wait(generation, Duration::from_secs(5)), None);
    }
}
