//! Security negotiation: CHAP (RFC 3720 Section 11.1.4) and the SRP hook
//!
//! The CHAP arithmetic lives here; SRP is delegated to an installed
//! [`SrpAuthenticator`]. [`SecurityNegotiator`] walks the security
//! sub-phase one step per batch of CHAP_*/SRP_* keys.

use crate::error::{IscsiError, ScsiResult};
use crate::pdu::login_status;
use rand::Rng;
use std::sync::Arc;

/// CHAP algorithm identifier (RFC 1994)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChapAlgorithm {
    /// MD5 algorithm (algorithm identifier 5)
    Md5 = 5,
}

impl ChapAlgorithm {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim() {
            "5" => Some(ChapAlgorithm::Md5),
            _ => None,
        }
    }
}

/// CHAP credentials for authentication
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChapCredentials {
    /// Username for CHAP authentication
    pub username: String,
    /// Secret/password for CHAP authentication
    pub secret: String,
}

impl ChapCredentials {
    pub fn new(username: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            secret: secret.into(),
        }
    }
}

/// Authentication configuration
#[derive(Debug, Clone, Default)]
pub enum AuthConfig {
    /// No authentication required
    #[default]
    None,
    /// CHAP authentication (one-way: initiator authenticates to target)
    Chap {
        /// Credentials the initiator must present
        credentials: ChapCredentials,
    },
    /// Mutual CHAP (two-way: both initiator and target authenticate)
    MutualChap {
        /// Credentials the initiator must present
        target_credentials: ChapCredentials,
        /// Credentials the target answers the initiator's challenge with
        initiator_credentials: ChapCredentials,
    },
}

impl AuthConfig {
    /// Check if authentication is required
    pub fn requires_auth(&self) -> bool {
        !matches!(self, AuthConfig::None)
    }

    /// Get the authentication method string
    pub fn auth_method(&self) -> &str {
        match self {
            AuthConfig::None => "None",
            AuthConfig::Chap { .. } | AuthConfig::MutualChap { .. } => "CHAP",
        }
    }

    /// Check if mutual CHAP is required
    pub fn is_mutual(&self) -> bool {
        matches!(self, AuthConfig::MutualChap { .. })
    }

    /// AuthMethod values acceptable to the target
    pub fn acceptable_methods(&self, srp_available: bool) -> String {
        let mut methods = vec![self.auth_method()];
        if srp_available {
            methods.insert(0, "SRP");
        }
        methods.join(",")
    }

    fn expected_initiator(&self) -> Option<&ChapCredentials> {
        match self {
            AuthConfig::None => None,
            AuthConfig::Chap { credentials } => Some(credentials),
            AuthConfig::MutualChap {
                target_credentials, ..
            } => Some(target_credentials),
        }
    }
}

/// CHAP challenge issued by one side
#[derive(Debug, Clone)]
pub struct ChapAuthState {
    /// CHAP identifier
    pub identifier: u8,
    /// CHAP challenge bytes
    pub challenge: Vec<u8>,
}

impl ChapAuthState {
    /// Generate a new random identifier and 16-byte challenge
    pub fn new() -> Self {
        let mut rng = rand::thread_rng();
        let identifier = rng.gen::<u8>();
        let mut challenge = vec![0u8; 16];
        rng.fill(&mut challenge[..]);

        Self {
            identifier,
            challenge,
        }
    }

    /// Build from a known identifier and challenge (the peer's, for mutual CHAP)
    pub fn from_parts(identifier: u8, challenge: Vec<u8>) -> Self {
        Self {
            identifier,
            challenge,
        }
    }

    /// Response = MD5(identifier + secret + challenge)
    pub fn calculate_response(&self, secret: &str) -> Vec<u8> {
        let mut data = Vec::with_capacity(1 + secret.len() + self.challenge.len());
        data.push(self.identifier);
        data.extend_from_slice(secret.as_bytes());
        data.extend_from_slice(&self.challenge);

        md5::compute(&data).0.to_vec()
    }

    /// Validate a CHAP response
    pub fn validate_response(&self, response: &[u8], secret: &str) -> bool {
        let expected = self.calculate_response(secret);
        if response.len() != expected.len() {
            return false;
        }

        // Constant-time comparison
        let mut diff = 0u8;
        for (a, b) in response.iter().zip(expected.iter()) {
            diff |= a ^ b;
        }
        diff == 0
    }

    /// Challenge as a `0x`-prefixed hex text value
    pub fn challenge_hex(&self) -> String {
        format!("0x{}", hex::encode(&self.challenge))
    }

    pub fn identifier_str(&self) -> String {
        self.identifier.to_string()
    }
}

impl Default for ChapAuthState {
    fn default() -> Self {
        Self::new()
    }
}

/// Decode a CHAP binary value (`0x` hex, prefix optional)
pub fn parse_chap_binary(value: &str) -> ScsiResult<Vec<u8>> {
    let digits = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value);
    hex::decode(digits).map_err(|e| IscsiError::Auth(format!("Invalid CHAP value hex: {}", e)))
}

/// Format bytes as a CHAP binary value
pub fn format_chap_binary(bytes: &[u8]) -> String {
    format!("0x{}", hex::encode(bytes))
}

/// Keys belonging to the security sub-phase
pub fn is_security_key(key: &str) -> bool {
    key.starts_with("CHAP_") || key.starts_with("SRP_") || key == "TargetAuth"
}

/// Secure Remote Password exchange, implemented outside this crate
///
/// The negotiator only moves the SRP keys between the wire and these
/// calls; any error fails the login as an authentication failure.
pub trait SrpAuthenticator: Send + Sync {
    /// Given SRP_U, return the acceptable SRP_GROUP list and the salt SRP_s
    fn begin(&self, user: &str) -> ScsiResult<(String, String)>;

    /// Given the chosen SRP_GROUP and SRP_A, return SRP_B
    fn exchange(&self, user: &str, group: &str, a: &str) -> ScsiResult<String>;

    /// Verify SRP_M and return SRP_HM
    fn verify(&self, user: &str, m: &str) -> ScsiResult<String>;
}

/// Steps of the security sub-phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityState {
    Initial,
    FindChapA,
    FindChapNR,
    FindChapIC,
    FindSrpU,
    FindSrpAG,
    FindSrpM,
    Done,
}

/// Security keys seen so far
pub mod got {
    pub const CHAP_A: u16 = 0x0001;
    pub const CHAP_I: u16 = 0x0002;
    pub const CHAP_C: u16 = 0x0004;
    pub const CHAP_N: u16 = 0x0008;
    pub const CHAP_R: u16 = 0x0010;
    pub const SRP_GROUP: u16 = 0x0020;
    pub const SRP_U: u16 = 0x0200;
    pub const TARGET_AUTH: u16 = 0x0400;
    pub const SRP_A: u16 = 0x0800;
    pub const SRP_M: u16 = 0x1000;
}

fn key_bit(key: &str) -> Option<u16> {
    Some(match key {
        "CHAP_A" => got::CHAP_A,
        "CHAP_I" => got::CHAP_I,
        "CHAP_C" => got::CHAP_C,
        "CHAP_N" => got::CHAP_N,
        "CHAP_R" => got::CHAP_R,
        "SRP_GROUP" => got::SRP_GROUP,
        "SRP_U" => got::SRP_U,
        "TargetAuth" => got::TARGET_AUTH,
        "SRP_A" => got::SRP_A,
        "SRP_M" => got::SRP_M,
        _ => return None,
    })
}

fn out_of_step(message: String) -> IscsiError {
    IscsiError::login(login_status::INITIATOR_ERROR, login_status::DETAIL_ERR, message)
}

fn not_auth(message: impl Into<String>) -> IscsiError {
    IscsiError::login(login_status::INITIATOR_ERROR, login_status::DETAIL_NOT_AUTH, message)
}

/// Drives the security sub-phase of one connection
pub struct SecurityNegotiator {
    config: AuthConfig,
    srp: Option<Arc<dyn SrpAuthenticator>>,
    state: SecurityState,
    got: u16,
    identifier_override: Option<u8>,
    chap: Option<ChapAuthState>,
    peer_identifier: Option<u8>,
    peer_challenge: Option<Vec<u8>>,
    chap_name: Option<String>,
    chap_response: Option<Vec<u8>>,
    srp_user: Option<String>,
    srp_group: Option<String>,
    srp_a: Option<String>,
    srp_m: Option<String>,
    target_auth: bool,
}

impl SecurityNegotiator {
    pub fn new(config: AuthConfig, srp: Option<Arc<dyn SrpAuthenticator>>) -> Self {
        SecurityNegotiator {
            config,
            srp,
            state: SecurityState::Initial,
            got: 0,
            identifier_override: None,
            chap: None,
            peer_identifier: None,
            peer_challenge: None,
            chap_name: None,
            chap_response: None,
            srp_user: None,
            srp_group: None,
            srp_a: None,
            srp_m: None,
            target_auth: false,
        }
    }

    /// Use a fixed CHAP_I instead of a random one
    pub fn with_identifier(mut self, identifier: Option<u8>) -> Self {
        self.identifier_override = identifier;
        self
    }

    pub fn state(&self) -> SecurityState {
        self.state
    }

    pub fn is_done(&self) -> bool {
        self.state == SecurityState::Done
    }

    /// Whether an authentication method still requires key exchanges
    pub fn in_progress(&self) -> bool {
        !matches!(self.state, SecurityState::Initial | SecurityState::Done)
    }

    /// Whether leaving the security stage is allowed
    pub fn may_leave(&self) -> bool {
        !self.in_progress() && (self.is_done() || !self.config.requires_auth())
    }

    /// Enter the sub-phase for the negotiated AuthMethod
    pub fn start(&mut self, method: &str) -> ScsiResult<()> {
        if self.state != SecurityState::Initial {
            return Ok(());
        }
        self.state = match method {
            "CHAP" => SecurityState::FindChapA,
            "SRP" if self.srp.is_some() => SecurityState::FindSrpU,
            "None" if !self.config.requires_auth() => SecurityState::Done,
            other => return Err(not_auth(format!("AuthMethod {} not acceptable", other))),
        };
        log::debug!("security negotiation using {} -> {:?}", method, self.state);
        Ok(())
    }

    fn allowed_in_state(&self, bit: u16) -> bool {
        let mask = match self.state {
            SecurityState::FindChapA => got::CHAP_A,
            SecurityState::FindChapNR => got::CHAP_N | got::CHAP_R | got::CHAP_I | got::CHAP_C,
            SecurityState::FindChapIC => got::CHAP_I | got::CHAP_C,
            SecurityState::FindSrpU => got::SRP_U | got::TARGET_AUTH,
            SecurityState::FindSrpAG => got::SRP_A | got::SRP_GROUP,
            SecurityState::FindSrpM => got::SRP_M,
            SecurityState::Initial | SecurityState::Done => 0,
        };
        mask & bit != 0
    }

    /// Consume one batch of security keys and return the replies
    pub fn process(&mut self, keys: &[(String, String)]) -> ScsiResult<Vec<(String, String)>> {
        let mut replies = Vec::new();

        for (name, value) in keys {
            let bit = key_bit(name)
                .ok_or_else(|| out_of_step(format!("unsupported security key {}", name)))?;
            if self.got & bit != 0 {
                return Err(out_of_step(format!("security key {} received twice", name)));
            }
            if !self.allowed_in_state(bit) {
                return Err(out_of_step(format!(
                    "security key {} not expected in state {:?}",
                    name, self.state
                )));
            }
            self.got |= bit;
            self.record(name, value)?;
        }

        self.advance(&mut replies)?;
        Ok(replies)
    }

    fn record(&mut self, name: &str, value: &str) -> ScsiResult<()> {
        match name {
            "CHAP_A" => {
                if !value.split(',').any(|a| ChapAlgorithm::from_str(a).is_some()) {
                    return Err(not_auth(format!("no supported CHAP algorithm in '{}'", value)));
                }
            }
            "CHAP_N" => self.chap_name = Some(value.to_string()),
            "CHAP_R" => self.chap_response = Some(parse_chap_binary(value).map_err(|e| not_auth(e.to_string()))?),
            "CHAP_I" => {
                let id = value
                    .parse::<u8>()
                    .map_err(|_| not_auth(format!("invalid CHAP_I '{}'", value)))?;
                self.peer_identifier = Some(id);
            }
            "CHAP_C" => self.peer_challenge = Some(parse_chap_binary(value).map_err(|e| not_auth(e.to_string()))?),
            "SRP_U" => self.srp_user = Some(value.to_string()),
            "TargetAuth" => self.target_auth = value == "Yes",
            "SRP_GROUP" => self.srp_group = Some(value.to_string()),
            "SRP_A" => self.srp_a = Some(value.to_string()),
            "SRP_M" => self.srp_m = Some(value.to_string()),
            _ => {}
        }
        Ok(())
    }

    fn advance(&mut self, replies: &mut Vec<(String, String)>) -> ScsiResult<()> {
        loop {
            let next = match self.state {
                SecurityState::FindChapA if self.got & got::CHAP_A != 0 => {
                    let mut chap = ChapAuthState::new();
                    if let Some(id) = self.identifier_override {
                        chap.identifier = id;
                    }
                    replies.push(("CHAP_A".to_string(), (ChapAlgorithm::Md5 as u8).to_string()));
                    replies.push(("CHAP_I".to_string(), chap.identifier_str()));
                    replies.push(("CHAP_C".to_string(), chap.challenge_hex()));
                    self.chap = Some(chap);
                    SecurityState::FindChapNR
                }
                SecurityState::FindChapNR
                    if self.got & (got::CHAP_N | got::CHAP_R) == (got::CHAP_N | got::CHAP_R) =>
                {
                    self.verify_initiator()?;
                    let wants_mutual = self.got & (got::CHAP_I | got::CHAP_C) != 0;
                    if wants_mutual && !self.config.is_mutual() {
                        return Err(not_auth("initiator requested mutual CHAP, not configured"));
                    }
                    if self.config.is_mutual() {
                        SecurityState::FindChapIC
                    } else {
                        SecurityState::Done
                    }
                }
                SecurityState::FindChapIC
                    if self.got & (got::CHAP_I | got::CHAP_C) == (got::CHAP_I | got::CHAP_C) =>
                {
                    self.answer_initiator(replies)?;
                    SecurityState::Done
                }
                SecurityState::FindSrpU if self.got & got::SRP_U != 0 => {
                    let user = self.srp_user.clone().unwrap_or_default();
                    let (groups, salt) = self.srp()?.begin(&user).map_err(|e| not_auth(e.to_string()))?;
                    replies.push(("SRP_GROUP".to_string(), groups));
                    replies.push(("SRP_s".to_string(), salt));
                    SecurityState::FindSrpAG
                }
                SecurityState::FindSrpAG
                    if self.got & (got::SRP_A | got::SRP_GROUP) == (got::SRP_A | got::SRP_GROUP) =>
                {
                    let user = self.srp_user.clone().unwrap_or_default();
                    let group = self.srp_group.clone().unwrap_or_default();
                    let a = self.srp_a.clone().unwrap_or_default();
                    let b = self.srp()?.exchange(&user, &group, &a).map_err(|e| not_auth(e.to_string()))?;
                    replies.push(("SRP_B".to_string(), b));
                    SecurityState::FindSrpM
                }
                SecurityState::FindSrpM if self.got & got::SRP_M != 0 => {
                    let user = self.srp_user.clone().unwrap_or_default();
                    let m = self.srp_m.clone().unwrap_or_default();
                    let hm = self.srp()?.verify(&user, &m).map_err(|e| not_auth(e.to_string()))?;
                    if self.target_auth {
                        replies.push(("SRP_HM".to_string(), hm));
                    }
                    log::info!("SRP authentication of '{}' succeeded", user);
                    SecurityState::Done
                }
                _ => return Ok(()),
            };

            log::debug!("security state {:?} -> {:?}", self.state, next);
            self.state = next;
        }
    }

    fn srp(&self) -> ScsiResult<Arc<dyn SrpAuthenticator>> {
        self.srp
            .clone()
            .ok_or_else(|| not_auth("SRP requested but no authenticator installed"))
    }

    fn verify_initiator(&self) -> ScsiResult<()> {
        let expected = self
            .config
            .expected_initiator()
            .ok_or_else(|| not_auth("CHAP not configured"))?;
        let chap = self.chap.as_ref().ok_or_else(|| not_auth("no CHAP challenge issued"))?;

        if self.chap_name.as_deref() != Some(expected.username.as_str()) {
            return Err(not_auth(format!(
                "CHAP_N '{}' does not match",
                self.chap_name.as_deref().unwrap_or_default()
            )));
        }
        let response = self.chap_response.as_deref().unwrap_or_default();
        if !chap.validate_response(response, &expected.secret) {
            return Err(not_auth("CHAP_R mismatch"));
        }
        log::info!("CHAP authentication of '{}' succeeded", expected.username);
        Ok(())
    }

    fn answer_initiator(&self, replies: &mut Vec<(String, String)>) -> ScsiResult<()> {
        let AuthConfig::MutualChap {
            initiator_credentials,
            ..
        } = &self.config
        else {
            return Err(not_auth("mutual CHAP not configured"));
        };
        let (Some(id), Some(challenge)) = (self.peer_identifier, self.peer_challenge.clone()) else {
            return Err(not_auth("CHAP_I/CHAP_C missing"));
        };

        if let Some(ours) = &self.chap {
            if ours.challenge == challenge {
                return Err(not_auth("initiator reflected the target challenge"));
            }
        }

        let peer = ChapAuthState::from_parts(id, challenge);
        replies.push(("CHAP_N".to_string(), initiator_credentials.username.clone()));
        replies.push((
            "CHAP_R".to_string(),
            format_chap_binary(&peer.calculate_response(&initiator_credentials.secret)),
        ));
        Ok(())
    }
}
