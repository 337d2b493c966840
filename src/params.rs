//! Login key negotiation
//!
//! A table of every negotiable key (RFC 3720 Section 12) with its
//! selection function, legal use and per-login negotiation state. Each
//! connection clones the process-wide template, negotiates on its copy,
//! and commits the outcome into [`SessionParams`] when it enters Full
//! Feature Phase.

use crate::error::{IscsiError, ScsiResult};
use crate::pdu::{login_status, stage};
use crate::session::{DigestType, SessionParams, SessionType};

/// Longest key name accepted
pub const MAX_KEY_LEN: usize = 63;
/// Longest value before a warning is logged
pub const MAX_VALUE_LEN: usize = 255;
/// Longest iSCSI name accepted
pub const MAX_NAME_LEN: usize = 223;
/// Unknown keys tolerated in one login before the connection fails
pub const MAX_UNKNOWN_KEYS: usize = 32;

pub const YES: &str = "Yes";
pub const NO: &str = "No";
pub const REJECT: &str = "Reject";
pub const IRRELEVANT: &str = "Irrelevant";
pub const NOT_UNDERSTOOD: &str = "NotUnderstood";

/// Key names (RFC 3720 Section 12)
pub mod key {
    pub const HEADER_DIGEST: &str = "HeaderDigest";
    pub const DATA_DIGEST: &str = "DataDigest";
    pub const MAX_CONNECTIONS: &str = "MaxConnections";
    pub const SEND_TARGETS: &str = "SendTargets";
    pub const TARGET_NAME: &str = "TargetName";
    pub const INITIATOR_NAME: &str = "InitiatorName";
    pub const TARGET_ALIAS: &str = "TargetAlias";
    pub const INITIATOR_ALIAS: &str = "InitiatorAlias";
    pub const TARGET_ADDRESS: &str = "TargetAddress";
    pub const TARGET_PORTAL_GROUP_TAG: &str = "TargetPortalGroupTag";
    pub const INITIAL_R2T: &str = "InitialR2T";
    pub const IMMEDIATE_DATA: &str = "ImmediateData";
    pub const MAX_RECV_DATA_SEGMENT_LENGTH: &str = "MaxRecvDataSegmentLength";
    pub const MAX_BURST_LENGTH: &str = "MaxBurstLength";
    pub const FIRST_BURST_LENGTH: &str = "FirstBurstLength";
    pub const DEFAULT_TIME2WAIT: &str = "DefaultTime2Wait";
    pub const DEFAULT_TIME2RETAIN: &str = "DefaultTime2Retain";
    pub const MAX_OUTSTANDING_R2T: &str = "MaxOutstandingR2T";
    pub const DATA_PDU_IN_ORDER: &str = "DataPDUInOrder";
    pub const DATA_SEQUENCE_IN_ORDER: &str = "DataSequenceInOrder";
    pub const ERROR_RECOVERY_LEVEL: &str = "ErrorRecoveryLevel";
    pub const SESSION_TYPE: &str = "SessionType";
    pub const AUTH_METHOD: &str = "AuthMethod";
    pub const IF_MARKER: &str = "IFMarker";
    pub const OF_MARKER: &str = "OFMarker";
    pub const IF_MARK_INT: &str = "IFMarkInt";
    pub const OF_MARK_INT: &str = "OFMarkInt";
}

/// Which side may send a key and when
pub mod usage {
    pub const INITIATOR_SENDS: u8 = 0x01;
    pub const TARGET_SENDS: u8 = 0x02;
    /// Session-wide, only negotiated on the leading connection
    pub const LEADING_ONLY: u8 = 0x04;
    /// Only valid in the first Login Request of a connection
    pub const INITIAL_ONLY: u8 = 0x08;
    /// Each side states its own value; no reply is sent
    pub const DECLARATIVE: u8 = 0x10;
    /// Only meaningful in Full Feature Phase Text exchanges
    pub const FULL_FEATURE_ONLY: u8 = 0x20;
}

/// Negotiation state bits of a key
pub mod neg {
    pub const TO_BE_NEGOTIATED: u8 = 0x01;
    pub const SENT: u8 = 0x02;
    pub const GOT: u8 = 0x04;
    pub const REPLY_OPTIONAL: u8 = 0x08;
    pub const IRRELEVANT: u8 = 0x10;
    pub const BAD: u8 = 0x20;
    pub const REJECT: u8 = 0x40;
    pub const WRONG: u8 = 0x80;
}

/// Key category
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyClass {
    Security,
    Operational,
    Informational,
}

/// Selection function of a key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rule {
    /// Boolean, result is Yes only when both sides say Yes
    And,
    /// Boolean, result is Yes when either side says Yes
    Or,
    /// Numeric, the smaller value wins
    Min { lo: u32, hi: u32 },
    /// Numeric, the larger value wins
    Max { lo: u32, hi: u32 },
    /// Offer is `lower~upper`, reply is one number inside it
    Range { lo: u32, hi: u32 },
    /// Numeric, each side declares its own value
    Declarative { lo: u32, hi: u32 },
    /// Comma list of values, first acceptable one wins
    Enumerated,
    /// Free text
    Text,
    /// iSCSI name
    Name,
}

/// One entry of the key table
#[derive(Debug, Clone)]
pub struct KeyDescriptor {
    pub name: &'static str,
    pub class: KeyClass,
    pub rule: Rule,
    pub usage: u8,
    /// Value in force when the key is never negotiated
    pub default: &'static str,
    /// What this side offers or accepts (comma list for enumerated keys)
    pub local: String,
    /// Negotiated (or peer-declared) outcome
    pub result: Option<String>,
    pub state: u8,
}

impl KeyDescriptor {
    fn new(
        name: &'static str,
        class: KeyClass,
        rule: Rule,
        usage: u8,
        default: &'static str,
        local: &str,
    ) -> Self {
        KeyDescriptor {
            name,
            class,
            rule,
            usage,
            default,
            local: local.to_string(),
            result: None,
            state: 0,
        }
    }

    fn negotiating(mut self) -> Self {
        self.state |= neg::TO_BE_NEGOTIATED;
        self
    }

    /// Outcome if negotiated, otherwise the default
    pub fn value(&self) -> &str {
        self.result.as_deref().unwrap_or(self.default)
    }

    pub fn has(&self, bits: u8) -> bool {
        self.state & bits == bits
    }

    fn acceptable(&self) -> impl Iterator<Item = &str> {
        self.local.split(',').map(str::trim).filter(|v| !v.is_empty())
    }

    fn sends_reply(&self) -> bool {
        self.class != KeyClass::Informational && self.usage & usage::DECLARATIVE == 0
    }
}

/// Where in the login a batch of keys arrived
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiationContext {
    /// Current stage (CSG)
    pub stage: u8,
    /// First connection of its session
    pub leading: bool,
}

fn protocol_failure(message: String) -> IscsiError {
    IscsiError::login(login_status::INITIATOR_ERROR, login_status::DETAIL_ERR, message)
}

/// Parse a numeric key value (decimal or 0x-prefixed hex)
pub fn parse_number(value: &str) -> Option<u32> {
    if let Some(hex) = value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).ok()
    } else {
        value.parse().ok()
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value {
        YES => Some(true),
        NO => Some(false),
        _ => None,
    }
}

fn bool_str(v: bool) -> &'static str {
    if v {
        YES
    } else {
        NO
    }
}

/// Check the iSCSI name format: `iqn.YYYY-MM.<reversed domain>[:...]`
/// or `eui.` followed by 16 hex digits
pub fn check_iscsi_name(name: &str) -> bool {
    if name.len() > MAX_NAME_LEN {
        return false;
    }
    if let Some(rest) = name.strip_prefix("iqn.") {
        let b = rest.as_bytes();
        b.len() > 8
            && b[0..4].iter().all(u8::is_ascii_digit)
            && b[4] == b'-'
            && b[5..7].iter().all(u8::is_ascii_digit)
            && b[7] == b'.'
            && b[8..]
                .iter()
                .all(|c| c.is_ascii_digit() || c.is_ascii_lowercase() || b"-.:".contains(c))
    } else if let Some(rest) = name.strip_prefix("eui.") {
        rest.len() == 16 && rest.bytes().all(|c| c.is_ascii_hexdigit())
    } else {
        false
    }
}

/// The negotiable key table of one connection
#[derive(Debug, Clone)]
pub struct ParamTable {
    keys: Vec<KeyDescriptor>,
    unknown: Vec<String>,
}

impl Default for ParamTable {
    fn default() -> Self {
        Self::template()
    }
}

impl ParamTable {
    /// Process-wide template with RFC 3720 defaults
    pub fn template() -> Self {
        use usage::*;
        use KeyClass::*;

        let both = INITIATOR_SENDS | TARGET_SENDS;
        let session = both | LEADING_ONLY;
        let keys = vec![
            KeyDescriptor::new(key::HEADER_DIGEST, Operational, Rule::Enumerated, both, "None", "None,CRC32C"),
            KeyDescriptor::new(key::DATA_DIGEST, Operational, Rule::Enumerated, both, "None", "None,CRC32C"),
            KeyDescriptor::new(key::MAX_CONNECTIONS, Operational, Rule::Min { lo: 1, hi: 65535 }, session, "1", "8"),
            KeyDescriptor::new(key::SEND_TARGETS, Informational, Rule::Text, INITIATOR_SENDS | FULL_FEATURE_ONLY, "", ""),
            KeyDescriptor::new(key::TARGET_NAME, Informational, Rule::Name, both | INITIAL_ONLY | DECLARATIVE, "", ""),
            KeyDescriptor::new(key::INITIATOR_NAME, Informational, Rule::Name, INITIATOR_SENDS | INITIAL_ONLY | DECLARATIVE, "", ""),
            KeyDescriptor::new(key::TARGET_ALIAS, Informational, Rule::Text, TARGET_SENDS | DECLARATIVE, "", ""),
            KeyDescriptor::new(key::INITIATOR_ALIAS, Informational, Rule::Text, INITIATOR_SENDS | DECLARATIVE, "", ""),
            KeyDescriptor::new(key::TARGET_ADDRESS, Informational, Rule::Text, TARGET_SENDS | DECLARATIVE, "", ""),
            KeyDescriptor::new(key::TARGET_PORTAL_GROUP_TAG, Informational, Rule::Declarative { lo: 0, hi: 65535 }, TARGET_SENDS | DECLARATIVE, "1", "1"),
            KeyDescriptor::new(key::INITIAL_R2T, Operational, Rule::And, session, YES, YES),
            KeyDescriptor::new(key::IMMEDIATE_DATA, Operational, Rule::Or, session, YES, YES),
            KeyDescriptor::new(key::MAX_RECV_DATA_SEGMENT_LENGTH, Operational, Rule::Declarative { lo: 512, hi: 16_777_215 }, both | DECLARATIVE, "8192", "8192").negotiating(),
            KeyDescriptor::new(key::MAX_BURST_LENGTH, Operational, Rule::Min { lo: 512, hi: 16_777_215 }, session, "262144", "262144"),
            KeyDescriptor::new(key::FIRST_BURST_LENGTH, Operational, Rule::Min { lo: 512, hi: 16_777_215 }, session, "65536", "65536"),
            KeyDescriptor::new(key::DEFAULT_TIME2WAIT, Operational, Rule::Max { lo: 0, hi: 3600 }, session, "2", "2"),
            KeyDescriptor::new(key::DEFAULT_TIME2RETAIN, Operational, Rule::Min { lo: 0, hi: 3600 }, session, "20", "20"),
            KeyDescriptor::new(key::MAX_OUTSTANDING_R2T, Operational, Rule::Min { lo: 1, hi: 65535 }, session, "1", "1"),
            KeyDescriptor::new(key::DATA_PDU_IN_ORDER, Operational, Rule::Or, session, YES, YES),
            KeyDescriptor::new(key::DATA_SEQUENCE_IN_ORDER, Operational, Rule::Or, session, YES, YES),
            KeyDescriptor::new(key::ERROR_RECOVERY_LEVEL, Operational, Rule::Min { lo: 0, hi: 2 }, session, "0", "0"),
            KeyDescriptor::new(key::SESSION_TYPE, Informational, Rule::Enumerated, INITIATOR_SENDS | LEADING_ONLY | DECLARATIVE, "Normal", "Normal,Discovery"),
            KeyDescriptor::new(key::AUTH_METHOD, Security, Rule::Enumerated, both, "None", "None"),
            KeyDescriptor::new(key::IF_MARKER, Operational, Rule::And, both, NO, NO),
            KeyDescriptor::new(key::OF_MARKER, Operational, Rule::And, both, NO, NO),
            KeyDescriptor::new(key::IF_MARK_INT, Operational, Rule::Range { lo: 1, hi: 65535 }, both, "2048", "2048"),
            KeyDescriptor::new(key::OF_MARK_INT, Operational, Rule::Range { lo: 1, hi: 65535 }, both, "2048", "2048"),
        ];

        ParamTable {
            keys,
            unknown: Vec::new(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&KeyDescriptor> {
        self.keys.iter().find(|k| k.name == name)
    }

    fn get_mut(&mut self, name: &str) -> Option<&mut KeyDescriptor> {
        self.keys.iter_mut().find(|k| k.name == name)
    }

    /// Current value of a key (negotiated outcome or default)
    pub fn value(&self, name: &str) -> Option<&str> {
        self.get(name).map(KeyDescriptor::value)
    }

    pub fn number(&self, name: &str) -> Option<u32> {
        self.value(name).and_then(parse_number)
    }

    pub fn boolean(&self, name: &str) -> bool {
        self.value(name) == Some(YES)
    }

    /// Force a negotiated outcome (used by the login driver for keys it owns)
    pub fn set_result(&mut self, name: &str, value: &str) {
        if let Some(k) = self.get_mut(name) {
            k.result = Some(value.to_string());
        }
    }

    /// Override what this side offers for a key
    ///
    /// Negotiable keys set this way are offered to the initiator during
    /// the operational stage.
    pub fn set_local(&mut self, name: &str, value: &str) -> ScsiResult<()> {
        let k = self
            .get_mut(name)
            .ok_or_else(|| IscsiError::Config(format!("unknown iSCSI key '{}'", name)))?;

        let valid = match k.rule {
            Rule::And | Rule::Or => parse_bool(value).is_some(),
            Rule::Min { lo, hi }
            | Rule::Max { lo, hi }
            | Rule::Range { lo, hi }
            | Rule::Declarative { lo, hi } => {
                parse_number(value).map(|v| v >= lo && v <= hi).unwrap_or(false)
            }
            Rule::Enumerated => !value.trim().is_empty(),
            Rule::Text | Rule::Name => true,
        };
        if !valid {
            return Err(IscsiError::Config(format!(
                "invalid value '{}' for key {}",
                value, name
            )));
        }

        k.local = value.to_string();
        if k.class == KeyClass::Operational {
            k.state |= neg::TO_BE_NEGOTIATED;
        }
        Ok(())
    }

    /// Unknown keys received during this login
    pub fn unknown_keys(&self) -> &[String] {
        &self.unknown
    }

    /// Process a batch of initiator keys and build the replies
    pub fn negotiate(
        &mut self,
        offers: &[(String, String)],
        ctx: NegotiationContext,
    ) -> ScsiResult<Vec<(String, String)>> {
        let mut replies = Vec::new();

        for (name, value) in offers {
            if name.len() > MAX_KEY_LEN {
                return Err(protocol_failure(format!(
                    "key name of {} bytes exceeds {}",
                    name.len(),
                    MAX_KEY_LEN
                )));
            }
            if value.len() > MAX_VALUE_LEN {
                log::warn!("value of {} is {} bytes long", name, value.len());
            }

            let Some(k) = self.get(name) else {
                self.unknown.push(name.clone());
                if self.unknown.len() > MAX_UNKNOWN_KEYS {
                    return Err(protocol_failure(format!(
                        "more than {} unknown keys",
                        MAX_UNKNOWN_KEYS
                    )));
                }
                log::debug!("unknown key {}={}", name, value);
                replies.push((name.clone(), NOT_UNDERSTOOD.to_string()));
                continue;
            };

            if k.has(neg::GOT) {
                return Err(protocol_failure(format!("key {} negotiated twice", name)));
            }
            if k.usage & usage::INITIATOR_SENDS == 0 {
                return Err(protocol_failure(format!(
                    "key {} may only be sent by the target",
                    name
                )));
            }
            if k.class == KeyClass::Security && ctx.stage != stage::SECURITY {
                return Err(protocol_failure(format!(
                    "security key {} outside the security stage",
                    name
                )));
            }

            let irrelevant = (k.usage & usage::LEADING_ONLY != 0 && !ctx.leading)
                || k.usage & usage::FULL_FEATURE_ONLY != 0;
            let is_answer = k.has(neg::SENT) && !matches!(k.rule, Rule::Declarative { .. });

            if irrelevant {
                if let Some(k) = self.get_mut(name) {
                    k.state |= neg::GOT | neg::IRRELEVANT;
                }
                replies.push((name.clone(), IRRELEVANT.to_string()));
                continue;
            }

            if is_answer {
                self.accept_answer(name, value)?;
            } else if let Some(reply) = self.accept_offer(name, value)? {
                replies.push((name.clone(), reply));
            }
        }

        Ok(replies)
    }

    /// Evaluate a new offer from the initiator; returns the reply value
    fn accept_offer(&mut self, name: &str, value: &str) -> ScsiResult<Option<String>> {
        let Some(k) = self.get_mut(name) else {
            return Ok(None);
        };
        k.state |= neg::GOT;

        let outcome: Option<String> = match k.rule {
            Rule::And | Rule::Or => match parse_bool(value) {
                Some(offered) => {
                    let local = parse_bool(&k.local).unwrap_or(false);
                    let (result, optional) = if k.rule == Rule::And {
                        (offered && local, !offered)
                    } else {
                        (offered || local, offered)
                    };
                    if optional {
                        k.state |= neg::REPLY_OPTIONAL;
                    }
                    Some(bool_str(result).to_string())
                }
                None => None,
            },
            Rule::Min { lo, hi } | Rule::Max { lo, hi } => match parse_number(value) {
                Some(offered) if offered >= lo && offered <= hi => {
                    let local = parse_number(&k.local).unwrap_or(offered);
                    let result = if matches!(k.rule, Rule::Min { .. }) {
                        offered.min(local)
                    } else {
                        offered.max(local)
                    };
                    Some(result.to_string())
                }
                _ => None,
            },
            Rule::Range { lo, hi } => {
                let bounds = value
                    .split_once('~')
                    .and_then(|(a, b)| Some((parse_number(a)?, parse_number(b)?)));
                match bounds {
                    Some((a, b)) if a <= b && a >= lo && b <= hi => {
                        let local = parse_number(&k.local).unwrap_or(a);
                        Some(local.clamp(a, b).to_string())
                    }
                    _ => None,
                }
            }
            Rule::Declarative { lo, hi } => match parse_number(value) {
                Some(v) if v >= lo && v <= hi => Some(v.to_string()),
                _ => None,
            },
            Rule::Enumerated => {
                let chosen = value
                    .split(',')
                    .map(str::trim)
                    .find(|offered| k.acceptable().any(|ours| ours == *offered));
                chosen.map(str::to_string)
            }
            Rule::Text => Some(value.to_string()),
            Rule::Name => {
                if value.len() > MAX_NAME_LEN {
                    return Err(protocol_failure(format!(
                        "{} of {} bytes exceeds {}",
                        name,
                        value.len(),
                        MAX_NAME_LEN
                    )));
                }
                if !check_iscsi_name(value) {
                    log::warn!("{} '{}' is not a well-formed iSCSI name", name, value);
                }
                Some(value.to_string())
            }
        };

        match outcome {
            Some(result) => {
                let reply = if k.sends_reply() { Some(result.clone()) } else { None };
                k.result = Some(result);
                Ok(reply)
            }
            None if name == key::SESSION_TYPE => Err(IscsiError::login(
                login_status::INITIATOR_ERROR,
                login_status::DETAIL_SESSION_TYPE_NOT_SUPPORTED,
                format!("session type '{}' not supported", value),
            )),
            None if !k.sends_reply() => Err(protocol_failure(format!(
                "invalid value '{}' for {}",
                value, name
            ))),
            None => {
                log::warn!("rejecting {}={}", name, value);
                k.state |= neg::REJECT;
                Ok(Some(REJECT.to_string()))
            }
        }
    }

    /// Evaluate the initiator's answer to a key this side offered
    fn accept_answer(&mut self, name: &str, value: &str) -> ScsiResult<()> {
        let Some(k) = self.get_mut(name) else {
            return Ok(());
        };
        k.state |= neg::GOT;

        match value {
            IRRELEVANT => {
                k.state |= neg::IRRELEVANT;
                return Ok(());
            }
            REJECT if name == key::IF_MARK_INT || name == key::OF_MARK_INT => {
                k.state |= neg::REJECT;
                let marker = if name == key::IF_MARK_INT {
                    key::IF_MARKER
                } else {
                    key::OF_MARKER
                };
                log::debug!("{} rejected, forcing {}=No", name, marker);
                self.set_result(marker, NO);
                return Ok(());
            }
            REJECT | NOT_UNDERSTOOD => {
                k.state |= neg::BAD;
                return Err(protocol_failure(format!(
                    "initiator answered {} to {}",
                    value, name
                )));
            }
            _ => {}
        }

        let sent = k.local.clone();
        let valid = match k.rule {
            Rule::And => match (parse_bool(&sent), parse_bool(value)) {
                (Some(ours), Some(theirs)) => ours || !theirs,
                _ => false,
            },
            Rule::Or => match (parse_bool(&sent), parse_bool(value)) {
                (Some(ours), Some(theirs)) => !ours || theirs,
                _ => false,
            },
            Rule::Min { lo, .. } => match (parse_number(&sent), parse_number(value)) {
                (Some(ours), Some(theirs)) => theirs >= lo && theirs <= ours,
                _ => false,
            },
            Rule::Max { hi, .. } => match (parse_number(&sent), parse_number(value)) {
                (Some(ours), Some(theirs)) => theirs <= hi && theirs >= ours,
                _ => false,
            },
            Rule::Range { lo, hi } => parse_number(value).map(|v| v >= lo && v <= hi).unwrap_or(false),
            Rule::Enumerated => k.acceptable().any(|ours| ours == value),
            Rule::Declarative { .. } | Rule::Text | Rule::Name => true,
        };

        if !valid {
            k.state |= neg::BAD;
            return Err(protocol_failure(format!(
                "unacceptable answer {}={} to our offer {}",
                name, value, sent
            )));
        }

        k.result = Some(value.to_string());
        Ok(())
    }

    /// Keys this side still has to offer in the given stage; marks them sent
    pub fn pending_offers(&mut self, ctx: NegotiationContext) -> Vec<(String, String)> {
        if ctx.stage != stage::OPERATIONAL {
            return Vec::new();
        }

        let mut offers = Vec::new();
        for k in self.keys.iter_mut() {
            if !k.has(neg::TO_BE_NEGOTIATED) || k.state & (neg::SENT | neg::IRRELEVANT) != 0 {
                continue;
            }
            if k.usage & usage::LEADING_ONLY != 0 && !ctx.leading {
                continue;
            }
            let declarative = matches!(k.rule, Rule::Declarative { .. });
            if k.has(neg::GOT) && !declarative {
                continue;
            }
            k.state |= neg::SENT;
            offers.push((k.name.to_string(), k.local.clone()));
        }
        offers
    }

    /// Whether an offer of ours is still waiting for the initiator's answer
    pub fn awaiting_answers(&self) -> bool {
        self.keys.iter().any(|k| {
            k.has(neg::SENT) && !k.has(neg::GOT) && !matches!(k.rule, Rule::Declarative { .. })
        })
    }

    /// Apply the cross-key rules, adjusting any reply not yet sent
    pub fn check_integrity(&mut self, replies: &mut Vec<(String, String)>) -> ScsiResult<()> {
        let mbl = self.number(key::MAX_BURST_LENGTH).unwrap_or(262_144);
        let fbl = self.number(key::FIRST_BURST_LENGTH).unwrap_or(65_536);
        if fbl > mbl {
            let already_sent = replies.iter().all(|(k, _)| k != key::FIRST_BURST_LENGTH)
                && self.get(key::FIRST_BURST_LENGTH).map(|k| k.has(neg::SENT)).unwrap_or(false);
            if already_sent {
                return Err(protocol_failure(format!(
                    "FirstBurstLength {} exceeds MaxBurstLength {}",
                    fbl, mbl
                )));
            }
            log::debug!("clamping FirstBurstLength {} to {}", fbl, mbl);
            self.replace(key::FIRST_BURST_LENGTH, &mbl.to_string(), replies);
        }

        if self.value(key::SESSION_TYPE) == Some("Discovery") {
            self.replace(key::MAX_CONNECTIONS, "1", replies);
        }

        if self.number(key::ERROR_RECOVERY_LEVEL).unwrap_or(0) > 0
            && self.boolean(key::DATA_SEQUENCE_IN_ORDER)
        {
            self.replace(key::MAX_OUTSTANDING_R2T, "1", replies);
        }

        for (int_key, marker) in [(key::OF_MARK_INT, key::OF_MARKER), (key::IF_MARK_INT, key::IF_MARKER)] {
            if self.get(int_key).map(|k| k.has(neg::REJECT)).unwrap_or(false) {
                self.replace(marker, NO, replies);
            }
        }

        Ok(())
    }

    fn replace(&mut self, name: &str, value: &str, replies: &mut [(String, String)]) {
        self.set_result(name, value);
        for (k, v) in replies.iter_mut() {
            if k == name && v != REJECT {
                *v = value.to_string();
            }
        }
    }

    /// Forget per-login bookkeeping (unknown keys)
    pub fn end_login(&mut self) {
        self.unknown.clear();
    }

    /// Freeze the negotiated values into session parameters
    pub fn commit(&self) -> SessionParams {
        let num = |name: &str, fallback: u32| self.number(name).unwrap_or(fallback);
        let digest = |name: &str| match self.value(name) {
            Some("CRC32C") => DigestType::CRC32C,
            _ => DigestType::None,
        };
        let local_mrdsl = self
            .get(key::MAX_RECV_DATA_SEGMENT_LENGTH)
            .and_then(|k| parse_number(&k.local))
            .unwrap_or(8192);

        SessionParams {
            max_connections: num(key::MAX_CONNECTIONS, 1),
            max_recv_data_segment_length: local_mrdsl,
            max_xmit_data_segment_length: num(key::MAX_RECV_DATA_SEGMENT_LENGTH, 8192),
            max_burst_length: num(key::MAX_BURST_LENGTH, 262_144),
            first_burst_length: num(key::FIRST_BURST_LENGTH, 65_536),
            default_time2wait: num(key::DEFAULT_TIME2WAIT, 2) as u16,
            default_time2retain: num(key::DEFAULT_TIME2RETAIN, 20) as u16,
            max_outstanding_r2t: num(key::MAX_OUTSTANDING_R2T, 1),
            data_pdu_in_order: self.boolean(key::DATA_PDU_IN_ORDER),
            data_sequence_in_order: self.boolean(key::DATA_SEQUENCE_IN_ORDER),
            error_recovery_level: num(key::ERROR_RECOVERY_LEVEL, 0) as u8,
            immediate_data: self.boolean(key::IMMEDIATE_DATA),
            initial_r2t: self.boolean(key::INITIAL_R2T),
            if_marker: self.boolean(key::IF_MARKER),
            of_marker: self.boolean(key::OF_MARKER),
            header_digest: digest(key::HEADER_DIGEST),
            data_digest: digest(key::DATA_DIGEST),
            session_type: if self.value(key::SESSION_TYPE) == Some("Discovery") {
                SessionType::Discovery
            } else {
                SessionType::Normal
            },
            target_name: self.value(key::TARGET_NAME).unwrap_or_default().to_string(),
            initiator_name: self.value(key::INITIATOR_NAME).unwrap_or_default().to_string(),
            target_alias: self
                .get(key::TARGET_ALIAS)
                .map(|k| k.local.clone())
                .unwrap_or_default(),
            initiator_alias: self.value(key::INITIATOR_ALIAS).unwrap_or_default().to_string(),
        }
    }
}
