//! Login phase (RFC 3720 Section 5.3)
//!
//! [`LoginMachine`] turns Login Requests into Login Responses without
//! touching a socket; [`run_login`] drives it over a connection's reader and
//! writer until the connection reaches Full Feature Phase or is rejected.

use crate::auth::{is_security_key, SecurityNegotiator};
use crate::config::{Customization, TargetConfig};
use crate::error::{IscsiError, ScsiResult};
use crate::params::{key, NegotiationContext, ParamTable};
use crate::pdu::{
    login_status, opcode, parse_text_parameters, serialize_text_parameters, stage, IscsiPdu, LoginRequest,
    ISCSI_VERSION,
};
use crate::session::{max_cmd_sn, DigestType, Session, SessionParams, SessionRegistry, SessionType};
use crate::wire::{send_segmented, Digests, PduReader, PduWriter};
use std::io::{Read, Write};
use std::sync::{Arc, Mutex};

/// Requests allowed in a single login stage
pub const MAX_LOGIN_ROUNDS: usize = 8;

/// Soft cap on a reassembled key block
pub const TEXT_SOFT_CAP: usize = 8192;

/// Hard cap on a reassembled key block
pub const TEXT_HARD_CAP: usize = 32 * 1024;

fn initiator_error(detail: u8, message: impl Into<String>) -> IscsiError {
    IscsiError::login(login_status::INITIATOR_ERROR, detail, message)
}

fn target_error(detail: u8, message: impl Into<String>) -> IscsiError {
    IscsiError::login(login_status::TARGET_ERROR, detail, message)
}

/// A connection that completed its login
#[derive(Debug)]
pub struct Established {
    pub session: Arc<Mutex<Session>>,
    pub cid: u16,
    /// First connection of a new session
    pub leading: bool,
    /// Values negotiated on this connection (digests, segment lengths)
    pub params: SessionParams,
}

impl Established {
    pub fn digests(&self) -> Digests {
        Digests {
            header: self.params.header_digest == DigestType::CRC32C,
            data: self.params.data_digest == DigestType::CRC32C,
        }
    }
}

/// What to do with a Login Request
#[derive(Debug)]
pub enum LoginStep {
    /// Send the response and wait for another request
    Continue(IscsiPdu),
    /// Send the final response and enter Full Feature Phase
    Complete {
        response: IscsiPdu,
        login: Established,
    },
}

struct FirstRequest {
    isid: [u8; 6],
    tsih: u16,
    cid: u16,
    version_max: u8,
}

/// Login state of one connection
pub struct LoginMachine {
    config: Arc<TargetConfig>,
    sessions: Arc<Mutex<SessionRegistry>>,
    custom: Customization,
    params: ParamTable,
    security: SecurityNegotiator,
    first: Option<FirstRequest>,
    existing: Option<Arc<Mutex<Session>>>,
    stage: u8,
    rounds: usize,
    pending: Vec<u8>,
    session_type: SessionType,
    target_accepted: bool,
}

impl LoginMachine {
    pub fn new(
        config: Arc<TargetConfig>,
        sessions: Arc<Mutex<SessionRegistry>>,
        custom: Customization,
    ) -> ScsiResult<Self> {
        let params = config.param_table()?;
        let security =
            SecurityNegotiator::new(config.auth.clone(), config.srp.clone()).with_identifier(custom.chap_i);
        Ok(LoginMachine {
            config,
            sessions,
            custom,
            params,
            security,
            first: None,
            existing: None,
            stage: stage::SECURITY,
            rounds: 0,
            pending: Vec::new(),
            session_type: SessionType::Normal,
            target_accepted: false,
        })
    }

    /// Whether this connection joins an existing session
    fn leading(&self) -> bool {
        self.existing.is_none()
    }

    /// Build the Login Reject for a failed request
    pub fn reject_for(&self, pdu: &IscsiPdu, class: u8, detail: u8) -> IscsiPdu {
        let (isid, tsih) = match &self.first {
            Some(first) => (first.isid, first.tsih),
            None => pdu
                .parse_login_request()
                .map(|r| (r.isid, r.tsih))
                .unwrap_or(([0; 6], 0)),
        };
        IscsiPdu::login_reject(isid, tsih, pdu.itt, class, detail)
    }

    /// Process one Login Request
    pub fn on_request(&mut self, pdu: &IscsiPdu) -> ScsiResult<LoginStep> {
        if pdu.opcode != opcode::LOGIN_REQUEST {
            return Err(initiator_error(
                login_status::DETAIL_INVALID_DURING_LOGIN,
                format!("{} during login", pdu.opcode_name()),
            ));
        }
        if self.custom.reject {
            return Err(initiator_error(login_status::DETAIL_ERR, "login rejected by customization"));
        }

        let req = pdu
            .parse_login_request()
            .map_err(|e| initiator_error(login_status::DETAIL_ERR, e.to_string()))?;
        self.check_header(&req)?;

        if req.cont {
            if req.transit {
                return Err(initiator_error(login_status::DETAIL_ERR, "C and T both set"));
            }
            self.append_pending(&req.data)?;
            log::debug!("login request continues, {} bytes buffered", self.pending.len());
            let mut ack = IscsiPdu::login_response(
                req.isid,
                req.tsih,
                req.itt,
                login_status::SUCCESS,
                0,
                req.csg,
                0,
                false,
                Vec::new(),
            );
            let (exp, max) = self.window(&req);
            ack.set_cmd_sn_window(exp, max);
            return Ok(LoginStep::Continue(ack));
        }

        self.append_pending(&req.data)?;
        let block = std::mem::take(&mut self.pending);

        self.rounds += 1;
        if self.rounds > MAX_LOGIN_ROUNDS {
            return Err(initiator_error(
                login_status::DETAIL_ERR,
                format!("more than {} login rounds in stage {}", MAX_LOGIN_ROUNDS, req.csg),
            ));
        }

        let keys = parse_text_parameters(&block)
            .map_err(|e| initiator_error(login_status::DETAIL_ERR, e.to_string()))?;
        let first_round = self.first.is_none();
        if first_round {
            self.first = Some(FirstRequest {
                isid: req.isid,
                tsih: req.tsih,
                cid: req.cid,
                version_max: req.version_max,
            });
            self.attach_existing(&req)?;
        }

        let mut replies = self.check_names(&keys, first_round)?;
        let (security_keys, other_keys): (Vec<_>, Vec<_>) =
            keys.into_iter().partition(|(k, _)| is_security_key(k));

        let ctx = NegotiationContext {
            stage: req.csg,
            leading: self.leading(),
        };
        replies.extend(self.params.negotiate(&other_keys, ctx)?);

        if req.csg == stage::SECURITY {
            if let Some(method) = self.params.get(key::AUTH_METHOD).and_then(|k| k.result.clone()) {
                self.security.start(&method)?;
            }
            if !security_keys.is_empty() || self.security.in_progress() {
                replies.extend(self.security.process(&security_keys)?);
            }
        } else if !security_keys.is_empty() {
            return Err(initiator_error(
                login_status::DETAIL_ERR,
                "security keys outside the security stage",
            ));
        } else if !self.security.is_done() && !self.security.may_leave() {
            return Err(initiator_error(login_status::DETAIL_NOT_AUTH, "authentication required"));
        }

        self.params.check_integrity(&mut replies)?;
        replies.extend(self.params.pending_offers(ctx));

        let mut transit = req.transit && !self.params.awaiting_answers();
        if transit && req.csg == stage::SECURITY {
            if !self.security.in_progress() && !self.security.is_done() {
                let method = self.params.value(key::AUTH_METHOD).unwrap_or("None").to_string();
                self.security.start(&method)?;
            }
            transit = self.security.may_leave();
        }
        if self.custom.disable_t_bit {
            transit = false;
        }

        let nsg = if transit { req.nsg } else { 0 };
        log::debug!(
            "login CSG {} -> NSG {} (T={}), {} replies",
            req.csg,
            nsg,
            transit,
            replies.len()
        );

        if transit && nsg == stage::FULL_FEATURE {
            return self.complete(&req, replies);
        }

        if transit {
            self.stage = nsg;
            self.rounds = 0;
        }
        let mut response = IscsiPdu::login_response(
            req.isid,
            req.tsih,
            req.itt,
            login_status::SUCCESS,
            0,
            req.csg,
            nsg,
            transit,
            serialize_text_parameters(&replies),
        );
        let (exp, max) = self.window(&req);
        response.set_cmd_sn_window(exp, max);
        Ok(LoginStep::Continue(response))
    }

    fn check_header(&mut self, req: &LoginRequest) -> ScsiResult<()> {
        if !req.immediate {
            return Err(initiator_error(login_status::DETAIL_ERR, "login request without the I bit"));
        }

        match &self.first {
            None => {
                if req.version_min != ISCSI_VERSION || req.version_max < req.version_min {
                    return Err(initiator_error(
                        login_status::DETAIL_VERSION_NOT_SUPPORTED,
                        format!("version max {} active {}", req.version_max, req.version_min),
                    ));
                }
            }
            Some(first) => {
                if req.version_max > first.version_max {
                    return Err(initiator_error(
                        login_status::DETAIL_VERSION_NOT_SUPPORTED,
                        format!("version max raised from {} to {}", first.version_max, req.version_max),
                    ));
                }
                if req.isid != first.isid || req.tsih != first.tsih || req.cid != first.cid {
                    return Err(initiator_error(
                        login_status::DETAIL_ERR,
                        "ISID, TSIH or CID changed during login",
                    ));
                }
            }
        }

        if req.csg > stage::OPERATIONAL {
            return Err(initiator_error(login_status::DETAIL_ERR, format!("invalid CSG {}", req.csg)));
        }
        if req.transit && (req.nsg <= req.csg || req.nsg == 2) {
            return Err(initiator_error(
                login_status::DETAIL_ERR,
                format!("invalid transition {} -> {}", req.csg, req.nsg),
            ));
        }

        if self.first.is_none() {
            self.stage = req.csg;
        } else if req.csg != self.stage {
            return Err(initiator_error(
                login_status::DETAIL_ERR,
                format!("CSG {} while in stage {}", req.csg, self.stage),
            ));
        }
        Ok(())
    }

    fn append_pending(&mut self, data: &[u8]) -> ScsiResult<()> {
        self.pending.extend_from_slice(data);
        if self.pending.len() > TEXT_HARD_CAP {
            return Err(initiator_error(
                login_status::DETAIL_ERR,
                format!("login key block of {} bytes", self.pending.len()),
            ));
        }
        if self.pending.len() > TEXT_SOFT_CAP {
            log::warn!("login key block of {} bytes exceeds {}", self.pending.len(), TEXT_SOFT_CAP);
        }
        Ok(())
    }

    fn attach_existing(&mut self, req: &LoginRequest) -> ScsiResult<()> {
        if req.tsih == 0 {
            return Ok(());
        }
        let session = self
            .sessions
            .lock()
            .map_err(|_| target_error(login_status::DETAIL_ERR, "session registry poisoned"))?
            .lookup(req.tsih)
            .ok_or_else(|| {
                initiator_error(
                    login_status::DETAIL_SESSION_DOES_NOT_EXIST,
                    format!("no session with TSIH {}", req.tsih),
                )
            })?;

        {
            let s = session
                .lock()
                .map_err(|_| target_error(login_status::DETAIL_ERR, "session poisoned"))?;
            if s.isid != req.isid {
                return Err(initiator_error(
                    login_status::DETAIL_SESSION_DOES_NOT_EXIST,
                    format!("TSIH {} belongs to another ISID", req.tsih),
                ));
            }
            if !s.can_accept(req.cid) {
                return Err(initiator_error(
                    login_status::DETAIL_TOO_MANY_CONNECTIONS,
                    format!("session {} has {} connections", s.tsih, s.connection_count()),
                ));
            }
            self.session_type = s.session_type();
        }
        self.existing = Some(session);
        Ok(())
    }

    /// Validate the naming keys; returns the replies they cause
    fn check_names(&mut self, keys: &[(String, String)], first_round: bool) -> ScsiResult<Vec<(String, String)>> {
        let find = |name: &str| keys.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str());
        let mut replies = Vec::new();

        if first_round {
            if find(key::INITIATOR_NAME).is_none() {
                return Err(initiator_error(login_status::DETAIL_MISSING_PARAMETER, "no InitiatorName"));
            }
            if self.leading() {
                self.session_type = match find(key::SESSION_TYPE) {
                    Some("Discovery") => SessionType::Discovery,
                    _ => SessionType::Normal,
                };
            }
            if self.session_type == SessionType::Normal && find(key::TARGET_NAME).is_none() {
                return Err(initiator_error(login_status::DETAIL_MISSING_PARAMETER, "no TargetName"));
            }
        }

        if let Some(name) = find(key::TARGET_NAME) {
            if name != self.config.target_name {
                return Err(initiator_error(
                    login_status::DETAIL_NOT_FOUND,
                    format!("unknown target '{}'", name),
                ));
            }
            if !self.target_accepted {
                self.target_accepted = true;
                replies.push((
                    key::TARGET_PORTAL_GROUP_TAG.to_string(),
                    self.config.portal_group_tag.to_string(),
                ));
                if let Some(alias) = &self.config.target_alias {
                    replies.push((key::TARGET_ALIAS.to_string(), alias.clone()));
                }
            }
        }
        Ok(replies)
    }

    fn window(&self, req: &LoginRequest) -> (u32, u32) {
        match self.existing.as_ref().and_then(|s| s.lock().ok().map(|s| s.window())) {
            Some(window) => window,
            None => (req.cmd_sn, max_cmd_sn(req.cmd_sn, 0, self.custom.max_cmd_sn_delta)),
        }
    }

    fn complete(&mut self, req: &LoginRequest, replies: Vec<(String, String)>) -> ScsiResult<LoginStep> {
        self.params.end_login();
        let params = self.params.commit();

        let (session, leading) = match self.existing.clone() {
            Some(session) => (session, false),
            None => (self.create_session(req, &params)?, true),
        };

        let (tsih, exp, max) = {
            let s = session
                .lock()
                .map_err(|_| target_error(login_status::DETAIL_ERR, "session poisoned"))?;
            let (exp, max) = s.window();
            (s.tsih, exp, max)
        };

        let mut response = IscsiPdu::login_response(
            req.isid,
            tsih,
            req.itt,
            login_status::SUCCESS,
            0,
            req.csg,
            stage::FULL_FEATURE,
            true,
            serialize_text_parameters(&replies),
        );
        response.set_cmd_sn_window(exp, max);

        log::info!(
            "CID {} of TSIH {} entering full feature phase ({:?}, {})",
            req.cid,
            tsih,
            params.session_type,
            if leading { "leading" } else { "joining" }
        );
        Ok(LoginStep::Complete {
            response,
            login: Established {
                session,
                cid: req.cid,
                leading,
                params,
            },
        })
    }

    fn create_session(&self, req: &LoginRequest, params: &SessionParams) -> ScsiResult<Arc<Mutex<Session>>> {
        let mut registry = self
            .sessions
            .lock()
            .map_err(|_| target_error(login_status::DETAIL_ERR, "session registry poisoned"))?;

        if let Some(old) = registry.take_by_isid(req.isid, &params.initiator_name) {
            if let Ok(mut old) = old.lock() {
                let released = old.queue.release(None);
                log::info!(
                    "reinstating session TSIH {} for '{}' ({} commands released)",
                    old.tsih,
                    params.initiator_name,
                    released
                );
            }
        }

        let tsih = registry
            .allocate_tsih()
            .map_err(|e| target_error(login_status::DETAIL_OUT_OF_RESOURCES, e.to_string()))?;
        let mut session = Session::new(req.isid, tsih, self.config.portal_group_tag, params.clone(), req.cmd_sn);
        session.max_cmd_sn_delta = self.custom.max_cmd_sn_delta;
        Ok(registry.insert(session))
    }
}

/// Run the login phase of a connection
///
/// StatSN starts at the first request's ExpStatSN. Digests and the receive
/// limit are switched on only after the final response has gone out.
pub fn run_login<R: Read, W: Write>(
    reader: &mut PduReader<R>,
    writer: &mut PduWriter<W>,
    machine: &mut LoginMachine,
    split_at: Option<usize>,
) -> ScsiResult<Established> {
    let mut first = true;
    loop {
        let pdu = reader.recv_pdu()?;
        if first {
            writer.set_stat_sn(pdu.exp_stat_sn());
            first = false;
        }

        match machine.on_request(&pdu) {
            Ok(LoginStep::Continue(response)) => {
                send_segmented(reader, writer, response, split_at)?;
            }
            Ok(LoginStep::Complete { response, login }) => {
                send_segmented(reader, writer, response, split_at)?;
                let digests = login.digests();
                reader.set_digests(digests);
                writer.set_digests(digests);
                reader.set_max_recv_len(login.params.max_recv_data_segment_length as usize);
                return Ok(login);
            }
            Err(IscsiError::Login { class, detail, message }) => {
                log::warn!("login rejected ({:#04x}/{:#04x}): {}", class, detail, message);
                let reject = machine.reject_for(&pdu, class, detail);
                writer.send_pdu(reject)?;
                return Err(IscsiError::Login { class, detail, message });
            }
            Err(e) => {
                let reject = machine.reject_for(&pdu, login_status::TARGET_ERROR, login_status::DETAIL_ERR);
                writer.send_pdu(reject)?;
                return Err(e);
            }
        }
    }
}
