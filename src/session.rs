//! iSCSI session management
//!
//! Sessions, the connections that make them up, the CmdSN window and the
//! registry that hands out TSIHs, based on RFC 3720:
//! https://datatracker.ietf.org/doc/html/rfc3720

use crate::command::{CommandQueue, OwnerId};
use crate::error::{IscsiError, ScsiResult};
use crate::pdu::{opcode, IscsiPdu};
use std::collections::HashMap;
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Session type (RFC 3720 Section 5.2)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionType {
    /// Normal session for SCSI commands
    #[default]
    Normal,
    /// Discovery session for target discovery (SendTargets)
    Discovery,
}

/// Digest type for header/data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DigestType {
    #[default]
    None,
    CRC32C,
}

/// Negotiated session parameters (RFC 3720 Section 12), frozen at the
/// transition to Full Feature Phase
#[derive(Debug, Clone)]
pub struct SessionParams {
    pub max_connections: u32,
    /// Maximum data segment length the target receives
    pub max_recv_data_segment_length: u32,
    /// Maximum data segment length the initiator receives
    pub max_xmit_data_segment_length: u32,
    pub max_burst_length: u32,
    pub first_burst_length: u32,
    /// Seconds to wait before reconnecting
    pub default_time2wait: u16,
    /// Seconds a session outlives its last connection
    pub default_time2retain: u16,
    pub max_outstanding_r2t: u32,
    pub data_pdu_in_order: bool,
    pub data_sequence_in_order: bool,
    /// Error recovery level (0-2)
    pub error_recovery_level: u8,
    pub immediate_data: bool,
    pub initial_r2t: bool,
    pub if_marker: bool,
    pub of_marker: bool,
    pub header_digest: DigestType,
    pub data_digest: DigestType,
    pub session_type: SessionType,
    pub target_name: String,
    pub initiator_name: String,
    pub target_alias: String,
    pub initiator_alias: String,
}

impl Default for SessionParams {
    fn default() -> Self {
        SessionParams {
            max_connections: 1,
            max_recv_data_segment_length: 8192,
            max_xmit_data_segment_length: 8192,
            max_burst_length: 262_144,
            first_burst_length: 65_536,
            default_time2wait: 2,
            default_time2retain: 20,
            max_outstanding_r2t: 1,
            data_pdu_in_order: true,
            data_sequence_in_order: true,
            error_recovery_level: 0,
            immediate_data: true,
            initial_r2t: true,
            if_marker: false,
            of_marker: false,
            header_digest: DigestType::None,
            data_digest: DigestType::None,
            session_type: SessionType::Normal,
            target_name: String::new(),
            initiator_name: String::new(),
            target_alias: String::new(),
            initiator_alias: String::new(),
        }
    }
}

impl SessionParams {
    /// Connections allowed on the session, counting the reinstatement slot
    /// granted at ErrorRecoveryLevel 2
    pub fn connection_limit(&self) -> usize {
        let slack = if self.error_recovery_level == 2 { 1 } else { 0 };
        self.max_connections as usize + slack
    }

    /// Write bytes the initiator may send without an R2T
    pub fn unsolicited_limit(&self, expected_length: u32, immediate_len: u32) -> u32 {
        if self.initial_r2t {
            immediate_len
        } else {
            self.first_burst_length.min(expected_length).max(immediate_len)
        }
    }
}

// ============================================================================
// Serial number arithmetic (RFC 1982, 32-bit)
// ============================================================================

/// `a < b` in serial number arithmetic
pub fn sn_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

/// `lo <= sn <= hi` in serial number arithmetic
pub fn sn_in_window(sn: u32, lo: u32, hi: u32) -> bool {
    let from_lo = sn.wrapping_sub(lo) as i32;
    let to_hi = hi.wrapping_sub(sn) as i32;
    from_lo >= 0 && to_hi >= 0
}

/// Commands a session accepts before the window closes
pub const QUEUE_DEPTH: u32 = 100;

/// MaxCmdSN for a window starting at `exp_cmd_sn`
pub fn max_cmd_sn(exp_cmd_sn: u32, in_flight: usize, delta: u32) -> u32 {
    let available = QUEUE_DEPTH.saturating_sub(in_flight as u32);
    exp_cmd_sn
        .wrapping_add(available)
        .wrapping_add(delta)
        .wrapping_sub(1)
}

/// Does this PDU carry a CmdSN that must be ordered?
pub fn carries_cmd_sn(pdu: &IscsiPdu) -> bool {
    matches!(
        pdu.opcode,
        opcode::NOP_OUT
            | opcode::SCSI_COMMAND
            | opcode::TASK_MANAGEMENT_REQUEST
            | opcode::TEXT_REQUEST
            | opcode::LOGOUT_REQUEST
    )
}

// ============================================================================
// Session
// ============================================================================

/// A PDU admitted into the session, tagged with its arrival connection
#[derive(Debug, Clone)]
pub struct HeldPdu {
    pub owner: OwnerId,
    pub pdu: IscsiPdu,
}

/// Result of offering a PDU to the CmdSN window
#[derive(Debug)]
pub enum Admission {
    /// These PDUs are next in CmdSN order (the offered one possibly among them)
    Deliver(Vec<HeldPdu>),
    /// Inside the window but ahead of ExpCmdSN
    Held,
    /// Outside the window
    Dropped,
}

/// One connection of a session
#[derive(Debug)]
pub struct ConnectionEntry {
    pub cid: u16,
    pub owner: OwnerId,
    inbox: Sender<IscsiPdu>,
}

/// An iSCSI session shared by its connections
#[derive(Debug)]
pub struct Session {
    pub isid: [u8; 6],
    pub tsih: u16,
    pub tpgt: u16,
    pub params: SessionParams,
    /// Commands and task-management requests of the whole session
    pub queue: CommandQueue,
    /// Extra MaxCmdSN headroom (customization)
    pub max_cmd_sn_delta: u32,
    exp_cmd_sn: u32,
    connections: Vec<ConnectionEntry>,
    held: Vec<HeldPdu>,
    orphaned_at: Option<Instant>,
}

impl Session {
    pub fn new(isid: [u8; 6], tsih: u16, tpgt: u16, params: SessionParams, exp_cmd_sn: u32) -> Self {
        Session {
            isid,
            tsih,
            tpgt,
            params,
            queue: CommandQueue::new(),
            max_cmd_sn_delta: 0,
            exp_cmd_sn,
            connections: Vec::new(),
            held: Vec::new(),
            orphaned_at: None,
        }
    }

    pub fn session_type(&self) -> SessionType {
        self.params.session_type
    }

    pub fn initiator_name(&self) -> &str {
        &self.params.initiator_name
    }

    pub fn exp_cmd_sn(&self) -> u32 {
        self.exp_cmd_sn
    }

    pub fn max_cmd_sn(&self) -> u32 {
        max_cmd_sn(self.exp_cmd_sn, self.queue.in_flight() + self.held.len(), self.max_cmd_sn_delta)
    }

    /// (ExpCmdSN, MaxCmdSN) to stamp on outgoing PDUs
    pub fn window(&self) -> (u32, u32) {
        (self.exp_cmd_sn, self.max_cmd_sn())
    }

    /// Offer a CmdSN-bearing PDU to the window
    pub fn admit(&mut self, owner: OwnerId, pdu: IscsiPdu) -> Admission {
        let cmd_sn = pdu.cmd_sn();

        if pdu.immediate {
            return Admission::Deliver(vec![HeldPdu { owner, pdu }]);
        }

        if cmd_sn == self.exp_cmd_sn {
            let mut ready = vec![HeldPdu { owner, pdu }];
            self.exp_cmd_sn = self.exp_cmd_sn.wrapping_add(1);

            while let Some(pos) = self.held.iter().position(|h| h.pdu.cmd_sn() == self.exp_cmd_sn) {
                ready.push(self.held.remove(pos));
                self.exp_cmd_sn = self.exp_cmd_sn.wrapping_add(1);
            }
            return Admission::Deliver(ready);
        }

        let max = self.max_cmd_sn();
        if sn_lt(self.exp_cmd_sn, cmd_sn) && sn_in_window(cmd_sn, self.exp_cmd_sn, max) {
            if self.held.iter().any(|h| h.pdu.cmd_sn() == cmd_sn) {
                log::warn!("duplicate CmdSN {} dropped", cmd_sn);
                return Admission::Dropped;
            }
            log::debug!("CmdSN {} held until ExpCmdSN {} arrives", cmd_sn, self.exp_cmd_sn);
            self.held.push(HeldPdu { owner, pdu });
            return Admission::Held;
        }

        log::warn!(
            "CmdSN {} outside window [{}, {}], dropping {}",
            cmd_sn,
            self.exp_cmd_sn,
            max,
            pdu.opcode_name()
        );
        Admission::Dropped
    }

    /// Attach a connection; a CID already present is reinstated
    pub fn add_connection(&mut self, cid: u16, owner: OwnerId, inbox: Sender<IscsiPdu>) -> ScsiResult<()> {
        if let Some(pos) = self.connections.iter().position(|c| c.cid == cid) {
            let old = self.connections.remove(pos);
            let released = self.queue.release(Some(old.owner));
            log::info!(
                "TSIH {}: reinstating CID {} ({} commands released)",
                self.tsih,
                cid,
                released
            );
        }

        if self.connections.len() >= self.params.connection_limit() {
            return Err(IscsiError::Session(format!(
                "session {} already has {} connections",
                self.tsih,
                self.connections.len()
            )));
        }

        self.connections.push(ConnectionEntry { cid, owner, inbox });
        self.orphaned_at = None;
        Ok(())
    }

    /// Would another connection with this CID fit?
    pub fn can_accept(&self, cid: u16) -> bool {
        self.has_cid(cid) || self.connections.len() < self.params.connection_limit()
    }

    /// Detach the connection run by `owner`, releasing its commands
    pub fn remove_connection(&mut self, owner: OwnerId) -> bool {
        let before = self.connections.len();
        self.connections.retain(|c| c.owner != owner);
        let removed = self.connections.len() != before;
        if removed {
            self.queue.release(Some(owner));
            self.held.retain(|h| h.owner != owner);
            if self.connections.is_empty() {
                self.orphaned_at = Some(Instant::now());
            }
        }
        removed
    }

    pub fn has_cid(&self, cid: u16) -> bool {
        self.connections.iter().any(|c| c.cid == cid)
    }

    pub fn owner_of(&self, cid: u16) -> Option<OwnerId> {
        self.connections.iter().find(|c| c.cid == cid).map(|c| c.owner)
    }

    pub fn cids(&self) -> Vec<u16> {
        self.connections.iter().map(|c| c.cid).collect()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Hand a PDU to the connection that owns it
    pub fn forward(&self, held: HeldPdu) -> bool {
        match self.connections.iter().find(|c| c.owner == held.owner) {
            Some(conn) => conn.inbox.send(held.pdu).is_ok(),
            None => {
                log::warn!("no connection {} to forward {} to", held.owner, held.pdu.opcode_name());
                false
            }
        }
    }

    /// True once the session has had no connection for DefaultTime2Retain
    pub fn expired(&self, now: Instant) -> bool {
        match self.orphaned_at {
            Some(since) => now.duration_since(since) >= Duration::from_secs(self.params.default_time2retain as u64),
            None => false,
        }
    }
}

// ============================================================================
// Registry
// ============================================================================

/// All sessions of a target, keyed by TSIH
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: HashMap<u16, Arc<Mutex<Session>>>,
    last_tsih: u16,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next TSIH: non-zero and never handed out before
    ///
    /// Allocation does not wrap; once 0xFFFF is used every new session is
    /// refused.
    pub fn allocate_tsih(&mut self) -> ScsiResult<u16> {
        let next = self
            .last_tsih
            .checked_add(1)
            .ok_or_else(|| IscsiError::ResourceExhausted("TSIH space exhausted".to_string()))?;
        self.last_tsih = next;
        Ok(next)
    }

    pub fn insert(&mut self, session: Session) -> Arc<Mutex<Session>> {
        let tsih = session.tsih;
        let shared = Arc::new(Mutex::new(session));
        self.sessions.insert(tsih, Arc::clone(&shared));
        log::info!("session TSIH {} created ({} active)", tsih, self.sessions.len());
        shared
    }

    pub fn lookup(&self, tsih: u16) -> Option<Arc<Mutex<Session>>> {
        self.sessions.get(&tsih).cloned()
    }

    /// Remove and return the session with this ISID and initiator, if any
    pub fn take_by_isid(&mut self, isid: [u8; 6], initiator_name: &str) -> Option<Arc<Mutex<Session>>> {
        let tsih = self.sessions.iter().find_map(|(tsih, s)| {
            let s = s.lock().ok()?;
            (s.isid == isid && s.initiator_name() == initiator_name).then_some(*tsih)
        })?;
        self.sessions.remove(&tsih)
    }

    pub fn remove(&mut self, tsih: u16) -> Option<Arc<Mutex<Session>>> {
        let removed = self.sessions.remove(&tsih);
        if removed.is_some() {
            log::info!("session TSIH {} closed", tsih);
        }
        removed
    }

    /// Drop sessions whose last connection left more than Time2Retain ago
    pub fn reap(&mut self, now: Instant) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|tsih, s| {
            let expired = s.lock().map(|s| s.expired(now)).unwrap_or(true);
            if expired {
                log::info!("session TSIH {} expired after Time2Retain", tsih);
            }
            !expired
        });
        before - self.sessions.len()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn tsihs(&self) -> Vec<u16> {
        let mut list: Vec<u16> = self.sessions.keys().copied().collect();
        list.sort_unstable();
        list
    }
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn nop(cmd_sn: u32, immediate: bool) -> IscsiPdu {
        IscsiPdu::nop_out(cmd_sn, crate::pdu::RESERVED_TAG, cmd_sn, 0, immediate, Vec::new())
    }

    fn session() -> Session {
        Session::new([1, 2, 3, 4, 5, 6], 1, 1, SessionParams::default(), 10)
    }

    fn delivered(a: Admission) -> Vec<u32> {
        match a {
            Admission::Deliver(list) => list.iter().map(|h| h.pdu.cmd_sn()).collect(),
            other => panic!("expected delivery, got {:?}", other),
        }
    }

    #[test]
    fn test_session_params_default() {
        let params = SessionParams::default();
        assert_eq!(params.max_connections, 1);
        assert_eq!(params.max_recv_data_segment_length, 8192);
        assert!(params.initial_r2t);
        assert!(params.immediate_data);
        assert_eq!(params.header_digest, DigestType::None);
        assert_eq!(params.session_type, SessionType::Normal);
    }

    #[test]
    fn test_connection_limit() {
        let mut params = SessionParams::default();
        assert_eq!(params.connection_limit(), 1);
        params.error_recovery_level = 2;
        assert_eq!(params.connection_limit(), 2);
    }

    #[test]
    fn test_unsolicited_limit() {
        let mut params = SessionParams::default();
        assert_eq!(params.unsolicited_limit(4096, 512), 512);
        params.initial_r2t = false;
        params.first_burst_length = 1024;
        assert_eq!(params.unsolicited_limit(4096, 512), 1024);
        assert_eq!(params.unsolicited_limit(600, 0), 600);
    }

    #[test]
    fn test_serial_arithmetic() {
        assert!(sn_lt(1, 2));
        assert!(sn_lt(u32::MAX, 0));
        assert!(!sn_lt(5, 5));
        assert!(sn_in_window(0, u32::MAX - 1, 5));
        assert!(!sn_in_window(6, u32::MAX - 1, 5));
    }

    #[test]
    fn test_in_order_delivery() {
        let mut s = session();
        assert_eq!(delivered(s.admit(1, nop(10, false))), vec![10]);
        assert_eq!(s.exp_cmd_sn(), 11);
        assert_eq!(s.max_cmd_sn(), 11 + QUEUE_DEPTH - 1);
    }

    #[test]
    fn test_out_of_order_held() {
        let mut s = session();
        assert!(matches!(s.admit(1, nop(12, false)), Admission::Held));
        assert!(matches!(s.admit(1, nop(11, false)), Admission::Held));
        assert_eq!(delivered(s.admit(1, nop(10, false))), vec![10, 11, 12]);
        assert_eq!(s.exp_cmd_sn(), 13);
    }

    #[test]
    fn test_outside_window_dropped() {
        let mut s = session();
        assert!(matches!(s.admit(1, nop(9, false)), Admission::Dropped));
        assert!(matches!(s.admit(1, nop(10 + QUEUE_DEPTH + 5, false)), Admission::Dropped));
        assert_eq!(s.exp_cmd_sn(), 10);
    }

    #[test]
    fn test_immediate_not_ordered() {
        let mut s = session();
        assert_eq!(delivered(s.admit(1, nop(10, true))), vec![10]);
        assert_eq!(s.exp_cmd_sn(), 10);
    }

    #[test]
    fn test_max_cmd_sn_delta() {
        let mut s = session();
        let base = s.max_cmd_sn();
        s.max_cmd_sn_delta = 5;
        assert_eq!(s.max_cmd_sn(), base + 5);
    }

    #[test]
    fn test_connections_and_reinstatement() {
        let (tx, _rx) = mpsc::channel();
        let mut s = session();
        s.add_connection(1, 100, tx.clone()).unwrap();
        assert!(!s.can_accept(2));
        assert!(s.add_connection(2, 101, tx.clone()).is_err());

        // Same CID replaces the old connection
        s.add_connection(1, 102, tx.clone()).unwrap();
        assert_eq!(s.owner_of(1), Some(102));
        assert_eq!(s.connection_count(), 1);

        s.params.error_recovery_level = 2;
        s.add_connection(2, 103, tx).unwrap();
        assert_eq!(s.cids(), vec![1, 2]);
    }

    #[test]
    fn test_forward_to_owner() {
        let (tx, rx) = mpsc::channel();
        let mut s = session();
        s.add_connection(1, 100, tx).unwrap();
        assert!(s.forward(HeldPdu { owner: 100, pdu: nop(3, false) }));
        assert_eq!(rx.try_recv().unwrap().cmd_sn(), 3);
        assert!(!s.forward(HeldPdu { owner: 999, pdu: nop(4, false) }));
    }

    #[test]
    fn test_orphan_expiry() {
        let (tx, _rx) = mpsc::channel();
        let mut s = session();
        s.params.default_time2retain = 0;
        s.add_connection(1, 100, tx).unwrap();
        assert!(!s.expired(Instant::now()));
        assert!(s.remove_connection(100));
        assert!(s.expired(Instant::now()));
    }

    #[test]
    fn test_tsih_allocation() {
        let mut registry = SessionRegistry::new();
        let a = registry.allocate_tsih().unwrap();
        assert_eq!(a, 1);
        registry.insert(Session::new([0; 6], a, 1, SessionParams::default(), 1));

        registry.remove(a);
        assert_eq!(registry.allocate_tsih().unwrap(), 2);

        registry.last_tsih = u16::MAX - 1;
        assert_eq!(registry.allocate_tsih().unwrap(), u16::MAX);
        // Never wraps back onto an earlier TSIH
        assert!(matches!(registry.allocate_tsih(), Err(IscsiError::ResourceExhausted(_))));
    }

    #[test]
    fn test_registry_reap_and_take() {
        let mut registry = SessionRegistry::new();
        let mut params = SessionParams::default();
        params.initiator_name = "iqn.2004-01.com:init".to_string();
        params.default_time2retain = 0;
        let mut s = Session::new([9; 6], 5, 1, params, 1);
        let (tx, _rx) = mpsc::channel();
        s.add_connection(0, 1, tx).unwrap();
        registry.insert(s);

        assert_eq!(registry.reap(Instant::now()), 0);
        registry.lookup(5).unwrap().lock().unwrap().remove_connection(1);
        assert_eq!(registry.reap(Instant::now()), 1);
        assert!(registry.is_empty());

        let mut params = SessionParams::default();
        params.initiator_name = "iqn.2004-01.com:init".to_string();
        registry.insert(Session::new([9; 6], 6, 1, params, 1));
        assert!(registry.take_by_isid([9; 6], "iqn.2004-01.com:other").is_none());
        assert!(registry.take_by_isid([9; 6], "iqn.2004-01.com:init").is_some());
    }
}
