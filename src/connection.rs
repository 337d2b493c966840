//! Full Feature Phase of one connection
//!
//! Each accepted socket gets a reader thread (this module's
//! [`handle_connection`]) and, after login, a manager thread. The reader
//! decodes PDUs and offers CmdSN-bearing ones to the session window; the
//! manager wakes on customization changes, on PDUs forwarded from other
//! connections of the session, or every [`MANAGER_TICK`], and runs the
//! command pass for this connection's commands.
//!
//! Locks are always taken in the order writer, custom registry, session,
//! LUN matrix. The session lock is never held while writing to the socket.

use crate::command::{Command, OwnerId, Outcome};
use crate::config::CustomSlot;
use crate::error::{IscsiError, ScsiResult};
use crate::login::{run_login, Established, LoginMachine};
use crate::lun::MAX_LUNS;
use crate::params::{key, ParamTable, NOT_UNDERSTOOD, REJECT};
use crate::pdu::{
    flags, logout_reason, logout_response, opcode, pack_lun, parse_text_parameters, reject_reason,
    scsi_response_code, serialize_text_parameters, unpack_lun, IscsiPdu, RESERVED_TAG,
};
use crate::scsi::DataDirection;
use crate::session::{carries_cmd_sn, Admission, HeldPdu, Session, SessionParams, SessionType};
use crate::target::TargetState;
use crate::task::rx_task_mgmt_fn;
use crate::wire::{PduReader, PduWriter};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::mpsc::{channel, Receiver};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

/// How long the manager thread sleeps when nothing happens
pub const MANAGER_TICK: Duration = Duration::from_millis(100);

/// Target LUN matrix row served by this portal
const TARGET_INDEX: usize = 0;

fn poisoned(what: &str) -> IscsiError {
    IscsiError::Session(format!("{} lock poisoned", what))
}

/// Text response still being delivered in Continue-bit pieces
struct PendingText {
    itt: u32,
    ttt: u32,
    rest: Vec<u8>,
}

/// Does the reader keep going after a PDU?
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Close,
}

/// A connection in Full Feature Phase
pub struct Connection {
    owner: OwnerId,
    cid: u16,
    local_addr: SocketAddr,
    stream: TcpStream,
    session: Arc<Mutex<Session>>,
    /// Values negotiated on this connection
    params: SessionParams,
    state: Arc<TargetState>,
    slot: Arc<CustomSlot>,
    writer: Mutex<PduWriter<TcpStream>>,
    text: Mutex<Option<PendingText>>,
    next_ttt: AtomicU32,
    closing: AtomicBool,
}

impl Connection {
    fn lock_session(&self) -> ScsiResult<MutexGuard<'_, Session>> {
        self.session.lock().map_err(|_| poisoned("session"))
    }

    fn lock_writer(&self) -> ScsiResult<MutexGuard<'_, PduWriter<TcpStream>>> {
        self.writer.lock().map_err(|_| poisoned("writer"))
    }

    fn fresh_ttt(&self) -> u32 {
        loop {
            let ttt = self.next_ttt.fetch_add(1, Ordering::Relaxed);
            if ttt != RESERVED_TAG && ttt != 0 {
                return ttt;
            }
        }
    }

    /// Stamp the current window and send
    fn send(&self, pdus: Vec<IscsiPdu>) -> ScsiResult<()> {
        if pdus.is_empty() {
            return Ok(());
        }
        let mut writer = self.lock_writer()?;
        let (exp, max) = self.lock_session()?.window();
        for mut pdu in pdus {
            pdu.set_cmd_sn_window(exp, max);
            log::trace!("CID {}: sending {} ITT {:#x}", self.cid, pdu.opcode_name(), pdu.itt);
            writer.send_pdu(pdu)?;
        }
        Ok(())
    }

    fn send_reject(&self, reason: u8, offending: &IscsiPdu) -> ScsiResult<()> {
        log::warn!(
            "CID {}: rejecting {} (reason {:#04x})",
            self.cid,
            offending.opcode_name(),
            reason
        );
        self.send(vec![IscsiPdu::reject(reason, offending)])
    }

    /// Run a command pass for this connection and send what it produced
    fn run_pass(&self) -> ScsiResult<()> {
        let mut writer = self.lock_writer()?;
        let (outcomes, (exp, max)) = {
            let mut session = self.lock_session()?;
            let mut luns = self.state.luns.lock().map_err(|_| poisoned("LUN matrix"))?;
            let max_burst = session.params.max_burst_length;
            let outcomes = session.queue.run_pass(&mut luns, self.owner, max_burst);
            (outcomes, session.window())
        };

        for outcome in outcomes {
            for mut pdu in self.outcome_pdus(outcome) {
                pdu.set_cmd_sn_window(exp, max);
                writer.send_pdu(pdu)?;
            }
        }
        Ok(())
    }

    fn outcome_pdus(&self, outcome: Outcome) -> Vec<IscsiPdu> {
        match outcome {
            Outcome::R2T {
                itt,
                raw_lun,
                ttt,
                r2t_sn,
                offset,
                length,
            } => vec![IscsiPdu::r2t(raw_lun, itt, ttt, r2t_sn, offset, length)],
            Outcome::TaskResponse { itt, response } => vec![IscsiPdu::task_mgmt_response(itt, response)],
            Outcome::Response {
                itt,
                raw_lun,
                direction,
                expected_length,
                response,
            } => {
                if direction == DataDirection::Read && response.is_good() && !response.data.is_empty() {
                    return data_in_sequence(
                        raw_lun,
                        itt,
                        response.data,
                        expected_length,
                        response.status,
                        self.params.max_xmit_data_segment_length as usize,
                    );
                }

                let (residual_flags, residual_count) = match direction {
                    DataDirection::Read if expected_length > 0 => (flags::UNDERFLOW, expected_length),
                    _ => (0, 0),
                };
                let sense = response.sense.map(|s| s.to_bytes());
                vec![IscsiPdu::scsi_response(
                    itt,
                    scsi_response_code::COMMAND_COMPLETED,
                    response.status,
                    residual_flags,
                    residual_count,
                    sense.as_deref(),
                )]
            }
        }
    }

    /// Handle a PDU read from this connection's socket
    fn on_pdu(&self, pdu: IscsiPdu) -> ScsiResult<Flow> {
        log::trace!("CID {}: received {} ITT {:#x}", self.cid, pdu.opcode_name(), pdu.itt);

        if carries_cmd_sn(&pdu) {
            let mut woken = Vec::new();
            let ready = {
                let mut session = self.lock_session()?;
                match session.admit(self.owner, pdu) {
                    Admission::Deliver(list) => {
                        let (mine, theirs): (Vec<HeldPdu>, Vec<HeldPdu>) =
                            list.into_iter().partition(|h| h.owner == self.owner);
                        for held in theirs {
                            woken.push(held.owner);
                            session.forward(held);
                        }
                        mine
                    }
                    Admission::Held | Admission::Dropped => Vec::new(),
                }
            };
            for owner in woken {
                if let Some(slot) = self.state.custom.slot(owner) {
                    slot.notify();
                }
            }

            let mut flow = Flow::Continue;
            for held in ready {
                if self.execute(held.pdu)? == Flow::Close {
                    flow = Flow::Close;
                }
            }
            self.run_pass()?;
            return Ok(flow);
        }

        match pdu.opcode {
            opcode::SCSI_DATA_OUT => {
                self.on_data_out(&pdu)?;
                self.run_pass()?;
            }
            opcode::LOGIN_REQUEST => self.send_reject(reject_reason::PROTOCOL_ERROR, &pdu)?,
            _ => self.send_reject(reject_reason::COMMAND_NOT_SUPPORTED, &pdu)?,
        }
        Ok(Flow::Continue)
    }

    /// Execute a PDU whose CmdSN turn has come
    fn execute(&self, pdu: IscsiPdu) -> ScsiResult<Flow> {
        match pdu.opcode {
            opcode::NOP_OUT => {
                let nop = pdu.parse_nop_out()?;
                if nop.itt != RESERVED_TAG {
                    self.send(vec![IscsiPdu::nop_in(nop.itt, RESERVED_TAG, nop.lun, nop.data)])?;
                } else {
                    log::debug!("CID {}: NOP-Out answering TTT {:#x}", self.cid, nop.ttt);
                }
            }
            opcode::SCSI_COMMAND => self.on_scsi_command(&pdu)?,
            opcode::TASK_MANAGEMENT_REQUEST => {
                let req = pdu.parse_task_mgmt_request()?;
                let immediate = {
                    let mut session = self.lock_session()?;
                    rx_task_mgmt_fn(&mut session.queue, &req, self.owner)
                };
                if let Some(response) = immediate {
                    self.send(vec![IscsiPdu::task_mgmt_response(req.itt, response)])?;
                }
            }
            opcode::TEXT_REQUEST => self.on_text(&pdu)?,
            opcode::LOGOUT_REQUEST => return self.on_logout(&pdu),
            _ => self.send_reject(reject_reason::COMMAND_NOT_SUPPORTED, &pdu)?,
        }
        Ok(Flow::Continue)
    }

    fn on_scsi_command(&self, pdu: &IscsiPdu) -> ScsiResult<()> {
        let cmd = pdu.parse_scsi_command()?;

        let mut session = self.lock_session()?;
        if session.session_type() == SessionType::Discovery {
            drop(session);
            return self.send_reject(reject_reason::PROTOCOL_ERROR, pdu);
        }

        let lun = unpack_lun(cmd.lun).unwrap_or_else(|e| {
            log::warn!("ITT {:#x}: {}", cmd.itt, e);
            MAX_LUNS as u16
        });
        let unsolicited = if cmd.write {
            session
                .params
                .unsolicited_limit(cmd.expected_data_length, cmd.data.len() as u32)
        } else {
            0
        };

        let record = Command::new(
            cmd.itt,
            cmd.cmd_sn,
            cmd.cdb,
            TARGET_INDEX,
            lun,
            cmd.lun,
            cmd.expected_data_length,
            unsolicited,
            self.owner,
        );
        session.queue.enqueue(record);
        if !cmd.data.is_empty() {
            if let Some(queued) = session.queue.find_mut(cmd.itt) {
                queued.add_data(0, &cmd.data);
            }
        }
        Ok(())
    }

    fn on_data_out(&self, pdu: &IscsiPdu) -> ScsiResult<()> {
        let data = pdu.parse_scsi_data_out()?;
        let mut session = self.lock_session()?;
        match session.queue.find_mut(data.itt) {
            Some(cmd) => cmd.add_data(data.buffer_offset, &data.data),
            None => log::warn!(
                "CID {}: Data-Out for unknown ITT {:#x} ({} bytes) ignored",
                self.cid,
                data.itt,
                data.data.len()
            ),
        }
        Ok(())
    }

    fn send_targets(&self, value: &str) -> Vec<(String, String)> {
        let name = &self.state.config.target_name;
        let listed = match value {
            "All" => true,
            "" => true,
            other => other == name,
        };
        if !listed {
            return Vec::new();
        }
        vec![
            (key::TARGET_NAME.to_string(), name.clone()),
            (
                key::TARGET_ADDRESS.to_string(),
                format!("{},{}", self.local_addr, self.state.config.portal_group_tag),
            ),
        ]
    }

    fn on_text(&self, pdu: &IscsiPdu) -> ScsiResult<()> {
        let req = pdu.parse_text_request()?;
        let mut pending = self.text.lock().map_err(|_| poisoned("text"))?;

        if let Some(text) = pending.take() {
            if text.itt == req.itt && req.data.is_empty() {
                let response = self.next_text_piece(text, &mut pending);
                drop(pending);
                return self.send(vec![response]);
            }
            log::warn!("CID {}: abandoning text response for ITT {:#x}", self.cid, text.itt);
        }

        let mut replies = Vec::new();
        for (name, value) in parse_text_parameters(&req.data)? {
            match name.as_str() {
                key::SEND_TARGETS => replies.extend(self.send_targets(&value)),
                _ if ParamTable::template().get(&name).is_some() => replies.push((name, REJECT.to_string())),
                _ => replies.push((name, NOT_UNDERSTOOD.to_string())),
            }
        }

        let text = PendingText {
            itt: req.itt,
            ttt: self.fresh_ttt(),
            rest: serialize_text_parameters(&replies),
        };
        let response = self.next_text_piece(text, &mut pending);
        drop(pending);
        self.send(vec![response])
    }

    /// Next Text Response piece; keeps the remainder pending
    fn next_text_piece(&self, mut text: PendingText, pending: &mut Option<PendingText>) -> IscsiPdu {
        let limit = self
            .slot
            .snapshot()
            .split_pdu_at
            .unwrap_or(self.params.max_xmit_data_segment_length as usize)
            .max(1);

        if text.rest.len() <= limit {
            return IscsiPdu::text_response(text.itt, RESERVED_TAG, true, std::mem::take(&mut text.rest));
        }
        let tail = text.rest.split_off(limit);
        let head = std::mem::replace(&mut text.rest, tail);
        let mut response = IscsiPdu::text_response(text.itt, text.ttt, false, head);
        response.flags |= flags::CONTINUE;
        log::debug!(
            "CID {}: text response for ITT {:#x} continues, {} bytes left",
            self.cid,
            text.itt,
            text.rest.len()
        );
        *pending = Some(text);
        response
    }

    fn on_logout(&self, pdu: &IscsiPdu) -> ScsiResult<Flow> {
        let req = pdu.parse_logout_request()?;
        let (response, flow, time2wait, time2retain) = {
            let mut session = self.lock_session()?;
            let time2wait = session.params.default_time2wait;
            let time2retain = session.params.default_time2retain;
            let (response, flow) = match req.reason {
                logout_reason::CLOSE_SESSION => {
                    let released = session.queue.release(None);
                    let owners: Vec<OwnerId> =
                        session.cids().into_iter().filter_map(|cid| session.owner_of(cid)).collect();
                    for owner in owners {
                        session.remove_connection(owner);
                    }
                    let tsih = session.tsih;
                    drop(session);
                    if let Ok(mut registry) = self.state.sessions.lock() {
                        registry.remove(tsih);
                    }
                    log::info!("TSIH {} logged out ({} commands released)", tsih, released);
                    (logout_response::SUCCESS, Flow::Close)
                }
                logout_reason::CLOSE_CONNECTION | logout_reason::REMOVE_CONNECTION_FOR_RECOVERY => {
                    if req.reason == logout_reason::REMOVE_CONNECTION_FOR_RECOVERY
                        && session.params.error_recovery_level < 2
                    {
                        (logout_response::CONNECTION_RECOVERY_NOT_SUPPORTED, Flow::Continue)
                    } else {
                        match session.owner_of(req.cid) {
                            Some(owner) if owner == self.owner => {
                                session.remove_connection(owner);
                                (logout_response::SUCCESS, Flow::Close)
                            }
                            Some(owner) => {
                                session.remove_connection(owner);
                                log::info!("CID {} logged out CID {}", self.cid, req.cid);
                                (logout_response::SUCCESS, Flow::Continue)
                            }
                            None => (logout_response::CID_NOT_FOUND, Flow::Continue),
                        }
                    }
                }
                other => {
                    log::warn!("CID {}: unknown logout reason {}", self.cid, other);
                    (logout_response::CLEANUP_FAILED, Flow::Continue)
                }
            };
            (response, flow, time2wait, time2retain)
        };

        self.send(vec![IscsiPdu::logout_response(req.itt, response, time2wait, time2retain)])?;
        Ok(flow)
    }

    /// Still attached to its session?
    fn attached(&self) -> bool {
        self.session
            .lock()
            .map(|s| s.owner_of(self.cid) == Some(self.owner))
            .unwrap_or(false)
    }

    fn shutdown(&self) {
        self.closing.store(true, Ordering::SeqCst);
        let _ = self.stream.shutdown(Shutdown::Both);
    }

    fn manager_loop(&self, inbox: Receiver<IscsiPdu>) {
        let mut seen = 0;
        while !self.closing.load(Ordering::SeqCst) {
            match self.slot.wait(seen, MANAGER_TICK) {
                Some(generation) => seen = generation,
                None => break,
            }

            if let Err(e) = self.manage_once(&inbox) {
                log::warn!("CID {}: manager stopping: {}", self.cid, e);
                self.shutdown();
                break;
            }
        }
        log::debug!("CID {}: manager thread done", self.cid);
    }

    fn manage_once(&self, inbox: &Receiver<IscsiPdu>) -> ScsiResult<()> {
        if !self.attached() {
            log::info!("CID {}: removed from its session, closing", self.cid);
            self.shutdown();
            return Ok(());
        }

        for pdu in inbox.try_iter() {
            if self.execute(pdu)? == Flow::Close {
                self.shutdown();
            }
        }

        let pending = self.slot.take_pending();
        if let Some(event) = pending.send_async {
            let params = self.slot.snapshot().async_params();
            if let Some(message) = event.build(self.cid, &params) {
                log::info!("CID {}: sending async event {:?}", self.cid, event);
                self.send(vec![message])?;
            }
        }
        if pending.send_nopin {
            let nop = IscsiPdu::nop_in(RESERVED_TAG, self.fresh_ttt(), pack_lun(0), Vec::new());
            self.send(vec![nop])?;
        }

        self.run_pass()
    }
}

/// Split read data into Data-In PDUs, the last one carrying status
fn data_in_sequence(
    raw_lun: u64,
    itt: u32,
    mut data: Vec<u8>,
    expected_length: u32,
    status: u8,
    max_segment: usize,
) -> Vec<IscsiPdu> {
    let produced = data.len() as u32;
    let (residual_flags, residual_count) = if produced > expected_length {
        data.truncate(expected_length as usize);
        (flags::OVERFLOW, produced - expected_length)
    } else if produced < expected_length {
        (flags::UNDERFLOW, expected_length - produced)
    } else {
        (0, 0)
    };

    if data.is_empty() {
        return vec![IscsiPdu::scsi_response(
            itt,
            scsi_response_code::COMMAND_COMPLETED,
            status,
            residual_flags,
            residual_count,
            None,
        )];
    }

    let chunks: Vec<&[u8]> = data.chunks(max_segment.max(1)).collect();
    let last = chunks.len() - 1;
    let mut offset = 0u32;
    chunks
        .iter()
        .enumerate()
        .map(|(data_sn, chunk)| {
            let final_chunk = data_sn == last;
            let pdu = IscsiPdu::scsi_data_in(
                raw_lun,
                itt,
                data_sn as u32,
                offset,
                chunk.to_vec(),
                final_chunk,
                if final_chunk { Some(status) } else { None },
                if final_chunk { residual_flags } else { 0 },
                if final_chunk { residual_count } else { 0 },
            );
            offset += chunk.len() as u32;
            pdu
        })
        .collect()
}

/// Serve one accepted socket until it closes
pub fn handle_connection(stream: TcpStream, state: Arc<TargetState>) -> ScsiResult<()> {
    let peer = stream.peer_addr()?;
    let local_addr = stream.local_addr()?;
    let owner = state.next_owner();
    let slot = state.custom.register(owner);
    log::info!("connection {} from {}", owner, peer);

    let result = serve(stream, local_addr, owner, Arc::clone(&slot), &state);
    state.custom.unregister(owner);
    match &result {
        Ok(()) | Err(IscsiError::PeerClosed) => log::info!("connection {} from {} closed", owner, peer),
        Err(e) => log::warn!("connection {} from {} failed: {}", owner, peer, e),
    }
    result
}

fn serve(
    stream: TcpStream,
    local_addr: SocketAddr,
    owner: OwnerId,
    slot: Arc<CustomSlot>,
    state: &Arc<TargetState>,
) -> ScsiResult<()> {
    let mut reader = PduReader::new(stream.try_clone()?);
    let mut writer = PduWriter::new(stream.try_clone()?);

    let custom = slot.snapshot();
    let mut machine = LoginMachine::new(Arc::clone(&state.config), Arc::clone(&state.sessions), custom.clone())?;
    let Established {
        session, cid, params, ..
    } = run_login(&mut reader, &mut writer, &mut machine, custom.split_pdu_at)?;

    let (inbox_tx, inbox_rx) = channel();
    session
        .lock()
        .map_err(|_| poisoned("session"))?
        .add_connection(cid, owner, inbox_tx)?;

    let conn = Arc::new(Connection {
        owner,
        cid,
        local_addr,
        stream,
        session,
        params,
        state: Arc::clone(state),
        slot,
        writer: Mutex::new(writer),
        text: Mutex::new(None),
        next_ttt: AtomicU32::new(1),
        closing: AtomicBool::new(false),
    });

    let manager = {
        let conn = Arc::clone(&conn);
        thread::Builder::new()
            .name(format!("iscsi-mgr-{}", owner))
            .spawn(move || conn.manager_loop(inbox_rx))?
    };

    let result = loop {
        if conn.closing.load(Ordering::SeqCst) {
            break Ok(());
        }
        let pdu = match reader.recv_pdu() {
            Ok(pdu) => pdu,
            Err(_) if conn.closing.load(Ordering::SeqCst) => break Ok(()),
            Err(e) => break Err(e),
        };
        match conn.on_pdu(pdu) {
            Ok(Flow::Continue) => {}
            Ok(Flow::Close) => break Ok(()),
            Err(e) => break Err(e),
        }
    };

    conn.shutdown();
    conn.slot.close();
    if manager.join().is_err() {
        log::error!("CID {}: manager thread panicked", cid);
    }
    teardown(&conn);
    result
}

/// Detach from the session and drop this connection's commands
fn teardown(conn: &Connection) {
    let Ok(mut session) = conn.session.lock() else {
        return;
    };
    session.remove_connection(conn.owner);
    if let Ok(mut luns) = conn.state.luns.lock() {
        let max_burst = session.params.max_burst_length;
        let leftover = session.queue.run_pass(&mut luns, conn.owner, max_burst);
        if !leftover.is_empty() {
            log::debug!("CID {}: {} outcomes discarded at close", conn.cid, leftover.len());
        }
    }
    log::debug!(
        "CID {} left TSIH {} ({} connections remain)",
        conn.cid,
        session.tsih,
        session.connection_count()
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdu::scsi_status;

    #[test]
    fn test_data_in_sequence_chunks() {
        let pdus = data_in_sequence(0, 5, vec![7u8; 20_000], 20_000, scsi_status::GOOD, 8192);
        assert_eq!(pdus.len(), 3);
        assert_eq!(pdus[0].data.len(), 8192);
        assert_eq!(pdus[0].flags & flags::STATUS, 0);
        assert_eq!(pdus[1].buffer_offset(), 8192);
        let last = &pdus[2];
        assert_eq!(last.data.len(), 20_000 - 2 * 8192);
        assert_ne!(last.flags & flags::FINAL, 0);
        assert_ne!(last.flags & flags::STATUS, 0);
    }

    #[test]
    fn test_data_in_underflow() {
        let pdus = data_in_sequence(0, 5, vec![1u8; 36], 255, scsi_status::GOOD, 8192);
        assert_eq!(pdus.len(), 1);
        assert_ne!(pdus[0].flags & flags::UNDERFLOW, 0);
        assert_eq!(pdus[0].residual_count(), 255 - 36);
    }

    #[test]
    fn test_data_in_overflow_truncates() {
        let pdus = data_in_sequence(0, 5, vec![1u8; 1024], 512, scsi_status::GOOD, 8192);
        assert_eq!(pdus.len(), 1);
        assert_eq!(pdus[0].data.len(), 512);
        assert_ne!(pdus[0].flags & flags::OVERFLOW, 0);
        assert_eq!(pdus[0].residual_count(), 512);
    }

    #[test]
    fn test_data_in_zero_length_allocation() {
        let pdus = data_in_sequence(0, 5, vec![1u8; 36], 0, scsi_status::GOOD, 8192);
        assert_eq!(pdus.len(), 1);
        assert_eq!(pdus[0].opcode, opcode::SCSI_RESPONSE);
        assert_ne!(pdus[0].flags & flags::OVERFLOW, 0);
    }
}
