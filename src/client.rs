//! iSCSI client library for testing the target
//!
//! This module provides a small blocking initiator focused on driving the
//! target from tests: it logs in (optionally with CHAP), runs SCSI commands
//! with Data-In collection and R2T handling, and can send arbitrary PDUs.
//!
//! # Overview
//!
//! The client provides:
//! - Raw TCP connection to a target
//! - Login with key negotiation (answers target offers, acknowledges
//!   Continue-bit responses)
//! - SCSI command execution (INQUIRY, READ CAPACITY, READ/WRITE 10, ...)
//! - Task management, NOP, SendTargets and logout
//! - Raw PDU transmission for edge-case tests
//!
//! # Example: Basic Connection and Login
//!
//! ```no_run
//! use iscsi_target::client::IscsiClient;
//!
//! # fn test() -> Result<(), Box<dyn std::error::Error>> {
//! let mut client = IscsiClient::connect("127.0.0.1:3260")?;
//! client.login(
//!     "iqn.2004-01.com:initiator",
//!     "iqn.2004-01.com:target",
//! )?;
//! let inquiry = client.inquiry(0, 36)?;
//! client.logout()?;
//! # Ok(())
//! # }
//! ```
//!
//! # Example: Raw PDU Transmission
//!
//! ```no_run
//! use iscsi_target::client::IscsiClient;
//! use iscsi_target::pdu::IscsiPdu;
//!
//! # fn test() -> Result<(), Box<dyn std::error::Error>> {
//! let mut client = IscsiClient::connect("127.0.0.1:3260")?;
//! let mut pdu = IscsiPdu::new();
//! pdu.opcode = 0x10; // SNACK, not supported
//! client.send_pdu(pdu)?;
//! let reject = client.recv_pdu()?;
//! # Ok(())
//! # }
//! ```

use crate::auth::{format_chap_binary, parse_chap_binary, ChapAuthState};
use crate::error::{IscsiError, ScsiResult};
use crate::params::key;
use crate::pdu::{
    flags, logout_reason, opcode, pack_lun, parse_text_parameters, serialize_text_parameters, stage,
    IscsiPdu, RESERVED_TAG,
};
use crate::scsi::ScsiOpcode;
use crate::wire::{stat_sn_use, PduReader, PduWriter, StatSnUse};
use std::net::TcpStream;
use std::time::Duration;

/// Login rounds before the client gives up
const MAX_CLIENT_ROUNDS: usize = 16;

/// Keys a target declares rather than negotiates; never echoed back
const DECLARATIVE_KEYS: &[&str] = &[
    key::TARGET_PORTAL_GROUP_TAG,
    key::TARGET_ALIAS,
    key::TARGET_ADDRESS,
    key::MAX_RECV_DATA_SEGMENT_LENGTH,
];

/// CHAP secret used by the client during login
#[derive(Debug, Clone)]
pub struct ChapSecret {
    pub user: String,
    pub secret: String,
}

/// Outcome of a SCSI command
#[derive(Debug, Clone, Default)]
pub struct CommandResult {
    pub status: u8,
    /// Data-In payload, assembled by buffer offset
    pub data: Vec<u8>,
    pub sense: Option<Vec<u8>>,
    /// Residual flags (O/U bits) and count
    pub residual_flags: u8,
    pub residual_count: u32,
    /// R2Ts answered while writing
    pub r2t_count: usize,
}

/// iSCSI client for connecting to targets and sending/receiving PDUs
pub struct IscsiClient {
    reader: PduReader<TcpStream>,
    writer: PduWriter<TcpStream>,
    isid: [u8; 6],
    tsih: u16,
    cid: u16,
    cmd_sn: u32,
    exp_stat_sn: u32,
    max_cmd_sn: u32,
    next_itt: u32,
    /// Target's MaxRecvDataSegmentLength
    target_mrdsl: usize,
    immediate_data: bool,
    initialized: bool,
    /// Unsolicited NOP-In / Async PDUs seen while waiting for something else
    unsolicited: Vec<IscsiPdu>,
}

impl IscsiClient {
    /// Connect to an iSCSI target at the given address
    ///
    /// # Arguments
    ///
    /// * `addr` - Address and port in format "host:port" (e.g., "127.0.0.1:3260")
    ///
    /// # Errors
    ///
    /// Returns an error if the TCP connection fails
    pub fn connect(addr: &str) -> ScsiResult<Self> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(Duration::from_secs(10)))?;
        stream.set_write_timeout(Some(Duration::from_secs(10)))?;

        Ok(IscsiClient {
            reader: PduReader::new(stream.try_clone()?),
            writer: PduWriter::new(stream),
            isid: [0x80, 0x00, 0x00, 0x00, 0x00, 0x01],
            tsih: 0,
            cid: 1,
            cmd_sn: 1,
            exp_stat_sn: 0,
            max_cmd_sn: 1,
            next_itt: 1,
            target_mrdsl: 8192,
            immediate_data: true,
            initialized: false,
            unsolicited: Vec::new(),
        })
    }

    /// Use a specific ISID, TSIH and CID for the next login
    ///
    /// A non-zero TSIH adds this connection to an existing session.
    pub fn with_identity(mut self, isid: [u8; 6], tsih: u16, cid: u16) -> Self {
        self.isid = isid;
        self.tsih = tsih;
        self.cid = cid;
        self
    }

    /// Change how long reads may block
    pub fn set_read_timeout(&mut self, timeout: Option<Duration>) -> ScsiResult<()> {
        self.reader.get_ref().set_read_timeout(timeout)?;
        Ok(())
    }

    fn alloc_itt(&mut self) -> u32 {
        let itt = self.next_itt;
        self.next_itt = self.next_itt.wrapping_add(1);
        if self.next_itt == RESERVED_TAG {
            self.next_itt = 1;
        }
        itt
    }

    /// Send a PDU to the target
    pub fn send_pdu(&mut self, pdu: IscsiPdu) -> ScsiResult<()> {
        self.writer.send_pdu(pdu)?;
        Ok(())
    }

    /// Receive a PDU from the target, tracking StatSN and the CmdSN window
    pub fn recv_pdu(&mut self) -> ScsiResult<IscsiPdu> {
        let pdu = self.reader.recv_pdu()?;
        if stat_sn_use(&pdu) == StatSnUse::Advance {
            self.exp_stat_sn = pdu.stat_sn().wrapping_add(1);
        }
        if pdu.is_target_pdu() && stat_sn_use(&pdu) != StatSnUse::Zero {
            self.max_cmd_sn = pdu.max_cmd_sn();
        }
        Ok(pdu)
    }

    /// Receive the next PDU for `itt`, stashing unsolicited ones
    fn recv_for(&mut self, itt: u32) -> ScsiResult<IscsiPdu> {
        loop {
            let pdu = self.recv_pdu()?;
            if pdu.itt == itt || pdu.opcode == opcode::REJECT {
                return Ok(pdu);
            }
            log::debug!("client stashing {} ITT {:#x}", pdu.opcode_name(), pdu.itt);
            self.unsolicited.push(pdu);
        }
    }

    /// Unsolicited PDUs collected so far
    pub fn take_unsolicited(&mut self) -> Vec<IscsiPdu> {
        std::mem::take(&mut self.unsolicited)
    }

    /// Perform iSCSI login for a Normal session
    ///
    /// # Arguments
    ///
    /// * `initiator_name` - IQN of the initiator (e.g., "iqn.2004-01.com:initiator")
    /// * `target_name` - IQN of the target (e.g., "iqn.2004-01.com:target")
    ///
    /// # Errors
    ///
    /// Returns [`IscsiError::Login`] with the target's status if it refuses
    pub fn login(&mut self, initiator_name: &str, target_name: &str) -> ScsiResult<()> {
        self.login_with(initiator_name, Some(target_name), None, &[])
    }

    /// Login authenticating with CHAP
    pub fn login_chap(&mut self, initiator_name: &str, target_name: &str, chap: &ChapSecret) -> ScsiResult<()> {
        self.login_with(initiator_name, Some(target_name), Some(chap), &[])
    }

    /// Login offering extra operational keys
    pub fn login_with(
        &mut self,
        initiator_name: &str,
        target_name: Option<&str>,
        chap: Option<&ChapSecret>,
        extra: &[(&str, &str)],
    ) -> ScsiResult<()> {
        let mut security = vec![(key::INITIATOR_NAME.to_string(), initiator_name.to_string())];
        match target_name {
            Some(name) => security.push((key::TARGET_NAME.to_string(), name.to_string())),
            None => security.push((key::SESSION_TYPE.to_string(), "Discovery".to_string())),
        }
        let method = if chap.is_some() { "CHAP" } else { "None" };
        security.push((key::AUTH_METHOD.to_string(), method.to_string()));

        if let Some(chap) = chap {
            let replies = self.login_round(stage::SECURITY, stage::OPERATIONAL, false, security)?.1;
            if reply(&replies, key::AUTH_METHOD) != Some("CHAP") {
                return Err(IscsiError::Auth("target did not select CHAP".to_string()));
            }
            let replies = self
                .login_round(stage::SECURITY, stage::OPERATIONAL, false, vec![("CHAP_A".to_string(), "5".to_string())])?
                .1;
            let id: u8 = reply(&replies, "CHAP_I")
                .and_then(|v| v.parse().ok())
                .ok_or_else(|| IscsiError::Auth("no CHAP_I from target".to_string()))?;
            let challenge = parse_chap_binary(
                reply(&replies, "CHAP_C").ok_or_else(|| IscsiError::Auth("no CHAP_C from target".to_string()))?,
            )?;
            let answer = ChapAuthState::from_parts(id, challenge).calculate_response(&chap.secret);
            let keys = vec![
                ("CHAP_N".to_string(), chap.user.clone()),
                ("CHAP_R".to_string(), format_chap_binary(&answer)),
            ];
            self.negotiate_stage(stage::SECURITY, stage::OPERATIONAL, keys)?;
        } else {
            self.negotiate_stage(stage::SECURITY, stage::OPERATIONAL, security)?;
        }

        let mut operational = vec![
            (key::HEADER_DIGEST.to_string(), "None".to_string()),
            (key::DATA_DIGEST.to_string(), "None".to_string()),
            (key::MAX_RECV_DATA_SEGMENT_LENGTH.to_string(), "8192".to_string()),
        ];
        if target_name.is_some() {
            operational.push((key::IMMEDIATE_DATA.to_string(), "Yes".to_string()));
            operational.push((key::INITIAL_R2T.to_string(), "Yes".to_string()));
        }
        for (k, v) in extra {
            operational.retain(|(name, _)| name != k);
            operational.push((k.to_string(), v.to_string()));
        }
        let replies = self.negotiate_stage(stage::OPERATIONAL, stage::FULL_FEATURE, operational)?;

        if let Some(mrdsl) = reply(&replies, key::MAX_RECV_DATA_SEGMENT_LENGTH).and_then(|v| v.parse().ok()) {
            self.target_mrdsl = mrdsl;
        }
        match reply(&replies, key::IMMEDIATE_DATA) {
            Some("Yes") => self.immediate_data = true,
            Some("No") => self.immediate_data = false,
            _ => {}
        }
        self.initialized = true;
        Ok(())
    }

    /// Discover available targets at the connected portal
    ///
    /// Performs a Discovery login followed by SendTargets=All and returns
    /// (target_iqn, target_address) pairs.
    pub fn discover(&mut self, initiator_name: &str) -> ScsiResult<Vec<(String, String)>> {
        self.login_with(initiator_name, None, None, &[])?;
        self.send_targets("All")
    }

    /// Run SendTargets on an established session
    pub fn send_targets(&mut self, value: &str) -> ScsiResult<Vec<(String, String)>> {
        let params = self.text_request(&[(key::SEND_TARGETS, value)])?;

        let mut targets = Vec::new();
        let mut current_target: Option<String> = None;
        for (name, value) in params {
            match name.as_str() {
                "TargetName" => current_target = Some(value),
                "TargetAddress" => {
                    if let Some(iqn) = current_target.take() {
                        targets.push((iqn, value));
                    }
                }
                _ => {}
            }
        }
        Ok(targets)
    }

    /// Send a Text Request and collect the (possibly continued) response
    pub fn text_request(&mut self, keys: &[(&str, &str)]) -> ScsiResult<Vec<(String, String)>> {
        let pairs: Vec<(String, String)> = keys.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        let itt = self.alloc_itt();
        let mut data = serialize_text_parameters(&pairs);
        let mut ttt = RESERVED_TAG;
        let mut collected = Vec::new();

        loop {
            let pdu = IscsiPdu::text_request(itt, ttt, self.cmd_sn, self.exp_stat_sn, true, std::mem::take(&mut data));
            self.send_pdu(pdu)?;

            let response = self.recv_for(itt)?;
            if response.opcode != opcode::TEXT_RESPONSE {
                return Err(IscsiError::InvalidPdu(format!(
                    "expected Text Response, got {}",
                    response.opcode_name()
                )));
            }
            collected.extend_from_slice(&response.data);
            if response.flags & flags::CONTINUE == 0 {
                break;
            }
            ttt = response.ttt();
        }
        parse_text_parameters(&collected)
    }

    /// One login request/response exchange; returns the raw response and its keys
    ///
    /// Continue-bit responses are acknowledged and reassembled.
    pub fn login_round(
        &mut self,
        csg: u8,
        nsg: u8,
        transit: bool,
        keys: Vec<(String, String)>,
    ) -> ScsiResult<(IscsiPdu, Vec<(String, String)>)> {
        let itt = self.next_itt;
        let request = IscsiPdu::login_request(
            self.isid,
            self.tsih,
            self.cid,
            itt,
            self.cmd_sn,
            self.exp_stat_sn,
            csg,
            nsg,
            transit,
            serialize_text_parameters(&keys),
        );
        self.send_pdu(request)?;

        let mut collected = Vec::new();
        loop {
            let response = self.recv_pdu()?;
            if response.opcode != opcode::LOGIN_RESPONSE {
                return Err(IscsiError::InvalidPdu(format!(
                    "expected Login Response, got {}",
                    response.opcode_name()
                )));
            }
            let class = response.login_status_class();
            if class != crate::pdu::login_status::SUCCESS {
                let detail = response.login_status_detail();
                return Err(IscsiError::login(
                    class,
                    detail,
                    crate::error::decode_login_status(class, detail),
                ));
            }
            collected.extend_from_slice(&response.data);
            if response.flags & flags::CONTINUE == 0 {
                self.tsih = response.login_tsih();
                let keys = parse_text_parameters(&collected)?;
                return Ok((response, keys));
            }
            let ack = IscsiPdu::login_request(
                self.isid,
                self.tsih,
                self.cid,
                itt,
                self.cmd_sn,
                self.exp_stat_sn,
                csg,
                nsg,
                false,
                Vec::new(),
            );
            self.send_pdu(ack)?;
        }
    }

    /// Exchange requests until the target agrees to move to `nsg`
    fn negotiate_stage(&mut self, csg: u8, nsg: u8, keys: Vec<(String, String)>) -> ScsiResult<Vec<(String, String)>> {
        let mut offered: Vec<String> = keys.iter().map(|(k, _)| k.clone()).collect();
        let mut keys = keys;
        let mut all = Vec::new();

        for _ in 0..MAX_CLIENT_ROUNDS {
            let (response, replies) = self.login_round(csg, nsg, true, keys)?;
            let transit = response.flags & flags::TRANSIT != 0;

            keys = replies
                .iter()
                .filter(|(k, _)| !offered.contains(k) && !DECLARATIVE_KEYS.contains(&k.as_str()))
                .cloned()
                .collect();
            offered.extend(keys.iter().map(|(k, _)| k.clone()));
            all.extend(replies);

            let next = response.flags & flags::NSG_MASK;
            if transit && next == nsg {
                return Ok(all);
            }
        }
        Err(IscsiError::Protocol(format!("login stuck in stage {}", csg)))
    }

    /// Send a SCSI command and collect its status and data
    ///
    /// # Arguments
    ///
    /// * `lun` - Logical unit number
    /// * `cdb` - SCSI Command Descriptor Block
    /// * `read_len` - Expected Data-In length (0 for none)
    /// * `write_data` - Data for a write command
    pub fn scsi_command(
        &mut self,
        lun: u16,
        cdb: &[u8],
        read_len: u32,
        write_data: Option<&[u8]>,
    ) -> ScsiResult<CommandResult> {
        if !self.initialized {
            return Err(IscsiError::Session("Not logged in. Call login() first.".to_string()));
        }

        let itt = self.alloc_itt();
        let raw_lun = pack_lun(lun);
        let write = write_data.unwrap_or_default();
        let edtl = if write_data.is_some() { write.len() as u32 } else { read_len };
        let immediate_len = if self.immediate_data { write.len().min(self.target_mrdsl) } else { 0 };

        let pdu = IscsiPdu::scsi_command(
            raw_lun,
            itt,
            self.cmd_sn,
            self.exp_stat_sn,
            cdb,
            read_len > 0,
            write_data.is_some(),
            edtl,
            write[..immediate_len].to_vec(),
            true,
        );
        self.cmd_sn = self.cmd_sn.wrapping_add(1);
        self.send_pdu(pdu)?;

        let mut result = CommandResult::default();
        loop {
            let pdu = self.recv_for(itt)?;
            match pdu.opcode {
                opcode::SCSI_DATA_IN => {
                    let offset = pdu.buffer_offset() as usize;
                    let end = offset + pdu.data.len();
                    if result.data.len() < end {
                        result.data.resize(end, 0);
                    }
                    result.data[offset..end].copy_from_slice(&pdu.data);
                    if pdu.flags & flags::STATUS != 0 {
                        result.status = pdu.opcode_fields[1];
                        result.residual_flags = pdu.flags & (flags::OVERFLOW | flags::UNDERFLOW);
                        result.residual_count = pdu.residual_count();
                        return Ok(result);
                    }
                }
                opcode::R2T => {
                    result.r2t_count += 1;
                    let offset = pdu.buffer_offset() as usize;
                    let length = pdu.desired_length() as usize;
                    let end = (offset + length).min(write.len());
                    self.send_data_out(raw_lun, itt, pdu.ttt(), &write[offset.min(end)..end], offset as u32)?;
                }
                opcode::SCSI_RESPONSE => {
                    result.status = pdu.scsi_status();
                    result.sense = pdu.sense_bytes().map(<[u8]>::to_vec);
                    result.residual_flags = pdu.flags & (flags::OVERFLOW | flags::UNDERFLOW);
                    result.residual_count = pdu.residual_count();
                    return Ok(result);
                }
                opcode::REJECT => {
                    return Err(IscsiError::Protocol(format!(
                        "command rejected, reason {:#04x}",
                        pdu.opcode_fields[0]
                    )))
                }
                _ => {
                    return Err(IscsiError::InvalidPdu(format!(
                        "unexpected {} for ITT {:#x}",
                        pdu.opcode_name(),
                        itt
                    )))
                }
            }
        }
    }

    fn send_data_out(&mut self, lun: u64, itt: u32, ttt: u32, data: &[u8], base: u32) -> ScsiResult<()> {
        let chunks: Vec<&[u8]> = data.chunks(self.target_mrdsl.max(1)).collect();
        let last = chunks.len().saturating_sub(1);
        let mut offset = base;
        for (data_sn, chunk) in chunks.iter().enumerate() {
            let pdu = IscsiPdu::scsi_data_out(
                lun,
                itt,
                ttt,
                self.exp_stat_sn,
                data_sn as u32,
                offset,
                chunk.to_vec(),
                data_sn == last,
            );
            self.send_pdu(pdu)?;
            offset += chunk.len() as u32;
        }
        Ok(())
    }

    /// Standard INQUIRY
    pub fn inquiry(&mut self, lun: u16, allocation_length: u8) -> ScsiResult<CommandResult> {
        let cdb = [ScsiOpcode::Inquiry as u8, 0, 0, 0, allocation_length, 0];
        self.scsi_command(lun, &cdb, allocation_length as u32, None)
    }

    pub fn test_unit_ready(&mut self, lun: u16) -> ScsiResult<CommandResult> {
        self.scsi_command(lun, &[ScsiOpcode::TestUnitReady as u8, 0, 0, 0, 0, 0], 0, None)
    }

    /// READ CAPACITY (10): returns (last LBA, block size)
    pub fn read_capacity(&mut self, lun: u16) -> ScsiResult<(u32, u32)> {
        let mut cdb = [0u8; 10];
        cdb[0] = ScsiOpcode::ReadCapacity10 as u8;
        let result = self.scsi_command(lun, &cdb, 8, None)?;
        if result.status != crate::pdu::scsi_status::GOOD || result.data.len() < 8 {
            return Err(IscsiError::Scsi(format!("READ CAPACITY failed, status {:#04x}", result.status)));
        }
        let last_lba = u32::from_be_bytes([result.data[0], result.data[1], result.data[2], result.data[3]]);
        let block = u32::from_be_bytes([result.data[4], result.data[5], result.data[6], result.data[7]]);
        Ok((last_lba, block))
    }

    pub fn report_luns(&mut self, allocation_length: u32) -> ScsiResult<CommandResult> {
        let mut cdb = [0u8; 12];
        cdb[0] = ScsiOpcode::ReportLuns as u8;
        cdb[6..10].copy_from_slice(&allocation_length.to_be_bytes());
        self.scsi_command(0, &cdb, allocation_length, None)
    }

    /// READ (10) of `blocks` 512-byte blocks
    pub fn read10(&mut self, lun: u16, lba: u32, blocks: u16) -> ScsiResult<CommandResult> {
        let mut cdb = [0u8; 10];
        cdb[0] = ScsiOpcode::Read10 as u8;
        cdb[2..6].copy_from_slice(&lba.to_be_bytes());
        cdb[7..9].copy_from_slice(&blocks.to_be_bytes());
        self.scsi_command(lun, &cdb, blocks as u32 * 512, None)
    }

    /// WRITE (10); `data` must be a whole number of 512-byte blocks
    pub fn write10(&mut self, lun: u16, lba: u32, data: &[u8]) -> ScsiResult<CommandResult> {
        let blocks = (data.len() / 512) as u16;
        let mut cdb = [0u8; 10];
        cdb[0] = ScsiOpcode::Write10 as u8;
        cdb[2..6].copy_from_slice(&lba.to_be_bytes());
        cdb[7..9].copy_from_slice(&blocks.to_be_bytes());
        self.scsi_command(lun, &cdb, 0, Some(data))
    }

    /// Send a Task Management request and return the response code
    pub fn task_management(&mut self, function: u8, lun: u16, referenced_task_tag: u32) -> ScsiResult<u8> {
        let itt = self.alloc_itt();
        let pdu = IscsiPdu::task_mgmt_request(
            function,
            pack_lun(lun),
            itt,
            referenced_task_tag,
            self.cmd_sn,
            self.exp_stat_sn,
            self.cmd_sn,
        );
        self.send_pdu(pdu)?;
        let response = self.recv_for(itt)?;
        if response.opcode != opcode::TASK_MANAGEMENT_RESPONSE {
            return Err(IscsiError::InvalidPdu(format!(
                "expected Task Management Response, got {}",
                response.opcode_name()
            )));
        }
        Ok(response.opcode_fields[0])
    }

    /// NOP-Out ping; returns the echoed data
    pub fn nop(&mut self, data: &[u8]) -> ScsiResult<Vec<u8>> {
        let itt = self.alloc_itt();
        let pdu = IscsiPdu::nop_out(itt, RESERVED_TAG, self.cmd_sn, self.exp_stat_sn, true, data.to_vec());
        self.send_pdu(pdu)?;
        let response = self.recv_for(itt)?;
        if response.opcode != opcode::NOP_IN {
            return Err(IscsiError::InvalidPdu(format!("expected NOP-In, got {}", response.opcode_name())));
        }
        Ok(response.data)
    }

    /// Perform iSCSI logout (close session)
    pub fn logout(&mut self) -> ScsiResult<u8> {
        let cid = self.cid;
        self.logout_with(logout_reason::CLOSE_SESSION, cid)
    }

    /// Logout with an explicit reason and CID; returns the response code
    pub fn logout_with(&mut self, reason: u8, cid: u16) -> ScsiResult<u8> {
        let itt = self.alloc_itt();
        let pdu = IscsiPdu::logout_request(itt, reason, cid, self.cmd_sn, self.exp_stat_sn);
        self.send_pdu(pdu)?;
        let response = self.recv_for(itt)?;
        if response.opcode != opcode::LOGOUT_RESPONSE {
            return Err(IscsiError::InvalidPdu(format!(
                "expected Logout Response, got {}",
                response.opcode_name()
            )));
        }
        if response.response_code() == crate::pdu::logout_response::SUCCESS && cid == self.cid {
            self.initialized = false;
        }
        Ok(response.response_code())
    }

    /// Session handle assigned by the target
    pub fn tsih(&self) -> u16 {
        self.tsih
    }

    pub fn isid(&self) -> [u8; 6] {
        self.isid
    }

    /// Get the current command sequence number
    pub fn cmd_sn(&self) -> u32 {
        self.cmd_sn
    }

    /// Skip ahead (or back) in CmdSN, for window tests
    pub fn set_cmd_sn(&mut self, cmd_sn: u32) {
        self.cmd_sn = cmd_sn;
    }

    /// Get the current expected status sequence number
    pub fn exp_stat_sn(&self) -> u32 {
        self.exp_stat_sn
    }

    /// Get the maximum command sequence number from target
    pub fn max_cmd_sn(&self) -> u32 {
        self.max_cmd_sn
    }

    /// Check if client is logged in (in full feature phase)
    pub fn is_logged_in(&self) -> bool {
        self.initialized
    }
}

fn reply<'a>(replies: &'a [(String, String)], name: &str) -> Option<&'a str> {
    replies.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str())
}
