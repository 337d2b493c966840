//! iSCSI PDU (Protocol Data Unit) parsing and serialization
//!
//! This module handles the binary protocol format for iSCSI PDUs
//! based on RFC 3720: https://datatracker.ietf.org/doc/html/rfc3720
//!
//! Target-side PDUs are built without StatSN/ExpCmdSN/MaxCmdSN; the
//! connection stamps those fields right before the PDU goes on the wire
//! (see [`crate::wire`]).

// Protocol functions require many parameters per RFC 3720
#![allow(clippy::too_many_arguments)]

use crate::error::{IscsiError, ScsiResult};
use byteorder::{BigEndian, ByteOrder, ReadBytesExt};
use std::io::{Cursor, Read};

/// BHS (Basic Header Segment) size in bytes
pub const BHS_SIZE: usize = 48;

/// Reserved tag value (ITT/TTT "no tag")
pub const RESERVED_TAG: u32 = 0xFFFF_FFFF;

/// Soft cap on a complete login/text key block
pub const MAX_TEXT_LEN: usize = 8192;

/// iSCSI protocol version implemented by this target (draft 20 / RFC 3720)
pub const ISCSI_VERSION: u8 = 0;

/// iSCSI PDU Opcodes (RFC 3720 Section 10)
pub mod opcode {
    // Initiator opcodes (client → target)
    pub const NOP_OUT: u8 = 0x00;
    pub const SCSI_COMMAND: u8 = 0x01;
    pub const TASK_MANAGEMENT_REQUEST: u8 = 0x02;
    pub const LOGIN_REQUEST: u8 = 0x03;
    pub const TEXT_REQUEST: u8 = 0x04;
    pub const SCSI_DATA_OUT: u8 = 0x05;
    pub const LOGOUT_REQUEST: u8 = 0x06;
    pub const SNACK_REQUEST: u8 = 0x10;

    // Target opcodes (target → client)
    pub const NOP_IN: u8 = 0x20;
    pub const SCSI_RESPONSE: u8 = 0x21;
    pub const TASK_MANAGEMENT_RESPONSE: u8 = 0x22;
    pub const LOGIN_RESPONSE: u8 = 0x23;
    pub const TEXT_RESPONSE: u8 = 0x24;
    pub const SCSI_DATA_IN: u8 = 0x25;
    pub const LOGOUT_RESPONSE: u8 = 0x26;
    pub const R2T: u8 = 0x31;
    pub const ASYNC_MESSAGE: u8 = 0x32;
    pub const REJECT: u8 = 0x3F;
}

/// iSCSI PDU flags (byte 1)
pub mod flags {
    pub const FINAL: u8 = 0x80;
    pub const CONTINUE: u8 = 0x40;

    // SCSI command flags
    pub const READ: u8 = 0x40;
    pub const WRITE: u8 = 0x20;
    pub const ATTR_SIMPLE: u8 = 0x01;

    // Login flags
    pub const TRANSIT: u8 = 0x80;
    pub const CSG_MASK: u8 = 0x0C;
    pub const NSG_MASK: u8 = 0x03;

    // SCSI Response / Data-In residual and status flags
    pub const ACKNOWLEDGE: u8 = 0x40;
    pub const OVERFLOW: u8 = 0x04;
    pub const UNDERFLOW: u8 = 0x02;
    pub const STATUS: u8 = 0x01;
}

/// Login stages (CSG/NSG values)
pub mod stage {
    pub const SECURITY: u8 = 0;
    pub const OPERATIONAL: u8 = 1;
    pub const FULL_FEATURE: u8 = 3;
}

/// Login status classes and details (RFC 3720 Section 10.13.5)
pub mod login_status {
    pub const SUCCESS: u8 = 0x00;
    pub const REDIRECTION: u8 = 0x01;
    pub const INITIATOR_ERROR: u8 = 0x02;
    pub const TARGET_ERROR: u8 = 0x03;

    // Status detail (low byte, interpreted per class)
    pub const DETAIL_ERR: u8 = 0x00;
    pub const DETAIL_NOT_AUTH: u8 = 0x01;
    pub const DETAIL_NOT_ALLOWED: u8 = 0x02;
    pub const DETAIL_NOT_FOUND: u8 = 0x03;
    pub const DETAIL_TARGET_REMOVED: u8 = 0x04;
    pub const DETAIL_VERSION_NOT_SUPPORTED: u8 = 0x05;
    pub const DETAIL_TOO_MANY_CONNECTIONS: u8 = 0x06;
    pub const DETAIL_MISSING_PARAMETER: u8 = 0x07;
    pub const DETAIL_NO_SESSION_SPANNING: u8 = 0x08;
    pub const DETAIL_SESSION_TYPE_NOT_SUPPORTED: u8 = 0x09;
    pub const DETAIL_SESSION_DOES_NOT_EXIST: u8 = 0x0A;
    pub const DETAIL_INVALID_DURING_LOGIN: u8 = 0x0B;

    // TARGET_ERROR details
    pub const DETAIL_SERVICE_UNAVAILABLE: u8 = 0x01;
    pub const DETAIL_OUT_OF_RESOURCES: u8 = 0x02;
}

/// SCSI status codes carried in SCSI Response / Data-In
pub mod scsi_status {
    pub const GOOD: u8 = 0x00;
    pub const CHECK_CONDITION: u8 = 0x02;
    pub const BUSY: u8 = 0x08;
    pub const TASK_SET_FULL: u8 = 0x28;
    pub const TASK_ABORTED: u8 = 0x40;
}

/// iSCSI response codes in the SCSI Response PDU
pub mod scsi_response_code {
    pub const COMMAND_COMPLETED: u8 = 0x00;
    pub const TARGET_FAILURE: u8 = 0x01;
}

/// Reject reasons (RFC 3720 Section 10.17.1)
pub mod reject_reason {
    pub const DATA_DIGEST_ERROR: u8 = 0x02;
    pub const PROTOCOL_ERROR: u8 = 0x04;
    pub const COMMAND_NOT_SUPPORTED: u8 = 0x05;
    pub const IMMEDIATE_COMMAND_REJECTED: u8 = 0x06;
    pub const INVALID_PDU_FIELD: u8 = 0x09;
    pub const WAITING_FOR_LOGOUT: u8 = 0x0C;
}

/// Logout reason codes
pub mod logout_reason {
    pub const CLOSE_SESSION: u8 = 0;
    pub const CLOSE_CONNECTION: u8 = 1;
    pub const REMOVE_CONNECTION_FOR_RECOVERY: u8 = 2;
}

/// Logout response codes
pub mod logout_response {
    pub const SUCCESS: u8 = 0;
    pub const CID_NOT_FOUND: u8 = 1;
    pub const CONNECTION_RECOVERY_NOT_SUPPORTED: u8 = 2;
    pub const CLEANUP_FAILED: u8 = 3;
}

/// Task management function codes (RFC 3720 Section 10.5.1)
pub mod task_function {
    pub const ABORT_TASK: u8 = 1;
    pub const ABORT_TASK_SET: u8 = 2;
    pub const CLEAR_ACA: u8 = 3;
    pub const CLEAR_TASK_SET: u8 = 4;
    pub const LOGICAL_UNIT_RESET: u8 = 5;
    pub const TARGET_WARM_RESET: u8 = 6;
    pub const TARGET_COLD_RESET: u8 = 7;
    pub const TASK_REASSIGN: u8 = 8;
}

/// Task management response codes (RFC 3720 Section 10.6.1)
pub mod task_response {
    pub const FUNCTION_COMPLETE: u8 = 0;
    pub const TASK_DOES_NOT_EXIST: u8 = 1;
    pub const LUN_DOES_NOT_EXIST: u8 = 2;
    pub const TASK_STILL_ALLEGIANT: u8 = 3;
    pub const REASSIGNMENT_NOT_SUPPORTED: u8 = 4;
    pub const FUNCTION_NOT_SUPPORTED: u8 = 5;
    pub const AUTHORIZATION_FAILED: u8 = 6;
    pub const FUNCTION_REJECTED: u8 = 255;
}

/// Async Message event codes (RFC 3720 Section 10.9.1)
pub mod async_event {
    pub const SCSI_EVENT: u8 = 0;
    pub const LOGOUT_REQUEST: u8 = 1;
    pub const DROP_CONNECTION: u8 = 2;
    pub const DROP_ALL_CONNECTIONS: u8 = 3;
    pub const RENEGOTIATE: u8 = 4;
    pub const VENDOR_SPECIFIC: u8 = 255;
}

/// Basic Header Segment (BHS) - 48 bytes
///
/// ```text
/// Byte/     0       |       1       |       2       |       3       |
///     /              |               |               |               |
///    |0 1 2 3 4 5 6 7|0 1 2 3 4 5 6 7|0 1 2 3 4 5 6 7|0 1 2 3 4 5 6 7|
///    +---------------+---------------+---------------+---------------+
///   0|.|I| Opcode    |F|  Opcode-specific fields                     |
///    +---------------+---------------+---------------+---------------+
///   4|TotalAHSLength | DataSegmentLength                             |
///    +---------------+---------------+---------------+---------------+
///   8| LUN or Opcode-specific fields                                 |
///    +                                                               +
///  12|                                                               |
///    +---------------+---------------+---------------+---------------+
///  16| Initiator Task Tag                                            |
///    +---------------+---------------+---------------+---------------+
///  20| Opcode-specific fields (28 bytes)                             |
///    +                                                               +
///  ...
///  44|                                                               |
///    +---------------+---------------+---------------+---------------+
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IscsiPdu {
    /// Opcode identifies the PDU type (lower 6 bits of byte 0)
    pub opcode: u8,
    /// Immediate flag (bit 6 of byte 0)
    pub immediate: bool,
    /// Opcode-specific flags (byte 1)
    pub flags: u8,
    /// Opcode-specific bytes 2-3 (version, response/status, reject reason)
    pub opcode_fields: [u8; 2],
    /// Total AHS (Additional Header Segment) length (4-byte units)
    pub ahs_length: u8,
    /// Data segment length (bytes)
    pub data_length: u32,
    /// Logical Unit Number or ISID/TSIH (bytes 8-15)
    pub lun: u64,
    /// Initiator Task Tag (bytes 16-19)
    pub itt: u32,
    /// Opcode-specific fields (bytes 20-47, 28 bytes)
    pub specific: [u8; 28],
    /// Data segment (variable length, unpadded)
    pub data: Vec<u8>,
}

impl Default for IscsiPdu {
    fn default() -> Self {
        Self::new()
    }
}

impl IscsiPdu {
    /// Create a new empty PDU
    pub fn new() -> Self {
        IscsiPdu {
            opcode: 0,
            immediate: false,
            flags: 0,
            opcode_fields: [0; 2],
            ahs_length: 0,
            data_length: 0,
            lun: 0,
            itt: 0,
            specific: [0u8; 28],
            data: Vec::new(),
        }
    }

    fn with_opcode(opcode: u8) -> Self {
        IscsiPdu {
            opcode,
            ..IscsiPdu::new()
        }
    }

    /// Parse the 48-byte BHS; `data` stays empty and `data_length` tells
    /// the caller how much to read next.
    pub fn parse_header(buf: &[u8]) -> ScsiResult<Self> {
        if buf.len() < BHS_SIZE {
            return Err(IscsiError::InvalidPdu(format!(
                "PDU too short: {} bytes, need at least {}",
                buf.len(),
                BHS_SIZE
            )));
        }

        let mut cursor = Cursor::new(buf);

        let byte0 = cursor.read_u8()?;
        let immediate = (byte0 & 0x40) != 0;
        let opcode = byte0 & 0x3F;
        let flags = cursor.read_u8()?;

        let mut opcode_fields = [0u8; 2];
        cursor.read_exact(&mut opcode_fields)?;

        let ahs_length = cursor.read_u8()?;
        let data_length = cursor.read_u24::<BigEndian>()?;
        let lun = cursor.read_u64::<BigEndian>()?;
        let itt = cursor.read_u32::<BigEndian>()?;

        let mut specific = [0u8; 28];
        cursor.read_exact(&mut specific)?;

        Ok(IscsiPdu {
            opcode,
            immediate,
            flags,
            opcode_fields,
            ahs_length,
            data_length,
            lun,
            itt,
            specific,
            data: Vec::new(),
        })
    }

    /// Parse a PDU from bytes
    ///
    /// The input buffer must contain the 48-byte BHS, any AHS and the
    /// padded data segment. Digests are handled by [`crate::wire`].
    pub fn from_bytes(buf: &[u8]) -> ScsiResult<Self> {
        let mut pdu = Self::parse_header(buf)?;

        let ahs_bytes = (pdu.ahs_length as usize) * 4;
        let padded_data_len = padded_len(pdu.data_length as usize);
        let total_len = BHS_SIZE + ahs_bytes + padded_data_len;

        if buf.len() < total_len {
            return Err(IscsiError::InvalidPdu(format!(
                "PDU incomplete: {} bytes, need {} (BHS={}, AHS={}, data={})",
                buf.len(),
                total_len,
                BHS_SIZE,
                ahs_bytes,
                padded_data_len
            )));
        }

        let data_start = BHS_SIZE + ahs_bytes;
        pdu.data = buf[data_start..data_start + pdu.data_length as usize].to_vec();
        Ok(pdu)
    }

    /// Serialize the BHS. DataSegmentLength is taken from `data`.
    pub fn header_bytes(&self) -> [u8; BHS_SIZE] {
        let mut bhs = [0u8; BHS_SIZE];
        bhs[0] = (if self.immediate { 0x40 } else { 0 }) | (self.opcode & 0x3F);
        bhs[1] = self.flags;
        bhs[2..4].copy_from_slice(&self.opcode_fields);
        // AHS is never emitted by this target
        bhs[4] = 0;
        BigEndian::write_u24(&mut bhs[5..8], self.data.len() as u32);
        BigEndian::write_u64(&mut bhs[8..16], self.lun);
        BigEndian::write_u32(&mut bhs[16..20], self.itt);
        bhs[20..48].copy_from_slice(&self.specific);
        bhs
    }

    /// Serialize PDU to bytes (no digests)
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.total_length());
        buf.extend_from_slice(&self.header_bytes());
        buf.extend_from_slice(&self.data);
        buf.resize(self.total_length(), 0);
        buf
    }

    /// Get the opcode name for debugging
    pub fn opcode_name(&self) -> &'static str {
        match self.opcode {
            opcode::NOP_OUT => "NOP-Out",
            opcode::SCSI_COMMAND => "SCSI Command",
            opcode::TASK_MANAGEMENT_REQUEST => "Task Management Request",
            opcode::LOGIN_REQUEST => "Login Request",
            opcode::TEXT_REQUEST => "Text Request",
            opcode::SCSI_DATA_OUT => "SCSI Data-Out",
            opcode::LOGOUT_REQUEST => "Logout Request",
            opcode::SNACK_REQUEST => "SNACK Request",
            opcode::NOP_IN => "NOP-In",
            opcode::SCSI_RESPONSE => "SCSI Response",
            opcode::TASK_MANAGEMENT_RESPONSE => "Task Management Response",
            opcode::LOGIN_RESPONSE => "Login Response",
            opcode::TEXT_RESPONSE => "Text Response",
            opcode::SCSI_DATA_IN => "SCSI Data-In",
            opcode::LOGOUT_RESPONSE => "Logout Response",
            opcode::R2T => "Ready To Transfer",
            opcode::ASYNC_MESSAGE => "Async Message",
            opcode::REJECT => "Reject",
            _ => "Unknown",
        }
    }

    /// Get the total PDU length including headers and padded data
    pub fn total_length(&self) -> usize {
        BHS_SIZE + (self.ahs_length as usize) * 4 + padded_len(self.data.len())
    }

    fn set_data(&mut self, data: Vec<u8>) {
        self.data_length = data.len() as u32;
        self.data = data;
    }

    // BHS offsets 20..48 live in `specific`

    pub(crate) fn field_u32(&self, bhs_offset: usize) -> u32 {
        BigEndian::read_u32(&self.specific[bhs_offset - 20..bhs_offset - 16])
    }

    pub(crate) fn set_field_u32(&mut self, bhs_offset: usize, value: u32) {
        BigEndian::write_u32(&mut self.specific[bhs_offset - 20..bhs_offset - 16], value);
    }

    pub(crate) fn field_u16(&self, bhs_offset: usize) -> u16 {
        BigEndian::read_u16(&self.specific[bhs_offset - 20..bhs_offset - 18])
    }

    pub(crate) fn set_field_u16(&mut self, bhs_offset: usize, value: u16) {
        BigEndian::write_u16(&mut self.specific[bhs_offset - 20..bhs_offset - 18], value);
    }

    /// StatSN of a target PDU (bytes 24-27)
    pub fn stat_sn(&self) -> u32 {
        self.field_u32(24)
    }

    pub fn set_stat_sn(&mut self, stat_sn: u32) {
        self.set_field_u32(24, stat_sn);
    }

    /// ExpCmdSN of a target PDU (bytes 28-31)
    pub fn exp_cmd_sn(&self) -> u32 {
        self.field_u32(28)
    }

    /// MaxCmdSN of a target PDU (bytes 32-35)
    pub fn max_cmd_sn(&self) -> u32 {
        self.field_u32(32)
    }

    /// Stamp ExpCmdSN/MaxCmdSN on a target PDU
    pub fn set_cmd_sn_window(&mut self, exp_cmd_sn: u32, max_cmd_sn: u32) {
        self.set_field_u32(28, exp_cmd_sn);
        self.set_field_u32(32, max_cmd_sn);
    }

    /// CmdSN of an initiator PDU (bytes 24-27)
    pub fn cmd_sn(&self) -> u32 {
        self.field_u32(24)
    }

    /// ExpStatSN of an initiator PDU (bytes 28-31)
    pub fn exp_stat_sn(&self) -> u32 {
        self.field_u32(28)
    }

    /// Whether this PDU type is sent by the target
    pub fn is_target_pdu(&self) -> bool {
        self.opcode & 0x20 != 0
    }

    fn expect_opcode(&self, expected: u8) -> ScsiResult<()> {
        if self.opcode != expected {
            return Err(IscsiError::InvalidPdu(format!(
                "Expected {} opcode 0x{:02x}, got 0x{:02x}",
                IscsiPdu::with_opcode(expected).opcode_name(),
                expected,
                self.opcode
            )));
        }
        Ok(())
    }
}

/// Round a data segment length up to the 4-byte boundary
pub fn padded_len(len: usize) -> usize {
    len.div_ceil(4) * 4
}

// ============================================================================
// LUN packing (SAM-2 Section 4.12.3)
// ============================================================================

/// LUN addressing methods understood on input
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LunAddressing {
    /// Method 00b, LUN in byte 1
    Peripheral,
    /// Method 01b, 14-bit LUN in the low 6 bits of byte 0 and byte 1
    Flat,
}

/// Largest LUN the flat space method can carry
pub const MAX_FLAT_LUN: u16 = 0x3FFF;

/// Pack a LUN into the 8-byte iSCSI LUN field
///
/// Peripheral addressing is used whenever the LUN fits in one byte. LUN 0
/// is eight zero bytes. LUNs above 0xFF fall back to flat addressing; the
/// target never emits one, since `MAX_LUNS` is well below that.
pub fn pack_lun(lun: u16) -> u64 {
    if lun <= 0xFF {
        pack_lun_with(lun, LunAddressing::Peripheral)
    } else {
        pack_lun_with(lun, LunAddressing::Flat)
    }
}

/// Pack a LUN using a specific addressing method
pub fn pack_lun_with(lun: u16, method: LunAddressing) -> u64 {
    let mut bytes = [0u8; 8];
    match method {
        LunAddressing::Peripheral => {
            bytes[1] = (lun & 0xFF) as u8;
        }
        LunAddressing::Flat => {
            let lun = lun & MAX_FLAT_LUN;
            bytes[0] = 0x40 | (lun >> 8) as u8;
            bytes[1] = (lun & 0xFF) as u8;
        }
    }
    u64::from_be_bytes(bytes)
}

/// Extract the LUN from the 8-byte iSCSI LUN field
pub fn unpack_lun(raw: u64) -> ScsiResult<u16> {
    let bytes = raw.to_be_bytes();
    match bytes[0] >> 6 {
        0b00 => Ok(bytes[1] as u16),
        0b01 => Ok((((bytes[0] & 0x3F) as u16) << 8) | bytes[1] as u16),
        method => Err(IscsiError::InvalidPdu(format!(
            "unsupported LUN addressing method {:#04b}",
            method
        ))),
    }
}

// ============================================================================
// Login Request/Response PDU helpers
// ============================================================================

/// Parsed Login Request
#[derive(Debug, Clone)]
pub struct LoginRequest {
    pub isid: [u8; 6],
    pub tsih: u16,
    pub cid: u16,
    pub itt: u32,
    pub cmd_sn: u32,
    pub exp_stat_sn: u32,
    pub immediate: bool,
    pub transit: bool,
    pub cont: bool,
    pub csg: u8,
    pub nsg: u8,
    pub version_max: u8,
    pub version_min: u8,
    /// Raw key block; continuation PDUs are concatenated before parsing
    pub data: Vec<u8>,
}

fn isid_tsih_to_lun(isid: [u8; 6], tsih: u16) -> u64 {
    let mut lun_bytes = [0u8; 8];
    lun_bytes[0..6].copy_from_slice(&isid);
    lun_bytes[6..8].copy_from_slice(&tsih.to_be_bytes());
    u64::from_be_bytes(lun_bytes)
}

impl IscsiPdu {
    /// Create a Login Request PDU
    pub fn login_request(
        isid: [u8; 6],
        tsih: u16,
        cid: u16,
        itt: u32,
        cmd_sn: u32,
        exp_stat_sn: u32,
        csg: u8,
        nsg: u8,
        transit: bool,
        data: Vec<u8>,
    ) -> Self {
        let mut pdu = IscsiPdu::with_opcode(opcode::LOGIN_REQUEST);
        pdu.immediate = true;
        pdu.flags = (if transit { flags::TRANSIT } else { 0 })
            | ((csg & 0x03) << 2)
            | (nsg & 0x03);
        pdu.opcode_fields = [ISCSI_VERSION, ISCSI_VERSION];
        pdu.lun = isid_tsih_to_lun(isid, tsih);
        pdu.itt = itt;
        pdu.set_field_u16(20, cid);
        pdu.set_field_u32(24, cmd_sn);
        pdu.set_field_u32(28, exp_stat_sn);
        pdu.set_data(data);
        pdu
    }

    /// Parse Login Request fields
    pub fn parse_login_request(&self) -> ScsiResult<LoginRequest> {
        self.expect_opcode(opcode::LOGIN_REQUEST)?;

        let lun_bytes = self.lun.to_be_bytes();
        let mut isid = [0u8; 6];
        isid.copy_from_slice(&lun_bytes[0..6]);
        let tsih = BigEndian::read_u16(&lun_bytes[6..8]);

        Ok(LoginRequest {
            isid,
            tsih,
            cid: self.field_u16(20),
            itt: self.itt,
            cmd_sn: self.field_u32(24),
            exp_stat_sn: self.field_u32(28),
            immediate: self.immediate,
            transit: (self.flags & flags::TRANSIT) != 0,
            cont: (self.flags & flags::CONTINUE) != 0,
            csg: (self.flags & flags::CSG_MASK) >> 2,
            nsg: self.flags & flags::NSG_MASK,
            version_max: self.opcode_fields[0],
            version_min: self.opcode_fields[1],
            data: self.data.clone(),
        })
    }

    /// Create a Login Response PDU
    ///
    /// When `transit` is false the NSG bits are left clear.
    pub fn login_response(
        isid: [u8; 6],
        tsih: u16,
        itt: u32,
        status_class: u8,
        status_detail: u8,
        csg: u8,
        nsg: u8,
        transit: bool,
        data: Vec<u8>,
    ) -> Self {
        let mut pdu = IscsiPdu::with_opcode(opcode::LOGIN_RESPONSE);
        pdu.flags = ((csg & 0x03) << 2)
            | if transit {
                flags::TRANSIT | (nsg & 0x03)
            } else {
                0
            };
        pdu.opcode_fields = [ISCSI_VERSION, ISCSI_VERSION];
        pdu.lun = isid_tsih_to_lun(isid, tsih);
        pdu.itt = itt;
        pdu.specific[16] = status_class;
        pdu.specific[17] = status_detail;
        pdu.set_data(data);
        pdu
    }

    /// Create a Login Reject: CSG/NSG/T cleared, serial numbers zeroed, no data
    pub fn login_reject(isid: [u8; 6], tsih: u16, itt: u32, status_class: u8, status_detail: u8) -> Self {
        let mut pdu = IscsiPdu::with_opcode(opcode::LOGIN_RESPONSE);
        pdu.opcode_fields = [ISCSI_VERSION, ISCSI_VERSION];
        pdu.lun = isid_tsih_to_lun(isid, tsih);
        pdu.itt = itt;
        pdu.specific[16] = status_class;
        pdu.specific[17] = status_detail;
        pdu
    }

    /// Login Response status class (byte 36)
    pub fn login_status_class(&self) -> u8 {
        self.specific[16]
    }

    /// Login Response status detail (byte 37)
    pub fn login_status_detail(&self) -> u8 {
        self.specific[17]
    }

    /// TSIH carried in a Login PDU (bytes 14-15)
    pub fn login_tsih(&self) -> u16 {
        (self.lun & 0xFFFF) as u16
    }
}

// ============================================================================
// SCSI Command/Response PDU helpers
// ============================================================================

/// Parsed SCSI Command
#[derive(Debug, Clone)]
pub struct ScsiCommandPdu {
    pub lun: u64,
    pub itt: u32,
    pub cmd_sn: u32,
    pub exp_stat_sn: u32,
    pub expected_data_length: u32,
    pub cdb: [u8; 16],
    pub immediate: bool,
    pub read: bool,
    pub write: bool,
    pub final_flag: bool,
    /// Immediate data carried with the command
    pub data: Vec<u8>,
}

/// Parsed SCSI Data-Out
#[derive(Debug, Clone)]
pub struct ScsiDataOutPdu {
    pub lun: u64,
    pub itt: u32,
    pub ttt: u32,
    pub exp_stat_sn: u32,
    pub data_sn: u32,
    pub buffer_offset: u32,
    pub data: Vec<u8>,
    pub final_flag: bool,
}

impl IscsiPdu {
    /// Create a SCSI Command PDU (initiator side)
    pub fn scsi_command(
        lun: u64,
        itt: u32,
        cmd_sn: u32,
        exp_stat_sn: u32,
        cdb: &[u8],
        read: bool,
        write: bool,
        expected_data_length: u32,
        immediate_data: Vec<u8>,
        final_flag: bool,
    ) -> Self {
        let mut pdu = IscsiPdu::with_opcode(opcode::SCSI_COMMAND);
        pdu.flags = flags::ATTR_SIMPLE
            | if final_flag { flags::FINAL } else { 0 }
            | if read { flags::READ } else { 0 }
            | if write { flags::WRITE } else { 0 };
        pdu.lun = lun;
        pdu.itt = itt;
        pdu.set_field_u32(20, expected_data_length);
        pdu.set_field_u32(24, cmd_sn);
        pdu.set_field_u32(28, exp_stat_sn);
        let len = cdb.len().min(16);
        pdu.specific[12..12 + len].copy_from_slice(&cdb[..len]);
        pdu.set_data(immediate_data);
        pdu
    }

    /// Parse SCSI Command PDU
    pub fn parse_scsi_command(&self) -> ScsiResult<ScsiCommandPdu> {
        self.expect_opcode(opcode::SCSI_COMMAND)?;

        let mut cdb = [0u8; 16];
        cdb.copy_from_slice(&self.specific[12..28]);

        Ok(ScsiCommandPdu {
            lun: self.lun,
            itt: self.itt,
            cmd_sn: self.field_u32(24),
            exp_stat_sn: self.field_u32(28),
            expected_data_length: self.field_u32(20),
            cdb,
            immediate: self.immediate,
            read: (self.flags & flags::READ) != 0,
            write: (self.flags & flags::WRITE) != 0,
            final_flag: (self.flags & flags::FINAL) != 0,
            data: self.data.clone(),
        })
    }

    /// Create a SCSI Response PDU
    ///
    /// Sense bytes are prefixed with their 2-byte SenseLength.
    pub fn scsi_response(
        itt: u32,
        response: u8,
        status: u8,
        residual_flags: u8,
        residual_count: u32,
        sense: Option<&[u8]>,
    ) -> Self {
        let mut pdu = IscsiPdu::with_opcode(opcode::SCSI_RESPONSE);
        pdu.flags = flags::FINAL | (residual_flags & (flags::OVERFLOW | flags::UNDERFLOW));
        pdu.opcode_fields = [response, status];
        pdu.itt = itt;
        pdu.set_field_u32(44, residual_count);

        if let Some(sense) = sense {
            let mut data = Vec::with_capacity(sense.len() + 2);
            data.extend_from_slice(&(sense.len() as u16).to_be_bytes());
            data.extend_from_slice(sense);
            pdu.set_data(data);
        }

        pdu
    }

    /// SCSI status byte of a SCSI Response or status-bearing Data-In
    pub fn scsi_status(&self) -> u8 {
        self.opcode_fields[1]
    }

    /// Sense bytes of a SCSI Response (without the SenseLength prefix)
    pub fn sense_bytes(&self) -> Option<&[u8]> {
        if self.data.len() < 2 {
            return None;
        }
        let len = BigEndian::read_u16(&self.data[0..2]) as usize;
        self.data.get(2..2 + len)
    }

    /// Residual count (bytes 44-47) of SCSI Response / Data-In
    pub fn residual_count(&self) -> u32 {
        self.field_u32(44)
    }

    /// Create a SCSI Data-In PDU (data from target to initiator)
    ///
    /// With `status` present the S bit is set and the status travels in
    /// byte 3 (phase collapse); the F bit must accompany it.
    pub fn scsi_data_in(
        lun: u64,
        itt: u32,
        data_sn: u32,
        buffer_offset: u32,
        data: Vec<u8>,
        final_flag: bool,
        status: Option<u8>,
        residual_flags: u8,
        residual_count: u32,
    ) -> Self {
        let mut pdu = IscsiPdu::with_opcode(opcode::SCSI_DATA_IN);

        let mut flags_byte = 0u8;
        if final_flag {
            flags_byte |= flags::FINAL;
        }
        if let Some(s) = status {
            flags_byte |= flags::STATUS | (residual_flags & (flags::OVERFLOW | flags::UNDERFLOW));
            pdu.opcode_fields[1] = s;
            pdu.set_field_u32(44, residual_count);
        }
        pdu.flags = flags_byte;
        pdu.lun = lun;
        pdu.itt = itt;
        pdu.set_field_u32(20, RESERVED_TAG);
        pdu.set_field_u32(36, data_sn);
        pdu.set_field_u32(40, buffer_offset);
        pdu.set_data(data);
        pdu
    }

    /// Create a SCSI Data-Out PDU (initiator side)
    pub fn scsi_data_out(
        lun: u64,
        itt: u32,
        ttt: u32,
        exp_stat_sn: u32,
        data_sn: u32,
        buffer_offset: u32,
        data: Vec<u8>,
        final_flag: bool,
    ) -> Self {
        let mut pdu = IscsiPdu::with_opcode(opcode::SCSI_DATA_OUT);
        pdu.flags = if final_flag { flags::FINAL } else { 0 };
        pdu.lun = lun;
        pdu.itt = itt;
        pdu.set_field_u32(20, ttt);
        pdu.set_field_u32(28, exp_stat_sn);
        pdu.set_field_u32(36, data_sn);
        pdu.set_field_u32(40, buffer_offset);
        pdu.set_data(data);
        pdu
    }

    /// Parse SCSI Data-Out PDU (data from initiator to target)
    pub fn parse_scsi_data_out(&self) -> ScsiResult<ScsiDataOutPdu> {
        self.expect_opcode(opcode::SCSI_DATA_OUT)?;

        Ok(ScsiDataOutPdu {
            lun: self.lun,
            itt: self.itt,
            ttt: self.field_u32(20),
            exp_stat_sn: self.field_u32(28),
            data_sn: self.field_u32(36),
            buffer_offset: self.field_u32(40),
            data: self.data.clone(),
            final_flag: (self.flags & flags::FINAL) != 0,
        })
    }

    /// Create an R2T PDU
    pub fn r2t(
        lun: u64,
        itt: u32,
        ttt: u32,
        r2t_sn: u32,
        buffer_offset: u32,
        desired_length: u32,
    ) -> Self {
        let mut pdu = IscsiPdu::with_opcode(opcode::R2T);
        pdu.flags = flags::FINAL;
        pdu.lun = lun;
        pdu.itt = itt;
        pdu.set_field_u32(20, ttt);
        pdu.set_field_u32(36, r2t_sn);
        pdu.set_field_u32(40, buffer_offset);
        pdu.set_field_u32(44, desired_length);
        pdu
    }

    /// Target Transfer Tag of R2T / NOP-In / Text PDUs (bytes 20-23)
    pub fn ttt(&self) -> u32 {
        self.field_u32(20)
    }

    /// Buffer offset of R2T / Data PDUs (bytes 40-43)
    pub fn buffer_offset(&self) -> u32 {
        self.field_u32(40)
    }

    /// Desired Data Transfer Length of an R2T (bytes 44-47)
    pub fn desired_length(&self) -> u32 {
        self.field_u32(44)
    }
}

// ============================================================================
// NOP-Out/NOP-In PDU helpers
// ============================================================================

/// Parsed NOP-Out
#[derive(Debug, Clone)]
pub struct NopOutPdu {
    pub lun: u64,
    pub itt: u32,
    pub ttt: u32,
    pub cmd_sn: u32,
    pub exp_stat_sn: u32,
    pub immediate: bool,
    pub data: Vec<u8>,
}

impl IscsiPdu {
    /// Create a NOP-In PDU
    ///
    /// A reply to a NOP-Out carries the initiator's ITT and TTT 0xFFFFFFFF;
    /// an unsolicited ping uses ITT 0xFFFFFFFF and a fresh TTT.
    pub fn nop_in(itt: u32, ttt: u32, lun: u64, data: Vec<u8>) -> Self {
        let mut pdu = IscsiPdu::with_opcode(opcode::NOP_IN);
        pdu.flags = flags::FINAL;
        pdu.lun = lun;
        pdu.itt = itt;
        pdu.set_field_u32(20, ttt);
        pdu.set_data(data);
        pdu
    }

    /// Create a NOP-Out PDU (initiator side)
    pub fn nop_out(itt: u32, ttt: u32, cmd_sn: u32, exp_stat_sn: u32, immediate: bool, data: Vec<u8>) -> Self {
        let mut pdu = IscsiPdu::with_opcode(opcode::NOP_OUT);
        pdu.immediate = immediate;
        pdu.flags = flags::FINAL;
        pdu.itt = itt;
        pdu.set_field_u32(20, ttt);
        pdu.set_field_u32(24, cmd_sn);
        pdu.set_field_u32(28, exp_stat_sn);
        pdu.set_data(data);
        pdu
    }

    /// Parse NOP-Out PDU
    pub fn parse_nop_out(&self) -> ScsiResult<NopOutPdu> {
        self.expect_opcode(opcode::NOP_OUT)?;

        Ok(NopOutPdu {
            lun: self.lun,
            itt: self.itt,
            ttt: self.field_u32(20),
            cmd_sn: self.field_u32(24),
            exp_stat_sn: self.field_u32(28),
            immediate: self.immediate,
            data: self.data.clone(),
        })
    }
}

// ============================================================================
// Logout Request/Response PDU helpers
// ============================================================================

/// Parsed Logout Request
#[derive(Debug, Clone)]
pub struct LogoutRequest {
    pub itt: u32,
    pub reason: u8,
    pub cid: u16,
    pub cmd_sn: u32,
    pub exp_stat_sn: u32,
    pub immediate: bool,
}

impl IscsiPdu {
    /// Create a Logout Request PDU (initiator side)
    pub fn logout_request(itt: u32, reason: u8, cid: u16, cmd_sn: u32, exp_stat_sn: u32) -> Self {
        let mut pdu = IscsiPdu::with_opcode(opcode::LOGOUT_REQUEST);
        pdu.immediate = true;
        pdu.flags = flags::FINAL | (reason & 0x7F);
        pdu.itt = itt;
        pdu.set_field_u16(20, cid);
        pdu.set_field_u32(24, cmd_sn);
        pdu.set_field_u32(28, exp_stat_sn);
        pdu
    }

    /// Parse Logout Request
    pub fn parse_logout_request(&self) -> ScsiResult<LogoutRequest> {
        self.expect_opcode(opcode::LOGOUT_REQUEST)?;

        Ok(LogoutRequest {
            itt: self.itt,
            reason: self.flags & 0x7F,
            cid: self.field_u16(20),
            cmd_sn: self.field_u32(24),
            exp_stat_sn: self.field_u32(28),
            immediate: self.immediate,
        })
    }

    /// Create a Logout Response PDU
    pub fn logout_response(itt: u32, response: u8, time2wait: u16, time2retain: u16) -> Self {
        let mut pdu = IscsiPdu::with_opcode(opcode::LOGOUT_RESPONSE);
        pdu.flags = flags::FINAL;
        pdu.opcode_fields[0] = response;
        pdu.itt = itt;
        pdu.set_field_u16(40, time2wait);
        pdu.set_field_u16(42, time2retain);
        pdu
    }

    /// Response byte (byte 2) of Logout / TMF / SCSI responses
    pub fn response_code(&self) -> u8 {
        self.opcode_fields[0]
    }
}

// ============================================================================
// Text Request/Response PDU helpers
// ============================================================================

/// Parsed Text Request
#[derive(Debug, Clone)]
pub struct TextRequest {
    pub itt: u32,
    pub ttt: u32,
    pub cmd_sn: u32,
    pub exp_stat_sn: u32,
    pub immediate: bool,
    pub final_flag: bool,
    pub cont: bool,
    pub data: Vec<u8>,
}

impl IscsiPdu {
    /// Create a Text Request PDU (initiator side)
    pub fn text_request(itt: u32, ttt: u32, cmd_sn: u32, exp_stat_sn: u32, final_flag: bool, data: Vec<u8>) -> Self {
        let mut pdu = IscsiPdu::with_opcode(opcode::TEXT_REQUEST);
        pdu.immediate = true;
        pdu.flags = if final_flag { flags::FINAL } else { 0 };
        pdu.itt = itt;
        pdu.set_field_u32(20, ttt);
        pdu.set_field_u32(24, cmd_sn);
        pdu.set_field_u32(28, exp_stat_sn);
        pdu.set_data(data);
        pdu
    }

    /// Parse Text Request
    pub fn parse_text_request(&self) -> ScsiResult<TextRequest> {
        self.expect_opcode(opcode::TEXT_REQUEST)?;

        Ok(TextRequest {
            itt: self.itt,
            ttt: self.field_u32(20),
            cmd_sn: self.field_u32(24),
            exp_stat_sn: self.field_u32(28),
            immediate: self.immediate,
            final_flag: (self.flags & flags::FINAL) != 0,
            cont: (self.flags & flags::CONTINUE) != 0,
            data: self.data.clone(),
        })
    }

    /// Create a Text Response PDU
    pub fn text_response(itt: u32, ttt: u32, final_flag: bool, data: Vec<u8>) -> Self {
        let mut pdu = IscsiPdu::with_opcode(opcode::TEXT_RESPONSE);
        pdu.flags = if final_flag { flags::FINAL } else { 0 };
        pdu.itt = itt;
        pdu.set_field_u32(20, ttt);
        pdu.set_data(data);
        pdu
    }
}

// ============================================================================
// Task management, async and reject PDU helpers
// ============================================================================

/// Parsed Task Management Function Request
#[derive(Debug, Clone)]
pub struct TaskMgmtRequest {
    pub function: u8,
    pub lun: u64,
    pub itt: u32,
    pub referenced_task_tag: u32,
    pub cmd_sn: u32,
    pub exp_stat_sn: u32,
    pub ref_cmd_sn: u32,
    pub immediate: bool,
}

impl IscsiPdu {
    /// Create a Task Management Function Request (initiator side)
    pub fn task_mgmt_request(
        function: u8,
        lun: u64,
        itt: u32,
        referenced_task_tag: u32,
        cmd_sn: u32,
        exp_stat_sn: u32,
        ref_cmd_sn: u32,
    ) -> Self {
        let mut pdu = IscsiPdu::with_opcode(opcode::TASK_MANAGEMENT_REQUEST);
        pdu.immediate = true;
        pdu.flags = flags::FINAL | (function & 0x7F);
        pdu.lun = lun;
        pdu.itt = itt;
        pdu.set_field_u32(20, referenced_task_tag);
        pdu.set_field_u32(24, cmd_sn);
        pdu.set_field_u32(28, exp_stat_sn);
        pdu.set_field_u32(32, ref_cmd_sn);
        pdu
    }

    /// Parse Task Management Function Request
    pub fn parse_task_mgmt_request(&self) -> ScsiResult<TaskMgmtRequest> {
        self.expect_opcode(opcode::TASK_MANAGEMENT_REQUEST)?;

        Ok(TaskMgmtRequest {
            function: self.flags & 0x7F,
            lun: self.lun,
            itt: self.itt,
            referenced_task_tag: self.field_u32(20),
            cmd_sn: self.field_u32(24),
            exp_stat_sn: self.field_u32(28),
            ref_cmd_sn: self.field_u32(32),
            immediate: self.immediate,
        })
    }

    /// Create a Task Management Function Response
    pub fn task_mgmt_response(itt: u32, response: u8) -> Self {
        let mut pdu = IscsiPdu::with_opcode(opcode::TASK_MANAGEMENT_RESPONSE);
        pdu.flags = flags::FINAL;
        pdu.opcode_fields[0] = response;
        pdu.itt = itt;
        pdu
    }

    /// Create an Async Message
    pub fn async_message(
        lun: u64,
        event: u8,
        vcode: u8,
        parameter1: u16,
        parameter2: u16,
        parameter3: u16,
    ) -> Self {
        let mut pdu = IscsiPdu::with_opcode(opcode::ASYNC_MESSAGE);
        pdu.flags = flags::FINAL;
        pdu.lun = lun;
        pdu.itt = RESERVED_TAG;
        pdu.specific[16] = event;
        pdu.specific[17] = vcode;
        pdu.set_field_u16(38, parameter1);
        pdu.set_field_u16(40, parameter2);
        pdu.set_field_u16(42, parameter3);
        pdu
    }

    /// AsyncEvent byte (byte 36) of an Async Message
    pub fn async_event(&self) -> u8 {
        self.specific[16]
    }

    /// Async Message Parameter1..3 (bytes 38, 40, 42)
    pub fn async_parameters(&self) -> (u16, u16, u16) {
        (self.field_u16(38), self.field_u16(40), self.field_u16(42))
    }

    /// Create a Reject PDU carrying a copy of the offending header
    pub fn reject(reason: u8, offending: &IscsiPdu) -> Self {
        let mut pdu = IscsiPdu::with_opcode(opcode::REJECT);
        pdu.flags = flags::FINAL;
        pdu.opcode_fields[0] = reason;
        pdu.itt = RESERVED_TAG;
        pdu.set_data(offending.header_bytes().to_vec());
        pdu
    }
}

// ============================================================================
// Utility functions
// ============================================================================

/// Parse iSCSI text parameters (NUL-terminated key=value pairs)
///
/// Empty chunks (padding, trailing NULs) are skipped; a chunk without `=`
/// or with an empty key is malformed.
pub fn parse_text_parameters(data: &[u8]) -> ScsiResult<Vec<(String, String)>> {
    let mut params = Vec::new();

    for chunk in data.split(|&b| b == 0) {
        if chunk.is_empty() {
            continue;
        }

        let s = std::str::from_utf8(chunk)
            .map_err(|e| IscsiError::Protocol(format!("text key is not UTF-8: {}", e)))?;
        match s.split_once('=') {
            Some((key, value)) if !key.is_empty() => {
                params.push((key.to_string(), value.to_string()));
            }
            _ => {
                return Err(IscsiError::Protocol(format!(
                    "malformed text parameter '{}'",
                    s
                )))
            }
        }
    }

    Ok(params)
}

/// Serialize text parameters to NUL-terminated format
pub fn serialize_text_parameters(params: &[(String, String)]) -> Vec<u8> {
    let mut data = Vec::new();
    for (key, value) in params {
        data.extend_from_slice(key.as_bytes());
        data.push(b'=');
        data.extend_from_slice(value.as_bytes());
        data.push(0);
    }
    data
}

// ============================================================================
// Unit Tests
// ============================================================================
