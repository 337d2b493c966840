//! Emulated SCSI target and command handling
//!
//! CDBs addressed to a LUN of the [`LunMatrix`] are answered here per SPC-2
//! and SBC. Write commands are two-phase: the first dispatch validates the
//! request and asks for the data, the second one (with the data collected
//! in an [`SgList`]) completes it.

use crate::lun::{InjectedFault, LunEntry, LunMatrix, BLOCK_SIZE, MAX_LUNS};
use crate::pdu::{pack_lun, scsi_status};
use byteorder::{BigEndian, ByteOrder};

/// SCSI command opcodes understood by the emulated target
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScsiOpcode {
    TestUnitReady = 0x00,
    RequestSense = 0x03,
    Read6 = 0x08,
    Write6 = 0x0A,
    Seek6 = 0x0B,
    Inquiry = 0x12,
    ModeSense6 = 0x1A,
    ReadCapacity10 = 0x25,
    Read10 = 0x28,
    Write10 = 0x2A,
    Seek10 = 0x2B,
    Verify10 = 0x2F,
    ReportLuns = 0xA0,
    Read12 = 0xA8,
    Write12 = 0xAA,
}

impl ScsiOpcode {
    pub fn from_u8(val: u8) -> Option<Self> {
        match val {
            0x00 => Some(ScsiOpcode::TestUnitReady),
            0x03 => Some(ScsiOpcode::RequestSense),
            0x08 => Some(ScsiOpcode::Read6),
            0x0A => Some(ScsiOpcode::Write6),
            0x0B => Some(ScsiOpcode::Seek6),
            0x12 => Some(ScsiOpcode::Inquiry),
            0x1A => Some(ScsiOpcode::ModeSense6),
            0x25 => Some(ScsiOpcode::ReadCapacity10),
            0x28 => Some(ScsiOpcode::Read10),
            0x2A => Some(ScsiOpcode::Write10),
            0x2B => Some(ScsiOpcode::Seek10),
            0x2F => Some(ScsiOpcode::Verify10),
            0xA0 => Some(ScsiOpcode::ReportLuns),
            0xA8 => Some(ScsiOpcode::Read12),
            0xAA => Some(ScsiOpcode::Write12),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ScsiOpcode::TestUnitReady => "TEST_UNIT_READY",
            ScsiOpcode::RequestSense => "REQUEST_SENSE",
            ScsiOpcode::Read6 => "READ_6",
            ScsiOpcode::Write6 => "WRITE_6",
            ScsiOpcode::Seek6 => "SEEK_6",
            ScsiOpcode::Inquiry => "INQUIRY",
            ScsiOpcode::ModeSense6 => "MODE_SENSE",
            ScsiOpcode::ReadCapacity10 => "READ_CAPACITY",
            ScsiOpcode::Read10 => "READ_10",
            ScsiOpcode::Write10 => "WRITE_10",
            ScsiOpcode::Seek10 => "SEEK_10",
            ScsiOpcode::Verify10 => "VERIFY",
            ScsiOpcode::ReportLuns => "REPORT_LUNS",
            ScsiOpcode::Read12 => "READ_12",
            ScsiOpcode::Write12 => "WRITE_12",
        }
    }
}

/// SCSI sense key codes
pub mod sense_key {
    pub const NO_SENSE: u8 = 0x00;
    pub const NOT_READY: u8 = 0x02;
    pub const MEDIUM_ERROR: u8 = 0x03;
    pub const HARDWARE_ERROR: u8 = 0x04;
    pub const ILLEGAL_REQUEST: u8 = 0x05;
    pub const UNIT_ATTENTION: u8 = 0x06;
    pub const ABORTED_COMMAND: u8 = 0x0B;
}

/// Additional Sense Code (ASC) values
pub mod asc {
    pub const NO_ADDITIONAL_SENSE: u8 = 0x00;
    pub const INVALID_COMMAND_OPERATION_CODE: u8 = 0x20;
    pub const LOGICAL_UNIT_NOT_SUPPORTED: u8 = 0x25;
    pub const INTERNAL_TARGET_FAILURE: u8 = 0x44;
}

/// Peripheral qualifier/type for "no logical unit here"
pub const PERIPHERAL_NOT_CONNECTED: u8 = 0x7f;

/// Fixed-format sense length
pub const SENSE_LENGTH: usize = 18;

/// SCSI sense data (fixed format)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenseData {
    pub sense_key: u8,
    pub asc: u8,  // Additional Sense Code
    pub ascq: u8, // Additional Sense Code Qualifier
    pub information: u32,
}

impl SenseData {
    pub fn new(sense_key: u8, asc: u8, ascq: u8) -> Self {
        SenseData {
            sense_key,
            asc,
            ascq,
            information: 0,
        }
    }

    pub fn with_info(mut self, info: u32) -> Self {
        self.information = info;
        self
    }

    /// Serialize to fixed format sense data (18 bytes)
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut data = vec![0u8; SENSE_LENGTH];

        // Valid bit + current error, fixed format
        data[0] = 0xF0;
        data[2] = self.sense_key & 0x0F;
        BigEndian::write_u32(&mut data[3..7], self.information);
        data[7] = (SENSE_LENGTH - 8) as u8;
        data[12] = self.asc;
        data[13] = self.ascq;

        data
    }

    /// Decode fixed format sense data
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < 14 {
            return None;
        }
        Some(SenseData {
            sense_key: data[2] & 0x0F,
            asc: data[12],
            ascq: data[13],
            information: BigEndian::read_u32(&data[3..7]),
        })
    }

    pub fn invalid_command() -> Self {
        SenseData::new(sense_key::ILLEGAL_REQUEST, asc::INVALID_COMMAND_OPERATION_CODE, 0)
    }

    /// ILLEGAL_REQUEST with the offending LBA in the information field
    pub fn lba_out_of_range(lba: u32) -> Self {
        SenseData::new(sense_key::ILLEGAL_REQUEST, asc::NO_ADDITIONAL_SENSE, 0).with_info(lba)
    }

    pub fn lun_not_supported() -> Self {
        SenseData::new(sense_key::ILLEGAL_REQUEST, asc::LOGICAL_UNIT_NOT_SUPPORTED, 0)
    }

    pub fn hardware_error() -> Self {
        SenseData::new(sense_key::HARDWARE_ERROR, asc::INTERNAL_TARGET_FAILURE, 0)
    }
}

/// Result of SCSI command execution
#[derive(Debug, Clone)]
pub struct ScsiResponse {
    /// SCSI status code
    pub status: u8,
    /// Response data (for read commands)
    pub data: Vec<u8>,
    /// Sense data (for CHECK CONDITION status)
    pub sense: Option<SenseData>,
}

impl ScsiResponse {
    pub fn good(data: Vec<u8>) -> Self {
        ScsiResponse {
            status: scsi_status::GOOD,
            data,
            sense: None,
        }
    }

    pub fn good_no_data() -> Self {
        Self::good(Vec::new())
    }

    pub fn check_condition(sense: SenseData) -> Self {
        ScsiResponse {
            status: scsi_status::CHECK_CONDITION,
            data: Vec::new(),
            sense: Some(sense),
        }
    }

    /// Response forced by an administratively injected fault
    pub fn from_fault(fault: InjectedFault) -> Self {
        if fault.status == scsi_status::CHECK_CONDITION {
            ScsiResponse::check_condition(SenseData::new(fault.sense_key, fault.asc, fault.ascq))
        } else {
            ScsiResponse {
                status: fault.status,
                data: Vec::new(),
                sense: None,
            }
        }
    }

    pub fn is_good(&self) -> bool {
        self.status == scsi_status::GOOD
    }
}

/// Outcome of one dispatch of a CDB
#[derive(Debug, Clone)]
pub enum Dispatch {
    /// Command finished, response ready
    Complete(ScsiResponse),
    /// Write command validated; this many bytes must arrive first
    NeedData { length: u32 },
}

/// Direction of a command's data phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataDirection {
    None,
    Read,
    Write,
}

// ============================================================================
// Scatter-gather list
// ============================================================================

/// Size of one scatter-gather chunk
pub const SG_CHUNK_SIZE: usize = 4096;

/// A byte buffer kept as a list of page-sized chunks plus a trailing
/// partial chunk
#[derive(Debug, Clone, Default)]
pub struct SgList {
    chunks: Vec<Vec<u8>>,
    len: usize,
}

impl SgList {
    /// Zero-filled list of `len` bytes
    pub fn with_len(len: usize) -> Self {
        let mut chunks = Vec::with_capacity(len.div_ceil(SG_CHUNK_SIZE));
        let mut remaining = len;
        while remaining > 0 {
            let size = remaining.min(SG_CHUNK_SIZE);
            chunks.push(vec![0u8; size]);
            remaining -= size;
        }
        SgList { chunks, len }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Copy `data` in at `offset`, crossing chunk boundaries as needed.
    /// Bytes past the end of the list are dropped; returns the count stored.
    pub fn write_at(&mut self, offset: usize, data: &[u8]) -> usize {
        let mut stored = 0;
        let mut pos = offset;
        while stored < data.len() && pos < self.len {
            let chunk = &mut self.chunks[pos / SG_CHUNK_SIZE];
            let within = pos % SG_CHUNK_SIZE;
            let n = (chunk.len() - within).min(data.len() - stored);
            chunk[within..within + n].copy_from_slice(&data[stored..stored + n]);
            stored += n;
            pos += n;
        }
        stored
    }

    /// Flatten into one contiguous buffer
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len);
        for chunk in &self.chunks {
            out.extend_from_slice(chunk);
        }
        out
    }

    fn chunks(&self) -> impl Iterator<Item = &Vec<u8>> {
        self.chunks.iter()
    }

    fn chunks_mut(&mut self) -> impl Iterator<Item = &mut Vec<u8>> {
        self.chunks.iter_mut()
    }
}

// ============================================================================
// CDB decoding
// ============================================================================

/// LBA and length of a READ/WRITE CDB, before relative addressing is applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockTransfer {
    pub direction: DataDirection,
    pub lba: u32,
    pub blocks: u32,
    /// RelAdr bit: `lba` is a signed offset from the LUN's last accessed LBA
    pub relative: bool,
}

/// Decode READ/WRITE 6, 10 and 12 CDBs
pub fn decode_block_transfer(cdb: &[u8]) -> Option<BlockTransfer> {
    let op = ScsiOpcode::from_u8(*cdb.first()?)?;
    let direction = match op {
        ScsiOpcode::Read6 | ScsiOpcode::Read10 | ScsiOpcode::Read12 => DataDirection::Read,
        ScsiOpcode::Write6 | ScsiOpcode::Write10 | ScsiOpcode::Write12 => DataDirection::Write,
        _ => return None,
    };

    let transfer = match op {
        ScsiOpcode::Read6 | ScsiOpcode::Write6 => {
            if cdb.len() < 6 {
                return None;
            }
            let lba = (((cdb[1] & 0x1F) as u32) << 16) | BigEndian::read_u16(&cdb[2..4]) as u32;
            // A 6-byte transfer length of zero means 256 blocks
            let blocks = if cdb[4] == 0 { 256 } else { cdb[4] as u32 };
            BlockTransfer {
                direction,
                lba,
                blocks,
                relative: false,
            }
        }
        ScsiOpcode::Read10 | ScsiOpcode::Write10 => {
            if cdb.len() < 10 {
                return None;
            }
            BlockTransfer {
                direction,
                lba: BigEndian::read_u32(&cdb[2..6]),
                blocks: BigEndian::read_u16(&cdb[7..9]) as u32,
                relative: cdb[1] & 0x01 != 0,
            }
        }
        _ => {
            if cdb.len() < 12 {
                return None;
            }
            BlockTransfer {
                direction,
                lba: BigEndian::read_u32(&cdb[2..6]),
                blocks: BigEndian::read_u32(&cdb[6..10]),
                relative: cdb[1] & 0x01 != 0,
            }
        }
    };
    Some(transfer)
}

/// Data direction of a CDB and the byte count its data phase moves
pub fn data_phase(cdb: &[u8]) -> (DataDirection, u32) {
    if let Some(t) = decode_block_transfer(cdb) {
        return (t.direction, t.blocks.saturating_mul(BLOCK_SIZE));
    }
    match cdb.first().and_then(|&b| ScsiOpcode::from_u8(b)) {
        Some(ScsiOpcode::Inquiry)
        | Some(ScsiOpcode::ModeSense6)
        | Some(ScsiOpcode::RequestSense) if cdb.len() > 4 => (DataDirection::Read, cdb[4] as u32),
        Some(ScsiOpcode::ReadCapacity10) => (DataDirection::Read, 8),
        Some(ScsiOpcode::ReportLuns) if cdb.len() >= 10 => {
            (DataDirection::Read, BigEndian::read_u32(&cdb[6..10]))
        }
        _ => (DataDirection::None, 0),
    }
}

// ============================================================================
// Command handler
// ============================================================================

/// SCSI Command Handler for the emulated target
pub struct ScsiHandler;

impl ScsiHandler {
    /// Execute a CDB against `lun` of `target`
    ///
    /// `write_data` is `None` on the first dispatch of a write; the handler
    /// then validates the request and answers `NeedData`.
    pub fn handle_command(
        cdb: &[u8],
        luns: &mut LunMatrix,
        target: usize,
        lun: u16,
        write_data: Option<&SgList>,
    ) -> Dispatch {
        let Some(&op_byte) = cdb.first() else {
            return Dispatch::Complete(ScsiResponse::check_condition(SenseData::invalid_command()));
        };

        let Some(op) = ScsiOpcode::from_u8(op_byte) else {
            log::warn!("unsupported SCSI opcode {:#04x}", op_byte);
            return Dispatch::Complete(ScsiResponse::check_condition(SenseData::invalid_command()));
        };
        log::debug!("SCSI {} for target {} LUN {}", op.name(), target, lun);

        if op == ScsiOpcode::Inquiry {
            return Dispatch::Complete(Self::handle_inquiry(cdb, lun));
        }

        if lun as usize >= MAX_LUNS {
            return Dispatch::Complete(ScsiResponse::check_condition(SenseData::lun_not_supported()));
        }
        if op == ScsiOpcode::ReportLuns {
            return Dispatch::Complete(Self::handle_report_luns(cdb, luns, target));
        }

        let entry = match luns.entry_mut(target, lun as usize) {
            Ok(entry) => entry,
            Err(_) => {
                return Dispatch::Complete(ScsiResponse::check_condition(
                    SenseData::lun_not_supported(),
                ))
            }
        };

        match op {
            ScsiOpcode::TestUnitReady
            | ScsiOpcode::Verify10
            | ScsiOpcode::Seek6
            | ScsiOpcode::Seek10 => Dispatch::Complete(ScsiResponse::good_no_data()),
            ScsiOpcode::RequestSense => Dispatch::Complete(Self::handle_request_sense(cdb)),
            ScsiOpcode::ModeSense6 => Dispatch::Complete(Self::handle_mode_sense(cdb)),
            ScsiOpcode::ReadCapacity10 => Dispatch::Complete(Self::handle_read_capacity(entry)),
            _ => Self::handle_block_transfer(cdb, entry, write_data),
        }
    }

    /// Handle INQUIRY (0x12)
    fn handle_inquiry(cdb: &[u8], lun: u16) -> ScsiResponse {
        let alloc_len = cdb.get(4).copied().unwrap_or(0) as usize;

        let mut data = vec![0u8; 36];
        data[0] = if (lun as usize) < MAX_LUNS {
            0x00 // direct access block device
        } else {
            PERIPHERAL_NOT_CONNECTED
        };
        data[2] = 4; // SPC-2
        data[3] = 2; // response data format
        data[4] = 31; // additional length
        data[6] = 0x80; // BQue: basic task management
        data[8..16].copy_from_slice(b"UNH-IOL ");
        data[16..32].copy_from_slice(b"in-memory target");
        data[32..36].copy_from_slice(b"1.2 ");

        data.truncate(alloc_len);
        ScsiResponse::good(data)
    }

    /// Handle REQUEST SENSE (0x03); nothing is ever pending
    fn handle_request_sense(cdb: &[u8]) -> ScsiResponse {
        let alloc_len = cdb.get(4).copied().unwrap_or(0) as usize;
        let mut data = SenseData::new(sense_key::NO_SENSE, asc::NO_ADDITIONAL_SENSE, 0).to_bytes();
        data.truncate(alloc_len);
        ScsiResponse::good(data)
    }

    /// Handle MODE SENSE (0x1A)
    fn handle_mode_sense(cdb: &[u8]) -> ScsiResponse {
        let alloc_len = cdb.get(4).copied().unwrap_or(0) as usize;
        let mut data = vec![0u8; 12];
        data[0] = 0x0b; // bytes that follow
        data[3] = 0x08; // block descriptor length
        data[10] = 0x02; // density code and block length
        data.truncate(alloc_len);
        ScsiResponse::good(data)
    }

    /// Handle READ CAPACITY (0x25)
    fn handle_read_capacity(entry: &LunEntry) -> ScsiResponse {
        let mut data = vec![0u8; 8];
        let last_lba = entry.storage_blocks().saturating_sub(1).min(u32::MAX as u64) as u32;
        BigEndian::write_u32(&mut data[0..4], last_lba);
        BigEndian::write_u32(&mut data[4..8], BLOCK_SIZE);
        ScsiResponse::good(data)
    }

    /// Handle REPORT LUNS (0xA0)
    fn handle_report_luns(cdb: &[u8], luns: &LunMatrix, target: usize) -> ScsiResponse {
        let alloc_len = if cdb.len() >= 10 {
            BigEndian::read_u32(&cdb[6..10]) as usize
        } else {
            0
        };

        let in_use = luns.in_use_luns(target);
        let mut data = vec![0u8; 8];
        BigEndian::write_u32(&mut data[0..4], (in_use.len() * 8) as u32);
        for lun in in_use {
            // MAX_LUNS keeps every LUN in the peripheral (one byte) range
            debug_assert!(lun <= 0xFF);
            // LUN 0 packs to eight zero bytes
            data.extend_from_slice(&pack_lun(lun).to_be_bytes());
        }

        data.truncate(alloc_len);
        ScsiResponse::good(data)
    }

    /// READ/WRITE 6, 10, 12
    fn handle_block_transfer(cdb: &[u8], entry: &mut LunEntry, write_data: Option<&SgList>) -> Dispatch {
        let Some(transfer) = decode_block_transfer(cdb) else {
            return Dispatch::Complete(ScsiResponse::check_condition(SenseData::invalid_command()));
        };

        let lba = if transfer.relative {
            entry.last_lba as i64 + transfer.lba as i32 as i64
        } else {
            transfer.lba as i64
        };

        let in_range = lba >= 0 && (lba as u64) + transfer.blocks as u64 <= entry.storage_blocks();
        if !in_range {
            log::warn!(
                "LBA {} + {} blocks outside storage of {} blocks",
                lba,
                transfer.blocks,
                entry.storage_blocks()
            );
            // Information carries the resolved LBA, clamped to the 32-bit field
            let resolved = lba.clamp(0, u32::MAX as i64) as u32;
            return Dispatch::Complete(ScsiResponse::check_condition(SenseData::lba_out_of_range(
                resolved,
            )));
        }
        let lba = lba as u64;

        // Zero-length transfers touch nothing
        if transfer.blocks == 0 {
            return Dispatch::Complete(ScsiResponse::good_no_data());
        }

        let length = transfer.blocks as u64 * BLOCK_SIZE as u64;
        let offset = lba * BLOCK_SIZE as u64;

        let result = match transfer.direction {
            DataDirection::Write => {
                let Some(data) = write_data else {
                    return Dispatch::NeedData {
                        length: length as u32,
                    };
                };
                Self::write_sg(entry, offset, data).map(|_| ScsiResponse::good_no_data())
            }
            _ => {
                let mut buffer = SgList::with_len(length as usize);
                Self::read_sg(entry, offset, &mut buffer).map(|_| ScsiResponse::good(buffer.to_vec()))
            }
        };

        match result {
            Ok(response) => {
                entry.last_lba = lba + transfer.blocks as u64 - 1;
                Dispatch::Complete(response)
            }
            Err(e) => {
                log::error!("LUN I/O failed at LBA {}: {}", lba, e);
                Dispatch::Complete(ScsiResponse::check_condition(SenseData::hardware_error()))
            }
        }
    }

    fn read_sg(entry: &LunEntry, offset: u64, buffer: &mut SgList) -> crate::error::ScsiResult<()> {
        let mut pos = offset;
        for chunk in buffer.chunks_mut() {
            entry.read(pos, chunk)?;
            pos += chunk.len() as u64;
        }
        Ok(())
    }

    fn write_sg(entry: &mut LunEntry, offset: u64, data: &SgList) -> crate::error::ScsiResult<()> {
        let mut pos = offset;
        for chunk in data.chunks() {
            entry.write(pos, chunk)?;
            pos += chunk.len() as u64;
        }
        Ok(())
    }
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lun::DEFAULT_STORAGE_SIZE;

    fn complete(d: Dispatch) -> ScsiResponse {
        match d {
            Dispatch::Complete(r) => r,
            Dispatch::NeedData { length } => panic!("unexpected NeedData({})", length),
        }
    }

    fn rw10(op: u8, lba: u32, blocks: u16) -> [u8; 10] {
        let mut cdb = [0u8; 10];
        cdb[0] = op;
        BigEndian::write_u32(&mut cdb[2..6], lba);
        BigEndian::write_u16(&mut cdb[7..9], blocks);
        cdb
    }

    fn write_blocks(luns: &mut LunMatrix, cdb: &[u8], fill: u8, len: usize) -> ScsiResponse {
        match ScsiHandler::handle_command(cdb, luns, 0, 0, None) {
            Dispatch::NeedData { length } => assert_eq!(length as usize, len),
            Dispatch::Complete(r) => return r,
        }
        let mut sg = SgList::with_len(len);
        sg.write_at(0, &vec![fill; len]);
        complete(ScsiHandler::handle_command(cdb, luns, 0, 0, Some(&sg)))
    }

    #[test]
    fn test_test_unit_ready() {
        let mut luns = LunMatrix::new();
        let resp = complete(ScsiHandler::handle_command(&[0u8; 6], &mut luns, 0, 0, None));
        assert!(resp.is_good());
        assert!(resp.data.is_empty());
    }

    #[test]
    fn test_inquiry() {
        let mut luns = LunMatrix::new();
        let cdb = [0x12, 0, 0, 0, 36, 0];
        let resp = complete(ScsiHandler::handle_command(&cdb, &mut luns, 0, 0, None));
        assert_eq!(resp.data.len(), 36);
        assert_eq!(resp.data[0], 0x00);
        assert_eq!(resp.data[2], 4);
        assert_eq!(resp.data[3], 2);
        assert_eq!(resp.data[4], 31);
        assert_eq!(resp.data[6], 0x80);
        assert_eq!(&resp.data[8..16], b"UNH-IOL ");
        assert_eq!(&resp.data[16..32], b"in-memory target");
        assert_eq!(&resp.data[32..36], b"1.2 ");
    }

    #[test]
    fn test_inquiry_truncated_and_missing_lun() {
        let mut luns = LunMatrix::new();
        let resp = complete(ScsiHandler::handle_command(&[0x12, 0, 0, 0, 5, 0], &mut luns, 0, 0, None));
        assert_eq!(resp.data.len(), 5);

        let resp = complete(ScsiHandler::handle_command(
            &[0x12, 0, 0, 0, 36, 0],
            &mut luns,
            0,
            MAX_LUNS as u16,
            None,
        ));
        assert!(resp.is_good());
        assert_eq!(resp.data[0], PERIPHERAL_NOT_CONNECTED);
    }

    #[test]
    fn test_lun_out_of_range() {
        let mut luns = LunMatrix::new();
        let resp = complete(ScsiHandler::handle_command(&[0u8; 6], &mut luns, 0, 9, None));
        assert_eq!(resp.status, scsi_status::CHECK_CONDITION);
        assert_eq!(resp.sense.unwrap().asc, asc::LOGICAL_UNIT_NOT_SUPPORTED);
    }

    #[test]
    fn test_read_capacity() {
        let mut luns = LunMatrix::new();
        let resp = complete(ScsiHandler::handle_command(&[0x25; 1], &mut luns, 0, 0, None));
        assert_eq!(resp.data, vec![0x00, 0x00, 0x1F, 0xFF, 0x00, 0x00, 0x02, 0x00]);
        assert_eq!(DEFAULT_STORAGE_SIZE, 0x2000);
    }

    #[test]
    fn test_mode_sense() {
        let mut luns = LunMatrix::new();
        let resp = complete(ScsiHandler::handle_command(&[0x1A, 0, 0x3F, 0, 255, 0], &mut luns, 0, 0, None));
        assert_eq!(resp.data, vec![0x0b, 0, 0, 8, 0, 0, 0, 0, 0, 0, 2, 0]);
    }

    #[test]
    fn test_report_luns() {
        let mut luns = LunMatrix::new();
        let mut cdb = [0u8; 12];
        cdb[0] = 0xA0;
        BigEndian::write_u32(&mut cdb[6..10], 1024);

        let resp = complete(ScsiHandler::handle_command(&cdb, &mut luns, 0, 0, None));
        assert_eq!(BigEndian::read_u32(&resp.data[0..4]) as usize, MAX_LUNS * 8);
        assert_eq!(resp.data.len(), 8 + MAX_LUNS * 8);
        assert_eq!(&resp.data[8..16], &[0u8; 8]);
        assert_eq!(&resp.data[16..24], &[0, 1, 0, 0, 0, 0, 0, 0]);
        for entry in resp.data[8..].chunks(8) {
            assert_eq!(entry[0] >> 6, 0b00);
        }
    }

    #[test]
    fn test_request_sense() {
        let mut luns = LunMatrix::new();
        let resp = complete(ScsiHandler::handle_command(&[0x03, 0, 0, 0, 18, 0], &mut luns, 0, 0, None));
        assert_eq!(resp.data.len(), SENSE_LENGTH);
        assert_eq!(resp.data[2], sense_key::NO_SENSE);
    }

    #[test]
    fn test_unsupported_command() {
        let mut luns = LunMatrix::new();
        let resp = complete(ScsiHandler::handle_command(&[0xFF, 0, 0, 0, 0, 0], &mut luns, 0, 0, None));
        assert_eq!(resp.status, scsi_status::CHECK_CONDITION);
        let sense = resp.sense.unwrap();
        assert_eq!(sense.sense_key, sense_key::ILLEGAL_REQUEST);
        assert_eq!(sense.asc, asc::INVALID_COMMAND_OPERATION_CODE);
    }

    #[test]
    fn test_write_then_read() {
        let mut luns = LunMatrix::new();
        let resp = write_blocks(&mut luns, &rw10(0x2A, 5, 1), 0xAA, 512);
        assert!(resp.is_good());
        assert_eq!(luns.entry(0, 0).unwrap().last_lba, 5);

        let resp = complete(ScsiHandler::handle_command(&rw10(0x28, 5, 1), &mut luns, 0, 0, None));
        assert!(resp.is_good());
        assert_eq!(resp.data, vec![0xAA; 512]);

        let resp = complete(ScsiHandler::handle_command(&rw10(0x28, 4, 1), &mut luns, 0, 0, None));
        assert_eq!(resp.data, vec![0u8; 512]);
    }

    #[test]
    fn test_multi_chunk_write() {
        let mut luns = LunMatrix::new();
        let resp = write_blocks(&mut luns, &rw10(0x2A, 10, 20), 0x3C, 20 * 512);
        assert!(resp.is_good());
        assert_eq!(luns.entry(0, 0).unwrap().last_lba, 29);

        let resp = complete(ScsiHandler::handle_command(&rw10(0x28, 10, 20), &mut luns, 0, 0, None));
        assert_eq!(resp.data.len(), 20 * 512);
        assert!(resp.data.iter().all(|&b| b == 0x3C));
    }

    #[test]
    fn test_write_out_of_range() {
        let mut luns = LunMatrix::new();
        let resp = complete(ScsiHandler::handle_command(&rw10(0x2A, 8192, 1), &mut luns, 0, 0, None));
        assert_eq!(resp.status, scsi_status::CHECK_CONDITION);

        let sense = resp.sense.unwrap();
        assert_eq!(sense.sense_key, sense_key::ILLEGAL_REQUEST);
        assert_eq!(sense.asc, 0);
        let bytes = sense.to_bytes();
        assert_eq!(bytes[0], 0xF0);
        assert_eq!(&bytes[3..7], &[0x00, 0x00, 0x20, 0x00]);
    }

    #[test]
    fn test_read_crossing_boundary() {
        let mut luns = LunMatrix::new();
        let resp = complete(ScsiHandler::handle_command(&rw10(0x28, 8191, 2), &mut luns, 0, 0, None));
        assert_eq!(resp.status, scsi_status::CHECK_CONDITION);
        assert_eq!(resp.sense.unwrap().information, 8191);
    }

    #[test]
    fn test_zero_length_keeps_last_lba() {
        let mut luns = LunMatrix::new();
        luns.entry_mut(0, 0).unwrap().last_lba = 42;
        let resp = complete(ScsiHandler::handle_command(&rw10(0x28, 100, 0), &mut luns, 0, 0, None));
        assert!(resp.is_good());
        let resp = complete(ScsiHandler::handle_command(&rw10(0x2A, 100, 0), &mut luns, 0, 0, None));
        assert!(resp.is_good());
        assert_eq!(luns.entry(0, 0).unwrap().last_lba, 42);
    }

    #[test]
    fn test_relative_addressing() {
        let mut luns = LunMatrix::new();
        write_blocks(&mut luns, &rw10(0x2A, 100, 1), 0x11, 512);
        assert_eq!(luns.entry(0, 0).unwrap().last_lba, 100);

        // -2 relative to LBA 100
        let mut cdb = rw10(0x2A, (-2i32) as u32, 1);
        cdb[1] |= 0x01;
        assert!(write_blocks(&mut luns, &cdb, 0x22, 512).is_good());
        assert_eq!(luns.entry(0, 0).unwrap().last_lba, 98);

        // Before LBA 0
        let mut cdb = rw10(0x28, (-500i32) as u32, 1);
        cdb[1] |= 0x01;
        let resp = complete(ScsiHandler::handle_command(&cdb, &mut luns, 0, 0, None));
        assert_eq!(resp.status, scsi_status::CHECK_CONDITION);
        assert_eq!(resp.sense.unwrap().information, 0);
    }

    #[test]
    fn test_relative_out_of_range_reports_resolved_lba() {
        let mut luns = LunMatrix::new();
        luns.entry_mut(0, 0).unwrap().last_lba = 8000;

        let mut cdb = rw10(0x28, 500, 1);
        cdb[1] |= 0x01;
        let resp = complete(ScsiHandler::handle_command(&cdb, &mut luns, 0, 0, None));
        assert_eq!(resp.status, scsi_status::CHECK_CONDITION);
        assert_eq!(resp.sense.unwrap().information, 8500);
    }

    #[test]
    fn test_read_unwritten_region() {
        let mut luns = LunMatrix::new();
        let resp = complete(ScsiHandler::handle_command(&rw10(0x28, 5, 1), &mut luns, 0, 0, None));
        assert!(resp.is_good());
        assert_eq!(resp.data, vec![0u8; 512]);
        assert_eq!(luns.entry(0, 0).unwrap().buffer_len(), 0);
    }

    #[test]
    fn test_multi_chunk_read_after_small_write() {
        let mut luns = LunMatrix::new();
        assert!(write_blocks(&mut luns, &rw10(0x2A, 0, 1), 0x5A, 512).is_good());

        let resp = complete(ScsiHandler::handle_command(&rw10(0x28, 0, 16), &mut luns, 0, 0, None));
        assert!(resp.is_good());
        assert_eq!(resp.data.len(), 16 * 512);
        assert!(resp.data[..512].iter().all(|&b| b == 0x5A));
        assert!(resp.data[512..].iter().all(|&b| b == 0));
        assert_eq!(luns.entry(0, 0).unwrap().last_lba, 15);
    }

    #[test]
    fn test_decode_six_byte_cdb() {
        let t = decode_block_transfer(&[0x08, 0x01, 0x02, 0x03, 0x00, 0x00]).unwrap();
        assert_eq!(t.direction, DataDirection::Read);
        assert_eq!(t.lba, 0x010203);
        assert_eq!(t.blocks, 256);
        assert!(!t.relative);

        let t = decode_block_transfer(&[0x0A, 0, 0, 9, 2, 0]).unwrap();
        assert_eq!(t.direction, DataDirection::Write);
        assert_eq!(t.blocks, 2);
    }

    #[test]
    fn test_decode_twelve_byte_cdb() {
        let mut cdb = [0u8; 12];
        cdb[0] = 0xA8;
        BigEndian::write_u32(&mut cdb[2..6], 77);
        BigEndian::write_u32(&mut cdb[6..10], 3);
        let t = decode_block_transfer(&cdb).unwrap();
        assert_eq!((t.lba, t.blocks), (77, 3));
        assert_eq!(data_phase(&cdb), (DataDirection::Read, 3 * 512));
    }

    #[test]
    fn test_data_phase() {
        assert_eq!(data_phase(&rw10(0x2A, 0, 4)), (DataDirection::Write, 2048));
        assert_eq!(data_phase(&[0x12, 0, 0, 0, 36, 0]), (DataDirection::Read, 36));
        assert_eq!(data_phase(&[0x25]), (DataDirection::Read, 8));
        assert_eq!(data_phase(&[0x00, 0, 0, 0, 0, 0]), (DataDirection::None, 0));
    }

    #[test]
    fn test_sg_list_chunks() {
        let mut sg = SgList::with_len(SG_CHUNK_SIZE * 2 + 100);
        assert_eq!(sg.chunk_count(), 3);

        let data: Vec<u8> = (0..200).map(|i| i as u8).collect();
        assert_eq!(sg.write_at(SG_CHUNK_SIZE - 100, &data), 200);
        let flat = sg.to_vec();
        assert_eq!(&flat[SG_CHUNK_SIZE - 100..SG_CHUNK_SIZE + 100], &data[..]);

        // Past the end is clipped
        assert_eq!(sg.write_at(sg.len() - 10, &data), 10);
        assert!(SgList::with_len(0).is_empty());
    }

    #[test]
    fn test_sense_data_serialization() {
        let sense = SenseData::new(sense_key::MEDIUM_ERROR, 0x11, 0x01).with_info(0x1234);
        let bytes = sense.to_bytes();
        assert_eq!(bytes.len(), SENSE_LENGTH);
        assert_eq!(bytes[0], 0xF0);
        assert_eq!(bytes[2], sense_key::MEDIUM_ERROR);
        assert_eq!(bytes[7], 10);
        assert_eq!(bytes[12], 0x11);
        assert_eq!(bytes[13], 0x01);
        assert_eq!(SenseData::from_bytes(&bytes), Some(sense));
    }

    #[test]
    fn test_fault_response() {
        let fault = InjectedFault {
            status: scsi_status::CHECK_CONDITION,
            sense_key: sense_key::MEDIUM_ERROR,
            asc: 0x11,
            ascq: 0,
        };
        let resp = ScsiResponse::from_fault(fault);
        assert_eq!(resp.sense.unwrap().asc, 0x11);

        let busy = ScsiResponse::from_fault(InjectedFault {
            status: scsi_status::BUSY,
            ..Default::default()
        });
        assert_eq!(busy.status, scsi_status::BUSY);
        assert!(busy.sense.is_none());
    }
}
