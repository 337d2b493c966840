//! Framed PDU transport over a byte stream
//!
//! Reads and writes whole PDUs (BHS, optional AHS, padded data segment)
//! with optional CRC32C header and data digests, stamps StatSN on target
//! PDUs, and splits oversized Login/Text responses with the Continue bit
//! (RFC 3720 Sections 10.2 and 10.12.2).

use crate::error::{IscsiError, ScsiResult};
use crate::pdu::{flags, opcode, padded_len, IscsiPdu, BHS_SIZE, RESERVED_TAG};
use std::io::{ErrorKind, Read, Write};

/// CRC32C (Castagnoli) as used for iSCSI digests
const ISCSI_CRC: crc::Crc<u32> = crc::Crc::<u32>::new(&crc::CRC_32_ISCSI);

/// Size of a header or data digest
pub const DIGEST_SIZE: usize = 4;

/// MaxRecvDataSegmentLength in force before negotiation completes
pub const DEFAULT_MAX_RECV_LEN: usize = 8192;

/// Compute the CRC32C of a buffer
pub fn crc32c(data: &[u8]) -> u32 {
    ISCSI_CRC.checksum(data)
}

/// Digest as it appears on the wire (least significant byte first)
pub fn digest_bytes(data: &[u8]) -> [u8; DIGEST_SIZE] {
    crc32c(data).to_le_bytes()
}

/// Which digests are active on a connection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Digests {
    pub header: bool,
    pub data: bool,
}

fn map_read_error(e: std::io::Error) -> IscsiError {
    match e.kind() {
        ErrorKind::UnexpectedEof | ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted => {
            IscsiError::PeerClosed
        }
        _ => IscsiError::Io(e),
    }
}

// ============================================================================
// Receive side
// ============================================================================

/// Reads complete PDUs from a stream
pub struct PduReader<R: Read> {
    inner: R,
    digests: Digests,
    max_recv_len: usize,
}

impl<R: Read> PduReader<R> {
    pub fn new(inner: R) -> Self {
        PduReader {
            inner,
            digests: Digests::default(),
            max_recv_len: DEFAULT_MAX_RECV_LEN,
        }
    }

    pub fn digests(&self) -> Digests {
        self.digests
    }

    pub fn set_digests(&mut self, digests: Digests) {
        self.digests = digests;
    }

    pub fn max_recv_len(&self) -> usize {
        self.max_recv_len
    }

    /// Largest data segment accepted before the PDU is refused
    pub fn set_max_recv_len(&mut self, len: usize) {
        self.max_recv_len = len;
    }

    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> ScsiResult<()> {
        self.inner.read_exact(buf).map_err(map_read_error)
    }

    fn check_digest(&mut self, covered: &[u8], what: &str) -> ScsiResult<()> {
        let mut received = [0u8; DIGEST_SIZE];
        self.read_exact(&mut received)?;
        let expected = digest_bytes(covered);
        if received != expected {
            return Err(IscsiError::Digest(format!(
                "{} digest mismatch: got {:08x}, expected {:08x}",
                what,
                u32::from_le_bytes(received),
                u32::from_le_bytes(expected)
            )));
        }
        Ok(())
    }

    /// Receive one PDU
    ///
    /// Returns `PeerClosed` when the stream ends, `Protocol` when the data
    /// segment exceeds the receive limit and `Digest` on a CRC mismatch.
    pub fn recv_pdu(&mut self) -> ScsiResult<IscsiPdu> {
        let mut header = vec![0u8; BHS_SIZE];
        self.read_exact(&mut header)?;

        let mut pdu = IscsiPdu::parse_header(&header)?;

        let ahs_bytes = pdu.ahs_length as usize * 4;
        if ahs_bytes > 0 {
            // AHS is read only so the digest covers it; its content is unused
            let mut ahs = vec![0u8; ahs_bytes];
            self.read_exact(&mut ahs)?;
            header.extend_from_slice(&ahs);
        }

        if self.digests.header {
            self.check_digest(&header, "header")?;
        }

        let data_len = pdu.data_length as usize;
        if data_len > self.max_recv_len {
            return Err(IscsiError::Protocol(format!(
                "{} data segment of {} bytes exceeds MaxRecvDataSegmentLength {}",
                pdu.opcode_name(),
                data_len,
                self.max_recv_len
            )));
        }

        if data_len > 0 {
            let mut data = vec![0u8; padded_len(data_len)];
            self.read_exact(&mut data)?;
            if self.digests.data {
                self.check_digest(&data, "data")?;
            }
            data.truncate(data_len);
            pdu.data = data;
        }

        log::trace!(
            "recv {} itt={:#x} dsl={}",
            pdu.opcode_name(),
            pdu.itt,
            pdu.data_length
        );
        Ok(pdu)
    }
}

// ============================================================================
// Send side
// ============================================================================

/// How a PDU interacts with the connection StatSN counter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatSnUse {
    /// Carry the current StatSN and advance it
    Advance,
    /// Carry the current StatSN without advancing it
    Peek,
    /// Login Reject: StatSN and the command window are zero
    Zero,
    /// Initiator PDUs are written as given
    Untouched,
}

/// StatSN treatment for a PDU about to be sent
pub fn stat_sn_use(pdu: &IscsiPdu) -> StatSnUse {
    match pdu.opcode {
        opcode::LOGIN_RESPONSE if pdu.login_status_class() != 0 => StatSnUse::Zero,
        opcode::SCSI_DATA_IN if pdu.flags & flags::STATUS == 0 => StatSnUse::Peek,
        opcode::NOP_IN if pdu.itt == RESERVED_TAG => StatSnUse::Peek,
        opcode::R2T => StatSnUse::Peek,
        _ if pdu.is_target_pdu() => StatSnUse::Advance,
        _ => StatSnUse::Untouched,
    }
}

/// Writes complete PDUs to a stream and owns the connection StatSN
pub struct PduWriter<W: Write> {
    inner: W,
    digests: Digests,
    stat_sn: u32,
}

impl<W: Write> PduWriter<W> {
    pub fn new(inner: W) -> Self {
        PduWriter {
            inner,
            digests: Digests::default(),
            stat_sn: 0,
        }
    }

    pub fn digests(&self) -> Digests {
        self.digests
    }

    pub fn set_digests(&mut self, digests: Digests) {
        self.digests = digests;
    }

    /// StatSN the next status-bearing PDU will carry
    pub fn stat_sn(&self) -> u32 {
        self.stat_sn
    }

    pub fn set_stat_sn(&mut self, stat_sn: u32) {
        self.stat_sn = stat_sn;
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    pub fn into_inner(self) -> W {
        self.inner
    }

    /// Send one PDU, stamping StatSN according to [`stat_sn_use`]
    ///
    /// Returns the StatSN carried by the PDU.
    pub fn send_pdu(&mut self, mut pdu: IscsiPdu) -> ScsiResult<u32> {
        let carried = match stat_sn_use(&pdu) {
            StatSnUse::Advance => {
                let sn = self.stat_sn;
                pdu.set_stat_sn(sn);
                self.stat_sn = self.stat_sn.wrapping_add(1);
                sn
            }
            StatSnUse::Peek => {
                pdu.set_stat_sn(self.stat_sn);
                self.stat_sn
            }
            StatSnUse::Zero => {
                pdu.set_stat_sn(0);
                pdu.set_cmd_sn_window(0, 0);
                0
            }
            StatSnUse::Untouched => pdu.stat_sn(),
        };

        self.write_pdu(&pdu)?;
        log::trace!(
            "sent {} itt={:#x} statsn={} dsl={}",
            pdu.opcode_name(),
            pdu.itt,
            carried,
            pdu.data.len()
        );
        Ok(carried)
    }

    fn write_pdu(&mut self, pdu: &IscsiPdu) -> ScsiResult<()> {
        let header = pdu.header_bytes();
        let padded = padded_len(pdu.data.len());

        let mut buf = Vec::with_capacity(BHS_SIZE + padded + 2 * DIGEST_SIZE);
        buf.extend_from_slice(&header);
        if self.digests.header {
            buf.extend_from_slice(&digest_bytes(&header));
        }
        if !pdu.data.is_empty() {
            let data_start = buf.len();
            buf.extend_from_slice(&pdu.data);
            buf.resize(data_start + padded, 0);
            if self.digests.data {
                let digest = digest_bytes(&buf[data_start..]);
                buf.extend_from_slice(&digest);
            }
        }

        self.inner.write_all(&buf)?;
        self.inner.flush()?;
        Ok(())
    }
}

/// Send a Login or Text response, splitting its data at `split_at` bytes
///
/// Every non-final chunk carries C=1 with T/F and NSG cleared, consumes a
/// StatSN, and must be acknowledged by an empty request of the matching
/// type before the next chunk goes out.
pub fn send_segmented<R: Read, W: Write>(
    reader: &mut PduReader<R>,
    writer: &mut PduWriter<W>,
    pdu: IscsiPdu,
    split_at: Option<usize>,
) -> ScsiResult<()> {
    let limit = match split_at {
        Some(n) if n > 0 && pdu.data.len() > n => n,
        _ => {
            writer.send_pdu(pdu)?;
            return Ok(());
        }
    };

    let ack_opcode = match pdu.opcode {
        opcode::LOGIN_RESPONSE => opcode::LOGIN_REQUEST,
        opcode::TEXT_RESPONSE => opcode::TEXT_REQUEST,
        other => {
            return Err(IscsiError::Protocol(format!(
                "cannot segment PDU with opcode 0x{:02x}",
                other
            )))
        }
    };

    let chunks: Vec<&[u8]> = pdu.data.chunks(limit).collect();
    let last = chunks.len() - 1;
    log::debug!(
        "splitting {} of {} bytes into {} chunks",
        pdu.opcode_name(),
        pdu.data.len(),
        chunks.len()
    );

    for (i, chunk) in chunks.iter().enumerate() {
        let mut part = pdu.clone();
        part.data = chunk.to_vec();
        part.data_length = chunk.len() as u32;

        if i < last {
            part.flags = (part.flags & !(flags::TRANSIT | flags::NSG_MASK)) | flags::CONTINUE;
            writer.send_pdu(part)?;

            let ack = reader.recv_pdu()?;
            if ack.opcode != ack_opcode {
                return Err(IscsiError::Protocol(format!(
                    "expected {} acknowledgement, got {}",
                    if ack_opcode == opcode::LOGIN_REQUEST { "Login" } else { "Text" },
                    ack.opcode_name()
                )));
            }
            if !ack.data.is_empty() {
                return Err(IscsiError::Protocol(format!(
                    "continuation acknowledgement carries {} bytes of data",
                    ack.data.len()
                )));
            }
        } else {
            writer.send_pdu(part)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdu::{pack_lun, scsi_status, stage};
    use std::io::Cursor;

    fn encode_with(digests: Digests, pdu: IscsiPdu) -> Vec<u8> {
        let mut writer = PduWriter::new(Vec::new());
        writer.set_digests(digests);
        writer.send_pdu(pdu).unwrap();
        writer.into_inner()
    }

    fn decode_all(bytes: Vec<u8>, digests: Digests) -> Vec<IscsiPdu> {
        let total = bytes.len() as u64;
        let mut reader = PduReader::new(Cursor::new(bytes));
        reader.set_digests(digests);
        let mut out = Vec::new();
        while reader.get_ref().position() < total {
            out.push(reader.recv_pdu().unwrap());
        }
        out
    }

    #[test]
    fn test_crc32c_known_vector() {
        // RFC 3720 Appendix B.4: 32 bytes of zeroes
        assert_eq!(crc32c(&[0u8; 32]), 0x8a91_36aa);
        assert_eq!(digest_bytes(&[0u8; 32]), [0xaa, 0x36, 0x91, 0x8a]);
        assert_eq!(crc32c(&[0xffu8; 32]), 0x62a8_ab43);
    }

    #[test]
    fn test_digested_pdu_layout() {
        let digests = Digests { header: true, data: true };
        let pdu = IscsiPdu::nop_in(1, RESERVED_TAG, 0, vec![1, 2, 3, 4, 5]);
        let bytes = encode_with(digests, pdu);
        assert_eq!(bytes.len(), BHS_SIZE + 4 + 8 + 4);
        assert_eq!(&bytes[48..52], &digest_bytes(&bytes[..48]));
        assert_eq!(&bytes[60..64], &digest_bytes(&bytes[52..60]));

        let pdus = decode_all(bytes, digests);
        assert_eq!(pdus[0].data, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_header_digest_mismatch() {
        let digests = Digests { header: true, data: false };
        let mut bytes = encode_with(digests, IscsiPdu::nop_in(1, RESERVED_TAG, 0, vec![]));
        bytes[20] ^= 0xFF;

        let mut reader = PduReader::new(Cursor::new(bytes));
        reader.set_digests(digests);
        assert!(matches!(reader.recv_pdu(), Err(IscsiError::Digest(_))));
    }

    #[test]
    fn test_data_digest_mismatch() {
        let digests = Digests { header: false, data: true };
        let mut bytes = encode_with(digests, IscsiPdu::nop_in(1, RESERVED_TAG, 0, vec![9; 8]));
        bytes[BHS_SIZE] ^= 0x01;

        let mut reader = PduReader::new(Cursor::new(bytes));
        reader.set_digests(digests);
        assert!(matches!(reader.recv_pdu(), Err(IscsiError::Digest(_))));
    }

    #[test]
    fn test_peer_closed() {
        let mut reader = PduReader::new(Cursor::new(Vec::new()));
        assert!(matches!(reader.recv_pdu(), Err(IscsiError::PeerClosed)));

        let mut reader = PduReader::new(Cursor::new(vec![0u8; 20]));
        assert!(matches!(reader.recv_pdu(), Err(IscsiError::PeerClosed)));
    }

    #[test]
    fn test_oversized_data_segment() {
        let bytes = encode_with(Digests::default(), IscsiPdu::nop_in(1, RESERVED_TAG, 0, vec![0; 1024]));
        let mut reader = PduReader::new(Cursor::new(bytes));
        reader.set_max_recv_len(512);
        assert!(matches!(reader.recv_pdu(), Err(IscsiError::Protocol(_))));
    }

    #[test]
    fn test_stat_sn_stamping() {
        let mut writer = PduWriter::new(Vec::new());
        writer.set_stat_sn(10);

        let ok = IscsiPdu::login_response([0; 6], 0, 1, 0, 0, stage::SECURITY, stage::OPERATIONAL, true, vec![]);
        assert_eq!(writer.send_pdu(ok).unwrap(), 10);
        assert_eq!(writer.send_pdu(IscsiPdu::r2t(0, 2, 1, 0, 0, 512)).unwrap(), 11);
        assert_eq!(writer.send_pdu(IscsiPdu::nop_in(RESERVED_TAG, 5, 0, vec![])).unwrap(), 11);
        let middle = IscsiPdu::scsi_data_in(0, 3, 0, 0, vec![0; 4], false, None, 0, 0);
        assert_eq!(writer.send_pdu(middle).unwrap(), 11);
        let last = IscsiPdu::scsi_data_in(0, 3, 1, 4, vec![0; 4], true, Some(scsi_status::GOOD), 0, 0);
        assert_eq!(writer.send_pdu(last).unwrap(), 11);
        assert_eq!(writer.send_pdu(IscsiPdu::nop_in(4, RESERVED_TAG, 0, vec![])).unwrap(), 12);
        assert_eq!(writer.stat_sn(), 13);

        let pdus = decode_all(writer.into_inner(), Digests::default());
        let sns: Vec<u32> = pdus.iter().map(|p| p.stat_sn()).collect();
        assert_eq!(sns, vec![10, 11, 11, 11, 11, 12]);
    }

    #[test]
    fn test_login_reject_zeroes_window() {
        let mut writer = PduWriter::new(Vec::new());
        writer.set_stat_sn(7);
        let mut reject = IscsiPdu::login_reject([0; 6], 0, 1, 2, 7);
        reject.set_cmd_sn_window(5, 105);
        assert_eq!(writer.send_pdu(reject).unwrap(), 0);
        assert_eq!(writer.stat_sn(), 7);

        let pdu = &decode_all(writer.into_inner(), Digests::default())[0];
        assert_eq!(pdu.stat_sn(), 0);
        assert_eq!(pdu.exp_cmd_sn(), 0);
        assert_eq!(pdu.max_cmd_sn(), 0);
    }

    #[test]
    fn test_initiator_pdu_untouched() {
        let mut writer = PduWriter::new(Vec::new());
        writer.set_stat_sn(99);
        let cmd = IscsiPdu::scsi_command(pack_lun(0), 1, 42, 7, &[0; 6], false, false, 0, vec![], true);
        writer.send_pdu(cmd).unwrap();
        assert_eq!(writer.stat_sn(), 99);

        let pdu = &decode_all(writer.into_inner(), Digests::default())[0];
        assert_eq!(pdu.cmd_sn(), 42);
    }

    fn empty_login_ack() -> Vec<u8> {
        IscsiPdu::login_request([0; 6], 0, 0, 1, 1, 0, stage::SECURITY, stage::OPERATIONAL, false, vec![]).to_bytes()
    }

    #[test]
    fn test_segmented_login_response() {
        let mut acks = empty_login_ack();
        acks.extend(empty_login_ack());
        let mut reader = PduReader::new(Cursor::new(acks));
        let mut writer = PduWriter::new(Vec::new());

        let data: Vec<u8> = (0u8..20).collect();
        let pdu = IscsiPdu::login_response([0; 6], 0, 1, 0, 0, stage::SECURITY, stage::OPERATIONAL, true, data.clone());
        send_segmented(&mut reader, &mut writer, pdu, Some(8)).unwrap();
        assert_eq!(writer.stat_sn(), 3);

        let pdus = decode_all(writer.into_inner(), Digests::default());
        assert_eq!(pdus.len(), 3);
        for part in &pdus[..2] {
            assert_eq!(part.flags & flags::CONTINUE, flags::CONTINUE);
            assert_eq!(part.flags & flags::TRANSIT, 0);
            assert_eq!(part.flags & flags::NSG_MASK, 0);
        }
        assert_eq!(pdus[2].flags & flags::TRANSIT, flags::TRANSIT);
        assert_eq!(pdus[2].flags & flags::CONTINUE, 0);

        let joined: Vec<u8> = pdus.iter().flat_map(|p| p.data.clone()).collect();
        assert_eq!(joined, data);
    }

    #[test]
    fn test_segmented_rejects_non_empty_ack() {
        let ack = IscsiPdu::login_request([0; 6], 0, 0, 1, 1, 0, 0, 1, false, b"X=1\0".to_vec()).to_bytes();
        let mut reader = PduReader::new(Cursor::new(ack));
        let mut writer = PduWriter::new(Vec::new());

        let pdu = IscsiPdu::login_response([0; 6], 0, 1, 0, 0, 0, 1, true, vec![7; 16]);
        assert!(matches!(
            send_segmented(&mut reader, &mut writer, pdu, Some(8)),
            Err(IscsiError::Protocol(_))
        ));
    }

    #[test]
    fn test_small_payload_not_split() {
        let mut reader = PduReader::new(Cursor::new(Vec::new()));
        let mut writer = PduWriter::new(Vec::new());
        let pdu = IscsiPdu::text_response(1, RESERVED_TAG, true, vec![1; 8]);
        send_segmented(&mut reader, &mut writer, pdu, Some(8)).unwrap();
        assert_eq!(decode_all(writer.into_inner(), Digests::default()).len(), 1);
    }
}
