//! SCSI command execution over a live session

mod common;

use common::*;
use iscsi_target::pdu::{flags, scsi_status};
use iscsi_target::scsi::{asc, sense_key};

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

#[test]
fn test_scsi_inquiry() {
    let handle = start_default();
    let mut client = login(&handle);

    let result = client.inquiry(test_lun(), 36).expect("INQUIRY failed");
    assert_eq!(result.status, scsi_status::GOOD);
    assert_eq!(result.data.len(), 36);
    assert_eq!(result.data[0], 0x00, "direct access block device");
    assert_eq!(&result.data[8..16], b"UNH-IOL ");
}

#[test]
fn test_scsi_inquiry_underflow() {
    let handle = start_default();
    let mut client = login(&handle);

    let result = client.inquiry(test_lun(), 255).unwrap();
    assert_eq!(result.data.len(), 36);
    assert_eq!(result.residual_flags, flags::UNDERFLOW);
    assert_eq!(result.residual_count, 255 - 36);
}

#[test]
fn test_scsi_inquiry_unsupported_lun() {
    let handle = start_default();
    let mut client = login(&handle);

    let result = client.inquiry(12, 36).unwrap();
    assert_eq!(result.status, scsi_status::GOOD);
    assert_eq!(result.data[0], 0x7f, "peripheral not connected");
}

#[test]
fn test_scsi_read_capacity() {
    let handle = start_default();
    let mut client = login(&handle);

    let (last_lba, block_size) = client.read_capacity(test_lun()).unwrap();
    assert_eq!(last_lba, 8191);
    assert_eq!(block_size, 512);
}

#[test]
fn test_scsi_test_unit_ready() {
    let handle = start_default();
    let mut client = login(&handle);

    let result = client.test_unit_ready(test_lun()).unwrap();
    assert_eq!(result.status, scsi_status::GOOD);
    assert!(result.sense.is_none());
}

#[test]
fn test_scsi_report_luns() {
    let handle = start_default();
    let mut client = login(&handle);

    let result = client.report_luns(256).unwrap();
    assert_eq!(result.status, scsi_status::GOOD);
    assert_eq!(&result.data[0..4], &[0, 0, 0, 64]);
    assert_eq!(result.data.len(), 8 + 8 * 8);
}

#[test]
fn test_scsi_write_read_immediate() {
    let handle = start_default();
    let mut client = login(&handle);
    let data = pattern(1024, 3);

    let write = client.write10(test_lun(), 10, &data).unwrap();
    assert_eq!(write.status, scsi_status::GOOD);
    assert_eq!(write.r2t_count, 0, "fits in immediate data");

    let read = client.read10(test_lun(), 10, 2).unwrap();
    assert_eq!(read.status, scsi_status::GOOD);
    assert_eq!(read.data, data);
}

#[test]
fn test_scsi_write_with_r2t() {
    let handle = start_default();
    let mut client = login(&handle);
    let data = pattern(32 * 512, 9);

    let write = client.write10(test_lun(), 100, &data).unwrap();
    assert_eq!(write.status, scsi_status::GOOD);
    assert!(write.r2t_count >= 1, "data beyond the immediate part needs an R2T");

    let read = client.read10(test_lun(), 100, 32).unwrap();
    assert_eq!(read.data.len(), data.len());
    assert_eq!(read.data, data);
}

#[test]
fn test_scsi_unwritten_blocks_read_zero() {
    let handle = start_default();
    let mut client = login(&handle);

    let read = client.read10(test_lun(), 4000, 4).unwrap();
    assert_eq!(read.status, scsi_status::GOOD);
    assert_eq!(read.data, vec![0u8; 4 * 512]);
}

#[test]
fn test_scsi_read_out_of_range() {
    let handle = start_default();
    let mut client = login(&handle);

    let result = client.read10(test_lun(), 8191, 2).unwrap();
    assert_eq!(result.status, scsi_status::CHECK_CONDITION);
    let sense = result.sense.expect("sense data");
    assert_eq!(sense[2] & 0x0f, sense_key::ILLEGAL_REQUEST);
}

#[test]
fn test_scsi_invalid_lun() {
    let handle = start_default();
    let mut client = login(&handle);

    let result = client.test_unit_ready(9).unwrap();
    assert_eq!(result.status, scsi_status::CHECK_CONDITION);
    let sense = result.sense.expect("sense data");
    assert_eq!(sense[12], asc::LOGICAL_UNIT_NOT_SUPPORTED);
}

#[test]
fn test_scsi_invalid_command() {
    let handle = start_default();
    let mut client = login(&handle);

    let result = client.scsi_command(test_lun(), &[0xC7, 0, 0, 0, 0, 0], 0, None).unwrap();
    assert_eq!(result.status, scsi_status::CHECK_CONDITION);
    let sense = result.sense.expect("sense data");
    assert_eq!(sense[2] & 0x0f, sense_key::ILLEGAL_REQUEST);
}

#[test]
fn test_injected_fault() {
    let handle = start_default();
    let mut client = login(&handle);

    handle
        .luns()
        .lock()
        .unwrap()
        .set_device_failure_state(0, 2, scsi_status::BUSY, 0, 0, 0)
        .unwrap();
    assert_eq!(client.test_unit_ready(2).unwrap().status, scsi_status::BUSY);
    assert_eq!(client.test_unit_ready(3).unwrap().status, scsi_status::GOOD);

    handle
        .luns()
        .lock()
        .unwrap()
        .set_device_failure_state(0, 2, scsi_status::GOOD, 0, 0, 0)
        .unwrap();
    assert_eq!(client.test_unit_ready(2).unwrap().status, scsi_status::GOOD);
}

#[test]
fn test_admin_copy_visible_to_initiator() {
    let handle = start_default();
    let mut client = login(&handle);

    let path = std::env::temp_dir().join(format!("iscsi-scsi-test-{}", std::process::id()));
    let data = pattern(512, 77);
    std::fs::write(&path, &data).unwrap();
    handle
        .luns()
        .lock()
        .unwrap()
        .write_to_device(0, 1, 512 * 7, &path, 512)
        .unwrap();
    std::fs::remove_file(&path).unwrap();

    let read = client.read10(1, 7, 1).unwrap();
    assert_eq!(read.data, data);
}
