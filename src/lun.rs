//! LUN storage backend
//!
//! A fixed matrix of `MAX_TARGETS x MAX_LUNS` logical units. Each unit is
//! either an in-memory buffer that grows on demand up to its nominal size,
//! or a shared memory mapping of a file. Administrative calls (map, free,
//! sync, copy in/out, fault injection) operate on the matrix directly.

use crate::error::{IscsiError, ScsiResult};
use crate::pdu::scsi_status;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::Path;

pub const MAX_TARGETS: usize = 4;
pub const MAX_LUNS: usize = 8;

// LUNs go out with peripheral addressing, which has one byte for the LUN
const _: () = assert!(MAX_LUNS <= 0x100);

/// Fixed logical block size in bytes
pub const BLOCK_SIZE: u32 = 512;

/// Nominal size of a fresh LUN, in blocks
pub const DEFAULT_STORAGE_SIZE: u64 = 8192;

/// A shared, read-write mapping of a whole file
struct MmapRegion {
    ptr: *mut u8,
    len: usize,
    _file: File,
}

// The mapping is owned by exactly one LunEntry, which lives behind a mutex.
unsafe impl Send for MmapRegion {}

impl MmapRegion {
    fn map(file: File, len: usize) -> ScsiResult<Self> {
        let ptr = unsafe {
            let addr = libc::mmap(
                std::ptr::null_mut(),
                len as libc::size_t,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                std::os::unix::io::AsRawFd::as_raw_fd(&file),
                0,
            );
            if addr == libc::MAP_FAILED {
                return Err(IscsiError::Io(std::io::Error::last_os_error()));
            }
            addr as *mut u8
        };

        Ok(MmapRegion {
            ptr,
            len,
            _file: file,
        })
    }

    fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }

    fn sync(&self) -> ScsiResult<()> {
        let rc = unsafe { libc::msync(self.ptr as *mut libc::c_void, self.len, libc::MS_SYNC) };
        if rc != 0 {
            return Err(IscsiError::Io(std::io::Error::last_os_error()));
        }
        Ok(())
    }
}

impl Drop for MmapRegion {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.len as libc::size_t);
        }
    }
}

enum Backing {
    Memory(Vec<u8>),
    Mapped(MmapRegion),
}

/// Administratively injected failure returned for every CDB on a LUN
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InjectedFault {
    pub status: u8,
    pub sense_key: u8,
    pub asc: u8,
    pub ascq: u8,
}

/// Result of `get_device_param`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceParam {
    pub is_mmap: bool,
    pub storage_size_bytes: u64,
}

/// One logical unit
pub struct LunEntry {
    pub in_use: bool,
    storage_blocks: u64,
    backing: Backing,
    /// Last accessed LBA, base for relative addressing
    pub last_lba: u64,
    fault: Option<InjectedFault>,
}

impl Default for LunEntry {
    fn default() -> Self {
        Self::new()
    }
}

impl LunEntry {
    pub fn new() -> Self {
        LunEntry {
            in_use: true,
            storage_blocks: DEFAULT_STORAGE_SIZE,
            backing: Backing::Memory(Vec::new()),
            last_lba: 0,
            fault: None,
        }
    }

    /// Nominal size in blocks
    pub fn storage_blocks(&self) -> u64 {
        self.storage_blocks
    }

    pub fn storage_bytes(&self) -> u64 {
        self.storage_blocks * BLOCK_SIZE as u64
    }

    /// Bytes currently allocated
    pub fn buffer_len(&self) -> usize {
        match &self.backing {
            Backing::Memory(buf) => buf.len(),
            Backing::Mapped(region) => region.len,
        }
    }

    pub fn is_mapped(&self) -> bool {
        matches!(self.backing, Backing::Mapped(_))
    }

    pub fn fault(&self) -> Option<InjectedFault> {
        self.fault
    }

    fn check_range(&self, offset: u64, len: usize, errno: i32) -> ScsiResult<usize> {
        let end = offset
            .checked_add(len as u64)
            .ok_or_else(|| IscsiError::errno(errno))?;
        if end > self.storage_bytes() {
            return Err(IscsiError::errno(errno));
        }
        Ok(offset as usize)
    }

    /// Copy bytes out of the LUN; bytes never written read as zero
    pub fn read(&self, offset: u64, buf: &mut [u8]) -> ScsiResult<()> {
        let start = self.check_range(offset, buf.len(), libc::ENXIO)?;
        let data: &[u8] = match &self.backing {
            Backing::Memory(v) => v,
            Backing::Mapped(region) => region.as_slice(),
        };

        let tail = data.get(start..).unwrap_or(&[]);
        let available = tail.len().min(buf.len());
        buf[..available].copy_from_slice(&tail[..available]);
        buf[available..].fill(0);
        Ok(())
    }

    /// Copy bytes into the LUN, growing an in-memory buffer as needed
    pub fn write(&mut self, offset: u64, data: &[u8]) -> ScsiResult<()> {
        let start = self.check_range(offset, data.len(), libc::ENOSPC)?;
        let end = start + data.len();
        self.ensure_len(end)?;

        let buf: &mut [u8] = match &mut self.backing {
            Backing::Memory(v) => v,
            Backing::Mapped(region) => region.as_mut_slice(),
        };
        buf[start..end].copy_from_slice(data);
        Ok(())
    }

    fn ensure_len(&mut self, len: usize) -> ScsiResult<()> {
        match &mut self.backing {
            Backing::Memory(v) => {
                if v.len() < len {
                    log::trace!("growing in-memory LUN buffer {} -> {}", v.len(), len);
                    v.resize(len, 0);
                }
                Ok(())
            }
            Backing::Mapped(region) if region.len < len => Err(IscsiError::errno(libc::EINVAL)),
            Backing::Mapped(_) => Ok(()),
        }
    }

    fn reset(&mut self) {
        self.storage_blocks = DEFAULT_STORAGE_SIZE;
        self.backing = Backing::Memory(Vec::new());
        self.last_lba = 0;
        self.fault = None;
    }
}

/// The target x LUN matrix
pub struct LunMatrix {
    entries: Vec<Vec<LunEntry>>,
}

impl Default for LunMatrix {
    fn default() -> Self {
        Self::new()
    }
}

impl LunMatrix {
    /// Every LUN in use, in memory, with the default size
    pub fn new() -> Self {
        let entries = (0..MAX_TARGETS)
            .map(|_| (0..MAX_LUNS).map(|_| LunEntry::new()).collect())
            .collect();
        LunMatrix { entries }
    }

    pub fn entry(&self, target: usize, lun: usize) -> ScsiResult<&LunEntry> {
        self.entries
            .get(target)
            .and_then(|t| t.get(lun))
            .ok_or_else(|| IscsiError::errno(libc::ENXIO))
    }

    pub fn entry_mut(&mut self, target: usize, lun: usize) -> ScsiResult<&mut LunEntry> {
        self.entries
            .get_mut(target)
            .and_then(|t| t.get_mut(lun))
            .ok_or_else(|| IscsiError::errno(libc::ENXIO))
    }

    /// LUN numbers in use on a target, ascending
    pub fn in_use_luns(&self, target: usize) -> Vec<u16> {
        self.entries
            .get(target)
            .map(|luns| {
                luns.iter()
                    .enumerate()
                    .filter(|(_, e)| e.in_use)
                    .map(|(i, _)| i as u16)
                    .collect()
            })
            .unwrap_or_default()
    }

    // ========================================================================
    // Administrative API
    // ========================================================================

    /// Back a LUN with a shared mapping of `path`; the file size sets the
    /// storage size
    pub fn mmap_device(&mut self, target: usize, lun: usize, path: impl AsRef<Path>) -> ScsiResult<()> {
        let path = path.as_ref();
        let entry = self.entry_mut(target, lun)?;

        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let file_len = file.metadata()?.len();
        let blocks = file_len / BLOCK_SIZE as u64;
        if blocks == 0 {
            return Err(IscsiError::errno(libc::EINVAL));
        }
        let map_len = usize::try_from(blocks * BLOCK_SIZE as u64)
            .map_err(|_| IscsiError::errno(libc::EINVAL))?;

        let region = MmapRegion::map(file, map_len)?;
        entry.backing = Backing::Mapped(region);
        entry.storage_blocks = blocks;
        entry.last_lba = 0;
        entry.in_use = true;

        log::info!(
            "target {} LUN {} mapped to {} ({} blocks)",
            target,
            lun,
            path.display(),
            blocks
        );
        Ok(())
    }

    /// Drop a LUN's storage and return it to an empty in-memory buffer
    pub fn free_device(&mut self, target: usize, lun: usize) -> ScsiResult<()> {
        let entry = self.entry_mut(target, lun)?;
        entry.reset();
        log::info!("target {} LUN {} freed", target, lun);
        Ok(())
    }

    pub fn get_device_param(&self, target: usize, lun: usize) -> ScsiResult<DeviceParam> {
        let entry = self.entry(target, lun)?;
        Ok(DeviceParam {
            is_mmap: entry.is_mapped(),
            storage_size_bytes: entry.storage_bytes(),
        })
    }

    /// Flush a mapped LUN to its file; no-op for in-memory LUNs
    pub fn sync_device(&self, target: usize, lun: usize) -> ScsiResult<()> {
        match &self.entry(target, lun)?.backing {
            Backing::Mapped(region) => region.sync(),
            Backing::Memory(_) => Ok(()),
        }
    }

    /// Copy `len` bytes from `src` into the LUN at `offset`
    pub fn write_to_device(
        &mut self,
        target: usize,
        lun: usize,
        offset: u64,
        src: impl AsRef<Path>,
        len: usize,
    ) -> ScsiResult<()> {
        let entry = self.entry_mut(target, lun)?;
        entry.check_range(offset, len, libc::ENOSPC)?;

        let mut data = vec![0u8; len];
        File::open(src.as_ref())?.read_exact(&mut data)?;
        entry.write(offset, &data)
    }

    /// Copy `len` bytes of the LUN at `offset` into `dst` (created or truncated)
    pub fn read_from_device(
        &self,
        target: usize,
        lun: usize,
        offset: u64,
        dst: impl AsRef<Path>,
        len: usize,
    ) -> ScsiResult<()> {
        let entry = self.entry(target, lun)?;
        let mut data = vec![0u8; len];
        entry.read(offset, &mut data)?;

        let mut file = File::create(dst.as_ref())?;
        file.write_all(&data)?;
        Ok(())
    }

    /// Inject (or, with status GOOD, clear) a fault on a LUN
    pub fn set_device_failure_state(
        &mut self,
        target: usize,
        lun: usize,
        status: u8,
        sense_key: u8,
        asc: u8,
        ascq: u8,
    ) -> ScsiResult<()> {
        let entry = self.entry_mut(target, lun)?;
        entry.fault = if status == scsi_status::GOOD {
            None
        } else {
            Some(InjectedFault {
                status,
                sense_key,
                asc,
                ascq,
            })
        };
        log::info!(
            "target {} LUN {} failure state: status={:#04x} sense={:#04x} asc={:#04x} ascq={:#04x}",
            target,
            lun,
            status,
            sense_key,
            asc,
            ascq
        );
        Ok(())
    }
}
