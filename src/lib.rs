//! A pure Rust iSCSI target implementation
//!
//! This library provides a user-space iSCSI target that emulates a matrix of
//! block devices. Each LUN is backed either by a growable in-memory buffer or
//! by a shared memory mapping of a file, and can be administered (mapped,
//! freed, synced, fault-injected) while the target is serving.
//!
//! The target handles the login phase (operational parameter negotiation,
//! CHAP and pluggable SRP authentication), full feature phase command
//! ordering by CmdSN, Data-In/R2T/Data-Out sequencing, task management,
//! multiple connections per session, and optional CRC32C digests.
//!
//! # Example
//!
//! ```no_run
//! use iscsi_target::{IscsiTarget, LunMatrix};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut luns = LunMatrix::new();
//! luns.mmap_device(0, 1, "/var/lib/iscsi/disk1.img")?;
//!
//! let target = IscsiTarget::builder()
//!     .bind_addr("0.0.0.0:3260")
//!     .target_name("iqn.2025-12.local:storage.disk1")
//!     .luns(luns)
//!     .build()?;
//! target.run()?;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod client;
pub mod command;
pub mod config;
pub mod connection;
pub mod error;
pub mod login;
pub mod lun;
pub mod params;
pub mod pdu;
pub mod scsi;
pub mod session;
pub mod target;
pub mod task;
pub mod wire;

pub use auth::{AuthConfig, ChapCredentials, SrpAuthenticator};
pub use client::IscsiClient;
pub use config::{Customization, TargetConfig, Verbosity};
pub use error::{IscsiError, ScsiResult};
pub use lun::LunMatrix;
pub use target::{IscsiTarget, IscsiTargetBuilder, TargetHandle};

/// Version of this library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
