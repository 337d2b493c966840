//! Error types for iSCSI target operations

use thiserror::Error;

/// iSCSI target errors
#[derive(Debug, Error)]
pub enum IscsiError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("SCSI error: {0}")]
    Scsi(String),

    #[error("Session error: {0}")]
    Session(String),

    #[error("Invalid PDU: {0}")]
    InvalidPdu(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Peer closed the connection")]
    PeerClosed,

    #[error("Digest mismatch: {0}")]
    Digest(String),

    /// Login must be refused with the given status class/detail
    #[error("Login rejected ({class:#04x}/{detail:#04x}): {message}")]
    Login {
        class: u8,
        detail: u8,
        message: String,
    },

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),
}

impl IscsiError {
    /// Login failure with an explicit status pair
    pub fn login(class: u8, detail: u8, message: impl Into<String>) -> Self {
        IscsiError::Login {
            class,
            detail,
            message: message.into(),
        }
    }

    /// Build an I/O error from a raw errno value
    pub fn errno(code: i32) -> Self {
        IscsiError::Io(std::io::Error::from_raw_os_error(code))
    }

    /// Raw errno carried by an I/O error, if any
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            IscsiError::Io(e) => e.raw_os_error(),
            _ => None,
        }
    }
}

/// Result type for SCSI operations
pub type ScsiResult<T> = Result<T, IscsiError>;

/// Explain a Login Response status pair (RFC 3720 Section 10.13.5)
pub fn decode_login_status(class: u8, detail: u8) -> String {
    let text = match (class, detail) {
        (0x00, 0x00) => "Login success",
        (0x01, 0x01) => "Target moved temporarily to another portal",
        (0x01, 0x02) => "Target moved permanently, update the initiator configuration",
        (0x02, 0x00) => "Initiator error (miscellaneous)",
        (0x02, 0x01) => "Authentication failed, check the CHAP username and secret",
        (0x02, 0x02) => "Authorization failure, initiator not allowed to access this target",
        (0x02, 0x03) => "Target not found, run discovery to list valid target names",
        (0x02, 0x04) => "Target removed",
        (0x02, 0x05) => "Unsupported iSCSI protocol version",
        (0x02, 0x06) => "Too many connections on this session",
        (0x02, 0x07) => "Missing parameter (InitiatorName or TargetName)",
        (0x02, 0x08) => "Connection cannot be included in this session",
        (0x02, 0x09) => "Session type not supported",
        (0x02, 0x0A) => "Session does not exist",
        (0x02, 0x0B) => "Invalid request during login",
        (0x03, 0x00) => "Target error (miscellaneous)",
        (0x03, 0x01) => "Service unavailable",
        (0x03, 0x02) => "Target out of resources",
        _ => {
            return format!(
                "Unknown login status class {:#04x} detail {:#04x}",
                class, detail
            )
        }
    };
    text.to_string()
}
