//! Unified error type for the interception engine.
//!
//! `Error` is the single error type returned across the crate's public
//! surface. It serializes as `{ "kind": "...", "message": "..." }` so
//! downstream consumers can programmatically distinguish failure domains.

use serde::ser::SerializeStruct;

pub type Result<T> = std::result::Result<T, Error>;

/// Engine-level error.
///
/// Each variant maps to a distinct failure domain. Transient worker
/// conditions (a failed send, a missed recv) are logged and retried in
/// place and never reach this type; what remains is fatal for the
/// operation that returned it.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Raw-socket capability is missing (needs root or CAP_NET_RAW + CAP_NET_ADMIN).
    #[error("operation requires raw-socket privileges (root or CAP_NET_RAW): {0}")]
    PrivilegeDenied(String),

    /// The named interface does not exist.
    #[error("interface not found: {0}")]
    InterfaceNotFound(String),

    /// The named interface exists but is down, loopback, or otherwise unusable.
    #[error("interface unusable: {0}")]
    InterfaceDown(String),

    /// The external inventory helper failed, produced garbage, or found nothing.
    #[error("inventory scan failed: {0}")]
    Inventory(String),

    /// Session lifecycle misuse or setup failure.
    #[error("{0}")]
    Session(String),

    /// Hostname resolution failed.
    #[error("cannot resolve {0}: Unknown host")]
    Dns(String),

    /// I/O and OS-level errors not covered by a more specific variant.
    #[error("{0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Returns the error kind as a string matching the variant name.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::PrivilegeDenied(_) => "PrivilegeDenied",
            Error::InterfaceNotFound(_) => "InterfaceNotFound",
            Error::InterfaceDown(_) => "InterfaceDown",
            Error::Inventory(_) => "Inventory",
            Error::Session(_) => "Session",
            Error::Dns(_) => "Dns",
            Error::Io(_) => "Io",
        }
    }

    /// Classify an I/O error from a raw-socket open into the session taxonomy.
    pub fn from_socket_open(interface: &str, err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::PermissionDenied => Error::PrivilegeDenied(err.to_string()),
            ErrorKind::NotFound => Error::InterfaceNotFound(interface.to_string()),
            ErrorKind::NetworkDown | ErrorKind::NetworkUnreachable => {
                Error::InterfaceDown(format!("{interface}: {err}"))
            }
            _ => Error::Io(err),
        }
    }
}

/// Custom Serialize: produces `{ "kind": "Variant", "message": "..." }`.
impl serde::Serialize for Error {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut s = serializer.serialize_struct("Error", 2)?;
        s.serialize_field("kind", self.kind())?;
        s.serialize_field("message", &self.to_string())?;
        s.end()
    }
}
