//! Error type for the allowed-IPs table.

use std::fmt;

/// Errors surfaced by the mutation API.
///
/// Both variants are caller bugs rather than runtime conditions; they are
/// never retried. A lookup miss is not an error and comes back as `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Address length is neither 4 (IPv4) nor 16 (IPv6) bytes.
    InvalidAddress,
    /// Prefix length exceeds the address width in bits.
    InvalidPrefix,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidAddress => write!(f, "address is not 4 or 16 bytes"),
            Error::InvalidPrefix => write!(f, "prefix length exceeds address width"),
        }
    }
}

impl std::error::Error for Error {}
