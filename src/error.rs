use std::{io, net::IpAddr};

use http::StatusCode;
use n0_error::{AnyError, e, stack_error};

/// Errors raised while parsing the allow-list specification.
///
/// These are fatal: the proxy refuses to start listening with an invalid
/// allow list.
#[stack_error(derive, add_meta)]
#[non_exhaustive]
pub enum ConfigError {
    /// The allow specification was empty, or no entries survived parsing.
    #[error("allow list is empty")]
    EmptyAllowList,

    /// An entry was neither a valid address nor a valid network prefix.
    #[error("invalid allow list entry {entry:?}")]
    InvalidEntry {
        /// The offending entry, as written in the specification.
        entry: String,
    },
}

/// Errors that terminate a single client connection.
///
/// Every variant is isolated to its connection: nothing is retried, and no
/// shared state is affected. [`SessionError::response_status`] decides
/// whether the client receives a synthetic response before the close.
#[stack_error(derive, add_meta)]
#[non_exhaustive]
pub enum SessionError {
    /// The peer address is outside the allow list. Closed without a
    /// response, indistinguishable from a network error for the client.
    #[error("client {addr} is not allow-listed")]
    NotAllowed {
        /// The rejected peer address.
        addr: IpAddr,
    },

    /// The request is malformed or names no usable target.
    #[error("bad request")]
    BadRequest {
        #[error(source)]
        source: AnyError,
    },

    /// Dialing the upstream or completing the exchange with it failed.
    #[error("upstream exchange failed")]
    Upstream {
        #[error(source)]
        source: AnyError,
    },

    /// Mid-stream read or write failure on either socket.
    #[error("io error")]
    Io {
        #[error(source, std_err)]
        source: io::Error,
    },
}

impl From<io::Error> for SessionError {
    #[track_caller]
    fn from(source: io::Error) -> Self {
        e!(SessionError::Io { source })
    }
}

impl SessionError {
    /// Status for the synthetic response owed to the client, if any.
    ///
    /// Admission failures and mid-stream I/O errors close the connection
    /// without writing anything.
    pub fn response_status(&self) -> Option<StatusCode> {
        match self {
            SessionError::NotAllowed { .. } => None,
            SessionError::BadRequest { .. } => Some(StatusCode::BAD_REQUEST),
            SessionError::Upstream { .. } => Some(StatusCode::BAD_GATEWAY),
            SessionError::Io { .. } => None,
        }
    }
}
