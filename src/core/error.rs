//! Wire-visible error payloads.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::Transience;

/// Namespace a wire error code belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ErrorDomain {
    /// Protocol-level errors defined by the sync protocol itself.
    Blip,
    /// HTTP status codes tunneled from a gateway peer.
    Http,
    /// Local store failures surfaced to the peer.
    Store,
}

pub const CODE_BAD_REQUEST: u16 = 400;
pub const CODE_FORBIDDEN: u16 = 403;
pub const CODE_NOT_FOUND: u16 = 404;
pub const CODE_TIMEOUT: u16 = 408;
pub const CODE_CONFLICT: u16 = 409;
pub const CODE_TOO_MANY_REQUESTS: u16 = 429;
pub const CODE_INTERNAL: u16 = 500;
pub const CODE_UNAVAILABLE: u16 = 503;

/// An error as carried in message properties or reply frames.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub domain: ErrorDomain,
    pub code: u16,
    pub message: String,
    pub retryable: bool,
}

impl ErrorPayload {
    pub fn new(domain: ErrorDomain, code: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        let retryable = default_retryable(domain, code);
        Self {
            domain,
            code,
            message,
            retryable,
        }
    }

    pub fn retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn transience(&self) -> Transience {
        if self.retryable {
            Transience::Retryable
        } else {
            Transience::Permanent
        }
    }
}

impl fmt::Display for ErrorPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}/{}: {}", self.domain, self.code, self.message)
    }
}

/// Timeouts, throttling, and server-side outages are worth retrying;
/// everything else needs changed inputs.
fn default_retryable(domain: ErrorDomain, code: u16) -> bool {
    match domain {
        ErrorDomain::Blip | ErrorDomain::Http => {
            matches!(
                code,
                CODE_TIMEOUT | CODE_TOO_MANY_REQUESTS | CODE_INTERNAL | CODE_UNAVAILABLE
            )
        }
        ErrorDomain::Store => code == CODE_UNAVAILABLE || code == CODE_TOO_MANY_REQUESTS,
    }
}
