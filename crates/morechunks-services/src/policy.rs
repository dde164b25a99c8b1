//! Negotiation policy: what to do with each info message a client sends.
//!
//! Pure decision logic. The connection handler owns every side effect:
//! applying a new rate, writing kick notices, holding, disconnecting.

use std::fmt;
use std::num::IntErrorKind;
use std::time::Duration;

use morechunks_core::InfoMessage;

use crate::limits::LiveLimits;

/// The only dimension clients may share chunks from.
pub const OVERWORLD: &str = "0";

pub const DIMENSION_NOTICE: &str = "i3 You're not in the overworld";
pub const DIMENSION_GRACE: Duration = Duration::from_millis(60_000);

pub const VERSION_NOTICE: &str = "i3 Please update: bit.ly/morechunks-latest";
pub const VERSION_GRACE: Duration = Duration::from_millis(300_000);

/// Why a connection ended.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum DisconnectReason {
    TransportClosed,
    TransportError(String),
    InvalidDimension(String),
    InvalidVersion(String),
    Shutdown,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TransportClosed => write!(f, "transport closed"),
            Self::TransportError(e) => write!(f, "transport error: {e}"),
            Self::InvalidDimension(d) => write!(f, "invalid dimension {d:?}"),
            Self::InvalidVersion(v) => write!(f, "invalid version {v:?}"),
            Self::Shutdown => write!(f, "server shutting down"),
        }
    }
}

/// Instructions for a graceful disconnect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Kick {
    /// Info texts to send, in order, before holding.
    pub notices: Vec<String>,
    /// How long the connection stays open after the notices are flushed.
    pub grace: Duration,
    pub reason: DisconnectReason,
}

impl Kick {
    fn new(notice: &str, grace: Duration, reason: DisconnectReason) -> Self {
        Self {
            notices: vec![
                notice.to_string(),
                format!("! kick ms={}", grace.as_millis()),
            ],
            grace,
            reason,
        }
    }
}

/// An info message that changes nothing, kept so the caller can log why.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ignored {
    InvalidRate(String),
    UnknownKey(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Accept,
    SetRate(u32),
    Ignore(Ignored),
    Kick(Kick),
}

/// Decide the outcome of one info message.
///
/// Rates are not checked against the server cap here. The cap is applied
/// at send time so that it can change without renegotiating.
pub fn evaluate(info: &InfoMessage, limits: &LiveLimits) -> Decision {
    match info {
        InfoMessage::Dimension(dim) if dim == OVERWORLD => Decision::Accept,
        InfoMessage::Dimension(dim) => Decision::Kick(Kick::new(
            DIMENSION_NOTICE,
            DIMENSION_GRACE,
            DisconnectReason::InvalidDimension(dim.clone()),
        )),
        InfoMessage::ChunksPerSecond(v) => match v.trim().parse::<u32>() {
            Ok(rate) => Decision::SetRate(rate),
            // Too large for u32: saturate. The send-time cap still applies.
            Err(e) if *e.kind() == IntErrorKind::PosOverflow => Decision::SetRate(u32::MAX),
            Err(_) => Decision::Ignore(Ignored::InvalidRate(v.clone())),
        },
        InfoMessage::Version(v) if limits.version_allowed(v) => Decision::Accept,
        InfoMessage::Version(v) => Decision::Kick(Kick::new(
            VERSION_NOTICE,
            VERSION_GRACE,
            DisconnectReason::InvalidVersion(v.clone()),
        )),
        InfoMessage::Other(text) => Decision::Ignore(Ignored::UnknownKey(text.clone())),
    }
}
