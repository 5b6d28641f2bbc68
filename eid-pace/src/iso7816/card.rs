//! The smart card abstraction and the errors raised while talking to a card.


use std::fmt;

use crate::crypt::elliptic;
use crate::iso7816::apdu;
use crate::iso7816::status::StatusWord;
use crate::iso7816::transport::TransportError;
use crate::pace;
use crate::secure_messaging;


/// Coarse classification of failures, for callers that only need to decide how to react.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum ErrorKind {
    /// A public key or point was malformed or not on the curve.
    InvalidPoint,

    /// A key agreement produced the point at infinity or a key equal to the peer's.
    WeakKey,

    /// The nonce mapping produced an unusable generator.
    InvalidMapping,

    /// A token or MAC did not verify.
    AuthenticationFailed,

    /// The link to the card failed.
    TransportFailure,

    /// The card answered with an error status word.
    StatusError,

    /// The card's answer violated the protocol, or the exchange was used incorrectly.
    ProtocolViolation,
}


#[derive(Debug)]
pub enum CommunicationError {
    Write(apdu::WriteError),
    Transport(TransportError),
    ShortResponse,
    Status { operation: &'static str, status: StatusWord },
    FileTooLarge { maximum: usize },
    SecureMessaging(secure_messaging::Error),
    Pace(pace::Error),
}
impl CommunicationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Write(_) => ErrorKind::ProtocolViolation,
            Self::Transport(_) => ErrorKind::TransportFailure,
            Self::ShortResponse => ErrorKind::ProtocolViolation,
            Self::Status { .. } => ErrorKind::StatusError,
            Self::FileTooLarge { .. } => ErrorKind::ProtocolViolation,
            Self::SecureMessaging(e) => e.kind(),
            Self::Pace(e) => e.kind(),
        }
    }

    /// The status word returned by the card, if this error is due to one.
    pub fn status(&self) -> Option<StatusWord> {
        match self {
            Self::Status { status, .. } => Some(*status),
            Self::Pace(pace::Error::OperationFailed { status, .. }) => Some(*status),
            Self::SecureMessaging(secure_messaging::Error::PlainStatus { status }) => Some(*status),
            _ => None,
        }
    }

    /// Whether starting the exchange over may succeed.
    ///
    /// Transport failures call for a new connection. A status error is worth another attempt
    /// unless the card reported a security failure or a condition that does not go away. Anything
    /// else aborts.
    pub fn is_retryable(&self) -> bool {
        match self.kind() {
            ErrorKind::TransportFailure => true,
            ErrorKind::StatusError => self.status()
                .map(|status| !status.is_fatal() && !status.is_security_failure())
                .unwrap_or(false),
            _ => false,
        }
    }
}
impl fmt::Display for CommunicationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Write(e) => write!(f, "APDU write error: {}", e),
            Self::Transport(e) => write!(f, "transport error: {}", e),
            Self::ShortResponse => write!(f, "response too short"),
            Self::Status { operation, status } => write!(f, "{} failed with status {}", operation, status),
            Self::FileTooLarge { maximum } => write!(f, "file is larger than {} bytes", maximum),
            Self::SecureMessaging(e) => write!(f, "Secure Messaging error: {}", e),
            Self::Pace(e) => write!(f, "PACE error: {}", e),
        }
    }
}
impl std::error::Error for CommunicationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Write(e) => Some(e),
            Self::Transport(e) => Some(e),
            Self::ShortResponse => None,
            Self::Status { .. } => None,
            Self::FileTooLarge { .. } => None,
            Self::SecureMessaging(e) => Some(e),
            Self::Pace(e) => Some(e),
        }
    }
}
impl From<apdu::WriteError> for CommunicationError {
    fn from(value: apdu::WriteError) -> Self { Self::Write(value) }
}
impl From<TransportError> for CommunicationError {
    fn from(value: TransportError) -> Self { Self::Transport(value) }
}
impl From<secure_messaging::Error> for CommunicationError {
    fn from(value: secure_messaging::Error) -> Self { Self::SecureMessaging(value) }
}
impl From<pace::Error> for CommunicationError {
    fn from(value: pace::Error) -> Self { Self::Pace(value) }
}
impl From<elliptic::Error> for CommunicationError {
    fn from(value: elliptic::Error) -> Self { Self::Pace(pace::Error::Elliptic(value)) }
}


/// Fails with [`CommunicationError::Status`] unless the response signals success.
pub fn check_status(operation: &'static str, response: &apdu::Response) -> Result<(), CommunicationError> {
    let status = response.status();
    if status.is_success() {
        Ok(())
    } else {
        Err(CommunicationError::Status { operation, status })
    }
}


/// A smart card compatible with ISO/IEC 7816.
pub trait SmartCard {
    /// Send a request APDU to the smart card and receive a response APDU.
    fn communicate(&mut self, request: &apdu::Apdu) -> Result<apdu::Response, CommunicationError>;
}
impl<SC: SmartCard + ?Sized> SmartCard for &mut SC {
    fn communicate(&mut self, request: &apdu::Apdu) -> Result<apdu::Response, CommunicationError> {
        (**self).communicate(request)
    }
}
impl<SC: SmartCard + ?Sized> SmartCard for Box<SC> {
    fn communicate(&mut self, request: &apdu::Apdu) -> Result<apdu::Response, CommunicationError> {
        (**self).communicate(request)
    }
}
