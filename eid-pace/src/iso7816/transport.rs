//! Abstraction over the physical link to a card.


use std::fmt;

use crate::iso7816::apdu::{Apdu, Response};
use crate::iso7816::card::CommunicationError;


/// What went wrong on the link to the card.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum TransportErrorCode {
    NoContext,
    NoReaders,
    NoCard,
    CardRemoved,
    ConnectionLost,
    TransmissionFailed,
    ProtocolMismatch,
    ReaderBusy,
    Timeout,
    NotConnected,
}
impl TransportErrorCode {
    pub fn description(&self) -> &'static str {
        match self {
            Self::NoContext => "failed to establish a PC/SC context",
            Self::NoReaders => "no smart card readers found",
            Self::NoCard => "no card present",
            Self::CardRemoved => "card removed",
            Self::ConnectionLost => "connection to card lost",
            Self::TransmissionFailed => "transmission failed",
            Self::ProtocolMismatch => "protocol mismatch",
            Self::ReaderBusy => "reader busy",
            Self::Timeout => "timed out",
            Self::NotConnected => "not connected to a card",
        }
    }
}


#[derive(Debug)]
pub struct TransportError {
    pub code: TransportErrorCode,
    pub cause: Option<pcsc::Error>,
}
impl TransportError {
    pub fn new(code: TransportErrorCode) -> Self {
        Self { code, cause: None }
    }

    pub fn with_cause(code: TransportErrorCode, cause: pcsc::Error) -> Self {
        Self { code, cause: Some(cause) }
    }

    /// Classifies a PC/SC error, using `fallback` if it has no more specific meaning.
    pub fn from_pcsc(fallback: TransportErrorCode, cause: pcsc::Error) -> Self {
        let code = match cause {
            pcsc::Error::NoReadersAvailable|pcsc::Error::UnknownReader => TransportErrorCode::NoReaders,
            pcsc::Error::NoSmartcard => TransportErrorCode::NoCard,
            pcsc::Error::RemovedCard => TransportErrorCode::CardRemoved,
            pcsc::Error::ResetCard|pcsc::Error::UnpoweredCard|pcsc::Error::UnresponsiveCard
                => TransportErrorCode::ConnectionLost,
            pcsc::Error::ProtoMismatch => TransportErrorCode::ProtocolMismatch,
            pcsc::Error::SharingViolation => TransportErrorCode::ReaderBusy,
            pcsc::Error::Timeout => TransportErrorCode::Timeout,
            pcsc::Error::NoService|pcsc::Error::ServiceStopped => TransportErrorCode::NoContext,
            _ => fallback,
        };
        Self::with_cause(code, cause)
    }
}
impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.cause {
            Some(cause) => write!(f, "{}: {}", self.code.description(), cause),
            None => write!(f, "{}", self.code.description()),
        }
    }
}
impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.cause {
            Some(cause) => Some(cause),
            None => None,
        }
    }
}
impl From<TransportErrorCode> for TransportError {
    fn from(value: TransportErrorCode) -> Self { Self::new(value) }
}


/// Information about the connected card.
#[derive(Clone, Debug, Default, Eq, Hash, PartialEq)]
pub struct CardStatus {
    /// Answer To Reset.
    pub atr: Vec<u8>,

    /// `T=0`, `T=1` etc.
    pub protocol: String,

    pub reader: String,
}


/// A link over which raw APDUs can be exchanged with a card.
pub trait Transport {
    fn connect(&mut self) -> Result<(), TransportError>;
    fn disconnect(&mut self) -> Result<(), TransportError>;
    fn is_connected(&self) -> bool;

    /// Sends the raw bytes of a command APDU and returns the raw bytes of the response APDU,
    /// including the status word.
    fn transmit(&mut self, command: &[u8]) -> Result<Vec<u8>, TransportError>;

    fn status(&mut self) -> Result<CardStatus, TransportError>;
}


/// Exchanges a structured APDU over a transport.
///
/// Used by transports to implement [`SmartCard`](crate::iso7816::card::SmartCard).
pub fn communicate_via<T: Transport + ?Sized>(transport: &mut T, request: &Apdu) -> Result<Response, CommunicationError> {
    let out_buf = request.to_bytes()?;
    let in_buf = transport.transmit(&out_buf)?;
    Response::from_slice(&in_buf)
        .ok_or(CommunicationError::ShortResponse)
}
