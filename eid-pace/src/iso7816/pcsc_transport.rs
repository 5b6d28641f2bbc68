//! Card access through PC/SC.


use std::ffi::{CStr, CString};
use std::time::{Duration, Instant};

use pcsc::{Context, Disposition, Protocol, Protocols, ReaderState, Scope, ShareMode, State};

use crate::iso7816::apdu::{Apdu, Response};
use crate::iso7816::card::{CommunicationError, SmartCard};
use crate::iso7816::transport::{communicate_via, CardStatus, Transport, TransportError, TransportErrorCode};
use crate::logging::{ApduLogger, TracingApduLogger};


/// Readers whose names contain this are preferred when no reader has been chosen explicitly.
pub const PREFERRED_READER_MARKER: &str = "Generic EMV";


/// How to pick and connect to a reader.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TransportConfig {
    /// Index into the list of readers.
    pub reader_index: Option<usize>,

    /// Substring of the reader name; consulted if no index is given.
    pub reader_name: Option<String>,

    /// How long to wait for a card to be inserted. `None` fails at once if no card is present.
    pub card_wait_timeout: Option<Duration>,

    pub share_mode: ShareMode,
}
impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            reader_index: None,
            reader_name: None,
            card_wait_timeout: None,
            share_mode: ShareMode::Shared,
        }
    }
}


/// Chooses a reader according to the configuration.
///
/// Without an explicit choice, the first reader containing [`PREFERRED_READER_MARKER`] is taken,
/// falling back to the first reader.
pub fn select_reader<'r>(readers: &'r [String], config: &TransportConfig) -> Result<&'r str, TransportError> {
    if readers.is_empty() {
        return Err(TransportErrorCode::NoReaders.into());
    }

    if let Some(index) = config.reader_index {
        return readers.get(index)
            .map(|r| r.as_str())
            .ok_or_else(|| TransportErrorCode::NoReaders.into());
    }
    if let Some(name) = &config.reader_name {
        return readers.iter()
            .find(|r| r.contains(name.as_str()))
            .map(|r| r.as_str())
            .ok_or_else(|| TransportErrorCode::NoReaders.into());
    }

    let preferred = readers.iter()
        .find(|r| r.contains(PREFERRED_READER_MARKER))
        .unwrap_or(&readers[0]);
    Ok(preferred.as_str())
}


fn protocol_name(protocol: Option<Protocol>) -> &'static str {
    match protocol {
        Some(Protocol::T0) => "T=0",
        Some(Protocol::T1) => "T=1",
        Some(Protocol::RAW) => "RAW",
        None => "unknown",
    }
}


struct Connection {
    card: pcsc::Card,
    reader: String,
}


/// A [`Transport`] backed by the system's PC/SC service.
pub struct PcscTransport {
    config: TransportConfig,
    logger: Box<dyn ApduLogger>,
    context: Option<Context>,
    connection: Option<Connection>,
}
impl PcscTransport {
    pub fn new(config: TransportConfig) -> Self {
        Self::with_logger(config, Box::new(TracingApduLogger))
    }

    pub fn with_logger(config: TransportConfig, logger: Box<dyn ApduLogger>) -> Self {
        Self {
            config,
            logger,
            context: None,
            connection: None,
        }
    }

    fn establish_context(&mut self) -> Result<&Context, TransportError> {
        if self.context.is_none() {
            let context = Context::establish(Scope::User)
                .map_err(|e| TransportError::from_pcsc(TransportErrorCode::NoContext, e))?;
            self.context = Some(context);
        }
        self.context.as_ref()
            .ok_or_else(|| TransportErrorCode::NoContext.into())
    }

    /// Lists the names of the connected readers.
    pub fn list_readers(&mut self) -> Result<Vec<String>, TransportError> {
        let context = self.establish_context()?;
        let mut readers_buf = [0u8; 2048];
        let readers = match context.list_readers(&mut readers_buf) {
            Ok(r) => r,
            Err(pcsc::Error::NoReadersAvailable) => return Ok(Vec::new()),
            Err(e) => return Err(TransportError::from_pcsc(TransportErrorCode::NoReaders, e)),
        };
        Ok(readers
            .map(|r| r.to_string_lossy().into_owned())
            .collect())
    }

    fn wait_for_card(context: &Context, reader: &CStr, timeout: Duration) -> Result<(), TransportError> {
        let deadline = Instant::now() + timeout;
        let mut states = [ReaderState::new(reader.to_owned(), State::UNAWARE)];
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            context.get_status_change(Some(remaining), &mut states)
                .map_err(|e| TransportError::from_pcsc(TransportErrorCode::NoCard, e))?;
            if states[0].event_state().contains(State::PRESENT) {
                return Ok(());
            }
            if remaining.is_zero() {
                return Err(TransportErrorCode::Timeout.into());
            }
            states[0].sync_current_state();
        }
    }

    fn connected(&self) -> Result<&Connection, TransportError> {
        self.connection.as_ref()
            .ok_or_else(|| TransportErrorCode::NotConnected.into())
    }
}
impl Transport for PcscTransport {
    fn connect(&mut self) -> Result<(), TransportError> {
        if self.connection.is_some() {
            return Ok(());
        }

        let readers = self.list_readers()
            .map_err(|e| { self.logger.log_error(&e); e })?;
        let reader = select_reader(&readers, &self.config)
            .map_err(|e| { self.logger.log_error(&e); e })?
            .to_owned();
        self.logger.log_reader_selected(&reader, &readers);

        let reader_cstring = CString::new(reader.clone())
            .map_err(|_| TransportError::new(TransportErrorCode::NoReaders))?;
        let card_wait_timeout = self.config.card_wait_timeout;
        let share_mode = self.config.share_mode;
        let context = self.establish_context()?;

        if let Some(timeout) = card_wait_timeout {
            Self::wait_for_card(context, &reader_cstring, timeout)?;
        }

        let card = context.connect(&reader_cstring, share_mode, Protocols::ANY)
            .map_err(|e| TransportError::from_pcsc(TransportErrorCode::NoCard, e))?;
        self.connection = Some(Connection { card, reader });

        let status = self.status()?;
        self.logger.log_connect(&status.reader, &status.protocol);
        self.logger.log_atr(&status.atr);
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), TransportError> {
        let Some(connection) = self.connection.take() else {
            return Ok(());
        };
        let result = connection.card.disconnect(Disposition::LeaveCard)
            .map_err(|(_card, e)| TransportError::from_pcsc(TransportErrorCode::ConnectionLost, e));
        self.context = None;
        self.logger.log_disconnect();
        result
    }

    fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    fn transmit(&mut self, command: &[u8]) -> Result<Vec<u8>, TransportError> {
        let connection = self.connected()?;
        self.logger.log_command(command);

        let started = Instant::now();
        let mut in_buf = [0u8; pcsc::MAX_BUFFER_SIZE_EXTENDED];
        let response = match connection.card.transmit(command, &mut in_buf) {
            Ok(r) => r.to_vec(),
            Err(e) => {
                let error = TransportError::from_pcsc(TransportErrorCode::TransmissionFailed, e);
                self.logger.log_error(&error);
                return Err(error);
            },
        };

        self.logger.log_response(&response, started.elapsed());
        Ok(response)
    }

    fn status(&mut self) -> Result<CardStatus, TransportError> {
        let connection = self.connected()?;
        let status = connection.card.status2_owned()
            .map_err(|e| TransportError::from_pcsc(TransportErrorCode::ConnectionLost, e))?;
        Ok(CardStatus {
            atr: status.atr().to_vec(),
            protocol: protocol_name(status.protocol2()).to_owned(),
            reader: connection.reader.clone(),
        })
    }
}
impl SmartCard for PcscTransport {
    fn communicate(&mut self, request: &Apdu) -> Result<Response, CommunicationError> {
        communicate_via(self, request)
    }
}
impl Drop for PcscTransport {
    fn drop(&mut self) {
        let _ = self.disconnect();
    }
}
