//! Diagnostic logging of card traffic.
//!
//! The transport owns an [`ApduLogger`] which it notifies about the connection lifecycle and every
//! exchanged APDU. [`TracingApduLogger`] forwards these events to `tracing`, [`NullApduLogger`]
//! swallows them.


use std::fmt::Write;
use std::time::Duration;

use tracing::{debug, info, trace, warn};

use crate::iso7816::status::StatusWord;


/// INS of VERIFY, whose plain data is a password.
const INS_VERIFY: u8 = 0x20;


/// Returns a human-readable name for common instruction bytes (ISO/IEC 7816-4).
pub fn instruction_name(ins: u8) -> String {
    let name = match ins {
        0xA4 => "SELECT",
        0x20 => "VERIFY",
        0xB0 => "READ BINARY",
        0xB2 => "READ RECORD",
        0xCA => "GET DATA",
        0xD6 => "UPDATE BINARY",
        0x82 => "EXTERNAL AUTHENTICATE",
        0x84 => "GET CHALLENGE",
        0x86 => "GENERAL AUTHENTICATE",
        0x88 => "INTERNAL AUTHENTICATE",
        0x22 => "MANAGE SECURITY ENVIRONMENT",
        0x2A => "PERFORM SECURITY OPERATION",
        other => return format!("INS_{:02X}", other),
    };
    name.to_owned()
}


/// Formats a buffer as a classic hex dump with offsets and an ASCII column.
pub fn hexdump(buf: &[u8]) -> String {
    let mut ret = String::new();
    for (line_index, line) in buf.chunks(16).enumerate() {
        let _ = write!(ret, "{:08X}  ", line_index * 16);

        for i in 0..16 {
            match line.get(i) {
                Some(b) => { let _ = write!(ret, " {:02X}", b); },
                None => ret.push_str("   "),
            }
        }

        ret.push_str(" |");
        for &b in line {
            if (b' '..=b'~').contains(&b) {
                ret.push(char::from(b));
            } else {
                ret.push('.');
            }
        }
        ret.push_str("|\n");
    }
    ret
}


/// Formats bytes as contiguous uppercase hex.
pub fn hex_string(buf: &[u8]) -> String {
    let mut ret = String::with_capacity(2 * buf.len());
    for b in buf {
        let _ = write!(ret, "{:02X}", b);
    }
    ret
}


/// Receives notifications about card traffic.
pub trait ApduLogger: Send {
    fn log_reader_selected(&self, reader: &str, available: &[String]);
    fn log_connect(&self, reader: &str, protocol: &str);
    fn log_atr(&self, atr: &[u8]);
    fn log_disconnect(&self);

    /// Called with the raw bytes of each outgoing command APDU.
    fn log_command(&self, command: &[u8]);

    /// Called with the raw bytes (including the status word) of each incoming response APDU.
    fn log_response(&self, response: &[u8], elapsed: Duration);

    fn log_error(&self, error: &dyn std::error::Error);
}


/// Forwards card traffic to `tracing`.
///
/// Lifecycle events are logged at `info`, headers and status words at `debug` and full hex dumps
/// at `trace`. The data of unprotected VERIFY commands is never logged.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingApduLogger;
impl ApduLogger for TracingApduLogger {
    fn log_reader_selected(&self, reader: &str, available: &[String]) {
        info!(reader, available = available.len(), "selected reader");
    }

    fn log_connect(&self, reader: &str, protocol: &str) {
        info!(reader, protocol, "connected to card");
    }

    fn log_atr(&self, atr: &[u8]) {
        info!(atr = %hex_string(atr), "card ATR");
    }

    fn log_disconnect(&self) {
        info!("disconnected from card");
    }

    fn log_command(&self, command: &[u8]) {
        if command.len() < 4 {
            debug!(length = command.len(), "-> APDU command");
            return;
        }
        let (cla, ins, p1, p2) = (command[0], command[1], command[2], command[3]);
        debug!(
            "-> APDU {} (CLA={:02X} INS={:02X} P1={:02X} P2={:02X}, {} bytes)",
            instruction_name(ins), cla, ins, p1, p2, command.len(),
        );

        let is_secure_messaging = cla & 0b0000_1100 == 0b0000_1100;
        if ins == INS_VERIFY && !is_secure_messaging {
            trace!("{}", hexdump(&command[..4]));
            trace!("(VERIFY data redacted)");
        } else {
            trace!("\n{}", hexdump(command));
        }
    }

    fn log_response(&self, response: &[u8], elapsed: Duration) {
        if response.len() < 2 {
            warn!(length = response.len(), "<- APDU response too short");
            return;
        }
        let word = u16::from_be_bytes([response[response.len() - 2], response[response.len() - 1]]);
        debug!(
            "<- APDU response ({} data bytes, SW={}) in {:?}",
            response.len() - 2, StatusWord::from_word(word), elapsed,
        );
        trace!("\n{}", hexdump(response));
    }

    fn log_error(&self, error: &dyn std::error::Error) {
        warn!("card communication error: {}", error);
    }
}


/// Discards all card traffic notifications.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullApduLogger;
impl ApduLogger for NullApduLogger {
    fn log_reader_selected(&self, _reader: &str, _available: &[String]) {}
    fn log_connect(&self, _reader: &str, _protocol: &str) {}
    fn log_atr(&self, _atr: &[u8]) {}
    fn log_disconnect(&self) {}
    fn log_command(&self, _command: &[u8]) {}
    fn log_response(&self, _response: &[u8], _elapsed: Duration) {}
    fn log_error(&self, _error: &dyn std::error::Error) {}
}
