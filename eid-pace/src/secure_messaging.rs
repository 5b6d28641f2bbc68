//! Secure Messaging: authenticated encryption of APDUs with the session keys established by PACE.
//!
//! Command data is carried in data object `87` (padding indicator followed by the ciphertext), the
//! expected response length in `97`, the response status in `99` and the MAC in `8E`. Every protected
//! or unprotected message advances the send sequence counter, and the MAC covers the counter, so a
//! replayed or reordered message fails verification.


use std::fmt;
use std::marker::PhantomData;

use tracing::{debug, trace, warn};
use zeroize::Zeroizing;

use crate::crypt::cipher_mac::{self, CipherAndMac, AES_BLOCK_SIZE};
use crate::der_util::{encode_tlv, split_tlvs};
use crate::iso7816::apdu::{Apdu, CommandHeader, Data, Response, ResponseTrailer};
use crate::iso7816::card::{CommunicationError, ErrorKind, SmartCard};
use crate::iso7816::status::StatusWord;
use crate::logging::instruction_name;
use crate::pace::password::SymmetricKey;


const TAG_ENCRYPTED_DATA: u8 = 0x87;
const TAG_EXPECTED_LENGTH: u8 = 0x97;
const TAG_STATUS: u8 = 0x99;
const TAG_MAC: u8 = 0x8E;

/// Padding indicator in data object `87`: ISO/IEC 7816-4 padding.
const PADDING_INDICATOR_ISO: u8 = 0x01;


#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Error {
    /// The MAC of a message is missing or did not verify, or the data objects around it are
    /// malformed. The channel is closed afterwards.
    AuthenticationFailed,

    /// The channel has been closed and its keys wiped.
    ChannelClosed,

    /// The send sequence counter cannot be advanced any further.
    CounterExhausted,

    /// The card answered without Secure Messaging, usually because it has aborted it.
    PlainStatus { status: StatusWord },

    MissingStatus,
    UnknownPadding { padding_mode: u8 },
    InvalidPadding,
    InvalidExpectedLength { length: usize },
    DataTooLong { length: usize },
    Cipher(cipher_mac::Error),
}
impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::AuthenticationFailed => ErrorKind::AuthenticationFailed,
            Self::PlainStatus { .. } => ErrorKind::StatusError,
            _ => ErrorKind::ProtocolViolation,
        }
    }
}
impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AuthenticationFailed
                => write!(f, "message authentication code does not match"),
            Self::ChannelClosed
                => write!(f, "secure channel is closed"),
            Self::CounterExhausted
                => write!(f, "send sequence counter is exhausted"),
            Self::PlainStatus { status }
                => write!(f, "card answered without Secure Messaging: {}", status),
            Self::MissingStatus
                => write!(f, "response has no status data object"),
            Self::UnknownPadding { padding_mode }
                => write!(f, "unknown padding mode 0x{:02X}", padding_mode),
            Self::InvalidPadding
                => write!(f, "decrypted data is not padded correctly"),
            Self::InvalidExpectedLength { length }
                => write!(f, "expected length data object has {} bytes", length),
            Self::DataTooLong { length }
                => write!(f, "{} bytes do not fit into a protected APDU", length),
            Self::Cipher(e)
                => write!(f, "cipher error: {}", e),
        }
    }
}
impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Cipher(e) => Some(e),
            _ => None,
        }
    }
}
impl From<cipher_mac::Error> for Error {
    fn from(value: cipher_mac::Error) -> Self { Self::Cipher(value) }
}


/// The send sequence counter (SSC).
///
/// Starts at zero after PACE and is incremented before every protected or unprotected message.
/// It never wraps around.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct SendSequenceCounter(u64);
impl SendSequenceCounter {
    pub const fn new() -> Self { Self(0) }
    pub const fn from_value(value: u64) -> Self { Self(value) }
    pub const fn value(&self) -> u64 { self.0 }

    /// Advances the counter and returns the new value.
    pub fn increment(&mut self) -> Result<u64, Error> {
        self.0 = self.0.checked_add(1)
            .ok_or(Error::CounterExhausted)?;
        Ok(self.0)
    }

    pub const fn to_be_bytes(&self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    /// The counter left-padded with zeroes to a full cipher block.
    pub fn to_block(&self) -> [u8; AES_BLOCK_SIZE] {
        let mut block = [0u8; AES_BLOCK_SIZE];
        block[AES_BLOCK_SIZE-8..].copy_from_slice(&self.to_be_bytes());
        block
    }
}


#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum ChannelStatus {
    Established,
    Closed,
}


/// Appends ISO/IEC 7816-4 padding (`80 00 ...`) up to a multiple of the block size.
fn pad(data: &mut Vec<u8>) {
    data.push(0x80);
    while data.len() % AES_BLOCK_SIZE != 0 {
        data.push(0x00);
    }
}

/// Removes ISO/IEC 7816-4 padding.
fn unpad(data: &mut Vec<u8>) -> Result<(), Error> {
    while data.last() == Some(&0x00) {
        data.pop();
    }
    if data.pop() != Some(0x80) {
        return Err(Error::InvalidPadding);
    }
    Ok(())
}

fn padded_header(header: &CommandHeader) -> Vec<u8> {
    let mut ret = header.to_bytes().to_vec();
    pad(&mut ret);
    ret
}


/// The data objects of a protected message.
#[derive(Default)]
struct ProtectedObjects<'a> {
    encrypted: Option<&'a [u8]>,
    expected_length: Option<&'a [u8]>,
    status: Option<&'a [u8]>,
    mac: Option<&'a [u8]>,

    /// Concatenated encodings of all objects covered by the MAC.
    authenticated: Vec<u8>,
}
impl<'a> ProtectedObjects<'a> {
    fn parse(data: &'a [u8]) -> Option<Self> {
        let mut ret = Self::default();
        for (tag, value) in split_tlvs(data)? {
            match tag {
                TAG_ENCRYPTED_DATA => ret.encrypted = Some(value),
                TAG_EXPECTED_LENGTH => ret.expected_length = Some(value),
                TAG_STATUS => ret.status = Some(value),
                TAG_MAC => {
                    ret.mac = Some(value);
                    continue;
                },
                _ => {},
            }
            // odd tags are included in the MAC
            if tag & 0b1 != 0 {
                encode_tlv(&mut ret.authenticated, &[tag], value);
            }
        }
        Some(ret)
    }
}


/// One direction-agnostic end of a Secure Messaging channel.
///
/// The terminal calls [`protect_command`](Self::protect_command) and
/// [`unprotect_response`](Self::unprotect_response); the card (or a stand-in for it) calls
/// [`unprotect_command`](Self::unprotect_command) and [`protect_response`](Self::protect_response).
/// Both ends must start with the same keys and counter.
pub struct SecureChannel<C: CipherAndMac> {
    k_enc: SymmetricKey,
    k_mac: SymmetricKey,
    send_sequence_counter: SendSequenceCounter,
    status: ChannelStatus,
    cipher_and_mac: PhantomData<C>,
}
impl<C: CipherAndMac> SecureChannel<C> {
    /// Opens a channel with the session keys; the counter starts at zero.
    pub fn new(k_enc: SymmetricKey, k_mac: SymmetricKey) -> Self {
        Self::with_counter(k_enc, k_mac, SendSequenceCounter::new())
    }

    pub fn with_counter(k_enc: SymmetricKey, k_mac: SymmetricKey, send_sequence_counter: SendSequenceCounter) -> Self {
        Self {
            k_enc,
            k_mac,
            send_sequence_counter,
            status: ChannelStatus::Established,
            cipher_and_mac: PhantomData,
        }
    }

    pub fn status(&self) -> ChannelStatus { self.status }
    pub fn send_sequence_counter(&self) -> SendSequenceCounter { self.send_sequence_counter }

    pub fn is_established(&self) -> bool {
        self.status == ChannelStatus::Established
    }

    /// Wipes the session keys. Every further operation fails with [`Error::ChannelClosed`].
    pub fn close(&mut self) {
        if self.status == ChannelStatus::Established {
            debug!(ssc = self.send_sequence_counter.value(), "closing secure channel");
        }
        self.k_enc.zeroize();
        self.k_mac.zeroize();
        self.status = ChannelStatus::Closed;
    }

    fn advance(&mut self) -> Result<(), Error> {
        if !self.is_established() {
            return Err(Error::ChannelClosed);
        }
        if let Err(e) = self.send_sequence_counter.increment() {
            self.close();
            return Err(e);
        }
        Ok(())
    }

    /// The CBC IV for the current counter value: the counter block encrypted under K_enc.
    fn current_iv(&self) -> Result<Zeroizing<Vec<u8>>, Error> {
        let ssc_block = self.send_sequence_counter.to_block();
        Ok(self.k_enc.with_secret(|k_enc| C::encrypt_block(&ssc_block, k_enc))?)
    }

    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, Error> {
        let iv = self.current_iv()?;
        let mut data = Zeroizing::new(plaintext.to_vec());
        pad(&mut data);
        self.k_enc.with_secret(|k_enc| C::encrypt_padded_data(&mut data, k_enc, &iv))?;
        Ok(data.to_vec())
    }

    fn decrypt(&self, encrypted: &[u8]) -> Result<Vec<u8>, Error> {
        let (&padding_mode, ciphertext) = encrypted.split_first()
            .ok_or(Error::InvalidPadding)?;
        if padding_mode != PADDING_INDICATOR_ISO {
            return Err(Error::UnknownPadding { padding_mode });
        }
        let iv = self.current_iv()?;
        let mut data = ciphertext.to_vec();
        self.k_enc.with_secret(|k_enc| C::decrypt_padded_data(&mut data, k_enc, &iv))?;
        unpad(&mut data)?;
        Ok(data)
    }

    /// MAC over the counter block followed by the given (unpadded) message parts.
    fn mac(&self, parts: &[&[u8]]) -> Result<Zeroizing<Vec<u8>>, Error> {
        let mut mac_data = self.send_sequence_counter.to_block().to_vec();
        for part in parts {
            mac_data.extend_from_slice(part);
        }
        pad(&mut mac_data);
        Ok(self.k_mac.with_secret(|k_mac| C::mac_padded_data(&mac_data, k_mac))?)
    }

    /// Closes the channel because a message cannot be authenticated.
    fn reject(&mut self, reason: &'static str) -> Error {
        warn!(ssc = self.send_sequence_counter.value(), reason, "rejecting message; closing secure channel");
        self.close();
        Error::AuthenticationFailed
    }

    /// Verifies the MAC in constant time, closing the channel if it does not match.
    fn verify_mac(&mut self, parts: &[&[u8]], received_mac: &[u8]) -> Result<(), Error> {
        let mut mac_data = self.send_sequence_counter.to_block().to_vec();
        for part in parts {
            mac_data.extend_from_slice(part);
        }
        pad(&mut mac_data);
        let matches = match self.k_mac.with_secret(|k_mac| C::verify_mac_padded_data(&mac_data, k_mac, received_mac)) {
            Ok(m) => m,
            Err(e) => {
                self.close();
                return Err(e.into());
            },
        };
        if !matches {
            return Err(self.reject("MAC mismatch"));
        }
        Ok(())
    }

    /// Parses the data objects of a received message and verifies its MAC.
    fn authenticate<'a>(&mut self, header: Option<&CommandHeader>, body: &'a [u8]) -> Result<ProtectedObjects<'a>, Error> {
        let Some(objects) = ProtectedObjects::parse(body) else {
            return Err(self.reject("malformed data objects"));
        };
        let Some(received_mac) = objects.mac else {
            return Err(self.reject("no MAC data object"));
        };
        match header {
            Some(header) => self.verify_mac(&[&padded_header(header), &objects.authenticated], received_mac)?,
            None => self.verify_mac(&[&objects.authenticated], received_mac)?,
        }
        Ok(objects)
    }

    fn open_response(&self, objects: &ProtectedObjects<'_>) -> Result<Response, Error> {
        let status = match objects.status {
            Some(&[sw1, sw2]) => ResponseTrailer::new(sw1, sw2),
            _ => return Err(Error::MissingStatus),
        };
        let data = match objects.encrypted {
            Some(encrypted) => self.decrypt(encrypted)?,
            None => Vec::new(),
        };
        Ok(Response::new(data, status))
    }

    fn open_command(&self, header: &CommandHeader, objects: &ProtectedObjects<'_>) -> Result<Apdu, Error> {
        let request_data = match objects.encrypted {
            Some(encrypted) => Some(self.decrypt(encrypted)?),
            None => None,
        };
        let response_data_length = match objects.expected_length {
            None => None,
            Some(&[0x00]) => Some(256),
            Some(&[le]) => Some(usize::from(le)),
            Some(&[0x00, 0x00]) => Some(65536),
            Some(&[le_hi, le_lo]) => Some(usize::from(u16::from_be_bytes([le_hi, le_lo]))),
            Some(other) => return Err(Error::InvalidExpectedLength { length: other.len() }),
        };
        let request_length = request_data.as_ref().map(|rd| rd.len()).unwrap_or(0);
        let data = Data::from_parts(request_data, response_data_length)
            .ok_or(Error::DataTooLong { length: request_length })?;
        Ok(Apdu::new(header.without_secure_messaging(), data))
    }

    /// Protects a command APDU to be sent to the card.
    pub fn protect_command(&mut self, request: &Apdu) -> Result<Apdu, Error> {
        self.advance()?;

        let header = request.header.with_secure_messaging();
        let mut body = Vec::new();

        if let Some(request_data) = request.data.request_data() {
            let mut encrypted = vec![PADDING_INDICATOR_ISO];
            encrypted.extend(self.encrypt(request_data)?);
            encode_tlv(&mut body, &[TAG_ENCRYPTED_DATA], &encrypted);
        }

        match &request.data {
            Data::ResponseDataShort { response_data_length }|Data::BothDataShort { response_data_length, .. } => {
                encode_tlv(&mut body, &[TAG_EXPECTED_LENGTH], &[*response_data_length]);
            },
            Data::ResponseDataExtended { response_data_length }|Data::BothDataExtended { response_data_length, .. } => {
                encode_tlv(&mut body, &[TAG_EXPECTED_LENGTH], &response_data_length.to_be_bytes());
            },
            Data::NoData|Data::RequestDataShort { .. }|Data::RequestDataExtended { .. } => {},
        }

        let mac = self.mac(&[&padded_header(&header), &body])?;
        encode_tlv(&mut body, &[TAG_MAC], &mac);

        // the response always carries at least the status and the MAC
        let response_length = if request.data.is_extended() || body.len() > 255 { 65536 } else { 256 };
        let body_length = body.len();
        let data = Data::from_parts(Some(body), Some(response_length))
            .ok_or(Error::DataTooLong { length: body_length })?;
        Ok(Apdu::new(header, data))
    }

    /// Verifies and decrypts a response APDU received from the card.
    ///
    /// Fails closed: a response without a valid MAC is reported as
    /// [`Error::AuthenticationFailed`], nothing is decrypted and the channel is closed. Any later
    /// failure closes the channel as well.
    pub fn unprotect_response(&mut self, response: &Response) -> Result<Response, Error> {
        self.advance()?;

        if response.data.is_empty() && !response.is_success() {
            let status = response.status();
            warn!(%status, "card aborted Secure Messaging");
            self.close();
            return Err(Error::PlainStatus { status });
        }

        let objects = self.authenticate(None, &response.data)?;
        let opened = self.open_response(&objects);
        if opened.is_err() {
            self.close();
        }
        opened
    }

    /// Verifies and decrypts a protected command APDU, as the card does.
    ///
    /// Fails closed in the same way as [`unprotect_response`](Self::unprotect_response).
    pub fn unprotect_command(&mut self, request: &Apdu) -> Result<Apdu, Error> {
        self.advance()?;

        let body = request.data.request_data().unwrap_or(&[]);
        let objects = self.authenticate(Some(&request.header), body)?;
        let opened = self.open_command(&request.header, &objects);
        if opened.is_err() {
            self.close();
        }
        opened
    }

    /// Protects a response APDU, as the card does.
    pub fn protect_response(&mut self, response: &Response) -> Result<Response, Error> {
        self.advance()?;

        let mut body = Vec::new();
        if !response.data.is_empty() {
            let mut encrypted = vec![PADDING_INDICATOR_ISO];
            encrypted.extend(self.encrypt(&response.data)?);
            encode_tlv(&mut body, &[TAG_ENCRYPTED_DATA], &encrypted);
        }
        encode_tlv(&mut body, &[TAG_STATUS], &response.trailer.to_bytes());

        let mac = self.mac(&[&body])?;
        encode_tlv(&mut body, &[TAG_MAC], &mac);
        Ok(Response::new(body, response.trailer))
    }
}
impl<C: CipherAndMac> fmt::Debug for SecureChannel<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureChannel")
            .field("cipher_and_mac", &C::NAME)
            .field("send_sequence_counter", &self.send_sequence_counter)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}
impl<C: CipherAndMac> Drop for SecureChannel<C> {
    fn drop(&mut self) {
        self.k_enc.zeroize();
        self.k_mac.zeroize();
    }
}


/// The terminal's view of a secure channel, independent of the cipher suite.
pub trait SecureMessaging {
    fn protect_command(&mut self, request: &Apdu) -> Result<Apdu, Error>;
    fn unprotect_response(&mut self, response: &Response) -> Result<Response, Error>;
    fn close(&mut self);
    fn is_established(&self) -> bool;
    fn send_sequence_counter(&self) -> SendSequenceCounter;
}
impl<C: CipherAndMac> SecureMessaging for SecureChannel<C> {
    fn protect_command(&mut self, request: &Apdu) -> Result<Apdu, Error> {
        SecureChannel::protect_command(self, request)
    }

    fn unprotect_response(&mut self, response: &Response) -> Result<Response, Error> {
        SecureChannel::unprotect_response(self, response)
    }

    fn close(&mut self) { SecureChannel::close(self) }
    fn is_established(&self) -> bool { SecureChannel::is_established(self) }
    fn send_sequence_counter(&self) -> SendSequenceCounter { SecureChannel::send_sequence_counter(self) }
}


/// A smart card whose traffic passes through a secure channel.
pub struct SecureMessagingCard<SC: SmartCard> {
    card: SC,
    channel: Box<dyn SecureMessaging>,
}
impl<SC: SmartCard> SecureMessagingCard<SC> {
    pub fn new(card: SC, channel: Box<dyn SecureMessaging>) -> Self {
        Self { card, channel }
    }

    pub fn channel(&self) -> &dyn SecureMessaging { self.channel.as_ref() }
    pub fn card_mut(&mut self) -> &mut SC { &mut self.card }

    pub fn is_established(&self) -> bool {
        self.channel.is_established()
    }

    /// Closes the channel and returns the underlying card.
    pub fn into_inner(mut self) -> SC {
        self.channel.close();
        self.card
    }
}
impl<SC: SmartCard> SmartCard for SecureMessagingCard<SC> {
    fn communicate(&mut self, request: &Apdu) -> Result<Response, CommunicationError> {
        trace!(
            instruction = %instruction_name(request.header.ins),
            ssc = self.channel.send_sequence_counter().value(),
            "protecting command",
        );
        let protected_request = self.channel.protect_command(request)?;
        let protected_response = match self.card.communicate(&protected_request) {
            Ok(r) => r,
            Err(e) => {
                // the counters are out of step now
                self.channel.close();
                return Err(e);
            },
        };
        let response = self.channel.unprotect_response(&protected_response)?;
        trace!(status = %response.status(), length = response.data.len(), "unprotected response");
        Ok(response)
    }
}
impl<SC: SmartCard> fmt::Debug for SecureMessagingCard<SC> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureMessagingCard")
            .field("established", &self.channel.is_established())
            .field("send_sequence_counter", &self.channel.send_sequence_counter())
            .finish_non_exhaustive()
    }
}


#[cfg(test)]
mod tests {
    use super::{Error, SecureChannel, SecureMessagingCard, SendSequenceCounter};
    use crate::crypt::cipher_mac::{CamAes128, CamAes256};
    use crate::iso7816::apdu::{Apdu, CommandHeader, Data, Response, ResponseTrailer};
    use crate::iso7816::card::{CommunicationError, ErrorKind, SmartCard};
    use crate::pace::password::SymmetricKey;
    use hex_literal::hex;

    // session keys of ICAO Doc 9303 Part 11 Appendix G.1
    const K_ENC: [u8; 16] = hex!("F5F0E35C 0D7161EE 6724EE51 3A0D9A7F");
    const K_MAC: [u8; 16] = hex!("FE251C78 58B356B2 4514B3BD 5F4297D1");

    fn channel_pair() -> (SecureChannel<CamAes128>, SecureChannel<CamAes128>) {
        (
            SecureChannel::new(SymmetricKey::from_slice(&K_ENC), SymmetricKey::from_slice(&K_MAC)),
            SecureChannel::new(SymmetricKey::from_slice(&K_ENC), SymmetricKey::from_slice(&K_MAC)),
        )
    }

    fn select_ef_card_access() -> Apdu {
        Apdu::new(
            CommandHeader::new(0x00, 0xA4, 0x02, 0x0C),
            Data::RequestDataShort { request_data: vec![0x01, 0x1C] },
        )
    }

    #[test]
    fn test_counter() {
        let mut ssc = SendSequenceCounter::new();
        assert_eq!(ssc.to_be_bytes(), [0u8; 8]);
        for _ in 0..5 {
            ssc.increment().unwrap();
        }
        assert_eq!(ssc.to_be_bytes(), hex!("00000000 00000005"));
        assert_eq!(ssc.to_block(), hex!("00000000 00000000 00000000 00000005"));

        let mut ssc = SendSequenceCounter::from_value(u64::MAX);
        assert_eq!(ssc.increment(), Err(Error::CounterExhausted));
        assert_eq!(ssc.value(), u64::MAX);
    }

    #[test]
    fn test_command_round_trip() {
        let (mut terminal, mut card) = channel_pair();

        let command = select_ef_card_access();
        let protected = terminal.protect_command(&command).unwrap();
        assert_eq!(protected.header, CommandHeader::new(0x0C, 0xA4, 0x02, 0x0C));
        assert_eq!(protected.data.response_data_length(), Some(256));
        let body = protected.data.request_data().unwrap();
        // 87 11 01 <16 bytes> 8E 08 <8 bytes>
        assert_eq!(body.len(), 2 + 17 + 2 + 8);
        assert_eq!(&body[0..3], &hex!("87 11 01"));
        assert_eq!(&body[19..21], &hex!("8E 08"));

        let unprotected = card.unprotect_command(&protected).unwrap();
        assert_eq!(unprotected, command);

        let response = Response::new(Vec::new(), ResponseTrailer::from_word(0x9000));
        let protected_response = card.protect_response(&response).unwrap();
        assert_eq!(&protected_response.data[0..4], &hex!("99 02 9000"));
        assert_eq!(terminal.unprotect_response(&protected_response).unwrap(), response);

        assert_eq!(terminal.send_sequence_counter().value(), 2);
        assert_eq!(card.send_sequence_counter().value(), 2);
    }

    #[test]
    fn test_expected_length_and_data() {
        let (mut terminal, mut card) = channel_pair();

        let command = Apdu::new(
            CommandHeader::new(0x00, 0xB0, 0x00, 0x00),
            Data::ResponseDataShort { response_data_length: 0xDF },
        );
        let protected = terminal.protect_command(&command).unwrap();
        assert_eq!(protected.data.request_data().unwrap()[0..3], hex!("97 01 DF"));
        assert_eq!(card.unprotect_command(&protected).unwrap(), command);

        let contents: Vec<u8> = (0..0xDFu8).collect();
        let response = Response::new(contents.clone(), ResponseTrailer::from_word(0x9000));
        let protected_response = card.protect_response(&response).unwrap();
        assert_ne!(&protected_response.data[3..3+contents.len()], contents.as_slice());
        let unprotected = terminal.unprotect_response(&protected_response).unwrap();
        assert_eq!(unprotected.data, contents);
        assert!(unprotected.is_success());
    }

    #[test]
    fn test_larger_suite_round_trip() {
        let k_enc = SymmetricKey::from_slice(&[0x11; 32]);
        let k_mac = SymmetricKey::from_slice(&[0x22; 32]);
        let mut terminal = SecureChannel::<CamAes256>::new(k_enc.clone(), k_mac.clone());
        let mut card = SecureChannel::<CamAes256>::new(k_enc, k_mac);

        let command = Apdu::new(
            CommandHeader::new(0x00, 0x20, 0x00, 0x01),
            Data::RequestDataShort { request_data: b"123456".to_vec() },
        );
        let protected = terminal.protect_command(&command).unwrap();
        assert_eq!(card.unprotect_command(&protected).unwrap(), command);
    }

    #[test]
    fn test_tampered_response_fails_closed() {
        let (mut terminal, mut card) = channel_pair();
        let protected = terminal.protect_command(&select_ef_card_access()).unwrap();
        card.unprotect_command(&protected).unwrap();

        let response = Response::new(hex!("DEADBEEF").to_vec(), ResponseTrailer::from_word(0x9000));
        let protected_response = card.protect_response(&response).unwrap();

        for bit_index in 0..8*protected_response.data.len() {
            let mut tampered = protected_response.clone();
            tampered.data[bit_index / 8] ^= 1 << (bit_index % 8);

            let mut terminal_copy = SecureChannel::<CamAes128>::with_counter(
                SymmetricKey::from_slice(&K_ENC),
                SymmetricKey::from_slice(&K_MAC),
                terminal.send_sequence_counter(),
            );
            assert_eq!(
                terminal_copy.unprotect_response(&tampered),
                Err(Error::AuthenticationFailed),
                "bit {} flipped", bit_index,
            );
            assert!(!terminal_copy.is_established(), "bit {} flipped but channel still open", bit_index);
        }

        assert_eq!(terminal.unprotect_response(&protected_response).unwrap(), response);
    }

    #[test]
    fn test_response_without_mac_fails_closed() {
        let (mut terminal, mut card) = channel_pair();
        let protected = terminal.protect_command(&select_ef_card_access()).unwrap();
        card.unprotect_command(&protected).unwrap();
        let protected_response = card.protect_response(
            &Response::new(hex!("DEADBEEF").to_vec(), ResponseTrailer::from_word(0x9000)),
        ).unwrap();
        let counter = terminal.send_sequence_counter();
        let fresh_terminal = || SecureChannel::<CamAes128>::with_counter(
            SymmetricKey::from_slice(&K_ENC),
            SymmetricKey::from_slice(&K_MAC),
            counter,
        );

        // 8E 08 <mac> at the end
        let mut stripped = protected_response.clone();
        stripped.data.truncate(stripped.data.len() - 10);
        let mut t = fresh_terminal();
        assert_eq!(t.unprotect_response(&stripped), Err(Error::AuthenticationFailed));
        assert!(!t.is_established());

        let mut retagged = protected_response.clone();
        let mac_tag_index = retagged.data.len() - 10;
        assert_eq!(retagged.data[mac_tag_index], 0x8E);
        retagged.data[mac_tag_index] = 0x8C;
        let mut t = fresh_terminal();
        assert_eq!(t.unprotect_response(&retagged), Err(Error::AuthenticationFailed));
        assert!(!t.is_established());

        // length running past the end
        let mut truncated = protected_response.clone();
        truncated.data.truncate(5);
        let mut t = fresh_terminal();
        assert_eq!(t.unprotect_response(&truncated), Err(Error::AuthenticationFailed));
        assert!(!t.is_established());
    }

    #[test]
    fn test_command_without_mac_fails_closed() {
        let (mut terminal, mut card) = channel_pair();
        let protected = terminal.protect_command(&select_ef_card_access()).unwrap();
        let mut body = protected.data.request_data().unwrap().to_vec();
        body.truncate(body.len() - 10);
        let stripped = Apdu::new(protected.header, Data::from_parts(Some(body), Some(256)).unwrap());

        assert_eq!(card.unprotect_command(&stripped), Err(Error::AuthenticationFailed));
        assert!(!card.is_established());
        assert_eq!(card.unprotect_command(&protected), Err(Error::ChannelClosed));
    }

    #[test]
    fn test_wrong_counter_fails() {
        let (mut terminal, mut card) = channel_pair();
        let first = terminal.protect_command(&select_ef_card_access()).unwrap();
        let second = terminal.protect_command(&select_ef_card_access()).unwrap();

        // replaying out of order
        assert_eq!(card.unprotect_command(&second), Err(Error::AuthenticationFailed));
        assert!(!card.is_established());
        assert_eq!(card.unprotect_command(&first), Err(Error::ChannelClosed));
    }

    #[test]
    fn test_plain_error_status_closes() {
        let (mut terminal, _card) = channel_pair();
        terminal.protect_command(&select_ef_card_access()).unwrap();
        let err = terminal.unprotect_response(&Response::new(Vec::new(), ResponseTrailer::from_word(0x6987))).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StatusError);
        assert!(!terminal.is_established());
    }

    #[test]
    fn test_closed_channel() {
        let (mut terminal, _card) = channel_pair();
        terminal.close();
        assert_eq!(terminal.protect_command(&select_ef_card_access()), Err(Error::ChannelClosed));
    }

    /// A card that answers every command through its own end of the channel.
    struct EchoCard {
        channel: SecureChannel<CamAes128>,
        corrupt: bool,
    }
    impl SmartCard for EchoCard {
        fn communicate(&mut self, request: &Apdu) -> Result<Response, CommunicationError> {
            let plain = self.channel.unprotect_command(request)?;
            let data = plain.data.request_data().unwrap_or(&[]).iter().rev().copied().collect();
            let mut response = self.channel.protect_response(&Response::new(data, ResponseTrailer::from_word(0x9000)))?;
            if self.corrupt {
                let last = response.data.len() - 1;
                response.data[last] ^= 0x01;
            }
            Ok(response)
        }
    }

    #[test]
    fn test_secure_messaging_card() {
        let (terminal, card) = channel_pair();
        let mut sm_card = SecureMessagingCard::new(
            EchoCard { channel: card, corrupt: false },
            Box::new(terminal),
        );

        let command = Apdu::new(
            CommandHeader::new(0x00, 0xCA, 0x00, 0x00),
            Data::BothDataShort { request_data: vec![1, 2, 3], response_data_length: 0 },
        );
        let response = sm_card.communicate(&command).unwrap();
        assert_eq!(response.data, vec![3, 2, 1]);
        assert_eq!(sm_card.channel().send_sequence_counter().value(), 2);

        sm_card.card_mut().corrupt = true;
        let err = sm_card.communicate(&command).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AuthenticationFailed);
        assert!(!sm_card.is_established());
    }
}
