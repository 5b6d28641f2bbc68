//! Structures related to application protocol data units (APDUs).


use std::fmt;
use std::io::{self, Write};

use zeroize_derive::Zeroize;

use crate::iso7816::status::StatusWord;


/// Bit in CLA signalling that the command is not the last of a chain.
pub const CLA_COMMAND_CHAINING: u8 = 0b000_1_00_00;

/// Bits in CLA signalling Secure Messaging with an authenticated header.
pub const CLA_SECURE_MESSAGING: u8 = 0b000_0_11_00;


#[derive(Debug)]
pub enum WriteError {
    Io(io::Error),
    EmptyData,
    DataTooLong { maximum: usize, obtained: usize },
}
impl fmt::Display for WriteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {}", e),
            Self::EmptyData => write!(f, "data is, but must not be, empty"),
            Self::DataTooLong { maximum, obtained } => write!(f, "too much data: obtained {} bytes, expected maximum {} bytes", obtained, maximum),
        }
    }
}
impl std::error::Error for WriteError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::EmptyData => None,
            Self::DataTooLong { .. } => None,
        }
    }
}
impl From<io::Error> for WriteError {
    fn from(value: io::Error) -> Self { Self::Io(value) }
}


#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum ParseError {
    TooShort,
    InvalidLength,
    TrailingBytes,
}
impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooShort => write!(f, "APDU is too short"),
            Self::InvalidLength => write!(f, "APDU length fields are inconsistent"),
            Self::TrailingBytes => write!(f, "APDU has trailing bytes"),
        }
    }
}
impl std::error::Error for ParseError {
}


#[derive(Clone, Copy, Default, Eq, Hash, Ord, PartialEq, PartialOrd, Zeroize)]
pub struct CommandHeader {
    pub cla: u8,
    pub ins: u8,
    pub p1: u8,
    pub p2: u8,
}
impl CommandHeader {
    pub const fn new(cla: u8, ins: u8, p1: u8, p2: u8) -> Self {
        Self { cla, ins, p1, p2 }
    }

    pub const fn to_bytes(&self) -> [u8; 4] {
        [self.cla, self.ins, self.p1, self.p2]
    }

    pub const fn is_secure_messaging(&self) -> bool {
        self.cla & CLA_SECURE_MESSAGING == CLA_SECURE_MESSAGING
    }

    pub const fn is_chained(&self) -> bool {
        self.cla & CLA_COMMAND_CHAINING != 0
    }

    /// Returns the header with the Secure Messaging bits set in CLA.
    pub const fn with_secure_messaging(&self) -> Self {
        Self { cla: self.cla | CLA_SECURE_MESSAGING, ..*self }
    }

    /// Returns the header with the Secure Messaging bits cleared in CLA.
    pub const fn without_secure_messaging(&self) -> Self {
        Self { cla: self.cla & !CLA_SECURE_MESSAGING, ..*self }
    }

    pub fn write_bytes<W: Write>(&self, writer: &mut W) -> Result<(), WriteError> {
        let bytes = self.to_bytes();
        writer.write_all(&bytes)?;
        Ok(())
    }
}
impl fmt::Debug for CommandHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CommandHeader {} cla: 0x{:02X}, ins: 0x{:02X}, p1: 0x{:02X}, p2: 0x{:02X} {}",
            '{', self.cla, self.ins, self.p1, self.p2, '}',
        )
    }
}

#[derive(Clone, Copy, Default, Eq, Hash, Ord, PartialEq, PartialOrd, Zeroize)]
pub struct ResponseTrailer {
    pub sw1: u8,
    pub sw2: u8,
}
impl ResponseTrailer {
    pub const fn new(sw1: u8, sw2: u8) -> Self {
        Self {
            sw1,
            sw2,
        }
    }

    pub const fn from_word(word: u16) -> Self {
        let bytes = word.to_be_bytes();
        Self::new(bytes[0], bytes[1])
    }

    pub const fn to_bytes(&self) -> [u8; 2] {
        [self.sw1, self.sw2]
    }

    pub const fn to_word(&self) -> u16 {
        u16::from_be_bytes([self.sw1, self.sw2])
    }

    pub const fn status(&self) -> StatusWord {
        StatusWord::from_word(self.to_word())
    }

    pub fn write_bytes<W: Write>(&self, writer: &mut W) -> Result<(), WriteError> {
        let bytes = self.to_bytes();
        writer.write_all(&bytes)?;
        Ok(())
    }
}
impl fmt::Debug for ResponseTrailer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ResponseTrailer {} sw1: 0x{:02X}, sw2: 0x{:02X} {}", '{', self.sw1, self.sw2, '}')
    }
}


/// The body of a command APDU.
///
/// A response data length (Le) of 0 means the maximum: 256 bytes for the short and 65536 bytes for
/// the extended encoding.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Zeroize)]
pub enum Data {
    NoData,
    RequestDataShort {
        request_data: Vec<u8>,
    },
    RequestDataExtended {
        request_data: Vec<u8>,
    },
    ResponseDataShort {
        response_data_length: u8,
    },
    ResponseDataExtended {
        response_data_length: u16,
    },
    BothDataShort {
        request_data: Vec<u8>,
        response_data_length: u8,
    },
    BothDataExtended {
        request_data: Vec<u8>,
        response_data_length: u16,
    },
}
impl Data {
    /// Assembles a body from optional request data and an optional expected response length,
    /// choosing the short encoding whenever possible.
    ///
    /// Returns `None` if the request data or the response length is too long even for the extended
    /// encoding.
    pub fn from_parts(request_data: Option<Vec<u8>>, response_data_length: Option<usize>) -> Option<Self> {
        let request_data = request_data.filter(|rd| !rd.is_empty());
        let request_length = request_data.as_ref().map(|rd| rd.len()).unwrap_or(0);
        if request_length > 65535 || response_data_length.map(|le| le > 65536).unwrap_or(false) {
            return None;
        }
        let extended = request_length > 255 || response_data_length.map(|le| le > 256).unwrap_or(false);

        let le_short = |le: usize| if le == 256 { 0x00 } else { le as u8 };
        let le_extended = |le: usize| if le == 65536 { 0x0000 } else { le as u16 };

        Some(match (request_data, response_data_length, extended) {
            (None, None, _) => Self::NoData,
            (Some(request_data), None, false) => Self::RequestDataShort { request_data },
            (Some(request_data), None, true) => Self::RequestDataExtended { request_data },
            (None, Some(le), false) => Self::ResponseDataShort { response_data_length: le_short(le) },
            (None, Some(le), true) => Self::ResponseDataExtended { response_data_length: le_extended(le) },
            (Some(request_data), Some(le), false) => Self::BothDataShort { request_data, response_data_length: le_short(le) },
            (Some(request_data), Some(le), true) => Self::BothDataExtended { request_data, response_data_length: le_extended(le) },
        })
    }

    /// The number of response bytes expected (Le), if any.
    pub fn response_data_length(&self) -> Option<usize> {
        fn short(le: u8) -> usize { if le == 0 { 256 } else { le.into() } }
        fn extended(le: u16) -> usize { if le == 0 { 65536 } else { le.into() } }

        match self {
            Self::NoData => None,
            Self::RequestDataShort { .. } => None,
            Self::RequestDataExtended { .. } => None,
            Self::ResponseDataShort { response_data_length } => Some(short(*response_data_length)),
            Self::ResponseDataExtended { response_data_length } => Some(extended(*response_data_length)),
            Self::BothDataShort { response_data_length, .. } => Some(short(*response_data_length)),
            Self::BothDataExtended { response_data_length, .. } => Some(extended(*response_data_length)),
        }
    }

    pub fn request_data(&self) -> Option<&[u8]> {
        match self {
            Self::NoData => None,
            Self::RequestDataShort { request_data } => Some(request_data.as_slice()),
            Self::RequestDataExtended { request_data } => Some(request_data.as_slice()),
            Self::ResponseDataShort { .. } => None,
            Self::ResponseDataExtended { .. } => None,
            Self::BothDataShort { request_data, .. } => Some(request_data.as_slice()),
            Self::BothDataExtended { request_data, .. } => Some(request_data.as_slice()),
        }
    }

    pub fn is_extended(&self) -> bool {
        matches!(
            self,
            Self::RequestDataExtended { .. } | Self::ResponseDataExtended { .. } | Self::BothDataExtended { .. }
        )
    }

    pub fn write_bytes<W: Write>(&self, writer: &mut W) -> Result<(), WriteError> {
        fn ensure_not_empty(request_data: &[u8]) -> Result<(), WriteError> {
            if request_data.is_empty() {
                Err(WriteError::EmptyData)
            } else {
                Ok(())
            }
        }
        fn ensure_max_length(request_data: &[u8], max_length: usize) -> Result<(), WriteError> {
            if request_data.len() > max_length {
                Err(WriteError::DataTooLong { maximum: max_length, obtained: request_data.len() })
            } else {
                Ok(())
            }
        }

        match self {
            // "case" refers to the cases in ISO/IEC 7816-3:2006 § 12.1.3
            Data::NoData => {
                // case 1
                Ok(())
            },
            Data::RequestDataShort { request_data } => {
                // case 3S
                ensure_not_empty(request_data)?;
                ensure_max_length(request_data, 255)?;

                // [Lc] [Data]
                writer.write_all(&[request_data.len() as u8])?;
                writer.write_all(request_data)?;
                Ok(())
            },
            Data::RequestDataExtended { request_data } => {
                // case 3E
                ensure_not_empty(request_data)?;
                ensure_max_length(request_data, 65535)?;

                let length_bytes = (request_data.len() as u16).to_be_bytes();

                // [0x00] [LcMSB] [LcLSB] [Data]
                writer.write_all(&[0x00, length_bytes[0], length_bytes[1]])?;
                writer.write_all(request_data)?;
                Ok(())
            },
            Data::ResponseDataShort { response_data_length } => {
                // case 2S
                // [Le]
                writer.write_all(&[*response_data_length])?;
                Ok(())
            },
            Data::ResponseDataExtended { response_data_length } => {
                // case 2E
                // [0x00] [LeMSB] [LeLSB]
                let length_bytes = response_data_length.to_be_bytes();
                writer.write_all(&[0x00, length_bytes[0], length_bytes[1]])?;
                Ok(())
            },
            Data::BothDataShort { request_data, response_data_length } => {
                // case 4S
                ensure_not_empty(request_data)?;
                ensure_max_length(request_data, 255)?;

                // [Lc] [Data] [Le]
                writer.write_all(&[request_data.len() as u8])?;
                writer.write_all(request_data)?;
                writer.write_all(&[*response_data_length])?;
                Ok(())
            },
            Data::BothDataExtended { request_data, response_data_length } => {
                // case 4E
                ensure_not_empty(request_data)?;
                ensure_max_length(request_data, 65535)?;

                let request_length_bytes = (request_data.len() as u16).to_be_bytes();
                let response_length_bytes = response_data_length.to_be_bytes();

                // [0x00] [LcMSB] [LcLSB] [Data] [LeMSB] [LeLSB]
                writer.write_all(&[0x00, request_length_bytes[0], request_length_bytes[1]])?;
                writer.write_all(request_data)?;
                writer.write_all(&response_length_bytes)?;
                Ok(())
            },
        }
    }

    /// Decodes the body of a command APDU (everything after the header).
    pub fn try_from_bytes(body: &[u8]) -> Result<Self, ParseError> {
        match body.len() {
            0 => return Ok(Self::NoData),
            1 => return Ok(Self::ResponseDataShort { response_data_length: body[0] }),
            _ => {},
        }

        if body[0] != 0x00 {
            // short: Lc Data [Le]
            let lc = usize::from(body[0]);
            let rest = &body[1..];
            return if rest.len() == lc {
                Ok(Self::RequestDataShort { request_data: rest.to_vec() })
            } else if rest.len() == lc + 1 {
                Ok(Self::BothDataShort { request_data: rest[..lc].to_vec(), response_data_length: rest[lc] })
            } else {
                Err(ParseError::InvalidLength)
            };
        }

        // extended (a leading zero byte)
        if body.len() == 3 {
            return Ok(Self::ResponseDataExtended { response_data_length: u16::from_be_bytes([body[1], body[2]]) });
        }
        if body.len() < 3 {
            return Err(ParseError::TooShort);
        }
        let lc = usize::from(u16::from_be_bytes([body[1], body[2]]));
        if lc == 0 {
            return Err(ParseError::InvalidLength);
        }
        let rest = &body[3..];
        if rest.len() == lc {
            Ok(Self::RequestDataExtended { request_data: rest.to_vec() })
        } else if rest.len() == lc + 2 {
            Ok(Self::BothDataExtended {
                request_data: rest[..lc].to_vec(),
                response_data_length: u16::from_be_bytes([rest[lc], rest[lc+1]]),
            })
        } else if rest.len() > lc + 2 {
            Err(ParseError::TrailingBytes)
        } else {
            Err(ParseError::InvalidLength)
        }
    }
}

#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Zeroize)]
pub struct Apdu {
    pub header: CommandHeader,
    pub data: Data,
}
impl Apdu {
    pub fn new(header: CommandHeader, data: Data) -> Self {
        Self { header, data }
    }

    pub fn write_bytes<W: Write>(&self, writer: &mut W) -> Result<(), WriteError> {
        self.header.write_bytes(writer)?;
        self.data.write_bytes(writer)?;
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, WriteError> {
        let mut bytes = Vec::new();
        self.write_bytes(&mut bytes)?;
        Ok(bytes)
    }

    pub fn try_from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        if bytes.len() < 4 {
            return Err(ParseError::TooShort);
        }
        let header = CommandHeader::new(bytes[0], bytes[1], bytes[2], bytes[3]);
        let data = Data::try_from_bytes(&bytes[4..])?;
        Ok(Self { header, data })
    }
}

#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Zeroize)]
pub struct Response {
    pub data: Vec<u8>,
    pub trailer: ResponseTrailer,
}
impl Response {
    pub fn new(data: Vec<u8>, trailer: ResponseTrailer) -> Self {
        Self { data, trailer }
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 2 {
            return None;
        }

        let data = bytes[..bytes.len() - 2].to_vec();
        let trailer = ResponseTrailer {
            sw1: bytes[bytes.len() - 2],
            sw2: bytes[bytes.len() - 1],
        };
        Some(Self {
            data,
            trailer,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.data.len() + 2);
        bytes.extend_from_slice(&self.data);
        bytes.extend_from_slice(&self.trailer.to_bytes());
        bytes
    }

    pub fn status(&self) -> StatusWord {
        self.trailer.status()
    }

    pub fn is_success(&self) -> bool {
        self.trailer.to_word() == 0x9000
    }
}


#[cfg(test)]
mod tests {
    use super::{Apdu, CommandHeader, Data, ParseError, Response};
    use hex_literal::hex;

    #[test]
    fn test_encode_cases() {
        let header = CommandHeader::new(0x00, 0xB0, 0x00, 0x00);

        let case1 = Apdu::new(header, Data::NoData);
        assert_eq!(case1.to_bytes().unwrap(), hex!("00 B0 00 00"));

        let case2 = Apdu::new(header, Data::from_parts(None, Some(256)).unwrap());
        assert_eq!(case2.to_bytes().unwrap(), hex!("00 B0 00 00 00"));
        assert_eq!(case2.data.response_data_length(), Some(256));

        let case3 = Apdu::new(header, Data::from_parts(Some(vec![0xAA, 0xBB]), None).unwrap());
        assert_eq!(case3.to_bytes().unwrap(), hex!("00 B0 00 00 02 AA BB"));

        let case4 = Apdu::new(header, Data::from_parts(Some(vec![0xAA]), Some(16)).unwrap());
        assert_eq!(case4.to_bytes().unwrap(), hex!("00 B0 00 00 01 AA 10"));

        let case2e = Apdu::new(header, Data::from_parts(None, Some(0x1234)).unwrap());
        assert_eq!(case2e.to_bytes().unwrap(), hex!("00 B0 00 00 00 12 34"));
        assert!(case2e.data.is_extended());

        let case4e = Apdu::new(header, Data::from_parts(Some(vec![0x55; 300]), Some(65536)).unwrap());
        let bytes = case4e.to_bytes().unwrap();
        assert_eq!(&bytes[..7], &hex!("00 B0 00 00 00 01 2C"));
        assert_eq!(&bytes[bytes.len()-2..], &hex!("00 00"));
        assert_eq!(case4e.data.response_data_length(), Some(65536));
    }

    #[test]
    fn test_empty_request_data_is_rejected() {
        let apdu = Apdu::new(
            CommandHeader::new(0x00, 0x22, 0xC1, 0xA4),
            Data::RequestDataShort { request_data: Vec::new() },
        );
        assert!(apdu.to_bytes().is_err());
    }

    #[test]
    fn test_decode_matches_encode() {
        let apdus = [
            hex!("00 A4 02 0C 02 01 1C").to_vec(),
            hex!("10 86 00 00 02 7C 00 00").to_vec(),
            hex!("00 B0 00 00 00 01 00").to_vec(),
            hex!("0C B0 00 00 00").to_vec(),
        ];
        for bytes in apdus {
            let apdu = Apdu::try_from_bytes(&bytes).unwrap();
            assert_eq!(apdu.to_bytes().unwrap(), bytes);
        }

        let chained = Apdu::try_from_bytes(&hex!("10 86 00 00 02 7C 00 00")).unwrap();
        assert!(chained.header.is_chained());
        assert_eq!(chained.data.request_data(), Some(&hex!("7C 00")[..]));
        assert_eq!(chained.data.response_data_length(), Some(256));
    }

    #[test]
    fn test_decode_errors() {
        assert_eq!(Apdu::try_from_bytes(&hex!("00 A4 02")), Err(ParseError::TooShort));
        assert_eq!(Apdu::try_from_bytes(&hex!("00 A4 02 0C 03 01 1C")), Err(ParseError::InvalidLength));
    }

    #[test]
    fn test_secure_messaging_bits() {
        let header = CommandHeader::new(0x10, 0x86, 0x00, 0x00);
        let protected = header.with_secure_messaging();
        assert_eq!(protected.cla, 0x1C);
        assert!(protected.is_secure_messaging());
        assert_eq!(protected.without_secure_messaging(), header);
    }

    #[test]
    fn test_response() {
        let response = Response::from_slice(&hex!("01 02 90 00")).unwrap();
        assert_eq!(response.data, vec![0x01, 0x02]);
        assert!(response.is_success());
        assert_eq!(response.to_bytes(), hex!("01 02 90 00"));
        assert!(Response::from_slice(&[0x90]).is_none());
    }
}
