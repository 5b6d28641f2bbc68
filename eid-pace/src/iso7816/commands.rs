//! Basic interindustry commands: SELECT, READ BINARY and VERIFY.


use tracing::{debug, instrument};
use zeroize::Zeroizing;

use crate::iso7816::apdu::{Apdu, CommandHeader, Data};
use crate::iso7816::card::{check_status, CommunicationError, SmartCard};
use crate::iso7816::status::StatusWord;


/// File identifier of EF.CardAccess.
pub const EF_CARD_ACCESS: u16 = 0x011C;

/// Bytes requested per READ BINARY; leaves room for Secure Messaging overhead in a short response.
pub const READ_CHUNK_LENGTH: usize = 0xDF;

/// Largest offset expressible in P1-P2 of READ BINARY.
const MAX_OFFSET: usize = 0x7FFF;

/// Longest PIN accepted by VERIFY.
pub const MAX_PIN_LENGTH: usize = 8;

const INS_SELECT: u8 = 0xA4;
const INS_READ_BINARY: u8 = 0xB0;
const INS_VERIFY: u8 = 0x20;


/// Selects an elementary file by its identifier, below the current DF.
pub fn select_file<SC: SmartCard + ?Sized>(card: &mut SC, file_id: u16) -> Result<(), CommunicationError> {
    let request = Apdu::new(
        CommandHeader::new(
            0x00,
            INS_SELECT,
            0b0000_0010, // select EF under current DF
            0b0000_1100, // no response data
        ),
        Data::RequestDataShort { request_data: file_id.to_be_bytes().to_vec() },
    );
    let response = card.communicate(&request)?;
    check_status("SELECT", &response)
}


/// Selects an application by its identifier and returns the file control information.
pub fn select_application<SC: SmartCard + ?Sized>(card: &mut SC, aid: &[u8]) -> Result<Vec<u8>, CommunicationError> {
    let request = Apdu::new(
        CommandHeader::new(
            0x00,
            INS_SELECT,
            0b0000_0100, // select by DF name
            0b0000_0000, // first or only occurrence, return FCI
        ),
        Data::BothDataShort { request_data: aid.to_vec(), response_data_length: 0 },
    );
    let response = card.communicate(&request)?;
    check_status("SELECT", &response)?;
    Ok(response.data)
}


/// Reads up to `length` bytes of the currently selected file, starting at `offset`.
///
/// Returns the data and whether the end of the file has been reached.
pub fn read_binary<SC: SmartCard + ?Sized>(card: &mut SC, offset: usize, length: usize) -> Result<(Vec<u8>, bool), CommunicationError> {
    if offset > MAX_OFFSET {
        return Err(CommunicationError::FileTooLarge { maximum: MAX_OFFSET + 1 });
    }
    let [p1, p2] = u16::try_from(offset)
        .map_err(|_| CommunicationError::FileTooLarge { maximum: MAX_OFFSET + 1 })?
        .to_be_bytes();
    let data = Data::from_parts(None, Some(length))
        .ok_or(CommunicationError::FileTooLarge { maximum: MAX_OFFSET + 1 })?;
    let request = Apdu::new(CommandHeader::new(0x00, INS_READ_BINARY, p1, p2), data);

    let response = card.communicate(&request)?;
    match response.status() {
        StatusWord::Success => {
            let end = response.data.len() < length;
            Ok((response.data, end))
        },
        StatusWord::EndOfFile => Ok((response.data, true)),
        // the file ended exactly at the previous chunk
        StatusWord::WrongLength|StatusWord::IncorrectParameters|StatusWord::Other { word: 0x6B00 } if offset > 0
            => Ok((Vec::new(), true)),
        status => Err(CommunicationError::Status { operation: "READ BINARY", status }),
    }
}


/// Selects a transparent elementary file and reads it completely.
#[instrument(skip(card))]
pub fn read_file<SC: SmartCard + ?Sized>(card: &mut SC, file_id: u16) -> Result<Vec<u8>, CommunicationError> {
    select_file(card, file_id)?;

    let mut contents = Vec::new();
    loop {
        let (chunk, end) = read_binary(card, contents.len(), READ_CHUNK_LENGTH)?;
        let chunk_empty = chunk.is_empty();
        contents.extend(chunk);
        if end || chunk_empty {
            break;
        }
    }
    debug!(length = contents.len(), "read file {:04X}", file_id);
    Ok(contents)
}


/// Reads EF.CardAccess, which lists the supported PACE protocols.
pub fn read_card_access<SC: SmartCard + ?Sized>(card: &mut SC) -> Result<Vec<u8>, CommunicationError> {
    read_file(card, EF_CARD_ACCESS)
}


/// Verifies a PIN with VERIFY.
///
/// PINs longer than [`MAX_PIN_LENGTH`] are truncated. On failure, the number of remaining tries can
/// be obtained from [`CommunicationError::status`].
pub fn verify_pin<SC: SmartCard + ?Sized>(card: &mut SC, pin: &[u8]) -> Result<(), CommunicationError> {
    let pin = &pin[..pin.len().min(MAX_PIN_LENGTH)];
    let request = Zeroizing::new(Apdu::new(
        CommandHeader::new(
            0x00,
            INS_VERIFY,
            0x00,
            0x01, // reference data: PIN
        ),
        Data::RequestDataShort { request_data: pin.to_vec() },
    ));
    let response = card.communicate(&request)?;
    check_status("VERIFY", &response)
}


#[cfg(test)]
mod tests {
    use super::{read_file, select_application, verify_pin, READ_CHUNK_LENGTH};
    use crate::iso7816::apdu::{Apdu, Response, ResponseTrailer};
    use crate::iso7816::card::{CommunicationError, ErrorKind, SmartCard};
    use crate::iso7816::status::StatusWord;

    /// A card holding a single transparent file.
    struct FileCard {
        file_id: u16,
        contents: Vec<u8>,
        selected: bool,
        requests: Vec<Apdu>,
        pin: Vec<u8>,
    }
    impl FileCard {
        fn new(file_id: u16, contents: Vec<u8>) -> Self {
            Self { file_id, contents, selected: false, requests: Vec::new(), pin: b"123456".to_vec() }
        }

        fn respond(data: Vec<u8>, word: u16) -> Response {
            Response::new(data, ResponseTrailer::from_word(word))
        }
    }
    impl SmartCard for FileCard {
        fn communicate(&mut self, request: &Apdu) -> Result<Response, CommunicationError> {
            self.requests.push(request.clone());
            let header = request.header;
            match header.ins {
                0xA4 if header.p1 == 0x02 => {
                    let fid = request.data.request_data().unwrap();
                    if fid == self.file_id.to_be_bytes() {
                        self.selected = true;
                        Ok(Self::respond(Vec::new(), 0x9000))
                    } else {
                        Ok(Self::respond(Vec::new(), 0x6A82))
                    }
                },
                0xA4 => Ok(Self::respond(vec![0x6F, 0x00], 0x9000)),
                0xB0 => {
                    assert!(self.selected);
                    let offset = usize::from(u16::from_be_bytes([header.p1, header.p2]));
                    if offset >= self.contents.len() {
                        return Ok(Self::respond(Vec::new(), 0x6B00));
                    }
                    let le = request.data.response_data_length().unwrap();
                    let end = (offset + le).min(self.contents.len());
                    let word = if offset + le > self.contents.len() { 0x6282 } else { 0x9000 };
                    Ok(Self::respond(self.contents[offset..end].to_vec(), word))
                },
                0x20 => {
                    if request.data.request_data() == Some(self.pin.as_slice()) {
                        Ok(Self::respond(Vec::new(), 0x9000))
                    } else {
                        Ok(Self::respond(Vec::new(), 0x63C2))
                    }
                },
                _ => Ok(Self::respond(Vec::new(), 0x6D00)),
            }
        }
    }

    #[test]
    fn test_read_file_in_chunks() {
        let contents: Vec<u8> = (0..500u32).map(|i| (i % 251) as u8).collect();
        let mut card = FileCard::new(0x011C, contents.clone());
        let read = read_file(&mut card, 0x011C).unwrap();
        assert_eq!(read, contents);

        // SELECT and three READ BINARYs
        assert_eq!(card.requests.len(), 4);
        assert_eq!(card.requests[2].header.p2, READ_CHUNK_LENGTH as u8);
    }

    #[test]
    fn test_read_file_chunk_boundary() {
        let contents = vec![0x5A; 2 * READ_CHUNK_LENGTH];
        let mut card = FileCard::new(0x0101, contents.clone());
        assert_eq!(read_file(&mut card, 0x0101).unwrap(), contents);
    }

    #[test]
    fn test_missing_file() {
        let mut card = FileCard::new(0x011C, vec![1, 2, 3]);
        let err = read_file(&mut card, 0x011D).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StatusError);
        assert_eq!(err.status(), Some(StatusWord::FileNotFound));
    }

    #[test]
    fn test_select_application() {
        let mut card = FileCard::new(0x011C, Vec::new());
        let fci = select_application(&mut card, &[0xE8, 0x28, 0xBD, 0x08, 0x0F]).unwrap();
        assert_eq!(fci, vec![0x6F, 0x00]);
        assert_eq!(card.requests[0].header.p1, 0x04);
    }

    #[test]
    fn test_verify_pin() {
        let mut card = FileCard::new(0x011C, Vec::new());
        verify_pin(&mut card, b"123456").unwrap();

        let err = verify_pin(&mut card, b"654321").unwrap_err();
        assert_eq!(err.status().and_then(|s| s.remaining_tries()), Some(2));

        // truncated to eight digits
        card.pin = b"12345678".to_vec();
        verify_pin(&mut card, b"1234567890").unwrap();
    }
}
