//! Implementation of Password Authenticated Connection Establishment.
//!
//! Specified in ICAO Doc 9303 Part 11 § 4.4 and BSI TR-03110. Only the elliptic-curve variants with
//! standardized domain parameters and AES are supported.


pub mod asn1;
pub mod kdf;
pub mod key_agreement;
pub mod mapping;
pub mod mutual_auth;
pub mod oids;
pub mod password;
pub mod session;


use std::fmt;

use crypto_bigint::BoxedUint;
use rand::RngCore;
use rand::rngs::OsRng;
use rasn::types::{Any, ObjectIdentifier, Oid, SetOf};
use tracing::{debug, info, instrument, warn};
use zeroize::Zeroizing;

use crate::crypt::cipher_mac::{self, CamAes128, CamAes192, CamAes256, CipherAndMac};
use crate::crypt::elliptic::{self, PrimeWeierstrassCurve};
use crate::crypt::elliptic::curves::StandardizedCurve;
use crate::der_util::{self, encode_tlv, split_tlv};
use crate::iso7816::apdu::{Apdu, CommandHeader, Data, CLA_COMMAND_CHAINING};
use crate::iso7816::card::{CommunicationError, ErrorKind, SmartCard};
use crate::iso7816::status::StatusWord;
use crate::pace::asn1::PaceInfo;
use crate::pace::key_agreement::generate_ephemeral_key_pair;
use crate::pace::mapping::Mapping;
use crate::pace::oids::{
    is_pace_oid,
    PACE_ECDH_GM_AES_CBC_CMAC_128, PACE_ECDH_GM_AES_CBC_CMAC_192, PACE_ECDH_GM_AES_CBC_CMAC_256,
    PACE_ECDH_IM_AES_CBC_CMAC_128, PACE_ECDH_IM_AES_CBC_CMAC_192, PACE_ECDH_IM_AES_CBC_CMAC_256,
};
use crate::pace::password::{Password, PasswordSource};
use crate::pace::session::{Session, SessionStatus, TerminalContribution};
use crate::secure_messaging::SecureMessagingCard;


const INS_MANAGE_SECURITY_ENVIRONMENT: u8 = 0x22;
const INS_GENERAL_AUTHENTICATE: u8 = 0x86;

const TAG_DYNAMIC_AUTHENTICATION_DATA: u8 = 0x7C;
const TAG_ENCRYPTED_NONCE: u8 = 0x80;
const TAG_MAPPING_DATA_TERMINAL: u8 = 0x81;
const TAG_MAPPING_DATA_CARD: u8 = 0x82;
const TAG_EPHEMERAL_KEY_TERMINAL: u8 = 0x83;
const TAG_EPHEMERAL_KEY_CARD: u8 = 0x84;
const TAG_TOKEN_TERMINAL: u8 = 0x85;
const TAG_TOKEN_CARD: u8 = 0x86;


#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Operation {
    SetAuthenticationTemplate,
    ObtainNonce,
    ExchangeMappingData,
    ExchangeEphemeralPublicKeys,
    MutualAuthentication,
}
impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SetAuthenticationTemplate => write!(f, "MSE:Set AT"),
            Self::ObtainNonce => write!(f, "GENERAL AUTHENTICATE (encrypted nonce)"),
            Self::ExchangeMappingData => write!(f, "GENERAL AUTHENTICATE (map nonce)"),
            Self::ExchangeEphemeralPublicKeys => write!(f, "GENERAL AUTHENTICATE (key agreement)"),
            Self::MutualAuthentication => write!(f, "GENERAL AUTHENTICATE (mutual authentication)"),
        }
    }
}


/// Formats an OID in dotted notation.
pub(crate) fn dotted_oid(oid: &Oid) -> String {
    oid.iter()
        .map(|arc| arc.to_string())
        .collect::<Vec<String>>()
        .join(".")
}


#[derive(Debug)]
pub enum Error {
    NotSupported,
    MappingNotSupported { protocol: ObjectIdentifier },
    ProtocolNotOffered { protocol: ObjectIdentifier },
    CardAccessDecoding(rasn::error::DecodeError),
    CardAccessEntryDecoding {
        entry_index: usize,
        error: rasn::error::DecodeError,
    },
    CardAccessEntryDecodingPace {
        entry_index: usize,
        error: rasn::error::DecodeError,
    },
    OperationFailed {
        operation: Operation,
        status: StatusWord,
    },
    CustomParameters,
    IncompatibleProtocolParameter {
        protocol: ObjectIdentifier,
        parameter: i32,
    },
    ShortResponse {
        operation: Operation,
    },
    UnexpectedType {
        operation: Operation,
        type_tag: u8,
    },
    TlvEncoding {
        operation: Operation,
    },
    NonceLength { length: usize },
    InvalidProtocolOid { protocol: ObjectIdentifier },
    DiffieHellmanKeysEqual,
    MutualAuthentication,
    SessionState {
        operation: Operation,
        status: SessionStatus,
    },
    Elliptic(elliptic::Error),
    CipherMac(cipher_mac::Error),
}
impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Elliptic(elliptic::Error::InvalidPoint) => ErrorKind::InvalidPoint,
            Self::Elliptic(elliptic::Error::WeakKey) => ErrorKind::WeakKey,
            Self::Elliptic(elliptic::Error::InvalidMapping) => ErrorKind::InvalidMapping,
            Self::Elliptic(elliptic::Error::UnsupportedCurve) => ErrorKind::ProtocolViolation,
            Self::DiffieHellmanKeysEqual => ErrorKind::WeakKey,
            Self::MutualAuthentication => ErrorKind::AuthenticationFailed,
            Self::OperationFailed { .. } => ErrorKind::StatusError,
            _ => ErrorKind::ProtocolViolation,
        }
    }
}
impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        match self {
            Self::NotSupported
                => write!(f, "PACE is not supported"),
            Self::MappingNotSupported { protocol }
                => write!(f, "the mapping of protocol {} is not supported", dotted_oid(protocol)),
            Self::ProtocolNotOffered { protocol }
                => write!(f, "the card does not offer protocol {}", dotted_oid(protocol)),
            Self::CardAccessDecoding(e)
                => write!(f, "failed to decode EF.CardAccess: {}", e),
            Self::CardAccessEntryDecoding { entry_index, error }
                => write!(f, "failed to decode EF.CardAccess entry {}: {}", entry_index, error),
            Self::CardAccessEntryDecodingPace { entry_index, error }
                => write!(f, "failed to decode EF.CardAccess entry {} as PaceInfo: {}", entry_index, error),
            Self::OperationFailed { operation, status }
                => write!(f, "operation {} failed with status {}", operation, status),
            Self::CustomParameters
                => write!(f, "custom domain parameters are not supported"),
            Self::IncompatibleProtocolParameter { protocol, parameter }
                => write!(f, "protocol {} is incompatible with parameter {}", dotted_oid(protocol), parameter),
            Self::ShortResponse { operation }
                => write!(f, "operation {} received a short response", operation),
            Self::UnexpectedType { operation, type_tag }
                => write!(f, "operation {} received response of unexpected type 0x{:02X}", operation, type_tag),
            Self::TlvEncoding { operation }
                => write!(f, "invalid TLV encoding for operation {}", operation),
            Self::NonceLength { length }
                => write!(f, "encrypted nonce has invalid length {}", length),
            Self::InvalidProtocolOid { protocol }
                => write!(f, "protocol OID {} cannot be encoded", dotted_oid(protocol)),
            Self::DiffieHellmanKeysEqual
                => write!(f, "terminal and chip Diffie-Hellman keys are equal"),
            Self::MutualAuthentication
                => write!(f, "mutual authentication failed"),
            Self::SessionState { operation, status }
                => write!(f, "operation {} is not allowed in session state {:?}", operation, status),
            Self::Elliptic(e)
                => write!(f, "elliptic curve error: {}", e),
            Self::CipherMac(e)
                => write!(f, "cipher error: {}", e),
        }
    }
}
impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Elliptic(e) => Some(e),
            Self::CipherMac(e) => Some(e),
            _ => None,
        }
    }
}
impl From<elliptic::Error> for Error {
    fn from(value: elliptic::Error) -> Self { Self::Elliptic(value) }
}
impl From<cipher_mac::Error> for Error {
    fn from(value: cipher_mac::Error) -> Self { Self::CipherMac(value) }
}


/// The symmetric primitives of a PACE protocol.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum CipherSuite {
    Aes128,
    Aes192,
    Aes256,
}
impl CipherSuite {
    pub fn key_size(&self) -> usize {
        match self {
            Self::Aes128 => CamAes128::KEY_SIZE,
            Self::Aes192 => CamAes192::KEY_SIZE,
            Self::Aes256 => CamAes256::KEY_SIZE,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Aes128 => CamAes128::NAME,
            Self::Aes192 => CamAes192::NAME,
            Self::Aes256 => CamAes256::NAME,
        }
    }
}


/// A fully specified PACE protocol: mapping, cipher suite and domain parameters.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Protocol {
    pub oid: ObjectIdentifier,
    pub mapping: Mapping,
    pub cipher_suite: CipherSuite,
    pub parameters: StandardizedCurve,
}
impl Protocol {
    /// Assembles the protocol from its OID and the ID of its standardized domain parameters.
    pub fn new(protocol: &Oid, parameter_id: i32) -> Result<Self, Error> {
        let (mapping, cipher_suite) = classify_protocol(protocol)
            .ok_or_else(|| Error::MappingNotSupported { protocol: protocol.to_owned() })?;
        let parameters = u8::try_from(parameter_id).ok()
            .and_then(StandardizedCurve::from_parameter_id)
            .ok_or_else(|| Error::IncompatibleProtocolParameter { protocol: protocol.to_owned(), parameter: parameter_id })?;
        if mapping == Mapping::Integrated && !parameters.to_curve().supports_integrated_mapping() {
            return Err(Error::IncompatibleProtocolParameter { protocol: protocol.to_owned(), parameter: parameter_id });
        }
        Ok(Self {
            oid: protocol.to_owned(),
            mapping,
            cipher_suite,
            parameters,
        })
    }

    pub fn curve(&self) -> PrimeWeierstrassCurve {
        self.parameters.to_curve()
    }
}
impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ECDH-{}-{} ({:?})", self.mapping, self.cipher_suite.name(), self.parameters)
    }
}


macro_rules! equals_any {
    ($template:expr, $option1:expr $(, $options:expr)* $(,)?) => {
        ($template == $option1 $(|| $template == $options)*)
    };
}


/// Returns the mapping and cipher suite of a supported PACE protocol.
fn classify_protocol(protocol: &Oid) -> Option<(Mapping, CipherSuite)> {
    let mapping = if equals_any!(
        protocol,
        PACE_ECDH_GM_AES_CBC_CMAC_128, PACE_ECDH_GM_AES_CBC_CMAC_192, PACE_ECDH_GM_AES_CBC_CMAC_256,
    ) {
        Mapping::Generic
    } else if equals_any!(
        protocol,
        PACE_ECDH_IM_AES_CBC_CMAC_128, PACE_ECDH_IM_AES_CBC_CMAC_192, PACE_ECDH_IM_AES_CBC_CMAC_256,
    ) {
        Mapping::Integrated
    } else {
        return None;
    };

    let cipher_suite = match protocol.last() {
        Some(2) => CipherSuite::Aes128,
        Some(3) => CipherSuite::Aes192,
        Some(4) => CipherSuite::Aes256,
        _ => return None,
    };
    Some((mapping, cipher_suite))
}


/// Decodes the PACE protocols offered in `EF.CardAccess`.
///
/// Entries of other protocols are skipped. Entries of PACE variants that are not supported are
/// returned as the error side of each item.
pub fn offered_protocols(card_access: &[u8]) -> Result<Vec<Result<Protocol, Error>>, Error> {
    // the structure is a SET OF SecurityInfo; decode it as SET OF Any first
    let security_infos: SetOf<Any> = rasn::der::decode(card_access)
        .map_err(Error::CardAccessDecoding)?;

    let mut protocols = Vec::new();
    for (entry_index, security_info) in security_infos.to_vec().into_iter().enumerate() {
        let security_info_seq: Vec<Any> = rasn::der::decode(security_info.as_bytes())
            .map_err(|error| Error::CardAccessEntryDecoding { entry_index, error })?;
        let Some(first) = security_info_seq.first() else {
            continue;
        };
        let Ok(security_info_oid): Result<ObjectIdentifier, _> = rasn::der::decode(first.as_bytes()) else {
            continue;
        };
        if !is_pace_oid(&security_info_oid) {
            // not relevant
            continue;
        }

        let pace_info: PaceInfo = rasn::der::decode(security_info.as_bytes())
            .map_err(|error| Error::CardAccessEntryDecodingPace { entry_index, error })?;

        // only standardized domain parameters are supported (Doc 9303 Part 11 § 9.5.1)
        let protocol = match pace_info.parameter_id {
            None => Err(Error::CustomParameters),
            Some(parameter_id) => match parameter_id.try_into() {
                Ok(parameter_id) => Protocol::new(&pace_info.protocol, parameter_id),
                Err(_) => Err(Error::CustomParameters),
            },
        };
        if let Err(e) = &protocol {
            debug!(protocol = %dotted_oid(&pace_info.protocol), "skipping PACE entry: {}", e);
        }
        protocols.push(protocol);
    }
    Ok(protocols)
}


/// Chooses the PACE protocol to run from the contents of `EF.CardAccess`.
///
/// If `forced_protocol` is given, the card must offer it. Otherwise, the first supported protocol
/// with the preferred mapping wins, falling back to the first supported protocol.
pub fn select_protocol(card_access: &[u8], preferred_mapping: Mapping, forced_protocol: Option<&Oid>) -> Result<Protocol, Error> {
    let mut supported = Vec::new();
    let mut first_unsupported = None;
    for protocol in offered_protocols(card_access)? {
        match protocol {
            Ok(p) => supported.push(p),
            Err(e) => {
                if first_unsupported.is_none() {
                    first_unsupported = Some(e);
                }
            },
        }
    }

    if let Some(forced) = forced_protocol {
        return supported.into_iter()
            .find(|p| &*p.oid == forced)
            .ok_or_else(|| Error::ProtocolNotOffered { protocol: forced.to_owned() });
    }

    let preferred_index = supported.iter()
        .position(|p| p.mapping == preferred_mapping)
        .unwrap_or(0);
    if preferred_index < supported.len() {
        Ok(supported.swap_remove(preferred_index))
    } else {
        Err(first_unsupported.unwrap_or(Error::NotSupported))
    }
}


/// Settings of a PACE run.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Config {
    /// The kind of password the user will supply.
    pub password_source: PasswordSource,

    /// The mapping to choose if the card offers several protocols.
    pub preferred_mapping: Mapping,

    /// Runs exactly this protocol instead of choosing one.
    pub forced_protocol: Option<ObjectIdentifier>,
}
impl Config {
    pub fn new(password_source: PasswordSource) -> Self {
        Self {
            password_source,
            preferred_mapping: Mapping::Generic,
            forced_protocol: None,
        }
    }

    /// Wraps the password typed by the user.
    pub fn password(&self, value: &str) -> Password {
        Password::new(self.password_source, value.as_bytes())
    }
}
impl Default for Config {
    fn default() -> Self {
        Self::new(PasswordSource::Can)
    }
}


/// Sends a GENERAL AUTHENTICATE command and extracts the card's answer.
///
/// The request carries the data object `request` (if any) wrapped in dynamic authentication data;
/// the response must consist of dynamic authentication data wrapping a data object with the tag
/// `response_tag`, whose value is returned. Without a `response_tag`, the wrapped data must be empty.
fn general_authenticate<SC: SmartCard + ?Sized>(
    card: &mut SC,
    operation: Operation,
    last_in_chain: bool,
    request: Option<(u8, &[u8])>,
    response_tag: Option<u8>,
) -> Result<Zeroizing<Vec<u8>>, CommunicationError> {
    let mut inner_data = Zeroizing::new(Vec::new());
    if let Some((tag, value)) = request {
        encode_tlv(&mut inner_data, &[tag], value);
    }
    let mut request_data = Vec::new();
    encode_tlv(&mut request_data, &[TAG_DYNAMIC_AUTHENTICATION_DATA], &inner_data);

    let cla = if last_in_chain { 0x00 } else { CLA_COMMAND_CHAINING };
    let request = Zeroizing::new(Apdu::new(
        CommandHeader::new(
            cla,
            INS_GENERAL_AUTHENTICATE,
            0x00, // algorithm is known (from "set authentication template")
            0x00, // key index is known (from "set authentication template")
        ),
        Data::BothDataShort {
            request_data,
            response_data_length: 0,
        },
    ));
    let response = Zeroizing::new(card.communicate(&request)?);
    if !response.is_success() {
        return Err(Error::OperationFailed { operation, status: response.status() }.into());
    }

    let (outer_tag, outer_value, outer_rest) = split_tlv(&response.data)
        .ok_or(Error::ShortResponse { operation })?;
    if outer_tag != TAG_DYNAMIC_AUTHENTICATION_DATA {
        return Err(Error::UnexpectedType { operation, type_tag: outer_tag }.into());
    }
    if !outer_rest.is_empty() {
        return Err(Error::TlvEncoding { operation }.into());
    }

    let Some(response_tag) = response_tag else {
        // nothing expected; tolerate an empty data object though
        return match der_util::split_tlvs(outer_value).as_deref() {
            Some([]) => Ok(Zeroizing::new(Vec::new())),
            Some([(_, [])]) => Ok(Zeroizing::new(Vec::new())),
            _ => Err(Error::TlvEncoding { operation }.into()),
        };
    };
    let (inner_tag, inner_value, _) = split_tlv(outer_value)
        .ok_or(Error::ShortResponse { operation })?;
    if inner_tag != response_tag {
        return Err(Error::UnexpectedType { operation, type_tag: inner_tag }.into());
    }
    Ok(Zeroizing::new(inner_value.to_vec()))
}


/// Announces the protocol and the password to the card (MSE:Set AT).
///
/// A warning that the password has few tries left is not treated as failure; the number of
/// remaining tries is returned instead.
#[instrument(skip(card, mechanism), fields(mechanism = %dotted_oid(mechanism)))]
pub fn set_authentication_template<SC: SmartCard + ?Sized>(card: &mut SC, mechanism: &Oid, password_source: PasswordSource) -> Result<Option<u8>, CommunicationError> {
    let operation = Operation::SetAuthenticationTemplate;
    let mechanism_bytes = der_util::oid_to_der_bytes(mechanism)
        .ok_or_else(|| Error::InvalidProtocolOid { protocol: mechanism.to_owned() })?;

    let mut request_data = Vec::new();
    encode_tlv(&mut request_data, &[0x80], &mechanism_bytes); // cryptographic mechanism
    encode_tlv(&mut request_data, &[0x83], &[password_source.reference()]); // password reference

    let request = Apdu::new(
        CommandHeader::new(
            0x00,
            INS_MANAGE_SECURITY_ENVIRONMENT,
            0b1100_0001, // verify/encrypt/extauth, compute/decrypt/intauth, set
            0xA4, // control reference template for authentication
        ),
        Data::RequestDataShort { request_data },
    );
    let response = card.communicate(&request)?;
    let status = response.status();
    if status.is_success() {
        return Ok(None);
    }
    match status.remaining_tries() {
        Some(0) => {},
        Some(tries) => {
            warn!(%password_source, tries, "password has few tries left");
            return Ok(Some(tries));
        },
        None => {},
    }
    if status.is_security_failure() {
        warn!(%password_source, %status, "card refuses the password");
    }
    Err(Error::OperationFailed { operation, status }.into())
}


/// Asks the card for its nonce, encrypted with the password key.
#[instrument(skip_all)]
pub fn obtain_encrypted_nonce<SC: SmartCard + ?Sized>(card: &mut SC) -> Result<Zeroizing<Vec<u8>>, CommunicationError> {
    general_authenticate(card, Operation::ObtainNonce, false, None, Some(TAG_ENCRYPTED_NONCE))
}


/// Sends the terminal's mapping data and returns the card's.
///
/// For Generic Mapping, these are the public keys of the mapping key pairs. For Integrated Mapping,
/// the terminal sends its nonce and the card answers with nothing.
pub(crate) fn exchange_mapping_data<SC: SmartCard + ?Sized>(card: &mut SC, mapping_data: &[u8], mapping: Mapping) -> Result<Zeroizing<Vec<u8>>, CommunicationError> {
    let response_tag = match mapping {
        Mapping::Generic => Some(TAG_MAPPING_DATA_CARD),
        Mapping::Integrated => None,
    };
    general_authenticate(card, Operation::ExchangeMappingData, false, Some((TAG_MAPPING_DATA_TERMINAL, mapping_data)), response_tag)
}


pub(crate) fn exchange_ephemeral_public_keys<SC: SmartCard + ?Sized>(card: &mut SC, public_key: &[u8]) -> Result<Zeroizing<Vec<u8>>, CommunicationError> {
    general_authenticate(card, Operation::ExchangeEphemeralPublicKeys, false, Some((TAG_EPHEMERAL_KEY_TERMINAL, public_key)), Some(TAG_EPHEMERAL_KEY_CARD))
}


/// Sends our token and receives the card's; the last command of the chain.
pub(crate) fn exchange_tokens<SC: SmartCard + ?Sized>(card: &mut SC, outgoing_token: &[u8]) -> Result<Zeroizing<Vec<u8>>, CommunicationError> {
    general_authenticate(card, Operation::MutualAuthentication, true, Some((TAG_TOKEN_TERMINAL, outgoing_token)), Some(TAG_TOKEN_CARD))
}


/// Runs the phases following the nonce request with a specific cipher suite.
fn run_session<C: CipherAndMac + 'static, SC: SmartCard>(
    mut card: SC,
    protocol: &Protocol,
    password: &Password,
    encrypted_nonce: &[u8],
    contribution: TerminalContribution<'_>,
    session_private_key: &BoxedUint,
) -> Result<SecureMessagingCard<SC>, CommunicationError> {
    let mut session = Session::<C>::new(protocol.clone());
    session.decrypt_nonce(password, encrypted_nonce)?;
    session.map_nonce(&mut card, contribution)?;
    session.agree_keys(&mut card, session_private_key)?;
    let channel = session.authenticate(&mut card)?;
    info!(%protocol, "PACE established");
    Ok(SecureMessagingCard::new(card, Box::new(channel)))
}


fn run_session_with_suite<SC: SmartCard>(
    card: SC,
    protocol: &Protocol,
    password: &Password,
    encrypted_nonce: &[u8],
    contribution: TerminalContribution<'_>,
    session_private_key: &BoxedUint,
) -> Result<SecureMessagingCard<SC>, CommunicationError> {
    match protocol.cipher_suite {
        CipherSuite::Aes128 => run_session::<CamAes128, SC>(card, protocol, password, encrypted_nonce, contribution, session_private_key),
        CipherSuite::Aes192 => run_session::<CamAes192, SC>(card, protocol, password, encrypted_nonce, contribution, session_private_key),
        CipherSuite::Aes256 => run_session::<CamAes256, SC>(card, protocol, password, encrypted_nonce, contribution, session_private_key),
    }
}


/// Performs a Generic Mapping key exchange using specific private keys.
///
/// Must be preceded by [`set_authentication_template`] and [`obtain_encrypted_nonce`].
#[instrument(skip_all, fields(protocol = %protocol))]
pub fn perform_gm_kex_with_values<SC: SmartCard>(
    card: SC,
    protocol: &Protocol,
    password: &Password,
    encrypted_nonce: &[u8],
    mapping_private_key: &BoxedUint,
    session_private_key: &BoxedUint,
) -> Result<SecureMessagingCard<SC>, CommunicationError> {
    if protocol.mapping != Mapping::Generic {
        return Err(Error::MappingNotSupported { protocol: protocol.oid.clone() }.into());
    }
    run_session_with_suite(
        card,
        protocol,
        password,
        encrypted_nonce,
        TerminalContribution::Generic { mapping_private_key },
        session_private_key,
    )
}


/// Performs a Generic Mapping key exchange with freshly generated private keys.
pub fn perform_gm_kex<SC: SmartCard>(
    card: SC,
    protocol: &Protocol,
    password: &Password,
    encrypted_nonce: &[u8],
) -> Result<SecureMessagingCard<SC>, CommunicationError> {
    // the mapped generator has the same order, so both keys can be sampled on the original curve
    let curve = protocol.curve();
    let mapping_key_pair = generate_ephemeral_key_pair(&curve, &mut OsRng)?;
    let session_key_pair = generate_ephemeral_key_pair(&curve, &mut OsRng)?;
    perform_gm_kex_with_values(
        card,
        protocol,
        password,
        encrypted_nonce,
        mapping_key_pair.private_key(),
        session_key_pair.private_key(),
    )
}


/// Performs an Integrated Mapping key exchange using a specific terminal nonce and private key.
///
/// Must be preceded by [`set_authentication_template`] and [`obtain_encrypted_nonce`].
#[instrument(skip_all, fields(protocol = %protocol))]
pub fn perform_im_kex_with_values<SC: SmartCard>(
    card: SC,
    protocol: &Protocol,
    password: &Password,
    encrypted_nonce: &[u8],
    terminal_nonce: &[u8],
    session_private_key: &BoxedUint,
) -> Result<SecureMessagingCard<SC>, CommunicationError> {
    if protocol.mapping != Mapping::Integrated {
        return Err(Error::MappingNotSupported { protocol: protocol.oid.clone() }.into());
    }
    run_session_with_suite(
        card,
        protocol,
        password,
        encrypted_nonce,
        TerminalContribution::Integrated { terminal_nonce },
        session_private_key,
    )
}


/// Performs an Integrated Mapping key exchange with a fresh terminal nonce and private key.
pub fn perform_im_kex<SC: SmartCard>(
    card: SC,
    protocol: &Protocol,
    password: &Password,
    encrypted_nonce: &[u8],
) -> Result<SecureMessagingCard<SC>, CommunicationError> {
    // the terminal nonce keys the pseudorandom function
    let mut terminal_nonce = Zeroizing::new(vec![0u8; protocol.cipher_suite.key_size()]);
    OsRng.fill_bytes(terminal_nonce.as_mut_slice());

    let session_key_pair = generate_ephemeral_key_pair(&protocol.curve(), &mut OsRng)?;
    perform_im_kex_with_values(
        card,
        protocol,
        password,
        encrypted_nonce,
        &terminal_nonce,
        session_key_pair.private_key(),
    )
}


/// The outcome of [`establish`].
pub struct Established<SC: SmartCard> {
    /// The card behind the established secure channel.
    pub card: SecureMessagingCard<SC>,

    /// The password tries left, if the card warned that they are running low.
    pub remaining_tries: Option<u8>,
}
impl<SC: SmartCard> fmt::Debug for Established<SC> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Established")
            .field("card", &self.card)
            .field("remaining_tries", &self.remaining_tries)
            .finish()
    }
}


/// Authenticates with the card using PACE.
///
/// `card_access` is the content of `EF.CardAccess`. On success, returns the card wrapped in the
/// established secure channel. Pass `&mut card` to keep ownership of the card.
#[instrument(skip_all, fields(password_source = %password.source()))]
pub fn establish<SC: SmartCard>(
    mut card: SC,
    card_access: &[u8],
    password: &Password,
    config: &Config,
) -> Result<Established<SC>, CommunicationError> {
    let protocol = select_protocol(card_access, config.preferred_mapping, config.forced_protocol.as_deref())?;
    info!(%protocol, "selected PACE protocol");

    let remaining_tries = set_authentication_template(&mut card, &protocol.oid, password.source())?;
    let encrypted_nonce = obtain_encrypted_nonce(&mut card)?;

    let card = match protocol.mapping {
        Mapping::Generic => perform_gm_kex(card, &protocol, password, &encrypted_nonce)?,
        Mapping::Integrated => perform_im_kex(card, &protocol, password, &encrypted_nonce)?,
    };
    Ok(Established { card, remaining_tries })
}


#[cfg(test)]
mod tests {
    use super::{select_protocol, set_authentication_template, CipherSuite, Error, Operation, Protocol};
    use crate::crypt::elliptic::curves::StandardizedCurve;
    use crate::iso7816::apdu::{Apdu, Response, ResponseTrailer};
    use crate::iso7816::card::{CommunicationError, ErrorKind, SmartCard};
    use crate::iso7816::status::StatusWord;
    use crate::pace::mapping::Mapping;
    use crate::pace::oids::{PACE_ECDH_GM_AES_CBC_CMAC_128, PACE_ECDH_IM_AES_CBC_CMAC_256};
    use crate::pace::password::PasswordSource;
    use hex_literal::hex;

    /// A card that answers every command with the same status word and no data.
    struct StatusCard(u16);
    impl SmartCard for StatusCard {
        fn communicate(&mut self, _request: &Apdu) -> Result<Response, CommunicationError> {
            Ok(Response::new(Vec::new(), ResponseTrailer::from_word(self.0)))
        }
    }

    const CARD_ACCESS_G1: [u8; 22] = hex!("3114 3012 060A 04007F00 07020204 0202 020102 02010D");

    // ECDH-GM-AES-128 and ECDH-IM-AES-256 on brainpoolP256r1, plus a Chip Authentication entry
    const CARD_ACCESS_TWO: [u8; 59] = hex!("
        3139
        3012 060A 04007F00 07020204 0202 020102 02010D
        3012 060A 04007F00 07020204 0404 020102 02010D
        300F 060A 04007F00 07020203 0202 020101
    ");

    #[test]
    fn test_select_appendix_g1() {
        let protocol = select_protocol(&CARD_ACCESS_G1, Mapping::Generic, None).unwrap();
        assert_eq!(&*protocol.oid, PACE_ECDH_GM_AES_CBC_CMAC_128);
        assert_eq!(protocol.mapping, Mapping::Generic);
        assert_eq!(protocol.cipher_suite, CipherSuite::Aes128);
        assert_eq!(protocol.parameters, StandardizedCurve::BrainpoolP256r1);

        // preference cannot be honored, fall back to what is there
        let protocol = select_protocol(&CARD_ACCESS_G1, Mapping::Integrated, None).unwrap();
        assert_eq!(protocol.mapping, Mapping::Generic);
    }

    #[test]
    fn test_select_preferred_mapping() {
        let protocol = select_protocol(&CARD_ACCESS_TWO, Mapping::Integrated, None).unwrap();
        assert_eq!(&*protocol.oid, PACE_ECDH_IM_AES_CBC_CMAC_256);
        assert_eq!(protocol.cipher_suite, CipherSuite::Aes256);

        let protocol = select_protocol(&CARD_ACCESS_TWO, Mapping::Generic, None).unwrap();
        assert_eq!(&*protocol.oid, PACE_ECDH_GM_AES_CBC_CMAC_128);
    }

    #[test]
    fn test_select_forced() {
        let protocol = select_protocol(&CARD_ACCESS_TWO, Mapping::Generic, Some(PACE_ECDH_IM_AES_CBC_CMAC_256)).unwrap();
        assert_eq!(protocol.mapping, Mapping::Integrated);

        let err = select_protocol(&CARD_ACCESS_G1, Mapping::Generic, Some(PACE_ECDH_IM_AES_CBC_CMAC_256)).unwrap_err();
        assert!(matches!(err, Error::ProtocolNotOffered { .. }));
    }

    #[test]
    fn test_select_unsupported() {
        // PACE-DH-GM-AES-128 with a MODP group
        let card_access = hex!("3114 3012 060A 04007F00 07020204 0102 020102 020100");
        let err = select_protocol(&card_access, Mapping::Generic, None).unwrap_err();
        assert!(matches!(err, Error::MappingNotSupported { .. }));
        assert_eq!(err.kind(), ErrorKind::ProtocolViolation);

        // no PACE at all
        let card_access = hex!("3111 300F 060A 04007F00 07020203 0202 020101");
        assert!(matches!(select_protocol(&card_access, Mapping::Generic, None), Err(Error::NotSupported)));

        assert!(matches!(select_protocol(&hex!("3003 020101"), Mapping::Generic, None), Err(Error::CardAccessDecoding(_))));
    }

    #[test]
    fn test_integrated_mapping_needs_suitable_prime() {
        // NIST P-224 has p ≡ 1 (mod 4)
        let err = Protocol::new(PACE_ECDH_IM_AES_CBC_CMAC_256, 10).unwrap_err();
        assert!(matches!(err, Error::IncompatibleProtocolParameter { parameter: 10, .. }));

        let protocol = Protocol::new(PACE_ECDH_GM_AES_CBC_CMAC_128, 10).unwrap();
        assert_eq!(protocol.parameters, StandardizedCurve::NistP224);
        assert!(Protocol::new(PACE_ECDH_GM_AES_CBC_CMAC_128, 2).is_err());
    }

    #[test]
    fn test_set_authentication_template_tries() {
        let oid = PACE_ECDH_GM_AES_CBC_CMAC_128;
        assert_eq!(set_authentication_template(&mut StatusCard(0x9000), oid, PasswordSource::Pin).unwrap(), None);
        assert_eq!(set_authentication_template(&mut StatusCard(0x63C2), oid, PasswordSource::Pin).unwrap(), Some(2));

        // no tries left is a failure
        let err = set_authentication_template(&mut StatusCard(0x63C0), oid, PasswordSource::Pin).unwrap_err();
        assert!(matches!(
            err,
            CommunicationError::Pace(Error::OperationFailed { operation: Operation::SetAuthenticationTemplate, .. }),
        ));
        assert_eq!(err.status().and_then(|s| s.remaining_tries()), Some(0));

        let err = set_authentication_template(&mut StatusCard(0x6983), oid, PasswordSource::Pin).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StatusError);
        assert_eq!(err.status(), Some(StatusWord::AuthenticationBlocked));
        assert!(!err.is_retryable());
    }
}
