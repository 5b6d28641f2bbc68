use eid_pace::crypt::boxed_uint_from_be_slice;
use eid_pace::crypt::cipher_mac::{CamAes128, CipherAndMac};
use eid_pace::crypt::elliptic::PrimeWeierstrassCurve;
use eid_pace::der_util::{encode_tlv, oid_to_der_bytes, split_tlv, split_tlvs};
use eid_pace::iso7816::apdu::{Apdu, CommandHeader, Data, Response, ResponseTrailer};
use eid_pace::iso7816::card::{CommunicationError, ErrorKind, SmartCard};
use eid_pace::iso7816::commands::read_card_access;
use eid_pace::pace::{self, Config, Error, Operation, Protocol};
use eid_pace::pace::key_agreement::EphemeralKeyPair;
use eid_pace::pace::mapping::{map_generic, map_integrated, MappedDomain, Mapping};
use eid_pace::pace::mutual_auth::compute_token;
use eid_pace::pace::oids::{PACE_ECDH_GM_AES_CBC_CMAC_128, PACE_ECDH_IM_AES_CBC_CMAC_128};
use eid_pace::pace::password::{Nonce, Password, PasswordSource, SymmetricKey};
use eid_pace::secure_messaging::SecureChannel;
use hex_literal::hex;


/// Offers ECDH-GM-AES-128 and ECDH-IM-AES-128, both on brainpoolP256r1.
const CARD_ACCESS: [u8; 42] = hex!("
    3128
    3012 060A 04007F00 07020204 0202 020102 02010D
    3012 060A 04007F00 07020204 0402 020102 02010D
");
const CAN: &str = "123456";
const CARD_NONCE: [u8; 16] = hex!("3F00C4D3 9D153F2B 2A214A07 8D899B22");
const CARD_MAPPING_PRIVATE_KEY: [u8; 32] = hex!("
    11111111 22222222 33333333 44444444
    55555555 66666666 77777777 88888888
");
const CARD_SESSION_PRIVATE_KEY: [u8; 32] = hex!("
    21436587 A9CBED0F 21436587 A9CBED0F
    21436587 A9CBED0F 21436587 A9CBED0F
");


/// The state the card keeps between the steps of PACE.
struct CardSession {
    protocol: Protocol,
    mapped: Option<MappedDomain>,
    terminal_public_key: Vec<u8>,
    card_public_key: Vec<u8>,
    k_mac: Vec<u8>,
    k_enc: Vec<u8>,
}


/// A card that runs the card side of PACE with freshly chosen terminal values.
///
/// It serves EF.CardAccess both in plain and, once PACE has succeeded, through Secure Messaging.
struct SimulatedCard {
    session: Option<CardSession>,
    channel: Option<SecureChannel<CamAes128>>,
    card_access_selected: bool,
    commands_received: usize,
    set_authentication_template_status: u16,
}
impl SimulatedCard {
    fn new() -> Self {
        Self {
            session: None,
            channel: None,
            card_access_selected: false,
            commands_received: 0,
            set_authentication_template_status: 0x9000,
        }
    }

    fn respond(data: Vec<u8>, sw: u16) -> Response {
        Response::new(data, ResponseTrailer::from_word(sw))
    }

    fn dynamic_authentication_data(tag: Option<u8>, value: &[u8]) -> Vec<u8> {
        let mut inner = Vec::new();
        if let Some(tag) = tag {
            encode_tlv(&mut inner, &[tag], value);
        }
        let mut outer = Vec::new();
        encode_tlv(&mut outer, &[0x7C], &inner);
        outer
    }

    fn curve(session: &CardSession) -> PrimeWeierstrassCurve {
        match &session.mapped {
            Some(mapped) => mapped.curve().clone(),
            None => session.protocol.curve(),
        }
    }

    fn files(&mut self, request: &Apdu) -> Response {
        match request.header.to_bytes() {
            [0x00, 0xA4, 0x02, 0x0C] if request.data.request_data() == Some(&[0x01, 0x1C]) => {
                self.card_access_selected = true;
                Self::respond(Vec::new(), 0x9000)
            },
            [0x00, 0xB0, 0x00, 0x00] if self.card_access_selected => {
                let length = request.data.response_data_length().unwrap_or(0).min(CARD_ACCESS.len());
                Self::respond(CARD_ACCESS[..length].to_vec(), 0x9000)
            },
            _ => Self::respond(Vec::new(), 0x6A82),
        }
    }

    fn set_authentication_template(&mut self, request: &Apdu) -> Response {
        let objects = split_tlvs(request.data.request_data().unwrap_or(&[])).expect("malformed MSE:Set AT");
        let mut protocol = None;
        let mut reference_ok = false;
        for (tag, value) in objects {
            match tag {
                0x80 => {
                    for oid in [PACE_ECDH_GM_AES_CBC_CMAC_128, PACE_ECDH_IM_AES_CBC_CMAC_128] {
                        if oid_to_der_bytes(oid).as_deref() == Some(value) {
                            protocol = Some(Protocol::new(oid, 13).unwrap());
                        }
                    }
                },
                0x83 => reference_ok = value == [PasswordSource::Can.reference()],
                _ => {},
            }
        }
        match protocol {
            Some(protocol) if reference_ok => {
                self.session = Some(CardSession {
                    protocol,
                    mapped: None,
                    terminal_public_key: Vec::new(),
                    card_public_key: Vec::new(),
                    k_mac: Vec::new(),
                    k_enc: Vec::new(),
                });
                Self::respond(Vec::new(), self.set_authentication_template_status)
            },
            _ => Self::respond(Vec::new(), 0x6A80),
        }
    }

    fn general_authenticate(&mut self, request: &Apdu) -> Response {
        let Some(session) = self.session.as_mut() else {
            return Self::respond(Vec::new(), 0x6985);
        };
        let (outer_tag, outer_value, _) = split_tlv(request.data.request_data().unwrap_or(&[])).expect("malformed GA");
        assert_eq!(outer_tag, 0x7C);
        let Some((tag, value, _)) = split_tlv(outer_value) else {
            // encrypted nonce
            let k_pi = CamAes128::derive_key_from_password(CAN.as_bytes()).unwrap();
            let mut encrypted_nonce = CARD_NONCE.to_vec();
            CamAes128::encrypt_padded_data(&mut encrypted_nonce, &k_pi, &[0u8; 16]).unwrap();
            return Self::respond(Self::dynamic_authentication_data(Some(0x80), &encrypted_nonce), 0x9000);
        };

        let nonce = Nonce::new(CARD_NONCE.to_vec());
        let curve = Self::curve(session);
        match tag {
            0x81 if session.protocol.mapping == Mapping::Generic => {
                let card_private_key = boxed_uint_from_be_slice(&CARD_MAPPING_PRIVATE_KEY);
                let card_key_pair = EphemeralKeyPair::from_private_key(&curve, &card_private_key).unwrap();
                let Ok(terminal_mapping_key) = curve.decode_point(value) else {
                    return Self::respond(Vec::new(), 0x6A80);
                };
                session.mapped = Some(map_generic(&curve, &nonce, &card_private_key, &terminal_mapping_key).unwrap());
                Self::respond(Self::dynamic_authentication_data(Some(0x82), &curve.encode_point(card_key_pair.public_key())), 0x9000)
            },
            0x81 => {
                assert_eq!(value.len(), 16);
                session.mapped = Some(map_integrated::<CamAes128>(&curve, &nonce, value).unwrap());
                Self::respond(Self::dynamic_authentication_data(None, &[]), 0x9000)
            },
            0x83 => {
                let card_private_key = boxed_uint_from_be_slice(&CARD_SESSION_PRIVATE_KEY);
                let card_key_pair = EphemeralKeyPair::from_private_key(&curve, &card_private_key).unwrap();
                let card_public_key = curve.encode_point(card_key_pair.public_key()).to_vec();
                let terminal_key = curve.decode_point(value).unwrap();
                let shared_secret = card_key_pair.compute_shared_secret(&curve, &terminal_key).unwrap();
                session.k_enc = CamAes128::derive_encryption_key(&shared_secret).unwrap().to_vec();
                session.k_mac = CamAes128::derive_mac_key(&shared_secret).unwrap().to_vec();
                session.terminal_public_key = value.to_vec();
                session.card_public_key = card_public_key.clone();
                Self::respond(Self::dynamic_authentication_data(Some(0x84), &card_public_key), 0x9000)
            },
            0x85 => {
                let oid = session.protocol.oid.clone();
                let expected = compute_token::<CamAes128>(&session.k_mac, &oid, &session.card_public_key).unwrap();
                if expected.as_bytes() != value {
                    self.session = None;
                    return Self::respond(Vec::new(), 0x6300);
                }
                let token = compute_token::<CamAes128>(&session.k_mac, &oid, &session.terminal_public_key).unwrap();
                self.channel = Some(SecureChannel::new(
                    SymmetricKey::from_slice(&session.k_enc),
                    SymmetricKey::from_slice(&session.k_mac),
                ));
                Self::respond(Self::dynamic_authentication_data(Some(0x86), token.as_bytes()), 0x9000)
            },
            _ => Self::respond(Vec::new(), 0x6A80),
        }
    }
}
impl SmartCard for SimulatedCard {
    fn communicate(&mut self, request: &Apdu) -> Result<Response, CommunicationError> {
        self.commands_received += 1;
        if request.header.is_secure_messaging() {
            let Some(mut channel) = self.channel.take() else {
                return Ok(Self::respond(Vec::new(), 0x6988));
            };
            let plain = channel.unprotect_command(request)?;
            let plain_response = self.files(&plain);
            let response = channel.protect_response(&plain_response)?;
            self.channel = Some(channel);
            return Ok(response);
        }
        match (request.header.ins, request.header.to_bytes()) {
            (0x22, [0x00, 0x22, 0xC1, 0xA4]) => Ok(self.set_authentication_template(request)),
            (0x86, _) => Ok(self.general_authenticate(request)),
            _ => Ok(self.files(request)),
        }
    }
}


fn establish_and_read(config: &Config, password: &Password) -> Result<(Mapping, Vec<u8>), CommunicationError> {
    let mut card = SimulatedCard::new();
    let card_access = read_card_access(&mut card)?;
    assert_eq!(card_access, CARD_ACCESS);

    let established = pace::establish(&mut card, &card_access, password, config)?;
    assert_eq!(established.remaining_tries, None);
    let mut secured = established.card;
    assert!(secured.is_established());
    let protected_card_access = read_card_access(&mut secured)?;
    drop(secured);

    let mapping = card.session.as_ref()
        .map(|s| s.protocol.mapping)
        .expect("card has no session");
    Ok((mapping, protected_card_access))
}


#[test]
fn test_establish_generic_mapping() {
    let config = Config::new(PasswordSource::Can);
    let (mapping, card_access) = establish_and_read(&config, &config.password(CAN))
        .expect("failed to establish PACE");
    assert_eq!(mapping, Mapping::Generic);
    assert_eq!(card_access, CARD_ACCESS);
}


#[test]
fn test_establish_integrated_mapping() {
    let mut config = Config::new(PasswordSource::Can);
    config.preferred_mapping = Mapping::Integrated;
    let (mapping, card_access) = establish_and_read(&config, &config.password(CAN))
        .expect("failed to establish PACE");
    assert_eq!(mapping, Mapping::Integrated);
    assert_eq!(card_access, CARD_ACCESS);
}


#[test]
fn test_establish_forced_protocol() {
    let mut config = Config::new(PasswordSource::Can);
    config.forced_protocol = Some(PACE_ECDH_IM_AES_CBC_CMAC_128.to_owned());
    let (mapping, _) = establish_and_read(&config, &config.password(CAN))
        .expect("failed to establish PACE");
    assert_eq!(mapping, Mapping::Integrated);
}


#[test]
fn test_establish_wrong_password() {
    for preferred_mapping in [Mapping::Generic, Mapping::Integrated] {
        let mut config = Config::new(PasswordSource::Can);
        config.preferred_mapping = preferred_mapping;
        let error = establish_and_read(&config, &config.password("654321"))
            .expect_err("PACE succeeded with the wrong password");

        // the card notices first, since the terminal sends its token first
        assert_eq!(error.kind(), ErrorKind::StatusError);
        assert!(matches!(
            error,
            CommunicationError::Pace(Error::OperationFailed { operation: Operation::MutualAuthentication, .. }),
        ));
    }
}


#[test]
fn test_establish_reports_remaining_tries() {
    let config = Config::new(PasswordSource::Can);
    let mut card = SimulatedCard::new();
    card.set_authentication_template_status = 0x63C2;
    let established = pace::establish(&mut card, &CARD_ACCESS, &config.password(CAN), &config)
        .expect("failed to establish PACE");
    assert_eq!(established.remaining_tries, Some(2));
    assert!(established.card.is_established());
}


#[test]
fn test_establish_unsupported_password_source() {
    let config = Config::new(PasswordSource::Pin);
    let mut card = SimulatedCard::new();
    let error = pace::establish(&mut card, &CARD_ACCESS, &config.password("123456"), &config)
        .expect_err("card accepted a PIN");
    assert_eq!(error.kind(), ErrorKind::StatusError);
    assert_eq!(card.commands_received, 1);
}


#[test]
fn test_secure_messaging_requires_pace() {
    let mut card = SimulatedCard::new();
    let mut channel = SecureChannel::<CamAes128>::new(
        SymmetricKey::from_slice(&[0x11; 16]),
        SymmetricKey::from_slice(&[0x22; 16]),
    );
    let request = Apdu::new(
        CommandHeader::new(0x00, 0xB0, 0x00, 0x00),
        Data::ResponseDataShort { response_data_length: 0x10 },
    );
    let protected = channel.protect_command(&request).unwrap();
    let response = card.communicate(&protected).unwrap();
    let error = channel.unprotect_response(&response).unwrap_err();
    assert_eq!(error.kind(), ErrorKind::StatusError);
    assert!(!channel.is_established());
}
