//! The state of a single PACE run.
//!
//! The phases must be run in order: decrypt the nonce, map it, agree on keys and authenticate.
//! Any failure closes the session, wiping its secrets; a closed session cannot be resumed.


use std::marker::PhantomData;

use crypto_bigint::BoxedUint;
use subtle::ConstantTimeEq;
use tracing::{debug, instrument, trace, warn};
use zeroize::Zeroizing;

use crate::crypt::cipher_mac::CipherAndMac;
use crate::crypt::elliptic::PrimeWeierstrassCurve;
use crate::iso7816::card::{CommunicationError, SmartCard};
use crate::logging::hex_string;
use crate::pace::{exchange_ephemeral_public_keys, exchange_mapping_data, exchange_tokens, Error, Operation, Protocol};
use crate::pace::key_agreement::EphemeralKeyPair;
use crate::pace::mapping::{self, MappedDomain, Mapping};
use crate::pace::mutual_auth::{compute_token, AuthenticationContext, AuthenticationTag};
use crate::pace::password::{Nonce, Password, SymmetricKey};
use crate::secure_messaging::SecureChannel;


/// The externally visible state of a session.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum SessionStatus {
    Unestablished,
    Authenticating,
    Established,
    Closed,
}


#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Phase {
    Initial,
    NonceDecrypted,
    Mapped,
    KeysAgreed,
    Authenticated,
    Closed,
}
impl Phase {
    fn status(&self) -> SessionStatus {
        match self {
            Self::Initial => SessionStatus::Unestablished,
            Self::NonceDecrypted|Self::Mapped|Self::KeysAgreed => SessionStatus::Authenticating,
            Self::Authenticated => SessionStatus::Established,
            Self::Closed => SessionStatus::Closed,
        }
    }
}


/// What the terminal contributes to the nonce mapping.
pub enum TerminalContribution<'a> {
    /// The private key of the mapping key pair.
    Generic { mapping_private_key: &'a BoxedUint },

    /// The terminal's nonce, which is sent to the card.
    Integrated { terminal_nonce: &'a [u8] },
}
impl<'a> TerminalContribution<'a> {
    pub fn mapping(&self) -> Mapping {
        match self {
            Self::Generic { .. } => Mapping::Generic,
            Self::Integrated { .. } => Mapping::Integrated,
        }
    }
}


/// A PACE session from the terminal's point of view.
pub struct Session<C: CipherAndMac> {
    protocol: Protocol,
    curve: PrimeWeierstrassCurve,
    phase: Phase,
    nonce: Option<Nonce>,
    mapped_domain: Option<MappedDomain>,
    k_enc: Option<SymmetricKey>,
    k_mac: Option<SymmetricKey>,
    outgoing_token: Option<AuthenticationTag>,
    authentication: AuthenticationContext,
    cipher_and_mac: PhantomData<C>,
}
impl<C: CipherAndMac> Session<C> {
    pub fn new(protocol: Protocol) -> Self {
        let curve = protocol.curve();
        Self {
            protocol,
            curve,
            phase: Phase::Initial,
            nonce: None,
            mapped_domain: None,
            k_enc: None,
            k_mac: None,
            outgoing_token: None,
            authentication: AuthenticationContext::new(),
            cipher_and_mac: PhantomData,
        }
    }

    pub fn protocol(&self) -> &Protocol { &self.protocol }
    pub fn status(&self) -> SessionStatus { self.phase.status() }

    /// The domain with the mapped generator, once the nonce has been mapped.
    pub fn mapped_domain(&self) -> Option<&MappedDomain> { self.mapped_domain.as_ref() }

    /// Wipes all secrets and refuses further operations.
    pub fn close(&mut self) {
        if let Some(mut nonce) = self.nonce.take() {
            nonce.zeroize();
        }
        if let Some(mut k_enc) = self.k_enc.take() {
            k_enc.zeroize();
        }
        if let Some(mut k_mac) = self.k_mac.take() {
            k_mac.zeroize();
        }
        self.mapped_domain = None;
        self.outgoing_token = None;
        self.authentication = AuthenticationContext::new();
        self.phase = Phase::Closed;
    }

    fn expect_phase(&self, expected: Phase, operation: Operation) -> Result<(), Error> {
        if self.phase == expected {
            Ok(())
        } else {
            Err(Error::SessionState { operation, status: self.phase.status() })
        }
    }

    /// Closes the session if the result of a phase is an error.
    fn guard<T, E: Into<CommunicationError>>(&mut self, result: Result<T, E>) -> Result<T, CommunicationError> {
        match result {
            Ok(value) => Ok(value),
            Err(e) => {
                let e = e.into();
                if self.phase != Phase::Closed {
                    warn!(error = %e, "aborting PACE session");
                    self.close();
                }
                Err(e)
            },
        }
    }

    /// Phase 1: derives the password key and decrypts the card's nonce with it.
    pub fn decrypt_nonce(&mut self, password: &Password, encrypted_nonce: &[u8]) -> Result<(), CommunicationError> {
        let result = self.decrypt_nonce_inner(password, encrypted_nonce);
        self.guard(result)
    }

    fn decrypt_nonce_inner(&mut self, password: &Password, encrypted_nonce: &[u8]) -> Result<(), Error> {
        self.expect_phase(Phase::Initial, Operation::ObtainNonce)?;
        if encrypted_nonce.is_empty() || encrypted_nonce.len() % C::BLOCK_SIZE != 0 {
            return Err(Error::NonceLength { length: encrypted_nonce.len() });
        }

        let k_pi = SymmetricKey::from(C::derive_key_from_password(&password.key_seed())?);
        let zero_iv = vec![0u8; C::BLOCK_SIZE];
        let mut nonce_bytes = Zeroizing::new(encrypted_nonce.to_vec());
        k_pi.with_secret(|k_pi| C::decrypt_padded_data(&mut nonce_bytes, k_pi, &zero_iv))?;

        self.nonce = Some(Nonce::new(nonce_bytes.to_vec()));
        self.phase = Phase::NonceDecrypted;
        debug!("decrypted nonce");
        Ok(())
    }

    /// Phase 2: maps the nonce onto a new generator, exchanging mapping data with the card.
    #[instrument(skip_all, fields(mapping = %contribution.mapping()))]
    pub fn map_nonce<SC: SmartCard + ?Sized>(&mut self, card: &mut SC, contribution: TerminalContribution<'_>) -> Result<(), CommunicationError> {
        let result = self.map_nonce_inner(card, contribution);
        self.guard(result)
    }

    fn map_nonce_inner<SC: SmartCard + ?Sized>(&mut self, card: &mut SC, contribution: TerminalContribution<'_>) -> Result<(), CommunicationError> {
        self.expect_phase(Phase::NonceDecrypted, Operation::ExchangeMappingData)?;
        if contribution.mapping() != self.protocol.mapping {
            return Err(Error::MappingNotSupported { protocol: self.protocol.oid.clone() }.into());
        }
        let nonce = self.nonce.take()
            .ok_or(Error::SessionState { operation: Operation::ExchangeMappingData, status: self.phase.status() })?;

        let domain = match contribution {
            TerminalContribution::Generic { mapping_private_key } => {
                let key_pair = EphemeralKeyPair::from_private_key(&self.curve, mapping_private_key)?;
                let terminal_public_key = self.curve.encode_point(key_pair.public_key());
                let card_public_key_bytes = exchange_mapping_data(card, &terminal_public_key, Mapping::Generic)?;
                trace!(key = %hex_string(&card_public_key_bytes), "card mapping public key");
                let card_public_key = self.curve.decode_point(&card_public_key_bytes)?;
                mapping::map_generic(&self.curve, &nonce, key_pair.private_key(), &card_public_key)?
            },
            TerminalContribution::Integrated { terminal_nonce } => {
                exchange_mapping_data(card, terminal_nonce, Mapping::Integrated)?;
                mapping::map_integrated::<C>(&self.curve, &nonce, terminal_nonce)?
            },
        };

        self.mapped_domain = Some(domain);
        self.phase = Phase::Mapped;
        debug!("mapped nonce");
        Ok(())
    }

    /// Phase 3: agrees on the session keys by ephemeral Diffie-Hellman over the mapped domain.
    ///
    /// Also computes both authentication tokens.
    #[instrument(skip_all)]
    pub fn agree_keys<SC: SmartCard + ?Sized>(&mut self, card: &mut SC, session_private_key: &BoxedUint) -> Result<(), CommunicationError> {
        let result = self.agree_keys_inner(card, session_private_key);
        self.guard(result)
    }

    fn agree_keys_inner<SC: SmartCard + ?Sized>(&mut self, card: &mut SC, session_private_key: &BoxedUint) -> Result<(), CommunicationError> {
        self.expect_phase(Phase::Mapped, Operation::ExchangeEphemeralPublicKeys)?;
        let curve = self.mapped_domain.as_ref()
            .ok_or(Error::SessionState { operation: Operation::ExchangeEphemeralPublicKeys, status: self.phase.status() })?
            .curve()
            .clone();

        let key_pair = EphemeralKeyPair::from_private_key(&curve, session_private_key)?;
        let terminal_public_key = curve.encode_point(key_pair.public_key());
        let card_public_key_bytes = exchange_ephemeral_public_keys(card, &terminal_public_key)?;
        trace!(key = %hex_string(&card_public_key_bytes), "card ephemeral public key");
        if bool::from(terminal_public_key.as_slice().ct_eq(card_public_key_bytes.as_slice())) {
            return Err(Error::DiffieHellmanKeysEqual.into());
        }
        let card_public_key = curve.decode_point(&card_public_key_bytes)?;

        let shared_secret = key_pair.compute_shared_secret(&curve, &card_public_key)?;
        let k_enc = C::derive_encryption_key(&shared_secret).map_err(Error::from)?;
        let k_mac = C::derive_mac_key(&shared_secret).map_err(Error::from)?;
        drop(shared_secret);

        // each side authenticates the other side's key
        let outgoing_token = compute_token::<C>(&k_mac, &self.protocol.oid, &card_public_key_bytes)?;
        let expected_token = compute_token::<C>(&k_mac, &self.protocol.oid, &terminal_public_key)?;
        self.authentication.expect(expected_token);
        self.outgoing_token = Some(outgoing_token);

        self.k_enc = Some(SymmetricKey::from(k_enc));
        self.k_mac = Some(SymmetricKey::from(k_mac));
        self.phase = Phase::KeysAgreed;
        debug!("agreed on session keys");
        Ok(())
    }

    /// Phase 4: exchanges the tokens and, if the card's token matches, opens the secure channel.
    ///
    /// The session keys move into the channel; the session only remembers that it is established.
    #[instrument(skip_all)]
    pub fn authenticate<SC: SmartCard + ?Sized>(&mut self, card: &mut SC) -> Result<SecureChannel<C>, CommunicationError> {
        let result = self.authenticate_inner(card);
        self.guard(result)
    }

    fn authenticate_inner<SC: SmartCard + ?Sized>(&mut self, card: &mut SC) -> Result<SecureChannel<C>, CommunicationError> {
        self.expect_phase(Phase::KeysAgreed, Operation::MutualAuthentication)?;
        let state_error = Error::SessionState { operation: Operation::MutualAuthentication, status: self.phase.status() };
        let outgoing_token = self.outgoing_token.take()
            .ok_or(state_error)?;

        let card_token = exchange_tokens(card, outgoing_token.as_bytes())?;
        self.authentication.receive(AuthenticationTag::from_slice(&card_token));
        if !self.authentication.is_authenticated() {
            return Err(Error::MutualAuthentication.into());
        }

        let (Some(k_enc), Some(k_mac)) = (self.k_enc.take(), self.k_mac.take()) else {
            return Err(Error::SessionState { operation: Operation::MutualAuthentication, status: self.phase.status() }.into());
        };
        self.mapped_domain = None;
        self.phase = Phase::Authenticated;
        debug!("mutual authentication succeeded");
        Ok(SecureChannel::new(k_enc, k_mac))
    }
}
impl<C: CipherAndMac> Drop for Session<C> {
    fn drop(&mut self) {
        if self.phase != Phase::Authenticated {
            self.close();
        }
    }
}


#[cfg(test)]
mod tests {
    use super::{Session, SessionStatus, TerminalContribution};
    use crate::crypt::boxed_uint_from_be_slice;
    use crate::crypt::cipher_mac::CamAes128;
    use crate::iso7816::apdu::{Apdu, Response, ResponseTrailer};
    use crate::iso7816::card::{CommunicationError, ErrorKind, SmartCard};
    use crate::iso7816::status::StatusWord;
    use crate::pace::{Error, Protocol};
    use crate::pace::oids::PACE_ECDH_GM_AES_CBC_CMAC_128;
    use crate::pace::password::Password;
    use hex_literal::hex;

    const ENCRYPTED_NONCE: [u8; 16] = hex!("95A3A016 522EE98D 01E76CB6 B98B42C3");

    /// A card that answers every command with a fixed response.
    struct FixedCard(Vec<u8>, u16);
    impl SmartCard for FixedCard {
        fn communicate(&mut self, _request: &Apdu) -> Result<Response, CommunicationError> {
            Ok(Response::new(self.0.clone(), ResponseTrailer::from_word(self.1)))
        }
    }

    fn mapping_private_key() -> crypto_bigint::BoxedUint {
        boxed_uint_from_be_slice(&hex!("
            7F4EF07B 9EA82FD7 8AD689B3 8D0BC78C
            F21F249D 953BC46F 4C6E1925 9C010F99
        "))
    }

    fn session() -> Session<CamAes128> {
        Session::new(Protocol::new(PACE_ECDH_GM_AES_CBC_CMAC_128, 13).unwrap())
    }

    #[test]
    fn test_phases_must_be_ordered() {
        let mut session = session();
        assert_eq!(session.status(), SessionStatus::Unestablished);

        let mut card = FixedCard(Vec::new(), 0x9000);
        let err = session.authenticate(&mut card).unwrap_err();
        assert!(matches!(err, CommunicationError::Pace(Error::SessionState { .. })));
        assert_eq!(session.status(), SessionStatus::Closed);

        // a closed session stays closed
        let err = session.decrypt_nonce(&Password::mrz("T22000129364081251010318"), &ENCRYPTED_NONCE).unwrap_err();
        assert!(matches!(err, CommunicationError::Pace(Error::SessionState { status: SessionStatus::Closed, .. })));
    }

    #[test]
    fn test_bad_nonce_length() {
        let mut session = session();
        let err = session.decrypt_nonce(&Password::can("123456"), &ENCRYPTED_NONCE[..15]).unwrap_err();
        assert!(matches!(err, CommunicationError::Pace(Error::NonceLength { length: 15 })));
        assert_eq!(session.status(), SessionStatus::Closed);
    }

    #[test]
    fn test_invalid_card_mapping_key() {
        let mut session = session();
        session.decrypt_nonce(&Password::mrz("T22000129364081251010318"), &ENCRYPTED_NONCE).unwrap();
        assert_eq!(session.status(), SessionStatus::Authenticating);

        // 7C 43 82 41 04 || 0x01 * 64: not on the curve
        let mut response = hex!("7C 43 82 41 04").to_vec();
        response.extend([0x01; 64]);
        let mut card = FixedCard(response, 0x9000);

        let mapping_private_key = mapping_private_key();
        let err = session.map_nonce(&mut card, TerminalContribution::Generic { mapping_private_key: &mapping_private_key }).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidPoint);
        assert_eq!(session.status(), SessionStatus::Closed);
        assert!(session.mapped_domain().is_none());
    }

    #[test]
    fn test_card_status_error() {
        let mut mismatched = session();
        mismatched.decrypt_nonce(&Password::mrz("T22000129364081251010318"), &ENCRYPTED_NONCE).unwrap();

        let mut card = FixedCard(Vec::new(), 0x6982);
        let err = mismatched.map_nonce(&mut card, TerminalContribution::Integrated { terminal_nonce: &[0u8; 16] }).unwrap_err();
        // the protocol is Generic Mapping
        assert!(matches!(err, CommunicationError::Pace(Error::MappingNotSupported { .. })));

        let mut refused = session();
        refused.decrypt_nonce(&Password::mrz("T22000129364081251010318"), &ENCRYPTED_NONCE).unwrap();
        let key = mapping_private_key();
        let err = refused.map_nonce(&mut card, TerminalContribution::Generic { mapping_private_key: &key }).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StatusError);
        assert_eq!(err.status(), Some(StatusWord::SecurityStatusNotSatisfied));
        assert_eq!(refused.status(), SessionStatus::Closed);
    }
}
