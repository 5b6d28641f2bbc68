//! Authentication tokens proving possession of the session keys.


use std::fmt;

use rasn::types::Oid;
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::crypt::cipher_mac::{CipherAndMac, MAC_LENGTH};
use crate::der_util::{encode_tlv, oid_to_der_bytes};
use crate::pace::Error;


/// Tag of the elliptic curve point within a public key data object.
const TAG_EC_POINT: u8 = 0x86;


/// A token exchanged during mutual authentication.
///
/// Equality is decided in constant time.
#[derive(Clone)]
pub struct AuthenticationTag(Vec<u8>);
impl AuthenticationTag {
    pub fn from_slice(bytes: &[u8]) -> Self { Self(bytes.to_vec()) }
    pub fn as_bytes(&self) -> &[u8] { &self.0 }
    pub fn len(&self) -> usize { self.0.len() }
    pub fn is_empty(&self) -> bool { self.0.is_empty() }
}
impl ConstantTimeEq for AuthenticationTag {
    fn ct_eq(&self, other: &Self) -> subtle::Choice {
        self.0.as_slice().ct_eq(other.0.as_slice())
    }
}
impl PartialEq for AuthenticationTag {
    fn eq(&self, other: &Self) -> bool {
        self.ct_eq(other).into()
    }
}
impl Eq for AuthenticationTag {}
impl fmt::Debug for AuthenticationTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AuthenticationTag(")?;
        for b in &self.0 {
            write!(f, "{:02X}", b)?;
        }
        write!(f, ")")
    }
}


/// Encodes an ephemeral public key as the public key data object (`7F49`) authenticated by the
/// tokens.
pub fn encode_public_key_data_object(protocol: &Oid, encoded_point: &[u8]) -> Option<Zeroizing<Vec<u8>>> {
    let protocol_bytes = oid_to_der_bytes(protocol)?;

    // 0x06 LL protocol_oid
    // 0x86 LL public_point
    let mut inner_data = Zeroizing::new(Vec::new());
    encode_tlv(&mut inner_data, &[0x06], &protocol_bytes);
    encode_tlv(&mut inner_data, &[TAG_EC_POINT], encoded_point);

    // 0x7F_0x49 LL inner_data
    let mut outer_data = Zeroizing::new(Vec::new());
    encode_tlv(&mut outer_data, &[0x7F, 0x49], &inner_data);
    Some(outer_data)
}


/// Computes the token over the other party's ephemeral public key.
///
/// The token is the MAC (truncated to [`MAC_LENGTH`] bytes) of the public key data object.
pub fn compute_token<C: CipherAndMac>(k_mac: &[u8], protocol: &Oid, peer_public_key: &[u8]) -> Result<AuthenticationTag, Error> {
    let data_object = encode_public_key_data_object(protocol, peer_public_key)
        .ok_or_else(|| Error::InvalidProtocolOid { protocol: protocol.to_owned() })?;
    let mac = C::mac_padded_data(&data_object, k_mac)?;
    Ok(AuthenticationTag(mac[..MAC_LENGTH.min(mac.len())].to_vec()))
}


/// Tracks the tokens of a mutual authentication.
#[derive(Clone, Debug, Default)]
pub struct AuthenticationContext {
    expected: Option<AuthenticationTag>,
    received: Option<AuthenticationTag>,
}
impl AuthenticationContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the token the card should send, i.e. the one computed over our public key.
    pub fn expect(&mut self, token: AuthenticationTag) {
        self.expected = Some(token);
    }

    /// Records the token the card has sent.
    pub fn receive(&mut self, token: AuthenticationTag) {
        self.received = Some(token);
    }

    /// Whether both tokens are known and equal. Compared in constant time.
    pub fn is_authenticated(&self) -> bool {
        match (&self.expected, &self.received) {
            (Some(expected), Some(received)) => {
                expected.len() == received.len() && bool::from(expected.ct_eq(received))
            },
            _ => false,
        }
    }
}
