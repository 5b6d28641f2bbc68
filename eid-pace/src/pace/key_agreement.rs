//! Ephemeral Diffie-Hellman key agreement over a (mapped) domain.


use crypto_bigint::BoxedUint;
use rand::{CryptoRng, RngCore};
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::crypt::{boxed_uint_from_be_slice, boxed_uint_to_be_bytes, boxed_uint_with_precision};
use crate::crypt::elliptic::{AffinePoint, Error, PrimeWeierstrassCurve};


/// Gives up sampling a private key after this many rejected candidates.
const MAX_SAMPLING_ATTEMPTS: usize = 1024;


/// Whether `1 <= scalar < order`.
fn is_valid_private_key(curve: &PrimeWeierstrassCurve, scalar: &BoxedUint) -> bool {
    let order = curve.order();
    if scalar.bits() > order.bits() {
        return false;
    }
    let scalar = boxed_uint_with_precision(scalar, order.bits_precision());
    !bool::from(scalar.is_zero()) && &scalar < order
}


/// A key pair that is used for a single key agreement.
///
/// The private key is wiped when the key pair is dropped or consumed by
/// [`compute_shared_secret`](EphemeralKeyPair::compute_shared_secret).
pub struct EphemeralKeyPair {
    private_key: Zeroizing<BoxedUint>,
    public_key: AffinePoint,
}
impl EphemeralKeyPair {
    /// Generates a key pair whose private key is uniformly distributed in `[1, n - 1]`.
    pub fn generate<R: RngCore + CryptoRng>(curve: &PrimeWeierstrassCurve, rng: &mut R) -> Result<Self, Error> {
        let length = curve.private_key_len_bytes();
        let excess_bits = 8 * length - usize::try_from(curve.order().bits()).unwrap_or(8 * length);
        let top_mask = 0xFFu8.checked_shr(u32::try_from(excess_bits).unwrap_or(8)).unwrap_or(0);

        let mut candidate_bytes = Zeroizing::new(vec![0u8; length]);
        for _ in 0..MAX_SAMPLING_ATTEMPTS {
            rng.fill_bytes(candidate_bytes.as_mut_slice());
            candidate_bytes[0] &= top_mask;
            let candidate = Zeroizing::new(boxed_uint_from_be_slice(&candidate_bytes));
            if is_valid_private_key(curve, &candidate) {
                return Self::from_private_key(curve, &candidate);
            }
        }
        Err(Error::WeakKey)
    }

    /// Derives the key pair belonging to a known private key.
    pub fn from_private_key(curve: &PrimeWeierstrassCurve, private_key: &BoxedUint) -> Result<Self, Error> {
        if !is_valid_private_key(curve, private_key) {
            return Err(Error::WeakKey);
        }
        let public_key = curve.calculate_public_key(private_key)?;
        Ok(Self {
            private_key: Zeroizing::new(private_key.clone()),
            public_key,
        })
    }

    pub fn public_key(&self) -> &AffinePoint {
        &self.public_key
    }

    pub(crate) fn private_key(&self) -> &BoxedUint {
        &self.private_key
    }

    /// Computes the shared secret with the peer's public key and consumes the key pair.
    ///
    /// The secret is the x coordinate of the shared point, encoded with the length of a field
    /// element. Fails with [`Error::InvalidPoint`] if the peer key is not on the curve and with
    /// [`Error::WeakKey`] if it equals our own or the shared point is the point at infinity.
    pub fn compute_shared_secret(self, curve: &PrimeWeierstrassCurve, peer_public_key: &AffinePoint) -> Result<Zeroizing<Vec<u8>>, Error> {
        let coordinate_length = curve.coordinate_len_bytes();
        let ours = curve.encode_point(&self.public_key);
        let theirs = peer_public_key.to_be_bytes(coordinate_length);
        if bool::from(ours.as_slice().ct_eq(theirs.as_slice())) {
            return Err(Error::WeakKey);
        }

        let shared_point = curve.diffie_hellman(&self.private_key, peer_public_key)?;
        Ok(boxed_uint_to_be_bytes(shared_point.x(), coordinate_length))
    }
}


/// Generates an ephemeral key pair over the given domain.
pub fn generate_ephemeral_key_pair<R: RngCore + CryptoRng>(curve: &PrimeWeierstrassCurve, rng: &mut R) -> Result<EphemeralKeyPair, Error> {
    EphemeralKeyPair::generate(curve, rng)
}


#[cfg(test)]
mod tests {
    use super::{generate_ephemeral_key_pair, EphemeralKeyPair};
    use crate::crypt::boxed_uint_from_be_slice;
    use crate::crypt::elliptic::{AffinePoint, Error};
    use crate::crypt::elliptic::curves::{get_brainpool_p256r1, get_nist_p224, get_nist_p521};
    use crypto_bigint::BoxedUint;
    use hex_literal::hex;
    use rand::rngs::OsRng;

    #[test]
    fn test_generated_keys_agree() {
        for curve in [get_nist_p224(), get_brainpool_p256r1(), get_nist_p521()] {
            let terminal = generate_ephemeral_key_pair(&curve, &mut OsRng).unwrap();
            let card = generate_ephemeral_key_pair(&curve, &mut OsRng).unwrap();
            assert!(bool::from(curve.is_on_curve_affine(terminal.public_key())));

            let terminal_public = terminal.public_key().clone();
            let card_public = card.public_key().clone();
            let terminal_secret = terminal.compute_shared_secret(&curve, &card_public).unwrap();
            let card_secret = card.compute_shared_secret(&curve, &terminal_public).unwrap();
            assert_eq!(terminal_secret, card_secret);
            assert_eq!(terminal_secret.len(), curve.coordinate_len_bytes());
        }
    }

    #[test]
    fn test_shared_secret_is_padded() {
        // P-521 coordinates take 66 bytes even when the top byte is zero
        let curve = get_nist_p521();
        let key_pair = EphemeralKeyPair::from_private_key(&curve, &BoxedUint::from(2u64)).unwrap();
        let secret = key_pair.compute_shared_secret(&curve, curve.generator()).unwrap();
        assert_eq!(secret.len(), 66);
    }

    #[test]
    fn test_invalid_private_keys() {
        let curve = get_brainpool_p256r1();
        assert_eq!(EphemeralKeyPair::from_private_key(&curve, &BoxedUint::zero()).map(|_| ()), Err(Error::WeakKey));
        assert_eq!(EphemeralKeyPair::from_private_key(&curve, curve.order()).map(|_| ()), Err(Error::WeakKey));
    }

    #[test]
    fn test_peer_key_validation() {
        let curve = get_brainpool_p256r1();
        let private_key = boxed_uint_from_be_slice(&hex!("
            A73FB703 AC1436A1 8E0CFA5A BB3F7BEC
            7A070E7A 6788486B EE230C4A 22762595
        "));

        let key_pair = EphemeralKeyPair::from_private_key(&curve, &private_key).unwrap();
        let own_public = key_pair.public_key().clone();
        assert_eq!(key_pair.compute_shared_secret(&curve, &own_public).map(|_| ()), Err(Error::WeakKey));

        let key_pair = EphemeralKeyPair::from_private_key(&curve, &private_key).unwrap();
        let off_curve = AffinePoint::new(BoxedUint::from(1u64), BoxedUint::from(1u64));
        assert_eq!(key_pair.compute_shared_secret(&curve, &off_curve).map(|_| ()), Err(Error::InvalidPoint));
    }
}
