//! Mapping of the card's nonce onto a fresh generator.


use std::fmt;

use crypto_bigint::BoxedUint;
use zeroize::Zeroizing;

use crate::crypt::boxed_uint_from_be_slice;
use crate::crypt::cipher_mac::CipherAndMac;
use crate::crypt::elliptic::{self, AffinePoint, PrimeWeierstrassCurve};
use crate::pace::Error;
use crate::pace::password::Nonce;


/// The way the nonce is mapped onto a new generator.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Mapping {
    /// Both parties contribute a Diffie-Hellman share; `G' = s·G + H`.
    Generic,

    /// The generator is derived deterministically from both parties' nonces.
    Integrated,
}
impl fmt::Display for Mapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Generic => write!(f, "GM"),
            Self::Integrated => write!(f, "IM"),
        }
    }
}


/// The terminal's contribution to the mapping.
pub enum MappingInput<'a> {
    Generic {
        /// Our private key of the mapping key pair, over the original domain.
        terminal_private_key: &'a BoxedUint,

        /// The card's public key of the mapping key pair.
        card_public_key: &'a AffinePoint,
    },
    Integrated {
        /// The nonce we sent to the card.
        terminal_nonce: &'a [u8],
    },
}
impl<'a> MappingInput<'a> {
    pub fn mapping(&self) -> Mapping {
        match self {
            Self::Generic { .. } => Mapping::Generic,
            Self::Integrated { .. } => Mapping::Integrated,
        }
    }
}


/// Domain parameters whose generator has been replaced by the mapped one.
///
/// Only valid for the session whose nonce it was derived from.
#[derive(Clone, Debug)]
pub struct MappedDomain {
    curve: PrimeWeierstrassCurve,
    mapping: Mapping,
}
impl MappedDomain {
    pub fn curve(&self) -> &PrimeWeierstrassCurve { &self.curve }
    pub fn generator(&self) -> &AffinePoint { self.curve.generator() }
    pub fn mapping(&self) -> Mapping { self.mapping }
}


fn degenerate_as_invalid_mapping(error: elliptic::Error) -> Error {
    match error {
        // H = ∞ can only come from a manipulated mapping key
        elliptic::Error::WeakKey => Error::Elliptic(elliptic::Error::InvalidMapping),
        other => Error::Elliptic(other),
    }
}


/// Performs Generic Mapping.
///
/// Computes `H = terminal_private_key · card_public_key` and `G' = s·G + H`.
pub fn map_generic(
    curve: &PrimeWeierstrassCurve,
    nonce: &Nonce,
    terminal_private_key: &BoxedUint,
    card_public_key: &AffinePoint,
) -> Result<MappedDomain, Error> {
    let shared_point = curve.diffie_hellman(terminal_private_key, card_public_key)
        .map_err(degenerate_as_invalid_mapping)?;
    let nonce_scalar = Zeroizing::new(nonce.with_secret(boxed_uint_from_be_slice));
    let session_curve = curve.derive_generic_mapping_session_curve(&nonce_scalar, &shared_point)
        .map_err(degenerate_as_invalid_mapping)?;
    Ok(MappedDomain {
        curve: session_curve,
        mapping: Mapping::Generic,
    })
}


/// Performs Integrated Mapping.
///
/// The generator is the point encoding of `R(s, t)`, the pseudorandom function of the cipher suite
/// applied to the card's nonce `s` and the terminal's nonce `t`.
pub fn map_integrated<C: CipherAndMac>(
    curve: &PrimeWeierstrassCurve,
    nonce: &Nonce,
    terminal_nonce: &[u8],
) -> Result<MappedDomain, Error> {
    let pseudorandom = nonce.with_secret(|chip_nonce| {
        C::integrated_mapping_pseudorandom_function(chip_nonce, terminal_nonce, curve.prime())
    })?;
    let generator = curve.derive_integrated_mapping_generator(&pseudorandom)
        .map_err(degenerate_as_invalid_mapping)?;
    let session_curve = curve.with_generator(generator)
        .map_err(|_| Error::Elliptic(elliptic::Error::InvalidMapping))?;
    Ok(MappedDomain {
        curve: session_curve,
        mapping: Mapping::Integrated,
    })
}


/// Maps the nonce using whichever mapping the input belongs to.
///
/// Never falls back to the original domain: any degenerate result fails with
/// [`elliptic::Error::InvalidMapping`].
pub fn map<C: CipherAndMac>(
    curve: &PrimeWeierstrassCurve,
    nonce: &Nonce,
    input: MappingInput<'_>,
) -> Result<MappedDomain, Error> {
    match input {
        MappingInput::Generic { terminal_private_key, card_public_key }
            => map_generic(curve, nonce, terminal_private_key, card_public_key),
        MappingInput::Integrated { terminal_nonce }
            => map_integrated::<C>(curve, nonce, terminal_nonce),
    }
}
