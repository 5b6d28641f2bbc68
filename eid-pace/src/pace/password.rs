//! Holders for sensitive byte strings: passwords, nonces and symmetric keys.
//!
//! All of them are wiped when dropped. The raw bytes are never shown by `Debug`.


use std::fmt;

use sha1::{Digest, Sha1};
use subtle::{Choice, ConstantTimeEq};
use zeroize::{Zeroize, Zeroizing};
use zeroize_derive::{Zeroize, ZeroizeOnDrop};


/// An owned buffer of sensitive bytes that is zeroized when dropped.
#[derive(Clone, Default, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SensitiveBytes {
    bytes: Vec<u8>,
}
impl SensitiveBytes {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn from_slice(bytes: &[u8]) -> Self {
        Self { bytes: bytes.to_vec() }
    }

    pub fn len(&self) -> usize { self.bytes.len() }
    pub fn is_empty(&self) -> bool { self.bytes.is_empty() }

    /// Returns a copy of the bytes which is zeroized once dropped.
    pub fn to_bytes(&self) -> Zeroizing<Vec<u8>> {
        Zeroizing::new(self.bytes.clone())
    }

    /// Grants scoped access to the bytes.
    pub fn with_secret<R, F: FnOnce(&[u8]) -> R>(&self, f: F) -> R {
        f(&self.bytes)
    }

    /// Wipes the bytes and empties the buffer.
    pub fn clear(&mut self) {
        self.bytes.zeroize();
    }
}
impl ConstantTimeEq for SensitiveBytes {
    fn ct_eq(&self, other: &Self) -> Choice {
        self.bytes.as_slice().ct_eq(other.bytes.as_slice())
    }
}
impl PartialEq for SensitiveBytes {
    fn eq(&self, other: &Self) -> bool {
        self.ct_eq(other).into()
    }
}
impl fmt::Debug for SensitiveBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SensitiveBytes([{} bytes redacted])", self.bytes.len())
    }
}
impl From<Vec<u8>> for SensitiveBytes {
    fn from(value: Vec<u8>) -> Self { Self::new(value) }
}
impl From<&[u8]> for SensitiveBytes {
    fn from(value: &[u8]) -> Self { Self::from_slice(value) }
}


/// The kind of password used to run PACE.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum PasswordSource {
    /// Machine Readable Zone (document number, date of birth and date of expiry with check digits).
    Mrz,

    /// Card Access Number printed on the card.
    Can,

    /// Personal Identification Number.
    Pin,

    /// PIN Unblocking Key.
    Puk,
}
impl PasswordSource {
    /// The reference of the password in MSE:Set AT.
    pub fn reference(&self) -> u8 {
        match self {
            Self::Mrz => 0x01,
            Self::Can => 0x02,
            Self::Pin => 0x03,
            Self::Puk => 0x04,
        }
    }

    pub fn from_reference(reference: u8) -> Option<Self> {
        match reference {
            0x01 => Some(Self::Mrz),
            0x02 => Some(Self::Can),
            0x03 => Some(Self::Pin),
            0x04 => Some(Self::Puk),
            _ => None,
        }
    }
}
impl fmt::Display for PasswordSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mrz => write!(f, "MRZ"),
            Self::Can => write!(f, "CAN"),
            Self::Pin => write!(f, "PIN"),
            Self::Puk => write!(f, "PUK"),
        }
    }
}


/// A password shared between the terminal and the card.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Password {
    source: PasswordSource,
    value: SensitiveBytes,
}
impl Password {
    pub fn new(source: PasswordSource, value: &[u8]) -> Self {
        Self { source, value: SensitiveBytes::from_slice(value) }
    }

    /// A password derived from the MRZ information, i.e. the concatenation of document number,
    /// date of birth and date of expiry, each followed by its check digit.
    pub fn mrz(mrz_information: &str) -> Self { Self::new(PasswordSource::Mrz, mrz_information.as_bytes()) }
    pub fn can(can: &str) -> Self { Self::new(PasswordSource::Can, can.as_bytes()) }
    pub fn pin(pin: &str) -> Self { Self::new(PasswordSource::Pin, pin.as_bytes()) }
    pub fn puk(puk: &str) -> Self { Self::new(PasswordSource::Puk, puk.as_bytes()) }

    pub fn source(&self) -> PasswordSource { self.source }

    /// Returns a copy of the password bytes.
    pub fn to_bytes(&self) -> Zeroizing<Vec<u8>> { self.value.to_bytes() }

    /// The seed from which the password key is derived.
    ///
    /// For the MRZ, this is the SHA-1 hash of the MRZ information; otherwise, it is the password
    /// itself.
    pub fn key_seed(&self) -> Zeroizing<Vec<u8>> {
        match self.source {
            PasswordSource::Mrz => self.value.with_secret(|mrz| {
                let digest = Sha1::digest(mrz);
                Zeroizing::new(digest.to_vec())
            }),
            _ => self.value.to_bytes(),
        }
    }

    pub fn zeroize(&mut self) {
        self.value.clear();
    }
}


/// The random nonce chosen by the card, after decryption.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Nonce(SensitiveBytes);
impl Nonce {
    pub fn new(bytes: Vec<u8>) -> Self { Self(SensitiveBytes::new(bytes)) }
    pub fn len(&self) -> usize { self.0.len() }
    pub fn is_empty(&self) -> bool { self.0.is_empty() }
    pub fn to_bytes(&self) -> Zeroizing<Vec<u8>> { self.0.to_bytes() }
    pub fn with_secret<R, F: FnOnce(&[u8]) -> R>(&self, f: F) -> R { self.0.with_secret(f) }
    pub fn zeroize(&mut self) { self.0.clear() }
}


/// A symmetric key such as `K_π`, `K_enc` or `K_mac`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SymmetricKey(SensitiveBytes);
impl SymmetricKey {
    pub fn new(bytes: Vec<u8>) -> Self { Self(SensitiveBytes::new(bytes)) }
    pub fn from_slice(bytes: &[u8]) -> Self { Self(SensitiveBytes::from_slice(bytes)) }
    pub fn len(&self) -> usize { self.0.len() }
    pub fn is_empty(&self) -> bool { self.0.is_empty() }
    pub fn to_bytes(&self) -> Zeroizing<Vec<u8>> { self.0.to_bytes() }
    pub fn with_secret<R, F: FnOnce(&[u8]) -> R>(&self, f: F) -> R { self.0.with_secret(f) }
    pub fn zeroize(&mut self) { self.0.clear() }
}
impl From<Zeroizing<Vec<u8>>> for SymmetricKey {
    fn from(value: Zeroizing<Vec<u8>>) -> Self { Self::from_slice(&value) }
}
