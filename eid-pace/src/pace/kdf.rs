//! Key Derivation Function for PACE and Secure Messaging.
//!
//! The KDF is equivalent to:
//! ```plain
//! keydata = hash(key_seed || counter)
//! ```
//! where `counter` is a 32-bit big-endian integer. If more key material is requested than a single
//! digest provides, further blocks are appended:
//! ```plain
//! keydata = hash(key_seed || counter) || hash(key_seed || counter || 1) || hash(key_seed || counter || 2) || ...
//! ```
//! and the result is truncated to the requested length.


use std::fmt;

use digest::Digest;
use zeroize::Zeroizing;


/// Counter value for deriving the encryption key.
pub const COUNTER_ENCRYPTION: u32 = 1;

/// Counter value for deriving the MAC key.
pub const COUNTER_MAC: u32 = 2;

/// Counter value for deriving the key from the password.
pub const COUNTER_PASSWORD: u32 = 3;

/// The maximum number of digest blocks that may be concatenated.
const MAX_BLOCKS: usize = 255;


#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Error {
    ZeroLength,
    TooLong { requested: usize, maximum: usize },
}
impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ZeroLength
                => write!(f, "zero bytes of key material requested"),
            Self::TooLong { requested, maximum }
                => write!(f, "{} bytes of key material requested, at most {} can be derived", requested, maximum),
        }
    }
}
impl std::error::Error for Error {
}


/// Derives `output_length` bytes of key material from the key seed and the counter.
pub fn derive<D: Digest>(key_seed: &[u8], counter: u32, output_length: usize) -> Result<Zeroizing<Vec<u8>>, Error> {
    let digest_size = <D as Digest>::output_size();
    let maximum = digest_size * MAX_BLOCKS;
    if output_length == 0 {
        return Err(Error::ZeroLength);
    }
    if output_length > maximum {
        return Err(Error::TooLong { requested: output_length, maximum });
    }

    let mut output = Zeroizing::new(Vec::with_capacity(output_length + digest_size));
    let mut block_index: u8 = 0;
    while output.len() < output_length {
        let mut hasher = D::new();
        hasher.update(key_seed);
        hasher.update(counter.to_be_bytes());
        if block_index > 0 {
            hasher.update([block_index]);
        }
        let block = Zeroizing::new(hasher.finalize().to_vec());
        output.extend_from_slice(&block);

        // MAX_BLOCKS limits this to u8
        block_index = block_index.wrapping_add(1);
    }
    output.truncate(output_length);
    Ok(output)
}

/// Derives the encryption key `K_enc`.
pub fn derive_encryption_key<D: Digest>(key_seed: &[u8], output_length: usize) -> Result<Zeroizing<Vec<u8>>, Error> {
    derive::<D>(key_seed, COUNTER_ENCRYPTION, output_length)
}

/// Derives the MAC key `K_mac`.
pub fn derive_mac_key<D: Digest>(key_seed: &[u8], output_length: usize) -> Result<Zeroizing<Vec<u8>>, Error> {
    derive::<D>(key_seed, COUNTER_MAC, output_length)
}

/// Derives the password key `K_π`.
pub fn derive_key_from_password<D: Digest>(key_seed: &[u8], output_length: usize) -> Result<Zeroizing<Vec<u8>>, Error> {
    derive::<D>(key_seed, COUNTER_PASSWORD, output_length)
}


#[cfg(test)]
mod tests {
    use super::{derive, derive_encryption_key, derive_key_from_password, derive_mac_key, Error};
    use hex_literal::hex;
    use sha1::{Digest, Sha1};
    use sha2::Sha256;

    #[test]
    fn test_password_key_appendix_g1() {
        // key seed is SHA-1 of the MRZ information
        let key_seed = Sha1::digest(b"T22000129364081251010318");
        let k_pi = derive_key_from_password::<Sha1>(&key_seed, 16).unwrap();
        assert_eq!(k_pi.as_slice(), &hex!("89DED1B26624EC1E634C1989302849DD"));
    }

    #[test]
    fn test_session_keys_appendix_g1() {
        let shared_secret = hex!("
            28768D20 701247DA E81804C9 E780EDE5
            82A9996D B4A31502 0B273319 7DB84925
        ");
        let k_enc = derive_encryption_key::<Sha1>(&shared_secret, 16).unwrap();
        let k_mac = derive_mac_key::<Sha1>(&shared_secret, 16).unwrap();
        assert_eq!(k_enc.as_slice(), &hex!("F5F0E35C0D7161EE6724EE513A0D9A7F"));
        assert_eq!(k_mac.as_slice(), &hex!("FE251C7858B356B24514B3BD5F4297D1"));
    }

    #[test]
    fn test_counters_separate_domains() {
        let seed = b"0123456789";
        let one = derive::<Sha256>(seed, 1, 32).unwrap();
        let two = derive::<Sha256>(seed, 2, 32).unwrap();
        assert_ne!(one, two);
        assert_eq!(one, derive::<Sha256>(seed, 1, 32).unwrap());
    }

    #[test]
    fn test_longer_than_digest() {
        let seed = b"seed";
        let short = derive::<Sha1>(seed, 1, 20).unwrap();
        let long = derive::<Sha1>(seed, 1, 50).unwrap();
        assert_eq!(long.len(), 50);

        // the first block is the plain digest
        assert_eq!(&long[..20], short.as_slice());

        let mut hasher = Sha1::new();
        hasher.update(seed);
        hasher.update(1u32.to_be_bytes());
        hasher.update([1u8]);
        assert_eq!(&long[20..40], hasher.finalize().as_slice());
    }

    #[test]
    fn test_invalid_lengths() {
        assert_eq!(derive::<Sha1>(b"seed", 1, 0), Err(Error::ZeroLength));
        assert_eq!(
            derive::<Sha1>(b"seed", 1, 20*255 + 1),
            Err(Error::TooLong { requested: 20*255 + 1, maximum: 20*255 }),
        );
        assert_eq!(derive::<Sha1>(b"seed", 1, 20*255).unwrap().len(), 20*255);
    }
}
