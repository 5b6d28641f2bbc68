//! Cipher and MAC (message authentication code) combinations.
//!
//! Only the AES-based suites are supported. All of them use Cipher Block Chaining (CBC) for
//! encryption and CMAC truncated to 8 bytes for authentication.


use std::fmt;

use aes::{Aes128, Aes192, Aes256};
use cipher::{BlockCipher, BlockDecryptMut, BlockEncryptMut, KeyInit, KeyIvInit};
use cipher::block_padding::NoPadding;
use cmac::{Cmac, Mac};
use crypto_bigint::{BoxedUint, NonZero};
use digest::Digest;
use hex_literal::hex;
use sha1::Sha1;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::crypt::{boxed_uint_from_be_slice, boxed_uint_with_precision};
use crate::pace::kdf;


/// Length of a truncated MAC in bytes.
pub const MAC_LENGTH: usize = 8;

/// Block size of AES in bytes.
pub const AES_BLOCK_SIZE: usize = 16;


#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Error {
    InvalidKeyLength { expected: usize, obtained: usize },
    InvalidIvLength { expected: usize, obtained: usize },
    UnalignedData { length: usize, block_size: usize },
    Kdf(kdf::Error),
}
impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidKeyLength { expected, obtained }
                => write!(f, "key has {} bytes, expected {}", obtained, expected),
            Self::InvalidIvLength { expected, obtained }
                => write!(f, "IV has {} bytes, expected {}", obtained, expected),
            Self::UnalignedData { length, block_size }
                => write!(f, "data length {} is not a multiple of the block size {}", length, block_size),
            Self::Kdf(e)
                => write!(f, "key derivation failed: {}", e),
        }
    }
}
impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::InvalidKeyLength { .. } => None,
            Self::InvalidIvLength { .. } => None,
            Self::UnalignedData { .. } => None,
            Self::Kdf(e) => Some(e),
        }
    }
}
impl From<kdf::Error> for Error {
    fn from(value: kdf::Error) -> Self { Self::Kdf(value) }
}


fn check_lengths(key: &[u8], key_size: usize, iv: &[u8], data: &[u8]) -> Result<(), Error> {
    if key.len() != key_size {
        return Err(Error::InvalidKeyLength { expected: key_size, obtained: key.len() });
    }
    if iv.len() != AES_BLOCK_SIZE {
        return Err(Error::InvalidIvLength { expected: AES_BLOCK_SIZE, obtained: iv.len() });
    }
    if data.len() % AES_BLOCK_SIZE != 0 {
        return Err(Error::UnalignedData { length: data.len(), block_size: AES_BLOCK_SIZE });
    }
    Ok(())
}

fn cbc_encrypt<C>(data: &mut [u8], key: &[u8], key_size: usize, iv: &[u8]) -> Result<(), Error>
    where C: BlockEncryptMut + BlockCipher + KeyInit
{
    check_lengths(key, key_size, iv, data)?;
    let encryptor = cbc::Encryptor::<C>::new_from_slices(key, iv)
        .map_err(|_| Error::InvalidKeyLength { expected: key_size, obtained: key.len() })?;
    let length = data.len();
    encryptor.encrypt_padded_mut::<NoPadding>(data, length)
        .map_err(|_| Error::UnalignedData { length, block_size: AES_BLOCK_SIZE })?;
    Ok(())
}

fn cbc_decrypt<C>(data: &mut [u8], key: &[u8], key_size: usize, iv: &[u8]) -> Result<(), Error>
    where C: BlockDecryptMut + BlockCipher + KeyInit
{
    check_lengths(key, key_size, iv, data)?;
    let decryptor = cbc::Decryptor::<C>::new_from_slices(key, iv)
        .map_err(|_| Error::InvalidKeyLength { expected: key_size, obtained: key.len() })?;
    let length = data.len();
    decryptor.decrypt_padded_mut::<NoPadding>(data)
        .map_err(|_| Error::UnalignedData { length, block_size: AES_BLOCK_SIZE })?;
    Ok(())
}


/// A combination of cipher, MAC and KDF (key derivation function) usable during authentication and
/// Secure Messaging.
pub trait CipherAndMac {
    /// The digest underlying the key derivation function.
    type KdfDigest: Digest;

    /// Size of the cipher key in bytes.
    const KEY_SIZE: usize;

    /// Block size of the cipher in bytes.
    const BLOCK_SIZE: usize = AES_BLOCK_SIZE;

    /// Human-readable name of the combination.
    const NAME: &'static str;

    /// Encrypts pre-padded data in-place using the given key and CBC IV.
    fn encrypt_padded_data(data: &mut [u8], key: &[u8], iv: &[u8]) -> Result<(), Error>;

    /// Decrypts data in-place using the given key and CBC IV.
    ///
    /// Does not strip padding.
    fn decrypt_padded_data(data: &mut [u8], key: &[u8], iv: &[u8]) -> Result<(), Error>;

    /// Generates a MAC (message authentication code) over the given pre-padded data, truncated to
    /// [`MAC_LENGTH`] bytes.
    fn mac_padded_data(data: &[u8], key: &[u8]) -> Result<Zeroizing<Vec<u8>>, Error>;

    /// Encrypts a single block with the raw block cipher.
    fn encrypt_block(block: &[u8], key: &[u8]) -> Result<Zeroizing<Vec<u8>>, Error> {
        // CBC with a zero IV over one block is the raw block cipher
        let mut output = Zeroizing::new(block.to_vec());
        if output.len() != Self::BLOCK_SIZE {
            return Err(Error::UnalignedData { length: output.len(), block_size: Self::BLOCK_SIZE });
        }
        let zero_iv = [0u8; AES_BLOCK_SIZE];
        Self::encrypt_padded_data(&mut output, key, &zero_iv)?;
        Ok(output)
    }

    /// Verifies whether the given data fits the given MAC in constant time.
    fn verify_mac_padded_data(data: &[u8], key: &[u8], expected_mac: &[u8]) -> Result<bool, Error> {
        let computed_mac = Self::mac_padded_data(data, key)?;
        Ok(computed_mac.as_slice().ct_eq(expected_mac).into())
    }

    /// The key derivation function.
    fn derive_key(key_seed: &[u8], counter: u32) -> Result<Zeroizing<Vec<u8>>, Error> {
        Ok(kdf::derive::<Self::KdfDigest>(key_seed, counter, Self::KEY_SIZE)?)
    }

    /// The key derivation function for encryption purposes.
    fn derive_encryption_key(key_seed: &[u8]) -> Result<Zeroizing<Vec<u8>>, Error> {
        Self::derive_key(key_seed, kdf::COUNTER_ENCRYPTION)
    }

    /// The key derivation function for message authentication purposes.
    fn derive_mac_key(key_seed: &[u8]) -> Result<Zeroizing<Vec<u8>>, Error> {
        Self::derive_key(key_seed, kdf::COUNTER_MAC)
    }

    /// The password-to-key derivation function.
    fn derive_key_from_password(key_seed: &[u8]) -> Result<Zeroizing<Vec<u8>>, Error> {
        Self::derive_key(key_seed, kdf::COUNTER_PASSWORD)
    }

    /// The pseudorandom function used for Integrated Mapping.
    ///
    /// `chip_nonce` (s) is encrypted with `terminal_nonce` (t) as the key. The result keys a chain
    /// of encryptions of two constants whose outputs are concatenated and reduced modulo `prime`.
    fn integrated_mapping_pseudorandom_function(chip_nonce: &[u8], terminal_nonce: &[u8], prime: &BoxedUint) -> Result<Zeroizing<BoxedUint>, Error> {
        const C0_128: [u8; 16] = hex!("a668892a7c41e3ca739f40b057d85904");
        const C1_128: [u8; 16] = hex!("a4e136ac725f738b01c1f60217c188ad");
        const C0_256: [u8; 32] = hex!("d463d65234124ef7897054986dca0a174e28df758cbaa03f240616414d5a1676");
        const C1_256: [u8; 32] = hex!("54bd7255f0aaf831bec3423fcf39d69b6cbf066677d0faae5aadd99df8e53517");

        if terminal_nonce.len() != Self::KEY_SIZE {
            return Err(Error::InvalidKeyLength { expected: Self::KEY_SIZE, obtained: terminal_nonce.len() });
        }
        if chip_nonce.is_empty() || chip_nonce.len() % Self::BLOCK_SIZE != 0 {
            return Err(Error::UnalignedData { length: chip_nonce.len(), block_size: Self::BLOCK_SIZE });
        }

        let (c0, c1) = if Self::KEY_SIZE == 16 {
            (&C0_128[..], &C1_128[..])
        } else {
            // AES-192 and AES-256
            (&C0_256[..], &C1_256[..])
        };
        let zero_iv = [0u8; AES_BLOCK_SIZE];

        // initial key: E(t, s)
        let mut key = Zeroizing::new(chip_nonce.to_vec());
        Self::encrypt_padded_data(&mut key, terminal_nonce, &zero_iv)?;
        if key.len() < Self::KEY_SIZE {
            // AES-192/256 with a single-block nonce
            return Err(Error::InvalidKeyLength { expected: Self::KEY_SIZE, obtained: key.len() });
        }

        let mut output_buf = Zeroizing::new(Vec::new());
        let required_bits = usize::try_from(prime.bits()).unwrap_or(usize::MAX).saturating_add(64);
        while output_buf.len() * 8 < required_bits {
            let round_key = Zeroizing::new(key[0..Self::KEY_SIZE].to_vec());

            // key for the next round
            key.clear();
            key.extend_from_slice(c0);
            Self::encrypt_padded_data(&mut key, &round_key, &zero_iv)?;

            // output of this round
            let mut data = Zeroizing::new(c1.to_vec());
            Self::encrypt_padded_data(&mut data, &round_key, &zero_iv)?;
            output_buf.extend_from_slice(&data);
        }

        let output_num = boxed_uint_from_be_slice(&output_buf);
        let precision = output_num.bits_precision().max(prime.bits_precision());
        let output_num = Zeroizing::new(boxed_uint_with_precision(&output_num, precision));
        let modulus = NonZero::new(boxed_uint_with_precision(prime, precision)).into_option()
            .ok_or(Error::UnalignedData { length: 0, block_size: Self::BLOCK_SIZE })?;
        let reduced = Zeroizing::new(output_num.rem(&modulus));
        Ok(Zeroizing::new(boxed_uint_with_precision(&reduced, prime.bits_precision())))
    }
}


macro_rules! aes_cipher_and_mac {
    ($(#[$meta:meta])* $name:ident, $cipher:ty, $digest:ty, $key_size:expr, $display_name:expr) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
        pub struct $name;
        impl CipherAndMac for $name {
            type KdfDigest = $digest;
            const KEY_SIZE: usize = $key_size;
            const NAME: &'static str = $display_name;

            fn encrypt_padded_data(data: &mut [u8], key: &[u8], iv: &[u8]) -> Result<(), Error> {
                cbc_encrypt::<$cipher>(data, key, Self::KEY_SIZE, iv)
            }

            fn decrypt_padded_data(data: &mut [u8], key: &[u8], iv: &[u8]) -> Result<(), Error> {
                cbc_decrypt::<$cipher>(data, key, Self::KEY_SIZE, iv)
            }

            fn mac_padded_data(data: &[u8], key: &[u8]) -> Result<Zeroizing<Vec<u8>>, Error> {
                let mut mac = <Cmac<$cipher> as Mac>::new_from_slice(key)
                    .map_err(|_| Error::InvalidKeyLength { expected: Self::KEY_SIZE, obtained: key.len() })?;
                mac.update(data);
                let full_mac = mac.finalize().into_bytes();
                Ok(Zeroizing::new(full_mac[..MAC_LENGTH].to_vec()))
            }
        }
    };
}

aes_cipher_and_mac!(
    /// AES-128-based cipher and MAC.
    ///
    /// The KDF is equivalent to:
    /// ```plain
    /// keydata = sha1(key || counter)[0..16]
    /// ```
    CamAes128, Aes128, Sha1, 16, "AES-128-CBC-CMAC"
);
aes_cipher_and_mac!(
    /// AES-192-based cipher and MAC.
    ///
    /// The KDF is equivalent to:
    /// ```plain
    /// keydata = sha256(key || counter)[0..24]
    /// ```
    CamAes192, Aes192, Sha256, 24, "AES-192-CBC-CMAC"
);
aes_cipher_and_mac!(
    /// AES-256-based cipher and MAC.
    ///
    /// The KDF is equivalent to:
    /// ```plain
    /// keydata = sha256(key || counter)
    /// ```
    CamAes256, Aes256, Sha256, 32, "AES-256-CBC-CMAC"
);
