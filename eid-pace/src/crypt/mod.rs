//! Cryptographic functionality.


pub mod cipher_mac;
pub mod elliptic;


use crypto_bigint::{BoxedUint, Word};
use zeroize::Zeroizing;


const WORD_BYTES: usize = std::mem::size_of::<Word>();


/// Decodes an unsigned big-endian integer.
///
/// The precision of the result is the length of the slice rounded up to whole limbs.
pub fn boxed_uint_from_be_slice(slice: &[u8]) -> BoxedUint {
    // limbs are little-endian, bytes within a limb are big-endian
    let words: Zeroizing<Vec<Word>> = Zeroizing::new(
        slice.rchunks(WORD_BYTES)
            .map(|chunk| chunk.iter().fold(0, |acc: Word, b| (acc << 8) | Word::from(*b)))
            .collect()
    );
    if words.is_empty() {
        BoxedUint::zero()
    } else {
        BoxedUint::from_words(words.iter().copied())
    }
}


/// Returns the value with exactly the given precision in bits.
///
/// Limbs above the new precision are dropped, so the value must fit.
pub fn boxed_uint_with_precision(value: &BoxedUint, bits_precision: u32) -> BoxedUint {
    let limb_count = usize::try_from(bits_precision.div_ceil(Word::BITS)).unwrap_or(usize::MAX).max(1);
    let words = value.as_words().iter()
        .copied()
        .chain(std::iter::repeat(0))
        .take(limb_count);
    BoxedUint::from_words(words)
}


/// Encodes an unsigned integer in big-endian byte order using exactly `length` bytes.
///
/// Leading zero bytes are added or stripped as necessary.
pub fn boxed_uint_to_be_bytes(value: &BoxedUint, length: usize) -> Zeroizing<Vec<u8>> {
    let bytes = Zeroizing::new(value.to_be_bytes().into_vec());
    let mut ret = Zeroizing::new(Vec::with_capacity(length));
    if bytes.len() >= length {
        debug_assert!(bytes[..bytes.len() - length].iter().all(|b| *b == 0x00));
        ret.extend(&bytes[bytes.len() - length..]);
    } else {
        ret.resize(length - bytes.len(), 0x00);
        ret.extend(bytes.iter());
    }
    ret
}
