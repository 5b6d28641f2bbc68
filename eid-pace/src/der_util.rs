//! Utility functions for Distinguished Encoding Rules and the BER-TLV data objects of ISO/IEC 7816.


use rasn::types::Oid;


/// Encode an ASN.1 DER primitive value length.
pub fn encode_primitive_length(output: &mut Vec<u8>, length: usize) {
    if length < 128 {
        // single-byte encoding
        output.push(length as u8);
    } else {
        // 0b1nnn_nnnn and then n additional bytes that actually specify the length
        // (big-endian)
        let length_bytes = length.to_be_bytes();
        let leading_zeroes = length_bytes.iter().take_while(|b| **b == 0x00).count();
        let trimmed_length_slice = &length_bytes[leading_zeroes..];
        output.push(0b1000_0000 | (trimmed_length_slice.len() as u8));
        output.extend(trimmed_length_slice);
    }
}


/// Decode an ASN.1 DER primitive value length.
///
/// The length must be at the beginning of the input slice.
///
/// Returns a tuple `(length, rest)` where `rest` is the rest of the input slice once the length has
/// been removed.
pub fn try_decode_primitive_length(input: &[u8]) -> Option<(usize, &[u8])> {
    let (&start_byte, rest) = input.split_first()?;
    let start_lower_bits = start_byte & 0b0111_1111;
    if start_byte & 0b1000_0000 != 0 {
        // multiple bytes
        let length_byte_count: usize = start_lower_bits.into();
        if length_byte_count == 0 || length_byte_count > rest.len() {
            return None;
        }
        let mut length: usize = 0;
        for length_byte in &rest[..length_byte_count] {
            length = length.checked_mul(256)?
                .checked_add(usize::from(*length_byte))?;
        }
        Some((length, &rest[length_byte_count..]))
    } else {
        Some((start_lower_bits.into(), rest))
    }
}


/// Appends a data object with the given (one- or multi-byte) tag.
pub fn encode_tlv(output: &mut Vec<u8>, tag: &[u8], value: &[u8]) {
    output.extend(tag);
    encode_primitive_length(output, value.len());
    output.extend(value);
}


/// Splits off the first data object with a single-byte tag.
///
/// Returns `(tag, value, rest)`, or `None` if the data object is truncated.
pub fn split_tlv(input: &[u8]) -> Option<(u8, &[u8], &[u8])> {
    let (&tag, after_tag) = input.split_first()?;
    let (length, after_length) = try_decode_primitive_length(after_tag)?;
    if length > after_length.len() {
        return None;
    }
    let (value, rest) = after_length.split_at(length);
    Some((tag, value, rest))
}


/// Splits a sequence of data objects with single-byte tags.
///
/// Returns `None` if any data object is truncated.
pub fn split_tlvs(mut input: &[u8]) -> Option<Vec<(u8, &[u8])>> {
    let mut objects = Vec::new();
    while !input.is_empty() {
        let (tag, value, rest) = split_tlv(input)?;
        objects.push((tag, value));
        input = rest;
    }
    Some(objects)
}


/// Encode an object identifier value into bytes using DER encoding rules.
///
/// No tag or length is encoded, only the actual value. Returns `None` if the first two arcs are
/// invalid.
pub fn oid_to_der_bytes(oid: &Oid) -> Option<Vec<u8>> {
    const SEVEN_BIT_MASK: u32 = 0b0111_1111;
    const TOP_BIT: u8 = 0b1000_0000;

    if oid.len() < 2 || oid[0] > 2 || (oid[0] < 2 && oid[1] > 39) {
        return None;
    }

    fn encode_arc(ret: &mut Vec<u8>, arc: u32) {
        // groups of seven bits, most significant first; all but the last have the top bit set
        let mut shift = 28;
        while shift > 0 && arc >> shift == 0 {
            shift -= 7;
        }
        while shift > 0 {
            ret.push(((arc >> shift) & SEVEN_BIT_MASK) as u8 | TOP_BIT);
            shift -= 7;
        }
        ret.push((arc & SEVEN_BIT_MASK) as u8);
    }

    let mut ret = Vec::new();
    let first_arc_pair = oid[0].checked_mul(40)?.checked_add(oid[1])?;
    encode_arc(&mut ret, first_arc_pair);

    for arc in oid.iter().skip(2) {
        encode_arc(&mut ret, *arc);
    }

    Some(ret)
}


#[cfg(test)]
mod tests {
    use super::{encode_primitive_length, encode_tlv, oid_to_der_bytes, split_tlv, split_tlvs, try_decode_primitive_length};
    use hex_literal::hex;
    use rasn::types::Oid;

    #[test]
    fn test_lengths() {
        for (length, encoded) in [(0usize, &hex!("00")[..]), (127, &hex!("7F")), (128, &hex!("8180")), (256, &hex!("820100"))] {
            let mut buf = Vec::new();
            encode_primitive_length(&mut buf, length);
            assert_eq!(buf, encoded);

            let (decoded, rest) = try_decode_primitive_length(&buf).unwrap();
            assert_eq!(decoded, length);
            assert!(rest.is_empty());
        }

        assert_eq!(try_decode_primitive_length(&[]), None);
        assert_eq!(try_decode_primitive_length(&hex!("80")), None);
        assert_eq!(try_decode_primitive_length(&hex!("8201")), None);
    }

    #[test]
    fn test_oid() {
        let pace_ecdh_gm_aes_128 = Oid::const_new(&[0, 4, 0, 127, 0, 7, 2, 2, 4, 2, 2]);
        assert_eq!(
            oid_to_der_bytes(pace_ecdh_gm_aes_128).unwrap(),
            hex!("04 00 7F 00 07 02 02 04 02 02"),
        );

        let rsa = Oid::const_new(&[1, 2, 840, 113549, 1, 1, 1]);
        assert_eq!(oid_to_der_bytes(rsa).unwrap(), hex!("2A 86 48 86 F7 0D 01 01 01"));

        let bogus = Oid::const_new(&[1, 40, 1]);
        assert_eq!(oid_to_der_bytes(bogus), None);
    }

    #[test]
    fn test_tlvs() {
        let mut buf = Vec::new();
        encode_tlv(&mut buf, &[0x87], &hex!("01 AABB"));
        encode_tlv(&mut buf, &[0x99], &hex!("9000"));
        encode_tlv(&mut buf, &[0x8E], &[0x11; 8]);
        assert_eq!(&buf[..7], &hex!("87 03 01AABB 99 02"));

        let objects = split_tlvs(&buf).unwrap();
        assert_eq!(objects.len(), 3);
        assert_eq!(objects[0], (0x87, &hex!("01 AABB")[..]));
        assert_eq!(objects[2], (0x8E, &[0x11u8; 8][..]));

        assert_eq!(split_tlv(&hex!("7C 05 80 03 00")), None);
        assert_eq!(split_tlvs(&hex!("80 00 81")), None);
    }
}
