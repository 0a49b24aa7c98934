//! Zooko's human-oriented base-32 variant (see RFC 6189).
//!
//! Session and alias ids are 20 random octets in this encoding, giving a
//! 32 character string whose first two characters index the session store
//! buckets.

const ALPHABET: &[u8; 32] = b"ybndrfg8ejkmcpqxot1uwisza345h769";

/// Index (0..32) of a z-base-32 character, or None if the character is not
/// part of the alphabet.  Uppercase letters are accepted.
pub fn index(c: u8) -> Option<usize> {
    let c = c.to_ascii_lowercase();
    ALPHABET.iter().position(|&a| a == c)
}

/// Encode DATA in z-base-32.  DATABITS is measured in bits; pass
/// `8 * data.len()` to encode whole octets.
pub fn encode(data: &[u8], databits: usize) -> String {
    let datalen = databits.div_ceil(8);
    let data = &data[..datalen.min(data.len())];
    let mut out = Vec::with_capacity(datalen.div_ceil(5) * 8);

    for chunk in data.chunks(5) {
        let mut buf = [0u8; 5];
        buf[..chunk.len()].copy_from_slice(chunk);
        let quintets = [
            buf[0] >> 3,
            (buf[0] & 7) << 2 | buf[1] >> 6,
            (buf[1] & 63) >> 1,
            (buf[1] & 1) << 4 | buf[2] >> 4,
            (buf[2] & 15) << 1 | buf[3] >> 7,
            (buf[3] & 127) >> 2,
            (buf[3] & 3) << 3 | buf[4] >> 5,
            buf[4] & 31,
        ];
        let n = match chunk.len() {
            5 => 8,
            4 => 7,
            3 => 5,
            2 => 4,
            _ => 2,
        };
        for &q in &quintets[..n] {
            out.push(ALPHABET[q as usize]);
        }
    }

    // Strip surplus characters if DATABITS is not a multiple of 40.
    out.truncate(databits.div_ceil(5));
    String::from_utf8(out).expect("alphabet is ASCII")
}

/// Decode a z-base-32 STRING into octets.  Returns None on a character
/// outside the alphabet.
pub fn decode(string: &str) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(string.len() * 5 / 8);
    let mut acc: u32 = 0;
    let mut nbits = 0;
    for &c in string.as_bytes() {
        acc = (acc << 5) | index(c)? as u32;
        nbits += 5;
        if nbits >= 8 {
            nbits -= 8;
            out.push((acc >> nbits) as u8);
        }
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn known_vectors() {
        // Test vectors from the zb32 description.
        assert_eq!(encode(&[0x00], 1), "y");
        assert_eq!(encode(&[0x80], 1), "o");
        assert_eq!(encode(&[0x40], 2), "e");
        assert_eq!(encode(&[0xc0], 2), "a");
        assert_eq!(encode(&[0x00, 0x00], 10), "yy");
        assert_eq!(encode(&[0x80, 0x80], 10), "on");
        assert_eq!(encode(&[0x8b, 0x88, 0x80], 20), "tqre");
        assert_eq!(encode(b"f", 8), "ca");
        assert_eq!(encode(b"fo", 16), "c3zo");
        assert_eq!(encode(b"foo", 24), "c3zs6");
    }

    #[test]
    fn index_accepts_uppercase() {
        assert_eq!(index(b'y'), Some(0));
        assert_eq!(index(b'Y'), Some(0));
        assert_eq!(index(b'9'), Some(31));
        assert_eq!(index(b'v'), None);
        assert_eq!(index(b'0'), None);
    }

    #[test]
    fn session_id_shape() {
        let id = encode(&[0xff; 20], 160);
        assert_eq!(id.len(), 32);
    }

    proptest! {
        // P7: encode/decode round-trips for whole octet strings.
        #[test]
        fn prop_round_trip(data in proptest::collection::vec(any::<u8>(), 0..64)) {
            let encoded = encode(&data, 8 * data.len());
            prop_assert_eq!(decode(&encoded).unwrap(), data);
        }
    }
}
