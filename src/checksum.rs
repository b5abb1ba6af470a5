//! Range checksums for rchecksum.
//!
//! The weak checksum is the rsync rolling sum; the strong one is MD5.

use md5::Digest;
use md5::Md5;

/// The rsync weak rolling checksum of `data`.
pub fn weak_checksum(data: &[u8]) -> u32 {
    let mut a: u32 = 0;
    let mut b: u32 = 0;
    let len = data.len() as u32;
    for (i, &byte) in data.iter().enumerate() {
        a = a.wrapping_add(byte as u32);
        b = b.wrapping_add((len - i as u32).wrapping_mul(byte as u32));
    }
    (a & 0xffff) | (b << 16)
}

/// The MD5 digest of `data`.
pub fn strong_checksum(data: &[u8]) -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update(data);
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weak_checksum_is_order_sensitive() {
        assert_eq!(weak_checksum(&[]), 0);
        assert_ne!(weak_checksum(b"ab"), weak_checksum(b"ba"));
        // stable across calls
        assert_eq!(weak_checksum(b"rsync"), weak_checksum(b"rsync"));
    }

    #[test]
    fn strong_checksum_matches_known_md5() {
        // md5("abc")
        let expected = [
            0x90, 0x01, 0x50, 0x98, 0x3c, 0xd2, 0x4f, 0xb0, 0xd6, 0x96, 0x3f,
            0x7d, 0x28, 0xe1, 0x7f, 0x72,
        ];
        assert_eq!(strong_checksum(b"abc"), expected);
    }
}
