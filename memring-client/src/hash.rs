// hash.rs - Key hashing for the routers
//
// FNV-1a and Ketama feed the consistent-hash ring; the CRC32 fold selects
// vbuckets. All functions are pure and stable across processes.

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// 32-bit FNV-1a.
pub fn fnv1a_32(data: &[u8]) -> u32 {
    let mut hash = FNV_OFFSET_BASIS;
    for &byte in data {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Four ring points from one MD5 digest, each read little-endian.
pub fn ketama_points(data: &[u8]) -> [u32; 4] {
    let digest = md5::compute(data);
    let mut points = [0u32; 4];
    for (i, chunk) in digest.0.chunks_exact(4).enumerate() {
        points[i] = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
    points
}

/// Ketama key hash: the first point of the key's digest.
pub fn ketama_hash(data: &[u8]) -> u32 {
    ketama_points(data)[0]
}

/// CRC32 folded to 15 bits, the vbucket key hash.
pub fn vbucket_hash(key: &[u8]) -> u32 {
    (crc32fast::hash(key) >> 16) & 0x7fff
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fnv1a_reference_values() {
        assert_eq!(fnv1a_32(b""), 0x811c_9dc5);
        assert_eq!(fnv1a_32(b"a"), 0xe40c_292c);
        assert_eq!(fnv1a_32(b"foobar"), 0xbf9c_f968);
    }

    #[test]
    fn ketama_splits_digest_little_endian() {
        // md5("") = d41d8cd98f00b204e9800998ecf8427e
        let points = ketama_points(b"");
        assert_eq!(points[0], 0xd98c_1dd4);
        assert_eq!(points[3], 0x7e42_f8ec);
        assert_eq!(ketama_hash(b""), points[0]);
    }

    #[test]
    fn vbucket_hash_fits_fifteen_bits() {
        for key in [&b"foo"[..], b"", b"a much longer key with spaces"] {
            assert!(vbucket_hash(key) <= 0x7fff);
        }
        assert_eq!(vbucket_hash(b"foo"), (crc32fast::hash(b"foo") >> 16) & 0x7fff);
    }
}
