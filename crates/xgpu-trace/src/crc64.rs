//! CRC-64 (Jones polynomial, reflected, no final xor) used to fingerprint captured memory.
//!
//! Only used as a fast equality pre-check for memory deduplication; not a cryptographic hash.

const POLY_REFLECTED: u64 = 0x95AC_9329_AC4B_C9B5;

const CRC64_TABLE: [u64; 256] = {
    let mut table = [0u64; 256];
    let mut i = 0u64;
    while i < 256 {
        let mut crc = i;
        let mut j = 0;
        while j < 8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ POLY_REFLECTED;
            } else {
                crc >>= 1;
            }
            j += 1;
        }
        table[i as usize] = crc;
        i += 1;
    }
    table
};

/// Checksum of `data` starting from a zero state.
pub fn crc64(data: &[u8]) -> u64 {
    crc64_update(0, data)
}

/// Continue a running checksum; `crc64_update(crc64(a), b) == crc64(a ++ b)`.
pub fn crc64_update(mut crc: u64, data: &[u8]) -> u64 {
    for &b in data {
        crc = CRC64_TABLE[((crc ^ b as u64) & 0xFF) as usize] ^ (crc >> 8);
    }
    crc
}
