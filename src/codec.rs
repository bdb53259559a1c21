use crate::error::{Hdf5Error, Result};
use crate::structures::CHECKSUM_LEN;

use byteorder::{BigEndian, ByteOrder as _, LittleEndian};
use crc::{Crc, CRC_32_ISO_HDLC};

/// Byte order of a file's multi-byte integer fields. CRC32 trailers and the
/// v2 B-tree's internal size/count fields ignore this and stay
/// little-endian; do not "fix" that, it is the format's convention.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ByteOrder {
    LittleEndian,
    BigEndian,
}

/// Write the `width` least-significant bytes of `value` into `dest` in the
/// requested byte order. Widths 1/2/4/8 take the natural fixed-width path;
/// 3/5/6/7 are written byte by byte. Width 0 or above 8 is a caller bug.
pub fn write_uint(dest: &mut [u8], value: u64, width: usize, order: ByteOrder) {
    assert!((1..=8).contains(&width), "invalid integer width {width}");
    let dest = &mut dest[..width];
    let truncated = if width == 8 {
        value
    } else {
        value & ((1u64 << (width * 8)) - 1)
    };
    match (width, order) {
        (1, _) => dest[0] = truncated as u8,
        (2, ByteOrder::LittleEndian) => LittleEndian::write_u16(dest, truncated as u16),
        (2, ByteOrder::BigEndian) => BigEndian::write_u16(dest, truncated as u16),
        (4, ByteOrder::LittleEndian) => LittleEndian::write_u32(dest, truncated as u32),
        (4, ByteOrder::BigEndian) => BigEndian::write_u32(dest, truncated as u32),
        (8, ByteOrder::LittleEndian) => LittleEndian::write_u64(dest, truncated),
        (8, ByteOrder::BigEndian) => BigEndian::write_u64(dest, truncated),
        (_, ByteOrder::LittleEndian) => LittleEndian::write_uint(dest, truncated, width),
        (_, ByteOrder::BigEndian) => BigEndian::write_uint(dest, truncated, width),
    }
}

/// Counterpart of [`write_uint`]. Returns zero when `src` is shorter than
/// `width`, so padded tails parse as absent values rather than erroring.
pub fn read_uint(src: &[u8], width: usize, order: ByteOrder) -> u64 {
    assert!((1..=8).contains(&width), "invalid integer width {width}");
    if src.len() < width {
        return 0;
    }
    let src = &src[..width];
    match (width, order) {
        (1, _) => src[0] as u64,
        (2, ByteOrder::LittleEndian) => LittleEndian::read_u16(src) as u64,
        (2, ByteOrder::BigEndian) => BigEndian::read_u16(src) as u64,
        (4, ByteOrder::LittleEndian) => LittleEndian::read_u32(src) as u64,
        (4, ByteOrder::BigEndian) => BigEndian::read_u32(src) as u64,
        (8, ByteOrder::LittleEndian) => LittleEndian::read_u64(src),
        (8, ByteOrder::BigEndian) => BigEndian::read_u64(src),
        (_, ByteOrder::LittleEndian) => LittleEndian::read_uint(src, width),
        (_, ByteOrder::BigEndian) => BigEndian::read_uint(src, width),
    }
}

/// Append `value` at `width` bytes to a growing buffer.
pub fn push_uint(buf: &mut Vec<u8>, value: u64, width: usize, order: ByteOrder) {
    let start = buf.len();
    buf.resize(start + width, 0);
    write_uint(&mut buf[start..], value, width, order);
}

const JENKINS_INIT: u32 = 0xdead_beef;

fn jenkins_mix(a: &mut u32, b: &mut u32, c: &mut u32) {
    *a = a.wrapping_sub(*c);
    *a ^= c.rotate_left(4);
    *c = c.wrapping_add(*b);
    *b = b.wrapping_sub(*a);
    *b ^= a.rotate_left(6);
    *a = a.wrapping_add(*c);
    *c = c.wrapping_sub(*b);
    *c ^= b.rotate_left(8);
    *b = b.wrapping_add(*a);
    *a = a.wrapping_sub(*c);
    *a ^= c.rotate_left(16);
    *c = c.wrapping_add(*b);
    *b = b.wrapping_sub(*a);
    *b ^= a.rotate_left(19);
    *a = a.wrapping_add(*c);
    *c = c.wrapping_sub(*b);
    *c ^= b.rotate_left(4);
    *b = b.wrapping_add(*a);
}

fn jenkins_final(a: &mut u32, b: &mut u32, c: &mut u32) {
    *c ^= *b;
    *c = c.wrapping_sub(b.rotate_left(14));
    *a ^= *c;
    *a = a.wrapping_sub(c.rotate_left(11));
    *b ^= *a;
    *b = b.wrapping_sub(a.rotate_left(25));
    *c ^= *b;
    *c = c.wrapping_sub(b.rotate_left(16));
    *a ^= *c;
    *a = a.wrapping_sub(c.rotate_left(4));
    *b ^= *a;
    *b = b.wrapping_sub(a.rotate_left(14));
    *c ^= *b;
    *c = c.wrapping_sub(b.rotate_left(24));
}

/// Jenkins lookup3 over a byte sequence, the key space of link-name
/// B-trees. Empty input hashes to 0xdeadbeef.
pub fn jenkins_lookup3(data: &[u8]) -> u32 {
    let seed = JENKINS_INIT.wrapping_add(data.len() as u32);
    let mut a = seed;
    let mut b = seed;
    let mut c = seed;

    let mut k = data;
    while k.len() > 12 {
        a = a.wrapping_add(LittleEndian::read_u32(&k[0..4]));
        b = b.wrapping_add(LittleEndian::read_u32(&k[4..8]));
        c = c.wrapping_add(LittleEndian::read_u32(&k[8..12]));
        jenkins_mix(&mut a, &mut b, &mut c);
        k = &k[12..];
    }

    // The canonical fall-through switch over the tail length.
    let len = k.len();
    if len == 0 {
        return c;
    }
    if len >= 12 {
        c = c.wrapping_add((k[11] as u32) << 24);
    }
    if len >= 11 {
        c = c.wrapping_add((k[10] as u32) << 16);
    }
    if len >= 10 {
        c = c.wrapping_add((k[9] as u32) << 8);
    }
    if len >= 9 {
        c = c.wrapping_add(k[8] as u32);
    }
    if len >= 8 {
        b = b.wrapping_add((k[7] as u32) << 24);
    }
    if len >= 7 {
        b = b.wrapping_add((k[6] as u32) << 16);
    }
    if len >= 6 {
        b = b.wrapping_add((k[5] as u32) << 8);
    }
    if len >= 5 {
        b = b.wrapping_add(k[4] as u32);
    }
    if len >= 4 {
        a = a.wrapping_add((k[3] as u32) << 24);
    }
    if len >= 3 {
        a = a.wrapping_add((k[2] as u32) << 16);
    }
    if len >= 2 {
        a = a.wrapping_add((k[1] as u32) << 8);
    }
    a = a.wrapping_add(k[0] as u32);

    jenkins_final(&mut a, &mut b, &mut c);
    c
}

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// IEEE CRC32 (polynomial 0xEDB88320) over a byte range.
pub fn checksum_bytes(data: &[u8]) -> u32 {
    CRC32.checksum(data)
}

/// Checksum the buffer and append the 4-byte little-endian trailer. This is
/// the HDF5 checksum convention regardless of file byte order.
pub fn append_checksum(buf: &mut Vec<u8>) {
    let cs = checksum_bytes(buf);
    buf.extend_from_slice(&cs.to_le_bytes());
}

/// Split `data` into body + trailing CRC32, verify, and return the body.
/// `address` only feeds the error report.
pub fn verify_trailing_checksum(data: &[u8], address: u64) -> Result<&[u8]> {
    if data.len() < CHECKSUM_LEN {
        return Err(Hdf5Error::invalid_input(
            "buffer too short to carry a checksum trailer",
        ));
    }
    let (body, trailer) = data.split_at(data.len() - CHECKSUM_LEN);
    let stored = LittleEndian::read_u32(trailer);
    let computed = checksum_bytes(body);
    if stored != computed {
        return Err(Hdf5Error::ChecksumMismatch {
            address,
            stored,
            computed,
        });
    }
    Ok(body)
}

/// Fletcher checksum over 16-bit words, the variant used by the Fletcher32
/// chunk filter. Only consulted when checksum verification is opted into.
pub fn fletcher32(data: &[u8]) -> u32 {
    let mut sum1: u32 = 0;
    let mut sum2: u32 = 0;

    let mut words = data.chunks_exact(2);
    let mut remaining = data.len() / 2;
    while remaining > 0 {
        let batch = remaining.min(360);
        for _ in 0..batch {
            let w = words.next().expect("word count tracked");
            sum1 = sum1.wrapping_add(((w[0] as u32) << 8) | w[1] as u32);
            sum2 = sum2.wrapping_add(sum1);
        }
        remaining -= batch;
        sum1 = (sum1 & 0xffff) + (sum1 >> 16);
        sum2 = (sum2 & 0xffff) + (sum2 >> 16);
    }

    if data.len() % 2 == 1 {
        sum1 = sum1.wrapping_add((data[data.len() - 1] as u32) << 8);
        sum2 = sum2.wrapping_add(sum1);
        sum1 = (sum1 & 0xffff) + (sum1 >> 16);
        sum2 = (sum2 & 0xffff) + (sum2 >> 16);
    }

    sum1 = (sum1 & 0xffff) + (sum1 >> 16);
    sum2 = (sum2 & 0xffff) + (sum2 >> 16);
    (sum2 << 16) | sum1
}

/// Overflow-checked multiply for chunk/attribute/hyperslab sizing. These
/// products size allocations, so wrap-around is a security problem, not a
/// math curiosity.
pub fn safe_multiply(a: u64, b: u64) -> Result<u64> {
    a.checked_mul(b)
        .ok_or_else(|| Hdf5Error::Overflow(format!("{a} * {b} exceeds u64")))
}

pub fn safe_add(a: u64, b: u64) -> Result<u64> {
    a.checked_add(b)
        .ok_or_else(|| Hdf5Error::Overflow(format!("{a} + {b} exceeds u64")))
}

/// Total byte size of a chunk: element size times every dimension extent.
/// Zero factors are rejected; a zero-sized chunk is always a caller error.
pub fn checked_chunk_size(dims: &[u64], element_size: u64) -> Result<u64> {
    if element_size == 0 {
        return Err(Hdf5Error::invalid_input("chunk element size is zero"));
    }
    let mut total = element_size;
    for (i, &d) in dims.iter().enumerate() {
        if d == 0 {
            return Err(Hdf5Error::invalid_input(format!(
                "chunk dimension {i} is zero"
            )));
        }
        total = safe_multiply(total, d)?;
    }
    Ok(total)
}

/// Forward-only cursor over a byte slice, for message parsers that walk
/// variable-width fields.
pub struct SliceCursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> SliceCursor<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        SliceCursor { data, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(Hdf5Error::invalid_input(format!(
                "truncated message: wanted {n} bytes at offset {}, have {}",
                self.pos,
                self.remaining()
            )));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn take_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn take_uint(&mut self, width: usize, order: ByteOrder) -> Result<u64> {
        Ok(read_uint(self.take(width)?, width, order))
    }

    /// Skip `n` bytes of padding; short input is tolerated so v1 filter
    /// messages with trimmed trailing pads still parse.
    pub fn skip(&mut self, n: usize) {
        self.pos = (self.pos + n).min(self.data.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uint_round_trips_at_every_width() {
        let value = 0x0102_0304_0506_0708u64;
        for width in 1..=8usize {
            for order in [ByteOrder::LittleEndian, ByteOrder::BigEndian] {
                let mut buf = [0u8; 8];
                write_uint(&mut buf, value, width, order);
                let mask = if width == 8 {
                    u64::MAX
                } else {
                    (1u64 << (width * 8)) - 1
                };
                assert_eq!(read_uint(&buf, width, order), value & mask);
            }
        }
    }

    #[test]
    fn odd_widths_write_low_bytes_in_order() {
        let mut buf = [0u8; 3];
        write_uint(&mut buf, 0xaabbccdd, 3, ByteOrder::LittleEndian);
        assert_eq!(buf, [0xdd, 0xcc, 0xbb]);
        write_uint(&mut buf, 0xaabbccdd, 3, ByteOrder::BigEndian);
        assert_eq!(buf, [0xbb, 0xcc, 0xdd]);
    }

    #[test]
    fn short_source_reads_as_zero() {
        assert_eq!(read_uint(&[0xff, 0xff], 4, ByteOrder::LittleEndian), 0);
        assert_eq!(read_uint(&[], 1, ByteOrder::LittleEndian), 0);
    }

    #[test]
    #[should_panic(expected = "invalid integer width")]
    fn zero_width_is_rejected() {
        let mut buf = [0u8; 8];
        write_uint(&mut buf, 1, 0, ByteOrder::LittleEndian);
    }

    #[test]
    fn jenkins_empty_input_is_the_seed() {
        assert_eq!(jenkins_lookup3(b""), 0xdead_beef);
    }

    #[test]
    fn jenkins_is_deterministic_and_length_sensitive() {
        assert_eq!(jenkins_lookup3(b"link1"), jenkins_lookup3(b"link1"));
        assert_ne!(jenkins_lookup3(b"link1"), jenkins_lookup3(b"link2"));
        // Tail lengths exercise every arm of the final switch.
        let data: Vec<u8> = (0u8..64).collect();
        let mut seen = std::collections::HashSet::new();
        for len in 0..=data.len() {
            seen.insert(jenkins_lookup3(&data[..len]));
        }
        assert_eq!(seen.len(), data.len() + 1);
    }

    #[test]
    fn crc32_known_vector() {
        // The classic IEEE check value.
        assert_eq!(checksum_bytes(b"123456789"), 0xcbf4_3926);
    }

    #[test]
    fn checksum_trailer_round_trip() {
        let mut buf = b"BTHD body bytes".to_vec();
        append_checksum(&mut buf);
        let body = verify_trailing_checksum(&buf, 0x1000).unwrap();
        assert_eq!(body, b"BTHD body bytes");

        buf[3] ^= 0xff;
        let err = verify_trailing_checksum(&buf, 0x1000).unwrap_err();
        assert!(matches!(err, Hdf5Error::ChecksumMismatch { address: 0x1000, .. }));
    }

    #[test]
    fn fletcher32_accepts_odd_lengths() {
        // Self-consistency plus sensitivity; the filter only ever compares
        // two runs of this same function.
        assert_ne!(fletcher32(b"abcde"), fletcher32(b"abcdf"));
        assert_ne!(fletcher32(b"abcd"), fletcher32(b"abcde"));
        assert_eq!(fletcher32(b""), 0);
    }

    #[test]
    fn overflow_guards() {
        assert!(safe_multiply(u64::MAX, 2).is_err());
        assert!(safe_multiply(1 << 32, 1 << 32).is_err());
        assert_eq!(safe_multiply(1 << 31, 1 << 31).unwrap(), 1 << 62);
        assert!(safe_add(u64::MAX, 1).is_err());
    }

    #[test]
    fn chunk_size_rejects_zero_factors() {
        assert!(checked_chunk_size(&[10, 0], 8).is_err());
        assert!(checked_chunk_size(&[10, 10], 0).is_err());
        assert_eq!(checked_chunk_size(&[10, 10], 8).unwrap(), 800);
    }

    #[test]
    fn cursor_reports_truncation() {
        let mut cur = SliceCursor::new(&[1, 2, 3]);
        assert_eq!(cur.take_u8().unwrap(), 1);
        assert_eq!(cur.take_uint(2, ByteOrder::LittleEndian).unwrap(), 0x0302);
        assert!(cur.take(1).is_err());
    }
}
