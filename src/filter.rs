use crate::codec::{self, ByteOrder, SliceCursor};
use crate::error::{Hdf5Error, Result, ResultExt};
use crate::structures::*;

use byteorder::ByteOrder as _;
use byteorder::LittleEndian;
use log::{debug, warn};
use std::io::Read;

/// Filter pipeline for chunked datasets: parses the filter-pipeline
/// message and undoes the filters on the read path. Filters are applied in
/// reverse of the stored order, since decompression unwinds the
/// compression stack.

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Filter {
    pub id: u16,
    pub flags: u16,
    pub name: String,
    pub client_data: Vec<u32>,
}

impl Filter {
    pub fn is_optional(&self) -> bool {
        self.flags & FILTER_FLAG_OPTIONAL != 0
    }
}

#[derive(Clone, Debug, Default)]
pub struct FilterPipeline {
    filters: Vec<Filter>,
    verify_checksums: bool,
}

/// Parse a filter-pipeline message, versions 1 and 2. Version 1 pads the
/// filter name to 8 bytes and the client data to a whole number of 8-byte
/// groups; version 2 drops the paddings and the name field.
pub fn parse_filter_pipeline(bytes: &[u8]) -> Result<FilterPipeline> {
    let mut cur = SliceCursor::new(bytes);
    let version = cur.take_u8().context("reading filter pipeline version")?;
    let nfilters = cur.take_u8().context("reading filter count")?;
    match version {
        1 => cur.skip(6),
        2 => {}
        other => {
            return Err(Hdf5Error::UnsupportedVersion {
                what: "filter pipeline message",
                found: other,
            })
        }
    }

    let mut filters = Vec::with_capacity(nfilters as usize);
    for index in 0..nfilters {
        let filter = if version == 1 {
            parse_filter_v1(&mut cur)
        } else {
            parse_filter_v2(&mut cur)
        }
        .with_context(|| format!("parsing filter {index}"))?;
        debug!(
            "pipeline filter {index}: id {} flags {:#06x} client data {:?}",
            filter.id, filter.flags, filter.client_data
        );
        filters.push(filter);
    }
    Ok(FilterPipeline {
        filters,
        verify_checksums: false,
    })
}

fn parse_filter_v1(cur: &mut SliceCursor) -> Result<Filter> {
    let id = cur.take_uint(2, ByteOrder::LittleEndian)? as u16;
    let name_length = cur.take_uint(2, ByteOrder::LittleEndian)? as usize;
    let flags = cur.take_uint(2, ByteOrder::LittleEndian)? as u16;
    let n_client = cur.take_uint(2, ByteOrder::LittleEndian)? as usize;

    let padded_name = name_length.next_multiple_of(8);
    let name_bytes = cur.take(padded_name)?;
    let raw_name = &name_bytes[..name_length.min(name_bytes.len())];
    let name_end = raw_name.iter().position(|&b| b == 0).unwrap_or(raw_name.len());
    let name = String::from_utf8_lossy(&raw_name[..name_end]).into_owned();

    let mut client_data = Vec::with_capacity(n_client);
    for _ in 0..n_client {
        client_data.push(cur.take_uint(4, ByteOrder::LittleEndian)? as u32);
    }
    if n_client % 2 == 1 {
        cur.skip(4); // pad client data to a multiple of 8 bytes
    }
    Ok(Filter {
        id,
        flags,
        name,
        client_data,
    })
}

fn parse_filter_v2(cur: &mut SliceCursor) -> Result<Filter> {
    let id = cur.take_uint(2, ByteOrder::LittleEndian)? as u16;
    let flags = cur.take_uint(2, ByteOrder::LittleEndian)? as u16;
    let n_client = cur.take_uint(2, ByteOrder::LittleEndian)? as usize;
    let mut client_data = Vec::with_capacity(n_client);
    for _ in 0..n_client {
        client_data.push(cur.take_uint(4, ByteOrder::LittleEndian)? as u32);
    }
    Ok(Filter {
        id,
        flags,
        name: String::new(),
        client_data,
    })
}

impl FilterPipeline {
    pub fn new(filters: Vec<Filter>) -> FilterPipeline {
        FilterPipeline {
            filters,
            verify_checksums: false,
        }
    }

    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Opt into Fletcher32 verification before the trailer is stripped.
    /// Off by default for compatibility with readers that only strip.
    pub fn verify_checksums(&mut self, verify: bool) -> &mut Self {
        self.verify_checksums = verify;
        self
    }

    /// Undo the pipeline on a chunk payload. Filters run in reverse of the
    /// stored order; an optional filter that fails is skipped with its
    /// input passed through unchanged.
    pub fn apply_filters(&self, data: Vec<u8>) -> Result<Vec<u8>> {
        let mut current = data;
        for filter in self.filters.iter().rev() {
            match self.apply_one(filter, &current) {
                Ok(output) => current = output,
                Err(e) if filter.is_optional() => {
                    warn!("optional filter {} failed, skipping: {e}", filter.id);
                }
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("applying filter {} to chunk", filter.id))
                }
            }
        }
        Ok(current)
    }

    fn apply_one(&self, filter: &Filter, data: &[u8]) -> Result<Vec<u8>> {
        match filter.id {
            FILTER_DEFLATE => inflate(data),
            FILTER_SHUFFLE => {
                let element_size = *filter.client_data.first().unwrap_or(&0) as usize;
                unshuffle(data, element_size)
            }
            FILTER_FLETCHER32 => self.strip_fletcher32(data),
            FILTER_SZIP | FILTER_NBIT | FILTER_SCALEOFFSET => {
                Err(Hdf5Error::UnsupportedFilter { id: filter.id })
            }
            other => Err(Hdf5Error::UnsupportedFilter { id: other }),
        }
    }

    fn strip_fletcher32(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < 4 {
            return Err(Hdf5Error::invalid_input(
                "chunk shorter than its Fletcher32 trailer",
            ));
        }
        let (body, trailer) = data.split_at(data.len() - 4);
        if self.verify_checksums {
            let stored = LittleEndian::read_u32(trailer);
            let computed = codec::fletcher32(body);
            if stored != computed {
                return Err(Hdf5Error::ChecksumMismatch {
                    address: 0,
                    stored,
                    computed,
                });
            }
        }
        Ok(body.to_vec())
    }
}

/// Raw zlib stream decode (filter ID 1).
fn inflate(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = flate2::bufread::ZlibDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(Hdf5Error::Io)
        .context("inflating deflate-compressed chunk")?;
    Ok(out)
}

/// Undo the byte-shuffle (filter ID 2): the input is `element_size`
/// contiguous planes of `len / element_size` bytes; the output interleaves
/// them back into whole elements.
fn unshuffle(data: &[u8], element_size: usize) -> Result<Vec<u8>> {
    if element_size == 0 {
        return Err(Hdf5Error::invalid_input("shuffle element size is zero"));
    }
    if data.len() % element_size != 0 {
        return Err(Hdf5Error::invalid_input(format!(
            "chunk of {} bytes is not a multiple of element size {element_size}",
            data.len()
        )));
    }
    let count = data.len() / element_size;
    let mut out = vec![0u8; data.len()];
    for j in 0..element_size {
        for i in 0..count {
            out[i * element_size + j] = data[j * count + i];
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Forward shuffle, the inverse of `unshuffle`; only tests compress.
    fn shuffle_forward(data: &[u8], element_size: usize) -> Vec<u8> {
        let count = data.len() / element_size;
        let mut out = vec![0u8; data.len()];
        for i in 0..count {
            for j in 0..element_size {
                out[j * count + i] = data[i * element_size + j];
            }
        }
        out
    }

    fn deflate_forward(data: &[u8]) -> Vec<u8> {
        use std::io::Write;
        let mut encoder =
            flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn parse_v1_message() -> Result<()> {
        // version 1, one filter: deflate, name "deflate\0", one client word.
        let mut msg = vec![1u8, 1, 0, 0, 0, 0, 0, 0];
        msg.extend_from_slice(&1u16.to_le_bytes()); // id
        msg.extend_from_slice(&8u16.to_le_bytes()); // name length
        msg.extend_from_slice(&FILTER_FLAG_OPTIONAL.to_le_bytes());
        msg.extend_from_slice(&1u16.to_le_bytes()); // client count
        msg.extend_from_slice(b"deflate\0");
        msg.extend_from_slice(&6u32.to_le_bytes());
        msg.extend_from_slice(&0u32.to_le_bytes()); // odd count pad

        let pipeline = parse_filter_pipeline(&msg)?;
        assert_eq!(pipeline.filters().len(), 1);
        let f = &pipeline.filters()[0];
        assert_eq!(f.id, FILTER_DEFLATE);
        assert_eq!(f.name, "deflate");
        assert!(f.is_optional());
        assert_eq!(f.client_data, vec![6]);
        Ok(())
    }

    #[test]
    fn parse_v2_message() -> Result<()> {
        let mut msg = vec![2u8, 2];
        msg.extend_from_slice(&FILTER_SHUFFLE.to_le_bytes());
        msg.extend_from_slice(&0u16.to_le_bytes());
        msg.extend_from_slice(&1u16.to_le_bytes());
        msg.extend_from_slice(&4u32.to_le_bytes());
        msg.extend_from_slice(&FILTER_DEFLATE.to_le_bytes());
        msg.extend_from_slice(&0u16.to_le_bytes());
        msg.extend_from_slice(&0u16.to_le_bytes());

        let pipeline = parse_filter_pipeline(&msg)?;
        assert_eq!(pipeline.filters().len(), 2);
        assert_eq!(pipeline.filters()[0].id, FILTER_SHUFFLE);
        assert_eq!(pipeline.filters()[0].client_data, vec![4]);
        assert_eq!(pipeline.filters()[1].id, FILTER_DEFLATE);
        assert!(pipeline.filters()[1].name.is_empty());
        Ok(())
    }

    #[test]
    fn unsupported_message_version() {
        assert!(matches!(
            parse_filter_pipeline(&[3, 0]).unwrap_err(),
            Hdf5Error::UnsupportedVersion { .. }
        ));
    }

    #[test]
    fn shuffle_round_trip() -> Result<()> {
        let data: Vec<u8> = (0u8..48).collect();
        let pipeline = FilterPipeline::new(vec![Filter {
            id: FILTER_SHUFFLE,
            flags: 0,
            name: String::new(),
            client_data: vec![4],
        }]);
        let shuffled = shuffle_forward(&data, 4);
        assert_ne!(shuffled, data);
        assert_eq!(pipeline.apply_filters(shuffled)?, data);
        Ok(())
    }

    #[test]
    fn shuffle_rejects_ragged_input() {
        let pipeline = FilterPipeline::new(vec![Filter {
            id: FILTER_SHUFFLE,
            flags: 0,
            name: String::new(),
            client_data: vec![8],
        }]);
        assert!(pipeline.apply_filters(vec![0u8; 12]).is_err());
    }

    #[test]
    fn deflate_round_trip() -> Result<()> {
        let data = b"chunk payload, repeated: chunk payload, chunk payload".to_vec();
        let pipeline = FilterPipeline::new(vec![Filter {
            id: FILTER_DEFLATE,
            flags: 0,
            name: String::new(),
            client_data: Vec::new(),
        }]);
        assert_eq!(pipeline.apply_filters(deflate_forward(&data))?, data);
        Ok(())
    }

    #[test]
    fn filters_apply_in_reverse_order() -> Result<()> {
        // Stored as shuffle-then-deflate; the chunk on disk is
        // deflate(shuffle(data)), so the read path inflates first.
        let data: Vec<u8> = (0u8..64).map(|i| i.wrapping_mul(37)).collect();
        let pipeline = FilterPipeline::new(vec![
            Filter {
                id: FILTER_SHUFFLE,
                flags: 0,
                name: String::new(),
                client_data: vec![8],
            },
            Filter {
                id: FILTER_DEFLATE,
                flags: 0,
                name: String::new(),
                client_data: Vec::new(),
            },
        ]);
        let stored = deflate_forward(&shuffle_forward(&data, 8));
        assert_eq!(pipeline.apply_filters(stored)?, data);
        Ok(())
    }

    #[test]
    fn optional_filter_failure_is_skipped() -> Result<()> {
        let pipeline = FilterPipeline::new(vec![Filter {
            id: FILTER_DEFLATE,
            flags: FILTER_FLAG_OPTIONAL,
            name: String::new(),
            client_data: Vec::new(),
        }]);
        // Not a zlib stream at all; the optional filter passes it through.
        let data = b"not compressed".to_vec();
        assert_eq!(pipeline.apply_filters(data.clone())?, data);
        Ok(())
    }

    #[test]
    fn required_filter_failure_propagates() {
        let pipeline = FilterPipeline::new(vec![Filter {
            id: FILTER_DEFLATE,
            flags: 0,
            name: String::new(),
            client_data: Vec::new(),
        }]);
        assert!(pipeline.apply_filters(b"junk".to_vec()).is_err());
    }

    #[test]
    fn fletcher32_strip_and_verify() -> Result<()> {
        let body = b"checksummed chunk body".to_vec();
        let checksum = codec::fletcher32(&body);
        let mut stored = body.clone();
        stored.extend_from_slice(&checksum.to_le_bytes());

        let mut pipeline = FilterPipeline::new(vec![Filter {
            id: FILTER_FLETCHER32,
            flags: 0,
            name: String::new(),
            client_data: Vec::new(),
        }]);
        // Default mode strips without verifying, even a bad trailer.
        let mut bad = body.clone();
        bad.extend_from_slice(&(checksum ^ 1).to_le_bytes());
        assert_eq!(pipeline.apply_filters(bad.clone())?, body);

        pipeline.verify_checksums(true);
        assert_eq!(pipeline.apply_filters(stored)?, body);
        assert!(pipeline.apply_filters(bad).is_err());
        Ok(())
    }

    #[test]
    fn szip_is_rejected() {
        let pipeline = FilterPipeline::new(vec![Filter {
            id: FILTER_SZIP,
            flags: 0,
            name: String::new(),
            client_data: Vec::new(),
        }]);
        let err = pipeline.apply_filters(vec![0u8; 8]).unwrap_err();
        assert!(matches!(
            err.root_cause(),
            Hdf5Error::UnsupportedFilter { id: 4 }
        ));
    }
}
