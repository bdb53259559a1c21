use crate::codec::SliceCursor;
use crate::error::{Hdf5Error, Result, ResultExt};
use crate::file::FormatParams;
use crate::structures::*;

/// Decoder for a single link message, the record the group subsystem pulls
/// out of the fractal heap when resolving a name.

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LinkTarget {
    /// Object header address of the linked object.
    Hard { object_header_address: u64 },
    /// Path the link resolves to; interpretation is the caller's job.
    Soft { target: String },
    /// Opaque payload for user-defined and external links (type >= 64).
    UserDefined { link_type: u8, data: Vec<u8> },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LinkMessage {
    pub name: String,
    pub creation_order: Option<i64>,
    pub character_set: u8,
    pub target: LinkTarget,
}

const FLAG_NAME_WIDTH_MASK: u8 = 0x03;
const FLAG_CREATION_ORDER: u8 = 0x04;
const FLAG_LINK_TYPE: u8 = 0x08;
const FLAG_CHARACTER_SET: u8 = 0x10;

/// Decode one link record. Only version 1 exists in the format.
pub fn parse_link_message(bytes: &[u8], params: &FormatParams) -> Result<LinkMessage> {
    let mut cur = SliceCursor::new(bytes);
    let order = params.byte_order;

    let version = cur.take_u8().context("reading link message version")?;
    if version != LINK_MESSAGE_VERSION {
        return Err(Hdf5Error::UnsupportedVersion {
            what: "link message",
            found: version,
        });
    }
    let flags = cur.take_u8().context("reading link message flags")?;

    let link_type = if flags & FLAG_LINK_TYPE != 0 {
        cur.take_u8().context("reading link type")?
    } else {
        LINK_TYPE_HARD
    };

    let creation_order = if flags & FLAG_CREATION_ORDER != 0 {
        Some(cur.take_uint(8, order).context("reading creation order")? as i64)
    } else {
        None
    };

    let character_set = if flags & FLAG_CHARACTER_SET != 0 {
        cur.take_u8().context("reading character set")?
    } else {
        0 // ASCII
    };

    let name_width = 1usize << (flags & FLAG_NAME_WIDTH_MASK);
    let name_length = cur
        .take_uint(name_width, order)
        .context("reading link name length")? as usize;
    if name_length == 0 {
        return Err(Hdf5Error::invalid_input("link name length is zero"));
    }
    let name = String::from_utf8(cur.take(name_length)?.to_vec())
        .map_err(|_| Hdf5Error::invalid_input("link name is not valid UTF-8"))?;

    let target = match link_type {
        LINK_TYPE_HARD => LinkTarget::Hard {
            object_header_address: cur
                .take_uint(params.offset_size(), order)
                .context("reading hard link address")?,
        },
        LINK_TYPE_SOFT => {
            let target_length =
                cur.take_uint(2, order).context("reading soft link length")? as usize;
            if target_length == 0 {
                return Err(Hdf5Error::invalid_input("soft link target length is zero"));
            }
            let target = String::from_utf8(cur.take(target_length)?.to_vec())
                .map_err(|_| Hdf5Error::invalid_input("soft link target is not valid UTF-8"))?;
            LinkTarget::Soft { target }
        }
        t if t >= LINK_TYPE_USER_MIN => {
            let data_length = cur
                .take_uint(2, order)
                .context("reading user-defined link length")? as usize;
            LinkTarget::UserDefined {
                link_type: t,
                data: cur.take(data_length)?.to_vec(),
            }
        }
        other => {
            return Err(Hdf5Error::invalid_input(format!(
                "unknown link type {other}"
            )))
        }
    };

    Ok(LinkMessage {
        name,
        creation_order,
        character_set,
        target,
    })
}
