//! NI container envelope, the outer wrapper of Kontakt 5+ presets.
//!
//! A container is a tree of UUID-identified items. Every item carries a
//! linked list of typed data chunks and a list of child items; `SubTreeItem`
//! chunks embed a further full container item, so traversal recurses through
//! both axes with a depth cap against malicious inputs.

use binrw::io::{Cursor, Read, Seek, Write};
use binrw::{BinRead, BinResult, BinWrite};
use num_enum::{FromPrimitive, IntoPrimitive};

use crate::strings::{expect_tag, read_bytes, read_utf16_prefixed, write_utf16_prefixed};
use crate::Summarizable;

/// Recursion bound across child items and sub-tree chunks.
const MAX_DEPTH: u32 = 32;

/// Known data chunk types.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, IntoPrimitive, FromPrimitive)]
#[repr(u32)]
#[allow(missing_docs)]
pub enum NiChunkType {
    Terminator = 1,
    BniPreset = 3,
    AuthoringApplication = 101,
    EncryptedData = 106,
    Authorization = 110,
    SoundinfoItem = 112,
    PresetChunkItem = 115,
    SubTreeItem = 121,
    #[num_enum(catch_all)]
    Unknown(u32) = 0xFFFF_FFFF,
}

/// Application that authored a container, from the AuthoringApplication
/// chunk.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, IntoPrimitive, FromPrimitive)]
#[repr(u32)]
#[allow(missing_docs)]
pub enum AuthoringApplication {
    GuitarRig = 1,
    Kore = 2,
    Kontakt = 3,
    Reaktor = 7,
    Maschine = 8,
    Battery = 12,
    #[num_enum(catch_all)]
    Unknown(u32) = 0xFFFF_FFFF,
}

/// Typed payload of one data chunk.
#[derive(Debug, Clone, PartialEq)]
pub enum NiChunkPayload {
    /// Which application wrote the container, and its version string.
    AuthoringApplication {
        /// Raw application id; see [`AuthoringApplication`].
        application: u32,
        /// Human readable version, e.g. "5.3.0".
        version: String,
    },
    /// The Kontakt preset chunk tree, kept as bytes for the codec layer.
    PresetChunkItem {
        /// Serialized preset chunks.
        bytes: Vec<u8>,
    },
    /// Sound-info metadata, opaque.
    SoundinfoItem {
        /// Verbatim payload.
        bytes: Vec<u8>,
    },
    /// Authorization record; a non-empty serial-PID list marks encrypted
    /// content.
    Authorization {
        /// Protection level as stored.
        level: u32,
        /// Serial PIDs of the protecting products.
        serial_pids: Vec<String>,
    },
    /// A full embedded container item.
    SubTreeItem {
        /// The embedded item.
        item: Box<NiContainerItem>,
    },
    /// Encrypted payload, opaque.
    EncryptedData {
        /// Verbatim payload.
        bytes: Vec<u8>,
    },
    /// Browser preset blob, opaque.
    BniPreset {
        /// Verbatim payload.
        bytes: Vec<u8>,
    },
    /// Anything else, preserved verbatim.
    Raw {
        /// Verbatim payload.
        bytes: Vec<u8>,
    },
}

/// One node of an item's data chunk list.
#[derive(Debug, Clone, PartialEq)]
pub struct NiDataChunk {
    /// Raw chunk type; see [`NiChunkType`].
    pub chunk_type: u32,
    /// Parsed payload.
    pub payload: NiChunkPayload,
}

impl NiDataChunk {
    /// The typed chunk type.
    pub fn chunk_type(&self) -> NiChunkType {
        NiChunkType::from(self.chunk_type)
    }
}

/// One UUID-identified item of an NI container.
#[derive(Debug, Clone, PartialEq)]
pub struct NiContainerItem {
    /// Header version, always 1 in supported files.
    pub header_version: u32,
    /// Unused header field, preserved.
    pub unused: u32,
    /// Header flags, preserved.
    pub flags: u32,
    /// Item UUID.
    pub uuid: [u8; 16],
    /// Data chunks in list order; never empty (a terminator closes the
    /// list).
    pub chunks: Vec<NiDataChunk>,
    /// Item version field following the data chunks.
    pub item_version: u32,
    /// Child items.
    pub children: Vec<NiContainerItem>,
}

impl NiContainerItem {
    /// Read a container item, including all children and sub-trees.
    pub fn read<R: Read + Seek>(reader: &mut R) -> BinResult<Self> {
        Self::read_at_depth(reader, 0)
    }

    fn read_at_depth<R: Read + Seek>(reader: &mut R, depth: u32) -> BinResult<Self> {
        let start = reader.stream_position()?;
        if depth > MAX_DEPTH {
            return Err(binrw::Error::Custom {
                pos: start,
                err: Box::new(format!("container nesting deeper than {MAX_DEPTH}")),
            });
        }
        let total_length = u64::read_le(reader)?;
        let header_version = u32::read_le(reader)?;
        if header_version != 1 {
            return Err(binrw::Error::Custom {
                pos: start + 8,
                err: Box::new(format!(
                    "unsupported container header version {header_version}"
                )),
            });
        }
        expect_tag(reader, b"hsin")?;
        let unused = u32::read_le(reader)?;
        let flags = u32::read_le(reader)?;
        let mut uuid = [0u8; 16];
        reader.read_exact(&mut uuid)?;

        let chunks = read_chunk_list(reader, depth)?;

        let item_version = u32::read_le(reader)?;
        let num_children = u32::read_le(reader)?;
        let mut children = Vec::with_capacity(num_children as usize);
        for _ in 0..num_children {
            children.push(NiContainerItem::read_at_depth(reader, depth + 1)?);
        }

        let consumed = reader.stream_position()? - start;
        if consumed != total_length {
            return Err(binrw::Error::Custom {
                pos: start,
                err: Box::new(format!(
                    "container item length {total_length} but {consumed} bytes parsed"
                )),
            });
        }
        Ok(NiContainerItem {
            header_version,
            unused,
            flags,
            uuid,
            chunks,
            item_version,
            children,
        })
    }

    /// Serialize the item, recomputing all lengths and link offsets.
    pub fn write<W: Write + Seek>(&self, writer: &mut W) -> BinResult<()> {
        let body = self.body_bytes()?;
        ((body.len() + 8) as u64).write_le(writer)?;
        writer.write_all(&body)?;
        Ok(())
    }

    /// Serialize to a standalone byte vector.
    pub fn to_bytes(&self) -> BinResult<Vec<u8>> {
        let mut cursor = Cursor::new(Vec::new());
        self.write(&mut cursor)?;
        Ok(cursor.into_inner())
    }

    fn body_bytes(&self) -> BinResult<Vec<u8>> {
        let mut cursor = Cursor::new(Vec::new());
        self.header_version.write_le(&mut cursor)?;
        cursor.write_all(b"hsin")?;
        self.unused.write_le(&mut cursor)?;
        self.flags.write_le(&mut cursor)?;
        cursor.write_all(&self.uuid)?;
        write_chunk_list(&self.chunks, &mut cursor)?;
        self.item_version.write_le(&mut cursor)?;
        (self.children.len() as u32).write_le(&mut cursor)?;
        for child in &self.children {
            child.write(&mut cursor)?;
        }
        Ok(cursor.into_inner())
    }

    /// Depth-first search for the first chunk of `wanted` type, recursing
    /// into sub-tree items before descending into child items.
    pub fn find(&self, wanted: NiChunkType) -> Option<&NiDataChunk> {
        for chunk in &self.chunks {
            if chunk.chunk_type() == wanted {
                return Some(chunk);
            }
            if let NiChunkPayload::SubTreeItem { item } = &chunk.payload {
                if let Some(found) = item.find(wanted) {
                    return Some(found);
                }
            }
        }
        for child in &self.children {
            if let Some(found) = child.find(wanted) {
                return Some(found);
            }
        }
        None
    }

    /// Like [`NiContainerItem::find`], but collects every match.
    pub fn find_all(&self, wanted: NiChunkType) -> Vec<&NiDataChunk> {
        let mut found = Vec::new();
        self.collect(wanted, &mut found);
        found
    }

    fn collect<'a>(&'a self, wanted: NiChunkType, found: &mut Vec<&'a NiDataChunk>) {
        for chunk in &self.chunks {
            if chunk.chunk_type() == wanted {
                found.push(chunk);
            }
            if let NiChunkPayload::SubTreeItem { item } = &chunk.payload {
                item.collect(wanted, found);
            }
        }
        for child in &self.children {
            child.collect(wanted, found);
        }
    }

    /// Item descriptions of every authorization chunk carrying a non-empty
    /// serial-PID list. Non-empty result means parts of the container are
    /// encrypted.
    pub fn protected_items(&self) -> Vec<String> {
        self.find_all(NiChunkType::Authorization)
            .into_iter()
            .filter_map(|chunk| {
                if let NiChunkPayload::Authorization { serial_pids, .. } = &chunk.payload {
                    if !serial_pids.is_empty() {
                        return Some(serial_pids.join(", "));
                    }
                }
                None
            })
            .collect()
    }

    /// The authoring application and version, when recorded.
    pub fn authoring_application(&self) -> Option<(AuthoringApplication, String)> {
        if let NiChunkPayload::AuthoringApplication {
            application,
            version,
        } = &self.find(NiChunkType::AuthoringApplication)?.payload
        {
            Some((AuthoringApplication::from(*application), version.clone()))
        } else {
            None
        }
    }
}

impl Summarizable for NiContainerItem {
    fn summary(&self) -> String {
        format!(
            "container item v{}, {} chunks, {} children",
            self.item_version,
            self.chunks.len(),
            self.children.len()
        )
    }

    fn name(&self) -> String {
        "NIContainerItem".to_string()
    }
}

fn read_chunk_list<R: Read + Seek>(reader: &mut R, depth: u32) -> BinResult<Vec<NiDataChunk>> {
    let mut chunks = Vec::new();
    loop {
        let chunk_type = u32::read_le(reader)?;
        let length = u32::read_le(reader)? as usize;
        let data = read_bytes(reader, length)?;
        let next_offset = u32::read_le(reader)?;
        chunks.push(NiDataChunk {
            chunk_type,
            payload: parse_chunk_payload(chunk_type, &data, depth)?,
        });
        if next_offset == 0 {
            return Ok(chunks);
        }
    }
}

fn write_chunk_list<W: Write + Seek>(chunks: &[NiDataChunk], writer: &mut W) -> BinResult<()> {
    for (index, chunk) in chunks.iter().enumerate() {
        let data = chunk_payload_bytes(&chunk.payload)?;
        chunk.chunk_type.write_le(writer)?;
        (data.len() as u32).write_le(writer)?;
        writer.write_all(&data)?;
        // link field: header + payload + link of the next node, 0 closes
        let next_offset = if index + 1 == chunks.len() {
            0
        } else {
            12 + data.len() as u32
        };
        next_offset.write_le(writer)?;
    }
    Ok(())
}

fn parse_chunk_payload(chunk_type: u32, data: &[u8], depth: u32) -> BinResult<NiChunkPayload> {
    let mut cursor = Cursor::new(data);
    Ok(match NiChunkType::from(chunk_type) {
        NiChunkType::AuthoringApplication => {
            let application = u32::read_le(&mut cursor)?;
            let version = read_utf16_prefixed(&mut cursor)?;
            NiChunkPayload::AuthoringApplication {
                application,
                version,
            }
        }
        NiChunkType::Authorization => {
            let level = u32::read_le(&mut cursor)?;
            let count = u32::read_le(&mut cursor)?;
            let mut serial_pids = Vec::with_capacity(count as usize);
            for _ in 0..count {
                serial_pids.push(read_utf16_prefixed(&mut cursor)?);
            }
            NiChunkPayload::Authorization { level, serial_pids }
        }
        NiChunkType::SubTreeItem => NiChunkPayload::SubTreeItem {
            item: Box::new(NiContainerItem::read_at_depth(&mut cursor, depth + 1)?),
        },
        NiChunkType::PresetChunkItem => NiChunkPayload::PresetChunkItem {
            bytes: data.to_vec(),
        },
        NiChunkType::SoundinfoItem => NiChunkPayload::SoundinfoItem {
            bytes: data.to_vec(),
        },
        NiChunkType::EncryptedData => NiChunkPayload::EncryptedData {
            bytes: data.to_vec(),
        },
        NiChunkType::BniPreset => NiChunkPayload::BniPreset {
            bytes: data.to_vec(),
        },
        NiChunkType::Terminator | NiChunkType::Unknown(_) => NiChunkPayload::Raw {
            bytes: data.to_vec(),
        },
    })
}

fn chunk_payload_bytes(payload: &NiChunkPayload) -> BinResult<Vec<u8>> {
    let mut cursor = Cursor::new(Vec::new());
    match payload {
        NiChunkPayload::AuthoringApplication {
            application,
            version,
        } => {
            application.write_le(&mut cursor)?;
            write_utf16_prefixed(&mut cursor, version)?;
        }
        NiChunkPayload::Authorization { level, serial_pids } => {
            level.write_le(&mut cursor)?;
            (serial_pids.len() as u32).write_le(&mut cursor)?;
            for pid in serial_pids {
                write_utf16_prefixed(&mut cursor, pid)?;
            }
        }
        NiChunkPayload::SubTreeItem { item } => item.write(&mut cursor)?,
        NiChunkPayload::PresetChunkItem { bytes }
        | NiChunkPayload::SoundinfoItem { bytes }
        | NiChunkPayload::EncryptedData { bytes }
        | NiChunkPayload::BniPreset { bytes }
        | NiChunkPayload::Raw { bytes } => cursor.write_all(bytes)?,
    }
    Ok(cursor.into_inner())
}

#[allow(clippy::dbg_macro)]
#[cfg(test)]
mod test {
    use super::*;

    pub(crate) fn leaf_item(uuid_seed: u8, chunks: Vec<NiDataChunk>) -> NiContainerItem {
        NiContainerItem {
            header_version: 1,
            unused: 0,
            flags: 0,
            uuid: [uuid_seed; 16],
            chunks,
            item_version: 1,
            children: Vec::new(),
        }
    }

    fn terminator() -> NiDataChunk {
        NiDataChunk {
            chunk_type: NiChunkType::Terminator.into(),
            payload: NiChunkPayload::Raw { bytes: Vec::new() },
        }
    }

    #[test]
    fn item_roundtrip() {
        let item = leaf_item(
            7,
            vec![
                NiDataChunk {
                    chunk_type: NiChunkType::AuthoringApplication.into(),
                    payload: NiChunkPayload::AuthoringApplication {
                        application: AuthoringApplication::Kontakt.into(),
                        version: "6.8.0".to_string(),
                    },
                },
                terminator(),
            ],
        );
        let bytes = item.to_bytes().expect("serialize item");
        let back =
            NiContainerItem::read(&mut Cursor::new(&bytes[..])).expect("parse item");
        assert_eq!(back, item);
        assert_eq!(back.to_bytes().expect("re-serialize"), bytes);
        let (app, version) = back.authoring_application().expect("app chunk");
        assert_eq!(app, AuthoringApplication::Kontakt);
        assert_eq!(version, "6.8.0");
    }

    #[test]
    fn find_recurses_into_subtrees() {
        let inner = leaf_item(
            2,
            vec![
                NiDataChunk {
                    chunk_type: NiChunkType::PresetChunkItem.into(),
                    payload: NiChunkPayload::PresetChunkItem {
                        bytes: vec![1, 2, 3],
                    },
                },
                terminator(),
            ],
        );
        let outer = leaf_item(
            1,
            vec![
                NiDataChunk {
                    chunk_type: NiChunkType::SubTreeItem.into(),
                    payload: NiChunkPayload::SubTreeItem {
                        item: Box::new(inner),
                    },
                },
                terminator(),
            ],
        );
        let found = outer
            .find(NiChunkType::PresetChunkItem)
            .expect("preset chunk inside subtree");
        let NiChunkPayload::PresetChunkItem { bytes } = &found.payload else {
            panic!("wrong payload");
        };
        assert_eq!(bytes, &vec![1, 2, 3]);
        assert_eq!(outer.find_all(NiChunkType::PresetChunkItem).len(), 1);
    }

    #[test]
    fn authorization_detection() {
        let protected = leaf_item(
            3,
            vec![
                NiDataChunk {
                    chunk_type: NiChunkType::Authorization.into(),
                    payload: NiChunkPayload::Authorization {
                        level: 2,
                        serial_pids: vec!["ABC-123".to_string()],
                    },
                },
                terminator(),
            ],
        );
        assert_eq!(protected.protected_items(), vec!["ABC-123".to_string()]);

        let open = leaf_item(
            4,
            vec![
                NiDataChunk {
                    chunk_type: NiChunkType::Authorization.into(),
                    payload: NiChunkPayload::Authorization {
                        level: 0,
                        serial_pids: Vec::new(),
                    },
                },
                terminator(),
            ],
        );
        assert!(open.protected_items().is_empty());
    }

    #[test]
    fn wrong_header_version_rejected() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&100u64.to_le_bytes());
        bytes.extend_from_slice(&2u32.to_le_bytes()); // header version 2
        bytes.extend_from_slice(b"hsin");
        bytes.extend_from_slice(&[0u8; 64]);
        let err = NiContainerItem::read(&mut Cursor::new(&bytes[..]))
            .expect_err("header version 2 must fail");
        let formatted = crate::FormatError::from(err).to_string();
        assert!(formatted.contains("header version"), "{formatted}");
    }
}
