//! Kontakt preset chunk tree.
//!
//! A preset is a recursive record: `u16 id`, `u32 size`, `size` payload
//! bytes. Structured payloads carry a version, a private segment (opaque
//! here), a public segment (consumed by the owning entity's parser) and a
//! concatenation of child chunks. A handful of collection ids use their own
//! payload shapes. Everything unrecognised is kept as verbatim bytes so a
//! read-then-write pass reproduces the input.

use binrw::io::{Cursor, Read, Seek, Write};
use binrw::{BinRead, BinResult, BinWrite};
use tracing::trace;

use crate::strings::read_bytes;
use crate::Summarizable;

/// Known chunk ids.
pub mod id {
    /// Modulator base parameters.
    pub const PAR_MOD_BASE: u16 = 0x00;
    /// Instrument bank.
    pub const BANK: u16 = 0x03;
    /// A group of zones.
    pub const GROUP: u16 = 0x04;
    /// Script parameters.
    pub const PAR_SCRIPT: u16 = 0x06;
    /// Internal modulator (envelope / LFO).
    pub const PAR_INTERNAL_MOD: u16 = 0x0D;
    /// One instrument program.
    pub const PROGRAM: u16 = 0x28;
    /// Container of programs inside a bank.
    pub const PROGRAM_CONTAINER: u16 = 0x29;
    /// One sample zone.
    pub const ZONE: u16 = 0x2C;
    /// Voice group table.
    pub const VOICE_GROUPS: u16 = 0x32;
    /// List of groups; count-prefixed headerless children.
    pub const GROUP_LIST: u16 = 0x33;
    /// List of zones; children carry a u32 reference.
    pub const ZONE_LIST: u16 = 0x34;
    /// Bank slot list.
    pub const SLOT_LIST: u16 = 0x37;
    /// Loop records of a zone.
    pub const LOOP_ARRAY: u16 = 0x39;
    /// Fixed 16 slot parameter array.
    pub const PARAMETER_ARRAY_16: u16 = 0x3B;
    /// Sample path table.
    pub const FILENAME_LIST: u16 = 0x3D;
    /// Insert effect bus.
    pub const INSERT_BUS: u16 = 0x45;
    /// Persisted UI settings.
    pub const SAVE_SETTINGS: u16 = 0x47;
    /// Sample path table, later revision.
    pub const FILENAME_LIST_EX: u16 = 0x4B;
    /// Quick-browse metadata.
    pub const QUICK_BROWSE: u16 = 0x4E;

    /// Printable name for diagnostics.
    pub fn name(id: u16) -> &'static str {
        match id {
            PAR_MOD_BASE => "PAR_MOD_BASE",
            BANK => "BANK",
            GROUP => "GROUP",
            PAR_SCRIPT => "PAR_SCRIPT",
            PAR_INTERNAL_MOD => "PAR_INTERNAL_MOD",
            PROGRAM => "PROGRAM",
            PROGRAM_CONTAINER => "PROGRAM_CONTAINER",
            ZONE => "ZONE",
            VOICE_GROUPS => "VOICE_GROUPS",
            GROUP_LIST => "GROUP_LIST",
            ZONE_LIST => "ZONE_LIST",
            SLOT_LIST => "SLOT_LIST",
            LOOP_ARRAY => "LOOP_ARRAY",
            PARAMETER_ARRAY_16 => "PARAMETER_ARRAY_16",
            FILENAME_LIST => "FILENAME_LIST",
            INSERT_BUS => "INSERT_BUS",
            SAVE_SETTINGS => "SAVE_SETTINGS",
            FILENAME_LIST_EX => "FILENAME_LIST_EX",
            QUICK_BROWSE => "QUICK_BROWSE",
            _ => "UNKNOWN",
        }
    }

    /// True when the id is in the known table.
    pub fn is_known(id: u16) -> bool {
        name(id) != "UNKNOWN"
    }
}

/// The inner record of a structured chunk or list entry.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StructureData {
    /// Structure version; selects field layout in the public data.
    pub version: u16,
    /// Private segment, opaque at this layer.
    pub private_data: Vec<u8>,
    /// Public segment, consumed by the owning entity's parser.
    pub public_data: Vec<u8>,
    /// Child chunks in wire order.
    pub children: Vec<PresetChunk>,
}

impl StructureData {
    fn read(cursor: &mut Cursor<&[u8]>) -> BinResult<Self> {
        let version = u16::read_le(cursor)?;
        let priv_len = u32::read_le(cursor)? as usize;
        let private_data = read_bytes(cursor, priv_len)?;
        let pub_len = u32::read_le(cursor)? as usize;
        let public_data = read_bytes(cursor, pub_len)?;
        let children_len = u32::read_le(cursor)? as usize;
        let child_bytes = read_bytes(cursor, children_len)?;
        let children = PresetChunk::read_all(&child_bytes)?;
        Ok(StructureData {
            version,
            private_data,
            public_data,
            children,
        })
    }

    fn write<W: Write + Seek>(&self, writer: &mut W) -> BinResult<()> {
        self.version.write_le(writer)?;
        (self.private_data.len() as u32).write_le(writer)?;
        writer.write_all(&self.private_data)?;
        (self.public_data.len() as u32).write_le(writer)?;
        writer.write_all(&self.public_data)?;
        let mut child_bytes = Cursor::new(Vec::new());
        for child in &self.children {
            child.write(&mut child_bytes)?;
        }
        let child_bytes = child_bytes.into_inner();
        (child_bytes.len() as u32).write_le(writer)?;
        writer.write_all(&child_bytes)?;
        Ok(())
    }

    /// First direct child with the given id.
    pub fn find_child(&self, child_id: u16) -> Option<&PresetChunk> {
        self.children.iter().find(|c| c.id == child_id)
    }

    /// Mutable access to the first direct child with the given id.
    pub fn find_child_mut(&mut self, child_id: u16) -> Option<&mut PresetChunk> {
        self.children.iter_mut().find(|c| c.id == child_id)
    }
}

/// One entry of a `GROUP_LIST` / `ZONE_LIST` collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListEntry {
    /// Synthetic id preceding `ZONE_LIST` entries; `None` in group lists.
    pub reference: Option<u32>,
    /// The headerless inner structure.
    pub structure: StructureData,
}

/// Payload of a [`PresetChunk`], dispatched on the chunk id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkPayload {
    /// Versioned private/public/children record.
    Structured(StructureData),
    /// Count-prefixed headerless entries (`GROUP_LIST`, `ZONE_LIST`).
    List(Vec<ListEntry>),
    /// Fixed 16-slot array with per-slot presence flags.
    Array16(Vec<Option<PresetChunk>>),
    /// Verbatim payload bytes: unknown ids, opaque known ids, and any
    /// payload whose leading flag byte marks it unstructured.
    Opaque(Vec<u8>),
}

/// A chunk of a Kontakt preset tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresetChunk {
    /// Numeric chunk id, see [`id`].
    pub id: u16,
    /// Parsed payload.
    pub payload: ChunkPayload,
}

impl PresetChunk {
    /// Read one chunk (id, size, payload) from `reader`.
    pub fn read<R: Read + Seek>(reader: &mut R) -> BinResult<Self> {
        let id = u16::read_le(reader)?;
        let size = u32::read_le(reader)? as usize;
        let payload_bytes = read_bytes(reader, size)?;
        let payload = parse_payload(id, &payload_bytes)?;
        Ok(PresetChunk { id, payload })
    }

    /// Read chunks until `bytes` is exhausted.
    pub fn read_all(bytes: &[u8]) -> BinResult<Vec<PresetChunk>> {
        let mut cursor = Cursor::new(bytes);
        let mut chunks = Vec::new();
        while (cursor.position() as usize) < bytes.len() {
            chunks.push(PresetChunk::read(&mut cursor)?);
        }
        Ok(chunks)
    }

    /// Serialize the payload without the id/size header.
    pub fn payload_bytes(&self) -> BinResult<Vec<u8>> {
        let mut cursor = Cursor::new(Vec::new());
        write_payload(&self.payload, &mut cursor)?;
        Ok(cursor.into_inner())
    }

    /// Write the chunk including its id/size header.
    pub fn write<W: Write + Seek>(&self, writer: &mut W) -> BinResult<()> {
        let payload = self.payload_bytes()?;
        self.id.write_le(writer)?;
        (payload.len() as u32).write_le(writer)?;
        writer.write_all(&payload)?;
        Ok(())
    }

    /// The structured record, when this chunk has one.
    pub fn structure(&self) -> Option<&StructureData> {
        match &self.payload {
            ChunkPayload::Structured(data) => Some(data),
            ChunkPayload::List(_) | ChunkPayload::Array16(_) | ChunkPayload::Opaque(_) => None,
        }
    }

    /// Mutable access to the structured record.
    pub fn structure_mut(&mut self) -> Option<&mut StructureData> {
        match &mut self.payload {
            ChunkPayload::Structured(data) => Some(data),
            ChunkPayload::List(_) | ChunkPayload::Array16(_) | ChunkPayload::Opaque(_) => None,
        }
    }

    /// The list entries, when this chunk is a collection.
    pub fn entries(&self) -> Option<&[ListEntry]> {
        match &self.payload {
            ChunkPayload::List(entries) => Some(entries),
            ChunkPayload::Structured(_) | ChunkPayload::Array16(_) | ChunkPayload::Opaque(_) => {
                None
            }
        }
    }
}

impl Summarizable for PresetChunk {
    fn summary(&self) -> String {
        match &self.payload {
            ChunkPayload::Structured(data) => format!(
                "{} v{:#04X}, {} public, {} children",
                id::name(self.id),
                data.version,
                data.public_data.len(),
                data.children.len()
            ),
            ChunkPayload::List(entries) => {
                format!("{} with {} entries", id::name(self.id), entries.len())
            }
            ChunkPayload::Array16(slots) => format!(
                "{} with {} of 16 slots",
                id::name(self.id),
                slots.iter().flatten().count()
            ),
            ChunkPayload::Opaque(bytes) => {
                format!("{} ({:#04X}), {} opaque bytes", id::name(self.id), self.id, bytes.len())
            }
        }
    }

    fn name(&self) -> String {
        id::name(self.id).to_string()
    }
}

fn parse_payload(chunk_id: u16, bytes: &[u8]) -> BinResult<ChunkPayload> {
    match chunk_id {
        id::GROUP_LIST | id::ZONE_LIST => parse_list(chunk_id, bytes),
        id::PARAMETER_ARRAY_16 => parse_array16(bytes),
        _ => parse_structure_or_opaque(chunk_id, bytes),
    }
}

fn parse_list(chunk_id: u16, bytes: &[u8]) -> BinResult<ChunkPayload> {
    let mut cursor = Cursor::new(bytes);
    let count = u32::read_le(&mut cursor)?;
    let mut entries = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let reference = if chunk_id == id::ZONE_LIST {
            Some(u32::read_le(&mut cursor)?)
        } else {
            None
        };
        let flag = u8::read_le(&mut cursor)?;
        if flag != 1 {
            return Err(binrw::Error::Custom {
                pos: cursor.position(),
                err: Box::new(format!(
                    "{} entry must be structured, found flag {flag}",
                    id::name(chunk_id)
                )),
            });
        }
        entries.push(ListEntry {
            reference,
            structure: StructureData::read(&mut cursor)?,
        });
    }
    Ok(ChunkPayload::List(entries))
}

fn parse_array16(bytes: &[u8]) -> BinResult<ChunkPayload> {
    let mut cursor = Cursor::new(bytes);
    let mut slots = Vec::with_capacity(16);
    for _ in 0..16 {
        let present = u8::read_le(&mut cursor)?;
        if present == 0 {
            slots.push(None);
        } else {
            slots.push(Some(PresetChunk::read(&mut cursor)?));
        }
    }
    Ok(ChunkPayload::Array16(slots))
}

fn parse_structure_or_opaque(chunk_id: u16, bytes: &[u8]) -> BinResult<ChunkPayload> {
    if bytes.first() == Some(&1) {
        let mut cursor = Cursor::new(&bytes[1..]);
        if let Ok(data) = StructureData::read(&mut cursor) {
            // the structure must account for the whole payload, otherwise
            // treat it as opaque so the bytes survive a round-trip
            if cursor.position() as usize == bytes.len() - 1 {
                return Ok(ChunkPayload::Structured(data));
            }
        }
        trace!(
            "chunk {} ({chunk_id:#04X}): structured flag set but layout \
             mismatched, keeping payload opaque",
            id::name(chunk_id)
        );
    }
    Ok(ChunkPayload::Opaque(bytes.to_vec()))
}

fn write_payload<W: Write + Seek>(payload: &ChunkPayload, writer: &mut W) -> BinResult<()> {
    match payload {
        ChunkPayload::Structured(data) => {
            1u8.write_le(writer)?;
            data.write(writer)?;
        }
        ChunkPayload::List(entries) => {
            (entries.len() as u32).write_le(writer)?;
            for entry in entries {
                if let Some(reference) = entry.reference {
                    reference.write_le(writer)?;
                }
                1u8.write_le(writer)?;
                entry.structure.write(writer)?;
            }
        }
        ChunkPayload::Array16(slots) => {
            for slot in slots {
                match slot {
                    Some(chunk) => {
                        1u8.write_le(writer)?;
                        chunk.write(writer)?;
                    }
                    None => 0u8.write_le(writer)?,
                }
            }
        }
        ChunkPayload::Opaque(bytes) => writer.write_all(bytes)?,
    }
    Ok(())
}

#[allow(clippy::dbg_macro)]
#[cfg(test)]
mod test {
    use super::*;

    fn roundtrip(chunk: &PresetChunk) -> PresetChunk {
        let mut buff = Cursor::new(Vec::new());
        chunk.write(&mut buff).expect("write chunk");
        let bytes = buff.into_inner();
        let back = PresetChunk::read(&mut Cursor::new(&bytes[..])).expect("read chunk");
        // byte-identical re-serialization
        let mut again = Cursor::new(Vec::new());
        back.write(&mut again).expect("rewrite chunk");
        assert_eq!(again.into_inner(), bytes);
        back
    }

    #[test]
    fn structured_roundtrip() {
        let chunk = PresetChunk {
            id: id::PROGRAM,
            payload: ChunkPayload::Structured(StructureData {
                version: 0xA5,
                private_data: vec![1, 2, 3],
                public_data: vec![4, 5, 6, 7],
                children: vec![PresetChunk {
                    id: id::PAR_SCRIPT,
                    payload: ChunkPayload::Opaque(vec![0, 9, 9]),
                }],
            }),
        };
        let back = roundtrip(&chunk);
        assert_eq!(back, chunk);
        assert_eq!(back.structure().expect("structure").version, 0xA5);
    }

    #[test]
    fn unknown_chunk_bytes_preserved() {
        let chunk = PresetChunk {
            id: 0x7F,
            payload: ChunkPayload::Opaque(vec![0xDE, 0xAD, 0xBE, 0xEF]),
        };
        assert_eq!(roundtrip(&chunk), chunk);
        assert!(!id::is_known(0x7F));
    }

    #[test]
    fn zone_list_references() {
        let entry = |reference| ListEntry {
            reference: Some(reference),
            structure: StructureData {
                version: 0x98,
                private_data: vec![],
                public_data: vec![0xAA; 8],
                children: vec![],
            },
        };
        let chunk = PresetChunk {
            id: id::ZONE_LIST,
            payload: ChunkPayload::List(vec![entry(7), entry(9)]),
        };
        let back = roundtrip(&chunk);
        let entries = back.entries().expect("list entries");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].reference, Some(7));
        assert_eq!(entries[1].reference, Some(9));
    }

    #[test]
    fn parameter_array_slots() {
        let mut slots: Vec<Option<PresetChunk>> = vec![None; 16];
        slots[2] = Some(PresetChunk {
            id: id::PAR_INTERNAL_MOD,
            payload: ChunkPayload::Opaque(vec![1, 2]),
        });
        let chunk = PresetChunk {
            id: id::PARAMETER_ARRAY_16,
            payload: ChunkPayload::Array16(slots),
        };
        let back = roundtrip(&chunk);
        match &back.payload {
            ChunkPayload::Array16(slots) => {
                assert_eq!(slots.iter().flatten().count(), 1);
                assert!(slots[2].is_some());
            }
            ChunkPayload::Structured(_) | ChunkPayload::List(_) | ChunkPayload::Opaque(_) => {
                panic!("expected Array16")
            }
        }
    }

    #[test]
    fn unstructured_flag_stays_opaque() {
        // flag byte 0: everything after it is opaque public data
        let bytes = [0u8, 1, 2, 3];
        let payload = parse_payload(id::PAR_SCRIPT, &bytes).expect("parse");
        assert_eq!(payload, ChunkPayload::Opaque(bytes.to_vec()));
    }

    #[test]
    fn truncated_structure_is_kept_opaque() {
        // claims structured but the inner lengths overrun the payload
        let bytes = [1u8, 0x00, 0xA5, 0xFF, 0xFF, 0xFF, 0xFF];
        let payload = parse_payload(0x55, &bytes).expect("parse");
        assert_eq!(payload, ChunkPayload::Opaque(bytes.to_vec()));
    }
}
