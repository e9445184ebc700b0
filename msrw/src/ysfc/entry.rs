//! YSFC entry records, the bodies of `Entr` items.
//!
//! An entry describes one item of the sibling Data chunk: where its
//! payload lives (`item_offset`, measured from the Data chunk's id, whose
//! first item sits 12 bytes in), how big it is, and its names. Entries and
//! data items are bound positionally; the offsets are regenerated on
//! write.

use binrw::io::{Cursor, Read, Write};
use binrw::{BinRead, BinResult, BinWrite, NullString};

/// One parsed entry record.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EntryRecord {
    /// Payload size of the bound data item.
    pub item_size: u32,
    /// Offset of the bound data item inside its Data chunk.
    pub item_offset: u32,
    /// Type-specific value, e.g. a program number.
    pub specific_value: u32,
    /// Six flag bytes, preserved.
    pub flags: [u8; 6],
    /// Pseudo-timestamp.
    pub timestamp: u32,
    /// Item name; waveforms commonly use the `"N:name"` category form.
    pub item_name: String,
    /// Item title; empty outside performance entries.
    pub item_title: String,
    /// Additional data after the strings (performance entries only),
    /// preserved verbatim.
    pub additional: Vec<u8>,
}

impl EntryRecord {
    /// New entry with just a name.
    pub fn named(item_name: impl Into<String>) -> Self {
        EntryRecord {
            item_name: item_name.into(),
            ..EntryRecord::default()
        }
    }

    /// Parse an entry body.
    pub fn parse(bytes: &[u8]) -> BinResult<Self> {
        let mut cursor = Cursor::new(bytes);
        let item_size = u32::read_be(&mut cursor)?;
        let item_offset = u32::read_be(&mut cursor)?;
        let specific_value = u32::read_be(&mut cursor)?;
        let mut flags = [0u8; 6];
        cursor.read_exact(&mut flags)?;
        let timestamp = u32::read_be(&mut cursor)?;
        let item_name = NullString::read_le(&mut cursor)?.to_string();
        let item_title = NullString::read_le(&mut cursor)?.to_string();
        let mut additional = Vec::new();
        cursor.read_to_end(&mut additional)?;
        Ok(EntryRecord {
            item_size,
            item_offset,
            specific_value,
            flags,
            timestamp,
            item_name,
            item_title,
            additional,
        })
    }

    /// Serialize the entry body.
    pub fn to_bytes(&self) -> BinResult<Vec<u8>> {
        let mut cursor = Cursor::new(Vec::new());
        self.item_size.write_be(&mut cursor)?;
        self.item_offset.write_be(&mut cursor)?;
        self.specific_value.write_be(&mut cursor)?;
        cursor.write_all(&self.flags)?;
        self.timestamp.write_be(&mut cursor)?;
        NullString::from(self.item_name.as_str()).write_le(&mut cursor)?;
        NullString::from(self.item_title.as_str()).write_le(&mut cursor)?;
        cursor.write_all(&self.additional)?;
        Ok(cursor.into_inner())
    }
}

#[allow(clippy::dbg_macro)]
#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn roundtrip() {
        let entry = EntryRecord {
            item_size: 420,
            item_offset: 12,
            specific_value: 3,
            flags: [1, 2, 3, 4, 5, 6],
            timestamp: 0x1234_5678,
            item_name: "32:Jazz Organ".to_string(),
            item_title: "Jazz Organ Performance".to_string(),
            additional: vec![7, 8, 9],
        };
        let bytes = entry.to_bytes().expect("serialize entry");
        let back = EntryRecord::parse(&bytes).expect("parse entry");
        assert_eq!(back, entry);
    }

    #[test]
    fn empty_title_is_one_nul() {
        let entry = EntryRecord::named("x");
        let bytes = entry.to_bytes().expect("serialize");
        // size(4) offset(4) specific(4) flags(6) time(4) "x\0" "\0"
        assert_eq!(bytes.len(), 22 + 2 + 1);
        let back = EntryRecord::parse(&bytes).expect("parse");
        assert_eq!(back.item_title, "");
        assert!(back.additional.is_empty());
    }
}
