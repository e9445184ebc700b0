//! Kontakt 5+ file-container monolith.
//!
//! Unlike the Kontakt 2 inline monolith, this is a real file container: an
//! MTD header, a table of contents with fixed-width UTF-16 names and
//! cumulative end offsets, then the file payloads laid out contiguously in
//! TOC order. One entry is the inner NKI (or NKM); the rest are sample
//! payloads.

use binrw::io::{Read, Seek, Write};
use binrw::{BinRead, BinWrite};
use tracing::instrument;

use crate::strings::{read_bytes, read_utf16_fixed, skip_bytes, write_fill, write_utf16_fixed};
use crate::{FormatError, Summarizable};

/// Magic opening the monolith metadata header.
pub const MTD_MAGIC: &[u8; 16] = b"/\\ NI FC MTD  /\\";
/// Magic opening (and closing) the table of contents.
const TOC_MAGIC: &[u8; 16] = b"/\\ NI FC TOC  /\\";

/// Byte width of a TOC name field.
const TOC_NAME_WIDTH: usize = 600;
/// Largest accepted single file payload.
const MAX_FILE_LEN: u64 = 4 * 1024 * 1024 * 1024;

/// One embedded file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonolithFile {
    /// File name from the TOC, extension included.
    pub name: String,
    /// Raw payload bytes.
    pub bytes: Vec<u8>,
}

/// A parsed monolith container.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Monolith {
    /// Embedded files in TOC order.
    pub files: Vec<MonolithFile>,
}

impl Monolith {
    /// The inner preset: the entry named `*.nki` (or `*.nkm` for multis).
    pub fn main_file(&self) -> Option<&MonolithFile> {
        self.files.iter().find(|file| {
            let lower = file.name.to_ascii_lowercase();
            lower.ends_with(".nki") || lower.ends_with(".nkm")
        })
    }

    /// Sample payload entries (`.wav` / `.ncw`).
    pub fn sample_files(&self) -> impl Iterator<Item = &MonolithFile> {
        self.files.iter().filter(|file| {
            let lower = file.name.to_ascii_lowercase();
            lower.ends_with(".wav") || lower.ends_with(".ncw")
        })
    }

    /// Case-insensitive lookup by full file name.
    pub fn find(&self, name: &str) -> Option<&MonolithFile> {
        self.files
            .iter()
            .find(|file| file.name.eq_ignore_ascii_case(name))
    }
}

impl Summarizable for Monolith {
    fn summary(&self) -> String {
        format!(
            "monolith with {} files ({} samples)",
            self.files.len(),
            self.sample_files().count()
        )
    }

    fn name(&self) -> String {
        "Kontakt 5 monolith".to_string()
    }
}

/// Read a monolith container.
#[instrument(skip(reader))]
pub fn read_monolith<R: Read + Seek>(reader: &mut R) -> Result<Monolith, FormatError> {
    crate::strings::expect_tag(reader, MTD_MAGIC)?;
    skip_bytes(reader, 248)?;
    skip_bytes(reader, 8)?; // end marker
    let file_count = u64::read_le(reader)?;
    let _total_size = u64::read_le(reader)?;

    crate::strings::expect_tag(reader, TOC_MAGIC)?;
    skip_bytes(reader, 600)?;

    let mut entries = Vec::with_capacity(file_count as usize);
    for expected_index in 1..=file_count {
        let index = u64::read_le(reader)?;
        if index != expected_index {
            return Err(FormatError::Parse {
                pos: Some(reader.stream_position()? - 8),
                message: format!("TOC index {index}, expected {expected_index}"),
            });
        }
        skip_bytes(reader, 16)?;
        let name = read_utf16_fixed(reader, TOC_NAME_WIDTH)?;
        let _unused = u64::read_le(reader)?;
        let end_offset = u64::read_le(reader)?;
        entries.push((name, end_offset));
    }

    skip_bytes(reader, 8)?; // files-end marker
    skip_bytes(reader, 16)?;
    crate::strings::expect_tag(reader, TOC_MAGIC)?;
    skip_bytes(reader, 592)?;

    let mut files = Vec::with_capacity(entries.len());
    let mut previous_end = 0u64;
    for (name, end_offset) in entries {
        let length = end_offset.checked_sub(previous_end).ok_or_else(|| {
            FormatError::Parse {
                pos: None,
                message: format!("TOC offsets not monotonic at {name}"),
            }
        })?;
        if length >= MAX_FILE_LEN {
            return Err(FormatError::Parse {
                pos: None,
                message: format!("embedded file {name} is {length} bytes, 4 GiB limit"),
            });
        }
        let bytes = read_bytes(reader, length as usize)?;
        files.push(MonolithFile { name, bytes });
        previous_end = end_offset;
    }
    Ok(Monolith { files })
}

/// Write a monolith container around `files`.
///
/// Marker fields with unknown semantics are zero-filled; the reader above
/// skips them.
pub fn write_monolith<W: Write + Seek>(
    files: &[MonolithFile],
    writer: &mut W,
) -> Result<(), FormatError> {
    writer.write_all(MTD_MAGIC)?;
    write_fill(writer, 0xFF, 248)?;
    write_fill(writer, 0, 8)?;
    (files.len() as u64).write_le(writer)?;
    let total: u64 = files.iter().map(|file| file.bytes.len() as u64).sum();
    total.write_le(writer)?;

    writer.write_all(TOC_MAGIC)?;
    write_fill(writer, 0, 600)?;
    let mut end_offset = 0u64;
    for (index, file) in files.iter().enumerate() {
        ((index + 1) as u64).write_le(writer)?;
        write_fill(writer, 0, 16)?;
        write_utf16_fixed(writer, &file.name, TOC_NAME_WIDTH)?;
        0u64.write_le(writer)?;
        end_offset += file.bytes.len() as u64;
        end_offset.write_le(writer)?;
    }
    write_fill(writer, 0, 8)?;
    write_fill(writer, 0, 16)?;
    writer.write_all(TOC_MAGIC)?;
    write_fill(writer, 0, 592)?;

    for file in files {
        writer.write_all(&file.bytes)?;
    }
    Ok(())
}

#[allow(clippy::dbg_macro)]
#[cfg(test)]
mod test {
    use binrw::io::Cursor;

    use super::*;

    #[test]
    fn magic_is_sixteen_bytes() {
        assert_eq!(MTD_MAGIC.len(), 16);
        assert_eq!(TOC_MAGIC.len(), 16);
    }

    #[test]
    fn roundtrip() {
        let files = vec![
            MonolithFile {
                name: "Drums.nki".to_string(),
                bytes: vec![1, 2, 3, 4],
            },
            MonolithFile {
                name: "kick.wav".to_string(),
                bytes: vec![5; 100],
            },
            MonolithFile {
                name: "snare.ncw".to_string(),
                bytes: vec![6; 50],
            },
        ];
        let mut cursor = Cursor::new(Vec::new());
        write_monolith(&files, &mut cursor).expect("write monolith");
        cursor.set_position(0);
        let monolith = read_monolith(&mut cursor).expect("read monolith");
        assert_eq!(monolith.files, files);
        assert_eq!(monolith.main_file().expect("main").name, "Drums.nki");
        assert_eq!(monolith.sample_files().count(), 2);
        assert!(monolith.find("KICK.WAV").is_some());
        assert!(monolith.find("tom.wav").is_none());
    }

    #[test]
    fn bad_magic_reports_offset() {
        let mut bytes = vec![0u8; 900];
        bytes[..4].copy_from_slice(b"RIFF");
        let err = read_monolith(&mut Cursor::new(bytes)).expect_err("garbage must fail");
        match err {
            FormatError::BadMagic { pos, .. } => assert_eq!(pos, 0),
            _ => panic!("expected BadMagic, got {err:?}"),
        }
    }
}
