//! Sample path table of a Kontakt 5+ preset.
//!
//! Paths are stored segmented: a per-file segment count, then typed
//! segments whose text is UTF-16. The last segment is the file name,
//! earlier segments are path components. Zones reference entries by index;
//! decoding resolves those indexes into owned paths and encoding rebuilds
//! the table, so the index never reaches the model.

use binrw::io::{Cursor, Read, Write};
use binrw::{BinRead, BinResult, BinWrite};

use crate::strings::{read_utf16_prefixed, write_utf16_prefixed};

/// Segment type of a directory component.
const SEGMENT_DIR: u32 = 1;
/// Segment type of the final file-name component.
const SEGMENT_FILE: u32 = 2;

/// Parsed sample path table.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FileList {
    /// Table version as stored.
    pub version: u32,
    /// Paths in table order, segments joined with '/'.
    pub paths: Vec<String>,
    /// Bytes after the last entry (timestamps and similar), preserved.
    pub trailing: Vec<u8>,
}

impl FileList {
    /// Parse a table from chunk public data.
    pub fn parse(bytes: &[u8]) -> BinResult<Self> {
        let mut cursor = Cursor::new(bytes);
        let version = u32::read_le(&mut cursor)?;
        let file_count = u32::read_le(&mut cursor)?;
        let mut paths = Vec::with_capacity(file_count as usize);
        for _ in 0..file_count {
            let segment_count = u32::read_le(&mut cursor)?;
            let mut segments = Vec::with_capacity(segment_count as usize);
            for _ in 0..segment_count {
                let _segment_type = u32::read_le(&mut cursor)?;
                segments.push(read_utf16_prefixed(&mut cursor)?);
            }
            paths.push(segments.join("/"));
        }
        let mut trailing = Vec::new();
        cursor.read_to_end(&mut trailing)?;
        Ok(FileList {
            version,
            paths,
            trailing,
        })
    }

    /// Serialize back into chunk public data.
    pub fn to_bytes(&self) -> BinResult<Vec<u8>> {
        let mut cursor = Cursor::new(Vec::new());
        self.version.write_le(&mut cursor)?;
        (self.paths.len() as u32).write_le(&mut cursor)?;
        for path in &self.paths {
            let segments: Vec<&str> = path.split('/').collect();
            (segments.len() as u32).write_le(&mut cursor)?;
            for (index, segment) in segments.iter().enumerate() {
                let segment_type = if index + 1 == segments.len() {
                    SEGMENT_FILE
                } else {
                    SEGMENT_DIR
                };
                segment_type.write_le(&mut cursor)?;
                write_utf16_prefixed(&mut cursor, segment)?;
            }
        }
        cursor.write_all(&self.trailing)?;
        Ok(cursor.into_inner())
    }

    /// Build a table from zone sample paths.
    pub fn from_paths(paths: Vec<String>) -> Self {
        FileList {
            version: 2,
            paths,
            trailing: Vec::new(),
        }
    }

    /// Path at `index`, when in range.
    pub fn path(&self, index: u32) -> Option<&str> {
        self.paths.get(index as usize).map(String::as_str)
    }

    /// Index of `path`, appending it when absent.
    pub fn index_of_or_insert(&mut self, path: &str) -> u32 {
        if let Some(found) = self.paths.iter().position(|p| p == path) {
            found as u32
        } else {
            self.paths.push(path.to_string());
            (self.paths.len() - 1) as u32
        }
    }
}
