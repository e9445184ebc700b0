//! Kontakt 2-4.1 classic preset header and inline monolith.
//!
//! The classic layout is a fixed header followed by a ZLIB-compressed XML
//! document. Monolith files additionally embed their samples between the
//! header's dictionaries and the XML block; nothing records the sample
//! offsets, so they are recovered by scanning backward from the NKI pointer
//! for the 4-byte WAV header signature.

use std::sync::Arc;

use binrw::io::{Read, Seek, SeekFrom};
use binrw::BinRead;
use tracing::{debug, instrument};

use crate::model::{AudioMetadata, MemorySample};
use crate::strings::{read_bytes, read_utf16_units, skip_bytes, PaddedAsciiString};
use crate::wav::{sniff_wav_metadata, RiffHeader};
use crate::{FormatError, Notifier, NotifyEvent, Summarizable};

/// Block ids seen in classic headers.
const KNOWN_BLOCK_IDS: [&[u8; 4]; 5] = [b"2noK", b"Kon3", b"3noK", b"4noK", b"iPkA"];

/// WAV header signature the monolith scan looks for.
const SAMPLE_SIGNATURE: [u8; 4] = [0x0A, 0xF8, 0xCC, 0x16];

/// Offset from a signature position to the start of the WAV payload.
const SAMPLE_HEADER_LEN: u64 = 31;

/// Offset from the NKI pointer to the ZLIB block.
const NKI_PREAMBLE_LEN: u64 = 27 + 170;

/// Instrument icon names, indexed by the header's icon id.
const ICON_NAMES: [&str; 29] = [
    "Organ",
    "Cello",
    "Drum Kit",
    "Bell",
    "Trumpet",
    "Guitar",
    "Piano",
    "Marimba",
    "Record Player",
    "E-Piano",
    "Harp",
    "Gong",
    "Pad",
    "Choir",
    "Woodwind",
    "Strings",
    "Synthesizer",
    "Percussion",
    "Bass",
    "Electric Guitar",
    "Flute",
    "Saxophone",
    "Violin",
    "Brass",
    "Vibraphone",
    "Harpsichord",
    "Clavinet",
    "Accordion",
    "New",
];

/// Icon name for an icon id, when in range.
pub fn icon_name(icon_id: u32) -> Option<&'static str> {
    ICON_NAMES.get(icon_id as usize).copied()
}

/// Decoded classic header fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Nki2Header {
    /// Version string, e.g. "2.1.0.004".
    pub version: String,
    /// 4-byte block id as stored.
    pub block_id: [u8; 4],
    /// Creation timestamp, formatted `dd.MM.yyyy HH:mm:ss` (UTC+1).
    pub timestamp: String,
    /// Icon id.
    pub icon_id: u32,
    /// Author field.
    pub author: String,
    /// Website field; `"(null)"` and blanks read as `None`.
    pub website: Option<String>,
    /// Patch level from the dedicated field.
    pub patch_level: u32,
    /// Length of the ZLIB block.
    pub zlib_length: u32,
    /// True when samples are embedded inline.
    pub is_monolith: bool,
}

impl Nki2Header {
    /// Icon name for the stored icon id.
    pub fn icon(&self) -> Option<&'static str> {
        icon_name(self.icon_id)
    }
}

impl Summarizable for Nki2Header {
    fn summary(&self) -> String {
        format!(
            "Kontakt {}{}",
            self.version,
            if self.is_monolith { " monolith" } else { "" }
        )
    }

    fn name(&self) -> String {
        "Kontakt 2 header".to_string()
    }
}

/// A fully scanned classic preset: header, monolith samples, raw deflate
/// stream. Inflating and XML parsing are collaborator concerns.
#[derive(Debug, Clone, PartialEq)]
pub struct Nki2File {
    /// Decoded header.
    pub header: Nki2Header,
    /// Monolith samples in dictionary order; empty for plain files.
    pub samples: Vec<Arc<MemorySample>>,
    /// The raw ZLIB stream holding the instrument XML.
    pub compressed_xml: Vec<u8>,
}

impl Nki2File {
    /// Inflate the instrument XML through the caller's ZLIB collaborator.
    pub fn instrument_xml(&self, zlib: &dyn crate::ZlibCodec) -> Result<Vec<u8>, FormatError> {
        zlib.inflate(&self.compressed_xml)
    }
}

/// Read a classic Kontakt 2-4.1 preset, including monolith samples.
#[instrument(skip(reader, notifier))]
pub fn read_nki2<R: Read + Seek>(
    reader: &mut R,
    notifier: &dyn Notifier,
) -> Result<Nki2File, FormatError> {
    let zlib_length = u32::read_le(reader)?;
    skip_bytes(reader, 8)?;

    // version triplet stored back to front: patch, minor, release, major
    let mut triplet = [0u8; 4];
    reader.read_exact(&mut triplet)?;
    let [patch, minor, release, major] = triplet;
    let mut version = format!("{major}.{release}.{minor}");
    let patch_known = patch != 0xFF;
    if patch_known {
        version.push_str(&format!(".{patch:03}"));
    } else {
        version.push_str(".?");
    }

    let mut block_id = [0u8; 4];
    reader.read_exact(&mut block_id)?;
    if !KNOWN_BLOCK_IDS.contains(&&block_id) {
        notifier.log(NotifyEvent::UnknownBlockId {
            id: String::from_utf8_lossy(&block_id).into_owned(),
        });
    }

    let timestamp = format_kontakt_timestamp(u32::read_le(reader)?);
    skip_bytes(reader, 26)?;
    let icon_id = u32::read_le(reader)?;
    let author = PaddedAsciiString::<8>::read_le(reader)?.as_str().to_string();
    skip_bytes(reader, 3)?;
    let website_raw = PaddedAsciiString::<86>::read_le(reader)?;
    let website = match website_raw.as_str() {
        "" | "(null)" => None,
        text => Some(text.to_string()),
    };
    skip_bytes(reader, 7)?;

    if version.starts_with('4') && !version.starts_with("4.0") && !version.starts_with("4.1") {
        return Err(FormatError::UnsupportedVersion {
            what: "Kontakt".to_string(),
            version: "4.2".to_string(),
        });
    }

    skip_bytes(reader, 4)?;
    let patch_level = u32::read_le(reader)?;
    if !patch_known {
        version = format!("{major}.{release}.{minor}.{patch_level:03}");
    }

    // a ZLIB stream starts with 0x78; anything else means inline samples
    let probe_pos = reader.stream_position()?;
    let probe = u8::read_le(reader)?;
    reader.seek(SeekFrom::Start(probe_pos))?;
    let is_monolith = probe != 0x78;

    let header = Nki2Header {
        version,
        block_id,
        timestamp,
        icon_id,
        author,
        website,
        patch_level,
        zlib_length,
        is_monolith,
    };
    notifier.log(NotifyEvent::SourceFormat {
        description: header.summary(),
    });

    let samples = if is_monolith {
        read_monolith_samples(reader)?
    } else {
        Vec::new()
    };

    let compressed_xml = read_bytes(reader, zlib_length as usize)?;
    Ok(Nki2File {
        header,
        samples,
        compressed_xml,
    })
}

// dictionaries
// ----

/// Dictionary entry reference types.
const ENTRY_END: u16 = 0;
const ENTRY_NKI: u16 = 1;
const ENTRY_DICTIONARY: u16 = 2;
const ENTRY_SAMPLE: u16 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
struct DictEntry {
    pointer: u32,
    entry_type: u16,
    name: String,
}

fn read_dictionary<R: Read + Seek>(reader: &mut R) -> Result<Vec<DictEntry>, FormatError> {
    let count = u32::read_le(reader)?;
    let mut entries = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let pointer = u32::read_le(reader)?;
        let entry_type = u16::read_le(reader)?;
        let name_len = u16::read_le(reader)?;
        let name = read_utf16_units(reader, name_len as usize)?;
        entries.push(DictEntry {
            pointer,
            entry_type,
            name,
        });
    }
    Ok(entries)
}

fn read_monolith_samples<R: Read + Seek>(
    reader: &mut R,
) -> Result<Vec<Arc<MemorySample>>, FormatError> {
    let root = read_dictionary(reader)?;
    let dictionary_end = reader.stream_position()?;

    let nki_pointer = root
        .iter()
        .find(|entry| entry.entry_type == ENTRY_NKI)
        .map(|entry| u64::from(entry.pointer))
        .ok_or(FormatError::Parse {
            pos: Some(dictionary_end),
            message: "monolith dictionary has no NKI entry".to_string(),
        })?;
    let samples_pointer = root
        .iter()
        .find(|entry| entry.entry_type == ENTRY_DICTIONARY && entry.name == "Samples")
        .map(|entry| u64::from(entry.pointer))
        .ok_or(FormatError::Parse {
            pos: Some(dictionary_end),
            message: "monolith dictionary has no Samples entry".to_string(),
        })?;

    reader.seek(SeekFrom::Start(samples_pointer))?;
    let filenames: Vec<String> = read_dictionary(reader)?
        .into_iter()
        .filter(|entry| entry.entry_type == ENTRY_SAMPLE)
        .map(|entry| entry.name)
        .collect();

    // no recorded offsets: scan backward from the NKI pointer for WAV
    // header signatures, one per listed filename
    reader.seek(SeekFrom::Start(0))?;
    let region = read_bytes(reader, nki_pointer.saturating_sub(4) as usize)?;
    let mut positions: Vec<u64> = region
        .windows(4)
        .enumerate()
        .filter(|(_, window)| *window == SAMPLE_SIGNATURE)
        .map(|(index, _)| index as u64)
        .collect();
    if positions.len() < filenames.len() {
        return Err(FormatError::MonolithSampleCountMismatch {
            filenames: filenames.len(),
            headers: positions.len(),
        });
    }
    positions.truncate(filenames.len());

    let mut samples = Vec::with_capacity(filenames.len());
    for (name, position) in filenames.iter().zip(&positions) {
        let wav_start = position + SAMPLE_HEADER_LEN;
        reader.seek(SeekFrom::Start(wav_start))?;
        let riff = RiffHeader::read(reader)?;
        reader.seek(SeekFrom::Start(wav_start))?;
        let bytes = read_bytes(reader, riff.size as usize + 8)?;
        let metadata = sniff_wav_metadata(&bytes).unwrap_or_else(|| {
            debug!("monolith sample {name} is not RIFF, keeping empty descriptor");
            AudioMetadata::default()
        });
        samples.push(Arc::new(MemorySample {
            name: name.clone(),
            metadata,
            bytes,
        }));
    }

    reader.seek(SeekFrom::Start(nki_pointer + NKI_PREAMBLE_LEN))?;
    Ok(samples)
}

// timestamp
// ----

/// Days between 1904-01-01 and 1970-01-01.
const DAYS_1904_TO_1970: i64 = 24107;

/// Format a Kontakt timestamp (seconds since 1904-01-01 UTC) as
/// `dd.MM.yyyy HH:mm:ss` in UTC+1.
pub fn format_kontakt_timestamp(seconds: u32) -> String {
    let shifted = u64::from(seconds) + 3600;
    let days = (shifted / 86400) as i64 - DAYS_1904_TO_1970;
    let rem = shifted % 86400;
    let (year, month, day) = civil_from_days(days);
    format!(
        "{day:02}.{month:02}.{year} {:02}:{:02}:{:02}",
        rem / 3600,
        (rem % 3600) / 60,
        rem % 60
    )
}

// Howard Hinnant's civil-from-days, days relative to 1970-01-01.
fn civil_from_days(z: i64) -> (i64, u32, u32) {
    let z = z + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let year = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let month = (if mp < 10 { mp + 3 } else { mp - 9 }) as u32;
    (if month <= 2 { year + 1 } else { year }, month, day)
}

#[allow(clippy::dbg_macro)]
#[cfg(test)]
mod test {
    use binrw::io::{Cursor, Write};
    use binrw::BinWrite;

    use super::*;
    use crate::wav::build_pcm16_wav;
    use crate::MemoryNotifier;

    #[test]
    fn icon_table() {
        assert_eq!(icon_name(0), Some("Organ"));
        assert_eq!(icon_name(1), Some("Cello"));
        assert_eq!(icon_name(2), Some("Drum Kit"));
        assert_eq!(icon_name(28), Some("New"));
        assert_eq!(icon_name(29), None);
    }

    #[test]
    fn timestamp_formatting() {
        // 1904-01-01 00:00:00 UTC is 01:00 in UTC+1
        assert_eq!(format_kontakt_timestamp(0), "01.01.1904 01:00:00");
        // one day later
        assert_eq!(format_kontakt_timestamp(86400), "02.01.1904 01:00:00");
        // leap day 1904-02-29: 31 + 28 days in
        assert_eq!(
            format_kontakt_timestamp(59 * 86400),
            "29.02.1904 01:00:00"
        );
    }

    fn write_header(
        cursor: &mut Cursor<Vec<u8>>,
        zlib_length: u32,
        triplet: [u8; 4],
        monolith_probe: Option<u8>,
    ) {
        zlib_length.write_le(cursor).expect("zlib length");
        cursor.write_all(&[0u8; 8]).expect("unused");
        cursor.write_all(&triplet).expect("version triplet");
        cursor.write_all(b"2noK").expect("block id");
        0u32.write_le(cursor).expect("timestamp");
        cursor.write_all(&[0u8; 26]).expect("unknown");
        6u32.write_le(cursor).expect("icon id"); // Piano
        cursor.write_all(b"Moss\0\0\0\0").expect("author");
        cursor.write_all(&[0u8; 3]).expect("unknown");
        let mut website = [0u8; 86];
        website[..6].copy_from_slice(b"(null)");
        cursor.write_all(&website).expect("website");
        cursor.write_all(&[0u8; 7]).expect("unknown");
        cursor.write_all(&[0u8; 4]).expect("unknown");
        4u32.write_le(cursor).expect("patch level");
        if let Some(probe) = monolith_probe {
            cursor.write_all(&[probe]).expect("probe byte");
        }
    }

    #[test]
    fn plain_header_parses() {
        let zlib = vec![0x78u8, 0x9C, 1, 2, 3];
        let mut cursor = Cursor::new(Vec::new());
        write_header(&mut cursor, zlib.len() as u32, [0xFF, 1, 0, 2], None);
        cursor.write_all(&zlib).expect("zlib body");
        cursor.set_position(0);

        let notifier = MemoryNotifier::new();
        let file = read_nki2(&mut cursor, &notifier).expect("parse nki2");
        assert_eq!(file.header.version, "2.0.1.004");
        assert_eq!(file.header.author, "Moss");
        assert_eq!(file.header.website, None);
        assert_eq!(file.header.icon(), Some("Piano"));
        assert!(!file.header.is_monolith);
        assert!(file.samples.is_empty());
        assert_eq!(file.compressed_xml, zlib);
        assert!(notifier.events().iter().any(|e| e.contains("Kontakt 2.0.1.004")));
    }

    #[test]
    fn instrument_xml_goes_through_the_collaborator() {
        struct UpperCodec;
        impl crate::ZlibCodec for UpperCodec {
            fn inflate(&self, bytes: &[u8]) -> Result<Vec<u8>, FormatError> {
                Ok(bytes.to_ascii_uppercase())
            }
            fn deflate(&self, bytes: &[u8]) -> Result<Vec<u8>, FormatError> {
                Ok(bytes.to_ascii_lowercase())
            }
        }

        let file = Nki2File {
            header: Nki2Header {
                version: "2.1.0.001".to_string(),
                block_id: *b"2noK",
                timestamp: String::new(),
                icon_id: 0,
                author: String::new(),
                website: None,
                patch_level: 1,
                zlib_length: 3,
                is_monolith: false,
            },
            samples: Vec::new(),
            compressed_xml: b"xml".to_vec(),
        };
        let xml = file.instrument_xml(&UpperCodec).expect("inflate");
        assert_eq!(xml, b"XML");
    }

    #[test]
    fn nki42_rejected() {
        let mut cursor = Cursor::new(Vec::new());
        write_header(&mut cursor, 4, [0, 2, 2, 4], None); // version 4.2.2
        cursor.write_all(&[0x78u8; 4]).expect("zlib");
        cursor.set_position(0);
        let notifier = MemoryNotifier::new();
        let err = read_nki2(&mut cursor, &notifier).expect_err("4.2 must fail fast");
        match err {
            FormatError::UnsupportedVersion { version, .. } => assert_eq!(version, "4.2"),
            _ => panic!("expected UnsupportedVersion, got {err:?}"),
        }
    }

    fn write_dictionary(cursor: &mut Cursor<Vec<u8>>, entries: &[(u32, u16, &str)]) {
        (entries.len() as u32).write_le(cursor).expect("count");
        for (pointer, entry_type, name) in entries {
            pointer.write_le(cursor).expect("pointer");
            entry_type.write_le(cursor).expect("type");
            let units: Vec<u16> = name.encode_utf16().collect();
            (units.len() as u16).write_le(cursor).expect("name length");
            for unit in units {
                unit.write_le(cursor).expect("name unit");
            }
        }
    }

    #[test]
    fn monolith_scan_recovers_samples() {
        let zlib = vec![0x78u8, 0x9C, 9, 9, 9];
        let wav_a = build_pcm16_wav(1, 44100, &vec![0u8; 64]);
        let wav_b = build_pcm16_wav(2, 48000, &vec![0u8; 128]);

        let mut cursor = Cursor::new(Vec::new());
        write_header(&mut cursor, zlib.len() as u32, [1, 0, 1, 2], None);

        // root dictionary: NKI pointer and Samples sub-dictionary,
        // pointers patched afterwards
        let root_pos = cursor.position();
        write_dictionary(
            &mut cursor,
            &[(0, ENTRY_NKI, ""), (0, ENTRY_DICTIONARY, "Samples"), (0, ENTRY_END, "")],
        );

        let mut sample_offsets = Vec::new();
        for wav in [&wav_a, &wav_b] {
            sample_offsets.push(cursor.position());
            cursor.write_all(&SAMPLE_SIGNATURE).expect("signature");
            cursor.write_all(&[0u8; SAMPLE_HEADER_LEN as usize - 4]).expect("header");
            cursor.write_all(wav).expect("wav payload");
        }

        let subdict_pos = cursor.position();
        write_dictionary(
            &mut cursor,
            &[
                (0, ENTRY_SAMPLE, "kick.wav"),
                (0, ENTRY_SAMPLE, "snare.wav"),
                (0, ENTRY_END, ""),
            ],
        );

        let nki_pos = cursor.position();
        cursor
            .write_all(&vec![0u8; NKI_PREAMBLE_LEN as usize])
            .expect("nki preamble");
        cursor.write_all(&zlib).expect("zlib body");

        // patch the root dictionary pointers
        let bytes = cursor.get_mut();
        bytes[root_pos as usize + 4..root_pos as usize + 8]
            .copy_from_slice(&(nki_pos as u32).to_le_bytes());
        let samples_entry = root_pos as usize + 4 + 8;
        bytes[samples_entry..samples_entry + 4]
            .copy_from_slice(&(subdict_pos as u32).to_le_bytes());
        cursor.set_position(0);

        let notifier = MemoryNotifier::new();
        let file = read_nki2(&mut cursor, &notifier).expect("parse monolith");
        assert!(file.header.is_monolith);
        assert_eq!(file.samples.len(), 2);
        assert_eq!(file.samples[0].name, "kick.wav");
        assert_eq!(file.samples[0].metadata.channels, 1);
        assert_eq!(file.samples[1].name, "snare.wav");
        assert_eq!(file.samples[1].metadata.channels, 2);
        assert_eq!(file.samples[1].metadata.sample_rate, 48000);
        assert_eq!(file.compressed_xml, zlib);
    }

    #[test]
    fn monolith_count_mismatch() {
        // dictionary lists two samples, stream contains one signature
        let zlib = vec![0x78u8, 0x9C];
        let wav = build_pcm16_wav(1, 44100, &vec![0u8; 32]);

        let mut cursor = Cursor::new(Vec::new());
        write_header(&mut cursor, zlib.len() as u32, [1, 0, 1, 2], None);
        let root_pos = cursor.position();
        write_dictionary(
            &mut cursor,
            &[(0, ENTRY_NKI, ""), (0, ENTRY_DICTIONARY, "Samples"), (0, ENTRY_END, "")],
        );
        cursor.write_all(&SAMPLE_SIGNATURE).expect("signature");
        cursor.write_all(&[0u8; SAMPLE_HEADER_LEN as usize - 4]).expect("header");
        cursor.write_all(&wav).expect("wav payload");
        let subdict_pos = cursor.position();
        write_dictionary(
            &mut cursor,
            &[
                (0, ENTRY_SAMPLE, "kick.wav"),
                (0, ENTRY_SAMPLE, "snare.wav"),
                (0, ENTRY_END, ""),
            ],
        );
        let nki_pos = cursor.position();
        cursor
            .write_all(&vec![0u8; NKI_PREAMBLE_LEN as usize])
            .expect("nki preamble");
        cursor.write_all(&zlib).expect("zlib body");

        let bytes = cursor.get_mut();
        bytes[root_pos as usize + 4..root_pos as usize + 8]
            .copy_from_slice(&(nki_pos as u32).to_le_bytes());
        let samples_entry = root_pos as usize + 4 + 8;
        bytes[samples_entry..samples_entry + 4]
            .copy_from_slice(&(subdict_pos as u32).to_le_bytes());
        cursor.set_position(0);

        let notifier = MemoryNotifier::new();
        let err = read_nki2(&mut cursor, &notifier).expect_err("count mismatch must fail");
        match err {
            FormatError::MonolithSampleCountMismatch { filenames, headers } => {
                assert_eq!(filenames, 2);
                assert_eq!(headers, 1);
            }
            _ => panic!("expected MonolithSampleCountMismatch, got {err:?}"),
        }
    }
}
