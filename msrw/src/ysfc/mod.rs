//! YAMAHA-YSFC library codec (Motif XS/XF, MOXF, Montage, MODX).
//!
//! A library is a 64-byte header, a catalog of chunk offsets, an optional
//! cross-library reference block (written but not interpreted; this
//! implementation requires self-contained files) and a run of chunks.
//! Chunks come in entry-list / data-list pairs bound positionally: entry
//! `i` of `EWFM` describes data item `i` of `DWFM`, and so on.

pub mod category;
pub mod entry;
pub mod keybank;
pub mod performance;
pub mod wavedata;
pub mod writer;

use core::fmt::{Display, Formatter};

use binrw::io::{Read, Seek, SeekFrom, Write};
use binrw::BinRead;
use tracing::instrument;

use crate::model::{
    AudioMetadata, Envelope, Group, MemorySample, MultiSample, Performance, PerformanceSlot,
    SampleData, SampleLoop, SampleZone,
};
use crate::strings::{read_bytes, skip_bytes, PaddedAsciiString};
use crate::wav::build_pcm16_wav;
use crate::ysfc::entry::EntryRecord;
use crate::ysfc::keybank::{
    cents_from_fine, level_to_db, pan_from_stored, parse_key_banks, KeyBank, KeyBankLayout,
};
use crate::ysfc::performance::PerformanceData;
use crate::ysfc::wavedata::{interleave_stereo, parse_wave_data};
use crate::{ChunkID, DecodeOutcome, FormatError, FourCC, NotifyEvent, Session, Summarizable};

use std::sync::Arc;

/// Leading bytes of the 16-byte header id field.
pub const YSFC_MAGIC: &[u8; 11] = b"YAMAHA-YSFC";

/// Performance entry list.
pub const ID_EPFM: FourCC = FourCC(*b"EPFM");
/// Performance data list.
pub const ID_DPFM: FourCC = FourCC(*b"DPFM");
/// Waveform (multi-sample) entry list.
pub const ID_EWFM: FourCC = FourCC(*b"EWFM");
/// Waveform data list.
pub const ID_DWFM: FourCC = FourCC(*b"DWFM");
/// Wave image (raw sample) entry list.
pub const ID_EWIM: FourCC = FourCC(*b"EWIM");
/// Wave image data list.
pub const ID_DWIM: FourCC = FourCC(*b"DWIM");

/// Item marker of entry items.
const MARKER_ENTRY: &[u8; 4] = b"Entr";
/// Item marker of data items.
const MARKER_DATA: &[u8; 4] = b"Data";

/// Yamaha workstation family, inferred from the header version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Workstation {
    /// Motif XS, version <= 1.0.1.
    MotifXs,
    /// Motif XF, version 1.0.2.
    MotifXf,
    /// MOXF, version 1.0.3.
    Moxf,
    /// Montage, versions 4.x.
    Montage,
    /// MODX, versions 5.x and later.
    Modx,
}

impl Workstation {
    /// Infer the workstation from a numeric version (e.g. "4.0.4" = 404).
    pub fn from_version(number: u32) -> Self {
        match number {
            0..=101 => Workstation::MotifXs,
            102 => Workstation::MotifXf,
            103..=399 => Workstation::Moxf,
            400..=499 => Workstation::Montage,
            _ => Workstation::Modx,
        }
    }

    /// Key-bank layout used by this family.
    pub fn key_bank_layout(&self) -> KeyBankLayout {
        match self {
            Workstation::MotifXs | Workstation::MotifXf => KeyBankLayout::Version1 { moxf: false },
            Workstation::Moxf => KeyBankLayout::Version1 { moxf: true },
            Workstation::Montage | Workstation::Modx => KeyBankLayout::Version2,
        }
    }

    /// Header version string written for this family.
    pub fn version_string(&self) -> &'static str {
        match self {
            Workstation::MotifXs => "1.0.1",
            Workstation::MotifXf => "1.0.2",
            Workstation::Moxf => "1.0.3",
            Workstation::Montage => "4.0.5",
            Workstation::Modx => "5.0.0",
        }
    }

    /// Whether libraries of this family carry performance chunks.
    pub fn writes_performances(&self) -> bool {
        matches!(self, Workstation::Montage | Workstation::Modx)
    }
}

impl Display for Workstation {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            Workstation::MotifXs => write!(f, "Motif XS"),
            Workstation::MotifXf => write!(f, "Motif XF"),
            Workstation::Moxf => write!(f, "MOXF"),
            Workstation::Montage => write!(f, "Montage"),
            Workstation::Modx => write!(f, "MODX"),
        }
    }
}

/// Parse a dotted version string into its numeric form: "4.0.4" = 404.
pub fn parse_version_number(text: &str) -> u32 {
    let mut digits = text.split('.').filter_map(|part| part.trim().parse::<u32>().ok());
    match (digits.next(), digits.next(), digits.next()) {
        (Some(a), Some(b), Some(c)) => a * 100 + b * 10 + c,
        _ => 0,
    }
}

/// The 64-byte library header plus the catalog that follows it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct YsfcHeader {
    /// Version string, e.g. "4.0.5".
    pub version: String,
    /// Catalog: chunk id and absolute file offset per chunk.
    pub catalog: Vec<(FourCC, u32)>,
    /// Size of the cross-library reference block.
    pub library_size: u32,
    /// Highest entry id in the file.
    pub max_entry_id: u32,
}

impl YsfcHeader {
    /// Read header and catalog; leaves the reader at the library block.
    pub fn read<R: Read + Seek>(reader: &mut R) -> Result<Self, FormatError> {
        crate::strings::expect_tag(reader, YSFC_MAGIC)?;
        skip_bytes(reader, 5)?;
        let version = PaddedAsciiString::<16>::read_le(reader)?.as_str().to_string();
        let catalog_size = u32::read_be(reader)?;
        skip_bytes(reader, 12)?;
        let library_size = match u32::read_be(reader)? {
            0xFFFF_FFFF => 0,
            size => size,
        };
        skip_bytes(reader, 8)?;
        let max_entry_id = u32::read_be(reader)?;

        let mut catalog = Vec::with_capacity((catalog_size / 8) as usize);
        for _ in 0..catalog_size / 8 {
            let id = FourCC::read(reader)?;
            let offset = u32::read_be(reader)?;
            catalog.push((id, offset));
        }
        Ok(YsfcHeader {
            version,
            catalog,
            library_size,
            max_entry_id,
        })
    }

    /// Numeric version, e.g. 404 for "4.0.4".
    pub fn version_number(&self) -> u32 {
        parse_version_number(&self.version)
    }

    /// Workstation family implied by the version.
    pub fn workstation(&self) -> Workstation {
        Workstation::from_version(self.version_number())
    }
}

impl Summarizable for YsfcHeader {
    fn summary(&self) -> String {
        format!("Yamaha {} library {}", self.workstation(), self.version)
    }

    fn name(&self) -> String {
        "YSFC header".to_string()
    }
}

/// One item of a YSFC chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum YsfcItem {
    /// An `Entr` item.
    Entry(EntryRecord),
    /// A `Data` item, raw payload.
    Data(Vec<u8>),
}

/// One YSFC chunk: a four-byte id and its items.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct YsfcChunk {
    /// Chunk id, e.g. `EWFM`.
    pub id: FourCC,
    /// Items in wire order.
    pub items: Vec<YsfcItem>,
}

impl ChunkID for YsfcChunk {
    fn id(&self) -> FourCC {
        self.id
    }
}

impl YsfcChunk {
    /// Read one chunk.
    pub fn read<R: Read + Seek>(reader: &mut R) -> Result<Self, FormatError> {
        let id = FourCC::read(reader)?;
        let _chunk_length = u32::read_be(reader)?;
        let item_count = u32::read_be(reader)?;
        let mut items = Vec::with_capacity(item_count as usize);
        for _ in 0..item_count {
            let pos = reader.stream_position()?;
            let mut marker = [0u8; 4];
            reader.read_exact(&mut marker)?;
            let length = u32::read_be(reader)? as usize;
            let bytes = read_bytes(reader, length)?;
            items.push(match &marker {
                m if m == MARKER_ENTRY => YsfcItem::Entry(EntryRecord::parse(&bytes)?),
                m if m == MARKER_DATA => YsfcItem::Data(bytes),
                _ => {
                    return Err(FormatError::BadMagic {
                        pos,
                        expected: "Entr|Data".to_string(),
                        found: String::from_utf8_lossy(&marker).into_owned(),
                    })
                }
            });
        }
        Ok(YsfcChunk { id, items })
    }

    /// Serialize, recomputing all lengths.
    pub fn write<W: Write + Seek>(&self, writer: &mut W) -> Result<(), FormatError> {
        let bytes = self.to_bytes()?;
        writer.write_all(&bytes)?;
        Ok(())
    }

    /// The chunk as bytes, id and length fields included.
    pub fn to_bytes(&self) -> Result<Vec<u8>, FormatError> {
        let mut body = Vec::new();
        for item in &self.items {
            let (marker, payload) = match item {
                YsfcItem::Entry(entry) => (MARKER_ENTRY, entry.to_bytes()?),
                YsfcItem::Data(bytes) => (MARKER_DATA, bytes.clone()),
            };
            body.extend_from_slice(marker);
            body.extend_from_slice(&(payload.len() as u32).to_be_bytes());
            body.extend_from_slice(&payload);
        }
        let mut out = Vec::with_capacity(body.len() + 12);
        out.extend_from_slice(&self.id.0);
        out.extend_from_slice(&((body.len() + 4) as u32).to_be_bytes());
        out.extend_from_slice(&(self.items.len() as u32).to_be_bytes());
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// The entry records, in order.
    pub fn entries(&self) -> Vec<&EntryRecord> {
        self.items
            .iter()
            .filter_map(|item| match item {
                YsfcItem::Entry(entry) => Some(entry),
                YsfcItem::Data(_) => None,
            })
            .collect()
    }

    /// The data payloads, in order.
    pub fn data_items(&self) -> Vec<&Vec<u8>> {
        self.items
            .iter()
            .filter_map(|item| match item {
                YsfcItem::Data(bytes) => Some(bytes),
                YsfcItem::Entry(_) => None,
            })
            .collect()
    }
}

impl Summarizable for YsfcChunk {
    fn summary(&self) -> String {
        format!("{} with {} items", self.id, self.items.len())
    }

    fn name(&self) -> String {
        self.id.to_string()
    }
}

/// Decode a YSFC library into multi-samples and an optional performance.
#[instrument(skip(session, reader))]
pub fn read_library<R: Read + Seek>(
    session: &Session,
    reader: &mut R,
    source_name: &str,
) -> Result<DecodeOutcome, FormatError> {
    let notifier = session.notifier().as_ref();
    let file_len = reader.seek(SeekFrom::End(0))?;
    reader.seek(SeekFrom::Start(0))?;

    let header = YsfcHeader::read(reader)?;
    notifier.log(NotifyEvent::SourceFormat {
        description: header.summary(),
    });
    skip_bytes(reader, u64::from(header.library_size))?;

    let mut chunks = Vec::new();
    while reader.stream_position()? < file_len {
        chunks.push(YsfcChunk::read(reader)?);
    }

    let layout = header.workstation().key_bank_layout();
    let find = |id: FourCC| chunks.iter().find(|chunk| chunk.id == id);

    let mut multi_samples = Vec::new();
    if let (Some(wf_entries), Some(wf_data)) = (find(ID_EWFM), find(ID_DWFM)) {
        let entries = wf_entries.entries();
        let data = wf_data.data_items();
        if entries.len() != data.len() {
            return Err(FormatError::Parse {
                pos: None,
                message: format!(
                    "waveform lists disagree: {} entries, {} data items",
                    entries.len(),
                    data.len()
                ),
            });
        }
        let images: Vec<&Vec<u8>> = find(ID_DWIM).map(|c| c.data_items()).unwrap_or_default();
        for (index, (entry, bank_bytes)) in entries.iter().zip(&data).enumerate() {
            if session.cancel_token().is_cancelled() {
                break;
            }
            let banks = parse_key_banks(bank_bytes, layout)?;
            let waves = match images.get(index) {
                Some(bytes) => parse_wave_data(bytes)?,
                None => Vec::new(),
            };
            multi_samples.push(waveform_multi(entry, &banks, &waves, index, source_name)?);
        }
    }

    let performance = match (find(ID_EPFM), find(ID_DPFM)) {
        (Some(pf_entries), Some(pf_data)) => {
            let entries = pf_entries.entries();
            let data = pf_data.data_items();
            if entries.len() != data.len() {
                return Err(FormatError::Parse {
                    pos: None,
                    message: format!(
                        "performance lists disagree: {} entries, {} data items",
                        entries.len(),
                        data.len()
                    ),
                });
            }
            match entries.first().zip(data.first()) {
                Some((entry, bytes)) => Some(model_performance(entry, bytes, &multi_samples)?),
                None => None,
            }
        }
        _ => None,
    };

    Ok(DecodeOutcome {
        multi_samples: merge_grouped_waveforms(multi_samples),
        performance,
    })
}

/// Multi-group instruments are written as one waveform per group, named
/// `"instrument - group"`. Fold consecutive waveforms of one family back
/// into a single multi-sample with one group per waveform.
fn merge_grouped_waveforms(multis: Vec<MultiSample>) -> Vec<MultiSample> {
    let mut out: Vec<MultiSample> = Vec::new();
    for multi in multis {
        let family = multi.name.rsplit_once(" - ").map(|(prefix, suffix)| {
            (prefix.to_string(), suffix.to_string())
        });
        match family {
            Some((prefix, suffix)) => {
                let adopt = out
                    .last_mut()
                    .filter(|last| last.name == prefix)
                    .is_some();
                let mut group = multi.groups.into_iter().next().unwrap_or_default();
                group.name = suffix;
                if adopt {
                    if let Some(last) = out.last_mut() {
                        last.groups.push(group);
                    }
                } else {
                    let mut renamed = MultiSample::new(prefix);
                    renamed.metadata = multi.metadata;
                    renamed.groups.push(group);
                    out.push(renamed);
                }
            }
            None => out.push(multi),
        }
    }
    out
}

fn waveform_multi(
    entry: &EntryRecord,
    banks: &[KeyBank],
    waves: &[Vec<u8>],
    index: usize,
    source_name: &str,
) -> Result<MultiSample, FormatError> {
    let (category_value, clean_name) = category::split_category_prefix(&entry.item_name);
    let name = if clean_name.trim().is_empty() {
        format!("Waveform {}", index + 1)
    } else {
        clean_name.trim().to_string()
    };

    let mut multi = MultiSample::new(name.clone());
    multi.metadata.category = category_value
        .map(|value| {
            let sub = category::sub_category_name(value);
            if sub == "No Assign" {
                category::main_category_of_value(value)
                    .unwrap_or("No Assign")
                    .to_string()
            } else {
                sub.to_string()
            }
        })
        .or_else(|| category::infer_category(&[name.as_str(), source_name]));

    let mut group = Group::new(name.clone());
    let mut wave_index = 0usize;
    for (bank_index, bank) in banks.iter().enumerate() {
        let zone_name = if banks.len() == 1 {
            name.clone()
        } else {
            format!("{} {}", name, bank_index + 1)
        };
        if bank.channels == 2 {
            let left = wave(waves, wave_index, bank)?;
            let right = wave(waves, wave_index + 1, bank)?;
            wave_index += 2;
            if left.len() == right.len() {
                let frames = interleave_stereo(left, right);
                group
                    .zones
                    .push(zone_from_bank(bank, zone_name, 2, &frames, None));
            } else {
                // unequal halves: keep them apart, panned hard out
                group.zones.push(zone_from_bank(
                    bank,
                    format!("{zone_name} L"),
                    1,
                    left,
                    Some(-1.0),
                ));
                group.zones.push(zone_from_bank(
                    bank,
                    format!("{zone_name} R"),
                    1,
                    right,
                    Some(1.0),
                ));
            }
        } else {
            let mono = wave(waves, wave_index, bank)?;
            wave_index += 1;
            group
                .zones
                .push(zone_from_bank(bank, zone_name, 1, mono, None));
        }
    }
    multi.groups.push(group);
    Ok(multi)
}

fn wave<'a>(waves: &'a [Vec<u8>], index: usize, bank: &KeyBank) -> Result<&'a Vec<u8>, FormatError> {
    static EMPTY: Vec<u8> = Vec::new();
    if waves.is_empty() {
        // libraries without wave images still describe their mapping
        return Ok(&EMPTY);
    }
    waves.get(index).ok_or_else(|| FormatError::Parse {
        pos: None,
        message: format!(
            "key-bank for keys {}-{} needs wave data item {index}, none left",
            bank.key_range_lower, bank.key_range_upper
        ),
    })
}

fn zone_from_bank(
    bank: &KeyBank,
    zone_name: String,
    channels: u16,
    frames: &[u8],
    pan_override: Option<f64>,
) -> SampleZone {
    let mut zone = SampleZone::new(zone_name.clone());
    zone.key_low = bank.key_range_lower.min(127);
    zone.key_high = bank.key_range_upper.min(127);
    zone.key_root = bank.root_note.min(127);
    zone.velocity_low = bank.vel_lower.min(127);
    zone.velocity_high = bank.vel_upper.min(127);
    zone.normalize_ranges();
    zone.gain_db = level_to_db(bank.level).max(crate::model::MIN_GAIN_DB);
    zone.pan = pan_override.unwrap_or_else(|| pan_from_stored(bank.pan));
    zone.tune = (f64::from(bank.coarse_tune) - 64.0) + cents_from_fine(bank.fine_tune) / 100.0;
    zone.key_tracking = if bank.fixed_pitch { 0.0 } else { 1.0 };
    zone.stop = u64::from(bank.sample_length);
    if bank.loop_mode == 0 && bank.loop_end > bank.loop_start {
        zone.loops.push(SampleLoop {
            kind: crate::model::LoopKind::Forward,
            start: u64::from(bank.loop_start),
            end: u64::from(bank.loop_end),
            crossfade: 0,
        });
    }
    zone.sample = Some(SampleData::Memory(Arc::new(MemorySample {
        name: format!("{zone_name}.wav"),
        metadata: AudioMetadata {
            channels,
            sample_rate: bank.sample_frequency,
            bits_per_sample: 16,
            frame_count: u64::from(bank.sample_length),
        },
        bytes: build_pcm16_wav(channels, bank.sample_frequency, frames),
    })));
    zone
}

fn model_performance(
    entry: &EntryRecord,
    bytes: &[u8],
    multis: &[MultiSample],
) -> Result<Performance, FormatError> {
    let data = PerformanceData::parse(bytes)?;
    let (_, clean_name) = category::split_category_prefix(&entry.item_name);
    let mut performance = Performance {
        name: clean_name.to_string(),
        slots: Vec::new(),
    };
    for (part_index, part) in data.parts.iter().enumerate() {
        for element in &part.elements {
            let Some(multi) = (element.waveform_number as usize)
                .checked_sub(1)
                .and_then(|index| multis.get(index))
            else {
                continue;
            };
            let mut layered = multi.clone();
            let envelope: Envelope = element.amplitude_envelope();
            for zone in layered.zones_mut() {
                zone.amplitude_envelope = Some(envelope);
            }
            performance.slots.push(PerformanceSlot {
                multi_sample: layered,
                midi_channel: part_index.min(15) as u8,
                key_low: 0,
                key_high: 127,
            });
        }
    }
    Ok(performance)
}

#[allow(clippy::dbg_macro)]
#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn version_numbers() {
        assert_eq!(parse_version_number("4.0.4"), 404);
        assert_eq!(parse_version_number("1.0.3"), 103);
        assert_eq!(parse_version_number("garbage"), 0);
    }

    #[test]
    fn workstation_inference() {
        assert_eq!(Workstation::from_version(101), Workstation::MotifXs);
        assert_eq!(Workstation::from_version(102), Workstation::MotifXf);
        assert_eq!(Workstation::from_version(103), Workstation::Moxf);
        assert_eq!(Workstation::from_version(404), Workstation::Montage);
        assert_eq!(Workstation::from_version(500), Workstation::Modx);
        assert_eq!(
            Workstation::Montage.key_bank_layout(),
            KeyBankLayout::Version2
        );
        assert_eq!(
            Workstation::Moxf.key_bank_layout(),
            KeyBankLayout::Version1 { moxf: true }
        );
    }

    #[test]
    fn chunk_roundtrip() {
        let chunk = YsfcChunk {
            id: ID_EWFM,
            items: vec![
                YsfcItem::Entry(EntryRecord::named("0:Test")),
                YsfcItem::Data(vec![1, 2, 3]),
            ],
        };
        let bytes = chunk.to_bytes().expect("serialize chunk");
        let mut cursor = binrw::io::Cursor::new(&bytes[..]);
        let back = YsfcChunk::read(&mut cursor).expect("parse chunk");
        assert_eq!(back, chunk);
        assert_eq!(back.entries().len(), 1);
        assert_eq!(back.data_items().len(), 1);
    }

    #[test]
    fn bad_item_marker_rejected() {
        let chunk = YsfcChunk {
            id: ID_DWIM,
            items: vec![YsfcItem::Data(vec![0; 4])],
        };
        let mut bytes = chunk.to_bytes().expect("serialize");
        bytes[12..16].copy_from_slice(b"Junk");
        let err = YsfcChunk::read(&mut binrw::io::Cursor::new(&bytes[..]))
            .expect_err("marker must be Entr or Data");
        assert!(matches!(err, FormatError::BadMagic { .. }));
    }
}
