//! Semantic decoding of Kontakt 5+ preset chunks.
//!
//! Field layout inside a chunk's public data depends on the chunk's
//! structure version, so every record parser takes the version and gates
//! with explicit if-chains. Unknown trailing bytes are kept on the record
//! and written back verbatim.

use binrw::io::{Cursor, Read, Write};
use binrw::{BinRead, BinResult, BinWrite};
use tracing::{debug, warn};

use crate::kontakt::chunk::{id, ChunkPayload, ListEntry, PresetChunk, StructureData};
use crate::kontakt::filelist::FileList;
use crate::kontakt::modulator::InternalModulator;
use crate::kontakt::nki2::icon_name;
use crate::model::{
    clamp_pan, tune_combine, value_to_db, AudioMetadata, Envelope, Group, LoopKind, MultiSample,
    Performance, PerformanceSlot, SampleData, SampleLoop, SampleZone, TriggerKind,
};
use crate::strings::{read_utf16_prefixed, write_utf16_prefixed};
use crate::{DecodeOutcome, FormatError, Notifier, NotifyEvent};

/// Highest supported program chunk version.
pub const MAX_PROGRAM_VERSION: u16 = 0xB1;
/// Highest supported group chunk version.
pub const MAX_GROUP_VERSION: u16 = 0x9C;
/// Zone chunk versions with a known layout.
pub const ZONE_VERSIONS: [u16; 5] = [0x93, 0x98, 0x99, 0x9A, 0x9C];

/// Kontakt release range a program chunk version maps to.
pub fn release_for_program_version(version: u16) -> Option<&'static str> {
    match version {
        0x80 => Some("4.2.x"),
        0xA5 => Some("5.3.0"),
        0xA8 => Some("5.4.3 - 5.5.2"),
        0xAB => Some("5.6.8 - 5.8.1"),
        0xAE => Some("6.5.2 - 6.8.0"),
        0xAF => Some("7.1.3 - 7.5.1"),
        0xB1 => Some("7.6.0 - 7.6.1"),
        _ => None,
    }
}

fn optional_text(text: String) -> Option<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() || trimmed == "(null)" {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn unsupported(what: &str, version: u16) -> FormatError {
    FormatError::UnsupportedVersion {
        what: what.to_string(),
        version: format!("{version:#04X}"),
    }
}

// program
// ----

/// Public data of a PROGRAM chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgramData {
    /// Instrument name.
    pub name: String,
    /// Total sample pool size in bytes.
    pub sample_pool_size: f64,
    /// Global transpose in semitones.
    pub transpose: i8,
    /// Program volume as a linear factor.
    pub volume: f32,
    /// Program pan, -1..=+1.
    pub pan: f32,
    /// Program tune as a `2^(st/12)` factor.
    pub tune: f32,
    /// Velocity/key clipping bounds: low vel, high vel, low key, high key.
    pub clipping: [u8; 4],
    /// Default key-switch key.
    pub default_key_switch: u16,
    /// Preload buffer size.
    pub preload_size: u32,
    /// Library id.
    pub library_id: u32,
    /// Content fingerprint.
    pub fingerprint: u32,
    /// Loading flags.
    pub loading_flags: u32,
    /// Group solo active.
    pub group_solo: bool,
    /// Instrument icon id.
    pub icon_id: u32,
    /// Credits text.
    pub credits: Option<String>,
    /// Author text.
    pub author: Option<String>,
    /// Info URL.
    pub url: Option<String>,
    /// Three category indices.
    pub categories: [u16; 3],
    /// Version-dependent trailing bytes, preserved verbatim.
    pub trailing: Vec<u8>,
}

impl Default for ProgramData {
    fn default() -> Self {
        ProgramData {
            name: String::new(),
            sample_pool_size: 0.0,
            transpose: 0,
            volume: 1.0,
            pan: 0.0,
            tune: 1.0,
            clipping: [0, 127, 0, 127],
            default_key_switch: 0,
            preload_size: 0,
            library_id: 0,
            fingerprint: 0,
            loading_flags: 0,
            group_solo: false,
            icon_id: 28, // "New"
            credits: None,
            author: None,
            url: None,
            categories: [0, 0, 0],
            trailing: Vec::new(),
        }
    }
}

impl ProgramData {
    /// Parse program public data of the given chunk version.
    pub fn parse(version: u16, bytes: &[u8]) -> Result<Self, FormatError> {
        if version > MAX_PROGRAM_VERSION {
            return Err(unsupported("program chunk", version));
        }
        if release_for_program_version(version).is_none() {
            debug!("program chunk version {version:#04X} has no known release mapping");
        }
        let mut cursor = Cursor::new(bytes);
        let name = read_utf16_prefixed(&mut cursor)?;
        let sample_pool_size = f64::read_le(&mut cursor)?;
        let transpose = i8::read_le(&mut cursor)?;
        let volume = f32::read_le(&mut cursor)?;
        let pan = f32::read_le(&mut cursor)?;
        let tune = f32::read_le(&mut cursor)?;
        let mut clipping = [0u8; 4];
        cursor.read_exact(&mut clipping)?;
        let default_key_switch = u16::read_le(&mut cursor)?;
        let preload_size = u32::read_le(&mut cursor)?;
        let library_id = u32::read_le(&mut cursor)?;
        let fingerprint = u32::read_le(&mut cursor)?;
        let loading_flags = u32::read_le(&mut cursor)?;
        let group_solo = u8::read_le(&mut cursor)? != 0;
        let icon_id = u32::read_le(&mut cursor)?;
        let credits = optional_text(read_utf16_prefixed(&mut cursor)?);
        let author = optional_text(read_utf16_prefixed(&mut cursor)?);
        let url = optional_text(read_utf16_prefixed(&mut cursor)?);
        let categories = [
            u16::read_le(&mut cursor)?,
            u16::read_le(&mut cursor)?,
            u16::read_le(&mut cursor)?,
        ];
        let mut trailing = Vec::new();
        cursor.read_to_end(&mut trailing)?;
        Ok(ProgramData {
            name,
            sample_pool_size,
            transpose,
            volume,
            pan,
            tune,
            clipping,
            default_key_switch,
            preload_size,
            library_id,
            fingerprint,
            loading_flags,
            group_solo,
            icon_id,
            credits,
            author,
            url,
            categories,
            trailing,
        })
    }

    /// Serialize back into public data bytes.
    pub fn to_bytes(&self) -> BinResult<Vec<u8>> {
        let mut cursor = Cursor::new(Vec::new());
        write_utf16_prefixed(&mut cursor, &self.name)?;
        self.sample_pool_size.write_le(&mut cursor)?;
        self.transpose.write_le(&mut cursor)?;
        self.volume.write_le(&mut cursor)?;
        self.pan.write_le(&mut cursor)?;
        self.tune.write_le(&mut cursor)?;
        cursor.write_all(&self.clipping)?;
        self.default_key_switch.write_le(&mut cursor)?;
        self.preload_size.write_le(&mut cursor)?;
        self.library_id.write_le(&mut cursor)?;
        self.fingerprint.write_le(&mut cursor)?;
        self.loading_flags.write_le(&mut cursor)?;
        u8::from(self.group_solo).write_le(&mut cursor)?;
        self.icon_id.write_le(&mut cursor)?;
        write_utf16_prefixed(&mut cursor, self.credits.as_deref().unwrap_or(""))?;
        write_utf16_prefixed(&mut cursor, self.author.as_deref().unwrap_or(""))?;
        write_utf16_prefixed(&mut cursor, self.url.as_deref().unwrap_or(""))?;
        for category in self.categories {
            category.write_le(&mut cursor)?;
        }
        cursor.write_all(&self.trailing)?;
        Ok(cursor.into_inner())
    }

    /// Build program data from a multi-sample, for the write path.
    pub fn from_model(multi: &MultiSample) -> Self {
        ProgramData {
            name: multi.name.clone(),
            author: multi.metadata.creator.clone(),
            credits: multi.metadata.description.clone(),
            ..ProgramData::default()
        }
    }
}

// group
// ----

/// Public data of a GROUP chunk or group-list entry.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupData {
    /// Group name.
    pub name: String,
    /// Group volume factor.
    pub volume: f32,
    /// Group pan, -1..=+1.
    pub pan: f32,
    /// Group tune factor.
    pub tune: f32,
    /// Zone pitch follows the key.
    pub key_tracking: bool,
    /// Reverse playback.
    pub reverse: bool,
    /// Zones trigger on note-off.
    pub release_trigger: bool,
    /// Monophonic release triggering.
    pub release_trigger_monophonic: bool,
    /// Group muted.
    pub muted: bool,
    /// Group soloed.
    pub soloed: bool,
    /// Release trigger counter.
    pub release_trigger_counter: i32,
    /// MIDI channel, -1 = omni.
    pub midi_channel: i16,
    /// Voice group index, -1 = none.
    pub voice_group_index: i32,
    /// FX index of the amp split point.
    pub fx_index_amp_split_point: i32,
    /// Interpolation quality setting.
    pub interpolation_quality: i32,
    /// Trailing bytes, preserved.
    pub trailing: Vec<u8>,
}

impl Default for GroupData {
    fn default() -> Self {
        GroupData {
            name: String::new(),
            volume: 1.0,
            pan: 0.0,
            tune: 1.0,
            key_tracking: true,
            reverse: false,
            release_trigger: false,
            release_trigger_monophonic: false,
            muted: false,
            soloed: false,
            release_trigger_counter: 0,
            midi_channel: -1,
            voice_group_index: -1,
            fx_index_amp_split_point: 0,
            interpolation_quality: 0,
            trailing: Vec::new(),
        }
    }
}

impl GroupData {
    /// Parse group public data of the given structure version.
    pub fn parse(version: u16, bytes: &[u8]) -> Result<Self, FormatError> {
        if version > MAX_GROUP_VERSION {
            return Err(unsupported("group chunk", version));
        }
        let mut cursor = Cursor::new(bytes);
        let name = read_utf16_prefixed(&mut cursor)?;
        let volume = f32::read_le(&mut cursor)?;
        let pan = f32::read_le(&mut cursor)?;
        let tune = f32::read_le(&mut cursor)?;
        let key_tracking = u8::read_le(&mut cursor)? != 0;
        let reverse = u8::read_le(&mut cursor)? != 0;
        let release_trigger = u8::read_le(&mut cursor)? != 0;
        let release_trigger_monophonic = u8::read_le(&mut cursor)? != 0;
        let muted = u8::read_le(&mut cursor)? != 0;
        let soloed = u8::read_le(&mut cursor)? != 0;
        let release_trigger_counter = i32::read_le(&mut cursor)?;
        let midi_channel = i16::read_le(&mut cursor)?;
        let voice_group_index = i32::read_le(&mut cursor)?;
        let fx_index_amp_split_point = i32::read_le(&mut cursor)?;
        let interpolation_quality = i32::read_le(&mut cursor)?;
        let mut trailing = Vec::new();
        cursor.read_to_end(&mut trailing)?;
        Ok(GroupData {
            name,
            volume,
            pan,
            tune,
            key_tracking,
            reverse,
            release_trigger,
            release_trigger_monophonic,
            muted,
            soloed,
            release_trigger_counter,
            midi_channel,
            voice_group_index,
            fx_index_amp_split_point,
            interpolation_quality,
            trailing,
        })
    }

    /// Serialize back into public data bytes.
    pub fn to_bytes(&self) -> BinResult<Vec<u8>> {
        let mut cursor = Cursor::new(Vec::new());
        write_utf16_prefixed(&mut cursor, &self.name)?;
        self.volume.write_le(&mut cursor)?;
        self.pan.write_le(&mut cursor)?;
        self.tune.write_le(&mut cursor)?;
        u8::from(self.key_tracking).write_le(&mut cursor)?;
        u8::from(self.reverse).write_le(&mut cursor)?;
        u8::from(self.release_trigger).write_le(&mut cursor)?;
        u8::from(self.release_trigger_monophonic).write_le(&mut cursor)?;
        u8::from(self.muted).write_le(&mut cursor)?;
        u8::from(self.soloed).write_le(&mut cursor)?;
        self.release_trigger_counter.write_le(&mut cursor)?;
        self.midi_channel.write_le(&mut cursor)?;
        self.voice_group_index.write_le(&mut cursor)?;
        self.fx_index_amp_split_point.write_le(&mut cursor)?;
        self.interpolation_quality.write_le(&mut cursor)?;
        cursor.write_all(&self.trailing)?;
        Ok(cursor.into_inner())
    }

    /// Build group data from a model group.
    pub fn from_model(group: &Group) -> Self {
        GroupData {
            name: group.name.clone(),
            reverse: group.reversed,
            key_tracking: group.key_tracking,
            release_trigger: group.trigger == TriggerKind::Release,
            voice_group_index: group
                .round_robin
                .map(|idx| idx as i32)
                .unwrap_or(-1),
            ..GroupData::default()
        }
    }
}

// zone
// ----

/// Sample descriptor trailing a zone record.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ZoneSampleInfo {
    /// Index into the preset's filename table.
    pub filename_id: u32,
    /// Sample data type: 2 = 16-bit, 3 = 24-bit.
    pub sample_data_type: u32,
    /// Frames per second.
    pub sample_rate: u32,
    /// Channel count.
    pub num_channels: u8,
    /// Total frames.
    pub num_frames: u32,
    /// Extra u32 present in zone versions <= 0x93.
    pub legacy: Option<u32>,
    /// Unknown field, preserved.
    pub unknown: u32,
    /// Root note as stored on the descriptor.
    pub root_note: u32,
    /// Sample tuning.
    pub tuning: f32,
    /// Tail flag byte, preserved.
    pub tail_flag: u8,
    /// Tail field, preserved.
    pub tail: u32,
}

impl ZoneSampleInfo {
    /// Bits per sample implied by `sample_data_type`.
    pub fn bits_per_sample(&self) -> u16 {
        match self.sample_data_type {
            2 => 16,
            3 => 24,
            other => {
                warn!("unexpected sample data type {other}, assuming 16-bit");
                16
            }
        }
    }

    /// The descriptor as model metadata.
    pub fn audio_metadata(&self) -> AudioMetadata {
        AudioMetadata {
            channels: u16::from(self.num_channels),
            sample_rate: self.sample_rate,
            bits_per_sample: self.bits_per_sample(),
            frame_count: u64::from(self.num_frames),
        }
    }
}

/// Public data of a ZONE chunk or zone-list entry.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ZoneData {
    /// First frame to play.
    pub sample_start: u32,
    /// One past the last frame to play.
    pub sample_end: u32,
    /// Start modulation range.
    pub start_mod_range: u32,
    /// Lowest velocity.
    pub low_velocity: u16,
    /// Highest velocity.
    pub high_velocity: u16,
    /// Lowest key.
    pub low_key: u16,
    /// Highest key.
    pub high_key: u16,
    /// Velocity crossfade below the range.
    pub fade_low_velocity: u16,
    /// Velocity crossfade above the range.
    pub fade_high_velocity: u16,
    /// Key crossfade below the range.
    pub fade_low_key: u16,
    /// Key crossfade above the range.
    pub fade_high_key: u16,
    /// Root key.
    pub root_key: u16,
    /// Zone volume factor.
    pub volume: f32,
    /// Zone pan, -1..=+1.
    pub pan: f32,
    /// Zone tune factor.
    pub tune: f32,
    /// The 1+1+4 bytes versions 0x9A/0x9C insert before the descriptor.
    pub extra: Option<[u8; 6]>,
    /// Sample descriptor; `None` for script-only zones.
    pub sample: Option<ZoneSampleInfo>,
}

impl ZoneData {
    /// Parse zone public data of the given structure version.
    pub fn parse(version: u16, bytes: &[u8]) -> Result<Self, FormatError> {
        if !ZONE_VERSIONS.contains(&version) {
            return Err(unsupported("zone chunk", version));
        }
        let mut cursor = Cursor::new(bytes);
        let sample_start = u32::read_le(&mut cursor)?;
        let sample_end = u32::read_le(&mut cursor)?;
        let start_mod_range = u32::read_le(&mut cursor)?;
        let low_velocity = u16::read_le(&mut cursor)?;
        let high_velocity = u16::read_le(&mut cursor)?;
        let low_key = u16::read_le(&mut cursor)?;
        let high_key = u16::read_le(&mut cursor)?;
        let fade_low_velocity = u16::read_le(&mut cursor)?;
        let fade_high_velocity = u16::read_le(&mut cursor)?;
        let fade_low_key = u16::read_le(&mut cursor)?;
        let fade_high_key = u16::read_le(&mut cursor)?;
        let root_key = u16::read_le(&mut cursor)?;
        let volume = f32::read_le(&mut cursor)?;
        let pan = f32::read_le(&mut cursor)?;
        let tune = f32::read_le(&mut cursor)?;

        let extra = if version >= 0x9A {
            let mut raw = [0u8; 6];
            cursor.read_exact(&mut raw)?;
            Some(raw)
        } else {
            None
        };

        // script-only zones stop here
        let sample = if (cursor.position() as usize) < bytes.len() {
            let filename_id = u32::read_le(&mut cursor)?;
            let sample_data_type = u32::read_le(&mut cursor)?;
            let sample_rate = u32::read_le(&mut cursor)?;
            let num_channels = u8::read_le(&mut cursor)?;
            let num_frames = u32::read_le(&mut cursor)?;
            let legacy = if version <= 0x93 {
                Some(u32::read_le(&mut cursor)?)
            } else {
                None
            };
            let unknown = u32::read_le(&mut cursor)?;
            let root_note = u32::read_le(&mut cursor)?;
            let tuning = f32::read_le(&mut cursor)?;
            let tail_flag = u8::read_le(&mut cursor)?;
            let tail = u32::read_le(&mut cursor)?;
            Some(ZoneSampleInfo {
                filename_id,
                sample_data_type,
                sample_rate,
                num_channels,
                num_frames,
                legacy,
                unknown,
                root_note,
                tuning,
                tail_flag,
                tail,
            })
        } else {
            None
        };

        Ok(ZoneData {
            sample_start,
            sample_end,
            start_mod_range,
            low_velocity,
            high_velocity,
            low_key,
            high_key,
            fade_low_velocity,
            fade_high_velocity,
            fade_low_key,
            fade_high_key,
            root_key,
            volume,
            pan,
            tune,
            extra,
            sample,
        })
    }

    /// Serialize for the given structure version.
    pub fn to_bytes(&self, version: u16) -> Result<Vec<u8>, FormatError> {
        if !ZONE_VERSIONS.contains(&version) {
            return Err(unsupported("zone chunk", version));
        }
        let mut cursor = Cursor::new(Vec::new());
        self.sample_start.write_le(&mut cursor)?;
        self.sample_end.write_le(&mut cursor)?;
        self.start_mod_range.write_le(&mut cursor)?;
        self.low_velocity.write_le(&mut cursor)?;
        self.high_velocity.write_le(&mut cursor)?;
        self.low_key.write_le(&mut cursor)?;
        self.high_key.write_le(&mut cursor)?;
        self.fade_low_velocity.write_le(&mut cursor)?;
        self.fade_high_velocity.write_le(&mut cursor)?;
        self.fade_low_key.write_le(&mut cursor)?;
        self.fade_high_key.write_le(&mut cursor)?;
        self.root_key.write_le(&mut cursor)?;
        self.volume.write_le(&mut cursor)?;
        self.pan.write_le(&mut cursor)?;
        self.tune.write_le(&mut cursor)?;
        if version >= 0x9A {
            cursor.write_all(&self.extra.unwrap_or([0u8; 6]))?;
        }
        if let Some(sample) = &self.sample {
            sample.filename_id.write_le(&mut cursor)?;
            sample.sample_data_type.write_le(&mut cursor)?;
            sample.sample_rate.write_le(&mut cursor)?;
            sample.num_channels.write_le(&mut cursor)?;
            sample.num_frames.write_le(&mut cursor)?;
            if version <= 0x93 {
                sample.legacy.unwrap_or(0).write_le(&mut cursor)?;
            }
            sample.unknown.write_le(&mut cursor)?;
            sample.root_note.write_le(&mut cursor)?;
            sample.tuning.write_le(&mut cursor)?;
            sample.tail_flag.write_le(&mut cursor)?;
            sample.tail.write_le(&mut cursor)?;
        }
        Ok(cursor.into_inner())
    }
}

// loops
// ----

/// Loop until the sample ends.
pub const LOOP_UNTIL_END: i32 = 0x1;
/// Alternate encoding of [`LOOP_UNTIL_END`].
pub const LOOP_UNTIL_END_ALT: i32 = 0x0100_6000;
/// Loop until note release.
pub const LOOP_UNTIL_RELEASE: i32 = 0x0;
/// Alternate encoding of [`LOOP_UNTIL_RELEASE`].
pub const LOOP_UNTIL_RELEASE_ALT: i32 = 0x3F80;
/// One-shot, no loop.
pub const LOOP_ONESHOT: i32 = 0x8000_0001_u32 as i32;

/// Spacer constant preceding every present loop record.
const LOOP_SPACER: u16 = 0x60;

/// One wire loop record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoopRecord {
    /// Loop mode constant.
    pub mode: i32,
    /// Loop start frame.
    pub start: u32,
    /// Loop length in frames.
    pub length: u32,
    /// Repeat count, 0 = infinite.
    pub count: u32,
    /// Non-zero for alternating (ping-pong) playback.
    pub alternating: u8,
    /// Loop tuning.
    pub tuning: f32,
    /// Crossfade length in frames.
    pub crossfade: u32,
}

impl LoopRecord {
    /// Map to the model; only sustain loops survive, other modes produce
    /// no loop.
    pub fn to_model(&self) -> Option<SampleLoop> {
        match self.mode {
            LOOP_UNTIL_END | LOOP_UNTIL_RELEASE => Some(SampleLoop {
                kind: if self.alternating != 0 {
                    LoopKind::Alternating
                } else {
                    LoopKind::Forward
                },
                start: u64::from(self.start),
                end: u64::from(self.start) + u64::from(self.length),
                crossfade: u64::from(self.crossfade),
            }),
            LOOP_UNTIL_END_ALT | LOOP_UNTIL_RELEASE_ALT | LOOP_ONESHOT => None,
            other => {
                debug!("loop mode {other:#X} has no model mapping");
                None
            }
        }
    }

    /// Build a wire record from a model loop.
    pub fn from_model(sample_loop: &SampleLoop) -> Self {
        LoopRecord {
            mode: LOOP_UNTIL_END,
            start: sample_loop.start as u32,
            length: sample_loop.len() as u32,
            count: 0,
            alternating: u8::from(sample_loop.kind == LoopKind::Alternating),
            tuning: 0.0,
            crossfade: sample_loop.crossfade as u32,
        }
    }
}

/// Parse a LOOP_ARRAY public-data payload: a presence bitmask, then a
/// spacer and record per set bit.
pub fn parse_loop_array(bytes: &[u8]) -> Result<Vec<LoopRecord>, FormatError> {
    let mut cursor = Cursor::new(bytes);
    let bitmask = u16::read_le(&mut cursor)?;
    let mut records = Vec::new();
    for bit in 0..8 {
        if bitmask & (1 << bit) == 0 {
            continue;
        }
        let pos = cursor.position();
        let spacer = u16::read_le(&mut cursor)?;
        if spacer != LOOP_SPACER {
            return Err(FormatError::Parse {
                pos: Some(pos),
                message: format!("loop spacer {spacer:#06X}, expected 0x0060"),
            });
        }
        records.push(LoopRecord {
            mode: i32::read_le(&mut cursor)?,
            start: u32::read_le(&mut cursor)?,
            length: u32::read_le(&mut cursor)?,
            count: u32::read_le(&mut cursor)?,
            alternating: u8::read_le(&mut cursor)?,
            tuning: f32::read_le(&mut cursor)?,
            crossfade: u32::read_le(&mut cursor)?,
        });
    }
    Ok(records)
}

/// Serialize loop records into a LOOP_ARRAY public-data payload.
pub fn write_loop_array(records: &[LoopRecord]) -> BinResult<Vec<u8>> {
    let mut cursor = Cursor::new(Vec::new());
    let mut bitmask = 0u16;
    for bit in 0..records.len().min(8) {
        bitmask |= 1 << bit;
    }
    bitmask.write_le(&mut cursor)?;
    for record in records.iter().take(8) {
        LOOP_SPACER.write_le(&mut cursor)?;
        record.mode.write_le(&mut cursor)?;
        record.start.write_le(&mut cursor)?;
        record.length.write_le(&mut cursor)?;
        record.count.write_le(&mut cursor)?;
        record.alternating.write_le(&mut cursor)?;
        record.tuning.write_le(&mut cursor)?;
        record.crossfade.write_le(&mut cursor)?;
    }
    Ok(cursor.into_inner())
}

// tree decoding
// ----

/// Decode a preset chunk tree into multi-samples and, for multis, a
/// performance.
pub fn decode_preset_tree(
    chunks: &[PresetChunk],
    source_name: &str,
    notifier: &dyn Notifier,
) -> Result<DecodeOutcome, FormatError> {
    let mut programs = Vec::new();
    collect_programs(chunks, &mut programs);
    if programs.is_empty() {
        return Err(FormatError::Parse {
            pos: None,
            message: format!("{source_name}: no program chunk in preset tree"),
        });
    }
    for chunk in chunks {
        if !id::is_known(chunk.id) {
            notifier.log(NotifyEvent::UnknownChunk {
                id: format!("{:#04X}", chunk.id),
                pos: 0,
            });
        }
    }

    let file_list = find_file_list(chunks);

    let mut multi_samples = Vec::new();
    for program in &programs {
        multi_samples.push(decode_program(program, file_list.as_ref(), source_name, notifier)?);
    }

    let performance = if multi_samples.len() > 1 {
        Some(Performance {
            name: source_name
                .rsplit_once('.')
                .map(|(stem, _)| stem.to_string())
                .unwrap_or_else(|| source_name.to_string()),
            slots: multi_samples
                .iter()
                .zip(&programs)
                .enumerate()
                .map(|(index, (multi, program))| {
                    let data = program_data_of(program);
                    let (key_low, key_high) = data
                        .map(|d| (d.clipping[2], d.clipping[3]))
                        .unwrap_or((0, 127));
                    PerformanceSlot {
                        multi_sample: multi.clone(),
                        midi_channel: index as u8,
                        key_low,
                        key_high,
                    }
                })
                .collect(),
        })
    } else {
        None
    };

    Ok(DecodeOutcome {
        multi_samples,
        performance,
    })
}

fn collect_programs<'a>(chunks: &'a [PresetChunk], programs: &mut Vec<&'a PresetChunk>) {
    for chunk in chunks {
        if chunk.id == id::PROGRAM && chunk.structure().is_some() {
            programs.push(chunk);
            continue;
        }
        match &chunk.payload {
            ChunkPayload::Structured(data) => collect_programs(&data.children, programs),
            ChunkPayload::List(entries) => {
                for entry in entries {
                    collect_programs(&entry.structure.children, programs);
                }
            }
            ChunkPayload::Array16(slots) => {
                for slot in slots.iter().flatten() {
                    if let Some(data) = slot.structure() {
                        collect_programs(&data.children, programs);
                    }
                }
            }
            ChunkPayload::Opaque(_) => {}
        }
    }
}

fn program_data_of(chunk: &PresetChunk) -> Option<ProgramData> {
    let structure = chunk.structure()?;
    ProgramData::parse(structure.version, &structure.public_data).ok()
}

fn find_file_list(chunks: &[PresetChunk]) -> Option<FileList> {
    for chunk in chunks {
        if chunk.id == id::FILENAME_LIST || chunk.id == id::FILENAME_LIST_EX {
            let bytes = match &chunk.payload {
                ChunkPayload::Structured(data) => Some(&data.public_data),
                ChunkPayload::Opaque(_) | ChunkPayload::List(_) | ChunkPayload::Array16(_) => None,
            };
            if let Some(bytes) = bytes {
                if let Ok(list) = FileList::parse(bytes) {
                    return Some(list);
                }
            }
        }
        if let ChunkPayload::Structured(data) = &chunk.payload {
            if let Some(list) = find_file_list(&data.children) {
                return Some(list);
            }
        }
    }
    None
}

fn decode_program(
    chunk: &PresetChunk,
    file_list: Option<&FileList>,
    source_name: &str,
    notifier: &dyn Notifier,
) -> Result<MultiSample, FormatError> {
    let structure = chunk.structure().ok_or_else(|| FormatError::Parse {
        pos: None,
        message: "program chunk is not structured".to_string(),
    })?;
    let program = ProgramData::parse(structure.version, &structure.public_data)?;

    let name = if program.name.trim().is_empty() {
        source_name
            .rsplit_once('.')
            .map(|(stem, _)| stem.to_string())
            .unwrap_or_else(|| source_name.to_string())
    } else {
        program.name.clone()
    };
    let mut multi = MultiSample::new(name);
    multi.metadata.creator = program.author.clone();
    multi.metadata.description = program.credits.clone();
    if let Some(url) = &program.url {
        multi.metadata.keywords.push(url.clone());
    }
    multi.metadata.category = icon_name(program.icon_id).map(str::to_string);

    // groups first, then zones are attached by their group reference
    let mut group_data: Vec<GroupData> = Vec::new();
    let mut group_envelopes: Vec<Option<Envelope>> = Vec::new();
    if let Some(group_list) = structure.find_child(id::GROUP_LIST) {
        if let Some(entries) = group_list.entries() {
            for entry in entries {
                let data = GroupData::parse(entry.structure.version, &entry.structure.public_data)?;
                group_envelopes.push(group_envelope(entry, notifier));
                multi.groups.push(model_group(&data));
                group_data.push(data);
            }
        }
    }
    if let Some(zone_list) = structure.find_child(id::ZONE_LIST) {
        if let Some(entries) = zone_list.entries() {
            if multi.groups.is_empty() && !entries.is_empty() {
                // zones need a home even when the group list is absent
                multi.groups.push(Group::new("Group 1"));
                group_data.push(GroupData::default());
                group_envelopes.push(None);
            }
            for (index, entry) in entries.iter().enumerate() {
                let zone_data =
                    ZoneData::parse(entry.structure.version, &entry.structure.public_data)?;
                let group_index = entry
                    .reference
                    .map(|r| r as usize)
                    .filter(|r| *r < multi.groups.len())
                    .unwrap_or(0);
                let zone = model_zone(
                    &zone_data,
                    entry,
                    index,
                    &program,
                    &group_data[group_index],
                    group_envelopes[group_index],
                    file_list,
                )?;
                multi.groups[group_index].zones.push(zone);
            }
        }
    }

    Ok(multi)
}

fn model_group(data: &GroupData) -> Group {
    Group {
        name: data.name.clone(),
        trigger: if data.release_trigger {
            TriggerKind::Release
        } else {
            TriggerKind::Attack
        },
        key_tracking: data.key_tracking,
        reversed: data.reverse,
        tune: 0.0, // folded into each zone's combined tune
        round_robin: (data.voice_group_index >= 0).then_some(data.voice_group_index as u32),
        zones: Vec::new(),
    }
}

fn group_envelope(entry: &ListEntry, notifier: &dyn Notifier) -> Option<Envelope> {
    let array = entry.structure.find_child(id::PARAMETER_ARRAY_16)?;
    let ChunkPayload::Array16(slots) = &array.payload else {
        return None;
    };
    for slot in slots.iter().flatten() {
        if slot.id != id::PAR_INTERNAL_MOD && slot.id != id::PAR_MOD_BASE {
            continue;
        }
        let Some(structure) = slot.structure() else {
            continue;
        };
        let Ok((modulator, fallbacks)) = InternalModulator::parse(&structure.public_data) else {
            debug!("unparsable internal modulator, skipping");
            continue;
        };
        for (parameter, description) in fallbacks {
            notifier.log(NotifyEvent::PaddingFallback {
                parameter,
                modulator: description,
            });
        }
        let targets_volume = modulator
            .targets
            .iter()
            .any(|target| target.parameter == "volume");
        if let Some(block) = &modulator.envelope {
            if targets_volume {
                return Some(Envelope {
                    curve: f64::from(block.curve),
                    attack: f64::from(block.attack) / 1000.0,
                    hold: f64::from(block.hold) / 1000.0,
                    decay: f64::from(block.decay) / 1000.0,
                    sustain: f64::from(block.sustain).clamp(0.0, 1.0),
                    release: f64::from(block.release) / 1000.0,
                    ahd_only: block.ahd_only,
                });
            }
        }
    }
    None
}

#[allow(clippy::too_many_arguments)]
fn model_zone(
    data: &ZoneData,
    entry: &ListEntry,
    index: usize,
    program: &ProgramData,
    group: &GroupData,
    envelope: Option<Envelope>,
    file_list: Option<&FileList>,
) -> Result<SampleZone, FormatError> {
    let path = data
        .sample
        .as_ref()
        .and_then(|info| file_list.and_then(|list| list.path(info.filename_id)))
        .map(str::to_string);

    let name = path
        .as_deref()
        .and_then(|p| p.rsplit('/').next())
        .map(|file| match file.rsplit_once('.') {
            Some((stem, _)) => stem.to_string(),
            None => file.to_string(),
        })
        .unwrap_or_else(|| format!("Zone {}", index + 1));

    let mut zone = SampleZone::new(name);
    zone.start = u64::from(data.sample_start);
    zone.stop = u64::from(data.sample_end);
    zone.key_low = data.low_key.min(127) as u8;
    zone.key_high = data.high_key.min(127) as u8;
    zone.key_root = data.root_key.min(127) as u8;
    zone.velocity_low = data.low_velocity.min(127) as u8;
    zone.velocity_high = data.high_velocity.min(127) as u8;
    zone.normalize_ranges();
    zone.key_fade_low = data.fade_low_key;
    zone.key_fade_high = data.fade_high_key;
    zone.velocity_fade_low = data.fade_low_velocity;
    zone.velocity_fade_high = data.fade_high_velocity;

    // the wire stores volume and tune multiplicatively on three levels
    zone.gain_db = value_to_db(
        f64::from(program.volume) * f64::from(group.volume) * f64::from(data.volume),
    );
    zone.pan = clamp_pan(f64::from(program.pan) + f64::from(group.pan) + f64::from(data.pan));
    let zone_tune = f64::from(data.tune);
    let group_tune = f64::from(group.tune);
    let program_tune = f64::from(program.tune);
    zone.tune = if zone_tune > 0.0 && group_tune > 0.0 && program_tune > 0.0 {
        tune_combine(zone_tune, group_tune, program_tune)
    } else {
        0.0
    };
    zone.key_tracking = if group.key_tracking { 1.0 } else { 0.0 };
    zone.reversed = group.reverse;
    zone.amplitude_envelope = envelope;

    if let Some(loop_chunk) = entry.structure.find_child(id::LOOP_ARRAY) {
        if let Some(structure) = loop_chunk.structure() {
            for record in parse_loop_array(&structure.public_data)? {
                if let Some(sample_loop) = record.to_model() {
                    zone.loops.push(sample_loop);
                }
            }
        }
    }

    if let Some(info) = &data.sample {
        // without a filename table the zone name is the best available path
        let path = path.unwrap_or_else(|| format!("{}.wav", zone.name));
        zone.sample = Some(SampleData::File {
            path: path.into(),
            metadata: Some(info.audio_metadata()),
        });
    }

    Ok(zone)
}

#[allow(clippy::dbg_macro)]
#[cfg(test)]
mod test {
    use super::*;
    use crate::MemoryNotifier;

    #[test]
    fn program_roundtrip() {
        let program = ProgramData {
            name: "Grand Piano".to_string(),
            sample_pool_size: 1024.0,
            transpose: -2,
            volume: 0.5,
            pan: 0.25,
            tune: 1.0,
            clipping: [0, 127, 12, 108],
            default_key_switch: 24,
            preload_size: 60000,
            library_id: 7,
            fingerprint: 0xDEAD_BEEF,
            loading_flags: 1,
            group_solo: false,
            icon_id: 2,
            credits: Some("A grand".to_string()),
            author: Some("Moss".to_string()),
            url: None,
            categories: [1, 2, 3],
            trailing: vec![0xAA, 0xBB],
        };
        let bytes = program.to_bytes().expect("serialize program");
        let back = ProgramData::parse(0xA5, &bytes).expect("parse program");
        assert_eq!(back, program);
    }

    #[test]
    fn program_null_strings_become_none() {
        let mut program = ProgramData::default();
        program.name = "X".to_string();
        program.credits = Some("(null)".to_string());
        let bytes = program.to_bytes().expect("serialize");
        let back = ProgramData::parse(0xA8, &bytes).expect("parse");
        assert_eq!(back.credits, None);
        assert_eq!(back.author, None);
    }

    #[test]
    fn program_version_above_max_rejected() {
        let bytes = ProgramData::default().to_bytes().expect("serialize");
        let err = ProgramData::parse(0xB2, &bytes).expect_err("0xB2 unsupported");
        assert!(matches!(err, FormatError::UnsupportedVersion { .. }));
    }

    #[test]
    fn release_mapping() {
        assert_eq!(release_for_program_version(0xA5), Some("5.3.0"));
        assert_eq!(release_for_program_version(0xAE), Some("6.5.2 - 6.8.0"));
        assert_eq!(release_for_program_version(0x42), None);
    }

    #[test]
    fn group_roundtrip() {
        let group = GroupData {
            name: "Release".to_string(),
            volume: 0.8,
            pan: -0.1,
            tune: 1.0,
            release_trigger: true,
            voice_group_index: 3,
            midi_channel: 2,
            ..GroupData::default()
        };
        let bytes = group.to_bytes().expect("serialize group");
        let back = GroupData::parse(0x9C, &bytes).expect("parse group");
        assert_eq!(back, group);
        let err = GroupData::parse(0x9D, &bytes).expect_err("0x9D above max");
        assert!(matches!(err, FormatError::UnsupportedVersion { .. }));
    }

    #[test]
    fn zone_roundtrip_all_versions() {
        let zone = ZoneData {
            sample_start: 0,
            sample_end: 44100,
            low_velocity: 1,
            high_velocity: 127,
            low_key: 36,
            high_key: 47,
            root_key: 40,
            volume: 1.0,
            pan: 0.0,
            tune: 1.0,
            sample: Some(ZoneSampleInfo {
                filename_id: 0,
                sample_data_type: 2,
                sample_rate: 44100,
                num_channels: 2,
                num_frames: 44100,
                legacy: None,
                unknown: 0,
                root_note: 40,
                tuning: 0.0,
                tail_flag: 0,
                tail: 0,
            }),
            ..ZoneData::default()
        };
        for version in ZONE_VERSIONS {
            let mut with_version = zone.clone();
            if version <= 0x93 {
                if let Some(sample) = &mut with_version.sample {
                    sample.legacy = Some(9);
                }
            }
            if version >= 0x9A {
                with_version.extra = Some([1, 0, 0, 0, 0, 0]);
            }
            let bytes = with_version.to_bytes(version).expect("serialize zone");
            let back = ZoneData::parse(version, &bytes).expect("parse zone");
            assert_eq!(back, with_version, "version {version:#04X}");
        }
    }

    #[test]
    fn zone_unknown_version_rejected() {
        let err = ZoneData::default().to_bytes(0x95).expect_err("0x95 not a layout");
        assert!(matches!(err, FormatError::UnsupportedVersion { .. }));
    }

    #[test]
    fn script_only_zone_has_no_descriptor() {
        let zone = ZoneData {
            low_key: 0,
            high_key: 127,
            ..ZoneData::default()
        };
        let bytes = zone.to_bytes(0x98).expect("serialize");
        let back = ZoneData::parse(0x98, &bytes).expect("parse");
        assert_eq!(back.sample, None);
    }

    #[test]
    fn loop_array_roundtrip() {
        let records = vec![
            LoopRecord {
                mode: LOOP_UNTIL_END,
                start: 100,
                length: 400,
                count: 0,
                alternating: 0,
                tuning: 0.0,
                crossfade: 16,
            },
            LoopRecord {
                mode: LOOP_ONESHOT,
                start: 0,
                length: 10,
                count: 1,
                alternating: 1,
                tuning: 0.5,
                crossfade: 0,
            },
        ];
        let bytes = write_loop_array(&records).expect("serialize loops");
        let back = parse_loop_array(&bytes).expect("parse loops");
        assert_eq!(back, records);

        // model mapping: only the sustain loop survives
        let model: Vec<SampleLoop> = back.iter().filter_map(LoopRecord::to_model).collect();
        assert_eq!(model.len(), 1);
        assert_eq!(model[0].start, 100);
        assert_eq!(model[0].end, 500);
        assert_eq!(model[0].kind, LoopKind::Forward);
    }

    #[test]
    fn loop_bad_spacer_rejected() {
        let mut bytes = write_loop_array(&[LoopRecord {
            mode: LOOP_UNTIL_RELEASE,
            start: 0,
            length: 5,
            count: 0,
            alternating: 0,
            tuning: 0.0,
            crossfade: 0,
        }])
        .expect("serialize");
        bytes[2] = 0x61; // corrupt the spacer
        let err = parse_loop_array(&bytes).expect_err("spacer must be 0x60");
        assert!(matches!(err, FormatError::Parse { .. }));
    }

    fn structured(chunk_id: u16, version: u16, public_data: Vec<u8>, children: Vec<PresetChunk>) -> PresetChunk {
        PresetChunk {
            id: chunk_id,
            payload: ChunkPayload::Structured(StructureData {
                version,
                private_data: Vec::new(),
                public_data,
                children,
            }),
        }
    }

    #[test]
    fn decode_minimal_program_tree() {
        let program = ProgramData {
            name: "Tiny".to_string(),
            ..ProgramData::default()
        };
        let group = GroupData {
            name: "Group 1".to_string(),
            ..GroupData::default()
        };
        let zone = ZoneData {
            sample_end: 1000,
            low_key: 48,
            high_key: 59,
            root_key: 48,
            low_velocity: 0,
            high_velocity: 127,
            volume: 1.0,
            tune: 1.0,
            sample: Some(ZoneSampleInfo {
                filename_id: 0,
                sample_data_type: 2,
                sample_rate: 44100,
                num_channels: 1,
                num_frames: 1000,
                legacy: None,
                unknown: 0,
                root_note: 48,
                tuning: 0.0,
                tail_flag: 0,
                tail: 0,
            }),
            ..ZoneData::default()
        };
        let file_list = FileList::from_paths(vec!["Samples/tiny C3.wav".to_string()]);

        let group_entry = ListEntry {
            reference: None,
            structure: StructureData {
                version: 0x9C,
                private_data: Vec::new(),
                public_data: group.to_bytes().expect("group bytes"),
                children: Vec::new(),
            },
        };
        let zone_entry = ListEntry {
            reference: Some(0),
            structure: StructureData {
                version: 0x98,
                private_data: Vec::new(),
                public_data: zone.to_bytes(0x98).expect("zone bytes"),
                children: Vec::new(),
            },
        };
        let tree = vec![structured(
            id::PROGRAM,
            0xA5,
            program.to_bytes().expect("program bytes"),
            vec![
                PresetChunk {
                    id: id::GROUP_LIST,
                    payload: ChunkPayload::List(vec![group_entry]),
                },
                PresetChunk {
                    id: id::ZONE_LIST,
                    payload: ChunkPayload::List(vec![zone_entry]),
                },
                structured(
                    id::FILENAME_LIST,
                    0,
                    file_list.to_bytes().expect("file list bytes"),
                    Vec::new(),
                ),
            ],
        )];

        let notifier = MemoryNotifier::new();
        let outcome = decode_preset_tree(&tree, "tiny.nki", &notifier).expect("decode tree");
        assert_eq!(outcome.multi_samples.len(), 1);
        assert!(outcome.performance.is_none());
        let multi = &outcome.multi_samples[0];
        assert_eq!(multi.name, "Tiny");
        assert_eq!(multi.groups.len(), 1);
        let zone = &multi.groups[0].zones[0];
        assert_eq!(zone.name, "tiny C3");
        assert_eq!(zone.key_low, 48);
        assert_eq!(zone.key_high, 59);
        assert_eq!(zone.tune, 0.0);
        assert_eq!(zone.gain_db, 0.0);
        match &zone.sample {
            Some(SampleData::File { path, metadata }) => {
                assert_eq!(path.to_string_lossy(), "Samples/tiny C3.wav");
                assert_eq!(metadata.expect("metadata").sample_rate, 44100);
            }
            Some(SampleData::Memory(_)) | None => panic!("expected file sample"),
        }
    }
}
