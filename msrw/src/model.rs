//! In-memory multi-sample model shared by every codec.
//!
//! Decoders build these entities, encoders consume them. Ownership is
//! strictly hierarchical: [`MultiSample`] owns [`Group`]s, a group owns
//! [`SampleZone`]s, a zone owns [`SampleLoop`]s. There are no
//! back-references, so serialization is bottom-up and cycle-free.

use std::path::PathBuf;
use std::sync::Arc;

/// Gain floor used when converting a non-positive linear value to decibels.
pub const MIN_GAIN_DB: f64 = -95.25;

/// Trigger semantics shared by all zones of a [`Group`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TriggerKind {
    /// Play on note-on.
    #[default]
    Attack,
    /// Play on note-off.
    Release,
    /// Play only on the first note of a phrase.
    First,
    /// Play on legato transitions.
    Legato,
}

/// Playback direction of a [`SampleLoop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoopKind {
    /// Loop start to end, jump back to start.
    #[default]
    Forward,
    /// Loop end to start, jump back to end.
    Backward,
    /// Ping-pong between start and end.
    Alternating,
}

/// A repeated segment within a zone's playback.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SampleLoop {
    /// Playback direction inside the loop.
    pub kind: LoopKind,
    /// First frame of the looped segment.
    pub start: u64,
    /// One past the last frame of the looped segment. Must be > `start`.
    pub end: u64,
    /// Crossfade length in frames, at most `end - start`.
    pub crossfade: u64,
}

impl SampleLoop {
    /// Length of the looped segment in frames.
    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    /// True when the loop spans no frames.
    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

/// Descriptor of a sample payload: enough to map it, not to decode it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AudioMetadata {
    /// Interleaved channel count.
    pub channels: u16,
    /// Frames per second.
    pub sample_rate: u32,
    /// Bits per sample per channel.
    pub bits_per_sample: u16,
    /// Total frames in the payload.
    pub frame_count: u64,
}

/// A sample payload held entirely in memory, e.g. extracted from a monolith.
///
/// Shared via [`Arc`] so several zones can reference one extraction.
#[derive(Debug, Clone, PartialEq)]
pub struct MemorySample {
    /// File name the payload was stored under, extension included.
    pub name: String,
    /// Payload descriptor.
    pub metadata: AudioMetadata,
    /// Raw container bytes (WAV/NCW), never decoded here.
    pub bytes: Vec<u8>,
}

impl MemorySample {
    /// The payload as a plain WAV container.
    ///
    /// Compressed payloads (NCW) would need bit-level decoding, which is
    /// out of scope; asking for their frames is the point where that
    /// surfaces.
    pub fn wav_bytes(&self) -> Result<&[u8], crate::FormatError> {
        if self.name.to_ascii_lowercase().ends_with(".ncw") {
            return Err(crate::FormatError::CompressedSampleUnsupported {
                name: self.name.clone(),
            });
        }
        Ok(&self.bytes)
    }
}

/// Opaque handle to sample audio. Decoding the payload is a collaborator
/// concern; codecs only move these around.
#[derive(Debug, Clone, PartialEq)]
pub enum SampleData {
    /// Sample lives on disk next to (or relative to) the preset.
    File {
        /// Path as recorded by the source format.
        path: PathBuf,
        /// Descriptor, when the source format records one.
        metadata: Option<AudioMetadata>,
    },
    /// Sample was lifted out of a container file.
    Memory(Arc<MemorySample>),
}

impl SampleData {
    /// Name suitable for matching against container table-of-contents
    /// entries: the file stem without directories or extension.
    pub fn stem(&self) -> String {
        match self {
            SampleData::File { path, .. } => path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default(),
            SampleData::Memory(mem) => match mem.name.rsplit_once('.') {
                Some((stem, _)) => stem.to_string(),
                None => mem.name.clone(),
            },
        }
    }

    /// Descriptor of the payload, when known.
    pub fn metadata(&self) -> Option<AudioMetadata> {
        match self {
            SampleData::File { metadata, .. } => *metadata,
            SampleData::Memory(mem) => Some(mem.metadata),
        }
    }
}

/// Amplitude (or pitch/filter) envelope times.
///
/// Times are seconds, sustain is a linear 0..=1 level.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Envelope {
    /// Curve shape parameter as stored by the source format.
    pub curve: f64,
    /// Attack time.
    pub attack: f64,
    /// Hold time.
    pub hold: f64,
    /// Decay time.
    pub decay: f64,
    /// Sustain level, 0..=1.
    pub sustain: f64,
    /// Release time.
    pub release: f64,
    /// True when the envelope runs attack-hold-decay only.
    pub ahd_only: bool,
}

impl Default for Envelope {
    fn default() -> Self {
        Envelope {
            curve: 0.0,
            attack: 0.0,
            hold: 0.0,
            decay: 0.0,
            sustain: 1.0,
            release: 0.0,
            ahd_only: false,
        }
    }
}

/// Per-zone filter settings.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Filter {
    /// Cutoff frequency in Hz.
    pub cutoff_hz: f64,
    /// Resonance, 0..=1.
    pub resonance: f64,
}

/// One mapped sample slice: key range, velocity range, playback parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleZone {
    /// Zone name, usually the sample file stem.
    pub name: String,
    /// Audio payload handle. `None` for script-only zones.
    pub sample: Option<SampleData>,
    /// First frame to play.
    pub start: u64,
    /// One past the last frame to play. `start <= stop <= frame_count`.
    pub stop: u64,
    /// Lowest MIDI key, 0..=127.
    pub key_low: u8,
    /// Highest MIDI key, `key_low..=127`.
    pub key_high: u8,
    /// Root key, 0..=127.
    pub key_root: u8,
    /// Lowest velocity, 0..=127.
    pub velocity_low: u8,
    /// Highest velocity, `velocity_low..=127`.
    pub velocity_high: u8,
    /// Crossfade width below `key_low` in keys.
    pub key_fade_low: u16,
    /// Crossfade width above `key_high` in keys.
    pub key_fade_high: u16,
    /// Crossfade width below `velocity_low`.
    pub velocity_fade_low: u16,
    /// Crossfade width above `velocity_high`.
    pub velocity_fade_high: u16,
    /// Zone gain in decibels.
    pub gain_db: f64,
    /// Pan position, -1 (hard left) ..= +1 (hard right).
    pub pan: f64,
    /// Tune offset in semitones, fractional.
    pub tune: f64,
    /// Key tracking scalar: 1 = full tracking, 0 = fixed pitch.
    pub key_tracking: f64,
    /// Loops inside the played segment.
    pub loops: Vec<SampleLoop>,
    /// Amplitude envelope, when the source format records one.
    pub amplitude_envelope: Option<Envelope>,
    /// Filter settings, when the source format records them.
    pub filter: Option<Filter>,
    /// Play the sample back to front.
    pub reversed: bool,
}

impl SampleZone {
    /// New zone covering the full key and velocity range.
    pub fn new(name: impl Into<String>) -> Self {
        SampleZone {
            name: name.into(),
            sample: None,
            start: 0,
            stop: 0,
            key_low: 0,
            key_high: 127,
            key_root: 60,
            velocity_low: 0,
            velocity_high: 127,
            key_fade_low: 0,
            key_fade_high: 0,
            velocity_fade_low: 0,
            velocity_fade_high: 0,
            gain_db: 0.0,
            pan: 0.0,
            tune: 0.0,
            key_tracking: 1.0,
            loops: Vec::new(),
            amplitude_envelope: None,
            filter: None,
            reversed: false,
        }
    }

    /// Clamp key and velocity bounds into 0..=127 and restore
    /// low <= high ordering.
    pub fn normalize_ranges(&mut self) {
        self.key_root = self.key_root.min(127);
        self.key_low = self.key_low.min(127);
        self.key_high = self.key_high.min(127);
        if self.key_low > self.key_high {
            core::mem::swap(&mut self.key_low, &mut self.key_high);
        }
        self.velocity_low = self.velocity_low.min(127);
        self.velocity_high = self.velocity_high.min(127);
        if self.velocity_low > self.velocity_high {
            core::mem::swap(&mut self.velocity_low, &mut self.velocity_high);
        }
    }
}

impl Default for SampleZone {
    fn default() -> Self {
        SampleZone::new(String::new())
    }
}

/// A set of zones sharing trigger semantics.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Group {
    /// Group name.
    pub name: String,
    /// When the zones of this group play.
    pub trigger: TriggerKind,
    /// Whether zone pitch follows the played key.
    pub key_tracking: bool,
    /// Play all zones back to front.
    pub reversed: bool,
    /// Group-level tune offset in semitones.
    pub tune: f64,
    /// Round-robin / voice-group index, when assigned.
    pub round_robin: Option<u32>,
    /// Zones owned by this group.
    pub zones: Vec<SampleZone>,
}

impl Group {
    /// New empty attack-triggered group with key tracking on.
    pub fn new(name: impl Into<String>) -> Self {
        Group {
            name: name.into(),
            trigger: TriggerKind::Attack,
            key_tracking: true,
            reversed: false,
            tune: 0.0,
            round_robin: None,
            zones: Vec::new(),
        }
    }
}

/// Descriptive metadata carried alongside the mapping.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SampleMetadata {
    /// Author / creator.
    pub creator: Option<String>,
    /// Instrument category, e.g. "Piano" or "Synth Lead".
    pub category: Option<String>,
    /// Freeform keywords.
    pub keywords: Vec<String>,
    /// Longer description text.
    pub description: Option<String>,
    /// Creation date as the source format recorded it.
    pub creation_date: Option<String>,
}

/// A collection of samples mapped across keys and velocities.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MultiSample {
    /// Instrument name. Never empty after decoding; callers constructing
    /// one for export should pick a name before writing.
    pub name: String,
    /// Descriptive metadata.
    pub metadata: SampleMetadata,
    /// File the multi-sample was decoded from, when any.
    pub source_path: Option<PathBuf>,
    /// Source path split into components, used for category inference.
    pub path_parts: Vec<String>,
    /// Alternative mapping name, when the source distinguishes one.
    pub mapping_name: Option<String>,
    /// Groups in source order.
    pub groups: Vec<Group>,
}

impl MultiSample {
    /// New multi-sample with no groups.
    pub fn new(name: impl Into<String>) -> Self {
        MultiSample {
            name: name.into(),
            ..MultiSample::default()
        }
    }

    /// Total zone count across all groups.
    pub fn zone_count(&self) -> usize {
        self.groups.iter().map(|g| g.zones.len()).sum()
    }

    /// Iterate over all zones of all groups.
    pub fn zones(&self) -> impl Iterator<Item = &SampleZone> {
        self.groups.iter().flat_map(|g| g.zones.iter())
    }

    /// Iterate mutably over all zones of all groups.
    pub fn zones_mut(&mut self) -> impl Iterator<Item = &mut SampleZone> {
        self.groups.iter_mut().flat_map(|g| g.zones.iter_mut())
    }
}

/// One instrument layered into a [`Performance`].
#[derive(Debug, Clone, PartialEq)]
pub struct PerformanceSlot {
    /// The layered instrument.
    pub multi_sample: MultiSample,
    /// MIDI channel the slot listens on, 0-based.
    pub midi_channel: u8,
    /// Lowest key the slot responds to.
    pub key_low: u8,
    /// Highest key the slot responds to.
    pub key_high: u8,
}

/// A layering of instruments onto MIDI channels with per-slot key clipping.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Performance {
    /// Performance name.
    pub name: String,
    /// Slots in source order.
    pub slots: Vec<PerformanceSlot>,
}

// value conversions shared by the codecs
// ----

/// Convert a linear gain value to decibels.
///
/// Non-positive input clamps to [`MIN_GAIN_DB`].
pub fn value_to_db(linear: f64) -> f64 {
    if linear <= 0.0 {
        MIN_GAIN_DB
    } else {
        20.0 * linear.log10()
    }
}

/// Inverse of [`value_to_db`].
pub fn db_to_value(db: f64) -> f64 {
    10.0_f64.powf(db / 20.0)
}

/// Convert a 0..=127 fine-tune byte (centered on 64) to cents.
pub fn cents_from_fine(fine: f64) -> f64 {
    (fine - 64.0) * (100.0 / 64.0)
}

/// Inverse of [`cents_from_fine`].
pub fn fine_from_cents(cents: f64) -> f64 {
    cents * (64.0 / 100.0) + 64.0
}

/// Combine the multiplicative zone/group/program tune factors into
/// semitones, rounded to 1e-5. Kontakt stores tune as `2^(semitones/12)`.
pub fn tune_combine(zone: f64, group: f64, program: f64) -> f64 {
    let semitones = 12.0 * (zone * group * program).log2();
    (semitones * 1e5).round() / 1e5
}

/// Clamp a summed pan value into -1..=+1.
pub fn clamp_pan(pan: f64) -> f64 {
    pan.clamp(-1.0, 1.0)
}

#[allow(clippy::dbg_macro)]
#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn db_conversion() {
        assert_eq!(value_to_db(1.0), 0.0);
        assert_eq!(value_to_db(0.0), MIN_GAIN_DB);
        assert_eq!(value_to_db(-3.0), MIN_GAIN_DB);
        let half = value_to_db(0.5);
        assert!((half + 6.0206).abs() < 1e-3, "half gain ~ -6dB, got {half}");
        assert!((db_to_value(value_to_db(0.25)) - 0.25).abs() < 1e-12);
    }

    #[test]
    fn fine_tune_conversion() {
        assert_eq!(cents_from_fine(64.0), 0.0);
        assert_eq!(cents_from_fine(0.0), -100.0);
        assert!((cents_from_fine(127.0) - 98.4375).abs() < 1e-9);
        for fine in 0..=127 {
            let cents = cents_from_fine(f64::from(fine));
            assert!((fine_from_cents(cents) - f64::from(fine)).abs() < 1e-9);
        }
    }

    #[test]
    fn tune_combine_identity() {
        assert_eq!(tune_combine(1.0, 1.0, 1.0), 0.0);
        // one octave up stored as factor 2 on the zone
        assert_eq!(tune_combine(2.0, 1.0, 1.0), 12.0);
        // continuity: tiny factor changes move the result only slightly
        let a = tune_combine(1.0001, 1.0, 1.0);
        let b = tune_combine(1.0002, 1.0, 1.0);
        assert!(a > 0.0 && b > a && b - a < 0.01);
        // rounded to 1e-5 semitones
        let st = tune_combine(1.05946309435929, 1.0, 1.0);
        assert_eq!(st, 1.0);
    }

    #[test]
    fn zone_range_normalization() {
        let mut zone = SampleZone::new("swapped");
        zone.key_low = 90;
        zone.key_high = 30;
        zone.velocity_low = 100;
        zone.velocity_high = 1;
        zone.normalize_ranges();
        assert!(zone.key_low <= zone.key_high);
        assert!(zone.velocity_low <= zone.velocity_high);
    }

    #[test]
    fn zone_iteration() {
        let mut ms = MultiSample::new("Piano");
        let mut group = Group::new("Group 1");
        group.zones.push(SampleZone::new("a"));
        group.zones.push(SampleZone::new("b"));
        ms.groups.push(group);
        ms.groups.push(Group::new("empty"));
        assert_eq!(ms.zone_count(), 2);
        assert_eq!(ms.zones().count(), 2);
    }

    #[test]
    fn compressed_payloads_refuse_frame_access() {
        let ncw = MemorySample {
            name: "Piano C2.ncw".to_string(),
            metadata: AudioMetadata::default(),
            bytes: vec![1, 2, 3],
        };
        assert!(matches!(
            ncw.wav_bytes(),
            Err(crate::FormatError::CompressedSampleUnsupported { .. })
        ));
        let wav = MemorySample {
            name: "Piano C2.wav".to_string(),
            metadata: AudioMetadata::default(),
            bytes: vec![1, 2, 3],
        };
        assert_eq!(wav.wav_bytes().expect("wav payload"), &[1, 2, 3]);
    }

    #[test]
    fn sample_data_stem() {
        let data = SampleData::File {
            path: PathBuf::from("Samples/Piano C2.wav"),
            metadata: None,
        };
        assert_eq!(data.stem(), "Piano C2");
        let mem = SampleData::Memory(Arc::new(MemorySample {
            name: "Piano C2.ncw".to_string(),
            metadata: AudioMetadata::default(),
            bytes: Vec::new(),
        }));
        assert_eq!(mem.stem(), "Piano C2");
    }
}
