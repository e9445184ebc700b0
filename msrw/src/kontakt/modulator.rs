//! Internal modulators: envelopes and LFOs driving zone parameters.
//!
//! The wire layout is version-tagged and splits into two blocks: an array
//! of modulated-parameter records, then (for AHDSR sources) the envelope
//! times. The 0-2 byte padding between a parameter record's description and
//! its curve data follows two exact-match tables with a string-length
//! parity fallback; the tables were recovered from observed files and must
//! not be "improved", real presets depend on them byte for byte.

use binrw::io::{Cursor, Read, Seek, Write};
use binrw::{BinRead, BinResult, BinWrite, Endian};
use tracing::debug;

use crate::strings::{read_ascii_prefixed, read_bytes, write_ascii_prefixed};

/// Modulator record versions this decoder accepts.
const SUPPORTED_VERSIONS: [u16; 2] = [0x80, 0x81];

/// Record flag bit: the description field is replaced by 5 unused bytes.
const FLAG_NO_DESCRIPTION: u8 = 0x08;
/// Record flag bit: a curve table follows the padding.
const FLAG_HAS_CURVE: u8 = 0x04;

/// Sentinel separating intensity from the record flags.
const RECORD_SENTINEL: u16 = 0xFFFF;

/// Pairs needing 2 padding bytes after the modulator description.
const PADDING_TWO: &[(&str, &str)] = &[
    ("filterCutoff", "ENV_AHDSR_CUTOFF"),
    ("filterResonance", "ENV_AHDSR_RESONANCE"),
    ("volume", "ENV_AHDSR_VOLUME_2"),
    ("intensity", "ENV_FOLLOW_CUTOFF"),
];

/// Pairs needing 1 padding byte.
const PADDING_ONE: &[(&str, &str)] = &[
    ("pitch", "ENV_AHDSR_PITCH"),
    ("pan", "LFO_SINE_PAN"),
    ("filterCutoff", "LFO_RECT_CUTOFF"),
];

/// Pairs known to need no padding.
const PADDING_NONE: &[(&str, &str)] = &[
    ("volume", "ENV_AHDSR_VOLUME"),
    ("pitch", "LFO_SINE_PITCH"),
    ("filterCutoff", "LFO_SINE_CUTOFF"),
    ("pan", "ENV_AHDSR_PAN"),
];

/// Padding decision for one parameter/description pair.
///
/// The second field is true when neither table matched and the parity
/// fallback decided; callers surface that as telemetry so table gaps can be
/// correlated with read failures.
pub fn padding_for(parameter: &str, description: &str) -> (usize, bool) {
    let key = (parameter, description);
    let hit = |table: &[(&str, &str)]| table.iter().any(|entry| *entry == key);
    if hit(PADDING_TWO) {
        (2, false)
    } else if hit(PADDING_ONE) {
        (1, false)
    } else if hit(PADDING_NONE) {
        (0, false)
    } else {
        ((parameter.len() + description.len()) % 2, true)
    }
}

/// Modulation curve attached to a parameter record.
#[derive(Debug, Clone, PartialEq)]
pub enum CurveTable {
    /// 128 step values.
    Steps(Vec<f32>),
    /// Breakpoints as (x, y, slope) triples.
    Points(Vec<(f32, f32, f32)>),
}

/// One modulated parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct ModulationTarget {
    /// Target parameter name, e.g. "volume" or "filterCutoff".
    pub parameter: String,
    /// Modulation intensity.
    pub intensity: f32,
    /// Record flags as stored.
    pub flags: u8,
    /// Modulation lag.
    pub lag: i16,
    /// Modulator description, e.g. "ENV_AHDSR_VOLUME". `None` when the
    /// record stores 5 unused bytes instead.
    pub description: Option<String>,
    /// The 5 unused bytes of description-less records, preserved.
    pub unused: Option<[u8; 5]>,
    /// Optional curve table.
    pub curve: Option<CurveTable>,
}

/// Raw envelope block of an AHDSR modulator. Times are milliseconds.
#[derive(Debug, Clone, PartialEq)]
pub struct EnvelopeBlock {
    /// 34 bytes preceding the envelope values, preserved verbatim.
    pub preamble: Vec<u8>,
    /// Curve shape.
    pub curve: f32,
    /// Attack time in ms.
    pub attack: f32,
    /// Hold time in ms.
    pub hold: f32,
    /// Decay time in ms.
    pub decay: f32,
    /// Release time in ms.
    pub release: f32,
    /// Sustain level.
    pub sustain: f32,
    /// Attack-hold-decay only envelope.
    pub ahd_only: bool,
}

/// An internal modulator chunk body.
#[derive(Debug, Clone, PartialEq)]
pub struct InternalModulator {
    /// Record version, 0x80 or 0x81.
    pub version: u16,
    /// Modulated parameters.
    pub targets: Vec<ModulationTarget>,
    /// Modulation section expanded in the UI.
    pub section_open: bool,
    /// Modulator bypassed.
    pub bypassed: bool,
    /// Retrigger on new notes.
    pub retrigger: bool,
    /// Unknown flag byte, preserved.
    pub unknown_flag: u8,
    /// FX slot the modulator feeds.
    pub fx_slot: u32,
    /// Modulator source name, e.g. "ENV_AHDSR".
    pub source_name: String,
    /// Modulator source index.
    pub source_index: u32,
    /// Envelope values for AHDSR sources.
    pub envelope: Option<EnvelopeBlock>,
    /// Unparsed remainder (e.g. ENV_DBD bodies), preserved verbatim.
    pub trailing: Vec<u8>,
}

impl InternalModulator {
    /// True when the source block carries AHDSR envelope values.
    pub fn is_envelope_source(source_index: u32, source_name: &str) -> bool {
        matches!(source_index, 0 | 2)
            && matches!(source_name, "ENV_AHDSR" | "<none>" | "")
    }

    /// Parse a modulator body. The second return lists parameter pairs
    /// that fell through to the parity padding rule.
    pub fn parse(bytes: &[u8]) -> BinResult<(Self, Vec<(String, String)>)> {
        let mut cursor = Cursor::new(bytes);
        let mut fallbacks = Vec::new();

        let version = u16::read_le(&mut cursor)?;
        if !SUPPORTED_VERSIONS.contains(&version) {
            return Err(binrw::Error::Custom {
                pos: 0,
                err: Box::new(format!("unsupported modulator version {version:#04X}")),
            });
        }

        let count = u32::read_le(&mut cursor)?;
        let mut targets = Vec::with_capacity(count as usize);
        for _ in 0..count {
            targets.push(read_target(&mut cursor, &mut fallbacks)?);
        }

        let section_open = u8::read_le(&mut cursor)? != 0;
        let bypassed = u8::read_le(&mut cursor)? != 0;
        let retrigger = u8::read_le(&mut cursor)? != 0;
        let unknown_flag = u8::read_le(&mut cursor)?;
        let fx_slot = u32::read_le(&mut cursor)?;
        let source_name = read_ascii_prefixed(&mut cursor, Endian::Little)?;
        let source_index = u32::read_le(&mut cursor)?;

        let envelope = if Self::is_envelope_source(source_index, &source_name) {
            let preamble = read_bytes(&mut cursor, 34)?;
            let curve = f32::read_le(&mut cursor)?;
            let attack = f32::read_le(&mut cursor)?;
            let hold = f32::read_le(&mut cursor)?;
            let decay = f32::read_le(&mut cursor)?;
            let release = f32::read_le(&mut cursor)?;
            let sustain = f32::read_le(&mut cursor)?;
            let ahd_only = u8::read_le(&mut cursor)? != 0;
            Some(EnvelopeBlock {
                preamble,
                curve,
                attack,
                hold,
                decay,
                release,
                sustain,
                ahd_only,
            })
        } else {
            debug!("modulator source {source_name:?} ({source_index}) has no AHDSR block");
            None
        };

        let mut trailing = Vec::new();
        cursor.read_to_end(&mut trailing)?;
        Ok((
            InternalModulator {
                version,
                targets,
                section_open,
                bypassed,
                retrigger,
                unknown_flag,
                fx_slot,
                source_name,
                source_index,
                envelope,
                trailing,
            },
            fallbacks,
        ))
    }

    /// Serialize the modulator body.
    pub fn to_bytes(&self) -> BinResult<Vec<u8>> {
        let mut cursor = Cursor::new(Vec::new());
        self.version.write_le(&mut cursor)?;
        (self.targets.len() as u32).write_le(&mut cursor)?;
        for target in &self.targets {
            write_target(target, &mut cursor)?;
        }
        u8::from(self.section_open).write_le(&mut cursor)?;
        u8::from(self.bypassed).write_le(&mut cursor)?;
        u8::from(self.retrigger).write_le(&mut cursor)?;
        self.unknown_flag.write_le(&mut cursor)?;
        self.fx_slot.write_le(&mut cursor)?;
        write_ascii_prefixed(&mut cursor, &self.source_name, Endian::Little)?;
        self.source_index.write_le(&mut cursor)?;
        if let Some(envelope) = &self.envelope {
            cursor.write_all(&envelope.preamble)?;
            envelope.curve.write_le(&mut cursor)?;
            envelope.attack.write_le(&mut cursor)?;
            envelope.hold.write_le(&mut cursor)?;
            envelope.decay.write_le(&mut cursor)?;
            envelope.release.write_le(&mut cursor)?;
            envelope.sustain.write_le(&mut cursor)?;
            u8::from(envelope.ahd_only).write_le(&mut cursor)?;
        }
        cursor.write_all(&self.trailing)?;
        Ok(cursor.into_inner())
    }

    /// Build a plain volume AHDSR modulator, the shape the writer emits.
    pub fn volume_ahdsr(attack_ms: f32, hold_ms: f32, decay_ms: f32, sustain: f32, release_ms: f32) -> Self {
        InternalModulator {
            version: 0x80,
            targets: vec![ModulationTarget {
                parameter: "volume".to_string(),
                intensity: 1.0,
                flags: 0,
                lag: 0,
                description: Some("ENV_AHDSR_VOLUME".to_string()),
                unused: None,
                curve: None,
            }],
            section_open: false,
            bypassed: false,
            retrigger: false,
            unknown_flag: 0,
            fx_slot: 0,
            source_name: "ENV_AHDSR".to_string(),
            source_index: 0,
            envelope: Some(EnvelopeBlock {
                preamble: vec![0u8; 34],
                curve: 0.0,
                attack: attack_ms,
                hold: hold_ms,
                decay: decay_ms,
                release: release_ms,
                sustain,
                ahd_only: false,
            }),
            trailing: Vec::new(),
        }
    }
}

fn read_target(
    cursor: &mut Cursor<&[u8]>,
    fallbacks: &mut Vec<(String, String)>,
) -> BinResult<ModulationTarget> {
    let parameter = read_ascii_prefixed(cursor, Endian::Little)?;
    let intensity = f32::read_le(cursor)?;
    let pos = cursor.position();
    let sentinel = u16::read_le(cursor)?;
    if sentinel != RECORD_SENTINEL {
        return Err(binrw::Error::Custom {
            pos,
            err: Box::new(format!(
                "modulation record sentinel {sentinel:#06X}, expected 0xFFFF"
            )),
        });
    }
    let flags = u8::read_le(cursor)?;
    let lag = i16::read_le(cursor)?;

    let mut description = None;
    let mut unused = None;
    if flags & FLAG_NO_DESCRIPTION != 0 {
        let mut raw = [0u8; 5];
        cursor.read_exact(&mut raw)?;
        unused = Some(raw);
    } else {
        let text = read_ascii_prefixed(cursor, Endian::Little)?;
        let (padding, fell_back) = padding_for(&parameter, &text);
        if fell_back {
            fallbacks.push((parameter.clone(), text.clone()));
        }
        crate::strings::skip_bytes(cursor, padding as u64)?;
        description = Some(text);
    }

    let curve = if flags & FLAG_HAS_CURVE != 0 {
        Some(read_curve(cursor)?)
    } else {
        None
    };

    Ok(ModulationTarget {
        parameter,
        intensity,
        flags,
        lag,
        description,
        unused,
        curve,
    })
}

fn write_target<W: Write + Seek>(target: &ModulationTarget, writer: &mut W) -> BinResult<()> {
    write_ascii_prefixed(writer, &target.parameter, Endian::Little)?;
    target.intensity.write_le(writer)?;
    RECORD_SENTINEL.write_le(writer)?;
    target.flags.write_le(writer)?;
    target.lag.write_le(writer)?;
    if target.flags & FLAG_NO_DESCRIPTION != 0 {
        let raw = target.unused.unwrap_or([0u8; 5]);
        writer.write_all(&raw)?;
    } else {
        let text = target.description.as_deref().unwrap_or("");
        write_ascii_prefixed(writer, text, Endian::Little)?;
        let (padding, _) = padding_for(&target.parameter, text);
        crate::strings::write_fill(writer, 0, padding)?;
    }
    if target.flags & FLAG_HAS_CURVE != 0 {
        match &target.curve {
            Some(CurveTable::Steps(steps)) => {
                0u8.write_le(writer)?;
                for step in steps {
                    step.write_le(writer)?;
                }
            }
            Some(CurveTable::Points(points)) => {
                1u8.write_le(writer)?;
                (points.len() as u32).write_le(writer)?;
                for (x, y, slope) in points {
                    x.write_le(writer)?;
                    y.write_le(writer)?;
                    slope.write_le(writer)?;
                }
            }
            None => {
                return Err(binrw::Error::Custom {
                    pos: 0,
                    err: Box::new("curve flag set but no curve present".to_string()),
                })
            }
        }
    }
    Ok(())
}

fn read_curve(cursor: &mut Cursor<&[u8]>) -> BinResult<CurveTable> {
    let kind = u8::read_le(cursor)?;
    match kind {
        0 => {
            let mut steps = Vec::with_capacity(128);
            for _ in 0..128 {
                steps.push(f32::read_le(cursor)?);
            }
            Ok(CurveTable::Steps(steps))
        }
        1 => {
            let count = u32::read_le(cursor)?;
            let mut points = Vec::with_capacity(count as usize);
            for _ in 0..count {
                points.push((
                    f32::read_le(cursor)?,
                    f32::read_le(cursor)?,
                    f32::read_le(cursor)?,
                ));
            }
            Ok(CurveTable::Points(points))
        }
        other => Err(binrw::Error::Custom {
            pos: cursor.position(),
            err: Box::new(format!("unknown curve table kind {other}")),
        }),
    }
}
