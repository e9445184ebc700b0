//! YSFC performance parts and elements (EPFM/DPFM).
//!
//! An element is a fixed block of single-byte parameters followed by a
//! u16 waveform number pointing into the waveform entry list. Two block
//! widths circulate (a 2-byte and a 5-byte tail); both are accepted on
//! read and the longer form is written. Most parameter bytes have
//! unresolved semantics and ride through verbatim; the envelope times and
//! the pitch key-follow go through the fixed tables below.

use binrw::io::{Cursor, Write};
use binrw::{BinRead, BinResult, BinWrite};

use crate::model::Envelope;
use crate::strings::read_bytes;
use crate::FormatError;

/// Single-byte parameters per element block.
pub const ELEMENT_PARAMS: usize = 140;

/// Element block length of the short (2-byte tail) form.
const ELEMENT_LEN_SHORT: usize = ELEMENT_PARAMS + 2;
/// Element block length of the long (3 unknown bytes + 2-byte tail) form.
const ELEMENT_LEN_LONG: usize = ELEMENT_PARAMS + 3 + 2;

/// Parameter offsets with known meaning.
pub mod param {
    /// Pitch key-follow, through the percent table.
    pub const PITCH_KEY_FOLLOW: usize = 9;
    /// Amplitude EG attack time.
    pub const AEG_ATTACK: usize = 20;
    /// Amplitude EG decay time.
    pub const AEG_DECAY: usize = 21;
    /// Amplitude EG sustain level, 0-127.
    pub const AEG_SUSTAIN: usize = 22;
    /// Amplitude EG release time.
    pub const AEG_RELEASE: usize = 23;
    /// Filter cutoff, 0-127.
    pub const FILTER_CUTOFF: usize = 32;
    /// Element pan, stored 1-127.
    pub const PAN: usize = 48;
    /// Element level, 0-127.
    pub const LEVEL: usize = 49;
}

/// Envelope time per byte value, seconds. 128 entries from 0.2 s to 90 s.
pub const ENVELOPE_TIMES: [f64; 128] = [
    0.2, 0.21, 0.22, 0.231, 0.242, 0.254, 0.267, 0.28,
    0.294, 0.308, 0.324, 0.339, 0.356, 0.374, 0.392, 0.412,
    0.432, 0.453, 0.475, 0.499, 0.523, 0.549, 0.576, 0.605,
    0.634, 0.666, 0.699, 0.733, 0.769, 0.807, 0.847, 0.889,
    0.932, 0.978, 1.026, 1.077, 1.13, 1.186, 1.244, 1.306,
    1.37, 1.437, 1.508, 1.583, 1.661, 1.742, 1.828, 1.918,
    2.013, 2.112, 2.216, 2.325, 2.44, 2.56, 2.686, 2.819,
    2.958, 3.103, 3.256, 3.417, 3.585, 3.762, 3.947, 4.142,
    4.346, 4.56, 4.785, 5.021, 5.268, 5.528, 5.8, 6.086,
    6.386, 6.7, 7.031, 7.377, 7.741, 8.122, 8.522, 8.942,
    9.383, 9.845, 10.331, 10.84, 11.374, 11.934, 12.523, 13.14,
    13.787, 14.467, 15.18, 15.928, 16.713, 17.536, 18.4, 19.307,
    20.259, 21.257, 22.304, 23.404, 24.557, 25.767, 27.037, 28.369,
    29.767, 31.234, 32.773, 34.389, 36.083, 37.861, 39.727, 41.685,
    43.739, 45.895, 48.156, 50.53, 53.02, 55.632, 58.374, 61.251,
    64.269, 67.436, 70.76, 74.247, 77.906, 81.745, 85.773, 90.0,
];

/// Pitch key-follow per byte value, percent. 128 entries from -200 % to
/// +200 %.
pub const PITCH_KEY_FOLLOW: [f64; 128] = [
    -200.0, -196.85, -193.7, -190.55, -187.4, -184.25, -181.1, -177.95,
    -174.8, -171.65, -168.5, -165.35, -162.2, -159.06, -155.91, -152.76,
    -149.61, -146.46, -143.31, -140.16, -137.01, -133.86, -130.71, -127.56,
    -124.41, -121.26, -118.11, -114.96, -111.81, -108.66, -105.51, -102.36,
    -99.21, -96.06, -92.91, -89.76, -86.61, -83.46, -80.31, -77.17,
    -74.02, -70.87, -67.72, -64.57, -61.42, -58.27, -55.12, -51.97,
    -48.82, -45.67, -42.52, -39.37, -36.22, -33.07, -29.92, -26.77,
    -23.62, -20.47, -17.32, -14.17, -11.02, -7.87, -4.72, -1.57,
    1.57, 4.72, 7.87, 11.02, 14.17, 17.32, 20.47, 23.62,
    26.77, 29.92, 33.07, 36.22, 39.37, 42.52, 45.67, 48.82,
    51.97, 55.12, 58.27, 61.42, 64.57, 67.72, 70.87, 74.02,
    77.17, 80.31, 83.46, 86.61, 89.76, 92.91, 96.06, 99.21,
    102.36, 105.51, 108.66, 111.81, 114.96, 118.11, 121.26, 124.41,
    127.56, 130.71, 133.86, 137.01, 140.16, 143.31, 146.46, 149.61,
    152.76, 155.91, 159.06, 162.2, 165.35, 168.5, 171.65, 174.8,
    177.95, 181.1, 184.25, 187.4, 190.55, 193.7, 196.85, 200.0,
];

/// Envelope time for a parameter byte.
pub fn envelope_seconds(byte: u8) -> f64 {
    ENVELOPE_TIMES[usize::from(byte.min(127))]
}

/// Nearest parameter byte for an envelope time.
pub fn envelope_byte(seconds: f64) -> u8 {
    nearest_index(&ENVELOPE_TIMES, seconds)
}

/// Key-follow percent for a parameter byte.
pub fn key_follow_percent(byte: u8) -> f64 {
    PITCH_KEY_FOLLOW[usize::from(byte.min(127))]
}

/// Nearest parameter byte for a key-follow percent.
pub fn key_follow_byte(percent: f64) -> u8 {
    nearest_index(&PITCH_KEY_FOLLOW, percent)
}

fn nearest_index(table: &[f64; 128], value: f64) -> u8 {
    let mut best = 0usize;
    let mut best_distance = f64::INFINITY;
    for (index, candidate) in table.iter().enumerate() {
        let distance = (candidate - value).abs();
        if distance < best_distance {
            best_distance = distance;
            best = index;
        }
    }
    best as u8
}

/// One element of a performance part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PerformanceElement {
    /// The parameter block, mostly preserved verbatim.
    pub params: [u8; ELEMENT_PARAMS],
    /// The 3 unknown bytes of the long block form; short-form reads
    /// normalise to `None` and the writer emits zeroes.
    pub unknown_tail: Option<[u8; 3]>,
    /// 1-based waveform number into the EWFM entry list.
    pub waveform_number: u16,
}

impl Default for PerformanceElement {
    fn default() -> Self {
        PerformanceElement {
            params: [0; ELEMENT_PARAMS],
            unknown_tail: None,
            waveform_number: 0,
        }
    }
}

impl PerformanceElement {
    /// The amplitude envelope encoded in the AEG parameter bytes.
    pub fn amplitude_envelope(&self) -> Envelope {
        Envelope {
            curve: 0.0,
            attack: envelope_seconds(self.params[param::AEG_ATTACK]),
            hold: 0.0,
            decay: envelope_seconds(self.params[param::AEG_DECAY]),
            sustain: f64::from(self.params[param::AEG_SUSTAIN].min(127)) / 127.0,
            release: envelope_seconds(self.params[param::AEG_RELEASE]),
            ahd_only: false,
        }
    }

    /// Encode an amplitude envelope into the AEG parameter bytes.
    pub fn set_amplitude_envelope(&mut self, envelope: &Envelope) {
        self.params[param::AEG_ATTACK] = envelope_byte(envelope.attack);
        self.params[param::AEG_DECAY] = envelope_byte(envelope.decay);
        self.params[param::AEG_SUSTAIN] = (envelope.sustain.clamp(0.0, 1.0) * 127.0).round() as u8;
        self.params[param::AEG_RELEASE] = envelope_byte(envelope.release);
    }
}

/// One performance part, holding up to 8 elements.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PerformancePart {
    /// Elements in slot order.
    pub elements: Vec<PerformanceElement>,
}

/// The body of a DPFM data item.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PerformanceData {
    /// Parts in slot order.
    pub parts: Vec<PerformancePart>,
}

impl PerformanceData {
    /// Parse a DPFM data payload.
    pub fn parse(bytes: &[u8]) -> Result<Self, FormatError> {
        let mut cursor = Cursor::new(bytes);
        let part_count = u16::read_be(&mut cursor)?;
        let mut parts = Vec::with_capacity(part_count as usize);
        for _ in 0..part_count {
            let element_count = u16::read_be(&mut cursor)?;
            if element_count > 8 {
                return Err(FormatError::Parse {
                    pos: Some(cursor.position() - 2),
                    message: format!("performance part with {element_count} elements"),
                });
            }
            let mut elements = Vec::with_capacity(element_count as usize);
            for _ in 0..element_count {
                let block_len = u16::read_be(&mut cursor)? as usize;
                let block = read_bytes(&mut cursor, block_len)?;
                elements.push(parse_element(&block)?);
            }
            parts.push(PerformancePart { elements });
        }
        Ok(PerformanceData { parts })
    }

    /// Serialize into a DPFM data payload, long element form.
    pub fn to_bytes(&self) -> BinResult<Vec<u8>> {
        let mut cursor = Cursor::new(Vec::new());
        (self.parts.len() as u16).write_be(&mut cursor)?;
        for part in &self.parts {
            (part.elements.len() as u16).write_be(&mut cursor)?;
            for element in &part.elements {
                (ELEMENT_LEN_LONG as u16).write_be(&mut cursor)?;
                cursor.write_all(&element.params)?;
                cursor.write_all(&element.unknown_tail.unwrap_or_default())?;
                element.waveform_number.write_be(&mut cursor)?;
            }
        }
        Ok(cursor.into_inner())
    }
}

fn parse_element(block: &[u8]) -> Result<PerformanceElement, FormatError> {
    let (unknown_tail, number_offset) = match block.len() {
        ELEMENT_LEN_SHORT => (None, ELEMENT_PARAMS),
        ELEMENT_LEN_LONG => {
            let mut tail = [0u8; 3];
            tail.copy_from_slice(&block[ELEMENT_PARAMS..ELEMENT_PARAMS + 3]);
            (Some(tail), ELEMENT_PARAMS + 3)
        }
        other => {
            return Err(FormatError::Parse {
                pos: None,
                message: format!("performance element block of {other} bytes"),
            })
        }
    };
    let mut params = [0u8; ELEMENT_PARAMS];
    params.copy_from_slice(&block[..ELEMENT_PARAMS]);
    let waveform_number =
        u16::from_be_bytes([block[number_offset], block[number_offset + 1]]);
    Ok(PerformanceElement {
        params,
        unknown_tail,
        waveform_number,
    })
}
