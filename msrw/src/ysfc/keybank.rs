//! YSFC key-banks: the per-sample metadata records of a DWFM data item.
//!
//! Two layout families exist. Version 1 (Motif XS/XF, MOXF) stores the
//! position block big-endian and halves the level; version 2 (Montage,
//! MODX) stores it little-endian, inserts an extra reserved block and
//! splits the loop start into a 16-frame-coarse value plus a rest byte.
//! Mixing those up silently corrupts every loop point, so the endianness
//! is explicit on each read.

use binrw::io::{Cursor, Read, Seek, Write};
use binrw::{BinRead, BinResult, BinWrite, Endian};

use crate::FormatError;

/// Gain floor of the level scale in decibels.
const LEVEL_FLOOR_DB: f64 = -95.25;
/// Decibel step between adjacent level values.
const LEVEL_STEP_DB: f64 = 0.375;
/// Cents per fine-tune step.
const FINE_STEP_CENTS: f64 = 1.5625;

/// Which wire layout a key-bank uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyBankLayout {
    /// Motif XS/XF and MOXF: big-endian positions, halved level.
    Version1 {
        /// MOXF adds a 16-byte totals tail.
        moxf: bool,
    },
    /// Montage and MODX: little-endian positions, extra reserved block.
    Version2,
}

/// One key-bank: the metadata descriptor of one sample slice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyBank {
    /// Lowest mapped key.
    pub key_range_lower: u8,
    /// Highest mapped key.
    pub key_range_upper: u8,
    /// Lowest mapped velocity.
    pub vel_lower: u8,
    /// Highest mapped velocity.
    pub vel_upper: u8,
    /// Level on the canonical 0-255 scale (version 1 stores half).
    pub level: u8,
    /// Pan, stored 1-127 centered on 64.
    pub pan: u8,
    /// Pitch does not follow the key.
    pub fixed_pitch: bool,
    /// Root note.
    pub root_note: u8,
    /// Coarse tune in semitones, centered on 64.
    pub coarse_tune: u8,
    /// Fine tune, centered on 64 at 1.5625 cents per step.
    pub fine_tune: u8,
    /// Channel count, 1 or 2.
    pub channels: u8,
    /// Loop tuning byte.
    pub loop_tune: u8,
    /// Play form byte.
    pub play_form: u8,
    /// Wave format; only 0 and 5 are supported.
    pub wave_format: u8,
    /// Loop mode; 0 = sustain loop, 1 = no loop.
    pub loop_mode: u8,
    /// Encrypted payload flag; accepted only on version-1 Motif banks.
    pub encrypted: bool,
    /// Reserved byte following the velocity/level block.
    pub reserved0: u8,
    /// Padding byte after the common block.
    pub pad: u8,
    /// Loop start remainder (version 2 splits the loop start).
    pub loop_point_rest: u8,
    /// Reserved byte before the compression info.
    pub reserved1: u8,
    /// Compression/encryption info, preserved.
    pub info: [u8; 12],
    /// Extra reserved block, version 2 only.
    pub extra_reserved: Option<[u8; 4]>,
    /// Sample rate in Hz.
    pub sample_frequency: u32,
    /// Effective loop start frame.
    pub loop_start: u32,
    /// Loop end frame.
    pub loop_end: u32,
    /// Total frames.
    pub sample_length: u32,
    /// MOXF totals tail: channel offset, sample offset, sample number,
    /// size.
    pub moxf_tail: Option<[u32; 4]>,
}

impl Default for KeyBank {
    fn default() -> Self {
        KeyBank {
            key_range_lower: 0,
            key_range_upper: 127,
            vel_lower: 1,
            vel_upper: 127,
            level: 255,
            pan: 64,
            fixed_pitch: false,
            root_note: 60,
            coarse_tune: 64,
            fine_tune: 64,
            channels: 1,
            loop_tune: 0,
            play_form: 0,
            wave_format: 0,
            loop_mode: 1,
            encrypted: false,
            reserved0: 0,
            pad: 0,
            loop_point_rest: 0,
            reserved1: 0,
            info: [0; 12],
            extra_reserved: None,
            sample_frequency: 44100,
            loop_start: 0,
            loop_end: 0,
            sample_length: 0,
            moxf_tail: None,
        }
    }
}

impl KeyBank {
    /// Read one key-bank in the given layout.
    pub fn read<R: Read + Seek>(
        reader: &mut R,
        layout: KeyBankLayout,
    ) -> Result<Self, FormatError> {
        let key_range_lower = u8::read_le(reader)?;
        let key_range_upper = u8::read_le(reader)?;
        let vel_lower = u8::read_le(reader)?;
        let vel_upper = u8::read_le(reader)?;
        let stored_level = u8::read_le(reader)?;
        let pan = u8::read_le(reader)?;
        let reserved0 = u8::read_le(reader)?;
        let fixed_pitch = u8::read_le(reader)? != 0;
        let root_note = u8::read_le(reader)?;
        let coarse_tune = u8::read_le(reader)?;
        let fine_tune = u8::read_le(reader)?;
        let channels = u8::read_le(reader)?;
        let loop_tune = u8::read_le(reader)?;
        let play_form = u8::read_le(reader)?;
        let wave_format = u8::read_le(reader)?;
        let loop_mode = u8::read_le(reader)?;
        let encrypted = u8::read_le(reader)? != 0;
        let pad = u8::read_le(reader)?;
        let loop_point_rest = u8::read_le(reader)?;
        let reserved1 = u8::read_le(reader)?;
        let mut info = [0u8; 12];
        reader.read_exact(&mut info)?;

        if wave_format != 0 && wave_format != 5 {
            return Err(FormatError::UnsupportedVersion {
                what: "key-bank wave format".to_string(),
                version: wave_format.to_string(),
            });
        }
        let motif_v1 = matches!(layout, KeyBankLayout::Version1 { moxf: false });
        if encrypted && !motif_v1 {
            return Err(FormatError::UnsupportedVersion {
                what: "encrypted key-bank".to_string(),
                version: "1".to_string(),
            });
        }

        let (endian, extra_reserved) = match layout {
            KeyBankLayout::Version1 { .. } => (Endian::Big, None),
            KeyBankLayout::Version2 => {
                let mut extra = [0u8; 4];
                reader.read_exact(&mut extra)?;
                (Endian::Little, Some(extra))
            }
        };
        let sample_frequency = u32::read_options(reader, endian, ())?;
        let stored_loop_start = u32::read_options(reader, endian, ())?;
        let loop_end = u32::read_options(reader, endian, ())?;
        let sample_length = u32::read_options(reader, endian, ())?;

        let (level, loop_start) = match layout {
            KeyBankLayout::Version1 { .. } => {
                (stored_level.saturating_mul(2), stored_loop_start)
            }
            KeyBankLayout::Version2 => (
                stored_level,
                16 * stored_loop_start + u32::from(loop_point_rest),
            ),
        };

        let moxf_tail = if matches!(layout, KeyBankLayout::Version1 { moxf: true }) {
            Some([
                u32::read_options(reader, Endian::Big, ())?,
                u32::read_options(reader, Endian::Big, ())?,
                u32::read_options(reader, Endian::Big, ())?,
                u32::read_options(reader, Endian::Big, ())?,
            ])
        } else {
            None
        };

        Ok(KeyBank {
            key_range_lower,
            key_range_upper,
            vel_lower,
            vel_upper,
            level,
            pan,
            fixed_pitch,
            root_note,
            coarse_tune,
            fine_tune,
            channels,
            loop_tune,
            play_form,
            wave_format,
            loop_mode,
            encrypted,
            reserved0,
            pad,
            loop_point_rest,
            reserved1,
            info,
            extra_reserved,
            sample_frequency,
            loop_start,
            loop_end,
            sample_length,
            moxf_tail,
        })
    }

    /// Write one key-bank in the given layout.
    pub fn write<W: Write + Seek>(
        &self,
        writer: &mut W,
        layout: KeyBankLayout,
    ) -> BinResult<()> {
        let (stored_level, stored_loop_start, loop_point_rest) = match layout {
            KeyBankLayout::Version1 { .. } => (self.level / 2, self.loop_start, self.loop_point_rest),
            KeyBankLayout::Version2 => (
                self.level,
                self.loop_start / 16,
                (self.loop_start % 16) as u8,
            ),
        };

        self.key_range_lower.write_le(writer)?;
        self.key_range_upper.write_le(writer)?;
        self.vel_lower.write_le(writer)?;
        self.vel_upper.write_le(writer)?;
        stored_level.write_le(writer)?;
        self.pan.write_le(writer)?;
        self.reserved0.write_le(writer)?;
        u8::from(self.fixed_pitch).write_le(writer)?;
        self.root_note.write_le(writer)?;
        self.coarse_tune.write_le(writer)?;
        self.fine_tune.write_le(writer)?;
        self.channels.write_le(writer)?;
        self.loop_tune.write_le(writer)?;
        self.play_form.write_le(writer)?;
        self.wave_format.write_le(writer)?;
        self.loop_mode.write_le(writer)?;
        u8::from(self.encrypted).write_le(writer)?;
        self.pad.write_le(writer)?;
        loop_point_rest.write_le(writer)?;
        self.reserved1.write_le(writer)?;
        writer.write_all(&self.info)?;

        let endian = match layout {
            KeyBankLayout::Version1 { .. } => Endian::Big,
            KeyBankLayout::Version2 => {
                writer.write_all(&self.extra_reserved.unwrap_or_default())?;
                Endian::Little
            }
        };
        self.sample_frequency.write_options(writer, endian, ())?;
        stored_loop_start.write_options(writer, endian, ())?;
        self.loop_end.write_options(writer, endian, ())?;
        self.sample_length.write_options(writer, endian, ())?;

        if matches!(layout, KeyBankLayout::Version1 { moxf: true }) {
            for value in self.moxf_tail.unwrap_or_default() {
                value.write_options(writer, Endian::Big, ())?;
            }
        }
        Ok(())
    }
}

/// Parse a DWFM data payload: `u16 BE count`, 2 bytes padding, then the
/// key-banks.
pub fn parse_key_banks(bytes: &[u8], layout: KeyBankLayout) -> Result<Vec<KeyBank>, FormatError> {
    let mut cursor = Cursor::new(bytes);
    let count = u16::read_be(&mut cursor)?;
    crate::strings::skip_bytes(&mut cursor, 2)?;
    let mut banks = Vec::with_capacity(count as usize);
    for _ in 0..count {
        banks.push(KeyBank::read(&mut cursor, layout)?);
    }
    Ok(banks)
}

/// Serialize key-banks into a DWFM data payload.
pub fn write_key_banks(banks: &[KeyBank], layout: KeyBankLayout) -> BinResult<Vec<u8>> {
    let mut cursor = Cursor::new(Vec::new());
    (banks.len() as u16).write_be(&mut cursor)?;
    0u16.write_be(&mut cursor)?;
    for bank in banks {
        bank.write(&mut cursor, layout)?;
    }
    Ok(cursor.into_inner())
}

// value conversions
// ----

/// Level (1-255) to decibels; level 0 is silence.
pub fn level_to_db(level: u8) -> f64 {
    if level == 0 {
        f64::NEG_INFINITY
    } else {
        LEVEL_FLOOR_DB + f64::from(level - 1) * LEVEL_STEP_DB
    }
}

/// Decibels to level, clamped into the representable -95.25..=0 dB range.
pub fn db_to_level(db: f64) -> u8 {
    if db == f64::NEG_INFINITY {
        return 0;
    }
    let clamped = db.clamp(LEVEL_FLOOR_DB, 0.0);
    let steps = ((clamped - LEVEL_FLOOR_DB) / LEVEL_STEP_DB).round();
    (steps as u16 + 1).min(255) as u8
}

/// Fine-tune byte to cents.
pub fn cents_from_fine(stored: u8) -> f64 {
    (f64::from(stored) - 64.0) * FINE_STEP_CENTS
}

/// Cents to the nearest fine-tune byte.
pub fn fine_from_cents(cents: f64) -> u8 {
    ((cents / FINE_STEP_CENTS) + 64.0).round().clamp(0.0, 127.0) as u8
}

/// Stored pan (1-127, center 64) to the -1..=+1 scale.
pub fn pan_from_stored(stored: u8) -> f64 {
    let p = f64::from(stored);
    if p > 64.0 {
        (p - 64.0) / 63.0
    } else {
        (p - 64.0) / 64.0
    }
}

/// Normalised pan back to the stored 1-127 scale.
pub fn stored_from_pan(pan: f64) -> u8 {
    let pan = pan.clamp(-1.0, 1.0);
    let stored = if pan > 0.0 {
        64.0 + (pan * 63.0).round()
    } else {
        64.0 + (pan * 64.0).round()
    };
    stored.clamp(1.0, 127.0) as u8
}
