//! YSFC wave data: the raw PCM payloads of a DWIM data item.
//!
//! A data item holds `u32 BE count` length-prefixed blobs of 16-bit PCM.
//! A stereo key-bank owns two consecutive blobs (left, then right); equal
//! lengths interleave into one stereo zone, unequal lengths fall back to
//! two hard-panned mono zones.

use binrw::io::{Cursor, Write};
use binrw::{BinRead, BinResult, BinWrite};

use crate::strings::read_bytes;
use crate::FormatError;

/// Parse a DWIM data payload into its PCM blobs.
pub fn parse_wave_data(bytes: &[u8]) -> Result<Vec<Vec<u8>>, FormatError> {
    let mut cursor = Cursor::new(bytes);
    let count = u32::read_be(&mut cursor)?;
    let mut waves = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let length = u32::read_be(&mut cursor)? as usize;
        waves.push(read_bytes(&mut cursor, length)?);
    }
    Ok(waves)
}

/// Serialize PCM blobs into a DWIM data payload.
pub fn write_wave_data(waves: &[Vec<u8>]) -> BinResult<Vec<u8>> {
    let mut cursor = Cursor::new(Vec::new());
    (waves.len() as u32).write_be(&mut cursor)?;
    for wave in waves {
        (wave.len() as u32).write_be(&mut cursor)?;
        cursor.write_all(wave)?;
    }
    Ok(cursor.into_inner())
}

/// Interleave equal-length left/right 16-bit blobs into stereo frames.
pub fn interleave_stereo(left: &[u8], right: &[u8]) -> Vec<u8> {
    let mut frames = Vec::with_capacity(left.len() + right.len());
    for (l, r) in left.chunks_exact(2).zip(right.chunks_exact(2)) {
        frames.extend_from_slice(l);
        frames.extend_from_slice(r);
    }
    frames
}

/// Split interleaved stereo 16-bit frames back into left/right blobs.
pub fn deinterleave_stereo(frames: &[u8]) -> (Vec<u8>, Vec<u8>) {
    let mut left = Vec::with_capacity(frames.len() / 2);
    let mut right = Vec::with_capacity(frames.len() / 2);
    for frame in frames.chunks_exact(4) {
        left.extend_from_slice(&frame[..2]);
        right.extend_from_slice(&frame[2..]);
    }
    (left, right)
}
