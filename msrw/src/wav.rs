//! Minimal RIFF-WAVE walker for embedded sample payloads.
//!
//! Monolith containers store their samples as whole WAV files. The audio
//! itself stays an opaque blob here; this walk only lifts the `fmt ` fields
//! and the `data` length into an [`AudioMetadata`] descriptor so zones can
//! be mapped without decoding anything.

use binrw::io::{Cursor, Seek, SeekFrom};
use binrw::{binrw, BinRead};
use tracing::debug;

use crate::model::AudioMetadata;
use crate::FourCC;

/// `RIFF` header of an embedded WAV payload.
#[binrw]
#[brw(little)]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RiffHeader {
    /// RIFF chunk id, `RIFF` for the containers handled here.
    pub id: FourCC,
    /// Size of the form in bytes, excluding id and this field.
    pub size: u32,
    /// Form type, `WAVE` for sample payloads.
    pub form_type: FourCC,
}

/// Leading fields of a `fmt ` chunk (WAVEFORMAT).
#[binrw]
#[brw(little)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct WaveFormat {
    /// Format category; 1 = integer PCM.
    pub format_tag: u16,
    /// Interleaved channel count.
    pub channels: u16,
    /// Frames per second.
    pub samples_per_sec: u32,
    /// Average bytes per second.
    pub avg_bytes_per_sec: u32,
    /// Bytes per frame across all channels.
    pub block_align: u16,
    /// Bits per sample per channel.
    pub bits_per_sample: u16,
}

/// Walk a WAV payload and build its descriptor.
///
/// Returns `None` when the payload is not RIFF-WAVE (e.g. NCW); such
/// payloads keep a descriptor supplied by their container instead.
pub fn sniff_wav_metadata(bytes: &[u8]) -> Option<AudioMetadata> {
    let mut cursor = Cursor::new(bytes);
    let riff = RiffHeader::read(&mut cursor).ok()?;
    if riff.id != FourCC(*b"RIFF") || riff.form_type != FourCC(*b"WAVE") {
        return None;
    }

    let mut format: Option<WaveFormat> = None;
    let mut data_len: Option<u32> = None;
    loop {
        let id = match FourCC::read(&mut cursor) {
            Ok(id) => id,
            Err(_) => break,
        };
        let size = match u32::read_le(&mut cursor) {
            Ok(size) => size,
            Err(_) => break,
        };
        let next = cursor.position() + u64::from(size) + u64::from(size) % 2;
        match &id.0 {
            b"fmt " => format = WaveFormat::read(&mut cursor).ok(),
            b"data" => data_len = Some(size),
            _ => debug!("skipping wav chunk {id} of {size} bytes"),
        }
        if format.is_some() && data_len.is_some() {
            break;
        }
        if cursor.seek(SeekFrom::Start(next)).is_err() {
            break;
        }
    }

    let format = format?;
    let data_len = data_len?;
    if format.block_align == 0 {
        return None;
    }
    Some(AudioMetadata {
        channels: format.channels,
        sample_rate: format.samples_per_sec,
        bits_per_sample: format.bits_per_sample,
        frame_count: u64::from(data_len) / u64::from(format.block_align),
    })
}

/// Pull the raw interleaved PCM frames out of a WAV payload, together with
/// its format record. `None` when the payload is not RIFF-WAVE or has no
/// `data` chunk.
pub fn extract_pcm(bytes: &[u8]) -> Option<(WaveFormat, Vec<u8>)> {
    let mut cursor = Cursor::new(bytes);
    let riff = RiffHeader::read(&mut cursor).ok()?;
    if riff.id != FourCC(*b"RIFF") || riff.form_type != FourCC(*b"WAVE") {
        return None;
    }
    let mut format: Option<WaveFormat> = None;
    let mut data: Option<Vec<u8>> = None;
    loop {
        let id = match FourCC::read(&mut cursor) {
            Ok(id) => id,
            Err(_) => break,
        };
        let size = match u32::read_le(&mut cursor) {
            Ok(size) => size,
            Err(_) => break,
        };
        let next = cursor.position() + u64::from(size) + u64::from(size) % 2;
        match &id.0 {
            b"fmt " => format = WaveFormat::read(&mut cursor).ok(),
            b"data" => {
                let start = cursor.position() as usize;
                let end = (start + size as usize).min(bytes.len());
                data = Some(bytes[start..end].to_vec());
            }
            _ => {}
        }
        if format.is_some() && data.is_some() {
            break;
        }
        if cursor.seek(SeekFrom::Start(next)).is_err() {
            break;
        }
    }
    Some((format?, data?))
}

/// Build a minimal 16-bit PCM WAV container around raw interleaved frames.
///
/// Used when re-homing in-memory samples into formats that expect whole
/// WAV files.
pub fn build_pcm16_wav(channels: u16, sample_rate: u32, frames: &[u8]) -> Vec<u8> {
    let block_align = channels * 2;
    let data_len = frames.len() as u32;
    let mut out = Vec::with_capacity(44 + frames.len());
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&(36 + data_len).to_le_bytes());
    out.extend_from_slice(b"WAVE");
    out.extend_from_slice(b"fmt ");
    out.extend_from_slice(&16u32.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes());
    out.extend_from_slice(&channels.to_le_bytes());
    out.extend_from_slice(&sample_rate.to_le_bytes());
    out.extend_from_slice(&(sample_rate * u32::from(block_align)).to_le_bytes());
    out.extend_from_slice(&block_align.to_le_bytes());
    out.extend_from_slice(&16u16.to_le_bytes());
    out.extend_from_slice(b"data");
    out.extend_from_slice(&data_len.to_le_bytes());
    out.extend_from_slice(frames);
    out
}

#[allow(clippy::dbg_macro)]
#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn sniff_built_wav() {
        let frames = vec![0u8; 4 * 100]; // 100 stereo 16-bit frames
        let wav = build_pcm16_wav(2, 44100, &frames);
        let meta = sniff_wav_metadata(&wav).expect("wav should sniff");
        assert_eq!(
            meta,
            AudioMetadata {
                channels: 2,
                sample_rate: 44100,
                bits_per_sample: 16,
                frame_count: 100,
            }
        );
    }

    #[test]
    fn sniff_rejects_non_riff() {
        assert_eq!(sniff_wav_metadata(b"NCW1xxxxxxxxxxxx"), None);
        assert_eq!(sniff_wav_metadata(b""), None);
    }

    #[test]
    fn extract_roundtrips_frames() {
        let frames: Vec<u8> = (0..200u16).flat_map(u16::to_le_bytes).collect();
        let wav = build_pcm16_wav(2, 48000, &frames);
        let (format, data) = extract_pcm(&wav).expect("pcm frames");
        assert_eq!(format.channels, 2);
        assert_eq!(format.samples_per_sec, 48000);
        assert_eq!(data, frames);
        assert_eq!(extract_pcm(b"not riff data here.."), None);
    }
}
