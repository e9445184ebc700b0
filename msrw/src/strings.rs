//! Wire string and block helpers shared by both codecs.
//!
//! Three string flavors appear in the supported containers: fixed-length
//! ASCII padded with 0x00 or 0xFF ([`PaddedAsciiString`]), UTF-16 LE with a
//! u32 code-unit-count prefix ([`read_utf16_prefixed`]), and NUL-terminated
//! ASCII (`binrw::NullString`). Length-prefixed byte blocks and tag checks
//! live here too so every codec fails the same way at the same offsets.

use core::cmp::min;
use core::fmt::{Debug, Display, Formatter};
use core::str::FromStr;

use binrw::io::{Read, Seek, SeekFrom, Write};
use binrw::{BinRead, BinResult, BinWrite, Endian};

/// Fixed-length ASCII field, padded with 0x00 or 0xFF.
///
/// Reading strips trailing padding and any trailing non-ASCII bytes;
/// remaining bytes are decoded as ISO-8859-1, which several Kontakt 2
/// header fields use. Writing emits the text followed by 0x00 padding.
#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct PaddedAsciiString<const N: usize>(String);

impl<const N: usize> Debug for PaddedAsciiString<N> {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), core::fmt::Error> {
        f.debug_tuple(&format!("PaddedAsciiString::<{}>", N))
            .field(&self.to_string())
            .finish()
    }
}

impl<const N: usize> Display for PaddedAsciiString<N> {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), core::fmt::Error> {
        write!(f, "{}", &self.0)
    }
}

impl<const N: usize> PaddedAsciiString<N> {
    /// Fixed byte width of the field.
    pub fn width(&self) -> usize {
        N
    }

    /// True when no text is stored.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The decoded text with padding removed.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Decode a raw field: strip trailing 0x00/0xFF padding and trailing
    /// non-ASCII bytes, decode the rest as ISO-8859-1.
    pub fn from_raw(raw: &[u8; N]) -> Self {
        let mut end = N;
        while end > 0 {
            let b = raw[end - 1];
            if b == 0x00 || b == 0xFF || !b.is_ascii() {
                end -= 1;
            } else {
                break;
            }
        }
        let text: String = raw[..end]
            .iter()
            .map(|&b| char::from(b))
            .collect::<String>()
            .trim_end()
            .to_string();
        PaddedAsciiString(text)
    }

    /// Encode to the fixed width, truncating and zero-padding as needed.
    pub fn to_raw(&self) -> [u8; N] {
        let mut raw = [0u8; N];
        let bytes: Vec<u8> = self.0.chars().map(|c| if (c as u32) < 256 { c as u8 } else { b'?' }).collect();
        let l = min(bytes.len(), N);
        raw[..l].copy_from_slice(&bytes[..l]);
        raw
    }
}

impl<const N: usize> FromStr for PaddedAsciiString<N> {
    type Err = core::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut s = s.to_string();
        s.truncate(N);
        Ok(PaddedAsciiString(s))
    }
}

impl<const N: usize> From<&str> for PaddedAsciiString<N> {
    fn from(value: &str) -> Self {
        let mut s = value.to_string();
        s.truncate(N);
        PaddedAsciiString(s)
    }
}

impl<const N: usize> BinRead for PaddedAsciiString<N> {
    type Args<'a> = ();

    fn read_options<R: Read + Seek>(
        reader: &mut R,
        _endian: Endian,
        (): Self::Args<'_>,
    ) -> BinResult<Self> {
        let mut raw = [0u8; N];
        reader.read_exact(&mut raw)?;
        Ok(Self::from_raw(&raw))
    }
}

impl<const N: usize> BinWrite for PaddedAsciiString<N> {
    type Args<'a> = ();

    fn write_options<W: Write + Seek>(
        &self,
        writer: &mut W,
        endian: Endian,
        args: Self::Args<'_>,
    ) -> BinResult<()> {
        self.to_raw().write_options(writer, endian, args)
    }
}

/// Read a u32-LE code-unit-count prefixed UTF-16 LE string.
///
/// The prefix counts 16-bit code units, not bytes. Unpaired surrogates
/// decode to U+FFFD rather than failing; preset files in the wild contain
/// them.
pub fn read_utf16_prefixed<R: Read + Seek>(reader: &mut R) -> BinResult<String> {
    let count = u32::read_le(reader)? as usize;
    read_utf16_units(reader, count)
}

/// Write a string as u32-LE code-unit count followed by UTF-16 LE units.
pub fn write_utf16_prefixed<W: Write + Seek>(writer: &mut W, text: &str) -> BinResult<()> {
    let units: Vec<u16> = text.encode_utf16().collect();
    (units.len() as u32).write_le(writer)?;
    for unit in units {
        unit.write_le(writer)?;
    }
    Ok(())
}

/// Read exactly `count` UTF-16 LE code units.
pub fn read_utf16_units<R: Read + Seek>(reader: &mut R, count: usize) -> BinResult<String> {
    let mut units = Vec::with_capacity(count);
    for _ in 0..count {
        units.push(u16::read_le(reader)?);
    }
    Ok(String::from_utf16_lossy(&units))
}

/// Read a fixed-width UTF-16 LE field and strip at the first NUL unit.
/// `width` is in bytes and must be even.
pub fn read_utf16_fixed<R: Read + Seek>(reader: &mut R, width: usize) -> BinResult<String> {
    let text = read_utf16_units(reader, width / 2)?;
    Ok(match text.find('\0') {
        Some(idx) => text[..idx].to_string(),
        None => text,
    })
}

/// Write a string into a fixed-width UTF-16 LE field, NUL padded.
/// `width` is in bytes and must be even.
pub fn write_utf16_fixed<W: Write + Seek>(
    writer: &mut W,
    text: &str,
    width: usize,
) -> BinResult<()> {
    let mut units: Vec<u16> = text.encode_utf16().collect();
    units.truncate(width / 2);
    units.resize(width / 2, 0);
    for unit in units {
        unit.write_le(writer)?;
    }
    Ok(())
}

/// Read a u32-length-prefixed ASCII string, endianness of the prefix per
/// call.
pub fn read_ascii_prefixed<R: Read + Seek>(reader: &mut R, endian: Endian) -> BinResult<String> {
    let len = u32::read_options(reader, endian, ())? as usize;
    let mut raw = vec![0u8; len];
    reader.read_exact(&mut raw)?;
    Ok(raw.iter().map(|&b| char::from(b)).collect())
}

/// Write a u32-length-prefixed ASCII string.
pub fn write_ascii_prefixed<W: Write + Seek>(
    writer: &mut W,
    text: &str,
    endian: Endian,
) -> BinResult<()> {
    (text.len() as u32).write_options(writer, endian, ())?;
    writer.write_all(text.as_bytes())?;
    Ok(())
}

/// Read a u32-length-prefixed byte block, endianness of the prefix per call.
pub fn read_block_u32<R: Read + Seek>(reader: &mut R, endian: Endian) -> BinResult<Vec<u8>> {
    let len = u32::read_options(reader, endian, ())? as usize;
    read_bytes(reader, len)
}

/// Write a u32-length-prefixed byte block.
pub fn write_block_u32<W: Write + Seek>(
    writer: &mut W,
    bytes: &[u8],
    endian: Endian,
) -> BinResult<()> {
    (bytes.len() as u32).write_options(writer, endian, ())?;
    writer.write_all(bytes)?;
    Ok(())
}

/// Read exactly `len` bytes, failing with the position of the short read.
pub fn read_bytes<R: Read + Seek>(reader: &mut R, len: usize) -> BinResult<Vec<u8>> {
    let mut raw = vec![0u8; len];
    let pos = reader.stream_position()?;
    reader.read_exact(&mut raw).map_err(|err| binrw::Error::Custom {
        pos,
        err: Box::new(format!("short read of {len} byte block: {err}")),
    })?;
    Ok(raw)
}

/// Skip `len` bytes.
pub fn skip_bytes<R: Read + Seek>(reader: &mut R, len: u64) -> BinResult<()> {
    reader.seek(SeekFrom::Current(len as i64))?;
    Ok(())
}

/// Write `len` copies of `fill`.
pub fn write_fill<W: Write + Seek>(writer: &mut W, fill: u8, len: usize) -> BinResult<()> {
    writer.write_all(&vec![fill; len])?;
    Ok(())
}

/// Typed payload of a failed [`expect_tag`], carried through
/// `binrw::Error::Custom` so the crate error can recover both sides.
#[derive(Debug)]
pub(crate) struct TagMismatch {
    pub expected: String,
    pub found: String,
}

impl std::fmt::Display for TagMismatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "expected {}, found {}", self.expected, self.found)
    }
}

/// Read `expected.len()` bytes and compare against the expected literal.
///
/// On mismatch, fails with the absolute offset of the tag and both byte
/// sequences; the crate error type surfaces this as its `BadMagic` kind.
pub fn expect_tag<R: Read + Seek>(reader: &mut R, expected: &[u8]) -> BinResult<()> {
    let pos = reader.stream_position()?;
    let mut found = vec![0u8; expected.len()];
    reader.read_exact(&mut found)?;
    if found == expected {
        Ok(())
    } else {
        Err(binrw::Error::Custom {
            pos,
            err: Box::new(TagMismatch {
                expected: format!("{expected:02X?}"),
                found: format!("{found:02X?}"),
            }),
        })
    }
}
