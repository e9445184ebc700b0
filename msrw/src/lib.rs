#![doc = include_str!("lib.md")]

use core::fmt::{Debug, Display, Formatter};
use core::sync::atomic::{AtomicBool, Ordering};
use std::error;
use std::sync::{Arc, Mutex};

use binrw::io::{Read, Seek, SeekFrom};
use binrw::binrw;
use tracing::{info, instrument, warn};

pub mod kontakt;
pub mod model;
pub mod strings;
pub mod wav;
pub mod ysfc;

#[cfg(test)]
pub(crate) mod testing;

use crate::model::{MultiSample, Performance};

// helper types
// ----

/// const ID stored for every four-byte-tagged chunk with a parser.
pub trait KnownChunkID {
    /// Chunk id.
    const ID: FourCC;
}

/// Retrieve a chunk ID from a chunk (even if dynamic, ex: an unknown chunk).
pub trait ChunkID {
    /// Returns the [`FourCC`] (chunk id) for the contained chunk.
    fn id(&self) -> FourCC;
}

/// Utility methods for describing parsed containers and chunks.
pub trait Summarizable {
    /// Returns a short text summary of the contents.
    fn summary(&self) -> String;

    /// User friendly name, usually the chunk or format id.
    fn name(&self) -> String {
        self.summary()
    }
}

impl<T> ChunkID for T
where
    T: KnownChunkID,
{
    fn id(&self) -> FourCC {
        T::ID
    }
}

/// Four byte chunk tag, often a readable id.
///
/// Used for YSFC chunk ids (`EWFM`, `DWIM`, ...) and RIFF ids inside
/// embedded sample payloads.
#[binrw]
#[brw(big)]
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FourCC(pub [u8; 4]);

impl Display for FourCC {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), core::fmt::Error> {
        write!(f, "{}", String::from_utf8_lossy(&self.0),)?;
        Ok(())
    }
}

impl Debug for FourCC {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), core::fmt::Error> {
        write!(f, "FourCC(*b\"{}\"=", self)?;
        write!(f, "{:?})", &self.0)?;
        Ok(())
    }
}

impl From<&[u8; 4]> for FourCC {
    fn from(value: &[u8; 4]) -> Self {
        FourCC(*value)
    }
}

impl<'a> PartialEq<&'a [u8; 4]> for FourCC {
    fn eq(&self, other: &&'a [u8; 4]) -> bool {
        self == FourCC(**other)
    }
}

// needed for assert in br() attribute
impl<'a> PartialEq<&'a FourCC> for FourCC {
    fn eq(&self, other: &&'a FourCC) -> bool {
        self == *other
    }
}

impl<'a> PartialEq<FourCC> for &'a FourCC {
    fn eq(&self, other: &FourCC) -> bool {
        *self == other
    }
}

// errors
// ----

/// Errors reported by the codecs.
///
/// Every kind carries enough position information to locate the failure in
/// the source file. Errors are per-file: a batch driver skips the file and
/// moves on.
#[derive(Debug)]
pub enum FormatError {
    /// An expected tag or magic literal mismatched.
    BadMagic {
        /// Absolute offset of the tag in the source.
        pos: u64,
        /// The expected literal, hex formatted.
        expected: String,
        /// The bytes actually present, hex formatted.
        found: String,
    },

    /// A chunk or file structure version above the supported maximum.
    UnsupportedVersion {
        /// What carried the version: a file family or chunk name.
        what: String,
        /// The offending version, formatted as the source stores it.
        version: String,
    },

    /// The NI container was authored by something other than Kontakt.
    WrongAuthoringApplication {
        /// Application name recorded in the container.
        found: String,
    },

    /// The monolith backward scan found a different number of sample
    /// headers than the dictionary lists filenames.
    MonolithSampleCountMismatch {
        /// Filenames listed in the sample dictionary.
        filenames: usize,
        /// Sample headers located by scanning.
        headers: usize,
    },

    /// A zone references a sample that is not among the in-memory files
    /// extracted from the container.
    NoMatchingInMemoryFile {
        /// Name of the zone whose sample is missing.
        zone: String,
    },

    /// A compressed sample payload reached a point that would require
    /// bit-level decoding.
    CompressedSampleUnsupported {
        /// Payload file name.
        name: String,
    },

    /// EOF before the end of an expected length-prefixed block.
    Truncated {
        /// Offset at which input ran out.
        pos: u64,
    },

    /// The input matches none of the supported container families.
    UnknownFormat {
        /// Summary of what was inspected.
        message: String,
    },

    /// An error occurred while parsing container data.
    Parse {
        /// The byte position of the unparsable data, when known.
        pos: Option<u64>,
        /// Summary of the underlying parsing error.
        message: String,
    },

    /// An error occurred in the underlying reader or writer.
    Io(std::io::Error),
}

impl error::Error for FormatError {}

impl Display for FormatError {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            FormatError::BadMagic {
                pos,
                expected,
                found,
            } => {
                write!(f, "BadMagic at {pos}: expected {expected}, found {found}")
            }
            FormatError::UnsupportedVersion { what, version } => {
                write!(f, "UnsupportedVersion: {what} {version}")
            }
            FormatError::WrongAuthoringApplication { found } => {
                write!(f, "WrongAuthoringApplication: {found}")
            }
            FormatError::MonolithSampleCountMismatch {
                filenames,
                headers,
            } => write!(
                f,
                "MonolithSampleCountMismatch: {filenames} filenames but {headers} sample headers"
            ),
            FormatError::NoMatchingInMemoryFile { zone } => {
                write!(f, "NoMatchingInMemoryFile for zone: {zone}")
            }
            FormatError::CompressedSampleUnsupported { name } => {
                write!(f, "CompressedSampleUnsupported: {name}")
            }
            FormatError::Truncated { pos } => write!(f, "Truncated at {pos}"),
            FormatError::UnknownFormat { message } => write!(f, "UnknownFormat: {message}"),
            FormatError::Parse { message, .. } => write!(f, "Parse: {message}"),
            FormatError::Io(err) => write!(f, "Io: {err}"),
        }
    }
}

impl From<std::io::Error> for FormatError {
    fn from(err: std::io::Error) -> Self {
        FormatError::Io(err)
    }
}

/// Map `binrw::Error` into the local taxonomy, keeping positions where the
/// underlying error recorded one.
impl From<binrw::Error> for FormatError {
    fn from(err: binrw::Error) -> Self {
        match err {
            binrw::Error::BadMagic { pos, found } => FormatError::BadMagic {
                pos,
                expected: String::new(),
                found: format!("{found:?}"),
            },
            binrw::Error::AssertFail { pos, message } => FormatError::Parse {
                pos: Some(pos),
                message,
            },
            binrw::Error::Custom { pos, err } => match err.downcast::<strings::TagMismatch>() {
                Ok(tag) => FormatError::BadMagic {
                    pos,
                    expected: tag.expected,
                    found: tag.found,
                },
                Err(err) => match err.downcast::<String>() {
                    Ok(message) => FormatError::Parse {
                        pos: Some(pos),
                        message: *message,
                    },
                    Err(_) => FormatError::Parse {
                        pos: Some(pos),
                        message: "custom parser error".to_string(),
                    },
                },
            },
            binrw::Error::Io(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                FormatError::Truncated { pos: 0 }
            }
            binrw::Error::Io(err) => FormatError::Io(err),
            binrw::Error::NoVariantMatch { pos } => FormatError::Parse {
                pos: Some(pos),
                message: "no variant match".to_string(),
            },
            _ => FormatError::Parse {
                pos: None,
                message: err.to_string(),
            },
        }
    }
}

// notifier
// ----

/// Structured event emitted during a conversion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotifyEvent {
    /// Human readable description of a detected source format.
    SourceFormat {
        /// e.g. "Kontakt 5.3.0" or "Yamaha Montage library 4.0.4".
        description: String,
    },
    /// A block ID outside the known set; parsing continued.
    UnknownBlockId {
        /// The block id as printable text.
        id: String,
    },
    /// A chunk ID outside the known table; bytes preserved.
    UnknownChunk {
        /// The chunk id, formatted.
        id: String,
        /// Offset of the chunk header.
        pos: u64,
    },
    /// Encrypted sub-tree detected; unencrypted siblings still parsed.
    EncryptedContent {
        /// Which container item is protected.
        item: String,
    },
    /// The modulator padding fell through both exact-match tables to the
    /// parity rule. Counted so table gaps can be correlated with read
    /// failures later.
    PaddingFallback {
        /// Modulated parameter name.
        parameter: String,
        /// Modulator description string.
        modulator: String,
    },
    /// A zone referenced a sample that could not be found; the zone was
    /// dropped and decoding continued.
    MissingSample {
        /// Zone whose sample is missing.
        zone: String,
    },
    /// One file of a batch finished.
    FileDone {
        /// Source file name.
        file: String,
    },
}

impl Display for NotifyEvent {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            NotifyEvent::SourceFormat { description } => write!(f, "source format: {description}"),
            NotifyEvent::UnknownBlockId { id } => write!(f, "unknown block id: {id}"),
            NotifyEvent::UnknownChunk { id, pos } => {
                write!(f, "unknown chunk {id} at {pos}, bytes preserved")
            }
            NotifyEvent::EncryptedContent { item } => {
                write!(f, "encrypted content in {item}, skipping protected parts")
            }
            NotifyEvent::PaddingFallback {
                parameter,
                modulator,
            } => write!(f, "modulator padding parity fallback: {parameter}/{modulator}"),
            NotifyEvent::MissingSample { zone } => {
                write!(f, "no sample payload for zone {zone}, zone dropped")
            }
            NotifyEvent::FileDone { file } => write!(f, "done: {file}"),
        }
    }
}

/// Per-conversion event sink.
///
/// The only object shared across a conversion; implementations must accept
/// events without external locking.
pub trait Notifier: Send + Sync {
    /// Record an informational event.
    fn log(&self, event: NotifyEvent);

    /// Record an event together with the error that caused it.
    fn log_error(&self, event: NotifyEvent, cause: &FormatError);
}

/// [`Notifier`] forwarding events to `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn log(&self, event: NotifyEvent) {
        match event {
            NotifyEvent::SourceFormat { .. } | NotifyEvent::FileDone { .. } => {
                info!("{event}");
            }
            NotifyEvent::UnknownBlockId { .. }
            | NotifyEvent::UnknownChunk { .. }
            | NotifyEvent::EncryptedContent { .. }
            | NotifyEvent::PaddingFallback { .. }
            | NotifyEvent::MissingSample { .. } => warn!("{event}"),
        }
    }

    fn log_error(&self, event: NotifyEvent, cause: &FormatError) {
        warn!("{event}: {cause}");
    }
}

/// [`Notifier`] collecting formatted events, for tests and batch reports.
#[derive(Debug, Default)]
pub struct MemoryNotifier {
    events: Mutex<Vec<String>>,
}

impl MemoryNotifier {
    /// New empty sink.
    pub fn new() -> Self {
        MemoryNotifier::default()
    }

    /// Snapshot of the formatted events so far.
    pub fn events(&self) -> Vec<String> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    fn push(&self, line: String) {
        if let Ok(mut events) = self.events.lock() {
            events.push(line);
        }
    }
}

impl Notifier for MemoryNotifier {
    fn log(&self, event: NotifyEvent) {
        self.push(event.to_string());
    }

    fn log_error(&self, event: NotifyEvent, cause: &FormatError) {
        self.push(format!("{event}: {cause}"));
    }
}

// cancellation
// ----

/// Cooperative cancellation flag, observed between files only.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// New, not-yet-cancelled token.
    pub fn new() -> Self {
        CancelToken::default()
    }

    /// Request cancellation. Takes effect at the next file boundary.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    /// True once [`CancelToken::cancel`] has been called.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

// collaborator interfaces
// ----

/// ZLIB inflate/deflate collaborator, used by the legacy Kontakt 2 codec.
///
/// Implemented outside this crate; the codec hands the raw deflate stream
/// through untouched when no collaborator is supplied.
pub trait ZlibCodec {
    /// Decompress a raw ZLIB stream.
    fn inflate(&self, bytes: &[u8]) -> Result<Vec<u8>, FormatError>;

    /// Compress into a raw ZLIB stream.
    fn deflate(&self, bytes: &[u8]) -> Result<Vec<u8>, FormatError>;
}

// format dispatch
// ----

/// Container family, as far as a file extension can tell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatFamily {
    /// Native Instruments Kontakt.
    Kontakt,
    /// Yamaha YSFC.
    Ysfc,
}

/// Detected source format of an input file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFormat {
    /// Kontakt 2–4.1 classic header, possibly with an inline monolith.
    Kontakt2,
    /// Kontakt 5+ NI container.
    Kontakt5Container,
    /// Kontakt 5+ file-container monolith wrapping an inner NKI.
    Kontakt5Monolith,
    /// YAMAHA-YSFC library.
    Ysfc,
}

impl SourceFormat {
    /// The family this format belongs to.
    pub fn family(&self) -> FormatFamily {
        match self {
            SourceFormat::Kontakt2
            | SourceFormat::Kontakt5Container
            | SourceFormat::Kontakt5Monolith => FormatFamily::Kontakt,
            SourceFormat::Ysfc => FormatFamily::Ysfc,
        }
    }
}

impl Display for SourceFormat {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            SourceFormat::Kontakt2 => write!(f, "Kontakt 2-4 preset"),
            SourceFormat::Kontakt5Container => write!(f, "Kontakt 5+ preset"),
            SourceFormat::Kontakt5Monolith => write!(f, "Kontakt 5+ monolith"),
            SourceFormat::Ysfc => write!(f, "Yamaha YSFC library"),
        }
    }
}

/// Map a file extension (without dot, any case) to the owning family.
pub fn format_for_extension(ext: &str) -> Option<FormatFamily> {
    match ext.to_ascii_lowercase().as_str() {
        "nki" | "nkm" | "nkr" => Some(FormatFamily::Kontakt),
        "x7u" | "x7l" | "x7a" | "x8u" | "x8l" | "x8a" | "x0a" | "x0w" | "x3a" | "x3w" | "x6a"
        | "x6w" => Some(FormatFamily::Ysfc),
        _ => None,
    }
}

const KONTAKT1_MAGIC: u32 = 0xB36E_E55E;

/// Inspect the first bytes of `reader` and decide which codec owns it.
///
/// The reader is rewound to the start afterwards. Kontakt 1 files are
/// recognised only far enough to reject them.
pub fn detect_format<R: Read + Seek>(reader: &mut R) -> Result<SourceFormat, FormatError> {
    let len = reader.seek(SeekFrom::End(0))?;
    reader.seek(SeekFrom::Start(0))?;
    if len < 16 {
        return Err(FormatError::UnknownFormat {
            message: format!("file too short ({len} bytes)"),
        });
    }
    let mut head = [0u8; 16];
    reader.read_exact(&mut head)?;
    reader.seek(SeekFrom::Start(0))?;

    if head.starts_with(b"YAMAHA-YSFC") {
        return Ok(SourceFormat::Ysfc);
    }
    if &head[12..16] == b"hsin" {
        return Ok(SourceFormat::Kontakt5Container);
    }
    if head == *kontakt::monolith::MTD_MAGIC {
        return Ok(SourceFormat::Kontakt5Monolith);
    }
    let first = u32::from_le_bytes([head[0], head[1], head[2], head[3]]);
    if first == KONTAKT1_MAGIC {
        return Err(FormatError::UnsupportedVersion {
            what: "Kontakt".to_string(),
            version: "1.x".to_string(),
        });
    }
    // Kontakt 2 layout: leading u32 is the length of the ZLIB block that
    // follows the header, so it must fit inside the file.
    if first > 0 && u64::from(first) < len.saturating_sub(12) {
        return Ok(SourceFormat::Kontakt2);
    }
    Err(FormatError::UnknownFormat {
        message: format!("unrecognised leading bytes {head:02X?}"),
    })
}

// session
// ----

/// Everything decoded from one source file.
#[derive(Debug, Default)]
pub struct DecodeOutcome {
    /// The multi-samples, one per program / waveform.
    pub multi_samples: Vec<MultiSample>,
    /// Layering information, when the container holds more than one
    /// program with slot assignments.
    pub performance: Option<Performance>,
}

/// One logical conversion: a notifier sink, a cancellation flag, and the
/// format dispatch. Sessions are independent; run one per worker.
pub struct Session {
    notifier: Arc<dyn Notifier>,
    cancel: CancelToken,
}

impl Debug for Session {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Session").finish()
    }
}

impl Session {
    /// New session with a fresh cancellation token.
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        Session {
            notifier,
            cancel: CancelToken::new(),
        }
    }

    /// New session observing an externally owned cancellation token.
    pub fn with_cancel(notifier: Arc<dyn Notifier>, cancel: CancelToken) -> Self {
        Session { notifier, cancel }
    }

    /// The session's event sink.
    pub fn notifier(&self) -> &Arc<dyn Notifier> {
        &self.notifier
    }

    /// The session's cancellation token.
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Detect the format of `reader` without consuming it.
    pub fn detect<R: Read + Seek>(&self, reader: &mut R) -> Result<SourceFormat, FormatError> {
        detect_format(reader)
    }

    /// Decode one source file, routing to the owning codec.
    ///
    /// `source_name` is the file name (used for fallback naming and log
    /// messages); the reader supplies the bytes.
    #[instrument(skip(self, reader))]
    pub fn read<R: Read + Seek>(
        &self,
        reader: &mut R,
        source_name: &str,
    ) -> Result<DecodeOutcome, FormatError> {
        let format = detect_format(reader)?;
        let outcome = match format {
            SourceFormat::Ysfc => ysfc::read_library(self, reader, source_name),
            SourceFormat::Kontakt2
            | SourceFormat::Kontakt5Container
            | SourceFormat::Kontakt5Monolith => kontakt::read_preset(self, reader, source_name),
        }?;
        self.notifier.log(NotifyEvent::FileDone {
            file: source_name.to_string(),
        });
        Ok(outcome)
    }

    /// Write `multi` as a Kontakt 5+ NKI preset.
    pub fn write_kontakt<W: binrw::io::Write + Seek>(
        &self,
        multi: &MultiSample,
        writer: &mut W,
    ) -> Result<(), FormatError> {
        kontakt::writer::write_nki(multi, writer)
    }

    /// Write `multis` as a YSFC library for `workstation`.
    pub fn write_ysfc<W: binrw::io::Write + Seek>(
        &self,
        multis: &[MultiSample],
        workstation: ysfc::Workstation,
        writer: &mut W,
    ) -> Result<(), FormatError> {
        ysfc::writer::write_library(multis, workstation, writer)
    }
}

#[allow(clippy::dbg_macro)]
#[cfg(test)]
mod test {
    use binrw::io::Cursor;

    use super::*;

    #[test]
    fn fourcc() {
        let f = FourCC(*b"EWFM");
        assert_eq!(f.to_string(), "EWFM");
        assert_eq!(format!("{f:?}"), r#"FourCC(*b"EWFM"=[69, 87, 70, 77])"#);
    }

    #[test]
    fn extension_mapping() {
        assert_eq!(format_for_extension("nki"), Some(FormatFamily::Kontakt));
        assert_eq!(format_for_extension("NKM"), Some(FormatFamily::Kontakt));
        assert_eq!(format_for_extension("x7u"), Some(FormatFamily::Ysfc));
        assert_eq!(format_for_extension("X6W"), Some(FormatFamily::Ysfc));
        assert_eq!(format_for_extension("sfz"), None);
    }

    #[test]
    fn detect_ysfc() {
        let mut bytes = b"YAMAHA-YSFC     ".to_vec();
        bytes.extend_from_slice(&[0u8; 64]);
        let mut cursor = Cursor::new(bytes);
        assert_eq!(
            detect_format(&mut cursor).expect("detect"),
            SourceFormat::Ysfc
        );
        assert_eq!(cursor.position(), 0, "reader must be rewound");
    }

    #[test]
    fn detect_container() {
        let mut bytes = vec![0u8; 8]; // u64 total length placeholder
        bytes.extend_from_slice(&1u32.to_le_bytes());
        bytes.extend_from_slice(b"hsin");
        bytes.extend_from_slice(&[0u8; 32]);
        let mut cursor = Cursor::new(bytes);
        assert_eq!(
            detect_format(&mut cursor).expect("detect"),
            SourceFormat::Kontakt5Container
        );
    }

    #[test]
    fn detect_kontakt1_rejected() {
        let mut bytes = KONTAKT1_MAGIC.to_le_bytes().to_vec();
        bytes.extend_from_slice(&[0u8; 64]);
        let err = detect_format(&mut Cursor::new(bytes)).expect_err("kontakt 1 must reject");
        match err {
            FormatError::UnsupportedVersion { version, .. } => assert_eq!(version, "1.x"),
            _ => panic!("expected UnsupportedVersion, got {err:?}"),
        }
    }

    #[test]
    fn detect_unknown() {
        let bytes = vec![0xFFu8; 64];
        let err = detect_format(&mut Cursor::new(bytes)).expect_err("garbage must not detect");
        assert!(matches!(err, FormatError::UnknownFormat { .. }));
    }

    #[test]
    fn memory_notifier_is_synchronised() {
        let notifier = MemoryNotifier::new();
        notifier.log(NotifyEvent::FileDone {
            file: "a.nki".to_string(),
        });
        notifier.log_error(
            NotifyEvent::UnknownBlockId {
                id: "XXXX".to_string(),
            },
            &FormatError::Truncated { pos: 12 },
        );
        let events = notifier.events();
        assert_eq!(events.len(), 2);
        assert!(events[0].contains("a.nki"));
        assert!(events[1].contains("Truncated at 12"));
    }
}
