//! Native Instruments Kontakt preset codec.
//!
//! Three on-disk shapes reach this module: the classic Kontakt 2-4.1
//! header (with an optional inline monolith), the Kontakt 5+ NI container,
//! and the Kontakt 5+ file-container monolith wrapping an inner NKI. All
//! of them decode into the shared multi-sample model; writing always
//! produces a Kontakt 5+ container via the template in [`writer`].

pub mod chunk;
pub mod container;
pub mod filelist;
pub mod modulator;
pub mod monolith;
pub mod nki2;
pub mod program;
pub mod template;
pub mod writer;

use std::collections::HashMap;
use std::sync::Arc;

use binrw::io::{Cursor, Read, Seek};
use tracing::{instrument, warn};

use crate::kontakt::chunk::PresetChunk;
use crate::kontakt::container::{AuthoringApplication, NiChunkPayload, NiChunkType, NiContainerItem};
use crate::kontakt::monolith::Monolith;
use crate::model::{Group, MemorySample, MultiSample, SampleData, SampleZone};
use crate::{
    detect_format, DecodeOutcome, FormatError, Notifier, NotifyEvent, Session, SourceFormat,
    Summarizable,
};

/// Decode one Kontakt preset file.
#[instrument(skip(session, reader))]
pub fn read_preset<R: Read + Seek>(
    session: &Session,
    reader: &mut R,
    source_name: &str,
) -> Result<DecodeOutcome, FormatError> {
    let notifier = session.notifier().as_ref();
    match detect_format(reader)? {
        SourceFormat::Kontakt5Container => read_container(reader, source_name, notifier),
        SourceFormat::Kontakt5Monolith => read_file_container(session, reader, source_name),
        SourceFormat::Kontakt2 => read_classic(reader, source_name, notifier),
        SourceFormat::Ysfc => Err(FormatError::UnknownFormat {
            message: format!("{source_name} is a YSFC library, not a Kontakt preset"),
        }),
    }
}

fn read_container<R: Read + Seek>(
    reader: &mut R,
    source_name: &str,
    notifier: &dyn Notifier,
) -> Result<DecodeOutcome, FormatError> {
    let item = NiContainerItem::read(reader)?;

    match item.authoring_application() {
        Some((AuthoringApplication::Kontakt, version)) => {
            notifier.log(NotifyEvent::SourceFormat {
                description: format!("Kontakt {version}"),
            });
        }
        Some((other, _)) => {
            return Err(FormatError::WrongAuthoringApplication {
                found: format!("{other:?}"),
            });
        }
        None => warn!("{source_name}: container without authoring application chunk"),
    }

    for protected in item.protected_items() {
        notifier.log(NotifyEvent::EncryptedContent { item: protected });
    }

    let preset = item
        .find(NiChunkType::PresetChunkItem)
        .ok_or_else(|| FormatError::Parse {
            pos: None,
            message: format!("{source_name}: container has no preset chunk"),
        })?;
    let NiChunkPayload::PresetChunkItem { bytes } = &preset.payload else {
        return Err(FormatError::Parse {
            pos: None,
            message: format!("{source_name}: preset chunk has unexpected payload"),
        });
    };
    let chunks = PresetChunk::read_all(bytes)?;
    program::decode_preset_tree(&chunks, source_name, notifier)
}

fn read_file_container<R: Read + Seek>(
    session: &Session,
    reader: &mut R,
    source_name: &str,
) -> Result<DecodeOutcome, FormatError> {
    let notifier = session.notifier().as_ref();
    let monolith = monolith::read_monolith(reader)?;
    notifier.log(NotifyEvent::SourceFormat {
        description: monolith.summary(),
    });

    let main = monolith.main_file().ok_or_else(|| FormatError::Parse {
        pos: None,
        message: format!("{source_name}: monolith has no inner .nki/.nkm entry"),
    })?;
    let main_name = main.name.clone();
    let mut outcome = read_container(&mut Cursor::new(&main.bytes[..]), &main_name, notifier)?;

    let pool = sample_pool(&monolith);
    let mut decoded = Vec::with_capacity(outcome.multi_samples.len());
    for mut multi in outcome.multi_samples {
        // multi-sample boundaries are the cancellation points in a monolith
        if session.cancel_token().is_cancelled() {
            break;
        }
        substitute_samples(&mut multi, &pool, notifier);
        decoded.push(multi);
    }
    outcome.multi_samples = decoded;
    Ok(outcome)
}

fn sample_pool(monolith: &Monolith) -> HashMap<String, Arc<MemorySample>> {
    monolith
        .sample_files()
        .map(|file| {
            let metadata = crate::wav::sniff_wav_metadata(&file.bytes).unwrap_or_default();
            (
                file.name.to_ascii_lowercase(),
                Arc::new(MemorySample {
                    name: file.name.clone(),
                    metadata,
                    bytes: file.bytes.clone(),
                }),
            )
        })
        .collect()
}

/// Swap every zone's file reference for the in-memory payload extracted
/// from the monolith, matching by zone name plus extension. Zones without
/// a matching payload are dropped with a notifier event; the rest of the
/// file is kept.
fn substitute_samples(
    multi: &mut MultiSample,
    pool: &HashMap<String, Arc<MemorySample>>,
    notifier: &dyn Notifier,
) {
    for group in &mut multi.groups {
        group.zones.retain_mut(|zone| {
            if zone.sample.is_none() {
                return true; // script-only zones carry no payload
            }
            let wav = format!("{}.wav", zone.name).to_ascii_lowercase();
            let ncw = format!("{}.ncw", zone.name).to_ascii_lowercase();
            match pool.get(&wav).or_else(|| pool.get(&ncw)) {
                Some(sample) => {
                    zone.sample = Some(SampleData::Memory(Arc::clone(sample)));
                    true
                }
                None => {
                    notifier.log_error(
                        NotifyEvent::MissingSample {
                            zone: zone.name.clone(),
                        },
                        &FormatError::NoMatchingInMemoryFile {
                            zone: zone.name.clone(),
                        },
                    );
                    false
                }
            }
        });
    }
}

fn read_classic<R: Read + Seek>(
    reader: &mut R,
    source_name: &str,
    notifier: &dyn Notifier,
) -> Result<DecodeOutcome, FormatError> {
    let file = nki2::read_nki2(reader, notifier)?;

    let stem = source_name
        .rsplit_once('.')
        .map(|(stem, _)| stem.to_string())
        .unwrap_or_else(|| source_name.to_string());
    let mut multi = MultiSample::new(stem);
    multi.metadata.creator = match file.header.author.as_str() {
        "" => None,
        author => Some(author.to_string()),
    };
    multi.metadata.category = file.header.icon().map(str::to_string);
    multi.metadata.creation_date = Some(file.header.timestamp.clone());
    if let Some(website) = &file.header.website {
        multi.metadata.keywords.push(website.clone());
    }

    // the instrument mapping itself lives in the ZLIB XML, which belongs
    // to the outer collaborators; monolith samples are still surfaced as
    // one full-range zone each
    if !file.samples.is_empty() {
        let mut group = Group::new("Samples");
        for sample in &file.samples {
            let name = match sample.name.rsplit_once('.') {
                Some((stem, _)) => stem.to_string(),
                None => sample.name.clone(),
            };
            let mut zone = SampleZone::new(name);
            zone.stop = sample.metadata.frame_count;
            zone.sample = Some(SampleData::Memory(Arc::clone(sample)));
            group.zones.push(zone);
        }
        multi.groups.push(group);
    }

    Ok(DecodeOutcome {
        multi_samples: vec![multi],
        performance: None,
    })
}

#[allow(clippy::dbg_macro)]
#[cfg(test)]
mod test {
    use binrw::io::Cursor;

    use super::*;
    use crate::kontakt::monolith::MonolithFile;
    use crate::model::AudioMetadata;
    use crate::wav::build_pcm16_wav;
    use crate::{MemoryNotifier, TracingNotifier};

    fn pool_of(names_and_bytes: &[(&str, Vec<u8>)]) -> HashMap<String, Arc<MemorySample>> {
        let files: Vec<MonolithFile> = names_and_bytes
            .iter()
            .map(|(name, bytes)| MonolithFile {
                name: (*name).to_string(),
                bytes: bytes.clone(),
            })
            .collect();
        sample_pool(&Monolith { files })
    }

    #[test]
    fn substitution_matches_by_name_and_extension() {
        let wav = build_pcm16_wav(2, 44100, &vec![0u8; 4 * 10]);
        let pool = pool_of(&[("Piano C2.wav", wav)]);

        let mut multi = MultiSample::new("test");
        let mut group = Group::new("g");
        let mut zone = SampleZone::new("Piano C2");
        zone.sample = Some(SampleData::File {
            path: "Samples/Piano C2.wav".into(),
            metadata: None,
        });
        group.zones.push(zone);
        let mut missing = SampleZone::new("Missing");
        missing.sample = Some(SampleData::File {
            path: "Samples/Missing.wav".into(),
            metadata: None,
        });
        group.zones.push(missing);
        multi.groups.push(group);

        let notifier = MemoryNotifier::new();
        substitute_samples(&mut multi, &pool, &notifier);

        assert_eq!(multi.groups[0].zones.len(), 1, "missing zone dropped");
        match &multi.groups[0].zones[0].sample {
            Some(SampleData::Memory(mem)) => {
                assert_eq!(mem.name, "Piano C2.wav");
                assert_eq!(
                    mem.metadata,
                    AudioMetadata {
                        channels: 2,
                        sample_rate: 44100,
                        bits_per_sample: 16,
                        frame_count: 10,
                    }
                );
            }
            Some(SampleData::File { .. }) | None => panic!("expected in-memory sample"),
        }
        assert!(notifier
            .events()
            .iter()
            .any(|event| event.contains("Missing") && event.contains("NoMatchingInMemoryFile")));
    }

    #[test]
    fn file_container_roundtrip() {
        // an inner NKI with two zones, wrapped into a file container with
        // the two sample payloads
        let mut multi = MultiSample::new("Drums");
        let mut group = Group::new("Hits");
        for name in ["kick", "snare"] {
            let mut zone = SampleZone::new(name);
            zone.stop = 16;
            zone.sample = Some(SampleData::File {
                path: format!("Samples/{name}.wav").into(),
                metadata: Some(AudioMetadata {
                    channels: 1,
                    sample_rate: 44100,
                    bits_per_sample: 16,
                    frame_count: 16,
                }),
            });
            group.zones.push(zone);
        }
        multi.groups.push(group);

        let mut inner = Cursor::new(Vec::new());
        crate::kontakt::writer::write_nki(&multi, &mut inner).expect("write inner nki");

        let files = vec![
            MonolithFile {
                name: "Drums.nki".to_string(),
                bytes: inner.into_inner(),
            },
            MonolithFile {
                name: "kick.wav".to_string(),
                bytes: build_pcm16_wav(1, 44100, &vec![1u8; 32]),
            },
            MonolithFile {
                name: "snare.wav".to_string(),
                bytes: build_pcm16_wav(1, 44100, &vec![2u8; 32]),
            },
        ];
        let mut container = Cursor::new(Vec::new());
        monolith::write_monolith(&files, &mut container).expect("write monolith");
        container.set_position(0);

        let session = Session::new(Arc::new(TracingNotifier));
        let outcome =
            read_preset(&session, &mut container, "Drums.nki").expect("read monolith preset");
        assert_eq!(outcome.multi_samples.len(), 1);
        let zones = &outcome.multi_samples[0].groups[0].zones;
        assert_eq!(zones.len(), 2);
        for (zone, expected) in zones.iter().zip(["kick.wav", "snare.wav"]) {
            match &zone.sample {
                Some(SampleData::Memory(mem)) => {
                    assert_eq!(mem.name, expected);
                    assert_eq!(mem.metadata.frame_count, 16);
                    assert!(!mem.bytes.is_empty(), "payload held in memory");
                }
                Some(SampleData::File { .. }) | None => panic!("expected in-memory sample"),
            }
        }
    }

    #[test]
    fn classic_decode_keeps_monolith_samples() {
        // reuse the nki2 test fixtures indirectly: a plain (non-monolith)
        // classic file decodes to an empty multi-sample with metadata
        let zlib = vec![0x78u8, 0x9C, 0, 0];
        let mut cursor = Cursor::new(Vec::new());
        {
            use binrw::io::Write;
            use binrw::BinWrite;
            (zlib.len() as u32).write_le(&mut cursor).expect("len");
            cursor.write_all(&[0u8; 8]).expect("unused");
            cursor.write_all(&[1u8, 0, 1, 2]).expect("triplet");
            cursor.write_all(b"Kon3").expect("block id");
            0u32.write_le(&mut cursor).expect("timestamp");
            cursor.write_all(&[0u8; 26]).expect("unknown");
            0u32.write_le(&mut cursor).expect("icon");
            cursor.write_all(b"Someone\0").expect("author");
            cursor.write_all(&[0u8; 3]).expect("unknown");
            cursor.write_all(&[0u8; 86]).expect("website");
            cursor.write_all(&[0u8; 7]).expect("unknown");
            cursor.write_all(&[0u8; 4]).expect("unknown");
            1u32.write_le(&mut cursor).expect("patch level");
            cursor.write_all(&zlib).expect("zlib");
        }
        cursor.set_position(0);

        let session = Session::new(Arc::new(TracingNotifier));
        let outcome =
            read_preset(&session, &mut cursor, "Old Organ.nki").expect("read classic preset");
        assert_eq!(outcome.multi_samples.len(), 1);
        let multi = &outcome.multi_samples[0];
        assert_eq!(multi.name, "Old Organ");
        assert_eq!(multi.metadata.creator.as_deref(), Some("Someone"));
        assert_eq!(multi.metadata.category.as_deref(), Some("Organ"));
        assert!(multi.groups.is_empty());
    }
}
