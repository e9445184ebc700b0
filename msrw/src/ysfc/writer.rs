//! YSFC library write path.
//!
//! Chunks are serialized in a fixed order (EPFM, EWFM, EWIM, then the
//! matching data chunks, with the performance pair skipped for
//! waveform-only targets), the catalog is regenerated from the cumulative
//! chunk sizes, and entry offsets are recomputed to point at each data
//! item inside its data chunk. Entry ids restart at 10001: performance
//! ids first, then waveform and wave-image ids interleaved.

use binrw::io::{Seek, Write};
use itertools::Itertools;

use crate::model::{MultiSample, SampleData, SampleZone};
use crate::strings::write_fill;
use crate::wav::extract_pcm;
use crate::ysfc::category::prefixed_name;
use crate::ysfc::entry::EntryRecord;
use crate::ysfc::keybank::{
    db_to_level, fine_from_cents, stored_from_pan, write_key_banks, KeyBank,
};
use crate::ysfc::performance::{PerformanceData, PerformanceElement, PerformancePart};
use crate::ysfc::wavedata::{deinterleave_stereo, write_wave_data};
use crate::ysfc::{
    Workstation, YsfcChunk, YsfcItem, ID_DPFM, ID_DWFM, ID_DWIM, ID_EPFM, ID_EWFM, ID_EWIM,
    YSFC_MAGIC,
};
use crate::FormatError;

/// First entry id assigned on write.
const FIRST_ENTRY_ID: u32 = 10001;

/// Write `multis` as a YSFC library for `workstation`.
pub fn write_library<W: Write + Seek>(
    multis: &[MultiSample],
    workstation: Workstation,
    writer: &mut W,
) -> Result<(), FormatError> {
    let layout = workstation.key_bank_layout();

    // one waveform per group; a multi with several groups is split into
    // "name - group" waveforms that the reader folds back together
    struct WaveformUnit<'a> {
        entry_name: String,
        zones: Vec<&'a SampleZone>,
        multi_index: usize,
    }
    let mut units: Vec<WaveformUnit<'_>> = Vec::new();
    for (multi_index, multi) in multis.iter().enumerate() {
        let category = multi.metadata.category.as_deref();
        if multi.groups.len() <= 1 {
            units.push(WaveformUnit {
                entry_name: prefixed_name(category, &multi.name),
                zones: multi.zones().collect(),
                multi_index,
            });
        } else {
            for group in &multi.groups {
                units.push(WaveformUnit {
                    entry_name: prefixed_name(
                        category,
                        &format!("{} - {}", multi.name, group.name),
                    ),
                    zones: group.zones.iter().collect(),
                    multi_index,
                });
            }
        }
    }

    let mut wf_entries = Vec::with_capacity(units.len());
    let mut wf_payloads = Vec::with_capacity(units.len());
    let mut wi_entries = Vec::with_capacity(units.len());
    let mut wi_payloads = Vec::with_capacity(units.len());
    for unit in &units {
        let mut banks = Vec::new();
        let mut waves = Vec::new();
        for &zone in &unit.zones {
            let (bank, mut zone_waves) = bank_from_zone(zone)?;
            banks.push(bank);
            waves.append(&mut zone_waves);
        }
        wf_entries.push(EntryRecord::named(unit.entry_name.clone()));
        wf_payloads.push(write_key_banks(&banks, layout)?);
        wi_entries.push(EntryRecord::named(unit.entry_name.clone()));
        wi_payloads.push(write_wave_data(&waves)?);
    }

    let write_performances = workstation.writes_performances() && !multis.is_empty();
    let mut pf_entries = Vec::new();
    let mut pf_payloads = Vec::new();
    if write_performances {
        for (multi_index, multi) in multis.iter().enumerate() {
            // a part holds up to 8 elements, one per waveform of this multi
            let elements: Vec<PerformanceElement> = units
                .iter()
                .enumerate()
                .filter(|(_, unit)| unit.multi_index == multi_index)
                .take(8)
                .map(|(unit_index, _)| {
                    let mut element = PerformanceElement {
                        waveform_number: (unit_index + 1) as u16,
                        ..PerformanceElement::default()
                    };
                    if let Some(envelope) =
                        multi.zones().find_map(|zone| zone.amplitude_envelope)
                    {
                        element.set_amplitude_envelope(&envelope);
                    }
                    element
                })
                .collect();
            let data = PerformanceData {
                parts: vec![PerformancePart { elements }],
            };
            let mut entry = EntryRecord::named(prefixed_name(
                multi.metadata.category.as_deref(),
                &multi.name,
            ));
            entry.item_title = multi.name.clone();
            pf_entries.push(entry);
            pf_payloads.push(data.to_bytes()?);
        }
    }

    // entry ids: performances first, then waveform/wave-image interleaved
    let mut next_id = FIRST_ENTRY_ID;
    for entry in pf_entries
        .iter_mut()
        .chain(wf_entries.iter_mut().interleave(wi_entries.iter_mut()))
    {
        entry.specific_value = next_id;
        next_id += 1;
    }
    let max_entry_id = next_id.saturating_sub(1);

    let mut chunks = Vec::new();
    if write_performances {
        chunks.push(entry_chunk(ID_EPFM, pf_entries, &pf_payloads));
    }
    chunks.push(entry_chunk(ID_EWFM, wf_entries, &wf_payloads));
    chunks.push(entry_chunk(ID_EWIM, wi_entries, &wi_payloads));
    if write_performances {
        chunks.push(data_chunk(ID_DPFM, pf_payloads));
    }
    chunks.push(data_chunk(ID_DWFM, wf_payloads));
    chunks.push(data_chunk(ID_DWIM, wi_payloads));

    write_header_and_chunks(
        &chunks,
        workstation.version_string(),
        max_entry_id,
        writer,
    )
}

/// Bind entries to the data items they describe: `item_size` is the
/// payload length, `item_offset` points at the item's marker inside the
/// data chunk (whose first item sits 12 bytes in).
fn entry_chunk(id: crate::FourCC, mut entries: Vec<EntryRecord>, payloads: &[Vec<u8>]) -> YsfcChunk {
    let mut offset = 12u32;
    for (entry, payload) in entries.iter_mut().zip(payloads) {
        entry.item_size = payload.len() as u32;
        entry.item_offset = offset;
        offset += 8 + payload.len() as u32;
    }
    YsfcChunk {
        id,
        items: entries.into_iter().map(YsfcItem::Entry).collect(),
    }
}

fn data_chunk(id: crate::FourCC, payloads: Vec<Vec<u8>>) -> YsfcChunk {
    YsfcChunk {
        id,
        items: payloads.into_iter().map(YsfcItem::Data).collect(),
    }
}

/// Lay out header, catalog and chunks. The catalog is rebuilt from the
/// serialized chunk sizes; the chunk run starts right after it.
pub(crate) fn write_header_and_chunks<W: Write + Seek>(
    chunks: &[YsfcChunk],
    version: &str,
    max_entry_id: u32,
    writer: &mut W,
) -> Result<(), FormatError> {
    let blobs: Vec<(crate::FourCC, Vec<u8>)> = chunks
        .iter()
        .map(|chunk| Ok((chunk.id, chunk.to_bytes()?)))
        .collect::<Result<_, FormatError>>()?;
    let catalog_size = (blobs.len() * 8) as u32;

    // 64-byte header
    writer.write_all(YSFC_MAGIC)?;
    write_fill(writer, b' ', 5)?;
    let mut version_field = [0u8; 16];
    let version_bytes = version.as_bytes();
    version_field[..version_bytes.len().min(16)]
        .copy_from_slice(&version_bytes[..version_bytes.len().min(16)]);
    writer.write_all(&version_field)?;
    writer.write_all(&catalog_size.to_be_bytes())?;
    write_fill(writer, 0xFF, 12)?;
    writer.write_all(&0u32.to_be_bytes())?; // no cross-library block
    write_fill(writer, 0xFF, 8)?;
    writer.write_all(&max_entry_id.to_be_bytes())?;

    let mut offset = 64 + catalog_size;
    for (id, blob) in &blobs {
        writer.write_all(&id.0)?;
        writer.write_all(&offset.to_be_bytes())?;
        offset += blob.len() as u32;
    }
    for (_, blob) in &blobs {
        writer.write_all(blob)?;
    }
    Ok(())
}

fn bank_from_zone(zone: &SampleZone) -> Result<(KeyBank, Vec<Vec<u8>>), FormatError> {
    let metadata = zone
        .sample
        .as_ref()
        .and_then(SampleData::metadata)
        .unwrap_or_default();
    let pcm = match &zone.sample {
        Some(SampleData::Memory(mem)) => extract_pcm(mem.wav_bytes()?),
        Some(SampleData::File { .. }) | None => None,
    };
    let channels = pcm
        .as_ref()
        .map(|(format, _)| format.channels)
        .unwrap_or_else(|| metadata.channels.max(1))
        .clamp(1, 2) as u8;

    let waves = match (&pcm, channels) {
        (Some((_, frames)), 2) => {
            let (left, right) = deinterleave_stereo(frames);
            vec![left, right]
        }
        (Some((_, frames)), _) => vec![frames.clone()],
        (None, 2) => vec![Vec::new(), Vec::new()],
        (None, _) => vec![Vec::new()],
    };

    let coarse_offset = zone.tune.round();
    let rest_cents = (zone.tune - coarse_offset) * 100.0;
    let (loop_mode, loop_start, loop_end) = match zone.loops.first() {
        Some(sample_loop) => (0u8, sample_loop.start as u32, sample_loop.end as u32),
        None => (1u8, 0, 0),
    };

    let bank = KeyBank {
        key_range_lower: zone.key_low,
        key_range_upper: zone.key_high,
        vel_lower: zone.velocity_low,
        vel_upper: zone.velocity_high,
        level: db_to_level(zone.gain_db),
        pan: stored_from_pan(zone.pan),
        fixed_pitch: zone.key_tracking == 0.0,
        root_note: zone.key_root,
        coarse_tune: (64.0 + coarse_offset).clamp(0.0, 127.0) as u8,
        fine_tune: fine_from_cents(rest_cents),
        channels,
        loop_mode,
        loop_start,
        loop_end,
        sample_frequency: if metadata.sample_rate == 0 {
            44100
        } else {
            metadata.sample_rate
        },
        sample_length: metadata.frame_count as u32,
        ..KeyBank::default()
    };
    Ok((bank, waves))
}

#[allow(clippy::dbg_macro)]
#[cfg(test)]
mod test {
    use std::sync::Arc;

    use binrw::io::Cursor;

    use super::*;
    use crate::model::{
        AudioMetadata, Envelope, Group, LoopKind, MemorySample, SampleLoop,
    };
    use crate::wav::build_pcm16_wav;
    use crate::ysfc::keybank::KeyBankLayout;
    use crate::ysfc::YsfcHeader;
    use crate::{Session, TracingNotifier};

    fn memory_zone(name: &str, channels: u16, frames: usize) -> SampleZone {
        let pcm: Vec<u8> = (0..frames * usize::from(channels) * 2)
            .map(|i| i as u8)
            .collect();
        let mut zone = SampleZone::new(name);
        zone.stop = frames as u64;
        zone.sample = Some(SampleData::Memory(Arc::new(MemorySample {
            name: format!("{name}.wav"),
            metadata: AudioMetadata {
                channels,
                sample_rate: 44100,
                bits_per_sample: 16,
                frame_count: frames as u64,
            },
            bytes: build_pcm16_wav(channels, 44100, &pcm),
        })));
        zone
    }

    fn read_back(bytes: Vec<u8>, name: &str) -> crate::DecodeOutcome {
        let session = Session::new(Arc::new(TracingNotifier));
        crate::ysfc::read_library(&session, &mut Cursor::new(bytes), name)
            .expect("read written library")
    }

    #[test]
    fn montage_stereo_roundtrip() {
        // one waveform, one stereo key-bank: both halves equal length
        let mut multi = MultiSample::new("Grand");
        multi.metadata.category = Some("Acoustic".to_string());
        let mut group = Group::new("Grand");
        let mut zone = memory_zone("Grand", 2, 100);
        zone.key_low = 36;
        zone.key_high = 96;
        zone.key_root = 60;
        zone.loops.push(SampleLoop {
            kind: LoopKind::Forward,
            start: 16,
            end: 96,
            crossfade: 0,
        });
        group.zones.push(zone);
        multi.groups.push(group);

        let mut cursor = Cursor::new(Vec::new());
        write_library(&[multi], Workstation::Montage, &mut cursor).expect("write library");
        let bytes = cursor.into_inner();
        assert!(bytes.starts_with(b"YAMAHA-YSFC "));

        let outcome = read_back(bytes, "grand.X7U");
        assert_eq!(outcome.multi_samples.len(), 1);
        let back = &outcome.multi_samples[0];
        assert_eq!(back.name, "Grand");
        assert_eq!(back.metadata.category.as_deref(), Some("Acoustic"));
        assert_eq!(back.groups.len(), 1);
        assert_eq!(back.groups[0].zones.len(), 1, "equal halves interleave");
        let zone = &back.groups[0].zones[0];
        assert_eq!(zone.key_low, 36);
        assert_eq!(zone.key_high, 96);
        let metadata = zone.sample.as_ref().and_then(SampleData::metadata).expect("metadata");
        assert_eq!(metadata.channels, 2);
        assert_eq!(zone.loops.len(), 1);
        assert_eq!(zone.loops[0].start, 16);
        assert_eq!(zone.loops[0].end, 96);
        // a Montage performance wraps the waveform
        let performance = outcome.performance.expect("performance");
        assert_eq!(performance.slots.len(), 1);

        // P2: catalog offsets match the cumulative chunk sizes
        let written = {
            let mut cursor = Cursor::new(Vec::new());
            let back_multis: Vec<MultiSample> = outcome.multi_samples.clone();
            write_library(&back_multis, Workstation::Montage, &mut cursor).expect("rewrite");
            cursor.into_inner()
        };
        let header = YsfcHeader::read(&mut Cursor::new(&written[..])).expect("header");
        let mut expected = 64 + (header.catalog.len() * 8) as u32;
        for (index, (_, offset)) in header.catalog.iter().enumerate() {
            assert_eq!(*offset, expected, "catalog entry {index}");
            // chunk length field covers everything after id+length
            let at = expected as usize;
            let length = u32::from_be_bytes([
                written[at + 4],
                written[at + 5],
                written[at + 6],
                written[at + 7],
            ]);
            expected += 8 + length;
        }
        assert_eq!(expected as usize, written.len());
    }

    #[test]
    fn entry_ids_renumber_interleaved() {
        let multis = vec![
            MultiSample::new("One"),
            MultiSample::new("Two"),
        ];
        let mut cursor = Cursor::new(Vec::new());
        write_library(&multis, Workstation::Montage, &mut cursor).expect("write");
        let bytes = cursor.into_inner();

        let session = Session::new(Arc::new(TracingNotifier));
        let mut reader = Cursor::new(bytes);
        let header = YsfcHeader::read(&mut reader).expect("header");
        assert_eq!(header.max_entry_id, 10006);
        drop(session);

        // re-read through the chunk layer to inspect the assigned ids
        crate::strings::skip_bytes(&mut reader, u64::from(header.library_size)).expect("skip");
        let mut ids = Vec::new();
        while let Ok(chunk) = crate::ysfc::YsfcChunk::read(&mut reader) {
            for entry in chunk.entries() {
                ids.push(entry.specific_value);
            }
        }
        // performances 10001-10002, then wf/wi interleaved 10003..10006
        assert_eq!(ids, vec![10001, 10002, 10003, 10005, 10004, 10006]);
    }

    #[test]
    fn moxf_unequal_halves_become_mono_pair() {
        // hand-build a MOXF library whose stereo bank has unequal halves
        let bank = KeyBank {
            channels: 2,
            key_range_lower: 40,
            key_range_upper: 52,
            ..KeyBank::default()
        };
        let layout = KeyBankLayout::Version1 { moxf: true };
        let bank_payload = write_key_banks(&[bank], layout).expect("banks");
        let waves_payload =
            write_wave_data(&[vec![0u8; 100], vec![0u8; 60]]).expect("waves");

        let chunks = vec![
            entry_chunk(
                crate::ysfc::ID_EWFM,
                vec![EntryRecord::named("8:Uneven")],
                std::slice::from_ref(&bank_payload),
            ),
            entry_chunk(
                crate::ysfc::ID_EWIM,
                vec![EntryRecord::named("8:Uneven")],
                std::slice::from_ref(&waves_payload),
            ),
            data_chunk(crate::ysfc::ID_DWFM, vec![bank_payload]),
            data_chunk(crate::ysfc::ID_DWIM, vec![waves_payload]),
        ];
        let mut cursor = Cursor::new(Vec::new());
        write_header_and_chunks(&chunks, "1.0.3", 10004, &mut cursor).expect("write");

        let outcome = read_back(cursor.into_inner(), "uneven.X6W");
        assert!(outcome.performance.is_none(), "waveform-only library");
        let zones = &outcome.multi_samples[0].groups[0].zones;
        assert_eq!(zones.len(), 2, "unequal halves split into mono zones");
        assert_eq!(zones[0].pan, -1.0);
        assert_eq!(zones[1].pan, 1.0);
        for zone in zones {
            let metadata = zone.sample.as_ref().and_then(SampleData::metadata).expect("meta");
            assert_eq!(metadata.channels, 1);
        }
    }

    #[test]
    fn three_groups_eight_zones_each() {
        let mut multi = MultiSample::new("Big Kit");
        multi.metadata.category = Some("Drums".to_string());
        for group_index in 0..3 {
            let mut group = Group::new(format!("Group {group_index}"));
            for zone_index in 0..8 {
                let mut zone = memory_zone(
                    &format!("hit {group_index}-{zone_index}"),
                    1,
                    32,
                );
                zone.key_low = (36 + zone_index) as u8;
                zone.key_high = (36 + zone_index) as u8;
                group.zones.push(zone);
            }
            multi.groups.push(group);
        }

        let mut cursor = Cursor::new(Vec::new());
        write_library(&[multi], Workstation::Montage, &mut cursor).expect("write");
        let outcome = read_back(cursor.into_inner(), "kit.X7U");
        assert_eq!(outcome.multi_samples.len(), 1, "groups fold back together");
        let back = &outcome.multi_samples[0];
        assert_eq!(back.name, "Big Kit");
        assert_eq!(back.groups.len(), 3);
        for (index, group) in back.groups.iter().enumerate() {
            assert_eq!(group.name, format!("Group {index}"));
            assert_eq!(group.zones.len(), 8);
        }
        assert_eq!(back.zone_count(), 24);
        assert_eq!(back.metadata.category.as_deref(), Some("Drums"));
    }

    #[test]
    fn envelope_survives_via_performance() {
        let mut multi = MultiSample::new("Pad");
        let mut group = Group::new("Pad");
        let mut zone = memory_zone("Pad", 1, 64);
        zone.amplitude_envelope = Some(Envelope {
            attack: 0.5,
            decay: 2.5,
            sustain: 0.75,
            release: 10.0,
            ..Envelope::default()
        });
        group.zones.push(zone);
        multi.groups.push(group);

        let mut cursor = Cursor::new(Vec::new());
        write_library(&[multi], Workstation::Modx, &mut cursor).expect("write");
        let outcome = read_back(cursor.into_inner(), "pad.X8U");
        let performance = outcome.performance.expect("performance");
        let zone = &performance.slots[0].multi_sample.groups[0].zones[0];
        let envelope = zone.amplitude_envelope.expect("envelope");
        assert!((envelope.attack - 0.5).abs() < 0.05);
        assert!((envelope.sustain - 0.75).abs() < 0.01);
    }
}
