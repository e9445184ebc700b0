//! Template-based Kontakt 5+ write path.
//!
//! The encoder never builds a container from first principles: it parses
//! the embedded template, replaces the Program public data, the group and
//! zone lists and the filename table, and re-serializes. Chunks it does
//! not understand keep their template bytes, so the output stays loadable
//! even where the format is only partially mapped.

use binrw::io::{Cursor, Seek, Write};
use tracing::instrument;

use crate::kontakt::chunk::{id, ChunkPayload, ListEntry, PresetChunk, StructureData};
use crate::kontakt::container::{NiChunkPayload, NiContainerItem};
use crate::kontakt::filelist::FileList;
use crate::kontakt::modulator::InternalModulator;
use crate::kontakt::program::{
    write_loop_array, GroupData, LoopRecord, ProgramData, ZoneData, ZoneSampleInfo,
};
use crate::kontakt::template::{
    template_bytes, TEMPLATE_GROUP_VERSION, TEMPLATE_ZONE_VERSION,
};
use crate::model::{db_to_value, Envelope, MultiSample, SampleData, SampleZone};
use crate::FormatError;

/// Write `multi` as a Kontakt 5+ NKI container.
#[instrument(skip(multi, writer))]
pub fn write_nki<W: Write + Seek>(
    multi: &MultiSample,
    writer: &mut W,
) -> Result<(), FormatError> {
    let template = template_bytes()?;
    let mut item = NiContainerItem::read(&mut Cursor::new(&template[..]))?;

    let mut spliced = false;
    for chunk in &mut item.chunks {
        if let NiChunkPayload::PresetChunkItem { bytes } = &mut chunk.payload {
            let mut chunks = PresetChunk::read_all(bytes)?;
            splice_multi_sample(&mut chunks, multi)?;
            let mut cursor = Cursor::new(Vec::new());
            for chunk in &chunks {
                chunk.write(&mut cursor)?;
            }
            *bytes = cursor.into_inner();
            spliced = true;
        }
    }
    if !spliced {
        return Err(FormatError::Parse {
            pos: None,
            message: "template container lacks a preset chunk".to_string(),
        });
    }
    item.write(writer)?;
    Ok(())
}

/// Replace the canonical chunks of the template tree with the model's
/// content; every other chunk keeps its bytes.
fn splice_multi_sample(
    chunks: &mut [PresetChunk],
    multi: &MultiSample,
) -> Result<(), FormatError> {
    let program_chunk = chunks
        .iter_mut()
        .find(|chunk| chunk.id == id::PROGRAM)
        .ok_or_else(|| FormatError::Parse {
            pos: None,
            message: "template tree lacks a program chunk".to_string(),
        })?;
    let structure = program_chunk
        .structure_mut()
        .ok_or_else(|| FormatError::Parse {
            pos: None,
            message: "template program chunk is not structured".to_string(),
        })?;

    // program: parse the template's fields, overlay the model's metadata,
    // keep the version-specific trailing bytes untouched
    let mut program = ProgramData::parse(structure.version, &structure.public_data)?;
    program.name = multi.name.clone();
    program.author = multi.metadata.creator.clone();
    program.credits = multi.metadata.description.clone();
    structure.public_data = program.to_bytes()?;

    let mut file_list = FileList::from_paths(Vec::new());
    let mut group_entries = Vec::new();
    let mut zone_entries = Vec::new();
    for (group_index, group) in multi.groups.iter().enumerate() {
        let data = GroupData::from_model(group);
        // the amplitude envelope is group-scoped in Kontakt; the model
        // stores it per zone, so the first zone speaks for the group
        let children = match group.zones.first().and_then(|zone| zone.amplitude_envelope) {
            Some(envelope) => vec![envelope_parameter_array(&envelope)?],
            None => Vec::new(),
        };
        group_entries.push(ListEntry {
            reference: None,
            structure: StructureData {
                version: TEMPLATE_GROUP_VERSION,
                private_data: Vec::new(),
                public_data: data.to_bytes()?,
                children,
            },
        });
        for zone in &group.zones {
            zone_entries.push(zone_entry(zone, group_index, &mut file_list)?);
        }
    }

    replace_child(
        structure,
        id::GROUP_LIST,
        ChunkPayload::List(group_entries),
    )?;
    replace_child(structure, id::ZONE_LIST, ChunkPayload::List(zone_entries))?;

    let file_list_bytes = file_list.to_bytes()?;
    let table = structure
        .find_child_mut(id::FILENAME_LIST_EX)
        .ok_or_else(|| FormatError::Parse {
            pos: None,
            message: "template tree lacks a filename table".to_string(),
        })?;
    match table.structure_mut() {
        Some(table_structure) => table_structure.public_data = file_list_bytes,
        None => {
            return Err(FormatError::Parse {
                pos: None,
                message: "template filename table is not structured".to_string(),
            })
        }
    }
    Ok(())
}

fn replace_child(
    structure: &mut StructureData,
    child_id: u16,
    payload: ChunkPayload,
) -> Result<(), FormatError> {
    let child = structure
        .find_child_mut(child_id)
        .ok_or_else(|| FormatError::Parse {
            pos: None,
            message: format!("template tree lacks chunk {child_id:#04X}"),
        })?;
    child.payload = payload;
    Ok(())
}

fn envelope_parameter_array(envelope: &Envelope) -> Result<PresetChunk, FormatError> {
    let modulator = InternalModulator::volume_ahdsr(
        (envelope.attack * 1000.0) as f32,
        (envelope.hold * 1000.0) as f32,
        (envelope.decay * 1000.0) as f32,
        envelope.sustain as f32,
        (envelope.release * 1000.0) as f32,
    );
    let mut slots: Vec<Option<PresetChunk>> = vec![None; 16];
    slots[0] = Some(PresetChunk {
        id: id::PAR_INTERNAL_MOD,
        payload: ChunkPayload::Structured(StructureData {
            version: modulator.version,
            private_data: Vec::new(),
            public_data: modulator.to_bytes()?,
            children: Vec::new(),
        }),
    });
    Ok(PresetChunk {
        id: id::PARAMETER_ARRAY_16,
        payload: ChunkPayload::Array16(slots),
    })
}

fn zone_entry(
    zone: &SampleZone,
    group_index: usize,
    file_list: &mut FileList,
) -> Result<ListEntry, FormatError> {
    let mut data = ZoneData {
        sample_start: zone.start as u32,
        sample_end: zone.stop as u32,
        start_mod_range: 0,
        low_velocity: u16::from(zone.velocity_low),
        high_velocity: u16::from(zone.velocity_high),
        low_key: u16::from(zone.key_low),
        high_key: u16::from(zone.key_high),
        fade_low_velocity: zone.velocity_fade_low,
        fade_high_velocity: zone.velocity_fade_high,
        fade_low_key: zone.key_fade_low,
        fade_high_key: zone.key_fade_high,
        root_key: u16::from(zone.key_root),
        volume: db_to_value(zone.gain_db) as f32,
        pan: zone.pan as f32,
        tune: 2.0_f64.powf(zone.tune / 12.0) as f32,
        extra: None,
        sample: None,
    };

    if let Some(sample) = &zone.sample {
        let path = match sample {
            SampleData::File { path, .. } => path.to_string_lossy().replace('\\', "/"),
            SampleData::Memory(mem) => mem.name.clone(),
        };
        let metadata = sample.metadata().unwrap_or_default();
        data.sample = Some(ZoneSampleInfo {
            filename_id: file_list.index_of_or_insert(&path),
            sample_data_type: if metadata.bits_per_sample == 24 { 3 } else { 2 },
            sample_rate: metadata.sample_rate,
            num_channels: metadata.channels.min(255) as u8,
            num_frames: metadata.frame_count as u32,
            legacy: None,
            unknown: 0,
            root_note: u32::from(zone.key_root),
            tuning: 0.0,
            tail_flag: 0,
            tail: 0,
        });
    }

    let children = if zone.loops.is_empty() {
        Vec::new()
    } else {
        let records: Vec<LoopRecord> = zone.loops.iter().map(LoopRecord::from_model).collect();
        vec![PresetChunk {
            id: id::LOOP_ARRAY,
            payload: ChunkPayload::Structured(StructureData {
                version: 0,
                private_data: Vec::new(),
                public_data: write_loop_array(&records)?,
                children: Vec::new(),
            }),
        }]
    };

    Ok(ListEntry {
        reference: Some(group_index as u32),
        structure: StructureData {
            version: TEMPLATE_ZONE_VERSION,
            private_data: Vec::new(),
            public_data: data.to_bytes(TEMPLATE_ZONE_VERSION)?,
            children,
        },
    })
}
