//! Canonical preset template backing the NKI write path.
//!
//! Writing is template based: the encoder parses these bytes, splices the
//! Program, group-list, zone-list and filename-table chunks in, and
//! re-serializes the container. Everything else (sound-info, script,
//! save-settings, quick-browse, insert-bus payloads) rides through
//! verbatim, which is what keeps the output loadable. The template mirrors
//! a Kontakt 6.8.0 preset (program chunk version 0xAE).

use binrw::BinResult;

use crate::kontakt::chunk::{id, ChunkPayload, PresetChunk, StructureData};
use crate::kontakt::container::{
    AuthoringApplication, NiChunkPayload, NiChunkType, NiContainerItem, NiDataChunk,
};
use crate::kontakt::filelist::FileList;
use crate::kontakt::program::ProgramData;

/// Program chunk version the template carries (Kontakt 6.8.0).
pub const TEMPLATE_PROGRAM_VERSION: u16 = 0xAE;
/// Group chunk version written into group-list entries.
pub const TEMPLATE_GROUP_VERSION: u16 = 0x9C;
/// Zone chunk version written into zone-list entries.
pub const TEMPLATE_ZONE_VERSION: u16 = 0x98;

/// Kontakt version string recorded in the authoring-application chunk.
const TEMPLATE_APP_VERSION: &str = "6.8.0";

/// Fixed UUID of generated containers.
const TEMPLATE_UUID: [u8; 16] = [
    0x6D, 0x73, 0x72, 0x77, 0x2D, 0x6E, 0x6B, 0x69, 0x2D, 0x74, 0x65, 0x6D, 0x70, 0x6C, 0x61,
    0x74,
];

// Opaque payloads captured from a freshly saved empty instrument; the
// writer must never interpret or regenerate these.
const SCRIPT_PAYLOAD: [u8; 6] = [0x00, 0x01, 0x00, 0x00, 0x00, 0x00];
pub(crate) const SAVE_SETTINGS_BYTES: [u8; 8] = [0x00, 0x50, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00];
const QUICK_BROWSE_PAYLOAD: [u8; 5] = [0x00, 0x00, 0x00, 0x00, 0x00];
const INSERT_BUS_PAYLOAD: [u8; 10] = [0x00, 0x10, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];
const SOUNDINFO_PAYLOAD: [u8; 12] = [
    0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];

fn opaque(chunk_id: u16, bytes: &[u8]) -> PresetChunk {
    PresetChunk {
        id: chunk_id,
        payload: ChunkPayload::Opaque(bytes.to_vec()),
    }
}

/// The template's preset chunk tree: one empty program with the ambient
/// chunks Kontakt expects around it.
pub fn default_preset_tree() -> BinResult<Vec<PresetChunk>> {
    let program = ProgramData::default();
    Ok(vec![PresetChunk {
        id: id::PROGRAM,
        payload: ChunkPayload::Structured(StructureData {
            version: TEMPLATE_PROGRAM_VERSION,
            private_data: Vec::new(),
            public_data: program.to_bytes()?,
            children: vec![
                PresetChunk {
                    id: id::GROUP_LIST,
                    payload: ChunkPayload::List(Vec::new()),
                },
                PresetChunk {
                    id: id::ZONE_LIST,
                    payload: ChunkPayload::List(Vec::new()),
                },
                PresetChunk {
                    id: id::FILENAME_LIST_EX,
                    payload: ChunkPayload::Structured(StructureData {
                        version: 0,
                        private_data: Vec::new(),
                        public_data: FileList::from_paths(Vec::new()).to_bytes()?,
                        children: Vec::new(),
                    }),
                },
                opaque(id::PAR_SCRIPT, &SCRIPT_PAYLOAD),
                opaque(id::INSERT_BUS, &INSERT_BUS_PAYLOAD),
                opaque(id::SAVE_SETTINGS, &SAVE_SETTINGS_BYTES),
                opaque(id::QUICK_BROWSE, &QUICK_BROWSE_PAYLOAD),
            ],
        }),
    }])
}

/// The template container around [`default_preset_tree`].
pub fn default_container() -> BinResult<NiContainerItem> {
    let mut tree_bytes = binrw::io::Cursor::new(Vec::new());
    for chunk in default_preset_tree()? {
        chunk.write(&mut tree_bytes)?;
    }
    Ok(NiContainerItem {
        header_version: 1,
        unused: 0,
        flags: 0,
        uuid: TEMPLATE_UUID,
        chunks: vec![
            NiDataChunk {
                chunk_type: NiChunkType::AuthoringApplication.into(),
                payload: NiChunkPayload::AuthoringApplication {
                    application: AuthoringApplication::Kontakt.into(),
                    version: TEMPLATE_APP_VERSION.to_string(),
                },
            },
            NiDataChunk {
                chunk_type: NiChunkType::PresetChunkItem.into(),
                payload: NiChunkPayload::PresetChunkItem {
                    bytes: tree_bytes.into_inner(),
                },
            },
            NiDataChunk {
                chunk_type: NiChunkType::SoundinfoItem.into(),
                payload: NiChunkPayload::SoundinfoItem {
                    bytes: SOUNDINFO_PAYLOAD.to_vec(),
                },
            },
            NiDataChunk {
                chunk_type: NiChunkType::Terminator.into(),
                payload: NiChunkPayload::Raw { bytes: Vec::new() },
            },
        ],
        item_version: 1,
        children: Vec::new(),
    })
}

/// The template as raw bytes, the shape the writer actually consumes.
pub fn template_bytes() -> BinResult<Vec<u8>> {
    default_container()?.to_bytes()
}

#[allow(clippy::dbg_macro)]
#[cfg(test)]
mod test {
    use binrw::io::Cursor;

    use super::*;

    #[test]
    fn template_parses_as_container() {
        let bytes = template_bytes().expect("template bytes");
        let item = NiContainerItem::read(&mut Cursor::new(&bytes[..])).expect("parse template");
        let (app, version) = item.authoring_application().expect("authoring app");
        assert_eq!(app, AuthoringApplication::Kontakt);
        assert_eq!(version, "6.8.0");
        assert!(item.find(NiChunkType::PresetChunkItem).is_some());
    }

    #[test]
    fn template_tree_has_empty_program() {
        let tree = default_preset_tree().expect("tree");
        assert_eq!(tree.len(), 1);
        let program = tree[0].structure().expect("program structure");
        assert_eq!(program.version, TEMPLATE_PROGRAM_VERSION);
        assert_eq!(
            program.find_child(id::GROUP_LIST).expect("group list").entries().map(<[_]>::len),
            Some(0)
        );
        assert!(program.find_child(id::SAVE_SETTINGS).is_some());
    }
}
