//! YSFC instrument category tables.
//!
//! Two hard-coded lookups: a 16-bit main-category mask (first set bit wins
//! on read) and a dense sub-category table of main*16+sub slots where
//! slot 8 of every block reads "No Assign". Waveform entry names commonly
//! carry the sub-category value as an `"N:name"` prefix.

/// Main categories by mask bit, lowest bit first.
pub const MAIN_CATEGORIES: [(u16, &str); 16] = [
    (0x0001, "Piano"),
    (0x0002, "Keyboard"),
    (0x0004, "Organ"),
    (0x0008, "Guitar"),
    (0x0010, "Bass"),
    (0x0020, "Strings"),
    (0x0040, "Brass"),
    (0x0080, "Woodwind"),
    (0x0100, "Syn Lead"),
    (0x0200, "Pad/Choir"),
    (0x0400, "Syn Comp"),
    (0x0800, "Chromatic Perc"),
    (0x1000, "Drum/Perc"),
    (0x2000, "Sound FX"),
    (0x4000, "Musical FX"),
    (0x8000, "Ethnic"),
];

const NO_ASSIGN: &str = "No Assign";

/// Sub-category tags per main category, eight named slots each; the
/// remaining slots of every block read "No Assign".
const SUB_CATEGORIES: [[&str; 8]; 16] = [
    ["Acoustic", "Layer", "Modern", "Vintage", "Rock", "Arpeggio", "Synth Piano", "Other"],
    ["Electric Piano", "FM Piano", "Clavi", "Synth", "Harpsichord", "Celesta", "Accordion", "Other"],
    ["Tone Wheel", "Combo", "Pipe", "Synth Organ", "Theater", "Transistor", "Harmonium", "Other"],
    ["Acoustic", "Electric Clean", "Distortion", "Nylon", "12 String", "Pedal Steel", "Muted", "Other"],
    ["Acoustic", "Electric", "Fretless", "Slap", "Synth Bass", "Upright", "Sub Bass", "Other"],
    ["Solo Violin", "Ensemble", "Pizzicato", "Synth Strings", "Cello", "Viola", "Contrabass", "Other"],
    ["Solo Brass", "Ensemble", "Trumpet", "Trombone", "French Horn", "Tuba", "Synth Brass", "Other"],
    ["Flute", "Saxophone", "Clarinet", "Oboe", "Bassoon", "Recorder", "Pan Flute", "Other"],
    ["Analog", "Digital", "Hip Hop", "Dance", "Hard", "Soft", "Retro", "Other"],
    ["Warm", "Bright", "Choir", "Vocoder", "Breath", "Sweep", "Dark", "Other"],
    ["Brass", "Analog", "Digital", "Decay", "Hook", "Plucked", "Bell Pad", "Other"],
    ["Mallet", "Bell", "Vibraphone", "Marimba", "Xylophone", "Glockenspiel", "Music Box", "Other"],
    ["Drums", "Percussion", "Kick", "Snare", "Cymbal", "Electronic Kit", "Ethnic Perc", "Other"],
    ["Nature", "Mechanical", "Ambient", "Noise", "Hit", "Scratch", "Motion", "Other"],
    ["Riser", "Impact", "Transition", "Stab", "Texture", "Gate", "Glitch", "Other"],
    ["Bowed", "Plucked", "Struck", "Blown", "Asia", "Africa", "Europe", "Other"],
];

/// Name of the first set bit of a main-category mask.
pub fn main_category_name(mask: u16) -> Option<&'static str> {
    MAIN_CATEGORIES
        .iter()
        .find(|(bit, _)| mask & bit != 0)
        .map(|(_, name)| *name)
}

/// Mask bit for a main-category name.
pub fn main_category_mask(name: &str) -> Option<u16> {
    MAIN_CATEGORIES
        .iter()
        .find(|(_, candidate)| candidate.eq_ignore_ascii_case(name))
        .map(|(bit, _)| *bit)
}

/// Tag for a dense sub-category value.
pub fn sub_category_name(value: u16) -> &'static str {
    let main = (value / 16) as usize;
    let sub = (value % 16) as usize;
    if main >= SUB_CATEGORIES.len() || sub >= 8 {
        return NO_ASSIGN;
    }
    SUB_CATEGORIES[main][sub]
}

/// Dense value for a sub-category tag. Ambiguous tags ("Other",
/// "Acoustic") resolve to their first block.
pub fn sub_category_value(name: &str) -> Option<u16> {
    for (main, block) in SUB_CATEGORIES.iter().enumerate() {
        for (sub, candidate) in block.iter().enumerate() {
            if candidate.eq_ignore_ascii_case(name) {
                return Some((main * 16 + sub) as u16);
            }
        }
    }
    None
}

/// The main category owning a dense sub-category value.
pub fn main_category_of_value(value: u16) -> Option<&'static str> {
    let main = (value / 16) as usize;
    MAIN_CATEGORIES.get(main).map(|(_, name)| *name)
}

/// Split a `"N:name"` entry name into its category value and clean name.
pub fn split_category_prefix(name: &str) -> (Option<u16>, &str) {
    if let Some((prefix, rest)) = name.split_once(':') {
        if let Ok(value) = prefix.parse::<u16>() {
            return (Some(value), rest);
        }
    }
    (None, name)
}

/// Build the `"N:name"` form for a category string, falling back to the
/// "No Assign" slot of the first block.
pub fn prefixed_name(category: Option<&str>, name: &str) -> String {
    let value = category
        .and_then(sub_category_value)
        .or_else(|| category.and_then(category_value_for_main))
        .unwrap_or(8);
    format!("{value}:{name}")
}

fn category_value_for_main(name: &str) -> Option<u16> {
    MAIN_CATEGORIES
        .iter()
        .position(|(_, candidate)| candidate.eq_ignore_ascii_case(name))
        .map(|main| (main * 16) as u16)
}

/// Guess a category from free text (instrument name, path parts) by
/// scanning for known tags, longest match first.
pub fn infer_category(texts: &[&str]) -> Option<String> {
    let mut vocabulary: Vec<&'static str> = MAIN_CATEGORIES.iter().map(|(_, n)| *n).collect();
    vocabulary.extend(
        SUB_CATEGORIES
            .iter()
            .flatten()
            .copied()
            .filter(|tag| *tag != "Other"),
    );
    vocabulary.sort_by_key(|tag| core::cmp::Reverse(tag.len()));
    for text in texts {
        let lower = text.to_ascii_lowercase();
        for tag in &vocabulary {
            if lower.contains(&tag.to_ascii_lowercase()) {
                return Some((*tag).to_string());
            }
        }
    }
    None
}

#[allow(clippy::dbg_macro)]
#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn main_mask_first_bit_wins() {
        assert_eq!(main_category_name(0x0001), Some("Piano"));
        assert_eq!(main_category_name(0x0005), Some("Piano"));
        assert_eq!(main_category_name(0x8000), Some("Ethnic"));
        assert_eq!(main_category_name(0), None);
        assert_eq!(main_category_mask("Drum/Perc"), Some(0x1000));
    }

    #[test]
    fn no_assign_slots() {
        for value in (8..=248).step_by(16) {
            assert_eq!(sub_category_name(value), "No Assign", "value {value}");
        }
        assert_eq!(sub_category_name(256), "No Assign");
    }

    #[test]
    fn sub_category_roundtrip() {
        let value = sub_category_value("Tone Wheel").expect("organ sub category");
        assert_eq!(value, 32);
        assert_eq!(sub_category_name(value), "Tone Wheel");
        assert_eq!(main_category_of_value(value), Some("Organ"));
    }

    #[test]
    fn name_prefix() {
        assert_eq!(split_category_prefix("32:Jazz Organ"), (Some(32), "Jazz Organ"));
        assert_eq!(split_category_prefix("Plain"), (None, "Plain"));
        assert_eq!(prefixed_name(Some("Tone Wheel"), "Jazz Organ"), "32:Jazz Organ");
        assert_eq!(prefixed_name(None, "Thing"), "8:Thing");
    }

    #[test]
    fn inference_scans_names_and_paths() {
        assert_eq!(
            infer_category(&["Warm Strings Ensemble"]),
            Some("Ensemble".to_string())
        );
        assert_eq!(
            infer_category(&["untitled", "Content/Organ/foo"]),
            Some("Organ".to_string())
        );
        assert_eq!(infer_category(&["zzz"]), None);
    }
}
