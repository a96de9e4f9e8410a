//! Self-contained wordlist codec.
//!
//! One word per byte, eight words per ID, `-` separated with a `--` break
//! between the two four-word halves. The table replaces the external
//! mnemonicode wordlist the original format used; words contain neither
//! `.` nor `-`, so encoded IDs are unambiguous to the auto-detector.

use crate::{Fluid, FluidError};

const WORDS: [&str; 256] = [
    "acid", "aqua", "arch", "atom", "axis", "bald", "barn", "bass",
    "bead", "bell", "bird", "blue", "boat", "bold", "bone", "book",
    "born", "brew", "brim", "bulk", "buzz", "cake", "calm", "camp",
    "cape", "card", "cave", "chef", "chip", "city", "clay", "club",
    "coal", "coat", "code", "coil", "cold", "cone", "cork", "corn",
    "crab", "crew", "crop", "cube", "curl", "dark", "dart", "dawn",
    "deck", "deep", "deer", "dial", "dice", "dime", "dirt", "dish",
    "dock", "dome", "door", "dose", "dove", "drum", "duck", "dune",
    "dusk", "dust", "earl", "east", "echo", "edge", "envy", "epic",
    "exam", "face", "fact", "fame", "farm", "fast", "fern", "file",
    "film", "fire", "fish", "five", "flag", "flat", "flax", "flow",
    "foam", "fold", "font", "fork", "fort", "foul", "four", "frog",
    "fuel", "full", "fund", "gate", "gaze", "gear", "gift", "glad",
    "glen", "glow", "glue", "goat", "gold", "golf", "gong", "gown",
    "grab", "gray", "grid", "grim", "grip", "gulf", "gust", "hail",
    "hall", "hand", "harp", "hawk", "haze", "heat", "herb", "hero",
    "hill", "hint", "hive", "hold", "home", "hood", "hook", "horn",
    "host", "hour", "husk", "icon", "inch", "iris", "iron", "item",
    "jade", "jazz", "jeep", "jest", "jolt", "judo", "june", "junk",
    "jury", "kale", "keel", "keen", "kelp", "kick", "kiln", "kind",
    "king", "kite", "knee", "knot", "lace", "lake", "lamb", "lamp",
    "land", "lark", "lava", "lawn", "leaf", "lens", "lime", "lion",
    "loaf", "lock", "loft", "logo", "lone", "loop", "lord", "luck",
    "lung", "lynx", "mace", "mail", "malt", "mast", "math", "maze",
    "mead", "mesa", "mesh", "mild", "milk", "mill", "mint", "mist",
    "moat", "mole", "moon", "moss", "moth", "myth", "nail", "navy",
    "neat", "nest", "news", "node", "noon", "nose", "note", "oath",
    "okra", "onyx", "opal", "open", "oval", "oven", "palm", "park",
    "peak", "pear", "peat", "pine", "pink", "pipe", "plum", "pond",
    "pony", "pool", "port", "rain", "ramp", "reef", "rice", "ring",
    "road", "rock", "root", "rose", "ruby", "rust", "sage", "sail",
    "salt", "sand", "seal", "seed", "silk", "snow", "star", "wolf",
];

pub(crate) fn encode(fluid: Fluid) -> String {
    let bytes = fluid.to_be_bytes();
    let word = |b: u8| WORDS[b as usize];
    format!(
        "{}-{}-{}-{}--{}-{}-{}-{}",
        word(bytes[0]),
        word(bytes[1]),
        word(bytes[2]),
        word(bytes[3]),
        word(bytes[4]),
        word(bytes[5]),
        word(bytes[6]),
        word(bytes[7]),
    )
}

pub(crate) fn decode(s: &str) -> Result<Fluid, FluidError> {
    let words: Vec<&str> = s.split('-').filter(|w| !w.is_empty()).collect();
    if words.len() != 8 {
        return Err(FluidError::Decode);
    }
    let mut fluid: u64 = 0;
    for word in words {
        let byte = WORDS
            .iter()
            .position(|&w| w == word)
            .ok_or(FluidError::Decode)?;
        fluid = (fluid << 8) | byte as u64;
    }
    Ok(fluid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_is_well_formed() {
        let mut seen = std::collections::HashSet::new();
        for word in WORDS {
            assert!(!word.is_empty());
            assert!(!word.contains('-') && !word.contains('.'));
            assert!(seen.insert(word), "duplicate word {word}");
        }
    }

    #[test]
    fn roundtrip() {
        for fluid in [0u64, 1, 0xff, 0x0102_0304_0506_0708, u64::MAX] {
            assert_eq!(decode(&encode(fluid)).unwrap(), fluid);
        }
    }

    #[test]
    fn unknown_word_rejected() {
        assert!(decode("zzzz-acid-acid-acid--acid-acid-acid-acid").is_err());
        assert!(decode("acid-acid-acid--acid-acid-acid-acid").is_err());
    }
}
