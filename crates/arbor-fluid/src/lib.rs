#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **arbor-fluid** – Locally-unique 64-bit IDs.
//!
//! A FLUID packs `[timestamp: 40 bits ms | generator id: 14 bits | seq: 10
//! bits]`. Within one generator successive IDs are strictly increasing, at
//! up to 1024 IDs per millisecond; the generator briefly busy-waits when a
//! millisecond's sequence space is exhausted.
//!
//! Four string forms round-trip bit-exactly: dotted hex (`xxxx.xxxx.xxxx.xxxx`),
//! a dash-separated wordlist form, f58 (base58 with a `ƒ`/`f` prefix), and
//! plain integers (decimal or `0x`-hex).

mod codec;
mod jobkey;
mod words;

pub use codec::{detect_string_type, StringType};
pub use jobkey::{job_guest_key, job_key};

use std::time::Instant;

/// A locally-unique 64-bit identifier.
pub type Fluid = u64;

const BITS_PER_TS: u32 = 40;
const BITS_PER_ID: u32 = 14;
const BITS_PER_SEQ: u32 = 10;

/// Errors from generation and string codecs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FluidError {
    /// Generator id does not fit in 14 bits.
    #[error("generator id out of range")]
    IdRange,
    /// The 40-bit timestamp space is exhausted.
    #[error("timestamp out of range")]
    TimestampRange,
    /// String form did not decode, or decoded to an invalid FLUID.
    #[error("invalid encoding")]
    Decode,
}

//─────────────────────────────
//  Generator
//─────────────────────────────

/// Per-process FLUID generator state.
#[derive(Debug)]
pub struct Generator {
    id: u16,
    seq: u16,
    clock_zero: Instant,
    clock_offset: u64,
    timestamp: u64,
}

impl Generator {
    /// Initialize generator `id` with a starting `timestamp` (ms).
    ///
    /// The monotonic clock baseline is captured here; subsequent IDs embed
    /// `elapsed + timestamp`.
    pub fn new(id: u32, timestamp: u64) -> Result<Self, FluidError> {
        if id >= 1 << BITS_PER_ID {
            return Err(FluidError::IdRange);
        }
        Ok(Self {
            id: id as u16,
            seq: 0,
            clock_zero: Instant::now(),
            clock_offset: timestamp,
            timestamp,
        })
    }

    fn update_timestamp(&mut self) -> Result<(), FluidError> {
        let clock = self.clock_zero.elapsed().as_millis() as u64;
        let timestamp = clock + self.clock_offset;
        if timestamp >= 1 << BITS_PER_TS {
            // (unlikely) lifetime of the FLUID sequence is over
            return Err(FluidError::TimestampRange);
        }
        if timestamp > self.timestamp {
            self.seq = 0;
            self.timestamp = timestamp;
        }
        Ok(())
    }

    /// Update and retrieve the internal timestamp.
    pub fn save_timestamp(&mut self) -> Result<u64, FluidError> {
        self.update_timestamp()?;
        Ok(self.timestamp)
    }

    /// Generate the next ID.
    ///
    /// If sequence bits were exhausted within the current millisecond,
    /// busy-waits until the clock advances; the wait is bounded by the
    /// timestamp quantum (1 ms).
    pub fn generate(&mut self) -> Result<Fluid, FluidError> {
        loop {
            self.update_timestamp()?;
            if u32::from(self.seq) + 1 < 1 << BITS_PER_SEQ {
                break;
            }
            std::hint::spin_loop();
        }
        let fluid = (self.timestamp << (BITS_PER_SEQ + BITS_PER_ID))
            | (u64::from(self.id) << BITS_PER_SEQ)
            | u64::from(self.seq);
        self.seq += 1;
        Ok(fluid)
    }
}

/// Extract the embedded millisecond timestamp.
pub fn timestamp_of(fluid: Fluid) -> u64 {
    fluid >> (BITS_PER_SEQ + BITS_PER_ID)
}

pub(crate) fn validate(fluid: Fluid) -> Result<Fluid, FluidError> {
    let ts = fluid >> (BITS_PER_SEQ + BITS_PER_ID);
    if ts >= 1 << BITS_PER_TS {
        return Err(FluidError::Decode);
    }
    // id and seq cannot exceed their field widths by construction
    Ok(fluid)
}

/// Encode `fluid` as the given string type.
pub fn encode(fluid: Fluid, typ: StringType) -> String {
    codec::encode(fluid, typ)
}

/// Decode a string of known type.
pub fn decode(s: &str, typ: StringType) -> Result<Fluid, FluidError> {
    codec::decode(s, typ)
}

/// Decode a string by auto-detecting its encoding.
///
/// Precedence: dotted hex (contains `.`), wordlist (contains `-`), f58
/// prefix, then integer (decimal or `0x`-hex).
pub fn parse(s: &str) -> Result<Fluid, FluidError> {
    codec::parse(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_strictly_increase() {
        let mut gen = Generator::new(0, 0).unwrap();
        let mut last = gen.generate().unwrap();
        for _ in 0..4096 {
            let next = gen.generate().unwrap();
            assert!(next > last, "{next} <= {last}");
            last = next;
        }
    }

    #[test]
    fn id_field_is_embedded() {
        let mut gen = Generator::new(12345, 0).unwrap();
        let fluid = gen.generate().unwrap();
        assert_eq!((fluid >> 10) & 0x3fff, 12345);
    }

    #[test]
    fn starting_timestamp_is_honored() {
        let mut gen = Generator::new(1, 100_000).unwrap();
        let fluid = gen.generate().unwrap();
        assert!(timestamp_of(fluid) >= 100_000);
    }

    #[test]
    fn generator_id_range_checked() {
        assert!(Generator::new(16383, 0).is_ok());
        assert_eq!(Generator::new(16384, 0).err(), Some(FluidError::IdRange));
    }

    #[test]
    fn all_encodings_roundtrip() {
        let mut gen = Generator::new(42, 1000).unwrap();
        for _ in 0..64 {
            let fluid = gen.generate().unwrap();
            for typ in [StringType::DotHex, StringType::Words, StringType::F58] {
                let s = encode(fluid, typ);
                assert_eq!(decode(&s, typ).unwrap(), fluid, "type {typ:?} form {s}");
                assert_eq!(parse(&s).unwrap(), fluid, "parse {s}");
            }
        }
    }

    #[test]
    fn integer_forms_parse() {
        assert_eq!(parse("12345").unwrap(), 12345);
        assert_eq!(parse("0xff").unwrap(), 255);
        assert_eq!(parse("  42  ").unwrap(), 42);
        assert!(parse("").is_err());
        assert!(parse("12z").is_err());
    }

    #[test]
    fn oversized_encodings_rejected() {
        // dothex spans the full u64
        assert!(decode("ffff.ffff.ffff.ffff", StringType::DotHex).is_ok());
        // f58 beyond the u64 range must not decode
        assert!(decode("fJPwcyDCgEuqJJJJJJJ", StringType::F58).is_err());
        assert!(decode("f", StringType::F58).is_err());
    }
}
