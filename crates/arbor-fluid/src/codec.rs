//! FLUID string codecs.

use crate::{validate, words, Fluid, FluidError};

/// Max base58 string length for the f58 encoding of a u64.
const MAX_B58_STRLEN: usize = 12;

const F58_PREFIX: &str = "\u{0192}"; // ƒ
const F58_ALT_PREFIX: &str = "f";

/// Supported string encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringType {
    /// Four 16-bit hex groups joined by `.`.
    DotHex,
    /// Dash-separated wordlist form, `w-w-w-w--w-w-w-w`.
    Words,
    /// Base58 with a `ƒ` (or ASCII `f`) prefix.
    F58,
}

/// True when the environment advertises a UTF-8 capable encoding and the
/// ASCII override is unset. Stands in for the usual locale probe.
fn utf8_locale() -> bool {
    if std::env::var_os("ARBOR_F58_FORCE_ASCII").is_some() {
        return false;
    }
    ["LC_ALL", "LC_CTYPE", "LANG"]
        .iter()
        .filter_map(|name| std::env::var(name).ok())
        .next()
        .map(|v| v.to_ascii_uppercase().contains("UTF-8"))
        .unwrap_or(false)
}

fn encode_dothex(fluid: Fluid) -> String {
    format!(
        "{:04x}.{:04x}.{:04x}.{:04x}",
        (fluid >> 48) & 0xffff,
        (fluid >> 32) & 0xffff,
        (fluid >> 16) & 0xffff,
        fluid & 0xffff
    )
}

fn decode_dothex(s: &str) -> Result<Fluid, FluidError> {
    let groups: Vec<&str> = s.split('.').collect();
    if groups.len() != 4 {
        return Err(FluidError::Decode);
    }
    let mut fluid: u64 = 0;
    for group in groups {
        if group.is_empty() || group.len() > 4 {
            return Err(FluidError::Decode);
        }
        let part = u64::from_str_radix(group, 16).map_err(|_| FluidError::Decode)?;
        fluid = (fluid << 16) | part;
    }
    Ok(fluid)
}

fn encode_f58(fluid: Fluid) -> String {
    let prefix = if utf8_locale() { F58_PREFIX } else { F58_ALT_PREFIX };
    // base58 of the integer: strip leading zero bytes so the digits carry
    // no width, matching numeric base58
    let bytes = fluid.to_be_bytes();
    let start = bytes.iter().position(|&b| b != 0).unwrap_or(bytes.len());
    if start == bytes.len() {
        return format!("{prefix}1");
    }
    format!("{prefix}{}", bs58::encode(&bytes[start..]).into_string())
}

fn f58_prefix_len(s: &str) -> Option<usize> {
    if let Some(rest) = s.strip_prefix(F58_PREFIX) {
        return Some(s.len() - rest.len());
    }
    if let Some(rest) = s.strip_prefix(F58_ALT_PREFIX) {
        return Some(s.len() - rest.len());
    }
    None
}

fn decode_f58(s: &str) -> Result<Fluid, FluidError> {
    let prefix_len = f58_prefix_len(s).ok_or(FluidError::Decode)?;
    let b58 = &s[prefix_len..];
    if b58.is_empty() || b58.len() > MAX_B58_STRLEN {
        return Err(FluidError::Decode);
    }
    let bytes = bs58::decode(b58).into_vec().map_err(|_| FluidError::Decode)?;
    let bytes: Vec<u8> = bytes.into_iter().skip_while(|&b| b == 0).collect();
    if bytes.len() > 8 {
        return Err(FluidError::Decode);
    }
    let mut fluid: u64 = 0;
    for b in bytes {
        fluid = (fluid << 8) | u64::from(b);
    }
    Ok(fluid)
}

/// Encode `fluid` in the requested form.
pub(crate) fn encode(fluid: Fluid, typ: StringType) -> String {
    match typ {
        StringType::DotHex => encode_dothex(fluid),
        StringType::Words => words::encode(fluid),
        StringType::F58 => encode_f58(fluid),
    }
}

/// Decode a string of known type, validating the result's field widths.
pub(crate) fn decode(s: &str, typ: StringType) -> Result<Fluid, FluidError> {
    let fluid = match typ {
        StringType::DotHex => decode_dothex(s)?,
        StringType::Words => words::decode(s)?,
        StringType::F58 => decode_f58(s)?,
    };
    validate(fluid)
}

/// Detect the encoding of `s`, if it is one of the string forms.
///
/// An f58 string may begin with `f`, which could also start a wordlist
/// form, so the separator-bearing encodings are checked first.
pub fn detect_string_type(s: &str) -> Option<StringType> {
    if s.contains('.') {
        return Some(StringType::DotHex);
    }
    if s.contains('-') {
        return Some(StringType::Words);
    }
    if f58_prefix_len(s).is_some() {
        return Some(StringType::F58);
    }
    None
}

/// Auto-detecting parse; falls back to decimal or `0x`-hex integers.
pub(crate) fn parse(s: &str) -> Result<Fluid, FluidError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(FluidError::Decode);
    }
    if let Some(typ) = detect_string_type(s) {
        return decode(s, typ);
    }
    let fluid = if let Some(hexpart) = s.strip_prefix("0x") {
        u64::from_str_radix(hexpart, 16).map_err(|_| FluidError::Decode)?
    } else {
        s.parse::<u64>().map_err(|_| FluidError::Decode)?
    };
    validate(fluid)
}
