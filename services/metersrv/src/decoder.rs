//! Register word decoding
//!
//! Pure functions from raw big-endian register words to typed values.

use std::fmt;

use crate::error::DecodeError;
use crate::register_map::{DecodeKind, RegisterMapEntry};

/// Firmware version assembled from three register words
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirmwareVersion {
    pub major: u16,
    pub minor: u16,
    pub patch: u16,
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// A decoded register value
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedValue {
    Float(f64),
    UInt(u64),
    Text(String),
    Firmware(FirmwareVersion),
}

impl DecodedValue {
    /// Numeric view, if the value is a number
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            DecodedValue::Float(v) => Some(*v),
            DecodedValue::UInt(v) => Some(*v as f64),
            _ => None,
        }
    }

    /// NaN and infinities cannot be represented in every output format
    pub fn is_finite(&self) -> bool {
        match self {
            DecodedValue::Float(v) => v.is_finite(),
            _ => true,
        }
    }
}

impl fmt::Display for DecodedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodedValue::Float(v) => f.write_str(&format_float(*v)),
            DecodedValue::UInt(v) => write!(f, "{}", v),
            DecodedValue::Text(s) => f.write_str(s),
            DecodedValue::Firmware(fw) => write!(f, "{}", fw),
        }
    }
}

/// Shortest round-trip decimal for a float, `NaN`/`inf`/`-inf` otherwise
pub fn format_float(value: f64) -> String {
    if value.is_finite() {
        let mut buf = ryu::Buffer::new();
        let text = buf.format_finite(value);
        // ryu renders integral values as "10000.0"
        text.strip_suffix(".0").unwrap_or(text).to_string()
    } else if value.is_nan() {
        "NaN".to_string()
    } else if value.is_sign_positive() {
        "inf".to_string()
    } else {
        "-inf".to_string()
    }
}

/// Widen an f32 through its shortest decimal form
///
/// `230.1f32` becomes `230.1` rather than `230.10000610351562`.
pub fn widen_f32(value: f32) -> f64 {
    if !value.is_finite() {
        return f64::from(value);
    }
    let mut buf = ryu::Buffer::new();
    buf.format_finite(value)
        .parse::<f64>()
        .unwrap_or_else(|_| f64::from(value))
}

/// Quadrant reported by the four-quadrant power factor rule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PfQuadrant {
    /// Register held NaN
    Unity,
    /// Quadrant I or III
    ImportOrExport,
    /// Quadrant II, negative real power, positive reactive power
    Quadrant2,
    /// Quadrant IV, positive real power, negative reactive power
    Quadrant4,
}

/// Direction label of the lead/lag power factor rule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PfDirection {
    Leading,
    Lagging,
    Unity,
}

impl PfDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            PfDirection::Leading => "leading",
            PfDirection::Lagging => "lagging",
            PfDirection::Unity => "unity",
        }
    }
}

/// Four-quadrant power factor, quadrant rule
pub fn pf_from_pf4q(v: f64) -> (f64, PfQuadrant) {
    if v.is_nan() {
        (1.0, PfQuadrant::Unity)
    } else if v < -1.0 {
        (v + 1.0, PfQuadrant::Quadrant2)
    } else if v > 1.0 {
        (v - 1.0, PfQuadrant::Quadrant4)
    } else {
        (v, PfQuadrant::ImportOrExport)
    }
}

/// Four-quadrant power factor, lead/lag rule
///
/// Not equivalent to [`pf_from_pf4q`]; the register map picks one per meter family.
pub fn pf_lead_lag(v: f64) -> (f64, PfDirection) {
    if v.is_nan() {
        (1.0, PfDirection::Unity)
    } else if v < -1.0 {
        (-2.0 - v, PfDirection::Leading)
    } else if v > 1.0 {
        (2.0 - v, PfDirection::Leading)
    } else {
        (v, PfDirection::Lagging)
    }
}

fn require(words: &[u16], kind: &DecodeKind) -> Result<(), DecodeError> {
    let required = kind.required_words();
    if words.len() < required {
        return Err(DecodeError::InsufficientWords {
            kind: kind.to_string(),
            required,
            got: words.len(),
        });
    }
    Ok(())
}

fn concat_words(words: &[u16]) -> u64 {
    words
        .iter()
        .fold(0u64, |acc, word| (acc << 16) | u64::from(*word))
}

fn float32(words: &[u16]) -> f64 {
    let bits = (u32::from(words[0]) << 16) | u32::from(words[1]);
    widen_f32(f32::from_bits(bits))
}

fn fixed_string(words: &[u16], byte_len: usize) -> String {
    let bytes: Vec<u8> = words
        .iter()
        .flat_map(|word| word.to_be_bytes())
        .take(byte_len)
        .take_while(|byte| *byte != 0)
        .collect();
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Decode raw register words according to `kind`
///
/// Extra trailing words are ignored.
pub fn decode(words: &[u16], kind: &DecodeKind) -> Result<DecodedValue, DecodeError> {
    if let DecodeKind::Other(raw) = kind {
        return Err(DecodeError::UnsupportedKind(raw.clone()));
    }
    require(words, kind)?;

    let value = match kind {
        DecodeKind::Float32 => DecodedValue::Float(float32(words)),
        DecodeKind::UInt16 => DecodedValue::UInt(concat_words(&words[..1])),
        DecodeKind::UInt32 => DecodedValue::UInt(concat_words(&words[..2])),
        DecodeKind::UInt64 => DecodedValue::UInt(concat_words(&words[..4])),
        DecodeKind::FixedString(len) => DecodedValue::Text(fixed_string(words, *len)),
        DecodeKind::FirmwareTriplet => DecodedValue::Firmware(FirmwareVersion {
            major: words[0],
            minor: words[1],
            patch: words[2],
        }),
        DecodeKind::PowerFactor4Q => DecodedValue::Float(pf_from_pf4q(float32(words)).0),
        DecodeKind::PowerFactorLeadLag => DecodedValue::Float(pf_lead_lag(float32(words)).0),
        DecodeKind::PowerFactorDirection => {
            DecodedValue::Text(pf_lead_lag(float32(words)).1.as_str().to_string())
        },
        DecodeKind::Other(raw) => return Err(DecodeError::UnsupportedKind(raw.clone())),
    };

    Ok(value)
}

/// Decode words for a map entry, applying its decimal scaling
pub fn decode_entry(words: &[u16], entry: &RegisterMapEntry) -> Result<DecodedValue, DecodeError> {
    let value = decode(words, &entry.kind)?;
    match (value, entry.decimals) {
        (DecodedValue::UInt(raw), Some(decimals)) if entry.kind.is_integer() => {
            Ok(DecodedValue::Float(raw as f64 / 10f64.powi(i32::from(decimals))))
        },
        (value, _) => Ok(value),
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    fn f32_words(v: f32) -> [u16; 2] {
        let bits = v.to_bits();
        [(bits >> 16) as u16, bits as u16]
    }

    fn ascii_words(text: &[u8]) -> Vec<u16> {
        text.chunks(2)
            .map(|pair| u16::from_be_bytes([pair[0], *pair.get(1).unwrap_or(&0)]))
            .collect()
    }

    #[test]
    fn test_float32_big_endian() {
        assert_eq!(
            decode(&[0x3f80, 0x0000], &DecodeKind::Float32).unwrap(),
            DecodedValue::Float(1.0)
        );
        assert_eq!(
            decode(&f32_words(230.1), &DecodeKind::Float32).unwrap(),
            DecodedValue::Float(230.1)
        );
    }

    #[test]
    fn test_unsigned_concatenation() {
        assert_eq!(
            decode(&[0x0001, 0x0000], &DecodeKind::UInt32).unwrap(),
            DecodedValue::UInt(65536)
        );
        assert_eq!(
            decode(&[0x0000, 0x0001, 0x0000, 0x0002], &DecodeKind::UInt64).unwrap(),
            DecodedValue::UInt((1u64 << 32) + 2)
        );
        assert_eq!(
            decode(&[0xffff], &DecodeKind::UInt16).unwrap(),
            DecodedValue::UInt(65535)
        );
    }

    #[test]
    fn test_fixed_string_truncates_at_first_nul() {
        let words = ascii_words(b"AB\0\0XX\0\0");
        assert_eq!(
            decode(&words, &DecodeKind::FixedString(8)).unwrap(),
            DecodedValue::Text("AB".to_string())
        );

        let words = ascii_words(b"PM5110");
        assert_eq!(
            decode(&words, &DecodeKind::FixedString(6)).unwrap(),
            DecodedValue::Text("PM5110".to_string())
        );
    }

    #[test]
    fn test_firmware_triplet() {
        let value = decode(&[1, 4, 2, 9], &DecodeKind::FirmwareTriplet).unwrap();
        assert_eq!(value.to_string(), "1.4.2");
    }

    #[test]
    fn test_pf4q_quadrant_rule() {
        assert_eq!(pf_from_pf4q(f64::NAN), (1.0, PfQuadrant::Unity));
        assert_eq!(pf_from_pf4q(1.5), (0.5, PfQuadrant::Quadrant4));
        assert_eq!(pf_from_pf4q(-1.5), (-0.5, PfQuadrant::Quadrant2));
        assert_eq!(pf_from_pf4q(0.9), (0.9, PfQuadrant::ImportOrExport));
        assert_eq!(pf_from_pf4q(-1.0), (-1.0, PfQuadrant::ImportOrExport));

        assert_eq!(
            decode(&f32_words(f32::NAN), &DecodeKind::PowerFactor4Q).unwrap(),
            DecodedValue::Float(1.0)
        );
        assert_eq!(
            decode(&f32_words(1.5), &DecodeKind::PowerFactor4Q).unwrap(),
            DecodedValue::Float(0.5)
        );
        assert_eq!(
            decode(&f32_words(-1.5), &DecodeKind::PowerFactor4Q).unwrap(),
            DecodedValue::Float(-0.5)
        );
    }

    #[test]
    fn test_pf_lead_lag_rule() {
        assert_eq!(pf_lead_lag(f64::NAN), (1.0, PfDirection::Unity));
        assert_eq!(pf_lead_lag(1.5), (0.5, PfDirection::Leading));
        assert_eq!(pf_lead_lag(-1.5), (-0.5, PfDirection::Leading));
        assert_eq!(pf_lead_lag(-0.8), (-0.8, PfDirection::Lagging));
        assert_eq!(pf_lead_lag(0.95), (0.95, PfDirection::Lagging));

        // Same register, two different readings under the two rules
        assert_ne!(pf_lead_lag(1.2).0, pf_from_pf4q(1.2).0);

        assert_eq!(
            decode(&f32_words(1.5), &DecodeKind::PowerFactorDirection).unwrap(),
            DecodedValue::Text("leading".to_string())
        );
    }

    #[test]
    fn test_insufficient_words() {
        assert_eq!(
            decode(&[0x3f80], &DecodeKind::Float32),
            Err(DecodeError::InsufficientWords {
                kind: "FLOAT32".to_string(),
                required: 2,
                got: 1,
            })
        );
        assert!(matches!(
            decode(&[1, 2], &DecodeKind::FirmwareTriplet),
            Err(DecodeError::InsufficientWords { required: 3, .. })
        ));
    }

    #[test]
    fn test_unsupported_kind() {
        assert_eq!(
            decode(&[1, 2], &DecodeKind::Other("BITMAP".into())),
            Err(DecodeError::UnsupportedKind("BITMAP".to_string()))
        );
    }

    #[test]
    fn test_decimal_scaling() {
        let entry = RegisterMapEntry::new("voltage", 13, 1, DecodeKind::UInt16).with_decimals(1);
        assert_eq!(
            decode_entry(&[2301], &entry).unwrap(),
            DecodedValue::Float(230.1)
        );

        let raw = RegisterMapEntry::new("power", 15, 1, DecodeKind::UInt16);
        assert_eq!(decode_entry(&[1500], &raw).unwrap(), DecodedValue::UInt(1500));
    }

    #[test]
    fn test_format_float() {
        assert_eq!(format_float(230.1), "230.1");
        assert_eq!(format_float(10000.0), "10000");
        assert_eq!(format_float(f64::NAN), "NaN");
        assert_eq!(format_float(0.19999999999999996), "0.19999999999999996");
    }
}
