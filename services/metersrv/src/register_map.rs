//! Meter register maps
//!
//! A register map is an ordered list of named fields, each pointing at a
//! 1-based datasheet address, a word count and a decode kind. Maps are loaded
//! once at startup, either from one of the built-in YAML resources or from a
//! user supplied file with the same schema, and never mutated afterwards.

use std::collections::HashSet;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::ConfigError;

/// Built-in meter models and their embedded YAML maps
const BUILTIN_MAPS: &[(&str, &str)] = &[
    (
        "schneider_pm5100",
        include_str!("../config/registers/schneider_pm5100.yaml"),
    ),
    (
        "schneider_iem2150",
        include_str!("../config/registers/schneider_iem2150.yaml"),
    ),
    (
        "hiking_dds238_2",
        include_str!("../config/registers/hiking_dds238_2.yaml"),
    ),
];

/// Names of the built-in register maps
pub fn builtin_models() -> impl Iterator<Item = &'static str> {
    BUILTIN_MAPS.iter().map(|(name, _)| *name)
}

/// How a run of register words turns into a value
///
/// Parsed from the datasheet vocabulary (`FLOAT32`, `INT32U`, `STRING40`...).
/// Kinds this build does not know are kept as [`DecodeKind::Other`] so a
/// single odd entry degrades only its own field.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum DecodeKind {
    Float32,
    UInt16,
    UInt32,
    UInt64,
    /// ASCII text of the given byte length, two characters per word
    FixedString(usize),
    /// `major.minor.patch` from the first three words
    FirmwareTriplet,
    /// Four-quadrant power factor, quadrant rule
    PowerFactor4Q,
    /// Four-quadrant power factor, lead/lag rule (value)
    PowerFactorLeadLag,
    /// Four-quadrant power factor, lead/lag rule (direction label)
    PowerFactorDirection,
    Other(String),
}

impl DecodeKind {
    /// Minimum number of words the kind consumes
    pub fn required_words(&self) -> usize {
        match self {
            DecodeKind::UInt16 => 1,
            DecodeKind::Float32
            | DecodeKind::UInt32
            | DecodeKind::PowerFactor4Q
            | DecodeKind::PowerFactorLeadLag
            | DecodeKind::PowerFactorDirection => 2,
            DecodeKind::FirmwareTriplet => 3,
            DecodeKind::UInt64 => 4,
            DecodeKind::FixedString(bytes) => bytes.div_ceil(2),
            DecodeKind::Other(_) => 0,
        }
    }

    /// Integer kinds accept decimal scaling
    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            DecodeKind::UInt16 | DecodeKind::UInt32 | DecodeKind::UInt64
        )
    }

    pub fn parse(raw: &str) -> Self {
        let kind = raw.trim().to_ascii_uppercase();
        match kind.as_str() {
            "FLOAT32" => DecodeKind::Float32,
            "INT16U" | "UINT16" => DecodeKind::UInt16,
            "INT32U" | "UINT32" => DecodeKind::UInt32,
            "INT64U" | "UINT64" => DecodeKind::UInt64,
            "FIRMWARE" => DecodeKind::FirmwareTriplet,
            "PF4Q" => DecodeKind::PowerFactor4Q,
            "PFLL" => DecodeKind::PowerFactorLeadLag,
            "PFLL_DIRECTION" => DecodeKind::PowerFactorDirection,
            _ => match kind.strip_prefix("STRING").map(str::parse::<usize>) {
                Some(Ok(bytes)) if bytes > 0 => DecodeKind::FixedString(bytes),
                _ => DecodeKind::Other(raw.trim().to_string()),
            },
        }
    }
}

impl fmt::Display for DecodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeKind::Float32 => f.write_str("FLOAT32"),
            DecodeKind::UInt16 => f.write_str("INT16U"),
            DecodeKind::UInt32 => f.write_str("INT32U"),
            DecodeKind::UInt64 => f.write_str("INT64U"),
            DecodeKind::FixedString(bytes) => write!(f, "STRING{}", bytes),
            DecodeKind::FirmwareTriplet => f.write_str("FIRMWARE"),
            DecodeKind::PowerFactor4Q => f.write_str("PF4Q"),
            DecodeKind::PowerFactorLeadLag => f.write_str("PFLL"),
            DecodeKind::PowerFactorDirection => f.write_str("PFLL_DIRECTION"),
            DecodeKind::Other(raw) => f.write_str(raw),
        }
    }
}

impl From<String> for DecodeKind {
    fn from(raw: String) -> Self {
        DecodeKind::parse(&raw)
    }
}

impl From<DecodeKind> for String {
    fn from(kind: DecodeKind) -> Self {
        kind.to_string()
    }
}

/// One named field of a register map
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterMapEntry {
    /// Unique field key
    pub name: String,
    /// 1-based datasheet address
    pub address: u16,
    /// Number of 16-bit words to request
    pub words: u8,
    pub kind: DecodeKind,
    /// Integer kinds only: divide by 10^decimals
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decimals: Option<u8>,
    /// Column / point label, defaults to `name`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl RegisterMapEntry {
    pub fn new(name: impl Into<String>, address: u16, words: u8, kind: DecodeKind) -> Self {
        Self {
            name: name.into(),
            address,
            words,
            kind,
            decimals: None,
            label: None,
        }
    }

    pub fn with_decimals(mut self, decimals: u8) -> Self {
        self.decimals = Some(decimals);
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// 0-based register index on the wire
    pub fn register_index(&self) -> u16 {
        self.address.saturating_sub(1)
    }

    /// Output label for CSV headers and JSON points
    pub fn column_label(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Debug, Deserialize)]
struct RegisterMapFile {
    #[serde(default)]
    model: Option<String>,
    registers: Vec<RegisterMapEntry>,
}

/// Immutable, ordered register map for one meter model
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterMap {
    model: String,
    entries: Vec<RegisterMapEntry>,
}

impl RegisterMap {
    /// Build and validate a map from entries
    pub fn new(
        model: impl Into<String>,
        entries: Vec<RegisterMapEntry>,
    ) -> Result<Self, ConfigError> {
        let map = Self {
            model: model.into(),
            entries,
        };
        map.validate()?;
        Ok(map)
    }

    /// Load one of the built-in maps by model name
    pub fn builtin(model: &str) -> Result<Self, ConfigError> {
        let key = model.trim().to_ascii_lowercase();
        let (name, yaml) = BUILTIN_MAPS
            .iter()
            .find(|(name, _)| *name == key)
            .ok_or_else(|| ConfigError::UnknownModel(model.to_string()))?;
        Self::from_yaml_str(name, yaml)
    }

    /// Parse a map from YAML text; `source_name` is used in errors and as the fallback model name
    pub fn from_yaml_str(source_name: &str, yaml: &str) -> Result<Self, ConfigError> {
        let file: RegisterMapFile = serde_yaml::from_str(yaml)
            .map_err(|e| ConfigError::register_map(source_name, e.to_string()))?;
        let model = file.model.unwrap_or_else(|| source_name.to_string());
        Self::new(model, file.registers)
            .map_err(|e| ConfigError::register_map(source_name, e.to_string()))
    }

    /// Load a custom map from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::register_map(path.display().to_string(), e.to_string()))?;
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("custom");
        Self::from_yaml_str(stem, &text)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.entries.is_empty() {
            return Err(ConfigError::invalid("registers", "register map is empty"));
        }

        let mut seen = HashSet::new();
        for entry in &self.entries {
            if entry.name.trim().is_empty() {
                return Err(ConfigError::invalid("registers.name", "empty field name"));
            }
            if !seen.insert(entry.name.as_str()) {
                return Err(ConfigError::invalid(
                    format!("registers.{}", entry.name),
                    "duplicate field name",
                ));
            }
            if entry.address == 0 {
                return Err(ConfigError::invalid(
                    format!("registers.{}.address", entry.name),
                    "addresses are 1-based",
                ));
            }
            if entry.words == 0 {
                return Err(ConfigError::invalid(
                    format!("registers.{}.words", entry.name),
                    "must be at least 1",
                ));
            }
            if let Some(decimals) = entry.decimals {
                if decimals > 9 {
                    return Err(ConfigError::invalid(
                        format!("registers.{}.decimals", entry.name),
                        "must be between 0 and 9",
                    ));
                }
                if !entry.kind.is_integer() {
                    warn!(
                        "Field {}: decimals ignored for {} registers",
                        entry.name, entry.kind
                    );
                }
            }

            if let DecodeKind::Other(raw) = &entry.kind {
                warn!("Field {}: unknown decode kind '{}'", entry.name, raw);
            } else if usize::from(entry.words) < entry.kind.required_words() {
                warn!(
                    "Field {}: {} needs {} words but only {} configured",
                    entry.name,
                    entry.kind,
                    entry.kind.required_words(),
                    entry.words
                );
            }
        }

        Ok(())
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn entries(&self) -> &[RegisterMapEntry] {
        &self.entries
    }

    pub fn iter(&self) -> std::slice::Iter<'_, RegisterMapEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&RegisterMapEntry> {
        self.entries.iter().find(|e| e.name == name)
    }
}

impl<'a> IntoIterator for &'a RegisterMap {
    type Item = &'a RegisterMapEntry;
    type IntoIter = std::slice::Iter<'a, RegisterMapEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}
