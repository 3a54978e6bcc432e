//! Building a reading from a register map

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::decoder::{decode_entry, DecodedValue};
use crate::error::{FieldError, MeterSrvError};
use crate::register_map::{RegisterMap, RegisterMapEntry};
use crate::transport::Transport;

/// What to do with a reading that has failed fields
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldFailurePolicy {
    /// Keep the reading, failed fields render empty/omitted
    #[default]
    Degrade,
    /// Drop the whole reading
    Discard,
}

/// One field slot of a reading
#[derive(Debug, Clone, PartialEq)]
pub struct FieldReading {
    pub name: String,
    pub label: String,
    pub result: Result<DecodedValue, FieldError>,
}

impl FieldReading {
    pub fn value(&self) -> Option<&DecodedValue> {
        self.result.as_ref().ok()
    }
}

/// Timestamped values for every configured field, in map order
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub timestamp: DateTime<Utc>,
    fields: Vec<FieldReading>,
}

impl Reading {
    pub fn new(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            fields: Vec::new(),
        }
    }

    pub fn push(
        &mut self,
        entry: &RegisterMapEntry,
        result: Result<DecodedValue, FieldError>,
    ) {
        self.fields.push(FieldReading {
            name: entry.name.clone(),
            label: entry.column_label().to_string(),
            result,
        });
    }

    pub fn fields(&self) -> &[FieldReading] {
        &self.fields
    }

    pub fn get(&self, name: &str) -> Option<&FieldReading> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn value(&self, name: &str) -> Option<&DecodedValue> {
        self.get(name).and_then(FieldReading::value)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn failed_count(&self) -> usize {
        self.fields.iter().filter(|f| f.result.is_err()).count()
    }

    /// Every field decoded
    pub fn is_complete(&self) -> bool {
        self.failed_count() == 0
    }

    /// First field error, when not a single field decoded
    pub fn total_failure(&self) -> Option<MeterSrvError> {
        if self.fields.iter().any(|f| f.result.is_ok()) {
            return None;
        }
        self.fields
            .iter()
            .find_map(|f| f.result.clone().err())
            .map(MeterSrvError::from)
    }
}

/// Fetch and decode a single entry
///
/// Converts the 1-based datasheet address to the 0-based register index.
pub async fn resolve(
    entry: &RegisterMapEntry,
    transport: &mut dyn Transport,
) -> Result<DecodedValue, FieldError> {
    let words = transport
        .read_registers(entry.register_index(), u16::from(entry.words))
        .await?;
    Ok(decode_entry(&words, entry)?)
}

/// Resolve every entry of the map
///
/// A failing field is recorded in its slot and the remaining fields are
/// still attempted.
pub async fn read_all(
    map: &RegisterMap,
    transport: &mut dyn Transport,
    timestamp: DateTime<Utc>,
) -> Reading {
    let mut reading = Reading::new(timestamp);
    for entry in map {
        let result = resolve(entry, transport).await;
        match &result {
            Ok(value) => debug!("{} = {}", entry.name, value),
            Err(e) => warn!("Field {} (address {}) failed: {}", entry.name, entry.address, e),
        }
        reading.push(entry, result);
    }
    reading
}
