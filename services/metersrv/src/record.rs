//! CSV and JSON record encoding

use chrono::SecondsFormat;
use csv::{QuoteStyle, Terminator, WriterBuilder};
use serde_json::{json, Map, Number, Value};

use crate::config::OutputFormat;
use crate::decoder::{format_float, DecodedValue};
use crate::error::StorageError;
use crate::reading::Reading;
use crate::register_map::RegisterMap;

/// CSV timestamp column format (UTC)
pub const CSV_TIME_FORMAT: &str = "%Y/%m/%d %H:%M:%S";

/// JSON record schema version
pub const JSON_RECORD_VERSION: u32 = 1;

fn csv_row<I, S>(fields: I) -> Result<Vec<u8>, StorageError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<[u8]>,
{
    let mut writer = WriterBuilder::new()
        .quote_style(QuoteStyle::NonNumeric)
        .terminator(Terminator::Any(b'\n'))
        .from_writer(Vec::new());
    writer.write_record(fields)?;
    writer
        .into_inner()
        .map_err(|e| StorageError::Encode(e.to_string()))
}

/// `"Time"` followed by every column label
pub fn csv_header(map: &RegisterMap) -> Result<Vec<u8>, StorageError> {
    let mut columns = vec!["Time".to_string()];
    columns.extend(map.iter().map(|entry| entry.column_label().to_string()));
    csv_row(&columns)
}

fn csv_cell(value: Option<&DecodedValue>) -> String {
    match value {
        Some(DecodedValue::Float(v)) => format_float(*v),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

/// One CSV line; failed fields are empty
///
/// Numbers are written bare, text and firmware quoted.
pub fn csv_line(reading: &Reading) -> Result<Vec<u8>, StorageError> {
    let mut cells = Vec::with_capacity(reading.len() + 1);
    cells.push(reading.timestamp.format(CSV_TIME_FORMAT).to_string());
    cells.extend(reading.fields().iter().map(|field| csv_cell(field.value())));
    csv_row(&cells)
}

fn json_value(value: &DecodedValue) -> Option<Value> {
    match value {
        DecodedValue::Float(v) => Number::from_f64(*v).map(Value::Number),
        DecodedValue::UInt(v) => Some(Value::from(*v)),
        DecodedValue::Text(s) => Some(Value::String(s.clone())),
        DecodedValue::Firmware(fw) => Some(Value::String(fw.to_string())),
    }
}

/// JSON record keyed by field name
///
/// Non-finite floats and failed fields are left out of `points`.
pub fn json_record(reading: &Reading) -> Value {
    let mut points = Map::new();
    for field in reading.fields() {
        if let Some(value) = field.value().and_then(json_value) {
            points.insert(field.name.clone(), json!({ "present_value": value }));
        }
    }
    json!({
        "version": JSON_RECORD_VERSION,
        "timestamp": reading.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true),
        "points": points,
    })
}

/// One JSON Lines record
pub fn json_line(reading: &Reading) -> Result<Vec<u8>, StorageError> {
    let mut line = serde_json::to_vec(&json_record(reading))?;
    line.push(b'\n');
    Ok(line)
}

/// Encode a reading for the given output format
pub fn encode(reading: &Reading, format: OutputFormat) -> Result<Vec<u8>, StorageError> {
    match format {
        OutputFormat::Csv => csv_line(reading),
        OutputFormat::Json => json_line(reading),
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::decoder::FirmwareVersion;
    use crate::error::{FieldError, TransportError};
    use crate::register_map::{DecodeKind, RegisterMapEntry};
    use chrono::{TimeZone, Utc};

    fn entries() -> Vec<RegisterMapEntry> {
        vec![
            RegisterMapEntry::new("voltage", 3028, 2, DecodeKind::Float32).with_label("Voltage"),
            RegisterMapEntry::new("energy", 3204, 4, DecodeKind::UInt64).with_label("Energy"),
            RegisterMapEntry::new("model", 30, 20, DecodeKind::FixedString(40)),
            RegisterMapEntry::new("firmware", 1637, 4, DecodeKind::FirmwareTriplet),
            RegisterMapEntry::new("freq", 3110, 2, DecodeKind::Float32).with_label("Frequency"),
        ]
    }

    fn sample_reading(freq: Result<DecodedValue, FieldError>) -> Reading {
        let entries = entries();
        let mut reading = Reading::new(Utc.with_ymd_and_hms(2024, 3, 5, 7, 8, 9).unwrap());
        reading.push(&entries[0], Ok(DecodedValue::Float(230.1)));
        reading.push(&entries[1], Ok(DecodedValue::UInt(10000)));
        reading.push(&entries[2], Ok(DecodedValue::Text("PM5110".into())));
        reading.push(
            &entries[3],
            Ok(DecodedValue::Firmware(FirmwareVersion {
                major: 1,
                minor: 4,
                patch: 2,
            })),
        );
        reading.push(&entries[4], freq);
        reading
    }

    #[test]
    fn test_csv_header_quotes_labels() {
        let map = RegisterMap::new("sample", entries()).unwrap();
        let header = String::from_utf8(csv_header(&map).unwrap()).unwrap();
        assert_eq!(
            header,
            "\"Time\",\"Voltage\",\"Energy\",\"model\",\"firmware\",\"Frequency\"\n"
        );
    }

    #[test]
    fn test_csv_line() {
        let reading = sample_reading(Ok(DecodedValue::Float(50.0)));
        let line = String::from_utf8(csv_line(&reading).unwrap()).unwrap();
        assert_eq!(
            line,
            "\"2024/03/05 07:08:09\",230.1,10000,\"PM5110\",\"1.4.2\",50\n"
        );
    }

    #[test]
    fn test_csv_failed_field_is_empty() {
        let reading = sample_reading(Err(FieldError::Transport(TransportError::Io(
            "broken pipe".into(),
        ))));
        let line = csv_line(&reading).unwrap();
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .from_reader(line.as_slice());
        let record = reader.records().next().unwrap().unwrap();
        assert_eq!(record.len(), 6);
        assert_eq!(&record[1], "230.1");
        assert_eq!(&record[5], "");
    }

    #[test]
    fn test_json_record() {
        let reading = sample_reading(Ok(DecodedValue::Float(f64::NAN)));
        let record = json_record(&reading);

        assert_eq!(record["version"], 1);
        assert_eq!(record["timestamp"], "2024-03-05T07:08:09.000000Z");
        assert_eq!(record["points"]["voltage"]["present_value"], 230.1);
        assert_eq!(record["points"]["energy"]["present_value"], 10000);
        assert_eq!(record["points"]["model"]["present_value"], "PM5110");
        assert_eq!(record["points"]["firmware"]["present_value"], "1.4.2");
        // NaN is dropped, not serialized as null
        assert!(record["points"].get("freq").is_none());
    }

    #[test]
    fn test_json_line_is_single_line() {
        let reading = sample_reading(Ok(DecodedValue::Float(f64::INFINITY)));
        let line = String::from_utf8(json_line(&reading).unwrap()).unwrap();
        assert!(line.ends_with('\n'));
        assert_eq!(line.lines().count(), 1);
        let parsed: Value = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(parsed["points"].as_object().unwrap().len(), 4);
    }
}
