//! VPC flow log record model.
//!
//! A flow log line is 14 whitespace-delimited tokens:
//!
//! ```text
//! version account_id interface_id srcaddr dstaddr srcport dstport protocol packets bytes start end action log_status
//! ```
//!
//! `-` stands for a missing value. [`FlowRecord`] is the single authority for
//! reading and writing this format.

use crate::cloudwatch::LogEvent;
use crate::error::{ReaderError, Result};
use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Number of tokens in a flow log line
pub const FIELD_COUNT: usize = 14;

/// Placeholder token for a missing value
pub const NULL_PLACEHOLDER: &str = "-";

/// Largest timestamp interpreted as seconds. Anything above is milliseconds.
pub const EPOCH_32_MAX: i64 = 2_147_483_647;

const DISPLAY_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Traffic verdict recorded for a flow
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Action {
    Accept,
    Reject,
    Other(String),
}

impl Action {
    pub fn as_str(&self) -> &str {
        match self {
            Action::Accept => "ACCEPT",
            Action::Reject => "REJECT",
            Action::Other(s) => s,
        }
    }
}

impl From<&str> for Action {
    fn from(s: &str) -> Self {
        match s {
            "ACCEPT" => Action::Accept,
            "REJECT" => Action::Reject,
            other => Action::Other(other.to_string()),
        }
    }
}

/// Capture status of a flow log interval
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LogStatus {
    Ok,
    /// No traffic during the capture window
    NoData,
    /// Records were skipped during the capture window
    SkipData,
    Other(String),
}

impl LogStatus {
    pub fn as_str(&self) -> &str {
        match self {
            LogStatus::Ok => "OK",
            LogStatus::NoData => "NODATA",
            LogStatus::SkipData => "SKIPDATA",
            LogStatus::Other(s) => s,
        }
    }

    /// `NODATA` and `SKIPDATA` carry no traffic details.
    pub fn is_sentinel(&self) -> bool {
        matches!(self, LogStatus::NoData | LogStatus::SkipData)
    }
}

impl From<&str> for LogStatus {
    fn from(s: &str) -> Self {
        match s {
            "OK" => LogStatus::Ok,
            "NODATA" => LogStatus::NoData,
            "SKIPDATA" => LogStatus::SkipData,
            other => LogStatus::Other(other.to_string()),
        }
    }
}

macro_rules! display_and_serialize_as_str {
    ($($ty:ty),*) => {$(
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl Serialize for $ty {
            fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
                serializer.serialize_str(self.as_str())
            }
        }
    )*};
}

display_and_serialize_as_str!(Action, LogStatus, FlowField);

/// One flow log record.
///
/// Equality and hashing cover all 14 fields, so records can be deduplicated
/// in a `HashSet`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct FlowRecord {
    pub version: u32,
    pub account_id: String,
    pub interface_id: String,
    pub srcaddr: Option<String>,
    pub dstaddr: Option<String>,
    pub srcport: Option<u16>,
    pub dstport: Option<u16>,
    pub protocol: Option<u8>,
    pub packets: Option<u64>,
    pub bytes: Option<u64>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub action: Option<Action>,
    pub log_status: LogStatus,
}

impl FlowRecord {
    /// Parse a raw flow log line
    pub fn from_message(message: &str) -> Result<Self> {
        message.parse()
    }

    /// Parse the message carried by a log service event
    pub fn from_event(event: &LogEvent) -> Result<Self> {
        Self::from_message(&event.message)
    }

    /// Render the record in the canonical line format.
    ///
    /// Times are always written as epoch seconds, so a line that carried
    /// millisecond timestamps comes back in seconds.
    pub fn to_message(&self) -> String {
        [
            self.version.to_string(),
            self.account_id.clone(),
            self.interface_id.clone(),
            or_placeholder(self.srcaddr.as_deref()),
            or_placeholder(self.dstaddr.as_deref()),
            or_placeholder(self.srcport),
            or_placeholder(self.dstport),
            or_placeholder(self.protocol),
            or_placeholder(self.packets),
            or_placeholder(self.bytes),
            self.start.timestamp().to_string(),
            self.end.timestamp().to_string(),
            or_placeholder(self.action.as_ref()),
            self.log_status.to_string(),
        ]
        .join(" ")
    }

    /// Owned value of a single field
    pub fn field(&self, field: FlowField) -> FieldValue {
        fn text(value: &Option<String>) -> FieldValue {
            value.clone().map_or(FieldValue::Null, FieldValue::Text)
        }
        fn int(value: Option<impl Into<u64>>) -> FieldValue {
            value.map_or(FieldValue::Null, |v| FieldValue::Integer(v.into()))
        }

        match field {
            FlowField::Version => FieldValue::Integer(self.version.into()),
            FlowField::AccountId => FieldValue::Text(self.account_id.clone()),
            FlowField::InterfaceId => FieldValue::Text(self.interface_id.clone()),
            FlowField::Srcaddr => text(&self.srcaddr),
            FlowField::Dstaddr => text(&self.dstaddr),
            FlowField::Srcport => int(self.srcport),
            FlowField::Dstport => int(self.dstport),
            FlowField::Protocol => int(self.protocol),
            FlowField::Packets => int(self.packets),
            FlowField::Bytes => int(self.bytes),
            FlowField::Start => FieldValue::Time(self.start),
            FlowField::End => FieldValue::Time(self.end),
            FlowField::Action => self
                .action
                .as_ref()
                .map_or(FieldValue::Null, |a| FieldValue::Text(a.as_str().to_string())),
            FlowField::LogStatus => FieldValue::Text(self.log_status.as_str().to_string()),
        }
    }
}

impl FromStr for FlowRecord {
    type Err = ReaderError;

    fn from_str(line: &str) -> Result<Self> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != FIELD_COUNT {
            return Err(ReaderError::malformed(
                line,
                format!("expected {} fields, found {}", FIELD_COUNT, fields.len()),
            ));
        }

        let version = parse_int(line, "version", fields[0])?;
        let start = parse_timestamp(line, "start", fields[10])?;
        let end = parse_timestamp(line, "end", fields[11])?;
        let log_status = LogStatus::from(fields[13]);

        let mut record = FlowRecord {
            version,
            account_id: fields[1].to_string(),
            interface_id: fields[2].to_string(),
            srcaddr: None,
            dstaddr: None,
            srcport: None,
            dstport: None,
            protocol: None,
            packets: None,
            bytes: None,
            start,
            end,
            action: None,
            log_status,
        };

        if record.log_status.is_sentinel() {
            return Ok(record);
        }

        record.srcaddr = optional(fields[3]).map(str::to_string);
        record.dstaddr = optional(fields[4]).map(str::to_string);
        record.srcport = parse_optional_int(line, "srcport", fields[5])?;
        record.dstport = parse_optional_int(line, "dstport", fields[6])?;
        record.protocol = parse_optional_int(line, "protocol", fields[7])?;
        record.packets = parse_optional_int(line, "packets", fields[8])?;
        record.bytes = parse_optional_int(line, "bytes", fields[9])?;
        record.action = optional(fields[12]).map(Action::from);

        Ok(record)
    }
}

impl fmt::Display for FlowRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let start = self.start.format(DISPLAY_TIME_FORMAT).to_string();
        let end = self.end.format(DISPLAY_TIME_FORMAT).to_string();
        let values = [
            self.version.to_string(),
            self.account_id.clone(),
            self.interface_id.clone(),
            or_placeholder(self.srcaddr.as_deref()),
            or_placeholder(self.dstaddr.as_deref()),
            or_placeholder(self.srcport),
            or_placeholder(self.dstport),
            or_placeholder(self.protocol),
            or_placeholder(self.packets),
            or_placeholder(self.bytes),
            start,
            end,
            or_placeholder(self.action.as_ref()),
            self.log_status.to_string(),
        ];

        for (i, (field, value)) in FlowField::ALL.iter().zip(values.iter()).enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}: {}", field, value)?;
        }
        Ok(())
    }
}

fn or_placeholder<T: fmt::Display>(value: Option<T>) -> String {
    value.map_or_else(|| NULL_PLACEHOLDER.to_string(), |v| v.to_string())
}

fn optional(token: &str) -> Option<&str> {
    (token != NULL_PLACEHOLDER).then_some(token)
}

fn parse_int<T>(line: &str, name: &str, token: &str) -> Result<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    token
        .parse()
        .map_err(|e| ReaderError::malformed(line, format!("{} {:?}: {}", name, token, e)))
}

fn parse_optional_int<T>(line: &str, name: &str, token: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    optional(token)
        .map(|t| parse_int(line, name, t))
        .transpose()
}

/// Flow logs may carry millisecond timestamps even though the format says
/// seconds. Values above the 32-bit epoch range are treated as milliseconds
/// and truncated to whole seconds.
fn parse_timestamp(line: &str, name: &str, token: &str) -> Result<DateTime<Utc>> {
    let mut secs: i64 = parse_int(line, name, token)?;
    if secs > EPOCH_32_MAX {
        secs /= 1000;
    }

    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| ReaderError::malformed(line, format!("{} {} out of range", name, token)))
}

/// Names of the 14 flow record fields, in line order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlowField {
    Version,
    AccountId,
    InterfaceId,
    Srcaddr,
    Dstaddr,
    Srcport,
    Dstport,
    Protocol,
    Packets,
    Bytes,
    Start,
    End,
    Action,
    LogStatus,
}

impl FlowField {
    pub const ALL: [FlowField; FIELD_COUNT] = [
        FlowField::Version,
        FlowField::AccountId,
        FlowField::InterfaceId,
        FlowField::Srcaddr,
        FlowField::Dstaddr,
        FlowField::Srcport,
        FlowField::Dstport,
        FlowField::Protocol,
        FlowField::Packets,
        FlowField::Bytes,
        FlowField::Start,
        FlowField::End,
        FlowField::Action,
        FlowField::LogStatus,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FlowField::Version => "version",
            FlowField::AccountId => "account_id",
            FlowField::InterfaceId => "interface_id",
            FlowField::Srcaddr => "srcaddr",
            FlowField::Dstaddr => "dstaddr",
            FlowField::Srcport => "srcport",
            FlowField::Dstport => "dstport",
            FlowField::Protocol => "protocol",
            FlowField::Packets => "packets",
            FlowField::Bytes => "bytes",
            FlowField::Start => "start",
            FlowField::End => "end",
            FlowField::Action => "action",
            FlowField::LogStatus => "log_status",
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown flow record field: {0}")]
pub struct UnknownField(pub String);

impl FromStr for FlowField {
    type Err = UnknownField;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        FlowField::ALL
            .iter()
            .copied()
            .find(|f| f.as_str() == s)
            .ok_or_else(|| UnknownField(s.to_string()))
    }
}

/// Owned, hashable value of one record field
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Null,
    Integer(u64),
    Text(String),
    Time(DateTime<Utc>),
}

impl FieldValue {
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::HashSet;

    pub(crate) const SAMPLE_RECORDS: [&str; 5] = [
        "2 123456789010 eni-102010ab 198.51.100.1 192.0.2.1 443 49152 6 10 840 1439387263 1439387264 ACCEPT OK",
        "2 123456789010 eni-102010ab 192.0.2.1 198.51.100.1 49152 443 6 20 1680 1439387264 1439387265 ACCEPT OK",
        "2 123456789010 eni-102010cd 192.0.2.1 198.51.100.1 49152 443 6 20 1680 1439387263 1439387266 REJECT OK",
        "2 123456789010 eni-1a2b3c4d - - - - - - - 1431280876 1431280934 - NODATA",
        "2 123456789010 eni-4b118871 - - - - - - - 1431280876 1431280934 - SKIPDATA",
    ];

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn test_parse() {
        let record = FlowRecord::from_message(SAMPLE_RECORDS[0]).unwrap();

        let expected = FlowRecord {
            version: 2,
            account_id: "123456789010".to_string(),
            interface_id: "eni-102010ab".to_string(),
            srcaddr: Some("198.51.100.1".to_string()),
            dstaddr: Some("192.0.2.1".to_string()),
            srcport: Some(443),
            dstport: Some(49152),
            protocol: Some(6),
            packets: Some(10),
            bytes: Some(840),
            start: utc(2015, 8, 12, 13, 47, 43),
            end: utc(2015, 8, 12, 13, 47, 44),
            action: Some(Action::Accept),
            log_status: LogStatus::Ok,
        };
        assert_eq!(record, expected);
    }

    #[test]
    fn test_eq() {
        let record = FlowRecord::from_message(SAMPLE_RECORDS[0]).unwrap();
        let equal = FlowRecord::from_message(SAMPLE_RECORDS[0]).unwrap();
        let unequal = FlowRecord::from_message(SAMPLE_RECORDS[1]).unwrap();

        assert_eq!(record, equal);
        assert_ne!(record, unequal);
    }

    #[test]
    fn test_hash_dedupes() {
        let set: HashSet<FlowRecord> = [0, 0, 1, 1, 2, 2]
            .iter()
            .map(|&i| FlowRecord::from_message(SAMPLE_RECORDS[i]).unwrap())
            .collect();
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn test_display() {
        let record = FlowRecord::from_message(SAMPLE_RECORDS[0]).unwrap();
        assert_eq!(
            record.to_string(),
            "version: 2, account_id: 123456789010, \
             interface_id: eni-102010ab, srcaddr: 198.51.100.1, \
             dstaddr: 192.0.2.1, srcport: 443, dstport: 49152, protocol: 6, \
             packets: 10, bytes: 840, start: 2015-08-12 13:47:43, \
             end: 2015-08-12 13:47:44, action: ACCEPT, log_status: OK"
        );
    }

    #[test]
    fn test_serialize_as_map() {
        let record = FlowRecord::from_message(SAMPLE_RECORDS[2]).unwrap();
        let value = serde_json::to_value(&record).unwrap();

        let map = value.as_object().unwrap();
        assert_eq!(map.len(), FIELD_COUNT);
        for field in FlowField::ALL {
            assert!(map.contains_key(field.as_str()), "missing {}", field);
        }
        assert_eq!(map["action"], "REJECT");
        assert_eq!(map["bytes"], 1680);
        assert_eq!(map["interface_id"], "eni-102010cd");
        assert_eq!(map["start"], "2015-08-12T13:47:43Z");
    }

    #[test]
    fn test_sentinel_serializes_nulls() {
        let record = FlowRecord::from_message(SAMPLE_RECORDS[3]).unwrap();
        let value = serde_json::to_value(&record).unwrap();
        assert!(value["srcaddr"].is_null());
        assert!(value["action"].is_null());
        assert_eq!(value["log_status"], "NODATA");
    }

    #[test]
    fn test_millisecond_timestamp() {
        let line = "2 123456789010 eni-4b118871 - - - - - - - 1512564058000 1512564059000 - SKIPDATA";
        let record = FlowRecord::from_message(line).unwrap();
        assert_eq!(record.start, utc(2017, 12, 6, 12, 40, 58));
        assert_eq!(record.end, utc(2017, 12, 6, 12, 40, 59));
    }

    #[test]
    fn test_epoch_32_max_is_seconds() {
        let line = format!(
            "2 1 eni-1 - - - - - - - {} {} - NODATA",
            EPOCH_32_MAX,
            EPOCH_32_MAX + 1
        );
        let record = FlowRecord::from_message(&line).unwrap();
        assert_eq!(record.start.timestamp(), EPOCH_32_MAX);
        assert_eq!(record.end.timestamp(), (EPOCH_32_MAX + 1) / 1000);
    }

    #[test]
    fn test_to_message() {
        for message in SAMPLE_RECORDS {
            let record = FlowRecord::from_message(message).unwrap();
            assert_eq!(record.to_message(), message);
        }
    }

    #[test]
    fn test_millisecond_line_canonicalizes_to_seconds() {
        let line = "2 123456789010 eni-4b118871 - - - - - - - 1512564058123 1512564059000 - SKIPDATA";
        let record = FlowRecord::from_message(line).unwrap();
        let message = record.to_message();

        assert_eq!(
            message,
            "2 123456789010 eni-4b118871 - - - - - - - 1512564058 1512564059 - SKIPDATA"
        );
        assert_eq!(FlowRecord::from_message(&message).unwrap(), record);
    }

    #[test]
    fn test_zero_values_are_not_placeholders() {
        let line = "2 123456789010 eni-1 10.0.0.1 10.0.0.2 0 0 0 0 0 1439387263 1439387264 ACCEPT OK";
        let record = FlowRecord::from_message(line).unwrap();
        assert_eq!(record.srcport, Some(0));
        assert_eq!(record.packets, Some(0));
        assert_eq!(record.to_message(), line);
    }

    #[test]
    fn test_from_event() {
        let event = LogEvent::new(SAMPLE_RECORDS[1]);
        let from_event = FlowRecord::from_event(&event).unwrap();
        let from_message = FlowRecord::from_message(SAMPLE_RECORDS[1]).unwrap();
        assert_eq!(from_event, from_message);
    }

    #[test]
    fn test_sentinel_forces_null_details() {
        let line = "2 123456789010 eni-1 10.0.0.1 10.0.0.2 80 443 6 1 2 1431280876 1431280934 ACCEPT NODATA";
        let record = FlowRecord::from_message(line).unwrap();

        assert_eq!(record.srcaddr, None);
        assert_eq!(record.dstaddr, None);
        assert_eq!(record.srcport, None);
        assert_eq!(record.dstport, None);
        assert_eq!(record.protocol, None);
        assert_eq!(record.packets, None);
        assert_eq!(record.bytes, None);
        assert_eq!(record.action, None);
        assert_eq!(record.log_status, LogStatus::NoData);
    }

    #[test]
    fn test_wrong_field_count() {
        let err = FlowRecord::from_message("2 123456789010 eni-1 OK").unwrap_err();
        assert!(matches!(err, ReaderError::MalformedRecord { .. }));

        let too_many = format!("{} extra", SAMPLE_RECORDS[0]);
        assert!(FlowRecord::from_message(&too_many).is_err());
        assert!(FlowRecord::from_message("").is_err());
    }

    #[test]
    fn test_non_numeric_integer_field() {
        let line = SAMPLE_RECORDS[0].replace(" 443 ", " https ");
        match FlowRecord::from_message(&line) {
            Err(ReaderError::MalformedRecord { reason, .. }) => {
                assert!(reason.contains("srcport"));
            }
            other => panic!("Expected MalformedRecord, got {:?}", other),
        }

        let line = SAMPLE_RECORDS[0].replacen("2 ", "v2 ", 1);
        assert!(FlowRecord::from_message(&line).is_err());

        let line = SAMPLE_RECORDS[0].replace("1439387263", "soon");
        assert!(FlowRecord::from_message(&line).is_err());
    }

    #[test]
    fn test_unknown_tokens_kept_verbatim() {
        let line = SAMPLE_RECORDS[0].replace("ACCEPT OK", "DROP PARTIAL");
        let record = FlowRecord::from_message(&line).unwrap();
        assert_eq!(record.action, Some(Action::Other("DROP".to_string())));
        assert_eq!(record.log_status, LogStatus::Other("PARTIAL".to_string()));
        assert_eq!(record.to_message(), line);
    }

    #[test]
    fn test_field_names_round_trip() {
        for field in FlowField::ALL {
            assert_eq!(field.as_str().parse::<FlowField>().unwrap(), field);
        }
        assert_eq!(
            "nope".parse::<FlowField>(),
            Err(UnknownField("nope".to_string()))
        );
    }

    #[test]
    fn test_field_values() {
        let record = FlowRecord::from_message(SAMPLE_RECORDS[0]).unwrap();
        assert_eq!(record.field(FlowField::Srcport), FieldValue::Integer(443));
        assert_eq!(
            record.field(FlowField::Srcaddr),
            FieldValue::Text("198.51.100.1".to_string())
        );
        assert_eq!(
            record.field(FlowField::Start),
            FieldValue::Time(utc(2015, 8, 12, 13, 47, 43))
        );

        let sentinel = FlowRecord::from_message(SAMPLE_RECORDS[3]).unwrap();
        assert!(sentinel.field(FlowField::Srcaddr).is_null());
        assert!(sentinel.field(FlowField::Action).is_null());
    }
}
