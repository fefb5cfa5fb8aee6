//! Type-directed parameter binding
//!
//! Turns a record's referenced fields into positional [`Param`]s. Parameter
//! `i` (1-based) is bound from field reference `i - 1`.
//!
//! Timestamps are bound as text in [`TIMESTAMP_FORMAT`], never as a native
//! temporal parameter: drivers disagree on how native temporal parameters
//! are interpreted. Precision beyond milliseconds is truncated.

use crate::template;
use crate::types::{FieldValue, Param, Record, TIMESTAMP_FORMAT};

/// Bind every field reference of a template against `record`, in order.
pub fn bind<S: AsRef<str>>(fields: &[S], record: &Record) -> Vec<Param> {
    fields
        .iter()
        .map(|reference| bind_value(reference.as_ref(), record))
        .collect()
}

/// Bind a single field reference.
pub fn bind_value(reference: &str, record: &Record) -> Param {
    match record.value(reference) {
        FieldValue::Timestamp(ts) => Param::Text(ts.format(TIMESTAMP_FORMAT).to_string()),
        FieldValue::Integer(n) => Param::Integer(*n),
        FieldValue::Float(n) => Param::Float(*n),
        FieldValue::Text(s) => Param::Text(s.clone()),
        FieldValue::Boolean(b) => Param::Boolean(*b),
        // computed values such as "%{host}-%{+%Y}" have no field of their own
        FieldValue::Null if template::is_dynamic(reference) => {
            Param::Text(template::sprintf(record, reference).into_owned())
        }
        FieldValue::Null => Param::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDateTime, TimeZone, Utc};

    #[test]
    fn test_bind_dispatch() {
        let ts = Utc.with_ymd_and_hms(2023, 12, 31, 23, 59, 58).unwrap()
            + chrono::Duration::milliseconds(7);
        let record = Record::new()
            .with_field("ts", ts)
            .with_field("n", 5_i64)
            .with_field("f", 2.5)
            .with_field("s", "text")
            .with_field("b", false)
            .with_field("null", None::<i64>)
            .with_field("host", "db");

        let params = bind(
            &["ts", "n", "f", "s", "b", "null", "missing", "%{host}-x"],
            &record,
        );

        assert_eq!(
            params,
            vec![
                Param::Text("2023-12-31 23:59:58.007".into()),
                Param::Integer(5),
                Param::Float(2.5),
                Param::Text("text".into()),
                Param::Boolean(false),
                Param::Null,
                Param::Null,
                Param::Text("db-x".into()),
            ]
        );
    }

    #[test]
    fn test_dynamic_reference_prefers_existing_field() {
        let record = Record::new().with_field("%{odd}", 1_i64);
        assert_eq!(bind_value("%{odd}", &record), Param::Integer(1));
    }

    #[test]
    fn test_timestamp_round_trip_millisecond_precision() {
        let ts = Utc.with_ymd_and_hms(2024, 2, 29, 12, 0, 1).unwrap()
            + chrono::Duration::microseconds(123_456);
        let record = Record::new().with_field("ts", ts);

        let Param::Text(text) = bind_value("ts", &record) else {
            panic!("timestamp must bind as text");
        };
        let parsed = NaiveDateTime::parse_from_str(&text, TIMESTAMP_FORMAT).unwrap();

        // sub-millisecond digits are dropped
        let expected = Utc.with_ymd_and_hms(2024, 2, 29, 12, 0, 1).unwrap()
            + chrono::Duration::milliseconds(123);
        assert_eq!(parsed.and_utc(), expected);
    }
}
