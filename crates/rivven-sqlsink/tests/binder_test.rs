//! Tests for parameter binding and failure classification

use chrono::{DateTime, NaiveDateTime, TimeZone, Timelike, Utc};
use rivven_sqlsink::binder::{bind, bind_value};
use rivven_sqlsink::classify::{FATAL_SQLSTATES, IGNORABLE_SQLSTATES};
use rivven_sqlsink::prelude::*;
use rivven_sqlsink::types::TIMESTAMP_FORMAT;

// ==================== Binder Tests ====================

#[test]
fn test_timestamp_round_trip_keeps_milliseconds() {
    let ts = Utc.with_ymd_and_hms(2024, 2, 29, 13, 45, 12).unwrap()
        + chrono::Duration::microseconds(123_987);
    let record = Record::new().with_field(TIMESTAMP_FIELD, ts);

    let Param::Text(text) = bind_value(TIMESTAMP_FIELD, &record) else {
        panic!("timestamps bind as text");
    };
    assert_eq!(text, "2024-02-29 13:45:12.123");

    let parsed = NaiveDateTime::parse_from_str(&text, TIMESTAMP_FORMAT).unwrap();
    assert_eq!(parsed.and_utc().timestamp(), ts.timestamp());
    assert_eq!(parsed.nanosecond(), 123_000_000);
}

#[test]
fn test_bind_json_record() {
    let record = Record::from_json_str(
        r#"{"@timestamp":"2024-01-01T00:00:00.5Z","host":"web-1","status":200,"latency":0.25,"cached":true,"user":null,"tags":["a","b"]}"#,
    )
    .unwrap();

    let params = bind(
        &["@timestamp", "host", "status", "latency", "cached", "user", "tags", "absent"],
        &record,
    );

    assert_eq!(
        params,
        vec![
            Param::Text("2024-01-01 00:00:00.500".into()),
            Param::Text("web-1".into()),
            Param::Integer(200),
            Param::Float(0.25),
            Param::Boolean(true),
            Param::Null,
            Param::Text(r#"["a","b"]"#.into()),
            Param::Null,
        ]
    );
}

#[test]
fn test_computed_reference_is_expanded() {
    let ts: DateTime<Utc> = Utc.with_ymd_and_hms(2023, 7, 4, 9, 0, 0).unwrap();
    let record = Record::new()
        .with_field(TIMESTAMP_FIELD, ts)
        .with_field("host", "db-2");

    assert_eq!(
        bind_value("%{host}-%{+%Y.%m}", &record),
        Param::Text("db-2-2023.07".into())
    );
    assert_eq!(
        bind_value("%{missing}", &record),
        Param::Text("%{missing}".into())
    );
}

// ==================== Classification Tests ====================

#[test]
fn test_code_tables() {
    for code in IGNORABLE_SQLSTATES {
        assert_eq!(Classification::for_sqlstate(code), Classification::Ignorable, "{}", code);
    }
    for code in FATAL_SQLSTATES {
        assert_eq!(Classification::for_sqlstate(code), Classification::Fatal, "{}", code);
    }
    for code in ["40001", "40P01", "08006", "57P01", "53300", "42P01", "XX000"] {
        assert_eq!(Classification::for_sqlstate(code), Classification::Retryable, "{}", code);
    }
}

#[test]
fn test_classify_keeps_cause() {
    let err = Error::Store(
        StoreError::new("23503", "insert violates foreign key")
            .with_vendor_code(7)
            .with_chained(StoreError::new("23503", "key (org_id)=(9) is not present")),
    );

    match classify(err) {
        Verdict::Fatal(cause) => {
            assert_eq!(cause.vendor_code, 7);
            assert_eq!(cause.chain().len(), 2);
        }
        other => panic!("expected fatal, got {:?}", other),
    }
}

#[test]
fn test_non_store_errors_are_retryable() {
    for err in [
        Error::connection("connection refused"),
        Error::timeout("statement timed out"),
        Error::statement("driver failed"),
        Error::PoolExhausted {
            message: "timeout waiting for connection".into(),
        },
    ] {
        let category = err.category();
        match classify(err) {
            Verdict::Retryable(cause) => assert_eq!(cause.category(), category),
            other => panic!("expected retryable, got {:?}", other),
        }
    }
}

#[test]
fn test_classification_uses_top_level_sqlstate() {
    let err = Error::Store(
        StoreError::new("40001", "batch aborted")
            .with_chained(StoreError::new("23505", "duplicate key")),
    );
    assert_eq!(classify(err).classification(), Classification::Retryable);
}
