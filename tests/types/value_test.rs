use lumbung::types::value::{DataType, Value};

#[test]
fn test_value_data_types() {
    assert_eq!(Value::Null.data_type(), DataType::Null);
    assert_eq!(Value::Integer(42).data_type(), DataType::Integer);
    assert_eq!(Value::Real(3.5).data_type(), DataType::Real);
    assert_eq!(Value::Text("hello".to_string()).data_type(), DataType::Text);
    assert_eq!(Value::Blob(vec![1, 2, 3]).data_type(), DataType::Blob);
}

#[test]
fn test_null_passes_through_every_coercion() {
    for target in [
        DataType::Null,
        DataType::Integer,
        DataType::Real,
        DataType::Text,
        DataType::Blob,
    ] {
        assert_eq!(Value::Null.coerce(target).unwrap(), Value::Null);
    }
}

#[test]
fn test_real_to_integer_truncates_toward_zero() {
    assert_eq!(
        Value::Real(3.7).coerce(DataType::Integer).unwrap(),
        Value::Integer(3)
    );
    assert_eq!(
        Value::Real(-3.7).coerce(DataType::Integer).unwrap(),
        Value::Integer(-3)
    );
    assert!(Value::Real(f64::INFINITY).coerce(DataType::Integer).is_err());
    assert!(Value::Real(f64::NAN).coerce(DataType::Integer).is_err());
    assert!(Value::Real(1e19).coerce(DataType::Integer).is_err());
}

#[test]
fn test_text_parses_leading_numeric_prefix() {
    assert_eq!(
        Value::Text("12abc".to_string())
            .coerce(DataType::Integer)
            .unwrap(),
        Value::Integer(12)
    );
    assert_eq!(
        Value::Text("-7".to_string())
            .coerce(DataType::Integer)
            .unwrap(),
        Value::Integer(-7)
    );
    assert_eq!(
        Value::Text("2.5xyz".to_string())
            .coerce(DataType::Real)
            .unwrap(),
        Value::Real(2.5)
    );
    assert!(Value::Text("abc".to_string()).coerce(DataType::Integer).is_err());
    assert!(Value::Text("".to_string()).coerce(DataType::Real).is_err());
}

#[test]
fn test_blob_coercions() {
    assert_eq!(
        Value::Blob(b"hello".to_vec()).coerce(DataType::Text).unwrap(),
        Value::Text("hello".to_string())
    );
    assert!(Value::Blob(vec![0xff, 0xfe]).coerce(DataType::Text).is_err());
    assert!(Value::Blob(vec![1]).coerce(DataType::Integer).is_err());
    assert_eq!(
        Value::Text("ab".to_string()).coerce(DataType::Blob).unwrap(),
        Value::Blob(b"ab".to_vec())
    );
}

#[test]
fn test_key_ordering_across_types() {
    use std::cmp::Ordering;
    // Null < numerics < text < blob
    assert_eq!(Value::Null.key_cmp(&Value::Integer(i64::MIN)), Ordering::Less);
    assert_eq!(
        Value::Integer(i64::MAX).key_cmp(&Value::Text(String::new())),
        Ordering::Less
    );
    assert_eq!(
        Value::Text("zzz".to_string()).key_cmp(&Value::Blob(vec![])),
        Ordering::Less
    );
    // Cross-numeric comparison is numeric, not typed
    assert_eq!(Value::Integer(5).key_cmp(&Value::Real(5.5)), Ordering::Less);
    assert_eq!(Value::Real(6.0).key_cmp(&Value::Integer(5)), Ordering::Greater);
    assert_eq!(Value::Integer(5).key_cmp(&Value::Real(5.0)), Ordering::Equal);
    // Text is byte order
    assert_eq!(
        Value::Text("apple".to_string()).key_cmp(&Value::Text("banana".to_string())),
        Ordering::Less
    );
    // key_cmp equates across numeric types; equality stays strict, so the
    // two relations are deliberately distinct
    assert_ne!(Value::Integer(5), Value::Real(5.0));
    assert_eq!(Value::Real(f64::NAN).key_cmp(&Value::Real(f64::NAN)), Ordering::Equal);
    assert_ne!(Value::Real(f64::NAN), Value::Real(f64::NAN));
}

#[test]
fn test_value_codec_round_trip() {
    let values = vec![
        Value::Null,
        Value::Integer(-1),
        Value::Integer(i64::MAX),
        Value::Real(2.718281828),
        Value::Text("hello world".to_string()),
        Value::Text(String::new()),
        Value::Blob(vec![0, 1, 2, 254, 255]),
    ];
    for value in values {
        let bytes = value.to_bytes();
        assert_eq!(bytes.len(), value.serialized_size());
        let (decoded, consumed) = Value::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, value);
        assert_eq!(consumed, bytes.len());
    }
}

#[test]
fn test_truncated_value_bytes_rejected() {
    let bytes = Value::Text("longer than nothing".to_string()).to_bytes();
    assert!(Value::from_bytes(&bytes[..bytes.len() - 1]).is_err());
    assert!(Value::from_bytes(&[]).is_err());
    assert!(Value::from_bytes(&[9]).is_err());
}

#[test]
fn test_real_text_rendering_survives_round_trip() {
    let rendered = Value::Real(4.0).render_text();
    assert!(
        rendered.contains('.') || rendered.contains('e'),
        "real rendering {:?} must carry a decimal point or exponent",
        rendered
    );
    assert_eq!(
        Value::Text(rendered).coerce(DataType::Real).unwrap(),
        Value::Real(4.0)
    );
}
