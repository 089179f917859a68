//! Integration tests for batmon-common.

use batmon_common::{
    Format, KeyExprBuilder, TelemetryPoint, TelemetryValue, decode, decode_auto, encode,
    parse_key_expr, sanitize_topic,
};

#[test]
fn test_full_telemetry_workflow() {
    let point = TelemetryPoint::new("house", "current", TelemetryValue::Gauge(-12.5))
        .with_unit("A")
        .with_label("address", "C8:47:8C:00:00:01");

    let json_bytes = encode(&point, Format::Json).expect("JSON encode failed");
    let decoded: TelemetryPoint = decode(&json_bytes, Format::Json).expect("JSON decode failed");
    assert_eq!(decoded.source, "house");
    assert_eq!(decoded.metric, "current");
    assert_eq!(decoded.value, TelemetryValue::Gauge(-12.5));
    assert_eq!(decoded.unit.as_deref(), Some("A"));

    let cbor_bytes = encode(&point, Format::Cbor).expect("CBOR encode failed");
    let auto_decoded: TelemetryPoint = decode_auto(&cbor_bytes).expect("Auto decode failed");
    assert_eq!(auto_decoded.metric, decoded.metric);
}

#[test]
fn test_device_topic_roundtrip() {
    let builder = KeyExprBuilder::new("batmon/bms");
    let topic = sanitize_topic("C8:47:8C:00:00:01");

    let key = builder.build(&topic, "temperatures/2");
    assert_eq!(key, "batmon/bms/C8_47_8C_00_00_01/temperatures/2");

    let parsed = parse_key_expr(builder.prefix(), &key).expect("Parse failed");
    assert_eq!(parsed.device, "C8_47_8C_00_00_01");
    assert_eq!(parsed.field, "temperatures/2");
}

#[test]
fn test_nested_field_paths() {
    let builder = KeyExprBuilder::default();
    let fields = [
        "voltage",
        "cell_voltages/16",
        "cell_voltages/delta",
        "meter/total_energy_discharge",
    ];

    for field in fields {
        let key = builder.build("garage", field);
        let parsed = parse_key_expr(builder.prefix(), &key).unwrap();
        assert_eq!(parsed.device, "garage");
        assert_eq!(parsed.field, field);
    }
}

#[test]
fn test_all_telemetry_value_types() {
    let values = [
        TelemetryValue::Counter(1234),
        TelemetryValue::Gauge(3.312),
        TelemetryValue::Text("charging".to_string()),
        TelemetryValue::Boolean(true),
    ];

    for value in values {
        let point = TelemetryPoint::new("house", "field", value.clone());

        let encoded = encode(&point, Format::Json).unwrap();
        let decoded: TelemetryPoint = decode(&encoded, Format::Json).unwrap();
        assert_eq!(decoded.value, value);

        let encoded = encode(&point, Format::Cbor).unwrap();
        let decoded: TelemetryPoint = decode(&encoded, Format::Cbor).unwrap();
        assert_eq!(decoded.value, value);
    }
}
