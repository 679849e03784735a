use pvars::serialize::{Reader, Writer};
use pvars::types::ScalarType;
use pvars::{BitSet, FieldBuilder, FieldRef, FieldRegistry, PVField};
use tracing::{info, level_filters::LevelFilter};
use tracing_subscriber::fmt::TestWriter;

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(LevelFilter::DEBUG)
        .with_writer(TestWriter::new())
        .try_init();
}

/// The record schema a temperature monitor would publish
fn monitor_record() -> FieldRef {
    let mut builder = FieldBuilder::new();
    builder
        .set_id("epics:nt/NTScalar:1.0")
        .add("value", ScalarType::Double)
        .unwrap()
        .add_nested_structure("alarm")
        .set_id("alarm_t")
        .add("severity", ScalarType::Int)
        .unwrap()
        .add("status", ScalarType::Int)
        .unwrap()
        .add("message", ScalarType::String)
        .unwrap()
        .end_nested()
        .unwrap()
        .add_nested_structure("timeStamp")
        .set_id("time_t")
        .add("secondsPastEpoch", ScalarType::Long)
        .unwrap()
        .add("nanoseconds", ScalarType::UInt)
        .unwrap()
        .end_nested()
        .unwrap()
        .create_structure()
        .unwrap()
        .into_field()
}

/// Serialize a schema-plus-value message the way a get response travels
fn send_full(
    registry: &mut FieldRegistry,
    field: &FieldRef,
    value: &PVField,
) -> Vec<u8> {
    let mut writer = Writer::new(Vec::new());
    registry.serialize_field(field, &mut writer).unwrap();
    value.serialize(&mut writer).unwrap();
    writer.into_sink().unwrap()
}

/// Decode a schema-plus-value message into a fresh value tree
fn receive_full(registry: &mut FieldRegistry, message: &[u8]) -> PVField {
    let mut reader = Reader::new(message);
    let field = registry
        .deserialize_field(&mut reader)
        .unwrap()
        .expect("expected a field description");
    let mut pv = PVField::new(field);
    pv.deserialize(&mut reader).unwrap();
    assert_eq!(reader.remaining(), 0, "trailing bytes in message");
    pv
}

#[test]
fn get_responses_share_schema_via_cache() {
    init_logging();
    let field = monitor_record();
    let mut server_registry = FieldRegistry::with_limit(64);
    let mut client_registry = FieldRegistry::with_limit(64);

    let mut pv = PVField::new(field.clone());
    pv.get_sub_field_mut("value").unwrap().put_double(291.5);
    pv.get_sub_field_path_mut("alarm.message")
        .unwrap()
        .put_string("NO_ALARM".into());
    pv.get_sub_field_path_mut("timeStamp.secondsPastEpoch")
        .unwrap()
        .put_long(1_754_400_000);

    let first = send_full(&mut server_registry, &field, &pv);
    let received = receive_full(&mut client_registry, &first);
    assert_eq!(received, pv);

    // A second response for the same channel reuses the cached schema and
    // must come out strictly smaller on the wire
    pv.get_sub_field_mut("value").unwrap().put_double(292.0);
    let second = send_full(&mut server_registry, &field, &pv);
    assert!(second.len() < first.len());
    info!(
        "full message {} bytes, cached message {} bytes",
        first.len(),
        second.len()
    );
    let received = receive_full(&mut client_registry, &second);
    assert_eq!(received.get_sub_field("value").unwrap().get_double(), Some(292.0));
}

#[test]
fn monitor_deltas_touch_only_changed_fields() {
    init_logging();
    let field = monitor_record();
    let mut source = PVField::new(field.clone());
    let mut replica = PVField::new(field);

    // First update: the value and the alarm severity change
    source.get_sub_field_mut("value").unwrap().put_double(3.25);
    source
        .get_sub_field_path_mut("alarm.severity")
        .unwrap()
        .put_int(1);
    let mut changed = BitSet::new();
    changed.set(source.get_sub_field("value").unwrap().offset());
    changed.set(source.get_sub_field_path("alarm.severity").unwrap().offset());

    let mut writer = Writer::new(Vec::new());
    changed.serialize(&mut writer).unwrap();
    source.serialize_with_bitset(&mut writer, &changed).unwrap();
    let message = writer.into_sink().unwrap();

    let mut reader = Reader::new(&message);
    let mask = BitSet::deserialize(&mut reader).unwrap();
    replica.deserialize_with_bitset(&mut reader, &mask).unwrap();
    assert_eq!(reader.remaining(), 0);

    assert_eq!(replica.get_sub_field("value").unwrap().get_double(), Some(3.25));
    assert_eq!(
        replica.get_sub_field_path("alarm.severity").unwrap().get_int(),
        Some(1)
    );
    // Untouched fields keep their defaults
    assert_eq!(
        replica.get_sub_field_path("alarm.message").unwrap().get_string(),
        Some(String::new())
    );
    assert_eq!(
        replica
            .get_sub_field_path("timeStamp.secondsPastEpoch")
            .unwrap()
            .get_long(),
        Some(0)
    );
}

#[test]
fn overrun_mask_accumulates_skipped_updates() {
    init_logging();
    let field = monitor_record();
    let source = PVField::new(field);

    let value_offset = source.get_sub_field("value").unwrap().offset();
    let severity_offset = source.get_sub_field_path("alarm.severity").unwrap().offset();
    let seconds_offset = source
        .get_sub_field_path("timeStamp.secondsPastEpoch")
        .unwrap()
        .offset();

    // A slow consumer drops two updates; the overrun mask it reports is the
    // union of everything it never saw
    let first_change: BitSet = [value_offset, severity_offset].into_iter().collect();
    let second_change: BitSet = [value_offset, seconds_offset].into_iter().collect();
    let mut overrun = BitSet::new();
    overrun.or(&first_change);
    overrun.or(&second_change);

    let expected: BitSet = [value_offset, severity_offset, seconds_offset]
        .into_iter()
        .collect();
    assert_eq!(overrun, expected);
    assert_eq!(overrun.cardinality(), 3);
}

#[test]
fn whole_structure_bit_replaces_subtree() {
    init_logging();
    let field = monitor_record();
    let mut source = PVField::new(field.clone());
    source
        .get_sub_field_path_mut("alarm.severity")
        .unwrap()
        .put_int(2);
    source
        .get_sub_field_path_mut("alarm.status")
        .unwrap()
        .put_int(3);
    source
        .get_sub_field_path_mut("alarm.message")
        .unwrap()
        .put_string("HIHI".into());

    let alarm_offset = source.get_sub_field("alarm").unwrap().offset();
    let changed: BitSet = [alarm_offset].into_iter().collect();

    let mut writer = Writer::new(Vec::new());
    source.serialize_with_bitset(&mut writer, &changed).unwrap();
    let message = writer.into_sink().unwrap();

    let mut replica = PVField::new(field);
    replica
        .deserialize_with_bitset(&mut Reader::new(&message), &changed)
        .unwrap();
    assert_eq!(
        replica.get_sub_field("alarm").unwrap(),
        source.get_sub_field("alarm").unwrap()
    );
    assert_eq!(replica.get_sub_field("value").unwrap().get_double(), Some(0.0));
}

#[test]
fn distinct_schemas_get_distinct_cache_ids() {
    init_logging();
    let mut server_registry = FieldRegistry::with_limit(64);
    let mut client_registry = FieldRegistry::with_limit(64);

    let record = monitor_record();
    let mut builder = FieldBuilder::new();
    let other: FieldRef = builder
        .set_id("epics:nt/NTEnum:1.0")
        .add("index", ScalarType::Int)
        .unwrap()
        .add_array("choices", ScalarType::String)
        .unwrap()
        .create_structure()
        .unwrap()
        .into_field();

    for field in [&record, &other, &record, &other] {
        let pv = PVField::new(field.clone());
        let message = send_full(&mut server_registry, field, &pv);
        let received = receive_full(&mut client_registry, &message);
        assert_eq!(received.field(), field);
    }
    assert_eq!(client_registry.len(), 2);
}
