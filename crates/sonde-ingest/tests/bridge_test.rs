//! Bridge behaviour: materialisation on first sighting, FOI routing, and
//! the bus-to-store pipeline.

use std::sync::Arc;
use std::time::Duration;

use sonde_bus::EventBus;
use sonde_datastore::filter::{DataStreamFilter, ObsFilter};
use sonde_datastore::{DatabaseConfig, ObsDatabase};
use sonde_ingest::{IngestBridge, IngestError, ProducerOutput};
use sonde_types::{
    topics, DataBlock, DataComponent, DataEvent, FeatureDesc, FieldValue, FoiEvent, HubEvent,
    RecordEncoding, ScalarComponent, ScalarType, SystemDesc, Timestamp, DEF_PHENOMENON_TIME,
};

fn open_db(dir: &tempfile::TempDir) -> Arc<ObsDatabase> {
    let config = DatabaseConfig {
        storage_path: dir.path().join("obs.db").to_str().unwrap().to_string(),
        ..DatabaseConfig::default()
    };
    Arc::new(ObsDatabase::open(&config).expect("open database"))
}

fn timed_schema() -> DataComponent {
    DataComponent::Record {
        name: "sample".to_string(),
        fields: vec![
            DataComponent::Scalar(ScalarComponent {
                name: "time".to_string(),
                scalar_type: ScalarType::Time,
                definition: Some(DEF_PHENOMENON_TIME.to_string()),
                uom: None,
                label: None,
            }),
            DataComponent::Scalar(ScalarComponent {
                name: "value".to_string(),
                scalar_type: ScalarType::Quantity,
                definition: None,
                uom: None,
                label: None,
            }),
        ],
    }
}

fn untimed_schema() -> DataComponent {
    DataComponent::Scalar(ScalarComponent {
        name: "value".to_string(),
        scalar_type: ScalarType::Quantity,
        definition: None,
        uom: None,
        label: None,
    })
}

fn data_event(uid: &str, output: &str, schema: DataComponent, records: Vec<DataBlock>) -> DataEvent {
    DataEvent {
        timestamp: Timestamp(50_000),
        system_uid: uid.to_string(),
        output_name: output.to_string(),
        schema: Some(schema),
        foi_uid: None,
        records,
    }
}

#[tokio::test]
async fn first_data_event_materialises_system_and_stream() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(&dir);
    let bridge = IngestBridge::new(Arc::clone(&db), EventBus::new());

    let event = data_event(
        "urn:sonde:sys:auto",
        "out",
        untimed_schema(),
        vec![DataBlock(vec![FieldValue::Float(1.0)])],
    );
    assert_eq!(bridge.handle_data_event(&event).unwrap(), 1);

    let sys_id = db
        .systems()
        .uid_to_id("urn:sonde:sys:auto")
        .unwrap()
        .expect("system created on first sighting");
    let (ds, _) = db
        .data_streams()
        .latest_for_output(sys_id, "out")
        .unwrap()
        .expect("stream created from event schema");

    let filter =
        ObsFilter::default().with_data_streams(DataStreamFilter::default().with_internal_ids([ds]));
    assert_eq!(db.observations().count_matching(&filter).unwrap(), 1);
}

#[tokio::test]
async fn phenomenon_time_comes_from_the_time_leaf() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(&dir);
    let bridge = IngestBridge::new(Arc::clone(&db), EventBus::new());

    let event = data_event(
        "urn:sonde:sys:timed",
        "out",
        timed_schema(),
        vec![DataBlock(vec![
            FieldValue::Int(12_345),
            FieldValue::Float(9.9),
        ])],
    );
    bridge.handle_data_event(&event).unwrap();

    let entries: Vec<_> = db
        .observations()
        .select_entries(&ObsFilter::default())
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(entries[0].0.phenomenon_time, Timestamp(12_345));
}

#[tokio::test]
async fn records_without_time_leaf_use_the_event_timestamp() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(&dir);
    let bridge = IngestBridge::new(Arc::clone(&db), EventBus::new());

    let event = data_event(
        "urn:sonde:sys:fallbk",
        "out",
        untimed_schema(),
        vec![DataBlock(vec![FieldValue::Float(2.0)])],
    );
    bridge.handle_data_event(&event).unwrap();

    let entries: Vec<_> = db
        .observations()
        .select_entries(&ObsFilter::default())
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(entries[0].0.phenomenon_time, Timestamp(50_000));
}

#[tokio::test]
async fn unknown_foi_rejects_the_event_only() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(&dir);
    let bridge = IngestBridge::new(Arc::clone(&db), EventBus::new());

    let mut bad = data_event(
        "urn:sonde:sys:foi",
        "out",
        untimed_schema(),
        vec![DataBlock(vec![FieldValue::Float(1.0)])],
    );
    bad.foi_uid = Some("urn:sonde:foi:ghost".to_string());
    let err = bridge.handle_data_event(&bad).unwrap_err();
    assert!(matches!(err, IngestError::UnknownFoi(_)));
    assert_eq!(db.observations().count_matching(&ObsFilter::default()).unwrap(), 0);

    // A later valid event on the same stream still lands.
    let good = data_event(
        "urn:sonde:sys:foi",
        "out",
        untimed_schema(),
        vec![DataBlock(vec![FieldValue::Float(2.0)])],
    );
    bridge.handle_data_event(&good).unwrap();
    assert_eq!(db.observations().count_matching(&ObsFilter::default()).unwrap(), 1);
}

#[tokio::test]
async fn foi_events_set_the_inherited_current_foi() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(&dir);
    let bridge = IngestBridge::new(Arc::clone(&db), EventBus::new());

    bridge
        .handle_foi_event(&FoiEvent {
            timestamp: Timestamp(1),
            system_uid: "urn:sonde:sys:uav".to_string(),
            foi: FeatureDesc::new("urn:sonde:foi:field-7", "field 7"),
        })
        .unwrap();
    let foi_id = db
        .fois()
        .uid_to_id("urn:sonde:foi:field-7")
        .unwrap()
        .expect("FOI upserted");

    let event = data_event(
        "urn:sonde:sys:uav",
        "out",
        untimed_schema(),
        vec![DataBlock(vec![FieldValue::Float(3.0)])],
    );
    bridge.handle_data_event(&event).unwrap();

    let entries: Vec<_> = db
        .observations()
        .select_entries(&ObsFilter::default())
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(entries[0].1.foi_id, foi_id);
}

#[tokio::test]
async fn record_arity_mismatch_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(&dir);
    let bridge = IngestBridge::new(Arc::clone(&db), EventBus::new());

    let event = data_event(
        "urn:sonde:sys:arity",
        "out",
        timed_schema(),
        vec![DataBlock(vec![FieldValue::Float(1.0)])],
    );
    let err = bridge.handle_data_event(&event).unwrap_err();
    assert!(matches!(err, IngestError::RecordArity { got: 1, expected: 2 }));
}

#[tokio::test]
async fn registered_producer_drains_the_bus_into_the_store() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(&dir);
    let bus = EventBus::new();
    let bridge = IngestBridge::new(Arc::clone(&db), bus.clone());

    let handle = bridge
        .register_producer(
            SystemDesc::new("urn:sonde:sys:live", "live station"),
            vec![ProducerOutput {
                name: "out".to_string(),
                schema: untimed_schema(),
                encoding: RecordEncoding::Json,
            }],
        )
        .unwrap();

    bus.publish(
        &topics::data_stream("urn:sonde:sys:live", "out"),
        HubEvent::Data(data_event(
            "urn:sonde:sys:live",
            "out",
            untimed_schema(),
            vec![DataBlock(vec![FieldValue::Float(7.0)])],
        )),
    );

    // Delivery is asynchronous; poll until the observation lands.
    let mut stored = 0;
    for _ in 0..100 {
        stored = db.observations().count_matching(&ObsFilter::default()).unwrap();
        if stored == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(stored, 1);

    handle.stop().await;
    assert_eq!(
        bus.subscriber_count(&topics::data_stream("urn:sonde:sys:live", "out")),
        0
    );
}
