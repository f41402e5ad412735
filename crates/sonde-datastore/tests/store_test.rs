//! End-to-end scenarios over one database file: feature versioning,
//! stream registration, observation scans, and maintenance.

use sonde_datastore::filter::{
    DataStreamFilter, FoiFilter, ObsFilter, SystemFilter, TemporalFilter,
};
use sonde_datastore::{DatabaseConfig, ObsDatabase, RegisterOutcome, StreamUpdate};
use sonde_types::{
    DataBlock, DataComponent, DataStreamInfo, FeatureDesc, FieldValue, ObsData, RecordEncoding,
    ScalarComponent, ScalarType, SystemDesc, Timestamp,
};

fn open_db(dir: &tempfile::TempDir) -> ObsDatabase {
    let config = DatabaseConfig {
        storage_path: dir.path().join("obs.db").to_str().unwrap().to_string(),
        ..DatabaseConfig::default()
    };
    ObsDatabase::open(&config).expect("open database")
}

fn scalar(name: &str, t: ScalarType) -> DataComponent {
    DataComponent::Scalar(ScalarComponent {
        name: name.to_string(),
        scalar_type: t,
        definition: None,
        uom: None,
        label: None,
    })
}

fn weather_schema() -> DataComponent {
    DataComponent::Record {
        name: "weather".to_string(),
        fields: vec![scalar("temp", ScalarType::Quantity)],
    }
}

/// Registers a system and one output; returns (system id, stream id).
fn register_weather(db: &ObsDatabase, uid: &str) -> (i64, i64) {
    let key = db
        .systems()
        .add(SystemDesc::new(uid, "weather station"))
        .expect("add system");
    let reg = db
        .data_streams()
        .register_output(key.internal_id, "weather", weather_schema(), RecordEncoding::Json)
        .expect("register output");
    assert_eq!(reg.outcome, RegisterOutcome::Created);
    (key.internal_id, reg.stream_id)
}

fn sample(ds: i64, t: i64, value: f64) -> ObsData {
    ObsData::new(ds, Timestamp(t), DataBlock(vec![FieldValue::Float(value)]))
}

#[test]
fn add_observation_and_read_it_back() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(&dir);
    let (_, ds) = register_weather(&db, "urn:sonde:sys:w1");

    let key = db.observations().add(sample(ds, 1_000, 3.14)).unwrap();
    let stored = db.observations().get(key).unwrap().expect("stored obs");
    assert_eq!(stored.result.0, vec![FieldValue::Float(3.14)]);

    let filter = ObsFilter::default()
        .with_data_streams(DataStreamFilter::default().with_internal_ids([ds]))
        .with_limit(10);
    let results: Vec<_> = db
        .observations()
        .select_entries(&filter)
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].1.result.0, vec![FieldValue::Float(3.14)]);
}

#[test]
fn phenomenon_time_range_scan_is_ascending() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(&dir);
    let (_, ds) = register_weather(&db, "urn:sonde:sys:w2");

    // Inserted out of order; scans re-sort by key.
    for (t, v) in [(2_000, 2.0), (1_000, 1.0), (3_000, 3.0)] {
        db.observations().add(sample(ds, t, v)).unwrap();
    }

    let filter = ObsFilter::default()
        .with_phenomenon_time(TemporalFilter::range(Timestamp(1_000), Timestamp(2_000)));
    let times: Vec<i64> = db
        .observations()
        .select_entries(&filter)
        .unwrap()
        .map(|r| r.unwrap().0.phenomenon_time.millis())
        .collect();
    assert_eq!(times, vec![1_000, 2_000]);
}

#[test]
fn same_slot_write_is_last_write_wins() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(&dir);
    let (_, ds) = register_weather(&db, "urn:sonde:sys:w3");

    let k1 = db.observations().add(sample(ds, 500, 1.0)).unwrap();
    let k2 = db.observations().add(sample(ds, 500, 2.0)).unwrap();
    assert_eq!(k1, k2, "same series and phenomenon time share one slot");

    assert_eq!(db.observations().count_matching(&ObsFilter::default()).unwrap(), 1);
    let stored = db.observations().get(k1).unwrap().unwrap();
    assert_eq!(stored.result.0, vec![FieldValue::Float(2.0)]);
}

#[test]
fn observations_split_into_series_per_foi() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(&dir);
    let (_, ds) = register_weather(&db, "urn:sonde:sys:w4");

    let foi = db
        .fois()
        .add(FeatureDesc::new("urn:sonde:foi:river", "river"))
        .unwrap();

    let k1 = db.observations().add(sample(ds, 100, 1.0)).unwrap();
    let k2 = db
        .observations()
        .add(sample(ds, 200, 2.0).with_foi(foi.internal_id))
        .unwrap();
    assert_ne!(k1.series_id, k2.series_id);

    // FOI-constrained scan sees only its series.
    let filter = ObsFilter::default()
        .with_fois(FoiFilter::default().with_internal_ids([foi.internal_id]));
    let hits: Vec<_> = db
        .observations()
        .select_entries(&filter)
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].0.series_id, k2.series_id);
}

#[test]
fn time_ordered_scan_merges_series() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(&dir);
    let (_, ds) = register_weather(&db, "urn:sonde:sys:w5");
    let foi = db
        .fois()
        .add(FeatureDesc::new("urn:sonde:foi:lake", "lake"))
        .unwrap();

    db.observations().add(sample(ds, 100, 1.0)).unwrap();
    db.observations().add(sample(ds, 300, 3.0)).unwrap();
    db.observations()
        .add(sample(ds, 200, 2.0).with_foi(foi.internal_id))
        .unwrap();

    let times: Vec<i64> = db
        .observations()
        .select_entries_time_ordered(&ObsFilter::default())
        .unwrap()
        .map(|r| r.unwrap().0.phenomenon_time.millis())
        .collect();
    assert_eq!(times, vec![100, 200, 300]);
}

#[test]
fn select_and_count_agree() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(&dir);
    let (_, ds) = register_weather(&db, "urn:sonde:sys:w6");
    for t in 0..25 {
        db.observations().add(sample(ds, t * 10, t as f64)).unwrap();
    }

    let filter = ObsFilter::default()
        .with_phenomenon_time(TemporalFilter::range(Timestamp(50), Timestamp(170)));
    let selected = db
        .observations()
        .select_entries(&filter)
        .unwrap()
        .count() as u64;
    assert_eq!(selected, db.observations().count_matching(&filter).unwrap());
    assert_eq!(selected, 13);
}

#[test]
fn feature_version_resolution_follows_wall_clock() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(&dir);

    let t0 = Timestamp(1_000);
    let t1 = Timestamp(2_000);

    let mut v0 = SystemDesc::new("urn:sonde:sys:ver", "station v0");
    v0.feature.valid_time = Some(t0);
    let key0 = db.systems().add(v0).unwrap();

    let mut v1 = SystemDesc::new("urn:sonde:sys:ver", "station v1");
    v1.feature.valid_time = Some(t1);
    let key1 = db.systems().add_version(v1).unwrap();
    assert_eq!(key0.internal_id, key1.internal_id);

    // Wall clock is far past t1: the t1 version is current.
    let (current_key, current) = db
        .systems()
        .current_version(key0.internal_id)
        .unwrap()
        .expect("has current version");
    assert_eq!(current_key.valid_time, t1);
    assert_eq!(current.feature.name, "station v1");

    let history = db.systems().history(key0.internal_id).unwrap();
    assert_eq!(history.len(), 2);
    assert!(history[0].0.valid_time < history[1].0.valid_time);
}

#[test]
fn uid_collision_at_overlapping_valid_time_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(&dir);

    db.systems()
        .add(SystemDesc::new("urn:sonde:sys:dup", "one"))
        .unwrap();
    let err = db
        .systems()
        .add(SystemDesc::new("urn:sonde:sys:dup", "two"))
        .unwrap_err();
    assert!(matches!(
        err,
        sonde_datastore::DatastoreError::AlreadyExists(_)
    ));
}

#[test]
fn short_uid_and_empty_name_are_invalid() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(&dir);

    let err = db.systems().add(SystemDesc::new("urn:x", "ok")).unwrap_err();
    assert!(matches!(err, sonde_datastore::DatastoreError::InvalidRequest(_)));

    let err = db
        .systems()
        .add(SystemDesc::new("urn:sonde:sys:ok", "  "))
        .unwrap_err();
    assert!(matches!(err, sonde_datastore::DatastoreError::InvalidRequest(_)));
}

#[test]
fn incompatible_schema_starts_a_new_stream_version() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(&dir);
    let (sys, old_ds) = register_weather(&db, "urn:sonde:sys:v");

    db.observations().add(sample(old_ds, 100, 1.0)).unwrap();

    // Same shape with a unit attached: refined in place.
    let refined = DataComponent::Record {
        name: "weather".to_string(),
        fields: vec![DataComponent::Scalar(ScalarComponent {
            name: "temp".to_string(),
            scalar_type: ScalarType::Quantity,
            definition: None,
            uom: Some("Cel".to_string()),
            label: None,
        })],
    };
    let reg = db
        .data_streams()
        .register_output(sys, "weather", refined, RecordEncoding::Json)
        .unwrap();
    assert_eq!(reg.stream_id, old_ds);
    assert_eq!(reg.outcome, RegisterOutcome::Updated);

    // Extra field: incompatible, new identity.
    let incompatible = DataComponent::Record {
        name: "weather".to_string(),
        fields: vec![
            scalar("temp", ScalarType::Quantity),
            scalar("humidity", ScalarType::Quantity),
        ],
    };
    let reg = db
        .data_streams()
        .register_output(sys, "weather", incompatible, RecordEncoding::Json)
        .unwrap();
    let new_ds = reg.stream_id;
    assert_ne!(new_ds, old_ds);
    assert_eq!(reg.outcome, RegisterOutcome::NewVersion { previous: old_ds });

    // The old stream keeps its identity and its observations.
    assert!(db.data_streams().get(old_ds).unwrap().is_some());
    let old_scan = ObsFilter::default()
        .with_data_streams(DataStreamFilter::default().with_internal_ids([old_ds]));
    assert_eq!(db.observations().count_matching(&old_scan).unwrap(), 1);

    let new_scan = ObsFilter::default()
        .with_data_streams(DataStreamFilter::default().with_internal_ids([new_ds]));
    assert_eq!(db.observations().count_matching(&new_scan).unwrap(), 0);
}

#[test]
fn identical_registration_is_a_noop() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(&dir);
    let (sys, ds) = register_weather(&db, "urn:sonde:sys:noop");

    let reg = db
        .data_streams()
        .register_output(sys, "weather", weather_schema(), RecordEncoding::Json)
        .unwrap();
    assert_eq!(reg.stream_id, ds);
    assert_eq!(reg.outcome, RegisterOutcome::Unchanged);
}

#[test]
fn stream_time_ranges_grow_monotonically() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(&dir);
    let (_, ds) = register_weather(&db, "urn:sonde:sys:rng");

    db.observations().add(sample(ds, 2_000, 1.0)).unwrap();
    db.observations().add(sample(ds, 1_000, 2.0)).unwrap();
    db.observations().add(sample(ds, 3_000, 3.0)).unwrap();

    let info = db.data_streams().get(ds).unwrap().unwrap();
    let observed = info.observed_time_range.expect("observed range");
    assert_eq!(observed.begin, Timestamp(1_000));
    assert_eq!(observed.end, Timestamp(3_000));
}

#[test]
fn system_filters_compose_with_datastreams() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(&dir);
    let (sys_a, _) = register_weather(&db, "urn:sonde:sys:wa");
    // A system without any stream.
    db.systems()
        .add(SystemDesc::new("urn:sonde:sys:bare", "bare"))
        .unwrap();

    let filter = SystemFilter::default().with_data_streams(DataStreamFilter::default());
    let matched: Vec<_> = db
        .systems()
        .select_entries(&filter)
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(matched.len(), 1);
    assert_eq!(matched[0].0.internal_id, sys_a);
}

#[test]
fn remove_entries_returns_removed_count() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(&dir);
    let (_, ds) = register_weather(&db, "urn:sonde:sys:rm");
    for t in 0..5 {
        db.observations().add(sample(ds, t * 100, 0.0)).unwrap();
    }

    let victim = ObsFilter::default()
        .with_phenomenon_time(TemporalFilter::range(Timestamp(0), Timestamp(199)));
    assert_eq!(db.observations().remove_entries(&victim).unwrap(), 2);
    assert_eq!(db.observations().count_matching(&ObsFilter::default()).unwrap(), 3);
}

#[test]
fn purge_removes_old_observations_and_empty_series() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(&dir);
    let (_, ds) = register_weather(&db, "urn:sonde:sys:purge");
    for t in [100, 200, 5_000] {
        db.observations().add(sample(ds, t, 0.0)).unwrap();
    }

    let removed = db.purge_observations_before(Timestamp(1_000)).unwrap();
    assert_eq!(removed, 2);
    assert_eq!(db.observations().count_matching(&ObsFilter::default()).unwrap(), 1);
}

#[test]
fn read_only_database_rejects_writes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("obs.db").to_str().unwrap().to_string();
    {
        let db = ObsDatabase::open(&DatabaseConfig {
            storage_path: path.clone(),
            ..DatabaseConfig::default()
        })
        .unwrap();
        register_weather(&db, "urn:sonde:sys:ro");
        db.commit().unwrap();
    }

    let ro = ObsDatabase::open(&DatabaseConfig {
        storage_path: path,
        read_only: true,
        ..DatabaseConfig::default()
    })
    .unwrap();
    assert!(ro.is_read_only());

    let err = ro
        .systems()
        .add(SystemDesc::new("urn:sonde:sys:ro2", "nope"))
        .unwrap_err();
    assert!(matches!(err, sonde_datastore::DatastoreError::ReadOnly));

    // Reads still work.
    let n = ro
        .systems()
        .count_matching(&SystemFilter::default())
        .unwrap();
    assert_eq!(n, 1);
}

#[test]
fn latest_version_filter_selects_one_per_system() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(&dir);

    let mut v0 = SystemDesc::new("urn:sonde:sys:lv", "v0");
    v0.feature.valid_time = Some(Timestamp(1_000));
    db.systems().add(v0).unwrap();
    let mut v1 = SystemDesc::new("urn:sonde:sys:lv", "v1");
    v1.feature.valid_time = Some(Timestamp(2_000));
    db.systems().add_version(v1).unwrap();

    let all = SystemFilter::default();
    assert_eq!(db.systems().count_matching(&all).unwrap(), 2);

    let latest = SystemFilter::default().with_valid_time(TemporalFilter::LatestVersion);
    let entries: Vec<_> = db
        .systems()
        .select_entries(&latest)
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].1.feature.name, "v1");
}

#[test]
fn transaction_rolls_back_on_error() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(&dir);

    let result: Result<(), _> = db.execute_transaction(|tx| {
        tx.add_system(SystemDesc::new("urn:sonde:sys:tx", "tx probe"))?;
        Err(sonde_datastore::DatastoreError::InvalidRequest(
            "forced failure".to_string(),
        ))
    });
    assert!(result.is_err());

    assert_eq!(
        db.systems().uid_to_id("urn:sonde:sys:tx").unwrap(),
        None,
        "failed transaction must leave no trace"
    );
}

#[test]
fn datastream_info_survives_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(&dir);
    let (sys, _) = register_weather(&db, "urn:sonde:sys:rt");

    let mut info = DataStreamInfo::new(sys, "status", weather_schema());
    info.record_encoding = RecordEncoding::Text;
    let id = db.data_streams().add(info.clone()).unwrap();
    let stored = db.data_streams().get(id).unwrap().unwrap();
    assert_eq!(stored.output_name, "status");
    assert_eq!(stored.record_encoding, RecordEncoding::Text);
    assert_eq!(stored.record_schema, info.record_schema);
}

#[test]
fn metadata_only_update_keeps_identity() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(&dir);
    let (_, ds) = register_weather(&db, "urn:sonde:sys:upd");

    let mut info = db.data_streams().get(ds).unwrap().unwrap();
    info.record_encoding = RecordEncoding::Text;
    let outcome = db.data_streams().update(ds, info).unwrap();
    assert_eq!(outcome, StreamUpdate::Updated);
    assert_eq!(
        db.data_streams().get(ds).unwrap().unwrap().record_encoding,
        RecordEncoding::Text
    );
}
