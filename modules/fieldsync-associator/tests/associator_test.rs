//! Temporal association over in-memory stores.

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use fieldsync_associator::{
    handle_image_created, AssociationStore, Associator, AssociatorError, BusNotifier, Candidate,
    MatchMethod, MemoryAssociationStore, MemoryCandidateStore, MemoryProbeStore, Outcome, Probe,
    ProbeRef,
};
use fieldsync_mover::MemoryPublisher;
use serde_json::{json, Value};

fn at(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).unwrap()
}

fn probe(id: i64, ms: i64) -> Probe {
    Probe {
        probe_id: id,
        time: at(ms),
        tenant_id: "farm-a".into(),
        sensor_id: None,
        station_id: Some("st-1".into()),
    }
}

fn weight(id: i64, ms: i64, value: f64) -> Candidate {
    Candidate {
        id,
        time: at(ms),
        tenant_id: "farm-a".into(),
        sensor_id: Some("scale-1".into()),
        metric: "weight".into(),
        value_num: Some(value),
    }
}

struct Harness {
    probes: Arc<MemoryProbeStore>,
    readings: Arc<MemoryCandidateStore>,
    associations: Arc<MemoryAssociationStore>,
    associator: Associator,
}

fn harness() -> Harness {
    let probes = Arc::new(MemoryProbeStore::new());
    let readings = Arc::new(MemoryCandidateStore::new());
    let associations = Arc::new(MemoryAssociationStore::new());
    let associator = Associator::new(
        probes.clone(),
        readings.clone(),
        associations.clone(),
        vec!["weight".into(), "mass".into()],
        5_000,
    );
    Harness {
        probes,
        readings,
        associations,
        associator,
    }
}

fn matched(outcome: &Outcome) -> (i64, i32, bool) {
    match outcome {
        Outcome::Matched { recorded, .. } => (
            recorded.association.matched_id,
            recorded.association.delta_ms,
            recorded.created,
        ),
        Outcome::Unmatched => panic!("expected a match"),
    }
}

// =========================================================================
// Matching
// =========================================================================

#[tokio::test]
async fn candidate_outside_window_is_ignored() {
    let h = harness();
    h.readings.insert(weight(1, 400, 3.0));
    h.readings.insert(weight(2, 1_400, 3.1));

    let outcome = h
        .associator
        .associate(&probe(10, 1_000), Duration::milliseconds(500))
        .await
        .unwrap();
    assert_eq!(matched(&outcome), (2, 400, true));
    let association = outcome.association().unwrap();
    assert_eq!(association.method, MatchMethod::Nearest);
    assert_eq!(association.confidence, None);
}

#[tokio::test]
async fn nearest_inside_window_wins() {
    let h = harness();
    h.readings.insert(weight(1, 700, 3.0));
    h.readings.insert(weight(2, 1_400, 3.1));

    let outcome = h
        .associator
        .associate(&probe(10, 1_000), Duration::milliseconds(500))
        .await
        .unwrap();
    assert_eq!(matched(&outcome), (1, 300, true));
}

#[tokio::test]
async fn window_edges_are_inclusive() {
    let h = harness();
    h.readings.insert(weight(1, 1_500, 3.0));

    let outcome = h
        .associator
        .associate(&probe(10, 1_000), Duration::milliseconds(500))
        .await
        .unwrap();
    assert_eq!(matched(&outcome), (1, 500, true));
}

#[tokio::test]
async fn no_candidate_records_nothing() {
    let h = harness();
    h.readings.insert(weight(1, 9_000, 3.0));

    let outcome = h
        .associator
        .associate(&probe(10, 1_000), Duration::milliseconds(500))
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::Unmatched);
    assert!(h.associations.all().is_empty());
}

#[tokio::test]
async fn equidistant_candidates_resolve_deterministically() {
    for _ in 0..5 {
        let h = harness();
        h.readings.insert(weight(9, 1_250, 3.0));
        h.readings.insert(weight(3, 750, 3.1));

        let outcome = h
            .associator
            .associate(&probe(10, 1_000), Duration::milliseconds(500))
            .await
            .unwrap();
        assert_eq!(matched(&outcome), (3, 250, true));
    }
}

#[tokio::test]
async fn tenant_sensor_and_metric_must_match() {
    let h = harness();
    let mut other_tenant = weight(1, 1_000, 1.0);
    other_tenant.tenant_id = "farm-b".into();
    let mut other_sensor = weight(2, 1_010, 2.0);
    other_sensor.sensor_id = Some("scale-2".into());
    let mut humidity = weight(3, 1_000, 55.0);
    humidity.metric = "humidity".into();
    let mut mass = weight(4, 1_100, 4.0);
    mass.metric = "mass".into();
    for c in [other_tenant, other_sensor, humidity, mass] {
        h.readings.insert(c);
    }

    let mut p = probe(10, 1_000);
    p.sensor_id = Some("scale-1".into());
    let outcome = h
        .associator
        .associate(&p, Duration::milliseconds(500))
        .await
        .unwrap();
    assert_eq!(matched(&outcome), (4, 100, true));

    // Without a sensor the closer scale-2 reading is eligible.
    let outcome = h
        .associator
        .associate(&probe(11, 1_000), Duration::milliseconds(500))
        .await
        .unwrap();
    assert_eq!(matched(&outcome), (2, 10, true));
}

// =========================================================================
// Idempotence
// =========================================================================

#[tokio::test]
async fn resolving_twice_yields_one_identical_record() {
    let h = harness();
    h.readings.insert(weight(1, 900, 3.0));
    let p = probe(10, 1_000);
    let window = Duration::milliseconds(500);

    let first = h.associator.associate(&p, window).await.unwrap();
    let second = h.associator.associate(&p, window).await.unwrap();

    assert_eq!(first.association(), second.association());
    assert_eq!(matched(&second), (1, 100, false));
    assert_eq!(h.associations.all().len(), 1);
}

#[tokio::test]
async fn replay_keeps_original_match_when_closer_reading_lands() {
    let h = harness();
    h.readings.insert(weight(1, 1_300, 3.0));
    let p = probe(10, 1_000);
    let window = Duration::milliseconds(500);
    h.associator.associate(&p, window).await.unwrap();

    h.readings.insert(weight(2, 1_001, 3.2));
    let replay = h.associator.associate(&p, window).await.unwrap();
    assert_eq!(matched(&replay), (1, 300, false));
    match replay {
        Outcome::Matched { reading, .. } => assert_eq!(reading.unwrap().id, 1),
        Outcome::Unmatched => unreachable!(),
    }
}

#[tokio::test]
async fn concurrent_duplicates_record_once() {
    let h = harness();
    h.readings.insert(weight(1, 950, 3.0));
    h.readings.insert(weight(2, 1_200, 3.0));
    let associator = Arc::new(h.associator);

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let associator = associator.clone();
            tokio::spawn(async move {
                associator
                    .associate(&probe(10, 1_000), Duration::milliseconds(500))
                    .await
            })
        })
        .collect();

    let mut created = 0;
    for task in tasks {
        let outcome = task.await.unwrap().unwrap();
        let (reading, delta, was_created) = matched(&outcome);
        assert_eq!((reading, delta), (1, 50));
        created += usize::from(was_created);
    }
    assert_eq!(created, 1);
    assert_eq!(h.associations.all().len(), 1);
}

// =========================================================================
// Probe references and windows
// =========================================================================

#[tokio::test]
async fn associate_ref_validates_window_override() {
    let h = harness();
    h.probes.insert(probe(10, 1_000));
    h.readings.insert(weight(1, 1_080, 3.0));

    for bad in [0, 99, 60_001] {
        let err = h
            .associator
            .associate_ref(&ProbeRef::MediaId(10), Some(bad))
            .await
            .unwrap_err();
        assert!(matches!(err, AssociatorError::InvalidWindow(ms) if ms == bad));
    }

    let outcome = h
        .associator
        .associate_ref(&ProbeRef::MediaId(10), Some(100))
        .await
        .unwrap();
    assert_eq!(matched(&outcome), (1, 80, true));
}

#[tokio::test]
async fn associate_ref_by_object_key() {
    let h = harness();
    h.probes
        .insert_object(probe(42, 1_000), "images", "farm-a/cam/0042.jpg");
    h.readings.insert(weight(7, 3_000, 3.0));

    let by_key = ProbeRef::Object {
        bucket: "images".into(),
        object_key: "farm-a/cam/0042.jpg".into(),
    };
    let outcome = h.associator.associate_ref(&by_key, None).await.unwrap();
    assert_eq!(outcome.association().unwrap().probe_id, 42);
    assert_eq!(matched(&outcome), (7, 2_000, true));

    let missing = ProbeRef::Object {
        bucket: "images".into(),
        object_key: "nope.jpg".into(),
    };
    assert!(matches!(
        h.associator.associate_ref(&missing, None).await,
        Err(AssociatorError::ProbeNotFound(_))
    ));
}

#[tokio::test]
async fn list_recent_is_newest_first_and_clamped() {
    let h = harness();
    for i in 0..3 {
        h.readings.insert(weight(100 + i, 10_000 * i + 10, 1.0));
        h.associator
            .associate(&probe(i, 10_000 * i), Duration::milliseconds(500))
            .await
            .unwrap();
    }

    let recent = h.associations.list_recent(0).await.unwrap();
    assert_eq!(recent.len(), 1);
    assert_eq!(recent[0].probe_id, 2);

    let all = h.associations.list_recent(500).await.unwrap();
    let ids: Vec<_> = all.iter().map(|a| a.probe_id).collect();
    assert_eq!(ids, vec![2, 1, 0]);
}

// =========================================================================
// image.created handling
// =========================================================================

fn image_created(media_id: i64, ms: i64) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "event": "image.created",
        "media_id": media_id,
        "time": at(ms).to_rfc3339(),
        "tenant_id": "farm-a",
        "bucket": "images",
        "object_key": format!("farm-a/{media_id}.jpg"),
        "station_id": "st-1"
    }))
    .unwrap()
}

#[tokio::test]
async fn image_created_publishes_weight_associated() {
    let h = harness();
    h.probes.insert(probe(10, 1_000));
    h.readings.insert(weight(1, 1_200, 3.25));
    let publisher = Arc::new(MemoryPublisher::new());
    let notifier = BusNotifier::new(publisher.clone(), "weight.associated");

    let outcome = handle_image_created(&h.associator, &notifier, &image_created(10, 1_000))
        .await
        .unwrap();
    assert_eq!(matched(&outcome), (1, 200, true));

    let messages = publisher.on_topic("weight.associated");
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].key, "farm-a");
    let body: Value = serde_json::from_str(&messages[0].value).unwrap();
    assert_eq!(body["event"], "weight.associated");
    assert_eq!(body["media_id"], 10);
    assert_eq!(body["reading_id"], 1);
    assert_eq!(body["delta_ms"], 200);
    assert_eq!(body["weight"], 3.25);
}

#[tokio::test]
async fn unstored_media_falls_back_to_event_fields() {
    let h = harness();
    h.readings.insert(weight(1, 2_100, 3.0));
    let publisher = Arc::new(MemoryPublisher::new());
    let notifier = BusNotifier::new(publisher.clone(), "weight.associated");

    let outcome = handle_image_created(&h.associator, &notifier, &image_created(77, 2_000))
        .await
        .unwrap();
    assert_eq!(outcome.association().unwrap().probe_id, 77);
}

#[tokio::test]
async fn notification_failure_keeps_association() {
    let h = harness();
    h.probes.insert(probe(10, 1_000));
    h.readings.insert(weight(1, 1_200, 3.0));
    let publisher = Arc::new(MemoryPublisher::new());
    let notifier = BusNotifier::new(publisher.clone(), "weight.associated");

    publisher.fail_publishes(true);
    let outcome = handle_image_created(&h.associator, &notifier, &image_created(10, 1_000))
        .await
        .unwrap();
    assert_eq!(matched(&outcome), (1, 200, true));
    assert_eq!(h.associations.all().len(), 1);

    // Redelivery of the event re-announces the same pairing.
    publisher.fail_publishes(false);
    let replay = handle_image_created(&h.associator, &notifier, &image_created(10, 1_000))
        .await
        .unwrap();
    assert_eq!(matched(&replay), (1, 200, false));
    assert_eq!(publisher.messages().len(), 1);
    assert_eq!(h.associations.all().len(), 1);
}

#[tokio::test]
async fn unmatched_image_publishes_nothing() {
    let h = harness();
    h.probes.insert(probe(10, 1_000));
    let publisher = Arc::new(MemoryPublisher::new());
    let notifier = BusNotifier::new(publisher.clone(), "weight.associated");

    let outcome = handle_image_created(&h.associator, &notifier, &image_created(10, 1_000))
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::Unmatched);
    assert!(publisher.messages().is_empty());
}

#[tokio::test]
async fn malformed_payload_is_rejected() {
    let h = harness();
    let notifier = BusNotifier::new(MemoryPublisher::new(), "weight.associated");
    let err = handle_image_created(&h.associator, &notifier, b"not json")
        .await
        .unwrap_err();
    assert!(matches!(err, AssociatorError::InvalidEvent(_)));
}

#[tokio::test]
async fn time_at_the_edge_of_the_calendar_is_rejected() {
    let h = harness();
    let publisher = Arc::new(MemoryPublisher::new());
    let notifier = BusNotifier::new(publisher.clone(), "weight.associated");
    let payload = serde_json::to_vec(&json!({
        "media_id": 1,
        "time": "+262142-12-31T23:59:59.999Z",
        "tenant_id": "farm-a",
        "bucket": "b",
        "object_key": "k"
    }))
    .unwrap();

    let err = handle_image_created(&h.associator, &notifier, &payload)
        .await
        .unwrap_err();
    assert!(matches!(err, AssociatorError::InvalidEvent(_)));
    assert!(publisher.messages().is_empty());
    assert!(h.associations.all().is_empty());

    let mut earliest = probe(2, 0);
    earliest.time = DateTime::<Utc>::MIN_UTC;
    let err = h
        .associator
        .associate(&earliest, Duration::milliseconds(5_000))
        .await
        .unwrap_err();
    assert!(matches!(err, AssociatorError::InvalidEvent(_)));
}
