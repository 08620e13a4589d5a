
use std::future::pending;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracking::{
    CloseReason, Config, GeoPoint, PositionRecord, PositionStore, ProximityIndex, RoutePlan,
    Simulator, StreamGateway, SyncService, UpdateSink,
};

use self::provider::{FixedRoutes, MockRecords};

const START: GeoPoint = GeoPoint { lat: 33.7490, lng: -84.3880 };

#[derive(Default)]
struct Collected(Vec<PositionRecord>);

impl UpdateSink for Collected {
    async fn send(&mut self, record: &PositionRecord) -> anyhow::Result<()> {
        self.0.push(record.clone());
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn simulated_unit_flows_through_every_component() {
    let config = Config::default();
    let shutdown = CancellationToken::new();
    let store = PositionStore::new(&config);

    let route = vec![
        GeoPoint { lat: 33.7520, lng: -84.3880 },
        GeoPoint { lat: 33.7520, lng: -84.3840 },
        GeoPoint { lat: 33.7490, lng: -84.3840 },
    ];
    let routes = Arc::new(FixedRoutes(vec![]));
    let simulator = Simulator::new(store.clone(), routes, config.simulator.clone(), &shutdown);
    let gateway = StreamGateway::new(store.fanout().clone(), &shutdown);
    let records = MockRecords::new();
    let sync = SyncService::new(store.clone(), Arc::new(records.clone()), config.sync.clone());

    // a client watching the unit before it exists
    let session = gateway.connect("U1").expect("should connect");
    let session_token = session.cancellation();
    let client = tokio::spawn(async move {
        let mut sink = Collected::default();
        let reason = session.run(&mut sink, pending()).await;
        (reason, sink.0)
    });

    simulator.add("U1", START, RoutePlan::Explicit(route)).await.expect("should add");
    tokio::time::sleep(Duration::from_millis(5500)).await;

    let record = store.get("U1").expect("U1 should be live");
    assert_ne!(record.point(), START, "unit should have moved after 5 ticks");
    assert!((0.0..360.0).contains(&record.heading));

    let index = ProximityIndex::new(store.clone());
    let nearby = index.query(START.lat, START.lng, 5.0).expect("valid query");
    let u1 = nearby.iter().find(|unit| unit.unit_id == "U1").expect("U1 should be nearby");
    assert!(u1.distance_km < 0.2, "U1 is still close to its start: {}", u1.distance_km);

    let report = sync.run_cycle().await;
    assert_eq!(report.succeeded, 1);
    let synced = records.location("U1").expect("U1 should be synced");
    assert!((synced.lat - record.lat).abs() < f64::EPSILON);

    simulator.remove("U1").await.expect("should remove");
    session_token.cancel();
    let (reason, delivered) = client.await.expect("client task");

    assert_eq!(reason, CloseReason::Cancelled);
    assert!(delivered.len() >= 6, "start plus every tick, got {}", delivered.len());
    assert_eq!(delivered[0].point(), START);
    assert_eq!(delivered.last().map(PositionRecord::point), Some(record.point()));
    assert_eq!(gateway.active_sessions(), 0);
}

#[tokio::test]
async fn proximity_radius_is_inclusive_and_exact() {
    let store = PositionStore::new(&Config::default());
    let near = GeoPoint { lat: 33.7499, lng: -84.3880 };
    store.put("near", tracking::Position::at(near));
    store.put("center", tracking::Position::at(START));
    let index = ProximityIndex::new(store);

    let within = index.query(START.lat, START.lng, 0.2).expect("valid query");
    let ids: Vec<&str> = within.iter().map(|unit| unit.unit_id.as_str()).collect();
    assert_eq!(ids, vec!["center", "near"], "closest first");
    assert!(within[0].distance_km.abs() < f64::EPSILON);
    assert!((within[1].distance_km - 0.1).abs() < 0.001);

    let tight = index.query(START.lat, START.lng, 0.05).expect("valid query");
    let ids: Vec<&str> = tight.iter().map(|unit| unit.unit_id.as_str()).collect();
    assert_eq!(ids, vec!["center"]);

    // a unit exactly on the boundary is included
    let boundary = tracking::haversine_km(START, near);
    let edge = index.query(START.lat, START.lng, boundary).expect("valid query");
    assert_eq!(edge.len(), 2);
    assert!((edge[1].distance_km - boundary).abs() < f64::EPSILON);

    let zero = index.query(START.lat, START.lng, 0.0).expect("valid query");
    assert_eq!(zero.len(), 1, "zero radius still matches the centre");

    assert!(index.query(START.lat, START.lng, -1.0).is_err());
    assert!(index.query(f64::NAN, START.lng, 1.0).is_err());
}
