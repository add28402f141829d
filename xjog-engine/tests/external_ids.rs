mod helpers;

use helpers::{fast_settings, machines::DoorMachine, TestDb};
use std::sync::Arc;
use xjog_engine::{ChartReference, Engine, EngineError, MachineOptions};

#[tokio::test]
#[ignore = "Needs database to run"]
async fn external_id_round_trip() {
    let db = TestDb::new("external_ids").await;
    let engine = Engine::new(db.connect().await, fast_settings());
    engine
        .register_machine(Arc::new(DoorMachine), MachineOptions::default())
        .unwrap();
    engine.start().await.unwrap();
    engine.ready().await;

    let reference = ChartReference::new("door", "chart-x");
    engine
        .create_chart("door", Some("chart-x".to_string()))
        .await
        .unwrap();

    engine
        .register_external_id("orderNo", "42", &reference)
        .await
        .unwrap();

    let found = engine
        .get_chart_by_external_id("orderNo", "42")
        .await
        .unwrap()
        .expect("chart must be reachable through its external id");
    assert_eq!(found.reference(), &reference);

    // (key, value) is unique per database
    let other = ChartReference::new("door", "chart-y");
    engine
        .create_chart("door", Some("chart-y".to_string()))
        .await
        .unwrap();
    let conflict = engine.register_external_id("orderNo", "42", &other).await;
    assert!(matches!(conflict, Err(EngineError::Conflict(_))));

    engine.drop_external_id("orderNo", "42").await.unwrap();
    assert!(engine
        .get_chart_by_external_id("orderNo", "42")
        .await
        .unwrap()
        .is_none());

    engine.shutdown().await;
}

#[tokio::test]
#[ignore = "Needs database to run"]
async fn destroying_a_chart_drops_its_external_ids() {
    let db = TestDb::new("external_ids_destroy").await;
    let engine = Engine::new(db.connect().await, fast_settings());
    engine
        .register_machine(Arc::new(DoorMachine), MachineOptions::default())
        .unwrap();
    engine.start().await.unwrap();
    engine.ready().await;

    let reference = ChartReference::new("door", "doomed");
    let chart = engine
        .create_chart("door", Some("doomed".to_string()))
        .await
        .unwrap();
    engine
        .register_external_id("orderNo", "7", &reference)
        .await
        .unwrap();

    chart.destroy().await.unwrap();
    assert!(engine
        .get_chart_by_external_id("orderNo", "7")
        .await
        .unwrap()
        .is_none());

    engine.shutdown().await;
}
