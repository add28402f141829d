mod helpers;

use helpers::{fast_settings, machines::RestlessMachine, TestDb};
use serde_json::json;
use std::{sync::Arc, time::Duration};
use xjog_engine::{ChartReference, Engine, Event, MachineOptions};

#[tokio::test]
#[ignore = "Needs database to run"]
async fn deferred_transition_fires_on_schedule() {
    let db = TestDb::new("deferred_transition").await;
    let engine = Engine::new(db.connect().await, fast_settings());
    engine
        .register_machine(Arc::new(RestlessMachine), MachineOptions::default())
        .unwrap();
    engine.start().await.unwrap();
    engine.ready().await;

    let chart = engine
        .create_chart("restless", Some("r1".to_string()))
        .await
        .unwrap();
    let working = chart.send(Event::new("getRestless")).await.unwrap().unwrap();
    assert!(working.matches("working"));

    // exactly one persisted timer while the delay runs
    let conn = db.connect().await;
    let reference = ChartReference::new("restless", "r1");
    assert_eq!(
        xjog_engine::repository::deferred_events::count_for_chart(&conn, &reference)
            .await
            .unwrap(),
        1
    );

    crate::wait_until!(
        "deferred transition to fire",
        Duration::from_secs(2),
        chart.state().await.matches("home")
    );

    let state = chart.state().await;
    assert_eq!(state.context, json!({"goodWeather": false}));

    // the fired event removed its row
    crate::wait_until!(
        "fired row to be deleted",
        Duration::from_secs(2),
        xjog_engine::repository::deferred_events::count_for_chart(&conn, &reference)
            .await
            .unwrap()
            == 0
    );

    engine.shutdown().await;
}

#[tokio::test]
#[ignore = "Needs database to run"]
async fn cancelled_events_do_not_fire() {
    let db = TestDb::new("deferred_cancel").await;
    let engine = Engine::new(db.connect().await, fast_settings());
    engine
        .register_machine(Arc::new(RestlessMachine), MachineOptions::default())
        .unwrap();
    engine.start().await.unwrap();
    engine.ready().await;

    let chart = engine
        .create_chart("restless", Some("r2".to_string()))
        .await
        .unwrap();
    chart.send(Event::new("getRestless")).await.unwrap();

    // destroying the chart cancels its pending timers with it
    chart.destroy().await.unwrap();

    let conn = db.connect().await;
    let reference = ChartReference::new("restless", "r2");
    assert_eq!(
        xjog_engine::repository::deferred_events::count_for_chart(&conn, &reference)
            .await
            .unwrap(),
        0
    );

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(engine.get_chart(&reference).await.unwrap().is_none());

    engine.shutdown().await;
}
