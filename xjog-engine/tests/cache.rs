mod helpers;

use helpers::{fast_settings, machines::DoorMachine, TestDb};
use sea_orm::{EntityTrait, PaginatorTrait};
use std::sync::Arc;
use xjog_engine::{ChartReference, Engine, Event, MachineOptions};

#[tokio::test]
#[ignore = "Needs database to run"]
async fn chart_cache_stays_bounded() {
    let db = TestDb::new("bounded_cache").await;
    let mut settings = fast_settings();
    settings.machine.cache_size = 10;
    let engine = Engine::new(db.connect().await, settings);
    engine
        .register_machine(Arc::new(DoorMachine), MachineOptions::default())
        .unwrap();
    engine.start().await.unwrap();
    engine.ready().await;

    for i in 0..15 {
        engine
            .create_chart("door", Some(format!("c{i}")))
            .await
            .unwrap();
    }

    assert!(engine.cached_chart_count("door").await.unwrap() <= 10);

    // every chart row persists regardless of cache residency
    let conn = db.connect().await;
    assert_eq!(
        xjog_entity::charts::Entity::find().count(&conn).await.unwrap(),
        15
    );

    // an evicted chart rehydrates from its snapshot and still transitions
    let evicted = ChartReference::new("door", "c0");
    let state = engine
        .send_event(&evicted, Event::new("open"))
        .await
        .unwrap()
        .unwrap();
    assert!(state.matches("open"));

    engine.shutdown().await;
}
