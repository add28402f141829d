mod helpers;

use helpers::{fast_settings, machines::DoorMachine, TestDb};
use sea_orm::{EntityTrait, PaginatorTrait};
use std::sync::Arc;
use xjog_engine::{ChartReference, Engine, Event, MachineOptions};

#[tokio::test]
#[ignore = "Needs database to run"]
async fn door_chart_lifecycle() {
    let db = TestDb::new("door_chart_lifecycle").await;
    let engine = Engine::new(db.connect().await, fast_settings());
    engine
        .register_machine(Arc::new(DoorMachine), MachineOptions::default())
        .unwrap();
    engine.start().await.unwrap();
    engine.ready().await;

    let conn = db.connect().await;
    assert_eq!(
        xjog_engine::repository::instances::count_alive(&conn)
            .await
            .unwrap(),
        1
    );

    let chart = engine
        .create_chart("door", Some("main".to_string()))
        .await
        .unwrap();
    let opened = chart.send(Event::new("open")).await.unwrap().unwrap();
    assert!(opened.matches("open"));

    let reference = ChartReference::new("door", "main");
    let closed = engine
        .send_event(&reference, Event::new("close"))
        .await
        .unwrap()
        .unwrap();
    assert!(closed.matches("closed"));

    // the snapshot survives a round trip through the store
    let persisted = xjog_engine::repository::charts::read(&conn, &reference)
        .await
        .unwrap()
        .unwrap();
    assert!(persisted.state.matches("closed"));

    engine.shutdown().await;
    assert_eq!(
        xjog_entity::instances::Entity::find()
            .count(&conn)
            .await
            .unwrap(),
        0
    );
}

#[tokio::test]
#[ignore = "Needs database to run"]
async fn registration_is_refused_after_start() {
    let db = TestDb::new("registration_refused").await;
    let engine = Engine::new(db.connect().await, fast_settings());
    engine
        .register_machine(Arc::new(DoorMachine), MachineOptions::default())
        .unwrap();
    engine.start().await.unwrap();
    engine.ready().await;

    let refused = engine.register_machine(
        Arc::new(helpers::machines::WalkingMachine),
        MachineOptions::default(),
    );
    assert!(matches!(
        refused,
        Err(xjog_engine::EngineError::RegistrationClosed)
    ));

    engine.shutdown().await;
}

#[tokio::test]
#[ignore = "Needs database to run"]
async fn unknown_events_do_not_transition() {
    let db = TestDb::new("unknown_events").await;
    let engine = Engine::new(db.connect().await, fast_settings());
    engine
        .register_machine(Arc::new(DoorMachine), MachineOptions::default())
        .unwrap();
    engine.start().await.unwrap();
    engine.ready().await;

    let chart = engine.create_chart("door", None).await.unwrap();
    // the evaluator rejects the event; the send reports no transition
    let result = chart.send(Event::new("defenestrate")).await.unwrap();
    assert!(result.is_none());
    assert!(chart.state().await.matches("closed"));

    engine.shutdown().await;
}
