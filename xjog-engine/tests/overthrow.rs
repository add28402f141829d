mod helpers;

use helpers::{fast_settings, machines::DoorMachine, TestDb};
use sea_orm::EntityTrait;
use std::sync::Arc;
use xjog_engine::{Engine, MachineOptions};

#[tokio::test]
#[ignore = "Needs database to run"]
async fn newer_instance_overthrows_older() {
    let db = TestDb::new("overthrow").await;

    let a = Engine::new(db.connect().await, fast_settings());
    a.register_machine(Arc::new(DoorMachine), MachineOptions::default())
        .unwrap();
    a.start().await.unwrap();
    a.ready().await;
    a.create_chart("door", Some("c".to_string())).await.unwrap();

    let b = Engine::new(db.connect().await, fast_settings());
    b.register_machine(Arc::new(DoorMachine), MachineOptions::default())
        .unwrap();
    b.start().await.unwrap();

    // both instances registered, the older one flagged dying by the
    // overthrow transaction
    let conn = db.connect().await;
    let rows = xjog_entity::instances::Entity::find()
        .all(&conn)
        .await
        .unwrap();
    assert_eq!(rows.len(), 2);
    for row in &rows {
        if row.instance_id == a.instance_id() {
            assert!(row.dying, "overthrown instance must be dying");
        } else if row.instance_id == b.instance_id() {
            assert!(!row.dying, "overthrowing instance must be live");
        } else {
            panic!("unexpected instance row {}", row.instance_id);
        }
    }

    b.ready().await;
    // the death note reaches A, which drains and halts
    a.halted().await;

    let rows = xjog_entity::instances::Entity::find()
        .all(&conn)
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].instance_id, b.instance_id());

    let chart = xjog_entity::charts::Entity::find_by_id(("door".to_string(), "c".to_string()))
        .one(&conn)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(chart.owner_id, b.instance_id());
    assert!(!chart.paused);

    b.shutdown().await;
}
