mod helpers;

use helpers::{fast_settings, machines::StubbornWorkerMachine, TestDb};
use sea_orm::EntityTrait;
use std::{sync::Arc, time::Duration};
use xjog_engine::{ChartReference, Engine, Event, MachineOptions};

#[tokio::test]
#[ignore = "Needs database to run"]
async fn busy_charts_are_adopted_forcibly_after_grace() {
    let db = TestDb::new("forcible_adoption").await;

    // the old instance must not notice its death note during the test
    // window, so the takeover is decided by the grace period alone
    let mut settings_a = fast_settings();
    settings_a.startup.death_note_polling_frequency = Duration::from_secs(60);
    let a = Engine::new(db.connect().await, settings_a);
    a.register_machine(Arc::new(StubbornWorkerMachine), MachineOptions::default())
        .unwrap();
    a.start().await.unwrap();
    a.ready().await;

    let reference = ChartReference::new("stubborn-worker", "w1");
    let chart = a
        .create_chart("stubborn-worker", Some("w1".to_string()))
        .await
        .unwrap();
    let working = chart.send(Event::new("begin")).await.unwrap().unwrap();
    assert!(working.matches("working"));

    let conn = db.connect().await;
    crate::wait_until!(
        "activity marker to appear",
        Duration::from_secs(2),
        xjog_engine::repository::activities::count_for_chart(&conn, &reference)
            .await
            .unwrap()
            == 1
    );

    let b = Engine::new(db.connect().await, fast_settings());
    b.register_machine(Arc::new(StubbornWorkerMachine), MachineOptions::default())
        .unwrap();
    b.start().await.unwrap();

    let a_row = xjog_entity::instances::Entity::find_by_id(a.instance_id())
        .one(&conn)
        .await
        .unwrap()
        .unwrap();
    assert!(a_row.dying);

    // within the grace period the activity marker blocks gentle adoption
    tokio::time::sleep(Duration::from_millis(150)).await;
    let chart_row =
        xjog_entity::charts::Entity::find_by_id(("stubborn-worker".to_string(), "w1".to_string()))
            .one(&conn)
            .await
            .unwrap()
            .unwrap();
    assert!(chart_row.paused, "gentle adoption must skip busy charts");

    // grace expiry wipes the marker and takes the chart by force
    b.ready().await;
    let chart_row =
        xjog_entity::charts::Entity::find_by_id(("stubborn-worker".to_string(), "w1".to_string()))
            .one(&conn)
            .await
            .unwrap()
            .unwrap();
    assert_eq!(chart_row.owner_id, b.instance_id());
    assert!(!chart_row.paused);

    // the adopted chart re-runs its step, restarting the activity under the
    // new instance
    crate::wait_until!(
        "activity to restart",
        Duration::from_secs(2),
        xjog_engine::repository::activities::count_for_chart(&conn, &reference)
            .await
            .unwrap()
            == 1
    );

    b.shutdown().await;
    drop(a);
}
