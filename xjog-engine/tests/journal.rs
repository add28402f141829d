mod helpers;

use futures::StreamExt;
use helpers::{fast_settings, machines::WalkingMachine, TestDb};
use sea_orm::{EntityTrait, PaginatorTrait};
use serde_json::json;
use std::{sync::Arc, time::Duration};
use xjog_engine::{ChartReference, Engine, Event, JournalQuery, MachineOptions};

#[tokio::test]
#[ignore = "Needs database to run"]
async fn journal_keeps_backward_deltas() {
    let db = TestDb::new("journal_walk").await;
    let engine = Engine::new(db.connect().await, fast_settings());
    engine
        .register_machine(Arc::new(WalkingMachine), MachineOptions::default())
        .unwrap();
    engine.start().await.unwrap();
    engine.ready().await;

    let reference = ChartReference::new("walking-around", "stroll");
    engine
        .create_chart("walking-around", Some("stroll".to_string()))
        .await
        .unwrap();
    for event in ["go to park", "go to diner", "go to park", "go home"] {
        engine
            .send_event(&reference, Event::new(event))
            .await
            .unwrap()
            .unwrap();
    }

    // one init entry plus one per event, ids strictly increasing
    let entries = engine
        .journal()
        .query_entries(&JournalQuery::for_chart(reference.clone()))
        .await
        .unwrap();
    assert_eq!(entries.len(), 5);
    for pair in entries.windows(2) {
        assert!(pair[0].id < pair[1].id);
    }

    // a single snapshot row holding the final state
    let conn = db.connect().await;
    assert_eq!(
        xjog_entity::full_journal_states::Entity::find()
            .count(&conn)
            .await
            .unwrap(),
        1
    );
    let full = engine
        .journal()
        .read_full_state(&reference)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(full.value, json!("at home"));
    assert_eq!(full.id, entries.last().unwrap().id);

    // walking the deltas back from the snapshot reaches the initial state
    let mut value = full.value.clone();
    for entry in entries.iter().skip(1).rev() {
        json_patch::patch(&mut value, &entry.state_delta).unwrap();
    }
    assert_eq!(value, json!("at home"));

    // time travel lands on the state as of each entry
    let at_diner = engine
        .journal()
        .read_merged_entry(entries[2].id)
        .await
        .unwrap();
    assert_eq!(at_diner.value, json!("at the diner"));
    let at_start = engine
        .journal()
        .read_merged_entry(entries[0].id)
        .await
        .unwrap();
    assert_eq!(at_start.value, json!("at home"));

    engine.shutdown().await;
}

#[tokio::test]
#[ignore = "Needs database to run"]
async fn subscription_streams_see_new_entries_in_order() {
    let db = TestDb::new("journal_stream").await;
    let engine = Engine::new(db.connect().await, fast_settings());
    engine
        .register_machine(Arc::new(WalkingMachine), MachineOptions::default())
        .unwrap();
    engine.start().await.unwrap();
    engine.ready().await;

    let reference = ChartReference::new("walking-around", "observed");
    let mut entries = engine
        .journal()
        .new_journal_entries(JournalQuery::for_chart(reference.clone()));

    // collect from the stream before producing, so the subscription's
    // high-water mark seeds ahead of the first entry
    let collector = tokio::spawn(async move {
        let mut seen = Vec::new();
        while seen.len() < 3 {
            match entries.next().await {
                Some(Ok(entry)) => seen.push(entry.id),
                other => panic!("subscription ended unexpectedly: {other:?}"),
            }
        }
        seen
    });
    tokio::time::sleep(Duration::from_millis(200)).await;

    engine
        .create_chart("walking-around", Some("observed".to_string()))
        .await
        .unwrap();
    engine
        .send_event(&reference, Event::new("go to park"))
        .await
        .unwrap();
    engine
        .send_event(&reference, Event::new("go home"))
        .await
        .unwrap();

    let seen = tokio::time::timeout(Duration::from_secs(3), collector)
        .await
        .expect("subscription timed out")
        .unwrap();
    assert_eq!(seen.len(), 3);
    for pair in seen.windows(2) {
        assert!(pair[0] < pair[1], "subscription must be in id order");
    }

    engine.shutdown().await;
}
