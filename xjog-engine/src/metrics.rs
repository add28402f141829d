use lazy_static::lazy_static;
use prometheus::{register_int_counter, register_int_counter_vec, IntCounter, IntCounterVec};

lazy_static! {
    pub static ref TRANSITIONS_TOTAL: IntCounter = register_int_counter!(
        "xjog_transitions_total",
        "total number of chart transitions applied and persisted",
    )
    .unwrap();
    pub static ref DEFERRED_EVENTS_DELIVERED: IntCounter = register_int_counter!(
        "xjog_deferred_events_delivered_total",
        "number of deferred events fired and delivered by this instance",
    )
    .unwrap();
    pub static ref CHARTS_ADOPTED: IntCounterVec = register_int_counter_vec!(
        "xjog_charts_adopted_total",
        "number of charts adopted from other instances, by adoption mode",
        &["mode"],
    )
    .unwrap();
}
