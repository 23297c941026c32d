//! Integration tests for undo/redo through the public bus API.

use daq_pubsub::prelude::*;
use daq_pubsub::pubsub::{REDO_TOPIC, UNDO_TOPIC};
use serde_json::json;

const GAIN: &str = "scope/gain";

fn bus() -> PubSub {
    let mut bus = PubSub::new();
    bus.topic_add(GAIN, Metadata::new(Dtype::U8).with_default(0), false)
        .expect("topic_add");
    bus
}

#[test]
fn test_undo_and_redo_sequence() {
    let mut bus = bus();
    let values = [3, 5, 8, 13];
    for v in values {
        bus.publish(GAIN, v).unwrap();
    }

    let mut undone = Vec::new();
    for _ in 0..values.len() {
        assert!(bus.undo().unwrap());
        undone.push(bus.query(GAIN).unwrap());
    }
    assert_eq!(undone, vec![json!(8), json!(5), json!(3), json!(0)]);
    assert!(!bus.undo().unwrap());

    let mut redone = Vec::new();
    for _ in 0..values.len() {
        assert!(bus.redo().unwrap());
        redone.push(bus.query(GAIN).unwrap());
    }
    assert_eq!(redone, vec![json!(3), json!(5), json!(8), json!(13)]);
    assert!(!bus.redo().unwrap());
}

#[test]
fn test_new_publish_clears_redo() {
    let mut bus = bus();
    bus.publish(GAIN, 1).unwrap();
    bus.publish(GAIN, 2).unwrap();
    bus.undo().unwrap();
    assert!(bus.undo_engine().can_redo());

    bus.publish(GAIN, 9).unwrap();
    assert!(!bus.undo_engine().can_redo());
    bus.undo().unwrap();
    assert_eq!(bus.query(GAIN).unwrap(), json!(1));
}

#[test]
fn test_explicit_group_is_atomic() {
    let mut bus = bus();
    bus.topic_add("scope/offset", Metadata::new(Dtype::I16).with_default(0), false)
        .unwrap();

    bus.command_group_start();
    bus.publish(GAIN, 4).unwrap();
    bus.publish("scope/offset", -20).unwrap();
    bus.command_group_end();

    bus.undo().unwrap();
    assert_eq!(bus.query(GAIN).unwrap(), json!(0));
    assert_eq!(bus.query("scope/offset").unwrap(), json!(0));

    bus.redo().unwrap();
    assert_eq!(bus.query(GAIN).unwrap(), json!(4));
    assert_eq!(bus.query("scope/offset").unwrap(), json!(-20));
}

#[test]
fn test_undo_through_action_topics() {
    let mut bus = bus();
    bus.publish(GAIN, 1).unwrap();
    bus.publish(GAIN, 2).unwrap();
    bus.publish(GAIN, 3).unwrap();

    bus.publish(UNDO_TOPIC, 2).unwrap();
    assert_eq!(bus.query(GAIN).unwrap(), json!(1));

    bus.publish(REDO_TOPIC, 1).unwrap();
    assert_eq!(bus.query(GAIN).unwrap(), json!(2));
}

#[test]
fn test_skip_undo_flag_and_global_switch() {
    let mut bus = bus();
    bus.topic_add(
        "scope/status",
        Metadata::new(Dtype::Str)
            .with_default("idle")
            .with_flags(&[Flag::SkipUndo]),
        false,
    )
    .unwrap();
    bus.publish("scope/status", "busy").unwrap();
    assert!(!bus.undo_engine().can_undo());

    bus.set_skip_core_undo(true);
    bus.publish(GAIN, 5).unwrap();
    assert!(!bus.undo_engine().can_undo());

    bus.set_skip_core_undo(false);
    bus.publish(GAIN, 6).unwrap();
    assert_eq!(bus.undo_engine().undo_len(), 1);
}

#[test]
fn test_history_bounded_by_config() {
    let mut config = BusConfig::default();
    config.undo.max_entries = 3;
    let mut bus = PubSub::with_config(config).unwrap();
    bus.topic_add(GAIN, Metadata::new(Dtype::U8).with_default(0), false)
        .unwrap();
    for v in 1..=10 {
        bus.publish(GAIN, v).unwrap();
    }
    assert_eq!(bus.undo_engine().undo_len(), 3);

    while bus.undo().unwrap() {}
    assert_eq!(bus.query(GAIN).unwrap(), json!(7));
}

struct Counter;

impl SettingAccessor for Counter {}

impl Registrant for Counter {
    fn declaration(&self) -> Declaration {
        Declaration::class("Counter")
            .setting("total", Metadata::new(Dtype::I32).with_default(0))
            .on_action(
                "bump",
                Callable::bus(|bus, _, v| {
                    let total = setting_topic("Counter", "total");
                    let step = v.as_i64().unwrap_or(0);
                    let current = bus.query(&total)?.as_i64().unwrap_or(0);
                    bus.publish(&total, current + step)?;
                    Ok(Some(Inverse::publish(action_topic("Counter", "bump"), json!(-step))))
                }),
            )
    }
}

#[test]
fn test_redo_replays_action_once() {
    let mut bus = PubSub::new();
    bus.register(std::sync::Arc::new(Counter), None).unwrap();
    let total = setting_topic("Counter", "total");

    bus.publish(&action_topic("Counter", "bump"), 4).unwrap();
    assert_eq!(bus.query(&total).unwrap(), json!(4));
    assert_eq!(bus.undo_engine().undo_len(), 1);

    assert!(bus.undo().unwrap());
    assert_eq!(bus.query(&total).unwrap(), json!(0));
    assert!(bus.redo().unwrap());
    assert_eq!(bus.query(&total).unwrap(), json!(4));
    assert!(bus.undo().unwrap());
    assert_eq!(bus.query(&total).unwrap(), json!(0));
}
