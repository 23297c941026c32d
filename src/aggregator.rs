//! Capability aggregator.
//!
//! Combines one subtopic across every member of a capability into a single
//! summary topic, e.g. "is any device open":
//!
//! ```no_run
//! use daq_pubsub::aggregator::{reduce, Aggregator};
//! use daq_pubsub::prelude::*;
//!
//! # fn main() -> BusResult<()> {
//! let mut bus = PubSub::new();
//! bus.topic_add(
//!     "app/any_device_open",
//!     Metadata::new(Dtype::Bool).with_flags(&[Flag::SkipUndo]),
//!     false,
//! )?;
//! let any_open = Aggregator::new(
//!     &mut bus,
//!     "device.object",
//!     "settings/state",
//!     reduce::any,
//!     "app/any_device_open",
//! )?;
//! // ...
//! any_open.close(&mut bus);
//! # Ok(())
//! # }
//! ```
//!
//! The aggregated topic is published only when the reduced value changes.

use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::callable::{SubscribeFlags, Subscriber};
use crate::capabilities::list_topic;
use crate::error::{BusError, BusResult};
use crate::pubsub::PubSub;
use crate::registry::REGISTRY_ROOT;

/// Reduction over the current member values, in join order.
pub type Reducer = Arc<dyn Fn(&[Value]) -> Value + Send + Sync>;

/// Stock reducers.
pub mod reduce {
    use serde_json::Value;

    /// Truthiness of a JSON value: `null`, `false`, zero and empty are false.
    pub fn truthy(value: &Value) -> bool {
        match value {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(n) => n.as_f64().is_some_and(|x| x != 0.0),
            Value::String(s) => !s.is_empty(),
            Value::Array(a) => !a.is_empty(),
            Value::Object(o) => !o.is_empty(),
        }
    }

    /// True when any member value is truthy.
    pub fn any(values: &[Value]) -> Value {
        Value::Bool(values.iter().any(truthy))
    }

    /// True when every member value is truthy; false with no members.
    pub fn all_except_empty(values: &[Value]) -> Value {
        Value::Bool(!values.is_empty() && values.iter().all(truthy))
    }
}

#[derive(Default)]
struct AggregatorState {
    members: Vec<(String, Value)>,
    previous: Option<Value>,
}

struct Shared {
    state: Mutex<AggregatorState>,
    subtopic: String,
    aggregated_topic: String,
    reducer: Reducer,
}

impl Shared {
    fn member_topic(&self, unique_id: &str) -> String {
        format!("{}/{}/{}", REGISTRY_ROOT, unique_id, self.subtopic)
    }

    fn member_of(&self, topic: &str) -> Option<String> {
        let rest = topic.strip_prefix(REGISTRY_ROOT)?.strip_prefix('/')?;
        let (unique_id, sub) = rest.split_once('/')?;
        (sub == self.subtopic).then(|| unique_id.to_string())
    }

    /// Reduce and publish if the result changed. The lock is released first.
    fn publish(&self, bus: &mut PubSub) {
        let value = {
            let mut state = self.state.lock();
            let values: Vec<Value> = state.members.iter().map(|(_, v)| v.clone()).collect();
            let value = (self.reducer)(&values);
            if state.previous.as_ref() == Some(&value) {
                return;
            }
            state.previous = Some(value.clone());
            value
        };
        if let Err(e) = bus.publish(&self.aggregated_topic, value) {
            warn!(topic = %self.aggregated_topic, error = %e, "Aggregated publish failed");
        }
    }

    fn on_member_value(&self, bus: &mut PubSub, topic: &str, value: &Value) {
        let Some(unique_id) = self.member_of(topic) else {
            return;
        };
        {
            let mut state = self.state.lock();
            match state.members.iter_mut().find(|(id, _)| *id == unique_id) {
                Some((_, slot)) => *slot = value.clone(),
                None => {
                    warn!(unique_id = %unique_id, "Aggregator update for unknown member");
                    return;
                }
            }
        }
        self.publish(bus);
    }

    fn on_list(&self, bus: &mut PubSub, list: &Value, member_subscriber: &Subscriber) {
        let ids: Vec<&str> = list
            .as_array()
            .map(|a| a.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();

        let (added, removed): (Vec<String>, Vec<String>) = {
            let state = self.state.lock();
            let added = ids
                .iter()
                .filter(|id| !state.members.iter().any(|(m, _)| m == *id))
                .map(|id| id.to_string())
                .collect();
            let removed = state
                .members
                .iter()
                .filter(|(m, _)| !ids.contains(&m.as_str()))
                .map(|(m, _)| m.clone())
                .collect();
            (added, removed)
        };

        for unique_id in removed {
            info!(unique_id = %unique_id, aggregated = %self.aggregated_topic, "Aggregator member removed");
            bus.unsubscribe(&self.member_topic(&unique_id), member_subscriber, None);
            self.state.lock().members.retain(|(m, _)| *m != unique_id);
        }

        for unique_id in added {
            let topic = self.member_topic(&unique_id);
            let Ok(value) = bus.query(&topic) else {
                debug!(topic = %topic, "Capability member lacks aggregated subtopic");
                continue;
            };
            info!(unique_id = %unique_id, aggregated = %self.aggregated_topic, "Aggregator member added");
            self.state.lock().members.push((unique_id, value));
            if let Err(e) = bus.subscribe(&topic, member_subscriber, SubscribeFlags::PUB) {
                warn!(topic = %topic, error = %e, "Aggregator subscribe failed");
            }
        }

        self.publish(bus);
    }
}

/// Summary of one subtopic across a capability's members.
pub struct Aggregator {
    shared: Arc<Shared>,
    list_topic: String,
    list_subscriber: Subscriber,
    member_subscriber: Subscriber,
}

impl std::fmt::Debug for Aggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Aggregator")
            .field("list_topic", &self.list_topic)
            .field("subtopic", &self.shared.subtopic)
            .field("aggregated_topic", &self.shared.aggregated_topic)
            .finish()
    }
}

impl Aggregator {
    /// Start aggregating `registry/<member>/<subtopic>` for every member of
    /// `capability` into `aggregated_topic`, which must already exist.
    ///
    /// The reduced value over the current members is published before this
    /// returns.
    pub fn new(
        bus: &mut PubSub,
        capability: &str,
        subtopic: &str,
        reducer: impl Fn(&[Value]) -> Value + Send + Sync + 'static,
        aggregated_topic: &str,
    ) -> BusResult<Self> {
        if !bus.tree().contains(aggregated_topic) {
            return Err(BusError::TopicNotFound(aggregated_topic.to_string()));
        }
        bus.capability_add(capability)?;

        let shared = Arc::new(Shared {
            state: Mutex::new(AggregatorState::default()),
            subtopic: subtopic.trim_matches('/').to_string(),
            aggregated_topic: aggregated_topic.to_string(),
            reducer: Arc::new(reducer),
        });

        let on_member = Arc::clone(&shared);
        let member_subscriber = Subscriber::from_bus_fn(move |bus, topic, value| {
            on_member.on_member_value(bus, topic, value)
        });

        let on_list = Arc::clone(&shared);
        let members = member_subscriber.clone();
        let list_subscriber = Subscriber::from_bus_fn(move |bus, _topic, value| {
            on_list.on_list(bus, value, &members)
        });

        let list_topic = list_topic(capability);
        bus.subscribe(&list_topic, &list_subscriber, SubscribeFlags::RETAIN_PUB)?;

        Ok(Self {
            shared,
            list_topic,
            list_subscriber,
            member_subscriber,
        })
    }

    /// Unique ids currently aggregated.
    pub fn members(&self) -> Vec<String> {
        self.shared
            .state
            .lock()
            .members
            .iter()
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Last published value.
    pub fn value(&self) -> Option<Value> {
        self.shared.state.lock().previous.clone()
    }

    /// Stop aggregating and drop every subscription.
    pub fn close(self, bus: &mut PubSub) {
        bus.unsubscribe(&self.list_topic, &self.list_subscriber, None);
        bus.unsubscribe_all(&self.member_subscriber);
        self.shared.state.lock().members.clear();
    }
}
