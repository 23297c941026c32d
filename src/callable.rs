//! Calling conventions for subscribers and handlers.
//!
//! A callable's signature is fixed when it is constructed, so the dispatcher
//! never inspects arity at dispatch time. The four conventions are:
//!
//! | Convention   | Signature                                  |
//! |--------------|--------------------------------------------|
//! | `NoArgs`     | `fn() -> R`                                |
//! | `Value`      | `fn(&Value) -> R`                          |
//! | `TopicValue` | `fn(&str, &Value) -> R`                    |
//! | `Bus`        | `fn(&mut PubSub, &str, &Value) -> R`       |
//!
//! `Bus` callables may re-enter the dispatcher (publish, subscribe, remove
//! topics with `defer = true`).

use bitflags::bitflags;
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::BusResult;
use crate::pubsub::PubSub;
use crate::undo::Inverse;

/// A function with a calling convention resolved at construction.
pub enum Callable<R> {
    /// Takes nothing.
    NoArgs(Arc<dyn Fn() -> R + Send + Sync>),
    /// Takes the value.
    Value(Arc<dyn Fn(&Value) -> R + Send + Sync>),
    /// Takes the topic and the value.
    TopicValue(Arc<dyn Fn(&str, &Value) -> R + Send + Sync>),
    /// Takes the dispatch context, the topic and the value.
    Bus(Arc<dyn Fn(&mut PubSub, &str, &Value) -> R + Send + Sync>),
}

impl<R> Clone for Callable<R> {
    fn clone(&self) -> Self {
        match self {
            Callable::NoArgs(f) => Callable::NoArgs(Arc::clone(f)),
            Callable::Value(f) => Callable::Value(Arc::clone(f)),
            Callable::TopicValue(f) => Callable::TopicValue(Arc::clone(f)),
            Callable::Bus(f) => Callable::Bus(Arc::clone(f)),
        }
    }
}

impl<R> fmt::Debug for Callable<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Callable::{}", self.convention())
    }
}

impl<R> Callable<R> {
    /// Wrap a zero-argument function.
    pub fn no_args(f: impl Fn() -> R + Send + Sync + 'static) -> Self {
        Callable::NoArgs(Arc::new(f))
    }

    /// Wrap a value-only function.
    pub fn value(f: impl Fn(&Value) -> R + Send + Sync + 'static) -> Self {
        Callable::Value(Arc::new(f))
    }

    /// Wrap a topic + value function.
    pub fn topic_value(f: impl Fn(&str, &Value) -> R + Send + Sync + 'static) -> Self {
        Callable::TopicValue(Arc::new(f))
    }

    /// Wrap a function that receives the dispatch context.
    pub fn bus(f: impl Fn(&mut PubSub, &str, &Value) -> R + Send + Sync + 'static) -> Self {
        Callable::Bus(Arc::new(f))
    }

    /// Name of the calling convention.
    pub fn convention(&self) -> &'static str {
        match self {
            Callable::NoArgs(_) => "NoArgs",
            Callable::Value(_) => "Value",
            Callable::TopicValue(_) => "TopicValue",
            Callable::Bus(_) => "Bus",
        }
    }

    /// Call with the cached convention.
    pub fn invoke(&self, bus: &mut PubSub, topic: &str, value: &Value) -> R {
        match self {
            Callable::NoArgs(f) => f(),
            Callable::Value(f) => f(value),
            Callable::TopicValue(f) => f(topic, value),
            Callable::Bus(f) => f(bus, topic, value),
        }
    }

    /// True if both wrap the same function object.
    pub fn same_as(&self, other: &Self) -> bool {
        match (self, other) {
            (Callable::NoArgs(a), Callable::NoArgs(b)) => Arc::ptr_eq(a, b),
            (Callable::Value(a), Callable::Value(b)) => Arc::ptr_eq(a, b),
            (Callable::TopicValue(a), Callable::TopicValue(b)) => Arc::ptr_eq(a, b),
            (Callable::Bus(a), Callable::Bus(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// Subscriber callback.
pub type Callback = Callable<()>;

/// Outcome of a setting, action or callback handler.
///
/// Action handlers opt into undo by returning an [`Inverse`].
pub type HandlerResult = BusResult<Option<Inverse>>;

/// Setting, action or callback handler.
pub type Handler = Callable<HandlerResult>;

/// Identity of a subscriber, stable across clones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

static NEXT_SUBSCRIBER_ID: AtomicU64 = AtomicU64::new(1);

impl SubscriberId {
    fn next() -> Self {
        SubscriberId(NEXT_SUBSCRIBER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// A callback with an identity, so it can be unsubscribed everywhere at once.
///
/// Clones share the identity.
#[derive(Debug, Clone)]
pub struct Subscriber {
    id: SubscriberId,
    callback: Callback,
}

impl PartialEq for Subscriber {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Subscriber {}

impl Subscriber {
    /// Give a callback an identity.
    pub fn new(callback: Callback) -> Self {
        Self {
            id: SubscriberId::next(),
            callback,
        }
    }

    /// Subscriber taking topic and value.
    pub fn from_fn(f: impl Fn(&str, &Value) + Send + Sync + 'static) -> Self {
        Self::new(Callable::topic_value(f))
    }

    /// Subscriber that receives the dispatch context.
    pub fn from_bus_fn(f: impl Fn(&mut PubSub, &str, &Value) + Send + Sync + 'static) -> Self {
        Self::new(Callable::bus(f))
    }

    /// Stable identity.
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// The wrapped callback.
    pub fn callback(&self) -> &Callback {
        &self.callback
    }
}

bitflags! {
    /// What a subscription is notified about.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct SubscribeFlags: u8 {
        /// Every accepted publish.
        const PUB = 1 << 0;
        /// The retained value(s), once, at subscribe time.
        const RETAIN = 1 << 1;
        /// Metadata replacement, delivered on `topic$`.
        const METADATA = 1 << 2;
        /// Topic removal, delivered on `topic~`.
        const REMOVE = 1 << 3;
    }
}

impl SubscribeFlags {
    /// Late-joiner semantics: current value now, then every change.
    pub const RETAIN_PUB: SubscribeFlags = SubscribeFlags::PUB.union(SubscribeFlags::RETAIN);
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    #[test]
    fn test_conventions_receive_expected_arguments() {
        let mut bus = PubSub::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let s = seen.clone();
        let a: Callback = Callable::no_args(move || s.lock().push("none".to_string()));
        let s = seen.clone();
        let b: Callback = Callable::value(move |v| s.lock().push(v.to_string()));
        let s = seen.clone();
        let c: Callback = Callable::topic_value(move |t, v| s.lock().push(format!("{t}={v}")));

        for cb in [&a, &b, &c] {
            cb.invoke(&mut bus, "t", &json!(1));
        }
        assert_eq!(*seen.lock(), vec!["none", "1", "t=1"]);
        assert_eq!(c.convention(), "TopicValue");
    }

    #[test]
    fn test_subscriber_identity_survives_clone() {
        let a = Subscriber::from_fn(|_, _| {});
        let b = a.clone();
        let c = Subscriber::from_fn(|_, _| {});
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.callback().same_as(b.callback()));
    }

    #[test]
    fn test_retain_pub_flags() {
        assert!(SubscribeFlags::RETAIN_PUB.contains(SubscribeFlags::PUB));
        assert!(SubscribeFlags::RETAIN_PUB.contains(SubscribeFlags::RETAIN));
        assert!(!SubscribeFlags::RETAIN_PUB.contains(SubscribeFlags::REMOVE));
    }
}
