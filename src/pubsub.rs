//! Publish/Subscribe Dispatcher
//!
//! [`PubSub`] is the explicit context object that owns the topic tree, the
//! subscription table, the registry, the capability index and the undo
//! history. Construct one at startup and hand `&mut PubSub` to collaborators;
//! tests build as many independent instances as they need.
//!
//! # Single Writer
//!
//! Only the task holding `&mut PubSub` mutates bus state. Other threads use a
//! [`Relay`] obtained from [`PubSub::relay`], and the dispatch context drains
//! it with [`PubSub::process`] or [`PubSub::process_next`].
//!
//! # Publish Flow
//!
//! 1. Look up the leaf (nodes are never publishable).
//! 2. Validate and normalize the value; on failure nothing changes.
//! 3. Reject `ro` topics unless published through [`PubSub::publish_owned`].
//! 4. Run the routed setting/action handler (or the registrant's
//!    `SettingAccessor`); a failing handler aborts the publish.
//! 5. Retain the value (except `!` topics) and record the undo entry.
//! 6. Notify `PUB` subscribers of the topic, then of each ancestor.
//!
//! Handlers and subscribers may publish again. Nested publishes join the
//! top-level publish's undo group, and topic removals requested with
//! `defer = true` run once the outermost dispatch returns.
//!
//! # Example
//!
//! ```rust
//! use daq_pubsub::prelude::*;
//! use serde_json::json;
//!
//! let mut bus = PubSub::new();
//! bus.topic_add("app/gain", Metadata::new(Dtype::U8).with_default(1), false)?;
//! bus.publish("app/gain", json!(4))?;
//! assert_eq!(bus.query("app/gain")?, json!(4));
//! # Ok::<(), daq_pubsub::error::BusError>(())
//! ```

use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::callable::{Callable, SubscribeFlags, Subscriber, SubscriberId};
use crate::capabilities::CapabilityIndex;
use crate::config::BusConfig;
use crate::error::{BusError, BusResult};
use crate::metadata::{Dtype, Flag, Metadata};
use crate::registry::{Registry, Route, RouteTarget};
use crate::relay::{Relay, RelayMessage};
use crate::topic::{self, AddOutcome, TopicKind, TopicTree, METADATA_SUFFIX, REMOVE_SUFFIX};
use crate::undo::{Command, UndoEngine};

/// Action topic that undoes `count` groups.
pub const UNDO_TOPIC: &str = "registry_manager/actions/!undo";
/// Action topic that redoes `count` groups.
pub const REDO_TOPIC: &str = "registry_manager/actions/!redo";

#[derive(Debug, Clone)]
struct Subscription {
    subscriber: Subscriber,
    flags: SubscribeFlags,
}

/// Per-topic subscriber lists plus a reverse index for `unsubscribe_all`.
#[derive(Debug, Default)]
struct Subscriptions {
    by_topic: HashMap<String, Vec<Subscription>>,
    by_subscriber: HashMap<SubscriberId, HashSet<String>>,
}

impl Subscriptions {
    fn add(&mut self, topic: &str, subscriber: &Subscriber, flags: SubscribeFlags) {
        let list = self.by_topic.entry(topic.to_string()).or_default();
        match list.iter_mut().find(|s| s.subscriber == *subscriber) {
            Some(existing) => existing.flags |= flags,
            None => list.push(Subscription {
                subscriber: subscriber.clone(),
                flags,
            }),
        }
        self.by_subscriber
            .entry(subscriber.id())
            .or_default()
            .insert(topic.to_string());
    }

    fn remove(&mut self, topic: &str, id: SubscriberId, flags: SubscribeFlags) -> bool {
        let Some(list) = self.by_topic.get_mut(topic) else {
            return false;
        };
        let mut changed = false;
        for s in list.iter_mut().filter(|s| s.subscriber.id() == id) {
            changed |= s.flags.intersects(flags);
            s.flags.remove(flags);
        }
        list.retain(|s| !s.flags.is_empty());
        let still_present = list.iter().any(|s| s.subscriber.id() == id);
        if list.is_empty() {
            self.by_topic.remove(topic);
        }
        if !still_present {
            self.forget(id, topic);
        }
        changed
    }

    fn forget(&mut self, id: SubscriberId, topic: &str) {
        if let Some(topics) = self.by_subscriber.get_mut(&id) {
            topics.remove(topic);
            if topics.is_empty() {
                self.by_subscriber.remove(&id);
            }
        }
    }

    fn remove_subscriber(&mut self, id: SubscriberId) -> usize {
        let Some(topics) = self.by_subscriber.remove(&id) else {
            return 0;
        };
        for topic in &topics {
            if let Some(list) = self.by_topic.get_mut(topic) {
                list.retain(|s| s.subscriber.id() != id);
                if list.is_empty() {
                    self.by_topic.remove(topic);
                }
            }
        }
        topics.len()
    }

    fn drop_topic(&mut self, topic: &str) {
        if let Some(list) = self.by_topic.remove(topic) {
            for s in list {
                self.forget(s.subscriber.id(), topic);
            }
        }
    }

    fn matching(&self, topic: &str, flag: SubscribeFlags) -> impl Iterator<Item = &Subscriber> {
        self.by_topic
            .get(topic)
            .into_iter()
            .flatten()
            .filter(move |s| s.flags.contains(flag))
            .map(|s| &s.subscriber)
    }

    fn is_active(&self, topic: &str, id: SubscriberId, flag: SubscribeFlags) -> bool {
        self.by_topic
            .get(topic)
            .is_some_and(|list| list.iter().any(|s| s.subscriber.id() == id && s.flags.contains(flag)))
    }

    fn has_any(&self, topic: &str) -> bool {
        self.by_topic.contains_key(topic)
    }

    fn len(&self) -> usize {
        self.by_topic.values().map(Vec::len).sum()
    }
}

/// The bus: topic tree, dispatcher, registry, capability index and undo
/// history behind one context object.
pub struct PubSub {
    pub(crate) tree: TopicTree,
    subscriptions: Subscriptions,
    pub(crate) registry: Registry,
    pub(crate) capabilities: CapabilityIndex,
    pub(crate) undo: UndoEngine,
    relay_tx: mpsc::UnboundedSender<RelayMessage>,
    relay_rx: mpsc::UnboundedReceiver<RelayMessage>,
    dispatch_depth: u32,
    deferred_removals: Vec<String>,
    config: BusConfig,
}

impl std::fmt::Debug for PubSub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PubSub")
            .field("topics", &self.tree.len())
            .field("subscriptions", &self.subscriptions.len())
            .field("registered", &self.registry.len())
            .field("dispatch_depth", &self.dispatch_depth)
            .finish_non_exhaustive()
    }
}

impl Default for PubSub {
    fn default() -> Self {
        Self::new()
    }
}

impl PubSub {
    /// Bus with default undo and relay settings and no capability lists.
    ///
    /// Use [`PubSub::with_config`] to pre-install configured tags.
    pub fn new() -> Self {
        Self::build(BusConfig::default())
    }

    /// Bus with the given configuration.
    ///
    /// Capability tags listed in the configuration get their list topics
    /// immediately.
    pub fn with_config(config: BusConfig) -> BusResult<Self> {
        config.validate()?;
        let tags = config.capabilities.clone();
        let mut bus = Self::build(config);
        for tag in &tags {
            bus.capability_add(tag)?;
        }
        Ok(bus)
    }

    fn build(config: BusConfig) -> Self {
        let (relay_tx, relay_rx) = mpsc::unbounded_channel();
        let mut bus = Self {
            tree: TopicTree::new(),
            subscriptions: Subscriptions::default(),
            registry: Registry::default(),
            capabilities: CapabilityIndex::default(),
            undo: UndoEngine::new(config.undo.skip_core_undo, config.undo.max_entries),
            relay_tx,
            relay_rx,
            dispatch_depth: 0,
            deferred_removals: Vec::new(),
            config,
        };
        bus.install_undo_topics();
        bus
    }

    fn install_undo_topics(&mut self) {
        let meta = Metadata::new(Dtype::U32)
            .with_brief("Number of command groups")
            .with_flags(&[Flag::SkipUndo, Flag::Hidden]);
        for (path, redo) in [(UNDO_TOPIC, false), (REDO_TOPIC, true)] {
            if let Err(e) = self.tree.add(path, meta.clone(), true) {
                warn!(topic = path, error = %e, "Failed to install undo topic");
                continue;
            }
            let handler = Callable::bus(move |bus: &mut PubSub, _topic: &str, value: &Value| {
                let count = value.as_u64().unwrap_or(1);
                for _ in 0..count {
                    let applied = if redo { bus.redo()? } else { bus.undo()? };
                    if !applied {
                        break;
                    }
                }
                Ok(None)
            });
            self.registry.routes.insert(
                path.to_string(),
                Route {
                    owner: None,
                    target: RouteTarget::Handler(handler),
                },
            );
        }
    }

    /// Active configuration.
    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    /// The topic tree, read-only.
    pub fn tree(&self) -> &TopicTree {
        &self.tree
    }

    /// Undo history, read-only.
    pub fn undo_engine(&self) -> &UndoEngine {
        &self.undo
    }

    /// Globally suppress automatic undo capture for settings.
    pub fn set_skip_core_undo(&mut self, skip: bool) {
        self.undo.set_skip_core_undo(skip);
    }

    /// True while a publish, retained delivery or removal is being dispatched.
    pub fn is_dispatching(&self) -> bool {
        self.dispatch_depth > 0
    }

    fn enter(&mut self) {
        self.dispatch_depth += 1;
    }

    fn leave(&mut self) {
        self.dispatch_depth = self.dispatch_depth.saturating_sub(1);
        if self.dispatch_depth == 0 && !self.deferred_removals.is_empty() {
            self.flush_deferred();
        }
    }

    /// Drop pending removals that would delete `path` after it was re-created.
    pub(crate) fn cancel_deferred(&mut self, path: &str) {
        if self.deferred_removals.is_empty() {
            return;
        }
        self.deferred_removals.retain(|pending| {
            let related = pending == path
                || topic::is_descendant(path, pending)
                || topic::is_descendant(pending, path);
            if related {
                debug!(topic = %pending, recreated = path, "Deferred topic removal cancelled");
            }
            !related
        });
    }

    fn flush_deferred(&mut self) {
        let pending = std::mem::take(&mut self.deferred_removals);
        for path in pending {
            if !self.tree.contains(&path) {
                continue;
            }
            if let Err(e) = self.remove_now(&path) {
                warn!(topic = %path, error = %e, "Deferred topic removal failed");
            }
        }
    }

    // ---- topic tree ---------------------------------------------------------

    /// Create a topic and any missing ancestor nodes.
    ///
    /// New leaves start with the metadata default as their retained value
    /// (unless flagged `noinit` or named `!…`). Replacing existing metadata
    /// requires `exists_ok` and notifies `METADATA` subscribers on `path$`.
    pub fn topic_add(&mut self, path: &str, metadata: Metadata, exists_ok: bool) -> BusResult<()> {
        let metadata = metadata.normalized()?;
        let default = match (&metadata.default, metadata.has_flag(Flag::NoInit)) {
            (Some(default), false) if !metadata.is_node() && !topic::is_transient(path) => {
                Some(default.clone())
            }
            _ => None,
        };
        let outcome = self.tree.add(path, metadata, exists_ok)?;
        self.cancel_deferred(path);
        match outcome {
            AddOutcome::Created => {
                debug!(topic = path, "Topic added");
                if default.is_some() {
                    self.tree.replace_retained(path, default);
                }
            }
            AddOutcome::Unchanged => {}
            AddOutcome::Replaced => self.notify_metadata(path),
        }
        Ok(())
    }

    /// Deliver the current metadata of `path` to `METADATA` subscribers.
    pub(crate) fn notify_metadata(&mut self, path: &str) {
        let Ok(metadata) = self.metadata(path) else {
            return;
        };
        debug!(topic = path, "Topic metadata replaced");
        let delivered = format!("{}{}", path, METADATA_SUFFIX);
        self.enter();
        self.notify(path, &metadata.to_json(), SubscribeFlags::METADATA, &delivered, true);
        self.leave();
    }

    /// Remove a topic and its subtree.
    ///
    /// With `defer = true` during dispatch, removal waits until the outermost
    /// dispatch returns. `REMOVE` subscribers are notified on `topic~` before
    /// each topic disappears.
    pub fn topic_remove(&mut self, path: &str, defer: bool) -> BusResult<()> {
        topic::split_path(path)?;
        if !self.tree.contains(path) {
            return Err(BusError::TopicNotFound(path.to_string()));
        }
        if defer && self.is_dispatching() {
            debug!(topic = path, "Topic removal deferred");
            self.deferred_removals.push(path.to_string());
            return Ok(());
        }
        self.remove_now(path)
    }

    fn remove_now(&mut self, path: &str) -> BusResult<()> {
        let mut doomed = self.tree.descendants(path);
        doomed.reverse();
        doomed.push(path.to_string());

        self.enter();
        for p in &doomed {
            let delivered = format!("{}{}", p, REMOVE_SUFFIX);
            self.notify(p, &Value::Null, SubscribeFlags::REMOVE, &delivered, true);
        }
        let result = if self.tree.contains(path) {
            let subscriptions = &self.subscriptions;
            self.tree.remove(path, |p| subscriptions.has_any(p))
        } else {
            Ok(Vec::new())
        };
        if let Ok(removed) = &result {
            for p in removed {
                self.subscriptions.drop_topic(p);
                self.registry.routes.remove(p);
            }
            debug!(topic = path, count = removed.len(), "Topics removed");
        }
        self.leave();
        result.map(|_| ())
    }

    /// Child names of `path` (or full paths when `absolute`).
    ///
    /// With `traverse`, every descendant is listed depth-first.
    pub fn enumerate(&self, path: &str, absolute: bool, traverse: bool) -> BusResult<Vec<String>> {
        let paths = if traverse {
            if !self.tree.contains(path) {
                return Err(BusError::TopicNotFound(path.to_string()));
            }
            self.tree.descendants(path)
        } else {
            self.tree.children(path)?.to_vec()
        };
        if absolute || path.is_empty() {
            return Ok(paths);
        }
        let skip = path.len() + 1;
        Ok(paths.into_iter().map(|p| p[skip..].to_string()).collect())
    }

    /// Retained value, or `TopicNotFound` when the topic is absent or empty.
    pub fn query(&self, path: &str) -> BusResult<Value> {
        self.tree
            .retained(path)
            .cloned()
            .ok_or_else(|| BusError::TopicNotFound(path.to_string()))
    }

    /// Retained value, or `default`.
    pub fn query_or(&self, path: &str, default: Value) -> Value {
        self.tree.retained(path).cloned().unwrap_or(default)
    }

    /// Metadata of a topic (`node` metadata for interior nodes).
    pub fn metadata(&self, path: &str) -> BusResult<Metadata> {
        let node = self
            .tree
            .get(path)
            .ok_or_else(|| BusError::TopicNotFound(path.to_string()))?;
        Ok(match &node.kind {
            TopicKind::Leaf { metadata, .. } => metadata.clone(),
            TopicKind::Node => Metadata::new(Dtype::Node),
        })
    }

    /// Diagnostic dump of the whole tree as `{topic, value, meta, children}`.
    pub fn snapshot(&self) -> Value {
        self.snapshot_node("")
    }

    fn snapshot_node(&self, path: &str) -> Value {
        let Some(node) = self.tree.get(path) else {
            return Value::Null;
        };
        let children: Vec<Value> = node.children.iter().map(|c| self.snapshot_node(c)).collect();
        json!({
            "topic": path,
            "value": node.retained().cloned().unwrap_or(Value::Null),
            "meta": node.metadata().map_or(Value::Null, Metadata::to_json),
            "children": children,
        })
    }

    // ---- publish ------------------------------------------------------------

    /// Validate, retain and deliver a value.
    pub fn publish(&mut self, topic: &str, value: impl Into<Value>) -> BusResult<()> {
        self.publish_inner(topic, value.into(), false)
    }

    /// Like [`PubSub::publish`], but allowed on read-only topics.
    ///
    /// Reserved for the topic's owner.
    pub fn publish_owned(&mut self, topic: &str, value: impl Into<Value>) -> BusResult<()> {
        self.publish_inner(topic, value.into(), true)
    }

    fn publish_inner(&mut self, topic: &str, value: Value, owned: bool) -> BusResult<()> {
        let (value, read_only, skip_undo, previous) = {
            let node = self
                .tree
                .get(topic)
                .ok_or_else(|| BusError::TopicNotFound(topic.to_string()))?;
            let TopicKind::Leaf { metadata, retained } = &node.kind else {
                return Err(BusError::NodeNotPublishable(topic.to_string()));
            };
            let value = metadata
                .validate(&value)
                .map_err(|e| BusError::validation(topic, e))?;
            (
                value,
                metadata.has_flag(Flag::ReadOnly),
                metadata.has_flag(Flag::SkipUndo),
                retained.clone(),
            )
        };
        if read_only && !owned {
            return Err(BusError::ReadOnly(topic.to_string()));
        }
        trace!(topic, %value, "Publish");

        self.enter();
        let opened = self.undo.implicit_begin();
        let result = self.dispatch(topic, value, previous, skip_undo);
        self.undo.implicit_end(opened);
        self.leave();
        result
    }

    fn dispatch(&mut self, topic: &str, value: Value, previous: Option<Value>, skip_undo: bool) -> BusResult<()> {
        let mark = self.undo.mark();
        let inverse = match self.registry.routes.get(topic).cloned() {
            Some(route) => self.invoke_route(&route, topic, &value)?,
            None => None,
        };

        if topic::is_transient(topic) {
            if let Some(inverse) = inverse {
                if !skip_undo {
                    // Replaying the action re-creates whatever it published.
                    self.undo.record_over(mark, Command::new(topic, value.clone()), inverse);
                }
            }
            self.notify(topic, &value, SubscribeFlags::PUB, topic, false);
            return Ok(());
        }

        self.tree.replace_retained(topic, Some(value.clone()));
        if let Some(previous) = previous {
            if !skip_undo && !self.undo.skip_core_undo() {
                self.undo.record(
                    Command::new(topic, value.clone()),
                    crate::undo::Inverse::Publish(Command::new(topic, previous)),
                );
            }
        }
        self.notify(topic, &value, SubscribeFlags::PUB, topic, true);
        Ok(())
    }

    fn invoke_route(&mut self, route: &Route, topic: &str, value: &Value) -> crate::callable::HandlerResult {
        match &route.target {
            RouteTarget::Handler(handler) => handler.invoke(self, topic, value),
            RouteTarget::Accessor { name } => {
                if let Some(object) = route.owner.and_then(|h| self.registry.get(h)) {
                    object.instance().set_value(name, value);
                }
                Ok(None)
            }
        }
    }

    /// Invoke subscribers holding `flag` on `topic` (and its ancestors).
    ///
    /// The subscriber list is captured up front; a subscriber removed by an
    /// earlier callback in the same pass is skipped.
    fn notify(&mut self, topic: &str, value: &Value, flag: SubscribeFlags, delivered: &str, ancestors: bool) {
        let mut targets: Vec<(String, Subscriber)> = self
            .subscriptions
            .matching(topic, flag)
            .map(|s| (topic.to_string(), s.clone()))
            .collect();
        if ancestors {
            for parent in topic::ancestors(topic) {
                targets.extend(
                    self.subscriptions
                        .matching(parent, flag)
                        .map(|s| (parent.to_string(), s.clone())),
                );
            }
        }
        for (owner, subscriber) in targets {
            if self.subscriptions.is_active(&owner, subscriber.id(), flag) {
                subscriber.callback().invoke(self, delivered, value);
            }
        }
    }

    // ---- subscribe ----------------------------------------------------------

    /// Subscribe to a topic (or a whole subtree, via a node).
    ///
    /// With `RETAIN`, every retained value at or below `topic` is delivered
    /// synchronously, once, before this returns.
    pub fn subscribe(&mut self, topic: &str, subscriber: &Subscriber, flags: SubscribeFlags) -> BusResult<()> {
        if !self.tree.contains(topic) {
            return Err(BusError::TopicNotFound(topic.to_string()));
        }
        let persistent = flags.difference(SubscribeFlags::RETAIN);
        if !persistent.is_empty() {
            self.subscriptions.add(topic, subscriber, persistent);
        }
        if flags.contains(SubscribeFlags::RETAIN) {
            let mut paths = vec![topic.to_string()];
            paths.extend(self.tree.descendants(topic));
            self.enter();
            for path in paths {
                if let Some(value) = self.tree.retained(&path).cloned() {
                    subscriber.callback().invoke(self, &path, &value);
                }
            }
            self.leave();
        }
        Ok(())
    }

    /// Remove `flags` (all flags when `None`) from a subscription.
    ///
    /// Returns true if anything was removed.
    pub fn unsubscribe(&mut self, topic: &str, subscriber: &Subscriber, flags: Option<SubscribeFlags>) -> bool {
        self.subscriptions
            .remove(topic, subscriber.id(), flags.unwrap_or_else(SubscribeFlags::all))
    }

    /// Remove a subscriber from every topic. Returns the number of topics.
    pub fn unsubscribe_all(&mut self, subscriber: &Subscriber) -> usize {
        self.subscriptions.remove_subscriber(subscriber.id())
    }

    /// Total subscription entries across all topics.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// True if anything is subscribed directly to `topic`.
    pub fn has_subscribers(&self, topic: &str) -> bool {
        self.subscriptions.has_any(topic)
    }

    // ---- relay --------------------------------------------------------------

    /// Cross-thread handle for posting into this bus.
    pub fn relay(&self) -> Relay {
        Relay::new(
            self.relay_tx.clone(),
            Duration::from_millis(self.config.relay.request_timeout_ms),
        )
    }

    /// Drain every queued relay message. Returns the number dispatched.
    ///
    /// Does nothing when called from inside a dispatch.
    pub fn process(&mut self) -> usize {
        if self.is_dispatching() {
            return 0;
        }
        let mut count = 0;
        while let Ok(message) = self.relay_rx.try_recv() {
            self.dispatch_message(message);
            count += 1;
        }
        count
    }

    /// Wait for the next relay message and dispatch it.
    ///
    /// The bus keeps a sender of its own, so this waits until a message
    /// arrives; race it against a shutdown signal to stop a drain loop.
    pub async fn process_next(&mut self) {
        if let Some(message) = self.relay_rx.recv().await {
            self.dispatch_message(message);
        }
    }

    fn dispatch_message(&mut self, message: RelayMessage) {
        let RelayMessage {
            topic,
            value,
            completion,
        } = message;
        let result = self.publish(&topic, value);
        if let Err(e) = &result {
            warn!(topic = %topic, error = %e, "Relayed publish failed");
        }
        if let Some(done) = completion {
            // The requester may have timed out already.
            let _ = done.send(result);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn recorder() -> (Subscriber, Arc<Mutex<Vec<(String, Value)>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let l = log.clone();
        let sub = Subscriber::from_fn(move |t, v| l.lock().push((t.to_string(), v.clone())));
        (sub, log)
    }

    fn bus_with(path: &str, meta: Metadata) -> PubSub {
        let mut bus = PubSub::new();
        bus.topic_add(path, meta, false).unwrap();
        bus
    }

    #[test]
    fn test_publish_then_query_normalized() {
        let mut bus = bus_with("a/b", Metadata::new(Dtype::Bool));
        bus.publish("a/b", json!("on")).unwrap();
        assert_eq!(bus.query("a/b").unwrap(), json!(true));
    }

    #[test]
    fn test_invalid_publish_leaves_state() {
        let mut bus = bus_with("a/x", Metadata::new(Dtype::Int).with_range(0.0, 10.0).with_default(3));
        let (sub, log) = recorder();
        bus.subscribe("a/x", &sub, SubscribeFlags::PUB).unwrap();
        assert!(matches!(bus.publish("a/x", json!(11)), Err(BusError::Validation { .. })));
        assert_eq!(bus.query("a/x").unwrap(), json!(3));
        assert!(log.lock().is_empty());
    }

    #[test]
    fn test_publish_to_node_fails() {
        let mut bus = bus_with("a/b", Metadata::new(Dtype::Int));
        assert!(matches!(bus.publish("a", json!(1)), Err(BusError::NodeNotPublishable(_))));
        assert!(matches!(bus.publish("nope", json!(1)), Err(BusError::TopicNotFound(_))));
    }

    #[test]
    fn test_query_missing_and_default() {
        let bus = bus_with("a/b", Metadata::new(Dtype::Int));
        assert!(matches!(bus.query("a/b"), Err(BusError::TopicNotFound(_))));
        assert!(matches!(bus.query("zz"), Err(BusError::TopicNotFound(_))));
        assert_eq!(bus.query_or("a/b", json!(9)), json!(9));
    }

    #[test]
    fn test_retain_subscription_fires_before_return() {
        let mut bus = bus_with("a/b", Metadata::new(Dtype::Int).with_default(2));
        let (sub, log) = recorder();
        bus.subscribe("a/b", &sub, SubscribeFlags::RETAIN_PUB).unwrap();
        assert_eq!(*log.lock(), vec![("a/b".to_string(), json!(2))]);
        bus.publish("a/b", json!(3)).unwrap();
        assert_eq!(log.lock().len(), 2);
    }

    #[test]
    fn test_retain_on_node_delivers_subtree() {
        let mut bus = PubSub::new();
        bus.topic_add("d/x", Metadata::new(Dtype::Int).with_default(1), false).unwrap();
        bus.topic_add("d/y/z", Metadata::new(Dtype::Int).with_default(2), false).unwrap();
        bus.topic_add("d/!go", Metadata::new(Dtype::None), false).unwrap();
        let (sub, log) = recorder();
        bus.subscribe("d", &sub, SubscribeFlags::RETAIN).unwrap();
        let topics: Vec<_> = log.lock().iter().map(|(t, _)| t.clone()).collect();
        assert_eq!(topics, vec!["d/x", "d/y/z"]);
        assert_eq!(bus.subscription_count(), 0);
    }

    #[test]
    fn test_ancestor_subscribers_receive_publishes() {
        let mut bus = bus_with("a/b/c", Metadata::new(Dtype::Int));
        let (leaf, leaf_log) = recorder();
        let (root, root_log) = recorder();
        bus.subscribe("a/b/c", &leaf, SubscribeFlags::PUB).unwrap();
        bus.subscribe("a", &root, SubscribeFlags::PUB).unwrap();
        bus.publish("a/b/c", json!(1)).unwrap();
        assert_eq!(leaf_log.lock().len(), 1);
        assert_eq!(*root_log.lock(), vec![("a/b/c".to_string(), json!(1))]);
    }

    #[test]
    fn test_transient_topics_are_not_retained() {
        let mut bus = bus_with("dev/events/!data", Metadata::new(Dtype::Obj));
        let (sub, log) = recorder();
        bus.subscribe("dev/events/!data", &sub, SubscribeFlags::PUB).unwrap();
        bus.publish("dev/events/!data", json!([1, 2, 3])).unwrap();
        assert_eq!(log.lock().len(), 1);
        assert!(bus.query("dev/events/!data").is_err());
    }

    #[test]
    fn test_read_only_requires_owner() {
        let mut bus = bus_with("s/ro", Metadata::new(Dtype::Int).with_flag(Flag::ReadOnly));
        assert!(matches!(bus.publish("s/ro", json!(1)), Err(BusError::ReadOnly(_))));
        bus.publish_owned("s/ro", json!(1)).unwrap();
        assert_eq!(bus.query("s/ro").unwrap(), json!(1));
    }

    #[test]
    fn test_unsubscribe_and_unsubscribe_all() {
        let mut bus = PubSub::new();
        for i in 0..20 {
            bus.topic_add(&format!("t/{i}"), Metadata::new(Dtype::Int), false).unwrap();
        }
        let (sub, log) = recorder();
        for i in 0..20 {
            bus.subscribe(&format!("t/{i}"), &sub, SubscribeFlags::PUB).unwrap();
        }
        assert!(bus.unsubscribe("t/0", &sub, None));
        assert!(!bus.unsubscribe("t/0", &sub, None));
        bus.publish("t/0", json!(1)).unwrap();
        assert!(log.lock().is_empty());
        assert_eq!(bus.unsubscribe_all(&sub), 19);
        bus.publish("t/5", json!(1)).unwrap();
        assert!(log.lock().is_empty());
        assert_eq!(bus.subscription_count(), 0);
    }

    #[test]
    fn test_unsubscribe_single_flag_keeps_others() {
        let mut bus = bus_with("a/x", Metadata::new(Dtype::Int));
        let (sub, log) = recorder();
        bus.subscribe("a/x", &sub, SubscribeFlags::PUB | SubscribeFlags::REMOVE).unwrap();
        bus.unsubscribe("a/x", &sub, Some(SubscribeFlags::PUB));
        bus.publish("a/x", json!(1)).unwrap();
        assert!(log.lock().is_empty());
        bus.topic_remove("a/x", false).unwrap();
        assert_eq!(*log.lock(), vec![("a/x~".to_string(), Value::Null)]);
    }

    #[test]
    fn test_metadata_replacement_notifies() {
        let mut bus = bus_with("a/x", Metadata::new(Dtype::Int));
        let (sub, log) = recorder();
        bus.subscribe("a", &sub, SubscribeFlags::METADATA).unwrap();
        bus.topic_add("a/x", Metadata::new(Dtype::Int).with_brief("new"), true).unwrap();
        let log = log.lock();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].0, "a/x$");
        assert_eq!(log[0].1["brief"], json!("new"));
    }

    #[test]
    fn test_enumerate_variants() {
        let mut bus = PubSub::new();
        bus.topic_add("e/a/x", Metadata::new(Dtype::Int), false).unwrap();
        bus.topic_add("e/b", Metadata::new(Dtype::Int), false).unwrap();
        assert_eq!(bus.enumerate("e", false, false).unwrap(), vec!["a", "b"]);
        assert_eq!(bus.enumerate("e", true, false).unwrap(), vec!["e/a", "e/b"]);
        assert_eq!(bus.enumerate("e", false, true).unwrap(), vec!["a", "a/x", "b"]);
        assert!(bus.enumerate("missing", false, false).is_err());
    }

    #[test]
    fn test_deferred_removal_runs_after_dispatch() {
        let mut bus = PubSub::new();
        bus.topic_add("w/!close", Metadata::new(Dtype::None), false).unwrap();
        bus.topic_add("w/state", Metadata::new(Dtype::Int).with_default(0), false).unwrap();
        let seen_during = Arc::new(Mutex::new(None));
        let s = seen_during.clone();
        let sub = Subscriber::from_bus_fn(move |bus, _, _| {
            bus.topic_remove("w/state", true).unwrap();
            *s.lock() = Some(bus.tree().contains("w/state"));
        });
        bus.subscribe("w/!close", &sub, SubscribeFlags::PUB).unwrap();
        bus.publish("w/!close", Value::Null).unwrap();
        assert_eq!(*seen_during.lock(), Some(true));
        assert!(!bus.tree().contains("w/state"));
        assert!(bus.tree().contains("w/!close"));
    }

    #[test]
    fn test_snapshot_shape() {
        let bus = bus_with("s/v", Metadata::new(Dtype::Int).with_default(4));
        let snap = bus.snapshot();
        assert_eq!(snap["topic"], json!(""));
        let s = snap["children"]
            .as_array()
            .unwrap()
            .iter()
            .find(|c| c["topic"] == json!("s"))
            .unwrap();
        assert_eq!(s["children"][0]["value"], json!(4));
        assert_eq!(s["children"][0]["meta"]["dtype"], json!("int"));
    }

    #[test]
    fn test_nested_publish_from_subscriber() {
        let mut bus = PubSub::new();
        bus.topic_add("n/a", Metadata::new(Dtype::Int).with_default(0), false).unwrap();
        bus.topic_add("n/b", Metadata::new(Dtype::Int).with_default(0), false).unwrap();
        let sub = Subscriber::from_bus_fn(|bus, _, v| {
            let doubled = v.as_i64().unwrap_or(0) * 2;
            bus.publish("n/b", json!(doubled)).unwrap();
        });
        bus.subscribe("n/a", &sub, SubscribeFlags::PUB).unwrap();
        bus.publish("n/a", json!(3)).unwrap();
        assert_eq!(bus.query("n/b").unwrap(), json!(6));
    }
}
