//! Capability Index
//!
//! Maps capability tags to the ordered set of registered objects exposing
//! them. Each tag has a retained, read-only list topic,
//! `registry_manager/capabilities/<tag>/list`, holding the member unique ids
//! and republished on every membership change. Subscribing to it with
//! [`SubscribeFlags::RETAIN_PUB`](crate::callable::SubscribeFlags::RETAIN_PUB)
//! reports current members immediately and every change afterwards.
//!
//! Membership is stored as [`ObjectHandle`]s; unique ids are resolved when the
//! list is published.

use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{debug, warn};

use crate::error::{BusError, BusResult};
use crate::metadata::{Dtype, Flag, Metadata};
use crate::pubsub::PubSub;
use crate::registry::{ObjectHandle, RegistrantKind};

/// Scope marker: `tag@` means `tag.class` on a class, `tag.object` on an instance.
pub const SCOPE_MARKER: char = '@';

/// Instantiable range tool class.
pub const RANGE_TOOL_CLASS: &str = "range_tool.class";
/// Active range tool.
pub const RANGE_TOOL_OBJECT: &str = "range_tool.object";
/// Factory for physically attached devices.
pub const DEVICE_FACTORY: &str = "device_factory";
/// Physically attached device.
pub const DEVICE: &str = "device";
/// Device class.
pub const DEVICE_CLASS: &str = "device.class";
/// Device instance.
pub const DEVICE_OBJECT: &str = "device.object";
/// Provides signal samples.
pub const SIGNAL_SOURCE: &str = "signal.source";
/// Signal source that can stream live data.
pub const SIGNAL_STREAMING: &str = "signal.streaming";
/// Consumes signal samples.
pub const SIGNAL_SINK: &str = "signal.sink";
/// Provides multimeter-style statistics.
pub const STATISTICS_SOURCE: &str = "statistics.source";
/// Consumes statistics.
pub const STATISTICS_SINK: &str = "statistics.sink";
/// Source of a multi-signal buffer.
pub const SIGNAL_BUFFER_SOURCE: &str = "signal_buffer.source";
/// View container.
pub const VIEW_OBJECT: &str = "view.object";
/// Widget class.
pub const WIDGET_CLASS: &str = "widget.class";
/// Widget instance.
pub const WIDGET_OBJECT: &str = "widget.object";

/// Tags with list topics installed by [`BusConfig::default`](crate::config::BusConfig).
pub const WELL_KNOWN: &[&str] = &[
    DEVICE_FACTORY,
    DEVICE_CLASS,
    DEVICE_OBJECT,
    SIGNAL_SOURCE,
    SIGNAL_STREAMING,
    SIGNAL_SINK,
    STATISTICS_SOURCE,
    STATISTICS_SINK,
    WIDGET_CLASS,
    WIDGET_OBJECT,
];

/// Root of the capability list topics.
pub const CAPABILITIES_ROOT: &str = "registry_manager/capabilities";

/// `registry_manager/capabilities/<tag>/list`
pub fn list_topic(tag: &str) -> String {
    format!("{}/{}/list", CAPABILITIES_ROOT, tag)
}

/// Resolve the scope marker for a registration kind.
pub fn expand_capability(tag: &str, kind: RegistrantKind) -> String {
    match tag.strip_suffix(SCOPE_MARKER) {
        Some(base) => match kind {
            RegistrantKind::Class => format!("{}.class", base),
            RegistrantKind::Instance => format!("{}.object", base),
        },
        None => tag.to_string(),
    }
}

fn list_metadata(tag: &str) -> Metadata {
    Metadata::new(Dtype::UniqueStrings)
        .with_brief(format!("Objects with capability {}", tag))
        .with_default(Value::Array(Vec::new()))
        .with_flags(&[Flag::ReadOnly, Flag::SkipUndo, Flag::Hidden])
}

#[derive(Debug, Clone, Default)]
struct CapabilityEntry {
    members: Vec<ObjectHandle>,
    persistent: bool,
}

/// Tag → members.
#[derive(Debug, Default)]
pub(crate) struct CapabilityIndex {
    entries: BTreeMap<String, CapabilityEntry>,
}

impl CapabilityIndex {
    fn members(&self, tag: &str) -> &[ObjectHandle] {
        self.entries
            .get(tag)
            .map(|e| e.members.as_slice())
            .unwrap_or_default()
    }
}

impl PubSub {
    /// Install a tag's list topic independently of any member.
    ///
    /// Such lists persist when they become empty.
    pub fn capability_add(&mut self, tag: &str) -> BusResult<()> {
        self.capability_ensure(tag)?;
        if let Some(entry) = self.capabilities.entries.get_mut(tag) {
            entry.persistent = true;
        }
        Ok(())
    }

    fn capability_ensure(&mut self, tag: &str) -> BusResult<()> {
        if self.capabilities.entries.contains_key(tag) {
            return Ok(());
        }
        self.topic_add(&list_topic(tag), list_metadata(tag), true)?;
        self.capabilities
            .entries
            .insert(tag.to_string(), CapabilityEntry::default());
        debug!(tag, "Capability list created");
        Ok(())
    }

    pub(crate) fn capability_attach(&mut self, handle: ObjectHandle, tag: &str) -> BusResult<()> {
        self.capability_ensure(tag)?;
        let Some(entry) = self.capabilities.entries.get_mut(tag) else {
            return Ok(());
        };
        if entry.members.contains(&handle) {
            return Ok(());
        }
        entry.members.push(handle);
        if let Some(object) = self.registry.get_mut(handle) {
            if !object.capabilities.iter().any(|t| t == tag) {
                object.capabilities.push(tag.to_string());
            }
        }
        self.capability_publish(tag);
        Ok(())
    }

    /// Remove `handle` from a tag.
    ///
    /// With `prune`, a non-persistent list that ends up empty and unwatched
    /// is removed altogether.
    pub(crate) fn capability_detach(&mut self, handle: ObjectHandle, tag: &str, prune: bool) {
        if let Some(object) = self.registry.get_mut(handle) {
            object.capabilities.retain(|t| t != tag);
        }
        let Some(entry) = self.capabilities.entries.get_mut(tag) else {
            return;
        };
        let before = entry.members.len();
        entry.members.retain(|h| *h != handle);
        if entry.members.len() == before {
            return;
        }
        let path = list_topic(tag);
        let removable = prune && entry.members.is_empty() && !entry.persistent;
        if removable && !self.has_subscribers(&path) {
            self.capabilities.entries.remove(tag);
            if let Err(e) = self.topic_remove(&path, true) {
                warn!(tag, error = %e, "Failed to remove capability list");
            }
            return;
        }
        self.capability_publish(tag);
    }

    fn capability_publish(&mut self, tag: &str) {
        let ids: Vec<Value> = self
            .capabilities
            .members(tag)
            .iter()
            .filter_map(|h| self.registry.get(*h))
            .map(|o| Value::String(o.unique_id.clone()))
            .collect();
        if let Err(e) = self.publish_owned(&list_topic(tag), Value::Array(ids)) {
            warn!(tag, error = %e, "Failed to publish capability list");
        }
    }

    fn capability_target(&self, unique_id: &str) -> BusResult<(ObjectHandle, RegistrantKind)> {
        self.handle(unique_id)
            .and_then(|h| self.object(h).map(|o| (h, o.kind())))
            .ok_or_else(|| BusError::CapabilityOperationOnUnknown(unique_id.to_string()))
    }

    /// Add capability tags to a registered object.
    ///
    /// An unknown `unique_id` is logged and ignored.
    pub fn capabilities_append(&mut self, unique_id: &str, tags: &[&str]) -> BusResult<()> {
        let (handle, kind) = match self.capability_target(unique_id) {
            Ok(target) => target,
            Err(e) => {
                warn!(error = %e, "Ignoring capabilities_append");
                return Ok(());
            }
        };
        for tag in tags {
            let tag = expand_capability(tag, kind);
            if tag.is_empty() || tag.contains('/') {
                return Err(BusError::InvalidPath(tag));
            }
            self.capability_attach(handle, &tag)?;
        }
        Ok(())
    }

    /// Remove capability tags from a registered object.
    ///
    /// An unknown `unique_id` is logged and ignored. The list topic stays.
    pub fn capabilities_remove(&mut self, unique_id: &str, tags: &[&str]) -> BusResult<()> {
        let (handle, kind) = match self.capability_target(unique_id) {
            Ok(target) => target,
            Err(e) => {
                warn!(error = %e, "Ignoring capabilities_remove");
                return Ok(());
            }
        };
        for tag in tags {
            self.capability_detach(handle, &expand_capability(tag, kind), false);
        }
        Ok(())
    }

    /// Unique ids holding `tag`, in join order.
    pub fn capability_members(&self, tag: &str) -> Vec<String> {
        self.capabilities
            .members(tag)
            .iter()
            .filter_map(|h| self.registry.get(*h))
            .map(|o| o.unique_id.clone())
            .collect()
    }

    /// Every tag with a list topic.
    pub fn capability_tags(&self) -> Vec<String> {
        self.capabilities.entries.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{Declaration, Registrant, SettingAccessor};
    use serde_json::json;
    use std::sync::Arc;

    struct Plain(Declaration);
    impl SettingAccessor for Plain {}
    impl Registrant for Plain {
        fn declaration(&self) -> Declaration {
            self.0.clone()
        }
    }

    #[test]
    fn test_scope_marker_expansion() {
        assert_eq!(expand_capability("device@", RegistrantKind::Class), "device.class");
        assert_eq!(expand_capability("device@", RegistrantKind::Instance), "device.object");
        assert_eq!(expand_capability("signal.source", RegistrantKind::Instance), "signal.source");
    }

    #[test]
    fn test_registration_populates_list() {
        let mut bus = PubSub::new();
        let id = bus
            .register(Arc::new(Plain(Declaration::instance("Js220").capability("device@"))), None)
            .unwrap();
        assert_eq!(bus.query(&list_topic(DEVICE_OBJECT)).unwrap(), json!([id]));
        assert_eq!(bus.capability_members(DEVICE_OBJECT), vec![id]);
    }

    #[test]
    fn test_append_remove_republish() {
        let mut bus = PubSub::new();
        let id = bus
            .register(Arc::new(Plain(Declaration::instance("Js110"))), None)
            .unwrap();
        bus.capabilities_append(&id, &[SIGNAL_SOURCE]).unwrap();
        assert_eq!(bus.query(&list_topic(SIGNAL_SOURCE)).unwrap(), json!([id.clone()]));
        bus.capabilities_remove(&id, &[SIGNAL_SOURCE]).unwrap();
        assert_eq!(bus.query(&list_topic(SIGNAL_SOURCE)).unwrap(), json!([]));
        assert!(bus.registered(&id).unwrap().capabilities().is_empty());
    }

    #[test]
    fn test_list_topic_is_read_only() {
        let mut bus = PubSub::new();
        bus.capability_add(DEVICE_FACTORY).unwrap();
        assert!(matches!(
            bus.publish(&list_topic(DEVICE_FACTORY), json!(["intruder"])),
            Err(BusError::ReadOnly(_))
        ));
    }

    #[test]
    fn test_unknown_identity_is_ignored() {
        let mut bus = PubSub::new();
        assert!(bus.capabilities_append("ghost", &[DEVICE]).is_ok());
        assert!(bus.capabilities_remove("ghost", &[DEVICE]).is_ok());
        assert!(bus.capability_tags().is_empty());
    }

    #[test]
    fn test_persistent_list_survives_delete() {
        let mut bus = PubSub::new();
        bus.capability_add(WIDGET_OBJECT).unwrap();
        let id = bus
            .register(Arc::new(Plain(Declaration::instance("Meter").capability("widget@"))), None)
            .unwrap();
        bus.unregister(&id, true).unwrap();
        assert_eq!(bus.query(&list_topic(WIDGET_OBJECT)).unwrap(), json!([]));
    }
}
