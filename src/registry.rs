//! Object Registration and Dispatch Table
//!
//! Turns a declarative [`Registrant`] into topics under
//! `registry/<unique_id>/…` plus a routing table from topic to handler.
//!
//! # Declaration Contract
//!
//! A registrant returns a [`Declaration`] naming:
//!
//! - its type name and whether it registers as a class or an instance,
//! - capability tags (`tag@` expands to `tag.class` / `tag.object`),
//! - settings and events (name → [`Metadata`]),
//! - handlers, each tagged with a [`HandlerKind`] and bound to a
//!   [`Callable`](crate::callable::Callable) whose calling convention is fixed
//!   when it is built.
//!
//! Topics created:
//!
//! | Declared as          | Topic                                   |
//! |----------------------|-----------------------------------------|
//! | setting `x`          | `registry/<id>/settings/x`              |
//! | event `data`         | `registry/<id>/events/!data`            |
//! | action `finalize`    | `registry/<id>/actions/!finalize`       |
//! | callback `done`      | `registry/<id>/callbacks/!done`         |
//!
//! # Handler Precedence
//!
//! When both a class-scoped and an instance-scoped handler exist for the same
//! name, the one matching the registration's kind wins and the other is the
//! fallback. A setting without any handler stores the value and forwards it
//! to [`SettingAccessor::set_value`].
//!
//! # Initial Values
//!
//! Unless flagged `noinit`, each setting receives the first candidate that
//! validates, in this order: a value retained by an earlier registration under
//! the same id, [`SettingAccessor::get_value`], the class's retained value
//! (instances only), the metadata default.
//!
//! # All or Nothing
//!
//! Every declaration problem is detected before anything is touched. Failures
//! after that point (a handler rejecting its initial value, a failing
//! `on_pubsub_register` hook) roll the registration back.

use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::callable::Handler;
use crate::capabilities::expand_capability;
use crate::error::{BusError, BusResult};
use crate::metadata::{Dtype, Flag, Metadata};
use crate::pubsub::PubSub;
use crate::topic::{AddOutcome, SEPARATOR, TRANSIENT_PREFIX};

/// Root of all registered object topics.
pub const REGISTRY_ROOT: &str = "registry";

/// `registry/<unique_id>`
pub fn object_topic(unique_id: &str) -> String {
    format!("{}/{}", REGISTRY_ROOT, unique_id)
}

/// `registry/<unique_id>/settings/<name>`
pub fn setting_topic(unique_id: &str, name: &str) -> String {
    format!("{}/{}/settings/{}", REGISTRY_ROOT, unique_id, name)
}

/// `registry/<unique_id>/events/<name>`, with `!` added when missing.
pub fn event_topic(unique_id: &str, name: &str) -> String {
    format!("{}/{}/events/{}", REGISTRY_ROOT, unique_id, bang(name))
}

/// `registry/<unique_id>/actions/<name>`, with `!` added when missing.
pub fn action_topic(unique_id: &str, name: &str) -> String {
    format!("{}/{}/actions/{}", REGISTRY_ROOT, unique_id, bang(name))
}

/// `registry/<unique_id>/callbacks/<name>`, with `!` added when missing.
pub fn callback_topic(unique_id: &str, name: &str) -> String {
    format!("{}/{}/callbacks/{}", REGISTRY_ROOT, unique_id, bang(name))
}

fn bang(name: &str) -> String {
    if name.starts_with(TRANSIENT_PREFIX) {
        name.to_string()
    } else {
        format!("{}{}", TRANSIENT_PREFIX, name)
    }
}

fn check_segment(what: &str, name: &str) -> BusResult<()> {
    if name.is_empty() || name.contains(SEPARATOR) {
        return Err(BusError::Registration(format!("invalid {} '{}'", what, name)));
    }
    Ok(())
}

// =============================================================================
// Registrant Traits
// =============================================================================

/// Value access the dispatcher uses instead of touching registrant fields.
///
/// Both methods take `&self`; registrants keep mutable state behind their own
/// lock.
pub trait SettingAccessor {
    /// Called with every accepted value of a setting that has no handler.
    fn set_value(&self, _name: &str, _value: &Value) {}

    /// Current value of a setting, used to seed it at registration.
    fn get_value(&self, _name: &str) -> Option<Value> {
        None
    }
}

/// An object that can be registered on the bus.
pub trait Registrant: SettingAccessor + Send + Sync + 'static {
    /// Capabilities, settings, events and handlers.
    fn declaration(&self) -> Declaration;

    /// Runs after every topic exists and initial values are applied.
    ///
    /// An error rolls the registration back.
    fn on_pubsub_register(&self, _bus: &mut PubSub, _unique_id: &str) -> BusResult<()> {
        Ok(())
    }

    /// Runs before capabilities and routes are torn down.
    ///
    /// Errors are logged; unregistration always completes.
    fn on_pubsub_unregister(&self, _bus: &mut PubSub, _unique_id: &str) -> BusResult<()> {
        Ok(())
    }
}

// =============================================================================
// Declaration
// =============================================================================

/// Whether a registrant stands for a type or for one live object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegistrantKind {
    /// Unique id is the type name.
    Class,
    /// Unique id is `TypeName:NNN`.
    Instance,
}

/// Closed set of handler kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HandlerKind {
    /// Setting handler on a class registration.
    ClassSetting,
    /// Setting handler on an instance registration.
    InstanceSetting,
    /// Action handler on a class registration.
    ClassAction,
    /// Action handler on an instance registration.
    InstanceAction,
    /// Callback handler on a class registration.
    ClassCallback,
    /// Callback handler on an instance registration.
    InstanceCallback,
}

/// Topic family a handler serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HandlerCategory {
    /// `settings/<name>`
    Setting,
    /// `actions/!<name>`
    Action,
    /// `callbacks/!<name>`
    Callback,
}

impl HandlerKind {
    /// Registration kind this handler is written for.
    pub fn scope(self) -> RegistrantKind {
        match self {
            HandlerKind::ClassSetting | HandlerKind::ClassAction | HandlerKind::ClassCallback => {
                RegistrantKind::Class
            }
            _ => RegistrantKind::Instance,
        }
    }

    /// Topic family.
    pub fn category(self) -> HandlerCategory {
        match self {
            HandlerKind::ClassSetting | HandlerKind::InstanceSetting => HandlerCategory::Setting,
            HandlerKind::ClassAction | HandlerKind::InstanceAction => HandlerCategory::Action,
            HandlerKind::ClassCallback | HandlerKind::InstanceCallback => HandlerCategory::Callback,
        }
    }
}

/// What a registrant exposes on the bus.
#[derive(Debug, Clone)]
pub struct Declaration {
    kind: RegistrantKind,
    type_name: String,
    capabilities: Vec<String>,
    settings: Vec<(String, Metadata)>,
    events: Vec<(String, Metadata)>,
    handlers: Vec<(HandlerKind, String, Handler)>,
    errors: Vec<String>,
}

impl Declaration {
    fn new(kind: RegistrantKind, type_name: impl Into<String>) -> Self {
        Self {
            kind,
            type_name: type_name.into(),
            capabilities: Vec::new(),
            settings: Vec::new(),
            events: Vec::new(),
            handlers: Vec::new(),
            errors: Vec::new(),
        }
    }

    /// Declaration for a class registration.
    pub fn class(type_name: impl Into<String>) -> Self {
        Self::new(RegistrantKind::Class, type_name)
    }

    /// Declaration for an instance registration.
    pub fn instance(type_name: impl Into<String>) -> Self {
        Self::new(RegistrantKind::Instance, type_name)
    }

    /// Registration kind.
    pub fn kind(&self) -> RegistrantKind {
        self.kind
    }

    /// Type name.
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Add a capability tag.
    pub fn capability(mut self, tag: impl Into<String>) -> Self {
        self.capabilities.push(tag.into());
        self
    }

    /// Add a setting.
    pub fn setting(mut self, name: impl Into<String>, metadata: Metadata) -> Self {
        self.settings.push((name.into(), metadata));
        self
    }

    /// Add a setting from its JSON metadata shape.
    ///
    /// A malformed shape makes the later `register` call fail.
    pub fn setting_json(mut self, name: impl Into<String>, metadata: Value) -> Self {
        let name = name.into();
        match Metadata::from_json(metadata) {
            Ok(meta) => self.settings.push((name, meta)),
            Err(e) => self.errors.push(format!("setting '{}': {}", name, e)),
        }
        self
    }

    /// Add every setting of a `{name: metadata, ...}` JSON object.
    pub fn settings_json(mut self, settings: Value) -> Self {
        match settings {
            Value::Object(map) => {
                for (name, meta) in map {
                    self = self.setting_json(name, meta);
                }
            }
            other => self.errors.push(format!("settings must be an object, got {}", other)),
        }
        self
    }

    /// Add an event.
    pub fn event(mut self, name: impl Into<String>, metadata: Metadata) -> Self {
        self.events.push((name.into(), metadata));
        self
    }

    /// Add an event from its JSON metadata shape.
    pub fn event_json(mut self, name: impl Into<String>, metadata: Value) -> Self {
        let name = name.into();
        match Metadata::from_json(metadata) {
            Ok(meta) => self.events.push((name, meta)),
            Err(e) => self.errors.push(format!("event '{}': {}", name, e)),
        }
        self
    }

    /// Bind a handler.
    pub fn handler(mut self, kind: HandlerKind, name: impl Into<String>, handler: Handler) -> Self {
        self.handlers.push((kind, name.into(), handler));
        self
    }

    /// Instance setting handler.
    pub fn on_setting(self, name: impl Into<String>, handler: Handler) -> Self {
        self.handler(HandlerKind::InstanceSetting, name, handler)
    }

    /// Class setting handler.
    pub fn on_cls_setting(self, name: impl Into<String>, handler: Handler) -> Self {
        self.handler(HandlerKind::ClassSetting, name, handler)
    }

    /// Instance action handler.
    pub fn on_action(self, name: impl Into<String>, handler: Handler) -> Self {
        self.handler(HandlerKind::InstanceAction, name, handler)
    }

    /// Class action handler.
    pub fn on_cls_action(self, name: impl Into<String>, handler: Handler) -> Self {
        self.handler(HandlerKind::ClassAction, name, handler)
    }

    /// Instance callback handler.
    pub fn on_callback(self, name: impl Into<String>, handler: Handler) -> Self {
        self.handler(HandlerKind::InstanceCallback, name, handler)
    }

    /// Class callback handler.
    pub fn on_cls_callback(self, name: impl Into<String>, handler: Handler) -> Self {
        self.handler(HandlerKind::ClassCallback, name, handler)
    }
}

// =============================================================================
// Arena
// =============================================================================

/// Generation-checked handle to a registered object.
///
/// A handle outlives its object safely: once the slot is reused, lookups with
/// the stale handle return `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectHandle {
    index: u32,
    generation: u32,
}

/// A live registration.
pub struct RegisteredObject {
    pub(crate) unique_id: String,
    pub(crate) kind: RegistrantKind,
    pub(crate) type_name: String,
    pub(crate) capabilities: Vec<String>,
    pub(crate) settings: BTreeMap<String, Metadata>,
    pub(crate) events: BTreeMap<String, Metadata>,
    pub(crate) handlers: BTreeMap<String, HandlerKind>,
    pub(crate) routes: Vec<String>,
    pub(crate) parent: Option<ObjectHandle>,
    pub(crate) children: Vec<ObjectHandle>,
    pub(crate) instance: Arc<dyn Registrant>,
}

impl fmt::Debug for RegisteredObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredObject")
            .field("unique_id", &self.unique_id)
            .field("kind", &self.kind)
            .field("capabilities", &self.capabilities)
            .field("handlers", &self.handlers)
            .field("parent", &self.parent)
            .field("children", &self.children)
            .finish_non_exhaustive()
    }
}

impl RegisteredObject {
    /// Unique id.
    pub fn unique_id(&self) -> &str {
        &self.unique_id
    }

    /// Class or instance.
    pub fn kind(&self) -> RegistrantKind {
        self.kind
    }

    /// Declared type name.
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Current capability tags (expanded).
    pub fn capabilities(&self) -> &[String] {
        &self.capabilities
    }

    /// Declared settings.
    pub fn settings(&self) -> &BTreeMap<String, Metadata> {
        &self.settings
    }

    /// Declared events.
    pub fn events(&self) -> &BTreeMap<String, Metadata> {
        &self.events
    }

    /// Resolved handler table: topic relative to the object → winning kind.
    pub fn handlers(&self) -> &BTreeMap<String, HandlerKind> {
        &self.handlers
    }

    /// Parent registration.
    pub fn parent(&self) -> Option<ObjectHandle> {
        self.parent
    }

    /// Child registrations, in registration order.
    pub fn children(&self) -> &[ObjectHandle] {
        &self.children
    }

    /// The registrant itself.
    pub fn instance(&self) -> &Arc<dyn Registrant> {
        &self.instance
    }
}

/// Where a routed publish goes.
#[derive(Debug, Clone)]
pub(crate) enum RouteTarget {
    Handler(Handler),
    Accessor { name: String },
}

#[derive(Debug, Clone)]
pub(crate) struct Route {
    pub(crate) owner: Option<ObjectHandle>,
    pub(crate) target: RouteTarget,
}

struct Slot {
    generation: u32,
    object: Option<RegisteredObject>,
}

/// Arena of registrations plus the topic → handler routes.
#[derive(Default)]
pub(crate) struct Registry {
    slots: Vec<Slot>,
    free: Vec<u32>,
    ids: HashMap<String, ObjectHandle>,
    pub(crate) routes: HashMap<String, Route>,
    instance_counters: HashMap<String, u64>,
}

impl Registry {
    fn insert(&mut self, object: RegisteredObject) -> ObjectHandle {
        let unique_id = object.unique_id.clone();
        let handle = match self.free.pop() {
            Some(index) => match self.slots.get_mut(index as usize) {
                Some(slot) => {
                    slot.object = Some(object);
                    ObjectHandle {
                        index,
                        generation: slot.generation,
                    }
                }
                None => self.push_slot(object),
            },
            None => self.push_slot(object),
        };
        self.ids.insert(unique_id, handle);
        handle
    }

    fn push_slot(&mut self, object: RegisteredObject) -> ObjectHandle {
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            object: Some(object),
        });
        ObjectHandle {
            index,
            generation: 0,
        }
    }

    pub(crate) fn get(&self, handle: ObjectHandle) -> Option<&RegisteredObject> {
        self.slots
            .get(handle.index as usize)
            .filter(|s| s.generation == handle.generation)
            .and_then(|s| s.object.as_ref())
    }

    pub(crate) fn get_mut(&mut self, handle: ObjectHandle) -> Option<&mut RegisteredObject> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|s| s.generation == handle.generation)
            .and_then(|s| s.object.as_mut())
    }

    fn remove(&mut self, handle: ObjectHandle) -> Option<RegisteredObject> {
        let slot = self
            .slots
            .get_mut(handle.index as usize)
            .filter(|s| s.generation == handle.generation)?;
        let object = slot.object.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        self.ids.remove(&object.unique_id);
        Some(object)
    }

    pub(crate) fn lookup(&self, unique_id: &str) -> Option<ObjectHandle> {
        self.ids.get(unique_id).copied()
    }

    pub(crate) fn len(&self) -> usize {
        self.ids.len()
    }

    fn next_instance_id(&mut self, type_name: &str, taken: impl Fn(&str) -> bool) -> String {
        let counter = self.instance_counters.entry(type_name.to_string()).or_insert(0);
        loop {
            *counter += 1;
            let candidate = format!("{}:{:03}", type_name, counter);
            if !self.ids.contains_key(&candidate) && !taken(&candidate) {
                return candidate;
            }
        }
    }
}

// =============================================================================
// Registration
// =============================================================================

type HandlerTable = BTreeMap<(HandlerCategory, String), (HandlerKind, Handler)>;

struct RegistrationPlan {
    unique_id: String,
    kind: RegistrantKind,
    type_name: String,
    topics: Vec<(String, Metadata)>,
    settings: Vec<(String, Metadata)>,
    events: Vec<(String, Metadata)>,
    handlers: HandlerTable,
    capabilities: Vec<String>,
}

impl RegistrationPlan {
    fn handler_topic(&self, category: HandlerCategory, name: &str) -> String {
        match category {
            HandlerCategory::Setting => setting_topic(&self.unique_id, name),
            HandlerCategory::Action => action_topic(&self.unique_id, name),
            HandlerCategory::Callback => callback_topic(&self.unique_id, name),
        }
    }
}

fn normalize_entries(what: &str, entries: &[(String, Metadata)]) -> BusResult<Vec<(String, Metadata)>> {
    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(entries.len());
    for (name, meta) in entries {
        check_segment(what, name)?;
        if !seen.insert(name.as_str()) {
            return Err(BusError::Registration(format!("duplicate {} '{}'", what, name)));
        }
        if meta.is_node() {
            return Err(BusError::Registration(format!("{} '{}' cannot be a node", what, name)));
        }
        let meta = meta
            .clone()
            .normalized()
            .map_err(|e| BusError::Registration(format!("{} '{}': {}", what, name, e)))?;
        out.push((name.clone(), meta));
    }
    Ok(out)
}

fn resolve_handlers(decl: &Declaration, settings: &[(String, Metadata)]) -> BusResult<HandlerTable> {
    let mut table = HandlerTable::new();
    let mut seen = HashSet::new();
    for (kind, name, handler) in &decl.handlers {
        let category = kind.category();
        let name = match category {
            HandlerCategory::Setting => name.clone(),
            _ => bang(name),
        };
        check_segment("handler", &name)?;
        if !seen.insert((*kind, name.clone())) {
            return Err(BusError::Registration(format!(
                "duplicate {:?} handler '{}'",
                kind, name
            )));
        }
        if category == HandlerCategory::Setting && !settings.iter().any(|(s, _)| *s == name) {
            return Err(BusError::Registration(format!(
                "{:?} handler for undeclared setting '{}'",
                kind, name
            )));
        }
        let key = (category, name);
        let replace = match table.get(&key) {
            None => true,
            Some((existing, _)) => kind.scope() == decl.kind && existing.scope() != decl.kind,
        };
        if replace {
            table.insert(key, (*kind, handler.clone()));
        }
    }
    Ok(table)
}

impl PubSub {
    /// Register an object.
    ///
    /// `unique_id` overrides the derived id. Returns the id in use.
    pub fn register(&mut self, object: Arc<dyn Registrant>, unique_id: Option<&str>) -> BusResult<String> {
        self.register_inner(object, unique_id, None)
    }

    /// Register an object as a child of `parent_id`.
    ///
    /// Children are unregistered before their parent.
    pub fn register_child(
        &mut self,
        object: Arc<dyn Registrant>,
        unique_id: Option<&str>,
        parent_id: &str,
    ) -> BusResult<String> {
        let parent = self
            .registry
            .lookup(parent_id)
            .ok_or_else(|| BusError::NotRegistered(parent_id.to_string()))?;
        self.register_inner(object, unique_id, Some(parent))
    }

    fn register_inner(
        &mut self,
        object: Arc<dyn Registrant>,
        unique_id: Option<&str>,
        parent: Option<ObjectHandle>,
    ) -> BusResult<String> {
        let decl = object.declaration();
        let plan = self.plan_registration(&decl, unique_id)?;
        let unique_id = plan.unique_id.clone();

        let handle = self.registry.insert(RegisteredObject {
            unique_id: unique_id.clone(),
            kind: plan.kind,
            type_name: plan.type_name.clone(),
            capabilities: Vec::new(),
            settings: plan.settings.iter().cloned().collect(),
            events: plan.events.iter().cloned().collect(),
            handlers: plan
                .handlers
                .iter()
                .map(|((category, name), (kind, _))| {
                    let relative = match category {
                        HandlerCategory::Setting => format!("settings/{}", name),
                        HandlerCategory::Action => format!("actions/{}", name),
                        HandlerCategory::Callback => format!("callbacks/{}", name),
                    };
                    (relative, *kind)
                })
                .collect(),
            routes: Vec::new(),
            parent,
            children: Vec::new(),
            instance: Arc::clone(&object),
        });

        let mut created = Vec::new();
        if let Err(e) = self.populate(handle, &plan, &object, parent, &mut created) {
            warn!(unique_id = %unique_id, error = %e, "Registration rolled back");
            created.reverse();
            self.teardown(handle, &created);
            return Err(match e {
                BusError::Registration(_) => e,
                other => BusError::Registration(format!("'{}': {}", unique_id, other)),
            });
        }
        info!(unique_id = %unique_id, kind = ?plan.kind, "Registered");
        Ok(unique_id)
    }

    fn plan_registration(&mut self, decl: &Declaration, unique_id: Option<&str>) -> BusResult<RegistrationPlan> {
        if let Some(err) = decl.errors.first() {
            return Err(BusError::Registration(format!("{}: {}", decl.type_name, err)));
        }
        check_segment("type name", &decl.type_name)?;

        let unique_id = match (unique_id, decl.kind) {
            (Some(id), _) => {
                check_segment("unique id", id)?;
                if self.registry.lookup(id).is_some() {
                    return Err(BusError::Registration(format!("duplicate unique id '{}'", id)));
                }
                id.to_string()
            }
            (None, RegistrantKind::Class) => {
                if self.registry.lookup(&decl.type_name).is_some() {
                    return Err(BusError::Registration(format!(
                        "class '{}' already registered",
                        decl.type_name
                    )));
                }
                decl.type_name.clone()
            }
            (None, RegistrantKind::Instance) => {
                let tree = &self.tree;
                self.registry
                    .next_instance_id(&decl.type_name, |id| tree.contains(&object_topic(id)))
            }
        };

        let settings = normalize_entries("setting", &decl.settings)?;
        let events = normalize_entries("event", &decl.events)?;
        let handlers = resolve_handlers(decl, &settings)?;

        let mut capabilities: Vec<String> = Vec::new();
        for tag in &decl.capabilities {
            let expanded = expand_capability(tag, decl.kind);
            check_segment("capability", &expanded)?;
            if !capabilities.contains(&expanded) {
                capabilities.push(expanded);
            }
        }

        let mut plan = RegistrationPlan {
            unique_id,
            kind: decl.kind,
            type_name: decl.type_name.clone(),
            topics: Vec::new(),
            settings,
            events,
            handlers,
            capabilities,
        };

        let mut topics = vec![(object_topic(&plan.unique_id), Metadata::node(&plan.type_name))];
        for (name, meta) in &plan.settings {
            topics.push((setting_topic(&plan.unique_id, name), meta.clone()));
        }
        for (name, meta) in &plan.events {
            topics.push((event_topic(&plan.unique_id, name), meta.clone()));
        }
        for (category, name) in plan.handlers.keys() {
            if *category != HandlerCategory::Setting {
                topics.push((plan.handler_topic(*category, name), Metadata::new(Dtype::Obj)));
            }
        }
        // The id is free, so existing leaves below it are leftovers of an
        // earlier registration and take the newly declared metadata.
        for (path, meta) in &topics {
            self.tree
                .check_add(path, meta, !meta.is_node())
                .map_err(|e| BusError::Registration(e.to_string()))?;
        }
        plan.topics = topics;
        Ok(plan)
    }

    fn populate(
        &mut self,
        handle: ObjectHandle,
        plan: &RegistrationPlan,
        object: &Arc<dyn Registrant>,
        parent: Option<ObjectHandle>,
        created: &mut Vec<String>,
    ) -> BusResult<()> {
        for (path, meta) in &plan.topics {
            let outcome = self.tree.add(path, meta.clone(), !meta.is_node())?;
            self.cancel_deferred(path);
            match outcome {
                AddOutcome::Created => created.push(path.clone()),
                AddOutcome::Replaced => self.notify_metadata(path),
                AddOutcome::Unchanged => {}
            }
        }

        for (name, _) in &plan.settings {
            let target = match plan.handlers.get(&(HandlerCategory::Setting, name.clone())) {
                Some((_, handler)) => RouteTarget::Handler(handler.clone()),
                None => RouteTarget::Accessor { name: name.clone() },
            };
            self.install_route(handle, setting_topic(&plan.unique_id, name), target);
        }
        for ((category, name), (_, handler)) in &plan.handlers {
            if *category != HandlerCategory::Setting {
                let path = plan.handler_topic(*category, name);
                self.install_route(handle, path, RouteTarget::Handler(handler.clone()));
            }
        }

        for (name, meta) in &plan.settings {
            if meta.has_flag(Flag::NoInit) {
                continue;
            }
            let path = setting_topic(&plan.unique_id, name);
            let fresh = created.contains(&path);
            if let Some(value) = self.initial_value(plan, name, meta, &path, fresh, object) {
                let was = self.undo.set_replaying(true);
                let result = self.publish_owned(&path, value);
                self.undo.set_replaying(was);
                result?;
            }
        }

        for tag in &plan.capabilities {
            self.capability_attach(handle, tag)?;
        }

        if let Some(parent) = parent {
            if let Some(p) = self.registry.get_mut(parent) {
                p.children.push(handle);
            }
        }

        object.on_pubsub_register(self, &plan.unique_id)
    }

    fn install_route(&mut self, handle: ObjectHandle, path: String, target: RouteTarget) {
        if let Some(object) = self.registry.get_mut(handle) {
            object.routes.push(path.clone());
        }
        self.registry.routes.insert(
            path,
            Route {
                owner: Some(handle),
                target,
            },
        );
    }

    fn initial_value(
        &self,
        plan: &RegistrationPlan,
        name: &str,
        meta: &Metadata,
        path: &str,
        fresh: bool,
        object: &Arc<dyn Registrant>,
    ) -> Option<Value> {
        let leftover = if fresh {
            None
        } else {
            self.tree.retained(path).cloned()
        };
        let inherited = match plan.kind {
            RegistrantKind::Instance => self
                .tree
                .retained(&setting_topic(&plan.type_name, name))
                .cloned(),
            RegistrantKind::Class => None,
        };
        let candidates = [
            ("retained", leftover),
            ("accessor", object.get_value(name)),
            ("class", inherited),
            ("default", meta.default.clone()),
        ];
        for (source, candidate) in candidates {
            let Some(candidate) = candidate else {
                continue;
            };
            match meta.validate(&candidate) {
                Ok(value) => {
                    debug!(topic = path, source, "Initial setting value");
                    return Some(value);
                }
                Err(e) => {
                    warn!(topic = path, source, error = %e, "Initial value candidate rejected");
                }
            }
        }
        None
    }

    /// Unregister an object and, first, all of its children.
    ///
    /// With `delete`, the object's topic subtree is removed (deferred when
    /// called during dispatch); otherwise topics and retained values stay and
    /// seed a later registration under the same id.
    pub fn unregister(&mut self, unique_id: &str, delete: bool) -> BusResult<()> {
        let handle = self
            .registry
            .lookup(unique_id)
            .ok_or_else(|| BusError::NotRegistered(unique_id.to_string()))?;
        self.unregister_handle(handle, delete);
        Ok(())
    }

    fn unregister_handle(&mut self, handle: ObjectHandle, delete: bool) {
        let Some((unique_id, children, instance)) = self
            .registry
            .get(handle)
            .map(|o| (o.unique_id.clone(), o.children.clone(), Arc::clone(&o.instance)))
        else {
            return;
        };
        for child in children.into_iter().rev() {
            self.unregister_handle(child, delete);
        }
        if let Err(e) = instance.on_pubsub_unregister(self, &unique_id) {
            warn!(unique_id = %unique_id, error = %e, "on_pubsub_unregister failed");
        }
        let topics = if delete {
            vec![object_topic(&unique_id)]
        } else {
            Vec::new()
        };
        self.teardown(handle, &topics);
        info!(unique_id = %unique_id, delete, "Unregistered");
    }

    fn teardown(&mut self, handle: ObjectHandle, remove_topics: &[String]) {
        let Some((tags, routes, parent)) = self
            .registry
            .get(handle)
            .map(|o| (o.capabilities.clone(), o.routes.clone(), o.parent))
        else {
            return;
        };
        let prune = !remove_topics.is_empty();
        for tag in &tags {
            self.capability_detach(handle, tag, prune);
        }
        for path in &routes {
            if self
                .registry
                .routes
                .get(path)
                .is_some_and(|r| r.owner == Some(handle))
            {
                self.registry.routes.remove(path);
            }
        }
        for path in remove_topics {
            if self.tree.contains(path) {
                if let Err(e) = self.topic_remove(path, true) {
                    warn!(topic = %path, error = %e, "Topic removal during teardown failed");
                }
            }
        }
        if let Some(parent) = parent {
            if let Some(p) = self.registry.get_mut(parent) {
                p.children.retain(|c| *c != handle);
            }
        }
        self.registry.remove(handle);
    }

    /// Registration by unique id.
    pub fn registered(&self, unique_id: &str) -> Option<&RegisteredObject> {
        self.registry.lookup(unique_id).and_then(|h| self.registry.get(h))
    }

    /// Handle for a unique id.
    pub fn handle(&self, unique_id: &str) -> Option<ObjectHandle> {
        self.registry.lookup(unique_id)
    }

    /// Registration by handle; `None` once the handle is stale.
    pub fn object(&self, handle: ObjectHandle) -> Option<&RegisteredObject> {
        self.registry.get(handle)
    }

    /// Every registered unique id, sorted.
    pub fn registered_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.registry.ids.keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callable::Callable;
    use parking_lot::Mutex;
    use serde_json::json;

    struct TestObject {
        declaration: Declaration,
        values: Mutex<HashMap<String, Value>>,
        seed: Option<(String, Value)>,
        fail_hook: bool,
    }

    impl TestObject {
        fn new(declaration: Declaration) -> Arc<Self> {
            Arc::new(Self {
                declaration,
                values: Mutex::new(HashMap::new()),
                seed: None,
                fail_hook: false,
            })
        }
    }

    impl SettingAccessor for TestObject {
        fn set_value(&self, name: &str, value: &Value) {
            self.values.lock().insert(name.to_string(), value.clone());
        }

        fn get_value(&self, name: &str) -> Option<Value> {
            self.seed
                .as_ref()
                .filter(|(n, _)| n == name)
                .map(|(_, v)| v.clone())
        }
    }

    impl Registrant for TestObject {
        fn declaration(&self) -> Declaration {
            self.declaration.clone()
        }

        fn on_pubsub_register(&self, _bus: &mut PubSub, unique_id: &str) -> BusResult<()> {
            if self.fail_hook {
                Err(BusError::handler(unique_id, "hook failed"))
            } else {
                Ok(())
            }
        }
    }

    fn foo() -> Declaration {
        Declaration::class("Foo").settings_json(json!({
            "x": {"dtype": "int", "range": [0, 10], "default": 5}
        }))
    }

    #[test]
    fn test_class_registration_applies_default() {
        let mut bus = PubSub::new();
        let obj = TestObject::new(foo());
        let id = bus.register(obj.clone(), None).unwrap();
        assert_eq!(id, "Foo");
        assert_eq!(bus.query("registry/Foo/settings/x").unwrap(), json!(5));
        assert_eq!(obj.values.lock().get("x"), Some(&json!(5)));
        bus.publish("registry/Foo/settings/x", json!(7)).unwrap();
        assert_eq!(obj.values.lock().get("x"), Some(&json!(7)));
    }

    #[test]
    fn test_duplicate_class_rejected() {
        let mut bus = PubSub::new();
        bus.register(TestObject::new(foo()), None).unwrap();
        let err = bus.register(TestObject::new(foo()), None).unwrap_err();
        assert!(matches!(err, BusError::Registration(_)));
    }

    #[test]
    fn test_instance_ids_are_fresh() {
        let mut bus = PubSub::new();
        let decl = Declaration::instance("Dev");
        let a = bus.register(TestObject::new(decl.clone()), None).unwrap();
        let b = bus.register(TestObject::new(decl.clone()), None).unwrap();
        assert_eq!(a, "Dev:001");
        assert_eq!(b, "Dev:002");
        bus.unregister(&a, true).unwrap();
        let c = bus.register(TestObject::new(decl), None).unwrap();
        assert_eq!(c, "Dev:003");
    }

    #[test]
    fn test_invalid_declaration_leaves_nothing() {
        let mut bus = PubSub::new();
        let before = bus.tree().paths();
        let decl = Declaration::class("Bad")
            .setting("ok", Metadata::new(Dtype::Int))
            .setting_json("bad", json!({"dtype": "u8", "default": 1000}));
        assert!(matches!(
            bus.register(TestObject::new(decl), None),
            Err(BusError::Registration(_))
        ));
        assert_eq!(bus.tree().paths(), before);
        assert!(bus.registered("Bad").is_none());
    }

    #[test]
    fn test_handler_for_undeclared_setting_rejected() {
        let mut bus = PubSub::new();
        let decl = Declaration::class("H").on_setting("missing", Callable::no_args(|| Ok(None)));
        assert!(matches!(
            bus.register(TestObject::new(decl), None),
            Err(BusError::Registration(_))
        ));
    }

    #[test]
    fn test_handler_precedence_matches_kind() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let (c1, c2) = (calls.clone(), calls.clone());
        let decl = |kind: fn(&str) -> Declaration| {
            let (c1, c2) = (c1.clone(), c2.clone());
            kind("P")
                .setting("v", Metadata::new(Dtype::Int).with_default(0))
                .on_cls_setting("v", Callable::value(move |_| {
                    c1.lock().push("class");
                    Ok(None)
                }))
                .on_setting("v", Callable::value(move |_| {
                    c2.lock().push("instance");
                    Ok(None)
                }))
        };
        let mut bus = PubSub::new();
        bus.register(TestObject::new(decl(|n| Declaration::class(n))), None)
            .unwrap();
        let id = bus
            .register(TestObject::new(decl(|n| Declaration::instance(n))), None)
            .unwrap();
        assert_eq!(*calls.lock(), vec!["class", "instance"]);
        assert_eq!(
            bus.registered(&id).unwrap().handlers().get("settings/v"),
            Some(&HandlerKind::InstanceSetting)
        );
    }

    #[test]
    fn test_noinit_skips_initial_value() {
        let mut bus = PubSub::new();
        let decl = Declaration::class("N").setting(
            "v",
            Metadata::new(Dtype::Int).with_default(3).with_flag(Flag::NoInit),
        );
        bus.register(TestObject::new(decl), None).unwrap();
        assert!(bus.query("registry/N/settings/v").is_err());
    }

    #[test]
    fn test_accessor_seed_and_class_inheritance() {
        let mut bus = PubSub::new();
        let class = Declaration::class("W").setting("color", Metadata::new(Dtype::Color).with_default("#000"));
        bus.register(TestObject::new(class.clone()), None).unwrap();
        bus.publish("registry/W/settings/color", json!("#ff0000")).unwrap();

        let instance = Declaration::instance("W").setting("color", Metadata::new(Dtype::Color).with_default("#000"));
        let inherited = bus.register(TestObject::new(instance.clone()), None).unwrap();
        assert_eq!(
            bus.query(&setting_topic(&inherited, "color")).unwrap(),
            json!("#ffff0000")
        );

        let seeded = Arc::new(TestObject {
            declaration: instance,
            values: Mutex::new(HashMap::new()),
            seed: Some(("color".into(), json!("#00ff00"))),
            fail_hook: false,
        });
        let id = bus.register(seeded, None).unwrap();
        assert_eq!(bus.query(&setting_topic(&id, "color")).unwrap(), json!("#ff00ff00"));
    }

    #[test]
    fn test_leftover_values_seed_reregistration() {
        let mut bus = PubSub::new();
        bus.register(TestObject::new(foo()), None).unwrap();
        bus.publish("registry/Foo/settings/x", json!(9)).unwrap();
        bus.unregister("Foo", false).unwrap();
        assert_eq!(bus.query("registry/Foo/settings/x").unwrap(), json!(9));
        bus.register(TestObject::new(foo()), None).unwrap();
        assert_eq!(bus.query("registry/Foo/settings/x").unwrap(), json!(9));
    }

    #[test]
    fn test_hook_failure_rolls_back() {
        let mut bus = PubSub::new();
        let before = bus.tree().paths();
        let obj = Arc::new(TestObject {
            declaration: foo().capability("device"),
            values: Mutex::new(HashMap::new()),
            seed: None,
            fail_hook: true,
        });
        assert!(matches!(bus.register(obj, None), Err(BusError::Registration(_))));
        assert_eq!(bus.tree().paths(), before);
        assert!(bus.capability_members("device").is_empty());
        assert!(bus.registered("Foo").is_none());
    }

    #[test]
    fn test_actions_and_callbacks_are_routed() {
        let hits = Arc::new(Mutex::new(Vec::new()));
        let (h1, h2) = (hits.clone(), hits.clone());
        let decl = Declaration::class("R")
            .on_action("finalize", Callable::topic_value(move |t, _| {
                h1.lock().push(t.to_string());
                Ok(None)
            }))
            .on_callback("!done", Callable::value(move |v| {
                h2.lock().push(v.to_string());
                Ok(None)
            }));
        let mut bus = PubSub::new();
        bus.register(TestObject::new(decl), None).unwrap();
        bus.publish(&action_topic("R", "finalize"), Value::Null).unwrap();
        bus.publish("registry/R/callbacks/!done", json!(1)).unwrap();
        assert_eq!(*hits.lock(), vec!["registry/R/actions/!finalize", "1"]);
    }

    #[test]
    fn test_children_unregister_first() {
        let order = Arc::new(Mutex::new(Vec::new()));

        struct Tracked(Declaration, Arc<Mutex<Vec<String>>>);
        impl SettingAccessor for Tracked {}
        impl Registrant for Tracked {
            fn declaration(&self) -> Declaration {
                self.0.clone()
            }
            fn on_pubsub_unregister(&self, _bus: &mut PubSub, unique_id: &str) -> BusResult<()> {
                self.1.lock().push(unique_id.to_string());
                Ok(())
            }
        }

        let mut bus = PubSub::new();
        let parent = bus
            .register(Arc::new(Tracked(Declaration::instance("Parent"), order.clone())), None)
            .unwrap();
        let child = bus
            .register_child(
                Arc::new(Tracked(Declaration::instance("Child"), order.clone())),
                None,
                &parent,
            )
            .unwrap();
        let stale = bus.handle(&child).unwrap();
        bus.unregister(&parent, true).unwrap();
        assert_eq!(*order.lock(), vec![child, parent]);
        assert!(bus.object(stale).is_none());
        assert!(bus.registered_ids().is_empty());
    }

    #[test]
    fn test_unregister_unknown() {
        let mut bus = PubSub::new();
        assert!(matches!(bus.unregister("ghost", false), Err(BusError::NotRegistered(_))));
    }
}
