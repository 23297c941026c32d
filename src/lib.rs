//! # DAQ Pub/Sub Core Library
//!
//! A hierarchical publish/subscribe registry for data-acquisition
//! applications. Every piece of application state lives in a tree of typed
//! topics; instruments, views and tools register themselves as objects that
//! own a subtree, advertise capabilities, and react to publishes through
//! handlers. All user-visible changes flow through one dispatcher, which
//! records inverses so they can be undone and redone in groups.
//!
//! ## Crate Structure
//!
//! - **`topic`**: the topic tree, path helpers and reserved suffixes.
//! - **`metadata`**: topic metadata (`dtype`, options, range, flags) and value
//!   validation with coercion.
//! - **`callable`**: subscriber and handler calling conventions, plus
//!   subscription flags.
//! - **`pubsub`**: the `PubSub` dispatcher: topic lifecycle, publish,
//!   subscribe, queries and the relay drain.
//! - **`registry`**: object registration, declarations and the route table.
//! - **`capabilities`**: capability tags and their retained list topics.
//! - **`undo`**: the undo/redo engine and command groups.
//! - **`relay`**: thread-safe injection of publishes into the dispatch context.
//! - **`aggregator`**: summary topics reduced over a capability's members.
//! - **`config`**: Figment-based configuration.
//! - **`logging`**: `tracing-subscriber` setup.
//! - **`error`**: the `BusError` enum.

pub mod aggregator;
pub mod callable;
pub mod capabilities;
pub mod config;
pub mod error;
pub mod logging;
pub mod metadata;
pub mod pubsub;
pub mod registry;
pub mod relay;
pub mod topic;
pub mod undo;

pub use error::{BusError, BusResult};
pub use pubsub::PubSub;

/// Common imports for bus users.
pub mod prelude {
    pub use crate::aggregator::{reduce, Aggregator};
    pub use crate::callable::{Callable, Callback, Handler, HandlerResult, SubscribeFlags, Subscriber};
    pub use crate::capabilities::{expand_capability, list_topic};
    pub use crate::config::BusConfig;
    pub use crate::error::{BusError, BusResult, ValidationError};
    pub use crate::metadata::{Dtype, Flag, Metadata};
    pub use crate::pubsub::PubSub;
    pub use crate::registry::{
        action_topic, callback_topic, event_topic, object_topic, setting_topic, Declaration,
        HandlerKind, Registrant, RegistrantKind, SettingAccessor,
    };
    pub use crate::relay::Relay;
    pub use crate::undo::{Command, Inverse};
}
