//! Command / undo engine.
//!
//! The engine only keeps the history; [`PubSub::undo`](crate::pubsub::PubSub::undo)
//! and [`PubSub::redo`](crate::pubsub::PubSub::redo) apply it. Entries carry a
//! group id, and undo/redo always move one whole group:
//!
//! - explicit groups bracket publishes between `command_group_start` and
//!   `command_group_end` (nesting joins the outermost group),
//! - otherwise each top-level publish opens an implicit group that nested
//!   publishes made during its dispatch join,
//! - anything else gets a group of its own.
//!
//! Recording a new entry clears the redo stack. History is capped at
//! `max_entries`, trimmed from the oldest end one whole group at a time.

use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{BusError, BusResult};
use crate::pubsub::PubSub;

/// A `(topic, value)` publish.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    /// Target topic.
    pub topic: String,
    /// Value to publish.
    pub value: Value,
}

impl Command {
    /// Build a command.
    pub fn new(topic: impl Into<String>, value: Value) -> Self {
        Self {
            topic: topic.into(),
            value,
        }
    }
}

/// Function computing an inverse from the bus state at undo time.
pub type InverseFn = Arc<dyn Fn(&PubSub) -> BusResult<Command> + Send + Sync>;

/// How to reverse a recorded command.
#[derive(Clone)]
pub enum Inverse {
    /// Publish a fixed command.
    Publish(Command),
    /// Compute the command when the undo is applied.
    Deferred(InverseFn),
}

impl fmt::Debug for Inverse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Inverse::Publish(cmd) => f.debug_tuple("Publish").field(cmd).finish(),
            Inverse::Deferred(_) => f.write_str("Deferred(..)"),
        }
    }
}

impl Inverse {
    /// Inverse that publishes `value` to `topic`.
    pub fn publish(topic: impl Into<String>, value: Value) -> Self {
        Inverse::Publish(Command::new(topic, value))
    }

    /// Inverse computed at undo time.
    pub fn deferred(f: impl Fn(&PubSub) -> BusResult<Command> + Send + Sync + 'static) -> Self {
        Inverse::Deferred(Arc::new(f))
    }

    /// Resolve to a concrete command.
    pub fn resolve(&self, bus: &PubSub) -> BusResult<Command> {
        match self {
            Inverse::Publish(cmd) => Ok(cmd.clone()),
            Inverse::Deferred(f) => f(bus),
        }
    }
}

/// One recorded mutation.
#[derive(Debug, Clone)]
pub struct UndoEntry {
    /// What was applied.
    pub forward: Command,
    /// How to reverse it.
    pub inverse: Inverse,
    /// Entries sharing a group undo and redo together.
    pub group_id: u64,
    seq: u64,
}

/// Undo/redo history with grouping.
#[derive(Debug)]
pub struct UndoEngine {
    undos: Vec<UndoEntry>,
    redos: Vec<UndoEntry>,
    next_group: u64,
    next_seq: u64,
    explicit_depth: u32,
    explicit_group: Option<u64>,
    implicit_group: Option<u64>,
    replaying: bool,
    skip_core_undo: bool,
    max_entries: usize,
}

impl UndoEngine {
    /// Empty history.
    pub fn new(skip_core_undo: bool, max_entries: usize) -> Self {
        Self {
            undos: Vec::new(),
            redos: Vec::new(),
            next_group: 1,
            next_seq: 0,
            explicit_depth: 0,
            explicit_group: None,
            implicit_group: None,
            replaying: false,
            skip_core_undo,
            max_entries: max_entries.max(1),
        }
    }

    fn allocate_group(&mut self) -> u64 {
        let id = self.next_group;
        self.next_group += 1;
        id
    }

    /// True when automatic setting capture is globally suppressed.
    pub fn skip_core_undo(&self) -> bool {
        self.skip_core_undo
    }

    /// Enable or disable global suppression of automatic setting capture.
    pub fn set_skip_core_undo(&mut self, skip: bool) {
        self.skip_core_undo = skip;
    }

    /// True while an undo or redo is being applied.
    pub fn is_replaying(&self) -> bool {
        self.replaying
    }

    pub(crate) fn set_replaying(&mut self, replaying: bool) -> bool {
        std::mem::replace(&mut self.replaying, replaying)
    }

    /// Open an explicit group, returning its id.
    pub fn group_start(&mut self) -> u64 {
        self.explicit_depth += 1;
        match self.explicit_group {
            Some(id) => id,
            None => {
                let id = self.implicit_group.unwrap_or_else(|| self.allocate_group());
                self.explicit_group = Some(id);
                id
            }
        }
    }

    /// Close an explicit group. Unbalanced calls are ignored.
    pub fn group_end(&mut self) {
        self.explicit_depth = self.explicit_depth.saturating_sub(1);
        if self.explicit_depth == 0 {
            self.explicit_group = None;
        }
    }

    /// Open the implicit group for a top-level publish.
    ///
    /// Returns false when a group is already open.
    pub(crate) fn implicit_begin(&mut self) -> bool {
        if self.explicit_group.is_some() || self.implicit_group.is_some() {
            return false;
        }
        self.implicit_group = Some(self.allocate_group());
        true
    }

    pub(crate) fn implicit_end(&mut self, opened: bool) {
        if opened {
            self.implicit_group = None;
        }
    }

    fn current_group(&mut self) -> u64 {
        match self.explicit_group.or(self.implicit_group) {
            Some(id) => id,
            None => self.allocate_group(),
        }
    }

    /// Record a mutation. Ignored while replaying.
    pub fn record(&mut self, forward: Command, inverse: Inverse) {
        if self.replaying {
            return;
        }
        let group_id = self.current_group();
        let seq = self.next_seq;
        self.next_seq += 1;
        self.undos.push(UndoEntry {
            forward,
            inverse,
            group_id,
            seq,
        });
        self.redos.clear();
        self.trim(group_id);
    }

    /// Position of the next recorded entry, for [`UndoEngine::record_over`].
    pub fn mark(&self) -> u64 {
        self.next_seq
    }

    /// Record a mutation that subsumes everything recorded since `mark`.
    ///
    /// Entries recorded after `mark` are dropped first, so replaying the
    /// forward command does not apply their effects a second time.
    pub fn record_over(&mut self, mark: u64, forward: Command, inverse: Inverse) {
        if self.replaying {
            return;
        }
        let keep = self.undos.iter().rposition(|e| e.seq < mark).map_or(0, |i| i + 1);
        let dropped = self.undos.len() - keep;
        if dropped > 0 {
            debug!(topic = %forward.topic, dropped, "Nested undo entries folded into command");
            self.undos.truncate(keep);
        }
        self.record(forward, inverse);
    }

    fn trim(&mut self, open_group: u64) {
        while self.undos.len() > self.max_entries {
            let oldest = self.undos[0].group_id;
            if oldest == open_group {
                break;
            }
            let n = self.undos.iter().take_while(|e| e.group_id == oldest).count();
            self.undos.drain(..n);
        }
    }

    fn pop_group(stack: &mut Vec<UndoEntry>) -> Option<Vec<UndoEntry>> {
        let last = stack.last()?.group_id;
        let n = stack.iter().rev().take_while(|e| e.group_id == last).count();
        Some(stack.split_off(stack.len() - n))
    }

    pub(crate) fn pop_undo_group(&mut self) -> Option<Vec<UndoEntry>> {
        Self::pop_group(&mut self.undos)
    }

    pub(crate) fn pop_redo_group(&mut self) -> Option<Vec<UndoEntry>> {
        Self::pop_group(&mut self.redos)
    }

    pub(crate) fn push_redo_group(&mut self, group: Vec<UndoEntry>) {
        self.redos.extend(group);
    }

    pub(crate) fn push_undo_group(&mut self, group: Vec<UndoEntry>) {
        self.undos.extend(group);
    }

    /// Number of recorded entries available to undo.
    pub fn undo_len(&self) -> usize {
        self.undos.len()
    }

    /// Number of entries available to redo.
    pub fn redo_len(&self) -> usize {
        self.redos.len()
    }

    /// True if there is something to undo.
    pub fn can_undo(&self) -> bool {
        !self.undos.is_empty()
    }

    /// True if there is something to redo.
    pub fn can_redo(&self) -> bool {
        !self.redos.is_empty()
    }

    /// Forget all history.
    pub fn clear(&mut self) {
        self.undos.clear();
        self.redos.clear();
    }
}

impl PubSub {
    /// Start a command group. Publishes until the matching
    /// [`PubSub::command_group_end`] undo and redo as one unit.
    pub fn command_group_start(&mut self) -> u64 {
        self.undo.group_start()
    }

    /// End a command group.
    pub fn command_group_end(&mut self) {
        self.undo.group_end();
    }

    /// Undo the most recent group, inverses in reverse order.
    ///
    /// Returns false when there is nothing to undo. A failing inverse is
    /// logged and collected into [`BusError::UndoFailed`]; the rest of the
    /// group is still applied and the group moves to the redo stack.
    pub fn undo(&mut self) -> BusResult<bool> {
        let Some(group) = self.undo.pop_undo_group() else {
            return Ok(false);
        };
        debug!(group = group[0].group_id, entries = group.len(), "Undo");
        let was = self.undo.set_replaying(true);
        let mut errors = Vec::new();
        for entry in group.iter().rev() {
            let result = entry
                .inverse
                .resolve(self)
                .and_then(|cmd| self.publish_owned(&cmd.topic, cmd.value));
            if let Err(e) = result {
                warn!(topic = %entry.forward.topic, error = %e, "Undo entry failed");
                errors.push(e);
            }
        }
        self.undo.set_replaying(was);
        self.undo.push_redo_group(group);
        if errors.is_empty() {
            Ok(true)
        } else {
            Err(BusError::UndoFailed(errors))
        }
    }

    /// Redo the most recently undone group, forwards in original order.
    pub fn redo(&mut self) -> BusResult<bool> {
        let Some(group) = self.undo.pop_redo_group() else {
            return Ok(false);
        };
        debug!(group = group[0].group_id, entries = group.len(), "Redo");
        let was = self.undo.set_replaying(true);
        let mut errors = Vec::new();
        for entry in &group {
            let cmd = entry.forward.clone();
            if let Err(e) = self.publish_owned(&cmd.topic, cmd.value) {
                warn!(topic = %cmd.topic, error = %e, "Redo entry failed");
                errors.push(e);
            }
        }
        self.undo.set_replaying(was);
        self.undo.push_undo_group(group);
        if errors.is_empty() {
            Ok(true)
        } else {
            Err(BusError::UndoFailed(errors))
        }
    }
}
