/// Side effects requested by the replica core

use super::events::ReplicaEvent;
use crate::messages::{Message, Reply, View};
use std::time::Duration;

/// Timer expiries fed back into the core
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Timeout {
    /// An accepted request was not executed in time
    Request,
    /// The view change to this view did not complete in time
    ViewChange(View),
}

impl Timeout {
    pub fn kind(&self) -> TimerKind {
        match self {
            Timeout::Request => TimerKind::Request,
            Timeout::ViewChange(_) => TimerKind::ViewChange,
        }
    }
}

/// At most one timer of each kind is armed at a time
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TimerKind {
    Request,
    ViewChange,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TimerCommand {
    /// Arm (or re-arm) the timer of `timeout.kind()`
    Start { timeout: Timeout, after: Duration },
    Stop(TimerKind),
}

/// Everything one step of the core wants the driver to do
#[derive(Debug, Default)]
pub struct Output {
    /// Messages for every other replica
    pub broadcasts: Vec<Message>,
    /// Signed replies for clients
    pub replies: Vec<Reply>,
    pub timers: Vec<TimerCommand>,
    pub events: Vec<ReplicaEvent>,
}

impl Output {
    pub fn broadcast(&mut self, message: impl Into<Message>) {
        self.broadcasts.push(message.into());
    }

    pub fn reply(&mut self, reply: Reply) {
        self.replies.push(reply);
    }

    pub fn start_timer(&mut self, timeout: Timeout, after: Duration) {
        self.timers.push(TimerCommand::Start { timeout, after });
    }

    pub fn stop_timer(&mut self, kind: TimerKind) {
        self.timers.push(TimerCommand::Stop(kind));
    }

    pub fn event(&mut self, event: ReplicaEvent) {
        self.events.push(event);
    }

    pub fn merge(&mut self, other: Output) {
        self.broadcasts.extend(other.broadcasts);
        self.replies.extend(other.replies);
        self.timers.extend(other.timers);
        self.events.extend(other.events);
    }

    pub fn is_empty(&self) -> bool {
        self.broadcasts.is_empty()
            && self.replies.is_empty()
            && self.timers.is_empty()
            && self.events.is_empty()
    }
}
