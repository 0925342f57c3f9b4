//! Inbound command dispatch for the switch entity.
//!
//! ```text
//! OFF ──["ON" on set topic]──▶ ON
//!  ▲                            │
//!  └──["OFF" on set topic]──────┘
//! ```
//!
//! Anything else (other topics, other payloads) is dropped silently.

use std::fmt;

use crate::discovery::{Topics, PAYLOAD_OFF, PAYLOAD_ON};
use crate::relay::Actuator;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SwitchState {
    On,
    #[default]
    Off,
}

impl SwitchState {
    /// Exact match on the wire payload; no trimming, no case folding.
    pub fn from_payload(payload: &[u8]) -> Option<Self> {
        match payload {
            b"ON" => Some(Self::On),
            b"OFF" => Some(Self::Off),
            _ => None,
        }
    }

    pub fn as_payload(self) -> &'static str {
        match self {
            Self::On => PAYLOAD_ON,
            Self::Off => PAYLOAD_OFF,
        }
    }

    pub fn is_on(self) -> bool {
        self == Self::On
    }
}

impl fmt::Display for SwitchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_payload())
    }
}

/// A state publish the router wants mirrored to the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateUpdate {
    pub topic: String,
    pub payload: &'static str,
}

/// Owns the switch state and the pin that realises it.
pub struct CommandRouter<A> {
    command_topic: String,
    state_topic: String,
    state: SwitchState,
    output: A,
}

impl<A: Actuator> CommandRouter<A> {
    pub fn new(topics: &Topics, output: A) -> Self {
        Self {
            command_topic: topics.command().to_string(),
            state_topic: topics.switch.state.clone(),
            state: SwitchState::Off,
            output,
        }
    }

    pub fn state(&self) -> SwitchState {
        self.state
    }

    pub fn command_topic(&self) -> &str {
        &self.command_topic
    }

    /// Apply one inbound message.  Returns the state publish to emit, or
    /// `None` when the message is not a recognised switch command.
    pub fn route(&mut self, topic: &str, payload: &[u8]) -> Option<StateUpdate> {
        if topic != self.command_topic {
            tracing::debug!(topic, "ignoring message on foreign topic");
            return None;
        }
        let Some(next) = SwitchState::from_payload(payload) else {
            tracing::warn!(
                payload = %String::from_utf8_lossy(payload),
                "ignoring unknown switch command (use ON/OFF)"
            );
            return None;
        };

        self.output.set(next.is_on());
        if next != self.state {
            tracing::info!(from = %self.state, to = %next, "switch state changed");
        }
        self.state = next;

        Some(StateUpdate {
            topic: self.state_topic.clone(),
            payload: next.as_payload(),
        })
    }

    #[cfg(test)]
    pub(crate) fn output(&self) -> &A {
        &self.output
    }
}

// ===========================================================================
// Tests
// ===========================================================================
