//! Multi-turn clarification state.
//!
//! The backend decides when a request is detailed enough; this module only
//! tracks where the exchange stands and what to send next. All transitions
//! are plain functions over [`Conversation`] so they can be driven without a UI.

use crate::api::{ConversationMessage, ConversationResponse, Role};

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Phase {
    /// No exchange yet.
    #[default]
    Empty,
    /// Awaiting more answers from the user.
    Active { conversation_id: String },
    /// Terminal. The enhanced query has been handed off.
    Complete {
        conversation_id: String,
        enhanced_query: String,
    },
}

/// The request a submission turns into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Start {
        initial_query: String,
    },
    Continue {
        conversation_id: String,
        user_response: String,
        history: Vec<ConversationMessage>,
    },
}

#[derive(Debug, Clone, Default)]
pub struct Conversation {
    phase: Phase,
    history: Vec<ConversationMessage>,
    exchange_count: u32,
    in_flight: bool,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> &Phase {
        &self.phase
    }

    pub fn history(&self) -> &[ConversationMessage] {
        &self.history
    }

    pub fn exchange_count(&self) -> u32 {
        self.exchange_count
    }

    pub fn in_flight(&self) -> bool {
        self.in_flight
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.phase, Phase::Complete { .. })
    }

    pub fn is_empty(&self) -> bool {
        matches!(self.phase, Phase::Empty)
    }

    /// Whether the chat input should still be offered.
    pub fn accepts_input(&self) -> bool {
        !self.is_complete()
    }

    pub fn conversation_id(&self) -> Option<&str> {
        match &self.phase {
            Phase::Empty => None,
            Phase::Active { conversation_id } | Phase::Complete { conversation_id, .. } => {
                Some(conversation_id)
            }
        }
    }

    pub fn enhanced_query(&self) -> Option<&str> {
        match &self.phase {
            Phase::Complete { enhanced_query, .. } => Some(enhanced_query),
            _ => None,
        }
    }

    /// Owned copy of the transcript for summary and aggregate-intent requests.
    pub fn history_snapshot(&self) -> Vec<ConversationMessage> {
        self.history.clone()
    }

    /// Transcript without system prompts, in order.
    pub fn visible_messages(&self) -> impl Iterator<Item = &ConversationMessage> {
        self.history.iter().filter(|m| m.role != Role::System)
    }

    /// Turns user input into the next request and marks it in flight.
    /// Returns `None` for blank input, while a request is pending, or once
    /// the conversation is complete.
    pub fn submit(&mut self, input: &str) -> Option<Outbound> {
        let text = input.trim();
        if text.is_empty() || self.in_flight {
            return None;
        }

        let outbound = match &self.phase {
            Phase::Empty => Outbound::Start {
                initial_query: text.to_string(),
            },
            Phase::Active { conversation_id } => Outbound::Continue {
                conversation_id: conversation_id.clone(),
                user_response: text.to_string(),
                history: self.history.clone(),
            },
            Phase::Complete { .. } => return None,
        };

        self.in_flight = true;
        Some(outbound)
    }

    /// Applies a successful start/continue reply.
    ///
    /// Returns the enhanced query exactly once: on the reply that moves the
    /// conversation into [`Phase::Complete`].
    pub fn apply(&mut self, response: ConversationResponse) -> Option<String> {
        self.in_flight = false;
        if self.is_complete() {
            tracing::warn!("ignoring conversation reply after completion");
            return None;
        }

        let fallback = match self.phase {
            Phase::Empty => 1,
            _ => self.exchange_count + 1,
        };
        // A reported 0 means the backend did not count; treat it as absent.
        let reported = response.exchange_count.filter(|n| *n > 0).unwrap_or(fallback);
        self.exchange_count = self.exchange_count.max(reported);
        self.history = response.conversation_history;

        if response.ready_for_formulation {
            let enhanced_query = response.enhanced_query.unwrap_or_default();
            tracing::info!(
                "conversation {} ready after {} exchanges",
                response.conversation_id,
                self.exchange_count
            );
            self.phase = Phase::Complete {
                conversation_id: response.conversation_id,
                enhanced_query: enhanced_query.clone(),
            };
            Some(enhanced_query)
        } else {
            self.phase = Phase::Active {
                conversation_id: response.conversation_id,
            };
            None
        }
    }

    /// A start/continue call was rejected. Only the pending flag changes so
    /// the user can resubmit.
    pub fn fail(&mut self) {
        self.in_flight = false;
    }
}

/// Advisory caption for the progress area.
pub fn progress_label(exchange_count: u32) -> &'static str {
    match exchange_count {
        0 => "",
        1 => "Starting conversation...",
        2 => "Great progress - gathering key details...",
        3 => "Almost there - one more question...",
        _ => "Final exchange - completing formulation...",
    }
}

pub fn progress_fraction(exchange_count: u32, expected: usize) -> f32 {
    if expected == 0 {
        return 1.0;
    }
    (exchange_count as f32 / expected as f32).clamp(0.0, 1.0)
}
