use std::collections::VecDeque;
use tracing::info;

use crate::error::{DuoError, Result};
use crate::ledger::{Ledger, Message, MessageIter, Recipient};

/// Which messages `history` returns.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistoryFilter {
    /// Only messages sent by or addressed to this agent (broadcasts included)
    pub agent: Option<String>,
    /// Only the most recent N of the matching messages
    pub last: Option<usize>,
}

impl HistoryFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn involving(agent: impl Into<String>) -> Self {
        Self {
            agent: Some(agent.into()),
            last: None,
        }
    }

    pub fn last(mut self, n: usize) -> Self {
        self.last = Some(n);
        self
    }
}

/// Delivery and read-cursor logic over the ledger's message log. Append-only.
#[derive(Debug, Clone)]
pub struct MessageBus {
    ledger: Ledger,
}

impl MessageBus {
    pub fn new(ledger: Ledger) -> Self {
        Self { ledger }
    }

    /// Append a message for a registered agent or the broadcast marker.
    pub fn send(&self, from: &str, to: &str, body: &str) -> Result<u64> {
        if body.trim().is_empty() {
            return Err(DuoError::Configuration(
                "message body required (use argument or --stdin)".into(),
            ));
        }

        let recipient = Recipient::parse(to);
        if let Recipient::Agent(name) = &recipient {
            // Agents are never unregistered, so this check cannot go stale before the append.
            if !self.ledger.is_registered(name)? {
                return Err(DuoError::UnknownAgent(name.clone()));
            }
        }

        let seq = self.ledger.append_message(from, &recipient, body)?;
        info!(seq, from, to = %recipient, bytes = body.len(), "Message sent");
        Ok(seq)
    }

    /// Matching messages, oldest first; with `last` set, only the tail.
    pub fn history(&self, filter: &HistoryFilter) -> Result<Vec<Message>> {
        let capacity = filter.last.unwrap_or(0);
        let mut window: VecDeque<Message> = VecDeque::with_capacity(capacity.min(1024));

        for message in self.ledger.read_messages(0, None)? {
            let message = message?;
            if let Some(agent) = &filter.agent {
                if !message.involves(agent) {
                    continue;
                }
            }
            if let Some(limit) = filter.last {
                if limit == 0 {
                    continue;
                }
                if window.len() == limit {
                    window.pop_front();
                }
            }
            window.push_back(message);
        }

        Ok(window.into())
    }

    /// Messages addressed to `agent` or broadcast, with id > `since`.
    pub fn inbox(&self, agent: &str, since: u64) -> Result<MessageIter> {
        self.ledger.read_messages(since, Some(agent))
    }
}
