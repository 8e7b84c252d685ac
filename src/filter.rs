use std::collections::HashSet;

use crate::client::InboundMessage;
use crate::config::Config;

/// Why a message was not relayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    OwnMessage,
    NotGroup,
    NotSource,
    NoKeyword,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Relay,
    Skip(SkipReason),
}

pub(crate) fn norm(s: &str) -> String {
    s.trim().to_lowercase()
}

/// Lookup structures derived from a [`Config`], rebuilt whenever it changes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterState {
    pub source_ids: HashSet<String>,
    /// Trimmed, lower-cased source names.
    pub source_names: HashSet<String>,
    /// Lower-cased keywords, in configured order.
    pub keywords: Vec<String>,
    pub target_id: Option<String>,
    pub target_name: Option<String>,
}

impl FilterState {
    pub fn from_config(config: &Config) -> Self {
        let wa = &config.whatsapp;
        let non_empty = |s: &str| (!s.is_empty()).then(|| s.to_string());
        Self {
            source_ids: wa.sources.iter().filter_map(|s| non_empty(&s.id)).collect(),
            source_names: wa
                .sources
                .iter()
                .map(|s| norm(&s.name))
                .filter(|n| !n.is_empty())
                .collect(),
            keywords: wa.keywords.iter().map(|k| norm(k)).filter(|k| !k.is_empty()).collect(),
            target_id: non_empty(&wa.target.id),
            target_name: non_empty(&wa.target.name),
        }
    }

    pub fn is_source(&self, chat_id: &str, chat_name: &str) -> bool {
        let name = norm(chat_name);
        (!chat_id.is_empty() && self.source_ids.contains(chat_id))
            || (!name.is_empty() && self.source_names.contains(&name))
    }

    /// Case-insensitive substring match against any keyword.
    pub fn matches_keyword(&self, body: &str) -> bool {
        let body = body.to_lowercase();
        self.keywords.iter().any(|k| body.contains(k.as_str()))
    }

    /// Apply the relay predicates in order, stopping at the first failure.
    pub fn evaluate(&self, msg: &InboundMessage, allow_own: bool) -> Verdict {
        if msg.from_me && !allow_own {
            return Verdict::Skip(SkipReason::OwnMessage);
        }
        if !msg.chat.is_group {
            return Verdict::Skip(SkipReason::NotGroup);
        }
        if !self.is_source(&msg.chat.id, &msg.chat.name) {
            return Verdict::Skip(SkipReason::NotSource);
        }
        if !self.matches_keyword(&msg.body) {
            return Verdict::Skip(SkipReason::NoKeyword);
        }
        Verdict::Relay
    }
}
