//! Session identity and persistence
//!
//! A session is one conversation's state, identified by a deterministic
//! hierarchical key. The key grammar is regular, ASCII and case-sensitive;
//! [`SessionKey::parse`] is the exact inverse of the builders.

pub mod store;
pub mod transcript;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// The conversation scope a session key addresses
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionScope {
    /// Direct conversation with one peer
    Peer {
        channel: String,
        account: String,
        peer: String,
    },
    /// Group conversation, optionally split per participant
    Group {
        channel: String,
        account: String,
        group: String,
        peer: Option<String>,
    },
    /// Interactive client thread
    MainThread { thread_id: String },
    /// Interactive client topic
    MainTopic { topic_id: String },
    /// Child session spawned by a run
    Subagent {
        parent_run_id: String,
        subagent_id: String,
    },
}

/// Deterministic session identifier: `agent:{agent_id}:{scope}`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionKey {
    pub agent_id: String,
    pub scope: SessionScope,
}

impl SessionKey {
    /// Key for a direct-message conversation
    #[must_use]
    pub fn peer(agent_id: &str, channel: &str, account: &str, peer: &str) -> Self {
        Self {
            agent_id: component(agent_id),
            scope: SessionScope::Peer {
                channel: component(channel),
                account: component(account),
                peer: component(peer),
            },
        }
    }

    /// Key for a group conversation
    #[must_use]
    pub fn group(
        agent_id: &str,
        channel: &str,
        account: &str,
        group: &str,
        peer: Option<&str>,
    ) -> Self {
        Self {
            agent_id: component(agent_id),
            scope: SessionScope::Group {
                channel: component(channel),
                account: component(account),
                group: component(group),
                peer: peer.map(component),
            },
        }
    }

    /// Key for an interactive client thread
    #[must_use]
    pub fn main_thread(agent_id: &str, thread_id: &str) -> Self {
        Self {
            agent_id: component(agent_id),
            scope: SessionScope::MainThread {
                thread_id: component(thread_id),
            },
        }
    }

    /// Key for an interactive client topic
    #[must_use]
    pub fn main_topic(agent_id: &str, topic_id: &str) -> Self {
        Self {
            agent_id: component(agent_id),
            scope: SessionScope::MainTopic {
                topic_id: component(topic_id),
            },
        }
    }

    /// Key for a subagent spawned by a parent run
    #[must_use]
    pub fn subagent(agent_id: &str, parent_run_id: &str, subagent_id: &str) -> Self {
        Self {
            agent_id: component(agent_id),
            scope: SessionScope::Subagent {
                parent_run_id: component(parent_run_id),
                subagent_id: component(subagent_id),
            },
        }
    }

    /// Parse a key previously produced by one of the builders.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BadSessionKey`] when the input does not match the
    /// grammar.
    pub fn parse(raw: &str) -> Result<Self> {
        let bad = || Error::BadSessionKey(raw.to_string());

        if !raw.is_ascii() {
            return Err(bad());
        }
        let mut parts = raw.split(':');
        if parts.next() != Some("agent") {
            return Err(bad());
        }
        let agent_id = parts.next().filter(|s| !s.is_empty()).ok_or_else(bad)?;
        let tag = parts.next().ok_or_else(bad)?;
        let rest: Vec<&str> = parts.collect();
        if rest.iter().any(|s| s.is_empty()) {
            return Err(bad());
        }

        let scope = match (tag, rest.as_slice()) {
            ("peer", [channel, account, peer]) => SessionScope::Peer {
                channel: (*channel).to_string(),
                account: (*account).to_string(),
                peer: (*peer).to_string(),
            },
            ("group", [channel, account, group]) => SessionScope::Group {
                channel: (*channel).to_string(),
                account: (*account).to_string(),
                group: (*group).to_string(),
                peer: None,
            },
            ("group", [channel, account, group, peer]) => SessionScope::Group {
                channel: (*channel).to_string(),
                account: (*account).to_string(),
                group: (*group).to_string(),
                peer: Some((*peer).to_string()),
            },
            ("main", ["thread", thread_id]) => SessionScope::MainThread {
                thread_id: (*thread_id).to_string(),
            },
            ("main", ["topic", topic_id]) => SessionScope::MainTopic {
                topic_id: (*topic_id).to_string(),
            },
            ("subagent", [parent_run_id, subagent_id]) => SessionScope::Subagent {
                parent_run_id: (*parent_run_id).to_string(),
                subagent_id: (*subagent_id).to_string(),
            },
            _ => return Err(bad()),
        };

        Ok(Self {
            agent_id: agent_id.to_string(),
            scope,
        })
    }

    /// File-system safe name for this session's transcript
    #[must_use]
    pub fn file_stem(&self) -> String {
        self.to_string().replace(':', "-")
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "agent:{}:", self.agent_id)?;
        match &self.scope {
            SessionScope::Peer {
                channel,
                account,
                peer,
            } => write!(f, "peer:{channel}:{account}:{peer}"),
            SessionScope::Group {
                channel,
                account,
                group,
                peer,
            } => {
                write!(f, "group:{channel}:{account}:{group}")?;
                if let Some(peer) = peer {
                    write!(f, ":{peer}")?;
                }
                Ok(())
            }
            SessionScope::MainThread { thread_id } => write!(f, "main:thread:{thread_id}"),
            SessionScope::MainTopic { topic_id } => write!(f, "main:topic:{topic_id}"),
            SessionScope::Subagent {
                parent_run_id,
                subagent_id,
            } => write!(f, "subagent:{parent_run_id}:{subagent_id}"),
        }
    }
}

impl TryFrom<String> for SessionKey {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<SessionKey> for String {
    fn from(key: SessionKey) -> Self {
        key.to_string()
    }
}

/// Normalize one key component: lossy replacement of separators and
/// whitespace, empty components become `-`.
fn component(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c == ':' || c.is_whitespace() || !c.is_ascii() {
                '-'
            } else {
                c
            }
        })
        .collect();
    if cleaned.is_empty() {
        "-".to_string()
    } else {
        cleaned
    }
}
