//! Device Defender topic construction
//!
//! The three topics an agent uses are derived once from the thing name:
//!
//! - `$aws/things/<thing>/defender/metrics/cbor` (publish)
//! - `$aws/things/<thing>/defender/metrics/cbor/accepted`
//! - `$aws/things/<thing>/defender/metrics/cbor/rejected`

use super::ResponseKind;
use crate::store::validate_thing_name;
use thiserror::Error;

const TOPIC_PREFIX: &str = "$aws/things/";
const DEFENDER_API: &str = "/defender/metrics/cbor";

/// AWS IoT limit on topic length in bytes
pub const MAX_TOPIC_LEN: usize = 256;

#[derive(Debug, Error, PartialEq)]
pub enum TopicError {
    #[error("Thing name cannot be empty")]
    EmptyThingName,
    #[error("Invalid thing name: {0}")]
    InvalidThingName(String),
    #[error("Topic '{topic}' is {len} bytes, limit is {MAX_TOPIC_LEN}")]
    TooLong { topic: String, len: usize },
    #[error("Topics already built; release them first")]
    AlreadyBuilt,
}

/// Per-topic discriminant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefenderTopic {
    Publish,
    Accepted,
    Rejected,
}

impl DefenderTopic {
    pub const ALL: [DefenderTopic; 3] = [
        DefenderTopic::Publish,
        DefenderTopic::Accepted,
        DefenderTopic::Rejected,
    ];

    fn suffix(&self) -> &'static str {
        match self {
            DefenderTopic::Publish => "",
            DefenderTopic::Accepted => "/accepted",
            DefenderTopic::Rejected => "/rejected",
        }
    }

    /// Format this topic for `thing_name` without validating it
    pub fn format(&self, thing_name: &str) -> String {
        format!("{TOPIC_PREFIX}{thing_name}{DEFENDER_API}{}", self.suffix())
    }
}

impl From<ResponseKind> for DefenderTopic {
    fn from(kind: ResponseKind) -> Self {
        match kind {
            ResponseKind::Accepted => DefenderTopic::Accepted,
            ResponseKind::Rejected => DefenderTopic::Rejected,
        }
    }
}

/// The three topics of one agent, built together or not at all
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefenderTopics {
    publish: String,
    accepted: String,
    rejected: String,
}

impl DefenderTopics {
    pub fn build(thing_name: &str) -> Result<Self, TopicError> {
        if thing_name.is_empty() {
            return Err(TopicError::EmptyThingName);
        }
        validate_thing_name(thing_name)
            .map_err(|e| TopicError::InvalidThingName(e.to_string()))?;

        let [publish, accepted, rejected] =
            DefenderTopic::ALL.map(|kind| kind.format(thing_name));
        for topic in [&publish, &accepted, &rejected] {
            if topic.len() > MAX_TOPIC_LEN {
                return Err(TopicError::TooLong {
                    topic: topic.clone(),
                    len: topic.len(),
                });
            }
        }

        Ok(Self {
            publish,
            accepted,
            rejected,
        })
    }

    pub fn get(&self, kind: DefenderTopic) -> &str {
        match kind {
            DefenderTopic::Publish => &self.publish,
            DefenderTopic::Accepted => &self.accepted,
            DefenderTopic::Rejected => &self.rejected,
        }
    }

    pub fn publish(&self) -> &str {
        &self.publish
    }

    pub fn response(&self, kind: ResponseKind) -> &str {
        self.get(kind.into())
    }
}
