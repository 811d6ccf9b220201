//! Change event schema shared by the feed relay and the stats consumers
//!
//! A `ChangeEvent` is the only payload carried on the change topic. It is
//! validated once, at construction, and travels on the bus as a protobuf
//! message.

use serde::Serialize;
use thiserror::Error;

mod wire;

/// Topic the relay publishes to when none is configured
pub const DEFAULT_TOPIC: &str = "wikipedia.changes";

/// Public recent-change feed used when none is configured
pub const DEFAULT_FEED_URL: &str = "https://stream.wikimedia.org/v2/stream/recentchange";

/// Prefix of feed lines that carry a JSON payload
pub const FEED_DATA_MARKER: &str = "data: ";

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("malformed change event payload: {0}")]
    Decode(#[from] prost::DecodeError),
}

pub type Result<T> = std::result::Result<T, SchemaError>;

/// One observed change on a wiki: which site, which page, who made it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ChangeEvent {
    domain: String,
    title: String,
    user: String,
}

impl ChangeEvent {
    /// Builds an event, rejecting empty or whitespace-only fields.
    pub fn new(
        domain: impl Into<String>,
        title: impl Into<String>,
        user: impl Into<String>,
    ) -> Result<Self> {
        let domain = require("domain", domain.into())?;
        let title = require("title", title.into())?;
        let user = require("user", user.into())?;

        Ok(Self {
            domain,
            title,
            user,
        })
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    /// Protobuf encoding used as the bus record value.
    pub fn encode_to_vec(&self) -> Vec<u8> {
        wire::encode(self)
    }

    /// Decodes a bus record value.
    ///
    /// Records that decode but lack a field are treated as corrupt; the relay
    /// never publishes them.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let message = wire::decode(bytes)?;
        Self::new(message.domain, message.title, message.user)
    }
}

fn require(field: &'static str, value: String) -> Result<String> {
    if value.trim().is_empty() {
        return Err(SchemaError::MissingField(field));
    }
    Ok(value)
}
