// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Destination Naming
//!
//! Destinations are addressed by a logical string. A `queue:` or `topic:` prefix
//! selects the kind, a bare name is a queue. The same convention is shared by the
//! receiver engine and the publish path.

use std::{fmt, str::FromStr};

/// Prefix selecting a point-to-point queue
pub const QUEUE_PREFIX: &str = "queue:";
/// Prefix selecting a publish/subscribe topic
pub const TOPIC_PREFIX: &str = "topic:";

/// Kind of broker destination.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum DestinationKind {
    #[default]
    Queue,
    Topic,
}

/// A resolved broker destination.
///
/// Resolution is pure, so resolving the same logical name twice yields equal
/// destinations. Broker-side handles are derived from it each time a session is
/// opened and never cached across sessions.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    name: String,
    kind: DestinationKind,
}

impl Destination {
    pub fn queue(name: &str) -> Self {
        Destination {
            name: name.to_owned(),
            kind: DestinationKind::Queue,
        }
    }

    pub fn topic(name: &str) -> Self {
        Destination {
            name: name.to_owned(),
            kind: DestinationKind::Topic,
        }
    }

    /// Broker-side name, without the kind prefix.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> DestinationKind {
        self.kind
    }

    pub fn is_topic(&self) -> bool {
        self.kind == DestinationKind::Topic
    }
}

/// Resolves a logical destination string into a [`Destination`].
pub fn resolve(logical: &str) -> Destination {
    if let Some(name) = logical.strip_prefix(QUEUE_PREFIX) {
        Destination::queue(name)
    } else if let Some(name) = logical.strip_prefix(TOPIC_PREFIX) {
        Destination::topic(name)
    } else {
        Destination::queue(logical)
    }
}

impl FromStr for Destination {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(resolve(s))
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            DestinationKind::Queue => write!(f, "{}{}", QUEUE_PREFIX, self.name),
            DestinationKind::Topic => write!(f, "{}{}", TOPIC_PREFIX, self.name),
        }
    }
}
