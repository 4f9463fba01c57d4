//! Static catalog of the durable queues this service publishes to.
//!
//! ```text
//! payment webhook → Router → {moon,sun,...}_predictions | recommendations | questions | ...
//!                          ↘ unrouted_events (no mapping)
//! worker failure           → dead_letters
//! ```

use crate::error::ConfigError;

/// Terminal placement for jobs that exhausted their processing attempts.
pub const DEAD_LETTER_QUEUE: &str = "dead_letters";

/// Raw envelopes of succeeded payments whose product has no route.
pub const UNROUTED_QUEUE: &str = "unrouted_events";

/// Work queues of the production deployment, one per forecast type plus the
/// shared recommendation and question queues.
pub const DEFAULT_CATALOG: [&str; 13] = [
    "moon_predictions",
    "sun_predictions",
    "mercury_predictions",
    "venus_predictions",
    "mars_predictions",
    "recommendations",
    "sun_recommendations",
    "mercury_recommendations",
    "venus_recommendations",
    "mars_recommendations",
    "questions",
    "sun_questions",
    "personal_forecasts",
];

/// Configuration entry for one broker queue.
///
/// Queues are never created or destroyed at runtime by diagnostics; only the
/// publisher and worker declare them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueDescriptor {
    pub name: String,
    pub durable: bool,
    pub passive_inspection_only: bool,
}

impl QueueDescriptor {
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            passive_inspection_only: true,
        }
    }
}

/// Ordered, duplicate-free set of work queues.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueTopology {
    queues: Vec<QueueDescriptor>,
}

impl QueueTopology {
    /// Build a catalog from queue names. Blank names are skipped and later
    /// duplicates are dropped.
    pub fn new<I, S>(names: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut queues: Vec<QueueDescriptor> = Vec::new();
        for name in names {
            let name = name.as_ref().trim();
            if name.is_empty() || queues.iter().any(|q| q.name == name) {
                continue;
            }
            queues.push(QueueDescriptor::durable(name));
        }

        if queues.is_empty() {
            return Err(ConfigError::EmptyCatalog);
        }

        Ok(Self { queues })
    }

    pub fn default_catalog() -> Self {
        Self {
            queues: DEFAULT_CATALOG
                .iter()
                .map(|name| QueueDescriptor::durable(*name))
                .collect(),
        }
    }

    pub fn queues(&self) -> &[QueueDescriptor] {
        &self.queues
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.queues.iter().map(|q| q.name.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.queues.iter().any(|q| q.name == name)
    }

    pub fn len(&self) -> usize {
        self.queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    /// Every queue the publisher declares on connect: the work catalog plus
    /// the dead-letter and unrouted holding queues.
    pub fn declared_queues(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.names().collect();
        for aux in [DEAD_LETTER_QUEUE, UNROUTED_QUEUE] {
            if !names.contains(&aux) {
                names.push(aux);
            }
        }
        names
    }
}

impl Default for QueueTopology {
    fn default() -> Self {
        Self::default_catalog()
    }
}
