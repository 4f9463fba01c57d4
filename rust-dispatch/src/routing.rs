//! Product → queue routing.
//!
//! The mapping is a table loaded from configuration. Adding a product means
//! adding a row, never touching the dispatch code. A product without a row
//! is a routing failure; nothing is ever sent to a catch-all queue.

use std::collections::HashMap;

use crate::error::{ConfigError, RoutingError};
use crate::queue::QueueTopology;

/// One routing row: product key and its target queues.
pub type Route = (String, Vec<String>);

/// Routing table of the production deployment.
pub fn default_routes() -> Vec<Route> {
    let single = |product: &str, queue: &str| (product.to_string(), vec![queue.to_string()]);

    vec![
        single("moon", "moon_predictions"),
        single("sun", "sun_predictions"),
        single("mercury", "mercury_predictions"),
        single("venus", "venus_predictions"),
        single("mars", "mars_predictions"),
        single("recommendations", "recommendations"),
        single("sun_recommendations", "sun_recommendations"),
        single("mercury_recommendations", "mercury_recommendations"),
        single("venus_recommendations", "venus_recommendations"),
        single("mars_recommendations", "mars_recommendations"),
        single("questions", "questions"),
        single("sun_questions", "sun_questions"),
        single("personal", "personal_forecasts"),
        (
            "sun_bundle".to_string(),
            vec!["sun_predictions".to_string(), "recommendations".to_string()],
        ),
        (
            "all_planets".to_string(),
            vec![
                "sun_predictions".to_string(),
                "mercury_predictions".to_string(),
                "venus_predictions".to_string(),
                "mars_predictions".to_string(),
            ],
        ),
    ]
}

/// Validated product routing table.
#[derive(Debug, Clone)]
pub struct ProductRouter {
    routes: HashMap<String, Vec<String>>,
}

impl ProductRouter {
    /// Build the router, checking every target against the queue catalog.
    ///
    /// Product keys are lowercased. Duplicate targets within a row collapse
    /// to their first occurrence; a repeated product row replaces the
    /// earlier one.
    pub fn new(table: Vec<Route>, topology: &QueueTopology) -> Result<Self, ConfigError> {
        let mut routes = HashMap::with_capacity(table.len());

        for (product, queues) in table {
            let product = product.trim().to_ascii_lowercase();

            let mut targets: Vec<String> = Vec::with_capacity(queues.len());
            for queue in queues {
                let queue = queue.trim().to_string();
                if !topology.contains(&queue) {
                    return Err(ConfigError::UnknownQueue { product, queue });
                }
                if !targets.contains(&queue) {
                    targets.push(queue);
                }
            }

            if targets.is_empty() {
                return Err(ConfigError::EmptyRoute(product));
            }

            routes.insert(product, targets);
        }

        Ok(Self { routes })
    }

    /// Target queues for `product`, in publish order.
    pub fn route(&self, product: &str) -> Result<&[String], RoutingError> {
        self.routes
            .get(product)
            .map(Vec::as_slice)
            .ok_or_else(|| RoutingError::UnknownProduct(product.to_string()))
    }

    pub fn products(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
