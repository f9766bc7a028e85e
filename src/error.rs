//! Bridge errors

use thiserror::Error;

use crate::erd::Erd;

#[derive(Debug, Error)]
pub enum BridgeError {
    /// Discovery found more ERDs than the polling list can hold
    #[error("Polling list full ({capacity} entries), cannot add ERD {erd}")]
    PollingListFull { erd: Erd, capacity: usize },

    /// Catalog can yield more ERDs than fit in the polling list
    #[error("Catalog for appliance type {appliance_type} yields {count} ERDs, capacity is {capacity}")]
    CatalogTooLarge {
        appliance_type: usize,
        count: usize,
        capacity: usize,
    },

    /// Catalog has no appliance rows at all
    #[error("Catalog has no appliance entries")]
    EmptyCatalog,

    #[error("Configuration error: {0}")]
    Config(String),
}
