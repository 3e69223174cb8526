use crate::seeds::SeedStrategy;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("No available backends among {requested:?}")]
    NoAvailableBackends { requested: Vec<String> },

    #[error("Invalid timeout: {0} seconds")]
    InvalidTimeout(i64),

    #[error("Invalid seed strategy '{0}'. Must be one of: {names}", names = SeedStrategy::valid_names())]
    InvalidSeedStrategy(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Internal error: {0}")]
    Internal(String),
}
