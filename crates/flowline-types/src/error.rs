use thiserror::Error;

/// Errors from repository operations (used by the trait definitions in
/// flowline-core).
///
/// Boundary components match on these kinds instead of inspecting exception
/// identity: "not found" and "conflict" are ordinary return values here, not
/// control flow.
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database connection error: {0}")]
    Connection(String),

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    #[error("serialization error: {0}")]
    Serialization(String),
}
