use coursekeep_core::CmiError;
use coursekeep_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("sink error: {0}")]
    Sink(String),

    #[error("capacity exceeded: {0}")]
    Capacity(String),

    #[error("store error: {0}")]
    Store(StoreError),
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(what) => EngineError::NotFound(what),
            StoreError::Path(path) => EngineError::Validation(path.to_string()),
            other => EngineError::Store(other),
        }
    }
}

impl From<CmiError> for EngineError {
    fn from(e: CmiError) -> Self {
        EngineError::Validation(e.to_string())
    }
}
