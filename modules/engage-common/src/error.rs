use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngageError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Run lock conflict: another run for {0} is in progress")]
    RunLockConflict(String),
}
