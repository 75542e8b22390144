use thiserror::Error;

pub type HealthResult<T> = Result<T, HealthError>;

#[derive(Debug, Error)]
pub enum HealthError {
    #[error("health check failed for {target}: {failures} consecutive failure(s), last: {reason}")]
    HealthCheckFailed {
        target: String,
        failures: u32,
        reason: String,
    },

    #[error("invalid health check config: {0}")]
    InvalidConfig(String),
}
