use thiserror::Error;

use crate::core::engine::EngineError;

/// Problems detected while assembling a server. Always raised from start,
/// never at call time.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid endpoint name '{name}' on {owner}: {reason}")]
    InvalidName {
        owner: String,
        name: String,
        reason: &'static str,
    },

    #[error("property '{name}' on {owner} has neither a getter nor a setter")]
    EmptyProperty { owner: String, name: String },

    #[error("endpoint '{0}' is registered more than once")]
    DuplicateEndpoint(String),

    #[error("endpoint name '{0}' is reserved for built-in services")]
    ReservedName(String),

    #[error("failed to construct {owner}: {reason}")]
    Construct { owner: String, reason: String },

    #[error(transparent)]
    Engine(#[from] EngineError),
}
