use thiserror::Error;

/// Errors raised inside the measurement engine and its adapters.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BenchError {
	#[error("invalid resolver entry '{0}'")]
	InvalidResolver(String),

	#[error("resolver '{0}' is configured more than once")]
	DuplicateResolver(String),

	#[error("invalid subnet '{0}'")]
	InvalidSubnet(String),

	#[error("invalid endpoint '{endpoint}': {reason}")]
	InvalidEndpoint { endpoint: String, reason: String },

	#[error("unsupported driver '{0}'")]
	UnsupportedDriver(String),

	/// No resolver produced a usable answer, so the domain has no baseline
	#[error("cannot score domain '{domain}': {reason}")]
	DomainScoring { domain: String, reason: String },
}
