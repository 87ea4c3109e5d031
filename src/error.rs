use thiserror::Error;

/// Problems with the command line or environment, detected before any request is sent.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("API key must be provided via --key or the {0} environment variable")]
    MissingApiKey(&'static str),

    #[error("invalid value for {flag}: {reason}")]
    Invalid { flag: &'static str, reason: String },
}
