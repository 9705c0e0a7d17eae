use thiserror::Error;

#[derive(Debug, Error)]
pub enum DkimError {
    /// The private key is missing, unreadable or unusable, or the RSA
    /// operation itself failed.
    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Message has no From header to sign")]
    MissingFromHeader,

    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Invalid DKIM-Signature: {0}")]
    InvalidSignature(String),

    #[error("Unsupported signing algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("Invalid DKIM key record: {0}")]
    KeyRecord(String),

    #[error("DNS lookup for {name} failed: {reason}")]
    Dns { name: String, reason: String },
}

pub type Result<T> = std::result::Result<T, DkimError>;
