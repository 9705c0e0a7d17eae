//! DKIM signing and verification (RFC 6376), rsa-sha256 only.
//!
//! ```no_run
//! # fn example(pem: &str) -> courier_dkim::Result<()> {
//! let message = b"From: alice@example.com\r\nSubject: hi\r\n\r\nhello\r\n";
//! let header = courier_dkim::sign(message, "example.com", "mail", pem)?;
//! assert!(header.starts_with("DKIM-Signature:"));
//! # Ok(())
//! # }
//! ```

mod canonicalization;
mod error;
pub mod message;
mod signature;
mod signer;
mod verifier;

pub use canonicalization::Canonicalization;
pub use error::{DkimError, Result};
pub use signature::{Algorithm, DkimSignature};
pub use signer::{DkimConfig, DkimSigner, SigningStage, parse_private_key, sign};
pub use verifier::{DkimKeyRecord, DkimVerifier, TxtResolver, VerificationResult, verify_with_record};
