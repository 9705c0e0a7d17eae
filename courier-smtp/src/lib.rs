//! Client side of SMTP (RFC 5321) as needed for outbound delivery:
//! greeting, EHLO/HELO, STARTTLS (RFC 3207), AUTH PLAIN/LOGIN (RFC 4954),
//! MAIL/RCPT/DATA and QUIT.

pub mod client;
pub mod extensions;

pub use client::{ClientError, Response, SmtpClient};
pub use extensions::{AuthMechanism, Capabilities};
