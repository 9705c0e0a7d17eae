pub mod address;
pub mod logging;

pub use tracing;

/// Lifecycle signal broadcast from the controller to long running services.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Shutdown,
}
