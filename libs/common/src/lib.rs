//! GridLink basic library
//!
//! Provides plumbing shared by all GridLink services, including:
//! - logging initialisation
//! - layered configuration loading
//! - graceful shutdown signal handling

pub mod config_loader;
pub mod logging;
pub mod shutdown;

pub use config_loader::{load_layered, ConfigLoadError};
pub use logging::{init_logging, LogFileOptions, LogOptions, LoggingError};
pub use shutdown::{cancel_on_shutdown, join_listener, wait_for_shutdown, ShutdownSignal};
