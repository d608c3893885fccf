//! Error types for the faces services.
//!
//! Injected faults are not errors: they are modelled as data in
//! [`crate::fault::Admission`] and [`crate::dependency::DependencyOutcome`].
//! These variants cover the operational failures of running a service.

use std::io;
use thiserror::Error;

/// Errors that can occur while running a faces service.
#[derive(Error, Debug)]
pub enum FacesError {
    /// Failed to bind to the listener address.
    #[error("failed to bind listener to {addr}: {source}")]
    ListenerBind { addr: String, source: io::Error },

    /// Failed to accept an incoming connection.
    #[error("failed to accept connection: {0}")]
    AcceptConnection(#[source] io::Error),

    /// HTTP protocol error.
    #[error("http error: {0}")]
    Http(#[from] hyper::Error),

    /// Configuration could not be loaded or failed validation.
    #[error("invalid configuration: {0}")]
    Config(#[from] crate::config::ConfigError),
}

/// Result type alias for faces operations.
pub type Result<T> = std::result::Result<T, FacesError>;
