//! Error types for triptrack.
//!
//! This module defines the crate-wide error type. Component-level errors
//! live next to their components; [`LocationError`] converts into [`Error`]
//! for operations that surface it. Realtime failures never reach callers as
//! errors: they are reported as notices and tracking continues.

use thiserror::Error;

use crate::location::LocationError;

/// The main error type for triptrack operations.
#[derive(Error, Debug)]
pub enum Error {
    // === Configuration Errors ===
    /// Failed to load configuration.
    #[error("failed to load configuration: {0}")]
    ConfigLoad(Box<figment::Error>),

    /// Configuration validation failed.
    #[error("invalid configuration: {message}")]
    ConfigValidation {
        /// Description of the validation failure.
        message: String,
    },

    // === Location Errors ===
    /// Required platform permission is missing.
    #[error("missing permission: {permission}. {instructions}")]
    PermissionMissing {
        /// Name of the required permission.
        permission: String,
        /// Instructions for granting the permission.
        instructions: String,
    },

    /// The location source failed.
    #[error("location error: {0}")]
    Location(#[from] LocationError),
}

/// A specialized Result type for triptrack operations.
pub type Result<T> = std::result::Result<T, Error>;

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Self::ConfigLoad(Box::new(err))
    }
}

impl Error {
    /// Create a new configuration validation error.
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::ConfigValidation {
            message: message.into(),
        }
    }

    /// Create a permission missing error with instructions.
    #[must_use]
    pub fn permission_missing(
        permission: impl Into<String>,
        instructions: impl Into<String>,
    ) -> Self {
        Self::PermissionMissing {
            permission: permission.into(),
            instructions: instructions.into(),
        }
    }

    /// Check if this error is a permission issue.
    #[must_use]
    pub fn is_permission_error(&self) -> bool {
        matches!(
            self,
            Self::PermissionMissing { .. } | Self::Location(LocationError::PermissionDenied)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::config("bad interval");
        assert_eq!(err.to_string(), "invalid configuration: bad interval");
    }

    #[test]
    fn test_error_is_permission_error() {
        let err = Error::permission_missing("Location", "Start gpsd");
        assert!(err.is_permission_error());

        let err: Error = LocationError::PermissionDenied.into();
        assert!(err.is_permission_error());

        assert!(!Error::config("x").is_permission_error());
        let err: Error = LocationError::Acquisition("no fix".to_string()).into();
        assert!(!err.is_permission_error());
    }

    #[test]
    fn test_permission_error_display() {
        let err = Error::permission_missing("Location", "Make sure gpsd is running");
        let msg = err.to_string();
        assert!(msg.contains("Location"));
        assert!(msg.contains("gpsd"));
    }

    #[test]
    fn test_from_location_error() {
        let err: Error = LocationError::Acquisition("no satellites".to_string()).into();
        assert!(matches!(err, Error::Location(_)));
        assert!(err.to_string().contains("no satellites"));
    }

    #[test]
    fn test_from_figment_error() {
        let err: Error = figment::Error::from("bad toml".to_string()).into();
        assert!(matches!(err, Error::ConfigLoad(_)));
        assert!(err.to_string().contains("bad toml"));
    }
}
