//! Error types for kaizen.

use thiserror::Error;

/// Result type alias using kaizen's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for kaizen operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation failed (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Resource not found (or not yet visible to this transaction)
    #[error("Not found: {0}")]
    NotFound(String),

    /// A concurrent writer got there first
    #[error("Conflict: {0}")]
    Conflict(String),

    /// A unit of work cannot run because its inputs are missing
    #[error("Missing prerequisite: {0}")]
    Precondition(String),

    /// Feature extraction failed
    #[error("Extraction error: {0}")]
    Extraction(String),

    /// Estimator training or scoring failed
    #[error("Estimator error: {0}")]
    Estimator(String),

    /// Image decoding, cropping or encoding failed
    #[error("Image error: {0}")]
    Image(String),

    /// Job queue error
    #[error("Job error: {0}")]
    Job(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// File I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Soft failures abort one unit of work without triggering a retry.
    ///
    /// Everything else (including permanent computation errors) is handed to
    /// the retry policy, which cannot tell a visibility race from a bug.
    pub fn is_soft(&self) -> bool {
        matches!(self, Error::Precondition(_) | Error::Conflict(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<image::ImageError> for Error {
    fn from(e: image::ImageError) -> Self {
        Error::Image(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_not_found() {
        let err = Error::NotFound("patch 7".to_string());
        assert_eq!(err.to_string(), "Not found: patch 7");
    }

    #[test]
    fn test_error_display_conflict() {
        let err = Error::Conflict("round 3 of classifier 1".to_string());
        assert_eq!(err.to_string(), "Conflict: round 3 of classifier 1");
    }

    #[test]
    fn test_error_display_precondition() {
        let err = Error::Precondition("dataset 2 has no blobs".to_string());
        assert_eq!(err.to_string(), "Missing prerequisite: dataset 2 has no blobs");
    }

    #[test]
    fn test_error_display_extraction() {
        let err = Error::Extraction("empty image".to_string());
        assert_eq!(err.to_string(), "Extraction error: empty image");
    }

    #[test]
    fn test_error_display_estimator() {
        let err = Error::Estimator("single class".to_string());
        assert_eq!(err.to_string(), "Estimator error: single class");
    }

    #[test]
    fn test_soft_errors() {
        assert!(Error::Precondition("x".into()).is_soft());
        assert!(Error::Conflict("x".into()).is_soft());
        assert!(!Error::NotFound("x".into()).is_soft());
        assert!(!Error::Extraction("x".into()).is_soft());
        assert!(!Error::Config("x".into()).is_soft());
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_err = serde_json::from_str::<i32>("not a number").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Serialization(_)));
        assert!(err.to_string().contains("Serialization error:"));
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "blob missing");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
        assert!(err.to_string().contains("blob missing"));
    }

    #[test]
    fn test_from_image_error() {
        let img_err = image::load_from_memory(b"definitely not an image").unwrap_err();
        let err: Error = img_err.into();
        assert!(matches!(err, Error::Image(_)));
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<Error>();
        assert_sync::<Error>();
    }
}
