use std::time::Duration;

use thiserror::Error;

/// Failures of the entity store's backing medium.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("entity store at '{path}' could not be initialized: {reason}")]
    Initialization { path: String, reason: String },
    #[error("entity store used before open()")]
    NotInitialized,
    #[error("write of '{identifier}' failed: {reason}")]
    Write { identifier: String, reason: String },
    #[error("entity store read failed: {0}")]
    Read(String),
}

/// Invalid site profile values, reported with the key that holds them.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("'{key}' is not a valid pattern: {reason}")]
    InvalidPattern { key: String, reason: String },
    #[error("'{key}' is not a valid CSS selector: {reason}")]
    InvalidSelector { key: String, reason: String },
    #[error("'{key}' is not a valid URL: {reason}")]
    InvalidUrl { key: String, reason: String },
}

#[derive(Debug, Error)]
pub enum NavigationError {
    #[error("'{target}' was not ready within {}ms{}", .waited.as_millis(), cause_suffix(.last_cause))]
    Timeout {
        target: String,
        waited: Duration,
        last_cause: Option<String>,
    },
    #[error("could not access '{target}': {reason}")]
    PageAccess { target: String, reason: String },
    #[error("'{target}' is not a navigable location: {reason}")]
    InvalidTarget { target: String, reason: String },
    #[error("browsing session could not be created: {0}")]
    Session(String),
    #[error("no page is loaded")]
    NoPage,
}

fn cause_suffix(cause: &Option<String>) -> String {
    cause
        .as_deref()
        .map(|c| format!(" (last error: {c})"))
        .unwrap_or_default()
}

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("no candidate links found on {location}")]
    NoCandidates { location: String },
    #[error("page content of {location} is not accessible: {reason}")]
    PageAccess { location: String, reason: String },
    #[error("no page is loaded")]
    NoPage,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("login page unavailable: {0}")]
    Navigation(#[from] NavigationError),
    #[error("credential form not found on {location} (missing {missing})")]
    FormNotFound { location: String, missing: String },
    #[error("authentication failed: ended on {location}")]
    AuthenticationFailed { location: String },
}

/// Errors that stop a run before completion.
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Authentication(#[from] AuthError),
    #[error("listing page unavailable: {0}")]
    Listing(NavigationError),
    #[error("no candidates found on {location}")]
    NoCandidates { location: String },
    #[error("listing extraction failed: {0}")]
    Collection(ExtractError),
    #[error("entity store unavailable: {0}")]
    Initialization(StoreError),
    #[error(transparent)]
    Session(NavigationError),
    #[error("a run is already in progress")]
    AlreadyRunning,
}
