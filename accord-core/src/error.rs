//! Error taxonomy for the account/identity/conversation core.
//!
//! Each component owns a `thiserror`-derived enum naming its failure kinds;
//! [`AccordError`] is the top-level error any public entry point can return,
//! wrapping the component enums via `#[from]`.

use thiserror::Error;

/// Failures raised by `ArchiveCodec`.
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("archive document is malformed")]
    Malformed,
    #[error("archive credentials are incorrect")]
    BadCredentials,
    #[error("archive I/O error: {0}")]
    Io(String),
}

/// Failures raised by `IdentityManager`.
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("identity file missing: {0}")]
    FileMissing(String),
    #[error("certificate public key id does not match private key")]
    Mismatch,
    #[error("certificate has no issuer")]
    NoIssuer,
    #[error("receipt invalid at step: {0}")]
    ReceiptInvalid(&'static str),
    #[error("certificate generation failed: {0}")]
    CertGeneration(String),
}

/// Asynchronous authentication failures, delivered to `on_failure` callbacks.
///
/// `Clone` + `PartialEq` because tests and UI layers compare these by value
/// after they cross a callback boundary.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("invalid arguments")]
    InvalidArguments,
    #[error("network error")]
    Network,
    #[error("operation timed out")]
    Timeout,
    #[error("authentication error")]
    AuthError,
    #[error("server error")]
    ServerError,
    #[error("unknown error")]
    Unknown,
}

/// Synchronous failures returned from `addDevice`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AddDeviceError {
    #[error("invalid URI")]
    InvalidUri,
    #[error("an authentication context is already in progress for this account")]
    AlreadyLinking,
    #[error("device linking failed")]
    Generic,
}

/// Failures raised by `ContactList`.
#[derive(Debug, Error)]
pub enum ContactError {
    #[error("{0} is already a contact; cannot set a bare certificate status")]
    ContactExists(String),
}

/// Failures raised by `ConversationModule`.
#[derive(Debug, Error)]
pub enum ConversationError {
    #[error("conversation {0} not found")]
    NotFound(String),
    #[error("{0} is not a member of conversation {1}")]
    NotAMember(String, String),
    #[error("device {0} is banned from conversation {1}")]
    DeviceBanned(String, String),
    #[error("no local commit to sync from")]
    NoLocalCommit,
    #[error("a clone or fetch for {0} is already in progress")]
    AlreadyFetching(String),
    #[error("a clone for {0} is already in progress")]
    AlreadyCloning(String),
}

/// Top-level crate error. Public fallible APIs that are not themselves one
/// component's operation (e.g. account bootstrap) return this.
#[derive(Debug, Error)]
pub enum AccordError {
    #[error(transparent)]
    Archive(#[from] ArchiveError),
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    AddDevice(#[from] AddDeviceError),
    #[error(transparent)]
    Contact(#[from] ContactError),
    #[error(transparent)]
    Conversation(#[from] ConversationError),
}
