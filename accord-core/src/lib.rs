//! Account identity, device linking, and conversation synchronization core
//! for a serverless peer-to-peer messenger.
//!
//! This crate owns the account lifecycle (create/import/link-device/
//! revoke), the trust graph between accounts and their devices, and the
//! replicated metadata around conversations (membership, invites,
//! last-displayed position). It does not implement a DHT, a transport, or a
//! git-like repository store itself — [`services`] defines the trait seams
//! an embedding application implements, with an in-memory reference
//! implementation under [`services::testing`] for this crate's own tests.

pub mod account;
pub mod archive;
pub mod config;
pub mod contacts;
pub mod conversation;
pub mod error;
pub mod events;
pub mod identity;
pub mod services;
pub mod sync;

pub use error::AccordError;
pub use events::Event;
