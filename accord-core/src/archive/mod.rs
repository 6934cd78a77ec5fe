//! The exportable account archive and its codec.

pub mod codec;

use std::collections::BTreeMap;

use crate::contacts::{Contact, KnownDevice, TrustRequest};
use crate::conversation::{ConvInfo, ConversationRequest};
use crate::identity::CertificateChain;

/// The exportable bundle: identity material, trust graph, conversation
/// metadata, and free-form config. Persisted at a well-known path,
/// optionally password-encrypted (see [`codec`]).
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct AccountArchive {
    pub identity: Option<CertificateChain>,
    /// PEM-encoded CA private key, retained to resign descendants.
    pub ca_key: Option<String>,
    /// base64 DER-encoded, account-signed revocation list.
    pub revocation_list: Option<String>,
    /// 20-byte secp256k1-derived ethereum address seed, base64.
    pub eth_key: Option<String>,
    #[serde(default)]
    pub contacts_map: BTreeMap<String, Contact>,
    #[serde(default)]
    pub conversations_map: BTreeMap<String, ConvInfo>,
    #[serde(default)]
    pub conversation_requests_map: BTreeMap<String, ConversationRequest>,
    #[serde(default)]
    pub config_kv: BTreeMap<String, String>,
    /// Fields `deserialize` didn't recognize; kept so a future build that
    /// does recognize them round-trips through the archive unharmed. Not
    /// part of the public data model, but necessary for the "deserialize
    /// tolerates unknown keys" contract.
    #[serde(flatten)]
    pub unknown: BTreeMap<String, serde_json::Value>,
}

/// Not persisted directly; used to carry the account's known-device roster
/// and trust requests when an archive is reconstructed into live state.
#[derive(Debug, Clone, Default)]
pub struct ArchiveExtras {
    pub known_devices: BTreeMap<String, KnownDevice>,
    pub trust_requests: BTreeMap<String, TrustRequest>,
}
