//! Events emitted by the core to the embedding application.

use crate::error::{AddDeviceError, AuthError};

/// Outcome of a long-running operation's terminal `Done` event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DoneResult {
    Success,
    Network,
    Timeout,
    AuthError,
    Canceled,
    Unknown,
}

/// States of the device-link protocol, reported on both sides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Authenticating {
        peer: String,
        scheme: Option<String>,
        auth_error: Option<String>,
    },
    TokenAvailable {
        uri: String,
    },
    InProgress,
    Done {
        result: DoneResult,
    },
}

/// Events that the core emits to the embedding application. Clients drive
/// their UI from these and never poll.
#[derive(Debug, Clone)]
pub enum Event {
    ContactAdded {
        account_id: String,
    },
    ContactRemoved {
        account_id: String,
    },
    TrustRequestIncoming {
        from: String,
        from_device: String,
    },
    KnownDevicesChanged,
    CertificateStateChanged {
        cert_id: String,
    },

    /// Device-link state change on the new-device (importer) side.
    AddDeviceStateChanged(LinkState),
    /// Device-link state change on the source (exporter) side.
    DeviceAuthStateChanged(LinkState),

    ConversationReady {
        conversation_id: String,
    },
    ConversationRemoved {
        conversation_id: String,
    },
    ConversationRequestReceived {
        conversation_id: String,
        from: String,
    },
    ConversationRequestDeclined {
        conversation_id: String,
    },
    /// A sync partition named a conversation the local device doesn't know
    /// yet; the embedder should call `ConversationModule::clone_conversation`
    /// for it.
    ConversationCloneRequested {
        conversation_id: String,
        from_device: String,
        peer_uri: Option<String>,
    },
    ConversationSyncFinished,
    ConversationLoaded {
        conversation_id: String,
    },
    MessagesFound {
        conversation_id: String,
        commit_id: String,
    },
    AccountMessageStatusChanged {
        conversation_id: String,
        message_id: String,
    },

    NeedsHost,
    MigrationEnded {
        ok: bool,
    },
    NearbyPeerNotification {
        account_id: String,
    },
    RegisteredNameFound {
        account_id: String,
        name: Option<String>,
    },
    NameRegistrationEnded {
        ok: bool,
    },
}

/// Callback invoked on successful authentication; carries the resulting
/// account info handle (opaque account id string here — the embedder looks
/// up the live `AccountInfo` by id).
pub type OnSuccess = Box<dyn Fn(String) + Send + Sync>;
/// Callback invoked on terminal authentication failure.
pub type OnFailure = Box<dyn Fn(AuthError) + Send + Sync>;
/// Callback invoked on every link-state transition.
pub type OnChange = Box<dyn Fn(LinkState) + Send + Sync>;
/// Callback used for the synchronous `addDevice` result kind.
pub type OnAddDeviceError = Box<dyn Fn(AddDeviceError) + Send + Sync>;
