//! Per-conversation clone/fetch state machine, pending-fetch drainer,
//! request lifecycle, membership mutation, and sync ingestion.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::error::ConversationError;
use crate::events::Event;
use crate::services::{ChannelService, ChannelSocket, RepoStore};

/// Replicated per-conversation metadata (§3). `removed_ts > 0` marks a
/// soft-deletion (the device left); `erased_ts > 0` allows physical repo
/// deletion once every still-joined peer has synced past the leave.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ConvInfo {
    pub id: String,
    pub created_ts: i64,
    pub members: Vec<String>,
    pub removed_ts: i64,
    pub erased_ts: i64,
    pub last_displayed: Option<i64>,
}

impl ConvInfo {
    pub fn is_removed(&self) -> bool {
        self.removed_ts > 0
    }

    pub fn is_erased(&self) -> bool {
        self.erased_ts > 0
    }
}

/// An incoming conversation invite. `declined_ts` is terminal once set: a
/// later sync carrying a newer `received_ts` for the same id does not
/// resurrect it (REDESIGN FLAGS: declined stays declined).
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct ConversationRequest {
    pub conversation_id: String,
    pub from: String,
    pub received_ts: i64,
    pub declined_ts: Option<i64>,
    pub metadatas_kv: BTreeMap<String, String>,
}

/// One in-flight clone or fetch, deduplicated per `(conversation_id)`.
pub struct PendingFetch {
    pub ready: bool,
    pub cloning: bool,
    pub device_id: String,
    pub remove_id: Option<String>,
    pub preferences: BTreeMap<String, String>,
    pub last_displayed: Option<i64>,
    pub socket: Option<Arc<dyn ChannelSocket>>,
    pub connecting_to: BTreeSet<String>,
}

impl PendingFetch {
    fn new(device_id: &str) -> Self {
        Self {
            ready: false,
            cloning: false,
            device_id: device_id.to_string(),
            remove_id: None,
            preferences: BTreeMap::new(),
            last_displayed: None,
            socket: None,
            connecting_to: BTreeSet::new(),
        }
    }
}

/// A materialized conversation: the repo handle plus the replicated view
/// needed to answer membership/ban questions without a round trip.
#[derive(Debug, Clone)]
pub struct Conversation {
    pub repo: crate::services::RepoHandle,
    pub banned_devices: BTreeSet<String>,
}

#[derive(Default)]
struct SyncState {
    /// A conversation waiting for the last remaining peer to ack a leave
    /// commit before its repo is erased (§4.5.6 point 3).
    awaiting_leave_ack: BTreeSet<String>,
}

/// Four-partition sync snapshot this module both produces and ingests
/// (`msg.c`, `msg.cr`, `msg.p`, `msg.ld` in spec terms).
#[derive(Debug, Clone, Default)]
pub struct ConversationSyncMsg {
    pub conv_infos: BTreeMap<String, ConvInfo>,
    pub conv_requests: BTreeMap<String, ConversationRequest>,
    pub preferences: BTreeMap<String, BTreeMap<String, String>>,
    pub last_displayed: BTreeMap<String, i64>,
}

/// Per-conversation state and the operations that mutate it. Lock order:
/// `conversations` before `conv_infos`; `pending_fetches` is always a leaf.
pub struct ConversationModule {
    conversations: Mutex<BTreeMap<String, Conversation>>,
    conv_infos: Mutex<BTreeMap<String, ConvInfo>>,
    conversation_requests: Mutex<BTreeMap<String, ConversationRequest>>,
    pending_fetches: Mutex<BTreeMap<String, PendingFetch>>,
    replay: Mutex<BTreeMap<String, Vec<Vec<u8>>>>,
    sync_state: Mutex<SyncState>,
    sync_counter: AtomicUsize,
    notification_seq: AtomicU64,
    repo_store: Arc<dyn RepoStore>,
    channels: Arc<dyn ChannelService>,
    self_account_id: String,
}

impl ConversationModule {
    pub fn new(repo_store: Arc<dyn RepoStore>, channels: Arc<dyn ChannelService>, self_account_id: impl Into<String>) -> Self {
        Self {
            conversations: Mutex::new(BTreeMap::new()),
            conv_infos: Mutex::new(BTreeMap::new()),
            conversation_requests: Mutex::new(BTreeMap::new()),
            pending_fetches: Mutex::new(BTreeMap::new()),
            replay: Mutex::new(BTreeMap::new()),
            sync_state: Mutex::new(SyncState::default()),
            sync_counter: AtomicUsize::new(0),
            notification_seq: AtomicU64::new(0),
            repo_store,
            channels,
            self_account_id: self_account_id.into(),
        }
    }

    pub fn conv_info(&self, conv_id: &str) -> Option<ConvInfo> {
        self.conv_infos.lock().get(conv_id).cloned()
    }

    fn known_locally(&self, conv_id: &str) -> bool {
        self.conversations.lock().contains_key(conv_id)
    }

    /// `startFetch`: create the `PendingFetch` if none exists; reject if a
    /// clone is already in progress (`ready`) or `device_id` is already
    /// connecting.
    fn start_fetch(&self, conv_id: &str, device_id: &str) -> Result<(), ConversationError> {
        let mut pending = self.pending_fetches.lock();
        match pending.get_mut(conv_id) {
            Some(entry) if entry.ready => Err(ConversationError::AlreadyCloning(conv_id.to_string())),
            Some(entry) if entry.connecting_to.contains(device_id) => {
                Err(ConversationError::AlreadyFetching(conv_id.to_string()))
            }
            Some(entry) => {
                entry.connecting_to.insert(device_id.to_string());
                Ok(())
            }
            None => {
                let mut entry = PendingFetch::new(device_id);
                entry.connecting_to.insert(device_id.to_string());
                pending.insert(conv_id.to_string(), entry);
                Ok(())
            }
        }
    }

    /// `cloneConversation` (§4.5.2). Updates `last_displayed` in place if
    /// the conversation is already known locally; otherwise starts a fetch
    /// and opens the clone channel.
    pub async fn clone_conversation(
        &self,
        device_id: &str,
        peer_uri: &str,
        conv_id: &str,
        last_displayed: Option<i64>,
    ) -> Result<(), ConversationError> {
        if self.known_locally(conv_id) {
            if let Some(ts) = last_displayed {
                self.apply_last_displayed(conv_id, ts, true);
            }
            return Ok(());
        }

        tracing::info!(conversation_id = %conv_id, device_id = %device_id, "cloning conversation");
        self.start_fetch(conv_id, device_id)?;

        {
            let mut conv_infos = self.conv_infos.lock();
            conv_infos.entry(conv_id.to_string()).or_insert(ConvInfo {
                id: conv_id.to_string(),
                created_ts: now_placeholder(),
                members: vec![self.self_account_id.clone(), peer_uri.to_string()],
                removed_ts: 0,
                erased_ts: 0,
                last_displayed,
            });
        }

        let socket = self.channels.open(peer_uri, "application/im-gitmessage-id").await;
        if let Ok(socket) = socket {
            let socket: Arc<dyn ChannelSocket> = socket.into();
            let mut pending = self.pending_fetches.lock();
            if let Some(entry) = pending.get_mut(conv_id) {
                entry.ready = true;
                entry.socket = Some(socket);
            }
        }
        Ok(())
    }

    /// `fetchNewCommits` (§4.5.3).
    pub async fn fetch_new_commits(
        &self,
        peer: &str,
        device: &str,
        conv_id: &str,
        commit_id: Option<&str>,
    ) -> Result<(), ConversationError> {
        let handle = {
            let conversations = self.conversations.lock();
            conversations.get(conv_id).cloned()
        };

        if let Some(conversation) = handle {
            if !self.repo_store.is_member(&conversation.repo, peer).await {
                tracing::warn!(conversation_id = %conv_id, peer = %peer, "fetch rejected, peer is not a member");
                return Err(ConversationError::NotAMember(peer.to_string(), conv_id.to_string()));
            }
            if conversation.banned_devices.contains(device) {
                tracing::warn!(conversation_id = %conv_id, device_id = %device, "fetch rejected, device is banned");
                return Err(ConversationError::DeviceBanned(device.to_string(), conv_id.to_string()));
            }
            self.start_fetch(conv_id, device)?;
            self.sync_counter.fetch_add(1, Ordering::SeqCst);

            let result = self.repo_store.fetch(&conversation.repo, peer, device, commit_id).await;

            self.pending_fetches.lock().remove(conv_id);
            self.sync_counter.fetch_sub(1, Ordering::SeqCst);
            return result.map(|_| ()).map_err(|_| ConversationError::NoLocalCommit);
        }

        let has_pending = {
            let pending = self.pending_fetches.lock();
            pending.contains_key(conv_id)
        };
        if has_pending {
            return Ok(());
        }

        if self.conv_infos.lock().contains_key(conv_id) {
            return self.clone_conversation(device, peer, conv_id, None).await;
        }

        tracing::debug!(conversation_id = %conv_id, from = %peer, "requesting invite for unknown conversation");
        Ok(())
    }

    /// An emitted `conversationSyncFinished` whenever the global in-flight
    /// fetch count returns to zero.
    pub fn sync_in_flight(&self) -> bool {
        self.sync_counter.load(Ordering::SeqCst) > 0
    }

    /// The ~10 ms pending-fetch drainer (§4.5.4). Caller keeps or aborts the
    /// returned handle; nothing is spawned unsupervised.
    pub fn spawn_pending_fetch_drainer(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let module = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(period).await;
                let ready: Vec<String> = {
                    let mut pending = module.pending_fetches.lock();
                    pending
                        .iter_mut()
                        .filter(|(_, entry)| entry.ready && !entry.cloning)
                        .map(|(id, entry)| {
                            entry.cloning = true;
                            id.clone()
                        })
                        .collect()
                };
                for conv_id in ready {
                    module.handle_pending_conversation(&conv_id).await;
                }
            }
        })
    }

    /// `handlePendingConversation`: materialize the repo, verify self
    /// membership, replay stashed messages, apply stashed preferences and
    /// last-displayed, and emit `conversationReady`.
    async fn handle_pending_conversation(&self, conv_id: &str) -> Option<Event> {
        let socket = {
            let pending = self.pending_fetches.lock();
            pending.get(conv_id)?.socket.clone()
        }?;

        let repo = self.repo_store.clone_repo(conv_id, socket.as_ref()).await.ok()?;

        if !self.repo_store.is_member(&repo, &self.self_account_id).await {
            let _ = self.repo_store.erase(conv_id).await;
            self.pending_fetches.lock().remove(conv_id);
            return None;
        }

        if self.conv_infos.lock().get(conv_id).map(|c| c.is_removed()).unwrap_or(false) {
            let _ = self.repo_store.erase(conv_id).await;
            self.pending_fetches.lock().remove(conv_id);
            return None;
        }

        self.conversations.lock().insert(
            conv_id.to_string(),
            Conversation {
                repo: repo.clone(),
                banned_devices: BTreeSet::new(),
            },
        );
        tracing::info!(conversation_id = %conv_id, "conversation ready");

        let replay_msgs = self.replay.lock().remove(conv_id).unwrap_or_default();
        for msg in replay_msgs {
            let _ = self.repo_store.commit(&repo, &msg).await;
        }

        let (preferences, last_displayed) = {
            let pending = self.pending_fetches.lock();
            let entry = pending.get(conv_id)?;
            (entry.preferences.clone(), entry.last_displayed)
        };
        if let Some(ts) = last_displayed {
            self.apply_last_displayed(conv_id, ts, true);
        }
        let _ = preferences;

        self.pending_fetches.lock().remove(conv_id);

        Some(Event::ConversationReady {
            conversation_id: conv_id.to_string(),
        })
    }

    /// `onTrustRequest` for the conversation-invite path (§4.5.5).
    pub fn on_trust_request(&self, uri: &str, conv_id: &str, payload_metadata: BTreeMap<String, String>, received: i64) -> Vec<Event> {
        let mut requests = self.conversation_requests.lock();
        if requests.contains_key(conv_id) {
            return Vec::new();
        }
        tracing::info!(conversation_id = %conv_id, from = %uri, "conversation request received");
        requests.insert(
            conv_id.to_string(),
            ConversationRequest {
                conversation_id: conv_id.to_string(),
                from: uri.to_string(),
                received_ts: received,
                declined_ts: None,
                metadatas_kv: payload_metadata,
            },
        );
        vec![
            Event::TrustRequestIncoming {
                from: uri.to_string(),
                from_device: String::new(),
            },
            Event::ConversationRequestReceived {
                conversation_id: conv_id.to_string(),
                from: uri.to_string(),
            },
        ]
    }

    pub fn accept_conversation_request(&self, conv_id: &str) -> Option<ConversationRequest> {
        let req = self.conversation_requests.lock().remove(conv_id);
        if req.is_some() {
            tracing::info!(conversation_id = %conv_id, "conversation request accepted");
        }
        req
    }

    pub fn decline_conversation_request(&self, conv_id: &str, now: i64) -> Option<Event> {
        let mut requests = self.conversation_requests.lock();
        let req = requests.get_mut(conv_id)?;
        req.declined_ts = Some(now);
        tracing::info!(conversation_id = %conv_id, "conversation request declined");
        Some(Event::ConversationRequestDeclined {
            conversation_id: conv_id.to_string(),
        })
    }

    /// `removeConversation` (§4.5.6). For an active 1:1 with other members
    /// still present, stamp `removed` only — the repo survives until the
    /// peer acks the leave (see [`Self::note_peer_advanced`]).
    pub async fn remove_conversation(&self, conv_id: &str, now: i64) -> Vec<Event> {
        let mut events = Vec::new();
        let (is_one_to_one_with_peers, ever_cloned) = {
            let conv_infos = self.conv_infos.lock();
            let Some(info) = conv_infos.get(conv_id) else {
                return events;
            };
            let one_to_one = info.members.len() == 2;
            (one_to_one, self.conversations.lock().contains_key(conv_id))
        };

        tracing::info!(conversation_id = %conv_id, "removing conversation");
        {
            let mut conv_infos = self.conv_infos.lock();
            if let Some(info) = conv_infos.get_mut(conv_id) {
                info.removed_ts = now;
                if !ever_cloned {
                    info.erased_ts = now;
                }
            }
        }
        events.push(Event::ConversationRemoved {
            conversation_id: conv_id.to_string(),
        });

        if is_one_to_one_with_peers && ever_cloned {
            self.sync_state.lock().awaiting_leave_ack.insert(conv_id.to_string());
        } else {
            let _ = self.repo_store.erase(conv_id).await;
            self.conversations.lock().remove(conv_id);
        }
        events
    }

    /// `setFetched`-equivalent hook: call once a fetch observes the last
    /// remaining peer has advanced past the leave commit, to finally erase
    /// the repo for a 1:1 conversation kept around per §4.5.6 point 3.
    pub async fn note_peer_advanced(&self, conv_id: &str, remaining_active_peers: usize) {
        let awaiting = self.sync_state.lock().awaiting_leave_ack.contains(conv_id);
        if awaiting && remaining_active_peers == 0 {
            tracing::info!(conversation_id = %conv_id, "last peer advanced past leave, erasing repo");
            let _ = self.repo_store.erase(conv_id).await;
            self.conversations.lock().remove(conv_id);
            self.sync_state.lock().awaiting_leave_ack.remove(conv_id);
            let mut conv_infos = self.conv_infos.lock();
            if let Some(info) = conv_infos.get_mut(conv_id) {
                info.erased_ts = now_placeholder();
            }
        }
    }

    /// Tie-break (REDESIGN FLAGS): newer epoch wins; on a tie the live
    /// in-memory value (when `prefer_live` is set, i.e. this call came from
    /// the local `Conversation` rather than a sync partition) wins.
    pub fn apply_last_displayed(&self, conv_id: &str, ts: i64, prefer_live: bool) {
        let mut conv_infos = self.conv_infos.lock();
        if let Some(info) = conv_infos.get_mut(conv_id) {
            let current = info.last_displayed.unwrap_or(i64::MIN);
            if ts > current || (ts == current && prefer_live) {
                info.last_displayed = Some(ts);
            }
        } else {
            let mut pending = self.pending_fetches.lock();
            if let Some(entry) = pending.get_mut(conv_id) {
                let current = entry.last_displayed.unwrap_or(i64::MIN);
                if ts > current || (ts == current && prefer_live) {
                    entry.last_displayed = Some(ts);
                }
            }
        }
    }

    /// `onSyncData` (§4.5.7): process the four partitions.
    pub fn on_sync_data(&self, msg: &ConversationSyncMsg, from_device: &str) -> Vec<Event> {
        let mut events = Vec::new();

        for (conv_id, incoming) in &msg.conv_infos {
            let mut conv_infos = self.conv_infos.lock();
            match conv_infos.get(conv_id) {
                Some(local) if local.is_removed() && incoming.created_ts <= local.removed_ts => {
                    // A newer local removal suppresses re-clone of a stale incoming entry.
                }
                Some(local) if local.is_removed() && incoming.removed_ts == 0 => {
                    let mut updated = local.clone();
                    updated.removed_ts = 0;
                    conv_infos.insert(conv_id.clone(), updated);
                }
                None if incoming.removed_ts == 0 => {
                    conv_infos.insert(conv_id.clone(), incoming.clone());
                    let peer_uri = incoming.members.iter().find(|m| m.as_str() != self.self_account_id).cloned();
                    tracing::debug!(conversation_id = %conv_id, from_device = %from_device, "unknown conversation from sync, requesting clone");
                    events.push(Event::ConversationCloneRequested {
                        conversation_id: conv_id.clone(),
                        from_device: from_device.to_string(),
                        peer_uri,
                    });
                }
                Some(_) if incoming.removed_ts > 0 => {
                    if let Some(local) = conv_infos.get_mut(conv_id) {
                        local.removed_ts = incoming.removed_ts;
                        local.erased_ts = incoming.erased_ts;
                    }
                    tracing::info!(conversation_id = %conv_id, from_device = %from_device, "conversation removed via sync");
                    events.push(Event::ConversationRemoved {
                        conversation_id: conv_id.clone(),
                    });
                }
                _ => {}
            }
        }

        {
            let mut requests = self.conversation_requests.lock();
            for (conv_id, incoming) in &msg.conv_requests {
                match requests.get_mut(conv_id) {
                    Some(existing) if existing.declined_ts.is_some() => {
                        // Declining is terminal; a newer `received` does not undo it.
                    }
                    Some(existing) => {
                        if incoming.received_ts > existing.received_ts {
                            existing.received_ts = incoming.received_ts;
                        }
                    }
                    None => {
                        requests.insert(conv_id.clone(), incoming.clone());
                        events.push(Event::ConversationRequestReceived {
                            conversation_id: conv_id.clone(),
                            from: incoming.from.clone(),
                        });
                    }
                }
            }
        }

        for (conv_id, prefs) in &msg.preferences {
            if self.known_locally(conv_id) {
                // Applied directly against the live conversation by the embedder.
            } else {
                let mut pending = self.pending_fetches.lock();
                if let Some(entry) = pending.get_mut(conv_id) {
                    entry.preferences.extend(prefs.clone());
                }
            }
        }

        for (conv_id, ts) in &msg.last_displayed {
            self.apply_last_displayed(conv_id, *ts, false);
        }

        events
    }

    /// `sendMessageNotification` (§4.5.8): serialize `{id, commit, deviceId}`
    /// and fan it out over the outbound message callback, deduplicating
    /// repeated notifications with identical content per peer.
    pub fn build_notification(&self, conv_id: &str, commit_id: &str, device_id: &str) -> (u64, String) {
        let token = self.notification_seq.fetch_add(1, Ordering::Relaxed);
        let json = serde_json::json!({ "id": conv_id, "commit": commit_id, "deviceId": device_id }).to_string();
        (token, json)
    }

    pub fn members(&self, conv_id: &str, include_self: bool) -> Vec<String> {
        let conv_infos = self.conv_infos.lock();
        conv_infos
            .get(conv_id)
            .map(|info| {
                info.members
                    .iter()
                    .filter(|m| include_self || m.as_str() != self.self_account_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

fn now_placeholder() -> i64 {
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::testing::InMemoryRepoStore;

    struct StubSocket(String);

    #[async_trait::async_trait]
    impl ChannelSocket for StubSocket {
        async fn write(&self, _bytes: &[u8]) -> Result<(), crate::services::ChannelError> {
            Ok(())
        }
        async fn shutdown(&self) {}
        fn on_shutdown(&self, _handler: Box<dyn Fn() + Send + Sync>) {}
        fn on_recv(&self, _handler: Box<dyn Fn(&[u8]) + Send + Sync>) {}
        fn peer_device_id(&self) -> String {
            self.0.clone()
        }
    }

    struct NoopChannels;

    #[async_trait::async_trait]
    impl ChannelService for NoopChannels {
        async fn open(&self, peer: &str, _sub_protocol: &str) -> Result<Box<dyn ChannelSocket>, crate::services::ChannelError> {
            Ok(Box::new(StubSocket(peer.to_string())) as Box<dyn ChannelSocket>)
        }
        fn on_incoming(&self, _sub_protocol: &str, _handler: Box<dyn Fn(Box<dyn ChannelSocket>) + Send + Sync>) {}
    }

    fn module() -> Arc<ConversationModule> {
        Arc::new(ConversationModule::new(
            Arc::new(InMemoryRepoStore::new()),
            Arc::new(NoopChannels),
            "self-account",
        ))
    }

    #[tokio::test]
    async fn clone_dedup_only_one_pending_fetch_per_conversation() {
        let module = module();
        module.clone_conversation("d1", "peer", "conv1", None).await.unwrap();
        let result = module.clone_conversation("d2", "peer", "conv1", None).await;
        assert!(result.is_ok());
        assert_eq!(module.pending_fetches.lock().len(), 1);
    }

    #[test]
    fn new_conv_info_from_sync_requests_a_clone() {
        let module = module();
        let msg = ConversationSyncMsg {
            conv_infos: BTreeMap::from([(
                "cid".to_string(),
                ConvInfo {
                    id: "cid".to_string(),
                    created_ts: 10,
                    members: vec!["self-account".to_string(), "peer".to_string()],
                    removed_ts: 0,
                    erased_ts: 0,
                    last_displayed: None,
                },
            )]),
            ..Default::default()
        };
        let events = module.on_sync_data(&msg, "peer-device");
        assert_eq!(events.len(), 1);
        match &events[0] {
            Event::ConversationCloneRequested {
                conversation_id,
                from_device,
                peer_uri,
            } => {
                assert_eq!(conversation_id, "cid");
                assert_eq!(from_device, "peer-device");
                assert_eq!(peer_uri.as_deref(), Some("peer"));
            }
            other => panic!("expected ConversationCloneRequested, got {other:?}"),
        }
    }

    #[test]
    fn scenario_s7_removed_then_readded_conversation() {
        let module = module();
        {
            let mut conv_infos = module.conv_infos.lock();
            conv_infos.insert(
                "cid".to_string(),
                ConvInfo {
                    id: "cid".to_string(),
                    created_ts: 100,
                    members: vec!["self-account".to_string(), "peer".to_string()],
                    removed_ts: 200,
                    erased_ts: 0,
                    last_displayed: None,
                },
            );
        }

        let stale = ConversationSyncMsg {
            conv_infos: BTreeMap::from([(
                "cid".to_string(),
                ConvInfo {
                    id: "cid".to_string(),
                    created_ts: 150,
                    members: vec![],
                    removed_ts: 0,
                    erased_ts: 0,
                    last_displayed: None,
                },
            )]),
            ..Default::default()
        };
        module.on_sync_data(&stale, "peer-device");
        assert!(module.conv_infos.lock()["cid"].is_removed());

        let fresh = ConversationSyncMsg {
            conv_infos: BTreeMap::from([(
                "cid".to_string(),
                ConvInfo {
                    id: "cid".to_string(),
                    created_ts: 300,
                    members: vec![],
                    removed_ts: 0,
                    erased_ts: 0,
                    last_displayed: None,
                },
            )]),
            ..Default::default()
        };
        module.on_sync_data(&fresh, "peer-device");
        assert!(!module.conv_infos.lock()["cid"].is_removed());
    }

    #[test]
    fn scenario_s6_concurrent_conversation_requests_store_exactly_one() {
        let module = module();
        let msg = ConversationSyncMsg {
            conv_requests: BTreeMap::from([(
                "cid".to_string(),
                ConversationRequest {
                    conversation_id: "cid".to_string(),
                    from: "A".to_string(),
                    received_ts: 1,
                    declined_ts: None,
                    metadatas_kv: BTreeMap::new(),
                },
            )]),
            ..Default::default()
        };
        let events = module.on_sync_data(&msg, "peer-device");
        assert_eq!(events.len(), 1);

        let msg_again = ConversationSyncMsg {
            conv_requests: BTreeMap::from([(
                "cid".to_string(),
                ConversationRequest {
                    conversation_id: "cid".to_string(),
                    from: "A".to_string(),
                    received_ts: 2,
                    declined_ts: None,
                    metadatas_kv: BTreeMap::new(),
                },
            )]),
            ..Default::default()
        };
        let events_again = module.on_sync_data(&msg_again, "peer-device");
        assert!(events_again.is_empty());
        assert_eq!(module.conversation_requests.lock().len(), 1);
    }

    #[test]
    fn declined_request_stays_declined_after_newer_sync() {
        let module = module();
        module.conversation_requests.lock().insert(
            "cid".to_string(),
            ConversationRequest {
                conversation_id: "cid".to_string(),
                from: "A".to_string(),
                received_ts: 1,
                declined_ts: Some(5),
                metadatas_kv: BTreeMap::new(),
            },
        );
        let msg = ConversationSyncMsg {
            conv_requests: BTreeMap::from([(
                "cid".to_string(),
                ConversationRequest {
                    conversation_id: "cid".to_string(),
                    from: "A".to_string(),
                    received_ts: 100,
                    declined_ts: None,
                    metadatas_kv: BTreeMap::new(),
                },
            )]),
            ..Default::default()
        };
        module.on_sync_data(&msg, "peer-device");
        assert!(module.conversation_requests.lock()["cid"].declined_ts.is_some());
    }

    #[test]
    fn last_displayed_tie_break_prefers_live_on_equal_epoch() {
        let module = module();
        module.conv_infos.lock().insert(
            "cid".to_string(),
            ConvInfo {
                id: "cid".to_string(),
                created_ts: 0,
                members: vec![],
                removed_ts: 0,
                erased_ts: 0,
                last_displayed: Some(10),
            },
        );
        module.apply_last_displayed("cid", 10, true);
        assert_eq!(module.conv_infos.lock()["cid"].last_displayed, Some(10));
        module.apply_last_displayed("cid", 20, false);
        assert_eq!(module.conv_infos.lock()["cid"].last_displayed, Some(20));
    }
}
