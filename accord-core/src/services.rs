//! Trait seams the embedding application implements: the DHT, the channel
//! transport, and the git-like repository backing each conversation.
//!
//! None of these are implemented against a real network or disk store here.
//! [`testing`] ships an in-memory reference implementation used by this
//! crate's own tests and doc examples.

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel is shut down")]
    ShutDown,
    #[error("write failed: {0}")]
    Write(String),
}

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("repository for {0} does not exist")]
    NotFound(String),
    #[error("repository operation failed: {0}")]
    Failed(String),
}

/// Outcome of [`RepoStore::fetch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchResult {
    UpToDate,
    Advanced { commit_id: String },
}

/// A handle to one conversation's on-disk repository. Opaque to everything
/// outside the `RepoStore` implementation.
pub type RepoHandle = String;

/// The external distributed hash table: `get`/`put`/`listen` on
/// cryptographic keys. A `listen` registration is cancelled by token.
#[async_trait]
pub trait DhtService: Send + Sync {
    async fn get(&self, key: &str) -> Vec<Vec<u8>>;
    async fn put(&self, key: &str, value: Vec<u8>, encrypted: bool);
    async fn listen(&self, key: &str) -> ListenToken;
    async fn cancel_listen(&self, token: ListenToken);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenToken(pub u64);

/// An authenticated point-to-point transport, multiplexed by sub-protocol
/// name.
#[async_trait]
pub trait ChannelService: Send + Sync {
    async fn open(&self, peer: &str, sub_protocol: &str) -> Result<Box<dyn ChannelSocket>, ChannelError>;
    fn on_incoming(&self, sub_protocol: &str, handler: Box<dyn Fn(Box<dyn ChannelSocket>) + Send + Sync>);
}

/// One open channel. `on_shutdown` handlers fire exactly once; `on_recv`
/// handlers fire once per inbound frame, in arrival order.
#[async_trait]
pub trait ChannelSocket: Send + Sync {
    async fn write(&self, bytes: &[u8]) -> Result<(), ChannelError>;
    async fn shutdown(&self);
    fn on_shutdown(&self, handler: Box<dyn Fn() + Send + Sync>);
    fn on_recv(&self, handler: Box<dyn Fn(&[u8]) + Send + Sync>);
    fn peer_device_id(&self) -> String;
}

/// The git-like repository layer backing each conversation: clone, commit,
/// fetch, membership, and erasure.
#[async_trait]
pub trait RepoStore: Send + Sync {
    async fn clone_repo(
        &self,
        conv_id: &str,
        socket: &dyn ChannelSocket,
    ) -> Result<RepoHandle, RepoError>;
    async fn commit(&self, handle: &RepoHandle, data: &[u8]) -> Result<String, RepoError>;
    async fn fetch(
        &self,
        handle: &RepoHandle,
        peer: &str,
        device: &str,
        commit_id: Option<&str>,
    ) -> Result<FetchResult, RepoError>;
    async fn erase(&self, conv_id: &str) -> Result<(), RepoError>;
    async fn is_member(&self, handle: &RepoHandle, account_id: &str) -> bool;
}

/// In-memory/filesystem reference implementations of the trait seams, for
/// this crate's own tests and doc examples. Not a production DHT/transport/
/// git stack.
pub mod testing {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;
    use tokio::sync::Mutex;

    /// A channel service that refuses every `open` call. Useful in tests
    /// exercising a credential flow that never touches the transport.
    #[derive(Default)]
    pub struct NoopChannelService;

    #[async_trait]
    impl ChannelService for NoopChannelService {
        async fn open(&self, peer: &str, _sub_protocol: &str) -> Result<Box<dyn ChannelSocket>, ChannelError> {
            Err(ChannelError::Write(format!("no transport configured for {peer}")))
        }

        fn on_incoming(&self, _sub_protocol: &str, _handler: Box<dyn Fn(Box<dyn ChannelSocket>) + Send + Sync>) {}
    }

    /// A DHT backed by an in-process map. `listen` is a no-op that returns a
    /// fresh token; nothing is pushed to listeners (tests poll `get`
    /// directly).
    #[derive(Default)]
    pub struct InMemoryDht {
        values: Mutex<BTreeMap<String, Vec<Vec<u8>>>>,
        next_token: AtomicU64,
    }

    impl InMemoryDht {
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl DhtService for InMemoryDht {
        async fn get(&self, key: &str) -> Vec<Vec<u8>> {
            self.values.lock().await.get(key).cloned().unwrap_or_default()
        }

        async fn put(&self, key: &str, value: Vec<u8>, _encrypted: bool) {
            self.values.lock().await.entry(key.to_string()).or_default().push(value);
        }

        async fn listen(&self, _key: &str) -> ListenToken {
            ListenToken(self.next_token.fetch_add(1, Ordering::Relaxed))
        }

        async fn cancel_listen(&self, _token: ListenToken) {}
    }

    /// A repository store backed by an in-process commit log per
    /// conversation id. `clone_repo` copies nothing over the wire; it just
    /// registers the conversation as known.
    #[derive(Default)]
    pub struct InMemoryRepoStore {
        repos: Mutex<BTreeMap<String, Vec<String>>>,
        members: Mutex<BTreeMap<String, Vec<String>>>,
    }

    impl InMemoryRepoStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub async fn set_members(&self, conv_id: &str, members: Vec<String>) {
            self.members.lock().await.insert(conv_id.to_string(), members);
        }
    }

    #[async_trait]
    impl RepoStore for InMemoryRepoStore {
        async fn clone_repo(&self, conv_id: &str, _socket: &dyn ChannelSocket) -> Result<RepoHandle, RepoError> {
            self.repos.lock().await.entry(conv_id.to_string()).or_default();
            Ok(conv_id.to_string())
        }

        async fn commit(&self, handle: &RepoHandle, data: &[u8]) -> Result<String, RepoError> {
            let mut repos = self.repos.lock().await;
            let log = repos
                .get_mut(handle)
                .ok_or_else(|| RepoError::NotFound(handle.clone()))?;
            let commit_id = format!("{}-{}", handle, log.len());
            log.push(String::from_utf8_lossy(data).to_string());
            Ok(commit_id)
        }

        async fn fetch(
            &self,
            handle: &RepoHandle,
            _peer: &str,
            _device: &str,
            commit_id: Option<&str>,
        ) -> Result<FetchResult, RepoError> {
            let repos = self.repos.lock().await;
            let log = repos.get(handle).ok_or_else(|| RepoError::NotFound(handle.clone()))?;
            match (commit_id, log.last()) {
                (Some(id), Some(last)) if format!("{}-{}", handle, log.len() - 1) == id => {
                    let _ = last;
                    Ok(FetchResult::UpToDate)
                }
                (_, Some(_)) => Ok(FetchResult::Advanced {
                    commit_id: format!("{}-{}", handle, log.len() - 1),
                }),
                (_, None) => Ok(FetchResult::UpToDate),
            }
        }

        async fn erase(&self, conv_id: &str) -> Result<(), RepoError> {
            self.repos.lock().await.remove(conv_id);
            Ok(())
        }

        async fn is_member(&self, handle: &RepoHandle, account_id: &str) -> bool {
            self.members
                .lock()
                .await
                .get(handle)
                .map(|members| members.iter().any(|m| m == account_id))
                .unwrap_or(false)
        }
    }

    /// A channel socket backed by a pair of in-process queues. `paired()`
    /// returns two ends wired to each other.
    pub struct InMemoryChannelSocket {
        peer_device_id: String,
        shutdown_handlers: Mutex<Vec<Box<dyn Fn() + Send + Sync>>>,
        recv_handlers: Mutex<Vec<Box<dyn Fn(&[u8]) + Send + Sync>>>,
        sent: Mutex<Vec<Vec<u8>>>,
    }

    impl InMemoryChannelSocket {
        pub fn new(peer_device_id: impl Into<String>) -> Arc<Self> {
            Arc::new(Self {
                peer_device_id: peer_device_id.into(),
                shutdown_handlers: Mutex::new(Vec::new()),
                recv_handlers: Mutex::new(Vec::new()),
                sent: Mutex::new(Vec::new()),
            })
        }

        pub async fn sent_frames(&self) -> Vec<Vec<u8>> {
            self.sent.lock().await.clone()
        }

        /// Feed `bytes` to every registered `on_recv` handler, as if they'd
        /// arrived from the peer.
        pub async fn deliver(&self, bytes: &[u8]) {
            for handler in self.recv_handlers.lock().await.iter() {
                handler(bytes);
            }
        }
    }

    #[async_trait]
    impl ChannelSocket for InMemoryChannelSocket {
        async fn write(&self, bytes: &[u8]) -> Result<(), ChannelError> {
            self.sent.lock().await.push(bytes.to_vec());
            Ok(())
        }

        async fn shutdown(&self) {
            for handler in self.shutdown_handlers.lock().await.drain(..) {
                handler();
            }
        }

        fn on_shutdown(&self, handler: Box<dyn Fn() + Send + Sync>) {
            self.shutdown_handlers.try_lock().expect("uncontended in tests").push(handler);
        }

        fn on_recv(&self, handler: Box<dyn Fn(&[u8]) + Send + Sync>) {
            self.recv_handlers.try_lock().expect("uncontended in tests").push(handler);
        }

        fn peer_device_id(&self) -> String {
            self.peer_device_id.clone()
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[tokio::test]
        async fn in_memory_dht_round_trips() {
            let dht = InMemoryDht::new();
            assert!(dht.get("k").await.is_empty());
            dht.put("k", b"v".to_vec(), false).await;
            assert_eq!(dht.get("k").await, vec![b"v".to_vec()]);
        }

        #[tokio::test]
        async fn in_memory_repo_store_commit_and_fetch() {
            let store = InMemoryRepoStore::new();
            let socket = InMemoryChannelSocket::new("dev1");
            let handle = store.clone_repo("conv1", socket.as_ref()).await.unwrap();
            store.commit(&handle, b"hello").await.unwrap();
            let result = store.fetch(&handle, "peer", "dev1", None).await.unwrap();
            assert!(matches!(result, FetchResult::Advanced { .. }));
        }
    }
}
