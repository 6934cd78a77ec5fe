//! Device-sync channel management: caching active sync sockets, framing
//! outbound snapshots, and dispatching inbound frames to the two modules
//! that own sync state.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::services::{ChannelError, ChannelSocket};

/// Maximum size of one framed packet (§4.6): oversized partitions are split
/// by key into successive packets, never broken mid-key.
pub const MAX_PACKET_BYTES: usize = 64 * 1024;

/// The five partitions exchanged over a sync connection, in the fixed send
/// order `device_sync, conv_infos, conv_requests, conv_preferences,
/// message_status`.
#[derive(Debug, Clone, Default)]
pub struct SyncMsg {
    pub device_sync: Option<Vec<u8>>,
    pub conv_infos: BTreeMap<String, Vec<u8>>,
    pub conv_requests: BTreeMap<String, Vec<u8>>,
    pub conv_preferences: BTreeMap<String, Vec<u8>>,
    pub message_status: BTreeMap<String, Vec<u8>>,
}

impl SyncMsg {
    pub fn is_empty(&self) -> bool {
        self.device_sync.is_none()
            && self.conv_infos.is_empty()
            && self.conv_requests.is_empty()
            && self.conv_preferences.is_empty()
            && self.message_status.is_empty()
    }
}

/// One framed, length-prefixed packet ready to write to a socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub partition: &'static str,
    pub bytes: Vec<u8>,
}

/// Split a keyed partition into one or more frames, each under
/// [`MAX_PACKET_BYTES`], never splitting a single key's encoded entry
/// across two frames.
fn split_partition(partition: &'static str, entries: &BTreeMap<String, Vec<u8>>) -> Vec<Frame> {
    if entries.is_empty() {
        return Vec::new();
    }

    let mut frames = Vec::new();
    let mut current = rmp_serde::to_vec(&BTreeMap::<String, Vec<u8>>::new()).unwrap_or_default();
    let mut current_map: BTreeMap<String, Vec<u8>> = BTreeMap::new();

    for (key, value) in entries {
        let mut candidate = current_map.clone();
        candidate.insert(key.clone(), value.clone());
        let encoded = rmp_serde::to_vec(&candidate).unwrap_or_default();

        if encoded.len() > MAX_PACKET_BYTES && !current_map.is_empty() {
            frames.push(Frame {
                partition,
                bytes: std::mem::take(&mut current),
            });
            current_map = BTreeMap::new();
            current_map.insert(key.clone(), value.clone());
            current = rmp_serde::to_vec(&current_map).unwrap_or_default();
        } else {
            current_map = candidate;
            current = encoded;
        }
    }

    if !current_map.is_empty() {
        frames.push(Frame { partition, bytes: current });
    }

    frames
}

/// Build the ordered frame list for one outbound `syncInfos` call. Empty
/// partitions are skipped entirely.
pub fn build_frames(msg: &SyncMsg) -> Vec<Frame> {
    let mut frames = Vec::new();

    if let Some(device_sync) = &msg.device_sync {
        frames.push(Frame {
            partition: "device_sync",
            bytes: device_sync.clone(),
        });
    }
    frames.extend(split_partition("conv_infos", &msg.conv_infos));
    frames.extend(split_partition("conv_requests", &msg.conv_requests));
    frames.extend(split_partition("conv_preferences", &msg.conv_preferences));
    frames.extend(split_partition("message_status", &msg.message_status));

    frames
}

fn partition_tag(partition: &str) -> u8 {
    match partition {
        "device_sync" => 0,
        "conv_infos" => 1,
        "conv_requests" => 2,
        "conv_preferences" => 3,
        "message_status" => 4,
        _ => 255,
    }
}

/// A frame's bytes, as written to the wire: a one-byte partition tag
/// prepended so a receiver can tell which partition an inbound blob belongs
/// to. `Frame::bytes` itself stays untagged so direct `rmp_serde` decoding
/// of one partition's map keeps working.
fn wire_bytes(frame: &Frame) -> Vec<u8> {
    let mut out = Vec::with_capacity(frame.bytes.len() + 1);
    out.push(partition_tag(frame.partition));
    out.extend_from_slice(&frame.bytes);
    out
}

/// Decode one inbound wire frame into a single-partition, self-contained
/// `SyncMsg`. Every other field is left empty — callers merge this into
/// their own state the same way they merge a full snapshot, since both
/// `ContactList::on_sync_data` and `ConversationModule::on_sync_data` upsert
/// rather than replace wholesale. Returns `None` on a malformed or
/// unrecognized frame.
pub fn decode_frame(bytes: &[u8]) -> Option<SyncMsg> {
    let (tag, body) = bytes.split_first()?;
    match *tag {
        0 => Some(SyncMsg {
            device_sync: Some(body.to_vec()),
            ..Default::default()
        }),
        1 => rmp_serde::from_slice::<BTreeMap<String, Vec<u8>>>(body).ok().map(|conv_infos| SyncMsg {
            conv_infos,
            ..Default::default()
        }),
        2 => rmp_serde::from_slice::<BTreeMap<String, Vec<u8>>>(body).ok().map(|conv_requests| SyncMsg {
            conv_requests,
            ..Default::default()
        }),
        3 => rmp_serde::from_slice::<BTreeMap<String, Vec<u8>>>(body)
            .ok()
            .map(|conv_preferences| SyncMsg {
                conv_preferences,
                ..Default::default()
            }),
        4 => rmp_serde::from_slice::<BTreeMap<String, Vec<u8>>>(body).ok().map(|message_status| SyncMsg {
            message_status,
            ..Default::default()
        }),
        _ => None,
    }
}

/// One cached sync connection: the socket plus the peer identity it was
/// opened for.
struct CachedSocket {
    socket: Arc<dyn ChannelSocket>,
    device_id: String,
}

/// Registry of active sync sockets, keyed by peer device id (§4.6).
pub struct SyncModule {
    sockets: Mutex<BTreeMap<String, CachedSocket>>,
}

impl Default for SyncModule {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncModule {
    pub fn new() -> Self {
        Self {
            sockets: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn is_cached(&self, device_id: &str) -> bool {
        self.sockets.lock().contains_key(device_id)
    }

    pub fn cached_device_ids(&self) -> Vec<String> {
        self.sockets.lock().keys().cloned().collect()
    }

    /// `cacheSyncConnection`: register the socket, wire a shutdown hook that
    /// evicts it and a recv hook that decodes inbound frames and dispatches
    /// them to `on_decoded`, and return the initial snapshot's frames for
    /// the caller to write immediately (`syncInfos(socket, nil)`).
    pub fn cache_sync_connection(
        self: &Arc<Self>,
        socket: Arc<dyn ChannelSocket>,
        peer_id: &str,
        device_id: &str,
        initial: &SyncMsg,
        on_decoded: Arc<dyn Fn(SyncMsg) + Send + Sync>,
    ) -> Vec<Frame> {
        let module = Arc::clone(self);
        let evict_device = device_id.to_string();
        socket.on_shutdown(Box::new(move || {
            module.sockets.lock().remove(&evict_device);
        }));

        let recv_device = device_id.to_string();
        socket.on_recv(Box::new(move |bytes: &[u8]| match decode_frame(bytes) {
            Some(msg) => on_decoded(msg),
            None => tracing::warn!(device_id = %recv_device, "dropping unrecognized inbound sync frame"),
        }));

        self.sockets.lock().insert(
            device_id.to_string(),
            CachedSocket {
                socket: Arc::clone(&socket),
                device_id: device_id.to_string(),
            },
        );
        let _ = peer_id;

        build_frames(initial)
    }

    /// Write every frame in order; on the first write error the socket is
    /// shut down and the remaining frames are abandoned.
    pub async fn sync_infos(&self, device_id: &str, msg: &SyncMsg) -> Result<(), ChannelError> {
        let socket = {
            let sockets = self.sockets.lock();
            sockets.get(device_id).map(|entry| Arc::clone(&entry.socket))
        };
        let Some(socket) = socket else {
            return Err(ChannelError::ShutDown);
        };

        for frame in build_frames(msg) {
            if let Err(err) = socket.write(&wire_bytes(&frame)).await {
                socket.shutdown().await;
                return Err(err);
            }
        }
        Ok(())
    }

    pub fn remove(&self, device_id: &str) {
        self.sockets.lock().remove(device_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_partitions_produce_no_frames() {
        let msg = SyncMsg::default();
        assert!(build_frames(&msg).is_empty());
    }

    #[test]
    fn device_sync_is_sent_first() {
        let msg = SyncMsg {
            device_sync: Some(vec![1, 2, 3]),
            conv_infos: BTreeMap::from([("c1".to_string(), vec![9])]),
            ..Default::default()
        };
        let frames = build_frames(&msg);
        assert_eq!(frames[0].partition, "device_sync");
        assert_eq!(frames[1].partition, "conv_infos");
    }

    #[test]
    fn oversized_partition_splits_without_breaking_a_key() {
        let mut conv_infos = BTreeMap::new();
        for i in 0..2000 {
            conv_infos.insert(format!("conv-{i}"), vec![0u8; 64]);
        }
        let msg = SyncMsg {
            conv_infos,
            ..Default::default()
        };
        let frames = build_frames(&msg);
        assert!(frames.len() > 1);
        for frame in &frames {
            assert!(frame.bytes.len() <= MAX_PACKET_BYTES);
        }

        let mut recovered: BTreeMap<String, Vec<u8>> = BTreeMap::new();
        for frame in &frames {
            let decoded: BTreeMap<String, Vec<u8>> = rmp_serde::from_slice(&frame.bytes).unwrap();
            recovered.extend(decoded);
        }
        assert_eq!(recovered.len(), 2000);
    }

    #[tokio::test]
    async fn shutdown_hook_evicts_cached_socket() {
        use crate::services::testing::InMemoryChannelSocket;
        let module = Arc::new(SyncModule::new());
        let socket: Arc<dyn ChannelSocket> = InMemoryChannelSocket::new("dev1");
        module.cache_sync_connection(Arc::clone(&socket), "peer", "dev1", &SyncMsg::default(), Arc::new(|_msg| {}));
        assert!(module.is_cached("dev1"));
        socket.shutdown().await;
        assert!(!module.is_cached("dev1"));
    }

    #[test]
    fn wire_bytes_round_trip_to_decode_frame() {
        let frame = Frame {
            partition: "conv_infos",
            bytes: rmp_serde::to_vec(&BTreeMap::from([("c1".to_string(), vec![9u8])])).unwrap(),
        };
        let decoded = decode_frame(&wire_bytes(&frame)).unwrap();
        assert_eq!(decoded.conv_infos.get("c1"), Some(&vec![9u8]));
        assert!(decoded.conv_requests.is_empty());
    }

    #[tokio::test]
    async fn inbound_frame_is_decoded_and_dispatched() {
        use crate::services::testing::InMemoryChannelSocket;
        use parking_lot::Mutex as SyncMutex;

        let module = Arc::new(SyncModule::new());
        let socket = InMemoryChannelSocket::new("dev1");
        let received: Arc<SyncMutex<Vec<SyncMsg>>> = Arc::new(SyncMutex::new(Vec::new()));
        let sink = Arc::clone(&received);

        let socket_handle: Arc<dyn ChannelSocket> = socket.clone();
        module.cache_sync_connection(socket_handle, "peer", "dev1", &SyncMsg::default(), Arc::new(move |msg| sink.lock().push(msg)));

        let frame = Frame {
            partition: "device_sync",
            bytes: vec![1, 2, 3],
        };
        socket.deliver(&wire_bytes(&frame)).await;

        let got = received.lock();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].device_sync, Some(vec![1, 2, 3]));
    }
}
