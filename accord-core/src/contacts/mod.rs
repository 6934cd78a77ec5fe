//! Contacts, trust requests, and known devices.

use std::collections::BTreeMap;

use rand::Rng;

use crate::config::Paths;
use crate::error::ContactError;
use crate::events::Event;
use crate::identity::cert;

/// `{added_ts, removed_ts, confirmed, banned}`. Derived predicates:
/// `is_active = added > removed`; `is_banned = !is_active && banned`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Contact {
    pub added_ts: i64,
    pub removed_ts: i64,
    pub confirmed: bool,
    pub banned: bool,
}

impl Contact {
    pub fn is_active(&self) -> bool {
        self.added_ts > self.removed_ts
    }

    pub fn is_banned(&self) -> bool {
        !self.is_active() && self.banned
    }

    /// Merge rule used when reconciling across devices: max of each
    /// timestamp, logical-OR `confirmed`, `banned` follows the later
    /// `removed`. Commutative up to this rule and idempotent
    /// (`merge(c, c) == c`).
    pub fn merge(&self, other: &Contact) -> Contact {
        let added_ts = self.added_ts.max(other.added_ts);
        let (removed_ts, banned) = if self.removed_ts >= other.removed_ts {
            (self.removed_ts, self.banned)
        } else {
            (other.removed_ts, other.banned)
        };
        Contact {
            added_ts,
            removed_ts,
            confirmed: self.confirmed || other.confirmed,
            banned,
        }
    }
}

/// `{from_device, received_ts, payload}`, keyed by the sender account id.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct TrustRequest {
    pub from_device: String,
    pub received_ts: i64,
    #[serde(with = "serde_bytes_base64")]
    pub payload: Vec<u8>,
}

/// `{certificate, display_name, last_sync_ts}`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct KnownDevice {
    pub certificate_pem: String,
    pub display_name: Option<String>,
    pub last_sync_ts: i64,
}

/// Snapshot sent to peers for reconciliation: `{date, peers, devices_known,
/// trust_requests}` (the `trust_requests` window is capped at
/// [`SYNC_TRUST_REQUEST_WINDOW`] entries to bound message size).
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct DeviceSync {
    pub date: i64,
    pub peers: BTreeMap<String, Contact>,
    pub devices_known: BTreeMap<String, String>,
    pub trust_requests: BTreeMap<String, TrustRequest>,
}

const SYNC_TRUST_REQUEST_WINDOW: usize = 20;

mod serde_bytes_base64 {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Vec<u8>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        base64::engine::general_purpose::STANDARD
            .decode(&s)
            .map_err(serde::de::Error::custom)
    }
}

/// Persistent contact state with add/remove/ban transitions and sync-data
/// reconciliation. The account certificate is the sole trust anchor that
/// validates device certificates belonging to this account.
pub struct ContactList {
    pub contacts: BTreeMap<String, Contact>,
    pub trust_requests: BTreeMap<String, TrustRequest>,
    pub known_devices: BTreeMap<String, KnownDevice>,
    account_trust_anchor_pem: String,
}

impl ContactList {
    pub fn new(account_trust_anchor_pem: impl Into<String>) -> Self {
        Self {
            contacts: BTreeMap::new(),
            trust_requests: BTreeMap::new(),
            known_devices: BTreeMap::new(),
            account_trust_anchor_pem: account_trust_anchor_pem.into(),
        }
    }

    /// Insert-or-update; sets `added = now`, OR-merges `confirmed`. Emits
    /// `ContactAdded` iff `is_active` or `confirmed` transitioned.
    pub fn add(&mut self, account_id: &str, confirmed: bool, now: i64) -> Option<Event> {
        let before = self.contacts.get(account_id).copied().unwrap_or_default();
        let mut after = before;
        after.added_ts = now;
        after.confirmed = after.confirmed || confirmed;
        self.contacts.insert(account_id.to_string(), after);

        if after.is_active() != before.is_active() || after.confirmed != before.confirmed {
            tracing::debug!(account_id = %account_id, confirmed = after.confirmed, "contact added");
            Some(Event::ContactAdded {
                account_id: account_id.to_string(),
            })
        } else {
            None
        }
    }

    /// Sets `removed = now`, `banned = ban`. If `ban`, drops any pending
    /// trust request from this account. Emits `ContactRemoved` on state
    /// change.
    pub fn remove(&mut self, account_id: &str, ban: bool, now: i64) -> Option<Event> {
        let before = self.contacts.get(account_id).copied().unwrap_or_default();
        let mut after = before;
        after.removed_ts = now;
        after.banned = ban;
        self.contacts.insert(account_id.to_string(), after);

        if ban {
            self.trust_requests.remove(account_id);
        }

        if after.is_active() != before.is_active()
            || after.is_banned() != before.is_banned()
            || after.confirmed != before.confirmed
        {
            tracing::debug!(account_id = %account_id, banned = ban, "contact removed");
            Some(Event::ContactRemoved {
                account_id: account_id.to_string(),
            })
        } else {
            None
        }
    }

    /// Merge an incoming contact record per [`Contact::merge`]; emits the
    /// appropriate event iff observable state changed.
    pub fn update(&mut self, account_id: &str, incoming: Contact) -> Option<Event> {
        let before = self.contacts.get(account_id).copied().unwrap_or_default();
        let after = before.merge(&incoming);
        self.contacts.insert(account_id.to_string(), after);

        if after.is_active() != before.is_active() || after.confirmed != before.confirmed {
            Some(Event::ContactAdded {
                account_id: account_id.to_string(),
            })
        } else if after.is_banned() != before.is_banned() {
            Some(Event::ContactRemoved {
                account_id: account_id.to_string(),
            })
        } else {
            None
        }
    }

    /// Only succeeds if `cert_id` is not an existing contact; contact status
    /// otherwise dominates.
    pub fn set_certificate_status(&self, cert_id: &str) -> Result<(), ContactError> {
        if self.contacts.contains_key(cert_id) {
            Err(ContactError::ContactExists(cert_id.to_string()))
        } else {
            Ok(())
        }
    }

    /// Outcome of [`ContactList::on_trust_request`]: the events it produced
    /// plus whether a confirmation reply should be sent back to the sender.
    pub fn on_trust_request(
        &mut self,
        from: &str,
        from_device: &str,
        received_ts: i64,
        confirm: bool,
        payload: Vec<u8>,
    ) -> OnTrustRequestOutcome {
        if let Some(contact) = self.contacts.get(from) {
            if contact.is_banned() {
                return OnTrustRequestOutcome::default();
            }
            if contact.is_active() {
                let mut outcome = OnTrustRequestOutcome {
                    send_confirmation: !confirm,
                    ..Default::default()
                };
                if !contact.confirmed {
                    if let Some(event) = self.add(from, true, received_ts) {
                        outcome.events.push(event);
                    }
                }
                return outcome;
            }
        }

        let replace = self
            .trust_requests
            .get(from)
            .map(|existing| received_ts > existing.received_ts)
            .unwrap_or(true);
        if replace {
            self.trust_requests.insert(
                from.to_string(),
                TrustRequest {
                    from_device: from_device.to_string(),
                    received_ts,
                    payload,
                },
            );
        }
        tracing::debug!(from = %from, from_device = %from_device, "trust request recorded");
        OnTrustRequestOutcome {
            events: vec![Event::TrustRequestIncoming {
                from: from.to_string(),
                from_device: from_device.to_string(),
            }],
            send_confirmation: false,
        }
    }

    /// `add(from, confirmed=true)`, erase the request, and signal that a
    /// confirmation should be sent. Returns `None` if no such request
    /// existed.
    pub fn accept_trust_request(&mut self, from: &str, now: i64) -> Option<OnTrustRequestOutcome> {
        if self.trust_requests.remove(from).is_none() {
            return None;
        }
        tracing::info!(from = %from, "trust request accepted");
        let mut outcome = OnTrustRequestOutcome {
            send_confirmation: true,
            ..Default::default()
        };
        if let Some(event) = self.add(from, true, now) {
            outcome.events.push(event);
        }
        Some(outcome)
    }

    /// Returns whether anything was removed.
    pub fn discard_trust_request(&mut self, from: &str) -> bool {
        self.trust_requests.remove(from).is_some()
    }

    /// Verify `certificate_pem` against the account trust anchor; on failure
    /// return `false` without mutating state. On success, insert or update
    /// `known_devices`, emitting `KnownDevicesChanged` if the display name
    /// changed.
    pub fn found_account_device(
        &mut self,
        device_id: &str,
        certificate_pem: &str,
        name: Option<&str>,
        last_sync: i64,
    ) -> Result<bool, ContactError> {
        let parsed = match cert::parse_pem(certificate_pem) {
            Ok(p) => p,
            Err(_) => return Ok(false),
        };
        if parsed.issuer_cn.is_empty() {
            return Ok(false);
        }
        let anchor = cert::parse_pem(&self.account_trust_anchor_pem).map_err(|_| {
            ContactError::ContactExists("trust anchor is unparsable".to_string())
        })?;
        if parsed.issuer_cn != anchor.subject_cn {
            return Ok(false);
        }

        let mut changed = false;
        match self.known_devices.get_mut(device_id) {
            Some(existing) => {
                if let Some(name) = name {
                    if !name.is_empty() && existing.display_name.as_deref() != Some(name) {
                        existing.display_name = Some(name.to_string());
                        changed = true;
                    }
                }
                existing.last_sync_ts = existing.last_sync_ts.max(last_sync);
            }
            None => {
                self.known_devices.insert(
                    device_id.to_string(),
                    KnownDevice {
                        certificate_pem: certificate_pem.to_string(),
                        display_name: name.map(str::to_string),
                        last_sync_ts: last_sync,
                    },
                );
                tracing::debug!(device_id = %device_id, "new account device discovered");
                changed = true;
            }
        }
        Ok(changed)
    }

    pub fn remove_account_device(&mut self, device_id: &str) -> bool {
        self.known_devices.remove(device_id).is_some()
    }

    /// Snapshot `{date, peers, devices_known, trust_requests (windowed)}`.
    /// When there are more than [`SYNC_TRUST_REQUEST_WINDOW`] requests, pick
    /// a window starting at a pseudo-random key and wrap around, so message
    /// size stays bounded while eventually covering all entries across
    /// successive syncs.
    pub fn get_sync_data(&self, now: i64) -> DeviceSync {
        let devices_known = self
            .known_devices
            .iter()
            .map(|(id, d)| (id.clone(), d.display_name.clone().unwrap_or_default()))
            .collect();

        let trust_requests = if self.trust_requests.len() <= SYNC_TRUST_REQUEST_WINDOW {
            self.trust_requests.clone()
        } else {
            let keys: Vec<&String> = self.trust_requests.keys().collect();
            let start = rand::thread_rng().gen_range(0..keys.len());
            (0..SYNC_TRUST_REQUEST_WINDOW)
                .map(|i| {
                    let key = keys[(start + i) % keys.len()];
                    (key.clone(), self.trust_requests[key].clone())
                })
                .collect()
        };

        DeviceSync {
            date: now,
            peers: self.contacts.clone(),
            devices_known,
            trust_requests,
        }
    }

    /// Apply an incoming sync snapshot. Dropped (with no effect) if `from`
    /// is not a known device, or if `sync.date <= last_sync` for that
    /// device (monotonic per sender). Trust requests merge with
    /// `confirm = false` and an empty payload — sync never carries the
    /// original request bytes, which live only at the origin device.
    pub fn on_sync_data(
        &mut self,
        sync: &DeviceSync,
        from_device: &str,
        resolve_cert: impl Fn(&str) -> Option<(String, Option<String>)>,
    ) -> Vec<Event> {
        let mut events = Vec::new();

        let Some(known) = self.known_devices.get(from_device) else {
            return events;
        };
        if sync.date <= known.last_sync_ts {
            return events;
        }
        tracing::debug!(from_device = %from_device, date = sync.date, "applying contact sync snapshot");

        for (device_id, name) in &sync.devices_known {
            if let Some((certificate_pem, resolved_name)) = resolve_cert(device_id) {
                let name = resolved_name.or_else(|| {
                    if name.is_empty() {
                        None
                    } else {
                        Some(name.clone())
                    }
                });
                if let Ok(true) =
                    self.found_account_device(device_id, &certificate_pem, name.as_deref(), sync.date)
                {
                    events.push(Event::KnownDevicesChanged);
                }
            }
        }

        for (account_id, contact) in &sync.peers {
            if let Some(event) = self.update(account_id, *contact) {
                events.push(event);
            }
        }

        for (account_id, request) in &sync.trust_requests {
            let outcome =
                self.on_trust_request(account_id, &request.from_device, request.received_ts, false, Vec::new());
            events.extend(outcome.events);
        }

        if let Some(known) = self.known_devices.get_mut(from_device) {
            known.last_sync_ts = sync.date;
        }

        events
    }

    /// Persist `contacts`, `incomingTrustRequests`, and `knownDevicesNames`
    /// as msgpack maps via write-to-temp-then-rename.
    pub fn persist(&self, paths: &Paths) -> std::io::Result<()> {
        let contacts_bytes = rmp_serde::to_vec(&self.contacts)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        crate::config::write_atomic(&paths.contacts(), &contacts_bytes)?;

        let trust_requests_bytes = rmp_serde::to_vec(&self.trust_requests)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        crate::config::write_atomic(&paths.incoming_trust_requests(), &trust_requests_bytes)?;

        let known_devices_bytes = rmp_serde::to_vec(&self.known_devices)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        crate::config::write_atomic(&paths.known_devices_names(), &known_devices_bytes)?;

        Ok(())
    }
}

/// Events and side-effect signals produced by trust-request handling.
#[derive(Debug, Default)]
pub struct OnTrustRequestOutcome {
    pub events: Vec<Event>,
    pub send_confirmation: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contact_active_and_banned_predicates() {
        let c = Contact {
            added_ts: 10,
            removed_ts: 20,
            confirmed: false,
            banned: true,
        };
        assert!(!c.is_active());
        assert!(c.is_banned());

        let c2 = Contact {
            added_ts: 30,
            removed_ts: 20,
            confirmed: false,
            banned: true,
        };
        assert!(c2.is_active());
        assert!(!c2.is_banned());
    }

    #[test]
    fn merge_is_idempotent_and_commutative() {
        let a = Contact {
            added_ts: 10,
            removed_ts: 5,
            confirmed: true,
            banned: false,
        };
        let b = Contact {
            added_ts: 8,
            removed_ts: 15,
            confirmed: false,
            banned: true,
        };
        assert_eq!(a.merge(&a), a);
        assert_eq!(a.merge(&b), b.merge(&a));
    }

    #[test]
    fn scenario_add_ban_readd() {
        let mut list = ContactList::new("");
        list.add("B", false, 1);
        list.add("B", true, 2);
        list.remove("B", true, 3);
        let c = list.contacts["B"];
        assert!(c.is_banned());

        list.remove("B", false, 4);
        list.add("B", false, 5);
        let c = list.contacts["B"];
        assert!(c.is_active());
        assert!(!c.is_banned());
        assert!(c.banned);
    }

    #[test]
    fn sync_is_monotonic_per_device() {
        let mut list = ContactList::new("");
        list.known_devices.insert(
            "D2".to_string(),
            KnownDevice {
                certificate_pem: String::new(),
                display_name: None,
                last_sync_ts: 100,
            },
        );

        let stale = DeviceSync {
            date: 90,
            ..Default::default()
        };
        assert!(list.on_sync_data(&stale, "D2", |_| None).is_empty());
        assert_eq!(list.known_devices["D2"].last_sync_ts, 100);

        let fresh = DeviceSync {
            date: 110,
            ..Default::default()
        };
        list.on_sync_data(&fresh, "D2", |_| None);
        assert_eq!(list.known_devices["D2"].last_sync_ts, 110);
    }

    #[test]
    fn trust_request_from_active_contact_requests_confirmation() {
        let mut list = ContactList::new("");
        list.add("A", false, 1);
        let outcome = list.on_trust_request("A", "devA", 2, false, vec![1, 2, 3]);
        assert!(outcome.send_confirmation);
        assert!(list.contacts["A"].confirmed);
    }

    #[test]
    fn banned_sender_is_discarded_silently() {
        let mut list = ContactList::new("");
        list.add("A", false, 1);
        list.remove("A", true, 2);
        let outcome = list.on_trust_request("A", "devA", 3, false, vec![]);
        assert!(outcome.events.is_empty());
        assert!(!outcome.send_confirmation);
    }

    #[test]
    fn accept_trust_request_requires_existing_request() {
        let mut list = ContactList::new("");
        assert!(list.accept_trust_request("unknown", 1).is_none());

        list.on_trust_request("A", "devA", 1, false, vec![]);
        let outcome = list.accept_trust_request("A", 2).unwrap();
        assert!(outcome.send_confirmation);
        assert!(list.contacts["A"].is_active());
    }
}
