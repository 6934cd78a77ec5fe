//! Account authentication: create, import, link-device, revoke, and the
//! announce/sync step that follows a successful authentication.

pub mod credentials;
pub mod device_link;

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use crate::archive::AccountArchive;
use crate::config::AccountConfig;
use crate::contacts::ContactList;
use crate::error::{AddDeviceError, AuthError};
use crate::events::{DoneResult, Event, LinkState, OnChange, OnFailure, OnSuccess};
use crate::identity::{cert, CertificateChain, Identity, IdentityManager, RevocationStore};
use crate::services::{ChannelService, ChannelSocket, DhtService};

use credentials::Credentials;
use device_link::{LinkEffect, LinkEvent, LinkMessage, NewDeviceLink, SourceDeviceLink};

const DHT_KEY_RENEWAL_SECS: i64 = 20 * 60;
const DEFAULT_CERT_VALIDITY_SECS: i64 = 3600 * 24 * 365;

/// The live state produced by a successful authentication: identity, trust
/// graph, and configuration for one account.
pub struct AccountInfo {
    pub account_id: String,
    pub device_id: Option<String>,
    pub identity: Identity,
    pub contacts: ContactList,
    pub config: AccountConfig,
}

/// Outcome of resolving a legacy DHT archive import.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportError {
    NotFound,
    Network,
}

/// `{key, location}` for a legacy DHT archive lookup at one epoch.
pub struct ComputeKeysResult {
    pub key: [u8; 32],
    pub location: String,
}

/// `computeKeys(password, pin, previous_epoch)`: `location = digest(key)`,
/// `key = stretch(password, salt = pin || hex(epoch))`. Uses a SHA-256
/// digest in place of the original implementation's SHA-1 for the location
/// hash (noted in the grounding ledger; no behavior here depends on the
/// specific digest beyond uniqueness and fixed width).
pub fn compute_keys(password: &str, pin: &str, previous_epoch: bool, now_epoch_secs: i64) -> ComputeKeysResult {
    let epoch = now_epoch_secs / DHT_KEY_RENEWAL_SECS - if previous_epoch { 1 } else { 0 };
    let salt = format!("{pin}{epoch:x}");
    let params = scrypt::Params::new(15, 8, 1, 32).expect("static scrypt params are valid");
    let mut key = [0u8; 32];
    scrypt::scrypt(password.as_bytes(), salt.as_bytes(), &params, &mut key)
        .expect("scrypt output length matches key buffer");
    let location = Sha256::digest(key).iter().map(|b| format!("{b:02x}")).collect();
    ComputeKeysResult { key, location }
}

/// Generate the 20-byte secp256k1-derived address seed stored as
/// `AccountArchive::eth_key`.
fn generate_eth_seed() -> (k256::ecdsa::SigningKey, [u8; 20]) {
    use k256::elliptic_curve::sec1::ToEncodedPoint;

    let signing_key = k256::ecdsa::SigningKey::random(&mut rand::thread_rng());
    let verifying_key = signing_key.verifying_key();
    let encoded = verifying_key.to_encoded_point(false);
    let hash = Sha256::digest(&encoded.as_bytes()[1..]);
    let mut seed = [0u8; 20];
    seed.copy_from_slice(&hash[12..32]);
    (signing_key, seed)
}

fn base64_encode(bytes: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

/// Tagged-variant `AccountManager`: the archive-on-DHT-or-disk flow, or a
/// trusted HTTP provisioning-server flow. Both implement the same
/// authentication surface; branching lives here rather than behind a trait
/// object per spec's "polymorphic AccountManager" design note.
pub enum AccountManager {
    Archive(ArchiveAccountManager),
    Server(ServerAccountManager),
}

impl AccountManager {
    /// `initAuthentication`: dispatch to the create/import/link flow implied
    /// by `credentials`, reporting terminal success/failure via callbacks.
    pub async fn init_authentication(
        &self,
        device_name: &str,
        credentials: Credentials,
        on_success: OnSuccess,
        on_failure: OnFailure,
        on_change: OnChange,
    ) {
        match self {
            AccountManager::Archive(mgr) => mgr.init_authentication(device_name, credentials, on_success, on_failure, on_change).await,
            AccountManager::Server(mgr) => mgr.init_authentication(device_name, credentials, on_success, on_failure, on_change).await,
        }
    }
}

/// Self-hosted archive manager (on disk, or fetched from the DHT).
///
/// Owns the live `AccountInfo` registry this process has authenticated and
/// the revocation lists applied against it, plus the transport used to
/// drive the link-device protocol for `Credentials::P2p`.
pub struct ArchiveAccountManager {
    pub links: Arc<LinkSessions>,
    accounts: Arc<Mutex<BTreeMap<String, Arc<Mutex<AccountInfo>>>>>,
    revocations: Arc<Mutex<RevocationStore>>,
    channels: Arc<dyn ChannelService>,
}

impl ArchiveAccountManager {
    pub fn new(channels: Arc<dyn ChannelService>) -> Self {
        Self {
            links: Arc::new(LinkSessions::new()),
            accounts: Arc::new(Mutex::new(BTreeMap::new())),
            revocations: Arc::new(Mutex::new(RevocationStore::new())),
            channels,
        }
    }

    /// The live state for an account this process has authenticated, if
    /// any.
    pub fn account_info(&self, account_id: &str) -> Option<Arc<Mutex<AccountInfo>>> {
        self.accounts.lock().get(account_id).cloned()
    }

    async fn init_authentication(
        &self,
        device_name: &str,
        credentials: Credentials,
        on_success: OnSuccess,
        on_failure: OnFailure,
        on_change: OnChange,
    ) {
        match credentials {
            Credentials::Password {
                password,
                existing_identity,
            } => match create_account(device_name, &password, existing_identity) {
                Ok((_account_id, archive, device_key_pem)) => {
                    let Some(chain) = archive.identity.clone() else {
                        on_failure(AuthError::Unknown);
                        return;
                    };
                    let identity = Identity {
                        chain,
                        device_key_pem: device_key_pem.unwrap_or_default(),
                    };
                    finish_archive_loaded(&self.accounts, &self.revocations, identity, &archive, &on_success, &on_failure);
                }
                Err(err) => {
                    tracing::warn!(error = %err, "account creation failed");
                    on_failure(AuthError::Unknown);
                }
            },
            Credentials::File { path, password } => {
                tracing::info!(path = %path, "importing archive from file");
                let bytes = match tokio::fs::read(&path).await {
                    Ok(bytes) => bytes,
                    Err(err) => {
                        tracing::warn!(path = %path, error = %err, "failed to read archive file");
                        on_failure(AuthError::InvalidArguments);
                        return;
                    }
                };
                let device_keypair = match cert::generate_keypair() {
                    Ok(kp) => kp,
                    Err(err) => {
                        tracing::warn!(error = %err, "failed to generate device keypair for import");
                        on_failure(AuthError::Unknown);
                        return;
                    }
                };
                let now = time::OffsetDateTime::now_utc().unix_timestamp();
                match import_from_file(&bytes, password.as_deref(), &device_keypair.rcgen, now) {
                    Ok(archive) => {
                        let Some(chain) = archive.identity.clone() else {
                            on_failure(AuthError::Unknown);
                            return;
                        };
                        let identity = Identity {
                            chain,
                            device_key_pem: device_keypair.pkcs8_pem,
                        };
                        finish_archive_loaded(&self.accounts, &self.revocations, identity, &archive, &on_success, &on_failure);
                    }
                    Err(err) => {
                        tracing::warn!(path = %path, error = %err, "archive import failed");
                        on_failure(AuthError::AuthError);
                    }
                }
            }
            Credentials::P2p { token } => {
                self.start_new_device_link(device_name, &token, on_success, on_failure, on_change).await;
            }
            Credentials::Server { .. } => on_failure(AuthError::InvalidArguments),
        }
    }

    /// New-device (importer) side of `Credentials::P2p`: dial the source
    /// device named by `token` over the link-device sub-protocol, drive
    /// [`NewDeviceLink`] off inbound frames, and materialize the archive it
    /// hands over once the handshake completes.
    ///
    /// A `"none"` auth scheme needs no credential and is answered
    /// automatically. A `"password"` scheme still requires a
    /// `provideAccountAuthentication`-style hook for the embedder to supply
    /// the user's password once `on_change` reports `Authenticating`; no
    /// such hook is wired up on this manager yet.
    async fn start_new_device_link(&self, device_name: &str, token: &str, on_success: OnSuccess, on_failure: OnFailure, on_change: OnChange) {
        let peer = token.strip_prefix("jami-auth://").unwrap_or(token).to_string();
        if peer.is_empty() {
            on_failure(AuthError::InvalidArguments);
            return;
        }

        if let Err(err) = self.links.start_new_device(&peer) {
            tracing::warn!(peer = %peer, error = %err, "device link already in progress for this peer");
            on_failure(AuthError::Unknown);
            return;
        }

        let socket: Arc<dyn ChannelSocket> = match self.channels.open(&peer, "account:link").await {
            Ok(socket) => Arc::from(socket),
            Err(err) => {
                tracing::warn!(peer = %peer, error = %err, "failed to open link-device channel");
                self.links.step(&peer, LinkEvent::ShutDown);
                on_failure(AuthError::Network);
                return;
            }
        };

        let on_change = Arc::new(on_change);
        let on_success = Arc::new(on_success);
        let on_failure = Arc::new(on_failure);

        apply_new_device_effects(
            self.links.step(&peer, LinkEvent::Connected { peer: peer.clone() }),
            &socket,
            &on_change,
        )
        .await;

        let recv_links = Arc::clone(&self.links);
        let recv_peer = peer.clone();
        let recv_socket = Arc::clone(&socket);
        let recv_on_change = Arc::clone(&on_change);
        let recv_on_success = Arc::clone(&on_success);
        let recv_on_failure = Arc::clone(&on_failure);
        let recv_device_name = device_name.to_string();
        let recv_accounts = Arc::clone(&self.accounts);
        let recv_revocations = Arc::clone(&self.revocations);

        socket.on_recv(Box::new(move |bytes: &[u8]| {
            let Ok(msg) = rmp_serde::from_slice::<LinkMessage>(bytes) else {
                tracing::warn!(peer = %recv_peer, "dropping unparsable link-device message");
                return;
            };
            let acc_data = msg.payload.get("accData").cloned();
            let auto_scheme = msg.payload.get("authScheme").filter(|s| s.as_str() == "none").is_some();
            let mut effects = recv_links.step(&recv_peer, LinkEvent::Message(msg));
            if auto_scheme {
                // "none" needs no credential from the user; provide an empty
                // one immediately instead of waiting on confirmAddDevice.
                effects.extend(recv_links.step(&recv_peer, LinkEvent::UserProvidedPassword(String::new())));
            }

            let socket = Arc::clone(&recv_socket);
            let on_change = Arc::clone(&recv_on_change);
            let on_success = Arc::clone(&recv_on_success);
            let on_failure = Arc::clone(&recv_on_failure);
            let device_name = recv_device_name.clone();
            let accounts = Arc::clone(&recv_accounts);
            let revocations = Arc::clone(&recv_revocations);
            let peer = recv_peer.clone();

            tokio::spawn(async move {
                let done = apply_new_device_effects(effects, &socket, &on_change).await;
                let Some(result) = done else {
                    return;
                };
                if result != DoneResult::Success {
                    tracing::warn!(peer = %peer, result = ?result, "device link ended without success");
                    on_failure(map_done_result(result));
                    return;
                }
                let Some(acc_data) = acc_data else {
                    tracing::warn!(peer = %peer, "link completed without an archive payload");
                    on_failure(AuthError::Unknown);
                    return;
                };
                let now = time::OffsetDateTime::now_utc().unix_timestamp();
                match materialize_from_payload(&device_name, &acc_data, now) {
                    Ok((identity, archive)) => {
                        finish_archive_loaded(&accounts, &revocations, identity, &archive, &on_success, &on_failure);
                    }
                    Err(err) => {
                        tracing::warn!(peer = %peer, error = %err, "failed to materialize linked archive");
                        on_failure(AuthError::Unknown);
                    }
                }
            });
        }));

        let timeout_links = Arc::clone(&self.links);
        let timeout_peer = peer.clone();
        let timeout_socket = Arc::clone(&socket);
        let timeout_on_failure = Arc::clone(&on_failure);
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_secs(device_link::OP_TIMEOUT_SECS)).await;
            if timeout_links.is_active(&timeout_peer) {
                timeout_links.step(&timeout_peer, LinkEvent::TimedOut);
                timeout_links.step(&timeout_peer, LinkEvent::ShutDown);
                timeout_socket.shutdown().await;
                tracing::warn!(peer = %timeout_peer, "device link timed out");
                timeout_on_failure(AuthError::Timeout);
            }
        });
    }
}

/// Common tail of every successful archive load: reject a revoked device,
/// otherwise build and register the live `AccountInfo` and report success.
fn finish_archive_loaded(
    accounts: &Arc<Mutex<BTreeMap<String, Arc<Mutex<AccountInfo>>>>>,
    revocations: &Arc<Mutex<RevocationStore>>,
    identity: Identity,
    archive: &AccountArchive,
    on_success: &OnSuccess,
    on_failure: &OnFailure,
) {
    let account_id = match identity.account_id() {
        Ok(id) => id,
        Err(err) => {
            tracing::warn!(error = %err, "loaded archive has an unparsable account certificate");
            on_failure(AuthError::Unknown);
            return;
        }
    };
    let device_id = match identity.device_id() {
        Ok(id) => id,
        Err(err) => {
            tracing::warn!(error = %err, "loaded archive has an unparsable device certificate");
            on_failure(AuthError::Unknown);
            return;
        }
    };

    if let Some(list) = &archive.revocation_list {
        revocations.lock().install(&account_id, list);
    }
    if let Some(device_id) = &device_id {
        if revocations.lock().is_revoked(&account_id, device_id) {
            tracing::warn!(account_id = %account_id, device_id = %device_id, "refusing to authenticate a revoked device");
            on_failure(AuthError::AuthError);
            return;
        }
    }

    let info = build_account_info(&account_id, device_id, identity, archive);
    accounts.lock().insert(account_id.clone(), Arc::new(Mutex::new(info)));
    tracing::info!(account_id = %account_id, "account authenticated");
    on_success(account_id);
}

/// Apply a batch of [`LinkEffect`]s: write `Send` payloads to the socket,
/// forward `EmitState` to `on_change`, shut the socket down on `Shutdown`,
/// and report the terminal result if an `EmitDone` effect was observed.
async fn apply_new_device_effects(
    effects: Vec<LinkEffect>,
    socket: &Arc<dyn ChannelSocket>,
    on_change: &Arc<OnChange>,
) -> Option<DoneResult> {
    let mut done = None;
    for effect in effects {
        match effect {
            LinkEffect::Send(msg) => match rmp_serde::to_vec(&msg) {
                Ok(bytes) => {
                    if socket.write(&bytes).await.is_err() {
                        tracing::warn!("failed writing link-device message");
                    }
                }
                Err(err) => tracing::warn!(error = %err, "failed to encode link-device message"),
            },
            LinkEffect::EmitState(state) => on_change(state),
            LinkEffect::EmitDone(result) => done = Some(result),
            LinkEffect::Shutdown => socket.shutdown().await,
        }
    }
    done
}

fn map_done_result(result: DoneResult) -> AuthError {
    match result {
        DoneResult::Success => AuthError::Unknown,
        DoneResult::Network => AuthError::Network,
        DoneResult::Timeout => AuthError::Timeout,
        DoneResult::AuthError => AuthError::AuthError,
        DoneResult::Canceled => AuthError::Unknown,
        DoneResult::Unknown => AuthError::Unknown,
    }
}

/// Decode the `accData` payload a source device hands over on a successful
/// link (base64 of a cleartext archive, per the link channel already being
/// authenticated) and issue this device its own certificate under it, the
/// same way [`import_from_file`] does for an on-disk archive.
fn materialize_from_payload(device_name: &str, payload_b64: &str, now_epoch: i64) -> Result<(Identity, AccountArchive), crate::error::AccordError> {
    let _ = device_name;
    use base64::Engine;
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(payload_b64)
        .map_err(|_| crate::error::IdentityError::FileMissing("accData".to_string()))?;
    let device_keypair = cert::generate_keypair()?;
    let archive = import_from_file(&bytes, None, &device_keypair.rcgen, now_epoch)?;
    let chain = archive
        .identity
        .clone()
        .ok_or_else(|| crate::error::IdentityError::FileMissing("identity".to_string()))?;
    Ok((
        Identity {
            chain,
            device_key_pem: device_keypair.pkcs8_pem,
        },
        archive,
    ))
}

/// HTTP-provisioning-server manager: a trusted server signs the device
/// certificate rather than the account's own CA key signing it locally.
pub struct ServerAccountManager {
    pub manager_uri: String,
}

impl ServerAccountManager {
    async fn init_authentication(
        &self,
        _device_name: &str,
        credentials: Credentials,
        _on_success: OnSuccess,
        on_failure: OnFailure,
        _on_change: OnChange,
    ) {
        match credentials {
            Credentials::Server { username, .. } => {
                tracing::info!(manager = %self.manager_uri, user = %username, "server-provisioned authentication not wired to a transport in this build");
                on_failure(AuthError::ServerError);
            }
            _ => on_failure(AuthError::InvalidArguments),
        }
    }
}

/// `createAccount` (§4.4.1): a new CA, a 4096-bit account identity issued
/// under it, and a fresh eth-address seed, assembled into an archive.
///
/// When `existing_identity` is supplied (a migration re-signing an
/// already-loaded chain), the caller's private CA key isn't available here
/// to sign a new device certificate, so the returned device key is `None`
/// and `existing_identity.device_pem` is left as given.
pub fn create_account(
    device_name: &str,
    password: &str,
    existing_identity: Option<CertificateChain>,
) -> Result<(String, AccountArchive, Option<String>), crate::error::AccordError> {
    let (ca_keypair, ca_pem) = cert::generate_ca("accord-ca", DEFAULT_CERT_VALIDITY_SECS)?;
    let account_keypair = cert::generate_keypair()?;
    let account_pem = cert::issue_under(
        "accord-account",
        &ca_pem,
        &ca_keypair.pkcs8_pem,
        &account_keypair.rcgen,
        true,
        DEFAULT_CERT_VALIDITY_SECS,
    )?;

    let (chain, device_key_pem) = match existing_identity {
        Some(chain) => {
            tracing::warn!("createAccount re-signing an externally supplied identity; no device certificate issued");
            (chain, None)
        }
        None => {
            let device_keypair = cert::generate_keypair()?;
            let device_pem = cert::issue_under(
                "accord-device",
                &account_pem,
                &ca_keypair.pkcs8_pem,
                &device_keypair.rcgen,
                false,
                DEFAULT_CERT_VALIDITY_SECS,
            )?;
            let chain = CertificateChain {
                ca_pem: ca_pem.clone(),
                account_pem: account_pem.clone(),
                device_pem: Some(device_pem),
            };
            (chain, Some(device_keypair.pkcs8_pem))
        }
    };
    let account_id = cert::parse_pem(&chain.account_pem)?.public_key_id;

    let (_eth_signing_key, eth_seed) = generate_eth_seed();

    let mut archive = AccountArchive {
        identity: Some(chain),
        ca_key: Some(ca_keypair.pkcs8_pem),
        eth_key: Some(base64_encode(&eth_seed)),
        ..Default::default()
    };
    archive.config_kv.insert("deviceName".to_string(), device_name.to_string());
    archive.config_kv.insert("archiveHasPassword".to_string(), (!password.is_empty()).to_string());

    tracing::info!(account_id = %account_id, "account created");
    Ok((account_id, archive, device_key_pem))
}

/// Assemble the live [`AccountInfo`] for a freshly created or loaded
/// archive: wraps the archive's contact map and config into their live
/// types alongside the loaded identity.
pub fn build_account_info(account_id: &str, device_id: Option<String>, identity: Identity, archive: &AccountArchive) -> AccountInfo {
    let mut contacts = ContactList::new(identity.chain.account_pem.clone());
    contacts.contacts = archive.contacts_map.clone();
    let config = AccountConfig::from_map(archive.config_kv.clone());
    AccountInfo {
        account_id: account_id.to_string(),
        device_id,
        identity,
        contacts,
        config,
    }
}

/// `importFromFile` (§4.4.2): open with the provided password, migrate if
/// needed, then issue a fresh device certificate signed by the device key.
pub fn import_from_file(
    bytes: &[u8],
    password: Option<&str>,
    device_keypair: &rcgen::KeyPair,
    now_epoch: i64,
) -> Result<AccountArchive, crate::error::AccordError> {
    let mut archive = crate::archive::codec::read_archive(bytes, password, None)?;
    let Some(chain) = archive.identity.as_mut() else {
        return Err(crate::error::IdentityError::FileMissing("identity".to_string()).into());
    };

    if IdentityManager::needs_migration(chain, now_epoch)? {
        let mut ca_key = archive.ca_key.clone().unwrap_or_default();
        IdentityManager::renew_certificates(&mut ca_key, chain, Some(device_keypair), DEFAULT_CERT_VALIDITY_SECS, now_epoch)?;
        archive.ca_key = Some(ca_key);
    } else {
        let ca_key = archive.ca_key.clone().unwrap_or_default();
        chain.device_pem = Some(cert::issue_under(
            "accord-device",
            &chain.account_pem,
            &ca_key,
            device_keypair,
            false,
            DEFAULT_CERT_VALIDITY_SECS,
        )?);
    }

    Ok(archive)
}

/// `revokeDevice` (§4.4.5). `pin_revocation_list` is applied to the local
/// store *before* the DHT put (supplemented from `archive_account_manager.cpp`)
/// so the current process treats the device as revoked immediately rather
/// than only after the publish round-trips.
pub async fn revoke_device(
    dht: &dyn DhtService,
    account_id: &str,
    device_id: &str,
    archive: &mut AccountArchive,
    contacts: &mut ContactList,
    pin_revocation_list: impl FnOnce(&str),
) -> Result<(), crate::error::AccordError> {
    let mut list: Vec<String> = archive
        .revocation_list
        .as_deref()
        .map(|s| s.split(',').filter(|x| !x.is_empty()).map(str::to_string).collect())
        .unwrap_or_default();
    if !list.contains(&device_id.to_string()) {
        list.push(device_id.to_string());
    }
    let joined = list.join(",");
    archive.revocation_list = Some(joined.clone());

    pin_revocation_list(&joined);

    dht.put(account_id, joined.into_bytes(), false).await;

    contacts.remove_account_device(device_id);
    Ok(())
}

/// `announce` (§4.4.6): publish the device announcement at the DHT key
/// equal to the account id.
pub async fn announce(dht: &dyn DhtService, account_id: &str, announcement_b64: &str) {
    dht.put(account_id, announcement_b64.as_bytes().to_vec(), false).await;
}

/// Concurrently resolve a legacy DHT archive import at the current and
/// previous epoch; whichever resolves first under its key wins.
pub async fn import_from_dht(
    dht: &dyn DhtService,
    password: &str,
    pin: &str,
    now_epoch: i64,
) -> Result<AccountArchive, ImportError> {
    let current = compute_keys(password, pin, false, now_epoch);
    let previous = compute_keys(password, pin, true, now_epoch);

    let (current_values, previous_values) =
        tokio::join!(dht.get(&current.location), dht.get(&previous.location));

    for (values, keys) in [(current_values, &current), (previous_values, &previous)] {
        for blob in values {
            if let Ok(archive) = crate::archive::codec::read_archive(&blob, None, Some(&keys.key)) {
                return Ok(archive);
            }
        }
    }
    Err(ImportError::NotFound)
}

/// One side's live link-device session.
enum LinkSide {
    New(NewDeviceLink),
    Source(SourceDeviceLink),
}

/// Enforces "only one authentication context per account at a time";
/// concurrent attempts observe `AlreadyLinking`.
#[derive(Default)]
pub struct LinkSessions {
    sessions: Mutex<BTreeMap<String, LinkSide>>,
}

impl LinkSessions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_new_device(&self, account_id: &str) -> Result<(), AddDeviceError> {
        let mut sessions = self.sessions.lock();
        if sessions.contains_key(account_id) {
            return Err(AddDeviceError::AlreadyLinking);
        }
        sessions.insert(account_id.to_string(), LinkSide::New(NewDeviceLink::new()));
        Ok(())
    }

    pub fn start_source_device(&self, account_id: &str) -> Result<(), AddDeviceError> {
        let mut sessions = self.sessions.lock();
        if sessions.contains_key(account_id) {
            return Err(AddDeviceError::AlreadyLinking);
        }
        sessions.insert(account_id.to_string(), LinkSide::Source(SourceDeviceLink::new()));
        Ok(())
    }

    /// Drive an event through the live session for `account_id`, clearing
    /// the session unconditionally once its effects include a `Done` event
    /// (cleared from all maps regardless of outcome, per spec).
    pub fn step(&self, account_id: &str, event: LinkEvent) -> Vec<LinkEffect> {
        let mut sessions = self.sessions.lock();
        let Some(side) = sessions.get_mut(account_id) else {
            return Vec::new();
        };
        let effects = match side {
            LinkSide::New(link) => link.step(event),
            LinkSide::Source(link) => link.step(event),
        };
        if effects.iter().any(|e| matches!(e, LinkEffect::EmitDone(_))) {
            sessions.remove(account_id);
        }
        effects
    }

    pub fn is_active(&self, account_id: &str) -> bool {
        self.sessions.lock().contains_key(account_id)
    }
}

/// Translate a `LinkEffect::EmitState` carrying a `LinkState` into the
/// corresponding public `Event`, for either protocol side.
pub fn link_event_for(state: LinkState, is_new_device: bool) -> Event {
    if is_new_device {
        Event::AddDeviceStateChanged(state)
    } else {
        Event::DeviceAuthStateChanged(state)
    }
}

/// Accept a fully materialized sync/trust-request fan-out target: every
/// known device but self, reached on `inbox:<device_id>`.
pub fn fan_out_targets(contacts: &ContactList, self_device_id: &str) -> Vec<String> {
    contacts
        .known_devices
        .keys()
        .filter(|id| id.as_str() != self_device_id)
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_account_produces_parseable_chain() {
        let (account_id, archive, device_key_pem) = create_account("laptop", "hunter2", None).unwrap();
        let chain = archive.identity.clone().unwrap();
        assert_eq!(cert::parse_pem(&chain.account_pem).unwrap().public_key_id, account_id);
        assert!(archive.eth_key.is_some());

        let device_pem = chain.device_pem.expect("a fresh account issues its own device certificate");
        let device_keypair = cert::keypair_from_pem(&device_key_pem.unwrap()).unwrap();
        assert_eq!(
            cert::parse_pem(&device_pem).unwrap().public_key_id,
            cert::keypair_public_key_id(&device_keypair).unwrap()
        );
    }

    #[test]
    fn create_account_with_existing_identity_issues_no_device_key() {
        let (_, archive, _) = create_account("laptop", "hunter2", None).unwrap();
        let chain = archive.identity.unwrap();
        let (_, reused_archive, device_key_pem) = create_account("phone", "hunter2", Some(chain)).unwrap();
        assert!(device_key_pem.is_none());
        assert!(reused_archive.identity.unwrap().device_pem.is_none());
    }

    #[test]
    fn build_account_info_carries_archive_contacts_and_config() {
        let (account_id, archive, device_key_pem) = create_account("laptop", "hunter2", None).unwrap();
        let chain = archive.identity.clone().unwrap();
        let identity = Identity {
            chain,
            device_key_pem: device_key_pem.unwrap(),
        };
        let info = build_account_info(&account_id, identity.device_id().unwrap(), identity, &archive);
        assert_eq!(info.account_id, account_id);
        assert_eq!(info.config.get_raw("deviceName"), Some("laptop"));
    }

    #[tokio::test]
    async fn password_credentials_register_a_live_account() {
        use crate::services::testing::NoopChannelService;

        let manager = ArchiveAccountManager::new(Arc::new(NoopChannelService));
        let (success_tx, mut success_rx) = tokio::sync::mpsc::unbounded_channel();

        manager
            .init_authentication(
                "laptop",
                Credentials::Password {
                    password: "hunter2".to_string(),
                    existing_identity: None,
                },
                Box::new(move |account_id| {
                    let _ = success_tx.send(account_id);
                }),
                Box::new(|_| panic!("expected success")),
                Box::new(|_| {}),
            )
            .await;

        let account_id = success_rx.recv().await.expect("on_success called");
        assert!(manager.account_info(&account_id).is_some());
    }

    #[tokio::test]
    async fn file_credentials_import_and_register_an_archive() {
        use crate::archive::codec::{write_archive, EncryptionScheme};
        use crate::services::testing::NoopChannelService;

        let (_, archive, _) = create_account("laptop", "hunter2", None).unwrap();
        let bytes = write_archive(&archive, &EncryptionScheme::Password("hunter2".to_string())).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let archive_path = dir.path().join("archive.gz");
        tokio::fs::write(&archive_path, &bytes).await.unwrap();

        let manager = ArchiveAccountManager::new(Arc::new(NoopChannelService));
        let (success_tx, mut success_rx) = tokio::sync::mpsc::unbounded_channel();

        manager
            .init_authentication(
                "laptop",
                Credentials::File {
                    path: archive_path.to_string_lossy().to_string(),
                    password: Some("hunter2".to_string()),
                },
                Box::new(move |account_id| {
                    let _ = success_tx.send(account_id);
                }),
                Box::new(|err| panic!("unexpected failure: {err:?}")),
                Box::new(|_| {}),
            )
            .await;

        let account_id = success_rx.recv().await.expect("on_success called");
        assert!(manager.account_info(&account_id).is_some());
    }

    #[tokio::test]
    async fn p2p_credentials_complete_a_device_link() {
        use crate::archive::codec::{write_archive, EncryptionScheme};
        use crate::services::testing::InMemoryChannelSocket;
        use crate::services::ChannelError;

        struct SocketHandle(Arc<InMemoryChannelSocket>);

        #[async_trait::async_trait]
        impl ChannelSocket for SocketHandle {
            async fn write(&self, bytes: &[u8]) -> Result<(), ChannelError> {
                self.0.write(bytes).await
            }
            async fn shutdown(&self) {
                self.0.shutdown().await
            }
            fn on_shutdown(&self, handler: Box<dyn Fn() + Send + Sync>) {
                self.0.on_shutdown(handler)
            }
            fn on_recv(&self, handler: Box<dyn Fn(&[u8]) + Send + Sync>) {
                self.0.on_recv(handler)
            }
            fn peer_device_id(&self) -> String {
                self.0.peer_device_id()
            }
        }

        struct TestChannelService {
            socket: Arc<InMemoryChannelSocket>,
        }

        #[async_trait::async_trait]
        impl ChannelService for TestChannelService {
            async fn open(&self, _peer: &str, _sub_protocol: &str) -> Result<Box<dyn ChannelSocket>, ChannelError> {
                Ok(Box::new(SocketHandle(Arc::clone(&self.socket))))
            }
            fn on_incoming(&self, _sub_protocol: &str, _handler: Box<dyn Fn(Box<dyn ChannelSocket>) + Send + Sync>) {}
        }

        let socket = InMemoryChannelSocket::new("source-device");
        let channels: Arc<dyn ChannelService> = Arc::new(TestChannelService {
            socket: Arc::clone(&socket),
        });
        let manager = ArchiveAccountManager::new(channels);

        let (success_tx, mut success_rx) = tokio::sync::mpsc::unbounded_channel();

        manager
            .init_authentication(
                "new-laptop",
                Credentials::P2p {
                    token: "jami-auth://source-device".to_string(),
                },
                Box::new(move |account_id| {
                    let _ = success_tx.send(account_id);
                }),
                Box::new(|err| panic!("unexpected failure: {err:?}")),
                Box::new(|_| {}),
            )
            .await;

        let (source_account_id, source_archive, _) = create_account("source", "hunter2", None).unwrap();
        let archive_bytes = write_archive(&source_archive, &EncryptionScheme::None).unwrap();
        let payload_b64 = {
            use base64::Engine;
            base64::engine::general_purpose::STANDARD.encode(&archive_bytes)
        };

        socket
            .deliver(&rmp_serde::to_vec(&LinkMessage::new(&[("authScheme", "none")])).unwrap())
            .await;
        socket
            .deliver(&rmp_serde::to_vec(&LinkMessage::new(&[("accData", &payload_b64)])).unwrap())
            .await;

        let account_id = success_rx.recv().await.expect("on_success called");
        let _ = source_account_id;
        assert!(manager.account_info(&account_id).is_some());
    }

    #[test]
    fn compute_keys_previous_epoch_differs_from_current() {
        let now = 1_000_000_000;
        let current = compute_keys("pw", "1234", false, now);
        let previous = compute_keys("pw", "1234", true, now);
        assert_ne!(current.location, previous.location);
    }

    #[test]
    fn only_one_link_session_per_account() {
        let sessions = LinkSessions::new();
        sessions.start_new_device("acct1").unwrap();
        assert_eq!(
            sessions.start_new_device("acct1").unwrap_err(),
            AddDeviceError::AlreadyLinking
        );
    }

    #[test]
    fn session_clears_after_done() {
        let sessions = LinkSessions::new();
        sessions.start_source_device("acct1").unwrap();
        sessions.step(
            "acct1",
            LinkEvent::Connected {
                peer: "newdev".to_string(),
            },
        );
        sessions.step(
            "acct1",
            LinkEvent::UserConfirmed {
                scheme: "none".to_string(),
            },
        );
        sessions.step(
            "acct1",
            LinkEvent::PasswordAttempt {
                password: String::new(),
                correct: true,
            },
        );
        assert!(!sessions.is_active("acct1"));
    }

    #[tokio::test]
    async fn revoke_device_pins_before_publishing() {
        let dht = crate::services::testing::InMemoryDht::new();
        let mut archive = AccountArchive::default();
        let mut contacts = ContactList::new("");
        contacts.known_devices.insert(
            "dev1".to_string(),
            crate::contacts::KnownDevice {
                certificate_pem: String::new(),
                display_name: None,
                last_sync_ts: 0,
            },
        );

        let mut pinned = false;
        revoke_device(&dht, "acct1", "dev1", &mut archive, &mut contacts, |_| pinned = true)
            .await
            .unwrap();

        assert!(pinned);
        assert!(!contacts.known_devices.contains_key("dev1"));
        assert!(!dht.get("acct1").await.is_empty());
    }
}
