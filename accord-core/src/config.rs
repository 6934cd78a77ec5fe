//! Stable-key account configuration and on-disk path resolution.
//!
//! The archive's `config` map uses fixed string keys (§6.6 of the design) so
//! that a config produced by one build round-trips through a later one even
//! if it doesn't recognize every key yet. [`ConfigKey`] is the enumerated,
//! known subset; unknown keys read from disk are preserved verbatim.

use std::collections::BTreeMap;
use std::path::PathBuf;

/// A stable, named account configuration key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ConfigKey {
    ArchivePath,
    ArchiveHasPassword,
    DeviceName,
    DeviceId,
    DhtPort,
    DhtPublicInCalls,
    DhtPeerDiscovery,
    AccountPeerDiscovery,
    AccountPublish,
    ProxyEnabled,
    ProxyServer,
    ProxyPushToken,
    ManagerUri,
    ManagerUsername,
    NameServerUri,
    DisplayName,
    RingtonePath,
    TlsCaListFile,
    TlsCertificateFile,
    TlsPrivateKeyFile,
    TlsPassword,
}

impl ConfigKey {
    /// All known keys, in declaration order.
    pub const ALL: &'static [ConfigKey] = &[
        ConfigKey::ArchivePath,
        ConfigKey::ArchiveHasPassword,
        ConfigKey::DeviceName,
        ConfigKey::DeviceId,
        ConfigKey::DhtPort,
        ConfigKey::DhtPublicInCalls,
        ConfigKey::DhtPeerDiscovery,
        ConfigKey::AccountPeerDiscovery,
        ConfigKey::AccountPublish,
        ConfigKey::ProxyEnabled,
        ConfigKey::ProxyServer,
        ConfigKey::ProxyPushToken,
        ConfigKey::ManagerUri,
        ConfigKey::ManagerUsername,
        ConfigKey::NameServerUri,
        ConfigKey::DisplayName,
        ConfigKey::RingtonePath,
        ConfigKey::TlsCaListFile,
        ConfigKey::TlsCertificateFile,
        ConfigKey::TlsPrivateKeyFile,
        ConfigKey::TlsPassword,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ConfigKey::ArchivePath => "archivePath",
            ConfigKey::ArchiveHasPassword => "archiveHasPassword",
            ConfigKey::DeviceName => "deviceName",
            ConfigKey::DeviceId => "deviceId",
            ConfigKey::DhtPort => "dhtPort",
            ConfigKey::DhtPublicInCalls => "dhtPublicInCalls",
            ConfigKey::DhtPeerDiscovery => "dhtPeerDiscovery",
            ConfigKey::AccountPeerDiscovery => "accountPeerDiscovery",
            ConfigKey::AccountPublish => "accountPublish",
            ConfigKey::ProxyEnabled => "proxyEnabled",
            ConfigKey::ProxyServer => "proxyServer",
            ConfigKey::ProxyPushToken => "proxyPushToken",
            ConfigKey::ManagerUri => "managerUri",
            ConfigKey::ManagerUsername => "managerUsername",
            ConfigKey::NameServerUri => "nameServerUri",
            ConfigKey::DisplayName => "displayName",
            ConfigKey::RingtonePath => "ringtonePath",
            ConfigKey::TlsCaListFile => "tlsCaListFile",
            ConfigKey::TlsCertificateFile => "tlsCertificateFile",
            ConfigKey::TlsPrivateKeyFile => "tlsPrivateKeyFile",
            ConfigKey::TlsPassword => "tlsPassword",
        }
    }

    pub fn parse(name: &str) -> Option<ConfigKey> {
        Self::ALL.iter().copied().find(|k| k.as_str() == name)
    }

    /// Device-local fields are never written into an exported archive.
    pub fn is_device_local(self) -> bool {
        matches!(
            self,
            ConfigKey::DeviceName | ConfigKey::DeviceId | ConfigKey::ArchivePath
        )
    }

    /// File-backed fields are inlined as base64 file contents on export.
    pub fn is_file_backed(self) -> bool {
        matches!(
            self,
            ConfigKey::TlsCaListFile | ConfigKey::TlsCertificateFile | ConfigKey::TlsPrivateKeyFile
        )
    }
}

/// Typed wrapper around the archive's `config` string map.
///
/// Unknown keys read from disk round-trip untouched through
/// export/import — this is what keeps older/newer builds forward and
/// backward compatible.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct AccountConfig {
    #[serde(flatten)]
    entries: BTreeMap<String, String>,
}

impl AccountConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap an already-materialized key/value map (e.g. an archive's
    /// `config` partition) without re-validating individual keys.
    pub fn from_map(entries: BTreeMap<String, String>) -> Self {
        Self { entries }
    }

    pub fn get(&self, key: ConfigKey) -> Option<&str> {
        self.entries.get(key.as_str()).map(String::as_str)
    }

    pub fn get_raw(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: ConfigKey, value: impl Into<String>) {
        self.entries.insert(key.as_str().to_string(), value.into());
    }

    pub fn set_raw(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), value.into());
    }

    /// Keys and values suitable for inclusion in an exported archive: device-
    /// local fields dropped, file-backed fields left as-is (the caller
    /// inlines their file contents separately per §6.6).
    pub fn exportable(&self) -> BTreeMap<String, String> {
        self.entries
            .iter()
            .filter(|(k, _)| {
                ConfigKey::parse(k).map(|key| !key.is_device_local()).unwrap_or(true)
            })
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

/// Resolves the on-disk layout for one account, per the data/cache directory
/// split documented for the on-disk layout.
#[derive(Debug, Clone)]
pub struct Paths {
    data_dir: PathBuf,
    cache_dir: PathBuf,
    account_id: String,
}

impl Paths {
    pub fn new(account_id: impl Into<String>) -> Self {
        let data_dir = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
        let cache_dir = dirs::cache_dir().unwrap_or_else(|| PathBuf::from("."));
        Self {
            data_dir,
            cache_dir,
            account_id: account_id.into(),
        }
    }

    pub fn with_dirs(account_id: impl Into<String>, data_dir: PathBuf, cache_dir: PathBuf) -> Self {
        Self {
            data_dir,
            cache_dir,
            account_id: account_id.into(),
        }
    }

    fn account_data_dir(&self) -> PathBuf {
        self.data_dir.join(&self.account_id)
    }

    fn account_cache_dir(&self) -> PathBuf {
        self.cache_dir.join(&self.account_id)
    }

    pub fn config_yml(&self) -> PathBuf {
        self.account_data_dir().join("config.yml")
    }

    pub fn device_cert(&self) -> PathBuf {
        self.account_data_dir().join("ring_device.crt")
    }

    pub fn device_key(&self) -> PathBuf {
        self.account_data_dir().join("ring_device.key")
    }

    pub fn archive(&self) -> PathBuf {
        self.account_data_dir().join("archive.gz")
    }

    pub fn contacts(&self) -> PathBuf {
        self.account_data_dir().join("contacts")
    }

    pub fn incoming_trust_requests(&self) -> PathBuf {
        self.account_data_dir().join("incomingTrustRequests")
    }

    pub fn known_devices_names(&self) -> PathBuf {
        self.account_data_dir().join("knownDevicesNames")
    }

    pub fn conv_info(&self) -> PathBuf {
        self.account_data_dir().join("convInfo")
    }

    pub fn conv_requests(&self) -> PathBuf {
        self.account_data_dir().join("convRequests")
    }

    pub fn conversations_dir(&self) -> PathBuf {
        self.account_data_dir().join("conversations")
    }

    pub fn dht_state(&self) -> PathBuf {
        self.account_cache_dir().join("dhtstate")
    }
}

/// Atomically persist `bytes` at `path`: write to a sibling temp file, then
/// rename. Keeps concurrent readers from ever observing a partial write.
pub fn write_atomic(path: &std::path::Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut tmp = path.to_path_buf();
    let file_name = format!(
        "{}.tmp",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("accord")
    );
    tmp.set_file_name(file_name);
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_key_round_trips_through_str() {
        for key in ConfigKey::ALL {
            assert_eq!(ConfigKey::parse(key.as_str()), Some(*key));
        }
    }

    #[test]
    fn unknown_keys_are_preserved() {
        let mut cfg = AccountConfig::new();
        cfg.set_raw("someFutureKey", "value");
        cfg.set(ConfigKey::DisplayName, "Alice");
        let exported = cfg.exportable();
        assert_eq!(exported.get("someFutureKey"), Some(&"value".to_string()));
        assert_eq!(exported.get("displayName"), Some(&"Alice".to_string()));
    }

    #[test]
    fn device_local_keys_are_excluded_from_export() {
        let mut cfg = AccountConfig::new();
        cfg.set(ConfigKey::DeviceName, "laptop");
        cfg.set(ConfigKey::DisplayName, "Alice");
        let exported = cfg.exportable();
        assert!(!exported.contains_key("deviceName"));
        assert!(exported.contains_key("displayName"));
    }

    #[test]
    fn write_atomic_leaves_no_temp_file_behind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub").join("file.bin");
        write_atomic(&path, b"hello").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"hello");
        assert!(!dir.path().join("sub").join("file.bin.tmp").exists());
    }
}
