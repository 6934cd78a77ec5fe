//! Identity loading, certificate-chain renewal, and receipt verification.

pub mod cert;
pub mod receipt;

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use crate::error::IdentityError;

/// Which level of the chain a renewal/validity operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertLevel {
    Ca,
    Account,
    Device,
}

/// The three-certificate chain backing one account.
///
/// Invariant: every non-leaf must have `is_ca = true` and be unexpired; the
/// device certificate's issuer must equal the account certificate.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CertificateChain {
    pub ca_pem: String,
    pub account_pem: String,
    pub device_pem: Option<String>,
}

/// A loaded identity: the chain plus the device's own private key.
pub struct Identity {
    pub chain: CertificateChain,
    pub device_key_pem: String,
}

impl Identity {
    /// The account id: the account certificate's public-key id.
    pub fn account_id(&self) -> Result<String, IdentityError> {
        Ok(cert::parse_pem(&self.chain.account_pem)?.public_key_id)
    }

    /// The device id: the device certificate's public-key id.
    pub fn device_id(&self) -> Result<Option<String>, IdentityError> {
        match &self.chain.device_pem {
            Some(pem) => Ok(Some(cert::parse_pem(pem)?.public_key_id)),
            None => Ok(None),
        }
    }
}

/// Per-account set of revoked device ids, applied against a loaded identity
/// after the fact. Instance-owned like everything else here — no process
/// globals.
#[derive(Debug, Default)]
pub struct RevocationStore {
    revoked: BTreeMap<String, BTreeSet<String>>,
}

impl RevocationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a comma-separated revocation list (the archive's
    /// `revocation_list` encoding) into the set for `account_id`.
    pub fn install(&mut self, account_id: &str, revocation_list: &str) {
        let entry = self.revoked.entry(account_id.to_string()).or_default();
        entry.extend(revocation_list.split(',').filter(|s| !s.is_empty()).map(str::to_string));
    }

    pub fn is_revoked(&self, account_id: &str, device_id: &str) -> bool {
        self.revoked.get(account_id).map(|set| set.contains(device_id)).unwrap_or(false)
    }
}

/// Loads identities from disk, verifies receipts, and renews stale chains.
///
/// Stateless by design: every operation takes the data it needs and returns
/// a result, per the "result-returning functions, no globals" rule this core
/// follows throughout.
pub struct IdentityManager;

impl IdentityManager {
    /// Read a device cert bundle and key from disk, verify the device key
    /// matches the leaf certificate and that the chain carries an issuer,
    /// and assemble a loaded [`Identity`].
    ///
    /// Revocation-list application is a separate step: this takes only the
    /// three on-disk inputs named in the account's load flow, so there's no
    /// room for a store argument here. The caller applies a
    /// [`RevocationStore`] against the result afterward.
    pub fn load(cert_path: &Path, key_path: &Path, key_password: Option<&str>) -> Result<Identity, IdentityError> {
        let cert_bundle = std::fs::read_to_string(cert_path)
            .map_err(|_| IdentityError::FileMissing("certificate".into()))?;
        let key_pem = std::fs::read_to_string(key_path).map_err(|_| IdentityError::FileMissing("key".into()))?;
        if cert_bundle.trim().is_empty() {
            return Err(IdentityError::FileMissing("certificate".into()));
        }
        if key_pem.trim().is_empty() {
            return Err(IdentityError::FileMissing("key".into()));
        }

        let chain = cert::chain_from_bundle(&cert_bundle)?;
        let Some(device_pem) = &chain.device_pem else {
            return Err(IdentityError::FileMissing("device certificate".into()));
        };
        let leaf = cert::parse_pem(device_pem)?;
        if leaf.issuer_cn.is_empty() {
            return Err(IdentityError::NoIssuer);
        }

        let (keypair, device_key_pem) = cert::load_keypair_pem(&key_pem, key_password)?;
        if cert::keypair_public_key_id(&keypair)? != leaf.public_key_id {
            return Err(IdentityError::Mismatch);
        }

        Ok(Identity { chain, device_key_pem })
    }

    /// True if any ancestor in the chain (CA, account, and device if present)
    /// is not a CA (CA/account level) or has expired. Walks the *full* chain
    /// from the leaf up, not just the immediate parent.
    pub fn needs_migration(chain: &CertificateChain, now_epoch: i64) -> Result<bool, IdentityError> {
        let ca = cert::parse_pem(&chain.ca_pem)?;
        let account = cert::parse_pem(&chain.account_pem)?;
        if !ca.is_ca || !cert::not_expired(&ca, now_epoch) {
            return Ok(true);
        }
        if !account.is_ca || !cert::not_expired(&account, now_epoch) {
            return Ok(true);
        }
        if let Some(device_pem) = &chain.device_pem {
            let device = cert::parse_pem(device_pem)?;
            if !cert::not_expired(&device, now_epoch) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Regenerate whichever levels of the chain are stale, in order: CA,
    /// then account (if the CA changed or the account cert is stale), then
    /// device (if the account changed and a device keypair was provided).
    /// Idempotent when nothing is stale.
    pub fn renew_certificates(
        ca_key_pem: &mut String,
        chain: &mut CertificateChain,
        device_keypair: Option<&rcgen::KeyPair>,
        validity_seconds: i64,
        now_epoch: i64,
    ) -> Result<bool, IdentityError> {
        let mut changed = false;

        let ca = cert::parse_pem(&chain.ca_pem)?;
        if !ca.is_ca || !cert::not_expired(&ca, now_epoch) {
            let (keypair, new_ca_pem) = cert::generate_ca("accord-ca", validity_seconds)?;
            *ca_key_pem = keypair.pkcs8_pem;
            chain.ca_pem = new_ca_pem;
            changed = true;
        }

        let account = cert::parse_pem(&chain.account_pem)?;
        if changed || !account.is_ca || !cert::not_expired(&account, now_epoch) {
            let account_keypair = cert::generate_keypair()?;
            chain.account_pem = cert::issue_under(
                "accord-account",
                &chain.ca_pem,
                ca_key_pem,
                &account_keypair.rcgen,
                true,
                validity_seconds,
            )?;
            changed = true;
        }

        if changed {
            if let Some(device_kp) = device_keypair {
                chain.device_pem = Some(cert::issue_under(
                    "accord-device",
                    &chain.account_pem,
                    ca_key_pem,
                    device_kp,
                    false,
                    validity_seconds,
                )?);
            }
        }

        Ok(changed)
    }

    /// Extend the validity of `target` (or all three levels if `None`),
    /// re-signing with the CA key.
    pub fn set_validity(
        ca_key_pem: &str,
        chain: &mut CertificateChain,
        target: Option<CertLevel>,
        validity_seconds: i64,
    ) -> Result<bool, IdentityError> {
        let mut changed = false;
        let all = target.is_none();

        if all || target == Some(CertLevel::Ca) {
            let parsed = cert::parse_pem(&chain.ca_pem)?;
            let _ = parsed;
            let (_, new_ca_pem) = cert::generate_ca("accord-ca", validity_seconds)?;
            chain.ca_pem = new_ca_pem;
            changed = true;
        }

        if all || target == Some(CertLevel::Account) {
            let keypair = cert::generate_keypair()?;
            chain.account_pem = cert::issue_under(
                "accord-account",
                &chain.ca_pem,
                ca_key_pem,
                &keypair.rcgen,
                true,
                validity_seconds,
            )?;
            changed = true;
        }

        if (all || target == Some(CertLevel::Device)) && chain.device_pem.is_some() {
            let keypair = cert::generate_keypair()?;
            chain.device_pem = Some(cert::issue_under(
                "accord-device",
                &chain.account_pem,
                ca_key_pem,
                &keypair.rcgen,
                false,
                validity_seconds,
            )?);
            changed = true;
        }

        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_chain(validity_seconds: i64) -> (String, CertificateChain) {
        let (ca_kp, ca_pem) = cert::generate_ca("accord-ca", validity_seconds).unwrap();
        let account_kp = cert::generate_keypair().unwrap();
        let account_pem = cert::issue_under(
            "accord-account",
            &ca_pem,
            &ca_kp.pkcs8_pem,
            &account_kp.rcgen,
            true,
            validity_seconds,
        )
        .unwrap();
        (
            ca_kp.pkcs8_pem,
            CertificateChain {
                ca_pem,
                account_pem,
                device_pem: None,
            },
        )
    }

    #[test]
    fn load_assembles_identity_from_disk() {
        let validity = 3600 * 24 * 365;
        let (ca_kp, ca_pem) = cert::generate_ca("accord-ca", validity).unwrap();
        let account_kp = cert::generate_keypair().unwrap();
        let account_pem =
            cert::issue_under("accord-account", &ca_pem, &ca_kp.pkcs8_pem, &account_kp.rcgen, true, validity).unwrap();
        let device_kp = cert::generate_keypair().unwrap();
        let device_pem =
            cert::issue_under("accord-device", &account_pem, &ca_kp.pkcs8_pem, &device_kp.rcgen, false, validity).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let cert_path = dir.path().join("ring_device.crt");
        let key_path = dir.path().join("ring_device.key");
        std::fs::write(&cert_path, format!("{ca_pem}{account_pem}{device_pem}")).unwrap();
        std::fs::write(&key_path, &device_kp.pkcs8_pem).unwrap();

        let identity = IdentityManager::load(&cert_path, &key_path, None).unwrap();
        assert_eq!(identity.account_id().unwrap(), cert::parse_pem(&account_pem).unwrap().public_key_id);
        assert_eq!(identity.device_id().unwrap(), Some(cert::parse_pem(&device_pem).unwrap().public_key_id));
    }

    #[test]
    fn load_rejects_bundle_missing_device_certificate() {
        let validity = 3600 * 24 * 365;
        let (ca_kp, ca_pem) = cert::generate_ca("accord-ca", validity).unwrap();
        let account_kp = cert::generate_keypair().unwrap();
        let account_pem =
            cert::issue_under("accord-account", &ca_pem, &ca_kp.pkcs8_pem, &account_kp.rcgen, true, validity).unwrap();
        let device_kp = cert::generate_keypair().unwrap();

        let dir = tempfile::tempdir().unwrap();
        let cert_path = dir.path().join("ring_device.crt");
        let key_path = dir.path().join("ring_device.key");
        std::fs::write(&cert_path, format!("{ca_pem}{account_pem}")).unwrap();
        std::fs::write(&key_path, &device_kp.pkcs8_pem).unwrap();

        assert!(matches!(
            IdentityManager::load(&cert_path, &key_path, None),
            Err(IdentityError::FileMissing(_))
        ));
    }

    #[test]
    fn revocation_store_tracks_per_account_devices() {
        let mut store = RevocationStore::new();
        assert!(!store.is_revoked("acct1", "dev1"));
        store.install("acct1", "dev1,dev2");
        assert!(store.is_revoked("acct1", "dev1"));
        assert!(store.is_revoked("acct1", "dev2"));
        assert!(!store.is_revoked("acct1", "dev3"));
        assert!(!store.is_revoked("acct2", "dev1"));
    }

    #[test]
    fn fresh_chain_needs_no_migration() {
        let (_, chain) = fresh_chain(3600 * 24 * 365);
        assert!(!IdentityManager::needs_migration(&chain, 0).unwrap());
    }

    #[test]
    fn expired_account_cert_needs_migration() {
        let (_, chain) = fresh_chain(1);
        let far_future = time::OffsetDateTime::now_utc().unix_timestamp() + 1_000_000;
        assert!(IdentityManager::needs_migration(&chain, far_future).unwrap());
    }

    #[test]
    fn renew_is_idempotent_when_nothing_stale() {
        let (mut ca_key_pem, mut chain) = fresh_chain(3600 * 24 * 365);
        let now = time::OffsetDateTime::now_utc().unix_timestamp();
        let changed = IdentityManager::renew_certificates(&mut ca_key_pem, &mut chain, None, 3600, now)
            .unwrap();
        assert!(!changed);
    }

    #[test]
    fn renew_regenerates_expired_account_cert() {
        let (mut ca_key_pem, mut chain) = fresh_chain(1);
        let far_future = time::OffsetDateTime::now_utc().unix_timestamp() + 1_000_000;
        let changed = IdentityManager::renew_certificates(
            &mut ca_key_pem,
            &mut chain,
            None,
            3600 * 24 * 365,
            far_future,
        )
        .unwrap();
        assert!(changed);
        assert!(!IdentityManager::needs_migration(&chain, far_future).unwrap());
    }
}
