//! Receipt construction and verification.
//!
//! A receipt is a canonical JSON string binding
//! `{account_id, device_id, eth_address, announce}`, signed by the account
//! private key. `announce` is itself a signed device-announcement value,
//! signed by the device key, so that verifying the receipt proves the holder
//! of the account key authorized this specific device.

use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::signature::{RandomizedSigner, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;

use crate::error::IdentityError;

/// The device-announcement payload, signed by the device's own key and
/// embedded (base64) inside a [`Receipt`].
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct DeviceAnnouncement {
    pub from: String,
    pub device: String,
    /// DER-encoded device public key, base64.
    pub device_public_key: String,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct SignedDeviceAnnouncement {
    announcement: DeviceAnnouncement,
    /// base64 RSA signature over the canonical JSON of `announcement`.
    signature: String,
}

/// The canonical receipt body (pre-signature).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ReceiptBody {
    pub id: String,
    pub dev: String,
    pub eth: String,
    /// base64-encoded, canonical-JSON-serialized [`SignedDeviceAnnouncement`].
    pub announce: String,
}

/// A receipt together with the account signature over its canonical body.
pub struct Receipt {
    pub body: ReceiptBody,
    pub body_json: String,
    pub signature: Vec<u8>,
}

fn canonical_json<T: serde::Serialize>(value: &T) -> Result<String, IdentityError> {
    serde_json::to_string(value).map_err(|e| IdentityError::CertGeneration(e.to_string()))
}

/// Sign a device announcement with the device's own private key.
pub fn sign_announcement(
    device_key: &RsaPrivateKey,
    from_account_id: &str,
    device_id: &str,
    device_public_key_der: &[u8],
) -> Result<String, IdentityError> {
    let announcement = DeviceAnnouncement {
        from: from_account_id.to_string(),
        device: device_id.to_string(),
        device_public_key: base64_encode(device_public_key_der),
    };
    let body = canonical_json(&announcement)?;
    let signing_key = SigningKey::<Sha256>::new(device_key.clone());
    let sig: Signature = signing_key.sign_with_rng(&mut rand::thread_rng(), body.as_bytes());
    let signed = SignedDeviceAnnouncement {
        announcement,
        signature: base64_encode(sig.to_string().as_bytes()),
    };
    let json = canonical_json(&signed)?;
    Ok(base64_encode(json.as_bytes()))
}

/// Build a receipt body and sign it with the account private key.
pub fn build_receipt(
    account_key: &RsaPrivateKey,
    account_id: &str,
    device_id: &str,
    eth_address: &str,
    announce_b64: &str,
) -> Result<Receipt, IdentityError> {
    let body = ReceiptBody {
        id: account_id.to_string(),
        dev: device_id.to_string(),
        eth: eth_address.to_string(),
        announce: announce_b64.to_string(),
    };
    let body_json = canonical_json(&body)?;
    let signing_key = SigningKey::<Sha256>::new(account_key.clone());
    let sig: Signature = signing_key.sign_with_rng(&mut rand::thread_rng(), body_json.as_bytes());
    Ok(Receipt {
        body,
        body_json,
        signature: sig.to_string().into_bytes(),
    })
}

fn base64_encode(bytes: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

fn base64_decode(s: &str) -> Result<Vec<u8>, IdentityError> {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD
        .decode(s)
        .map_err(|_| IdentityError::ReceiptInvalid("announce-base64"))
}

/// Verify a receipt end to end against the account and device certificates'
/// public-key ids. Returns `Ok(())` or `IdentityError::ReceiptInvalid` naming
/// the failing substep.
pub fn verify_receipt(
    body_json: &str,
    signature: &[u8],
    account_public_key: &RsaPublicKey,
    expected_account_id: &str,
    expected_device_id: &str,
) -> Result<(), IdentityError> {
    // Step 1: parse receipt JSON, require the four fields.
    let body: ReceiptBody = serde_json::from_str(body_json)
        .map_err(|_| IdentityError::ReceiptInvalid("parse"))?;

    // Step 2: check the receipt signature with the account certificate's public key.
    let verifying_key = VerifyingKey::<Sha256>::new(account_public_key.clone());
    let sig_str =
        std::str::from_utf8(signature).map_err(|_| IdentityError::ReceiptInvalid("signature-encoding"))?;
    let sig: Signature = sig_str
        .parse()
        .map_err(|_| IdentityError::ReceiptInvalid("signature-decode"))?;
    verifying_key
        .verify(body_json.as_bytes(), &sig)
        .map_err(|_| IdentityError::ReceiptInvalid("signature"))?;

    // Step 3: assert dev/id match the expected certificate public-key ids.
    if body.dev != expected_device_id || body.id != expected_account_id {
        return Err(IdentityError::ReceiptInvalid("id-mismatch"));
    }

    // Step 4: base64-decode announce, parse, verify its internal signature,
    // and assert its from/device fields match.
    let announce_json = base64_decode(&body.announce)?;
    let announce_json =
        String::from_utf8(announce_json).map_err(|_| IdentityError::ReceiptInvalid("announce-utf8"))?;
    let signed: SignedDeviceAnnouncement = serde_json::from_str(&announce_json)
        .map_err(|_| IdentityError::ReceiptInvalid("announce-parse"))?;

    if signed.announcement.from != expected_account_id || signed.announcement.device != expected_device_id {
        return Err(IdentityError::ReceiptInvalid("announce-mismatch"));
    }

    let device_pub_der = base64_decode(&signed.announcement.device_public_key)?;
    let device_pub = rsa::RsaPublicKey::try_from(
        pkcs8::SubjectPublicKeyInfoRef::try_from(device_pub_der.as_slice())
            .map_err(|_| IdentityError::ReceiptInvalid("announce-device-key"))?,
    )
    .map_err(|_| IdentityError::ReceiptInvalid("announce-device-key"))?;
    let device_verifying_key = VerifyingKey::<Sha256>::new(device_pub);
    let inner_sig_bytes = base64_decode(&signed.signature)?;
    let inner_sig_str = std::str::from_utf8(&inner_sig_bytes)
        .map_err(|_| IdentityError::ReceiptInvalid("announce-signature-encoding"))?;
    let inner_sig: Signature = inner_sig_str
        .parse()
        .map_err(|_| IdentityError::ReceiptInvalid("announce-signature-decode"))?;
    let announcement_json = canonical_json(&signed.announcement)?;
    device_verifying_key
        .verify(announcement_json.as_bytes(), &inner_sig)
        .map_err(|_| IdentityError::ReceiptInvalid("announce-signature"))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::pkcs8::EncodePublicKey;

    fn keypair(bits: usize) -> RsaPrivateKey {
        RsaPrivateKey::new(&mut rand::thread_rng(), bits).unwrap()
    }

    #[test]
    fn valid_receipt_verifies() {
        let account_key = keypair(2048);
        let device_key = keypair(2048);
        let device_pub_der = device_key
            .to_public_key()
            .to_public_key_der()
            .unwrap()
            .into_vec();

        let announce = sign_announcement(&device_key, "acc1", "dev1", &device_pub_der).unwrap();
        let receipt = build_receipt(&account_key, "acc1", "dev1", "0xabc", &announce).unwrap();

        verify_receipt(
            &receipt.body_json,
            &receipt.signature,
            &account_key.to_public_key(),
            "acc1",
            "dev1",
        )
        .unwrap();
    }

    #[test]
    fn tampered_receipt_fails() {
        let account_key = keypair(2048);
        let device_key = keypair(2048);
        let device_pub_der = device_key
            .to_public_key()
            .to_public_key_der()
            .unwrap()
            .into_vec();

        let announce = sign_announcement(&device_key, "acc1", "dev1", &device_pub_der).unwrap();
        let receipt = build_receipt(&account_key, "acc1", "dev1", "0xabc", &announce).unwrap();

        let mut tampered = receipt.body_json.clone();
        tampered.push(' ');

        let result = verify_receipt(
            &tampered,
            &receipt.signature,
            &account_key.to_public_key(),
            "acc1",
            "dev1",
        );
        assert!(result.is_err());
    }

    #[test]
    fn mismatched_device_id_fails() {
        let account_key = keypair(2048);
        let device_key = keypair(2048);
        let device_pub_der = device_key
            .to_public_key()
            .to_public_key_der()
            .unwrap()
            .into_vec();

        let announce = sign_announcement(&device_key, "acc1", "dev1", &device_pub_der).unwrap();
        let receipt = build_receipt(&account_key, "acc1", "dev1", "0xabc", &announce).unwrap();

        let result = verify_receipt(
            &receipt.body_json,
            &receipt.signature,
            &account_key.to_public_key(),
            "acc1",
            "other-device",
        );
        assert!(result.is_err());
    }
}
