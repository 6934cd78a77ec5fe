//! Low-level X.509 construction, signing, and parsing.
//!
//! Certificates are generated with `rcgen`, backed by RSA keypairs from the
//! `rsa`/`pkcs8` crates (rcgen does not generate RSA keys itself, only signs
//! with externally supplied ones). Verification re-parses PEM with
//! `x509-parser` since rcgen has no chain-verification API of its own.

use pkcs8::{DecodePrivateKey, EncodePrivateKey};
use rsa::RsaPrivateKey;
use sha2::{Digest, Sha256};

use crate::error::IdentityError;
use crate::identity::CertificateChain;

/// Bits used for account and device RSA keys.
pub const KEY_BITS: usize = 4096;

/// A generated keypair ready to sign/be-signed by rcgen.
pub struct Keypair {
    pub rcgen: rcgen::KeyPair,
    pub pkcs8_pem: String,
}

/// Generate a fresh RSA keypair of [`KEY_BITS`] bits.
pub fn generate_keypair() -> Result<Keypair, IdentityError> {
    let mut rng = rand::thread_rng();
    let priv_key = RsaPrivateKey::new(&mut rng, KEY_BITS)
        .map_err(|e| IdentityError::CertGeneration(format!("rsa keygen failed: {e}")))?;
    let pkcs8_pem = priv_key
        .to_pkcs8_pem(pkcs8::LineEnding::LF)
        .map_err(|e| IdentityError::CertGeneration(format!("pkcs8 encode failed: {e}")))?
        .to_string();
    let rcgen_kp = rcgen::KeyPair::from_pkcs8_pem_and_sign_algo(&pkcs8_pem, &rcgen::PKCS_RSA_SHA256)
        .map_err(|e| IdentityError::CertGeneration(format!("rcgen keypair import failed: {e}")))?;
    Ok(Keypair {
        rcgen: rcgen_kp,
        pkcs8_pem,
    })
}

/// Reconstruct a keypair previously produced by [`generate_keypair`].
pub fn keypair_from_pem(pkcs8_pem: &str) -> Result<rcgen::KeyPair, IdentityError> {
    rcgen::KeyPair::from_pkcs8_pem_and_sign_algo(pkcs8_pem, &rcgen::PKCS_RSA_SHA256)
        .map_err(|e| IdentityError::CertGeneration(format!("rcgen keypair import failed: {e}")))
}

/// Load a device private key from disk PEM, optionally password-encrypted,
/// and normalize it to a plain PKCS8 PEM alongside the rcgen keypair.
pub fn load_keypair_pem(key_pem: &str, password: Option<&str>) -> Result<(rcgen::KeyPair, String), IdentityError> {
    let priv_key = match password {
        Some(pw) => RsaPrivateKey::from_pkcs8_encrypted_pem(key_pem, pw)
            .map_err(|e| IdentityError::CertGeneration(format!("key decryption failed: {e}")))?,
        None => RsaPrivateKey::from_pkcs8_pem(key_pem)
            .map_err(|e| IdentityError::CertGeneration(format!("malformed key pem: {e}")))?,
    };
    let plain_pem = priv_key
        .to_pkcs8_pem(pkcs8::LineEnding::LF)
        .map_err(|e| IdentityError::CertGeneration(format!("pkcs8 encode failed: {e}")))?
        .to_string();
    let rcgen_kp = rcgen::KeyPair::from_pkcs8_pem_and_sign_algo(&plain_pem, &rcgen::PKCS_RSA_SHA256)
        .map_err(|e| IdentityError::CertGeneration(format!("rcgen keypair import failed: {e}")))?;
    Ok((rcgen_kp, plain_pem))
}

/// The public-key id an `rcgen::KeyPair` would produce once certified. rcgen
/// exposes no direct SPKI-DER accessor, so this self-signs a throwaway
/// certificate and runs it through the same [`public_key_id`] path used for
/// real certificates.
pub fn keypair_public_key_id(keypair: &rcgen::KeyPair) -> Result<String, IdentityError> {
    let params = base_params("accord-keycheck")?;
    let cert = params
        .self_signed(keypair)
        .map_err(|e| IdentityError::CertGeneration(format!("key check cert failed: {e}")))?;
    parse_pem(&cert.pem()).map(|p| p.public_key_id)
}

/// Split a bundle of concatenated PEM blocks (on-disk convention: the
/// device certificate file holds the full chain) into CA, account, and
/// device certificates. Classified by CA-ness and issuer/subject equality,
/// not by position, so block order in the file doesn't matter.
pub fn chain_from_bundle(bundle: &str) -> Result<CertificateChain, IdentityError> {
    let blocks = pem::parse_many(bundle.as_bytes())
        .map_err(|e| IdentityError::CertGeneration(format!("bad PEM bundle: {e}")))?;
    if blocks.is_empty() {
        return Err(IdentityError::FileMissing("certificate".into()));
    }

    let mut ca_pem = None;
    let mut account_pem = None;
    let mut device_pem = None;

    for block in &blocks {
        let pem_str = pem::encode(block);
        let parsed = parse_pem(&pem_str)?;
        if parsed.is_ca && parsed.issuer_cn == parsed.subject_cn {
            ca_pem = Some(pem_str);
        } else if parsed.is_ca {
            account_pem = Some(pem_str);
        } else {
            device_pem = Some(pem_str);
        }
    }

    Ok(CertificateChain {
        ca_pem: ca_pem.ok_or_else(|| IdentityError::FileMissing("CA certificate".into()))?,
        account_pem: account_pem.ok_or_else(|| IdentityError::FileMissing("account certificate".into()))?,
        device_pem,
    })
}

fn base_params(common_name: &str) -> Result<rcgen::CertificateParams, IdentityError> {
    let mut params = rcgen::CertificateParams::new(Vec::new())
        .map_err(|e| IdentityError::CertGeneration(e.to_string()))?;
    let mut dn = rcgen::DistinguishedName::new();
    dn.push(rcgen::DnType::CommonName, common_name);
    params.distinguished_name = dn;
    params.not_before = rcgen::date_time_ymd(2020, 1, 1);
    Ok(params)
}

/// Generate a self-signed CA certificate.
pub fn generate_ca(common_name: &str, validity_seconds: i64) -> Result<(Keypair, String), IdentityError> {
    let keypair = generate_keypair()?;
    let mut params = base_params(common_name)?;
    params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
    params.key_usages = vec![
        rcgen::KeyUsagePurpose::KeyCertSign,
        rcgen::KeyUsagePurpose::CrlSign,
        rcgen::KeyUsagePurpose::DigitalSignature,
    ];
    params.not_after = params.not_before + time::Duration::seconds(validity_seconds);
    let cert = params
        .self_signed(&keypair.rcgen)
        .map_err(|e| IdentityError::CertGeneration(format!("CA self-sign failed: {e}")))?;
    Ok((keypair, cert.pem()))
}

/// Issue a certificate under an existing issuer, CA or leaf depending on
/// `is_ca`.
pub fn issue_under(
    common_name: &str,
    issuer_cert_pem: &str,
    issuer_key_pem: &str,
    subject_keypair: &rcgen::KeyPair,
    is_ca: bool,
    validity_seconds: i64,
) -> Result<String, IdentityError> {
    let issuer_key = keypair_from_pem(issuer_key_pem)?;
    let issuer_params = rcgen::CertificateParams::from_ca_cert_pem(issuer_cert_pem)
        .map_err(|e| IdentityError::CertGeneration(format!("bad issuer cert: {e}")))?;
    let issuer_cert = issuer_params
        .self_signed(&issuer_key)
        .map_err(|e| IdentityError::CertGeneration(format!("issuer reconstruction failed: {e}")))?;

    let mut params = base_params(common_name)?;
    params.is_ca = if is_ca {
        rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained)
    } else {
        rcgen::IsCa::NoCa
    };
    params.not_after = params.not_before + time::Duration::seconds(validity_seconds);

    let cert = params
        .signed_by(subject_keypair, &issuer_cert, &issuer_key)
        .map_err(|e| IdentityError::CertGeneration(format!("signing failed: {e}")))?;
    Ok(cert.pem())
}

/// Parsed fields used for chain verification and renewal decisions.
pub struct ParsedCert {
    pub is_ca: bool,
    pub not_after_epoch: i64,
    pub subject_cn: String,
    pub issuer_cn: String,
    pub public_key_id: String,
}

fn pem_to_der(pem_str: &str) -> Result<Vec<u8>, IdentityError> {
    let parsed =
        pem::parse(pem_str).map_err(|e| IdentityError::CertGeneration(format!("bad PEM: {e}")))?;
    Ok(parsed.contents().to_vec())
}

/// Fixed-width identifier for a certificate's public key: sha256 hex digest
/// of the DER-encoded `SubjectPublicKeyInfo`.
pub fn public_key_id(der: &[u8]) -> Result<String, IdentityError> {
    let (_, x509) = x509_parser::parse_x509_certificate(der)
        .map_err(|e| IdentityError::CertGeneration(format!("bad certificate DER: {e}")))?;
    let spki = x509.public_key().raw;
    let mut hasher = Sha256::new();
    hasher.update(spki);
    Ok(hasher.finalize().iter().map(|b| format!("{b:02x}")).collect())
}

pub fn parse_pem(pem_str: &str) -> Result<ParsedCert, IdentityError> {
    let der = pem_to_der(pem_str)?;
    let (_, x509) = x509_parser::parse_x509_certificate(&der)
        .map_err(|e| IdentityError::CertGeneration(format!("bad certificate DER: {e}")))?;
    let is_ca = x509
        .basic_constraints()
        .ok()
        .flatten()
        .map(|bc| bc.value.ca)
        .unwrap_or(false);
    let not_after_epoch = x509.validity().not_after.timestamp();
    let subject_cn = x509
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .unwrap_or_default()
        .to_string();
    let issuer_cn = x509
        .issuer()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .unwrap_or_default()
        .to_string();
    let public_key_id = public_key_id(&der)?;
    Ok(ParsedCert {
        is_ca,
        not_after_epoch,
        subject_cn,
        issuer_cn,
        public_key_id,
    })
}

/// Whether `cert` is unexpired as of `now_epoch`.
pub fn not_expired(cert: &ParsedCert, now_epoch: i64) -> bool {
    cert.not_after_epoch > now_epoch
}
