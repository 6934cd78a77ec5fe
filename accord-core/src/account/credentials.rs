//! Authentication credential schemes passed to `initAuthentication`.

use crate::identity::CertificateChain;

/// How a caller authenticates an account operation.
#[derive(Debug, Clone)]
pub enum Credentials {
    /// Load an archive from a local path.
    File { path: String, password: Option<String> },
    /// Link as a new device using a `jami-auth://` token from a source
    /// device.
    P2p { token: String },
    /// Create or import using a password, optionally re-signing an
    /// already-loaded identity during migration.
    Password {
        password: String,
        existing_identity: Option<CertificateChain>,
    },
    /// Provision through a trusted HTTP server that signs the device.
    Server { username: String, password: String },
}

impl Credentials {
    pub fn scheme_name(&self) -> &'static str {
        match self {
            Credentials::File { .. } => "file",
            Credentials::P2p { .. } => "p2p",
            Credentials::Password { .. } => "password",
            Credentials::Server { .. } => "server",
        }
    }
}
