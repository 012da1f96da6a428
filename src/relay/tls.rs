//! TLS identity (C12): reuses an on-disk self-signed certificate if present,
//! otherwise generates one, and builds the rustls server config the control
//! channel listener accepts connections under.
//!
//! No mutual TLS: the relay authenticates agents at the application layer
//! (the `key` field of the `register` message), not via client certificates.

use std::fs;
use std::path::Path;

use rcgen::{generate_simple_self_signed, CertifiedKey};
use rustls::pki_types::CertificateDer;
use sha2::{Digest, Sha256};

pub const CERT_FILE: &str = "server.crt";
pub const KEY_FILE: &str = "server.key";

/// Certificate material plus its SHA-256 fingerprint, for logging on startup.
///
/// The key is kept as PEM bytes rather than a parsed `PrivateKeyDer` so a
/// fresh `rustls::ServerConfig` can be built from the same `Identity` more
/// than once without needing to clone an opaque key handle.
pub struct Identity {
    pub certs: Vec<CertificateDer<'static>>,
    key_pem: Vec<u8>,
    pub fingerprint: String,
}

/// Loads `server.crt`/`server.key` from `dir` if both exist, otherwise
/// generates a fresh self-signed certificate and writes them there.
pub fn load_or_generate(dir: &Path) -> anyhow::Result<Identity> {
    let cert_path = dir.join(CERT_FILE);
    let key_path = dir.join(KEY_FILE);

    let (cert_pem, key_pem) = if cert_path.exists() && key_path.exists() {
        tracing::info!(cert = %cert_path.display(), "reusing existing TLS certificate");
        (fs::read(&cert_path)?, fs::read(&key_path)?)
    } else {
        tracing::info!(cert = %cert_path.display(), "generating self-signed TLS certificate");
        let CertifiedKey { cert, signing_key } =
            generate_simple_self_signed(["localhost".to_string()])?;
        let cert_pem = cert.pem().into_bytes();
        let key_pem = signing_key.serialize_pem().into_bytes();
        fs::write(&cert_path, &cert_pem)?;
        fs::write(&key_path, &key_pem)?;
        (cert_pem, key_pem)
    };

    let certs = rustls_pemfile::certs(&mut cert_pem.as_slice())
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .map(CertificateDer::from)
        .collect::<Vec<_>>();
    let fingerprint = fingerprint_of(&certs[0]);

    // Parse once up front purely to fail fast on a malformed key file.
    rustls_pemfile::private_key(&mut key_pem.as_slice())?
        .ok_or_else(|| anyhow::anyhow!("no private key found in {}", key_path.display()))?;

    tracing::info!(fingerprint = %fingerprint, "TLS identity ready");
    Ok(Identity {
        certs,
        key_pem,
        fingerprint,
    })
}

fn fingerprint_of(cert: &CertificateDer<'_>) -> String {
    let digest = Sha256::digest(cert.as_ref());
    digest.iter().map(|b| format!("{b:02x}")).collect::<Vec<_>>().join(":")
}

/// Builds the rustls server config used to accept agent control connections.
pub fn server_config(identity: &Identity) -> anyhow::Result<rustls::ServerConfig> {
    let key = rustls_pemfile::private_key(&mut identity.key_pem.as_slice())?
        .ok_or_else(|| anyhow::anyhow!("no private key found in stored TLS identity"))?;
    let cfg = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(identity.certs.clone(), key)?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_and_then_reuses_a_certificate() {
        let dir = tempdir();
        let first = load_or_generate(&dir).unwrap();
        assert!(dir.join(CERT_FILE).exists());
        assert!(dir.join(KEY_FILE).exists());

        let second = load_or_generate(&dir).unwrap();
        assert_eq!(first.fingerprint, second.fingerprint);

        std::fs::remove_dir_all(&dir).ok();
    }

    fn tempdir() -> std::path::PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("tunnelrelay-tls-test-{}", std::process::id()));
        std::fs::create_dir_all(&p).unwrap();
        p
    }
}
