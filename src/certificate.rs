//! Certificate store for SNI-driven TLS termination
//! Loads per-domain PEM pairs from a directory layout and hands them to rustls

use crate::proxy::Hooks;
use anyhow::{Context, Result};
use parking_lot::RwLock;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Once};
use tracing::{debug, warn};

/// Install the process-wide rustls crypto provider (ring). rustls refuses to
/// build a config without one; later calls are no-ops.
pub(crate) fn install_crypto_provider() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            warn!("A rustls crypto provider was already installed");
        }
    });
}

/// Mapping from root-domain name to a loaded TLS certificate.
///
/// The layout on disk is `{folder}/{domain}/{certificate_file}` plus the
/// matching key file. `reload` builds a complete new map and publishes it in
/// one assignment, so readers always see either the old or the new map.
pub struct CertificateStore {
    folder: PathBuf,
    certificate_file: String,
    key_file: String,
    certs: RwLock<Arc<HashMap<String, Arc<CertifiedKey>>>>,
    hooks: Hooks,
}

impl CertificateStore {
    pub fn new(
        folder: PathBuf,
        certificate_file: String,
        key_file: String,
        hooks: Hooks,
    ) -> Self {
        Self {
            folder,
            certificate_file,
            key_file,
            certs: RwLock::new(Arc::new(HashMap::new())),
            hooks,
        }
    }

    /// Rebuild the domain map from disk and swap it in atomically.
    ///
    /// Each immediate subdirectory of the certificates folder is one domain.
    /// A domain whose PEM pair fails to load is reported through the error
    /// hook and skipped; the reload continues. A missing folder yields an
    /// empty map. Returns the number of domains loaded.
    pub fn reload(&self) -> usize {
        let mut fresh: HashMap<String, Arc<CertifiedKey>> = HashMap::new();

        if let Ok(dir) = std::fs::read_dir(&self.folder) {
            for subdir in dir.flatten() {
                if !subdir.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                    continue;
                }
                let domain = subdir.file_name().to_string_lossy().into_owned();
                let cert_path = subdir.path().join(&self.certificate_file);
                let key_path = subdir.path().join(&self.key_file);

                match load_certified_key(&cert_path, &key_path) {
                    Ok(certified) => {
                        debug!("Loaded certificate for {}", domain);
                        fresh.insert(domain, Arc::new(certified));
                    }
                    Err(e) => {
                        let e = e.context(format!("loading certificate for {}", domain));
                        warn!("{:#}", e);
                        self.hooks.error(&e);
                    }
                }
            }
        }

        let loaded = fresh.len();
        *self.certs.write() = Arc::new(fresh);
        loaded
    }

    /// Look up the certificate for an SNI name, walking parent domains.
    ///
    /// `a.b.example.com` probes `a.b.example.com`, `b.example.com`,
    /// `example.com`, then `com`; the first hit wins, so the returned root is
    /// the longest configured suffix of the name.
    pub fn lookup(&self, sni_name: &str) -> Option<(String, Arc<CertifiedKey>)> {
        let snapshot = self.certs.read().clone();
        let labels: Vec<&str> = sni_name.split('.').collect();

        for start in 0..labels.len() {
            let candidate = labels[start..].join(".");
            if let Some(certified) = snapshot.get(&candidate) {
                return Some((candidate, certified.clone()));
            }
        }
        None
    }

    pub fn clear(&self) {
        *self.certs.write() = Arc::new(HashMap::new());
    }

    pub fn len(&self) -> usize {
        self.certs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.certs.read().is_empty()
    }
}

/// Read PEM certificates from a file.
fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("parsing certificates in {}", path.display()))?;
    if certs.is_empty() {
        anyhow::bail!("no certificates found in {}", path.display());
    }
    Ok(certs)
}

/// Read a PEM private key from a file.
fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .with_context(|| format!("parsing key in {}", path.display()))?
        .with_context(|| format!("no private key found in {}", path.display()))
}

fn load_certified_key(cert_path: &Path, key_path: &Path) -> Result<CertifiedKey> {
    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;
    let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)
        .map_err(|e| anyhow::anyhow!("unsupported private key in {}: {}", key_path.display(), e))?;
    Ok(CertifiedKey::new(certs, signing_key))
}

/// rustls certificate resolver backed by a [`CertificateStore`].
///
/// Handshakes without SNI, or with a name no loaded certificate covers, are
/// refused by returning `None`.
pub struct SniResolver {
    store: Arc<CertificateStore>,
}

impl SniResolver {
    pub fn new(store: Arc<CertificateStore>) -> Self {
        Self { store }
    }
}

impl fmt::Debug for SniResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SniResolver").finish_non_exhaustive()
    }
}

impl ResolvesServerCert for SniResolver {
    fn resolve(&self, client_hello: ClientHello) -> Option<Arc<CertifiedKey>> {
        let name = client_hello.server_name()?;
        match self.store.lookup(name) {
            Some((root, certified)) => {
                debug!("SNI {} resolved to certificate for {}", name, root);
                self.store.hooks.sni(&root);
                Some(certified)
            }
            None => {
                warn!("No certificate for SNI {}", name);
                None
            }
        }
    }
}
