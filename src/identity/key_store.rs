use crate::identity::DeviceAddress;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use p256::ecdsa::signature::Signer;
use p256::ecdsa::{Signature, SigningKey};
use p256::pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rand::rngs::OsRng;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::OnceCell;
use tokio::task::JoinError;
use tokio::{fs, task};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReadDirStream;
use tracing::{debug, info, instrument, warn};

const KEY_EXTENSION: &str = "pem";
const SHARED_KEY_NAME: &str = "shared";
/// Marks an address that uses the shared key, so it is found again on the next run.
const ADDRESS_MARKER_EXTENSION: &str = "address";

/// Persists one PKCS#8 PEM file per device address, or a single file in shared-key mode.
#[derive(Debug, Clone)]
pub struct KeyStore {
    directory: PathBuf,
    shared: bool,
    shared_key: Arc<OnceCell<DeviceKey>>,
}

impl KeyStore {
    pub fn new(directory: impl Into<PathBuf>, shared: bool) -> Self {
        KeyStore {
            directory: directory.into(),
            shared,
            shared_key: Arc::new(OnceCell::new()),
        }
    }

    /// Loads the key persisted for `address`, generating and persisting one if there is none.
    #[instrument(skip(self), fields(mac = %address))]
    pub async fn acquire(&self, address: DeviceAddress) -> Result<DeviceKey, KeyError> {
        if self.shared {
            let key = self.shared_key.get_or_try_init(|| self.load_or_generate(address)).await.cloned()?;
            self.mark(address).await?;
            return Ok(key);
        }
        self.load_or_generate(address).await
    }

    async fn mark(&self, address: DeviceAddress) -> Result<(), KeyError> {
        let path = self.directory.join(format!("{}.{}", address.to_hex(), ADDRESS_MARKER_EXTENSION));
        fs::write(&path, address.to_string()).await.map_err(|source| KeyError::Io { source, path })
    }

    async fn load_or_generate(&self, address: DeviceAddress) -> Result<DeviceKey, KeyError> {
        let path = self.path_for(address);

        match fs::read_to_string(&path).await {
            Ok(pem) => {
                debug!("🔑 Loaded key from '{}'", path.display());
                return DeviceKey::from_pem(&pem).map_err(|source| KeyError::Malformed { source, path });
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(source) => return Err(KeyError::Io { source, path }),
        }

        let key = task::spawn_blocking(DeviceKey::generate).await?;
        let pem = key.to_pem()?;

        fs::create_dir_all(&self.directory).await.map_err(|source| KeyError::Io {
            source,
            path: self.directory.clone(),
        })?;
        fs::write(&path, pem.as_bytes()).await.map_err(|source| KeyError::Io { source, path: path.clone() })?;

        info!("🔑 Generated key '{}'", path.display());
        Ok(key)
    }

    /// Addresses of every device a previous run persisted a key or a shared-key marker for.
    #[instrument(skip(self))]
    pub async fn known_addresses(&self) -> Result<Vec<DeviceAddress>, KeyError> {
        let dir = match fs::read_dir(&self.directory).await {
            Ok(dir) => dir,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(KeyError::Io {
                    source,
                    path: self.directory.clone(),
                });
            }
        };

        let mut addresses = Vec::new();
        let mut entries = ReadDirStream::new(dir);
        while let Some(entry) = entries.next().await {
            match entry {
                Ok(entry) => {
                    let path = entry.path();
                    let extension = path.extension().and_then(|e| e.to_str());
                    if extension != Some(KEY_EXTENSION) && extension != Some(ADDRESS_MARKER_EXTENSION) {
                        continue;
                    }
                    if let Some(address) = path.file_stem().and_then(|stem| stem.to_str()).and_then(|stem| DeviceAddress::from_hex(stem).ok()) {
                        addresses.push(address);
                    }
                }
                Err(err) => warn!("⚠️ Unable to read key directory entry: {}", err),
            }
        }

        addresses.sort();
        addresses.dedup();
        Ok(addresses)
    }

    fn path_for(&self, address: DeviceAddress) -> PathBuf {
        let name = if self.shared { SHARED_KEY_NAME.to_string() } else { address.to_hex() };
        self.directory.join(format!("{}.{}", name, KEY_EXTENSION))
    }
}

/// An ECDSA P-256 keypair. Signatures are DER encoded over the SHA-256 digest of the message.
#[derive(Clone)]
pub struct DeviceKey {
    signing_key: SigningKey,
    public_key_pem: String,
}

impl DeviceKey {
    pub fn generate() -> Self {
        let signing_key = SigningKey::random(&mut OsRng);
        Self::from_signing_key(signing_key)
    }

    pub fn from_pem(pem: &str) -> Result<Self, p256::pkcs8::Error> {
        Ok(Self::from_signing_key(SigningKey::from_pkcs8_pem(pem)?))
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        // Encoding a valid point as SPKI cannot fail
        let public_key_pem = signing_key
            .verifying_key()
            .to_public_key_pem(LineEnding::LF)
            .unwrap_or_default();

        DeviceKey { signing_key, public_key_pem }
    }

    pub fn to_pem(&self) -> Result<String, KeyError> {
        let pem = self.signing_key.to_pkcs8_pem(LineEnding::LF)?;
        Ok(pem.as_str().to_owned())
    }

    pub fn public_key_pem(&self) -> &str {
        &self.public_key_pem
    }

    /// Signs `message` and returns the base64 encoded DER signature.
    pub fn sign(&self, message: &[u8]) -> String {
        let signature: Signature = self.signing_key.sign(message);
        BASE64.encode(signature.to_der().as_bytes())
    }
}

impl fmt::Debug for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceKey").field("public_key_pem", &self.public_key_pem).finish_non_exhaustive()
    }
}

#[derive(Error, Debug)]
pub enum KeyError {
    #[error("key store I/O failed for '{}': {}", path.display(), source)]
    Io { source: io::Error, path: PathBuf },
    #[error("malformed key '{}': {}", path.display(), source)]
    Malformed { source: p256::pkcs8::Error, path: PathBuf },
    #[error("could not encode key: {0}")]
    Encode(#[from] p256::pkcs8::Error),
    #[error(transparent)]
    JoinError(#[from] JoinError),
}
