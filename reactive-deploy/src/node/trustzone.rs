use super::{fingerprint, Deployment, Node};
use crate::connection::{ConnectionIo, Encryption};
use crate::error::{Error, Result};
use crate::module::{EndpointRef, Module};
use crate::network::{entry, CommandCode, PayloadWriter};
use aes_gcm::aead::consts::U16;
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::aes::{Aes128, Aes192, Aes256};
use aes_gcm::{AesGcm, Nonce};
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// AES-GCM with the 16-byte nonce OP-TEE's SetKey handler expects
type Aes128Gcm16 = AesGcm<Aes128, U16>;
type Aes192Gcm16 = AesGcm<Aes192, U16>;
type Aes256Gcm16 = AesGcm<Aes256, U16>;

/// How the SetKey GCM nonce is chosen
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GcmNonceMode {
    /// All-zero nonce, what deployed trusted applications decrypt with
    #[default]
    Zero,
    /// Nonce carries the per-module SetKey counter, unique per module key
    Counter,
}

impl GcmNonceMode {
    fn nonce(self, counter: u16) -> [u8; 16] {
        let mut nonce = [0u8; 16];
        if self == GcmNonceMode::Counter {
            nonce[14..].copy_from_slice(&counter.to_be_bytes());
        }
        nonce
    }
}

/// An OP-TEE device
pub struct TrustZoneNode {
    pub number: u16,
    pub key_path: PathBuf,
    pub gcm_nonce: GcmNonceMode,
    private_key: RsaPrivateKey,
    warned: AtomicBool,
}

impl fmt::Debug for TrustZoneNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrustZoneNode")
            .field("number", &self.number)
            .field("key_path", &self.key_path)
            .field("gcm_nonce", &self.gcm_nonce)
            .finish_non_exhaustive()
    }
}

impl TrustZoneNode {
    pub fn new(number: u16, key_path: PathBuf, private_key: RsaPrivateKey, gcm_nonce: GcmNonceMode) -> Self {
        Self {
            number,
            key_path,
            gcm_nonce,
            private_key,
            warned: AtomicBool::new(false),
        }
    }

    /// Read the node's RSA private key (PKCS#1 or PKCS#8 PEM)
    pub fn load(number: u16, key_path: &Path, gcm_nonce: GcmNonceMode) -> Result<Self> {
        let pem = std::fs::read_to_string(key_path)?;
        let private_key = RsaPrivateKey::from_pkcs1_pem(&pem)
            .or_else(|_| RsaPrivateKey::from_pkcs8_pem(&pem))
            .map_err(|e| Error::InvalidKey(format!("{}: {}", key_path.display(), e)))?;
        Ok(Self::new(number, key_path.to_path_buf(), private_key, gcm_nonce))
    }

    /// Load: `uuid(16) || ta`; the answer is the module key, RSA encrypted
    /// to this node's public key
    pub(super) async fn deploy(&self, node: &Node, module: &Arc<Module>) -> Result<Deployment> {
        let module_id = module.id().await?;
        let binary = module.binary().await?;
        let image = tokio::fs::read(&binary).await?;
        log::debug!(
            "{} image {} ({} bytes, sha256 {})",
            module.name,
            binary.display(),
            image.len(),
            fingerprint(&image)
        );

        let mut payload = PayloadWriter::with_capacity(image.len() + 16);
        payload.put_u128(module_id).put_bytes(&image);

        let response = node
            .send_command(
                node.deploy_command(payload.finish()),
                format!("Deploying {} on {}", module.name, node.name),
            )
            .await?
            .ok_or_else(|| Error::Protocol("Load produced no response".into()))?;

        let key = self.decrypt_module_key(&response.payload)?;
        log::debug!("Received module key of {}", module.name);
        Ok(Deployment::TrustZone { key })
    }

    pub fn decrypt_module_key(&self, blob: &[u8]) -> Result<Vec<u8>> {
        self.private_key
            .decrypt(Pkcs1v15Encrypt, blob)
            .map_err(|e| Error::Protocol(format!("cannot decrypt module key: {}", e)))
    }

    /// SetKey: AES-GCM under the module key, AD `algo(1) || conn(2) || io(2) || nonce(2)`
    #[allow(clippy::too_many_arguments)]
    pub(super) async fn set_key(
        &self,
        node: &Node,
        module: &Arc<Module>,
        conn_id: u16,
        io: &EndpointRef,
        encryption: Encryption,
        key: &[u8],
        direction: ConnectionIo,
    ) -> Result<()> {
        let (module_id, module_key, io_id) = futures::join!(
            module.id(),
            module.key(),
            module.io_id(io, direction)
        );
        let (module_id, module_key, io_id) = (module_id?, module_key?, io_id?);

        let nonce = node.next_nonce(&module.name)?;
        let mut ad = PayloadWriter::new();
        ad.put_u8(encryption.id())
            .put_u16(conn_id)
            .put_u16(io_id)
            .put_u16(nonce);
        let ad = ad.finish();

        if self.gcm_nonce == GcmNonceMode::Zero && !self.warned.swap(true, Ordering::Relaxed) {
            log::warn!(
                "{}: SetKey uses a fixed all-zero GCM nonce under each module key",
                node.name
            );
        }
        let sealed = seal(&module_key, &self.gcm_nonce.nonce(nonce), &ad, key)?;

        let mut payload = PayloadWriter::new();
        payload
            .put_u128(module_id)
            .put_u16(entry::SET_KEY)
            .put_bytes(&ad)
            .put_bytes(&sealed);

        node.send_command(
            node.command(CommandCode::Call, payload.finish()),
            format!(
                "Sending SetKey command to {}:{} on {}",
                module.name, io, node.name
            ),
        )
        .await?;
        Ok(())
    }
}

/// AES-GCM encrypt, returning `ciphertext || tag(16)`
pub fn seal(key: &[u8], nonce: &[u8; 16], ad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    let nonce = Nonce::<U16>::from_slice(nonce);
    let payload = Payload {
        msg: plaintext,
        aad: ad,
    };
    let sealed = match key.len() {
        16 => Aes128Gcm16::new_from_slice(key)
            .map_err(|e| Error::InvalidKey(e.to_string()))?
            .encrypt(nonce, payload),
        24 => Aes192Gcm16::new_from_slice(key)
            .map_err(|e| Error::InvalidKey(e.to_string()))?
            .encrypt(nonce, payload),
        32 => Aes256Gcm16::new_from_slice(key)
            .map_err(|e| Error::InvalidKey(e.to_string()))?
            .encrypt(nonce, payload),
        n => return Err(Error::InvalidKey(format!("module key of {} bytes", n))),
    };
    sealed.map_err(|_| Error::Internal("AES-GCM encryption failed".into()))
}
