use super::{fingerprint, Deployment, Node};
use crate::connection::{ConnectionIo, Encryption};
use crate::error::{Error, Result};
use crate::module::{EndpointRef, Module};
use crate::network::{entry, CommandCode, PayloadWriter};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

/// An SGX host; its event manager accepts concurrent commands
#[derive(Debug)]
pub struct SgxNode {
    next_module_id: AtomicU16,
}

impl Default for SgxNode {
    fn default() -> Self {
        Self::new()
    }
}

impl SgxNode {
    pub fn new() -> Self {
        Self {
            next_module_id: AtomicU16::new(1),
        }
    }

    /// Hand out the next module id (ids start at 1)
    pub fn allocate_module_id(&self) -> Result<u16> {
        let id = self.next_module_id.fetch_add(1, Ordering::SeqCst);
        if id == 0 {
            return Err(Error::Config("SGX module ids exhausted".into()));
        }
        Ok(id)
    }

    /// Make sure freshly allocated ids never collide with `id`
    pub fn reserve_module_id(&self, id: u16) {
        self.next_module_id
            .fetch_max(id.saturating_add(1), Ordering::SeqCst);
    }

    /// Load: `len(sgxs)(4) || sgxs || len(sig)(4) || sig`
    pub(super) async fn deploy(&self, node: &Node, module: &Arc<Module>) -> Result<Deployment> {
        let (sgxs, sig) = module.signed_image().await?;
        let (image, signature) =
            futures::try_join!(read_file(&sgxs), read_file(&sig))?;
        log::debug!(
            "{} image {} ({} bytes, sha256 {})",
            module.name,
            sgxs.display(),
            image.len(),
            fingerprint(&image)
        );

        let mut payload = PayloadWriter::with_capacity(image.len() + signature.len() + 8);
        payload
            .put_u32(length(&image)?)
            .put_bytes(&image)
            .put_u32(length(&signature)?)
            .put_bytes(&signature);

        node.send_command(
            node.deploy_command(payload.finish()),
            format!("Deploying {} on {}", module.name, node.name),
        )
        .await?;
        Ok(Deployment::Sgx)
    }

    /// SetKey: the key is encrypted by the external encryptor under the
    /// attested module key, bound to `algo(1) || conn(2) || io(2) || nonce(2)`
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
        module.deploy().await?;
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

        let ctx = node.context();
        let args = vec![
            BASE64.encode(&ad),
            BASE64.encode(key),
            BASE64.encode(&module_key),
        ];
        let encryptor = &ctx.settings.sgx.encryptor;
        let out = ctx.runner.output(encryptor, &args).await?;
        let cipher = BASE64
            .decode(String::from_utf8_lossy(&out).trim())
            .map_err(|e| Error::ToolOutput {
                command: encryptor.clone(),
                reason: e.to_string(),
            })?;

        let mut payload = PayloadWriter::new();
        node.put_module_id(&mut payload, module_id)?;
        payload
            .put_u16(entry::SET_KEY)
            .put_bytes(&ad)
            .put_bytes(&cipher);

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

async fn read_file(path: &std::path::Path) -> Result<Vec<u8>> {
    Ok(tokio::fs::read(path).await?)
}

fn length(bytes: &[u8]) -> Result<u32> {
    u32::try_from(bytes.len()).map_err(|_| Error::Protocol("image exceeds 4 GiB".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{sgx_module, sgx_node, Harness, SGX_MODULE_KEY};

    #[test]
    fn test_module_ids_start_at_one() {
        let node = SgxNode::new();
        assert_eq!(node.allocate_module_id().unwrap(), 1);
        assert_eq!(node.allocate_module_id().unwrap(), 2);
        node.reserve_module_id(10);
        assert_eq!(node.allocate_module_id().unwrap(), 11);
        node.reserve_module_id(4);
        assert_eq!(node.allocate_module_id().unwrap(), 12);
    }

    #[tokio::test]
    async fn test_deploy_sends_image_and_signature() {
        let h = Harness::new();
        let node = sgx_node(&h, "x");
        let module = sgx_module(&h, "enclave", &node, 1);

        module.deploy().await.unwrap();
        assert!(module.is_deployed());

        let load = h.transport.sent_with(CommandCode::Load);
        assert_eq!(load.len(), 1);
        assert_eq!(load[0].port, node.deploy_port);
        let payload = &load[0].payload;
        let image_len = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]) as usize;
        assert_eq!(&payload[4..4 + image_len], b"sgxs");
        assert_eq!(&payload[8 + image_len..], b"sig");
    }

    #[tokio::test]
    async fn test_set_key_uses_encryptor() {
        let h = Harness::new();
        let node = sgx_node(&h, "x");
        let module = sgx_module(&h, "enclave", &node, 2);
        h.runner
            .set_output("sgx-encrypt", BASE64.encode([0xC1u8; 32]).as_bytes());

        node.set_key(
            &module,
            4,
            &EndpointRef::Name("in".into()),
            Encryption::Aes,
            &[0x11; 16],
            ConnectionIo::Input,
        )
        .await
        .unwrap();

        let encrypt = h
            .runner
            .calls()
            .into_iter()
            .find(|c| c.program == "sgx-encrypt")
            .unwrap();
        // algo, conn, io ("in" resolves to 5 in the generated map), nonce
        assert_eq!(encrypt.args[0], BASE64.encode([0u8, 0, 4, 0, 5, 0, 0]));
        assert_eq!(encrypt.args[2], BASE64.encode(SGX_MODULE_KEY));

        let calls = h.transport.sent_with(CommandCode::Call);
        let payload = &calls.last().unwrap().payload;
        assert_eq!(&payload[..4], &[0, 2, 0, 0]);
        assert_eq!(&payload[4..11], &[0, 0, 4, 0, 5, 0, 0]);
        assert_eq!(&payload[11..], &[0xC1; 32]);
    }
}
