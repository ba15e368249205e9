use super::{fingerprint, Deployment, Node};
use crate::connection::ConnectionIo;
use crate::error::{Error, Result};
use crate::module::{EndpointRef, Module};
use crate::network::{entry, read_u16, CommandCode, PayloadWriter};
use std::fmt;
use std::sync::Arc;

/// Status word a Sancus module puts in front of its SetKey tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetKeyResult {
    Ok,
    IllegalConnection,
    MalformedPayload,
    InternalError,
    Unknown(u16),
}

impl SetKeyResult {
    pub fn from_u16(code: u16) -> Self {
        match code {
            0 => SetKeyResult::Ok,
            1 => SetKeyResult::IllegalConnection,
            2 => SetKeyResult::MalformedPayload,
            3 => SetKeyResult::InternalError,
            other => SetKeyResult::Unknown(other),
        }
    }
}

impl fmt::Display for SetKeyResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SetKeyResult::Unknown(code) => write!(f, "Unknown({})", code),
            other => fmt::Debug::fmt(other, f),
        }
    }
}

/// A Sancus-enabled microcontroller
#[derive(Clone)]
pub struct SancusNode {
    pub vendor_id: u16,
    /// Long-term vendor key, input to module key derivation
    pub vendor_key: Vec<u8>,
}

impl fmt::Debug for SancusNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SancusNode")
            .field("vendor_id", &self.vendor_id)
            .finish_non_exhaustive()
    }
}

impl SancusNode {
    pub fn new(vendor_id: u16, vendor_key: Vec<u8>) -> Self {
        Self {
            vendor_id,
            vendor_key,
        }
    }

    /// Load: `name || 0 || vendor_id(2) || elf`, answered by `sm_id(2) || symtab`
    pub(super) async fn deploy(&self, node: &Node, module: &Arc<Module>) -> Result<Deployment> {
        let binary = module.binary().await?;
        let image = tokio::fs::read(&binary).await?;
        log::debug!(
            "{} image {} ({} bytes, sha256 {})",
            module.name,
            binary.display(),
            image.len(),
            fingerprint(&image)
        );

        let mut payload = PayloadWriter::with_capacity(module.name.len() + image.len() + 3);
        payload
            .put_bytes(module.name.as_bytes())
            .put_u8(0)
            .put_u16(self.vendor_id)
            .put_bytes(&image);

        let response = node
            .send_command(
                node.deploy_command(payload.finish()),
                format!("Deploying {} on {}", module.name, node.name),
            )
            .await?
            .ok_or_else(|| Error::Protocol("Load produced no response".into()))?;

        let sm_id = read_u16(&response.payload, 0)?;
        if sm_id == 0 {
            return Err(Error::Protocol(format!(
                "Deploying {} on {} failed",
                module.name, node.name
            )));
        }

        // the table is NUL terminated
        let table = &response.payload[2..];
        let table = &table[..table.len().saturating_sub(1)];
        let symtab = node
            .context()
            .module_dir(&module.name)?
            .join(format!("{}.ld", module.name));
        tokio::fs::write(&symtab, table).await?;
        log::debug!("Symbol table of {} written to {}", module.name, symtab.display());

        Ok(Deployment::Sancus { id: sm_id, symtab })
    }

    /// SetKey through the module's reserved entry point; the reply is
    /// `result(2) || tag` with tag = MAC(module key, nonce || result)
    pub(super) async fn set_key(
        &self,
        node: &Node,
        module: &Arc<Module>,
        conn_id: u16,
        io: &EndpointRef,
        key: &[u8],
        direction: ConnectionIo,
    ) -> Result<()> {
        let (module_id, module_key, io_id) = futures::join!(
            module.id(),
            module.key(),
            module.io_id(io, direction)
        );
        let (module_id, module_key, io_id) = (module_id?, module_key?, io_id?);
        let module_id = u16::try_from(module_id)
            .map_err(|_| Error::Protocol(format!("module id {} out of range", module_id)))?;

        let nonce = node.next_nonce(&module.name)?;
        let mut ad = PayloadWriter::new();
        ad.put_u16(conn_id).put_u16(io_id).put_u16(nonce);
        let ad = ad.finish();

        let crypto = &node.context().sancus_crypto;
        let (cipher, tag) = crypto.wrap(&module_key, &ad, key).await?;

        let mut payload = PayloadWriter::new();
        payload
            .put_u16(module_id)
            .put_u16(entry::SET_KEY)
            .put_bytes(&ad)
            .put_bytes(&cipher)
            .put_bytes(&tag);

        let response = node
            .send_command(
                node.command(CommandCode::Call, payload.finish()),
                format!(
                    "Sending SetKey command to {}:{} on {}",
                    module.name, io, node.name
                ),
            )
            .await?
            .ok_or_else(|| Error::Protocol("SetKey produced no response".into()))?;

        let code = read_u16(&response.payload, 0)?;
        let result = SetKeyResult::from_u16(code);
        if result != SetKeyResult::Ok {
            return Err(Error::SetKeyRejected {
                module: module.name.clone(),
                code: result.to_string(),
            });
        }

        let mut expected = PayloadWriter::new();
        expected.put_u16(nonce).put_u16(code);
        let expected = crypto.mac(&module_key, &expected.finish()).await?;
        if response.payload[2..] != expected[..] {
            return Err(Error::TagMismatch(module.name.clone()));
        }

        log::info!("Connection key of {}:{} accepted", module.name, io);
        Ok(())
    }
}
