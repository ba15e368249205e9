//! Nodes - network-addressable hosts running one trusted-execution technology
//!
//! A node is reached on two ports: the reactive port for Connect, Call and
//! RegisterEntrypoint, and the deploy port for Load. The technology
//! specific parts (image format, key provisioning, key wrapping) live in
//! the variant modules; everything else is shared here.

mod sancus;
mod sgx;
mod trustzone;

pub use sancus::{SancusNode, SetKeyResult};
pub use sgx::SgxNode;
pub use trustzone::{seal, GcmNonceMode, TrustZoneNode};

use crate::connection::{ConnectionIo, Encryption};
use crate::context::Context;
use crate::error::{Error, Result};
use crate::module::{EndpointRef, Module};
use crate::network::{CommandCode, CommandMessage, PayloadWriter, ResultMessage};
use futures::future::{BoxFuture, FutureExt};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

/// Technology-specific node data
#[derive(Debug)]
pub enum NodeKind {
    Sancus(SancusNode),
    Sgx(SgxNode),
    TrustZone(TrustZoneNode),
}

impl NodeKind {
    pub fn name(&self) -> &'static str {
        match self {
            NodeKind::Sancus(_) => "sancus",
            NodeKind::Sgx(_) => "sgx",
            NodeKind::TrustZone(_) => "trustzone",
        }
    }

    /// Event managers that cannot interleave commands get a per-node lock
    fn needs_lock(&self) -> bool {
        !matches!(self, NodeKind::Sgx(_))
    }
}

/// What a node hands back after loading a module
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Deployment {
    /// Node-assigned module id and the path of the returned symbol table
    Sancus { id: u16, symtab: PathBuf },
    Sgx,
    /// Module key decrypted from the provisioning blob
    TrustZone { key: Vec<u8> },
}

pub struct Node {
    pub name: String,
    pub ip_address: Ipv4Addr,
    pub reactive_port: u16,
    pub deploy_port: u16,
    pub kind: NodeKind,
    ctx: Arc<Context>,
    /// Next SetKey nonce per module on this node
    nonces: Mutex<HashMap<String, u32>>,
    lock: Option<tokio::sync::Mutex<()>>,
}

impl Node {
    pub fn new(
        name: impl Into<String>,
        ip_address: Ipv4Addr,
        reactive_port: u16,
        deploy_port: u16,
        kind: NodeKind,
        ctx: Arc<Context>,
    ) -> Self {
        let lock = kind.needs_lock().then(|| tokio::sync::Mutex::new(()));
        Self {
            name: name.into(),
            ip_address,
            reactive_port,
            deploy_port,
            kind,
            ctx,
            nonces: Mutex::new(HashMap::new()),
            lock,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        self.kind.name()
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    /// Node number used in TrustZone Connect payloads
    pub fn number(&self) -> u16 {
        match &self.kind {
            NodeKind::TrustZone(tz) => tz.number,
            _ => 0,
        }
    }

    /// Load a module; `None` when the module was already deployed
    ///
    /// Boxed: module stages call back into the loader, so the future type
    /// must be nameable without looking through the variants.
    pub fn deploy<'a>(
        &'a self,
        module: &'a Arc<Module>,
    ) -> BoxFuture<'a, Result<Option<Deployment>>> {
        async move {
            self.ensure_hosts(module)?;
            if module.is_deployed() {
                log::debug!("{} already deployed on {}", module.name, self.name);
                return Ok(None);
            }

            let deployment = match &self.kind {
                NodeKind::Sancus(node) => node.deploy(self, module).await?,
                NodeKind::Sgx(node) => node.deploy(self, module).await?,
                NodeKind::TrustZone(node) => node.deploy(self, module).await?,
            };
            Ok(Some(deployment))
        }
        .boxed()
    }

    /// Announce connection `conn_id` towards `to_module` (which may live elsewhere)
    pub async fn connect(&self, to_module: &Arc<Module>, conn_id: u16) -> Result<()> {
        let module_id = to_module.id().await?;
        let remote = &to_module.node;

        let mut payload = PayloadWriter::new();
        payload.put_u16(conn_id);
        self.put_module_id(&mut payload, module_id)?;
        match &self.kind {
            NodeKind::Sancus(_) => {
                // the event manager treats 0.0.0.0 as "this node"
                let address = if std::ptr::eq(remote.as_ref(), self) {
                    Ipv4Addr::UNSPECIFIED
                } else {
                    remote.ip_address
                };
                payload.put_u16(remote.reactive_port).put_bytes(&address.octets());
            }
            NodeKind::Sgx(_) => {
                payload
                    .put_u16(remote.reactive_port)
                    .put_bytes(&remote.ip_address.octets());
            }
            NodeKind::TrustZone(_) => {
                payload
                    .put_u16(remote.number())
                    .put_u16(remote.reactive_port)
                    .put_bytes(&remote.ip_address.octets());
            }
        }

        let command = self.command(CommandCode::Connect, payload.finish());
        self.send_command(
            command,
            format!("Connecting id {} to {}", conn_id, to_module.name),
        )
        .await?;
        Ok(())
    }

    /// Deliver a connection key to one endpoint of `module`, wrapped under the module key
    pub async fn set_key(
        &self,
        module: &Arc<Module>,
        conn_id: u16,
        io: &EndpointRef,
        encryption: Encryption,
        key: &[u8],
        direction: ConnectionIo,
    ) -> Result<()> {
        self.ensure_hosts(module)?;
        if !module.supports(encryption) {
            return Err(Error::ModuleEncryptionUnsupported {
                encryption: encryption.to_string(),
                module: module.name.clone(),
            });
        }

        match &self.kind {
            NodeKind::Sancus(node) => {
                node.set_key(self, module, conn_id, io, key, direction).await
            }
            NodeKind::Sgx(node) => {
                node.set_key(self, module, conn_id, io, encryption, key, direction)
                    .await
            }
            NodeKind::TrustZone(node) => {
                node.set_key(self, module, conn_id, io, encryption, key, direction)
                    .await
            }
        }
    }

    /// Invoke an entry point, optionally with an opaque argument
    pub async fn call(
        &self,
        module: &Arc<Module>,
        entry: &EndpointRef,
        arg: Option<&[u8]>,
    ) -> Result<()> {
        self.ensure_hosts(module)?;
        let (module_id, entry_id) = futures::join!(module.id(), module.entry_id(entry));
        let (module_id, entry_id) = (module_id?, entry_id?);

        let mut payload = PayloadWriter::new();
        self.put_module_id(&mut payload, module_id)?;
        payload.put_u16(entry_id).put_bytes(arg.unwrap_or_default());

        let command = self.command(CommandCode::Call, payload.finish());
        self.send_command(
            command,
            format!(
                "Sending call command to {}:{} ({}:{}) on {}",
                module.name, entry, module_id, entry_id, self.name
            ),
        )
        .await?;
        Ok(())
    }

    /// Ask the node to invoke `entry` every `frequency` milliseconds
    pub async fn register_entrypoint(
        &self,
        module: &Arc<Module>,
        entry: &EndpointRef,
        frequency: u32,
    ) -> Result<()> {
        self.ensure_hosts(module)?;
        let (module_id, entry_id) = futures::join!(module.id(), module.entry_id(entry));
        let (module_id, entry_id) = (module_id?, entry_id?);

        let mut payload = PayloadWriter::new();
        self.put_module_id(&mut payload, module_id)?;
        payload.put_u16(entry_id).put_u32(frequency);

        let command = self.command(CommandCode::RegisterEntrypoint, payload.finish());
        self.send_command(
            command,
            format!(
                "Sending RegisterEntrypoint command of {}:{} ({}:{}) on {}",
                module.name, entry, module_id, entry_id, self.name
            ),
        )
        .await?;
        Ok(())
    }

    // --- Shared plumbing ---

    pub(crate) fn command(&self, code: CommandCode, payload: Vec<u8>) -> CommandMessage {
        CommandMessage::new(code, payload, self.ip_address, self.reactive_port)
    }

    pub(crate) fn deploy_command(&self, payload: Vec<u8>) -> CommandMessage {
        CommandMessage::new(CommandCode::Load, payload, self.ip_address, self.deploy_port)
    }

    /// One command round trip, serialized on nodes that need it
    pub(crate) async fn send_command(
        &self,
        command: CommandMessage,
        description: String,
    ) -> Result<Option<ResultMessage>> {
        match &self.lock {
            Some(lock) => {
                let _guard = lock.lock().await;
                self.round_trip(&command, &description).await
            }
            None => self.round_trip(&command, &description).await,
        }
    }

    async fn round_trip(
        &self,
        command: &CommandMessage,
        description: &str,
    ) -> Result<Option<ResultMessage>> {
        log::info!("{}", description);

        if !command.has_response() {
            self.ctx.transport.send(command).await?;
            return Ok(None);
        }

        let response = self.ctx.transport.send_wait(command).await?;
        if !response.is_ok() {
            return Err(Error::CommandFailed {
                command: command.code.to_string(),
                code: response.code.to_string(),
            });
        }
        Ok(Some(response))
    }

    /// Next SetKey nonce for `module`: 0, 1, 2, ... never repeating
    pub(crate) fn next_nonce(&self, module: &str) -> Result<u16> {
        let mut nonces = self.nonces.lock().unwrap_or_else(PoisonError::into_inner);
        let next = nonces.entry(module.to_string()).or_insert(0);
        let nonce = u16::try_from(*next).map_err(|_| {
            Error::Protocol(format!("nonce space exhausted for {} on {}", module, self.name))
        })?;
        *next += 1;
        Ok(nonce)
    }

    /// Module ids are 16 bytes on TrustZone and 2 bytes elsewhere
    pub(crate) fn put_module_id(&self, payload: &mut PayloadWriter, id: u128) -> Result<()> {
        match &self.kind {
            NodeKind::TrustZone(_) => {
                payload.put_u128(id);
            }
            _ => {
                let id = u16::try_from(id).map_err(|_| {
                    Error::Protocol(format!("module id {} does not fit {} node {}", id, self.kind_name(), self.name))
                })?;
                payload.put_u16(id);
            }
        }
        Ok(())
    }

    fn ensure_hosts(&self, module: &Module) -> Result<()> {
        if std::ptr::eq(module.node.as_ref(), self) {
            Ok(())
        } else {
            Err(Error::Internal(format!(
                "module {} runs on {}, not on {}",
                module.name, module.node.name, self.name
            )))
        }
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("kind", &self.kind_name())
            .field("ip_address", &self.ip_address)
            .field("reactive_port", &self.reactive_port)
            .field("deploy_port", &self.deploy_port)
            .finish()
    }
}

/// Short fingerprint of an image for the debug log
pub(crate) fn fingerprint(bytes: &[u8]) -> String {
    hex::encode(&Sha256::digest(bytes)[..8])
}
