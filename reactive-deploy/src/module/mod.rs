//! Software modules - trusted components deployed onto nodes
//!
//! Every expensive, side-effecting stage of a module's pipeline (build,
//! sign, load, key derivation) sits in a [`Memo`](crate::memo::Memo) so it
//! runs at most once per run no matter how many connections or calls
//! depend on it. Stages pull their own prerequisites: asking for a Sancus
//! module key builds, loads and links the module on demand.

mod sancus;
mod sgx;
mod trustzone;

pub use sancus::SancusModule;
pub use sgx::{SgxModule, SgxState};
pub use trustzone::TrustZoneModule;

use crate::connection::{ConnectionIo, Encryption};
use crate::context::Context;
use crate::error::{Error, Result};
use crate::node::Node;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// An input, output or entry point, by numeric id or by name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EndpointRef {
    Id(u16),
    Name(String),
}

impl EndpointRef {
    /// All-digit names count as ids
    pub fn parse(text: &str) -> Self {
        match text.parse::<u16>() {
            Ok(id) => EndpointRef::Id(id),
            Err(_) => EndpointRef::Name(text.to_string()),
        }
    }

    pub fn as_id(&self) -> Option<u16> {
        match self {
            EndpointRef::Id(id) => Some(*id),
            EndpointRef::Name(name) => name.parse().ok(),
        }
    }
}

impl fmt::Display for EndpointRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointRef::Id(id) => write!(f, "{}", id),
            EndpointRef::Name(name) => f.write_str(name),
        }
    }
}

pub type EndpointMap = BTreeMap<String, u16>;

/// Name to id maps of a module's endpoints
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Endpoints {
    pub inputs: EndpointMap,
    pub outputs: EndpointMap,
    pub entrypoints: EndpointMap,
}

impl Endpoints {
    pub fn io(&self, direction: ConnectionIo) -> &EndpointMap {
        match direction {
            ConnectionIo::Input => &self.inputs,
            ConnectionIo::Output => &self.outputs,
        }
    }
}

/// Technology-specific module data
#[derive(Debug)]
pub enum ModuleKind {
    Sancus(SancusModule),
    Sgx(SgxModule),
    TrustZone(TrustZoneModule),
}

impl ModuleKind {
    pub fn name(&self) -> &'static str {
        match self {
            ModuleKind::Sancus(_) => "sancus",
            ModuleKind::Sgx(_) => "sgx",
            ModuleKind::TrustZone(_) => "trustzone",
        }
    }

    pub fn supported_encryption(&self) -> &'static [Encryption] {
        match self {
            ModuleKind::Sancus(_) => &[Encryption::Spongent],
            ModuleKind::Sgx(_) | ModuleKind::TrustZone(_) => {
                &[Encryption::Aes, Encryption::Spongent]
            }
        }
    }
}

pub struct Module {
    pub name: String,
    pub node: Arc<Node>,
    /// Modules with a priority are deployed first, lowest value first
    pub priority: Option<u32>,
    pub kind: ModuleKind,
    deployed: AtomicBool,
    connections: AtomicUsize,
}

impl Module {
    pub fn new(
        name: impl Into<String>,
        node: Arc<Node>,
        priority: Option<u32>,
        deployed: bool,
        kind: ModuleKind,
    ) -> Self {
        Self {
            name: name.into(),
            node,
            priority,
            kind,
            deployed: AtomicBool::new(deployed),
            connections: AtomicUsize::new(0),
        }
    }

    pub fn kind_name(&self) -> &'static str {
        self.kind.name()
    }

    pub fn context(&self) -> &Arc<Context> {
        self.node.context()
    }

    pub fn is_deployed(&self) -> bool {
        self.deployed.load(Ordering::SeqCst)
    }

    fn mark_deployed(&self) {
        self.deployed.store(true, Ordering::SeqCst);
    }

    /// Number of connections this module takes part in
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub(crate) fn add_connection(&self) {
        self.connections.fetch_add(1, Ordering::SeqCst);
    }

    pub fn supported_encryption(&self) -> &'static [Encryption] {
        self.kind.supported_encryption()
    }

    pub fn supports(&self, encryption: Encryption) -> bool {
        self.supported_encryption().contains(&encryption)
    }

    pub(crate) fn sancus(&self) -> Result<&SancusModule> {
        match &self.kind {
            ModuleKind::Sancus(m) => Ok(m),
            _ => Err(self.wrong_kind("sancus")),
        }
    }

    pub(crate) fn sgx(&self) -> Result<&SgxModule> {
        match &self.kind {
            ModuleKind::Sgx(m) => Ok(m),
            _ => Err(self.wrong_kind("sgx")),
        }
    }

    pub(crate) fn trustzone(&self) -> Result<&TrustZoneModule> {
        match &self.kind {
            ModuleKind::TrustZone(m) => Ok(m),
            _ => Err(self.wrong_kind("trustzone")),
        }
    }

    fn wrong_kind(&self, expected: &str) -> Error {
        Error::Internal(format!(
            "{} is a {} module, not {}",
            self.name,
            self.kind_name(),
            expected
        ))
    }

    pub(crate) fn endpoint_not_found(&self, endpoint: &str) -> Error {
        Error::EndpointNotFound {
            module: self.name.clone(),
            endpoint: endpoint.to_string(),
        }
    }

    /// Build (if needed) and load the module on its node, at most once
    pub async fn deploy(self: &Arc<Self>) -> Result<()> {
        match &self.kind {
            ModuleKind::Sancus(m) => m.deployment(self).await.map(|_| ()),
            ModuleKind::Sgx(m) => m.deployment(self).await,
            ModuleKind::TrustZone(m) => m.deployment(self).await.map(|_| ()),
        }
    }

    /// Module id as used in payloads (2 bytes on Sancus and SGX, 16 on TrustZone)
    pub async fn id(self: &Arc<Self>) -> Result<u128> {
        match &self.kind {
            ModuleKind::Sancus(m) => m.deployment(self).await.map(|(id, _)| u128::from(id)),
            ModuleKind::Sgx(m) => Ok(u128::from(m.id)),
            ModuleKind::TrustZone(m) => Ok(m.id),
        }
    }

    /// The module key shared with the trusted module
    pub async fn key(self: &Arc<Self>) -> Result<Vec<u8>> {
        match &self.kind {
            ModuleKind::Sancus(m) => m.key(self).await,
            ModuleKind::Sgx(m) => m.key(self).await,
            ModuleKind::TrustZone(m) => m.deployment(self).await,
        }
    }

    /// Path of the built module image
    pub async fn binary(self: &Arc<Self>) -> Result<PathBuf> {
        match &self.kind {
            ModuleKind::Sancus(m) => m.binary(self).await,
            ModuleKind::Sgx(m) => m.binary(self).await,
            ModuleKind::TrustZone(m) => m.binary(self).await,
        }
    }

    /// SGX images ready for loading: (sgxs, signature)
    pub async fn signed_image(self: &Arc<Self>) -> Result<(PathBuf, PathBuf)> {
        self.sgx()?.signed(self).await
    }

    pub async fn input_id(self: &Arc<Self>, input: &EndpointRef) -> Result<u16> {
        self.io_id(input, ConnectionIo::Input).await
    }

    pub async fn output_id(self: &Arc<Self>, output: &EndpointRef) -> Result<u16> {
        self.io_id(output, ConnectionIo::Output).await
    }

    pub async fn io_id(self: &Arc<Self>, io: &EndpointRef, direction: ConnectionIo) -> Result<u16> {
        if let Some(id) = io.as_id() {
            return Ok(id);
        }
        let name = io.to_string();
        let id = match &self.kind {
            ModuleKind::Sancus(m) => m.io_id(self, &name).await?,
            ModuleKind::Sgx(m) => m.endpoints(self).await?.io(direction).get(&name).copied(),
            ModuleKind::TrustZone(m) => m.endpoints.io(direction).get(&name).copied(),
        };
        id.ok_or_else(|| self.endpoint_not_found(&name))
    }

    pub async fn entry_id(self: &Arc<Self>, entry: &EndpointRef) -> Result<u16> {
        if let Some(id) = entry.as_id() {
            return Ok(id);
        }
        let name = entry.to_string();
        let id = match &self.kind {
            ModuleKind::Sancus(m) => m.entry_id(self, &name).await?,
            ModuleKind::Sgx(m) => m.endpoints(self).await?.entrypoints.get(&name).copied(),
            ModuleKind::TrustZone(m) => m.endpoints.entrypoints.get(&name).copied(),
        };
        id.ok_or_else(|| self.endpoint_not_found(&name))
    }

    /// Invoke one of the module's entry points through its node
    pub async fn call(self: &Arc<Self>, entry: &EndpointRef, arg: Option<&[u8]>) -> Result<()> {
        self.node.call(self, entry, arg).await
    }

    /// Load through the node and remember that it happened
    async fn load(self: &Arc<Self>) -> Result<Option<crate::node::Deployment>> {
        let deployment = self.node.deploy(self).await?;
        self.mark_deployed();
        Ok(deployment)
    }
}

impl fmt::Debug for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Module")
            .field("name", &self.name)
            .field("node", &self.node.name)
            .field("priority", &self.priority)
            .field("deployed", &self.is_deployed())
            .field("kind", &self.kind)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{sgx_module, sgx_node, trustzone_module, trustzone_node, Harness};

    #[test]
    fn test_endpoint_ref_parsing() {
        assert_eq!(EndpointRef::parse("12"), EndpointRef::Id(12));
        assert_eq!(EndpointRef::parse("out"), EndpointRef::Name("out".into()));
        assert_eq!(EndpointRef::Name("3".into()).as_id(), Some(3));

        let refs: Vec<EndpointRef> = serde_json::from_str(r#"[4, "in"]"#).unwrap();
        assert_eq!(refs, vec![EndpointRef::Id(4), EndpointRef::Name("in".into())]);
    }

    #[tokio::test]
    async fn test_unknown_endpoint_names_module() {
        let h = Harness::new();
        let node = trustzone_node(&h, "tz", 1);
        let module = trustzone_module(&h, "ta", &node, 9);

        let err = module
            .entry_id(&EndpointRef::Name("missing".into()))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Module ta has no endpoint named missing");
        assert_eq!(module.input_id(&EndpointRef::Name("in".into())).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_sgx_endpoints_come_from_codegen() {
        let h = Harness::new();
        let node = sgx_node(&h, "x");
        let module = sgx_module(&h, "enclave", &node, 1);

        assert_eq!(module.input_id(&EndpointRef::Name("in".into())).await.unwrap(), 5);
        assert_eq!(module.output_id(&EndpointRef::Name("out".into())).await.unwrap(), 6);
        assert_eq!(module.entry_id(&EndpointRef::Name("init".into())).await.unwrap(), 7);
        assert_eq!(h.runner.count("rust-sgx-gen"), 1);
    }

    #[test]
    fn test_supported_encryption() {
        let h = Harness::new();
        let node = sgx_node(&h, "x");
        let module = sgx_module(&h, "enclave", &node, 1);
        assert!(module.supports(Encryption::Aes));
        assert!(module.supports(Encryption::Spongent));
    }
}
