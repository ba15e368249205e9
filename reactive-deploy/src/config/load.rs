use super::Config;
use crate::connection::{Connection, Encryption};
use crate::context::Context;
use crate::error::{Error, Result};
use crate::module::{
    EndpointMap, EndpointRef, Endpoints, Module, ModuleKind, SancusModule, SgxModule, SgxState,
    TrustZoneModule,
};
use crate::node::{GcmNonceMode, Node, NodeKind, SancusNode, SgxNode, TrustZoneNode};
use crate::periodic_event::PeriodicEvent;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

type NodeLoader = fn(&Loader, Value) -> Result<Node>;
type ModuleLoader = fn(&Loader, Value) -> Result<Module>;

const NODE_LOADERS: &[(&str, NodeLoader)] = &[
    ("sancus", Loader::sancus_node),
    ("sgx", Loader::sgx_node),
    ("trustzone", Loader::trustzone_node),
];

const MODULE_LOADERS: &[(&str, ModuleLoader)] = &[
    ("sancus", Loader::sancus_module),
    ("sgx", Loader::sgx_module),
    ("trustzone", Loader::trustzone_module),
];

#[derive(Deserialize)]
struct Document {
    #[serde(default)]
    nodes: Option<Vec<Value>>,
    #[serde(default)]
    modules: Option<Vec<Value>>,
    #[serde(default)]
    connections: Option<Vec<ConnectionDecl>>,
    #[serde(default, rename = "periodic-events")]
    periodic_events: Option<Vec<PeriodicEventDecl>>,
}

#[derive(Deserialize)]
struct NodeCommon {
    name: String,
    ip_address: Ipv4Addr,
    reactive_port: u16,
    deploy_port: Option<u16>,
}

#[derive(Deserialize)]
struct SancusNodeDecl {
    #[serde(flatten)]
    common: NodeCommon,
    vendor_id: u16,
    vendor_key: String,
}

#[derive(Deserialize)]
struct SgxNodeDecl {
    #[serde(flatten)]
    common: NodeCommon,
}

#[derive(Deserialize)]
struct TrustZoneNodeDecl {
    #[serde(flatten)]
    common: NodeCommon,
    number: u16,
    private_key: PathBuf,
    #[serde(default)]
    gcm_nonce: GcmNonceMode,
}

#[derive(Deserialize)]
struct ModuleCommon {
    name: String,
    node: String,
    priority: Option<u32>,
    deployed: Option<bool>,
}

#[derive(Deserialize)]
struct SancusModuleDecl {
    #[serde(flatten)]
    common: ModuleCommon,
    files: Vec<PathBuf>,
    #[serde(default)]
    cflags: Vec<String>,
    #[serde(default)]
    ldflags: Vec<String>,
    binary: Option<PathBuf>,
    id: Option<u16>,
    symtab: Option<PathBuf>,
    key: Option<String>,
}

#[derive(Deserialize)]
struct SgxModuleDecl {
    #[serde(flatten)]
    common: ModuleCommon,
    source: Option<PathBuf>,
    vendor_key: PathBuf,
    ra_settings: PathBuf,
    #[serde(default)]
    features: Vec<String>,
    id: Option<u16>,
    binary: Option<PathBuf>,
    sgxs: Option<PathBuf>,
    signature: Option<PathBuf>,
    key: Option<String>,
    inputs: Option<EndpointMap>,
    outputs: Option<EndpointMap>,
    entrypoints: Option<EndpointMap>,
}

#[derive(Deserialize)]
struct TrustZoneModuleDecl {
    #[serde(flatten)]
    common: ModuleCommon,
    files: PathBuf,
    id: ModuleUuid,
    binary: Option<PathBuf>,
    key: Option<String>,
    #[serde(default)]
    inputs: EndpointMap,
    #[serde(default)]
    outputs: EndpointMap,
    #[serde(default)]
    entrypoints: EndpointMap,
}

/// TrustZone ids: a JSON integer, or a string holding a UUID, hex (`0x..`)
/// or decimal number for ids beyond 64 bits
#[derive(Deserialize)]
#[serde(untagged)]
enum ModuleUuid {
    Number(u64),
    Text(String),
}

impl ModuleUuid {
    fn value(&self) -> Result<u128> {
        match self {
            ModuleUuid::Number(n) => Ok(u128::from(*n)),
            ModuleUuid::Text(text) => {
                let parsed = if let Some(hex) = text.strip_prefix("0x") {
                    u128::from_str_radix(hex, 16).ok()
                } else if text.contains('-') {
                    uuid::Uuid::parse_str(text).ok().map(|u| u.as_u128())
                } else {
                    text.parse().ok()
                };
                parsed.ok_or_else(|| Error::Config(format!("invalid module id '{}'", text)))
            }
        }
    }
}

#[derive(Deserialize)]
struct ConnectionDecl {
    from_module: String,
    from_output: EndpointRef,
    to_module: String,
    to_input: EndpointRef,
    encryption: String,
    key: Option<String>,
}

#[derive(Deserialize)]
struct PeriodicEventDecl {
    module: String,
    entry: EndpointRef,
    frequency: u64,
}

pub(super) struct Loader {
    base_dir: PathBuf,
    ctx: Arc<Context>,
    nodes: Vec<Arc<Node>>,
    modules: Vec<Arc<Module>>,
}

impl Loader {
    pub(super) fn new(base_dir: &Path, ctx: Arc<Context>) -> Self {
        Self {
            base_dir: base_dir.to_path_buf(),
            ctx,
            nodes: Vec::new(),
            modules: Vec::new(),
        }
    }

    pub(super) fn load(mut self, document: Value) -> Result<Config> {
        let document: Document = serde_json::from_value(document)?;

        let mut names = HashSet::new();
        for value in document.nodes.unwrap_or_default() {
            let loader = dispatch(NODE_LOADERS, "node", &value)?;
            let node = loader(&self, value)?;
            if !names.insert(node.name.clone()) {
                return Err(Error::DuplicateName {
                    what: "node",
                    name: node.name,
                });
            }
            self.nodes.push(Arc::new(node));
        }

        let modules = document.modules.unwrap_or_default();
        self.reserve_sgx_ids(&modules);

        let mut names = HashSet::new();
        for value in modules {
            let loader = dispatch(MODULE_LOADERS, "module", &value)?;
            let module = loader(&self, value)?;
            check_module_name(&module.name)?;
            if !names.insert(module.name.clone()) {
                return Err(Error::DuplicateName {
                    what: "module",
                    name: module.name,
                });
            }
            self.modules.push(Arc::new(module));
        }

        let connections = document
            .connections
            .unwrap_or_default()
            .into_iter()
            .map(|decl| self.connection(decl).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;

        let periodic_events = document
            .periodic_events
            .unwrap_or_default()
            .into_iter()
            .map(|decl| {
                let module = self.module(&decl.module)?.clone();
                PeriodicEvent::new(module, decl.entry, decl.frequency).map(Arc::new)
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Config {
            path: None,
            nodes: self.nodes,
            modules: self.modules,
            connections,
            periodic_events,
            ctx: self.ctx,
        })
    }

    // --- Nodes ---

    fn node_base(&self, common: NodeCommon, kind: NodeKind) -> Node {
        let deploy_port = common.deploy_port.unwrap_or(common.reactive_port);
        Node::new(
            common.name,
            common.ip_address,
            common.reactive_port,
            deploy_port,
            kind,
            self.ctx.clone(),
        )
    }

    fn sancus_node(&self, value: Value) -> Result<Node> {
        let decl: SancusNodeDecl = parse(value)?;
        let vendor_key = parse_key(&decl.vendor_key)?;
        Ok(self.node_base(
            decl.common,
            NodeKind::Sancus(SancusNode::new(decl.vendor_id, vendor_key)),
        ))
    }

    fn sgx_node(&self, value: Value) -> Result<Node> {
        let decl: SgxNodeDecl = parse(value)?;
        Ok(self.node_base(decl.common, NodeKind::Sgx(SgxNode::new())))
    }

    fn trustzone_node(&self, value: Value) -> Result<Node> {
        let decl: TrustZoneNodeDecl = parse(value)?;
        let key_path = self.resolve(&decl.private_key);
        let node = TrustZoneNode::load(decl.number, &key_path, decl.gcm_nonce)?;
        Ok(self.node_base(decl.common, NodeKind::TrustZone(node)))
    }

    // --- Modules ---

    /// Literal SGX ids are claimed before any fresh module is numbered
    fn reserve_sgx_ids(&self, modules: &[Value]) {
        for value in modules {
            if value.get("type").and_then(Value::as_str) != Some("sgx") {
                continue;
            }
            let Some(id) = value
                .get("id")
                .and_then(Value::as_u64)
                .and_then(|id| u16::try_from(id).ok())
            else {
                continue;
            };
            let host = value.get("node").and_then(Value::as_str);
            for node in self.nodes.iter().filter(|n| Some(n.name.as_str()) == host) {
                if let NodeKind::Sgx(sgx) = &node.kind {
                    sgx.reserve_module_id(id);
                }
            }
        }
    }

    fn host(&self, common: &ModuleCommon, kind: &'static str) -> Result<Arc<Node>> {
        let node = self
            .nodes
            .iter()
            .find(|n| n.name == common.node)
            .ok_or_else(|| Error::UnknownNode(common.node.clone()))?;
        if node.kind_name() != kind {
            return Err(Error::KindMismatch {
                module: common.name.clone(),
                module_kind: kind,
                node_kind: node.kind_name(),
            });
        }
        Ok(node.clone())
    }

    fn sancus_module(&self, value: Value) -> Result<Module> {
        let decl: SancusModuleDecl = parse(value)?;
        let node = self.host(&decl.common, "sancus")?;
        let files = decl.files.iter().map(|f| self.resolve(f)).collect();
        let mut module = SancusModule::new(files, decl.cflags, decl.ldflags);

        let key = decl.key.as_deref().map(parse_key).transpose()?;
        match (decl.binary, decl.id, decl.symtab, key) {
            (Some(binary), Some(id), Some(symtab), Some(key)) => {
                module = module.with_state(self.resolve(&binary), id, self.resolve(&symtab), key);
            }
            (None, None, None, None) => {}
            _ => return Err(Error::PartialDerivedState(decl.common.name)),
        }

        Ok(Module::new(
            decl.common.name,
            node,
            decl.common.priority,
            decl.common.deployed.unwrap_or(false),
            ModuleKind::Sancus(module),
        ))
    }

    fn sgx_module(&self, value: Value) -> Result<Module> {
        let decl: SgxModuleDecl = parse(value)?;
        let node = self.host(&decl.common, "sgx")?;
        let NodeKind::Sgx(sgx_node) = &node.kind else {
            return Err(Error::Internal(format!("{} is not an SGX node", node.name)));
        };

        let key = decl.key.as_deref().map(parse_key).transpose()?;
        let state = match (
            decl.id,
            decl.binary,
            decl.sgxs,
            decl.signature,
            key,
            decl.inputs,
            decl.outputs,
            decl.entrypoints,
        ) {
            (
                Some(id),
                Some(binary),
                Some(sgxs),
                Some(signature),
                Some(key),
                Some(inputs),
                Some(outputs),
                Some(entrypoints),
            ) => {
                sgx_node.reserve_module_id(id);
                Some((
                    id,
                    SgxState {
                        binary: self.resolve(&binary),
                        sgxs: self.resolve(&sgxs),
                        signature: self.resolve(&signature),
                        key,
                        endpoints: Endpoints {
                            inputs,
                            outputs,
                            entrypoints,
                        },
                    },
                ))
            }
            (None, None, None, None, None, None, None, None) => None,
            _ => return Err(Error::PartialDerivedState(decl.common.name)),
        };

        let id = match &state {
            Some((id, _)) => *id,
            None => sgx_node.allocate_module_id()?,
        };
        let port = node.reactive_port.checked_add(id).ok_or_else(|| {
            Error::Config(format!(
                "module {}: port {} + id {} overflows",
                decl.common.name, node.reactive_port, id
            ))
        })?;
        let source = decl
            .source
            .map(|s| self.resolve(&s))
            .unwrap_or_else(|| self.base_dir.join(&decl.common.name));

        let mut module = SgxModule::new(
            source,
            self.resolve(&decl.vendor_key),
            self.resolve(&decl.ra_settings),
            decl.features,
            id,
            port,
        );
        if let Some((_, state)) = state {
            module = module.with_state(state);
        }

        Ok(Module::new(
            decl.common.name,
            node,
            decl.common.priority,
            decl.common.deployed.unwrap_or(false),
            ModuleKind::Sgx(module),
        ))
    }

    fn trustzone_module(&self, value: Value) -> Result<Module> {
        let decl: TrustZoneModuleDecl = parse(value)?;
        let node = self.host(&decl.common, "trustzone")?;
        let key = decl.key.as_deref().map(parse_key).transpose()?;

        let module = TrustZoneModule::new(
            self.resolve(&decl.files),
            decl.id.value()?,
            Endpoints {
                inputs: decl.inputs,
                outputs: decl.outputs,
                entrypoints: decl.entrypoints,
            },
        )
        .with_state(decl.binary.map(|b| self.resolve(&b)), key);

        Ok(Module::new(
            decl.common.name,
            node,
            decl.common.priority,
            decl.common.deployed.unwrap_or(false),
            ModuleKind::TrustZone(module),
        ))
    }

    // --- Connections ---

    fn module(&self, name: &str) -> Result<&Arc<Module>> {
        self.modules
            .iter()
            .find(|m| m.name == name)
            .ok_or_else(|| Error::UnknownModule(name.to_string()))
    }

    fn connection(&self, decl: ConnectionDecl) -> Result<Connection> {
        let from_module = self.module(&decl.from_module)?.clone();
        let to_module = self.module(&decl.to_module)?.clone();
        let encryption: Encryption = decl.encryption.parse()?;
        let key = decl.key.as_deref().map(parse_key).transpose()?;

        Connection::new(
            from_module,
            decl.from_output,
            to_module,
            decl.to_input,
            encryption,
            key,
            &self.ctx.settings,
        )
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }
}

fn dispatch<F: Copy>(table: &[(&str, F)], what: &'static str, value: &Value) -> Result<F> {
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Config(format!("{} without a type", what)))?;
    table
        .iter()
        .find(|(name, _)| *name == kind)
        .map(|(_, loader)| *loader)
        .ok_or_else(|| Error::UnknownKind {
            what,
            kind: kind.to_string(),
        })
}

fn parse<T: DeserializeOwned>(value: Value) -> Result<T> {
    Ok(serde_json::from_value(value)?)
}

/// Module names double as scratch directory names
fn check_module_name(name: &str) -> Result<()> {
    if name.is_empty() || name.starts_with('.') || name.contains(['/', '\\']) {
        return Err(Error::Config(format!("invalid module name '{}'", name)));
    }
    Ok(())
}

fn parse_key(text: &str) -> Result<Vec<u8>> {
    Ok(hex::decode(text)?)
}
