//! Test doubles and fixtures: a recording transport with scripted node
//! behaviour, a scripted process runner, and builders for nodes, modules
//! and whole deployments.

use crate::config::Config;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::module::{Endpoints, Module, ModuleKind, SancusModule, SgxModule, TrustZoneModule};
use crate::network::{
    entry, read_u16, CommandCode, CommandMessage, ResultCode, ResultMessage, Transport,
};
use crate::node::{GcmNonceMode, Node, NodeKind, SancusNode, SgxNode, TrustZoneNode};
use crate::toolchain::{command_line, ProcessRunner, SancusCrypto, Settings, SymbolResolver};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::rngs::OsRng;
use rsa::pkcs1::EncodeRsaPrivateKey;
use rsa::pkcs8::LineEnding;
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tempfile::TempDir;

pub(crate) const SANCUS_VENDOR_KEY: [u8; 16] = [
    0x0b, 0x7b, 0xf3, 0xae, 0x40, 0x88, 0x0a, 0x8b, 0xe4, 0x30, 0xd0, 0xda, 0x34, 0xfb, 0x76, 0xf0,
];
pub(crate) const SGX_MODULE_KEY: [u8; 16] = [0x5e; 16];
pub(crate) const TZ_MODULE_KEY: [u8; 16] = [
    0x10, 0x21, 0x32, 0x43, 0x54, 0x65, 0x76, 0x87, 0x98, 0xa9, 0xba, 0xcb, 0xdc, 0xed, 0xfe, 0x0f,
];

pub(crate) const SANCUS_PORTS: (u16, u16) = (5000, 6000);
pub(crate) const SGX_PORTS: (u16, u16) = (5100, 6100);
pub(crate) const TZ_PORTS: (u16, u16) = (5200, 6200);

// --- Transport ---

type Responder = Box<dyn Fn(&CommandMessage) -> Result<ResultMessage> + Send + Sync>;

/// Records every command and answers through a responder
pub(crate) struct RecordingTransport {
    sent: Mutex<Vec<CommandMessage>>,
    responder: Responder,
}

impl RecordingTransport {
    fn new(responder: Responder) -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            responder,
        }
    }

    pub fn sent(&self) -> Vec<CommandMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_with(&self, code: CommandCode) -> Vec<CommandMessage> {
        self.sent().into_iter().filter(|c| c.code == code).collect()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send(&self, command: &CommandMessage) -> Result<()> {
        self.sent.lock().unwrap().push(command.clone());
        Ok(())
    }

    async fn send_wait(&self, command: &CommandMessage) -> Result<ResultMessage> {
        self.sent.lock().unwrap().push(command.clone());
        (self.responder)(command)
    }
}

/// Event managers as seen from the deploy and reactive ports of the fixtures
#[derive(Default)]
pub(crate) struct FakeNodes {
    /// Sancus module names by node-assigned id
    sancus_ids: Mutex<HashMap<u16, String>>,
    /// Ids to hand out for specific module names
    fixed_ids: HashMap<String, u16>,
    forge_tags: AtomicBool,
}

impl FakeNodes {
    fn with_ids(ids: &[(u16, &str)]) -> Self {
        Self {
            fixed_ids: ids.iter().map(|(id, name)| (name.to_string(), *id)).collect(),
            ..Self::default()
        }
    }

    fn respond(&self, command: &CommandMessage) -> Result<ResultMessage> {
        match (command.code, command.port) {
            (CommandCode::Load, port) if port == SANCUS_PORTS.1 => self.sancus_load(command),
            (CommandCode::Load, port) if port == TZ_PORTS.1 => {
                let public = RsaPublicKey::from(tz_private_key());
                let blob = public
                    .encrypt(&mut OsRng, Pkcs1v15Encrypt, &TZ_MODULE_KEY)
                    .map_err(|e| Error::Internal(e.to_string()))?;
                Ok(ResultMessage::ok(blob))
            }
            (CommandCode::Call, port) if port == SANCUS_PORTS.0 => self.sancus_call(command),
            _ => Ok(ResultMessage::ok(Vec::new())),
        }
    }

    fn sancus_load(&self, command: &CommandMessage) -> Result<ResultMessage> {
        let end = command
            .payload
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(command.payload.len());
        let name = String::from_utf8_lossy(&command.payload[..end]).into_owned();

        let mut ids = self.sancus_ids.lock().unwrap();
        let id = match self.fixed_ids.get(&name) {
            Some(id) => *id,
            None => (1u16..).find(|id| !ids.contains_key(id)).unwrap(),
        };
        ids.insert(id, name);

        let mut payload = id.to_be_bytes().to_vec();
        payload.extend_from_slice(b"SYMTAB\0");
        Ok(ResultMessage::ok(payload))
    }

    /// SetKey replies `Ok || MAC(module key, nonce || Ok)`
    fn sancus_call(&self, command: &CommandMessage) -> Result<ResultMessage> {
        let payload = &command.payload;
        if read_u16(payload, 2)? != entry::SET_KEY {
            return Ok(ResultMessage::ok(Vec::new()));
        }
        let id = read_u16(payload, 0)?;
        let nonce = read_u16(payload, 8)?;
        let Some(name) = self.sancus_ids.lock().unwrap().get(&id).cloned() else {
            return Ok(ResultMessage::new(ResultCode::BadRequest, Vec::new()));
        };

        let mut reply = vec![0, 0];
        if self.forge_tags.load(Ordering::SeqCst) {
            reply.extend_from_slice(&[0xEE; 16]);
        } else {
            let key = FakeSancusCrypto::derive(&name, &SANCUS_VENDOR_KEY);
            let mut data = nonce.to_be_bytes().to_vec();
            data.extend_from_slice(&[0, 0]);
            reply.extend(FakeSancusCrypto::tag(&key, &data));
        }
        Ok(ResultMessage::ok(reply))
    }
}

/// Responder for Sancus tests that need specific module ids
pub(crate) fn sancus_responder(
    ids: &[(u16, &str)],
) -> impl Fn(&CommandMessage) -> Result<ResultMessage> + Send + Sync + 'static {
    let nodes = FakeNodes::with_ids(ids);
    move |command: &CommandMessage| nodes.respond(command)
}

// --- Processes ---

#[derive(Debug, Clone)]
pub(crate) struct Call {
    pub program: String,
    pub args: Vec<String>,
}

/// Records invocations and plays back scripted outputs
///
/// Runs also leave behind the files the real tool would produce, so later
/// stages find something to read.
pub(crate) struct ScriptedRunner {
    calls: Mutex<Vec<Call>>,
    outputs: Mutex<HashMap<String, Vec<u8>>>,
    failures: Mutex<HashMap<String, i32>>,
    delays: Mutex<HashMap<String, Duration>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        let mut outputs = HashMap::new();
        outputs.insert(
            "rust-sgx-gen".to_string(),
            br#"{"inputs":{"in":5},"outputs":{"out":6},"entrypoints":{"init":7}}"#.to_vec(),
        );
        outputs.insert(
            "ssh-keygen".to_string(),
            b"-----BEGIN RSA PUBLIC KEY-----\nMAoCAwEAAQIDAQAB\n-----END RSA PUBLIC KEY-----\n"
                .to_vec(),
        );
        outputs.insert("ra_client".to_string(), SGX_MODULE_KEY.to_vec());
        outputs.insert(
            "sgx-encrypt".to_string(),
            BASE64.encode([0xC0u8; 32]).into_bytes(),
        );

        Self {
            calls: Mutex::new(Vec::new()),
            outputs: Mutex::new(outputs),
            failures: Mutex::new(HashMap::new()),
            delays: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_output(&self, program: &str, output: &[u8]) {
        self.outputs
            .lock()
            .unwrap()
            .insert(program.to_string(), output.to_vec());
    }

    /// Every later invocation of `program` exits with `code`
    pub fn fail(&self, program: &str, code: i32) {
        self.failures.lock().unwrap().insert(program.to_string(), code);
    }

    pub fn delay(&self, program: &str, delay: Duration) {
        self.delays.lock().unwrap().insert(program.to_string(), delay);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, program: &str) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| c.program == program)
            .collect()
    }

    pub fn count(&self, program: &str) -> usize {
        self.calls_to(program).len()
    }

    async fn invoke(&self, program: &str, args: &[String]) -> Result<()> {
        self.calls.lock().unwrap().push(Call {
            program: program.to_string(),
            args: args.to_vec(),
        });

        let delay = self.delays.lock().unwrap().get(program).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let failure = self.failures.lock().unwrap().get(program).copied();
        match failure {
            Some(code) => Err(Error::ProcessFailed {
                command: command_line(program, args),
                code,
            }),
            None => Ok(()),
        }
    }

    fn write_artifacts(program: &str, args: &[String]) {
        let write = |path: PathBuf, content: &[u8]| {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).unwrap();
            }
            std::fs::write(path, content).unwrap();
        };

        if program.ends_with("elf2sgxs") {
            write(PathBuf::from(format!("{}.sgxs", args[0])), b"sgxs");
        } else if program == "sgxs-sign" {
            write(PathBuf::from(&args[3]), b"sig");
        } else if program == "make" {
            let dir = &args[1];
            let uuid = args
                .iter()
                .find_map(|a| a.strip_prefix("BINARY="))
                .unwrap();
            write(Path::new(dir).join(format!("{}.ta", uuid)), b"artifact");
        } else if let Some(at) = args.iter().position(|a| a == "-o") {
            write(PathBuf::from(&args[at + 1]), b"artifact");
        }
    }
}

#[async_trait]
impl ProcessRunner for ScriptedRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<()> {
        self.invoke(program, args).await?;
        Self::write_artifacts(program, args);
        Ok(())
    }

    async fn output(&self, program: &str, args: &[String]) -> Result<Vec<u8>> {
        self.invoke(program, args).await?;
        Ok(self
            .outputs
            .lock()
            .unwrap()
            .get(program)
            .cloned()
            .unwrap_or_default())
    }

    async fn spawn(&self, program: &str, args: &[String]) -> Result<()> {
        self.invoke(program, args).await
    }
}

// --- Symbols and Sancus crypto ---

#[derive(Default)]
pub(crate) struct StaticSymbols {
    table: Mutex<HashMap<String, u64>>,
}

impl StaticSymbols {
    pub fn insert(&self, symbol: &str, value: u64) {
        self.table.lock().unwrap().insert(symbol.to_string(), value);
    }
}

#[async_trait]
impl SymbolResolver for StaticSymbols {
    async fn resolve(&self, _binary: &Path, symbol: &str) -> Result<Option<u64>> {
        Ok(self.table.lock().unwrap().get(symbol).copied())
    }
}

/// SHA-256 based stand-in for the SPONGENT primitives
pub(crate) struct FakeSancusCrypto;

impl FakeSancusCrypto {
    pub fn derive(module: &str, vendor_key: &[u8]) -> Vec<u8> {
        let mut hasher = Sha256::new();
        hasher.update(b"module-key");
        hasher.update(vendor_key);
        hasher.update(module.as_bytes());
        hasher.finalize()[..16].to_vec()
    }

    pub fn tag(key: &[u8], data: &[u8]) -> Vec<u8> {
        let mut hasher = Sha256::new();
        hasher.update(b"mac");
        hasher.update(key);
        hasher.update(data);
        hasher.finalize()[..16].to_vec()
    }
}

#[async_trait]
impl SancusCrypto for FakeSancusCrypto {
    async fn module_key(&self, _linked: &Path, module: &str, vendor_key: &[u8]) -> Result<Vec<u8>> {
        Ok(Self::derive(module, vendor_key))
    }

    async fn wrap(&self, key: &[u8], ad: &[u8], body: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
        let cipher: Vec<u8> = body
            .iter()
            .zip(key.iter().cycle())
            .map(|(b, k)| b ^ k)
            .collect();
        let mut tagged = ad.to_vec();
        tagged.extend_from_slice(&cipher);
        Ok((cipher, Self::tag(key, &tagged)))
    }

    async fn mac(&self, key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
        Ok(Self::tag(key, data))
    }
}

// --- Harness ---

pub(crate) struct Harness {
    pub ctx: Arc<Context>,
    pub transport: Arc<RecordingTransport>,
    pub runner: Arc<ScriptedRunner>,
    pub symbols: Arc<StaticSymbols>,
    nodes: Arc<FakeNodes>,
    _dir: TempDir,
}

impl Harness {
    /// Nodes behave like healthy event managers
    pub fn new() -> Self {
        let nodes = Arc::new(FakeNodes::default());
        let responder = nodes.clone();
        Self::build(
            Box::new(move |command: &CommandMessage| responder.respond(command)),
            nodes,
        )
    }

    pub fn with_responder<F>(responder: F) -> Self
    where
        F: Fn(&CommandMessage) -> Result<ResultMessage> + Send + Sync + 'static,
    {
        Self::build(Box::new(responder), Arc::new(FakeNodes::default()))
    }

    fn build(responder: Responder, nodes: Arc<FakeNodes>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings {
            work_dir: Some(dir.path().to_path_buf()),
            ..Settings::default()
        };
        let transport = Arc::new(RecordingTransport::new(responder));
        let runner = Arc::new(ScriptedRunner::new());
        let symbols = Arc::new(StaticSymbols::default());
        let ctx = Context::new(
            settings,
            transport.clone(),
            runner.clone(),
            symbols.clone(),
            Arc::new(FakeSancusCrypto),
        )
        .unwrap();

        Self {
            ctx: Arc::new(ctx),
            transport,
            runner,
            symbols,
            nodes,
            _dir: dir,
        }
    }

    /// Sancus SetKey replies carry a tag no module key produces
    pub fn forge_sancus_tags(&self) {
        self.nodes.forge_tags.store(true, Ordering::SeqCst);
    }

    /// Tell the Sancus node about a module loaded in an earlier run
    pub fn register_sancus_module(&self, id: u16, name: &str) {
        self.nodes
            .sancus_ids
            .lock()
            .unwrap()
            .insert(id, name.to_string());
    }
}

// --- Fixtures ---

pub(crate) fn sancus_node(h: &Harness, name: &str) -> Arc<Node> {
    Arc::new(Node::new(
        name,
        Ipv4Addr::new(10, 0, 0, 1),
        SANCUS_PORTS.0,
        SANCUS_PORTS.1,
        NodeKind::Sancus(SancusNode::new(0x1234, SANCUS_VENDOR_KEY.to_vec())),
        h.ctx.clone(),
    ))
}

pub(crate) fn sgx_node(h: &Harness, name: &str) -> Arc<Node> {
    Arc::new(Node::new(
        name,
        Ipv4Addr::new(10, 0, 0, 2),
        SGX_PORTS.0,
        SGX_PORTS.1,
        NodeKind::Sgx(SgxNode::new()),
        h.ctx.clone(),
    ))
}

pub(crate) fn trustzone_node(h: &Harness, name: &str, number: u16) -> Arc<Node> {
    let tz = TrustZoneNode::new(
        number,
        h.ctx.work_dir().join("node.pem"),
        tz_private_key().clone(),
        GcmNonceMode::Zero,
    );
    Arc::new(Node::new(
        name,
        Ipv4Addr::new(10, 0, 0, 3),
        TZ_PORTS.0,
        TZ_PORTS.1,
        NodeKind::TrustZone(tz),
        h.ctx.clone(),
    ))
}

pub(crate) fn sancus_module(h: &Harness, name: &str, node: &Arc<Node>) -> Arc<Module> {
    let files = vec![h.ctx.work_dir().join("a.c"), h.ctx.work_dir().join("b.c")];
    Arc::new(Module::new(
        name,
        node.clone(),
        None,
        false,
        ModuleKind::Sancus(SancusModule::new(files, Vec::new(), Vec::new())),
    ))
}

pub(crate) fn sgx_module(h: &Harness, name: &str, node: &Arc<Node>, id: u16) -> Arc<Module> {
    if let NodeKind::Sgx(sgx) = &node.kind {
        sgx.reserve_module_id(id);
    }
    let dir = h.ctx.work_dir();
    let module = SgxModule::new(
        dir.join(name),
        dir.join("vendor.pem"),
        dir.join("ra.json"),
        Vec::new(),
        id,
        node.reactive_port + id,
    );
    Arc::new(Module::new(name, node.clone(), None, false, ModuleKind::Sgx(module)))
}

pub(crate) fn trustzone_module(h: &Harness, name: &str, node: &Arc<Node>, id: u128) -> Arc<Module> {
    let endpoints = Endpoints {
        inputs: [("in".to_string(), 0)].into(),
        outputs: [("out".to_string(), 1)].into(),
        entrypoints: [("tick".to_string(), 2)].into(),
    };
    let module = TrustZoneModule::new(h.ctx.work_dir().join("tas"), id, endpoints);
    Arc::new(Module::new(
        name,
        node.clone(),
        None,
        false,
        ModuleKind::TrustZone(module),
    ))
}

/// Shared RSA key of every TrustZone fixture node
pub(crate) fn tz_private_key() -> &'static RsaPrivateKey {
    static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
    KEY.get_or_init(|| RsaPrivateKey::new(&mut OsRng, 1024).unwrap())
}

/// Write the fixture key as PKCS#1 PEM and return its path
pub(crate) fn write_tz_key(dir: &Path) -> String {
    let path = dir.join("node.pem");
    let pem = tz_private_key().to_pkcs1_pem(LineEnding::LF).unwrap();
    std::fs::write(&path, pem.as_bytes()).unwrap();
    path.display().to_string()
}

/// A Sancus sensor feeding an SGX enclave, plus one periodic event
pub(crate) fn sample_document() -> Value {
    json!({
        "nodes": [
            { "type": "sancus", "name": "node-sancus", "ip_address": "10.0.0.1",
              "reactive_port": SANCUS_PORTS.0, "deploy_port": SANCUS_PORTS.1,
              "vendor_id": 0x1234, "vendor_key": hex::encode(SANCUS_VENDOR_KEY) },
            { "type": "sgx", "name": "node-sgx", "ip_address": "10.0.0.2",
              "reactive_port": SGX_PORTS.0, "deploy_port": SGX_PORTS.1 }
        ],
        "modules": [
            { "type": "sancus", "name": "sensor", "node": "node-sancus", "files": ["sensor.c"] },
            { "type": "sgx", "name": "enclave", "node": "node-sgx",
              "vendor_key": "vendor.pem", "ra_settings": "ra.json" }
        ],
        "connections": [
            { "from_module": "sensor", "from_output": 1, "to_module": "enclave",
              "to_input": "in", "encryption": "spongent" }
        ],
        "periodic-events": [
            { "module": "enclave", "entry": "init", "frequency": 500 }
        ]
    })
}

pub(crate) fn load_config(h: &Harness, document: &Value) -> Config {
    Config::parse(&document.to_string(), h.ctx.work_dir(), h.ctx.clone()).unwrap()
}

pub(crate) fn sample_config(h: &Harness) -> Config {
    load_config(h, &sample_document())
}
