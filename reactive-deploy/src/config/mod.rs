//! Deployment descriptions - loading, querying and dumping
//!
//! A deployment is a JSON document with `nodes`, `modules`, `connections`
//! and `periodic-events`. Every node and module carries a `type` that picks
//! its loader from a fixed table. After a run the description can be
//! written back with every derived field filled in, so a later run can
//! pick up where this one stopped.

mod dump;
mod load;

use crate::connection::Connection;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::module::Module;
use crate::node::Node;
use crate::periodic_event::PeriodicEvent;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug)]
pub struct Config {
    /// File the description was read from, if any
    pub path: Option<PathBuf>,
    pub nodes: Vec<Arc<Node>>,
    pub modules: Vec<Arc<Module>>,
    pub connections: Vec<Arc<Connection>>,
    pub periodic_events: Vec<Arc<PeriodicEvent>>,
    ctx: Arc<Context>,
}

impl Config {
    /// Read a description from disk; relative paths inside it are taken
    /// relative to the file's directory
    pub fn load(path: impl AsRef<Path>, ctx: Arc<Context>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        let mut config = Self::parse(&text, &base_dir, ctx)?;
        config.path = Some(path.to_path_buf());
        log::info!(
            "Loaded {}: {} nodes, {} modules, {} connections, {} periodic events",
            path.display(),
            config.nodes.len(),
            config.modules.len(),
            config.connections.len(),
            config.periodic_events.len()
        );
        Ok(config)
    }

    pub fn parse(text: &str, base_dir: &Path, ctx: Arc<Context>) -> Result<Self> {
        let document: serde_json::Value = serde_json::from_str(text)?;
        load::Loader::new(base_dir, ctx).load(document)
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    pub fn node(&self, name: &str) -> Result<&Arc<Node>> {
        self.nodes
            .iter()
            .find(|n| n.name == name)
            .ok_or_else(|| Error::UnknownNode(name.to_string()))
    }

    pub fn module(&self, name: &str) -> Result<&Arc<Module>> {
        self.modules
            .iter()
            .find(|m| m.name == name)
            .ok_or_else(|| Error::UnknownModule(name.to_string()))
    }

    /// Modules hosted by `node`
    pub fn modules_on<'a>(&'a self, node: &'a Node) -> impl Iterator<Item = &'a Arc<Module>> + 'a {
        self.modules
            .iter()
            .filter(move |m| std::ptr::eq(m.node.as_ref(), node))
    }
}
