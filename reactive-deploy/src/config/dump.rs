use super::Config;
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::module::{Module, ModuleKind};
use crate::node::{Node, NodeKind};
use crate::periodic_event::PeriodicEvent;
use serde_json::{json, Map, Value};
use std::path::Path;
use std::sync::Arc;

impl Config {
    /// Render the description with every derived field filled in.
    /// Fields not computed yet are computed now (which may build, load
    /// and attest modules).
    pub async fn to_json(&self) -> Result<Value> {
        let mut modules = Vec::with_capacity(self.modules.len());
        for module in &self.modules {
            modules.push(dump_module(module).await?);
        }

        Ok(json!({
            "nodes": self.nodes.iter().map(|n| dump_node(n)).collect::<Vec<_>>(),
            "modules": modules,
            "connections": self.connections.iter().map(|c| dump_connection(c)).collect::<Vec<_>>(),
            "periodic-events": self.periodic_events.iter().map(|e| dump_event(e)).collect::<Vec<_>>(),
        }))
    }

    pub async fn dump(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let text = serde_json::to_string_pretty(&self.to_json().await?)?;
        tokio::fs::write(path, text).await?;
        log::info!("Wrote deployment result to {}", path.display());
        Ok(())
    }
}

fn dump_node(node: &Node) -> Value {
    let mut fields = Map::new();
    fields.insert("type".into(), json!(node.kind_name()));
    fields.insert("name".into(), json!(node.name));
    fields.insert("ip_address".into(), json!(node.ip_address.to_string()));
    fields.insert("reactive_port".into(), json!(node.reactive_port));
    fields.insert("deploy_port".into(), json!(node.deploy_port));
    match &node.kind {
        NodeKind::Sancus(sancus) => {
            fields.insert("vendor_id".into(), json!(sancus.vendor_id));
            fields.insert("vendor_key".into(), json!(hex::encode(&sancus.vendor_key)));
        }
        NodeKind::Sgx(_) => {}
        NodeKind::TrustZone(tz) => {
            fields.insert("number".into(), json!(tz.number));
            fields.insert("private_key".into(), json!(tz.key_path));
            fields.insert("gcm_nonce".into(), json!(tz.gcm_nonce));
        }
    }
    Value::Object(fields)
}

async fn dump_module(module: &Arc<Module>) -> Result<Value> {
    // the key is the last stage of every pipeline, so this fills all cells
    module.key().await?;
    let missing = || Error::Internal(format!("{} has no recorded state", module.name));

    let mut fields = Map::new();
    fields.insert("type".into(), json!(module.kind_name()));
    fields.insert("name".into(), json!(module.name));
    fields.insert("node".into(), json!(module.node.name));
    if let Some(priority) = module.priority {
        fields.insert("priority".into(), json!(priority));
    }
    fields.insert("deployed".into(), json!(module.is_deployed()));

    match &module.kind {
        ModuleKind::Sancus(sancus) => {
            let (binary, id, symtab, key) = sancus.state().ok_or_else(missing)?;
            fields.insert("files".into(), json!(sancus.files));
            fields.insert("cflags".into(), json!(sancus.cflags));
            fields.insert("ldflags".into(), json!(sancus.ldflags));
            fields.insert("binary".into(), json!(binary));
            fields.insert("id".into(), json!(id));
            fields.insert("symtab".into(), json!(symtab));
            fields.insert("key".into(), json!(hex::encode(key)));
        }
        ModuleKind::Sgx(sgx) => {
            let state = sgx.state().ok_or_else(missing)?;
            fields.insert("source".into(), json!(sgx.source));
            fields.insert("vendor_key".into(), json!(sgx.vendor_key));
            fields.insert("ra_settings".into(), json!(sgx.ra_settings));
            fields.insert("features".into(), json!(sgx.features));
            fields.insert("id".into(), json!(sgx.id));
            fields.insert("binary".into(), json!(state.binary));
            fields.insert("sgxs".into(), json!(state.sgxs));
            fields.insert("signature".into(), json!(state.signature));
            fields.insert("key".into(), json!(hex::encode(state.key)));
            fields.insert("inputs".into(), json!(state.endpoints.inputs));
            fields.insert("outputs".into(), json!(state.endpoints.outputs));
            fields.insert("entrypoints".into(), json!(state.endpoints.entrypoints));
        }
        ModuleKind::TrustZone(tz) => {
            let (binary, key) = tz.state().ok_or_else(missing)?;
            let id = match u64::try_from(tz.id) {
                Ok(small) => json!(small),
                Err(_) => json!(tz.uuid()),
            };
            fields.insert("files".into(), json!(tz.files));
            fields.insert("id".into(), id);
            fields.insert("binary".into(), json!(binary));
            fields.insert("key".into(), json!(hex::encode(key)));
            fields.insert("inputs".into(), json!(tz.endpoints.inputs));
            fields.insert("outputs".into(), json!(tz.endpoints.outputs));
            fields.insert("entrypoints".into(), json!(tz.endpoints.entrypoints));
        }
    }
    Ok(Value::Object(fields))
}

fn dump_connection(connection: &Connection) -> Value {
    json!({
        "from_module": connection.from_module.name,
        "from_output": connection.from_output,
        "to_module": connection.to_module.name,
        "to_input": connection.to_input,
        "encryption": connection.encryption.name(),
        "key": hex::encode(&connection.key),
    })
}

fn dump_event(event: &PeriodicEvent) -> Value {
    json!({
        "module": event.module.name,
        "entry": event.entry,
        "frequency": event.frequency,
    })
}

#[cfg(test)]
mod tests {
    use crate::testing::{sample_config, Harness};

    #[tokio::test]
    async fn test_dump_records_derived_state() {
        let h = Harness::new();
        let config = sample_config(&h);
        let value = config.to_json().await.unwrap();

        let sensor = &value["modules"][0];
        assert_eq!(sensor["type"], "sancus");
        assert_eq!(sensor["deployed"], true);
        assert!(sensor["id"].as_u64().unwrap() > 0);
        assert_eq!(sensor["key"].as_str().unwrap().len(), 32);

        let enclave = &value["modules"][1];
        assert_eq!(enclave["inputs"]["in"], 5);

        let connection = &value["connections"][0];
        assert_eq!(connection["encryption"], "spongent");
        assert_eq!(
            connection["key"].as_str().unwrap(),
            hex::encode(&config.connections[0].key)
        );
        assert_eq!(value["periodic-events"][0]["frequency"], 500);
    }
}
