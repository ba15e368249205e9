//! Connections - authenticated, encrypted channels between module endpoints
//!
//! Establishing a connection is three independent commands issued
//! concurrently: Connect on the source node, and one SetKey per endpoint
//! delivering the shared key wrapped under each module's own key.

use crate::error::{Error, Result};
use crate::module::{EndpointRef, Module};
use crate::toolchain::Settings;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};

/// Cipher used on a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum Encryption {
    Aes = 0x0,
    Spongent = 0x1,
}

impl Encryption {
    /// Wire identifier, first byte of the SetKey associated data
    pub fn id(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            Encryption::Aes => "aes",
            Encryption::Spongent => "spongent",
        }
    }

    /// Key length in bytes; SPONGENT follows the Sancus security level
    pub fn key_size(self, settings: &Settings) -> usize {
        match self {
            Encryption::Aes => 16,
            Encryption::Spongent => settings.sancus_key_size,
        }
    }

    /// Fresh random key from the OS generator
    pub fn generate_key(self, settings: &Settings) -> Vec<u8> {
        let mut key = vec![0u8; self.key_size(settings)];
        OsRng.fill_bytes(&mut key);
        key
    }
}

impl FromStr for Encryption {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "aes" => Ok(Encryption::Aes),
            "spongent" => Ok(Encryption::Spongent),
            _ => Err(Error::Config(format!("No matching encryption type for {}", s))),
        }
    }
}

impl fmt::Display for Encryption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Which side of a connection an endpoint is on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionIo {
    Output = 0x0,
    Input = 0x1,
}

/// Run-wide connection id allocator: 0, 1, 2, ... in establishment order
#[derive(Debug, Default)]
pub struct ConnectionIds {
    next: AtomicU32,
}

impl ConnectionIds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> Result<u16> {
        let id = self.next.fetch_add(1, Ordering::SeqCst);
        u16::try_from(id).map_err(|_| Error::Protocol("connection ids exhausted".into()))
    }

    /// How many ids were handed out so far
    pub fn issued(&self) -> u32 {
        self.next.load(Ordering::SeqCst)
    }
}

pub struct Connection {
    pub from_module: Arc<Module>,
    pub from_output: EndpointRef,
    pub to_module: Arc<Module>,
    pub to_input: EndpointRef,
    pub encryption: Encryption,
    pub key: Vec<u8>,
    id: OnceLock<u16>,
    established: AtomicBool,
}

impl Connection {
    /// Validate the endpoints and cipher; the key is generated when absent
    pub fn new(
        from_module: Arc<Module>,
        from_output: EndpointRef,
        to_module: Arc<Module>,
        to_input: EndpointRef,
        encryption: Encryption,
        key: Option<Vec<u8>>,
        settings: &Settings,
    ) -> Result<Self> {
        if Arc::ptr_eq(&from_module, &to_module) {
            return Err(Error::SameModuleConnection(from_module.name.clone()));
        }
        if !from_module.supports(encryption) || !to_module.supports(encryption) {
            return Err(Error::EncryptionUnsupported {
                encryption: encryption.to_string(),
                from: from_module.name.clone(),
                to: to_module.name.clone(),
            });
        }

        let expected = encryption.key_size(settings);
        let key = match key {
            Some(key) if key.len() != expected => {
                return Err(Error::InvalidKey(format!(
                    "{} key of {} bytes, expected {}",
                    encryption,
                    key.len(),
                    expected
                )))
            }
            Some(key) => key,
            None => encryption.generate_key(settings),
        };

        from_module.add_connection();
        to_module.add_connection();

        Ok(Self {
            from_module,
            from_output,
            to_module,
            to_input,
            encryption,
            key,
            id: OnceLock::new(),
            established: AtomicBool::new(false),
        })
    }

    /// Id drawn when establishment started
    pub fn id(&self) -> Option<u16> {
        self.id.get().copied()
    }

    pub fn is_established(&self) -> bool {
        self.established.load(Ordering::SeqCst)
    }

    pub async fn establish(&self, ids: &ConnectionIds) -> Result<u16> {
        let conn_id = ids.next()?;
        if self.id.set(conn_id).is_err() {
            return Err(Error::Internal(format!(
                "connection {} -> {} established twice",
                self.from_module.name, self.to_module.name
            )));
        }

        let from_node = &self.from_module.node;
        let to_node = &self.to_module.node;
        // siblings run to completion even when one of them fails
        let (connect, from_key, to_key) = futures::join!(
            from_node.connect(&self.to_module, conn_id),
            from_node.set_key(
                &self.from_module,
                conn_id,
                &self.from_output,
                self.encryption,
                &self.key,
                ConnectionIo::Output,
            ),
            to_node.set_key(
                &self.to_module,
                conn_id,
                &self.to_input,
                self.encryption,
                &self.key,
                ConnectionIo::Input,
            ),
        );
        connect?;
        from_key?;
        to_key?;
        self.established.store(true, Ordering::SeqCst);

        log::info!(
            "Connection {} from {}:{} on {} to {}:{} on {} established",
            conn_id,
            self.from_module.name,
            self.from_output,
            from_node.name,
            self.to_module.name,
            self.to_input,
            to_node.name
        );
        Ok(conn_id)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("from", &format_args!("{}:{}", self.from_module.name, self.from_output))
            .field("to", &format_args!("{}:{}", self.to_module.name, self.to_input))
            .field("encryption", &self.encryption)
            .field("id", &self.id())
            .field("established", &self.is_established())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{
        entry, read_u16, CommandCode, CommandMessage, ResultCode, ResultMessage,
    };
    use crate::testing::{
        sancus_module, sancus_node, sgx_module, sgx_node, trustzone_module, trustzone_node,
        Harness,
    };
    use std::time::Duration;

    #[test]
    fn test_encryption_names() {
        assert_eq!("AES".parse::<Encryption>().unwrap(), Encryption::Aes);
        assert_eq!("spongent".parse::<Encryption>().unwrap(), Encryption::Spongent);
        assert!("des".parse::<Encryption>().is_err());
        assert_eq!(Encryption::Spongent.id(), 1);
    }

    #[test]
    fn test_key_sizes_follow_settings() {
        let mut settings = Settings::default();
        settings.sancus_key_size = 8;
        assert_eq!(Encryption::Aes.generate_key(&settings).len(), 16);
        assert_eq!(Encryption::Spongent.generate_key(&settings).len(), 8);
    }

    #[test]
    fn test_ids_are_contiguous() {
        let ids = ConnectionIds::new();
        assert_eq!(ids.next().unwrap(), 0);
        assert_eq!(ids.next().unwrap(), 1);
        assert_eq!(ids.issued(), 2);
    }

    #[test]
    fn test_unsupported_encryption_names_both_modules() {
        let h = Harness::new();
        let sancus = sancus_node(&h, "n1");
        let tz = trustzone_node(&h, "tz", 1);
        let sensor = sancus_module(&h, "sensor", &sancus);
        let ta = trustzone_module(&h, "ta", &tz, 5);

        let err = Connection::new(
            sensor.clone(),
            EndpointRef::Id(0),
            ta,
            EndpointRef::Id(0),
            Encryption::Aes,
            None,
            &h.ctx.settings,
        )
        .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("sensor") && message.contains("ta"), "{}", message);
        assert_eq!(sensor.connection_count(), 0);
    }

    #[test]
    fn test_self_connection_is_rejected() {
        let h = Harness::new();
        let node = sgx_node(&h, "x");
        let module = sgx_module(&h, "enclave", &node, 1);
        let err = Connection::new(
            module.clone(),
            EndpointRef::Id(0),
            module,
            EndpointRef::Id(1),
            Encryption::Aes,
            None,
            &h.ctx.settings,
        )
        .unwrap_err();
        assert!(matches!(err, Error::SameModuleConnection(_)));
    }

    #[test]
    fn test_wrong_key_length_is_rejected() {
        let h = Harness::new();
        let node = sgx_node(&h, "x");
        let a = sgx_module(&h, "a", &node, 1);
        let b = sgx_module(&h, "b", &node, 2);
        let err = Connection::new(
            a,
            EndpointRef::Id(0),
            b,
            EndpointRef::Id(1),
            Encryption::Aes,
            Some(vec![0; 5]),
            &h.ctx.settings,
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidKey(_)));
    }

    #[tokio::test]
    async fn test_establish_issues_three_commands() {
        let h = Harness::new();
        let tz = trustzone_node(&h, "tz", 4);
        let x = sgx_node(&h, "x");
        let ta = trustzone_module(&h, "ta", &tz, 0x42);
        let enclave = sgx_module(&h, "enclave", &x, 2);

        let connection = Connection::new(
            ta,
            EndpointRef::Name("out".into()),
            enclave,
            EndpointRef::Name("in".into()),
            Encryption::Aes,
            None,
            &h.ctx.settings,
        )
        .unwrap();
        let ids = ConnectionIds::new();
        assert_eq!(connection.establish(&ids).await.unwrap(), 0);
        assert!(connection.is_established());
        assert_eq!(connection.id(), Some(0));

        let connects = h.transport.sent_with(CommandCode::Connect);
        assert_eq!(connects.len(), 1);
        // conn id, 16-byte module id, node number, port, address
        let payload = &connects[0].payload;
        assert_eq!(payload.len(), 2 + 16 + 2 + 2 + 4);
        assert_eq!(&payload[..2], &[0, 0]);
        assert_eq!(&payload[2..18], &2u128.to_be_bytes());
        assert_eq!(&payload[18..20], &[0, 0]);
        assert_eq!(&payload[20..22], &x.reactive_port.to_be_bytes());
        assert_eq!(&payload[22..], &x.ip_address.octets());
        assert_eq!(connects[0].address, tz.ip_address);
    }

    #[tokio::test]
    async fn test_failed_set_key_leaves_connection_unestablished() {
        let h = Harness::new();
        let node = sancus_node(&h, "n1");
        let a = sancus_module(&h, "a", &node);
        let b = sancus_module(&h, "b", &node);
        h.forge_sancus_tags();

        let connection = Connection::new(
            a,
            EndpointRef::Id(0),
            b,
            EndpointRef::Id(1),
            Encryption::Spongent,
            None,
            &h.ctx.settings,
        )
        .unwrap();
        let err = connection.establish(&ConnectionIds::new()).await.unwrap_err();
        assert!(matches!(err, Error::TagMismatch(_)));
        assert!(!connection.is_established());
    }

    #[tokio::test]
    async fn test_failed_connect_still_delivers_both_keys() {
        let h = Harness::with_responder(|command: &CommandMessage| match command.code {
            CommandCode::Connect => Ok(ResultMessage::new(ResultCode::InternalError, Vec::new())),
            _ => Ok(ResultMessage::ok(Vec::new())),
        });
        h.runner.delay("sgx-encrypt", Duration::from_millis(30));
        let node = sgx_node(&h, "x");
        let a = sgx_module(&h, "a", &node, 1);
        let b = sgx_module(&h, "b", &node, 2);

        let connection = Connection::new(
            a,
            EndpointRef::Name("out".into()),
            b,
            EndpointRef::Name("in".into()),
            Encryption::Aes,
            None,
            &h.ctx.settings,
        )
        .unwrap();
        let err = connection.establish(&ConnectionIds::new()).await.unwrap_err();
        assert!(matches!(err, Error::CommandFailed { .. }), "{:?}", err);
        assert!(!connection.is_established());

        let set_keys: Vec<_> = h
            .transport
            .sent_with(CommandCode::Call)
            .into_iter()
            .filter(|c| read_u16(&c.payload, 2).ok() == Some(entry::SET_KEY))
            .collect();
        assert_eq!(set_keys.len(), 2);
        assert_eq!(h.runner.count("sgx-encrypt"), 2);
    }

    #[tokio::test]
    async fn test_sancus_local_connect_uses_unspecified_address() {
        let h = Harness::new();
        let node = sancus_node(&h, "n1");
        let a = sancus_module(&h, "a", &node);
        let b = sancus_module(&h, "b", &node);

        let connection = Connection::new(
            a,
            EndpointRef::Id(0),
            b.clone(),
            EndpointRef::Id(1),
            Encryption::Spongent,
            None,
            &h.ctx.settings,
        )
        .unwrap();
        connection.establish(&ConnectionIds::new()).await.unwrap();

        let connect = h.transport.sent_with(CommandCode::Connect).remove(0);
        let b_id = b.id().await.unwrap() as u16;
        assert_eq!(&connect.payload[2..4], &b_id.to_be_bytes());
        assert_eq!(&connect.payload[6..], &[0, 0, 0, 0]);
    }
}
