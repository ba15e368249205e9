//! Sancus key derivation and SPONGENT wrapping
//!
//! Sancus uses its own sponge-based primitives. They are provided by the
//! `sancus-crypto` tool of the Sancus toolchain; the orchestrator only
//! shuttles bytes to and from it.

use super::process::ProcessRunner;
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;

#[async_trait]
pub trait SancusCrypto: Send + Sync {
    /// Derive a module key from the linked image, module name and vendor key
    async fn module_key(&self, linked_binary: &Path, module: &str, vendor_key: &[u8])
        -> Result<Vec<u8>>;

    /// Authenticated wrap of `body` under `key`, binding `ad`; returns (cipher, tag)
    async fn wrap(&self, key: &[u8], ad: &[u8], body: &[u8]) -> Result<(Vec<u8>, Vec<u8>)>;

    /// MAC of `data` under `key`
    async fn mac(&self, key: &[u8], data: &[u8]) -> Result<Vec<u8>>;
}

/// Drives the `sancus-crypto` command line tool
///
/// All results are read back as hex from stdout. A wrap result is
/// `cipher || tag`, with a tag as long as the key.
pub struct SancusCryptoTool {
    runner: Arc<dyn ProcessRunner>,
    program: String,
}

impl SancusCryptoTool {
    pub fn new(runner: Arc<dyn ProcessRunner>, program: impl Into<String>) -> Self {
        Self {
            runner,
            program: program.into(),
        }
    }

    async fn hex_output(&self, args: Vec<String>) -> Result<Vec<u8>> {
        let out = self.runner.output(&self.program, &args).await?;
        let text = String::from_utf8_lossy(&out);
        hex::decode(text.trim()).map_err(|e| Error::ToolOutput {
            command: self.program.clone(),
            reason: e.to_string(),
        })
    }
}

#[async_trait]
impl SancusCrypto for SancusCryptoTool {
    async fn module_key(
        &self,
        linked_binary: &Path,
        module: &str,
        vendor_key: &[u8],
    ) -> Result<Vec<u8>> {
        self.hex_output(vec![
            "--key".into(),
            hex::encode(vendor_key),
            "--gen-sm-key".into(),
            module.to_string(),
            linked_binary.display().to_string(),
        ])
        .await
    }

    async fn wrap(&self, key: &[u8], ad: &[u8], body: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
        let mut out = self
            .hex_output(vec![
                "--key".into(),
                hex::encode(key),
                "--wrap".into(),
                hex::encode(ad),
                hex::encode(body),
            ])
            .await?;
        if out.len() < key.len() {
            return Err(Error::ToolOutput {
                command: self.program.clone(),
                reason: format!("wrap output of {} bytes has no tag", out.len()),
            });
        }
        let tag = out.split_off(out.len() - key.len());
        Ok((out, tag))
    }

    async fn mac(&self, key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
        self.hex_output(vec![
            "--key".into(),
            hex::encode(key),
            "--mac".into(),
            hex::encode(data),
        ])
        .await
    }
}
