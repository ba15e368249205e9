//! Symbol lookup in built module binaries

use super::process::ProcessRunner;
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Resolves a symbol name to its value in a binary
#[async_trait]
pub trait SymbolResolver: Send + Sync {
    /// `None` when the binary does not define the symbol
    async fn resolve(&self, binary: &Path, symbol: &str) -> Result<Option<u64>>;
}

/// Reads symbol tables with an `nm`-compatible tool
///
/// Each binary is listed once; later lookups hit the cache.
pub struct NmResolver {
    runner: Arc<dyn ProcessRunner>,
    nm: String,
    tables: Mutex<HashMap<PathBuf, Arc<HashMap<String, u64>>>>,
}

impl NmResolver {
    pub fn new(runner: Arc<dyn ProcessRunner>, nm: impl Into<String>) -> Self {
        Self {
            runner,
            nm: nm.into(),
            tables: Mutex::new(HashMap::new()),
        }
    }

    async fn table(&self, binary: &Path) -> Result<Arc<HashMap<String, u64>>> {
        let mut tables = self.tables.lock().await;
        if let Some(table) = tables.get(binary) {
            return Ok(table.clone());
        }
        let out = self
            .runner
            .output(&self.nm, &[binary.display().to_string()])
            .await?;
        let text = String::from_utf8(out).map_err(|e| Error::ToolOutput {
            command: self.nm.clone(),
            reason: e.to_string(),
        })?;
        let table = Arc::new(parse_nm(&text));
        tables.insert(binary.to_path_buf(), table.clone());
        Ok(table)
    }
}

#[async_trait]
impl SymbolResolver for NmResolver {
    async fn resolve(&self, binary: &Path, symbol: &str) -> Result<Option<u64>> {
        Ok(self.table(binary).await?.get(symbol).copied())
    }
}

/// Parse `nm` output, skipping undefined symbols (they carry no value)
pub(crate) fn parse_nm(text: &str) -> HashMap<String, u64> {
    text.lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let value = parts.next()?;
            let kind = parts.next()?;
            let name = parts.next()?;
            if kind.eq_ignore_ascii_case("u") {
                return None;
            }
            let value = u64::from_str_radix(value, 16).ok()?;
            Some((name.to_string(), value))
        })
        .collect()
}
