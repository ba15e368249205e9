//! Run-wide context shared by every node and module
//!
//! Holds the collaborators (transport, process runner, symbol resolver,
//! Sancus crypto), the settings, the scratch directory, and the few
//! pipeline stages that happen once per run rather than once per module.

use crate::error::Result;
use crate::memo::Memo;
use crate::network::{TcpTransport, Transport};
use crate::toolchain::{
    NmResolver, ProcessRunner, SancusCrypto, SancusCryptoTool, Settings, SymbolResolver,
    SystemRunner,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub struct Context {
    pub settings: Settings,
    pub transport: Arc<dyn Transport>,
    pub runner: Arc<dyn ProcessRunner>,
    pub symbols: Arc<dyn SymbolResolver>,
    pub sancus_crypto: Arc<dyn SancusCrypto>,
    work_dir: PathBuf,
    /// Attestation service-provider key pair (public PEM, private key)
    pub(crate) sp_keys: Memo<(PathBuf, PathBuf)>,
    pub(crate) ra_sp: Memo<()>,
}

impl Context {
    /// Context backed by the real tools and TCP
    pub fn system(settings: Settings) -> Result<Self> {
        let runner: Arc<dyn ProcessRunner> = Arc::new(SystemRunner::new());
        let transport = Arc::new(TcpTransport::new(Duration::from_secs(
            settings.transport_timeout_secs,
        )));
        let symbols = Arc::new(NmResolver::new(runner.clone(), settings.sancus.nm.clone()));
        let sancus_crypto = Arc::new(SancusCryptoTool::new(
            runner.clone(),
            settings.sancus.crypto.clone(),
        ));
        Self::new(settings, transport, runner, symbols, sancus_crypto)
    }

    pub fn new(
        settings: Settings,
        transport: Arc<dyn Transport>,
        runner: Arc<dyn ProcessRunner>,
        symbols: Arc<dyn SymbolResolver>,
        sancus_crypto: Arc<dyn SancusCrypto>,
    ) -> Result<Self> {
        // a dumped configuration refers to artifacts in here, so it outlives the run
        let work_dir = match &settings.work_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                dir.clone()
            }
            None => tempfile::Builder::new()
                .prefix("reactive-deploy")
                .keep(true)
                .tempdir()?
                .path()
                .to_path_buf(),
        };
        log::debug!("Scratch directory: {}", work_dir.display());

        Ok(Self {
            settings,
            transport,
            runner,
            symbols,
            sancus_crypto,
            work_dir,
            sp_keys: Memo::new(),
            ra_sp: Memo::new(),
        })
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// Per-module scratch directory, created on first use
    pub fn module_dir(&self, module: &str) -> Result<PathBuf> {
        let dir = self.work_dir.join(module);
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("work_dir", &self.work_dir)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}
