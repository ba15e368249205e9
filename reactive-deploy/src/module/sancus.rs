use super::Module;
use crate::error::{Error, Result};
use crate::memo::Memo;
use crate::node::{Deployment, NodeKind};
use futures::future::join_all;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// A Sancus module built from C sources
#[derive(Debug)]
pub struct SancusModule {
    pub files: Vec<PathBuf>,
    pub cflags: Vec<String>,
    pub ldflags: Vec<String>,
    binary: Memo<PathBuf>,
    /// Node-assigned id and symbol table
    deployment: Memo<(u16, PathBuf)>,
    key: Memo<Vec<u8>>,
}

impl SancusModule {
    pub fn new(files: Vec<PathBuf>, cflags: Vec<String>, ldflags: Vec<String>) -> Self {
        Self {
            files,
            cflags,
            ldflags,
            binary: Memo::new(),
            deployment: Memo::new(),
            key: Memo::new(),
        }
    }

    /// Start from results of an earlier run
    pub fn with_state(
        mut self,
        binary: PathBuf,
        id: u16,
        symtab: PathBuf,
        key: Vec<u8>,
    ) -> Self {
        self.binary = Memo::ready(binary);
        self.deployment = Memo::ready((id, symtab));
        self.key = Memo::ready(key);
        self
    }

    pub(super) async fn binary(&self, module: &Arc<Module>) -> Result<PathBuf> {
        let module = module.clone();
        self.binary
            .get_or_init(move || async move { module.sancus()?.build(&module).await })
            .await
    }

    pub(super) async fn deployment(&self, module: &Arc<Module>) -> Result<(u16, PathBuf)> {
        let module = module.clone();
        self.deployment
            .get_or_init(move || async move {
                match module.load().await? {
                    Some(Deployment::Sancus { id, symtab }) => Ok((id, symtab)),
                    _ => Err(Error::Protocol(format!(
                        "{} is marked deployed but its id and symbol table are unknown",
                        module.name
                    ))),
                }
            })
            .await
    }

    pub(super) async fn key(&self, module: &Arc<Module>) -> Result<Vec<u8>> {
        let module = module.clone();
        self.key
            .get_or_init(move || async move { module.sancus()?.derive_key(&module).await })
            .await
    }

    pub(super) async fn io_id(&self, module: &Arc<Module>, name: &str) -> Result<Option<u16>> {
        self.symbol(module, &format!("__sm_{}_io_{}_idx", module.name, name))
            .await
    }

    pub(super) async fn entry_id(&self, module: &Arc<Module>, name: &str) -> Result<Option<u16>> {
        self.symbol(module, &format!("__sm_{}_entry_{}_idx", module.name, name))
            .await
    }

    /// Cached values for dumping: (binary, id, symtab, key)
    pub(crate) fn state(&self) -> Option<(PathBuf, u16, PathBuf, Vec<u8>)> {
        let binary = self.binary.peek()?;
        let (id, symtab) = self.deployment.peek()?;
        let key = self.key.peek()?;
        Some((binary, id, symtab, key))
    }

    async fn symbol(&self, module: &Arc<Module>, symbol: &str) -> Result<Option<u16>> {
        let binary = self.binary(module).await?;
        let value = module.context().symbols.resolve(&binary, symbol).await?;
        value
            .map(|v| {
                u16::try_from(v).map_err(|_| {
                    Error::Protocol(format!("{} of {} out of range: {}", symbol, module.name, v))
                })
            })
            .transpose()
    }

    /// Compile every source concurrently, then link
    async fn build(&self, module: &Module) -> Result<PathBuf> {
        log::info!("Building module {}", module.name);
        let ctx = module.context();
        let tools = &ctx.settings.sancus;
        let dir = ctx.module_dir(&module.name)?;
        let debug = log::log_enabled!(log::Level::Debug);

        let objects: Vec<PathBuf> = self
            .files
            .iter()
            .enumerate()
            .map(|(i, src)| dir.join(format!("{}-{}.o", i, file_stem(src))))
            .collect();

        // every compiler runs to completion before the first failure is reported
        join_all(self.files.iter().zip(&objects).map(|(src, obj)| {
            let mut args: Vec<String> = Vec::new();
            if debug {
                args.push("--debug".into());
            }
            args.extend(self.cflags.iter().cloned());
            args.extend([
                "-c".into(),
                "-o".into(),
                obj.display().to_string(),
                src.display().to_string(),
            ]);
            async move { ctx.runner.run(&tools.cc, &args).await }
        }))
        .await
        .into_iter()
        .collect::<Result<Vec<()>>>()?;

        let binary = dir.join(format!("{}.elf", module.name));
        let mut args: Vec<String> = Vec::new();
        if debug {
            args.push("--debug".into());
        }
        args.push("--inline-arithmetic".into());
        args.extend(self.ldflags.iter().cloned());
        if !self.ldflags.iter().any(|f| f.starts_with("--num-connections")) {
            args.push("--num-connections".into());
            args.push(module.connection_count().to_string());
        }
        args.push("-o".into());
        args.push(binary.display().to_string());
        args.extend(objects.iter().map(|o| o.display().to_string()));
        ctx.runner.run(&tools.ld, &args).await?;

        Ok(binary)
    }

    /// Link against the node's symbol table, then derive the key from the result
    async fn derive_key(&self, module: &Arc<Module>) -> Result<Vec<u8>> {
        let (_, symtab) = self.deployment(module).await?;
        let binary = self.binary(module).await?;
        let ctx = module.context();

        let linked = ctx
            .module_dir(&module.name)?
            .join(format!("{}-linked.elf", module.name));
        let args = vec![
            "-T".to_string(),
            symtab.display().to_string(),
            "-o".to_string(),
            linked.display().to_string(),
            "--noinhibit-exec".to_string(),
            binary.display().to_string(),
        ];
        ctx.runner.run(&ctx.settings.sancus.link, &args).await?;

        let vendor_key = match &module.node.kind {
            NodeKind::Sancus(node) => &node.vendor_key,
            _ => return Err(module.wrong_kind("sancus")),
        };
        let key = ctx
            .sancus_crypto
            .module_key(&linked, &module.name, vendor_key)
            .await?;
        log::debug!("Module key for {}: {}", module.name, hex::encode(&key));
        Ok(key)
    }
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "src".into())
}
