use super::{Endpoints, Module};
use crate::context::Context;
use crate::error::{Error, Result};
use crate::memo::Memo;
use crate::node::Deployment;
use std::path::PathBuf;
use std::sync::Arc;

/// Scratch directory of the service-provider key pair; module names never start with a dot
const SP_DIR: &str = ".sp";

/// An SGX enclave written in Rust, generated, built, signed and attested
/// with external tools
#[derive(Debug)]
pub struct SgxModule {
    /// Source directory handed to the code generator
    pub source: PathBuf,
    pub vendor_key: PathBuf,
    pub ra_settings: PathBuf,
    pub features: Vec<String>,
    pub id: u16,
    /// Port of the enclave's attestation endpoint
    pub port: u16,
    code: Memo<Endpoints>,
    binary: Memo<PathBuf>,
    signed: Memo<(PathBuf, PathBuf)>,
    deployment: Memo<()>,
    key: Memo<Vec<u8>>,
}

/// Everything an earlier run already produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SgxState {
    pub binary: PathBuf,
    pub sgxs: PathBuf,
    pub signature: PathBuf,
    pub key: Vec<u8>,
    pub endpoints: Endpoints,
}

impl SgxModule {
    pub fn new(
        source: PathBuf,
        vendor_key: PathBuf,
        ra_settings: PathBuf,
        features: Vec<String>,
        id: u16,
        port: u16,
    ) -> Self {
        Self {
            source,
            vendor_key,
            ra_settings,
            features,
            id,
            port,
            code: Memo::new(),
            binary: Memo::new(),
            signed: Memo::new(),
            deployment: Memo::new(),
            key: Memo::new(),
        }
    }

    pub fn with_state(mut self, state: SgxState) -> Self {
        self.code = Memo::ready(state.endpoints);
        self.binary = Memo::ready(state.binary);
        self.signed = Memo::ready((state.sgxs, state.signature));
        self.deployment = Memo::ready(());
        self.key = Memo::ready(state.key);
        self
    }

    pub(crate) fn state(&self) -> Option<SgxState> {
        let (sgxs, signature) = self.signed.peek()?;
        Some(SgxState {
            binary: self.binary.peek()?,
            sgxs,
            signature,
            key: self.key.peek()?,
            endpoints: self.code.peek()?,
        })
    }

    pub(super) async fn endpoints(&self, module: &Arc<Module>) -> Result<Endpoints> {
        let module = module.clone();
        self.code
            .get_or_init(move || async move { module.sgx()?.generate(&module).await })
            .await
    }

    pub(super) async fn binary(&self, module: &Arc<Module>) -> Result<PathBuf> {
        let module = module.clone();
        self.binary
            .get_or_init(move || async move { module.sgx()?.build(&module).await })
            .await
    }

    pub(super) async fn signed(&self, module: &Arc<Module>) -> Result<(PathBuf, PathBuf)> {
        let module = module.clone();
        self.signed
            .get_or_init(move || async move { module.sgx()?.convert_and_sign(&module).await })
            .await
    }

    pub(super) async fn deployment(&self, module: &Arc<Module>) -> Result<()> {
        let module = module.clone();
        self.deployment
            .get_or_init(move || async move {
                match module.load().await? {
                    Some(Deployment::Sgx) | None => Ok(()),
                    Some(other) => Err(Error::Internal(format!(
                        "unexpected deployment result for {}: {:?}",
                        module.name, other
                    ))),
                }
            })
            .await
    }

    pub(super) async fn key(&self, module: &Arc<Module>) -> Result<Vec<u8>> {
        let module = module.clone();
        self.key
            .get_or_init(move || async move { module.sgx()?.attest(&module).await })
            .await
    }

    async fn generate(&self, module: &Module) -> Result<Endpoints> {
        let ctx = module.context();
        let (sp_public, _) = sp_keys(ctx).await?;
        let output = ctx.module_dir(&module.name)?;

        let args = vec![
            "--input".to_string(),
            self.source.display().to_string(),
            "--output".to_string(),
            output.display().to_string(),
            "--moduleid".to_string(),
            self.id.to_string(),
            "--emport".to_string(),
            module.node.deploy_port.to_string(),
            "--runner".to_string(),
            "sgx".to_string(),
            "--spkey".to_string(),
            sp_public.display().to_string(),
        ];
        let codegen = &ctx.settings.sgx.codegen;
        let out = ctx.runner.output(codegen, &args).await?;
        let endpoints: Endpoints =
            serde_json::from_slice(&out).map_err(|e| Error::ToolOutput {
                command: codegen.clone(),
                reason: e.to_string(),
            })?;

        log::info!("Generated code for module {}", module.name);
        Ok(endpoints)
    }

    async fn build(&self, module: &Arc<Module>) -> Result<PathBuf> {
        self.endpoints(module).await?;
        let ctx = module.context();
        let tools = &ctx.settings.sgx;
        let project = ctx.module_dir(&module.name)?;

        let mut args = vec![
            "build".to_string(),
            "--target".to_string(),
            tools.target.clone(),
            "--manifest-path".to_string(),
            project.join("Cargo.toml").display().to_string(),
        ];
        if tools.build_mode == "release" {
            args.push("--release".into());
        }
        if !self.features.is_empty() {
            args.push("--features".into());
            args.push(self.features.join(" "));
        }
        ctx.runner.run(&tools.cargo, &args).await?;

        let binary = project
            .join("target")
            .join(&tools.target)
            .join(&tools.build_mode)
            .join(&module.name);
        log::info!("Built module {}", module.name);
        Ok(binary)
    }

    async fn convert_and_sign(&self, module: &Arc<Module>) -> Result<(PathBuf, PathBuf)> {
        let binary = self.binary(module).await?;
        let ctx = module.context();
        let tools = &ctx.settings.sgx;

        let sgxs = with_suffix(&binary, "sgxs");
        let sig = with_suffix(&binary, "sig");

        let mut convert = vec![binary.display().to_string()];
        convert.extend(tools.elf2sgxs_args.iter().cloned());
        ctx.runner.run(&tools.elf2sgxs, &convert).await?;

        let mut sign = vec![
            "--key".to_string(),
            self.vendor_key.display().to_string(),
            sgxs.display().to_string(),
            sig.display().to_string(),
        ];
        sign.extend(tools.sign_args.iter().cloned());
        ctx.runner.run(&tools.sign, &sign).await?;

        log::info!("Converted & signed module {}", module.name);
        Ok((sgxs, sig))
    }

    /// Remote attestation against the deployed enclave yields the module key
    async fn attest(&self, module: &Arc<Module>) -> Result<Vec<u8>> {
        self.deployment(module).await?;
        let ctx = module.context();
        ensure_ra_sp(ctx).await?;
        let (_, sig) = self.signed(module).await?;

        let args = vec![
            module.node.ip_address.to_string(),
            self.port.to_string(),
            self.ra_settings.display().to_string(),
            sig.display().to_string(),
        ];
        let key = ctx.runner.output(&ctx.settings.sgx.ra_client, &args).await?;
        log::info!("Done Remote Attestation of {}", module.name);
        Ok(key)
    }
}

fn with_suffix(path: &std::path::Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

/// Service-provider key pair (public PEM, private key), generated once per run
pub(crate) async fn sp_keys(ctx: &Arc<Context>) -> Result<(PathBuf, PathBuf)> {
    let owned = ctx.clone();
    ctx.sp_keys
        .get_or_init(move || async move {
            let dir = owned.module_dir(SP_DIR)?;
            let private = dir.join("private_key.pem");
            let public = dir.join("public_key.pem");
            let keygen = &owned.settings.sgx.keygen;

            // a key left over from an earlier run would make keygen prompt
            if tokio::fs::try_exists(&private).await? {
                tokio::fs::remove_file(&private).await?;
            }
            let generate = vec![
                "-t".to_string(),
                "rsa".to_string(),
                "-f".to_string(),
                private.display().to_string(),
                "-b".to_string(),
                "2048".to_string(),
                "-N".to_string(),
                String::new(),
            ];
            owned.runner.run(keygen, &generate).await?;

            let export = vec![
                "-f".to_string(),
                format!("{}.pub", private.display()),
                "-e".to_string(),
                "-m".to_string(),
                "pem".to_string(),
            ];
            let pem = owned.runner.output(keygen, &export).await?;
            tokio::fs::write(&public, pem).await?;

            log::debug!("Service provider keys in {}", dir.display());
            Ok((public, private))
        })
        .await
}

/// Start the attestation service provider once per run
pub(crate) async fn ensure_ra_sp(ctx: &Arc<Context>) -> Result<()> {
    let owned = ctx.clone();
    ctx.ra_sp
        .get_or_init(move || async move {
            let (_, private) = sp_keys(&owned).await?;
            owned
                .runner
                .spawn(&owned.settings.sgx.ra_sp, &[private.display().to_string()])
                .await
        })
        .await
}
