use super::{Endpoints, Module};
use crate::error::{Error, Result};
use crate::memo::Memo;
use crate::node::Deployment;
use std::path::PathBuf;
use std::sync::Arc;

/// An OP-TEE trusted application built with the TA dev kit
#[derive(Debug)]
pub struct TrustZoneModule {
    /// Directory holding one sub-directory per application
    pub files: PathBuf,
    pub id: u128,
    pub endpoints: Endpoints,
    binary: Memo<PathBuf>,
    /// The module key handed back on load
    deployment: Memo<Vec<u8>>,
}

impl TrustZoneModule {
    pub fn new(files: PathBuf, id: u128, endpoints: Endpoints) -> Self {
        Self {
            files,
            id,
            endpoints,
            binary: Memo::new(),
            deployment: Memo::new(),
        }
    }

    /// Pre-fill whatever an earlier run recorded
    pub fn with_state(mut self, binary: Option<PathBuf>, key: Option<Vec<u8>>) -> Self {
        self.binary = Memo::from_option(binary);
        self.deployment = Memo::from_option(key);
        self
    }

    pub(crate) fn state(&self) -> Option<(PathBuf, Vec<u8>)> {
        Some((self.binary.peek()?, self.deployment.peek()?))
    }

    /// The application's UUID, also the name of the built `.ta` file
    pub fn uuid(&self) -> String {
        uuid::Uuid::from_u128(self.id).hyphenated().to_string()
    }

    pub(super) async fn binary(&self, module: &Arc<Module>) -> Result<PathBuf> {
        let module = module.clone();
        self.binary
            .get_or_init(move || async move { module.trustzone()?.build(&module).await })
            .await
    }

    pub(super) async fn deployment(&self, module: &Arc<Module>) -> Result<Vec<u8>> {
        let module = module.clone();
        self.deployment
            .get_or_init(move || async move {
                match module.load().await? {
                    Some(Deployment::TrustZone { key }) => Ok(key),
                    _ => Err(Error::Protocol(format!(
                        "{} is marked deployed but its module key is unknown",
                        module.name
                    ))),
                }
            })
            .await
    }

    async fn build(&self, module: &Module) -> Result<PathBuf> {
        let ctx = module.context();
        let tools = &ctx.settings.trustzone;
        let uuid = self.uuid();
        let dir = self.files.join(&module.name);

        let args = vec![
            "-C".to_string(),
            dir.display().to_string(),
            format!("CROSS_COMPILE={}", tools.cross_compile),
            format!("PLATFORM={}", tools.platform),
            format!("TA_DEV_KIT_DIR={}", tools.ta_dev_kit_dir),
            format!("BINARY={}", uuid),
        ];
        ctx.runner.run(&tools.make, &args).await?;

        log::info!("Built module {} ({})", module.name, uuid);
        Ok(dir.join(format!("{}.ta", uuid)))
    }
}
