//! Deployment orchestration
//!
//! An install runs four phases, each finishing before the next starts:
//! priority modules one by one (ascending priority), the remaining
//! modules (in declaration order or all at once), every connection, and
//! every periodic event. Within a concurrent phase the first failure ends
//! the phase; tasks already running are left to finish on their own.

use crate::config::Config;
use crate::connection::ConnectionIds;
use crate::error::{Error, Result};
use crate::module::EndpointRef;
use futures::stream::{FuturesUnordered, StreamExt};
use std::future::Future;
use std::sync::Arc;

/// How the non-priority modules are deployed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeployOrder {
    /// One after the other, in declaration order
    Ordered,
    #[default]
    Concurrent,
}

pub struct Deployer<'a> {
    config: &'a Config,
    ids: Arc<ConnectionIds>,
}

impl<'a> Deployer<'a> {
    pub fn new(config: &'a Config) -> Self {
        Self {
            config,
            ids: Arc::new(ConnectionIds::new()),
        }
    }

    pub fn connection_ids(&self) -> &ConnectionIds {
        &self.ids
    }

    pub async fn install(&self, order: DeployOrder) -> Result<()> {
        self.deploy_priority_modules().await?;
        self.deploy_modules(order).await?;
        self.establish_connections().await?;
        self.register_periodic_events().await?;
        log::info!("Deployment complete");
        Ok(())
    }

    /// Modules with a priority, lowest first; ties keep declaration order
    pub async fn deploy_priority_modules(&self) -> Result<()> {
        let mut modules: Vec<_> = self
            .config
            .modules
            .iter()
            .filter(|m| m.priority.is_some())
            .collect();
        modules.sort_by_key(|m| m.priority);
        log::debug!(
            "Priority modules: {:?}",
            modules.iter().map(|m| m.name.as_str()).collect::<Vec<_>>()
        );

        for module in modules {
            module.deploy().await?;
        }
        Ok(())
    }

    /// Every module; those already deployed are no-ops
    pub async fn deploy_modules(&self, order: DeployOrder) -> Result<()> {
        match order {
            DeployOrder::Ordered => {
                for module in &self.config.modules {
                    module.deploy().await?;
                }
                Ok(())
            }
            DeployOrder::Concurrent => {
                let tasks = self.config.modules.iter().map(|module| {
                    let module = module.clone();
                    async move { module.deploy().await }
                });
                join_all_fail_fast("deploy", tasks).await
            }
        }
    }

    pub async fn establish_connections(&self) -> Result<()> {
        let tasks = self.config.connections.iter().map(|connection| {
            let connection = connection.clone();
            let ids = self.ids.clone();
            async move { connection.establish(&ids).await.map(|_| ()) }
        });
        join_all_fail_fast("connect", tasks).await
    }

    pub async fn register_periodic_events(&self) -> Result<()> {
        let tasks = self.config.periodic_events.iter().map(|event| {
            let event = event.clone();
            async move { event.register().await }
        });
        join_all_fail_fast("register", tasks).await
    }

    /// Call an entry point of a module, deploying it first if needed
    pub async fn call(&self, module: &str, entry: &EndpointRef, arg: Option<&[u8]>) -> Result<()> {
        let module = self.config.module(module)?;
        module.deploy().await?;
        module.call(entry, arg).await
    }
}

/// Spawn every task and wait for all of them; the first error is returned
/// without cancelling the others
async fn join_all_fail_fast<I, F>(phase: &str, tasks: I) -> Result<()>
where
    I: IntoIterator<Item = F>,
    F: Future<Output = Result<()>> + Send + 'static,
{
    let mut running: FuturesUnordered<_> = tasks.into_iter().map(tokio::spawn).collect();
    let total = running.len();

    while let Some(joined) = running.next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                log::debug!("{} phase failed: {}", phase, e);
                return Err(e);
            }
            Err(e) => return Err(Error::from(e)),
        }
    }
    log::debug!("{} phase: {} tasks done", phase, total);
    Ok(())
}
