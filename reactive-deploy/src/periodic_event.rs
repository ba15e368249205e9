//! Periodic events - entry points a node invokes on a timer

use crate::error::{Error, Result};
use crate::module::{EndpointRef, Module};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Smallest and largest accepted period, in milliseconds
pub const MIN_FREQUENCY: u64 = 1;
pub const MAX_FREQUENCY: u64 = u32::MAX as u64;

#[derive(Debug)]
pub struct PeriodicEvent {
    pub module: Arc<Module>,
    pub entry: EndpointRef,
    /// Period in milliseconds
    pub frequency: u32,
    registered: AtomicBool,
}

impl PeriodicEvent {
    pub fn new(module: Arc<Module>, entry: EndpointRef, frequency: u64) -> Result<Self> {
        Ok(Self {
            module,
            entry,
            frequency: check_frequency(frequency)?,
            registered: AtomicBool::new(false),
        })
    }

    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::SeqCst)
    }

    pub async fn register(&self) -> Result<()> {
        let node = &self.module.node;
        node.register_entrypoint(&self.module, &self.entry, self.frequency)
            .await?;
        self.registered.store(true, Ordering::SeqCst);

        log::info!(
            "Registered {}:{} on {} every {} ms",
            self.module.name,
            self.entry,
            node.name,
            self.frequency
        );
        Ok(())
    }
}

pub fn check_frequency(frequency: u64) -> Result<u32> {
    if !(MIN_FREQUENCY..=MAX_FREQUENCY).contains(&frequency) {
        return Err(Error::FrequencyOutOfRange(frequency));
    }
    u32::try_from(frequency).map_err(|_| Error::FrequencyOutOfRange(frequency))
}
