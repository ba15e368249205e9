//! Toolchain collaborators - subprocesses, symbol tables and Sancus crypto
//!
//! Compilers, signers, code generators and attestation helpers are opaque
//! programs. Each concern sits behind a trait so a run can be driven
//! against the real tools or against test doubles.

mod process;
mod sancus_crypto;
mod settings;
mod symbols;

pub use process::{ProcessRunner, SystemRunner};
pub use sancus_crypto::{SancusCrypto, SancusCryptoTool};
pub use settings::{SancusTools, Settings, SgxTools, TrustZoneTools};
pub use symbols::{NmResolver, SymbolResolver};

#[cfg(test)]
pub(crate) use process::command_line;
