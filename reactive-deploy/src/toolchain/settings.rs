//! Tool names, flags and runtime knobs
//!
//! Every field has a default, so a settings file only needs to list what
//! differs on the operator's machine.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Scratch directory for objects, images and symbol tables
    /// (a fresh temporary directory when unset)
    pub work_dir: Option<PathBuf>,
    /// SPONGENT key size in bytes (Sancus security level / 8)
    pub sancus_key_size: usize,
    /// Per-command network timeout
    pub transport_timeout_secs: u64,
    pub sancus: SancusTools,
    pub sgx: SgxTools,
    pub trustzone: TrustZoneTools,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            work_dir: None,
            sancus_key_size: 16,
            transport_timeout_secs: 30,
            sancus: SancusTools::default(),
            sgx: SgxTools::default(),
            trustzone: TrustZoneTools::default(),
        }
    }
}

impl Settings {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data)?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SancusTools {
    pub cc: String,
    pub ld: String,
    /// Linker used to place a module image against a node's symbol table
    pub link: String,
    pub nm: String,
    pub crypto: String,
}

impl Default for SancusTools {
    fn default() -> Self {
        Self {
            cc: "sancus-cc".into(),
            ld: "sancus-ld".into(),
            link: "msp430-ld".into(),
            nm: "msp430-nm".into(),
            crypto: "sancus-crypto".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SgxTools {
    pub codegen: String,
    pub cargo: String,
    pub target: String,
    pub build_mode: String,
    pub elf2sgxs: String,
    pub elf2sgxs_args: Vec<String>,
    pub sign: String,
    pub sign_args: Vec<String>,
    pub keygen: String,
    /// Attestation service provider, started once per run
    pub ra_sp: String,
    pub ra_client: String,
    pub encryptor: String,
}

impl Default for SgxTools {
    fn default() -> Self {
        let strings = |items: &[&str]| -> Vec<String> { items.iter().map(|s| s.to_string()).collect() };
        Self {
            codegen: "rust-sgx-gen".into(),
            cargo: "cargo".into(),
            target: "x86_64-fortanix-unknown-sgx".into(),
            build_mode: "release".into(),
            elf2sgxs: "ftxsgx-elf2sgxs".into(),
            elf2sgxs_args: strings(&[
                "--heap-size", "0x20000", "--stack-size", "0x20000", "--threads", "4",
            ]),
            sign: "sgxs-sign".into(),
            sign_args: strings(&["-d", "--xfrm", "7/0", "--isvprodid", "0", "--isvsvn", "0"]),
            keygen: "ssh-keygen".into(),
            ra_sp: "ra_sp".into(),
            ra_client: "ra_client".into(),
            encryptor: "sgx-encrypt".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrustZoneTools {
    pub make: String,
    pub cross_compile: String,
    pub platform: String,
    pub ta_dev_kit_dir: String,
}

impl Default for TrustZoneTools {
    fn default() -> Self {
        Self {
            make: "make".into(),
            cross_compile: "arm-linux-gnueabihf-".into(),
            platform: "vexpress-qemu_virt".into(),
            ta_dev_kit_dir: "/opt/optee/export-ta_arm32".into(),
        }
    }
}
