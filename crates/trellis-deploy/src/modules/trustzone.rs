//! TrustZone module backend
//!
//! Trusted applications build out of a per-module source directory with the
//! OP-TEE dev kit; the TA file is named after the module UUID, which is
//! derived deterministically from the module id. Endpoint indices come from
//! explicit descriptor tables, and the module key is provisioned through the
//! descriptor.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::OnceCell;
use uuid::Uuid;

use trellis_core::Encryption;

use crate::context::BuildContext;
use crate::descriptor::{opt_hex_sized, opt_index_table, opt_path, opt_u16, req_path};
use crate::error::{Error, Result};
use crate::modules::{ModuleCommon, ModuleOps};
use crate::nodes::{Node, TrustZoneNode};
use crate::rules;
use crate::tools::{self, argv};

const CROSS_COMPILE: &str = "CROSS_COMPILE=arm-linux-gnueabihf-";
const PLATFORM: &str = "PLATFORM=vexpress-qemu_virt";
const TA_DEV_KIT_DIR: &str = "TA_DEV_KIT_DIR=/optee/optee_os/out/arm/export-ta_arm32";

#[derive(Debug)]
pub struct TrustZoneModule {
    common: ModuleCommon,
    pub files_dir: PathBuf,
    pub id: u16,
    key: Option<Vec<u8>>,
    pub inputs: HashMap<String, u16>,
    pub outputs: HashMap<String, u16>,
    pub entrypoints: HashMap<String, u16>,
    binary: OnceCell<PathBuf>,
    attested_once: OnceCell<()>,
    loaded: OnceCell<()>,
}

impl TrustZoneModule {
    pub fn load(map: &serde_json::Map<String, Value>, nodes: &[Arc<Node>]) -> Result<Self> {
        rules::check_module("trustzone", map)?;
        let what = "trustzone module";

        let common = ModuleCommon::load(map, nodes, what)?;
        let node = common.node.as_trustzone().ok_or(Error::Configuration {
            module_type: "trustzone",
            node: common.node.name().to_string(),
            node_type: common.node.ty(),
        })?;

        let id = match opt_u16(map, "id", what)? {
            Some(id) => id,
            None => node.next_module_id(),
        };

        Ok(Self {
            common,
            files_dir: req_path(map, "files_dir", what)?,
            id,
            key: opt_hex_sized(map, "key", Encryption::Aes.key_size(), what)?,
            inputs: opt_index_table(map, "inputs", what)?,
            outputs: opt_index_table(map, "outputs", what)?,
            entrypoints: opt_index_table(map, "entrypoints", what)?,
            binary: OnceCell::new_with(opt_path(map, "binary")),
            attested_once: OnceCell::new(),
            loaded: OnceCell::new(),
        })
    }

    pub fn dump(&self) -> Value {
        let deployed = self.common.deployed();
        json!({
            "type": "trustzone",
            "name": self.common.name,
            "node": self.common.node.name(),
            "priority": self.common.priority,
            "deployed": deployed,
            "nonce": self.common.nonce(),
            "attested": self.common.attested(),
            "files_dir": self.files_dir.display().to_string(),
            "binary": deployed.then(|| self.binary.get().map(|b| b.display().to_string())).flatten(),
            "id": self.id,
            "key": self.key.as_ref().map(hex::encode),
            "inputs": self.inputs,
            "outputs": self.outputs,
            "entrypoints": self.entrypoints,
        })
    }

    fn node_trustzone(&self) -> Result<&TrustZoneNode> {
        self.common.node.as_trustzone().ok_or(Error::Configuration {
            module_type: "trustzone",
            node: self.common.node.name().to_string(),
            node_type: self.common.node.ty(),
        })
    }

    /// The TA UUID, derived deterministically from the module id.
    pub fn uuid(&self) -> Uuid {
        Uuid::from_u128(u128::from(self.id))
    }

    pub fn uuid_bytes(&self) -> [u8; 16] {
        *self.uuid().as_bytes()
    }

    fn lookup(&self, table: &HashMap<String, u16>, name: &str) -> Result<u16> {
        table.get(name).copied().ok_or_else(|| Error::NoSuchEndpoint {
            module: self.common.name.clone(),
            endpoint: name.to_string(),
        })
    }
}

#[async_trait]
impl ModuleOps for TrustZoneModule {
    fn common(&self) -> &ModuleCommon {
        &self.common
    }

    fn supported_encryption(&self) -> &'static [Encryption] {
        &[Encryption::Aes, Encryption::Spongent]
    }

    async fn build(&self, ctx: &BuildContext) -> Result<PathBuf> {
        let _ = ctx;
        self.binary
            .get_or_try_init(|| async {
                let uuid = self.uuid().to_string();
                let ta_dir = self.files_dir.join(&self.common.name);

                tools::run(&argv([
                    "make",
                    "-C",
                    ta_dir.display().to_string().as_str(),
                    CROSS_COMPILE,
                    PLATFORM,
                    TA_DEV_KIT_DIR,
                    format!("BINARY={uuid}").as_str(),
                ]))
                .await?;

                Ok(ta_dir.join(format!("{uuid}.ta")))
            })
            .await
            .cloned()
    }

    async fn deploy(&self, ctx: &BuildContext) -> Result<()> {
        if self.common.deployed() {
            return Ok(());
        }

        self.loaded
            .get_or_try_init(|| async {
                let binary = self.build(ctx).await?;
                self.node_trustzone()?
                    .load_module(&self.common.name, self.uuid_bytes(), &binary)
                    .await?;
                self.common.mark_deployed();
                Ok::<(), Error>(())
            })
            .await?;
        Ok(())
    }

    async fn attest(&self, ctx: &BuildContext) -> Result<()> {
        if self.common.attested() {
            return Ok(());
        }

        let key = self.key(ctx).await?;
        self.attested_once
            .get_or_try_init(|| async {
                self.node_trustzone()?
                    .attest_module(&self.common.name, self.uuid_bytes(), &key)
                    .await
            })
            .await?;

        self.common.mark_attested();
        Ok(())
    }

    async fn key(&self, _ctx: &BuildContext) -> Result<Vec<u8>> {
        self.key.clone().ok_or_else(|| {
            Error::preflight(format!(
                "module key of {} not present in descriptor",
                self.common.name
            ))
        })
    }

    async fn get_id(&self, _ctx: &BuildContext) -> Result<u16> {
        Ok(self.id)
    }

    async fn input_id(&self, name: &str, _ctx: &BuildContext) -> Result<u16> {
        self.lookup(&self.inputs, name)
    }

    async fn output_id(&self, name: &str, _ctx: &BuildContext) -> Result<u16> {
        self.lookup(&self.outputs, name)
    }

    async fn entry_id(&self, name: &str, _ctx: &BuildContext) -> Result<u16> {
        self.lookup(&self.entrypoints, name)
    }

    async fn request_id(&self, name: &str, _ctx: &BuildContext) -> Result<u16> {
        Err(Error::NoSuchEndpoint {
            module: self.common.name.clone(),
            endpoint: name.to_string(),
        })
    }

    async fn handler_id(&self, name: &str, _ctx: &BuildContext) -> Result<u16> {
        Err(Error::NoSuchEndpoint {
            module: self.common.name.clone(),
            endpoint: name.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_derivation() {
        let uuid = Uuid::from_u128(7);
        assert_eq!(uuid.to_string(), "00000000-0000-0000-0000-000000000007");
        assert_eq!(
            uuid.as_bytes(),
            &[0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 7]
        );
    }
}
