//! Native module backend
//!
//! Same code generator and cargo build as SGX but targeting the host triple,
//! with no enclave conversion or signing. The module key is generated by the
//! code generator and embedded at build time, so "attestation" merely
//! materializes it.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::info;

use trellis_core::Encryption;

use crate::context::{BuildContext, BuildMode};
use crate::descriptor::{opt_hex, opt_path, opt_str, opt_u16, str_list};
use crate::error::{Error, Result};
use crate::modules::sgx::generate_code;
use crate::modules::{ModuleCommon, ModuleData, ModuleOps};
use crate::nodes::{NativeNode, Node};
use crate::rules;
use crate::tools::{self, argv};

#[derive(Debug)]
pub struct NativeModule {
    common: ModuleCommon,
    pub features: Vec<String>,
    pub id: u16,
    pub port: u16,
    folder: String,
    /// Endpoint tables plus the build-time generated key
    generated: OnceCell<(ModuleData, Option<Vec<u8>>)>,
    binary: OnceCell<PathBuf>,
    loaded: OnceCell<()>,
}

impl NativeModule {
    pub fn load(map: &serde_json::Map<String, Value>, nodes: &[Arc<Node>]) -> Result<Self> {
        rules::check_module("native", map)?;
        let what = "native module";

        let common = ModuleCommon::load(map, nodes, what)?;
        let node = common.node.as_native().ok_or(Error::Configuration {
            module_type: "native",
            node: common.node.name().to_string(),
            node_type: common.node.ty(),
        })?;

        let id = match opt_u16(map, "id", what)? {
            Some(id) => id,
            None => node.next_module_id(),
        };
        let port = opt_u16(map, "port", what)?.unwrap_or(common.node.reactive_port() + id);
        let folder = opt_str(map, "folder").unwrap_or_else(|| common.name.clone());

        let data = match map.get("data").filter(|v| !v.is_null()) {
            Some(v) => Some(serde_json::from_value::<ModuleData>(v.clone())?),
            None => None,
        };
        let key = opt_hex(map, "key")?;
        let generated = data.map(|d| (d, key));

        Ok(Self {
            common,
            features: str_list(map, "features", what)?,
            id,
            port,
            folder,
            generated: OnceCell::new_with(generated),
            binary: OnceCell::new_with(opt_path(map, "binary")),
            loaded: OnceCell::new(),
        })
    }

    pub fn dump(&self) -> Value {
        let deployed = self.common.deployed();
        json!({
            "type": "native",
            "name": self.common.name,
            "node": self.common.node.name(),
            "priority": self.common.priority,
            "deployed": deployed,
            "nonce": self.common.nonce(),
            "attested": self.common.attested(),
            "features": self.features,
            "id": self.id,
            "binary": deployed.then(|| self.binary.get().map(|b| b.display().to_string())).flatten(),
            // The key exists from build time onward, but is only meaningful
            // once the binary embedding it has been deployed.
            "key": deployed
                .then(|| self.generated.get().and_then(|(_, key)| key.as_ref().map(hex::encode)))
                .flatten(),
            "data": deployed
                .then(|| {
                    self.generated
                        .get()
                        .map(|(data, _)| serde_json::to_value(data).unwrap_or(Value::Null))
                })
                .flatten(),
            "folder": self.folder,
            "port": self.port,
        })
    }

    fn node_native(&self) -> Result<&NativeNode> {
        self.common.node.as_native().ok_or(Error::Configuration {
            module_type: "native",
            node: self.common.node.name().to_string(),
            node_type: self.common.node.ty(),
        })
    }

    async fn generate(&self, ctx: &BuildContext) -> Result<&(ModuleData, Option<Vec<u8>>)> {
        self.generated
            .get_or_try_init(|| async {
                let output = generate_code(
                    &self.common.name,
                    &self.folder,
                    self.id,
                    self.common.node.deploy_port(),
                    "native",
                    None,
                    ctx,
                )
                .await?;

                let key = match output.key {
                    Some(key) => Some(hex::decode(&key)?),
                    None => None,
                };
                Ok((output.data, key))
            })
            .await
    }

    async fn module_data(&self, ctx: &BuildContext) -> Result<&ModuleData> {
        Ok(&self.generate(ctx).await?.0)
    }
}

#[async_trait]
impl ModuleOps for NativeModule {
    fn common(&self) -> &ModuleCommon {
        &self.common
    }

    fn supported_encryption(&self) -> &'static [Encryption] {
        &[Encryption::Aes, Encryption::Spongent]
    }

    async fn build(&self, ctx: &BuildContext) -> Result<PathBuf> {
        self.binary
            .get_or_try_init(|| async {
                self.generate(ctx).await?;

                let output = ctx.module_dir(&self.folder)?;
                let mut args = argv(["cargo", "build"]);
                if ctx.mode == BuildMode::Release {
                    args.push("--release".into());
                }
                if !self.features.is_empty() {
                    args.push("--features".into());
                    args.push(self.features.join(" "));
                }
                args.push(format!("--manifest-path={}/Cargo.toml", output.display()));
                tools::run(&args).await?;

                let binary = output
                    .join("target")
                    .join(ctx.mode.as_str())
                    .join(&self.folder);

                info!("Built module {}", self.common.name);
                Ok(binary)
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
                self.node_native()?
                    .load_module(&self.common.name, &binary)
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

        // No challenge to run: obtaining the generated key is the whole flow.
        self.key(ctx).await?;
        self.common.mark_attested();

        info!("Attestation of {} succeeded", self.common.name);
        Ok(())
    }

    async fn key(&self, ctx: &BuildContext) -> Result<Vec<u8>> {
        let (_, key) = self.generate(ctx).await?;
        key.clone().ok_or_else(|| {
            Error::attestation(&self.common.name, "code generator emitted no module key")
        })
    }

    async fn get_id(&self, _ctx: &BuildContext) -> Result<u16> {
        Ok(self.id)
    }

    async fn input_id(&self, name: &str, ctx: &BuildContext) -> Result<u16> {
        let data = self.module_data(ctx).await?;
        data.lookup(&data.inputs, &self.common.name, name)
    }

    async fn output_id(&self, name: &str, ctx: &BuildContext) -> Result<u16> {
        let data = self.module_data(ctx).await?;
        data.lookup(&data.outputs, &self.common.name, name)
    }

    async fn entry_id(&self, name: &str, ctx: &BuildContext) -> Result<u16> {
        let data = self.module_data(ctx).await?;
        data.lookup(&data.entrypoints, &self.common.name, name)
    }

    async fn request_id(&self, name: &str, ctx: &BuildContext) -> Result<u16> {
        let data = self.module_data(ctx).await?;
        data.lookup(&data.requests, &self.common.name, name)
    }

    async fn handler_id(&self, name: &str, ctx: &BuildContext) -> Result<u16> {
        let data = self.module_data(ctx).await?;
        data.lookup(&data.handlers, &self.common.name, name)
    }
}
