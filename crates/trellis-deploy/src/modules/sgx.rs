//! SGX module backend
//!
//! The module crate is generated from the user's source folder, cross-built
//! for `x86_64-fortanix-unknown-sgx`, converted to SGXS and signed with the
//! vendor key. The module key is not derivable locally: it is the outcome of
//! IAS-backed remote attestation, performed by an external attester that
//! receives its parameters through environment variables and prints the
//! derived key on stdout.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::info;

use trellis_core::Encryption;

use crate::context::{path_str, BuildContext, BuildMode};
use crate::descriptor::{opt_hex, opt_path, opt_str, opt_u16, req_path, str_list};
use crate::error::{Error, Result};
use crate::modules::{ModuleCommon, ModuleData, ModuleOps};
use crate::nodes::{Node, SgxNode};
use crate::rules;
use crate::tools::{self, argv};

const CODEGEN: &str = "rust-sgx-gen";
const CONVERT: &str = "ftxsgx-elf2sgxs";
const SIGN: &str = "sgxs-sign";
const RA_CLIENT: &str = "ra_client";
const SGX_TARGET: &str = "x86_64-fortanix-unknown-sgx";

/// What the code generator prints on stdout
#[derive(Deserialize)]
pub(crate) struct CodegenOutput {
    #[serde(flatten)]
    pub data: ModuleData,
    /// Present for native modules only, where the key is embedded at build
    /// time.
    #[serde(default)]
    pub key: Option<String>,
}

#[derive(Debug)]
pub struct SgxModule {
    common: ModuleCommon,
    pub vendor_key: PathBuf,
    pub ra_settings: PathBuf,
    pub features: Vec<String>,
    pub id: u16,
    folder: String,
    data: OnceCell<ModuleData>,
    binary: OnceCell<PathBuf>,
    converted: OnceCell<(PathBuf, PathBuf)>,
    key: OnceCell<Vec<u8>>,
    loaded: OnceCell<()>,
}

impl SgxModule {
    pub fn load(map: &serde_json::Map<String, Value>, nodes: &[Arc<Node>]) -> Result<Self> {
        rules::check_module("sgx", map)?;
        let what = "sgx module";

        let common = ModuleCommon::load(map, nodes, what)?;
        let node = common.node.as_sgx().ok_or(Error::Configuration {
            module_type: "sgx",
            node: common.node.name().to_string(),
            node_type: common.node.ty(),
        })?;

        let id = match opt_u16(map, "id", what)? {
            Some(id) => id,
            None => node.next_module_id(),
        };
        let folder = opt_str(map, "folder").unwrap_or_else(|| common.name.clone());

        let sgxs = opt_path(map, "sgxs");
        let signature = opt_path(map, "signature");
        let converted = match (sgxs, signature) {
            (Some(sgxs), Some(sig)) => Some((sgxs, sig)),
            _ => None,
        };

        let data = match map.get("data").filter(|v| !v.is_null()) {
            Some(v) => Some(serde_json::from_value(v.clone())?),
            None => None,
        };

        let key = opt_hex(map, "key")?;
        if key.is_some() {
            // A key only exists as the outcome of remote attestation.
            common.mark_attested();
        }

        Ok(Self {
            common,
            vendor_key: req_path(map, "vendor_key", what)?,
            ra_settings: req_path(map, "ra_settings", what)?,
            features: str_list(map, "features", what)?,
            id,
            folder,
            data: OnceCell::new_with(data),
            binary: OnceCell::new_with(opt_path(map, "binary")),
            converted: OnceCell::new_with(converted),
            key: OnceCell::new_with(key),
            loaded: OnceCell::new(),
        })
    }

    pub fn dump(&self) -> Value {
        json!({
            "type": "sgx",
            "name": self.common.name,
            "node": self.common.node.name(),
            "priority": self.common.priority,
            "deployed": self.common.deployed(),
            "nonce": self.common.nonce(),
            "attested": self.common.attested(),
            "vendor_key": self.vendor_key.display().to_string(),
            "ra_settings": self.ra_settings.display().to_string(),
            "features": self.features,
            "id": self.id,
            "binary": self.binary.get().map(|b| b.display().to_string()),
            "sgxs": self.converted.get().map(|c| c.0.display().to_string()),
            "signature": self.converted.get().map(|c| c.1.display().to_string()),
            "key": self.key.get().map(hex::encode),
            "data": self.data.get().map(|d| serde_json::to_value(d).unwrap_or(Value::Null)),
            "folder": self.folder,
        })
    }

    fn node_sgx(&self) -> Result<&SgxNode> {
        self.common.node.as_sgx().ok_or(Error::Configuration {
            module_type: "sgx",
            node: self.common.node.name().to_string(),
            node_type: self.common.node.ty(),
        })
    }

    /// Port the enclave listens on for the attestation handshake.
    pub fn attestation_port(&self) -> u16 {
        self.common.node.reactive_port() + self.id
    }

    async fn module_data(&self, ctx: &BuildContext) -> Result<&ModuleData> {
        self.data
            .get_or_try_init(|| async {
                let output = generate_code(
                    &self.common.name,
                    &self.folder,
                    self.id,
                    self.common.node.deploy_port(),
                    "sgx",
                    Some(&path_str(&ctx.sp_credentials().await?.pubkey)),
                    ctx,
                )
                .await?;
                Ok(output.data)
            })
            .await
    }

    async fn convert_and_sign(&self, ctx: &BuildContext) -> Result<(PathBuf, PathBuf)> {
        self.converted
            .get_or_try_init(|| async {
                let binary = self.build(ctx).await?;
                let sgxs = PathBuf::from(format!("{}.sgxs", binary.display()));
                let sig = PathBuf::from(format!("{}.sig", binary.display()));
                let debug = ctx.mode == BuildMode::Debug;

                let mut convert = argv([
                    CONVERT,
                    path_str(&binary).as_str(),
                    "--heap-size",
                    "0x20000",
                    "--stack-size",
                    "0x20000",
                    "--threads",
                    "4",
                ]);
                if debug {
                    convert.push("--debug".into());
                }
                tools::run(&convert).await?;

                let mut sign = argv([
                    SIGN,
                    "--key",
                    path_str(&self.vendor_key).as_str(),
                    path_str(&sgxs).as_str(),
                    path_str(&sig).as_str(),
                ]);
                if debug {
                    sign.push("--debug".into());
                }
                sign.extend(argv(["--xfrm", "7/0", "--isvprodid", "0", "--isvsvn", "0"]));
                tools::run(&sign).await?;

                info!("Converted & signed module {}", self.common.name);
                Ok((sgxs, sig))
            })
            .await
            .cloned()
    }

    async fn remote_attestation(&self, ctx: &BuildContext) -> Result<Vec<u8>> {
        self.deploy(ctx).await?;
        ctx.ensure_attestation_service().await?;

        let creds = ctx.sp_credentials().await?;
        let (_, sig) = self.convert_and_sign(ctx).await?;
        let node = self.node_sgx()?;

        let env = [
            ("SP_PRIVKEY".to_string(), path_str(&creds.privkey)),
            ("IAS_CERT".to_string(), path_str(&creds.ias_cert)),
            ("ENCLAVE_SETTINGS".to_string(), path_str(&self.ra_settings)),
            ("ENCLAVE_SIG".to_string(), path_str(&sig)),
            (
                "ENCLAVE_HOST".to_string(),
                self.common.node.ip_address().to_string(),
            ),
            ("ENCLAVE_PORT".to_string(), self.attestation_port().to_string()),
            ("AESM_PORT".to_string(), node.aesm_port.to_string()),
        ];

        let stdout = tools::run_output(&argv([RA_CLIENT]), &env).await?;
        let key = parse_byte_array(&stdout)
            .ok_or_else(|| Error::attestation(&self.common.name, "attester output not a byte array"))?;

        info!("Done Remote Attestation of {}", self.common.name);
        Ok(key)
    }
}

#[async_trait]
impl ModuleOps for SgxModule {
    fn common(&self) -> &ModuleCommon {
        &self.common
    }

    fn supported_encryption(&self) -> &'static [Encryption] {
        &[Encryption::Aes, Encryption::Spongent]
    }

    async fn build(&self, ctx: &BuildContext) -> Result<PathBuf> {
        self.binary
            .get_or_try_init(|| async {
                self.module_data(ctx).await?;

                let output = ctx.module_dir(&self.folder)?;
                let mut args = argv(["cargo", "build"]);
                if ctx.mode == BuildMode::Release {
                    args.push("--release".into());
                }
                if !self.features.is_empty() {
                    args.push("--features".into());
                    args.push(self.features.join(" "));
                }
                args.push(format!("--target={SGX_TARGET}"));
                args.push(format!("--manifest-path={}/Cargo.toml", output.display()));
                tools::run(&args).await?;

                let binary = output
                    .join("target")
                    .join(SGX_TARGET)
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
                let (sgxs, sig) = self.convert_and_sign(ctx).await?;
                self.node_sgx()?
                    .load_module(&self.common.name, &sgxs, &sig)
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

        self.key(ctx).await?;
        self.common.mark_attested();
        Ok(())
    }

    async fn key(&self, ctx: &BuildContext) -> Result<Vec<u8>> {
        self.key
            .get_or_try_init(|| self.remote_attestation(ctx))
            .await
            .cloned()
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

/// Invoke the module code generator and parse the endpoint tables (and, for
/// native modules, the embedded key) it prints on stdout.
pub(crate) async fn generate_code(
    module_name: &str,
    folder: &str,
    module_id: u16,
    em_port: u16,
    runner: &str,
    sp_key: Option<&str>,
    ctx: &BuildContext,
) -> Result<CodegenOutput> {
    let output = ctx.module_dir(folder)?;

    let mut args = argv([
        CODEGEN,
        "--input",
        folder,
        "--output",
        path_str(&output).as_str(),
        "--module-id",
        module_id.to_string().as_str(),
        "--em-port",
        em_port.to_string().as_str(),
        "--runner",
        runner,
        "--print-data",
    ]);
    if let Some(sp_key) = sp_key {
        args.push("--sp-key".into());
        args.push(sp_key.into());
    }

    let stdout = tools::run_output(&args, &[]).await?;
    let output: CodegenOutput = serde_json::from_slice(&stdout)?;

    info!("Generated code for module {module_name}");
    Ok(output)
}

/// Parse a printed byte-array literal like `[18, 52, 255]`.
pub(crate) fn parse_byte_array(out: &[u8]) -> Option<Vec<u8>> {
    let text = std::str::from_utf8(out).ok()?.trim();
    let inner = text.strip_prefix('[')?.strip_suffix(']')?;

    if inner.trim().is_empty() {
        return Some(Vec::new());
    }
    inner
        .split(',')
        .map(|part| part.trim().parse::<u8>().ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_byte_array() {
        assert_eq!(parse_byte_array(b"[18, 52, 255]\n"), Some(vec![18, 52, 255]));
        assert_eq!(parse_byte_array(b"[]"), Some(vec![]));
        assert_eq!(parse_byte_array(b"[0]"), Some(vec![0]));
        assert_eq!(parse_byte_array(b"key: deadbeef"), None);
        assert_eq!(parse_byte_array(b"[256]"), None);
    }

    #[test]
    fn test_codegen_output_parsing() {
        let out: CodegenOutput = serde_json::from_str(
            r#"{"inputs": {"in": 0}, "outputs": {"out": 1}, "entrypoints": {}, "key": "00ff"}"#,
        )
        .unwrap();
        assert_eq!(out.data.inputs["in"], 0);
        assert_eq!(out.data.outputs["out"], 1);
        assert_eq!(out.key.as_deref(), Some("00ff"));
    }
}
