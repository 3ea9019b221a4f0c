//! Sancus node backend
//!
//! Sancus event managers run on MSP430-class MCUs: the reactive channel
//! accepts a single connection at a time (all traffic serialized through the
//! per-node lock), module loads return the runtime-assigned SM id plus a
//! symbol table consumed by the second link pass, and all cryptography is
//! SPONGENT under the vendor-derived module key.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tracing::info;

use trellis_core::{crypto::ct_eq, spongent, Encryption};
use trellis_net::{pack_u16, unpack_u16, CommandCode, CommandMessage, Entrypoint};

use crate::connection::ConnectionIndex;
use crate::context::BuildContext;
use crate::descriptor::{opt_hex_sized, opt_u16, req_ip, req_str, req_u16};
use crate::error::{Error, Result};
use crate::modules::Module;
use crate::nodes::{compose_ad, NodeCommon, NodeOps};
use crate::rules;
use crate::tools;

#[derive(Debug)]
pub struct SancusNode {
    common: NodeCommon,
    pub vendor_id: u16,
    pub vendor_key: Vec<u8>,
}

impl SancusNode {
    pub fn load(map: &serde_json::Map<String, Value>) -> Result<Self> {
        rules::check_node("sancus", map)?;
        let what = "sancus node";

        let name = req_str(map, "name", what)?;
        let vendor_id = req_u16(map, "vendor_id", what)?;
        if vendor_id == 0 {
            return Err(Error::descriptor(format!("{what} {name}: vendor ID out of range")));
        }
        let vendor_key = opt_hex_sized(map, "vendor_key", spongent::KEY_SIZE, what)?
            .ok_or_else(|| Error::descriptor(format!("{what} {name}: missing vendor_key")))?;
        let ip_address = req_ip(map, "ip_address", what)?;
        let reactive_port = req_u16(map, "reactive_port", what)?;
        let deploy_port = opt_u16(map, "deploy_port", what)?.unwrap_or(reactive_port);

        Ok(Self {
            common: NodeCommon::new(name, ip_address, reactive_port, deploy_port, true),
            vendor_id,
            vendor_key,
        })
    }

    pub fn dump(&self) -> Value {
        json!({
            "type": "sancus",
            "name": self.common.name,
            "ip_address": self.common.ip_address.to_string(),
            "vendor_id": self.vendor_id,
            "vendor_key": hex::encode(&self.vendor_key),
            "reactive_port": self.common.reactive_port,
            "deploy_port": self.common.deploy_port,
        })
    }

    /// Upload a module binary. The event manager answers with the assigned
    /// SM id (zero means failure) followed by a symbol table blob, persisted
    /// here as a linker script for the second link pass.
    pub async fn load_module(
        &self,
        module_name: &str,
        binary: &Path,
        ctx: &BuildContext,
    ) -> Result<(u16, PathBuf)> {
        let file_data = tokio::fs::read(binary).await?;

        // Packet format: [NAME \0 VID ELF_FILE]
        let mut payload = Vec::with_capacity(module_name.len() + 3 + file_data.len());
        payload.extend_from_slice(module_name.as_bytes());
        payload.push(0);
        payload.extend_from_slice(&pack_u16(self.vendor_id));
        payload.extend_from_slice(&file_data);

        let response = self
            .common
            .send_wait(
                CommandMessage::new(CommandCode::Load, payload),
                Some(format!("Deploying {} on {}", module_name, self.common.name)),
            )
            .await?;

        if response.payload.len() < 3 {
            return Err(Error::Deploy {
                module: module_name.to_string(),
                node: self.common.name.clone(),
            });
        }

        let sm_id = unpack_u16(&response.payload[..2])?;
        if sm_id == 0 {
            return Err(Error::Deploy {
                module: module_name.to_string(),
                node: self.common.name.clone(),
            });
        }

        let symtab = &response.payload[2..response.payload.len() - 1]; // drop trailing NUL
        let symtab_file = ctx.module_dir(module_name)?.join(format!("{module_name}.ld"));
        tokio::fs::write(&symtab_file, symtab).await?;

        Ok((sm_id, symtab_file))
    }

    /// Challenge the module with 16 random bytes; it must answer with the
    /// SPONGENT MAC of the challenge under its module key.
    pub async fn attest_module(
        &self,
        module_name: &str,
        module_id: u16,
        module_key: &[u8],
    ) -> Result<()> {
        let challenge = tools::generate_key(16);

        let mut payload = Vec::new();
        payload.extend_from_slice(&pack_u16(module_id));
        payload.extend_from_slice(&Entrypoint::Attest.to_bytes());
        payload.extend_from_slice(&pack_u16(challenge.len() as u16));
        payload.extend_from_slice(&challenge);

        let response = self
            .common
            .send_wait(
                CommandMessage::new(CommandCode::Call, payload),
                Some(format!("Attesting {module_name}")),
            )
            .await?;

        let expected = spongent::mac(module_key, &challenge)?;
        if !ct_eq(&response.payload, &expected) {
            return Err(Error::attestation(module_name, "challenge MAC mismatch"));
        }

        info!("Attestation of {module_name} succeeded");
        Ok(())
    }
}

#[async_trait]
impl NodeOps for SancusNode {
    fn common(&self) -> &NodeCommon {
        &self.common
    }

    async fn set_key(
        &self,
        module: &Module,
        conn_id: u16,
        index: &ConnectionIndex,
        _encryption: Encryption,
        key: &[u8],
        ctx: &BuildContext,
    ) -> Result<()> {
        let io_id = index.resolve(module, ctx).await?;
        let module_id = module.get_id(ctx).await?;
        let module_key = module.key(ctx).await?;
        let nonce = module.advance_nonce();

        // No cipher selector byte: the Sancus cipher is fixed.
        let ad = compose_ad(None, conn_id, io_id, nonce);
        let cipher = Encryption::Spongent.encrypt(&module_key, &ad, key)?;

        let mut payload = Vec::new();
        payload.extend_from_slice(&pack_u16(module_id));
        payload.extend_from_slice(&Entrypoint::SetKey.to_bytes());
        payload.extend_from_slice(&ad);
        payload.extend_from_slice(&cipher);

        self.common
            .send(
                CommandMessage::new(CommandCode::Call, payload),
                Some(format!(
                    "Setting key of {}:{} on {} to {}",
                    module.name(),
                    index.name,
                    self.common.name,
                    hex::encode(key)
                )),
            )
            .await?;
        Ok(())
    }

    async fn connect(&self, to_module: &Module, conn_id: u16, ctx: &BuildContext) -> Result<()> {
        let module_id = to_module.get_id(ctx).await?;
        let to_node = to_module.node();

        // The Sancus event manager treats 0.0.0.0 as a local connection.
        let ip_octets = if to_node.name() == self.common.name {
            [0u8; 4]
        } else {
            to_node.ip_address().octets()
        };

        let mut payload = Vec::new();
        payload.extend_from_slice(&pack_u16(conn_id));
        payload.extend_from_slice(&pack_u16(module_id));
        payload.extend_from_slice(&pack_u16(to_node.reactive_port()));
        payload.extend_from_slice(&ip_octets);

        self.common
            .send(
                CommandMessage::new(CommandCode::Connect, payload),
                Some(format!("Connecting id {} to {}", conn_id, to_module.name())),
            )
            .await?;
        Ok(())
    }
}
