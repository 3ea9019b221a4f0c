//! SGX node backend
//!
//! SGX hosts run a multithreaded event manager: no serialization lock, and
//! module ids are assigned by the deployer from a per-node counter (the
//! first free slot, persisted across runs). Loads upload the SGXS image and
//! its signature; `SetKey` transports travel under AES-GCM.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::atomic::{AtomicU16, Ordering};

use trellis_core::Encryption;
use trellis_net::{pack_u16, pack_u32, CommandCode, CommandMessage};

use crate::connection::ConnectionIndex;
use crate::context::BuildContext;
use crate::descriptor::{opt_u16, req_ip, req_str, req_u16};
use crate::error::Result;
use crate::modules::Module;
use crate::nodes::{em_set_key, NodeCommon, NodeOps, SETTLE_DELAY};
use crate::rules;

const DEFAULT_AESM_PORT: u16 = 13741;

#[derive(Debug)]
pub struct SgxNode {
    common: NodeCommon,
    module_id: AtomicU16,
    pub aesm_port: u16,
}

impl SgxNode {
    pub fn load(map: &serde_json::Map<String, Value>) -> Result<Self> {
        rules::check_node("sgx", map)?;
        let what = "sgx node";

        let name = req_str(map, "name", what)?;
        let ip_address = req_ip(map, "ip_address", what)?;
        let reactive_port = req_u16(map, "reactive_port", what)?;
        let deploy_port = opt_u16(map, "deploy_port", what)?.unwrap_or(reactive_port);
        let module_id = opt_u16(map, "module_id", what)?.unwrap_or(1);
        let aesm_port = opt_u16(map, "aesm_port", what)?.unwrap_or(DEFAULT_AESM_PORT);

        Ok(Self {
            common: NodeCommon::new(name, ip_address, reactive_port, deploy_port, false),
            module_id: AtomicU16::new(module_id),
            aesm_port,
        })
    }

    pub fn dump(&self) -> Value {
        json!({
            "type": "sgx",
            "name": self.common.name,
            "ip_address": self.common.ip_address.to_string(),
            "reactive_port": self.common.reactive_port,
            "deploy_port": self.common.deploy_port,
            "module_id": self.module_id.load(Ordering::SeqCst),
            "aesm_port": self.aesm_port,
        })
    }

    /// Allocate the next free module slot on this node.
    pub fn next_module_id(&self) -> u16 {
        self.module_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Upload an SGXS image and its signature.
    pub async fn load_module(&self, module_name: &str, sgxs: &Path, sig: &Path) -> Result<()> {
        let sgxs_data = tokio::fs::read(sgxs).await?;
        let sig_data = tokio::fs::read(sig).await?;

        let mut payload = Vec::with_capacity(sgxs_data.len() + sig_data.len() + 8);
        payload.extend_from_slice(&pack_u32(sgxs_data.len() as u32));
        payload.extend_from_slice(&sgxs_data);
        payload.extend_from_slice(&pack_u32(sig_data.len() as u32));
        payload.extend_from_slice(&sig_data);

        self.common
            .send(
                CommandMessage::new(CommandCode::Load, payload),
                Some(format!("Deploying {} on {}", module_name, self.common.name)),
            )
            .await?;

        // Give the enclave time to come up before the first Call reaches it.
        tokio::time::sleep(SETTLE_DELAY).await;
        Ok(())
    }
}

#[async_trait]
impl NodeOps for SgxNode {
    fn common(&self) -> &NodeCommon {
        &self.common
    }

    async fn set_key(
        &self,
        module: &Module,
        conn_id: u16,
        index: &ConnectionIndex,
        encryption: Encryption,
        key: &[u8],
        ctx: &BuildContext,
    ) -> Result<()> {
        let module_id = module.get_id(ctx).await?;
        em_set_key(
            &self.common,
            module,
            pack_u16(module_id).to_vec(),
            conn_id,
            index,
            encryption,
            key,
            ctx,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_module_id_allocator() {
        let map = json!({
            "type": "sgx",
            "name": "enclave-host",
            "ip_address": "192.168.1.10",
            "reactive_port": 5000,
            "deploy_port": 5001,
        })
        .as_object()
        .unwrap()
        .clone();

        let node = SgxNode::load(&map).unwrap();
        assert_eq!(node.next_module_id(), 1);
        assert_eq!(node.next_module_id(), 2);
        // The dumped counter is the next free slot.
        assert_eq!(node.dump()["module_id"], 3);
        assert_eq!(node.dump()["aesm_port"], DEFAULT_AESM_PORT);
    }

    #[test]
    fn test_counter_resumes_from_descriptor() {
        let map = json!({
            "type": "sgx",
            "name": "enclave-host",
            "ip_address": "192.168.1.10",
            "reactive_port": 5000,
            "module_id": 4,
            "aesm_port": 14000,
        })
        .as_object()
        .unwrap()
        .clone();

        let node = SgxNode::load(&map).unwrap();
        assert_eq!(node.aesm_port, 14000);
        assert_eq!(node.next_module_id(), 4);
    }
}
