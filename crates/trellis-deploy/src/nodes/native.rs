//! Native node backend
//!
//! An untrusted host running the event manager without any TEE primitive,
//! used for development and for modules whose isolation does not matter.
//! Wire behavior matches SGX except for the load payload, which is the bare
//! binary.

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

#[derive(Debug)]
pub struct NativeNode {
    common: NodeCommon,
    module_id: AtomicU16,
}

impl NativeNode {
    pub fn load(map: &serde_json::Map<String, Value>) -> Result<Self> {
        rules::check_node("native", map)?;
        let what = "native node";

        let name = req_str(map, "name", what)?;
        let ip_address = req_ip(map, "ip_address", what)?;
        let reactive_port = req_u16(map, "reactive_port", what)?;
        let deploy_port = opt_u16(map, "deploy_port", what)?.unwrap_or(reactive_port);
        let module_id = opt_u16(map, "module_id", what)?.unwrap_or(1);

        Ok(Self {
            common: NodeCommon::new(name, ip_address, reactive_port, deploy_port, false),
            module_id: AtomicU16::new(module_id),
        })
    }

    pub fn dump(&self) -> Value {
        json!({
            "type": "native",
            "name": self.common.name,
            "ip_address": self.common.ip_address.to_string(),
            "reactive_port": self.common.reactive_port,
            "deploy_port": self.common.deploy_port,
            "module_id": self.module_id.load(Ordering::SeqCst),
        })
    }

    pub fn next_module_id(&self) -> u16 {
        self.module_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Upload a module binary.
    pub async fn load_module(&self, module_name: &str, binary: &Path) -> Result<()> {
        let data = tokio::fs::read(binary).await?;

        let mut payload = Vec::with_capacity(data.len() + 4);
        payload.extend_from_slice(&pack_u32(data.len() as u32));
        payload.extend_from_slice(&data);

        self.common
            .send(
                CommandMessage::new(CommandCode::Load, payload),
                Some(format!("Deploying {} on {}", module_name, self.common.name)),
            )
            .await?;

        // The event manager acks before the module process is listening.
        tokio::time::sleep(SETTLE_DELAY).await;
        Ok(())
    }
}

#[async_trait]
impl NodeOps for NativeNode {
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
    fn test_load_defaults() {
        let map = json!({
            "type": "native",
            "name": "devhost",
            "ip_address": "127.0.0.1",
            "reactive_port": 5000,
        })
        .as_object()
        .unwrap()
        .clone();

        let node = NativeNode::load(&map).unwrap();
        assert_eq!(node.common().deploy_port, 5000);
        assert_eq!(node.next_module_id(), 1);
    }
}
