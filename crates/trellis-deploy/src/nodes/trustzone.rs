//! TrustZone node backend
//!
//! OP-TEE boards address trusted applications by 16-byte UUID rather than a
//! u16 slot, so every module-addressed command repacks the id field. Nodes
//! carry a `number` used when routing connections between boards.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::atomic::{AtomicU16, Ordering};
use tracing::info;

use trellis_core::{crypto::ct_eq, Encryption};
use trellis_net::{pack_u16, pack_u32, CommandCode, CommandMessage, Entrypoint};

use crate::connection::{Connection, ConnectionIndex};
use crate::context::BuildContext;
use crate::descriptor::{opt_u16, req_ip, req_str, req_u16};
use crate::error::{Error, Result};
use crate::modules::Module;
use crate::nodes::{em_set_key, NodeCommon, NodeOps, SETTLE_DELAY};
use crate::rules;
use crate::tools;

#[derive(Debug)]
pub struct TrustZoneNode {
    common: NodeCommon,
    pub node_number: u16,
    module_id: AtomicU16,
}

impl TrustZoneNode {
    pub fn load(map: &serde_json::Map<String, Value>) -> Result<Self> {
        rules::check_node("trustzone", map)?;
        let what = "trustzone node";

        let name = req_str(map, "name", what)?;
        let node_number = req_u16(map, "number", what)?;
        let ip_address = req_ip(map, "ip_address", what)?;
        let reactive_port = req_u16(map, "reactive_port", what)?;
        let deploy_port = opt_u16(map, "deploy_port", what)?.unwrap_or(reactive_port);
        let module_id = opt_u16(map, "module_id", what)?.unwrap_or(1);

        Ok(Self {
            common: NodeCommon::new(name, ip_address, reactive_port, deploy_port, false),
            node_number,
            module_id: AtomicU16::new(module_id),
        })
    }

    pub fn dump(&self) -> Value {
        json!({
            "type": "trustzone",
            "name": self.common.name,
            "number": self.node_number,
            "ip_address": self.common.ip_address.to_string(),
            "reactive_port": self.common.reactive_port,
            "deploy_port": self.common.deploy_port,
            "module_id": self.module_id.load(Ordering::SeqCst),
        })
    }

    pub fn next_module_id(&self) -> u16 {
        self.module_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Upload a trusted application: total length, UUID, TA binary.
    pub async fn load_module(
        &self,
        module_name: &str,
        uuid: [u8; 16],
        binary: &Path,
    ) -> Result<()> {
        let data = tokio::fs::read(binary).await?;

        let mut payload = Vec::with_capacity(data.len() + 20);
        payload.extend_from_slice(&pack_u32((data.len() + uuid.len()) as u32));
        payload.extend_from_slice(&uuid);
        payload.extend_from_slice(&data);

        self.common
            .send(
                CommandMessage::new(CommandCode::Load, payload),
                Some(format!("Deploying {} on {}", module_name, self.common.name)),
            )
            .await?;

        tokio::time::sleep(SETTLE_DELAY).await;
        Ok(())
    }

    /// Challenge-response attestation: the TA answers with the AES-GCM tag
    /// of a 16-byte zero buffer with the challenge as associated data.
    pub async fn attest_module(
        &self,
        module_name: &str,
        uuid: [u8; 16],
        module_key: &[u8],
    ) -> Result<()> {
        let challenge = tools::generate_key(16);

        let mut payload = Vec::new();
        payload.extend_from_slice(&uuid);
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

        let expected = Encryption::Aes.encrypt(module_key, &challenge, &[0u8; 16])?;
        let expected_tag = &expected[16..];
        if !ct_eq(&response.payload, expected_tag) {
            return Err(Error::attestation(module_name, "challenge MAC mismatch"));
        }

        info!("Attestation of {module_name} succeeded");
        Ok(())
    }

    fn module_uuid(module: &Module) -> Result<[u8; 16]> {
        let tz = module.as_trustzone().ok_or(Error::Configuration {
            module_type: module.ty(),
            node: module.node().name().to_string(),
            node_type: "trustzone",
        })?;
        Ok(tz.uuid_bytes())
    }
}

#[async_trait]
impl NodeOps for TrustZoneNode {
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
        let uuid = Self::module_uuid(module)?;
        em_set_key(
            &self.common,
            module,
            uuid.to_vec(),
            conn_id,
            index,
            encryption,
            key,
            ctx,
        )
        .await
    }

    async fn connect(&self, to_module: &Module, conn_id: u16, _ctx: &BuildContext) -> Result<()> {
        let uuid = Self::module_uuid(to_module)?;
        let to_node = to_module.node();
        let to_number = to_node
            .as_trustzone()
            .ok_or(Error::Configuration {
                module_type: to_module.ty(),
                node: to_node.name().to_string(),
                node_type: to_node.ty(),
            })?
            .node_number;

        let mut payload = Vec::new();
        payload.extend_from_slice(&pack_u16(conn_id));
        payload.extend_from_slice(&uuid);
        payload.extend_from_slice(&pack_u16(to_number));
        payload.extend_from_slice(&pack_u16(to_node.reactive_port()));
        payload.extend_from_slice(&to_node.ip_address().octets());

        self.common
            .send(
                CommandMessage::new(CommandCode::Connect, payload),
                Some(format!("Connecting id {} to {}", conn_id, to_module.name())),
            )
            .await?;
        Ok(())
    }

    async fn call(
        &self,
        module: &Module,
        entry: &str,
        arg: Option<&[u8]>,
        ctx: &BuildContext,
    ) -> Result<()> {
        let uuid = Self::module_uuid(module)?;
        let entry_id = module.get_entry_id(entry, ctx).await?;

        let mut payload = Vec::new();
        payload.extend_from_slice(&uuid);
        payload.extend_from_slice(&pack_u16(entry_id));
        payload.extend_from_slice(arg.unwrap_or_default());

        let response = self
            .common
            .send(
                CommandMessage::new(CommandCode::Call, payload),
                Some(format!(
                    "Sending call command to {}:{} on {}",
                    module.name(),
                    entry,
                    self.common.name
                )),
            )
            .await?;

        if let Some(response) = response {
            info!("Response: \"{}\"", hex::encode(&response.payload));
        }
        Ok(())
    }

    async fn output(
        &self,
        connection: &Connection,
        arg: Option<&[u8]>,
        _ctx: &BuildContext,
    ) -> Result<()> {
        let uuid = Self::module_uuid(&connection.to_module)?;

        let cipher = connection.encryption.encrypt(
            &connection.key,
            &pack_u16(connection.nonce()),
            arg.unwrap_or_default(),
        )?;

        let mut payload = Vec::new();
        payload.extend_from_slice(&uuid);
        payload.extend_from_slice(&pack_u16(connection.id));
        payload.extend_from_slice(&cipher);

        self.common
            .send(
                CommandMessage::new(CommandCode::RemoteOutput, payload),
                Some(format!(
                    "Sending handle_output command of connection {}:{} to {} on {}",
                    connection.id,
                    connection.name,
                    connection.to_module.name(),
                    self.common.name
                )),
            )
            .await?;

        connection.advance_nonce(1);
        Ok(())
    }

    async fn request(
        &self,
        connection: &Connection,
        arg: Option<&[u8]>,
        _ctx: &BuildContext,
    ) -> Result<Vec<u8>> {
        let uuid = Self::module_uuid(&connection.to_module)?;

        let nonce = connection.nonce();
        let cipher =
            connection
                .encryption
                .encrypt(&connection.key, &pack_u16(nonce), arg.unwrap_or_default())?;

        let mut payload = Vec::new();
        payload.extend_from_slice(&uuid);
        payload.extend_from_slice(&pack_u16(connection.id));
        payload.extend_from_slice(&cipher);

        let response = self
            .common
            .send_wait(
                CommandMessage::new(CommandCode::RemoteRequest, payload),
                Some(format!(
                    "Sending handle_request command of connection {}:{} to {} on {}",
                    connection.id,
                    connection.name,
                    connection.to_module.name(),
                    self.common.name
                )),
            )
            .await?;

        let plaintext = connection.encryption.decrypt(
            &connection.key,
            &pack_u16(nonce.wrapping_add(1)),
            &response.payload,
        )?;
        info!("Response: \"{}\"", hex::encode(&plaintext));

        connection.advance_nonce(2);
        Ok(plaintext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_load_requires_number() {
        let map = json!({
            "type": "trustzone",
            "name": "board0",
            "ip_address": "10.1.0.2",
            "reactive_port": 7000,
        })
        .as_object()
        .unwrap()
        .clone();
        assert!(TrustZoneNode::load(&map).is_err());
    }

    #[test]
    fn test_dump_carries_number() {
        let map = json!({
            "type": "trustzone",
            "name": "board0",
            "number": 3,
            "ip_address": "10.1.0.2",
            "reactive_port": 7000,
        })
        .as_object()
        .unwrap()
        .clone();

        let node = TrustZoneNode::load(&map).unwrap();
        assert_eq!(node.node_number, 3);
        assert_eq!(node.dump()["number"], 3);
    }
}
