//! Node backends
//!
//! A node is a host exposing an event manager on a TCP port pair: the
//! reactive port for events and the deploy port for module loads. The four
//! variants diverge in deploy payloads, attestation flows and `SetKey`
//! associated-data layout; the shared event-manager operations live here as
//! `NodeOps` default methods.

mod native;
mod sancus;
mod sgx;
mod trustzone;

pub use native::NativeNode;
pub use sancus::SancusNode;
pub use sgx::SgxNode;
pub use trustzone::TrustZoneNode;

use async_trait::async_trait;
use serde_json::Value;
use std::net::{Ipv4Addr, SocketAddr};
use tokio::sync::Mutex;
use tracing::info;

use trellis_core::Encryption;
use trellis_net::{
    pack_u16, pack_u32, send_command, CommandCode, CommandMessage, Entrypoint, ResultMessage,
};

use crate::connection::{Connection, ConnectionIndex};
use crate::context::BuildContext;
use crate::descriptor::as_map;
use crate::error::{Error, Result};
use crate::modules::Module;

/// Pause after a `Load` before the first reactive command: a multithreaded
/// event manager acks the load while the module may still be starting.
pub(crate) const SETTLE_DELAY: std::time::Duration = std::time::Duration::from_secs(2);

/// Attributes common to all node variants
#[derive(Debug)]
pub struct NodeCommon {
    pub name: String,
    pub ip_address: Ipv4Addr,
    pub reactive_port: u16,
    pub deploy_port: u16,
    /// Present when the event manager accepts one connection at a time;
    /// serializes all outgoing commands.
    lock: Option<Mutex<()>>,
}

impl NodeCommon {
    pub fn new(
        name: String,
        ip_address: Ipv4Addr,
        reactive_port: u16,
        deploy_port: u16,
        need_lock: bool,
    ) -> Self {
        Self {
            name,
            ip_address,
            reactive_port,
            deploy_port,
            lock: need_lock.then(|| Mutex::new(())),
        }
    }

    fn addr_for(&self, code: CommandCode) -> SocketAddr {
        let port = if code.is_load() {
            self.deploy_port
        } else {
            self.reactive_port
        };
        SocketAddr::from((self.ip_address, port))
    }

    /// Send one command to this node's event manager, honoring the per-node
    /// serialization lock when present.
    pub async fn send(
        &self,
        msg: CommandMessage,
        log: Option<String>,
    ) -> Result<Option<ResultMessage>> {
        if let Some(log) = log {
            info!("{log}");
        }

        let addr = self.addr_for(msg.code);
        match &self.lock {
            Some(lock) => {
                let _serialized = lock.lock().await;
                Ok(send_command(addr, &msg).await?)
            }
            None => Ok(send_command(addr, &msg).await?),
        }
    }

    /// Like [`send`](Self::send), for commands that carry a response.
    pub async fn send_wait(
        &self,
        msg: CommandMessage,
        log: Option<String>,
    ) -> Result<ResultMessage> {
        self.send(msg, log).await?.ok_or_else(|| {
            Error::Wire(trellis_net::WireError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "missing response frame",
            )))
        })
    }
}

/// Compose the `SetKey` associated data. Most platforms prefix the cipher
/// selector byte; Sancus omits it (its cipher is fixed) and passes `None`.
pub fn compose_ad(cipher: Option<Encryption>, conn_id: u16, io_id: u16, nonce: u16) -> Vec<u8> {
    let mut ad = Vec::with_capacity(7);
    if let Some(cipher) = cipher {
        ad.push(cipher as u8);
    }
    ad.extend_from_slice(&pack_u16(conn_id));
    ad.extend_from_slice(&pack_u16(io_id));
    ad.extend_from_slice(&pack_u16(nonce));
    ad
}

/// Operations every node backend provides. The provided methods implement
/// the common event-manager wire contract with u16 module ids; TrustZone
/// overrides them to address modules by UUID.
#[async_trait]
pub trait NodeOps: Send + Sync {
    fn common(&self) -> &NodeCommon;

    /// Set the key of one connection endpoint hosted on this node.
    async fn set_key(
        &self,
        module: &Module,
        conn_id: u16,
        index: &ConnectionIndex,
        encryption: Encryption,
        key: &[u8],
        ctx: &BuildContext,
    ) -> Result<()>;

    /// Inform this node's event manager of a new outgoing connection.
    async fn connect(&self, to_module: &Module, conn_id: u16, ctx: &BuildContext) -> Result<()> {
        let common = self.common();
        let module_id = to_module.get_id(ctx).await?;
        let to_node = to_module.node();

        let mut payload = Vec::new();
        payload.extend_from_slice(&pack_u16(conn_id));
        payload.extend_from_slice(&pack_u16(module_id));
        payload.extend_from_slice(&pack_u16(to_node.reactive_port()));
        payload.extend_from_slice(&to_node.ip_address().octets());

        common
            .send(
                CommandMessage::new(CommandCode::Connect, payload),
                Some(format!("Connecting id {} to {}", conn_id, to_module.name())),
            )
            .await?;
        Ok(())
    }

    /// Call an entry point of a module hosted on this node.
    async fn call(
        &self,
        module: &Module,
        entry: &str,
        arg: Option<&[u8]>,
        ctx: &BuildContext,
    ) -> Result<()> {
        let common = self.common();
        let module_id = module.get_id(ctx).await?;
        let entry_id = module.get_entry_id(entry, ctx).await?;

        let mut payload = Vec::new();
        payload.extend_from_slice(&pack_u16(module_id));
        payload.extend_from_slice(&pack_u16(entry_id));
        payload.extend_from_slice(arg.unwrap_or_default());

        let response = common
            .send(
                CommandMessage::new(CommandCode::Call, payload),
                Some(format!(
                    "Sending call command to {}:{} ({}:{}) on {}",
                    module.name(),
                    entry,
                    module_id,
                    entry_id,
                    common.name
                )),
            )
            .await?;

        if let Some(response) = response {
            info!("Response: \"{}\"", hex::encode(&response.payload));
        }
        Ok(())
    }

    /// Trigger the output of a direct connection terminating on this node.
    async fn output(
        &self,
        connection: &Connection,
        arg: Option<&[u8]>,
        ctx: &BuildContext,
    ) -> Result<()> {
        let common = self.common();
        let module_id = connection.to_module.get_id(ctx).await?;

        let cipher = connection.encryption.encrypt(
            &connection.key,
            &pack_u16(connection.nonce()),
            arg.unwrap_or_default(),
        )?;

        let mut payload = Vec::new();
        payload.extend_from_slice(&pack_u16(module_id));
        payload.extend_from_slice(&pack_u16(connection.id));
        payload.extend_from_slice(&cipher);

        common
            .send(
                CommandMessage::new(CommandCode::RemoteOutput, payload),
                Some(format!(
                    "Sending handle_output command of connection {}:{} to {} on {}",
                    connection.id,
                    connection.name,
                    connection.to_module.name(),
                    common.name
                )),
            )
            .await?;

        connection.advance_nonce(1);
        Ok(())
    }

    /// Trigger the request of a direct connection; the response is decrypted
    /// under the following nonce and returned.
    async fn request(
        &self,
        connection: &Connection,
        arg: Option<&[u8]>,
        ctx: &BuildContext,
    ) -> Result<Vec<u8>> {
        let common = self.common();
        let module_id = connection.to_module.get_id(ctx).await?;

        let nonce = connection.nonce();
        let cipher =
            connection
                .encryption
                .encrypt(&connection.key, &pack_u16(nonce), arg.unwrap_or_default())?;

        let mut payload = Vec::new();
        payload.extend_from_slice(&pack_u16(module_id));
        payload.extend_from_slice(&pack_u16(connection.id));
        payload.extend_from_slice(&cipher);

        let response = common
            .send_wait(
                CommandMessage::new(CommandCode::RemoteRequest, payload),
                Some(format!(
                    "Sending handle_request command of connection {}:{} to {} on {}",
                    connection.id,
                    connection.name,
                    connection.to_module.name(),
                    common.name
                )),
            )
            .await?;

        let plaintext = connection.encryption.decrypt(
            &connection.key,
            &pack_u16(nonce.wrapping_add(1)),
            &response.payload,
        )?;
        info!("Response: \"{}\"", hex::encode(&plaintext));

        // The response consumed nonce + 1.
        connection.advance_nonce(2);
        Ok(plaintext)
    }

    /// Register a periodic entry point on this node.
    async fn register_entrypoint(
        &self,
        module: &Module,
        entry: &str,
        frequency: u32,
        ctx: &BuildContext,
    ) -> Result<()> {
        let common = self.common();
        let module_id = module.get_id(ctx).await?;
        let entry_id = module.get_entry_id(entry, ctx).await?;

        let mut payload = Vec::new();
        payload.extend_from_slice(&pack_u16(module_id));
        payload.extend_from_slice(&pack_u16(entry_id));
        payload.extend_from_slice(&pack_u32(frequency));

        common
            .send(
                CommandMessage::new(CommandCode::RegisterEntrypoint, payload),
                Some(format!(
                    "Sending RegisterEntrypoint command of {}:{} ({}:{}) on {}",
                    module.name(),
                    entry,
                    module_id,
                    entry_id,
                    common.name
                )),
            )
            .await?;
        Ok(())
    }
}

/// Helper shared by the AES-transport platforms (SGX, Native, TrustZone):
/// compose the AD with the cipher selector byte, wrap the connection key
/// under the module key, and send the `SetKey` call.
pub(crate) async fn em_set_key(
    common: &NodeCommon,
    module: &Module,
    module_id_bytes: Vec<u8>,
    conn_id: u16,
    index: &ConnectionIndex,
    encryption: Encryption,
    key: &[u8],
    ctx: &BuildContext,
) -> Result<()> {
    let io_id = index.resolve(module, ctx).await?;
    let module_key = module.key(ctx).await?;
    let nonce = module.advance_nonce();

    let ad = compose_ad(Some(encryption), conn_id, io_id, nonce);
    let cipher = Encryption::Aes.encrypt(&module_key, &ad, key)?;

    let mut payload = module_id_bytes;
    payload.extend_from_slice(&Entrypoint::SetKey.to_bytes());
    payload.extend_from_slice(&ad);
    payload.extend_from_slice(&cipher);

    common
        .send(
            CommandMessage::new(CommandCode::Call, payload),
            Some(format!(
                "Setting key of connection {} ({}:{}) on {} to {}",
                conn_id,
                module.name(),
                index.name,
                common.name,
                hex::encode(key)
            )),
        )
        .await?;
    Ok(())
}

/// Closed set of node variants
#[derive(Debug)]
pub enum Node {
    Sancus(SancusNode),
    Sgx(SgxNode),
    Native(NativeNode),
    TrustZone(TrustZoneNode),
}

impl Node {
    pub fn ty(&self) -> &'static str {
        match self {
            Self::Sancus(_) => "sancus",
            Self::Sgx(_) => "sgx",
            Self::Native(_) => "native",
            Self::TrustZone(_) => "trustzone",
        }
    }

    pub fn common(&self) -> &NodeCommon {
        match self {
            Self::Sancus(n) => n.common(),
            Self::Sgx(n) => n.common(),
            Self::Native(n) => n.common(),
            Self::TrustZone(n) => n.common(),
        }
    }

    pub fn name(&self) -> &str {
        &self.common().name
    }

    pub fn ip_address(&self) -> Ipv4Addr {
        self.common().ip_address
    }

    pub fn reactive_port(&self) -> u16 {
        self.common().reactive_port
    }

    pub fn deploy_port(&self) -> u16 {
        self.common().deploy_port
    }

    /// Construct a node from its descriptor entry, dispatching on `type`.
    pub fn load(value: &Value) -> Result<Self> {
        let map = as_map(value, "node")?;
        let ty = map
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::descriptor("node: missing type"))?;

        match ty {
            "sancus" => Ok(Self::Sancus(SancusNode::load(map)?)),
            "sgx" => Ok(Self::Sgx(SgxNode::load(map)?)),
            "native" => Ok(Self::Native(NativeNode::load(map)?)),
            "trustzone" => Ok(Self::TrustZone(TrustZoneNode::load(map)?)),
            _ => Err(Error::descriptor(format!("unknown node type: {ty}"))),
        }
    }

    pub fn dump(&self) -> Value {
        match self {
            Self::Sancus(n) => n.dump(),
            Self::Sgx(n) => n.dump(),
            Self::Native(n) => n.dump(),
            Self::TrustZone(n) => n.dump(),
        }
    }

    pub fn as_sancus(&self) -> Option<&SancusNode> {
        match self {
            Self::Sancus(n) => Some(n),
            _ => None,
        }
    }

    pub fn as_sgx(&self) -> Option<&SgxNode> {
        match self {
            Self::Sgx(n) => Some(n),
            _ => None,
        }
    }

    pub fn as_native(&self) -> Option<&NativeNode> {
        match self {
            Self::Native(n) => Some(n),
            _ => None,
        }
    }

    pub fn as_trustzone(&self) -> Option<&TrustZoneNode> {
        match self {
            Self::TrustZone(n) => Some(n),
            _ => None,
        }
    }

    pub async fn set_key(
        &self,
        module: &Module,
        conn_id: u16,
        index: &ConnectionIndex,
        encryption: Encryption,
        key: &[u8],
        ctx: &BuildContext,
    ) -> Result<()> {
        match self {
            Self::Sancus(n) => n.set_key(module, conn_id, index, encryption, key, ctx).await,
            Self::Sgx(n) => n.set_key(module, conn_id, index, encryption, key, ctx).await,
            Self::Native(n) => n.set_key(module, conn_id, index, encryption, key, ctx).await,
            Self::TrustZone(n) => n.set_key(module, conn_id, index, encryption, key, ctx).await,
        }
    }

    pub async fn connect(&self, to_module: &Module, conn_id: u16, ctx: &BuildContext) -> Result<()> {
        match self {
            Self::Sancus(n) => n.connect(to_module, conn_id, ctx).await,
            Self::Sgx(n) => n.connect(to_module, conn_id, ctx).await,
            Self::Native(n) => n.connect(to_module, conn_id, ctx).await,
            Self::TrustZone(n) => n.connect(to_module, conn_id, ctx).await,
        }
    }

    pub async fn call(
        &self,
        module: &Module,
        entry: &str,
        arg: Option<&[u8]>,
        ctx: &BuildContext,
    ) -> Result<()> {
        match self {
            Self::Sancus(n) => n.call(module, entry, arg, ctx).await,
            Self::Sgx(n) => n.call(module, entry, arg, ctx).await,
            Self::Native(n) => n.call(module, entry, arg, ctx).await,
            Self::TrustZone(n) => n.call(module, entry, arg, ctx).await,
        }
    }

    pub async fn output(
        &self,
        connection: &Connection,
        arg: Option<&[u8]>,
        ctx: &BuildContext,
    ) -> Result<()> {
        match self {
            Self::Sancus(n) => n.output(connection, arg, ctx).await,
            Self::Sgx(n) => n.output(connection, arg, ctx).await,
            Self::Native(n) => n.output(connection, arg, ctx).await,
            Self::TrustZone(n) => n.output(connection, arg, ctx).await,
        }
    }

    pub async fn request(
        &self,
        connection: &Connection,
        arg: Option<&[u8]>,
        ctx: &BuildContext,
    ) -> Result<Vec<u8>> {
        match self {
            Self::Sancus(n) => n.request(connection, arg, ctx).await,
            Self::Sgx(n) => n.request(connection, arg, ctx).await,
            Self::Native(n) => n.request(connection, arg, ctx).await,
            Self::TrustZone(n) => n.request(connection, arg, ctx).await,
        }
    }

    pub async fn register_entrypoint(
        &self,
        module: &Module,
        entry: &str,
        frequency: u32,
        ctx: &BuildContext,
    ) -> Result<()> {
        match self {
            Self::Sancus(n) => n.register_entrypoint(module, entry, frequency, ctx).await,
            Self::Sgx(n) => n.register_entrypoint(module, entry, frequency, ctx).await,
            Self::Native(n) => n.register_entrypoint(module, entry, frequency, ctx).await,
            Self::TrustZone(n) => n.register_entrypoint(module, entry, frequency, ctx).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_compose_ad_with_cipher_byte() {
        // cipher=AES, conn_id=7, io_idx=5, nonce=0
        let ad = compose_ad(Some(Encryption::Aes), 7, 5, 0);
        assert_eq!(ad, hex::decode("01000700050000").unwrap());
    }

    #[test]
    fn test_compose_ad_sancus_layout() {
        // Sancus omits the cipher selector.
        let ad = compose_ad(None, 7, 5, 3);
        assert_eq!(ad, hex::decode("000700050003").unwrap());
    }

    #[test]
    fn test_node_load_dispatch() {
        let node = Node::load(&json!({
            "type": "native",
            "name": "host",
            "ip_address": "127.0.0.1",
            "reactive_port": 5000,
        }))
        .unwrap();

        assert_eq!(node.ty(), "native");
        assert_eq!(node.name(), "host");
        // deploy_port defaults to reactive_port
        assert_eq!(node.deploy_port(), 5000);
    }

    #[test]
    fn test_unknown_node_type() {
        let err = Node::load(&json!({"type": "riscv", "name": "x"})).unwrap_err();
        assert!(err.to_string().contains("unknown node type"));
    }
}
