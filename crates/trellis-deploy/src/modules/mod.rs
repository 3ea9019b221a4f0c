//! Module backends
//!
//! A module is one unit of trusted code pinned to a node. Variants diverge in
//! build toolchain, key custody and endpoint-index resolution; the shared
//! lifecycle state (deployed, attested, per-module nonce, incident-connection
//! count) lives in [`ModuleCommon`]. Build, deploy, codegen and key
//! derivation are one-shot memoized: concurrent awaiters share a single
//! computation.

mod native;
mod sancus;
mod sgx;
mod trustzone;

pub use native::NativeModule;
pub use sancus::SancusModule;
pub use sgx::SgxModule;
pub use trustzone::TrustZoneModule;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, Ordering};
use std::sync::Arc;

use trellis_core::Encryption;

use crate::context::BuildContext;
use crate::descriptor::{as_map, opt_u16, opt_u32, req_str};
use crate::error::{Error, Result};
use crate::nodes::Node;

/// Endpoint-index tables produced by the module code generator
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct ModuleData {
    #[serde(default)]
    pub inputs: HashMap<String, u16>,
    #[serde(default)]
    pub outputs: HashMap<String, u16>,
    #[serde(default)]
    pub entrypoints: HashMap<String, u16>,
    #[serde(default)]
    pub handlers: HashMap<String, u16>,
    #[serde(default)]
    pub requests: HashMap<String, u16>,
}

impl ModuleData {
    pub fn lookup(&self, table: &HashMap<String, u16>, module: &str, name: &str) -> Result<u16> {
        table.get(name).copied().ok_or_else(|| Error::NoSuchEndpoint {
            module: module.to_string(),
            endpoint: name.to_string(),
        })
    }
}

/// Attributes common to all module variants.
///
/// The flags and counters are mutated around suspension points only, with
/// atomics so shared references from connections and events stay cheap.
#[derive(Debug)]
pub struct ModuleCommon {
    pub name: String,
    pub node: Arc<Node>,
    pub priority: Option<u32>,
    deployed: AtomicBool,
    attested: AtomicBool,
    nonce: AtomicU16,
    connections: AtomicU32,
}

impl ModuleCommon {
    pub fn load(
        map: &serde_json::Map<String, Value>,
        nodes: &[Arc<Node>],
        what: &str,
    ) -> Result<Self> {
        let name = req_str(map, "name", what)?;
        let node_name = req_str(map, "node", what)?;
        let node = nodes
            .iter()
            .find(|n| n.name() == node_name)
            .cloned()
            .ok_or_else(|| Error::descriptor(format!("no node with name {node_name}")))?;

        Ok(Self {
            name,
            node,
            priority: opt_u32(map, "priority", what)?,
            deployed: AtomicBool::new(
                map.get("deployed").and_then(Value::as_bool).unwrap_or(false),
            ),
            attested: AtomicBool::new(
                map.get("attested").and_then(Value::as_bool).unwrap_or(false),
            ),
            nonce: AtomicU16::new(opt_u16(map, "nonce", what)?.unwrap_or(0)),
            connections: AtomicU32::new(0),
        })
    }

    pub fn deployed(&self) -> bool {
        self.deployed.load(Ordering::SeqCst)
    }

    pub fn mark_deployed(&self) {
        self.deployed.store(true, Ordering::SeqCst);
    }

    pub fn attested(&self) -> bool {
        self.attested.load(Ordering::SeqCst)
    }

    pub fn mark_attested(&self) {
        self.attested.store(true, Ordering::SeqCst);
    }

    pub fn nonce(&self) -> u16 {
        self.nonce.load(Ordering::SeqCst)
    }

    /// Read the nonce for this operation's AD and step it, in one atomic op.
    pub fn advance_nonce(&self) -> u16 {
        self.nonce.fetch_add(1, Ordering::SeqCst)
    }

    pub fn connections(&self) -> u32 {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn add_connection(&self) {
        self.connections.fetch_add(1, Ordering::SeqCst);
    }
}

/// Operations every module backend provides
#[async_trait]
pub trait ModuleOps: Send + Sync {
    fn common(&self) -> &ModuleCommon;
    fn supported_encryption(&self) -> &'static [Encryption];

    /// Produce the module's deployable binary; memoized.
    async fn build(&self, ctx: &BuildContext) -> Result<PathBuf>;

    /// Load the module onto its node; idempotent.
    async fn deploy(&self, ctx: &BuildContext) -> Result<()>;

    /// Obtain attestation evidence and the module key; idempotent.
    async fn attest(&self, ctx: &BuildContext) -> Result<()>;

    /// The module key used to wrap connection keys.
    async fn key(&self, ctx: &BuildContext) -> Result<Vec<u8>>;

    /// The module's id on its node (deploys first where the id is assigned
    /// by the node at load time).
    async fn get_id(&self, ctx: &BuildContext) -> Result<u16>;

    async fn input_id(&self, name: &str, ctx: &BuildContext) -> Result<u16>;
    async fn output_id(&self, name: &str, ctx: &BuildContext) -> Result<u16>;
    async fn entry_id(&self, name: &str, ctx: &BuildContext) -> Result<u16>;
    async fn request_id(&self, name: &str, ctx: &BuildContext) -> Result<u16>;
    async fn handler_id(&self, name: &str, ctx: &BuildContext) -> Result<u16>;
}

/// Closed set of module variants
#[derive(Debug)]
pub enum Module {
    Sancus(SancusModule),
    Sgx(SgxModule),
    Native(NativeModule),
    TrustZone(TrustZoneModule),
}

impl Module {
    pub fn ty(&self) -> &'static str {
        match self {
            Self::Sancus(_) => "sancus",
            Self::Sgx(_) => "sgx",
            Self::Native(_) => "native",
            Self::TrustZone(_) => "trustzone",
        }
    }

    fn ops(&self) -> &dyn ModuleOps {
        match self {
            Self::Sancus(m) => m,
            Self::Sgx(m) => m,
            Self::Native(m) => m,
            Self::TrustZone(m) => m,
        }
    }

    pub fn common(&self) -> &ModuleCommon {
        self.ops().common()
    }

    pub fn name(&self) -> &str {
        &self.common().name
    }

    pub fn node(&self) -> &Arc<Node> {
        &self.common().node
    }

    pub fn priority(&self) -> Option<u32> {
        self.common().priority
    }

    pub fn deployed(&self) -> bool {
        self.common().deployed()
    }

    pub fn attested(&self) -> bool {
        self.common().attested()
    }

    pub fn nonce(&self) -> u16 {
        self.common().nonce()
    }

    pub fn advance_nonce(&self) -> u16 {
        self.common().advance_nonce()
    }

    pub fn supported_encryption(&self) -> &'static [Encryption] {
        self.ops().supported_encryption()
    }

    pub fn as_trustzone(&self) -> Option<&TrustZoneModule> {
        match self {
            Self::TrustZone(m) => Some(m),
            _ => None,
        }
    }

    /// Construct a module from its descriptor entry, dispatching on `type`.
    /// The node variant must be in the module variant's supported set.
    pub fn load(value: &Value, nodes: &[Arc<Node>]) -> Result<Self> {
        let map = as_map(value, "module")?;
        let ty = map
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::descriptor("module: missing type"))?;

        match ty {
            "sancus" => Ok(Self::Sancus(SancusModule::load(map, nodes)?)),
            "sgx" => Ok(Self::Sgx(SgxModule::load(map, nodes)?)),
            "native" => Ok(Self::Native(NativeModule::load(map, nodes)?)),
            "trustzone" => Ok(Self::TrustZone(TrustZoneModule::load(map, nodes)?)),
            _ => Err(Error::descriptor(format!("unknown module type: {ty}"))),
        }
    }

    pub fn dump(&self) -> Value {
        match self {
            Self::Sancus(m) => m.dump(),
            Self::Sgx(m) => m.dump(),
            Self::Native(m) => m.dump(),
            Self::TrustZone(m) => m.dump(),
        }
    }

    pub async fn build(&self, ctx: &BuildContext) -> Result<PathBuf> {
        self.ops().build(ctx).await
    }

    pub async fn deploy(&self, ctx: &BuildContext) -> Result<()> {
        self.ops().deploy(ctx).await
    }

    pub async fn attest(&self, ctx: &BuildContext) -> Result<()> {
        self.ops().attest(ctx).await
    }

    pub async fn key(&self, ctx: &BuildContext) -> Result<Vec<u8>> {
        self.ops().key(ctx).await
    }

    pub async fn get_id(&self, ctx: &BuildContext) -> Result<u16> {
        self.ops().get_id(ctx).await
    }

    pub async fn get_input_id(&self, name: &str, ctx: &BuildContext) -> Result<u16> {
        match numeric_endpoint(name) {
            Some(id) => Ok(id),
            None => self.ops().input_id(name, ctx).await,
        }
    }

    pub async fn get_output_id(&self, name: &str, ctx: &BuildContext) -> Result<u16> {
        match numeric_endpoint(name) {
            Some(id) => Ok(id),
            None => self.ops().output_id(name, ctx).await,
        }
    }

    pub async fn get_entry_id(&self, name: &str, ctx: &BuildContext) -> Result<u16> {
        match numeric_endpoint(name) {
            Some(id) => Ok(id),
            None => self.ops().entry_id(name, ctx).await,
        }
    }

    pub async fn get_request_id(&self, name: &str, ctx: &BuildContext) -> Result<u16> {
        match numeric_endpoint(name) {
            Some(id) => Ok(id),
            None => self.ops().request_id(name, ctx).await,
        }
    }

    pub async fn get_handler_id(&self, name: &str, ctx: &BuildContext) -> Result<u16> {
        match numeric_endpoint(name) {
            Some(id) => Ok(id),
            None => self.ops().handler_id(name, ctx).await,
        }
    }
}

/// An endpoint name that lexically represents a non-negative integer is the
/// index itself, assigned by the deployer; no lookup is paid.
fn numeric_endpoint(name: &str) -> Option<u16> {
    name.parse::<u16>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_numeric_endpoint_shortcut() {
        assert_eq!(numeric_endpoint("7"), Some(7));
        assert_eq!(numeric_endpoint("0"), Some(0));
        assert_eq!(numeric_endpoint("sensor"), None);
        assert_eq!(numeric_endpoint("-3"), None);
    }

    #[test]
    fn test_module_data_lookup() {
        let data: ModuleData =
            serde_json::from_value(json!({"inputs": {"sensor": 5}, "outputs": {}})).unwrap();
        assert_eq!(data.lookup(&data.inputs, "m", "sensor").unwrap(), 5);

        match data.lookup(&data.inputs, "m", "absent") {
            Err(Error::NoSuchEndpoint { module, endpoint }) => {
                assert_eq!(module, "m");
                assert_eq!(endpoint, "absent");
            }
            other => panic!("expected NoSuchEndpoint, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_unknown_module_type() {
        let err = Module::load(&json!({"type": "wasm", "name": "m"}), &[]).unwrap_err();
        assert!(err.to_string().contains("unknown module type"));
    }
}
