//! Connections: named, keyed conduits between module endpoints
//!
//! A connection joins a source endpoint (output or request) to a destination
//! endpoint (input or handler), or the deployer itself to one destination
//! when `direct`. Establishment distributes the connection key to each side
//! with a `SetKey` call; the endpoint index lookup is paid once and cached.

use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::info;

use trellis_core::Encryption;

use crate::context::BuildContext;
use crate::descriptor::{as_map, opt_endpoint, opt_hex, opt_str, opt_u16};
use crate::error::{Error, Result};
use crate::modules::Module;
use crate::rules;
use crate::tools;

/// Which table an endpoint name resolves against
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EndpointKind {
    Output,
    Input,
    Request,
    Handler,
}

/// One side of a connection; the resolved index is cached after the first
/// lookup.
#[derive(Debug)]
pub struct ConnectionIndex {
    pub kind: EndpointKind,
    pub name: String,
    cached: OnceCell<u16>,
}

impl ConnectionIndex {
    pub fn new(kind: EndpointKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            cached: OnceCell::new(),
        }
    }

    pub async fn resolve(&self, module: &Module, ctx: &BuildContext) -> Result<u16> {
        self.cached
            .get_or_try_init(|| async {
                match self.kind {
                    EndpointKind::Output => module.get_output_id(&self.name, ctx).await,
                    EndpointKind::Input => module.get_input_id(&self.name, ctx).await,
                    EndpointKind::Request => module.get_request_id(&self.name, ctx).await,
                    EndpointKind::Handler => module.get_handler_id(&self.name, ctx).await,
                }
            })
            .await
            .copied()
    }
}

#[derive(Debug)]
pub struct Connection {
    pub name: String,
    pub id: u16,
    pub direct: bool,
    pub from_module: Option<Arc<Module>>,
    pub from_output: Option<String>,
    pub from_request: Option<String>,
    pub to_module: Arc<Module>,
    pub to_input: Option<String>,
    pub to_handler: Option<String>,
    pub encryption: Encryption,
    pub key: Vec<u8>,
    nonce: AtomicU16,
    established: AtomicBool,
    pub from_index: Option<ConnectionIndex>,
    pub to_index: ConnectionIndex,
}

impl Connection {
    /// Construct a connection from its descriptor entry. A missing id is
    /// assigned from the descriptor-wide counter; a missing key is generated
    /// after checking both endpoints support the cipher.
    pub fn load(value: &Value, modules: &[Arc<Module>], next_id: &mut u16) -> Result<Self> {
        let map = as_map(value, "connection")?;
        rules::check_connection(map)?;
        let what = "connection";

        let direct = map.get("direct").and_then(Value::as_bool).unwrap_or(false);
        let from_module = match opt_str(map, "from_module") {
            Some(name) => Some(find_module(modules, &name)?),
            None => None,
        };
        let from_output = opt_endpoint(map, "from_output");
        let from_request = opt_endpoint(map, "from_request");
        let to_module = find_module(
            modules,
            &opt_str(map, "to_module")
                .ok_or_else(|| Error::descriptor("connection: missing to_module"))?,
        )?;
        let to_input = opt_endpoint(map, "to_input");
        let to_handler = opt_endpoint(map, "to_handler");

        let encryption = Encryption::from_str_tag(
            &opt_str(map, "encryption")
                .ok_or_else(|| Error::descriptor("connection: missing encryption"))?,
        )?;

        let key = match opt_hex(map, "key")? {
            Some(key) => {
                if key.len() != encryption.key_size() {
                    return Err(Error::descriptor(format!(
                        "connection key must be {} bytes, got {}",
                        encryption.key_size(),
                        key.len()
                    )));
                }
                key
            }
            None => Self::generate_key(from_module.as_deref(), &to_module, encryption)?,
        };

        let id = match opt_u16(map, "id", what)? {
            Some(id) => id,
            None => {
                let id = *next_id;
                *next_id += 1;
                id
            }
        };
        let name = opt_str(map, "name").unwrap_or_else(|| format!("conn{id}"));
        let nonce = opt_u16(map, "nonce", what)?.unwrap_or(0);
        let established = map
            .get("established")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        if let Some(from_module) = &from_module {
            from_module.common().add_connection();
        }
        to_module.common().add_connection();

        let from_index = if direct {
            None
        } else if let Some(output) = &from_output {
            Some(ConnectionIndex::new(EndpointKind::Output, output.clone()))
        } else {
            from_request
                .as_ref()
                .map(|request| ConnectionIndex::new(EndpointKind::Request, request.clone()))
        };

        let to_index = if let Some(input) = &to_input {
            ConnectionIndex::new(EndpointKind::Input, input.clone())
        } else {
            ConnectionIndex::new(
                EndpointKind::Handler,
                to_handler.clone().unwrap_or_default(),
            )
        };

        Ok(Self {
            name,
            id,
            direct,
            from_module,
            from_output,
            from_request,
            to_module,
            to_input,
            to_handler,
            encryption,
            key,
            nonce: AtomicU16::new(nonce),
            established: AtomicBool::new(established),
            from_index,
            to_index,
        })
    }

    pub fn dump(&self) -> Value {
        json!({
            "name": self.name,
            "from_module": self.from_module.as_ref().map(|m| m.name().to_string()),
            "from_output": self.from_output,
            "from_request": self.from_request,
            "to_module": self.to_module.name(),
            "to_input": self.to_input,
            "to_handler": self.to_handler,
            "encryption": self.encryption.as_str(),
            "key": hex::encode(&self.key),
            "id": self.id,
            "direct": self.direct,
            "nonce": self.nonce(),
            "established": self.established(),
        })
    }

    pub fn nonce(&self) -> u16 {
        self.nonce.load(Ordering::SeqCst)
    }

    /// Step the direct-connection nonce (+1 for output, +2 for request,
    /// whose response consumes the following nonce).
    pub fn advance_nonce(&self, step: u16) {
        self.nonce.fetch_add(step, Ordering::SeqCst);
    }

    pub fn established(&self) -> bool {
        self.established.load(Ordering::SeqCst)
    }

    /// Distribute the connection key to both endpoints and tell the source
    /// event manager where events should flow. Idempotent.
    pub async fn establish(&self, ctx: &BuildContext) -> Result<()> {
        if self.established() {
            return Ok(());
        }

        if self.direct {
            let to_node = self.to_module.node();
            to_node
                .set_key(
                    &self.to_module,
                    self.id,
                    &self.to_index,
                    self.encryption,
                    &self.key,
                    ctx,
                )
                .await?;

            info!(
                "Direct connection {}:{} to {}:{} on {} established",
                self.id,
                self.name,
                self.to_module.name(),
                self.to_index.name,
                to_node.name()
            );
        } else {
            let from_module = self
                .from_module
                .as_ref()
                .ok_or_else(|| Error::preflight(format!("connection {} has no source", self.name)))?;
            let from_index = self
                .from_index
                .as_ref()
                .ok_or_else(|| Error::preflight(format!("connection {} has no source endpoint", self.name)))?;
            let from_node = from_module.node();
            let to_node = self.to_module.node();

            tokio::try_join!(
                from_node.connect(&self.to_module, self.id, ctx),
                from_node.set_key(from_module, self.id, from_index, self.encryption, &self.key, ctx),
                to_node.set_key(&self.to_module, self.id, &self.to_index, self.encryption, &self.key, ctx),
            )?;

            info!(
                "Connection {}:{} from {}:{} on {} to {}:{} on {} established",
                self.id,
                self.name,
                from_module.name(),
                from_index.name,
                from_node.name(),
                self.to_module.name(),
                self.to_index.name,
                to_node.name()
            );
        }

        self.established.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Fresh key of the cipher's size; both endpoints must support the
    /// cipher.
    pub fn generate_key(
        from_module: Option<&Module>,
        to_module: &Module,
        encryption: Encryption,
    ) -> Result<Vec<u8>> {
        let unsupported = |m: &Module| !m.supported_encryption().contains(&encryption);

        if from_module.map(unsupported).unwrap_or(false) || unsupported(to_module) {
            return Err(Error::descriptor(format!(
                "encryption {} not supported between {} and {}",
                encryption,
                from_module.map(|m| m.name().to_string()).unwrap_or_else(|| "<deployer>".into()),
                to_module.name()
            )));
        }

        Ok(tools::generate_key(encryption.key_size()))
    }
}

fn find_module(modules: &[Arc<Module>], name: &str) -> Result<Arc<Module>> {
    modules
        .iter()
        .find(|m| m.name() == name)
        .cloned()
        .ok_or_else(|| Error::descriptor(format!("no module with name {name}")))
}
