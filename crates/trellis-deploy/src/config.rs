//! The orchestrator aggregate
//!
//! `Config` owns every top-level entity loaded from the descriptor and
//! implements the five subcommands. Modules with a priority deploy first, in
//! ascending order, strictly sequentially; everything else fans out
//! concurrently on the event loop. Re-running any subcommand is a no-op:
//! `deployed`/`attested`/`established` flags act as idempotency guards.

use futures::future::try_join_all;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use crate::connection::Connection;
use crate::context::BuildContext;
use crate::descriptor::{as_map, opt_u16, DescriptorFormat};
use crate::error::{Error, Result};
use crate::modules::Module;
use crate::nodes::Node;
use crate::periodic_event::PeriodicEvent;
use crate::rules;

#[derive(Debug)]
pub struct Config {
    pub path: PathBuf,
    /// Sticky output format: the explicit choice, else the detected input type
    pub format: DescriptorFormat,
    pub nodes: Vec<Arc<Node>>,
    pub modules: Vec<Arc<Module>>,
    pub connections: Vec<Connection>,
    pub periodic_events: Vec<PeriodicEvent>,
    pub connections_current_id: u16,
    pub events_current_id: u16,
}

impl Config {
    /// Load and validate a descriptor, constructing every entity.
    pub fn load(path: &Path, output: Option<DescriptorFormat>) -> Result<Self> {
        let (value, detected) = DescriptorFormat::load_any(path)?;
        let format = output.unwrap_or(detected);

        let top = as_map(&value, "descriptor")?;
        rules::check_descriptor(top)?;

        let nodes: Vec<Arc<Node>> = entries(top, "nodes")
            .into_iter()
            .map(|v| Node::load(v).map(Arc::new))
            .collect::<Result<_>>()?;
        check_unique("node", nodes.iter().map(|n| n.name()))?;

        let modules: Vec<Arc<Module>> = entries(top, "modules")
            .into_iter()
            .map(|v| Module::load(v, &nodes).map(Arc::new))
            .collect::<Result<_>>()?;
        check_unique("module", modules.iter().map(|m| m.name()))?;

        let mut connections_current_id =
            opt_u16(top, "connections_current_id", "descriptor")?.unwrap_or(0);
        let connections: Vec<Connection> = entries(top, "connections")
            .into_iter()
            .map(|v| Connection::load(v, &modules, &mut connections_current_id))
            .collect::<Result<_>>()?;
        check_unique("connection id", connections.iter().map(|c| c.id.to_string()))?;

        let mut events_current_id = opt_u16(top, "events_current_id", "descriptor")?.unwrap_or(0);
        let periodic_events: Vec<PeriodicEvent> = entries(top, "periodic-events")
            .into_iter()
            .map(|v| PeriodicEvent::load(v, &modules, &mut events_current_id))
            .collect::<Result<_>>()?;
        check_unique("periodic event id", periodic_events.iter().map(|e| e.id.to_string()))?;

        Ok(Self {
            path: path.to_path_buf(),
            format,
            nodes,
            modules,
            connections,
            periodic_events,
            connections_current_id,
            events_current_id,
        })
    }

    /// The full descriptor, including all derived state.
    pub fn dump_value(&self) -> Value {
        json!({
            "nodes": self.nodes.iter().map(|n| n.dump()).collect::<Vec<_>>(),
            "modules": self.modules.iter().map(|m| m.dump()).collect::<Vec<_>>(),
            "connections": self.connections.iter().map(|c| c.dump()).collect::<Vec<_>>(),
            "periodic-events": self.periodic_events.iter().map(|e| e.dump()).collect::<Vec<_>>(),
            "connections_current_id": self.connections_current_id,
            "events_current_id": self.events_current_id,
        })
    }

    /// Persist the descriptor so a subsequent run resumes from this state.
    pub fn dump(&self, path: &Path) -> Result<()> {
        self.format.dump(path, &self.dump_value())
    }

    pub fn get_node(&self, name: &str) -> Result<&Arc<Node>> {
        self.nodes
            .iter()
            .find(|n| n.name() == name)
            .ok_or_else(|| Error::descriptor(format!("no node with name {name}")))
    }

    pub fn get_module(&self, name: &str) -> Result<&Arc<Module>> {
        self.modules
            .iter()
            .find(|m| m.name() == name)
            .ok_or_else(|| Error::descriptor(format!("no module with name {name}")))
    }

    /// Look up a connection by numeric id or by name.
    pub fn get_connection(&self, selector: &str) -> Result<&Connection> {
        let found = match selector.parse::<u16>() {
            Ok(id) => self.connections.iter().find(|c| c.id == id),
            Err(_) => self.connections.iter().find(|c| c.name == selector),
        };
        found.ok_or_else(|| Error::descriptor(format!("no connection {selector}")))
    }

    /// Look up a periodic event by numeric id or by name.
    pub fn get_event(&self, selector: &str) -> Result<&PeriodicEvent> {
        let found = match selector.parse::<u16>() {
            Ok(id) => self.periodic_events.iter().find(|e| e.id == id),
            Err(_) => self.periodic_events.iter().find(|e| e.name == selector),
        };
        found.ok_or_else(|| Error::descriptor(format!("no periodic event {selector}")))
    }

    /// Build every module (or one named module) concurrently.
    pub async fn build(&self, ctx: &BuildContext, module: Option<&str>) -> Result<()> {
        let targets: Vec<&Arc<Module>> = match module {
            Some(name) => vec![self.get_module(name)?],
            None => self.modules.iter().collect(),
        };

        try_join_all(targets.iter().map(|m| m.build(ctx))).await?;
        Ok(())
    }

    /// Deploy modules: prioritized ones first, sequentially in ascending
    /// priority, then the remainder (sequentially with `in_order`, otherwise
    /// concurrently). Already-deployed modules are skipped.
    pub async fn deploy(&self, ctx: &BuildContext, in_order: bool, module: Option<&str>) -> Result<()> {
        if let Some(name) = module {
            let target = self.get_module(name)?;
            if target.deployed() {
                return Err(Error::preflight(format!("module {name} already deployed")));
            }
            return target.deploy(ctx).await;
        }

        let mut prioritized: Vec<&Arc<Module>> = self
            .modules
            .iter()
            .filter(|m| m.priority().is_some())
            .collect();
        prioritized.sort_by_key(|m| m.priority());
        debug!(
            "priority modules: {:?}",
            prioritized.iter().map(|m| m.name()).collect::<Vec<_>>()
        );

        for module in prioritized {
            module.deploy(ctx).await?;
        }

        let rest = self.modules.iter().filter(|m| m.priority().is_none());
        if in_order {
            for module in rest {
                module.deploy(ctx).await?;
            }
        } else {
            try_join_all(rest.map(|m| m.deploy(ctx))).await?;
        }
        Ok(())
    }

    /// Attest every not-yet-attested module (or one named module),
    /// concurrently. All of them must already be deployed.
    pub async fn attest(&self, ctx: &BuildContext, module: Option<&str>) -> Result<()> {
        let targets: Vec<&Arc<Module>> = match module {
            Some(name) => vec![self.get_module(name)?],
            None => self.modules.iter().filter(|m| !m.attested()).collect(),
        };

        let undeployed: Vec<&str> = targets
            .iter()
            .filter(|m| !m.deployed())
            .map(|m| m.name())
            .collect();
        if !undeployed.is_empty() {
            return Err(Error::preflight(format!(
                "cannot attest undeployed modules: {}",
                undeployed.join(", ")
            )));
        }

        try_join_all(targets.iter().map(|m| m.attest(ctx))).await?;
        Ok(())
    }

    /// Establish every not-yet-established connection (or one named
    /// connection), concurrently. Both endpoints must be attested.
    pub async fn connect(&self, ctx: &BuildContext, connection: Option<&str>) -> Result<()> {
        let targets: Vec<&Connection> = match connection {
            Some(selector) => vec![self.get_connection(selector)?],
            None => self.connections.iter().filter(|c| !c.established()).collect(),
        };

        for conn in &targets {
            if !conn.to_module.attested() {
                return Err(Error::preflight(format!(
                    "connection {}: destination module {} not attested",
                    conn.name,
                    conn.to_module.name()
                )));
            }
            if let Some(from_module) = &conn.from_module {
                if !from_module.attested() {
                    return Err(Error::preflight(format!(
                        "connection {}: source module {} not attested",
                        conn.name,
                        from_module.name()
                    )));
                }
            }
        }

        try_join_all(targets.iter().map(|c| c.establish(ctx))).await?;
        Ok(())
    }

    /// Register every not-yet-registered periodic event (or one named
    /// event), concurrently. The target module must be attested.
    pub async fn register(&self, ctx: &BuildContext, event: Option<&str>) -> Result<()> {
        let targets: Vec<&PeriodicEvent> = match event {
            Some(selector) => vec![self.get_event(selector)?],
            None => self
                .periodic_events
                .iter()
                .filter(|e| !e.established())
                .collect(),
        };

        for event in &targets {
            if !event.module.attested() {
                return Err(Error::preflight(format!(
                    "periodic event {}: module {} not attested",
                    event.name,
                    event.module.name()
                )));
            }
        }

        try_join_all(targets.iter().map(|e| e.register(ctx))).await?;
        Ok(())
    }

    /// Teardown before exit (terminates the background attestation service).
    pub async fn cleanup(&self, ctx: &BuildContext) {
        ctx.shutdown().await;
    }
}

fn entries<'a>(top: &'a serde_json::Map<String, Value>, key: &str) -> Vec<&'a Value> {
    top.get(key)
        .and_then(Value::as_array)
        .map(|list| list.iter().collect())
        .unwrap_or_default()
}

fn check_unique(what: &str, names: impl IntoIterator<Item = impl AsRef<str>>) -> Result<()> {
    let mut seen = std::collections::HashSet::new();
    for name in names {
        if !seen.insert(name.as_ref().to_string()) {
            return Err(Error::descriptor(format!(
                "duplicate {what}: {}",
                name.as_ref()
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::BuildMode;
    use parking_lot::Mutex;
    use serde_json::json;
    use tempfile::TempDir;
    use tokio::net::TcpListener;
    use trellis_core::Encryption;
    use trellis_net::{CommandCode, CommandMessage, ResultCode, ResultMessage};

    /// Minimal in-process event manager: records every frame it receives and
    /// answers Ok with an empty payload.
    struct MockEm {
        pub reactive_port: u16,
        pub deploy_port: u16,
        commands: Arc<Mutex<Vec<CommandMessage>>>,
    }

    impl MockEm {
        async fn start() -> Self {
            let commands = Arc::new(Mutex::new(Vec::new()));

            let reactive = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let deploy = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let reactive_port = reactive.local_addr().unwrap().port();
            let deploy_port = deploy.local_addr().unwrap().port();

            for (listener, load_channel) in [(reactive, false), (deploy, true)] {
                let commands = commands.clone();
                tokio::spawn(async move {
                    loop {
                        let Ok((mut stream, _)) = listener.accept().await else {
                            break;
                        };
                        let Ok(cmd) = CommandMessage::read_from(&mut stream, load_channel).await
                        else {
                            continue;
                        };
                        let needs_response = cmd.code.has_response();
                        commands.lock().push(cmd);
                        if needs_response {
                            let _ = ResultMessage::new(ResultCode::Ok, vec![])
                                .write_to(&mut stream)
                                .await;
                        }
                    }
                });
            }

            Self {
                reactive_port,
                deploy_port,
                commands,
            }
        }

        fn recorded(&self) -> Vec<CommandMessage> {
            self.commands.lock().clone()
        }

        fn count(&self) -> usize {
            self.commands.lock().len()
        }
    }

    struct Fixture {
        dir: TempDir,
        em: MockEm,
    }

    impl Fixture {
        async fn new() -> Self {
            Self {
                dir: TempDir::new().unwrap(),
                em: MockEm::start().await,
            }
        }

        fn ctx(&self) -> BuildContext {
            BuildContext::new(BuildMode::Debug, self.dir.path().join("build")).unwrap()
        }

        fn node_value(&self) -> Value {
            json!({
                "type": "native",
                "name": "host",
                "ip_address": "127.0.0.1",
                "reactive_port": self.em.reactive_port,
                "deploy_port": self.em.deploy_port,
            })
        }

        /// A native module with prebuilt binary and pregenerated data, so no
        /// external toolchain runs during tests.
        fn module_value(&self, name: &str, priority: Option<u32>) -> Value {
            let binary = self.dir.path().join(format!("{name}.bin"));
            std::fs::write(&binary, name.as_bytes()).unwrap();

            json!({
                "type": "native",
                "name": name,
                "node": "host",
                "priority": priority,
                "binary": binary.display().to_string(),
                "key": "000102030405060708090a0b0c0d0e0f",
                "data": {
                    "inputs": {"ep": 5},
                    "outputs": {},
                    "entrypoints": {"tick": 7},
                    "handlers": {},
                    "requests": {},
                },
            })
        }

        fn write_descriptor(&self, value: &Value) -> PathBuf {
            let path = self.dir.path().join("network.json");
            std::fs::write(&path, serde_json::to_string_pretty(value).unwrap()).unwrap();
            path
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_minimal_direct_connection() {
        let fx = Fixture::new().await;
        let ctx = fx.ctx();

        let descriptor = json!({
            "nodes": [fx.node_value()],
            "modules": [fx.module_value("m", None)],
            "connections": [{
                "direct": true,
                "to_module": "m",
                "to_input": "ep",
                "encryption": "aes",
            }],
        });
        let path = fx.write_descriptor(&descriptor);
        let conf = Config::load(&path, None).unwrap();

        conf.deploy(&ctx, false, None).await.unwrap();
        conf.attest(&ctx, None).await.unwrap();
        conf.connect(&ctx, None).await.unwrap();

        let m = conf.get_module("m").unwrap();
        assert!(m.deployed());
        assert!(m.attested());
        assert_eq!(m.nonce(), 1);

        let conn = conf.get_connection("conn0").unwrap();
        assert!(conn.established());
        assert_eq!(conn.key.len(), 16);
        assert_eq!(hex::encode(&conn.key).len(), 32);

        // One Load on the deploy channel, one SetKey call on the reactive one.
        let recorded = fx.em.recorded();
        assert_eq!(recorded.len(), 2);
        assert_eq!(recorded[0].code, CommandCode::Load);
        assert_eq!(&recorded[0].payload[4..], b"m");
        assert_eq!(recorded[1].code, CommandCode::Call);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_key_ad_binding() {
        let fx = Fixture::new().await;
        let ctx = fx.ctx();

        let descriptor = json!({
            "nodes": [fx.node_value()],
            "modules": [fx.module_value("m", None)],
            "connections": [{
                "direct": true,
                "to_module": "m",
                // Numeric endpoint names resolve to themselves.
                "to_input": "5",
                "encryption": "aes",
            }],
            "connections_current_id": 7,
        });
        let path = fx.write_descriptor(&descriptor);
        let conf = Config::load(&path, None).unwrap();
        assert_eq!(conf.connections[0].id, 7);

        conf.deploy(&ctx, false, None).await.unwrap();
        conf.attest(&ctx, None).await.unwrap();
        conf.connect(&ctx, None).await.unwrap();

        let set_key = fx
            .em
            .recorded()
            .into_iter()
            .find(|c| c.code == CommandCode::Call)
            .unwrap();

        // Payload: module_id(2) || SetKey(2) || AD(7) || cipher || tag
        let ad = &set_key.payload[4..11];
        assert_eq!(hex::encode(ad), "01000700050000");

        let module_key = hex::decode("000102030405060708090a0b0c0d0e0f").unwrap();
        let wrapped = &set_key.payload[11..];
        let plain = Encryption::Aes.decrypt(&module_key, ad, wrapped).unwrap();
        assert_eq!(plain, conf.connections[0].key);

        // The same frame must not decrypt under an altered nonce.
        let bad_ad = hex::decode("01000700050001").unwrap();
        assert!(Encryption::Aes.decrypt(&module_key, &bad_ad, wrapped).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_priority_modules_deploy_in_order() {
        let fx = Fixture::new().await;
        let ctx = fx.ctx();

        let descriptor = json!({
            "nodes": [fx.node_value()],
            "modules": [
                fx.module_value("late", Some(3)),
                fx.module_value("first", Some(1)),
                fx.module_value("second", Some(2)),
                fx.module_value("unprioritized", None),
            ],
        });
        let path = fx.write_descriptor(&descriptor);
        let conf = Config::load(&path, None).unwrap();

        conf.deploy(&ctx, false, None).await.unwrap();

        let loads: Vec<String> = fx
            .em
            .recorded()
            .iter()
            .filter(|c| c.code == CommandCode::Load)
            .map(|c| String::from_utf8(c.payload[4..].to_vec()).unwrap())
            .collect();
        assert_eq!(loads, vec!["first", "second", "late", "unprioritized"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resumption_skips_deployed_modules() {
        let fx = Fixture::new().await;
        let ctx = fx.ctx();

        let mut done = fx.module_value("done", None);
        done["deployed"] = json!(true);

        let descriptor = json!({
            "nodes": [fx.node_value()],
            "modules": [done, fx.module_value("pending", None)],
        });
        let path = fx.write_descriptor(&descriptor);
        let conf = Config::load(&path, None).unwrap();

        conf.deploy(&ctx, false, None).await.unwrap();

        let loads: Vec<String> = fx
            .em
            .recorded()
            .iter()
            .filter(|c| c.code == CommandCode::Load)
            .map(|c| String::from_utf8(c.payload[4..].to_vec()).unwrap())
            .collect();
        assert_eq!(loads, vec!["pending"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_targeted_deploy_of_deployed_module_fails() {
        let fx = Fixture::new().await;
        let ctx = fx.ctx();

        let mut done = fx.module_value("done", None);
        done["deployed"] = json!(true);

        let path = fx.write_descriptor(&json!({
            "nodes": [fx.node_value()],
            "modules": [done],
        }));
        let conf = Config::load(&path, None).unwrap();

        match conf.deploy(&ctx, false, Some("done")).await {
            Err(Error::Preflight(msg)) => assert!(msg.contains("already deployed")),
            other => panic!("expected preflight error, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_attest_requires_deployment() {
        let fx = Fixture::new().await;
        let ctx = fx.ctx();

        let path = fx.write_descriptor(&json!({
            "nodes": [fx.node_value()],
            "modules": [fx.module_value("m", None)],
        }));
        let conf = Config::load(&path, None).unwrap();

        assert!(matches!(
            conf.attest(&ctx, None).await,
            Err(Error::Preflight(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_requires_attested_endpoints() {
        let fx = Fixture::new().await;
        let ctx = fx.ctx();

        let path = fx.write_descriptor(&json!({
            "nodes": [fx.node_value()],
            "modules": [fx.module_value("m", None)],
            "connections": [{
                "direct": true,
                "to_module": "m",
                "to_input": "ep",
                "encryption": "aes",
            }],
        }));
        let conf = Config::load(&path, None).unwrap();

        assert!(matches!(
            conf.connect(&ctx, None).await,
            Err(Error::Preflight(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_register_periodic_event() {
        let fx = Fixture::new().await;
        let ctx = fx.ctx();

        let path = fx.write_descriptor(&json!({
            "nodes": [fx.node_value()],
            "modules": [fx.module_value("m", None)],
            "periodic-events": [{
                "module": "m",
                "entry": "tick",
                "frequency": 1000,
            }],
        }));
        let conf = Config::load(&path, None).unwrap();

        conf.deploy(&ctx, false, None).await.unwrap();
        conf.attest(&ctx, None).await.unwrap();
        conf.register(&ctx, None).await.unwrap();

        let event = conf.get_event("event0").unwrap();
        assert!(event.established());

        let register = fx
            .em
            .recorded()
            .into_iter()
            .find(|c| c.code == CommandCode::RegisterEntrypoint)
            .unwrap();
        // module_id(2) || entry_id(2) || frequency(4)
        assert_eq!(register.payload[2..4], [0x00, 0x07]);
        assert_eq!(register.payload[4..8], [0x00, 0x00, 0x03, 0xe8]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_run_is_a_no_op() {
        let fx = Fixture::new().await;
        let ctx = fx.ctx();

        let path = fx.write_descriptor(&json!({
            "nodes": [fx.node_value()],
            "modules": [fx.module_value("m", None)],
            "connections": [{
                "direct": true,
                "to_module": "m",
                "to_input": "ep",
                "encryption": "aes",
            }],
            "periodic-events": [{
                "module": "m",
                "entry": "tick",
                "frequency": 500,
            }],
        }));

        let conf = Config::load(&path, None).unwrap();
        conf.deploy(&ctx, false, None).await.unwrap();
        conf.attest(&ctx, None).await.unwrap();
        conf.connect(&ctx, None).await.unwrap();
        conf.register(&ctx, None).await.unwrap();
        conf.dump(&path).unwrap();

        let sent = fx.em.count();

        // Reload the dumped descriptor and run everything again: no wire
        // traffic, no new ids, no state changes.
        let again = Config::load(&path, None).unwrap();
        again.deploy(&ctx, false, None).await.unwrap();
        again.attest(&ctx, None).await.unwrap();
        again.connect(&ctx, None).await.unwrap();
        again.register(&ctx, None).await.unwrap();

        assert_eq!(fx.em.count(), sent);
        assert_eq!(again.connections[0].id, conf.connections[0].id);
        assert_eq!(again.connections[0].key, conf.connections[0].key);
        assert_eq!(again.get_module("m").unwrap().nonce(), 1);
        assert_eq!(again.dump_value(), conf.dump_value());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dump_roundtrips_through_yaml() {
        let fx = Fixture::new().await;
        let ctx = fx.ctx();

        let path = fx.write_descriptor(&json!({
            "nodes": [fx.node_value()],
            "modules": [fx.module_value("m", None)],
            "connections": [{
                "direct": true,
                "to_module": "m",
                "to_input": "ep",
                "encryption": "aes",
            }],
        }));

        let conf = Config::load(&path, Some(DescriptorFormat::Yaml)).unwrap();
        conf.deploy(&ctx, false, None).await.unwrap();
        conf.attest(&ctx, None).await.unwrap();
        conf.connect(&ctx, None).await.unwrap();

        let yaml_path = fx.dir.path().join("network.yaml");
        conf.dump(&yaml_path).unwrap();

        let reloaded = Config::load(&yaml_path, None).unwrap();
        assert_eq!(reloaded.format, DescriptorFormat::Yaml);
        assert_eq!(reloaded.dump_value(), conf.dump_value());
    }

    #[test]
    fn test_duplicate_module_names_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("net.json");
        std::fs::write(
            &path,
            serde_json::to_string(&json!({
                "nodes": [{
                    "type": "native",
                    "name": "host",
                    "ip_address": "127.0.0.1",
                    "reactive_port": 5000,
                }],
                "modules": [
                    {"type": "native", "name": "m", "node": "host"},
                    {"type": "native", "name": "m", "node": "host"},
                ],
            }))
            .unwrap(),
        )
        .unwrap();

        let err = Config::load(&path, None).unwrap_err();
        assert!(err.to_string().contains("duplicate module"));
    }

    #[test]
    fn test_unknown_module_reference_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("net.json");
        std::fs::write(
            &path,
            serde_json::to_string(&json!({
                "nodes": [{
                    "type": "native",
                    "name": "host",
                    "ip_address": "127.0.0.1",
                    "reactive_port": 5000,
                }],
                "modules": [{"type": "native", "name": "m", "node": "elsewhere"}],
            }))
            .unwrap(),
        )
        .unwrap();

        let err = Config::load(&path, None).unwrap_err();
        assert!(err.to_string().contains("no node with name"));
    }
}
