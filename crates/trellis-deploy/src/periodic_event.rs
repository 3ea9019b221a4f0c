//! Periodic events: timers invoking a module entry point at a fixed rate

use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

use crate::context::BuildContext;
use crate::descriptor::{as_map, opt_str, opt_u16, req_u32};
use crate::error::{Error, Result};
use crate::modules::Module;
use crate::rules;

#[derive(Debug)]
pub struct PeriodicEvent {
    pub name: String,
    pub id: u16,
    pub module: Arc<Module>,
    pub entry: String,
    /// Invocation period in milliseconds
    pub frequency: u32,
    established: AtomicBool,
}

impl PeriodicEvent {
    pub fn load(value: &Value, modules: &[Arc<Module>], next_id: &mut u16) -> Result<Self> {
        let map = as_map(value, "periodic event")?;
        rules::check_event(map)?;
        let what = "periodic event";

        let module_name = opt_str(map, "module")
            .ok_or_else(|| Error::descriptor("periodic event: missing module"))?;
        let module = modules
            .iter()
            .find(|m| m.name() == module_name)
            .cloned()
            .ok_or_else(|| Error::descriptor(format!("no module with name {module_name}")))?;

        let frequency = req_u32(map, "frequency", what)?;
        if frequency == 0 {
            return Err(Error::descriptor("periodic event: frequency out of range"));
        }

        let id = match opt_u16(map, "id", what)? {
            Some(id) => id,
            None => {
                let id = *next_id;
                *next_id += 1;
                id
            }
        };
        let name = opt_str(map, "name").unwrap_or_else(|| format!("event{id}"));
        let established = map
            .get("established")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        Ok(Self {
            name,
            id,
            module,
            entry: opt_str(map, "entry")
                .ok_or_else(|| Error::descriptor("periodic event: missing entry"))?,
            frequency,
            established: AtomicBool::new(established),
        })
    }

    pub fn dump(&self) -> Value {
        json!({
            "name": self.name,
            "id": self.id,
            "module": self.module.name(),
            "entry": self.entry,
            "frequency": self.frequency,
            "established": self.established(),
        })
    }

    pub fn established(&self) -> bool {
        self.established.load(Ordering::SeqCst)
    }

    /// Register the timer with the module's event manager. Idempotent.
    pub async fn register(&self, ctx: &BuildContext) -> Result<()> {
        if self.established() {
            return Ok(());
        }

        let node = self.module.node();
        node.register_entrypoint(&self.module, &self.entry, self.frequency, ctx)
            .await?;

        info!(
            "Registered {}:{} on {} every {} ms",
            self.module.name(),
            self.entry,
            node.name(),
            self.frequency
        );

        self.established.store(true, Ordering::SeqCst);
        Ok(())
    }
}
