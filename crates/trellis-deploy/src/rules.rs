//! Declarative validation rules
//!
//! Every descriptor entity is checked against a named rule set before its
//! object is constructed. All rules run; every broken rule is logged and the
//! names aggregate into one descriptor error. Unknown keys are rejected so a
//! typo never silently drifts into a descriptor.

use serde_json::{Map, Value};
use tracing::error;

use crate::error::{Error, Result};

type Rule = (&'static str, bool);

fn evaluate(what: &str, rules: &[Rule]) -> Result<()> {
    let broken: Vec<&str> = rules
        .iter()
        .filter(|(_, ok)| !ok)
        .map(|(name, _)| *name)
        .collect();

    for rule in &broken {
        error!("{what}: broken rule: {rule}");
    }

    if broken.is_empty() {
        Ok(())
    } else {
        Err(Error::descriptor(format!(
            "{what}: broken rules: {}",
            broken.join("; ")
        )))
    }
}

fn is_present(map: &Map<String, Value>, key: &str) -> bool {
    map.get(key).map(|v| !v.is_null()).unwrap_or(false)
}

fn has_value_true(map: &Map<String, Value>, key: &str) -> bool {
    map.get(key).and_then(Value::as_bool).unwrap_or(false)
}

fn authorized_keys(map: &Map<String, Value>, allowed: &[&str]) -> bool {
    map.keys().all(|k| allowed.contains(&k.as_str()))
}

const NODE_COMMON_KEYS: &[&str] = &["type", "name", "ip_address", "reactive_port", "deploy_port"];

pub fn check_node(ty: &str, map: &Map<String, Value>) -> Result<()> {
    let what = format!(
        "{} node {}",
        ty,
        map.get("name").and_then(Value::as_str).unwrap_or("<unnamed>")
    );

    let extra: &[&str] = match ty {
        "sancus" => &["vendor_id", "vendor_key"],
        "sgx" => &["module_id", "aesm_port"],
        "native" => &["module_id"],
        "trustzone" => &["number", "module_id"],
        _ => &[],
    };
    let allowed: Vec<&str> = NODE_COMMON_KEYS.iter().chain(extra).copied().collect();

    let mut rules = vec![
        ("name not present", is_present(map, "name")),
        ("ip_address not present", is_present(map, "ip_address")),
        ("reactive_port not present", is_present(map, "reactive_port")),
        ("only authorized keys", authorized_keys(map, &allowed)),
    ];
    match ty {
        "sancus" => {
            rules.push(("vendor_id not present", is_present(map, "vendor_id")));
            rules.push(("vendor_key not present", is_present(map, "vendor_key")));
        }
        "trustzone" => rules.push(("number not present", is_present(map, "number"))),
        _ => {}
    }

    evaluate(&what, &rules)
}

const MODULE_COMMON_KEYS: &[&str] = &[
    "type", "name", "node", "priority", "deployed", "nonce", "attested",
];

pub fn check_module(ty: &str, map: &Map<String, Value>) -> Result<()> {
    let what = format!(
        "{} module {}",
        ty,
        map.get("name").and_then(Value::as_str).unwrap_or("<unnamed>")
    );

    let extra: &[&str] = match ty {
        "sancus" => &["files", "cflags", "ldflags", "binary", "id", "symtab", "key"],
        "sgx" => &[
            "vendor_key", "ra_settings", "features", "id", "binary", "key", "sgxs", "signature",
            "data", "folder",
        ],
        "native" => &["features", "id", "binary", "key", "data", "folder", "port"],
        "trustzone" => &["files_dir", "binary", "id", "key", "inputs", "outputs", "entrypoints"],
        _ => &[],
    };
    let allowed: Vec<&str> = MODULE_COMMON_KEYS.iter().chain(extra).copied().collect();

    let mut rules = vec![
        ("name not present", is_present(map, "name")),
        ("node not present", is_present(map, "node")),
        ("only authorized keys", authorized_keys(map, &allowed)),
    ];
    match ty {
        "sancus" => rules.push(("files not present", is_present(map, "files"))),
        "sgx" => {
            rules.push(("vendor_key not present", is_present(map, "vendor_key")));
            rules.push(("ra_settings not present", is_present(map, "ra_settings")));
        }
        "trustzone" => rules.push(("files_dir not present", is_present(map, "files_dir"))),
        _ => {}
    }

    evaluate(&what, &rules)
}

pub fn check_connection(map: &Map<String, Value>) -> Result<()> {
    let what = format!(
        "connection {}",
        map.get("name").and_then(Value::as_str).unwrap_or("<unnamed>")
    );

    // A dumped descriptor always carries `established`; its presence marks
    // the entry as post-deployment, with all derived fields written out.
    let post_deployment = is_present(map, "established");

    let rules = [
        ("to_module not present", is_present(map, "to_module")),
        ("encryption not present", is_present(map, "encryption")),
        (
            "either direct=True or from_module + from_{output, request}",
            has_value_true(map, "direct")
                != (is_present(map, "from_module")
                    && (is_present(map, "from_output") != is_present(map, "from_request"))),
        ),
        (
            "either one between to_input and to_handler",
            is_present(map, "to_input") != is_present(map, "to_handler"),
        ),
        (
            "direct or from_output->to_input or from_request->to_handler",
            has_value_true(map, "direct")
                || (is_present(map, "from_output") && is_present(map, "to_input"))
                || (is_present(map, "from_request") && is_present(map, "to_handler")),
        ),
        (
            "key present ONLY after deployment",
            post_deployment == is_present(map, "key"),
        ),
        (
            "nonce present ONLY after deployment",
            post_deployment == is_present(map, "nonce"),
        ),
        (
            "id present ONLY after deployment",
            post_deployment == is_present(map, "id"),
        ),
        (
            "name mandatory after deployment",
            !post_deployment || is_present(map, "name"),
        ),
        (
            "direct mandatory after deployment",
            !post_deployment || is_present(map, "direct"),
        ),
        (
            "from_module and to_module must be different",
            map.get("from_module") != map.get("to_module"),
        ),
        (
            "only authorized keys",
            authorized_keys(
                map,
                &[
                    "name", "from_module", "from_output", "from_request", "to_module", "to_input",
                    "to_handler", "encryption", "key", "id", "direct", "nonce", "established",
                ],
            ),
        ),
    ];

    evaluate(&what, &rules)
}

pub fn check_event(map: &Map<String, Value>) -> Result<()> {
    let what = format!(
        "periodic event {}",
        map.get("name").and_then(Value::as_str).unwrap_or("<unnamed>")
    );

    let rules = [
        ("module not present", is_present(map, "module")),
        ("entry not present", is_present(map, "entry")),
        ("frequency not present", is_present(map, "frequency")),
        (
            "only authorized keys",
            authorized_keys(map, &["name", "id", "module", "entry", "frequency", "established"]),
        ),
    ];

    evaluate(&what, &rules)
}

pub fn check_descriptor(map: &Map<String, Value>) -> Result<()> {
    let rules = [
        ("nodes not present", is_present(map, "nodes")),
        ("modules not present", is_present(map, "modules")),
        (
            "only authorized keys",
            authorized_keys(
                map,
                &[
                    "nodes",
                    "modules",
                    "connections",
                    "periodic-events",
                    "connections_current_id",
                    "events_current_id",
                ],
            ),
        ),
    ];

    evaluate("descriptor", &rules)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(v: Value) -> Map<String, Value> {
        v.as_object().unwrap().clone()
    }

    #[test]
    fn test_fresh_direct_connection_passes() {
        let conn = map(json!({
            "direct": true,
            "to_module": "m",
            "to_input": "ep",
            "encryption": "aes",
        }));
        check_connection(&conn).unwrap();
    }

    #[test]
    fn test_fresh_normal_connection_passes() {
        let conn = map(json!({
            "from_module": "a",
            "from_output": "out",
            "to_module": "b",
            "to_input": "in",
            "encryption": "spongent",
        }));
        check_connection(&conn).unwrap();
    }

    #[test]
    fn test_both_endpoint_kinds_rejected() {
        let conn = map(json!({
            "from_module": "a",
            "from_output": "out",
            "from_request": "req",
            "to_module": "b",
            "to_input": "in",
            "encryption": "aes",
        }));
        assert!(check_connection(&conn).is_err());
    }

    #[test]
    fn test_output_to_handler_rejected() {
        let conn = map(json!({
            "from_module": "a",
            "from_output": "out",
            "to_module": "b",
            "to_handler": "h",
            "encryption": "aes",
        }));
        assert!(check_connection(&conn).is_err());
    }

    #[test]
    fn test_key_before_deployment_rejected() {
        let conn = map(json!({
            "direct": true,
            "to_module": "m",
            "to_input": "ep",
            "encryption": "aes",
            "key": "00112233445566778899aabbccddeeff",
        }));
        let err = check_connection(&conn).unwrap_err().to_string();
        assert!(err.contains("key present ONLY after deployment"));
    }

    #[test]
    fn test_post_deployment_connection_passes() {
        let conn = map(json!({
            "name": "conn0",
            "direct": true,
            "to_module": "m",
            "to_input": "ep",
            "encryption": "aes",
            "key": "00112233445566778899aabbccddeeff",
            "id": 0,
            "nonce": 1,
            "established": true,
        }));
        check_connection(&conn).unwrap();
    }

    #[test]
    fn test_self_connection_rejected() {
        let conn = map(json!({
            "from_module": "m",
            "from_output": "out",
            "to_module": "m",
            "to_input": "in",
            "encryption": "aes",
        }));
        assert!(check_connection(&conn).is_err());
    }

    #[test]
    fn test_unknown_key_rejected() {
        let conn = map(json!({
            "direct": true,
            "to_module": "m",
            "to_input": "ep",
            "encryption": "aes",
            "frequency": 100,
        }));
        let err = check_connection(&conn).unwrap_err().to_string();
        assert!(err.contains("only authorized keys"));
    }

    #[test]
    fn test_node_rules() {
        let node = map(json!({
            "type": "sancus",
            "name": "node1",
            "ip_address": "10.0.0.1",
            "reactive_port": 6000,
            "vendor_id": 4660,
            "vendor_key": "0011223344556677",
        }));
        check_node("sancus", &node).unwrap();

        let mut missing = node.clone();
        missing.remove("vendor_key");
        assert!(check_node("sancus", &missing).is_err());
    }

    #[test]
    fn test_module_unknown_key_rejected() {
        let module = map(json!({
            "type": "native",
            "name": "m",
            "node": "n",
            "cflags": ["-O2"],
        }));
        assert!(check_module("native", &module).is_err());
    }

    #[test]
    fn test_event_rules() {
        let event = map(json!({"module": "m", "entry": "tick", "frequency": 1000}));
        check_event(&event).unwrap();

        let event = map(json!({"module": "m", "entry": "tick"}));
        assert!(check_event(&event).is_err());
    }
}
