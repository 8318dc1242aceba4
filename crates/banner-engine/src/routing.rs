//! Turns the layer-design and layer-routing payloads into the closed set of
//! six layer specs.

use banner_contracts::layers::{default_layer_specs, LayerKind, LayerSpec};
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

/// Specs named by a layer design payload (`{"layers": {...}}`, a bare layer
/// object, or an array of entries). Unknown layer names are dropped, missing
/// kinds get their defaults, and the result is in stacking order.
pub fn specs_from_design(design: &Value) -> Vec<LayerSpec> {
    let mut specs = default_layer_specs();
    let layers = design.get("layers").unwrap_or(design);

    let mut apply = |name: &str, entry: &Value| match LayerKind::parse(name) {
        Some(kind) => specs[kind.stack_index()] = LayerSpec::from_design_entry(kind, entry),
        None => warn!(event = "unknown_layer_dropped", layer = name),
    };

    match layers {
        Value::Object(map) => {
            for (name, entry) in map {
                apply(name, entry);
            }
        }
        Value::Array(rows) => {
            for row in rows {
                if let Some(name) = entry_name(row) {
                    apply(&name, row);
                }
            }
        }
        _ => {}
    }
    specs
}

/// Routing entries as objects, from either a bare array or an object holding
/// one under `routing`/`layers`.
pub fn routing_entries(routing: &Value) -> Vec<Map<String, Value>> {
    let rows = match routing {
        Value::Array(rows) => rows.clone(),
        Value::Object(map) => match map.get("routing").or_else(|| map.get("layers")) {
            Some(Value::Array(rows)) => rows.clone(),
            Some(Value::Object(inner)) => inner
                .iter()
                .map(|(name, entry)| {
                    let mut row = entry.as_object().cloned().unwrap_or_default();
                    row.entry("layer_name".to_string())
                        .or_insert_with(|| Value::String(name.clone()));
                    Value::Object(row)
                })
                .collect(),
            _ => Vec::new(),
        },
        _ => Vec::new(),
    };
    rows.into_iter()
        .filter_map(|row| match row {
            Value::Object(map) => Some(map),
            _ => None,
        })
        .collect()
}

/// Final per-layer plan. With `use_llm_routing` the routing entries enrich
/// the design specs; otherwise the design specs are used as they are.
/// Modality always follows the kind.
pub fn resolve_plan(
    specs: Vec<LayerSpec>,
    entries: &[Map<String, Value>],
    use_llm_routing: bool,
) -> Vec<LayerSpec> {
    if !use_llm_routing {
        return specs;
    }
    let mut plan = specs;
    for entry in entries {
        let Some(name) = entry_name(&Value::Object(entry.clone())) else {
            continue;
        };
        match LayerKind::parse(&name) {
            Some(kind) => {
                if let Some(spec) = plan.iter_mut().find(|spec| spec.kind == kind) {
                    spec.merge_routing_entry(entry);
                    debug!(event = "routing_merged", layer = kind.key());
                }
            }
            None => warn!(event = "unknown_route_dropped", layer = %name),
        }
    }
    plan
}

pub fn plan_document(plan: &[LayerSpec], use_llm_routing: bool) -> Value {
    json!({
        "source": if use_llm_routing { "llm_routing" } else { "layer_design" },
        "layers": plan.iter().map(LayerSpec::to_plan_entry).collect::<Vec<Value>>(),
    })
}

fn entry_name(row: &Value) -> Option<String> {
    ["layer_name", "layer", "name", "kind"]
        .iter()
        .find_map(|key| row.get(*key).and_then(Value::as_str))
        .map(str::to_string)
}
