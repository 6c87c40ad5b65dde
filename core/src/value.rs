use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Where a [`FlowValue`] came from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ValueSourceRef {
    #[serde(rename_all = "camelCase")]
    BlockOutput { block_id: String, output_id: String },
    #[serde(rename_all = "camelCase")]
    ToolInput {
        block_id: String,
        tool_id: String,
        input_id: String,
    },
    #[serde(rename_all = "camelCase")]
    FlowInput { flow_input_id: String },
    #[serde(rename_all = "camelCase")]
    Step {
        block_id: String,
        step_id: String,
        output_id: String,
    },
}

impl ValueSourceRef {
    pub fn flow_input(id: impl Into<String>) -> Self {
        ValueSourceRef::FlowInput {
            flow_input_id: id.into(),
        }
    }

    /// Stable textual form used when hashing lineage.
    pub fn describe(&self) -> String {
        match self {
            ValueSourceRef::BlockOutput {
                block_id,
                output_id,
            } => format!("block_output:{block_id}:{output_id}"),
            ValueSourceRef::ToolInput {
                block_id,
                tool_id,
                input_id,
            } => format!("tool_input:{block_id}:{tool_id}:{input_id}"),
            ValueSourceRef::FlowInput { flow_input_id } => format!("flow_input:{flow_input_id}"),
            ValueSourceRef::Step {
                block_id,
                step_id,
                output_id,
            } => format!("step:{block_id}:{step_id}:{output_id}"),
        }
    }
}

/// An immutable, identity-bearing unit of data with explicit parent lineage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowValue {
    pub id: Uuid,
    pub value_source: ValueSourceRef,
    pub parent_ids: Vec<Uuid>,
    pub value: Value,
}

impl FlowValue {
    pub fn new(value_source: ValueSourceRef, parent_ids: Vec<Uuid>, value: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            value_source,
            parent_ids,
            value,
        }
    }

    /// A root value entering the flow from outside.
    pub fn root(flow_input_id: impl Into<String>, value: Value) -> Self {
        Self::new(ValueSourceRef::flow_input(flow_input_id), Vec::new(), value)
    }

    /// A value caused by `parents`.
    pub fn derived(value_source: ValueSourceRef, parents: &[&FlowValue], value: Value) -> Self {
        Self::new(
            value_source,
            parents.iter().map(|p| p.id).collect(),
            value,
        )
    }

    /// Content address of the causal point that produced this value:
    /// same source and same parent set give the same id.
    pub fn source_id(&self) -> String {
        let mut parents: Vec<String> = self.parent_ids.iter().map(Uuid::to_string).collect();
        parents.sort();

        let mut hasher = Sha256::new();
        hasher.update(self.value_source.describe().as_bytes());
        hasher.update(b"[");
        hasher.update(parents.join(",").as_bytes());
        hasher.update(b"]");
        format!("{:x}", hasher.finalize())
    }
}

/// Serialise with object keys sorted at every level, independent of the map
/// implementation `serde_json` was built with.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}
