use serde_json::{json, Value};

/// Catalogue grouping shown next to a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockCategory {
    Agent,
    Function,
    Data,
    Custom,
}

impl BlockCategory {
    pub fn name(self) -> &'static str {
        match self {
            BlockCategory::Agent => "Agent",
            BlockCategory::Function => "Function",
            BlockCategory::Data => "Data",
            BlockCategory::Custom => "Custom",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            BlockCategory::Agent => "An entity that performs actions",
            BlockCategory::Function => "A callable entity",
            BlockCategory::Data => "A data entity",
            BlockCategory::Custom => "A custom entity",
        }
    }

    /// The `category` entry of block metadata.
    pub fn to_value(self) -> Value {
        json!({"name": self.name(), "description": self.description()})
    }
}
