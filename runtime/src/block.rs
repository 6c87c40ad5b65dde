use crate::invocation::Invocation;
use async_trait::async_trait;
use blockflow_core::BlockDecl;
use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde_json::Value;

/// The contract every block implementation fulfils.
///
/// A block object carries no per-instance data: configuration, state and
/// inputs are handed in through the [`Invocation`] for each call, so one
/// object serves every placement of the block type.
#[async_trait]
pub trait Block: Send + Sync + 'static {
    /// The declared shape of the block; its interface is derived from this once
    /// at registration.
    fn declaration(&self) -> BlockDecl;

    /// Run the step or callback named `function`.
    ///
    /// A returned value is emitted on the step's output pin. An error is
    /// converted into a value on the `error` output.
    async fn invoke(
        &self,
        function: &str,
        ctx: &mut Invocation<'_>,
        args: CallArgs,
    ) -> anyhow::Result<Option<Value>>;
}

/// An argument bound from a function pin.
#[derive(Debug, Clone, PartialEq)]
pub enum ArgValue {
    Single(Value),
    List(Vec<Value>),
    Dictionary(IndexMap<String, Value>),
}

impl ArgValue {
    pub fn to_value(&self) -> Value {
        match self {
            ArgValue::Single(value) => value.clone(),
            ArgValue::List(items) => Value::Array(items.clone()),
            ArgValue::Dictionary(entries) => Value::Object(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            ),
        }
    }
}

/// Arguments of one invocation, in parameter order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallArgs {
    args: IndexMap<String, ArgValue>,
}

impl CallArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: ArgValue) {
        self.args.insert(name.into(), value);
    }

    pub fn raw(&self, name: &str) -> Option<&ArgValue> {
        self.args.get(name)
    }

    /// Deserialize an argument. List arguments read as arrays, dictionary
    /// arguments as objects.
    pub fn get<T: DeserializeOwned>(&self, name: &str) -> anyhow::Result<T> {
        let arg = self
            .args
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("missing argument '{name}'"))?;
        serde_json::from_value(arg.to_value())
            .map_err(|e| anyhow::anyhow!("argument '{name}' has the wrong shape: {e}"))
    }

    /// A singular argument as raw JSON.
    pub fn value(&self, name: &str) -> Option<&Value> {
        match self.args.get(name) {
            Some(ArgValue::Single(value)) => Some(value),
            _ => None,
        }
    }

    /// A variadic positional argument; empty when absent.
    pub fn list(&self, name: &str) -> &[Value] {
        match self.args.get(name) {
            Some(ArgValue::List(items)) => items,
            _ => &[],
        }
    }

    pub fn dict(&self, name: &str) -> Option<&IndexMap<String, Value>> {
        match self.args.get(name) {
            Some(ArgValue::Dictionary(entries)) => Some(entries),
            _ => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ArgValue)> {
        self.args.iter()
    }

    pub fn len(&self) -> usize {
        self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }
}
