use super::unknown_function;
use crate::category::BlockCategory;
use anyhow::bail;
use async_trait::async_trait;
use blockflow_core::{BlockDecl, FieldDecl, FunctionDecl, ParamDecl, TypeDescriptor};
use blockflow_runtime::{Block, CallArgs, Invocation};
use serde_json::{json, Value};

fn any_list() -> TypeDescriptor {
    TypeDescriptor::array(TypeDescriptor::Any)
}

fn function_block(name: &str, description: Option<&str>) -> BlockDecl {
    let decl = BlockDecl::new(name).metadata("category", BlockCategory::Function.to_value());
    match description {
        Some(text) => decl.metadata("description", json!(text)),
        None => decl,
    }
}

/// Buffers items until `count` of them have arrived, then emits them as one
/// list.
#[derive(Debug, Clone, Copy, Default)]
pub struct Collect;

#[async_trait]
impl Block for Collect {
    fn declaration(&self) -> BlockDecl {
        function_block(
            "Collect",
            Some("Collects data and outputs as a list.\nOnce 'count' items have been received it will output the items in a list"),
        )
        .field(FieldDecl::output("items", any_list()))
        .field(FieldDecl::state("items_state", any_list(), json!([])).scoped_to("collect", ["count"]))
        .function(
            FunctionDecl::step("collect")
                .param(ParamDecl::new("item", TypeDescriptor::Any))
                .param(ParamDecl::new("count", TypeDescriptor::Integer).sticky()),
        )
    }

    async fn invoke(
        &self,
        function: &str,
        ctx: &mut Invocation<'_>,
        args: CallArgs,
    ) -> anyhow::Result<Option<Value>> {
        if function != "collect" {
            return Err(unknown_function("Collect", function));
        }

        let count: usize = args.get("count")?;
        let mut items: Vec<Value> = ctx.state("items_state")?;
        items.push(args.value("item").cloned().unwrap_or(Value::Null));

        if items.len() == count {
            ctx.emit("items", &items)?;
            items.clear();
        }
        ctx.set_state("items_state", &items)?;
        Ok(None)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Count;

#[async_trait]
impl Block for Count {
    fn declaration(&self) -> BlockDecl {
        function_block("Count", None).function(
            FunctionDecl::step("count")
                .param(ParamDecl::new("items", any_list()))
                .returns(TypeDescriptor::Integer)
                .output_name("output"),
        )
    }

    async fn invoke(
        &self,
        function: &str,
        _ctx: &mut Invocation<'_>,
        args: CallArgs,
    ) -> anyhow::Result<Option<Value>> {
        if function != "count" {
            return Err(unknown_function("Count", function));
        }
        let items: Vec<Value> = args.get("items")?;
        Ok(Some(json!(items.len())))
    }
}

/// Emits the items of a list one at a time.
#[derive(Debug, Clone, Copy, Default)]
pub struct ForEach;

#[async_trait]
impl Block for ForEach {
    fn declaration(&self) -> BlockDecl {
        function_block(
            "ForEach",
            Some("Loops through a list of items and outputs them one at a time"),
        )
        .field(FieldDecl::output("item", TypeDescriptor::Any))
        .function(FunctionDecl::step("foreach").param(ParamDecl::new("items", any_list())))
    }

    async fn invoke(
        &self,
        function: &str,
        ctx: &mut Invocation<'_>,
        args: CallArgs,
    ) -> anyhow::Result<Option<Value>> {
        if function != "foreach" {
            return Err(unknown_function("ForEach", function));
        }
        for item in args.get::<Vec<Value>>("items")? {
            ctx.emit("item", item)?;
        }
        Ok(None)
    }
}

/// `items[start:end]` for lists and strings, negative indexes counting from
/// the end.
#[derive(Debug, Clone, Copy, Default)]
pub struct Slice;

#[async_trait]
impl Block for Slice {
    fn declaration(&self) -> BlockDecl {
        let sliceable = TypeDescriptor::union([any_list(), TypeDescriptor::String]);
        function_block(
            "Slice",
            Some("Slices a list or string using the configured start and end indexes"),
        )
        .field(FieldDecl::config("start", TypeDescriptor::Integer, Some(json!(0))))
        .field(FieldDecl::config("end", TypeDescriptor::Integer, Some(json!(0))))
        .function(
            FunctionDecl::step("slice")
                .param(ParamDecl::new("items", sliceable.clone()))
                .returns(sliceable)
                .output_name("items"),
        )
    }

    async fn invoke(
        &self,
        function: &str,
        ctx: &mut Invocation<'_>,
        args: CallArgs,
    ) -> anyhow::Result<Option<Value>> {
        if function != "slice" {
            return Err(unknown_function("Slice", function));
        }

        let start: i64 = ctx.config("start")?;
        let end: i64 = ctx.config("end")?;
        let sliced = match args.value("items") {
            Some(Value::Array(items)) => {
                let (from, to) = slice_bounds(items.len(), start, end);
                Value::Array(items[from..to].to_vec())
            }
            Some(Value::String(text)) => {
                let chars: Vec<char> = text.chars().collect();
                let (from, to) = slice_bounds(chars.len(), start, end);
                Value::String(chars[from..to].iter().collect())
            }
            _ => bail!("items must be a list or a string"),
        };
        Ok(Some(sliced))
    }
}

/// Resolve `[start:end]` against a sequence of `len` elements.
fn slice_bounds(len: usize, start: i64, end: i64) -> (usize, usize) {
    let len = len as i64;
    let clamp = |index: i64| {
        if index < 0 {
            (index + len).max(0)
        } else {
            index.min(len)
        }
    };
    let from = clamp(start);
    let to = clamp(end).max(from);
    (from as usize, to as usize)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct First;

#[async_trait]
impl Block for First {
    fn declaration(&self) -> BlockDecl {
        function_block("First", Some("Gets the first item from a list")).function(
            FunctionDecl::step("first")
                .param(ParamDecl::new("items", any_list()))
                .returns(TypeDescriptor::Any)
                .output_name("item"),
        )
    }

    async fn invoke(
        &self,
        function: &str,
        _ctx: &mut Invocation<'_>,
        args: CallArgs,
    ) -> anyhow::Result<Option<Value>> {
        if function != "first" {
            return Err(unknown_function("First", function));
        }
        let items: Vec<Value> = args.get("items")?;
        match items.into_iter().next() {
            Some(item) => Ok(Some(item)),
            None => bail!("list index out of range"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Flatten;

#[async_trait]
impl Block for Flatten {
    fn declaration(&self) -> BlockDecl {
        function_block("Flatten", Some("Flattens a list of lists into a single list")).function(
            FunctionDecl::step("flatten")
                .param(ParamDecl::new("lists", TypeDescriptor::array(any_list())))
                .returns(any_list())
                .output_name("list"),
        )
    }

    async fn invoke(
        &self,
        function: &str,
        _ctx: &mut Invocation<'_>,
        args: CallArgs,
    ) -> anyhow::Result<Option<Value>> {
        if function != "flatten" {
            return Err(unknown_function("Flatten", function));
        }
        let lists: Vec<Vec<Value>> = args.get("lists")?;
        Ok(Some(Value::Array(lists.into_iter().flatten().collect())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blockflow_core::{BlockRunRequest, InputValue, InvocationBatch};
    use blockflow_runtime::{BlockRegistry, Engine};
    use std::sync::Arc;

    fn engine() -> Engine {
        let registry = Arc::new(BlockRegistry::new());
        crate::register_standard_blocks(&registry).unwrap();
        Engine::new(registry)
    }

    async fn run(block: &str, function: &str, inputs: Vec<InputValue>) -> InvocationBatch {
        let request = BlockRunRequest {
            name: block.to_string(),
            version: "*".to_string(),
            function: function.to_string(),
            state: vec![],
            inputs,
            dynamic_outputs: vec![],
            dynamic_inputs: vec![],
        };
        engine().run_request(&request).await.unwrap()
    }

    fn returned(batch: &InvocationBatch, port: &str, pin: &str) -> Vec<Value> {
        batch.outputs_on(port, pin).map(|o| o.value.clone()).collect()
    }

    #[test]
    fn test_slice_bounds() {
        assert_eq!(slice_bounds(5, 1, 3), (1, 3));
        assert_eq!(slice_bounds(5, -2, 5), (3, 5));
        assert_eq!(slice_bounds(5, 0, -1), (0, 4));
        assert_eq!(slice_bounds(5, 4, 2), (4, 4));
        assert_eq!(slice_bounds(3, -10, 10), (0, 3));
        assert_eq!(slice_bounds(5, 0, 0), (0, 0));
    }

    #[tokio::test]
    async fn test_slice_lists_and_strings() {
        let batch = run(
            "Slice",
            "slice",
            vec![
                InputValue::new("start", "", json!(1)),
                InputValue::new("end", "", json!(-1)),
                InputValue::new("slice", "items", json!([1, 2, 3, 4])),
            ],
        )
        .await;
        assert_eq!(returned(&batch, "slice", "items"), vec![json!([2, 3])]);

        let batch = run(
            "Slice",
            "slice",
            vec![
                InputValue::new("end", "", json!(3)),
                InputValue::new("slice", "items", json!("héllo")),
            ],
        )
        .await;
        assert_eq!(returned(&batch, "slice", "items"), vec![json!("hél")]);
    }

    #[tokio::test]
    async fn test_count_first_flatten() {
        let batch = run("Count", "count", vec![InputValue::new("count", "items", json!([1, 2]))]).await;
        assert_eq!(returned(&batch, "count", "output"), vec![json!(2)]);

        let batch = run("First", "first", vec![InputValue::new("first", "items", json!(["x", "y"]))]).await;
        assert_eq!(returned(&batch, "first", "item"), vec![json!("x")]);

        let batch = run(
            "Flatten",
            "flatten",
            vec![InputValue::new("flatten", "lists", json!([[1], [], [2, 3]]))],
        )
        .await;
        assert_eq!(returned(&batch, "flatten", "list"), vec![json!([1, 2, 3])]);
    }

    #[tokio::test]
    async fn test_first_of_empty_list_is_an_error_value() {
        let batch = run("First", "first", vec![InputValue::new("first", "items", json!([]))]).await;
        assert!(batch.is_error());
        assert!(returned(&batch, "first", "item").is_empty());
    }

    #[tokio::test]
    async fn test_foreach_emits_in_order() {
        let batch = run("ForEach", "foreach", vec![InputValue::new("foreach", "items", json!(["a", "b"]))]).await;
        let emitted: Vec<(Value, u64)> = batch
            .outputs_on("item", "")
            .map(|o| (o.value.clone(), o.index))
            .collect();
        assert_eq!(emitted, vec![(json!("a"), 0), (json!("b"), 1)]);
    }

    #[tokio::test]
    async fn test_collect_emits_when_full() {
        let batch = run(
            "Collect",
            "collect",
            vec![
                InputValue::new("collect", "item", json!(1)),
                InputValue::new("collect", "count", json!(1)),
            ],
        )
        .await;
        assert_eq!(returned(&batch, "items", ""), vec![json!([1])]);
        let states: Vec<_> = batch.states().cloned().collect();
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].value, json!([]));
    }
}
