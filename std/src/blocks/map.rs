use super::unknown_function;
use crate::category::BlockCategory;
use async_trait::async_trait;
use blockflow_core::{
    BlockDecl, CallbackCall, FieldDecl, FunctionDecl, ParamDecl, ToolSignature, TypeDescriptor,
};
use blockflow_runtime::{Block, CallArgs, Invocation, ToolArgs};
use serde_json::{json, Value};

/// Sends every item to the `run` tool and emits the results, in item order,
/// once all of them have come back.
#[derive(Debug, Clone, Copy, Default)]
pub struct Map;

#[async_trait]
impl Block for Map {
    fn declaration(&self) -> BlockDecl {
        let items = TypeDescriptor::array(TypeDescriptor::Any);
        BlockDecl::new("Map")
            .metadata("category", BlockCategory::Function.to_value())
            .metadata(
                "description",
                json!("Loops through each item in the items input and sends them to the configured tool. Once all items have been processed, outputs the resulting list"),
            )
            .field(FieldDecl::tool(
                "run",
                ToolSignature::new()
                    .param(ParamDecl::new("item", TypeDescriptor::Any))
                    .returns(TypeDescriptor::Any),
            ))
            .field(FieldDecl::output("results", items.clone()))
            .field(FieldDecl::state("count", TypeDescriptor::Integer, json!(0)).scoped_to("map", ["items"]))
            .field(
                FieldDecl::state("results_state", items.clone(), json!([]))
                    .scoped_to("map", ["items"]),
            )
            .function(FunctionDecl::step("map").param(ParamDecl::new("items", items)))
            .function(
                FunctionDecl::callback("collect")
                    .param(ParamDecl::new("result", TypeDescriptor::Any))
                    .param(ParamDecl::new("index", TypeDescriptor::Integer)),
            )
    }

    async fn invoke(
        &self,
        function: &str,
        ctx: &mut Invocation<'_>,
        args: CallArgs,
    ) -> anyhow::Result<Option<Value>> {
        match function {
            "map" => {
                let items: Vec<Value> = args.get("items")?;
                if items.is_empty() {
                    ctx.emit("results", Vec::<Value>::new())?;
                    return Ok(None);
                }

                ctx.set_state("results_state", vec![Value::Null; items.len()])?;
                ctx.set_state("count", items.len())?;
                for (index, item) in items.into_iter().enumerate() {
                    ctx.tool("run")
                        .call(ToolArgs::new().arg("item", item))?
                        .then(CallbackCall::new("collect", "result").with("index", index))?;
                }
            }
            "collect" => {
                let index: usize = args.get("index")?;
                let mut results: Vec<Value> = ctx.state("results_state")?;
                let slot = results
                    .get_mut(index)
                    .ok_or_else(|| anyhow::anyhow!("result index {index} is out of range"))?;
                *slot = args.value("result").cloned().unwrap_or(Value::Null);

                let count = ctx.state::<usize>("count")?.saturating_sub(1);
                tracing::debug!(index, remaining = count, "map result collected");
                ctx.set_state("results_state", &results)?;
                ctx.set_state("count", count)?;
                if count == 0 {
                    ctx.emit("results", &results)?;
                }
            }
            other => return Err(unknown_function("Map", other)),
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blockflow_core::build_interface;

    #[test]
    fn test_map_interface() {
        let interface = build_interface(&Map.declaration()).unwrap();

        let run = interface.port("run").unwrap();
        assert!(run.is_tool());
        assert!(run.outputs.contains_key("item"));
        assert!(run.inputs.contains_key("return"));

        assert!(interface.port("collect").unwrap().is_callback());
        let scope = &interface.state["count"].scope;
        assert_eq!(scope.len(), 1);
        assert_eq!((scope[0].port.as_str(), scope[0].pin.as_str()), ("map", "items"));
        assert_eq!(interface.metadata["category"]["name"], json!("Function"));
    }
}
