use super::unknown_function;
use crate::category::BlockCategory;
use async_trait::async_trait;
use blockflow_core::{BlockDecl, FieldDecl, FunctionDecl, ParamDecl, TypeDescriptor};
use blockflow_runtime::{Block, CallArgs, Invocation};
use serde_json::{json, Value};

#[derive(Debug, Clone, Copy, Default)]
pub struct JoinStrings;

#[async_trait]
impl Block for JoinStrings {
    fn declaration(&self) -> BlockDecl {
        BlockDecl::new("JoinStrings")
            .metadata("category", BlockCategory::Function.to_value())
            .metadata(
                "description",
                json!("Joins a list of strings using the configured separator and outputs the resulting string"),
            )
            .field(FieldDecl::config("separator", TypeDescriptor::String, Some(json!(""))))
            .function(
                FunctionDecl::step("join")
                    .param(ParamDecl::new("strings", TypeDescriptor::array(TypeDescriptor::String)))
                    .returns(TypeDescriptor::String)
                    .output_name("output"),
            )
    }

    async fn invoke(
        &self,
        function: &str,
        ctx: &mut Invocation<'_>,
        args: CallArgs,
    ) -> anyhow::Result<Option<Value>> {
        if function != "join" {
            return Err(unknown_function("JoinStrings", function));
        }
        let separator: String = ctx.config("separator")?;
        let strings: Vec<String> = args.get("strings")?;
        Ok(Some(json!(strings.join(&separator))))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SplitString;

#[async_trait]
impl Block for SplitString {
    fn declaration(&self) -> BlockDecl {
        BlockDecl::new("SplitString")
            .metadata("category", BlockCategory::Function.to_value())
            .metadata(
                "description",
                json!("Splits a string using the configured separator and outputs a list of the substrings"),
            )
            .field(FieldDecl::config("separator", TypeDescriptor::String, Some(json!("\n"))))
            .field(FieldDecl::config("include_separator", TypeDescriptor::Bool, Some(json!(false))))
            .function(
                FunctionDecl::step("split")
                    .param(ParamDecl::new("string", TypeDescriptor::String))
                    .returns(TypeDescriptor::array(TypeDescriptor::String))
                    .output_name("output"),
            )
    }

    async fn invoke(
        &self,
        function: &str,
        ctx: &mut Invocation<'_>,
        args: CallArgs,
    ) -> anyhow::Result<Option<Value>> {
        if function != "split" {
            return Err(unknown_function("SplitString", function));
        }
        let separator: String = ctx.config("separator")?;
        let include_separator: bool = ctx.config("include_separator")?;
        let string: String = args.get("string")?;
        Ok(Some(json!(split(&string, &separator, include_separator)?)))
    }
}

/// Split on `separator`, optionally keeping it at the end of every part but
/// the last.
fn split(string: &str, separator: &str, include_separator: bool) -> anyhow::Result<Vec<String>> {
    if separator.is_empty() {
        anyhow::bail!("empty separator");
    }
    let mut parts: Vec<String> = string.split(separator).map(str::to_string).collect();
    if include_separator {
        let last = parts.len() - 1;
        for part in &mut parts[..last] {
            part.push_str(separator);
        }
    }
    Ok(parts)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Concat;

#[async_trait]
impl Block for Concat {
    fn declaration(&self) -> BlockDecl {
        BlockDecl::new("Concat")
            .metadata("category", BlockCategory::Function.to_value())
            .function(
                FunctionDecl::step("concat")
                    .param(ParamDecl::new("a", TypeDescriptor::String))
                    .param(ParamDecl::new("b", TypeDescriptor::String))
                    .returns(TypeDescriptor::String)
                    .output_name("result"),
            )
    }

    async fn invoke(
        &self,
        function: &str,
        _ctx: &mut Invocation<'_>,
        args: CallArgs,
    ) -> anyhow::Result<Option<Value>> {
        if function != "concat" {
            return Err(unknown_function("Concat", function));
        }
        let a: String = args.get("a")?;
        let b: String = args.get("b")?;
        Ok(Some(json!(a + &b)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blockflow_core::{BlockPlacement, BlockType, ProvenanceConfig};
    use blockflow_runtime::{BlockRegistry, BoundValue, Engine, FlowScope};
    use std::sync::Arc;

    #[test]
    fn test_split() {
        assert_eq!(split("a\nb\nc", "\n", false).unwrap(), vec!["a", "b", "c"]);
        assert_eq!(split("a,b,", ",", true).unwrap(), vec!["a,", "b,", ""]);
        assert_eq!(split("abc", ",", true).unwrap(), vec!["abc"]);
        assert!(split("abc", "", false).is_err());
    }

    fn engine() -> Arc<Engine> {
        let registry = Arc::new(BlockRegistry::new());
        crate::register_standard_blocks(&registry).unwrap();
        Arc::new(Engine::new(registry))
    }

    #[tokio::test]
    async fn test_join_uses_placed_separator() {
        let engine = engine();
        let scope = FlowScope::new(&ProvenanceConfig::default());
        let placement = BlockPlacement::new("join", BlockType::new("JoinStrings", "1.0.0"))
            .config("separator", json!(", "));
        let mut host = engine.spawn_host(scope.clone(), &placement).unwrap();

        let strings = scope.root("strings", json!(["a", "b"])).unwrap();
        let outcome = host
            .run_step("join", vec![BoundValue::flow("join", "strings", strings)])
            .await
            .unwrap();
        assert_eq!(
            outcome.batch.outputs_on("join", "output").next().map(|o| o.value.clone()),
            Some(json!("a, b"))
        );
    }

    #[tokio::test]
    async fn test_concat_and_split() {
        let engine = engine();
        let scope = FlowScope::new(&ProvenanceConfig::default());

        let placement = BlockPlacement::new("concat", BlockType::new("Concat", "1.0.0"));
        let mut concat = engine.spawn_host(scope.clone(), &placement).unwrap();
        let outcome = concat
            .run_step(
                "concat",
                vec![
                    BoundValue::literal("concat", "a", json!("x\n")),
                    BoundValue::literal("concat", "b", json!("y")),
                ],
            )
            .await
            .unwrap();
        let joined = outcome.values_on("concat", "result").next().cloned().unwrap();
        assert_eq!(joined.value, json!("x\ny"));

        let placement = BlockPlacement::new("split", BlockType::new("SplitString", "1.0.0"));
        let mut splitter = engine.spawn_host(scope, &placement).unwrap();
        let outcome = splitter
            .run_step("split", vec![BoundValue::flow("split", "string", joined)])
            .await
            .unwrap();
        assert_eq!(
            outcome.batch.outputs_on("split", "output").next().map(|o| o.value.clone()),
            Some(json!(["x", "y"]))
        );
    }
}
