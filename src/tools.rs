//! Tool definitions and the registry that governs their visibility.
//!
//! `spec.md` §3 and §4.4 describe an [`AIFunction`] (here: [`Tool`]) that can
//! additionally act as a *container* or *skill*: a synthetic tool whose
//! invocation reveals a set of previously hidden tools to the rest of the
//! run. That tagging is [`ToolKind`]; the visibility bookkeeping it drives is
//! [`ToolRegistry`], which has no counterpart in the teacher crate (the
//! teacher has no notion of hidden tools) and is grounded instead on
//! `spec.md` §4.4 directly.
//!
//! Everything else here — the schema-normalization helpers, [`ToolBuilder`],
//! and the [`ToolHandler`] closure type — is carried from the teacher's
//! `tools.rs` with the OpenAI-specific wire conversion renamed to
//! `normalize_schema` since it's no longer solely an OpenAI concern (the
//! `providers::openai_compatible` adapter calls it when building its request
//! body, but so would any other provider adapter with the same convention).

use crate::error::Result;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Handler invoked with a tool's arguments, returning its result.
///
/// `Arc`-wrapped so a [`Tool`] can be cloned cheaply (registries hand out
/// clones rather than references) without duplicating the closure itself.
pub type ToolHandler =
    Arc<dyn Fn(Value) -> Pin<Box<dyn Future<Output = Result<Value>> + Send>> + Send + Sync>;

/// How a tool participates in container/skill visibility (`spec.md` §4.4).
///
/// A `Plain` tool is always visible. A `Container` or `Skill` tool is itself
/// the only thing visible until its name appears in a branch's
/// `expandedContainers` set, at which point it hides and its
/// `referenced_tools` become visible in its place. `Skill` additionally
/// carries a system-prompt fragment injected for the remainder of the run
/// once expanded; `Container` does not.
#[derive(Clone)]
pub enum ToolKind {
    Plain,
    Container {
        referenced_tools: Vec<String>,
        function_result_text: String,
    },
    Skill {
        referenced_tools: Vec<String>,
        function_result_text: String,
        system_prompt_text: String,
    },
}

impl std::fmt::Debug for ToolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ToolKind::Plain => write!(f, "Plain"),
            ToolKind::Container { referenced_tools, .. } => f
                .debug_struct("Container")
                .field("referenced_tools", referenced_tools)
                .finish(),
            ToolKind::Skill { referenced_tools, .. } => f
                .debug_struct("Skill")
                .field("referenced_tools", referenced_tools)
                .finish(),
        }
    }
}

/// A tool an agent can invoke.
///
/// Tools are immutable once built: all fields are cheaply cloneable (the
/// handler is an `Arc`), so a [`ToolRegistry`] hands out owned clones instead
/// of references and nothing needs a lock to read tool metadata concurrently
/// with an in-flight call.
#[derive(Clone)]
pub struct Tool {
    name: String,
    description: String,
    input_schema: Value,
    kind: ToolKind,
    handler: ToolHandler,
}

impl Tool {
    /// Creates a tool, normalizing `input_schema` through [`normalize_schema`].
    ///
    /// Accepts the same three schema shapes the teacher's constructor did:
    /// simple type notation (`{"x": "number"}`), extended per-property
    /// schema (`{"x": {"type": "number", "optional": true}}`), or a
    /// pass-through full JSON Schema.
    pub fn new<F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: Value,
        handler: F,
    ) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema: normalize_schema(input_schema),
            kind: ToolKind::Plain,
            handler: Arc::new(move |args| Box::pin(handler(args))),
        }
    }

    /// Executes the tool's handler and awaits its result.
    pub async fn execute(&self, arguments: Value) -> Result<Value> {
        (self.handler)(arguments).await
    }

    /// This tool's schema in `{"type": "function", "function": {...}}` form,
    /// the shape `providers::openai_compatible` sends verbatim as one entry
    /// of a chat-completion request's `tools` array.
    pub fn to_function_schema(&self) -> Value {
        serde_json::json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": self.input_schema,
            }
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn input_schema(&self) -> &Value {
        &self.input_schema
    }

    pub fn kind(&self) -> &ToolKind {
        &self.kind
    }

    pub fn is_container(&self) -> bool {
        matches!(self.kind, ToolKind::Container { .. } | ToolKind::Skill { .. })
    }
}

impl std::fmt::Debug for Tool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tool")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("input_schema", &self.input_schema)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Normalizes a tool's input schema to a full JSON Schema object, the way
/// the teacher's `convert_schema_to_openai` did. Kept as a free function
/// rather than a `Tool` method since `ToolBuilder::build` also needs it
/// before a `Tool` exists.
///
/// - Already-complete schemas (`"type"` and `"properties"` both present)
///   pass through unchanged.
/// - A flat map of `name -> "typestring"` becomes `properties` with every
///   key required.
/// - A flat map of `name -> {extended property schema}` becomes `properties`
///   with `required` computed per key: explicit `"required": true` wins,
///   explicit `"optional": true` or `"required": false` excludes, a
///   `"default"` key excludes, otherwise required.
fn normalize_schema(schema: Value) -> Value {
    if schema.is_object() {
        let obj = schema
            .as_object()
            .expect("is_object() true but as_object() returned None");
        if obj.contains_key("type") && obj.contains_key("properties") {
            return schema;
        }

        let mut properties = serde_json::Map::new();
        let mut required = Vec::new();

        for (param_name, param_type) in obj {
            if let Some(type_str) = param_type.as_str() {
                properties.insert(param_name.clone(), type_to_json_schema(type_str));
                required.push(param_name.clone());
            } else if param_type.is_object() {
                let mut prop = param_type.clone();
                let prop_obj = prop
                    .as_object_mut()
                    .expect("is_object() true but as_object_mut() returned None");

                let is_optional = prop_obj
                    .remove("optional")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);
                let is_required = prop_obj.remove("required").and_then(|v| v.as_bool());
                let has_default = prop_obj.contains_key("default");

                properties.insert(param_name.clone(), prop);

                if let Some(true) = is_required {
                    required.push(param_name.clone());
                } else if is_optional || is_required == Some(false) {
                    // explicitly optional
                } else if !has_default {
                    required.push(param_name.clone());
                }
            }
        }

        return serde_json::json!({
            "type": "object",
            "properties": properties,
            "required": required,
        });
    }

    serde_json::json!({"type": "object", "properties": {}, "required": []})
}

/// Maps a friendly type string to a JSON Schema `{"type": ...}` object.
/// Unrecognized strings default to `"string"` rather than erroring, so a
/// typo in a `.param()` call degrades gracefully instead of panicking at
/// tool-build time.
fn type_to_json_schema(type_str: &str) -> Value {
    let json_type = match type_str {
        "string" | "str" => "string",
        "integer" | "int" | "i32" | "i64" | "u32" | "u64" => "integer",
        "number" | "float" | "f32" | "f64" => "number",
        "boolean" | "bool" => "boolean",
        "array" | "list" | "vec" => "array",
        "object" | "dict" | "map" => "object",
        _ => "string",
    };
    serde_json::json!({ "type": json_type })
}

/// Fluent builder for [`Tool`], kept from the teacher with `.container()`/
/// `.skill()` finishers added alongside `.build()` for the new
/// [`ToolKind`] tagging.
pub struct ToolBuilder {
    name: String,
    description: String,
    schema: Value,
}

impl ToolBuilder {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            schema: serde_json::json!({}),
        }
    }

    /// Replaces the schema entirely. Mixing this with `.param()` calls
    /// resets a non-object schema back to `{}` on the next `.param()`.
    pub fn schema(mut self, schema: Value) -> Self {
        self.schema = schema;
        self
    }

    /// Adds one required parameter in simple type notation.
    pub fn param(mut self, name: &str, type_str: &str) -> Self {
        if !self.schema.is_object() {
            self.schema = serde_json::json!({});
        }
        let obj = self
            .schema
            .as_object_mut()
            .expect("schema should be an object after initialization");
        obj.insert(name.to_string(), Value::String(type_str.to_string()));
        self
    }

    /// Finalizes a plain tool with the given handler.
    pub fn build<F, Fut>(self, handler: F) -> Tool
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        Tool::new(self.name, self.description, self.schema, handler)
    }

    /// Finalizes a container tool: invoking it reveals `referenced_tools`
    /// and never executes further handler logic beyond the agent loop's
    /// fixed expansion behavior, so `function_result_text` is returned
    /// as-is on every call rather than going through a user handler.
    pub fn container(
        self,
        referenced_tools: Vec<String>,
        function_result_text: impl Into<String>,
    ) -> Tool {
        let text = function_result_text.into();
        let kind = ToolKind::Container {
            referenced_tools,
            function_result_text: text.clone(),
        };
        let mut t = Tool::new(self.name, self.description, self.schema, move |_args| {
            let text = text.clone();
            async move { Ok(serde_json::json!(text)) }
        });
        t.kind = kind;
        t
    }

    /// Finalizes a skill tool: like [`ToolBuilder::container`] but also
    /// injects `system_prompt_text` for the remainder of the run once
    /// expanded.
    pub fn skill(
        self,
        referenced_tools: Vec<String>,
        function_result_text: impl Into<String>,
        system_prompt_text: impl Into<String>,
    ) -> Tool {
        let text = function_result_text.into();
        let system_prompt_text = system_prompt_text.into();
        let kind = ToolKind::Skill {
            referenced_tools,
            function_result_text: text.clone(),
            system_prompt_text,
        };
        let mut t = Tool::new(self.name, self.description, self.schema, move |_args| {
            let text = text.clone();
            async move { Ok(serde_json::json!(text)) }
        });
        t.kind = kind;
        t
    }
}

/// Convenience entry point for [`ToolBuilder::new`].
pub fn tool(name: impl Into<String>, description: impl Into<String>) -> ToolBuilder {
    ToolBuilder::new(name, description)
}

/// What expanding a container/skill tool reveals, returned by
/// [`ToolRegistry::expansion`].
#[derive(Debug, Clone)]
pub struct Expansion {
    pub referenced_tools: Vec<String>,
    pub function_result_text: String,
    pub system_prompt_text: Option<String>,
}

/// Tracks every tool registered for a run and computes which are visible
/// given a branch's `expandedContainers` set (`spec.md` §4.4).
///
/// No teacher equivalent: the teacher's SDK has no container/skill concept,
/// so this struct is grounded directly on `spec.md` §4.4's visibility rules
/// rather than on any teacher source. Its registration/lookup API follows
/// the teacher's general preference for plain owned collections over
/// trait objects where a closed set of operations suffices.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Tool>,
    /// Name of the container/skill each tool is nested under, if any. Used
    /// to hide a referenced tool again if its container is collapsed (not
    /// currently exposed, but kept so `is_contained` queries are O(1)).
    container_of: HashMap<String, String>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a tool, indexing its referenced tools (if it is a
    /// container or skill) as nested under it.
    pub fn register(&mut self, tool: Tool) {
        if let ToolKind::Container { referenced_tools, .. } | ToolKind::Skill { referenced_tools, .. } =
            &tool.kind
        {
            for name in referenced_tools {
                self.container_of.insert(name.clone(), tool.name.clone());
            }
        }
        self.tools.insert(tool.name.clone(), tool);
    }

    pub fn find_by_name(&self, name: &str) -> Option<&Tool> {
        self.tools.get(name)
    }

    pub fn is_container(&self, name: &str) -> bool {
        self.tools.get(name).is_some_and(Tool::is_container)
    }

    /// Details needed by the agent loop / container middleware when a
    /// container/skill tool is invoked and must be expanded. Returns
    /// `None` for a plain tool or an unknown name.
    pub fn expansion(&self, name: &str) -> Option<Expansion> {
        match self.tools.get(name)?.kind.clone() {
            ToolKind::Plain => None,
            ToolKind::Container {
                referenced_tools,
                function_result_text,
            } => Some(Expansion {
                referenced_tools,
                function_result_text,
                system_prompt_text: None,
            }),
            ToolKind::Skill {
                referenced_tools,
                function_result_text,
                system_prompt_text,
            } => Some(Expansion {
                referenced_tools,
                function_result_text,
                system_prompt_text: Some(system_prompt_text),
            }),
        }
    }

    /// The tools visible to the provider on this iteration, given the set
    /// of container/skill names already expanded on the current branch.
    ///
    /// Visibility rule (`spec.md` §4.4): a tool nested under an
    /// unexpanded container is hidden; everything else — ungrouped tools,
    /// and the synthetic container/skill tool itself before expansion — is
    /// visible. Once a container's name is in `expanded`, the container
    /// hides and its referenced tools (if still registered) take its
    /// place.
    pub fn snapshot_visible(&self, expanded: &HashSet<String>) -> Vec<&Tool> {
        self.tools
            .values()
            .filter(|t| {
                if expanded.contains(&t.name) {
                    // An expanded container/skill itself no longer shows up;
                    // its referenced tools do, handled by the branch below.
                    return false;
                }
                match self.container_of.get(&t.name) {
                    // Nested under a container: visible only once that
                    // container has been expanded.
                    Some(parent) => expanded.contains(parent),
                    None => true,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn noop_tool(name: &str) -> Tool {
        Tool::new(name, "test tool", json!({}), |_| async { Ok(json!({})) })
    }

    #[test]
    fn normalize_schema_simple_notation_marks_everything_required() {
        let schema = normalize_schema(json!({"query": "string", "limit": "integer"}));
        assert_eq!(schema["type"], "object");
        assert_eq!(schema["properties"]["query"]["type"], "string");
        assert_eq!(schema["properties"]["limit"]["type"], "integer");
        let required: Vec<_> = schema["required"].as_array().unwrap().iter().collect();
        assert_eq!(required.len(), 2);
    }

    #[test]
    fn normalize_schema_extended_notation_respects_optionality() {
        let schema = normalize_schema(json!({
            "query": {"type": "string"},
            "limit": {"type": "integer", "optional": true},
            "page": {"type": "integer", "default": 1},
        }));
        let required: Vec<&str> = schema["required"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap())
            .collect();
        assert!(required.contains(&"query"));
        assert!(!required.contains(&"limit"));
        assert!(!required.contains(&"page"));
    }

    #[test]
    fn normalize_schema_passes_through_full_json_schema() {
        let full = json!({"type": "object", "properties": {"a": {"type": "string"}}, "required": ["a"]});
        assert_eq!(normalize_schema(full.clone()), full);
    }

    #[test]
    fn type_alias_table_covers_rust_and_python_style_names() {
        assert_eq!(type_to_json_schema("i64"), json!({"type": "integer"}));
        assert_eq!(type_to_json_schema("vec"), json!({"type": "array"}));
        assert_eq!(type_to_json_schema("dict"), json!({"type": "object"}));
        assert_eq!(type_to_json_schema("unknown"), json!({"type": "string"}));
    }

    #[tokio::test]
    async fn tool_executes_handler_and_reports_schema() {
        let t = tool("add", "Add two numbers")
            .param("a", "number")
            .param("b", "number")
            .build(|args| async move {
                let a = args["a"].as_f64().unwrap_or(0.0);
                let b = args["b"].as_f64().unwrap_or(0.0);
                Ok(json!({"result": a + b}))
            });

        let result = t.execute(json!({"a": 2.0, "b": 3.0})).await.unwrap();
        assert_eq!(result["result"], 5.0);
        assert_eq!(t.to_function_schema()["function"]["name"], "add");
        assert!(!t.is_container());
    }

    #[test]
    fn registry_hides_tools_nested_under_an_unexpanded_container() {
        let mut registry = ToolRegistry::new();
        registry.register(noop_tool("always_visible"));
        registry.register(tool("toolbox", "A bundle of tools").container(
            vec!["hidden_a".into(), "hidden_b".into()],
            "expanded toolbox",
        ));
        registry.register(noop_tool("hidden_a"));
        registry.register(noop_tool("hidden_b"));

        let none_expanded = HashSet::new();
        let visible: HashSet<&str> = registry
            .snapshot_visible(&none_expanded)
            .into_iter()
            .map(Tool::name)
            .collect();
        assert_eq!(visible, HashSet::from(["always_visible", "toolbox"]));

        let mut expanded = HashSet::new();
        expanded.insert("toolbox".to_string());
        let visible: HashSet<&str> = registry
            .snapshot_visible(&expanded)
            .into_iter()
            .map(Tool::name)
            .collect();
        assert_eq!(visible, HashSet::from(["always_visible", "hidden_a", "hidden_b"]));
    }

    #[test]
    fn expansion_reports_system_prompt_only_for_skills() {
        let mut registry = ToolRegistry::new();
        registry.register(tool("container_tool", "c").container(vec!["x".into()], "opened"));
        registry.register(tool("skill_tool", "s").skill(
            vec!["y".into()],
            "opened skill",
            "You can now use tool y.",
        ));

        let container_expansion = registry.expansion("container_tool").unwrap();
        assert!(container_expansion.system_prompt_text.is_none());

        let skill_expansion = registry.expansion("skill_tool").unwrap();
        assert_eq!(
            skill_expansion.system_prompt_text.as_deref(),
            Some("You can now use tool y.")
        );
    }
}
