//! Typed view over a parsed JSON configuration tree.
//!
//! A [`ConfigView`] wraps a JSON node together with a substitution
//! context. Field lookup by name `f` checks, in order: `f`, `[f]`,
//! `[[f]]` and `@f`. The bracketed forms request template substitution
//! on the stored string (`[f]` runs the `${}`/`$[]` passes, `[[f]]`
//! additionally evaluates the result as a constant expression); the `@f`
//! form is an inline include pointing at another JSON document. Absence
//! is explicit: lookups return `Option`, and substitution failures
//! surface as errors instead of silently degrading.
//!
//! # Examples
//!
//! ```rust
//! use taskforge::config::ConfigView;
//! use taskforge::template::prepare_context;
//!
//! let view = ConfigView::from_json_str(
//!     r#"{ "name": "demo", "[data_dir]": "/var/${env}/data" }"#,
//!     prepare_context(&["env=prod".to_string()]),
//! ).unwrap();
//!
//! assert_eq!(view.get_str("name").unwrap(), Some("demo".to_string()));
//! assert_eq!(view.get_str("data_dir").unwrap(), Some("/var/prod/data".to_string()));
//! assert!(view.get("missing").unwrap().is_none());
//! ```

use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::error::{Error, Result};
use crate::template::{self, Evaluate, TemplateContext};

/// A view over one node of a configuration tree.
#[derive(Debug, Clone)]
pub struct ConfigView {
    node: Arc<Value>,
    context: Arc<TemplateContext>,
    /// Substitution level applied to elements retrieved by index or
    /// iteration. Set when this view was reached through a bracketed key.
    evaluate: Evaluate,
}

/// The result of a field lookup.
#[derive(Debug, Clone)]
pub enum ConfigValue {
    /// A nested object or array.
    View(ConfigView),
    /// A scalar, substituted according to the key form it was reached by.
    Value(Value),
    /// An unresolved `@field` include.
    Include(IncludeSpec),
}

impl ConfigValue {
    /// The nested view, if this is an object or array.
    pub fn into_view(self) -> Option<ConfigView> {
        match self {
            ConfigValue::View(view) => Some(view),
            _ => None,
        }
    }

    /// The scalar value, if this is one.
    pub fn into_value(self) -> Option<Value> {
        match self {
            ConfigValue::Value(value) => Some(value),
            _ => None,
        }
    }
}

/// An `@field` include: `{ "url": ..., "root": ... }`.
#[derive(Debug, Clone)]
pub struct IncludeSpec {
    /// Document location: a filesystem path, `file://` or `http(s)://` URL.
    pub url: String,
    /// Optional dotted path to navigate to inside the loaded document.
    pub root: Option<String>,
}

impl IncludeSpec {
    fn parse(value: &Value) -> Result<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| Error::config("include must be an object with 'url'"))?;
        let url = obj
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::config("include is missing a string 'url'"))?
            .to_string();
        let root = obj.get("root").and_then(Value::as_str).map(String::from);
        Ok(Self { url, root })
    }

    /// Load the referenced document and navigate to `root`.
    pub async fn load(&self, context: TemplateContext) -> Result<ConfigView> {
        ConfigView::load(&self.url, self.root.as_deref(), context).await
    }
}

impl ConfigView {
    /// Wrap an already-parsed JSON value.
    pub fn new(value: Value, context: TemplateContext) -> Self {
        Self {
            node: Arc::new(value),
            context: Arc::new(context),
            evaluate: Evaluate::None,
        }
    }

    /// Parse a JSON document from text.
    pub fn from_json_str(text: &str, context: TemplateContext) -> Result<Self> {
        let value: Value = serde_json::from_str(text)?;
        Ok(Self::new(value, context))
    }

    /// Load a JSON document from a filesystem path, `file://` URL or
    /// `http(s)://` URL, optionally navigating to a dotted `root` path.
    pub async fn load(url: &str, root: Option<&str>, context: TemplateContext) -> Result<Self> {
        debug!(url, ?root, "loading config document");
        let text = if url.starts_with("http://") || url.starts_with("https://") {
            let response = reqwest::get(url)
                .await
                .and_then(reqwest::Response::error_for_status)
                .map_err(|e| Error::config(format!("cannot load '{url}': {e}")))?;
            response
                .text()
                .await
                .map_err(|e| Error::config(format!("cannot read '{url}': {e}")))?
        } else {
            let path = url.strip_prefix("file://").unwrap_or(url);
            tokio::fs::read_to_string(path)
                .await
                .map_err(|e| Error::config(format!("cannot load '{path}': {e}")))?
        };

        let view = Self::from_json_str(&text, context)
            .map_err(|e| Error::config(format!("invalid JSON in '{url}': {e}")))?;
        match root {
            Some(path) => view.navigate(path),
            None => Ok(view),
        }
    }

    /// Rebind the substitution context. Views handed out before the
    /// rebind keep the old context.
    pub fn bind_context(&mut self, context: TemplateContext) {
        self.context = Arc::new(context);
    }

    /// Look up a field by name, trying `name`, `[name]`, `[[name]]` and
    /// `@name` in that order.
    pub fn get(&self, name: &str) -> Result<Option<ConfigValue>> {
        let Some(map) = self.node.as_object() else {
            return Ok(None);
        };
        if let Some(value) = map.get(name) {
            return self.wrap(value, Evaluate::None).map(Some);
        }
        if let Some(value) = map.get(&format!("[{name}]")) {
            return self.wrap(value, Evaluate::Simple).map(Some);
        }
        if let Some(value) = map.get(&format!("[[{name}]]")) {
            return self.wrap(value, Evaluate::Full).map(Some);
        }
        if let Some(value) = map.get(&format!("@{name}")) {
            return Ok(Some(ConfigValue::Include(IncludeSpec::parse(value)?)));
        }
        Ok(None)
    }

    /// Look up a nested object or array.
    pub fn get_view(&self, name: &str) -> Result<Option<ConfigView>> {
        Ok(self.get(name)?.and_then(ConfigValue::into_view))
    }

    /// Look up a scalar and render it as a string.
    pub fn get_str(&self, name: &str) -> Result<Option<String>> {
        match self.get(name)? {
            Some(ConfigValue::Value(Value::Null)) | None => Ok(None),
            Some(ConfigValue::Value(value)) => Ok(Some(template::stringify(&value))),
            Some(other) => Err(Error::config(format!(
                "field '{name}' is not a scalar: {other:?}"
            ))),
        }
    }

    /// Look up a boolean. String renderings of booleans (as produced by
    /// substitution) are accepted.
    pub fn get_bool(&self, name: &str) -> Result<Option<bool>> {
        match self.get(name)? {
            Some(ConfigValue::Value(Value::Bool(b))) => Ok(Some(b)),
            Some(ConfigValue::Value(Value::String(s))) => {
                match s.to_ascii_lowercase().as_str() {
                    "true" | "1" => Ok(Some(true)),
                    "false" | "0" => Ok(Some(false)),
                    _ => Err(Error::config(format!(
                        "field '{name}' is not a boolean: '{s}'"
                    ))),
                }
            },
            Some(ConfigValue::Value(Value::Null)) | None => Ok(None),
            Some(other) => Err(Error::config(format!(
                "field '{name}' is not a boolean: {other:?}"
            ))),
        }
    }

    /// Look up an integer.
    pub fn get_i64(&self, name: &str) -> Result<Option<i64>> {
        match self.get(name)? {
            Some(ConfigValue::Value(Value::Number(n))) => n.as_i64().map(Some).ok_or_else(|| {
                Error::config(format!("field '{name}' is not an integer: {n}"))
            }),
            Some(ConfigValue::Value(Value::String(s))) => s
                .parse::<i64>()
                .map(Some)
                .map_err(|_| Error::config(format!("field '{name}' is not an integer: '{s}'"))),
            Some(ConfigValue::Value(Value::Null)) | None => Ok(None),
            Some(other) => Err(Error::config(format!(
                "field '{name}' is not an integer: {other:?}"
            ))),
        }
    }

    /// Number of elements (array) or fields (object).
    pub fn len(&self) -> usize {
        match self.node.as_ref() {
            Value::Array(items) => items.len(),
            Value::Object(map) => map.len(),
            _ => 0,
        }
    }

    /// Whether the node has no elements or fields.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Index access into an array node, substituting string elements at
    /// this view's evaluation level.
    pub fn index(&self, i: usize) -> Result<Option<ConfigValue>> {
        match self.node.as_ref() {
            Value::Array(items) => match items.get(i) {
                Some(value) => self.wrap(value, self.evaluate).map(Some),
                None => Ok(None),
            },
            _ => Ok(None),
        }
    }

    /// Iterate the elements of an array node.
    pub fn iter(&self) -> impl Iterator<Item = Result<ConfigValue>> + '_ {
        let items: &[Value] = match self.node.as_ref() {
            Value::Array(items) => items,
            _ => &[],
        };
        items.iter().map(move |value| self.wrap(value, self.evaluate))
    }

    /// The raw JSON node behind this view.
    pub fn raw(&self) -> &Value {
        &self.node
    }

    /// Clone the raw JSON node.
    pub fn to_object(&self) -> Value {
        self.node.as_ref().clone()
    }

    /// Resolve the whole subtree into plain JSON: bracket markers are
    /// stripped from keys and their values substituted at the requested
    /// level. `@include` fields are left untouched.
    pub fn resolved_object(&self) -> Result<Value> {
        self.resolve_node(&self.node, self.evaluate)
    }

    fn resolve_node(&self, node: &Value, evaluate: Evaluate) -> Result<Value> {
        match node {
            Value::Object(map) => {
                let mut out = serde_json::Map::new();
                for (key, value) in map {
                    let (name, level) = split_key(key);
                    out.insert(name.to_string(), self.resolve_node(value, level)?);
                }
                Ok(Value::Object(out))
            },
            Value::Array(items) => items
                .iter()
                .map(|value| self.resolve_node(value, evaluate))
                .collect::<Result<Vec<_>>>()
                .map(Value::Array),
            Value::String(s) if evaluate != Evaluate::None => {
                template::expand_value(s, &self.context, evaluate)
            },
            other => Ok(other.clone()),
        }
    }

    /// Descend a dotted path of plain object fields.
    pub fn navigate(&self, path: &str) -> Result<ConfigView> {
        let mut view = self.clone();
        for segment in path.split('.') {
            view = view
                .get_view(segment)?
                .ok_or_else(|| Error::config(format!("path segment '{segment}' not found")))?;
        }
        Ok(view)
    }

    fn wrap(&self, value: &Value, evaluate: Evaluate) -> Result<ConfigValue> {
        match value {
            Value::Object(_) | Value::Array(_) => Ok(ConfigValue::View(ConfigView {
                node: Arc::new(value.clone()),
                context: self.context.clone(),
                evaluate,
            })),
            Value::String(s) if evaluate != Evaluate::None => {
                template::expand_value(s, &self.context, evaluate).map(ConfigValue::Value)
            },
            other => Ok(ConfigValue::Value(other.clone())),
        }
    }
}

fn split_key(key: &str) -> (&str, Evaluate) {
    if key.len() > 4 && key.starts_with("[[") && key.ends_with("]]") {
        (&key[2..key.len() - 2], Evaluate::Full)
    } else if key.len() > 2 && key.starts_with('[') && key.ends_with(']') {
        (&key[1..key.len() - 1], Evaluate::Simple)
    } else {
        (key, Evaluate::None)
    }
}
