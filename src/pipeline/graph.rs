//! Pipeline description model.
//!
//! A [`PipelineGraph`] is pure data: module descriptors, the links between
//! them, and the designated source. It is parsed once from a JSON document
//! and consumed read-only by the loader and the deployment planners, which
//! build new graphs instead of editing this one.
//!
//! # Document shape
//!
//! ```json
//! {
//!   "source": "reader",
//!   "modules": {
//!     "reader": { "type": "TextFileReader", "path": "input.txt", "#host": "10.0.0.1" },
//!     "counter": { "type": "WordCounter", "cparams": ["x"] },
//!     "#disabled": { "type": "Stats" }
//!   },
//!   "links": [ { "from": "reader", "to": "counter", "channel": "default", "debug": false } ]
//! }
//! ```
//!
//! Module ids and keys starting with `#` are comments: disabled modules are
//! dropped, links touching them are dropped, and `#`-keys inside a module are
//! kept as annotations that never reach the module's options.

use crate::pipeline::error::{PipelineError, PipelineResult};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_CHANNEL: &str = "default";

/// Identity and configuration of one graph node.
#[derive(Debug, Clone, PartialEq)]
pub struct ModuleDescriptor {
    pub id: String,
    pub module_type: String,
    pub host: String,
    /// Passed once to the module right after creation.
    pub construction_params: Vec<String>,
    /// Applied through the module's options after construction.
    pub named_params: BTreeMap<String, String>,
    /// `#`-prefixed keys other than `#host` and `#flags`.
    pub annotations: BTreeMap<String, String>,
    /// Placement requirements. Parsed and carried, not acted upon yet.
    pub flags: Option<FlagBag>,
}

impl ModuleDescriptor {
    pub fn new(id: impl Into<String>, module_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            module_type: module_type.into(),
            host: DEFAULT_HOST.to_string(),
            construction_params: Vec::new(),
            named_params: BTreeMap::new(),
            annotations: BTreeMap::new(),
            flags: None,
        }
    }

    pub fn on_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.named_params.insert(key.into(), value.into());
        self
    }

    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    pub fn with_cparams<I, S>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.construction_params = params.into_iter().map(Into::into).collect();
        self
    }

    fn from_json(id: &str, value: &Value) -> PipelineResult<Self> {
        let fields = value.as_object().ok_or_else(|| {
            PipelineError::config(format!("module '{}' must be a JSON object", id))
        })?;
        let mut module = ModuleDescriptor::new(id, "");
        for (key, value) in fields {
            match key.as_str() {
                "type" => module.module_type = scalar_to_string(value),
                "cparams" => {
                    let params = value.as_array().ok_or_else(|| {
                        PipelineError::config(format!("module '{}': cparams must be an array", id))
                    })?;
                    module.construction_params = params.iter().map(scalar_to_string).collect();
                }
                "host" | "#host" => module.host = scalar_to_string(value),
                "#flags" => module.flags = Some(FlagBag::parse(&scalar_to_string(value))?),
                k if k.starts_with('#') => {
                    module.annotations.insert(k.to_string(), scalar_to_string(value));
                }
                k => {
                    module.named_params.insert(k.to_string(), scalar_to_string(value));
                }
            }
        }
        if module.module_type.is_empty() {
            return Err(PipelineError::config(format!(
                "invalid module type definition for '{}'",
                id
            )));
        }
        if module.host.is_empty() {
            module.host = DEFAULT_HOST.to_string();
        }
        Ok(module)
    }

    fn to_json(&self) -> Value {
        let mut fields = Map::new();
        fields.insert("type".into(), json!(self.module_type));
        fields.insert("#host".into(), json!(self.host));
        for (key, value) in self.named_params.iter().chain(self.annotations.iter()) {
            fields.insert(key.clone(), json!(value));
        }
        if let Some(flags) = &self.flags {
            fields.insert("#flags".into(), json!(flags.to_string()));
        }
        if !self.construction_params.is_empty() {
            fields.insert("cparams".into(), json!(self.construction_params));
        }
        Value::Object(fields)
    }
}

/// Directed edge `from -> to` over a named channel.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkDescriptor {
    pub from: String,
    pub to: String,
    pub channel: String,
    /// Log timing around every dispatch across this edge.
    pub debug: bool,
    /// Only consumed by the deployment planner.
    pub bandwidth: Option<String>,
}

impl LinkDescriptor {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            channel: DEFAULT_CHANNEL.to_string(),
            debug: false,
            bandwidth: None,
        }
    }

    pub fn on_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = channel.into();
        self
    }

    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    fn from_json(value: &Value) -> PipelineResult<Self> {
        let fields = value
            .as_object()
            .ok_or_else(|| PipelineError::config("link must be a JSON object"))?;
        let text = |key: &str| fields.get(key).map(scalar_to_string).unwrap_or_default();
        let debug = match fields.get("debug") {
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => s == "true",
            _ => false,
        };
        Ok(Self {
            from: text("from"),
            to: text("to"),
            channel: fields
                .get("channel")
                .map(scalar_to_string)
                .unwrap_or_else(|| DEFAULT_CHANNEL.to_string()),
            debug,
            bandwidth: fields
                .get("bandwidth")
                .map(scalar_to_string)
                .filter(|b| !b.is_empty()),
        })
    }

    fn to_json(&self) -> Value {
        json!({
            "from": self.from,
            "to": self.to,
            "channel": self.channel,
            "debug": self.debug,
            "bandwidth": self.bandwidth.clone().unwrap_or_default(),
        })
    }

    fn describe(&self) -> String {
        format!("{} -> {} on '{}'", self.from, self.to, self.channel)
    }
}

/// A whole pipeline: designated source, modules in declaration order, links.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineGraph {
    pub source: Option<String>,
    modules: Vec<ModuleDescriptor>,
    pub links: Vec<LinkDescriptor>,
}

impl PipelineGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json_str(text: &str) -> PipelineResult<Self> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| PipelineError::config(format!("malformed pipeline description: {}", e)))?;
        Self::from_json(&value)
    }

    pub fn from_file(path: impl AsRef<Path>) -> PipelineResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| PipelineError::config(format!("cannot read {:?}: {}", path, e)))?;
        Self::from_json_str(&text)
    }

    pub fn from_json(value: &Value) -> PipelineResult<Self> {
        let root = value
            .as_object()
            .ok_or_else(|| PipelineError::config("pipeline description must be a JSON object"))?;
        let mut graph = PipelineGraph::new();
        graph.source = root
            .get("source")
            .map(scalar_to_string)
            .filter(|s| !s.is_empty());

        let modules = root
            .get("modules")
            .and_then(Value::as_object)
            .ok_or_else(|| PipelineError::config("pipeline description has no 'modules' object"))?;
        for (id, body) in modules {
            if id.starts_with('#') {
                continue;
            }
            graph.add_module(ModuleDescriptor::from_json(id, body)?)?;
        }

        if let Some(links) = root.get("links") {
            let links = links
                .as_array()
                .ok_or_else(|| PipelineError::config("'links' must be an array"))?;
            for body in links {
                let link = LinkDescriptor::from_json(body)?;
                if link.from.starts_with('#') || link.to.starts_with('#') {
                    continue;
                }
                if link.channel.is_empty() {
                    return Err(PipelineError::config(format!(
                        "invalid link definition {}: channel cannot be empty",
                        link.describe()
                    )));
                }
                graph.links.push(link);
            }
        }
        Ok(graph)
    }

    /// Render back into the description format.
    pub fn to_json(&self) -> Value {
        let modules: Map<String, Value> = self
            .modules
            .iter()
            .map(|m| (m.id.clone(), m.to_json()))
            .collect();
        let links: Vec<Value> = self.links.iter().map(LinkDescriptor::to_json).collect();
        json!({
            "source": self.source.clone().unwrap_or_default(),
            "modules": modules,
            "links": links,
        })
    }

    pub fn to_json_pretty(&self) -> PipelineResult<String> {
        Ok(serde_json::to_string_pretty(&self.to_json())?)
    }

    pub fn add_module(&mut self, module: ModuleDescriptor) -> PipelineResult<()> {
        if self.contains(&module.id) {
            return Err(PipelineError::config(format!(
                "duplicate module id '{}'",
                module.id
            )));
        }
        self.modules.push(module);
        Ok(())
    }

    pub fn add_link(&mut self, link: LinkDescriptor) {
        self.links.push(link);
    }

    pub fn modules(&self) -> &[ModuleDescriptor] {
        &self.modules
    }

    pub fn modules_mut(&mut self) -> impl Iterator<Item = &mut ModuleDescriptor> {
        self.modules.iter_mut()
    }

    pub fn module(&self, id: &str) -> Option<&ModuleDescriptor> {
        self.modules.iter().find(|m| m.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.module(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Explicit source if set, otherwise the first declared module.
    pub fn effective_source(&self) -> Option<&str> {
        self.source
            .as_deref()
            .or_else(|| self.modules.first().map(|m| m.id.as_str()))
    }

    /// Every host that carries at least one module.
    pub fn hosts(&self) -> BTreeSet<String> {
        self.modules.iter().map(|m| m.host.clone()).collect()
    }

    /// Check that every link names known modules and a non-empty channel,
    /// and that an explicit source exists.
    pub fn validate(&self) -> PipelineResult<()> {
        let ids: HashSet<&str> = self.modules.iter().map(|m| m.id.as_str()).collect();
        if let Some(source) = &self.source {
            if !ids.contains(source.as_str()) {
                return Err(PipelineError::config(format!(
                    "source module '{}' is not defined",
                    source
                )));
            }
        }
        for link in &self.links {
            if link.from.is_empty() || !ids.contains(link.from.as_str()) {
                return Err(PipelineError::config(format!(
                    "invalid link definition {}: unknown source module '{}'",
                    link.describe(),
                    link.from
                )));
            }
            if link.to.is_empty() || !ids.contains(link.to.as_str()) {
                return Err(PipelineError::config(format!(
                    "invalid link definition {}: unknown destination module '{}'",
                    link.describe(),
                    link.to
                )));
            }
            if link.channel.is_empty() {
                return Err(PipelineError::config(format!(
                    "invalid link definition {}: channel cannot be empty",
                    link.describe()
                )));
            }
        }
        Ok(())
    }
}

/// Hosts named by a description, without validating its links.
pub fn extract_hosts(text: &str) -> PipelineResult<BTreeSet<String>> {
    Ok(PipelineGraph::from_json_str(text)?.hosts())
}

fn scalar_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Placement requirements attached to a module through `#flags`.
///
/// Syntax is a comma separated list of `name` (required), `!name`
/// (forbidden) and `name<n`, `name>n`, `name=n` numeric comparisons.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlagBag {
    pub required: Vec<String>,
    pub forbidden: Vec<String>,
    pub less_than: BTreeMap<String, f64>,
    pub greater_than: BTreeMap<String, f64>,
    pub equal_to: BTreeMap<String, f64>,
}

impl FlagBag {
    pub fn parse(text: &str) -> PipelineResult<Self> {
        let mut bag = FlagBag::default();
        for token in text.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            if let Some(name) = token.strip_prefix('!') {
                bag.forbidden.push(flag_label(name, token)?);
                continue;
            }
            match token.find(['<', '>', '=']) {
                Some(pos) => {
                    let name = flag_label(&token[..pos], token)?;
                    let raw = token[pos + 1..].trim();
                    let value: f64 = raw.parse().map_err(|_| {
                        PipelineError::config(format!(
                            "expecting numerical value in flag declaration '{}'",
                            token
                        ))
                    })?;
                    let table = match token.as_bytes()[pos] {
                        b'<' => &mut bag.less_than,
                        b'>' => &mut bag.greater_than,
                        _ => &mut bag.equal_to,
                    };
                    table.insert(name, value);
                }
                None => bag.required.push(flag_label(token, token)?),
            }
        }
        Ok(bag)
    }

    pub fn is_empty(&self) -> bool {
        self.required.is_empty()
            && self.forbidden.is_empty()
            && self.less_than.is_empty()
            && self.greater_than.is_empty()
            && self.equal_to.is_empty()
    }
}

fn flag_label(name: &str, token: &str) -> PipelineResult<String> {
    let name = name.trim();
    if name.is_empty() || name.contains(['!', '<', '>', '=']) {
        return Err(PipelineError::config(format!(
            "malformed flag declaration '{}'",
            token
        )));
    }
    Ok(name.to_string())
}

impl std::fmt::Display for FlagBag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut parts: Vec<String> = self.required.clone();
        parts.extend(self.forbidden.iter().map(|n| format!("!{}", n)));
        parts.extend(self.less_than.iter().map(|(n, v)| format!("{}<{}", n, v)));
        parts.extend(self.greater_than.iter().map(|(n, v)| format!("{}>{}", n, v)));
        parts.extend(self.equal_to.iter().map(|(n, v)| format!("{}={}", n, v)));
        write!(f, "{}", parts.join(","))
    }
}
