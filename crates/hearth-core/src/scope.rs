//! Layered property scopes.
//!
//! A scope is a stack of labelled layers. Lookups search from the innermost
//! layer outward, so command properties shadow recipe properties which shadow
//! the global ones.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::LazyLock;

static REFERENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_.\-]*)\}").expect("valid regex"));

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Property {
    pub name: String,
    pub value: String,
    /// Export the property to the environment of spawned processes.
    #[serde(default)]
    pub add_to_environment: bool,
}

impl Property {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            add_to_environment: false,
        }
    }

    pub fn env(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            add_to_environment: true,
            ..Self::new(name, value)
        }
    }
}

#[derive(Debug, Clone)]
struct Layer {
    label: String,
    properties: BTreeMap<String, Property>,
}

#[derive(Debug, Clone)]
pub struct PropertyScope {
    layers: Vec<Layer>,
}

impl Default for PropertyScope {
    fn default() -> Self {
        Self::new()
    }
}

impl PropertyScope {
    /// Scope with a single `global` layer.
    pub fn new() -> Self {
        Self {
            layers: vec![Layer {
                label: "global".to_string(),
                properties: BTreeMap::new(),
            }],
        }
    }

    pub fn depth(&self) -> usize {
        self.layers.len()
    }

    pub fn push(&mut self, label: impl Into<String>) {
        self.layers.push(Layer {
            label: label.into(),
            properties: BTreeMap::new(),
        });
    }

    /// Pop the innermost layer. The outermost layer is never removed.
    pub fn pop(&mut self) {
        if self.layers.len() > 1 {
            self.layers.pop();
        }
    }

    /// Drop every layer above the innermost one with the given label.
    /// Returns false if no layer carries the label.
    pub fn truncate_to(&mut self, label: &str) -> bool {
        match self.layers.iter().rposition(|l| l.label == label) {
            Some(index) => {
                self.layers.truncate(index + 1);
                true
            }
            None => false,
        }
    }

    /// Add to the innermost layer.
    pub fn add(&mut self, property: Property) {
        if let Some(layer) = self.layers.last_mut() {
            layer.properties.insert(property.name.clone(), property);
        }
    }

    pub fn add_value(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.add(Property::new(name, value));
    }

    /// Add to the innermost layer with the given label.
    pub fn add_to(&mut self, label: &str, property: Property) -> bool {
        match self.layers.iter_mut().rev().find(|l| l.label == label) {
            Some(layer) => {
                layer.properties.insert(property.name.clone(), property);
                true
            }
            None => false,
        }
    }

    pub fn get(&self, name: &str) -> Option<&Property> {
        self.layers
            .iter()
            .rev()
            .find_map(|layer| layer.properties.get(name))
    }

    pub fn value(&self, name: &str) -> Option<&str> {
        self.get(name).map(|p| p.value.as_str())
    }

    /// All visible properties, shadowed ones resolved.
    pub fn properties(&self) -> BTreeMap<String, &Property> {
        let mut visible = BTreeMap::new();
        for layer in &self.layers {
            for (name, property) in &layer.properties {
                visible.insert(name.clone(), property);
            }
        }
        visible
    }

    /// Properties marked for export, with values expanded.
    pub fn environment(&self) -> BTreeMap<String, String> {
        self.properties()
            .into_iter()
            .filter(|(_, p)| p.add_to_environment)
            .map(|(name, p)| (name, self.expand(&p.value)))
            .collect()
    }

    /// Replace `${name}` references with property values. Unknown references
    /// are left as written. Expansion is a single pass.
    pub fn expand(&self, input: &str) -> String {
        REFERENCE
            .replace_all(input, |caps: &regex::Captures<'_>| match self.value(&caps[1]) {
                Some(value) => value.to_string(),
                None => caps[0].to_string(),
            })
            .into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inner_layers_shadow_outer() {
        let mut scope = PropertyScope::new();
        scope.add_value("compiler", "gcc");
        scope.push("recipe");
        scope.add_value("compiler", "clang");
        scope.push("command");

        assert_eq!(scope.value("compiler"), Some("clang"));

        scope.add_value("compiler", "rustc");
        assert_eq!(scope.value("compiler"), Some("rustc"));

        scope.pop();
        assert_eq!(scope.value("compiler"), Some("clang"));
        scope.pop();
        assert_eq!(scope.value("compiler"), Some("gcc"));
    }

    #[test]
    fn test_outermost_layer_survives_pop() {
        let mut scope = PropertyScope::new();
        scope.add_value("a", "1");
        scope.pop();
        scope.pop();
        assert_eq!(scope.depth(), 1);
        assert_eq!(scope.value("a"), Some("1"));
    }

    #[test]
    fn test_truncate_to_label() {
        let mut scope = PropertyScope::new();
        scope.push("recipe");
        scope.push("command");
        scope.push("nested");

        assert!(scope.truncate_to("recipe"));
        assert_eq!(scope.depth(), 2);
        assert!(!scope.truncate_to("missing"));
    }

    #[test]
    fn test_add_to_labelled_layer() {
        let mut scope = PropertyScope::new();
        scope.push("recipe");
        scope.push("command");
        assert!(scope.add_to("recipe", Property::new("shared", "yes")));
        scope.pop();
        assert_eq!(scope.value("shared"), Some("yes"));
    }

    #[test]
    fn test_expand_references() {
        let mut scope = PropertyScope::new();
        scope.add_value("base.dir", "/work/base");
        scope.add_value("target", "all");

        assert_eq!(
            scope.expand("make -C ${base.dir} ${target} ${missing}"),
            "make -C /work/base all ${missing}"
        );
    }

    #[test]
    fn test_environment_only_exports_marked_properties() {
        let mut scope = PropertyScope::new();
        scope.add(Property::env("HOME_DIR", "${base.dir}/home"));
        scope.add_value("base.dir", "/work");
        scope.add_value("secret", "hidden");

        let env = scope.environment();
        assert_eq!(env.len(), 1);
        assert_eq!(env.get("HOME_DIR").map(String::as_str), Some("/work/home"));
    }
}
