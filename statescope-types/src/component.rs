//! Component records observed in the instrumented page.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Identifier of a component, unique within one observation session.
pub type ComponentId = String;

/// A component as seen by the inspector.
///
/// `ancestor_ids` and `children_ids` are weak links: they name other
/// components by id and are resolved against an index when a tree view is
/// needed. A component never owns its relatives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Component {
    /// Session-unique identifier.
    pub id: ComponentId,

    /// Human readable component name (e.g. `counter`, `user-profile`).
    pub name: String,

    /// Opaque version tag. Changes whenever the host re-renders the
    /// component's structure, so stale edits can be detected.
    #[serde(default)]
    pub fingerprint: String,

    /// Public and protected properties, keyed by name.
    #[serde(default)]
    pub properties: BTreeMap<String, Property>,

    /// Invokable methods.
    #[serde(default)]
    pub methods: Vec<Method>,

    /// Direct parent component ids (usually zero or one).
    #[serde(default)]
    pub ancestor_ids: Vec<ComponentId>,

    /// Direct child component ids.
    #[serde(default)]
    pub children_ids: Vec<ComponentId>,

    /// Unix timestamp in milliseconds when the component was first seen.
    #[serde(default)]
    pub mount_time: u64,

    /// Duration of the last render in milliseconds, if the host reported it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub render_time: Option<f64>,
}

impl Component {
    /// Create a builder for constructing components.
    pub fn builder(id: impl Into<ComponentId>, name: impl Into<String>) -> ComponentBuilder {
        ComponentBuilder::new(id, name)
    }

    /// Value copy of every property value, keyed by property name.
    ///
    /// This is the state captured by snapshots and fed into the diff.
    pub fn state(&self) -> BTreeMap<String, Value> {
        self.properties
            .iter()
            .map(|(name, prop)| (name.clone(), prop.value.clone()))
            .collect()
    }

    /// Check whether the component has no known parent.
    pub fn is_root(&self) -> bool {
        self.ancestor_ids.is_empty()
    }

    /// Look up a method by name.
    pub fn method(&self, name: &str) -> Option<&Method> {
        self.methods.iter().find(|m| m.name == name)
    }
}

/// A single component property.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Property {
    pub value: Value,

    /// Declared runtime type of the value.
    #[serde(rename = "type")]
    pub kind: PropertyType,

    #[serde(default)]
    pub visibility: Visibility,

    /// Derived properties are read-only.
    #[serde(default)]
    pub computed: bool,
}

impl Property {
    /// Create a public, non-computed property whose type is inferred from the value.
    pub fn new(value: Value) -> Self {
        Self {
            kind: PropertyType::of(&value),
            value,
            visibility: Visibility::Public,
            computed: false,
        }
    }

    /// A property may be edited remotely iff it is public and not computed.
    pub fn is_editable(&self) -> bool {
        !self.computed && self.visibility == Visibility::Public
    }
}

/// Runtime type of a property value, mirroring the JSON value kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PropertyType {
    Null,
    Boolean,
    Number,
    String,
    Array,
    Object,
}

impl PropertyType {
    /// Infer the type of a value.
    pub fn of(value: &Value) -> Self {
        match value {
            Value::Null => PropertyType::Null,
            Value::Bool(_) => PropertyType::Boolean,
            Value::Number(_) => PropertyType::Number,
            Value::String(_) => PropertyType::String,
            Value::Array(_) => PropertyType::Array,
            Value::Object(_) => PropertyType::Object,
        }
    }

    /// Check whether a value may be stored in a property of this type.
    ///
    /// A property declared as `null` has no known type yet and accepts
    /// anything; otherwise the value kind must match exactly.
    pub fn accepts(&self, value: &Value) -> bool {
        *self == PropertyType::Null || PropertyType::of(value) == *self
    }

    /// Lowercase name as used on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            PropertyType::Null => "null",
            PropertyType::Boolean => "boolean",
            PropertyType::Number => "number",
            PropertyType::String => "string",
            PropertyType::Array => "array",
            PropertyType::Object => "object",
        }
    }
}

/// Property visibility as declared by the host component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    #[default]
    Public,
    Protected,
}

/// An invokable component method.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Method {
    pub name: String,
    #[serde(default)]
    pub params: Vec<String>,
}

// ============================================================================
// Builders
// ============================================================================

/// Builder for `Component`.
#[derive(Debug)]
pub struct ComponentBuilder {
    component: Component,
}

impl ComponentBuilder {
    /// Create a new builder.
    pub fn new(id: impl Into<ComponentId>, name: impl Into<String>) -> Self {
        Self {
            component: Component {
                id: id.into(),
                name: name.into(),
                fingerprint: String::new(),
                properties: BTreeMap::new(),
                methods: Vec::new(),
                ancestor_ids: Vec::new(),
                children_ids: Vec::new(),
                mount_time: 0,
                render_time: None,
            },
        }
    }

    /// Set the fingerprint.
    pub fn fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.component.fingerprint = fingerprint.into();
        self
    }

    /// Add a public, editable property with an inferred type.
    pub fn property(mut self, name: impl Into<String>, value: Value) -> Self {
        self.component
            .properties
            .insert(name.into(), Property::new(value));
        self
    }

    /// Add a property customized through a closure.
    pub fn property_with<F>(mut self, name: impl Into<String>, value: Value, f: F) -> Self
    where
        F: FnOnce(PropertyBuilder) -> PropertyBuilder,
    {
        let prop = f(PropertyBuilder::new(value)).build();
        self.component.properties.insert(name.into(), prop);
        self
    }

    /// Add a method.
    pub fn method(mut self, name: impl Into<String>, params: &[&str]) -> Self {
        self.component.methods.push(Method {
            name: name.into(),
            params: params.iter().map(|p| p.to_string()).collect(),
        });
        self
    }

    /// Add a direct parent id.
    pub fn ancestor(mut self, id: impl Into<ComponentId>) -> Self {
        self.component.ancestor_ids.push(id.into());
        self
    }

    /// Add a direct child id.
    pub fn child(mut self, id: impl Into<ComponentId>) -> Self {
        self.component.children_ids.push(id.into());
        self
    }

    /// Set the mount time (milliseconds since Unix epoch).
    pub fn mount_time(mut self, ms: u64) -> Self {
        self.component.mount_time = ms;
        self
    }

    /// Set the last render duration in milliseconds.
    pub fn render_time(mut self, ms: f64) -> Self {
        self.component.render_time = Some(ms);
        self
    }

    /// Build the component.
    pub fn build(self) -> Component {
        self.component
    }
}

/// Builder for `Property`.
#[derive(Debug)]
pub struct PropertyBuilder {
    property: Property,
}

impl PropertyBuilder {
    /// Create a new builder with an inferred type.
    pub fn new(value: Value) -> Self {
        Self {
            property: Property::new(value),
        }
    }

    /// Override the declared type.
    pub fn kind(mut self, kind: PropertyType) -> Self {
        self.property.kind = kind;
        self
    }

    /// Set the visibility.
    pub fn visibility(mut self, visibility: Visibility) -> Self {
        self.property.visibility = visibility;
        self
    }

    /// Mark the property as computed.
    pub fn computed(mut self, computed: bool) -> Self {
        self.property.computed = computed;
        self
    }

    /// Build the property.
    pub fn build(self) -> Property {
        self.property
    }
}
