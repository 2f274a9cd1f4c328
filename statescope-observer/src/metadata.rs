//! Parsing of the metadata blob embedded in instrumented elements.
//!
//! ```json
//! {
//!   "id": "comp-1",
//!   "name": "Counter",
//!   "fingerprint": "a1b2",
//!   "data": {"count": 0, "double": 0, "token": "x"},
//!   "computed": ["double"],
//!   "protected": ["token"],
//!   "methods": [{"name": "increment", "params": []}],
//!   "renderTime": 1.4
//! }
//! ```

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::Value;
use statescope_types::{current_timestamp_ms, Component, Method, Property, Visibility};

use crate::host::HostElement;
use crate::ObserverError;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMetadata {
    #[serde(default)]
    id: Option<String>,
    name: String,
    #[serde(default)]
    fingerprint: String,
    #[serde(default)]
    data: BTreeMap<String, Value>,
    #[serde(default)]
    computed: Vec<String>,
    #[serde(default)]
    protected: Vec<String>,
    #[serde(default)]
    methods: Vec<Method>,
    #[serde(default)]
    render_time: Option<f64>,
}

/// Parse an element's metadata into a component record.
///
/// The component id defaults to the element key. Relationship fields are
/// left empty; the observer fills them from containment.
pub fn parse_metadata(element: &HostElement) -> Result<Component, ObserverError> {
    let raw: RawMetadata =
        serde_json::from_str(&element.metadata).map_err(|e| ObserverError::Metadata {
            key: element.key.clone(),
            reason: e.to_string(),
        })?;

    if raw.name.trim().is_empty() {
        return Err(ObserverError::Metadata {
            key: element.key.clone(),
            reason: "empty component name".to_string(),
        });
    }

    let properties = raw
        .data
        .into_iter()
        .map(|(name, value)| {
            let mut property = Property::new(value);
            property.computed = raw.computed.contains(&name);
            if raw.protected.contains(&name) {
                property.visibility = Visibility::Protected;
            }
            (name, property)
        })
        .collect();

    Ok(Component {
        id: raw.id.unwrap_or_else(|| element.key.clone()),
        name: raw.name,
        fingerprint: raw.fingerprint,
        properties,
        methods: raw.methods,
        ancestor_ids: Vec::new(),
        children_ids: Vec::new(),
        mount_time: current_timestamp_ms(),
        render_time: raw.render_time,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn element(metadata: &str) -> HostElement {
        HostElement {
            key: "el-1".to_string(),
            parent: None,
            metadata: metadata.to_string(),
        }
    }

    #[test]
    fn parses_flags_and_methods() {
        let blob = json!({
            "id": "comp-1",
            "name": "Counter",
            "fingerprint": "f1",
            "data": {"count": 0, "double": 0, "token": "x"},
            "computed": ["double"],
            "protected": ["token"],
            "methods": [{"name": "increment", "params": ["by"]}]
        })
        .to_string();

        let component = parse_metadata(&element(&blob)).unwrap();
        assert_eq!(component.id, "comp-1");
        assert!(component.properties["count"].is_editable());
        assert!(component.properties["double"].computed);
        assert_eq!(component.properties["token"].visibility, Visibility::Protected);
        assert_eq!(component.method("increment").unwrap().params, vec!["by"]);
    }

    #[test]
    fn id_defaults_to_element_key() {
        let component = parse_metadata(&element(r#"{"name": "Anon"}"#)).unwrap();
        assert_eq!(component.id, "el-1");
        assert!(component.properties.is_empty());
    }

    #[test]
    fn malformed_blob_names_the_element() {
        let err = parse_metadata(&element("{not json")).unwrap_err();
        assert!(matches!(err, ObserverError::Metadata { ref key, .. } if key == "el-1"));

        let err = parse_metadata(&element(r#"{"name": "  "}"#)).unwrap_err();
        assert!(matches!(err, ObserverError::Metadata { .. }));
    }
}
