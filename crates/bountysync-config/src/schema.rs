//! Schema export for the configuration model.
//!
//! The JSON Schema is derived from the same types the loader deserializes
//! into, so the schema can never drift from the accepted documents. The
//! text and markdown renderings are flattened walks of that schema, meant
//! for `--help`-style consumption.

use crate::RootConfiguration;
use schemars::schema::{InstanceType, RootSchema, Schema, SchemaObject, SingleOrVec};
use schemars::schema_for;

/// Derive the JSON Schema of the whole configuration tree.
pub fn config_schema() -> RootSchema {
    schema_for!(RootConfiguration)
}

/// The schema as pretty-printed JSON Schema.
pub fn schema_as_json() -> String {
    serde_json::to_string_pretty(&config_schema()).unwrap_or_else(|_| "{}".to_string())
}

/// The schema as a markdown document, one section per type.
pub fn schema_as_markdown() -> String {
    let schema = config_schema();
    let mut out = String::new();
    out.push_str("# Configuration schema\n");
    render_object_markdown(&mut out, "RootConfiguration", &schema.schema);
    let mut names: Vec<&String> = schema.definitions.keys().collect();
    names.sort();
    for name in names {
        if let Schema::Object(object) = &schema.definitions[name] {
            render_object_markdown(&mut out, name, object);
        }
    }
    out
}

/// The schema as indented plain text.
pub fn schema_as_text() -> String {
    let schema = config_schema();
    let mut out = String::new();
    render_object_text(&mut out, "RootConfiguration", &schema.schema);
    let mut names: Vec<&String> = schema.definitions.keys().collect();
    names.sort();
    for name in names {
        if let Schema::Object(object) = &schema.definitions[name] {
            render_object_text(&mut out, name, object);
        }
    }
    out
}

fn render_object_markdown(out: &mut String, name: &str, object: &SchemaObject) {
    let properties = match &object.object {
        Some(validation) if !validation.properties.is_empty() => &validation.properties,
        _ => return,
    };
    out.push_str(&format!("\n## {name}\n\n"));
    if let Some(description) = description_of(object) {
        out.push_str(&format!("{description}\n\n"));
    }
    out.push_str("| Property | Type | Required | Description |\n");
    out.push_str("|----------|------|----------|-------------|\n");
    let required = required_of(object);
    for (property, schema) in properties {
        let (type_name, description) = summarize(schema);
        let required = if required.contains(&property.as_str()) {
            "yes"
        } else {
            "no"
        };
        out.push_str(&format!(
            "| `{property}` | {type_name} | {required} | {description} |\n"
        ));
    }
}

fn render_object_text(out: &mut String, name: &str, object: &SchemaObject) {
    let properties = match &object.object {
        Some(validation) if !validation.properties.is_empty() => &validation.properties,
        _ => return,
    };
    out.push_str(&format!("{name}:\n"));
    let required = required_of(object);
    for (property, schema) in properties {
        let (type_name, description) = summarize(schema);
        let marker = if required.contains(&property.as_str()) {
            " (required)"
        } else {
            ""
        };
        if description.is_empty() {
            out.push_str(&format!("  {property}: {type_name}{marker}\n"));
        } else {
            out.push_str(&format!("  {property}: {type_name}{marker} - {description}\n"));
        }
    }
    out.push('\n');
}

fn required_of(object: &SchemaObject) -> Vec<&str> {
    object
        .object
        .as_ref()
        .map(|validation| validation.required.iter().map(String::as_str).collect())
        .unwrap_or_default()
}

fn description_of(object: &SchemaObject) -> Option<String> {
    object
        .metadata
        .as_ref()
        .and_then(|metadata| metadata.description.clone())
}

fn summarize(schema: &Schema) -> (String, String) {
    match schema {
        Schema::Object(object) => {
            let type_name = if let Some(reference) = &object.reference {
                reference
                    .rsplit('/')
                    .next()
                    .unwrap_or(reference)
                    .to_string()
            } else if let Some(instance_type) = &object.instance_type {
                instance_type_name(instance_type)
            } else {
                "object".to_string()
            };
            let description = description_of(object)
                .unwrap_or_default()
                .replace('\n', " ");
            (type_name, description)
        }
        Schema::Bool(_) => ("any".to_string(), String::new()),
    }
}

fn instance_type_name(instance_type: &SingleOrVec<InstanceType>) -> String {
    let name = |single: &InstanceType| {
        format!("{single:?}").to_lowercase()
    };
    match instance_type {
        SingleOrVec::Single(single) => name(single),
        SingleOrVec::Vec(many) => many
            .iter()
            .map(name)
            .collect::<Vec<_>>()
            .join(" | "),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_schema_covers_the_whole_tree() {
        let json = schema_as_json();
        let parsed: serde_json::Value = serde_json::from_str(&json).expect("valid JSON");
        let definitions = parsed
            .get("definitions")
            .and_then(|value| value.as_object())
            .expect("definitions");
        for name in [
            "TrackerConfiguration",
            "YesWeHackConfiguration",
            "Program",
            "SynchronizeOptions",
            "FeedbackOptions",
        ] {
            assert!(definitions.contains_key(name), "missing definition {name}");
        }
        let tracker_schema = serde_json::to_string(&definitions["TrackerConfiguration"])
            .expect("serializable schema");
        assert!(tracker_schema.contains("github"));
        assert!(tracker_schema.contains("servicenow"));
    }

    #[test]
    fn markdown_rendering_lists_properties() {
        let markdown = schema_as_markdown();
        assert!(markdown.contains("## RootConfiguration"));
        assert!(markdown.contains("`trackers`"));
        assert!(markdown.contains("`yeswehack`"));
        assert!(markdown.contains("## Program"));
        assert!(markdown.contains("`bugtrackers_name`"));
    }

    #[test]
    fn text_rendering_marks_required_fields() {
        let text = schema_as_text();
        assert!(text.contains("Program:"));
        assert!(text.contains("slug: string (required)"));
    }
}
