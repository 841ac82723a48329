//! Structural checks between a canonical schema and a compiled type
//!
//! Two checks gate startup:
//! - [`check_assignable`] compares the canonical schema with the JSON schema
//!   generated from the compiled type (field by field, recursively).
//! - [`validate_instance`] checks a serialized sample of the compiled type
//!   against the canonical schema.
//!
//! Both understand the subset of JSON schema that canonical lineages and
//! `schemars` emit: `type`, `properties`, `required`, `items`, local `$ref`,
//! and single-variant `allOf`/`anyOf`/`oneOf` wrappers.

use std::collections::BTreeSet;

use serde_json::{Map, Value};

/// A schema violation: (field path, message)
pub type Violation = (String, String);

/// Max `$ref`/wrapper hops followed before giving up on a node
const MAX_RESOLVE_DEPTH: usize = 32;

/// A schema document able to resolve local references
struct SchemaDoc<'a> {
    root: &'a Value,
}

impl<'a> SchemaDoc<'a> {
    fn new(root: &'a Value) -> Self {
        Self { root }
    }

    /// Follow `$ref` pointers and unwrap single-variant combinators
    fn resolve(&self, mut node: &'a Value) -> &'a Value {
        for _ in 0..MAX_RESOLVE_DEPTH {
            let Some(obj) = node.as_object() else {
                return node;
            };
            if let Some(target) = obj
                .get("$ref")
                .and_then(Value::as_str)
                .and_then(|r| r.strip_prefix('#'))
                .and_then(|pointer| self.root.pointer(pointer))
            {
                node = target;
                continue;
            }
            if let Some(inner) = single_variant(obj) {
                node = inner;
                continue;
            }
            return node;
        }
        node
    }
}

/// The only non-null variant of an `allOf`/`anyOf`/`oneOf`, if there is exactly one
fn single_variant(obj: &Map<String, Value>) -> Option<&Value> {
    if obj.contains_key("properties") || obj.contains_key("type") {
        return None;
    }
    ["allOf", "anyOf", "oneOf"].iter().find_map(|key| {
        let variants = obj.get(*key)?.as_array()?;
        let mut non_null = variants.iter().filter(|v| !is_null_schema(v));
        let first = non_null.next()?;
        non_null.next().is_none().then_some(first)
    })
}

fn is_null_schema(node: &Value) -> bool {
    node.get("type").and_then(Value::as_str) == Some("null")
}

/// Declared JSON types of a node, `None` when unconstrained
fn declared_types(node: &Value) -> Option<BTreeSet<&str>> {
    match node.get("type")? {
        Value::String(t) => Some(BTreeSet::from([t.as_str()])),
        Value::Array(ts) => Some(ts.iter().filter_map(Value::as_str).collect()),
        _ => None,
    }
}

fn properties(node: &Value) -> Option<&Map<String, Value>> {
    node.get("properties").and_then(Value::as_object)
}

fn required(node: &Value) -> BTreeSet<&str> {
    node.get("required")
        .and_then(Value::as_array)
        .map(|names| names.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default()
}

fn join(path: &str, field: &str) -> String {
    if path.is_empty() {
        field.to_string()
    } else {
        format!("{}.{}", path, field)
    }
}

fn display_path(path: &str) -> String {
    if path.is_empty() {
        "<root>".to_string()
    } else {
        path.to_string()
    }
}

/// Check that a compiled type's generated schema is assignable to the canonical one
///
/// Every canonical property must exist on the compiled type with a compatible
/// JSON type, and the compiled type may not carry properties the canonical
/// schema lacks. A property the compiled type requires must be required by
/// the canonical schema too; the reverse is allowed, since defaulted fields
/// are always serialized.
pub fn check_assignable(canonical: &Value, generated: &Value) -> Result<(), Violation> {
    let canon = SchemaDoc::new(canonical);
    let repr = SchemaDoc::new(generated);
    assignable_node(&canon, &repr, "", canonical, generated)
}

fn assignable_node<'c, 'r>(
    canon: &SchemaDoc<'c>,
    repr: &SchemaDoc<'r>,
    path: &str,
    canon_node: &'c Value,
    repr_node: &'r Value,
) -> Result<(), Violation> {
    let c = canon.resolve(canon_node);
    let r = repr.resolve(repr_node);

    types_assignable(path, c, r)?;

    if let Some(canon_props) = properties(c) {
        let repr_props = properties(r);

        for (field, canon_field) in canon_props {
            let field_path = join(path, field);
            let Some(repr_field) = repr_props.and_then(|p| p.get(field)) else {
                return Err((field_path, "field missing from compiled type".to_string()));
            };
            assignable_node(canon, repr, &field_path, canon_field, repr_field)?;
        }
        if let Some(extra) = repr_props
            .into_iter()
            .flat_map(|p| p.keys())
            .find(|k| !canon_props.contains_key(*k))
        {
            return Err((
                join(path, extra),
                "field not declared in canonical schema".to_string(),
            ));
        }

        let canon_required = required(c);
        if let Some(field) = required(r).difference(&canon_required).next() {
            return Err((
                join(path, field),
                "field required by compiled type but optional in canonical schema".to_string(),
            ));
        }
    }

    if let (Some(canon_items), Some(repr_items)) = (c.get("items"), r.get("items")) {
        assignable_node(canon, repr, &format!("{}[]", path), canon_items, repr_items)?;
    }

    Ok(())
}

fn types_assignable(path: &str, canon: &Value, repr: &Value) -> Result<(), Violation> {
    let (Some(canon_types), Some(repr_types)) = (declared_types(canon), declared_types(repr))
    else {
        return Ok(());
    };

    for t in repr_types.iter().filter(|t| **t != "null") {
        let accepted = canon_types.contains(t) || (*t == "integer" && canon_types.contains("number"));
        if !accepted {
            return Err((
                display_path(path),
                format!(
                    "type {} is not assignable to {}",
                    t,
                    canon_types.iter().copied().collect::<Vec<_>>().join("|")
                ),
            ));
        }
    }
    Ok(())
}

/// Validate a JSON instance against a canonical schema
pub fn validate_instance(canonical: &Value, instance: &Value) -> Result<(), Violation> {
    let doc = SchemaDoc::new(canonical);
    validate_node(&doc, "", canonical, instance)
}

fn validate_node<'a>(
    doc: &SchemaDoc<'a>,
    path: &str,
    node: &'a Value,
    value: &Value,
) -> Result<(), Violation> {
    let node = doc.resolve(node);
    if node == &Value::Bool(false) {
        return Err((display_path(path), "no value is allowed here".to_string()));
    }

    if let Some(types) = declared_types(node) {
        if !types.iter().any(|t| value_has_type(value, t)) {
            return Err((
                display_path(path),
                format!(
                    "expected {}, found {}",
                    types.iter().copied().collect::<Vec<_>>().join("|"),
                    type_of(value)
                ),
            ));
        }
    }

    if let Value::Object(fields) = value {
        if let Some(required) = node.get("required").and_then(Value::as_array) {
            if let Some(missing) = required
                .iter()
                .filter_map(Value::as_str)
                .find(|name| !fields.contains_key(*name))
            {
                return Err((join(path, missing), "required field is missing".to_string()));
            }
        }
        if let Some(props) = properties(node) {
            for (name, field_value) in fields {
                if let Some(field_schema) = props.get(name) {
                    validate_node(doc, &join(path, name), field_schema, field_value)?;
                }
            }
        }
    }

    if let (Value::Array(elements), Some(items)) = (value, node.get("items")) {
        for (i, element) in elements.iter().enumerate() {
            validate_node(doc, &format!("{}[{}]", path, i), items, element)?;
        }
    }

    Ok(())
}

fn value_has_type(value: &Value, t: &str) -> bool {
    match t {
        "null" => value.is_null(),
        "boolean" => value.is_boolean(),
        "string" => value.is_string(),
        "integer" => value.is_i64() || value.is_u64(),
        "number" => value.is_number(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        _ => false,
    }
}

fn type_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "number",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
