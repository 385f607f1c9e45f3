use serde_json::Value;

/// Wire-representable primitive kinds: string, integer, float, boolean.
/// Null, arrays and objects are deliberately excluded; a client may not
/// inject structured state by value.
pub fn is_primitive(value: &Value) -> bool {
    matches!(value, Value::String(_) | Value::Number(_) | Value::Bool(_))
}

/// Short kind tag used as the value-less attribute descriptor in
/// signatures. `None` for non-primitive values.
pub fn primitive_kind(value: &Value) -> Option<&'static str> {
    match value {
        Value::String(_) => Some("str"),
        Value::Bool(_) => Some("bool"),
        Value::Number(n) if n.is_f64() => Some("float"),
        Value::Number(_) => Some("int"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn primitives_are_recognized() {
        assert!(is_primitive(&json!("text")));
        assert!(is_primitive(&json!(42)));
        assert!(is_primitive(&json!(1.5)));
        assert!(is_primitive(&json!(true)));
    }

    #[test]
    fn structured_values_are_not_primitive() {
        assert!(!is_primitive(&json!(null)));
        assert!(!is_primitive(&json!([1, 2])));
        assert!(!is_primitive(&json!({"a": 1})));
    }

    #[test]
    fn kind_tags() {
        assert_eq!(primitive_kind(&json!("x")), Some("str"));
        assert_eq!(primitive_kind(&json!(3)), Some("int"));
        assert_eq!(primitive_kind(&json!(3.25)), Some("float"));
        assert_eq!(primitive_kind(&json!(false)), Some("bool"));
        assert_eq!(primitive_kind(&json!({})), None);
    }
}
