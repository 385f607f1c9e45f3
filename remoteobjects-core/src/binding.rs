use serde_json::{Map, Value};

use crate::error::Error;
use crate::signature::{MethodSpec, ParamKind};

/// Named-argument map as it travels on the wire.
pub type ArgMap = Map<String, Value>;

/// Bind a caller-supplied named-argument map against a parameter spec.
///
/// Parameters are consumed in declaration order: every required parameter
/// must be present, defaulted parameters fall back to their declared
/// default, and a trailing variadic-keyword catch-all absorbs whatever the
/// caller supplied beyond the declared names. Without a catch-all, any
/// unconsumed caller argument is an error.
pub fn bind_arguments(spec: &MethodSpec, supplied: &ArgMap) -> Result<ArgMap, Error> {
    let mut remaining = supplied.clone();
    let mut bound = ArgMap::new();
    let mut has_var_keyword = false;

    for param in &spec.params {
        match param.kind {
            ParamKind::Required => match remaining.remove(&param.name) {
                Some(value) => {
                    bound.insert(param.name.clone(), value);
                }
                None => {
                    return Err(Error::MissingArgument(format!(
                        "`{}` missing required argument `{}`",
                        spec.name, param.name
                    )));
                }
            },
            ParamKind::Defaulted => {
                let value = match remaining.remove(&param.name) {
                    Some(value) => value,
                    None => param.default.clone().unwrap_or(Value::Null),
                };
                bound.insert(param.name.clone(), value);
            }
            ParamKind::VarKeyword => {
                has_var_keyword = true;
            }
        }
    }

    if !remaining.is_empty() {
        if has_var_keyword {
            for (name, value) in remaining {
                bound.insert(name, value);
            }
        } else {
            let names: Vec<&str> = remaining.keys().map(String::as_str).collect();
            return Err(Error::UnexpectedArgument(format!(
                "`{}` got unexpected argument(s): {}",
                spec.name,
                names.join(", ")
            )));
        }
    }

    Ok(bound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn args(pairs: &[(&str, Value)]) -> ArgMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn required_must_be_supplied() {
        let spec = MethodSpec::new("add").required("a").required("b");
        let err = bind_arguments(&spec, &args(&[("a", json!(31))])).unwrap_err();
        assert!(matches!(err, Error::MissingArgument(_)));
    }

    #[test]
    fn defaults_fill_in() {
        let spec = MethodSpec::new("greet").defaulted("name", json!("world"));
        let bound = bind_arguments(&spec, &ArgMap::new()).unwrap();
        assert_eq!(bound["name"], json!("world"));

        let bound = bind_arguments(&spec, &args(&[("name", json!("there"))])).unwrap();
        assert_eq!(bound["name"], json!("there"));
    }

    #[test]
    fn unexpected_argument_without_catch_all() {
        let spec = MethodSpec::new("f").required("a");
        let err = bind_arguments(&spec, &args(&[("a", json!(1)), ("b", json!(2))])).unwrap_err();
        assert!(matches!(err, Error::UnexpectedArgument(_)));
    }

    #[test]
    fn var_keyword_absorbs_extras() {
        let spec = MethodSpec::new("f").required("a").var_keyword("kwargs");
        let bound =
            bind_arguments(&spec, &args(&[("a", json!(1)), ("extra", json!("x"))])).unwrap();
        assert_eq!(bound["a"], json!(1));
        assert_eq!(bound["extra"], json!("x"));
        assert!(!bound.contains_key("kwargs"));
    }
}
