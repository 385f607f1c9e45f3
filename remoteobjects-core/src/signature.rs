use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Declaration form of one parameter in a method or constructor spec.
///
/// All remote calls pass arguments by name, never by position, so the only
/// distinctions that matter are "must be supplied", "has a default" and
/// "trailing catch-all for extra named arguments".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamKind {
    Required,
    Defaulted,
    VarKeyword,
}

/// Wire form of one parameter, keyed by name inside a [`MethodDescriptor`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamDescriptor {
    pub kind: ParamKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

/// Parameter descriptors in declaration order.
pub type MethodDescriptor = IndexMap<String, ParamDescriptor>;

/// Constructor surface of a registered class, surfaced separately from the
/// instance signature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassSignature {
    pub constructor: MethodDescriptor,
}

/// Introspected shape of a registered object (or of a nested attribute
/// resolved through an attribute path).
///
/// `attributes` maps primitive attribute names to a value-less kind tag;
/// `attributes_nonprimitive` maps attribute names to the opaque
/// per-instance reference string used for proxy and cycle bookkeeping.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ObjectSignature {
    pub class: String,
    pub object_str: String,
    pub methods: IndexMap<String, MethodDescriptor>,
    pub attributes: IndexMap<String, String>,
    pub attributes_nonprimitive: IndexMap<String, String>,
}

/// One declared parameter, in-memory form.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamSpec {
    pub name: String,
    pub kind: ParamKind,
    pub default: Option<Value>,
}

/// Declarative spec for a callable: its name and ordered parameters.
///
/// Hosted types build these with the chained constructors:
///
/// ```
/// use remoteobjects_core::MethodSpec;
/// use serde_json::json;
///
/// let spec = MethodSpec::new("resize")
///     .required("width")
///     .defaulted("height", json!(0))
///     .var_keyword("extra");
/// assert_eq!(spec.params.len(), 3);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct MethodSpec {
    pub name: String,
    pub params: Vec<ParamSpec>,
}

impl MethodSpec {
    pub fn new(name: impl Into<String>) -> Self {
        MethodSpec {
            name: name.into(),
            params: Vec::new(),
        }
    }

    pub fn required(mut self, name: impl Into<String>) -> Self {
        self.params.push(ParamSpec {
            name: name.into(),
            kind: ParamKind::Required,
            default: None,
        });
        self
    }

    pub fn defaulted(mut self, name: impl Into<String>, default: Value) -> Self {
        self.params.push(ParamSpec {
            name: name.into(),
            kind: ParamKind::Defaulted,
            default: Some(default),
        });
        self
    }

    /// Trailing catch-all for otherwise-unconsumed named arguments. At
    /// most one per spec, declared last.
    pub fn var_keyword(mut self, name: impl Into<String>) -> Self {
        self.params.push(ParamSpec {
            name: name.into(),
            kind: ParamKind::VarKeyword,
            default: None,
        });
        self
    }

    pub fn descriptor(&self) -> MethodDescriptor {
        self.params
            .iter()
            .map(|p| {
                (
                    p.name.clone(),
                    ParamDescriptor {
                        kind: p.kind,
                        default: p.default.clone(),
                    },
                )
            })
            .collect()
    }
}

/// Names following the reserved dunder convention are excluded from
/// method/attribute enumeration; the constructor is surfaced separately.
pub fn is_reserved_name(name: &str) -> bool {
    name.len() > 4 && name.starts_with("__") && name.ends_with("__")
}
