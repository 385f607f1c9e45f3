use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;

use crate::binding::ArgMap;
use crate::error::Error;
use crate::signature::MethodSpec;

/// An attribute read off a hosted object: either a wire-representable
/// primitive or a handle to a nested hosted object.
pub enum AttrValue {
    Primitive(Value),
    Object(ObjectHandle),
}

impl fmt::Debug for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttrValue::Primitive(v) => f.debug_tuple("Primitive").field(v).finish(),
            AttrValue::Object(_) => f.debug_tuple("Object").finish(),
        }
    }
}

/// The declarative introspection surface a hosted type exposes to the
/// registry: its class name, method specs, attribute enumeration, and
/// named-argument method dispatch.
///
/// Implementations receive already-bound arguments (defaults filled in,
/// extras merged through a declared catch-all), so `call` can index the
/// map without re-checking presence of required names.
pub trait HostedObject: Send + 'static {
    fn class_name(&self) -> &str;

    /// Method specs for every remotely exposed method, in declaration
    /// order. Reserved (dunder-convention) names are filtered out during
    /// signature enumeration.
    fn method_specs(&self) -> Vec<MethodSpec>;

    /// Names of every remotely exposed attribute.
    fn attr_names(&self) -> Vec<&'static str>;

    fn get_attr(&self, name: &str) -> Result<AttrValue, Error>;

    fn set_attr(&mut self, name: &str, value: Value) -> Result<(), Error>;

    fn call(&mut self, method: &str, args: ArgMap) -> Result<Value, Error>;

    /// Log text buffered during the last method call, if the object
    /// captures any. Returned once and cleared.
    fn drain_logs(&mut self) -> Option<String> {
        None
    }
}

/// Shared handle to a live hosted object. Nested attributes hand out
/// clones of these, which is what allows object graphs with shared
/// members or reference cycles.
pub type ObjectHandle = Arc<Mutex<dyn HostedObject>>;

/// Wrap a hosted object into a shareable handle.
pub fn handle<T: HostedObject>(object: T) -> ObjectHandle {
    Arc::new(Mutex::new(object))
}

/// Lock a handle, recovering the inner object if a previous holder
/// panicked mid-operation.
pub fn lock_object(object: &ObjectHandle) -> MutexGuard<'_, dyn HostedObject> {
    object.lock().unwrap_or_else(|poison| poison.into_inner())
}

/// Opaque per-instance reference string, stable for the lifetime of the
/// instance: `<ClassName>0x<address>`. Derived from the handle's pointer
/// identity so the same object reached through different attribute paths
/// yields the same string, which is what cycle detection keys on.
pub fn object_ref_str(object: &ObjectHandle) -> String {
    let class = lock_object(object).class_name().to_string();
    let addr = Arc::as_ptr(object) as *const () as usize;
    format!("<{class}>{addr:#x}")
}

type Constructor = Box<dyn Fn(ArgMap) -> Result<ObjectHandle, Error> + Send + Sync>;

/// Catalogue entry for a constructible type: its class key, the
/// constructor's parameter spec, and the construction closure itself.
pub struct HostedClass {
    key: String,
    constructor_spec: MethodSpec,
    construct: Constructor,
}

impl HostedClass {
    pub fn new<F>(key: impl Into<String>, constructor_spec: MethodSpec, construct: F) -> Self
    where
        F: Fn(ArgMap) -> Result<ObjectHandle, Error> + Send + Sync + 'static,
    {
        HostedClass {
            key: key.into(),
            constructor_spec,
            construct: Box::new(construct),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn constructor_spec(&self) -> &MethodSpec {
        &self.constructor_spec
    }

    pub fn construct(&self, args: ArgMap) -> Result<ObjectHandle, Error> {
        (self.construct)(args)
    }
}

impl fmt::Debug for HostedClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostedClass")
            .field("key", &self.key)
            .field("constructor_spec", &self.constructor_spec)
            .finish()
    }
}
