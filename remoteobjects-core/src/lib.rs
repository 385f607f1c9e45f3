pub mod binding;
pub mod error;
pub mod hosted;
pub mod primitive;
pub mod signature;

pub use binding::{bind_arguments, ArgMap};
pub use error::Error;
pub use hosted::{
    handle, lock_object, object_ref_str, AttrValue, HostedClass, HostedObject, ObjectHandle,
};
pub use primitive::{is_primitive, primitive_kind};
pub use signature::{
    is_reserved_name, ClassSignature, MethodDescriptor, MethodSpec, ObjectSignature,
    ParamDescriptor, ParamKind, ParamSpec,
};

/// Version string exchanged over the version endpoint. The client aborts
/// on anything but an exact match; there is no backward compatibility.
pub const PROTOCOL_VERSION: &str = "1.0.0";
