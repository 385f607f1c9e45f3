pub mod instance;
pub mod proxy;
pub mod rest;

pub use instance::{list_classes, list_objects, ProxyOptions, RemoteClass, RemoteInstance};
pub use proxy::RemoteAttribute;
pub use rest::{RequestBody, RestClient};
