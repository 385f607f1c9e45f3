pub mod endpoints;
pub mod logging;
pub mod registry;
pub mod server;
pub mod upload;

pub use endpoints::{remote_object_router, ServerContext};
pub use logging::{init_logging, init_test_logging};
pub use registry::{object_signature, ObjectRegistry};
pub use server::{Server, ServerConfig};
pub use upload::UploadStaging;
