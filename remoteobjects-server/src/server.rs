use std::path::PathBuf;
use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;

use remoteobjects_core::HostedClass;

use crate::endpoints::{remote_object_router, ServerContext};
use crate::registry::ObjectRegistry;
use crate::upload::UploadStaging;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Directory file-argument uploads are staged under.
    pub upload_directory: PathBuf,
    /// Regex matched against the lowercased extension (dot included) of
    /// every uploaded filename.
    pub allowed_extension_regex: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 6000,
            upload_directory: PathBuf::from("/tmp"),
            allowed_extension_regex: r".*".to_string(),
        }
    }
}

/// Hosts a class catalogue behind the remote-object REST endpoints.
#[derive(Debug, Clone)]
pub struct Server {
    config: ServerConfig,
    context: Arc<ServerContext>,
}

impl Server {
    pub fn new(config: ServerConfig, classes: Vec<HostedClass>) -> anyhow::Result<Self> {
        let staging =
            UploadStaging::new(&config.upload_directory, &config.allowed_extension_regex)?;
        Ok(Server {
            context: Arc::new(ServerContext {
                registry: ObjectRegistry::new(classes),
                staging,
            }),
            config,
        })
    }

    pub fn context(&self) -> &Arc<ServerContext> {
        &self.context
    }

    pub fn router(&self) -> Router {
        remote_object_router(Arc::clone(&self.context))
    }

    pub async fn run(self) -> Result<(), std::io::Error> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr).await?;

        println!("Server listening on {}", addr);
        println!("  Registry endpoint:  http://{}/remoteobjects/registry", addr);
        println!("  Signature endpoint: http://{}/remoteobjects/registry/signature", addr);
        println!("  Upload endpoint:    http://{}/remoteobjects/upload", addr);
        println!("  Version endpoint:   http://{}/remoteobjects/version", addr);

        axum::serve(listener, self.router()).await?;

        Ok(())
    }
}
