//! Remote-object server binary.
//!
//! Hosts a small demo catalogue behind the remote-object REST endpoints.
//! Host, port and staging directory come from the environment
//! (`REMOTEOBJECTS_HOST`, `REMOTEOBJECTS_PORT`, `REMOTEOBJECTS_UPLOAD_DIR`).

use anyhow::Result;
use serde_json::{json, Value};
use tracing::info;

use remoteobjects_core::{
    handle, ArgMap, AttrValue, Error, HostedClass, HostedObject, MethodSpec,
};
use remoteobjects_server::{init_logging, Server, ServerConfig};

/// Example hosted class for smoke-testing a deployment.
struct Counter {
    count: i64,
}

impl HostedObject for Counter {
    fn class_name(&self) -> &str {
        "Counter"
    }

    fn method_specs(&self) -> Vec<MethodSpec> {
        vec![
            MethodSpec::new("bump").defaulted("by", json!(1)),
            MethodSpec::new("reset"),
        ]
    }

    fn attr_names(&self) -> Vec<&'static str> {
        vec!["count"]
    }

    fn get_attr(&self, name: &str) -> Result<AttrValue, Error> {
        match name {
            "count" => Ok(AttrValue::Primitive(json!(self.count))),
            _ => Err(Error::UnknownAttribute(name.to_string())),
        }
    }

    fn set_attr(&mut self, name: &str, value: Value) -> Result<(), Error> {
        match name {
            "count" => {
                self.count = value.as_i64().unwrap_or(0);
                Ok(())
            }
            _ => Err(Error::UnknownAttribute(name.to_string())),
        }
    }

    fn call(&mut self, method: &str, args: ArgMap) -> Result<Value, Error> {
        match method {
            "bump" => {
                self.count += args["by"].as_i64().unwrap_or(1);
                Ok(json!(self.count))
            }
            "reset" => {
                self.count = 0;
                Ok(json!(self.count))
            }
            _ => Err(Error::UnknownAttribute(method.to_string())),
        }
    }
}

fn demo_catalogue() -> Vec<HostedClass> {
    vec![HostedClass::new(
        "Counter",
        MethodSpec::new("__init__").defaulted("count", json!(0)),
        |args| {
            Ok(handle(Counter {
                count: args["count"].as_i64().unwrap_or(0),
            }))
        },
    )]
}

#[tokio::main]
async fn main() -> Result<()> {
    let _log_guard = init_logging("logs", "remoteobjects-server")?;

    let defaults = ServerConfig::default();
    let config = ServerConfig {
        host: std::env::var("REMOTEOBJECTS_HOST").unwrap_or(defaults.host),
        port: std::env::var("REMOTEOBJECTS_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(defaults.port),
        upload_directory: std::env::var("REMOTEOBJECTS_UPLOAD_DIR")
            .map(Into::into)
            .unwrap_or(defaults.upload_directory),
        allowed_extension_regex: defaults.allowed_extension_regex,
    };

    info!(host = %config.host, port = config.port, "starting remote-object server");
    let server = Server::new(config, demo_catalogue())?;
    server.run().await?;
    Ok(())
}
