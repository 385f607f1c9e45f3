use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use remoteobjects_core::{ArgMap, ClassSignature, Error, MethodDescriptor, ParamKind};

use crate::proxy::{ProxyCore, RemoteAttribute};
use crate::rest::{RequestBody, RestClient};

/// Knobs for proxy construction.
#[derive(Debug, Clone)]
pub struct ProxyOptions {
    /// Deregister the server-side object when the instance is dropped.
    pub delete_remote_on_drop: bool,
    /// Allow-list regex matched against the lowercased extension (dot
    /// included) of any file argument before it is uploaded.
    pub allowed_upload_extension_regex: String,
    /// Levels of nested attribute expansion below the root: zero disables
    /// nested proxies entirely, negative means unbounded.
    pub attribute_depth_allowance: i64,
}

impl Default for ProxyOptions {
    fn default() -> Self {
        ProxyOptions {
            delete_remote_on_drop: true,
            allowed_upload_extension_regex: ".*".to_string(),
            attribute_depth_allowance: 0,
        }
    }
}

/// Client-side handle to one registrable class on the server.
///
/// `define` confirms the protocol version and fetches the constructor
/// signature once; `instantiate` then builds proxies without further
/// introspection round trips.
#[derive(Debug)]
pub struct RemoteClass {
    rest: RestClient,
    class_key: String,
    constructor: MethodDescriptor,
    options: ProxyOptions,
}

impl RemoteClass {
    pub fn define(server_uri: &str, class_key: &str, options: ProxyOptions) -> Result<Self, Error> {
        let rest = RestClient::new(server_uri)?;
        rest.confirm_server_version()?;
        let reply = rest.get(
            "remoteobjects/registry/signature",
            &[("class_key", class_key)],
            RequestBody::Empty,
        )?;
        let signature: ClassSignature = serde_json::from_value(reply)
            .map_err(|err| Error::Transport(format!("malformed constructor signature: {err}")))?;
        Ok(RemoteClass {
            rest,
            class_key: class_key.to_string(),
            constructor: signature.constructor,
            options,
        })
    }

    pub fn class_key(&self) -> &str {
        &self.class_key
    }

    pub fn constructor(&self) -> &MethodDescriptor {
        &self.constructor
    }

    fn preflight(&self, args: &ArgMap) -> Result<(), Error> {
        for (name, param) in &self.constructor {
            if param.kind == ParamKind::Required && !args.contains_key(name) {
                return Err(Error::MissingArgument(format!(
                    "constructing `{}` requires argument `{}`",
                    self.class_key, name
                )));
            }
        }
        Ok(())
    }

    /// Register a fresh server-side object and wrap it in a proxy.
    pub fn instantiate(&self, args: ArgMap) -> Result<RemoteInstance, Error> {
        self.register(args, None)
    }

    /// Register under a caller-chosen ID, or adopt the object already
    /// registered under it. The returned instance reports which happened.
    pub fn instantiate_with_id(
        &self,
        args: ArgMap,
        object_id: &str,
    ) -> Result<RemoteInstance, Error> {
        self.register(args, Some(object_id))
    }

    fn register(&self, args: ArgMap, object_id: Option<&str>) -> Result<RemoteInstance, Error> {
        self.preflight(&args)?;
        let core = Arc::new(ProxyCore::new(
            self.rest.clone(),
            &self.options.allowed_upload_extension_regex,
        )?);

        // Constructor arguments go through the upload side channel too.
        let mut args = args;
        core.prepare_file_arguments(&mut args)?;

        let mut params: Vec<(&str, &str)> = vec![("class_key", self.class_key.as_str())];
        if let Some(object_id) = object_id {
            params.push(("object_id", object_id));
        }
        let reply = core.rest.get(
            "remoteobjects/registry",
            &params,
            RequestBody::Json(Value::Object(args)),
        )?;
        let assigned = reply
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Transport("registration reply missing `id`".to_string()))?;
        let new_object = reply
            .get("new_object")
            .and_then(Value::as_bool)
            .unwrap_or(true);
        core.set_object_id(assigned);
        debug!(class_key = %self.class_key, object_id = %assigned, new_object, "object registered");

        let root = RemoteAttribute::new(&core, String::new(), self.options.attribute_depth_allowance);
        Ok(RemoteInstance {
            core,
            root,
            new_object,
            delete_remote_on_drop: self.options.delete_remote_on_drop,
        })
    }
}

/// Owning proxy for one registered remote object.
///
/// All interaction goes through the root [`RemoteAttribute`]; nested
/// proxies borrow the instance's shared state weakly and stop working once
/// the instance is dropped. Dropping also tears down the server side
/// (uploaded files, then the registration itself) unless configured not
/// to.
#[derive(Debug)]
pub struct RemoteInstance {
    core: Arc<ProxyCore>,
    root: Arc<RemoteAttribute>,
    new_object: bool,
    delete_remote_on_drop: bool,
}

impl RemoteInstance {
    /// The root proxy (empty attribute path).
    pub fn root(&self) -> &Arc<RemoteAttribute> {
        &self.root
    }

    pub fn object_id(&self) -> String {
        self.core.object_id()
    }

    /// False when registration adopted an object that already existed
    /// under the requested ID.
    pub fn is_new_object(&self) -> bool {
        self.new_object
    }

    /// Shorthand for a method call on the root object.
    pub fn call(&self, method: &str, args: ArgMap) -> Result<Value, Error> {
        self.root.call(method, args)
    }

    /// Shorthand for a primitive attribute read on the root object.
    pub fn get(&self, attribute: &str) -> Result<Value, Error> {
        self.root.get(attribute)
    }

    /// Shorthand for a primitive attribute write on the root object.
    pub fn set(&self, attribute: &str, value: Value) -> Result<(), Error> {
        self.root.set(attribute, value)
    }

    /// Shorthand for a nested attribute proxy off the root object.
    pub fn attr(&self, name: &str) -> Result<Arc<RemoteAttribute>, Error> {
        self.root.attr(name)
    }

    /// Rename the server-side registration; subsequent requests from every
    /// proxy in this graph use the new ID.
    pub fn set_object_id(&self, new_id: &str) -> Result<(), Error> {
        let old_id = self.core.object_id();
        let reply = self.core.rest.patch(
            "remoteobjects/registry",
            &[("old_id", old_id.as_str()), ("new_id", new_id)],
            RequestBody::Empty,
        )?;
        let assigned = reply
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Transport("rename reply missing `id`".to_string()))?;
        self.core.set_object_id(assigned);
        Ok(())
    }

    /// Deregister the remote object now instead of waiting for drop.
    pub fn delete_remote(mut self) -> Result<(), Error> {
        self.delete_remote_on_drop = false;
        self.core.delete_all_uploaded()?;
        let object_id = self.core.object_id();
        self.core.rest.delete(
            "remoteobjects/registry",
            &[("object_id", object_id.as_str())],
            RequestBody::Empty,
        )?;
        Ok(())
    }
}

impl Drop for RemoteInstance {
    fn drop(&mut self) {
        if !self.delete_remote_on_drop {
            return;
        }
        // Best effort only; the server may already be gone.
        if let Err(err) = self.core.delete_all_uploaded() {
            warn!("failed to clean up uploaded files: {err}");
        }
        let object_id = self.core.object_id();
        if let Err(err) = self.core.rest.delete(
            "remoteobjects/registry",
            &[("object_id", object_id.as_str())],
            RequestBody::Empty,
        ) {
            warn!(%object_id, "failed to deregister remote object: {err}");
        }
    }
}

/// Class keys registrable on the server.
pub fn list_classes(server_uri: &str) -> Result<Vec<String>, Error> {
    let rest = RestClient::new(server_uri)?;
    let reply = rest.get("remoteobjects/registry", &[], RequestBody::Empty)?;
    serde_json::from_value(
        reply
            .get("class_keys")
            .cloned()
            .unwrap_or(Value::Array(Vec::new())),
    )
    .map_err(|err| Error::Transport(format!("malformed class list: {err}")))
}

/// IDs of every object currently registered on the server.
pub fn list_objects(server_uri: &str) -> Result<Vec<String>, Error> {
    let rest = RestClient::new(server_uri)?;
    let reply = rest.get("remoteobjects/registry/signature", &[], RequestBody::Empty)?;
    serde_json::from_value(
        reply
            .get("object_ids")
            .cloned()
            .unwrap_or(Value::Array(Vec::new())),
    )
    .map_err(|err| Error::Transport(format!("malformed object list: {err}")))
}
