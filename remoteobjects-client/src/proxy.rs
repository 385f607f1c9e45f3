use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use regex::Regex;
use serde_json::{json, Value};
use tracing::debug;

use remoteobjects_core::{is_primitive, ArgMap, Error, ObjectSignature, ParamKind};

use crate::rest::{RequestBody, RestClient};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poison| poison.into_inner())
}

/// State shared by every proxy hanging off one root object: the REST
/// client, the current root object ID, the file-upload bookkeeping and
/// the ancestor map used for cycle resolution.
///
/// Nested proxies hold this weakly; dropping the owning instance ends the
/// whole graph's ability to reach the server.
pub(crate) struct ProxyCore {
    pub(crate) rest: RestClient,
    object_id: Mutex<String>,
    allowed_extension: Regex,
    ancestors: Mutex<HashMap<String, Arc<RemoteAttribute>>>,
    files_uploaded: Mutex<HashMap<String, String>>,
}

impl std::fmt::Debug for ProxyCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyCore")
            .field("server_uri", &self.rest.server_uri())
            .field("object_id", &self.object_id())
            .finish()
    }
}

impl ProxyCore {
    pub(crate) fn new(rest: RestClient, allowed_extension_regex: &str) -> Result<Self, Error> {
        Ok(ProxyCore {
            rest,
            object_id: Mutex::new(String::new()),
            allowed_extension: Regex::new(allowed_extension_regex).map_err(|err| {
                Error::UploadRejected(format!("invalid allowed-extension regex: {err}"))
            })?,
            ancestors: Mutex::new(HashMap::new()),
            files_uploaded: Mutex::new(HashMap::new()),
        })
    }

    pub(crate) fn object_id(&self) -> String {
        lock(&self.object_id).clone()
    }

    pub(crate) fn set_object_id(&self, object_id: &str) {
        *lock(&self.object_id) = object_id.to_string();
    }

    pub(crate) fn ancestor(&self, object_str: &str) -> Option<Arc<RemoteAttribute>> {
        lock(&self.ancestors).get(object_str).cloned()
    }

    /// Insert a proxy under its reference string unless one is already
    /// there; returns whichever proxy ends up registered.
    pub(crate) fn register_ancestor(
        &self,
        object_str: &str,
        proxy: &Arc<RemoteAttribute>,
    ) -> Arc<RemoteAttribute> {
        let mut ancestors = lock(&self.ancestors);
        Arc::clone(
            ancestors
                .entry(object_str.to_string())
                .or_insert_with(|| Arc::clone(proxy)),
        )
    }

    /// Rewrite any argument value naming an existing local file into a
    /// server-local path, uploading the content through the side channel
    /// first. A file whose extension fails the allow-list is rejected
    /// before anything is uploaded.
    pub(crate) fn prepare_file_arguments(&self, args: &mut ArgMap) -> Result<(), Error> {
        let mut to_upload: Vec<(String, PathBuf)> = Vec::new();
        for (name, value) in args.iter() {
            let Some(text) = value.as_str() else {
                continue;
            };
            let path = Path::new(text);
            if !path.is_file() {
                continue;
            }
            if !self.allowed_extension.is_match(&extension_of(text)) {
                return Err(Error::UploadRejected(format!(
                    "extension of `{text}` fails the allow-list, refusing to upload"
                )));
            }
            to_upload.push((name.clone(), path.to_path_buf()));
        }
        if to_upload.is_empty() {
            return Ok(());
        }

        // A re-upload under a known key supersedes the earlier staged
        // file; remove that one before the new upload claims the key.
        let superseded: Vec<String> = {
            let staged = lock(&self.files_uploaded);
            to_upload
                .iter()
                .map(|(key, _)| key.clone())
                .filter(|key| staged.contains_key(key))
                .collect()
        };
        self.delete_uploaded(&superseded)?;

        let reply = self.rest.put_multipart("remoteobjects/upload", &to_upload)?;
        let uploaded = reply
            .get("files_uploaded")
            .and_then(Value::as_object)
            .cloned()
            .ok_or_else(|| Error::Transport("upload reply missing `files_uploaded`".to_string()))?;

        let mut staged = lock(&self.files_uploaded);
        for (file_key, server_path) in uploaded {
            if let Some(server_path) = server_path.as_str() {
                debug!(%file_key, server_path, "file argument rewritten to server path");
                args.insert(file_key.clone(), Value::String(server_path.to_string()));
                staged.insert(file_key, server_path.to_string());
            }
        }
        Ok(())
    }

    pub(crate) fn delete_uploaded(&self, file_keys: &[String]) -> Result<(), Error> {
        if file_keys.is_empty() {
            return Ok(());
        }
        self.rest.delete(
            "remoteobjects/upload",
            &[],
            RequestBody::Json(json!({ "file_keys": file_keys })),
        )?;
        let mut staged = lock(&self.files_uploaded);
        for key in file_keys {
            staged.remove(key);
        }
        Ok(())
    }

    pub(crate) fn delete_all_uploaded(&self) -> Result<(), Error> {
        let file_keys: Vec<String> = lock(&self.files_uploaded).keys().cloned().collect();
        self.delete_uploaded(&file_keys)
    }
}

/// Lowercased extension including the dot; empty when there is none.
fn extension_of(filename: &str) -> String {
    Path::new(filename)
        .extension()
        .map(|ext| format!(".{}", ext.to_string_lossy().to_lowercase()))
        .unwrap_or_default()
}

struct AttrState {
    signature: ObjectSignature,
}

/// A synthesized stand-in for one remote object: the root (empty
/// attribute path) or a nested attribute reached through a dotted path.
///
/// The proxy is lazy: its signature is fetched on first use, and nested
/// non-primitive attributes become proxies of their own only when
/// accessed, bounded by the depth allowance. Before any nested expansion
/// the attribute's opaque reference string is checked against the
/// ancestor map, so reference cycles resolve to the already-built proxy
/// instead of recursing forever.
pub struct RemoteAttribute {
    core: Weak<ProxyCore>,
    path: String,
    depth_allowance: i64,
    state: Mutex<Option<AttrState>>,
}

impl std::fmt::Debug for RemoteAttribute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteAttribute")
            .field("path", &self.path)
            .field("depth_allowance", &self.depth_allowance)
            .field("initialised", &lock(&self.state).is_some())
            .finish()
    }
}

impl RemoteAttribute {
    pub(crate) fn new(core: &Arc<ProxyCore>, path: String, depth_allowance: i64) -> Arc<Self> {
        Arc::new(RemoteAttribute {
            core: Arc::downgrade(core),
            path,
            depth_allowance,
            state: Mutex::new(None),
        })
    }

    /// Dotted path from the root object; empty for the root itself.
    pub fn attribute_path(&self) -> &str {
        &self.path
    }

    /// Remaining levels of eager nested expansion; negative means
    /// unbounded, zero disables nested expansion.
    pub fn depth_allowance(&self) -> i64 {
        self.depth_allowance
    }

    fn core(&self) -> Result<Arc<ProxyCore>, Error> {
        self.core
            .upgrade()
            .ok_or_else(|| Error::Transport("proxy outlived its root instance".to_string()))
    }

    fn joined(&self, name: &str) -> String {
        if self.path.is_empty() {
            name.to_string()
        } else {
            format!("{}.{name}", self.path)
        }
    }

    fn with_signature<R>(&self, f: impl FnOnce(&ObjectSignature) -> R) -> Result<R, Error> {
        let state = lock(&self.state);
        match state.as_ref() {
            Some(state) => Ok(f(&state.signature)),
            None => Err(Error::Transport("signature not initialised".to_string())),
        }
    }

    /// Fetch and cache this proxy's signature on first use, register it
    /// in the ancestor map, and pre-create proxies for nested attributes
    /// within the depth allowance (uninitialised; they fetch their own
    /// signatures when touched).
    fn ensure_init(self: &Arc<Self>) -> Result<(), Error> {
        if lock(&self.state).is_some() {
            return Ok(());
        }
        let core = self.core()?;
        let object_id = core.object_id();
        let mut params: Vec<(&str, &str)> = vec![("object_id", object_id.as_str())];
        if !self.path.is_empty() {
            params.push(("attribute_path", self.path.as_str()));
        }
        let reply = core
            .rest
            .get("remoteobjects/registry/signature", &params, RequestBody::Empty)?;
        let signature: ObjectSignature = serde_json::from_value(reply)
            .map_err(|err| Error::Transport(format!("malformed signature descriptor: {err}")))?;
        debug!(path = %self.path, class = %signature.class, "proxy initialised from signature");

        core.register_ancestor(&signature.object_str, self);
        if self.depth_allowance != 0 {
            for (name, object_str) in &signature.attributes_nonprimitive {
                if core.ancestor(object_str).is_none() {
                    let child =
                        RemoteAttribute::new(&core, self.joined(name), self.depth_allowance - 1);
                    core.register_ancestor(object_str, &child);
                }
            }
        }

        *lock(&self.state) = Some(AttrState { signature });
        Ok(())
    }

    /// Invoke a remote method with named arguments.
    ///
    /// Required parameters are pre-checked client-side before the wire
    /// call (the server's binding remains the source of truth), and any
    /// file-path argument is uploaded and rewritten first. Captured log
    /// output from the hosted object is printed as a side channel.
    pub fn call(self: &Arc<Self>, method: &str, args: ArgMap) -> Result<Value, Error> {
        self.ensure_init()?;
        let descriptor = self.with_signature(|signature| {
            signature.methods.get(method).cloned().ok_or_else(|| {
                Error::UnknownAttribute(format!(
                    "`{}` does not expose method `{method}`",
                    signature.class
                ))
            })
        })??;
        for (name, param) in &descriptor {
            if param.kind == ParamKind::Required && !args.contains_key(name) {
                return Err(Error::MissingArgument(format!(
                    "`{method}` missing required argument `{name}`"
                )));
            }
        }

        let core = self.core()?;
        let mut args = args;
        core.prepare_file_arguments(&mut args)?;
        let object_id = core.object_id();
        let mut params: Vec<(&str, &str)> =
            vec![("object_id", object_id.as_str()), ("func_name", method)];
        if !self.path.is_empty() {
            params.push(("attribute_path", self.path.as_str()));
        }
        let reply = core.rest.post(
            "remoteobjects/registry",
            &params,
            RequestBody::Json(Value::Object(args)),
        )?;
        if let Some(logs) = reply.get("logs").and_then(Value::as_str) {
            if !logs.is_empty() {
                print!("{logs}");
            }
        }
        reply
            .get("return")
            .cloned()
            .ok_or_else(|| Error::Transport("call reply missing `return`".to_string()))
    }

    /// Read a primitive attribute.
    pub fn get(self: &Arc<Self>, attribute: &str) -> Result<Value, Error> {
        self.ensure_init()?;
        self.with_signature(|signature| {
            if signature.attributes.contains_key(attribute) {
                Ok(())
            } else if signature.attributes_nonprimitive.contains_key(attribute) {
                Err(Error::UnknownAttribute(format!(
                    "`{attribute}` is a nested object; use `attr`"
                )))
            } else {
                Err(Error::UnknownAttribute(format!(
                    "`{}` has no attribute `{attribute}`",
                    signature.class
                )))
            }
        })??;
        let core = self.core()?;
        let object_id = core.object_id();
        let path = self.joined(attribute);
        let reply = core.rest.get(
            "remoteobjects/registry",
            &[
                ("object_id", object_id.as_str()),
                ("attribute_path", path.as_str()),
            ],
            RequestBody::Empty,
        )?;
        reply
            .get("value")
            .cloned()
            .ok_or_else(|| Error::Transport("attribute reply missing `value`".to_string()))
    }

    /// Write a primitive attribute. Non-primitive values are refused
    /// client-side, mirroring the registry's own check.
    pub fn set(self: &Arc<Self>, attribute: &str, value: Value) -> Result<(), Error> {
        if !is_primitive(&value) {
            return Err(Error::NonPrimitiveAssignment(format!(
                "cannot set remote attribute `{attribute}` to non-primitive value {value}"
            )));
        }
        self.ensure_init()?;
        let core = self.core()?;
        let object_id = core.object_id();
        let path = self.joined(attribute);
        core.rest.put(
            "remoteobjects/registry",
            &[
                ("object_id", object_id.as_str()),
                ("attribute_path", path.as_str()),
            ],
            RequestBody::Json(json!({ "value": value })),
        )?;
        Ok(())
    }

    /// Proxy for a nested non-primitive attribute.
    ///
    /// Reuses the already-built proxy when the attribute's reference
    /// string is found in the ancestor map (the cycle case); otherwise a
    /// lazy child proxy is created with one less level of allowance.
    pub fn attr(self: &Arc<Self>, name: &str) -> Result<Arc<RemoteAttribute>, Error> {
        self.ensure_init()?;
        if self.depth_allowance == 0 {
            return Err(Error::UnknownAttribute(format!(
                "nested attribute expansion is disabled for this proxy; `{name}` not expanded"
            )));
        }
        let object_str = self.with_signature(|signature| {
            signature
                .attributes_nonprimitive
                .get(name)
                .cloned()
                .ok_or_else(|| {
                    Error::UnknownAttribute(format!(
                        "`{}` has no nested attribute `{name}`",
                        signature.class
                    ))
                })
        })??;
        let core = self.core()?;
        if let Some(existing) = core.ancestor(&object_str) {
            return Ok(existing);
        }
        let child = RemoteAttribute::new(&core, self.joined(name), self.depth_allowance - 1);
        Ok(core.register_ancestor(&object_str, &child))
    }

    /// Names of the remotely exposed methods.
    pub fn method_names(self: &Arc<Self>) -> Result<Vec<String>, Error> {
        self.ensure_init()?;
        self.with_signature(|signature| signature.methods.keys().cloned().collect())
    }

    /// Names of the primitive attributes.
    pub fn attribute_names(self: &Arc<Self>) -> Result<Vec<String>, Error> {
        self.ensure_init()?;
        self.with_signature(|signature| signature.attributes.keys().cloned().collect())
    }

    /// Names of the nested non-primitive attributes.
    pub fn nested_attribute_names(self: &Arc<Self>) -> Result<Vec<String>, Error> {
        self.ensure_init()?;
        self.with_signature(|signature| signature.attributes_nonprimitive.keys().cloned().collect())
    }

    /// The opaque per-instance reference string of the remote object.
    pub fn object_str(self: &Arc<Self>) -> Result<String, Error> {
        self.ensure_init()?;
        self.with_signature(|signature| signature.object_str.clone())
    }
}
