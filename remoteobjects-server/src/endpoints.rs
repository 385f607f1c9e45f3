use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Multipart, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, put},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::debug;

use remoteobjects_core::{ArgMap, AttrValue, Error, PROTOCOL_VERSION};

use crate::registry::{object_signature, ObjectRegistry};
use crate::upload::UploadStaging;

/// Server-wide state injected into every handler: the object registry and
/// the upload staging area. Constructed once at startup; the class
/// catalogue inside the registry is read-only from then on.
#[derive(Debug)]
pub struct ServerContext {
    pub registry: ObjectRegistry,
    pub staging: UploadStaging,
}

#[derive(Debug, Default, Deserialize)]
pub struct RegistryQuery {
    class_key: Option<String>,
    object_id: Option<String>,
    attribute_path: Option<String>,
    func_name: Option<String>,
    old_id: Option<String>,
    new_id: Option<String>,
}

/// Route the four wire resources onto a context.
pub fn remote_object_router(context: Arc<ServerContext>) -> Router {
    Router::new()
        .route(
            "/remoteobjects/registry",
            get(registry_get)
                .put(registry_put)
                .post(registry_post)
                .patch(registry_patch)
                .delete(registry_delete),
        )
        .route("/remoteobjects/registry/signature", get(signature_get))
        .route(
            "/remoteobjects/upload",
            put(upload_put).delete(upload_delete),
        )
        .route("/remoteobjects/version", get(version_get))
        .with_state(context)
}

fn error_response(err: &Error) -> Response {
    debug!(kind = err.kind(), "request failed: {err}");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": err.to_string() })),
    )
        .into_response()
}

/// Structured bodies are JSON objects of named arguments; an empty body
/// means no arguments.
fn parse_arg_body(body: &Bytes) -> Result<ArgMap, Error> {
    if body.is_empty() {
        return Ok(ArgMap::new());
    }
    match serde_json::from_slice::<Value>(body) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(Error::ArgumentBinding(format!(
            "arguments must be a JSON object, got `{other}`"
        ))),
        Err(err) => Err(Error::ArgumentBinding(format!("malformed JSON body: {err}"))),
    }
}

async fn version_get() -> Response {
    Json(json!({ "response": PROTOCOL_VERSION })).into_response()
}

/// Registry `GET` dispatch:
/// - `class_key` (+optional `object_id` pre-seed) registers an object;
/// - `object_id` (+optional `attribute_path`) reads an attribute, under
///   the object's lock;
/// - neither lists the registrable class keys.
async fn registry_get(
    State(context): State<Arc<ServerContext>>,
    Query(query): Query<RegistryQuery>,
    body: Bytes,
) -> Response {
    if let Some(class_key) = &query.class_key {
        let args = match parse_arg_body(&body) {
            Ok(args) => args,
            Err(err) => return error_response(&err),
        };
        if let Some(object_id) = &query.object_id {
            if context.registry.contains_object(object_id) {
                return Json(json!({ "id": object_id, "new_object": false })).into_response();
            }
        }
        return match context
            .registry
            .register_new_object(class_key, &args, query.object_id.as_deref())
        {
            Ok(object_id) => Json(json!({ "id": object_id, "new_object": true })).into_response(),
            Err(err) => error_response(&err),
        };
    }

    if let Some(object_id) = &query.object_id {
        let lock = match context.registry.lock_for(object_id) {
            Ok(lock) => lock,
            Err(err) => return error_response(&err),
        };
        let _guard = lock.lock().await;
        return match context
            .registry
            .obj_attribute(object_id, query.attribute_path.as_deref())
        {
            Ok(AttrValue::Primitive(value)) => Json(json!({ "value": value })).into_response(),
            Ok(AttrValue::Object(object)) => Json(object_signature(&object)).into_response(),
            Err(err) => error_response(&err),
        };
    }

    Json(json!({ "class_keys": context.registry.class_keys() })).into_response()
}

/// Registry `PUT`: set a primitive attribute, under the object's lock.
async fn registry_put(
    State(context): State<Arc<ServerContext>>,
    Query(query): Query<RegistryQuery>,
    body: Bytes,
) -> Response {
    let (Some(object_id), Some(attribute_path)) = (&query.object_id, &query.attribute_path) else {
        return error_response(&Error::ArgumentBinding(
            "both `object_id` and `attribute_path` must be supplied".to_string(),
        ));
    };
    let value = match parse_arg_body(&body) {
        Ok(mut map) => match map.remove("value") {
            Some(value) => value,
            None => {
                return error_response(&Error::ArgumentBinding(
                    "body must carry a `value` member".to_string(),
                ));
            }
        },
        Err(err) => return error_response(&err),
    };

    let lock = match context.registry.lock_for(object_id) {
        Ok(lock) => lock,
        Err(err) => return error_response(&err),
    };
    let _guard = lock.lock().await;
    // The setter runs hosted code; keep it off the runtime workers. The
    // per-object guard stays held until the blocking task finishes.
    let registry_context = Arc::clone(&context);
    let object_id = object_id.clone();
    let attribute_path = attribute_path.clone();
    let outcome = tokio::task::spawn_blocking(move || {
        registry_context
            .registry
            .obj_attribute_set(&object_id, &attribute_path, value)
    })
    .await;
    match outcome {
        Ok(Ok(())) => Json(json!({})).into_response(),
        Ok(Err(err)) => error_response(&err),
        Err(err) => error_response(&Error::Transport(format!("hosted assignment failed: {err}"))),
    }
}

/// Registry `POST`: invoke a method by name with a named-argument body,
/// under the object's lock. Captured log output rides along as `logs`.
async fn registry_post(
    State(context): State<Arc<ServerContext>>,
    Query(query): Query<RegistryQuery>,
    body: Bytes,
) -> Response {
    let (Some(object_id), Some(func_name)) = (&query.object_id, &query.func_name) else {
        return error_response(&Error::ArgumentBinding(
            "both `object_id` and `func_name` must be supplied".to_string(),
        ));
    };
    let args = match parse_arg_body(&body) {
        Ok(args) => args,
        Err(err) => return error_response(&err),
    };

    let lock = match context.registry.lock_for(object_id) {
        Ok(lock) => lock,
        Err(err) => return error_response(&err),
    };
    let _guard = lock.lock().await;
    // Hosted method bodies are synchronous and may run long; execute them
    // on the blocking pool so they cannot starve unrelated requests. The
    // per-object guard stays held until the blocking task finishes.
    let call_context = Arc::clone(&context);
    let object_id = object_id.clone();
    let func_name = func_name.clone();
    let attribute_path = query.attribute_path.clone();
    let outcome = tokio::task::spawn_blocking(move || {
        call_context.registry.obj_call_method(
            &object_id,
            attribute_path.as_deref(),
            &func_name,
            &args,
        )
    })
    .await;
    match outcome {
        Ok(Ok((value, logs))) => {
            let mut reply = Map::new();
            reply.insert("return".to_string(), value);
            if let Some(logs) = logs {
                reply.insert("logs".to_string(), Value::String(logs));
            }
            Json(Value::Object(reply)).into_response()
        }
        Ok(Err(err)) => error_response(&err),
        Err(err) => error_response(&Error::Transport(format!("hosted call failed: {err}"))),
    }
}

/// Registry `PATCH`: rename an object, under the (old) object's lock. The
/// lock instance survives the rename, so in-flight waiters stay valid.
async fn registry_patch(
    State(context): State<Arc<ServerContext>>,
    Query(query): Query<RegistryQuery>,
) -> Response {
    let (Some(old_id), Some(new_id)) = (&query.old_id, &query.new_id) else {
        return error_response(&Error::ArgumentBinding(
            "both `old_id` and `new_id` must be supplied".to_string(),
        ));
    };
    let lock = match context.registry.lock_for(old_id) {
        Ok(lock) => lock,
        Err(err) => return error_response(&err),
    };
    let _guard = lock.lock().await;
    match context.registry.set_object_id(old_id, new_id) {
        Ok(id) => Json(json!({ "id": id })).into_response(),
        Err(err) => error_response(&err),
    }
}

/// Registry `DELETE`: deregister. Takes no per-object lock; the caller
/// guarantees no call against the ID is still in flight.
async fn registry_delete(
    State(context): State<Arc<ServerContext>>,
    Query(query): Query<RegistryQuery>,
) -> Response {
    let Some(object_id) = &query.object_id else {
        return error_response(&Error::ArgumentBinding(
            "`object_id` must be supplied".to_string(),
        ));
    };
    match context.registry.deregister_object(object_id) {
        Ok(()) => Json(json!({})).into_response(),
        Err(err) => error_response(&err),
    }
}

/// Signature `GET`: constructor signature by `class_key`, full instance
/// signature by `object_id` (+optional `attribute_path`), or the list of
/// registered object IDs with neither.
async fn signature_get(
    State(context): State<Arc<ServerContext>>,
    Query(query): Query<RegistryQuery>,
) -> Response {
    if let Some(class_key) = &query.class_key {
        return match context.registry.class_init_signature(class_key) {
            Ok(signature) => Json(signature).into_response(),
            Err(err) => error_response(&err),
        };
    }
    if let Some(object_id) = &query.object_id {
        return match context
            .registry
            .obj_signature(object_id, query.attribute_path.as_deref())
        {
            Ok(signature) => Json(signature).into_response(),
            Err(err) => error_response(&err),
        };
    }
    Json(json!({ "object_ids": context.registry.object_ids() })).into_response()
}

/// Upload `PUT`: stage each multipart file. A rejected filename aborts
/// the request but still reports what was staged before it.
async fn upload_put(State(context): State<Arc<ServerContext>>, mut multipart: Multipart) -> Response {
    let mut files_uploaded = Map::new();
    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(err) => {
                return error_response(&Error::Transport(format!("malformed multipart body: {err}")));
            }
        };
        let Some(file_key) = field.name().map(str::to_string) else {
            continue;
        };
        let filename = field.file_name().unwrap_or(&file_key).to_string();
        let data = match field.bytes().await {
            Ok(data) => data,
            Err(err) => {
                return error_response(&Error::Transport(format!(
                    "failed to read upload `{file_key}`: {err}"
                )));
            }
        };
        match context.staging.stage(&file_key, &filename, &data) {
            Ok(path) => {
                files_uploaded.insert(file_key, json!(path.display().to_string()));
            }
            Err(err) => {
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({
                        "error": err.to_string(),
                        "files_uploaded": files_uploaded,
                    })),
                )
                    .into_response();
            }
        }
    }
    Json(json!({ "files_uploaded": files_uploaded })).into_response()
}

#[derive(Debug, Deserialize)]
struct UploadDeleteBody {
    file_keys: Vec<String>,
}

/// Upload `DELETE`: remove previously staged files by key.
async fn upload_delete(State(context): State<Arc<ServerContext>>, body: Bytes) -> Response {
    let request: UploadDeleteBody = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(err) => {
            return error_response(&Error::ArgumentBinding(format!(
                "body must carry a `file_keys` list: {err}"
            )));
        }
    };
    let mut files_removed = Map::new();
    for file_key in &request.file_keys {
        match context.staging.remove(file_key) {
            Ok(Some(path)) => {
                files_removed.insert(file_key.clone(), json!(path.display().to_string()));
            }
            Ok(None) => {}
            Err(err) => {
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({
                        "error": err.to_string(),
                        "files_removed": files_removed,
                    })),
                )
                    .into_response();
            }
        }
    }
    Json(json!({ "files_removed": files_removed })).into_response()
}
