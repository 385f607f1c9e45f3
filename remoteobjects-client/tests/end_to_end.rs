use std::io::Write;
use std::path::PathBuf;
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use serde_json::{json, Value};

use remoteobjects_client::{list_objects, ProxyOptions, RemoteClass, RequestBody, RestClient};
use remoteobjects_core::{
    handle, ArgMap, AttrValue, Error, HostedClass, HostedObject, MethodSpec, ObjectHandle,
};
use remoteobjects_server::{init_test_logging, Server, ServerConfig};

// ---- hosted fixtures -------------------------------------------------------

struct Sensor {
    label: String,
    reading: f64,
    logbook: String,
}

impl HostedObject for Sensor {
    fn class_name(&self) -> &str {
        "Sensor"
    }

    fn method_specs(&self) -> Vec<MethodSpec> {
        vec![MethodSpec::new("read_scaled")
            .required("factor")
            .defaulted("offset", json!(0.0))]
    }

    fn attr_names(&self) -> Vec<&'static str> {
        vec!["label", "reading"]
    }

    fn get_attr(&self, name: &str) -> Result<AttrValue, Error> {
        match name {
            "label" => Ok(AttrValue::Primitive(json!(self.label))),
            "reading" => Ok(AttrValue::Primitive(json!(self.reading))),
            _ => Err(Error::UnknownAttribute(name.to_string())),
        }
    }

    fn set_attr(&mut self, name: &str, value: Value) -> Result<(), Error> {
        match name {
            "label" => {
                self.label = value.as_str().unwrap_or_default().to_string();
                Ok(())
            }
            "reading" => {
                self.reading = value.as_f64().unwrap_or(0.0);
                Ok(())
            }
            _ => Err(Error::UnknownAttribute(name.to_string())),
        }
    }

    fn call(&mut self, method: &str, args: ArgMap) -> Result<Value, Error> {
        match method {
            "read_scaled" => {
                let factor = args["factor"].as_f64().unwrap_or(1.0);
                let offset = args["offset"].as_f64().unwrap_or(0.0);
                self.logbook
                    .push_str(&format!("scaled `{}` by {factor}\n", self.label));
                Ok(json!(self.reading * factor + offset))
            }
            _ => Err(Error::UnknownAttribute(method.to_string())),
        }
    }

    fn drain_logs(&mut self) -> Option<String> {
        if self.logbook.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.logbook))
        }
    }
}

struct Partner {
    owner: ObjectHandle,
}

impl HostedObject for Partner {
    fn class_name(&self) -> &str {
        "Partner"
    }

    fn method_specs(&self) -> Vec<MethodSpec> {
        Vec::new()
    }

    fn attr_names(&self) -> Vec<&'static str> {
        vec!["owner"]
    }

    fn get_attr(&self, name: &str) -> Result<AttrValue, Error> {
        match name {
            "owner" => Ok(AttrValue::Object(self.owner.clone())),
            _ => Err(Error::UnknownAttribute(name.to_string())),
        }
    }

    fn set_attr(&mut self, name: &str, _value: Value) -> Result<(), Error> {
        Err(Error::UnknownAttribute(name.to_string()))
    }

    fn call(&mut self, method: &str, _args: ArgMap) -> Result<Value, Error> {
        Err(Error::UnknownAttribute(method.to_string()))
    }
}

struct Owner {
    name: String,
    partner: Option<ObjectHandle>,
}

impl HostedObject for Owner {
    fn class_name(&self) -> &str {
        "Owner"
    }

    fn method_specs(&self) -> Vec<MethodSpec> {
        Vec::new()
    }

    fn attr_names(&self) -> Vec<&'static str> {
        vec!["name", "partner"]
    }

    fn get_attr(&self, name: &str) -> Result<AttrValue, Error> {
        match name {
            "name" => Ok(AttrValue::Primitive(json!(self.name))),
            "partner" => self
                .partner
                .clone()
                .map(AttrValue::Object)
                .ok_or_else(|| Error::UnknownAttribute("partner not wired".to_string())),
            _ => Err(Error::UnknownAttribute(name.to_string())),
        }
    }

    fn set_attr(&mut self, name: &str, value: Value) -> Result<(), Error> {
        match name {
            "name" => {
                self.name = value.as_str().unwrap_or_default().to_string();
                Ok(())
            }
            _ => Err(Error::UnknownAttribute(name.to_string())),
        }
    }

    fn call(&mut self, method: &str, _args: ArgMap) -> Result<Value, Error> {
        Err(Error::UnknownAttribute(method.to_string()))
    }
}

struct Sleeper;

impl HostedObject for Sleeper {
    fn class_name(&self) -> &str {
        "Sleeper"
    }

    fn method_specs(&self) -> Vec<MethodSpec> {
        vec![MethodSpec::new("nap").required("millis")]
    }

    fn attr_names(&self) -> Vec<&'static str> {
        Vec::new()
    }

    fn get_attr(&self, name: &str) -> Result<AttrValue, Error> {
        Err(Error::UnknownAttribute(name.to_string()))
    }

    fn set_attr(&mut self, name: &str, _value: Value) -> Result<(), Error> {
        Err(Error::UnknownAttribute(name.to_string()))
    }

    fn call(&mut self, method: &str, args: ArgMap) -> Result<Value, Error> {
        match method {
            "nap" => {
                thread::sleep(Duration::from_millis(args["millis"].as_u64().unwrap_or(0)));
                Ok(json!("rested"))
            }
            _ => Err(Error::UnknownAttribute(method.to_string())),
        }
    }
}

struct FileEater;

impl HostedObject for FileEater {
    fn class_name(&self) -> &str {
        "FileEater"
    }

    fn method_specs(&self) -> Vec<MethodSpec> {
        vec![MethodSpec::new("consume").required("path")]
    }

    fn attr_names(&self) -> Vec<&'static str> {
        Vec::new()
    }

    fn get_attr(&self, name: &str) -> Result<AttrValue, Error> {
        Err(Error::UnknownAttribute(name.to_string()))
    }

    fn set_attr(&mut self, name: &str, _value: Value) -> Result<(), Error> {
        Err(Error::UnknownAttribute(name.to_string()))
    }

    fn call(&mut self, method: &str, args: ArgMap) -> Result<Value, Error> {
        match method {
            "consume" => {
                let path = args["path"].as_str().unwrap_or_default();
                let content = std::fs::read_to_string(path)
                    .map_err(|err| Error::ArgumentBinding(format!("cannot read `{path}`: {err}")))?;
                Ok(json!({ "content": content, "stored_at": path }))
            }
            _ => Err(Error::UnknownAttribute(method.to_string())),
        }
    }
}

fn catalogue() -> Vec<HostedClass> {
    vec![
        HostedClass::new(
            "Sensor",
            MethodSpec::new("__init__")
                .required("label")
                .defaulted("reading", json!(0.0)),
            |args| {
                Ok(handle(Sensor {
                    label: args["label"].as_str().unwrap_or_default().to_string(),
                    reading: args["reading"].as_f64().unwrap_or(0.0),
                    logbook: String::new(),
                }))
            },
        ),
        HostedClass::new(
            "Owner",
            MethodSpec::new("__init__").required("name"),
            |args| {
                let owner = Arc::new(std::sync::Mutex::new(Owner {
                    name: args["name"].as_str().unwrap_or_default().to_string(),
                    partner: None,
                }));
                let owner_handle: ObjectHandle = owner.clone();
                let partner = handle(Partner {
                    owner: owner_handle.clone(),
                });
                owner
                    .lock()
                    .map_err(|_| Error::Construction("owner lock poisoned".to_string()))?
                    .partner = Some(partner);
                Ok(owner_handle)
            },
        ),
        HostedClass::new("Sleeper", MethodSpec::new("__init__"), |_| {
            Ok(handle(Sleeper))
        }),
        HostedClass::new("FileEater", MethodSpec::new("__init__"), |_| {
            Ok(handle(FileEater))
        }),
    ]
}

// ---- harness ---------------------------------------------------------------

/// Serve the fixture catalogue on an ephemeral port from a dedicated
/// runtime thread, so the blocking client can be driven from plain tests.
fn spawn_server(upload_directory: PathBuf, allowed_extension_regex: &str) -> String {
    init_test_logging();
    let allowed_extension_regex = allowed_extension_regex.to_string();
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async move {
            let server = Server::new(
                ServerConfig {
                    upload_directory,
                    allowed_extension_regex,
                    ..ServerConfig::default()
                },
                catalogue(),
            )
            .unwrap();
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            tx.send(listener.local_addr().unwrap()).unwrap();
            axum::serve(listener, server.router()).await.unwrap();
        });
    });
    format!("http://{}", rx.recv().unwrap())
}

fn args(pairs: &[(&str, Value)]) -> ArgMap {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

fn keep_remote() -> ProxyOptions {
    ProxyOptions {
        delete_remote_on_drop: false,
        ..ProxyOptions::default()
    }
}

// ---- tests -----------------------------------------------------------------

#[test]
fn attribute_and_method_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let uri = spawn_server(dir.path().to_path_buf(), ".*");
    let class = RemoteClass::define(&uri, "Sensor", keep_remote()).unwrap();

    let sensor = class
        .instantiate(args(&[("label", json!("boiler")), ("reading", json!(21.5))]))
        .unwrap();
    assert_eq!(sensor.object_id(), "Sensor#0");
    assert!(sensor.is_new_object());

    assert_eq!(sensor.get("label").unwrap(), json!("boiler"));
    sensor.set("reading", json!(4.0)).unwrap();
    assert_eq!(sensor.get("reading").unwrap(), json!(4.0));

    // Defaulted `offset` is filled in server-side.
    let value = sensor
        .call("read_scaled", args(&[("factor", json!(10.0))]))
        .unwrap();
    assert_eq!(value, json!(40.0));

    let methods = sensor.root().method_names().unwrap();
    assert_eq!(methods, ["read_scaled"]);
}

#[test]
fn argument_errors_surface_typed_on_both_sides() {
    let dir = tempfile::tempdir().unwrap();
    let uri = spawn_server(dir.path().to_path_buf(), ".*");
    let class = RemoteClass::define(&uri, "Sensor", keep_remote()).unwrap();
    let sensor = class.instantiate(args(&[("label", json!("x"))])).unwrap();

    // Missing required argument is caught client-side before the wire.
    assert!(matches!(
        sensor.call("read_scaled", ArgMap::new()),
        Err(Error::MissingArgument(_))
    ));

    // An undeclared extra argument is rejected by server-side binding.
    assert!(matches!(
        sensor.call(
            "read_scaled",
            args(&[("factor", json!(1.0)), ("bogus", json!(true))]),
        ),
        Err(Error::UnexpectedArgument(_))
    ));

    assert!(matches!(
        sensor.call("fly", ArgMap::new()),
        Err(Error::UnknownAttribute(_))
    ));

    assert!(matches!(
        sensor.set("label", json!([1, 2])),
        Err(Error::NonPrimitiveAssignment(_))
    ));
}

#[test]
fn method_call_reply_carries_captured_logs() {
    let dir = tempfile::tempdir().unwrap();
    let uri = spawn_server(dir.path().to_path_buf(), ".*");
    let class = RemoteClass::define(&uri, "Sensor", keep_remote()).unwrap();
    let sensor = class
        .instantiate(args(&[("label", json!("boiler")), ("reading", json!(2.0))]))
        .unwrap();
    let id = sensor.object_id();

    let rest = RestClient::new(&uri).unwrap();
    let reply = rest
        .post(
            "remoteobjects/registry",
            &[("object_id", id.as_str()), ("func_name", "read_scaled")],
            RequestBody::Json(json!({ "factor": 3.0 })),
        )
        .unwrap();
    assert_eq!(reply["return"], json!(6.0));
    let logs = reply["logs"].as_str().unwrap();
    assert!(logs.contains("scaled `boiler` by 3"));

    // The buffer is drained per call, not cumulative.
    let reply = rest
        .post(
            "remoteobjects/registry",
            &[("object_id", id.as_str()), ("func_name", "read_scaled")],
            RequestBody::Json(json!({ "factor": 1.0 })),
        )
        .unwrap();
    assert_eq!(reply["logs"], json!("scaled `boiler` by 1\n"));
}

#[test]
fn forced_ids_preseed_and_never_advance_the_sequence() {
    let dir = tempfile::tempdir().unwrap();
    let uri = spawn_server(dir.path().to_path_buf(), ".*");
    let class = RemoteClass::define(&uri, "Sensor", keep_remote()).unwrap();

    let first = class.instantiate(args(&[("label", json!("a"))])).unwrap();
    assert_eq!(first.object_id(), "Sensor#0");

    let forced = class
        .instantiate_with_id(args(&[("label", json!("b"))]), "boiler-room")
        .unwrap();
    assert_eq!(forced.object_id(), "boiler-room");
    assert!(forced.is_new_object());

    // Re-registering under the same ID adopts the existing object.
    let adopted = class
        .instantiate_with_id(args(&[("label", json!("ignored"))]), "boiler-room")
        .unwrap();
    assert!(!adopted.is_new_object());
    assert_eq!(adopted.get("label").unwrap(), json!("b"));

    let second = class.instantiate(args(&[("label", json!("c"))])).unwrap();
    assert_eq!(second.object_id(), "Sensor#1");
}

#[test]
fn rename_carries_the_whole_proxy_graph() {
    let dir = tempfile::tempdir().unwrap();
    let uri = spawn_server(dir.path().to_path_buf(), ".*");
    let class = RemoteClass::define(&uri, "Sensor", keep_remote()).unwrap();
    let sensor = class.instantiate(args(&[("label", json!("main"))])).unwrap();

    sensor.set_object_id("primary").unwrap();
    assert_eq!(sensor.object_id(), "primary");
    assert_eq!(sensor.get("label").unwrap(), json!("main"));

    let objects = list_objects(&uri).unwrap();
    assert!(objects.contains(&"primary".to_string()));
    assert!(!objects.contains(&"Sensor#0".to_string()));
}

#[test]
fn dropping_an_instance_deregisters_it() {
    let dir = tempfile::tempdir().unwrap();
    let uri = spawn_server(dir.path().to_path_buf(), ".*");
    let class = RemoteClass::define(&uri, "Sensor", ProxyOptions::default()).unwrap();

    let sensor = class.instantiate(args(&[("label", json!("gone"))])).unwrap();
    let id = sensor.object_id();
    assert!(list_objects(&uri).unwrap().contains(&id));

    drop(sensor);
    assert!(!list_objects(&uri).unwrap().contains(&id));
}

#[test]
fn explicit_delete_frees_the_id() {
    let dir = tempfile::tempdir().unwrap();
    let uri = spawn_server(dir.path().to_path_buf(), ".*");
    let class = RemoteClass::define(&uri, "Sensor", keep_remote()).unwrap();

    let sensor = class.instantiate(args(&[("label", json!("x"))])).unwrap();
    let id = sensor.object_id();
    sensor.delete_remote().unwrap();
    assert!(!list_objects(&uri).unwrap().contains(&id));

    // The old registration is gone, so the forced ID registers fresh.
    let survivor = class
        .instantiate_with_id(args(&[("label", json!("z"))]), &id)
        .unwrap();
    assert!(survivor.is_new_object());
    assert_eq!(survivor.get("label").unwrap(), json!("z"));
}

#[test]
fn cyclic_graphs_resolve_to_the_ancestor_proxy() {
    let dir = tempfile::tempdir().unwrap();
    let uri = spawn_server(dir.path().to_path_buf(), ".*");
    let options = ProxyOptions {
        delete_remote_on_drop: false,
        attribute_depth_allowance: -1,
        ..ProxyOptions::default()
    };
    let class = RemoteClass::define(&uri, "Owner", options).unwrap();
    let owner = class.instantiate(args(&[("name", json!("ada"))])).unwrap();

    let partner = owner.attr("partner").unwrap();
    assert_eq!(
        partner.nested_attribute_names().unwrap(),
        vec!["owner".to_string()]
    );

    // Following the cycle hands back the root proxy itself.
    let back = partner.attr("owner").unwrap();
    assert!(Arc::ptr_eq(owner.root(), &back));
    assert_eq!(back.object_str().unwrap(), owner.root().object_str().unwrap());
    assert_eq!(back.get("name").unwrap(), json!("ada"));
}

#[test]
fn zero_depth_allowance_disables_nested_proxies() {
    let dir = tempfile::tempdir().unwrap();
    let uri = spawn_server(dir.path().to_path_buf(), ".*");
    let class = RemoteClass::define(&uri, "Owner", keep_remote()).unwrap();
    let owner = class.instantiate(args(&[("name", json!("ada"))])).unwrap();

    assert_eq!(owner.get("name").unwrap(), json!("ada"));
    assert!(matches!(
        owner.attr("partner"),
        Err(Error::UnknownAttribute(_))
    ));
}

#[test]
fn calls_on_one_object_serialize_while_distinct_objects_overlap() {
    let dir = tempfile::tempdir().unwrap();
    let uri = spawn_server(dir.path().to_path_buf(), ".*");
    let class = RemoteClass::define(&uri, "Sleeper", keep_remote()).unwrap();

    let shared = class.instantiate(ArgMap::new()).unwrap();
    let nap = args(&[("millis", json!(300))]);

    let start = Instant::now();
    let workers: Vec<_> = (0..2)
        .map(|_| {
            let root = Arc::clone(shared.root());
            let nap = nap.clone();
            thread::spawn(move || root.call("nap", nap).unwrap())
        })
        .collect();
    for worker in workers {
        assert_eq!(worker.join().unwrap(), json!("rested"));
    }
    // Per-object locking forces the two naps back to back.
    assert!(start.elapsed() >= Duration::from_millis(550));

    let other = class.instantiate(ArgMap::new()).unwrap();
    let start = Instant::now();
    let a = {
        let root = Arc::clone(shared.root());
        let nap = nap.clone();
        thread::spawn(move || root.call("nap", nap).unwrap())
    };
    let b = {
        let root = Arc::clone(other.root());
        let nap = nap.clone();
        thread::spawn(move || root.call("nap", nap).unwrap())
    };
    a.join().unwrap();
    b.join().unwrap();
    // Different objects hold different locks, so these run concurrently.
    assert!(start.elapsed() < Duration::from_millis(550));
}

#[test]
fn file_arguments_are_uploaded_and_rewritten() {
    let staging_dir = tempfile::tempdir().unwrap();
    let local_dir = tempfile::tempdir().unwrap();
    let uri = spawn_server(staging_dir.path().to_path_buf(), ".*");

    let local_path = local_dir.path().join("notes.txt");
    let mut file = std::fs::File::create(&local_path).unwrap();
    writeln!(file, "hello from the other side").unwrap();

    let class = RemoteClass::define(&uri, "FileEater", keep_remote()).unwrap();
    let eater = class.instantiate(ArgMap::new()).unwrap();
    let reply = eater
        .call(
            "consume",
            args(&[("path", json!(local_path.display().to_string()))]),
        )
        .unwrap();

    assert_eq!(
        reply["content"],
        json!("hello from the other side\n")
    );
    // The method saw a staged server-side copy, not the client's path.
    let stored_at = reply["stored_at"].as_str().unwrap();
    assert_ne!(stored_at, local_path.display().to_string());
    assert!(stored_at.starts_with(staging_dir.path().display().to_string().as_str()));
}

#[test]
fn reupload_under_a_known_key_removes_the_superseded_file() {
    let staging_dir = tempfile::tempdir().unwrap();
    let local_dir = tempfile::tempdir().unwrap();
    let uri = spawn_server(staging_dir.path().to_path_buf(), ".*");

    let first = local_dir.path().join("first.txt");
    let second = local_dir.path().join("second.txt");
    std::fs::write(&first, "first").unwrap();
    std::fs::write(&second, "second").unwrap();

    let class = RemoteClass::define(&uri, "FileEater", keep_remote()).unwrap();
    let eater = class.instantiate(ArgMap::new()).unwrap();

    let reply = eater
        .call("consume", args(&[("path", json!(first.display().to_string()))]))
        .unwrap();
    assert_eq!(reply["content"], json!("first"));
    assert_eq!(std::fs::read_dir(staging_dir.path()).unwrap().count(), 1);

    // Same argument name means the same file key; the earlier staged
    // file is deleted before the new upload claims the key.
    let reply = eater
        .call("consume", args(&[("path", json!(second.display().to_string()))]))
        .unwrap();
    assert_eq!(reply["content"], json!("second"));
    let staged: Vec<_> = std::fs::read_dir(staging_dir.path())
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .collect();
    assert_eq!(staged.len(), 1);
    assert_eq!(std::fs::read_to_string(&staged[0]).unwrap(), "second");
}

#[test]
fn drop_removes_staged_files_with_the_registration() {
    let staging_dir = tempfile::tempdir().unwrap();
    let local_dir = tempfile::tempdir().unwrap();
    let uri = spawn_server(staging_dir.path().to_path_buf(), ".*");

    let local_path = local_dir.path().join("notes.txt");
    std::fs::write(&local_path, "ephemeral").unwrap();

    let class = RemoteClass::define(&uri, "FileEater", ProxyOptions::default()).unwrap();
    let eater = class.instantiate(ArgMap::new()).unwrap();
    eater
        .call(
            "consume",
            args(&[("path", json!(local_path.display().to_string()))]),
        )
        .unwrap();
    let id = eater.object_id();
    assert_eq!(std::fs::read_dir(staging_dir.path()).unwrap().count(), 1);

    drop(eater);
    assert_eq!(std::fs::read_dir(staging_dir.path()).unwrap().count(), 0);
    assert!(!list_objects(&uri).unwrap().contains(&id));
}

#[test]
fn slow_calls_do_not_starve_unrelated_objects() {
    let dir = tempfile::tempdir().unwrap();
    let uri = spawn_server(dir.path().to_path_buf(), ".*");
    let class = RemoteClass::define(&uri, "Sleeper", keep_remote()).unwrap();

    // More sleepers than runtime workers; the naps still overlap because
    // hosted code runs on the blocking pool.
    let sleepers: Vec<_> = (0..3).map(|_| class.instantiate(ArgMap::new()).unwrap()).collect();
    let nap = args(&[("millis", json!(300))]);

    let start = Instant::now();
    let workers: Vec<_> = sleepers
        .iter()
        .map(|sleeper| {
            let root = Arc::clone(sleeper.root());
            let nap = nap.clone();
            thread::spawn(move || root.call("nap", nap).unwrap())
        })
        .collect();
    for worker in workers {
        assert_eq!(worker.join().unwrap(), json!("rested"));
    }
    assert!(start.elapsed() < Duration::from_millis(550));
}

#[test]
fn disallowed_extension_is_rejected_before_upload() {
    let staging_dir = tempfile::tempdir().unwrap();
    let local_dir = tempfile::tempdir().unwrap();
    let uri = spawn_server(staging_dir.path().to_path_buf(), ".*");

    let local_path = local_dir.path().join("payload.bin");
    std::fs::write(&local_path, b"\x00\x01").unwrap();

    let options = ProxyOptions {
        delete_remote_on_drop: false,
        allowed_upload_extension_regex: r"^\.txt$".to_string(),
        ..ProxyOptions::default()
    };
    let class = RemoteClass::define(&uri, "FileEater", options).unwrap();
    let eater = class.instantiate(ArgMap::new()).unwrap();

    assert!(matches!(
        eater.call(
            "consume",
            args(&[("path", json!(local_path.display().to_string()))]),
        ),
        Err(Error::UploadRejected(_))
    ));
    // Nothing was staged server-side.
    assert_eq!(std::fs::read_dir(staging_dir.path()).unwrap().count(), 0);
}
