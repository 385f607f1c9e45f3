use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use indexmap::IndexMap;
use serde_json::Value;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info};

use remoteobjects_core::{
    bind_arguments, is_primitive, is_reserved_name, lock_object, object_ref_str, primitive_kind,
    ArgMap, AttrValue, ClassSignature, Error, HostedClass, MethodSpec, ObjectHandle,
    ObjectSignature,
};

/// Sole custodian of live object state and identity.
///
/// The class catalogue is immutable after construction. Objects and their
/// per-object locks live in concurrent tables keyed by object ID; lock
/// entries are created, re-keyed and removed atomically with their object
/// entry. The registry never acquires the per-object locks itself; the
/// endpoint layer does, as the single synchronization boundary.
pub struct ObjectRegistry {
    classes: HashMap<String, HostedClass>,
    counters: DashMap<String, u64>,
    objects: DashMap<String, ObjectHandle>,
    locks: DashMap<String, Arc<AsyncMutex<()>>>,
}

impl std::fmt::Debug for ObjectRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectRegistry")
            .field("classes", &self.class_keys())
            .field("objects", &self.objects.len())
            .finish()
    }
}

impl ObjectRegistry {
    pub fn new(classes: Vec<HostedClass>) -> Self {
        let counters = DashMap::new();
        for class in &classes {
            counters.insert(class.key().to_string(), 0u64);
        }
        ObjectRegistry {
            classes: classes
                .into_iter()
                .map(|class| (class.key().to_string(), class))
                .collect(),
            counters,
            objects: DashMap::new(),
            locks: DashMap::new(),
        }
    }

    pub fn class_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.classes.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn object_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.objects.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn contains_object(&self, object_id: &str) -> bool {
        self.objects.contains_key(object_id)
    }

    /// Look up the class, bind `args` against its constructor spec, invoke
    /// construction and store the instance together with a fresh lock.
    ///
    /// Without `requested_id` the new ID is `{class_key}#{sequence}`; a
    /// caller-chosen ID must be unused and never advances the sequence.
    pub fn register_new_object(
        &self,
        class_key: &str,
        args: &ArgMap,
        requested_id: Option<&str>,
    ) -> Result<String, Error> {
        let class = self
            .classes
            .get(class_key)
            .ok_or_else(|| Error::UnknownClass(format!("no such class `{class_key}`")))?;

        if let Some(id) = requested_id {
            if self.objects.contains_key(id) {
                return Err(Error::IdCollision(format!(
                    "proposed ID `{id}` already in use"
                )));
            }
        }

        let bound = bind_arguments(class.constructor_spec(), args)?;
        let object = class.construct(bound)?;

        let object_id = match requested_id {
            Some(id) => {
                match self.objects.entry(id.to_string()) {
                    dashmap::mapref::entry::Entry::Occupied(_) => {
                        return Err(Error::IdCollision(format!(
                            "proposed ID `{id}` already in use"
                        )));
                    }
                    dashmap::mapref::entry::Entry::Vacant(entry) => {
                        entry.insert(object);
                    }
                }
                id.to_string()
            }
            None => {
                // Allocate under the counter entry so concurrent
                // registrations of the same class get distinct IDs.
                let mut counter = self.counters.entry(class_key.to_string()).or_insert(0);
                let object_id = format!("{class_key}#{}", *counter);
                *counter += 1;
                drop(counter);
                self.objects.insert(object_id.clone(), object);
                object_id
            }
        };

        self.locks
            .insert(object_id.clone(), Arc::new(AsyncMutex::new(())));
        info!(object_id = %object_id, class_key, "registered object");
        Ok(object_id)
    }

    /// The per-object lock, shared with the endpoint layer.
    pub fn lock_for(&self, object_id: &str) -> Result<Arc<AsyncMutex<()>>, Error> {
        self.locks
            .get(object_id)
            .map(|entry| Arc::clone(&entry))
            .ok_or_else(|| unknown_object(object_id))
    }

    pub fn get_registered_object(&self, object_id: &str) -> Result<ObjectHandle, Error> {
        self.objects
            .get(object_id)
            .map(|entry| Arc::clone(&entry))
            .ok_or_else(|| unknown_object(object_id))
    }

    /// Resolve a dotted attribute path against a registered object. An
    /// absent path refers to the root object itself.
    pub fn obj_attribute(
        &self,
        object_id: &str,
        attribute_path: Option<&str>,
    ) -> Result<AttrValue, Error> {
        let root = self.get_registered_object(object_id)?;
        match attribute_path {
            None | Some("") => Ok(AttrValue::Object(root)),
            Some(path) => {
                let (parent, attribute) = resolve_parent(&root, path)?;
                let value = lock_object(&parent).get_attr(&attribute);
                value
            }
        }
    }

    /// Assign a primitive value to the attribute at `attribute_path`.
    pub fn obj_attribute_set(
        &self,
        object_id: &str,
        attribute_path: &str,
        value: Value,
    ) -> Result<(), Error> {
        if !is_primitive(&value) {
            return Err(Error::NonPrimitiveAssignment(format!(
                "cannot set `{attribute_path}` to non-primitive value {value}"
            )));
        }
        let root = self.get_registered_object(object_id)?;
        let (parent, attribute) = resolve_parent(&root, attribute_path)?;
        let result = lock_object(&parent).set_attr(&attribute, value);
        result
    }

    /// Resolve the call target, bind `args` against the named method's
    /// spec and invoke it. Returns the result together with any log text
    /// the object captured during the call.
    pub fn obj_call_method(
        &self,
        object_id: &str,
        attribute_path: Option<&str>,
        method_name: &str,
        args: &ArgMap,
    ) -> Result<(Value, Option<String>), Error> {
        let target = self.resolve_object(object_id, attribute_path)?;
        let spec = find_method_spec(&target, method_name)?;
        let bound = bind_arguments(&spec, args)?;
        debug!(object_id, method_name, "dispatching method call");
        let mut guard = lock_object(&target);
        let value = guard.call(method_name, bound)?;
        let logs = guard.drain_logs();
        Ok((value, logs))
    }

    pub fn obj_signature(
        &self,
        object_id: &str,
        attribute_path: Option<&str>,
    ) -> Result<ObjectSignature, Error> {
        let target = self.resolve_object(object_id, attribute_path)?;
        Ok(object_signature(&target))
    }

    pub fn class_init_signature(&self, class_key: &str) -> Result<ClassSignature, Error> {
        let class = self
            .classes
            .get(class_key)
            .ok_or_else(|| Error::UnknownClass(format!("no such class `{class_key}`")))?;
        Ok(ClassSignature {
            constructor: class.constructor_spec().descriptor(),
        })
    }

    /// Atomically rename an entry, moving both the object and its lock.
    pub fn set_object_id(&self, object_id: &str, new_id: &str) -> Result<String, Error> {
        if object_id == new_id {
            return Ok(new_id.to_string());
        }
        if self.objects.contains_key(new_id) {
            return Err(Error::IdCollision(format!(
                "proposed ID `{new_id}` already in use"
            )));
        }
        let (_, object) = self
            .objects
            .remove(object_id)
            .ok_or_else(|| unknown_object(object_id))?;
        self.objects.insert(new_id.to_string(), object);
        if let Some((_, lock)) = self.locks.remove(object_id) {
            self.locks.insert(new_id.to_string(), lock);
        }
        info!(old_id = object_id, new_id, "renamed object");
        Ok(new_id.to_string())
    }

    /// Remove the object and its lock. Assumes no call against the ID is
    /// in flight; that is the caller's responsibility.
    pub fn deregister_object(&self, object_id: &str) -> Result<(), Error> {
        self.objects
            .remove(object_id)
            .ok_or_else(|| unknown_object(object_id))?;
        self.locks.remove(object_id);
        info!(object_id, "deregistered object");
        Ok(())
    }

    fn resolve_object(
        &self,
        object_id: &str,
        attribute_path: Option<&str>,
    ) -> Result<ObjectHandle, Error> {
        match self.obj_attribute(object_id, attribute_path)? {
            AttrValue::Object(object) => Ok(object),
            AttrValue::Primitive(_) => Err(Error::UnknownAttribute(format!(
                "`{}` resolves to a primitive, not an object",
                attribute_path.unwrap_or_default()
            ))),
        }
    }
}

fn unknown_object(object_id: &str) -> Error {
    Error::UnknownObject(format!("no registered object for `{object_id}`"))
}

/// Walk the path's leading segments by attribute lookup, returning the
/// parent object and the final segment. Each hop locks only the object it
/// reads, so paths that revisit an ancestor cannot self-deadlock.
fn resolve_parent(root: &ObjectHandle, path: &str) -> Result<(ObjectHandle, String), Error> {
    let mut segments: Vec<&str> = path.split('.').collect();
    let attribute = segments
        .pop()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::UnknownAttribute(format!("malformed attribute path `{path}`")))?;

    let mut current = Arc::clone(root);
    for segment in segments {
        let next = {
            let guard = lock_object(&current);
            match guard.get_attr(segment)? {
                AttrValue::Object(object) => object,
                AttrValue::Primitive(_) => {
                    return Err(Error::UnknownAttribute(format!(
                        "`{segment}` in `{path}` resolves to a primitive, cannot traverse further"
                    )));
                }
            }
        };
        current = next;
    }
    Ok((current, attribute.to_string()))
}

fn find_method_spec(object: &ObjectHandle, method_name: &str) -> Result<MethodSpec, Error> {
    let guard = lock_object(object);
    guard
        .method_specs()
        .into_iter()
        .find(|spec| spec.name == method_name)
        .ok_or_else(|| {
            Error::UnknownAttribute(format!(
                "class `{}` does not implement `{method_name}`",
                guard.class_name()
            ))
        })
}

/// Build the full signature descriptor of a live object.
///
/// Attribute values are collected under the object's lock, then reference
/// strings for nested objects are derived afterwards; a self-referential
/// attribute would otherwise deadlock on its own mutex.
pub fn object_signature(object: &ObjectHandle) -> ObjectSignature {
    let object_str = object_ref_str(object);
    let (class, specs, attrs) = {
        let guard = lock_object(object);
        let attrs: Vec<(String, AttrValue)> = guard
            .attr_names()
            .into_iter()
            .filter(|name| !is_reserved_name(name))
            .filter_map(|name| {
                guard
                    .get_attr(name)
                    .ok()
                    .map(|value| (name.to_string(), value))
            })
            .collect();
        (guard.class_name().to_string(), guard.method_specs(), attrs)
    };

    let mut methods = IndexMap::new();
    for spec in specs {
        if !is_reserved_name(&spec.name) {
            methods.insert(spec.name.clone(), spec.descriptor());
        }
    }

    let mut attributes = IndexMap::new();
    let mut attributes_nonprimitive = IndexMap::new();
    for (name, value) in attrs {
        match value {
            AttrValue::Primitive(v) => {
                attributes.insert(name, primitive_kind(&v).unwrap_or("str").to_string());
            }
            AttrValue::Object(nested) => {
                attributes_nonprimitive.insert(name, object_ref_str(&nested));
            }
        }
    }

    ObjectSignature {
        class,
        object_str,
        methods,
        attributes,
        attributes_nonprimitive,
    }
}
