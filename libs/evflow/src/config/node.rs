// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Configuration tree nodes.
//!
//! Locking rules:
//! - The *traversal lock* (readers/writer) protects the children map.
//!   Structural mutation (add/remove child) takes it as writer; lookups
//!   and snapshots take it as reader.
//! - The *node lock* (recursive) protects the attribute map and listener
//!   lists, and doubles as the user-facing transaction lock.
//! - When both are needed the traversal lock is acquired first.
//!
//! Listeners are invoked while the node lock is held, so the value a
//! listener observes is still current when it runs. The flip side: a
//! listener must not structurally mutate the node it was notified about.
//! Debug builds assert against that with a per-thread dispatch marker.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use parking_lot::{ReentrantMutex, ReentrantMutexGuard, RwLock};
use thiserror::Error;

use super::value::{AttrFlags, AttrRanges, AttrType, AttrValue};

/// Recoverable attribute put failure.
///
/// Everything else that can go wrong with the attribute API (missing key,
/// type mismatch, invalid defaults) is a programmer bug and terminates the
/// process instead.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributeError {
    #[error("attribute is read-only")]
    ReadOnly,
    #[error("value out of range")]
    OutOfRange,
}

/// Structural change on a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeEvent<'a> {
    ChildAdded(&'a str),
    ChildRemoved(&'a str),
}

/// Attribute change on a node. Carries the value after the change
/// (for `Removed`, the value that was removed).
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeEvent<'a> {
    Added { key: &'a str, value: &'a AttrValue },
    Modified { key: &'a str, value: &'a AttrValue },
    Removed { key: &'a str, value: &'a AttrValue },
}

/// Handle returned by listener registration, used for removal.
pub type ListenerToken = u64;

type NodeListenerFn = Arc<dyn Fn(&ConfigNode, &NodeEvent<'_>) + Send + Sync>;
type AttrListenerFn = Arc<dyn Fn(&ConfigNode, &AttributeEvent<'_>) + Send + Sync>;

struct Attribute {
    value: AttrValue,
    ranges: AttrRanges,
    flags: AttrFlags,
    description: String,
}

struct NodeInner {
    attributes: BTreeMap<String, Attribute>,
    node_listeners: Vec<(ListenerToken, NodeListenerFn)>,
    attr_listeners: Vec<(ListenerToken, AttrListenerFn)>,
    next_token: ListenerToken,
}

/// Guard grouping several attribute reads/writes into one atomic unit.
/// Holds the node's recursive transaction lock until dropped.
pub struct TransactionGuard<'a> {
    _guard: ReentrantMutexGuard<'a, RefCell<NodeInner>>,
}

/// A single node of the configuration tree.
pub struct ConfigNode {
    name: String,
    path: String,
    parent: Weak<ConfigNode>,
    children: RwLock<BTreeMap<String, Arc<ConfigNode>>>,
    inner: ReentrantMutex<RefCell<NodeInner>>,
}

// Listener dispatch marker: nodes currently firing listeners on this
// thread. Structural mutators assert they are not called back into.
thread_local! {
    static DISPATCHING: RefCell<Vec<*const ConfigNode>> = const { RefCell::new(Vec::new()) };
}

fn usage_error(func: &str, path: &str, key: &str, ty: AttrType, msg: &str) -> ! {
    tracing::error!(
        target: "config",
        "{func}(): node '{path}', attribute '{key}' (type '{ty}'): {msg}."
    );
    std::process::exit(1);
}

impl ConfigNode {
    pub(super) fn new_root() -> Arc<ConfigNode> {
        Arc::new(ConfigNode {
            name: String::new(),
            path: "/".to_owned(),
            parent: Weak::new(),
            children: RwLock::new(BTreeMap::new()),
            inner: ReentrantMutex::new(RefCell::new(NodeInner {
                attributes: BTreeMap::new(),
                node_listeners: Vec::new(),
                attr_listeners: Vec::new(),
                next_token: 1,
            })),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Slash-delimited absolute path, always ending in `/`. The root's
    /// path is `/`.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn parent(&self) -> Option<Arc<ConfigNode>> {
        self.parent.upgrade()
    }

    // ------------------------------------------------------------------
    // Structure
    // ------------------------------------------------------------------

    /// Get or create the child with the given name. Fires `ChildAdded`
    /// exactly once, on first creation. Atomic with respect to concurrent
    /// readers traversing this node.
    pub fn add_child(self: &Arc<Self>, name: &str) -> Arc<ConfigNode> {
        self.assert_not_dispatching();

        let mut children = self.children.write();

        if let Some(existing) = children.get(name) {
            return Arc::clone(existing);
        }

        let child = Arc::new(ConfigNode {
            name: name.to_owned(),
            path: format!("{}{}/", self.path, name),
            parent: Arc::downgrade(self),
            children: RwLock::new(BTreeMap::new()),
            inner: ReentrantMutex::new(RefCell::new(NodeInner {
                attributes: BTreeMap::new(),
                node_listeners: Vec::new(),
                attr_listeners: Vec::new(),
                next_token: 1,
            })),
        });

        children.insert(name.to_owned(), Arc::clone(&child));

        // Listener support (only on new addition). Node lock nests inside
        // the traversal lock, matching the global lock order.
        let guard = self.inner.lock();
        self.fire_node_event(&guard, NodeEvent::ChildAdded(name));
        drop(guard);

        child
    }

    /// Read-only child lookup.
    pub fn child(&self, name: &str) -> Option<Arc<ConfigNode>> {
        self.children.read().get(name).map(Arc::clone)
    }

    /// Resolve a relative path below this node, creating missing nodes
    /// along the way. A trailing slash is optional.
    ///
    /// # Panics
    ///
    /// Panics if the path is absolute.
    pub fn relative_node(self: &Arc<Self>, path: &str) -> Arc<ConfigNode> {
        assert!(
            !path.starts_with('/'),
            "relative paths must not start with '/', got '{path}'"
        );

        let mut current = Arc::clone(self);
        for component in path.split('/').filter(|c| !c.is_empty()) {
            current = current.add_child(component);
        }

        current
    }

    /// Snapshot of all children, sorted by name. The returned `Arc`s keep
    /// the children alive independently of later structural changes.
    pub fn children(&self) -> Vec<Arc<ConfigNode>> {
        self.children.read().values().map(Arc::clone).collect()
    }

    pub fn child_names(&self) -> Vec<String> {
        self.children.read().keys().cloned().collect()
    }

    /// Remove all attributes of this node (if `clear_start`) and of every
    /// node below it, firing `Removed` events top-down.
    pub fn clear_subtree(self: &Arc<Self>, clear_start: bool) {
        if clear_start {
            self.remove_all_attributes();
            self.remove_all_attribute_listeners();
        }

        for child in self.children() {
            child.clear_subtree(true);
        }
    }

    /// Remove this node and everything below it from the tree. Attribute
    /// `Removed` events fire top-down first, then `ChildRemoved` events
    /// fire bottom-up. The caller must guarantee nobody else is in the
    /// process of acquiring references into this subtree.
    pub fn remove_node(self: &Arc<Self>) {
        self.clear_subtree(true);
        self.remove_subtree();

        // The root itself is never fully removed, only emptied.
        if let Some(parent) = self.parent() {
            parent.remove_child(&self.name);
        }
    }

    fn remove_subtree(self: &Arc<Self>) {
        for child in self.children() {
            child.remove_subtree();
        }

        self.remove_all_children();
        self.remove_all_node_listeners();
    }

    fn remove_child(self: &Arc<Self>, name: &str) {
        self.assert_not_dispatching();

        let mut children = self.children.write();
        let guard = self.inner.lock();

        if children.remove(name).is_some() {
            self.fire_node_event(&guard, NodeEvent::ChildRemoved(name));
        }
    }

    fn remove_all_children(self: &Arc<Self>) {
        self.assert_not_dispatching();

        let mut children = self.children.write();
        let guard = self.inner.lock();

        for name in children.keys() {
            self.fire_node_event(&guard, NodeEvent::ChildRemoved(name.as_str()));
        }

        children.clear();
    }

    // ------------------------------------------------------------------
    // Attributes
    // ------------------------------------------------------------------

    /// Create an attribute with a default value, range, flags and
    /// description.
    ///
    /// On first creation fires `Added` with the default. Calling again for
    /// an existing key is idempotent: the stored type must match (anything
    /// else is a fatal usage error), and the stored value is kept if it
    /// still lies within the new range, else replaced by the new default
    /// with a `Modified` event.
    pub fn create_attribute(
        &self,
        key: &str,
        default: AttrValue,
        ranges: AttrRanges,
        flags: AttrFlags,
        description: &str,
    ) {
        let ty = default.attr_type();

        if ranges.attr_type() != ty {
            usage_error(
                "create_attribute",
                &self.path,
                key,
                ty,
                &format!("range is for type '{}'", ranges.attr_type()),
            );
        }

        // String length bounds are limited to i32::MAX so front-ends with
        // integer string lengths can represent them.
        if let AttrRanges::String {
            min_length,
            max_length,
        } = ranges
        {
            if min_length > i32::MAX as u32 || max_length > i32::MAX as u32 {
                usage_error(
                    "create_attribute",
                    &self.path,
                    key,
                    ty,
                    "minimum/maximum string range value outside allowed limits",
                );
            }
        }

        if !ranges.contains(&default) {
            usage_error(
                "create_attribute",
                &self.path,
                key,
                ty,
                &format!(
                    "default value '{}' is out of specified range",
                    default.to_value_string()
                ),
            );
        }

        // Restrict NOTIFY_ONLY to booleans, for button-like behavior.
        if flags.contains(AttrFlags::NOTIFY_ONLY) && ty != AttrType::Bool {
            usage_error(
                "create_attribute",
                &self.path,
                key,
                ty,
                "the NOTIFY_ONLY flag is set, but attribute is not of type bool",
            );
        }

        let guard = self.inner.lock();
        let mut inner = guard.borrow_mut();

        match inner.attributes.get(key) {
            None => {
                inner.attributes.insert(
                    key.to_owned(),
                    Attribute {
                        value: default.clone(),
                        ranges,
                        flags,
                        description: description.to_owned(),
                    },
                );
                drop(inner);

                self.fire_attr_event(
                    &guard,
                    AttributeEvent::Added {
                        key,
                        value: &default,
                    },
                );
            }
            Some(existing) => {
                if existing.value.attr_type() != ty {
                    usage_error(
                        "create_attribute",
                        &self.path,
                        key,
                        ty,
                        &format!(
                            "value with this key already exists and has a different type of '{}'",
                            existing.value.attr_type()
                        ),
                    );
                }

                // Keep the current value if it is still within the new
                // range; otherwise the new default is guaranteed to differ
                // from it, so listeners fire.
                let keep_old = ranges.contains(&existing.value);
                let value = if keep_old {
                    existing.value.clone()
                } else {
                    default.clone()
                };

                inner.attributes.insert(
                    key.to_owned(),
                    Attribute {
                        value: value.clone(),
                        ranges,
                        flags,
                        description: description.to_owned(),
                    },
                );
                drop(inner);

                if !keep_old {
                    self.fire_attr_event(&guard, AttributeEvent::Modified { key, value: &value });
                }
            }
        }
    }

    /// Whether an attribute with this key and type exists.
    pub fn attribute_exists(&self, key: &str, ty: AttrType) -> bool {
        let guard = self.inner.lock();
        let inner = guard.borrow();

        inner
            .attributes
            .get(key)
            .is_some_and(|a| a.value.attr_type() == ty)
    }

    /// Read an attribute's value. The attribute must exist with the
    /// requested type; anything else is a fatal usage error.
    pub fn get_attribute(&self, key: &str, ty: AttrType) -> AttrValue {
        let guard = self.inner.lock();
        let inner = guard.borrow();

        match inner.attributes.get(key) {
            Some(attr) if attr.value.attr_type() == ty => attr.value.clone(),
            _ => usage_error(
                "get_attribute",
                &self.path,
                key,
                ty,
                "attribute doesn't exist, you must create it first",
            ),
        }
    }

    /// Write an attribute. The attribute must exist with the value's type.
    /// Fails on read-only attributes and on range violations; fires
    /// `Modified` only when the stored value actually changed.
    pub fn put_attribute(&self, key: &str, value: AttrValue) -> Result<(), AttributeError> {
        self.put_attribute_impl(key, value, false)
    }

    /// The only way to modify an attribute whose read-only flag is set;
    /// symmetrically refuses attributes that are *not* read-only. Intended
    /// for device status publication.
    pub fn update_read_only(&self, key: &str, value: AttrValue) -> Result<(), AttributeError> {
        self.put_attribute_impl(key, value, true)
    }

    fn put_attribute_impl(
        &self,
        key: &str,
        value: AttrValue,
        force_read_only: bool,
    ) -> Result<(), AttributeError> {
        let ty = value.attr_type();

        let guard = self.inner.lock();
        let mut inner = guard.borrow_mut();

        let attr = match inner.attributes.get_mut(key) {
            Some(attr) if attr.value.attr_type() == ty => attr,
            _ => usage_error(
                "put_attribute",
                &self.path,
                key,
                ty,
                "attribute doesn't exist, you must create it first",
            ),
        };

        if attr.flags.contains(AttrFlags::READ_ONLY) != force_read_only {
            return Err(AttributeError::ReadOnly);
        }

        if !attr.ranges.contains(&value) {
            return Err(AttributeError::OutOfRange);
        }

        let changed = attr.value != value;
        attr.value = value.clone();
        drop(inner);

        if changed {
            self.fire_attr_event(&guard, AttributeEvent::Modified { key, value: &value });
        }

        Ok(())
    }

    /// Remove an attribute, firing `Removed`. Removing a non-existent
    /// attribute is a no-op (used to clean up before re-creating).
    pub fn remove_attribute(&self, key: &str, ty: AttrType) {
        let guard = self.inner.lock();
        let mut inner = guard.borrow_mut();

        let matches = inner
            .attributes
            .get(key)
            .is_some_and(|a| a.value.attr_type() == ty);
        if !matches {
            return;
        }

        let attr = inner.attributes.remove(key).expect("checked above");
        drop(inner);

        self.fire_attr_event(
            &guard,
            AttributeEvent::Removed {
                key,
                value: &attr.value,
            },
        );
    }

    pub fn remove_all_attributes(&self) {
        let guard = self.inner.lock();
        let mut inner = guard.borrow_mut();

        let attributes = std::mem::take(&mut inner.attributes);
        drop(inner);

        for (key, attr) in &attributes {
            self.fire_attr_event(
                &guard,
                AttributeEvent::Removed {
                    key,
                    value: &attr.value,
                },
            );
        }
    }

    // ------------------------------------------------------------------
    // Attribute introspection
    // ------------------------------------------------------------------

    pub fn attribute_keys(&self) -> Vec<String> {
        let guard = self.inner.lock();
        let inner = guard.borrow();
        inner.attributes.keys().cloned().collect()
    }

    /// There is at most one type per attribute key.
    pub fn attribute_type(&self, key: &str) -> Option<AttrType> {
        let guard = self.inner.lock();
        let inner = guard.borrow();
        inner.attributes.get(key).map(|a| a.value.attr_type())
    }

    pub fn attribute_ranges(&self, key: &str, ty: AttrType) -> AttrRanges {
        let guard = self.inner.lock();
        let inner = guard.borrow();

        match inner.attributes.get(key) {
            Some(attr) if attr.value.attr_type() == ty => attr.ranges,
            _ => usage_error(
                "attribute_ranges",
                &self.path,
                key,
                ty,
                "attribute doesn't exist, you must create it first",
            ),
        }
    }

    pub fn attribute_flags(&self, key: &str, ty: AttrType) -> AttrFlags {
        let guard = self.inner.lock();
        let inner = guard.borrow();

        match inner.attributes.get(key) {
            Some(attr) if attr.value.attr_type() == ty => attr.flags,
            _ => usage_error(
                "attribute_flags",
                &self.path,
                key,
                ty,
                "attribute doesn't exist, you must create it first",
            ),
        }
    }

    pub fn attribute_description(&self, key: &str, ty: AttrType) -> String {
        let guard = self.inner.lock();
        let inner = guard.borrow();

        match inner.attributes.get(key) {
            Some(attr) if attr.value.attr_type() == ty => attr.description.clone(),
            _ => usage_error(
                "attribute_description",
                &self.path,
                key,
                ty,
                "attribute doesn't exist, you must create it first",
            ),
        }
    }

    // ------------------------------------------------------------------
    // Typed convenience accessors
    // ------------------------------------------------------------------

    pub fn create_bool(&self, key: &str, default: bool, flags: AttrFlags, description: &str) {
        self.create_attribute(
            key,
            AttrValue::Bool(default),
            AttrRanges::Bool,
            flags,
            description,
        );
    }

    pub fn put_bool(&self, key: &str, value: bool) -> Result<(), AttributeError> {
        self.put_attribute(key, AttrValue::Bool(value))
    }

    pub fn get_bool(&self, key: &str) -> bool {
        match self.get_attribute(key, AttrType::Bool) {
            AttrValue::Bool(v) => v,
            _ => unreachable!("type checked by get_attribute"),
        }
    }

    pub fn create_byte(
        &self,
        key: &str,
        default: i8,
        min: i8,
        max: i8,
        flags: AttrFlags,
        description: &str,
    ) {
        self.create_attribute(
            key,
            AttrValue::Byte(default),
            AttrRanges::Byte { min, max },
            flags,
            description,
        );
    }

    pub fn put_byte(&self, key: &str, value: i8) -> Result<(), AttributeError> {
        self.put_attribute(key, AttrValue::Byte(value))
    }

    pub fn get_byte(&self, key: &str) -> i8 {
        match self.get_attribute(key, AttrType::Byte) {
            AttrValue::Byte(v) => v,
            _ => unreachable!("type checked by get_attribute"),
        }
    }

    pub fn create_short(
        &self,
        key: &str,
        default: i16,
        min: i16,
        max: i16,
        flags: AttrFlags,
        description: &str,
    ) {
        self.create_attribute(
            key,
            AttrValue::Short(default),
            AttrRanges::Short { min, max },
            flags,
            description,
        );
    }

    pub fn put_short(&self, key: &str, value: i16) -> Result<(), AttributeError> {
        self.put_attribute(key, AttrValue::Short(value))
    }

    pub fn get_short(&self, key: &str) -> i16 {
        match self.get_attribute(key, AttrType::Short) {
            AttrValue::Short(v) => v,
            _ => unreachable!("type checked by get_attribute"),
        }
    }

    pub fn create_int(
        &self,
        key: &str,
        default: i32,
        min: i32,
        max: i32,
        flags: AttrFlags,
        description: &str,
    ) {
        self.create_attribute(
            key,
            AttrValue::Int(default),
            AttrRanges::Int { min, max },
            flags,
            description,
        );
    }

    pub fn put_int(&self, key: &str, value: i32) -> Result<(), AttributeError> {
        self.put_attribute(key, AttrValue::Int(value))
    }

    pub fn get_int(&self, key: &str) -> i32 {
        match self.get_attribute(key, AttrType::Int) {
            AttrValue::Int(v) => v,
            _ => unreachable!("type checked by get_attribute"),
        }
    }

    pub fn create_long(
        &self,
        key: &str,
        default: i64,
        min: i64,
        max: i64,
        flags: AttrFlags,
        description: &str,
    ) {
        self.create_attribute(
            key,
            AttrValue::Long(default),
            AttrRanges::Long { min, max },
            flags,
            description,
        );
    }

    pub fn put_long(&self, key: &str, value: i64) -> Result<(), AttributeError> {
        self.put_attribute(key, AttrValue::Long(value))
    }

    pub fn get_long(&self, key: &str) -> i64 {
        match self.get_attribute(key, AttrType::Long) {
            AttrValue::Long(v) => v,
            _ => unreachable!("type checked by get_attribute"),
        }
    }

    pub fn create_float(
        &self,
        key: &str,
        default: f32,
        min: f32,
        max: f32,
        flags: AttrFlags,
        description: &str,
    ) {
        self.create_attribute(
            key,
            AttrValue::Float(default),
            AttrRanges::Float { min, max },
            flags,
            description,
        );
    }

    pub fn put_float(&self, key: &str, value: f32) -> Result<(), AttributeError> {
        self.put_attribute(key, AttrValue::Float(value))
    }

    pub fn get_float(&self, key: &str) -> f32 {
        match self.get_attribute(key, AttrType::Float) {
            AttrValue::Float(v) => v,
            _ => unreachable!("type checked by get_attribute"),
        }
    }

    pub fn create_double(
        &self,
        key: &str,
        default: f64,
        min: f64,
        max: f64,
        flags: AttrFlags,
        description: &str,
    ) {
        self.create_attribute(
            key,
            AttrValue::Double(default),
            AttrRanges::Double { min, max },
            flags,
            description,
        );
    }

    pub fn put_double(&self, key: &str, value: f64) -> Result<(), AttributeError> {
        self.put_attribute(key, AttrValue::Double(value))
    }

    pub fn get_double(&self, key: &str) -> f64 {
        match self.get_attribute(key, AttrType::Double) {
            AttrValue::Double(v) => v,
            _ => unreachable!("type checked by get_attribute"),
        }
    }

    pub fn create_string(
        &self,
        key: &str,
        default: &str,
        min_length: u32,
        max_length: u32,
        flags: AttrFlags,
        description: &str,
    ) {
        self.create_attribute(
            key,
            AttrValue::Str(default.to_owned()),
            AttrRanges::String {
                min_length,
                max_length,
            },
            flags,
            description,
        );
    }

    pub fn put_string(&self, key: &str, value: &str) -> Result<(), AttributeError> {
        self.put_attribute(key, AttrValue::Str(value.to_owned()))
    }

    pub fn get_string(&self, key: &str) -> String {
        match self.get_attribute(key, AttrType::String) {
            AttrValue::Str(v) => v,
            _ => unreachable!("type checked by get_attribute"),
        }
    }

    // ------------------------------------------------------------------
    // Listeners and transactions
    // ------------------------------------------------------------------

    pub fn add_node_listener(
        &self,
        listener: impl Fn(&ConfigNode, &NodeEvent<'_>) + Send + Sync + 'static,
    ) -> ListenerToken {
        let guard = self.inner.lock();
        let mut inner = guard.borrow_mut();

        let token = inner.next_token;
        inner.next_token += 1;
        inner.node_listeners.push((token, Arc::new(listener)));
        token
    }

    pub fn remove_node_listener(&self, token: ListenerToken) -> bool {
        let guard = self.inner.lock();
        let mut inner = guard.borrow_mut();

        let before = inner.node_listeners.len();
        inner.node_listeners.retain(|(t, _)| *t != token);
        inner.node_listeners.len() != before
    }

    pub fn remove_all_node_listeners(&self) {
        let guard = self.inner.lock();
        guard.borrow_mut().node_listeners.clear();
    }

    pub fn add_attribute_listener(
        &self,
        listener: impl Fn(&ConfigNode, &AttributeEvent<'_>) + Send + Sync + 'static,
    ) -> ListenerToken {
        let guard = self.inner.lock();
        let mut inner = guard.borrow_mut();

        let token = inner.next_token;
        inner.next_token += 1;
        inner.attr_listeners.push((token, Arc::new(listener)));
        token
    }

    pub fn remove_attribute_listener(&self, token: ListenerToken) -> bool {
        let guard = self.inner.lock();
        let mut inner = guard.borrow_mut();

        let before = inner.attr_listeners.len();
        inner.attr_listeners.retain(|(t, _)| *t != token);
        inner.attr_listeners.len() != before
    }

    pub fn remove_all_attribute_listeners(&self) {
        let guard = self.inner.lock();
        guard.borrow_mut().attr_listeners.clear();
    }

    /// Acquire the transaction lock explicitly to group several attribute
    /// reads/writes atomically. The lock is recursive, so the usual
    /// accessors keep working under the guard.
    pub fn transaction(&self) -> TransactionGuard<'_> {
        TransactionGuard {
            _guard: self.inner.lock(),
        }
    }

    // ------------------------------------------------------------------
    // Listener dispatch
    // ------------------------------------------------------------------

    fn fire_node_event(
        &self,
        guard: &ReentrantMutexGuard<'_, RefCell<NodeInner>>,
        event: NodeEvent<'_>,
    ) {
        let listeners: Vec<NodeListenerFn> = guard
            .borrow()
            .node_listeners
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();

        self.dispatch(|| {
            for listener in &listeners {
                listener(self, &event);
            }
        });
    }

    fn fire_attr_event(
        &self,
        guard: &ReentrantMutexGuard<'_, RefCell<NodeInner>>,
        event: AttributeEvent<'_>,
    ) {
        let listeners: Vec<AttrListenerFn> = guard
            .borrow()
            .attr_listeners
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();

        self.dispatch(|| {
            for listener in &listeners {
                listener(self, &event);
            }
        });
    }

    fn dispatch(&self, f: impl FnOnce()) {
        let ptr = self as *const ConfigNode;
        DISPATCHING.with(|d| d.borrow_mut().push(ptr));
        f();
        DISPATCHING.with(|d| {
            d.borrow_mut().pop();
        });
    }

    fn assert_not_dispatching(&self) {
        if cfg!(debug_assertions) {
            let ptr = self as *const ConfigNode;
            DISPATCHING.with(|d| {
                debug_assert!(
                    !d.borrow().contains(&ptr),
                    "listener attempted structural mutation of node '{}' while its lock is held",
                    self.path
                );
            });
        }
    }
}

impl std::fmt::Debug for ConfigNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigNode")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}
