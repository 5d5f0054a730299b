// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Hierarchical, typed, thread-safe configuration store.
//!
//! Every piece of declarative configuration and runtime-visible status in
//! the system lives in this tree: nodes are addressed by slash-delimited
//! paths, hold typed attributes with ranges and flags, and notify
//! registered listeners of changes. The tree is the only long-lived
//! structure shared between the plan-builder thread, listener callbacks
//! and status publishers, so its locking rules (see [`ConfigNode`]) are
//! load-bearing for the whole host.

mod node;
mod tree;
mod value;
mod xml;

pub use node::{
    AttributeError, AttributeEvent, ConfigNode, ListenerToken, NodeEvent, TransactionGuard,
};
pub use tree::ConfigTree;
pub use value::{AttrFlags, AttrRanges, AttrType, AttrValue};
pub use xml::{export_to_writer, import_from_reader, XmlError};
