// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Self-describing module interface.
//!
//! Every loadable module exports a [`ModuleDeclaration`] under the
//! [`MODULE_ENTRY_SYMBOL`] name (use the `export_module!` macro from the
//! `evflow-plugin-abi` crate). The declaration yields a
//! [`ModuleDescriptor`]: the module's kind, its declared input/output
//! event streams and its lifecycle callbacks. The host validates the
//! descriptor before the module ever runs; the structural rules live in
//! [`crate::validate`].

use std::any::Any;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::ConfigNode;

/// Current module ABI version. Loaded plugins must match this exactly.
///
/// Increment when making breaking changes to the module interface.
pub const MODULE_ABI_VERSION: u32 = 1;

/// Symbol name a plugin exports its [`ModuleDeclaration`] under.
pub const MODULE_ENTRY_SYMBOL: &[u8] = b"EVFLOW_MODULE";

/// Wildcard value for stream declarations: "any type" / "any number".
pub const ANY: i16 = -1;

/// What a module does with event streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModuleKind {
    /// Produces streams only (devices, file readers).
    Input,
    /// Consumes streams only (file writers, network sinks, visualizers).
    Output,
    /// Consumes streams and optionally produces new ones.
    Processor,
}

/// One declared input stream.
///
/// `type_id == ANY` accepts any type and must be the only declaration;
/// `number == ANY` accepts any count of connected streams of that type.
/// A read-only input promises the module never mutates the packets, which
/// lets the router share slots instead of copying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputStreamDecl {
    pub type_id: i16,
    pub number: i16,
    pub read_only: bool,
}

impl InputStreamDecl {
    pub fn new(type_id: i16, number: i16, read_only: bool) -> Self {
        Self {
            type_id,
            number,
            read_only,
        }
    }

    /// Any type, any number.
    pub fn any(read_only: bool) -> Self {
        Self::new(ANY, ANY, read_only)
    }
}

/// One declared output stream. `type_id == ANY` means the module cannot
/// statically name its outputs (e.g. file playback) and the concrete types
/// come from the `moduleOutput` configuration attribute instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputStreamDecl {
    pub type_id: i16,
}

impl OutputStreamDecl {
    pub fn new(type_id: i16) -> Self {
        Self { type_id }
    }

    pub fn any() -> Self {
        Self::new(ANY)
    }
}

/// Per-instance state handed to lifecycle callbacks.
pub struct ModuleContext {
    pub module_id: i16,
    pub config_node: Arc<ConfigNode>,
    /// Module-private state, created by `init` and dropped after `exit`.
    pub state: Option<Box<dyn Any + Send>>,
    config_update: Arc<AtomicU32>,
}

impl ModuleContext {
    pub fn new(module_id: i16, config_node: Arc<ConfigNode>) -> Self {
        Self {
            module_id,
            config_node,
            state: None,
            config_update: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Register the default configuration listener: any attribute change
    /// on the module's node marks the context as needing a
    /// `config_update` call. Returns the token for later removal.
    pub fn install_default_config_listener(&self) -> crate::config::ListenerToken {
        let flag = Arc::clone(&self.config_update);

        self.config_node.add_attribute_listener(move |_, event| {
            if matches!(event, crate::config::AttributeEvent::Modified { .. }) {
                flag.store(1, Ordering::Relaxed);
            }
        })
    }

    /// Consume the pending-configuration flag. Returns whether a change
    /// happened since the last call.
    pub fn take_config_update(&self) -> bool {
        self.config_update.swap(0, Ordering::Relaxed) != 0
    }
}

/// Lifecycle callbacks. Only `run` is mandatory.
#[derive(Debug, Clone, Copy)]
pub struct ModuleLifecycle {
    /// Called once before the first run. Returning `false` fails startup.
    pub init: Option<fn(&mut ModuleContext) -> bool>,
    /// Called on every dispatch cycle.
    pub run: fn(&mut ModuleContext),
    /// Called when the module's configuration subtree changed.
    pub config_update: Option<fn(&mut ModuleContext)>,
    /// Called once at shutdown.
    pub exit: Option<fn(&mut ModuleContext)>,
    /// Called when the given upstream source was reset.
    pub reset: Option<fn(&mut ModuleContext, i16)>,
}

impl ModuleLifecycle {
    pub fn new(run: fn(&mut ModuleContext)) -> Self {
        Self {
            init: None,
            run,
            config_update: None,
            exit: None,
            reset: None,
        }
    }

    pub fn with_init(mut self, init: fn(&mut ModuleContext) -> bool) -> Self {
        self.init = Some(init);
        self
    }

    pub fn with_config_update(mut self, config_update: fn(&mut ModuleContext)) -> Self {
        self.config_update = Some(config_update);
        self
    }

    pub fn with_exit(mut self, exit: fn(&mut ModuleContext)) -> Self {
        self.exit = Some(exit);
        self
    }

    pub fn with_reset(mut self, reset: fn(&mut ModuleContext, i16)) -> Self {
        self.reset = Some(reset);
        self
    }
}

/// Module metadata, produced by the plugin, consumed by the host.
#[derive(Debug, Clone)]
pub struct ModuleDescriptor {
    /// Must equal [`MODULE_ABI_VERSION`].
    pub api_version: u32,
    pub name: String,
    pub description: String,
    pub kind: ModuleKind,
    /// Bytes of per-instance state the dispatcher reserves up front.
    pub state_size: usize,
    pub lifecycle: ModuleLifecycle,
    pub input_streams: Vec<InputStreamDecl>,
    pub output_streams: Vec<OutputStreamDecl>,
}

impl ModuleDescriptor {
    pub fn new(name: impl Into<String>, kind: ModuleKind, lifecycle: ModuleLifecycle) -> Self {
        Self {
            api_version: MODULE_ABI_VERSION,
            name: name.into(),
            description: String::new(),
            kind,
            state_size: 0,
            lifecycle,
            input_streams: Vec::new(),
            output_streams: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_state_size(mut self, state_size: usize) -> Self {
        self.state_size = state_size;
        self
    }

    pub fn with_input_stream(mut self, decl: InputStreamDecl) -> Self {
        self.input_streams.push(decl);
        self
    }

    pub fn with_output_stream(mut self, decl: OutputStreamDecl) -> Self {
        self.output_streams.push(decl);
        self
    }

    /// Whether the declared outputs are the single wildcard declaration.
    pub fn has_wildcard_output(&self) -> bool {
        self.output_streams.len() == 1 && self.output_streams[0].type_id == ANY
    }
}

/// Declaration exported by a module dylib under [`MODULE_ENTRY_SYMBOL`].
///
/// The host verifies `abi_version` before calling `info`. Module dylibs
/// must be built with the same toolchain as the host; the declaration is
/// the only symbol crossing the boundary.
#[repr(C)]
pub struct ModuleDeclaration {
    pub abi_version: u32,
    pub info: fn() -> ModuleDescriptor,
}

// Safety: a version number and a function pointer.
unsafe impl Send for ModuleDeclaration {}
unsafe impl Sync for ModuleDeclaration {}
