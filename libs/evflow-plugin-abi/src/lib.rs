// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Module export surface for evflow dynamic plugins.
//!
//! A plugin is a dylib exporting one [`ModuleDeclaration`] under the
//! well-known symbol name; the host loads it, checks the ABI version and
//! reads the module descriptor. Use [`export_module!`] to generate the
//! symbol correctly.
//!
//! # Example plugin
//!
//! ```ignore
//! use evflow_plugin_abi::export_module;
//! use evflow::{InputStreamDecl, ModuleDescriptor, ModuleKind, ModuleLifecycle};
//!
//! fn run(ctx: &mut evflow::module::ModuleContext) {
//!     // filter packets...
//! }
//!
//! fn info() -> ModuleDescriptor {
//!     ModuleDescriptor::new("bgfilter", ModuleKind::Processor, ModuleLifecycle::new(run))
//!         .with_description("Background activity filter")
//!         .with_input_stream(InputStreamDecl::new(0, 1, false))
//! }
//!
//! export_module!(info);
//! ```
//!
//! # Plugin Cargo.toml
//!
//! ```toml
//! [lib]
//! crate-type = ["cdylib"]
//!
//! [dependencies]
//! evflow = "0.3"
//! evflow-plugin-abi = "0.3"
//! ```
//!
//! Plugins must be built with the same toolchain as the host; the
//! declaration is the only symbol crossing the boundary.

pub use evflow::module::{
    InputStreamDecl, ModuleContext, ModuleDeclaration, ModuleDescriptor, ModuleKind,
    ModuleLifecycle, OutputStreamDecl, MODULE_ABI_VERSION, MODULE_ENTRY_SYMBOL,
};

/// Export a module for dynamic loading.
///
/// Generates the `EVFLOW_MODULE` symbol the host looks for when loading
/// plugin libraries. The argument is a function returning the module's
/// [`ModuleDescriptor`].
#[macro_export]
macro_rules! export_module {
    ($info_fn:path) => {
        #[unsafe(no_mangle)]
        pub static EVFLOW_MODULE: $crate::ModuleDeclaration = $crate::ModuleDeclaration {
            abi_version: $crate::MODULE_ABI_VERSION,
            info: $info_fn,
        };
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(_ctx: &mut ModuleContext) {}

    fn info() -> ModuleDescriptor {
        ModuleDescriptor::new("noop-sink", ModuleKind::Output, ModuleLifecycle::new(run))
            .with_input_stream(InputStreamDecl::any(true))
    }

    export_module!(info);

    #[test]
    fn test_exported_declaration_shape() {
        assert_eq!(EVFLOW_MODULE.abi_version, MODULE_ABI_VERSION);

        let descriptor = (EVFLOW_MODULE.info)();
        assert_eq!(descriptor.name, "noop-sink");
        assert_eq!(descriptor.kind, ModuleKind::Output);
    }
}
