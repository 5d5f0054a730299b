// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Module plugin discovery and loading.
//!
//! Scans a search directory (recursively) for shared-object artifacts and
//! loads them on demand. Loaded libraries stay alive for the lifetime of
//! the registry; dropping them would unload code the plan still points
//! into.

use std::path::{Path, PathBuf};

use libloading::Library;

use crate::error::{BuildError, Result};
use crate::module::{ModuleDeclaration, ModuleDescriptor, MODULE_ABI_VERSION, MODULE_ENTRY_SYMBOL};

/// Source of module descriptors, keyed by the configured library stem.
///
/// The plan builder only talks to this trait; [`PluginRegistry`] is the
/// production implementation, tests substitute an in-memory table.
pub trait DescriptorSource {
    fn resolve(&mut self, module_name: &str, library: &str) -> Result<ModuleDescriptor>;
}

/// Registry over the plugin artifacts found on the module search path.
pub struct PluginRegistry {
    artifacts: Vec<PathBuf>,
    // Must remain alive while any plan references plugin code.
    loaded: Vec<Library>,
}

impl PluginRegistry {
    /// Recursively scan `search_path` for `<stem>.so` / `<stem>.dll`
    /// artifacts. The result is sorted and deduplicated.
    pub fn scan(search_path: &Path) -> std::io::Result<PluginRegistry> {
        let mut artifacts = Vec::new();
        collect_artifacts(search_path, &mut artifacts)?;

        artifacts.sort();
        artifacts.dedup();

        tracing::debug!(
            target: "registry",
            "found {} module artifact(s) under '{}'",
            artifacts.len(),
            search_path.display()
        );

        Ok(PluginRegistry {
            artifacts,
            loaded: Vec::new(),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }

    pub fn artifact_count(&self) -> usize {
        self.artifacts.len()
    }

    fn find_artifact(&self, stem: &str) -> Option<&PathBuf> {
        self.artifacts
            .iter()
            .find(|p| p.file_stem().and_then(|s| s.to_str()) == Some(stem))
    }
}

impl DescriptorSource for PluginRegistry {
    /// Load the artifact whose stem matches `library` and extract its
    /// descriptor through the [`MODULE_ENTRY_SYMBOL`] declaration.
    fn resolve(&mut self, module_name: &str, library: &str) -> Result<ModuleDescriptor> {
        let path = self
            .find_artifact(library)
            .ok_or_else(|| BuildError::PluginNotFound {
                module: module_name.to_owned(),
                library: library.to_owned(),
            })?
            .clone();

        tracing::info!(
            target: "registry",
            "module '{}': loading module library '{}'",
            module_name,
            path.display()
        );

        let lib = unsafe {
            Library::new(&path).map_err(|e| BuildError::PluginLoadFailed {
                module: module_name.to_owned(),
                library: library.to_owned(),
                reason: e.to_string(),
            })?
        };

        let declaration: &ModuleDeclaration = unsafe {
            let symbol = lib
                .get::<*const ModuleDeclaration>(MODULE_ENTRY_SYMBOL)
                .map_err(|e| BuildError::PluginLoadFailed {
                    module: module_name.to_owned(),
                    library: library.to_owned(),
                    reason: format!(
                        "failed to find module entry symbol, ensure the plugin uses the export_module! macro: {e}"
                    ),
                })?;
            &**symbol
        };

        if declaration.abi_version != MODULE_ABI_VERSION {
            return Err(BuildError::DescriptorInvalid {
                module: module_name.to_owned(),
                reason: format!(
                    "ABI version mismatch: plugin has v{}, host expects v{}",
                    declaration.abi_version, MODULE_ABI_VERSION
                ),
            });
        }

        let descriptor = (declaration.info)();

        if descriptor.api_version != MODULE_ABI_VERSION {
            return Err(BuildError::DescriptorInvalid {
                module: module_name.to_owned(),
                reason: format!(
                    "descriptor API version mismatch: descriptor has v{}, host expects v{}",
                    descriptor.api_version, MODULE_ABI_VERSION
                ),
            });
        }

        // Keep the library alive; unloading would invalidate the
        // descriptor's lifecycle function pointers.
        self.loaded.push(lib);

        Ok(descriptor)
    }
}

fn is_artifact_name(name: &str) -> bool {
    let Some((stem, extension)) = name.rsplit_once('.') else {
        return false;
    };

    if extension != "so" && extension != "dll" {
        return false;
    }

    !stem.is_empty() && stem.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn collect_artifacts(dir: &Path, out: &mut Vec<PathBuf>) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;

        if file_type.is_dir() {
            collect_artifacts(&path, out)?;
        } else if file_type.is_file() {
            let matches = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(is_artifact_name);

            if matches {
                out.push(path);
            }
        }
    }

    Ok(())
}
