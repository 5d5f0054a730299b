// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Structural validation of module descriptors.
//!
//! Runs on every descriptor before any wiring is parsed. Violations are
//! fatal for the current plan build and reported with the offending
//! module name.

use crate::config::{AttrType, ConfigNode};
use crate::error::{BuildError, Result};
use crate::module::{InputStreamDecl, ModuleDescriptor, ModuleKind, OutputStreamDecl, ANY};

fn invalid(module: &str, reason: impl Into<String>) -> BuildError {
    BuildError::DescriptorInvalid {
        module: module.to_owned(),
        reason: reason.into(),
    }
}

/// Enforce the per-kind and per-array invariants on a descriptor.
pub fn validate_descriptor(module: &str, descriptor: &ModuleDescriptor) -> Result<()> {
    validate_kind(module, descriptor)?;

    if !descriptor.input_streams.is_empty() {
        validate_input_streams(module, &descriptor.input_streams)?;
    }

    if !descriptor.output_streams.is_empty() {
        validate_output_streams(module, &descriptor.output_streams)?;
    }

    Ok(())
}

fn validate_kind(module: &str, descriptor: &ModuleDescriptor) -> Result<()> {
    match descriptor.kind {
        ModuleKind::Input => {
            if !descriptor.input_streams.is_empty() || descriptor.output_streams.is_empty() {
                return Err(invalid(
                    module,
                    "wrong I/O event stream definitions for kind Input",
                ));
            }
        }
        ModuleKind::Output => {
            if descriptor.input_streams.is_empty() || !descriptor.output_streams.is_empty() {
                return Err(invalid(
                    module,
                    "wrong I/O event stream definitions for kind Output",
                ));
            }

            // All input streams of an output module must be read-only.
            if descriptor.input_streams.iter().any(|s| !s.read_only) {
                return Err(invalid(
                    module,
                    "input event streams not marked read-only for kind Output",
                ));
            }
        }
        ModuleKind::Processor => {
            if descriptor.input_streams.is_empty() {
                return Err(invalid(
                    module,
                    "wrong I/O event stream definitions for kind Processor",
                ));
            }

            // With no output streams, at least one input must be writable,
            // else the module cannot affect anything.
            if descriptor.output_streams.is_empty()
                && descriptor.input_streams.iter().all(|s| s.read_only)
            {
                return Err(invalid(
                    module,
                    "no output streams and all input streams are marked read-only for kind Processor",
                ));
            }
        }
    }

    Ok(())
}

/// Type must be either ANY or well defined (0..=i16::MAX). Number must be
/// either ANY or at least 1; zero is not allowed. The array must be
/// strictly ascending by type ID (which also forbids duplicates). An ANY
/// type must be the only declaration and pairs only with number ANY or 1
/// (1-of-any-type is useful; N-of-any-type is not).
fn validate_input_streams(module: &str, streams: &[InputStreamDecl]) -> Result<()> {
    for (i, decl) in streams.iter().enumerate() {
        if decl.type_id < ANY {
            return Err(invalid(module, "input stream has invalid type value"));
        }

        if decl.number < ANY || decl.number == 0 {
            return Err(invalid(module, "input stream has invalid number value"));
        }

        if i > 0 && streams[i - 1].type_id >= decl.type_id {
            return Err(invalid(
                module,
                "input stream has invalid order of declaration or duplicates",
            ));
        }

        if decl.type_id == ANY && ((decl.number != ANY && decl.number != 1) || streams.len() != 1) {
            return Err(invalid(module, "input stream has invalid any declaration"));
        }
    }

    Ok(())
}

/// Type must be either ANY or well defined (0..=i16::MAX). An ANY type
/// must be the only declaration; otherwise the array must be strictly
/// ascending by type ID.
fn validate_output_streams(module: &str, streams: &[OutputStreamDecl]) -> Result<()> {
    if streams.len() == 1 && streams[0].type_id == ANY {
        return Ok(());
    }

    for (i, decl) in streams.iter().enumerate() {
        if decl.type_id < 0 {
            return Err(invalid(module, "output stream has invalid type value"));
        }

        if i > 0 && streams[i - 1].type_id >= decl.type_id {
            return Err(invalid(
                module,
                "output stream has invalid order of declaration or duplicates",
            ));
        }
    }

    Ok(())
}

/// Check presence of the `moduleInput`/`moduleOutput` configuration
/// attributes against what the module kind requires.
pub fn validate_wiring_attributes(
    module: &str,
    descriptor: &ModuleDescriptor,
    config_node: &ConfigNode,
) -> Result<()> {
    let has_input_attr = config_node.attribute_exists("moduleInput", AttrType::String);
    let has_output_attr = config_node.attribute_exists("moduleOutput", AttrType::String);

    if descriptor.kind == ModuleKind::Input {
        if has_input_attr {
            return Err(invalid(
                module,
                "Input kind cannot have a 'moduleInput' attribute",
            ));
        }
    } else if !has_input_attr {
        return Err(invalid(
            module,
            "Output/Processor kinds must have a 'moduleInput' attribute",
        ));
    }

    if descriptor.kind == ModuleKind::Output {
        if has_output_attr {
            return Err(invalid(
                module,
                "Output kind cannot have a 'moduleOutput' attribute",
            ));
        }
    } else if descriptor.has_wildcard_output() && !has_output_attr {
        // Modules that cannot statically name their outputs need the
        // configuration to do it for them.
        return Err(invalid(
            module,
            "Input/Processor kinds with an any-type output declaration must have a 'moduleOutput' attribute",
        ));
    }

    Ok(())
}
