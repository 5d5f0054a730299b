// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Error types for plan construction.
//!
//! Every failure during a plan build is a [`BuildError`]; all of them are
//! user-facing configuration or plugin problems except
//! [`BuildError::InternalInconsistency`], which indicates a bug in the
//! resolver itself. The build driver tears down all partial state before
//! reporting, so no error here ever leaves a half-built plan behind.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BuildError {
    #[error("module '{module}': no plugin artifact '{library}' found on the search path")]
    PluginNotFound { module: String, library: String },

    #[error("module '{module}': failed to load plugin '{library}': {reason}")]
    PluginLoadFailed {
        module: String,
        library: String,
        reason: String,
    },

    #[error("module '{module}': invalid descriptor: {reason}")]
    DescriptorInvalid { module: String, reason: String },

    #[error("module '{module}': invalid '{attribute}' attribute: {reason}")]
    WiringParseError {
        module: String,
        attribute: &'static str,
        reason: String,
    },

    #[error("module '{module}': referenced module ID {id} does not exist")]
    UnknownModuleId { module: String, id: i16 },

    #[error("module '{module}': duplicate producer clause for module ID {source_id}")]
    DuplicateProducerClause { module: String, source_id: i16 },

    #[error("module '{module}': unknown event stream ({source_id}, {type_id})")]
    UnknownStream {
        module: String,
        source_id: i16,
        type_id: i16,
    },

    #[error("module '{module}': {reason}")]
    CardinalityMismatch { module: String, reason: String },

    #[error(
        "module '{module}': invalid afterModuleID {after} for stream ({source_id}, {type_id}): {reason}"
    )]
    InvalidAfterModule {
        module: String,
        after: i16,
        source_id: i16,
        type_id: i16,
        reason: String,
    },

    #[error("found cycle in stream ({source_id}, {type_id}): {reason}")]
    IntraStreamCycle {
        source_id: i16,
        type_id: i16,
        reason: String,
    },

    #[error(
        "found dependency cycle involving multiple streams between modules '{first_name}' (ID {first}) and '{second_name}' (ID {second})"
    )]
    CrossStreamCycle {
        first: i16,
        first_name: String,
        second: i16,
        second_name: String,
    },

    #[error("{reason}")]
    DeadInputModule { reason: String },

    #[error("no valid modules configuration found")]
    NoModulesConfigured,

    #[error(
        "{reason}. This should never happen, please report this to the developers and attach your XML configuration file"
    )]
    InternalInconsistency { reason: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type that uses BuildError.
pub type Result<T> = std::result::Result<T, BuildError>;
