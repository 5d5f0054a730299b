// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Execution-plan construction.
//!
//! Turns the declarative configuration under `/` plus the loaded module
//! descriptors into a validated [`ExecutionPlan`]: a total execution order
//! over all modules and a routing table binding every producer output and
//! consumer input to shared event slots. Any validation, parsing or
//! resolution error fails the whole build; nothing partial survives, as
//! the builder's state is one value that is dropped on the error path.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::config::{AttrType, ConfigNode, ConfigTree};
use crate::error::{BuildError, Result};
use crate::module::{ModuleDescriptor, ModuleKind};
use crate::registry::DescriptorSource;
use crate::resolver;
use crate::routing;
use crate::streams::{self, ActiveStream};
use crate::validate;
use crate::wiring::{self, OrderedInput, ParseError};

/// Name of the system configuration node under `/`; every other child of
/// the root is a module configuration.
pub const SYSTEM_NODE_NAME: &str = "evflow";

/// A consumer input bound to a slot. `copy_from` names the slot the
/// runtime must copy into this one before the module runs; `None` means
/// the module works on the shared data directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputSlot {
    pub slot: usize,
    pub copy_from: Option<usize>,
}

/// One configured module with everything the dispatcher needs to run it.
#[derive(Debug)]
pub struct ModuleInstance {
    pub id: i16,
    pub name: String,
    pub library: String,
    pub config_node: Arc<ConfigNode>,
    pub descriptor: ModuleDescriptor,
    /// Parsed `moduleInput`: per source module, the ordered inputs taken
    /// from it.
    pub input_definition: BTreeMap<i16, Vec<OrderedInput>>,
    /// Produced types and their assigned output slots.
    pub outputs: BTreeMap<i16, Option<usize>>,
    /// Input slot bindings, ordered ascending by slot.
    pub inputs: Vec<InputSlot>,
}

/// A validated plan: module table, active streams, total execution order
/// and slot routing.
#[derive(Debug)]
pub struct ExecutionPlan {
    pub modules: BTreeMap<i16, ModuleInstance>,
    pub streams: Vec<ActiveStream>,
    /// Global execution order; contains every module exactly once.
    pub order: Vec<i16>,
    pub slot_count: usize,
    pub copy_count: usize,
}

impl ExecutionPlan {
    pub fn module_exists(&self, id: i16) -> bool {
        self.modules.contains_key(&id)
    }

    pub fn module_kind(&self, id: i16) -> Option<ModuleKind> {
        self.modules.get(&id).map(|m| m.descriptor.kind)
    }

    pub fn stream_exists(&self, source_id: i16, type_id: i16) -> bool {
        streams::find(&self.streams, source_id, type_id).is_some()
    }

    /// Look up a module by ID, verifying its configured short name and
    /// kind match the caller's expectation.
    pub fn find_module(&self, id: i16, name: &str, kind: ModuleKind) -> Option<&ModuleInstance> {
        self.modules
            .get(&id)
            .filter(|m| m.name == name && m.descriptor.kind == kind)
    }

    /// Configuration node of the module producing with the given ID.
    pub fn source_node(&self, source_id: i16) -> Option<Arc<ConfigNode>> {
        self.modules
            .get(&source_id)
            .map(|m| Arc::clone(&m.config_node))
    }

    /// The `sourceInfo/` child of a source's configuration node, where
    /// input modules publish device geometry and similar read-only facts.
    pub fn source_info_node(&self, source_id: i16) -> Option<Arc<ConfigNode>> {
        self.source_node(source_id)
            .map(|n| n.relative_node("sourceInfo/"))
    }

    /// Machine-readable plan summary, for config front-ends and debug
    /// tooling.
    pub fn summary(&self) -> PlanSummary {
        PlanSummary {
            order: self.order.clone(),
            slot_count: self.slot_count,
            copy_count: self.copy_count,
            modules: self
                .order
                .iter()
                .map(|id| {
                    let module = &self.modules[id];
                    ModuleSummary {
                        id: module.id,
                        name: module.name.clone(),
                        library: module.library.clone(),
                        kind: module.descriptor.kind,
                        inputs: module
                            .inputs
                            .iter()
                            .map(|i| (i.slot, i.copy_from))
                            .collect(),
                        outputs: module
                            .outputs
                            .iter()
                            .filter_map(|(t, slot)| slot.map(|s| (*t, s)))
                            .collect(),
                    }
                })
                .collect(),
            streams: self
                .streams
                .iter()
                .map(|s| StreamSummary {
                    source_id: s.source_id,
                    type_id: s.type_id,
                    users: s.users.clone(),
                })
                .collect(),
        }
    }

    /// Log the whole plan at debug level.
    pub fn trace_plan(&self) {
        tracing::debug!(
            target: "mainloop",
            "global order: {:?}, {} slot(s), {} copy(ies)",
            self.order,
            self.slot_count,
            self.copy_count
        );

        for stream in &self.streams {
            tracing::debug!(
                target: "mainloop",
                "stream ({}, {}) processor-output: {} users: {:?}",
                stream.source_id,
                stream.type_id,
                stream.is_processor_output,
                stream.users
            );

            if let Some(tree) = &stream.dep_tree {
                tree.trace("");
            }
        }

        for id in &self.order {
            let module = &self.modules[id];
            tracing::debug!(
                target: "mainloop",
                "{}-MOD: {:?} - {} in: {:?} out: {:?}",
                module.id,
                module.descriptor.kind,
                module.name,
                module.inputs,
                module.outputs
            );
        }
    }
}

/// Serializable view of a built plan.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PlanSummary {
    pub order: Vec<i16>,
    pub slot_count: usize,
    pub copy_count: usize,
    pub modules: Vec<ModuleSummary>,
    pub streams: Vec<StreamSummary>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ModuleSummary {
    pub id: i16,
    pub name: String,
    pub library: String,
    pub kind: ModuleKind,
    /// `(slot, copy_from)` pairs, ordered ascending by slot.
    pub inputs: Vec<(usize, Option<usize>)>,
    /// `(type, slot)` pairs for active output streams.
    pub outputs: Vec<(i16, usize)>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct StreamSummary {
    pub source_id: i16,
    pub type_id: i16,
    pub users: Vec<i16>,
}

impl PlanSummary {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

struct PendingModule {
    id: i16,
    name: String,
    library: String,
    node: Arc<ConfigNode>,
}

fn wiring_error(module: &str, attribute: &'static str, err: ParseError) -> BuildError {
    match err {
        ParseError::DuplicateProducer(source) => BuildError::DuplicateProducerClause {
            module: module.to_owned(),
            source_id: source,
        },
        ParseError::Grammar(reason) => BuildError::WiringParseError {
            module: module.to_owned(),
            attribute,
            reason,
        },
    }
}

/// Build an execution plan from the module configurations under the
/// tree's root, resolving descriptors through `source`.
pub fn build(tree: &ConfigTree, source: &mut dyn DescriptorSource) -> Result<ExecutionPlan> {
    let pending = collect_module_configs(tree)?;

    tracing::info!(target: "mainloop", "{} module(s) found", pending.len());

    let mut modules = load_and_validate(pending, source)?;

    check_module_population(&modules)?;

    let mut active_streams = collect_output_streams(&mut modules)?;

    parse_input_wiring(&mut modules, &mut active_streams)?;

    // Streams nobody consumes carry no data.
    active_streams.retain(|s| !s.users.is_empty());

    check_connected_inputs(&modules, &active_streams)?;
    check_tap_points(&modules, &active_streams)?;

    for stream in &active_streams {
        streams::check_for_cycles(stream)?;
    }

    let order = resolve_global_order(&modules, &mut active_streams)?;

    // Copy analysis below walks stream users strictly in execution order.
    let position: HashMap<i16, usize> = order.iter().enumerate().map(|(i, &m)| (m, i)).collect();
    for stream in &mut active_streams {
        stream.users.sort_by_key(|u| position[u]);
    }

    let (slot_count, copy_count) = routing::assign_slots(&mut modules, &active_streams, &order)?;

    let plan = ExecutionPlan {
        modules,
        streams: active_streams,
        order,
        slot_count,
        copy_count,
    };

    plan.trace_plan();

    Ok(plan)
}

/// Each child of `/` except the system node is a module configuration
/// carrying `moduleId` and `moduleLibrary`. Malformed entries are logged
/// and skipped; an empty collection fails the build.
fn collect_module_configs(tree: &ConfigTree) -> Result<BTreeMap<i16, PendingModule>> {
    let mut pending = BTreeMap::new();

    for node in tree.root().children() {
        let name = node.name().to_owned();

        if name == SYSTEM_NODE_NAME {
            continue;
        }

        if !node.attribute_exists("moduleId", AttrType::Short)
            || !node.attribute_exists("moduleLibrary", AttrType::String)
        {
            tracing::error!(
                target: "mainloop",
                "module '{name}': configuration is missing core attributes 'moduleId' and/or 'moduleLibrary'"
            );
            continue;
        }

        let id = node.get_short("moduleId");
        let library = node.get_string("moduleLibrary");

        if pending.contains_key(&id) {
            tracing::error!(
                target: "mainloop",
                "module '{name}': module with ID {id} already exists"
            );
            continue;
        }

        pending.insert(
            id,
            PendingModule {
                id,
                name,
                library,
                node,
            },
        );
    }

    if pending.is_empty() {
        return Err(BuildError::NoModulesConfigured);
    }

    Ok(pending)
}

/// Resolve every module's descriptor and validate it. All modules are
/// checked in one go so the user sees every broken module at once; the
/// first error is returned after the sweep.
fn load_and_validate(
    pending: BTreeMap<i16, PendingModule>,
    source: &mut dyn DescriptorSource,
) -> Result<BTreeMap<i16, ModuleInstance>> {
    let mut modules = BTreeMap::new();
    let mut first_error = None;

    for (id, entry) in pending {
        let resolved = source.resolve(&entry.name, &entry.library).and_then(|descriptor| {
            validate::validate_descriptor(&entry.name, &descriptor)?;
            validate::validate_wiring_attributes(&entry.name, &descriptor, &entry.node)?;
            Ok(descriptor)
        });

        match resolved {
            Ok(descriptor) => {
                modules.insert(
                    id,
                    ModuleInstance {
                        id: entry.id,
                        name: entry.name,
                        library: entry.library,
                        config_node: entry.node,
                        descriptor,
                        input_definition: BTreeMap::new(),
                        outputs: BTreeMap::new(),
                        inputs: Vec::new(),
                    },
                );
            }
            Err(err) => {
                tracing::error!(target: "mainloop", "{err}");
                first_error.get_or_insert(err);
            }
        }
    }

    match first_error {
        Some(err) => Err(err),
        None => Ok(modules),
    }
}

/// A minimal working system needs at least one Input and one Output
/// module.
fn check_module_population(modules: &BTreeMap<i16, ModuleInstance>) -> Result<()> {
    let inputs = modules
        .values()
        .filter(|m| m.descriptor.kind == ModuleKind::Input)
        .count();
    let outputs = modules
        .values()
        .filter(|m| m.descriptor.kind == ModuleKind::Output)
        .count();

    if inputs == 0 {
        return Err(BuildError::DeadInputModule {
            reason: "no Input modules defined, at least one Input and one Output module are required"
                .to_owned(),
        });
    }

    if outputs == 0 {
        return Err(BuildError::DeadInputModule {
            reason: "no Output modules defined, at least one Input and one Output module are required"
                .to_owned(),
        });
    }

    Ok(())
}

/// Determine every producing module's concrete output types (from the
/// descriptor, or from `moduleOutput` under a wildcard declaration) and
/// materialize the candidate stream set.
fn collect_output_streams(
    modules: &mut BTreeMap<i16, ModuleInstance>,
) -> Result<Vec<ActiveStream>> {
    let mut active_streams = Vec::new();
    let ids: Vec<i16> = modules.keys().copied().collect();

    for id in ids {
        let module = &modules[&id];

        if module.descriptor.output_streams.is_empty() {
            continue;
        }

        let types: Vec<i16> = if module.descriptor.has_wildcard_output() {
            let definition = module.config_node.get_string("moduleOutput");
            wiring::parse_module_output(&definition)
                .map_err(|e| wiring_error(&module.name, "moduleOutput", e))?
        } else {
            module
                .descriptor
                .output_streams
                .iter()
                .map(|o| o.type_id)
                .collect()
        };

        let is_processor_output = module.descriptor.kind == ModuleKind::Processor;
        for &type_id in &types {
            active_streams.push(ActiveStream::new(id, type_id, is_processor_output));
        }

        let module = modules.get_mut(&id).expect("iterating known IDs");
        module.outputs = types.into_iter().map(|t| (t, None)).collect();
    }

    Ok(active_streams)
}

/// Parse every consumer's `moduleInput` and cross-check it: referenced
/// modules and streams must exist, tap points must name Processors, and
/// the connected inputs must satisfy the declared cardinalities. Fills
/// each stream's user list along the way.
fn parse_input_wiring(
    modules: &mut BTreeMap<i16, ModuleInstance>,
    active_streams: &mut [ActiveStream],
) -> Result<()> {
    let ids: Vec<i16> = modules.keys().copied().collect();

    for id in ids {
        let module = &modules[&id];

        if module.descriptor.kind == ModuleKind::Input {
            continue;
        }

        let name = module.name.clone();
        let definition = module.config_node.get_string("moduleInput");

        let mut parsed = wiring::parse_module_input(&definition)
            .map_err(|e| wiring_error(&name, "moduleInput", e))?;

        for (&source_id, inputs) in &parsed {
            if !modules.contains_key(&source_id) {
                return Err(BuildError::UnknownModuleId {
                    module: name,
                    id: source_id,
                });
            }

            for input in inputs {
                if input.after_module_id != -1 {
                    check_after_module_reference(modules, &name, id, source_id, input)?;
                }

                let Some(pos) = streams::find(active_streams, source_id, input.type_id) else {
                    return Err(BuildError::UnknownStream {
                        module: name,
                        source_id,
                        type_id: input.type_id,
                    });
                };

                // A consumer taking the same stream from several tap
                // points is still one user of it.
                let users = &mut active_streams[pos].users;
                if !users.contains(&id) {
                    users.push(id);
                }
            }
        }

        wiring::check_input_cardinality(&parsed, &module.descriptor.input_streams).map_err(
            |reason| BuildError::CardinalityMismatch {
                module: name.clone(),
                reason,
            },
        )?;

        wiring::apply_copy_needed(&mut parsed, &module.descriptor.input_streams);

        modules.get_mut(&id).expect("iterating known IDs").input_definition = parsed;
    }

    Ok(())
}

fn check_after_module_reference(
    modules: &BTreeMap<i16, ModuleInstance>,
    module_name: &str,
    module_id: i16,
    source_id: i16,
    input: &OrderedInput,
) -> Result<()> {
    let after = input.after_module_id;

    let reason = if after == module_id {
        Some("module cannot tap a stream after itself")
    } else {
        match modules.get(&after) {
            None => Some("referenced module does not exist"),
            Some(m) if m.descriptor.kind != ModuleKind::Processor => {
                // Only Processors ever modify event streams and can thus
                // impose an ordering on them.
                Some("referenced module is not a Processor")
            }
            Some(_) => None,
        }
    };

    match reason {
        Some(reason) => Err(BuildError::InvalidAfterModule {
            module: module_name.to_owned(),
            after,
            source_id,
            type_id: input.type_id,
            reason: reason.to_owned(),
        }),
        None => Ok(()),
    }
}

/// Every Input module must keep at least one surviving stream after
/// pruning; a fully unconnected Input module is dead weight and almost
/// certainly a configuration error.
fn check_connected_inputs(
    modules: &BTreeMap<i16, ModuleInstance>,
    active_streams: &[ActiveStream],
) -> Result<()> {
    for module in modules.values() {
        if module.descriptor.kind != ModuleKind::Input {
            continue;
        }

        if !active_streams.iter().any(|s| s.source_id == module.id) {
            return Err(BuildError::DeadInputModule {
                reason: format!(
                    "module '{}': Input module is not connected to anything and will not be used",
                    module.name
                ),
            });
        }
    }

    Ok(())
}

/// An `afterModuleId` may only name a module that consumes the very same
/// stream *and* modifies it; tapping behind a pure reader would be
/// indistinguishable from tapping the original data.
fn check_tap_points(
    modules: &BTreeMap<i16, ModuleInstance>,
    active_streams: &[ActiveStream],
) -> Result<()> {
    for stream in active_streams {
        for &user in &stream.users {
            let Some(inputs) = modules[&user].input_definition.get(&stream.source_id) else {
                continue;
            };

            for input in inputs
                .iter()
                .filter(|i| i.type_id == stream.type_id && i.after_module_id != -1)
            {
                let after = input.after_module_id;

                if !stream.users.contains(&after) {
                    return Err(BuildError::InvalidAfterModule {
                        module: modules[&user].name.clone(),
                        after,
                        source_id: stream.source_id,
                        type_id: stream.type_id,
                        reason: "referenced module is not part of stream".to_owned(),
                    });
                }

                let modifies = modules[&after]
                    .input_definition
                    .get(&stream.source_id)
                    .is_some_and(|after_inputs| {
                        after_inputs
                            .iter()
                            .any(|o| o.type_id == stream.type_id && o.copy_needed)
                    });

                if !modifies {
                    return Err(BuildError::InvalidAfterModule {
                        module: modules[&user].name.clone(),
                        after,
                        source_id: stream.source_id,
                        type_id: stream.type_id,
                        reason: "referenced module does not modify this event stream".to_owned(),
                    });
                }
            }
        }
    }

    Ok(())
}

/// Build each stream's dependency tree, merge them all into the global
/// tree, and derive the total execution order.
fn resolve_global_order(
    modules: &BTreeMap<i16, ModuleInstance>,
    active_streams: &mut [ActiveStream],
) -> Result<Vec<i16>> {
    for i in 0..active_streams.len() {
        let source_id = active_streams[i].source_id;
        let type_id = active_streams[i].type_id;
        let users = active_streams[i].users.clone();

        let users_after = |tap: i16| -> Vec<i16> {
            let mut result: Vec<i16> = users
                .iter()
                .copied()
                .filter(|user| {
                    modules[user]
                        .input_definition
                        .get(&source_id)
                        .is_some_and(|inputs| {
                            inputs
                                .iter()
                                .any(|o| o.type_id == type_id && o.after_module_id == tap)
                        })
                })
                .collect();
            result.sort_unstable();
            result
        };

        let tree = resolver::build_stream_tree(source_id, &users_after).map_err(|cycle| {
            BuildError::IntraStreamCycle {
                source_id,
                type_id,
                reason: format!(
                    "tap-point references loop back through module {}",
                    cycle.module_id
                ),
            }
        })?;

        // Users whose tap chain never reaches the producer would silently
        // drop out of the execution order.
        let mut reached = tree.execution_order();
        reached.sort_unstable();
        reached.dedup();
        let mut expected = users.clone();
        expected.push(source_id);
        expected.sort_unstable();
        expected.dedup();

        if reached != expected {
            return Err(BuildError::IntraStreamCycle {
                source_id,
                type_id,
                reason: "tap-point references form a cycle detached from the producer".to_owned(),
            });
        }

        active_streams[i].dep_tree = Some(tree);
    }

    let module_name = |id: i16| -> String {
        modules
            .get(&id)
            .map(|m| m.name.clone())
            .unwrap_or_else(|| format!("<unknown {id}>"))
    };

    let mut global = resolver::DepTree::new();
    for stream in active_streams.iter() {
        let tree = stream.dep_tree.as_ref().expect("built above");
        resolver::merge_into(&mut global, tree, &module_name)?;
    }

    global.trace("");

    let order = global.execution_order();

    // Order totality: each module exactly once.
    let mut sorted = order.clone();
    sorted.sort_unstable();
    sorted.dedup();
    if order.len() != modules.len() || sorted.len() != order.len() {
        return Err(BuildError::InternalInconsistency {
            reason: format!(
                "global execution order covers {} of {} module(s)",
                sorted.len(),
                modules.len()
            ),
        });
    }

    Ok(order)
}
