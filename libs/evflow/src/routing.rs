// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Routing-slot assignment.
//!
//! Walks the global execution order handing out monotonically increasing
//! slot indices: every producer output gets a slot, every consumer input
//! is bound to the slot of its tap point. A consumer that mutates a packet
//! gets a private copy only when some later consumer still needs the
//! pre-mutation data; otherwise it consumes in place. Either way the
//! mutation registers a new tap point `(type, consumer)` so downstream
//! `after`-references resolve to the mutated data.

use std::collections::{BTreeMap, HashMap};

use crate::error::{BuildError, Result};
use crate::module::ModuleKind;
use crate::plan::ModuleInstance;
use crate::streams::{self, ActiveStream};

/// A tap point within one source's streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TapKey {
    type_id: i16,
    after_module_id: i16,
}

/// Working index: per source module, the slot currently holding each tap
/// point's data.
type SlotIndex = HashMap<i16, Vec<(TapKey, usize)>>;

fn lookup(index: &SlotIndex, source_id: i16, key: TapKey) -> Option<usize> {
    index
        .get(&source_id)?
        .iter()
        .find(|(k, _)| *k == key)
        .map(|(_, slot)| *slot)
}

fn missing_slot(module: &ModuleInstance, source_id: i16, key: TapKey) -> BuildError {
    BuildError::InternalInconsistency {
        reason: format!(
            "cannot find valid index slot for module '{}' (ID {}) on input definition [s: {}, t: {}, a: {}]",
            module.name, module.id, source_id, key.type_id, key.after_module_id
        ),
    }
}

/// Assign output and input slots to every module, in global execution
/// order. Returns `(slot_count, copy_count)`.
pub fn assign_slots(
    modules: &mut BTreeMap<i16, ModuleInstance>,
    streams: &[ActiveStream],
    order: &[i16],
) -> Result<(usize, usize)> {
    let mut index: SlotIndex = HashMap::new();
    let mut next_free_slot = 0usize;
    let mut copy_count = 0usize;

    for &module_id in order {
        let module = modules
            .get(&module_id)
            .ok_or_else(|| BuildError::InternalInconsistency {
                reason: format!("execution order names unknown module ID {module_id}"),
            })?;
        let kind = module.descriptor.kind;

        // Producers first: Input modules and Processors with declared
        // outputs feed fresh slots.
        if kind == ModuleKind::Input
            || (kind == ModuleKind::Processor && !module.descriptor.output_streams.is_empty())
        {
            let output_types: Vec<i16> = module.outputs.keys().copied().collect();
            let mut assigned = Vec::new();

            for type_id in output_types {
                // Pruned streams keep no slot.
                if streams::find(streams, module_id, type_id).is_none() {
                    continue;
                }

                assigned.push((type_id, next_free_slot));
                index.entry(module_id).or_default().push((
                    TapKey {
                        type_id,
                        after_module_id: -1,
                    },
                    next_free_slot,
                ));
                next_free_slot += 1;
            }

            let module = modules.get_mut(&module_id).expect("looked up above");
            for (type_id, slot) in assigned {
                module.outputs.insert(type_id, Some(slot));
            }
        }

        // Consumers second: Processors and Outputs bind their parsed
        // inputs to slots.
        let module = modules.get(&module_id).expect("looked up above");
        if kind != ModuleKind::Processor && kind != ModuleKind::Output {
            continue;
        }

        let mut bound_inputs = Vec::new();
        let mut new_taps: Vec<(i16, TapKey, usize)> = Vec::new();

        for (&source_id, inputs) in &module.input_definition {
            for input in inputs {
                let key = TapKey {
                    type_id: input.type_id,
                    after_module_id: input.after_module_id,
                };

                let old_slot = lookup(&index, source_id, key)
                    .ok_or_else(|| missing_slot(module, source_id, key))?;

                if !input.copy_needed {
                    bound_inputs.push((old_slot, None));
                    continue;
                }

                // The module will mutate this packet. Check whether any
                // later consumer of the stream still wants the data at
                // this exact tap point.
                let stream_pos = streams::find(streams, source_id, input.type_id).ok_or_else(
                    || BuildError::InternalInconsistency {
                        reason: format!(
                            "cannot find valid active event stream for module '{}' (ID {}) on input definition [s: {}, t: {}, a: {}]",
                            module.name, module.id, source_id, input.type_id, input.after_module_id
                        ),
                    },
                )?;
                let users = &streams[stream_pos].users;

                let position = users.iter().position(|&u| u == module_id).ok_or_else(|| {
                    BuildError::InternalInconsistency {
                        reason: format!(
                            "cannot find valid user in event stream for module '{}' (ID {}) on input definition [s: {}, t: {}, a: {}]",
                            module.name, module.id, source_id, input.type_id, input.after_module_id
                        ),
                    }
                })?;

                let later_consumer_needs_tap = users[position + 1..].iter().any(|&user| {
                    modules
                        .get(&user)
                        .and_then(|u| u.input_definition.get(&source_id))
                        .is_some_and(|inputs| {
                            inputs.iter().any(|o| {
                                o.type_id == input.type_id
                                    && o.after_module_id == input.after_module_id
                            })
                        })
                });

                let mutated_tap = TapKey {
                    type_id: input.type_id,
                    after_module_id: module_id,
                };

                if later_consumer_needs_tap {
                    // Someone downstream still reads the pre-mutation
                    // data: mutate a private copy.
                    bound_inputs.push((next_free_slot, Some(old_slot)));
                    new_taps.push((source_id, mutated_tap, next_free_slot));
                    next_free_slot += 1;
                    copy_count += 1;
                } else {
                    // Nobody else needs it: consume in place.
                    bound_inputs.push((old_slot, None));
                    new_taps.push((source_id, mutated_tap, old_slot));
                }
            }
        }

        for (source_id, key, slot) in new_taps {
            index.entry(source_id).or_default().push((key, slot));
        }

        let module = modules.get_mut(&module_id).expect("looked up above");
        for (slot, copy_from) in bound_inputs {
            module.inputs.push(crate::plan::InputSlot { slot, copy_from });
        }
        module
            .inputs
            .sort_by_key(|i| (i.slot, i.copy_from.map_or(-1, |c| c as isize)));
    }

    Ok((next_free_slot, copy_count))
}
