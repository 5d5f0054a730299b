// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! End-to-end plan construction scenarios over in-memory descriptors.

use std::collections::HashMap;
use std::sync::Arc;

use evflow::config::{AttrFlags, ConfigTree};
use evflow::error::BuildError;
use evflow::module::{
    InputStreamDecl, ModuleContext, ModuleDescriptor, ModuleKind, ModuleLifecycle,
    OutputStreamDecl,
};
use evflow::plan::{self, ExecutionPlan, InputSlot};
use evflow::registry::DescriptorSource;

fn noop(_ctx: &mut ModuleContext) {}

fn lifecycle() -> ModuleLifecycle {
    ModuleLifecycle::new(noop)
}

/// In-memory descriptor table standing in for the plugin registry.
struct StaticSource {
    descriptors: HashMap<String, ModuleDescriptor>,
}

impl StaticSource {
    fn new() -> Self {
        Self {
            descriptors: HashMap::new(),
        }
    }

    fn with(mut self, library: &str, descriptor: ModuleDescriptor) -> Self {
        self.descriptors.insert(library.to_owned(), descriptor);
        self
    }
}

impl DescriptorSource for StaticSource {
    fn resolve(&mut self, module_name: &str, library: &str) -> evflow::Result<ModuleDescriptor> {
        self.descriptors
            .get(library)
            .cloned()
            .ok_or_else(|| BuildError::PluginNotFound {
                module: module_name.to_owned(),
                library: library.to_owned(),
            })
    }
}

fn add_module(
    tree: &Arc<ConfigTree>,
    name: &str,
    id: i16,
    library: &str,
    module_input: Option<&str>,
    module_output: Option<&str>,
) {
    let node = tree.node(&format!("/{name}/"));
    node.create_short("moduleId", id, 0, i16::MAX, AttrFlags::NORMAL, "");
    node.create_string("moduleLibrary", library, 1, 256, AttrFlags::NORMAL, "");

    if let Some(input) = module_input {
        node.create_string("moduleInput", input, 0, 4096, AttrFlags::NORMAL, "");
    }

    if let Some(output) = module_output {
        node.create_string("moduleOutput", output, 0, 4096, AttrFlags::NORMAL, "");
    }
}

fn camera() -> ModuleDescriptor {
    // Input producing polarity (0) and frame (1) packets.
    ModuleDescriptor::new("camera", ModuleKind::Input, lifecycle())
        .with_output_stream(OutputStreamDecl::new(0))
        .with_output_stream(OutputStreamDecl::new(1))
}

fn inplace_filter() -> ModuleDescriptor {
    // Processor mutating both packet types in place, producing nothing new.
    ModuleDescriptor::new("filter", ModuleKind::Processor, lifecycle())
        .with_input_stream(InputStreamDecl::new(0, 1, false))
        .with_input_stream(InputStreamDecl::new(1, 1, false))
}

fn sink_any() -> ModuleDescriptor {
    ModuleDescriptor::new("sink", ModuleKind::Output, lifecycle())
        .with_input_stream(InputStreamDecl::any(true))
}

fn linear_pipeline() -> (Arc<ConfigTree>, StaticSource) {
    let tree = ConfigTree::new();
    add_module(&tree, "cam", 1, "camera", None, None);
    add_module(&tree, "filter", 2, "filter", Some("1[0,1]"), None);
    add_module(&tree, "sink", 3, "sink", Some("1[0,1]"), None);

    let source = StaticSource::new()
        .with("camera", camera())
        .with("filter", inplace_filter())
        .with("sink", sink_any());

    (tree, source)
}

fn build(tree: &Arc<ConfigTree>, source: &mut StaticSource) -> evflow::Result<ExecutionPlan> {
    plan::build(tree, source)
}

// ---------------------------------------------------------------------------
// Scenario 1: linear pipeline
// ---------------------------------------------------------------------------

#[test]
fn linear_pipeline_order_and_slots() {
    let (tree, mut source) = linear_pipeline();
    let plan = build(&tree, &mut source).unwrap();

    assert_eq!(plan.order, vec![1, 2, 3]);

    // Both streams are active with both consumers, in execution order.
    assert_eq!(plan.streams.len(), 2);
    for stream in &plan.streams {
        assert_eq!(stream.source_id, 1);
        assert_eq!(stream.users, vec![2, 3]);
        assert!(!stream.is_processor_output);
    }

    let cam = &plan.modules[&1];
    assert_eq!(cam.outputs[&0], Some(0));
    assert_eq!(cam.outputs[&1], Some(1));

    // The sink reads the same raw tap the filter mutates, so the filter
    // must work on copies.
    let filter = &plan.modules[&2];
    assert_eq!(
        filter.inputs,
        vec![
            InputSlot {
                slot: 2,
                copy_from: Some(0)
            },
            InputSlot {
                slot: 3,
                copy_from: Some(1)
            },
        ]
    );

    let sink = &plan.modules[&3];
    assert_eq!(
        sink.inputs,
        vec![
            InputSlot {
                slot: 0,
                copy_from: None
            },
            InputSlot {
                slot: 1,
                copy_from: None
            },
        ]
    );

    assert_eq!(plan.slot_count, 4);
    assert_eq!(plan.copy_count, 2);
}

#[test]
fn linear_pipeline_without_raw_reader_consumes_in_place() {
    // Same pipeline, but the sink taps after the filter: nobody needs the
    // pre-mutation data, so no copies are made.
    let tree = ConfigTree::new();
    add_module(&tree, "cam", 1, "camera", None, None);
    add_module(&tree, "filter", 2, "filter", Some("1[0,1]"), None);
    add_module(&tree, "sink", 3, "sink", Some("1[0a2,1a2]"), None);

    let mut source = StaticSource::new()
        .with("camera", camera())
        .with("filter", inplace_filter())
        .with("sink", sink_any());

    let plan = build(&tree, &mut source).unwrap();

    assert_eq!(plan.order, vec![1, 2, 3]);
    assert_eq!(plan.copy_count, 0);
    assert_eq!(plan.slot_count, 2);

    let filter = &plan.modules[&2];
    assert_eq!(
        filter.inputs,
        vec![
            InputSlot {
                slot: 0,
                copy_from: None
            },
            InputSlot {
                slot: 1,
                copy_from: None
            },
        ]
    );

    // The sink reads the mutated slots.
    let sink = &plan.modules[&3];
    assert_eq!(
        sink.inputs,
        vec![
            InputSlot {
                slot: 0,
                copy_from: None
            },
            InputSlot {
                slot: 1,
                copy_from: None
            },
        ]
    );
}

// ---------------------------------------------------------------------------
// Scenario 2: tap point
// ---------------------------------------------------------------------------

fn tap_point_pipeline() -> (Arc<ConfigTree>, StaticSource) {
    let (tree, source) = linear_pipeline();

    add_module(&tree, "sinkAfter", 4, "sink_t0", Some("1[0a2]"), None);

    let sink_t0 = ModuleDescriptor::new("sink_t0", ModuleKind::Output, lifecycle())
        .with_input_stream(InputStreamDecl::new(0, -1, true));

    (tree, source.with("sink_t0", sink_t0))
}

#[test]
fn tap_point_order_and_copy() {
    let (tree, mut source) = tap_point_pipeline();
    let plan = build(&tree, &mut source).unwrap();

    // 4 depends on 2; BFS with ascending tie-break puts the raw readers
    // first.
    assert_eq!(plan.order, vec![1, 2, 3, 4]);

    // The filter still has a later raw reader (sink), so it still copies;
    // sinkAfter reads the mutated copy.
    let filter = &plan.modules[&2];
    assert_eq!(
        filter.inputs,
        vec![
            InputSlot {
                slot: 2,
                copy_from: Some(0)
            },
            InputSlot {
                slot: 3,
                copy_from: Some(1)
            },
        ]
    );

    let sink_after = &plan.modules[&4];
    assert_eq!(
        sink_after.inputs,
        vec![InputSlot {
            slot: 2,
            copy_from: None
        }]
    );

    let stream0 = plan
        .streams
        .iter()
        .find(|s| s.type_id == 0)
        .expect("stream (1, 0) active");
    assert_eq!(stream0.users, vec![2, 3, 4]);
}

// ---------------------------------------------------------------------------
// Scenario 3: cross-stream cycle
// ---------------------------------------------------------------------------

#[test]
fn cross_stream_cycle_is_detected() {
    let tree = ConfigTree::new();
    add_module(&tree, "in1", 1, "gen0", None, None);
    add_module(&tree, "in2", 2, "gen1", None, None);
    // A mutates stream (1,0) and reads (2,1) after B.
    add_module(&tree, "procA", 3, "proc_a", Some("1[0] 2[1a4]"), None);
    // B mutates stream (2,1) and reads (1,0) after A.
    add_module(&tree, "procB", 4, "proc_b", Some("2[1] 1[0a3]"), None);
    add_module(&tree, "sink", 5, "sink", Some("1[0] 2[1]"), None);

    let gen0 = ModuleDescriptor::new("gen0", ModuleKind::Input, lifecycle())
        .with_output_stream(OutputStreamDecl::new(0));
    let gen1 = ModuleDescriptor::new("gen1", ModuleKind::Input, lifecycle())
        .with_output_stream(OutputStreamDecl::new(1));
    let proc_a = ModuleDescriptor::new("proc_a", ModuleKind::Processor, lifecycle())
        .with_input_stream(InputStreamDecl::new(0, 1, false))
        .with_input_stream(InputStreamDecl::new(1, 1, true));
    let proc_b = ModuleDescriptor::new("proc_b", ModuleKind::Processor, lifecycle())
        .with_input_stream(InputStreamDecl::new(0, 1, true))
        .with_input_stream(InputStreamDecl::new(1, 1, false));

    let mut source = StaticSource::new()
        .with("gen0", gen0)
        .with("gen1", gen1)
        .with("proc_a", proc_a)
        .with("proc_b", proc_b)
        .with("sink", sink_any());

    let err = build(&tree, &mut source).unwrap_err();
    match err {
        BuildError::CrossStreamCycle { first, second, .. } => {
            let mut pair = [first, second];
            pair.sort_unstable();
            assert_eq!(pair, [3, 4]);
        }
        other => panic!("expected CrossStreamCycle, got {other}"),
    }
}

// ---------------------------------------------------------------------------
// Scenario 4: intra-stream cycle
// ---------------------------------------------------------------------------

#[test]
fn intra_stream_cycle_is_detected() {
    let tree = ConfigTree::new();
    add_module(&tree, "cam", 1, "gen0", None, None);
    // The generator consumes its own output stream.
    add_module(&tree, "gen", 3, "self_feed", Some("3[5]"), None);
    add_module(&tree, "sink", 2, "sink", Some("1[0] 3[5]"), None);

    let gen0 = ModuleDescriptor::new("gen0", ModuleKind::Input, lifecycle())
        .with_output_stream(OutputStreamDecl::new(0));
    let self_feed = ModuleDescriptor::new("self_feed", ModuleKind::Processor, lifecycle())
        .with_input_stream(InputStreamDecl::new(5, -1, false))
        .with_output_stream(OutputStreamDecl::new(5));

    let mut source = StaticSource::new()
        .with("gen0", gen0)
        .with("self_feed", self_feed)
        .with("sink", sink_any());

    let err = build(&tree, &mut source).unwrap_err();
    assert!(
        matches!(err, BuildError::IntraStreamCycle { source_id: 3, type_id: 5, .. }),
        "expected IntraStreamCycle, got {err}"
    );
}

// ---------------------------------------------------------------------------
// Scenario 5: cardinality mismatch
// ---------------------------------------------------------------------------

#[test]
fn cardinality_mismatch_fails_build() {
    let tree = ConfigTree::new();
    add_module(&tree, "cam", 1, "gen5", None, None);
    add_module(&tree, "merger", 2, "merger", Some("1[5]"), None);

    let gen5 = ModuleDescriptor::new("gen5", ModuleKind::Input, lifecycle())
        .with_output_stream(OutputStreamDecl::new(5));
    // Requires exactly two connected streams of type 5, only one wired.
    let merger = ModuleDescriptor::new("merger", ModuleKind::Output, lifecycle())
        .with_input_stream(InputStreamDecl::new(5, 2, true));

    let mut source = StaticSource::new().with("gen5", gen5).with("merger", merger);

    let err = build(&tree, &mut source).unwrap_err();
    assert!(
        matches!(err, BuildError::CardinalityMismatch { .. }),
        "expected CardinalityMismatch, got {err}"
    );
}

// ---------------------------------------------------------------------------
// Wildcard outputs
// ---------------------------------------------------------------------------

#[test]
fn wildcard_output_types_come_from_module_output() {
    let tree = ConfigTree::new();
    add_module(&tree, "playback", 1, "file_in", None, Some("2,5"));
    add_module(&tree, "sink", 2, "sink", Some("1[2,5]"), None);

    let file_in = ModuleDescriptor::new("file_in", ModuleKind::Input, lifecycle())
        .with_output_stream(OutputStreamDecl::any());

    let mut source = StaticSource::new()
        .with("file_in", file_in)
        .with("sink", sink_any());

    let plan = build(&tree, &mut source).unwrap();

    assert!(plan.stream_exists(1, 2));
    assert!(plan.stream_exists(1, 5));
    assert_eq!(plan.modules[&1].outputs.len(), 2);
}

// ---------------------------------------------------------------------------
// Boundary behaviors
// ---------------------------------------------------------------------------

#[test]
fn module_id_zero_is_valid() {
    let tree = ConfigTree::new();
    add_module(&tree, "cam", 0, "camera", None, None);
    add_module(&tree, "sink", 1, "sink", Some("0[0,1]"), None);

    let mut source = StaticSource::new()
        .with("camera", camera())
        .with("sink", sink_any());

    let plan = build(&tree, &mut source).unwrap();
    assert_eq!(plan.order, vec![0, 1]);
}

#[test]
fn empty_or_blank_module_input_is_rejected() {
    for input in ["", "   \t "] {
        let tree = ConfigTree::new();
        add_module(&tree, "cam", 1, "camera", None, None);
        add_module(&tree, "sink", 2, "sink", Some(input), None);

        let mut source = StaticSource::new()
            .with("camera", camera())
            .with("sink", sink_any());

        let err = build(&tree, &mut source).unwrap_err();
        assert!(
            matches!(err, BuildError::WiringParseError { .. }),
            "expected WiringParseError for {input:?}, got {err}"
        );
    }
}

#[test]
fn unconnected_input_module_fails_build() {
    let tree = ConfigTree::new();
    add_module(&tree, "cam", 1, "camera", None, None);
    add_module(&tree, "unused", 2, "camera", None, None);
    add_module(&tree, "sink", 3, "sink", Some("1[0,1]"), None);

    let mut source = StaticSource::new()
        .with("camera", camera())
        .with("sink", sink_any());

    let err = build(&tree, &mut source).unwrap_err();
    assert!(
        matches!(err, BuildError::DeadInputModule { .. }),
        "expected DeadInputModule, got {err}"
    );
}

#[test]
fn zero_input_or_output_modules_fails_build() {
    // No Input modules at all.
    let tree = ConfigTree::new();
    add_module(&tree, "sink", 1, "sink", Some("1[0]"), None);
    let mut source = StaticSource::new().with("sink", sink_any());
    let err = build(&tree, &mut source).unwrap_err();
    assert!(matches!(err, BuildError::DeadInputModule { .. }));

    // No Output modules at all.
    let tree = ConfigTree::new();
    add_module(&tree, "cam", 1, "camera", None, None);
    let mut source = StaticSource::new().with("camera", camera());
    let err = build(&tree, &mut source).unwrap_err();
    assert!(matches!(err, BuildError::DeadInputModule { .. }));
}

#[test]
fn unknown_references_are_classified() {
    // Unknown producer module ID.
    let tree = ConfigTree::new();
    add_module(&tree, "cam", 1, "camera", None, None);
    add_module(&tree, "sink", 2, "sink", Some("9[0]"), None);
    let mut source = StaticSource::new()
        .with("camera", camera())
        .with("sink", sink_any());
    assert!(matches!(
        build(&tree, &mut source).unwrap_err(),
        BuildError::UnknownModuleId { id: 9, .. }
    ));

    // Known producer, unknown stream type.
    let tree = ConfigTree::new();
    add_module(&tree, "cam", 1, "camera", None, None);
    add_module(&tree, "sink", 2, "sink", Some("1[7]"), None);
    let mut source = StaticSource::new()
        .with("camera", camera())
        .with("sink", sink_any());
    assert!(matches!(
        build(&tree, &mut source).unwrap_err(),
        BuildError::UnknownStream {
            source_id: 1,
            type_id: 7,
            ..
        }
    ));
}

#[test]
fn invalid_after_module_references_are_rejected() {
    // Tap point names an Output module.
    let tree = ConfigTree::new();
    add_module(&tree, "cam", 1, "camera", None, None);
    add_module(&tree, "sink", 2, "sink", Some("1[0,1]"), None);
    add_module(&tree, "late", 3, "sink_t0", Some("1[0a2]"), None);

    let sink_t0 = ModuleDescriptor::new("sink_t0", ModuleKind::Output, lifecycle())
        .with_input_stream(InputStreamDecl::new(0, -1, true));

    let mut source = StaticSource::new()
        .with("camera", camera())
        .with("sink", sink_any())
        .with("sink_t0", sink_t0.clone());

    assert!(matches!(
        build(&tree, &mut source).unwrap_err(),
        BuildError::InvalidAfterModule { after: 2, .. }
    ));

    // Tap point names a Processor that reads the stream but does not
    // modify it.
    let tree = ConfigTree::new();
    add_module(&tree, "cam", 1, "camera", None, None);
    add_module(&tree, "watch", 2, "readonly_proc", Some("1[0,1]"), None);
    add_module(&tree, "sink", 3, "sink", Some("1[0,1]"), None);
    add_module(&tree, "late", 4, "sink_t0", Some("1[0a2]"), None);

    // Reads type 0, mutates only type 1.
    let readonly_proc = ModuleDescriptor::new("readonly_proc", ModuleKind::Processor, lifecycle())
        .with_input_stream(InputStreamDecl::new(0, 1, true))
        .with_input_stream(InputStreamDecl::new(1, 1, false));

    let mut source = StaticSource::new()
        .with("camera", camera())
        .with("readonly_proc", readonly_proc)
        .with("sink", sink_any())
        .with("sink_t0", sink_t0);

    assert!(matches!(
        build(&tree, &mut source).unwrap_err(),
        BuildError::InvalidAfterModule { after: 2, .. }
    ));
}

// ---------------------------------------------------------------------------
// Universal invariants
// ---------------------------------------------------------------------------

fn assert_invariants(plan: &ExecutionPlan) {
    // Order totality: every module exactly once.
    let mut sorted = plan.order.clone();
    sorted.sort_unstable();
    sorted.dedup();
    assert_eq!(sorted.len(), plan.modules.len());

    // Dependency soundness: sources precede raw readers, tap targets
    // precede tappers.
    let pos: HashMap<i16, usize> = plan.order.iter().enumerate().map(|(i, &m)| (m, i)).collect();
    for module in plan.modules.values() {
        for (&source_id, inputs) in &module.input_definition {
            for input in inputs {
                if input.after_module_id == -1 {
                    assert!(pos[&source_id] < pos[&module.id]);
                } else {
                    assert!(pos[&input.after_module_id] < pos[&module.id]);
                }
            }
        }
    }

    // Output slots are unique across the whole plan.
    let mut output_slots: Vec<usize> = plan
        .modules
        .values()
        .flat_map(|m| m.outputs.values().flatten().copied())
        .collect();
    let before = output_slots.len();
    output_slots.sort_unstable();
    output_slots.dedup();
    assert_eq!(output_slots.len(), before);

    // Copy minimality, read-only half: a module that never mutates
    // anything is never given a copy.
    for module in plan.modules.values() {
        let mutates = module
            .input_definition
            .values()
            .flatten()
            .any(|o| o.copy_needed);

        if !mutates {
            assert!(
                module.inputs.iter().all(|i| i.copy_from.is_none()),
                "read-only module {} received a copy",
                module.id
            );
        }
    }

    // Every slot index stays below the plan's slot count.
    for module in plan.modules.values() {
        for input in &module.inputs {
            assert!(input.slot < plan.slot_count);
            if let Some(copy_from) = input.copy_from {
                assert!(copy_from < plan.slot_count);
            }
        }
    }
}

#[test]
fn invariants_hold_for_scenarios() {
    let (tree, mut source) = linear_pipeline();
    assert_invariants(&build(&tree, &mut source).unwrap());

    let (tree, mut source) = tap_point_pipeline();
    assert_invariants(&build(&tree, &mut source).unwrap());
}

#[test]
fn rebuild_is_deterministic() {
    let (tree, mut source) = tap_point_pipeline();

    let first = build(&tree, &mut source).unwrap();
    let second = build(&tree, &mut source).unwrap();

    assert_eq!(first.order, second.order);
    assert_eq!(first.slot_count, second.slot_count);
    assert_eq!(first.copy_count, second.copy_count);

    for (id, module) in &first.modules {
        let other = &second.modules[id];
        assert_eq!(module.inputs, other.inputs);
        assert_eq!(module.outputs, other.outputs);
    }
}

#[test]
fn plan_summary_serializes() {
    let (tree, mut source) = linear_pipeline();
    let plan = build(&tree, &mut source).unwrap();

    let summary = plan.summary();
    assert_eq!(summary.order, vec![1, 2, 3]);
    assert_eq!(summary.modules.len(), 3);

    let json = summary.to_json().unwrap();
    assert!(json.contains("\"slot_count\": 4"));
    assert!(json.contains("\"cam\""));
}

#[test]
fn plan_query_helpers() {
    let (tree, mut source) = linear_pipeline();
    let plan = build(&tree, &mut source).unwrap();

    assert!(plan.module_exists(1));
    assert!(!plan.module_exists(9));
    assert_eq!(plan.module_kind(2), Some(ModuleKind::Processor));
    assert!(plan.stream_exists(1, 0));
    assert!(!plan.stream_exists(2, 0));

    assert!(plan.find_module(1, "cam", ModuleKind::Input).is_some());
    assert!(plan.find_module(1, "cam", ModuleKind::Output).is_none());
    assert!(plan.find_module(1, "wrong", ModuleKind::Input).is_none());

    let info = plan.source_info_node(1).unwrap();
    assert_eq!(info.path(), "/cam/sourceInfo/");
}
