// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Demo plugin: a Processor that claims every event stream writable and
//! passes it through unchanged, counting dispatch cycles.
//!
//! Mostly useful as a wiring and copy-analysis exercise: because the
//! input is declared writable, any later consumer of the same tap point
//! forces the router to hand this module a private copy.

use evflow::module::{
    InputStreamDecl, ModuleContext, ModuleDescriptor, ModuleKind, ModuleLifecycle,
};
use evflow_plugin_abi::export_module;

struct PassthroughState {
    cycles: u64,
    log_interval: u64,
}

fn init(ctx: &mut ModuleContext) -> bool {
    ctx.config_node.create_long(
        "logInterval",
        10_000,
        1,
        i64::MAX,
        evflow::config::AttrFlags::NORMAL,
        "Dispatch cycles between throughput log lines.",
    );

    ctx.state = Some(Box::new(PassthroughState {
        cycles: 0,
        log_interval: ctx.config_node.get_long("logInterval") as u64,
    }));

    true
}

fn run(ctx: &mut ModuleContext) {
    let module_id = ctx.module_id;
    let Some(state) = ctx.state.as_mut().and_then(|s| s.downcast_mut::<PassthroughState>())
    else {
        return;
    };

    state.cycles += 1;

    if state.cycles % state.log_interval == 0 {
        tracing::debug!(
            target: "passthrough",
            "module {} passed {} dispatch cycles",
            module_id,
            state.cycles
        );
    }
}

fn config_update(ctx: &mut ModuleContext) {
    let log_interval = ctx.config_node.get_long("logInterval") as u64;

    if let Some(state) = ctx.state.as_mut().and_then(|s| s.downcast_mut::<PassthroughState>()) {
        state.log_interval = log_interval;
    }
}

fn exit(ctx: &mut ModuleContext) {
    if let Some(state) = ctx.state.as_ref().and_then(|s| s.downcast_ref::<PassthroughState>()) {
        tracing::info!(
            target: "passthrough",
            "module {} exiting after {} dispatch cycles",
            ctx.module_id,
            state.cycles
        );
    }
}

fn info() -> ModuleDescriptor {
    ModuleDescriptor::new(
        "passthrough",
        ModuleKind::Processor,
        ModuleLifecycle::new(run)
            .with_init(init)
            .with_config_update(config_update)
            .with_exit(exit),
    )
    .with_description("Passes every event stream through unchanged.")
    .with_state_size(std::mem::size_of::<PassthroughState>())
    .with_input_stream(InputStreamDecl::any(false))
}

export_module!(info);
