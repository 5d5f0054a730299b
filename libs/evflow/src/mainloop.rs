// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Mainloop control.
//!
//! The top-level state machine is intentionally small: while the system
//! is running, an enabled mainloop repeatedly attempts to build an
//! execution plan and, on success, dispatches modules in plan order until
//! disabled. A build failure flips the mainloop-enabled flag off and
//! waits for reconfiguration, observed through the configuration tree's
//! listener on the `running` attribute. Signal-driven shutdown clears the
//! system flag, which is terminal.
//!
//! The two control flags are `Release`-stored from signal handlers and
//! listener callbacks and `Relaxed`-loaded in the loop conditions. The
//! data-available counter pairs `Release` on increment with `Acquire` on
//! the consumer side, establishing happens-before between a producer
//! publishing packets and the dispatcher running modules over them.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::{AttrFlags, AttrValue, AttributeEvent, ConfigTree};
use crate::error::Result;
use crate::module::ModuleContext;
use crate::plan::{self, ExecutionPlan, SYSTEM_NODE_NAME};
use crate::registry::DescriptorSource;

/// A module with live per-instance state during one dispatch cycle.
struct RunningModule {
    context: ModuleContext,
    listener: crate::config::ListenerToken,
}

/// Process-wide control flags shared between the mainloop thread, signal
/// handlers and configuration listeners.
pub struct MainloopControl {
    system_running: AtomicBool,
    running: AtomicBool,
    data_available: AtomicU32,
}

impl MainloopControl {
    fn new() -> Arc<MainloopControl> {
        Arc::new(MainloopControl {
            system_running: AtomicBool::new(true),
            running: AtomicBool::new(true),
            data_available: AtomicU32::new(0),
        })
    }

    pub fn system_running(&self) -> bool {
        self.system_running.load(Ordering::Relaxed)
    }

    pub fn mainloop_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Terminal shutdown: clears both flags. Safe to call from a signal
    /// handling thread.
    pub fn shutdown_system(&self) {
        self.system_running.store(false, Ordering::Release);
        self.running.store(false, Ordering::Release);
    }

    pub fn set_mainloop_running(&self, running: bool) {
        self.running.store(running, Ordering::Release);
    }

    /// Called by input modules when new packets are ready for dispatch.
    pub fn data_notify_increase(&self) {
        self.data_available.fetch_add(1, Ordering::Release);
    }

    /// No release needed: the consumer's acquire load already
    /// synchronized with the increase above.
    pub fn data_notify_decrease(&self) {
        self.data_available.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn data_available(&self) -> u32 {
        self.data_available.load(Ordering::Acquire)
    }
}

/// The mainloop host: owns the control flags and drives plan build and
/// dispatch against a configuration tree.
pub struct Mainloop {
    tree: Arc<ConfigTree>,
    control: Arc<MainloopControl>,
}

impl Mainloop {
    pub fn new(tree: Arc<ConfigTree>) -> Mainloop {
        Mainloop {
            tree,
            control: MainloopControl::new(),
        }
    }

    pub fn control(&self) -> Arc<MainloopControl> {
        Arc::clone(&self.control)
    }

    /// Create the `running` control attributes and hook the listeners
    /// that mirror them into the control flags.
    pub fn install_control_listeners(&self) {
        // System-level control, separate to allow mainloop stop/start.
        // Any modification is treated as a shutdown request; re-enabling
        // a stopping system is not supported.
        let system_node = self.tree.node(&format!("/{SYSTEM_NODE_NAME}/"));
        system_node.create_bool(
            "running",
            true,
            AttrFlags::NORMAL,
            "Global system start/stop.",
        );

        let control = Arc::clone(&self.control);
        system_node.add_attribute_listener(move |_, event| {
            if let AttributeEvent::Modified { key, value } = event {
                if *key == "running" && matches!(value, AttrValue::Bool(_)) {
                    control.shutdown_system();
                }
            }
        });

        // Mainloop-level control on the root node.
        let root = self.tree.root();
        root.create_bool("running", true, AttrFlags::NORMAL, "Mainloop start/stop.");

        let control = Arc::clone(&self.control);
        root.add_attribute_listener(move |_, event| {
            if let AttributeEvent::Modified { key, value } = event {
                if *key == "running" {
                    if let AttrValue::Bool(enabled) = value {
                        control.set_mainloop_running(*enabled);
                    }
                }
            }
        });
    }

    /// Run until system shutdown. Each enabled iteration attempts a plan
    /// build; a failed build disables the mainloop until the user fixes
    /// the configuration and re-enables it.
    pub fn run(&self, source: &mut dyn DescriptorSource) {
        self.install_control_listeners();

        while self.control.system_running() {
            if !self.control.mainloop_running() {
                std::thread::sleep(Duration::from_secs(1));
                continue;
            }

            if let Err(err) = self.run_cycle(source) {
                // Disable through the tree so config front-ends observe
                // the state change too.
                let _ = self.tree.root().put_bool("running", false);
                self.control.set_mainloop_running(false);

                tracing::error!(target: "mainloop", "{err}");
                tracing::error!(
                    target: "mainloop",
                    "failed to start mainloop, please fix the configuration and try again!"
                );
            }
        }
    }

    /// One full build-dispatch-teardown cycle.
    fn run_cycle(&self, source: &mut dyn DescriptorSource) -> Result<()> {
        let plan = plan::build(&self.tree, source)?;

        let mut contexts = self.init_modules(&plan)?;

        tracing::info!(target: "mainloop", "mainloop started successfully");

        // Dispatch only when data is available, but make a pass each
        // second anyway, to notice new devices for example.
        let mut sleep_count = 0u32;

        while self.control.mainloop_running() {
            if self.control.data_available() > 0 || sleep_count > 1000 {
                sleep_count = 0;
                self.dispatch(&plan, &mut contexts);
            } else {
                sleep_count += 1;
                std::thread::sleep(Duration::from_millis(1));
            }
        }

        self.exit_modules(&plan, &mut contexts);

        // The plan (modules, loaded streams, dependency trees, routing
        // tables) is dropped here as one unit.
        tracing::info!(target: "mainloop", "mainloop terminated successfully");

        Ok(())
    }

    fn init_modules(&self, plan: &ExecutionPlan) -> Result<BTreeMap<i16, RunningModule>> {
        let mut contexts = BTreeMap::new();

        for &id in &plan.order {
            let module = &plan.modules[&id];
            let mut context = ModuleContext::new(id, Arc::clone(&module.config_node));
            let listener = context.install_default_config_listener();

            if let Some(init) = module.descriptor.lifecycle.init {
                if !init(&mut context) {
                    module.config_node.remove_attribute_listener(listener);
                    return Err(crate::error::BuildError::Other(anyhow::anyhow!(
                        "module '{}' (ID {id}) failed to initialize",
                        module.name
                    )));
                }
            }

            contexts.insert(id, RunningModule { context, listener });
        }

        Ok(contexts)
    }

    fn dispatch(&self, plan: &ExecutionPlan, contexts: &mut BTreeMap<i16, RunningModule>) {
        for &id in &plan.order {
            let module = &plan.modules[&id];
            let running = contexts.get_mut(&id).expect("context created at init");

            if running.context.take_config_update() {
                if let Some(config_update) = module.descriptor.lifecycle.config_update {
                    config_update(&mut running.context);
                }
            }

            (module.descriptor.lifecycle.run)(&mut running.context);
        }
    }

    fn exit_modules(&self, plan: &ExecutionPlan, contexts: &mut BTreeMap<i16, RunningModule>) {
        for &id in &plan.order {
            let module = &plan.modules[&id];
            let running = contexts.get_mut(&id).expect("context created at init");

            if let Some(exit) = module.descriptor.lifecycle.exit {
                exit(&mut running.context);
            }

            module.config_node.remove_attribute_listener(running.listener);
            running.context.state = None;
        }
    }
}
