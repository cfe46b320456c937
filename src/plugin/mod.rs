// Plugin module - transformers that run after each data poll
//
// Plugins receive the cooked matrices of their collector and may rewrite
// labels, hide instances, add metrics or build new matrices. They run in
// declaration order on the collector's own task, so they never race with
// the poll functions.

use std::collections::HashMap;

use tracing::debug;

use crate::collector::{CollectorContext, DataMap, Remote};
use crate::config::PluginSpec;
use crate::error::PollError;
use crate::matrix::Matrix;

pub mod aggregator;
pub mod label_agent;

/// Result of one plugin run
#[derive(Debug, Default)]
pub struct PluginOutput {
    /// Newly built matrices, exported next to the collector data
    pub matrices: Vec<Matrix>,
    /// Instances touched or created, reported in collector metadata
    pub instances: usize,
    /// Metric cells written, reported in collector metadata
    pub metrics: usize,
}

pub trait Plugin: Send {
    fn name(&self) -> &str;

    /// Receives the capabilities of the remote before the first run
    fn init(&mut self, _remote: &Remote) -> Result<(), PollError> {
        Ok(())
    }

    /// Transforms `data` in place and/or returns new matrices
    fn run(&mut self, data: &mut DataMap) -> Result<PluginOutput, PollError>;
}

/// Builds a plugin from its descriptor
pub type PluginFactory = fn(&PluginSpec, &CollectorContext) -> Result<Box<dyn Plugin>, PollError>;

/// A plugin together with its invocation rate
pub struct PluginSlot {
    plugin: Box<dyn Plugin>,
    invoke_every: u32,
    polls: u32,
}

impl PluginSlot {
    pub fn new(plugin: Box<dyn Plugin>, invoke_every: u32) -> Self {
        PluginSlot {
            plugin,
            invoke_every: invoke_every.max(1),
            polls: 0,
        }
    }

    pub fn name(&self) -> &str {
        self.plugin.name()
    }

    pub fn plugin_mut(&mut self) -> &mut dyn Plugin {
        self.plugin.as_mut()
    }

    /// Counts one data poll; true on the first poll and then every `invoke_every`
    pub fn due(&mut self) -> bool {
        let due = self.polls % self.invoke_every == 0;
        self.polls = self.polls.wrapping_add(1);
        if !due {
            debug!(plugin = %self.plugin.name(), "skipping, invoked every {} polls", self.invoke_every);
        }
        due
    }
}

/// Write-once table of plugin constructors
#[derive(Clone, Default)]
pub struct PluginRegistry {
    factories: HashMap<String, PluginFactory>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        PluginRegistry::default()
    }

    pub fn with_builtins() -> Self {
        let mut registry = PluginRegistry::new();
        registry.register(aggregator::NAME, aggregator::Aggregator::build);
        registry.register(label_agent::NAME, label_agent::LabelAgent::build);
        registry
    }

    pub fn register(&mut self, name: &str, factory: PluginFactory) {
        self.factories.insert(name.to_string(), factory);
    }

    /// Builds every plugin declared by the collector, in order
    pub fn build_all(&self, ctx: &CollectorContext) -> Result<Vec<PluginSlot>, PollError> {
        ctx.spec
            .plugins
            .iter()
            .map(|spec| {
                let factory = self
                    .factories
                    .get(&spec.name)
                    .ok_or_else(|| PollError::InvalidParam(format!("unknown plugin: {}", spec.name)))?;
                Ok(PluginSlot::new(factory(spec, ctx)?, spec.invoke_every))
            })
            .collect()
    }
}

/// Values of one rule list of a plugin descriptor
pub(crate) fn rules<'a>(spec: &'a PluginSpec, kind: &str) -> &'a [String] {
    spec.params.get(kind).map(Vec::as_slice).unwrap_or_default()
}
