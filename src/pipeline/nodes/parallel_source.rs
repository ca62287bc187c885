//! Per-host entry point inserted by the deployment planner.

use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::graph::DEFAULT_CHANNEL;
use crate::pipeline::module::{Module, ModuleCore};
use crate::pipeline::shutdown::ShutdownSignal;

/// Pseudo-source that drives every sink on `default` as a source, each on
/// its own thread, and returns once all of them have returned.
#[derive(Debug)]
pub struct ParallelSource {
    core: ModuleCore,
}

impl ParallelSource {
    pub fn new(id: &str) -> Self {
        Self {
            core: ModuleCore::new(id),
        }
    }
}

impl Module for ParallelSource {
    fn core(&self) -> &ModuleCore {
        &self.core
    }

    fn type_name(&self) -> &str {
        "ParProcessor"
    }

    fn start_processing(&self, signal: &ShutdownSignal) -> PipelineResult<()> {
        let sources = self.core.sinks(DEFAULT_CHANNEL);
        tracing::info!(
            module = %self.core.id(),
            sources = sources.len(),
            "starting sources"
        );
        let results: Vec<PipelineResult<()>> = std::thread::scope(|scope| {
            let handles: Vec<_> = sources
                .iter()
                .map(|link| scope.spawn(move || link.module.start_processing(signal)))
                .collect();
            handles
                .into_iter()
                .map(|h| {
                    h.join().unwrap_or_else(|_| {
                        Err(PipelineError::module(self.core.id(), "source thread panicked"))
                    })
                })
                .collect()
        });
        results.into_iter().collect()
    }
}
