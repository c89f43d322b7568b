use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use std::collections::HashSet;
use std::future::Future;
use tracing::debug;

use crate::error::PipelineError;

/// A directed acyclic graph of named one-shot stages with declared data
/// dependencies, run by a minimal scheduler: stages whose dependencies have
/// completed run concurrently, dependents wait, and the first stage error
/// aborts everything still outstanding.
///
/// Dependencies must name stages added earlier, which keeps the graph acyclic
/// by construction.
#[derive(Default)]
pub struct StageGraph {
    stages: Vec<Stage>,
}

struct Stage {
    name: &'static str,
    deps: Vec<&'static str>,
    task: BoxFuture<'static, Result<(), PipelineError>>,
}

impl StageGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a stage. Panics on a duplicate name or a dependency that has not
    /// been added yet; both are construction bugs, not runtime conditions.
    pub fn add_stage<F>(&mut self, name: &'static str, deps: &[&'static str], task: F)
    where
        F: Future<Output = Result<(), PipelineError>> + Send + 'static,
    {
        assert!(
            self.stages.iter().all(|s| s.name != name),
            "duplicate stage name {name:?}"
        );
        for dep in deps {
            assert!(
                self.stages.iter().any(|s| s.name == *dep),
                "stage {name:?} depends on unknown stage {dep:?}"
            );
        }
        self.stages.push(Stage {
            name,
            deps: deps.to_vec(),
            task: task.boxed(),
        });
    }

    /// Drives the graph to completion, returning the first stage error.
    pub async fn run(self) -> Result<(), PipelineError> {
        let mut pending = self.stages;
        let mut completed: HashSet<&'static str> = HashSet::new();
        let mut running: FuturesUnordered<
            BoxFuture<'static, (&'static str, Result<(), PipelineError>)>,
        > = FuturesUnordered::new();

        loop {
            let mut i = 0;
            while i < pending.len() {
                if pending[i].deps.iter().all(|d| completed.contains(d)) {
                    let stage = pending.remove(i);
                    let name = stage.name;
                    let task = stage.task;
                    debug!(stage = name, "stage ready");
                    running.push(async move { (name, task.await) }.boxed());
                } else {
                    i += 1;
                }
            }

            match running.next().await {
                Some((name, Ok(()))) => {
                    debug!(stage = name, "stage complete");
                    completed.insert(name);
                }
                // Dropping `running` and `pending` abandons everything else.
                Some((_, Err(e))) => return Err(e),
                None => {
                    debug_assert!(pending.is_empty(), "stages left with unmet dependencies");
                    return Ok(());
                }
            }
        }
    }
}
