//! Stages and workflow shapes.
//!
//! A [`Workflow`] is a tree of stages:
//!
//! - `Stage`: one operation call.
//! - `Sequence`: children run strictly in order; each child's output is
//!   prepended to the next child's positional arguments.
//! - `FanOut`: branches run concurrently on the same input; once all have
//!   succeeded, the continuation runs with their outputs as an array. Any
//!   failed branch fails the fan-out and the continuation never runs.

use colander_core::{Kwargs, Priority, Value};

/// One operation call inside a workflow.
#[derive(Debug, Clone, PartialEq)]
pub struct Stage {
    pub operation: String,
    pub args: Vec<Value>,
    pub kwargs: Kwargs,
    /// `None` until stamped by the dispatcher, unless set explicitly.
    pub priority: Option<Priority>,
    pub use_cache: bool,
}

impl Stage {
    #[must_use]
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            args: Vec::new(),
            kwargs: Kwargs::new(),
            priority: None,
            use_cache: true,
        }
    }

    #[must_use]
    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    #[must_use]
    pub fn kwarg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(name.into(), value.into());
        self
    }

    /// Pins this stage to `priority`, overriding the submission's.
    #[must_use]
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    #[must_use]
    pub fn use_cache(mut self, use_cache: bool) -> Self {
        self.use_cache = use_cache;
        self
    }
}

/// A tree of stages submitted as one unit.
#[derive(Debug, Clone, PartialEq)]
pub enum Workflow {
    Stage(Stage),
    Sequence(Vec<Workflow>),
    FanOut {
        branches: Vec<Workflow>,
        continuation: Stage,
    },
}

impl Workflow {
    #[must_use]
    pub fn sequence(stages: impl IntoIterator<Item = Stage>) -> Self {
        Workflow::Sequence(stages.into_iter().map(Workflow::Stage).collect())
    }

    #[must_use]
    pub fn fan_out(branches: impl IntoIterator<Item = Stage>, continuation: Stage) -> Self {
        Workflow::FanOut {
            branches: branches.into_iter().map(Workflow::Stage).collect(),
            continuation,
        }
    }

    /// Sets `priority` on every stage that has none.
    pub fn stamp(&mut self, priority: Priority) {
        match self {
            Workflow::Stage(stage) => {
                stage.priority.get_or_insert(priority);
            }
            Workflow::Sequence(children) => {
                for child in children {
                    child.stamp(priority);
                }
            }
            Workflow::FanOut {
                branches,
                continuation,
            } => {
                for branch in branches {
                    branch.stamp(priority);
                }
                continuation.priority.get_or_insert(priority);
            }
        }
    }

    /// All stages in depth-first order.
    #[must_use]
    pub fn stages(&self) -> Vec<&Stage> {
        let mut out = Vec::new();
        self.collect_stages(&mut out);
        out
    }

    fn collect_stages<'a>(&'a self, out: &mut Vec<&'a Stage>) {
        match self {
            Workflow::Stage(stage) => out.push(stage),
            Workflow::Sequence(children) => {
                for child in children {
                    child.collect_stages(out);
                }
            }
            Workflow::FanOut {
                branches,
                continuation,
            } => {
                for branch in branches {
                    branch.collect_stages(out);
                }
                out.push(continuation);
            }
        }
    }
}

impl From<Stage> for Workflow {
    fn from(stage: Stage) -> Self {
        Workflow::Stage(stage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stamp_fills_unset_priorities_only() {
        let mut wf = Workflow::Sequence(vec![
            Workflow::fan_out(
                [
                    Stage::new("GetCompetitivePricingForASIN"),
                    Stage::new("ItemLookup").priority(Priority::High),
                ],
                Stage::new("updateListing"),
            ),
            Stage::new("updateFbaFees").into(),
        ]);
        wf.stamp(Priority::Medium);

        let priorities: Vec<_> = wf.stages().iter().map(|s| s.priority).collect();
        assert_eq!(
            priorities,
            vec![
                Some(Priority::Medium),
                Some(Priority::High),
                Some(Priority::Medium),
                Some(Priority::Medium),
            ]
        );
    }

    #[test]
    fn builder() {
        let stage = Stage::new("ItemSearch")
            .arg("lamp")
            .kwarg("SearchIndex", "Home")
            .use_cache(false);
        assert_eq!(stage.args, vec![Value::from("lamp")]);
        assert_eq!(stage.kwargs.get("SearchIndex"), Some(&Value::from("Home")));
        assert!(!stage.use_cache);
        assert_eq!(stage.priority, None);
    }
}
