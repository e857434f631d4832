// Checker chains: ordered compositions of small validation steps sharing a
// typed context. A step may stop the chain without failing it, and a
// deferred hook observes every executed step in order.

use std::sync::Arc;

use crate::error::Error;

/// How a checker terminates a chain early. `Stop` ends the run without it
/// being a failure; `Abort` carries a real error out.
#[derive(Debug, Clone)]
pub enum CheckerError {
    Stop(&'static str),
    Abort(Error),
}

impl CheckerError {
    pub fn is_stop(&self) -> bool {
        matches!(self, CheckerError::Stop(_))
    }
}

impl From<Error> for CheckerError {
    fn from(err: Error) -> Self {
        CheckerError::Abort(err)
    }
}

/// Checkers consume the context and hand a successor context to the next
/// step; on early termination the context rides back with the error so the
/// deferred hook still sees the final state.
pub type CheckerResult<C> = Result<C, (C, CheckerError)>;

pub type CheckerFunc<T, C> = Arc<dyn Fn(&T, C) -> CheckerResult<C> + Send + Sync>;

/// Invoked exactly once per executed step, in execution order, after the
/// step completes. The last invocation carries the terminating error if any.
pub type DeferFunc<C> = Arc<dyn Fn(usize, &'static str, &C, Option<&CheckerError>) + Send + Sync>;

pub struct Checker<T, C> {
    funcs: Vec<(&'static str, CheckerFunc<T, C>)>,
    defer_func: Option<DeferFunc<C>>,
}

impl<T, C> Checker<T, C> {
    pub fn builder() -> CheckerBuilder<T, C> {
        CheckerBuilder {
            funcs: Vec::new(),
            defer_func: None,
        }
    }

    /// Runs the chain. `Stop` yields `Ok`; `Abort` yields the inner error.
    /// The context as of the last executed step is returned either way.
    pub fn run(&self, target: &T, ctx: C) -> (C, Result<(), Error>) {
        let mut ctx = ctx;
        for (index, (name, func)) in self.funcs.iter().enumerate() {
            ctx = match func(target, ctx) {
                Ok(next) => {
                    if let Some(defer) = &self.defer_func {
                        defer(index, *name, &next, None);
                    }
                    next
                }
                Err((last, err)) => {
                    if let Some(defer) = &self.defer_func {
                        defer(index, *name, &last, Some(&err));
                    }
                    let outcome = match err {
                        CheckerError::Stop(_) => Ok(()),
                        CheckerError::Abort(err) => Err(err),
                    };
                    return (last, outcome);
                }
            };
        }
        (ctx, Ok(()))
    }
}

pub struct CheckerBuilder<T, C> {
    funcs: Vec<(&'static str, CheckerFunc<T, C>)>,
    defer_func: Option<DeferFunc<C>>,
}

impl<T, C> CheckerBuilder<T, C> {
    pub fn add(mut self, name: &'static str, func: CheckerFunc<T, C>) -> Self {
        self.funcs.push((name, func));
        self
    }

    pub fn defer_func(mut self, defer: DeferFunc<C>) -> Self {
        self.defer_func = Some(defer);
        self
    }

    pub fn build(self) -> Checker<T, C> {
        Checker {
            funcs: self.funcs,
            defer_func: self.defer_func,
        }
    }
}
