// The checker-chain runtime: stop/abort semantics and the deferred hook.

use std::sync::{Arc, Mutex};

use sebak::checker::{Checker, CheckerError, CheckerFunc, DeferFunc};
use sebak::error::Error;

#[derive(Clone, Debug, Default, PartialEq)]
struct Trace {
    steps: Vec<&'static str>,
}

fn step(name: &'static str) -> CheckerFunc<(), Trace> {
    Arc::new(move |_, mut ctx: Trace| {
        ctx.steps.push(name);
        Ok(ctx)
    })
}

#[test]
fn chain_runs_in_order_and_threads_context() {
    let chain: Checker<(), Trace> = Checker::builder()
        .add("first", step("first"))
        .add("second", step("second"))
        .add("third", step("third"))
        .build();

    let (ctx, outcome) = chain.run(&(), Trace::default());
    assert!(outcome.is_ok());
    assert_eq!(ctx.steps, vec!["first", "second", "third"]);
}

#[test]
fn stop_terminates_without_failing() {
    let stopper: CheckerFunc<(), Trace> = Arc::new(|_, mut ctx: Trace| {
        ctx.steps.push("stopper");
        Err((ctx, CheckerError::Stop("done early")))
    });

    let chain: Checker<(), Trace> = Checker::builder()
        .add("first", step("first"))
        .add("stopper", stopper)
        .add("unreached", step("unreached"))
        .build();

    let (ctx, outcome) = chain.run(&(), Trace::default());
    assert!(outcome.is_ok());
    assert_eq!(ctx.steps, vec!["first", "stopper"]);
}

#[test]
fn abort_surfaces_the_error_and_halts() {
    let aborter: CheckerFunc<(), Trace> = Arc::new(|_, ctx: Trace| {
        Err((ctx, CheckerError::Abort(Error::BallotAlreadyFinished)))
    });

    let chain: Checker<(), Trace> = Checker::builder()
        .add("first", step("first"))
        .add("aborter", aborter)
        .add("unreached", step("unreached"))
        .build();

    let (ctx, outcome) = chain.run(&(), Trace::default());
    assert_eq!(outcome, Err(Error::BallotAlreadyFinished));
    assert_eq!(ctx.steps, vec!["first"]);
}

#[test]
fn deferred_hook_observes_every_executed_step_in_order() {
    let seen: Arc<Mutex<Vec<(usize, &'static str, bool)>>> = Arc::new(Mutex::new(Vec::new()));
    let hook = Arc::clone(&seen);
    let defer: DeferFunc<Trace> = Arc::new(move |index, name, _, err| {
        hook.lock().unwrap().push((index, name, err.is_some()));
    });

    let stopper: CheckerFunc<(), Trace> =
        Arc::new(|_, ctx: Trace| Err((ctx, CheckerError::Stop("enough"))));

    let chain: Checker<(), Trace> = Checker::builder()
        .add("first", step("first"))
        .add("second", step("second"))
        .add("stopper", stopper)
        .add("unreached", step("unreached"))
        .defer_func(defer)
        .build();

    let (_, outcome) = chain.run(&(), Trace::default());
    assert!(outcome.is_ok());

    let seen = seen.lock().unwrap();
    assert_eq!(
        *seen,
        vec![
            (0, "first", false),
            (1, "second", false),
            (2, "stopper", true),
        ]
    );
}

#[test]
fn hook_sees_the_context_as_of_the_failing_step() {
    let captured: Arc<Mutex<Option<Trace>>> = Arc::new(Mutex::new(None));
    let hook = Arc::clone(&captured);
    let defer: DeferFunc<Trace> = Arc::new(move |_, _, ctx, err| {
        if err.is_some() {
            *hook.lock().unwrap() = Some(ctx.clone());
        }
    });

    let stopper: CheckerFunc<(), Trace> = Arc::new(|_, mut ctx: Trace| {
        ctx.steps.push("stopper");
        Err((ctx, CheckerError::Stop("enough")))
    });

    let chain: Checker<(), Trace> = Checker::builder()
        .add("first", step("first"))
        .add("stopper", stopper)
        .defer_func(defer)
        .build();

    chain.run(&(), Trace::default());
    assert_eq!(
        captured.lock().unwrap().as_ref().unwrap().steps,
        vec!["first", "stopper"]
    );
}
