#![forbid(unsafe_code)]

//! Errors thrown while rendering or committing, and the boundaries that
//! catch them.

use std::cell::Cell;
use std::rc::Rc;

use fibra_harness::{Harness, Log, RecordingObserver};
use fibra_reconciler::fibra_core::{ComponentError, PropMap, PropValue, Throw};
use fibra_reconciler::{
    ClassComponent, ClassDef, ClassState, Cleanup, Element, ErrorInfo, FunctionComponent, Props, RenderResult,
};

struct Boundary {
    log: Log,
}

impl ClassComponent for Boundary {
    fn render(&self, props: &Props, state: &ClassState) -> RenderResult {
        match state.get("error").and_then(PropValue::as_str) {
            Some(message) => Ok(Element::text(format!("caught: {message}"))),
            None => Ok(Element::fragment(props.children().to_vec())),
        }
    }

    fn is_error_boundary(&self) -> bool {
        true
    }

    fn get_derived_state_from_error(&self, error: &ComponentError) -> Option<PropMap> {
        Some(PropMap::from([("error".to_string(), PropValue::from(error.message()))]))
    }

    fn component_did_catch(&mut self, error: &ComponentError, info: &ErrorInfo) {
        self.log.push(format!("did_catch {}", error.message()));
        if info.component_stack.is_empty() {
            self.log.push("empty stack");
        }
    }
}

fn boundary(name: &'static str, log: &Log) -> Rc<ClassDef> {
    let log = log.clone();
    ClassDef::new(name, move |_props, _updater| Box::new(Boundary { log: log.clone() }))
}

fn thrower(message: &'static str) -> Rc<FunctionComponent> {
    FunctionComponent::new("Thrower", move |_props, _hooks| Err(Throw::error(message)))
}

fn harness(log: &Log) -> Harness {
    Harness::legacy().with_observer(RecordingObserver::new(log.clone()).suppressing_uncaught())
}

fn observer_entries(log: &Log) -> Vec<String> {
    log.take()
        .into_iter()
        .filter(|e| !e.starts_with("commit"))
        .collect()
}

#[test]
fn boundary_renders_derived_state_after_a_render_error() {
    let log = Log::new();
    let mut h = harness(&log);
    let b = boundary("Boundary", &log);
    h.render(Element::host("main").child(Element::class(&b).child(Element::component(&thrower("boom")))))
        .expect("render");

    assert_eq!(h.markup(), "<main>caught: boom</main>");
    assert_eq!(observer_entries(&log), vec!["caught by Boundary: boom", "did_catch boom"]);
    assert!(h.host().violations().is_empty());
}

#[test]
fn panics_are_routed_like_thrown_errors() {
    let log = Log::new();
    let mut h = harness(&log);
    let b = boundary("Boundary", &log);
    let panicky = FunctionComponent::new("Panicky", |_props, _hooks| -> RenderResult { panic!("kaboom") });
    h.render(Element::class(&b).child(Element::component(&panicky)))
        .expect("render");
    assert_eq!(h.text(), "caught: kaboom");
}

#[test]
fn the_nearest_boundary_catches() {
    let log = Log::new();
    let mut h = harness(&log);
    let (outer, inner) = (boundary("Outer", &log), boundary("Inner", &log));
    h.render(Element::class(&outer).children([
        Element::text("safe "),
        Element::class(&inner).child(Element::component(&thrower("deep"))),
    ]))
    .expect("render");

    assert_eq!(h.text(), "safe caught: deep");
    assert_eq!(observer_entries(&log), vec!["caught by Inner: deep", "did_catch deep"]);
}

#[test]
fn uncaught_errors_unmount_the_whole_root() {
    let log = Log::new();
    let mut h = harness(&log);
    h.render(Element::host("div").child(Element::text("before")))
        .expect("render");
    assert_eq!(h.text(), "before");

    h.render(Element::host("div").child(Element::component(&thrower("fatal"))))
        .expect("render");
    assert_eq!(h.markup(), "");
    assert_eq!(observer_entries(&log), vec!["uncaught: fatal"]);

    // The root recovers on the next successful render.
    h.render(Element::text("after")).expect("render");
    assert_eq!(h.text(), "after");
}

struct FailsToMount;

impl ClassComponent for FailsToMount {
    fn render(&self, _props: &Props, _state: &ClassState) -> RenderResult {
        Ok(Element::text("mounted"))
    }

    fn component_did_mount(&mut self, _props: &Props, _state: &ClassState) -> Result<(), ComponentError> {
        Err(ComponentError::new("mount failed"))
    }
}

#[test]
fn lifecycle_errors_during_commit_reach_the_boundary() {
    let log = Log::new();
    let mut h = harness(&log);
    let b = boundary("Boundary", &log);
    let fragile = ClassDef::new("Fragile", |_props, _updater| Box::new(FailsToMount));
    h.render(Element::class(&b).child(Element::class(&fragile)))
        .expect("render");

    assert_eq!(h.text(), "caught: mount failed");
    assert!(observer_entries(&log).contains(&"caught by Boundary: mount failed".to_string()));
}

#[test]
fn effect_errors_during_commit_reach_the_boundary() {
    let log = Log::new();
    let mut h = harness(&log);
    let b = boundary("Boundary", &log);
    let measuring = FunctionComponent::new("Measuring", |_props, hooks| {
        hooks.use_layout_effect_with((), || -> Cleanup { panic!("layout exploded") });
        Ok(Element::text("content"))
    });
    h.render(Element::class(&b).child(Element::component(&measuring)))
        .expect("render");
    assert_eq!(h.text(), "caught: layout exploded");
}

#[test]
fn concurrent_renders_retry_once_before_giving_up() {
    let log = Log::new();
    let attempts = Rc::new(Cell::new(0));
    let a = attempts.clone();
    let flaky = FunctionComponent::new("Flaky", move |_props, _hooks| {
        a.set(a.get() + 1);
        if a.get() == 1 {
            return Err(Throw::error("first attempt"));
        }
        Ok(Element::text("recovered"))
    });
    let mut h = Harness::concurrent().with_observer(RecordingObserver::new(log.clone()));
    h.render(Element::component(&flaky)).expect("render");

    assert_eq!(h.text(), "recovered");
    assert_eq!(attempts.get(), 2);
    assert_eq!(observer_entries(&log), vec!["recoverable: first attempt"]);
}

#[test]
fn boundary_can_be_reset_by_new_props() {
    let log = Log::new();
    let mut h = harness(&log);
    let b = boundary("Boundary", &log);
    h.render(Element::class(&b).key("v1").child(Element::component(&thrower("boom"))))
        .expect("render");
    assert_eq!(h.text(), "caught: boom");

    // A new key remounts the boundary with fresh state.
    h.render(Element::class(&b).key("v2").child(Element::text("fine")))
        .expect("render");
    assert_eq!(h.text(), "fine");
}
