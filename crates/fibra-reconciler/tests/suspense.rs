#![forbid(unsafe_code)]

//! Suspense boundaries, lazy components and suspended transitions.

use std::cell::RefCell;
use std::rc::Rc;

use fibra_harness::{Harness, Log, RecordingObserver};
use fibra_reconciler::fibra_core::{Throw, Wakeable};
use fibra_reconciler::{Cleanup, Element, ElementType, FunctionComponent, LazyComponent, LazyResolver};

/// Renders `label` once `gate` resolved, suspends on it before that.
fn gated(label: &'static str, gate: &Wakeable) -> Rc<FunctionComponent> {
    let gate = gate.clone();
    FunctionComponent::new("Gated", move |_props, _hooks| {
        if gate.is_pending() {
            return Err(Throw::Suspend(gate.clone()));
        }
        Ok(Element::text(label))
    })
}

fn boundary(children: Vec<Element>) -> Element {
    Element::suspense(Element::text("loading"), children)
}

#[test]
fn concurrent_mount_shows_the_fallback_until_data_arrives() {
    let gate = Wakeable::new();
    let mut h = Harness::concurrent();
    h.render(boundary(vec![Element::component(&gated("ready", &gate))]))
        .expect("render");
    assert_eq!(h.text(), "loading");

    h.act(|| gate.resolve()).expect("act");
    h.flush_all().expect("flush");
    assert_eq!(h.text(), "ready");
    assert!(h.host().violations().is_empty());
}

#[test]
fn legacy_mount_shows_the_fallback_until_data_arrives() {
    let gate = Wakeable::new();
    let mut h = Harness::legacy();
    h.render(Element::host("section").child(boundary(vec![Element::component(&gated("ready", &gate))])))
        .expect("render");
    assert_eq!(h.text(), "loading");

    h.act(|| gate.resolve()).expect("act");
    h.flush_all().expect("flush");
    assert_eq!(h.text(), "ready");
    assert!(h.host().violations().is_empty());
}

#[test]
fn lazy_components_render_once_loaded() {
    let pending: Rc<RefCell<Option<LazyResolver>>> = Rc::default();
    let stash = pending.clone();
    let lazy = LazyComponent::new("Chart", move |resolver| *stash.borrow_mut() = Some(resolver));
    let chart = FunctionComponent::new("Chart", |props, _hooks| {
        let title = props.get("title").and_then(|v| v.as_str()).unwrap_or_default();
        Ok(Element::host("chart").child(Element::text(title)))
    });

    let mut h = Harness::concurrent();
    h.render(boundary(vec![Element::lazy(&lazy).attr("title", "sales")]))
        .expect("render");
    assert_eq!(h.text(), "loading");

    let resolver = pending.borrow_mut().take().expect("loader ran on first render");
    h.act(|| resolver.resolve(ElementType::Function(chart))).expect("act");
    h.flush_all().expect("flush");
    assert_eq!(h.markup(), "<chart>sales</chart>");
}

#[test]
fn updates_that_suspend_keep_the_old_content_briefly() {
    let gate = Wakeable::new();
    let mut h = Harness::concurrent();
    h.render(boundary(vec![Element::text("old")])).expect("render");

    h.update(boundary(vec![Element::component(&gated("new", &gate))]))
        .expect("update");
    h.flush_work().expect("flush");
    assert_eq!(h.text(), "old");

    // The fallback commits once the suspended commit's delay elapses.
    h.flush_all().expect("flush");
    assert_eq!(h.text(), "loading");
    assert!(h.markup().contains(" hidden"), "{}", h.markup());

    h.act(|| gate.resolve()).expect("act");
    h.flush_all().expect("flush");
    assert_eq!(h.text(), "new");
    assert!(!h.markup().contains(" hidden"));
}

#[test]
fn suspended_transitions_keep_the_previous_screen() {
    let gate = Wakeable::new();
    let mut h = Harness::concurrent();
    h.render(boundary(vec![Element::text("old")])).expect("render");

    let root = h.root();
    let next = boundary(vec![Element::component(&gated("new", &gate))]);
    h.reconciler
        .start_transition(|r| r.update_container(root, next))
        .expect("transition")
        .expect("update");
    h.flush_all().expect("flush");
    assert_eq!(h.text(), "old");
    assert!(!h.pending_lanes().is_empty());

    h.act(|| gate.resolve()).expect("act");
    h.flush_all().expect("flush");
    assert_eq!(h.text(), "new");
    assert!(h.pending_lanes().is_empty());
}

#[test]
fn suspending_on_a_sync_lane_without_a_boundary_is_uncaught() {
    let log = Log::new();
    let gate = Wakeable::new();
    let mut h = Harness::legacy().with_observer(RecordingObserver::new(log.clone()).suppressing_uncaught());
    h.render(Element::component(&gated("never", &gate))).expect("render");
    assert_eq!(h.markup(), "");
    let uncaught: Vec<String> = log.take().into_iter().filter(|e| e.starts_with("uncaught")).collect();
    assert_eq!(uncaught.len(), 1);
    assert!(uncaught[0].contains("wrap it in a suspense boundary"), "{uncaught:?}");
}

#[test]
fn resolving_a_boundary_leaves_siblings_mounted() {
    let log = Log::new();
    let gate = Wakeable::new();
    let sibling = {
        let log = log.clone();
        FunctionComponent::new("Sibling", move |_props, hooks| {
            log.push("render sibling");
            let l = log.clone();
            hooks.use_effect_with((), move || {
                l.push("mount sibling");
                let l = l.clone();
                Cleanup::new(move || l.push("unmount sibling"))
            });
            Ok(Element::text("side "))
        })
    };
    let content = {
        let (log, gate) = (log.clone(), gate.clone());
        FunctionComponent::new("Content", move |_props, _hooks| {
            if gate.is_pending() {
                return Err(Throw::Suspend(gate.clone()));
            }
            log.push("render content");
            Ok(Element::text("content"))
        })
    };

    let mut h = Harness::concurrent();
    h.render(Element::fragment(vec![
        Element::component(&sibling),
        boundary(vec![Element::component(&content)]),
    ]))
    .expect("render");
    assert_eq!(h.text(), "side loading");
    assert_eq!(log.take(), vec!["render sibling", "mount sibling"]);

    h.act(|| gate.resolve()).expect("act");
    h.flush_all().expect("flush");
    assert_eq!(h.text(), "side content");
    assert_eq!(log.take(), vec!["render content"]);
}
