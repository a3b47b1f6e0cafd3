#![forbid(unsafe_code)]

//! Class component lifecycles and the updater.

use std::any::Any;
use std::cell::RefCell;
use std::rc::Rc;

use fibra_harness::{Harness, Log};
use fibra_reconciler::fibra_core::{ComponentError, PropMap, PropValue};
use fibra_reconciler::{ClassComponent, ClassDef, ClassState, Element, Props, RenderResult, Updater};

fn count(state: &ClassState) -> i64 {
    state.get("count").and_then(PropValue::as_int).unwrap_or_default()
}

fn count_state(n: i64) -> PropMap {
    PropMap::from([("count".to_string(), PropValue::from(n))])
}

struct Counter {
    log: Log,
}

impl ClassComponent for Counter {
    fn render(&self, props: &Props, state: &ClassState) -> RenderResult {
        let label = props.get("label").and_then(PropValue::as_str).unwrap_or("count");
        self.log.push(format!("render {}", count(state)));
        Ok(Element::text(format!("{label}={}", count(state))))
    }

    fn component_did_mount(&mut self, _props: &Props, state: &ClassState) -> Result<(), ComponentError> {
        self.log.push(format!("did_mount {}", count(state)));
        Ok(())
    }

    fn get_snapshot_before_update(
        &mut self,
        _prev_props: &Props,
        prev_state: &ClassState,
    ) -> Result<Option<Rc<dyn Any>>, ComponentError> {
        Ok(Some(Rc::new(count(prev_state) * 100)))
    }

    fn component_did_update(
        &mut self,
        _props: &Props,
        state: &ClassState,
        _prev_props: &Props,
        prev_state: &ClassState,
        snapshot: Option<Rc<dyn Any>>,
    ) -> Result<(), ComponentError> {
        let snapshot = snapshot.and_then(|s| s.downcast_ref::<i64>().copied());
        self.log.push(format!(
            "did_update {}->{} snapshot={snapshot:?}",
            count(prev_state),
            count(state)
        ));
        Ok(())
    }

    fn component_will_unmount(&mut self) -> Result<(), ComponentError> {
        self.log.push("will_unmount");
        Ok(())
    }

    fn should_component_update(&self, _next_props: &Props, next_state: &ClassState) -> bool {
        // Odd counts are never shown.
        count(next_state) % 2 == 0
    }
}

type UpdaterSlot = Rc<RefCell<Option<Updater>>>;

fn counter(log: &Log, updater: &UpdaterSlot) -> Rc<ClassDef> {
    let (log, updater) = (log.clone(), updater.clone());
    ClassDef::with_initial_state(
        "Counter",
        |_props| count_state(0),
        move |_props, u| -> Box<dyn ClassComponent> {
            *updater.borrow_mut() = Some(u);
            Box::new(Counter { log: log.clone() })
        },
    )
}

fn grab(slot: &UpdaterSlot) -> Updater {
    slot.borrow().clone().expect("constructed")
}

#[test]
fn lifecycles_run_in_commit_order() {
    let log = Log::new();
    let updater = UpdaterSlot::default();
    let mut h = Harness::legacy();
    h.render(Element::class(&counter(&log, &updater))).expect("render");
    assert_eq!(log.take(), vec!["render 0", "did_mount 0"]);

    h.act(|| grab(&updater).set_state(count_state(2))).expect("act");
    assert_eq!(log.take(), vec!["render 2", "did_update 0->2 snapshot=Some(0)"]);
    assert_eq!(h.text(), "count=2");

    h.unmount().expect("unmount");
    assert_eq!(log.take(), vec!["will_unmount"]);
}

#[test]
fn should_component_update_can_skip_a_render() {
    let log = Log::new();
    let updater = UpdaterSlot::default();
    let mut h = Harness::legacy();
    h.render(Element::class(&counter(&log, &updater))).expect("render");
    log.take();

    h.act(|| grab(&updater).set_state(count_state(3))).expect("act");
    assert!(log.take().is_empty());
    assert_eq!(h.text(), "count=0");

    // The skipped state is still committed and visible to the next update.
    h.act(|| {
        grab(&updater).set_state_with(|state, _props| Some(count_state(count(state) + 1)));
    })
    .expect("act");
    assert_eq!(h.text(), "count=4");
}

#[test]
fn force_update_bypasses_should_component_update() {
    let log = Log::new();
    let updater = UpdaterSlot::default();
    let mut h = Harness::legacy();
    h.render(Element::class(&counter(&log, &updater))).expect("render");
    h.act(|| grab(&updater).set_state(count_state(5))).expect("act");
    log.take();

    h.act(|| grab(&updater).force_update()).expect("act");
    assert_eq!(log.take().first().map(String::as_str), Some("render 5"));
    assert_eq!(h.text(), "count=5");
}

#[test]
fn set_state_callbacks_run_after_the_commit() {
    let log = Log::new();
    let updater = UpdaterSlot::default();
    let mut h = Harness::legacy();
    h.render(Element::class(&counter(&log, &updater))).expect("render");
    log.take();

    let l = log.clone();
    h.act(|| grab(&updater).set_state_then(count_state(2), move || l.push("callback")))
        .expect("act");
    assert_eq!(
        log.take(),
        vec!["render 2", "did_update 0->2 snapshot=Some(0)", "callback"]
    );
}

#[test]
fn replace_state_drops_other_keys() {
    let log = Log::new();
    let updater = UpdaterSlot::default();
    let mut h = Harness::legacy();
    h.render(Element::class(&counter(&log, &updater))).expect("render");

    h.act(|| {
        let mut next = count_state(2);
        next.insert("extra".into(), PropValue::from(true));
        grab(&updater).set_state(next);
    })
    .expect("act");
    h.act(|| grab(&updater).replace_state(PropMap::new())).expect("act");
    // An empty state reads as count 0, which passes the even-count check.
    assert_eq!(h.text(), "count=0");
}

#[test]
fn new_props_re_render_the_instance() {
    let log = Log::new();
    let updater = UpdaterSlot::default();
    let def = counter(&log, &updater);
    let mut h = Harness::legacy();
    h.render(Element::class(&def).attr("label", "a")).expect("render");
    h.render(Element::class(&def).attr("label", "b")).expect("render");
    assert_eq!(h.text(), "b=0");
}

struct Mirror;

impl ClassComponent for Mirror {
    fn render(&self, _props: &Props, state: &ClassState) -> RenderResult {
        Ok(Element::text(format!("mirrored {}", count(state))))
    }

    fn get_derived_state_from_props(&self, props: &Props, _state: &ClassState) -> Option<PropMap> {
        props
            .get("source")
            .and_then(PropValue::as_int)
            .map(count_state)
    }
}

#[test]
fn derived_state_follows_props() {
    let mirror = ClassDef::new("Mirror", |_props, _updater| -> Box<dyn ClassComponent> { Box::new(Mirror) });
    let mut h = Harness::legacy();
    h.render(Element::class(&mirror).attr("source", 7)).expect("render");
    assert_eq!(h.text(), "mirrored 7");

    h.render(Element::class(&mirror).attr("source", 9)).expect("render");
    assert_eq!(h.text(), "mirrored 9");
}

struct Pure {
    log: Log,
}

impl ClassComponent for Pure {
    fn render(&self, props: &Props, _state: &ClassState) -> RenderResult {
        let name = props.get("name").and_then(PropValue::as_str).unwrap_or_default();
        self.log.push(format!("pure {name}"));
        Ok(Element::text(name))
    }

    fn is_pure(&self) -> bool {
        true
    }
}

#[test]
fn pure_components_skip_equal_props() {
    let log = Log::new();
    let l = log.clone();
    let pure = ClassDef::new("Pure", move |_props, _updater| -> Box<dyn ClassComponent> {
        Box::new(Pure { log: l.clone() })
    });
    let mut h = Harness::legacy();
    let tree = |v: i64, name: &str| Element::host("div").attr("v", v).child(Element::class(&pure).attr("name", name));
    h.render(tree(1, "x")).expect("render");
    h.render(tree(2, "x")).expect("render");
    h.render(tree(3, "y")).expect("render");
    assert_eq!(log.take(), vec!["pure x", "pure y"]);
}
