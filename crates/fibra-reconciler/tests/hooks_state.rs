#![forbid(unsafe_code)]

//! State hooks: setters, reducers, bailouts and hook-order checks.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use fibra_harness::{Harness, Log};
use fibra_reconciler::fibra_core::{EventPriority, Lanes, PropValue, ReconcilerConfig, ReconcilerError};
use fibra_reconciler::{
    Dispatch, Element, ElementType, FunctionComponent, MemoComponent, RootTag, StateSetter, TransitionStarter,
};

type Slot<T> = Rc<RefCell<Option<T>>>;

fn slot<T>() -> Slot<T> {
    Rc::new(RefCell::new(None))
}

fn grab<T: Clone>(slot: &Slot<T>) -> T {
    slot.borrow().clone().expect("component rendered")
}

fn counter(log: &Log, setter: &Slot<StateSetter<i64>>) -> Rc<FunctionComponent> {
    let (log, setter) = (log.clone(), setter.clone());
    FunctionComponent::new("Counter", move |_props, hooks| {
        let (count, set) = hooks.use_state(|| 0_i64);
        log.push(format!("render {count}"));
        *setter.borrow_mut() = Some(set);
        Ok(Element::text(count.to_string()))
    })
}

#[test]
fn setter_rerenders_with_the_new_value() {
    let log = Log::new();
    let setter = slot();
    let mut h = Harness::legacy();
    h.render(Element::component(&counter(&log, &setter))).expect("render");
    assert_eq!(log.take(), vec!["render 0"]);

    h.act(|| grab(&setter).set(5)).expect("act");
    assert_eq!(h.text(), "5");
    assert_eq!(log.take(), vec!["render 5"]);
}

#[test]
fn setting_the_same_value_bails_out_before_rendering() {
    let log = Log::new();
    let setter = slot();
    let mut h = Harness::legacy();
    h.render(Element::component(&counter(&log, &setter))).expect("render");
    log.take();

    h.act(|| grab(&setter).set(0)).expect("act");
    assert!(log.take().is_empty());
    assert!(h.pending_lanes().is_empty());
}

#[test]
fn eager_bailout_can_be_disabled() {
    let log = Log::new();
    let setter = slot();
    let config = ReconcilerConfig::default().with_eager_state_bailout(false);
    let mut h = Harness::with_config(RootTag::Legacy, config);
    h.render(Element::component(&counter(&log, &setter))).expect("render");
    log.take();

    h.act(|| grab(&setter).set(0)).expect("act");
    assert_eq!(log.take(), vec!["render 0"]);
    assert_eq!(h.text(), "0");
}

#[test]
fn functional_updates_apply_in_order_in_one_render() {
    let log = Log::new();
    let setter = slot();
    let mut h = Harness::concurrent();
    h.render(Element::component(&counter(&log, &setter))).expect("render");
    log.take();

    h.act(|| {
        let set = grab(&setter);
        set.update(|n| n + 1);
        set.update(|n| n * 10);
    })
    .expect("act");
    assert_eq!(h.text(), "10");
    assert_eq!(log.take(), vec!["render 10"]);
}

#[test]
fn same_value_bails_out_on_concurrent_roots() {
    let log = Log::new();
    let setter = slot();
    let mut h = Harness::concurrent();
    h.render(Element::component(&counter(&log, &setter))).expect("render");
    log.take();

    h.act(|| grab(&setter).set(0)).expect("act");
    assert!(log.take().is_empty());
    assert!(h.pending_lanes().is_empty());
}

#[test]
fn same_value_renders_while_another_update_is_pending() {
    let log = Log::new();
    let setter = slot();
    let mut h = Harness::concurrent();
    h.render(Element::component(&counter(&log, &setter))).expect("render");
    log.take();

    // The second update cannot be checked eagerly: the first one is still
    // queued on the fiber, so the value it would compare against is stale.
    h.act(|| {
        let set = grab(&setter);
        set.set(5);
        set.set(0);
    })
    .expect("act");
    assert_eq!(log.take(), vec!["render 0"]);
    assert_eq!(h.text(), "0");
}

#[test]
fn skipped_transition_updates_are_rebased_after_a_sync_update() {
    let log = Log::new();
    let setter = slot();
    let (l, stash) = (log.clone(), setter.clone());
    let value = FunctionComponent::new("Value", move |_props, hooks| {
        let (n, set) = hooks.use_state(|| 1_i64);
        l.push(format!("render {n}"));
        *stash.borrow_mut() = Some(set);
        Ok(Element::text(n.to_string()))
    });
    let mut h = Harness::concurrent();
    h.render(Element::component(&value)).expect("render");
    log.take();

    let set: StateSetter<i64> = grab(&setter);
    h.reconciler
        .batched_updates(|r| {
            r.start_transition(|_| set.update(|n| n + 1)).expect("transition");
            r.with_event_priority(EventPriority::Discrete, |_| set.update(|n| n * 10))
                .expect("event");
            r.start_transition(|_| set.update(|n| n + 3)).expect("transition");
        })
        .expect("batch");
    // The sync pass skips +1 but still applies *10 to the state it has.
    assert_eq!(h.text(), "10");

    // The transition pass replays every update from the base state: (1 + 1) * 10 + 3.
    h.flush_all().expect("flush");
    assert_eq!(h.text(), "23");
    assert_eq!(log.take(), vec!["render 10", "render 23"]);
}

#[test]
fn a_panicking_transition_does_not_leak_its_priority() {
    let handles: Slot<(TransitionStarter, StateSetter<i64>)> = slot();
    let stash = handles.clone();
    let tabs = FunctionComponent::new("Tabs", move |_props, hooks| {
        let (tab, set_tab) = hooks.use_state(|| 0_i64);
        let (_pending, start) = hooks.use_transition();
        *stash.borrow_mut() = Some((start, set_tab));
        Ok(Element::text(tab.to_string()))
    });
    let mut h = Harness::concurrent();
    h.render(Element::component(&tabs)).expect("render");

    let (start, set_tab) = grab(&handles);
    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        start.start(|| panic!("transition body failed"));
    }));
    assert!(outcome.is_err());
    h.flush_all().expect("flush");
    assert!(h.pending_lanes().is_empty());

    set_tab.set(1);
    h.reconciler.process_updates().expect("process");
    assert_eq!(h.pending_lanes(), Lanes::DEFAULT);
    h.flush_all().expect("flush");
    assert_eq!(h.text(), "1");
}

#[derive(Debug)]
enum Action {
    Add(i64),
    Reset,
}

#[test]
fn reducer_folds_dispatched_actions() {
    let dispatch: Slot<Dispatch<Action>> = slot();
    let d = dispatch.clone();
    let total = FunctionComponent::new("Total", move |_props, hooks| {
        let (state, send) = hooks.use_reducer(
            |s: &i64, a: &Action| match a {
                Action::Add(n) => s + n,
                Action::Reset => 0,
            },
            || 100,
        );
        *d.borrow_mut() = Some(send);
        Ok(Element::text(format!("total={state}")))
    });

    let mut h = Harness::legacy();
    h.render(Element::component(&total)).expect("render");
    assert_eq!(h.text(), "total=100");

    h.act(|| {
        let send = grab(&dispatch);
        send.dispatch(Action::Add(5));
        send.dispatch(Action::Add(7));
    })
    .expect("act");
    assert_eq!(h.text(), "total=112");

    h.act(|| grab(&dispatch).dispatch(Action::Reset)).expect("act");
    assert_eq!(h.text(), "total=0");
}

#[test]
fn state_survives_parent_rerenders() {
    let log = Log::new();
    let setter = slot();
    let child = counter(&log, &setter);
    let mut h = Harness::legacy();
    h.render(Element::host("div").attr("v", 1).child(Element::component(&child)))
        .expect("render");
    h.act(|| grab(&setter).set(3)).expect("act");

    h.render(Element::host("div").attr("v", 2).child(Element::component(&child)))
        .expect("render");
    assert_eq!(h.markup(), r#"<div v=2>3</div>"#);
}

#[test]
fn memo_skips_children_whose_props_did_not_change() {
    let log = Log::new();
    let child_log = log.clone();
    let child = FunctionComponent::new("Leaf", move |props, _hooks| {
        let label = props.get("label").and_then(|v| v.as_str()).unwrap_or("").to_owned();
        child_log.push(format!("leaf {label}"));
        Ok(Element::text(label))
    });
    let memo = MemoComponent::new(ElementType::Function(child));

    let setter = slot();
    let (s, parent_log) = (setter.clone(), log.clone());
    let parent = FunctionComponent::new("Parent", move |_props, hooks| {
        let (count, set) = hooks.use_state(|| 0_i64);
        *s.borrow_mut() = Some(set);
        parent_log.push(format!("parent {count}"));
        let label = if *count < 2 { "low" } else { "high" };
        Ok(Element::fragment(vec![
            Element::text(count.to_string()),
            Element::memo(&memo).attr("label", label),
        ]))
    });

    let mut h = Harness::legacy();
    h.render(Element::component(&parent)).expect("render");
    assert_eq!(log.take(), vec!["parent 0", "leaf low"]);

    h.act(|| grab(&setter).set(1)).expect("act");
    assert_eq!(log.take(), vec!["parent 1"]);
    assert_eq!(h.text(), "1low");

    h.act(|| grab(&setter).set(2)).expect("act");
    assert_eq!(log.take(), vec!["parent 2", "leaf high"]);
    assert_eq!(h.text(), "2high");
}

#[test]
fn refs_and_memos_persist_across_renders() {
    let computed = Rc::new(Cell::new(0));
    let setter = slot();
    let (c, s) = (computed.clone(), setter.clone());
    let component = FunctionComponent::new("Stable", move |_props, hooks| {
        let (n, set) = hooks.use_state(|| 0_i64);
        *s.borrow_mut() = Some(set);
        let renders = hooks.use_ref(|| 0_u32);
        *renders.borrow_mut() += 1;
        let (c, key) = (c.clone(), *n % 2);
        let parity = hooks.use_memo(
            move || {
                c.set(c.get() + 1);
                if key == 0 { "even" } else { "odd" }
            },
            key,
        );
        Ok(Element::text(format!("{parity}:{}", renders.borrow())))
    });

    let mut h = Harness::legacy();
    h.render(Element::component(&component)).expect("render");
    assert_eq!(h.text(), "even:1");

    h.act(|| grab(&setter).set(2)).expect("act");
    assert_eq!(h.text(), "even:2");
    assert_eq!(computed.get(), 1);

    h.act(|| grab(&setter).set(3)).expect("act");
    assert_eq!(h.text(), "odd:3");
    assert_eq!(computed.get(), 2);
}

#[test]
fn changing_hook_order_is_a_fatal_error() {
    let swap = Rc::new(Cell::new(false));
    let flag = swap.clone();
    let flaky = FunctionComponent::new("Flaky", move |_props, hooks| {
        if flag.get() {
            hooks.use_ref(|| 0_u8);
        } else {
            hooks.use_state(|| 0_u8);
        }
        Ok(Element::empty())
    });

    let mut h = Harness::legacy();
    h.render(Element::component(&flaky)).expect("render");

    swap.set(true);
    let err = h.render(Element::component(&flaky)).expect_err("hook order");
    assert_eq!(
        err,
        ReconcilerError::HookOrder {
            component: "Flaky".into(),
            expected: "use_state",
            found: "use_ref",
        }
    );
}

#[test]
fn rendering_fewer_hooks_is_a_fatal_error() {
    let skip = Rc::new(Cell::new(false));
    let flag = skip.clone();
    let shrinking = FunctionComponent::new("Shrinking", move |_props, hooks| {
        hooks.use_state(|| 1_u8);
        if !flag.get() {
            hooks.use_state(|| 2_u8);
        }
        Ok(Element::empty())
    });

    let mut h = Harness::legacy();
    h.render(Element::component(&shrinking)).expect("render");

    skip.set(true);
    let err = h.render(Element::component(&shrinking)).expect_err("too few hooks");
    assert!(matches!(err, ReconcilerError::TooFewHooks { component } if component == "Shrinking"));
}

#[test]
fn render_phase_updates_settle_before_commit() {
    let log = Log::new();
    let l = log.clone();
    let clamp = FunctionComponent::new("Clamp", move |_props, hooks| {
        let (n, set) = hooks.use_state(|| 0_i64);
        if *n < 3 {
            set.set(*n + 1);
        }
        l.push(format!("render {n}"));
        Ok(Element::text(n.to_string()))
    });

    let mut h = Harness::legacy();
    h.render(Element::component(&clamp)).expect("render");
    assert_eq!(h.text(), "3");
    assert_eq!(log.take(), vec!["render 0", "render 1", "render 2", "render 3"]);
    assert_eq!(h.host().commit_count(), 1);
}

#[test]
fn host_callbacks_dispatch_into_state() {
    let clicker = FunctionComponent::new("Clicker", |_props, hooks| {
        let (clicks, set) = hooks.use_state(|| 0_i64);
        let on_click = PropValue::callback(move |_arg| set.update(|n| n + 1));
        Ok(Element::host("button")
            .attr("name", "inc")
            .attr("on_click", on_click)
            .child(Element::text(clicks.to_string())))
    });

    let mut h = Harness::legacy();
    h.render(Element::component(&clicker)).expect("render");
    let button = h.host().find(h.container(), "name", "inc").expect("button");

    for _ in 0..3 {
        // Handlers are re-created every render; read the committed one.
        let on_click = h.host().prop(button, "on_click").cloned().expect("handler");
        h.act(|| on_click.call(&PropValue::Null)).expect("act");
    }
    assert!(h.host().dispatch(button, "on_click", &PropValue::Null));
    h.act(|| ()).expect("act");
    assert_eq!(h.text(), "4");
}
