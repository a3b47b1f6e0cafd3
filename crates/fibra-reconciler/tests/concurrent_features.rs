#![forbid(unsafe_code)]

//! Offscreen subtrees, external stores and suspense lists.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use fibra_harness::Harness;
use fibra_reconciler::fibra_core::{Throw, Wakeable};
use fibra_reconciler::{
    Cleanup, Element, FunctionComponent, OffscreenMode, RevealOrder, StoreListener, Subscribe,
    SuspenseListConfig,
};

// -- offscreen ---------------------------------------------------------------

fn panel(mode: OffscreenMode) -> Element {
    Element::host("main").child(Element::offscreen(
        mode,
        vec![Element::host("p").child(Element::text("secret"))],
    ))
}

#[test]
fn hidden_offscreen_subtrees_render_later_and_stay_hidden() {
    let mut h = Harness::concurrent();
    h.render(panel(OffscreenMode::Hidden)).expect("render");
    assert!(h.markup().contains("secret"), "{}", h.markup());
    assert!(h.markup().contains(" hidden"), "{}", h.markup());
    assert_eq!(h.text(), "");

    h.render(panel(OffscreenMode::Visible)).expect("render");
    assert_eq!(h.text(), "secret");
    assert!(!h.markup().contains(" hidden"));
    assert!(h.host().violations().is_empty());
}

// -- external stores ---------------------------------------------------------

#[derive(Default)]
struct Store {
    value: Cell<i64>,
    listeners: RefCell<Vec<StoreListener>>,
    subscribed: Cell<usize>,
}

impl Store {
    /// Change the value without telling subscribers.
    fn mutate(&self, value: i64) {
        self.value.set(value);
    }

    fn set(&self, value: i64) {
        self.mutate(value);
        let listeners = self.listeners.borrow().clone();
        for listener in listeners {
            listener();
        }
    }
}

fn store_handles(store: &Rc<Store>) -> (Subscribe, Rc<dyn Fn() -> i64>) {
    let s = store.clone();
    let subscribe: Subscribe = Rc::new(move |listener: StoreListener| {
        s.listeners.borrow_mut().push(listener);
        s.subscribed.set(s.subscribed.get() + 1);
        let s = s.clone();
        Cleanup::new(move || {
            s.listeners.borrow_mut().clear();
            s.subscribed.set(s.subscribed.get() - 1);
        })
    });
    let s = store.clone();
    let get_snapshot: Rc<dyn Fn() -> i64> = Rc::new(move || s.value.get());
    (subscribe, get_snapshot)
}

fn reader(store: &Rc<Store>) -> Rc<FunctionComponent> {
    let (subscribe, get_snapshot) = store_handles(store);
    FunctionComponent::new("Reader", move |_props, hooks| {
        let value = hooks.use_sync_external_store(&subscribe, &get_snapshot);
        Ok(Element::text(value.to_string()))
    })
}

#[test]
fn store_changes_re_render_subscribers() {
    let store = Rc::new(Store::default());
    let mut h = Harness::legacy();
    h.render(Element::component(&reader(&store))).expect("render");
    assert_eq!(h.text(), "0");
    assert_eq!(store.subscribed.get(), 1);

    h.act(|| store.set(5)).expect("act");
    assert_eq!(h.text(), "5");

    h.unmount().expect("unmount");
    assert_eq!(store.subscribed.get(), 0);
}

#[test]
fn sliced_renders_never_commit_a_torn_store_read() {
    let store = Rc::new(Store::default());
    store.mutate(1);
    let r = reader(&store);
    let tree = Element::fragment(vec![
        Element::component(&r),
        Element::host("ul").children((0..10).map(|i| Element::host("li").key(i.to_string()).child(Element::text("x")))),
        Element::component(&r),
    ]);

    let mut h = Harness::concurrent();
    h.scheduler().set_slice(Some(1));
    let root = h.root();
    h.reconciler
        .start_transition(|rec| rec.update_container(root, tree))
        .expect("transition")
        .expect("update");
    for _ in 0..4 {
        h.run_next().expect("run");
    }
    assert!(h.reconciler.is_rendering(root));

    // The first reader already saw 1; the second will see 7.
    store.mutate(7);
    h.flush_work().expect("flush");
    assert_eq!(h.text(), format!("7{}7", "x".repeat(10)));
}

// -- suspense lists ----------------------------------------------------------

fn gated(label: &'static str, gate: &Wakeable) -> Rc<FunctionComponent> {
    let gate = gate.clone();
    FunctionComponent::new(label, move |_props, _hooks| {
        if gate.is_pending() {
            return Err(Throw::Suspend(gate.clone()));
        }
        Ok(Element::text(label))
    })
}

#[test]
fn together_lists_reveal_rows_at_once() {
    let (a, b) = (Wakeable::new(), Wakeable::new());
    let config = SuspenseListConfig {
        reveal_order: Some(RevealOrder::Together),
        tail: None,
    };
    let list = Element::suspense_list(
        config,
        vec![
            Element::suspense(Element::text("[a]"), vec![Element::component(&gated("A", &a))]),
            Element::suspense(Element::text("[b]"), vec![Element::component(&gated("B", &b))]),
        ],
    );

    let mut h = Harness::concurrent();
    h.render(list).expect("render");
    assert_eq!(h.text(), "[a][b]");

    h.act(|| a.resolve()).expect("act");
    h.flush_all().expect("flush");
    assert_eq!(h.text(), "[a][b]");

    h.act(|| b.resolve()).expect("act");
    h.flush_all().expect("flush");
    assert_eq!(h.text(), "AB");
    assert!(h.host().violations().is_empty());
}
