#![forbid(unsafe_code)]

//! Context providers, consumers and change propagation.

use std::cell::RefCell;
use std::rc::Rc;

use fibra_harness::{Harness, Log};
use fibra_reconciler::{Context, Element, ElementType, FunctionComponent, MemoComponent, StateSetter};

fn label(theme: &Context<String>, log: &Log) -> Rc<FunctionComponent> {
    let (theme, log) = (theme.clone(), log.clone());
    FunctionComponent::new("Label", move |_props, hooks| {
        let value = hooks.use_context(&theme);
        log.push(format!("label {value}"));
        Ok(Element::text(value.as_str()))
    })
}

#[test]
fn consumers_without_a_provider_read_the_default() {
    let log = Log::new();
    let theme = Context::new("Theme", "light".to_string());
    let mut h = Harness::legacy();
    h.render(Element::component(&label(&theme, &log))).expect("render");
    assert_eq!(h.text(), "light");
}

#[test]
fn the_nearest_provider_wins() {
    let log = Log::new();
    let theme = Context::new("Theme", "light".to_string());
    let l = label(&theme, &log);
    let mut h = Harness::legacy();
    h.render(theme.provider(
        "dark".into(),
        vec![
            Element::component(&l),
            theme.provider("blue".into(), vec![Element::text("/"), Element::component(&l)]),
        ],
    ))
    .expect("render");
    assert_eq!(h.text(), "dark/blue");
}

#[test]
fn provider_changes_reach_consumers_below_a_memo_bailout() {
    let log = Log::new();
    let theme = Context::new("Theme", "light".to_string());
    let l = label(&theme, &log);

    let middle_log = log.clone();
    let middle = MemoComponent::new(ElementType::Function(FunctionComponent::new("Middle", move |_props, _hooks| {
        middle_log.push("middle");
        Ok(Element::host("span").child(Element::component(&l)))
    })));

    let setter: Rc<RefCell<Option<StateSetter<String>>>> = Rc::default();
    let (s, t) = (setter.clone(), theme.clone());
    let app = FunctionComponent::new("App", move |_props, hooks| {
        let (value, set) = hooks.use_state(|| "light".to_string());
        *s.borrow_mut() = Some(set);
        Ok(t.provider((*value).clone(), vec![Element::memo(&middle)]))
    });

    let mut h = Harness::legacy();
    h.render(Element::component(&app)).expect("render");
    assert_eq!(log.take(), vec!["middle", "label light"]);

    let set = setter.borrow().clone().expect("rendered");
    h.act(|| set.set("dark".into())).expect("act");
    assert_eq!(log.take(), vec!["label dark"]);
    assert_eq!(h.markup(), "<span>dark</span>");
}

#[test]
fn render_prop_consumers_follow_the_provider() {
    let theme = Context::new("Theme", 1_i64);
    let mut h = Harness::legacy();
    let tree = |value: i64| {
        theme.provider(
            value,
            vec![theme.consumer(|v: &i64| Element::host("level").attr("n", *v))],
        )
    };
    h.render(tree(1)).expect("render");
    assert_eq!(h.markup(), "<level n=1/>");

    h.render(tree(2)).expect("render");
    assert_eq!(h.markup(), "<level n=2/>");
}
