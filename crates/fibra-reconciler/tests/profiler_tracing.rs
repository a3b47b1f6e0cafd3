#![forbid(unsafe_code)]

//! Profiler reports and the tracing spans around render and commit.

use std::cell::RefCell;
use std::rc::Rc;

use fibra_harness::{Harness, with_captured_tracing};
use fibra_reconciler::fibra_core::ReconcilerConfig;
use fibra_reconciler::{Element, ProfilerDef, ProfilerPhase, ProfilerReport, RootTag};

fn recording_profiler(id: &str) -> (Rc<ProfilerDef>, Rc<RefCell<Vec<ProfilerReport>>>) {
    let reports: Rc<RefCell<Vec<ProfilerReport>>> = Rc::default();
    let sink = reports.clone();
    let def = ProfilerDef::new(id, move |report| sink.borrow_mut().push(report.clone()));
    (def, reports)
}

#[test]
fn profilers_report_mounts_then_updates() {
    let (nav, reports) = recording_profiler("nav");
    let mut h = Harness::legacy();
    h.render(Element::profiler(&nav, vec![Element::text("home")]))
        .expect("render");

    h.scheduler().advance(50);
    h.render(Element::profiler(&nav, vec![Element::text("about")]))
        .expect("render");

    let reports = reports.borrow();
    let phases: Vec<ProfilerPhase> = reports.iter().map(|r| r.phase).collect();
    assert_eq!(phases, vec![ProfilerPhase::Mount, ProfilerPhase::Update]);
    assert!(reports.iter().all(|r| r.id == "nav" && r.actual_duration >= 0));
    assert_eq!(reports[1].commit_time, 50);
}

#[test]
fn disabling_profiling_silences_reports() {
    let (nav, reports) = recording_profiler("nav");
    let config = ReconcilerConfig {
        profiling: false,
        ..ReconcilerConfig::default()
    };
    let mut h = Harness::with_config(RootTag::Legacy, config);
    h.render(Element::profiler(&nav, vec![Element::text("home")]))
        .expect("render");
    assert!(reports.borrow().is_empty());
    assert_eq!(h.text(), "home");
}

#[test]
fn render_and_commit_spans_carry_their_outcome() {
    let capture = with_captured_tracing(|| {
        let mut h = Harness::concurrent();
        h.render(Element::host("div").child(Element::text("traced")))
            .expect("render");
    });

    let renders = capture.spans_named("fibra.render");
    assert!(!renders.is_empty());
    assert!(
        renders
            .iter()
            .any(|s| s.fields.get("exit_status").map(String::as_str) == Some("Completed")),
        "{renders:?}"
    );

    let commits = capture.spans_named("fibra.commit");
    assert_eq!(commits.len(), 1);
    let duration = commits[0].fields.get("duration_us").expect("duration recorded");
    assert!(duration.parse::<u64>().is_ok(), "{duration:?}");

    assert!(
        capture
            .events_for("fibra.commit")
            .iter()
            .any(|e| e.message() == "committing root")
    );
}

#[test]
fn uncaught_errors_are_logged_at_error_level() {
    use fibra_reconciler::FunctionComponent;
    use fibra_reconciler::fibra_core::Throw;

    let capture = with_captured_tracing(|| {
        let broken = FunctionComponent::new("Broken", |_props, _hooks| Err(Throw::error("nope")));
        let mut h = Harness::legacy();
        h.render(Element::component(&broken)).expect("render");
    });
    let errors: Vec<_> = capture
        .events_for("fibra.commit")
        .into_iter()
        .filter(|e| e.level == tracing::Level::ERROR)
        .collect();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].fields.get("error").map(String::as_str), Some("nope"));
}
