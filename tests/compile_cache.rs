use std::sync::Arc;

use petrel_script::{CollectingAlertHandler, CollectingReporter, ScriptEngine, ScriptErrorKind};

fn probed_engine() -> (ScriptEngine, CollectingAlertHandler, CollectingReporter) {
    let engine = ScriptEngine::new();
    let alerts = CollectingAlertHandler::new();
    let reporter = CollectingReporter::new();
    engine.set_alert_handler(Arc::new(alerts.clone()));
    engine.set_error_reporter(Arc::new(reporter.clone()));
    (engine, alerts, reporter)
}

#[test]
fn external_units_compile_once_per_validator() {
    let (engine, alerts, _reporter) = probed_engine();
    let window = engine.create_window();
    let page = engine.navigate(window, "http://petrel.test/doc");
    let url = "http://cdn.petrel.test/lib.js";

    engine.execute_cached(&page, url, "etag-1", "alert(\"run\")", 1).expect("first run");
    engine.execute_cached(&page, url, "etag-1", "alert(\"run\")", 1).expect("second run");
    assert_eq!(engine.compile_count(), 1, "same resource and validator reuse the compiled unit");
    assert_eq!(alerts.messages(), ["run", "run"], "every inclusion still evaluates");

    engine.execute_cached(&page, url, "etag-2", "alert(\"run\")", 1).expect("revalidated run");
    assert_eq!(engine.compile_count(), 2, "a changed validator recompiles");
    assert_eq!(engine.cached_unit_count(), 2);
    engine.shutdown();
}

#[test]
fn cache_is_shared_across_windows_of_one_engine() {
    let (engine, alerts, _reporter) = probed_engine();
    let w1 = engine.create_window();
    let w2 = engine.create_window();
    let p1 = engine.navigate(w1, "http://petrel.test/a");
    let p2 = engine.navigate(w2, "http://petrel.test/b");
    let url = "http://cdn.petrel.test/shared.js";

    engine.execute_cached(&p1, url, "v1", "alert(\"w1\")", 1).expect("first window");
    engine.execute_cached(&p2, url, "v1", "alert(\"w2\")", 1).expect("second window");
    assert_eq!(engine.compile_count(), 1, "windows of one engine share the cache");
    assert_eq!(alerts.messages(), ["w1", "w2"]);
    engine.shutdown();
}

#[test]
fn engines_keep_separate_caches() {
    let first = ScriptEngine::new();
    let second = ScriptEngine::new();
    let url = "http://cdn.petrel.test/common.js";

    let w1 = first.create_window();
    let p1 = first.navigate(w1, "http://petrel.test/one");
    first.execute_cached(&p1, url, "v1", "1 + 1", 1).expect("first engine");

    let w2 = second.create_window();
    let p2 = second.navigate(w2, "http://petrel.test/two");
    second.execute_cached(&p2, url, "v1", "1 + 1", 1).expect("second engine");

    assert_eq!(first.compile_count(), 1);
    assert_eq!(second.compile_count(), 1, "no cross-engine sharing");
    first.shutdown();
    second.shutdown();
}

#[test]
fn failed_compiles_are_not_cached() {
    let (engine, alerts, reporter) = probed_engine();
    let window = engine.create_window();
    let page = engine.navigate(window, "http://petrel.test/retry");
    let url = "http://cdn.petrel.test/flaky.js";

    engine.execute_cached(&page, url, "v1", "let = ;", 1).expect("parse failure is swallowed");
    assert_eq!(reporter.errors()[0].kind, ScriptErrorKind::Parse);
    assert_eq!(engine.cached_unit_count(), 0, "broken sources must not poison the cache");

    engine.execute_cached(&page, url, "v1", "alert(\"fixed\")", 1).expect("corrected run");
    assert_eq!(alerts.messages(), ["fixed"]);
    assert_eq!(engine.compile_count(), 1);
    engine.shutdown();
}

#[test]
fn compile_is_inert() {
    let (engine, alerts, reporter) = probed_engine();
    let window = engine.create_window();
    let page = engine.navigate(window, "http://petrel.test/inert");

    let unit = engine.compile(&page, "alert(\"nope\")", "probe", 7).expect("compiles");
    assert_eq!(unit.name(), "probe");
    assert_eq!(unit.start_line(), 7);
    assert!(alerts.messages().is_empty(), "compile must not evaluate");
    assert_eq!(engine.cached_unit_count(), 0, "direct compiles bypass the cache");

    let error = engine.compile(&page, "let = ;", "broken", 1).expect_err("parse failure");
    assert_eq!(error.kind, ScriptErrorKind::Parse);
    assert!(reporter.is_empty(), "pure compilation is never reported");
    engine.shutdown();
}

#[test]
fn cached_units_share_functions_with_the_window() {
    let (engine, alerts, _reporter) = probed_engine();
    let window = engine.create_window();
    let page = engine.navigate(window, "http://petrel.test/library");
    let url = "http://cdn.petrel.test/greet.js";

    engine
        .execute_cached(&page, url, "v1", "fn greet(name) { alert(\"hi \" + name) }", 1)
        .expect("library unit");
    engine.execute(&page, "greet(\"petrel\")", "inline", 1).expect("caller unit");
    assert_eq!(alerts.messages(), ["hi petrel"]);
    engine.shutdown();
}
