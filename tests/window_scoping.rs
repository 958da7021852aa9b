use std::sync::Arc;

use petrel_script::rhai::{Dynamic, FnPtr};
use petrel_script::{
    BoundCallback, CollectingAlertHandler, ScriptCallback, ScriptEngine,
};

fn probed_engine() -> (ScriptEngine, CollectingAlertHandler) {
    let engine = ScriptEngine::new();
    let alerts = CollectingAlertHandler::new();
    engine.set_alert_handler(Arc::new(alerts.clone()));
    (engine, alerts)
}

#[test]
fn closures_run_against_their_home_window() {
    let (engine, _alerts) = probed_engine();
    let w1 = engine.create_window();
    let w2 = engine.create_window();
    let p1 = engine.navigate(w1, "http://petrel.test/first");
    let p2 = engine.navigate(w2, "http://petrel.test/second");

    let value = engine
        .execute(&p1, "let tag = \"first\"; || \"seen:\" + tag", "unit0", 1)
        .expect("closure unit");
    let fn_ptr = value.try_cast::<FnPtr>().expect("closure value");
    engine.execute(&p2, "let tag = \"second\";", "unit0", 1).expect("second window unit");

    let callback = BoundCallback::new(&p1, ScriptCallback::Function(fn_ptr));
    let result = engine.call_function(&p2, &callback, None, Vec::new()).expect("callback");
    assert_eq!(
        result.into_string().expect("string result"),
        "seen:first",
        "a callback sees its creating window's bindings, not the caller's"
    );
    engine.shutdown();
}

#[test]
fn named_callbacks_resolve_in_their_window_library() {
    let (engine, _alerts) = probed_engine();
    let w1 = engine.create_window();
    let w2 = engine.create_window();
    let p1 = engine.navigate(w1, "http://petrel.test/one");
    let p2 = engine.navigate(w2, "http://petrel.test/two");

    engine.execute(&p1, "fn whoami() { \"window-one\" }", "unit0", 1).expect("first library");
    engine.execute(&p2, "fn whoami() { \"window-two\" }", "unit0", 1).expect("second library");

    let cb1 = BoundCallback::new(&p1, ScriptCallback::Named("whoami".to_string()));
    let cb2 = BoundCallback::new(&p2, ScriptCallback::Named("whoami".to_string()));
    let first = engine.call_function(&p2, &cb1, None, Vec::new()).expect("first callback");
    let second = engine.call_function(&p1, &cb2, None, Vec::new()).expect("second callback");
    assert_eq!(first.into_string().expect("string"), "window-one");
    assert_eq!(second.into_string().expect("string"), "window-two");
    engine.shutdown();
}

#[test]
fn closure_state_stays_with_the_creating_window() {
    let (engine, _alerts) = probed_engine();
    let w1 = engine.create_window();
    let w2 = engine.create_window();
    let p1 = engine.navigate(w1, "http://petrel.test/counter");
    let p2 = engine.navigate(w2, "http://petrel.test/noise");

    let value = engine
        .execute(&p1, "let counter = 0; || { counter += 1; counter }", "unit0", 1)
        .expect("counter closure");
    let fn_ptr = value.try_cast::<FnPtr>().expect("closure value");
    engine.execute(&p2, "let counter = 990;", "unit0", 1).expect("unrelated binding");

    let callback = BoundCallback::new(&p1, ScriptCallback::Function(fn_ptr));
    let first = engine.call_function(&p1, &callback, None, Vec::new()).expect("first call");
    let second = engine.call_function(&p1, &callback, None, Vec::new()).expect("second call");
    assert_eq!(first.as_int().expect("int"), 1);
    assert_eq!(second.as_int().expect("int"), 2, "captured state persists across invocations");
    engine.shutdown();
}

#[test]
fn named_callbacks_bind_this_and_arguments() {
    let (engine, _alerts) = probed_engine();
    let window = engine.create_window();
    let page = engine.navigate(window, "http://petrel.test/binding");

    engine
        .execute(&page, "fn scale(factor) { this * factor }", "unit0", 1)
        .expect("library unit");
    let callback = BoundCallback::new(&page, ScriptCallback::Named("scale".to_string()));
    let result = engine
        .call_function(&page, &callback, Some(Dynamic::from(21_i64)), vec![Dynamic::from(2_i64)])
        .expect("bound call");
    assert_eq!(result.as_int().expect("int"), 42);
    engine.shutdown();
}

#[test]
fn callbacks_from_a_replaced_page_are_dropped() {
    let (engine, alerts) = probed_engine();
    let window = engine.create_window();
    let old_page = engine.navigate(window, "http://petrel.test/old");
    engine.execute(&old_page, "fn ping() { alert(\"stale\") }", "unit0", 1).expect("library unit");
    let callback = BoundCallback::new(&old_page, ScriptCallback::Named("ping".to_string()));

    engine.navigate(window, "http://petrel.test/new");
    let value = engine
        .call_function(&old_page, &callback, None, Vec::new())
        .expect("stale invocation is a no-op");
    assert!(value.is::<()>());
    assert!(alerts.messages().is_empty(), "the replaced page must not observe the call");
    engine.shutdown();
}

#[test]
fn source_callbacks_run_in_the_window_scope() {
    let (engine, alerts) = probed_engine();
    let window = engine.create_window();
    let page = engine.navigate(window, "http://petrel.test/source");

    engine.execute(&page, "let label = \"ready\";", "unit0", 1).expect("binding unit");
    let callback = BoundCallback::new(&page, ScriptCallback::Source("alert(label)".to_string()));
    engine.call_function(&page, &callback, None, Vec::new()).expect("source callback");
    assert_eq!(alerts.messages(), ["ready"]);
    engine.shutdown();
}
