use std::rc::Rc;

use skein::{
    Component, DirectiveError, LoadHooks, Observable, Pipeline, Scope, Value,
};

fn render(template: &str, scope: &Rc<Scope>) -> Pipeline {
    let pipeline = Pipeline::parse(template, scope);
    pipeline.materialize().unwrap();
    pipeline.hydrate().unwrap();
    pipeline
}

// A fully static template hydrates with zero placeholders and is
// byte-identical across repeated renders with the same scope values.
#[test]
fn static_template_is_idempotent_and_placeholder_free() {
    let template = "@if(logged_in){Hi @(user)!}@else{Guest} @for(i in 2){<b>@(i)</b>}";
    let make_scope = || {
        let scope = Scope::new();
        scope.set("logged_in", true);
        scope.set("user", "Ada");
        scope
    };
    let first = render(template, &make_scope());
    let second = render(template, &make_scope());
    assert!(!first.markup().contains("w-marker"));
    assert_eq!(first.markup(), second.markup());
    insta::assert_snapshot!(first.markup(), @"Hi Ada! <b>0</b><b>1</b>");
}

#[test]
fn empty_array_loop_produces_nothing_and_no_placeholder() {
    let scope = Scope::new();
    scope.set("items", Value::List(vec![]));
    let pipeline = render("<ul>@for(i,item in items){<li>@(item)</li>}</ul>", &scope);
    assert_eq!(pipeline.markup(), "<ul></ul>");
    assert!(!pipeline.markup().contains("w-marker"));
}

// Exactly one branch of a chain contributes output for a given scope.
#[test]
fn conditional_branches_are_mutually_exclusive() {
    let template = "@if(a){A}@elseif(b){B}@else{C}";
    for (a, b, expected) in [
        (true, true, "A"),
        (true, false, "A"),
        (false, true, "B"),
        (false, false, "C"),
    ] {
        let scope = Scope::new();
        scope.set("a", a);
        scope.set("b", b);
        assert_eq!(render(template, &scope).markup(), expected);
    }
}

// Changing an observable used only inside one loop item re-renders only
// that item's region; sibling node identities and subscriptions survive.
#[test]
fn loop_item_regions_are_isolated() {
    let scope = Scope::new();
    let a = Observable::new("A");
    let b = Observable::new("B");
    scope.set(
        "items",
        Value::List(vec![
            Value::Observable(a.clone()),
            Value::Observable(b.clone()),
        ]),
    );
    let pipeline = render("<ul>@for(item in items){<li>@(item)</li>}</ul>", &scope);
    assert_eq!(pipeline.markup(), "<ul><li>A</li><li>B</li></ul>");

    let ul = pipeline.roots()[0];
    let items_before = pipeline.document().children(ul);
    assert_eq!(a.listener_count(), 1);
    assert_eq!(b.listener_count(), 1);

    b.set("B2");
    assert_eq!(pipeline.markup(), "<ul><li>A</li><li>B2</li></ul>");

    // The <li> elements themselves were never rebuilt, and the sibling
    // item's subscription is untouched.
    assert_eq!(pipeline.document().children(ul), items_before);
    assert_eq!(a.listener_count(), 1);
    assert_eq!(b.listener_count(), 1);
}

// `@@` renders a literal `@` and never triggers the directive it precedes.
#[test]
fn doubled_at_escapes_every_directive_form() {
    let scope = Scope::new();
    scope.set("name", "Ada");
    let pipeline = render("@@(name) @@if(x){y} @@for", &scope);
    assert_eq!(pipeline.markup(), "@(name) @if(x){y} @for");
    assert!(pipeline.diagnostics().is_empty());
}

#[test]
fn hello_alice() {
    let scope = Scope::new();
    scope.set("name", "Alice");
    assert_eq!(render("Hello @(name)!", &scope).markup(), "Hello Alice!");
}

// An observable interpolation updates its text in place; the surrounding
// element is not detached or rebuilt.
#[test]
fn observable_text_updates_in_place() {
    let scope = Scope::new();
    let count = Observable::new(0);
    scope.set("count", Value::Observable(count.clone()));
    let pipeline = render("<p>Count: @(count)</p>", &scope);
    assert_eq!(pipeline.markup(), "<p>Count: 0</p>");

    let p = pipeline.roots()[0];
    count.set(5);
    assert_eq!(pipeline.markup(), "<p>Count: 5</p>");
    assert_eq!(pipeline.roots()[0], p);
    assert!(pipeline.document().is_live(p));
}

// An observable reached through a list index is a dependency of the
// interpolation even though no free identifier resolves to it.
#[test]
fn list_element_observable_still_updates() {
    let scope = Scope::new();
    let o = Observable::new("A");
    scope.set("items", Value::List(vec![Value::Observable(o.clone())]));
    let pipeline = render("<p>@(items[0])</p>", &scope);
    assert_eq!(pipeline.markup(), "<p>A</p>");
    assert_eq!(o.listener_count(), 1);
    o.set("B");
    assert_eq!(pipeline.markup(), "<p>B</p>");
}

// Same through a map member.
#[test]
fn map_member_observable_still_updates() {
    let scope = Scope::new();
    let o = Observable::new(1);
    let mut state = std::collections::BTreeMap::new();
    state.insert("inner".to_string(), Value::Observable(o.clone()));
    scope.set("state", Value::Map(state));
    let pipeline = render("@(state.inner)", &scope);
    assert_eq!(pipeline.markup(), "1");
    o.set(2);
    assert_eq!(pipeline.markup(), "2");
}

// A losing branch's body never runs: its loop collection expression must
// not be evaluated and must not leave diagnostics behind.
#[test]
fn losing_branch_body_is_never_executed() {
    let scope = Scope::new();
    scope.set("ok", true);
    let called = Rc::new(std::cell::Cell::new(false));
    let flag = called.clone();
    scope.set(
        "boom",
        Value::Func(Rc::new(move |_| {
            flag.set(true);
            Ok(Value::List(vec![]))
        })),
    );
    let pipeline = render(
        "@if(ok){@for(i in 2){x}}@else{@for(v in boom()){y}}",
        &scope,
    );
    assert_eq!(pipeline.markup(), "xx");
    assert!(!called.get());
    assert!(pipeline.diagnostics().is_empty());
}

// A value spelling out a marker tag stays inert text and cannot collide
// with a live region's placeholder.
#[test]
fn marker_lookalike_in_a_value_stays_inert() {
    let scope = Scope::new();
    let live = Observable::new("x");
    scope.set("live", Value::Observable(live.clone()));
    scope.set("payload", "<w-marker id=\"0\"></w-marker>");
    let pipeline = render("@(payload)@(live)", &scope);
    assert_eq!(pipeline.markup(), "<w-marker id=\"0\"></w-marker>x");
    assert_eq!(live.listener_count(), 1);
    live.set("y");
    assert_eq!(pipeline.markup(), "<w-marker id=\"0\"></w-marker>y");
}

// A static indexed loop inlines fully at parse time.
#[test]
fn indexed_loop_inlines_at_parse_time() {
    let scope = Scope::new();
    scope.set(
        "arr",
        Value::List(vec![Value::from("A"), Value::from("B")]),
    );
    let pipeline = Pipeline::parse("@for(i,v in arr){<li>@(i):@(v)</li>}", &scope);
    // Already resolved before materialization.
    assert_eq!(pipeline.markup(), "<li>0:A</li><li>1:B</li>");
    assert!(!pipeline.markup().contains("w-marker"));
}

#[test]
fn ref_plus_tail_injection_appends_to_target() {
    let scope = Scope::new();
    let pipeline = render(
        r#"<div @[ref]="'x'"><i>first</i></div><p @injection[tail]="'x'">last</p>"#,
        &scope,
    );
    let target = pipeline.get_ref("x").unwrap();
    let children = pipeline.document().children(target);
    let last = *children.last().unwrap();
    assert_eq!(pipeline.document().tag(last), Some("p"));
    insta::assert_snapshot!(pipeline.markup(), @"<div><i>first</i><p>last</p></div>");
}

#[test]
fn observable_ref_target_is_a_distinguishable_error() {
    let scope = Scope::new();
    scope.set("target", Value::Observable(Observable::new("x")));
    let pipeline = render(r#"<div @[ref]="target">x</div>"#, &scope);
    assert!(pipeline.diagnostics().iter().any(|d| matches!(
        d,
        DirectiveError::InvalidStaticTarget { directive, .. } if *directive == "@[ref]"
    )));
    // The element renders without the directive.
    assert_eq!(pipeline.markup(), "<div>x</div>");
}

#[test]
fn observable_injection_target_is_a_distinguishable_error() {
    let scope = Scope::new();
    scope.set("target", Value::Observable(Observable::new("x")));
    let pipeline = render(r#"<p @injection[tail]="target">y</p>"#, &scope);
    assert!(pipeline
        .diagnostics()
        .iter()
        .any(|d| matches!(d, DirectiveError::InvalidStaticTarget { .. })));
}

// Flipping a conditional swaps the active branch's subscriptions: the
// outgoing branch's inner region is fully unsubscribed before the incoming
// branch attaches its own.
#[test]
fn branch_flip_swaps_inner_subscriptions() {
    let scope = Scope::new();
    let flag = Observable::new(true);
    let left = Observable::new("L");
    let right = Observable::new("R");
    scope.set("flag", Value::Observable(flag.clone()));
    scope.set("left", Value::Observable(left.clone()));
    scope.set("right", Value::Observable(right.clone()));

    let pipeline = render("@if(flag){@(left)}@else{@(right)}", &scope);
    assert_eq!(pipeline.markup(), "L");
    assert_eq!(left.listener_count(), 1);
    assert_eq!(right.listener_count(), 0);

    flag.set(false);
    assert_eq!(pipeline.markup(), "R");
    assert_eq!(left.listener_count(), 0);
    assert_eq!(right.listener_count(), 1);

    // The fresh branch is live: its own observable drives it.
    right.set("R2");
    assert_eq!(pipeline.markup(), "R2");
}

// A reactive loop bound re-renders the whole loop region on change.
#[test]
fn reactive_numeric_loop_regrows() {
    let scope = Scope::new();
    let n = Observable::new(2);
    scope.set("n", Value::Observable(n.clone()));
    let pipeline = render("@for(i in n){[@(i)]}", &scope);
    assert_eq!(pipeline.markup(), "[0][1]");
    n.set(4);
    assert_eq!(pipeline.markup(), "[0][1][2][3]");
    n.set(0);
    assert_eq!(pipeline.markup(), "");
    n.set(1);
    assert_eq!(pipeline.markup(), "[0]");
}

#[test]
fn bad_iterables_are_diagnostics_not_failures() {
    let scope = Scope::new();
    scope.set("s", "abc");
    scope.set("neg", -3);
    let pipeline = render("a@for(c in s){x}b@for(i in neg){y}c", &scope);
    assert_eq!(pipeline.markup(), "abc");
    let diags = pipeline.diagnostics();
    assert_eq!(diags.len(), 2);
    assert!(diags
        .iter()
        .all(|d| matches!(d, DirectiveError::BadIterable { .. })));
}

// A static outer loop with a reactive inner interpolation inlines the
// static structure and defers only the dynamic leaf.
#[test]
fn static_outer_dynamic_inner_splits_correctly() {
    let scope = Scope::new();
    let live = Observable::new("x");
    scope.set("live", Value::Observable(live.clone()));
    scope.set("names", Value::List(vec![Value::from("a"), Value::from("b")]));
    let pipeline = Pipeline::parse("@for(n in names){<i>@(n)@(live)</i>}", &scope);
    // Static parts inlined, two deferred leaves remain.
    let phase1 = pipeline.markup();
    assert_eq!(phase1.matches("w-marker").count(), 4); // two open + close pairs
    assert!(phase1.contains("<i>a"));
    assert!(phase1.contains("<i>b"));

    pipeline.materialize().unwrap();
    pipeline.hydrate().unwrap();
    assert_eq!(pipeline.markup(), "<i>ax</i><i>bx</i>");
    assert_eq!(live.listener_count(), 2);
    live.set("y");
    assert_eq!(pipeline.markup(), "<i>ay</i><i>by</i>");
}

#[test]
fn component_load_runs_hooks_around_the_phases() {
    struct Recorder(Rc<std::cell::RefCell<Vec<&'static str>>>);
    impl LoadHooks for Recorder {
        fn pre_init(&mut self, _scope: &Rc<Scope>) {
            self.0.borrow_mut().push("pre_init");
        }
        fn pre_load(&mut self, _pipeline: &Pipeline) {
            self.0.borrow_mut().push("pre_load");
        }
        fn post_load(&mut self, _pipeline: &Pipeline) {
            self.0.borrow_mut().push("post_load");
        }
    }

    let order = Rc::new(std::cell::RefCell::new(Vec::new()));
    let scope = Scope::new();
    scope.set("name", "skein");
    let mut component =
        Component::with_hooks("<h1>@(name)</h1>", scope, Recorder(order.clone()));
    let pipeline = component.load().unwrap();
    assert_eq!(pipeline.markup(), "<h1>skein</h1>");
    assert_eq!(*order.borrow(), vec!["pre_init", "pre_load", "post_load"]);
}

#[test]
fn event_fires_with_event_object_in_child_scope() {
    let scope = Scope::new();
    let seen = Rc::new(std::cell::RefCell::new(Vec::new()));
    let log = seen.clone();
    scope.set(
        "record",
        Value::Func(Rc::new(move |args| {
            log.borrow_mut().push(args[0].render());
            Ok(Value::Null)
        })),
    );
    let pipeline = render(r#"<a @on[click]="record(event)">go</a>"#, &scope);
    let a = pipeline.roots()[0];
    pipeline.dispatch(a, "click", "payload-1");
    pipeline.dispatch(a, "click", "payload-2");
    assert_eq!(*seen.borrow(), vec!["payload-1", "payload-2"]);
    // `event` is bound per firing only, never leaked into the scope.
    assert!(!scope.has("event"));
}

// A value containing directive syntax is injected as inert text.
#[test]
fn interpolated_values_are_never_reinterpreted_as_directives() {
    let scope = Scope::new();
    scope.set("payload", "@if(x){pwn} and user@host");
    let pipeline = render("<p>@(payload)</p>", &scope);
    assert_eq!(pipeline.markup(), "<p>@if(x){pwn} and user@host</p>");
    assert!(pipeline.diagnostics().is_empty());
}
