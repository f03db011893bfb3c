//! End-to-end runs of compiled expressions inside the sandbox.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use mediator_engine::{
    Adaptor, AllowList, BoxedOperation, CollaboratorError, Compiler, EngineError, EngineResult,
    LazyValue, OperationArgs, Sandbox, SandboxConfig, State, classify, operation, sync_operation,
};
use serde_json::{Value, json};

/// Test adaptor that records every resolved argument as a reference.
#[derive(Default)]
struct Recorder {
    calls: Arc<AtomicUsize>,
}

impl Recorder {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Adaptor for Recorder {
    fn name(&self) -> &str {
        "language-recorder"
    }

    fn operations(&self) -> &[&'static str] {
        &["record", "wait", "reject"]
    }

    fn build(&self, name: &str, args: Vec<LazyValue>) -> EngineResult<BoxedOperation> {
        let args = OperationArgs::new(name, args);
        match name {
            "record" => {
                let value = args.required(0, "value")?;
                let calls = Arc::clone(&self.calls);
                Ok(sync_operation("record", move |state: State| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    let resolved = value.resolve(&state)?;
                    Ok(state.push_reference(json!({ "recorded": resolved })))
                }))
            }
            "wait" => {
                let millis = match args.required(0, "millis")? {
                    LazyValue::Literal(Value::Number(n)) => n.as_u64().unwrap_or(0),
                    _ => return Err(EngineError::invalid_argument("wait", "expected a number")),
                };
                Ok(operation("wait", move |state: State| async move {
                    tokio::time::sleep(Duration::from_millis(millis)).await;
                    Ok(state)
                }))
            }
            "reject" => {
                let body = args.required(0, "body")?;
                Ok(sync_operation("reject", move |state: State| {
                    let body = body.resolve(&state)?;
                    Err(CollaboratorError::from_response("POST", "http://collaborator/api", 409, body).into())
                }))
            }
            other => Err(self.unknown(other)),
        }
    }
}

fn sandbox(timeout_ms: u64) -> Sandbox {
    Sandbox::new(SandboxConfig {
        timeout_ms,
        ..Default::default()
    })
}

async fn run(adaptor: &Recorder, source: &str, state: Value) -> EngineResult<State> {
    let unit = Compiler::new(AllowList::for_adaptor(adaptor)).compile(source);
    sandbox(2_000)
        .run(&unit, State::from_value(state).unwrap(), adaptor)
        .await
}

fn recorded(state: &State) -> Vec<Value> {
    state
        .references()
        .iter()
        .map(|reference| reference["recorded"].clone())
        .collect()
}

#[tokio::test]
async fn test_bare_calls_run_in_order() {
    let adaptor = Recorder::default();
    let state = run(
        &adaptor,
        "record(1);\nrecord(dataValue('name'));",
        json!({"data": {"name": "Jane"}}),
    )
    .await
    .unwrap();

    assert_eq!(recorded(&state), vec![json!("Jane"), json!(1)]);
    assert_eq!(adaptor.calls(), 2);
}

#[tokio::test]
async fn test_nested_lazy_arguments_resolve_against_current_state() {
    let adaptor = Recorder::default();
    let source = r#"
        record({
            person: { name: dataValue('name'), tags: [ state => state.data.tag, 'fixed' ] },
            count: 2
        });
    "#;
    let state = run(&adaptor, source, json!({"data": {"name": "Jane", "tag": "vip"}}))
        .await
        .unwrap();

    assert_eq!(
        recorded(&state),
        vec![json!({"person": {"name": "Jane", "tags": ["vip", "fixed"]}, "count": 2})]
    );
}

#[tokio::test]
async fn test_fn_operations_thread_state_between_builders() {
    let adaptor = Recorder::default();
    let source = r#"
        record('first');
        fn(state => ({ ...state, data: { seen: lastReferenceValue('recorded')(state) } }));
        record(dataValue('seen'));
    "#;
    let state = run(&adaptor, source, json!({})).await.unwrap();

    assert_eq!(recorded(&state), vec![json!("first"), json!("first")]);
    assert_eq!(state.data(), &json!({"seen": "first"}));
}

#[tokio::test]
async fn test_local_declarations_and_helpers() {
    let adaptor = Recorder::default();
    let source = r#"
        const options = { colours: ['red', 'green', 'blue'] };
        record(convertMultipleChoice('red blue', 'colours', options));
        record(convertToBoolean('0'));
        record(fields(field('a', 1), field('b', dataValue('b'))));
    "#;
    let state = run(&adaptor, source, json!({"data": {"b": "two"}}))
        .await
        .unwrap();

    assert_eq!(
        recorded(&state),
        vec![
            json!({"a": 1, "b": "two"}),
            json!(false),
            json!({"red": true, "green": false, "blue": true}),
        ]
    );
}

#[tokio::test]
async fn test_explicit_and_nested_execute() {
    let adaptor = Recorder::default();
    let state = run(
        &adaptor,
        "execute(record(1), execute(record(2), record(3)), record(4))",
        json!({}),
    )
    .await
    .unwrap();

    assert_eq!(recorded(&state), vec![json!(4), json!(3), json!(2), json!(1)]);
}

#[tokio::test]
async fn test_caller_state_survives_defaults() {
    let adaptor = Recorder::default();
    let state = run(
        &adaptor,
        "record(1)",
        json!({"configuration": {"hostUrl": "http://dhis2"}, "data": {"x": 1}}),
    )
    .await
    .unwrap();

    assert_eq!(state.configuration_str("hostUrl"), Some("http://dhis2"));
    assert_eq!(state.data(), &json!({"x": 1}));
}

#[tokio::test]
async fn test_rejected_expression_never_runs() {
    let adaptor = Recorder::default();
    let err = run(&adaptor, "record(1);\nrequire('fs');", json!({}))
        .await
        .unwrap_err();

    match err {
        EngineError::CompileRejected { errors } => {
            assert_eq!(errors.len(), 1);
            assert_eq!(errors[0].line, 2);
        }
        other => panic!("expected CompileRejected, got {other:?}"),
    }
    assert_eq!(adaptor.calls(), 0);
}

#[tokio::test]
async fn test_runaway_script_times_out() {
    let adaptor = Recorder::default();
    let unit = Compiler::new(AllowList::for_adaptor(&adaptor))
        .compile("fn(state => { while (true) {} })");
    let err = sandbox(200)
        .run(&unit, State::new(), &adaptor)
        .await
        .unwrap_err();

    assert!(matches!(err, EngineError::Timeout(200)), "got {err:?}");
}

#[tokio::test]
async fn test_slow_operation_times_out_without_partial_result() {
    let adaptor = Recorder::default();
    let unit = Compiler::new(AllowList::for_adaptor(&adaptor))
        .compile("record(1);\nwait(5000);\nrecord(2);");
    let err = sandbox(200)
        .run(&unit, State::new(), &adaptor)
        .await
        .unwrap_err();

    assert!(matches!(err, EngineError::Timeout(200)), "got {err:?}");
    assert_eq!(adaptor.calls(), 1);
}

#[tokio::test]
async fn test_collaborator_error_propagates_unchanged() {
    let adaptor = Recorder::default();
    let source = r#"
        reject({ httpStatus: 'Conflict', httpStatusCode: 409, message: 'duplicate' });
        record('never');
    "#;
    let outcome = run(&adaptor, source, json!({})).await;

    match &outcome {
        Err(EngineError::Collaborator(err)) => {
            assert_eq!(err.status, Some(409));
            assert_eq!(err.body.as_ref().unwrap()["message"], json!("duplicate"));
        }
        other => panic!("expected a collaborator error, got {other:?}"),
    }
    assert_eq!(adaptor.calls(), 0);

    let envelope = classify(&outcome);
    assert_eq!(envelope.http_status, 409);
    assert_eq!(envelope.transaction_status, "Conflict");
    assert_eq!(envelope.message, json!("duplicate"));
}

#[tokio::test]
async fn test_thrown_object_keeps_its_payload() {
    let adaptor = Recorder::default();
    let source = r#"
        fn(state => {
            throw { response: { body: { httpStatus: 'Not Found', httpStatusCode: 404, message: 'gone' } } };
        });
    "#;
    let outcome = run(&adaptor, source, json!({})).await;

    assert!(matches!(&outcome, Err(EngineError::Script { detail: Some(_), .. })));
    let envelope = classify(&outcome);
    assert_eq!(envelope.http_status, 404);
    assert_eq!(envelope.transaction_status, "Not Found");
}

#[tokio::test]
async fn test_thrown_error_message() {
    let adaptor = Recorder::default();
    let err = run(&adaptor, "fn(state => { throw new Error('boom'); })", json!({}))
        .await
        .unwrap_err();

    assert_eq!(err.to_string(), "boom");
}

#[tokio::test]
async fn test_dangerous_globals_are_removed() {
    let adaptor = Recorder::default();
    let source = r#"
        fn(state => ({ ...state, data: { evalType: typeof eval, functionType: typeof Function } }));
    "#;
    let state = run(&adaptor, source, json!({})).await.unwrap();

    assert_eq!(
        state.data(),
        &json!({"evalType": "undefined", "functionType": "undefined"})
    );
}

#[tokio::test]
async fn test_fn_must_return_state_synchronously() {
    let adaptor = Recorder::default();

    let err = run(&adaptor, "fn(state => Promise.resolve(state))", json!({}))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("synchronously"), "got {err}");

    let err = run(&adaptor, "fn(state => 42)", json!({}))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("state object"), "got {err}");
}

#[tokio::test]
async fn test_non_operation_argument_is_rejected() {
    let adaptor = Recorder::default();
    let err = run(&adaptor, "execute(record(1), 42)", json!({}))
        .await
        .unwrap_err();

    assert!(matches!(err, EngineError::InvalidPlan(_)), "got {err:?}");
    assert_eq!(adaptor.calls(), 0);
}

#[tokio::test]
async fn test_fn_returning_an_unapplied_operation_fails() {
    let adaptor = Recorder::default();
    for source in [
        "fn(state => record(1))",
        "fn(state => execute(record(1))(state))",
    ] {
        let err = run(&adaptor, source, json!({"data": {"x": 1}}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("execute(...)"), "{source}: {err}");
    }
    assert_eq!(adaptor.calls(), 0);
}

#[tokio::test]
async fn test_fn_returning_a_bare_object_keeps_reserved_keys() {
    let adaptor = Recorder::default();
    let state = run(&adaptor, "record(1);\nfn(state => ({ done: true }));", json!({}))
        .await
        .unwrap();

    assert_eq!(state.get("done"), Some(&json!(true)));
    assert_eq!(state.references(), &[] as &[Value]);
    assert_eq!(state.data(), &Value::Null);
    assert!(state.contains_key("references"));
    assert!(state.contains_key("data"));
}

#[tokio::test]
async fn test_deeply_nested_literal_argument() {
    let adaptor = Recorder::default();
    let depth = 70;
    let source = format!("record({}1{});", "{a:".repeat(depth), "}".repeat(depth));
    let mut expected = json!(1);
    for _ in 0..depth {
        expected = json!({ "a": expected });
    }

    let state = run(&adaptor, &source, json!({})).await.unwrap();
    assert_eq!(recorded(&state), vec![expected]);
}

#[tokio::test]
async fn test_comma_joined_calls_all_run() {
    let adaptor = Recorder::default();
    let state = run(&adaptor, "record(1), record(2);", json!({}))
        .await
        .unwrap();

    assert_eq!(recorded(&state), vec![json!(2), json!(1)]);
    assert_eq!(adaptor.calls(), 2);
}

#[tokio::test]
async fn test_conditional_builder_statement_is_rejected() {
    let adaptor = Recorder::default();
    let err = run(&adaptor, "if (state.data.go) record(1);", json!({"data": {"go": true}}))
        .await
        .unwrap_err();

    assert!(matches!(err, EngineError::CompileRejected { .. }), "got {err:?}");
    assert_eq!(adaptor.calls(), 0);
}

#[tokio::test]
async fn test_proto_key_survives_state_binding() {
    let adaptor = Recorder::default();
    let state = run(
        &adaptor,
        "record(Object.keys(state.data));",
        json!({"data": {"__proto__": {"polluted": true}, "b": 2}}),
    )
    .await
    .unwrap();

    assert_eq!(recorded(&state), vec![json!(["__proto__", "b"])]);
    assert_eq!(state.data()["__proto__"], json!({"polluted": true}));
}

#[tokio::test]
async fn test_each_runs_operation_per_item() {
    let adaptor = Recorder::default();
    let source = r#"
        each('$.data.patients[*]', record(fields(field('name', dataValue('name')), field('at', state => state.index))));
        record('done');
    "#;
    let state = run(
        &adaptor,
        source,
        json!({"data": {"patients": [{"name": "Ada"}, {"name": "Grace"}]}}),
    )
    .await
    .unwrap();

    assert_eq!(
        recorded(&state),
        vec![
            json!("done"),
            json!({"name": "Grace", "at": 1}),
            json!({"name": "Ada", "at": 0}),
        ]
    );
    assert_eq!(adaptor.calls(), 3);
}

#[tokio::test]
async fn test_merge_and_combine() {
    let adaptor = Recorder::default();
    let source = r#"
        combine(
            record(merge(dataValue('visits'), fields(field('patient', dataValue('id'))))),
            record('combined')
        );
        record('after');
    "#;
    let state = run(
        &adaptor,
        source,
        json!({"data": {"id": "p1", "visits": [{"date": "2020-01-01"}, {"date": "2020-02-01"}]}}),
    )
    .await
    .unwrap();

    assert_eq!(
        recorded(&state),
        vec![
            json!("after"),
            json!("combined"),
            json!([
                {"date": "2020-01-01", "patient": "p1"},
                {"date": "2020-02-01", "patient": "p1"}
            ]),
        ]
    );
}
