//! Generic HTTP adaptor against a mock server.

use mediator_adaptors::HttpAdaptor;
use mediator_engine::{
    AllowList, Compiler, EngineError, EngineResult, Sandbox, SandboxConfig, State, classify,
};
use serde_json::{Value, json};
use wiremock::matchers::{basic_auth, body_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn run(source: &str, state: Value) -> EngineResult<State> {
    let adaptor = HttpAdaptor::default();
    let unit = Compiler::new(AllowList::for_adaptor(&adaptor)).compile(source);
    assert!(unit.is_ok(), "{:?}", unit.errors());
    Sandbox::new(SandboxConfig::default())
        .run(&unit, State::from_value(state).unwrap(), &adaptor)
        .await
}

#[tokio::test]
async fn test_get_sets_data_and_runs_callback() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/patients"))
        .and(query_param("name", "Jane"))
        .and(header("x-trace", "abc"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"total": 1})))
        .expect(1)
        .mount(&server)
        .await;

    let source = r#"
        get('/patients', {
            query: { name: dataValue('name') },
            headers: { 'x-trace': 'abc' }
        }, state => ({ ...state, fetched: true }));
    "#;
    let state = run(
        source,
        json!({"configuration": {"baseUrl": server.uri()}, "data": {"name": "Jane"}}),
    )
    .await
    .unwrap();

    assert_eq!(state.data(), &json!({"total": 1}));
    assert_eq!(state.get("fetched"), Some(&json!(true)));
    let reference = state.latest_reference().unwrap();
    assert_eq!(reference["statusCode"], json!(200));
    assert_eq!(reference["statusText"], json!("OK"));
}

#[tokio::test]
async fn test_post_with_configured_and_explicit_credentials() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/configured"))
        .and(basic_auth("user", "pass"))
        .and(body_json(json!({"name": "Jane"})))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": 1})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/explicit"))
        .and(basic_auth("other", "secret"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": 2})))
        .expect(1)
        .mount(&server)
        .await;

    let source = r#"
        post('/configured', { body: { name: dataValue('name') } });
        put('/explicit', {
            body: { id: lastReferenceValue('body.id') },
            authentication: { username: 'other', password: 'secret' }
        });
    "#;
    let state = run(
        source,
        json!({
            "configuration": {"baseUrl": server.uri(), "username": "user", "password": "pass"},
            "data": {"name": "Jane"}
        }),
    )
    .await
    .unwrap();

    assert_eq!(state.references().len(), 2);
    assert_eq!(state.data(), &json!({"id": 2}));
}

#[tokio::test]
async fn test_rejected_status_carries_the_body() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/patients/1"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({
            "httpStatus": "Not Found",
            "httpStatusCode": 404,
            "message": "Patient 1 does not exist"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let url = format!("{}/patients/1", server.uri());
    let outcome = run(&format!("del('{url}')"), json!({})).await;

    match &outcome {
        Err(EngineError::Collaborator(err)) => {
            assert_eq!(err.status, Some(404));
            assert!(err.message.starts_with(&format!("DELETE {url} (404) responded with:")));
        }
        other => panic!("expected a collaborator error, got {other:?}"),
    }
    let envelope = classify(&outcome);
    assert_eq!(envelope.http_status, 404);
    assert_eq!(envelope.message, json!("Patient 1 does not exist"));
}

#[tokio::test]
async fn test_custom_success_codes() {
    let server = MockServer::start().await;
    Mock::given(method("PATCH"))
        .and(path("/records"))
        .respond_with(ResponseTemplate::new(409).set_body_string("already there"))
        .expect(1)
        .mount(&server)
        .await;

    let source = r#"
        patch('/records', { body: { a: 1 }, options: { successCodes: [200, 409] } });
    "#;
    let state = run(source, json!({"configuration": {"baseUrl": server.uri()}}))
        .await
        .unwrap();

    assert_eq!(state.latest_reference().unwrap()["statusCode"], json!(409));
    assert_eq!(state.data(), &json!("already there"));
}

#[tokio::test]
async fn test_unreachable_collaborator() {
    let outcome = run("get('http://127.0.0.1:1/unreachable')", json!({})).await;
    match outcome {
        Err(EngineError::Collaborator(err)) => {
            assert_eq!(err.status, None);
            assert!(err.message.starts_with("GET http://127.0.0.1:1/unreachable failed"));
        }
        other => panic!("expected a collaborator error, got {other:?}"),
    }
}
