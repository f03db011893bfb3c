//! `language-http`: generic REST calls.

use mediator_engine::{
    Adaptor, BoxedOperation, EngineResult, LazyValue, OperationArgs, State, operation,
};
use reqwest::Method;
use serde_json::Value;
use tracing::info;

use crate::client::{CollaboratorClient, CollaboratorRequest, Credentials, query_pairs};

const OPERATIONS: &[&str] = &["get", "post", "put", "patch", "del"];

/// Adaptor issuing plain HTTP requests.
///
/// Each builder takes `(path, params, callback)`. `params` may carry
/// `query`, `headers`, `body`, `authentication` and `options.successCodes`;
/// `callback` receives the next state and returns the state to keep.
#[derive(Debug, Clone, Default)]
pub struct HttpAdaptor {
    client: CollaboratorClient,
}

impl HttpAdaptor {
    pub const NAME: &'static str = "language-http";

    pub fn new(client: CollaboratorClient) -> Self {
        Self { client }
    }
}

impl Adaptor for HttpAdaptor {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn operations(&self) -> &[&'static str] {
        OPERATIONS
    }

    fn build(&self, name: &str, args: Vec<LazyValue>) -> EngineResult<BoxedOperation> {
        let method = match name {
            "get" => Method::GET,
            "post" => Method::POST,
            "put" => Method::PUT,
            "patch" => Method::PATCH,
            "del" => Method::DELETE,
            other => return Err(self.unknown(other)),
        };
        let args = OperationArgs::new(name, args);
        let path = args.required(0, "path")?;
        let params = args.optional(1);
        let callback = args.optional(2);
        let client = self.client.clone();
        let name = name.to_string();

        Ok(operation(name.clone(), move |state: State| {
            let client = client.clone();
            let method = method.clone();
            let path = path.clone();
            let params = params.clone();
            let callback = callback.clone();
            let name = name.clone();
            async move {
                let path = OperationArgs::resolve_string(&path, &state, &name)?;
                let params = match &params {
                    Some(params) => params.resolve(&state)?,
                    None => Value::Null,
                };

                let request = build_request(method, &state, &path, &params);
                let response = client.send(request).await?;
                info!(operation = %name, status = response.status, "Request succeeded");

                let body = response.body.clone();
                let next = state.push_reference(response.into_reference()).with("data", body);
                match &callback {
                    Some(callback) => State::from_value(callback.resolve(&next)?),
                    None => Ok(next),
                }
            }
        }))
    }
}

fn build_request(method: Method, state: &State, path: &str, params: &Value) -> CollaboratorRequest {
    let url = match state.configuration_str("baseUrl") {
        Some(base) => format!("{base}{path}"),
        None => path.to_string(),
    };

    let credentials = params
        .get("authentication")
        .or_else(|| params.get("auth"))
        .and_then(Credentials::from_value)
        .or_else(|| {
            state
                .configuration()
                .and_then(|config| Credentials::from_value(&Value::Object(config.clone())))
        });

    let query = ["params", "qs", "query"]
        .iter()
        .filter_map(|key| params.get(*key))
        .flat_map(query_pairs)
        .collect();

    let mut request = CollaboratorRequest::new(method, url)
        .credentials(credentials)
        .query(query);

    if let Some(headers) = params.get("headers").and_then(Value::as_object) {
        request.headers = headers
            .iter()
            .map(|(name, value)| match value {
                Value::String(s) => (name.clone(), s.clone()),
                other => (name.clone(), other.to_string()),
            })
            .collect();
    }

    if let Some(body) = ["body", "json", "data"]
        .iter()
        .filter_map(|key| params.get(*key))
        .find(|body| !body.is_null())
    {
        request = request.json(body.clone());
    }

    request.success_codes = params
        .pointer("/options/successCodes")
        .and_then(Value::as_array)
        .map(|codes| {
            codes
                .iter()
                .filter_map(Value::as_u64)
                .filter_map(|code| u16::try_from(code).ok())
                .collect()
        });

    request
}
