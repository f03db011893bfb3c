//! `language-dhis2`: tracker, event and aggregate calls against a DHIS2
//! instance.
//!
//! Every operation reads `hostUrl`, `username` and `password` from
//! `state.configuration` and prepends the response record to
//! `state.references`.

use async_trait::async_trait;
use mediator_engine::state::CONFIGURATION;
use mediator_engine::{
    Adaptor, BoxedOperation, EngineError, EngineResult, LazyValue, Operation, OperationArgs,
    ScriptHelper, State, sync_operation,
};
use reqwest::Method;
use serde_json::Value;
use tracing::{debug, info, warn};
use url::Url;

use crate::client::{CollaboratorClient, CollaboratorRequest, Credentials, query_pairs};

const OPERATIONS: &[&str] = &[
    "createTEI",
    "updateTEI",
    "enroll",
    "event",
    "dataValueSet",
    "fetchData",
    "fetchEvents",
    "fetchAnalytics",
];

const HELPERS: &[ScriptHelper] = &[ScriptHelper {
    name: "dataElement",
    source: r#"function dataElement(dataElement, value, comment) {
    var element = { dataElement: dataElement, value: value };
    if (comment !== undefined) element.comment = comment;
    return element;
}"#,
}];

#[derive(Debug, Clone, Default)]
pub struct Dhis2Adaptor {
    client: CollaboratorClient,
}

impl Dhis2Adaptor {
    pub const NAME: &'static str = "language-dhis2";

    pub fn new(client: CollaboratorClient) -> Self {
        Self { client }
    }
}

impl Adaptor for Dhis2Adaptor {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn operations(&self) -> &[&'static str] {
        OPERATIONS
    }

    fn helpers(&self) -> &[ScriptHelper] {
        HELPERS
    }

    fn build(&self, name: &str, args: Vec<LazyValue>) -> EngineResult<BoxedOperation> {
        let name: &'static str = OPERATIONS
            .iter()
            .copied()
            .find(|op| *op == name)
            .ok_or_else(|| self.unknown(name))?;
        let args = OperationArgs::new(name, args);
        let client = self.client.clone();

        let write = |method: Method, resource: Resource, data: LazyValue| -> BoxedOperation {
            Box::new(WriteOperation {
                name,
                method,
                resource,
                data,
                client: client.clone(),
            })
        };
        let fetch = |resource: &'static str, query_key: &'static str| -> EngineResult<BoxedOperation> {
            Ok(Box::new(FetchOperation {
                name,
                resource,
                query_key,
                params: args.required(0, "params")?,
                post_url: args.optional(1),
                client: client.clone(),
            }))
        };

        match name {
            "createTEI" => Ok(write(
                Method::POST,
                Resource::Collection("api/trackedEntityInstances"),
                args.required(0, "data")?,
            )),
            "updateTEI" => Ok(write(
                Method::PUT,
                Resource::TrackedEntity(args.required(0, "tei")?),
                args.required(1, "data")?,
            )),
            "enroll" => Ok(write(
                Method::POST,
                Resource::Enrollment(args.required(0, "tei")?),
                args.required(1, "enrollmentData")?,
            )),
            "event" => Ok(write(
                Method::POST,
                Resource::Collection("api/events"),
                args.required(0, "eventData")?,
            )),
            "dataValueSet" => Ok(write(
                Method::POST,
                Resource::Collection("api/dataValueSets"),
                args.required(0, "data")?,
            )),
            "fetchData" => fetch("api/dataValueSets.json", "fields"),
            "fetchEvents" => fetch("api/events.json", "fields"),
            "fetchAnalytics" => fetch("api/26/analytics.json", "query"),
            other => Err(self.unknown(other)),
        }
    }

    fn setup(&self) -> Vec<BoxedOperation> {
        vec![sync_operation("configMigration", migrate_config)]
    }
}

/// Fill a blank `hostUrl` from the older `apiUrl` setting.
fn migrate_config(mut state: State) -> EngineResult<State> {
    let Some(config) = state.configuration() else {
        return Ok(state);
    };
    let host_missing = config
        .get("hostUrl")
        .and_then(Value::as_str)
        .is_none_or(str::is_empty);
    if !host_missing {
        return Ok(state);
    }
    let Some(api_url) = config.get("apiUrl").cloned() else {
        return Ok(state);
    };

    warn!("DEPRECATION WARNING: Please migrate instance address from `apiUrl` to `hostUrl`.");
    let mut config = config.clone();
    config.insert("hostUrl".to_string(), api_url);
    state.insert(CONFIGURATION, Value::Object(config));
    Ok(state)
}

/// Instance address and credentials taken from `state.configuration`.
struct Connection {
    host: Url,
    credentials: Option<Credentials>,
}

impl Connection {
    fn from_state(state: &State, operation: &str) -> EngineResult<Self> {
        let host = state
            .configuration_str("hostUrl")
            .filter(|host| !host.is_empty())
            .ok_or_else(|| {
                EngineError::invalid_argument(operation, "configuration.hostUrl is not set")
            })?;
        let host = Url::parse(&format!("{}/", host.trim_end_matches('/'))).map_err(|e| {
            EngineError::invalid_argument(operation, format!("invalid hostUrl `{host}`: {e}"))
        })?;
        let credentials = state
            .configuration()
            .and_then(|config| Credentials::from_value(&Value::Object(config.clone())));
        Ok(Self { host, credentials })
    }

    fn url(&self, path: &str, operation: &str) -> EngineResult<String> {
        self.host
            .join(path)
            .map(String::from)
            .map_err(|e| EngineError::invalid_argument(operation, format!("invalid path `{path}`: {e}")))
    }

    fn request(&self, method: Method, url: String) -> CollaboratorRequest {
        CollaboratorRequest::new(method, url).credentials(self.credentials.clone())
    }
}

enum Resource {
    Collection(&'static str),
    /// `api/trackedEntityInstances/{tei}`
    TrackedEntity(LazyValue),
    /// `api/enrollments`, with `trackedEntityInstance` set on the body
    Enrollment(LazyValue),
}

struct WriteOperation {
    name: &'static str,
    method: Method,
    resource: Resource,
    data: LazyValue,
    client: CollaboratorClient,
}

#[async_trait]
impl Operation for WriteOperation {
    fn name(&self) -> &str {
        self.name
    }

    async fn apply(&self, state: State) -> EngineResult<State> {
        let connection = Connection::from_state(&state, self.name)?;
        let mut body = self.data.resolve(&state)?;

        let path = match &self.resource {
            Resource::Collection(path) => (*path).to_string(),
            Resource::TrackedEntity(tei) => {
                let tei = OperationArgs::resolve_string(tei, &state, self.name)?;
                format!("api/trackedEntityInstances/{tei}")
            }
            Resource::Enrollment(tei) => {
                let tei = OperationArgs::resolve_string(tei, &state, self.name)?;
                let fields = body.as_object_mut().ok_or_else(|| {
                    EngineError::invalid_argument(self.name, "enrollment data must be an object")
                })?;
                fields.insert("trackedEntityInstance".to_string(), Value::String(tei));
                "api/enrollments".to_string()
            }
        };

        let url = connection.url(&path, self.name)?;
        info!(operation = self.name, url = %url, "Sending data to DHIS2");
        debug!(operation = self.name, body = %body, "Request body");

        let response = self
            .client
            .send(connection.request(self.method.clone(), url).json(body))
            .await?;
        info!(operation = self.name, status = response.status, "DHIS2 accepted the request");
        Ok(state.push_reference(response.into_reference()))
    }
}

struct FetchOperation {
    name: &'static str,
    resource: &'static str,
    /// Key of `params` holding the query; the whole of `params` otherwise
    query_key: &'static str,
    params: LazyValue,
    post_url: Option<LazyValue>,
    client: CollaboratorClient,
}

#[async_trait]
impl Operation for FetchOperation {
    fn name(&self) -> &str {
        self.name
    }

    async fn apply(&self, state: State) -> EngineResult<State> {
        let connection = Connection::from_state(&state, self.name)?;
        let params = self.params.resolve(&state)?;
        let query = query_pairs(params.get(self.query_key).unwrap_or(&params));
        let url = connection.url(self.resource, self.name)?;

        info!(operation = self.name, url = %url, "Fetching from DHIS2");
        let mut response = self
            .client
            .send(connection.request(Method::GET, url).query(query))
            .await?;

        if let Some(post_url) = &self.post_url {
            let target = OperationArgs::resolve_string(post_url, &state, self.name)?;
            info!(operation = self.name, url = %target, "Posting fetched data");
            response = self
                .client
                .send(connection.request(Method::POST, target).json(response.body))
                .await?;
        }

        Ok(state.push_reference(response.into_reference()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn state(value: Value) -> State {
        State::from_value(value).unwrap()
    }

    #[test]
    fn test_config_migration_fills_host_url() {
        let migrated = migrate_config(state(json!({
            "configuration": {"apiUrl": "https://play.dhis2.org/demo", "username": "admin"}
        })))
        .unwrap();
        assert_eq!(
            migrated.configuration_str("hostUrl"),
            Some("https://play.dhis2.org/demo")
        );
        assert_eq!(migrated.configuration_str("username"), Some("admin"));
    }

    #[test]
    fn test_config_migration_keeps_host_url() {
        let original = state(json!({
            "configuration": {"hostUrl": "https://a", "apiUrl": "https://b"}
        }));
        let migrated = migrate_config(original.clone()).unwrap();
        assert_eq!(migrated, original);

        let bare = state(json!({"data": {}}));
        assert_eq!(migrate_config(bare.clone()).unwrap(), bare);
    }

    #[test]
    fn test_connection_urls() {
        let s = state(json!({"configuration": {
            "hostUrl": "https://dhis2.example.org/instance/",
            "username": "admin",
            "password": "district"
        }}));
        let connection = Connection::from_state(&s, "event").unwrap();
        assert_eq!(
            connection.url("api/events", "event").unwrap(),
            "https://dhis2.example.org/instance/api/events"
        );
        assert_eq!(connection.credentials.unwrap().username, "admin");
    }

    #[test]
    fn test_missing_host_url() {
        let err = Connection::from_state(&state(json!({"configuration": {}})), "event")
            .err()
            .unwrap();
        assert!(err.to_string().contains("hostUrl"));
    }

    #[test]
    fn test_exports() {
        let adaptor = Dhis2Adaptor::default();
        assert_eq!(adaptor.operations().len(), 8);
        assert_eq!(adaptor.helpers()[0].name, "dataElement");
        assert_eq!(adaptor.setup().len(), 1);
        assert!(adaptor.build("deleteTEI", vec![]).is_err());
        assert!(adaptor.build("updateTEI", vec![LazyValue::literal("abc")]).is_err());
    }
}
