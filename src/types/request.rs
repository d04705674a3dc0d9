use secrecy::{ExposeSecret as _, SecretString};
use serde::Serialize;
use serde_json::Value;

/// Commands the client can issue once authenticated.
///
/// The connection stamps the command id when the request is sent.
#[non_exhaustive]
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    GetStates,
    GetConfig,
    GetServices,
    GetPanels,
    CallService {
        domain: String,
        service: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        service_data: Option<Value>,
    },
    SubscribeEvents {
        #[serde(skip_serializing_if = "Option::is_none")]
        event_type: Option<String>,
    },
    UnsubscribeEvents {
        /// Id of the `subscribe_events` command being cancelled
        subscription: u64,
    },
    Ping,
}

impl Request {
    #[must_use]
    pub fn call_service<D: Into<String>, S: Into<String>>(
        domain: D,
        service: S,
        service_data: Option<Value>,
    ) -> Self {
        Self::CallService {
            domain: domain.into(),
            service: service.into(),
            service_data,
        }
    }

    #[must_use]
    pub fn subscribe_events(event_type: Option<&str>) -> Self {
        Self::SubscribeEvents {
            event_type: event_type.map(str::to_owned),
        }
    }

    /// Serialize with the given command id.
    pub(crate) fn to_frame(&self, id: u64) -> Result<String, serde_json::Error> {
        let mut payload = serde_json::to_value(self)?;
        if let Value::Object(obj) = &mut payload {
            obj.insert("id".to_owned(), Value::from(id));
        }
        serde_json::to_string(&payload)
    }
}

/// The only message sent without an id.
///
/// # Security
///
/// The serialized form contains the token in plaintext. Only send it over the
/// socket it was built for and never log it.
#[derive(Serialize)]
#[serde(tag = "type", rename = "auth")]
pub(crate) struct AuthRequest<'token> {
    api_password: &'token str,
}

impl<'token> AuthRequest<'token> {
    pub(crate) fn new(token: &'token SecretString) -> Self {
        Self {
            api_password: token.expose_secret(),
        }
    }
}
