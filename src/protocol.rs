use serde::{Deserialize, Serialize};

/// Inbound channel: the foreground asks the service to start.
pub const START_NOTIFICATION_SERVICE: &str = "PUSH_RECEIVER:::START_NOTIFICATION_SERVICE";
pub const NOTIFICATION_SERVICE_STARTED: &str = "PUSH_RECEIVER:::NOTIFICATION_SERVICE_STARTED";
pub const NOTIFICATION_SERVICE_RESTARTED: &str = "PUSH_RECEIVER:::NOTIFICATION_SERVICE_RESTARTED";
pub const NOTIFICATION_SERVICE_ERROR: &str = "PUSH_RECEIVER:::NOTIFICATION_SERVICE_ERROR";
pub const NOTIFICATION_RECEIVED: &str = "PUSH_RECEIVER:::NOTIFICATION_RECEIVED";
pub const TOKEN_UPDATED: &str = "PUSH_RECEIVER:::TOKEN_UPDATED";

/// The app identity a registration is issued for.
///
/// Supplied by the foreground on the first start request and fixed for the
/// rest of the process lifetime.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    #[serde(rename = "appID")]
    pub app_id: String,
    #[serde(rename = "projectID")]
    pub project_id: String,
    #[serde(rename = "apiKey")]
    pub api_key: String,
    #[serde(rename = "vapidKey")]
    pub vapid_key: String,
}

impl Identity {
    pub fn new(
        app_id: impl Into<String>,
        project_id: impl Into<String>,
        api_key: impl Into<String>,
        vapid_key: impl Into<String>,
    ) -> Self {
        Self {
            app_id: app_id.into(),
            project_id: project_id.into(),
            api_key: api_key.into(),
            vapid_key: vapid_key.into(),
        }
    }

    /// All four fields are required and must be non-empty.
    pub fn validate(&self) -> Result<(), String> {
        let fields = [
            ("appID", &self.app_id),
            ("projectID", &self.project_id),
            ("apiKey", &self.api_key),
            ("vapidKey", &self.vapid_key),
        ];
        for (name, value) in fields {
            if value.trim().is_empty() {
                return Err(format!("{} must not be empty", name));
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("app_id", &self.app_id)
            .field("project_id", &self.project_id)
            .field("vapid_key", &self.vapid_key)
            .finish_non_exhaustive()
    }
}

/// A decrypted push message. The structure is owned by the backend, so it is
/// carried through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PushMessage(pub serde_json::Value);

impl PushMessage {
    /// The backend's persistent id for this message, if it carries one.
    pub fn persistent_id(&self) -> Option<&str> {
        self.0.get("persistentId").and_then(|v| v.as_str())
    }
}

/// Everything the service reports to the foreground.
#[derive(Debug, Clone, PartialEq)]
pub enum PushEvent {
    /// First successful connect, or the echo for a repeated start request.
    ServiceStarted(Option<String>),
    /// A reconnect after an unsolicited closure succeeded.
    ServiceRestarted(String),
    /// Any failure, or an informational notice such as a suppressed reconnect.
    ServiceError(String),
    /// A new credential was issued and persisted.
    TokenUpdated(String),
    MessageReceived(PushMessage),
}

impl PushEvent {
    /// The bridge channel name this event is published on.
    pub fn channel(&self) -> &'static str {
        match self {
            Self::ServiceStarted(_) => NOTIFICATION_SERVICE_STARTED,
            Self::ServiceRestarted(_) => NOTIFICATION_SERVICE_RESTARTED,
            Self::ServiceError(_) => NOTIFICATION_SERVICE_ERROR,
            Self::TokenUpdated(_) => TOKEN_UPDATED,
            Self::MessageReceived(_) => NOTIFICATION_RECEIVED,
        }
    }

    /// Encode as a bridge frame.
    pub fn to_frame(&self) -> Frame {
        let payload = match self {
            Self::ServiceStarted(token) => match token {
                Some(t) => serde_json::Value::String(t.clone()),
                None => serde_json::Value::Null,
            },
            Self::ServiceRestarted(token) | Self::TokenUpdated(token) => {
                serde_json::Value::String(token.clone())
            }
            Self::ServiceError(message) => serde_json::Value::String(message.clone()),
            Self::MessageReceived(message) => message.0.clone(),
        };
        Frame {
            channel: self.channel().to_string(),
            payload,
        }
    }
}

/// One line of the stdio bridge, in either direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub channel: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}
