//! Versioned catalog of Evolution API endpoints.
//!
//! Evolution API changed its paths between major versions (v1 used `GET`
//! lookups under `/instance`, v2 moved to `POST` queries under `/chat`), and
//! deployments in the wild run either. Each logical operation lists its
//! candidate endpoints here, tagged with the version they belong to.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Evolution API major version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiVersion {
    V1,
    V2,
}

impl ApiVersion {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApiVersion::V1 => "v1",
            ApiVersion::V2 => "v2",
        }
    }
}

impl fmt::Display for ApiVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ApiVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "v1" | "1" => Ok(ApiVersion::V1),
            "v2" | "2" => Ok(ApiVersion::V2),
            other => Err(format!("unknown Evolution API version: {other}")),
        }
    }
}

/// Logical operation against an Evolution instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    FetchContacts,
    FetchChats,
    FetchMessages,
    ConnectionState,
    Connect,
    MediaBase64,
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::FetchContacts => "fetch_contacts",
            Operation::FetchChats => "fetch_chats",
            Operation::FetchMessages => "fetch_messages",
            Operation::ConnectionState => "connection_state",
            Operation::Connect => "connect",
            Operation::MediaBase64 => "media_base64",
        }
    }

    /// Per-attempt timeout
    pub fn timeout(&self) -> Duration {
        match self {
            Operation::ConnectionState => Duration::from_secs(5),
            Operation::FetchContacts | Operation::FetchChats | Operation::Connect => {
                Duration::from_secs(10)
            }
            Operation::FetchMessages | Operation::MediaBase64 => Duration::from_secs(15),
        }
    }

    /// Candidate endpoints in catalog order
    pub fn endpoints(&self) -> &'static [Endpoint] {
        match self {
            Operation::FetchContacts => FETCH_CONTACTS,
            Operation::FetchChats => FETCH_CHATS,
            Operation::FetchMessages => FETCH_MESSAGES,
            Operation::ConnectionState => CONNECTION_STATE,
            Operation::Connect => CONNECT,
            Operation::MediaBase64 => MEDIA_BASE64,
        }
    }

    /// Candidate endpoints with the pinned version's entries moved to the front.
    pub fn endpoints_for(&self, pinned: Option<ApiVersion>) -> Vec<&'static Endpoint> {
        let all = self.endpoints();
        match pinned {
            None => all.iter().collect(),
            Some(version) => all
                .iter()
                .filter(|e| e.version == version)
                .chain(all.iter().filter(|e| e.version != version))
                .collect(),
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Request body shape an endpoint expects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
    None,
    EmptyWhere,
    MessagesByJid,
    MessageKey,
}

/// One candidate endpoint
#[derive(Debug, PartialEq, Eq)]
pub struct Endpoint {
    pub version: ApiVersion,
    pub method: EndpointMethod,
    /// Path template; `{instance}` is replaced by the instance id
    pub path: &'static str,
    pub body: BodyKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointMethod {
    Get,
    Post,
}

impl EndpointMethod {
    pub fn to_method(self) -> Method {
        match self {
            EndpointMethod::Get => Method::GET,
            EndpointMethod::Post => Method::POST,
        }
    }
}

impl Endpoint {
    /// Full URL for the given base URL and instance
    pub fn url(&self, api_url: &str, instance_id: &str) -> String {
        let instance = urlencoding::encode(instance_id);
        format!(
            "{}{}",
            api_url.trim_end_matches('/'),
            self.path.replace("{instance}", &instance)
        )
    }

    /// JSON body for POST endpoints
    pub fn body(&self, remote_jid: Option<&str>, message_id: Option<&str>, limit: usize) -> Option<Value> {
        match self.body {
            BodyKind::None => None,
            BodyKind::EmptyWhere => Some(json!({ "where": {} })),
            BodyKind::MessagesByJid => {
                let mut body = json!({ "where": {}, "limit": limit });
                if let Some(jid) = remote_jid {
                    body["where"] = json!({ "key": { "remoteJid": jid } });
                }
                Some(body)
            }
            BodyKind::MessageKey => Some(json!({
                "message": { "key": { "id": message_id.unwrap_or_default() } },
                "convertToMp4": false,
            })),
        }
    }

    /// Query string for GET endpoints that take a chat filter
    pub fn query(&self, remote_jid: Option<&str>) -> Option<String> {
        match (self.method, self.body, remote_jid) {
            (EndpointMethod::Get, BodyKind::MessagesByJid, Some(jid)) => {
                Some(format!("remoteJid={}", urlencoding::encode(jid)))
            }
            _ => None,
        }
    }
}

const fn endpoint(
    version: ApiVersion,
    method: EndpointMethod,
    path: &'static str,
    body: BodyKind,
) -> Endpoint {
    Endpoint {
        version,
        method,
        path,
        body,
    }
}

use ApiVersion::{V1, V2};
use EndpointMethod::{Get, Post};

static FETCH_CONTACTS: &[Endpoint] = &[
    endpoint(V1, Get, "/instance/fetchContacts/{instance}", BodyKind::None),
    endpoint(V1, Get, "/instance/getAllContacts/{instance}", BodyKind::None),
    endpoint(V2, Post, "/chat/findContacts/{instance}", BodyKind::EmptyWhere),
];

static FETCH_CHATS: &[Endpoint] = &[
    endpoint(V1, Get, "/chat/findChats/{instance}", BodyKind::None),
    endpoint(V2, Post, "/chat/findChats/{instance}", BodyKind::EmptyWhere),
];

static FETCH_MESSAGES: &[Endpoint] = &[
    endpoint(V2, Post, "/chat/findMessages/{instance}", BodyKind::MessagesByJid),
    endpoint(V1, Get, "/chat/findMessages/{instance}", BodyKind::MessagesByJid),
];

static CONNECTION_STATE: &[Endpoint] = &[endpoint(
    V1,
    Get,
    "/instance/connectionState/{instance}",
    BodyKind::None,
)];

static CONNECT: &[Endpoint] = &[endpoint(V1, Get, "/instance/connect/{instance}", BodyKind::None)];

static MEDIA_BASE64: &[Endpoint] = &[endpoint(
    V2,
    Post,
    "/chat/getBase64FromMediaMessage/{instance}",
    BodyKind::MessageKey,
)];
