// Bridge Module - Hue bridge REST client (discovery, registration, lamp state)
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;

use crate::error::{HueError, HueResult};
use crate::types::{LampTarget, LightState};

pub const DEFAULT_DISCOVERY_URL: &str = "https://discovery.meethue.com/";

// Bridges serve the v1 API over plain HTTP on port 80
const DEFAULT_BRIDGE_PORT: u16 = 80;

// The cloud locator reports the bridge's HTTPS port; the same API is on port 80
const BRIDGE_TLS_PORT: u16 = 443;

/// One entry of the bridge locator's answer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredBridge {
    #[serde(default, alias = "internalipaddress")]
    pub address: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub id: Option<String>,
}

/// Captured bridge location
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeTarget {
    pub address: String,
    pub port: u16,
}

impl BridgeTarget {
    pub fn new(address: impl Into<String>) -> Self {
        BridgeTarget { address: address.into(), port: DEFAULT_BRIDGE_PORT }
    }

    /// Location from a locator entry, if it carries an address
    pub fn from_discovered(found: &DiscoveredBridge) -> Option<Self> {
        let address = found.address.as_deref().map(str::trim).filter(|a| !a.is_empty())?;
        Some(BridgeTarget {
            address: address.to_string(),
            port: found.port.unwrap_or(DEFAULT_BRIDGE_PORT),
        })
    }

    /// Plain-HTTP address of the bridge API, port included only when it is non-standard
    pub fn host(&self) -> String {
        if self.port == DEFAULT_BRIDGE_PORT || self.port == BRIDGE_TLS_PORT {
            self.address.clone()
        } else {
            format!("{}:{}", self.address, self.port)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PairStatus {
    Success,
    LinkButtonNotPressed,
    Rejected,
}

/// Outcome of one registration request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairResponse {
    pub status: PairStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl PairResponse {
    pub fn success(username: impl Into<String>) -> Self {
        PairResponse {
            status: PairStatus::Success,
            username: Some(username.into()),
            description: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == PairStatus::Success && self.username.is_some()
    }
}

/// A light or group known to the bridge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LampInfo {
    pub id: String,
    pub name: String,
    pub is_group: bool,
}

/// Operations this service needs from a Hue bridge
pub trait HueBridge: Send + Sync {
    fn discover(&self) -> BoxFuture<'_, HueResult<Vec<DiscoveredBridge>>>;

    fn pair<'a>(&'a self, address: &'a str) -> BoxFuture<'a, HueResult<PairResponse>>;

    fn set_state<'a>(&'a self, lamp: &'a LampTarget, state: &'a LightState) -> BoxFuture<'a, HueResult<()>>;

    fn is_on<'a>(&'a self, lamp: &'a LampTarget) -> BoxFuture<'a, HueResult<bool>>;

    fn list_lamps<'a>(&'a self, address: &'a str, username: &'a str) -> BoxFuture<'a, HueResult<Vec<LampInfo>>>;
}

pub struct HttpBridge {
    client: reqwest::Client,
    discovery_url: String,
    device_type: String,
}

impl HttpBridge {
    pub fn new(discovery_url: &str, device_type: &str) -> HueResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()?;
        Ok(HttpBridge {
            client,
            discovery_url: discovery_url.to_string(),
            device_type: device_type.to_string(),
        })
    }

    fn base_url(address: &str) -> String {
        let address = address.trim().trim_end_matches('/');
        if address.contains("://") {
            address.to_string()
        } else {
            format!("http://{}", address)
        }
    }

    fn lamp_url(lamp: &LampTarget) -> String {
        let kind = if lamp.is_group { "groups" } else { "lights" };
        format!("{}/api/{}/{}/{}", Self::base_url(&lamp.address), lamp.username, kind, lamp.lamp_id)
    }
}

/// Surface the first `error` object of a Hue response as an error
fn check_api_response(value: Value) -> HueResult<Value> {
    let first_error = value
        .as_array()
        .and_then(|items| items.iter().find_map(|item| item.get("error")))
        .or_else(|| value.get("error"));

    if let Some(error) = first_error {
        return Err(HueError::Bridge {
            kind: error.get("type").and_then(Value::as_u64).unwrap_or(0) as u32,
            description: error
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string(),
        });
    }
    Ok(value)
}

/// Interpret the bridge's answer to a registration request
pub fn parse_pair_response(value: Value) -> PairResponse {
    match check_api_response(value) {
        Ok(value) => {
            let username = value
                .as_array()
                .and_then(|items| items.first())
                .and_then(|item| item.pointer("/success/username"))
                .and_then(Value::as_str)
                .map(str::to_string);
            match username {
                Some(username) => PairResponse::success(username),
                None => PairResponse {
                    status: PairStatus::Rejected,
                    username: None,
                    description: Some("no username in bridge response".to_string()),
                },
            }
        }
        Err(e) => PairResponse {
            status: if e.is_link_button_pending() {
                PairStatus::LinkButtonNotPressed
            } else {
                PairStatus::Rejected
            },
            username: None,
            description: Some(e.to_string()),
        },
    }
}

/// Parse a `/lights` or `/groups` listing keyed by id
pub fn parse_lamp_listing(value: &Value, is_group: bool) -> Vec<LampInfo> {
    let mut lamps: Vec<LampInfo> = value
        .as_object()
        .map(|entries| {
            entries
                .iter()
                .map(|(id, entry)| LampInfo {
                    id: id.clone(),
                    name: entry.get("name").and_then(Value::as_str).unwrap_or(id.as_str()).to_string(),
                    is_group,
                })
                .collect()
        })
        .unwrap_or_default();
    lamps.sort_by_key(|l| l.id.parse::<u64>().unwrap_or(u64::MAX));
    lamps
}

impl HueBridge for HttpBridge {
    fn discover(&self) -> BoxFuture<'_, HueResult<Vec<DiscoveredBridge>>> {
        Box::pin(async move {
            let response = self.client.get(&self.discovery_url).send().await?.error_for_status()?;
            let found: Vec<DiscoveredBridge> = response.json().await?;
            Ok(found)
        })
    }

    fn pair<'a>(&'a self, address: &'a str) -> BoxFuture<'a, HueResult<PairResponse>> {
        Box::pin(async move {
            let url = format!("{}/api", Self::base_url(address));
            let body = json!({ "devicetype": self.device_type });
            let value: Value = self.client.post(url).json(&body).send().await?.json().await?;
            Ok(parse_pair_response(value))
        })
    }

    fn set_state<'a>(&'a self, lamp: &'a LampTarget, state: &'a LightState) -> BoxFuture<'a, HueResult<()>> {
        Box::pin(async move {
            let suffix = if lamp.is_group { "action" } else { "state" };
            let url = format!("{}/{}", Self::lamp_url(lamp), suffix);
            let value: Value = self.client.put(url).json(state).send().await?.json().await?;
            check_api_response(value)?;
            Ok(())
        })
    }

    fn is_on<'a>(&'a self, lamp: &'a LampTarget) -> BoxFuture<'a, HueResult<bool>> {
        Box::pin(async move {
            let value: Value = self.client.get(Self::lamp_url(lamp)).send().await?.json().await?;
            let value = check_api_response(value)?;
            let pointer = if lamp.is_group { "/action/on" } else { "/state/on" };
            value
                .pointer(pointer)
                .and_then(Value::as_bool)
                .ok_or_else(|| HueError::UnexpectedResponse(format!("no {} in lamp state", pointer)))
        })
    }

    fn list_lamps<'a>(&'a self, address: &'a str, username: &'a str) -> BoxFuture<'a, HueResult<Vec<LampInfo>>> {
        Box::pin(async move {
            let base = format!("{}/api/{}", Self::base_url(address), username);
            let lights: Value = self.client.get(format!("{}/lights", base)).send().await?.json().await?;
            let groups: Value = self.client.get(format!("{}/groups", base)).send().await?.json().await?;
            let mut lamps = parse_lamp_listing(&check_api_response(lights)?, false);
            lamps.extend(parse_lamp_listing(&check_api_response(groups)?, true));
            Ok(lamps)
        })
    }
}
