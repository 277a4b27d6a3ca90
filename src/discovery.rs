// Discovery Module - Bridge locator lookup and the captured bridge session
use serde::Serialize;
use std::sync::Mutex;

use crate::bridge::{BridgeTarget, DiscoveredBridge, HueBridge};
use crate::error::HueResult;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DiscoveryState {
    Idle,
    Discovering,
    Discovered { target: BridgeTarget },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryOutcome {
    Found(BridgeTarget),
    NotFound,
}

impl DiscoveryOutcome {
    pub fn status_text(&self) -> String {
        match self {
            DiscoveryOutcome::Found(target) => format!("Bridge found at {}", target.address),
            DiscoveryOutcome::NotFound => "No bridge found".to_string(),
        }
    }
}

/// Told about every discovery state change, e.g. to refresh status text
pub trait DiscoveryObserver: Send + Sync {
    fn on_discovery(&self, state: &DiscoveryState);
}

/// Bridge location shared by discovery (writer) and pairing (reader)
#[derive(Debug, Clone)]
pub struct BridgeSession {
    discovery: DiscoveryState,
    target: Option<BridgeTarget>,
}

impl Default for BridgeSession {
    fn default() -> Self {
        BridgeSession { discovery: DiscoveryState::Idle, target: None }
    }
}

impl BridgeSession {
    pub fn new(target: Option<BridgeTarget>) -> Self {
        BridgeSession { discovery: DiscoveryState::Idle, target }
    }

    pub fn target(&self) -> Option<&BridgeTarget> {
        self.target.as_ref()
    }

    pub fn set_target(&mut self, target: BridgeTarget) {
        self.target = Some(target);
    }

    pub fn discovery_state(&self) -> &DiscoveryState {
        &self.discovery
    }

    pub fn begin_discovery(&mut self) -> &DiscoveryState {
        self.discovery = DiscoveryState::Discovering;
        &self.discovery
    }

    /// Capture the first result carrying an address; anything else leaves the session idle
    pub fn finish_discovery(&mut self, result: HueResult<Vec<DiscoveredBridge>>) -> DiscoveryOutcome {
        let found = match result {
            Ok(found) => found,
            Err(e) => {
                log::warn!("Bridge discovery failed: {}", e);
                Vec::new()
            }
        };

        match found.first().and_then(BridgeTarget::from_discovered) {
            Some(target) => {
                self.target = Some(target.clone());
                self.discovery = DiscoveryState::Discovered { target: target.clone() };
                DiscoveryOutcome::Found(target)
            }
            None => {
                self.discovery = DiscoveryState::Idle;
                DiscoveryOutcome::NotFound
            }
        }
    }
}

/// Run one discovery request and record its result in the session
pub async fn discover(
    bridge: &dyn HueBridge,
    session: &Mutex<BridgeSession>,
    observer: &dyn DiscoveryObserver,
) -> DiscoveryOutcome {
    {
        let mut session = session.lock().unwrap_or_else(|e| e.into_inner());
        observer.on_discovery(session.begin_discovery());
    }

    let result = bridge.discover().await;

    let mut session = session.lock().unwrap_or_else(|e| e.into_inner());
    let outcome = session.finish_discovery(result);
    observer.on_discovery(session.discovery_state());
    match &outcome {
        DiscoveryOutcome::Found(target) => log::info!("Discovered bridge at {}:{}", target.address, target.port),
        DiscoveryOutcome::NotFound => log::info!("No bridge found"),
    }
    outcome
}
