// Lights Module - Applies status rules to the configured lamp
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::bridge::HueBridge;
use crate::error::{HueError, HueResult};
use crate::status::{StatusMap, StatusRecord};
use crate::types::{LampTarget, LightState};

/// Everything the controller needs from the settings file
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LightSettings {
    pub bridge_addr: String,
    pub username: String,
    pub lamp_id: String,
    pub lamp_is_group: bool,
    pub default_bri: u8,
    pub rules: StatusMap,
}

impl LightSettings {
    pub fn lamp(&self) -> HueResult<LampTarget> {
        if self.bridge_addr.is_empty() {
            return Err(HueError::NoBridgeTarget);
        }
        if self.username.is_empty() {
            return Err(HueError::NotPaired);
        }
        if self.lamp_id.is_empty() {
            return Err(HueError::NoLamp);
        }
        Ok(LampTarget {
            address: self.bridge_addr.clone(),
            username: self.username.clone(),
            lamp_id: self.lamp_id.clone(),
            is_group: self.lamp_is_group,
        })
    }
}

/// State a matched rule puts the lamp into
pub fn state_for_rule(record: &StatusRecord, default_bri: u8) -> LightState {
    if record.switches_off() {
        LightState::off()
    } else {
        LightState::on(Some(&record.colour), record.effective_brightness(default_bri))
    }
}

pub struct LightController {
    bridge: Arc<dyn HueBridge>,
    settings: RwLock<LightSettings>,
    pending: Mutex<Vec<JoinHandle<()>>>,
}

impl LightController {
    pub fn new(bridge: Arc<dyn HueBridge>, settings: LightSettings) -> Self {
        LightController {
            bridge,
            settings: RwLock::new(settings),
            pending: Mutex::new(Vec::new()),
        }
    }

    pub fn settings(&self) -> LightSettings {
        self.settings.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Swap in freshly loaded settings (rules, lamp, credentials)
    pub fn update(&self, settings: LightSettings) {
        *self.settings.write().unwrap_or_else(|e| e.into_inner()) = settings;
    }

    /// React to a printer event. Returns the state scheduled for the lamp, if a rule matched.
    /// Every event runs on its own timer; a newer event never drops an older one.
    pub fn on_event(&self, event: &str) -> Option<LightState> {
        log::debug!("Received printer event: {}", event);
        let settings = self.settings();
        let record = settings.rules.get(event)?;
        log::info!("Received configured status event: {}", event);

        let lamp = match settings.lamp() {
            Ok(lamp) => lamp,
            Err(e) => {
                log::warn!("Cannot apply rule for {}: {}", event, e);
                return None;
            }
        };
        let state = state_for_rule(record, settings.default_bri);
        let delay = Duration::from_secs(record.effective_delay());

        let bridge = Arc::clone(&self.bridge);
        let scheduled = state.clone();
        let handle = tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if let Err(e) = bridge.set_state(&lamp, &scheduled).await {
                log::warn!("Failed to set lamp state: {}", e);
            }
        });

        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.retain(|h| !h.is_finished());
        pending.push(handle);
        Some(state)
    }

    /// Wait for every scheduled action to run
    #[cfg(test)]
    pub async fn settle(&self) {
        let handles = std::mem::take(&mut *self.pending.lock().unwrap_or_else(|e| e.into_inner()));
        for handle in handles {
            let _ = handle.await;
        }
    }

    pub fn cancel_pending(&self) {
        for handle in self.pending.lock().unwrap_or_else(|e| e.into_inner()).drain(..) {
            handle.abort();
        }
    }

    pub async fn apply(&self, state: &LightState) -> HueResult<()> {
        let lamp = self.settings().lamp()?;
        log::debug!("Setting lamp {} (group: {}) to {:?}", lamp.lamp_id, lamp.is_group, state);
        self.bridge.set_state(&lamp, state).await
    }

    /// Switch the lamp off when on, otherwise on at the default brightness. Returns the new on-state.
    pub async fn toggle(&self) -> HueResult<bool> {
        let settings = self.settings();
        let lamp = settings.lamp()?;
        let is_on = self.bridge.is_on(&lamp).await?;
        let state = if is_on {
            LightState::off()
        } else {
            LightState::on(None, settings.default_bri)
        };
        self.bridge.set_state(&lamp, &state).await?;
        Ok(state.on)
    }

    pub async fn is_on(&self) -> HueResult<bool> {
        let lamp = self.settings().lamp()?;
        self.bridge.is_on(&lamp).await
    }

    /// Fire the configured startup rule
    pub fn on_startup(&self, enabled: bool, event: &str) -> Option<LightState> {
        if !enabled || event.is_empty() {
            return None;
        }
        self.on_event(event)
    }

    /// Drop all pending actions and switch off if configured to
    pub async fn on_shutdown(&self, switch_off: bool) -> HueResult<()> {
        self.cancel_pending();
        if switch_off {
            self.apply(&LightState::off()).await?;
        }
        Ok(())
    }
}
