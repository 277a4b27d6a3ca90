// Pairing Module - Bridge registration as a tick-driven state machine
//
// The machine itself is synchronous and side-effect free: the driver feeds it
// timer ticks and request results, and forwards its transitions to observers.
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::bridge::{BridgeTarget, HueBridge, PairResponse};
use crate::error::{HueError, HueResult};

pub const MAX_PAIR_ATTEMPTS: u32 = 30;
pub const PAIR_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PairingState {
    NotPaired,
    Pairing { attempt: u32, max_attempts: u32 },
    Paired { username: String },
    PairFailed { attempts: u32 },
}

impl PairingState {
    pub fn is_active(&self) -> bool {
        matches!(self, PairingState::Pairing { .. })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PairingState::Paired { .. } | PairingState::PairFailed { .. })
    }

    pub fn status_text(&self) -> String {
        match self {
            PairingState::NotPaired => "Not paired".to_string(),
            PairingState::Pairing { attempt: 0, .. } => "Press the link button on the bridge".to_string(),
            PairingState::Pairing { attempt, max_attempts } => {
                format!("Waiting for link button ({}/{})", attempt, max_attempts)
            }
            PairingState::Paired { .. } => "Bridge paired".to_string(),
            PairingState::PairFailed { attempts } => {
                format!("Pairing failed after {} attempts, press the link button and try again", attempts)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub from: PairingState,
    pub to: PairingState,
}

/// What the driver should do after a tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickAction {
    /// Issue registration request number `attempt` against `address`
    Request { attempt: u32, address: String, transition: Transition },
    /// Issue the last registration request and stop; its answer is not awaited
    FinalRequest { attempt: u32, address: String, transition: Transition },
    /// Not pairing; loop must stop
    Stop,
}

/// Receives every pairing state change
pub trait PairingObserver: Send + Sync {
    fn on_transition(&self, transition: &Transition);
}

#[derive(Debug, Clone)]
pub struct PairingMachine {
    state: PairingState,
    max_attempts: u32,
    target: Option<BridgeTarget>,
}

impl Default for PairingMachine {
    fn default() -> Self {
        PairingMachine::new(MAX_PAIR_ATTEMPTS)
    }
}

impl PairingMachine {
    pub fn new(max_attempts: u32) -> Self {
        PairingMachine {
            state: PairingState::NotPaired,
            max_attempts: max_attempts.max(1),
            target: None,
        }
    }

    pub fn state(&self) -> &PairingState {
        &self.state
    }

    fn move_to(&mut self, to: PairingState) -> Transition {
        let from = std::mem::replace(&mut self.state, to.clone());
        Transition { from, to }
    }

    /// Begin a pairing loop against `target`. Only one loop may be active.
    pub fn start(&mut self, target: Option<BridgeTarget>) -> HueResult<Transition> {
        if self.state.is_active() {
            return Err(HueError::AlreadyPairing);
        }
        let target = target.ok_or(HueError::NoBridgeTarget)?;
        self.target = Some(target);
        Ok(self.move_to(PairingState::Pairing { attempt: 0, max_attempts: self.max_attempts }))
    }

    pub fn on_tick(&mut self) -> TickAction {
        let attempt = match self.state {
            PairingState::Pairing { attempt, .. } => attempt,
            _ => return TickAction::Stop,
        };

        let address = match &self.target {
            Some(target) => target.host(),
            None => return TickAction::Stop,
        };
        let attempt = attempt + 1;
        if attempt >= self.max_attempts {
            let transition = self.move_to(PairingState::PairFailed { attempts: attempt });
            return TickAction::FinalRequest { attempt, address, transition };
        }
        let transition = self.move_to(PairingState::Pairing { attempt, max_attempts: self.max_attempts });
        TickAction::Request { attempt, address, transition }
    }

    /// Feed back a request result. Only a success changes state; errors are swallowed.
    pub fn on_response(&mut self, result: HueResult<PairResponse>) -> Option<Transition> {
        if !self.state.is_active() {
            return None;
        }
        match result {
            Ok(response) if response.is_success() => {
                let username = response.username.unwrap_or_default();
                Some(self.move_to(PairingState::Paired { username }))
            }
            Ok(response) => {
                log::debug!("Pairing not accepted yet: {:?}", response.status);
                None
            }
            Err(e) => {
                log::debug!("Pairing request failed: {}", e);
                None
            }
        }
    }
}

/// Owns the machine and runs at most one timer loop over it
pub struct Pairer {
    bridge: Arc<dyn HueBridge>,
    machine: Arc<Mutex<PairingMachine>>,
    observer: Arc<dyn PairingObserver>,
    period: Duration,
}

impl Pairer {
    pub fn new(
        bridge: Arc<dyn HueBridge>,
        observer: Arc<dyn PairingObserver>,
        max_attempts: u32,
        period: Duration,
    ) -> Self {
        Pairer {
            bridge,
            machine: Arc::new(Mutex::new(PairingMachine::new(max_attempts))),
            observer,
            period,
        }
    }

    pub fn state(&self) -> PairingState {
        lock(&self.machine).state().clone()
    }

    /// Start pairing against `target`, returning the loop's task
    pub fn start(&self, target: Option<BridgeTarget>) -> HueResult<JoinHandle<PairingState>> {
        let transition = lock(&self.machine).start(target)?;
        self.observer.on_transition(&transition);

        let bridge = Arc::clone(&self.bridge);
        let machine = Arc::clone(&self.machine);
        let observer = Arc::clone(&self.observer);
        let period = self.period;
        Ok(tokio::spawn(run_loop(bridge, machine, observer, period)))
    }
}

fn lock(machine: &Mutex<PairingMachine>) -> std::sync::MutexGuard<'_, PairingMachine> {
    machine.lock().unwrap_or_else(|e| e.into_inner())
}

async fn run_loop(
    bridge: Arc<dyn HueBridge>,
    machine: Arc<Mutex<PairingMachine>>,
    observer: Arc<dyn PairingObserver>,
    period: Duration,
) -> PairingState {
    let mut ticker = tokio::time::interval(period);
    let (result_tx, mut result_rx) = mpsc::unbounded_channel::<HueResult<PairResponse>>();

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let action = lock(&machine).on_tick();
                match action {
                    TickAction::Request { attempt, address, transition } => {
                        observer.on_transition(&transition);
                        log::debug!("Pairing attempt {} against {}", attempt, address);
                        // Requests overlap freely, a slow bridge does not hold back the next tick
                        let bridge = Arc::clone(&bridge);
                        let result_tx = result_tx.clone();
                        tokio::spawn(async move {
                            let result = bridge.pair(&address).await;
                            let _ = result_tx.send(result);
                        });
                    }
                    TickAction::FinalRequest { attempt, address, transition } => {
                        log::debug!("Pairing attempt {} against {}", attempt, address);
                        let bridge = Arc::clone(&bridge);
                        tokio::spawn(async move {
                            let _ = bridge.pair(&address).await;
                        });
                        log::warn!("Pairing gave up: {}", transition.to.status_text());
                        observer.on_transition(&transition);
                        break;
                    }
                    TickAction::Stop => break,
                }
            }
            Some(result) = result_rx.recv() => {
                let transition = lock(&machine).on_response(result);
                if let Some(transition) = transition {
                    log::info!("Bridge paired");
                    observer.on_transition(&transition);
                    break;
                }
            }
        }
    }

    let state = lock(&machine).state().clone();
    state
}
