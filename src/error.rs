// Error Module - Typed errors for bridge, pairing and light control
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HueError {
    #[error("bridge request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Error object returned inside a 200 response by the Hue REST API
    #[error("bridge error {kind}: {description}")]
    Bridge { kind: u32, description: String },

    #[error("unexpected bridge response: {0}")]
    UnexpectedResponse(String),

    #[error("invalid colour '{0}'")]
    InvalidColour(String),

    #[error("no bridge address captured, run discovery or set one first")]
    NoBridgeTarget,

    #[error("a pairing loop is already running")]
    AlreadyPairing,

    #[error("bridge is not paired, no username configured")]
    NotPaired,

    #[error("no lamp configured")]
    NoLamp,
}

impl HueError {
    /// Hue error type 101: the link button on the bridge has not been pressed yet
    pub fn is_link_button_pending(&self) -> bool {
        matches!(self, HueError::Bridge { kind: 101, .. })
    }
}

pub type HueResult<T> = std::result::Result<T, HueError>;
