// Config Module - Configuration management and command-line argument parsing
use anyhow::{Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::OnceLock;

use crate::bridge::{BridgeTarget, DEFAULT_DISCOVERY_URL};
use crate::lights::LightSettings;
use crate::pairing::{MAX_PAIR_ATTEMPTS, PAIR_INTERVAL};
use crate::status::{StatusMap, StatusRecord, DEFAULT_BRIGHTNESS};

// Global storage for custom config path
static CUSTOM_CONFIG_PATH: OnceLock<Option<String>> = OnceLock::new();

/// Bumped whenever stored settings need migrating
pub const SETTINGS_VERSION: u32 = 1;

#[derive(Parser, Debug, Default)]
#[command(
    author,
    version,
    about = "Drive a Philips Hue lamp from 3D printer events",
    long_about = "Maps printer lifecycle events (PrintStarted, PrintDone, ...) to Hue light scenes.\n\
                  Serves a JSON API for editing the event rules, discovering and pairing with a bridge,\n\
                  and receiving printer events."
)]
pub struct Args {
    /// Hue bridge address
    #[arg(short, long)]
    pub bridge: Option<String>,

    /// Light (or group) id to drive
    #[arg(short, long)]
    pub lamp: Option<String>,

    /// Treat the lamp id as a group id
    #[arg(short, long)]
    pub group: Option<bool>,

    /// Default brightness (0-255) for rules without one
    #[arg(short = 'B', long)]
    pub brightness: Option<u8>,

    /// HTTP API listen address
    #[arg(long)]
    pub httpd_ip: Option<String>,

    /// HTTP API listen port
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Debug logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Config file path or name (e.g., --cfg /full/path or --cfg myconf for ~/.config/printhue/myconf.conf)
    #[arg(long)]
    pub cfg: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HueConfig {
    #[serde(skip)]
    pub config_path: Option<PathBuf>,  // Stores the config file path (not serialized)

    pub bridge_addr: String,
    pub husername: String,  // Username handed out by the bridge when pairing
    pub lamp_id: String,
    pub lamp_is_group: bool,
    pub default_bri: u8,
    pub on_on_startup: bool,
    pub on_on_startup_event: String,
    pub off_on_shutdown: bool,
    pub show_hue_toggle: bool,
    pub discovery_url: String,
    pub device_type: String,  // Name this service registers under on the bridge
    pub pair_attempts: u32,
    pub pair_interval_ms: u64,
    pub httpd_ip: String,
    pub httpd_port: u16,
    pub httpd_auth_enabled: bool,
    pub httpd_auth_user: String,
    pub httpd_auth_pass: String,
    pub settings_version: u32,  // 0 = never migrated
    #[serde(rename = "statusDict")]
    pub status_dict: StatusMap,
}

impl Default for HueConfig {
    fn default() -> Self {
        HueConfig {
            config_path: None,
            bridge_addr: "".to_string(),
            husername: "".to_string(),
            lamp_id: "".to_string(),
            lamp_is_group: false,
            default_bri: DEFAULT_BRIGHTNESS,
            on_on_startup: false,
            on_on_startup_event: "".to_string(),
            off_on_shutdown: true,
            show_hue_toggle: true,
            discovery_url: DEFAULT_DISCOVERY_URL.to_string(),
            device_type: "printhue#printer".to_string(),
            pair_attempts: MAX_PAIR_ATTEMPTS,
            pair_interval_ms: PAIR_INTERVAL.as_millis() as u64,
            httpd_ip: "localhost".to_string(),
            httpd_port: 8080,
            httpd_auth_enabled: false,
            httpd_auth_user: "".to_string(),
            httpd_auth_pass: "".to_string(),
            settings_version: 0,
            status_dict: StatusMap::new(),
        }
    }
}

/// Rules written on first run so the panel has something to start from
pub fn example_rules() -> StatusMap {
    let rule = |colour: &str, turnoff: bool| StatusRecord {
        colour: colour.to_string(),
        brightness: if turnoff { None } else { Some(DEFAULT_BRIGHTNESS) },
        delay: Some(0),
        turnoff: Some(turnoff),
    };
    [
        ("Connected", rule("#FFFFFF", false)),
        ("Disconnected", rule("", true)),
        ("PrintStarted", rule("#FFFFFF", false)),
        ("PrintResumed", rule("#FFFFFF", false)),
        ("PrintDone", rule("#33FF36", false)),
        ("PrintFailed", rule("#FF0000", false)),
    ]
    .into_iter()
    .map(|(event, record)| (event.to_string(), record))
    .collect()
}

impl HueConfig {
    pub fn merge_with_args(&mut self, args: &Args) -> bool {
        // Track if any args were actually provided
        let mut args_provided = false;

        if let Some(ref bridge) = args.bridge {
            self.bridge_addr = bridge.clone();
            args_provided = true;
        }

        if let Some(ref lamp) = args.lamp {
            self.lamp_id = lamp.clone();
            args_provided = true;
        }

        if let Some(group) = args.group {
            self.lamp_is_group = group;
            args_provided = true;
        }

        if let Some(brightness) = args.brightness {
            self.default_bri = brightness;
            args_provided = true;
        }

        if let Some(ref ip) = args.httpd_ip {
            self.httpd_ip = ip.clone();
            args_provided = true;
        }

        if let Some(port) = args.port {
            self.httpd_port = port;
            args_provided = true;
        }

        args_provided
    }

    /// Seed example rules on first run and stamp the settings version
    pub fn migrate(&mut self) -> bool {
        if self.settings_version >= SETTINGS_VERSION {
            return false;
        }
        if self.settings_version == 0 && self.status_dict.is_empty() {
            log::info!("Migrating settings: writing example rules");
            self.status_dict = example_rules();
        } else {
            log::info!("Migrating settings from version {}", self.settings_version);
        }
        self.settings_version = SETTINGS_VERSION;
        true
    }

    /// Set the global config path (called once at startup)
    pub fn set_config_path(cfg: Option<String>) {
        let _ = CUSTOM_CONFIG_PATH.set(cfg);
    }

    /// Get the global config path (if set)
    fn get_config_path_arg() -> Option<&'static str> {
        CUSTOM_CONFIG_PATH.get()
            .and_then(|opt| opt.as_deref())
    }

    pub fn config_path(cfg_arg: Option<&str>) -> Result<PathBuf> {
        // Priority: explicit arg > global > None
        let cfg = cfg_arg.or_else(|| Self::get_config_path_arg());

        if let Some(cfg) = cfg {
            let path = PathBuf::from(cfg);
            if path.is_absolute() || cfg.contains('/') || cfg.contains('\\') {
                return Ok(path);
            }

            // Otherwise treat as config name in config directory
            let filename = if cfg.ends_with(".conf") {
                cfg.to_string()
            } else {
                format!("{}.conf", cfg)
            };
            Ok(Self::config_dir()?.join(filename))
        } else {
            Ok(Self::config_dir()?.join("config.conf"))
        }
    }

    fn config_dir() -> Result<PathBuf> {
        let home = std::env::var("HOME").context("HOME is not set")?;
        let config_dir = PathBuf::from(home).join(".config").join("printhue");
        std::fs::create_dir_all(&config_dir)?;
        Ok(config_dir)
    }

    pub fn load_with_path(cfg_arg: Option<&str>) -> Result<Self> {
        let path = Self::config_path(cfg_arg)?;
        let contents = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let mut parsed: Self = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        parsed.config_path = Some(path);
        parsed.sanitize();

        if parsed.migrate() {
            if let Err(e) = parsed.save() {
                log::warn!("Could not save migrated settings: {}", e);
            }
        }

        Ok(parsed)
    }

    pub fn load() -> Result<Self> {
        Self::load_with_path(None)
    }

    /// Sanitize config values to handle common formatting issues
    pub fn sanitize(&mut self) {
        self.bridge_addr = self.bridge_addr.trim().to_string();
        self.husername = self.husername.trim().to_string();
        self.lamp_id = self.lamp_id.trim().to_string();
        self.on_on_startup_event = self.on_on_startup_event.trim().to_string();
        self.discovery_url = self.discovery_url.trim().to_string();
        self.device_type = self.device_type.trim().to_string();
        self.httpd_ip = self.httpd_ip.trim().to_string();
        self.httpd_auth_user = self.httpd_auth_user.trim().to_string();

        if self.discovery_url.is_empty() {
            self.discovery_url = DEFAULT_DISCOVERY_URL.to_string();
        }

        // Clamp numeric values to reasonable ranges
        self.pair_attempts = self.pair_attempts.max(1).min(300);
        self.pair_interval_ms = self.pair_interval_ms.max(100).min(60_000);
        self.httpd_port = self.httpd_port.max(1);

        let rules: Vec<(String, StatusRecord)> = self
            .status_dict
            .iter()
            .map(|(event, record)| {
                let mut record = record.clone();
                record.colour = record.colour.trim().to_string();
                (event.to_string(), record)
            })
            .collect();
        self.status_dict = rules.into_iter().collect();
    }

    pub fn bridge_target(&self) -> Option<BridgeTarget> {
        if self.bridge_addr.is_empty() {
            None
        } else {
            Some(BridgeTarget::new(self.bridge_addr.clone()))
        }
    }

    pub fn pair_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.pair_interval_ms)
    }

    pub fn light_settings(&self) -> LightSettings {
        LightSettings {
            bridge_addr: self.bridge_addr.clone(),
            username: self.husername.clone(),
            lamp_id: self.lamp_id.clone(),
            lamp_is_group: self.lamp_is_group,
            default_bri: self.default_bri,
            rules: self.status_dict.clone(),
        }
    }

    pub fn save(&self) -> Result<()> {
        let path = match self.config_path.clone() {
            Some(path) => path,
            None => Self::config_path(None)?,
        };

        // Sanitize values before saving
        let mut sanitized = self.clone();
        sanitized.sanitize();

        // Build TOML with comments manually for better documentation
        let mut contents = format!(
            r#"# printhue Configuration File
# Edit this file while the program is running, rules reload automatically

# Hue bridge address (filled in by discovery)
bridge_addr = {}

# Username issued by the bridge when pairing (leave empty and pair from the API)
husername = {}

# Light or group id to drive, and whether it is a group
lamp_id = {}
lamp_is_group = {}

# Brightness (0-255) used by rules that do not set one
default_bri = {}

# Fire a rule when the service starts
on_on_startup = {}
on_on_startup_event = {}

# Switch the lamp off when the service shuts down
off_on_shutdown = {}

# Show the on/off toggle in the panel navbar
show_hue_toggle = {}

# Bridge locator service and the name registered on the bridge
discovery_url = {}
device_type = {}

# Pairing retry loop: number of attempts and the interval between them
pair_attempts = {}
pair_interval_ms = {}

# HTTP API
httpd_ip = {}
httpd_port = {}
httpd_auth_enabled = {}
httpd_auth_user = {}
httpd_auth_pass = {}

# Settings schema version (do not edit)
settings_version = {}
"#,
            toml_string(&sanitized.bridge_addr),
            toml_string(&sanitized.husername),
            toml_string(&sanitized.lamp_id),
            sanitized.lamp_is_group,
            sanitized.default_bri,
            sanitized.on_on_startup,
            toml_string(&sanitized.on_on_startup_event),
            sanitized.off_on_shutdown,
            sanitized.show_hue_toggle,
            toml_string(&sanitized.discovery_url),
            toml_string(&sanitized.device_type),
            sanitized.pair_attempts,
            sanitized.pair_interval_ms,
            toml_string(&sanitized.httpd_ip),
            sanitized.httpd_port,
            sanitized.httpd_auth_enabled,
            toml_string(&sanitized.httpd_auth_user),
            toml_string(&sanitized.httpd_auth_pass),
            sanitized.settings_version,
        );

        // Append one table per event rule, in rule order
        if !sanitized.status_dict.is_empty() {
            contents.push_str("\n# Event rules: colour (hex or CSS name), brightness (0-255),\n");
            contents.push_str("# delay (seconds), turnoff (switch the lamp off instead)\n\n");

            for (event, record) in sanitized.status_dict.iter() {
                contents.push_str(&format!("[statusDict.{}]\n", toml_key(event)));
                contents.push_str(&format!("colour = {}\n", toml_string(&record.colour)));
                if let Some(brightness) = record.brightness {
                    contents.push_str(&format!("brightness = {}\n", brightness));
                }
                if let Some(delay) = record.delay {
                    contents.push_str(&format!("delay = {}\n", delay));
                }
                if let Some(turnoff) = record.turnoff {
                    contents.push_str(&format!("turnoff = {}\n", turnoff));
                }
                contents.push('\n');
            }
        }

        std::fs::write(&path, contents)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }
}

fn toml_string(value: &str) -> String {
    toml::Value::String(value.to_string()).to_string()
}

fn toml_key(key: &str) -> String {
    let bare = !key.is_empty()
        && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if bare {
        key.to_string()
    } else {
        toml_string(key)
    }
}
