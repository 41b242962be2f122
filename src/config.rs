//! TOML configuration loading
//!
//! The document keeps the console operator's 1-based numbering; everything is
//! normalized to 0-based values while loading, and every index is validated
//! so a bad file dies at startup with a readable message instead of
//! misaddressing channels later.
//!
//! ```toml
//! [dlive]
//! ip = "192.168.1.70"
//! midi_bank_offset = 12
//!
//! [streamdeck]
//! devices = ["AL12H1A00637"]
//!
//! [control.tracking]
//! number_of_inputs = 32
//! # …
//!
//! [control.scenes]
//! mixing_start = 101
//! # …
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::entity::Scene;
use crate::{Result, SurfaceError};

#[derive(Debug, Deserialize)]
struct RawConfig {
    dlive: RawDlive,
    #[serde(default)]
    streamdeck: RawStreamdeck,
    control: RawControl,
    #[serde(default)]
    timing: RawTiming,
}

#[derive(Debug, Deserialize)]
struct RawDlive {
    ip: String,
    /// 1-based in the document
    midi_bank_offset: u8,
    #[serde(default)]
    user_profile: Option<String>,
    #[serde(default)]
    user_password: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawStreamdeck {
    #[serde(default)]
    devices: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawControl {
    tracking: RawTracking,
    scenes: RawScenes,
}

#[derive(Debug, Deserialize)]
struct RawTracking {
    number_of_inputs: u8,
    number_of_mono_aux: u8,
    mono_aux_start: u8,
    number_of_stereo_aux: u8,
    number_of_mono_fx: u8,
    number_of_stereo_fx: u8,
    external_fx_start: u8,
    number_of_external_fx: u8,
    #[serde(default)]
    number_of_fx_returns: u8,
    virtual_start: u8,
    feedback_matrix: u8,
    talk_to_stage: u8,
    talk_to_monitor: u8,
}

#[derive(Debug, Deserialize)]
struct RawScenes {
    mixing_start: u16,
    virtual_left_start: u16,
    virtual_right: u16,
    sends: u16,
    custom_aux: u16,
    custom_fx: u16,
    custom_util: u16,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct RawTiming {
    outbound_capacity_limit: Option<u32>,
    channel_grace_ms: u64,
    color_poll_secs: u64,
    purge_interval_secs: u64,
    purge_max_age_secs: u64,
    hydration_delay_secs: u64,
    hydration_grace_ms: u64,
}

impl Default for RawTiming {
    fn default() -> Self {
        Self {
            outbound_capacity_limit: None,
            channel_grace_ms: 10,
            color_poll_secs: 6,
            purge_interval_secs: 3,
            purge_max_age_secs: 1,
            hydration_delay_secs: 4,
            hydration_grace_ms: 50,
        }
    }
}

/// Credentials for the authenticated console port.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// Console user profile name
    pub user_profile: String,
    /// Password for that profile
    pub user_password: String,
}

/// Connection parameters for the mixrack.
#[derive(Debug, Clone)]
pub struct MixrackConfig {
    /// Console IP address or host name
    pub ip: String,
    /// Zero-based MIDI bank offset
    pub bank_offset: u8,
    /// Credentials; their presence selects the authenticated TCP port
    pub auth: Option<AuthConfig>,
}

/// Channel topology, all zero-based.
#[derive(Debug, Clone)]
pub struct TrackingConfig {
    /// Number of input channels
    pub inputs: u8,
    /// Number of FX return channels
    pub fx_returns: u8,
    /// Number of mono aux buses
    pub mono_aux: u8,
    /// First mono aux index used for mixing buses
    pub mono_aux_start: u8,
    /// Number of stereo aux buses
    pub stereo_aux: u8,
    /// Number of mono FX sends
    pub mono_fx: u8,
    /// Number of stereo FX sends
    pub stereo_fx: u8,
    /// First mono aux index hosting the external FX block
    pub external_fx_start: u8,
    /// Number of external FX buses
    pub external_fx: u8,
    /// First input index of the 16 virtual strips
    pub virtual_start: u8,
    /// Mono matrix index used as the virtual feedback bus
    pub feedback_matrix: u8,
    /// Input wired to the stage talkback microphone
    pub talk_to_stage: u8,
    /// Input wired to the monitor talkback microphone
    pub talk_to_monitor: u8,
}

/// The fixed scene map driving the layer controller.
#[derive(Debug, Clone, Copy)]
pub struct SceneConfig {
    /// First of six consecutive mixing scenes (banks 0..5)
    pub mixing_start: Scene,
    /// First of six consecutive left-side output scenes (banks 0..5)
    pub virtual_left_start: Scene,
    /// Right-side pairing scene
    pub virtual_right: Scene,
    /// Sends-on-fader scene
    pub sends: Scene,
    /// Custom aux layer scene
    pub custom_aux: Scene,
    /// Custom FX layer scene
    pub custom_fx: Scene,
    /// Custom utility layer scene
    pub custom_util: Scene,
}

/// Timing knobs, with defaults suitable for a real console.
#[derive(Debug, Clone, Copy)]
pub struct TimingConfig {
    /// Outbound writes admitted per second; `None` disables rate limiting
    pub rate_limit: Option<u32>,
    /// Pause between per-channel requests during sync
    pub channel_grace: Duration,
    /// Period of the colour re-poll job
    pub color_poll: Duration,
    /// Period of the stale-request sweeper
    pub purge_interval: Duration,
    /// Age after which an unresolved request is purged
    pub purge_max_age: Duration,
    /// Delay before send-map hydration starts
    pub hydration_delay: Duration,
    /// Pause between hydrating consecutive channels
    pub hydration_grace: Duration,
}

/// Fully validated, zero-based configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Connection parameters
    pub mixrack: MixrackConfig,
    /// Hardware surface serials (opaque to the core)
    pub devices: Vec<String>,
    /// Channel topology
    pub tracking: TrackingConfig,
    /// Scene map
    pub scenes: SceneConfig,
    /// Timing knobs
    pub timing: TimingConfig,
}

fn zero_based(name: &str, value: u8) -> Result<u8> {
    value.checked_sub(1).ok_or_else(|| {
        SurfaceError::Config(format!("{name} is 1-based and must be at least 1"))
    })
}

fn scene(name: &str, value: u16, span: u16) -> Result<Scene> {
    let zero_based = value
        .checked_sub(1)
        .ok_or_else(|| SurfaceError::Config(format!("{name} is 1-based and must be at least 1")))?;

    // the span keeps consecutive-scene windows inside the console's range
    Scene::checked(zero_based + span - 1)
        .map_err(|_| SurfaceError::Config(format!("{name} = {value} leaves the scene range")))?;

    Scene::checked(zero_based)
        .map_err(|_| SurfaceError::Config(format!("{name} = {value} is outside [1..500]")))
}

impl Config {
    /// Load and validate a configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(&path).map_err(|error| {
            SurfaceError::Config(format!(
                "cannot read {}: {error}",
                path.as_ref().display()
            ))
        })?;

        Self::from_toml(&text)
    }

    /// Parse and validate a configuration document.
    pub fn from_toml(text: &str) -> Result<Self> {
        let raw: RawConfig = toml::from_str(text)
            .map_err(|error| SurfaceError::Config(format!("invalid config: {error}")))?;

        raw.normalize()
    }
}

impl RawConfig {
    fn normalize(self) -> Result<Config> {
        let auth = match (self.dlive.user_profile, self.dlive.user_password) {
            (Some(user_profile), Some(user_password)) => Some(AuthConfig {
                user_profile,
                user_password,
            }),
            (None, None) => None,
            _ => {
                return Err(SurfaceError::Config(
                    "user_profile and user_password must be configured together".into(),
                ))
            }
        };

        let mixrack = MixrackConfig {
            ip: self.dlive.ip,
            bank_offset: zero_based("dlive.midi_bank_offset", self.dlive.midi_bank_offset)?,
            auth,
        };

        let t = self.control.tracking;
        let tracking = TrackingConfig {
            inputs: t.number_of_inputs,
            fx_returns: t.number_of_fx_returns,
            mono_aux: t.number_of_mono_aux,
            mono_aux_start: zero_based("control.tracking.mono_aux_start", t.mono_aux_start)?,
            stereo_aux: t.number_of_stereo_aux,
            mono_fx: t.number_of_mono_fx,
            stereo_fx: t.number_of_stereo_fx,
            external_fx_start: zero_based("control.tracking.external_fx_start", t.external_fx_start)?,
            external_fx: t.number_of_external_fx,
            virtual_start: zero_based("control.tracking.virtual_start", t.virtual_start)?,
            feedback_matrix: zero_based("control.tracking.feedback_matrix", t.feedback_matrix)?,
            talk_to_stage: zero_based("control.tracking.talk_to_stage", t.talk_to_stage)?,
            talk_to_monitor: zero_based("control.tracking.talk_to_monitor", t.talk_to_monitor)?,
        };

        if tracking.inputs == 0 {
            return Err(SurfaceError::Config(
                "control.tracking.number_of_inputs must be at least 1".into(),
            ));
        }

        if tracking.talk_to_stage >= tracking.inputs || tracking.talk_to_monitor >= tracking.inputs
        {
            return Err(SurfaceError::Config(
                "talk_to_stage/talk_to_monitor must address configured inputs".into(),
            ));
        }

        if tracking.virtual_start.checked_add(16).is_none() {
            return Err(SurfaceError::Config(
                "control.tracking.virtual_start leaves no room for 16 virtual strips".into(),
            ));
        }

        let s = self.control.scenes;
        let scenes = SceneConfig {
            mixing_start: scene("control.scenes.mixing_start", s.mixing_start, 6)?,
            virtual_left_start: scene("control.scenes.virtual_left_start", s.virtual_left_start, 6)?,
            virtual_right: scene("control.scenes.virtual_right", s.virtual_right, 1)?,
            sends: scene("control.scenes.sends", s.sends, 1)?,
            custom_aux: scene("control.scenes.custom_aux", s.custom_aux, 1)?,
            custom_fx: scene("control.scenes.custom_fx", s.custom_fx, 1)?,
            custom_util: scene("control.scenes.custom_util", s.custom_util, 1)?,
        };

        let timing = TimingConfig {
            rate_limit: self.timing.outbound_capacity_limit,
            channel_grace: Duration::from_millis(self.timing.channel_grace_ms),
            color_poll: Duration::from_secs(self.timing.color_poll_secs),
            purge_interval: Duration::from_secs(self.timing.purge_interval_secs),
            purge_max_age: Duration::from_secs(self.timing.purge_max_age_secs),
            hydration_delay: Duration::from_secs(self.timing.hydration_delay_secs),
            hydration_grace: Duration::from_millis(self.timing.hydration_grace_ms),
        };

        Ok(Config {
            mixrack,
            devices: self.streamdeck.devices,
            tracking,
            scenes,
            timing,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    pub(crate) const EXAMPLE: &str = r#"
        [dlive]
        ip = "192.168.1.70"
        midi_bank_offset = 1

        [streamdeck]
        devices = ["AL12H1A00637", "CL49K1A00001"]

        [control.tracking]
        number_of_inputs = 32
        number_of_mono_aux = 6
        mono_aux_start = 1
        number_of_stereo_aux = 2
        number_of_mono_fx = 4
        number_of_stereo_fx = 2
        external_fx_start = 9
        number_of_external_fx = 2
        number_of_fx_returns = 4
        virtual_start = 97
        feedback_matrix = 11
        talk_to_stage = 31
        talk_to_monitor = 32

        [control.scenes]
        mixing_start = 101
        virtual_left_start = 490
        virtual_right = 496
        sends = 201
        custom_aux = 301
        custom_fx = 302
        custom_util = 303
    "#;

    #[test]
    fn loads_and_normalizes_the_example() {
        let config = Config::from_toml(EXAMPLE).unwrap();

        assert_eq!(config.mixrack.bank_offset, 0);
        assert!(config.mixrack.auth.is_none());
        assert_eq!(config.devices.len(), 2);

        assert_eq!(config.tracking.inputs, 32);
        assert_eq!(config.tracking.mono_aux_start, 0);
        assert_eq!(config.tracking.virtual_start, 96);
        assert_eq!(config.tracking.talk_to_monitor, 31);

        assert_eq!(config.scenes.mixing_start.value(), 100);
        assert_eq!(config.scenes.virtual_left_start.value(), 489);
        assert_eq!(config.scenes.virtual_right.value(), 495);
    }

    #[test]
    fn timing_defaults_apply() {
        let config = Config::from_toml(EXAMPLE).unwrap();
        assert_eq!(config.timing.rate_limit, None);
        assert_eq!(config.timing.channel_grace, Duration::from_millis(10));
        assert_eq!(config.timing.color_poll, Duration::from_secs(6));
    }

    #[test]
    fn rejects_zero_based_document_values() {
        let broken = EXAMPLE.replace("mono_aux_start = 1", "mono_aux_start = 0");
        let error = Config::from_toml(&broken).unwrap_err();
        assert!(error.to_string().contains("mono_aux_start"));
    }

    #[test]
    fn rejects_scene_window_overflow() {
        let broken = EXAMPLE.replace("mixing_start = 101", "mixing_start = 498");
        let error = Config::from_toml(&broken).unwrap_err();
        assert!(error.to_string().contains("mixing_start"));
    }

    #[test]
    fn rejects_half_configured_credentials() {
        let broken = EXAMPLE.replace(
            "ip = \"192.168.1.70\"",
            "ip = \"192.168.1.70\"\nuser_profile = \"Surface\"",
        );
        let error = Config::from_toml(&broken).unwrap_err();
        assert!(error.to_string().contains("user_password"));
    }

    #[test]
    fn talkback_indices_must_address_inputs() {
        let broken = EXAMPLE.replace("talk_to_stage = 31", "talk_to_stage = 33");
        assert!(Config::from_toml(&broken).is_err());
    }

    #[test]
    fn loads_from_a_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(EXAMPLE.as_bytes()).unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.mixrack.ip, "192.168.1.70");
    }

    #[test]
    fn missing_file_is_a_config_error() {
        let error = Config::from_file("/nonexistent/mixsurface.toml").unwrap_err();
        assert!(matches!(error, SurfaceError::Config(_)));
    }
}
