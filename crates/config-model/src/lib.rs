use std::path::{Path, PathBuf};

use anyhow::{Result, ensure};
use serde::Deserialize;

pub use model::ModelConfig;
pub use remote::{HttpConfig, MqttConfig};
pub use viewer::{BlendType, ViewerConfig};

/// Accepted `time_delay` seconds, for the config file and remote setters alike.
pub const TIME_DELAY_RANGE: (f64, f64) = (1.0, 3600.0);
/// Accepted `fade_time` seconds.
pub const FADE_TIME_RANGE: (f64, f64) = (0.0, 50.0);
/// Longest pause between library scans.
const MAX_CHECK_DIR_TM: f64 = 86_400.0;
const FPS_RANGE: (f32, f32) = (0.1, 240.0);

fn within<T: PartialOrd + Copy>(value: T, (min, max): (T, T)) -> bool {
    value >= min && value <= max
}

/// Expand a leading `~` to the current user's home directory.
pub fn expand_home(path: &Path) -> PathBuf {
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match dirs::home_dir() {
        Some(home) => home.join(rest),
        None => path.to_path_buf(),
    }
}

mod viewer {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
    #[serde(rename_all = "snake_case")]
    pub enum BlendType {
        #[default]
        Blend,
        Burn,
        Bump,
    }

    /// Presentation settings handed to the render adapter unchanged.
    #[derive(Debug, Clone, Deserialize)]
    #[serde(default, deny_unknown_fields)]
    pub struct ViewerConfig {
        /// Blur radius applied to the auto-mat background.
        pub blur_amount: f32,
        /// Zoom factor for the blurred background copy.
        pub blur_zoom: f32,
        /// Blur only the edges instead of a full background copy.
        pub blur_edges: bool,
        /// Opacity of the edge colour drawn around a fitted image.
        pub edge_alpha: f32,
        /// Render ticks per second.
        pub fps: f32,
        /// Clear colour as RGBA in `0.0..=1.0`.
        pub background: [f32; 4],
        pub blend_type: BlendType,
        pub font_file: PathBuf,
        pub shader: PathBuf,
        /// Seconds the file name overlay stays visible; `0` disables it.
        pub show_names_tm: f32,
        pub fit: bool,
        pub auto_resize: bool,
        pub kenburns: bool,
    }

    impl ViewerConfig {
        const fn default_blur_amount() -> f32 {
            12.0
        }

        const fn default_fps() -> f32 {
            20.0
        }

        pub fn validate(&self) -> Result<()> {
            ensure!(
                within(self.fps, FPS_RANGE),
                "viewer.fps must be between {} and {}",
                FPS_RANGE.0,
                FPS_RANGE.1
            );
            ensure!(
                self.blur_amount.is_finite() && self.blur_amount >= 0.0,
                "viewer.blur_amount must be non-negative"
            );
            ensure!(
                self.blur_zoom.is_finite() && self.blur_zoom >= 1.0,
                "viewer.blur_zoom must be >= 1.0"
            );
            ensure!(
                (0.0..=1.0).contains(&self.edge_alpha),
                "viewer.edge_alpha must be within 0.0..=1.0"
            );
            ensure!(
                self.background.iter().all(|c| (0.0..=1.0).contains(c)),
                "viewer.background components must be within 0.0..=1.0"
            );
            ensure!(
                self.show_names_tm.is_finite() && self.show_names_tm >= 0.0,
                "viewer.show_names_tm must be non-negative"
            );
            Ok(())
        }
    }

    impl Default for ViewerConfig {
        fn default() -> Self {
            Self {
                blur_amount: Self::default_blur_amount(),
                blur_zoom: 1.0,
                blur_edges: false,
                edge_alpha: 0.5,
                fps: Self::default_fps(),
                background: [0.2, 0.2, 0.3, 1.0],
                blend_type: BlendType::default(),
                font_file: PathBuf::from("~/picture-frame/fonts/NotoSans-Regular.ttf"),
                shader: PathBuf::from("~/picture-frame/shaders/blend_new"),
                show_names_tm: 0.0,
                fit: false,
                auto_resize: true,
                kenburns: false,
            }
        }
    }
}

mod model {
    use super::*;

    #[derive(Debug, Clone, Deserialize)]
    #[serde(default, deny_unknown_fields)]
    pub struct ModelConfig {
        /// Root directory scanned for pictures.
        pub pic_dir: PathBuf,
        /// Image shown while nothing matches the active filters.
        pub no_files_img: PathBuf,
        /// Initial subdirectory filter relative to `pic_dir`; empty means all.
        pub subdirectory: String,
        pub follow_links: bool,
        /// Seconds between library scans.
        pub check_dir_tm: f64,
        /// Number of recently shown images held back after a reshuffle.
        pub recent_n: usize,
        /// Full passes before a new shuffle permutation is drawn.
        pub reshuffle_num: u32,
        /// Seconds each image stays on screen.
        pub time_delay: f64,
        /// Seconds of cross-fade at the end of each `time_delay`; capped at
        /// `time_delay` when applied.
        pub fade_time: f64,
        pub shuffle: bool,
        /// Record attributes exposed alongside the current image.
        pub image_attr: Vec<String>,
        pub db_file: PathBuf,
        /// Optional deterministic seed for shuffle permutations.
        pub shuffle_seed: Option<u64>,
    }

    impl ModelConfig {
        const fn default_check_dir_tm() -> f64 {
            60.0
        }

        const fn default_time_delay() -> f64 {
            200.0
        }

        const fn default_fade_time() -> f64 {
            10.0
        }

        pub fn validate(&self) -> Result<()> {
            ensure!(
                !self.pic_dir.as_os_str().is_empty(),
                "model.pic_dir must not be empty"
            );
            ensure!(
                within(self.check_dir_tm, (1.0, MAX_CHECK_DIR_TM)),
                "model.check_dir_tm must be between one second and one day"
            );
            ensure!(
                within(self.time_delay, TIME_DELAY_RANGE),
                "model.time_delay must be between {} and {} seconds",
                TIME_DELAY_RANGE.0,
                TIME_DELAY_RANGE.1
            );
            ensure!(
                within(self.fade_time, FADE_TIME_RANGE),
                "model.fade_time must be between {} and {} seconds",
                FADE_TIME_RANGE.0,
                FADE_TIME_RANGE.1
            );
            ensure!(
                self.reshuffle_num >= 1,
                "model.reshuffle_num must be >= 1"
            );
            ensure!(
                !self.db_file.as_os_str().is_empty(),
                "model.db_file must not be empty"
            );
            Ok(())
        }
    }

    impl Default for ModelConfig {
        fn default() -> Self {
            Self {
                pic_dir: PathBuf::from("~/Pictures"),
                no_files_img: PathBuf::from("~/picture-frame/no_pictures.jpg"),
                subdirectory: String::new(),
                follow_links: false,
                check_dir_tm: Self::default_check_dir_tm(),
                recent_n: 3,
                reshuffle_num: 1,
                time_delay: Self::default_time_delay(),
                fade_time: Self::default_fade_time(),
                shuffle: true,
                image_attr: vec!["gps".to_string()],
                db_file: PathBuf::from("~/picture-frame/pictureframe.db3"),
                shuffle_seed: None,
            }
        }
    }
}

mod remote {
    use super::*;

    #[derive(Debug, Clone, Deserialize)]
    #[serde(default, deny_unknown_fields)]
    pub struct MqttConfig {
        pub use_mqtt: bool,
        pub server: String,
        pub port: u16,
        pub login: String,
        pub password: String,
        /// CA certificate used for TLS; empty selects a plain TCP connection.
        pub tls: PathBuf,
        /// Prefix for every topic and discovery identifier.
        pub device_id: String,
        /// Link advertised to the hub as the device's configuration URL.
        pub device_url: String,
    }

    impl MqttConfig {
        pub fn validate(&self) -> Result<()> {
            if !self.use_mqtt {
                return Ok(());
            }
            ensure!(
                !self.server.trim().is_empty(),
                "mqtt.server is required when use_mqtt is enabled"
            );
            ensure!(self.port > 0, "mqtt.port must be greater than zero");
            ensure!(
                !self.device_id.is_empty()
                    && self
                        .device_id
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-'),
                "mqtt.device_id must be non-empty and contain only [A-Za-z0-9_-]"
            );
            Ok(())
        }
    }

    impl Default for MqttConfig {
        fn default() -> Self {
            Self {
                use_mqtt: false,
                server: String::new(),
                port: 8883,
                login: String::new(),
                password: String::new(),
                tls: PathBuf::new(),
                device_id: "picframe".to_string(),
                device_url: String::new(),
            }
        }
    }

    #[derive(Debug, Clone, Deserialize)]
    #[serde(default, deny_unknown_fields)]
    pub struct HttpConfig {
        pub use_http: bool,
        pub bind: String,
        pub port: u16,
    }

    impl HttpConfig {
        pub fn validate(&self) -> Result<()> {
            if self.use_http {
                ensure!(self.port > 0, "http.port must be greater than zero");
                ensure!(
                    self.bind.parse::<std::net::IpAddr>().is_ok(),
                    "http.bind must be an IP address"
                );
            }
            Ok(())
        }
    }

    impl Default for HttpConfig {
        fn default() -> Self {
            Self {
                use_http: false,
                bind: "0.0.0.0".to_string(),
                port: 9000,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_model_section_uses_defaults() {
        let model: ModelConfig = serde_yaml::from_str("{}").expect("valid yaml");
        assert_eq!(model.recent_n, 3);
        assert_eq!(model.reshuffle_num, 1);
        assert!(model.shuffle);
        assert!((model.time_delay - 200.0).abs() < f64::EPSILON);
        assert_eq!(model.image_attr, vec!["gps".to_string()]);
        model.validate().expect("defaults are valid");
    }

    #[test]
    fn blend_type_parses_snake_case() {
        let viewer: ViewerConfig =
            serde_yaml::from_str("blend_type: burn\nfps: 30").expect("valid yaml");
        assert_eq!(viewer.blend_type, BlendType::Burn);
        assert!((viewer.fps - 30.0).abs() < f32::EPSILON);
    }

    #[test]
    fn unknown_model_key_is_rejected() {
        let err = serde_yaml::from_str::<ModelConfig>("time_dealy: 5").unwrap_err();
        assert!(err.to_string().contains("time_dealy"));
    }

    #[test]
    fn sub_second_delay_is_invalid() {
        let model: ModelConfig = serde_yaml::from_str("time_delay: 0.5").expect("valid yaml");
        let err = model.validate().unwrap_err();
        assert!(err.to_string().contains("time_delay"));
    }

    #[test]
    fn huge_or_nan_timings_are_invalid() {
        for yaml in ["time_delay: 1e20", "time_delay: 3601", "time_delay: .nan"] {
            let model: ModelConfig = serde_yaml::from_str(yaml).expect("valid yaml");
            let err = model.validate().unwrap_err();
            assert!(err.to_string().contains("time_delay"), "{yaml}");
        }
        for yaml in ["fade_time: 50.5", "fade_time: -1", "fade_time: .inf"] {
            let model: ModelConfig = serde_yaml::from_str(yaml).expect("valid yaml");
            let err = model.validate().unwrap_err();
            assert!(err.to_string().contains("fade_time"), "{yaml}");
        }
        let edge: ModelConfig =
            serde_yaml::from_str("time_delay: 3600\nfade_time: 50").expect("valid yaml");
        edge.validate().expect("range bounds are inclusive");

        let scan: ModelConfig = serde_yaml::from_str("check_dir_tm: 1e30").expect("valid yaml");
        assert!(scan.validate().is_err());
        let viewer: ViewerConfig = serde_yaml::from_str("fps: 1e-30").expect("valid yaml");
        assert!(viewer.validate().is_err());
    }

    #[test]
    fn mqtt_requires_server_only_when_enabled() {
        let disabled = MqttConfig::default();
        disabled.validate().expect("disabled mqtt needs no server");

        let enabled: MqttConfig = serde_yaml::from_str("use_mqtt: true").expect("valid yaml");
        assert!(enabled.validate().is_err());
    }

    #[test]
    fn expand_home_leaves_absolute_paths() {
        let path = Path::new("/srv/photos");
        assert_eq!(expand_home(path), PathBuf::from("/srv/photos"));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_home(Path::new("~/p")), home.join("p"));
        }
    }
}
