use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, ensure};
use serde::Deserialize;
use tracing::warn;

pub use config_model::{
    BlendType, FADE_TIME_RANGE, HttpConfig, ModelConfig, MqttConfig, TIME_DELAY_RANGE,
    ViewerConfig, expand_home,
};

use crate::playlist::PlaylistOptions;
use crate::tags::KnownTag;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Configuration {
    /// Presentation settings passed through to the renderer.
    pub viewer: ViewerConfig,
    /// Library, cache and playback settings.
    pub model: ModelConfig,
    pub mqtt: MqttConfig,
    pub http: HttpConfig,
}

impl Configuration {
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let s = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&s)?)
    }

    /// Validate runtime invariants and expand `~` in every path.
    pub fn validated(mut self) -> Result<Self> {
        self.viewer
            .validate()
            .context("invalid viewer configuration")?;
        self.model.validate().context("invalid model configuration")?;
        self.mqtt.validate().context("invalid mqtt configuration")?;
        self.http.validate().context("invalid http configuration")?;

        for name in &self.model.image_attr {
            ensure!(!name.trim().is_empty(), "model.image_attr entries must not be empty");
            if name != "gps" && KnownTag::from_name(name).is_none() {
                warn!(attribute = %name, "image_attr is not a known tag; treating it as a raw EXIF name");
            }
        }
        ensure!(
            !Path::new(&self.model.subdirectory).is_absolute(),
            "model.subdirectory must be relative to model.pic_dir"
        );

        self.model.pic_dir = expand_home(&self.model.pic_dir);
        self.model.no_files_img = expand_home(&self.model.no_files_img);
        self.model.db_file = expand_home(&self.model.db_file);
        self.viewer.font_file = expand_home(&self.viewer.font_file);
        self.viewer.shader = expand_home(&self.viewer.shader);
        if !self.mqtt.tls.as_os_str().is_empty() {
            self.mqtt.tls = expand_home(&self.mqtt.tls);
        }
        Ok(self)
    }

    pub fn playlist_options(&self) -> PlaylistOptions {
        PlaylistOptions {
            shuffle: self.model.shuffle,
            recent_n: self.model.recent_n,
            reshuffle_num: self.model.reshuffle_num,
            time_delay: Duration::from_secs_f64(self.model.time_delay),
            fade_time: Duration::from_secs_f64(self.model.fade_time.min(self.model.time_delay)),
        }
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs_f64(self.model.check_dir_tm)
    }
}
