//! Validated runtime commands shared by the MQTT and HTTP transports.
//!
//! Every remote mutation is parsed against one table before anything
//! changes, so an invalid value leaves the previous setting in place.

use std::collections::BTreeMap;
use std::path::{Component, Path};

use chrono::{DateTime, Local, NaiveDate, NaiveDateTime, NaiveTime};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, info};

use crate::slideshow::Slideshow;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("unknown command `{0}`")]
    Unknown(String),
    #[error("invalid value for `{name}`: {reason}")]
    Invalid { name: String, reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Relative to the picture root; empty selects the whole library.
    Subdirectory(String),
    DateFrom(Option<NaiveDateTime>),
    DateTo(Option<NaiveDateTime>),
    TimeDelay(f64),
    FadeTime(f64),
    Shuffle(bool),
    Paused(bool),
    TagsFilter(Vec<String>),
    Display(bool),
    Back,
    Next,
    PurgeFiles,
}

impl Command {
    /// Value echoed back to the caller after the command was applied.
    pub fn value(&self) -> Value {
        match self {
            Command::Subdirectory(s) => json!(s),
            Command::DateFrom(d) | Command::DateTo(d) => date_json(*d),
            Command::TimeDelay(v) | Command::FadeTime(v) => json!(v),
            Command::Shuffle(b) | Command::Paused(b) | Command::Display(b) => json!(b),
            Command::TagsFilter(tags) => json!(tags.join(",")),
            Command::Back | Command::Next | Command::PurgeFiles => json!(true),
        }
    }
}

/// How a command is advertised to a home-automation hub.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Entity {
    Switch,
    Button,
    Number { min: f64, max: f64, step: f64 },
    Text,
    Select,
    /// Plain command topic without a discovery entry.
    Topic,
}

pub struct CommandSpec {
    pub name: &'static str,
    pub entity: Entity,
    pub icon: &'static str,
    parse: fn(&str, &ParseContext<'_>) -> Result<Command, String>,
}

struct ParseContext<'a> {
    pic_dir: &'a Path,
}

pub use crate::config::{FADE_TIME_RANGE, TIME_DELAY_RANGE};

pub static COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        name: "subdirectory",
        entity: Entity::Select,
        icon: "mdi:folder-multiple-image",
        parse: |raw, ctx| parse_subdirectory(raw, ctx.pic_dir).map(Command::Subdirectory),
    },
    CommandSpec {
        name: "date_from",
        entity: Entity::Text,
        icon: "mdi:calendar-arrow-left",
        parse: |raw, _| parse_date(raw, false).map(Command::DateFrom),
    },
    CommandSpec {
        name: "date_to",
        entity: Entity::Text,
        icon: "mdi:calendar-arrow-right",
        parse: |raw, _| parse_date(raw, true).map(Command::DateTo),
    },
    CommandSpec {
        name: "time_delay",
        entity: Entity::Number {
            min: TIME_DELAY_RANGE.0,
            max: TIME_DELAY_RANGE.1,
            step: 1.0,
        },
        icon: "mdi:image-plus",
        parse: |raw, _| parse_number(raw, TIME_DELAY_RANGE).map(Command::TimeDelay),
    },
    CommandSpec {
        name: "fade_time",
        entity: Entity::Number {
            min: FADE_TIME_RANGE.0,
            max: FADE_TIME_RANGE.1,
            step: 1.0,
        },
        icon: "mdi:image-size-select-large",
        parse: |raw, _| parse_number(raw, FADE_TIME_RANGE).map(Command::FadeTime),
    },
    CommandSpec {
        name: "shuffle",
        entity: Entity::Switch,
        icon: "mdi:shuffle-variant",
        parse: |raw, _| parse_bool(raw).map(Command::Shuffle),
    },
    CommandSpec {
        name: "paused",
        entity: Entity::Switch,
        icon: "mdi:pause",
        parse: |raw, _| parse_bool(raw).map(Command::Paused),
    },
    CommandSpec {
        name: "tags_filter",
        entity: Entity::Text,
        icon: "mdi:image-search",
        parse: |raw, _| Ok(Command::TagsFilter(parse_tags(raw))),
    },
    CommandSpec {
        name: "display",
        entity: Entity::Switch,
        icon: "mdi:panorama",
        parse: |raw, _| parse_bool(raw).map(Command::Display),
    },
    CommandSpec {
        name: "back",
        entity: Entity::Button,
        icon: "mdi:skip-previous",
        parse: |raw, _| parse_action(raw, Command::Back),
    },
    CommandSpec {
        name: "next",
        entity: Entity::Button,
        icon: "mdi:skip-next",
        parse: |raw, _| parse_action(raw, Command::Next),
    },
    CommandSpec {
        name: "purge_files",
        entity: Entity::Topic,
        icon: "mdi:delete-sweep",
        parse: |raw, _| parse_action(raw, Command::PurgeFiles),
    },
];

/// Find a command by name; `directory` is accepted for `subdirectory`.
pub fn lookup(name: &str) -> Option<&'static CommandSpec> {
    let name = match name {
        "directory" => "subdirectory",
        other => other,
    };
    COMMANDS.iter().find(|c| c.name == name)
}

/// Front door for remote control. Cheap to clone.
///
/// `apply` may rebuild the library snapshot from the store, so transports
/// call it from a blocking context.
#[derive(Clone)]
pub struct CommandGateway {
    slideshow: Slideshow,
}

impl CommandGateway {
    pub fn new(slideshow: Slideshow) -> Self {
        Self { slideshow }
    }

    pub fn slideshow(&self) -> &Slideshow {
        &self.slideshow
    }

    pub fn parse(&self, name: &str, raw: &str) -> Result<Command, CommandError> {
        let spec = lookup(name).ok_or_else(|| CommandError::Unknown(name.to_string()))?;
        let ctx = ParseContext {
            pic_dir: &self.slideshow.config().model.pic_dir,
        };
        (spec.parse)(raw, &ctx).map_err(|reason| CommandError::Invalid {
            name: spec.name.to_string(),
            reason,
        })
    }

    pub fn apply(&self, command: Command) -> Value {
        info!(?command, "applying command");
        let echo = command.value();
        let show = &self.slideshow;
        match command {
            Command::Subdirectory(sub) => show.update_filters(|s| s.subdirectory = sub),
            Command::DateFrom(d) => show.update_filters(|s| s.date_from = d),
            Command::DateTo(d) => show.update_filters(|s| s.date_to = d),
            Command::TagsFilter(tags) => show.update_filters(|s| s.tags_filter = tags),
            Command::TimeDelay(v) => show.set_time_delay(v),
            Command::FadeTime(v) => show.set_fade_time(v),
            Command::Shuffle(b) => show.set_shuffle(b),
            Command::Paused(b) => show.set_paused(b),
            Command::Display(b) => show.set_display(b),
            Command::Back => {
                show.back();
            }
            Command::Next => {
                show.next();
            }
            Command::PurgeFiles => show.request_purge(),
        }
        echo
    }

    /// Parse and apply in one step; nothing changes when parsing fails.
    pub fn execute(&self, name: &str, raw: &str) -> Result<Value, CommandError> {
        let command = self.parse(name, raw)?;
        Ok(self.apply(command))
    }

    /// Flat view of every runtime setting plus the configured attributes of
    /// the image on screen.
    pub fn state(&self) -> BTreeMap<String, Value> {
        let status = self.slideshow.status();
        let settings = &status.settings;
        let mut state = BTreeMap::new();
        state.insert("directory".into(), json!(self.directory_name(&settings.subdirectory)));
        state.insert("image".into(), json!(status.current.path.display().to_string()));
        state.insert("image_counter".into(), json!(status.image_counter));
        state.insert("date_from".into(), date_json(settings.date_from));
        state.insert("date_to".into(), date_json(settings.date_to));
        state.insert("tags_filter".into(), json!(settings.tags_filter.join(",")));
        state.insert("time_delay".into(), json!(settings.time_delay));
        state.insert("fade_time".into(), json!(settings.fade_time));
        state.insert("shuffle".into(), json!(settings.shuffle));
        state.insert("paused".into(), json!(settings.paused));
        state.insert("display".into(), json!(settings.display_on));
        state.insert("state".into(), json!(status.state.as_str()));
        state.insert("position".into(), json!(status.position));
        state.insert("epoch".into(), json!(status.epoch));
        for name in &self.slideshow.config().model.image_attr {
            let value = status.current.attributes.attribute(name).unwrap_or(Value::Null);
            state.entry(name.clone()).or_insert(value);
        }
        state
    }

    /// Configured attributes of the image on screen.
    pub fn image_attributes(&self) -> BTreeMap<String, Value> {
        let status = self.slideshow.status();
        self.slideshow
            .config()
            .model
            .image_attr
            .iter()
            .map(|name| {
                let value = status.current.attributes.attribute(name).unwrap_or(Value::Null);
                (name.clone(), value)
            })
            .collect()
    }

    /// Root name followed by the visible top-level subdirectories.
    pub fn directory_list(&self) -> Vec<String> {
        let model = &self.slideshow.config().model;
        let mut dirs: Vec<String> = match std::fs::read_dir(&model.pic_dir) {
            Ok(entries) => entries
                .filter_map(Result::ok)
                .filter(|e| {
                    e.file_type().is_ok_and(|t| {
                        t.is_dir() || (model.follow_links && t.is_symlink() && e.path().is_dir())
                    })
                })
                .filter_map(|e| e.file_name().into_string().ok())
                .filter(|n| !n.starts_with('.'))
                .collect(),
            Err(err) => {
                debug!(error = %err, "picture root unreadable");
                Vec::new()
            }
        };
        dirs.sort();
        dirs.insert(0, self.directory_name(""));
        dirs
    }

    fn directory_name(&self, subdirectory: &str) -> String {
        if subdirectory.is_empty() {
            root_name(&self.slideshow.config().model.pic_dir)
        } else {
            subdirectory.to_string()
        }
    }
}

fn root_name(pic_dir: &Path) -> String {
    pic_dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn date_json(d: Option<NaiveDateTime>) -> Value {
    d.map_or(Value::Null, |d| json!(d.format("%Y-%m-%d %H:%M:%S").to_string()))
}

pub fn parse_bool(raw: &str) -> Result<bool, String> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "on" | "yes" | "1" => Ok(true),
        "false" | "off" | "no" | "0" => Ok(false),
        other => Err(format!("expected on/off, got `{other}`")),
    }
}

/// Buttons fire on an empty payload or a true value; anything else is refused.
fn parse_action(raw: &str, command: Command) -> Result<Command, String> {
    if raw.trim().is_empty() {
        return Ok(command);
    }
    match parse_bool(raw) {
        Ok(true) => Ok(command),
        _ => Err(format!(
            "action requires a true value or an empty payload, got `{}`",
            raw.trim()
        )),
    }
}

fn parse_number(raw: &str, (min, max): (f64, f64)) -> Result<f64, String> {
    let value: f64 = raw
        .trim()
        .parse()
        .map_err(|_| format!("`{}` is not a number", raw.trim()))?;
    if !value.is_finite() || value < min || value > max {
        return Err(format!("must be between {min} and {max}"));
    }
    Ok(value)
}

fn parse_tags(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_subdirectory(raw: &str, pic_dir: &Path) -> Result<String, String> {
    let sub = raw.trim().trim_matches('/');
    if sub.is_empty() || sub == root_name(pic_dir) {
        return Ok(String::new());
    }
    if !Path::new(sub)
        .components()
        .all(|c| matches!(c, Component::Normal(_)))
    {
        return Err("must be a path inside the picture root".into());
    }
    if !pic_dir.join(sub).is_dir() {
        return Err(format!("`{sub}` is not a directory under the picture root"));
    }
    Ok(sub.to_string())
}

/// Accepts `YYYY/MM/DD` (any of `/ - . ,` as separator) with an optional
/// `HH:MM[:SS]` time, or a Unix timestamp. Empty input and `none` clear the
/// bound. A date-only upper bound covers the whole day.
pub fn parse_date(raw: &str, end_of_day: bool) -> Result<Option<NaiveDateTime>, String> {
    let s = raw.trim();
    if s.is_empty() || s.eq_ignore_ascii_case("none") {
        return Ok(None);
    }
    if let Ok(secs) = s.parse::<f64>() {
        if !secs.is_finite() {
            return Err("timestamp must be finite".into());
        }
        return DateTime::from_timestamp(secs.floor() as i64, 0)
            .map(|utc| Some(utc.with_timezone(&Local).naive_local()))
            .ok_or_else(|| "timestamp out of range".to_string());
    }

    let (date_part, time_part) = match s.split_once([' ', 'T']) {
        Some((d, t)) => (d, Some(t.trim())),
        None => (s, None),
    };
    let fields: Vec<&str> = date_part.split(['/', '-', '.', ',']).collect();
    let &[y, m, d] = fields.as_slice() else {
        return Err(format!("`{s}` is not a date like 2024/05/31"));
    };
    let parse = |f: &str| f.trim().parse::<u32>().map_err(|_| format!("`{s}` is not a date"));
    let year = i32::try_from(parse(y)?).map_err(|_| format!("`{s}` is not a date"))?;
    let date = NaiveDate::from_ymd_opt(year, parse(m)?, parse(d)?)
        .ok_or_else(|| format!("`{s}` is not a valid calendar date"))?;

    let time = match time_part {
        Some(t) => NaiveTime::parse_from_str(t, "%H:%M:%S")
            .or_else(|_| NaiveTime::parse_from_str(t, "%H:%M"))
            .map_err(|_| format!("`{t}` is not a time like 18:30"))?,
        None if end_of_day => NaiveTime::from_hms_opt(23, 59, 59).unwrap_or(NaiveTime::MIN),
        None => NaiveTime::MIN,
    };
    Ok(Some(date.and_time(time)))
}
