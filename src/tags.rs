//! Typed tag map attached to every image record.
//!
//! Known tags live in a closed enumeration with typed values; anything else
//! the extractor finds is kept verbatim in a raw bucket so newer consumers can
//! still reach it.

use std::collections::BTreeMap;
use std::fmt;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KnownTag {
    Make,
    Model,
    Lens,
    FNumber,
    ExposureTime,
    Iso,
    FocalLength,
    Rating,
    Orientation,
    CaptureTime,
    Latitude,
    Longitude,
    Width,
    Height,
    Keywords,
    Caption,
    Title,
}

impl KnownTag {
    pub const ALL: [KnownTag; 17] = [
        KnownTag::Make,
        KnownTag::Model,
        KnownTag::Lens,
        KnownTag::FNumber,
        KnownTag::ExposureTime,
        KnownTag::Iso,
        KnownTag::FocalLength,
        KnownTag::Rating,
        KnownTag::Orientation,
        KnownTag::CaptureTime,
        KnownTag::Latitude,
        KnownTag::Longitude,
        KnownTag::Width,
        KnownTag::Height,
        KnownTag::Keywords,
        KnownTag::Caption,
        KnownTag::Title,
    ];

    pub fn name(self) -> &'static str {
        match self {
            KnownTag::Make => "make",
            KnownTag::Model => "model",
            KnownTag::Lens => "lens",
            KnownTag::FNumber => "f_number",
            KnownTag::ExposureTime => "exposure_time",
            KnownTag::Iso => "iso",
            KnownTag::FocalLength => "focal_length",
            KnownTag::Rating => "rating",
            KnownTag::Orientation => "orientation",
            KnownTag::CaptureTime => "capture_time",
            KnownTag::Latitude => "latitude",
            KnownTag::Longitude => "longitude",
            KnownTag::Width => "width",
            KnownTag::Height => "height",
            KnownTag::Keywords => "keywords",
            KnownTag::Caption => "caption",
            KnownTag::Title => "title",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|tag| tag.name() == name)
    }
}

impl fmt::Display for KnownTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TagValue {
    Text(String),
    Int(i64),
    Real(f64),
    List(Vec<String>),
    Time(NaiveDateTime),
}

impl TagValue {
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            TagValue::Text(s) => serde_json::Value::from(s.as_str()),
            TagValue::Int(v) => serde_json::Value::from(*v),
            TagValue::Real(v) => serde_json::Value::from(*v),
            TagValue::List(items) => serde_json::Value::from(items.clone()),
            TagValue::Time(t) => serde_json::Value::from(t.format("%Y-%m-%d %H:%M:%S").to_string()),
        }
    }
}

/// Extracted attributes of one image file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageAttributes {
    pub tags: BTreeMap<KnownTag, TagValue>,
    /// Unrecognised EXIF fields, keyed by tag name.
    pub raw: BTreeMap<String, String>,
}

impl ImageAttributes {
    pub fn is_empty(&self) -> bool {
        self.tags.is_empty() && self.raw.is_empty()
    }

    pub fn get(&self, tag: KnownTag) -> Option<&TagValue> {
        self.tags.get(&tag)
    }

    pub fn set(&mut self, tag: KnownTag, value: TagValue) {
        self.tags.insert(tag, value);
    }

    pub fn with(mut self, tag: KnownTag, value: TagValue) -> Self {
        self.set(tag, value);
        self
    }

    pub fn orientation(&self) -> u8 {
        match self.get(KnownTag::Orientation) {
            Some(TagValue::Int(v @ 1..=8)) => *v as u8,
            _ => 1,
        }
    }

    pub fn capture_time(&self) -> Option<NaiveDateTime> {
        match self.get(KnownTag::CaptureTime) {
            Some(TagValue::Time(t)) => Some(*t),
            _ => None,
        }
    }

    pub fn gps(&self) -> Option<(f64, f64)> {
        match (self.get(KnownTag::Latitude), self.get(KnownTag::Longitude)) {
            (Some(TagValue::Real(lat)), Some(TagValue::Real(lon))) => Some((*lat, *lon)),
            _ => None,
        }
    }

    pub fn keywords(&self) -> &[String] {
        match self.get(KnownTag::Keywords) {
            Some(TagValue::List(items)) => items,
            _ => &[],
        }
    }

    pub fn dimensions(&self) -> Option<(u32, u32)> {
        match (self.get(KnownTag::Width), self.get(KnownTag::Height)) {
            (Some(TagValue::Int(w)), Some(TagValue::Int(h))) => {
                Some((u32::try_from(*w).ok()?, u32::try_from(*h).ok()?))
            }
            _ => None,
        }
    }

    /// True when any of `wanted` matches one of this image's keywords, ignoring case.
    pub fn has_any_keyword(&self, wanted: &[String]) -> bool {
        self.keywords()
            .iter()
            .any(|kw| wanted.iter().any(|w| w.eq_ignore_ascii_case(kw.trim())))
    }

    /// Value for a configured attribute name. `gps` expands to a `"lat, lon"` string.
    pub fn attribute(&self, name: &str) -> Option<serde_json::Value> {
        if name == "gps" {
            return self
                .gps()
                .map(|(lat, lon)| serde_json::Value::from(format!("{lat:.4}, {lon:.4}")));
        }
        if let Some(tag) = KnownTag::from_name(name) {
            return self.get(tag).map(TagValue::to_json);
        }
        self.raw.get(name).map(|v| serde_json::Value::from(v.as_str()))
    }
}
