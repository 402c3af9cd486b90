//! Per-file metadata extraction: dimensions, EXIF, GPS, IPTC and the auto-mat.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use anyhow::{Result, bail};
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use exif::{Context as IfdContext, Exif, Field, In, Tag, Value};

use crate::matting::MatDescriptor;
use crate::tags::{ImageAttributes, KnownTag, TagValue};

/// Bumped whenever extraction output changes enough to refresh cached rows.
pub const EXTRACTOR_VERSION: u32 = 1;

/// Raw EXIF values longer than this are dropped (thumbnails, maker notes).
const MAX_RAW_VALUE_LEN: usize = 256;

const RATING: Tag = Tag(IfdContext::Tiff, 0x4746);

/// Result of extracting one file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Extracted {
    pub attributes: ImageAttributes,
    pub mat: Option<MatDescriptor>,
}

/// Reads metadata from an image file. The scanner only calls this for files
/// whose fingerprint changed.
pub trait Extractor: Send + Sync {
    fn version(&self) -> u32 {
        EXTRACTOR_VERSION
    }

    fn extract(&self, path: &Path) -> Result<Extracted>;
}

/// Extractor backed by `kamadak-exif` and `image`.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetadataExtractor;

impl Extractor for MetadataExtractor {
    fn extract(&self, path: &Path) -> Result<Extracted> {
        let mut attributes = ImageAttributes::default();

        let exif = read_exif_data(path);
        let orientation = exif.as_ref().map_or(1, get_orientation);
        attributes.set(KnownTag::Orientation, TagValue::Int(i64::from(orientation)));

        let dimensions = match image::image_dimensions(path) {
            Ok(dims) => Some(dims),
            Err(err) => {
                tracing::debug!(path = %path.display(), error = %err, "dimensions unavailable");
                None
            }
        };
        if exif.is_none() && dimensions.is_none() {
            bail!("{} is neither a decodable image nor carries EXIF", path.display());
        }
        if let Some((raw_w, raw_h)) = dimensions {
            let (w, h) = if matches!(orientation, 5..=8) {
                (raw_h, raw_w)
            } else {
                (raw_w, raw_h)
            };
            attributes.set(KnownTag::Width, TagValue::Int(i64::from(w)));
            attributes.set(KnownTag::Height, TagValue::Int(i64::from(h)));
        }

        if let Some(exif) = &exif {
            collect_exif(exif, &mut attributes);
        }

        match read_iptc(path) {
            Ok(Some(iptc)) => iptc.apply(&mut attributes),
            Ok(None) => {}
            Err(err) => tracing::debug!(path = %path.display(), error = %err, "iptc read failed"),
        }

        // metadata already read is kept even when the pixels cannot be decoded
        let mat = match image::open(path) {
            Ok(img) => Some(MatDescriptor::compute(&img, orientation)),
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "no mat: decode failed");
                None
            }
        };

        Ok(Extracted { attributes, mat })
    }
}

fn read_exif_data(path: &Path) -> Option<Exif> {
    let file = File::open(path).ok()?;
    let mut reader = BufReader::new(file);
    exif::Reader::new().read_from_container(&mut reader).ok()
}

fn get_orientation(exif: &Exif) -> u8 {
    if let Some(field) = exif.get_field(Tag::Orientation, In::PRIMARY)
        && let Some(v @ 1..=8) = field.value.get_uint(0)
    {
        return v as u8;
    }
    1
}

fn collect_exif(exif: &Exif, attrs: &mut ImageAttributes) {
    if let Some(taken) = capture_time(exif) {
        attrs.set(KnownTag::CaptureTime, TagValue::Time(taken));
    }
    for (tag, known) in [
        (Tag::Make, KnownTag::Make),
        (Tag::Model, KnownTag::Model),
        (Tag::LensModel, KnownTag::Lens),
    ] {
        if let Some(text) = exif.get_field(tag, In::PRIMARY).and_then(ascii) {
            attrs.set(known, TagValue::Text(text));
        }
    }
    if let Some(v) = rational(exif, Tag::FNumber) {
        attrs.set(KnownTag::FNumber, TagValue::Real(round_to(v, 1)));
    }
    if let Some(v) = rational(exif, Tag::FocalLength) {
        attrs.set(KnownTag::FocalLength, TagValue::Real(round_to(v, 1)));
    }
    if let Some(text) = exposure_time(exif) {
        attrs.set(KnownTag::ExposureTime, TagValue::Text(text));
    }
    if let Some(iso) = exif
        .get_field(Tag::PhotographicSensitivity, In::PRIMARY)
        .and_then(|f| f.value.get_uint(0))
    {
        attrs.set(KnownTag::Iso, TagValue::Int(i64::from(iso)));
    }
    if let Some(rating) = exif
        .get_field(RATING, In::PRIMARY)
        .and_then(|f| f.value.get_uint(0))
    {
        attrs.set(KnownTag::Rating, TagValue::Int(i64::from(rating)));
    }
    if let Some((lat, lon)) = extract_gps_lat_lon(exif) {
        attrs.set(KnownTag::Latitude, TagValue::Real(round_to(lat, 4)));
        attrs.set(KnownTag::Longitude, TagValue::Real(round_to(lon, 4)));
    }

    for field in exif.fields().filter(|f| f.ifd_num == In::PRIMARY) {
        if is_mapped(field.tag) {
            continue;
        }
        let value = field.display_value().to_string();
        if value.len() <= MAX_RAW_VALUE_LEN {
            attrs.raw.insert(field.tag.to_string(), value);
        }
    }
}

fn is_mapped(tag: Tag) -> bool {
    [
        Tag::Orientation,
        Tag::DateTimeOriginal,
        Tag::DateTime,
        Tag::Make,
        Tag::Model,
        Tag::LensModel,
        Tag::FNumber,
        Tag::FocalLength,
        Tag::ExposureTime,
        Tag::PhotographicSensitivity,
        Tag::GPSLatitude,
        Tag::GPSLatitudeRef,
        Tag::GPSLongitude,
        Tag::GPSLongitudeRef,
        Tag::MakerNote,
        RATING,
    ]
    .contains(&tag)
}

fn ascii(field: &Field) -> Option<String> {
    match &field.value {
        Value::Ascii(vec) if !vec.is_empty() => {
            let text = String::from_utf8_lossy(&vec[0]).trim().to_string();
            (!text.is_empty()).then_some(text)
        }
        _ => None,
    }
}

fn rational(exif: &Exif, tag: Tag) -> Option<f64> {
    match &exif.get_field(tag, In::PRIMARY)?.value {
        Value::Rational(rats) if !rats.is_empty() && rats[0].denom != 0 => Some(rats[0].to_f64()),
        _ => None,
    }
}

fn exposure_time(exif: &Exif) -> Option<String> {
    match &exif.get_field(Tag::ExposureTime, In::PRIMARY)?.value {
        Value::Rational(rats) if !rats.is_empty() && rats[0].denom != 0 => {
            let r = rats[0];
            if r.num >= r.denom {
                Some(format!("{}", round_to(r.to_f64(), 1)))
            } else if r.num == 0 {
                None
            } else {
                Some(format!("1/{}", (f64::from(r.denom) / f64::from(r.num)).round()))
            }
        }
        _ => None,
    }
}

fn capture_time(exif: &Exif) -> Option<NaiveDateTime> {
    [Tag::DateTimeOriginal, Tag::DateTime]
        .into_iter()
        .find_map(|tag| parse_exif_datetime_tag(exif, tag))
}

fn parse_exif_datetime_tag(exif: &Exif, tag: Tag) -> Option<NaiveDateTime> {
    let field = exif.get_field(tag, In::PRIMARY)?;
    let Value::Ascii(vec) = &field.value else {
        return None;
    };
    let dt = exif::DateTime::from_ascii(vec.first()?).ok()?;
    let date = NaiveDate::from_ymd_opt(i32::from(dt.year), u32::from(dt.month), u32::from(dt.day))?;
    let time = NaiveTime::from_hms_opt(
        u32::from(dt.hour),
        u32::from(dt.minute),
        u32::from(dt.second),
    )?;
    Some(NaiveDateTime::new(date, time))
}

/// GPS position as signed decimal degrees.
pub fn extract_gps_lat_lon(exif: &Exif) -> Option<(f64, f64)> {
    let lat_field = exif.get_field(Tag::GPSLatitude, In::PRIMARY)?;
    let lon_field = exif.get_field(Tag::GPSLongitude, In::PRIMARY)?;
    let lat = parse_gps_coordinate(&lat_field.value)?;
    let lon = parse_gps_coordinate(&lon_field.value)?;

    let is_ref = |tag: Tag, negative: &str| {
        exif.get_field(tag, In::PRIMARY).is_some_and(|f| {
            f.value
                .display_as(tag)
                .to_string()
                .trim()
                .eq_ignore_ascii_case(negative)
        })
    };
    let lat = if is_ref(Tag::GPSLatitudeRef, "S") { -lat } else { lat };
    let lon = if is_ref(Tag::GPSLongitudeRef, "W") { -lon } else { lon };
    Some((lat, lon))
}

/// Degrees, minutes and seconds rationals to a positive decimal magnitude.
pub fn parse_gps_coordinate(value: &Value) -> Option<f64> {
    let Value::Rational(rats) = value else {
        return None;
    };
    if rats.len() < 3 || rats[..3].iter().any(|r| r.denom == 0) {
        return None;
    }
    Some(rats[0].to_f64() + rats[1].to_f64() / 60.0 + rats[2].to_f64() / 3600.0)
}

fn round_to(value: f64, places: i32) -> f64 {
    let scale = 10f64.powi(places);
    (value * scale).round() / scale
}

/// IPTC-IIM fields read from a JPEG's Photoshop APP13 segment.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Iptc {
    pub keywords: Vec<String>,
    pub caption: Option<String>,
    pub title: Option<String>,
}

impl Iptc {
    fn apply(self, attrs: &mut ImageAttributes) {
        if !self.keywords.is_empty() {
            attrs.set(KnownTag::Keywords, TagValue::List(self.keywords));
        }
        if let Some(caption) = self.caption {
            attrs.set(KnownTag::Caption, TagValue::Text(caption));
        }
        if let Some(title) = self.title {
            attrs.set(KnownTag::Title, TagValue::Text(title));
        }
    }
}

const PHOTOSHOP_SIGNATURE: &[u8] = b"Photoshop 3.0\0";
const IPTC_RESOURCE_ID: u16 = 0x0404;

/// Walk the JPEG marker segments up to the scan data looking for IPTC.
pub fn read_iptc(path: &Path) -> std::io::Result<Option<Iptc>> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut soi = [0u8; 2];
    if reader.read_exact(&mut soi).is_err() || soi != [0xFF, 0xD8] {
        return Ok(None);
    }
    loop {
        let mut marker = [0u8; 2];
        reader.read_exact(&mut marker)?;
        if marker[0] != 0xFF {
            return Ok(None);
        }
        let mut code = marker[1];
        while code == 0xFF {
            let mut next = [0u8; 1];
            reader.read_exact(&mut next)?;
            code = next[0];
        }
        // start of scan or end of image
        if code == 0xDA || code == 0xD9 {
            return Ok(None);
        }
        let mut len = [0u8; 2];
        reader.read_exact(&mut len)?;
        let len = usize::from(u16::from_be_bytes(len)).saturating_sub(2);
        let mut segment = vec![0u8; len];
        reader.read_exact(&mut segment)?;
        if code == 0xED
            && let Some(iim) = photoshop_iim(&segment)
        {
            return Ok(Some(parse_iim(iim)));
        }
    }
}

fn photoshop_iim(segment: &[u8]) -> Option<&[u8]> {
    let mut rest = segment.strip_prefix(PHOTOSHOP_SIGNATURE)?;
    while rest.len() >= 12 && rest.starts_with(b"8BIM") {
        let id = u16::from_be_bytes([rest[4], rest[5]]);
        let name_len = usize::from(rest[6]);
        // pascal name padded to an even length including its length byte
        let name_total = (name_len + 1 + 1) & !1;
        let size_at = 6 + name_total;
        let size_bytes = rest.get(size_at..size_at + 4)?;
        let size = u32::from_be_bytes([size_bytes[0], size_bytes[1], size_bytes[2], size_bytes[3]])
            as usize;
        let data_at = size_at + 4;
        let data = rest.get(data_at..data_at + size)?;
        if id == IPTC_RESOURCE_ID {
            return Some(data);
        }
        let next = data_at + size + (size & 1);
        rest = rest.get(next..)?;
    }
    None
}

fn parse_iim(data: &[u8]) -> Iptc {
    let mut iptc = Iptc::default();
    let mut i = 0;
    while i + 5 <= data.len() && data[i] == 0x1C {
        let record = data[i + 1];
        let dataset = data[i + 2];
        let len = u16::from_be_bytes([data[i + 3], data[i + 4]]);
        // extended-length datasets never carry the text fields read here
        if len & 0x8000 != 0 {
            break;
        }
        let start = i + 5;
        let end = start + usize::from(len);
        let Some(value) = data.get(start..end) else {
            break;
        };
        let text = String::from_utf8_lossy(value).trim().to_string();
        if record == 2 && !text.is_empty() {
            match dataset {
                25 => iptc.keywords.push(text),
                120 => iptc.caption = Some(text),
                5 => iptc.title = Some(text),
                _ => {}
            }
        }
        i = end;
    }
    iptc
}
