//! Typed camera properties.
//!
//! Only the settings the kiosk actually tunes are modelled. Values are
//! serde-friendly so a property map can live in the session config.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PropertyId {
    SaveTo,
    ImageQuality,
    WhiteBalance,
    Iso,
}

impl fmt::Display for PropertyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PropertyId::SaveTo => "save-to",
            PropertyId::ImageQuality => "image-quality",
            PropertyId::WhiteBalance => "white-balance",
            PropertyId::Iso => "iso",
        };
        f.write_str(name)
    }
}

/// Where the body stores a finished capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SaveTarget {
    Camera,
    Host,
    Both,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ImageQuality {
    LargeJpegFine,
    LargeJpegNormal,
    MediumJpegFine,
    SmallJpegFine,
    Raw,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WhiteBalance {
    Auto,
    Daylight,
    Cloudy,
    Tungsten,
    Fluorescent,
    Flash,
}

/// One entry of a property map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "property", content = "value", rename_all = "kebab-case")]
pub enum Property {
    SaveTo(SaveTarget),
    ImageQuality(ImageQuality),
    WhiteBalance(WhiteBalance),
    Iso(u32),
}

impl Property {
    pub fn id(&self) -> PropertyId {
        match self {
            Property::SaveTo(_) => PropertyId::SaveTo,
            Property::ImageQuality(_) => PropertyId::ImageQuality,
            Property::WhiteBalance(_) => PropertyId::WhiteBalance,
            Property::Iso(_) => PropertyId::Iso,
        }
    }

    /// Booth defaults: deliver to the host, large fine JPEG, indoor lighting.
    pub fn kiosk_defaults() -> Vec<Property> {
        vec![
            Property::SaveTo(SaveTarget::Host),
            Property::ImageQuality(ImageQuality::LargeJpegFine),
            Property::WhiteBalance(WhiteBalance::Fluorescent),
        ]
    }
}
