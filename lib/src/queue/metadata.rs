//! Per-buffer metadata carried alongside the queued buffers.
use std::fmt;

use enumn::N;

/// Which kind of HDR metadata, if any, has been set on a buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, N)]
#[repr(u32)]
pub enum HdrMetaDataType {
    NotUsed = 0,
    MetaData,
    MetaDataSet,
}

impl Default for HdrMetaDataType {
    fn default() -> Self {
        HdrMetaDataType::NotUsed
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, N)]
#[repr(u32)]
pub enum HdrMetadataKey {
    RedPrimaryX = 0,
    RedPrimaryY = 1,
    GreenPrimaryX = 2,
    GreenPrimaryY = 3,
    BluePrimaryX = 4,
    BluePrimaryY = 5,
    WhitePrimaryX = 6,
    WhitePrimaryY = 7,
    MaxLuminance = 8,
    MinLuminance = 9,
    MaxContentLightLevel = 10,
    MaxFrameAverageLightLevel = 11,
    Hdr10Plus = 12,
    HdrVivid = 13,
}

impl Default for HdrMetadataKey {
    fn default() -> Self {
        HdrMetadataKey::RedPrimaryX
    }
}

/// One entry of static HDR metadata.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct HdrMetaData {
    pub key: HdrMetadataKey,
    pub value: f32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, N)]
#[repr(u32)]
pub enum PresentTimestampType {
    Unsupported = 0,
    Delay = 1 << 0,
    Timestamp = 1 << 1,
}

/// When a buffer was actually presented, as reported by the consumer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PresentTimestamp {
    pub type_: PresentTimestampType,
    pub time: i64,
}

impl Default for PresentTimestamp {
    fn default() -> Self {
        PresentTimestamp {
            type_: PresentTimestampType::Unsupported,
            time: 0,
        }
    }
}

/// Handle of a sideband stream ("tunnel") bypassing the queue, e.g. from a
/// hardware video decoder straight to the display.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TunnelHandle {
    /// Identifier of the stream, as given by the platform.
    pub id: i32,
    pub reserve_ints: Vec<u32>,
}

impl fmt::Display for TunnelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tunnel {} ({} ints)", self.id, self.reserve_ints.len())
    }
}
