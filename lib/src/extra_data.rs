//! Typed key/value side channel attached to buffers.
use std::collections::BTreeMap;

use crate::error::{Result, SurfaceError};
use crate::MAX_USER_DATA_COUNT;

#[derive(Debug, Clone, PartialEq)]
pub enum ExtraValue {
    Int32(i32),
    Int64(i64),
    Double(f64),
    String(String),
}

impl From<i32> for ExtraValue {
    fn from(v: i32) -> Self {
        ExtraValue::Int32(v)
    }
}

impl From<i64> for ExtraValue {
    fn from(v: i64) -> Self {
        ExtraValue::Int64(v)
    }
}

impl From<f64> for ExtraValue {
    fn from(v: f64) -> Self {
        ExtraValue::Double(v)
    }
}

impl From<&str> for ExtraValue {
    fn from(v: &str) -> Self {
        ExtraValue::String(v.to_owned())
    }
}

impl From<String> for ExtraValue {
    fn from(v: String) -> Self {
        ExtraValue::String(v)
    }
}

/// Extra data a producer attaches to a buffer when cancelling or flushing
/// it, e.g. the content timestamp of a video frame. At most
/// `MAX_USER_DATA_COUNT` keys can be set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BufferExtraData {
    entries: BTreeMap<String, ExtraValue>,
}

impl BufferExtraData {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Set `key` to `value`, replacing any previous value regardless of its
    /// type.
    pub fn set<V: Into<ExtraValue>>(&mut self, key: &str, value: V) -> Result<()> {
        if !self.entries.contains_key(key) && self.entries.len() >= MAX_USER_DATA_COUNT {
            return Err(SurfaceError::OutOfRange);
        }
        self.entries.insert(key.to_owned(), value.into());

        Ok(())
    }

    pub fn get(&self, key: &str) -> Result<&ExtraValue> {
        self.entries.get(key).ok_or(SurfaceError::NoEntry)
    }

    pub fn get_i32(&self, key: &str) -> Result<i32> {
        match self.get(key)? {
            ExtraValue::Int32(v) => Ok(*v),
            _ => Err(SurfaceError::TypeError),
        }
    }

    pub fn get_i64(&self, key: &str) -> Result<i64> {
        match self.get(key)? {
            ExtraValue::Int64(v) => Ok(*v),
            _ => Err(SurfaceError::TypeError),
        }
    }

    pub fn get_f64(&self, key: &str) -> Result<f64> {
        match self.get(key)? {
            ExtraValue::Double(v) => Ok(*v),
            _ => Err(SurfaceError::TypeError),
        }
    }

    pub fn get_str(&self, key: &str) -> Result<&str> {
        match self.get(key)? {
            ExtraValue::String(v) => Ok(v.as_str()),
            _ => Err(SurfaceError::TypeError),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ExtraValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }
}
