/*
    Copyright (C) 2020  Rafal Michalski

    This file is part of ATARUSTY, a Rust library for building emulators.

    For the full copyright notice, see the lib.rs file.
*/
//! A generic property bag for device settings.
use core::fmt;
use std::collections::BTreeMap;

#[cfg(feature = "snapshot")]
use serde::{Serialize, Deserialize};

/// A single property value.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "snapshot", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "snapshot", serde(rename_all = "camelCase"))]
pub enum PropertyValue {
    Bool(bool),
    U32(u32),
    I32(i32),
    F32(f32),
    String(String),
}

#[non_exhaustive]
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyError {
    Missing(String),
    WrongType(String),
}

impl std::error::Error for PropertyError {}

impl fmt::Display for PropertyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyError::Missing(name) => write!(f, "Missing property '{}'", name),
            PropertyError::WrongType(name) => write!(f, "Property '{}' has an unexpected type", name),
        }
    }
}

/// A set of named properties ordered by name.
#[derive(Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "snapshot", derive(Serialize, Deserialize))]
pub struct PropertySet {
    props: BTreeMap<String, PropertyValue>,
}

impl PropertySet {
    pub fn new() -> Self {
        PropertySet::default()
    }

    pub fn is_empty(&self) -> bool {
        self.props.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.props.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&PropertyValue> {
        self.props.get(name)
    }

    pub fn set<S: Into<String>>(&mut self, name: S, value: PropertyValue) {
        self.props.insert(name.into(), value);
    }

    pub fn remove(&mut self, name: &str) -> Option<PropertyValue> {
        self.props.remove(name)
    }

    pub fn iter(&self) -> impl Iterator<Item=(&str, &PropertyValue)> {
        self.props.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn set_bool<S: Into<String>>(&mut self, name: S, value: bool) {
        self.set(name, PropertyValue::Bool(value))
    }

    pub fn set_u32<S: Into<String>>(&mut self, name: S, value: u32) {
        self.set(name, PropertyValue::U32(value))
    }

    pub fn set_i32<S: Into<String>>(&mut self, name: S, value: i32) {
        self.set(name, PropertyValue::I32(value))
    }

    pub fn set_f32<S: Into<String>>(&mut self, name: S, value: f32) {
        self.set(name, PropertyValue::F32(value))
    }

    pub fn set_string<S: Into<String>, V: Into<String>>(&mut self, name: S, value: V) {
        self.set(name, PropertyValue::String(value.into()))
    }

    pub fn get_bool(&self, name: &str, default: bool) -> bool {
        match self.props.get(name) {
            Some(PropertyValue::Bool(b)) => *b,
            Some(PropertyValue::U32(v)) => *v != 0,
            Some(PropertyValue::I32(v)) => *v != 0,
            _ => default
        }
    }

    pub fn get_u32(&self, name: &str, default: u32) -> u32 {
        match self.props.get(name) {
            Some(PropertyValue::U32(v)) => *v,
            Some(PropertyValue::I32(v)) if *v >= 0 => *v as u32,
            _ => default
        }
    }

    pub fn get_i32(&self, name: &str, default: i32) -> i32 {
        match self.props.get(name) {
            Some(PropertyValue::I32(v)) => *v,
            Some(PropertyValue::U32(v)) if *v <= i32::MAX as u32 => *v as i32,
            _ => default
        }
    }

    pub fn get_f32(&self, name: &str, default: f32) -> f32 {
        match self.props.get(name) {
            Some(PropertyValue::F32(v)) => *v,
            Some(PropertyValue::U32(v)) => *v as f32,
            Some(PropertyValue::I32(v)) => *v as f32,
            _ => default
        }
    }

    pub fn get_string<'a>(&'a self, name: &str, default: &'a str) -> &'a str {
        match self.props.get(name) {
            Some(PropertyValue::String(s)) => s.as_str(),
            _ => default
        }
    }
    /// Returns a string property or an error if it is missing or not a string.
    pub fn require_string(&self, name: &str) -> Result<&str, PropertyError> {
        match self.props.get(name) {
            Some(PropertyValue::String(s)) => Ok(s.as_str()),
            Some(_) => Err(PropertyError::WrongType(name.into())),
            None => Err(PropertyError::Missing(name.into()))
        }
    }
    /// Returns an unsigned property or an error if it is missing or not an unsigned integer.
    pub fn require_u32(&self, name: &str) -> Result<u32, PropertyError> {
        match self.props.get(name) {
            Some(PropertyValue::U32(v)) => Ok(*v),
            Some(_) => Err(PropertyError::WrongType(name.into())),
            None => Err(PropertyError::Missing(name.into()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn property_set_works() {
        let mut ps = PropertySet::new();
        assert!(ps.is_empty());
        ps.set_string("path", "device.atdevice");
        ps.set_bool("hotreload", true);
        ps.set_u32("port", 6522);
        ps.set_i32("pan", -3);
        assert_eq!(ps.get_string("path", ""), "device.atdevice");
        assert_eq!(ps.get_string("nope", "dflt"), "dflt");
        assert!(ps.get_bool("hotreload", false));
        assert!(!ps.get_bool("allowunsafe", false));
        assert_eq!(ps.get_u32("port", 0), 6522);
        assert_eq!(ps.get_u32("pan", 7), 7);
        assert_eq!(ps.get_i32("pan", 0), -3);
        assert_eq!(ps.get_f32("port", 0.0), 6522.0);
        assert_eq!(ps.require_u32("path"), Err(PropertyError::WrongType("path".into())));
        assert_eq!(ps.require_string("host"), Err(PropertyError::Missing("host".into())));
        let keys: Vec<_> = ps.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, ["hotreload", "pan", "path", "port"]);
        assert_eq!(ps.remove("pan"), Some(PropertyValue::I32(-3)));
        assert!(!ps.contains("pan"));
    }

    #[cfg(feature = "snapshot")]
    #[test]
    fn property_set_serde_works() {
        let mut ps = PropertySet::new();
        ps.set_bool("accel", true);
        ps.set_string("host", "localhost");
        let json = serde_json::to_string(&ps).unwrap();
        let ps2: PropertySet = serde_json::from_str(&json).unwrap();
        assert_eq!(ps, ps2);
        let bin = bincode::serialize(&ps).unwrap();
        let ps3: PropertySet = bincode::deserialize(&bin).unwrap();
        assert_eq!(ps, ps3);
    }
}
