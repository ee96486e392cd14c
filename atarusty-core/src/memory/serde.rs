/*
    Copyright (C) 2020-2022  Rafal Michalski

    This file is part of ATARUSTY, a Rust library for building emulators.

    For the full copyright notice, see the lib.rs file.
*/
//! Utilities for serializing byte buffers as base64 strings or just bytes in binary serializers.
//!
//! Use with `#[serde(with = "atarusty_core::memory::serde::bytes")]`.
use core::fmt;
use std::borrow::Cow;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{
    Serializer, Deserialize, Deserializer,
    de::{self, Visitor}
};

pub fn serialize_mem_slice<S>(slice: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where S: Serializer
{
    if serializer.is_human_readable() {
        serializer.serialize_str(&STANDARD.encode(slice))
    }
    else {
        serializer.serialize_bytes(slice)
    }
}

pub fn deserialize_mem_vec<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where D: Deserializer<'de>
{
    if deserializer.is_human_readable() {
        Deserialize::deserialize(deserializer).and_then(|string: Cow<str>|
            STANDARD.decode(&*string).map_err(de::Error::custom)
        )
    }
    else {
        deserializer.deserialize_byte_buf(ByteBufVisitor)
    }
}

struct ByteBufVisitor;

impl<'de> Visitor<'de> for ByteBufVisitor {
    type Value = Vec<u8>;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a byte buffer")
    }

    fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Self::Value, E> {
        Ok(v.to_vec())
    }

    fn visit_byte_buf<E: de::Error>(self, v: Vec<u8>) -> Result<Self::Value, E> {
        Ok(v)
    }

    fn visit_seq<A: de::SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
        let mut res = Vec::with_capacity(seq.size_hint().unwrap_or(0));
        while let Some(b) = seq.next_element()? {
            res.push(b);
        }
        Ok(res)
    }
}

/// `serde(with = ...)` module for `Vec<u8>` fields.
pub mod bytes {
    use serde::{Serializer, Deserializer};

    pub fn serialize<S: Serializer>(v: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        super::serialize_mem_slice(v, serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        super::deserialize_mem_vec(deserializer)
    }
}

#[cfg(test)]
mod tests {
    use serde::{Serialize, Deserialize};

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    struct Buf {
        #[serde(with = "super::bytes")]
        data: Vec<u8>,
    }

    #[test]
    fn bytes_serde_works() {
        let buf = Buf { data: vec![0xDF, 0x00, 0xFE, 0xFF, 0xDC] };
        let json = serde_json::to_string(&buf).unwrap();
        assert_eq!(json, r#"{"data":"3wD+/9w="}"#);
        assert_eq!(serde_json::from_str::<Buf>(&json).unwrap(), buf);
        let bin = bincode::serialize(&buf).unwrap();
        assert_eq!(bincode::deserialize::<Buf>(&bin).unwrap(), buf);
    }
}
