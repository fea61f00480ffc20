//! Decoding configuration file contents into Rust types.
use std::marker::PhantomData;

use serde::de::DeserializeOwned;

/// Decodes a config file's raw bytes into a typed value. Generic so the
/// loader in `lib.rs` is agnostic to the on-disk format.
pub trait ConfigDecoder: Clone {
    type Output: PartialEq + Clone + Send + Sync + 'static;
    fn decode(&self, contents: Vec<u8>) -> anyhow::Result<Self::Output>;
}

/// Simple decoder for reading the config file as a UTF-8 string, useful for
/// tests and for config formats not modeled with `serde`.
#[derive(Copy, Clone)]
pub struct TextDecoder;

impl ConfigDecoder for TextDecoder {
    type Output = String;

    fn decode(&self, contents: Vec<u8>) -> anyhow::Result<String> {
        Ok(String::from_utf8(contents)?)
    }
}

/// Decodes a TOML document into `T` via `serde`.
#[derive(Clone)]
pub struct TomlDecoder<T> {
    _type: PhantomData<T>,
}

impl<T> TomlDecoder<T> {
    pub const fn new() -> Self {
        Self { _type: PhantomData }
    }
}

impl<T> Default for TomlDecoder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: DeserializeOwned + PartialEq + Clone + Send + Sync + 'static> ConfigDecoder
    for TomlDecoder<T>
{
    type Output = T;

    fn decode(&self, contents: Vec<u8>) -> anyhow::Result<T> {
        let contents = std::str::from_utf8(&contents)?;
        Ok(toml::from_str(contents)?)
    }
}
