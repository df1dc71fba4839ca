use std::collections::BTreeMap;

use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde::{
    Deserialize, Deserializer, Serialize, Serializer,
    de::{MapAccess, Visitor},
    ser::SerializeMap,
};
use serde_json::Value;

use crate::{
    error::{Error, Result},
    timestamp::{Timestamp, storage_key},
};

/// Header list that keeps insertion order and original casing while matching names
/// case-insensitively. Serialized as a JSON object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Replaces the value of an existing header (keeping its position and casing) or appends.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self
            .0
            .iter_mut()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(&name))
        {
            Some((_, existing_value)) => *existing_value = value,
            None => self.0.push((name, value)),
        }
    }

    pub fn insert_if_absent(&mut self, name: &str, value: impl Into<String>) {
        if !self.contains(name) {
            self.0.push((name.to_owned(), value.into()));
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        let index = self
            .0
            .iter()
            .position(|(existing, _)| existing.eq_ignore_ascii_case(name))?;
        Some(self.0.remove(index).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = Self::new();
        for (name, value) in iter {
            headers.insert(name, value);
        }
        headers
    }
}

impl Serialize for Headers {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (name, value) in &self.0 {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Headers {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct HeadersVisitor;

        impl<'de> Visitor<'de> for HeadersVisitor {
            type Value = Headers;

            fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str("a map of header names to string values")
            }

            fn visit_map<A: MapAccess<'de>>(
                self,
                mut access: A,
            ) -> std::result::Result<Headers, A::Error> {
                let mut headers = Headers::new();
                while let Some((name, value)) = access.next_entry::<String, String>()? {
                    headers.insert(name, value);
                }
                Ok(headers)
            }
        }

        deserializer.deserialize_map(HeadersVisitor)
    }
}

/// Raw payload as stored: text verbatim, bytes as base64.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredData {
    pub content: String,
    #[serde(default)]
    pub is_base64: bool,
}

impl StoredData {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_base64: false,
        }
    }

    pub fn bytes(content: &[u8]) -> Self {
        Self {
            content: STANDARD.encode(content),
            is_base64: true,
        }
    }

    pub fn decoded(&self) -> Result<Vec<u8>> {
        if self.is_base64 {
            STANDARD
                .decode(&self.content)
                .map_err(|err| Error::decode("base64 request body", err))
        } else {
            Ok(self.content.as_bytes().to_vec())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredFile {
    pub filename: String,
    /// Always base64.
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

impl StoredFile {
    pub fn decoded(&self) -> Result<Vec<u8>> {
        STANDARD
            .decode(&self.content)
            .map_err(|err| Error::decode(format!("base64 content of `{}`", self.filename), err))
    }
}

/// Caller arguments with file contents reduced to filenames and byte bodies dropped.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OriginalArguments {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<Headers>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<(String, String)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub files: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Timestamp>,
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<StoredData>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub files: BTreeMap<String, StoredFile>,
    #[serde(default)]
    pub original_arguments: OriginalArguments,
}

/// Borrowed view of the record body; `json` and `data` never coexist in a saved record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BodyRef<'a> {
    Json(&'a Value),
    Data(&'a StoredData),
    None,
}

impl Record {
    pub fn body(&self) -> BodyRef<'_> {
        match (&self.json, &self.data) {
            (_, Some(data)) => BodyRef::Data(data),
            (Some(json), None) => BodyRef::Json(json),
            (None, None) => BodyRef::None,
        }
    }

    pub fn body_is_encoded(&self) -> bool {
        self.data.as_ref().is_some_and(|data| data.is_base64)
    }

    /// Storage key of a saved record. `None` until a timestamp has been assigned.
    pub fn storage_key(&self) -> Option<String> {
        self.timestamp
            .as_ref()
            .map(|timestamp| storage_key(timestamp, &self.id))
    }

    pub fn to_json_pretty(&self) -> Result<Vec<u8>> {
        serde_json::to_vec_pretty(self)
            .map_err(|err| Error::decode(format!("serialize record `{}`", self.id), err))
    }

    pub fn from_json_slice(bytes: &[u8], source: &str) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|err| Error::decode(format!("record {source}"), err))
    }
}
