use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;

use crate::Error;

/// A relay query. Collections that are present are never empty: setters
/// given an empty input leave the field unset.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Filter {
    ids: Option<Vec<String>>,
    authors: Option<Vec<String>>,
    kinds: Option<Vec<u64>>,
    since: Option<u64>,
    until: Option<u64>,
    limit: Option<u64>,
    tags: BTreeMap<char, Vec<String>>,
}

fn dedup_nonempty<T: PartialEq>(items: impl IntoIterator<Item = T>) -> Option<Vec<T>> {
    let mut out: Vec<T> = Vec::new();
    for item in items {
        if !out.contains(&item) {
            out.push(item);
        }
    }
    if out.is_empty() {
        None
    } else {
        Some(out)
    }
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Event id prefixes, hex encoded.
    pub fn ids<S: Into<String>>(mut self, ids: impl IntoIterator<Item = S>) -> Self {
        self.ids = dedup_nonempty(ids.into_iter().map(Into::into));
        self
    }

    pub fn authors<S: Into<String>>(mut self, authors: impl IntoIterator<Item = S>) -> Self {
        self.authors = dedup_nonempty(authors.into_iter().map(Into::into));
        self
    }

    pub fn kinds(mut self, kinds: impl IntoIterator<Item = u64>) -> Self {
        self.kinds = dedup_nonempty(kinds);
        self
    }

    pub fn since(mut self, since: u64) -> Self {
        self.since = Some(since);
        self
    }

    pub fn until(mut self, until: u64) -> Self {
        self.until = Some(until);
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Single-letter tag constraint, serialized as `#<tag>`.
    pub fn tag<S: Into<String>>(mut self, tag: char, values: impl IntoIterator<Item = S>) -> Self {
        match dedup_nonempty(values.into_iter().map(Into::into)) {
            Some(values) => {
                self.tags.insert(tag, values);
            }
            None => {
                self.tags.remove(&tag);
            }
        }
        self
    }

    pub fn get_ids(&self) -> Option<&[String]> {
        self.ids.as_deref()
    }

    pub fn get_authors(&self) -> Option<&[String]> {
        self.authors.as_deref()
    }

    pub fn get_kinds(&self) -> Option<&[u64]> {
        self.kinds.as_deref()
    }

    pub fn get_since(&self) -> Option<u64> {
        self.since
    }

    pub fn get_until(&self) -> Option<u64> {
        self.until
    }

    pub fn get_limit(&self) -> Option<u64> {
        self.limit
    }

    pub fn get_tag(&self, tag: char) -> Option<&[String]> {
        self.tags.get(&tag).map(Vec::as_slice)
    }

    pub fn to_json(&self) -> Result<String, Error> {
        serde_json::to_string(self).map_err(Into::into)
    }

    pub fn from_json(s: &str) -> Result<Self, Error> {
        serde_json::from_str(s).map_err(Into::into)
    }
}

impl Serialize for Filter {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(None)?;
        if let Some(ids) = &self.ids {
            map.serialize_entry("ids", ids)?;
        }
        if let Some(authors) = &self.authors {
            map.serialize_entry("authors", authors)?;
        }
        if let Some(kinds) = &self.kinds {
            map.serialize_entry("kinds", kinds)?;
        }
        for (tag, values) in &self.tags {
            map.serialize_entry(&format!("#{tag}"), values)?;
        }
        if let Some(since) = self.since {
            map.serialize_entry("since", &since)?;
        }
        if let Some(until) = self.until {
            map.serialize_entry("until", &until)?;
        }
        if let Some(limit) = self.limit {
            map.serialize_entry("limit", &limit)?;
        }
        map.end()
    }
}

struct FilterVisitor;

impl<'de> Visitor<'de> for FilterVisitor {
    type Value = Filter;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a filter object")
    }

    fn visit_map<A>(self, mut access: A) -> Result<Self::Value, A::Error>
    where
        A: MapAccess<'de>,
    {
        let mut filter = Filter::default();

        while let Some(key) = access.next_key::<String>()? {
            match key.as_str() {
                "ids" => filter = filter.ids(access.next_value::<Vec<String>>()?),
                "authors" => filter = filter.authors(access.next_value::<Vec<String>>()?),
                "kinds" => filter = filter.kinds(access.next_value::<Vec<u64>>()?),
                "since" => filter.since = access.next_value()?,
                "until" => filter.until = access.next_value()?,
                "limit" => filter.limit = access.next_value()?,
                other => {
                    let mut chars = other.chars();
                    match (chars.next(), chars.next(), chars.next()) {
                        (Some('#'), Some(tag), None) => {
                            filter = filter.tag(tag, access.next_value::<Vec<String>>()?);
                        }
                        _ => {
                            access.next_value::<serde::de::IgnoredAny>()?;
                        }
                    }
                }
            }
        }

        Ok(filter)
    }
}

impl<'de> Deserialize<'de> for Filter {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_map(FilterVisitor)
    }
}
