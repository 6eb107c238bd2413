//! Core domain model, ingestion coercion and competition ranking for hitrank.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "hitrank-core";

/// Column widths of `players.player_name` and `players.bats`.
pub const MAX_PLAYER_NAME_CHARS: usize = 80;
pub const MAX_BATS_CHARS: usize = 1;

/// Persisted season line for one player, keyed by the upstream id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub id: i64,
    pub rank: i32,
    pub player_name: String,
    pub age: i32,
    pub hits: i32,
    pub year: i32,
    pub bats: String,
    pub description: Option<String>,
}

impl Record {
    /// Build a record from a coerced upstream line with its batch rank.
    pub fn from_line(line: SeasonLine, rank: i32, description: Option<String>) -> Self {
        Self {
            id: line.id,
            rank,
            player_name: line.player_name,
            age: line.age,
            hits: line.hits,
            year: line.year,
            bats: line.bats,
            description,
        }
    }

    /// `None` and the empty string are both treated as "no description yet".
    pub fn has_description(&self) -> bool {
        self.description
            .as_deref()
            .is_some_and(|d| !d.trim().is_empty())
    }

    pub fn subject(&self) -> DescriptionSubject {
        DescriptionSubject {
            player_name: self.player_name.clone(),
            hits: self.hits,
            year: self.year,
            age: self.age,
            bats: self.bats.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("field `{field}` is not an integer: {value:?}")]
    InvalidNumber { field: &'static str, value: String },
    #[error("field `{field}` is out of range: {value}")]
    OutOfRange { field: &'static str, value: i64 },
    #[error("Missing required fields: {}", .0.join(", "))]
    MissingFields(Vec<&'static str>),
    #[error("field `{field}` is {len} characters long; at most {max} allowed")]
    TooLong {
        field: &'static str,
        max: usize,
        len: usize,
    },
}

fn bounded_text(field: &'static str, value: &str, max: usize) -> Result<String, ValidationError> {
    let value = value.trim();
    let len = value.chars().count();
    if len > max {
        return Err(ValidationError::TooLong { field, max, len });
    }
    Ok(value.to_string())
}

/// Integer that upstream payloads may send as a JSON number or a numeric string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LooseInt {
    Int(i64),
    Float(f64),
    Text(String),
}

impl LooseInt {
    pub fn coerce_i64(&self, field: &'static str) -> Result<i64, ValidationError> {
        match self {
            LooseInt::Int(v) => Ok(*v),
            LooseInt::Float(v) if v.fract() == 0.0 && v.is_finite() => Ok(*v as i64),
            LooseInt::Float(v) => Err(ValidationError::InvalidNumber {
                field,
                value: v.to_string(),
            }),
            LooseInt::Text(text) => {
                text.trim()
                    .parse::<i64>()
                    .map_err(|_| ValidationError::InvalidNumber {
                        field,
                        value: text.clone(),
                    })
            }
        }
    }

    pub fn coerce_i32(&self, field: &'static str) -> Result<i32, ValidationError> {
        let value = self.coerce_i64(field)?;
        i32::try_from(value).map_err(|_| ValidationError::OutOfRange { field, value })
    }

    /// Coerce to a count: an `i32` that must not be negative.
    pub fn coerce_count(&self, field: &'static str) -> Result<i32, ValidationError> {
        let value = self.coerce_i32(field)?;
        if value < 0 {
            return Err(ValidationError::OutOfRange {
                field,
                value: value.into(),
            });
        }
        Ok(value)
    }
}

impl From<i64> for LooseInt {
    fn from(value: i64) -> Self {
        LooseInt::Int(value)
    }
}

impl From<&str> for LooseInt {
    fn from(value: &str) -> Self {
        LooseInt::Text(value.to_string())
    }
}

/// Loosely typed record as served by the upstream hit-leaders feed.
///
/// Extra upstream fields (including its own `Rank`) are ignored; rank is always
/// derived locally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub id: LooseInt,
    #[serde(rename = "Player")]
    pub player: String,
    #[serde(rename = "Hits")]
    pub hits: LooseInt,
    #[serde(rename = "Year")]
    pub year: LooseInt,
    #[serde(rename = "AgeThatYear")]
    pub age_that_year: LooseInt,
    #[serde(rename = "Bats")]
    pub bats: String,
}

impl RawRecord {
    pub fn coerce(&self) -> Result<SeasonLine, ValidationError> {
        Ok(SeasonLine {
            id: self.id.coerce_i64("id")?,
            player_name: bounded_text("Player", &self.player, MAX_PLAYER_NAME_CHARS)?,
            hits: self.hits.coerce_count("Hits")?,
            year: self.year.coerce_i32("Year")?,
            age: self.age_that_year.coerce_count("AgeThatYear")?,
            bats: bounded_text("Bats", &self.bats, MAX_BATS_CHARS)?,
        })
    }
}

/// Typed upstream line, produced once at the ingestion boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeasonLine {
    pub id: i64,
    pub player_name: String,
    pub hits: i32,
    pub year: i32,
    pub age: i32,
    pub bats: String,
}

impl SeasonLine {
    pub fn subject(&self) -> DescriptionSubject {
        DescriptionSubject {
            player_name: self.player_name.clone(),
            hits: self.hits,
            year: self.year,
            age: self.age,
            bats: self.bats.clone(),
        }
    }
}

/// Partial update for the edit path. Absent fields keep their stored value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordPatch {
    #[serde(default)]
    pub player_name: Option<String>,
    #[serde(default)]
    pub age: Option<LooseInt>,
    #[serde(default)]
    pub hits: Option<LooseInt>,
    #[serde(default)]
    pub year: Option<LooseInt>,
    #[serde(default)]
    pub bats: Option<String>,
}

impl RecordPatch {
    /// Apply onto `record`. Either every present field is applied or, on a
    /// coercion error, the record is left unchanged.
    pub fn apply_to(&self, record: &mut Record) -> Result<(), ValidationError> {
        let age = self.age.as_ref().map(|v| v.coerce_count("age")).transpose()?;
        let hits = self.hits.as_ref().map(|v| v.coerce_count("hits")).transpose()?;
        let year = self.year.as_ref().map(|v| v.coerce_i32("year")).transpose()?;
        let player_name = self
            .player_name
            .as_deref()
            .map(|v| bounded_text("player_name", v, MAX_PLAYER_NAME_CHARS))
            .transpose()?;
        let bats = self
            .bats
            .as_deref()
            .map(|v| bounded_text("bats", v, MAX_BATS_CHARS))
            .transpose()?;

        if let Some(name) = player_name {
            record.player_name = name;
        }
        if let Some(age) = age {
            record.age = age;
        }
        if let Some(hits) = hits {
            record.hits = hits;
        }
        if let Some(year) = year {
            record.year = year;
        }
        if let Some(bats) = bats {
            record.bats = bats;
        }
        Ok(())
    }
}

/// Structured input handed to the description generator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescriptionSubject {
    pub player_name: String,
    pub hits: i32,
    pub year: i32,
    pub age: i32,
    pub bats: String,
}

/// Body of a direct description request; every field is required.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DescriptionRequest {
    #[serde(default)]
    pub player_name: Option<String>,
    #[serde(default)]
    pub hits: Option<LooseInt>,
    #[serde(default)]
    pub year: Option<LooseInt>,
    #[serde(default)]
    pub age: Option<LooseInt>,
    #[serde(default)]
    pub bats: Option<String>,
}

impl DescriptionRequest {
    pub fn into_subject(self) -> Result<DescriptionSubject, ValidationError> {
        let mut missing = Vec::new();
        if self.player_name.is_none() {
            missing.push("player_name");
        }
        if self.hits.is_none() {
            missing.push("hits");
        }
        if self.year.is_none() {
            missing.push("year");
        }
        if self.age.is_none() {
            missing.push("age");
        }
        if self.bats.is_none() {
            missing.push("bats");
        }
        let (Some(player_name), Some(hits), Some(year), Some(age), Some(bats)) =
            (self.player_name, self.hits, self.year, self.age, self.bats)
        else {
            return Err(ValidationError::MissingFields(missing));
        };

        Ok(DescriptionSubject {
            player_name,
            hits: hits.coerce_count("hits")?,
            year: year.coerce_i32("year")?,
            age: age.coerce_count("age")?,
            bats,
        })
    }
}

/// Competition ranks ("1224" ranking) for a sequence already sorted by
/// descending metric.
///
/// The first item gets rank 1. An item whose metric equals its predecessor's
/// shares that rank; otherwise its rank is its 1-based position. The input is
/// not sorted here.
pub fn competition_ranks<T, K, F>(items: &[T], metric: F) -> Vec<i32>
where
    K: PartialEq,
    F: Fn(&T) -> K,
{
    let mut ranks = Vec::with_capacity(items.len());
    let mut previous: Option<K> = None;
    let mut current = 0i32;
    for (idx, item) in items.iter().enumerate() {
        let value = metric(item);
        if previous.as_ref() != Some(&value) {
            current = i32::try_from(idx + 1).unwrap_or(i32::MAX);
        }
        ranks.push(current);
        previous = Some(value);
    }
    ranks
}

/// Stable sort by descending metric; ties keep their input order.
pub fn sort_by_metric_desc<T, K, F>(items: &mut [T], metric: F)
where
    K: Ord,
    F: Fn(&T) -> K,
{
    items.sort_by(|a, b| metric(b).cmp(&metric(a)));
}
