//! Condition model: a single named status assertion and an ordered, type-keyed set of them.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use smallvec::SmallVec;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

impl ConditionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConditionStatus::True => "True",
            ConditionStatus::False => "False",
            ConditionStatus::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

impl From<bool> for ConditionStatus {
    fn from(v: bool) -> Self { if v { ConditionStatus::True } else { ConditionStatus::False } }
}

impl FromStr for ConditionStatus {
    type Err = crate::CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "True" => Ok(ConditionStatus::True),
            "False" => Ok(ConditionStatus::False),
            "Unknown" => Ok(ConditionStatus::Unknown),
            other => Err(crate::CoreError::InvalidStatus(other.to_string())),
        }
    }
}

/// A single condition as it appears in `status.conditions`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: ConditionStatus,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub observed_generation: i64,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "rfc3339_secs")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

fn is_zero(v: &i64) -> bool { *v == 0 }

impl Condition {
    pub fn new(type_: impl Into<String>, status: impl Into<ConditionStatus>) -> Self {
        Self {
            type_: type_.into(),
            status: status.into(),
            reason: String::new(),
            message: String::new(),
            observed_generation: 0,
            last_transition_time: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self { self.reason = reason.into(); self }
    pub fn with_message(mut self, message: impl Into<String>) -> Self { self.message = message.into(); self }
    pub fn with_observed_generation(mut self, generation: i64) -> Self { self.observed_generation = generation; self }
    pub fn with_transition_time(mut self, ts: DateTime<Utc>) -> Self { self.last_transition_time = Some(ts); self }

    /// True when both conditions assert the same thing; transition time is ignored.
    pub fn same_assertion(&self, other: &Condition) -> bool {
        self.type_ == other.type_
            && self.status == other.status
            && self.reason == other.reason
            && self.message == other.message
            && self.observed_generation == other.observed_generation
    }
}

/// Ordered set of conditions, unique by `type`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConditionSet {
    items: SmallVec<[Condition; 4]>,
}

impl ConditionSet {
    pub fn new() -> Self { Self::default() }

    pub fn len(&self) -> usize { self.items.len() }
    pub fn is_empty(&self) -> bool { self.items.is_empty() }

    /// Insert or replace in place; returns the previous condition of the same type.
    pub fn insert(&mut self, cond: Condition) -> Option<Condition> {
        match self.items.iter_mut().find(|c| c.type_ == cond.type_) {
            Some(slot) => Some(std::mem::replace(slot, cond)),
            None => {
                self.items.push(cond);
                None
            }
        }
    }

    pub fn get(&self, type_: &str) -> Option<&Condition> {
        self.items.iter().find(|c| c.type_ == type_)
    }

    pub fn remove(&mut self, type_: &str) -> Option<Condition> {
        let idx = self.items.iter().position(|c| c.type_ == type_)?;
        Some(self.items.remove(idx))
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Condition> { self.items.iter() }

    pub fn types(&self) -> impl Iterator<Item = &str> + '_ { self.items.iter().map(|c| c.type_.as_str()) }

    /// Order-insensitive comparison of what both sets assert.
    pub fn same_assertions(&self, other: &ConditionSet) -> bool {
        self.len() == other.len()
            && self
                .items
                .iter()
                .all(|c| other.get(&c.type_).map(|o| c.same_assertion(o)).unwrap_or(false))
    }
}

impl FromIterator<Condition> for ConditionSet {
    fn from_iter<I: IntoIterator<Item = Condition>>(iter: I) -> Self {
        let mut set = ConditionSet::new();
        for c in iter { set.insert(c); }
        set
    }
}

impl IntoIterator for ConditionSet {
    type Item = Condition;
    type IntoIter = smallvec::IntoIter<[Condition; 4]>;
    fn into_iter(self) -> Self::IntoIter { self.items.into_iter() }
}

impl<'a> IntoIterator for &'a ConditionSet {
    type Item = &'a Condition;
    type IntoIter = std::slice::Iter<'a, Condition>;
    fn into_iter(self) -> Self::IntoIter { self.items.iter() }
}

impl Serialize for ConditionSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.items.iter())
    }
}

impl<'de> Deserialize<'de> for ConditionSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Vec::<Condition>::deserialize(deserializer)?;
        Ok(raw.into_iter().collect())
    }
}

/// metav1.Time wire format: RFC3339, whole seconds, `Z` suffix.
mod rfc3339_secs {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &Option<DateTime<Utc>>, s: S) -> Result<S::Ok, S::Error> {
        match v {
            Some(ts) => s.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::Secs, true)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<DateTime<Utc>>, D::Error> {
        let raw: Option<String> = Option::deserialize(d)?;
        match raw.as_deref() {
            None | Some("") => Ok(None),
            Some(s) => DateTime::parse_from_rfc3339(s)
                .map(|dt| Some(dt.with_timezone(&Utc)))
                .map_err(serde::de::Error::custom),
        }
    }
}
