//! Field addressing for capability declarations

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// A readable/writable region of the workflow state
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    History,
    TaskQueue,
    Results,
    Status,
    /// A single metadata key
    Metadata(String),
    /// Every metadata key
    AnyMetadata,
}

impl Field {
    pub fn metadata(key: impl Into<String>) -> Self {
        Self::Metadata(key.into())
    }

    /// Whether two declarations can address the same data
    pub fn overlaps(&self, other: &Field) -> bool {
        match (self, other) {
            (Self::Metadata(a), Self::Metadata(b)) => a == b,
            (Self::AnyMetadata, Self::Metadata(_))
            | (Self::Metadata(_), Self::AnyMetadata)
            | (Self::AnyMetadata, Self::AnyMetadata) => true,
            (a, b) => a == b,
        }
    }

    /// Whether this declaration permits touching `touched`
    pub fn covers(&self, touched: &Field) -> bool {
        match (self, touched) {
            (Self::AnyMetadata, Self::Metadata(_)) => true,
            (a, b) => a == b,
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::History => f.write_str("history"),
            Self::TaskQueue => f.write_str("task_queue"),
            Self::Results => f.write_str("results"),
            Self::Status => f.write_str("status"),
            Self::Metadata(key) => write!(f, "metadata.{}", key),
            Self::AnyMetadata => f.write_str("metadata.*"),
        }
    }
}

/// A set of fields, as declared by a node or task handler
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSet(BTreeSet<Field>);

impl FieldSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every field of the state
    pub fn all() -> Self {
        [
            Field::History,
            Field::TaskQueue,
            Field::Results,
            Field::Status,
            Field::AnyMetadata,
        ]
        .into_iter()
        .collect()
    }

    pub fn with(mut self, field: Field) -> Self {
        self.0.insert(field);
        self
    }

    pub fn insert(&mut self, field: Field) {
        self.0.insert(field);
    }

    pub fn extend(&mut self, other: &FieldSet) {
        self.0.extend(other.0.iter().cloned());
    }

    /// Whether the set permits touching `field`
    pub fn permits(&self, field: &Field) -> bool {
        self.0.iter().any(|declared| declared.covers(field))
    }

    /// Fields of `self` that overlap any field of `other`
    pub fn overlap(&self, other: &FieldSet) -> Vec<Field> {
        self.0
            .iter()
            .filter(|a| other.0.iter().any(|b| a.overlaps(b)))
            .cloned()
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Field> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl FromIterator<Field> for FieldSet {
    fn from_iter<I: IntoIterator<Item = Field>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl fmt::Display for FieldSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self.0.iter().map(|field| field.to_string()).collect();
        write!(f, "{{{}}}", names.join(", "))
    }
}
