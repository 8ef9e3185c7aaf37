// 📡 Data Model - Sources, readings and query records
//
// A Source has two identities:
// - internal_id: assigned by the store, used for joins, never leaves the core
// - public_id:   UUID handed to callers at registration
// and an optional short_id mnemonic for humans.

use serde::{Deserialize, Serialize};

// ============================================================================
// SOURCE
// ============================================================================

/// A registered data origin as persisted in the store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub internal_id: i64,
    pub public_id: String,
    pub short_id: Option<String>,
    pub display_name: String,
    pub type_tag: i64,
    /// Divisor consumers apply to recover fractional values
    pub accuracy: i64,
    pub parameters: String,
}

impl Source {
    /// Projection handed to callers outside the core
    pub fn view(&self) -> SourceView {
        SourceView {
            public_id: self.public_id.clone(),
            short_id: self.short_id.clone(),
            display_name: self.display_name.clone(),
            type_tag: self.type_tag,
            accuracy: self.accuracy,
            parameters: self.parameters.clone(),
        }
    }
}

/// Registration request for a new source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewSource {
    pub display_name: String,
    pub type_tag: i64,
    #[serde(default)]
    pub short_id: Option<String>,
    #[serde(default = "default_accuracy")]
    pub accuracy: i64,
    #[serde(default)]
    pub parameters: String,
}

fn default_accuracy() -> i64 {
    1
}

impl NewSource {
    pub fn new(display_name: impl Into<String>, type_tag: i64) -> Self {
        NewSource {
            display_name: display_name.into(),
            type_tag,
            short_id: None,
            accuracy: default_accuracy(),
            parameters: String::new(),
        }
    }

    pub fn with_short_id(mut self, short_id: impl Into<String>) -> Self {
        self.short_id = Some(short_id.into());
        self
    }

    pub fn with_accuracy(mut self, accuracy: i64) -> Self {
        self.accuracy = accuracy;
        self
    }

    pub fn with_parameters(mut self, parameters: impl Into<String>) -> Self {
        self.parameters = parameters.into();
        self
    }

    /// Attach the identities assigned during registration
    pub fn into_source(self, internal_id: i64, public_id: String) -> Source {
        Source {
            internal_id,
            public_id,
            short_id: self.short_id,
            display_name: self.display_name,
            type_tag: self.type_tag,
            accuracy: self.accuracy,
            parameters: self.parameters,
        }
    }
}

/// Source as seen by clients (no internal id)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceView {
    #[serde(rename = "uuid")]
    pub public_id: String,
    #[serde(rename = "sid", skip_serializing_if = "Option::is_none")]
    pub short_id: Option<String>,
    #[serde(rename = "name")]
    pub display_name: String,
    #[serde(rename = "type")]
    pub type_tag: i64,
    pub accuracy: i64,
    pub parameters: String,
}

// ============================================================================
// READINGS
// ============================================================================

/// Most recent reading of a source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Latest {
    pub value: i64,
    #[serde(rename = "ts")]
    pub timestamp: i64,
}

/// One output row of a query: a raw reading or one aggregated bucket
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    #[serde(rename = "uuid")]
    pub source: String,
    /// Reading time, or bucket start when aggregated
    #[serde(rename = "ts")]
    pub timestamp: i64,
    pub value: i64,
}
