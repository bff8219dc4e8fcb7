//! Read model of recorded traces and observations.
//!
//! Only the fields the converter needs are modelled. The storage layer owns
//! these records; nothing in this crate writes them back.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Severity level of a trace or observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Level {
    Debug,
    #[default]
    Default,
    Warning,
    Error,
}

/// Kind of observation inside a trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ObservationType {
    #[default]
    Span,
    Generation,
    Event,
}

impl ObservationType {
    pub fn as_str(self) -> &'static str {
        match self {
            ObservationType::Span => "SPAN",
            ObservationType::Generation => "GENERATION",
            ObservationType::Event => "EVENT",
        }
    }
}

/// A recorded trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceRecord {
    pub id: String,
    pub project_id: Uuid,
    pub name: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    /// Raw JSON object as stored
    #[serde(default)]
    pub metadata: Option<String>,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_ms: f64,
    #[serde(default)]
    pub level: Level,
    #[serde(default)]
    pub status_message: Option<String>,
    #[serde(default)]
    pub total_cost: f64,
}

/// A recorded observation (span, generation or event) within a trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObservationRecord {
    pub id: String,
    pub trace_id: String,
    #[serde(default)]
    pub parent_observation_id: Option<String>,
    #[serde(rename = "type")]
    pub observation_type: ObservationType,
    pub name: String,
    #[serde(default)]
    pub level: Level,
    #[serde(default)]
    pub status_message: Option<String>,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completion_start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_ms: f64,
    #[serde(default)]
    pub model: Option<String>,
    /// Raw JSON object as stored, may be malformed
    #[serde(default)]
    pub model_parameters: Option<String>,
    #[serde(default)]
    pub usage_details: UsageDetails,
    #[serde(default)]
    pub cost_details: CostDetails,
}

/// Token usage of a generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageDetails {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

/// Cost of an observation.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CostDetails {
    pub input_cost: f64,
    pub output_cost: f64,
    pub total_cost: f64,
    #[serde(default)]
    pub currency: Option<String>,
}

impl TraceRecord {
    /// Creates a trace starting now with no optional fields set.
    pub fn new(id: impl Into<String>, project_id: Uuid, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            project_id,
            name: name.into(),
            user_id: None,
            session_id: None,
            metadata: None,
            start_time: Utc::now(),
            end_time: None,
            duration_ms: 0.0,
            level: Level::Default,
            status_message: None,
            total_cost: 0.0,
        }
    }
}

impl ObservationRecord {
    /// Creates an observation of the given type starting now.
    pub fn new(
        id: impl Into<String>,
        trace_id: impl Into<String>,
        observation_type: ObservationType,
        name: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            trace_id: trace_id.into(),
            parent_observation_id: None,
            observation_type,
            name: name.into(),
            level: Level::Default,
            status_message: None,
            start_time: Utc::now(),
            end_time: None,
            completion_start_time: None,
            duration_ms: 0.0,
            model: None,
            model_parameters: None,
            usage_details: UsageDetails::default(),
            cost_details: CostDetails::default(),
        }
    }

    pub fn is_generation(&self) -> bool {
        self.observation_type == ObservationType::Generation
    }
}
