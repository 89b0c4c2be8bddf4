//! Core job, progress and record types shared by the harvest crates.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

pub const CRATE_NAME: &str = "harvest-core";

/// Message carried by the terminal frame of a job cancelled by its owner.
pub const CANCELLED_MESSAGE: &str = "Operation cancelled by user";

/// Opaque job identifier, unique per owner and creation time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// `<principal>-<unix millis>`, the key used for request-created jobs.
    pub fn for_principal(principal_id: &str, created_at: DateTime<Utc>) -> Self {
        Self(format!("{principal_id}-{}", created_at.timestamp_millis()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Parameters a client supplies when starting a harvest. Moved into the
/// execution unit as-is.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StartParameters {
    #[serde(default)]
    pub targets: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<String>,
    #[serde(default)]
    pub options: Map<String, JsonValue>,
}

/// One completed unit of harvested work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HarvestRecord {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    pub captured_at: DateTime<Utc>,
    #[serde(default)]
    pub attributes: Map<String, JsonValue>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Complete,
    Error,
}

/// Progress update for a single job. Chunk frames reuse this shape with
/// `is_chunk` set and the chunk position filled in.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub progress: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Vec<HarvestRecord>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<EventKind>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_chunk: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_chunks: Option<usize>,
}

impl ProgressEvent {
    pub fn at(progress: u8) -> Self {
        Self {
            progress: progress.min(100),
            ..Default::default()
        }
    }

    pub fn with_phase(mut self, phase: impl Into<String>) -> Self {
        self.phase = Some(phase.into());
        self
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    pub fn with_payload(mut self, payload: Vec<HarvestRecord>) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Final event of a successful job, carrying every harvested record.
    pub fn complete(records: Vec<HarvestRecord>) -> Self {
        Self {
            progress: 100,
            status: Some("complete".to_string()),
            payload: Some(records),
            kind: Some(EventKind::Complete),
            ..Default::default()
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            progress: 0,
            error: Some(message.into()),
            kind: Some(EventKind::Error),
            ..Default::default()
        }
    }

    pub fn cancelled() -> Self {
        Self::failed(CANCELLED_MESSAGE)
    }

    pub fn payload_len(&self) -> usize {
        self.payload.as_ref().map(Vec::len).unwrap_or(0)
    }

    /// A frame after which the stream must end.
    pub fn is_terminal(&self) -> bool {
        self.progress >= 100 || self.error.is_some()
    }

    /// Server-sent events wire form: `data: <json>\n\n`.
    pub fn to_sse_frame(&self) -> serde_json::Result<String> {
        Ok(format!("data: {}\n\n", serde_json::to_string(self)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record(id: &str) -> HarvestRecord {
        HarvestRecord {
            id: id.to_string(),
            url: Some(format!("https://example.test/{id}")),
            title: None,
            body: None,
            captured_at: Utc.with_ymd_and_hms(2026, 3, 1, 9, 30, 0).single().unwrap(),
            attributes: Map::new(),
        }
    }

    #[test]
    fn job_id_combines_principal_and_millis() {
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 9, 30, 0).single().unwrap();
        let id = JobId::for_principal("user_42", at);
        assert_eq!(id.as_str(), format!("user_42-{}", at.timestamp_millis()));
        assert_eq!(id.to_string(), id.as_str());
    }

    #[test]
    fn plain_progress_serializes_without_optional_fields() {
        let json = serde_json::to_value(ProgressEvent::at(40).with_phase("scrolling")).unwrap();
        assert_eq!(json, serde_json::json!({"progress": 40, "phase": "scrolling"}));
    }

    #[test]
    fn chunk_fields_use_camel_case() {
        let mut event = ProgressEvent::at(90).with_payload(vec![record("a")]);
        event.is_chunk = true;
        event.chunk_index = Some(1);
        event.total_chunks = Some(3);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["isChunk"], true);
        assert_eq!(json["chunkIndex"], 1);
        assert_eq!(json["totalChunks"], 3);
        assert_eq!(json["payload"][0]["capturedAt"], "2026-03-01T09:30:00Z");
    }

    #[test]
    fn cancellation_event_is_terminal_error() {
        let event = ProgressEvent::cancelled();
        assert!(event.is_terminal());
        assert_eq!(event.progress, 0);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["error"], CANCELLED_MESSAGE);
        assert_eq!(json["type"], "error");
    }

    #[test]
    fn sse_frame_has_data_prefix_and_blank_line() {
        let frame = ProgressEvent::at(10).to_sse_frame().unwrap();
        assert_eq!(frame, "data: {\"progress\":10}\n\n");
    }

    #[test]
    fn progress_is_clamped_and_complete_is_terminal() {
        assert_eq!(ProgressEvent::at(250).progress, 100);
        let done = ProgressEvent::complete(vec![record("a"), record("b")]);
        assert!(done.is_terminal());
        assert_eq!(done.payload_len(), 2);
        assert_eq!(done.kind, Some(EventKind::Complete));
    }
}
