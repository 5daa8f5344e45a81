//! Gateway WebSocket protocol: JSON messages between clients and the server

use ballot_core::{AnswerRequest, Partition, PipelineEvent, SizeClass};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Client → Gateway request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayRequest {
    pub method: String,
    #[serde(default)]
    pub params: Value,
    /// Optional request ID for correlating responses
    #[serde(default)]
    pub id: Option<String>,
}

/// Gateway → Client response (to a specific request)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayResponse {
    /// Echoed from the request
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<GatewayError>,
}

/// Error in a gateway response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayError {
    pub code: i32,
    pub message: String,
}

/// Gateway → Client event (no request ID at the envelope level)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayEvent {
    pub event: String,
    pub data: Value,
}

// ── Well-known methods ──

/// Methods the client can call
pub mod methods {
    pub const QUESTION_ASK: &str = "question.ask";
    pub const ANSWER_CANCEL: &str = "answer.cancel";
    pub const STATUS_GET: &str = "status.get";
    pub const PROVIDERS_HEALTH: &str = "providers.health";
}

/// Events the server sends
pub mod events {
    pub const SOURCES_READY: &str = "sources.ready";
    pub const ANSWER_CHUNK: &str = "answer.chunk";
    pub const ANSWER_COMPLETE: &str = "answer.complete";
    pub const PROVIDER_HEALTH: &str = "provider.health";
}

// ── Error codes ──

pub const ERR_INVALID_METHOD: i32 = -32601;
pub const ERR_INVALID_PARAMS: i32 = -32602;
pub const ERR_INTERNAL: i32 = -32603;

impl GatewayResponse {
    pub fn ok(id: Option<String>, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: Option<String>, code: i32, message: impl Into<String>) -> Self {
        Self {
            id,
            result: None,
            error: Some(GatewayError {
                code,
                message: message.into(),
            }),
        }
    }
}

impl GatewayEvent {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }
}

impl From<&PipelineEvent> for GatewayEvent {
    fn from(event: &PipelineEvent) -> Self {
        let data = match event {
            PipelineEvent::SourcesReady {
                request_id,
                documents,
            } => serde_json::json!({
                "request_id": request_id,
                "documents": documents,
            }),
            PipelineEvent::Chunk(chunk) => serde_json::to_value(chunk).unwrap_or_default(),
        };
        Self::new(event.name(), data)
    }
}

/// Upper bound on matches fetched per partition for one client request
pub const MAX_TOP_K: usize = 50;
/// Upper bound on sources passed to the answer prompt for one client request
pub const MAX_SOURCES: usize = 20;

/// Params of `question.ask`
#[derive(Debug, Clone, Deserialize)]
pub struct AskParams {
    pub question: String,
    /// `collection:namespace` pairs
    pub partitions: Vec<String>,
    #[serde(default)]
    pub size: Option<SizeClass>,
    #[serde(default)]
    pub premium: bool,
    #[serde(default)]
    pub top_k: Option<usize>,
    #[serde(default)]
    pub max_sources: Option<usize>,
}

impl AskParams {
    /// Validate and turn into a pipeline request with a fresh id
    pub fn into_request(self) -> Result<AnswerRequest, String> {
        let question = self.question.trim();
        if question.is_empty() {
            return Err("Missing or empty 'question' parameter".to_string());
        }

        let mut partitions = Vec::with_capacity(self.partitions.len());
        for raw in &self.partitions {
            let partition = Partition::parse(raw)
                .ok_or_else(|| format!("Invalid partition '{}', expected collection:namespace", raw))?;
            partitions.push(partition);
        }
        if partitions.is_empty() {
            return Err("At least one partition is required".to_string());
        }

        let mut request = AnswerRequest::new(question, partitions)
            .with_size(self.size.unwrap_or(SizeClass::Small))
            .with_premium(self.premium);
        if let Some(top_k) = self.top_k {
            request = request.with_top_k(top_k.clamp(1, MAX_TOP_K));
        }
        if let Some(max_sources) = self.max_sources {
            request = request.with_max_sources(max_sources.min(MAX_SOURCES));
        }
        Ok(request)
    }
}

/// Params of `answer.cancel`
#[derive(Debug, Clone, Deserialize)]
pub struct CancelParams {
    pub request_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use ballot_core::ChunkEvent;

    #[test]
    fn test_request_deserialize() {
        let json = r#"{"method":"question.ask","params":{"question":"hello","partitions":["programs:greens"]}}"#;
        let req: GatewayRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.method, "question.ask");
        assert_eq!(req.params["question"], "hello");
        assert!(req.id.is_none());
    }

    #[test]
    fn test_request_with_id() {
        let json = r#"{"method":"status.get","params":{},"id":"req_1"}"#;
        let req: GatewayRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.id.as_deref(), Some("req_1"));
    }

    #[test]
    fn test_response_ok() {
        let resp = GatewayResponse::ok(Some("req_1".to_string()), serde_json::json!({"status": "ok"}));
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains("\"result\""));
        assert!(!json.contains("\"error\""));
    }

    #[test]
    fn test_response_err() {
        let resp = GatewayResponse::err(Some("req_2".to_string()), ERR_INVALID_METHOD, "unknown method");
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains("\"error\""));
        assert!(json.contains("-32601"));
        assert!(!json.contains("\"result\""));
    }

    #[test]
    fn test_chunk_event_conversion() {
        let chunk = PipelineEvent::Chunk(ChunkEvent::partial("r1", 4, "rail".to_string()));
        let evt = GatewayEvent::from(&chunk);
        assert_eq!(evt.event, events::ANSWER_CHUNK);
        assert_eq!(evt.data["seq"], 4);
        assert_eq!(evt.data["request_id"], "r1");

        let sources = PipelineEvent::SourcesReady {
            request_id: "r1".to_string(),
            documents: vec![],
        };
        let evt = GatewayEvent::from(&sources);
        assert_eq!(evt.event, events::SOURCES_READY);
        assert!(evt.data["documents"].as_array().unwrap().is_empty());
    }

    #[test]
    fn test_ask_params_into_request() {
        let params: AskParams = serde_json::from_value(serde_json::json!({
            "question": "  Rent caps? ",
            "partitions": ["programs:greens", "votes:greens"],
            "size": "large",
            "premium": true,
            "top_k": 3
        }))
        .unwrap();
        let request = params.into_request().unwrap();
        assert_eq!(request.question, "Rent caps?");
        assert_eq!(request.partitions.len(), 2);
        assert_eq!(request.size, SizeClass::Large);
        assert!(request.premium);
        assert_eq!(request.top_k, Some(3));
        assert!(request.max_sources.is_none());
    }

    #[test]
    fn test_ask_params_rejects_bad_input() {
        let bad_partition: AskParams = serde_json::from_value(serde_json::json!({
            "question": "q",
            "partitions": ["greens"]
        }))
        .unwrap();
        assert!(bad_partition.into_request().unwrap_err().contains("greens"));

        let empty: AskParams = serde_json::from_value(serde_json::json!({
            "question": " ",
            "partitions": ["programs:greens"]
        }))
        .unwrap();
        assert!(empty.into_request().is_err());

        let none: AskParams = serde_json::from_value(serde_json::json!({
            "question": "q",
            "partitions": []
        }))
        .unwrap();
        assert!(none.into_request().is_err());
    }

    #[test]
    fn test_ask_params_clamps_limits() {
        let huge: AskParams = serde_json::from_value(serde_json::json!({
            "question": "q",
            "partitions": ["programs:greens"],
            "top_k": 1_000_000,
            "max_sources": 1_000_000
        }))
        .unwrap();
        let request = huge.into_request().unwrap();
        assert_eq!(request.top_k, Some(MAX_TOP_K));
        assert_eq!(request.max_sources, Some(MAX_SOURCES));

        let zero: AskParams = serde_json::from_value(serde_json::json!({
            "question": "q",
            "partitions": ["programs:greens"],
            "top_k": 0,
            "max_sources": 0
        }))
        .unwrap();
        let request = zero.into_request().unwrap();
        assert_eq!(request.top_k, Some(1));
        assert_eq!(request.max_sources, Some(0));
    }
}
