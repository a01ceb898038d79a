//! Parsing and sanitising analysis-service replies.
//!
//! Replies are model output: maybe fenced in markdown, maybe missing fields,
//! maybe with numbers as strings. Anything that is not JSON at all is a
//! [`ModerationError::MalformedResponse`]; anything that is JSON is coerced
//! into range with defaults.

use ai_client::strip_code_blocks;
use serde_json::{Map, Value};

use crowdmind_common::{AnalysisStatus, CommentAnalysis, FactualAccuracy, ModerationError};

/// Relevance assumed when a batch result omits its score.
pub const DEFAULT_RELEVANCE: u8 = 50;

fn parse_json(raw: &str) -> Result<Value, ModerationError> {
    serde_json::from_str(strip_code_blocks(raw))
        .map_err(|e| ModerationError::MalformedResponse(e.to_string()))
}

fn relevance(value: Option<&Value>) -> Option<u8> {
    let score = match value? {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    if !score.is_finite() {
        return None;
    }
    Some(score.round().clamp(1.0, 100.0) as u8)
}

fn flag(value: Option<&Value>) -> Option<bool> {
    match value? {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" => Some(true),
            "false" | "no" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// First non-empty string among `keys`.
fn text(obj: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|k| obj.get(*k).and_then(Value::as_str))
        .map(str::trim)
        .find(|s| !s.is_empty())
        .map(str::to_string)
}

fn looks_like_analysis(obj: &Map<String, Value>) -> bool {
    ["relevance_score", "has_factual_claims", "factual_accuracy"]
        .iter()
        .any(|k| obj.contains_key(*k))
}

// ---------------------------------------------------------------------------
// Batch
// ---------------------------------------------------------------------------

/// One positional result from a batch reply.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchResult {
    pub relevance_score: u8,
    pub has_factual_claims: bool,
    pub factual_accuracy: FactualAccuracy,
    pub notes: String,
}

impl BatchResult {
    fn from_object(obj: &Map<String, Value>) -> Self {
        Self {
            relevance_score: relevance(obj.get("relevance_score")).unwrap_or(DEFAULT_RELEVANCE),
            has_factual_claims: flag(obj.get("has_factual_claims")).unwrap_or(false),
            factual_accuracy: FactualAccuracy::normalize(
                obj.get("factual_accuracy").and_then(Value::as_str),
            ),
            notes: text(obj, &["analysis_notes", "findings", "analysis"]).unwrap_or_default(),
        }
    }

    /// The completed analysis this result writes onto its comment.
    pub fn to_analysis(&self) -> CommentAnalysis {
        CommentAnalysis {
            relevance_score: Some(self.relevance_score),
            relevance_status: AnalysisStatus::Completed,
            fact_check_status: AnalysisStatus::Completed,
            has_factual_claims: self.has_factual_claims,
            factual_accuracy: Some(self.factual_accuracy),
            notes: self.notes.clone(),
        }
    }
}

/// Parse a batch reply into results parallel to the request.
///
/// Accepts `{"comments": [...]}`, a bare array, or a single analysis object
/// (a batch of one). Positions the reply does not cover, or covers with
/// something other than an object, come back as `None`.
pub fn parse_batch(raw: &str, expected: usize) -> Result<Vec<Option<BatchResult>>, ModerationError> {
    let value = parse_json(raw)?;

    let items: Vec<Value> = match value {
        Value::Array(items) => items,
        Value::Object(mut obj) => match obj.remove("comments") {
            Some(Value::Array(items)) => items,
            Some(other) => {
                return Err(ModerationError::MalformedResponse(format!(
                    "\"comments\" is not an array: {other}"
                )))
            }
            None if looks_like_analysis(&obj) => vec![Value::Object(obj)],
            None => {
                return Err(ModerationError::MalformedResponse(
                    "reply has no \"comments\" array".to_string(),
                ))
            }
        },
        other => {
            return Err(ModerationError::MalformedResponse(format!(
                "unexpected reply shape: {other}"
            )))
        }
    };

    Ok((0..expected)
        .map(|i| items.get(i).and_then(Value::as_object).map(BatchResult::from_object))
        .collect())
}

// ---------------------------------------------------------------------------
// Single-comment checks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct RelevanceVerdict {
    pub score: u8,
    pub reason: String,
}

pub fn parse_relevance(raw: &str) -> Result<RelevanceVerdict, ModerationError> {
    let value = parse_json(raw)?;
    let obj = value
        .as_object()
        .ok_or_else(|| ModerationError::MalformedResponse("relevance reply is not an object".into()))?;

    let score = relevance(obj.get("relevance_score")).ok_or_else(|| {
        ModerationError::MalformedResponse("relevance reply has no usable relevance_score".into())
    })?;

    Ok(RelevanceVerdict {
        score,
        reason: text(obj, &["analysis", "reason", "verdict"])
            .unwrap_or_else(|| "No reason given".to_string()),
    })
}

#[derive(Debug, Clone, PartialEq)]
pub struct FactCheckVerdict {
    pub has_factual_claims: bool,
    pub accuracy: FactualAccuracy,
    pub findings: String,
    pub flags: Vec<String>,
}

pub fn parse_fact_check(raw: &str) -> Result<FactCheckVerdict, ModerationError> {
    let value = parse_json(raw)?;
    let obj = value
        .as_object()
        .ok_or_else(|| ModerationError::MalformedResponse("fact-check reply is not an object".into()))?;

    let has_factual_claims = flag(obj.get("has_factual_claims")).unwrap_or(false);
    // No claims means nothing to verify, whatever the model said.
    let accuracy = if has_factual_claims {
        FactualAccuracy::normalize(obj.get("factual_accuracy").and_then(Value::as_str))
    } else {
        FactualAccuracy::Unverifiable
    };

    let flags = obj
        .get("flags")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    Ok(FactCheckVerdict {
        has_factual_claims,
        accuracy,
        findings: text(obj, &["findings", "analysis"]).unwrap_or_else(|| "No findings".to_string()),
        flags,
    })
}

// ---------------------------------------------------------------------------
// Discussion summary
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct SummaryReply {
    pub context: String,
    pub summary: String,
}

pub fn parse_summary(raw: &str) -> Result<SummaryReply, ModerationError> {
    let value = parse_json(raw)?;
    let obj = value
        .as_object()
        .ok_or_else(|| ModerationError::MalformedResponse("summary reply is not an object".into()))?;

    let summary = text(obj, &["summary"])
        .ok_or_else(|| ModerationError::MalformedResponse("summary reply has no summary".into()))?;

    Ok(SummaryReply {
        context: text(obj, &["context"]).unwrap_or_default(),
        summary,
    })
}
