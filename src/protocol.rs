//! Messages exchanged with the stage workers. Every message is plain
//! serde data so the same shapes can cross a process or thread boundary.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranspileRequest {
    pub filename: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TranspileResponse {
    Transpiled { filename: String, transpiled: String },
    Failed { stderr: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompileRequest {
    pub files: BTreeMap<String, String>,
}

/// Zero or more `Stderr` chunks, then at most one of `Compiled` or
/// `Failed`. A stream that ends without either is a clean exit that
/// produced no artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompileResponse {
    Stderr(String),
    Compiled(Vec<u8>),
    Failed { stderr: Option<String> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteRequest {
    pub run: Vec<u8>,
}

/// Output chunks in production order, then exactly one `Done`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecuteResponse {
    Stderr(String),
    Preview(String),
    /// The program trapped or was stopped; the text is for display
    Trapped(String),
    Done,
}
