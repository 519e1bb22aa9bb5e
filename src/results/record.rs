use serde::{Deserialize, Serialize};

/// A count result, as published by the counting services.
///
/// Field names are expected in lower case: see [`decode`](super::decode) for case-insensitive
/// decoding of message bodies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub id: String,
    pub count: i64,
    #[serde(default)]
    pub producer: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}
