use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub errors: Vec<ErrorInfo>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
    pub detail: Option<serde_json::Value>,
}

// Query parameters of the read-delta endpoint
#[derive(Debug, Default, Deserialize)]
pub struct DeltaQuery {
    pub from: Option<String>,
    pub to: Option<String>,
    /// Comma separated list of accepted differs and compressors
    pub accept: Option<String>,
}

impl DeltaQuery {
    pub fn accepted(&self) -> Vec<String> {
        self.accept
            .as_deref()
            .map(|accept| {
                accept
                    .split(',')
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default()
    }
}

// Body of a ready delta
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeltaResponse {
    pub target_image: String,
    pub delta_image: String,
}
