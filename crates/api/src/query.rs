//! Query parameter types shared by API handlers.

use serde::Deserialize;

/// `?capabilities=sdxl,flux` filter for backend listings.
#[derive(Debug, Default, Deserialize)]
pub struct CapabilityParams {
    #[serde(default)]
    pub capabilities: Option<String>,
}

impl CapabilityParams {
    /// Requested capability tags, trimmed, empties dropped.
    pub fn tags(&self) -> Vec<String> {
        self.capabilities
            .as_deref()
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }
}
