//! Project discovery
//!
//! Resolves the upstream project id for an account that doesn't carry an
//! explicit `projectId` override: queries an ordered list of discovery
//! endpoint fallbacks and takes the first well-formed response.

use serde::Deserialize;

use crate::constants::PROJECT_DISCOVERY_ENDPOINTS;

#[derive(Debug, Deserialize)]
struct ProjectDiscoveryResponse {
    #[serde(rename = "projectId")]
    project_id: Option<String>,
    #[serde(rename = "project_id")]
    project_id_snake: Option<String>,
}

impl ProjectDiscoveryResponse {
    fn into_project_id(self) -> Option<String> {
        self.project_id.or(self.project_id_snake)
    }
}

/// Walk `PROJECT_DISCOVERY_ENDPOINTS` in order, returning the first
/// well-formed project id. Each endpoint failure is swallowed — project
/// discovery failures are locally recovered per §7, never surfaced.
pub async fn discover_project(client: &reqwest::Client, access_token: &str) -> Option<String> {
    for endpoint in PROJECT_DISCOVERY_ENDPOINTS {
        let response = match client
            .get(*endpoint)
            .bearer_auth(access_token)
            .send()
            .await
        {
            Ok(r) if r.status().is_success() => r,
            _ => continue,
        };

        if let Ok(parsed) = response.json::<ProjectDiscoveryResponse>().await
            && let Some(project_id) = parsed.into_project_id()
        {
            return Some(project_id);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_camel_case_field() {
        let parsed: ProjectDiscoveryResponse =
            serde_json::from_str(r#"{"projectId":"proj-1"}"#).unwrap();
        assert_eq!(parsed.into_project_id(), Some("proj-1".to_string()));
    }

    #[test]
    fn decodes_snake_case_field() {
        let parsed: ProjectDiscoveryResponse =
            serde_json::from_str(r#"{"project_id":"proj-2"}"#).unwrap();
        assert_eq!(parsed.into_project_id(), Some("proj-2".to_string()));
    }

    #[test]
    fn endpoint_list_is_ordered_and_nonempty() {
        assert!(!PROJECT_DISCOVERY_ENDPOINTS.is_empty());
    }
}
