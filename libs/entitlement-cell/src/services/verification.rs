use reqwest::Client;
use shared_config::AppConfig;
use tracing::{debug, error};

use crate::models::{EntitlementError, PlanDescriptor};

/// Client for the remote activation-code verification endpoint.
/// Any transport failure, non-success status or malformed body is a
/// `Verification` error: the engine must fail closed, never treat an
/// unverifiable code as valid or as definitely rejected.
pub struct ActivationVerifier {
    client: Client,
    base_url: String,
}

impl ActivationVerifier {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            client: Client::new(),
            base_url: config.activation_verify_url.clone(),
        }
    }

    pub async fn verify(&self, code: &str) -> Result<PlanDescriptor, EntitlementError> {
        let url = format!("{}?code={}", self.base_url, urlencoding::encode(code));
        debug!("Verifying activation code against {}", self.base_url);

        let response = self.client.get(&url).send().await.map_err(|e| {
            EntitlementError::Verification {
                message: format!("Request failed: {}", e),
            }
        })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| EntitlementError::Verification {
                message: format!("Failed to read response: {}", e),
            })?;

        if !status.is_success() {
            error!("Verification endpoint error ({}): {}", status, body);
            return Err(EntitlementError::Verification {
                message: format!("HTTP {}: {}", status, body),
            });
        }

        serde_json::from_str(&body).map_err(|e| EntitlementError::Verification {
            message: format!("Malformed verification response: {}", e),
        })
    }
}
