//! Outbound OTP delivery
//!
//! Delivery is best effort by contract: a failed or slow send reports
//! `false` and the dialogue still advances, with the renderer telling the
//! user the code could not be delivered.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use std::env;
use std::time::Duration;
use tracing::{info, warn};

/// Seam for delivering confirmation codes out of band.
#[async_trait]
pub trait OtpNotifier: Send + Sync {
    /// Dispatch a code to `destination`. Returns whether the dispatch
    /// succeeded; never errors and never panics.
    async fn send_code(&self, destination: &str, code: &str) -> bool;
}

//
// ================= Mail API Notifier =================
//

/// Notifier that posts the code to an HTTP mail relay as JSON.
pub struct MailApiNotifier {
    client: Client,
    base_url: String,
    api_token: Option<String>,
}

impl MailApiNotifier {
    pub fn new(base_url: String, api_token: Option<String>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            client,
            base_url,
            api_token,
        }
    }

    /// Build from MAIL_API_URL / MAIL_API_TOKEN, or None when no relay is
    /// configured.
    pub fn from_env() -> Option<Self> {
        let base_url = env::var("MAIL_API_URL").ok()?;
        let api_token = env::var("MAIL_API_TOKEN").ok();
        Some(Self::new(base_url, api_token))
    }
}

#[async_trait]
impl OtpNotifier for MailApiNotifier {
    async fn send_code(&self, destination: &str, code: &str) -> bool {
        let body = json!({
            "to": destination,
            "subject": "Your Voice Banking Verification Code",
            "body": format!(
                "Your one time password for the transfer is {}. It is valid for 15 minutes. Do not share this code with anyone.",
                code
            ),
        });

        let mut request = self.client.post(&self.base_url).json(&body);
        if let Some(token) = &self.api_token {
            request = request.bearer_auth(token);
        }

        match request.send().await {
            Ok(response) if response.status().is_success() => {
                info!(destination, "OTP email dispatched");
                true
            }
            Ok(response) => {
                warn!(destination, status = %response.status(), "Mail relay rejected the OTP email");
                false
            }
            Err(error) => {
                warn!(destination, %error, "Mail relay unreachable");
                false
            }
        }
    }
}

//
// ================= Log Notifier =================
//

/// Development notifier that only logs the code. Lets the whole flow run
/// locally without a mail relay; never use it where real users can read the
/// logs.
pub struct LogNotifier;

#[async_trait]
impl OtpNotifier for LogNotifier {
    async fn send_code(&self, destination: &str, code: &str) -> bool {
        info!(destination, code, "OTP generated (log-only delivery)");
        true
    }
}
