//! Runtime configuration
//!
//! Settings resolved once at startup. The deployment serves a single fixed
//! identity; there is no per-request authentication, so the user id and the
//! OTP delivery address are configuration, not request data.

use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Identity this deployment serves. Requests may override it, demo and
    /// server defaults come from here.
    pub user_id: String,
    /// Where confirmation codes are delivered.
    pub otp_destination: String,
    /// Upper bound for any single external call inside a turn.
    pub call_timeout: Duration,
    /// Currency code applied when seeding demo accounts.
    pub currency: String,
}

impl OrchestratorConfig {
    /// Read configuration from the environment, falling back to the demo
    /// defaults for anything unset.
    pub fn from_env() -> Self {
        let call_timeout_secs = env::var("CALL_TIMEOUT_SECS")
            .ok()
            .and_then(|raw| raw.parse::<u64>().ok())
            .unwrap_or(15);

        Self {
            user_id: env::var("BANK_USER_ID").unwrap_or_else(|_| "local-user".to_string()),
            otp_destination: env::var("OTP_EMAIL")
                .unwrap_or_else(|_| "banking-user@example.com".to_string()),
            call_timeout: Duration::from_secs(call_timeout_secs),
            currency: env::var("CURRENCY").unwrap_or_else(|_| "INR".to_string()),
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            user_id: "local-user".to_string(),
            otp_destination: "banking-user@example.com".to_string(),
            call_timeout: Duration::from_secs(15),
            currency: "INR".to_string(),
        }
    }
}
