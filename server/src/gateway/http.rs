//! HTTP adapter for a Stripe-compatible processor API

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use uuid::Uuid;

use super::events::PAYOUT_REQUEST_METADATA_KEY;
use super::{PaymentIntentHandle, ProcessorEvent, ProcessorGateway, WebhookVerifier};
use crate::config::ProcessorConfig;
use crate::error::{SettlementError, SettlementResult};

const CONNECTED_ACCOUNT_HEADER: &str = "Stripe-Account";

pub struct HttpProcessorGateway {
    http: Client,
    config: ProcessorConfig,
    verifier: WebhookVerifier,
}

impl HttpProcessorGateway {
    pub fn new(config: ProcessorConfig) -> SettlementResult<Self> {
        let http = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|err| SettlementError::Configuration(format!("http client: {err}")))?;
        let verifier = WebhookVerifier::new(
            config.webhook_secret.clone(),
            config.webhook_tolerance_seconds,
        );

        Ok(Self {
            http,
            config,
            verifier,
        })
    }

    async fn post_form(
        &self,
        path: &str,
        idempotency_key: &str,
        form: &[(&str, String)],
        connected_account: Option<&str>,
    ) -> SettlementResult<Value> {
        let mut request = self
            .http
            .post(format!("{}{}", self.config.api_url, path))
            .bearer_auth(&self.config.secret_key)
            .header("Idempotency-Key", idempotency_key)
            .form(form);
        if let Some(account) = connected_account {
            request = request.header(CONNECTED_ACCOUNT_HEADER, account);
        }

        let response = request.send().await.map_err(|err| {
            tracing::warn!(path, error = %err, "processor request failed");
            SettlementError::ProcessorUnavailable(err.to_string())
        })?;

        let status = response.status();
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            tracing::warn!(path, %status, "processor unavailable");
            return Err(SettlementError::ProcessorUnavailable(format!(
                "{path} returned {status}"
            )));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(path, %status, body = %body, "processor rejected request");
            return Err(SettlementError::ProcessorRejected(format!(
                "{path} returned {status}"
            )));
        }

        response
            .json::<Value>()
            .await
            .map_err(|err| SettlementError::ProcessorUnavailable(err.to_string()))
    }
}

#[async_trait]
impl ProcessorGateway for HttpProcessorGateway {
    async fn create_account(&self, creator_id: Uuid) -> SettlementResult<String> {
        let response = self
            .post_form(
                "/v1/accounts",
                &format!("account-{creator_id}"),
                &[
                    ("type", "express".to_string()),
                    ("metadata[creator_id]", creator_id.to_string()),
                ],
                None,
            )
            .await?;

        string_field(&response, "/id")
    }

    async fn create_account_link(&self, external_account_id: &str) -> SettlementResult<String> {
        // Links are single-use, so every call must reach the processor.
        let response = self
            .post_form(
                "/v1/account_links",
                &format!("account-link-{}", Uuid::new_v4()),
                &[
                    ("account", external_account_id.to_string()),
                    ("type", "account_onboarding".to_string()),
                    ("refresh_url", self.config.onboarding_refresh_url.clone()),
                    ("return_url", self.config.onboarding_return_url.clone()),
                ],
                None,
            )
            .await?;

        string_field(&response, "/url")
    }

    async fn create_payment_intent(
        &self,
        escrow_intent_id: Uuid,
        amount: i64,
        currency: &str,
    ) -> SettlementResult<PaymentIntentHandle> {
        let response = self
            .post_form(
                "/v1/payment_intents",
                &format!("escrow-{escrow_intent_id}"),
                &[
                    ("amount", amount.to_string()),
                    ("currency", currency.to_string()),
                    ("metadata[escrow_intent_id]", escrow_intent_id.to_string()),
                ],
                None,
            )
            .await?;

        Ok(PaymentIntentHandle {
            external_intent_id: string_field(&response, "/id")?,
            client_token: string_field(&response, "/client_secret")?,
        })
    }

    async fn create_payout(
        &self,
        payout_request_id: Uuid,
        external_account_id: &str,
        amount: i64,
        currency: &str,
    ) -> SettlementResult<String> {
        let metadata_key = format!("metadata[{PAYOUT_REQUEST_METADATA_KEY}]");
        let response = self
            .post_form(
                "/v1/payouts",
                &format!("payout-{payout_request_id}"),
                &[
                    ("amount", amount.to_string()),
                    ("currency", currency.to_string()),
                    (metadata_key.as_str(), payout_request_id.to_string()),
                ],
                Some(external_account_id),
            )
            .await?;

        string_field(&response, "/id")
    }

    fn verify_webhook(
        &self,
        raw_payload: &[u8],
        signature_header: &str,
    ) -> SettlementResult<ProcessorEvent> {
        self.verifier.verify(raw_payload, signature_header)?;
        ProcessorEvent::parse(raw_payload)
    }
}

fn string_field(response: &Value, pointer: &str) -> SettlementResult<String> {
    response
        .pointer(pointer)
        .and_then(|value| value.as_str())
        .map(ToString::to_string)
        .ok_or_else(|| {
            SettlementError::ProcessorRejected(format!("response is missing {pointer}"))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extracts_string_fields() {
        let response = json!({"id": "pi_1", "client_secret": "pi_1_secret"});
        assert_eq!(string_field(&response, "/id").unwrap(), "pi_1");
        assert!(matches!(
            string_field(&response, "/url"),
            Err(SettlementError::ProcessorRejected(_))
        ));
    }

    #[tokio::test]
    async fn unreachable_processor_is_unavailable() {
        let gateway = HttpProcessorGateway::new(ProcessorConfig {
            api_url: "http://127.0.0.1:9".to_string(),
            secret_key: "sk_test".to_string(),
            webhook_secret: "whsec_test".to_string(),
            timeout: std::time::Duration::from_millis(500),
            webhook_tolerance_seconds: 300,
            onboarding_refresh_url: "http://localhost/refresh".to_string(),
            onboarding_return_url: "http://localhost/return".to_string(),
        })
        .unwrap();

        let err = gateway.create_account(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, SettlementError::ProcessorUnavailable(_)));
    }
}
