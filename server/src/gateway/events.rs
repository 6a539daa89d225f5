//! Typed processor events
//!
//! Webhook bodies arrive as loosely-typed JSON. They are parsed here, once, into a closed
//! set of variants; event types the engine does not act on become `EventKind::Ignored`.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

use crate::error::{SettlementError, SettlementResult};

/// Metadata key under which payout requests are tagged on the processor side.
pub const PAYOUT_REQUEST_METADATA_KEY: &str = "payout_request_id";

#[derive(Debug, Clone, PartialEq)]
pub struct ProcessorEvent {
    pub id: String,
    pub created: DateTime<Utc>,
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    PaymentIntentSucceeded {
        intent_id: String,
    },
    PaymentIntentRequiresAction {
        intent_id: String,
    },
    PaymentIntentFailed {
        intent_id: String,
        reason: Option<String>,
    },
    PaymentIntentCanceled {
        intent_id: String,
        reason: Option<String>,
    },
    AccountUpdated {
        account_id: String,
        charges_enabled: bool,
        payouts_enabled: bool,
        disabled_reason: Option<String>,
        past_due: Vec<String>,
    },
    PayoutInTransit {
        payout_id: String,
        payout_request_id: Option<Uuid>,
    },
    PayoutPaid {
        payout_id: String,
        payout_request_id: Option<Uuid>,
    },
    PayoutFailed {
        payout_id: String,
        payout_request_id: Option<Uuid>,
        reason: Option<String>,
    },
    Ignored {
        event_type: String,
    },
}

#[derive(Debug, Deserialize)]
struct RawEvent {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    created: i64,
    data: RawEventData,
}

#[derive(Debug, Deserialize)]
struct RawEventData {
    object: Value,
}

#[derive(Debug, Deserialize)]
struct PaymentIntentObject {
    id: String,
    last_payment_error: Option<PaymentError>,
    cancellation_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PaymentError {
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AccountObject {
    id: String,
    #[serde(default)]
    charges_enabled: bool,
    #[serde(default)]
    payouts_enabled: bool,
    requirements: Option<AccountRequirements>,
}

#[derive(Debug, Default, Deserialize)]
struct AccountRequirements {
    disabled_reason: Option<String>,
    #[serde(default)]
    past_due: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct PayoutObject {
    id: String,
    status: Option<String>,
    failure_code: Option<String>,
    failure_message: Option<String>,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

impl PayoutObject {
    fn payout_request_id(&self) -> Option<Uuid> {
        self.metadata
            .get(PAYOUT_REQUEST_METADATA_KEY)
            .and_then(|raw| Uuid::parse_str(raw).ok())
    }

    fn failure_reason(&self) -> Option<String> {
        self.failure_message
            .clone()
            .or_else(|| self.failure_code.clone())
    }
}

impl ProcessorEvent {
    pub fn parse(raw_payload: &[u8]) -> SettlementResult<Self> {
        let raw: RawEvent = serde_json::from_slice(raw_payload)
            .map_err(|err| SettlementError::InvalidPayload(err.to_string()))?;

        let created = DateTime::<Utc>::from_timestamp(raw.created, 0).ok_or_else(|| {
            SettlementError::InvalidPayload(format!("invalid created timestamp {}", raw.created))
        })?;

        let kind = match raw.event_type.as_str() {
            "payment_intent.succeeded" => {
                let intent: PaymentIntentObject = object(&raw)?;
                EventKind::PaymentIntentSucceeded { intent_id: intent.id }
            }
            "payment_intent.requires_action" => {
                let intent: PaymentIntentObject = object(&raw)?;
                EventKind::PaymentIntentRequiresAction { intent_id: intent.id }
            }
            "payment_intent.payment_failed" => {
                let intent: PaymentIntentObject = object(&raw)?;
                EventKind::PaymentIntentFailed {
                    reason: intent.last_payment_error.and_then(|error| error.message),
                    intent_id: intent.id,
                }
            }
            "payment_intent.canceled" => {
                let intent: PaymentIntentObject = object(&raw)?;
                EventKind::PaymentIntentCanceled {
                    reason: intent.cancellation_reason,
                    intent_id: intent.id,
                }
            }
            "account.updated" => {
                let account: AccountObject = object(&raw)?;
                let requirements = account.requirements.unwrap_or_default();
                EventKind::AccountUpdated {
                    account_id: account.id,
                    charges_enabled: account.charges_enabled,
                    payouts_enabled: account.payouts_enabled,
                    disabled_reason: requirements.disabled_reason,
                    past_due: requirements.past_due,
                }
            }
            "payout.updated" => {
                let payout: PayoutObject = object(&raw)?;
                match payout.status.as_deref() {
                    Some("in_transit") => EventKind::PayoutInTransit {
                        payout_request_id: payout.payout_request_id(),
                        payout_id: payout.id,
                    },
                    _ => EventKind::Ignored {
                        event_type: raw.event_type.clone(),
                    },
                }
            }
            "payout.paid" => {
                let payout: PayoutObject = object(&raw)?;
                EventKind::PayoutPaid {
                    payout_request_id: payout.payout_request_id(),
                    payout_id: payout.id,
                }
            }
            // A canceled payout moved no funds, same as a failed one.
            "payout.failed" | "payout.canceled" => {
                let payout: PayoutObject = object(&raw)?;
                EventKind::PayoutFailed {
                    payout_request_id: payout.payout_request_id(),
                    reason: payout
                        .failure_reason()
                        .or_else(|| Some(raw.event_type.clone())),
                    payout_id: payout.id,
                }
            }
            other => EventKind::Ignored {
                event_type: other.to_string(),
            },
        };

        Ok(Self {
            id: raw.id,
            created,
            kind,
        })
    }

    pub fn event_type(&self) -> &str {
        match &self.kind {
            EventKind::PaymentIntentSucceeded { .. } => "payment_intent.succeeded",
            EventKind::PaymentIntentRequiresAction { .. } => "payment_intent.requires_action",
            EventKind::PaymentIntentFailed { .. } => "payment_intent.payment_failed",
            EventKind::PaymentIntentCanceled { .. } => "payment_intent.canceled",
            EventKind::AccountUpdated { .. } => "account.updated",
            EventKind::PayoutInTransit { .. } => "payout.updated",
            EventKind::PayoutPaid { .. } => "payout.paid",
            EventKind::PayoutFailed { .. } => "payout.failed",
            EventKind::Ignored { event_type } => event_type,
        }
    }
}

fn object<T: serde::de::DeserializeOwned>(raw: &RawEvent) -> SettlementResult<T> {
    serde_json::from_value(raw.data.object.clone()).map_err(|err| {
        SettlementError::InvalidPayload(format!("{} object: {}", raw.event_type, err))
    })
}
