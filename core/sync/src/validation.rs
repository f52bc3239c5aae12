//! Payload validation hooks applied at enqueue time.

use serde_json::Value;

use txqueue_common::{Error, Result};

use crate::transaction::TransactionKind;

/// Checks a payload before it is accepted into the queue.
pub trait PayloadValidator: Send + Sync {
    /// Return `Error::InvalidInput` to refuse the payload.
    fn validate(&self, kind: TransactionKind, payload: &Value) -> Result<()>;
}

/// Accepts everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl PayloadValidator for AcceptAll {
    fn validate(&self, _kind: TransactionKind, _payload: &Value) -> Result<()> {
        Ok(())
    }
}

/// Validator for card-present payment payloads.
///
/// Payments, refunds and captures need a positive integer `amount` in minor
/// units. Payments also need a `currency`; wherever a currency is present it
/// must be a three-letter uppercase ISO code. Voids only need an object.
#[derive(Debug, Clone, Copy, Default)]
pub struct PaymentPayloadValidator;

impl PaymentPayloadValidator {
    fn check_amount(kind: TransactionKind, payload: &Value) -> Result<()> {
        match payload.get("amount") {
            Some(Value::Number(n)) if n.as_u64().is_some_and(|v| v > 0) => Ok(()),
            Some(_) => Err(Error::InvalidInput(format!(
                "{} amount must be a positive integer in minor units",
                kind
            ))),
            None => Err(Error::InvalidInput(format!("{} payload missing amount", kind))),
        }
    }

    fn check_currency(kind: TransactionKind, payload: &Value) -> Result<()> {
        match payload.get("currency") {
            Some(Value::String(code))
                if code.len() == 3 && code.bytes().all(|b| b.is_ascii_uppercase()) =>
            {
                Ok(())
            }
            Some(other) => Err(Error::InvalidInput(format!(
                "Invalid currency code {}",
                other
            ))),
            None if kind == TransactionKind::Payment => {
                Err(Error::InvalidInput("payment payload missing currency".to_string()))
            }
            None => Ok(()),
        }
    }
}

impl PayloadValidator for PaymentPayloadValidator {
    fn validate(&self, kind: TransactionKind, payload: &Value) -> Result<()> {
        if !payload.is_object() {
            return Err(Error::InvalidInput(format!(
                "{} payload must be a JSON object",
                kind
            )));
        }

        match kind {
            TransactionKind::Payment | TransactionKind::Refund | TransactionKind::Capture => {
                Self::check_amount(kind, payload)?;
            }
            TransactionKind::Void => {}
        }
        Self::check_currency(kind, payload)
    }
}
