//! Payment gateway adapter.
//!
//! The core consumes this as a trait so the HTTP implementation can be
//! swapped for a programmable fake in tests. Gateway amounts are minor-unit
//! integers; everything inside the core is `Decimal`.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

use crate::errors::{CoreError, CoreResult};

/// Result of initializing a payment: where to send the payer.
#[derive(Debug, Clone)]
pub struct PaymentSession {
    pub authorization_url: String,
    pub gateway_reference: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayPaymentStatus {
    Success,
    Pending,
    Failed,
}

/// Gateway's view of a payment, normalized from its wire format.
#[derive(Debug, Clone)]
pub struct GatewayVerification {
    pub status: GatewayPaymentStatus,
    /// Minor units (e.g. kobo/cents); convert with [`from_minor_units`]
    pub amount_minor: i64,
    pub gateway_reference: Option<String>,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Start a checkout session for `amount`, correlated by `reference`.
    async fn initialize_payment(
        &self,
        email: &str,
        amount: Decimal,
        reference: &str,
    ) -> CoreResult<PaymentSession>;

    /// Ask the gateway what it knows about `reference`.
    async fn verify_payment(&self, reference: &str) -> CoreResult<GatewayVerification>;
}

/// Convert a core decimal amount to gateway minor units.
pub fn to_minor_units(amount: Decimal) -> i64 {
    use rust_decimal::prelude::ToPrimitive;
    (amount * Decimal::from(100))
        .round()
        .to_i64()
        .unwrap_or(i64::MAX)
}

/// Convert a gateway minor-unit integer back to the core decimal type.
pub fn from_minor_units(minor: i64) -> Decimal {
    Decimal::new(minor, 2)
}

/// Gateway adapter speaking a Paystack-style JSON API over HTTPS.
pub struct HttpPaymentGateway {
    base_url: String,
    secret_key: String,
    timeout: Duration,
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct InitializeEnvelope {
    status: bool,
    #[serde(default)]
    data: Option<InitializeData>,
}

#[derive(Debug, Deserialize)]
struct InitializeData {
    authorization_url: String,
    #[serde(default)]
    reference: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VerifyEnvelope {
    status: bool,
    #[serde(default)]
    data: Option<VerifyData>,
}

#[derive(Debug, Deserialize)]
struct VerifyData {
    status: String,
    amount: i64,
    #[serde(default)]
    reference: Option<String>,
}

impl HttpPaymentGateway {
    pub fn new(base_url: String, secret_key: String, timeout: Duration) -> Self {
        Self {
            base_url,
            secret_key,
            timeout,
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl PaymentGateway for HttpPaymentGateway {
    async fn initialize_payment(
        &self,
        email: &str,
        amount: Decimal,
        reference: &str,
    ) -> CoreResult<PaymentSession> {
        let response = self
            .http
            .post(format!("{}/transaction/initialize", self.base_url))
            .bearer_auth(&self.secret_key)
            .json(&json!({
                "email": email,
                "amount": to_minor_units(amount),
                "reference": reference,
            }))
            .timeout(self.timeout)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            tracing::warn!(%status, reference, "payment initialization rejected");
            return Err(CoreError::PaymentVerification(
                "Payment could not be initialized".to_string(),
            ));
        }

        let envelope = response.json::<InitializeEnvelope>().await?;
        let data = envelope
            .data
            .filter(|_| envelope.status)
            .ok_or_else(|| {
                CoreError::PaymentVerification("Payment could not be initialized".to_string())
            })?;

        Ok(PaymentSession {
            authorization_url: data.authorization_url,
            gateway_reference: data.reference,
        })
    }

    async fn verify_payment(&self, reference: &str) -> CoreResult<GatewayVerification> {
        let response = self
            .http
            .get(format!("{}/transaction/verify/{}", self.base_url, reference))
            .bearer_auth(&self.secret_key)
            .timeout(self.timeout)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            tracing::warn!(%status, reference, "payment verification rejected");
            return Err(CoreError::PaymentVerification(
                "Payment could not be verified".to_string(),
            ));
        }

        let envelope = response.json::<VerifyEnvelope>().await?;
        let data = envelope.data.filter(|_| envelope.status).ok_or_else(|| {
            CoreError::PaymentVerification("Payment could not be verified".to_string())
        })?;

        let status = match data.status.as_str() {
            "success" => GatewayPaymentStatus::Success,
            "pending" | "ongoing" => GatewayPaymentStatus::Pending,
            _ => GatewayPaymentStatus::Failed,
        };

        Ok(GatewayVerification {
            status,
            amount_minor: data.amount,
            gateway_reference: data.reference,
        })
    }
}

#[cfg(test)]
pub mod testing {
    //! Programmable gateway fake for service and worker tests.

    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct FakeGateway {
        verifications: Mutex<HashMap<String, GatewayVerification>>,
        pub fail_initialize: std::sync::atomic::AtomicBool,
        initialized: Mutex<Vec<String>>,
    }

    impl FakeGateway {
        pub fn new() -> Self {
            Self::default()
        }

        /// Program the verification the gateway will report for `reference`.
        pub fn set_verification(&self, reference: &str, verification: GatewayVerification) {
            self.verifications
                .lock()
                .unwrap()
                .insert(reference.to_string(), verification);
        }

        pub fn succeed_with_amount(&self, reference: &str, amount: Decimal) {
            self.set_verification(
                reference,
                GatewayVerification {
                    status: GatewayPaymentStatus::Success,
                    amount_minor: to_minor_units(amount),
                    gateway_reference: Some(format!("gw_{reference}")),
                },
            );
        }

        pub fn initialized_references(&self) -> Vec<String> {
            self.initialized.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PaymentGateway for FakeGateway {
        async fn initialize_payment(
            &self,
            _email: &str,
            _amount: Decimal,
            reference: &str,
        ) -> CoreResult<PaymentSession> {
            if self.fail_initialize.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(CoreError::Transient("Payment gateway unreachable".into()));
            }
            self.initialized.lock().unwrap().push(reference.to_string());
            Ok(PaymentSession {
                authorization_url: format!("https://checkout.test/{reference}"),
                gateway_reference: Some(format!("gw_{reference}")),
            })
        }

        async fn verify_payment(&self, reference: &str) -> CoreResult<GatewayVerification> {
            self.verifications
                .lock()
                .unwrap()
                .get(reference)
                .cloned()
                .ok_or_else(|| {
                    CoreError::PaymentVerification("Payment could not be verified".to_string())
                })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn minor_unit_conversion_is_exact() {
        assert_eq!(to_minor_units(dec!(10_500)), 1_050_000);
        assert_eq!(from_minor_units(1_050_000), dec!(10500.00));
        assert_eq!(from_minor_units(1), dec!(0.01));
    }

    #[test]
    fn minor_unit_round_trip_preserves_cents() {
        for cents in [0i64, 1, 99, 100, 123_456_789] {
            assert_eq!(to_minor_units(from_minor_units(cents)), cents);
        }
    }

    #[tokio::test]
    async fn fake_gateway_reports_programmed_result() {
        let gateway = testing::FakeGateway::new();
        gateway.succeed_with_amount("ref_1", dec!(10_500));

        let verification = gateway.verify_payment("ref_1").await.unwrap();
        assert_eq!(verification.status, GatewayPaymentStatus::Success);
        assert_eq!(from_minor_units(verification.amount_minor), dec!(10500.00));

        let err = gateway.verify_payment("unknown").await.unwrap_err();
        assert!(matches!(err, CoreError::PaymentVerification(_)));
    }
}
