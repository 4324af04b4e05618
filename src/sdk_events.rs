//! Known SDK event kinds
//!
//! Each variant has a fixed property schema. Serialization produces the wire
//! `event_name` plus a snake_case property object; open-ended property bags
//! are only accepted through [`crate::event::ExternalEvent`].

use serde::Serialize;
use serde_json::{Map, Value};

use crate::errors::{EventsError, EventsResult};

/// How the checkout was started
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PurchaseMode {
    #[default]
    SdkCheckout,
    ExternalCheckout,
    ExpressPurchaseButton,
}

/// Event with no properties other than the purchase mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ModeOnly {
    pub mode: PurchaseMode,
}

/// Branding customization in effect when the checkout started, sent as
/// `customization_<field>`
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct Customization {
    #[serde(rename = "customization_color_buttons_primary")]
    pub color_buttons_primary: Option<String>,
    #[serde(rename = "customization_color_accent")]
    pub color_accent: Option<String>,
    #[serde(rename = "customization_color_error")]
    pub color_error: Option<String>,
    #[serde(rename = "customization_color_product_info_bg")]
    pub color_product_info_bg: Option<String>,
    #[serde(rename = "customization_color_form_bg")]
    pub color_form_bg: Option<String>,
    #[serde(rename = "customization_color_page_bg")]
    pub color_page_bg: Option<String>,
    #[serde(rename = "customization_font")]
    pub font: Option<String>,
    #[serde(rename = "customization_shapes")]
    pub shapes: Option<String>,
    #[serde(rename = "customization_show_product_description")]
    pub show_product_description: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct CheckoutSessionStart {
    pub mode: PurchaseMode,
    #[serde(flatten)]
    pub customization: Customization,
    pub product_interval: Option<String>,
    pub product_price: i64,
    pub product_currency: String,
    pub selected_product_id: String,
    pub selected_package_id: String,
    pub selected_purchase_option: String,
    pub customer_email_provided_by_developer: bool,
}

/// How a checkout session ended
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SessionOutcome {
    Finished {
        with_redemption_info: bool,
    },
    Closed,
    Errored {
        error_code: Option<String>,
        error_message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckoutSessionEnd {
    pub mode: PurchaseMode,
    #[serde(flatten)]
    pub outcome: SessionOutcome,
}

/// Error reported by a checkout step
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct CheckoutError {
    pub mode: PurchaseMode,
    pub error_code: Option<String>,
    pub error_message: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct PaymentFormSubmit {
    pub mode: PurchaseMode,
    pub selected_payment_method: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaxOutcome {
    Taxed,
    NotTaxed,
    Disabled,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaxUiElement {
    Auto,
    Form,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PaymentTaxCalculation {
    pub mode: PurchaseMode,
    pub outcome: TaxOutcome,
    pub ui_element: TaxUiElement,
    pub tax_inclusive: bool,
    pub error_code: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DismissElement {
    GoBackToApp,
    Close,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PurchaseSuccessfulDismiss {
    pub mode: PurchaseMode,
    pub ui_element: DismissElement,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BillingEmailEntryError {
    pub error_code: Option<i64>,
    pub error_message: String,
}

/// Every event the SDK emits on its own
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event_name", content = "properties", rename_all = "snake_case")]
pub enum SdkEvent {
    SdkInitialized { sdk_version: String },
    CheckoutSessionStart(CheckoutSessionStart),
    CheckoutSessionEnd(CheckoutSessionEnd),
    CheckoutFlowError(CheckoutError),
    CheckoutBillingFormImpression(ModeOnly),
    CheckoutBillingFormSubmit(ModeOnly),
    CheckoutBillingFormError(CheckoutError),
    CheckoutPaymentFormImpression(ModeOnly),
    CheckoutPaymentFormSubmit(PaymentFormSubmit),
    CheckoutPaymentFormGatewayError(CheckoutError),
    CheckoutPaymentFormError(CheckoutError),
    CheckoutPaymentTaxCalculation(PaymentTaxCalculation),
    CheckoutPurchaseSuccessfulImpression(ModeOnly),
    CheckoutPurchaseSuccessfulDismiss(PurchaseSuccessfulDismiss),
    BillingEmailEntryImpression,
    BillingEmailEntryDismiss,
    BillingEmailEntrySubmit,
    BillingEmailEntrySuccess,
    BillingEmailEntryError(BillingEmailEntryError),
}

impl SdkEvent {
    pub fn sdk_initialized() -> Self {
        SdkEvent::SdkInitialized {
            sdk_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    pub fn session_finished(mode: PurchaseMode, with_redemption_info: bool) -> Self {
        SdkEvent::CheckoutSessionEnd(CheckoutSessionEnd {
            mode,
            outcome: SessionOutcome::Finished {
                with_redemption_info,
            },
        })
    }

    pub fn session_closed(mode: PurchaseMode) -> Self {
        SdkEvent::CheckoutSessionEnd(CheckoutSessionEnd {
            mode,
            outcome: SessionOutcome::Closed,
        })
    }

    pub fn session_errored(
        mode: PurchaseMode,
        error_code: Option<String>,
        error_message: impl Into<String>,
    ) -> Self {
        SdkEvent::CheckoutSessionEnd(CheckoutSessionEnd {
            mode,
            outcome: SessionOutcome::Errored {
                error_code,
                error_message: error_message.into(),
            },
        })
    }

    /// Split into wire event name and property object
    pub fn into_parts(self) -> EventsResult<(String, Map<String, Value>)> {
        let value = serde_json::to_value(&self)?;
        let Value::Object(mut object) = value else {
            return Err(EventsError::Serialization(
                "SDK event did not serialize to an object".to_string(),
            ));
        };

        let name = match object.remove("event_name") {
            Some(Value::String(name)) => name,
            _ => {
                return Err(EventsError::Serialization(
                    "SDK event is missing its name".to_string(),
                ))
            }
        };

        let properties = match object.remove("properties") {
            Some(Value::Object(properties)) => properties,
            None => Map::new(),
            Some(other) => {
                return Err(EventsError::Serialization(format!(
                    "SDK event {} has non-object properties: {}",
                    name, other
                )))
            }
        };

        Ok((name, properties))
    }
}
