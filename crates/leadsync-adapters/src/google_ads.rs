//! Google Ads offline click-conversion upload over the REST interface.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::info;

use crate::auth::TokenProvider;
use crate::http::ApiClient;
use crate::{AdapterError, ConversionClient};

pub const DEFAULT_API_VERSION: &str = "v22";
pub const DEFAULT_BASE_URL: &str = "https://googleads.googleapis.com";

#[derive(Debug, Clone)]
pub struct GoogleAdsSettings {
    pub api_version: String,
    pub customer_id: String,
    pub login_customer_id: String,
    pub developer_token: String,
}

/// Customer ids are often written `123-456-7890`; the API wants digits only.
pub fn normalize_customer_id(raw: &str) -> String {
    raw.chars().filter(|c| c.is_ascii_digit()).collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClickConversion {
    pub gclid: String,
    pub conversion_action: String,
    pub conversion_date_time: String,
    pub conversion_value: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub currency_code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadClickConversionsRequest {
    pub conversions: Vec<ClickConversion>,
    pub partial_failure: bool,
}

/// `results` holds one entry per submitted conversion and is always present.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadClickConversionsResponse {
    pub results: Vec<ClickConversionResult>,
    #[serde(default)]
    pub partial_failure_error: Option<PartialFailureStatus>,
}

impl UploadClickConversionsResponse {
    /// The API omits the field when nothing failed; a zero-code status with no
    /// details means the same thing.
    pub fn partial_failure(&self) -> Option<&PartialFailureStatus> {
        self.partial_failure_error
            .as_ref()
            .filter(|status| status.code != 0 || !status.details.is_empty())
    }
}

/// Empty object for entries that failed under partial-failure mode.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClickConversionResult {
    #[serde(default)]
    pub gclid: Option<String>,
    #[serde(default)]
    pub conversion_action: Option<String>,
    #[serde(default)]
    pub conversion_date_time: Option<String>,
}

/// `google.rpc.Status` carrying `GoogleAdsFailure` details.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartialFailureStatus {
    #[serde(default)]
    pub code: i32,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub details: Vec<FailureDetail>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FailureDetail {
    #[serde(rename = "@type", default)]
    pub type_url: String,
    #[serde(default)]
    pub errors: Vec<GoogleAdsError>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoogleAdsError {
    #[serde(default)]
    pub error_code: Option<JsonValue>,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub location: Option<ErrorLocation>,
}

impl GoogleAdsError {
    /// Index into `conversions` this error points at, if the location names one.
    pub fn conversion_index(&self) -> Option<usize> {
        self.location
            .as_ref()?
            .field_path_elements
            .iter()
            .find(|el| el.field_name == "conversions")
            .and_then(FieldPathElement::index)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorLocation {
    #[serde(default)]
    pub field_path_elements: Vec<FieldPathElement>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldPathElement {
    pub field_name: String,
    #[serde(default)]
    index: Option<JsonValue>,
}

impl FieldPathElement {
    // proto3 JSON may render integers as numbers or strings.
    pub fn index(&self) -> Option<usize> {
        match self.index.as_ref()? {
            JsonValue::Number(n) => n.as_u64().map(|n| n as usize),
            JsonValue::String(s) => s.parse().ok(),
            _ => None,
        }
    }
}

pub struct GoogleAdsClient {
    http: ApiClient,
    tokens: Arc<dyn TokenProvider>,
    settings: GoogleAdsSettings,
    base_url: String,
}

impl GoogleAdsClient {
    pub fn new(http: ApiClient, tokens: Arc<dyn TokenProvider>, settings: GoogleAdsSettings) -> Self {
        Self {
            http,
            tokens,
            settings,
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn upload_url(&self) -> String {
        format!(
            "{}/{}/customers/{}:uploadClickConversions",
            self.base_url.trim_end_matches('/'),
            self.settings.api_version,
            normalize_customer_id(&self.settings.customer_id)
        )
    }
}

#[async_trait]
impl ConversionClient for GoogleAdsClient {
    async fn upload_click_conversions(
        &self,
        request: &UploadClickConversionsRequest,
    ) -> Result<UploadClickConversionsResponse, AdapterError> {
        let token = self.tokens.bearer_token().await?;
        let builder = self
            .http
            .inner()
            .post(self.upload_url())
            .bearer_auth(&token.access_token)
            .header("developer-token", &self.settings.developer_token)
            .header(
                "login-customer-id",
                normalize_customer_id(&self.settings.login_customer_id),
            )
            .json(request);
        let response: UploadClickConversionsResponse =
            self.http.send_json("google ads upload", builder).await?;
        info!(
            submitted = request.conversions.len(),
            results = response.results.len(),
            partial_failure = response.partial_failure().is_some(),
            "click conversions uploaded"
        );
        Ok(response)
    }
}
