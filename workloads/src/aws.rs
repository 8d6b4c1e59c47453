//! The AWS demo: a consumer that lists S3 buckets with credentials obtained
//! by trading a JWT-SVID at STS, and the analysis side that polls it.

use crate::error::{Error, Result};
use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region, SdkConfig};
use aws_credential_types::provider::error::CredentialsError;
use aws_credential_types::provider::{self, future, ProvideCredentials};
use aws_credential_types::Credentials;
use aws_sdk_s3::primitives::DateTimeFormat;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{error, info};
use workload_identity::TokenSource;

/// Audience of the JWT-SVID presented to STS.
pub const AUDIENCE: &str = "consumer-workload";

/// Session name of the assumed role.
pub const SESSION_NAME: &str = "consumer-workload-session";

/// Lifetime requested for the temporary credentials.
pub const SESSION_DURATION: Duration = Duration::from_secs(15 * 60);

/// Region used when none is configured.
pub const DEFAULT_REGION: &str = "eu-west-1";

/// One S3 bucket as reported by the consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Bucket {
    /// Bucket name.
    pub name: String,
    /// Creation time, RFC 3339.
    pub creation_date: Option<String>,
}

impl Bucket {
    fn from_sdk(bucket: &aws_sdk_s3::types::Bucket) -> Self {
        Self {
            name: bucket.name().unwrap_or_default().to_string(),
            creation_date: bucket
                .creation_date()
                .and_then(|date| date.fmt(DateTimeFormat::DateTime).ok()),
        }
    }
}

/// Renders buckets as JSON indented by four spaces.
///
/// # Errors
///
/// Fails only if serialization fails.
pub fn to_indented_json(buckets: &[Bucket]) -> serde_json::Result<String> {
    let mut out = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut serializer = serde_json::Serializer::with_formatter(&mut out, formatter);
    buckets.serialize(&mut serializer)?;
    Ok(String::from_utf8_lossy(&out).into_owned())
}

/// AWS credentials from `AssumeRoleWithWebIdentity`, using a JWT-SVID for
/// [`AUDIENCE`] as the web identity token.
///
/// Register it as the credentials provider of an SDK client; the SDK's
/// identity cache decides when to call it again.
pub struct JwtSvidCredentials {
    tokens: Arc<dyn TokenSource>,
    sts: aws_sdk_sts::Client,
    role_arn: String,
}

impl std::fmt::Debug for JwtSvidCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtSvidCredentials")
            .field("role_arn", &self.role_arn)
            .finish_non_exhaustive()
    }
}

impl JwtSvidCredentials {
    /// Creates the provider for `role_arn`.
    pub fn new(tokens: Arc<dyn TokenSource>, sts: aws_sdk_sts::Client, role_arn: impl Into<String>) -> Self {
        Self {
            tokens,
            sts,
            role_arn: role_arn.into(),
        }
    }

    async fn assume_role(&self) -> provider::Result {
        let token = self
            .tokens
            .fetch_token(AUDIENCE)
            .await
            .map_err(CredentialsError::provider_error)?;
        info!(component = "jwtsvid_cred_retriever", "fetched JWT-SVID");

        let output = self
            .sts
            .assume_role_with_web_identity()
            .role_arn(&self.role_arn)
            .role_session_name(SESSION_NAME)
            .web_identity_token(token.as_str())
            .duration_seconds(i32::try_from(SESSION_DURATION.as_secs()).unwrap_or(i32::MAX))
            .send()
            .await
            .map_err(CredentialsError::provider_error)?;

        let credentials = output
            .credentials()
            .ok_or_else(|| CredentialsError::unhandled("STS returned no credentials"))?;

        Ok(Credentials::new(
            credentials.access_key_id(),
            credentials.secret_access_key(),
            Some(credentials.session_token().to_string()),
            SystemTime::try_from(*credentials.expiration()).ok(),
            "JwtSvidCredentials",
        ))
    }
}

impl ProvideCredentials for JwtSvidCredentials {
    fn provide_credentials<'a>(&'a self) -> future::ProvideCredentials<'a>
    where
        Self: 'a,
    {
        future::ProvideCredentials::new(self.assume_role())
    }
}

/// Loads the shared SDK configuration for `region`.
pub async fn load_config(region: impl Into<String>) -> SdkConfig {
    aws_config::defaults(BehaviorVersion::latest())
        .region(Region::new(region.into()))
        .load()
        .await
}

/// Builds an S3 client whose credentials come from [`JwtSvidCredentials`].
pub fn s3_client(config: &SdkConfig, tokens: Arc<dyn TokenSource>, role_arn: &str) -> aws_sdk_s3::Client {
    info!(role_arn, "using web identity role");
    let sts = aws_sdk_sts::Client::new(config);
    let s3_config = aws_sdk_s3::config::Builder::from(config)
        .credentials_provider(JwtSvidCredentials::new(tokens, sts, role_arn))
        .build();
    aws_sdk_s3::Client::from_conf(s3_config)
}

/// Lists all buckets visible to the client.
///
/// # Errors
///
/// [`Error::Aws`] when credentials cannot be obtained or S3 refuses.
pub async fn list_buckets(s3: &aws_sdk_s3::Client) -> Result<Vec<Bucket>> {
    let output = s3
        .list_buckets()
        .send()
        .await
        .map_err(|e| Error::aws("unable to list S3 buckets", e))?;
    Ok(output.buckets().iter().map(Bucket::from_sdk).collect())
}

/// Source of the bucket list served by the consumer.
#[async_trait]
pub trait BucketLister: Send + Sync + 'static {
    /// Returns the current buckets.
    async fn list(&self) -> Result<Vec<Bucket>>;
}

/// Lists buckets through S3, or fails every request when no role is
/// configured.
#[derive(Debug, Clone)]
pub struct S3Buckets {
    client: Option<aws_sdk_s3::Client>,
}

impl S3Buckets {
    /// Uses `client` for every listing; `None` when `AWS_ROLE_ARN` is unset.
    pub fn new(client: Option<aws_sdk_s3::Client>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl BucketLister for S3Buckets {
    async fn list(&self) -> Result<Vec<Bucket>> {
        let client = self.client.as_ref().ok_or(Error::MissingRoleArn)?;
        list_buckets(client).await
    }
}

/// Routes of the consumer: `GET /` and `GET /buckets`.
pub fn consumer_router(buckets: Arc<dyn BucketLister>) -> Router {
    Router::new()
        .route("/", get(|| async { "Success" }))
        .route("/buckets", get(get_buckets))
        .with_state(buckets)
}

async fn get_buckets(State(buckets): State<Arc<dyn BucketLister>>) -> Response {
    let listed = match buckets.list().await {
        Ok(listed) => listed,
        Err(e) => return server_error(&e),
    };

    match to_indented_json(&listed) {
        Ok(body) => (
            [(header::CONTENT_TYPE, "application/json; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => server_error(&e),
    }
}

fn server_error(err: &dyn std::error::Error) -> Response {
    error!(error = %err, "failed to list buckets");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        axum::Json(json!({ "error": err.to_string() })),
    )
        .into_response()
}

/// One poll of the analysis workload: `GET <server_address>/buckets`.
///
/// # Errors
///
/// [`Error::Connect`] when the consumer is unreachable, [`Error::Server`]
/// with the body when it answers with anything but `200 OK`.
pub async fn fetch_buckets(client: &reqwest::Client, server_address: &str) -> Result<String> {
    let connect = |source| Error::Connect {
        address: server_address.to_string(),
        source,
    };

    let response = client
        .get(format!("{server_address}/buckets"))
        .send()
        .await
        .map_err(connect)?;
    let status = response.status();
    let body = response.text().await?;

    if status != reqwest::StatusCode::OK {
        return Err(Error::Server(body));
    }

    info!("Buckets Found: {body}");
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buckets_serialize_pascal_case_indented() {
        let buckets = vec![Bucket {
            name: "analytics-data".into(),
            creation_date: Some("2024-03-01T12:00:00Z".into()),
        }];

        let json = to_indented_json(&buckets).unwrap();

        assert_eq!(
            json,
            "[\n    {\n        \"Name\": \"analytics-data\",\n        \"CreationDate\": \"2024-03-01T12:00:00Z\"\n    }\n]"
        );
    }

    #[test]
    fn empty_list_is_an_empty_array() {
        assert_eq!(to_indented_json(&[]).unwrap(), "[]");
    }

    #[test]
    fn sdk_buckets_are_mapped() {
        let sdk = aws_sdk_s3::types::Bucket::builder()
            .name("logs")
            .creation_date(aws_sdk_s3::primitives::DateTime::from_secs(1_700_000_000))
            .build();

        let bucket = Bucket::from_sdk(&sdk);

        assert_eq!(bucket.name, "logs");
        assert_eq!(bucket.creation_date.as_deref(), Some("2023-11-14T22:13:20Z"));
    }
}
