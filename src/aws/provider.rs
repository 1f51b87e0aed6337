use std::time::Duration as StdDuration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region, SdkConfig};
use chrono::{DateTime, Utc};
use dialoguer::{Input, theme::ColorfulTheme};
use thiserror::Error;
use tracing::info;

use crate::aws::Credentials;
use crate::cache::{BearerToken, ClientRegistration, DeviceAuthorization};
use crate::constants::{DEFAULT_AWS_REGION, TOOL_NAME};

/// OAuth grant type for the device-code flow
const DEVICE_CODE_GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:device_code";

/// How long the default pending handler waits between token polls
const PENDING_POLL_PACING: StdDuration = StdDuration::from_secs(5);

/// Outcome of a single device-flow token request that is not a token.
///
/// `Pending` keeps the poll loop alive; `Expired` means the device
/// authorization lapsed before the operator approved it and the loop must
/// not continue; anything else is `Fatal`.
#[derive(Debug, Error)]
pub enum TokenPollError {
    #[error("authorization pending")]
    Pending,
    #[error("device authorization expired")]
    Expired,
    #[error(transparent)]
    Fatal(#[from] anyhow::Error),
}

/// Session-token issuance and role assumption against STS.
#[async_trait]
pub trait StsProvider: Send + Sync {
    /// Exchange seed credentials plus a one-time MFA code for a session token.
    async fn get_session_token(
        &self,
        seed: &Credentials,
        region: Option<&str>,
        serial: &str,
        token_code: &str,
    ) -> Result<Credentials>;

    /// Exchange the active credentials for role-scoped credentials.
    async fn assume_role(
        &self,
        active: &Credentials,
        region: Option<&str>,
        role_arn: &str,
    ) -> Result<Credentials>;
}

/// The SSO device-authorization grant and final role-credential exchange.
#[async_trait]
pub trait SsoProvider: Send + Sync {
    async fn register_client(&self, region: &str) -> Result<ClientRegistration>;

    async fn start_device_authorization(
        &self,
        region: &str,
        registration: &ClientRegistration,
        start_url: &str,
    ) -> Result<DeviceAuthorization>;

    async fn create_token(
        &self,
        region: &str,
        registration: &ClientRegistration,
        authorization: &DeviceAuthorization,
    ) -> Result<BearerToken, TokenPollError>;

    async fn role_credentials(
        &self,
        region: &str,
        token: &BearerToken,
        account_id: &str,
        role_name: &str,
    ) -> Result<Credentials>;
}

/// Source of one-time MFA token codes.
pub trait MfaPrompt: Send + Sync {
    fn read_token(&self, serial: &str) -> Result<String>;
}

/// Invoked on every pending poll of the device flow with the verification
/// URI; expected to surface the URI and pace the loop before returning.
#[async_trait]
pub trait PendingAuthorization: Send + Sync {
    async fn on_pending(&self, verification_uri: &str) -> Result<()>;
}

/// Prompts for the MFA token code on the controlling terminal.
pub struct TerminalPrompt;

impl MfaPrompt for TerminalPrompt {
    fn read_token(&self, serial: &str) -> Result<String> {
        let token: String = Input::with_theme(&ColorfulTheme::default())
            .with_prompt(format!("MFA token for {serial}"))
            .interact_text()
            .context("Failed to read MFA token code")?;
        Ok(token.trim().to_string())
    }
}

/// Default pending handler: print the verification URI and wait before the
/// next poll.
pub struct PrintAndWait;

#[async_trait]
impl PendingAuthorization for PrintAndWait {
    async fn on_pending(&self, verification_uri: &str) -> Result<()> {
        println!("Visit {verification_uri} to authorize this application");
        tokio::time::sleep(PENDING_POLL_PACING).await;
        Ok(())
    }
}

/// STS provider backed by the AWS SDK.
pub struct AwsStsProvider;

/// SSO/OIDC provider backed by the AWS SDK.
pub struct AwsSsoProvider;

#[async_trait]
impl StsProvider for AwsStsProvider {
    async fn get_session_token(
        &self,
        seed: &Credentials,
        region: Option<&str>,
        serial: &str,
        token_code: &str,
    ) -> Result<Credentials> {
        info!("Calling STS GetSessionToken for {}", serial);
        let config = sdk_config(region, Some(seed)).await;
        let client = aws_sdk_sts::Client::new(&config);

        let response = client
            .get_session_token()
            .serial_number(serial)
            .token_code(token_code)
            .send()
            .await
            .context("STS GetSessionToken failed")?;

        let sts_creds = response
            .credentials()
            .context("STS returned no credentials")?;

        Ok(Credentials {
            access_key_id: sts_creds.access_key_id().to_string(),
            secret_access_key: sts_creds.secret_access_key().to_string(),
            session_token: Some(sts_creds.session_token().to_string()),
            expiration: Some(to_chrono(sts_creds.expiration())?),
            can_expire: true,
            source: String::new(),
        })
    }

    async fn assume_role(
        &self,
        active: &Credentials,
        region: Option<&str>,
        role_arn: &str,
    ) -> Result<Credentials> {
        info!("Calling STS AssumeRole for {}", role_arn);
        let config = sdk_config(region, Some(active)).await;
        let client = aws_sdk_sts::Client::new(&config);

        let response = client
            .assume_role()
            .role_arn(role_arn)
            .role_session_name(TOOL_NAME)
            .send()
            .await
            .context("STS AssumeRole failed")?;

        let sts_creds = response
            .credentials()
            .context("STS returned no credentials")?;

        Ok(Credentials {
            access_key_id: sts_creds.access_key_id().to_string(),
            secret_access_key: sts_creds.secret_access_key().to_string(),
            session_token: Some(sts_creds.session_token().to_string()),
            expiration: Some(to_chrono(sts_creds.expiration())?),
            can_expire: true,
            source: String::new(),
        })
    }
}

#[async_trait]
impl SsoProvider for AwsSsoProvider {
    async fn register_client(&self, region: &str) -> Result<ClientRegistration> {
        info!("Registering OIDC client in {}", region);
        let config = sdk_config(Some(region), None).await;
        let client = aws_sdk_ssooidc::Client::new(&config);

        let response = client
            .register_client()
            .client_name(TOOL_NAME)
            .client_type("public")
            .send()
            .await
            .context("OIDC client registration failed")?;

        Ok(ClientRegistration {
            client_id: response
                .client_id()
                .context("OIDC registration returned no client id")?
                .to_string(),
            client_secret: response
                .client_secret()
                .context("OIDC registration returned no client secret")?
                .to_string(),
            secret_expires_at: DateTime::from_timestamp(response.client_secret_expires_at(), 0),
        })
    }

    async fn start_device_authorization(
        &self,
        region: &str,
        registration: &ClientRegistration,
        start_url: &str,
    ) -> Result<DeviceAuthorization> {
        info!("Starting device authorization for {}", start_url);
        let config = sdk_config(Some(region), None).await;
        let client = aws_sdk_ssooidc::Client::new(&config);

        let response = client
            .start_device_authorization()
            .client_id(&registration.client_id)
            .client_secret(&registration.client_secret)
            .start_url(start_url)
            .send()
            .await
            .context("Device authorization request failed")?;

        Ok(DeviceAuthorization {
            device_code: response
                .device_code()
                .context("Device authorization returned no device code")?
                .to_string(),
            user_code: response.user_code().unwrap_or_default().to_string(),
            verification_uri: response.verification_uri().unwrap_or_default().to_string(),
            verification_uri_complete: response
                .verification_uri_complete()
                .context("Device authorization returned no verification URI")?
                .to_string(),
            expires_in: response.expires_in(),
            interval: response.interval(),
        })
    }

    async fn create_token(
        &self,
        region: &str,
        registration: &ClientRegistration,
        authorization: &DeviceAuthorization,
    ) -> Result<BearerToken, TokenPollError> {
        let config = sdk_config(Some(region), None).await;
        let client = aws_sdk_ssooidc::Client::new(&config);

        let response = client
            .create_token()
            .client_id(&registration.client_id)
            .client_secret(&registration.client_secret)
            .grant_type(DEVICE_CODE_GRANT_TYPE)
            .device_code(&authorization.device_code)
            .send()
            .await;

        match response {
            Ok(output) => Ok(BearerToken {
                access_token: output
                    .access_token()
                    .context("Token response carried no access token")?
                    .to_string(),
                expires_in: output.expires_in(),
            }),
            Err(err) => {
                let service_error = err.into_service_error();
                if service_error.is_authorization_pending_exception() {
                    Err(TokenPollError::Pending)
                } else if service_error.is_expired_token_exception() {
                    Err(TokenPollError::Expired)
                } else {
                    Err(TokenPollError::Fatal(anyhow::Error::from(service_error)))
                }
            }
        }
    }

    async fn role_credentials(
        &self,
        region: &str,
        token: &BearerToken,
        account_id: &str,
        role_name: &str,
    ) -> Result<Credentials> {
        info!(
            "Requesting SSO role credentials for {}/{}",
            account_id, role_name
        );
        let config = sdk_config(Some(region), None).await;
        let client = aws_sdk_sso::Client::new(&config);

        let response = client
            .get_role_credentials()
            .access_token(&token.access_token)
            .account_id(account_id)
            .role_name(role_name)
            .send()
            .await
            .context("SSO GetRoleCredentials failed")?;

        let role_creds = response
            .role_credentials()
            .context("SSO returned no role credentials")?;

        // SSO reports expiry in epoch milliseconds
        let expiration = DateTime::from_timestamp_millis(role_creds.expiration())
            .context("SSO credential expiration out of range")?;

        Ok(Credentials {
            access_key_id: role_creds
                .access_key_id()
                .context("SSO returned no access key id")?
                .to_string(),
            secret_access_key: role_creds
                .secret_access_key()
                .context("SSO returned no secret access key")?
                .to_string(),
            session_token: role_creds.session_token().map(str::to_string),
            expiration: Some(expiration),
            can_expire: true,
            source: String::new(),
        })
    }
}

/// Build an SDK config for the narrowest-scoped region, falling back to the
/// default STS region when the profile defines none.
async fn sdk_config(region: Option<&str>, creds: Option<&Credentials>) -> SdkConfig {
    let region = Region::new(
        region
            .filter(|r| !r.is_empty())
            .unwrap_or(DEFAULT_AWS_REGION)
            .to_string(),
    );
    let loader = aws_config::defaults(BehaviorVersion::latest()).region(region);

    match creds {
        Some(creds) => {
            let provider = aws_credential_types::Credentials::new(
                creds.access_key_id.clone(),
                creds.secret_access_key.clone(),
                creds.session_token.clone(),
                None,
                TOOL_NAME,
            );
            loader.credentials_provider(provider).load().await
        }
        None => loader.no_credentials().load().await,
    }
}

fn to_chrono(expiration: &aws_smithy_types::DateTime) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(expiration.secs(), expiration.subsec_nanos())
        .context("Credential expiration out of range")
}
