//! Sessions handed to handler code.

use std::sync::Arc;

use aws_config::{BehaviorVersion, Region, SdkConfig};
use aws_credential_types::provider::{ProvideCredentials, SharedCredentialsProvider};

use crate::cipher::Credentials;

const PROVIDER_NAME: &str = "CloudFormationExtensionRuntime";

/// An AWS session built from one of the credential sets CloudFormation sent.
///
/// Handlers receive `None` instead of a session when the matching
/// credentials were absent or unusable, and must fail themselves if they
/// need to call AWS.
#[derive(Debug, Clone)]
pub struct SessionProxy {
    credentials: Credentials,
    region: Option<String>,
}

impl SessionProxy {
    /// Builds a session, or `None` if the credentials are missing or empty.
    pub fn from_credentials(credentials: Option<&Credentials>, region: Option<&str>) -> Option<Self> {
        let credentials = credentials.filter(|creds| creds.is_usable())?;
        Some(Self {
            credentials: credentials.clone(),
            region: region.map(str::to_string),
        })
    }

    /// Returns the session region, if the request carried one.
    pub fn region(&self) -> Option<&str> {
        self.region.as_deref()
    }

    /// Returns the raw credentials of this session.
    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// Returns a credentials provider for signing requests.
    pub fn credentials_provider(&self) -> Arc<dyn ProvideCredentials> {
        Arc::new(self.aws_credentials())
    }

    /// Returns an SDK config for building AWS SDK clients in handler code.
    pub fn sdk_config(&self) -> SdkConfig {
        let mut builder = SdkConfig::builder()
            .credentials_provider(SharedCredentialsProvider::new(self.aws_credentials()))
            .behavior_version(BehaviorVersion::latest());
        if let Some(region) = &self.region {
            builder = builder.region(Region::new(region.clone()));
        }
        builder.build()
    }

    fn aws_credentials(&self) -> aws_credential_types::Credentials {
        aws_credential_types::Credentials::new(
            self.credentials.access_key_id.clone(),
            self.credentials.secret_access_key.clone(),
            Some(self.credentials.session_token.clone()),
            None,
            PROVIDER_NAME,
        )
    }
}
