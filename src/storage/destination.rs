// dbsnapshot/src/storage/destination.rs
use async_trait::async_trait;
use aws_config::default_provider::credentials::DefaultCredentialsChain;
use aws_credential_types::provider::ProvideCredentials;
use aws_sdk_s3::config::Region;
use std::path::PathBuf;

use crate::config::StorageSettings;
use crate::errors::BackupError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialSource {
    Explicit {
        access_key_id: String,
        secret_access_key: String,
        session_token: Option<String>,
    },
    /// Environment, profile or instance identity, resolved by the AWS default chain.
    Ambient,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTarget {
    pub bucket: String,
    pub prefix: String,
    pub region: String,
    pub endpoint_url: Option<String>,
    pub credentials: CredentialSource,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DestinationConfig {
    Remote(RemoteTarget),
    Local { dir: PathBuf },
}

impl DestinationConfig {
    pub fn mode(&self) -> &'static str {
        match self {
            DestinationConfig::Remote(_) => "remote",
            DestinationConfig::Local { .. } => "local",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Resolution {
    pub destination: DestinationConfig,
    /// Set when the tool fell back to local storage because nothing remote is configured.
    pub warning: Option<String>,
}

/// Answers whether the host grants credentials without explicit keys.
#[async_trait]
pub trait AmbientCredentials: Send + Sync {
    async fn available(&self, region: &str) -> bool;
}

/// Probes the AWS default credential chain (env, profile, web identity, IMDS).
pub struct DefaultChainProbe;

#[async_trait]
impl AmbientCredentials for DefaultChainProbe {
    async fn available(&self, region: &str) -> bool {
        let chain = DefaultCredentialsChain::builder()
            .region(Region::new(region.to_string()))
            .build()
            .await;
        match chain.provide_credentials().await {
            Ok(_) => true,
            Err(e) => {
                tracing::debug!("No ambient AWS credentials available: {}", e);
                false
            }
        }
    }
}

/// Decides where this invocation writes.
///
/// | local_only | bucket | region | key + secret | result                  |
/// |------------|--------|--------|--------------|-------------------------|
/// | yes        | any    | any    | any          | local                   |
/// | no         | none   | any    | any          | local, with a warning   |
/// | no         | set    | empty  | any          | invalid config          |
/// | no         | set    | set    | both         | remote, explicit        |
/// | no         | set    | set    | only one     | credentials missing     |
/// | no         | set    | set    | neither      | remote, ambient, if the |
/// |            |        |        |              | probe finds credentials |
pub async fn resolve_destination(
    storage: &StorageSettings,
    local_only: bool,
    ambient: &dyn AmbientCredentials,
) -> Result<Resolution, BackupError> {
    if local_only {
        return Ok(Resolution {
            destination: DestinationConfig::Local {
                dir: storage.local_dir.clone(),
            },
            warning: None,
        });
    }

    let Some(bucket) = storage.bucket.clone() else {
        let warning = format!(
            "BACKUP_S3_BUCKET not configured; backup stored locally in {}",
            storage.local_dir.display()
        );
        tracing::warn!("{}", warning);
        return Ok(Resolution {
            destination: DestinationConfig::Local {
                dir: storage.local_dir.clone(),
            },
            warning: Some(warning),
        });
    };

    if storage.region.trim().is_empty() {
        return Err(BackupError::InvalidConfig(
            "remote storage requires a region".to_string(),
        ));
    }

    let credentials = resolve_credentials(storage, ambient).await?;

    Ok(Resolution {
        destination: DestinationConfig::Remote(RemoteTarget {
            bucket,
            prefix: storage.prefix.clone(),
            region: storage.region.clone(),
            endpoint_url: storage.endpoint_url.clone(),
            credentials,
        }),
        warning: None,
    })
}

/// Explicit keys first, then ambient identity. A half-configured key pair is an error,
/// never a reason to try something else.
pub async fn resolve_credentials(
    storage: &StorageSettings,
    ambient: &dyn AmbientCredentials,
) -> Result<CredentialSource, BackupError> {
    match (&storage.access_key_id, &storage.secret_access_key) {
        (Some(key), Some(secret)) => Ok(CredentialSource::Explicit {
            access_key_id: key.clone(),
            secret_access_key: secret.clone(),
            session_token: storage.session_token.clone(),
        }),
        (Some(_), None) => Err(BackupError::CredentialsMissing(
            "AWS_ACCESS_KEY_ID is set but AWS_SECRET_ACCESS_KEY is not".to_string(),
        )),
        (None, Some(_)) => Err(BackupError::CredentialsMissing(
            "AWS_SECRET_ACCESS_KEY is set but AWS_ACCESS_KEY_ID is not".to_string(),
        )),
        (None, None) => {
            if ambient.available(&storage.region).await {
                Ok(CredentialSource::Ambient)
            } else {
                Err(BackupError::CredentialsMissing(
                    "no explicit keys configured and no ambient credentials found".to_string(),
                ))
            }
        }
    }
}
