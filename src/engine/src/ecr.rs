//! AWS ECR credential helpers.
//!
//! Both helpers exchange the runtime's ambient AWS identity for a
//! short-lived `user:pass` pair and make a best-effort attempt to create
//! the destination repository so a first push does not fail.

use base64::Engine;

use regmirror_core::error::{Result, SyncError};

/// Short-lived registry credentials issued by ECR.
#[derive(Debug, Clone)]
pub struct EcrToken {
    pub username: String,
    pub password: String,
}

/// Decode the base64 `user:pass` token ECR returns.
fn decode_token(helper: &str, token: &str) -> Result<EcrToken> {
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(token)
        .map_err(|e| SyncError::CredentialHelperError {
            helper: helper.to_string(),
            message: format!("invalid authorization token: {}", e),
        })?;
    let decoded = String::from_utf8(decoded).map_err(|e| SyncError::CredentialHelperError {
        helper: helper.to_string(),
        message: format!("authorization token is not UTF-8: {}", e),
    })?;

    match decoded.split_once(':') {
        Some((username, password)) if !username.is_empty() => Ok(EcrToken {
            username: username.to_string(),
            password: password.to_string(),
        }),
        _ => Err(SyncError::CredentialHelperError {
            helper: helper.to_string(),
            message: "authorization token is not user:pass".to_string(),
        }),
    }
}

/// Obtain push credentials from private ECR for `region`, ensuring
/// `repository` exists (an already-exists error is ignored).
pub async fn private_token(region: &str, repository: &str) -> Result<EcrToken> {
    let config = aws_config::defaults(aws_config::BehaviorVersion::latest())
        .region(aws_config::Region::new(region.to_string()))
        .load()
        .await;
    let client = aws_sdk_ecr::Client::new(&config);

    let out = client
        .get_authorization_token()
        .send()
        .await
        .map_err(|e| SyncError::CredentialHelperError {
            helper: "ecr".to_string(),
            message: format!("GetAuthorizationToken failed: {}", e),
        })?;

    let token = out
        .authorization_data()
        .first()
        .and_then(|d| d.authorization_token())
        .ok_or_else(|| SyncError::CredentialHelperError {
            helper: "ecr".to_string(),
            message: "no authorization data returned".to_string(),
        })?;

    let creds = decode_token("ecr", token)?;

    if let Err(e) = client
        .create_repository()
        .repository_name(repository)
        .send()
        .await
    {
        let already_exists = e
            .as_service_error()
            .map(|se| se.is_repository_already_exists_exception())
            .unwrap_or(false);
        if !already_exists {
            tracing::warn!(
                repository,
                error = %e,
                "Failed to create ECR repository, pushing might fail"
            );
        }
    }

    Ok(creds)
}

/// Obtain push credentials from ECR Public, ensuring `repository` exists.
/// The ECR Public API only exists in us-east-1.
pub async fn public_token(repository: &str) -> Result<EcrToken> {
    let config = aws_config::defaults(aws_config::BehaviorVersion::latest())
        .region(aws_config::Region::new("us-east-1"))
        .load()
        .await;
    let client = aws_sdk_ecrpublic::Client::new(&config);

    let out = client
        .get_authorization_token()
        .send()
        .await
        .map_err(|e| SyncError::CredentialHelperError {
            helper: "ecr-public".to_string(),
            message: format!("GetAuthorizationToken failed: {}", e),
        })?;

    let token = out
        .authorization_data()
        .and_then(|d| d.authorization_token())
        .ok_or_else(|| SyncError::CredentialHelperError {
            helper: "ecr-public".to_string(),
            message: "no authorization data returned".to_string(),
        })?;

    let creds = decode_token("ecr-public", token)?;

    if let Err(e) = client
        .create_repository()
        .repository_name(repository)
        .send()
        .await
    {
        let already_exists = e
            .as_service_error()
            .map(|se| se.is_repository_already_exists_exception())
            .unwrap_or(false);
        if !already_exists {
            tracing::warn!(
                repository,
                error = %e,
                "Failed to create ECR Public repository, pushing might fail"
            );
        }
    }

    Ok(creds)
}
