use std::collections::HashMap;
use std::sync::Arc;

use super::error::CognitoError;
use super::pool::{attributes_to_map, set_attribute, AppClient, MfaConfig, User, UserStatus};
use super::state::{require_user_match, CognitoService};
use super::store::UserPoolService;
use super::tokens::{IssueReason, DEFAULT_SCOPE};
use super::triggers::TriggerHook;
use super::types::*;
use super::users::persist_migrated_user;

pub const MFA_STUB_CODE: &str = "999999";

impl CognitoService {
    pub async fn initiate_auth(
        &self,
        req: InitiateAuthRequest,
    ) -> Result<InitiateAuthResponse, CognitoError> {
        let (pool_service, client) = self.resolve_auth_client(&req.client_id).await?;
        let params = req.auth_parameters.unwrap_or_default();
        let metadata = req.client_metadata.unwrap_or_default();

        match req.auth_flow.as_str() {
            "USER_PASSWORD_AUTH" | "ADMIN_USER_PASSWORD_AUTH" | "ADMIN_NO_SRP_AUTH" => {
                self.password_auth(&pool_service, &client, &params, &metadata)
                    .await
            }
            "REFRESH_TOKEN" | "REFRESH_TOKEN_AUTH" => {
                self.refresh_auth(&pool_service, &client, &params).await
            }
            "USER_SRP_AUTH" => self.srp_auth(&pool_service, &params).await,
            flow => Err(CognitoError::Unsupported(format!("auth flow {flow}"))),
        }
    }

    pub async fn admin_initiate_auth(
        &self,
        req: AdminInitiateAuthRequest,
    ) -> Result<InitiateAuthResponse, CognitoError> {
        let pool_service = self.get_user_pool(&req.user_pool_id).await?;
        let snapshot = pool_service.snapshot().await;
        let client = snapshot.clients.get(&req.client_id).cloned().ok_or_else(|| {
            CognitoError::ResourceNotFound(format!(
                "User pool client {} not found.",
                req.client_id
            ))
        })?;
        let params = req.auth_parameters.unwrap_or_default();
        let metadata = req.client_metadata.unwrap_or_default();

        match req.auth_flow.as_str() {
            "ADMIN_USER_PASSWORD_AUTH" | "ADMIN_NO_SRP_AUTH" => {
                self.password_auth(&pool_service, &client, &params, &metadata)
                    .await
            }
            "REFRESH_TOKEN" | "REFRESH_TOKEN_AUTH" => {
                self.refresh_auth(&pool_service, &client, &params).await
            }
            flow => Err(CognitoError::Unsupported(format!("auth flow {flow}"))),
        }
    }

    pub async fn respond_to_auth_challenge(
        &self,
        req: RespondToAuthChallengeRequest,
    ) -> Result<InitiateAuthResponse, CognitoError> {
        let (pool_service, client) = self.resolve_auth_client(&req.client_id).await?;
        let responses = req.challenge_responses.unwrap_or_default();
        let username = responses
            .get("USERNAME")
            .cloned()
            .ok_or_else(|| CognitoError::InvalidParameter("USERNAME is required".into()))?;
        let session = req
            .session
            .as_deref()
            .ok_or_else(|| CognitoError::InvalidParameter("Session is required".into()))?;

        match req.challenge_name.as_str() {
            "NEW_PASSWORD_REQUIRED" => {
                let entry = self.take_session(session, "NEW_PASSWORD_REQUIRED").await?;
                require_user_match(&entry, &username)?;
                let new_password = responses.get("NEW_PASSWORD").cloned().ok_or_else(|| {
                    CognitoError::InvalidParameter("NEW_PASSWORD is required".into())
                })?;

                let snapshot = pool_service.snapshot().await;
                snapshot.password_policy.validate(&new_password)?;
                let updates: Vec<super::pool::Attribute> = responses
                    .iter()
                    .filter_map(|(key, value)| {
                        key.strip_prefix("userAttributes.").map(|name| {
                            super::pool::Attribute {
                                name: name.to_string(),
                                value: value.clone(),
                            }
                        })
                    })
                    .collect();
                snapshot.validate_attributes(&updates, true)?;

                let user = pool_service
                    .update_user(&username, |user| {
                        user.password = Some(new_password.clone());
                        user.user_status = UserStatus::Confirmed;
                        for update in &updates {
                            set_attribute(&mut user.attributes, &update.name, update.value.clone());
                        }
                        Ok(user.clone())
                    })
                    .await?;
                self.issue_tokens(&pool_service, &client, &user, IssueReason::Authentication)
                    .await
            }
            "SMS_MFA" | "SOFTWARE_TOKEN_MFA" => {
                let entry = self.take_session(session, &req.challenge_name).await?;
                require_user_match(&entry, &username)?;
                let code_field = if req.challenge_name == "SMS_MFA" {
                    "SMS_MFA_CODE"
                } else {
                    "SOFTWARE_TOKEN_MFA_CODE"
                };
                let code = responses.get(code_field).cloned().ok_or_else(|| {
                    CognitoError::InvalidParameter(format!("{code_field} is required"))
                })?;

                let user = pool_service
                    .update_user(&username, |user| {
                        let expected = user.mfa_code.clone().ok_or_else(|| {
                            CognitoError::NotAuthorized("No MFA challenge pending".into())
                        })?;
                        if expected != code {
                            return Err(CognitoError::CodeMismatch(
                                "Invalid code received for user".into(),
                            ));
                        }
                        user.mfa_code = None;
                        Ok(user.clone())
                    })
                    .await?;
                self.issue_tokens(&pool_service, &client, &user, IssueReason::Authentication)
                    .await
            }
            "PASSWORD_VERIFIER" => {
                let entry = self.take_session(session, "PASSWORD_VERIFIER").await?;
                require_user_match(&entry, &username)?;
                let password = responses.get("PASSWORD").cloned().ok_or_else(|| {
                    CognitoError::InvalidParameter("PASSWORD is required".into())
                })?;

                let user = pool_service
                    .get_user_by_username(&username)
                    .await
                    .ok_or(CognitoError::InvalidPassword)?;
                if !user.enabled {
                    return Err(CognitoError::NotAuthorized("User is disabled.".into()));
                }
                if user.password.as_deref() != Some(password.as_str()) {
                    return Err(CognitoError::InvalidPassword);
                }
                self.post_password_path(&pool_service, &client, user).await
            }
            name => Err(CognitoError::Unsupported(format!("challenge {name}"))),
        }
    }

    pub async fn revoke_token(&self, req: RevokeTokenRequest) -> Result<(), CognitoError> {
        let pool_service = self.get_user_pool_for_client_id(&req.client_id).await?;
        pool_service.revoke_refresh_token(&req.token).await
    }

    /// The state machine treats an unknown client as an authorization
    /// failure rather than a missing resource.
    async fn resolve_auth_client(
        &self,
        client_id: &str,
    ) -> Result<(Arc<UserPoolService>, AppClient), CognitoError> {
        match self.get_app_client(client_id).await {
            Ok(client) => {
                let pool_service = self.get_user_pool_for_client_id(client_id).await?;
                Ok((pool_service, client))
            }
            Err(CognitoError::ResourceNotFound(_)) => Err(CognitoError::NotAuthorized(format!(
                "Client {client_id} not found"
            ))),
            Err(err) => Err(err),
        }
    }

    async fn password_auth(
        &self,
        pool_service: &Arc<UserPoolService>,
        client: &AppClient,
        params: &HashMap<String, String>,
        metadata: &HashMap<String, String>,
    ) -> Result<InitiateAuthResponse, CognitoError> {
        let username = params
            .get("USERNAME")
            .cloned()
            .ok_or_else(|| CognitoError::InvalidParameter("USERNAME is required".into()))?;
        let password = params
            .get("PASSWORD")
            .cloned()
            .ok_or_else(|| CognitoError::InvalidParameter("PASSWORD is required".into()))?;
        let pool_id = pool_service.pool_id().await;

        let user = match pool_service.get_user_by_username(&username).await {
            Some(user) => user,
            None if self.triggers.enabled(TriggerHook::UserMigration) => {
                let migrated = self
                    .triggers
                    .user_migration(
                        "UserMigration_Authentication",
                        &pool_id,
                        &username,
                        &password,
                        &client.client_id,
                        metadata,
                    )
                    .await
                    .ok_or_else(|| {
                        CognitoError::NotAuthorized("Incorrect username or password.".into())
                    })?;
                persist_migrated_user(self, pool_service, &username, Some(&password), migrated)
                    .await?
            }
            None => {
                return Err(CognitoError::NotAuthorized(
                    "Incorrect username or password.".into(),
                ))
            }
        };

        if !user.enabled {
            return Err(CognitoError::NotAuthorized("User is disabled.".into()));
        }

        match user.user_status {
            UserStatus::ResetRequired => return Err(CognitoError::PasswordResetRequired),
            UserStatus::ForceChangePassword => {
                let session = self
                    .create_session(&pool_id, &user.username, "NEW_PASSWORD_REQUIRED")
                    .await;
                let user_attributes = serde_json::to_string(&attributes_to_map(&user.attributes))
                    .map_err(|e| CognitoError::InternalError(e.to_string()))?;
                let parameters = HashMap::from([
                    ("USER_ID_FOR_SRP".to_string(), user.username.clone()),
                    ("requiredAttributes".to_string(), "[]".to_string()),
                    ("userAttributes".to_string(), user_attributes),
                ]);
                return Ok(challenge_response(
                    "NEW_PASSWORD_REQUIRED",
                    parameters,
                    session,
                ));
            }
            _ => {}
        }

        if self.triggers.enabled(TriggerHook::PreAuthentication) {
            self.triggers
                .pre_authentication(&pool_id, &user.username, &client.client_id, &user.attributes)
                .await?;
        }

        if user.password.as_deref() != Some(password.as_str()) {
            return Err(CognitoError::InvalidPassword);
        }

        self.post_password_path(pool_service, client, user).await
    }

    /// Everything after a successful password check: the confirmation
    /// gate, the MFA gate, PostAuthentication, then token issuance. The
    /// UNCONFIRMED failure deliberately comes after the password check.
    async fn post_password_path(
        &self,
        pool_service: &Arc<UserPoolService>,
        client: &AppClient,
        user: User,
    ) -> Result<InitiateAuthResponse, CognitoError> {
        if user.user_status == UserStatus::Unconfirmed {
            return Err(CognitoError::UserNotConfirmed);
        }

        let pool = pool_service.snapshot().await;
        let mfa_required = match pool.mfa_configuration {
            MfaConfig::On => true,
            MfaConfig::Optional => !user.mfa_options.is_empty(),
            MfaConfig::Off => false,
        };
        if mfa_required {
            return self.mfa_challenge(pool_service, client, user).await;
        }

        if self.triggers.enabled(TriggerHook::PostAuthentication) {
            self.triggers
                .post_authentication(&pool.id, &user.username, &client.client_id, &user.attributes)
                .await?;
        }

        self.issue_tokens(pool_service, client, &user, IssueReason::Authentication)
            .await
    }

    async fn mfa_challenge(
        &self,
        pool_service: &Arc<UserPoolService>,
        client: &AppClient,
        user: User,
    ) -> Result<InitiateAuthResponse, CognitoError> {
        if user.user_mfa_setting_list.is_empty() {
            return Err(CognitoError::NotAuthorized(
                "MFA is required but no MFA method is configured".into(),
            ));
        }
        if !user
            .user_mfa_setting_list
            .iter()
            .any(|s| s == "SOFTWARE_TOKEN_MFA")
        {
            return Err(CognitoError::Unsupported(
                "MFA challenge without SOFTWARE_TOKEN".into(),
            ));
        }

        let pool = pool_service.snapshot().await;
        let user = pool_service
            .update_user(&user.username, |user| {
                user.mfa_code = Some(MFA_STUB_CODE.to_string());
                Ok(user.clone())
            })
            .await?;
        self.messages
            .deliver(
                &self.triggers,
                &pool,
                &client.client_id,
                &user,
                super::messages::MessageSource::Authentication,
                MFA_STUB_CODE,
            )
            .await?;

        let session = self
            .create_session(&pool.id, &user.username, "SOFTWARE_TOKEN_MFA")
            .await;
        let parameters = HashMap::from([(
            "USER_ID_FOR_SRP".to_string(),
            user.username.clone(),
        )]);
        Ok(challenge_response("SOFTWARE_TOKEN_MFA", parameters, session))
    }

    async fn refresh_auth(
        &self,
        pool_service: &Arc<UserPoolService>,
        client: &AppClient,
        params: &HashMap<String, String>,
    ) -> Result<InitiateAuthResponse, CognitoError> {
        let token = params
            .get("REFRESH_TOKEN")
            .cloned()
            .ok_or_else(|| CognitoError::InvalidParameter("REFRESH_TOKEN is required".into()))?;

        let user = pool_service
            .get_user_by_refresh_token(&token)
            .await
            .ok_or_else(|| CognitoError::NotAuthorized("Invalid Refresh Token".into()))?;
        if !user.enabled {
            return Err(CognitoError::NotAuthorized("User is disabled.".into()));
        }

        // No rotation: the presented token stays valid and is not echoed.
        self.issue_tokens(pool_service, client, &user, IssueReason::RefreshTokens)
            .await
    }

    async fn srp_auth(
        &self,
        pool_service: &Arc<UserPoolService>,
        params: &HashMap<String, String>,
    ) -> Result<InitiateAuthResponse, CognitoError> {
        let username = params
            .get("USERNAME")
            .cloned()
            .ok_or_else(|| CognitoError::InvalidParameter("USERNAME is required".into()))?;
        let pool_id = pool_service.pool_id().await;
        // SRP is short-circuited: the follow-up PASSWORD_VERIFIER response
        // authenticates with plain password equality.
        let session = self
            .create_session(&pool_id, &username, "PASSWORD_VERIFIER")
            .await;
        Ok(challenge_response(
            "PASSWORD_VERIFIER",
            HashMap::new(),
            session,
        ))
    }

    /// Mint tokens (running PreTokenGeneration when bound), persist the
    /// refresh token, and shape the wire result.
    async fn issue_tokens(
        &self,
        pool_service: &Arc<UserPoolService>,
        client: &AppClient,
        user: &User,
        reason: IssueReason,
    ) -> Result<InitiateAuthResponse, CognitoError> {
        let pool = pool_service.snapshot().await;
        let groups: Vec<String> = pool
            .groups_for_member(&user.username)
            .into_iter()
            .map(|g| g.group_name.clone())
            .collect();

        let claims_override = if self.triggers.enabled(TriggerHook::PreTokenGeneration) {
            self.triggers
                .pre_token_generation(
                    reason.trigger_source(),
                    &pool.id,
                    &user.username,
                    &client.client_id,
                    &user.attributes,
                    &groups,
                    &[DEFAULT_SCOPE.to_string()],
                )
                .await?
        } else {
            None
        };

        let set = self.tokens.generate(
            &pool,
            client,
            user,
            &groups,
            reason,
            claims_override.as_ref(),
        )?;
        if let Some(refresh_token) = &set.refresh_token {
            pool_service
                .store_refresh_token(refresh_token, &user.username)
                .await?;
        }
        tracing::debug!(pool_id = %pool.id, username = %user.username, ?reason, "issued tokens");

        Ok(InitiateAuthResponse {
            authentication_result: Some(AuthenticationResultType {
                access_token: set.access_token,
                expires_in: set.expires_in,
                token_type: "Bearer".to_string(),
                refresh_token: set.refresh_token,
                id_token: set.id_token,
            }),
            challenge_name: None,
            challenge_parameters: None,
            session: None,
        })
    }
}

fn challenge_response(
    name: &str,
    parameters: HashMap<String, String>,
    session: String,
) -> InitiateAuthResponse {
    InitiateAuthResponse {
        authentication_result: None,
        challenge_name: Some(name.to_string()),
        challenge_parameters: Some(parameters),
        session: Some(session),
    }
}
