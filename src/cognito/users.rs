use std::sync::Arc;

use super::clock::epoch_secs;
use super::error::CognitoError;
use super::messages::MessageSource;
use super::pool::{
    attribute, set_attribute, IssuedCode, User, UserStatus,
};
use super::state::{resolve_token_user, user_to_type, CognitoService};
use super::store::{Filter, MfaSetting, UserPoolService};
use super::triggers::{MigratedUser, TriggerHook};
use super::types::*;

impl CognitoService {
    // --- Sign-up and confirmation ---

    pub async fn sign_up(&self, req: SignUpRequest) -> Result<SignUpResponse, CognitoError> {
        let pool_service = self.get_user_pool_for_client_id(&req.client_id).await?;
        let pool = pool_service.snapshot().await;

        if pool_service
            .get_user_by_username(&req.username)
            .await
            .is_some()
        {
            return Err(CognitoError::UsernameExists(req.username));
        }
        pool.password_policy.validate(&req.password)?;
        pool.validate_attributes(&req.user_attributes, false)?;

        let metadata = req.client_metadata.unwrap_or_default();
        let outcome = if self.triggers.enabled(TriggerHook::PreSignUp) {
            self.triggers
                .pre_sign_up(
                    "PreSignUp_SignUp",
                    &pool.id,
                    &req.username,
                    &req.client_id,
                    &req.user_attributes,
                    &metadata,
                )
                .await?
        } else {
            Default::default()
        };

        let sub = self.ids.new_id().to_string();
        let mut attributes = req.user_attributes;
        set_attribute(&mut attributes, "sub", sub.clone());
        if outcome.auto_verify_email {
            set_attribute(&mut attributes, "email_verified", "true");
        }
        if outcome.auto_verify_phone {
            set_attribute(&mut attributes, "phone_number_verified", "true");
        }

        let status = if outcome.auto_confirm {
            UserStatus::Confirmed
        } else {
            UserStatus::Unconfirmed
        };
        let mut user = User::new(
            req.username.clone(),
            attributes,
            Some(req.password),
            status,
            self.clock.now(),
        );

        let mut code_delivery_details = None;
        if status == UserStatus::Unconfirmed {
            let code = self.otp.generate();
            user.confirmation_code = Some(IssuedCode {
                code: code.clone(),
                issued_at: self.clock.now(),
            });
            code_delivery_details = self
                .messages
                .deliver(
                    &self.triggers,
                    &pool,
                    &req.client_id,
                    &user,
                    MessageSource::SignUp,
                    &code,
                )
                .await?
                .map(|d| CodeDeliveryDetailsType {
                    destination: d.destination,
                    delivery_medium: d.delivery_medium,
                    attribute_name: d.attribute_name,
                });
        }

        let user = pool_service.save_user(user).await?;
        tracing::info!(pool_id = %pool.id, username = %user.username, confirmed = outcome.auto_confirm, "user signed up");

        if outcome.auto_confirm && self.triggers.enabled(TriggerHook::PostConfirmation) {
            self.triggers
                .post_confirmation(
                    "PostConfirmation_ConfirmSignUp",
                    &pool.id,
                    &user.username,
                    &req.client_id,
                    &user.attributes,
                )
                .await;
        }

        Ok(SignUpResponse {
            user_confirmed: outcome.auto_confirm,
            user_sub: sub,
            code_delivery_details,
        })
    }

    pub async fn confirm_sign_up(&self, req: ConfirmSignUpRequest) -> Result<(), CognitoError> {
        let pool_service = self.get_user_pool_for_client_id(&req.client_id).await?;
        let now = self.clock.now();

        let user = pool_service
            .update_user(&req.username, |user| {
                if user.user_status != UserStatus::Unconfirmed {
                    return Err(CognitoError::NotAuthorized(format!(
                        "User cannot be confirmed. Current status is {}",
                        user.user_status.as_str()
                    )));
                }
                let stored = user
                    .confirmation_code
                    .as_ref()
                    .ok_or_else(|| CognitoError::CodeMismatch("No confirmation code".into()))?;
                if stored.is_expired(now) {
                    return Err(CognitoError::ExpiredCode);
                }
                if stored.code != req.confirmation_code {
                    return Err(CognitoError::CodeMismatch(
                        "Invalid verification code provided, please try again.".into(),
                    ));
                }
                user.user_status = UserStatus::Confirmed;
                user.confirmation_code = None;
                Ok(user.clone())
            })
            .await?;

        if self.triggers.enabled(TriggerHook::PostConfirmation) {
            let pool_id = pool_service.pool_id().await;
            self.triggers
                .post_confirmation(
                    "PostConfirmation_ConfirmSignUp",
                    &pool_id,
                    &user.username,
                    &req.client_id,
                    &user.attributes,
                )
                .await;
        }
        Ok(())
    }

    pub async fn admin_confirm_sign_up(
        &self,
        req: AdminConfirmSignUpRequest,
    ) -> Result<(), CognitoError> {
        let pool_service = self.get_user_pool(&req.user_pool_id).await?;
        let user = pool_service
            .update_user(&req.username, |user| {
                if user.user_status != UserStatus::Unconfirmed {
                    return Err(CognitoError::NotAuthorized(format!(
                        "User cannot be confirmed. Current status is {}",
                        user.user_status.as_str()
                    )));
                }
                user.user_status = UserStatus::Confirmed;
                user.confirmation_code = None;
                Ok(user.clone())
            })
            .await?;

        if self.triggers.enabled(TriggerHook::PostConfirmation) {
            self.triggers
                .post_confirmation(
                    "PostConfirmation_AdminConfirmSignUp",
                    &req.user_pool_id,
                    &user.username,
                    "",
                    &user.attributes,
                )
                .await;
        }
        Ok(())
    }

    // --- Admin user management ---

    pub async fn admin_create_user(
        &self,
        req: AdminCreateUserRequest,
    ) -> Result<AdminCreateUserResponse, CognitoError> {
        let pool_service = self.get_user_pool(&req.user_pool_id).await?;
        let pool = pool_service.snapshot().await;

        if req.message_action.as_deref() == Some("RESEND") {
            let user = pool_service
                .get_user_by_username(&req.username)
                .await
                .ok_or_else(|| CognitoError::UserNotFound(req.username.clone()))?;
            if let Some(password) = &user.password {
                self.messages
                    .deliver(
                        &self.triggers,
                        &pool,
                        "",
                        &user,
                        MessageSource::AdminCreateUser,
                        password,
                    )
                    .await?;
            }
            return Ok(AdminCreateUserResponse {
                user: user_to_type(&user),
            });
        }

        if pool_service
            .get_user_by_username(&req.username)
            .await
            .is_some()
        {
            return Err(CognitoError::UsernameExists(req.username));
        }
        pool.validate_attributes(&req.user_attributes, false)?;

        let temporary_password = match req.temporary_password {
            Some(password) => {
                pool.password_policy.validate(&password)?;
                password
            }
            None => generated_password(self),
        };

        let mut attributes = req.user_attributes;
        set_attribute(&mut attributes, "sub", self.ids.new_id().to_string());

        let user = User::new(
            req.username.clone(),
            attributes,
            Some(temporary_password.clone()),
            UserStatus::ForceChangePassword,
            self.clock.now(),
        );
        let user = pool_service.save_user(user).await?;

        if req.message_action.as_deref() != Some("SUPPRESS") {
            self.messages
                .deliver(
                    &self.triggers,
                    &pool,
                    "",
                    &user,
                    MessageSource::AdminCreateUser,
                    &temporary_password,
                )
                .await?;
        }

        Ok(AdminCreateUserResponse {
            user: user_to_type(&user),
        })
    }

    pub async fn admin_delete_user(&self, req: AdminDeleteUserRequest) -> Result<(), CognitoError> {
        let pool_service = self.get_user_pool(&req.user_pool_id).await?;
        pool_service.delete_user(&req.username).await
    }

    pub async fn admin_get_user(
        &self,
        req: AdminGetUserRequest,
    ) -> Result<AdminGetUserResponse, CognitoError> {
        let pool_service = self.get_user_pool(&req.user_pool_id).await?;
        let user = pool_service
            .get_user_by_username(&req.username)
            .await
            .ok_or_else(|| CognitoError::UserNotFound(req.username.clone()))?;
        Ok(AdminGetUserResponse {
            username: user.username.clone(),
            user_attributes: user.attributes.clone(),
            user_create_date: epoch_secs(user.create_date),
            user_last_modified_date: epoch_secs(user.last_modified_date),
            enabled: user.enabled,
            user_status: user.user_status.as_str().to_string(),
            mfa_options: user.mfa_options.clone(),
            user_mfa_setting_list: user.user_mfa_setting_list.clone(),
            preferred_mfa_setting: user.preferred_mfa_setting.clone(),
        })
    }

    pub async fn admin_set_user_password(
        &self,
        req: AdminSetUserPasswordRequest,
    ) -> Result<(), CognitoError> {
        let pool_service = self.get_user_pool(&req.user_pool_id).await?;
        let policy = pool_service.snapshot().await.password_policy;
        policy.validate(&req.password)?;
        pool_service
            .update_user(&req.username, |user| {
                user.password = Some(req.password.clone());
                user.user_status = if req.permanent {
                    UserStatus::Confirmed
                } else {
                    UserStatus::ForceChangePassword
                };
                Ok(())
            })
            .await
    }

    pub async fn admin_enable_user(&self, req: AdminEnableUserRequest) -> Result<(), CognitoError> {
        let pool_service = self.get_user_pool(&req.user_pool_id).await?;
        pool_service
            .update_user(&req.username, |user| {
                user.enabled = true;
                Ok(())
            })
            .await
    }

    pub async fn admin_disable_user(
        &self,
        req: AdminDisableUserRequest,
    ) -> Result<(), CognitoError> {
        let pool_service = self.get_user_pool(&req.user_pool_id).await?;
        pool_service
            .update_user(&req.username, |user| {
                user.enabled = false;
                Ok(())
            })
            .await
    }

    pub async fn admin_reset_user_password(
        &self,
        req: AdminResetUserPasswordRequest,
    ) -> Result<(), CognitoError> {
        let pool_service = self.get_user_pool(&req.user_pool_id).await?;
        pool_service
            .update_user(&req.username, |user| {
                user.user_status = UserStatus::ResetRequired;
                Ok(())
            })
            .await
    }

    pub async fn admin_update_user_attributes(
        &self,
        req: AdminUpdateUserAttributesRequest,
    ) -> Result<(), CognitoError> {
        let pool_service = self.get_user_pool(&req.user_pool_id).await?;
        let pool = pool_service.snapshot().await;
        pool.validate_attributes(&req.user_attributes, true)?;
        pool_service
            .update_user(&req.username, |user| {
                apply_attribute_updates(user, &req.user_attributes);
                Ok(())
            })
            .await
    }

    pub async fn admin_user_global_sign_out(
        &self,
        req: AdminUserGlobalSignOutRequest,
    ) -> Result<(), CognitoError> {
        let pool_service = self.get_user_pool(&req.user_pool_id).await?;
        pool_service.clear_refresh_tokens(&req.username).await
    }

    pub async fn list_users(&self, req: ListUsersRequest) -> Result<ListUsersResponse, CognitoError> {
        let pool_service = self.get_user_pool(&req.user_pool_id).await?;
        let filter = match req.filter.as_deref() {
            Some(raw) => Filter::parse(raw)?,
            None => None,
        };
        let limit = req.limit.unwrap_or(60).min(60);
        let (users, pagination_token) = pool_service
            .list_users(filter.as_ref(), req.pagination_token.as_deref(), limit)
            .await?;
        Ok(ListUsersResponse {
            users: users.iter().map(user_to_type).collect(),
            pagination_token,
        })
    }

    // --- Access-token-authenticated self-service ---

    pub async fn get_user(&self, req: GetUserRequest) -> Result<GetUserResponse, CognitoError> {
        let (_pool, user) = resolve_token_user(self, &req.access_token).await?;
        Ok(GetUserResponse {
            username: user.username.clone(),
            user_attributes: user.attributes.clone(),
            mfa_options: user.mfa_options.clone(),
            user_mfa_setting_list: user.user_mfa_setting_list.clone(),
            preferred_mfa_setting: user.preferred_mfa_setting.clone(),
        })
    }

    pub async fn delete_user(&self, req: DeleteUserRequest) -> Result<(), CognitoError> {
        let (pool_service, user) = resolve_token_user(self, &req.access_token).await?;
        pool_service.delete_user(&user.username).await
    }

    pub async fn update_user_attributes(
        &self,
        req: UpdateUserAttributesRequest,
    ) -> Result<(), CognitoError> {
        let (pool_service, user) = resolve_token_user(self, &req.access_token).await?;
        let pool = pool_service.snapshot().await;
        pool.validate_attributes(&req.user_attributes, true)?;
        pool_service
            .update_user(&user.username, |user| {
                apply_attribute_updates(user, &req.user_attributes);
                Ok(())
            })
            .await
    }

    pub async fn change_password(&self, req: ChangePasswordRequest) -> Result<(), CognitoError> {
        let (pool_service, user) = resolve_token_user(self, &req.access_token).await?;
        let policy = pool_service.snapshot().await.password_policy;
        policy.validate(&req.proposed_password)?;
        pool_service
            .update_user(&user.username, |user| {
                if user.password.as_deref() != Some(req.previous_password.as_str()) {
                    return Err(CognitoError::InvalidPassword);
                }
                user.password = Some(req.proposed_password.clone());
                Ok(())
            })
            .await
    }

    pub async fn set_user_mfa_preference(
        &self,
        req: SetUserMFAPreferenceRequest,
    ) -> Result<(), CognitoError> {
        let (pool_service, user) = resolve_token_user(self, &req.access_token).await?;
        pool_service
            .set_user_mfa_preference(
                &user.username,
                req.sms_mfa_settings.map(to_mfa_setting),
                req.software_token_mfa_settings.map(to_mfa_setting),
            )
            .await
    }

    pub async fn global_sign_out(&self, req: GlobalSignOutRequest) -> Result<(), CognitoError> {
        let (pool_service, user) = resolve_token_user(self, &req.access_token).await?;
        pool_service.clear_refresh_tokens(&user.username).await
    }

    // --- Password recovery ---

    pub async fn forgot_password(
        &self,
        req: ForgotPasswordRequest,
    ) -> Result<ForgotPasswordResponse, CognitoError> {
        let pool_service = self.get_user_pool_for_client_id(&req.client_id).await?;
        let pool = pool_service.snapshot().await;

        let user = match pool_service.get_user_by_username(&req.username).await {
            Some(user) => user,
            None if self.triggers.enabled(TriggerHook::UserMigration) => {
                let migrated = self
                    .triggers
                    .user_migration(
                        "UserMigration_ForgotPassword",
                        &pool.id,
                        &req.username,
                        "",
                        &req.client_id,
                        &Default::default(),
                    )
                    .await
                    .ok_or_else(|| CognitoError::UserNotFound(req.username.clone()))?;
                persist_migrated_user(self, &pool_service, &req.username, None, migrated).await?
            }
            None => return Err(CognitoError::UserNotFound(req.username.clone())),
        };

        let code = self.otp.generate();
        let delivery = self
            .messages
            .deliver(
                &self.triggers,
                &pool,
                &req.client_id,
                &user,
                MessageSource::ForgotPassword,
                &code,
            )
            .await?;
        let issued_at = self.clock.now();
        pool_service
            .update_user(&user.username, |user| {
                user.reset_code = Some(IssuedCode {
                    code: code.clone(),
                    issued_at,
                });
                Ok(())
            })
            .await?;

        Ok(ForgotPasswordResponse {
            code_delivery_details: delivery.map(|d| CodeDeliveryDetailsType {
                destination: d.destination,
                delivery_medium: d.delivery_medium,
                attribute_name: d.attribute_name,
            }),
        })
    }

    pub async fn confirm_forgot_password(
        &self,
        req: ConfirmForgotPasswordRequest,
    ) -> Result<(), CognitoError> {
        let pool_service = self.get_user_pool_for_client_id(&req.client_id).await?;
        let policy = pool_service.snapshot().await.password_policy;
        policy.validate(&req.password)?;
        let now = self.clock.now();
        pool_service
            .update_user(&req.username, |user| {
                let stored = user
                    .reset_code
                    .as_ref()
                    .ok_or_else(|| CognitoError::CodeMismatch("No reset code requested".into()))?;
                if stored.is_expired(now) {
                    return Err(CognitoError::ExpiredCode);
                }
                if stored.code != req.confirmation_code {
                    return Err(CognitoError::CodeMismatch(
                        "Invalid verification code provided, please try again.".into(),
                    ));
                }
                user.password = Some(req.password.clone());
                user.reset_code = None;
                user.user_status = UserStatus::Confirmed;
                Ok(())
            })
            .await
    }
}

/// Write through an ordered attribute list; a changed email or phone
/// number drops its verified flag unless the update sets one explicitly.
fn apply_attribute_updates(user: &mut User, updates: &[super::pool::Attribute]) {
    let explicit_email_flag = updates.iter().any(|a| a.name == "email_verified");
    let explicit_phone_flag = updates.iter().any(|a| a.name == "phone_number_verified");
    for update in updates {
        if update.name == "email" && !explicit_email_flag {
            set_attribute(&mut user.attributes, "email_verified", "false");
        }
        if update.name == "phone_number" && !explicit_phone_flag {
            set_attribute(&mut user.attributes, "phone_number_verified", "false");
        }
        set_attribute(&mut user.attributes, &update.name, update.value.clone());
    }
}

fn to_mfa_setting(settings: MfaSettingsType) -> MfaSetting {
    MfaSetting {
        enabled: settings.enabled,
        preferred: settings.preferred_mfa,
    }
}

/// Satisfies the default policy classes regardless of pool settings.
fn generated_password(service: &CognitoService) -> String {
    let entropy: String = service
        .ids
        .new_id()
        .to_string()
        .replace('-', "")
        .chars()
        .take(10)
        .collect();
    format!("Tmp!{entropy}A1")
}

/// Persist the synthetic user a UserMigration handler returned.
pub(super) async fn persist_migrated_user(
    service: &CognitoService,
    pool_service: &Arc<UserPoolService>,
    username: &str,
    password: Option<&str>,
    migrated: MigratedUser,
) -> Result<User, CognitoError> {
    let mut attributes = migrated.attributes;
    if attributes.iter().all(|a| a.name != "sub") {
        attributes.insert(0, attribute("sub", service.ids.new_id().to_string()));
    }
    let status = migrated.final_status.unwrap_or(UserStatus::Confirmed);
    let user = User::new(
        username.to_string(),
        attributes,
        password.map(String::from),
        status,
        service.clock.now(),
    );
    pool_service.save_user(user).await
}
