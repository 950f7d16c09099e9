use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;

use super::error::CognitoError;
use super::state::CognitoService;
use super::types::*;

macro_rules! dispatch {
    ($state:expr, $body:expr, $req_type:ty, $method:ident) => {{
        let req: $req_type = serde_json::from_slice(&$body)
            .map_err(|e| CognitoError::InvalidParameter(e.to_string()))?;
        let resp = $state.$method(req).await?;
        Ok(Json(serde_json::to_value(resp).unwrap()).into_response())
    }};
}

macro_rules! dispatch_empty {
    ($state:expr, $body:expr, $req_type:ty, $method:ident) => {{
        let req: $req_type = serde_json::from_slice(&$body)
            .map_err(|e| CognitoError::InvalidParameter(e.to_string()))?;
        $state.$method(req).await?;
        Ok(Json(serde_json::json!({})).into_response())
    }};
}

async fn handle_request(
    State(state): State<Arc<CognitoService>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<axum::response::Response, CognitoError> {
    let target = headers
        .get("x-amz-target")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| CognitoError::InvalidParameter("Missing X-Amz-Target header".into()))?;

    let action = target
        .strip_prefix("AWSCognitoIdentityProviderService.")
        .ok_or_else(|| CognitoError::InvalidParameter(format!("Invalid target: {target}")))?;

    tracing::debug!(%action, "dispatching target");

    match action {
        // User pools
        "CreateUserPool" => dispatch!(state, body, CreateUserPoolRequest, create_user_pool),
        "DeleteUserPool" => {
            dispatch_empty!(state, body, DeleteUserPoolRequest, delete_user_pool)
        }
        "DescribeUserPool" => {
            dispatch!(state, body, DescribeUserPoolRequest, describe_user_pool)
        }
        "ListUserPools" => dispatch!(state, body, ListUserPoolsRequest, list_user_pools),
        "UpdateUserPool" => {
            dispatch_empty!(state, body, UpdateUserPoolRequest, update_user_pool)
        }
        "GetUserPoolMfaConfig" => {
            dispatch!(
                state,
                body,
                GetUserPoolMfaConfigRequest,
                get_user_pool_mfa_config
            )
        }
        "SetUserPoolMfaConfig" => {
            dispatch!(
                state,
                body,
                SetUserPoolMfaConfigRequest,
                set_user_pool_mfa_config
            )
        }
        // App clients
        "CreateUserPoolClient" => {
            dispatch!(
                state,
                body,
                CreateUserPoolClientRequest,
                create_user_pool_client
            )
        }
        "DeleteUserPoolClient" => {
            dispatch_empty!(
                state,
                body,
                DeleteUserPoolClientRequest,
                delete_user_pool_client
            )
        }
        "DescribeUserPoolClient" => {
            dispatch!(
                state,
                body,
                DescribeUserPoolClientRequest,
                describe_user_pool_client
            )
        }
        "ListUserPoolClients" => {
            dispatch!(
                state,
                body,
                ListUserPoolClientsRequest,
                list_user_pool_clients
            )
        }
        "UpdateUserPoolClient" => {
            dispatch!(
                state,
                body,
                UpdateUserPoolClientRequest,
                update_user_pool_client
            )
        }
        // Admin user management
        "AdminCreateUser" => {
            dispatch!(state, body, AdminCreateUserRequest, admin_create_user)
        }
        "AdminConfirmSignUp" => {
            dispatch_empty!(state, body, AdminConfirmSignUpRequest, admin_confirm_sign_up)
        }
        "AdminDeleteUser" => {
            dispatch_empty!(state, body, AdminDeleteUserRequest, admin_delete_user)
        }
        "AdminGetUser" => dispatch!(state, body, AdminGetUserRequest, admin_get_user),
        "AdminSetUserPassword" => {
            dispatch_empty!(
                state,
                body,
                AdminSetUserPasswordRequest,
                admin_set_user_password
            )
        }
        "AdminEnableUser" => {
            dispatch_empty!(state, body, AdminEnableUserRequest, admin_enable_user)
        }
        "AdminDisableUser" => {
            dispatch_empty!(state, body, AdminDisableUserRequest, admin_disable_user)
        }
        "AdminResetUserPassword" => {
            dispatch_empty!(
                state,
                body,
                AdminResetUserPasswordRequest,
                admin_reset_user_password
            )
        }
        "AdminUpdateUserAttributes" => {
            dispatch_empty!(
                state,
                body,
                AdminUpdateUserAttributesRequest,
                admin_update_user_attributes
            )
        }
        "AdminUserGlobalSignOut" => {
            dispatch_empty!(
                state,
                body,
                AdminUserGlobalSignOutRequest,
                admin_user_global_sign_out
            )
        }
        // Groups
        "CreateGroup" => dispatch!(state, body, CreateGroupRequest, create_group),
        "DeleteGroup" => dispatch_empty!(state, body, DeleteGroupRequest, delete_group),
        "GetGroup" => dispatch!(state, body, GetGroupRequest, get_group),
        "UpdateGroup" => dispatch!(state, body, UpdateGroupRequest, update_group),
        "ListGroups" => dispatch!(state, body, ListGroupsRequest, list_groups),
        "AdminAddUserToGroup" => {
            dispatch_empty!(
                state,
                body,
                AdminAddUserToGroupRequest,
                admin_add_user_to_group
            )
        }
        "AdminRemoveUserFromGroup" => {
            dispatch_empty!(
                state,
                body,
                AdminRemoveUserFromGroupRequest,
                admin_remove_user_from_group
            )
        }
        "AdminListGroupsForUser" => {
            dispatch!(
                state,
                body,
                AdminListGroupsForUserRequest,
                admin_list_groups_for_user
            )
        }
        "ListUsersInGroup" => {
            dispatch!(state, body, ListUsersInGroupRequest, list_users_in_group)
        }
        // Users
        "SignUp" => dispatch!(state, body, SignUpRequest, sign_up),
        "ConfirmSignUp" => {
            dispatch_empty!(state, body, ConfirmSignUpRequest, confirm_sign_up)
        }
        "ListUsers" => dispatch!(state, body, ListUsersRequest, list_users),
        "GetUser" => dispatch!(state, body, GetUserRequest, get_user),
        "DeleteUser" => dispatch_empty!(state, body, DeleteUserRequest, delete_user),
        "UpdateUserAttributes" => {
            dispatch_empty!(
                state,
                body,
                UpdateUserAttributesRequest,
                update_user_attributes
            )
        }
        "ChangePassword" => {
            dispatch_empty!(state, body, ChangePasswordRequest, change_password)
        }
        "ForgotPassword" => dispatch!(state, body, ForgotPasswordRequest, forgot_password),
        "ConfirmForgotPassword" => {
            dispatch_empty!(
                state,
                body,
                ConfirmForgotPasswordRequest,
                confirm_forgot_password
            )
        }
        // Authentication
        "InitiateAuth" => dispatch!(state, body, InitiateAuthRequest, initiate_auth),
        "AdminInitiateAuth" => {
            dispatch!(state, body, AdminInitiateAuthRequest, admin_initiate_auth)
        }
        "RespondToAuthChallenge" => {
            dispatch!(
                state,
                body,
                RespondToAuthChallengeRequest,
                respond_to_auth_challenge
            )
        }
        "SetUserMFAPreference" => {
            dispatch_empty!(
                state,
                body,
                SetUserMFAPreferenceRequest,
                set_user_mfa_preference
            )
        }
        "GlobalSignOut" => {
            dispatch_empty!(state, body, GlobalSignOutRequest, global_sign_out)
        }
        "RevokeToken" => dispatch_empty!(state, body, RevokeTokenRequest, revoke_token),
        _ => Err(CognitoError::Unsupported(format!("target {action}"))),
    }
}

async fn jwks_document(
    State(state): State<Arc<CognitoService>>,
    Path(_pool_id): Path<String>,
) -> impl IntoResponse {
    (
        [
            (header::CONTENT_TYPE, "application/json"),
            (header::CACHE_CONTROL, "public, max-age=3600"),
        ],
        Json(state.jwks()),
    )
}

async fn openid_configuration(
    State(state): State<Arc<CognitoService>>,
    Path(pool_id): Path<String>,
) -> impl IntoResponse {
    let issuer = state.issuer(&pool_id);
    Json(json!({
        "issuer": issuer,
        "jwks_uri": format!("{issuer}/.well-known/jwks.json"),
        "id_token_signing_alg_values_supported": ["RS256"],
    }))
}

pub fn create_router(state: Arc<CognitoService>) -> Router {
    Router::new()
        .route("/", post(handle_request))
        .route("/:pool_id/.well-known/jwks.json", get(jwks_document))
        .route(
            "/:pool_id/.well-known/openid-configuration",
            get(openid_configuration),
        )
        .with_state(state)
}
