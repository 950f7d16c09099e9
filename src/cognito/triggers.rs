use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::error::CognitoError;
use super::pool::{Attribute, UserStatus};

/// Lifecycle hooks the runtime can bind user-supplied handlers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TriggerHook {
    UserMigration,
    PreSignUp,
    PostConfirmation,
    PreAuthentication,
    PostAuthentication,
    PreTokenGeneration,
    CustomMessage,
    CustomEmailSender,
    #[serde(rename = "CustomSMSSender")]
    CustomSmsSender,
}

pub const DEFAULT_TRIGGER_TIMEOUT: Duration = Duration::from_secs(5);

/// The uniform envelope every handler receives and may mutate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerEvent {
    pub version: String,
    pub trigger_source: String,
    pub region: String,
    pub user_pool_id: String,
    pub user_name: String,
    pub caller_context: CallerContext,
    pub request: Value,
    pub response: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallerContext {
    pub aws_sdk_version: String,
    pub client_id: String,
}

/// Failure reported by a handler (or by its transport / timeout).
#[derive(Debug, Clone)]
pub struct TriggerError {
    pub code: Option<String>,
    pub message: String,
}

impl TriggerError {
    fn transport(message: impl Into<String>) -> Self {
        TriggerError {
            code: None,
            message: message.into(),
        }
    }
}

impl From<TriggerError> for CognitoError {
    fn from(err: TriggerError) -> Self {
        CognitoError::Trigger {
            code: err.code,
            message: err.message,
        }
    }
}

/// A handler is an opaque invocable: it takes the envelope and returns the
/// mutated envelope or a failure. Production handlers live behind HTTP;
/// tests register in-process implementations.
#[async_trait]
pub trait TriggerInvoker: Send + Sync {
    async fn invoke(&self, event: TriggerEvent) -> Result<TriggerEvent, TriggerError>;
}

/// POSTs the envelope to an external endpoint and reads the mutated
/// envelope back. A non-2xx response carrying `errorType`/`errorMessage`
/// becomes the handler-reported failure.
pub struct HttpInvoker {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpInvoker {
    pub fn new(client: reqwest::Client, endpoint: String) -> Self {
        HttpInvoker { client, endpoint }
    }
}

#[async_trait]
impl TriggerInvoker for HttpInvoker {
    async fn invoke(&self, event: TriggerEvent) -> Result<TriggerEvent, TriggerError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&event)
            .send()
            .await
            .map_err(|e| TriggerError::transport(format!("trigger request failed: {e}")))?;

        let status = response.status();
        let body: Value = response
            .json()
            .await
            .map_err(|e| TriggerError::transport(format!("trigger response unreadable: {e}")))?;

        if !status.is_success() {
            return Err(TriggerError {
                code: body
                    .get("errorType")
                    .and_then(Value::as_str)
                    .map(String::from),
                message: body
                    .get("errorMessage")
                    .and_then(Value::as_str)
                    .unwrap_or("trigger handler failed")
                    .to_string(),
            });
        }

        serde_json::from_value(body)
            .map_err(|e| TriggerError::transport(format!("trigger envelope invalid: {e}")))
    }
}

/// Declarative binding document loaded from `--triggers <file>`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerConfig {
    #[serde(default)]
    pub endpoints: HashMap<TriggerHook, String>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub timeouts: HashMap<TriggerHook, u64>,
}

/// Resolves hooks to handlers and runs them with per-hook timeouts.
pub struct TriggerRuntime {
    handlers: HashMap<TriggerHook, Arc<dyn TriggerInvoker>>,
    timeouts: HashMap<TriggerHook, Duration>,
    default_timeout: Duration,
}

impl TriggerRuntime {
    pub fn empty() -> Self {
        TriggerRuntime {
            handlers: HashMap::new(),
            timeouts: HashMap::new(),
            default_timeout: DEFAULT_TRIGGER_TIMEOUT,
        }
    }

    pub fn from_config_file(path: &Path) -> Result<Self, CognitoError> {
        let bytes = std::fs::read(path)
            .map_err(|e| CognitoError::InternalError(format!("read {}: {e}", path.display())))?;
        let config: TriggerConfig = serde_json::from_slice(&bytes)
            .map_err(|e| CognitoError::InternalError(format!("parse {}: {e}", path.display())))?;
        Self::from_config(config)
    }

    pub fn from_config(config: TriggerConfig) -> Result<Self, CognitoError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| CognitoError::InternalError(format!("http client: {e}")))?;

        let mut runtime = TriggerRuntime::empty();
        if let Some(secs) = config.timeout_seconds {
            runtime.default_timeout = Duration::from_secs(secs);
        }
        for (hook, secs) in config.timeouts {
            runtime.timeouts.insert(hook, Duration::from_secs(secs));
        }
        for (hook, endpoint) in config.endpoints {
            runtime
                .handlers
                .insert(hook, Arc::new(HttpInvoker::new(client.clone(), endpoint)));
        }
        Ok(runtime)
    }

    /// Register a handler directly; used by tests and embedded setups.
    pub fn with_handler(mut self, hook: TriggerHook, handler: Arc<dyn TriggerInvoker>) -> Self {
        self.handlers.insert(hook, handler);
        self
    }

    pub fn enabled(&self, hook: TriggerHook) -> bool {
        self.handlers.contains_key(&hook)
    }

    /// Build the envelope, run the handler under its timeout, return the
    /// mutated envelope. Timeouts count as handler errors.
    async fn fire(
        &self,
        hook: TriggerHook,
        source: &str,
        pool_id: &str,
        username: &str,
        client_id: &str,
        request: Value,
        response: Value,
    ) -> Result<TriggerEvent, TriggerError> {
        let handler = self
            .handlers
            .get(&hook)
            .ok_or_else(|| TriggerError::transport(format!("no handler bound for {hook:?}")))?;

        let event = TriggerEvent {
            version: "1".to_string(),
            trigger_source: source.to_string(),
            region: "local".to_string(),
            user_pool_id: pool_id.to_string(),
            user_name: username.to_string(),
            caller_context: CallerContext {
                aws_sdk_version: "aws-sdk-unknown-unknown".to_string(),
                client_id: client_id.to_string(),
            },
            request,
            response,
        };

        let timeout = self
            .timeouts
            .get(&hook)
            .copied()
            .unwrap_or(self.default_timeout);

        match tokio::time::timeout(timeout, handler.invoke(event)).await {
            Ok(result) => result,
            Err(_) => Err(TriggerError::transport(format!(
                "{hook:?} handler timed out after {}s",
                timeout.as_secs()
            ))),
        }
    }

    /// UserMigration: may return a synthetic user to persist. Handler
    /// failure is treated as user-not-found.
    pub async fn user_migration(
        &self,
        source: &str,
        pool_id: &str,
        username: &str,
        password: &str,
        client_id: &str,
        client_metadata: &HashMap<String, String>,
    ) -> Option<MigratedUser> {
        let request = json!({
            "password": password,
            "validationData": {},
            "clientMetadata": client_metadata,
        });
        let response = json!({
            "userAttributes": null,
            "finalUserStatus": null,
            "messageAction": null,
            "forceAliasCreation": null,
        });
        match self
            .fire(
                TriggerHook::UserMigration,
                source,
                pool_id,
                username,
                client_id,
                request,
                response,
            )
            .await
        {
            Ok(event) => parse_migrated_user(&event.response),
            Err(err) => {
                tracing::warn!(username, error = %err.message, "user migration rejected");
                None
            }
        }
    }

    /// PreSignUp: may autoconfirm and auto-verify. Failure aborts sign-up.
    pub async fn pre_sign_up(
        &self,
        source: &str,
        pool_id: &str,
        username: &str,
        client_id: &str,
        user_attributes: &[Attribute],
        client_metadata: &HashMap<String, String>,
    ) -> Result<PreSignUpOutcome, CognitoError> {
        let request = json!({
            "userAttributes": attributes_json(user_attributes),
            "validationData": {},
            "clientMetadata": client_metadata,
        });
        let response = json!({
            "autoConfirmUser": false,
            "autoVerifyEmail": false,
            "autoVerifyPhone": false,
        });
        let event = self
            .fire(
                TriggerHook::PreSignUp,
                source,
                pool_id,
                username,
                client_id,
                request,
                response,
            )
            .await?;
        Ok(PreSignUpOutcome {
            auto_confirm: bool_field(&event.response, "autoConfirmUser"),
            auto_verify_email: bool_field(&event.response, "autoVerifyEmail"),
            auto_verify_phone: bool_field(&event.response, "autoVerifyPhone"),
        })
    }

    /// PostConfirmation is observational: failures are logged and dropped.
    pub async fn post_confirmation(
        &self,
        source: &str,
        pool_id: &str,
        username: &str,
        client_id: &str,
        user_attributes: &[Attribute],
    ) {
        let request = json!({ "userAttributes": attributes_json(user_attributes) });
        if let Err(err) = self
            .fire(
                TriggerHook::PostConfirmation,
                source,
                pool_id,
                username,
                client_id,
                request,
                json!({}),
            )
            .await
        {
            tracing::warn!(username, error = %err.message, "post confirmation hook failed");
        }
    }

    /// PreAuthentication: failure aborts the login.
    pub async fn pre_authentication(
        &self,
        pool_id: &str,
        username: &str,
        client_id: &str,
        user_attributes: &[Attribute],
    ) -> Result<(), CognitoError> {
        let request = json!({
            "userAttributes": attributes_json(user_attributes),
            "validationData": {},
        });
        self.fire(
            TriggerHook::PreAuthentication,
            "PreAuthentication_Authentication",
            pool_id,
            username,
            client_id,
            request,
            json!({}),
        )
        .await?;
        Ok(())
    }

    /// PostAuthentication: failure aborts the login.
    pub async fn post_authentication(
        &self,
        pool_id: &str,
        username: &str,
        client_id: &str,
        user_attributes: &[Attribute],
    ) -> Result<(), CognitoError> {
        let request = json!({
            "userAttributes": attributes_json(user_attributes),
            "newDeviceUsed": false,
        });
        self.fire(
            TriggerHook::PostAuthentication,
            "PostAuthentication_Authentication",
            pool_id,
            username,
            client_id,
            request,
            json!({}),
        )
        .await?;
        Ok(())
    }

    /// PreTokenGeneration (v2): may override or suppress claims and groups.
    /// Failure aborts token issuance.
    pub async fn pre_token_generation(
        &self,
        source: &str,
        pool_id: &str,
        username: &str,
        client_id: &str,
        user_attributes: &[Attribute],
        groups: &[String],
        scopes: &[String],
    ) -> Result<Option<ClaimsAndScopeOverride>, CognitoError> {
        let request = json!({
            "userAttributes": attributes_json(user_attributes),
            "groupConfiguration": {
                "groupsToOverride": groups,
                "iamRolesToOverride": [],
                "preferredRole": null,
            },
            "scopes": scopes,
        });
        let response = json!({ "claimsAndScopeOverrideDetails": null });
        let event = self
            .fire(
                TriggerHook::PreTokenGeneration,
                source,
                pool_id,
                username,
                client_id,
                request,
                response,
            )
            .await?;
        let details = event
            .response
            .get("claimsAndScopeOverrideDetails")
            .filter(|v| !v.is_null())
            .cloned();
        match details {
            None => Ok(None),
            Some(value) => serde_json::from_value(value).map(Some).map_err(|e| {
                CognitoError::InternalError(format!("claims override unparseable: {e}"))
            }),
        }
    }

    /// CustomMessage: may replace the subject/body template. Failure falls
    /// back to the default message.
    pub async fn custom_message(
        &self,
        source: &str,
        pool_id: &str,
        username: &str,
        client_id: &str,
        code: &str,
        user_attributes: &[Attribute],
    ) -> Option<MessageOverride> {
        let request = json!({
            "userAttributes": attributes_json(user_attributes),
            "codeParameter": "{####}",
            "usernameParameter": "{username}",
            "clientMetadata": {},
        });
        let response = json!({
            "smsMessage": null,
            "emailMessage": null,
            "emailSubject": null,
        });
        match self
            .fire(
                TriggerHook::CustomMessage,
                source,
                pool_id,
                username,
                client_id,
                request,
                response,
            )
            .await
        {
            Ok(event) => {
                let substitute = |field: &str| {
                    event
                        .response
                        .get(field)
                        .and_then(Value::as_str)
                        .map(|t| t.replace("{####}", code).replace("{username}", username))
                };
                Some(MessageOverride {
                    sms_message: substitute("smsMessage"),
                    email_message: substitute("emailMessage"),
                    email_subject: substitute("emailSubject"),
                })
            }
            Err(err) => {
                tracing::warn!(username, error = %err.message, "custom message hook failed");
                None
            }
        }
    }

    /// CustomEmailSender / CustomSMSSender: replace delivery entirely.
    /// Returns true when a handler accepted the dispatch; failure (or no
    /// binding) falls back to the default recording delivery.
    pub async fn custom_sender(
        &self,
        hook: TriggerHook,
        source: &str,
        pool_id: &str,
        username: &str,
        client_id: &str,
        code: &str,
    ) -> bool {
        let request = json!({ "type": source, "code": code });
        match self
            .fire(hook, source, pool_id, username, client_id, request, json!({}))
            .await
        {
            Ok(_) => true,
            Err(err) => {
                tracing::warn!(username, error = %err.message, "custom sender hook failed");
                false
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PreSignUpOutcome {
    pub auto_confirm: bool,
    pub auto_verify_email: bool,
    pub auto_verify_phone: bool,
}

#[derive(Debug, Clone)]
pub struct MessageOverride {
    pub sms_message: Option<String>,
    pub email_message: Option<String>,
    pub email_subject: Option<String>,
}

/// Synthetic user returned by a UserMigration handler.
#[derive(Debug, Clone)]
pub struct MigratedUser {
    pub attributes: Vec<Attribute>,
    pub final_status: Option<UserStatus>,
}

/// PreTokenGeneration v2 override contract. Applies to both the access and
/// the ID token; scope edits apply to the access token's `scope` claim.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClaimsAndScopeOverride {
    pub claims_to_add_or_override: HashMap<String, Value>,
    pub claims_to_suppress: Vec<String>,
    pub group_override_details: Option<GroupOverrideDetails>,
    pub scopes_to_add: Vec<String>,
    pub scopes_to_suppress: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GroupOverrideDetails {
    pub groups_to_override: Vec<String>,
}

fn attributes_json(attrs: &[Attribute]) -> Value {
    Value::Object(
        attrs
            .iter()
            .map(|a| (a.name.clone(), Value::String(a.value.clone())))
            .collect(),
    )
}

fn bool_field(value: &Value, field: &str) -> bool {
    value.get(field).and_then(Value::as_bool).unwrap_or(false)
}

fn parse_migrated_user(response: &Value) -> Option<MigratedUser> {
    let attrs = response.get("userAttributes")?.as_object()?;
    let attributes = attrs
        .iter()
        .map(|(name, value)| Attribute {
            name: name.clone(),
            value: value.as_str().unwrap_or_default().to_string(),
        })
        .collect();
    let final_status = response
        .get("finalUserStatus")
        .and_then(Value::as_str)
        .and_then(|s| serde_json::from_value(Value::String(s.to_string())).ok());
    Some(MigratedUser {
        attributes,
        final_status,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl TriggerInvoker for Echo {
        async fn invoke(&self, mut event: TriggerEvent) -> Result<TriggerEvent, TriggerError> {
            event.response = json!({
                "autoConfirmUser": true,
                "autoVerifyEmail": true,
                "autoVerifyPhone": false,
            });
            Ok(event)
        }
    }

    struct Failing;

    #[async_trait]
    impl TriggerInvoker for Failing {
        async fn invoke(&self, _event: TriggerEvent) -> Result<TriggerEvent, TriggerError> {
            Err(TriggerError {
                code: Some("UserLambdaValidationException".into()),
                message: "rejected".into(),
            })
        }
    }

    struct Slow;

    #[async_trait]
    impl TriggerInvoker for Slow {
        async fn invoke(&self, event: TriggerEvent) -> Result<TriggerEvent, TriggerError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(event)
        }
    }

    #[tokio::test]
    async fn pre_sign_up_reads_mutated_response() {
        let runtime =
            TriggerRuntime::empty().with_handler(TriggerHook::PreSignUp, Arc::new(Echo));
        let outcome = runtime
            .pre_sign_up(
                "PreSignUp_SignUp",
                "local_1",
                "alice",
                "client",
                &[],
                &HashMap::new(),
            )
            .await
            .unwrap();
        assert!(outcome.auto_confirm);
        assert!(outcome.auto_verify_email);
        assert!(!outcome.auto_verify_phone);
    }

    #[tokio::test]
    async fn pre_authentication_failure_aborts() {
        let runtime =
            TriggerRuntime::empty().with_handler(TriggerHook::PreAuthentication, Arc::new(Failing));
        let err = runtime
            .pre_authentication("local_1", "alice", "client", &[])
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "UserLambdaValidationException");
    }

    #[tokio::test]
    async fn user_migration_failure_means_no_user() {
        let runtime =
            TriggerRuntime::empty().with_handler(TriggerHook::UserMigration, Arc::new(Failing));
        let migrated = runtime
            .user_migration(
                "UserMigration_Authentication",
                "local_1",
                "bob",
                "pw",
                "c",
                &HashMap::new(),
            )
            .await;
        assert!(migrated.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_handlers_time_out() {
        let runtime =
            TriggerRuntime::empty().with_handler(TriggerHook::PostAuthentication, Arc::new(Slow));
        let err = runtime
            .post_authentication("local_1", "alice", "client", &[])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[test]
    fn config_parses_hooks_and_timeouts() {
        let config: TriggerConfig = serde_json::from_value(json!({
            "endpoints": {
                "UserMigration": "http://127.0.0.1:3000/migrate",
                "CustomSMSSender": "http://127.0.0.1:3000/sms",
            },
            "timeoutSeconds": 10,
            "timeouts": { "PreSignUp": 2 },
        }))
        .unwrap();
        assert_eq!(config.endpoints.len(), 2);
        assert!(config.endpoints.contains_key(&TriggerHook::CustomSmsSender));
        assert_eq!(config.timeout_seconds, Some(10));
        assert_eq!(config.timeouts[&TriggerHook::PreSignUp], 2);
    }
}
