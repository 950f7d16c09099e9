use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use super::error::CognitoError;
use super::pool::{User, UserPool};
use super::triggers::{TriggerHook, TriggerRuntime};

/// Which lifecycle event is asking for a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSource {
    SignUp,
    ResendCode,
    AdminCreateUser,
    ForgotPassword,
    Authentication,
    VerifyUserAttribute,
}

impl MessageSource {
    fn custom_message_source(&self) -> &'static str {
        match self {
            MessageSource::SignUp => "CustomMessage_SignUp",
            MessageSource::ResendCode => "CustomMessage_ResendCode",
            MessageSource::AdminCreateUser => "CustomMessage_AdminCreateUser",
            MessageSource::ForgotPassword => "CustomMessage_ForgotPassword",
            MessageSource::Authentication => "CustomMessage_Authentication",
            MessageSource::VerifyUserAttribute => "CustomMessage_VerifyUserAttribute",
        }
    }

    fn default_body(&self) -> &'static str {
        match self {
            MessageSource::SignUp | MessageSource::ResendCode => {
                "Your confirmation code is {####}"
            }
            MessageSource::AdminCreateUser => {
                "Your username is {username} and temporary password is {####}"
            }
            MessageSource::ForgotPassword => "Your password reset code is {####}",
            MessageSource::Authentication => "Your authentication code is {####}",
            MessageSource::VerifyUserAttribute => "Your verification code is {####}",
        }
    }
}

/// What the wire reports back as CodeDeliveryDetails.
#[derive(Debug, Clone)]
pub struct CodeDelivery {
    pub destination: String,
    pub delivery_medium: String,
    pub attribute_name: String,
}

/// One recorded delivery; the emulator records instead of sending.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeliveryRecord {
    at: DateTime<Utc>,
    source: String,
    user_pool_id: String,
    username: String,
    delivery_medium: String,
    destination: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    subject: Option<String>,
    message: String,
    code: String,
}

/// Renders and records confirmation codes, MFA codes and invitations.
/// Deliveries are appended as JSON lines to `<data-dir>/messages.log`.
pub struct MessagesService {
    log_path: PathBuf,
}

impl MessagesService {
    pub fn new(data_dir: &std::path::Path) -> Self {
        MessagesService {
            log_path: data_dir.join("messages.log"),
        }
    }

    /// Render the message (CustomMessage override first, default template
    /// otherwise), offer it to a custom sender hook, and record it.
    pub async fn deliver(
        &self,
        triggers: &TriggerRuntime,
        pool: &UserPool,
        client_id: &str,
        user: &User,
        source: MessageSource,
        code: &str,
    ) -> Result<Option<CodeDelivery>, CognitoError> {
        let delivery = match resolve_destination(user) {
            Some(d) => d,
            None => {
                tracing::debug!(username = %user.username, "no deliverable attribute, skipping message");
                return Ok(None);
            }
        };

        let trigger_source = source.custom_message_source();
        let mut subject = None;
        let mut body = source
            .default_body()
            .replace("{####}", code)
            .replace("{username}", &user.username);

        if triggers.enabled(TriggerHook::CustomMessage) {
            if let Some(overridden) = triggers
                .custom_message(
                    trigger_source,
                    &pool.id,
                    &user.username,
                    client_id,
                    code,
                    &user.attributes,
                )
                .await
            {
                let overridden_body = if delivery.delivery_medium == "SMS" {
                    overridden.sms_message
                } else {
                    overridden.email_message
                };
                if let Some(text) = overridden_body {
                    body = text;
                }
                subject = overridden.email_subject;
            }
        }

        let sender_hook = if delivery.delivery_medium == "SMS" {
            TriggerHook::CustomSmsSender
        } else {
            TriggerHook::CustomEmailSender
        };
        if triggers.enabled(sender_hook) {
            let sender_source = trigger_source.replace("CustomMessage_", match sender_hook {
                TriggerHook::CustomSmsSender => "CustomSMSSender_",
                _ => "CustomEmailSender_",
            });
            if triggers
                .custom_sender(
                    sender_hook,
                    &sender_source,
                    &pool.id,
                    &user.username,
                    client_id,
                    code,
                )
                .await
            {
                return Ok(Some(delivery));
            }
        }

        self.append(DeliveryRecord {
            at: Utc::now(),
            source: trigger_source.to_string(),
            user_pool_id: pool.id.clone(),
            username: user.username.clone(),
            delivery_medium: delivery.delivery_medium.clone(),
            destination: delivery.destination.clone(),
            subject,
            message: body,
            code: code.to_string(),
        })
        .await?;

        Ok(Some(delivery))
    }

    async fn append(&self, record: DeliveryRecord) -> Result<(), CognitoError> {
        let mut line = serde_json::to_vec(&record)
            .map_err(|e| CognitoError::InternalError(e.to_string()))?;
        line.push(b'\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .await
            .map_err(|e| {
                CognitoError::InternalError(format!("open {}: {e}", self.log_path.display()))
            })?;
        file.write_all(&line)
            .await
            .map_err(|e| CognitoError::InternalError(format!("message log write: {e}")))?;
        Ok(())
    }
}

fn resolve_destination(user: &User) -> Option<CodeDelivery> {
    if let Some(email) = user.email() {
        return Some(CodeDelivery {
            destination: mask_email(email),
            delivery_medium: "EMAIL".to_string(),
            attribute_name: "email".to_string(),
        });
    }
    if let Some(phone) = user.phone_number() {
        return Some(CodeDelivery {
            destination: mask_phone(phone),
            delivery_medium: "SMS".to_string(),
            attribute_name: "phone_number".to_string(),
        });
    }
    None
}

fn mask_email(email: &str) -> String {
    match email.split_once('@') {
        Some((local, domain)) => {
            let first = local.chars().next().unwrap_or('*');
            let domain_first = domain.chars().next().unwrap_or('*');
            format!("{first}***@{domain_first}***")
        }
        None => "***".to_string(),
    }
}

fn mask_phone(phone: &str) -> String {
    let tail: String = phone
        .chars()
        .rev()
        .take(4)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    format!("+*******{tail}")
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::super::pool::{attribute, UserStatus};
    use super::*;

    fn user_with(attrs: Vec<super::super::pool::Attribute>) -> User {
        User::new("alice".into(), attrs, None, UserStatus::Confirmed, Utc::now())
    }

    #[tokio::test]
    async fn records_delivery_to_the_log() {
        let dir = tempfile::tempdir().unwrap();
        let service = MessagesService::new(dir.path());
        let triggers = TriggerRuntime::empty();
        let pool = UserPool::new("local_1".into(), "test".into(), Utc::now());
        let user = user_with(vec![attribute("email", "alice@example.com")]);

        let delivery = service
            .deliver(&triggers, &pool, "c1", &user, MessageSource::SignUp, "424242")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivery.delivery_medium, "EMAIL");
        assert_eq!(delivery.attribute_name, "email");

        let log = std::fs::read_to_string(dir.path().join("messages.log")).unwrap();
        let record: serde_json::Value = serde_json::from_str(log.lines().next().unwrap()).unwrap();
        assert_eq!(record["code"], "424242");
        assert_eq!(record["message"], "Your confirmation code is 424242");
        assert_eq!(record["source"], "CustomMessage_SignUp");
    }

    #[tokio::test]
    async fn prefers_email_then_phone() {
        let dir = tempfile::tempdir().unwrap();
        let service = MessagesService::new(dir.path());
        let triggers = TriggerRuntime::empty();
        let pool = UserPool::new("local_1".into(), "test".into(), Utc::now());

        let phone_only = user_with(vec![attribute("phone_number", "+15551234567")]);
        let delivery = service
            .deliver(&triggers, &pool, "c1", &phone_only, MessageSource::Authentication, "1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivery.delivery_medium, "SMS");
        assert_eq!(delivery.destination, "+*******4567");

        let bare = user_with(vec![]);
        let none = service
            .deliver(&triggers, &pool, "c1", &bare, MessageSource::SignUp, "2")
            .await
            .unwrap();
        assert!(none.is_none());
    }

    #[test]
    fn masking_is_stable() {
        assert_eq!(mask_email("alice@example.com"), "a***@e***");
        assert_eq!(mask_phone("+15551234567"), "+*******4567");
    }
}
