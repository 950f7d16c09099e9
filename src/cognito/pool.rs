use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::CognitoError;

/// Lowercased lookup key. Usernames are case-preserving but resolve
/// case-insensitively within a pool.
pub fn user_key(username: &str) -> String {
    username.to_lowercase()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UserStatus {
    Unconfirmed,
    Confirmed,
    Archived,
    Compromised,
    Unknown,
    ResetRequired,
    ForceChangePassword,
    ExternalProvider,
}

impl UserStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserStatus::Unconfirmed => "UNCONFIRMED",
            UserStatus::Confirmed => "CONFIRMED",
            UserStatus::Archived => "ARCHIVED",
            UserStatus::Compromised => "COMPROMISED",
            UserStatus::Unknown => "UNKNOWN",
            UserStatus::ResetRequired => "RESET_REQUIRED",
            UserStatus::ForceChangePassword => "FORCE_CHANGE_PASSWORD",
            UserStatus::ExternalProvider => "EXTERNAL_PROVIDER",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MfaConfig {
    #[default]
    Off,
    Optional,
    On,
}

impl MfaConfig {
    pub fn as_str(&self) -> &'static str {
        match self {
            MfaConfig::Off => "OFF",
            MfaConfig::Optional => "OPTIONAL",
            MfaConfig::On => "ON",
        }
    }
}

/// One name/value pair. The ordered list is the canonical attribute form;
/// derived maps are rebuilt from it so wire round-trips preserve order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Attribute {
    pub name: String,
    pub value: String,
}

pub fn attribute(name: &str, value: impl Into<String>) -> Attribute {
    Attribute {
        name: name.to_string(),
        value: value.into(),
    }
}

/// Upsert into an ordered attribute list, preserving first-seen order.
pub fn set_attribute(attrs: &mut Vec<Attribute>, name: &str, value: impl Into<String>) {
    let value = value.into();
    if let Some(existing) = attrs.iter_mut().find(|a| a.name == name) {
        existing.value = value;
    } else {
        attrs.push(Attribute {
            name: name.to_string(),
            value,
        });
    }
}

pub fn get_attribute<'a>(attrs: &'a [Attribute], name: &str) -> Option<&'a str> {
    attrs
        .iter()
        .find(|a| a.name == name)
        .map(|a| a.value.as_str())
}

pub fn attributes_to_map(attrs: &[Attribute]) -> HashMap<String, String> {
    attrs
        .iter()
        .map(|a| (a.name.clone(), a.value.clone()))
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PasswordPolicy {
    pub minimum_length: usize,
    pub require_uppercase: bool,
    pub require_lowercase: bool,
    pub require_numbers: bool,
    pub require_symbols: bool,
}

impl Default for PasswordPolicy {
    fn default() -> Self {
        PasswordPolicy {
            minimum_length: 8,
            require_uppercase: false,
            require_lowercase: false,
            require_numbers: false,
            require_symbols: false,
        }
    }
}

impl PasswordPolicy {
    pub fn validate(&self, password: &str) -> Result<(), CognitoError> {
        if password.chars().count() < self.minimum_length {
            return Err(CognitoError::PasswordPolicyViolation(format!(
                "Password not long enough, minimum length is {}",
                self.minimum_length
            )));
        }
        if self.require_uppercase && !password.chars().any(|c| c.is_ascii_uppercase()) {
            return Err(CognitoError::PasswordPolicyViolation(
                "Password must have uppercase characters".into(),
            ));
        }
        if self.require_lowercase && !password.chars().any(|c| c.is_ascii_lowercase()) {
            return Err(CognitoError::PasswordPolicyViolation(
                "Password must have lowercase characters".into(),
            ));
        }
        if self.require_numbers && !password.chars().any(|c| c.is_ascii_digit()) {
            return Err(CognitoError::PasswordPolicyViolation(
                "Password must have numeric characters".into(),
            ));
        }
        if self.require_symbols
            && !password
                .chars()
                .any(|c| !c.is_ascii_alphanumeric() && !c.is_whitespace())
        {
            return Err(CognitoError::PasswordPolicyViolation(
                "Password must have symbol characters".into(),
            ));
        }
        Ok(())
    }
}

/// Attribute descriptor from the pool schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SchemaAttribute {
    pub name: String,
    pub attribute_data_type: String,
    pub mutable: bool,
    pub required: bool,
}

fn schema_attr(name: &str, data_type: &str, mutable: bool) -> SchemaAttribute {
    SchemaAttribute {
        name: name.to_string(),
        attribute_data_type: data_type.to_string(),
        mutable,
        required: false,
    }
}

/// The standard attribute set every pool starts with.
pub fn default_schema() -> Vec<SchemaAttribute> {
    vec![
        schema_attr("sub", "String", false),
        schema_attr("name", "String", true),
        schema_attr("given_name", "String", true),
        schema_attr("family_name", "String", true),
        schema_attr("nickname", "String", true),
        schema_attr("preferred_username", "String", true),
        schema_attr("email", "String", true),
        schema_attr("email_verified", "Boolean", true),
        schema_attr("phone_number", "String", true),
        schema_attr("phone_number_verified", "Boolean", true),
        schema_attr("birthdate", "String", true),
        schema_attr("address", "String", true),
        schema_attr("locale", "String", true),
        schema_attr("zoneinfo", "String", true),
        schema_attr("picture", "String", true),
        schema_attr("profile", "String", true),
        schema_attr("website", "String", true),
        schema_attr("gender", "String", true),
        schema_attr("updated_at", "Number", true),
    ]
}

/// A code with its issue time; codes expire after 24 hours.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssuedCode {
    pub code: String,
    pub issued_at: DateTime<Utc>,
}

pub const CODE_TTL_SECS: i64 = 24 * 60 * 60;

impl IssuedCode {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        (now - self.issued_at).num_seconds() > CODE_TTL_SECS
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MfaOption {
    pub delivery_medium: String,
    pub attribute_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub username: String,
    pub attributes: Vec<Attribute>,
    /// Stored verbatim; the emulator does not hash passwords.
    pub password: Option<String>,
    pub user_status: UserStatus,
    pub enabled: bool,
    #[serde(default)]
    pub confirmation_code: Option<IssuedCode>,
    #[serde(default)]
    pub reset_code: Option<IssuedCode>,
    #[serde(default)]
    pub mfa_code: Option<String>,
    #[serde(default)]
    pub mfa_options: Vec<MfaOption>,
    #[serde(default)]
    pub user_mfa_setting_list: Vec<String>,
    #[serde(default)]
    pub preferred_mfa_setting: Option<String>,
    #[serde(default)]
    pub refresh_tokens: BTreeSet<String>,
    pub create_date: DateTime<Utc>,
    pub last_modified_date: DateTime<Utc>,
}

impl User {
    pub fn new(
        username: String,
        attributes: Vec<Attribute>,
        password: Option<String>,
        status: UserStatus,
        now: DateTime<Utc>,
    ) -> Self {
        User {
            username,
            attributes,
            password,
            user_status: status,
            enabled: true,
            confirmation_code: None,
            reset_code: None,
            mfa_code: None,
            mfa_options: Vec::new(),
            user_mfa_setting_list: Vec::new(),
            preferred_mfa_setting: None,
            refresh_tokens: BTreeSet::new(),
            create_date: now,
            last_modified_date: now,
        }
    }

    pub fn sub(&self) -> Option<&str> {
        get_attribute(&self.attributes, "sub")
    }

    pub fn email(&self) -> Option<&str> {
        get_attribute(&self.attributes, "email")
    }

    pub fn phone_number(&self) -> Option<&str> {
        get_attribute(&self.attributes, "phone_number")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub group_name: String,
    pub description: Option<String>,
    pub role_arn: Option<String>,
    pub precedence: Option<i64>,
    /// Membership lives on the group; user → groups is a derived scan.
    #[serde(default)]
    pub members: BTreeSet<String>,
    pub creation_date: DateTime<Utc>,
    pub last_modified_date: DateTime<Utc>,
}

impl Group {
    pub fn new(
        group_name: String,
        description: Option<String>,
        role_arn: Option<String>,
        precedence: Option<i64>,
        now: DateTime<Utc>,
    ) -> Self {
        Group {
            group_name,
            description,
            role_arn,
            precedence,
            members: BTreeSet::new(),
            creation_date: now,
            last_modified_date: now,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppClient {
    pub client_id: String,
    pub client_name: String,
    pub user_pool_id: String,
    pub client_secret: Option<String>,
    #[serde(default)]
    pub explicit_auth_flows: Vec<String>,
    #[serde(default)]
    pub read_attributes: Vec<String>,
    #[serde(default)]
    pub write_attributes: Vec<String>,
    /// Overrides of the pool token lifetimes, in seconds.
    #[serde(default)]
    pub access_token_validity: Option<i64>,
    #[serde(default)]
    pub id_token_validity: Option<i64>,
    #[serde(default)]
    pub refresh_token_validity: Option<i64>,
    pub creation_date: DateTime<Utc>,
    pub last_modified_date: DateTime<Utc>,
}

impl AppClient {
    pub fn new(
        client_id: String,
        client_name: String,
        user_pool_id: String,
        now: DateTime<Utc>,
    ) -> Self {
        AppClient {
            client_id,
            client_name,
            user_pool_id,
            client_secret: None,
            explicit_auth_flows: Vec::new(),
            read_attributes: Vec::new(),
            write_attributes: Vec::new(),
            access_token_validity: None,
            id_token_validity: None,
            refresh_token_validity: None,
            creation_date: now,
            last_modified_date: now,
        }
    }
}

pub const DEFAULT_ACCESS_TOKEN_VALIDITY: i64 = 3600;
pub const DEFAULT_ID_TOKEN_VALIDITY: i64 = 3600;
pub const DEFAULT_REFRESH_TOKEN_VALIDITY: i64 = 30 * 24 * 3600;

/// The persisted pool aggregate: metadata plus the full users/groups/clients
/// tables. Secondary indexes are derived on load and never serialized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserPool {
    pub id: String,
    pub name: String,
    pub mfa_configuration: MfaConfig,
    pub password_policy: PasswordPolicy,
    #[serde(default)]
    pub auto_verified_attributes: Vec<String>,
    pub schema_attributes: Vec<SchemaAttribute>,
    pub access_token_validity: i64,
    pub id_token_validity: i64,
    pub refresh_token_validity: i64,
    pub creation_date: DateTime<Utc>,
    pub last_modified_date: DateTime<Utc>,
    /// Keyed by lowercased username; `User.username` preserves case.
    #[serde(default)]
    pub users: HashMap<String, User>,
    #[serde(default)]
    pub groups: HashMap<String, Group>,
    #[serde(default)]
    pub clients: HashMap<String, AppClient>,
}

impl UserPool {
    pub fn new(id: String, name: String, now: DateTime<Utc>) -> Self {
        UserPool {
            id,
            name,
            mfa_configuration: MfaConfig::Off,
            password_policy: PasswordPolicy::default(),
            auto_verified_attributes: Vec::new(),
            schema_attributes: default_schema(),
            access_token_validity: DEFAULT_ACCESS_TOKEN_VALIDITY,
            id_token_validity: DEFAULT_ID_TOKEN_VALIDITY,
            refresh_token_validity: DEFAULT_REFRESH_TOKEN_VALIDITY,
            creation_date: now,
            last_modified_date: now,
            users: HashMap::new(),
            groups: HashMap::new(),
            clients: HashMap::new(),
        }
    }

    /// Check that every attribute is known to the schema (custom attributes
    /// pass with their `custom:` prefix) and respects immutability.
    pub fn validate_attributes(
        &self,
        attrs: &[Attribute],
        updating: bool,
    ) -> Result<(), CognitoError> {
        for attr in attrs {
            if attr.name.starts_with("custom:") {
                continue;
            }
            let Some(descriptor) = self.schema_attributes.iter().find(|s| s.name == attr.name)
            else {
                return Err(CognitoError::InvalidParameter(format!(
                    "user.{} : Attribute does not exist in the schema.",
                    attr.name
                )));
            };
            if updating && !descriptor.mutable {
                return Err(CognitoError::InvalidParameter(format!(
                    "user.{} : Attribute cannot be updated.",
                    attr.name
                )));
            }
        }
        Ok(())
    }

    /// Groups a user belongs to, ordered by precedence then name.
    pub fn groups_for_member(&self, username: &str) -> Vec<&Group> {
        let key = user_key(username);
        let mut groups: Vec<&Group> = self
            .groups
            .values()
            .filter(|g| g.members.contains(&key))
            .collect();
        groups.sort_by(|a, b| {
            let pa = a.precedence.unwrap_or(i64::MAX);
            let pb = b.precedence.unwrap_or(i64::MAX);
            pa.cmp(&pb).then_with(|| a.group_name.cmp(&b.group_name))
        });
        groups
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn now() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    #[test]
    fn password_policy_checks_each_class() {
        let policy = PasswordPolicy {
            minimum_length: 8,
            require_uppercase: true,
            require_lowercase: true,
            require_numbers: true,
            require_symbols: true,
        };
        assert!(policy.validate("Abcdef1!").is_ok());
        assert!(policy.validate("abcdef1!").is_err());
        assert!(policy.validate("ABCDEF1!").is_err());
        assert!(policy.validate("Abcdefg!").is_err());
        assert!(policy.validate("Abcdefg1").is_err());
        assert!(policy.validate("Ab1!").is_err());
    }

    #[test]
    fn set_attribute_upserts_in_place() {
        let mut attrs = vec![attribute("email", "a@example.com"), attribute("name", "A")];
        set_attribute(&mut attrs, "email", "b@example.com");
        set_attribute(&mut attrs, "locale", "en");
        assert_eq!(attrs.len(), 3);
        assert_eq!(attrs[0].name, "email");
        assert_eq!(attrs[0].value, "b@example.com");
        assert_eq!(attrs[2].name, "locale");
    }

    #[test]
    fn schema_rejects_unknown_and_immutable() {
        let pool = UserPool::new("local_1".into(), "test".into(), now());
        assert!(pool
            .validate_attributes(&[attribute("email", "x@y.z")], false)
            .is_ok());
        assert!(pool
            .validate_attributes(&[attribute("custom:tier", "gold")], true)
            .is_ok());
        assert!(pool
            .validate_attributes(&[attribute("nonsense", "1")], false)
            .is_err());
        assert!(pool
            .validate_attributes(&[attribute("sub", "other")], true)
            .is_err());
    }

    #[test]
    fn groups_order_by_precedence_then_name() {
        let mut pool = UserPool::new("local_1".into(), "test".into(), now());
        for (name, precedence) in [("zeta", Some(1)), ("alpha", None), ("beta", Some(1))] {
            let mut group = Group::new(name.into(), None, None, precedence, now());
            group.members.insert("alice".into());
            pool.groups.insert(name.into(), group);
        }
        let ordered: Vec<&str> = pool
            .groups_for_member("Alice")
            .iter()
            .map(|g| g.group_name.as_str())
            .collect();
        assert_eq!(ordered, vec!["beta", "zeta", "alpha"]);
    }

    #[test]
    fn issued_code_expires_after_a_day() {
        let code = IssuedCode {
            code: "123456".into(),
            issued_at: now(),
        };
        assert!(!code.is_expired(now() + chrono::Duration::hours(23)));
        assert!(code.is_expired(now() + chrono::Duration::hours(25)));
    }
}
