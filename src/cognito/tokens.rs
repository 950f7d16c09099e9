use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use jsonwebtoken::{Algorithm, Header, Validation};
use serde_json::{Map, Value};

use super::clock::{Clock, IdSource};
use super::error::CognitoError;
use super::keys::KeyStore;
use super::pool::{AppClient, User, UserPool};
use super::triggers::ClaimsAndScopeOverride;

pub const DEFAULT_SCOPE: &str = "aws.cognito.signin.user.admin";

/// Why tokens are being minted; selects the TokenGeneration trigger source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueReason {
    Authentication,
    RefreshTokens,
}

impl IssueReason {
    pub fn trigger_source(&self) -> &'static str {
        match self {
            IssueReason::Authentication => "TokenGeneration_Authentication",
            IssueReason::RefreshTokens => "TokenGeneration_RefreshTokens",
        }
    }
}

/// One issuance: signed access and ID tokens, plus a fresh opaque refresh
/// token when the reason is a full authentication.
#[derive(Debug, Clone)]
pub struct TokenSet {
    pub access_token: String,
    pub id_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: i64,
}

pub struct TokenGenerator {
    keys: Arc<KeyStore>,
    issuer_base: String,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdSource>,
}

impl TokenGenerator {
    pub fn new(
        keys: Arc<KeyStore>,
        issuer_base: String,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdSource>,
    ) -> Self {
        TokenGenerator {
            keys,
            issuer_base: issuer_base.trim_end_matches('/').to_string(),
            clock,
            ids,
        }
    }

    pub fn issuer(&self, pool_id: &str) -> String {
        format!("{}/{}", self.issuer_base, pool_id)
    }

    /// Mint the token set for a user. `groups` is the precedence-ordered
    /// membership list; `claims_override` is the PreTokenGeneration result
    /// and applies to both signed tokens.
    pub fn generate(
        &self,
        pool: &UserPool,
        client: &AppClient,
        user: &User,
        groups: &[String],
        reason: IssueReason,
        claims_override: Option<&ClaimsAndScopeOverride>,
    ) -> Result<TokenSet, CognitoError> {
        let now = self.clock.now().timestamp();
        let issuer = self.issuer(&pool.id);
        let sub = user.sub().unwrap_or(&user.username).to_string();

        let access_validity = client
            .access_token_validity
            .unwrap_or(pool.access_token_validity);
        let id_validity = client.id_token_validity.unwrap_or(pool.id_token_validity);

        let groups: Vec<String> = match claims_override.and_then(|o| o.group_override_details.as_ref())
        {
            Some(details) => details.groups_to_override.clone(),
            None => groups.to_vec(),
        };

        let scope = self.access_scope(claims_override);

        let mut access = Map::new();
        access.insert("sub".into(), Value::String(sub.clone()));
        if !groups.is_empty() {
            access.insert("cognito:groups".into(), json_strings(&groups));
        }
        access.insert("iss".into(), Value::String(issuer.clone()));
        access.insert("client_id".into(), Value::String(client.client_id.clone()));
        access.insert(
            "origin_jti".into(),
            Value::String(self.ids.new_id().to_string()),
        );
        access.insert(
            "event_id".into(),
            Value::String(self.ids.new_id().to_string()),
        );
        access.insert("token_use".into(), Value::String("access".into()));
        access.insert("scope".into(), Value::String(scope));
        access.insert("auth_time".into(), Value::from(now));
        access.insert("exp".into(), Value::from(now + access_validity));
        access.insert("iat".into(), Value::from(now));
        access.insert("jti".into(), Value::String(self.ids.new_id().to_string()));
        access.insert("username".into(), Value::String(user.username.clone()));

        let mut id = Map::new();
        id.insert("sub".into(), Value::String(sub));
        if !groups.is_empty() {
            id.insert("cognito:groups".into(), json_strings(&groups));
        }
        id.insert("iss".into(), Value::String(issuer));
        id.insert(
            "cognito:username".into(),
            Value::String(user.username.clone()),
        );
        id.insert("aud".into(), Value::String(client.client_id.clone()));
        id.insert("token_use".into(), Value::String("id".into()));
        id.insert("auth_time".into(), Value::from(now));
        id.insert("exp".into(), Value::from(now + id_validity));
        id.insert("iat".into(), Value::from(now));
        id.insert("jti".into(), Value::String(self.ids.new_id().to_string()));
        for attr in &user.attributes {
            if attr.name == "sub" {
                continue;
            }
            let value = match attr.name.as_str() {
                "email_verified" | "phone_number_verified" => {
                    Value::Bool(attr.value == "true")
                }
                _ => Value::String(attr.value.clone()),
            };
            id.insert(attr.name.clone(), value);
        }

        if let Some(overrides) = claims_override {
            for (name, value) in &overrides.claims_to_add_or_override {
                access.insert(name.clone(), value.clone());
                id.insert(name.clone(), value.clone());
            }
            for name in &overrides.claims_to_suppress {
                access.remove(name);
                id.remove(name);
            }
        }

        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(self.keys.kid().to_string());

        let access_token = jsonwebtoken::encode(&header, &access, self.keys.encoding_key())
            .map_err(|e| CognitoError::InternalError(format!("access token signing: {e}")))?;
        let id_token = jsonwebtoken::encode(&header, &id, self.keys.encoding_key())
            .map_err(|e| CognitoError::InternalError(format!("id token signing: {e}")))?;

        let refresh_token = match reason {
            IssueReason::Authentication => Some(new_refresh_token()),
            IssueReason::RefreshTokens => None,
        };

        Ok(TokenSet {
            access_token,
            id_token,
            refresh_token,
            expires_in: access_validity,
        })
    }

    fn access_scope(&self, claims_override: Option<&ClaimsAndScopeOverride>) -> String {
        let mut scopes = vec![DEFAULT_SCOPE.to_string()];
        if let Some(overrides) = claims_override {
            scopes.retain(|s| !overrides.scopes_to_suppress.contains(s));
            for scope in &overrides.scopes_to_add {
                if !scopes.contains(scope) {
                    scopes.push(scope.clone());
                }
            }
        }
        scopes.join(" ")
    }

    /// Decode and verify an access token minted by this process; used by
    /// the access-token-authenticated endpoints to resolve the caller.
    pub fn verify_access_token(&self, token: &str) -> Result<VerifiedAccess, CognitoError> {
        let mut validation = Validation::new(Algorithm::RS256);
        validation.validate_aud = false;
        let data = jsonwebtoken::decode::<Map<String, Value>>(
            token,
            self.keys.decoding_key(),
            &validation,
        )
        .map_err(|_| CognitoError::NotAuthorized("Invalid Access Token".into()))?;

        let claims = data.claims;
        if claims.get("token_use").and_then(Value::as_str) != Some("access") {
            return Err(CognitoError::NotAuthorized("Invalid Access Token".into()));
        }
        let str_claim = |name: &str| {
            claims
                .get(name)
                .and_then(Value::as_str)
                .map(String::from)
                .ok_or_else(|| CognitoError::NotAuthorized("Invalid Access Token".into()))
        };
        Ok(VerifiedAccess {
            sub: str_claim("sub")?,
            username: str_claim("username")?,
            client_id: str_claim("client_id")?,
            issuer: str_claim("iss")?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct VerifiedAccess {
    pub sub: String,
    pub username: String,
    pub client_id: String,
    pub issuer: String,
}

/// Opaque refresh token: 256 bits from the OS CSPRNG, base64url.
pub fn new_refresh_token() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

fn json_strings(values: &[String]) -> Value {
    Value::Array(values.iter().cloned().map(Value::String).collect())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use chrono::Utc;
    use serde_json::json;

    use super::super::clock::{test_support::FixedClock, Clock, RandomIds};
    use super::super::pool::{attribute, AppClient, User, UserPool, UserStatus};
    use super::super::triggers::GroupOverrideDetails;
    use super::*;

    fn fixture_with(clock: Arc<dyn Clock>) -> (TokenGenerator, UserPool, AppClient, User) {
        let dir = tempfile::tempdir().unwrap();
        let keys = Arc::new(KeyStore::open(dir.path()).unwrap());
        let generator = TokenGenerator::new(
            keys,
            "http://localhost:9229".into(),
            clock,
            Arc::new(RandomIds),
        );
        let now = Utc::now();
        let pool = UserPool::new("local_abc".into(), "test".into(), now);
        let client = AppClient::new("client1".into(), "app".into(), pool.id.clone(), now);
        let user = User::new(
            "Alice".into(),
            vec![
                attribute("sub", "11111111-2222-3333-4444-555555555555"),
                attribute("email", "alice@example.com"),
                attribute("email_verified", "true"),
            ],
            Some("p@ss".into()),
            UserStatus::Confirmed,
            now,
        );
        (generator, pool, client, user)
    }

    fn fixture() -> (TokenGenerator, UserPool, AppClient, User) {
        fixture_with(Arc::new(FixedClock::at(1_700_000_000)))
    }

    fn decode_unverified(token: &str) -> Map<String, Value> {
        let payload = token.split('.').nth(1).unwrap();
        let bytes = URL_SAFE_NO_PAD.decode(payload).unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn access_token_claims_match_contract() {
        let (generator, pool, client, user) = fixture();
        let set = generator
            .generate(
                &pool,
                &client,
                &user,
                &["admins".into()],
                IssueReason::Authentication,
                None,
            )
            .unwrap();

        let claims = decode_unverified(&set.access_token);
        assert_eq!(
            claims["sub"], "11111111-2222-3333-4444-555555555555",
            "sub must equal the user's Sub attribute"
        );
        assert_eq!(claims["token_use"], "access");
        assert_eq!(claims["client_id"], "client1");
        assert_eq!(claims["iss"], "http://localhost:9229/local_abc");
        assert_eq!(claims["scope"], DEFAULT_SCOPE);
        assert_eq!(claims["username"], "Alice");
        assert_eq!(claims["cognito:groups"], json!(["admins"]));
        let iat = claims["iat"].as_i64().unwrap();
        let exp = claims["exp"].as_i64().unwrap();
        assert_eq!(exp - iat, pool.access_token_validity);
        assert_eq!(set.expires_in, pool.access_token_validity);
        assert!(set.refresh_token.is_some());
    }

    #[test]
    fn id_token_maps_attributes_and_booleans() {
        let (generator, pool, client, user) = fixture();
        let set = generator
            .generate(&pool, &client, &user, &[], IssueReason::RefreshTokens, None)
            .unwrap();

        assert!(set.refresh_token.is_none(), "refresh flow mints no new refresh token");
        let claims = decode_unverified(&set.id_token);
        assert_eq!(claims["token_use"], "id");
        assert_eq!(claims["aud"], "client1");
        assert_eq!(claims["cognito:username"], "Alice");
        assert_eq!(claims["email"], "alice@example.com");
        assert_eq!(claims["email_verified"], Value::Bool(true));
        assert!(claims.get("cognito:groups").is_none());
    }

    #[test]
    fn overrides_apply_to_both_tokens() {
        let (generator, pool, client, user) = fixture();
        let overrides = ClaimsAndScopeOverride {
            claims_to_add_or_override: HashMap::from([
                ("tenant".to_string(), json!("acme")),
            ]),
            claims_to_suppress: vec!["email".to_string()],
            group_override_details: Some(GroupOverrideDetails {
                groups_to_override: vec!["forced".to_string()],
            }),
            scopes_to_add: vec!["profile".to_string()],
            scopes_to_suppress: vec![],
        };
        let set = generator
            .generate(
                &pool,
                &client,
                &user,
                &["admins".into()],
                IssueReason::Authentication,
                Some(&overrides),
            )
            .unwrap();

        let access = decode_unverified(&set.access_token);
        let id = decode_unverified(&set.id_token);
        assert_eq!(access["tenant"], "acme");
        assert_eq!(id["tenant"], "acme");
        assert!(id.get("email").is_none(), "suppressed claims are absent");
        assert_eq!(access["cognito:groups"], json!(["forced"]));
        assert_eq!(id["cognito:groups"], json!(["forced"]));
        assert_eq!(access["scope"], format!("{DEFAULT_SCOPE} profile"));
    }

    #[test]
    fn verification_round_trips_and_rejects_id_tokens() {
        // Verification checks exp against wall-clock time, so this
        // fixture cannot use the pinned clock.
        let (generator, pool, client, user) = fixture_with(Arc::new(super::super::clock::SystemClock));
        let set = generator
            .generate(&pool, &client, &user, &[], IssueReason::Authentication, None)
            .unwrap();

        let verified = generator.verify_access_token(&set.access_token).unwrap();
        assert_eq!(verified.username, "Alice");
        assert_eq!(verified.client_id, "client1");

        assert!(generator.verify_access_token(&set.id_token).is_err());
        assert!(generator.verify_access_token("not-a-token").is_err());
    }

    #[test]
    fn refresh_tokens_are_long_and_distinct() {
        let a = new_refresh_token();
        let b = new_refresh_token();
        assert_ne!(a, b);
        assert!(a.len() >= 43);
    }
}
