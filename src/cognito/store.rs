use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use tokio::sync::Mutex;

use super::clock::Clock;
use super::error::CognitoError;
use super::pool::{user_key, Group, MfaOption, User, UserPool};

/// Secondary lookup tables, derived from the canonical user table on load
/// and rebuilt after every mutation. Values are lowercased user keys.
#[derive(Debug, Default)]
struct Indexes {
    by_email: HashMap<String, String>,
    by_sub: HashMap<String, String>,
    by_refresh_token: HashMap<String, String>,
}

impl Indexes {
    fn rebuild(pool: &UserPool) -> Self {
        let mut index = Indexes::default();
        for (key, user) in &pool.users {
            if let Some(email) = user.email() {
                index.by_email.insert(email.to_lowercase(), key.clone());
            }
            if let Some(sub) = user.sub() {
                index.by_sub.insert(sub.to_string(), key.clone());
            }
            for token in &user.refresh_tokens {
                index.by_refresh_token.insert(token.clone(), key.clone());
            }
        }
        index
    }
}

struct PoolState {
    pool: UserPool,
    index: Indexes,
}

/// One pool's store. The mutex guards the whole
/// read-modify-write-persist sequence, so every mutating operation is
/// linearizable with respect to this pool.
pub struct UserPoolService {
    path: PathBuf,
    clock: Arc<dyn Clock>,
    state: Mutex<PoolState>,
}

impl UserPoolService {
    /// Wrap a freshly created pool and write its first document.
    pub async fn create(
        data_dir: &Path,
        pool: UserPool,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, CognitoError> {
        let service = UserPoolService {
            path: pool_path(data_dir, &pool.id),
            clock,
            state: Mutex::new(PoolState {
                index: Indexes::rebuild(&pool),
                pool,
            }),
        };
        {
            let state = service.state.lock().await;
            persist(&service.path, &state.pool).await?;
        }
        Ok(service)
    }

    /// Load a pool document from disk, building indexes eagerly.
    pub async fn load(path: PathBuf, clock: Arc<dyn Clock>) -> Result<Self, CognitoError> {
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| CognitoError::InternalError(format!("read {}: {e}", path.display())))?;
        let pool: UserPool = serde_json::from_slice(&bytes)
            .map_err(|e| CognitoError::InternalError(format!("parse {}: {e}", path.display())))?;
        Ok(UserPoolService {
            path,
            clock,
            state: Mutex::new(PoolState {
                index: Indexes::rebuild(&pool),
                pool,
            }),
        })
    }

    pub async fn pool_id(&self) -> String {
        self.state.lock().await.pool.id.clone()
    }

    /// Immutable snapshot for read paths; never observes a torn write.
    pub async fn snapshot(&self) -> UserPool {
        self.state.lock().await.pool.clone()
    }

    pub async fn get_user_by_username(&self, username: &str) -> Option<User> {
        let state = self.state.lock().await;
        state.pool.users.get(&user_key(username)).cloned()
    }

    pub async fn get_user_by_email(&self, email: &str) -> Option<User> {
        let state = self.state.lock().await;
        let key = state.index.by_email.get(&email.to_lowercase())?;
        state.pool.users.get(key).cloned()
    }

    pub async fn get_user_by_sub(&self, sub: &str) -> Option<User> {
        let state = self.state.lock().await;
        let key = state.index.by_sub.get(sub)?;
        state.pool.users.get(key).cloned()
    }

    pub async fn get_user_by_refresh_token(&self, token: &str) -> Option<User> {
        let state = self.state.lock().await;
        let key = state.index.by_refresh_token.get(token)?;
        state.pool.users.get(key).cloned()
    }

    /// Upsert. Stamps `LastModifiedDate`, rebuilds indexes, persists.
    pub async fn save_user(&self, mut user: User) -> Result<User, CognitoError> {
        user.last_modified_date = self.clock.now();
        let mut state = self.state.lock().await;
        state.pool.users.insert(user_key(&user.username), user.clone());
        let index = Indexes::rebuild(&state.pool);
        state.index = index;
        persist(&self.path, &state.pool).await?;
        Ok(user)
    }

    /// Read-modify-write under the pool mutex. The closure may fail
    /// without committing; on success the user is re-indexed and the pool
    /// persisted before returning.
    pub async fn update_user<T>(
        &self,
        username: &str,
        apply: impl FnOnce(&mut User) -> Result<T, CognitoError>,
    ) -> Result<T, CognitoError> {
        let mut state = self.state.lock().await;
        let now = self.clock.now();
        let user = state
            .pool
            .users
            .get_mut(&user_key(username))
            .ok_or_else(|| CognitoError::UserNotFound(username.to_string()))?;
        let value = apply(user)?;
        user.last_modified_date = now;
        let index = Indexes::rebuild(&state.pool);
        state.index = index;
        persist(&self.path, &state.pool).await?;
        Ok(value)
    }

    /// Remove a user from the table and every secondary index, including
    /// refresh tokens and group membership.
    pub async fn delete_user(&self, username: &str) -> Result<(), CognitoError> {
        let mut state = self.state.lock().await;
        let key = user_key(username);
        if state.pool.users.remove(&key).is_none() {
            return Err(CognitoError::UserNotFound(username.to_string()));
        }
        for group in state.pool.groups.values_mut() {
            group.members.remove(&key);
        }
        let index = Indexes::rebuild(&state.pool);
        state.index = index;
        persist(&self.path, &state.pool).await?;
        Ok(())
    }

    /// Append to the user's refresh-token set and the reverse index.
    /// Idempotent: storing the same token twice leaves the set unchanged.
    pub async fn store_refresh_token(
        &self,
        token: &str,
        username: &str,
    ) -> Result<(), CognitoError> {
        self.update_user(username, |user| {
            user.refresh_tokens.insert(token.to_string());
            Ok(())
        })
        .await
    }

    /// Drop every refresh token held by the user (global sign-out).
    pub async fn clear_refresh_tokens(&self, username: &str) -> Result<(), CognitoError> {
        self.update_user(username, |user| {
            user.refresh_tokens.clear();
            Ok(())
        })
        .await
    }

    /// Revoke one token wherever it lives. Unknown tokens are a no-op.
    pub async fn revoke_refresh_token(&self, token: &str) -> Result<(), CognitoError> {
        let mut state = self.state.lock().await;
        let Some(key) = state.index.by_refresh_token.get(token).cloned() else {
            return Ok(());
        };
        if let Some(user) = state.pool.users.get_mut(&key) {
            user.refresh_tokens.remove(token);
            user.last_modified_date = self.clock.now();
        }
        let index = Indexes::rebuild(&state.pool);
        state.index = index;
        persist(&self.path, &state.pool).await?;
        Ok(())
    }

    /// Atomic MFA preference update; empty settings clear the
    /// corresponding entries.
    pub async fn set_user_mfa_preference(
        &self,
        username: &str,
        sms: Option<MfaSetting>,
        software_token: Option<MfaSetting>,
    ) -> Result<(), CognitoError> {
        self.update_user(username, |user| {
            let mut settings: Vec<String> = Vec::new();
            let mut preferred = None;

            if let Some(sms) = &sms {
                if sms.enabled {
                    settings.push("SMS_MFA".to_string());
                    if sms.preferred {
                        preferred = Some("SMS_MFA".to_string());
                    }
                }
            } else if user.user_mfa_setting_list.iter().any(|s| s == "SMS_MFA") {
                settings.push("SMS_MFA".to_string());
            }

            if let Some(token) = &software_token {
                if token.enabled {
                    settings.push("SOFTWARE_TOKEN_MFA".to_string());
                    if token.preferred {
                        preferred = Some("SOFTWARE_TOKEN_MFA".to_string());
                    }
                }
            } else if user
                .user_mfa_setting_list
                .iter()
                .any(|s| s == "SOFTWARE_TOKEN_MFA")
            {
                settings.push("SOFTWARE_TOKEN_MFA".to_string());
            }

            if preferred.is_none() {
                preferred = user
                    .preferred_mfa_setting
                    .clone()
                    .filter(|p| settings.contains(p));
            }

            user.mfa_options = settings
                .iter()
                .filter(|s| s.as_str() == "SMS_MFA")
                .map(|_| MfaOption {
                    delivery_medium: "SMS".to_string(),
                    attribute_name: "phone_number".to_string(),
                })
                .collect();
            user.user_mfa_setting_list = settings;
            user.preferred_mfa_setting = preferred;
            Ok(())
        })
        .await
    }

    /// Apply a pool-metadata mutation and persist.
    pub async fn mutate_pool<T>(
        &self,
        apply: impl FnOnce(&mut UserPool) -> Result<T, CognitoError>,
    ) -> Result<T, CognitoError> {
        let mut state = self.state.lock().await;
        let value = apply(&mut state.pool)?;
        state.pool.last_modified_date = self.clock.now();
        let index = Indexes::rebuild(&state.pool);
        state.index = index;
        persist(&self.path, &state.pool).await?;
        Ok(value)
    }

    pub async fn add_user_to_group(
        &self,
        group_name: &str,
        username: &str,
    ) -> Result<(), CognitoError> {
        let mut state = self.state.lock().await;
        let key = user_key(username);
        if !state.pool.users.contains_key(&key) {
            return Err(CognitoError::UserNotFound(username.to_string()));
        }
        let group = state
            .pool
            .groups
            .get_mut(group_name)
            .ok_or_else(|| group_not_found(group_name))?;
        group.members.insert(key);
        persist(&self.path, &state.pool).await?;
        Ok(())
    }

    pub async fn remove_user_from_group(
        &self,
        group_name: &str,
        username: &str,
    ) -> Result<(), CognitoError> {
        let mut state = self.state.lock().await;
        let key = user_key(username);
        if !state.pool.users.contains_key(&key) {
            return Err(CognitoError::UserNotFound(username.to_string()));
        }
        let group = state
            .pool
            .groups
            .get_mut(group_name)
            .ok_or_else(|| group_not_found(group_name))?;
        group.members.remove(&key);
        persist(&self.path, &state.pool).await?;
        Ok(())
    }

    pub async fn mutate_group<T>(
        &self,
        group_name: &str,
        apply: impl FnOnce(&mut Group) -> Result<T, CognitoError>,
    ) -> Result<T, CognitoError> {
        let mut state = self.state.lock().await;
        let now = self.clock.now();
        let group = state
            .pool
            .groups
            .get_mut(group_name)
            .ok_or_else(|| group_not_found(group_name))?;
        let value = apply(group)?;
        group.last_modified_date = now;
        persist(&self.path, &state.pool).await?;
        Ok(value)
    }

    /// Page through users in stable Sub order. The pagination token is an
    /// opaque cursor; the filter accepts `attr = "v"` and `attr ^= "v"`.
    pub async fn list_users(
        &self,
        filter: Option<&Filter>,
        pagination_token: Option<&str>,
        limit: usize,
    ) -> Result<(Vec<User>, Option<String>), CognitoError> {
        let state = self.state.lock().await;

        let mut users: Vec<&User> = state
            .pool
            .users
            .values()
            .filter(|u| filter.map(|f| f.matches(u)).unwrap_or(true))
            .collect();
        users.sort_by(|a, b| a.sub().unwrap_or("").cmp(b.sub().unwrap_or("")));

        let start = match pagination_token {
            Some(token) => {
                let cursor = decode_cursor(token)?;
                users
                    .iter()
                    .position(|u| u.sub().unwrap_or("") > cursor.as_str())
                    .unwrap_or(users.len())
            }
            None => 0,
        };

        let page: Vec<User> = users
            .iter()
            .skip(start)
            .take(limit)
            .map(|u| (*u).clone())
            .collect();
        let next = if start + limit < users.len() {
            page.last()
                .and_then(|u| u.sub())
                .map(|sub| URL_SAFE_NO_PAD.encode(sub))
        } else {
            None
        };
        Ok((page, next))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MfaSetting {
    pub enabled: bool,
    pub preferred: bool,
}

/// Restricted AWS-style attribute filter: equality or prefix match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filter {
    pub attribute: String,
    pub prefix: bool,
    pub value: String,
}

impl Filter {
    /// Parse `attr = "value"` / `attr ^= "value"`. Empty input means no
    /// filtering.
    pub fn parse(input: &str) -> Result<Option<Filter>, CognitoError> {
        let input = input.trim();
        if input.is_empty() {
            return Ok(None);
        }
        let split_at = input
            .find(|c: char| c.is_whitespace() || c == '=' || c == '^')
            .ok_or_else(|| invalid_filter(input))?;
        let attribute = input[..split_at].trim();
        if attribute.is_empty() {
            return Err(invalid_filter(input));
        }
        let rest = input[split_at..].trim_start();
        let (prefix, rest) = if let Some(rest) = rest.strip_prefix("^=") {
            (true, rest)
        } else if let Some(rest) = rest.strip_prefix('=') {
            (false, rest)
        } else {
            return Err(invalid_filter(input));
        };
        let value = rest
            .trim()
            .strip_prefix('"')
            .and_then(|r| r.strip_suffix('"'))
            .ok_or_else(|| invalid_filter(input))?;
        Ok(Some(Filter {
            attribute: attribute.to_string(),
            prefix,
            value: value.to_string(),
        }))
    }

    pub fn matches(&self, user: &User) -> bool {
        let candidate = match self.attribute.as_str() {
            "username" => Some(user.username.clone()),
            "cognito:user_status" => Some(user.user_status.as_str().to_string()),
            "status" => Some(if user.enabled { "Enabled" } else { "Disabled" }.to_string()),
            name => super::pool::get_attribute(&user.attributes, name).map(String::from),
        };
        match candidate {
            Some(value) if self.prefix => value.starts_with(&self.value),
            Some(value) => value == self.value,
            None => false,
        }
    }
}

fn invalid_filter(input: &str) -> CognitoError {
    CognitoError::InvalidParameter(format!("Invalid filter: {input}"))
}

fn decode_cursor(token: &str) -> Result<String, CognitoError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(token)
        .map_err(|_| CognitoError::InvalidParameter("Invalid pagination token".into()))?;
    String::from_utf8(bytes)
        .map_err(|_| CognitoError::InvalidParameter("Invalid pagination token".into()))
}

fn group_not_found(group_name: &str) -> CognitoError {
    CognitoError::ResourceNotFound(format!("Group not found: {group_name}"))
}

pub fn pool_path(data_dir: &Path, pool_id: &str) -> PathBuf {
    data_dir.join(format!("{pool_id}.json"))
}

/// Write the pool document atomically: temp file, fsync, rename.
async fn persist(path: &Path, pool: &UserPool) -> Result<(), CognitoError> {
    let bytes = serde_json::to_vec_pretty(pool)
        .map_err(|e| CognitoError::InternalError(e.to_string()))?;
    let tmp = path.with_extension("json.tmp");

    let mut file = tokio::fs::File::create(&tmp)
        .await
        .map_err(|e| CognitoError::InternalError(format!("create {}: {e}", tmp.display())))?;
    tokio::io::AsyncWriteExt::write_all(&mut file, &bytes)
        .await
        .map_err(|e| CognitoError::InternalError(format!("write {}: {e}", tmp.display())))?;
    file.sync_all()
        .await
        .map_err(|e| CognitoError::InternalError(format!("sync {}: {e}", tmp.display())))?;
    drop(file);

    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| CognitoError::InternalError(format!("rename {}: {e}", path.display())))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::super::clock::SystemClock;
    use super::super::pool::{attribute, UserStatus};
    use super::super::tokens::new_refresh_token;
    use super::*;

    async fn service() -> (tempfile::TempDir, UserPoolService) {
        let dir = tempfile::tempdir().unwrap();
        let pool = UserPool::new("local_test".into(), "test".into(), Utc::now());
        let service = UserPoolService::create(dir.path(), pool, Arc::new(SystemClock))
            .await
            .unwrap();
        (dir, service)
    }

    fn user(name: &str, sub: &str) -> User {
        User::new(
            name.into(),
            vec![
                attribute("sub", sub),
                attribute("email", format!("{}@example.com", name.to_lowercase())),
            ],
            Some("p@ss".into()),
            UserStatus::Confirmed,
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn refresh_token_index_resolves_back_to_owner() {
        let (_dir, service) = service().await;
        service.save_user(user("Alice", "sub-a")).await.unwrap();

        let token = new_refresh_token();
        service.store_refresh_token(&token, "alice").await.unwrap();

        let resolved = service.get_user_by_refresh_token(&token).await.unwrap();
        assert_eq!(resolved.username, "Alice");
        assert!(resolved.refresh_tokens.contains(&token));
    }

    #[tokio::test]
    async fn storing_n_tokens_grows_set_by_n_without_duplicates() {
        let (_dir, service) = service().await;
        service.save_user(user("alice", "sub-a")).await.unwrap();

        let tokens: Vec<String> = (0..5).map(|_| new_refresh_token()).collect();
        for token in &tokens {
            service.store_refresh_token(token, "alice").await.unwrap();
        }
        // Idempotence: storing an existing token leaves the set unchanged.
        service
            .store_refresh_token(&tokens[0], "alice")
            .await
            .unwrap();

        let alice = service.get_user_by_username("alice").await.unwrap();
        assert_eq!(alice.refresh_tokens.len(), 5);
    }

    #[tokio::test]
    async fn deleting_a_user_purges_its_tokens_from_the_index() {
        let (_dir, service) = service().await;
        service.save_user(user("alice", "sub-a")).await.unwrap();
        let token = new_refresh_token();
        service.store_refresh_token(&token, "alice").await.unwrap();

        service.delete_user("ALICE").await.unwrap();
        assert!(service.get_user_by_refresh_token(&token).await.is_none());
        assert!(service.get_user_by_username("alice").await.is_none());
    }

    #[tokio::test]
    async fn lookups_are_case_insensitive_and_case_preserving() {
        let (_dir, service) = service().await;
        service.save_user(user("Alice", "sub-a")).await.unwrap();

        let by_name = service.get_user_by_username("aLiCe").await.unwrap();
        assert_eq!(by_name.username, "Alice");
        let by_email = service
            .get_user_by_email("ALICE@example.com")
            .await
            .unwrap();
        assert_eq!(by_email.username, "Alice");
        let by_sub = service.get_user_by_sub("sub-a").await.unwrap();
        assert_eq!(by_sub.username, "Alice");
    }

    #[tokio::test]
    async fn mfa_preference_is_idempotent_and_clearable() {
        let (_dir, service) = service().await;
        service.save_user(user("alice", "sub-a")).await.unwrap();

        let setting = MfaSetting {
            enabled: true,
            preferred: true,
        };
        service
            .set_user_mfa_preference("alice", None, Some(setting))
            .await
            .unwrap();
        service
            .set_user_mfa_preference("alice", None, Some(setting))
            .await
            .unwrap();

        let alice = service.get_user_by_username("alice").await.unwrap();
        assert_eq!(alice.user_mfa_setting_list, vec!["SOFTWARE_TOKEN_MFA"]);
        assert_eq!(
            alice.preferred_mfa_setting.as_deref(),
            Some("SOFTWARE_TOKEN_MFA")
        );

        service
            .set_user_mfa_preference(
                "alice",
                None,
                Some(MfaSetting {
                    enabled: false,
                    preferred: false,
                }),
            )
            .await
            .unwrap();
        let alice = service.get_user_by_username("alice").await.unwrap();
        assert!(alice.user_mfa_setting_list.is_empty());
        assert!(alice.preferred_mfa_setting.is_none());
    }

    #[tokio::test]
    async fn list_users_filters_and_paginates_in_sub_order() {
        let (_dir, service) = service().await;
        for (name, sub) in [("carol", "s3"), ("alice", "s1"), ("bob", "s2")] {
            service.save_user(user(name, sub)).await.unwrap();
        }

        let (page, next) = service.list_users(None, None, 2).await.unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].username, "alice");
        assert_eq!(page[1].username, "bob");
        let next = next.expect("more pages");

        let (rest, done) = service.list_users(None, Some(&next), 2).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].username, "carol");
        assert!(done.is_none());

        let filter = Filter::parse(r#"email ^= "b""#).unwrap().unwrap();
        let (matched, _) = service.list_users(Some(&filter), None, 10).await.unwrap();
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].username, "bob");
    }

    #[test]
    fn filter_grammar() {
        let eq = Filter::parse(r#"username = "alice""#).unwrap().unwrap();
        assert!(!eq.prefix);
        assert_eq!(eq.attribute, "username");
        assert_eq!(eq.value, "alice");

        let prefix = Filter::parse(r#"email ^= "a""#).unwrap().unwrap();
        assert!(prefix.prefix);

        assert!(Filter::parse("").unwrap().is_none());
        assert!(Filter::parse("username ~ \"x\"").is_err());
        assert!(Filter::parse("username = unquoted").is_err());
    }

    #[tokio::test]
    async fn reload_rebuilds_indexes_from_the_document() {
        let (dir, service) = service().await;
        service.save_user(user("alice", "sub-a")).await.unwrap();
        let token = new_refresh_token();
        service.store_refresh_token(&token, "alice").await.unwrap();
        let path = pool_path(dir.path(), "local_test");
        drop(service);

        let reloaded = UserPoolService::load(path, Arc::new(SystemClock))
            .await
            .unwrap();
        let alice = reloaded.get_user_by_refresh_token(&token).await.unwrap();
        assert_eq!(alice.username, "Alice");
    }
}
