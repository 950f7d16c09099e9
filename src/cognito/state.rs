use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};

use super::clock::{epoch_secs, Clock, IdSource, RandomIds, SystemClock};
use super::error::CognitoError;
use super::keys::{JwkSet, KeyStore};
use super::messages::MessagesService;
use super::otp::OtpService;
use super::pool::{user_key, AppClient, Group, User, UserPool};
use super::store::{pool_path, UserPoolService};
use super::tokens::TokenGenerator;
use super::triggers::TriggerRuntime;
use super::types::*;

const SESSION_TTL_SECS: i64 = 3600;

/// A pending auth challenge, keyed by the server-issued session UUID.
/// Held in memory only; a restart voids pending challenges.
#[derive(Debug, Clone)]
pub struct AuthSession {
    pub pool_id: String,
    pub username: String,
    pub challenge: String,
    pub issued_at: DateTime<Utc>,
}

pub struct ServiceOptions {
    pub data_dir: PathBuf,
    pub issuer: String,
    pub triggers: TriggerRuntime,
    pub deterministic_codes: bool,
}

/// The Cognito facade: owns the pool handles, the global client index and
/// the service singletons every target handler orchestrates over.
pub struct CognitoService {
    data_dir: PathBuf,
    pools: RwLock<HashMap<String, Arc<UserPoolService>>>,
    client_index: RwLock<HashMap<String, String>>,
    sessions: Mutex<HashMap<String, AuthSession>>,
    pub(super) triggers: TriggerRuntime,
    pub(super) tokens: TokenGenerator,
    pub(super) messages: MessagesService,
    pub(super) otp: OtpService,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) ids: Arc<dyn IdSource>,
    keys: Arc<KeyStore>,
}

impl CognitoService {
    pub async fn open(options: ServiceOptions) -> Result<Self, CognitoError> {
        Self::open_with(options, Arc::new(SystemClock), Arc::new(RandomIds)).await
    }

    pub async fn open_with(
        options: ServiceOptions,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdSource>,
    ) -> Result<Self, CognitoError> {
        std::fs::create_dir_all(&options.data_dir).map_err(|e| {
            CognitoError::InternalError(format!(
                "create {}: {e}",
                options.data_dir.display()
            ))
        })?;
        let keys = Arc::new(KeyStore::open(&options.data_dir)?);
        let tokens =
            TokenGenerator::new(keys.clone(), options.issuer, clock.clone(), ids.clone());
        let messages = MessagesService::new(&options.data_dir);
        let otp = if options.deterministic_codes {
            OtpService::deterministic()
        } else {
            OtpService::random()
        };

        let service = CognitoService {
            data_dir: options.data_dir,
            pools: RwLock::new(HashMap::new()),
            client_index: RwLock::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
            triggers: options.triggers,
            tokens,
            messages,
            otp,
            clock,
            ids,
            keys,
        };
        service.load_existing_pools().await?;
        Ok(service)
    }

    /// Scan the data directory, load every pool document and build the
    /// global client index eagerly.
    async fn load_existing_pools(&self) -> Result<(), CognitoError> {
        let entries = std::fs::read_dir(&self.data_dir).map_err(|e| {
            CognitoError::InternalError(format!("scan {}: {e}", self.data_dir.display()))
        })?;
        for entry in entries.flatten() {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !name.ends_with(".json") || name == "signing-key.json" {
                continue;
            }
            let service = Arc::new(UserPoolService::load(path, self.clock.clone()).await?);
            let pool = service.snapshot().await;
            tracing::info!(pool_id = %pool.id, users = pool.users.len(), "loaded user pool");
            let mut index = self.client_index.write().await;
            for client_id in pool.clients.keys() {
                index.insert(client_id.clone(), pool.id.clone());
            }
            self.pools.write().await.insert(pool.id.clone(), service);
        }
        Ok(())
    }

    pub async fn get_user_pool(
        &self,
        pool_id: &str,
    ) -> Result<Arc<UserPoolService>, CognitoError> {
        if let Some(service) = self.pools.read().await.get(pool_id) {
            return Ok(service.clone());
        }
        // First access since startup; load from persistence and cache.
        let path = pool_path(&self.data_dir, pool_id);
        if !path.exists() {
            return Err(CognitoError::ResourceNotFound(format!(
                "User pool {pool_id} not found."
            )));
        }
        let service = Arc::new(UserPoolService::load(path, self.clock.clone()).await?);
        self.pools
            .write()
            .await
            .insert(pool_id.to_string(), service.clone());
        Ok(service)
    }

    /// Resolve the owning pool for a client id via the reverse index.
    pub async fn get_user_pool_for_client_id(
        &self,
        client_id: &str,
    ) -> Result<Arc<UserPoolService>, CognitoError> {
        let pool_id = self
            .client_index
            .read()
            .await
            .get(client_id)
            .cloned()
            .ok_or_else(|| {
                CognitoError::ResourceNotFound(format!("User pool client {client_id} not found."))
            })?;
        self.get_user_pool(&pool_id).await
    }

    pub async fn get_app_client(&self, client_id: &str) -> Result<AppClient, CognitoError> {
        let pool = self.get_user_pool_for_client_id(client_id).await?;
        let snapshot = pool.snapshot().await;
        snapshot.clients.get(client_id).cloned().ok_or_else(|| {
            CognitoError::ResourceNotFound(format!("User pool client {client_id} not found."))
        })
    }

    pub fn jwks(&self) -> JwkSet {
        self.keys.jwks()
    }

    pub fn issuer(&self, pool_id: &str) -> String {
        self.tokens.issuer(pool_id)
    }

    pub(super) async fn create_session(
        &self,
        pool_id: &str,
        username: &str,
        challenge: &str,
    ) -> String {
        let session = self.ids.new_id().to_string();
        self.sessions.lock().await.insert(
            session.clone(),
            AuthSession {
                pool_id: pool_id.to_string(),
                username: username.to_string(),
                challenge: challenge.to_string(),
                issued_at: self.clock.now(),
            },
        );
        session
    }

    /// Consume a pending challenge session, checking kind and expiry.
    pub(super) async fn take_session(
        &self,
        session: &str,
        challenge: &str,
    ) -> Result<AuthSession, CognitoError> {
        let mut sessions = self.sessions.lock().await;
        let entry = sessions
            .remove(session)
            .ok_or_else(|| CognitoError::NotAuthorized("Invalid session".into()))?;
        let age = (self.clock.now() - entry.issued_at).num_seconds();
        if age > SESSION_TTL_SECS || entry.challenge != challenge {
            return Err(CognitoError::NotAuthorized("Invalid session".into()));
        }
        Ok(entry)
    }

    // --- User pool targets ---

    pub async fn create_user_pool(
        &self,
        req: CreateUserPoolRequest,
    ) -> Result<CreateUserPoolResponse, CognitoError> {
        let suffix: String = self
            .ids
            .new_id()
            .to_string()
            .replace('-', "")
            .chars()
            .take(9)
            .collect();
        let id = format!("local_{suffix}");

        let mut pool = UserPool::new(id.clone(), req.pool_name, self.clock.now());
        if let Some(policies) = req.policies {
            if let Some(policy) = policies.password_policy {
                pool.password_policy = policy;
            }
        }
        if let Some(mfa) = req.mfa_configuration {
            pool.mfa_configuration = mfa;
        }
        pool.auto_verified_attributes = req.auto_verified_attributes;
        for descriptor in req.schema {
            if let Some(existing) = pool
                .schema_attributes
                .iter_mut()
                .find(|s| s.name == descriptor.name)
            {
                *existing = descriptor;
            } else {
                pool.schema_attributes.push(descriptor);
            }
        }

        let response = CreateUserPoolResponse {
            user_pool: pool_to_type(&pool),
        };
        let service = Arc::new(
            UserPoolService::create(&self.data_dir, pool, self.clock.clone()).await?,
        );
        self.pools.write().await.insert(id, service);
        Ok(response)
    }

    pub async fn delete_user_pool(&self, req: DeleteUserPoolRequest) -> Result<(), CognitoError> {
        let service = self.get_user_pool(&req.user_pool_id).await?;
        let snapshot = service.snapshot().await;

        self.pools.write().await.remove(&req.user_pool_id);
        let mut index = self.client_index.write().await;
        for client_id in snapshot.clients.keys() {
            index.remove(client_id);
        }
        drop(index);

        let path = pool_path(&self.data_dir, &req.user_pool_id);
        tokio::fs::remove_file(&path).await.map_err(|e| {
            CognitoError::InternalError(format!("remove {}: {e}", path.display()))
        })?;
        Ok(())
    }

    pub async fn describe_user_pool(
        &self,
        req: DescribeUserPoolRequest,
    ) -> Result<DescribeUserPoolResponse, CognitoError> {
        let pool = self.get_user_pool(&req.user_pool_id).await?.snapshot().await;
        Ok(DescribeUserPoolResponse {
            user_pool: pool_to_type(&pool),
        })
    }

    pub async fn list_user_pools(
        &self,
        req: ListUserPoolsRequest,
    ) -> Result<ListUserPoolsResponse, CognitoError> {
        let services: Vec<Arc<UserPoolService>> =
            self.pools.read().await.values().cloned().collect();
        let mut pools = Vec::with_capacity(services.len());
        for service in services {
            pools.push(service.snapshot().await);
        }
        pools.sort_by(|a, b| a.id.cmp(&b.id));

        let limit = req.max_results.unwrap_or(60).min(60);
        let start = req
            .next_token
            .as_deref()
            .and_then(|t| pools.iter().position(|p| p.id == t).map(|i| i + 1))
            .unwrap_or(0);
        let page: Vec<&UserPool> = pools.iter().skip(start).take(limit).collect();
        let next_token = if start + limit < pools.len() {
            page.last().map(|p| p.id.clone())
        } else {
            None
        };

        Ok(ListUserPoolsResponse {
            user_pools: page
                .into_iter()
                .map(|p| UserPoolDescriptionType {
                    id: p.id.clone(),
                    name: p.name.clone(),
                    creation_date: epoch_secs(p.creation_date),
                    last_modified_date: epoch_secs(p.last_modified_date),
                })
                .collect(),
            next_token,
        })
    }

    pub async fn update_user_pool(&self, req: UpdateUserPoolRequest) -> Result<(), CognitoError> {
        let service = self.get_user_pool(&req.user_pool_id).await?;
        service
            .mutate_pool(|pool| {
                if let Some(policies) = req.policies {
                    if let Some(policy) = policies.password_policy {
                        pool.password_policy = policy;
                    }
                }
                if let Some(mfa) = req.mfa_configuration {
                    pool.mfa_configuration = mfa;
                }
                if let Some(attrs) = req.auto_verified_attributes {
                    pool.auto_verified_attributes = attrs;
                }
                Ok(())
            })
            .await
    }

    pub async fn get_user_pool_mfa_config(
        &self,
        req: GetUserPoolMfaConfigRequest,
    ) -> Result<UserPoolMfaConfigResponse, CognitoError> {
        let pool = self.get_user_pool(&req.user_pool_id).await?.snapshot().await;
        Ok(mfa_config_response(&pool))
    }

    pub async fn set_user_pool_mfa_config(
        &self,
        req: SetUserPoolMfaConfigRequest,
    ) -> Result<UserPoolMfaConfigResponse, CognitoError> {
        let service = self.get_user_pool(&req.user_pool_id).await?;
        let pool = service
            .mutate_pool(|pool| {
                if let Some(mfa) = req.mfa_configuration {
                    pool.mfa_configuration = mfa;
                }
                Ok(pool.clone())
            })
            .await?;
        Ok(mfa_config_response(&pool))
    }

    // --- App client targets ---

    pub async fn create_user_pool_client(
        &self,
        req: CreateUserPoolClientRequest,
    ) -> Result<CreateUserPoolClientResponse, CognitoError> {
        let service = self.get_user_pool(&req.user_pool_id).await?;

        let client_id: String = self
            .ids
            .new_id()
            .to_string()
            .replace('-', "")
            .chars()
            .take(26)
            .collect();
        let mut client = AppClient::new(
            client_id.clone(),
            req.client_name,
            req.user_pool_id.clone(),
            self.clock.now(),
        );
        if req.generate_secret {
            client.client_secret = Some(
                self.ids
                    .new_id()
                    .to_string()
                    .replace('-', "")
                    .chars()
                    .take(40)
                    .collect(),
            );
        }
        client.explicit_auth_flows = req.explicit_auth_flows;
        client.read_attributes = req.read_attributes;
        client.write_attributes = req.write_attributes;
        client.access_token_validity = req.access_token_validity;
        client.id_token_validity = req.id_token_validity;
        client.refresh_token_validity = req.refresh_token_validity;

        let response = CreateUserPoolClientResponse {
            user_pool_client: client_to_type(&client),
        };
        service
            .mutate_pool(|pool| {
                pool.clients.insert(client_id.clone(), client);
                Ok(())
            })
            .await?;
        self.client_index
            .write()
            .await
            .insert(client_id, req.user_pool_id);
        Ok(response)
    }

    pub async fn delete_user_pool_client(
        &self,
        req: DeleteUserPoolClientRequest,
    ) -> Result<(), CognitoError> {
        let service = self.get_user_pool(&req.user_pool_id).await?;
        service
            .mutate_pool(|pool| {
                pool.clients.remove(&req.client_id).ok_or_else(|| {
                    CognitoError::ResourceNotFound(format!(
                        "User pool client {} not found.",
                        req.client_id
                    ))
                })?;
                Ok(())
            })
            .await?;
        self.client_index.write().await.remove(&req.client_id);
        Ok(())
    }

    pub async fn describe_user_pool_client(
        &self,
        req: DescribeUserPoolClientRequest,
    ) -> Result<DescribeUserPoolClientResponse, CognitoError> {
        let pool = self.get_user_pool(&req.user_pool_id).await?.snapshot().await;
        let client = pool.clients.get(&req.client_id).ok_or_else(|| {
            CognitoError::ResourceNotFound(format!(
                "User pool client {} not found.",
                req.client_id
            ))
        })?;
        Ok(DescribeUserPoolClientResponse {
            user_pool_client: client_to_type(client),
        })
    }

    pub async fn list_user_pool_clients(
        &self,
        req: ListUserPoolClientsRequest,
    ) -> Result<ListUserPoolClientsResponse, CognitoError> {
        let pool = self.get_user_pool(&req.user_pool_id).await?.snapshot().await;

        let mut clients: Vec<&AppClient> = pool.clients.values().collect();
        clients.sort_by(|a, b| a.client_id.cmp(&b.client_id));

        let limit = req.max_results.unwrap_or(60).min(60);
        let start = req
            .next_token
            .as_deref()
            .and_then(|t| clients.iter().position(|c| c.client_id == t).map(|i| i + 1))
            .unwrap_or(0);
        let page: Vec<&AppClient> = clients.iter().skip(start).take(limit).copied().collect();
        let next_token = if start + limit < clients.len() {
            page.last().map(|c| c.client_id.clone())
        } else {
            None
        };

        Ok(ListUserPoolClientsResponse {
            user_pool_clients: page
                .into_iter()
                .map(|c| UserPoolClientDescription {
                    client_id: c.client_id.clone(),
                    client_name: c.client_name.clone(),
                    user_pool_id: c.user_pool_id.clone(),
                })
                .collect(),
            next_token,
        })
    }

    pub async fn update_user_pool_client(
        &self,
        req: UpdateUserPoolClientRequest,
    ) -> Result<UpdateUserPoolClientResponse, CognitoError> {
        let service = self.get_user_pool(&req.user_pool_id).await?;
        let now = self.clock.now();
        let client = service
            .mutate_pool(|pool| {
                let client = pool.clients.get_mut(&req.client_id).ok_or_else(|| {
                    CognitoError::ResourceNotFound(format!(
                        "User pool client {} not found.",
                        req.client_id
                    ))
                })?;
                if let Some(name) = req.client_name {
                    client.client_name = name;
                }
                if let Some(flows) = req.explicit_auth_flows {
                    client.explicit_auth_flows = flows;
                }
                if let Some(attrs) = req.read_attributes {
                    client.read_attributes = attrs;
                }
                if let Some(attrs) = req.write_attributes {
                    client.write_attributes = attrs;
                }
                if req.access_token_validity.is_some() {
                    client.access_token_validity = req.access_token_validity;
                }
                if req.id_token_validity.is_some() {
                    client.id_token_validity = req.id_token_validity;
                }
                if req.refresh_token_validity.is_some() {
                    client.refresh_token_validity = req.refresh_token_validity;
                }
                client.last_modified_date = now;
                Ok(client.clone())
            })
            .await?;
        Ok(UpdateUserPoolClientResponse {
            user_pool_client: client_to_type(&client),
        })
    }
}

// --- Wire conversions ---

fn mfa_config_response(pool: &UserPool) -> UserPoolMfaConfigResponse {
    UserPoolMfaConfigResponse {
        mfa_configuration: pool.mfa_configuration,
        software_token_mfa_configuration: Some(SoftwareTokenMfaConfigType {
            enabled: pool.mfa_configuration != super::pool::MfaConfig::Off,
        }),
    }
}

pub(super) fn pool_to_type(pool: &UserPool) -> UserPoolType {
    UserPoolType {
        id: pool.id.clone(),
        name: pool.name.clone(),
        policies: PoliciesType {
            password_policy: Some(pool.password_policy.clone()),
        },
        mfa_configuration: pool.mfa_configuration,
        auto_verified_attributes: pool.auto_verified_attributes.clone(),
        schema_attributes: pool.schema_attributes.clone(),
        estimated_number_of_users: pool.users.len() as i64,
        creation_date: epoch_secs(pool.creation_date),
        last_modified_date: epoch_secs(pool.last_modified_date),
    }
}

pub(super) fn user_to_type(user: &User) -> UserType {
    UserType {
        username: user.username.clone(),
        attributes: user.attributes.clone(),
        user_create_date: epoch_secs(user.create_date),
        user_last_modified_date: epoch_secs(user.last_modified_date),
        enabled: user.enabled,
        user_status: user.user_status.as_str().to_string(),
    }
}

pub(super) fn group_to_type(pool_id: &str, group: &Group) -> GroupType {
    GroupType {
        group_name: group.group_name.clone(),
        user_pool_id: pool_id.to_string(),
        description: group.description.clone(),
        role_arn: group.role_arn.clone(),
        precedence: group.precedence,
        creation_date: epoch_secs(group.creation_date),
        last_modified_date: epoch_secs(group.last_modified_date),
    }
}

pub(super) fn client_to_type(client: &AppClient) -> UserPoolClientType {
    UserPoolClientType {
        client_id: client.client_id.clone(),
        client_name: client.client_name.clone(),
        user_pool_id: client.user_pool_id.clone(),
        client_secret: client.client_secret.clone(),
        explicit_auth_flows: client.explicit_auth_flows.clone(),
        read_attributes: client.read_attributes.clone(),
        write_attributes: client.write_attributes.clone(),
        access_token_validity: client.access_token_validity,
        id_token_validity: client.id_token_validity,
        refresh_token_validity: client.refresh_token_validity,
        creation_date: epoch_secs(client.creation_date),
        last_modified_date: epoch_secs(client.last_modified_date),
    }
}

/// Resolve the user a presented access token belongs to.
pub(super) async fn resolve_token_user(
    service: &CognitoService,
    access_token: &str,
) -> Result<(Arc<UserPoolService>, User), CognitoError> {
    let verified = service.tokens.verify_access_token(access_token)?;
    let pool_id = verified
        .issuer
        .rsplit('/')
        .next()
        .unwrap_or_default()
        .to_string();
    let pool = service.get_user_pool(&pool_id).await?;
    let user = pool
        .get_user_by_username(&verified.username)
        .await
        .ok_or_else(|| CognitoError::UserNotFound(verified.username.clone()))?;
    Ok((pool, user))
}

pub(super) fn require_user_match(session: &AuthSession, username: &str) -> Result<(), CognitoError> {
    if user_key(&session.username) != user_key(username) {
        return Err(CognitoError::NotAuthorized("Invalid session".into()));
    }
    Ok(())
}
