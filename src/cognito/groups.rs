use super::error::CognitoError;
use super::pool::{user_key, Group};
use super::state::{group_to_type, user_to_type, CognitoService};
use super::types::*;

impl CognitoService {
    pub async fn create_group(
        &self,
        req: CreateGroupRequest,
    ) -> Result<CreateGroupResponse, CognitoError> {
        let pool_service = self.get_user_pool(&req.user_pool_id).await?;
        let now = self.clock.now();
        let group = pool_service
            .mutate_pool(|pool| {
                if pool.groups.contains_key(&req.group_name) {
                    return Err(CognitoError::GroupExists(req.group_name.clone()));
                }
                let group = Group::new(
                    req.group_name.clone(),
                    req.description.clone(),
                    req.role_arn.clone(),
                    req.precedence,
                    now,
                );
                pool.groups.insert(req.group_name.clone(), group.clone());
                Ok(group)
            })
            .await?;
        Ok(CreateGroupResponse {
            group: group_to_type(&req.user_pool_id, &group),
        })
    }

    pub async fn delete_group(&self, req: DeleteGroupRequest) -> Result<(), CognitoError> {
        let pool_service = self.get_user_pool(&req.user_pool_id).await?;
        pool_service
            .mutate_pool(|pool| {
                pool.groups.remove(&req.group_name).ok_or_else(|| {
                    CognitoError::ResourceNotFound(format!(
                        "Group not found: {}",
                        req.group_name
                    ))
                })?;
                Ok(())
            })
            .await
    }

    pub async fn get_group(&self, req: GetGroupRequest) -> Result<GetGroupResponse, CognitoError> {
        let pool = self.get_user_pool(&req.user_pool_id).await?.snapshot().await;
        let group = pool.groups.get(&req.group_name).ok_or_else(|| {
            CognitoError::ResourceNotFound(format!("Group not found: {}", req.group_name))
        })?;
        Ok(GetGroupResponse {
            group: group_to_type(&req.user_pool_id, group),
        })
    }

    pub async fn update_group(
        &self,
        req: UpdateGroupRequest,
    ) -> Result<UpdateGroupResponse, CognitoError> {
        let pool_service = self.get_user_pool(&req.user_pool_id).await?;
        let group = pool_service
            .mutate_group(&req.group_name, |group| {
                if req.description.is_some() {
                    group.description = req.description.clone();
                }
                if req.role_arn.is_some() {
                    group.role_arn = req.role_arn.clone();
                }
                if req.precedence.is_some() {
                    group.precedence = req.precedence;
                }
                Ok(group.clone())
            })
            .await?;
        Ok(UpdateGroupResponse {
            group: group_to_type(&req.user_pool_id, &group),
        })
    }

    pub async fn list_groups(
        &self,
        req: ListGroupsRequest,
    ) -> Result<ListGroupsResponse, CognitoError> {
        let pool = self.get_user_pool(&req.user_pool_id).await?.snapshot().await;

        let mut groups: Vec<&Group> = pool.groups.values().collect();
        groups.sort_by(|a, b| a.group_name.cmp(&b.group_name));

        let limit = req.limit.unwrap_or(60).min(60);
        let start = req
            .next_token
            .as_deref()
            .and_then(|t| groups.iter().position(|g| g.group_name == t).map(|i| i + 1))
            .unwrap_or(0);
        let page: Vec<&Group> = groups.iter().skip(start).take(limit).copied().collect();
        let next_token = if start + limit < groups.len() {
            page.last().map(|g| g.group_name.clone())
        } else {
            None
        };

        Ok(ListGroupsResponse {
            groups: page
                .into_iter()
                .map(|g| group_to_type(&req.user_pool_id, g))
                .collect(),
            next_token,
        })
    }

    pub async fn admin_add_user_to_group(
        &self,
        req: AdminAddUserToGroupRequest,
    ) -> Result<(), CognitoError> {
        let pool_service = self.get_user_pool(&req.user_pool_id).await?;
        pool_service
            .add_user_to_group(&req.group_name, &req.username)
            .await
    }

    pub async fn admin_remove_user_from_group(
        &self,
        req: AdminRemoveUserFromGroupRequest,
    ) -> Result<(), CognitoError> {
        let pool_service = self.get_user_pool(&req.user_pool_id).await?;
        pool_service
            .remove_user_from_group(&req.group_name, &req.username)
            .await
    }

    pub async fn admin_list_groups_for_user(
        &self,
        req: AdminListGroupsForUserRequest,
    ) -> Result<AdminListGroupsForUserResponse, CognitoError> {
        let pool_service = self.get_user_pool(&req.user_pool_id).await?;
        let pool = pool_service.snapshot().await;
        if !pool.users.contains_key(&user_key(&req.username)) {
            return Err(CognitoError::UserNotFound(req.username.clone()));
        }
        Ok(AdminListGroupsForUserResponse {
            groups: pool
                .groups_for_member(&req.username)
                .into_iter()
                .map(|g| group_to_type(&req.user_pool_id, g))
                .collect(),
            next_token: None,
        })
    }

    pub async fn list_users_in_group(
        &self,
        req: ListUsersInGroupRequest,
    ) -> Result<ListUsersInGroupResponse, CognitoError> {
        let pool = self.get_user_pool(&req.user_pool_id).await?.snapshot().await;
        let group = pool.groups.get(&req.group_name).ok_or_else(|| {
            CognitoError::ResourceNotFound(format!("Group not found: {}", req.group_name))
        })?;

        let mut users: Vec<&super::pool::User> = group
            .members
            .iter()
            .filter_map(|key| pool.users.get(key))
            .collect();
        users.sort_by(|a, b| a.username.cmp(&b.username));

        Ok(ListUsersInGroupResponse {
            users: users.into_iter().map(user_to_type).collect(),
            next_token: None,
        })
    }
}
