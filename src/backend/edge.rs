//! Privileged server-side functions shared by both adapters.
//!
//! Each adapter exposes its account table through [`AccountStore`]; the
//! request handling and authorization checks live here once.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use super::{decode_rows, AuthError, BackendError, Filter, NewAccount, Row};
use crate::event::{validate_email, validate_password, UserId};
use crate::model::{Role, Table, Ticket, UserProfile};

pub const CREATE_USER: &str = "create-user";
pub const DELETE_USERS: &str = "delete-users";
pub const PROVISION_INITIAL_USERS: &str = "provision-initial-users";
pub const AUTO_ASSIGN: &str = "auto-assign";

#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    pub email: String,
    pub password: SecretString,
    pub name: String,
    pub role: Role,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteUsersRequest {
    pub user_ids: Vec<UserId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteUsersResponse {
    pub deleted: usize,
}

#[derive(Debug, Deserialize)]
pub struct ProvisionUser {
    pub email: String,
    pub password: SecretString,
    pub name: String,
    pub role: Role,
}

#[derive(Debug, Deserialize)]
pub struct ProvisionRequest {
    pub users: Vec<ProvisionUser>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionResponse {
    pub created: Vec<String>,
    pub existing: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignedAgent {
    pub id: UserId,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoAssignResponse {
    pub agent: Option<AssignedAgent>,
}

#[async_trait]
pub(crate) trait AccountStore: Send + Sync {
    /// Signed-in profile of the calling client.
    fn caller(&self) -> Option<UserProfile>;

    /// Reads with server privileges, ignoring the caller's session.
    async fn rows(&self, table: Table, filter: &Filter) -> Result<Vec<Row>, BackendError>;

    async fn find_account(&self, email: &str) -> Result<Option<UserProfile>, BackendError>;

    /// Creates the credential record and its profile row.
    async fn create_account(
        &self,
        account: NewAccount<'_>,
        confirmed: bool,
    ) -> Result<UserProfile, AuthError>;

    /// Removes every listed account or none of them.
    async fn delete_accounts(&self, ids: &[UserId]) -> Result<usize, BackendError>;
}

pub(crate) async fn invoke<S>(store: &S, function: &str, payload: Value) -> Result<Value, BackendError>
where
    S: AccountStore + ?Sized,
{
    match function {
        CREATE_USER => {
            require_admin(store)?;
            let request: CreateUserRequest = serde_json::from_value(payload)?;
            let profile = create_user(store, request).await?;
            Ok(serde_json::to_value(profile)?)
        }
        DELETE_USERS => {
            let admin = require_admin(store)?;
            let request: DeleteUsersRequest = serde_json::from_value(payload)?;
            let response = delete_users(store, &admin, &request).await?;
            Ok(serde_json::to_value(response)?)
        }
        PROVISION_INITIAL_USERS => {
            require_admin_or_bootstrap(store).await?;
            let request: ProvisionRequest = serde_json::from_value(payload)?;
            let response = provision(store, request).await?;
            Ok(serde_json::to_value(response)?)
        }
        AUTO_ASSIGN => {
            if store.caller().is_none() {
                return Err(BackendError::Unauthorized);
            }
            let agent = least_loaded_agent(store).await?;
            Ok(serde_json::to_value(AutoAssignResponse { agent })?)
        }
        other => {
            warn!(function = other, "unknown edge function");
            Err(BackendError::Rejected(format!("Unknown function: {other}")))
        }
    }
}

fn require_admin<S: AccountStore + ?Sized>(store: &S) -> Result<UserProfile, BackendError> {
    match store.caller() {
        Some(user) if user.role == Role::Admin => Ok(user),
        Some(_) => Err(BackendError::Rejected("Only administrators can manage users".into())),
        None => Err(BackendError::Unauthorized),
    }
}

/// Seeding is open until the first administrator exists.
async fn require_admin_or_bootstrap<S: AccountStore + ?Sized>(store: &S) -> Result<(), BackendError> {
    let admins = store
        .rows(Table::Profiles, &Filter::new().column_eq("role", Role::Admin.as_str()))
        .await?;
    if admins.is_empty() {
        info!("no administrator yet, provisioning allowed");
        return Ok(());
    }
    require_admin(store).map(drop)
}

fn reject_invalid(email: &str, password: &SecretString, name: &str) -> Result<(), BackendError> {
    validate_email(email).map_err(|e| BackendError::Rejected(e.to_string()))?;
    validate_password(password).map_err(|e| BackendError::Rejected(e.to_string()))?;
    if name.trim().is_empty() {
        return Err(BackendError::Rejected("name is required".into()));
    }
    Ok(())
}

fn auth_to_backend(e: AuthError) -> BackendError {
    match e {
        AuthError::EmailTaken => BackendError::Conflict(e.to_string()),
        other => BackendError::Rejected(other.to_string()),
    }
}

async fn create_user<S: AccountStore + ?Sized>(
    store: &S,
    request: CreateUserRequest,
) -> Result<UserProfile, BackendError> {
    reject_invalid(&request.email, &request.password, &request.name)?;
    let account = NewAccount {
        email: &request.email,
        password: &request.password,
        name: &request.name,
        role: request.role,
    };
    // Accounts created by an admin skip email confirmation.
    let profile = store.create_account(account, true).await.map_err(auth_to_backend)?;
    info!(user = %profile.id, role = profile.role.as_str(), "user created");
    Ok(profile)
}

async fn delete_users<S: AccountStore + ?Sized>(
    store: &S,
    admin: &UserProfile,
    request: &DeleteUsersRequest,
) -> Result<DeleteUsersResponse, BackendError> {
    if request.user_ids.is_empty() {
        return Err(BackendError::Rejected("No users selected".into()));
    }
    if request.user_ids.contains(&admin.id) {
        return Err(BackendError::Rejected("You cannot delete your own account".into()));
    }
    let mut seen = HashSet::new();
    let ids: Vec<UserId> = request
        .user_ids
        .iter()
        .filter(|id| seen.insert(*id))
        .cloned()
        .collect();
    let deleted = store.delete_accounts(&ids).await?;
    info!(count = deleted, "users deleted");
    Ok(DeleteUsersResponse { deleted })
}

/// Idempotent: accounts that already exist are reported, not recreated.
async fn provision<S: AccountStore + ?Sized>(
    store: &S,
    request: ProvisionRequest,
) -> Result<ProvisionResponse, BackendError> {
    let mut response = ProvisionResponse::default();
    for user in request.users {
        reject_invalid(&user.email, &user.password, &user.name)?;
        if store.find_account(&user.email).await?.is_some() {
            response.existing.push(user.email);
            continue;
        }
        let account = NewAccount {
            email: &user.email,
            password: &user.password,
            name: &user.name,
            role: user.role,
        };
        match store.create_account(account, true).await {
            Ok(_) => response.created.push(user.email),
            // Lost a race with a concurrent provisioning run.
            Err(AuthError::EmailTaken) => response.existing.push(user.email),
            Err(e) => return Err(auth_to_backend(e)),
        }
    }
    info!(
        created = response.created.len(),
        existing = response.existing.len(),
        "initial users provisioned"
    );
    Ok(response)
}

/// Available agent with the fewest open assigned tickets; ties go to the
/// name, then the id.
async fn least_loaded_agent<S: AccountStore + ?Sized>(
    store: &S,
) -> Result<Option<AssignedAgent>, BackendError> {
    let agents: Vec<UserProfile> = decode_rows(
        Table::Profiles,
        store
            .rows(
                Table::Profiles,
                &Filter::new()
                    .column_eq("role", Role::Agent.as_str())
                    .column_eq("is_available", true),
            )
            .await?,
    );
    if agents.is_empty() {
        return Ok(None);
    }
    let tickets: Vec<Ticket> = decode_rows(Table::Tickets, store.rows(Table::Tickets, &Filter::new()).await?);
    let mut load: HashMap<&UserId, usize> = HashMap::new();
    for ticket in tickets.iter().filter(|t| t.status.is_open()) {
        if let Some(agent) = &ticket.assigned_to {
            *load.entry(agent).or_default() += 1;
        }
    }
    let picked = agents.iter().min_by(|a, b| {
        let load_a = load.get(&a.id).copied().unwrap_or(0);
        let load_b = load.get(&b.id).copied().unwrap_or(0);
        load_a
            .cmp(&load_b)
            .then_with(|| a.name.cmp(&b.name))
            .then_with(|| a.id.cmp(&b.id))
    });
    Ok(picked.map(|agent| AssignedAgent {
        id: agent.id.clone(),
        name: agent.name.clone(),
    }))
}
