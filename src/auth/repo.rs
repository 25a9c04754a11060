use std::collections::HashMap;
use std::sync::Arc;

use axum::async_trait;
use sqlx::{error::ErrorKind, postgres::PgDatabaseError, PgPool};
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use tracing::{info, instrument};
use uuid::Uuid;

#[cfg(test)]
use mockall::automock;

use crate::auth::repo_types::{ConflictField, NewUserAccount, UserAccount, UserRow};

const USERNAME_UNIQUE: &str = "users_username_key";
const EMAIL_UNIQUE: &str = "users_email_key";

#[derive(Debug, Error)]
pub enum StoreError {
    /// Unique fields that collided, in the order the store reported them.
    #[error("duplicate key on {0:?}")]
    Conflict(Vec<ConflictField>),
    /// Field-level rejections, in schema order.
    #[error("validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("internal store error: {0}")]
    Internal(String),
}

/// Persistence for user accounts.
///
/// `insert_unique` must check uniqueness and insert in one atomic step;
/// callers never check-then-insert.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn insert_unique(&self, account: NewUserAccount) -> Result<UserAccount, StoreError>;
}

#[derive(Clone)]
pub struct PgUserStore {
    db: PgPool,
}

impl PgUserStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl UserStore for PgUserStore {
    #[instrument(skip(self, account), fields(username = %account.username))]
    async fn insert_unique(&self, account: NewUserAccount) -> Result<UserAccount, StoreError> {
        let row = sqlx::query_as::<_, UserRow>(
            r#"
            INSERT INTO users (username, email, password_hash, role, is_active)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id, username, email, password_hash, role, is_active, created_at, updated_at
            "#,
        )
        .bind(&account.username)
        .bind(&account.email)
        .bind(account.password_hash.as_str())
        .bind(account.role.as_str())
        .bind(account.is_active)
        .fetch_one(&self.db)
        .await
        .map_err(classify)?;

        let user = UserAccount::try_from(row).map_err(|e| StoreError::Internal(e.to_string()))?;
        info!(user_id = %user.id, "user inserted");
        Ok(user)
    }
}

/// Maps driver errors onto the store's typed outcomes.
fn classify(err: sqlx::Error) -> StoreError {
    let sqlx::Error::Database(db_err) = &err else {
        return StoreError::Database(err);
    };
    match db_err.kind() {
        ErrorKind::UniqueViolation => match db_err.constraint().and_then(conflict_field) {
            Some(field) => StoreError::Conflict(vec![field]),
            None => StoreError::Database(err),
        },
        ErrorKind::CheckViolation => match db_err.constraint().and_then(check_message) {
            Some(msg) => StoreError::Validation(vec![msg.to_string()]),
            None => StoreError::Database(err),
        },
        ErrorKind::NotNullViolation => {
            let column = db_err
                .try_downcast_ref::<PgDatabaseError>()
                .and_then(|pg| pg.column())
                .unwrap_or("field");
            StoreError::Validation(vec![format!("{column} is required")])
        }
        _ => StoreError::Database(err),
    }
}

fn conflict_field(constraint: &str) -> Option<ConflictField> {
    match constraint {
        USERNAME_UNIQUE => Some(ConflictField::Username),
        EMAIL_UNIQUE => Some(ConflictField::Email),
        _ => None,
    }
}

fn check_message(constraint: &str) -> Option<&'static str> {
    match constraint {
        "users_username_not_empty" => Some("username must not be empty"),
        "users_email_not_empty" => Some("email must not be empty"),
        "users_password_hash_not_empty" => Some("password hash must not be empty"),
        "users_role_check" => Some("role must be one of: standard, admin"),
        _ => None,
    }
}

/// Process-local store; uniqueness is checked and the insert made under one write lock.
#[derive(Debug, Default, Clone)]
pub struct InMemoryUserStore {
    users: Arc<RwLock<HashMap<Uuid, UserAccount>>>,
}

impl InMemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.users.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.users.read().await.is_empty()
    }

    pub async fn find_by_username(&self, username: &str) -> Option<UserAccount> {
        self.users
            .read()
            .await
            .values()
            .find(|u| u.username == username)
            .cloned()
    }
}

#[async_trait]
impl UserStore for InMemoryUserStore {
    async fn insert_unique(&self, account: NewUserAccount) -> Result<UserAccount, StoreError> {
        let mut errors = Vec::new();
        if account.username.is_empty() {
            errors.push("username is required".to_string());
        }
        if account.email.is_empty() {
            errors.push("email is required".to_string());
        }
        if account.password_hash.as_str().is_empty() {
            errors.push("password hash is required".to_string());
        }
        if !errors.is_empty() {
            return Err(StoreError::Validation(errors));
        }

        let mut users = self.users.write().await;

        let mut conflicts = Vec::new();
        if users.values().any(|u| u.username == account.username) {
            conflicts.push(ConflictField::Username);
        }
        if users.values().any(|u| u.email == account.email) {
            conflicts.push(ConflictField::Email);
        }
        if !conflicts.is_empty() {
            return Err(StoreError::Conflict(conflicts));
        }

        let now = OffsetDateTime::now_utc();
        let user = UserAccount {
            id: Uuid::new_v4(),
            username: account.username,
            email: account.email,
            password_hash: account.password_hash,
            role: account.role,
            is_active: account.is_active,
            created_at: now,
            updated_at: now,
        };
        users.insert(user.id, user.clone());

        info!(user_id = %user.id, "user inserted");
        Ok(user)
    }
}
