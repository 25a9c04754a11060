use std::{sync::Arc, time::Duration};

use lazy_static::lazy_static;
use regex::Regex;
use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use crate::auth::{
    dto::PublicUser,
    password::PasswordHasher,
    repo::{StoreError, UserStore},
    repo_types::{ConflictField, NewUserAccount},
};

/// Baseline policy: length only. Composition rules belong to callers.
pub const MIN_PASSWORD_LENGTH: usize = 8;

/// Registration input. Lives only for the duration of one `register` call.
#[derive(Debug, Default)]
pub struct RegistrationRequest {
    pub username: Option<String>,
    pub email: Option<String>,
    pub password: Option<SecretString>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationFailure {
    #[error("Please enter all required fields: username, email, and password.")]
    MissingFields,
    #[error("Invalid email format.")]
    InvalidEmail,
    #[error("Password must be at least 8 characters long.")]
    PasswordTooShort,
    /// Rejected by the store's own field validation.
    #[error("Validation failed.")]
    Rejected(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationOutcome {
    Created(PublicUser),
    ValidationFailed(ValidationFailure),
    Conflict(ConflictField),
    /// Opaque to the caller; the cause is only logged.
    ServerError,
}

pub(crate) fn is_valid_email(email: &str) -> bool {
    lazy_static! {
        static ref EMAIL_RE: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
    }
    EMAIL_RE.is_match(email)
}

pub(crate) fn is_strong_password(password: &str) -> bool {
    password.chars().count() >= MIN_PASSWORD_LENGTH
}

/// Validates a registration, hashes the password and inserts the account.
#[derive(Clone)]
pub struct RegistrationService {
    store: Arc<dyn UserStore>,
    hasher: Arc<dyn PasswordHasher>,
    deadline: Option<Duration>,
}

impl RegistrationService {
    pub fn new(store: Arc<dyn UserStore>, hasher: Arc<dyn PasswordHasher>) -> Self {
        Self {
            store,
            hasher,
            deadline: None,
        }
    }

    /// Caps the whole pipeline; exceeding it yields `ServerError`.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    #[instrument(skip(self, request), fields(username = request.username.as_deref().unwrap_or("")))]
    pub async fn register(&self, request: RegistrationRequest) -> RegistrationOutcome {
        let Some(limit) = self.deadline else {
            return self.run(request).await;
        };
        match tokio::time::timeout(limit, self.run(request)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(?limit, "registration timed out");
                RegistrationOutcome::ServerError
            }
        }
    }

    async fn run(&self, request: RegistrationRequest) -> RegistrationOutcome {
        let (username, email, password) = match validate(request) {
            Ok(fields) => fields,
            Err(failure) => {
                debug!(%failure, "registration rejected");
                return RegistrationOutcome::ValidationFailed(failure);
            }
        };

        // The hasher consumes the plaintext; nothing below can see it.
        let password_hash = match self.hasher.hash(password).await {
            Ok(h) => h,
            Err(e) => {
                error!(error = %e, "password hashing failed");
                return RegistrationOutcome::ServerError;
            }
        };

        let account = NewUserAccount::standard(username, email, password_hash);
        match self.store.insert_unique(account).await {
            Ok(user) => {
                info!(user_id = %user.id, "user registered");
                RegistrationOutcome::Created(PublicUser::from(&user))
            }
            Err(StoreError::Conflict(fields)) => match fields.first() {
                Some(&field) => {
                    info!(%field, "registration conflict");
                    RegistrationOutcome::Conflict(field)
                }
                None => {
                    error!("store reported a conflict without fields");
                    RegistrationOutcome::ServerError
                }
            },
            Err(StoreError::Validation(messages)) => {
                debug!(?messages, "store rejected account");
                RegistrationOutcome::ValidationFailed(ValidationFailure::Rejected(messages))
            }
            Err(e) => {
                error!(error = %e, "registration failed");
                RegistrationOutcome::ServerError
            }
        }
    }
}

/// Presence, email shape, then password length. Username and email are
/// trimmed and the email lowercased; the password is left untouched.
fn validate(
    request: RegistrationRequest,
) -> Result<(String, String, SecretString), ValidationFailure> {
    let username = request
        .username
        .map(|u| u.trim().to_string())
        .filter(|u| !u.is_empty());
    let email = request
        .email
        .map(|e| e.trim().to_lowercase())
        .filter(|e| !e.is_empty());
    let password = request
        .password
        .filter(|p| !p.expose_secret().is_empty());

    let (Some(username), Some(email), Some(password)) = (username, email, password) else {
        return Err(ValidationFailure::MissingFields);
    };
    if !is_valid_email(&email) {
        return Err(ValidationFailure::InvalidEmail);
    }
    if !is_strong_password(password.expose_secret()) {
        return Err(ValidationFailure::PasswordTooShort);
    }
    Ok((username, email, password))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::password::{fast_hasher, HashError, HashedPassword};
    use crate::auth::repo::{InMemoryUserStore, MockUserStore};
    use crate::auth::repo_types::{Role, UserAccount};
    use axum::async_trait;
    use time::OffsetDateTime;
    use uuid::Uuid;

    fn request(username: &str, email: &str, password: &str) -> RegistrationRequest {
        RegistrationRequest {
            username: Some(username.into()),
            email: Some(email.into()),
            password: Some(SecretString::from(password)),
        }
    }

    fn alice() -> RegistrationRequest {
        request("alice", "alice@example.com", "secret123")
    }

    fn service_with(store: impl UserStore + 'static) -> RegistrationService {
        RegistrationService::new(Arc::new(store), Arc::new(fast_hasher()))
    }

    fn untouched_store() -> MockUserStore {
        let mut store = MockUserStore::new();
        store.expect_insert_unique().never();
        store
    }

    fn failing_store(err: fn() -> StoreError) -> MockUserStore {
        let mut store = MockUserStore::new();
        store
            .expect_insert_unique()
            .times(1)
            .returning(move |_| Err(err()));
        store
    }

    struct BrokenHasher;

    #[async_trait]
    impl PasswordHasher for BrokenHasher {
        async fn hash(&self, _: SecretString) -> Result<HashedPassword, HashError> {
            Err(HashError::Hash("boom".into()))
        }
        async fn verify(&self, _: SecretString, _: &HashedPassword) -> Result<bool, HashError> {
            Ok(false)
        }
    }

    struct SlowHasher(Duration);

    #[async_trait]
    impl PasswordHasher for SlowHasher {
        async fn hash(&self, _: SecretString) -> Result<HashedPassword, HashError> {
            tokio::time::sleep(self.0).await;
            Ok(HashedPassword::from_phc("$argon2id$v=19$slow".into()))
        }
        async fn verify(&self, _: SecretString, _: &HashedPassword) -> Result<bool, HashError> {
            Ok(false)
        }
    }

    #[tokio::test]
    async fn missing_fields_never_reach_the_store() {
        let service = service_with(untouched_store());
        let cases = [
            RegistrationRequest::default(),
            RegistrationRequest { username: None, ..alice() },
            RegistrationRequest { email: None, ..alice() },
            RegistrationRequest { password: None, ..alice() },
            request("", "alice@example.com", "secret123"),
            request("   ", "alice@example.com", "secret123"),
            request("alice", "", "secret123"),
            request("alice", "alice@example.com", ""),
        ];

        for case in cases {
            assert_eq!(
                service.register(case).await,
                RegistrationOutcome::ValidationFailed(ValidationFailure::MissingFields)
            );
        }
    }

    #[tokio::test]
    async fn malformed_emails_are_rejected() {
        let service = service_with(untouched_store());
        for email in ["plain", "a@b", "@b.co", "a@.", "a b@c.de", "a@b@c.de", "a@b."] {
            assert_eq!(
                service.register(request("alice", email, "secret123")).await,
                RegistrationOutcome::ValidationFailed(ValidationFailure::InvalidEmail),
                "email {email:?} should be rejected"
            );
        }
    }

    #[test]
    fn email_shape_check() {
        assert!(is_valid_email("a@b.co"));
        assert!(is_valid_email("first.last+tag@sub.example.org"));
        assert!(!is_valid_email("a@bco"));
    }

    #[tokio::test]
    async fn short_passwords_are_rejected() {
        let service = service_with(untouched_store());
        // 7 characters, 14 bytes.
        for password in ["a", "1234567", "ééééééé"] {
            assert_eq!(
                service.register(request("alice", "alice@example.com", password)).await,
                RegistrationOutcome::ValidationFailed(ValidationFailure::PasswordTooShort)
            );
        }
    }

    #[test]
    fn length_is_the_only_password_rule() {
        assert!(is_strong_password("12345678"));
        assert!(is_strong_password("aaaaaaaa"));
        assert!(is_strong_password("        "));
        assert!(!is_strong_password("1234567"));
    }

    #[tokio::test]
    async fn validation_order_is_presence_email_password() {
        let service = service_with(untouched_store());
        assert_eq!(
            service.register(request("alice", "nope", "")).await,
            RegistrationOutcome::ValidationFailed(ValidationFailure::MissingFields)
        );
        assert_eq!(
            service.register(request("alice", "nope", "short")).await,
            RegistrationOutcome::ValidationFailed(ValidationFailure::InvalidEmail)
        );
    }

    #[tokio::test]
    async fn registers_alice_with_a_real_hash() {
        let store = InMemoryUserStore::new();
        let hasher = fast_hasher();
        let service = RegistrationService::new(Arc::new(store.clone()), Arc::new(hasher.clone()));

        let RegistrationOutcome::Created(user) = service.register(alice()).await else {
            panic!("expected Created");
        };
        assert_eq!(user.username, "alice");
        assert_eq!(user.email, "alice@example.com");
        assert_eq!(user.role, Role::Standard);

        let stored = store.find_by_username("alice").await.expect("persisted");
        assert_eq!(stored.id, user.id);
        assert_ne!(stored.password_hash.as_str(), "secret123");
        assert!(hasher
            .verify(SecretString::from("secret123"), &stored.password_hash)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn accepts_minimal_valid_shapes() {
        let store = InMemoryUserStore::new();
        let service = service_with(store.clone());

        let outcome = service.register(request("bo", "a@b.co", "12345678")).await;
        assert!(matches!(outcome, RegistrationOutcome::Created(_)));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn email_is_trimmed_and_lowercased() {
        let service = service_with(InMemoryUserStore::new());
        let outcome = service
            .register(request("  alice ", " Alice@Example.COM ", "secret123"))
            .await;
        let RegistrationOutcome::Created(user) = outcome else {
            panic!("expected Created, got {outcome:?}");
        };
        assert_eq!(user.username, "alice");
        assert_eq!(user.email, "alice@example.com");
    }

    #[tokio::test]
    async fn second_registration_with_same_username_conflicts() {
        let store = InMemoryUserStore::new();
        let service = service_with(store.clone());

        assert!(matches!(
            service.register(alice()).await,
            RegistrationOutcome::Created(_)
        ));
        assert_eq!(
            service
                .register(request("alice", "someone-else@example.com", "secret123"))
                .await,
            RegistrationOutcome::Conflict(ConflictField::Username)
        );
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn duplicate_email_conflicts_on_email() {
        let service = service_with(InMemoryUserStore::new());
        service.register(alice()).await;
        assert_eq!(
            service
                .register(request("alice2", "ALICE@example.com", "secret123"))
                .await,
            RegistrationOutcome::Conflict(ConflictField::Email)
        );
    }

    #[tokio::test]
    async fn first_reported_conflict_field_wins() {
        let service = service_with(failing_store(|| {
            StoreError::Conflict(vec![ConflictField::Email, ConflictField::Username])
        }));
        assert_eq!(
            service.register(alice()).await,
            RegistrationOutcome::Conflict(ConflictField::Email)
        );
    }

    #[tokio::test]
    async fn failed_validation_is_idempotent_and_side_effect_free() {
        let store = InMemoryUserStore::new();
        let service = service_with(store.clone());

        let first = service.register(request("alice", "alice@example.com", "")).await;
        let second = service.register(request("alice", "alice@example.com", "")).await;

        assert_eq!(first, second);
        assert_eq!(
            first,
            RegistrationOutcome::ValidationFailed(ValidationFailure::MissingFields)
        );
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn store_field_errors_are_aggregated_in_order() {
        let service = service_with(failing_store(|| {
            StoreError::Validation(vec![
                "username is required".into(),
                "role must be one of: standard, admin".into(),
            ])
        }));
        assert_eq!(
            service.register(alice()).await,
            RegistrationOutcome::ValidationFailed(ValidationFailure::Rejected(vec![
                "username is required".into(),
                "role must be one of: standard, admin".into(),
            ]))
        );
    }

    #[tokio::test]
    async fn unexpected_store_failures_become_server_error() {
        let service = service_with(failing_store(|| {
            StoreError::Database(sqlx::Error::PoolTimedOut)
        }));
        assert_eq!(service.register(alice()).await, RegistrationOutcome::ServerError);

        let service = service_with(failing_store(|| StoreError::Conflict(Vec::new())));
        assert_eq!(service.register(alice()).await, RegistrationOutcome::ServerError);
    }

    #[tokio::test]
    async fn hashing_failure_is_a_server_error_without_insert() {
        let service = RegistrationService::new(Arc::new(untouched_store()), Arc::new(BrokenHasher));
        assert_eq!(service.register(alice()).await, RegistrationOutcome::ServerError);
    }

    #[tokio::test]
    async fn deadline_overrun_is_a_server_error() {
        let store = InMemoryUserStore::new();
        let service = RegistrationService::new(
            Arc::new(store.clone()),
            Arc::new(SlowHasher(Duration::from_millis(500))),
        )
        .with_deadline(Duration::from_millis(20));

        assert_eq!(service.register(alice()).await, RegistrationOutcome::ServerError);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn inserted_account_is_always_standard_and_active() {
        let mut store = MockUserStore::new();
        store
            .expect_insert_unique()
            .withf(|account| account.role == Role::Standard && account.is_active)
            .times(1)
            .returning(|account| {
                let now = OffsetDateTime::now_utc();
                Ok(UserAccount {
                    id: Uuid::new_v4(),
                    username: account.username,
                    email: account.email,
                    password_hash: account.password_hash,
                    role: account.role,
                    is_active: account.is_active,
                    created_at: now,
                    updated_at: now,
                })
            });

        let outcome = service_with(store).register(alice()).await;
        assert!(matches!(outcome, RegistrationOutcome::Created(ref u) if u.role == Role::Standard));
    }
}
