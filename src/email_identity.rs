//! Ownership and verification lifecycle of the email addresses attached to an
//! account.
//!
//! ```text
//! NotVerified --verify(key)--> Verified --promote--> primary
//!      |  ^                        |
//!      +--+ rekey                  |
//!      |                           |
//!      +-----------+---------------+--> Deleted (never while primary)
//!                  |
//! Reported --------+   (set by moderation, blocks rekey and verify)
//! ```
//!
//! Every status change goes through the functions in [`transition`]; the
//! operations below only decide which one applies.

use chrono::Utc;
use log::{debug, info};
use md5::{Digest, Md5};
use rand::RngCore;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter, QueryOrder,
    Set, TransactionTrait,
};
use subtle::ConstantTimeEq;
use thiserror::Error;

use crate::db::is_unique_violation;
use crate::entity::email::{self, EmailStatus};
use crate::notify::Notifier;

pub const KEY_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum EmailError {
    #[error("{0} is not a valid email address.")]
    Validation(String),
    #[error("{0} is registered by another user.")]
    AlreadyRegistered(String),
    #[error("{0} is not a registered email.")]
    NotFound(String),
    #[error("{0} is not your email.")]
    NotOwned(String),
    #[error("{0} is your primary email. It cannot be deleted.")]
    PrimaryEmail(String),
    #[error("{0} is already your primary email.")]
    AlreadyPrimary(String),
    #[error("{0} is not a verified email. Please verify to make primary.")]
    NotVerified(String),
    #[error("Verification key could not be detected. You may have a broken link.")]
    BadKeyFormat,
    #[error("{0} was changed by another request. Please try again.")]
    Conflict(String),
    #[error(transparent)]
    Db(#[from] DbErr),
}

/// Non-failing results. Each carries the row as it is after the operation.
#[derive(Debug)]
pub enum EmailOutcome {
    Added(email::Model),
    AlreadyAdded(email::Model),
    Deleted(email::Model),
    MadePrimary(email::Model),
    KeySent(email::Model),
    AlreadyVerified(email::Model),
    Reported(email::Model),
    Verified(email::Model),
    InvalidKey(email::Model),
    /// Unknown or foreign address on a key request; nothing is revealed.
    Ignored,
}

impl EmailOutcome {
    pub fn email(&self) -> Option<&email::Model> {
        match self {
            Self::Added(m)
            | Self::AlreadyAdded(m)
            | Self::Deleted(m)
            | Self::MadePrimary(m)
            | Self::KeySent(m)
            | Self::AlreadyVerified(m)
            | Self::Reported(m)
            | Self::Verified(m)
            | Self::InvalidKey(m) => Some(m),
            Self::Ignored => None,
        }
    }

    pub fn message(&self) -> String {
        match self {
            Self::Added(m) => format!("{} has been successfully added.", m.address),
            Self::AlreadyAdded(m) => format!("{} is already added.", m.address),
            Self::Deleted(m) => format!("{} has been successfully deleted.", m.address),
            Self::MadePrimary(m) => format!("{} has been successfully made your primary email.", m.address),
            Self::KeySent(m) => format!(
                "We sent your email verification to {}. Please check your inbox for verification instructions.",
                m.address
            ),
            Self::AlreadyVerified(m) => format!("{} is already verified.", m.address),
            Self::Reported(m) => format!(
                "{} is reported. It cannot be verified until case is resolved.",
                m.address
            ),
            Self::Verified(m) => format!("{} has been successfully verified.", m.address),
            Self::InvalidKey(_) => {
                "Verification key is not valid. Please request a new verification key and try again.".to_string()
            }
            Self::Ignored => String::new(),
        }
    }
}

/// Cheap syntactic check. Anything it ever accepted must stay accepted.
pub fn is_email(address: &str) -> bool {
    address.contains('@') && address.contains('.') && address.len() >= 5
}

/// 32 lowercase hex chars: md5 over fresh random bytes and `seed`.
pub fn generate_key(seed: &str) -> String {
    let mut noise = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut noise);
    let mut hasher = Md5::new();
    hasher.update(noise);
    hasher.update(seed.as_bytes());
    format!("{:x}", hasher.finalize())
}

pub fn is_key_format(key: Option<&str>) -> bool {
    matches!(key, Some(k) if k.chars().count() == KEY_LEN)
}

/// Runs in time independent of where the keys first differ.
pub fn keys_match(stored: &str, supplied: &str) -> bool {
    stored.as_bytes().ct_eq(supplied.as_bytes()).into()
}

pub fn new_email(user_id: i32, address: &str, is_primary: bool) -> email::ActiveModel {
    let now = Utc::now();
    email::ActiveModel {
        user_id: Set(user_id),
        address: Set(address.to_string()),
        status: Set(EmailStatus::NotVerified),
        verification_key: Set(generate_key(address)),
        is_primary: Set(is_primary),
        created: Set(Some(now)),
        updated: Set(Some(now)),
        ..Default::default()
    }
}

pub mod transition {
    //! Each write re-checks its source state in the UPDATE itself, so a
    //! snapshot that went stale since it was read can never be applied.

    use super::*;

    async fn reload<C: ConnectionTrait>(db: &C, model: &email::Model) -> Result<Option<email::Model>, DbErr> {
        email::Entity::find_by_id(model.id).one(db).await
    }

    /// The row as it is now, unless it is gone or deleted.
    async fn reload_live<C: ConnectionTrait>(db: &C, model: &email::Model) -> Result<email::Model, EmailError> {
        reload(db, model)
            .await?
            .filter(|m| m.status != EmailStatus::Deleted)
            .ok_or_else(|| EmailError::NotFound(model.address.clone()))
    }

    /// New key for a row that is still NotVerified.
    pub async fn rekey<C: ConnectionTrait>(db: &C, model: &email::Model) -> Result<email::Model, EmailError> {
        if model.status != EmailStatus::NotVerified {
            return Err(EmailError::Conflict(model.address.clone()));
        }
        let res = email::Entity::update_many()
            .col_expr(email::Column::VerificationKey, Expr::value(generate_key(&model.address)))
            .col_expr(email::Column::Updated, Expr::value(Utc::now()))
            .filter(email::Column::Id.eq(model.id))
            .filter(email::Column::Status.eq(EmailStatus::NotVerified))
            .exec(db)
            .await?;
        let current = reload_live(db, model).await?;
        if res.rows_affected != 1 {
            return Err(EmailError::Conflict(model.address.clone()));
        }
        Ok(current)
    }

    /// NotVerified -> Verified, only while the stored key is still the one
    /// the caller checked.
    pub async fn verify<C: ConnectionTrait>(db: &C, model: &email::Model) -> Result<email::Model, EmailError> {
        if model.status != EmailStatus::NotVerified {
            return Err(EmailError::Conflict(model.address.clone()));
        }
        let res = email::Entity::update_many()
            .col_expr(email::Column::Status, Expr::value(EmailStatus::Verified))
            .col_expr(email::Column::Updated, Expr::value(Utc::now()))
            .filter(email::Column::Id.eq(model.id))
            .filter(email::Column::Status.eq(EmailStatus::NotVerified))
            .filter(email::Column::VerificationKey.eq(model.verification_key.as_str()))
            .exec(db)
            .await?;
        let current = reload_live(db, model).await?;
        if res.rows_affected != 1 {
            return Err(EmailError::Conflict(model.address.clone()));
        }
        Ok(current)
    }

    /// Any live, non-primary row -> Deleted.
    pub async fn delete<C: ConnectionTrait>(db: &C, model: &email::Model) -> Result<email::Model, EmailError> {
        if model.status == EmailStatus::Deleted {
            return Err(EmailError::NotFound(model.address.clone()));
        }
        if model.is_primary {
            return Err(EmailError::PrimaryEmail(model.address.clone()));
        }
        let res = email::Entity::update_many()
            .col_expr(email::Column::Status, Expr::value(EmailStatus::Deleted))
            .col_expr(email::Column::Updated, Expr::value(Utc::now()))
            .filter(email::Column::Id.eq(model.id))
            .filter(email::Column::Status.ne(EmailStatus::Deleted))
            .filter(email::Column::IsPrimary.eq(false))
            .exec(db)
            .await?;
        if res.rows_affected == 1 {
            return reload(db, model)
                .await?
                .ok_or_else(|| EmailError::NotFound(model.address.clone()));
        }
        let current = reload_live(db, model).await?;
        if current.is_primary {
            return Err(EmailError::PrimaryEmail(current.address));
        }
        Err(EmailError::Conflict(current.address))
    }

    pub fn check_promotable(model: &email::Model) -> Result<(), EmailError> {
        if model.is_primary {
            return Err(EmailError::AlreadyPrimary(model.address.clone()));
        }
        if model.status != EmailStatus::Verified {
            return Err(EmailError::NotVerified(model.address.clone()));
        }
        Ok(())
    }

    /// Clears the flag on every other live primary of `user_id`.
    pub async fn demote_others<C: ConnectionTrait>(db: &C, user_id: i32, keep_id: i32) -> Result<u64, DbErr> {
        let res = email::Entity::update_many()
            .col_expr(email::Column::IsPrimary, Expr::value(false))
            .col_expr(email::Column::Updated, Expr::value(Utc::now()))
            .filter(email::Column::UserId.eq(user_id))
            .filter(email::Column::IsPrimary.eq(true))
            .filter(email::Column::Status.ne(EmailStatus::Deleted))
            .filter(email::Column::Id.ne(keep_id))
            .exec(db)
            .await?;
        Ok(res.rows_affected)
    }

    /// Compare-and-swap: only a verified, non-primary row is promoted.
    pub async fn promote<C: ConnectionTrait>(db: &C, model: &email::Model) -> Result<(), EmailError> {
        check_promotable(model)?;
        let res = email::Entity::update_many()
            .col_expr(email::Column::IsPrimary, Expr::value(true))
            .col_expr(email::Column::Updated, Expr::value(Utc::now()))
            .filter(email::Column::Id.eq(model.id))
            .filter(email::Column::Status.eq(EmailStatus::Verified))
            .filter(email::Column::IsPrimary.eq(false))
            .exec(db)
            .await?;
        if res.rows_affected != 1 {
            return Err(EmailError::Conflict(model.address.clone()));
        }
        Ok(())
    }
}

pub async fn find_active_by_address<C: ConnectionTrait>(db: &C, address: &str) -> Result<Option<email::Model>, DbErr> {
    email::Entity::find()
        .filter(email::Column::Address.eq(address))
        .filter(email::Column::Status.ne(EmailStatus::Deleted))
        .one(db)
        .await
}

pub async fn find_primary<C: ConnectionTrait>(db: &C, user_id: i32) -> Result<Option<email::Model>, DbErr> {
    email::Entity::find()
        .filter(email::Column::UserId.eq(user_id))
        .filter(email::Column::IsPrimary.eq(true))
        .filter(email::Column::Status.ne(EmailStatus::Deleted))
        .one(db)
        .await
}

pub async fn list_emails<C: ConnectionTrait>(db: &C, user_id: i32) -> Result<Vec<email::Model>, DbErr> {
    email::Entity::find()
        .filter(email::Column::UserId.eq(user_id))
        .filter(email::Column::Status.ne(EmailStatus::Deleted))
        .order_by_desc(email::Column::IsPrimary)
        .order_by_asc(email::Column::Id)
        .all(db)
        .await
}

async fn find_owned<C: ConnectionTrait>(db: &C, user_id: i32, address: &str) -> Result<email::Model, EmailError> {
    let model = find_active_by_address(db, address.trim())
        .await?
        .ok_or_else(|| EmailError::NotFound(address.to_string()))?;
    if model.user_id != user_id {
        return Err(EmailError::NotOwned(model.address));
    }
    Ok(model)
}

fn classify_existing(existing: email::Model, user_id: i32) -> Result<EmailOutcome, EmailError> {
    if existing.user_id == user_id {
        Ok(EmailOutcome::AlreadyAdded(existing))
    } else {
        Err(EmailError::AlreadyRegistered(existing.address))
    }
}

pub async fn add_email(
    db: &DatabaseConnection,
    notifier: &Notifier,
    user_id: i32,
    address: &str,
) -> Result<EmailOutcome, EmailError> {
    let address = address.trim();
    if !is_email(address) {
        return Err(EmailError::Validation(address.to_string()));
    }

    if let Some(existing) = find_active_by_address(db, address).await? {
        return classify_existing(existing, user_id);
    }

    match insert_or_classify(db, user_id, address).await? {
        EmailOutcome::Added(inserted) => {
            info!("email {} added for user {}", inserted.address, user_id);
            notifier.send_verification_email(&inserted).await;
            Ok(EmailOutcome::Added(inserted))
        }
        other => Ok(other),
    }
}

/// Inserts a fresh NotVerified row. When a concurrent insert of the same
/// address wins the unique index, the live row decides the outcome.
async fn insert_or_classify(db: &DatabaseConnection, user_id: i32, address: &str) -> Result<EmailOutcome, EmailError> {
    match new_email(user_id, address, false).insert(db).await {
        Ok(model) => Ok(EmailOutcome::Added(model)),
        Err(e) if is_unique_violation(&e) => {
            debug!("add_email unique conflict on {}", address);
            match find_active_by_address(db, address).await? {
                Some(existing) => classify_existing(existing, user_id),
                None => Err(EmailError::Conflict(address.to_string())),
            }
        }
        Err(e) => Err(e.into()),
    }
}

pub async fn delete_email(db: &DatabaseConnection, user_id: i32, address: &str) -> Result<EmailOutcome, EmailError> {
    let model = find_owned(db, user_id, address).await?;
    let deleted = transition::delete(db, &model).await?;
    info!("email {} deleted by user {}", deleted.address, user_id);
    Ok(EmailOutcome::Deleted(deleted))
}

pub async fn make_primary(db: &DatabaseConnection, user_id: i32, address: &str) -> Result<EmailOutcome, EmailError> {
    let model = find_owned(db, user_id, address).await?;
    transition::check_promotable(&model)?;

    let email_id = model.id;
    let promoted = db
        .transaction::<_, email::Model, EmailError>(|txn| {
            Box::pin(async move {
                // re-read inside the transaction so the checks see committed state
                let current = email::Entity::find_by_id(email_id)
                    .one(txn)
                    .await?
                    .filter(|m| m.status != EmailStatus::Deleted && m.user_id == user_id)
                    .ok_or_else(|| EmailError::NotFound(model.address.clone()))?;
                let demoted = transition::demote_others(txn, user_id, current.id).await?;
                transition::promote(txn, &current).await?;
                debug!("user {} demoted {} primary email(s)", user_id, demoted);
                email::Entity::find_by_id(email_id)
                    .one(txn)
                    .await?
                    .ok_or_else(|| EmailError::Conflict(current.address.clone()))
            })
        })
        .await
        .map_err(|e| match e {
            sea_orm::TransactionError::Connection(db) => EmailError::Db(db),
            sea_orm::TransactionError::Transaction(inner) => inner,
        })?;

    info!("email {} is now primary for user {}", promoted.address, user_id);
    Ok(EmailOutcome::MadePrimary(promoted))
}

pub async fn request_verification_key(
    db: &DatabaseConnection,
    notifier: &Notifier,
    user_id: i32,
    address: &str,
) -> Result<EmailOutcome, EmailError> {
    let model = match find_owned(db, user_id, address).await {
        Ok(model) => model,
        Err(EmailError::NotFound(_)) | Err(EmailError::NotOwned(_)) => return Ok(EmailOutcome::Ignored),
        Err(e) => return Err(e),
    };

    match model.status {
        EmailStatus::Verified => Ok(EmailOutcome::AlreadyVerified(model)),
        EmailStatus::Reported => Ok(EmailOutcome::Reported(model)),
        EmailStatus::Deleted => Ok(EmailOutcome::Ignored),
        EmailStatus::NotVerified => {
            let rekeyed = transition::rekey(db, &model).await?;
            debug!("new verification key issued for {}", rekeyed.address);
            notifier.send_verification_email(&rekeyed).await;
            Ok(EmailOutcome::KeySent(rekeyed))
        }
    }
}

pub async fn verify_email(
    db: &DatabaseConnection,
    user_id: i32,
    address: &str,
    supplied_key: Option<&str>,
) -> Result<EmailOutcome, EmailError> {
    let supplied_key = match supplied_key {
        Some(key) if is_key_format(Some(key)) => key,
        _ => return Err(EmailError::BadKeyFormat),
    };
    let model = find_owned(db, user_id, address).await?;

    match model.status {
        EmailStatus::Verified => Ok(EmailOutcome::AlreadyVerified(model)),
        EmailStatus::Reported => Ok(EmailOutcome::Reported(model)),
        EmailStatus::Deleted => Err(EmailError::NotFound(model.address)),
        EmailStatus::NotVerified => {
            if !keys_match(&model.verification_key, supplied_key) {
                debug!("verification key mismatch for {}", model.address);
                return Ok(EmailOutcome::InvalidKey(model));
            }
            let verified = transition::verify(db, &model).await?;
            info!("email {} verified by user {}", verified.address, user_id);
            Ok(EmailOutcome::Verified(verified))
        }
    }
}
