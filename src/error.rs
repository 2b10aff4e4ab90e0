use actix_web::{http::StatusCode, ResponseError};
use log::error;
use sea_orm::{DbErr, TransactionError};
use thiserror::Error;

use crate::email_identity::EmailError;
use crate::response::response_from_error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("{msg}")]
    Biz { code: i32, msg: String },
}

impl AppError {
    pub fn param_error(msg: impl Into<String>) -> Self {
        Self::Biz { code: 1, msg: msg.into() }
    }

    pub fn fail(msg: impl Into<String>) -> Self {
        Self::Biz { code: 2, msg: msg.into() }
    }

    pub fn need_login() -> Self {
        Self::Biz { code: 3, msg: "please login first".to_string() }
    }

    pub fn need_username() -> Self {
        Self::Biz { code: 5, msg: "please pick a username first".to_string() }
    }

    pub fn system_exception() -> Self {
        Self::Biz { code: 99, msg: "system_exception".to_string() }
    }

    pub fn code(&self) -> i32 {
        match self {
            Self::Biz { code, .. } => *code,
        }
    }

    pub fn msg(&self) -> &str {
        match self {
            Self::Biz { msg, .. } => msg,
        }
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        StatusCode::OK
    }

    fn error_response(&self) -> actix_web::HttpResponse {
        response_from_error(self)
    }
}

impl From<DbErr> for AppError {
    fn from(err: DbErr) -> Self {
        error!("database error: {}", err);
        Self::system_exception()
    }
}

impl From<EmailError> for AppError {
    fn from(err: EmailError) -> Self {
        match err {
            EmailError::Validation(_) | EmailError::BadKeyFormat => Self::param_error(err.to_string()),
            EmailError::Db(db) => db.into(),
            other => Self::fail(other.to_string()),
        }
    }
}

pub fn map_tx_error<E>(err: TransactionError<E>) -> AppError
where
    E: std::error::Error + Into<AppError>,
{
    match err {
        TransactionError::Connection(db) => db.into(),
        TransactionError::Transaction(inner) => inner.into(),
    }
}
