use actix_web::{dev::Payload, web, FromRequest, HttpRequest};
use chrono::{Duration, Utc};
use futures_util::future::LocalBoxFuture;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use log::{debug, info};
use sea_orm::{ActiveModelTrait, DatabaseConnection, EntityTrait, Set};
use serde::{Deserialize, Serialize};

use crate::config::AppConfig;
use crate::entity::user::{self, UserStatus};
use crate::error::AppError;

/// The signed-in user of the current request.
#[derive(Clone, Debug)]
pub struct AuthUser {
    pub user_id: i32,
    pub status: UserStatus,
}

/// An [`AuthUser`] that has picked a username.
#[derive(Clone, Debug)]
pub struct ActiveUser(pub AuthUser);

#[derive(Clone, Debug)]
pub struct OptionalAuthUser(pub Option<AuthUser>);

#[derive(Serialize, Deserialize)]
struct Claims {
    #[serde(rename = "loginId")]
    login_id: i32,
    exp: usize,
}

impl ActiveUser {
    pub fn user_id(&self) -> i32 {
        self.0.user_id
    }
}

impl FromRequest for AuthUser {
    type Error = actix_web::Error;
    type Future = LocalBoxFuture<'static, Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        let (db, config) = match app_state(req) {
            Some(state) => state,
            None => {
                return Box::pin(async { Err(AppError::system_exception().into()) });
            }
        };
        let token = extract_token(req, &config);

        Box::pin(async move {
            let token = token.ok_or_else(AppError::need_login)?;
            let auth = authenticate_token(&db, &config, &token).await?;
            Ok(auth)
        })
    }
}

impl FromRequest for ActiveUser {
    type Error = actix_web::Error;
    type Future = LocalBoxFuture<'static, Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, payload: &mut Payload) -> Self::Future {
        let auth = AuthUser::from_request(req, payload);
        Box::pin(async move {
            let auth = auth.await?;
            if auth.status == UserStatus::New {
                return Err(AppError::need_username().into());
            }
            Ok(ActiveUser(auth))
        })
    }
}

impl FromRequest for OptionalAuthUser {
    type Error = actix_web::Error;
    type Future = LocalBoxFuture<'static, Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        let (db, config) = match app_state(req) {
            Some(state) => state,
            None => {
                return Box::pin(async { Ok(OptionalAuthUser(None)) });
            }
        };
        let token = extract_token(req, &config);

        Box::pin(async move {
            if let Some(token) = token {
                let auth = authenticate_token(&db, &config, &token).await.ok();
                return Ok(OptionalAuthUser(auth));
            }
            Ok(OptionalAuthUser(None))
        })
    }
}

fn app_state(req: &HttpRequest) -> Option<(web::Data<DatabaseConnection>, web::Data<AppConfig>)> {
    let db = req.app_data::<web::Data<DatabaseConnection>>()?.clone();
    let config = req.app_data::<web::Data<AppConfig>>()?.clone();
    Some((db, config))
}

fn extract_token(req: &HttpRequest, config: &AppConfig) -> Option<String> {
    let header = config.token_header.as_str();
    req.headers()
        .get(header)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Loads the user behind `token` and applies the per-request bookkeeping:
/// deleted users are refused, deactivated users come back, `last_acted` moves.
async fn authenticate_token(
    db: &DatabaseConnection,
    config: &AppConfig,
    token: &str,
) -> Result<AuthUser, AppError> {
    let user_id = decode_token(config, token)?;
    let found = user::Entity::find_by_id(user_id)
        .one(db)
        .await?
        .ok_or_else(AppError::need_login)?;
    if found.status == UserStatus::Deleted {
        return Err(AppError::need_login());
    }

    let mut active = user::ActiveModel {
        id: Set(found.id),
        last_acted: Set(Some(Utc::now())),
        ..Default::default()
    };
    let mut status = found.status;
    if status == UserStatus::Deactivated {
        status = if found.username.is_some() {
            UserStatus::Activated
        } else {
            UserStatus::New
        };
        active.status = Set(status);
        info!("user {} reactivated", found.id);
    }
    active.update(db).await?;
    debug!("request authenticated as user {}", found.id);

    Ok(AuthUser { user_id, status })
}

pub fn issue_token(config: &AppConfig, user_id: i32) -> Result<String, AppError> {
    let exp = (Utc::now() + Duration::days(config.token_ttl_days)).timestamp() as usize;
    let claims = Claims { login_id: user_id, exp };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(config.jwt_secret.as_bytes()),
    )
    .map_err(|_| AppError::system_exception())
}

fn decode_token(config: &AppConfig, token: &str) -> Result<i32, AppError> {
    let key = DecodingKey::from_secret(config.jwt_secret.as_bytes());
    let validation = Validation::new(Algorithm::HS256);
    decode::<Claims>(token, &key, &validation)
        .map(|data| data.claims.login_id)
        .map_err(|_| AppError::need_login())
}
