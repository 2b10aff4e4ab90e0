use actix_web::{web, HttpResponse};
use bcrypt::{hash, verify};
use chrono::{SecondsFormat, Utc};
use log::info;
use regex::Regex;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};

use crate::auth::{issue_token, ActiveUser, AuthUser, OptionalAuthUser};
use crate::config::AppConfig;
use crate::db::is_unique_violation;
use crate::email_identity::{find_active_by_address, find_primary, is_email, new_email, EmailError};
use crate::entity::follow::{self, FollowStatus};
use crate::entity::user::{self, UserStatus};
use crate::entity::{email, user_profile};
use crate::error::{map_tx_error, AppError};
use crate::notify::Notifier;
use crate::response::{ok, ok_msg};

const BCRYPT_COST: u32 = if cfg!(test) { 4 } else { bcrypt::DEFAULT_COST };
const MIN_PASSWORD_LEN: usize = 6;
const USERNAME_PATTERN: &str = r"^[A-Za-z0-9_]{3,32}$";

pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/signUp").route(web::post().to(sign_up)))
        .service(web::resource("/signIn").route(web::post().to(sign_in)))
        .service(web::resource("/signOut").route(web::post().to(sign_out)))
        .service(web::resource("/current").route(web::post().to(current)))
        .service(web::resource("/pickUsername").route(web::post().to(pick_username)))
        .service(web::resource("/changePassword").route(web::post().to(change_password)))
        .service(web::resource("/deactivate").route(web::post().to(deactivate)))
        .service(web::resource("/settings").route(web::post().to(settings)))
        .service(
            web::resource("/profile")
                .route(web::get().to(get_profile))
                .route(web::post().to(edit_profile)),
        );
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignUpRequest {
    name: Option<String>,
    email: Option<String>,
    password: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignInRequest {
    login: Option<String>,
    password: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsernameRequest {
    username: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChangePasswordRequest {
    current_password: Option<String>,
    new_password: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PasswordRequest {
    password: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EditProfileRequest {
    name: Option<String>,
    bio: Option<String>,
    facebook_username: Option<String>,
    is_facebook_visible: Option<bool>,
    twitter_username: Option<String>,
    is_twitter_visible: Option<bool>,
    website: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SignInResponse {
    token: String,
    user_id: i32,
    username: Option<String>,
    status: UserStatus,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CurrentUserDto {
    id: i32,
    username: Option<String>,
    status: UserStatus,
    primary_email: Option<String>,
    created: Option<String>,
    profile: Option<ProfileDto>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileDto {
    pub name: String,
    pub bio: Option<String>,
    pub facebook_username: Option<String>,
    pub is_facebook_visible: bool,
    pub twitter_username: Option<String>,
    pub is_twitter_visible: bool,
    pub website: Option<String>,
}

/// Inserts user, profile, primary email and self-follow as one unit.
pub async fn create_account(
    db: &DatabaseConnection,
    name: &str,
    address: &str,
    password_hash: String,
) -> Result<(user::Model, email::Model), AppError> {
    if !is_email(address) {
        return Err(EmailError::Validation(address.to_string()).into());
    }
    if find_active_by_address(db, address).await?.is_some() {
        return Err(EmailError::AlreadyRegistered(address.to_string()).into());
    }

    let name = name.to_string();
    let address = address.to_string();
    let result = db
        .transaction::<_, (user::Model, email::Model), AppError>(|txn| {
            Box::pin(async move {
                let now = Utc::now();
                let created = user::ActiveModel {
                    username: Set(None),
                    password_hash: Set(password_hash),
                    status: Set(UserStatus::New),
                    created: Set(Some(now)),
                    updated: Set(Some(now)),
                    last_acted: Set(None),
                    ..Default::default()
                }
                .insert(txn)
                .await?;

                user_profile::ActiveModel {
                    user_id: Set(created.id),
                    name: Set(name),
                    bio: Set(None),
                    facebook_username: Set(None),
                    is_facebook_visible: Set(false),
                    twitter_username: Set(None),
                    is_twitter_visible: Set(false),
                    website: Set(None),
                    updated: Set(Some(now)),
                }
                .insert(txn)
                .await?;

                let primary = new_email(created.id, &address, true).insert(txn).await.map_err(|e| {
                    if is_unique_violation(&e) {
                        EmailError::AlreadyRegistered(address.clone()).into()
                    } else {
                        AppError::from(e)
                    }
                })?;

                follow::ActiveModel {
                    follower_id: Set(created.id),
                    followed_id: Set(created.id),
                    status: Set(FollowStatus::Active),
                    created: Set(Some(now)),
                    updated: Set(Some(now)),
                    ..Default::default()
                }
                .insert(txn)
                .await?;

                Ok((created, primary))
            })
        })
        .await
        .map_err(map_tx_error)?;

    info!("user {} signed up with {}", result.0.id, result.1.address);
    Ok(result)
}

async fn sign_up(
    db: web::Data<DatabaseConnection>,
    notifier: web::Data<Notifier>,
    auth: OptionalAuthUser,
    payload: web::Json<SignUpRequest>,
) -> Result<HttpResponse, AppError> {
    if auth.0.is_some() {
        return Err(AppError::fail("You are already registered."));
    }
    let name = payload.name.clone().unwrap_or_default();
    let address = payload.email.clone().unwrap_or_default();
    let password = payload.password.clone().unwrap_or_default();
    if name.trim().is_empty() {
        return Err(AppError::param_error("name cannot be empty"));
    }
    check_password(&password)?;

    let password_hash = hash(password, BCRYPT_COST).map_err(|_| AppError::system_exception())?;
    let (created, primary) = create_account(db.get_ref(), name.trim(), address.trim(), password_hash).await?;
    notifier.send_verification_email(&primary).await;

    Ok(ok_msg(
        Some(created.id),
        "You have successfully signed up for ThanksPress.",
    ))
}

async fn sign_in(
    db: web::Data<DatabaseConnection>,
    config: web::Data<AppConfig>,
    payload: web::Json<SignInRequest>,
) -> Result<HttpResponse, AppError> {
    let login = payload.login.clone().unwrap_or_default();
    let password = payload.password.clone().unwrap_or_default();
    if login.trim().is_empty() {
        return Err(AppError::param_error("login cannot be empty"));
    }
    if password.is_empty() {
        return Err(AppError::param_error("password cannot be empty"));
    }

    let found = find_by_login(db.get_ref(), login.trim())
        .await?
        .filter(|u| u.status != UserStatus::Deleted)
        .ok_or_else(|| AppError::fail("Invalid login or password."))?;

    let matches = verify(password, &found.password_hash).unwrap_or(false);
    if !matches {
        return Err(AppError::fail("Invalid login or password."));
    }

    let token = issue_token(&config, found.id)?;
    info!("user {} signed in", found.id);
    Ok(ok(Some(SignInResponse {
        token,
        user_id: found.id,
        username: found.username,
        status: found.status,
    })))
}

async fn find_by_login(db: &DatabaseConnection, login: &str) -> Result<Option<user::Model>, AppError> {
    if is_email(login) {
        if let Some(owned) = find_active_by_address(db, login).await? {
            return Ok(user::Entity::find_by_id(owned.user_id).one(db).await?);
        }
    }
    Ok(user::Entity::find()
        .filter(user::Column::Username.eq(login))
        .one(db)
        .await?)
}

async fn sign_out(_auth: AuthUser) -> Result<HttpResponse, AppError> {
    Ok(ok::<()>(None))
}

async fn current(db: web::Data<DatabaseConnection>, auth: AuthUser) -> Result<HttpResponse, AppError> {
    let found = load_user(db.get_ref(), auth.user_id).await?;
    let primary = find_primary(db.get_ref(), auth.user_id).await?;
    let profile = user_profile::Entity::find_by_id(auth.user_id).one(db.get_ref()).await?;

    Ok(ok(Some(CurrentUserDto {
        id: found.id,
        username: found.username,
        status: found.status,
        primary_email: primary.map(|e| e.address),
        created: found.created.map(|d| d.to_rfc3339_opts(SecondsFormat::Millis, false)),
        profile: profile.map(to_profile_dto),
    })))
}

async fn pick_username(
    db: web::Data<DatabaseConnection>,
    auth: AuthUser,
    payload: web::Json<UsernameRequest>,
) -> Result<HttpResponse, AppError> {
    if auth.status != UserStatus::New {
        return Err(AppError::fail("You have already picked a username."));
    }
    let username = check_username(payload.username.as_deref())?;
    save_username(db.get_ref(), auth.user_id, &username, Some(UserStatus::Activated)).await?;
    info!("user {} activated as {}", auth.user_id, username);
    Ok(ok_msg(Some(username), "Welcome to ThanksPress!"))
}

async fn settings(
    db: web::Data<DatabaseConnection>,
    auth: ActiveUser,
    payload: web::Json<UsernameRequest>,
) -> Result<HttpResponse, AppError> {
    let username = check_username(payload.username.as_deref())?;
    save_username(db.get_ref(), auth.user_id(), &username, None).await?;
    Ok(ok_msg(Some(username), "Changes have been saved."))
}

async fn change_password(
    db: web::Data<DatabaseConnection>,
    auth: ActiveUser,
    payload: web::Json<ChangePasswordRequest>,
) -> Result<HttpResponse, AppError> {
    let found = load_user(db.get_ref(), auth.user_id()).await?;
    check_current_password(payload.current_password.as_deref(), &found)?;
    let new_password = payload.new_password.clone().unwrap_or_default();
    check_password(&new_password)?;

    let password_hash = hash(new_password, BCRYPT_COST).map_err(|_| AppError::system_exception())?;
    user::ActiveModel {
        id: Set(found.id),
        password_hash: Set(password_hash),
        updated: Set(Some(Utc::now())),
        ..Default::default()
    }
    .update(db.get_ref())
    .await?;

    Ok(ok_msg::<()>(None, "You have successfully changed your password."))
}

async fn deactivate(
    db: web::Data<DatabaseConnection>,
    auth: ActiveUser,
    payload: web::Json<PasswordRequest>,
) -> Result<HttpResponse, AppError> {
    let found = load_user(db.get_ref(), auth.user_id()).await?;
    check_current_password(payload.password.as_deref(), &found)?;

    user::ActiveModel {
        id: Set(found.id),
        status: Set(UserStatus::Deactivated),
        updated: Set(Some(Utc::now())),
        ..Default::default()
    }
    .update(db.get_ref())
    .await?;
    info!("user {} deactivated", found.id);

    Ok(ok_msg::<()>(None, "Your account has been deactivated."))
}

async fn get_profile(db: web::Data<DatabaseConnection>, auth: ActiveUser) -> Result<HttpResponse, AppError> {
    let profile = user_profile::Entity::find_by_id(auth.user_id())
        .one(db.get_ref())
        .await?
        .ok_or_else(|| AppError::fail("profile not found"))?;
    Ok(ok(Some(to_profile_dto(profile))))
}

async fn edit_profile(
    db: web::Data<DatabaseConnection>,
    auth: ActiveUser,
    payload: web::Json<EditProfileRequest>,
) -> Result<HttpResponse, AppError> {
    let mut active = user_profile::ActiveModel {
        user_id: Set(auth.user_id()),
        updated: Set(Some(Utc::now())),
        ..Default::default()
    };

    if let Some(v) = payload.name.clone() {
        if v.trim().is_empty() {
            return Err(AppError::param_error("name cannot be empty"));
        }
        active.name = Set(v.trim().to_string());
    }
    if let Some(v) = payload.bio.clone() {
        active.bio = Set(non_empty(v));
    }
    if let Some(v) = payload.facebook_username.clone() {
        active.facebook_username = Set(non_empty(v));
    }
    if let Some(v) = payload.is_facebook_visible {
        active.is_facebook_visible = Set(v);
    }
    if let Some(v) = payload.twitter_username.clone() {
        active.twitter_username = Set(non_empty(v));
    }
    if let Some(v) = payload.is_twitter_visible {
        active.is_twitter_visible = Set(v);
    }
    if let Some(v) = payload.website.clone() {
        active.website = Set(non_empty(v));
    }

    let saved = active.update(db.get_ref()).await?;
    Ok(ok_msg(Some(to_profile_dto(saved)), "Changes have been saved."))
}

pub fn to_profile_dto(model: user_profile::Model) -> ProfileDto {
    ProfileDto {
        name: model.name,
        bio: model.bio,
        facebook_username: model.facebook_username,
        is_facebook_visible: model.is_facebook_visible,
        twitter_username: model.twitter_username,
        is_twitter_visible: model.is_twitter_visible,
        website: model.website,
    }
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn check_password(password: &str) -> Result<(), AppError> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(AppError::param_error(format!(
            "password must be at least {} characters",
            MIN_PASSWORD_LEN
        )));
    }
    Ok(())
}

fn check_current_password(supplied: Option<&str>, found: &user::Model) -> Result<(), AppError> {
    let supplied = supplied.unwrap_or_default();
    if supplied.is_empty() || !verify(supplied, &found.password_hash).unwrap_or(false) {
        return Err(AppError::fail("Password is not correct."));
    }
    Ok(())
}

fn check_username(username: Option<&str>) -> Result<String, AppError> {
    let username = username.unwrap_or_default().trim();
    let re = Regex::new(USERNAME_PATTERN).map_err(|_| AppError::system_exception())?;
    if !re.is_match(username) {
        return Err(AppError::param_error(
            "username must be 3 to 32 letters, digits or underscores",
        ));
    }
    Ok(username.to_string())
}

async fn save_username(
    db: &DatabaseConnection,
    user_id: i32,
    username: &str,
    status: Option<UserStatus>,
) -> Result<(), AppError> {
    let taken = user::Entity::find()
        .filter(user::Column::Username.eq(username))
        .filter(user::Column::Id.ne(user_id))
        .one(db)
        .await?
        .is_some();
    if taken {
        return Err(AppError::fail(format!("{} is already taken.", username)));
    }

    let mut active = user::ActiveModel {
        id: Set(user_id),
        username: Set(Some(username.to_string())),
        updated: Set(Some(Utc::now())),
        ..Default::default()
    };
    if let Some(status) = status {
        active.status = Set(status);
    }
    if let Err(e) = active.update(db).await {
        if is_unique_violation(&e) {
            return Err(AppError::fail(format!("{} is already taken.", username)));
        }
        return Err(e.into());
    }
    Ok(())
}

async fn load_user(db: &DatabaseConnection, user_id: i32) -> Result<user::Model, AppError> {
    user::Entity::find_by_id(user_id)
        .one(db)
        .await?
        .ok_or_else(AppError::need_login)
}
