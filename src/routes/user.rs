use actix_web::{web, HttpResponse};
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter, QueryOrder};
use serde::Serialize;

use crate::auth::OptionalAuthUser;
use crate::entity::follow::{self, FollowStatus};
use crate::entity::user::{self, UserStatus};
use crate::entity::user_profile;
use crate::error::AppError;
use crate::response::ok;
use crate::routes::relation::is_following;

pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/{username}").route(web::get().to(user_page)))
        .service(web::resource("/{username}/followers").route(web::get().to(followers)))
        .service(web::resource("/{username}/following").route(web::get().to(following)));
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UserPageDto {
    id: i32,
    username: String,
    name: Option<String>,
    bio: Option<String>,
    website: Option<String>,
    facebook_username: Option<String>,
    twitter_username: Option<String>,
    followers: u64,
    following: u64,
    is_following: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UserSummaryDto {
    id: i32,
    username: String,
}

#[derive(Clone, Copy)]
enum Direction {
    Followers,
    Following,
}

async fn user_page(
    db: web::Data<DatabaseConnection>,
    auth: OptionalAuthUser,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let found = load_active(db.get_ref(), &path).await?;
    let profile = user_profile::Entity::find_by_id(found.id).one(db.get_ref()).await?;

    let followers = count_edges(db.get_ref(), found.id, Direction::Followers).await?;
    let following = count_edges(db.get_ref(), found.id, Direction::Following).await?;
    let is_following = match auth.0 {
        Some(viewer) if viewer.user_id != found.id => is_following(db.get_ref(), viewer.user_id, found.id).await?,
        _ => false,
    };

    let mut dto = UserPageDto {
        id: found.id,
        username: found.username.clone().unwrap_or_default(),
        name: None,
        bio: None,
        website: None,
        facebook_username: None,
        twitter_username: None,
        followers,
        following,
        is_following,
    };
    if let Some(profile) = profile {
        dto.name = Some(profile.name);
        dto.bio = profile.bio;
        dto.website = profile.website;
        if profile.is_facebook_visible {
            dto.facebook_username = profile.facebook_username;
        }
        if profile.is_twitter_visible {
            dto.twitter_username = profile.twitter_username;
        }
    }

    Ok(ok(Some(dto)))
}

async fn followers(db: web::Data<DatabaseConnection>, path: web::Path<String>) -> Result<HttpResponse, AppError> {
    list_edges(db.get_ref(), &path, Direction::Followers).await
}

async fn following(db: web::Data<DatabaseConnection>, path: web::Path<String>) -> Result<HttpResponse, AppError> {
    list_edges(db.get_ref(), &path, Direction::Following).await
}

async fn list_edges(db: &DatabaseConnection, username: &str, direction: Direction) -> Result<HttpResponse, AppError> {
    let found = load_active(db, username).await?;
    let edges = edge_query(found.id, direction)
        .order_by_desc(follow::Column::Created)
        .all(db)
        .await?;
    let ids: Vec<i32> = edges
        .iter()
        .map(|e| match direction {
            Direction::Followers => e.follower_id,
            Direction::Following => e.followed_id,
        })
        .collect();

    let users = user::Entity::find()
        .filter(user::Column::Id.is_in(ids.clone()))
        .filter(user::Column::Status.eq(UserStatus::Activated))
        .all(db)
        .await?;
    // keep edge order, most recent first
    let list: Vec<UserSummaryDto> = ids
        .iter()
        .filter_map(|id| users.iter().find(|u| u.id == *id))
        .filter_map(|u| {
            u.username.clone().map(|username| UserSummaryDto { id: u.id, username })
        })
        .collect();

    Ok(ok(Some(list)))
}

fn edge_query(user_id: i32, direction: Direction) -> sea_orm::Select<follow::Entity> {
    let (own, other) = match direction {
        Direction::Followers => (follow::Column::FollowedId, follow::Column::FollowerId),
        Direction::Following => (follow::Column::FollowerId, follow::Column::FollowedId),
    };
    follow::Entity::find()
        .filter(own.eq(user_id))
        .filter(other.ne(user_id))
        .filter(follow::Column::Status.eq(FollowStatus::Active))
}

async fn count_edges(db: &DatabaseConnection, user_id: i32, direction: Direction) -> Result<u64, AppError> {
    Ok(edge_query(user_id, direction).count(db).await?)
}

async fn load_active(db: &DatabaseConnection, username: &str) -> Result<user::Model, AppError> {
    user::Entity::find()
        .filter(user::Column::Username.eq(username))
        .filter(user::Column::Status.eq(UserStatus::Activated))
        .one(db)
        .await?
        .ok_or_else(|| AppError::fail("user not found"))
}
