use actix_web::{web, HttpResponse};
use chrono::Utc;
use log::info;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter, Set,
};
use serde::Serialize;

use crate::auth::ActiveUser;
use crate::email_identity::find_primary;
use crate::entity::follow::{self, FollowStatus};
use crate::entity::user::{self, UserStatus};
use crate::error::AppError;
use crate::notify::Notifier;
use crate::response::ok_msg;

pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/follow/{id:\\d+}").route(web::post().to(follow_user)))
        .service(web::resource("/unfollow/{id:\\d+}").route(web::post().to(unfollow_user)));
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RelationDto {
    followed_id: i32,
    following: bool,
}

pub async fn find_edge<C: ConnectionTrait>(
    db: &C,
    follower_id: i32,
    followed_id: i32,
) -> Result<Option<follow::Model>, DbErr> {
    follow::Entity::find()
        .filter(follow::Column::FollowerId.eq(follower_id))
        .filter(follow::Column::FollowedId.eq(followed_id))
        .one(db)
        .await
}

pub async fn is_following<C: ConnectionTrait>(db: &C, follower_id: i32, followed_id: i32) -> Result<bool, DbErr> {
    Ok(find_edge(db, follower_id, followed_id)
        .await?
        .map(|edge| edge.status == FollowStatus::Active)
        .unwrap_or(false))
}

async fn load_target(db: &DatabaseConnection, user_id: i32) -> Result<user::Model, AppError> {
    user::Entity::find_by_id(user_id)
        .one(db)
        .await?
        .filter(|u| u.status != UserStatus::Deleted)
        .ok_or_else(|| AppError::fail("user not found"))
}

async fn follow_user(
    db: web::Data<DatabaseConnection>,
    notifier: web::Data<Notifier>,
    auth: ActiveUser,
    path: web::Path<i32>,
) -> Result<HttpResponse, AppError> {
    let target = load_target(db.get_ref(), *path).await?;
    let follower_id = auth.user_id();
    let now = Utc::now();

    let created = match find_edge(db.get_ref(), follower_id, target.id).await? {
        Some(edge) if edge.status == FollowStatus::Active => false,
        Some(edge) => {
            follow::ActiveModel {
                id: Set(edge.id),
                status: Set(FollowStatus::Active),
                updated: Set(Some(now)),
                ..Default::default()
            }
            .update(db.get_ref())
            .await?;
            true
        }
        None => {
            follow::ActiveModel {
                follower_id: Set(follower_id),
                followed_id: Set(target.id),
                status: Set(FollowStatus::Active),
                created: Set(Some(now)),
                updated: Set(Some(now)),
                ..Default::default()
            }
            .insert(db.get_ref())
            .await?;
            true
        }
    };

    if created {
        info!("user {} follows user {}", follower_id, target.id);
        if let Some(follower) = user::Entity::find_by_id(follower_id).one(db.get_ref()).await? {
            if let Some(primary) = find_primary(db.get_ref(), target.id).await? {
                notifier
                    .send_follower_notification(&follower, &target, &primary.address)
                    .await;
            }
        }
    }

    let msg = format!("You are following {}.", target.display_name());
    Ok(ok_msg(
        Some(RelationDto {
            followed_id: target.id,
            following: true,
        }),
        msg,
    ))
}

async fn unfollow_user(
    db: web::Data<DatabaseConnection>,
    auth: ActiveUser,
    path: web::Path<i32>,
) -> Result<HttpResponse, AppError> {
    let target = load_target(db.get_ref(), *path).await?;
    let follower_id = auth.user_id();
    if target.id == follower_id {
        return Err(AppError::fail("You cannot unfollow yourself."));
    }

    if let Some(edge) = find_edge(db.get_ref(), follower_id, target.id).await? {
        if edge.status == FollowStatus::Active {
            follow::ActiveModel {
                id: Set(edge.id),
                status: Set(FollowStatus::Deleted),
                updated: Set(Some(Utc::now())),
                ..Default::default()
            }
            .update(db.get_ref())
            .await?;
            info!("user {} unfollowed user {}", follower_id, target.id);
        }
    }

    let msg = format!("You are no longer following {}.", target.display_name());
    Ok(ok_msg(
        Some(RelationDto {
            followed_id: target.id,
            following: false,
        }),
        msg,
    ))
}
