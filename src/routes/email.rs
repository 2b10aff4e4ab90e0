use actix_web::{web, HttpResponse};
use chrono::SecondsFormat;
use sea_orm::DatabaseConnection;
use serde::{Deserialize, Serialize};

use crate::auth::ActiveUser;
use crate::email_identity::{self, EmailOutcome};
use crate::entity::email::{self, EmailStatus};
use crate::error::AppError;
use crate::notify::Notifier;
use crate::response::{ok, ok_msg};

pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/list").route(web::post().to(list)))
        .service(web::resource("/add").route(web::post().to(add)))
        .service(web::resource("/delete").route(web::post().to(delete)))
        .service(web::resource("/makePrimary").route(web::post().to(make_primary)))
        .service(web::resource("/requestKey").route(web::post().to(request_key)))
        .service(web::resource("/verify/{address}").route(web::get().to(verify)));
}

#[derive(Deserialize)]
struct EmailRequest {
    email: Option<String>,
}

#[derive(Deserialize)]
struct VerifyQuery {
    key: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EmailDto {
    id: i32,
    email: String,
    status: EmailStatus,
    is_primary: bool,
    created: Option<String>,
}

async fn list(db: web::Data<DatabaseConnection>, auth: ActiveUser) -> Result<HttpResponse, AppError> {
    let emails = email_identity::list_emails(db.get_ref(), auth.user_id()).await?;
    let dto: Vec<EmailDto> = emails.into_iter().map(to_dto).collect();
    Ok(ok(Some(dto)))
}

async fn add(
    db: web::Data<DatabaseConnection>,
    notifier: web::Data<Notifier>,
    auth: ActiveUser,
    payload: web::Json<EmailRequest>,
) -> Result<HttpResponse, AppError> {
    let address = required_address(&payload)?;
    let outcome = email_identity::add_email(db.get_ref(), &notifier, auth.user_id(), &address).await?;
    Ok(outcome_response(outcome))
}

async fn delete(
    db: web::Data<DatabaseConnection>,
    auth: ActiveUser,
    payload: web::Json<EmailRequest>,
) -> Result<HttpResponse, AppError> {
    let address = required_address(&payload)?;
    let outcome = email_identity::delete_email(db.get_ref(), auth.user_id(), &address).await?;
    Ok(outcome_response(outcome))
}

async fn make_primary(
    db: web::Data<DatabaseConnection>,
    auth: ActiveUser,
    payload: web::Json<EmailRequest>,
) -> Result<HttpResponse, AppError> {
    let address = required_address(&payload)?;
    let outcome = email_identity::make_primary(db.get_ref(), auth.user_id(), &address).await?;
    Ok(outcome_response(outcome))
}

async fn request_key(
    db: web::Data<DatabaseConnection>,
    notifier: web::Data<Notifier>,
    auth: ActiveUser,
    payload: web::Json<EmailRequest>,
) -> Result<HttpResponse, AppError> {
    let address = payload.email.clone().unwrap_or_default();
    let outcome =
        email_identity::request_verification_key(db.get_ref(), &notifier, auth.user_id(), &address).await?;
    Ok(outcome_response(outcome))
}

async fn verify(
    db: web::Data<DatabaseConnection>,
    auth: ActiveUser,
    path: web::Path<String>,
    query: web::Query<VerifyQuery>,
) -> Result<HttpResponse, AppError> {
    let outcome = email_identity::verify_email(
        db.get_ref(),
        auth.user_id(),
        &path.into_inner(),
        query.key.as_deref(),
    )
    .await?;
    Ok(outcome_response(outcome))
}

fn required_address(payload: &EmailRequest) -> Result<String, AppError> {
    payload
        .email
        .clone()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AppError::param_error("email cannot be empty"))
}

fn outcome_response(outcome: EmailOutcome) -> HttpResponse {
    let msg = outcome.message();
    let dto = outcome.email().cloned().map(to_dto);
    ok_msg(dto, msg)
}

fn to_dto(model: email::Model) -> EmailDto {
    EmailDto {
        id: model.id,
        email: model.address,
        status: model.status,
        is_primary: model.is_primary,
        created: model.created.map(|d| d.to_rfc3339_opts(SecondsFormat::Millis, false)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{activated_user, get, post, test_app, test_state};
    use actix_web::test;
    use serde_json::{json, Value};

    #[actix_web::test]
    async fn manage_emails_end_to_end() {
        let state = test_state().await;
        let app = test_app!(state).await;
        let (_, token) = activated_user(state.db.get_ref(), "signup@x.io", "alice").await;

        let body: Value = test::call_and_read_body_json(
            &app,
            post("/api/email/add", Some(&token), json!({"email": "a@b.co"})).to_request(),
        )
        .await;
        assert_eq!(body["code"], 0, "{}", body);
        assert_eq!(body["msg"], "a@b.co has been successfully added.");
        assert_eq!(body["data"]["status"], "NOT_VERIFIED");
        assert_eq!(body["data"]["isPrimary"], false);

        let body: Value = test::call_and_read_body_json(
            &app,
            post("/api/email/makePrimary", Some(&token), json!({"email": "a@b.co"})).to_request(),
        )
        .await;
        assert_eq!(body["code"], 2);
        assert_eq!(body["msg"], "a@b.co is not a verified email. Please verify to make primary.");

        let body: Value = test::call_and_read_body_json(
            &app,
            get("/api/email/verify/a@b.co?key=short", Some(&token)).to_request(),
        )
        .await;
        assert_eq!(body["code"], 1);

        let stored = email_identity::find_active_by_address(state.db.get_ref(), "a@b.co")
            .await
            .unwrap()
            .unwrap();
        let uri = format!("/api/email/verify/a@b.co?key={}", stored.verification_key);
        let body: Value = test::call_and_read_body_json(&app, get(&uri, Some(&token)).to_request()).await;
        assert_eq!(body["msg"], "a@b.co has been successfully verified.");
        assert_eq!(body["data"]["status"], "VERIFIED");

        let body: Value = test::call_and_read_body_json(
            &app,
            post("/api/email/makePrimary", Some(&token), json!({"email": "a@b.co"})).to_request(),
        )
        .await;
        assert_eq!(body["code"], 0, "{}", body);
        assert_eq!(body["data"]["isPrimary"], true);

        let body: Value = test::call_and_read_body_json(
            &app,
            post("/api/email/list", Some(&token), json!({})).to_request(),
        )
        .await;
        let list = body["data"].as_array().unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0]["email"], "a@b.co");
        assert_eq!(list[0]["isPrimary"], true);
        assert_eq!(list[1]["isPrimary"], false);

        let body: Value = test::call_and_read_body_json(
            &app,
            post("/api/email/delete", Some(&token), json!({"email": "a@b.co"})).to_request(),
        )
        .await;
        assert_eq!(body["msg"], "a@b.co is your primary email. It cannot be deleted.");
    }

    #[actix_web::test]
    async fn key_request_for_unknown_address_is_silent() {
        let state = test_state().await;
        let app = test_app!(state).await;
        let (_, token) = activated_user(state.db.get_ref(), "signup@x.io", "alice").await;

        let body: Value = test::call_and_read_body_json(
            &app,
            post("/api/email/requestKey", Some(&token), json!({"email": "ghost@x.io"})).to_request(),
        )
        .await;
        assert_eq!(body["code"], 0);
        assert_eq!(body["msg"], "");
        assert!(body["data"].is_null());
        assert!(state.sender.sent().is_empty());

        let body: Value = test::call_and_read_body_json(
            &app,
            post("/api/email/requestKey", Some(&token), json!({"email": "signup@x.io"})).to_request(),
        )
        .await;
        assert_eq!(body["code"], 0);
        assert_eq!(state.sender.sent().len(), 1);
    }

    #[actix_web::test]
    async fn email_routes_need_login() {
        let state = test_state().await;
        let app = test_app!(state).await;

        let body: Value = test::call_and_read_body_json(
            &app,
            post("/api/email/add", None, json!({"email": "a@b.co"})).to_request(),
        )
        .await;
        assert_eq!(body["code"], 3);
    }

    #[actix_web::test]
    async fn malformed_body_is_a_parameter_error() {
        let state = test_state().await;
        let app = test_app!(state).await;
        let (_, token) = activated_user(state.db.get_ref(), "signup@x.io", "alice").await;

        let req = test::TestRequest::post()
            .uri("/api/email/add")
            .insert_header(("token", token))
            .insert_header(("content-type", "application/json"))
            .set_payload("{not json")
            .to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["code"], 1);
    }
}
