use std::sync::{Arc, Mutex};

use actix_web::test::TestRequest;
use actix_web::web;
use async_trait::async_trait;
use sea_orm::{ActiveModelTrait, DatabaseConnection, Set};

use crate::auth::issue_token;
use crate::config::AppConfig;
use crate::db::connect_db;
use crate::entity::user::{self, UserStatus};
use crate::notify::{EmailSender, Notifier};
use crate::routes::account::create_account;

#[derive(Clone, Debug)]
pub struct SentMail {
    pub to: String,
    pub subject: String,
    pub body: String,
}

#[derive(Default)]
pub struct RecordingSender {
    sent: Mutex<Vec<SentMail>>,
    fail: bool,
}

impl RecordingSender {
    pub fn failing() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn sent(&self) -> Vec<SentMail> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl EmailSender for RecordingSender {
    async fn send_email(&self, to: &str, subject: &str, body: &str) -> Result<(), String> {
        self.sent.lock().unwrap().push(SentMail {
            to: to.to_string(),
            subject: subject.to_string(),
            body: body.to_string(),
        });
        if self.fail {
            return Err("relay refused".to_string());
        }
        Ok(())
    }
}

pub async fn setup_db() -> DatabaseConnection {
    connect_db(&AppConfig::for_tests()).await.unwrap()
}

pub fn recording_notifier() -> (Notifier, Arc<RecordingSender>) {
    let sender = Arc::new(RecordingSender::default());
    let notifier = Notifier::new(sender.clone(), AppConfig::for_tests().site_url);
    (notifier, sender)
}

/// Creates a fresh account the way sign-up does, skipping password hashing.
pub async fn sign_up_user(db: &DatabaseConnection, address: &str) -> user::Model {
    let name = address.split('@').next().unwrap_or("someone");
    let (user, _) = create_account(db, name, address, "not-a-real-hash".to_string())
        .await
        .unwrap();
    user
}

pub struct TestState {
    pub db: web::Data<DatabaseConnection>,
    pub config: web::Data<AppConfig>,
    pub notifier: web::Data<Notifier>,
    pub sender: Arc<RecordingSender>,
}

pub async fn test_state() -> TestState {
    let (notifier, sender) = recording_notifier();
    TestState {
        db: web::Data::new(setup_db().await),
        config: web::Data::new(AppConfig::for_tests()),
        notifier: web::Data::new(notifier),
        sender,
    }
}

pub fn post(uri: &str, token: Option<&str>, body: serde_json::Value) -> TestRequest {
    let req = TestRequest::post().uri(uri).set_json(body);
    with_token(req, token)
}

pub fn get(uri: &str, token: Option<&str>) -> TestRequest {
    with_token(TestRequest::get().uri(uri), token)
}

fn with_token(req: TestRequest, token: Option<&str>) -> TestRequest {
    match token {
        Some(token) => req.insert_header(("token", token.to_string())),
        None => req,
    }
}

macro_rules! test_app {
    ($state:expr) => {
        actix_web::test::init_service(
            actix_web::App::new()
                .app_data($state.db.clone())
                .app_data($state.config.clone())
                .app_data($state.notifier.clone())
                .app_data(actix_web::web::JsonConfig::default().error_handler(crate::response::json_error_handler))
                .configure(crate::routes::configure),
        )
    };
}

pub(crate) use test_app;

/// A signed-up user that already picked `username`, with a valid token.
pub async fn activated_user(db: &DatabaseConnection, address: &str, username: &str) -> (user::Model, String) {
    let created = sign_up_user(db, address).await;
    let activated = user::ActiveModel {
        id: Set(created.id),
        username: Set(Some(username.to_string())),
        status: Set(UserStatus::Activated),
        ..Default::default()
    }
    .update(db)
    .await
    .unwrap();
    let token = issue_token(&AppConfig::for_tests(), activated.id).unwrap();
    (activated, token)
}
