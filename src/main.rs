mod auth;
mod config;
mod db;
mod email_identity;
mod entity;
mod error;
mod notify;
mod response;
mod routes;
#[cfg(test)]
mod test_support;

use std::io;

use actix_web::{middleware, web, App, HttpServer};
use config::AppConfig;
use db::connect_db;
use log::{error, info};
use notify::Notifier;
use response::json_error_handler;

#[actix_web::main]
async fn main() -> io::Result<()> {
    dotenvy::dotenv().ok();
    env_logger::init();
    let config = AppConfig::from_env();
    let db = connect_db(&config).await.map_err(|e| {
        error!("db connect failed: {}", e);
        io::Error::new(io::ErrorKind::Other, e.to_string())
    })?;
    let notifier = Notifier::from_config(&config).map_err(|e| {
        error!("mail setup failed: {}", e);
        io::Error::new(io::ErrorKind::InvalidInput, e)
    })?;
    let server_port = config.server_port;

    let config = web::Data::new(config);
    let db = web::Data::new(db);
    let notifier = web::Data::new(notifier);
    let server = HttpServer::new(move || {
        App::new()
            .app_data(config.clone())
            .app_data(db.clone())
            .app_data(notifier.clone())
            .app_data(web::JsonConfig::default().error_handler(json_error_handler))
            .wrap(middleware::Logger::default())
            .wrap(middleware::from_fn(routes::cors::cors_handler))
            .configure(routes::configure)
    })
    .bind(("0.0.0.0", server_port))?;
    info!("server started at http://0.0.0.0:{}", server_port);
    server.run().await
}
