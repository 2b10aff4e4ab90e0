pub mod account;
pub mod cors;
pub mod email;
pub mod relation;
pub mod user;

use actix_web::web;

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api")
            .service(web::scope("/account").configure(account::config))
            .service(web::scope("/email").configure(email::config))
            .service(web::scope("/relation").configure(relation::config))
            .service(web::scope("/user").configure(user::config)),
    );
}
