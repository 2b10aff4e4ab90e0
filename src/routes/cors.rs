use actix_web::{
    body::{EitherBody, MessageBody},
    dev::{ServiceRequest, ServiceResponse},
    http::header::{HeaderName, HeaderValue},
    http::Method,
    middleware::Next,
    web, Error, HttpResponse,
};

use crate::config::AppConfig;

pub async fn cors_handler<B>(
    req: ServiceRequest,
    next: Next<B>,
) -> Result<ServiceResponse<EitherBody<B>>, Error>
where
    B: MessageBody,
{
    let (origin, token_header) = match req.app_data::<web::Data<AppConfig>>() {
        Some(config) => (config.cors_origin.clone(), config.token_header.clone()),
        None => ("*".to_string(), "token".to_string()),
    };

    let mut res = if req.method() == Method::OPTIONS {
        let res = HttpResponse::Ok().finish().map_into_right_body();
        req.into_response(res)
    } else {
        next.call(req).await?.map_into_left_body()
    };

    let headers = res.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&origin) {
        headers.insert(HeaderName::from_static("access-control-allow-origin"), value);
    }
    headers.insert(
        HeaderName::from_static("access-control-allow-methods"),
        HeaderValue::from_static("POST, GET, OPTIONS"),
    );
    headers.insert(
        HeaderName::from_static("access-control-max-age"),
        HeaderValue::from_static("86400"),
    );
    let allow_headers = format!("Origin, X-Requested-With, Content-Type, Accept, {}", token_header);
    if let Ok(value) = HeaderValue::from_str(&allow_headers) {
        headers.insert(HeaderName::from_static("access-control-allow-headers"), value);
    }
    headers.insert(
        HeaderName::from_static("cache-control"),
        HeaderValue::from_static("no-store"),
    );

    Ok(res)
}
