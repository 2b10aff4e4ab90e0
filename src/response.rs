use actix_web::{error::JsonPayloadError, HttpRequest, HttpResponse};
use serde::Serialize;

use crate::error::AppError;

#[derive(Serialize)]
pub struct ResponseDto<T: Serialize> {
    pub data: Option<T>,
    pub code: i32,
    pub msg: String,
}

impl<T: Serialize> ResponseDto<T> {
    pub fn success(data: Option<T>) -> Self {
        Self {
            data,
            code: 0,
            msg: "".to_string(),
        }
    }

    pub fn success_with_msg(data: Option<T>, msg: impl Into<String>) -> Self {
        Self {
            data,
            code: 0,
            msg: msg.into(),
        }
    }
}

pub fn ok<T: Serialize>(data: Option<T>) -> HttpResponse {
    HttpResponse::Ok().json(ResponseDto::success(data))
}

pub fn ok_msg<T: Serialize>(data: Option<T>, msg: impl Into<String>) -> HttpResponse {
    HttpResponse::Ok().json(ResponseDto::success_with_msg(data, msg))
}

pub fn json_error_handler(err: JsonPayloadError, _req: &HttpRequest) -> actix_web::Error {
    let app_err = match err {
        JsonPayloadError::ContentType => AppError::param_error("content type must be application/json"),
        JsonPayloadError::Deserialize(e) => AppError::param_error(format!("invalid request body: {}", e)),
        _ => AppError::param_error("invalid request body"),
    };
    app_err.into()
}

pub fn response_from_error(err: &AppError) -> HttpResponse {
    HttpResponse::Ok().json(ResponseDto::<()> {
        data: None,
        code: err.code(),
        msg: err.msg().to_string(),
    })
}
