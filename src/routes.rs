mod evaluate;

pub use evaluate::*;

use actix_web::error::{InternalError, JsonPayloadError};
use actix_web::{HttpRequest, HttpResponse};
use serde::Serialize;

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

pub fn json_error_handler(err: JsonPayloadError, _req: &HttpRequest) -> actix_web::Error {
    log::warn!("Rejected evaluation request: {err}");
    let response = match &err {
        JsonPayloadError::Overflow { limit }
        | JsonPayloadError::OverflowKnownLength { limit, .. } => {
            HttpResponse::PayloadTooLarge().json(ErrorResponse {
                error: format!("Request body exceeds the limit of {limit} bytes"),
            })
        }
        _ => HttpResponse::BadRequest().json(ErrorResponse {
            error: "Request must be JSON".to_string(),
        }),
    };
    InternalError::from_response(err, response).into()
}
