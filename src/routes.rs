mod leaderboard;
mod problems;
mod submissions;

pub use leaderboard::get_leaderboard_handler;
pub use problems::{get_problem_handler, put_problem_handler};
pub use submissions::*;

use actix_web::error::{InternalError, JsonPayloadError, PathError, QueryPayloadError};
use actix_web::http::header;
use actix_web::{HttpRequest, HttpResponse, Responder, get, web};
use serde::Serialize;

use crate::error::JudgeError;
use crate::scheduler::Scheduler;
use crate::submission::Viewer;

/// Role header set by the trusted backend in front of the judge
pub const VIEWER_ROLE_HEADER: &str = "X-Viewer-Role";

/// Seconds a client should wait before retrying after backpressure
const RETRY_AFTER_SECS: u32 = 2;

#[derive(Serialize)]
struct ErrorResponse {
    reason: &'static str,
    code: u32,
    message: String,
}

impl ErrorResponse {
    fn invalid_argument(message: String) -> Self {
        Self {
            reason: "ERR_INVALID_ARGUMENT",
            code: 1,
            message,
        }
    }
}

/// Registers every judge endpoint
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.app_data(web::JsonConfig::default().error_handler(json_error_handler))
        .app_data(web::QueryConfig::default().error_handler(query_error_handler))
        .app_data(web::PathConfig::default().error_handler(path_error_handler))
        .service(post_submission_handler)
        .service(get_submissions_handler)
        .service(get_submission_by_id_handler)
        .service(delete_submission_handler)
        .service(put_rejudge_handler)
        .service(put_problem_handler)
        .service(get_problem_handler)
        .service(get_leaderboard_handler)
        .service(healthz);
}

pub fn json_error_handler(err: JsonPayloadError, _req: &HttpRequest) -> actix_web::Error {
    let response =
        HttpResponse::BadRequest().json(ErrorResponse::invalid_argument(err.to_string()));
    InternalError::from_response(err, response).into()
}

pub fn query_error_handler(err: QueryPayloadError, _req: &HttpRequest) -> actix_web::Error {
    let response =
        HttpResponse::BadRequest().json(ErrorResponse::invalid_argument(err.to_string()));
    InternalError::from_response(err, response).into()
}

pub fn path_error_handler(err: PathError, _req: &HttpRequest) -> actix_web::Error {
    let response =
        HttpResponse::BadRequest().json(ErrorResponse::invalid_argument(err.to_string()));
    InternalError::from_response(err, response).into()
}

fn viewer(req: &HttpRequest) -> Viewer {
    Viewer::from_role(
        req.headers()
            .get(VIEWER_ROLE_HEADER)
            .and_then(|v| v.to_str().ok()),
    )
}

/// Maps a judge error to its HTTP status and JSON body
pub(crate) fn error_response(err: JudgeError) -> HttpResponse {
    let message = err.to_string();
    match err {
        JudgeError::Backpressure { .. } => HttpResponse::ServiceUnavailable()
            .insert_header((header::RETRY_AFTER, RETRY_AFTER_SECS.to_string()))
            .json(ErrorResponse {
                reason: "ERR_BACKPRESSURE",
                code: 4,
                message,
            }),
        JudgeError::Configuration(_) => HttpResponse::UnprocessableEntity().json(ErrorResponse {
            reason: "ERR_CONFIGURATION",
            code: 7,
            message,
        }),
        JudgeError::Cooldown { retry_after_ms } => HttpResponse::TooManyRequests()
            .insert_header((header::RETRY_AFTER, retry_after_ms.div_ceil(1000).max(1).to_string()))
            .json(ErrorResponse {
                reason: "ERR_RATE_LIMIT",
                code: 8,
                message,
            }),
        JudgeError::NotFound(_) => HttpResponse::NotFound().json(ErrorResponse {
            reason: "ERR_NOT_FOUND",
            code: 3,
            message,
        }),
        JudgeError::InvalidState { .. } => HttpResponse::BadRequest().json(ErrorResponse {
            reason: "ERR_INVALID_STATE",
            code: 2,
            message,
        }),
        JudgeError::Database(e) => {
            log::error!("Database error: {e}");
            HttpResponse::InternalServerError().json(ErrorResponse {
                reason: "ERR_EXTERNAL",
                code: 5,
                message,
            })
        }
        JudgeError::SandboxUnavailable(_) => {
            HttpResponse::InternalServerError().json(ErrorResponse {
                reason: "ERR_INTERNAL",
                code: 6,
                message,
            })
        }
    }
}

#[derive(Serialize)]
struct Health {
    status: &'static str,
    queue_depth: usize,
    queue_capacity: usize,
    workers: u8,
}

#[get("/healthz")]
pub async fn healthz(scheduler: web::Data<Scheduler>) -> impl Responder {
    HttpResponse::Ok().json(Health {
        status: "ok",
        queue_depth: scheduler.queue.len(),
        queue_capacity: scheduler.queue.capacity(),
        workers: scheduler.config.workers,
    })
}
