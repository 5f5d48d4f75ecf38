mod delete;
mod get;
mod post;
mod put;

pub use delete::delete_submission_handler;
pub use get::{get_submission_by_id_handler, get_submissions_handler};
pub use post::post_submission_handler;
pub use put::put_rejudge_handler;

use actix_web::{HttpRequest, HttpResponse, Responder, delete, get, post, put, web};

use super::{error_response, viewer};
use crate::scheduler::Scheduler;
