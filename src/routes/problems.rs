use actix_web::{HttpRequest, HttpResponse, Responder, get, put, web};

use super::{ErrorResponse, error_response, viewer};
use crate::catalog::Problem;
use crate::error::JudgeError;
use crate::scheduler::Scheduler;
use crate::submission::Viewer;

#[put("/problems/{id}")]
pub async fn put_problem_handler(
    scheduler: web::Data<Scheduler>,
    path: web::Path<(u32,)>,
    body: web::Json<Problem>,
) -> impl Responder {
    let id = path.into_inner().0;
    let problem = body.into_inner();

    if problem.id != id {
        return HttpResponse::BadRequest().json(ErrorResponse::invalid_argument(format!(
            "problem id {} does not match path id {id}",
            problem.id
        )));
    }
    if let Some(lang) = problem
        .allowed_languages
        .iter()
        .find(|l| scheduler.toolchain.get(l).is_none())
    {
        return error_response(JudgeError::Configuration(format!(
            "language {lang} is not supported"
        )));
    }

    let snapshot = scheduler.catalog.upsert(problem);
    HttpResponse::Ok().json(snapshot.as_ref())
}

/// Hidden test data is only returned to staff
#[get("/problems/{id}")]
pub async fn get_problem_handler(
    scheduler: web::Data<Scheduler>,
    path: web::Path<(u32,)>,
    req: HttpRequest,
) -> impl Responder {
    let id = path.into_inner().0;
    let Some(problem) = scheduler.catalog.get(id) else {
        return error_response(JudgeError::NotFound(format!("problem {id}")));
    };

    match viewer(&req) {
        Viewer::Staff => HttpResponse::Ok().json(problem.as_ref()),
        Viewer::Student => HttpResponse::Ok().json(problem.public_view()),
    }
}
