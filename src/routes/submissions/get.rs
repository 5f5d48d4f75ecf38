use super::*;
use crate::database as db;
use crate::submission::{SubmissionFilter, SubmissionView};

#[get("/submissions")]
pub async fn get_submissions_handler(
    scheduler: web::Data<Scheduler>,
    query: web::Query<SubmissionFilter>,
    req: HttpRequest,
) -> impl Responder {
    let viewer = viewer(&req);

    match db::list_submissions(&scheduler.pool, &query).await {
        Ok(records) => {
            log::debug!("Listed {} submissions", records.len());
            let views: Vec<SubmissionView> = records.iter().map(|s| s.view(viewer)).collect();
            HttpResponse::Ok().json(views)
        }
        Err(e) => error_response(e.into()),
    }
}

#[get("/submissions/{id}")]
pub async fn get_submission_by_id_handler(
    scheduler: web::Data<Scheduler>,
    path: web::Path<(u32,)>,
    req: HttpRequest,
) -> impl Responder {
    let id = path.into_inner().0;

    match scheduler.get(id).await {
        Ok(submission) => HttpResponse::Ok().json(submission.view(viewer(&req))),
        Err(e) => error_response(e),
    }
}
