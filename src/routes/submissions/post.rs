use super::*;
use crate::submission::NewSubmission;

#[post("/submissions")]
pub async fn post_submission_handler(
    scheduler: web::Data<Scheduler>,
    body: web::Json<NewSubmission>,
) -> impl Responder {
    match scheduler.enqueue(body.into_inner()).await {
        Ok(admission) => HttpResponse::Ok().json(admission),
        Err(e) => {
            log::info!("Submission rejected: {e}");
            error_response(e)
        }
    }
}
