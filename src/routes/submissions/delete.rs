use super::*;

#[delete("/submissions/{id}")]
pub async fn delete_submission_handler(
    scheduler: web::Data<Scheduler>,
    path: web::Path<(u32,)>,
    req: HttpRequest,
) -> impl Responder {
    let id = path.into_inner().0;

    match scheduler.cancel(id).await {
        Ok(submission) => HttpResponse::Ok().json(submission.view(viewer(&req))),
        Err(e) => error_response(e),
    }
}
