use super::*;

#[put("/submissions/{id}/rejudge")]
pub async fn put_rejudge_handler(
    scheduler: web::Data<Scheduler>,
    path: web::Path<(u32,)>,
) -> impl Responder {
    let id = path.into_inner().0;

    match scheduler.rejudge(id).await {
        Ok(admission) => HttpResponse::Ok().json(admission),
        Err(e) => {
            log::info!("Rejudge of submission {id} rejected: {e}");
            error_response(e)
        }
    }
}
