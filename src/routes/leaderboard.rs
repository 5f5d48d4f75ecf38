use actix_web::{HttpResponse, Responder, get, web};

use super::error_response;
use crate::database as db;
use crate::leaderboard::rank_entries;
use crate::scheduler::Scheduler;

#[get("/events/{event_id}/leaderboard")]
pub async fn get_leaderboard_handler(
    scheduler: web::Data<Scheduler>,
    path: web::Path<(u32,)>,
) -> impl Responder {
    let event_id = path.into_inner().0;

    match db::fetch_leaderboard(&scheduler.pool, event_id).await {
        Ok(entries) => {
            log::debug!("Ranking {} participants of event {event_id}", entries.len());
            HttpResponse::Ok().json(rank_entries(entries))
        }
        Err(e) => error_response(e.into()),
    }
}
