use std::sync::Arc;

use actix_web::{App, HttpServer, dev::Server, middleware, web};

use crate::config::ServerConfig;
use crate::routes;
use crate::scheduler::Scheduler;

pub fn build_server(
    server_config: ServerConfig,
    scheduler: Arc<Scheduler>,
) -> std::io::Result<Server> {
    let scheduler = web::Data::from(scheduler);

    let server = HttpServer::new(move || {
        App::new()
            .app_data(scheduler.clone())
            .wrap(middleware::Logger::default())
            .configure(routes::configure)
    })
    .bind((
        server_config
            .bind_address
            .unwrap_or_else(|| "127.0.0.1".to_string()),
        server_config.bind_port.unwrap_or(12345),
    ))?
    .run();

    Ok(server)
}
