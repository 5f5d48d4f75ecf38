use std::sync::Arc;

use anyhow::{Context, bail};
use clap::Parser;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use judge::catalog::ProblemCatalog;
use judge::config::{CliArgs, Config};
use judge::database as db;
use judge::sandbox::{SandboxRunner, create_sandbox_runner};
use judge::scheduler::Scheduler;
use judge::toolchain::Toolchain;
use judge::web_server::build_server;
use judge::worker::worker;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let cli = CliArgs::parse();
    let Config {
        server: server_config,
        judge: judge_config,
        problems,
        languages,
    } = cli.to_config().context("Failed to load configuration")?;

    if judge_config.workers == 0 {
        bail!("The number of workers must not be 0");
    }
    if judge_config.queue_capacity == 0 {
        bail!("The queue capacity must not be 0");
    }

    let db_path = db::get_db_path(judge_config.database.as_deref())?;
    if cli.flush_data {
        db::remove_db(&db_path);
    }

    let db_pool = db::init_db(&db_path)
        .await
        .context("Failed to initialize database")?;

    let catalog = Arc::new(ProblemCatalog::new(problems));
    let toolchain = Arc::new(Toolchain::new(languages));
    log::info!(
        "Loaded {} problems, languages: {}",
        catalog.len(),
        toolchain.names().join(", ")
    );

    // One sandbox per worker, created up front so a broken setup fails fast
    let mut sandboxes: Vec<Arc<dyn SandboxRunner>> = Vec::new();
    for id in 1..=judge_config.workers {
        let runner = create_sandbox_runner(id, &judge_config)
            .with_context(|| format!("Failed to create sandbox {id}"))?;
        sandboxes.push(Arc::from(runner));
    }

    let scheduler = Arc::new(Scheduler::new(db_pool, catalog, toolchain, judge_config));
    scheduler
        .recover()
        .await
        .context("Failed to recover unfinished submissions")?;
    let shutdown_token = CancellationToken::new();

    // ======= PREPARATION END, EXECUTION START =======

    let mut workers = JoinSet::new();
    for (idx, sandbox) in sandboxes.into_iter().enumerate() {
        workers.spawn(worker(
            idx as u8 + 1,
            sandbox,
            scheduler.clone(),
            shutdown_token.clone(),
        ));
    }

    let server = build_server(server_config, scheduler).context("Failed to build server")?;

    let server_handle = server.handle();
    let server_task = actix_web::rt::spawn(server);

    // ===== EXECUTION END, WAITING FOR SHUTDOWN ======

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            log::info!("Ctrl-c received, shutting down...");
        }
        res_server = server_task => {
            log::error!("Server terminated unexpectedly: {:?}", res_server);
        }
        Some(res_worker) = workers.join_next() => {
            log::error!("A worker terminated unexpectedly: {:?}", res_worker);
        }
    }

    // 1. Shutdown actix-web server gracefully
    server_handle.stop(true).await;

    // 2. Broadcast shutdown signal to workers
    shutdown_token.cancel();
    log::info!("Shutdown signal sent to workers, waiting for them to finish...");

    // 3. Wait until every worker terminates
    while let Some(res) = workers.join_next().await {
        match res {
            Ok(Err(e)) => log::error!("Worker finished with error: {e:?}"),
            Err(e) if e.is_panic() => log::error!("Worker handle panicked: {e:?}"),
            Err(e) => log::error!("Worker handle finished with error: {e:?}"),
            Ok(Ok(())) => {}
        }
    }

    log::info!("Shutdown complete");
    Ok(())
}
