use std::env;
use std::process::exit;
use std::sync::Arc;

use dotenv::dotenv;
use tracing_subscriber::EnvFilter;

use jokbo_orchestrator::config::AppSettings;
use jokbo_orchestrator::kv::redis_store::RedisKv;
use jokbo_orchestrator::storage::StorageService;
use jokbo_orchestrator::JobRunner;

#[tokio::main]
async fn main() {
    dotenv().ok();
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env().add_directive("info".parse().unwrap())).init();
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let settings = match AppSettings::from_env() {
        Ok(settings) => settings,
        Err(e) => {
            tracing::error!("failed to load application settings from environment: {}", e);
            log::error!("failed to load application settings from environment: {}", e);
            tracing::error!("cannot start worker without valid settings");
            log::error!("cannot start worker without valid settings");
            exit(1);
        }
    };

    let kv = match RedisKv::connect(&settings.redis).await {
        Ok(kv) => Arc::new(kv),
        Err(e) => {
            tracing::error!("failed to connect to redis: {}", e);
            log::error!("failed to connect to redis: {}", e);
            tracing::error!("cannot start worker without a working redis connection");
            log::error!("cannot start worker without a working redis connection");
            exit(1);
        }
    };
    tracing::info!("redis connection established");
    log::info!("redis connection established");

    let storage = Arc::new(StorageService::new(kv, settings.storage.clone()));
    let runner = JobRunner::new(storage, settings);

    let mut args = env::args().skip(1);
    let Some(command) = args.next() else {
        tracing::error!("usage: jokbo-orchestrator <run-jokbo|run-lesson|exam-only|partial-jokbo> <job_id>");
        log::error!("usage: jokbo-orchestrator <run-jokbo|run-lesson|exam-only|partial-jokbo> <job_id>");
        exit(1);
    };
    let Some(job_id) = args.next() else {
        tracing::error!("missing job_id argument");
        log::error!("missing job_id argument");
        exit(1);
    };

    let result = match command.as_str() {
        "run-jokbo" => runner.run_jokbo_analysis(&job_id).await,
        "run-lesson" => runner.run_lesson_analysis(&job_id).await,
        "exam-only" => runner.run_exam_only_analysis(&job_id).await,
        "partial-jokbo" => runner.generate_partial_jokbo(&job_id).await,
        other => {
            tracing::error!("unknown command: {}", other);
            log::error!("unknown command: {}", other);
            exit(1);
        }
    };

    match result {
        Ok(payload) => {
            println!("{}", serde_json::to_string_pretty(&payload).unwrap_or_default());
        }
        Err(e) => {
            tracing::error!("job {} failed: {}", job_id, e);
            log::error!("job {} failed: {}", job_id, e);
            exit(1);
        }
    }
}
