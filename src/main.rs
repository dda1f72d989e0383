use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path as UrlPath, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use aws_messaging_local::config::{self, EnvironmentConfig};
use aws_messaging_local::reaper::Reaper;
use aws_messaging_local::sns::publish::{SIGNING_CERT_PATH, STUB_CERT_PEM};
use aws_messaging_local::sns::state::SnsState;
use aws_messaging_local::sqs::state::SqsState;
use aws_messaging_local::{sns, sqs, wire};

#[derive(Parser)]
#[command(
    name = "aws-messaging-local",
    about = "Local Amazon SQS and SNS services"
)]
struct Args {
    /// Path to the YAML configuration file.
    #[arg(long, default_value = "conf/messaging.yaml")]
    config: String,
    /// Enable debug logging.
    #[arg(long)]
    debug: bool,
    /// Environment to load from the configuration file.
    #[arg(default_value = "Local")]
    environment: String,
}

const SNS_ACTIONS: [&str; 12] = [
    "CreateTopic",
    "DeleteTopic",
    "ListTopics",
    "Subscribe",
    "Unsubscribe",
    "ConfirmSubscription",
    "ListSubscriptions",
    "ListSubscriptionsByTopic",
    "GetSubscriptionAttributes",
    "SetSubscriptionAttributes",
    "Publish",
    "PublishBatch",
];

type Services = (Arc<SqsState>, Arc<SnsState>);

async fn handle_any(
    State((sqs_state, sns_state)): State<Services>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    dispatch_any(sqs_state, sns_state, headers, body, None).await
}

async fn handle_any_queue(
    UrlPath(queue_name): UrlPath<String>,
    State((sqs_state, sns_state)): State<Services>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    dispatch_any(sqs_state, sns_state, headers, body, Some(queue_name)).await
}

async fn dispatch_any(
    sqs_state: Arc<SqsState>,
    sns_state: Arc<SnsState>,
    headers: HeaderMap,
    body: Bytes,
    path_queue: Option<String>,
) -> Response {
    let action = wire::peek_action(&headers, &body).unwrap_or_default();
    if SNS_ACTIONS.contains(&action.as_str()) {
        sns::server::handle(sns_state, headers, body).await
    } else {
        sqs::server::handle(sqs_state, headers, body, path_queue).await
    }
}

/// Single-port mode: one listener serving both services, dispatched by
/// action name.
fn combined_router(sqs_state: Arc<SqsState>, sns_state: Arc<SnsState>) -> Router {
    Router::new()
        .route("/", post(handle_any))
        .route("/queue/{queueName}", post(handle_any_queue))
        .route(
            SIGNING_CERT_PATH,
            get(|| async {
                ([("content-type", "application/x-pem-file")], STUB_CERT_PEM).into_response()
            }),
        )
        .with_state((sqs_state, sns_state))
}

fn init_logging(env: &EnvironmentConfig, debug: bool) {
    let level = if debug { "debug" } else { "info" };
    let filter =
        || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if env.log_to_file {
        match std::fs::File::create(&env.log_file) {
            Ok(file) => {
                tracing_subscriber::fmt()
                    .with_env_filter(filter())
                    .with_writer(Arc::new(file))
                    .with_ansi(false)
                    .init();
                return;
            }
            Err(err) => eprintln!("unable to open log file {}: {err}", env.log_file),
        }
    }
    tracing_subscriber::fmt().with_env_filter(filter()).init();
}

async fn bind(port: u16) -> Result<tokio::net::TcpListener, ExitCode> {
    match tokio::net::TcpListener::bind(("0.0.0.0", port)).await {
        Ok(listener) => Ok(listener),
        Err(err) => {
            error!(port, error = %err, "unable to bind port");
            Err(ExitCode::FAILURE)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let config_path = Path::new(&args.config).to_path_buf();

    let loaded = config::load_file(&config_path);
    let env = match &loaded {
        Ok(environments) => environments.get(&args.environment).cloned(),
        Err(_) => None,
    }
    .unwrap_or_default();

    init_logging(&env, args.debug);
    match loaded {
        Ok(environments) if !environments.contains_key(&args.environment) => {
            warn!(environment = %args.environment, "environment not found in config, using defaults");
        }
        Err(err) => warn!(error = %err, "using default configuration"),
        _ => {}
    }

    let split = env.split_ports();
    let (sqs_port, sns_port) = split.unwrap_or((env.port, env.port));

    let sqs_state = Arc::new(SqsState::new(
        env.account_id.clone(),
        env.region.clone(),
        &env.host,
        sqs_port,
        env.queue_attribute_defaults.to_attributes(),
        env.enable_duplicates,
        env.random_latency,
    ));
    let sns_state = Arc::new(SnsState::new(
        env.account_id.clone(),
        env.region.clone(),
        &env.host,
        sns_port,
        env.random_latency,
        sqs_state.clone(),
    ));

    config::seed(&env, &sqs_state, &sns_state).await;
    let _reaper = Reaper::spawn(sqs_state.clone());
    let _watcher = config::spawn_watcher(
        config_path,
        args.environment.clone(),
        sqs_state.clone(),
        sns_state.clone(),
    );

    match split {
        None => {
            let app = combined_router(sqs_state, sns_state);
            let listener = match bind(env.port).await {
                Ok(l) => l,
                Err(code) => return code,
            };
            info!(port = env.port, "messaging services listening");
            if let Err(err) = axum::serve(listener, app).await {
                error!(error = %err, "server stopped");
                return ExitCode::FAILURE;
            }
        }
        Some((sqs_port, sns_port)) => {
            let sqs_listener = match bind(sqs_port).await {
                Ok(l) => l,
                Err(code) => return code,
            };
            let sns_listener = match bind(sns_port).await {
                Ok(l) => l,
                Err(code) => return code,
            };
            info!(sqs_port, sns_port, "messaging services listening");

            let sqs_app = sqs::server::router(sqs_state);
            let sns_app = sns::server::router(sns_state);
            let result = tokio::try_join!(
                async { axum::serve(sqs_listener, sqs_app).await },
                async { axum::serve(sns_listener, sns_app).await },
            );
            if let Err(err) = result {
                error!(error = %err, "server stopped");
                return ExitCode::FAILURE;
            }
        }
    }
    ExitCode::SUCCESS
}
