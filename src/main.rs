//! Vigil - Sensor monitoring with threshold rules and alert notification.
//!
//! # API Endpoints
//!
//! - `POST /readings` - Submit a reading
//! - `GET /readings` - Query readings for a channel
//! - `GET|POST /monitors`, `GET|POST /channels`, `POST /sensor-types`
//! - `POST /contacts`, `POST /rules`, `POST /rules/:id/pause|resume`
//! - `GET /alerts/active` - Active alerts
//! - `GET|POST /ack?aid=&bid=` - Alert acknowledgement
//! - `GET /health` - Health check

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use vigil::api::{AppState, router};
use vigil::config::Config;
use vigil::ingest::Ingestor;
use vigil::notify::sms::SmsApiGateway;
use vigil::notify::smtp::SmtpGateway;
use vigil::notify::{Dispatcher, Gateway, RoutingGateway};
use vigil::storage::Storage;
use vigil::worker::{EvaluationQueue, Evaluator, spawn_rule_resumer};

/// Build the delivery gateway from whatever is configured.
///
/// Text goes through the SMS API when one is configured, otherwise over SMTP
/// to the carrier's email-to-SMS domain.
fn build_gateway(config: &Config) -> anyhow::Result<RoutingGateway> {
    let smtp: Option<Arc<dyn Gateway>> = match &config.smtp {
        Some(smtp) => Some(Arc::new(SmtpGateway::new(smtp)?)),
        None => {
            warn!("SMTP not configured, email notifications disabled");
            None
        }
    };
    let sms: Option<Arc<dyn Gateway>> = match &config.sms {
        Some(sms) => Some(Arc::new(SmsApiGateway::new(sms.clone())?)),
        None => None,
    };

    Ok(RoutingGateway {
        email: smtp.clone(),
        text: sms.or(smtp),
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("vigil=info".parse()?))
        .init();

    let config = Config::from_env()?;
    config.log_config();

    // Initialize storage
    let storage = Storage::new(&config.database_url).await?;
    info!("Database initialized");

    let gateway = build_gateway(&config)?;
    let dispatcher = Dispatcher::new(storage.clone(), Arc::new(gateway), &config.public_url);

    // Background evaluation and rule resumption
    let (queue, jobs) = EvaluationQueue::new();
    let evaluator = Arc::new(Evaluator::new(storage.clone(), dispatcher));
    tokio::spawn(evaluator.run(jobs));
    spawn_rule_resumer(storage.clone(), config.resume_interval);

    let state = AppState {
        ingestor: Ingestor::new(storage.clone(), queue),
        storage,
    };
    let app = router(state);

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr).await?;

    info!(%addr, "Vigil is listening");

    axum::serve(listener, app).await?;

    Ok(())
}
