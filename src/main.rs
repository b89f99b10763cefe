mod cli;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use switchboard_core::SessionId;
use switchboard_engine::MockEngine;
use switchboard_runtime::{
    AutoReconnector, ClientRegistry, ReconnectConfig, RegistryConfig, SessionEventHandler,
    SessionService,
};
use switchboard_settings::SwitchboardSettings;
use switchboard_store::{Database, SessionRepo, SessionRepository};
use switchboard_telemetry::{init_telemetry, LogQuery, TelemetryConfig, TelemetryGuard};

use crate::cli::{Cli, Command};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    let settings = match &args.settings {
        Some(path) => switchboard_settings::load_settings_from_path(path),
        None => switchboard_settings::load_settings(),
    }
    .context("failed to load settings")?;

    let telemetry = init_telemetry(telemetry_config(&settings));

    let db_path = args
        .db
        .clone()
        .unwrap_or_else(|| PathBuf::from(&settings.database.path));
    let db = Database::open(&db_path)
        .with_context(|| format!("failed to open session database at {}", db_path.display()))?;
    let repo: Arc<dyn SessionRepository> = Arc::new(SessionRepo::new(db));

    // Simulated engine; a real protocol engine plugs in through the same factory trait.
    let engine = MockEngine::new();
    let registry = Arc::new(ClientRegistry::new(
        Arc::new(engine),
        repo.clone(),
        RegistryConfig::from(&settings.registry),
    ));
    registry.set_global_event_handler(Arc::new(SessionEventHandler::new(repo.clone())));
    registry.start();

    let cancel = CancellationToken::new();
    if settings.reconnect.on_startup && args.command.runs_startup_reconnect() {
        let reconnector = AutoReconnector::new(
            registry.clone(),
            repo.clone(),
            ReconnectConfig::from(&settings.reconnect),
        );
        let swept = tokio::select! {
            result = reconnector.run(&cancel) => result.map(Some),
            _ = tokio::signal::ctrl_c() => {
                cancel.cancel();
                Ok(None)
            }
        };
        match swept {
            Ok(Some(_)) => {}
            Ok(None) => tracing::info!("startup reconnect sweep interrupted"),
            Err(e) => tracing::warn!(error = %e, "startup reconnect sweep failed"),
        }
    }

    let service = SessionService::new(repo.clone(), registry.clone());
    let outcome = if cancel.is_cancelled() {
        Err(anyhow::anyhow!("interrupted"))
    } else {
        tokio::select! {
            result = run(args.command, &service, &settings, &telemetry, &cancel) => result,
            _ = tokio::signal::ctrl_c() => {
                cancel.cancel();
                Err(anyhow::anyhow!("interrupted"))
            }
        }
    };

    let shutdown = registry.stop().await;
    if !shutdown.errors.is_empty() {
        tracing::warn!(failed = shutdown.errors.len(), "some clients did not close cleanly");
    }

    let output = outcome?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn run(
    command: Command,
    service: &SessionService,
    settings: &SwitchboardSettings,
    telemetry: &TelemetryGuard,
    cancel: &CancellationToken,
) -> Result<Value> {
    let value = match command {
        Command::Create { name, proxy } => {
            serde_json::to_value(service.create(&name, proxy.as_deref())?)?
        }
        Command::List { limit, offset } => serde_json::to_value(service.list(limit, offset)?)?,
        Command::Show { id } => serde_json::to_value(service.status(&resolve(service, &id)?)?)?,
        Command::Connect { id } => {
            serde_json::to_value(service.connect(&resolve(service, &id)?, cancel).await?)?
        }
        Command::Disconnect { id } => {
            serde_json::to_value(service.disconnect(&resolve(service, &id)?, cancel).await?)?
        }
        Command::Qr { id } => {
            let qr = service.generate_qr(&resolve(service, &id)?, cancel).await?;
            json!({ "qrCode": qr })
        }
        Command::Pair { id, phone } => {
            service.pair_phone(&resolve(service, &id)?, &phone, cancel).await?;
            json!({ "paired": true })
        }
        Command::Send { id, to, text } => {
            let id = resolve(service, &id)?;
            let message_id = service.send_message(&id, &to, &text, cancel).await?;
            json!({ "messageId": message_id })
        }
        Command::Delete { id } => {
            let id = resolve(service, &id)?;
            service.delete(&id).await?;
            json!({ "deleted": id })
        }
        Command::DeleteAll => serde_json::to_value(service.delete_all().await?)?,
        Command::SetProxy { id, url } => {
            serde_json::to_value(service.set_proxy(&resolve(service, &id)?, url.as_deref())?)?
        }
        Command::Logs {
            session,
            target,
            errors,
            limit,
        } => {
            let sink = telemetry
                .logs()
                .context("warning log is disabled (logging.persistWarnings)")?;
            let session_id = session.map(|raw| resolve(service, &raw)).transpose()?;
            let query = LogQuery {
                min_level: errors.then_some(tracing::Level::ERROR),
                target,
                session_id: session_id.map(|id| id.to_string()),
                limit: Some(limit),
                ..LogQuery::default()
            };
            serde_json::to_value(sink.query(&query)?)?
        }
        Command::Reconnect {
            max_concurrent,
            timeout_ms,
        } => {
            let mut config = ReconnectConfig::from(&settings.reconnect);
            // clap has already range-checked both overrides.
            if let Some(n) = max_concurrent {
                config.max_concurrent = usize::try_from(n)?;
            }
            if let Some(ms) = timeout_ms {
                config.attempt_timeout = Duration::from_millis(ms);
            }
            let reconnector =
                AutoReconnector::new(service.registry().clone(), service.repo(), config);
            serde_json::to_value(reconnector.run(cancel).await?)?
        }
    };
    Ok(value)
}

/// Accept either a session id or a session name.
fn resolve(service: &SessionService, raw: &str) -> Result<SessionId> {
    if let Ok(id) = raw.parse::<SessionId>() {
        return Ok(id);
    }
    let session = service
        .get_by_name(raw)
        .with_context(|| format!("no session named '{raw}'"))?;
    Ok(session.id)
}

fn telemetry_config(settings: &SwitchboardSettings) -> TelemetryConfig {
    let logging = &settings.logging;
    TelemetryConfig {
        log_level: logging.level.parse().unwrap_or(tracing::Level::INFO),
        json: logging.json,
        log_to_sqlite: logging.persist_warnings,
        log_db_path: PathBuf::from(&logging.log_db_path),
        ..TelemetryConfig::default()
    }
}
