//! CLI command implementations

use crate::output::{self, CertificateInfo};
use crate::progress::TransferProgress;
use crate::{OutputFormat, PinMode};
use anyhow::{anyhow, bail, Context, Result};
use console::style;
use netsession_core::{
    certificates_in_dir, load_certificate_file, HttpResponseSerializer, HttpSessionManager,
    JsonResponseSerializer, ReqwestBackend, RequestSerializer, SecurityPolicy, SessionManager,
    TaskOptions, TaskOutcome,
};
use netsession_types::{PinningMode, Request, Response, SessionConfig};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{broadcast::error::RecvError, oneshot};
use tracing::{debug, info, warn};
use url::Url;

// ============================================================================
// Session Setup
// ============================================================================

pub struct SessionOptions {
    pub config: Option<PathBuf>,
    pub pin_mode: PinMode,
    pub pin_certs: Vec<PathBuf>,
    pub pin_dir: Option<PathBuf>,
    pub allow_invalid: bool,
    pub validate_domain: bool,
}

/// `<config dir>/nsfetch/config.json`
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("nsfetch").join("config.json"))
}

/// Read the session config from `path`, else from the default location if present
pub fn load_config(path: Option<&Path>) -> Result<SessionConfig> {
    let fallback = default_config_path().filter(|p| p.is_file());
    let Some(path) = path.or(fallback.as_deref()) else {
        return Ok(SessionConfig::default());
    };
    debug!("Loading config from {}", path.display());
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    let config = serde_json::from_str(&contents)
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(config)
}

pub fn build_session(options: &SessionOptions) -> Result<SessionManager> {
    let config = load_config(options.config.as_deref())?;

    let mode = match options.pin_mode {
        PinMode::None => PinningMode::None,
        PinMode::PublicKey => PinningMode::PublicKey,
        PinMode::Certificate => PinningMode::Certificate,
    };

    let mut pinned = Vec::new();
    for path in &options.pin_certs {
        pinned.extend(load_certificate_file(path)?);
    }
    if let Some(dir) = &options.pin_dir {
        pinned.extend(certificates_in_dir(dir)?);
    }
    if mode != PinningMode::None && pinned.is_empty() {
        bail!("pinning needs at least one certificate (--pin-cert or --pin-dir)");
    }
    debug!("Pinning {} certificate(s) in {:?} mode", pinned.len(), mode);

    let policy = SecurityPolicy::with_pinned_certificates(mode, pinned)
        .allow_invalid_certificates(options.allow_invalid)
        .validates_domain_name(options.validate_domain);

    // Pinned and permissive policies decide trust themselves
    let transport_validates = mode == PinningMode::None && !options.allow_invalid;
    let backend = ReqwestBackend::with_certificate_validation(&config, transport_validates)?;

    let session = SessionManager::new(Arc::new(backend), &config)?;
    session.set_security_policy(policy);
    spawn_event_log(&session);
    Ok(session)
}

/// Forward session events to the log
fn spawn_event_log(session: &SessionManager) {
    let mut rx = session.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => debug!("Session event: {:?}", event),
                Err(RecvError::Lagged(n)) => {
                    warn!("Event receiver lagged by {} messages", n);
                }
                Err(RecvError::Closed) => break,
            }
        }
    });
}

// ============================================================================
// Get
// ============================================================================

pub async fn get(
    session: &SessionManager,
    url: &str,
    params: Vec<String>,
    headers: Vec<String>,
    json: bool,
    format: OutputFormat,
) -> Result<()> {
    let parameters = parse_params(&params)?;

    let mut serializer = RequestSerializer::new();
    for header in &headers {
        let (name, value) = header
            .split_once(':')
            .ok_or_else(|| anyhow!("invalid header '{}', expected 'Name: value'", header))?;
        serializer.set_header(name.trim(), Some(value.trim()));
    }

    if json {
        session.set_response_serializer(Arc::new(JsonResponseSerializer::new()));
    } else {
        session.set_response_serializer(Arc::new(HttpResponseSerializer::new()));
    }

    let http = HttpSessionManager::new(session.clone(), None);
    http.set_request_serializer(serializer);

    let (tx, rx) = oneshot::channel();
    let handle = http.get(url, parameters.as_ref(), move |outcome| {
        let _ = tx.send(outcome);
    })?;
    info!("Started task {} for {}", handle.id(), url);

    let outcome = rx.await.context("task finished without a result")?;
    output::print_outcome(&outcome, format)
}

/// `key=value` pairs as a JSON object
fn parse_params(params: &[String]) -> Result<Option<Value>> {
    if params.is_empty() {
        return Ok(None);
    }
    let mut map = Map::new();
    for param in params {
        let (key, value) = param
            .split_once('=')
            .ok_or_else(|| anyhow!("invalid parameter '{}', expected key=value", param))?;
        map.insert(key.to_string(), Value::String(value.to_string()));
    }
    Ok(Some(Value::Object(map)))
}

// ============================================================================
// Download
// ============================================================================

pub async fn download(
    session: &SessionManager,
    url: &str,
    output: Option<PathBuf>,
    resume: Option<PathBuf>,
    format: OutputFormat,
) -> Result<()> {
    let url = Url::parse(url)?;
    let label = output
        .as_ref()
        .and_then(|p| p.file_name())
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| Response::new(url.clone(), 200).suggested_filename());
    let resume_path = resume
        .clone()
        .unwrap_or_else(|| PathBuf::from(format!("{}.nsresume", label)));

    let progress = TransferProgress::new(&label);
    let target = output.clone();
    let options = TaskOptions::new()
        .destination(move |_, response| resolve_destination(target.as_deref(), response))
        .on_download_progress(progress.observer());

    let (tx, mut rx) = oneshot::channel();
    let completion = move |outcome: TaskOutcome| {
        let _ = tx.send(outcome);
    };
    let handle = match &resume {
        Some(path) => {
            let data = tokio::fs::read(path)
                .await
                .with_context(|| format!("failed to read resume data {}", path.display()))?;
            session.download_task_with_resume_data(&data, options, completion)?
        }
        None => session.download_task(Request::get(url), options, completion)?,
    };
    handle.resume();

    let outcome = tokio::select! {
        outcome = &mut rx => outcome.context("task finished without a result")?,
        _ = tokio::signal::ctrl_c() => {
            let saved = handle.cancel_producing_resume_data();
            let _ = rx.await;
            progress.abandon("Interrupted");

            if let Some(data) = saved {
                tokio::fs::write(&resume_path, data).await?;
                println!(
                    "{} Saved progress; continue with --resume {}",
                    style("⏸").yellow(),
                    resume_path.display()
                );
            }
            return Ok(());
        }
    };

    match outcome.error() {
        None => progress.finish(),
        Some(e) => progress.abandon(&e.to_string()),
    }
    if resume.is_some() && outcome.is_success() {
        let _ = tokio::fs::remove_file(&resume_path).await;
    }
    output::print_outcome(&outcome, format)
}

fn resolve_destination(target: Option<&Path>, response: Option<&Response>) -> PathBuf {
    if let Some(target) = target {
        return target.to_path_buf();
    }
    let name = response
        .map(|r| r.suggested_filename())
        .unwrap_or_else(|| "download".to_string());
    std::env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join(name)
}

// ============================================================================
// Certificates
// ============================================================================

pub fn show_certificates(files: &[PathBuf], format: OutputFormat) -> Result<()> {
    let mut infos = Vec::new();
    for path in files {
        for certificate in load_certificate_file(path)? {
            infos.push(CertificateInfo::new(path, &certificate)?);
        }
    }
    output::print_certificates(&infos, format)
}
