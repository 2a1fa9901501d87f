//! Output formatting utilities

use crate::OutputFormat;
use anyhow::{anyhow, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use console::style;
use netsession_core::{Certificate, TaskOutcome};
use netsession_types::ResponseObject;
use serde::Serialize;
use std::path::Path;

/// Print a finished task; a failed task becomes the command's error
pub fn print_outcome(outcome: &TaskOutcome, format: OutputFormat) -> Result<()> {
    let status = outcome.response.as_ref().map(|r| r.status);

    match format {
        OutputFormat::Json => {
            let body = match &outcome.serialized {
                Some(ResponseObject::Json(value)) => value.clone(),
                Some(ResponseObject::File(path)) => serde_json::json!(path),
                Some(ResponseObject::Text(text)) => serde_json::json!(text),
                Some(ResponseObject::Data(data)) => {
                    serde_json::json!(String::from_utf8_lossy(data))
                }
                Some(ResponseObject::Empty) | None => serde_json::Value::Null,
            };
            let report = serde_json::json!({
                "task": outcome.task.0,
                "status": status,
                "url": outcome.response.as_ref().map(|r| r.url.to_string()),
                "bytes": outcome.data.len(),
                "body": body,
                "error": outcome.error().map(|e| e.to_string()),
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        OutputFormat::Human => {
            if let Some(status) = status {
                let line = format!("HTTP {}", status);
                if (200..300).contains(&status) {
                    eprintln!("{}", style(line).green().bold());
                } else {
                    eprintln!("{}", style(line).yellow().bold());
                }
            }
            match &outcome.serialized {
                Some(ResponseObject::Json(value)) => {
                    println!("{}", serde_json::to_string_pretty(value)?)
                }
                Some(ResponseObject::File(path)) => println!(
                    "{} Saved to {}",
                    style("✓").green().bold(),
                    style(path.display()).cyan()
                ),
                Some(ResponseObject::Text(text)) => println!("{}", text),
                Some(ResponseObject::Data(data)) => {
                    println!("{}", String::from_utf8_lossy(data))
                }
                Some(ResponseObject::Empty) | None => {}
            }
        }
    }

    match outcome.error() {
        Some(e) => Err(anyhow!("task {} failed: {}", outcome.task, e)),
        None => Ok(()),
    }
}

#[derive(Debug, Serialize)]
pub struct CertificateInfo {
    pub file: String,
    pub subject: String,
    pub public_key: String,
    pub der_bytes: usize,
}

impl CertificateInfo {
    pub fn new(path: &Path, certificate: &Certificate) -> Result<Self> {
        Ok(Self {
            file: path.display().to_string(),
            subject: certificate.subject(),
            public_key: STANDARD.encode(certificate.public_key()?),
            der_bytes: certificate.as_der().len(),
        })
    }
}

pub fn print_certificates(infos: &[CertificateInfo], format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(infos)?);
        }
        OutputFormat::Human => {
            for info in infos {
                println!("{}", style(&info.subject).bold());
                println!("  File: {}", info.file);
                println!("  Size: {}", format_bytes(info.der_bytes as u64));
                println!("  Public key: {}", info.public_key);
            }
        }
    }
    Ok(())
}

/// Format bytes as human-readable
pub fn format_bytes(bytes: u64) -> String {
    human_bytes::human_bytes(bytes as f64)
}
