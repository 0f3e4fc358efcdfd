//! Preflight checks run before the daemon starts processing:
//! - ffmpeg and ffprobe are runnable
//! - the configured hardware encoder actually works
//! - every enabled catalog service answers

use crate::catalog::CatalogServices;
use crate::config::{HardwareAccel, TranscodeConfig};
use crate::encode::{EncodeProfile, EncodeSettings};
use crate::workspace::Workspace;
use std::ffi::OsStr;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;

/// Limit for the synthetic hardware encode.
pub const HARDWARE_PROBE_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("{tool} is not available: {reason}")]
    ToolUnavailable { tool: String, reason: String },

    #[error("No catalog service is reachable")]
    NoCatalogServices,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Extract the major version from `<tool> -version` output.
///
/// Handles plain (`ffmpeg version 6.1.1 ...`) and git-style
/// (`ffmpeg version n6.1-...`) version strings.
pub fn parse_tool_version(tool: &str, version_output: &str) -> Option<u32> {
    let marker = format!("{} version", tool.to_lowercase());
    let version_line = version_output
        .lines()
        .map(str::to_lowercase)
        .find(|line| line.contains(&marker))?;

    let version_part = version_line
        .split(&marker)
        .nth(1)?
        .split_whitespace()
        .next()?
        .to_string();

    let version_str = version_part.trim_start_matches('n');
    let major_str = version_str.split(['.', '-']).next()?;
    major_str.parse().ok()
}

/// Whether `encoder` appears in `ffmpeg -encoders` output.
pub fn encoder_listed(encoders_output: &str, encoder: &str) -> bool {
    encoders_output
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .any(|name| name == encoder)
}

/// Run `<binary> -version` and return the major version when it can be read.
pub async fn check_tool(binary: impl AsRef<OsStr>, tool: &str) -> Result<Option<u32>, StartupError> {
    let output = Command::new(binary.as_ref())
        .arg("-version")
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| StartupError::ToolUnavailable {
            tool: tool.to_string(),
            reason: format!("failed to run {} -version: {}", tool, e),
        })?;

    if !output.status.success() {
        return Err(StartupError::ToolUnavailable {
            tool: tool.to_string(),
            reason: format!("{} -version exited with {}", tool, output.status),
        });
    }

    let version = parse_tool_version(tool, &String::from_utf8_lossy(&output.stdout));
    match version {
        Some(major) => tracing::info!(tool, major, "Found tool"),
        None => tracing::warn!(tool, "Could not parse tool version"),
    }
    Ok(version)
}

/// Verify both external tools before anything else happens.
pub async fn check_tools() -> Result<(), StartupError> {
    check_tool("ffmpeg", "ffmpeg").await?;
    check_tool("ffprobe", "ffprobe").await?;
    Ok(())
}

/// True if `accel` is listed by ffmpeg and a short synthetic encode through
/// its profile succeeds within [`HARDWARE_PROBE_TIMEOUT`].
pub async fn probe_hardware(
    binary: impl AsRef<OsStr>,
    accel: HardwareAccel,
    config: &TranscodeConfig,
) -> bool {
    let binary = binary.as_ref();
    let encoder = accel.encoder_name();

    let listing = Command::new(binary)
        .args(["-hide_banner", "-encoders"])
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await;
    match listing {
        Ok(out) if out.status.success() => {
            if !encoder_listed(&String::from_utf8_lossy(&out.stdout), encoder) {
                tracing::warn!(encoder, "Hardware encoder not compiled into ffmpeg");
                return false;
            }
        }
        Ok(out) => {
            tracing::warn!("ffmpeg -encoders exited with {}", out.status);
            return false;
        }
        Err(e) => {
            tracing::warn!("Could not list ffmpeg encoders: {}", e);
            return false;
        }
    }

    let profile = EncodeProfile::Hardware(accel);
    let args = profile.synthetic_test_args(&EncodeSettings::from_config(config));
    let child = Command::new(binary)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn();
    let child = match child {
        Ok(child) => child,
        Err(e) => {
            tracing::warn!("Could not start hardware test encode: {}", e);
            return false;
        }
    };

    match tokio::time::timeout(HARDWARE_PROBE_TIMEOUT, child.wait_with_output()).await {
        Ok(Ok(out)) if out.status.success() => {
            tracing::info!(encoder, "Hardware encoder is usable");
            true
        }
        Ok(Ok(out)) => {
            let stderr = String::from_utf8_lossy(&out.stderr);
            tracing::warn!(
                encoder,
                detail = stderr.lines().last().unwrap_or(""),
                "Hardware test encode failed, using software only"
            );
            false
        }
        Ok(Err(e)) => {
            tracing::warn!(encoder, "Hardware test encode errored: {}", e);
            false
        }
        Err(_) => {
            tracing::warn!(encoder, "Hardware test encode timed out after {:?}", HARDWARE_PROBE_TIMEOUT);
            false
        }
    }
}

/// Keep only reachable catalog services; refuse to start with none.
pub async fn connect_catalogs(services: CatalogServices) -> Result<CatalogServices, StartupError> {
    let services = services.retain_reachable().await;
    if services.is_empty() {
        return Err(StartupError::NoCatalogServices);
    }
    Ok(services)
}

/// Leftovers mean a previous run died mid-job; they are swept at shutdown.
pub fn warn_if_working_not_empty(workspace: &Workspace) {
    match workspace.leftovers() {
        Ok(files) if !files.is_empty() => tracing::warn!(
            count = files.len(),
            dir = %workspace.working_dir().display(),
            "Working storage is not empty"
        ),
        Ok(_) => {}
        Err(e) => tracing::warn!("Could not inspect working storage: {}", e),
    }
}
