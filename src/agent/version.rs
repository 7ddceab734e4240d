//! Agent binary detection and sub-command selection

use crate::error::{Error, Result};
use regex::Regex;
use semver::Version;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::process::Command;

/// Sub-command for releases at or above the threshold
pub const SUBCOMMAND_MCP_SERVER: &str = "mcp-server";
/// Sub-command for older releases
pub const SUBCOMMAND_MCP: &str = "mcp";

/// Printed when the agent binary cannot be found
pub const INSTALL_HINT: &str = "npm install -g @openai/codex";

/// Result of probing the installed agent binary
#[derive(Debug, Clone)]
pub struct AgentVersion {
    /// Raw `--version` output
    pub raw: String,
    pub version: Option<Version>,
    pub subcommand: &'static str,
}

fn version_regex() -> Option<&'static Regex> {
    static VERSION: OnceLock<Option<Regex>> = OnceLock::new();
    VERSION
        .get_or_init(|| Regex::new(r"(\d+\.\d+\.\d+(?:-[0-9A-Za-z.-]+)?)").ok())
        .as_ref()
}

/// Find the first `x.y.z[-pre]` in `--version` output
pub fn parse_version(output: &str) -> Option<Version> {
    let caps = version_regex()?.captures(output)?;
    Version::parse(caps.get(1)?.as_str()).ok()
}

/// Pick the sub-command; unknown versions get the newer one
pub fn select_subcommand(version: Option<&Version>, threshold: &Version) -> &'static str {
    match version {
        Some(v) if v < threshold => SUBCOMMAND_MCP,
        _ => SUBCOMMAND_MCP_SERVER,
    }
}

/// Run `<binary> --version` and choose the sub-command.
///
/// A missing binary is a setup error carrying install instructions.
pub async fn probe(binary: &str, threshold: &str) -> Result<AgentVersion> {
    let threshold = Version::parse(threshold)
        .map_err(|e| Error::Config(format!("Invalid version threshold '{}': {}", threshold, e)))?;

    let output = Command::new(binary)
        .arg("--version")
        .kill_on_drop(true)
        .output();
    let output = match tokio::time::timeout(Duration::from_secs(10), output).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(Error::Setup(format!(
                "The `{}` CLI is not installed or not on PATH.\nInstall it with:\n\n    {}\n",
                binary, INSTALL_HINT
            )));
        }
        Ok(Err(e)) => {
            return Err(Error::Setup(format!(
                "Failed to run `{} --version`: {}. Reinstall with: {}",
                binary, e, INSTALL_HINT
            )))
        }
        Err(_) => {
            return Err(Error::Setup(format!(
                "`{} --version` did not finish within 10s",
                binary
            )))
        }
    };

    let raw = String::from_utf8_lossy(&output.stdout).trim().to_string();
    let version = parse_version(&raw);
    if version.is_none() {
        tracing::warn!(output = %raw, "Could not parse agent version, assuming a recent release");
    }
    let subcommand = select_subcommand(version.as_ref(), &threshold);
    tracing::info!(
        binary,
        version = %raw,
        subcommand,
        "Detected agent binary"
    );
    Ok(AgentVersion {
        raw,
        version,
        subcommand,
    })
}
