//! External reputation probe: runs the probe script, parses its
//! semi-structured output, and extracts the canonical core fields.

use super::{classify, RiskLevel};
use crate::config::Config;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("ip_check.script_path is not configured")]
    ScriptNotConfigured,

    #[error("probe script not found at {path}")]
    ScriptMissing { path: PathBuf },

    #[error("probe script exited with {code}: {stderr}")]
    ScriptFailed { code: i32, stderr: String },

    #[error("empty output from probe script")]
    EmptyOutput,

    #[error("probe output is not valid json")]
    Parse(#[source] serde_json::Error),
}

/// Collaborator contract for reputation probing. `run_full` is the single
/// whole-egress probe; `fraud_score` asks one provider for one IP through a
/// node's own client. `Ok(None)` from `fraud_score` means the provider
/// answered but no score could be parsed.
#[async_trait]
pub trait QualityProbe: Send + Sync {
    async fn run_full(&self) -> Result<Value>;
    async fn fraud_score(&self, client: &reqwest::Client, ip: &str) -> Result<Option<u32>>;
}

/// Canonical core of one probe output.
#[derive(Debug, Clone, Default)]
pub struct QualityCore {
    pub ip: String,
    pub fraud_score: Option<u32>,
    pub risk_level: RiskLevel,
    pub is_proxy: bool,
    pub is_vpn: bool,
    pub is_tor: bool,
    pub country_code: String,
}

/// Score providers in pick order: first present, non-null value wins.
const SCORE_PROVIDERS: [&str; 5] = ["SCAMALYTICS", "IPQS", "IP2LOCATION", "ipapi", "DBIP"];

const SCAMALYTICS_URL: &str = "https://scamalytics.com/ip/";

/// Bash-script-backed probe, plus the per-IP score provider used in TopN runs.
pub struct ScriptProbe {
    config: Arc<RwLock<Config>>,
}

impl ScriptProbe {
    pub fn new(config: Arc<RwLock<Config>>) -> Self {
        Self { config }
    }
}

#[async_trait]
impl QualityProbe for ScriptProbe {
    async fn run_full(&self) -> Result<Value> {
        let script_path = self
            .config
            .read()
            .expect("config lock poisoned")
            .ip_check
            .script_path
            .clone();
        if script_path.is_empty() {
            return Err(ProbeError::ScriptNotConfigured.into());
        }
        let script = resolve_script(&script_path)?;

        let mut cmd = tokio::process::Command::new("bash");
        cmd.arg(&script).args(["-E", "-j", "-n", "-f"]);
        cmd.current_dir(script.parent().unwrap_or(Path::new(".")));
        // The run is bounded by the scheduler's deadline; dropping the future
        // must take the script down with it.
        cmd.kill_on_drop(true);

        let output = cmd.output().await.context("failed to run probe script")?;
        if !output.status.success() {
            return Err(ProbeError::ScriptFailed {
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }
            .into());
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(parse_probe_output(stdout.trim())?)
    }

    async fn fraud_score(&self, client: &reqwest::Client, ip: &str) -> Result<Option<u32>> {
        let body = client
            .get(format!("{SCAMALYTICS_URL}{ip}"))
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        Ok(parse_fraud_score(&body))
    }
}

/// Relative paths resolve against the executable's directory, then its
/// parent.
fn resolve_script(path: &str) -> Result<PathBuf, ProbeError> {
    let p = Path::new(path);
    let resolved = if p.is_absolute() {
        p.to_path_buf()
    } else {
        let exe_dir = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf))
            .unwrap_or_else(|| PathBuf::from("."));
        let primary = exe_dir.join(p);
        if primary.exists() {
            primary
        } else {
            let fallback = exe_dir.join("..").join(p);
            if fallback.exists() {
                fallback
            } else {
                primary
            }
        }
    };
    if resolved.exists() {
        Ok(resolved)
    } else {
        Err(ProbeError::ScriptMissing { path: resolved })
    }
}

/// Parse the script's stdout. Some script versions print banners before the
/// JSON document, so retry from the first brace.
pub fn parse_probe_output(raw: &str) -> Result<Value, ProbeError> {
    if raw.is_empty() {
        return Err(ProbeError::EmptyOutput);
    }
    match serde_json::from_str(raw) {
        Ok(v) => Ok(v),
        Err(e) => {
            if let Some(idx) = raw.find('{') {
                if let Ok(v) = serde_json::from_str(&raw[idx..]) {
                    return Ok(v);
                }
            }
            Err(ProbeError::Parse(e))
        }
    }
}

/// Extract the canonical core from the permissive probe output.
///
/// The shape is loosely typed: every section is an array of objects with
/// optional fields. Extraction is first-element, pick-first-present; a score
/// only counts as measured when it actually parses.
pub fn extract_core(res: &Value) -> QualityCore {
    let first = |key: &str| {
        res.get(key)
            .and_then(Value::as_array)
            .and_then(|a| a.first())
    };

    let mut core = QualityCore::default();

    if let Some(head) = first("Head") {
        core.ip = head
            .get("IP")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
    }

    if let Some(info) = first("Info") {
        core.country_code = info
            .get("Region")
            .and_then(|r| r.get("Code"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
    }

    if let Some(score) = first("Score") {
        for provider in SCORE_PROVIDERS {
            let Some(s) = score.get(provider).and_then(Value::as_str) else {
                continue;
            };
            if s.is_empty() || s.eq_ignore_ascii_case("null") {
                continue;
            }
            core.fraud_score = s.trim().trim_end_matches('%').parse::<u32>().ok();
            break;
        }
    }
    core.risk_level = classify(core.fraud_score);

    if let Some(factor) = first("Factor") {
        let any_true = |section: &str| {
            factor
                .get(section)
                .and_then(Value::as_object)
                .is_some_and(|m| m.values().any(truthy))
        };
        core.is_proxy = any_true("Proxy");
        core.is_vpn = any_true("VPN");
        core.is_tor = any_true("Tor");
    }

    core
}

fn truthy(v: &Value) -> bool {
    match v {
        Value::Bool(b) => *b,
        Value::String(s) => matches!(s.to_ascii_lowercase().as_str(), "true" | "1" | "yes"),
        _ => false,
    }
}

/// Pull the fraud score out of the provider's HTML response.
pub fn parse_fraud_score(body: &str) -> Option<u32> {
    let idx = body.find("Fraud Score:")?;
    let digits: String = body[idx..]
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_probe_output_plain_json() {
        let v = parse_probe_output(r#"{"Head":[{"IP":"1.2.3.4"}]}"#).unwrap();
        assert_eq!(v["Head"][0]["IP"], "1.2.3.4");
    }

    #[test]
    fn test_parse_probe_output_skips_leading_banner() {
        let v = parse_probe_output("checking connectivity...\ndone\n{\"Head\":[]}").unwrap();
        assert!(v["Head"].is_array());
    }

    #[test]
    fn test_parse_probe_output_empty_is_error() {
        assert!(matches!(
            parse_probe_output(""),
            Err(ProbeError::EmptyOutput)
        ));
    }

    #[test]
    fn test_parse_probe_output_garbage_is_error() {
        assert!(matches!(
            parse_probe_output("no json here"),
            Err(ProbeError::Parse(_))
        ));
    }

    #[test]
    fn test_extract_core_full_output() {
        let res = json!({
            "Head": [{"IP": "203.0.113.9"}],
            "Info": [{"Region": {"Code": "NL"}}],
            "Score": [{"SCAMALYTICS": "42"}],
            "Factor": [{
                "Proxy": {"a": false, "b": "yes"},
                "VPN": {"x": false},
                "Tor": {"y": "true"}
            }]
        });
        let core = extract_core(&res);
        assert_eq!(core.ip, "203.0.113.9");
        assert_eq!(core.country_code, "NL");
        assert_eq!(core.fraud_score, Some(42));
        assert_eq!(core.risk_level, RiskLevel::Medium);
        assert!(core.is_proxy);
        assert!(!core.is_vpn);
        assert!(core.is_tor);
    }

    #[test]
    fn test_extract_core_provider_precedence() {
        // SCAMALYTICS explicitly null: the next provider wins.
        let res = json!({
            "Score": [{"SCAMALYTICS": "null", "IPQS": "80", "DBIP": "1"}]
        });
        let core = extract_core(&res);
        assert_eq!(core.fraud_score, Some(80));
        assert_eq!(core.risk_level, RiskLevel::VeryHigh);
    }

    #[test]
    fn test_extract_core_unparseable_score_is_unknown() {
        // Provider present but value not numeric: measured-nothing, not zero.
        let res = json!({"Score": [{"SCAMALYTICS": "n/a"}]});
        let core = extract_core(&res);
        assert_eq!(core.fraud_score, None);
        assert_eq!(core.risk_level, RiskLevel::Unknown);
    }

    #[test]
    fn test_extract_core_measured_zero_is_very_low() {
        let res = json!({"Score": [{"SCAMALYTICS": "0%"}]});
        let core = extract_core(&res);
        assert_eq!(core.fraud_score, Some(0));
        assert_eq!(core.risk_level, RiskLevel::VeryLow);
    }

    #[test]
    fn test_extract_core_missing_sections() {
        let core = extract_core(&json!({}));
        assert!(core.ip.is_empty());
        assert_eq!(core.risk_level, RiskLevel::Unknown);
        assert!(!core.is_proxy);
    }

    #[test]
    fn test_parse_fraud_score_from_html() {
        let body = "<div>Fraud Score: 87</div>";
        assert_eq!(parse_fraud_score(body), Some(87));
        assert_eq!(parse_fraud_score("<div>nothing here</div>"), None);
    }

    #[test]
    fn test_resolve_script_absolute_missing() {
        let err = resolve_script("/definitely/not/here.sh").unwrap_err();
        assert!(matches!(err, ProbeError::ScriptMissing { .. }));
    }
}
