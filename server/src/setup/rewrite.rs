// URL rewrite detection
//
// The site probes itself with `HEAD {domain}{web_root}entry`. A clean URL that reaches
// the application (200/302 plus the version header) means rewriting works. When no
// HTTP client is usable the local web server's module list is consulted instead.

use async_trait::async_trait;
use log::{debug, info, warn};
use reqwest::StatusCode;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::utils::command::run_cmd_with_timeout;

pub const VERSION_HEADER: &str = "X-Garden-Version";
pub const PROBE_PATH: &str = "entry";
pub const REWRITE_MODULE: &str = "rewrite_module";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResponse {
    pub status: u16,
    /// Header names lowercased.
    pub headers: BTreeMap<String, String>,
}

impl ProbeResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    /// No HTTP client capability for this URL.
    #[error("HTTP probing is not available: {0}")]
    Unsupported(String),

    #[error("HTTP probe failed: {0}")]
    Failed(String),
}

#[async_trait]
pub trait HttpProbe: Send + Sync {
    async fn head(&self, url: &str) -> Result<ProbeResponse, ProbeError>;
}

#[async_trait]
pub trait ServerModules: Send + Sync {
    /// Loaded web-server modules, or `None` when they cannot be listed.
    async fn loaded_modules(&self) -> Option<Vec<String>>;
}

pub struct ReqwestProbe {
    client: Option<reqwest::Client>,
}

impl ReqwestProbe {
    pub fn new(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| {
                warn!(
                    "[PHASE: setup] [STEP: rewrite_probe] HTTP client unavailable: {}",
                    e
                )
            })
            .ok();
        Self { client }
    }
}

#[async_trait]
impl HttpProbe for ReqwestProbe {
    async fn head(&self, url: &str) -> Result<ProbeResponse, ProbeError> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| ProbeError::Unsupported("no HTTP client".to_string()))?;

        let parsed = url::Url::parse(url).map_err(|e| ProbeError::Failed(e.to_string()))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ProbeError::Unsupported(format!(
                "scheme '{}'",
                parsed.scheme()
            )));
        }

        let resp = client
            .head(parsed)
            .send()
            .await
            .map_err(|e| ProbeError::Failed(e.to_string()))?;

        let headers = resp
            .headers()
            .iter()
            .filter_map(|(k, v)| {
                v.to_str()
                    .ok()
                    .map(|v| (k.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();

        Ok(ProbeResponse {
            status: resp.status().as_u16(),
            headers,
        })
    }
}

/// Lists modules with `apachectl -M`.
pub struct ApacheModules {
    timeout: Duration,
}

impl ApacheModules {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

/// Module names from `apachectl -M` output (`rewrite_module (shared)` lines).
pub fn parse_module_list(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| {
            let name = line.split_whitespace().next()?;
            name.ends_with("_module").then(|| name.to_string())
        })
        .collect()
}

#[async_trait]
impl ServerModules for ApacheModules {
    async fn loaded_modules(&self) -> Option<Vec<String>> {
        let program = which::which("apachectl")
            .or_else(|_| which::which("apache2ctl"))
            .ok()?;
        let program = program.to_string_lossy().to_string();

        match run_cmd_with_timeout(&program, &["-M".to_string()], self.timeout).await {
            Ok(out) if out.success() => Some(parse_module_list(&out.stdout)),
            Ok(out) => {
                debug!(
                    "[PHASE: setup] [STEP: rewrite_modules] Module listing exited with {:?}",
                    out.exit_code
                );
                None
            }
            Err(e) => {
                warn!(
                    "[PHASE: setup] [STEP: rewrite_modules] Module listing failed: {:#}",
                    e
                );
                None
            }
        }
    }
}

pub fn probe_url(domain: &str, web_root: &str) -> String {
    format!("{}{}{}", domain.trim_end_matches('/'), web_root, PROBE_PATH)
}

pub fn probe_indicates_rewrite(resp: &ProbeResponse) -> bool {
    let status_ok = resp.status == StatusCode::OK.as_u16() || resp.status == StatusCode::FOUND.as_u16();
    status_ok && resp.header(VERSION_HEADER).is_some()
}

pub async fn detect_rewrite_support(
    probe: &dyn HttpProbe,
    modules: &dyn ServerModules,
    domain: &str,
    web_root: &str,
) -> bool {
    let url = probe_url(domain, web_root);
    let supported = match probe.head(&url).await {
        Ok(resp) => probe_indicates_rewrite(&resp),
        Err(ProbeError::Unsupported(reason)) => {
            debug!(
                "[PHASE: setup] [STEP: rewrite] Probe unsupported ({}); checking server modules",
                reason
            );
            modules
                .loaded_modules()
                .await
                .map(|m| m.iter().any(|name| name == REWRITE_MODULE))
                .unwrap_or(false)
        }
        Err(ProbeError::Failed(reason)) => {
            warn!("[PHASE: setup] [STEP: rewrite] Probe failed: {}", reason);
            false
        }
    };

    info!(
        "[PHASE: setup] [STEP: rewrite] Rewrite support detected={} (url={})",
        supported, url
    );
    supported
}

#[cfg(test)]
mod tests {
    use super::*;

    enum FixedProbe {
        Respond(ProbeResponse),
        Unsupported,
        Failed,
    }

    #[async_trait]
    impl HttpProbe for FixedProbe {
        async fn head(&self, _url: &str) -> Result<ProbeResponse, ProbeError> {
            match self {
                FixedProbe::Respond(r) => Ok(r.clone()),
                FixedProbe::Unsupported => Err(ProbeError::Unsupported("test".into())),
                FixedProbe::Failed => Err(ProbeError::Failed("connection refused".into())),
            }
        }
    }

    struct FixedModules(Option<Vec<String>>);

    #[async_trait]
    impl ServerModules for FixedModules {
        async fn loaded_modules(&self) -> Option<Vec<String>> {
            self.0.clone()
        }
    }

    fn response(status: u16, with_header: bool) -> ProbeResponse {
        let mut headers = BTreeMap::new();
        if with_header {
            headers.insert("x-garden-version".to_string(), "2.0".to_string());
        }
        ProbeResponse { status, headers }
    }

    #[test]
    fn probe_url_joins_domain_and_root() {
        assert_eq!(probe_url("http://forum.example.com", "/"), "http://forum.example.com/entry");
        assert_eq!(probe_url("http://localhost:8080/", "/forum/"), "http://localhost:8080/forum/entry");
    }

    #[test]
    fn parses_apachectl_output() {
        let out = "Loaded Modules:\n core_module (static)\n rewrite_module (shared)\n php_module (shared)\n";
        assert_eq!(parse_module_list(out), vec!["core_module", "rewrite_module", "php_module"]);
    }

    #[tokio::test]
    async fn ok_with_version_header_is_supported() {
        let probe = FixedProbe::Respond(response(200, true));
        assert!(detect_rewrite_support(&probe, &FixedModules(None), "http://h", "/").await);
    }

    #[tokio::test]
    async fn redirect_with_version_header_is_supported() {
        let probe = FixedProbe::Respond(response(302, true));
        assert!(detect_rewrite_support(&probe, &FixedModules(None), "http://h", "/").await);
    }

    #[tokio::test]
    async fn missing_header_or_bad_status_is_unsupported() {
        let no_header = FixedProbe::Respond(response(200, false));
        assert!(!detect_rewrite_support(&no_header, &FixedModules(None), "http://h", "/").await);

        let not_found = FixedProbe::Respond(response(404, true));
        assert!(!detect_rewrite_support(&not_found, &FixedModules(None), "http://h", "/").await);
    }

    #[tokio::test]
    async fn unsupported_probe_falls_back_to_modules() {
        let probe = FixedProbe::Unsupported;
        let with_rewrite = FixedModules(Some(vec!["core_module".into(), "rewrite_module".into()]));
        assert!(detect_rewrite_support(&probe, &with_rewrite, "http://h", "/").await);

        let without = FixedModules(Some(vec!["core_module".into()]));
        assert!(!detect_rewrite_support(&probe, &without, "http://h", "/").await);

        assert!(!detect_rewrite_support(&probe, &FixedModules(None), "http://h", "/").await);
    }

    #[tokio::test]
    async fn failed_probe_does_not_consult_modules() {
        let probe = FixedProbe::Failed;
        let with_rewrite = FixedModules(Some(vec!["rewrite_module".into()]));
        assert!(!detect_rewrite_support(&probe, &with_rewrite, "http://h", "/").await);
    }

    #[tokio::test]
    async fn non_http_scheme_is_unsupported() {
        let probe = ReqwestProbe::new(Duration::from_secs(1));
        let err = probe.head("ftp://forum.example.com/entry").await.unwrap_err();
        assert!(matches!(err, ProbeError::Unsupported(_)));
    }
}
