use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use pingora::http::ResponseHeader;
use pingora::prelude::*;
use pingora::server::RunArgs;
use pingora::server::Server as PingoraServer;
use pingora::server::configuration::Opt;
use pingora::services::background::{BackgroundService, GenBackgroundService};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

use crate::clock::MonotonicClock;
use crate::configuration::GatewayConfig;
use crate::gate::{Denial, Gate, GateStats, Grant, Outcome};
use crate::metric::{Counts, Metrics, UNKNOWN_KEY};
use crate::store::SecretStore;

pub const HEALTH_PATH: &str = "/healthz";
pub const AUTHORIZATION_PATH: &str = "/authorization";
pub const VALIDATE_PATH: &str = "/validate";
pub const USAGE_PATH: &str = "/usage";
pub const METRICS_PATH: &str = "/metrics";

/// Bodies larger than this are refused with 413.
pub const MAX_BODY_BYTES: usize = 64 * 1024;
/// Seconds a rate limited caller is told to wait.
pub const RETRY_AFTER_SECS: u64 = 60;

const MISSING_TOKEN: &str = "missing_token";

// ============================================================================
// Wire models
// ============================================================================

#[derive(Debug, Deserialize)]
struct TokenRequest {
    #[serde(default)]
    token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct TokenUsage {
    #[serde(default)]
    total_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct UsageReport {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    usage: Option<TokenUsage>,
}

#[derive(Debug, Serialize)]
struct Wallet {
    total_balance: u64,
    total_used: u64,
}

#[derive(Debug, Serialize)]
struct User {
    user_id: String,
    full_name: String,
    wallet: Wallet,
}

#[derive(Debug, Serialize)]
struct AuthResponse {
    data: User,
}

impl From<Grant> for AuthResponse {
    fn from(grant: Grant) -> Self {
        let user_id = format!("user_{}", grant.key_id);
        Self {
            data: User {
                full_name: user_id.clone(),
                user_id,
                wallet: Wallet {
                    total_balance: grant.balance,
                    total_used: grant.used,
                },
            },
        }
    }
}

#[derive(Debug, Serialize)]
struct MetricsReport {
    keys: BTreeMap<String, Counts>,
    state: GateStats,
}

#[derive(Debug, Serialize)]
struct Detail<'a> {
    detail: &'a str,
}

// ============================================================================
// Routing
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Health,
    Authorize,
    Usage,
    Metrics,
}

impl Route {
    fn from_path(path: &str) -> Option<Self> {
        match path {
            HEALTH_PATH => Some(Route::Health),
            AUTHORIZATION_PATH | VALIDATE_PATH => Some(Route::Authorize),
            USAGE_PATH => Some(Route::Usage),
            METRICS_PATH => Some(Route::Metrics),
            _ => None,
        }
    }

    fn method(&self) -> &'static str {
        match self {
            Route::Health | Route::Metrics => "GET",
            Route::Authorize | Route::Usage => "POST",
        }
    }
}

/// Check an `Authorization: Bearer <key>` header against the dashboard key.
fn check_dashboard_key(header: Option<&str>, expected: &str) -> Result<(), &'static str> {
    let header = header.ok_or("Missing Authorization header")?;
    let (scheme, token) = header.split_once(' ').unwrap_or((header, ""));
    let token = token.trim();
    if !scheme.eq_ignore_ascii_case("bearer") || token.is_empty() {
        return Err("Invalid Authorization header");
    }
    if !bool::from(token.as_bytes().ct_eq(expected.as_bytes())) {
        return Err("Invalid dashboard API key");
    }
    Ok(())
}

fn denial_status(denial: &Denial) -> (u16, &'static str) {
    match denial {
        Denial::InvalidToken => (401, "Invalid API key"),
        Denial::BackendUnavailable => (503, "Auth backend unavailable"),
        Denial::RateLimited => (429, "Rate limit exceeded"),
        Denial::QuotaExhausted(_) => (402, "Out of quota"),
    }
}

fn encode<T: Serialize>(body: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(body).map_err(|e| {
        Error::explain(
            ErrorType::InternalError,
            format!("failed to encode response: {e}"),
        )
    })
}

fn blank(token: Option<&str>) -> bool {
    token.is_none_or(|t| t.trim().is_empty())
}

// ============================================================================
// HTTP service
// ============================================================================

/// Answers every request from `request_filter`; nothing is proxied upstream.
pub struct AuthService {
    gate: Arc<Gate>,
    dashboard_api_key: String,
}

impl AuthService {
    pub fn new(gate: Arc<Gate>, dashboard_api_key: String) -> Self {
        Self {
            gate,
            dashboard_api_key,
        }
    }

    async fn respond(
        session: &mut Session,
        status: u16,
        body: Vec<u8>,
        retry_after: Option<u64>,
    ) -> Result<bool> {
        let mut header = ResponseHeader::build(status, None)?;
        header.insert_header("Content-Type", "application/json")?;
        header.insert_header("Content-Length", body.len().to_string())?;
        if let Some(secs) = retry_after {
            header.insert_header("Retry-After", secs.to_string())?;
        }
        session
            .write_response_header(Box::new(header), false)
            .await?;
        session
            .write_response_body(Some(Bytes::from(body)), true)
            .await?;
        Ok(true)
    }

    async fn respond_json<T: Serialize>(session: &mut Session, status: u16, body: &T) -> Result<bool> {
        Self::respond(session, status, encode(body)?, None).await
    }

    async fn respond_health(session: &mut Session) -> Result<bool> {
        Self::respond(session, 200, br#"{"status":"ok"}"#.to_vec(), None).await
    }

    async fn respond_detail(session: &mut Session, status: u16, detail: &str) -> Result<bool> {
        Self::respond_json(session, status, &Detail { detail }).await
    }

    /// Read the request body, or `None` if it exceeds `MAX_BODY_BYTES`.
    ///
    /// An oversized body is still read to the end, without keeping it, so the
    /// error response is not cut off by a reset connection.
    async fn read_body(session: &mut Session) -> Result<Option<Vec<u8>>> {
        let mut body = Some(Vec::new());
        while let Some(chunk) = session.read_request_body().await? {
            if let Some(buf) = body.as_mut() {
                if buf.len() + chunk.len() > MAX_BODY_BYTES {
                    body = None;
                } else {
                    buf.extend_from_slice(&chunk);
                }
            }
        }
        Ok(body)
    }

    fn metrics_report(&self) -> MetricsReport {
        MetricsReport {
            keys: self.gate.metrics().summary(),
            state: self.gate.stats(),
        }
    }

    async fn respond_outcome(session: &mut Session, outcome: Outcome) -> Result<bool> {
        match outcome {
            Ok(grant) => Self::respond_json(session, 200, &AuthResponse::from(grant)).await,
            Err(denial) => {
                let (status, detail) = denial_status(&denial);
                let retry_after = matches!(denial, Denial::RateLimited).then_some(RETRY_AFTER_SECS);
                Self::respond(session, status, encode(&Detail { detail })?, retry_after).await
            }
        }
    }

    fn missing_token(&self) {
        self.gate.metrics().record(UNKNOWN_KEY, MISSING_TOKEN);
    }
}

#[async_trait]
impl ProxyHttp for AuthService {
    type CTX = ();

    fn new_ctx(&self) -> Self::CTX {}

    async fn request_filter(&self, session: &mut Session, _ctx: &mut Self::CTX) -> Result<bool>
    where
        Self::CTX: Send + Sync,
    {
        let path = session.req_header().uri.path().to_string();
        let Some(route) = Route::from_path(&path) else {
            session.drain_request_body().await?;
            return Self::respond_detail(session, 404, "Not found").await;
        };
        if session.req_header().method.as_str() != route.method() {
            session.drain_request_body().await?;
            return Self::respond_detail(session, 405, "Method Not Allowed").await;
        }
        if route == Route::Health {
            return Self::respond_health(session).await;
        }

        let auth = session
            .req_header()
            .headers
            .get("authorization")
            .and_then(|v| v.to_str().ok());
        if let Err(detail) = check_dashboard_key(auth, &self.dashboard_api_key) {
            log::debug!("{path}: {detail}");
            session.drain_request_body().await?;
            return Self::respond_detail(session, 401, detail).await;
        }

        let Some(body) = Self::read_body(session).await? else {
            log::debug!("{path}: body over {MAX_BODY_BYTES} bytes");
            return Self::respond_detail(session, 413, "Request body too large").await;
        };

        let outcome = match route {
            Route::Authorize => {
                let Ok(request) = serde_json::from_slice::<TokenRequest>(&body) else {
                    return Self::respond_detail(session, 400, "Invalid JSON body").await;
                };
                if blank(request.token.as_deref()) {
                    self.missing_token();
                    return Self::respond_detail(session, 401, "Missing API key").await;
                }
                self.gate
                    .authorize(request.token.as_deref().unwrap_or_default())
                    .await
            }
            Route::Usage => {
                let Ok(report) = serde_json::from_slice::<UsageReport>(&body) else {
                    return Self::respond_detail(session, 400, "Invalid JSON body").await;
                };
                if blank(report.token.as_deref()) {
                    self.missing_token();
                    return Self::respond_detail(session, 401, "Missing API key").await;
                }
                let tokens = report.usage.unwrap_or_default().total_tokens;
                self.gate
                    .report_usage(report.token.as_deref().unwrap_or_default(), tokens)
                    .await
            }
            Route::Metrics => return Self::respond_json(session, 200, &self.metrics_report()).await,
            Route::Health => return Self::respond_health(session).await,
        };

        Self::respond_outcome(session, outcome).await
    }

    async fn upstream_peer(
        &self,
        _session: &mut Session,
        _ctx: &mut Self::CTX,
    ) -> Result<Box<HttpPeer>> {
        Err(Error::explain(
            ErrorType::HTTPStatus(500),
            "auth gateway has no upstream",
        ))
    }
}

// ============================================================================
// Background cache sweep
// ============================================================================

/// Periodically runs [`Gate::housekeep`]: expired secret cache entries, idle
/// rate windows and stale metric buckets.
pub struct CacheSweeper {
    gate: Arc<Gate>,
    interval: Duration,
}

impl CacheSweeper {
    pub fn new(gate: Arc<Gate>, interval: Duration) -> Self {
        Self { gate, interval }
    }

    fn sweep(&self) {
        let swept = self.gate.housekeep();
        let stats = self.gate.stats();
        log::debug!(
            "housekeeping removed {} secrets, {} rate windows, {} metric keys; \
             now {} cached secrets, {} ledger keys, {} rate windows",
            swept.expired_secrets,
            swept.idle_windows,
            swept.idle_metric_keys,
            stats.cached_secrets,
            stats.ledger_keys,
            stats.rate_limited_keys,
        );
    }
}

#[async_trait]
impl BackgroundService for CacheSweeper {
    async fn start(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                return;
            }

            tokio::select! {
                _ = shutdown.changed() => {
                    return;
                }
                _ = tokio::time::sleep(self.interval) => {
                    self.sweep();
                }
            }
        }
    }
}

// ============================================================================
// Server wrapper
// ============================================================================

pub struct Server {
    server: PingoraServer,
}

impl Server {
    pub fn new(opt: Option<Opt>) -> Result<Self> {
        let server = PingoraServer::new(opt)?;
        Ok(Server { server })
    }

    /// Build a ready-to-run server for a validated config. `opt` carries
    /// pingora's own command line settings (threads, daemon, conf file).
    pub fn start(
        config: &GatewayConfig,
        store: Arc<dyn SecretStore>,
        metrics: Arc<Metrics>,
        opt: Option<Opt>,
    ) -> Result<Self> {
        let gate = Arc::new(Gate::from_config(
            config,
            store,
            Arc::new(MonotonicClock),
            metrics,
        ));
        let mut server = Server::new(opt)?;
        server.bootstrap(config, gate)?;
        Ok(server)
    }

    pub fn bootstrap(&mut self, config: &GatewayConfig, gate: Arc<Gate>) -> Result<()> {
        self.server.bootstrap();

        let sweeper = CacheSweeper::new(gate.clone(), config.cache_sweep_interval());
        let background =
            GenBackgroundService::new("secret cache sweeper".to_string(), Arc::new(sweeper));
        self.server.add_service(background);

        let listen_addr = config.listen_addr();
        let mut auth_service = http_proxy_service(
            &self.server.configuration,
            AuthService::new(gate, config.dashboard_api_key.clone()),
        );
        auth_service.add_tcp(&listen_addr);
        self.server.add_service(auth_service);

        log::info!("auth gateway listening on {listen_addr}");
        Ok(())
    }

    pub fn run_forever(self) {
        self.server.run_forever();
    }

    pub fn run(self, args: RunArgs) {
        self.server.run(args);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemorySecretStore;

    #[test]
    fn routes_by_exact_path() {
        assert_eq!(Route::from_path("/healthz"), Some(Route::Health));
        assert_eq!(Route::from_path("/authorization"), Some(Route::Authorize));
        assert_eq!(Route::from_path("/validate"), Some(Route::Authorize));
        assert_eq!(Route::from_path("/usage"), Some(Route::Usage));
        assert_eq!(Route::from_path("/metrics"), Some(Route::Metrics));
        assert_eq!(Route::Metrics.method(), "GET");
        assert_eq!(Route::from_path("/usage/extra"), None);
        assert_eq!(Route::from_path("/"), None);
    }

    #[test]
    fn dashboard_key_checks() {
        assert_eq!(
            check_dashboard_key(None, "dash"),
            Err("Missing Authorization header")
        );
        assert_eq!(
            check_dashboard_key(Some("Basic dash"), "dash"),
            Err("Invalid Authorization header")
        );
        assert_eq!(
            check_dashboard_key(Some("Bearer   "), "dash"),
            Err("Invalid Authorization header")
        );
        assert_eq!(
            check_dashboard_key(Some("Bearer"), "dash"),
            Err("Invalid Authorization header")
        );
        assert_eq!(
            check_dashboard_key(Some("Bearer nope"), "dash"),
            Err("Invalid dashboard API key")
        );
        assert_eq!(check_dashboard_key(Some("Bearer dash"), "dash"), Ok(()));
        assert_eq!(check_dashboard_key(Some("bearer  dash "), "dash"), Ok(()));
    }

    #[test]
    fn denials_map_to_statuses() {
        assert_eq!(denial_status(&Denial::InvalidToken).0, 401);
        assert_eq!(denial_status(&Denial::BackendUnavailable).0, 503);
        assert_eq!(denial_status(&Denial::RateLimited).0, 429);
        let grant = Grant {
            key_id: "abc123".to_string(),
            balance: 0,
            used: 10,
        };
        assert_eq!(
            denial_status(&Denial::QuotaExhausted(grant)),
            (402, "Out of quota")
        );
    }

    #[test]
    fn grant_renders_user_payload() {
        let grant = Grant {
            key_id: "abc123".to_string(),
            balance: 60,
            used: 40,
        };
        let json = serde_json::to_value(AuthResponse::from(grant)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "data": {
                    "user_id": "user_abc123",
                    "full_name": "user_abc123",
                    "wallet": {"total_balance": 60, "total_used": 40}
                }
            })
        );
    }

    #[test]
    fn usage_report_tolerates_missing_and_extra_fields() {
        let report: UsageReport =
            serde_json::from_str(r#"{"token":"t","model":"gpt","usage":{"total_tokens":7,"prompt_tokens":3}}"#)
                .unwrap();
        assert_eq!(report.usage.unwrap_or_default().total_tokens, 7);

        let report: UsageReport = serde_json::from_str(r#"{"token":"t"}"#).unwrap();
        assert!(report.usage.is_none());

        assert!(blank(None));
        assert!(blank(Some("  ")));
        assert!(!blank(Some("x")));
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_evicts_and_stops_on_shutdown() {
        let clock = Arc::new(ManualClock::new());
        let config = GatewayConfig {
            dashboard_api_key: "dash".to_string(),
            rate_limit_per_minute: 5,
            ..GatewayConfig::default()
        };
        let gate = Arc::new(Gate::from_config(
            &config,
            Arc::new(MemorySecretStore::new()),
            clock.clone(),
            Arc::new(Metrics::new()),
        ));
        // unknown key: absence is cached, no rate window is opened
        assert!(gate.authorize("azjina_abc123_s3cr3t").await.is_err());
        assert_eq!(gate.stats().cached_secrets, 1);
        clock.advance(Duration::from_secs(301));

        let sweeper = Arc::new(CacheSweeper::new(gate.clone(), Duration::from_secs(60)));
        let (tx, rx) = tokio::sync::watch::channel(false);
        let handle = tokio::spawn({
            let sweeper = sweeper.clone();
            async move { sweeper.start(rx).await }
        });

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(gate.stats().cached_secrets, 0);

        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
