//! LibreLinkUp Client Module
//!
//! Handles HTTP communication with the LibreLinkUp follower API.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{info, debug, warn};

use crate::auth::Credentials;
use crate::client::{ClientError, GlucoseClient, GlucoseData};
use crate::model::{HistoryPoint, Reading, Trend};

pub const DEFAULT_BASE_URL: &str = "https://api.libreview.io";

const PRODUCT: &str = "llu.android";
const TIMESTAMP_FORMAT: &str = "%m/%d/%Y %I:%M:%S %p";
const MAX_REDIRECTS: usize = 2;
// Renew the ticket slightly before the server considers it expired
const TICKET_MARGIN_SECS: i64 = 60;

/// API client for the LibreLinkUp service
pub struct LibreLinkClient {
    base_url: String,
    client: reqwest::Client,
    ticket: Mutex<Option<AuthTicket>>,
}

#[derive(Debug, Clone)]
struct AuthTicket {
    credentials: Credentials,
    base_url: String,
    token: String,
    account_id: String,
    expires_at: DateTime<Utc>,
}

impl AuthTicket {
    fn is_valid_for(&self, credentials: &Credentials, now: DateTime<Utc>) -> bool {
        self.credentials == *credentials
            && now + chrono::Duration::seconds(TICKET_MARGIN_SECS) < self.expires_at
    }
}

impl LibreLinkClient {
    /// Create a new API client
    pub fn new(base_url: &str, timeout: std::time::Duration) -> Result<Self, ClientError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ClientError::Transport(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            ticket: Mutex::new(None),
        })
    }

    fn request(&self, method: Method, url: &str, version: &str) -> RequestBuilder {
        self.client
            .request(method, url)
            .header("product", PRODUCT)
            .header("version", version)
            .header("accept", "application/json")
            .header("cache-control", "no-cache")
    }

    /// Return a cached ticket for these credentials or log in again
    async fn ticket_for(&self, credentials: &Credentials) -> Result<AuthTicket, ClientError> {
        let mut cached = self.ticket.lock().await;

        if let Some(ticket) = cached.as_ref() {
            if ticket.is_valid_for(credentials, Utc::now()) {
                return Ok(ticket.clone());
            }
        }

        let ticket = self.login(credentials).await?;
        *cached = Some(ticket.clone());
        Ok(ticket)
    }

    async fn forget_ticket(&self) {
        *self.ticket.lock().await = None;
    }

    /// Log in, following at most one regional redirect
    async fn login(&self, credentials: &Credentials) -> Result<AuthTicket, ClientError> {
        let mut base_url = self.base_url.clone();

        for _ in 0..MAX_REDIRECTS {
            let url = format!("{}/llu/auth/login", base_url);
            debug!("Logging in at: {}", url);

            let response = self
                .request(Method::POST, &url, &credentials.protocol_version)
                .json(&LoginRequest {
                    email: &credentials.username,
                    password: &credentials.password,
                })
                .send()
                .await?;

            if !response.status().is_success() {
                return Err(ClientError::Transport(format!("Status: {}", response.status())));
            }

            let body = response
                .json::<LoginResponse>()
                .await
                .map_err(|e| ClientError::Transport(e.to_string()))?;

            match interpret_login(body)? {
                LoginOutcome::Redirect(region) => {
                    info!("Login redirected to region: {}", region);
                    base_url = regional_base_url(&region);
                }
                LoginOutcome::Ticket { token, user_id, expires_at } => {
                    info!("Logged in to LibreLinkUp");
                    return Ok(AuthTicket {
                        credentials: credentials.clone(),
                        base_url,
                        account_id: account_id(&user_id),
                        token,
                        expires_at,
                    });
                }
            }
        }

        Err(ClientError::Transport("Too many login redirects".into()))
    }

    /// GET an authenticated endpoint and unwrap its `data` field
    async fn get_data<T: DeserializeOwned>(
        &self,
        ticket: &AuthTicket,
        path: &str,
    ) -> Result<T, ClientError> {
        let url = format!("{}{}", ticket.base_url, path);

        let response = self
            .request(Method::GET, &url, &ticket.credentials.protocol_version)
            .header("Authorization", format!("Bearer {}", ticket.token))
            .header("Account-Id", &ticket.account_id)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            warn!("Auth ticket rejected, logging in again on next read");
            self.forget_ticket().await;
            return Err(ClientError::Transport(format!("Status: {}", status)));
        }
        if !status.is_success() {
            return Err(ClientError::Transport(format!("Status: {}", status)));
        }

        let envelope = response
            .json::<Envelope<T>>()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;

        if envelope.status != 0 {
            return Err(ClientError::Transport(format!("API status {}", envelope.status)));
        }

        envelope
            .data
            .ok_or_else(|| ClientError::Transport(format!("Empty response from {}", path)))
    }
}

impl GlucoseClient for LibreLinkClient {
    async fn read(&self, credentials: &Credentials) -> Result<GlucoseData, ClientError> {
        let ticket = self.ticket_for(credentials).await?;

        let connections: Vec<Connection> = self.get_data(&ticket, "/llu/connections").await?;
        let patient_id = connections
            .into_iter()
            .next()
            .map(|c| c.patient_id)
            .ok_or_else(|| ClientError::Transport("Account has no connections".into()))?;

        let graph: GraphData = self
            .get_data(&ticket, &format!("/llu/connections/{}/graph", patient_id))
            .await?;

        let data = graph_to_data(graph);
        debug!("Read glucose: current={:?} history={}", data.current, data.history.len());
        Ok(data)
    }
}

fn regional_base_url(region: &str) -> String {
    format!("https://api-{}.libreview.io", region)
}

/// Value of the `Account-Id` header: hex SHA-256 of the user id
fn account_id(user_id: &str) -> String {
    Sha256::digest(user_id.as_bytes())
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

#[derive(Debug, PartialEq)]
enum LoginOutcome {
    Redirect(String),
    Ticket {
        token: String,
        user_id: String,
        expires_at: DateTime<Utc>,
    },
}

fn interpret_login(body: LoginResponse) -> Result<LoginOutcome, ClientError> {
    match body.status {
        0 => {}
        2 => {
            let message = body
                .error
                .map(|e| e.message)
                .unwrap_or_else(|| "Bad credentials".to_string());
            return Err(ClientError::Authentication(message));
        }
        other => {
            let message = body.error.map(|e| e.message).unwrap_or_default();
            return Err(ClientError::Transport(format!(
                "Login rejected with status {} {}",
                other, message
            )));
        }
    }

    let data = body
        .data
        .ok_or_else(|| ClientError::Transport("Login response without data".into()))?;

    if data.redirect {
        let region = data
            .region
            .ok_or_else(|| ClientError::Transport("Redirect without region".into()))?;
        return Ok(LoginOutcome::Redirect(region));
    }

    match (data.user, data.auth_ticket) {
        (Some(user), Some(ticket)) => {
            let expires_at = Utc
                .timestamp_opt(ticket.expires, 0)
                .single()
                .unwrap_or_else(Utc::now);
            Ok(LoginOutcome::Ticket {
                token: ticket.token,
                user_id: user.id,
                expires_at,
            })
        }
        _ => Err(ClientError::Transport("Login response without ticket".into())),
    }
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(raw, TIMESTAMP_FORMAT)
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}

fn graph_to_data(graph: GraphData) -> GlucoseData {
    let current = graph
        .connection
        .and_then(|c| c.glucose_measurement)
        .map(|m| Reading {
            value: m.value_in_mg_per_dl,
            trend: m.trend_arrow.map(Trend::from_arrow_code).unwrap_or(Trend::NotComputable),
        });

    let mut history: Vec<HistoryPoint> = graph
        .graph_data
        .into_iter()
        .filter_map(|m| match parse_timestamp(&m.factory_timestamp) {
            Some(date) => Some(HistoryPoint { date, value: m.value_in_mg_per_dl }),
            None => {
                warn!("Skipping history point with bad timestamp: {}", m.factory_timestamp);
                None
            }
        })
        .collect();
    history.sort_by_key(|p| p.date);

    GlucoseData { current, history }
}

// Request/Response types

#[derive(Serialize)]
struct LoginRequest<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    status: i64,
    data: Option<LoginData>,
    error: Option<ErrorBody>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginData {
    #[serde(default)]
    redirect: bool,
    region: Option<String>,
    user: Option<User>,
    auth_ticket: Option<TicketBody>,
}

#[derive(Debug, Deserialize)]
struct User {
    id: String,
}

#[derive(Debug, Deserialize)]
struct TicketBody {
    token: String,
    expires: i64,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    status: i64,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Connection {
    patient_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphData {
    connection: Option<GraphConnection>,
    #[serde(default)]
    graph_data: Vec<Measurement>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphConnection {
    glucose_measurement: Option<Measurement>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Measurement {
    factory_timestamp: String,
    value_in_mg_per_dl: f64,
    trend_arrow: Option<i64>,
}
