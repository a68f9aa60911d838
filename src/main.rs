//! Player Prop Odds Logger v1.0
//!
//! Pulls upcoming games and player-prop lines from The Odds API for a fixed
//! set of sports, flattens bookmaker -> market -> outcome into one row per
//! outcome, and appends the rows to a CSV log.
//!
//! Run once per invocation; scheduling is left to cron or CI.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::Local;
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize, Serializer};
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, error, info, warn};

const DEFAULT_BASE_URL: &str = "https://api.the-odds-api.com/v4";
const DEFAULT_LOG_PATH: &str = "prop_log.csv";
const DEFAULT_REQUEST_DELAY_MS: u64 = 100;
const REGION: &str = "us";
const ODDS_FORMAT: &str = "american";
const LOG_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Header of the prop log, in column order
pub const LOG_COLUMNS: [&str; 8] = [
    "Log_Time", "Sport", "Game", "Player", "Prop", "Book", "Line", "Odds",
];

/// A sport key and the comma-separated prop markets requested for it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SportConfig {
    pub sport: &'static str,
    pub markets: &'static str,
}

pub const SPORTS: &[SportConfig] = &[
    SportConfig {
        sport: "basketball_nba",
        markets: "player_points,player_assists",
    },
    SportConfig {
        sport: "icehockey_nhl",
        markets: "player_points,player_goals",
    },
    SportConfig {
        sport: "americanfootball_nfl",
        markets: "player_rush_yds,player_pass_yds",
    },
];

/// Scheduled game from the events endpoint
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct Event {
    pub id: String,
    pub home_team: String,
    pub away_team: String,
}

impl Event {
    /// Display string for the matchup, away team first
    pub fn matchup(&self) -> String {
        format!("{} @ {}", self.away_team, self.home_team)
    }
}

/// Body of the per-event odds endpoint
#[derive(Debug, Deserialize, Clone, Default)]
pub struct EventOdds {
    #[serde(default)]
    pub bookmakers: Vec<Bookmaker>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Bookmaker {
    pub title: String,
    #[serde(default)]
    pub markets: Vec<Market>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Market {
    pub key: String,
    pub outcomes: Vec<Outcome>,
}

/// Prop outcomes may come back without a player, line or price
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Outcome {
    pub description: Option<String>,
    pub point: Option<f64>,
    pub price: Option<f64>,
}

/// One row of the prop log
#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct PropQuote {
    #[serde(rename = "Log_Time")]
    pub log_time: String,
    #[serde(rename = "Sport")]
    pub sport: String,
    #[serde(rename = "Game")]
    pub game: String,
    #[serde(rename = "Player")]
    pub player: Option<String>,
    #[serde(rename = "Prop")]
    pub prop: String,
    #[serde(rename = "Book")]
    pub book: String,
    #[serde(rename = "Line")]
    pub line: Option<f64>,
    #[serde(rename = "Odds", serialize_with = "american_odds")]
    pub odds: Option<f64>,
}

/// American prices are whole numbers in practice; write them as `-110`, not `-110.0`.
fn american_odds<S: Serializer>(price: &Option<f64>, serializer: S) -> Result<S::Ok, S::Error> {
    match price {
        Some(p) if p.fract() == 0.0 && p.abs() < i64::MAX as f64 => {
            serializer.serialize_some(&(*p as i64))
        }
        Some(p) => serializer.serialize_some(p),
        None => serializer.serialize_none(),
    }
}

/// Flatten one event's odds into a quote per outcome.
///
/// Every outcome yields exactly one quote, in bookmaker -> market -> outcome
/// order. Missing player, line or price become empty cells rather than
/// dropping the row.
pub fn flatten_event_odds(
    log_time: &str,
    sport: &str,
    event: &Event,
    odds: &EventOdds,
) -> Vec<PropQuote> {
    let game = event.matchup();
    let mut quotes = Vec::new();

    for bookmaker in &odds.bookmakers {
        for market in &bookmaker.markets {
            for outcome in &market.outcomes {
                quotes.push(PropQuote {
                    log_time: log_time.to_string(),
                    sport: sport.to_string(),
                    game: game.clone(),
                    player: outcome.description.clone(),
                    prop: market.key.clone(),
                    book: bookmaker.title.clone(),
                    line: outcome.point,
                    odds: outcome.price,
                });
            }
        }
    }

    quotes
}

/// Configuration
#[derive(Clone)]
pub struct Config {
    pub odds_api_key: String,
    pub base_url: String,
    pub log_path: PathBuf,
    /// Pause after every per-event odds request
    pub request_delay: Duration,
    pub sports: Vec<SportConfig>,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("odds_api_key", &"<redacted>")
            .field("base_url", &self.base_url)
            .field("log_path", &self.log_path)
            .field("request_delay", &self.request_delay)
            .field("sports", &self.sports)
            .finish()
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let odds_api_key = match lookup("ODDS_API_KEY") {
            Some(v) if !v.trim().is_empty() => v.trim().to_string(),
            Some(_) => return Err(anyhow!("ODDS_API_KEY is set but empty")),
            None => return Err(anyhow!("ODDS_API_KEY is not set")),
        };

        // Prevent accidental use of sample/placeholder keys
        let key_lower = odds_api_key.to_lowercase();
        if key_lower.contains("change_me")
            || key_lower.contains("your_")
            || key_lower.starts_with("sample")
        {
            return Err(anyhow!(
                "ODDS_API_KEY appears to be a placeholder value; replace with your real key"
            ));
        }

        let non_blank = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let base_url = non_blank("ODDS_API_BASE_URL")
            .map(|v| v.trim().trim_end_matches('/').to_string())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());

        let log_path = non_blank("PROP_LOG_PATH")
            .map(|v| PathBuf::from(v.trim()))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_PATH));

        let request_delay_ms = non_blank("ODDS_REQUEST_DELAY_MS")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(DEFAULT_REQUEST_DELAY_MS);

        Ok(Self {
            odds_api_key,
            base_url,
            log_path,
            request_delay: Duration::from_millis(request_delay_ms),
            sports: SPORTS.to_vec(),
        })
    }
}

/// Outcome of a provider call that reached the server.
///
/// Transport faults and malformed bodies are `Err`; a non-success status is
/// `Skipped` so the caller decides how far the skip reaches.
#[derive(Debug)]
pub enum Fetch<T> {
    Fetched(T),
    Skipped(StatusCode),
}

#[async_trait]
pub trait OddsSource: Send + Sync {
    /// Upcoming events for a sport
    async fn fetch_events(&self, sport: &str) -> Result<Fetch<Vec<Event>>>;

    /// Prop odds for one event, limited to the sport's configured markets
    async fn fetch_event_odds(
        &self,
        sport: &SportConfig,
        event_id: &str,
    ) -> Result<Fetch<EventOdds>>;
}

/// The Odds API v4 client
pub struct OddsApiClient {
    http_client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl OddsApiClient {
    pub fn new(config: &Config) -> Result<Self> {
        // HTTP client with timeouts
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http_client,
            base_url: config.base_url.clone(),
            api_key: config.odds_api_key.clone(),
        })
    }

    fn events_url(&self, sport: &str) -> String {
        format!("{}/sports/{}/events", self.base_url, sport)
    }

    fn event_odds_url(&self, sport: &str, event_id: &str) -> String {
        format!("{}/sports/{}/events/{}/odds", self.base_url, sport, event_id)
    }
}

/// Log API usage from headers
fn log_quota(headers: &HeaderMap) {
    if let Some(remaining) = headers.get("x-requests-remaining") {
        debug!(
            "API requests remaining: {} (used: {})",
            remaining.to_str().unwrap_or("?"),
            headers
                .get("x-requests-used")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("?")
        );
    }
}

#[async_trait]
impl OddsSource for OddsApiClient {
    async fn fetch_events(&self, sport: &str) -> Result<Fetch<Vec<Event>>> {
        let response = self
            .http_client
            .get(self.events_url(sport))
            .query(&[("apiKey", self.api_key.as_str()), ("regions", REGION)])
            .send()
            .await
            .with_context(|| format!("Failed to fetch {} events", sport))?;

        log_quota(response.headers());

        let status = response.status();
        if !status.is_success() {
            return Ok(Fetch::Skipped(status));
        }

        let body = response
            .text()
            .await
            .context("Failed to read events response body")?;

        let events: Vec<Event> =
            serde_json::from_str(&body).context("Failed to parse events")?;

        info!("Fetched {} {} events", events.len(), sport);
        Ok(Fetch::Fetched(events))
    }

    async fn fetch_event_odds(
        &self,
        sport: &SportConfig,
        event_id: &str,
    ) -> Result<Fetch<EventOdds>> {
        let response = self
            .http_client
            .get(self.event_odds_url(sport.sport, event_id))
            .query(&[
                ("apiKey", self.api_key.as_str()),
                ("regions", REGION),
                ("markets", sport.markets),
                ("oddsFormat", ODDS_FORMAT),
            ])
            .send()
            .await
            .with_context(|| format!("Failed to fetch odds for event {}", event_id))?;

        log_quota(response.headers());

        let status = response.status();
        if !status.is_success() {
            return Ok(Fetch::Skipped(status));
        }

        let body = response
            .text()
            .await
            .context("Failed to read odds response body")?;

        let odds: EventOdds = serde_json::from_str(&body)
            .with_context(|| format!("Failed to parse odds for event {}", event_id))?;

        Ok(Fetch::Fetched(odds))
    }
}

/// What a single run gathered
#[derive(Debug, Default)]
pub struct RunSummary {
    pub log_time: String,
    pub quotes: Vec<PropQuote>,
    pub sports_scanned: usize,
    pub sports_skipped: usize,
    pub events_seen: usize,
    pub odds_skipped: usize,
}

/// Walks the configured sports one event at a time
pub struct PropScraper<S> {
    source: S,
    sports: Vec<SportConfig>,
    request_delay: Duration,
}

impl<S: OddsSource> PropScraper<S> {
    pub fn new(source: S, sports: Vec<SportConfig>, request_delay: Duration) -> Self {
        Self {
            source,
            sports,
            request_delay,
        }
    }

    /// Single pass over every configured sport, stamped with the current local time
    pub async fn run(&self) -> RunSummary {
        let log_time = Local::now().format(LOG_TIME_FORMAT).to_string();
        self.run_at(log_time).await
    }

    pub async fn run_at(&self, log_time: String) -> RunSummary {
        info!("--- RUN START: {} ---", log_time);

        let mut summary = RunSummary {
            log_time,
            ..RunSummary::default()
        };

        for sport in &self.sports {
            info!("Scanning {}...", sport.sport);
            summary.sports_scanned += 1;

            // Faults stop at the sport boundary; the run moves on
            if let Err(e) = self.scan_sport(sport, &mut summary).await {
                summary.sports_skipped += 1;
                error!("Error on {}: {:#}", sport.sport, e);
            }
        }

        summary
    }

    async fn scan_sport(&self, sport: &SportConfig, summary: &mut RunSummary) -> Result<()> {
        let events = match self.source.fetch_events(sport.sport).await? {
            Fetch::Fetched(events) => events,
            Fetch::Skipped(status) => {
                warn!("Skipping {}: API status {}", sport.sport, status);
                summary.sports_skipped += 1;
                return Ok(());
            }
        };

        for event in &events {
            summary.events_seen += 1;

            let fetched = self.source.fetch_event_odds(sport, &event.id).await;
            tokio::time::sleep(self.request_delay).await;

            match fetched? {
                Fetch::Fetched(odds) => {
                    let quotes = flatten_event_odds(&summary.log_time, sport.sport, event, &odds);
                    debug!("{}: {} quotes", event.matchup(), quotes.len());
                    summary.quotes.extend(quotes);
                }
                Fetch::Skipped(status) => {
                    debug!("No odds for event {} ({})", event.id, status);
                    summary.odds_skipped += 1;
                }
            }
        }

        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("prop log I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("prop log is not readable CSV: {0}")]
    Csv(#[from] csv::Error),
    #[error("prop log header {found:?} does not match the expected columns")]
    SchemaMismatch { found: Vec<String> },
}

#[derive(Debug, PartialEq, Eq)]
pub enum AppendOutcome {
    NoData,
    Appended { new_rows: usize, total_rows: usize },
}

/// CSV log of prop quotes. Prior rows are carried over verbatim on every write.
pub struct PropLog {
    path: PathBuf,
}

impl PropLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rows already in the log; empty if the file doesn't exist yet
    pub fn read_existing(&self) -> Result<Vec<csv::StringRecord>, LogError> {
        if !self.path.try_exists()? {
            return Ok(Vec::new());
        }

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .from_path(&self.path)?;

        let headers = reader.headers()?.clone();
        if headers.iter().ne(LOG_COLUMNS.iter().copied()) {
            return Err(LogError::SchemaMismatch {
                found: headers.iter().map(str::to_string).collect(),
            });
        }

        let mut rows = Vec::new();
        for record in reader.records() {
            rows.push(record?);
        }
        Ok(rows)
    }

    /// Append quotes after the existing rows and rewrite the log.
    ///
    /// The combined table is written to a sibling `.tmp` file and renamed over
    /// the log, so a failed write leaves the previous log in place.
    pub fn append(&self, quotes: &[PropQuote]) -> Result<AppendOutcome, LogError> {
        if quotes.is_empty() {
            return Ok(AppendOutcome::NoData);
        }

        let existing = self.read_existing()?;
        let tmp_path = self.tmp_path();

        if let Err(e) = Self::write_rows(&tmp_path, &existing, quotes) {
            let _ = fs::remove_file(&tmp_path);
            return Err(e);
        }
        fs::rename(&tmp_path, &self.path)?;

        Ok(AppendOutcome::Appended {
            new_rows: quotes.len(),
            total_rows: existing.len() + quotes.len(),
        })
    }

    fn write_rows(
        path: &Path,
        existing: &[csv::StringRecord],
        quotes: &[PropQuote],
    ) -> Result<(), LogError> {
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_path(path)?;

        writer.write_record(LOG_COLUMNS)?;
        for row in existing {
            writer.write_record(row)?;
        }
        for quote in quotes {
            writer.serialize(quote)?;
        }
        writer.flush()?;
        Ok(())
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".tmp");
        PathBuf::from(name)
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("prop_odds_logger=info".parse()?),
        )
        .init();

    info!("Player Prop Odds Logger v1.0");

    // Missing key aborts here, before any request goes out
    let config = Config::from_env()?;

    let client = OddsApiClient::new(&config)?;
    let scraper = PropScraper::new(client, config.sports.clone(), config.request_delay);
    let summary = scraper.run().await;

    info!(
        "Scanned {} sports ({} skipped), {} events ({} without odds)",
        summary.sports_scanned,
        summary.sports_skipped,
        summary.events_seen,
        summary.odds_skipped
    );

    let log = PropLog::new(&config.log_path);
    let outcome = log
        .append(&summary.quotes)
        .with_context(|| format!("Failed to update {}", log.path().display()))?;

    match outcome {
        AppendOutcome::Appended {
            new_rows,
            total_rows,
        } => {
            info!(
                "Successfully logged {} new lines ({} total in {})",
                new_rows,
                total_rows,
                log.path().display()
            );
        }
        AppendOutcome::NoData => {
            warn!("No data found this run.");
        }
    }

    Ok(())
}
