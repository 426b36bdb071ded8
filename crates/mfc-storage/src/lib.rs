//! Postgres store, retrying HTTP fetch and raw-artifact dumps for the
//! match sync pipeline.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use mfc_core::{
    plan_upsert, LocalTeam, MatchResultSnapshot, MatchStatus, ParsedMatch, RunStats, RunStatus,
    UpsertAction,
};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool, QueryBuilder, Row};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

pub const CRATE_NAME: &str = "mfc-storage";

/// Explicitly constructed, explicitly closed storage handle. One instance is
/// scoped to one ingestion run; nothing else mutates match rows.
#[derive(Debug, Clone)]
pub struct MatchStore {
    pool: PgPool,
}

/// What the idempotent merge actually did, as reported in run statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    Unchanged,
}

#[derive(Debug, FromRow)]
struct TeamRow {
    id: i64,
    name: String,
    slug: String,
    fff_team_id: Option<String>,
    active: bool,
}

/// Partial close payload; only supplied columns are written.
#[derive(Debug, Clone)]
pub struct RunClose {
    pub status: RunStatus,
    pub stats: Option<RunStats>,
    pub error_message: Option<String>,
    pub execution_time_ms: Option<i64>,
}

impl MatchStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("connecting to database")?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .context("running migrations")?;
        Ok(())
    }

    pub async fn close(self) {
        self.pool.close().await;
    }

    pub async fn active_teams(&self) -> anyhow::Result<Vec<LocalTeam>> {
        let rows: Vec<TeamRow> = sqlx::query_as(
            "SELECT id, name, slug, fff_team_id, active FROM teams WHERE active ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
        .context("loading active teams")?;

        Ok(rows
            .into_iter()
            .map(|r| LocalTeam {
                id: r.id,
                name: r.name,
                slug: r.slug,
                fff_team_id: r.fff_team_id,
                active: r.active,
            })
            .collect())
    }

    pub async fn team_by_slug(&self, slug: &str) -> anyhow::Result<Option<LocalTeam>> {
        let row: Option<TeamRow> = sqlx::query_as(
            "SELECT id, name, slug, fff_team_id, active FROM teams WHERE slug = $1 AND active",
        )
        .bind(slug)
        .fetch_optional(&self.pool)
        .await
        .context("looking up team by slug")?;

        Ok(row.map(|r| LocalTeam {
            id: r.id,
            name: r.name,
            slug: r.slug,
            fff_team_id: r.fff_team_id,
            active: r.active,
        }))
    }

    /// Idempotent merge keyed on `fff_id`, inside one transaction. Scores and
    /// status are only written when the incoming record carries a result and
    /// it differs from what is stored; the sync timestamp always refreshes.
    pub async fn upsert_match(
        &self,
        parsed: &ParsedMatch,
        team_id: Option<i64>,
    ) -> anyhow::Result<UpsertOutcome> {
        let mut tx = self.pool.begin().await.context("starting transaction")?;

        let existing = sqlx::query(
            "SELECT id, score_domicile, score_exterieur, status FROM matches \
             WHERE fff_id = $1 FOR UPDATE",
        )
        .bind(&parsed.fff_id)
        .fetch_optional(&mut *tx)
        .await
        .context("looking up match by fff_id")?
        .map(|row| -> anyhow::Result<MatchResultSnapshot> {
            let status: String = row.try_get("status")?;
            Ok(MatchResultSnapshot {
                id: row.try_get("id")?,
                score_domicile: row.try_get("score_domicile")?,
                score_exterieur: row.try_get("score_exterieur")?,
                status: MatchStatus::parse(&status).unwrap_or(MatchStatus::Upcoming),
            })
        })
        .transpose()?;

        let outcome = match plan_upsert(existing.as_ref(), parsed) {
            UpsertAction::Insert => {
                sqlx::query(
                    "INSERT INTO matches \
                     (team_id, opponent, date_match, venue, score_domicile, score_exterieur, \
                      status, visible, fff_id, fff_url, fff_home_team, fff_away_team, last_sync_at) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7, TRUE, $8, $9, $10, $11, now())",
                )
                .bind(team_id)
                .bind(&parsed.opponent)
                .bind(parsed.date_match)
                .bind(parsed.venue.as_str())
                .bind(parsed.score_domicile)
                .bind(parsed.score_exterieur)
                .bind(parsed.status.as_str())
                .bind(&parsed.fff_id)
                .bind(&parsed.source)
                .bind(&parsed.raw_home_team)
                .bind(&parsed.raw_away_team)
                .execute(&mut *tx)
                .await
                .context("inserting match")?;
                UpsertOutcome::Inserted
            }
            UpsertAction::UpdateResult {
                id,
                score_domicile,
                score_exterieur,
                status,
            } => {
                sqlx::query(
                    "UPDATE matches SET score_domicile = $1, score_exterieur = $2, \
                     status = $3, last_sync_at = now() WHERE id = $4",
                )
                .bind(score_domicile)
                .bind(score_exterieur)
                .bind(status.as_str())
                .bind(id)
                .execute(&mut *tx)
                .await
                .context("updating match result")?;
                UpsertOutcome::Updated
            }
            UpsertAction::Unchanged { id } => {
                sqlx::query("UPDATE matches SET last_sync_at = now() WHERE id = $1")
                    .bind(id)
                    .execute(&mut *tx)
                    .await
                    .context("refreshing match sync timestamp")?;
                UpsertOutcome::Unchanged
            }
        };

        tx.commit().await.context("committing upsert")?;
        Ok(outcome)
    }

    /// Opens a run row with status `running`; returns its id.
    pub async fn open_run(&self) -> anyhow::Result<i64> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO scraping_runs (started_at, status) VALUES (now(), $1) RETURNING id",
        )
        .bind(RunStatus::Running.as_str())
        .fetch_one(&self.pool)
        .await
        .context("opening scrape run")?;
        debug!(run_id = id, "scrape run opened");
        Ok(id)
    }

    /// Closes a run with a partial update: only columns present in `close`
    /// are touched, besides `finished_at` and `status` which always are.
    pub async fn close_run(&self, run_id: i64, close: &RunClose) -> anyhow::Result<()> {
        let mut qb = QueryBuilder::new("UPDATE scraping_runs SET finished_at = now(), status = ");
        qb.push_bind(close.status.as_str());
        if let Some(stats) = &close.stats {
            qb.push(", teams_found = ").push_bind(stats.teams_found);
            qb.push(", matches_found = ").push_bind(stats.matches_found);
            qb.push(", matches_inserted = ").push_bind(stats.matches_inserted);
            qb.push(", matches_updated = ").push_bind(stats.matches_updated);
        }
        if let Some(message) = &close.error_message {
            qb.push(", error_message = ").push_bind(message.as_str());
        }
        if let Some(ms) = close.execution_time_ms {
            qb.push(", execution_time_ms = ").push_bind(ms);
        }
        qb.push(" WHERE id = ").push_bind(run_id);
        qb.build()
            .execute(&self.pool)
            .await
            .context("closing scrape run")?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: String,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: concat!("mfc-sync/", env!("CARGO_PKG_VERSION")).to_string(),
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Sequential HTTP fetch with bounded retry on transient failures. The
/// pipeline visits pages one at a time, so no concurrency limiting here.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    pub async fn fetch(
        &self,
        url: &str,
        accept: Option<&str>,
    ) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0usize;
        loop {
            let mut request = self.client.get(url);
            if let Some(accept) = accept {
                request = request.header(reqwest::header::ACCEPT, accept);
            }

            match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(%url, %status, attempt, "retryable http status");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(%url, error = %err, attempt, "retryable request error");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}

/// Hash-addressed dump of raw fetched bodies, written in verbose runs so a
/// broken extraction can be replayed against the exact page it saw.
#[derive(Debug, Clone)]
pub struct ArtifactDumpStore {
    root: PathBuf,
}

impl ArtifactDumpStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    /// Writes bytes under `{stamp}/{label}/{hash}.{ext}`. Identical content
    /// dumped twice in the same second resolves to the same path and is
    /// skipped.
    pub async fn store_bytes(
        &self,
        label: &str,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<PathBuf> {
        let stamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
        let hash = Self::sha256_hex(bytes);
        let ext = extension.trim_start_matches('.');
        let ext = if ext.is_empty() { "bin" } else { ext };
        let dir = self.root.join(stamp).join(sanitize_label(label));
        let path = dir.join(format!("{hash}.{ext}"));

        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating dump directory {}", dir.display()))?;

        if fs::try_exists(&path)
            .await
            .with_context(|| format!("checking dump path {}", path.display()))?
        {
            return Ok(path);
        }

        let tmp = dir.join(format!(".{hash}.{}.tmp", std::process::id()));
        let mut file = fs::File::create(&tmp)
            .await
            .with_context(|| format!("creating {}", tmp.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing {}", tmp.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing {}", tmp.display()))?;
        drop(file);
        fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("renaming dump into {}", path.display()))?;
        Ok(path)
    }
}

fn sanitize_label(label: &str) -> String {
    label
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn sha256_is_stable() {
        assert_eq!(
            ArtifactDumpStore::sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(6), Duration::from_millis(350));
    }

    #[test]
    fn retryable_statuses_cover_server_errors_and_rate_limits() {
        assert_eq!(
            classify_status(StatusCode::INTERNAL_SERVER_ERROR),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            RetryDisposition::NonRetryable
        );
    }

    #[tokio::test]
    async fn dumps_are_hash_addressed_and_deduplicated() {
        let dir = tempdir().expect("tempdir");
        let store = ArtifactDumpStore::new(dir.path());

        let first = store
            .store_bytes("club page", "html", b"<html>same</html>")
            .await
            .expect("first dump");
        let second = store
            .store_bytes("club page", "html", b"<html>same</html>")
            .await
            .expect("second dump");

        assert_eq!(first, second);
        assert!(first.exists());
        assert!(first.to_string_lossy().contains("club_page"));
    }
}
