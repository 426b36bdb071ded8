//! Core domain model for the Magny FC match sync pipeline.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "mfc-core";

/// Opponent slugs longer than this are truncated inside `fff_id`.
pub const FFF_ID_SLUG_MAX: usize = 40;

/// Home/away classification from the club's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Venue {
    Domicile,
    Exterieur,
}

impl Venue {
    pub fn as_str(&self) -> &'static str {
        match self {
            Venue::Domicile => "domicile",
            Venue::Exterieur => "exterieur",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "domicile" => Some(Venue::Domicile),
            "exterieur" => Some(Venue::Exterieur),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchStatus {
    Upcoming,
    Finished,
}

impl MatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchStatus::Upcoming => "upcoming",
            MatchStatus::Finished => "finished",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "upcoming" => Some(MatchStatus::Upcoming),
            "finished" => Some(MatchStatus::Finished),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Success,
    Error,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Error => "error",
        }
    }
}

/// One raw text/markup snippet pulled off a page or API response.
/// Transient: consumed by the parser, never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawFragment {
    pub text: String,
    /// Endpoint URL or a page/link description, for provenance logging.
    pub source: String,
}

impl RawFragment {
    pub fn new(text: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            source: source.into(),
        }
    }
}

/// Structured match record extracted from one fragment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedMatch {
    /// Deterministic natural key derived from date + opponent.
    pub fff_id: String,
    pub date_match: Option<NaiveDateTime>,
    pub opponent: String,
    pub venue: Venue,
    pub score_domicile: Option<i32>,
    pub score_exterieur: Option<i32>,
    pub status: MatchStatus,
    pub raw_home_team: Option<String>,
    pub raw_away_team: Option<String>,
    /// Source label carried over from the originating fragment.
    pub source: String,
}

/// Locally known team, read-only from the pipeline's perspective.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalTeam {
    pub id: i64,
    pub name: String,
    pub slug: String,
    pub fff_team_id: Option<String>,
    pub active: bool,
}

/// Score/status subset of a persisted match, all the upsert planner needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchResultSnapshot {
    pub id: i64,
    pub score_domicile: Option<i32>,
    pub score_exterieur: Option<i32>,
    pub status: MatchStatus,
}

/// Counts accumulated over one ingestion run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunStats {
    pub teams_found: i32,
    pub matches_found: i32,
    pub matches_inserted: i32,
    pub matches_updated: i32,
    pub matches_unchanged: i32,
}

/// Persisted bookkeeping row for one ingestion run.
#[derive(Debug, Clone, Serialize)]
pub struct ScrapeRun {
    pub id: i64,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub stats: RunStats,
    pub error_message: Option<String>,
    pub execution_time_ms: Option<i64>,
}

/// What the idempotent merge decided to do for one parsed match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertAction {
    Insert,
    /// Existing row id plus the result fields to write.
    UpdateResult {
        id: i64,
        score_domicile: i32,
        score_exterieur: i32,
        status: MatchStatus,
    },
    /// Existing row id; only the sync timestamp gets refreshed.
    Unchanged { id: i64 },
}

/// Decides the merge action for a parsed match against the stored row with
/// the same `fff_id`, if any. Scores are only ever written when the incoming
/// fragment carries a full result; a known result is never nulled out.
pub fn plan_upsert(existing: Option<&MatchResultSnapshot>, parsed: &ParsedMatch) -> UpsertAction {
    let Some(existing) = existing else {
        return UpsertAction::Insert;
    };

    let (Some(sd), Some(se)) = (parsed.score_domicile, parsed.score_exterieur) else {
        return UpsertAction::Unchanged { id: existing.id };
    };

    let changed = existing.score_domicile != Some(sd)
        || existing.score_exterieur != Some(se)
        || existing.status != parsed.status;
    if changed {
        UpsertAction::UpdateResult {
            id: existing.id,
            score_domicile: sd,
            score_exterieur: se,
            status: parsed.status,
        }
    } else {
        UpsertAction::Unchanged { id: existing.id }
    }
}

/// Lowercases, folds the accents common in French team names and collapses
/// every other character run into single dashes.
pub fn slugify(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut dash_pending = false;
    for c in input.chars().flat_map(fold_accent) {
        let c = c.to_ascii_lowercase();
        if c.is_ascii_alphanumeric() {
            if dash_pending && !out.is_empty() {
                out.push('-');
            }
            dash_pending = false;
            out.push(c);
        } else {
            dash_pending = true;
        }
    }
    out
}

fn fold_accent(c: char) -> std::iter::Once<char> {
    let folded = match c {
        'à' | 'â' | 'ä' | 'À' | 'Â' | 'Ä' => 'a',
        'ç' | 'Ç' => 'c',
        'é' | 'è' | 'ê' | 'ë' | 'É' | 'È' | 'Ê' | 'Ë' => 'e',
        'î' | 'ï' | 'Î' | 'Ï' => 'i',
        'ô' | 'ö' | 'Ô' | 'Ö' => 'o',
        'û' | 'ù' | 'ü' | 'Û' | 'Ù' | 'Ü' => 'u',
        other => other,
    };
    std::iter::once(folded)
}

/// Derives the external natural key for a match. At least one of `date` and
/// a non-empty opponent must be known; callers reject fragments where both
/// are missing before getting here.
pub fn fff_id(date: Option<NaiveDate>, opponent: &str) -> String {
    let date_part = match date {
        Some(d) => d.format("%Y-%m-%d").to_string(),
        None => "inconnue".to_string(),
    };
    let mut slug = slugify(opponent);
    if slug.is_empty() {
        slug = "inconnu".to_string();
    }
    slug.truncate(FFF_ID_SLUG_MAX);
    format!("fff-{date_part}-{}", slug.trim_end_matches('-'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn parsed(fff_id: &str, scores: Option<(i32, i32)>) -> ParsedMatch {
        ParsedMatch {
            fff_id: fff_id.to_string(),
            date_match: None,
            opponent: "AS Rambouillet".to_string(),
            venue: Venue::Domicile,
            score_domicile: scores.map(|(d, _)| d),
            score_exterieur: scores.map(|(_, e)| e),
            status: if scores.is_some() {
                MatchStatus::Finished
            } else {
                MatchStatus::Upcoming
            },
            raw_home_team: None,
            raw_away_team: None,
            source: "test".to_string(),
        }
    }

    #[test]
    fn slugify_folds_french_accents() {
        assert_eq!(slugify("Élancourt OSC Féminines"), "elancourt-osc-feminines");
        assert_eq!(slugify("  AS   Rambouillet "), "as-rambouillet");
        assert_eq!(slugify("Vétérans / Saint-Cyr"), "veterans-saint-cyr");
    }

    #[test]
    fn fff_id_matches_expected_format() {
        let date = NaiveDate::from_ymd_opt(2024, 10, 12).unwrap();
        assert_eq!(
            fff_id(Some(date), "AS Rambouillet"),
            "fff-2024-10-12-as-rambouillet"
        );
    }

    #[test]
    fn fff_id_is_stable_across_spellings_of_the_same_opponent() {
        let date = NaiveDate::from_ymd_opt(2024, 10, 12).unwrap();
        assert_eq!(
            fff_id(Some(date), "AS  Rambouillet"),
            fff_id(Some(date), "as rambouillet")
        );
    }

    #[test]
    fn fff_id_without_date_still_deterministic() {
        assert_eq!(fff_id(None, "FC Versailles"), "fff-inconnue-fc-versailles");
        assert_eq!(fff_id(None, ""), "fff-inconnue-inconnu");
    }

    #[test]
    fn fff_id_truncates_long_opponents() {
        let long = "Association Sportive et Culturelle de la Vallée de Chevreuse";
        let id = fff_id(None, long);
        assert!(id.len() <= "fff-inconnue-".len() + FFF_ID_SLUG_MAX);
        assert!(!id.ends_with('-'));
    }

    #[test]
    fn plan_upsert_inserts_when_no_existing_row() {
        let p = parsed("fff-2024-10-12-as-rambouillet", Some((3, 1)));
        assert_eq!(plan_upsert(None, &p), UpsertAction::Insert);
    }

    #[test]
    fn plan_upsert_applies_new_score() {
        let existing = MatchResultSnapshot {
            id: 7,
            score_domicile: None,
            score_exterieur: None,
            status: MatchStatus::Upcoming,
        };
        let p = parsed("fff-2024-10-12-as-rambouillet", Some((3, 1)));
        assert_eq!(
            plan_upsert(Some(&existing), &p),
            UpsertAction::UpdateResult {
                id: 7,
                score_domicile: 3,
                score_exterieur: 1,
                status: MatchStatus::Finished,
            }
        );
    }

    #[test]
    fn plan_upsert_never_nulls_a_known_score() {
        let existing = MatchResultSnapshot {
            id: 7,
            score_domicile: Some(3),
            score_exterieur: Some(1),
            status: MatchStatus::Finished,
        };
        let p = parsed("fff-2024-10-12-as-rambouillet", None);
        assert_eq!(
            plan_upsert(Some(&existing), &p),
            UpsertAction::Unchanged { id: 7 }
        );
    }

    #[test]
    fn plan_upsert_identical_score_is_unchanged() {
        let existing = MatchResultSnapshot {
            id: 7,
            score_domicile: Some(3),
            score_exterieur: Some(1),
            status: MatchStatus::Finished,
        };
        let p = parsed("fff-2024-10-12-as-rambouillet", Some((3, 1)));
        assert_eq!(
            plan_upsert(Some(&existing), &p),
            UpsertAction::Unchanged { id: 7 }
        );
    }
}
