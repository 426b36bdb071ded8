//! Fragment extraction and parsing: unstructured HTML/text in, structured
//! match records out. Everything here is pure over its inputs so the parser
//! can be exercised against literal fixtures with no network or storage.

use std::collections::HashSet;
use std::sync::LazyLock;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use mfc_core::{fff_id, LocalTeam, MatchStatus, ParsedMatch, RawFragment, Venue};
use regex::Regex;
use scraper::{Html, Selector};
use serde_json::Value as JsonValue;
use tracing::debug;

pub const CRATE_NAME: &str = "mfc-extract";

/// Fragments shorter than this can't describe a match; rejected silently.
const MIN_FRAGMENT_LEN: usize = 10;

static NUMERIC_DATE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(\d{1,2})[/-](\d{1,2})[/-](\d{2,4})\b").expect("date regex"));

static MONTH_DATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(\d{1,2})(?:er)?\s+(janv(?:ier)?\.?|f[ée]vr(?:ier)?\.?|mars|avr(?:il)?\.?|mai|juin|juil(?:let)?\.?|ao[ûu]t|sept(?:embre)?\.?|oct(?:obre)?\.?|nov(?:embre)?\.?|d[ée]c(?:embre)?\.?)\s+(\d{4})\b",
    )
    .expect("month regex")
});

static TIME_OF_DAY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(\d{1,2})[h:](\d{2})\b").expect("time regex"));

static SCORE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(\d+)\s*[-–:]\s*(\d+)\b").expect("score regex"));

static TEAM_SEPARATOR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\s+[-–]\s+|\s+vs\.?\s+|\s+\.\s+").expect("separator regex"));

/// Parses one raw fragment into a match record. Returns `None` for anything
/// that is not confidently a fixture of the given club: too short, no club
/// mention, or no stable natural key (neither date nor opponent). Absence of
/// a match here is expected, never an error.
pub fn parse_fragment(fragment: &RawFragment, club_name: &str) -> Option<ParsedMatch> {
    let text = fragment.text.trim();
    if text.chars().count() < MIN_FRAGMENT_LEN {
        return None;
    }
    let club_lower = club_name.to_lowercase();
    if !text.to_lowercase().contains(&club_lower) {
        return None;
    }

    let mut working = text.to_string();
    let date = extract_date(&mut working);
    let time = extract_time(&mut working);
    let score = extract_score(&mut working);
    let (raw_home, raw_away) = extract_team_candidates(&working);

    let (venue, opponent) = classify_sides(raw_home.as_deref(), raw_away.as_deref(), &club_lower);

    if date.is_none() && opponent.is_none() {
        debug!(source = %fragment.source, "fragment has neither date nor opponent, rejecting");
        return None;
    }

    let date_match = date.map(|d| NaiveDateTime::new(d, time.unwrap_or(NaiveTime::MIN)));
    let opponent = opponent.unwrap_or_else(|| "Inconnu".to_string());
    let (score_domicile, score_exterieur) = match score {
        Some((d, e)) => (Some(d), Some(e)),
        None => (None, None),
    };
    let status = if score.is_some() {
        MatchStatus::Finished
    } else {
        MatchStatus::Upcoming
    };

    Some(ParsedMatch {
        fff_id: fff_id(date, &opponent),
        date_match,
        opponent,
        venue,
        score_domicile,
        score_exterieur,
        status,
        raw_home_team: raw_home,
        raw_away_team: raw_away,
        source: fragment.source.clone(),
    })
}

/// Tries numeric `D/M/Y` first, then French month names. The first pattern
/// that matches wins; its span is blanked out of `working` so later passes
/// never mistake date digits for scores or team names.
fn extract_date(working: &mut String) -> Option<NaiveDate> {
    let numeric = NUMERIC_DATE.captures(working).and_then(|caps| {
        let range = caps.get(0)?.range();
        let day: u32 = caps[1].parse().ok()?;
        let month: u32 = caps[2].parse().ok()?;
        let year: i32 = caps[3].parse().ok()?;
        Some((range, day, month, year))
    });
    if let Some((range, day, month, mut year)) = numeric {
        if year < 100 {
            year += 2000;
        }
        blank(working, range);
        return NaiveDate::from_ymd_opt(year, month, day);
    }

    let named = MONTH_DATE.captures(working).and_then(|caps| {
        let range = caps.get(0)?.range();
        let day: u32 = caps[1].parse().ok()?;
        let month = french_month_number(&caps[2])?;
        let year: i32 = caps[3].parse().ok()?;
        Some((range, day, month, year))
    });
    if let Some((range, day, month, year)) = named {
        blank(working, range);
        return NaiveDate::from_ymd_opt(year, month, day);
    }

    None
}

fn extract_time(working: &mut String) -> Option<NaiveTime> {
    let (range, hour, minute) = TIME_OF_DAY.captures(working).and_then(|caps| {
        let range = caps.get(0)?.range();
        let hour: u32 = caps[1].parse().ok()?;
        let minute: u32 = caps[2].parse().ok()?;
        Some((range, hour, minute))
    })?;
    blank(working, range);
    NaiveTime::from_hms_opt(hour, minute, 0)
}

/// First `<int> [-–:] <int>` occurrence, read as home-away in text order.
fn extract_score(working: &mut String) -> Option<(i32, i32)> {
    let (range, home, away) = SCORE.captures(working).and_then(|caps| {
        let range = caps.get(0)?.range();
        let home: i32 = caps[1].parse().ok()?;
        let away: i32 = caps[2].parse().ok()?;
        Some((range, home, away))
    })?;
    blank(working, range);
    Some((home, away))
}

fn blank(text: &mut String, range: std::ops::Range<usize>) {
    text.replace_range(range.clone(), &" ".repeat(range.len()));
}

fn french_month_number(name: &str) -> Option<u32> {
    let folded: String = name
        .to_lowercase()
        .chars()
        .map(|c| match c {
            'é' | 'è' | 'ê' => 'e',
            'û' | 'ù' => 'u',
            'î' => 'i',
            other => other,
        })
        .collect();
    let n = match folded.trim_end_matches('.') {
        s if s.starts_with("janv") => 1,
        s if s.starts_with("fevr") => 2,
        "mars" => 3,
        s if s.starts_with("avr") => 4,
        "mai" => 5,
        "juin" => 6,
        s if s.starts_with("juil") => 7,
        "aout" => 8,
        s if s.starts_with("sept") => 9,
        s if s.starts_with("oct") => 10,
        s if s.starts_with("nov") => 11,
        s if s.starts_with("dec") => 12,
        _ => return None,
    };
    Some(n)
}

/// Splits the date/time/score-blanked text on separator tokens and keeps the
/// first two non-trivial candidates as home and away names, in text order.
fn extract_team_candidates(working: &str) -> (Option<String>, Option<String>) {
    let mut candidates = TEAM_SEPARATOR
        .split(working)
        .map(|piece| piece.trim().trim_matches(|c: char| ".,;:|".contains(c)).trim())
        .filter(|piece| piece.len() >= 3 && piece.chars().any(|c| c.is_alphabetic()))
        .map(str::to_string);
    (candidates.next(), candidates.next())
}

/// The candidate containing the club name is the club's side; scores stay
/// aligned to actual home/away because candidates keep text order.
fn classify_sides(
    home: Option<&str>,
    away: Option<&str>,
    club_lower: &str,
) -> (Venue, Option<String>) {
    match (home, away) {
        (Some(h), Some(a)) if a.to_lowercase().contains(club_lower) => {
            (Venue::Exterieur, Some(h.to_string()))
        }
        (Some(_), Some(a)) => (Venue::Domicile, Some(a.to_string())),
        _ => (Venue::Domicile, None),
    }
}

/// Normalizes an external team label and maps it to a locally known team.
/// First a static keyword table (ordered, first hit wins), then a fallback
/// on the federation team id appearing inside the name. `None` means the
/// caller inserts without team linkage; it is not an error.
pub fn resolve_team<'a>(
    external_name: &str,
    club_name: &str,
    teams: &'a [LocalTeam],
) -> Option<&'a LocalTeam> {
    let normalized = normalize_team_name(external_name, club_name);

    for (keyword, slugs) in CATEGORY_KEYWORDS {
        if normalized.contains(keyword) {
            return teams
                .iter()
                .find(|t| t.active && slugs.contains(&t.slug.as_str()));
        }
    }

    teams.iter().find(|t| {
        t.active
            && t.fff_team_id
                .as_deref()
                .is_some_and(|id| !id.is_empty() && normalized.contains(&id.to_lowercase()))
    })
}

/// Category keyword -> local team slugs, most specific entries first.
const CATEGORY_KEYWORDS: &[(&str, &[&str])] = &[
    ("senior", &["seniors-a", "seniors-b", "seniors"]),
    ("sénior", &["seniors-a", "seniors-b", "seniors"]),
    ("u19", &["u19"]),
    ("u18", &["u19"]),
    ("u17", &["u17"]),
    ("u16", &["u17"]),
    ("u15", &["u15"]),
    ("u14", &["u15"]),
    ("u13", &["u13"]),
    ("u12", &["u13"]),
    ("u11", &["u11"]),
    ("u10", &["u11"]),
    ("féminin", &["feminines"]),
    ("feminin", &["feminines"]),
    ("vétéran", &["veterans"]),
    ("veteran", &["veterans"]),
];

fn normalize_team_name(external_name: &str, club_name: &str) -> String {
    let lowered = external_name.to_lowercase();
    let without_club = lowered.replace(&club_name.to_lowercase(), " ");
    let mut tokens: Vec<&str> = without_club.split_whitespace().collect();
    // Club suffix numbers ("Seniors 2"); federation ids are longer and stay.
    while tokens
        .last()
        .is_some_and(|t| t.len() <= 2 && t.chars().all(|c| c.is_ascii_digit()))
    {
        tokens.pop();
    }
    tokens.join(" ")
}

static MATCH_HINTS: LazyLock<Vec<Selector>> = LazyLock::new(|| {
    [
        r#"[class*="match"]"#,
        r#"[class*="rencontre"]"#,
        r#"[data-type*="match"]"#,
    ]
    .iter()
    .map(|s| Selector::parse(s).expect("match hint selector"))
    .collect()
});

static TEAM_HINTS: LazyLock<Vec<Selector>> = LazyLock::new(|| {
    [r#"[class*="equipe"]"#, r#"[class*="team"]"#]
        .iter()
        .map(|s| Selector::parse(s).expect("team hint selector"))
        .collect()
});

static TABLE_ROW: LazyLock<Selector> = LazyLock::new(|| Selector::parse("tr").expect("tr selector"));
static TABLE_CELL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("td, th").expect("cell selector"));
static ANCHOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("a[href]").expect("anchor selector"));

const SUB_LINK_KEYWORDS: &[&str] = &["calendrier", "resultat", "agenda", "equipe", "match"];

/// Runs every extraction strategy over a rendered page and merges the
/// fragments. Strategies are additive and order-independent; duplicates of
/// the same text are dropped here, cross-run dedup happens via `fff_id`.
pub fn extract_fragments(html: &str, source: &str) -> Vec<RawFragment> {
    let document = Html::parse_document(html);
    let mut seen = HashSet::new();
    let mut fragments = Vec::new();
    let mut push = |text: String| {
        let text = collapse_whitespace(&text);
        if !text.is_empty() && seen.insert(text.clone()) {
            fragments.push(RawFragment::new(text, source.to_string()));
        }
    };

    for selector in MATCH_HINTS.iter().chain(TEAM_HINTS.iter()) {
        for element in document.select(selector) {
            push(element.text().collect::<String>());
        }
    }

    for row in document.select(&TABLE_ROW) {
        let cells: Vec<String> = row
            .select(&TABLE_CELL)
            .map(|c| collapse_whitespace(&c.text().collect::<String>()))
            .collect();
        if cells.len() >= 3 {
            push(cells.join(" - "));
        }
    }

    for anchor in document.select(&ANCHOR) {
        if let Some(href) = anchor.value().attr("href") {
            let lowered = href.to_lowercase();
            if SUB_LINK_KEYWORDS.iter().any(|k| lowered.contains(k)) {
                push(anchor.text().collect::<String>());
            }
        }
    }

    fragments
}

/// Candidate team labels from a rendered page, used only for run statistics.
pub fn extract_team_names(html: &str) -> Vec<String> {
    let document = Html::parse_document(html);
    let mut seen = HashSet::new();
    let mut names = Vec::new();
    for selector in TEAM_HINTS.iter() {
        for element in document.select(selector) {
            let text = collapse_whitespace(&element.text().collect::<String>());
            if text.len() >= 3 && text.len() <= 80 && seen.insert(text.clone()) {
                names.push(text);
            }
        }
    }
    names
}

/// Hrefs of calendar/results/team sub-pages worth a follow-up visit, in
/// document order. Deduplicated; the caller bounds how many get explored.
pub fn discover_sub_links(html: &str) -> Vec<String> {
    let document = Html::parse_document(html);
    let mut seen = HashSet::new();
    let mut links = Vec::new();
    for anchor in document.select(&ANCHOR) {
        if let Some(href) = anchor.value().attr("href") {
            let lowered = href.to_lowercase();
            if SUB_LINK_KEYWORDS.iter().any(|k| lowered.contains(k))
                && !lowered.starts_with('#')
                && seen.insert(href.to_string())
            {
                links.push(href.to_string());
            }
        }
    }
    links
}

/// Splits a structured API response body into fragments. Arrays (bare or
/// `hydra:member`) yield one fragment per element; any other non-empty body
/// yields a single fragment. Empty bodies yield nothing.
pub fn fragments_from_json(body: &str, source: &str) -> Vec<RawFragment> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }

    let members = serde_json::from_str::<JsonValue>(trimmed).ok().and_then(|value| {
        if let JsonValue::Array(items) = value {
            Some(items)
        } else {
            value
                .get("hydra:member")
                .and_then(|m| m.as_array())
                .cloned()
        }
    });

    match members {
        Some(items) => items
            .iter()
            .filter_map(|item| serde_json::to_string(item).ok())
            .map(|text| RawFragment::new(text, source.to_string()))
            .collect(),
        None => vec![RawFragment::new(trimmed.to_string(), source.to_string())],
    }
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, Timelike};

    const CLUB: &str = "Magny FC 78";

    fn fragment(text: &str) -> RawFragment {
        RawFragment::new(text, "test-page")
    }

    fn team(id: i64, name: &str, slug: &str, fff: Option<&str>, active: bool) -> LocalTeam {
        LocalTeam {
            id,
            name: name.to_string(),
            slug: slug.to_string(),
            fff_team_id: fff.map(str::to_string),
            active,
        }
    }

    #[test]
    fn parses_home_fixture_with_score_and_time() {
        let parsed =
            parse_fragment(&fragment("Magny FC 78 - AS Rambouillet 12/10/2024 15h00 3-1"), CLUB)
                .unwrap();
        let date = parsed.date_match.unwrap();
        assert_eq!(date.date(), NaiveDate::from_ymd_opt(2024, 10, 12).unwrap());
        assert_eq!(date.time().hour(), 15);
        assert_eq!(parsed.opponent, "AS Rambouillet");
        assert_eq!(parsed.venue, Venue::Domicile);
        assert_eq!(parsed.score_domicile, Some(3));
        assert_eq!(parsed.score_exterieur, Some(1));
        assert_eq!(parsed.status, MatchStatus::Finished);
        assert_eq!(parsed.fff_id, "fff-2024-10-12-as-rambouillet");
    }

    #[test]
    fn parses_away_fixture_with_french_month_date() {
        let parsed =
            parse_fragment(&fragment("Rambouillet vs Magny FC 78 5 janvier 2025"), CLUB).unwrap();
        assert_eq!(
            parsed.date_match.unwrap().date(),
            NaiveDate::from_ymd_opt(2025, 1, 5).unwrap()
        );
        assert_eq!(parsed.venue, Venue::Exterieur);
        assert_eq!(parsed.opponent, "Rambouillet");
        assert_eq!(parsed.score_domicile, None);
        assert_eq!(parsed.score_exterieur, None);
        assert_eq!(parsed.status, MatchStatus::Upcoming);
    }

    #[test]
    fn parses_abbreviated_month_names() {
        let parsed =
            parse_fragment(&fragment("Magny FC 78 - FC Versailles 3 févr. 2025"), CLUB).unwrap();
        assert_eq!(
            parsed.date_match.unwrap().date(),
            NaiveDate::from_ymd_opt(2025, 2, 3).unwrap()
        );
    }

    #[test]
    fn numeric_date_wins_over_month_pattern() {
        let parsed = parse_fragment(
            &fragment("Magny FC 78 - AS Poissy 01/09/2024 reporté au 8 septembre 2024"),
            CLUB,
        )
        .unwrap();
        assert_eq!(
            parsed.date_match.unwrap().date(),
            NaiveDate::from_ymd_opt(2024, 9, 1).unwrap()
        );
    }

    #[test]
    fn two_digit_years_are_widened() {
        let parsed =
            parse_fragment(&fragment("Magny FC 78 - AS Poissy 12/10/24"), CLUB).unwrap();
        assert_eq!(
            parsed.date_match.unwrap().date(),
            NaiveDate::from_ymd_opt(2024, 10, 12).unwrap()
        );
    }

    #[test]
    fn rejects_text_without_club_mention() {
        assert!(parse_fragment(
            &fragment("AS Rambouillet - FC Versailles 12/10/2024 2-2"),
            CLUB
        )
        .is_none());
    }

    #[test]
    fn rejects_short_fragments() {
        assert!(parse_fragment(&fragment("Magny"), CLUB).is_none());
    }

    #[test]
    fn rejects_fragment_with_no_date_and_no_opponent() {
        assert!(parse_fragment(&fragment("Magny FC 78 entraînement hebdomadaire"), CLUB).is_none());
    }

    #[test]
    fn same_match_in_different_texts_yields_same_natural_key() {
        let a = parse_fragment(&fragment("Magny FC 78 - AS Rambouillet 12/10/2024 15h00"), CLUB)
            .unwrap();
        let b = parse_fragment(
            &fragment("AS RAMBOUILLET vs Magny FC 78 le 12/10/2024 au stade"),
            CLUB,
        )
        .unwrap();
        assert_eq!(a.fff_id, b.fff_id);
    }

    #[test]
    fn parser_is_pure() {
        let f = fragment("Magny FC 78 - AS Rambouillet 12/10/2024 15h00 3-1");
        assert_eq!(parse_fragment(&f, CLUB), parse_fragment(&f, CLUB));
    }

    #[test]
    fn resolves_by_category_keyword_first_active_slug() {
        let teams = vec![
            team(1, "Seniors A", "seniors-a", None, false),
            team(2, "Seniors B", "seniors-b", None, true),
            team(3, "U17", "u17", None, true),
        ];
        let resolved = resolve_team("Magny FC 78 Seniors 2", CLUB, &teams).unwrap();
        assert_eq!(resolved.id, 2);
    }

    #[test]
    fn resolves_by_federation_id_fallback() {
        let teams = vec![team(4, "U15", "u15", Some("563920"), true)];
        let resolved = resolve_team("Equipe 563920", CLUB, &teams).unwrap();
        assert_eq!(resolved.id, 4);
    }

    #[test]
    fn unresolvable_team_is_none() {
        let teams = vec![team(1, "Seniors A", "seniors-a", None, true)];
        assert!(resolve_team("Magny FC 78 3", CLUB, &teams).is_none());
    }

    const PAGE: &str = r#"
        <html><body>
          <div class="prochain-match">Magny FC 78 - AS Rambouillet 12/10/2024 15h00</div>
          <span class="equipe-name">Magny FC 78 Seniors A</span>
          <table>
            <tr><td>12/10/2024</td><td>Magny FC 78</td><td>AS Rambouillet</td></tr>
            <tr><td>lonely</td></tr>
          </table>
          <a href="/calendrier/seniors">Calendrier Seniors</a>
          <a href="/mentions-legales">Mentions légales</a>
        </body></html>"#;

    #[test]
    fn extraction_strategies_are_additive_and_deduplicated() {
        let fragments = extract_fragments(PAGE, "club-page");
        let texts: Vec<&str> = fragments.iter().map(|f| f.text.as_str()).collect();
        assert!(texts.contains(&"Magny FC 78 - AS Rambouillet 12/10/2024 15h00"));
        assert!(texts.contains(&"12/10/2024 - Magny FC 78 - AS Rambouillet"));
        assert!(texts.contains(&"Calendrier Seniors"));
        assert!(!texts.iter().any(|t| t.contains("lonely")));
        let unique: HashSet<&&str> = texts.iter().collect();
        assert_eq!(unique.len(), texts.len());
    }

    #[test]
    fn team_names_come_from_team_hinted_elements() {
        assert_eq!(extract_team_names(PAGE), vec!["Magny FC 78 Seniors A"]);
    }

    #[test]
    fn sub_links_only_cover_relevant_pages() {
        assert_eq!(discover_sub_links(PAGE), vec!["/calendrier/seniors"]);
    }

    #[test]
    fn json_array_bodies_split_into_fragments() {
        let fragments = fragments_from_json(r#"[{"a":1},{"a":2}]"#, "api");
        assert_eq!(fragments.len(), 2);
        assert_eq!(fragments[0].source, "api");
    }

    #[test]
    fn hydra_member_bodies_split_into_fragments() {
        let body = r#"{"hydra:member":[{"home":"Magny FC 78"},{"home":"AS Poissy"}]}"#;
        assert_eq!(fragments_from_json(body, "api").len(), 2);
    }

    #[test]
    fn scalar_bodies_become_one_fragment_and_empty_none() {
        assert_eq!(fragments_from_json("plain text", "api").len(), 1);
        assert!(fragments_from_json("   ", "api").is_empty());
    }
}
