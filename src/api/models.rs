use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::sync::SyncDoc;

/// Best-effort identifier for error reporting on raw items.
pub fn item_id(raw: &Value) -> String {
    match raw.get("id") {
        Some(Value::String(s)) => s.clone(),
        Some(v) => v.to_string(),
        None => "<unknown>".to_string(),
    }
}

fn decode<T: serde::de::DeserializeOwned>(raw: &Value) -> Result<T> {
    serde_json::from_value(raw.clone()).map_err(|e| Error::Transform {
        id: item_id(raw),
        message: e.to_string(),
    })
}

// ── Leagues ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct League {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub current_season_id: Option<i64>,
    #[serde(default)]
    pub is_cup: bool,
}

pub fn transform_league(raw: &Value) -> Result<SyncDoc> {
    let league: League = decode(raw)?;
    Ok(SyncDoc {
        id: league.id.to_string(),
        doc: serde_json::to_value(&league)?,
    })
}

// ── Teams ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Team {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub short_code: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub venue: Option<String>,
    #[serde(default)]
    pub founded: Option<i32>,
}

pub fn transform_team(raw: &Value) -> Result<SyncDoc> {
    let team: Team = decode(raw)?;
    Ok(SyncDoc {
        id: team.id.to_string(),
        doc: serde_json::to_value(&team)?,
    })
}

// ── Players ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Player {
    pub id: i64,
    pub display_name: String,
    #[serde(default)]
    pub team_id: Option<i64>,
    #[serde(default)]
    pub position: Option<String>,
    #[serde(default)]
    pub nationality: Option<String>,
    #[serde(default)]
    pub date_of_birth: Option<String>,
}

pub fn transform_player(raw: &Value) -> Result<SyncDoc> {
    let player: Player = decode(raw)?;
    Ok(SyncDoc {
        id: player.id.to_string(),
        doc: serde_json::to_value(&player)?,
    })
}

// ── Fixtures ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fixture {
    pub id: i64,
    #[serde(default)]
    pub league_id: Option<i64>,
    #[serde(default)]
    pub season_id: Option<i64>,
    #[serde(default)]
    pub home_team_id: Option<i64>,
    #[serde(default)]
    pub away_team_id: Option<i64>,
    #[serde(default)]
    pub home_score: u32,
    #[serde(default)]
    pub away_score: u32,
    #[serde(default)]
    pub yellow_cards: u32,
    #[serde(default)]
    pub red_cards: u32,
    /// Match minutes at which goals fell, when the provider includes events.
    #[serde(default)]
    pub goal_minutes: Vec<u32>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub starting_at: Option<String>,
}

/// Fixture transform: validate, then attach the derived excitement score.
/// One stateless code path serves both newly created and updated fixtures.
pub fn transform_fixture(raw: &Value) -> Result<SyncDoc> {
    let fixture: Fixture = decode(raw)?;
    let score = crate::metrics::excitement_score(&fixture);
    let mut doc = serde_json::to_value(&fixture)?;
    doc["excitement_score"] = serde_json::json!(score);
    Ok(SyncDoc {
        id: fixture.id.to_string(),
        doc,
    })
}

// ── Coaches ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Coach {
    pub id: i64,
    pub fullname: String,
    #[serde(default)]
    pub team_id: Option<i64>,
    #[serde(default)]
    pub nationality: Option<String>,
}

pub fn transform_coach(raw: &Value) -> Result<SyncDoc> {
    let coach: Coach = decode(raw)?;
    Ok(SyncDoc {
        id: coach.id.to_string(),
        doc: serde_json::to_value(&coach)?,
    })
}

// ── Rivalry pairs ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RivalPair {
    pub team_id: i64,
    pub rival_id: i64,
}

impl RivalPair {
    pub fn pair_id(&self) -> String {
        format!("{}:{}", self.team_id, self.rival_id)
    }
}

pub fn transform_rival_pair(raw: &Value) -> Result<SyncDoc> {
    let pair: RivalPair = decode(raw)?;
    Ok(SyncDoc {
        id: pair.pair_id(),
        doc: serde_json::to_value(&pair)?,
    })
}

// ── Head-to-head ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeadToHead {
    pub team_a_id: i64,
    pub team_b_id: i64,
    pub played: u32,
    pub wins_a: u32,
    pub wins_b: u32,
    pub draws: u32,
    #[serde(default)]
    pub last_meeting_at: Option<String>,
}

impl HeadToHead {
    /// Record identifier, normalized so (a, b) and (b, a) share one document.
    pub fn record_id(team_a: i64, team_b: i64) -> String {
        let (low, high) = if team_a <= team_b {
            (team_a, team_b)
        } else {
            (team_b, team_a)
        };
        format!("{low}:{high}")
    }

    pub fn to_sync_doc(&self) -> Result<SyncDoc> {
        Ok(SyncDoc {
            id: Self::record_id(self.team_a_id, self.team_b_id),
            doc: serde_json::to_value(self)?,
        })
    }
}

/// Fold the fixtures between two teams into one head-to-head summary.
/// Fixtures not involving exactly this pairing are ignored.
pub fn summarize_h2h(team_a: i64, team_b: i64, fixtures: &[Fixture]) -> HeadToHead {
    let (team_a, team_b) = if team_a <= team_b {
        (team_a, team_b)
    } else {
        (team_b, team_a)
    };
    let mut summary = HeadToHead {
        team_a_id: team_a,
        team_b_id: team_b,
        played: 0,
        wins_a: 0,
        wins_b: 0,
        draws: 0,
        last_meeting_at: None,
    };

    for fixture in fixtures {
        let (home, away) = match (fixture.home_team_id, fixture.away_team_id) {
            (Some(h), Some(a)) => (h, a),
            _ => continue,
        };
        let involves_pair =
            (home == team_a && away == team_b) || (home == team_b && away == team_a);
        if !involves_pair {
            continue;
        }

        summary.played += 1;
        let (a_goals, b_goals) = if home == team_a {
            (fixture.home_score, fixture.away_score)
        } else {
            (fixture.away_score, fixture.home_score)
        };
        if a_goals > b_goals {
            summary.wins_a += 1;
        } else if b_goals > a_goals {
            summary.wins_b += 1;
        } else {
            summary.draws += 1;
        }

        // ISO-8601 strings order lexicographically.
        if let Some(ref at) = fixture.starting_at {
            if summary
                .last_meeting_at
                .as_ref()
                .map(|last| at > last)
                .unwrap_or(true)
            {
                summary.last_meeting_at = Some(at.clone());
            }
        }
    }

    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn transform_league_validates_and_keys_by_id() {
        let raw = json!({"id": 8, "name": "Premier League", "country": "England"});
        let doc = transform_league(&raw).unwrap();
        assert_eq!(doc.id, "8");
        assert_eq!(doc.doc["name"], "Premier League");
    }

    #[test]
    fn transform_failure_carries_the_item_id() {
        // Missing required `name`.
        let raw = json!({"id": 42});
        let err = transform_league(&raw).unwrap_err();
        match err {
            Error::Transform { id, .. } => assert_eq!(id, "42"),
            other => panic!("expected Transform error, got {other:?}"),
        }
    }

    #[test]
    fn item_id_handles_strings_numbers_and_absence() {
        assert_eq!(item_id(&json!({"id": "abc"})), "abc");
        assert_eq!(item_id(&json!({"id": 17})), "17");
        assert_eq!(item_id(&json!({"name": "no id"})), "<unknown>");
    }

    #[test]
    fn transform_fixture_attaches_excitement_score() {
        let raw = json!({
            "id": 1001,
            "league_id": 8,
            "home_team_id": 1,
            "away_team_id": 2,
            "home_score": 3,
            "away_score": 2,
            "goal_minutes": [12, 44, 78, 85, 90]
        });
        let doc = transform_fixture(&raw).unwrap();
        assert_eq!(doc.id, "1001");
        assert!(doc.doc["excitement_score"].as_f64().unwrap() > 0.0);
    }

    #[test]
    fn rival_pair_id_is_directional() {
        let pair = RivalPair {
            team_id: 5,
            rival_id: 9,
        };
        assert_eq!(pair.pair_id(), "5:9");
    }

    #[test]
    fn h2h_record_id_is_order_independent() {
        assert_eq!(HeadToHead::record_id(9, 5), "5:9");
        assert_eq!(HeadToHead::record_id(5, 9), "5:9");
    }

    fn fixture(home: i64, away: i64, home_score: u32, away_score: u32, at: &str) -> Fixture {
        Fixture {
            id: 0,
            league_id: None,
            season_id: None,
            home_team_id: Some(home),
            away_team_id: Some(away),
            home_score,
            away_score,
            yellow_cards: 0,
            red_cards: 0,
            goal_minutes: Vec::new(),
            status: Some("FT".into()),
            starting_at: Some(at.to_string()),
        }
    }

    #[test]
    fn summarize_h2h_counts_results_from_both_venues() {
        let fixtures = vec![
            fixture(5, 9, 2, 0, "2026-01-10T15:00:00Z"), // team 5 wins at home
            fixture(9, 5, 3, 1, "2026-02-14T15:00:00Z"), // team 9 wins at home
            fixture(5, 9, 1, 1, "2026-03-20T15:00:00Z"), // draw
            fixture(5, 7, 4, 0, "2026-03-21T15:00:00Z"), // different pairing, ignored
        ];
        let summary = summarize_h2h(9, 5, &fixtures);
        assert_eq!(summary.team_a_id, 5);
        assert_eq!(summary.team_b_id, 9);
        assert_eq!(summary.played, 3);
        assert_eq!(summary.wins_a, 1);
        assert_eq!(summary.wins_b, 1);
        assert_eq!(summary.draws, 1);
        assert_eq!(
            summary.last_meeting_at.as_deref(),
            Some("2026-03-20T15:00:00Z")
        );
    }
}
