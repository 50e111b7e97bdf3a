use std::collections::BTreeMap;

use serde::Serialize;

use crate::api::models::Fixture;
use crate::error::Result;
use crate::storage::{repository, Database};

// Excitement weights. The score is a plain weighted sum over what the
// provider reports for a finished match.
const GOAL_WEIGHT: f64 = 1.0;
const LATE_GOAL_BONUS: f64 = 0.75;
const LATE_GOAL_FROM_MINUTE: u32 = 80;
const RED_CARD_WEIGHT: f64 = 0.5;
const YELLOW_CARD_WEIGHT: f64 = 0.1;
const MARGIN_PENALTY: f64 = 0.5;

/// Derived excitement score for a fixture: goals and drama push it up, a
/// one-sided scoreline pulls it down. Pure; both the create and the update
/// path of the fixture sync call this same function.
pub fn excitement_score(fixture: &Fixture) -> f64 {
    let total_goals = f64::from(fixture.home_score + fixture.away_score);
    let margin = f64::from(fixture.home_score.abs_diff(fixture.away_score));
    let late_goals = fixture
        .goal_minutes
        .iter()
        .filter(|&&minute| minute >= LATE_GOAL_FROM_MINUTE)
        .count() as f64;

    let score = total_goals * GOAL_WEIGHT
        + late_goals * LATE_GOAL_BONUS
        + f64::from(fixture.red_cards) * RED_CARD_WEIGHT
        + f64::from(fixture.yellow_cards) * YELLOW_CARD_WEIGHT
        - margin * MARGIN_PENALTY;

    score.max(0.0)
}

/// One team's line in a league table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TableRow {
    pub team_id: i64,
    pub played: u32,
    pub won: u32,
    pub drawn: u32,
    pub lost: u32,
    pub goals_for: u32,
    pub goals_against: u32,
    pub points: u32,
}

impl TableRow {
    pub fn goal_difference(&self) -> i64 {
        i64::from(self.goals_for) - i64::from(self.goals_against)
    }
}

/// Fold fixtures into a league table, ordered by points, goal difference,
/// goals for, then team id. Fixtures without both team ids are skipped.
pub fn table_from_fixtures(fixtures: &[Fixture]) -> Vec<TableRow> {
    let mut rows: BTreeMap<i64, TableRow> = BTreeMap::new();

    for fixture in fixtures {
        let (home, away) = match (fixture.home_team_id, fixture.away_team_id) {
            (Some(h), Some(a)) => (h, a),
            _ => continue,
        };

        for (team, gf, ga) in [
            (home, fixture.home_score, fixture.away_score),
            (away, fixture.away_score, fixture.home_score),
        ] {
            let row = rows.entry(team).or_insert_with(|| TableRow {
                team_id: team,
                ..TableRow::default()
            });
            row.played += 1;
            row.goals_for += gf;
            row.goals_against += ga;
            if gf > ga {
                row.won += 1;
                row.points += 3;
            } else if gf == ga {
                row.drawn += 1;
                row.points += 1;
            } else {
                row.lost += 1;
            }
        }
    }

    let mut table: Vec<TableRow> = rows.into_values().collect();
    table.sort_by(|a, b| {
        b.points
            .cmp(&a.points)
            .then(b.goal_difference().cmp(&a.goal_difference()))
            .then(b.goals_for.cmp(&a.goals_for))
            .then(a.team_id.cmp(&b.team_id))
    });
    table
}

/// Compute the table for a league from the warehouse's finished fixtures.
pub async fn league_table(db: &Database, league_id: i64) -> Result<Vec<TableRow>> {
    let docs = db
        .reader()
        .call(|conn| repository::all_docs(conn, "fixtures"))
        .await?;

    let fixtures: Vec<Fixture> = docs
        .into_iter()
        .filter_map(|(_, json)| serde_json::from_str::<Fixture>(&json).ok())
        .filter(|f| f.league_id == Some(league_id) && f.status.as_deref() == Some("FT"))
        .collect();

    Ok(table_from_fixtures(&fixtures))
}
