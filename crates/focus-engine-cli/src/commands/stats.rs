use chrono::Utc;
use clap::Subcommand;

use super::print_json;
use crate::engine::CliEngine;

#[derive(Subcommand)]
pub enum StatsAction {
    /// Today's stats
    Today,
    /// All-time stats
    All,
    /// Most recent session outcomes
    Recent {
        #[arg(long, default_value = "10")]
        limit: usize,
    },
}

pub fn run(action: StatsAction) -> Result<(), Box<dyn std::error::Error>> {
    // Opening the engine runs recovery, so a session that finished while no
    // process was running is counted.
    let engine = CliEngine::open()?;
    let db = engine.db.clone();

    match action {
        StatsAction::Today => print_json(&db.stats_today(Utc::now())?)?,
        StatsAction::All => print_json(&db.stats_all(Utc::now())?)?,
        StatsAction::Recent { limit } => print_json(&db.recent_outcomes(limit)?)?,
    }
    engine.close();
    Ok(())
}
