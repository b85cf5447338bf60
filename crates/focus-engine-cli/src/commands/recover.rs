use super::print_json;
use crate::engine::CliEngine;

pub fn run() -> Result<(), Box<dyn std::error::Error>> {
    let engine = CliEngine::open()?;
    print_json(&engine.report)?;
    engine.close();
    Ok(())
}
