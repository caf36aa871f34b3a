use std::path::PathBuf;

use super::load_scenario_files;

pub fn run(paths: &[PathBuf]) -> anyhow::Result<()> {
    let files = load_scenario_files(paths)?;
    let mut total = 0;
    for file in &files {
        println!("{} ({} scenarios)", file.name, file.scenarios.len());
        for scenario in &file.scenarios {
            println!("  {:<32} [{}] {}", scenario.id, scenario.kind(), scenario.title());
        }
        total += file.scenarios.len();
    }
    println!("{total} scenarios in {} files", files.len());
    Ok(())
}
