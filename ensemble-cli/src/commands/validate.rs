use anyhow::{Context, Result};
use ensemble::Topology;
use std::path::Path;

/// Parse and validate a topology file, printing its pools
pub fn run_validate(path: &Path) -> Result<()> {
    let topology =
        Topology::load(path).with_context(|| format!("Invalid topology {:?}", path))?;

    println!("Topology {:?} is valid", path);
    println!(
        "  security: {}  version: {}  strategy: {:?}",
        if topology.cluster().security_enabled { "on" } else { "off" },
        topology.cluster().version,
        topology.cluster().update_strategy
    );
    for pool in topology.pools() {
        println!(
            "  {:<14} count={:<3} strategy={:?} hash={}",
            pool.role().to_string(),
            pool.count(),
            topology.strategy_for(pool.role()),
            &pool.config_hash()[..12]
        );
    }
    println!("  expected tasks: {}", topology.expected_task_count());
    Ok(())
}
