use anyhow::{Context, Result};
use ensemble::{
    ImpactAnalyzer, InstanceLocks, Orchestrator, OrchestratorConfig, PlanBuilder,
    SimulatedCluster, Topology, VersionedTopology,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

pub(crate) fn load_pair(from: &Path, to: &Path) -> Result<(Topology, Topology)> {
    let old = Topology::load(from).with_context(|| format!("Invalid topology {:?}", from))?;
    let new = Topology::load(to).with_context(|| format!("Invalid topology {:?}", to))?;
    Ok((old, new))
}

pub fn run_impact(config: &OrchestratorConfig, from: &Path, to: &Path) -> Result<()> {
    let (old, new) = load_pair(from, to)?;
    let impact = ImpactAnalyzer::new(&config.impact).analyze(&old, &new);

    if impact.is_noop() {
        println!("No changes");
        return Ok(());
    }
    for (role, role_impact) in impact.iter() {
        if role_impact.is_noop() {
            continue;
        }
        println!(
            "{:<14} restart={:<5} scale_delta={:+}",
            role.to_string(),
            role_impact.restart,
            role_impact.scale_delta
        );
        for reason in &role_impact.reasons {
            println!("    {:?}", reason);
        }
    }
    Ok(())
}

/// Deploy `from` on an in-memory cluster, then print the plan towards `to`
pub async fn run_plan(config: &OrchestratorConfig, from: &Path, to: &Path) -> Result<()> {
    let (old, new) = load_pair(from, to)?;

    let sim = Arc::new(SimulatedCluster::new());
    let orchestrator = Orchestrator::new(config.clone(), sim.clone(), sim.clone(), sim);
    let handle = orchestrator.submit_topology(old.clone())?;
    orchestrator
        .wait_for_plan(handle, Duration::from_secs(60))
        .await?;

    let analyzer = ImpactAnalyzer::new(&config.impact);
    let impact = analyzer.analyze(&old, &new);
    let target = VersionedTopology {
        version: orchestrator.topology().version + 1,
        topology: Arc::new(new),
    };
    let plan = PlanBuilder::new(analyzer.coupling().clone()).build(
        &format!("deploy-v{}", target.version),
        &impact,
        &target,
        orchestrator.inventory(),
        &InstanceLocks::new(),
    );

    println!("{}", serde_json::to_string_pretty(&plan.report())?);
    Ok(())
}
