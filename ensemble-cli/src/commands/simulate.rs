use super::impact::load_pair;
use anyhow::{Context, Result};
use ensemble::{
    InstanceId, Orchestrator, OrchestratorConfig, PlanStatusReport, SimulatedCluster, Topology,
    TransitionSequence, UpdateStrategy,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

const PLAN_WAIT: Duration = Duration::from_secs(300);

fn print_report(report: &PlanStatusReport) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(report)?);
    Ok(())
}

fn simulated(config: &OrchestratorConfig) -> (Arc<SimulatedCluster>, Orchestrator) {
    let sim = Arc::new(SimulatedCluster::new());
    let orchestrator = Orchestrator::new(config.clone(), sim.clone(), sim.clone(), sim.clone());
    (sim, orchestrator)
}

async fn deploy(orchestrator: &Orchestrator, topology: Topology) -> Result<()> {
    let handle = orchestrator.submit_topology(topology)?;
    let report = orchestrator.wait_for_plan(handle, PLAN_WAIT).await?;
    print_report(&report)
}

pub async fn run_simulate(
    config: &OrchestratorConfig,
    from: &Path,
    to: &Path,
    replace: Option<&str>,
    parallel: bool,
) -> Result<()> {
    let (old, new) = load_pair(from, to)?;
    let (sim, orchestrator) = simulated(config);

    deploy(&orchestrator, old).await?;

    let strategy = parallel.then_some(UpdateStrategy::Parallel);
    let handle = orchestrator.submit_with_strategy(new, strategy)?;

    let replacement = match replace {
        Some(instance) => {
            let id: InstanceId = instance
                .parse()
                .with_context(|| format!("Invalid instance '{}'", instance))?;
            match orchestrator.replace_node(id.role.clone(), id.ordinal) {
                Ok(handle) => Some(handle),
                Err(e) => {
                    tracing::warn!("Replacement of {} rejected: {}", id, e);
                    None
                }
            }
        }
        None => None,
    };

    print_report(&orchestrator.wait_for_plan(handle, PLAN_WAIT).await?)?;
    if let Some(handle) = replacement {
        print_report(&orchestrator.wait_for_plan(handle, PLAN_WAIT).await?)?;
    }

    println!(
        "{} tasks running, {} launches total",
        sim.running().len(),
        sim.total_launches()
    );
    Ok(())
}

pub async fn run_transition(
    config: &OrchestratorConfig,
    from: &Path,
    sequence: &TransitionSequence,
) -> Result<()> {
    let old = Topology::load(from).with_context(|| format!("Invalid topology {:?}", from))?;
    let (_sim, orchestrator) = simulated(config);

    deploy(&orchestrator, old).await?;

    let report = orchestrator.run_transition(sequence).await?;
    println!(
        "Transition '{}' completed: {}",
        report.sequence,
        report.completed.join(", ")
    );
    Ok(())
}
