//! `claimgrid simulate`: run one scheduling attempt for a scenario.
//!
//! Plays the host pipeline: phases are called in host order against an
//! in-memory store seeded from the scenario, and every status is
//! recorded in a JSON report.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::Serialize;
use tracing::{info, warn};

use claimgrid_scheduler::{
    CancellationToken, ClaimCoordinator, Code, CoordinatorConfig, CycleState, Status,
};
use claimgrid_state::{Node, StateStore, Workload};

use crate::scenario::Scenario;

/// One phase call and its result.
#[derive(Debug, Clone, Serialize)]
pub struct PhaseRecord {
    pub phase: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
    pub status: Status,
}

/// How the attempt ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Outcome {
    /// The workload may be bound to `node`.
    Bound { node: String },
    /// The attempt was parked until a requeue hint fires.
    Waiting { reason: String },
    Unschedulable { reason: String },
    Failed { reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub workload: String,
    pub phases: Vec<PhaseRecord>,
    pub outcome: Outcome,
}

impl Report {
    fn new(workload: &Workload) -> Self {
        Self {
            workload: workload.key().to_string(),
            phases: Vec::new(),
            outcome: Outcome::Unschedulable {
                reason: "no nodes".to_string(),
            },
        }
    }

    fn record(&mut self, phase: &'static str, node: Option<&Node>, status: &Status) {
        self.phases.push(PhaseRecord {
            phase,
            node: node.map(|n| n.name.clone()),
            status: status.clone(),
        });
    }

    fn finish(mut self, outcome: Outcome) -> Self {
        self.outcome = outcome;
        self
    }
}

fn reason(status: &Status) -> String {
    status.message().unwrap_or_default().to_string()
}

/// Outcome of a rejected phase before anything was reserved.
fn rejected(status: &Status) -> Outcome {
    match status.code() {
        Code::Error => Outcome::Failed { reason: reason(status) },
        Code::Pending => Outcome::Waiting { reason: reason(status) },
        _ => Outcome::Unschedulable { reason: reason(status) },
    }
}

/// Drive one attempt through the coordinator in host order.
pub fn run_attempt(
    coordinator: &ClaimCoordinator,
    workload: &Workload,
    nodes: &[Node],
    cancel: &CancellationToken,
) -> Report {
    let mut report = Report::new(workload);

    let status = coordinator.pre_enqueue(workload);
    report.record("pre_enqueue", None, &status);
    if !status.is_success() {
        return report.finish(Outcome::Waiting { reason: reason(&status) });
    }

    let mut state = CycleState::new();
    let status = coordinator.pre_filter(&mut state, workload);
    report.record("pre_filter", None, &status);
    match status.code() {
        Code::Success => {}
        Code::Skip => {
            return match nodes.first() {
                Some(node) => report.finish(Outcome::Bound { node: node.name.clone() }),
                None => report,
            };
        }
        Code::Error => return report.finish(rejected(&status)),
        _ => {
            let post = coordinator.post_filter(&state, workload);
            report.record("post_filter", None, &post);
            return report.finish(rejected(&status));
        }
    }

    let mut feasible = Vec::new();
    for node in nodes {
        let status = coordinator.filter(cancel, &state, workload, node);
        report.record("filter", Some(node), &status);
        match status.code() {
            Code::Success => feasible.push(node.clone()),
            Code::Error => return report.finish(rejected(&status)),
            _ => {}
        }
    }
    if feasible.is_empty() {
        let status = coordinator.post_filter(&state, workload);
        report.record("post_filter", None, &status);
        return report.finish(Outcome::Unschedulable { reason: reason(&status) });
    }

    if feasible.len() > 1 {
        let status = coordinator.pre_score(cancel, &mut state, workload, &feasible);
        report.record("pre_score", None, &status);
        if !status.is_success() {
            return report.finish(rejected(&status));
        }
    }

    let node = &feasible[0];
    let status = coordinator.reserve(&mut state, workload, node);
    report.record("reserve", Some(node), &status);
    if !status.is_success() {
        let undo = coordinator.unreserve(&mut state, workload, node);
        report.record("unreserve", Some(node), &undo);
        return report.finish(rejected(&status));
    }

    let status = coordinator.pre_bind(cancel, &mut state, workload, node);
    report.record("pre_bind", Some(node), &status);
    if !status.is_success() {
        let undo = coordinator.unreserve(&mut state, workload, node);
        report.record("unreserve", Some(node), &undo);
        return report.finish(rejected(&status));
    }

    let status = coordinator.post_bind(&mut state, workload, node);
    report.record("post_bind", Some(node), &status);
    report.finish(Outcome::Bound { node: node.name.clone() })
}

/// Run the `claimgrid simulate` command.
pub async fn simulate(
    scenario_path: &Path,
    config_path: Option<&Path>,
    timeout_secs: Option<u64>,
) -> anyhow::Result<()> {
    let scenario = Scenario::from_file(scenario_path)?;
    let config = match config_path {
        Some(path) => CoordinatorConfig::from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => scenario.config.clone().unwrap_or_default(),
    };

    let store = StateStore::open_in_memory()?;
    scenario.populate(&store)?;
    let coordinator = ClaimCoordinator::new(config, store)?;

    let cancel = CancellationToken::new();
    let cancel_on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, cancelling scheduling attempt");
            cancel_on_signal.cancel();
        }
    });
    if let Some(secs) = timeout_secs {
        let cancel_on_timeout = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(secs)).await;
            warn!(timeout_secs = secs, "attempt deadline reached");
            cancel_on_timeout.cancel();
        });
    }

    let report = tokio::task::spawn_blocking(move || {
        run_attempt(&coordinator, &scenario.workload, &scenario.nodes, &cancel)
    })
    .await?;

    info!(
        workload = %report.workload,
        phases = report.phases.len(),
        outcome = ?report.outcome,
        "attempt finished"
    );
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
