//! Prometheus metrics collection and formatting.
//!
//! Values are read from the shared store, so every instance reports the
//! cluster-wide view.

use std::fmt::Write;

use taskmesh_core::{TaskStatus, WorkerStatus};

use crate::coordinator::Coordinator;

const TASK_STATUSES: [TaskStatus; 7] = [
    TaskStatus::Pending,
    TaskStatus::Claimed,
    TaskStatus::Running,
    TaskStatus::Blocked,
    TaskStatus::Completed,
    TaskStatus::Failed,
    TaskStatus::Cancelled,
];

/// Collect all metrics and format as Prometheus text.
pub async fn collect_metrics(coordinator: &Coordinator) -> String {
    let mut output = String::new();

    collect_task_metrics(coordinator, &mut output).await;
    collect_worker_metrics(coordinator, &mut output).await;
    collect_budget_metrics(coordinator, &mut output).await;
    collect_bus_metrics(coordinator, &mut output).await;

    output
}

async fn collect_task_metrics(coordinator: &Coordinator, output: &mut String) {
    let tasks = coordinator.pool().tasks().await.unwrap_or_default();

    writeln!(output, "# HELP taskmesh_tasks_total Number of tasks by status").ok();
    writeln!(output, "# TYPE taskmesh_tasks_total gauge").ok();
    for status in TASK_STATUSES {
        let count = tasks.iter().filter(|t| t.status == status).count();
        writeln!(output, "taskmesh_tasks_total{{status=\"{status}\"}} {count}").ok();
    }
}

async fn collect_worker_metrics(coordinator: &Coordinator, output: &mut String) {
    let pool = coordinator.pool();
    let active = pool.active_workers().await.unwrap_or_default();
    let finished = pool.finished_workers().await.unwrap_or_default();

    let mut pending = 0u64;
    let mut running = 0u64;
    let mut completed = 0u64;
    let mut failed = 0u64;
    let mut zombie = 0u64;

    for worker in active.iter().chain(finished.iter()) {
        match worker.status {
            WorkerStatus::Pending => pending += 1,
            WorkerStatus::Running => running += 1,
            WorkerStatus::Completed => completed += 1,
            WorkerStatus::Failed => failed += 1,
            WorkerStatus::Zombie => zombie += 1,
        }
    }

    writeln!(output, "# HELP taskmesh_workers Number of workers by status").ok();
    writeln!(output, "# TYPE taskmesh_workers gauge").ok();
    writeln!(output, "taskmesh_workers{{status=\"pending\"}} {pending}").ok();
    writeln!(output, "taskmesh_workers{{status=\"running\"}} {running}").ok();
    writeln!(output, "taskmesh_workers{{status=\"completed\"}} {completed}").ok();
    writeln!(output, "taskmesh_workers{{status=\"failed\"}} {failed}").ok();
    writeln!(output, "taskmesh_workers{{status=\"zombie\"}} {zombie}").ok();

    if let Ok(timeout) = pool.heartbeat_timeout().await {
        writeln!(
            output,
            "# HELP taskmesh_heartbeat_timeout_seconds Current adaptive heartbeat timeout"
        )
        .ok();
        writeln!(output, "# TYPE taskmesh_heartbeat_timeout_seconds gauge").ok();
        writeln!(
            output,
            "taskmesh_heartbeat_timeout_seconds {}",
            timeout.num_seconds()
        )
        .ok();
    }
}

async fn collect_budget_metrics(coordinator: &Coordinator, output: &mut String) {
    let Ok(budget) = coordinator.ledger().snapshot().await else {
        return;
    };

    writeln!(output, "# HELP taskmesh_budget_tokens Token budget by agent class and kind").ok();
    writeln!(output, "# TYPE taskmesh_budget_tokens gauge").ok();
    for (class, b) in &budget.per_agent_class {
        writeln!(output, "taskmesh_budget_tokens{{class=\"{class}\",kind=\"allocated\"}} {}", b.allocated).ok();
        writeln!(output, "taskmesh_budget_tokens{{class=\"{class}\",kind=\"used\"}} {}", b.used).ok();
        writeln!(output, "taskmesh_budget_tokens{{class=\"{class}\",kind=\"reserved\"}} {}", b.reserved).ok();
    }
    let emergency = &budget.emergency_reserve;
    writeln!(output, "taskmesh_budget_tokens{{class=\"emergency\",kind=\"allocated\"}} {}", emergency.total).ok();
    writeln!(output, "taskmesh_budget_tokens{{class=\"emergency\",kind=\"used\"}} {}", emergency.used).ok();
    writeln!(output, "taskmesh_budget_tokens{{class=\"emergency\",kind=\"reserved\"}} {}", emergency.reserved).ok();

    writeln!(output, "# HELP taskmesh_budget_global_used_tokens Tokens used today across all classes").ok();
    writeln!(output, "# TYPE taskmesh_budget_global_used_tokens gauge").ok();
    writeln!(output, "taskmesh_budget_global_used_tokens {}", budget.global_used).ok();
}

async fn collect_bus_metrics(coordinator: &Coordinator, output: &mut String) {
    let open_alerts = coordinator
        .alerts()
        .list(false)
        .await
        .map(|a| a.len())
        .unwrap_or_default();
    let dead_letters = coordinator
        .bus()
        .dead_letters()
        .await
        .map(|d| d.len())
        .unwrap_or_default();
    let queue_depth = coordinator.bus().queue_depth().await.unwrap_or_default();

    writeln!(output, "# HELP taskmesh_alerts_open Open health alerts").ok();
    writeln!(output, "# TYPE taskmesh_alerts_open gauge").ok();
    writeln!(output, "taskmesh_alerts_open {open_alerts}").ok();
    writeln!(output, "# HELP taskmesh_events_queued Events waiting for delivery").ok();
    writeln!(output, "# TYPE taskmesh_events_queued gauge").ok();
    writeln!(output, "taskmesh_events_queued {queue_depth}").ok();
    writeln!(output, "# HELP taskmesh_events_dead_lettered Events that exhausted delivery attempts").ok();
    writeln!(output, "# TYPE taskmesh_events_dead_lettered gauge").ok();
    writeln!(output, "taskmesh_events_dead_lettered {dead_letters}").ok();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use taskmesh_core::TaskSubmission;

    use crate::config::Config;
    use crate::executor::NullBackend;
    use crate::health::NoopTarget;

    #[tokio::test]
    async fn test_collect_metrics_reports_store_contents() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            state_dir: dir.path().to_path_buf(),
            ..Config::default()
        };
        let coordinator = Coordinator::new(config, Arc::new(NullBackend), Arc::new(NoopTarget))
            .await
            .unwrap();
        coordinator
            .submit(TaskSubmission::new("Fix the login bug", "medium"))
            .await
            .unwrap();

        let output = collect_metrics(&coordinator).await;

        assert!(output.contains("taskmesh_tasks_total{status=\"pending\"} 1"));
        assert!(output.contains("taskmesh_tasks_total{status=\"running\"} 0"));
        assert!(output.contains("taskmesh_workers{status=\"zombie\"} 0"));
        assert!(output.contains("taskmesh_budget_tokens{class=\"security\",kind=\"allocated\"} 40000"));
        assert!(output.contains("taskmesh_alerts_open 0"));
        assert!(output.contains("taskmesh_events_dead_lettered 0"));
    }
}
