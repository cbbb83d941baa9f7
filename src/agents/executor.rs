//! Drives a todo list to completion.
//!
//! Each round promotes ready items, runs up to `fan_out` of them, verifies
//! what the tools produced and lets the [`Adjuster`] decide on failures. The
//! list is owned by the run; cancellation aborts whatever is not terminal.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::adjuster::{Adjuster, Adjustment};
use super::planner::Planner;
use crate::config::ExecutorConfig;
use crate::notify::{notify, Notifier, NotifyContext};
use crate::todo::{
    Action, Attempt, ExecutionReport, ExecutionResult, ItemReport, ProgrammaticCheck, TodoError,
    TodoList, ToolCallSpec, VerificationResult,
};
use crate::tools::ToolInvoker;
use crate::verify::{AttemptVerifier, VerificationRequest};

/// An item taken out for one attempt.
struct Dispatch {
    id: String,
    index: u32,
    action: Action,
    success_criteria: String,
    probe: Option<ProgrammaticCheck>,
    started_at: DateTime<Utc>,
}

/// How settling an attempt ended.
enum Settled {
    Done,
    /// Cancellation fired while the adjuster or planner was deciding; nothing was applied
    Cancelled,
}

/// Window or application named by the tool calls, if any.
fn observation_target(calls: &[ToolCallSpec]) -> Option<String> {
    calls.iter().find_map(|c| {
        ["target", "window", "app"]
            .iter()
            .find_map(|k| c.parameters.get(*k).and_then(Value::as_str))
            .map(str::to_string)
    })
}

pub struct Executor {
    planner: Arc<Planner>,
    invoker: Arc<dyn ToolInvoker>,
    verifier: Arc<dyn AttemptVerifier>,
    adjuster: Adjuster,
    notifier: Arc<dyn Notifier>,
    config: ExecutorConfig,
}

impl Executor {
    pub fn new(
        planner: Arc<Planner>,
        invoker: Arc<dyn ToolInvoker>,
        verifier: Arc<dyn AttemptVerifier>,
        adjuster: Adjuster,
        notifier: Arc<dyn Notifier>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            planner,
            invoker,
            verifier,
            adjuster,
            notifier,
            config,
        }
    }

    /// Plan `request` and run the plan.
    pub async fn run_request(&self, request: &str, cancel: CancellationToken) -> ExecutionReport {
        let started_at = Utc::now();
        let planned = tokio::select! {
            _ = cancel.cancelled() => {
                tracing::warn!("Cancelled while planning");
                return ExecutionReport::unplanned(request, started_at, true);
            }
            planned = self.planner.plan(request) => planned,
        };
        match planned {
            Ok(list) => self.run(list, cancel).await,
            Err(e) => {
                tracing::error!(error = %e, "Planning failed");
                ExecutionReport::unplanned(request, started_at, false)
            }
        }
    }

    /// Run `list` until every item is terminal or `cancel` fires.
    pub async fn run(&self, mut list: TodoList, cancel: CancellationToken) -> ExecutionReport {
        let started_at = Utc::now();
        let context = NotifyContext {
            agent: self.config.agent_name.clone(),
            session_id: list.id().to_string(),
        };
        let mut replaced: Vec<ItemReport> = Vec::new();
        let mut replans = 0u32;
        let mut cancelled = false;

        tracing::info!(list_id = %list.id(), items = list.items().len(), "Executing todo list");
        notify(
            &self.notifier,
            format!("Working on: {}", list.original_request()),
            &context,
        );

        while !list.is_finished() {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }
            match list.refresh() {
                Ok(skipped) => {
                    for id in skipped {
                        tracing::info!(item = %id, "Skipped: dependency did not complete");
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "Could not refresh todo list");
                    break;
                }
            }
            if list.is_finished() {
                break;
            }

            let fan_out = self.config.fan_out.max(1);
            let ready: Vec<String> = list.ready_ids().into_iter().take(fan_out).collect();
            if ready.is_empty() {
                tracing::error!(list_id = %list.id(), "No runnable items left");
                list.abort_remaining("no runnable items");
                break;
            }

            let batch = match start_all(&mut list, &ready) {
                Ok(batch) => batch,
                Err(e) => {
                    tracing::error!(error = %e, "Could not start items");
                    list.abort_remaining(&e.to_string());
                    break;
                }
            };

            // Phase 1: act
            let executions = tokio::select! {
                biased;
                _ = cancel.cancelled() => { cancelled = true; break; }
                executions = join_all(batch.iter().map(|d| self.execute(d))) => executions,
            };
            for d in &batch {
                if let Err(e) = list.item_mut(&d.id).and_then(|i| i.begin_verification()) {
                    tracing::error!(item = %d.id, error = %e, "Could not begin verification");
                }
            }

            // Phase 2: verify, skipping anything whose tools failed
            let verifications = tokio::select! {
                biased;
                _ = cancel.cancelled() => { cancelled = true; break; }
                verifications = join_all(
                    batch.iter().zip(&executions).map(|(d, e)| self.verify(d, e))
                ) => verifications,
            };

            for ((dispatch, execution), verification) in
                batch.into_iter().zip(executions).zip(verifications)
            {
                if cancel.is_cancelled() {
                    cancelled = true;
                    break;
                }
                let id = dispatch.id.clone();
                match self
                    .settle(
                        &mut list,
                        dispatch,
                        execution,
                        verification,
                        &mut replaced,
                        &mut replans,
                        &context,
                        &cancel,
                    )
                    .await
                {
                    Ok(Settled::Done) => {}
                    Ok(Settled::Cancelled) => {
                        cancelled = true;
                        break;
                    }
                    Err(e) => {
                        tracing::error!(item = %id, error = %e, "Invalid item transition");
                        if let Ok(item) = list.item_mut(&id) {
                            let _ = item.abort(e.to_string());
                        }
                    }
                }
            }
            if cancelled {
                break;
            }
        }

        if cancelled {
            let aborted = list.abort_remaining("cancelled");
            tracing::warn!(list_id = %list.id(), aborted = aborted.len(), "Execution cancelled");
        }

        let report = ExecutionReport::from_list(&list, replaced, replans, cancelled, started_at);
        tracing::info!(
            list_id = %report.list_id,
            completed = report.counts.completed,
            failed = report.counts.failed,
            skipped = report.counts.skipped,
            aborted = report.counts.aborted,
            replans = report.replans,
            "Execution finished"
        );
        notify(
            &self.notifier,
            format!(
                "Finished: {} completed, {} failed, {} skipped",
                report.counts.completed, report.counts.failed, report.counts.skipped
            ),
            &context,
        );
        report
    }

    /// Invoke the action's tool calls in order, stopping at the first error.
    async fn execute(&self, dispatch: &Dispatch) -> ExecutionResult {
        let calls = &dispatch.action.tool_calls;
        let mut outputs = Vec::with_capacity(calls.len());
        for call in calls {
            match self
                .invoker
                .invoke(&call.provider, &call.operation, call.parameters.clone())
                .await
            {
                Ok(output) => outputs.push(output),
                Err(e) => {
                    tracing::warn!(
                        item = %dispatch.id,
                        attempt = dispatch.index,
                        provider = %call.provider,
                        operation = %call.operation,
                        error = %e,
                        "Tool call failed"
                    );
                    return ExecutionResult::failed(Value::Array(outputs), e);
                }
            }
        }
        let output = match outputs.len() {
            0 => Value::Null,
            1 => outputs.remove(0),
            _ => Value::Array(outputs),
        };
        ExecutionResult::succeeded(output)
    }

    async fn verify(
        &self,
        dispatch: &Dispatch,
        execution: &ExecutionResult,
    ) -> Option<VerificationResult> {
        if !execution.success {
            return None;
        }
        let request = VerificationRequest {
            item_id: dispatch.id.clone(),
            action: dispatch.action.description.clone(),
            success_criteria: dispatch.success_criteria.clone(),
            execution: execution.clone(),
            probe: dispatch.probe.clone(),
            target: observation_target(&dispatch.action.tool_calls),
        };
        Some(self.verifier.verify(&request).await)
    }

    /// Record the attempt and move the item on.
    #[allow(clippy::too_many_arguments)]
    async fn settle(
        &self,
        list: &mut TodoList,
        dispatch: Dispatch,
        execution: ExecutionResult,
        verification: Option<VerificationResult>,
        replaced: &mut Vec<ItemReport>,
        replans: &mut u32,
        context: &NotifyContext,
        cancel: &CancellationToken,
    ) -> Result<Settled, TodoError> {
        let id = dispatch.id;
        let attempt = Attempt::new(
            dispatch.index,
            dispatch.action.tool_calls,
            execution,
            verification,
            dispatch.started_at,
        );
        let verified = attempt.verified();
        let item = list.item_mut(&id)?;
        item.record_attempt(attempt)?;

        if verified {
            item.complete()?;
            tracing::info!(item = %id, attempt = dispatch.index, "Item completed");
            notify(&self.notifier, format!("Done: {}", item.action().description), context);
            return Ok(Settled::Done);
        }

        let decision = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(Settled::Cancelled),
            decision = self.adjuster.adjust(item, *replans) => decision,
        };
        tracing::info!(item = %id, attempt = dispatch.index, decision = ?decision, "Attempt not verified");
        match decision {
            Adjustment::Retry { .. } => item.retry().map(|_| Settled::Done),
            Adjustment::Rewrite {
                action,
                success_criteria,
                ..
            } => {
                item.rewrite(action, success_criteria)?;
                item.retry().map(|_| Settled::Done)
            }
            Adjustment::Fail { reason } => {
                item.fail(reason)?;
                notify(&self.notifier, format!("Failed: {}", item.action().description), context);
                Ok(Settled::Done)
            }
            Adjustment::Replan { reason } => {
                let failed = item.clone();
                let replanned = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Ok(Settled::Cancelled),
                    replanned = self.planner.replan(list, &failed) => replanned,
                };
                let replacements = match replanned {
                    Ok(replacements) => replacements,
                    Err(e) => {
                        tracing::warn!(item = %id, error = %e, "Replan failed");
                        list.item_mut(&id)?.fail(reason)?;
                        return Ok(Settled::Done);
                    }
                };
                list.item_mut(&id)?.fail(format!("{}; replaced by replan", reason))?;
                *replans += 1;
                match list.replace_item(&id, replacements, &format!("r{}", *replans)) {
                    Ok(removed) => {
                        tracing::info!(item = %id, replans = *replans, "Item replaced by replan");
                        replaced.push(ItemReport::from(&removed));
                    }
                    Err(e) => {
                        tracing::warn!(item = %id, error = %e, "Replan rejected, item stays failed");
                    }
                }
                Ok(Settled::Done)
            }
        }
    }
}

fn start_all(list: &mut TodoList, ids: &[String]) -> Result<Vec<Dispatch>, TodoError> {
    ids.iter()
        .map(|id| {
            let item = list.item_mut(id)?;
            let index = item.start()?;
            tracing::debug!(item = %id, attempt = index, "Starting attempt");
            Ok(Dispatch {
                id: id.clone(),
                index,
                action: item.action().clone(),
                success_criteria: item.success_criteria().to_string(),
                probe: item.probe().cloned(),
                started_at: Utc::now(),
            })
        })
        .collect()
}
