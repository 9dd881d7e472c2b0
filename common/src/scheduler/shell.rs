// Runs one fired trigger's job and reports the outcome back to the store

use crate::context::{JobExecutionContext, SchedulerInfo};
use crate::errors::SchedulerError;
use crate::job::{Job, JobExecutionError};
use crate::keys::{JobKey, TriggerKey};
use crate::listeners::ListenerManager;
use crate::models::{CompletedExecutionInstruction, FiredTriggerBundle, JobDetail, Trigger};
use crate::retry::{ExponentialBackoff, RetryStrategy};
use crate::store::{JobStore, StoreBackend};
use crate::telemetry;
use futures::FutureExt;
use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

/// A job currently running on this node
#[derive(Debug)]
pub(crate) struct RunningJob {
    pub job_key: JobKey,
    pub trigger_key: TriggerKey,
    interrupt: watch::Sender<bool>,
}

impl RunningJob {
    pub fn interrupt(&self) {
        self.interrupt.send_replace(true);
    }
}

/// Jobs in flight, by fire instance id
#[derive(Debug, Default)]
pub(crate) struct RunningJobs {
    jobs: Mutex<HashMap<String, RunningJob>>,
}

impl RunningJobs {
    pub fn lock(&self) -> MutexGuard<'_, HashMap<String, RunningJob>> {
        self.jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Collaborators every shell needs, shared by the coordinator
pub(crate) struct ShellEnv<B: StoreBackend> {
    pub store: Arc<JobStore<B>>,
    pub listeners: Arc<ListenerManager>,
    pub running: Arc<RunningJobs>,
    pub info: SchedulerInfo,
    pub shutting_down: Arc<AtomicBool>,
    pub completion_retry: ExponentialBackoff,
}

impl<B: StoreBackend> Clone for ShellEnv<B> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            listeners: Arc::clone(&self.listeners),
            running: Arc::clone(&self.running),
            info: self.info.clone(),
            shutting_down: Arc::clone(&self.shutting_down),
            completion_retry: self.completion_retry.clone(),
        }
    }
}

impl<B: StoreBackend> ShellEnv<B> {
    /// Report a finished firing, retrying store failures until it sticks or
    /// the scheduler shuts down. An unreported completion is reclaimed by
    /// recovery on the next start.
    pub async fn complete(
        &self,
        trigger: &Trigger,
        job: &JobDetail,
        instruction: CompletedExecutionInstruction,
    ) {
        let mut attempt = 0;
        loop {
            match self.store.triggered_job_complete(trigger, job, instruction).await {
                Ok(()) => return,
                Err(e) => {
                    if self.shutting_down.load(Ordering::SeqCst) {
                        error!(
                            trigger = %trigger.key,
                            error = %e,
                            "Could not report job completion before shutdown"
                        );
                        return;
                    }
                    let Some(delay) = self.completion_retry.next_delay(attempt) else {
                        error!(trigger = %trigger.key, error = %e, "Giving up reporting job completion");
                        return;
                    };
                    warn!(
                        trigger = %trigger.key,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Failed to report job completion, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

/// Drives a single fired bundle through listeners, the job and completion
pub(crate) struct JobRunShell<B: StoreBackend> {
    env: ShellEnv<B>,
    bundle: FiredTriggerBundle,
    job: Arc<dyn Job>,
}

impl<B: StoreBackend> JobRunShell<B> {
    pub fn new(env: ShellEnv<B>, bundle: FiredTriggerBundle, job: Arc<dyn Job>) -> Self {
        Self { env, bundle, job }
    }

    #[instrument(
        name = "job_run",
        skip(self),
        fields(
            job = %self.bundle.job.key,
            trigger = %self.bundle.trigger.key,
            fire_instance_id = %self.bundle.fire_instance_id
        )
    )]
    pub async fn run(self) {
        let Self { env, bundle, job } = self;
        let fire_instance_id = bundle.fire_instance_id.clone();
        let job_type = bundle.job.job_type.clone();

        let (interrupt_tx, interrupt_rx) = watch::channel(false);
        env.running.lock().insert(
            fire_instance_id.clone(),
            RunningJob {
                job_key: bundle.job.key.clone(),
                trigger_key: bundle.trigger.key.clone(),
                interrupt: interrupt_tx,
            },
        );

        let mut ctx = JobExecutionContext::new(env.info.clone(), bundle, job)
            .with_interrupt_signal(interrupt_rx);

        // Listener callbacks run outside the job's own panic guard
        let outcome = AssertUnwindSafe(execute_with_listeners(&env, &mut ctx, &job_type))
            .catch_unwind()
            .await;
        let instruction = match outcome {
            Ok(instruction) => instruction,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(panic = %message, "Listener panicked, setting all job triggers to ERROR");
                env.listeners
                    .notify_scheduler_error(
                        &format!(
                            "Unable to notify listeners for job '{}'",
                            ctx.job_detail().key
                        ),
                        &SchedulerError::ListenerFailed(message),
                    )
                    .await;
                CompletedExecutionInstruction::SetAllJobTriggersError
            }
        };

        let (trigger, job_detail) = ctx.into_parts();
        env.complete(&trigger, &job_detail, instruction).await;
        env.running.lock().remove(&fire_instance_id);
    }
}

/// Listener notifications, the job itself and the refire loop. Returns the
/// instruction to report to the store.
async fn execute_with_listeners<B: StoreBackend>(
    env: &ShellEnv<B>,
    ctx: &mut JobExecutionContext,
    job_type: &str,
) -> CompletedExecutionInstruction {
    let trigger_listeners = env.listeners.trigger_listeners_for(ctx.trigger().key());
    let job_listeners = env.listeners.job_listeners_for(&ctx.job_detail().key);

    loop {
        let mut vetoed = false;
        for listener in &trigger_listeners {
            listener.trigger_fired(ctx.trigger(), ctx).await;
            if listener.veto_job_execution(ctx.trigger(), ctx).await {
                debug!(listener = listener.name(), "Job execution vetoed");
                vetoed = true;
            }
        }

        if vetoed {
            for listener in &job_listeners {
                listener.job_execution_vetoed(ctx).await;
            }
            telemetry::record_job_execution(job_type, "vetoed", None);
            return ctx.trigger().execution_complete(None);
        }

        for listener in &job_listeners {
            listener.job_to_be_executed(ctx).await;
        }

        let job = Arc::clone(ctx.job_instance());
        let started = Instant::now();
        let outcome = AssertUnwindSafe(job.execute(ctx)).catch_unwind().await;
        let run_time = started.elapsed();
        ctx.set_job_run_time(run_time);

        let failure = match outcome {
            Ok(Ok(())) => {
                telemetry::record_job_execution(job_type, "success", Some(run_time));
                None
            }
            Ok(Err(e)) => {
                info!(error = %e, "Job execution failed");
                telemetry::record_job_execution(job_type, "failed", Some(run_time));
                Some(e)
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(panic = %message, "Job panicked");
                telemetry::record_job_execution(job_type, "panicked", Some(run_time));
                Some(JobExecutionError::new(format!(
                    "Job threw an unhandled panic: {}",
                    message
                )))
            }
        };

        for listener in &job_listeners {
            listener.job_was_executed(ctx, failure.as_ref()).await;
        }

        let instruction = ctx.trigger().execution_complete(failure.as_ref());
        for listener in &trigger_listeners {
            listener.trigger_complete(ctx.trigger(), ctx, instruction).await;
        }

        if instruction == CompletedExecutionInstruction::ReExecuteJob {
            if env.shutting_down.load(Ordering::SeqCst) {
                warn!("Not re-executing job during shutdown");
                return CompletedExecutionInstruction::Noop;
            }
            ctx.increment_refire_count();
            debug!(refire_count = ctx.refire_count(), "Re-executing job");
            continue;
        }
        return instruction;
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Completion backoff: starts at `base`, capped at ten times it.
pub(crate) fn completion_backoff(base: Duration) -> ExponentialBackoff {
    let base = base.max(Duration::from_millis(10));
    ExponentialBackoff::new(base, base * 10).with_jitter(0.1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_message_extraction() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");

        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");

        let payload: Box<dyn Any + Send> = Box::new(42_u8);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic payload");
    }

    #[test]
    fn test_completion_backoff_is_floored_and_capped() {
        let backoff = completion_backoff(Duration::ZERO);
        let first = backoff.next_delay(0).unwrap();
        assert!(first >= Duration::from_millis(10));
        assert!(backoff.next_delay(30).unwrap() <= Duration::from_millis(110));
    }
}
