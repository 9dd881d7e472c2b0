// Job, trigger and scheduler listeners with matcher-filtered dispatch

use crate::context::JobExecutionContext;
use crate::errors::SchedulerError;
use crate::job::JobExecutionError;
use crate::keys::{JobKey, TriggerKey};
use crate::matchers::Matcher;
use crate::models::{CompletedExecutionInstruction, Trigger};
use async_trait::async_trait;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

/// Observer of job executions
#[async_trait]
pub trait JobListener: Send + Sync {
    /// Registration name; registering the same name again replaces the listener.
    fn name(&self) -> &str;

    async fn job_to_be_executed(&self, _ctx: &JobExecutionContext) {}

    async fn job_execution_vetoed(&self, _ctx: &JobExecutionContext) {}

    async fn job_was_executed(
        &self,
        _ctx: &JobExecutionContext,
        _error: Option<&JobExecutionError>,
    ) {
    }
}

/// Observer of trigger firings, with the power to veto an execution
#[async_trait]
pub trait TriggerListener: Send + Sync {
    fn name(&self) -> &str;

    async fn trigger_fired(&self, _trigger: &Trigger, _ctx: &JobExecutionContext) {}

    /// Return `true` to stop the job from running for this firing.
    async fn veto_job_execution(&self, _trigger: &Trigger, _ctx: &JobExecutionContext) -> bool {
        false
    }

    async fn trigger_misfired(&self, _trigger: &Trigger) {}

    async fn trigger_complete(
        &self,
        _trigger: &Trigger,
        _ctx: &JobExecutionContext,
        _instruction: CompletedExecutionInstruction,
    ) {
    }
}

/// Observer of scheduler-level events
#[async_trait]
pub trait SchedulerListener: Send + Sync {
    async fn job_scheduled(&self, _trigger: &Trigger) {}

    async fn job_unscheduled(&self, _key: &TriggerKey) {}

    /// The trigger will never fire again.
    async fn trigger_finalized(&self, _trigger: &Trigger) {}

    async fn job_added(&self, _key: &JobKey) {}

    async fn job_deleted(&self, _key: &JobKey) {}

    /// A persistent or unexpected failure inside the scheduler.
    async fn scheduler_error(&self, _message: &str, _error: &SchedulerError) {}

    async fn scheduler_started(&self) {}

    async fn scheduler_shutdown(&self) {}
}

struct Registration<L: ?Sized, K> {
    listener: Arc<L>,
    matchers: Vec<Matcher<K>>,
}

type JobRegistrations = Vec<Registration<dyn JobListener, JobKey>>;
type TriggerRegistrations = Vec<Registration<dyn TriggerListener, TriggerKey>>;

/// Holds registered listeners and answers which ones apply to a key
#[derive(Default)]
pub struct ListenerManager {
    job_listeners: RwLock<JobRegistrations>,
    trigger_listeners: RwLock<TriggerRegistrations>,
    scheduler_listeners: RwLock<Vec<Arc<dyn SchedulerListener>>>,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn or_everything<K>(matchers: Vec<Matcher<K>>) -> Vec<Matcher<K>> {
    if matchers.is_empty() {
        vec![Matcher::everything()]
    } else {
        matchers
    }
}

impl ListenerManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job listener; no matchers means every job.
    pub fn add_job_listener(&self, listener: Arc<dyn JobListener>, matchers: Vec<Matcher<JobKey>>) {
        let matchers = or_everything(matchers);
        let mut listeners = write(&self.job_listeners);
        listeners.retain(|r| r.listener.name() != listener.name());
        debug!(listener = listener.name(), "Job listener registered");
        listeners.push(Registration { listener, matchers });
    }

    /// Add a matcher to a registered job listener; adding an equal matcher
    /// twice has no effect.
    pub fn add_job_listener_matcher(&self, name: &str, matcher: Matcher<JobKey>) -> bool {
        let mut listeners = write(&self.job_listeners);
        match listeners.iter_mut().find(|r| r.listener.name() == name) {
            Some(registration) => {
                if !registration.matchers.contains(&matcher) {
                    registration.matchers.push(matcher);
                }
                true
            }
            None => false,
        }
    }

    pub fn remove_job_listener(&self, name: &str) -> bool {
        let mut listeners = write(&self.job_listeners);
        let before = listeners.len();
        listeners.retain(|r| r.listener.name() != name);
        listeners.len() != before
    }

    pub fn job_listener_matchers(&self, name: &str) -> Option<Vec<Matcher<JobKey>>> {
        read(&self.job_listeners)
            .iter()
            .find(|r| r.listener.name() == name)
            .map(|r| r.matchers.clone())
    }

    /// Register a trigger listener; no matchers means every trigger.
    pub fn add_trigger_listener(
        &self,
        listener: Arc<dyn TriggerListener>,
        matchers: Vec<Matcher<TriggerKey>>,
    ) {
        let matchers = or_everything(matchers);
        let mut listeners = write(&self.trigger_listeners);
        listeners.retain(|r| r.listener.name() != listener.name());
        debug!(listener = listener.name(), "Trigger listener registered");
        listeners.push(Registration { listener, matchers });
    }

    pub fn add_trigger_listener_matcher(&self, name: &str, matcher: Matcher<TriggerKey>) -> bool {
        let mut listeners = write(&self.trigger_listeners);
        match listeners.iter_mut().find(|r| r.listener.name() == name) {
            Some(registration) => {
                if !registration.matchers.contains(&matcher) {
                    registration.matchers.push(matcher);
                }
                true
            }
            None => false,
        }
    }

    pub fn remove_trigger_listener(&self, name: &str) -> bool {
        let mut listeners = write(&self.trigger_listeners);
        let before = listeners.len();
        listeners.retain(|r| r.listener.name() != name);
        listeners.len() != before
    }

    pub fn add_scheduler_listener(&self, listener: Arc<dyn SchedulerListener>) {
        write(&self.scheduler_listeners).push(listener);
    }

    /// Job listeners with at least one matcher accepting `key`
    pub fn job_listeners_for(&self, key: &JobKey) -> Vec<Arc<dyn JobListener>> {
        read(&self.job_listeners)
            .iter()
            .filter(|r| r.matchers.iter().any(|m| m.is_match(key)))
            .map(|r| Arc::clone(&r.listener))
            .collect()
    }

    /// Trigger listeners with at least one matcher accepting `key`
    pub fn trigger_listeners_for(&self, key: &TriggerKey) -> Vec<Arc<dyn TriggerListener>> {
        read(&self.trigger_listeners)
            .iter()
            .filter(|r| r.matchers.iter().any(|m| m.is_match(key)))
            .map(|r| Arc::clone(&r.listener))
            .collect()
    }

    pub fn scheduler_listeners(&self) -> Vec<Arc<dyn SchedulerListener>> {
        read(&self.scheduler_listeners).clone()
    }

    pub async fn notify_trigger_misfired(&self, trigger: &Trigger) {
        for listener in self.trigger_listeners_for(trigger.key()) {
            listener.trigger_misfired(trigger).await;
        }
    }

    pub async fn notify_trigger_finalized(&self, trigger: &Trigger) {
        for listener in self.scheduler_listeners() {
            listener.trigger_finalized(trigger).await;
        }
    }

    pub async fn notify_scheduler_error(&self, message: &str, error: &SchedulerError) {
        for listener in self.scheduler_listeners() {
            listener.scheduler_error(message, error).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        name: String,
        misfires: AtomicUsize,
    }

    impl Counting {
        fn new(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                misfires: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl TriggerListener for Counting {
        fn name(&self) -> &str {
            &self.name
        }

        async fn trigger_misfired(&self, _trigger: &Trigger) {
            self.misfires.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl JobListener for Counting {
        fn name(&self) -> &str {
            &self.name
        }
    }

    #[test]
    fn test_job_listener_filtered_by_matcher() {
        let manager = ListenerManager::new();
        manager.add_job_listener(Counting::new("reports"), vec![Matcher::group_equals("reports")]);
        manager.add_job_listener(Counting::new("all"), vec![]);

        assert_eq!(manager.job_listeners_for(&JobKey::new("a", "reports")).len(), 2);
        assert_eq!(manager.job_listeners_for(&JobKey::new("a", "billing")).len(), 1);
    }

    #[test]
    fn test_reregistration_by_name_is_idempotent() {
        let manager = ListenerManager::new();
        manager.add_job_listener(Counting::new("l"), vec![Matcher::group_equals("g")]);
        manager.add_job_listener(Counting::new("l"), vec![Matcher::group_equals("g")]);
        assert!(manager.add_job_listener_matcher("l", Matcher::group_equals("g")));
        assert_eq!(manager.job_listener_matchers("l").unwrap().len(), 1);
        assert_eq!(manager.job_listeners_for(&JobKey::new("x", "g")).len(), 1);
        assert!(manager.remove_job_listener("l"));
        assert!(!manager.remove_job_listener("l"));
    }

    #[tokio::test]
    async fn test_misfire_dispatch_respects_matchers() {
        let manager = ListenerManager::new();
        let matching = Counting::new("matching");
        let other = Counting::new("other");
        manager.add_trigger_listener(matching.clone(), vec![Matcher::name_starts_with("night")]);
        manager.add_trigger_listener(other.clone(), vec![Matcher::name_equals("daily")]);

        let trigger = Trigger::builder()
            .with_identity("nightly", "DEFAULT")
            .for_job(JobKey::new("j", "DEFAULT"))
            .build()
            .unwrap();
        manager.notify_trigger_misfired(&trigger).await;

        assert_eq!(matching.misfires.load(Ordering::SeqCst), 1);
        assert_eq!(other.misfires.load(Ordering::SeqCst), 0);
    }
}
