// Schedule module - fixed-interval tasks of one collector
//
// Tasks are yielded in the order they were added. A schedule is owned by a
// single collector task and is not shared. When a critical task fails the
// schedule enters standby: only that task stays visible, with a longer
// interval, until `recover` restores the normal cadence.

use std::collections::HashMap;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

use crate::error::PollError;

/// Returned by `next_due` when there is nothing to wait for
pub const NEVER: Duration = Duration::from_secs(1_000_000 * 3600);

#[derive(Debug, Clone)]
pub struct Task<H> {
    name: String,
    interval: Duration,
    jitter: Duration,
    due: Instant,
    handler: H,
}

impl<H> Task<H> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn jitter(&self) -> Duration {
        self.jitter
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Time left until the task is due, zero if it is overdue
    pub fn next_due(&self, now: Instant) -> Duration {
        self.due.saturating_duration_since(now)
    }

    pub fn is_due(&self, now: Instant) -> bool {
        self.due <= now
    }
}

#[derive(Debug, Clone)]
pub struct Schedule<H> {
    tasks: Vec<Task<H>>,
    cached_intervals: HashMap<String, Duration>,
    standby: Option<usize>,
}

impl<H: Clone> Schedule<H> {
    pub fn new() -> Self {
        Schedule {
            tasks: Vec::new(),
            cached_intervals: HashMap::new(),
            standby: None,
        }
    }

    /// Registers a task
    ///
    /// # Arguments
    /// * `name` - Unique task name ("counter", "instance", "data")
    /// * `interval` - Target interval, must be non-zero
    /// * `jitter` - Upper bound of the random delay added to the first run
    /// * `handler` - Value handed back by `start` when the task fires
    /// * `run_now` - Make the task due immediately instead of after one interval
    pub fn new_task(
        &mut self,
        name: &str,
        interval: Duration,
        jitter: Duration,
        handler: H,
        run_now: bool,
    ) -> Result<(), PollError> {
        if self.task(name).is_some() {
            return Err(PollError::InvalidParam(format!("duplicate task: {name}")));
        }
        if interval.is_zero() {
            return Err(PollError::InvalidParam(format!("interval of task {name}: 0s")));
        }

        let now = Instant::now();
        let due = if run_now {
            now
        } else {
            now + interval + random_offset(jitter)
        };
        self.cached_intervals.insert(name.to_string(), interval);
        self.tasks.push(Task {
            name: name.to_string(),
            interval,
            jitter,
            due,
            handler,
        });
        Ok(())
    }

    pub fn task(&self, name: &str) -> Option<&Task<H>> {
        self.tasks.iter().find(|t| t.name == name)
    }

    /// Visible tasks: all of them, or only the standby task while in standby
    pub fn tasks(&self) -> &[Task<H>] {
        match self.standby {
            Some(i) => &self.tasks[i..=i],
            None => &self.tasks,
        }
    }

    /// Names of visible tasks that are due at `now`, in registration order
    pub fn due_tasks(&self, now: Instant) -> Vec<String> {
        self.tasks()
            .iter()
            .filter(|t| t.is_due(now))
            .map(|t| t.name.clone())
            .collect()
    }

    pub fn is_due(&self, name: &str) -> bool {
        self.task(name)
            .map(|t| t.is_due(Instant::now()))
            .unwrap_or(false)
    }

    /// Shortest wait until a visible task is due
    pub fn next_due(&self) -> Duration {
        let now = Instant::now();
        self.tasks()
            .iter()
            .map(|t| t.next_due(now))
            .min()
            .unwrap_or(NEVER)
    }

    /// Marks the task as fired now and returns its handler
    pub fn start(&mut self, name: &str) -> Option<H> {
        let now = Instant::now();
        let task = self.tasks.iter_mut().find(|t| t.name == name)?;
        task.due = now + task.interval;
        Some(task.handler.clone())
    }

    pub fn in_standby(&self) -> bool {
        self.standby.is_some()
    }

    pub fn standby_task(&self) -> Option<&str> {
        self.standby.map(|i| self.tasks[i].name.as_str())
    }

    /// Stalls every task except `name`, which is retried after `retry`
    ///
    /// The retry interval never drops below the task's normal interval.
    /// Calling it again while in standby re-arms the same or another task.
    pub fn set_standby(&mut self, name: &str, retry: Duration) -> Result<(), PollError> {
        let index = self
            .tasks
            .iter()
            .position(|t| t.name == name)
            .ok_or_else(|| PollError::InvalidParam(format!("invalid task: {name}")))?;
        let normal = self.cached_intervals.get(name).copied().unwrap_or(retry);
        let task = &mut self.tasks[index];
        task.interval = normal.max(retry);
        task.due = Instant::now() + task.interval;
        self.standby = Some(index);
        Ok(())
    }

    /// Leaves standby: intervals are restored, the standby task keeps its
    /// cadence and every other task becomes due immediately
    pub fn recover(&mut self) {
        let Some(standby) = self.standby.take() else {
            return;
        };
        let now = Instant::now();
        for (i, task) in self.tasks.iter_mut().enumerate() {
            if let Some(interval) = self.cached_intervals.get(&task.name) {
                task.interval = *interval;
            }
            task.due = if i == standby { now + task.interval } else { now };
        }
    }
}

impl<H: Clone> Default for Schedule<H> {
    fn default() -> Self {
        Self::new()
    }
}

fn random_offset(jitter: Duration) -> Duration {
    let millis = jitter.as_millis() as u64;
    if millis == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..millis))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIN: Duration = Duration::from_secs(60);

    fn schedule() -> Schedule<&'static str> {
        let mut s = Schedule::new();
        s.new_task("counter", 20 * MIN, Duration::ZERO, "counter", true).unwrap();
        s.new_task("instance", 10 * MIN, Duration::ZERO, "instance", true).unwrap();
        s.new_task("data", 3 * MIN, Duration::ZERO, "data", true).unwrap();
        s
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_now_is_due_immediately() {
        let s = schedule();
        assert_eq!(s.next_due(), Duration::ZERO);
        assert_eq!(s.due_tasks(Instant::now()), vec!["counter", "instance", "data"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_rearms_task() {
        let mut s = schedule();
        for name in ["counter", "instance", "data"] {
            assert_eq!(s.start(name), Some(name));
        }
        assert_eq!(s.next_due(), 3 * MIN);
        tokio::time::advance(3 * MIN).await;
        assert_eq!(s.due_tasks(Instant::now()), vec!["data"]);
        assert!(s.is_due("data"));
        assert!(!s.is_due("instance"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_jitter_delays_first_run() {
        let mut s: Schedule<()> = Schedule::new();
        s.new_task("data", MIN, Duration::from_secs(30), (), false).unwrap();
        let wait = s.next_due();
        assert!(wait >= MIN && wait < MIN + Duration::from_secs(30));
    }

    #[test]
    fn test_rejects_duplicates_and_zero_interval() {
        let mut s = schedule();
        assert!(s.new_task("data", MIN, Duration::ZERO, "x", true).is_err());
        assert!(s.new_task("plugin", Duration::ZERO, Duration::ZERO, "x", true).is_err());
        assert_eq!(Schedule::<()>::new().next_due(), NEVER);
    }

    #[tokio::test(start_paused = true)]
    async fn test_standby_hides_other_tasks() {
        let mut s = schedule();
        for name in ["counter", "instance", "data"] {
            s.start(name);
        }
        s.set_standby("data", 5 * MIN).unwrap();
        assert!(s.in_standby());
        assert_eq!(s.standby_task(), Some("data"));
        assert_eq!(s.tasks().len(), 1);
        assert_eq!(s.task("data").unwrap().interval(), 5 * MIN);

        tokio::time::advance(30 * MIN).await;
        assert_eq!(s.due_tasks(Instant::now()), vec!["data"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_standby_keeps_longer_interval() {
        let mut s = schedule();
        s.set_standby("counter", Duration::from_secs(1)).unwrap();
        assert_eq!(s.task("counter").unwrap().interval(), 20 * MIN);
        assert!(s.set_standby("bogus", MIN).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_recover_backdates_other_tasks() {
        let mut s = schedule();
        for name in ["counter", "instance", "data"] {
            s.start(name);
        }
        s.set_standby("data", 10 * MIN).unwrap();
        tokio::time::advance(10 * MIN).await;
        s.start("data");
        s.recover();

        assert!(!s.in_standby());
        assert_eq!(s.task("data").unwrap().interval(), 3 * MIN);
        assert_eq!(s.due_tasks(Instant::now()), vec!["counter", "instance"]);
        assert_eq!(s.task("data").unwrap().next_due(Instant::now()), 3 * MIN);
    }
}
