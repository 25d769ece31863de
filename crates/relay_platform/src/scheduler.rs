#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::debug;

/// Registry of named periodic background tasks.
///
/// Names are case-insensitive and whitespace-trimmed. Scheduling under a name
/// that is already live cancels the previous task before starting the new one,
/// so callers can re-arm a job across reconnect cycles without leaking tickers.
#[derive(Clone, Default)]
pub struct TaskScheduler {
	inner: Arc<Mutex<HashMap<String, watch::Sender<bool>>>>,
}

impl TaskScheduler {
	pub fn new() -> Self {
		Self::default()
	}

	fn normalize(name: &str) -> String {
		name.trim().to_ascii_lowercase()
	}

	/// Run `job` every `period`, starting one period from now.
	pub fn schedule<F, Fut>(&self, name: &str, period: Duration, job: F)
	where
		F: Fn() -> Fut + Send + 'static,
		Fut: Future<Output = ()> + Send,
	{
		let name = Self::normalize(name);
		let (cancel_tx, mut cancel_rx) = watch::channel(false);

		let previous = self.inner.lock().insert(name.clone(), cancel_tx);
		if let Some(previous) = previous {
			let _ = previous.send(true);
			debug!(task = %name, "replacing scheduled task");
		}

		tokio::spawn(async move {
			let mut ticker = tokio::time::interval(period);
			ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
			// interval fires immediately; the first run belongs one period out
			ticker.tick().await;

			loop {
				tokio::select! {
					_ = ticker.tick() => {
						job().await;
					}
					changed = cancel_rx.changed() => {
						if changed.is_err() || *cancel_rx.borrow() {
							debug!(task = %name, "scheduled task cancelled");
							break;
						}
					}
				}
			}
		});
	}

	/// Cancel the task registered under `name`. No-op if absent.
	pub fn cancel(&self, name: &str) {
		let name = Self::normalize(name);
		if let Some(cancel_tx) = self.inner.lock().remove(&name) {
			let _ = cancel_tx.send(true);
		}
	}

	/// Whether a task is currently registered under `name`.
	pub fn is_scheduled(&self, name: &str) -> bool {
		self.inner.lock().contains_key(&Self::normalize(name))
	}

	/// Number of registered tasks.
	pub fn len(&self) -> usize {
		self.inner.lock().len()
	}

	pub fn is_empty(&self) -> bool {
		self.inner.lock().is_empty()
	}
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use tokio::sync::mpsc;
	use tokio::time::timeout;

	use super::*;

	#[tokio::test]
	async fn job_fires_after_one_period() {
		let scheduler = TaskScheduler::new();
		let (tx, mut rx) = mpsc::unbounded_channel();

		scheduler.schedule("tick", Duration::from_millis(10), move || {
			let tx = tx.clone();
			async move {
				let _ = tx.send(());
			}
		});

		timeout(Duration::from_millis(500), rx.recv())
			.await
			.expect("job should have fired within timeout")
			.expect("channel open");
	}

	#[tokio::test]
	async fn cancel_before_first_fire_means_never_invoked() {
		let scheduler = TaskScheduler::new();
		let (tx, mut rx) = mpsc::unbounded_channel();

		scheduler.schedule("late", Duration::from_millis(100), move || {
			let tx = tx.clone();
			async move {
				let _ = tx.send(());
			}
		});
		scheduler.cancel("late");

		let got = timeout(Duration::from_millis(250), rx.recv()).await;
		assert!(got.is_err() || got.unwrap().is_none(), "cancelled job must not fire");
		assert!(!scheduler.is_scheduled("late"));
	}

	#[tokio::test]
	async fn cancel_is_idempotent_and_tolerates_unknown_names() {
		let scheduler = TaskScheduler::new();
		scheduler.cancel("nothing-here");
		scheduler.cancel("nothing-here");

		scheduler.schedule("once", Duration::from_secs(60), || async {});
		scheduler.cancel("once");
		scheduler.cancel("once");
		assert!(scheduler.is_empty());
	}

	#[tokio::test]
	async fn rescheduling_replaces_the_previous_task() {
		let scheduler = TaskScheduler::new();
		let (old_tx, mut old_rx) = mpsc::unbounded_channel();
		let (new_tx, mut new_rx) = mpsc::unbounded_channel();

		scheduler.schedule("heartbeat", Duration::from_millis(20), move || {
			let tx = old_tx.clone();
			async move {
				let _ = tx.send(());
			}
		});
		scheduler.schedule("heartbeat", Duration::from_millis(20), move || {
			let tx = new_tx.clone();
			async move {
				let _ = tx.send(());
			}
		});

		assert_eq!(scheduler.len(), 1);

		timeout(Duration::from_millis(500), new_rx.recv())
			.await
			.expect("replacement job should fire")
			.expect("channel open");

		let got_old = timeout(Duration::from_millis(100), old_rx.recv()).await;
		assert!(
			got_old.is_err() || got_old.unwrap().is_none(),
			"replaced job must stop firing"
		);
	}

	#[tokio::test]
	async fn names_are_normalized() {
		let scheduler = TaskScheduler::new();
		scheduler.schedule("  PubSub:Ping ", Duration::from_secs(60), || async {});
		assert!(scheduler.is_scheduled("pubsub:ping"));

		scheduler.cancel("PUBSUB:PING");
		assert!(!scheduler.is_scheduled("pubsub:ping"));
	}
}
