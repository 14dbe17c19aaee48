#![forbid(unsafe_code)]

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::advance;

use crate::live::testutil::tenant;
use crate::live::watchdog::{HealthMonitor, HealthMonitorConfig};

fn monitor() -> (HealthMonitor, mpsc::Receiver<tally_domain::TenantId>) {
	let (tx, rx) = mpsc::channel(8);
	(
		HealthMonitor::new(
			HealthMonitorConfig {
				grace: Duration::from_secs(5),
			},
			tx,
		),
		rx,
	)
}

#[tokio::test(start_paused = true)]
async fn fires_once_after_timeout_plus_grace() {
	let (monitor, mut fired) = monitor();
	let t = tenant("t1");

	monitor.start(&t, Duration::from_secs(10));
	assert!(monitor.is_armed(&t));

	advance(Duration::from_secs(16)).await;

	let hit = fired.recv().await.expect("watchdog fired");
	assert_eq!(hit, t);
	assert!(!monitor.is_armed(&t), "fired timer is no longer armed");

	// No further fires without a re-arm.
	advance(Duration::from_secs(60)).await;
	assert!(fired.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn reset_postpones_the_deadline() {
	let (monitor, mut fired) = monitor();
	let t = tenant("t1");

	monitor.start(&t, Duration::from_secs(10));

	advance(Duration::from_secs(10)).await;
	monitor.reset(&t, Duration::from_secs(10));

	// Inside the re-armed window: silent.
	advance(Duration::from_secs(10)).await;
	assert!(fired.try_recv().is_err());

	// Past timeout + grace from the reset: fires.
	advance(Duration::from_secs(6)).await;
	assert_eq!(fired.recv().await.expect("watchdog fired"), t);
}

#[tokio::test(start_paused = true)]
async fn stop_cancels_the_timer() {
	let (monitor, mut fired) = monitor();
	let t = tenant("t1");

	monitor.start(&t, Duration::from_secs(10));
	monitor.stop(&t);
	assert!(!monitor.is_armed(&t));

	advance(Duration::from_secs(120)).await;
	assert!(fired.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn tenants_are_tracked_independently() {
	let (monitor, mut fired) = monitor();
	let t1 = tenant("t1");
	let t2 = tenant("t2");

	monitor.start(&t1, Duration::from_secs(10));
	monitor.start(&t2, Duration::from_secs(40));

	advance(Duration::from_secs(16)).await;
	assert_eq!(fired.recv().await.expect("t1 fired"), t1);
	assert!(monitor.is_armed(&t2), "t2 still inside its window");

	advance(Duration::from_secs(30)).await;
	assert_eq!(fired.recv().await.expect("t2 fired"), t2);
}
