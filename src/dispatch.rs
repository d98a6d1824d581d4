use crate::types::NotificationEvent;
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;

pub const DEFAULT_SUBSCRIBER_BUDGET: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_CONCURRENT_DELIVERIES: usize = 4;
pub const DEFAULT_SUBSCRIBER_BACKLOG: usize = 256;

/// Something interested in saved notifications: a dashboard, a log, a test.
pub trait Subscriber: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn notify(&self, event: NotificationEvent) -> Result<(), failure::Error>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(u64);

#[derive(Clone)]
struct Subscription {
    handle: SubscriptionHandle,
    subscriber: Arc<dyn Subscriber>,
    active: Arc<AtomicBool>,
    // Deliveries accepted but not yet returned, queued or running
    backlog: Arc<Semaphore>,
    running: Arc<Semaphore>,
}

#[derive(Clone)]
pub struct Dispatcher {
    subscriptions: Arc<RwLock<Vec<Subscription>>>,
    next_handle: Arc<AtomicU64>,
    budget: Duration,
    max_concurrent: usize,
    backlog: usize,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIBER_BUDGET, DEFAULT_MAX_CONCURRENT_DELIVERIES)
    }
}

impl Dispatcher {
    /// `budget` is how long a single `notify` may run before it is reported
    /// as slow; `max_concurrent` bounds the calls running at once for each
    /// subscriber.
    pub fn new(budget: Duration, max_concurrent: usize) -> Self {
        Self {
            subscriptions: Arc::new(RwLock::new(Vec::new())),
            next_handle: Arc::new(AtomicU64::new(1)),
            budget,
            max_concurrent: max_concurrent.clamp(1, Semaphore::MAX_PERMITS),
            backlog: DEFAULT_SUBSCRIBER_BACKLOG.max(max_concurrent).min(Semaphore::MAX_PERMITS),
        }
    }

    /// Events a single subscriber may have outstanding before further ones
    /// are dropped for it. Applies to subscribers registered afterwards.
    pub fn with_backlog(mut self, backlog: usize) -> Self {
        self.backlog = backlog.clamp(self.max_concurrent, Semaphore::MAX_PERMITS);
        self
    }

    pub fn subscribe(&self, subscriber: Arc<dyn Subscriber>) -> SubscriptionHandle {
        let handle = SubscriptionHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        info!("Subscriber {} registered", subscriber.name());
        let mut subs = self
            .subscriptions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        subs.push(Subscription {
            handle,
            subscriber,
            active: Arc::new(AtomicBool::new(true)),
            backlog: Arc::new(Semaphore::new(self.backlog)),
            running: Arc::new(Semaphore::new(self.max_concurrent)),
        });
        handle
    }

    /// Removes a subscriber without waiting for it. No `notify` call starts
    /// for it after this returns; one already running is left to finish.
    /// Safe to call from inside `notify`.
    ///
    /// Returns `false` if the handle was not registered.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        let removed = {
            let mut subs = self
                .subscriptions
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            match subs.iter().position(|s| s.handle == handle) {
                Some(index) => subs.remove(index),
                None => return false,
            }
        };
        removed.active.store(false, Ordering::SeqCst);
        info!("Subscriber {} removed", removed.subscriber.name());
        true
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscriptions
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    /// Schedules delivery of `event` to every current subscriber and returns
    /// immediately with the number of deliveries scheduled. A subscriber
    /// whose backlog is full misses the event.
    pub fn publish(&self, event: NotificationEvent) -> usize {
        let runtime = match Handle::try_current() {
            Ok(runtime) => runtime,
            Err(e) => {
                error!("Cannot dispatch event outside a runtime: {}", e);
                return 0;
            }
        };
        let targets: Vec<Subscription> = self
            .subscriptions
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();

        let mut scheduled = 0;
        for target in targets {
            let slot = match target.backlog.clone().try_acquire_owned() {
                Ok(slot) => slot,
                Err(_) => {
                    warn!(
                        "Subscriber {} has {} events outstanding; dropping event for plate {}",
                        target.subscriber.name(),
                        self.backlog,
                        event.plate_number
                    );
                    continue;
                }
            };
            runtime.spawn(deliver(target, slot, event.clone(), self.budget));
            scheduled += 1;
        }
        debug!("Event for plate {} scheduled to {} subscribers", event.plate_number, scheduled);
        scheduled
    }
}

async fn deliver(
    target: Subscription,
    slot: OwnedSemaphorePermit,
    event: NotificationEvent,
    budget: Duration,
) {
    let running = match target.running.clone().acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => return,
    };
    let name = target.subscriber.name().to_string();
    let subscriber = target.subscriber;
    let active = target.active;
    // Both permits move into the job: they are held until notify really
    // returns, even if we stop waiting for it below.
    let job = tokio::task::spawn_blocking(move || {
        let _permits = (slot, running);
        if !active.load(Ordering::SeqCst) {
            return Ok(false);
        }
        subscriber.notify(event).map(|_| true)
    });

    match timeout(budget, job).await {
        Ok(Ok(Ok(true))) => debug!("Subscriber {} notified", name),
        Ok(Ok(Ok(false))) => debug!("Subscriber {} was removed before delivery", name),
        Ok(Ok(Err(e))) => error!("Subscriber {} failed to handle event: {}", name, e),
        Ok(Err(e)) if e.is_panic() => error!("Subscriber {} panicked while handling event", name),
        Ok(Err(e)) => error!("Subscriber {} delivery was cancelled: {}", name, e),
        Err(_) => warn!(
            "Subscriber {} is still running after {:?}; no longer waiting for it",
            name, budget
        ),
    }
}

/// Logs every event; the default observer of the binary.
pub struct LogSubscriber;

impl Subscriber for LogSubscriber {
    fn name(&self) -> &str {
        "log"
    }

    fn notify(&self, event: NotificationEvent) -> Result<(), failure::Error> {
        let file = event
            .stored_image
            .as_ref()
            .map(|image| image.path.display().to_string())
            .unwrap_or_else(|| "-".to_string());
        info!(
            "Plate {} seen by {} (action={}) file={}",
            event.plate_number, event.remote_address, event.action, file
        );
        Ok(())
    }
}

/// Forwards events into a channel, e.g. for a dashboard running elsewhere in
/// the process.
pub struct ChannelSubscriber {
    name: String,
    tx: mpsc::UnboundedSender<NotificationEvent>,
}

impl ChannelSubscriber {
    pub fn new(name: impl Into<String>, tx: mpsc::UnboundedSender<NotificationEvent>) -> Self {
        Self {
            name: name.into(),
            tx,
        }
    }
}

impl Subscriber for ChannelSubscriber {
    fn name(&self) -> &str {
        &self.name
    }

    fn notify(&self, event: NotificationEvent) -> Result<(), failure::Error> {
        self.tx
            .send(event)
            .map_err(|_| format_err!("event channel for {} is closed", self.name))
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{Condvar, Mutex};

    fn event(plate: &str) -> NotificationEvent {
        NotificationEvent {
            stored_image: None,
            plate_number: plate.to_string(),
            remote_address: "10.0.0.7".to_string(),
            action: "test".to_string(),
            received_at: Utc::now(),
        }
    }

    struct Panicking;

    impl Subscriber for Panicking {
        fn name(&self) -> &str {
            "panicking"
        }

        fn notify(&self, _event: NotificationEvent) -> Result<(), failure::Error> {
            panic!("subscriber blew up");
        }
    }

    struct Failing;

    impl Subscriber for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        fn notify(&self, _event: NotificationEvent) -> Result<(), failure::Error> {
            Err(format_err!("nope"))
        }
    }

    struct Slow {
        delay: Duration,
        calls: Arc<AtomicUsize>,
    }

    impl Subscriber for Slow {
        fn name(&self) -> &str {
            "slow"
        }

        fn notify(&self, _event: NotificationEvent) -> Result<(), failure::Error> {
            std::thread::sleep(self.delay);
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    struct Gate {
        open: Mutex<bool>,
        opened: Condvar,
    }

    impl Gate {
        fn wait(&self) {
            let open = self.open.lock().unwrap();
            let _open = self.opened.wait_while(open, |open| !*open).unwrap();
        }

        fn open(&self) {
            *self.open.lock().unwrap() = true;
            self.opened.notify_all();
        }
    }

    /// Blocks every call until the gate opens.
    struct Stuck {
        gate: Arc<Gate>,
        entered: Arc<AtomicUsize>,
    }

    impl Subscriber for Stuck {
        fn name(&self) -> &str {
            "stuck"
        }

        fn notify(&self, _event: NotificationEvent) -> Result<(), failure::Error> {
            self.entered.fetch_add(1, Ordering::SeqCst);
            self.gate.wait();
            Ok(())
        }
    }

    /// Removes itself on its first event.
    struct OneShot {
        dispatcher: Dispatcher,
        handle: Mutex<Option<SubscriptionHandle>>,
        done: mpsc::UnboundedSender<bool>,
    }

    impl Subscriber for OneShot {
        fn name(&self) -> &str {
            "one-shot"
        }

        fn notify(&self, _event: NotificationEvent) -> Result<(), failure::Error> {
            let handle = self.handle.lock().unwrap().take();
            if let Some(handle) = handle {
                let removed = self.dispatcher.unsubscribe(handle);
                let _ = self.done.send(removed);
            }
            Ok(())
        }
    }

    async fn recv(rx: &mut mpsc::UnboundedReceiver<NotificationEvent>) -> NotificationEvent {
        timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("Timeout waiting for event")
            .expect("Channel closed")
    }

    async fn wait_until(condition: impl Fn() -> bool) {
        timeout(Duration::from_secs(2), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("Condition not reached in time");
    }

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let dispatcher = Dispatcher::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        dispatcher.subscribe(Arc::new(ChannelSubscriber::new("test", tx)));

        assert_eq!(dispatcher.publish(event("ABC1234")), 1);

        let received = recv(&mut rx).await;
        assert_eq!(received.plate_number, "ABC1234");
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let dispatcher = Dispatcher::default();
        assert_eq!(dispatcher.publish(event("ABC1234")), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_faulty_subscribers_are_isolated() {
        let dispatcher = Dispatcher::default();
        dispatcher.subscribe(Arc::new(Panicking));
        dispatcher.subscribe(Arc::new(Failing));
        let (tx, mut rx) = mpsc::unbounded_channel();
        dispatcher.subscribe(Arc::new(ChannelSubscriber::new("healthy", tx)));

        assert_eq!(dispatcher.publish(event("ONE")), 3);
        assert_eq!(recv(&mut rx).await.plate_number, "ONE");

        // Still delivering after the panic
        dispatcher.publish(event("TWO"));
        assert_eq!(recv(&mut rx).await.plate_number, "TWO");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_slow_subscriber_does_not_block_publish() {
        let dispatcher = Dispatcher::new(Duration::from_millis(50), 4);
        let calls = Arc::new(AtomicUsize::new(0));
        dispatcher.subscribe(Arc::new(Slow {
            delay: Duration::from_millis(500),
            calls: calls.clone(),
        }));
        let (tx, mut rx) = mpsc::unbounded_channel();
        dispatcher.subscribe(Arc::new(ChannelSubscriber::new("fast", tx)));

        let started = std::time::Instant::now();
        dispatcher.publish(event("ABC1234"));
        assert!(started.elapsed() < Duration::from_millis(100));

        assert_eq!(recv(&mut rx).await.plate_number, "ABC1234");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stuck_subscriber_does_not_starve_others() {
        let dispatcher = Dispatcher::new(Duration::from_millis(50), 2).with_backlog(8);
        let gate = Arc::new(Gate::default());
        let entered = Arc::new(AtomicUsize::new(0));
        dispatcher.subscribe(Arc::new(Stuck {
            gate: gate.clone(),
            entered: entered.clone(),
        }));
        let (tx, mut rx) = mpsc::unbounded_channel();
        dispatcher.subscribe(Arc::new(ChannelSubscriber::new("healthy", tx)));

        // Many more events than either the concurrency limit or the backlog
        let mut scheduled = Vec::new();
        for i in 0..40 {
            let plate = format!("P{}", i);
            scheduled.push(dispatcher.publish(event(&plate)));
            assert_eq!(recv(&mut rx).await.plate_number, plate);
        }

        // The stuck subscriber holds its 8 slots; later events skip it only
        assert!(scheduled[..8].iter().all(|&n| n == 2), "{:?}", scheduled);
        assert!(scheduled[8..].iter().all(|&n| n == 1), "{:?}", scheduled);
        wait_until(|| entered.load(Ordering::SeqCst) == 2).await;

        // Queued events are delivered once it recovers
        gate.open();
        wait_until(|| entered.load(Ordering::SeqCst) == 8).await;
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let dispatcher = Dispatcher::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = dispatcher.subscribe(Arc::new(ChannelSubscriber::new("test", tx)));

        assert!(dispatcher.unsubscribe(handle));
        assert!(!dispatcher.unsubscribe(handle));
        assert_eq!(dispatcher.subscriber_count(), 0);
        assert_eq!(dispatcher.publish(event("ABC1234")), 0);

        // The subscriber was dropped with its sender
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unsubscribe_skips_queued_delivery() {
        let dispatcher = Dispatcher::new(DEFAULT_SUBSCRIBER_BUDGET, 1);
        let gate = Arc::new(Gate::default());
        let entered = Arc::new(AtomicUsize::new(0));
        let handle = dispatcher.subscribe(Arc::new(Stuck {
            gate: gate.clone(),
            entered: entered.clone(),
        }));

        // The second event waits behind the first, which is stuck
        assert_eq!(dispatcher.publish(event("ONE")), 1);
        assert_eq!(dispatcher.publish(event("TWO")), 1);
        wait_until(|| entered.load(Ordering::SeqCst) == 1).await;

        assert!(dispatcher.unsubscribe(handle));
        gate.open();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(entered.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_subscriber_can_unsubscribe_itself() {
        let dispatcher = Dispatcher::default();
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        let one_shot = Arc::new(OneShot {
            dispatcher: dispatcher.clone(),
            handle: Mutex::new(None),
            done: done_tx,
        });
        let handle = dispatcher.subscribe(one_shot.clone());
        *one_shot.handle.lock().unwrap() = Some(handle);
        drop(one_shot);

        assert_eq!(dispatcher.publish(event("ABC1234")), 1);
        let removed = timeout(Duration::from_secs(2), done_rx.recv())
            .await
            .expect("unsubscribe from inside notify did not return");
        assert_eq!(removed, Some(true));
        assert_eq!(dispatcher.subscriber_count(), 0);
        assert_eq!(dispatcher.publish(event("ABC1234")), 0);
    }

    #[test]
    fn test_publish_outside_runtime() {
        let dispatcher = Dispatcher::default();
        dispatcher.subscribe(Arc::new(LogSubscriber));
        assert_eq!(dispatcher.publish(event("ABC1234")), 0);
    }

    #[test]
    fn test_channel_subscriber_closed() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let subscriber = ChannelSubscriber::new("closed", tx);
        assert!(subscriber.notify(event("ABC1234")).is_err());
    }
}
