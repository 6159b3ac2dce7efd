use crate::metrics::SyncMetrics;
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use anyhow::Result;
use futures::prelude::*;
use hostport_controller_core::{PodHandler, ProgramPolicy, UpdatePod};
use hostport_controller_k8s_api::{Pod, ResourceExt};
use hostport_controller_k8s_client::PodLookup;
use kube::runtime::watcher;
use std::fmt;
use tokio::{sync::mpsc, time};
use tracing::{debug, info, warn};

/// Reads the current state of a pod when a failed sync is retried.
#[async_trait::async_trait]
pub trait FetchPod {
    async fn fetch_pod(&self, ns: &str, name: &str) -> Result<Option<Pod>>;
}

/// Feeds pod watch events through a [`PodHandler`], one at a time.
///
/// Failed syncs are retried with exponential backoff. A retry re-reads the pod
/// so that it acts on current state rather than the event that failed.
pub struct Dispatcher<U, P, F> {
    handler: PodHandler<U, P>,
    pods: F,
    backoff: Backoff,
    metrics: SyncMetrics,

    /// Consecutive failures by pod.
    attempts: HashMap<Key, u32>,

    /// Pods with a retry scheduled.
    pending: HashSet<Key>,

    requeue_tx: mpsc::UnboundedSender<Key>,
    requeue_rx: mpsc::UnboundedReceiver<Key>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Backoff {
    base: time::Duration,
    max: time::Duration,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct Key {
    namespace: String,
    name: String,
}

// === impl Dispatcher ===

impl<U, P, F> Dispatcher<U, P, F>
where
    U: UpdatePod + Send + Sync,
    P: ProgramPolicy + Send + Sync,
    F: FetchPod + Send + Sync,
{
    pub fn new(handler: PodHandler<U, P>, pods: F, backoff: Backoff, metrics: SyncMetrics) -> Self {
        let (requeue_tx, requeue_rx) = mpsc::unbounded_channel();
        Self {
            handler,
            pods,
            backoff,
            metrics,
            attempts: HashMap::new(),
            pending: HashSet::new(),
            requeue_tx,
            requeue_rx,
        }
    }

    /// Processes events until the event stream ends or shutdown is signaled.
    pub async fn run<S>(mut self, events: S, drain: drain::Watch)
    where
        S: Stream<Item = watcher::Event<Pod>>,
    {
        tokio::pin!(events);
        let shutdown = drain.signaled();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                biased;

                release = &mut shutdown => {
                    info!("Shutting down");
                    drop(release);
                    return;
                }

                event = events.next() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => {
                        debug!("Pod watch ended");
                        return;
                    }
                },

                Some(key) = self.requeue_rx.recv() => self.handle_requeue(key).await,
            }
        }
    }

    async fn handle_event(&mut self, event: watcher::Event<Pod>) {
        match event {
            watcher::Event::Apply(pod) | watcher::Event::InitApply(pod) => {
                let Some(key) = Key::of(&pod) else {
                    warn!(name = %pod.name_any(), "Ignoring pod without a namespace");
                    return;
                };
                self.sync(key, Some(pod)).await;
            }
            watcher::Event::Delete(pod) => {
                // Host-port policies are owned by their pods, so they are
                // garbage collected along with them.
                if let Some(key) = Key::of(&pod) {
                    debug!(%key, "Pod deleted");
                    self.attempts.remove(&key);
                }
            }
            watcher::Event::Init => debug!("Pod watch initializing"),
            watcher::Event::InitDone => debug!("Pod watch initialized"),
        }
    }

    async fn handle_requeue(&mut self, key: Key) {
        self.pending.remove(&key);
        self.metrics.requeued();
        match self.pods.fetch_pod(&key.namespace, &key.name).await {
            Ok(pod) => self.sync(key, pod).await,
            Err(error) => self.failed(key, error),
        }
    }

    async fn sync(&mut self, key: Key, pod: Option<Pod>) {
        match self.handler.sync(&key.to_string(), pod.as_ref()).await {
            Ok(outcome) => {
                self.metrics.synced(outcome);
                self.attempts.remove(&key);
            }
            Err(error) => self.failed(key, error),
        }
    }

    fn failed(&mut self, key: Key, error: anyhow::Error) {
        self.metrics.failed();

        let attempt = self.attempts.entry(key.clone()).or_default();
        *attempt += 1;
        let delay = self.backoff.delay(*attempt);
        warn!(%key, attempt = *attempt, ?delay, %error, "Failed to sync pod");

        if !self.pending.insert(key.clone()) {
            return;
        }
        let tx = self.requeue_tx.clone();
        tokio::spawn(async move {
            time::sleep(delay).await;
            let _ = tx.send(key);
        });
    }
}

// === impl Backoff ===

impl Backoff {
    pub fn new(base: time::Duration, max: time::Duration) -> Self {
        Self {
            base,
            max: max.max(base),
        }
    }

    /// Returns the delay before the given (1-based) retry.
    pub fn delay(&self, attempt: u32) -> time::Duration {
        let factor = 1u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .unwrap_or(self.max)
            .min(self.max)
    }
}

// === impl Key ===

impl Key {
    pub fn of(pod: &Pod) -> Option<Self> {
        Some(Self {
            namespace: pod.namespace()?,
            name: pod.name_any(),
        })
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

// === impl PodLookup ===

#[async_trait::async_trait]
impl FetchPod for PodLookup {
    async fn fetch_pod(&self, ns: &str, name: &str) -> Result<Option<Pod>> {
        let pod = self.get(ns, name).await?;
        Ok(pod)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use hostport_controller_k8s_api::{
        Container, ContainerPort, NetworkPolicy, ObjectMeta, PodSpec, IDENTITY_LABEL,
    };
    use parking_lot::Mutex;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    /// Fails the first `failures` updates, then records the rest.
    #[derive(Clone, Default)]
    struct MockPods {
        failures: Arc<AtomicUsize>,
        updates: Arc<Mutex<Vec<Pod>>>,
        current: Arc<Mutex<Option<Pod>>>,
    }

    #[derive(Clone, Default)]
    struct MockProgrammer {
        programmed: Arc<Mutex<Vec<NetworkPolicy>>>,
    }

    #[async_trait::async_trait]
    impl UpdatePod for MockPods {
        async fn update_pod(&self, pod: Pod) -> Result<Pod> {
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(anyhow!("the object has been modified"));
            }
            self.updates.lock().push(pod.clone());
            *self.current.lock() = Some(pod.clone());
            Ok(pod)
        }
    }

    #[async_trait::async_trait]
    impl FetchPod for MockPods {
        async fn fetch_pod(&self, _ns: &str, _name: &str) -> Result<Option<Pod>> {
            Ok(self.current.lock().clone())
        }
    }

    #[async_trait::async_trait]
    impl ProgramPolicy for MockProgrammer {
        async fn program(&self, policy: NetworkPolicy) -> Result<()> {
            self.programmed.lock().push(policy);
            Ok(())
        }
    }

    fn mk_pod(name: &str, host_port: Option<i32>) -> Pod {
        Pod {
            metadata: ObjectMeta {
                namespace: Some("ns-0".to_string()),
                name: Some(name.to_string()),
                uid: Some(format!("{name}-uid")),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "main".to_string(),
                    ports: Some(vec![ContainerPort {
                        container_port: 8080,
                        host_port,
                        ..Default::default()
                    }]),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn dispatcher(
        pods: MockPods,
        programmer: MockProgrammer,
        metrics: SyncMetrics,
    ) -> Dispatcher<MockPods, MockProgrammer, MockPods> {
        Dispatcher::new(
            PodHandler::new(pods.clone(), programmer),
            pods,
            Backoff::new(
                time::Duration::from_millis(100),
                time::Duration::from_secs(1),
            ),
            metrics,
        )
    }

    #[test]
    fn backoff_is_capped() {
        let backoff = Backoff::new(
            time::Duration::from_millis(500),
            time::Duration::from_secs(60),
        );
        assert_eq!(backoff.delay(1), time::Duration::from_millis(500));
        assert_eq!(backoff.delay(2), time::Duration::from_secs(1));
        assert_eq!(backoff.delay(3), time::Duration::from_secs(2));
        assert_eq!(backoff.delay(8), time::Duration::from_secs(60));
        assert_eq!(backoff.delay(40), time::Duration::from_secs(60));
    }

    #[test]
    fn key_display() {
        let key = Key::of(&mk_pod("web-1", None)).unwrap();
        assert_eq!(key.to_string(), "ns-0/web-1");
        assert!(Key::of(&Pod::default()).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn syncs_applied_pods() {
        let pods = MockPods::default();
        let programmer = MockProgrammer::default();
        let metrics = SyncMetrics::default();
        let (_signal, drain) = drain::channel();

        let events = stream::iter(vec![
            watcher::Event::Init,
            watcher::Event::InitApply(mk_pod("web-1", Some(30080))),
            watcher::Event::InitApply(mk_pod("nohp-1", None)),
            watcher::Event::InitDone,
            watcher::Event::Delete(mk_pod("gone-1", Some(30081))),
        ]);
        dispatcher(pods.clone(), programmer.clone(), metrics.clone())
            .run(events, drain)
            .await;

        let updates = pods.updates.lock();
        assert_eq!(updates.len(), 1);
        assert_eq!(
            updates[0]
                .metadata
                .labels
                .as_ref()
                .and_then(|l| l.get(IDENTITY_LABEL))
                .map(String::as_str),
            Some("web-1")
        );

        let programmed = programmer.programmed.lock();
        assert_eq!(programmed.len(), 1);
        assert_eq!(programmed[0].metadata.name.as_deref(), Some("hp-web-1"));

        assert_eq!(metrics.count("labeled"), 1);
        assert_eq!(metrics.count("programmed"), 1);
        assert_eq!(metrics.count("unchanged"), 1);
        assert_eq!(metrics.count("failed"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_failed_syncs() {
        let pods = MockPods::default();
        pods.failures.store(2, Ordering::SeqCst);
        *pods.current.lock() = Some(mk_pod("web-1", Some(30080)));
        let programmer = MockProgrammer::default();
        let metrics = SyncMetrics::default();
        let (signal, drain) = drain::channel();

        let events = stream::iter(vec![watcher::Event::Apply(mk_pod("web-1", Some(30080)))])
            .chain(stream::pending());
        let task = tokio::spawn(
            dispatcher(pods.clone(), programmer.clone(), metrics.clone()).run(events, drain),
        );

        // Two failures back off for 100ms and then 200ms.
        time::sleep(time::Duration::from_secs(1)).await;
        assert_eq!(metrics.count("failed"), 2);
        assert_eq!(metrics.requeue_count(), 2);
        assert_eq!(pods.updates.lock().len(), 1);
        assert_eq!(programmer.programmed.lock().len(), 1);

        signal.drain().await;
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn retry_of_deleted_pod_is_a_noop() {
        let pods = MockPods::default();
        pods.failures.store(1, Ordering::SeqCst);
        let programmer = MockProgrammer::default();
        let metrics = SyncMetrics::default();
        let (signal, drain) = drain::channel();

        let events = stream::iter(vec![watcher::Event::Apply(mk_pod("web-1", Some(30080)))])
            .chain(stream::pending());
        let task = tokio::spawn(
            dispatcher(pods.clone(), programmer.clone(), metrics.clone()).run(events, drain),
        );

        time::sleep(time::Duration::from_secs(1)).await;
        assert_eq!(metrics.count("failed"), 1);
        assert_eq!(metrics.count("skipped"), 1);
        assert!(pods.updates.lock().is_empty());
        assert!(programmer.programmed.lock().is_empty());

        signal.drain().await;
        task.await.unwrap();
    }
}
