//! Election integration tests.
//!
//! Every scenario runs several campaigning identities against one
//! in-process `MemoryLeases` backend with a one second leader lease.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use ballast_election::{ElectionError, Elector, ElectorOptions, LeadershipObserver, LeadershipState};
use ballast_state::{LeaseBackend, MemoryLeases};

/// Observer recording whether its identity currently acts as leader.
#[derive(Default)]
struct Recorder {
    leading: AtomicBool,
    follower_delay: Duration,
    /// Shared across candidates: number of identities inside their leader role.
    active: Option<Arc<AtomicUsize>>,
    max_active: Option<Arc<AtomicUsize>>,
}

impl Recorder {
    fn with_follower_delay(delay: Duration) -> Self {
        Self {
            follower_delay: delay,
            ..Default::default()
        }
    }

    fn shared(active: Arc<AtomicUsize>, max_active: Arc<AtomicUsize>) -> Self {
        Self {
            active: Some(active),
            max_active: Some(max_active),
            ..Default::default()
        }
    }

    fn is_leading(&self) -> bool {
        self.leading.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LeadershipObserver for Recorder {
    async fn become_leader(&self) {
        self.leading.store(true, Ordering::SeqCst);
        if let (Some(active), Some(max)) = (&self.active, &self.max_active) {
            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
            max.fetch_max(now, Ordering::SeqCst);
        }
    }

    async fn become_follower(&self) {
        if !self.follower_delay.is_zero() {
            tokio::time::sleep(self.follower_delay).await;
        }
        if let Some(active) = &self.active {
            active.fetch_sub(1, Ordering::SeqCst);
        }
        self.leading.store(false, Ordering::SeqCst);
    }
}

struct Candidate {
    observer: Arc<Recorder>,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

fn spawn_candidate(elector: &Elector, group: u64, id: &'static str, observer: Recorder) -> Candidate {
    let observer = Arc::new(observer);
    let (shutdown, rx) = watch::channel(false);
    let elector = elector.clone();
    let obs = observer.clone();
    let handle = tokio::spawn(async move {
        elector.election_loop(group, id, obs.as_ref(), rx).await;
    });
    Candidate {
        observer,
        shutdown,
        handle,
    }
}

fn elector(lock: bool) -> Elector {
    elector_on(&MemoryLeases::new(), lock)
}

fn elector_on(leases: &MemoryLeases, lock: bool) -> Elector {
    let options = ElectorOptions::default()
        .with_leader_lease_seconds(1)
        .with_lock_if_become_leader(lock)
        .with_loop_interval(Duration::from_millis(50));
    Elector::new(Arc::new(leases.clone()), options).unwrap()
}

const LEADER_KEY: &str = "/ballast/election/0/leader";

async fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    cond()
}

#[tokio::test]
async fn first_candidate_leads_and_second_follows() {
    let elector = elector(false);
    let c1 = spawn_candidate(&elector, 0, "1", Recorder::default());
    assert!(wait_until(Duration::from_secs(1), || c1.observer.is_leading()).await);

    let c2 = spawn_candidate(&elector, 0, "2", Recorder::default());
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(elector.current_leader(0).await.unwrap(), "1");
    assert_eq!(elector.state(0, "1"), LeadershipState::Leader);
    assert_eq!(elector.state(0, "2"), LeadershipState::Follower);
    assert!(!c2.observer.is_leading());

    elector.stop(0);
    c1.handle.await.unwrap();
    c2.handle.await.unwrap();
}

#[tokio::test]
async fn stopping_leader_fails_over() {
    let elector = elector(false);
    let c1 = spawn_candidate(&elector, 0, "1", Recorder::default());
    assert!(wait_until(Duration::from_secs(1), || c1.observer.is_leading()).await);
    let c2 = spawn_candidate(&elector, 0, "2", Recorder::default());
    tokio::time::sleep(Duration::from_millis(100)).await;

    c1.shutdown.send_replace(true);
    c1.handle.await.unwrap();
    assert!(!c1.observer.is_leading());

    assert!(wait_until(Duration::from_secs(1), || c2.observer.is_leading()).await);
    assert_eq!(elector.current_leader(0).await.unwrap(), "2");
    assert_eq!(elector.state(0, "1"), LeadershipState::Follower);

    elector.stop(0);
    c2.handle.await.unwrap();
}

#[tokio::test]
async fn graceful_stop_hands_over_after_follower_handler() {
    let elector = elector(false);
    let c1 = spawn_candidate(
        &elector,
        0,
        "1",
        Recorder::with_follower_delay(Duration::from_secs(2)),
    );
    assert!(wait_until(Duration::from_secs(1), || c1.observer.is_leading()).await);
    let c2 = spawn_candidate(&elector, 0, "2", Recorder::default());
    tokio::time::sleep(Duration::from_millis(100)).await;

    c1.shutdown.send_replace(true);

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(!c2.observer.is_leading(), "successor activated during grace period");
    assert_ne!(elector.state(0, "2"), LeadershipState::Leader);

    assert!(wait_until(Duration::from_millis(1500), || c2.observer.is_leading()).await);
    assert!(!c1.observer.is_leading());
    c1.handle.await.unwrap();

    elector.stop(0);
    c2.handle.await.unwrap();
}

#[tokio::test]
async fn lock_gating_holds_successor_until_follower_handler_returns() {
    let leases = MemoryLeases::new();
    let elector = elector_on(&leases, true);
    let c1 = spawn_candidate(
        &elector,
        0,
        "1",
        Recorder::with_follower_delay(Duration::from_secs(2)),
    );
    assert!(wait_until(Duration::from_secs(1), || c1.observer.is_leading()).await);
    let c2 = spawn_candidate(&elector, 0, "2", Recorder::default());
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Losing the key frees it at once; only the lock still guards the role.
    assert!(leases.delete_if(LEADER_KEY, "1").await.unwrap());

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(c1.observer.is_leading(), "follower handler still running");
    assert!(!c2.observer.is_leading(), "successor activated before the lock was released");
    assert_ne!(elector.state(0, "2"), LeadershipState::Leader);

    assert!(wait_until(Duration::from_millis(2500), || c2.observer.is_leading()).await);
    assert!(!c1.observer.is_leading());
    assert_eq!(elector.current_leader(0).await.unwrap(), "2");

    elector.stop(0);
    c1.handle.await.unwrap();
    c2.handle.await.unwrap();
}

#[tokio::test]
async fn without_lock_gating_successor_overlaps_follower_handler() {
    let leases = MemoryLeases::new();
    let elector = elector_on(&leases, false);
    let c1 = spawn_candidate(
        &elector,
        0,
        "1",
        Recorder::with_follower_delay(Duration::from_secs(2)),
    );
    assert!(wait_until(Duration::from_secs(1), || c1.observer.is_leading()).await);
    let c2 = spawn_candidate(&elector, 0, "2", Recorder::default());
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(leases.delete_if(LEADER_KEY, "1").await.unwrap());

    assert!(wait_until(Duration::from_secs(1), || c2.observer.is_leading()).await);
    assert!(c1.observer.is_leading(), "old leader is still inside its follower handler");

    elector.stop(0);
    c1.handle.await.unwrap();
    c2.handle.await.unwrap();
}

#[tokio::test]
async fn change_leader_to_requires_current_leader() {
    let elector = elector(false);
    let c1 = spawn_candidate(&elector, 0, "1", Recorder::default());
    assert!(wait_until(Duration::from_secs(1), || c1.observer.is_leading()).await);
    let c2 = spawn_candidate(&elector, 0, "2", Recorder::default());
    tokio::time::sleep(Duration::from_millis(100)).await;

    let err = elector.change_leader_to(0, "2", "3").await.unwrap_err();
    assert!(matches!(err, ElectionError::NotLeader { group: 0, .. }));
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(elector.current_leader(0).await.unwrap(), "1");

    elector.change_leader_to(0, "1", "2").await.unwrap();
    assert!(wait_until(Duration::from_secs(1), || c2.observer.is_leading()).await);
    assert!(!c1.observer.is_leading());
    assert_eq!(elector.current_leader(0).await.unwrap(), "2");

    // The former leader keeps campaigning as a follower.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(elector.state(0, "1"), LeadershipState::Follower);
    assert_eq!(elector.current_leader(0).await.unwrap(), "2");

    elector.stop(0);
    c1.handle.await.unwrap();
    c2.handle.await.unwrap();
}

#[tokio::test]
async fn transfer_to_absent_target_expires() {
    let elector = elector(false);
    let c1 = spawn_candidate(&elector, 0, "1", Recorder::default());
    assert!(wait_until(Duration::from_secs(1), || c1.observer.is_leading()).await);
    let c2 = spawn_candidate(&elector, 0, "2", Recorder::default());
    tokio::time::sleep(Duration::from_millis(100)).await;

    elector.change_leader_to(0, "1", "9").await.unwrap();
    assert!(wait_until(Duration::from_millis(500), || !c1.observer.is_leading()).await);

    // Nobody may campaign until the hint's lease runs out; then the other
    // candidate wins while the old leader sits out.
    assert!(wait_until(Duration::from_secs(3), || c2.observer.is_leading()).await);
    assert!(!c1.observer.is_leading());
    assert_eq!(elector.current_leader(0).await.unwrap(), "2");

    elector.stop(0);
    c1.handle.await.unwrap();
    c2.handle.await.unwrap();
}

#[tokio::test]
async fn stop_relinquishes_leadership() {
    let elector = elector(false);
    let c1 = spawn_candidate(&elector, 0, "1", Recorder::default());
    assert!(wait_until(Duration::from_secs(1), || c1.observer.is_leading()).await);
    assert_eq!(elector.current_leader(0).await.unwrap(), "1");

    elector.stop(0);
    c1.handle.await.unwrap();

    assert!(!c1.observer.is_leading());
    assert_eq!(elector.state(0, "1"), LeadershipState::Follower);
    assert!(matches!(
        elector.current_leader(0).await,
        Err(ElectionError::NoLeader(0))
    ));

    // A stopped group can be campaigned again.
    let again = spawn_candidate(&elector, 0, "1", Recorder::default());
    assert!(wait_until(Duration::from_secs(1), || again.observer.is_leading()).await);
    elector.stop(0);
    again.handle.await.unwrap();
}

#[tokio::test]
async fn groups_are_independent() {
    let elector = elector(false);
    let a = spawn_candidate(&elector, 1, "a", Recorder::default());
    let b = spawn_candidate(&elector, 2, "b", Recorder::default());
    assert!(wait_until(Duration::from_secs(1), || a.observer.is_leading() && b.observer.is_leading()).await);

    elector.stop(1);
    a.handle.await.unwrap();
    assert!(b.observer.is_leading());
    assert_eq!(elector.current_leader(2).await.unwrap(), "b");

    elector.stop(2);
    b.handle.await.unwrap();
}

#[tokio::test]
async fn at_most_one_leader_through_churn() {
    let elector = elector(true);
    let active = Arc::new(AtomicUsize::new(0));
    let max_active = Arc::new(AtomicUsize::new(0));

    let ids = ["1", "2", "3"];
    let candidates: Vec<Candidate> = ids
        .iter()
        .map(|id| {
            spawn_candidate(
                &elector,
                0,
                *id,
                Recorder::shared(active.clone(), max_active.clone()),
            )
        })
        .collect();

    for round in 0..6 {
        assert!(wait_until(Duration::from_secs(2), || active.load(Ordering::SeqCst) == 1).await);
        let leader = elector.current_leader(0).await.unwrap();
        let next = ids[(round + 1) % ids.len()];
        if leader != next {
            // Another loop may win the key between the read and the request.
            let _ = elector.change_leader_to(0, &leader, next).await;
        }
        tokio::time::sleep(Duration::from_millis(150)).await;
    }

    elector.stop(0);
    for c in candidates {
        c.handle.await.unwrap();
    }
    assert_eq!(max_active.load(Ordering::SeqCst), 1);
    assert_eq!(active.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn subscribe_reports_transitions() {
    let elector = elector(false);
    let mut states = elector.subscribe(0, "1");
    let c1 = spawn_candidate(&elector, 0, "1", Recorder::default());

    tokio::time::timeout(Duration::from_secs(1), states.wait_for(|s| s.is_leader()))
        .await
        .expect("leadership within a second")
        .unwrap();

    elector.stop(0);
    c1.handle.await.unwrap();
    assert_eq!(*states.borrow(), LeadershipState::Follower);
}
