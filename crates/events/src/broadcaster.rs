//! Per-group broadcast hub for [`GroupEvent`]s.
//!
//! [`EventBroadcaster`] keeps one `tokio::sync::broadcast` channel per job
//! group for as long as the group is retained. It is designed to be shared
//! via `Arc<EventBroadcaster>` between the execution engine (publisher) and
//! connection handlers (subscribers).

use std::collections::{HashMap, VecDeque};
use std::sync::{PoisonError, RwLock};

use renderfarm_core::events::GroupEvent;
use renderfarm_core::job_group::JobGroupSnapshot;
use renderfarm_core::types::GroupId;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

/// Default per-group buffer capacity.
pub const DEFAULT_CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// EventBroadcaster
// ---------------------------------------------------------------------------

/// Fan-out of each job group's event stream to any number of subscribers.
///
/// Every subscriber receives its own copy of every event. When a
/// subscriber falls more than `capacity` events behind it is dropped
/// rather than slowing the publisher.
pub struct EventBroadcaster {
    channels: RwLock<HashMap<GroupId, broadcast::Sender<GroupEvent>>>,
    capacity: usize,
}

impl EventBroadcaster {
    /// Create a broadcaster whose per-group channels buffer `capacity` events.
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Open the channel for a new group. Re-registering is a no-op.
    pub fn register(&self, group_id: GroupId) {
        let mut channels = self.channels.write().unwrap_or_else(PoisonError::into_inner);
        channels
            .entry(group_id)
            .or_insert_with(|| broadcast::channel(self.capacity).0);
    }

    /// Close a group's channel. Open streams end after draining what they
    /// already buffered.
    pub fn remove(&self, group_id: GroupId) -> bool {
        self.channels
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&group_id)
            .is_some()
    }

    /// Publish an event to every current subscriber of `group_id`.
    ///
    /// Events for unknown groups, or groups without subscribers, are
    /// silently dropped.
    pub fn publish(&self, group_id: GroupId, event: GroupEvent) {
        let channels = self.channels.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(sender) = channels.get(&group_id) {
            // A SendError only means there are zero receivers.
            let _ = sender.send(event);
        }
    }

    /// Subscribe to a group's events.
    ///
    /// The live receiver is attached *before* `snapshot` is taken, so no
    /// event can fall between the `InitialState` and the live stream; an
    /// event may be seen twice (once folded into the snapshot, once live).
    ///
    /// Returns `None` if the group has no channel or `snapshot` returns
    /// `None`.
    pub fn subscribe<F>(&self, group_id: GroupId, snapshot: F) -> Option<GroupEventStream>
    where
        F: FnOnce() -> Option<JobGroupSnapshot>,
    {
        let receiver = {
            let channels = self.channels.read().unwrap_or_else(PoisonError::into_inner);
            channels.get(&group_id)?.subscribe()
        };

        let snapshot = snapshot()?;
        let mut pending = VecDeque::with_capacity(2);
        pending.push_back(GroupEvent::initial_state(&snapshot));

        // `completed_at` is set together with the live GroupComplete.
        let finished = snapshot.completed_at.is_some();
        if finished {
            // The live GroupComplete may already be gone; replay it.
            pending.push_back(GroupEvent::group_complete(&snapshot));
        }

        Some(GroupEventStream {
            group_id,
            pending,
            receiver: (!finished).then_some(receiver),
        })
    }

    /// Number of live subscribers for a group.
    pub fn subscriber_count(&self, group_id: GroupId) -> usize {
        self.channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&group_id)
            .map_or(0, broadcast::Sender::receiver_count)
    }

    /// Number of groups with an open channel.
    pub fn group_count(&self) -> usize {
        self.channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// GroupEventStream
// ---------------------------------------------------------------------------

/// One subscriber's ordered view of a group's events.
pub struct GroupEventStream {
    group_id: GroupId,
    pending: VecDeque<GroupEvent>,
    receiver: Option<broadcast::Receiver<GroupEvent>>,
}

impl GroupEventStream {
    pub fn group_id(&self) -> GroupId {
        self.group_id
    }

    /// Receive the next event.
    ///
    /// Returns `None` once `GroupComplete` has been delivered, when the
    /// group's channel is closed, or when this subscriber lagged too far
    /// behind and was dropped.
    pub async fn recv(&mut self) -> Option<GroupEvent> {
        if let Some(event) = self.pending.pop_front() {
            if event.is_group_complete() {
                self.finish();
            }
            return Some(event);
        }

        let receiver = self.receiver.as_mut()?;
        match receiver.recv().await {
            Ok(event) => {
                if event.is_group_complete() {
                    self.finish();
                }
                Some(event)
            }
            Err(RecvError::Closed) => {
                self.finish();
                None
            }
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(
                    group_id = %self.group_id,
                    skipped,
                    "Dropping lagging event subscriber",
                );
                self.finish();
                None
            }
        }
    }

    fn finish(&mut self) {
        self.pending.clear();
        self.receiver = None;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use renderfarm_core::job_group::{
        ChildCounts, ChildJob, GroupStatus, JobSpec, Parameters,
    };
    use renderfarm_core::seeds::SeedStrategy;
    use renderfarm_core::types::{new_id, JobId};

    fn snapshot(group_id: GroupId, children: Vec<ChildJob>, status: GroupStatus) -> JobGroupSnapshot {
        JobGroupSnapshot {
            group_id,
            status,
            job_spec: JobSpec::new(serde_json::json!({})),
            parameters: Parameters::new(),
            seed_strategy: SeedStrategy::Sequential,
            base_seed: None,
            timeout_seconds: 300,
            metadata: serde_json::json!({}),
            created_at: Utc::now(),
            completed_at: None,
            counts: ChildCounts::from_children(&children),
            children,
        }
    }

    fn cancelled(job_id: JobId) -> GroupEvent {
        GroupEvent::ChildCancelled {
            job_id,
            backend_id: "gpu-a".to_string(),
        }
    }

    #[tokio::test]
    async fn subscriber_receives_initial_state_then_live_events() {
        let broadcaster = EventBroadcaster::default();
        let group_id = new_id();
        broadcaster.register(group_id);

        let child = ChildJob::new("gpu-a".to_string(), 1);
        let job_id = child.job_id;
        let mut stream = broadcaster
            .subscribe(group_id, || {
                Some(snapshot(group_id, vec![child], GroupStatus::Running))
            })
            .expect("group should be registered");

        broadcaster.publish(group_id, cancelled(job_id));

        let first = stream.recv().await.expect("initial state");
        assert_eq!(first.kind(), "initial_state");
        let second = stream.recv().await.expect("live event");
        assert_eq!(second, cancelled(job_id));
    }

    #[tokio::test]
    async fn multiple_subscribers_each_get_every_event() {
        let broadcaster = EventBroadcaster::default();
        let group_id = new_id();
        broadcaster.register(group_id);

        let snap = || Some(snapshot(group_id, vec![], GroupStatus::Running));
        let mut s1 = broadcaster.subscribe(group_id, snap).unwrap();
        let mut s2 = broadcaster.subscribe(group_id, snap).unwrap();
        assert_eq!(broadcaster.subscriber_count(group_id), 2);

        let job_id = new_id();
        broadcaster.publish(group_id, cancelled(job_id));

        for stream in [&mut s1, &mut s2] {
            assert_eq!(stream.recv().await.unwrap().kind(), "initial_state");
            assert_eq!(stream.recv().await.unwrap(), cancelled(job_id));
        }
    }

    #[tokio::test]
    async fn terminal_group_replays_group_complete_and_ends() {
        let broadcaster = EventBroadcaster::default();
        let group_id = new_id();
        broadcaster.register(group_id);

        let mut child = ChildJob::new("gpu-a".to_string(), 1);
        child.start(Utc::now());
        child.complete(serde_json::json!({"images": []}), Utc::now());

        let mut done = snapshot(group_id, vec![child], GroupStatus::Completed);
        done.completed_at = Some(Utc::now());
        let mut stream = broadcaster.subscribe(group_id, || Some(done)).unwrap();

        assert_eq!(stream.recv().await.unwrap().kind(), "initial_state");
        let last = stream.recv().await.unwrap();
        assert!(last.is_group_complete());
        assert!(stream.recv().await.is_none());
    }

    #[tokio::test]
    async fn terminal_children_without_completion_stay_live() {
        let broadcaster = EventBroadcaster::default();
        let group_id = new_id();
        broadcaster.register(group_id);

        let mut child = ChildJob::new("gpu-a".to_string(), 1);
        child.start(Utc::now());
        child.complete(serde_json::json!({"images": []}), Utc::now());
        let mut stream = broadcaster
            .subscribe(group_id, || {
                Some(snapshot(group_id, vec![child], GroupStatus::Running))
            })
            .unwrap();

        let mut done = snapshot(group_id, vec![], GroupStatus::Completed);
        done.completed_at = Some(Utc::now());
        broadcaster.publish(group_id, GroupEvent::group_complete(&done));

        assert_eq!(stream.recv().await.unwrap().kind(), "initial_state");
        match stream.recv().await.unwrap() {
            GroupEvent::GroupComplete { status, .. } => assert_eq!(status, GroupStatus::Completed),
            other => panic!("Expected GroupComplete, got {other:?}"),
        }
        assert!(stream.recv().await.is_none());
    }

    #[tokio::test]
    async fn cancelled_group_with_running_children_stays_live() {
        let broadcaster = EventBroadcaster::default();
        let group_id = new_id();
        broadcaster.register(group_id);

        let mut child = ChildJob::new("gpu-a".to_string(), 1);
        child.start(Utc::now());
        let job_id = child.job_id;
        let mut stream = broadcaster
            .subscribe(group_id, || {
                Some(snapshot(group_id, vec![child], GroupStatus::Cancelled))
            })
            .unwrap();

        broadcaster.publish(group_id, cancelled(job_id));

        assert_eq!(stream.recv().await.unwrap().kind(), "initial_state");
        assert_eq!(stream.recv().await.unwrap(), cancelled(job_id));
    }

    #[tokio::test]
    async fn stream_ends_after_live_group_complete() {
        let broadcaster = EventBroadcaster::default();
        let group_id = new_id();
        broadcaster.register(group_id);
        let mut stream = broadcaster
            .subscribe(group_id, || Some(snapshot(group_id, vec![], GroupStatus::Running)))
            .unwrap();

        let done = snapshot(group_id, vec![], GroupStatus::Completed);
        broadcaster.publish(group_id, GroupEvent::group_complete(&done));
        broadcaster.publish(group_id, cancelled(new_id()));

        assert_eq!(stream.recv().await.unwrap().kind(), "initial_state");
        assert!(stream.recv().await.unwrap().is_group_complete());
        assert!(stream.recv().await.is_none());
    }

    #[tokio::test]
    async fn lagging_subscriber_is_dropped_without_blocking_publisher() {
        let broadcaster = EventBroadcaster::new(2);
        let group_id = new_id();
        broadcaster.register(group_id);
        let mut stream = broadcaster
            .subscribe(group_id, || Some(snapshot(group_id, vec![], GroupStatus::Running)))
            .unwrap();

        for _ in 0..10 {
            broadcaster.publish(group_id, cancelled(new_id()));
        }

        assert_eq!(stream.recv().await.unwrap().kind(), "initial_state");
        assert!(stream.recv().await.is_none());
    }

    #[tokio::test]
    async fn removing_group_closes_streams() {
        let broadcaster = EventBroadcaster::default();
        let group_id = new_id();
        broadcaster.register(group_id);
        let mut stream = broadcaster
            .subscribe(group_id, || Some(snapshot(group_id, vec![], GroupStatus::Running)))
            .unwrap();

        assert!(broadcaster.remove(group_id));
        assert_eq!(broadcaster.group_count(), 0);

        assert_eq!(stream.recv().await.unwrap().kind(), "initial_state");
        assert!(stream.recv().await.is_none());
    }

    #[test]
    fn subscribe_to_unknown_group_returns_none() {
        let broadcaster = EventBroadcaster::default();
        let group_id = new_id();
        assert!(broadcaster
            .subscribe(group_id, || Some(snapshot(group_id, vec![], GroupStatus::Running)))
            .is_none());
    }

    #[test]
    fn publish_without_subscribers_does_not_panic() {
        let broadcaster = EventBroadcaster::default();
        let group_id = new_id();
        broadcaster.register(group_id);
        broadcaster.publish(group_id, cancelled(new_id()));
        broadcaster.publish(new_id(), cancelled(new_id()));
    }
}
