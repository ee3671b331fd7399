//! Diagnostic record of in-flight operations and the nodes they contacted.

use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};
use std::time::{Duration, Instant};

use flume::Sender;

use crate::common::{Contact, Id};

/// Handle of an [Activity] within an [ActivityTracker].
pub type ActivityId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActivityKind {
    /// A lookup or get started by the node itself (seed, random poke).
    InternalGet,
    /// A lookup or get asked for by a user of this node.
    ExternalGet,
    /// A put started by the node itself (republish, cache).
    InternalPut,
    /// A put or remove asked for by a user of this node.
    ExternalPut,
}

impl ActivityKind {
    pub fn is_get(&self) -> bool {
        matches!(self, ActivityKind::InternalGet | ActivityKind::ExternalGet)
    }
}

impl Display for ActivityKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            ActivityKind::InternalGet => "Internal Get",
            ActivityKind::ExternalGet => "Get",
            ActivityKind::InternalPut => "Internal Put",
            ActivityKind::ExternalPut => "Put",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
/// A contacted node in an activity's search tree.
pub struct ActivityNode {
    contact: Contact,
    children: Vec<usize>,
}

impl ActivityNode {
    pub fn contact(&self) -> &Contact {
        &self.contact
    }

    /// Indices of the nodes this node introduced, see [Activity::node].
    pub fn children(&self) -> &[usize] {
        &self.children
    }
}

#[derive(Debug, Clone)]
/// An operation in progress, as seen for diagnostics.
///
/// The search tree is an arena: index 0 is the local node, every other node
/// sits under the node whose response introduced it.
pub struct Activity {
    id: ActivityId,
    target: Id,
    description: String,
    kind: ActivityKind,
    queued: bool,
    nodes: Vec<ActivityNode>,
    started: Instant,
    result: Option<String>,
}

impl Activity {
    // === Getters ===

    pub fn id(&self) -> ActivityId {
        self.id
    }

    pub fn target(&self) -> &Id {
        &self.target
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn kind(&self) -> ActivityKind {
        self.kind
    }

    /// Returns true while the operation waits for a free slot before starting.
    pub fn is_queued(&self) -> bool {
        self.queued
    }

    pub fn root(&self) -> &ActivityNode {
        &self.nodes[0]
    }

    pub fn node(&self, index: usize) -> Option<&ActivityNode> {
        self.nodes.get(index)
    }

    /// Number of contacted nodes, the local node excluded.
    pub fn contacted(&self) -> usize {
        self.nodes.len() - 1
    }

    /// Longest path from the local node down the search tree.
    pub fn depth(&self) -> usize {
        let mut depth = 0;
        let mut stack = vec![(0_usize, 0_usize)];

        while let Some((index, level)) = stack.pop() {
            depth = depth.max(level);

            for child in &self.nodes[index].children {
                stack.push((*child, level + 1));
            }
        }

        depth
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Human readable state: progress while running, the outcome once finished.
    pub fn current_state(&self) -> String {
        match &self.result {
            Some(result) => result.clone(),
            None if self.queued => "Queued".to_string(),
            None => format!(
                "contacted={}, depth={}, time={}ms",
                self.contacted(),
                self.depth(),
                self.elapsed().as_millis()
            ),
        }
    }

    fn position(&self, id: &Id) -> Option<usize> {
        self.nodes
            .iter()
            .position(|node| node.contact.id() == id)
    }
}

#[derive(Debug, Clone)]
/// Changes to the set of activities, delivered to subscribers.
pub enum ActivityEvent {
    Added(Activity),
    Changed(Activity),
    Removed(Activity),
}

#[derive(Debug, Default)]
/// Owns every live [Activity], mutated only from the node's actor thread.
pub struct ActivityTracker {
    next_id: ActivityId,
    activities: BTreeMap<ActivityId, Activity>,
    subscribers: Vec<Sender<ActivityEvent>>,
}

impl ActivityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    // === Getters ===

    pub fn get(&self, id: ActivityId) -> Option<&Activity> {
        self.activities.get(&id)
    }

    /// Owned copies of every live activity, oldest first.
    pub fn snapshot(&self) -> Vec<Activity> {
        self.activities.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.activities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.activities.is_empty()
    }

    // === Public Methods ===

    /// Register a new activity rooted at the local node.
    pub fn start(
        &mut self,
        local: Contact,
        target: Id,
        description: &str,
        kind: ActivityKind,
        queued: bool,
    ) -> ActivityId {
        let id = self.next_id;
        self.next_id += 1;

        let activity = Activity {
            id,
            target,
            description: description.to_string(),
            kind,
            queued,
            nodes: vec![ActivityNode {
                contact: local,
                children: Vec::new(),
            }],
            started: Instant::now(),
            result: None,
        };

        Self::notify(&mut self.subscribers, || ActivityEvent::Added(activity.clone()));
        self.activities.insert(id, activity);

        id
    }

    pub fn set_queued(&mut self, id: ActivityId, queued: bool) {
        if let Some(activity) = self.activities.get_mut(&id) {
            if activity.queued != queued {
                activity.queued = queued;
                Self::notify(&mut self.subscribers, || ActivityEvent::Changed(activity.clone()));
            }
        }
    }

    /// Record that `contact` was queried, introduced by `parent` (the local node if None).
    ///
    /// A contact already in the tree is never added twice, which keeps it acyclic.
    pub fn add_node(&mut self, id: ActivityId, parent: Option<&Id>, contact: Contact) {
        let Some(activity) = self.activities.get_mut(&id) else {
            return;
        };

        if activity.position(contact.id()).is_some() {
            return;
        }

        let parent = parent
            .and_then(|parent| activity.position(parent))
            .unwrap_or(0);

        let index = activity.nodes.len();
        activity.nodes.push(ActivityNode {
            contact,
            children: Vec::new(),
        });
        activity.nodes[parent].children.push(index);

        Self::notify(&mut self.subscribers, || ActivityEvent::Changed(activity.clone()));
    }

    /// Remove a finished activity, returning it with its final state.
    pub fn finish(&mut self, id: ActivityId, result: String) -> Option<Activity> {
        let mut activity = self.activities.remove(&id)?;
        activity.queued = false;
        activity.result = Some(result);

        Self::notify(&mut self.subscribers, || ActivityEvent::Removed(activity.clone()));

        Some(activity)
    }

    /// Subscribe to activity events, starting with [ActivityEvent::Added] for
    /// every live activity.
    pub fn subscribe(&mut self, sender: Sender<ActivityEvent>) {
        for activity in self.activities.values() {
            if sender.send(ActivityEvent::Added(activity.clone())).is_err() {
                return;
            }
        }

        self.subscribers.push(sender);
    }

    // === Private Methods ===

    /// Send an event to every subscriber, only building it if there is one.
    fn notify(subscribers: &mut Vec<Sender<ActivityEvent>>, event: impl FnOnce() -> ActivityEvent) {
        if subscribers.is_empty() {
            return;
        }

        let event = event();

        subscribers.retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_tree() {
        let mut tracker = ActivityTracker::new();
        let local = Contact::unique(1);

        let id = tracker.start(local, Id::random(), "test", ActivityKind::ExternalGet, false);

        let a = Contact::unique(2);
        let b = Contact::unique(3);
        let c = Contact::unique(4);

        tracker.add_node(id, None, a.clone());
        tracker.add_node(id, Some(a.id()), b.clone());
        tracker.add_node(id, Some(b.id()), c.clone());
        // Already known, never re-parented.
        tracker.add_node(id, None, c.clone());

        let activity = tracker.get(id).unwrap();

        assert_eq!(activity.contacted(), 3);
        assert_eq!(activity.depth(), 3);
        assert_eq!(activity.root().children(), &[1]);
        assert_eq!(activity.node(1).unwrap().contact(), &a);
    }

    #[test]
    fn subscribers_see_live_activities_first() {
        let mut tracker = ActivityTracker::new();

        let queued = tracker.start(
            Contact::unique(1),
            Id::random(),
            "republish",
            ActivityKind::InternalPut,
            true,
        );

        let (sender, receiver) = flume::unbounded();
        tracker.subscribe(sender);

        assert!(matches!(
            receiver.try_recv(),
            Ok(ActivityEvent::Added(activity)) if activity.is_queued()
        ));

        tracker.set_queued(queued, false);
        assert!(matches!(
            receiver.try_recv(),
            Ok(ActivityEvent::Changed(activity)) if !activity.is_queued()
        ));

        let finished = tracker.finish(queued, "time=1ms".to_string()).unwrap();
        assert_eq!(finished.current_state(), "time=1ms");
        assert!(matches!(receiver.try_recv(), Ok(ActivityEvent::Removed(_))));

        assert!(tracker.is_empty());
    }

    #[test]
    fn dropped_subscribers_are_forgotten() {
        let mut tracker = ActivityTracker::new();

        let (sender, receiver) = flume::unbounded();
        tracker.subscribe(sender);
        drop(receiver);

        tracker.start(
            Contact::unique(1),
            Id::random(),
            "lookup",
            ActivityKind::InternalGet,
            false,
        );

        assert!(tracker.subscribers.is_empty());
    }

    #[test]
    fn events_are_only_built_for_subscribers() {
        let mut tracker = ActivityTracker::new();
        let id = tracker.start(
            Contact::unique(1),
            Id::random(),
            "lookup",
            ActivityKind::ExternalGet,
            false,
        );

        let built = std::cell::Cell::new(0);
        let event = || {
            built.set(built.get() + 1);
            ActivityEvent::Removed(tracker.get(id).cloned().unwrap())
        };
        let mut subscribers = Vec::new();

        ActivityTracker::notify(&mut subscribers, &event);
        assert_eq!(built.get(), 0);

        let (sender, receiver) = flume::unbounded();
        subscribers.push(sender);

        ActivityTracker::notify(&mut subscribers, &event);
        assert_eq!(built.get(), 1);
        assert!(matches!(receiver.try_recv(), Ok(ActivityEvent::Removed(_))));

        // Nodes added without subscribers still show up in the first snapshot.
        for port in 2..50 {
            tracker.add_node(id, None, Contact::unique(port));
        }

        let (sender, receiver) = flume::unbounded();
        tracker.subscribe(sender);

        let events: Vec<ActivityEvent> = receiver.try_iter().collect();
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            ActivityEvent::Added(activity) if activity.contacted() == 48
        ));
    }
}
