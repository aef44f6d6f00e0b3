//! Name-keyed matching of raised external events to subscriptions.
//!
//! Raised events are always appended to history, whether or not anyone is
//! waiting. During replay each open subscription for a name is paired, in
//! registration order, with the unclaimed events of that name in arrival
//! order. Claims and cancellations are replay state; they are rebuilt on
//! every turn from the orchestration's own behavior.

use std::collections::HashSet;

use crate::{Event, EventKind};

#[derive(Debug, Default)]
pub(crate) struct EventCorrelator {
    claimed_events: HashSet<u64>,
    resolved_subscriptions: HashSet<u64>,
}

impl EventCorrelator {
    /// The `(event_id, data)` the subscription would receive right now, if any.
    pub(crate) fn match_for(
        &self,
        history: &[Event],
        cancelled: &HashSet<u64>,
        subscription_id: u64,
        name: &str,
    ) -> Option<(u64, String)> {
        let position = history
            .iter()
            .filter(|e| match &e.kind {
                EventKind::ExternalSubscribed { name: n } => {
                    n == name
                        && !cancelled.contains(&e.event_id)
                        && !self.resolved_subscriptions.contains(&e.event_id)
                }
                _ => false,
            })
            .position(|e| e.event_id == subscription_id)?;

        history
            .iter()
            .filter_map(|e| match &e.kind {
                EventKind::ExternalEvent { name: n, data } if n == name && !self.claimed_events.contains(&e.event_id) => {
                    Some((e.event_id, data.clone()))
                }
                _ => None,
            })
            .nth(position)
    }

    pub(crate) fn claim(&mut self, subscription_id: u64, event_id: u64) {
        self.resolved_subscriptions.insert(subscription_id);
        self.claimed_events.insert(event_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ev(id: u64, kind: EventKind) -> Event {
        Event::with_event_id(id, "i", 1, None, kind)
    }

    fn sub(id: u64, name: &str) -> Event {
        ev(id, EventKind::ExternalSubscribed { name: name.into() })
    }

    fn raised(id: u64, name: &str, data: &str) -> Event {
        ev(
            id,
            EventKind::ExternalEvent {
                name: name.into(),
                data: data.into(),
            },
        )
    }

    #[test]
    fn earliest_event_goes_to_earliest_subscription() {
        let h = vec![sub(2, "Go"), sub(3, "Go"), raised(4, "Go", "a"), raised(5, "Go", "b")];
        let c = EventCorrelator::default();
        let none = HashSet::new();
        assert_eq!(c.match_for(&h, &none, 2, "Go"), Some((4, "a".into())));
        assert_eq!(c.match_for(&h, &none, 3, "Go"), Some((5, "b".into())));
    }

    #[test]
    fn event_raised_before_subscription_is_queued() {
        let h = vec![raised(2, "Go", "early"), sub(3, "Go")];
        let c = EventCorrelator::default();
        assert_eq!(c.match_for(&h, &HashSet::new(), 3, "Go"), Some((2, "early".into())));
    }

    #[test]
    fn cancelled_subscription_claims_nothing_and_frees_the_event() {
        let h = vec![sub(2, "Go"), sub(5, "Go"), raised(6, "Go", "late")];
        let c = EventCorrelator::default();
        let cancelled: HashSet<u64> = [2].into_iter().collect();
        assert_eq!(c.match_for(&h, &cancelled, 2, "Go"), None);
        assert_eq!(c.match_for(&h, &cancelled, 5, "Go"), Some((6, "late".into())));
    }

    #[test]
    fn claimed_events_are_not_delivered_twice() {
        let h = vec![sub(2, "Go"), raised(3, "Go", "x"), sub(4, "Go")];
        let mut c = EventCorrelator::default();
        let none = HashSet::new();
        assert_eq!(c.match_for(&h, &none, 2, "Go"), Some((3, "x".into())));
        c.claim(2, 3);
        assert_eq!(c.match_for(&h, &none, 4, "Go"), None);
    }

    #[test]
    fn names_do_not_cross() {
        let h = vec![sub(2, "A"), raised(3, "B", "b")];
        let c = EventCorrelator::default();
        assert_eq!(c.match_for(&h, &HashSet::new(), 2, "A"), None);
    }
}
