//! Event and eventgroup registry.
//!
//! Stores field/event payloads, maps events to eventgroups, and records
//! subscribers with their expirations. Fields cache the last set value and
//! replay it once to every new subscriber; plain events do not cache.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::Instant;

use bytes::Bytes;

use crate::endpoint::{EndpointDefinition, Target};
use crate::{ClientId, EventId, EventgroupId, InstanceId, MajorVersion, ServiceId, Ttl};

// ============================================================================
// EVENT INFO
// ============================================================================

/// One registered event or field.
#[derive(Debug, Clone)]
pub struct EventInfo {
    pub event: EventId,
    /// Fields cache their last value and replay it on subscription.
    pub is_field: bool,
    /// Provided by the local application (true) or consumed from remote.
    pub is_provided: bool,
    pub eventgroups: HashSet<EventgroupId>,
    payload: Option<Bytes>,
}

impl EventInfo {
    pub fn new(
        event: EventId,
        eventgroups: HashSet<EventgroupId>,
        is_field: bool,
        is_provided: bool,
    ) -> Self {
        Self {
            event,
            is_field,
            is_provided,
            eventgroups,
            payload: None,
        }
    }

    /// Store a payload. Only fields keep it for replay.
    pub fn set_payload(&mut self, payload: Bytes) {
        if self.is_field {
            self.payload = Some(payload);
        }
    }

    /// The cached value, if one was ever set.
    pub fn payload(&self) -> Option<&Bytes> {
        self.payload.as_ref()
    }

    pub fn is_set(&self) -> bool {
        self.payload.is_some()
    }
}

// ============================================================================
// EVENTGROUP INFO
// ============================================================================

/// One eventgroup: versioning, optional multicast target, member events,
/// and the subscriber list.
#[derive(Debug, Clone)]
pub struct EventgroupInfo {
    pub major: MajorVersion,
    pub ttl: Ttl,
    pub multicast: Option<(IpAddr, u16)>,
    pub events: HashSet<EventId>,
    targets: Vec<Target>,
    local_clients: HashSet<ClientId>,
}

impl EventgroupInfo {
    pub fn new(major: MajorVersion, ttl: Ttl) -> Self {
        Self {
            major,
            ttl,
            multicast: None,
            events: HashSet::new(),
            targets: Vec::new(),
            local_clients: HashSet::new(),
        }
    }

    /// Remote subscribers.
    pub fn targets(&self) -> &[Target] {
        &self.targets
    }

    /// Locally subscribed client ids.
    pub fn local_clients(&self) -> impl Iterator<Item = ClientId> + '_ {
        self.local_clients.iter().copied()
    }

    /// Add a remote subscriber. Duplicates (by endpoint equality) only
    /// update the expiration. Returns true if the caller newly became a
    /// subscriber.
    pub fn add_target(&mut self, target: Target) -> bool {
        if let Some(existing) = self
            .targets
            .iter_mut()
            .find(|existing| existing.endpoint == target.endpoint)
        {
            existing.expiration = target.expiration;
            return false;
        }
        self.targets.push(target);
        true
    }

    /// Update only the expiration of an existing subscriber.
    pub fn update_target(&mut self, endpoint: &EndpointDefinition, expiration: Instant) -> bool {
        match self
            .targets
            .iter_mut()
            .find(|existing| existing.endpoint == *endpoint)
        {
            Some(existing) => {
                existing.expiration = expiration;
                true
            }
            None => false,
        }
    }

    /// Drop a subscriber by endpoint equality.
    pub fn remove_target(&mut self, endpoint: &EndpointDefinition) -> bool {
        let before = self.targets.len();
        self.targets.retain(|existing| existing.endpoint != *endpoint);
        self.targets.len() != before
    }

    /// Evict subscribers whose expiration is not strictly in the future.
    /// Returns the earliest remaining expiration.
    pub fn expire(&mut self, now: Instant) -> Option<Instant> {
        self.targets.retain(|target| target.expiration > now);
        self.targets.iter().map(|target| target.expiration).min()
    }

    pub fn add_local_client(&mut self, client: ClientId) -> bool {
        self.local_clients.insert(client)
    }

    pub fn remove_local_client(&mut self, client: ClientId) -> bool {
        self.local_clients.remove(&client)
    }
}

// ============================================================================
// REGISTRY
// ============================================================================

type EventKey = (ServiceId, InstanceId, EventId);
type GroupKey = (ServiceId, InstanceId, EventgroupId);

/// Registry of events and eventgroups across all service instances.
///
/// Interior locking keeps the accessors callable from the socket tasks and
/// the application API alike; callers pass closures rather than holding
/// references across the lock.
#[derive(Default)]
pub struct EventRegistry {
    events: Mutex<HashMap<EventKey, EventInfo>>,
    eventgroups: Mutex<HashMap<GroupKey, EventgroupInfo>>,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an event and attach it to its eventgroups, creating the
    /// groups as needed. Re-registration merges the group set.
    pub fn register_event(
        &self,
        service: ServiceId,
        instance: InstanceId,
        event: EventId,
        eventgroups: &HashSet<EventgroupId>,
        is_field: bool,
        is_provided: bool,
        major: MajorVersion,
        ttl: Ttl,
    ) {
        let mut events = self.events.lock().expect("event table poisoned");
        let info = events
            .entry((service, instance, event))
            .or_insert_with(|| EventInfo::new(event, eventgroups.clone(), is_field, is_provided));
        info.eventgroups.extend(eventgroups.iter().copied());
        info.is_provided = is_provided;
        drop(events);

        let mut groups = self.eventgroups.lock().expect("eventgroup table poisoned");
        for eventgroup in eventgroups {
            groups
                .entry((service, instance, *eventgroup))
                .or_insert_with(|| EventgroupInfo::new(major, ttl))
                .events
                .insert(event);
        }
    }

    /// Remove an event. The event disappears from its groups; groups
    /// without events and without subscribers are dropped.
    pub fn unregister_event(&self, service: ServiceId, instance: InstanceId, event: EventId) {
        let removed = self
            .events
            .lock()
            .expect("event table poisoned")
            .remove(&(service, instance, event));
        if let Some(info) = removed {
            let mut groups = self.eventgroups.lock().expect("eventgroup table poisoned");
            for eventgroup in &info.eventgroups {
                let key = (service, instance, *eventgroup);
                let now_empty = groups
                    .get_mut(&key)
                    .map(|group| {
                        group.events.remove(&event);
                        group.events.is_empty() && group.targets.is_empty()
                    })
                    .unwrap_or(false);
                if now_empty {
                    groups.remove(&key);
                }
            }
        }
    }

    /// Run `f` on the event, if registered.
    pub fn with_event<R>(
        &self,
        service: ServiceId,
        instance: InstanceId,
        event: EventId,
        f: impl FnOnce(&mut EventInfo) -> R,
    ) -> Option<R> {
        self.events
            .lock()
            .expect("event table poisoned")
            .get_mut(&(service, instance, event))
            .map(f)
    }

    /// Create the eventgroup if it is not known yet.
    pub fn ensure_eventgroup(
        &self,
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
        major: MajorVersion,
        ttl: Ttl,
    ) {
        self.eventgroups
            .lock()
            .expect("eventgroup table poisoned")
            .entry((service, instance, eventgroup))
            .or_insert_with(|| EventgroupInfo::new(major, ttl));
    }

    /// Run `f` on the eventgroup, if known.
    pub fn with_eventgroup<R>(
        &self,
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
        f: impl FnOnce(&mut EventgroupInfo) -> R,
    ) -> Option<R> {
        self.eventgroups
            .lock()
            .expect("eventgroup table poisoned")
            .get_mut(&(service, instance, eventgroup))
            .map(f)
    }

    /// Store a payload on an event; fields cache it. Returns false for an
    /// unknown event.
    pub fn set_payload(
        &self,
        service: ServiceId,
        instance: InstanceId,
        event: EventId,
        payload: Bytes,
    ) -> bool {
        self.with_event(service, instance, event, |info| info.set_payload(payload))
            .is_some()
    }

    /// Whether the event is a registered field.
    pub fn is_field(&self, service: ServiceId, instance: InstanceId, event: EventId) -> bool {
        self.with_event(service, instance, event, |info| info.is_field)
            .unwrap_or(false)
    }

    /// Cached field values for every set field in the group, for replay to
    /// a new subscriber.
    pub fn cached_fields(
        &self,
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
    ) -> Vec<(EventId, Bytes)> {
        let members: Vec<EventId> = match self.with_eventgroup(service, instance, eventgroup, |group| {
            group.events.iter().copied().collect()
        }) {
            Some(members) => members,
            None => return Vec::new(),
        };
        let events = self.events.lock().expect("event table poisoned");
        members
            .into_iter()
            .filter_map(|event| {
                let info = events.get(&(service, instance, event))?;
                if info.is_field {
                    info.payload().map(|payload| (event, payload.clone()))
                } else {
                    None
                }
            })
            .collect()
    }

    /// Eventgroups the event belongs to.
    pub fn groups_of_event(
        &self,
        service: ServiceId,
        instance: InstanceId,
        event: EventId,
    ) -> Vec<EventgroupId> {
        self.with_event(service, instance, event, |info| {
            info.eventgroups.iter().copied().collect()
        })
        .unwrap_or_default()
    }

    /// Scan all groups, evict expired subscribers, and return the earliest
    /// remaining expiration.
    pub fn expire_subscriptions(&self, now: Instant) -> Option<Instant> {
        let mut groups = self.eventgroups.lock().expect("eventgroup table poisoned");
        groups
            .values_mut()
            .filter_map(|group| group.expire(now))
            .min()
    }

    /// Drop every subscriber whose endpoint address matches `address`
    /// (transport loss for that peer).
    pub fn expire_subscriptions_of(&self, address: IpAddr) {
        let mut groups = self.eventgroups.lock().expect("eventgroup table poisoned");
        for group in groups.values_mut() {
            group.targets.retain(|target| target.endpoint.address != address);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn definition(port: u16) -> EndpointDefinition {
        EndpointDefinition::new(IpAddr::from([192, 0, 2, 5]), port, false)
    }

    #[test]
    fn duplicate_subscriber_keeps_later_expiration() {
        let mut group = EventgroupInfo::new(1, 3);
        let now = Instant::now();

        assert!(group.add_target(Target {
            endpoint: definition(30491),
            expiration: now + Duration::from_secs(1),
        }));
        assert!(!group.add_target(Target {
            endpoint: definition(30491),
            expiration: now + Duration::from_secs(5),
        }));

        assert_eq!(group.targets().len(), 1);
        assert_eq!(group.targets()[0].expiration, now + Duration::from_secs(5));
    }

    #[test]
    fn expire_evicts_and_returns_earliest_remaining() {
        let mut group = EventgroupInfo::new(1, 3);
        let now = Instant::now();
        group.add_target(Target {
            endpoint: definition(1000),
            expiration: now + Duration::from_secs(1),
        });
        group.add_target(Target {
            endpoint: definition(1001),
            expiration: now + Duration::from_secs(9),
        });

        let next = group.expire(now + Duration::from_secs(2));
        assert_eq!(group.targets().len(), 1);
        assert_eq!(next, Some(now + Duration::from_secs(9)));

        let next = group.expire(now + Duration::from_secs(9));
        assert!(group.targets().is_empty());
        assert_eq!(next, None);
    }

    #[test]
    fn fields_cache_payloads_plain_events_do_not() {
        let registry = EventRegistry::new();
        let groups: HashSet<EventgroupId> = [0x0001].into_iter().collect();
        registry.register_event(0x1234, 0x0001, 0x8001, &groups, true, true, 1, 3);
        registry.register_event(0x1234, 0x0001, 0x8002, &groups, false, true, 1, 3);

        registry.set_payload(0x1234, 0x0001, 0x8001, Bytes::from_static(&[0xAA]));
        registry.set_payload(0x1234, 0x0001, 0x8002, Bytes::from_static(&[0xBB]));

        let cached = registry.cached_fields(0x1234, 0x0001, 0x0001);
        assert_eq!(cached, vec![(0x8001, Bytes::from_static(&[0xAA]))]);
    }

    #[test]
    fn update_target_touches_only_expiration() {
        let mut group = EventgroupInfo::new(1, 3);
        let now = Instant::now();
        let endpoint = definition(30491);
        group.add_target(Target {
            endpoint,
            expiration: now,
        });

        assert!(group.update_target(&endpoint, now + Duration::from_secs(7)));
        assert_eq!(group.targets()[0].expiration, now + Duration::from_secs(7));

        assert!(!group.update_target(&definition(9), now));
    }

    #[test]
    fn unregister_event_prunes_empty_groups() {
        let registry = EventRegistry::new();
        let groups: HashSet<EventgroupId> = [0x0001].into_iter().collect();
        registry.register_event(0x1234, 0x0001, 0x8001, &groups, false, true, 1, 3);

        registry.unregister_event(0x1234, 0x0001, 0x8001);
        assert!(registry
            .with_eventgroup(0x1234, 0x0001, 0x0001, |_| ())
            .is_none());
    }
}
