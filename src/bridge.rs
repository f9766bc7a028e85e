//! Discovery and polling state machine.
//!
//! The bridge identifies the appliance on the bus, probes the catalog's
//! common, energy and appliance-specific ERDs, keeps the ones that answer,
//! and then reads them round-robin forever. Everything runs on one thread:
//! the run loop feeds timer expiries, ERD client activity and gateway
//! events in, and each one is handled to completion before the next.
//!
//! States form a two-level hierarchy. Every working state is a child of
//! `Top`; a signal a child does not handle bubbles up to `Top`, which
//! forwards write requests and restarts discovery when the appliance goes
//! quiet.

use serde::Deserialize;

use crate::catalog::ErdCatalog;
use crate::erd::{Erd, RequestId, APPLIANCE_TYPE_ERD, BROADCAST_ADDRESS, POLLING_LIST_CAPACITY};
use crate::erd_client::{ErdClient, ErdClientActivity};
use crate::mqtt::{GatewayEvent, MqttGateway};
use crate::persistence;
use crate::polling::{DedupSet, PollingList, Push};
use crate::store::PersistentStore;
use crate::timer::{Ticks, TimerGroup};

#[derive(Debug, Clone, Deserialize)]
pub struct BridgeSettings {
    /// How long to wait for a read before moving on
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,
    /// Silence after which discovery starts over
    #[serde(default = "default_appliance_lost_timeout")]
    pub appliance_lost_timeout_ms: u64,
    #[serde(default = "default_polling_list_capacity")]
    pub polling_list_capacity: usize,
}

fn default_retry_delay() -> u64 {
    2000
}

fn default_appliance_lost_timeout() -> u64 {
    30000
}

fn default_polling_list_capacity() -> usize {
    POLLING_LIST_CAPACITY
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            retry_delay_ms: default_retry_delay(),
            appliance_lost_timeout_ms: default_appliance_lost_timeout(),
            polling_list_capacity: default_polling_list_capacity(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    Top,
    IdentifyAppliance,
    AddCommonErds,
    AddEnergyErds,
    AddApplianceErds,
    PollErdsFromList,
}

impl State {
    fn parent(self) -> Option<State> {
        match self {
            State::Top => None,
            _ => Some(State::Top),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerHandle {
    Retry,
    ApplianceLost,
}

#[derive(Debug, Clone, Copy)]
enum Signal<'a> {
    Entry,
    Exit,
    TimerExpired,
    ApplianceLost,
    ReadCompleted {
        request_id: RequestId,
        address: u8,
        erd: Erd,
        data: &'a [u8],
    },
    ReadFailed { erd: Erd, reason: u8 },
    WriteRequested { erd: Erd, value: &'a [u8] },
    MqttDisconnected,
}

enum Handled {
    Consumed,
    Deferred,
}

pub struct Bridge<C, G, S> {
    settings: BridgeSettings,
    catalog: ErdCatalog,
    erd_client: C,
    gateway: G,
    store: S,
    state: State,
    pending: Option<State>,
    /// Retry arming is tagged with the state that armed it
    timers: TimerGroup<TimerHandle, State>,
    request_id: RequestId,
    /// The one read the bus may be working on
    outstanding: Option<RequestId>,
    host_address: u8,
    appliance_type: u8,
    polling_list: PollingList,
    registered: DedupSet,
    candidates: Vec<Erd>,
    cursor: usize,
    poll_cursor: usize,
    last_polled_erd: Option<Erd>,
    /// Polling list changed since it was last saved
    dirty: bool,
}

impl<C, G, S> Bridge<C, G, S>
where
    C: ErdClient,
    G: MqttGateway,
    S: PersistentStore,
{
    /// Build the bridge and run the initial state's entry action. A cached
    /// polling list skips discovery entirely.
    pub fn new(settings: BridgeSettings, catalog: ErdCatalog, erd_client: C, gateway: G, store: S) -> Self {
        let capacity = settings.polling_list_capacity;
        let mut bridge = Self {
            settings,
            catalog,
            erd_client,
            gateway,
            store,
            state: State::Top,
            pending: None,
            timers: TimerGroup::new(),
            request_id: RequestId::default(),
            outstanding: None,
            host_address: BROADCAST_ADDRESS,
            appliance_type: 0,
            polling_list: PollingList::with_capacity(capacity),
            registered: DedupSet::new(),
            candidates: Vec::new(),
            cursor: 0,
            poll_cursor: 0,
            last_polled_erd: None,
            dirty: false,
        };

        let initial = match persistence::load(&mut bridge.store, capacity) {
            Some(cached) => {
                tracing::info!(
                    "Resuming with {} cached ERDs from host 0x{:02X}",
                    cached.erds.len(),
                    cached.host_address
                );
                bridge.polling_list.replace(&cached.erds);
                bridge.host_address = cached.host_address;
                State::PollErdsFromList
            }
            None => State::IdentifyAppliance,
        };
        bridge.transition(initial);
        bridge.process_transitions();
        bridge
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn host_address(&self) -> u8 {
        self.host_address
    }

    pub fn appliance_type(&self) -> u8 {
        self.appliance_type
    }

    pub fn polling_list(&self) -> &PollingList {
        &self.polling_list
    }

    pub fn last_polled_erd(&self) -> Option<Erd> {
        self.last_polled_erd
    }

    pub fn gateway(&self) -> &G {
        &self.gateway
    }

    pub fn next_deadline(&self) -> Option<Ticks> {
        self.timers.next_deadline()
    }

    /// Advance the clock to `now` and deliver every timer that fired.
    pub fn run_timers(&mut self, now: Ticks) {
        for expired in self.timers.run(now) {
            // Re-armed by an earlier expiry in this batch
            if self.timers.is_running(expired.handle) {
                continue;
            }
            match expired.handle {
                TimerHandle::Retry => {
                    if expired.tag == Some(self.state) {
                        self.dispatch(Signal::TimerExpired);
                    } else {
                        tracing::trace!("Dropping retry armed in {:?}", expired.tag);
                    }
                }
                TimerHandle::ApplianceLost => self.dispatch(Signal::ApplianceLost),
            }
        }
    }

    pub fn on_erd_activity(&mut self, activity: ErdClientActivity) {
        match activity {
            ErdClientActivity::ReadCompleted {
                request_id,
                address,
                erd,
                data,
            } => {
                self.dispatch(Signal::ReadCompleted {
                    request_id,
                    address,
                    erd,
                    data: &data,
                });
            }
            ErdClientActivity::ReadFailed {
                request_id,
                erd,
                reason,
            } => {
                tracing::trace!("Read request {} failed", request_id.0);
                self.dispatch(Signal::ReadFailed { erd, reason });
            }
            ErdClientActivity::WriteCompleted { request_id, erd } => {
                tracing::debug!("Write {} succeeded (request {})", erd, request_id.0);
                self.gateway.update_erd_write_result(erd, true, 0);
            }
            ErdClientActivity::WriteFailed {
                request_id,
                erd,
                reason,
            } => {
                tracing::warn!("Write {} failed (request {}, reason {})", erd, request_id.0, reason);
                self.gateway.update_erd_write_result(erd, false, reason);
            }
        }
    }

    pub fn on_gateway_event(&mut self, event: GatewayEvent) {
        match event {
            GatewayEvent::WriteRequest { erd, value } => {
                self.dispatch(Signal::WriteRequested { erd, value: &value });
            }
            GatewayEvent::Disconnected => {
                self.registered.clear();
                self.dispatch(Signal::MqttDisconnected);
            }
        }
    }

    fn dispatch(&mut self, signal: Signal<'_>) {
        let mut current = Some(self.state);
        while let Some(state) = current {
            match self.handle(state, signal) {
                Handled::Consumed => break,
                Handled::Deferred => current = state.parent(),
            }
        }
        self.process_transitions();
    }

    fn transition(&mut self, target: State) {
        self.pending = Some(target);
    }

    /// Entry actions may transition again, so keep going until things settle.
    fn process_transitions(&mut self) {
        while let Some(target) = self.pending.take() {
            if self.state != State::Top {
                self.handle(self.state, Signal::Exit);
            }
            tracing::debug!("{:?} -> {:?}", self.state, target);
            self.state = target;
            self.handle(target, Signal::Entry);
        }
    }

    fn handle(&mut self, state: State, signal: Signal<'_>) -> Handled {
        match state {
            State::Top => self.top(signal),
            State::IdentifyAppliance => self.identify_appliance(signal),
            State::AddCommonErds | State::AddEnergyErds | State::AddApplianceErds => {
                self.add_erds(state, signal)
            }
            State::PollErdsFromList => self.poll_erds_from_list(signal),
        }
    }

    fn top(&mut self, signal: Signal<'_>) -> Handled {
        match signal {
            Signal::WriteRequested { erd, value } => {
                self.request_id = self.request_id.next();
                tracing::info!("Writing {} to host 0x{:02X}", erd, self.host_address);
                if !self.erd_client.write(self.request_id, self.host_address, erd, value) {
                    tracing::warn!("ERD client refused write of {}", erd);
                }
            }
            Signal::ApplianceLost => {
                tracing::warn!("Appliance lost, restarting discovery");
                persistence::clear(&mut self.store);
                self.transition(State::IdentifyAppliance);
            }
            Signal::ReadFailed { erd, reason } => {
                tracing::debug!("Read {} failed (reason {})", erd, reason);
            }
            _ => {}
        }
        Handled::Consumed
    }

    fn identify_appliance(&mut self, signal: Signal<'_>) -> Handled {
        match signal {
            Signal::Entry => {
                tracing::info!("Identifying appliance");
                self.host_address = BROADCAST_ADDRESS;
                self.timers.stop(TimerHandle::Retry);
                self.timers.stop(TimerHandle::ApplianceLost);
                self.request_read(APPLIANCE_TYPE_ERD);
                Handled::Consumed
            }
            Signal::TimerExpired => {
                tracing::debug!("No answer to identification, retrying");
                self.request_read(APPLIANCE_TYPE_ERD);
                Handled::Consumed
            }
            Signal::ReadCompleted {
                request_id,
                address,
                erd,
                data,
            } => {
                if erd != APPLIANCE_TYPE_ERD || !self.take_outstanding(request_id) {
                    return Handled::Consumed;
                }
                self.timers.stop(TimerHandle::Retry);
                self.reset_lost_timer();
                self.host_address = address;
                let raw = data.first().copied().unwrap_or(0);
                self.appliance_type = self.catalog.clamp_appliance_type(raw);
                tracing::info!(
                    "Found {} (type {}) at 0x{:02X}",
                    self.catalog.appliance_name(self.appliance_type),
                    raw,
                    address
                );
                self.transition(State::AddCommonErds);
                Handled::Consumed
            }
            Signal::Exit => {
                self.timers.stop(TimerHandle::Retry);
                Handled::Consumed
            }
            _ => Handled::Deferred,
        }
    }

    fn add_erds(&mut self, state: State, signal: Signal<'_>) -> Handled {
        match signal {
            Signal::Entry => {
                self.candidates = match state {
                    State::AddCommonErds => {
                        self.polling_list.clear();
                        self.poll_cursor = 0;
                        self.catalog.common().to_vec()
                    }
                    State::AddEnergyErds => self.catalog.energy().to_vec(),
                    _ => self.catalog.appliance_erds(self.appliance_type).to_vec(),
                };
                self.cursor = 0;
                tracing::info!("{:?}: probing {} ERDs", state, self.candidates.len());
                self.read_candidate(state);
                Handled::Consumed
            }
            Signal::ReadCompleted {
                request_id, erd, data, ..
            } => {
                if self.candidates.get(self.cursor) == Some(&erd) && self.take_outstanding(request_id) {
                    self.timers.stop(TimerHandle::Retry);
                    tracing::debug!("{} answered", erd);
                    self.add_to_polling_list(erd);
                    self.gateway.update_erd(erd, data);
                    self.next_candidate(state);
                }
                Handled::Consumed
            }
            Signal::TimerExpired => {
                if let Some(erd) = self.candidates.get(self.cursor) {
                    tracing::debug!("{} did not answer, skipping", erd);
                }
                self.next_candidate(state);
                Handled::Consumed
            }
            _ => Handled::Deferred,
        }
    }

    fn poll_erds_from_list(&mut self, signal: Signal<'_>) -> Handled {
        match signal {
            Signal::Entry => {
                self.reset_lost_timer();
                let erds: Vec<Erd> = self.polling_list.iter().collect();
                for erd in erds {
                    self.register(erd);
                }
                if self.dirty {
                    self.save_polling_list();
                }
                if self.poll_cursor >= self.polling_list.len() {
                    self.poll_cursor = 0;
                }
                match self.polling_list.get(self.poll_cursor) {
                    Some(erd) => {
                        tracing::info!("Polling {} ERDs", self.polling_list.len());
                        self.request_read(erd);
                    }
                    None => tracing::warn!("Polling list is empty, waiting for the appliance to drop"),
                }
                Handled::Consumed
            }
            Signal::ReadCompleted {
                request_id, erd, data, ..
            } => {
                if self.polling_list.get(self.poll_cursor) == Some(erd) && self.take_outstanding(request_id) {
                    self.timers.stop(TimerHandle::Retry);
                    self.reset_lost_timer();
                    self.gateway.update_erd(erd, data);
                    self.last_polled_erd = Some(erd);
                    self.poll_next();
                }
                Handled::Consumed
            }
            Signal::TimerExpired => {
                self.poll_next();
                Handled::Consumed
            }
            Signal::MqttDisconnected => {
                match persistence::load(&mut self.store, self.settings.polling_list_capacity) {
                    Some(cached) => {
                        tracing::info!("MQTT reconnected, resuming polling");
                        self.polling_list.replace(&cached.erds);
                        self.host_address = cached.host_address;
                        self.transition(State::PollErdsFromList);
                    }
                    None => {
                        tracing::info!("MQTT reconnected with nothing cached, rediscovering");
                        self.transition(State::IdentifyAppliance);
                    }
                }
                Handled::Consumed
            }
            Signal::Exit => {
                self.timers.stop(TimerHandle::Retry);
                Handled::Consumed
            }
            _ => Handled::Deferred,
        }
    }

    fn read_candidate(&mut self, state: State) {
        match self.candidates.get(self.cursor).copied() {
            Some(erd) => self.request_read(erd),
            None => self.finish_phase(state),
        }
    }

    fn next_candidate(&mut self, state: State) {
        self.cursor += 1;
        self.reset_lost_timer();
        self.read_candidate(state);
    }

    fn finish_phase(&mut self, state: State) {
        let next = match state {
            State::AddCommonErds => State::AddEnergyErds,
            State::AddEnergyErds => State::AddApplianceErds,
            _ => {
                tracing::info!("Discovery done, {} ERDs answered", self.polling_list.len());
                self.save_polling_list();
                State::PollErdsFromList
            }
        };
        self.transition(next);
    }

    fn poll_next(&mut self) {
        if self.polling_list.is_empty() {
            return;
        }
        self.poll_cursor = (self.poll_cursor + 1) % self.polling_list.len();
        if let Some(erd) = self.polling_list.get(self.poll_cursor) {
            self.request_read(erd);
        }
    }

    /// At most one read is outstanding: the retry timer is re-armed with every request.
    fn request_read(&mut self, erd: Erd) {
        self.timers.stop(TimerHandle::Retry);
        self.request_id = self.request_id.next();
        self.outstanding = Some(self.request_id);
        tracing::trace!("Reading {} from 0x{:02X}", erd, self.host_address);
        if !self.erd_client.read(self.request_id, self.host_address, erd) {
            tracing::warn!("ERD client refused read of {}", erd);
        }
        self.timers
            .start(TimerHandle::Retry, self.settings.retry_delay_ms, Some(self.state));
    }

    /// True if `request_id` answers the read in flight, which is then settled.
    fn take_outstanding(&mut self, request_id: RequestId) -> bool {
        if self.outstanding == Some(request_id) {
            self.outstanding = None;
            true
        } else {
            tracing::debug!("Dropping late answer to request {}", request_id.0);
            false
        }
    }

    fn reset_lost_timer(&mut self) {
        self.timers
            .start(TimerHandle::ApplianceLost, self.settings.appliance_lost_timeout_ms, None);
    }

    fn register(&mut self, erd: Erd) {
        if self.registered.insert(erd) {
            self.gateway.register_erd(erd);
        }
    }

    fn add_to_polling_list(&mut self, erd: Erd) {
        self.register(erd);
        match self.polling_list.push(erd) {
            Ok(Push::Added) => self.dirty = true,
            Ok(Push::AlreadyPresent) => {}
            Err(e) => tracing::error!("{}", e),
        }
    }

    fn save_polling_list(&mut self) {
        persistence::save(&mut self.store, self.polling_list.as_slice(), self.host_address);
        self.dirty = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ApplianceEntry;
    use crate::store::MemoryStore;

    const APPLIANCE: u8 = 0xC0;

    #[derive(Default)]
    struct RecordingClient {
        reads: Vec<(RequestId, u8, Erd)>,
        writes: Vec<(u8, Erd, Vec<u8>)>,
    }

    impl ErdClient for RecordingClient {
        fn read(&mut self, request_id: RequestId, address: u8, erd: Erd) -> bool {
            self.reads.push((request_id, address, erd));
            true
        }

        fn write(&mut self, _request_id: RequestId, address: u8, erd: Erd, value: &[u8]) -> bool {
            self.writes.push((address, erd, value.to_vec()));
            true
        }
    }

    #[derive(Default)]
    struct RecordingGateway {
        registered: Vec<Erd>,
        updates: Vec<(Erd, Vec<u8>)>,
        write_results: Vec<(Erd, bool, u8)>,
    }

    impl MqttGateway for RecordingGateway {
        fn register_erd(&mut self, erd: Erd) {
            self.registered.push(erd);
        }

        fn update_erd(&mut self, erd: Erd, data: &[u8]) {
            self.updates.push((erd, data.to_vec()));
        }

        fn update_erd_write_result(&mut self, erd: Erd, success: bool, reason: u8) {
            self.write_results.push((erd, success, reason));
        }
    }

    type TestBridge = Bridge<RecordingClient, RecordingGateway, MemoryStore>;

    fn catalog(energy: &[u16]) -> ErdCatalog {
        ErdCatalog::new(
            vec![Erd(0x10), Erd(0x11)],
            energy.iter().copied().map(Erd).collect(),
            vec![ApplianceEntry {
                name: "generic".to_string(),
                erds: vec![Erd(0x20)],
            }],
        )
    }

    fn make_bridge(catalog: ErdCatalog, store: MemoryStore) -> TestBridge {
        Bridge::new(
            BridgeSettings::default(),
            catalog,
            RecordingClient::default(),
            RecordingGateway::default(),
            store,
        )
    }

    fn last_read(bridge: &TestBridge) -> (u8, Erd) {
        let (_, address, erd) = *bridge.erd_client.reads.last().unwrap();
        (address, erd)
    }

    fn read_count(bridge: &TestBridge) -> usize {
        bridge.erd_client.reads.len()
    }

    fn answer(bridge: &mut TestBridge, erd: u16, data: &[u8]) {
        let (request_id, _, _) = *bridge.erd_client.reads.last().unwrap();
        answer_request(bridge, request_id, erd, data);
    }

    fn answer_request(bridge: &mut TestBridge, request_id: RequestId, erd: u16, data: &[u8]) {
        bridge.on_erd_activity(ErdClientActivity::ReadCompleted {
            request_id,
            address: APPLIANCE,
            erd: Erd(erd),
            data: data.to_vec(),
        });
    }

    fn elapse(bridge: &mut TestBridge, ms: u64) {
        let now = bridge.timers.now() + ms;
        bridge.run_timers(now);
    }

    fn persisted_store(erds: &[u16]) -> MemoryStore {
        let mut store = MemoryStore::new();
        let erds: Vec<Erd> = erds.iter().copied().map(Erd).collect();
        persistence::save(&mut store, &erds, APPLIANCE);
        store
    }

    /// Identify, then discover with 0x10 timing out.
    fn discovered_bridge() -> TestBridge {
        let mut bridge = make_bridge(catalog(&[]), MemoryStore::new());
        answer(&mut bridge, 0x0008, &[0]);
        elapse(&mut bridge, 2000);
        answer(&mut bridge, 0x11, &[0xAA]);
        answer(&mut bridge, 0x20, &[0xBB]);
        bridge
    }

    #[test]
    fn test_starts_by_identifying_over_broadcast() {
        let bridge = make_bridge(catalog(&[]), MemoryStore::new());
        assert_eq!(bridge.state(), State::IdentifyAppliance);
        assert_eq!(bridge.host_address(), BROADCAST_ADDRESS);
        assert_eq!(last_read(&bridge), (BROADCAST_ADDRESS, APPLIANCE_TYPE_ERD));
        assert_eq!(read_count(&bridge), 1);
    }

    #[test]
    fn test_identification_retries_forever() {
        let mut bridge = make_bridge(catalog(&[]), MemoryStore::new());
        for _ in 0..20 {
            elapse(&mut bridge, 2000);
        }
        assert_eq!(bridge.state(), State::IdentifyAppliance);
        assert_eq!(read_count(&bridge), 21);
        assert!(bridge
            .erd_client
            .reads
            .iter()
            .all(|(_, address, erd)| *address == BROADCAST_ADDRESS && *erd == APPLIANCE_TYPE_ERD));
    }

    #[test]
    fn test_identification_ignores_other_erds() {
        let mut bridge = make_bridge(catalog(&[]), MemoryStore::new());
        answer(&mut bridge, 0x0011, &[1]);
        assert_eq!(bridge.state(), State::IdentifyAppliance);
        assert_eq!(bridge.host_address(), BROADCAST_ADDRESS);
    }

    #[test]
    fn test_identification_pins_host_and_clamps_type() {
        let mut bridge = make_bridge(catalog(&[]), MemoryStore::new());
        answer(&mut bridge, 0x0008, &[42]);
        assert_eq!(bridge.state(), State::AddCommonErds);
        assert_eq!(bridge.host_address(), APPLIANCE);
        assert_eq!(bridge.appliance_type(), 0);
        assert_eq!(last_read(&bridge), (APPLIANCE, Erd(0x10)));
    }

    #[test]
    fn test_discovery_skips_silent_erds() {
        let mut bridge = make_bridge(catalog(&[]), MemoryStore::new());
        answer(&mut bridge, 0x0008, &[0]);

        elapse(&mut bridge, 1999);
        assert_eq!(last_read(&bridge), (APPLIANCE, Erd(0x10)));
        elapse(&mut bridge, 1);
        assert_eq!(last_read(&bridge), (APPLIANCE, Erd(0x11)));

        answer(&mut bridge, 0x11, &[0xAA]);
        // Energy list is empty, so discovery moves straight to the appliance list
        assert_eq!(bridge.state(), State::AddApplianceErds);
        assert_eq!(last_read(&bridge), (APPLIANCE, Erd(0x20)));

        answer(&mut bridge, 0x20, &[0xBB]);
        assert_eq!(bridge.state(), State::PollErdsFromList);
        assert_eq!(bridge.polling_list().as_slice(), &[Erd(0x11), Erd(0x20)]);
        assert_eq!(bridge.gateway().registered, vec![Erd(0x11), Erd(0x20)]);
        assert_eq!(
            bridge.gateway().updates,
            vec![(Erd(0x11), vec![0xAA]), (Erd(0x20), vec![0xBB])]
        );
    }

    #[test]
    fn test_discovery_persists_list_and_host() {
        let mut bridge = discovered_bridge();
        let cached = persistence::load(&mut bridge.store, 256).unwrap();
        assert_eq!(cached.erds, vec![Erd(0x11), Erd(0x20)]);
        assert_eq!(cached.host_address, APPLIANCE);
    }

    #[test]
    fn test_phases_run_in_order() {
        let mut bridge = make_bridge(catalog(&[0x15]), MemoryStore::new());
        answer(&mut bridge, 0x0008, &[0]);
        assert_eq!(bridge.state(), State::AddCommonErds);
        answer(&mut bridge, 0x10, &[1]);
        answer(&mut bridge, 0x11, &[1]);
        assert_eq!(bridge.state(), State::AddEnergyErds);
        assert_eq!(last_read(&bridge), (APPLIANCE, Erd(0x15)));
        answer(&mut bridge, 0x15, &[1]);
        assert_eq!(bridge.state(), State::AddApplianceErds);
        answer(&mut bridge, 0x20, &[1]);
        assert_eq!(bridge.state(), State::PollErdsFromList);
        assert_eq!(
            bridge.polling_list().as_slice(),
            &[Erd(0x10), Erd(0x11), Erd(0x15), Erd(0x20)]
        );
    }

    #[test]
    fn test_stale_answers_are_ignored() {
        let mut bridge = make_bridge(catalog(&[]), MemoryStore::new());
        answer(&mut bridge, 0x0008, &[0]);
        answer(&mut bridge, 0x20, &[1]);
        assert_eq!(bridge.state(), State::AddCommonErds);
        assert!(bridge.polling_list().is_empty());
        assert_eq!(read_count(&bridge), 2);
    }

    #[test]
    fn test_late_identification_answer_is_ignored() {
        let mut bridge = make_bridge(catalog(&[]), MemoryStore::new());
        let (first, _, _) = bridge.erd_client.reads[0];
        elapse(&mut bridge, 2000);
        assert_eq!(read_count(&bridge), 2);

        // The first broadcast answers after its retry went out
        answer_request(&mut bridge, first, 0x0008, &[0]);
        assert_eq!(bridge.state(), State::IdentifyAppliance);
        assert_eq!(bridge.host_address(), BROADCAST_ADDRESS);
        assert_eq!(read_count(&bridge), 2);

        answer(&mut bridge, 0x0008, &[0]);
        assert_eq!(bridge.state(), State::AddCommonErds);
    }

    #[test]
    fn test_late_answer_on_single_erd_list_is_ignored() {
        let mut bridge = make_bridge(catalog(&[]), persisted_store(&[0x11]));
        let (first, _, _) = bridge.erd_client.reads[0];
        elapse(&mut bridge, 2000);
        assert_eq!(read_count(&bridge), 2);
        assert_eq!(last_read(&bridge), (APPLIANCE, Erd(0x11)));

        answer_request(&mut bridge, first, 0x11, &[1]);
        assert_eq!(read_count(&bridge), 2);
        assert_eq!(bridge.last_polled_erd(), None);
        assert!(bridge.gateway().updates.is_empty());

        // The current request still completes normally, once
        answer(&mut bridge, 0x11, &[2]);
        assert_eq!(read_count(&bridge), 3);
        let (second, _, _) = bridge.erd_client.reads[1];
        answer_request(&mut bridge, second, 0x11, &[2]);
        assert_eq!(read_count(&bridge), 3);
        assert_eq!(bridge.gateway().updates, vec![(Erd(0x11), vec![2])]);
    }

    #[test]
    fn test_late_answer_during_discovery_is_ignored() {
        let mut bridge = make_bridge(catalog(&[]), MemoryStore::new());
        answer(&mut bridge, 0x0008, &[0]);
        let (first, _, _) = *bridge.erd_client.reads.last().unwrap();
        elapse(&mut bridge, 2000);
        // 0x10 was skipped; its late answer must not count for 0x11 or for 0x10
        answer_request(&mut bridge, first, 0x10, &[1]);
        answer_request(&mut bridge, first, 0x11, &[1]);
        assert_eq!(bridge.state(), State::AddCommonErds);
        assert!(bridge.polling_list().is_empty());
        assert_eq!(read_count(&bridge), 3);
    }

    #[test]
    fn test_polling_round_robin() {
        let mut bridge = discovered_bridge();
        assert_eq!(last_read(&bridge), (APPLIANCE, Erd(0x11)));
        answer(&mut bridge, 0x11, &[1]);
        assert_eq!(last_read(&bridge), (APPLIANCE, Erd(0x20)));
        assert_eq!(bridge.last_polled_erd(), Some(Erd(0x11)));
        answer(&mut bridge, 0x20, &[2]);
        assert_eq!(last_read(&bridge), (APPLIANCE, Erd(0x11)));
        assert_eq!(bridge.last_polled_erd(), Some(Erd(0x20)));
        // Registration happened once per ERD
        assert_eq!(bridge.gateway().registered, vec![Erd(0x11), Erd(0x20)]);
    }

    #[test]
    fn test_polling_moves_on_after_timeout() {
        let mut bridge = discovered_bridge();
        let before = read_count(&bridge);
        elapse(&mut bridge, 2000);
        assert_eq!(read_count(&bridge), before + 1);
        assert_eq!(last_read(&bridge), (APPLIANCE, Erd(0x20)));
        assert_eq!(bridge.last_polled_erd(), None);
    }

    #[test]
    fn test_one_read_outstanding() {
        let mut bridge = discovered_bridge();
        let before = read_count(&bridge);
        // Unrelated traffic never issues a read
        answer(&mut bridge, 0x99, &[0]);
        bridge.on_erd_activity(ErdClientActivity::ReadFailed {
            request_id: RequestId(1),
            erd: Erd(0x11),
            reason: 2,
        });
        bridge.on_gateway_event(GatewayEvent::WriteRequest {
            erd: Erd(0x30),
            value: vec![1],
        });
        assert_eq!(read_count(&bridge), before);
        assert_eq!(bridge.state(), State::PollErdsFromList);
    }

    #[test]
    fn test_write_during_discovery_is_forwarded() {
        let mut bridge = make_bridge(catalog(&[0x15]), MemoryStore::new());
        answer(&mut bridge, 0x0008, &[0]);
        answer(&mut bridge, 0x10, &[1]);
        answer(&mut bridge, 0x11, &[1]);
        assert_eq!(bridge.state(), State::AddEnergyErds);
        let before = read_count(&bridge);

        bridge.on_gateway_event(GatewayEvent::WriteRequest {
            erd: Erd(0x30),
            value: vec![0x01, 0x02],
        });
        assert_eq!(bridge.erd_client.writes, vec![(APPLIANCE, Erd(0x30), vec![0x01, 0x02])]);
        assert_eq!(bridge.state(), State::AddEnergyErds);
        assert_eq!(read_count(&bridge), before);

        // Discovery carries on from where it was
        answer(&mut bridge, 0x15, &[1]);
        assert_eq!(bridge.state(), State::AddApplianceErds);
    }

    #[test]
    fn test_write_results_reach_gateway() {
        let mut bridge = discovered_bridge();
        bridge.on_erd_activity(ErdClientActivity::WriteCompleted {
            request_id: RequestId(3),
            erd: Erd(0x30),
        });
        bridge.on_erd_activity(ErdClientActivity::WriteFailed {
            request_id: RequestId(4),
            erd: Erd(0x31),
            reason: 5,
        });
        assert_eq!(
            bridge.gateway().write_results,
            vec![(Erd(0x30), true, 0), (Erd(0x31), false, 5)]
        );
    }

    #[test]
    fn test_request_ids_increase() {
        let bridge = discovered_bridge();
        let ids: Vec<u8> = bridge.erd_client.reads.iter().map(|(id, _, _)| id.0).collect();
        assert!(ids.windows(2).all(|pair| pair[1] == pair[0].wrapping_add(1)));
    }

    #[test]
    fn test_resume_from_cache() {
        let bridge = make_bridge(catalog(&[]), persisted_store(&[0x11, 0x20]));
        assert_eq!(bridge.state(), State::PollErdsFromList);
        assert_eq!(bridge.host_address(), APPLIANCE);
        assert_eq!(read_count(&bridge), 1);
        assert_eq!(last_read(&bridge), (APPLIANCE, Erd(0x11)));
        // Cached ERDs are registered before the first value is pushed
        assert_eq!(bridge.gateway().registered, vec![Erd(0x11), Erd(0x20)]);
        assert!(bridge.gateway().updates.is_empty());
    }

    #[test]
    fn test_disconnect_with_cache_resumes_polling() {
        let mut bridge = discovered_bridge();
        answer(&mut bridge, 0x11, &[1]);
        bridge.on_gateway_event(GatewayEvent::Disconnected);
        assert_eq!(bridge.state(), State::PollErdsFromList);
        assert_eq!(
            bridge.gateway().registered,
            vec![Erd(0x11), Erd(0x20), Erd(0x11), Erd(0x20)]
        );
        // Polling picks up at the same position
        assert_eq!(last_read(&bridge), (APPLIANCE, Erd(0x20)));
    }

    #[test]
    fn test_disconnect_without_cache_rediscovers() {
        let mut bridge = discovered_bridge();
        bridge.store.set_available(false);
        bridge.on_gateway_event(GatewayEvent::Disconnected);
        assert_eq!(bridge.state(), State::IdentifyAppliance);
        assert_eq!(bridge.host_address(), BROADCAST_ADDRESS);
        assert_eq!(last_read(&bridge), (BROADCAST_ADDRESS, APPLIANCE_TYPE_ERD));
    }

    #[test]
    fn test_disconnect_during_discovery_replays_registrations() {
        let mut bridge = make_bridge(catalog(&[]), MemoryStore::new());
        answer(&mut bridge, 0x0008, &[0]);
        answer(&mut bridge, 0x10, &[1]);
        bridge.on_gateway_event(GatewayEvent::Disconnected);
        assert_eq!(bridge.state(), State::AddCommonErds);
        answer(&mut bridge, 0x11, &[1]);
        answer(&mut bridge, 0x20, &[1]);
        assert_eq!(bridge.state(), State::PollErdsFromList);
        assert_eq!(
            bridge.gateway().registered,
            vec![Erd(0x10), Erd(0x11), Erd(0x20), Erd(0x10)]
        );
    }

    #[test]
    fn test_appliance_lost_restarts_discovery() {
        let mut bridge = discovered_bridge();
        for _ in 0..14 {
            elapse(&mut bridge, 2000);
        }
        assert_eq!(bridge.state(), State::PollErdsFromList);
        elapse(&mut bridge, 2000);
        assert_eq!(bridge.state(), State::IdentifyAppliance);
        assert_eq!(bridge.host_address(), BROADCAST_ADDRESS);
        assert_eq!(last_read(&bridge), (BROADCAST_ADDRESS, APPLIANCE_TYPE_ERD));
        assert!(persistence::load(&mut bridge.store, 256).is_none());
    }

    #[test]
    fn test_successful_reads_hold_off_lost_timer() {
        let mut bridge = discovered_bridge();
        for _ in 0..30 {
            elapse(&mut bridge, 1500);
            let (_, erd) = last_read(&bridge);
            answer(&mut bridge, erd.value(), &[0]);
        }
        assert_eq!(bridge.state(), State::PollErdsFromList);
    }

    #[test]
    fn test_stale_retry_is_ignored() {
        let mut bridge = discovered_bridge();
        let before = read_count(&bridge);
        bridge
            .timers
            .start(TimerHandle::Retry, 10, Some(State::AddCommonErds));
        elapse(&mut bridge, 10);
        assert_eq!(read_count(&bridge), before);
        assert_eq!(bridge.state(), State::PollErdsFromList);
    }

    #[test]
    fn test_empty_catalog_idles_until_lost() {
        let empty = ErdCatalog::new(
            vec![],
            vec![],
            vec![ApplianceEntry {
                name: "generic".to_string(),
                erds: vec![],
            }],
        );
        let mut bridge = make_bridge(empty, MemoryStore::new());
        answer(&mut bridge, 0x0008, &[0]);
        assert_eq!(bridge.state(), State::PollErdsFromList);
        assert_eq!(read_count(&bridge), 1);

        elapse(&mut bridge, 30000);
        assert_eq!(bridge.state(), State::IdentifyAppliance);
        assert_eq!(read_count(&bridge), 2);
    }
}
