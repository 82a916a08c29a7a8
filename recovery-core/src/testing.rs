//! In-memory doubles for the driver traits.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::config::{AccessPointConfig, SessionPolicy, StoreKeys, UpdatePolicy};
use crate::deferred::{Restart, RestartScheduler};
use crate::http::RecoveryService;
use crate::network::{LinkMonitor, Radio, RadioError, RadioEvent, Reaction};
use crate::session::{Clock, Entropy, SessionAuthority};
use crate::settings::{MountError, SettingsStore, StorageMedium, StoreError, WifiCredentials};
use crate::update::{ByteSource, DriverError, FirmwareSlots, ReadError, SlotInfo, SlotWriter, UpdateEngine};

pub const DEFAULT_MASTER: &str = "recovery-test";

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

// ---------------------------------------------------------------- storage

#[derive(Default)]
struct MediumState {
    values: HashMap<String, String>,
    mounts: VecDeque<Result<(), MountError>>,
    mount_count: usize,
    erase_count: usize,
    fail_writes: bool,
    fail_write_at: Option<usize>,
    fail_reads: bool,
}

#[derive(Clone, Default)]
pub struct MemoryMedium {
    state: Arc<Mutex<MediumState>>,
}

impl MemoryMedium {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: &str, value: &str) {
        lock(&self.state).values.insert(key.to_string(), value.to_string());
    }

    pub fn get(&self, key: &str) -> Option<String> {
        lock(&self.state).values.get(key).cloned()
    }

    /// Results for the next mount calls; afterwards mounts succeed.
    pub fn script_mounts(&self, results: &[Result<(), MountError>]) {
        lock(&self.state).mounts = results.iter().copied().collect();
    }

    pub fn erase_count(&self) -> usize {
        lock(&self.state).erase_count
    }

    pub fn mount_count(&self) -> usize {
        lock(&self.state).mount_count
    }

    pub fn fail_writes(&self, fail: bool) {
        lock(&self.state).fail_writes = fail;
    }

    /// The next write applies entries before `index`, then fails on it.
    pub fn fail_write_at(&self, index: usize) {
        lock(&self.state).fail_write_at = Some(index);
    }

    pub fn fail_reads(&self, fail: bool) {
        lock(&self.state).fail_reads = fail;
    }
}

impl StorageMedium for MemoryMedium {
    fn mount(&self) -> Result<(), MountError> {
        let mut state = lock(&self.state);
        state.mount_count += 1;
        state.mounts.pop_front().unwrap_or(Ok(()))
    }

    fn erase(&self) -> Result<(), StoreError> {
        let mut state = lock(&self.state);
        state.erase_count += 1;
        state.values.clear();
        Ok(())
    }

    fn read(&self, key: &str, buf: &mut [u8]) -> Result<Option<usize>, StoreError> {
        let state = lock(&self.state);
        if state.fail_reads {
            return Err(StoreError::Driver(-1));
        }
        let Some(value) = state.values.get(key) else {
            return Ok(None);
        };
        if value.len() > buf.len() {
            return Err(StoreError::InvalidLength);
        }
        buf[..value.len()].copy_from_slice(value.as_bytes());
        Ok(Some(value.len()))
    }

    fn write(&self, entries: &[(&str, &str)]) -> Result<(), StoreError> {
        let mut state = lock(&self.state);
        if state.fail_writes {
            return Err(StoreError::Driver(-1));
        }
        let fail_at = state.fail_write_at.take();
        for (index, (key, value)) in entries.iter().enumerate() {
            if fail_at == Some(index) {
                return Err(StoreError::Driver(-1));
            }
            state.values.insert(key.to_string(), value.to_string());
        }
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        lock(&self.state).values.remove(key);
        Ok(())
    }
}

pub fn store_with(medium: MemoryMedium) -> SettingsStore<MemoryMedium> {
    SettingsStore::new(medium, StoreKeys::default(), DEFAULT_MASTER).unwrap()
}

// ---------------------------------------------------------------- session

#[derive(Clone, Default)]
pub struct ManualClock {
    now: Arc<Mutex<Duration>>,
}

impl ManualClock {
    pub fn starting_at(now: Duration) -> Self {
        Self {
            now: Arc::new(Mutex::new(now)),
        }
    }

    pub fn advance(&self, by: Duration) {
        *lock(&self.now) += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        *lock(&self.now)
    }
}

/// Deterministic splitmix64 stream; every call yields fresh bytes.
#[derive(Default)]
pub struct CountingEntropy {
    state: Mutex<u64>,
}

impl CountingEntropy {
    pub fn starting_at(seed: u8) -> Self {
        Self {
            state: Mutex::new(seed as u64),
        }
    }
}

impl Entropy for CountingEntropy {
    fn fill_bytes(&self, buf: &mut [u8]) {
        let mut state = lock(&self.state);
        for chunk in buf.chunks_mut(8) {
            *state = state.wrapping_add(0x9e37_79b9_7f4a_7c15);
            let mut z = *state;
            z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
            z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
            z ^= z >> 31;
            chunk.copy_from_slice(&z.to_le_bytes()[..chunk.len()]);
        }
    }
}

pub fn authority_with(medium: MemoryMedium) -> (SessionAuthority<MemoryMedium, ManualClock, CountingEntropy>, ManualClock) {
    let clock = ManualClock::default();
    let policy = SessionPolicy {
        failure_delay: Duration::from_millis(20),
        ..SessionPolicy::default()
    };
    let authority = SessionAuthority::new(
        Arc::new(store_with(medium)),
        clock.clone(),
        CountingEntropy::default(),
        policy,
    );
    (authority, clock)
}

// ---------------------------------------------------------------- radio

#[derive(Default)]
struct RadioState {
    events: Vec<RadioEvent>,
    ops: Vec<&'static str>,
    fail_on: Vec<&'static str>,
    monitor: Option<Arc<LinkMonitor>>,
    subscriptions: usize,
    connect_calls: usize,
    configured_ssid: Option<String>,
    access_point: Option<AccessPointConfig>,
}

/// Delivers a fixed list of events synchronously from `start`.
#[derive(Clone, Default)]
pub struct ScriptedRadio {
    state: Arc<Mutex<RadioState>>,
}

pub struct ScriptedSubscription {
    state: Arc<Mutex<RadioState>>,
}

impl Drop for ScriptedSubscription {
    fn drop(&mut self) {
        let mut state = lock(&self.state);
        state.monitor = None;
        state.subscriptions -= 1;
    }
}

impl ScriptedRadio {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_events(events: &[RadioEvent]) -> Self {
        let radio = Self::new();
        radio.script(events);
        radio
    }

    /// Replaces the events delivered by the next `start`.
    pub fn script(&self, events: &[RadioEvent]) {
        lock(&self.state).events = events.to_vec();
    }

    pub fn fail_on(&self, op: &'static str) {
        lock(&self.state).fail_on.push(op);
    }

    pub fn ops(&self) -> Vec<&'static str> {
        lock(&self.state).ops.clone()
    }

    pub fn connect_calls(&self) -> usize {
        lock(&self.state).connect_calls
    }

    pub fn active_subscriptions(&self) -> usize {
        lock(&self.state).subscriptions
    }

    pub fn configured_ssid(&self) -> Option<String> {
        lock(&self.state).configured_ssid.clone()
    }

    pub fn access_point(&self) -> Option<AccessPointConfig> {
        lock(&self.state).access_point.clone()
    }

    fn record(&self, op: &'static str) -> Result<MutexGuard<'_, RadioState>, RadioError> {
        let mut state = lock(&self.state);
        state.ops.push(op);
        if state.fail_on.contains(&op) {
            return Err(RadioError::new(op, -1));
        }
        Ok(state)
    }
}

impl Radio for ScriptedRadio {
    type Subscription = ScriptedSubscription;

    fn init(&mut self) -> Result<(), RadioError> {
        self.record("init").map(drop)
    }

    fn subscribe(&mut self, monitor: Arc<LinkMonitor>) -> Result<Self::Subscription, RadioError> {
        let mut state = self.record("subscribe")?;
        state.monitor = Some(monitor);
        state.subscriptions += 1;
        Ok(ScriptedSubscription {
            state: Arc::clone(&self.state),
        })
    }

    fn configure_station(&mut self, creds: &WifiCredentials) -> Result<(), RadioError> {
        let mut state = self.record("configure_station")?;
        state.configured_ssid = Some(creds.ssid.to_string());
        Ok(())
    }

    fn start(&mut self) -> Result<(), RadioError> {
        let (monitor, events) = {
            let state = self.record("start")?;
            (state.monitor.clone(), state.events.clone())
        };
        let Some(monitor) = monitor else {
            return Ok(());
        };
        let connects = events
            .into_iter()
            .filter(|event| monitor.handle(*event) == Reaction::Connect)
            .count();
        lock(&self.state).connect_calls += connects;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), RadioError> {
        self.record("stop").map(drop)
    }

    fn start_access_point(&mut self, ap: &AccessPointConfig) -> Result<(), RadioError> {
        let mut state = self.record("start_access_point")?;
        state.access_point = Some(ap.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------- slots

const DEFAULT_SLOT_CAPACITY: u64 = 0x18_0000;

struct SlotState {
    boot: String,
    inactive: Option<SlotInfo>,
    images: HashMap<String, Vec<u8>>,
    begins: usize,
    finishes: usize,
    aborts: usize,
    writes: usize,
    fail_begin: bool,
    fail_write_after: Option<usize>,
    fail_finish: bool,
    fail_set_boot: bool,
}

/// Two application slots, `ota_0` running and `ota_1` inactive.
#[derive(Clone)]
pub struct MemorySlots {
    state: Arc<Mutex<SlotState>>,
}

impl Default for MemorySlots {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_SLOT_CAPACITY)
    }
}

impl MemorySlots {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: u64) -> Self {
        Self {
            state: Arc::new(Mutex::new(SlotState {
                boot: "ota_0".to_string(),
                inactive: Some(SlotInfo {
                    label: "ota_1".to_string(),
                    is_app: true,
                    capacity,
                }),
                images: HashMap::new(),
                begins: 0,
                finishes: 0,
                aborts: 0,
                writes: 0,
                fail_begin: false,
                fail_write_after: None,
                fail_finish: false,
                fail_set_boot: false,
            })),
        }
    }

    pub fn boot_slot(&self) -> String {
        lock(&self.state).boot.clone()
    }

    /// Images become visible only once their transaction finished.
    pub fn image(&self, label: &str) -> Option<Vec<u8>> {
        lock(&self.state).images.get(label).cloned()
    }

    pub fn begins(&self) -> usize {
        lock(&self.state).begins
    }

    pub fn aborts(&self) -> usize {
        lock(&self.state).aborts
    }

    pub fn ends(&self) -> usize {
        let state = lock(&self.state);
        state.finishes + state.aborts
    }

    pub fn remove_inactive(&self) {
        lock(&self.state).inactive = None;
    }

    pub fn mark_inactive_as_data(&self) {
        if let Some(slot) = lock(&self.state).inactive.as_mut() {
            slot.is_app = false;
        }
    }

    pub fn fail_begin(&self, fail: bool) {
        lock(&self.state).fail_begin = fail;
    }

    /// The first `n` writes succeed, later ones fail.
    pub fn fail_write_after(&self, n: usize) {
        lock(&self.state).fail_write_after = Some(n);
    }

    pub fn fail_finish(&self, fail: bool) {
        lock(&self.state).fail_finish = fail;
    }

    pub fn fail_set_boot(&self, fail: bool) {
        lock(&self.state).fail_set_boot = fail;
    }
}

pub struct MemoryWriter {
    state: Arc<Mutex<SlotState>>,
    label: String,
    data: Vec<u8>,
}

impl SlotWriter for MemoryWriter {
    fn write(&mut self, data: &[u8]) -> Result<(), DriverError> {
        let mut state = lock(&self.state);
        state.writes += 1;
        if state.fail_write_after.is_some_and(|n| state.writes > n) {
            return Err(DriverError(-2));
        }
        self.data.extend_from_slice(data);
        Ok(())
    }

    fn finish(self) -> Result<(), DriverError> {
        let mut state = lock(&self.state);
        state.finishes += 1;
        if state.fail_finish {
            return Err(DriverError(-3));
        }
        state.images.insert(self.label, self.data);
        Ok(())
    }

    fn abort(self) {
        lock(&self.state).aborts += 1;
    }
}

impl FirmwareSlots for MemorySlots {
    type Writer = MemoryWriter;

    fn next_inactive(&self) -> Result<Option<SlotInfo>, DriverError> {
        Ok(lock(&self.state).inactive.clone())
    }

    fn begin(&self, slot: &SlotInfo) -> Result<Self::Writer, DriverError> {
        let mut state = lock(&self.state);
        state.begins += 1;
        if state.fail_begin {
            return Err(DriverError(-1));
        }
        Ok(MemoryWriter {
            state: Arc::clone(&self.state),
            label: slot.label.clone(),
            data: Vec::new(),
        })
    }

    fn set_boot(&self, slot: &SlotInfo) -> Result<(), DriverError> {
        let mut state = lock(&self.state);
        if state.fail_set_boot {
            return Err(DriverError(-4));
        }
        state.boot = slot.label.clone();
        Ok(())
    }
}

// ---------------------------------------------------------------- request body

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Timeout,
    Fail(i32),
}

impl Step {
    fn into_result(self) -> Result<usize, ReadError> {
        match self {
            Step::Timeout => Err(ReadError::Timeout),
            Step::Fail(code) => Err(ReadError::Failed(code)),
        }
    }
}

/// Serves `data` in pieces as large as each request allows, with scripted
/// failures around it. Once the data and steps are used up it reports a
/// closed stream.
pub struct ChunkedSource {
    data: Vec<u8>,
    pos: usize,
    pending: VecDeque<Step>,
    after_first: Vec<Step>,
    tail: VecDeque<Step>,
    served_first: bool,
    largest: usize,
}

impl ChunkedSource {
    pub fn new(data: &[u8]) -> Self {
        Self {
            data: data.to_vec(),
            pos: 0,
            pending: VecDeque::new(),
            after_first: Vec::new(),
            tail: VecDeque::new(),
            served_first: false,
            largest: 0,
        }
    }

    /// Step returned once the data is exhausted.
    pub fn then(mut self, step: Step) -> Self {
        self.tail.push_back(step);
        self
    }

    pub fn starting_with(mut self, steps: &[Step]) -> Self {
        self.pending.extend(steps.iter().copied());
        self
    }

    pub fn interleave_after_first_chunk(mut self, steps: &[Step]) -> Self {
        self.after_first = steps.to_vec();
        self
    }

    pub fn largest_request(&self) -> usize {
        self.largest
    }
}

impl ByteSource for ChunkedSource {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, ReadError> {
        self.largest = self.largest.max(buf.len());
        if let Some(step) = self.pending.pop_front() {
            return step.into_result();
        }
        if self.pos < self.data.len() {
            let n = buf.len().min(self.data.len() - self.pos);
            buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            if !self.served_first {
                self.served_first = true;
                self.pending.extend(self.after_first.drain(..));
            }
            return Ok(n);
        }
        match self.tail.pop_front() {
            Some(step) => step.into_result(),
            None => Ok(0),
        }
    }
}

// ---------------------------------------------------------------- restart

#[derive(Clone, Default)]
pub struct RecordingRestart {
    inner: Arc<(Mutex<usize>, Condvar)>,
}

impl RecordingRestart {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        *lock(&self.inner.0)
    }

    /// Waits until at least `n` restarts were requested.
    pub fn wait_for(&self, n: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let (count, changed) = &*self.inner;
        let mut current = lock(count);
        while *current < n {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            current = match changed.wait_timeout(current, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        true
    }
}

impl Restart for RecordingRestart {
    fn restart(&self) {
        let (count, changed) = &*self.inner;
        *lock(count) += 1;
        changed.notify_all();
    }
}

// ---------------------------------------------------------------- service

pub struct Harness {
    pub service: RecoveryService<MemoryMedium, ManualClock, CountingEntropy, MemorySlots>,
    pub clock: ManualClock,
    pub slots: MemorySlots,
    pub restart: RecordingRestart,
}

/// A full route layer over in-memory doubles, restarting after 10 ms.
pub fn service_with(medium: MemoryMedium) -> Harness {
    let settings = Arc::new(store_with(medium));
    let clock = ManualClock::default();
    let policy = SessionPolicy {
        failure_delay: Duration::from_millis(20),
        ..SessionPolicy::default()
    };
    let session = Arc::new(SessionAuthority::new(
        Arc::clone(&settings),
        clock.clone(),
        CountingEntropy::default(),
        policy,
    ));
    let slots = MemorySlots::new();
    let restart = RecordingRestart::new();
    let service = RecoveryService::new(
        settings,
        session,
        UpdateEngine::new(slots.clone(), UpdatePolicy::default()),
        RestartScheduler::new(Arc::new(restart.clone())),
    )
    .with_restart_delay(Duration::from_millis(10));
    Harness {
        service,
        clock,
        slots,
        restart,
    }
}
