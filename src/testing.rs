//! Scriptable TA backend for unit tests

use crate::error::{Error, Result};
use crate::tee::{HeapStats, TaCall, TaFlags, TaKind, TaLoader, TaOps};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

type OpenHook = Box<dyn Fn(&mut TaCall<'_>) -> Result<()> + Send + Sync>;
type InvokeHook = Box<dyn Fn(&mut TaCall<'_>, u32) -> Result<()> + Send + Sync>;

/// Entry counters, shareable across every instance a loader creates
#[derive(Debug, Default)]
pub(crate) struct TaCounters {
    opens: AtomicUsize,
    closes: AtomicUsize,
    invokes: AtomicUsize,
    releases: AtomicUsize,
    destroys: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl TaCounters {
    pub(crate) fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub(crate) fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub(crate) fn invokes(&self) -> usize {
        self.invokes.load(Ordering::SeqCst)
    }

    pub(crate) fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    pub(crate) fn destroys(&self) -> usize {
        self.destroys.load(Ordering::SeqCst)
    }

    /// Highest number of threads observed inside the TA at once
    pub(crate) fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn enter(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
    }

    fn leave(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A TA whose entry points run test-supplied closures.
pub(crate) struct ScriptedTa {
    on_open: Option<OpenHook>,
    on_invoke: Option<InvokeHook>,
    heap: Option<HeapStats>,
    counters: Arc<TaCounters>,
}

impl ScriptedTa {
    pub(crate) fn new() -> Self {
        Self {
            on_open: None,
            on_invoke: None,
            heap: None,
            counters: Arc::new(TaCounters::default()),
        }
    }

    pub(crate) fn on_open(
        mut self,
        hook: impl Fn(&mut TaCall<'_>) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.on_open = Some(Box::new(hook));
        self
    }

    pub(crate) fn on_invoke(
        mut self,
        hook: impl Fn(&mut TaCall<'_>, u32) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.on_invoke = Some(Box::new(hook));
        self
    }

    /// Report these heap figures from `dump_mem_stats`
    pub(crate) fn heap(mut self, heap: HeapStats) -> Self {
        self.heap = Some(heap);
        self
    }

    pub(crate) fn with_counters(mut self, counters: Arc<TaCounters>) -> Self {
        self.counters = counters;
        self
    }
}

impl TaOps for ScriptedTa {
    fn enter_open_session(&self, call: &mut TaCall<'_>) -> Result<()> {
        self.counters.opens.fetch_add(1, Ordering::SeqCst);
        self.counters.enter();
        let res = match &self.on_open {
            Some(hook) => hook(call),
            None => Ok(()),
        };
        self.counters.leave();
        res
    }

    fn enter_close_session(&self, _call: &mut TaCall<'_>) {
        self.counters.closes.fetch_add(1, Ordering::SeqCst);
    }

    fn enter_invoke_cmd(&self, call: &mut TaCall<'_>, cmd: u32) -> Result<()> {
        self.counters.invokes.fetch_add(1, Ordering::SeqCst);
        self.counters.enter();
        let res = match &self.on_invoke {
            Some(hook) => hook(call, cmd),
            None => Ok(()),
        };
        self.counters.leave();
        res
    }

    fn dump_mem_stats(&self, _call: &mut TaCall<'_>) -> Result<HeapStats> {
        self.heap.ok_or(Error::NotSupported)
    }

    fn release_state(&self) {
        self.counters.releases.fetch_add(1, Ordering::SeqCst);
    }

    fn destroy(&self) {
        self.counters.destroys.fetch_add(1, Ordering::SeqCst);
    }
}

type TaFactory = Arc<dyn Fn() -> ScriptedTa + Send + Sync>;

/// Loader serving [`ScriptedTa`] instances for a fixed set of UUIDs.
pub(crate) struct ScriptedLoader {
    kind: TaKind,
    entries: HashMap<Uuid, (TaFlags, TaFactory)>,
    delay: Option<Duration>,
    fail: bool,
    instances: AtomicUsize,
}

impl ScriptedLoader {
    pub(crate) fn new(kind: TaKind) -> Self {
        Self {
            kind,
            entries: HashMap::new(),
            delay: None,
            fail: false,
            instances: AtomicUsize::new(0),
        }
    }

    pub(crate) fn with_ta(
        mut self,
        uuid: Uuid,
        flags: TaFlags,
        factory: impl Fn() -> ScriptedTa + Send + Sync + 'static,
    ) -> Self {
        self.entries.insert(uuid, (flags, Arc::new(factory)));
        self
    }

    /// Serve a plain TA that reports into `counters`
    pub(crate) fn with_counted_ta(
        self,
        uuid: Uuid,
        flags: TaFlags,
        counters: &Arc<TaCounters>,
    ) -> Self {
        let counters = counters.clone();
        self.with_ta(uuid, flags, move || {
            ScriptedTa::new().with_counters(counters.clone())
        })
    }

    /// Sleep this long inside `instantiate`
    pub(crate) fn instantiate_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Make every `instantiate` fail after a successful `lookup`
    pub(crate) fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    /// Number of instances created so far
    pub(crate) fn instances(&self) -> usize {
        self.instances.load(Ordering::SeqCst)
    }
}

impl TaLoader for ScriptedLoader {
    fn kind(&self) -> TaKind {
        self.kind
    }

    fn lookup(&self, uuid: &Uuid) -> Result<TaFlags> {
        self.entries
            .get(uuid)
            .map(|(flags, _)| *flags)
            .ok_or(Error::ItemNotFound)
    }

    fn instantiate(&self, uuid: &Uuid) -> Result<Arc<dyn TaOps>> {
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        if self.fail {
            return Err(Error::OutOfMemory);
        }

        let (_, factory) = self.entries.get(uuid).ok_or(Error::ItemNotFound)?;
        self.instances.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(factory()))
    }
}
