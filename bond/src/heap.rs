use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    marker::PhantomData,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
    time::Instant,
};

use ahash::RandomState;
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::{Gc, HeaderFlags, HeapObject, RootProvider, Value, Visitor};

thread_local! {
    /// collectors the current thread holds a storage of
    static REGISTERED: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
}

#[derive(Debug, Copy, Clone)]
pub struct GcSettings {
    /// number of live objects that triggers the first collection
    pub alloc_limit: usize,
    /// after a collection the next trigger is `live * growth_factor`,
    /// never lower than `alloc_limit`
    pub growth_factor: f64,
}

impl Default for GcSettings {
    fn default() -> Self {
        Self {
            alloc_limit: 100_000,
            growth_factor: 2.0,
        }
    }
}

impl GcSettings {
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.alloc_limit == 0 {
            return Err("alloc_limit must be > 0");
        }
        if !self.growth_factor.is_finite() || self.growth_factor < 1.0 {
            return Err("growth_factor must be a finite number >= 1.0");
        }
        Ok(())
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct RootId(u64);

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct StorageId(u64);

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct GcStats {
    pub collections: usize,
    /// objects freed over the lifetime of the collector
    pub freed: usize,
    pub alloc_count: usize,
    pub immortal_count: usize,
    pub alloc_limit: usize,
}

/// Rendezvous state, guarded by `GarbageCollector::sync`.
///
/// A collection runs once every registered mutator is parked, either in a
/// blocking region or waiting for the collection itself.
#[derive(Debug, Default)]
struct SyncState {
    mutators: usize,
    parked: usize,
    paused: usize,
    collecting: bool,
}

type Storage = Arc<Mutex<Vec<Gc>>>;

pub struct GarbageCollector {
    growth_factor: f64,
    alloc_limit: AtomicUsize,
    next_collection: AtomicUsize,
    /// live mortal objects
    alloc_count: AtomicUsize,
    immortal_count: AtomicUsize,
    collections: AtomicUsize,
    freed: AtomicUsize,
    /// fast path flag polled at safepoints
    requested: AtomicBool,
    sync: Mutex<SyncState>,
    changed: Condvar,
    roots: Mutex<HashMap<RootId, Arc<dyn RootProvider>, RandomState>>,
    storages: Mutex<HashMap<StorageId, Storage, RandomState>>,
    /// allocations of threads that already exited
    orphans: Mutex<Vec<Gc>>,
    immortals: Mutex<Vec<Gc>>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for GarbageCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GarbageCollector")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl GarbageCollector {
    pub fn new(settings: GcSettings) -> Arc<Self> {
        debug_assert!(settings.validate().is_ok(), "invalid GcSettings");
        Arc::new(Self {
            growth_factor: settings.growth_factor,
            alloc_limit: AtomicUsize::new(settings.alloc_limit),
            next_collection: AtomicUsize::new(settings.alloc_limit),
            alloc_count: AtomicUsize::new(0),
            immortal_count: AtomicUsize::new(0),
            collections: AtomicUsize::new(0),
            freed: AtomicUsize::new(0),
            requested: AtomicBool::new(false),
            sync: Mutex::new(SyncState::default()),
            changed: Condvar::new(),
            roots: Mutex::new(HashMap::default()),
            storages: Mutex::new(HashMap::default()),
            orphans: Mutex::new(Vec::new()),
            immortals: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        })
    }

    fn fresh_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    // ── thread storage ───────────────────────────────────────────────

    fn key(&self) -> usize {
        self as *const Self as usize
    }

    /// Registers the calling thread as a mutator. Every thread that
    /// allocates or touches heap objects needs one.
    ///
    /// # Panics
    /// if the calling thread already has a storage in this collector, a
    /// second one would never park and stall every collection
    pub fn make_thread_storage(self: &Arc<Self>) -> Mutator {
        let key = self.key();
        REGISTERED.with_borrow_mut(|registered| {
            if registered.contains(&key) {
                panic!(
                    "thread {:?} already has a thread storage",
                    std::thread::current().id()
                );
            }
            registered.push(key);
        });
        let id = StorageId(self.fresh_id());
        let allocations: Storage = Arc::default();

        let mut sync = self.sync.lock();
        // not yet counted, so just wait for a running collection to end
        while sync.collecting {
            self.changed.wait(&mut sync);
        }
        sync.mutators += 1;
        self.storages.lock().insert(id, allocations.clone());
        drop(sync);

        log::debug!("thread storage {id:?} created");
        Mutator {
            gc: self.clone(),
            id,
            allocations,
            in_blocking: Cell::new(false),
            _not_send: PhantomData,
        }
    }

    /// Unregisters a mutator. Its allocations stay managed and are swept
    /// once unreachable. Called by `Mutator::drop`, must run on the thread
    /// that created the storage.
    ///
    /// # Panics
    /// if the storage was already removed
    pub fn remove_thread_storage(&self, id: StorageId) {
        let mut sync = self.sync.lock();
        self.park_while_collecting(&mut sync);

        let Some(storage) = self.storages.lock().remove(&id) else {
            panic!("thread storage {id:?} removed twice");
        };
        self.orphans.lock().append(&mut storage.lock());
        sync.mutators -= 1;
        self.changed.notify_all();
        drop(sync);

        let key = self.key();
        REGISTERED.with_borrow_mut(|registered| {
            registered.retain(|registered| *registered != key);
        });
        log::debug!("thread storage {id:?} removed");
    }

    // ── roots ────────────────────────────────────────────────────────

    pub fn add_root(
        self: &Arc<Self>,
        holder: Arc<dyn RootProvider>,
    ) -> RootGuard {
        let id = RootId(self.fresh_id());
        self.roots.lock().insert(id, holder);
        RootGuard {
            gc: self.clone(),
            id: Some(id),
        }
    }

    /// # Panics
    /// if the root is not registered
    pub fn remove_root(&self, id: RootId) {
        if self.roots.lock().remove(&id).is_none() {
            panic!("root {id:?} is not registered");
        }
    }

    /// Roots `values` for as long as the returned handle lives.
    pub fn root(self: &Arc<Self>, values: Vec<Value>) -> Rooted {
        let cell = Arc::new(RootCell(Mutex::new(values)));
        let guard = self.add_root(cell.clone());
        Rooted {
            cell,
            _guard: guard,
        }
    }

    pub fn root_count(&self) -> usize {
        self.roots.lock().len()
    }

    // ── allocation ───────────────────────────────────────────────────

    /// Allocates an object that is never collected. Usable from any thread.
    /// Its edges are traced as roots.
    pub fn make_immortal(&self, object: HeapObject) -> Gc {
        let gc = Gc::allocate(object, HeaderFlags::IMMORTAL);
        self.immortals.lock().push(gc);
        self.immortal_count.fetch_add(1, Ordering::AcqRel);
        gc
    }

    // ── knobs ────────────────────────────────────────────────────────

    pub fn get_alloc_limit(&self) -> usize {
        self.alloc_limit.load(Ordering::Acquire)
    }

    pub fn set_alloc_limit(&self, limit: usize) {
        let limit = limit.max(1);
        self.alloc_limit.store(limit, Ordering::Release);
        self.next_collection.store(limit, Ordering::Release);
        if self.get_alloc_count() >= limit {
            self.requested.store(true, Ordering::Release);
        }
    }

    pub fn get_alloc_count(&self) -> usize {
        self.alloc_count.load(Ordering::Acquire)
    }

    pub fn get_immortal_count(&self) -> usize {
        self.immortal_count.load(Ordering::Acquire)
    }

    pub fn is_paused(&self) -> bool {
        self.sync.lock().paused > 0
    }

    pub fn stats(&self) -> GcStats {
        GcStats {
            collections: self.collections.load(Ordering::Acquire),
            freed: self.freed.load(Ordering::Acquire),
            alloc_count: self.get_alloc_count(),
            immortal_count: self.get_immortal_count(),
            alloc_limit: self.get_alloc_limit(),
        }
    }

    // ── rendezvous ───────────────────────────────────────────────────

    fn park_while_collecting(&self, sync: &mut MutexGuard<'_, SyncState>) {
        if !sync.collecting {
            return;
        }
        sync.parked += 1;
        self.changed.notify_all();
        while sync.collecting {
            self.changed.wait(sync);
        }
        sync.parked -= 1;
    }

    fn enter_blocking(&self) {
        let mut sync = self.sync.lock();
        sync.parked += 1;
        self.changed.notify_all();
    }

    fn leave_blocking(&self) {
        let mut sync = self.sync.lock();
        while sync.collecting {
            self.changed.wait(&mut sync);
        }
        sync.parked -= 1;
    }

    fn stop(&self) {
        let mut sync = self.sync.lock();
        self.park_while_collecting(&mut sync);
        sync.paused += 1;
    }

    fn resume(&self) {
        let mut sync = self.sync.lock();
        debug_assert!(sync.paused > 0, "resume_gc without matching stop_gc");
        if sync.paused == 0 {
            log::warn!("resume_gc without matching stop_gc, ignored");
            return;
        }
        sync.paused -= 1;
    }

    /// Called by a mutator at a safepoint. Either joins a running
    /// collection or coordinates a new one. Returns true if a collection
    /// ran while this thread waited.
    fn rendezvous(&self, force: bool) -> bool {
        let mut sync = self.sync.lock();
        if sync.collecting {
            self.park_while_collecting(&mut sync);
            return true;
        }

        let due = self.get_alloc_count()
            >= self.next_collection.load(Ordering::Acquire);
        if sync.paused > 0 || !(force || due) {
            // make sets the flag again once the next allocation is over
            self.requested.store(false, Ordering::Release);
            return false;
        }

        sync.collecting = true;
        self.requested.store(false, Ordering::Release);
        sync.parked += 1;
        self.changed.notify_all();
        while sync.parked < sync.mutators {
            self.changed.wait(&mut sync);
        }

        MutexGuard::unlocked(&mut sync, || self.mark_and_sweep());

        sync.collecting = false;
        sync.parked -= 1;
        self.changed.notify_all();
        true
    }

    // ── mark & sweep ─────────────────────────────────────────────────

    fn mark_and_sweep(&self) {
        let start = Instant::now();
        let before = self.get_alloc_count();
        log::trace!(
            "collection {} started, {before} live",
            self.stats().collections + 1
        );

        let mut marker = Marker::default();
        let roots: Vec<_> = self.roots.lock().values().cloned().collect();
        for root in &roots {
            root.visit_roots(&mut marker);
        }
        for immortal in self.immortals.lock().iter() {
            immortal.as_object().visit_edges(&mut marker);
        }
        marker.drain();

        let mut freed = 0;
        let mut sweep = |list: &mut Vec<Gc>| {
            list.retain(|gc| {
                if gc.header().is_marked() {
                    gc.header().unmark();
                    true
                } else {
                    // SAFETY: unmarked after a full trace, nothing reaches it
                    unsafe { gc.free() };
                    freed += 1;
                    false
                }
            });
        };
        for storage in self.storages.lock().values() {
            sweep(&mut *storage.lock());
        }
        sweep(&mut *self.orphans.lock());

        let live = before - freed;
        self.alloc_count.store(live, Ordering::Release);
        self.freed.fetch_add(freed, Ordering::AcqRel);
        self.collections.fetch_add(1, Ordering::AcqRel);
        let grown = (live as f64 * self.growth_factor) as usize;
        self.next_collection
            .store(grown.max(self.get_alloc_limit()), Ordering::Release);

        log::trace!(
            "collection finished: {before} live before, {freed} freed, {live} live after, took {:?}",
            start.elapsed()
        );
    }
}

impl Drop for GarbageCollector {
    fn drop(&mut self) {
        let storages = std::mem::take(self.storages.get_mut());
        let lists = storages
            .into_values()
            .map(|storage| std::mem::take(&mut *storage.lock()))
            .chain([
                std::mem::take(self.orphans.get_mut()),
                std::mem::take(self.immortals.get_mut()),
            ]);
        for list in lists {
            for gc in list {
                // SAFETY: the collector is gone, so is every mutator
                unsafe { gc.free() };
            }
        }
    }
}

/// Worklist marker. Immortal objects are never marked, their edges are
/// traced up front.
#[derive(Default)]
struct Marker {
    worklist: Vec<Gc>,
}

impl Visitor for Marker {
    fn visit(&mut self, value: Value) {
        if let Value::Ref(gc) = value {
            if !gc.header().is_immortal() && gc.header().mark() {
                self.worklist.push(gc);
            }
        }
    }
}

impl Marker {
    fn drain(&mut self) {
        while let Some(gc) = self.worklist.pop() {
            gc.as_object().visit_edges(self);
        }
    }
}

// ── guards ───────────────────────────────────────────────────────────

/// Keeps a root holder registered, removes it on drop.
#[derive(Debug)]
pub struct RootGuard {
    gc: Arc<GarbageCollector>,
    id: Option<RootId>,
}

impl RootGuard {
    pub fn id(&self) -> Option<RootId> {
        self.id
    }

    /// Disarms the guard, the caller takes over `remove_root`.
    pub fn into_id(mut self) -> RootId {
        match self.id.take() {
            Some(id) => id,
            None => unreachable!("guard already disarmed"),
        }
    }
}

impl Drop for RootGuard {
    fn drop(&mut self) {
        if let Some(id) = self.id.take() {
            self.gc.remove_root(id);
        }
    }
}

struct RootCell(Mutex<Vec<Value>>);

impl RootProvider for RootCell {
    fn visit_roots(&self, visitor: &mut dyn Visitor) {
        self.0.lock().iter().for_each(|value| visitor.visit(*value));
    }
}

/// A scoped set of rooted values.
pub struct Rooted {
    cell: Arc<RootCell>,
    _guard: RootGuard,
}

impl Rooted {
    pub fn push(&self, value: Value) {
        self.cell.0.lock().push(value);
    }

    pub fn get(&self, index: usize) -> Option<Value> {
        self.cell.0.lock().get(index).copied()
    }

    pub fn values(&self) -> Vec<Value> {
        self.cell.0.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.cell.0.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Pauses collection until dropped.
#[derive(Debug)]
pub struct PauseGuard {
    gc: Arc<GarbageCollector>,
}

impl Drop for PauseGuard {
    fn drop(&mut self) {
        self.gc.resume();
    }
}

struct BlockingGuard<'a> {
    mutator: &'a Mutator,
}

impl Drop for BlockingGuard<'_> {
    fn drop(&mut self) {
        self.mutator.gc.leave_blocking();
        self.mutator.in_blocking.set(false);
    }
}

// ── mutator ──────────────────────────────────────────────────────────

/// Per thread storage. Owns the allocation list of its thread and takes
/// part in every collection, removed from the collector on drop.
pub struct Mutator {
    gc: Arc<GarbageCollector>,
    id: StorageId,
    allocations: Storage,
    in_blocking: Cell<bool>,
    _not_send: PhantomData<*const ()>,
}

impl std::fmt::Debug for Mutator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mutator").field("id", &self.id).finish()
    }
}

impl Mutator {
    #[inline]
    pub fn gc(&self) -> &Arc<GarbageCollector> {
        &self.gc
    }

    #[inline]
    pub fn id(&self) -> StorageId {
        self.id
    }

    /// Allocates and counts a new object. Never collects: a fresh object
    /// is safe until the next safepoint or blocking region.
    pub fn make(&self, object: HeapObject) -> Gc {
        let gc = Gc::allocate(object, HeaderFlags::empty());
        self.allocations.lock().push(gc);
        let count = self.gc.alloc_count.fetch_add(1, Ordering::AcqRel) + 1;
        if count >= self.gc.next_collection.load(Ordering::Acquire) {
            self.gc.requested.store(true, Ordering::Release);
        }
        gc
    }

    pub fn make_immortal(&self, object: HeapObject) -> Gc {
        self.gc.make_immortal(object)
    }

    pub fn root(&self, values: Vec<Value>) -> Rooted {
        self.gc.root(values)
    }

    /// Point at which this thread may take part in a collection. Every
    /// value not reachable from a root may be freed here.
    #[inline]
    pub fn safepoint(&self) {
        if self.gc.requested.load(Ordering::Acquire) {
            self.gc.rendezvous(false);
        }
    }

    /// Runs `f` while counted as parked, so other threads may collect.
    /// `f` must not touch the heap: anything it needs has to be rooted.
    ///
    /// # Panics
    /// if called from inside another blocking region
    pub fn blocking<R>(&self, f: impl FnOnce() -> R) -> R {
        assert!(!self.in_blocking.get(), "blocking regions do not nest");
        self.in_blocking.set(true);
        self.gc.enter_blocking();
        let _guard = BlockingGuard { mutator: self };
        f()
    }

    /// No collection happens until the matching `resume_gc`. Calls must
    /// be paired; prefer [`Mutator::pause`].
    pub fn stop_gc(&self) {
        self.gc.stop();
    }

    pub fn resume_gc(&self) {
        self.gc.resume();
    }

    pub fn pause(&self) -> PauseGuard {
        self.gc.stop();
        PauseGuard {
            gc: self.gc.clone(),
        }
    }

    /// Forces a collection. Returns false if collection is paused.
    pub fn collect(&self) -> bool {
        self.gc.rendezvous(true)
    }
}

impl Drop for Mutator {
    fn drop(&mut self) {
        self.gc.remove_thread_storage(self.id);
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{Barrier, atomic::AtomicBool},
        thread,
        time::Duration,
    };

    use super::*;
    use crate::{List, Str};

    fn gc() -> Arc<GarbageCollector> {
        GarbageCollector::new(GcSettings::default())
    }

    fn string(mutator: &Mutator, s: &str) -> Gc {
        mutator.make(HeapObject::Str(Str::new(s)))
    }

    #[test]
    fn settings_validation() {
        assert!(GcSettings::default().validate().is_ok());
        let zero = GcSettings {
            alloc_limit: 0,
            ..Default::default()
        };
        assert!(zero.validate().is_err());
        let shrink = GcSettings {
            growth_factor: 0.5,
            ..Default::default()
        };
        assert!(shrink.validate().is_err());
    }

    #[test]
    fn rooted_objects_survive_unrooted_are_freed() {
        let gc = gc();
        let mutator = gc.make_thread_storage();

        let kept = string(&mutator, "kept");
        let _garbage = string(&mutator, "garbage");
        let root = mutator.root(vec![Value::Ref(kept)]);
        assert_eq!(gc.get_alloc_count(), 2);

        assert!(mutator.collect());
        assert_eq!(gc.get_alloc_count(), 1);
        assert_eq!(kept.as_str(), Some("kept"));

        drop(root);
        assert!(mutator.collect());
        assert_eq!(gc.get_alloc_count(), 0);
        assert_eq!(gc.stats().freed, 2);
    }

    #[test]
    fn tracing_follows_edges() {
        let gc = gc();
        let mutator = gc.make_thread_storage();

        let inner = string(&mutator, "inner");
        let list = mutator.make(HeapObject::List(List::new(vec![
            Value::Ref(inner),
        ])));
        let outer = mutator.make(HeapObject::List(List::new(vec![
            Value::Ref(list),
        ])));
        let _root = mutator.root(vec![Value::Ref(outer)]);

        mutator.collect();
        assert_eq!(gc.get_alloc_count(), 3);
        assert!(!Value::Ref(inner).is_marked(), "marks are cleared");
    }

    #[test]
    fn cycles_are_collected() {
        let gc = gc();
        let mutator = gc.make_thread_storage();
        let a = mutator.make(HeapObject::List(List::default()));
        let b = mutator.make(HeapObject::List(List::new(vec![Value::Ref(a)])));
        a.as_list().unwrap().push(Value::Ref(b));

        mutator.collect();
        assert_eq!(gc.get_alloc_count(), 0);
    }

    #[test]
    fn pause_suppresses_collection() {
        let gc = gc();
        let mutator = gc.make_thread_storage();
        string(&mutator, "garbage");

        let pause = mutator.pause();
        assert!(gc.is_paused());
        // allocation still works while paused
        string(&mutator, "more garbage");
        assert!(!mutator.collect());
        assert_eq!(gc.get_alloc_count(), 2);

        drop(pause);
        assert!(mutator.collect());
        assert_eq!(gc.get_alloc_count(), 0);
    }

    #[test]
    fn explicit_stop_and_resume() {
        let gc = gc();
        let mutator = gc.make_thread_storage();
        string(&mutator, "garbage");
        mutator.stop_gc();
        assert!(!mutator.collect());
        mutator.resume_gc();
        assert!(mutator.collect());
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "resume_gc without matching stop_gc")]
    fn unbalanced_resume_panics() {
        let gc = gc();
        let mutator = gc.make_thread_storage();
        mutator.resume_gc();
    }

    #[test]
    #[should_panic(expected = "is not registered")]
    fn double_root_removal_panics() {
        let gc = gc();
        let guard = gc.add_root(Arc::new(RootCell(Mutex::new(Vec::new()))));
        let id = guard.into_id();
        gc.remove_root(id);
        gc.remove_root(id);
    }

    #[test]
    fn root_guard_unregisters() {
        let gc = gc();
        let mutator = gc.make_thread_storage();
        {
            let _rooted = mutator.root(Vec::new());
            assert_eq!(gc.root_count(), 1);
        }
        assert_eq!(gc.root_count(), 0);
    }

    #[test]
    fn immortal_objects_are_counted_and_kept() {
        let gc = gc();
        let mutator = gc.make_thread_storage();
        let name = mutator.make_immortal(HeapObject::Str(Str::new("sync")));
        assert_eq!(gc.get_immortal_count(), 1);
        assert_eq!(gc.get_alloc_count(), 0);

        mutator.collect();
        assert_eq!(name.as_str(), Some("sync"));
        assert!(name.header().is_immortal());
    }

    #[test]
    fn limit_triggers_at_safepoint() {
        let gc = GarbageCollector::new(GcSettings {
            alloc_limit: 10,
            growth_factor: 2.0,
        });
        let mutator = gc.make_thread_storage();
        for i in 0..10 {
            string(&mutator, &i.to_string());
        }
        assert_eq!(gc.stats().collections, 0, "make never collects");
        mutator.safepoint();
        assert_eq!(gc.stats().collections, 1);
        assert_eq!(gc.get_alloc_count(), 0);
    }

    #[test]
    fn next_trigger_grows_with_live_set() {
        let gc = GarbageCollector::new(GcSettings {
            alloc_limit: 4,
            growth_factor: 2.0,
        });
        let mutator = gc.make_thread_storage();
        let live: Vec<Value> =
            (0..4).map(|i| Value::Ref(string(&mutator, &i.to_string()))).collect();
        let _root = mutator.root(live);
        mutator.safepoint();
        assert_eq!(gc.stats().collections, 1);

        // 4 live, next trigger at 8
        for _ in 0..3 {
            string(&mutator, "x");
        }
        mutator.safepoint();
        assert_eq!(gc.stats().collections, 1);
        string(&mutator, "x");
        mutator.safepoint();
        assert_eq!(gc.stats().collections, 2);
    }

    #[test]
    fn set_alloc_limit_requests_collection() {
        let gc = gc();
        let mutator = gc.make_thread_storage();
        string(&mutator, "a");
        string(&mutator, "b");
        gc.set_alloc_limit(2);
        assert_eq!(gc.get_alloc_limit(), 2);
        mutator.safepoint();
        assert_eq!(gc.stats().collections, 1);
    }

    #[test]
    fn exited_thread_allocations_are_adopted() {
        let gc = gc();
        let main = gc.make_thread_storage();
        let rooted = main.root(Vec::new());

        let worker_gc = gc.clone();
        let handle = thread::spawn(move || {
            let mutator = worker_gc.make_thread_storage();
            string(&mutator, "garbage");
            string(&mutator, "kept")
        });
        let kept = main.blocking(|| handle.join().unwrap());
        rooted.push(Value::Ref(kept));

        main.collect();
        assert_eq!(gc.get_alloc_count(), 1);
        assert_eq!(kept.as_str(), Some("kept"));
    }

    #[test]
    #[should_panic(expected = "removed twice")]
    fn removing_storage_twice_panics() {
        let gc = gc();
        let mutator = gc.make_thread_storage();
        let id = mutator.id();
        gc.remove_thread_storage(id);
        // drop removes it again
        drop(mutator);
    }

    #[test]
    #[should_panic(expected = "already has a thread storage")]
    fn second_storage_on_one_thread_panics() {
        let gc = gc();
        let _first = gc.make_thread_storage();
        let _second = gc.make_thread_storage();
    }

    #[test]
    fn storage_can_be_recreated_after_drop() {
        let gc = gc();
        let first = gc.make_thread_storage();
        string(&first, "x");
        drop(first);

        let second = gc.make_thread_storage();
        assert!(second.collect());
        assert_eq!(gc.get_alloc_count(), 0);

        // other collectors are independent
        let other = GarbageCollector::new(GcSettings::default());
        let _third = other.make_thread_storage();
    }

    #[test]
    fn collection_waits_for_every_mutator() {
        let gc = gc();
        let threads = 4;
        let barrier = Arc::new(Barrier::new(threads));
        let stop = Arc::new(AtomicBool::new(false));

        let handles: Vec<_> = (0..threads)
            .map(|i| {
                let gc = gc.clone();
                let barrier = barrier.clone();
                let stop = stop.clone();
                thread::spawn(move || {
                    let mutator = gc.make_thread_storage();
                    let mine = string(&mutator, &format!("thread {i}"));
                    let root = mutator.root(vec![Value::Ref(mine)]);
                    mutator.blocking(|| barrier.wait());

                    let mut rounds = 0;
                    while !stop.load(Ordering::Acquire) {
                        string(&mutator, "garbage");
                        if i == 0 && rounds % 64 == 0 {
                            mutator.collect();
                        }
                        mutator.safepoint();
                        rounds += 1;
                    }
                    assert_eq!(mine.as_str(), Some(format!("thread {i}").as_str()));
                    drop(root);
                })
            })
            .collect();

        thread::sleep(Duration::from_millis(100));
        stop.store(true, Ordering::Release);
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(gc.stats().collections > 0);
    }
}
