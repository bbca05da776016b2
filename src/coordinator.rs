//! # Coordinator
//!
//! Owns the set of patches that have not been applied yet.
//! Patches whose image is already mapped are applied by [`Coordinator::place`], the rest wait for the loader to report their image.
//! Once nothing is pending the load subscription is released and the shutdown action runs on a thread of its own.

use std::ptr::{self, NonNull};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread;

use thiserror::Error;

use crate::descriptor::{find_overlap, PatchDescriptor, Target};
use crate::logger::SharedLogger;
use crate::patcher::{ApplyError, Patcher};
use crate::platform::{LoadEvent, LoadHandler, Loader, ObserverError};

/// Runs once every patch has been applied
pub type ShutdownAction = Box<dyn FnOnce() + Send>;

/// Aggregate progress of a [`Coordinator`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Patches are known but [`Coordinator::place`] has not subscribed yet
    Collecting,
    /// Waiting for the loader to report pending images
    Watching,
    /// Nothing is pending, the load subscription is being released off the callback stack
    Draining,
    /// The subscription is gone and shutdown has been handed to its own thread
    Done,
}

/// Failures that abort [`Coordinator::place`]
#[derive(Debug, Error)]
pub enum PlaceError {
    /// A patch for an already mapped image failed
    #[error("patch from {origin} could not be applied: {source}")]
    Apply {
        /// Provenance of the failing patch
        origin: String,
        /// Why it failed
        #[source]
        source: ApplyError,
    },
    /// Two patches write to the same bytes
    #[error("patches from {first} and {second} write to overlapping bytes")]
    Overlap {
        /// Provenance of the earlier patch
        first: String,
        /// Provenance of the later patch
        second: String,
    },
    /// Load notifications could not be set up
    #[error("failed to watch for image loads: {0}")]
    Subscribe(#[from] ObserverError),
    /// `place` already ran
    #[error("patches have already been placed")]
    AlreadyPlaced,
}

/// Everything guarded by the coordinator lock
struct State<S> {
    /// Patches not yet applied, in declaration order
    pending: Vec<PatchDescriptor>,
    /// Aggregate progress
    phase: Phase,
    /// Live load subscription, if any
    subscription: Option<S>,
    /// Taken exactly once, on completion
    shutdown: Option<ShutdownAction>,
}

/// State shared between the coordinator and its load handler
struct Shared<S> {
    /// Pending set and lifecycle, serialized for the startup pass and load callbacks
    state: Mutex<State<S>>,
    /// Applies individual patches
    patcher: Patcher,
    /// Sink for coordinator diagnostics
    logger: SharedLogger,
}

/// Drives a list of patches from parsed to applied
pub struct Coordinator<L: Loader> {
    /// Image lookup and load notifications
    loader: L,
    /// Shared with the load handler through a weak reference
    shared: Arc<Shared<L::Subscription>>,
}

impl<L: Loader> Coordinator<L> {
    /// Creates a coordinator for `patches`, in the order they should be applied.
    ///
    /// Nothing is applied until [`Coordinator::place`] is called.
    pub fn new(
        loader: L,
        patches: Vec<PatchDescriptor>,
        logger: SharedLogger,
        shutdown: ShutdownAction,
    ) -> Self {
        let shared = Shared {
            state: Mutex::new(State {
                pending: patches,
                phase: Phase::Collecting,
                subscription: None,
                shutdown: Some(shutdown),
            }),
            patcher: Patcher::new(logger.clone()),
            logger,
        };

        Self {
            loader,
            shared: Arc::new(shared),
        }
    }

    /// Applies every patch whose image is already mapped and subscribes to load notifications for the rest.
    ///
    /// Unbound patches are applied without an image. If nothing is left pending, shutdown is dispatched right away.
    /// Once subscribed, the mapped images are checked a second time for anything that finished loading in between.
    /// A failure in that pass is returned too, with the subscription kept for the patches still pending.
    ///
    /// # Safety
    ///
    /// Every patch must describe memory that is valid to read and write once its image is mapped,
    /// both now and from the loader's callback thread later.
    pub unsafe fn place(&self) -> Result<(), PlaceError> {
        let mut state = self.shared.lock();
        if state.phase != Phase::Collecting {
            return Err(PlaceError::AlreadyPlaced);
        }

        if let Some((first, second)) = find_overlap(&state.pending) {
            let (first, second) = (state.pending[first].origin(), state.pending[second].origin());
            self.shared.logger.error(&format!(
                "Patches from {first} and {second} write to overlapping bytes"
            ));
            return Err(PlaceError::Overlap { first, second });
        }

        // nothing can call back yet, so looking up under the lock is fine
        self.apply_mapped(&mut state, |target| self.resolve(target))?;

        if state.pending.is_empty() {
            self.shared.complete(&mut state);
            return Ok(());
        }
        self.shared.logger.info(&format!(
            "{} patches waiting for their image to load",
            state.pending.len()
        ));

        // the loader may hold its own lock while calling back, so never subscribe under ours
        drop(state);
        let weak = Arc::downgrade(&self.shared);
        let subscription = match self.loader.subscribe(Shared::handler(weak)) {
            Ok(subscription) => subscription,
            Err(error) => {
                self.shared.logger.error(&format!("{error}"));
                return Err(error.into());
            }
        };

        let mut state = self.shared.lock();
        if matches!(state.phase, Phase::Draining | Phase::Done) {
            // everything loaded between subscribing and relocking
            drop(state);
            drop(subscription);
            return Ok(());
        }
        state.phase = Phase::Watching;
        state.subscription = Some(subscription);

        // images mapped after the first pass but before the subscription existed are never reported
        let targets = state
            .pending
            .iter()
            .map(|patch| patch.target.clone())
            .collect::<Vec<_>>();
        drop(state);
        let bases = targets
            .into_iter()
            .filter_map(|target| {
                let base = self.resolve(&target)?;
                Some((target, base))
            })
            .collect::<Vec<_>>();

        let mut state = self.shared.lock();
        self.apply_mapped(&mut state, |target| {
            bases
                .iter()
                .find(|(mapped, _)| mapped == target)
                .map(|&(_, base)| base)
        })?;
        self.shared.complete(&mut state);
        Ok(())
    }

    /// Base to apply a patch for `target` against: null when unbound, `None` while the image is not mapped
    fn resolve(&self, target: &Target) -> Option<*mut u8> {
        match target {
            Target::Unbound => Some(ptr::null_mut()),
            Target::Host => self.loader.host_image().map(NonNull::as_ptr),
            Target::Image(name) => self.loader.find_image(name).map(NonNull::as_ptr),
        }
    }

    /// Applies every pending patch whose base `resolve` knows, in declaration order.
    ///
    /// Stops at the first failure. Patches applied before it are removed from the pending set either way.
    ///
    /// # Safety
    ///
    /// Same contract as [`Coordinator::place`]
    unsafe fn apply_mapped(
        &self,
        state: &mut State<L::Subscription>,
        resolve: impl Fn(&Target) -> Option<*mut u8>,
    ) -> Result<(), PlaceError> {
        let mut applied = vec![false; state.pending.len()];
        let mut failure = None;
        for (index, patch) in state.pending.iter().enumerate() {
            let base = match resolve(&patch.target) {
                Some(base) => base,
                None => continue,
            };
            if !base.is_null() {
                tracing::debug!(
                    target: "modpatch",
                    "Target module '{}' resolved to address 0x{:X}",
                    patch.target,
                    base as usize
                );
            }

            if let Err(source) = self.shared.patcher.apply(base, patch) {
                failure = Some(PlaceError::Apply {
                    origin: patch.origin(),
                    source,
                });
                break;
            }
            applied[index] = true;
        }

        remove_applied(&mut state.pending, &applied);
        failure.map_or(Ok(()), Err)
    }

    /// Number of patches not yet applied
    pub fn pending_patches(&self) -> usize {
        self.shared.lock().pending.len()
    }

    /// Copies of the patches not yet applied, in declaration order
    pub fn pending(&self) -> Vec<PatchDescriptor> {
        self.shared.lock().pending.clone()
    }

    /// Whether every patch has been applied
    pub fn all_patches_applied(&self) -> bool {
        self.shared.lock().pending.is_empty()
    }

    /// Current aggregate progress
    pub fn phase(&self) -> Phase {
        self.shared.lock().phase
    }
}

impl<S: Send + 'static> Shared<S> {
    /// Locks the state. Patch application never panics midway through an update, so poisoning is ignored
    fn lock(&self) -> MutexGuard<'_, State<S>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Builds the load handler. It only holds a weak reference so dropping the coordinator releases the subscription
    fn handler(shared: Weak<Self>) -> LoadHandler {
        Arc::new(move |event: &LoadEvent<'_>| {
            if let Some(shared) = shared.upgrade() {
                // the loader only reports images it has finished mapping
                unsafe { shared.on_load(event) };
            }
        })
    }

    /// Applies the pending patches for a freshly loaded image, stopping at the first failure
    ///
    /// # Safety
    ///
    /// `event.base` must be the base of the mapped image named `event.name`
    unsafe fn on_load(self: &Arc<Self>, event: &LoadEvent<'_>) {
        let mut state = self.lock();
        if !state
            .pending
            .iter()
            .any(|patch| patch.target.matches(event.name))
        {
            return;
        }

        self.logger.info(&format!(
            "Loaded target file '{}' at address 0x{:X}",
            event.name, event.base as usize
        ));

        let mut applied = vec![false; state.pending.len()];
        for (index, patch) in state.pending.iter().enumerate() {
            if !patch.target.matches(event.name) {
                continue;
            }
            if self.patcher.apply(event.base, patch).is_err() {
                break;
            }
            applied[index] = true;
        }

        remove_applied(&mut state.pending, &applied);
        self.complete(&mut state);
    }

    /// Releases the subscription and dispatches shutdown once nothing is pending.
    ///
    /// The phase stays [`Phase::Draining`] until the shutdown thread has dropped the subscription.
    fn complete(self: &Arc<Self>, state: &mut State<S>) {
        if !state.pending.is_empty() || matches!(state.phase, Phase::Draining | Phase::Done) {
            return;
        }

        self.logger
            .info("All patches applied, unloading from process...");
        state.phase = Phase::Draining;

        let subscription = state.subscription.take();
        let shutdown = state.shutdown.take();
        let shared = Arc::downgrade(self);
        let spawned = thread::Builder::new()
            .name("modpatch-shutdown".into())
            .spawn(move || {
                drop(subscription);
                if let Some(shared) = shared.upgrade() {
                    shared.lock().phase = Phase::Done;
                }
                if let Some(shutdown) = shutdown {
                    shutdown();
                }
            });
        if let Err(error) = spawned {
            self.logger
                .error(&format!("Failed to start the shutdown thread: {error}"));
            state.phase = Phase::Done;
        }
    }
}

/// Drops every patch flagged in `applied`, keeping the rest in order
fn remove_applied(pending: &mut Vec<PatchDescriptor>, applied: &[bool]) {
    let mut flags = applied.iter();
    pending.retain(|_| !flags.next().copied().unwrap_or(false));
}
