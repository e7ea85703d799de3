#![allow(clippy::declare_interior_mutable_const)] // Usage is legit in this module.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// The maximum supported number of endpoints.
///
/// Endpoint 0, plus fifteen more. Any endpoints allocated beyond this
/// are wasted.
pub const MAX_ENDPOINTS: usize = 16;

/// Per-endpoint event counters.
///
/// Each driver needs an `EndpointEvents`. Allocate a `static` object
/// and supply it to the driver constructor. Make sure that the events
/// are not shared across drivers; otherwise, the driver constructor
/// panics.
///
/// ```
/// use usbd_fifo::EndpointEvents;
///
/// static EP_EVENTS: EndpointEvents = EndpointEvents::max_endpoints();
/// ```
///
/// If you know that you can use fewer endpoints, you can control the
/// memory utilization with the const generic `COUNT`. Endpoint `n` is
/// usable only if `n < COUNT`.
///
/// ```
/// use usbd_fifo::EndpointEvents;
///
/// static EP_EVENTS: EndpointEvents<4> = EndpointEvents::new();
/// ```
///
/// The interrupt handler is the only writer of the signaled counts, and
/// foreground code is the only writer of the consumed counts. Pending
/// events are the difference between the two.
pub struct EndpointEvents<const COUNT: usize = MAX_ENDPOINTS> {
    signaled: [AtomicU32; COUNT],
    consumed: [AtomicU32; COUNT],
    taken: AtomicBool,
}

impl EndpointEvents<MAX_ENDPOINTS> {
    /// Allocate counters for the maximum number of endpoints.
    pub const fn max_endpoints() -> Self {
        Self::new()
    }
}

impl<const COUNT: usize> EndpointEvents<COUNT> {
    /// Allocate counters for `COUNT` endpoints.
    pub const fn new() -> Self {
        const ZERO: AtomicU32 = AtomicU32::new(0);
        Self {
            signaled: [ZERO; COUNT],
            consumed: [ZERO; COUNT],
            taken: AtomicBool::new(false),
        }
    }

    /// Returns the number of events that are signaled, but not yet
    /// consumed, for endpoint `ep`.
    ///
    /// Safe to call from any context. Returns zero for out-of-range
    /// endpoints.
    pub fn pending(&self, ep: usize) -> u32 {
        self.events().pending(ep)
    }

    fn events(&self) -> Events<'_> {
        let len = COUNT.min(MAX_ENDPOINTS);
        Events {
            signaled: &self.signaled[..len],
            consumed: &self.consumed[..len],
        }
    }

    /// Acquire the counters.
    ///
    /// Returns `None` if the counters were already taken.
    pub(crate) fn take(&self) -> Option<Events<'_>> {
        (!self.taken.swap(true, Ordering::SeqCst)).then(|| self.events())
    }
}

/// A handle on the endpoint counters.
pub(crate) struct Events<'a> {
    signaled: &'a [AtomicU32],
    consumed: &'a [AtomicU32],
}

impl Events<'_> {
    /// Returns the total number of endpoints that have counters.
    pub fn capacity(&self) -> usize {
        self.signaled.len()
    }

    /// Record one event. Interrupt context only.
    pub fn signal(&self, ep: usize) {
        if let Some(signaled) = self.signaled.get(ep) {
            signaled.fetch_add(1, Ordering::Release);
        }
    }

    pub fn pending(&self, ep: usize) -> u32 {
        match (self.signaled.get(ep), self.consumed.get(ep)) {
            (Some(signaled), Some(consumed)) => signaled
                .load(Ordering::Acquire)
                .wrapping_sub(consumed.load(Ordering::Acquire)),
            _ => 0,
        }
    }

    /// Consume every pending event, returning how many there were.
    /// Foreground context only.
    pub fn take_all(&self, ep: usize) -> u32 {
        match (self.signaled.get(ep), self.consumed.get(ep)) {
            (Some(signaled), Some(consumed)) => {
                let signaled = signaled.load(Ordering::Acquire);
                let pending = signaled.wrapping_sub(consumed.load(Ordering::Relaxed));
                consumed.store(signaled, Ordering::Release);
                pending
            }
            _ => 0,
        }
    }
}
