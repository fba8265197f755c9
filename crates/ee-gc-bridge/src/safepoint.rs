//! Forcing cooperative threads to a safe point
//!
//! On a real platform a hijack stops the OS thread, inspects its registers and
//! rewrites its return address. Everything the coordinator needs from that is
//! captured by [`SafepointCapability`], so the suspension loop itself stays
//! platform independent.

use crate::thread::ThreadRecord;

/// Outcome of one check-in request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Checkin {
    /// The thread's state was reportable and a redirect is in place; the thread
    /// will go preemptive and report in before running more of its own code
    Reportable,
    /// The thread was caught somewhere unreportable (e.g. mid kernel
    /// transition); resume it and try again later
    NotYetSafe,
}

/// Platform hook used by the suspension coordinator
pub trait SafepointCapability: Send + Sync {
    /// Ask a cooperative thread to check in at its next safe point
    fn request_cooperative_checkin(&self, thread: &ThreadRecord) -> Checkin;

    /// Undo any redirect planted for `thread`; called for every thread at restart
    fn release(&self, thread: &ThreadRecord) {
        thread.clear_hijack();
    }
}

/// Portable capability: a flag the thread consumes at its next poll.
///
/// Threads inside a non-reportable region are reported as `NotYetSafe`.
#[derive(Debug, Default, Clone, Copy)]
pub struct PollingHijack;

impl SafepointCapability for PollingHijack {
    fn request_cooperative_checkin(&self, thread: &ThreadRecord) -> Checkin {
        if thread.in_non_reportable_region() {
            tracing::trace!(target: "ee_gc::suspend", id = thread.id(), "thread not at a reportable point");
            return Checkin::NotYetSafe;
        }
        thread.plant_hijack();
        Checkin::Reportable
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_polling_hijack_plants_and_releases() {
        let rec = ThreadRecord::new(7, std::thread::current().id(), None, false);
        let cap = PollingHijack;
        assert_eq!(cap.request_cooperative_checkin(&rec), Checkin::Reportable);
        assert!(rec.is_hijacked());
        cap.release(&rec);
        assert!(!rec.is_hijacked());
    }

    #[test]
    fn test_non_reportable_region_defers_hijack() {
        let rec = ThreadRecord::new(7, std::thread::current().id(), None, false);
        rec.enter_non_reportable();
        assert_eq!(PollingHijack.request_cooperative_checkin(&rec), Checkin::NotYetSafe);
        assert!(!rec.is_hijacked());
        rec.leave_non_reportable();
        assert_eq!(PollingHijack.request_cooperative_checkin(&rec), Checkin::Reportable);
    }
}
