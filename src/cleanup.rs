//! Scoped cleanup coordination
//!
//! One process-wide finaliser stack, installed before any resource is
//! acquired. Engines push a finaliser when they take a lock or author a
//! stage directory and pop it once the resource is gone; on a normal error
//! unwind the owning guard runs the finaliser itself, and on SIGINT/SIGTERM
//! the signal thread drains whatever is still registered, newest first.
//!
//! Finalisers must tolerate partial state: running the stack twice, or
//! running it against already-removed artefacts, is a no-op.

use parking_lot::Mutex;
use signal_hook::consts::signal::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Once, OnceLock};
use tracing::{debug, warn};

type Finalizer = Box<dyn FnOnce() + Send>;

struct Registered {
    id: u64,
    label: String,
    run: Finalizer,
}

static STACK: OnceLock<Mutex<Vec<Registered>>> = OnceLock::new();
static NEXT_ID: AtomicU64 = AtomicU64::new(1);
static SIGNAL_INIT: Once = Once::new();

fn stack() -> &'static Mutex<Vec<Registered>> {
    STACK.get_or_init(|| Mutex::new(Vec::new()))
}

/// Handle for a registered finaliser; used to deregister after the
/// resource has been released on the normal path.
#[derive(Debug)]
pub struct CleanupToken(u64);

/// Push a finaliser onto the stack.
///
/// Finalisers run in LIFO order, so a stage registered after a lock is
/// removed before the lock is released.
pub fn register(label: impl Into<String>, run: impl FnOnce() + Send + 'static) -> CleanupToken {
    let id = NEXT_ID.fetch_add(1, Ordering::SeqCst);
    let label = label.into();
    debug!(id, %label, "registered cleanup finaliser");
    stack().lock().push(Registered {
        id,
        label,
        run: Box::new(run),
    });
    CleanupToken(id)
}

/// Remove a finaliser without running it.
///
/// Safe to call after the stack has already been drained.
pub fn deregister(token: CleanupToken) {
    stack().lock().retain(|r| r.id != token.0);
}

/// Take a finaliser off the stack and run it now.
///
/// Used by guards on their own error paths; a token that is no longer
/// registered (because the signal handler got there first) is a no-op.
pub fn run_now(token: CleanupToken) {
    let entry = {
        let mut entries = stack().lock();
        entries
            .iter()
            .position(|r| r.id == token.0)
            .map(|idx| entries.remove(idx))
    };
    if let Some(entry) = entry {
        debug!(id = entry.id, label = %entry.label, "running cleanup finaliser");
        (entry.run)();
    }
}

/// Drain the whole stack, newest first.
///
/// Idempotent: a second call finds an empty stack and does nothing.
pub fn run_all() {
    loop {
        let entry = stack().lock().pop();
        match entry {
            Some(entry) => {
                debug!(id = entry.id, label = %entry.label, "running cleanup finaliser");
                (entry.run)();
            }
            None => break,
        }
    }
}

/// Install the SIGINT/SIGTERM handler that drains the stack and exits
/// non-zero. Installing more than once is a no-op.
pub fn install_signal_handler() {
    SIGNAL_INIT.call_once(|| {
        std::thread::spawn(|| {
            let mut signals = match Signals::new([SIGINT, SIGTERM]) {
                Ok(signals) => signals,
                Err(err) => {
                    warn!(%err, "signal handler setup failed; cleanup on signal disabled");
                    return;
                }
            };
            if signals.forever().next().is_some() {
                warn!("interrupted; running cleanup");
                run_all();
                std::process::exit(1);
            }
        });
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    // The stack is process-wide, so the whole contract is exercised in a
    // single test to keep parallel test threads from draining each other.
    #[test]
    fn test_finaliser_stack_contract() {
        // LIFO order, and a second drain is a no-op
        let order = Arc::new(Mutex::new(Vec::new()));
        let o1 = Arc::clone(&order);
        let _t1 = register("first", move || o1.lock().push(1));
        let o2 = Arc::clone(&order);
        let _t2 = register("second", move || o2.lock().push(2));
        run_all();
        run_all();
        assert_eq!(*order.lock(), vec![2, 1]);

        // A deregistered finaliser never runs
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let token = register("skipped", move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        deregister(token);
        run_all();
        assert_eq!(count.load(Ordering::SeqCst), 0);

        // run_now consumes its token; draining afterwards must not re-run
        let c = Arc::clone(&count);
        let token = register("eager", move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        run_now(token);
        run_all();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
