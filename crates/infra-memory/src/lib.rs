// Burrow Infrastructure - In-memory Broker Adapter
// Implements: ConnectionFactory, Connection, Channel (default exchange, manual ack, DLX)

mod broker;
mod channel;
mod connection;
mod dispatch;
mod faults;
mod queue;
mod shutdown;

pub use broker::MemoryBroker;
pub use faults::Operation;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Broker state stays usable even if a holder panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
