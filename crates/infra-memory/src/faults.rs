// Fault injection for broker operations

use burrow_core::port::BrokerError;
use std::collections::HashMap;

/// Broker operation a fault can be injected into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    NewConnection,
    CreateChannel,
    QueueDeclare,
    Publish,
    Consume,
    Ack,
    Nack,
    Cancel,
    CloseChannel,
    CloseConnection,
}

/// Pending failures, consumed one per matching call
#[derive(Debug, Default)]
pub(crate) struct FaultPlan {
    pending: HashMap<Operation, u32>,
}

impl FaultPlan {
    pub(crate) fn fail_next(&mut self, operation: Operation, times: u32) {
        *self.pending.entry(operation).or_insert(0) += times;
    }

    pub(crate) fn clear(&mut self) {
        self.pending.clear();
    }

    pub(crate) fn check(&mut self, operation: Operation) -> Result<(), BrokerError> {
        match self.pending.get_mut(&operation) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Err(injected_error(operation))
            }
            _ => Ok(()),
        }
    }
}

fn injected_error(operation: Operation) -> BrokerError {
    match operation {
        Operation::NewConnection => {
            BrokerError::ConnectionFailed("injected fault: connection refused".to_string())
        }
        other => BrokerError::Io(format!("injected fault on {:?}", other)),
    }
}
