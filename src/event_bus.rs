use crate::appointment::AppointmentId;
use tokio::sync::broadcast::{error::SendError, Receiver, Sender};

/// The four outcomes a Responder intent can reach, broadcast so any
/// component (tests, metrics, the Watcher) can observe final disposition
/// without coupling to the dispatcher's internals.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    ResponseSent {
        id: AppointmentId,
    },
    ResponseConfirmed {
        id: AppointmentId,
    },
    AttemptFailed {
        id: AppointmentId,
        attempt: u32,
    },
    ResponseFailed {
        id: AppointmentId,
    },
}

pub struct EventBus {
    sender: Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(capacity);
        Self { sender }
    }

    pub fn publish(&self, event: Event) -> Result<(), SendError<Event>> {
        self.sender.send(event)?;
        Ok(())
    }

    pub fn subscribe(&self) -> Receiver<Event> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::appointment::Locator;
    use ethers::types::{Address, U256};

    fn sample_id() -> AppointmentId {
        AppointmentId::new(
            Locator::new(U256::from(1), Address::zero()),
            1,
        )
    }

    #[test]
    fn subscribers_see_published_events() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        bus.publish(Event::ResponseSent { id: sample_id() }).unwrap();
        let event = rx.try_recv().unwrap();
        assert_eq!(event, Event::ResponseSent { id: sample_id() });
    }
}
