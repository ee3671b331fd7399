use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use flume::{Receiver, Sender, TryRecvError};
use tracing::{debug, info};

use crate::common::{Contact, Id, Record, StoredValue};
use crate::control::{
    Control, GetRequest, GetResult, Info, OperationId, OperationResult, PutReport, PutRequest,
};
use crate::core::activity::{Activity, ActivityEvent};
use crate::DhtError;

#[derive(Debug)]
/// Owns the [Control] on the Dht thread, and routes results back to callers.
pub(crate) struct Actor {
    control: Control,
    receiver: Receiver<ActorMessage>,
    senders: HashMap<OperationId, Vec<ResponseSender>>,
}

/// Why the actor loop stopped.
#[derive(Debug)]
pub(crate) enum Stop {
    /// Every [crate::Dht] handle was dropped.
    Dropped,
    /// Explicit shutdown, acknowledge once the actor is gone.
    Shutdown(Sender<()>),
}

impl Actor {
    pub fn new(control: Control, receiver: Receiver<ActorMessage>) -> Self {
        info!(id = ?control.id(), address = ?control.address(), "DHT node running");

        Self {
            control,
            receiver,
            senders: HashMap::new(),
        }
    }

    /// Handle pending messages and advance the [Control] by one tick.
    ///
    /// Returns an error once the actor should stop.
    pub fn tick(&mut self) -> Result<(), Stop> {
        loop {
            match self.receiver.try_recv() {
                Ok(ActorMessage::Shutdown(sender)) => return Err(Stop::Shutdown(sender)),
                Ok(message) => self.handle_message(message),
                Err(TryRecvError::Disconnected) => {
                    // Node was dropped, kill this thread.
                    debug!("dht_control::Dht's actor thread was shutdown after Drop.");
                    return Err(Stop::Dropped);
                }
                Err(TryRecvError::Empty) => break,
            }
        }

        let report = self.control.tick();

        for (id, result) in report.done {
            if let Some(senders) = self.senders.remove(&id) {
                for sender in senders {
                    send(&sender, result.clone());
                }
            }
        }

        Ok(())
    }

    fn handle_message(&mut self, message: ActorMessage) {
        match message {
            ActorMessage::Info(sender) => {
                let _ = sender.send(self.control.info());
            }
            ActorMessage::Seed(full_wait, sender) => match self.control.seed() {
                Some(id) if full_wait => self.register(id, ResponseSender::Seed(sender)),
                _ => {
                    let _ = sender.send(self.control.is_seeded());
                }
            },
            ActorMessage::Lookup(target, description, timeout, sender) => {
                let id = self.control.lookup(target, &description, timeout);
                self.register(id, ResponseSender::Lookup(sender));
            }
            ActorMessage::LookupEncoded(key, description, timeout, sender) => {
                match self.control.lookup_encoded(&key, &description, timeout) {
                    Ok(id) => self.register(id, ResponseSender::Lookup(sender)),
                    Err(error) => {
                        let _ = sender.send(Err(error));
                    }
                }
            }
            ActorMessage::Get(request, sender) => match self.control.get(request) {
                Ok(id) => self.register(id, ResponseSender::Get(sender)),
                Err(error) => {
                    let _ = sender.send(Err(error));
                }
            },
            ActorMessage::Put(request, sender) => match self.control.put(request) {
                Ok(id) => self.register(id, ResponseSender::Put(sender)),
                Err(error) => {
                    let _ = sender.send(Err(error));
                }
            },
            ActorMessage::Remove(key, description, contacts, sender) => {
                let started = match contacts {
                    Some(contacts) => self.control.remove_from(contacts, &key, &description),
                    None => self.control.remove(&key, &description),
                };

                match started {
                    Ok(id) => self.register(id, ResponseSender::Put(sender)),
                    Err(error) => {
                        let _ = sender.send(Err(error));
                    }
                }
            }
            ActorMessage::Verify(contact, direct, sender) => {
                let id = self.control.verify_contact(contact, direct);
                self.register(id, ResponseSender::Verify(sender));
            }
            ActorMessage::IsDiversified(key, sender) => {
                let _ = sender.send(self.control.is_diversified(&key));
            }
            ActorMessage::SetSuspended(suspended) => self.control.set_suspended(suspended),
            ActorMessage::SetSleeping(sleeping) => self.control.set_sleeping(sleeping),
            ActorMessage::ExportState(max, sender) => {
                let _ = sender.send(self.control.export_state(max).map(Bytes::from));
            }
            ActorMessage::ImportState(bytes, sender) => {
                let _ = sender.send(self.control.import_state(&bytes));
            }
            ActorMessage::LocalValue(key, sender) => {
                let _ = sender.send(self.control.local_value(&key));
            }
            ActorMessage::StoredValues(sender) => {
                let _ = sender.send(self.control.stored_values());
            }
            ActorMessage::Contacts(sender) => {
                let _ = sender.send(self.control.contacts());
            }
            ActorMessage::Activities(sender) => {
                let _ = sender.send(self.control.activities());
            }
            ActorMessage::SubscribeActivities(sender) => {
                self.control.subscribe_activities(sender);
            }
            ActorMessage::Shutdown(_) => {}
        }
    }

    fn register(&mut self, id: OperationId, sender: ResponseSender) {
        self.senders.entry(id).or_default().push(sender);
    }
}

fn send(sender: &ResponseSender, result: OperationResult) {
    match (sender, result) {
        (ResponseSender::Lookup(s), OperationResult::Lookup(r)) => {
            let _ = s.send(r);
        }
        (ResponseSender::Get(s), OperationResult::Get(r)) => {
            let _ = s.send(r);
        }
        (ResponseSender::Put(s), OperationResult::Put(r) | OperationResult::Remove(r)) => {
            let _ = s.send(r);
        }
        (ResponseSender::Verify(s), OperationResult::Verify(r))
        | (ResponseSender::Seed(s), OperationResult::Seed(r)) => {
            let _ = s.send(r);
        }
        _ => {}
    }
}

#[derive(Debug)]
pub(crate) enum ActorMessage {
    Info(Sender<Info>),
    Seed(bool, Sender<bool>),
    Lookup(
        Id,
        String,
        Option<Duration>,
        Sender<Result<Vec<Contact>, DhtError>>,
    ),
    LookupEncoded(
        Bytes,
        String,
        Option<Duration>,
        Sender<Result<Vec<Contact>, DhtError>>,
    ),
    Get(GetRequest, Sender<Result<GetResult, DhtError>>),
    Put(PutRequest, Sender<Result<PutReport, DhtError>>),
    Remove(
        Bytes,
        String,
        Option<Vec<Contact>>,
        Sender<Result<PutReport, DhtError>>,
    ),
    Verify(Contact, bool, Sender<bool>),
    IsDiversified(Bytes, Sender<bool>),
    SetSuspended(bool),
    SetSleeping(bool),
    ExportState(usize, Sender<Result<Bytes, DhtError>>),
    ImportState(Bytes, Sender<Result<usize, DhtError>>),
    LocalValue(Bytes, Sender<Option<Record>>),
    StoredValues(Sender<Vec<(Id, Vec<StoredValue>)>>),
    Contacts(Sender<Vec<Contact>>),
    Activities(Sender<Vec<Activity>>),
    SubscribeActivities(Sender<ActivityEvent>),
    Shutdown(Sender<()>),
}

#[derive(Debug, Clone)]
pub(crate) enum ResponseSender {
    Lookup(Sender<Result<Vec<Contact>, DhtError>>),
    Get(Sender<Result<GetResult, DhtError>>),
    /// Puts and removes.
    Put(Sender<Result<PutReport, DhtError>>),
    Verify(Sender<bool>),
    Seed(Sender<bool>),
}
