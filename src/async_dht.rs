//! AsyncDht node.

use std::time::Duration;

use bytes::Bytes;

use crate::actor::ActorMessage;
use crate::common::{Contact, Id, Record};
use crate::control::{GetRequest, GetResult, Info, PutReport, PutRequest};
use crate::core::activity::Activity;
use crate::dht::{Dht, DhtOperationError, DhtWasShutdown};

impl Dht {
    /// Return an async version of the Dht client.
    pub fn as_async(self) -> AsyncDht {
        AsyncDht(self)
    }
}

#[derive(Debug, Clone)]
/// Async version of the Dht node.
pub struct AsyncDht(Dht);

impl AsyncDht {
    /// Returns a reference to the wrapped [Dht].
    pub fn as_sync(&self) -> &Dht {
        &self.0
    }

    // === Getters ===

    /// Information and statistics about this [Dht] node.
    pub async fn info(&self) -> Result<Info, DhtWasShutdown> {
        self.0
            .request(ActorMessage::Info)?
            .recv_async()
            .await
            .map_err(|_| DhtWasShutdown)
    }

    /// Returns true if more than one distinct value was seen under `key`.
    pub async fn is_diversified(&self, key: &[u8]) -> Result<bool, DhtWasShutdown> {
        let key = Bytes::copy_from_slice(key);

        self.0
            .request(|sender| ActorMessage::IsDiversified(key, sender))?
            .recv_async()
            .await
            .map_err(|_| DhtWasShutdown)
    }

    /// The value this node published under `key`, if any.
    pub async fn local_value(&self, key: &[u8]) -> Result<Option<Record>, DhtWasShutdown> {
        let key = Bytes::copy_from_slice(key);

        self.0
            .request(|sender| ActorMessage::LocalValue(key, sender))?
            .recv_async()
            .await
            .map_err(|_| DhtWasShutdown)
    }

    pub async fn contacts(&self) -> Result<Vec<Contact>, DhtWasShutdown> {
        self.0
            .request(ActorMessage::Contacts)?
            .recv_async()
            .await
            .map_err(|_| DhtWasShutdown)
    }

    pub async fn activities(&self) -> Result<Vec<Activity>, DhtWasShutdown> {
        self.0
            .request(ActorMessage::Activities)?
            .recv_async()
            .await
            .map_err(|_| DhtWasShutdown)
    }

    // === Public Methods ===

    /// Shutdown the actor thread loop.
    pub async fn shutdown(&mut self) {
        let (sender, receiver) = flume::bounded::<()>(1);

        let _ = self.0 .0.send(ActorMessage::Shutdown(sender));
        let _ = receiver.recv_async().await;
    }

    /// Populate the router through the bootstrap nodes, see [Dht::seed].
    pub async fn seed(&self, full_wait: bool) -> Result<bool, DhtWasShutdown> {
        self.0
            .request(|sender| ActorMessage::Seed(full_wait, sender))?
            .recv_async()
            .await
            .map_err(|_| DhtWasShutdown)
    }

    pub async fn lookup(
        &self,
        target: Id,
        description: &str,
        timeout: Option<Duration>,
    ) -> Result<Vec<Contact>, DhtOperationError> {
        let description = description.to_string();

        let receiver = self
            .0
            .request(|sender| ActorMessage::Lookup(target, description, timeout, sender))?;

        Ok(receiver.recv_async().await.map_err(|_| DhtWasShutdown)??)
    }

    pub async fn get(&self, request: GetRequest) -> Result<GetResult, DhtOperationError> {
        let receiver = self.0.request(|sender| ActorMessage::Get(request, sender))?;

        Ok(receiver.recv_async().await.map_err(|_| DhtWasShutdown)??)
    }

    pub async fn put(&self, request: PutRequest) -> Result<PutReport, DhtOperationError> {
        let receiver = self.0.request(|sender| ActorMessage::Put(request, sender))?;

        Ok(receiver.recv_async().await.map_err(|_| DhtWasShutdown)??)
    }

    pub async fn remove(&self, key: &[u8], description: &str) -> Result<PutReport, DhtOperationError> {
        let key = Bytes::copy_from_slice(key);
        let description = description.to_string();

        let receiver = self
            .0
            .request(|sender| ActorMessage::Remove(key, description, None, sender))?;

        Ok(receiver.recv_async().await.map_err(|_| DhtWasShutdown)??)
    }

    /// Ping a contact, returns true if it answered.
    pub async fn verify_contact(&self, contact: Contact, direct: bool) -> Result<bool, DhtWasShutdown> {
        self.0
            .request(|sender| ActorMessage::Verify(contact, direct, sender))?
            .recv_async()
            .await
            .map_err(|_| DhtWasShutdown)
    }

    pub async fn export_state(&self, max: usize) -> Result<Bytes, DhtOperationError> {
        let receiver = self.0.request(|sender| ActorMessage::ExportState(max, sender))?;

        Ok(receiver.recv_async().await.map_err(|_| DhtWasShutdown)??)
    }

    pub async fn import_state(&self, bytes: &[u8]) -> Result<usize, DhtOperationError> {
        let bytes = Bytes::copy_from_slice(bytes);

        let receiver = self
            .0
            .request(|sender| ActorMessage::ImportState(bytes, sender))?;

        Ok(receiver.recv_async().await.map_err(|_| DhtWasShutdown)??)
    }
}

#[cfg(test)]
mod test {
    use crate::dht::Testnet;

    use super::*;

    #[test]
    fn shutdown() {
        async fn test() {
            let testnet = Testnet::new(1).unwrap();
            let mut dht = testnet.nodes[0].clone().as_async();

            let a = dht.clone();

            dht.shutdown().await;

            let result = a.get(GetRequest::new("key")).await;

            assert!(matches!(
                result,
                Err(DhtOperationError::Shutdown(DhtWasShutdown))
            ))
        }
        futures::executor::block_on(test());
    }

    #[test]
    fn put_get() {
        async fn test() {
            let testnet = Testnet::new(10).unwrap();

            let a = Dht::builder()
                .bootstrap(&testnet.bootstrap)
                .build(testnet.transport())
                .unwrap()
                .as_async();
            let b = Dht::builder()
                .bootstrap(&testnet.bootstrap)
                .build(testnet.transport())
                .unwrap()
                .as_async();

            assert!(a.seed(true).await.unwrap());
            assert!(b.seed(true).await.unwrap());

            a.put(PutRequest::new("Hello", "World!")).await.unwrap();

            let result = b.get(GetRequest::new("Hello")).await.unwrap();

            assert_eq!(result.values.len(), 1);
            assert_eq!(result.values[0].value, "World!");
        }

        futures::executor::block_on(test());
    }

    #[test]
    fn export_import() {
        async fn test() {
            let testnet = Testnet::new(10).unwrap();

            let a = testnet.nodes[1].clone().as_async();
            let state = a.export_state(32).await.unwrap();

            let b = Dht::builder().build(testnet.transport()).unwrap().as_async();
            assert!(b.import_state(&state).await.unwrap() > 0);

            let contacts = b.lookup(Id::random(), "lookup", None).await.unwrap();
            assert!(!contacts.is_empty());
        }

        futures::executor::block_on(test());
    }
}
