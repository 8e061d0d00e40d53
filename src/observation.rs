//! Observe subscriptions
//!
//! The first reply to an Observe request both acknowledges the subscription and
//! carries the current value: that value goes back to the caller of
//! [`ObservationManager::observe`], exactly once. Every later notification on
//! the stream goes to the subscription's handler.

use crate::codec::{self, Content};
use crate::coap_types::{Response, ResponseCode};
use crate::device_management::{DeviceChannel, DeviceManager};
use crate::error::{Lwm2mError, Result};
use crate::queue::Execute;
use crate::request_builder::process_response;
use crate::transport::{Exchange, ObserveStream};
use crate::types::{DeviceId, Operation, OperationKind, ResourcePath, SubscriptionId};
use futures::FutureExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// A value pushed by a device on an active subscription
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub subscription: SubscriptionId,
    pub content: Content,
    /// Observe sequence number, when the device sent one
    pub sequence: Option<u32>,
}

/// Receives notifications of one subscription
pub type NotificationHandler = Arc<dyn Fn(Notification) + Send + Sync>;

/// Snapshot of a live subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionInfo {
    pub id: SubscriptionId,
    pub device_id: DeviceId,
    pub path: ResourcePath,
}

struct Subscription {
    generation: u64,
    cancel: Option<oneshot::Sender<()>>,
    pump: Option<JoinHandle<()>>,
}

impl Subscription {
    /// Release the stream; later calls do nothing
    fn close(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

type SubscriptionTable = Arc<Mutex<HashMap<SubscriptionId, Subscription>>>;

/// Live Observe subscriptions, one per (device, resource)
#[derive(Clone)]
pub struct ObservationManager {
    devices: DeviceManager,
    subscriptions: SubscriptionTable,
    generation: Arc<AtomicU64>,
}

fn lock_table(table: &SubscriptionTable) -> MutexGuard<'_, HashMap<SubscriptionId, Subscription>> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

fn observation_error(response: &Response, operation: &Operation) -> Lwm2mError {
    match response.code {
        ResponseCode::NotFound => {
            let reason = String::from_utf8_lossy(&response.payload);
            if reason.is_empty() {
                Lwm2mError::ObservationFailed(operation.path.to_string())
            } else {
                Lwm2mError::ObservationFailed(reason.into_owned())
            }
        }
        code => Lwm2mError::ClientError(code),
    }
}

impl ObservationManager {
    pub fn new(devices: DeviceManager) -> Self {
        Self {
            devices,
            subscriptions: Arc::new(Mutex::new(HashMap::new())),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Subscribe to `/objectId/instanceId/resourceId` and return its current value
    ///
    /// Later values are passed to `handler`. A queue-mode device gets the
    /// request on its next wake-up: the call returns `RequestInQueue` and the
    /// first value reaches the deferred handler instead.
    pub async fn observe(
        &self,
        device_id: DeviceId,
        object_id: u16,
        instance_id: u16,
        resource_id: u16,
        handler: impl Fn(Notification) + Send + Sync + 'static,
    ) -> Result<Content> {
        let path = ResourcePath::resource(object_id, instance_id, resource_id);
        let operation = Operation::new(OperationKind::Observe, device_id, path);
        let handler: NotificationHandler = Arc::new(handler);
        let manager = self.clone();
        let channel = self.devices.channel().clone();

        let execute: Execute = Box::new(move || {
            async move { manager.start(&channel, operation, handler).await }.boxed()
        });
        self.devices.dispatch(operation, execute).await
    }

    async fn start(
        &self,
        channel: &DeviceChannel,
        operation: Operation,
        handler: NotificationHandler,
    ) -> Result<Content> {
        let exchange = channel
            .send(&operation, |builder, device| {
                builder.observe(device, &operation.path)
            })
            .await?;

        match exchange {
            Exchange::Response(response) if response.code == ResponseCode::Content => {
                tracing::warn!(
                    device_id = operation.device_id,
                    path = %operation.path,
                    "Reply without Observe option, no subscription registered"
                );
                process_response(&response, ResponseCode::Content, &operation)
            }
            Exchange::Response(response) => Err(observation_error(&response, &operation)),
            Exchange::Observe(mut stream) => {
                if stream.first.code != ResponseCode::Content {
                    stream.close();
                    return Err(observation_error(&stream.first, &operation));
                }
                match process_response(&stream.first, ResponseCode::Content, &operation) {
                    Ok(first) => {
                        self.activate(operation, stream, handler);
                        Ok(first)
                    }
                    Err(e) => {
                        stream.close();
                        Err(e)
                    }
                }
            }
        }
    }

    /// Register the subscription and route every later notification to `handler`
    fn activate(&self, operation: Operation, stream: ObserveStream, handler: NotificationHandler) {
        let id = SubscriptionId::new(operation.device_id, operation.path);
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let (_, mut notifications, cancel) = stream.into_parts();
        let table = self.subscriptions.clone();

        let mut subscriptions = lock_table(&self.subscriptions);
        if let Some(mut previous) = subscriptions.remove(&id) {
            tracing::debug!(subscription = %id, "Replacing existing subscription");
            previous.close();
        }

        let pump = tokio::spawn(async move {
            while let Some(response) = notifications.recv().await {
                if !response.code.is_success() {
                    tracing::debug!(subscription = %id, code = %response.code, "Device ended the observation");
                    break;
                }
                let format = response.content_format.unwrap_or_default();
                match codec::decode(format, &response.payload) {
                    Ok(content) => handler(Notification {
                        subscription: id,
                        content,
                        sequence: response.observe,
                    }),
                    Err(e) => {
                        tracing::warn!(subscription = %id, error = %e, "Skipping undecodable notification")
                    }
                }
            }

            let mut subscriptions = lock_table(&table);
            if subscriptions
                .get(&id)
                .is_some_and(|current| current.generation == generation)
            {
                subscriptions.remove(&id);
                tracing::debug!(subscription = %id, "Observe stream finished");
            }
        });

        subscriptions.insert(
            id,
            Subscription {
                generation,
                cancel,
                pump: Some(pump),
            },
        );
        tracing::info!(subscription = %id, "Subscription active");
    }

    /// Cancel a live subscription
    pub fn cancel(&self, id: &SubscriptionId) -> Result<()> {
        let mut subscription = lock_table(&self.subscriptions)
            .remove(id)
            .ok_or_else(|| Lwm2mError::SubscriptionNotFound(id.to_string()))?;
        subscription.close();
        tracing::debug!(subscription = %id, "Subscription cancelled");
        Ok(())
    }

    /// Snapshot of every live subscription, ordered by id
    pub fn list(&self) -> Vec<SubscriptionInfo> {
        let mut list: Vec<SubscriptionInfo> = lock_table(&self.subscriptions)
            .keys()
            .map(|id| SubscriptionInfo {
                id: *id,
                device_id: id.device_id,
                path: id.path,
            })
            .collect();
        list.sort_by_key(|info| info.id);
        list
    }

    /// Snapshot of the live subscriptions of one device
    pub fn list_by_device_id(&self, device_id: DeviceId) -> Vec<SubscriptionInfo> {
        self.list()
            .into_iter()
            .filter(|info| info.device_id == device_id)
            .collect()
    }

    fn close_matching(&self, matches: impl Fn(&SubscriptionId) -> bool) -> usize {
        let mut subscriptions = lock_table(&self.subscriptions);
        let ids: Vec<SubscriptionId> = subscriptions.keys().filter(|id| matches(id)).copied().collect();
        for id in &ids {
            if let Some(mut subscription) = subscriptions.remove(id) {
                subscription.close();
            }
        }
        ids.len()
    }

    /// Close every subscription and stop the registry's lifetime checking
    pub async fn clean(&self) -> usize {
        let closed = self.close_matching(|_| true);
        self.devices
            .channel()
            .registry
            .stop_lifetime_check()
            .await;
        tracing::info!(closed, "All subscriptions closed");
        closed
    }

    /// Close the subscriptions of one device
    pub fn clean_by_device_id(&self, device_id: DeviceId) -> usize {
        self.close_matching(|id| id.device_id == device_id)
    }
}
