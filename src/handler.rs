use crate::dispatch::Dispatcher;
use crate::payload::{self, ParseOutcome, RejectReason};
use crate::storage::{ImageStore, PersistError};
use crate::types::{NotificationEvent, StoredImage};
use bytes::Bytes;
use chrono::Utc;
use log::{error, info, warn};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;

/// `{"Result": true}`. Anything else makes the camera retry the notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Ack {
    #[serde(rename = "Result")]
    pub result: bool,
}

impl Ack {
    pub const OK: Ack = Ack { result: true };
}

#[derive(Debug)]
pub enum Outcome {
    Rejected(RejectReason),
    PersistFailed(PersistError),
    /// Saved and handed to `subscribers` subscribers.
    Published {
        image: StoredImage,
        subscribers: usize,
    },
}

/// Counts notifications being processed and image writes not yet finished.
#[derive(Clone)]
pub struct InFlight {
    count: Arc<watch::Sender<usize>>,
}

pub struct InFlightGuard {
    count: Arc<watch::Sender<usize>>,
}

impl InFlight {
    fn new() -> Self {
        let (count, _) = watch::channel(0);
        Self {
            count: Arc::new(count),
        }
    }

    pub fn enter(&self) -> InFlightGuard {
        self.count.send_modify(|n| *n += 1);
        InFlightGuard {
            count: self.count.clone(),
        }
    }

    pub fn len(&self) -> usize {
        *self.count.borrow()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolves once nothing is in flight.
    pub async fn drained(&self) {
        let mut count = self.count.subscribe();
        loop {
            let idle = *count.borrow_and_update() == 0;
            if idle || count.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.count.send_modify(|n| *n -= 1);
    }
}

/// Parses, stores and publishes notifications. Cheap to clone.
#[derive(Clone)]
pub struct NotificationHandler {
    store: Arc<ImageStore>,
    dispatcher: Dispatcher,
    in_flight: InFlight,
}

impl NotificationHandler {
    pub fn new(store: ImageStore, dispatcher: Dispatcher) -> Self {
        Self {
            store: Arc::new(store),
            dispatcher,
            in_flight: InFlight::new(),
        }
    }

    pub fn in_flight(&self) -> &InFlight {
        &self.in_flight
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn store(&self) -> &ImageStore {
        &self.store
    }

    pub async fn handle(
        &self,
        action: &str,
        remote_address: &str,
        content_type: Option<&str>,
        body: Bytes,
    ) -> Ack {
        let _ = self
            .process(action, remote_address, content_type, body)
            .await;
        Ack::OK
    }

    /// For requests whose body never arrived in full (too large, connection
    /// dropped). Still acknowledged so the camera moves on.
    pub fn handle_unreadable(
        &self,
        action: &str,
        remote_address: &str,
        reason: &dyn std::fmt::Display,
    ) -> Ack {
        warn!(
            "Nothing to save: {}. action={} ip={}",
            reason, action, remote_address
        );
        Ack::OK
    }

    /// Returns once the image has been written or failed to be. Dropping the
    /// future abandons the notification, but a write already started still
    /// finishes and stays counted in `in_flight`.
    pub async fn process(
        &self,
        action: &str,
        remote_address: &str,
        content_type: Option<&str>,
        body: Bytes,
    ) -> Outcome {
        let _processing = self.in_flight.enter();
        let received_at = Utc::now();
        let envelope = match payload::parse(action, remote_address, content_type, &body) {
            ParseOutcome::Envelope(envelope) => envelope,
            ParseOutcome::Rejected(reason) => {
                warn!(
                    "Nothing to save: {}. action={} ip={} bytes={}",
                    reason,
                    action,
                    remote_address,
                    body.len()
                );
                return Outcome::Rejected(reason);
            }
        };
        let plate_number = envelope.picture.plate_number().to_string();

        let store = self.store.clone();
        let picture = envelope.picture;
        let writing = self.in_flight.enter();
        let stored = match tokio::task::spawn_blocking(move || {
            let _writing = writing;
            store.store(&picture)
        })
        .await
        {
            Ok(result) => result,
            Err(e) => Err(PersistError::Worker(e.to_string())),
        };
        let image = match stored {
            Ok(image) => image,
            Err(e) => {
                error!(
                    "Failed to save image. action={} ip={} plate={}: {}",
                    envelope.action, envelope.remote_address, plate_number, e
                );
                return Outcome::PersistFailed(e);
            }
        };

        info!(
            "Notification processed. action={} ip={} plate={} file={} size={}",
            envelope.action,
            envelope.remote_address,
            plate_number,
            image.path.display(),
            image.size_bytes
        );
        let subscribers = self.dispatcher.publish(NotificationEvent {
            stored_image: Some(image.clone()),
            plate_number,
            remote_address: envelope.remote_address,
            action: envelope.action,
            received_at,
        });
        Outcome::Published { image, subscribers }
    }
}
