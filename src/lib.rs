#[macro_use]
extern crate failure;

pub mod config;
pub mod dispatch;
pub mod handler;
pub mod payload;
pub mod server;
pub mod storage;
pub mod types;

pub use config::Config;
pub use dispatch::{ChannelSubscriber, Dispatcher, LogSubscriber, Subscriber, SubscriptionHandle};
pub use handler::{Ack, NotificationHandler, Outcome};
pub use server::{Server, ServerError, ServerState, Shutdown};
pub use storage::{ImageStore, PersistError};
pub use types::{NotificationEnvelope, NotificationEvent, Picture, Plate, StoredImage};
