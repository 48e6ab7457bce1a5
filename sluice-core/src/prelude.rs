//! # Prelude
//!
//! Convenient access to the most commonly used Sluice types.

pub use crate::{
    config::{
        ActionFailurePolicy, ConfigLoader, DeliveryMode, HarnessConfig, SubscriptionType,
    },
    error::{Error, ReceiveDisposition, Result},
    message::{Message, MessageId, TopicDomain, TopicName},
    types::{Sequence, SubscriptionId, Timestamp, WorkerId},
};

pub use bytes::Bytes;
