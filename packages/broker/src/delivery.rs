//! A message handed to a processor, plus the means to settle it.

use std::sync::atomic::{AtomicBool, Ordering};

use ractor::ActorRef;

use crate::BrokerError;
use crate::memory::BrokerMessage;

pub(crate) enum Acker {
    Memory(ActorRef<BrokerMessage>),
    #[cfg(feature = "amqp")]
    Amqp(lapin::acker::Acker),
}

/// A consumed message.
///
/// A delivery is settled exactly once, either by the processor or by the
/// subscribe worker once the processor returns.
pub struct Delivery {
    delivery_tag: u64,
    redelivered: bool,
    body: Vec<u8>,
    acker: Acker,
    settled: AtomicBool,
}

impl Delivery {
    pub(crate) fn new(delivery_tag: u64, redelivered: bool, body: Vec<u8>, acker: Acker) -> Self {
        Self {
            delivery_tag,
            redelivered,
            body,
            acker,
            settled: AtomicBool::new(false),
        }
    }

    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    /// Whether this message was delivered before and returned to the queue.
    pub fn redelivered(&self) -> bool {
        self.redelivered
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn is_settled(&self) -> bool {
        self.settled.load(Ordering::Acquire)
    }

    fn settle(&self) -> Result<(), BrokerError> {
        if self.settled.swap(true, Ordering::AcqRel) {
            return Err(BrokerError::AlreadySettled(self.delivery_tag));
        }
        Ok(())
    }

    /// Acknowledge the message, removing it from the queue.
    pub async fn ack(&self) -> Result<(), BrokerError> {
        self.settle()?;
        match &self.acker {
            Acker::Memory(broker) => broker
                .send_message(BrokerMessage::Ack {
                    delivery_tag: self.delivery_tag,
                })
                .map_err(|_| BrokerError::ConnectionClosed),
            #[cfg(feature = "amqp")]
            Acker::Amqp(acker) => {
                acker
                    .ack(lapin::options::BasicAckOptions::default())
                    .await?;
                Ok(())
            }
        }
    }

    /// Negatively acknowledge the message. With `requeue` it goes back to
    /// the front of its queue, otherwise it is dropped.
    pub async fn reject(&self, requeue: bool) -> Result<(), BrokerError> {
        self.settle()?;
        match &self.acker {
            Acker::Memory(broker) => broker
                .send_message(BrokerMessage::Reject {
                    delivery_tag: self.delivery_tag,
                    requeue,
                })
                .map_err(|_| BrokerError::ConnectionClosed),
            #[cfg(feature = "amqp")]
            Acker::Amqp(acker) => {
                acker
                    .nack(lapin::options::BasicNackOptions {
                        requeue,
                        ..Default::default()
                    })
                    .await?;
                Ok(())
            }
        }
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("redelivered", &self.redelivered)
            .field("body_len", &self.body.len())
            .field("settled", &self.is_settled())
            .finish()
    }
}
