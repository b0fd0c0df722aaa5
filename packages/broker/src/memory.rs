//! In-process broker backed by a Ractor actor.
//!
//! All queue state lives inside the actor, so publishers, consumers and
//! acknowledgements are serialized through its mailbox. Only the default
//! exchange (`""`) exists; it routes a message to the queue named by the
//! routing key.

use std::collections::{HashMap, VecDeque};

use ractor::concurrency::JoinHandle;
use ractor::rpc::CallResult;
use ractor::{Actor, ActorProcessingErr, ActorRef, RpcReplyPort};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use ulid::Ulid;

use crate::delivery::{Acker, Delivery};
use crate::subscribe::{Consumer, run_workers};
use crate::{BrokerError, BrokerFuture, MessageBroker, ProcessorFactory};

/// Message as stored in a queue.
#[derive(Debug, Clone)]
pub(crate) struct StoredMessage {
    content_type: String,
    body: Vec<u8>,
    redelivered: bool,
}

/// A message handed out to a consumer.
#[derive(Debug)]
pub(crate) struct Fetched {
    delivery_tag: u64,
    message: StoredMessage,
}

/// Counters for a single queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Messages waiting for a consumer.
    pub ready: usize,
    /// Messages delivered but not yet acknowledged.
    pub unacked: usize,
}

/// Messages for the broker actor.
#[derive(Debug)]
pub(crate) enum BrokerMessage {
    DeclareQueue {
        name: String,
        reply: RpcReplyPort<()>,
    },
    Publish {
        exchange: String,
        routing_key: String,
        message: StoredMessage,
        reply: RpcReplyPort<Result<(), BrokerError>>,
    },
    /// Wait for the next message on a queue.
    Fetch {
        queue: String,
        consumer_tag: String,
        reply: RpcReplyPort<Result<Fetched, BrokerError>>,
    },
    /// A consumer went away; its unacknowledged messages are requeued.
    CancelConsumer {
        consumer_tag: String,
    },
    Ack {
        delivery_tag: u64,
    },
    Reject {
        delivery_tag: u64,
        requeue: bool,
    },
    GetStats {
        queue: String,
        reply: RpcReplyPort<Option<QueueStats>>,
    },
}

struct Waiter {
    consumer_tag: String,
    reply: RpcReplyPort<Result<Fetched, BrokerError>>,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<StoredMessage>,
    waiters: VecDeque<Waiter>,
}

struct Unacked {
    queue: String,
    consumer_tag: String,
    message: StoredMessage,
}

/// State for the broker actor.
#[derive(Default)]
pub(crate) struct BrokerState {
    queues: HashMap<String, QueueState>,
    unacked: HashMap<u64, Unacked>,
    next_tag: u64,
}

impl BrokerState {
    fn next_tag(&mut self) -> u64 {
        self.next_tag += 1;
        self.next_tag
    }

    /// Hand a message to the first live waiter, or park it in the queue.
    fn enqueue(&mut self, queue_name: &str, message: StoredMessage, front: bool) {
        let Some(queue) = self.queues.get_mut(queue_name) else {
            tracing::warn!(queue = %queue_name, "Dropping message for undeclared queue");
            return;
        };

        while let Some(waiter) = queue.waiters.pop_front() {
            self.next_tag += 1;
            let delivery_tag = self.next_tag;
            let fetched = Fetched {
                delivery_tag,
                message: message.clone(),
            };
            // A consumer that stopped waiting leaves a closed port behind.
            if waiter.reply.send(Ok(fetched)).is_ok() {
                self.unacked.insert(
                    delivery_tag,
                    Unacked {
                        queue: queue_name.to_string(),
                        consumer_tag: waiter.consumer_tag,
                        message,
                    },
                );
                return;
            }
        }

        if front {
            queue.ready.push_front(message);
        } else {
            queue.ready.push_back(message);
        }
    }

    fn fetch(&mut self, queue_name: String, waiter: Waiter) {
        if !self.queues.contains_key(&queue_name) {
            let _ = waiter
                .reply
                .send(Err(BrokerError::QueueNotFound(queue_name)));
            return;
        }

        let message = self
            .queues
            .get_mut(&queue_name)
            .and_then(|queue| queue.ready.pop_front());

        let Some(message) = message else {
            if let Some(queue) = self.queues.get_mut(&queue_name) {
                queue.waiters.push_back(waiter);
            }
            return;
        };

        let delivery_tag = self.next_tag();
        let fetched = Fetched {
            delivery_tag,
            message: message.clone(),
        };
        if waiter.reply.send(Ok(fetched)).is_ok() {
            self.unacked.insert(
                delivery_tag,
                Unacked {
                    queue: queue_name,
                    consumer_tag: waiter.consumer_tag,
                    message,
                },
            );
        } else if let Some(queue) = self.queues.get_mut(&queue_name) {
            queue.ready.push_front(message);
        }
    }
}

/// Actor that owns every queue of a [`MemoryBroker`].
pub(crate) struct BrokerActor;

impl Actor for BrokerActor {
    type Msg = BrokerMessage;
    type State = BrokerState;
    type Arguments = ();

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        _args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!("Starting in-memory message broker");
        Ok(BrokerState::default())
    }

    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            BrokerMessage::DeclareQueue { name, reply } => {
                if !state.queues.contains_key(&name) {
                    tracing::debug!(queue = %name, "Declared queue");
                    state.queues.insert(name, QueueState::default());
                }
                let _ = reply.send(());
            }

            BrokerMessage::Publish {
                exchange,
                routing_key,
                message,
                reply,
            } => {
                if !exchange.is_empty() {
                    let _ = reply.send(Err(BrokerError::ExchangeNotFound(exchange)));
                    return Ok(());
                }
                state.enqueue(&routing_key, message, false);
                let _ = reply.send(Ok(()));
            }

            BrokerMessage::Fetch {
                queue,
                consumer_tag,
                reply,
            } => state.fetch(
                queue,
                Waiter {
                    consumer_tag,
                    reply,
                },
            ),

            BrokerMessage::CancelConsumer { consumer_tag } => {
                let mut orphaned: Vec<u64> = state
                    .unacked
                    .iter()
                    .filter(|(_, unacked)| unacked.consumer_tag == consumer_tag)
                    .map(|(tag, _)| *tag)
                    .collect();
                // Highest tag first so the oldest message ends up at the front.
                orphaned.sort_unstable_by(|a, b| b.cmp(a));
                for delivery_tag in orphaned {
                    if let Some(unacked) = state.unacked.remove(&delivery_tag) {
                        let mut message = unacked.message;
                        message.redelivered = true;
                        state.enqueue(&unacked.queue, message, true);
                    }
                }
            }

            BrokerMessage::Ack { delivery_tag } => {
                if state.unacked.remove(&delivery_tag).is_none() {
                    tracing::warn!(delivery_tag, "Ack for unknown delivery tag");
                }
            }

            BrokerMessage::Reject {
                delivery_tag,
                requeue,
            } => match state.unacked.remove(&delivery_tag) {
                Some(unacked) if requeue => {
                    let mut message = unacked.message;
                    message.redelivered = true;
                    state.enqueue(&unacked.queue, message, true);
                }
                Some(unacked) => {
                    tracing::debug!(
                        delivery_tag,
                        queue = %unacked.queue,
                        "Dropped rejected message"
                    );
                }
                None => tracing::warn!(delivery_tag, "Reject for unknown delivery tag"),
            },

            BrokerMessage::GetStats { queue, reply } => {
                let stats = state.queues.get(&queue).map(|q| QueueStats {
                    ready: q.ready.len(),
                    unacked: state
                        .unacked
                        .values()
                        .filter(|unacked| unacked.queue == queue)
                        .count(),
                });
                let _ = reply.send(stats);
            }
        }

        Ok(())
    }
}

async fn call<T, F>(actor: &ActorRef<BrokerMessage>, build: F) -> Result<T, BrokerError>
where
    T: Send + 'static,
    F: FnOnce(RpcReplyPort<T>) -> BrokerMessage,
{
    match ractor::rpc::call(actor, build, None).await {
        Ok(CallResult::Success(value)) => Ok(value),
        Ok(CallResult::Timeout) | Ok(CallResult::SenderError) | Err(_) => {
            Err(BrokerError::ConnectionClosed)
        }
    }
}

/// In-process message broker.
pub struct MemoryBroker {
    actor: ActorRef<BrokerMessage>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl MemoryBroker {
    /// Spawn the broker actor.
    pub async fn start() -> Result<Self, BrokerError> {
        let (actor, handle) = Actor::spawn(None, BrokerActor, ())
            .await
            .map_err(|e| BrokerError::Connection(format!("Failed to spawn broker: {}", e)))?;

        Ok(Self {
            actor,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Ready and unacknowledged message counts, `None` for an undeclared queue.
    pub async fn queue_stats(&self, queue: &str) -> Result<Option<QueueStats>, BrokerError> {
        call(&self.actor, |reply| BrokerMessage::GetStats {
            queue: queue.to_string(),
            reply,
        })
        .await
    }
}

impl MessageBroker for MemoryBroker {
    fn declare_queue<'a>(&'a self, name: &'a str) -> BrokerFuture<'a, ()> {
        Box::pin(async move {
            call(&self.actor, |reply| BrokerMessage::DeclareQueue {
                name: name.to_string(),
                reply,
            })
            .await
        })
    }

    fn publish<'a>(
        &'a self,
        exchange: &'a str,
        routing_key: &'a str,
        content_type: &'a str,
        body: Vec<u8>,
    ) -> BrokerFuture<'a, ()> {
        Box::pin(async move {
            let message = StoredMessage {
                content_type: content_type.to_string(),
                body,
                redelivered: false,
            };
            call(&self.actor, |reply| BrokerMessage::Publish {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                message,
                reply,
            })
            .await?
        })
    }

    fn subscribe<'a>(
        &'a self,
        queue: &'a str,
        concurrency: usize,
        cancel: CancellationToken,
        factory: ProcessorFactory,
    ) -> BrokerFuture<'a, ()> {
        Box::pin(async move {
            let consumers = (0..concurrency)
                .map(|_| MemoryConsumer {
                    actor: self.actor.clone(),
                    queue: queue.to_string(),
                    consumer_tag: format!("{}-{}", queue, Ulid::new()),
                })
                .collect();
            run_workers(queue, consumers, cancel, factory).await
        })
    }

    fn close(&self) -> BrokerFuture<'_, ()> {
        Box::pin(async move {
            self.actor.stop(Some("broker closed".to_string()));
            if let Some(handle) = self.handle.lock().await.take() {
                handle
                    .await
                    .map_err(|e| BrokerError::Connection(e.to_string()))?;
            }
            Ok(())
        })
    }
}

struct MemoryConsumer {
    actor: ActorRef<BrokerMessage>,
    queue: String,
    consumer_tag: String,
}

impl Consumer for MemoryConsumer {
    async fn next(&mut self) -> Result<Option<Delivery>, BrokerError> {
        let fetched = call(&self.actor, |reply| BrokerMessage::Fetch {
            queue: self.queue.clone(),
            consumer_tag: self.consumer_tag.clone(),
            reply,
        })
        .await??;

        tracing::trace!(
            queue = %self.queue,
            delivery_tag = fetched.delivery_tag,
            content_type = %fetched.message.content_type,
            "Fetched message"
        );

        Ok(Some(Delivery::new(
            fetched.delivery_tag,
            fetched.message.redelivered,
            fetched.message.body,
            Acker::Memory(self.actor.clone()),
        )))
    }

    async fn shutdown(self) {
        // Same as closing an AMQP channel: deliveries that never reached the
        // processor go back to the queue.
        let _ = self.actor.send_message(BrokerMessage::CancelConsumer {
            consumer_tag: self.consumer_tag,
        });
    }
}
