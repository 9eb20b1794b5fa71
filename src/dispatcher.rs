// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Loop
//!
//! This module runs the workers consuming the dispatcher queue. Each worker owns its own
//! subscription, prefetches up to `prefetch_count` deliveries and processes them one at
//! a time.
//!
//! A supervisor starts `concurrency.min` workers and checks the queue backlog on every
//! scale interval: a backlog larger than what the active workers prefetch adds a worker,
//! up to `concurrency.max`; an empty queue for several consecutive checks retires one,
//! down to `concurrency.min`.
//!
//! On shutdown the workers stop pulling deliveries, the in-flight ones are given the
//! configured grace period to finish, then the remaining workers are aborted.

use crate::{
    config::{ConcurrencyRange, ResolvedConfig},
    consumer::DeliveryProcessor,
    errors::AmqpError,
    otel::TRACER_NAME,
    transport::{AmqpTransport, ConsumeOptions, DeliveryStream},
};
use futures_util::{future::join_all, StreamExt};
use opentelemetry::global;
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, error, info, warn};

/// Consecutive empty-queue checks before a worker is retired
const IDLE_CHECKS_BEFORE_RETIRE: u32 = 3;

struct Worker {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Consumers of the dispatcher queue.
pub(crate) struct ConsumerLoop {
    transport: Arc<dyn AmqpTransport>,
    processor: Arc<DeliveryProcessor>,
    queue: String,
    concurrency: ConcurrencyRange,
    prefetch_count: u16,
    scale_interval: Duration,
    shutdown_grace: Duration,
}

impl ConsumerLoop {
    /// Creates the consumer loop of a dispatcher.
    ///
    /// # Parameters
    /// * `transport` - Broker to consume from
    /// * `processor` - Processes every delivery
    /// * `cfg` - Queue, concurrency, prefetch and timing settings
    pub(crate) fn new(
        transport: Arc<dyn AmqpTransport>,
        processor: Arc<DeliveryProcessor>,
        cfg: &ResolvedConfig,
    ) -> Self {
        ConsumerLoop {
            transport,
            processor,
            queue: cfg.queue.clone(),
            concurrency: cfg.concurrency,
            prefetch_count: cfg.prefetch_count,
            scale_interval: cfg.scale_interval,
            shutdown_grace: cfg.shutdown_grace,
        }
    }

    /// Starts the minimum number of workers and the supervisor scaling them.
    ///
    /// # Returns
    /// The handle stopping the loop, or the error of the first subscription that failed
    pub(crate) async fn start(self) -> Result<ConsumerHandle, AmqpError> {
        let active = Arc::new(AtomicUsize::new(0));
        let mut workers = Vec::with_capacity(self.concurrency.max);

        for _ in 0..self.concurrency.min {
            workers.push(self.spawn_worker(&active).await?);
        }

        info!(
            queue = %self.queue,
            workers = workers.len(),
            "consumers started"
        );

        let (stop, stop_rx) = watch::channel(false);
        let supervisor = tokio::spawn(self.supervise(workers, active.clone(), stop_rx));

        Ok(ConsumerHandle {
            stop,
            supervisor,
            active,
        })
    }

    async fn spawn_worker(&self, active: &Arc<AtomicUsize>) -> Result<Worker, AmqpError> {
        let number = active.fetch_add(1, Ordering::SeqCst) + 1;
        let tag = format!("{}-consumer-{}", self.queue, number);

        let deliveries = match self
            .transport
            .consume(ConsumeOptions::new(&self.queue, &tag).prefetch(self.prefetch_count))
            .await
        {
            Ok(deliveries) => deliveries,
            Err(err) => {
                active.fetch_sub(1, Ordering::SeqCst);
                error!(error = err.to_string(), consumer_tag = %tag, "failure to create the consumer");
                return Err(err);
            }
        };

        let (stop, stop_rx) = watch::channel(false);
        let task = tokio::spawn(run_worker(
            deliveries,
            self.processor.clone(),
            stop_rx,
            active.clone(),
            tag,
        ));

        Ok(Worker { stop, task })
    }

    async fn supervise(
        self,
        mut workers: Vec<Worker>,
        active: Arc<AtomicUsize>,
        mut stop: watch::Receiver<bool>,
    ) {
        let mut idle_checks = 0;

        loop {
            tokio::select! {
                biased;
                _ = stop.changed() => break,
                _ = tokio::time::sleep(self.scale_interval) => {}
            }

            workers.retain(|worker| !worker.task.is_finished());

            let depth = match self.transport.queue_depth(&self.queue).await {
                Ok(depth) => depth,
                Err(err) => {
                    warn!(error = err.to_string(), "failure to inspect the queue backlog");
                    continue;
                }
            };

            let running = workers.len();
            let prefetched = u32::from(self.prefetch_count).saturating_mul(running as u32);

            if depth > prefetched && running < self.concurrency.max {
                idle_checks = 0;
                match self.spawn_worker(&active).await {
                    Ok(worker) => {
                        debug!(depth = depth, workers = running + 1, "consumer added");
                        workers.push(worker);
                    }
                    Err(err) => error!(error = err.to_string(), "failure to scale up"),
                }
            } else if depth == 0 && running > self.concurrency.min {
                idle_checks += 1;
                if idle_checks >= IDLE_CHECKS_BEFORE_RETIRE {
                    idle_checks = 0;
                    if let Some(worker) = workers.pop() {
                        let _ = worker.stop.send(true);
                        debug!(workers = running - 1, "consumer retired");
                    }
                }
            } else {
                idle_checks = 0;
            }
        }

        self.drain(workers).await;
    }

    async fn drain(&self, workers: Vec<Worker>) {
        for worker in &workers {
            let _ = worker.stop.send(true);
        }

        let aborts: Vec<_> = workers.iter().map(|w| w.task.abort_handle()).collect();
        let tasks = workers.into_iter().map(|w| w.task);

        if tokio::time::timeout(self.shutdown_grace, join_all(tasks))
            .await
            .is_err()
        {
            warn!(
                grace_ms = self.shutdown_grace.as_millis() as u64,
                "in-flight deliveries did not finish in time, aborting consumers"
            );
            for abort in aborts {
                abort.abort();
            }
        }

        info!(queue = %self.queue, "consumers stopped");
    }
}

async fn run_worker(
    mut deliveries: DeliveryStream,
    processor: Arc<DeliveryProcessor>,
    mut stop: watch::Receiver<bool>,
    active: Arc<AtomicUsize>,
    tag: String,
) {
    let tracer = global::tracer(TRACER_NAME);

    loop {
        tokio::select! {
            biased;
            _ = stop.changed() => break,
            next = deliveries.next() => match next {
                Some(Ok(delivery)) => {
                    if let Err(err) = processor.process(&tracer, delivery).await {
                        error!(error = err.to_string(), "error consume msg");
                    }
                }
                Some(Err(err)) => error!(error = err.to_string(), "errors consume msg"),
                None => {
                    warn!(consumer_tag = %tag, "subscription closed by the broker");
                    break;
                }
            }
        }
    }

    active.fetch_sub(1, Ordering::SeqCst);
    debug!(consumer_tag = %tag, "consumer stopped");
}

/// Stops a running consumer loop.
pub struct ConsumerHandle {
    stop: watch::Sender<bool>,
    supervisor: JoinHandle<()>,
    active: Arc<AtomicUsize>,
}

impl ConsumerHandle {
    /// Number of workers currently consuming.
    pub fn active_workers(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Stops pulling deliveries and waits for the in-flight ones, up to the grace period.
    pub async fn shutdown(self) {
        let _ = self.stop.send(true);

        if let Err(err) = self.supervisor.await {
            error!(error = err.to_string(), "consumer supervisor failed");
        }
    }
}
