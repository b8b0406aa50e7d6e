//! Process supervision.
//!
//! Runs one consumer task per collection plus the query API, waits for a
//! shutdown signal, then stops everything and waits for consumers to finish.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::api;
use crate::broker::Broker;
use crate::config::Config;
use crate::consumer::{
    CollectionHook, Consumer, ConsumerError, ConsumerHandle, ConsumerSettings,
};
use crate::store::DocumentStore;
use crate::validation::Collection;

/// Errors that prevent the service from starting.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("Document store unavailable at startup")]
    StoreUnavailable,
}

/// Owns the shared broker and store and runs the service.
pub struct Supervisor {
    config: Config,
    broker: Arc<dyn Broker>,
    store: Arc<dyn DocumentStore>,
}

impl Supervisor {
    pub fn new(config: Config, broker: Arc<dyn Broker>, store: Arc<dyn DocumentStore>) -> Self {
        Self {
            config,
            broker,
            store,
        }
    }

    /// One consumer per collection, each on its configured queue.
    pub fn consumers(&self) -> Vec<Consumer> {
        let settings = ConsumerSettings::from(&self.config.broker);
        Collection::ALL
            .into_iter()
            .map(|collection| {
                Consumer::new(
                    self.config.broker.queues.queue_for(collection),
                    self.broker.clone(),
                    Arc::new(CollectionHook::for_collection(
                        collection,
                        self.store.clone(),
                    )),
                    settings.clone(),
                )
            })
            .collect()
    }

    /// Run until `shutdown` resolves, then tear down.
    ///
    /// A consumer that fails (connect exhaustion or panic) is logged and the
    /// remaining consumers keep running.
    pub async fn run<F>(self, shutdown: F) -> Result<(), SupervisorError>
    where
        F: Future<Output = ()>,
    {
        if !self.store.connect().await {
            error!("Failed to connect to the document store, not starting");
            return Err(SupervisorError::StoreUnavailable);
        }

        let mut tasks: JoinSet<(String, Result<(), ConsumerError>)> = JoinSet::new();
        let mut handles: Vec<ConsumerHandle> = Vec::new();
        for consumer in self.consumers() {
            let queue = consumer.queue().to_string();
            handles.push(consumer.handle());
            tasks.spawn(async move { (queue, consumer.start().await) });
        }

        let (api_stop, api_stopped) = oneshot::channel::<()>();
        let api_address = self.config.api.bind_address();
        let api_store = self.store.clone();
        let mut api_task = tokio::spawn(async move {
            api::serve(api_store, &api_address, async {
                let _ = api_stopped.await;
            })
            .await
        });
        let mut api_running = true;

        info!(consumers = handles.len(), "Service started");

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break;
                }
                Some(joined) = tasks.join_next() => match joined {
                    Ok((queue, Ok(()))) => info!(queue = %queue, "Consumer exited"),
                    Ok((queue, Err(e))) => error!(queue = %queue, error = %e, "Consumer failed"),
                    Err(e) => error!(error = %e, "Consumer task panicked"),
                },
                result = &mut api_task, if api_running => {
                    api_running = false;
                    match result {
                        Ok(Ok(())) => warn!("Query API exited"),
                        Ok(Err(e)) => error!(error = %e, "Query API failed"),
                        Err(e) => error!(error = %e, "Query API task panicked"),
                    }
                }
            }
        }

        self.teardown(handles, tasks, api_stop, api_task, api_running)
            .await;
        Ok(())
    }

    async fn teardown(
        &self,
        handles: Vec<ConsumerHandle>,
        mut tasks: JoinSet<(String, Result<(), ConsumerError>)>,
        api_stop: oneshot::Sender<()>,
        api_task: tokio::task::JoinHandle<std::io::Result<()>>,
        api_running: bool,
    ) {
        for handle in &handles {
            handle.stop();
        }
        let _ = api_stop.send(());

        let timeout = self.config.shutdown_timeout();
        for handle in &handles {
            if !handle.wait_for_shutdown(Some(timeout)).await {
                warn!(queue = %handle.queue(), "Consumer did not stop in time");
            }
        }
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}

        if api_running {
            match tokio::time::timeout(timeout, api_task).await {
                Ok(Ok(Err(e))) => error!(error = %e, "Query API failed during shutdown"),
                Ok(Err(e)) => error!(error = %e, "Query API task panicked"),
                Err(_) => warn!("Query API did not stop in time"),
                Ok(Ok(Ok(()))) => {}
            }
        }

        self.store.disconnect().await;
        info!("Service stopped");
    }
}
