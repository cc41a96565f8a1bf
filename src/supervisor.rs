//! Supervises many Workers: routes `subscribe` requests across them,
//! starts them all concurrently, and stops them in reverse dependency
//! order so a producer never sees a consumer's spurious interval break
//! (spec §4.H).

use std::sync::Arc;
use std::time::Duration;

use log::info;
use sqlx::PgPool;
use tokio::task::JoinHandle;

use crate::error::{JouleError, Result};
use crate::module::StreamRef;
use crate::pipe::local::Pipe;
use crate::stream::Stream;
use crate::worker::Worker;

pub struct Supervisor {
    workers: Vec<Arc<Worker>>,
}

impl Supervisor {
    pub fn new(workers: Vec<Arc<Worker>>) -> Self {
        Supervisor { workers }
    }

    pub fn workers(&self) -> &[Arc<Worker>] {
        &self.workers
    }

    /// True if some worker (other than pseudo-workers attached via
    /// `publish`, which behave identically) produces `stream_ref`.
    pub fn produces(&self, stream_ref: &StreamRef) -> bool {
        self.workers.iter().any(|w| w.produces(stream_ref))
    }

    /// Scans workers for one producing `stream_ref` and delegates.
    pub async fn subscribe(&self, stream_ref: &StreamRef) -> Result<Pipe> {
        for worker in &self.workers {
            if worker.produces(stream_ref) {
                return worker.subscribe(stream_ref).await;
            }
        }
        Err(JouleError::Subscription(format!(
            "no producer for {stream_ref:?}"
        )))
    }

    /// Launches every worker concurrently, each restarting on failure per
    /// its module's restart policy. Returns join handles in start order;
    /// `stop` awaits them in reverse order.
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(self.workers.len());
        for worker in self.workers.clone() {
            let supervisor = Arc::clone(self);
            handles.push(tokio::spawn(async move {
                let restart = worker.restart_policy();
                if let Err(e) = worker.run(&supervisor, restart).await {
                    log::error!("[{}] worker exited: {}", worker.name(), e);
                }
            }));
        }
        handles
    }

    /// Stops every worker in reverse dependency order (consumers before
    /// producers), then awaits their run tasks.
    pub async fn stop(&self, handles: Vec<JoinHandle<()>>) {
        for worker in self.workers.iter().rev() {
            info!("[{}] stopping", worker.name());
            worker.stop().await;
        }
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Attaches a pseudo-worker for an externally-sourced stream (HTTP
    /// ingest): its "output" pipe is fed by the caller (typically a
    /// framed pipe reading an HTTP request body) rather than a
    /// subprocess. It participates in `subscribe` resolution identically
    /// to a real module's worker.
    pub async fn publish(
        &mut self,
        stream: Stream,
        source: Pipe,
        pool: PgPool,
        insert_period: Duration,
        max_log_lines: usize,
    ) {
        let module = crate::module::Module {
            name: format!("publish:{}", stream.name),
            exec_cmd: String::new(),
            inputs: Default::default(),
            outputs: [(stream.name.clone(), stream.clone())].into_iter().collect(),
            restart: false,
        };
        let worker = Arc::new(
            Worker::published(module, pool, insert_period, max_log_lines, stream, source).await,
        );
        self.workers.push(worker);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::Layout;
    use crate::module::Module;
    use crate::stream::Stream;

    fn lazy_pool() -> PgPool {
        sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgres://localhost/joule_test_unreachable")
            .expect("connect_lazy never dials out")
    }

    fn producer(id: i64, name: &str) -> Arc<Worker> {
        let mut module = Module::new(format!("{name}_module"), "/usr/bin/true");
        module
            .outputs
            .insert("out".into(), Stream::new(id, name, Layout::parse("float32_3").unwrap()));
        Arc::new(Worker::new(module, lazy_pool(), Duration::from_secs(1), 100))
    }

    #[test]
    fn produces_scans_all_workers() {
        let sup = Supervisor::new(vec![producer(1, "accel"), producer(2, "gyro")]);
        assert!(sup.produces(&StreamRef::ById(1)));
        assert!(sup.produces(&StreamRef::ById(2)));
        assert!(!sup.produces(&StreamRef::ById(3)));
    }

    #[tokio::test]
    async fn subscribe_fails_cleanly_with_no_producer() {
        let sup = Supervisor::new(Vec::new());
        let err = sup.subscribe(&StreamRef::ById(1)).await.unwrap_err();
        assert!(matches!(err, JouleError::Subscription(_)));
    }

    #[tokio::test]
    async fn publish_registers_a_pseudo_worker_as_a_producer() {
        let mut sup = Supervisor::new(Vec::new());
        let stream = Stream::new(9, "ingest", Layout::parse("float32_3").unwrap());
        let source = Pipe::new(stream.layout, "ingest:source".to_string());
        sup.publish(stream, source, lazy_pool(), Duration::from_secs(1), 100)
            .await;
        assert!(sup.produces(&StreamRef::ById(9)));
        assert_eq!(sup.workers().len(), 1);
    }
}
