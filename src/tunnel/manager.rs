//! One live port-forward per Tunnel resource, with crash recovery.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::Api;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::crd::{Tunnel, TunnelPhase, TunnelSpec, TunnelStatus};

pub const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
pub const BACKOFF_MAX: Duration = Duration::from_secs(30);

/// One forwarding session.
///
/// Implementations signal `ready` once the forward is actually listening and
/// return when `stop` flips or on transport failure.
#[async_trait]
pub trait PortForward: Send + Sync + 'static {
    async fn run_once(
        &self,
        stop: watch::Receiver<bool>,
        ready: oneshot::Sender<()>,
    ) -> Result<()>;
}

/// Where tunnel phase transitions are published.
#[async_trait]
pub trait PhaseSink: Send + Sync + 'static {
    async fn publish(&self, phase: TunnelPhase, message: &str);
}

/// A running tunnel the controller can start and synchronously stop.
#[async_trait]
pub trait ManagedTunnel: Send + Sync {
    fn start(self: Arc<Self>);
    /// Returns only once the tunnel loop has fully exited. Safe to call
    /// more than once.
    async fn stop(&self);
}

/// Drives one tunnel: run a forwarding session, publish `Up` once it is
/// listening, publish `Crashed` when it exits, back off 1 s doubling to 30 s,
/// and repeat until stopped.
pub struct TunnelManager<F> {
    forward: Arc<F>,
    sink: Arc<dyn PhaseSink>,
    stop: watch::Sender<bool>,
    task: StdMutex<Option<JoinHandle<()>>>,
}

impl<F: PortForward> TunnelManager<F> {
    pub fn new(forward: F, sink: Arc<dyn PhaseSink>) -> Arc<Self> {
        let (stop, _) = watch::channel(false);
        Arc::new(Self {
            forward: Arc::new(forward),
            sink,
            stop,
            task: StdMutex::new(None),
        })
    }
}

#[async_trait]
impl<F: PortForward> ManagedTunnel for TunnelManager<F> {
    fn start(self: Arc<Self>) {
        let forward = Arc::clone(&self.forward);
        let sink = Arc::clone(&self.sink);
        let mut stop_rx = self.stop.subscribe();
        let backoff = Arc::new(StdMutex::new(BACKOFF_INITIAL));

        let handle = tokio::spawn(async move {
            loop {
                let (ready_tx, ready_rx) = oneshot::channel();

                // Sibling waiter: the session signals readiness mid-flight.
                let waiter_sink = Arc::clone(&sink);
                let waiter_backoff = Arc::clone(&backoff);
                let waiter = tokio::spawn(async move {
                    if ready_rx.await.is_ok() {
                        *waiter_backoff.lock().unwrap() = BACKOFF_INITIAL;
                        waiter_sink.publish(TunnelPhase::Up, "").await;
                    }
                });

                let result = forward.run_once(stop_rx.clone(), ready_tx).await;
                // The session owns the ready sender, so the waiter has
                // either published or failed by now; join it to keep phase
                // transitions ordered.
                let _ = waiter.await;

                let message = match &result {
                    Ok(()) => String::new(),
                    Err(err) => format!("{err:#}"),
                };
                if !message.is_empty() {
                    warn!(%message, "tunnel session ended");
                }
                sink.publish(TunnelPhase::Crashed, &message).await;

                if *stop_rx.borrow() {
                    return;
                }

                let delay = *backoff.lock().unwrap();
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = stop_rx.changed() => return,
                }
                let mut backoff = backoff.lock().unwrap();
                *backoff = (*backoff * 2).min(BACKOFF_MAX);
            }
        });

        *self.task.lock().unwrap() = Some(handle);
    }

    async fn stop(&self) {
        let _ = self.stop.send(true);
        let handle = self.task.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

/// Real forwarding session: a local TCP listener whose connections are
/// piped through the Kubernetes port-forward subresource of the target pod.
pub struct KubePortForward {
    client: kube::Client,
    namespace: String,
    pod: String,
    local_port: u16,
    remote_port: u16,
}

impl KubePortForward {
    pub fn new(client: kube::Client, namespace: &str, pod: &str, spec: &TunnelSpec) -> Self {
        Self {
            client,
            namespace: namespace.to_string(),
            pod: pod.to_string(),
            local_port: spec.local_port,
            remote_port: spec.remote_port,
        }
    }
}

#[async_trait]
impl PortForward for KubePortForward {
    async fn run_once(
        &self,
        mut stop: watch::Receiver<bool>,
        ready: oneshot::Sender<()>,
    ) -> Result<()> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);

        // Probe the transport before claiming readiness.
        let probe = api
            .portforward(&self.pod, &[self.remote_port])
            .await
            .with_context(|| format!("opening port-forward to pod '{}'", self.pod))?;
        drop(probe);

        let listener = TcpListener::bind(("127.0.0.1", self.local_port))
            .await
            .with_context(|| format!("binding local port {}", self.local_port))?;
        let _ = ready.send(());

        loop {
            tokio::select! {
                _ = stop.changed() => return Ok(()),
                accepted = listener.accept() => {
                    let (mut inbound, _) = accepted.context("accepting tunnel connection")?;
                    let mut pf = api
                        .portforward(&self.pod, &[self.remote_port])
                        .await
                        .with_context(|| {
                            format!("opening port-forward to pod '{}'", self.pod)
                        })?;
                    let Some(mut upstream) = pf.take_stream(self.remote_port) else {
                        anyhow::bail!("port-forward stream for port {} unavailable", self.remote_port);
                    };
                    tokio::spawn(async move {
                        if let Err(err) =
                            tokio::io::copy_bidirectional(&mut inbound, &mut upstream).await
                        {
                            debug!(%err, "tunnel connection closed");
                        }
                        drop(pf);
                    });
                }
            }
        }
    }
}

/// Publishes phases onto the Tunnel CR. A no-op when the CR is gone or its
/// spec changed underneath the running tunnel.
pub struct TunnelCrSink {
    api: Api<Tunnel>,
    name: String,
    spec: TunnelSpec,
}

impl TunnelCrSink {
    pub fn new(api: Api<Tunnel>, name: &str, spec: TunnelSpec) -> Self {
        Self {
            api,
            name: name.to_string(),
            spec,
        }
    }
}

#[async_trait]
impl PhaseSink for TunnelCrSink {
    async fn publish(&self, phase: TunnelPhase, message: &str) {
        const MAX_CONFLICT_RETRIES: usize = 5;
        for _ in 0..MAX_CONFLICT_RETRIES {
            let current = match self.api.get(&self.name).await {
                Ok(current) => current,
                Err(kube::Error::Api(ae)) if ae.code == 404 => return,
                Err(err) => {
                    warn!(tunnel = %self.name, %err, "reading tunnel for phase update");
                    return;
                }
            };
            if current.spec != self.spec {
                return;
            }
            let status = TunnelStatus {
                phase,
                message: message.to_string(),
            };
            if current.status.as_ref() == Some(&status) {
                return;
            }
            let mut updated = current;
            updated.status = Some(status);
            match self
                .api
                .replace(&self.name, &Default::default(), &updated)
                .await
            {
                Ok(_) => return,
                Err(kube::Error::Api(ae)) if ae.code == 409 => continue,
                Err(kube::Error::Api(ae)) if ae.code == 404 => return,
                Err(err) => {
                    warn!(tunnel = %self.name, %err, "writing tunnel phase");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;
    use tokio::sync::Mutex as AsyncMutex;

    #[derive(Default)]
    struct RecordingSink {
        phases: StdMutex<Vec<(TunnelPhase, String)>>,
    }

    #[async_trait]
    impl PhaseSink for RecordingSink {
        async fn publish(&self, phase: TunnelPhase, message: &str) {
            self.phases
                .lock()
                .unwrap()
                .push((phase, message.to_string()));
        }
    }

    impl RecordingSink {
        fn snapshot(&self) -> Vec<(TunnelPhase, String)> {
            self.phases.lock().unwrap().clone()
        }

        async fn wait_for(&self, count: usize) {
            for _ in 0..1000 {
                if self.phases.lock().unwrap().len() >= count {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            panic!(
                "timed out waiting for {count} phases, got {:?}",
                self.snapshot()
            );
        }
    }

    /// Scripted sessions: the first two signal ready and crash when told to,
    /// the last signals ready and waits for stop.
    struct ScriptedForward {
        invocations: AtomicUsize,
        crashes: AsyncMutex<mpsc::Receiver<String>>,
    }

    #[async_trait]
    impl PortForward for ScriptedForward {
        async fn run_once(
            &self,
            mut stop: watch::Receiver<bool>,
            ready: oneshot::Sender<()>,
        ) -> Result<()> {
            let invocation = self.invocations.fetch_add(1, Ordering::SeqCst);
            let _ = ready.send(());
            if invocation < 2 {
                let reason = self.crashes.lock().await.recv().await.unwrap();
                anyhow::bail!("{reason}");
            }
            let _ = stop.changed().await;
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn crash_and_recover_cycles_phases() {
        let (crash_tx, crash_rx) = mpsc::channel(1);
        let forward = ScriptedForward {
            invocations: AtomicUsize::new(0),
            crashes: AsyncMutex::new(crash_rx),
        };
        let sink = Arc::new(RecordingSink::default());
        let manager = TunnelManager::new(forward, sink.clone());
        manager.clone().start();

        sink.wait_for(1).await;
        assert_eq!(sink.snapshot()[0].0, TunnelPhase::Up);

        crash_tx.send("connection reset".to_string()).await.unwrap();
        sink.wait_for(2).await;
        assert_eq!(sink.snapshot()[1].0, TunnelPhase::Crashed);
        assert!(sink.snapshot()[1].1.contains("connection reset"));

        // Backoff elapses (paused clock auto-advances), second session.
        sink.wait_for(3).await;
        assert_eq!(sink.snapshot()[2].0, TunnelPhase::Up);

        crash_tx.send("gone again".to_string()).await.unwrap();
        sink.wait_for(4).await;

        // Third session comes up, then a clean stop.
        sink.wait_for(5).await;
        assert_eq!(sink.snapshot()[4].0, TunnelPhase::Up);

        manager.stop().await;
        let phases = sink.snapshot();
        assert_eq!(phases.last().unwrap(), &(TunnelPhase::Crashed, String::new()));
        assert_eq!(phases.len(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_is_idempotent_and_synchronous() {
        struct BlockUntilStopped;

        #[async_trait]
        impl PortForward for BlockUntilStopped {
            async fn run_once(
                &self,
                mut stop: watch::Receiver<bool>,
                ready: oneshot::Sender<()>,
            ) -> Result<()> {
                let _ = ready.send(());
                let _ = stop.changed().await;
                Ok(())
            }
        }

        let sink = Arc::new(RecordingSink::default());
        let manager = TunnelManager::new(BlockUntilStopped, sink.clone());
        manager.clone().start();
        sink.wait_for(1).await;

        manager.stop().await;
        let after_first = sink.snapshot();
        assert_eq!(
            after_first.last().unwrap(),
            &(TunnelPhase::Crashed, String::new())
        );

        // A second stop must return immediately and change nothing.
        manager.stop().await;
        assert_eq!(sink.snapshot(), after_first);
    }
}
