use tokio::sync::watch;

/// Sending half of a one-shot, broadcast stop signal.
#[derive(Debug)]
pub struct ShutdownTrigger(watch::Sender<bool>);

/// Cloneable receiving half. Once triggered it stays triggered.
#[derive(Debug, Clone)]
pub struct Shutdown(watch::Receiver<bool>);

pub fn channel() -> (ShutdownTrigger, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger(tx), Shutdown(rx))
}

impl ShutdownTrigger {
    pub fn trigger(&self) { self.0.send_replace(true); }

    pub fn subscribe(&self) -> Shutdown { Shutdown(self.0.subscribe()) }
}

impl Shutdown {
    /// A signal that never fires.
    pub fn never() -> Self { Self(watch::channel(false).1) }

    pub fn is_triggered(&self) -> bool { *self.0.borrow() }

    /// Resolves once the signal fires. A dropped trigger without firing pends forever.
    pub async fn wait(&mut self) {
        if self.0.wait_for(|stopped| *stopped).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
