use std::future::Future;

/// Owns a spawned background loop and aborts it when dropped.
#[derive(Debug)]
pub(crate) struct AbortOnDrop {
    name: &'static str,
    handle: tokio::task::AbortHandle,
}

impl AbortOnDrop {
    pub(crate) fn spawn<F>(name: &'static str, future: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(future).abort_handle();
        Self { name, handle }
    }

    pub(crate) fn name(&self) -> &'static str {
        self.name
    }
}

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        tracing::debug!(task = self.name, "stopping background task");
        self.handle.abort();
    }
}
