use std::sync::Arc;

use futures::{stream, StreamExt};
use tokio::sync::{mpsc, Mutex};
use tokio_stream::wrappers::ReceiverStream;

use crate::pipeline::{Envelope, EnvelopeStream, PipelineError, Source};

/// Bounded hand-off from request handlers to a pipeline.
///
/// Handlers hold the sender; the receiving half can be streamed exactly once.
pub struct RelayQueueSource<T> {
    receiver: Arc<Mutex<Option<mpsc::Receiver<Envelope<T>>>>>,
}

impl<T> RelayQueueSource<T> {
    pub fn channel(capacity: usize) -> (mpsc::Sender<Envelope<T>>, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let source = Self {
            receiver: Arc::new(Mutex::new(Some(rx))),
        };
        (tx, source)
    }
}

#[async_trait::async_trait]
impl<T> Source<T> for RelayQueueSource<T>
where
    T: Send + 'static,
{
    async fn stream(&self) -> EnvelopeStream<T> {
        match self.receiver.lock().await.take() {
            Some(rx) => Box::pin(ReceiverStream::new(rx).map(Ok)),
            None => Box::pin(stream::once(async {
                Err(PipelineError::Source(
                    "relay queue already consumed; only one consumer supported".to_string(),
                ))
            })),
        }
    }
}
