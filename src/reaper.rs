use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::sqs::state::SqsState;

const TICK: Duration = Duration::from_secs(1);

/// Background task that walks all queues once per second, expiring
/// deduplication entries and visibility windows and applying dead-letter
/// transfers.
pub struct Reaper {
    stop: Arc<AtomicBool>,
    wake: Arc<Notify>,
    handle: JoinHandle<()>,
}

impl Reaper {
    pub fn spawn(state: Arc<SqsState>) -> Reaper {
        let stop = Arc::new(AtomicBool::new(false));
        let wake = Arc::new(Notify::new());
        let handle = {
            let stop = stop.clone();
            let wake = wake.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(TICK);
                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            if stop.load(Ordering::Relaxed) {
                                break;
                            }
                            state.reap().await;
                        }
                        _ = wake.notified() => break,
                    }
                }
                debug!("reaper stopped");
            })
        };
        Reaper { stop, wake, handle }
    }

    /// Signals the task to stop. A pass already underway completes; no
    /// further ticks run.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
        self.wake.notify_waiters();
    }

    pub async fn join(self) {
        let _ = self.handle.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqs::queue::QueueAttributes;
    use crate::sqs::types::{CreateQueueRequest, ReceiveMessageRequest, SendMessageRequest};
    use crate::timing::RandomLatency;
    use std::collections::HashMap;

    fn state() -> Arc<SqsState> {
        Arc::new(SqsState::new(
            "queue".into(),
            "local".into(),
            "localhost",
            4100,
            QueueAttributes::default(),
            false,
            RandomLatency::default(),
        ))
    }

    #[tokio::test]
    async fn reaper_stops_promptly() {
        let reaper = Reaper::spawn(state());
        reaper.stop();
        tokio::time::timeout(Duration::from_secs(2), reaper.join())
            .await
            .expect("reaper should stop within one tick");
    }

    #[tokio::test]
    async fn reaper_restores_expired_messages() {
        let s = state();
        let url = s
            .create_queue(CreateQueueRequest {
                queue_name: "requeue".into(),
                attributes: Some(HashMap::from([(
                    "VisibilityTimeout".to_string(),
                    "0".to_string(),
                )])),
            })
            .await
            .unwrap()
            .queue_url;
        s.send_message(SendMessageRequest {
            queue_url: url.clone(),
            message_body: "1".into(),
            delay_seconds: None,
            message_attributes: None,
            message_deduplication_id: None,
            message_group_id: None,
        })
        .await
        .unwrap();

        let receive = |wait: u32| {
            let s = s.clone();
            let url = url.clone();
            async move {
                s.receive_message(ReceiveMessageRequest {
                    queue_url: url,
                    max_number_of_messages: None,
                    wait_time_seconds: Some(wait),
                })
                .await
                .unwrap()
            }
        };

        assert!(receive(0).await.messages.is_some());
        assert!(receive(0).await.messages.is_none());

        let reaper = Reaper::spawn(s.clone());
        let redelivered = receive(5).await;
        assert_eq!(redelivered.messages.unwrap()[0].body, "1");
        reaper.stop();
        reaper.join().await;
    }
}
