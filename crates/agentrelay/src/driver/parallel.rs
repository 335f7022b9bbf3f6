//! The parallel fan-in driver (spec.md §4.5): N independent
//! `(adapter, prompt, options)` tasks merged into one stream, each with its
//! own lifecycle that individually satisfies the invariants of §3, under a
//! global "any-cancel cancels all" policy.

use std::sync::Arc;

use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::sync::mpsc;

use crate::adapter::{Adapter, AdapterOptions};
use crate::cancel::CancelToken;
use crate::driver::single::run_to_completion;
use crate::event::{new_session_id, Event};
use crate::synth::{done_event, timestamp_ms};
use crate::event::DoneStatus;

/// One task submitted to [`drive_all`]. Unlike [`crate::driver::drive`],
/// tasks carry an already-resolved adapter rather than a registry lookup —
/// spec.md §6 describes `driveAll`'s tasks as `{adapter, prompt, options?}`.
pub struct Task {
    pub adapter: Arc<dyn Adapter>,
    pub prompt: String,
    pub options: AdapterOptions,
}

/// Fan-in merge of `tasks`, each driven under the single-session lifecycle,
/// with tripping any one task's cancellation token cancelling all of them.
pub fn drive_all(tasks: Vec<Task>) -> BoxStream<'static, Event> {
    if tasks.is_empty() {
        return futures::stream::empty().boxed();
    }

    // Global pre-abort (spec.md §4.5 step 2): no adapter is invoked at all.
    if tasks.iter().any(|t| t.options.cancel.is_cancelled()) {
        let events: Vec<Event> = tasks
            .iter()
            .map(|t| done_event(t.adapter.backend_id(), &new_session_id(), DoneStatus::Interrupted, 0))
            .collect();
        return futures::stream::iter(events).boxed();
    }

    let (tx, rx) = mpsc::channel::<Event>(64);
    let combined = CancelToken::new();

    // Fold every task's own token into one "any-cancel" signal (spec.md §5).
    for task in &tasks {
        let individual = task.options.cancel.clone();
        let combined = combined.clone();
        tokio::spawn(async move {
            individual.cancelled().await;
            combined.cancel();
        });
    }

    for task in tasks {
        let tx = tx.clone();
        let combined = combined.clone();
        tokio::spawn(run_task(task, combined, tx));
    }
    drop(tx);

    tokio_stream::wrappers::ReceiverStream::new(rx).boxed()
}

async fn run_task(task: Task, combined: CancelToken, tx: mpsc::Sender<Event>) {
    let Task { adapter, prompt, mut options } = task;
    let backend_id = adapter.backend_id().to_string();
    let session_seed = new_session_id();
    let start = timestamp_ms();
    options.cancel = combined.clone();
    let raw = adapter.run(prompt, options);
    run_to_completion(&backend_id, raw, combined, session_seed, start, tx).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::AdapterItem;
    use crate::event::{DonePayload, EventType, TextPayload, Usage};
    use futures::stream::{self};
    use std::time::Duration;

    fn text_event(backend: &str, session: &str, text: &str) -> Event {
        Event::new(EventType::Text, backend, session, timestamp_ms(), TextPayload { text: text.into() })
    }

    struct ScriptedAdapter {
        id: &'static str,
        events: std::sync::Mutex<Option<Vec<AdapterItem>>>,
    }

    impl Adapter for ScriptedAdapter {
        fn backend_id(&self) -> &str {
            self.id
        }
        fn available(&self) -> bool {
            true
        }
        fn run(&self, _prompt: String, _options: AdapterOptions) -> BoxStream<'static, AdapterItem> {
            let events = self.events.lock().unwrap().take().unwrap_or_default();
            stream::iter(events).boxed()
        }
    }

    fn done_payload(event: &Event) -> DonePayload {
        serde_json::from_value(event.payload.clone()).unwrap()
    }

    #[tokio::test]
    async fn empty_task_list_produces_nothing() {
        let mut stream = drive_all(vec![]);
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn pre_aborted_task_yields_one_interrupted_done_per_task_without_invoking_adapters() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let tasks = vec![
            Task {
                adapter: Arc::new(ScriptedAdapter { id: "a", events: std::sync::Mutex::new(Some(vec![])) }),
                prompt: "x".into(),
                options: AdapterOptions { cancel: cancel.clone(), ..Default::default() },
            },
            Task {
                adapter: Arc::new(ScriptedAdapter { id: "b", events: std::sync::Mutex::new(Some(vec![])) }),
                prompt: "y".into(),
                options: AdapterOptions::default(),
            },
        ];
        let events: Vec<Event> = drive_all(tasks).collect().await;
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.is_terminal()));
        let ids: Vec<&str> = events.iter().map(|e| e.backend_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn error_in_one_task_does_not_affect_the_other() {
        let tasks = vec![
            Task {
                adapter: Arc::new(ScriptedAdapter {
                    id: "failing",
                    events: std::sync::Mutex::new(Some(vec![Err(crate::error::AgentRelayError::Process(
                        "boom".into(),
                    ))])),
                }),
                prompt: "x".into(),
                options: AdapterOptions::default(),
            },
            Task {
                adapter: Arc::new(ScriptedAdapter {
                    id: "healthy",
                    events: std::sync::Mutex::new(Some(vec![
                        Ok(text_event("healthy", "sess-h", "hi")),
                        Ok(Event::new(
                            EventType::Done,
                            "healthy",
                            "sess-h",
                            timestamp_ms(),
                            DonePayload {
                                status: DoneStatus::Success,
                                final_text: None,
                                usage: Usage::zeroed(),
                                duration_ms: 1,
                            },
                        )),
                    ])),
                }),
                prompt: "y".into(),
                options: AdapterOptions::default(),
            },
        ];
        let events: Vec<Event> = drive_all(tasks).collect().await;

        let failing: Vec<&Event> = events.iter().filter(|e| e.backend_id == "failing").collect();
        let healthy: Vec<&Event> = events.iter().filter(|e| e.backend_id == "healthy").collect();

        assert_eq!(failing.len(), 2);
        assert_eq!(failing[0].event_type.as_str(), "error");
        assert!(failing[1].is_terminal());
        assert_eq!(done_payload(failing[1]).status, DoneStatus::Error);

        assert_eq!(healthy.len(), 2);
        assert_eq!(healthy[0].event_type.as_str(), "text");
        assert!(healthy[1].is_terminal());
        assert_eq!(done_payload(healthy[1]).status, DoneStatus::Success);
    }

    #[tokio::test]
    async fn cancelling_one_tasks_token_cancels_all() {
        let (tx_a, rx_a) = mpsc::channel::<AdapterItem>(4);
        let (tx_b, rx_b) = mpsc::channel::<AdapterItem>(4);

        struct ChannelAdapter {
            id: &'static str,
            rx: std::sync::Mutex<Option<mpsc::Receiver<AdapterItem>>>,
        }
        impl Adapter for ChannelAdapter {
            fn backend_id(&self) -> &str {
                self.id
            }
            fn available(&self) -> bool {
                true
            }
            fn run(&self, _prompt: String, _options: AdapterOptions) -> BoxStream<'static, AdapterItem> {
                let rx = self.rx.lock().unwrap().take().unwrap();
                tokio_stream::wrappers::ReceiverStream::new(rx).boxed()
            }
        }

        let cancel_a = CancelToken::new();
        let tasks = vec![
            Task {
                adapter: Arc::new(ChannelAdapter { id: "a", rx: std::sync::Mutex::new(Some(rx_a)) }),
                prompt: "x".into(),
                options: AdapterOptions { cancel: cancel_a.clone(), ..Default::default() },
            },
            Task {
                adapter: Arc::new(ChannelAdapter { id: "b", rx: std::sync::Mutex::new(Some(rx_b)) }),
                prompt: "y".into(),
                options: AdapterOptions::default(),
            },
        ];

        let mut stream = drive_all(tasks);
        tx_a.send(Ok(text_event("a", "sess-a", "hi"))).await.unwrap();
        tx_b.send(Ok(text_event("b", "sess-b", "hi"))).await.unwrap();

        let mut seen_texts = 0;
        while seen_texts < 2 {
            let event = stream.next().await.unwrap();
            if event.event_type.as_str() == "text" {
                seen_texts += 1;
            }
        }

        cancel_a.cancel();

        let remaining: Vec<Event> = tokio::time::timeout(Duration::from_millis(500), stream.collect())
            .await
            .expect("parallel driver should settle promptly after cancel");
        assert_eq!(remaining.len(), 2);
        assert!(remaining.iter().all(|e| e.is_terminal()));
        for event in &remaining {
            assert_eq!(done_payload(event).status, DoneStatus::Interrupted);
        }
    }
}
