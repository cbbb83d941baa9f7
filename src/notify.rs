//! Fire-and-forget progress notifications.
//!
//! A notifier speaks short status lines to whoever is watching. Delivery
//! failures are logged and never reach todo state.

use std::sync::Arc;

use async_trait::async_trait;

/// Who is speaking, for notifiers that route by agent or session.
#[derive(Debug, Clone)]
pub struct NotifyContext {
    pub agent: String,
    pub session_id: String,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn speak(&self, text: &str, context: &NotifyContext) -> anyhow::Result<()>;
}

/// Writes notifications to the log.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn speak(&self, text: &str, context: &NotifyContext) -> anyhow::Result<()> {
        tracing::info!(agent = %context.agent, session = %context.session_id, "{}", text);
        Ok(())
    }
}

/// Deliver `text` in the background.
pub fn notify(notifier: &Arc<dyn Notifier>, text: impl Into<String>, context: &NotifyContext) {
    let notifier = Arc::clone(notifier);
    let text = text.into();
    let context = context.clone();
    tokio::spawn(async move {
        if let Err(e) = notifier.speak(&text, &context).await {
            tracing::warn!(error = %e, "Notification failed");
        }
    });
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use std::sync::Mutex;

    /// Records every line; optionally fails each delivery.
    #[derive(Default)]
    pub struct RecordingNotifier {
        pub lines: Mutex<Vec<String>>,
        pub fail: bool,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn speak(&self, text: &str, _context: &NotifyContext) -> anyhow::Result<()> {
            self.lines.lock().unwrap().push(text.to_string());
            if self.fail {
                anyhow::bail!("speaker unplugged");
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::RecordingNotifier;
    use super::*;
    use std::time::Duration;

    fn context() -> NotifyContext {
        NotifyContext {
            agent: "overseer".to_string(),
            session_id: "s1".to_string(),
        }
    }

    #[tokio::test]
    async fn test_notify_delivers_in_background() {
        let recorder = Arc::new(RecordingNotifier::default());
        let notifier: Arc<dyn Notifier> = recorder.clone();

        notify(&notifier, "step 1 done", &context());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(*recorder.lines.lock().unwrap(), vec!["step 1 done".to_string()]);
    }

    #[tokio::test]
    async fn test_delivery_failure_is_swallowed() {
        let recorder = Arc::new(RecordingNotifier {
            fail: true,
            ..RecordingNotifier::default()
        });
        let notifier: Arc<dyn Notifier> = recorder.clone();

        notify(&notifier, "hello", &context());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(recorder.lines.lock().unwrap().len(), 1);
        assert!(LogNotifier.speak("hi", &context()).await.is_ok());
    }
}
