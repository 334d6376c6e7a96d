use indicatif::ProgressBar;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::info;

/// A single update for the presentation layer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatusUpdate {
    pub message: String,
    pub busy: bool,
    pub attestation_ref: Option<String>,
}

impl StatusUpdate {
    /// A terminal update: the reported activity is finished.
    pub fn message(text: impl Into<String>) -> Self {
        Self {
            message: text.into(),
            busy: false,
            attestation_ref: None,
        }
    }

    /// An in-progress update: more of the same activity will follow.
    pub fn busy(text: impl Into<String>) -> Self {
        Self {
            message: text.into(),
            busy: true,
            attestation_ref: None,
        }
    }

    pub fn attestation(text: impl Into<String>, reference: impl Into<String>) -> Self {
        Self {
            message: text.into(),
            busy: false,
            attestation_ref: Some(reference.into()),
        }
    }
}

/// The only interface between the core and the presentation layer.
pub trait StatusSink: Send + Sync {
    fn report(&self, update: StatusUpdate);
}

/// Forwards every update to the tracing log.
pub struct TracingSink;

impl StatusSink for TracingSink {
    fn report(&self, update: StatusUpdate) {
        info!(busy = update.busy, "{}", update.message);
        if let Some(reference) = update.attestation_ref {
            info!("Attestation published at {}", reference);
        }
    }
}

/// Drives a terminal spinner: busy updates replace the spinner message,
/// terminal updates are printed above it.
pub struct ProgressBarSink {
    bar: ProgressBar,
}

impl ProgressBarSink {
    pub fn new() -> Self {
        let bar = ProgressBar::new_spinner();
        bar.enable_steady_tick(Duration::from_millis(120));
        Self { bar }
    }
}

impl Default for ProgressBarSink {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusSink for ProgressBarSink {
    fn report(&self, update: StatusUpdate) {
        if let Some(reference) = &update.attestation_ref {
            self.bar.println(format!("{}\n{}", update.message, reference));
            self.bar.finish_and_clear();
        } else if update.busy {
            self.bar.set_message(update.message);
        } else {
            self.bar.println(update.message);
        }
    }
}

/// Pipes every update into a channel for a presentation task to drain.
/// Once the consumer is gone, further updates are dropped.
pub struct ChannelSink {
    sender: mpsc::UnboundedSender<StatusUpdate>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<StatusUpdate>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl StatusSink for ChannelSink {
    fn report(&self, update: StatusUpdate) {
        let _ = self.sender.send(update);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructors_set_the_expected_fields() {
        let busy = StatusUpdate::busy("downloading");
        assert!(busy.busy);
        assert!(busy.attestation_ref.is_none());

        let done = StatusUpdate::message("verified");
        assert!(!done.busy);

        let shared = StatusUpdate::attestation("all circuits done", "https://gist.example/1");
        assert_eq!(shared.attestation_ref.as_deref(), Some("https://gist.example/1"));
    }

    #[test]
    fn channel_sink_forwards_updates_in_order() {
        let (sink, mut receiver) = ChannelSink::new();
        sink.report(StatusUpdate::busy("downloading"));
        sink.report(StatusUpdate::message("verified"));

        assert_eq!(receiver.try_recv().unwrap().message, "downloading");
        assert_eq!(receiver.try_recv().unwrap().message, "verified");
        assert!(receiver.try_recv().is_err());
    }

    #[test]
    fn channel_sink_drops_updates_once_the_consumer_is_gone() {
        let (sink, receiver) = ChannelSink::new();
        drop(receiver);
        // Must not panic or error; the session outliving its UI is fine.
        sink.report(StatusUpdate::message("late update"));
    }
}
