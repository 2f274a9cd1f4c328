//! Watch-based view source.
//!
//! A [`PresentationClient`](crate::PresentationClient) publishes every new
//! [`InspectorView`] on a tokio watch channel. A [`ViewSource`] is the
//! receiving end, for render loops that poll rather than await.

use tokio::sync::watch;

use crate::view::InspectorView;

/// Receives inspector views pushed by a client.
///
/// # Example
///
/// ```
/// use statescope::{InspectorView, ViewSource};
///
/// let (tx, mut source) = ViewSource::create("relay://local");
/// assert!(source.poll().is_some());
/// assert!(source.poll().is_none());
///
/// tx.send(InspectorView::new()).unwrap();
/// assert!(source.poll().is_some());
/// ```
#[derive(Debug)]
pub struct ViewSource {
    receiver: watch::Receiver<InspectorView>,
    description: String,
    initial_returned: bool,
}

impl ViewSource {
    pub fn new(receiver: watch::Receiver<InspectorView>, source_description: &str) -> Self {
        Self {
            receiver,
            description: format!("relay: {}", source_description),
            initial_returned: false,
        }
    }

    /// Create a sender and a source connected to it.
    pub fn create(source_description: &str) -> (watch::Sender<InspectorView>, Self) {
        let (tx, rx) = watch::channel(InspectorView::default());
        (tx, Self::new(rx, source_description))
    }

    /// Latest view if it changed since the last poll. The first poll always
    /// returns the current view.
    pub fn poll(&mut self) -> Option<InspectorView> {
        if !self.initial_returned {
            self.initial_returned = true;
            self.receiver.mark_changed();
        }

        if self.receiver.has_changed().unwrap_or(false) {
            Some(self.receiver.borrow_and_update().clone())
        } else {
            None
        }
    }

    /// Wait for the next view. Returns `None` once the client is gone.
    pub async fn changed(&mut self) -> Option<InspectorView> {
        self.initial_returned = true;
        self.receiver.changed().await.ok()?;
        Some(self.receiver.borrow_and_update().clone())
    }

    pub fn description(&self) -> &str {
        &self.description
    }
}
