use crate::types::{Message, StatusUpdate};
use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};
use tracing::{debug, warn};

/// The two queues carrying [`Message`]s from running tasks to the orchestrator.
///
/// Status transitions travel on the state queue; progress and log lines on the
/// log queue, so a chatty task can never delay a status change. Both queues
/// are unbounded and FIFO per producer. Reads are non-blocking drains.
pub struct MessageChannel {
    state_tx: UnboundedSender<Message>,
    state_rx: UnboundedReceiver<Message>,
    log_tx: UnboundedSender<Message>,
    log_rx: UnboundedReceiver<Message>,
}

impl MessageChannel {
    pub fn new() -> Self {
        let (state_tx, state_rx) = mpsc::unbounded_channel();
        let (log_tx, log_rx) = mpsc::unbounded_channel();
        Self {
            state_tx,
            state_rx,
            log_tx,
            log_rx,
        }
    }

    /// A cloneable producer handle for tasks and completion callbacks.
    pub fn sender(&self) -> MessageSender {
        MessageSender {
            state: self.state_tx.clone(),
            log: self.log_tx.clone(),
        }
    }

    /// Take every message currently queued on the state queue.
    pub fn drain_state(&mut self) -> Vec<Message> {
        drain(&mut self.state_rx)
    }

    /// Take every message currently queued on the log queue.
    pub fn drain_log(&mut self) -> Vec<Message> {
        drain(&mut self.log_rx)
    }

    /// Stop accepting messages and discard whatever is still queued.
    ///
    /// Producers that outlive the run (abandoned workers) get a send error
    /// instead of filling a queue nobody reads.
    pub fn close(&mut self) {
        self.state_rx.close();
        self.log_rx.close();
        let dropped = self.drain_state().len() + self.drain_log().len();
        if dropped > 0 {
            debug!(dropped, "Discarded late messages on channel close");
        }
    }
}

impl Default for MessageChannel {
    fn default() -> Self {
        Self::new()
    }
}

fn drain(rx: &mut UnboundedReceiver<Message>) -> Vec<Message> {
    let mut out = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(msg) => out.push(msg),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
        }
    }
    out
}

/// Producer side of a [`MessageChannel`]. Usable from any thread.
#[derive(Clone)]
pub struct MessageSender {
    state: UnboundedSender<Message>,
    log: UnboundedSender<Message>,
}

impl MessageSender {
    /// Post a status transition. Returns `false` if the orchestrator is gone.
    pub fn post_status(&self, task_id: &str, update: StatusUpdate) -> bool {
        debug!(task_id, status = %update.status(), "Post status message");
        self.send_state(Message::status(task_id, update))
    }

    /// Post a progress fraction on the log queue.
    pub fn post_progress(&self, task_id: &str, fraction: f64) -> bool {
        self.send_log(Message::progress(task_id, fraction))
    }

    /// Post a log line on the log queue.
    pub fn post_log(&self, task_id: &str, text: impl Into<String>) -> bool {
        self.send_log(Message::log(task_id, text))
    }

    fn send_state(&self, msg: Message) -> bool {
        let task_id = msg.task_id.clone();
        match self.state.send(msg) {
            Ok(()) => true,
            Err(_) => {
                warn!(task_id = %task_id, "State queue closed, unable to post message");
                false
            }
        }
    }

    fn send_log(&self, msg: Message) -> bool {
        let task_id = msg.task_id.clone();
        match self.log.send(msg) {
            Ok(()) => true,
            Err(_) => {
                warn!(task_id = %task_id, "Log queue closed, unable to post message");
                false
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::types::{MessageBody, MessageType};

    #[test]
    fn test_drain_empty() {
        let mut channel = MessageChannel::new();
        assert!(channel.drain_state().is_empty());
        assert!(channel.drain_log().is_empty());
    }

    #[test]
    fn test_messages_are_routed_by_kind() {
        let mut channel = MessageChannel::new();
        let sender = channel.sender();
        assert!(sender.post_status("a", StatusUpdate::New));
        assert!(sender.post_progress("a", 0.25));
        assert!(sender.post_log("a", "halfway"));

        let state = channel.drain_state();
        assert_eq!(state.len(), 1);
        assert_eq!(state[0].kind(), MessageType::Status);

        let log = channel.drain_log();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].body, MessageBody::Progress(0.25));
        assert_eq!(log[1].body, MessageBody::Log("halfway".into()));
    }

    #[test]
    fn test_fifo_per_producer_across_threads() {
        let mut channel = MessageChannel::new();
        let sender = channel.sender();
        let handle = std::thread::spawn(move || {
            for i in 0..100 {
                sender.post_progress("t", f64::from(i) / 100.0);
            }
        });
        handle.join().unwrap();

        let values: Vec<f64> = channel
            .drain_log()
            .into_iter()
            .filter_map(|m| match m.body {
                MessageBody::Progress(p) => Some(p),
                _ => None,
            })
            .collect();
        assert_eq!(values.len(), 100);
        assert!(values.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_post_after_close_fails_softly() {
        let mut channel = MessageChannel::new();
        let sender = channel.sender();
        sender.post_log("a", "before close");
        channel.close();
        assert!(!sender.post_status("a", StatusUpdate::New));
        assert!(!sender.post_progress("a", 1.0));
    }
}
