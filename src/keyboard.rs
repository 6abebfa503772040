use std::io::BufRead;
use std::sync::Mutex;
use std::thread;

use crossbeam_channel::{bounded, select, Sender};
use tokio::sync::broadcast;
use tracing::debug;

/// One operator keystroke line, or the shutdown sentinel the broker posts
/// on DRAIN entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyEvent {
    Line(String),
    Shutdown,
}

/// Single-source stdin fan-out for one host.
///
/// Exactly one reader thread owns stdin. Every local worker subscribes to
/// the broadcast side and sees every keystroke exactly once,
/// independently of the other subscribers. The blocking `read_line` runs
/// on an inner detached thread feeding a channel, so the reader thread
/// itself can always be unblocked by the sentinel even while stdin stays
/// open.
pub struct KeyboardHub {
    tx: broadcast::Sender<KeyEvent>,
    stop_tx: Mutex<Option<Sender<()>>>,
}

impl KeyboardHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            stop_tx: Mutex::new(None),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<KeyEvent> {
        self.tx.subscribe()
    }

    /// Injects a line as if the operator had typed it. Used by the notes
    /// producer tests and by harness code that scripts operator input.
    pub fn post_line(&self, line: impl Into<String>) {
        let _ = self.tx.send(KeyEvent::Line(line.into()));
    }

    /// Posts the shutdown sentinel. The reader thread unblocks and exits;
    /// all subscribers observe `KeyEvent::Shutdown`.
    pub fn post_shutdown(&self) {
        if let Some(stop) = self
            .stop_tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        {
            let _ = stop.send(());
        } else {
            // No reader thread attached; deliver the sentinel directly.
            let _ = self.tx.send(KeyEvent::Shutdown);
        }
    }

    /// Starts the per-host reader thread. Call at most once.
    pub fn spawn_reader(&self) -> thread::JoinHandle<()> {
        let (line_tx, line_rx) = bounded::<String>(64);
        let (stop_tx, stop_rx) = bounded::<()>(1);
        *self
            .stop_tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(stop_tx);

        // Inner thread parked on stdin. Detached on purpose: it may still
        // sit in read_line at process exit while the reader thread has
        // already terminated on the sentinel.
        thread::Builder::new()
            .name("hermes-stdin".into())
            .spawn(move || {
                let stdin = std::io::stdin();
                let mut lines = stdin.lock();
                let mut line = String::new();
                loop {
                    line.clear();
                    match lines.read_line(&mut line) {
                        Ok(0) => break,
                        Ok(_) => {
                            let trimmed = line.trim_end_matches(['\r', '\n']).to_string();
                            if line_tx.send(trimmed).is_err() {
                                break;
                            }
                        }
                        Err(_) => break,
                    }
                }
            })
            .expect("failed to spawn stdin thread");

        let broadcast_tx = self.tx.clone();
        thread::Builder::new()
            .name("hermes-keyboard".into())
            .spawn(move || {
                loop {
                    select! {
                        recv(line_rx) -> line => match line {
                            Ok(line) => {
                                let _ = broadcast_tx.send(KeyEvent::Line(line));
                            }
                            // Stdin closed; keep waiting for the sentinel
                            // so shutdown ordering stays uniform.
                            Err(_) => {
                                let _ = stop_rx.recv();
                                let _ = broadcast_tx.send(KeyEvent::Shutdown);
                                break;
                            }
                        },
                        recv(stop_rx) -> _ => {
                            let _ = broadcast_tx.send(KeyEvent::Shutdown);
                            break;
                        }
                    }
                }
                debug!("keyboard reader thread exited");
            })
            .expect("failed to spawn keyboard reader thread")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn every_subscriber_sees_every_line_once() {
        let hub = KeyboardHub::new(16);
        let mut a = hub.subscribe();
        let mut b = hub.subscribe();
        hub.post_line("mark");
        hub.post_line("stop");
        for rx in [&mut a, &mut b] {
            assert_eq!(rx.recv().await.unwrap(), KeyEvent::Line("mark".into()));
            assert_eq!(rx.recv().await.unwrap(), KeyEvent::Line("stop".into()));
        }
    }

    #[tokio::test]
    async fn shutdown_without_reader_reaches_subscribers() {
        let hub = KeyboardHub::new(4);
        let mut rx = hub.subscribe();
        hub.post_shutdown();
        assert_eq!(rx.recv().await.unwrap(), KeyEvent::Shutdown);
    }
}
