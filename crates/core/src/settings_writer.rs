//! Single-writer queue in front of the settings store
//!
//! UI actions can fire saves in quick succession (dragging the window, a
//! slider). Every request goes through one thread, and each time it wakes up
//! it only persists the newest record it has been handed.

use crate::error::SettingsError;
use crate::settings::{PersistedSettings, SettingsStore};
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info};

enum WriterMessage {
    Save(Box<PersistedSettings>),
    /// Reply once everything queued before this message is on disk
    Flush(Sender<Result<(), String>>),
}

/// What one wake-up of the writer has to do
#[derive(Default)]
struct Batch {
    latest: Option<Box<PersistedSettings>>,
    waiters: Vec<Sender<Result<(), String>>>,
}

impl Batch {
    fn absorb(&mut self, message: WriterMessage) {
        match message {
            WriterMessage::Save(settings) => self.latest = Some(settings),
            WriterMessage::Flush(reply) => self.waiters.push(reply),
        }
    }
}

/// Drain everything already queued behind `first`
fn drain_batch(first: WriterMessage, rx: &Receiver<WriterMessage>) -> Batch {
    let mut batch = Batch::default();
    batch.absorb(first);
    for message in rx.try_iter() {
        batch.absorb(message);
    }
    batch
}

/// Handle to the writer thread. Dropping it flushes and joins.
pub struct SettingsWriter {
    tx: Option<Sender<WriterMessage>>,
    thread: Option<JoinHandle<()>>,
    saves: Arc<AtomicUsize>,
}

impl SettingsWriter {
    pub fn spawn(store: SettingsStore) -> std::io::Result<Self> {
        let (tx, rx) = unbounded::<WriterMessage>();
        let saves = Arc::new(AtomicUsize::new(0));
        let thread_saves = Arc::clone(&saves);

        let thread = thread::Builder::new()
            .name("settings-writer".to_string())
            .spawn(move || run_writer(store, rx, thread_saves))?;

        Ok(SettingsWriter {
            tx: Some(tx),
            thread: Some(thread),
            saves,
        })
    }

    /// Queue a record; older queued records are superseded
    pub fn queue(&self, settings: PersistedSettings) -> Result<(), SettingsError> {
        self.send(WriterMessage::Save(Box::new(settings)))
    }

    /// Block until everything queued so far has been written
    pub fn flush(&self) -> Result<(), SettingsError> {
        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        self.send(WriterMessage::Flush(reply_tx))?;
        match reply_rx.recv() {
            Ok(Ok(())) => Ok(()),
            Ok(Err(message)) => Err(SettingsError::Flush(message)),
            Err(_) => Err(SettingsError::WriterClosed),
        }
    }

    /// Number of files actually written by this writer
    pub fn saves_performed(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    fn send(&self, message: WriterMessage) -> Result<(), SettingsError> {
        self.tx
            .as_ref()
            .ok_or(SettingsError::WriterClosed)?
            .send(message)
            .map_err(|_| SettingsError::WriterClosed)
    }
}

impl Drop for SettingsWriter {
    fn drop(&mut self) {
        // Closing the channel lets the thread finish what is queued and exit
        self.tx.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("settings writer thread panicked");
            }
        }
    }
}

fn run_writer(store: SettingsStore, rx: Receiver<WriterMessage>, saves: Arc<AtomicUsize>) {
    info!("settings writer started for {}", store.path().display());

    while let Ok(first) = rx.recv() {
        let batch = drain_batch(first, &rx);

        let result = match batch.latest {
            Some(settings) => match store.save(&settings) {
                Ok(()) => {
                    saves.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
                Err(err) => {
                    error!("failed to save settings: {}", err);
                    Err(err.to_string())
                }
            },
            None => Ok(()),
        };

        for waiter in batch.waiters {
            let _ = waiter.send(result.clone());
        }
    }

    debug!("settings writer stopped");
}
