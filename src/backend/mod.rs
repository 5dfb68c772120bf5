//! MIDI transports. Each one drains a channel of [`midi::Event`]s, keeps
//! track of held notes, and releases them when shut down.

#[cfg(feature = "jack")]
pub mod jack;

use std::thread::{self, JoinHandle};

use anyhow::Result;
use crossbeam::channel::{self, Receiver, Sender};
use crossbeam::select;

use crate::config::{BackendKind, MidiConfig};
use crate::midi::{self, HeldNotes};

pub trait Backend {
    /// Sends note-offs for anything still held and closes the transport.
    fn shutdown(self: Box<Self>) -> Result<()>;
}

pub fn open(config: &MidiConfig, events: Receiver<midi::Event>) -> Result<Box<dyn Backend>> {
    match config.backend {
        #[cfg(feature = "jack")]
        BackendKind::Jack => Ok(Box::new(self::jack::JackBackend::new(config, events)?)),
        #[cfg(not(feature = "jack"))]
        BackendKind::Jack => anyhow::bail!("built without JACK support"),
        BackendKind::Log => Ok(Box::new(LogBackend::new(events))),
    }
}

/// Logs every message instead of playing it.
pub struct LogBackend {
    quit_tx: Sender<()>,
    thread: JoinHandle<Vec<midi::Event>>,
}

impl LogBackend {
    pub fn new(events: Receiver<midi::Event>) -> Self {
        let (quit_tx, quit_rx) = channel::bounded::<()>(0);
        let thread = thread::spawn(move || {
            let mut held = HeldNotes::default();
            let mut track = |event: midi::Event| {
                tracing::info!("MIDI {:?}", event);
                held.track(event);
            };
            loop {
                select! {
                    recv(events) -> event => match event {
                        Ok(event) => track(event),
                        Err(_) => break,
                    },
                    recv(quit_rx) -> _ => {
                        events.try_iter().for_each(&mut track);
                        break;
                    }
                }
            }
            let released = held.release_all();
            for event in &released {
                tracing::info!("MIDI {:?} (release)", event);
            }
            released
        });
        LogBackend { quit_tx, thread }
    }
}

impl Backend for LogBackend {
    fn shutdown(self: Box<Self>) -> Result<()> {
        let LogBackend { quit_tx, thread } = *self;
        drop(quit_tx);
        match thread.join() {
            Ok(released) if !released.is_empty() => {
                tracing::warn!("Released {} held notes on shutdown", released.len())
            }
            Ok(_) => (),
            Err(_) => anyhow::bail!("MIDI log thread panicked"),
        }
        Ok(())
    }
}
