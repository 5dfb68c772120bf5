use std::collections::VecDeque;
use std::time::Duration;

use anyhow::{Context, Result};
use crossbeam::channel::{self, Receiver, Sender, TryRecvError};

use super::Backend;
use crate::config::MidiConfig;
use crate::midi::{self, HeldNotes};

/// Writes queued events into the output port once per process cycle.
pub struct Output {
    port: jack::Port<jack::MidiOut>,
    events: Receiver<midi::Event>,
    backlog: VecDeque<midi::Event>,
    held: HeldNotes,
    quit_rx: Receiver<()>,
    done_tx: Sender<()>,
    flushing: bool,
}

impl jack::ProcessHandler for Output {
    fn process(&mut self, _: &jack::Client, ps: &jack::ProcessScope) -> jack::Control {
        let Self {
            port,
            events,
            backlog,
            held,
            quit_rx,
            done_tx,
            flushing,
        } = self;
        backlog.extend(events.try_iter());
        if !*flushing && !matches!(quit_rx.try_recv(), Err(TryRecvError::Empty)) {
            *flushing = true;
        }

        let mut writer = port.writer(ps);
        while let Some(event) = backlog.pop_front() {
            let bytes = event.to_bytes();
            match writer.write(&jack::RawMidi {
                time: 0,
                bytes: bytes.as_slice(),
            }) {
                Ok(()) => held.track(event),
                // Port buffer is full for this cycle; try again next one.
                Err(jack::Error::NotEnoughSpace) => {
                    backlog.push_front(event);
                    return jack::Control::Continue;
                }
                Err(_) => (),
            }
        }

        if *flushing {
            let released = held.release_all();
            if released.is_empty() {
                done_tx.try_send(()).ok();
                return jack::Control::Quit;
            }
            backlog.extend(released);
        }
        jack::Control::Continue
    }
}

pub struct JackBackend {
    async_client: jack::AsyncClient<(), Output>,
    quit_tx: Sender<()>,
    done_rx: Receiver<()>,
}

impl JackBackend {
    pub fn new(config: &MidiConfig, events: Receiver<midi::Event>) -> Result<Self> {
        let (client, _) =
            jack::Client::new(&config.client_name, jack::ClientOptions::NO_START_SERVER)
                .context("connecting to the JACK server")?;
        let port = client.register_port("out", jack::MidiOut::default())?;
        let port_name = port.name()?;
        let (quit_tx, quit_rx) = channel::bounded(1);
        let (done_tx, done_rx) = channel::bounded(1);
        let async_client = client.activate_async(
            (),
            Output {
                port,
                events,
                backlog: VecDeque::with_capacity(64),
                held: HeldNotes::default(),
                quit_rx,
                done_tx,
                flushing: false,
            },
        )?;
        for destination in &config.connect {
            match async_client
                .as_client()
                .connect_ports_by_name(&port_name, destination)
            {
                Ok(()) => tracing::info!("Connected {} to {}", port_name, destination),
                Err(err) => tracing::warn!("Could not connect to {}: {}", destination, err),
            }
        }
        tracing::info!("JACK MIDI output on {}", port_name);
        Ok(JackBackend {
            async_client,
            quit_tx,
            done_rx,
        })
    }
}

impl Backend for JackBackend {
    fn shutdown(self: Box<Self>) -> Result<()> {
        let JackBackend {
            async_client,
            quit_tx,
            done_rx,
        } = *self;
        quit_tx.send(()).ok();
        if done_rx.recv_timeout(Duration::from_secs(1)).is_err() {
            tracing::warn!("JACK did not confirm releasing held notes");
        }
        if let Err(err) = async_client.deactivate() {
            tracing::warn!("Deactivating JACK client failed: {}", err);
        }
        Ok(())
    }
}
