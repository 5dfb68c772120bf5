//! Metric input: values are fetched into a ring buffer and fed to the
//! sequencer one at a time at a fixed output rate.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use crossbeam::channel::{self, Receiver, Sender};
use crossbeam::queue::ArrayQueue;
use crossbeam::select;
use serde::Deserialize;

use crate::config::SourceConfig;
use crate::control::SourceCommand;

/// Bounded buffer of fetched values. When full the oldest value goes.
#[derive(Clone)]
pub struct Ring {
    values: Arc<ArrayQueue<f64>>,
}

impl Ring {
    pub fn new(capacity: usize) -> Self {
        Ring {
            values: Arc::new(ArrayQueue::new(capacity.max(1))),
        }
    }

    pub fn extend(&self, values: impl IntoIterator<Item = f64>) {
        for value in values {
            self.values.force_push(value);
        }
    }

    pub fn pop(&self) -> Option<f64> {
        self.values.pop()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn clear(&self) {
        while self.values.pop().is_some() {}
    }
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    status: String,
    #[serde(default)]
    data: Option<ApiData>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiData {
    #[serde(rename = "resultType")]
    result_type: String,
    result: Vec<Series>,
}

#[derive(Debug, Deserialize)]
struct Series {
    #[serde(default)]
    values: Vec<(f64, String)>,
}

/// Values of the first series of a `query_range` response.
pub fn parse_range_response(body: &str) -> Result<Vec<f64>> {
    let response: ApiResponse = serde_json::from_str(body).context("decoding query response")?;
    if response.status != "success" {
        bail!(
            "query failed: {}",
            response.error.unwrap_or_else(|| response.status.clone())
        );
    }
    let data = match response.data {
        Some(data) => data,
        None => bail!("query response has no data"),
    };
    if data.result_type != "matrix" {
        bail!("expected a matrix result, got {}", data.result_type);
    }
    let series = match data.result.into_iter().next() {
        Some(series) => series,
        None => return Ok(Vec::new()),
    };
    Ok(series
        .values
        .into_iter()
        .filter_map(|(timestamp, value)| match value.parse::<f64>() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!("Skipping unparsable sample {:?} at {}", value, timestamp);
                None
            }
        })
        .collect())
}

pub struct Prometheus {
    client: reqwest::blocking::Client,
    endpoint: String,
    query: String,
    step: u32,
}

impl Prometheus {
    pub fn new(server: &str, query: &str, step: u32) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("building HTTP client")?;
        Ok(Prometheus {
            client,
            endpoint: format!("{}/api/v1/query_range", server.trim_end_matches('/')),
            query: query.to_owned(),
            step,
        })
    }

    pub fn query_range(&self, start: f64, end: f64) -> Result<Vec<f64>> {
        let body = self
            .client
            .get(&self.endpoint)
            .query(&[
                ("query", self.query.clone()),
                ("start", format!("{:.6}", start)),
                ("end", format!("{:.6}", end)),
                ("step", self.step.to_string()),
            ])
            .send()
            .with_context(|| format!("querying {}", self.endpoint))?
            .error_for_status()?
            .text()?;
        parse_range_response(&body)
    }

    /// Backfill span when no explicit start is given: a hundred steps.
    fn window(&self) -> f64 {
        self.step as f64 * 100.0
    }

    /// Logs failures and returns no values.
    fn fetch(&self, start: f64, end: f64) -> Vec<f64> {
        match self.query_range(start, end) {
            Ok(values) => {
                tracing::debug!("Fetched {} values", values.len());
                values
            }
            Err(err) => {
                tracing::warn!("Prometheus query failed: {:#}", err);
                Vec::new()
            }
        }
    }
}

/// Numbers separated by whitespace or commas. Anything else is skipped.
pub fn parse_replay(text: &str) -> Vec<f64> {
    text.split(|c: char| c.is_whitespace() || c == ',')
        .filter(|token| !token.is_empty())
        .filter_map(|token| match token.parse::<f64>() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!("Skipping non-numeric replay token {:?}", token);
                None
            }
        })
        .collect()
}

pub fn read_replay(path: &Path) -> Result<Vec<f64>> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("reading replay file {}", path.display()))?;
    Ok(parse_replay(&text))
}

fn now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs_f64())
        .unwrap_or(0.0)
}

/// Handle for steering running source threads. Cheap to clone.
#[derive(Clone)]
pub struct SourceControl {
    feeder: Sender<SourceCommand>,
    poller: Option<Sender<SourceCommand>>,
}

impl SourceControl {
    pub fn send(&self, command: SourceCommand) {
        let target = match command {
            SourceCommand::Start | SourceCommand::Stop | SourceCommand::SetOutputRate(_) => {
                Some(&self.feeder)
            }
            SourceCommand::SetPollRate(_) | SourceCommand::Query(_) => self.poller.as_ref(),
        };
        match target {
            Some(target) => {
                if target.try_send(command).is_err() {
                    tracing::warn!("Metric source is not taking commands");
                }
            }
            None => tracing::warn!("{:?} needs a live Prometheus source", command),
        }
    }
}

/// Running source threads. Dropping the handle leaves them running; call
/// `stop` to end them.
pub struct MetricSource {
    quit_tx: Sender<()>,
    control: SourceControl,
    threads: Vec<JoinHandle<()>>,
    feeder: Option<JoinHandle<()>>,
    finite: bool,
}

impl MetricSource {
    /// Backfills the ring and starts the feeder (and, for live Prometheus,
    /// the poller). Values go out on `output`.
    pub fn spawn(config: &SourceConfig, output: Sender<f64>) -> Result<Self> {
        let (quit_tx, quit_rx) = channel::bounded::<()>(0);
        let (feeder_tx, feeder_rx) = channel::bounded(16);
        let mut poller = None;
        let mut threads = Vec::new();
        let (ring, rate, finite) = match config {
            SourceConfig::Prometheus {
                server,
                query,
                start,
                end,
                step,
                live,
                poll_ms,
                output_rate_ms,
                ring_size,
            } => {
                let prometheus = Prometheus::new(server, query, *step)?;
                let ring = Ring::new(*ring_size);
                let end = end.unwrap_or_else(now);
                let start = start.unwrap_or(end - prometheus.window());
                let backfill = prometheus.fetch(start, end);
                tracing::info!("Backfilled {} values from {}", backfill.len(), server);
                ring.extend(backfill);
                if *live {
                    let (poller_tx, poller_rx) = channel::bounded(16);
                    poller = Some(poller_tx);
                    threads.push(spawn_poller(
                        prometheus,
                        ring.clone(),
                        Duration::from_millis(*poll_ms),
                        poller_rx,
                        quit_rx.clone(),
                    ));
                }
                (ring, *output_rate_ms, !*live)
            }
            SourceConfig::Replay {
                path,
                output_rate_ms,
                ring_size,
            } => {
                let values = read_replay(path)?;
                tracing::info!("Replaying {} values from {}", values.len(), path.display());
                let ring = Ring::new((*ring_size).max(values.len()));
                ring.extend(values);
                (ring, *output_rate_ms, true)
            }
        };
        let feeder = spawn_feeder(
            ring,
            Duration::from_millis(rate),
            finite,
            output,
            feeder_rx,
            quit_rx,
        );
        Ok(MetricSource {
            quit_tx,
            control: SourceControl {
                feeder: feeder_tx,
                poller,
            },
            threads,
            feeder: Some(feeder),
            finite,
        })
    }

    pub fn control(&self) -> SourceControl {
        self.control.clone()
    }

    /// Whether the feeder ends by itself once its values are used up.
    pub fn is_finite(&self) -> bool {
        self.finite
    }

    /// Blocks until the feeder exits. Never returns for a live source
    /// unless another thread stops it.
    pub fn wait(&mut self) {
        if let Some(feeder) = self.feeder.take() {
            feeder.join().ok();
        }
    }

    pub fn stop(self) {
        let MetricSource {
            quit_tx,
            threads,
            feeder,
            ..
        } = self;
        drop(quit_tx);
        for thread in feeder.into_iter().chain(threads) {
            thread.join().ok();
        }
    }
}

fn spawn_poller(
    mut prometheus: Prometheus,
    ring: Ring,
    mut interval: Duration,
    mut commands: Receiver<SourceCommand>,
    quit_rx: Receiver<()>,
) -> JoinHandle<()> {
    thread::spawn(move || loop {
        let mut closed = false;
        select! {
            recv(quit_rx) -> _ => return,
            recv(commands) -> command => match command {
                Ok(SourceCommand::SetPollRate(ms)) => {
                    interval = Duration::from_millis(ms);
                    tracing::info!("Poll rate set to {}ms", ms);
                }
                Ok(SourceCommand::Query(query)) => {
                    tracing::info!("Query set to {}", query);
                    prometheus.query = query;
                    let end = now();
                    let values = prometheus.fetch(end - prometheus.window(), end);
                    ring.clear();
                    ring.extend(values);
                }
                Ok(command) => tracing::debug!("Poller ignoring {:?}", command),
                Err(_) => closed = true,
            },
            default(interval) => {
                let at = now();
                ring.extend(prometheus.fetch(at, at));
            }
        }
        if closed {
            commands = channel::never();
        }
    })
}

/// Pops one value per `rate` unless paused. A finite feeder exits once the
/// ring is empty, dropping `output` so the receiver sees the end of input.
pub fn spawn_feeder(
    ring: Ring,
    mut rate: Duration,
    finite: bool,
    output: Sender<f64>,
    mut commands: Receiver<SourceCommand>,
    quit_rx: Receiver<()>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut paused = false;
        let mut closed = false;
        loop {
            let due = select! {
                recv(quit_rx) -> _ => return,
                recv(commands) -> command => {
                    match command {
                        Ok(SourceCommand::Start) => {
                            paused = false;
                            tracing::info!("Metric output resumed");
                        }
                        Ok(SourceCommand::Stop) => {
                            paused = true;
                            tracing::info!("Metric output paused");
                        }
                        Ok(SourceCommand::SetOutputRate(ms)) => {
                            rate = Duration::from_millis(ms);
                            tracing::info!("Output rate set to {}ms", ms);
                        }
                        Ok(command) => tracing::debug!("Feeder ignoring {:?}", command),
                        Err(_) => closed = true,
                    }
                    false
                },
                default(rate) => true,
            };
            if closed {
                commands = channel::never();
                closed = false;
            }
            if !due || paused {
                continue;
            }
            match ring.pop() {
                Some(value) => {
                    if output.send(value).is_err() {
                        return;
                    }
                }
                None if finite => {
                    tracing::info!("Metric source exhausted");
                    return;
                }
                None => (),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_overwrites_oldest() {
        let ring = Ring::new(3);
        ring.extend([1.0, 2.0, 3.0, 4.0]);
        assert_eq!(ring.len(), 3);
        assert_eq!(ring.pop(), Some(2.0));
    }

    #[test]
    fn parses_matrix_response() {
        let body = r#"{
            "status": "success",
            "data": {
                "resultType": "matrix",
                "result": [
                    {"metric": {"job": "node"}, "values": [[1568722200, "1.5"], [1568722800, "NaN"], [1568723400, "x"], [1568724000, "-3"]]},
                    {"metric": {"job": "other"}, "values": [[1568722200, "99"]]}
                ]
            }
        }"#;
        let values = parse_range_response(body).unwrap();
        assert_eq!(values.len(), 3);
        assert_eq!(values[0], 1.5);
        assert!(values[1].is_nan());
        assert_eq!(values[2], -3.0);
    }

    #[test]
    fn empty_and_failed_responses() {
        let empty = r#"{"status":"success","data":{"resultType":"matrix","result":[]}}"#;
        assert!(parse_range_response(empty).unwrap().is_empty());
        let failed = r#"{"status":"error","errorType":"bad_data","error":"parse error"}"#;
        assert!(parse_range_response(failed).is_err());
        assert!(parse_range_response("<html>").is_err());
    }

    #[test]
    fn replay_tokens() {
        assert_eq!(
            parse_replay("3.0, 7\n1.0\tfoo -2.5,,"),
            vec![3.0, 7.0, 1.0, -2.5]
        );
    }

    fn ring(values: &[f64]) -> Ring {
        let ring = Ring::new(8);
        ring.extend(values.iter().copied());
        ring
    }

    #[test]
    fn finite_feeder_ends_input() {
        let (tx, rx) = channel::unbounded();
        let (_command_tx, command_rx) = channel::unbounded();
        let (_quit_tx, quit_rx) = channel::bounded(0);
        let feeder = spawn_feeder(
            ring(&[3.0, 7.0, 1.0]),
            Duration::from_millis(1),
            true,
            tx,
            command_rx,
            quit_rx,
        );
        feeder.join().unwrap();
        assert_eq!(rx.iter().collect::<Vec<_>>(), vec![3.0, 7.0, 1.0]);
    }

    #[test]
    fn feeder_picks_up_new_rate() {
        let (tx, rx) = channel::unbounded();
        let (command_tx, command_rx) = channel::unbounded();
        let (_quit_tx, quit_rx) = channel::bounded(0);
        command_tx.send(SourceCommand::SetOutputRate(1)).unwrap();
        let feeder = spawn_feeder(
            ring(&[1.0, 2.0]),
            Duration::from_secs(3600),
            true,
            tx,
            command_rx,
            quit_rx,
        );
        feeder.join().unwrap();
        assert_eq!(rx.iter().collect::<Vec<_>>(), vec![1.0, 2.0]);
    }

    #[test]
    fn paused_feeder_holds_values() {
        let (tx, rx) = channel::unbounded();
        let (command_tx, command_rx) = channel::unbounded();
        let (_quit_tx, quit_rx) = channel::bounded(0);
        command_tx.send(SourceCommand::Stop).unwrap();
        let feeder = spawn_feeder(
            ring(&[4.0, 5.0, 6.0]),
            Duration::from_millis(1),
            true,
            tx,
            command_rx,
            quit_rx,
        );
        std::thread::sleep(Duration::from_millis(50));
        assert!(rx.try_recv().is_err());

        command_tx.send(SourceCommand::Start).unwrap();
        feeder.join().unwrap();
        assert_eq!(rx.iter().collect::<Vec<_>>(), vec![4.0, 5.0, 6.0]);
    }

    #[test]
    fn quit_stops_a_live_feeder() {
        let (tx, rx) = channel::unbounded();
        let (_command_tx, command_rx) = channel::unbounded();
        let (quit_tx, quit_rx) = channel::bounded(0);
        let feeder = spawn_feeder(
            Ring::new(4),
            Duration::from_millis(1),
            false,
            tx,
            command_rx,
            quit_rx,
        );
        drop(quit_tx);
        feeder.join().unwrap();
        assert_eq!(rx.iter().count(), 0);
    }

    #[test]
    fn control_without_poller_only_reaches_feeder() {
        let (feeder_tx, feeder_rx) = channel::unbounded();
        let control = SourceControl {
            feeder: feeder_tx,
            poller: None,
        };
        control.send(SourceCommand::SetPollRate(100));
        control.send(SourceCommand::Stop);
        assert_eq!(feeder_rx.try_iter().collect::<Vec<_>>(), vec![SourceCommand::Stop]);
    }

    #[test]
    fn ring_clears() {
        let ring = ring(&[1.0, 2.0]);
        ring.clear();
        assert!(ring.is_empty());
        assert_eq!(ring.pop(), None);
    }
}
