//! Producer Adapters
//!
//! The orchestrator only knows the [`Producer`] capability: "send one
//! telemetry payload for this mode". [`TcpProducer`] is the stock adapter; it
//! asks a [`PayloadGenerator`] for the payload and ships it to the ingestion
//! server as one frame over its own persistent connection.
//!
//! Producers are lossy by contract. A failed send drops the connection and
//! reports a transport error; the next send reconnects.

pub mod sensors;

use crate::codec::{Reading, encode_frame};
use crate::error::{Result, TestbedError};
use serde_json::{Map, Value};
use std::io::{self, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;
use tracing::{debug, warn};

/// Capability invoked once per tick per subsystem
pub trait Producer: Send {
    /// Subsystem whose mode drives this producer
    fn subsystem(&self) -> &str;

    /// Produce and transmit one payload for `mode`
    fn send(&mut self, mode: &str) -> Result<()>;
}

/// Turns a mode into telemetry fields
pub trait PayloadGenerator: Send {
    fn generate(&mut self, mode: &str) -> Map<String, Value>;
}

/// Builds the producer set for a run
pub trait ProducerFactory: Send + Sync {
    fn build(&self) -> Vec<Box<dyn Producer>>;
}

impl<F> ProducerFactory for F
where
    F: Fn() -> Vec<Box<dyn Producer>> + Send + Sync,
{
    fn build(&self) -> Vec<Box<dyn Producer>> {
        self()
    }
}

/// Producer that streams frames to the ingestion server over TCP
pub struct TcpProducer {
    subsystem: String,
    target: String,
    generator: Box<dyn PayloadGenerator>,
    connect_timeout: Duration,
    stream: Option<TcpStream>,
}

impl TcpProducer {
    pub fn new(
        subsystem: impl Into<String>,
        target: impl Into<String>,
        generator: Box<dyn PayloadGenerator>,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            subsystem: subsystem.into(),
            target: target.into(),
            generator,
            connect_timeout,
            stream: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn connected(&mut self) -> io::Result<&mut TcpStream> {
        if self.stream.is_none() {
            let stream = connect(&self.target, self.connect_timeout)?;
            debug!(subsystem = %self.subsystem, target = %self.target, "Producer connected");
            self.stream = Some(stream);
        }
        self.stream
            .as_mut()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))
    }
}

impl Producer for TcpProducer {
    fn subsystem(&self) -> &str {
        &self.subsystem
    }

    fn send(&mut self, mode: &str) -> Result<()> {
        let reading = Reading::new(self.subsystem.clone(), self.generator.generate(mode));
        let frame = encode_frame(&reading)?;

        let result = self.connected().and_then(|stream| stream.write_all(&frame));
        if let Err(source) = result {
            // Reconnect on the next tick
            self.stream = None;
            return Err(TestbedError::Transport {
                subsystem: self.subsystem.clone(),
                source,
            });
        }
        Ok(())
    }
}

fn connect(target: &str, timeout: Duration) -> io::Result<TcpStream> {
    let mut last_err = io::Error::new(
        io::ErrorKind::AddrNotAvailable,
        format!("no address resolved for {}", target),
    );
    for addr in target.to_socket_addrs()? {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                stream.set_write_timeout(Some(timeout))?;
                return Ok(stream);
            }
            Err(e) => last_err = e,
        }
    }
    Err(last_err)
}

/// Factory producing one [`TcpProducer`] per configured sensor
#[derive(Debug, Clone)]
pub struct SensorFactory {
    target: String,
    sensors: Vec<String>,
    connect_timeout: Duration,
}

impl SensorFactory {
    pub fn new(target: impl Into<String>, sensors: Vec<String>, connect_timeout: Duration) -> Self {
        Self {
            target: target.into(),
            sensors,
            connect_timeout,
        }
    }
}

impl ProducerFactory for SensorFactory {
    fn build(&self) -> Vec<Box<dyn Producer>> {
        self.sensors
            .iter()
            .filter_map(|name| match sensors::generator_for(name) {
                Some(generator) => Some(Box::new(TcpProducer::new(
                    name.clone(),
                    self.target.clone(),
                    generator,
                    self.connect_timeout,
                )) as Box<dyn Producer>),
                None => {
                    warn!(sensor = %name, "No generator for sensor, skipping");
                    None
                }
            })
            .collect()
    }
}
