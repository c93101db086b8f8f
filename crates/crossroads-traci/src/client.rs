//! TCP implementation of [`ControlClient`].
//!
//! One [`TraciClient`] owns one socket. Requests are strictly
//! request/response: every call writes one message and reads exactly one
//! reply before returning, so the connection never has more than one
//! exchange in flight.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::codec::{
    Reader, TraciValue, VariableMap, Writer, encode_message, parse_subscription, put_command,
};
use crate::constants::{
    CMD_CLOSE, CMD_GETVERSION, CMD_SET_TL_VARIABLE, CMD_SIMSTEP, ID_COUNT, ID_LIST,
    INVALID_DOUBLE_VALUE, MIN_API_VERSION, TL_PHASE_DURATION, TL_PHASE_INDEX, TYPE_DOUBLE,
    TYPE_INTEGER, VAR_TIME,
};
use crate::domain::Domain;
use crate::error::ProtocolError;
use crate::{Connector, ControlClient};

/// Largest reply body accepted, in bytes.
const MAX_MESSAGE_LEN: usize = 64 * 1024 * 1024;

/// A connected control-port session.
#[derive(Debug)]
pub struct TraciClient {
    stream: TcpStream,
    io_timeout: Duration,
    api_version: i32,
    subscriptions: HashMap<(Domain, String), VariableMap>,
    broken: bool,
}

impl TraciClient {
    /// Dial `host:port` and perform the version handshake.
    pub async fn connect(host: &str, port: u16, io_timeout: Duration) -> Result<Self, ProtocolError> {
        let stream = match tokio::time::timeout(io_timeout, TcpStream::connect((host, port))).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => return Err(ProtocolError::NotListening { port, source }),
            Err(elapsed) => {
                return Err(ProtocolError::NotListening {
                    port,
                    source: std::io::Error::new(std::io::ErrorKind::TimedOut, elapsed),
                });
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "could not disable Nagle on control socket");
        }

        let mut client = Self {
            stream,
            io_timeout,
            api_version: 0,
            subscriptions: HashMap::new(),
            broken: false,
        };
        client.handshake().await?;
        info!(port, api_version = client.api_version, "connected to simulator");
        Ok(client)
    }

    /// Protocol API version reported at handshake.
    pub const fn api_version(&self) -> i32 {
        self.api_version
    }

    async fn handshake(&mut self) -> Result<(), ProtocolError> {
        let mut commands = Vec::new();
        put_command(&mut commands, CMD_GETVERSION, &[])?;
        let reply = self.request(&commands).await?;

        let mut reader = Reader::new(&reply);
        reader.expect_status(CMD_GETVERSION)?;
        let (id, mut body) = reader.command()?;
        if id != CMD_GETVERSION {
            return Err(ProtocolError::Malformed(format!(
                "version response 0x{id:02x}"
            )));
        }
        let found = body.i32()?;
        let identifier = body.string()?;
        debug!(api_version = found, %identifier, "simulator version");
        if found < MIN_API_VERSION {
            return Err(ProtocolError::VersionMismatch {
                found,
                minimum: MIN_API_VERSION,
            });
        }
        self.api_version = found;
        Ok(())
    }

    /// Send one message and read the reply body (without its length).
    ///
    /// Any I/O failure or timeout marks the client broken; every later call
    /// fails fast with [`ProtocolError::ConnectionLost`].
    async fn request(&mut self, commands: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        if self.broken {
            return Err(ProtocolError::lost("connection already failed"));
        }
        let message = encode_message(commands)?;
        let io_timeout = self.io_timeout;
        let result = tokio::time::timeout(io_timeout, exchange(&mut self.stream, &message)).await;
        match result {
            Ok(Ok(body)) => Ok(body),
            Ok(Err(e)) => {
                self.broken = true;
                Err(e)
            }
            Err(_elapsed) => {
                self.broken = true;
                Err(ProtocolError::lost(format!(
                    "no reply within {} ms",
                    io_timeout.as_millis()
                )))
            }
        }
    }

    async fn get(&mut self, domain: Domain, variable: u8, id: &str) -> Result<TraciValue, ProtocolError> {
        let command = domain.get_command();
        let mut payload = Writer::new();
        payload.put_u8(variable).put_string(id)?;
        let mut commands = Vec::new();
        put_command(&mut commands, command, &payload.into_bytes())?;

        let reply = self.request(&commands).await?;
        let mut reader = Reader::new(&reply);
        reader.expect_status(command)?;
        reader.get_response(command, variable)
    }

    async fn set_traffic_light(&mut self, id: &str, variable: u8, value: &[u8]) -> Result<(), ProtocolError> {
        let mut payload = Writer::new();
        payload.put_u8(variable).put_string(id)?;
        let mut payload = payload.into_bytes();
        payload.extend_from_slice(value);
        let mut commands = Vec::new();
        put_command(&mut commands, CMD_SET_TL_VARIABLE, &payload)?;

        let reply = self.request(&commands).await?;
        Reader::new(&reply).expect_status(CMD_SET_TL_VARIABLE)
    }
}

async fn exchange(stream: &mut TcpStream, message: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    stream.write_all(message).await.map_err(ProtocolError::lost)?;
    let total = stream.read_u32().await.map_err(ProtocolError::lost)?;
    let len = usize::try_from(total)
        .ok()
        .and_then(|t| t.checked_sub(4))
        .ok_or_else(|| ProtocolError::lost(format!("invalid reply length {total}")))?;
    if len > MAX_MESSAGE_LEN {
        return Err(ProtocolError::lost(format!("reply of {len} bytes exceeds limit")));
    }
    let mut body = vec![0_u8; len];
    stream.read_exact(&mut body).await.map_err(ProtocolError::lost)?;
    Ok(body)
}

fn expect_f64(value: &TraciValue, what: &str) -> Result<f64, ProtocolError> {
    value
        .as_f64()
        .ok_or_else(|| ProtocolError::Malformed(format!("{what}: expected double, got {}", value.type_name())))
}

#[async_trait]
impl ControlClient for TraciClient {
    async fn advance(&mut self) -> Result<f64, ProtocolError> {
        let mut step = Writer::new();
        step.put_f64(0.0);
        let mut time = Writer::new();
        time.put_u8(VAR_TIME).put_string("")?;
        let sim_get = Domain::Simulation.get_command();

        let mut commands = Vec::new();
        put_command(&mut commands, CMD_SIMSTEP, &step.into_bytes())?;
        put_command(&mut commands, sim_get, &time.into_bytes())?;

        let reply = self.request(&commands).await?;
        let mut reader = Reader::new(&reply);
        reader.expect_status(CMD_SIMSTEP)?;

        let count = reader.i32()?;
        let mut fresh = HashMap::with_capacity(self.subscriptions.len());
        for _ in 0..count {
            let (id, mut body) = reader.command()?;
            let Some(domain) = Domain::from_subscription_response(id) else {
                debug!(response = id, "skipping unrecognized subscription response");
                continue;
            };
            let result = parse_subscription(&mut body)?;
            for (var, reason) in &result.failed {
                debug!(?domain, object = %result.object_id, var, %reason, "subscribed variable unavailable");
            }
            fresh.insert((domain, result.object_id), result.variables);
        }
        self.subscriptions = fresh;

        reader.expect_status(sim_get)?;
        let value = reader.get_response(sim_get, VAR_TIME)?;
        expect_f64(&value, "simulation time")
    }

    async fn subscribe(&mut self, domain: Domain, id: &str, variables: &[u8]) -> Result<(), ProtocolError> {
        let command = domain.subscribe_command();
        let count = u8::try_from(variables.len())
            .map_err(|e| ProtocolError::Malformed(format!("too many variables: {e}")))?;
        let mut payload = Writer::new();
        payload
            .put_f64(INVALID_DOUBLE_VALUE)
            .put_f64(INVALID_DOUBLE_VALUE)
            .put_string(id)?
            .put_u8(count);
        for var in variables {
            payload.put_u8(*var);
        }
        let mut commands = Vec::new();
        put_command(&mut commands, command, &payload.into_bytes())?;

        let reply = self.request(&commands).await?;
        let mut reader = Reader::new(&reply);
        reader.expect_status(command)?;
        // The simulator answers with the current values right away.
        if !reader.is_empty() {
            let (_, mut body) = reader.command()?;
            let result = parse_subscription(&mut body)?;
            self.subscriptions
                .insert((domain, result.object_id), result.variables);
        }
        Ok(())
    }

    fn subscription(&self, domain: Domain, id: &str) -> Option<&VariableMap> {
        self.subscriptions.get(&(domain, id.to_owned()))
    }

    async fn id_list(&mut self, domain: Domain) -> Result<Vec<String>, ProtocolError> {
        let value = self.get(domain, ID_LIST, "").await?;
        match value {
            TraciValue::StringList(ids) => Ok(ids),
            other => Err(ProtocolError::Malformed(format!(
                "id list: expected stringlist, got {}",
                other.type_name()
            ))),
        }
    }

    async fn vehicle_count(&mut self) -> Result<u32, ProtocolError> {
        let value = self.get(Domain::Vehicle, ID_COUNT, "").await?;
        value
            .as_i32()
            .and_then(|n| u32::try_from(n).ok())
            .ok_or_else(|| ProtocolError::Malformed(format!("vehicle count: {value:?}")))
    }

    async fn set_phase(&mut self, id: &str, index: i32) -> Result<(), ProtocolError> {
        let mut value = Writer::new();
        value.put_u8(TYPE_INTEGER).put_i32(index);
        self.set_traffic_light(id, TL_PHASE_INDEX, &value.into_bytes()).await
    }

    async fn phase_duration(&mut self, id: &str) -> Result<f64, ProtocolError> {
        let value = self.get(Domain::TrafficLight, TL_PHASE_DURATION, id).await?;
        expect_f64(&value, "phase duration")
    }

    async fn set_phase_duration(&mut self, id: &str, seconds: f64) -> Result<(), ProtocolError> {
        let mut value = Writer::new();
        value.put_u8(TYPE_DOUBLE).put_f64(seconds);
        self.set_traffic_light(id, TL_PHASE_DURATION, &value.into_bytes()).await
    }

    async fn close(&mut self) -> Result<(), ProtocolError> {
        if self.broken {
            return Ok(());
        }
        let mut commands = Vec::new();
        put_command(&mut commands, CMD_CLOSE, &[])?;
        let outcome = match self.request(&commands).await {
            Ok(reply) => Reader::new(&reply).expect_status(CMD_CLOSE),
            Err(e) => Err(e),
        };
        self.broken = true;
        if let Err(e) = self.stream.shutdown().await {
            debug!(error = %e, "control socket shutdown failed");
        }
        outcome
    }
}

/// Dials the simulator over TCP.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    host: String,
    io_timeout: Duration,
}

impl TcpConnector {
    /// Connector for `host` with a per-request timeout.
    pub fn new(host: impl Into<String>, io_timeout: Duration) -> Self {
        Self {
            host: host.into(),
            io_timeout,
        }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, port: u16) -> Result<Box<dyn ControlClient>, ProtocolError> {
        match TraciClient::connect(&self.host, port, self.io_timeout).await {
            Ok(client) => Ok(Box::new(client)),
            Err(e) => {
                if !e.is_retryable() {
                    warn!(port, error = %e, "control handshake failed");
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::arithmetic_side_effects)]
mod tests {
    use tokio::net::TcpListener;

    use super::*;
    use crate::constants::{
        CMD_SUBSCRIBE_TL_VARIABLE, RESPONSE_OFFSET, RTYPE_OK, TL_CURRENT_PHASE,
    };

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn status(out: &mut Vec<u8>, command: u8) {
        let mut w = Writer::new();
        w.put_u8(RTYPE_OK).put_string("").unwrap();
        put_command(out, command, &w.into_bytes()).unwrap();
    }

    fn version_reply(api: i32) -> Vec<u8> {
        let mut body = Vec::new();
        status(&mut body, CMD_GETVERSION);
        let mut w = Writer::new();
        w.put_i32(api).put_string("fake 1.0").unwrap();
        put_command(&mut body, CMD_GETVERSION, &w.into_bytes()).unwrap();
        encode_message(&body).unwrap()
    }

    fn step_reply(time: f64, phase: i32) -> Vec<u8> {
        let mut body = Vec::new();
        status(&mut body, CMD_SIMSTEP);
        body.extend_from_slice(&1_i32.to_be_bytes());
        let mut sub = Writer::new();
        sub.put_string("J1")
            .unwrap()
            .put_u8(1)
            .put_u8(TL_CURRENT_PHASE)
            .put_u8(RTYPE_OK)
            .put_value(&TraciValue::Int(phase))
            .unwrap();
        put_command(
            &mut body,
            CMD_SUBSCRIBE_TL_VARIABLE.wrapping_add(RESPONSE_OFFSET),
            &sub.into_bytes(),
        )
        .unwrap();

        let sim_get = Domain::Simulation.get_command();
        status(&mut body, sim_get);
        let mut t = Writer::new();
        t.put_u8(VAR_TIME)
            .put_string("")
            .unwrap()
            .put_value(&TraciValue::Double(time))
            .unwrap();
        put_command(&mut body, sim_get.wrapping_add(RESPONSE_OFFSET), &t.into_bytes()).unwrap();
        encode_message(&body).unwrap()
    }

    async fn read_message(stream: &mut TcpStream) -> Vec<u8> {
        let total = stream.read_u32().await.unwrap();
        let mut body = vec![0_u8; usize::try_from(total).unwrap() - 4];
        stream.read_exact(&mut body).await.unwrap();
        body
    }

    #[tokio::test]
    async fn handshake_then_step_fills_subscription_cache() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let hello = read_message(&mut stream).await;
            assert_eq!(hello.get(1), Some(&CMD_GETVERSION));
            stream.write_all(&version_reply(21)).await.unwrap();

            let step = read_message(&mut stream).await;
            assert_eq!(step.get(1), Some(&CMD_SIMSTEP));
            stream.write_all(&step_reply(1.0, 2)).await.unwrap();
        });

        let mut client = TraciClient::connect("127.0.0.1", port, TIMEOUT).await.unwrap();
        assert_eq!(client.api_version(), 21);

        let time = client.advance().await.unwrap();
        assert_eq!(time.to_bits(), 1.0_f64.to_bits());
        let phase = client
            .subscription(Domain::TrafficLight, "J1")
            .and_then(|vars| vars.get(&TL_CURRENT_PHASE))
            .and_then(TraciValue::as_i32);
        assert_eq!(phase, Some(2));
        assert!(client.subscription(Domain::LaneArea, "J1").is_none());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn old_api_version_is_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let _ = read_message(&mut stream).await;
            stream.write_all(&version_reply(10)).await.unwrap();
        });

        let err = TraciClient::connect("127.0.0.1", port, TIMEOUT).await.unwrap_err();
        assert!(matches!(err, ProtocolError::VersionMismatch { found: 10, .. }));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn closed_port_is_not_listening() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = TraciClient::connect("127.0.0.1", port, TIMEOUT).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn peer_hangup_is_connection_lost_and_sticky() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let _ = read_message(&mut stream).await;
            stream.write_all(&version_reply(21)).await.unwrap();
            // Drop the socket before the first step.
        });

        let mut client = TraciClient::connect("127.0.0.1", port, TIMEOUT).await.unwrap();
        let err = client.advance().await.unwrap_err();
        assert!(err.is_connection_lost());
        let err = client.advance().await.unwrap_err();
        assert!(err.is_connection_lost());
    }
}
