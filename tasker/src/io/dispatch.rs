//! Hand-off of a serialized task to a remote task server.
//!
//! The server's protocol beyond "receive the task file bytes" is not modelled.

use std::io::Write;
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument};

use crate::io::config::DispatchConfig;
use crate::io::persist::task_to_bytes;
use crate::settings::SettingsRegistry;
use crate::task::TaskDescriptor;

pub trait Dispatcher {
    /// Human-readable endpoint, for logs.
    fn endpoint(&self) -> String;

    fn dispatch(&self, payload: &[u8]) -> Result<()>;
}

/// Sends the payload over a plain TCP connection and closes the write side.
#[derive(Debug, Clone)]
pub struct TcpDispatcher {
    pub host: String,
    pub port: u16,
    pub timeout: Duration,
}

impl TcpDispatcher {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            timeout: Duration::from_secs(10),
        }
    }

    pub fn from_config(cfg: &DispatchConfig) -> Self {
        Self {
            host: cfg.host.clone(),
            port: cfg.port,
            timeout: Duration::from_secs(cfg.connect_timeout_secs),
        }
    }
}

impl Dispatcher for TcpDispatcher {
    fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn dispatch(&self, payload: &[u8]) -> Result<()> {
        let addr = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .with_context(|| format!("resolve {}", self.endpoint()))?
            .next()
            .ok_or_else(|| anyhow!("no address for {}", self.endpoint()))?;
        let mut stream = TcpStream::connect_timeout(&addr, self.timeout)
            .with_context(|| format!("connect {}", self.endpoint()))?;
        stream
            .set_write_timeout(Some(self.timeout))
            .context("set write timeout")?;
        stream.write_all(payload).context("send task")?;
        stream.flush().context("flush task")?;
        stream
            .shutdown(Shutdown::Write)
            .context("close task stream")?;
        debug!(bytes = payload.len(), endpoint = %self.endpoint(), "task sent");
        Ok(())
    }
}

/// Serialize `task` and hand it to `dispatcher`. Returns the payload size.
#[instrument(skip_all, fields(endpoint = %dispatcher.endpoint()))]
pub fn enqueue<D: Dispatcher + ?Sized>(
    task: &TaskDescriptor,
    dispatcher: &D,
    registry: &SettingsRegistry,
) -> Result<usize> {
    let payload = task_to_bytes(task, registry)?;
    dispatcher.dispatch(&payload)?;
    info!(owner = %task.owner, bytes = payload.len(), "task enqueued");
    Ok(payload.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::RunEnvironment;
    use crate::settings::CommandSettings;
    use std::io::Read;
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn tcp_dispatch_delivers_task_file() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let server = thread::spawn(move || {
            let (mut conn, _) = listener.accept().expect("accept");
            let mut received = String::new();
            conn.read_to_string(&mut received).expect("read");
            received
        });

        let env = RunEnvironment::from_process();
        let task = TaskDescriptor::builder(CommandSettings::new("solver"))
            .owner("alice")
            .build(&env)
            .expect("build");
        let dispatcher = TcpDispatcher::new("127.0.0.1", port);
        let sent = enqueue(&task, &dispatcher, &SettingsRegistry::with_defaults())
            .expect("enqueue");

        let received = server.join().expect("join");
        assert_eq!(received.len(), sent);
        let value: serde_json::Value = serde_json::from_str(&received).expect("json");
        assert_eq!(value["owner"], "alice");
        assert_eq!(value["settings"]["kind"], "command");
    }

    #[test]
    fn unreachable_endpoint_is_an_error() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("addr").port();
        drop(listener);
        let dispatcher = TcpDispatcher::new("127.0.0.1", port);
        assert!(dispatcher.dispatch(b"{}").is_err());
    }
}
