//! Cash drawer kick via ESC/POS over TCP.
//!
//! Sends the standard ESC/POS pulse command to open a cash drawer connected
//! to a thermal receipt printer's DK (drawer kick) port.
//!
//! - **Non-blocking**: `open_cashbox` hands the kick to a blocking task and
//!   returns immediately; checkout never waits on the drawer.
//! - **Rate-limited**: max 1 kick per 2 seconds per drawer address.
//! - **Fail-safe**: errors are logged, never reported to the checkout flow.

use std::collections::HashMap;
use std::io::{self, Write};
use std::net::{AddrParseError, SocketAddr, TcpStream};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Standard ESC/POS pulse command: ESC p m t1 t2
///
/// - `0x1B` (ESC)
/// - `0x70` (p), generate pulse
/// - `0x00` pin 2 (connector pin)
/// - `0x19` on time  (25 × 2ms = 50ms)
/// - `0xFA` off time (250 × 2ms = 500ms)
const ESCPOS_DRAWER_KICK: [u8; 5] = [0x1B, 0x70, 0x00, 0x19, 0xFA];

const TCP_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
const TCP_WRITE_TIMEOUT: Duration = Duration::from_secs(2);

/// Minimum interval between kicks of the same drawer.
const MIN_KICK_INTERVAL: Duration = Duration::from_secs(2);

pub const DEFAULT_DRAWER_PORT: u16 = 9100;

#[derive(Debug, thiserror::Error)]
pub enum DrawerError {
    #[error("Invalid drawer address {addr}: {source}")]
    InvalidAddress {
        addr: String,
        source: AddrParseError,
    },
    #[error("TCP connect to {addr} failed: {source}")]
    Connect { addr: String, source: io::Error },
    #[error("TCP write drawer kick to {addr}: {source}")]
    Write { addr: String, source: io::Error },
    #[error("Drawer kick rate-limited, wait {remaining_ms}ms")]
    RateLimited { remaining_ms: u128 },
}

/// How the drawer is wired to this terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum DrawerMode {
    None,
    EscposTcp { host: String, port: u16 },
}

/// Fire-and-forget cash drawer.
pub trait CashDrawer: Send + Sync {
    /// Request the drawer to open. Never blocks and never fails the caller.
    fn open_cashbox(&self);
}

// ---------------------------------------------------------------------------
// Rate limiter
// ---------------------------------------------------------------------------

/// Last kick per drawer address.
static KICK_TIMES: Mutex<Option<HashMap<String, Instant>>> = Mutex::new(None);

fn rate_limit_check(key: &str) -> Result<(), DrawerError> {
    let mut guard = KICK_TIMES.lock().unwrap_or_else(|e| e.into_inner());
    let map = guard.get_or_insert_with(HashMap::new);

    if let Some(last) = map.get(key) {
        let elapsed = last.elapsed();
        if elapsed < MIN_KICK_INTERVAL {
            return Err(DrawerError::RateLimited {
                remaining_ms: (MIN_KICK_INTERVAL - elapsed).as_millis(),
            });
        }
    }
    map.insert(key.to_string(), Instant::now());
    Ok(())
}

// ---------------------------------------------------------------------------
// TCP transport
// ---------------------------------------------------------------------------

/// Send the ESC/POS drawer kick pulse via TCP to the given host:port.
pub fn send_escpos_pulse_tcp(host: &str, port: u16) -> Result<(), DrawerError> {
    let addr_str = format!("{host}:{port}");
    let addr: SocketAddr = addr_str
        .parse()
        .map_err(|source| DrawerError::InvalidAddress {
            addr: addr_str.clone(),
            source,
        })?;

    let stream = TcpStream::connect_timeout(&addr, TCP_CONNECT_TIMEOUT).map_err(|source| {
        DrawerError::Connect {
            addr: addr_str.clone(),
            source,
        }
    })?;

    let write_err = |source: io::Error| DrawerError::Write {
        addr: addr_str.clone(),
        source,
    };
    stream
        .set_write_timeout(Some(TCP_WRITE_TIMEOUT))
        .map_err(write_err)?;
    let mut writer = io::BufWriter::new(stream);
    writer.write_all(&ESCPOS_DRAWER_KICK).map_err(write_err)?;
    writer.flush().map_err(write_err)?;

    info!(addr = %addr_str, "ESC/POS drawer kick sent");
    Ok(())
}

// ---------------------------------------------------------------------------
// Drawers
// ---------------------------------------------------------------------------

/// Drawer behind a network receipt printer.
#[derive(Debug, Clone)]
pub struct EscPosDrawer {
    host: String,
    port: u16,
}

impl EscPosDrawer {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.trim().to_string(),
            port,
        }
    }

    /// Rate-limited synchronous kick.
    pub fn kick(&self) -> Result<(), DrawerError> {
        rate_limit_check(&format!("{}:{}", self.host, self.port))?;
        send_escpos_pulse_tcp(&self.host, self.port)
    }
}

impl CashDrawer for EscPosDrawer {
    fn open_cashbox(&self) {
        let drawer = self.clone();
        let job = move || match drawer.kick() {
            Ok(()) => {}
            Err(e @ DrawerError::RateLimited { .. }) => debug!(error = %e, "drawer kick skipped"),
            Err(e) => warn!(error = %e, "Non-fatal drawer kick failed"),
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(job);
            }
            Err(_) => {
                std::thread::spawn(job);
            }
        }
    }
}

/// Terminal without drawer hardware.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDrawer;

impl CashDrawer for NoDrawer {
    fn open_cashbox(&self) {
        debug!("open_cashbox ignored: no drawer hardware configured");
    }
}

pub fn drawer_for_mode(mode: &DrawerMode) -> Arc<dyn CashDrawer> {
    match mode {
        DrawerMode::None => Arc::new(NoDrawer),
        DrawerMode::EscposTcp { host, port } => Arc::new(EscPosDrawer::new(host, *port)),
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Read;
    use std::net::TcpListener;

    fn reset_rate_limiter() {
        let mut guard = KICK_TIMES.lock().unwrap();
        *guard = None;
    }

    /// TCP listener on an ephemeral port.
    fn tcp_test_server() -> (TcpListener, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind ephemeral TCP port for test");
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    fn accept_one(listener: TcpListener) -> std::thread::JoinHandle<Vec<u8>> {
        std::thread::spawn(move || {
            let (mut stream, _addr) = listener.accept().expect("accept TCP connection");
            let mut buf = [0u8; 16];
            let n = stream.read(&mut buf).expect("read from TCP connection");
            buf[..n].to_vec()
        })
    }

    #[test]
    fn test_escpos_command_bytes() {
        assert_eq!(ESCPOS_DRAWER_KICK.len(), 5);
        assert_eq!(ESCPOS_DRAWER_KICK[0], 0x1B);
        assert_eq!(ESCPOS_DRAWER_KICK[1], 0x70);
        assert_eq!(ESCPOS_DRAWER_KICK[2], 0x00);
    }

    #[test]
    #[serial]
    fn test_rate_limiter_per_drawer() {
        reset_rate_limiter();
        assert!(rate_limit_check("10.0.0.5:9100").is_ok());

        let again = rate_limit_check("10.0.0.5:9100");
        assert!(matches!(again, Err(DrawerError::RateLimited { .. })));

        assert!(rate_limit_check("10.0.0.6:9100").is_ok());
    }

    #[test]
    #[serial]
    fn test_rate_limiter_allows_after_interval() {
        reset_rate_limiter();
        {
            let mut guard = KICK_TIMES.lock().unwrap();
            guard.get_or_insert_with(HashMap::new).insert(
                "10.0.0.7:9100".to_string(),
                Instant::now() - Duration::from_secs(10),
            );
        }
        assert!(rate_limit_check("10.0.0.7:9100").is_ok());
    }

    #[test]
    fn test_invalid_address() {
        let err = send_escpos_pulse_tcp("not-an-ip", 9100).unwrap_err();
        assert!(matches!(err, DrawerError::InvalidAddress { .. }));
        assert!(err.to_string().contains("Invalid drawer address"));
    }

    #[test]
    fn test_tcp_pulse_receives_exact_bytes() {
        let (listener, port) = tcp_test_server();
        let handle = accept_one(listener);

        send_escpos_pulse_tcp("127.0.0.1", port).expect("pulse sent");

        let received = handle.join().expect("TCP server thread panicked");
        assert_eq!(received, ESCPOS_DRAWER_KICK.to_vec());
    }

    #[test]
    fn test_tcp_pulse_connect_refused() {
        let (listener, port) = tcp_test_server();
        drop(listener);

        let err = send_escpos_pulse_tcp("127.0.0.1", port).unwrap_err();
        assert!(matches!(err, DrawerError::Connect { .. }));
    }

    #[test]
    #[serial]
    fn test_kick_twice_is_rate_limited() {
        reset_rate_limiter();
        let (listener, port) = tcp_test_server();
        let handle = accept_one(listener);

        let drawer = EscPosDrawer::new("127.0.0.1", port);
        drawer.kick().expect("first kick");
        assert_eq!(handle.join().unwrap(), ESCPOS_DRAWER_KICK.to_vec());

        assert!(matches!(
            drawer.kick(),
            Err(DrawerError::RateLimited { .. })
        ));
    }

    #[tokio::test]
    #[serial]
    async fn test_open_cashbox_does_not_block() {
        reset_rate_limiter();
        let (listener, port) = tcp_test_server();
        let handle = accept_one(listener);

        let drawer = EscPosDrawer::new("127.0.0.1", port);
        drawer.open_cashbox();

        let received = tokio::task::spawn_blocking(move || handle.join().unwrap())
            .await
            .unwrap();
        assert_eq!(received, ESCPOS_DRAWER_KICK.to_vec());
    }

    #[test]
    #[serial]
    fn test_open_cashbox_failure_is_swallowed() {
        reset_rate_limiter();
        let (listener, port) = tcp_test_server();
        drop(listener);

        // Outside a runtime the kick runs on a plain thread; nothing to observe
        // except that the caller is unaffected.
        EscPosDrawer::new("127.0.0.1", port).open_cashbox();
    }

    #[test]
    fn test_drawer_mode_serde() {
        let mode: DrawerMode = serde_json::from_value(serde_json::json!({
            "mode": "escpos_tcp",
            "host": "192.168.1.50",
            "port": 9100
        }))
        .unwrap();
        assert_eq!(
            mode,
            DrawerMode::EscposTcp {
                host: "192.168.1.50".to_string(),
                port: 9100
            }
        );
    }
}
