//! Environment-driven configuration for both processes.

use std::env;
use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use log::warn;

/// Built-in development secret, used only when `STARLANE_SECRET` is absent.
pub const FALLBACK_SECRET: &[u8] = b"starlane-dev-secret";

/// Runtime configuration shared by the gateway and game-server binaries.
///
/// Every field has an environment variable and a default:
///
/// | Variable | Default | Meaning |
/// |---|---|---|
/// | `STARLANE_UDP_BIND` | `0.0.0.0:4242` | game-server UDP bind address |
/// | `STARLANE_UDP_EXTERNAL` | `127.0.0.1:4242` | endpoint advertised to clients |
/// | `STARLANE_GATEWAY_ADDR` | `127.0.0.1:4243` | gateway address the game server dials |
/// | `STARLANE_GATEWAY_LISTEN` | `0.0.0.0:4243` | gateway TCP bind address |
/// | `STARLANE_SECRET` | built-in (warns) | shared HMAC secret |
/// | `STARLANE_WORKERS` | `1` | advisory; the core is single-threaded |
#[derive(Clone, Debug)]
pub struct Config {
    /// Game-server UDP bind address
    pub udp_bind: SocketAddr,
    /// Endpoint handed to clients in JOIN replies
    pub udp_external: SocketAddr,
    /// Gateway address the game server connects to
    pub gateway_addr: SocketAddr,
    /// Gateway TCP bind address
    pub gateway_listen: SocketAddr,
    /// Shared HMAC secret
    pub secret: Vec<u8>,
    /// Advisory worker count; the event loops ignore it
    pub workers: usize,
}

fn env_addr(var: &str, default: &str) -> SocketAddr {
    match env::var(var) {
        Ok(v) => v.parse().unwrap_or_else(|_| {
            warn!("{} is not a valid address, using {}", var, default);
            default.parse().expect("default address parses")
        }),
        Err(_) => default.parse().expect("default address parses"),
    }
}

impl Config {
    /// Assemble the configuration from the environment.
    pub fn from_env() -> Self {
        let secret = match env::var("STARLANE_SECRET") {
            Ok(s) if !s.is_empty() => s.into_bytes(),
            _ => {
                warn!("STARLANE_SECRET not set, falling back to built-in secret (not recommended for production)");
                FALLBACK_SECRET.to_vec()
            }
        };
        let workers = env::var("STARLANE_WORKERS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(1);

        Self {
            udp_bind: env_addr("STARLANE_UDP_BIND", "0.0.0.0:4242"),
            udp_external: env_addr("STARLANE_UDP_EXTERNAL", "127.0.0.1:4242"),
            gateway_addr: env_addr("STARLANE_GATEWAY_ADDR", "127.0.0.1:4243"),
            gateway_listen: env_addr("STARLANE_GATEWAY_LISTEN", "0.0.0.0:4243"),
            secret,
            workers,
        }
    }

    /// Configuration for tests: loopback everywhere, fixed secret.
    pub fn for_tests(secret: &[u8]) -> Self {
        Self {
            udp_bind: "127.0.0.1:0".parse().expect("loopback parses"),
            udp_external: "127.0.0.1:4242".parse().expect("loopback parses"),
            gateway_addr: "127.0.0.1:4243".parse().expect("loopback parses"),
            gateway_listen: "127.0.0.1:0".parse().expect("loopback parses"),
            secret: secret.to_vec(),
            workers: 1,
        }
    }
}

/// Process-wide shutdown flag, checked between event-loop ticks.
pub fn shutdown_flag() -> Arc<AtomicBool> {
    Arc::new(AtomicBool::new(false))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_uses_given_secret() {
        let cfg = Config::for_tests(b"abc");
        assert_eq!(cfg.secret, b"abc");
        assert_eq!(cfg.workers, 1);
    }
}
