//! Client configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::client::SetupHook;

/// Connection options. Deserializable (e.g. from YAML) apart from the setup
/// hooks, which are registered in code.
#[derive(Clone, Serialize, Deserialize)]
pub struct ClientOptions {
    /// "ldap://host[:port]" or "ldaps://host[:port]". Default ports 389/636.
    pub url: Option<String>,
    /// Unix-domain socket path; mutually exclusive with `url`.
    pub socket_path: Option<String>,
    #[serde(default)]
    pub tls: TlsOptions,
    /// Per-request timeout in milliseconds; absent or 0 disables.
    pub timeout_ms: Option<u64>,
    /// Dial timeout in milliseconds; absent or 0 disables.
    pub connect_timeout_ms: Option<u64>,
    /// Emit `Idle` after this long with no outstanding requests.
    pub idle_timeout_ms: Option<u64>,
    /// Tear the transport down after this long without incoming bytes.
    pub socket_timeout_ms: Option<u64>,
    /// Reconnect policy; absent means a single connect attempt.
    pub reconnect: Option<ReconnectOptions>,
    /// When false the request queue starts frozen and offline operations
    /// fail immediately.
    #[serde(default = "default_true")]
    pub queuing: bool,
    /// Maximum queued requests; absent means unbounded.
    pub queue_size: Option<usize>,
    /// Queued requests older than this fail with a queue timeout.
    pub queue_timeout_ms: Option<u64>,
    /// Hooks run after connect, before the transport is committed.
    #[serde(skip)]
    pub setup_hooks: Vec<SetupHook>,
}

fn default_true() -> bool {
    true
}

impl Default for ClientOptions {
    fn default() -> Self {
        ClientOptions {
            url: None,
            socket_path: None,
            tls: TlsOptions::default(),
            timeout_ms: None,
            connect_timeout_ms: None,
            idle_timeout_ms: None,
            socket_timeout_ms: None,
            reconnect: None,
            queuing: true,
            queue_size: None,
            queue_timeout_ms: None,
            setup_hooks: Vec::new(),
        }
    }
}

impl std::fmt::Debug for ClientOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientOptions")
            .field("url", &self.url)
            .field("socket_path", &self.socket_path)
            .field("tls", &self.tls)
            .field("timeout_ms", &self.timeout_ms)
            .field("connect_timeout_ms", &self.connect_timeout_ms)
            .field("idle_timeout_ms", &self.idle_timeout_ms)
            .field("socket_timeout_ms", &self.socket_timeout_ms)
            .field("reconnect", &self.reconnect)
            .field("queuing", &self.queuing)
            .field("queue_size", &self.queue_size)
            .field("queue_timeout_ms", &self.queue_timeout_ms)
            .field("setup_hooks", &self.setup_hooks.len())
            .finish()
    }
}

impl ClientOptions {
    pub fn url(url: impl Into<String>) -> Self {
        ClientOptions {
            url: Some(url.into()),
            ..Default::default()
        }
    }

    #[cfg(unix)]
    pub fn socket_path(path: impl Into<String>) -> Self {
        ClientOptions {
            socket_path: Some(path.into()),
            ..Default::default()
        }
    }

    pub fn with_timeout_ms(mut self, ms: u64) -> Self {
        self.timeout_ms = Some(ms);
        self
    }

    pub fn with_connect_timeout_ms(mut self, ms: u64) -> Self {
        self.connect_timeout_ms = Some(ms);
        self
    }

    pub fn with_idle_timeout_ms(mut self, ms: u64) -> Self {
        self.idle_timeout_ms = Some(ms);
        self
    }

    pub fn with_socket_timeout_ms(mut self, ms: u64) -> Self {
        self.socket_timeout_ms = Some(ms);
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectOptions) -> Self {
        self.reconnect = Some(reconnect);
        self
    }

    pub fn with_queue_timeout_ms(mut self, ms: u64) -> Self {
        self.queue_timeout_ms = Some(ms);
        self
    }

    pub fn with_queue_size(mut self, size: usize) -> Self {
        self.queue_size = Some(size);
        self
    }

    pub fn no_queuing(mut self) -> Self {
        self.queuing = false;
        self
    }

    pub fn with_setup_hook(mut self, hook: SetupHook) -> Self {
        self.setup_hooks.push(hook);
        self
    }

    pub(crate) fn request_timeout(&self) -> Option<Duration> {
        duration_of(self.timeout_ms)
    }

    pub(crate) fn connect_timeout(&self) -> Option<Duration> {
        duration_of(self.connect_timeout_ms)
    }

    pub(crate) fn idle_timeout(&self) -> Option<Duration> {
        duration_of(self.idle_timeout_ms)
    }

    pub(crate) fn socket_timeout(&self) -> Option<Duration> {
        duration_of(self.socket_timeout_ms)
    }

    pub(crate) fn queue_timeout(&self) -> Option<Duration> {
        duration_of(self.queue_timeout_ms)
    }
}

fn duration_of(ms: Option<u64>) -> Option<Duration> {
    match ms {
        Some(0) | None => None,
        Some(ms) => Some(Duration::from_millis(ms)),
    }
}

/// Exponential backoff policy for reconnection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconnectOptions {
    /// Delay before the first retry.
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Delay cap; each retry doubles the delay up to this.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Give up after this many consecutive failures; absent means retry
    /// forever.
    pub fail_after: Option<u32>,
}

fn default_initial_delay_ms() -> u64 {
    100
}

fn default_max_delay_ms() -> u64 {
    10_000
}

impl Default for ReconnectOptions {
    fn default() -> Self {
        ReconnectOptions {
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            fail_after: None,
        }
    }
}

impl ReconnectOptions {
    pub(crate) fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub(crate) fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// TLS options for ldaps endpoints.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TlsOptions {
    /// Skip server certificate verification (tests/internal networks only).
    #[serde(default)]
    pub skip_verify: bool,
    /// Extra CA certificate(s), PEM, used in addition to system roots.
    pub extra_ca_pem: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let opts = ClientOptions::default();
        assert!(opts.queuing);
        assert!(opts.reconnect.is_none());
        assert!(opts.request_timeout().is_none());
        assert!(opts.queue_size.is_none());
    }

    #[test]
    fn zero_timeout_disables() {
        let opts = ClientOptions::url("ldap://h").with_timeout_ms(0);
        assert!(opts.request_timeout().is_none());
        let opts = opts.with_timeout_ms(250);
        assert_eq!(opts.request_timeout(), Some(Duration::from_millis(250)));
    }

    #[test]
    fn reconnect_defaults() {
        let r = ReconnectOptions::default();
        assert_eq!(r.initial_delay(), Duration::from_millis(100));
        assert_eq!(r.max_delay(), Duration::from_millis(10_000));
        assert_eq!(r.fail_after, None);
    }

    #[test]
    fn options_from_yaml() {
        let yaml = r#"
url: "ldaps://ldap.example.com:636"
tls:
  skip_verify: true
timeout_ms: 5000
connect_timeout_ms: 2000
reconnect:
  initial_delay_ms: 50
  max_delay_ms: 4000
  fail_after: 8
queue_size: 128
queue_timeout_ms: 1000
"#;
        let opts: ClientOptions = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(opts.url.as_deref(), Some("ldaps://ldap.example.com:636"));
        assert!(opts.tls.skip_verify);
        assert_eq!(opts.timeout_ms, Some(5000));
        let r = opts.reconnect.unwrap();
        assert_eq!(r.initial_delay_ms, 50);
        assert_eq!(r.fail_after, Some(8));
        assert!(opts.queuing);
        assert_eq!(opts.queue_size, Some(128));
    }

    #[test]
    fn options_from_yaml_minimal() {
        let opts: ClientOptions = serde_yaml::from_str("url: \"ldap://h:1389\"").unwrap();
        assert_eq!(opts.url.as_deref(), Some("ldap://h:1389"));
        assert!(!opts.tls.skip_verify);
        assert!(opts.reconnect.is_none());
    }
}
