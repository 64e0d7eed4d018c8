//! Public tunnels through an external provider command.
//!
//! The configured command (ngrok-style) is started with `{port}` substituted
//! into its arguments. Its stdout and stderr are scanned line by line for the
//! first `https://` URL, which becomes the tunnel's public address. The child
//! lives as long as the tunnel; closing the tunnel kills it.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::TunnelError;
use crate::config::TunnelConfig;

/// An established public tunnel.
#[derive(Debug)]
pub struct PublicTunnel {
    pub url: String,
    pub id: String,
    child: Child,
}

/// First `https://` URL in a line of provider output.
pub fn find_public_url(line: &str) -> Option<&str> {
    let start = line.find("https://")?;
    let rest = &line[start..];
    let end = rest
        .find(|c: char| c.is_whitespace() || matches!(c, '"' | '\'' | ',' | '>' | ')'))
        .unwrap_or(rest.len());
    let url = &rest[..end];
    (url.len() > "https://".len()).then_some(url)
}

/// Forward each output line into `tx`. Keeps draining after the receiver is
/// gone so the provider never blocks on a full pipe.
fn spawn_line_reader(reader: impl AsyncRead + Unpin + Send + 'static, tx: mpsc::Sender<String>) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if !tx.is_closed() {
                let _ = tx.send(line).await;
            }
        }
    });
}

impl PublicTunnel {
    /// Start the provider for `port` and wait for its public URL.
    pub async fn open(config: &TunnelConfig, port: u16) -> Result<Self, TunnelError> {
        let program = config
            .public_command
            .as_deref()
            .filter(|c| !c.trim().is_empty())
            .ok_or(TunnelError::PublicUnavailable)?;
        let args: Vec<String> = config
            .public_args
            .iter()
            .map(|a| a.replace("{port}", &port.to_string()))
            .collect();

        let mut child = Command::new(program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TunnelError::Provision(format!("{program}: {e}")))?;

        let (tx, mut rx) = mpsc::channel::<String>(64);
        if let Some(stdout) = child.stdout.take() {
            spawn_line_reader(stdout, tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_line_reader(stderr, tx);
        }

        let wait = Duration::from_secs(config.public_timeout_secs);
        let found = tokio::time::timeout(wait, async {
            let mut last_line = None;
            while let Some(line) = rx.recv().await {
                debug!("Public tunnel {port}: {line}");
                if let Some(url) = find_public_url(&line) {
                    return Ok(url.to_string());
                }
                last_line = Some(line);
            }
            Err(last_line)
        })
        .await;

        match found {
            Ok(Ok(url)) => {
                info!("Public tunnel {port}: {url}");
                Ok(Self {
                    url,
                    id: Uuid::new_v4().to_string(),
                    child,
                })
            }
            Ok(Err(last_line)) => {
                let _ = child.kill().await;
                let detail = last_line.unwrap_or_else(|| "no output".to_string());
                Err(TunnelError::Provision(format!(
                    "{program} exited without a public URL ({detail})"
                )))
            }
            Err(_) => {
                let _ = child.kill().await;
                Err(TunnelError::Provision(format!(
                    "{program} printed no public URL within {}s",
                    config.public_timeout_secs
                )))
            }
        }
    }

    /// Kill the provider and wait for it.
    pub async fn close(mut self) {
        if let Err(e) = self.child.kill().await {
            warn!("Public tunnel {}: kill failed: {e}", self.url);
        }
        info!("Public tunnel {} closed", self.url);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh_config(script: &str, timeout_secs: u64) -> TunnelConfig {
        TunnelConfig {
            public_command: Some("sh".to_string()),
            public_args: vec!["-c".to_string(), script.to_string()],
            public_timeout_secs: timeout_secs,
            ..TunnelConfig::default()
        }
    }

    #[test]
    fn test_find_public_url() {
        assert_eq!(
            find_public_url(r#"t=2024 msg="started tunnel" url=https://abc.ngrok-free.app"#),
            Some("https://abc.ngrok-free.app")
        );
        assert_eq!(
            find_public_url(r#"{"url":"https://x.example.net","port":5000}"#),
            Some("https://x.example.net")
        );
        assert_eq!(find_public_url("http://127.0.0.1:4040 (local)"), None);
        assert_eq!(find_public_url("https:// nothing"), None);
    }

    #[tokio::test]
    async fn test_open_reads_url_and_substitutes_port() {
        let config = sh_config(
            "echo starting; echo \"forwarding https://t-{port}.example.test -> localhost\"; sleep 30",
            5,
        );
        let tunnel = PublicTunnel::open(&config, 5000).await.unwrap();
        assert_eq!(tunnel.url, "https://t-5000.example.test");
        assert!(!tunnel.id.is_empty());
        tunnel.close().await;
    }

    #[tokio::test]
    async fn test_open_reports_exit_without_url() {
        let config = sh_config("echo 'auth token missing' >&2; exit 1", 5);
        let err = PublicTunnel::open(&config, 5000).await.unwrap_err();
        let TunnelError::Provision(msg) = err else {
            panic!("expected a provision error");
        };
        assert!(msg.contains("auth token missing"));
    }

    #[tokio::test]
    async fn test_open_times_out() {
        let config = sh_config("sleep 30", 1);
        let err = PublicTunnel::open(&config, 5000).await.unwrap_err();
        assert!(err.to_string().contains("no public URL within 1s"));
    }

    #[tokio::test]
    async fn test_unconfigured_provider() {
        let err = PublicTunnel::open(&TunnelConfig::default(), 5000)
            .await
            .unwrap_err();
        assert_eq!(err, TunnelError::PublicUnavailable);
    }
}
