//! Transport connector: builds one client connection to one backend.

use std::time::Duration;

use rmcp::{
    service::RunningService,
    transport::{
        sse_client::SseClientConfig, streamable_http_client::StreamableHttpClientTransportConfig,
        ConfigureCommandExt, SseClientTransport, StreamableHttpClientTransport, TokioChildProcess,
    },
    RoleClient, ServiceExt,
};
use tracing::{info, warn};

use crate::{
    config::{BackendConfig, TransportConfig},
    error::{BridgeError, BridgeResult},
};

/// Live client handle for one backend.
pub type BridgeClient = RunningService<RoleClient, ()>;

/// Connect to a backend and perform the protocol handshake.
///
/// Validates transport-specific required fields first; a handshake failure
/// surfaces as an error without registering anything.
pub async fn connect(config: &BackendConfig) -> BridgeResult<BridgeClient> {
    info!(
        "Connecting to backend '{}' via {:?}",
        config.id, config.transport
    );

    match &config.transport {
        TransportConfig::Stdio {
            command,
            args,
            env,
            cwd,
        } => {
            if command.trim().is_empty() {
                return Err(BridgeError::Config(format!(
                    "backend '{}': stdio transport requires a command",
                    config.id
                )));
            }

            let transport = TokioChildProcess::new(
                tokio::process::Command::new(command).configure(|cmd| {
                    cmd.args(args)
                        .envs(env.iter())
                        .stderr(std::process::Stdio::inherit());
                    if let Some(dir) = cwd {
                        cmd.current_dir(dir);
                    }
                }),
            )
            .map_err(|e| BridgeError::Transport(format!("create stdio transport: {}", e)))?;

            let client = ().serve(transport).await.map_err(|e| {
                BridgeError::Connection(format!("initialize stdio client: {}", e))
            })?;

            info!("Connected to stdio backend '{}'", config.id);
            Ok(client)
        }

        TransportConfig::Sse { url, headers } => {
            parse_url(&config.id, url)?;

            let http = http_client_with_headers(headers)?;
            let cfg = SseClientConfig {
                sse_endpoint: url.clone().into(),
                ..Default::default()
            };

            let transport = SseClientTransport::start_with_client(http, cfg)
                .await
                .map_err(|e| BridgeError::Transport(format!("create SSE transport: {}", e)))?;

            let client = ().serve(transport).await.map_err(|e| {
                BridgeError::Connection(format!("initialize SSE client: {}", e))
            })?;

            info!("Connected to SSE backend '{}' at {}", config.id, url);
            Ok(client)
        }

        TransportConfig::StreamableHttp { url, headers } => {
            parse_url(&config.id, url)?;

            // The streamable transport only carries an Authorization header.
            let transport = if headers.is_empty() {
                StreamableHttpClientTransport::from_uri(url.as_str())
            } else {
                let mut cfg = StreamableHttpClientTransportConfig::with_uri(url.as_str());
                for (name, value) in headers {
                    if name.eq_ignore_ascii_case("authorization") {
                        cfg.auth_header = Some(value.clone());
                    } else {
                        warn!(
                            "Header '{}' not supported on streamable transport for backend '{}'",
                            name, config.id
                        );
                    }
                }
                StreamableHttpClientTransport::from_config(cfg)
            };

            let client = ().serve(transport).await.map_err(|e| {
                BridgeError::Connection(format!("initialize streamable client: {}", e))
            })?;

            info!(
                "Connected to streamable HTTP backend '{}' at {}",
                config.id, url
            );
            Ok(client)
        }
    }
}

fn parse_url(backend_id: &str, raw: &str) -> BridgeResult<url::Url> {
    url::Url::parse(raw).map_err(|e| {
        BridgeError::Config(format!("backend '{}': invalid url '{}': {}", backend_id, raw, e))
    })
}

fn http_client_with_headers(
    headers: &std::collections::HashMap<String, String>,
) -> BridgeResult<reqwest::Client> {
    let mut builder = reqwest::Client::builder().connect_timeout(Duration::from_secs(10));

    if !headers.is_empty() {
        let mut map = reqwest::header::HeaderMap::new();
        for (name, value) in headers {
            let name = reqwest::header::HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| BridgeError::Transport(format!("header name '{}': {}", name, e)))?;
            let value = reqwest::header::HeaderValue::from_str(value)
                .map_err(|e| BridgeError::Transport(format!("header value for '{}': {}", name, e)))?;
            map.insert(name, value);
        }
        builder = builder.default_headers(map);
    }

    builder
        .build()
        .map_err(|e| BridgeError::Transport(format!("build HTTP client: {}", e)))
}
