use anyhow::{Context, Result};
use postgres_native_tls::MakeTlsConnector;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_postgres::{Client, NoTls};
use tracing::{error, info};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    #[serde(skip_serializing, default)]
    pub password: String,
    #[serde(default)]
    pub ssl_mode: SslMode,
    /// Skip certificate verification in prefer/require modes.
    #[serde(default)]
    pub accept_invalid_certs: bool,
    /// PEM bundle with extra root certificates.
    #[serde(default)]
    pub ca_cert_path: Option<String>,
    /// Schema whose tables are introspected and queried.
    #[serde(default = "default_schema")]
    pub schema: String,
}

fn default_schema() -> String {
    String::from("public")
}

/// SSL/TLS connection modes, matching libpq's `sslmode`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum SslMode {
    Disable,
    #[default]
    Prefer,
    Require,
    VerifyCa,
    VerifyFull,
}

impl SslMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SslMode::Disable => "disable",
            SslMode::Prefer => "prefer",
            SslMode::Require => "require",
            SslMode::VerifyCa => "verify-ca",
            SslMode::VerifyFull => "verify-full",
        }
    }
}

impl ConnectionConfig {
    pub fn connection_string(&self) -> String {
        format!(
            "host={} port={} dbname={} user={} password={} sslmode={} connect_timeout=10",
            quote_conn_value(&self.host),
            self.port,
            quote_conn_value(&self.database),
            quote_conn_value(&self.username),
            quote_conn_value(&self.password),
            self.ssl_mode.as_str()
        )
    }

    pub fn display_string(&self) -> String {
        format!(
            "{}@{}:{}/{}",
            self.username, self.host, self.port, self.database
        )
    }

    /// Fill in the password from `PGPASSWORD`, or prompt on the terminal.
    pub fn resolve_password(&mut self) -> Result<()> {
        if !self.password.is_empty() {
            return Ok(());
        }
        if let Ok(password) = std::env::var("PGPASSWORD") {
            self.password = password;
            return Ok(());
        }
        let prompt = format!("Password for {}: ", self.display_string());
        self.password =
            rpassword::read_password_from_tty(Some(&prompt)).context("Failed to read password")?;
        Ok(())
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            name: String::from("Local PostgreSQL"),
            host: String::from("localhost"),
            port: 5432,
            database: String::from("postgres"),
            username: String::from("postgres"),
            password: String::new(),
            ssl_mode: SslMode::default(),
            accept_invalid_certs: false,
            ca_cert_path: None,
            schema: default_schema(),
        }
    }
}

/// Named connections stored in `connections.toml`.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct SavedConnections {
    #[serde(default)]
    pub connections: Vec<ConnectionConfig>,
}

impl SavedConnections {
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("jsonata-sql")
            .join("connections.toml")
    }

    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("Invalid {}", path.display()))
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn find(&self, name: &str) -> Option<&ConnectionConfig> {
        self.connections.iter().find(|c| c.name == name)
    }
}

/// Connect and spawn the connection driver task.
pub async fn create_client(config: &ConnectionConfig) -> Result<Client> {
    let conn_string = config.connection_string();
    let client = match config.ssl_mode {
        SslMode::Disable => {
            let (client, connection) =
                tokio::time::timeout(CONNECT_TIMEOUT, tokio_postgres::connect(&conn_string, NoTls))
                    .await
                    .map_err(|_| anyhow::anyhow!("Connection timed out after 15s"))?
                    .context("Failed to connect to PostgreSQL")?;
            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    error!("Connection error: {}", e);
                }
            });
            client
        }
        mode => {
            let strict = matches!(mode, SslMode::VerifyCa | SslMode::VerifyFull);
            let tls = build_tls_connector(config, strict)?;
            let (client, connection) =
                tokio::time::timeout(CONNECT_TIMEOUT, tokio_postgres::connect(&conn_string, tls))
                    .await
                    .map_err(|_| anyhow::anyhow!("Connection timed out after 15s"))?
                    .context("Failed to connect to PostgreSQL over TLS")?;
            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    error!("Connection error: {}", e);
                }
            });
            client
        }
    };
    info!(target = %config.display_string(), "Connected");
    Ok(client)
}

/// Verification is always on when `strict_verify` is set (verify-ca/verify-full).
fn build_tls_connector(config: &ConnectionConfig, strict_verify: bool) -> Result<MakeTlsConnector> {
    let mut builder = native_tls::TlsConnector::builder();

    if config.accept_invalid_certs && !strict_verify {
        builder.danger_accept_invalid_certs(true);
        builder.danger_accept_invalid_hostnames(true);
    } else if let Some(ca_path) = &config.ca_cert_path {
        let ca_data = std::fs::read(ca_path)
            .with_context(|| format!("Failed to read CA certificate file: {}", ca_path))?;
        for block in pem_blocks(&ca_data)? {
            let cert = native_tls::Certificate::from_pem(block.as_bytes())
                .context("Failed to parse certificate")?;
            builder.add_root_certificate(cert);
        }
    }

    let connector = builder.build().context("Failed to build TLS connector")?;
    Ok(MakeTlsConnector::new(connector))
}

/// Split a PEM bundle into one block per certificate.
fn pem_blocks(pem_data: &[u8]) -> Result<Vec<String>> {
    let pem_str =
        std::str::from_utf8(pem_data).context("CA certificate file is not valid UTF-8")?;

    let mut blocks = Vec::new();
    let mut current: Option<String> = None;
    for line in pem_str.lines() {
        let line = line.trim();
        if line == "-----BEGIN CERTIFICATE-----" {
            current = Some(format!("{}\n", line));
        } else if let Some(block) = current.as_mut() {
            block.push_str(line);
            block.push('\n');
            if line == "-----END CERTIFICATE-----" {
                blocks.extend(current.take());
            }
        }
    }

    if blocks.is_empty() {
        anyhow::bail!("No valid certificates found in PEM data");
    }
    Ok(blocks)
}

/// Quote a value for a libpq key=value connection string.
fn quote_conn_value(value: &str) -> String {
    let escaped = value.replace('\\', "\\\\").replace('\'', "\\'");
    format!("'{}'", escaped)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_string_quotes_values() {
        let config = ConnectionConfig {
            password: String::from("it's\\secret"),
            ssl_mode: SslMode::VerifyFull,
            ..Default::default()
        };
        let conn = config.connection_string();
        assert!(conn.contains("password='it\\'s\\\\secret'"));
        assert!(conn.contains("sslmode=verify-full"));
        assert_eq!(config.display_string(), "postgres@localhost:5432/postgres");
    }

    #[test]
    fn test_saved_connections_roundtrip_skips_password() {
        let dir = std::env::temp_dir().join(format!("jsonata-sql-conn-{}", std::process::id()));
        let path = dir.join("connections.toml");
        let saved = SavedConnections {
            connections: vec![ConnectionConfig {
                name: String::from("staging"),
                password: String::from("hunter2"),
                ..Default::default()
            }],
        };
        saved.save_to(&path).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(!content.contains("hunter2"));

        let loaded = SavedConnections::load_from(&path).unwrap();
        let staging = loaded.find("staging").unwrap();
        assert!(staging.password.is_empty());
        assert_eq!(staging.schema, "public");
        assert!(loaded.find("prod").is_none());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_missing_connections_file_is_empty() {
        let loaded = SavedConnections::load_from(Path::new("/nonexistent/connections.toml")).unwrap();
        assert!(loaded.connections.is_empty());
    }

    #[test]
    fn test_ssl_mode_parses_kebab_case() {
        let config: ConnectionConfig = toml::from_str(
            "name = 'x'\nhost = 'db'\nport = 5433\ndatabase = 'd'\nusername = 'u'\nssl_mode = 'verify-ca'\n",
        )
        .unwrap();
        assert_eq!(config.ssl_mode, SslMode::VerifyCa);
    }

    #[test]
    fn test_pem_blocks() {
        let pem = b"-----BEGIN CERTIFICATE-----\nAAAA\n-----END CERTIFICATE-----\n\
                    junk\n-----BEGIN CERTIFICATE-----\nBBBB\n-----END CERTIFICATE-----\n";
        let blocks = pem_blocks(pem).unwrap();
        assert_eq!(blocks.len(), 2);
        assert!(blocks[1].contains("BBBB"));
        assert!(pem_blocks(b"not a cert").is_err());
    }
}
