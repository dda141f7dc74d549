//! Node configuration.
//!
//! Every knob is an environment variable (clap also accepts the matching
//! long flag). Validation collects every problem instead of stopping at
//! the first, so an operator fixes a broken deployment in one pass.

use std::net::IpAddr;
use std::path::PathBuf;

use clap::Parser;

/// Command-line / environment arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "remus-node", version, about = "Self-hosted community node")]
pub struct Args {
    /// Port to listen on
    #[arg(long, default_value_t = 3210, env = "PORT")]
    pub port: u16,

    /// Base URL of the external authentication authority
    #[arg(long, default_value = "http://localhost:4000", env = "REMUS_MAIN_BACKEND_URL")]
    pub main_backend_url: String,

    /// Display name reported in server info and heartbeats
    #[arg(long, default_value = "Remus Community", env = "REMUS_SERVER_NAME")]
    pub server_name: String,

    /// Publicly reachable URL of this node
    #[arg(long, env = "REMUS_PUBLIC_URL")]
    pub public_url: Option<String>,

    /// Region label (e.g. "eu-west")
    #[arg(long, default_value = "local", env = "REMUS_REGION")]
    pub region: String,

    /// Path to the server icon image
    #[arg(long, env = "REMUS_SERVER_ICON")]
    pub server_icon: Option<PathBuf>,

    /// Allowed CORS origins (comma-separated). Loopback origins are always
    /// allowed.
    #[arg(long, env = "REMUS_CLIENT_ORIGIN", value_delimiter = ',')]
    pub client_origin: Vec<String>,

    /// Also allow file:// origins (packaged desktop clients)
    #[arg(long, default_value_t = false, env = "REMUS_ALLOW_FILE_ORIGIN")]
    pub allow_file_origin: bool,

    /// Also allow the literal "null" origin
    #[arg(long, default_value_t = false, env = "REMUS_ALLOW_NULL_ORIGIN")]
    pub allow_null_origin: bool,

    /// Upload size cap in megabytes
    #[arg(long, default_value_t = 25, env = "REMUS_FILE_LIMIT_MB")]
    pub file_limit_mb: i64,

    /// Override the uploads directory (defaults to <runtime>/uploads)
    #[arg(long, env = "REMUS_UPLOADS_DIR")]
    pub uploads_dir: Option<PathBuf>,

    /// IP the media worker binds RTP transports to
    #[arg(long, default_value = "0.0.0.0", env = "REMUS_MEDIA_LISTEN_IP")]
    pub media_listen_ip: String,

    /// Public IP announced in ICE candidates (NATed deployments)
    #[arg(long, env = "REMUS_MEDIA_ANNOUNCED_IP")]
    pub media_announced_ip: Option<String>,

    /// Lower bound of the RTP port range
    #[arg(long, default_value_t = 40000, env = "REMUS_MEDIA_MIN_PORT")]
    pub media_min_port: u16,

    /// Upper bound of the RTP port range
    #[arg(long, default_value_t = 40100, env = "REMUS_MEDIA_MAX_PORT")]
    pub media_max_port: u16,

    /// ICE server list as JSON (passed through to clients)
    #[arg(long, env = "REMUS_ICE_SERVERS")]
    pub ice_servers: Option<String>,

    /// Override the database file path (defaults to <runtime>/data/remus.db)
    #[arg(long, env = "REMUS_DB_PATH")]
    pub db_path: Option<PathBuf>,

    /// Root directory for persisted node state
    #[arg(long, default_value = "./runtime", env = "REMUS_RUNTIME_DIR")]
    pub runtime_dir: PathBuf,

    /// Admin API key; the admin surface is disabled while unset
    #[arg(long, env = "REMUS_ADMIN_KEY")]
    pub admin_key: Option<String>,

    /// Verbose logging
    #[arg(long, default_value_t = false, env = "DEBUG")]
    pub debug: bool,
}

/// Validated node configuration.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub port: u16,
    pub main_backend_url: String,
    pub server_name: String,
    pub public_url: Option<String>,
    pub region: String,
    pub server_icon: Option<PathBuf>,
    pub client_origins: Vec<String>,
    pub allow_file_origin: bool,
    pub allow_null_origin: bool,
    pub file_limit_mb: i64,
    pub uploads_dir: PathBuf,
    pub role_icons_dir: PathBuf,
    pub db_path: PathBuf,
    pub media_listen_ip: String,
    pub media_announced_ip: Option<String>,
    pub media_min_port: u16,
    pub media_max_port: u16,
    pub ice_servers: serde_json::Value,
    pub admin_key: Option<String>,
    pub debug: bool,
}

impl NodeConfig {
    /// Build a config from parsed args, collecting every validation error.
    pub fn from_args(args: Args) -> Result<Self, Vec<String>> {
        let mut errors = Vec::new();

        if args.port == 0 {
            errors.push("PORT must be between 1 and 65535".to_string());
        }

        if !is_valid_http_url(&args.main_backend_url) {
            errors.push(format!(
                "REMUS_MAIN_BACKEND_URL is not a valid URL: {}",
                args.main_backend_url
            ));
        }
        if let Some(url) = &args.public_url {
            if !is_valid_http_url(url) {
                errors.push(format!("REMUS_PUBLIC_URL is not a valid URL: {url}"));
            }
        }

        if args.media_max_port <= args.media_min_port {
            errors.push(format!(
                "REMUS_MEDIA_MAX_PORT ({}) must be greater than REMUS_MEDIA_MIN_PORT ({})",
                args.media_max_port, args.media_min_port
            ));
        }

        if args.file_limit_mb <= 0 {
            errors.push("REMUS_FILE_LIMIT_MB must be positive".to_string());
        }

        let client_origins: Vec<String> = args
            .client_origin
            .iter()
            .map(|o| o.trim().trim_end_matches('/').to_string())
            .filter(|o| !o.is_empty())
            .collect();
        for origin in &client_origins {
            if !is_valid_http_url(origin) {
                errors.push(format!("REMUS_CLIENT_ORIGIN entry is not a valid URL: {origin}"));
            }
        }

        let ice_servers = match &args.ice_servers {
            Some(raw) => match serde_json::from_str::<serde_json::Value>(raw) {
                Ok(value) => value,
                Err(e) => {
                    errors.push(format!("REMUS_ICE_SERVERS is not valid JSON: {e}"));
                    serde_json::Value::Array(vec![])
                }
            },
            None => serde_json::Value::Array(vec![]),
        };

        if !errors.is_empty() {
            return Err(errors);
        }

        let uploads_dir = args.uploads_dir.unwrap_or_else(|| args.runtime_dir.join("uploads"));
        let role_icons_dir = args.runtime_dir.join("role-icons");
        let db_path = args
            .db_path
            .unwrap_or_else(|| args.runtime_dir.join("data").join("remus.db"));

        Ok(Self {
            port: args.port,
            main_backend_url: args.main_backend_url.trim_end_matches('/').to_string(),
            server_name: args.server_name,
            public_url: args.public_url,
            region: args.region,
            server_icon: args.server_icon,
            client_origins,
            allow_file_origin: args.allow_file_origin,
            allow_null_origin: args.allow_null_origin,
            file_limit_mb: args.file_limit_mb,
            uploads_dir,
            role_icons_dir,
            db_path,
            media_listen_ip: args.media_listen_ip,
            media_announced_ip: args.media_announced_ip,
            media_min_port: args.media_min_port,
            media_max_port: args.media_max_port,
            ice_servers,
            admin_key: args.admin_key.filter(|k| !k.is_empty()),
            debug: args.debug,
        })
    }

    /// Upload size cap in bytes.
    pub fn file_limit_bytes(&self) -> usize {
        (self.file_limit_mb as usize) * 1024 * 1024
    }

    /// Is the authority reachable over loopback? Verification calls get a
    /// shorter deadline in that case.
    pub fn backend_is_loopback(&self) -> bool {
        host_of(&self.main_backend_url).is_some_and(|h| is_loopback_host(&h))
    }

    /// CORS origin check: configured allowlist, implicit loopback, and the
    /// optional null/file:// escapes.
    pub fn allows_origin(&self, origin: &str) -> bool {
        let origin = origin.trim_end_matches('/');
        if origin == "null" {
            return self.allow_null_origin;
        }
        if origin.starts_with("file://") {
            return self.allow_file_origin;
        }
        if self.client_origins.iter().any(|o| o == origin) {
            return true;
        }
        host_of(origin).is_some_and(|h| is_loopback_host(&h))
    }
}

/// Minimal http(s) URL shape check: scheme plus a non-empty host.
fn is_valid_http_url(url: &str) -> bool {
    host_of(url).is_some()
}

/// Extract the host from an http(s)/ws(s) URL, without port.
fn host_of(url: &str) -> Option<String> {
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .or_else(|| url.strip_prefix("wss://"))
        .or_else(|| url.strip_prefix("ws://"))?;
    let authority = rest.split(['/', '?', '#']).next()?;
    if authority.is_empty() {
        return None;
    }
    // Bracketed IPv6 hosts keep their brackets off.
    let host = if let Some(stripped) = authority.strip_prefix('[') {
        stripped.split(']').next()?.to_string()
    } else {
        authority.split(':').next()?.to_string()
    };
    if host.is_empty() {
        None
    } else {
        Some(host)
    }
}

fn is_loopback_host(host: &str) -> bool {
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    host.parse::<IpAddr>().is_ok_and(|ip| ip.is_loopback())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_args() -> Args {
        Args::parse_from(["remus-node"])
    }

    #[test]
    fn test_defaults_validate() {
        let config = NodeConfig::from_args(base_args()).unwrap();
        assert_eq!(config.port, 3210);
        assert_eq!(config.file_limit_bytes(), 25 * 1024 * 1024);
        assert!(config.admin_key.is_none());
        assert_eq!(config.db_path, PathBuf::from("./runtime/data/remus.db"));
        assert_eq!(config.uploads_dir, PathBuf::from("./runtime/uploads"));
    }

    #[test]
    fn test_validation_collects_every_error() {
        let mut args = base_args();
        args.port = 0;
        args.main_backend_url = "not a url".to_string();
        args.media_min_port = 5000;
        args.media_max_port = 5000;
        args.file_limit_mb = 0;
        args.ice_servers = Some("{oops".to_string());
        args.client_origin = vec!["also-not-a-url".to_string()];

        let errors = NodeConfig::from_args(args).unwrap_err();
        assert_eq!(errors.len(), 6);
    }

    #[test]
    fn test_ice_servers_parse() {
        let mut args = base_args();
        args.ice_servers = Some(r#"[{"urls": "stun:stun.example.com:3478"}]"#.to_string());
        let config = NodeConfig::from_args(args).unwrap();
        assert!(config.ice_servers.is_array());
    }

    #[test]
    fn test_empty_admin_key_disables_admin() {
        let mut args = base_args();
        args.admin_key = Some(String::new());
        let config = NodeConfig::from_args(args).unwrap();
        assert!(config.admin_key.is_none());
    }

    #[test]
    fn test_origin_allowlist() {
        let mut args = base_args();
        args.client_origin = vec!["https://app.example.com".to_string()];
        let config = NodeConfig::from_args(args).unwrap();

        assert!(config.allows_origin("https://app.example.com"));
        assert!(config.allows_origin("https://app.example.com/"));
        assert!(!config.allows_origin("https://evil.example.com"));

        // Loopback is always allowed.
        assert!(config.allows_origin("http://localhost:5173"));
        assert!(config.allows_origin("http://127.0.0.1:8080"));
        assert!(config.allows_origin("http://[::1]:3000"));

        // null / file:// only by flag.
        assert!(!config.allows_origin("null"));
        assert!(!config.allows_origin("file://"));
    }

    #[test]
    fn test_null_and_file_origin_flags() {
        let mut args = base_args();
        args.allow_null_origin = true;
        args.allow_file_origin = true;
        let config = NodeConfig::from_args(args).unwrap();
        assert!(config.allows_origin("null"));
        assert!(config.allows_origin("file:///index.html"));
    }

    #[test]
    fn test_backend_loopback_detection() {
        let mut args = base_args();
        args.main_backend_url = "http://127.0.0.1:4000".to_string();
        assert!(NodeConfig::from_args(args).unwrap().backend_is_loopback());

        let mut args = base_args();
        args.main_backend_url = "https://auth.example.com".to_string();
        assert!(!NodeConfig::from_args(args).unwrap().backend_is_loopback());
    }

    #[test]
    fn test_host_of() {
        assert_eq!(host_of("https://a.example.com:8443/path"), Some("a.example.com".into()));
        assert_eq!(host_of("http://[::1]:3000"), Some("::1".into()));
        assert_eq!(host_of("ftp://nope"), None);
        assert_eq!(host_of("https://"), None);
    }
}
