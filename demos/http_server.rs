use std::{collections::HashMap, sync::Arc};

use rush_net::prelude::*;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// HTTP response builder
struct HttpResponse {
    status: u16,
    headers: Vec<(String, String)>,
    body: String,
    keep_alive: bool,
}

impl HttpResponse {
    fn ok(body: &str) -> Self {
        Self::with_status(200, body)
    }

    fn not_found() -> Self {
        Self::with_status(404, "<h1>404 Not Found</h1>")
    }

    fn with_status(status: u16, body: &str) -> Self {
        Self {
            status,
            headers: vec![
                ("Content-Type".to_string(), "text/html".to_string()),
                ("Content-Length".to_string(), body.len().to_string()),
            ],
            body: body.to_string(),
            keep_alive: true,
        }
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut response = format!(
            "HTTP/1.1 {} {}\r\n",
            self.status,
            match self.status {
                200 => "OK",
                404 => "Not Found",
                _ => "Unknown",
            }
        );

        for (key, value) in &self.headers {
            response.push_str(&format!("{}: {}\r\n", key, value));
        }
        if !self.keep_alive {
            response.push_str("Connection: close\r\n");
        }

        response.push_str("\r\n");
        response.push_str(&self.body);

        response.into_bytes()
    }
}

/// Request line and headers of one framed request
struct HttpRequest {
    method: String,
    path: String,
    headers: HashMap<String, String>,
}

impl HttpRequest {
    fn parse(data: &[u8]) -> Option<Self> {
        let request_str = String::from_utf8_lossy(data);
        let mut lines = request_str.split("\r\n");

        let mut request_line = lines.next()?.split_whitespace();
        let method = request_line.next()?.to_string();
        let path = request_line.next()?.to_string();

        let mut headers = HashMap::new();
        for line in lines {
            if line.is_empty() {
                break;
            }
            if let Some((key, value)) = line.split_once(':') {
                headers.insert(key.trim().to_lowercase(), value.trim().to_string());
            }
        }

        Some(HttpRequest {
            method,
            path,
            headers,
        })
    }

    fn wants_close(&self) -> bool {
        self.headers
            .get("connection")
            .is_some_and(|value| value.eq_ignore_ascii_case("close"))
    }
}

struct HttpHandler;

impl HttpHandler {
    fn route(&self, request: &HttpRequest) -> HttpResponse {
        match (request.method.as_str(), request.path.as_str()) {
            ("GET", "/") => HttpResponse::ok(
                "<h1>Welcome to rush-net!</h1><p>Served by a pre-forked reactor worker.</p>",
            ),
            ("GET", "/health") => {
                HttpResponse::ok("<h1>Health Check</h1><p>Server is running!</p>")
            }
            ("GET", "/pid") => HttpResponse::ok(&format!("<p>worker {}</p>", std::process::id())),
            _ => HttpResponse::not_found(),
        }
    }
}

impl Handler for HttpHandler {
    fn on_connect(&self, conn: &mut Conn<'_>) -> anyhow::Result<()> {
        info!(id = %conn.id(), remote = %conn.remote_addr(), "connection established");
        Ok(())
    }

    fn on_message(&self, conn: &mut Conn<'_>, data: &[u8]) -> anyhow::Result<()> {
        let Some(request) = HttpRequest::parse(data) else {
            conn.close_with(b"HTTP/1.1 400 Bad Request\r\n\r\n");
            return Ok(());
        };

        let mut response = self.route(&request);
        if request.wants_close() {
            response.keep_alive = false;
            conn.close_with(&response.to_bytes());
        } else {
            conn.send(&response.to_bytes());
        }
        Ok(())
    }

    fn on_close(&self, conn: &mut Conn<'_>) -> anyhow::Result<()> {
        info!(id = %conn.id(), "connection closed");
        Ok(())
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = ServerConfig::builder()
        .name("rush-http")
        .url("tcp://127.0.0.1:8080")?
        .workers(4)
        .protocol(HttpFraming::new(HttpFraming::DEFAULT_MAX_HEADER, Some(1024 * 1024)))
        .logger(Arc::new(TracingLogger))
        .build();

    let addr = format!("http://{}", config.address);
    println!("HTTP Server starting on {}", addr);
    println!("Available routes:");
    println!("  GET {}/       - Home page", addr);
    println!("  GET {}/health - Health check", addr);
    println!("  GET {}/pid    - Worker that served the request", addr);

    let mut supervisor = Supervisor::new(
        SupervisorConfig::default()
            .title("rush-http-main")
            .logger(Arc::new(TracingLogger)),
    );
    supervisor.add(Server::new(config, HttpHandler)?);

    for exit in supervisor.run()? {
        info!(pid = exit.pid, status = %exit.status, "worker reaped");
    }
    Ok(())
}
