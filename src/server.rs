use once_cell::sync::OnceCell;
use regex::Regex;
use smol::io::{AsyncReadExt, AsyncWriteExt};
use smol::net::{TcpListener, TcpStream};
use smol::stream::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;

use crate::engine::Engine;
use crate::format::{MIME_FLV, MIME_MP4};
use crate::stream::Stream;
use crate::util::spawn_and_log_error;

fn request_line() -> &'static Regex {
    static INSTANCE: OnceCell<Regex> = OnceCell::new();
    INSTANCE.get_or_init(|| Regex::new(r"^GET (\S+) HTTP/(1\.[01])").unwrap())
}

fn mime_map() -> &'static HashMap<&'static str, &'static str> {
    static INSTANCE: OnceCell<HashMap<&'static str, &'static str>> = OnceCell::new();
    INSTANCE.get_or_init(|| {
        let mut map = HashMap::new();
        map.insert("mp4", MIME_MP4);
        map.insert("m4v", MIME_MP4);
        map.insert("flv", MIME_FLV);
        map.insert("txt", "text/plain");
        map.insert("html", "text/html");
        map
    })
}

#[derive(Debug, PartialEq)]
struct Request {
    path: String,
    http: String,
    spatial: bool,
    start: f64,
    stop: f64,
}

fn parse_request(head: &str) -> Option<Request> {
    let first_line = head.lines().next().unwrap_or_default();
    let captures = request_line().captures(first_line)?;
    let target = captures.get(1)?.as_str();
    let http = captures.get(2)?.as_str().to_owned();

    let (path, query) = match target.find('?') {
        Some(at) => (&target[..at], &target[at + 1..]),
        None => (target, ""),
    };

    let mut start = 0.0;
    let mut stop = 0.0;
    let mut spatial = false;
    for pair in query.split('&') {
        let mut kv = pair.splitn(2, '=');
        let key = kv.next().unwrap_or_default();
        let value = kv.next().unwrap_or_default();
        match key {
            "start" => start = value.parse().unwrap_or(0.0),
            "stop" => stop = value.parse().unwrap_or(0.0),
            "spatial" => spatial = value != "0" && value != "false",
            _ => {}
        }
    }
    if start < 0.0 {
        start = 0.0;
    }
    if stop < 0.0 {
        stop = 0.0;
    }

    Some(Request {
        path: path.to_owned(),
        http,
        spatial,
        start,
        stop,
    })
}

fn mime_of(path: &str) -> &'static str {
    path.rsplit('.')
        .next()
        .and_then(|ext| mime_map().get(ext.to_ascii_lowercase().as_str()).copied())
        .unwrap_or("application/octet-stream")
}

fn status_body(engine: &Engine) -> String {
    const INDICATORS: [&str; 7] = [
        "load",
        "cache:used",
        "cache:items",
        "cache:hits",
        "cache:misses",
        "data:total",
        "data:delay",
    ];
    INDICATORS
        .iter()
        .map(|name| format!("{} {}\n", name, engine.monitor(name)))
        .collect()
}

pub async fn run_server(addr: String, engine: Arc<Engine>, root: String) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr.as_str()).await?;
    log::info!(
        "{} {} is listening to http://{}",
        crate::SERVER_NAME,
        crate::SERVER_VERSION,
        listener.local_addr()?
    );

    let mut incoming = listener.incoming();
    while let Some(stream) = incoming.next().await {
        let stream = stream?;
        spawn_and_log_error(accept(stream, engine.clone(), root.clone()));
    }
    Ok(())
}

async fn accept(mut socket: TcpStream, engine: Arc<Engine>, root: String) -> anyhow::Result<()> {
    let mut buffer = [0; 1024];
    let n = socket.read(&mut buffer).await?;
    let head = String::from_utf8_lossy(&buffer[..n]);

    let request = match parse_request(head.as_ref()) {
        Some(request) => request,
        None => {
            socket.write_all(b"HTTP/1.1 400 Bad Request\r\n\r\n").await?;
            return Ok(());
        }
    };
    log::info!(
        "[peer={}] GET {} start={} stop={}",
        socket.peer_addr().map(|a| a.to_string()).unwrap_or_default(),
        request.path,
        request.start,
        request.stop
    );

    if request.path == "/status" {
        let body = status_body(&engine);
        let head = format!(
            "HTTP/{} 200 OK\nContent-Type: text/plain\nContent-Length: {}\nServer: {} {}\n\n",
            request.http,
            body.len(),
            crate::SERVER_NAME,
            crate::SERVER_VERSION
        );
        socket.write_all(head.as_bytes()).await?;
        socket.write_all(body.as_bytes()).await?;
        return Ok(());
    }

    // keep requests inside the document root
    let unsafe_path = request.path.split('/').any(|part| part == "..");
    let full_path = format!("{}{}", root, request.path);
    if unsafe_path || !std::path::Path::new(&full_path).is_file() {
        let head = format!("HTTP/{} 404 Not Found\r\n\r\n", request.http);
        socket.write_all(head.as_bytes()).await?;
        return Ok(());
    }

    let mime = mime_of(&full_path);
    let stream = Box::new(Stream::new(
        socket,
        &request.http,
        &full_path,
        mime,
        request.spatial,
        request.start,
        request.stop,
    ));
    if let Err(mut stream) = engine.dispatch(stream) {
        log::warn!("[server] overloaded, rejecting {}", stream.path);
        let head = format!("HTTP/{} 503 Service Unavailable\r\n\r\n", stream.http);
        stream.socket.write_all(head.as_bytes()).await?;
    }
    Ok(())
}
