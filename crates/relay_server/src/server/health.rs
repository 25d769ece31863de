#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::warn;

#[derive(Clone, Default)]
pub struct HealthState {
	ready: Arc<AtomicBool>,
}

impl HealthState {
	pub fn new() -> Self {
		Self {
			ready: Arc::new(AtomicBool::new(false)),
		}
	}

	pub fn mark_ready(&self) {
		self.ready.store(true, Ordering::Relaxed);
	}

	/// Readiness tracks the upstream subscriber: set once it reaches
	/// `Listening`, cleared while it is rebuilding the connection.
	pub fn mark_not_ready(&self) {
		self.ready.store(false, Ordering::Relaxed);
	}

	pub fn is_ready(&self) -> bool {
		self.ready.load(Ordering::Relaxed)
	}
}

pub fn spawn_health_server(bind: SocketAddr, state: HealthState) {
	tokio::spawn(async move {
		if let Err(err) = run_health_server(bind, state).await {
			warn!(error = %err, "health server stopped");
		}
	});
}

async fn run_health_server(bind: SocketAddr, state: HealthState) -> anyhow::Result<()> {
	let listener = TcpListener::bind(bind).await?;
	loop {
		let (stream, _addr) = listener.accept().await?;
		let io = TokioIo::new(stream);
		let state = state.clone();
		tokio::spawn(async move {
			let service = service_fn(move |req: Request<Incoming>| {
				let (status, body) = route(req.method(), req.uri().path(), state.is_ready());
				async move { Ok::<_, hyper::Error>(response(status, body)) }
			});
			if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
				warn!(error = %err, "health connection error");
			}
		});
	}
}

fn route(method: &Method, path: &str, ready: bool) -> (StatusCode, &'static str) {
	match (method, path) {
		(&Method::GET, "/healthz") => (StatusCode::OK, "ok"),
		(&Method::GET, "/readyz") if ready => (StatusCode::OK, "ready"),
		(&Method::GET, "/readyz") => (StatusCode::SERVICE_UNAVAILABLE, "not-ready"),
		(&Method::GET, _) => (StatusCode::NOT_FOUND, ""),
		_ => (StatusCode::METHOD_NOT_ALLOWED, ""),
	}
}

fn response(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
	Response::builder()
		.status(status)
		.body(Full::new(Bytes::from_static(body.as_bytes())))
		.unwrap()
}
