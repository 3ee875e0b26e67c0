use crate::appointment::Appointment;
use crate::error::Error;
use crate::tower::Tower;
use axum::extract::{ConnectInfo, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use clap::Parser;
use ethers::providers::Middleware;
use ethers::types::Signature;
use once_cell::sync::Lazy;
use prometheus::{opts, register_counter, register_histogram, register_int_counter_vec, Counter, Histogram, IntCounterVec};
use serde::Serialize;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tower_http::catch_panic::CatchPanicLayer;
use tracing::warn;

static APPOINTMENT_REQUESTS: Lazy<Counter> = Lazy::new(|| {
    register_counter!(opts!("appointment_requests", "Number of POST /appointment requests received.")).unwrap()
});
static APPOINTMENT_STATUS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "appointment_response_status",
        "POST /appointment responses by status code.",
        &["status_code"]
    )
    .unwrap()
});
static APPOINTMENT_LATENCY: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!("appointment_latency_seconds", "POST /appointment handling latency in seconds.").unwrap()
});
static RATE_LIMITED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!("rate_limited_requests", "Requests rejected by the rate limiter.", &["scope"]).unwrap()
});

/// `POST /appointment` + the two configured windowed rate limits.
#[derive(Clone, Debug, Parser)]
pub struct Options {
    #[clap(long, env, default_value = "127.0.0.1")]
    pub host_name: String,

    #[clap(long, env, default_value = "8080")]
    pub host_port: u16,

    #[clap(long, env, default_value = "60")]
    pub rate_limit_user_max: u32,

    #[clap(long, env, default_value = "60000")]
    pub rate_limit_user_window_ms: u64,

    #[clap(long, env, default_value = "rate limit exceeded")]
    pub rate_limit_user_message: String,

    #[clap(long, env, default_value = "600")]
    pub rate_limit_global_max: u32,

    #[clap(long, env, default_value = "60000")]
    pub rate_limit_global_window_ms: u64,

    #[clap(long, env, default_value = "tower is at capacity")]
    pub rate_limit_global_message: String,
}

#[derive(Serialize)]
struct AppointmentResponse {
    #[serde(flatten)]
    appointment: Appointment,
    signature: Signature,
}

async fn add_appointment<M>(
    State(tower): State<Arc<Tower<M>>>,
    Json(request): Json<Appointment>,
) -> Result<Json<AppointmentResponse>, Error>
where
    M: Middleware + 'static,
{
    APPOINTMENT_REQUESTS.inc();
    let _timer = APPOINTMENT_LATENCY.start_timer();
    let result = tower.add_appointment(request).await;
    let status_code = match &result {
        Ok(_) => StatusCode::OK,
        Err(error) => error.status_code(),
    };
    APPOINTMENT_STATUS.with_label_values(&[status_code.as_str()]).inc();
    let (appointment, signature) = result?;
    Ok(Json(AppointmentResponse { appointment, signature }))
}

struct Window {
    max: u32,
    window: Duration,
    message: String,
}

impl Window {
    /// Fixed-window counter: `count` resets whenever `window` has
    /// elapsed since it was last reset.
    fn check(&self, state: &mut (Instant, u32)) -> bool {
        if state.0.elapsed() >= self.window {
            *state = (Instant::now(), 0);
        }
        if state.1 >= self.max {
            return false;
        }
        state.1 += 1;
        true
    }
}

/// Per-IP and global windowed-counter rate limiting, added as a small
/// `tower`-style layer rather than a pulled-in dependency.
pub struct RateLimiters {
    per_ip: Window,
    per_ip_state: Mutex<HashMap<IpAddr, (Instant, u32)>>,
    global: Window,
    global_state: Mutex<(Instant, u32)>,
}

impl RateLimiters {
    pub fn new(options: &Options) -> Self {
        Self {
            per_ip: Window {
                max: options.rate_limit_user_max,
                window: Duration::from_millis(options.rate_limit_user_window_ms),
                message: options.rate_limit_user_message.clone(),
            },
            per_ip_state: Mutex::new(HashMap::new()),
            global: Window {
                max: options.rate_limit_global_max,
                window: Duration::from_millis(options.rate_limit_global_window_ms),
                message: options.rate_limit_global_message.clone(),
            },
            global_state: Mutex::new((Instant::now(), 0)),
        }
    }

    fn check_global(&self) -> Result<(), (StatusCode, String)> {
        let mut state = self.global_state.lock().unwrap();
        if self.global.check(&mut state) {
            Ok(())
        } else {
            Err((StatusCode::SERVICE_UNAVAILABLE, self.global.message.clone()))
        }
    }

    fn check_ip(&self, ip: IpAddr) -> Result<(), (StatusCode, String)> {
        let mut states = self.per_ip_state.lock().unwrap();
        let state = states.entry(ip).or_insert((Instant::now(), 0));
        if self.per_ip.check(state) {
            Ok(())
        } else {
            Err((StatusCode::TOO_MANY_REQUESTS, self.per_ip.message.clone()))
        }
    }
}

async fn rate_limit(
    State(limiters): State<Arc<RateLimiters>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: axum::extract::Request,
    next: Next,
) -> Response {
    if let Err(response) = limiters.check_global() {
        warn!("global rate limit exceeded");
        RATE_LIMITED.with_label_values(&["global"]).inc();
        return response.into_response();
    }
    if let Err(response) = limiters.check_ip(addr.ip()) {
        warn!(ip = %addr.ip(), "per-IP rate limit exceeded");
        RATE_LIMITED.with_label_values(&["ip"]).inc();
        return response.into_response();
    }
    next.run(request).await
}

pub fn router<M>(tower: Arc<Tower<M>>, limiters: Arc<RateLimiters>) -> Router
where
    M: Middleware + 'static,
{
    Router::new()
        .route("/appointment", post(add_appointment::<M>))
        .layer(middleware::from_fn_with_state(limiters, rate_limit))
        .layer(CatchPanicLayer::new())
        .with_state(tower)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_resets_after_elapsing() {
        let window = Window {
            max: 1,
            window: Duration::from_millis(1),
            message: "nope".to_string(),
        };
        let mut state = (Instant::now() - Duration::from_millis(10), 0);
        assert!(window.check(&mut state));
        assert!(!window.check(&mut state));
        std::thread::sleep(Duration::from_millis(5));
        assert!(window.check(&mut state));
    }
}
