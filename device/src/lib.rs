pub mod attribute;
pub mod cache;
pub mod config;
pub mod dumper;
pub mod error;
#[cfg(test)]
mod fake;
pub mod finder;
pub mod jni_bridge;
pub mod locator;
pub mod native;
pub mod selector;
pub mod server;
pub mod session;
pub mod snapshot;
pub mod toast;
pub mod xml;
pub mod xpath;

use std::net::SocketAddr;
use std::sync::Arc;

use jni::JNIEnv;
use jni::objects::{JClass, JObject, JString};
use jni::sys::jint;
use once_cell::sync::Lazy;
use tracing_subscriber::EnvFilter;

use crate::config::{DEFAULT_LOG_FILTER, ServerConfig};
use crate::error::{AppError, Result};
use crate::jni_bridge::JniDevice;
use crate::native::UiDevice;
use crate::server::ServerState;
use crate::toast::ToastBuffer;

/// Toasts can be posted before the server is up, so the buffer outlives it.
static TOASTS: Lazy<Arc<ToastBuffer>> = Lazy::new(|| Arc::new(ToastBuffer::new()));

fn init_logging(config: &ServerConfig) {
    let filter = EnvFilter::try_new(&config.log_filter).unwrap_or_else(|e| {
        eprintln!("invalid UIA_LOG filter '{}': {e}", config.log_filter);
        EnvFilter::new(DEFAULT_LOG_FILTER)
    });
    let installed = match std::fs::File::create(&config.log_file) {
        Ok(file) => tracing_subscriber::fmt()
            .with_writer(file)
            .with_ansi(false)
            .with_env_filter(filter)
            .try_init(),
        Err(e) => {
            eprintln!("cannot create {}: {e}, logging to stderr", config.log_file.display());
            tracing_subscriber::fmt()
                .with_ansi(false)
                .with_env_filter(filter)
                .try_init()
        }
    };
    if installed.is_err() {
        eprintln!("a tracing subscriber is already installed");
    }
}

fn run(env: &mut JNIEnv, bridge: &JObject, config: &ServerConfig) -> Result<()> {
    let device: Arc<dyn UiDevice> = Arc::new(JniDevice::new(env, bridge)?);
    tracing::info!(
        port = config.port,
        adapter_version = device.adapter_version(),
        "starting automation server"
    );
    let app = server::router(Arc::new(ServerState::new(device, TOASTS.clone())));

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| AppError::new(format!("cannot build tokio runtime: {e}")))?;

    runtime.block_on(async move {
        let addr = SocketAddr::from(([127, 0, 0, 1], config.port));
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| AppError::new(format!("cannot bind {addr}: {e}")))?;
        tracing::info!(port = config.port, "http api ready");
        axum::serve(listener, app)
            .await
            .map_err(|e| AppError::new(format!("http server failed: {e}")))
    })
}

/// Blocks the calling instrumentation thread for as long as the server runs.
///
/// `port` is the `port` instrumentation argument (`am instrument -e port N`),
/// or 0 when it was not given.
#[unsafe(no_mangle)]
pub extern "system" fn Java_io_uiautomator_server_Main_nativeRun(
    mut env: JNIEnv,
    _class: JClass,
    bridge: JObject,
    port: jint,
) {
    let config = ServerConfig::from_env().with_launch_port(port);
    init_logging(&config);

    if let Err(e) = run(&mut env, &bridge, &config) {
        tracing::error!(error = %e, "server stopped");
        if env.throw_new("java/lang/RuntimeException", e.to_string()).is_err() {
            tracing::error!("could not raise the failure in java");
        }
    }
}

#[unsafe(no_mangle)]
pub extern "system" fn Java_io_uiautomator_server_Main_nativeOnToast(
    mut env: JNIEnv,
    _class: JClass,
    text: JString,
) {
    match env.get_string(&text) {
        Ok(text) => TOASTS.push(String::from(text)),
        Err(e) => tracing::warn!(error = %e, "dropping unreadable toast text"),
    }
}
