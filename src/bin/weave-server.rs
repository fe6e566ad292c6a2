use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use base64::Engine;
use clap::Parser;

use weave::core::Core;
use weave::error::CoreError;
use weave::metadata::{DnsReverseResolver, Identity};
use weave::options::{FileMonitor, ServerOptions};
use weave::repo::watch_repository;
use weave::xml::Element;

#[derive(Parser)]
#[command(name = "weave-server")]
#[command(about = "Configuration synthesis server", long_about = None)]
struct Args {
    /// Address to listen on
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Write bound address to this file (dev/test convenience)
    #[arg(long)]
    addr_file: Option<PathBuf>,

    /// Repository root
    #[arg(long)]
    repository: Option<PathBuf>,

    /// JSON configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Global client password
    #[arg(long)]
    password: Option<String>,
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("{:#}", err);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut options = match &args.config {
        Some(path) => ServerOptions::from_file(path)?,
        None => ServerOptions::default(),
    };
    if let Some(listen) = args.listen {
        options.listen = listen;
    }
    if let Some(repository) = args.repository {
        options.repository = repository;
    }
    if let Some(password) = args.password {
        options.password = Some(password);
    }

    let reverse = Arc::new(DnsReverseResolver::new(Duration::from_millis(
        options.dns_timeout_ms,
    )));
    let core = Arc::new(
        Core::new(options.clone(), reverse)
            .map_err(|err| anyhow::anyhow!("load repository: {err}"))?,
    );

    if options.filemonitor == FileMonitor::Inotify {
        let watcher_core = core.clone();
        let repository = options.repository.clone();
        tokio::spawn(async move {
            if let Err(err) = watch_repository(watcher_core, repository).await {
                tracing::error!(error = %err, "repository watcher stopped");
            }
        });
    }

    {
        let stats = core.stats();
        let sinks = core.registry().sinks().to_vec();
        tokio::spawn(stats.run(sinks));
    }

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/RPC2", post(rpc))
        .with_state(core);

    let listener = tokio::net::TcpListener::bind(options.listen)
        .await
        .with_context(|| format!("bind {}", options.listen))?;

    let local_addr = listener.local_addr().context("read listener local addr")?;
    tracing::info!(%local_addr, "weave-server listening");

    if let Some(addr_file) = &args.addr_file {
        std::fs::write(addr_file, local_addr.to_string())
            .with_context(|| format!("write addr file {}", addr_file.display()))?;
    }

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("server error")?;

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

async fn healthz() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({"status": "ok"}))
}

async fn rpc(
    State(core): State<Arc<Core>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let identity = identity_from_request(&headers, peer);

    let (method, params) = match parse_call(&body) {
        Ok(call) => call,
        Err(err) => return xml_response(fault_xml(3, &format!("malformed call: {err:#}"))),
    };

    match dispatch(&core, &identity, &method, &params) {
        Ok(value) => xml_response(response_xml(&value)),
        Err(Dispatch::Fault(code, message)) => xml_response(fault_xml(code, &message)),
    }
}

fn identity_from_request(headers: &HeaderMap, peer: SocketAddr) -> Identity {
    let mut claimed = None;
    let mut password = None;
    if let Some(value) = headers.get(header::AUTHORIZATION) {
        if let Some((user, pass)) = parse_basic_auth(value.to_str().unwrap_or_default()) {
            claimed = Some(user);
            password = Some(pass);
        }
    }

    let cert_cn = headers
        .get("x-ssl-client-cn")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    Identity {
        claimed,
        peer: peer.ip(),
        cert_cn,
        password,
    }
}

fn parse_basic_auth(value: &str) -> Option<(String, String)> {
    let encoded = value.strip_prefix("Basic ")?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, pass) = decoded.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}

enum RpcValue {
    Bool(bool),
    Str(String),
    /// (kind, name) pairs, rendered as an array of two-element arrays.
    Pairs(Vec<(String, String)>),
}

enum Dispatch {
    Fault(i32, String),
}

impl From<CoreError> for Dispatch {
    fn from(err: CoreError) -> Self {
        Dispatch::Fault(err.fault_code(), err.to_string())
    }
}

fn dispatch(
    core: &Core,
    identity: &Identity,
    method: &str,
    params: &[String],
) -> Result<RpcValue, Dispatch> {
    let param = |index: usize| -> Result<&str, Dispatch> {
        params
            .get(index)
            .map(String::as_str)
            .ok_or_else(|| Dispatch::Fault(3, format!("{method}: missing parameter {index}")))
    };

    match method {
        "AssertProfile" => Ok(RpcValue::Bool(
            core.assert_profile(identity, param(0)?)?,
        )),
        "DeclareVersion" => Ok(RpcValue::Bool(
            core.declare_version(identity, param(0)?)?,
        )),
        "GetProbes" => Ok(RpcValue::Str(core.get_probes(identity)?)),
        "RecvProbeData" => Ok(RpcValue::Bool(
            core.recv_probe_data(identity, param(0)?)?,
        )),
        "GetConfig" => Ok(RpcValue::Str(core.get_config(identity)?)),
        "GetDecisionList" => Ok(RpcValue::Pairs(
            core.get_decision_list(identity, param(0)?)?,
        )),
        "RecvStats" => Ok(RpcValue::Bool(core.recv_stats(identity, param(0)?)?)),
        other => Err(Dispatch::Fault(7, format!("unknown method {other}"))),
    }
}

// ---- XML-RPC wire format ---------------------------------------------

fn parse_call(body: &str) -> Result<(String, Vec<String>)> {
    let root = Element::parse(body)?;
    if root.name != "methodCall" {
        anyhow::bail!("expected methodCall, got {}", root.name);
    }
    let method = root
        .find("methodName")
        .map(|el| el.text.trim().to_string())
        .context("methodCall without methodName")?;

    let mut params = Vec::new();
    if let Some(params_el) = root.find("params") {
        for param in params_el.find_all("param") {
            let value = param.find("value").context("param without value")?;
            params.push(scalar_value(value));
        }
    }
    Ok((method, params))
}

/// `<value>` bodies are strings unless typed; typed scalars collapse to
/// their text form.
fn scalar_value(value: &Element) -> String {
    match value.children.first() {
        Some(typed) => typed.text.clone(),
        None => value.text.clone(),
    }
}

fn response_xml(value: &RpcValue) -> String {
    let payload = match value {
        RpcValue::Bool(b) => Element::new("boolean").with_text(if *b { "1" } else { "0" }),
        RpcValue::Str(s) => Element::new("string").with_text(s.clone()),
        RpcValue::Pairs(pairs) => {
            let mut data = Element::new("data");
            for (kind, name) in pairs {
                let mut inner = Element::new("data");
                for field in [kind, name] {
                    inner.children.push(
                        Element::new("value")
                            .with_child(Element::new("string").with_text(field.clone())),
                    );
                }
                data.children.push(
                    Element::new("value")
                        .with_child(Element::new("array").with_child(inner)),
                );
            }
            Element::new("array").with_child(data)
        }
    };

    let doc = Element::new("methodResponse").with_child(
        Element::new("params").with_child(
            Element::new("param").with_child(Element::new("value").with_child(payload)),
        ),
    );
    format!("<?xml version=\"1.0\"?>{}", doc.to_xml())
}

fn fault_xml(code: i32, message: &str) -> String {
    let member = |name: &str, value: Element| {
        Element::new("member")
            .with_child(Element::new("name").with_text(name))
            .with_child(Element::new("value").with_child(value))
    };

    let doc = Element::new("methodResponse").with_child(
        Element::new("fault").with_child(
            Element::new("value").with_child(
                Element::new("struct")
                    .with_child(member(
                        "faultCode",
                        Element::new("int").with_text(code.to_string()),
                    ))
                    .with_child(member(
                        "faultString",
                        Element::new("string").with_text(message),
                    )),
            ),
        ),
    );
    format!("<?xml version=\"1.0\"?>{}", doc.to_xml())
}

fn xml_response(body: String) -> Response {
    ([(header::CONTENT_TYPE, "text/xml")], body).into_response()
}
