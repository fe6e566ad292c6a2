#![allow(dead_code)]

use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

use weave::xml::Element;

/// A repository tree under a tempdir.
pub struct RepoFixture {
    dir: tempfile::TempDir,
}

impl RepoFixture {
    pub fn new() -> Result<Self> {
        Ok(RepoFixture {
            dir: tempfile::tempdir().context("create repo tempdir")?,
        })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn write(&self, rel: &str, contents: &str) -> Result<()> {
        let path = self.dir.path().join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create dir {}", parent.display()))?;
        }
        std::fs::write(&path, contents).with_context(|| format!("write {}", path.display()))?;
        Ok(())
    }

    pub fn options(&self) -> weave::options::ServerOptions {
        let mut options = weave::options::ServerOptions::default();
        options.repository = self.dir.path().to_path_buf();
        options
    }
}

pub struct ServerGuard {
    pub base_url: String,
    pub password: String,
    pub repo: RepoFixture,
    child: Child,
}

impl Drop for ServerGuard {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

pub fn spawn_server(repo: RepoFixture) -> Result<ServerGuard> {
    spawn_server_with_config(repo, None)
}

/// Spawn with an optional JSON config file written next to the
/// repository (decision mode, stats log, regex rules, ...).
pub fn spawn_server_with_config(repo: RepoFixture, config: Option<&str>) -> Result<ServerGuard> {
    let password = "test-secret".to_string();
    let addr_file = repo.path().join("addr.txt");

    let mut args = vec![
        "--listen".to_string(),
        "127.0.0.1:0".to_string(),
        "--addr-file".to_string(),
        addr_file.to_str().unwrap().to_string(),
        "--repository".to_string(),
        repo.path().to_str().unwrap().to_string(),
        "--password".to_string(),
        password.clone(),
    ];
    if let Some(config) = config {
        let config_path = repo.path().join("weave.json");
        std::fs::write(&config_path, config).context("write config file")?;
        args.push("--config".to_string());
        args.push(config_path.to_str().unwrap().to_string());
    }

    let child = Command::new(env!("CARGO_BIN_EXE_weave-server"))
        .args(&args)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .context("spawn weave-server")?;

    let base_url = read_addr_file(&addr_file)?;
    wait_for_healthz(&base_url)?;

    Ok(ServerGuard {
        base_url,
        password,
        repo,
        child,
    })
}

fn read_addr_file(addr_file: &Path) -> Result<String> {
    let start = Instant::now();
    loop {
        if start.elapsed() > Duration::from_secs(5) {
            anyhow::bail!("addr file not written at {}", addr_file.display());
        }

        if let Ok(s) = std::fs::read_to_string(addr_file) {
            let s = s.trim();
            if !s.is_empty() {
                return Ok(format!("http://{}", s));
            }
        }
        thread::sleep(Duration::from_millis(10));
    }
}

pub fn wait_for_healthz(base_url: &str) -> Result<()> {
    let client = reqwest::blocking::Client::new();
    let start = Instant::now();
    loop {
        if start.elapsed() > Duration::from_secs(5) {
            anyhow::bail!("server did not become healthy at {}/healthz", base_url);
        }
        match client.get(format!("{}/healthz", base_url)).send() {
            Ok(resp) if resp.status().is_success() => return Ok(()),
            _ => {
                thread::sleep(Duration::from_millis(50));
            }
        }
    }
}

/// Decoded XML-RPC reply.
#[derive(Debug, Clone, PartialEq)]
pub enum RpcReply {
    Bool(bool),
    Str(String),
    Pairs(Vec<(String, String)>),
    Fault(i32, String),
}

impl RpcReply {
    pub fn expect_str(self) -> String {
        match self {
            RpcReply::Str(s) => s,
            other => panic!("expected string reply, got {:?}", other),
        }
    }

    pub fn expect_bool(self) -> bool {
        match self {
            RpcReply::Bool(b) => b,
            other => panic!("expected boolean reply, got {:?}", other),
        }
    }

    pub fn expect_fault(self) -> (i32, String) {
        match self {
            RpcReply::Fault(code, message) => (code, message),
            other => panic!("expected fault, got {:?}", other),
        }
    }
}

/// Issue one XML-RPC call as `user` with the server's password.
pub fn call(server: &ServerGuard, user: &str, method: &str, params: &[&str]) -> Result<RpcReply> {
    call_as(server, user, &server.password, method, params)
}

pub fn call_as(
    server: &ServerGuard,
    user: &str,
    password: &str,
    method: &str,
    params: &[&str],
) -> Result<RpcReply> {
    let mut params_el = Element::new("params");
    for param in params {
        params_el.children.push(
            Element::new("param").with_child(
                Element::new("value")
                    .with_child(Element::new("string").with_text(param.to_string())),
            ),
        );
    }
    let doc = Element::new("methodCall")
        .with_child(Element::new("methodName").with_text(method))
        .with_child(params_el);
    let body = format!("<?xml version=\"1.0\"?>{}", doc.to_xml());

    let client = reqwest::blocking::Client::new();
    let response = client
        .post(format!("{}/RPC2", server.base_url))
        .basic_auth(user, Some(password))
        .header(reqwest::header::CONTENT_TYPE, "text/xml")
        .body(body)
        .send()
        .context("send rpc call")?
        .error_for_status()
        .context("rpc http status")?;

    let text = response.text().context("read rpc response")?;
    parse_reply(&text)
}

fn parse_reply(body: &str) -> Result<RpcReply> {
    let root = Element::parse(body).context("parse methodResponse")?;

    if let Some(fault) = root.find("fault") {
        let members = fault
            .find("value")
            .and_then(|v| v.find("struct"))
            .context("fault without struct")?;
        let mut code = 0;
        let mut message = String::new();
        for member in members.find_all("member") {
            let name = member.find("name").map(|n| n.text.trim().to_string());
            let value = member.find("value");
            match (name.as_deref(), value) {
                (Some("faultCode"), Some(v)) => {
                    code = scalar(v).parse().unwrap_or(0);
                }
                (Some("faultString"), Some(v)) => {
                    message = scalar(v);
                }
                _ => {}
            }
        }
        return Ok(RpcReply::Fault(code, message));
    }

    let value = root
        .find("params")
        .and_then(|p| p.find("param"))
        .and_then(|p| p.find("value"))
        .context("response without value")?;

    match value.children.first() {
        Some(typed) if typed.name == "boolean" => Ok(RpcReply::Bool(typed.text.trim() == "1")),
        Some(typed) if typed.name == "array" => Ok(RpcReply::Pairs(parse_pairs(typed)?)),
        _ => Ok(RpcReply::Str(scalar(value))),
    }
}

fn scalar(value: &Element) -> String {
    match value.children.first() {
        Some(typed) => typed.text.clone(),
        None => value.text.clone(),
    }
}

fn parse_pairs(array: &Element) -> Result<Vec<(String, String)>> {
    let data = array.find("data").context("array without data")?;
    let mut out = Vec::new();
    for value in data.find_all("value") {
        let inner = value
            .find("array")
            .and_then(|a| a.find("data"))
            .context("pair without inner array")?;
        let fields: Vec<String> = inner.find_all("value").map(scalar).collect();
        if fields.len() != 2 {
            anyhow::bail!("expected (kind, name) pair, got {} fields", fields.len());
        }
        out.push((fields[0].clone(), fields[1].clone()));
    }
    Ok(out)
}
