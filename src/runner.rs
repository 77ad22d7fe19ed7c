//! One-shot contract execution for the `wasmhost run` command.
//!
//! Deploys a `.wasm` (or `.wat`) contract on a fresh [`LocalChain`], seeds
//! its state from an optional state file, runs one exported function as a
//! full request or a view call, and writes the state back after full calls.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use tracing::{info, info_span};
use wasmhost_core::container::nested_map_key;
use wasmhost_core::{Dict, HostConfig, LocalChain};
use wasmhost_types::encoding::{base64_encode, display_bytes, parse_hex};
use wasmhost_types::{Balances, ScHname};

use crate::retry::{gave_up, retry_on_invalidated};
use crate::state_file;

/// Everything `wasmhost run` needs.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub wasm: PathBuf,
    pub function: String,
    pub view: bool,
    pub state_file: Option<PathBuf>,
    pub params: Vec<(String, Vec<u8>)>,
    pub config: HostConfig,
}

/// What a run produced.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub contract: String,
    pub hname: ScHname,
    pub function: String,
    pub view: bool,
    pub results: Dict,
    pub events: Vec<String>,
    pub logs: Vec<String>,
    pub sent_requests: usize,
    pub state_entries: usize,
}

/// Parse one `--param key=value` argument. A `0x` value is hex, anything
/// else is taken as UTF-8 text.
pub fn parse_param(arg: &str) -> Result<(String, Vec<u8>)> {
    let (key, value) = arg
        .split_once('=')
        .ok_or_else(|| anyhow!("invalid --param '{arg}': expected key=value"))?;
    if key.is_empty() {
        return Err(anyhow!("invalid --param '{arg}': empty key"));
    }
    let value = if value.starts_with("0x") {
        parse_hex(value, "param")?
    } else {
        value.as_bytes().to_vec()
    };
    Ok((key.to_string(), value))
}

fn params_dict(params: &[(String, Vec<u8>)]) -> Dict {
    let dict = Dict::new();
    for (key, value) in params {
        dict.insert(nested_map_key(b"", key.as_bytes()), value.clone());
    }
    dict
}

fn contract_name(wasm: &Path) -> String {
    wasm.file_stem()
        .and_then(|stem| stem.to_str())
        .filter(|stem| !stem.is_empty())
        .unwrap_or("contract")
        .to_string()
}

pub fn run(request: &RunRequest) -> Result<RunOutcome> {
    let program = std::fs::read(&request.wasm)
        .with_context(|| format!("Failed to read contract {}", request.wasm.display()))?;
    let name = contract_name(&request.wasm);
    let _span = info_span!("run", contract = %name, function = %request.function).entered();

    let chain = LocalChain::new(request.config.clone());
    let hname = chain
        .deploy_wasm(&name, &program, Dict::new())
        .with_context(|| format!("Failed to deploy {name}"))?;
    let state = chain.state(hname)?;
    if let Some(path) = &request.state_file {
        let stored = state_file::load(path)?;
        info!(entries = stored.len(), path = %path.display(), "loaded state");
        state.replace_with(&stored);
    }

    let params = params_dict(&request.params);
    let results = if request.view {
        let config = chain.config();
        retry_on_invalidated(&config.retry, config.view_timeout(), |_| {
            chain.call_view(hname, &request.function, params.clone())
        })
        .map_err(|err| {
            if gave_up(&err) {
                anyhow!(err).context("view call kept observing state changes")
            } else {
                anyhow!(err)
            }
        })?
    } else {
        let results = chain.post_request(
            hname,
            &request.function,
            params,
            chain.owner(),
            Balances::new(),
        )?;
        if let Some(path) = &request.state_file {
            state_file::save(path, &state)?;
            info!(entries = state.len(), path = %path.display(), "saved state");
        }
        results
    };

    Ok(RunOutcome {
        contract: name,
        hname,
        function: request.function.clone(),
        view: request.view,
        results,
        events: chain.events(),
        logs: chain.logs(),
        sent_requests: chain.sent_requests().len(),
        state_entries: state.len(),
    })
}

#[derive(Serialize)]
struct RunReport<'a> {
    contract: &'a str,
    hname: String,
    function: &'a str,
    view: bool,
    results: BTreeMap<String, String>,
    events: &'a [String],
    logs: &'a [String],
    sent_requests: usize,
    state_entries: usize,
}

impl RunOutcome {
    /// JSON report; result values are base64.
    pub fn to_json(&self) -> Result<String> {
        let report = RunReport {
            contract: &self.contract,
            hname: self.hname.to_string(),
            function: &self.function,
            view: self.view,
            results: self
                .results
                .entries()
                .into_iter()
                .map(|(key, value)| (display_bytes(&key), base64_encode(&value)))
                .collect(),
            events: &self.events,
            logs: &self.logs,
            sent_requests: self.sent_requests,
            state_entries: self.state_entries,
        };
        Ok(serde_json::to_string_pretty(&report)?)
    }

    pub fn to_text(&self) -> String {
        let kind = if self.view { "view" } else { "full" };
        let mut out = format!(
            "{} {}::{} ({kind} call)\n",
            self.hname, self.contract, self.function
        );
        if self.results.is_empty() {
            out.push_str("  no results\n");
        }
        for (key, value) in self.results.entries() {
            out.push_str(&format!("  {} = {}\n", display_bytes(&key), display_bytes(&value)));
        }
        for event in &self.events {
            out.push_str(&format!("  event: {event}\n"));
        }
        for log in &self.logs {
            out.push_str(&format!("  log: {log}\n"));
        }
        if self.sent_requests > 0 {
            out.push_str(&format!("  sent requests: {}\n", self.sent_requests));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_param_text_and_hex() {
        assert_eq!(
            parse_param("name=alice").unwrap(),
            ("name".to_string(), b"alice".to_vec())
        );
        assert_eq!(
            parse_param("amount=0x2a00").unwrap(),
            ("amount".to_string(), vec![42, 0])
        );
        assert_eq!(parse_param("eq=a=b").unwrap().1, b"a=b".to_vec());
        assert!(parse_param("novalue").is_err());
        assert!(parse_param("=x").is_err());
    }

    #[test]
    fn test_params_use_map_keys() {
        let dict = params_dict(&[("a.b".to_string(), vec![1])]);
        assert_eq!(dict.get_value(b"a\\.b"), Some(vec![1]));
    }

    #[test]
    fn test_contract_name_from_file_stem() {
        assert_eq!(contract_name(Path::new("/tmp/counter.wasm")), "counter");
        assert_eq!(contract_name(Path::new("/")), "contract");
    }
}
