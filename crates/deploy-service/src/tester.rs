//! Post-deploy test runner
//!
//! Three gated stages run against a resource's public URL:
//! 1. liveness: `/health` answers 2xx within a deadline
//! 2. payment required: some paid path answers 402 with decodable terms
//! 3. terms validation: payout address, amount, network and asset
//!
//! A failed stage skips every later stage.

use base64::engine::general_purpose::{STANDARD, URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine as _;
use paygate_common::DeployedResource;
use regex::Regex;
use reqwest::Method;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::LazyLock;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Response headers carrying the payment terms
const PAYMENT_HEADERS: &[&str] = &["payment-required", "x-payment-required"];

/// Tried after the resource's own GET endpoints
const FALLBACK_PATHS: &[&str] = &["/api", "/api/data", "/data", "/premium"];

const KNOWN_NETWORKS: &[&str] = &[
    "base",
    "base-sepolia",
    "avalanche",
    "avalanche-fuji",
    "polygon",
    "polygon-amoy",
    "iotex",
    "sei",
    "sei-testnet",
    "solana",
    "solana-devnet",
    "eip155:8453",
    "eip155:84532",
    "eip155:43114",
    "eip155:43113",
    "eip155:137",
    "eip155:80002",
];

static EVM_ADDRESS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^0x[0-9a-fA-F]{40}$").expect("EVM address regex is valid"));

static BASE58_ADDRESS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[1-9A-HJ-NP-Za-km-z]{32,44}$").expect("base58 address regex is valid")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Liveness,
    PaymentRequired,
    PaymentTerms,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StageResult {
    pub stage: Stage,
    pub passed: bool,
    pub duration_ms: u64,
    pub details: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl StageResult {
    fn pass(stage: Stage, started: Instant, details: Value) -> Self {
        Self {
            stage,
            passed: true,
            duration_ms: started.elapsed().as_millis() as u64,
            details,
            error: None,
            warnings: Vec::new(),
        }
    }

    fn fail(stage: Stage, started: Instant, details: Value, error: impl Into<String>) -> Self {
        Self {
            stage,
            passed: false,
            duration_ms: started.elapsed().as_millis() as u64,
            details,
            error: Some(error.into()),
            warnings: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TestSuiteReport {
    pub resource_id: String,
    pub base_url: String,
    /// Every attempted stage passed and none was skipped
    pub all_passed: bool,
    pub stages: Vec<StageResult>,
}

impl TestSuiteReport {
    pub fn stage(&self, stage: Stage) -> Option<&StageResult> {
        self.stages.iter().find(|s| s.stage == stage)
    }
}

#[derive(Debug, Clone)]
pub struct TesterConfig {
    /// Overall liveness deadline
    pub liveness_timeout: Duration,
    pub liveness_interval: Duration,
    /// Per-request bound
    pub request_timeout: Duration,
    pub expected_asset: Option<String>,
}

impl Default for TesterConfig {
    fn default() -> Self {
        Self {
            liveness_timeout: Duration::from_secs(30),
            liveness_interval: Duration::from_secs(2),
            request_timeout: Duration::from_secs(10),
            expected_asset: None,
        }
    }
}

pub struct PostDeployTester {
    client: reqwest::Client,
    config: TesterConfig,
}

impl PostDeployTester {
    pub fn new(config: TesterConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .unwrap_or_else(|e| {
                warn!("Falling back to default HTTP client: {}", e);
                reqwest::Client::new()
            });
        Self { client, config }
    }

    /// Run the suite against the resource's public URL
    pub async fn run(&self, resource: &DeployedResource) -> TestSuiteReport {
        self.run_against(resource, &resource.public_url).await
    }

    /// Run the suite against an explicit base URL
    pub async fn run_against(&self, resource: &DeployedResource, base_url: &str) -> TestSuiteReport {
        let base_url = base_url.trim_end_matches('/').to_string();
        info!(resource_id = %resource.id(), base_url = %base_url, "Running post-deploy tests");

        let mut stages = Vec::new();

        let liveness = self.check_liveness(&base_url).await;
        let live = liveness.passed;
        stages.push(liveness);

        if live {
            let (payment, terms) = self.check_payment_required(&base_url, resource).await;
            stages.push(payment);

            if let Some(terms) = terms {
                stages.push(validate_terms(&terms, resource, self.config.expected_asset.as_deref()));
            }
        }

        let all_passed = stages.len() == 3 && stages.iter().all(|s| s.passed);
        info!(
            resource_id = %resource.id(),
            all_passed,
            stages = stages.len(),
            "Post-deploy tests finished"
        );

        TestSuiteReport {
            resource_id: resource.id().to_string(),
            base_url,
            all_passed,
            stages,
        }
    }

    async fn check_liveness(&self, base_url: &str) -> StageResult {
        let started = Instant::now();
        let url = format!("{}/health", base_url);
        let mut attempts = 0u32;
        let mut last_error = String::from("no attempt made");

        loop {
            attempts += 1;
            let remaining = self
                .config
                .liveness_timeout
                .saturating_sub(started.elapsed())
                .max(Duration::from_millis(1));
            let request = self
                .client
                .get(&url)
                .timeout(remaining.min(self.config.request_timeout));
            match request.send().await {
                Ok(response) if response.status().is_success() => {
                    let status = response.status().as_u16();
                    let body = response.json::<Value>().await.unwrap_or(Value::Null);
                    return StageResult::pass(
                        Stage::Liveness,
                        started,
                        json!({ "url": url, "status": status, "attempts": attempts, "body": body }),
                    );
                }
                Ok(response) => last_error = format!("HTTP {}", response.status().as_u16()),
                Err(e) => last_error = e.to_string(),
            }
            debug!(url = %url, attempt = attempts, error = %last_error, "Liveness check not ready");

            if started.elapsed() + self.config.liveness_interval > self.config.liveness_timeout {
                break;
            }
            tokio::time::sleep(self.config.liveness_interval).await;
        }

        StageResult::fail(
            Stage::Liveness,
            started,
            json!({ "url": url, "attempts": attempts }),
            format!(
                "Health endpoint not ready after {}s: {}",
                self.config.liveness_timeout.as_secs(),
                last_error
            ),
        )
    }

    async fn check_payment_required(
        &self,
        base_url: &str,
        resource: &DeployedResource,
    ) -> (StageResult, Option<Value>) {
        let started = Instant::now();
        let mut tried = Vec::new();

        for call in paid_calls(resource) {
            let path = call.path;
            let url = format!("{}{}", base_url, path);
            let mut request = self.client.request(call.method.clone(), &url);
            if let Some(body) = &call.body {
                request = request.json(body);
            }
            let response = match request.send().await {
                Ok(response) => response,
                Err(e) => {
                    tried.push(json!({ "method": call.method.as_str(), "path": path, "error": e.to_string() }));
                    continue;
                }
            };

            let status = response.status().as_u16();
            if status != 402 {
                tried.push(json!({ "method": call.method.as_str(), "path": path, "status": status }));
                continue;
            }

            let header = PAYMENT_HEADERS.iter().find_map(|name| {
                response
                    .headers()
                    .get(*name)
                    .and_then(|v| v.to_str().ok())
                    .map(|v| (*name, v.to_string()))
            });

            if let Some((name, raw)) = header {
                if let Some(terms) = decode_terms(&raw) {
                    let details = json!({ "path": path, "header": name, "terms": terms });
                    return (StageResult::pass(Stage::PaymentRequired, started, details), Some(terms));
                }
            }

            let body = response.json::<Value>().await.ok();
            if let Some(body) = body.filter(|b| b.get("accepts").is_some()) {
                let details = json!({ "path": path, "source": "body", "terms": body });
                let mut result = StageResult::pass(Stage::PaymentRequired, started, details);
                result
                    .warnings
                    .push("Payment terms found in the response body, not in a header".to_string());
                return (result, Some(body));
            }

            tried.push(json!({
                "method": call.method.as_str(),
                "path": path,
                "status": 402,
                "error": "no decodable payment terms"
            }));
        }

        let result = StageResult::fail(
            Stage::PaymentRequired,
            started,
            json!({ "tried": tried }),
            "No candidate path answered 402 with payment terms",
        );
        (result, None)
    }
}

/// One request sent while looking for a 402
#[derive(Debug, Clone, PartialEq)]
pub struct PaidCall {
    pub method: Method,
    pub path: String,
    pub body: Option<Value>,
}

impl PaidCall {
    fn get(path: &str) -> Self {
        Self {
            method: Method::GET,
            path: path.to_string(),
            body: None,
        }
    }
}

fn has_path_params(path: &str) -> bool {
    path.contains(':') || path.contains('{') || path.contains('*')
}

/// GET endpoints without path parameters, then other endpoints that carry
/// an example request body, then the common fallbacks
pub fn paid_calls(resource: &DeployedResource) -> Vec<PaidCall> {
    let endpoints = resource
        .config
        .endpoints
        .iter()
        .filter(|e| !has_path_params(&e.path));

    let gets = endpoints
        .clone()
        .filter(|e| e.method.eq_ignore_ascii_case("GET"))
        .map(|e| PaidCall::get(&e.path));

    let with_examples = endpoints
        .filter(|e| !e.method.eq_ignore_ascii_case("GET"))
        .filter_map(|e| {
            let body = e.example_request.clone()?;
            let method = Method::from_bytes(e.method.to_ascii_uppercase().as_bytes()).ok()?;
            Some(PaidCall {
                method,
                path: e.path.clone(),
                body: Some(body),
            })
        });

    let fallbacks = FALLBACK_PATHS.iter().map(|p| PaidCall::get(p));

    let mut calls: Vec<PaidCall> = Vec::new();
    for call in gets.chain(with_examples).chain(fallbacks) {
        if call.path == "/" || call.path == "/health" {
            continue;
        }
        if !calls
            .iter()
            .any(|p| p.method == call.method && p.path == call.path)
        {
            calls.push(call);
        }
    }
    calls
}

/// Payment terms are base64-encoded JSON, or plain JSON
pub fn decode_terms(raw: &str) -> Option<Value> {
    let raw = raw.trim();
    if let Ok(value) = serde_json::from_str::<Value>(raw) {
        if value.is_object() || value.is_array() {
            return Some(value);
        }
    }

    [&STANDARD, &URL_SAFE, &URL_SAFE_NO_PAD]
        .iter()
        .filter_map(|engine| engine.decode(raw).ok())
        .filter_map(|bytes| serde_json::from_slice::<Value>(&bytes).ok())
        .find(|value| value.is_object() || value.is_array())
}

/// `{accepts: [...]}`, a bare array, or a single flat option
fn payment_options(terms: &Value) -> Vec<Value> {
    match terms {
        Value::Object(map) => match map.get("accepts") {
            Some(Value::Array(options)) => options.clone(),
            Some(option @ Value::Object(_)) => vec![option.clone()],
            _ => vec![terms.clone()],
        },
        Value::Array(options) => options.clone(),
        _ => Vec::new(),
    }
}

fn string_field<'a>(option: &'a Value, names: &[&str]) -> Option<&'a str> {
    names.iter().find_map(|name| option.get(*name).and_then(Value::as_str))
}

fn amount_field(option: &Value) -> Option<f64> {
    ["amount", "maxAmountRequired", "price"]
        .iter()
        .find_map(|name| option.get(*name))
        .and_then(|value| match value {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().trim_start_matches('$').parse().ok(),
            _ => None,
        })
}

pub fn is_valid_payout_address(address: &str) -> bool {
    EVM_ADDRESS.is_match(address) || BASE58_ADDRESS.is_match(address)
}

pub fn is_known_network(network: &str) -> bool {
    let network = network.to_ascii_lowercase();
    KNOWN_NETWORKS.contains(&network.as_str()) || network.starts_with("solana:")
}

fn same_address(a: &str, b: &str) -> bool {
    if a.starts_with("0x") && b.starts_with("0x") {
        a.eq_ignore_ascii_case(b)
    } else {
        a == b
    }
}

/// Stage 3: every payment option must be well formed
pub fn validate_terms(terms: &Value, resource: &DeployedResource, expected_asset: Option<&str>) -> StageResult {
    let started = Instant::now();
    let options = payment_options(terms);
    if options.is_empty() {
        return StageResult::fail(
            Stage::PaymentTerms,
            started,
            json!({ "options": 0 }),
            "Payment terms contain no payment options",
        );
    }

    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    for (index, option) in options.iter().enumerate() {
        match string_field(option, &["payTo", "payee", "recipient", "address"]) {
            Some(pay_to) if is_valid_payout_address(pay_to) => {
                if !same_address(pay_to, &resource.config.creator_wallet) {
                    warnings.push(format!(
                        "option {}: payout address {} differs from creator wallet",
                        index, pay_to
                    ));
                }
            }
            Some(pay_to) => errors.push(format!("option {}: invalid payout address {}", index, pay_to)),
            None => errors.push(format!("option {}: missing payout address", index)),
        }

        match amount_field(option) {
            Some(amount) if amount.is_finite() && amount > 0.0 => {}
            Some(amount) => errors.push(format!("option {}: amount must be positive, got {}", index, amount)),
            None => errors.push(format!("option {}: missing amount", index)),
        }

        match string_field(option, &["network"]) {
            Some(network) if is_known_network(network) => {}
            Some(network) => errors.push(format!("option {}: unrecognized network {}", index, network)),
            None => errors.push(format!("option {}: missing network", index)),
        }

        if let Some(expected) = expected_asset {
            match string_field(option, &["asset"]) {
                Some(asset) if asset.eq_ignore_ascii_case(expected) => {}
                Some(asset) => errors.push(format!(
                    "option {}: asset {} does not match expected {}",
                    index, asset, expected
                )),
                None => errors.push(format!("option {}: missing asset", index)),
            }
        }
    }

    let details = json!({ "options": options.len(), "errors": errors });
    let mut result = if errors.is_empty() {
        StageResult::pass(Stage::PaymentTerms, started, details)
    } else {
        let summary = errors.join("; ");
        StageResult::fail(Stage::PaymentTerms, started, details, summary)
    };
    result.warnings = warnings;
    result
}
